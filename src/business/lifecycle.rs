//! Node lifecycle: stands up and tears down whole node identities
//!
//! Per tag a node is absent, active, or active with a relay sub-topology.
//! Standing up applies listener, outbound, rules and limiter; tearing down
//! removes them again. Identity changes are always a full teardown of the old
//! tag followed by a fresh stand-up under the new one.

use std::sync::Arc;

use crate::config::NodeOptions;
use crate::core::hooks::{DataPlane, LimiterRegistry};
use crate::core::model::{NodeDescriptor, RelayNodeDescriptor, SubscriberRecord};
use crate::core::tag::Tag;
use crate::core::topology::{build_node_topology, build_relay_topology, NodeTopology};
use crate::error::{NodeError, Result};
use crate::logger::log;

/// A live relay sub-topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayState {
    pub relay: RelayNodeDescriptor,
    pub relay_tag: Tag,
    /// Per-subscriber outbound/rule tags actually applied
    pub pair_tags: Vec<Tag>,
}

/// Applies and removes node topologies on the live data plane
pub struct NodeLifecycle {
    data_plane: Arc<dyn DataPlane>,
    limiter: Arc<dyn LimiterRegistry>,
    options: NodeOptions,
}

impl NodeLifecycle {
    pub fn new(
        data_plane: Arc<dyn DataPlane>,
        limiter: Arc<dyn LimiterRegistry>,
        options: NodeOptions,
    ) -> Self {
        Self {
            data_plane,
            limiter,
            options,
        }
    }

    /// Build the topology of `node` under `tag` without touching anything live
    pub fn build(&self, node: &NodeDescriptor, tag: &Tag) -> Result<NodeTopology> {
        build_node_topology(node, tag, &self.options)
    }

    /// absent -> active, minus credentials and limiter.
    ///
    /// Blocking rules go first so they predate any traffic, and each outbound
    /// precedes the listener and rule that reach it.
    pub async fn apply(&self, topology: &NodeTopology) -> Result<()> {
        if let Some((outbound, route)) = &topology.blocking {
            self.data_plane.add_outbound(outbound).await?;
            self.data_plane.add_route(route).await?;
        }
        self.data_plane.add_outbound(&topology.outbound).await?;
        self.data_plane.add_inbound(&topology.inbound).await?;
        if let Some(route) = &topology.default_route {
            self.data_plane.add_route(route).await?;
        }
        log::info!(
            tag = %topology.tag,
            port = topology.inbound.port,
            blocking = topology.blocking.is_some(),
            relay_head = topology.default_route.is_none(),
            "Node topology applied"
        );
        Ok(())
    }

    /// active -> absent.
    ///
    /// Every removal is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub async fn deactivate(&self, tag: &Tag) -> Result<()> {
        let blackhole = tag.blackhole();
        let results = [
            self.data_plane.remove_route(&tag.default_rule()).await,
            self.data_plane.remove_route(&blackhole).await,
            self.data_plane.remove_outbound(&blackhole).await,
            self.data_plane.remove_inbound(tag).await,
            self.data_plane.remove_outbound(tag).await,
            self.limiter.remove_limiter(tag).await,
        ];

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                log::warn!(tag = %tag, error = %e, "Teardown step failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!(tag = %tag, "Node topology removed");
                Ok(())
            }
        }
    }

    /// Install the per-tag limiter seeded with the full subscriber snapshot
    pub async fn install_limiter(
        &self,
        tag: &Tag,
        speed_limit: u64,
        subscribers: &[SubscriberRecord],
    ) -> Result<()> {
        self.limiter
            .add_limiter(tag, speed_limit, subscribers)
            .await
    }

    /// Push per-subscriber limit changes without touching credentials
    pub async fn update_limiter(&self, tag: &Tag, subscribers: &[SubscriberRecord]) -> Result<()> {
        if subscribers.is_empty() {
            return Ok(());
        }
        self.limiter.update_limiter(tag, subscribers).await?;
        log::debug!(tag = %tag, count = subscribers.len(), "Limiter updated");
        Ok(())
    }

    /// active -> active+relay.
    ///
    /// Subscribers whose relay key cannot be derived are skipped. If applying
    /// fails midway, the pairs already applied are removed again before the
    /// error is returned.
    pub async fn apply_relay(
        &self,
        relay: &RelayNodeDescriptor,
        main_tag: &Tag,
        subscribers: &[SubscriberRecord],
    ) -> Result<RelayState> {
        let relay_tag = Tag::for_relay(relay);
        let topology = build_relay_topology(relay, &relay_tag, main_tag, subscribers)?;
        for (id, error) in &topology.skipped {
            log::warn!(relay = %relay_tag, id = id, error = %error, "Relay subscriber skipped");
        }

        let mut state = RelayState {
            relay: relay.clone(),
            relay_tag,
            pair_tags: Vec::with_capacity(topology.pairs.len()),
        };
        for (outbound, route) in &topology.pairs {
            let applied = match self.data_plane.add_outbound(outbound).await {
                Ok(()) => self.data_plane.add_route(route).await,
                Err(e) => Err(e),
            };
            // Record before checking so a half-applied pair is cleaned up too
            state.pair_tags.push(outbound.tag.clone());
            if let Err(e) = applied {
                if let Err(cleanup) = self.remove_relay(&state).await {
                    log::warn!(relay = %state.relay_tag, error = %cleanup, "Relay cleanup failed");
                }
                return Err(e);
            }
        }

        log::info!(
            relay = %state.relay_tag,
            main = %main_tag,
            subscribers = state.pair_tags.len(),
            skipped = topology.skipped.len(),
            "Relay topology applied"
        );
        Ok(state)
    }

    /// active+relay -> active
    pub async fn remove_relay(&self, relay: &RelayState) -> Result<()> {
        let mut first_error: Option<NodeError> = None;
        for tag in &relay.pair_tags {
            for result in [
                self.data_plane.remove_route(tag).await,
                self.data_plane.remove_outbound(tag).await,
            ] {
                if let Err(e) = result {
                    log::warn!(relay = %relay.relay_tag, pair = %tag, error = %e, "Relay teardown step failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!(relay = %relay.relay_tag, "Relay topology removed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{BlockingRules, Protocol, Security, SubscriberId, Transport};
    use crate::dataplane::{MemoryDataPlane, MemoryLimiter};
    use std::time::Duration;

    fn node() -> NodeDescriptor {
        NodeDescriptor {
            id: 1,
            protocol: Protocol::Vmess,
            port: 10086,
            transport: Transport::Tcp,
            security: Security::None,
            speed_limit: 1_000_000,
            relay_node_id: None,
            blocking: BlockingRules {
                ports: "25".into(),
                ..Default::default()
            },
            update_interval: Duration::from_secs(60),
        }
    }

    fn relay() -> RelayNodeDescriptor {
        RelayNodeDescriptor {
            id: 9,
            protocol: Protocol::Trojan,
            address: "relay.example.com".into(),
            port: 443,
            transport: Transport::Tcp,
            security: Security::None,
        }
    }

    fn record(id: SubscriberId) -> SubscriberRecord {
        SubscriberRecord {
            id,
            identifier: format!("user{}", id),
            secret: format!("secret-{}", id),
            ip_limit: 0,
            speed_limit: 0,
        }
    }

    fn lifecycle() -> (Arc<MemoryDataPlane>, Arc<MemoryLimiter>, NodeLifecycle) {
        let plane = Arc::new(MemoryDataPlane::new());
        let limiter = Arc::new(MemoryLimiter::new());
        let lifecycle = NodeLifecycle::new(plane.clone(), limiter.clone(), NodeOptions::default());
        (plane, limiter, lifecycle)
    }

    #[tokio::test]
    async fn test_apply_and_deactivate() {
        let (plane, limiter, lifecycle) = lifecycle();
        let node = node();
        let tag = Tag::for_node(&node);

        let topology = lifecycle.build(&node, &tag).unwrap();
        lifecycle.apply(&topology).await.unwrap();
        lifecycle
            .install_limiter(&tag, node.speed_limit, &[record(1)])
            .await
            .unwrap();

        assert!(plane.has_inbound(&tag));
        assert_eq!(
            plane.outbound_tags(),
            vec![Tag::new("vmess_10086_1"), Tag::new("vmess_10086_1_blackhole")]
        );
        assert_eq!(
            plane.route_tags(),
            vec![
                Tag::new("vmess_10086_1_blackhole"),
                Tag::new("vmess_10086_1_default")
            ]
        );
        assert!(limiter.has_limiter(&tag));

        lifecycle.deactivate(&tag).await.unwrap();
        assert!(plane.inbound_tags().is_empty());
        assert!(plane.outbound_tags().is_empty());
        assert!(plane.route_tags().is_empty());
        assert!(!limiter.has_limiter(&tag));

        // Tearing down an absent tag is a no-op
        assert!(lifecycle.deactivate(&tag).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_apply_and_remove() {
        let (plane, _limiter, lifecycle) = lifecycle();
        let main_tag = Tag::new("vmess_10086_1");

        let state = lifecycle
            .apply_relay(&relay(), &main_tag, &[record(1), record(2)])
            .await
            .unwrap();
        assert_eq!(state.relay_tag.as_str(), "Relay_trojan_443_9");
        assert_eq!(
            state.pair_tags,
            vec![
                Tag::new("Relay_trojan_443_9_1"),
                Tag::new("Relay_trojan_443_9_2")
            ]
        );
        assert_eq!(plane.route_tags().len(), 2);
        assert_eq!(plane.outbound_tags().len(), 2);

        lifecycle.remove_relay(&state).await.unwrap();
        assert!(plane.route_tags().is_empty());
        assert!(plane.outbound_tags().is_empty());
    }

    #[tokio::test]
    async fn test_relay_skips_underivable_keys() {
        let (plane, _limiter, lifecycle) = lifecycle();
        let relay = RelayNodeDescriptor {
            protocol: Protocol::Shadowsocks {
                cipher: "2022-blake3-aes-128-gcm".into(),
                server_key: "server".into(),
            },
            ..relay()
        };
        let mut good = record(1);
        good.secret = "0123456789abcdefghij".into();
        let bad = record(2);

        let state = lifecycle
            .apply_relay(&relay, &Tag::new("vmess_10086_1"), &[good, bad])
            .await
            .unwrap();
        assert_eq!(state.pair_tags.len(), 1);
        assert_eq!(plane.route_tags().len(), 1);
    }
}
