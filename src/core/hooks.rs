//! Hook traits for the collaborators the reconciler drives
//!
//! The controller only ever talks to the panel, the live data plane, the
//! limiter registry and the certificate renewer through these seams, so each
//! can be backed by an in-process registry, an external store or a test double.

use async_trait::async_trait;
use std::path::PathBuf;

use super::model::{
    NodeDescriptor, NodeId, OnlineIp, RelayNodeDescriptor, SubscriberId, SubscriberRecord, Usage,
};
use super::tag::Tag;
use super::topology::{Credential, InboundSpec, OutboundSpec, RouteSpec};
use crate::error::Result;

/// Outcome of a conditional fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<T> {
    Changed(T),
    /// The remote resource is unchanged since the last successful fetch
    NotModified,
}

impl<T> Fetched<T> {
    pub fn changed(self) -> Option<T> {
        match self {
            Fetched::Changed(value) => Some(value),
            Fetched::NotModified => None,
        }
    }
}

/// Identity of the panel connection, used for the log prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub api_host: String,
    pub node_id: NodeId,
}

/// Remote control-plane client
#[async_trait]
pub trait PanelApi: Send + Sync {
    fn describe(&self) -> ClientInfo;

    async fn fetch_node(&self) -> Result<Fetched<NodeDescriptor>>;

    async fn fetch_relay_node(&self) -> Result<RelayNodeDescriptor>;

    async fn fetch_subscribers(&self) -> Result<Fetched<Vec<SubscriberRecord>>>;

    async fn report_usage(&self, usage: &[Usage]) -> Result<()>;

    async fn report_online(&self, online: &[OnlineIp]) -> Result<()>;
}

/// Cumulative traffic of one credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub upload: u64,
    pub download: u64,
}

impl TrafficCounters {
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

/// Live data plane: listeners, outbounds, routing rules and credentials by tag
///
/// Adding an object whose tag is already present and removing one that is
/// absent are both no-ops, so every call is safe to retry.
#[async_trait]
pub trait DataPlane: Send + Sync {
    async fn add_inbound(&self, spec: &InboundSpec) -> Result<()>;
    async fn remove_inbound(&self, tag: &Tag) -> Result<()>;

    async fn add_outbound(&self, spec: &OutboundSpec) -> Result<()>;
    async fn remove_outbound(&self, tag: &Tag) -> Result<()>;

    async fn add_route(&self, spec: &RouteSpec) -> Result<()>;
    async fn remove_route(&self, rule_tag: &Tag) -> Result<()>;

    /// Install credentials on the listener `tag`; fails when it does not exist
    async fn add_credentials(&self, tag: &Tag, credentials: &[Credential]) -> Result<()>;
    async fn remove_credentials(&self, tag: &Tag, keys: &[String]) -> Result<()>;
    /// Replace the account behind an existing key in place
    async fn modify_credential(&self, tag: &Tag, credential: &Credential) -> Result<()>;

    /// Traffic recorded for a credential key; unknown keys read as zero
    async fn traffic(&self, key: &str) -> TrafficCounters;
    /// Subtract acknowledged amounts from a credential's counters
    async fn reset_traffic(&self, key: &str, acknowledged: TrafficCounters) -> Result<()>;
    /// Drop the counters of a credential that no longer exists.
    ///
    /// Returns false, keeping them, while they still hold unreported traffic.
    async fn forget_traffic(&self, key: &str) -> Result<bool>;
}

/// Per-tag rate limiter and online-endpoint registry
#[async_trait]
pub trait LimiterRegistry: Send + Sync {
    /// Install a limiter seeded with the node limit and the full subscriber set
    async fn add_limiter(
        &self,
        tag: &Tag,
        node_speed_limit: u64,
        subscribers: &[SubscriberRecord],
    ) -> Result<()>;

    /// Insert or replace per-subscriber limits
    async fn update_limiter(&self, tag: &Tag, subscribers: &[SubscriberRecord]) -> Result<()>;

    async fn remove_limiter(&self, tag: &Tag) -> Result<()>;

    /// Connected endpoints per subscriber under `tag`
    async fn online_endpoints(&self, tag: &Tag) -> Result<Vec<OnlineIp>>;
}

/// Result of a renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewedCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Whether the certificate on disk changed
    pub renewed: bool,
}

/// Certificate collaborator
#[async_trait]
pub trait CertRenewer: Send + Sync {
    /// `challenge` is "http" or "dns"
    async fn renew_cert(&self, challenge: &str, domain: &str) -> Result<RenewedCert>;
}

/// Capability to request a full restart of the node agent
pub trait Restart: Send + Sync {
    fn restart(&self);
}

/// Authenticator used by an embedded proxy engine
///
/// Synchronous: authentication is a hash-table lookup, not an I/O operation.
pub trait Authenticator: Send + Sync {
    /// Authenticate a trojan client by password hash on the listener `tag`
    fn authenticate(&self, tag: &Tag, password: &[u8; 56]) -> Option<(SubscriberId, String)>;
}

/// Traffic sink used by an embedded proxy engine
pub trait TrafficRecorder: Send + Sync {
    /// Record upload bytes (client -> remote)
    fn record_upload(&self, key: &str, bytes: u64);
    /// Record download bytes (remote -> client)
    fn record_download(&self, key: &str, bytes: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetched_changed() {
        assert_eq!(Fetched::Changed(3).changed(), Some(3));
        assert_eq!(Fetched::<u32>::NotModified.changed(), None);
    }

    #[test]
    fn test_traffic_counters_zero() {
        assert!(TrafficCounters::default().is_zero());
        assert!(!TrafficCounters {
            upload: 1,
            download: 0
        }
        .is_zero());
    }
}
