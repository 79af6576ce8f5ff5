//! Deterministic keys joining desired state to live data-plane objects

use std::fmt;

use super::model::{NodeDescriptor, RelayNodeDescriptor, SubscriberId, SubscriberRecord};

/// Name of a live listener, outbound or routing rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// `{type}_{port}_{id}`
    pub fn for_node(node: &NodeDescriptor) -> Self {
        Self(format!("{}_{}_{}", node.protocol.kind(), node.port, node.id))
    }

    /// `Relay_{type}_{port}_{id}`
    pub fn for_relay(relay: &RelayNodeDescriptor) -> Self {
        Self(format!(
            "Relay_{}_{}_{}",
            relay.protocol.kind(),
            relay.port,
            relay.id
        ))
    }

    /// Rule sending everything from this inbound to its own outbound
    pub fn default_rule(&self) -> Tag {
        Self(format!("{}_default", self.0))
    }

    /// Shared by the blocking rule and its deny outbound
    pub fn blackhole(&self) -> Tag {
        Self(format!("{}_blackhole", self.0))
    }

    /// Per-subscriber relay outbound and rule under a relay tag
    pub fn relay_subscriber(&self, id: SubscriberId) -> Tag {
        Self(format!("{}_{}", self.0, id))
    }

    /// Composite credential key `tag|identifier|id`
    pub fn subscriber_key(&self, record: &SubscriberRecord) -> String {
        format!("{}|{}|{}", self.0, record.identifier, record.id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{BlockingRules, Protocol, Security, Transport};
    use std::time::Duration;

    fn node(protocol: Protocol, port: u16, id: u32) -> NodeDescriptor {
        NodeDescriptor {
            id,
            protocol,
            port,
            transport: Transport::Tcp,
            security: Security::None,
            speed_limit: 0,
            relay_node_id: None,
            blocking: BlockingRules::default(),
            update_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_node_tag_format() {
        let tag = Tag::for_node(&node(Protocol::Trojan, 443, 7));
        assert_eq!(tag.as_str(), "trojan_443_7");
        assert_eq!(tag.default_rule().as_str(), "trojan_443_7_default");
        assert_eq!(tag.blackhole().as_str(), "trojan_443_7_blackhole");
    }

    #[test]
    fn test_node_tag_is_deterministic() {
        let a = node(Protocol::Vmess, 8080, 3);
        assert_eq!(Tag::for_node(&a), Tag::for_node(&a.clone()));
    }

    #[test]
    fn test_node_tag_changes_with_each_component() {
        let base = Tag::for_node(&node(Protocol::Vmess, 8080, 3));
        assert_ne!(base, Tag::for_node(&node(Protocol::Trojan, 8080, 3)));
        assert_ne!(base, Tag::for_node(&node(Protocol::Vmess, 8081, 3)));
        assert_ne!(base, Tag::for_node(&node(Protocol::Vmess, 8080, 4)));
    }

    #[test]
    fn test_node_tag_ignores_non_identity_fields() {
        let a = node(Protocol::Trojan, 443, 1);
        let mut b = a.clone();
        b.speed_limit = 1000;
        b.blocking.domains.push("example.com".into());
        assert_eq!(Tag::for_node(&a), Tag::for_node(&b));
    }

    #[test]
    fn test_relay_tags() {
        let relay = RelayNodeDescriptor {
            id: 9,
            protocol: Protocol::Shadowsocks {
                cipher: "2022-blake3-aes-128-gcm".into(),
                server_key: "k".into(),
            },
            address: "relay.example.com".into(),
            port: 8388,
            transport: Transport::Tcp,
            security: Security::None,
        };
        let tag = Tag::for_relay(&relay);
        assert_eq!(tag.as_str(), "Relay_shadowsocks_8388_9");
        assert_eq!(tag.relay_subscriber(42).as_str(), "Relay_shadowsocks_8388_9_42");
    }

    #[test]
    fn test_subscriber_key() {
        let tag = Tag::new("vless_443_1");
        let record = SubscriberRecord {
            id: 5,
            identifier: "user@example.com".into(),
            secret: "uuid".into(),
            ip_limit: 0,
            speed_limit: 0,
        };
        assert_eq!(tag.subscriber_key(&record), "vless_443_1|user@example.com|5");
    }
}
