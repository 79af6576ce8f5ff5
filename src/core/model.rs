//! Node and subscriber descriptors as delivered by the panel
//!
//! Descriptors are replaced wholesale on change and compared by deep equality,
//! never patched field by field.

use std::time::Duration;

/// Panel-side node identifier
pub type NodeId = u32;

/// Stable subscriber identifier.
/// Using i64 for consistency with the panel API layer.
pub type SubscriberId = i64;

/// Poll interval used when the panel does not send one
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Longest poll interval honored; larger panel values are clamped
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default WebSocket path (Xray compatible)
pub const DEFAULT_WS_PATH: &str = "/";

/// Default gRPC service name (Xray compatible)
pub const DEFAULT_GRPC_SERVICE_NAME: &str = "GunService";

/// Protocol kind served by a node, carrying what its builders need
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Vless { flow: Option<String> },
    Vmess,
    Trojan,
    Shadowsocks { cipher: String, server_key: String },
    /// Plugin-only shadowsocks; the panel can announce it but it has no listener form
    ShadowsocksPlugin,
}

impl Protocol {
    /// Panel name of the protocol kind, also the first component of node tags
    pub fn kind(&self) -> &'static str {
        match self {
            Protocol::Vless { .. } => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks { .. } => "shadowsocks",
            Protocol::ShadowsocksPlugin => "Shadowsocks-Plugin",
        }
    }
}

/// Stream transport of a listener or relay hop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws {
        path: String,
        host: Option<String>,
    },
    Grpc {
        service_name: String,
    },
}

/// How the TLS certificate of a node is provisioned
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CertMode {
    /// Certificate already present under the certificate directory
    #[default]
    None,
    /// Explicit certificate and key files
    File { cert_file: String, key_file: String },
    /// ACME HTTP-01
    Http,
    /// ACME DNS-01
    Dns,
}

impl CertMode {
    /// ACME challenge type, when the certificate is issued automatically
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            CertMode::Http => Some("http"),
            CertMode::Dns => Some("dns"),
            CertMode::None | CertMode::File { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsSettings {
    pub server_name: String,
    pub cert_mode: CertMode,
    pub cert_domain: String,
    pub alpn: Vec<String>,
    pub reject_unknown_sni: bool,
    pub allow_insecure: bool,
}

impl TlsSettings {
    /// Domain the certificate is issued for, falling back to the server name
    pub fn domain(&self) -> &str {
        if self.cert_domain.is_empty() {
            &self.server_name
        } else {
            &self.cert_domain
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RealitySettings {
    pub dest: String,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub public_key: String,
    pub short_ids: Vec<String>,
}

/// Security layer wrapping the transport
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls(TlsSettings),
    Reality(RealitySettings),
}

/// Destinations the node must refuse
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockingRules {
    /// Comma separated ports and `a-b` ranges; empty or "0" means none
    pub ports: String,
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    pub protocols: Vec<String>,
}

impl BlockingRules {
    pub fn has_ports(&self) -> bool {
        let ports = self.ports.trim();
        !ports.is_empty() && ports != "0"
    }

    /// True when no blocking route needs to exist
    pub fn is_empty(&self) -> bool {
        !self.has_ports()
            && self.domains.is_empty()
            && self.ips.is_empty()
            && self.protocols.is_empty()
    }
}

/// Everything the panel says about one node identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub protocol: Protocol,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    /// Node-wide speed limit in bytes per second, 0 = unlimited
    pub speed_limit: u64,
    /// Downstream hop; set only when the node is a relay head
    pub relay_node_id: Option<NodeId>,
    pub blocking: BlockingRules,
    pub update_interval: Duration,
}

impl NodeDescriptor {
    pub fn is_relay_head(&self) -> bool {
        self.relay_node_id.is_some()
    }

    /// Poll interval, falling back to the default when the panel sent zero
    pub fn poll_interval(&self) -> Duration {
        if self.update_interval.is_zero() {
            DEFAULT_UPDATE_INTERVAL
        } else {
            self.update_interval.min(MAX_UPDATE_INTERVAL)
        }
    }

    /// TLS settings when the node terminates TLS itself
    pub fn tls(&self) -> Option<&TlsSettings> {
        match &self.security {
            Security::Tls(tls) => Some(tls),
            _ => None,
        }
    }
}

/// The downstream hop egress traffic is relayed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNodeDescriptor {
    pub id: NodeId,
    pub protocol: Protocol,
    /// Server address of the hop
    pub address: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
}

/// One end-user credential set permitted on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberRecord {
    pub id: SubscriberId,
    /// Human identifier (e-mail on the panel side)
    pub identifier: String,
    /// UUID or password, depending on the protocol
    pub secret: String,
    /// Distinct concurrent IPs allowed, 0 = unlimited
    pub ip_limit: u32,
    /// Bytes per second, 0 = unlimited
    pub speed_limit: u64,
}

/// Traffic accrued by one subscriber since the last acknowledged report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub id: SubscriberId,
    pub upload: u64,
    pub download: u64,
}

/// One connected endpoint of a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OnlineIp {
    pub id: SubscriberId,
    pub ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_names() {
        assert_eq!(Protocol::Vless { flow: None }.kind(), "vless");
        assert_eq!(Protocol::Vmess.kind(), "vmess");
        assert_eq!(Protocol::Trojan.kind(), "trojan");
        assert_eq!(
            Protocol::Shadowsocks {
                cipher: "aes-128-gcm".into(),
                server_key: String::new()
            }
            .kind(),
            "shadowsocks"
        );
        assert_eq!(Protocol::ShadowsocksPlugin.kind(), "Shadowsocks-Plugin");
    }

    #[test]
    fn test_blocking_rules_empty() {
        let mut rules = BlockingRules::default();
        assert!(rules.is_empty());

        rules.ports = "0".to_string();
        assert!(rules.is_empty());

        rules.ports = "53".to_string();
        assert!(!rules.is_empty());

        let rules = BlockingRules {
            protocols: vec!["bittorrent".into()],
            ..Default::default()
        };
        assert!(!rules.is_empty());
    }

    #[test]
    fn test_cert_mode_challenge() {
        assert_eq!(CertMode::Http.challenge(), Some("http"));
        assert_eq!(CertMode::Dns.challenge(), Some("dns"));
        assert_eq!(CertMode::None.challenge(), None);
        assert_eq!(
            CertMode::File {
                cert_file: "a".into(),
                key_file: "b".into()
            }
            .challenge(),
            None
        );
    }

    #[test]
    fn test_poll_interval_default() {
        let node = NodeDescriptor {
            id: 1,
            protocol: Protocol::Trojan,
            port: 443,
            transport: Transport::Tcp,
            security: Security::None,
            speed_limit: 0,
            relay_node_id: None,
            blocking: BlockingRules::default(),
            update_interval: Duration::ZERO,
        };
        assert_eq!(node.poll_interval(), DEFAULT_UPDATE_INTERVAL);

        let node = NodeDescriptor {
            update_interval: Duration::from_secs(30),
            ..node
        };
        assert_eq!(node.poll_interval(), Duration::from_secs(30));
        assert!(!node.is_relay_head());

        let node = NodeDescriptor {
            update_interval: Duration::from_secs(u64::MAX),
            ..node
        };
        assert_eq!(node.poll_interval(), MAX_UPDATE_INTERVAL);
    }
}
