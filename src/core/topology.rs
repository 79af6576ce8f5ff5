//! Node topology builder
//!
//! Pure translation of descriptors and subscriber snapshots into declarative
//! listener, outbound, routing-rule and credential specs. Nothing here touches
//! the live data plane; the lifecycle manager applies what is built.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::model::{
    CertMode, NodeDescriptor, Protocol, RealitySettings, RelayNodeDescriptor, Security, SubscriberId,
    SubscriberRecord, Transport,
};
use super::tag::Tag;
use crate::config::{Fallback, NodeOptions};
use crate::error::{NodeError, Result};

const SS2022_AES_128: &str = "2022-blake3-aes-128-gcm";
const SS2022_AES_256: &str = "2022-blake3-aes-256-gcm";
const SS2022_CHACHA20: &str = "2022-blake3-chacha20-poly1305";

/// Minimum secret length accepted for any 2022 cipher
const SS2022_MIN_SECRET: usize = 16;

/// Inclusive destination port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }
}

/// Protocol-specific credential shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    Vless { id: String, flow: Option<String> },
    Vmess { id: String },
    Trojan { password: String },
    Shadowsocks { method: String, password: String },
}

/// One subscriber credential installed on a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Composite key `tag|identifier|id`
    pub key: String,
    pub subscriber_id: SubscriberId,
    pub account: Account,
}

/// Security layer of a listener, with certificate paths resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecuritySpec {
    None,
    Tls {
        server_name: String,
        cert_file: PathBuf,
        key_file: PathBuf,
        alpn: Vec<String>,
        reject_unknown_sni: bool,
    },
    Reality(RealitySettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSpec {
    pub tag: Tag,
    pub listen: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub transport: Transport,
    pub security: SecuritySpec,
    pub fallbacks: Vec<Fallback>,
    pub sniffing: bool,
}

/// Downstream hop a relay outbound dials, with one subscriber's account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
    pub security: Security,
    pub account: Account,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundKind {
    /// Direct egress
    Freedom { domain_strategy: String },
    /// Deny
    Blackhole,
    Relay(RelayTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSpec {
    pub tag: Tag,
    pub kind: OutboundKind,
    pub send_through: Option<IpAddr>,
}

/// Resolution class of a routing rule; blocking wins over relay over default
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouteKind {
    Blocking,
    Relay,
    Default,
}

/// Routing rule. Every non-empty matcher list must match for the rule to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub rule_tag: Tag,
    pub kind: RouteKind,
    pub inbound_tag: Tag,
    pub outbound_tag: Tag,
    /// Credential keys the rule is limited to
    pub users: Vec<String>,
    pub ports: Vec<PortRange>,
    pub domains: Vec<String>,
    pub ips: Vec<String>,
    pub protocols: Vec<String>,
}

impl RouteSpec {
    fn catch_all(rule_tag: Tag, kind: RouteKind, inbound_tag: Tag, outbound_tag: Tag) -> Self {
        Self {
            rule_tag,
            kind,
            inbound_tag,
            outbound_tag,
            users: Vec::new(),
            ports: Vec::new(),
            domains: Vec::new(),
            ips: Vec::new(),
            protocols: Vec::new(),
        }
    }
}

/// Everything a node identity needs live, apart from credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    pub tag: Tag,
    pub inbound: InboundSpec,
    pub outbound: OutboundSpec,
    /// Absent for relay heads
    pub default_route: Option<RouteSpec>,
    /// Deny outbound plus its rule, when the node blocks anything
    pub blocking: Option<(OutboundSpec, RouteSpec)>,
}

/// Per-subscriber relay outbounds and rules under one relay tag
#[derive(Debug, Default)]
pub struct RelayTopology {
    pub pairs: Vec<(OutboundSpec, RouteSpec)>,
    /// Subscribers left out because their relay key could not be derived
    pub skipped: Vec<(SubscriberId, NodeError)>,
}

/// Credentials for a subscriber batch plus the records that could not be converted
#[derive(Debug, Default)]
pub struct CredentialBatch {
    pub credentials: Vec<Credential>,
    pub skipped: Vec<(SubscriberId, NodeError)>,
}

/// Build the primary topology of a node under `tag`.
pub fn build_node_topology(
    node: &NodeDescriptor,
    tag: &Tag,
    options: &NodeOptions,
) -> Result<NodeTopology> {
    let inbound = build_inbound(node, tag, options)?;
    let outbound = OutboundSpec {
        tag: tag.clone(),
        kind: OutboundKind::Freedom {
            domain_strategy: options.dns_strategy.clone(),
        },
        send_through: options.send_through,
    };
    let default_route = (!node.is_relay_head()).then(|| {
        RouteSpec::catch_all(tag.default_rule(), RouteKind::Default, tag.clone(), tag.clone())
    });
    let blocking = build_blocking(node, tag, options)?;

    Ok(NodeTopology {
        tag: tag.clone(),
        inbound,
        outbound,
        default_route,
        blocking,
    })
}

fn build_inbound(node: &NodeDescriptor, tag: &Tag, options: &NodeOptions) -> Result<InboundSpec> {
    if matches!(node.protocol, Protocol::ShadowsocksPlugin) {
        return Err(NodeError::Unsupported(format!(
            "{} has no listener form, node {}",
            node.protocol.kind(),
            node.id
        )));
    }

    let security = match &node.security {
        Security::None => SecuritySpec::None,
        Security::Reality(reality) => SecuritySpec::Reality(reality.clone()),
        Security::Tls(tls) => {
            let (cert_file, key_file) = match &tls.cert_mode {
                CertMode::File {
                    cert_file,
                    key_file,
                } => (PathBuf::from(cert_file), PathBuf::from(key_file)),
                _ => {
                    let domain = tls.domain();
                    if domain.is_empty() {
                        return Err(NodeError::Build(format!(
                            "TLS node {} has neither a certificate domain nor a server name",
                            node.id
                        )));
                    }
                    options.certificate_paths(domain)
                }
            };
            SecuritySpec::Tls {
                server_name: tls.server_name.clone(),
                cert_file,
                key_file,
                alpn: tls.alpn.clone(),
                reject_unknown_sni: tls.reject_unknown_sni,
            }
        }
    };

    // Fallbacks only make sense on raw TCP vless/trojan listeners
    let fallbacks = match (&node.protocol, &node.transport) {
        (Protocol::Vless { .. } | Protocol::Trojan, Transport::Tcp) => options.fallbacks.clone(),
        _ => Vec::new(),
    };

    Ok(InboundSpec {
        tag: tag.clone(),
        listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: node.port,
        protocol: node.protocol.clone(),
        transport: node.transport.clone(),
        security,
        fallbacks,
        sniffing: true,
    })
}

fn build_blocking(
    node: &NodeDescriptor,
    tag: &Tag,
    options: &NodeOptions,
) -> Result<Option<(OutboundSpec, RouteSpec)>> {
    let rules = &node.blocking;
    if rules.is_empty() {
        return Ok(None);
    }

    let ports = if rules.has_ports() {
        parse_port_string(&rules.ports)?
    } else {
        Vec::new()
    };

    let blackhole = tag.blackhole();
    let outbound = OutboundSpec {
        tag: blackhole.clone(),
        kind: OutboundKind::Blackhole,
        send_through: options.send_through,
    };
    let route = RouteSpec {
        ports,
        domains: rules.domains.clone(),
        ips: rules.ips.clone(),
        protocols: rules.protocols.clone(),
        ..RouteSpec::catch_all(blackhole.clone(), RouteKind::Blocking, tag.clone(), blackhole)
    };
    Ok(Some((outbound, route)))
}

/// Build one relay outbound and rule per subscriber.
///
/// `main_tag` is the node whose subscribers are routed through the relay. A
/// subscriber whose key cannot be derived is skipped, never fatal to the rest;
/// an unsupported relay protocol is.
pub fn build_relay_topology(
    relay: &RelayNodeDescriptor,
    relay_tag: &Tag,
    main_tag: &Tag,
    subscribers: &[SubscriberRecord],
) -> Result<RelayTopology> {
    if matches!(relay.protocol, Protocol::ShadowsocksPlugin) {
        return Err(NodeError::Unsupported(format!(
            "{} cannot be used as a relay hop, relay node {}",
            relay.protocol.kind(),
            relay.id
        )));
    }

    let mut topology = RelayTopology::default();
    for record in subscribers {
        let account = match relay_account(&relay.protocol, &record.secret) {
            Ok(account) => account,
            Err(e) => {
                topology.skipped.push((record.id, e));
                continue;
            }
        };

        let pair_tag = relay_tag.relay_subscriber(record.id);
        let outbound = OutboundSpec {
            tag: pair_tag.clone(),
            kind: OutboundKind::Relay(RelayTarget {
                address: relay.address.clone(),
                port: relay.port,
                transport: relay.transport.clone(),
                security: relay.security.clone(),
                account,
            }),
            send_through: None,
        };
        let route = RouteSpec {
            users: vec![main_tag.subscriber_key(record)],
            ..RouteSpec::catch_all(pair_tag.clone(), RouteKind::Relay, main_tag.clone(), pair_tag)
        };
        topology.pairs.push((outbound, route));
    }
    Ok(topology)
}

/// Convert subscribers into credentials for the listener of `node` under `tag`.
///
/// An unsupported protocol fails the whole batch; a per-subscriber key
/// derivation failure only skips that subscriber.
pub fn build_credentials(
    protocol: &Protocol,
    tag: &Tag,
    records: &[SubscriberRecord],
) -> Result<CredentialBatch> {
    let mut batch = CredentialBatch::default();
    for record in records {
        match inbound_account(protocol, &record.secret) {
            Ok(account) => batch.credentials.push(Credential {
                key: tag.subscriber_key(record),
                subscriber_id: record.id,
                account,
            }),
            Err(e @ NodeError::KeyDerivation(_)) => batch.skipped.push((record.id, e)),
            Err(e) => return Err(e),
        }
    }
    Ok(batch)
}

fn inbound_account(protocol: &Protocol, secret: &str) -> Result<Account> {
    match protocol {
        Protocol::Vless { flow } => Ok(Account::Vless {
            id: secret.to_string(),
            flow: flow.clone(),
        }),
        Protocol::Vmess => Ok(Account::Vmess {
            id: secret.to_string(),
        }),
        Protocol::Trojan => Ok(Account::Trojan {
            password: secret.to_string(),
        }),
        Protocol::Shadowsocks { cipher, .. } => Ok(Account::Shadowsocks {
            method: cipher.clone(),
            password: shadowsocks_user_key(cipher, secret)?,
        }),
        Protocol::ShadowsocksPlugin => Err(NodeError::Unsupported(format!(
            "{} has no subscriber credentials",
            protocol.kind()
        ))),
    }
}

fn relay_account(protocol: &Protocol, secret: &str) -> Result<Account> {
    match protocol {
        Protocol::Shadowsocks { cipher, server_key } => Ok(Account::Shadowsocks {
            method: cipher.clone(),
            password: relay_key(cipher, server_key, secret)?,
        }),
        other => inbound_account(other, secret),
    }
}

fn is_ss2022(cipher: &str) -> bool {
    cipher.contains("2022")
}

/// Per-user key of a shadowsocks listener.
///
/// 2022 ciphers take the base64 of the secret truncated to the cipher's key
/// size; older ciphers use the secret verbatim.
pub fn shadowsocks_user_key(cipher: &str, secret: &str) -> Result<String> {
    if !is_ss2022(cipher) {
        return Ok(secret.to_string());
    }

    let bytes = secret.as_bytes();
    if bytes.len() < SS2022_MIN_SECRET {
        return Err(NodeError::KeyDerivation(format!(
            "{} needs a secret of at least {} bytes, got {}",
            cipher,
            SS2022_MIN_SECRET,
            bytes.len()
        )));
    }

    let required = match cipher {
        SS2022_AES_128 => 16,
        SS2022_AES_256 | SS2022_CHACHA20 => 32,
        other => {
            return Err(NodeError::KeyDerivation(format!(
                "unsupported 2022 cipher: {}",
                other
            )))
        }
    };
    if bytes.len() < required {
        return Err(NodeError::KeyDerivation(format!(
            "{} needs a secret of at least {} bytes, got {}",
            cipher,
            required,
            bytes.len()
        )));
    }
    Ok(STANDARD.encode(&bytes[..required]))
}

/// Key a relay outbound presents to a shadowsocks hop: `serverKey:userKey`
/// for 2022 ciphers, the secret itself otherwise.
pub fn relay_key(cipher: &str, server_key: &str, secret: &str) -> Result<String> {
    let user_key = shadowsocks_user_key(cipher, secret)?;
    if is_ss2022(cipher) {
        Ok(format!("{}:{}", server_key, user_key))
    } else {
        Ok(user_key)
    }
}

/// Parse a blocking port string: comma separated ports and `a-b` ranges.
/// Empty tokens are skipped, anything else malformed is an error.
pub fn parse_port_string(ports: &str) -> Result<Vec<PortRange>> {
    let mut ranges = Vec::new();
    for token in ports.split(',').map(str::trim) {
        if token.is_empty() {
            continue;
        }
        let range = match token.split_once('-') {
            Some((from, to)) => {
                let from = parse_port(from, token)?;
                let to = parse_port(to, token)?;
                if from > to {
                    return Err(NodeError::InvalidPort(format!(
                        "range start exceeds end: {}",
                        token
                    )));
                }
                PortRange { from, to }
            }
            None => PortRange::single(parse_port(token, token)?),
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_port(value: &str, token: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| NodeError::InvalidPort(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{BlockingRules, CertMode, TlsSettings};
    use std::path::Path;
    use std::time::Duration;

    fn node(protocol: Protocol) -> NodeDescriptor {
        NodeDescriptor {
            id: 1,
            protocol,
            port: 443,
            transport: Transport::Tcp,
            security: Security::None,
            speed_limit: 0,
            relay_node_id: None,
            blocking: BlockingRules::default(),
            update_interval: Duration::from_secs(60),
        }
    }

    fn record(id: SubscriberId, secret: &str) -> SubscriberRecord {
        SubscriberRecord {
            id,
            identifier: format!("user{}@example.com", id),
            secret: secret.to_string(),
            ip_limit: 0,
            speed_limit: 0,
        }
    }

    fn ss_relay(cipher: &str) -> RelayNodeDescriptor {
        RelayNodeDescriptor {
            id: 9,
            protocol: Protocol::Shadowsocks {
                cipher: cipher.to_string(),
                server_key: "serverKey".to_string(),
            },
            address: "relay.example.com".to_string(),
            port: 8388,
            transport: Transport::Tcp,
            security: Security::None,
        }
    }

    #[test]
    fn test_parse_port_string() {
        let ranges = parse_port_string("53,443,1000-2000").unwrap();
        assert_eq!(
            ranges,
            vec![
                PortRange { from: 53, to: 53 },
                PortRange { from: 443, to: 443 },
                PortRange { from: 1000, to: 2000 },
            ]
        );
    }

    #[test]
    fn test_parse_port_string_skips_empty_tokens() {
        let ranges = parse_port_string(" 80, ,443 ,").unwrap();
        assert_eq!(ranges, vec![PortRange::single(80), PortRange::single(443)]);
    }

    #[test]
    fn test_parse_port_string_rejects_malformed() {
        assert!(matches!(
            parse_port_string("abc"),
            Err(NodeError::InvalidPort(_))
        ));
        assert!(parse_port_string("80,x-90").is_err());
        assert!(parse_port_string("70000").is_err());
        assert!(parse_port_string("2000-1000").is_err());
        assert!(parse_port_string("1-2-3").is_err());
    }

    #[test]
    fn test_port_range_contains() {
        let range = PortRange { from: 1000, to: 2000 };
        assert!(range.contains(1000));
        assert!(range.contains(2000));
        assert!(!range.contains(999));
    }

    #[test]
    fn test_shadowsocks_user_key_2022() {
        let secret = "0123456789abcdefghij"; // 20 bytes
        let key = shadowsocks_user_key(SS2022_AES_128, secret).unwrap();
        assert_eq!(key, STANDARD.encode("0123456789abcdef"));

        let long = "0123456789abcdef0123456789abcdef-extra";
        let key = shadowsocks_user_key(SS2022_AES_256, long).unwrap();
        assert_eq!(key, STANDARD.encode(&long.as_bytes()[..32]));
    }

    #[test]
    fn test_shadowsocks_user_key_too_short() {
        assert!(matches!(
            shadowsocks_user_key(SS2022_AES_128, "short"),
            Err(NodeError::KeyDerivation(_))
        ));
        // 20 bytes is enough for aes-128 but not for the 32-byte variants
        assert!(shadowsocks_user_key(SS2022_CHACHA20, "0123456789abcdefghij").is_err());
        assert!(shadowsocks_user_key("2022-blake3-unknown", "0123456789abcdefghij").is_err());
    }

    #[test]
    fn test_shadowsocks_user_key_legacy_cipher_is_verbatim() {
        assert_eq!(shadowsocks_user_key("aes-128-gcm", "pw").unwrap(), "pw");
        assert_eq!(relay_key("aes-128-gcm", "serverKey", "pw").unwrap(), "pw");
    }

    #[test]
    fn test_relay_key_2022() {
        let key = relay_key(SS2022_AES_128, "serverKey", "0123456789abcdefghij").unwrap();
        assert_eq!(key, format!("serverKey:{}", STANDARD.encode("0123456789abcdef")));
    }

    #[test]
    fn test_build_node_topology_plain() {
        let node = node(Protocol::Trojan);
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap();

        assert_eq!(topology.inbound.tag, tag);
        assert_eq!(topology.inbound.port, 443);
        assert_eq!(topology.outbound.tag, tag);
        assert!(matches!(
            topology.outbound.kind,
            OutboundKind::Freedom { ref domain_strategy } if domain_strategy == "AsIs"
        ));
        let route = topology.default_route.unwrap();
        assert_eq!(route.rule_tag.as_str(), "trojan_443_1_default");
        assert_eq!(route.inbound_tag, tag);
        assert_eq!(route.outbound_tag, tag);
        assert!(topology.blocking.is_none());
    }

    #[test]
    fn test_build_node_topology_rejects_plugin() {
        let node = node(Protocol::ShadowsocksPlugin);
        let tag = Tag::for_node(&node);
        let err = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap_err();
        assert!(matches!(err, NodeError::Unsupported(_)));
        assert!(err.to_string().contains("Shadowsocks-Plugin"));
    }

    #[test]
    fn test_build_node_topology_relay_head_has_no_default_route() {
        let mut node = node(Protocol::Vmess);
        node.relay_node_id = Some(9);
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap();
        assert!(topology.default_route.is_none());
    }

    #[test]
    fn test_build_node_topology_blocking() {
        let mut node = node(Protocol::Vmess);
        node.blocking = BlockingRules {
            ports: "25,6881-6889".to_string(),
            domains: vec!["keyword:ads".to_string()],
            ips: vec![],
            protocols: vec!["bittorrent".to_string()],
        };
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap();

        let (outbound, route) = topology.blocking.unwrap();
        assert_eq!(outbound.tag.as_str(), "vmess_443_1_blackhole");
        assert_eq!(outbound.kind, OutboundKind::Blackhole);
        assert_eq!(route.rule_tag, outbound.tag);
        assert_eq!(route.outbound_tag, outbound.tag);
        assert_eq!(route.kind, RouteKind::Blocking);
        assert_eq!(route.ports.len(), 2);
        assert_eq!(route.protocols, vec!["bittorrent".to_string()]);
    }

    #[test]
    fn test_build_node_topology_port_zero_means_no_rule() {
        let mut node = node(Protocol::Vmess);
        node.blocking.ports = "0".to_string();
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap();
        assert!(topology.blocking.is_none());
    }

    #[test]
    fn test_build_node_topology_invalid_blocking_ports() {
        let mut node = node(Protocol::Vmess);
        node.blocking.ports = "abc".to_string();
        let tag = Tag::for_node(&node);
        let err = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap_err();
        assert!(err.is_build());
    }

    #[test]
    fn test_build_node_topology_tls_paths() {
        let mut node = node(Protocol::Trojan);
        node.security = Security::Tls(TlsSettings {
            server_name: "node.example.com".to_string(),
            cert_mode: CertMode::Http,
            ..Default::default()
        });
        let options = NodeOptions {
            cert_dir: PathBuf::from("/var/cert"),
            ..Default::default()
        };
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &options).unwrap();
        match topology.inbound.security {
            SecuritySpec::Tls {
                cert_file,
                key_file,
                ..
            } => {
                assert_eq!(
                    cert_file,
                    Path::new("/var/cert/certificates/node.example.com.crt")
                );
                assert_eq!(
                    key_file,
                    Path::new("/var/cert/certificates/node.example.com.key")
                );
            }
            other => panic!("expected TLS, got {:?}", other),
        }
    }

    #[test]
    fn test_build_node_topology_tls_file_mode() {
        let mut node = node(Protocol::Trojan);
        node.security = Security::Tls(TlsSettings {
            server_name: "node.example.com".to_string(),
            cert_mode: CertMode::File {
                cert_file: "/etc/ssl/a.pem".to_string(),
                key_file: "/etc/ssl/a.key".to_string(),
            },
            ..Default::default()
        });
        let tag = Tag::for_node(&node);
        let topology = build_node_topology(&node, &tag, &NodeOptions::default()).unwrap();
        assert!(matches!(
            topology.inbound.security,
            SecuritySpec::Tls { ref cert_file, .. } if cert_file == Path::new("/etc/ssl/a.pem")
        ));
    }

    #[test]
    fn test_fallbacks_only_on_tcp_vless_and_trojan() {
        let options = NodeOptions {
            fallbacks: vec![Fallback {
                dest: "80".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let trojan = node(Protocol::Trojan);
        let topology = build_node_topology(&trojan, &Tag::for_node(&trojan), &options).unwrap();
        assert_eq!(topology.inbound.fallbacks.len(), 1);

        let vmess = node(Protocol::Vmess);
        let topology = build_node_topology(&vmess, &Tag::for_node(&vmess), &options).unwrap();
        assert!(topology.inbound.fallbacks.is_empty());

        let mut ws = node(Protocol::Vless { flow: None });
        ws.transport = Transport::Ws {
            path: "/".to_string(),
            host: None,
        };
        let topology = build_node_topology(&ws, &Tag::for_node(&ws), &options).unwrap();
        assert!(topology.inbound.fallbacks.is_empty());
    }

    #[test]
    fn test_build_relay_topology_skips_bad_keys() {
        let relay = ss_relay(SS2022_AES_128);
        let relay_tag = Tag::for_relay(&relay);
        let main_tag = Tag::new("vmess_443_1");
        let subscribers = vec![record(1, "0123456789abcdefghij"), record(2, "short")];

        let topology = build_relay_topology(&relay, &relay_tag, &main_tag, &subscribers).unwrap();
        assert_eq!(topology.pairs.len(), 1);
        assert_eq!(topology.skipped.len(), 1);
        assert_eq!(topology.skipped[0].0, 2);

        let (outbound, route) = &topology.pairs[0];
        assert_eq!(outbound.tag.as_str(), "Relay_shadowsocks_8388_9_1");
        assert_eq!(route.rule_tag, outbound.tag);
        assert_eq!(route.inbound_tag, main_tag);
        assert_eq!(route.users, vec!["vmess_443_1|user1@example.com|1".to_string()]);
        match &outbound.kind {
            OutboundKind::Relay(target) => {
                assert_eq!(target.address, "relay.example.com");
                assert_eq!(
                    target.account,
                    Account::Shadowsocks {
                        method: SS2022_AES_128.to_string(),
                        password: format!("serverKey:{}", STANDARD.encode("0123456789abcdef")),
                    }
                );
            }
            other => panic!("expected relay outbound, got {:?}", other),
        }
    }

    #[test]
    fn test_build_relay_topology_rejects_plugin() {
        let mut relay = ss_relay(SS2022_AES_128);
        relay.protocol = Protocol::ShadowsocksPlugin;
        let result = build_relay_topology(
            &relay,
            &Tag::new("Relay_x_1_1"),
            &Tag::new("vmess_443_1"),
            &[record(1, "uuid")],
        );
        assert!(matches!(result, Err(NodeError::Unsupported(_))));
    }

    #[test]
    fn test_build_credentials() {
        let tag = Tag::new("vless_443_1");
        let protocol = Protocol::Vless {
            flow: Some("xtls-rprx-vision".to_string()),
        };
        let batch = build_credentials(&protocol, &tag, &[record(1, "uuid-1")]).unwrap();
        assert_eq!(batch.credentials.len(), 1);
        assert_eq!(batch.credentials[0].key, "vless_443_1|user1@example.com|1");
        assert_eq!(
            batch.credentials[0].account,
            Account::Vless {
                id: "uuid-1".to_string(),
                flow: Some("xtls-rprx-vision".to_string())
            }
        );
    }

    #[test]
    fn test_build_credentials_shadowsocks_skips_short_secret() {
        let tag = Tag::new("shadowsocks_8388_1");
        let protocol = Protocol::Shadowsocks {
            cipher: SS2022_AES_128.to_string(),
            server_key: "k".to_string(),
        };
        let batch = build_credentials(
            &protocol,
            &tag,
            &[record(1, "0123456789abcdefghij"), record(2, "short")],
        )
        .unwrap();
        assert_eq!(batch.credentials.len(), 1);
        assert_eq!(batch.skipped.len(), 1);
    }

    #[test]
    fn test_build_credentials_unsupported_aborts() {
        let tag = Tag::new("x");
        let result = build_credentials(&Protocol::ShadowsocksPlugin, &tag, &[record(1, "a")]);
        assert!(matches!(result, Err(NodeError::Unsupported(_))));
    }
}
