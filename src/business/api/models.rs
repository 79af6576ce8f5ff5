//! Panel wire format and its conversion into domain descriptors

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::model::{
    BlockingRules, CertMode, NodeDescriptor, NodeId, OnlineIp, Protocol, RealitySettings,
    RelayNodeDescriptor, Security, SubscriberId, SubscriberRecord, TlsSettings, Transport, Usage,
    DEFAULT_GRPC_SERVICE_NAME, DEFAULT_WS_PATH,
};
use crate::error::{NodeError, Result};

/// Convert a panel speed limit in Mbps to bytes per second
pub fn mbps_to_bytes_per_second(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000) / 8
}

/// Every panel response wraps its payload in `data`
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Request body of every panel call
#[derive(Debug, Serialize)]
pub struct PostData<'a, T: Serialize> {
    pub key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealityWire {
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub short_ids: Vec<String>,
}

/// Transport and security fields shared by nodes and relay hops
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StreamWire {
    /// tcp, ws or grpc
    pub transport: String,
    pub path: String,
    pub host: String,
    pub service_name: String,
    /// none, tls or reality
    pub security: String,
    pub server_name: String,
    /// none, file, http or dns
    pub cert_mode: String,
    pub cert_domain: String,
    pub cert_file: String,
    pub key_file: String,
    pub alpn: Vec<String>,
    pub reject_unknown_sni: bool,
    pub allow_insecure: bool,
    pub reality: Option<RealityWire>,
    pub flow: String,
    pub cipher: String,
    pub server_key: String,
}

impl StreamWire {
    fn transport(&self) -> Result<Transport> {
        match self.transport.to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Transport::Tcp),
            "ws" | "websocket" => Ok(Transport::Ws {
                path: non_empty_or(&self.path, DEFAULT_WS_PATH),
                host: (!self.host.is_empty()).then(|| self.host.clone()),
            }),
            "grpc" => Ok(Transport::Grpc {
                service_name: non_empty_or(&self.service_name, DEFAULT_GRPC_SERVICE_NAME),
            }),
            other => Err(NodeError::Api(format!("unknown transport: {}", other))),
        }
    }

    fn security(&self) -> Result<Security> {
        match self.security.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Security::None),
            "tls" => {
                let cert_mode = match self.cert_mode.to_ascii_lowercase().as_str() {
                    "" | "none" => CertMode::None,
                    "file" => CertMode::File {
                        cert_file: self.cert_file.clone(),
                        key_file: self.key_file.clone(),
                    },
                    "http" => CertMode::Http,
                    "dns" => CertMode::Dns,
                    other => return Err(NodeError::Api(format!("unknown cert mode: {}", other))),
                };
                Ok(Security::Tls(TlsSettings {
                    server_name: self.server_name.clone(),
                    cert_mode,
                    cert_domain: self.cert_domain.clone(),
                    alpn: self.alpn.clone(),
                    reject_unknown_sni: self.reject_unknown_sni,
                    allow_insecure: self.allow_insecure,
                }))
            }
            "reality" => {
                let reality = self.reality.clone().ok_or_else(|| {
                    NodeError::Api("reality security without reality settings".to_string())
                })?;
                Ok(Security::Reality(RealitySettings {
                    dest: reality.dest,
                    server_names: reality.server_names,
                    private_key: reality.private_key,
                    public_key: reality.public_key,
                    short_ids: reality.short_ids,
                }))
            }
            other => Err(NodeError::Api(format!("unknown security: {}", other))),
        }
    }

    fn protocol(&self, kind: &str) -> Result<Protocol> {
        match kind.to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless {
                flow: (!self.flow.is_empty()).then(|| self.flow.clone()),
            }),
            "vmess" => Ok(Protocol::Vmess),
            "trojan" => Ok(Protocol::Trojan),
            "shadowsocks" => {
                if self.cipher.is_empty() {
                    return Err(NodeError::Api("shadowsocks node without cipher".to_string()));
                }
                Ok(Protocol::Shadowsocks {
                    cipher: self.cipher.to_ascii_lowercase(),
                    server_key: self.server_key.clone(),
                })
            }
            "shadowsocks-plugin" => Ok(Protocol::ShadowsocksPlugin),
            other => Err(NodeError::Api(format!("unknown node type: {}", other))),
        }
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// `POST /api/server/info/{id}` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeWire {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub port: u16,
    #[serde(flatten)]
    pub stream: StreamWire,
    /// Mbps, 0 = unlimited
    #[serde(default)]
    pub speedlimit: u64,
    #[serde(default)]
    pub relay_type: u32,
    #[serde(default)]
    pub relay_node_id: NodeId,
    #[serde(default)]
    pub block_ports: String,
    #[serde(default)]
    pub block_domains: Vec<String>,
    #[serde(default)]
    pub block_ips: Vec<String>,
    #[serde(default)]
    pub block_protocols: Vec<String>,
    /// Seconds
    #[serde(default)]
    pub update_interval: u64,
}

impl TryFrom<NodeWire> for NodeDescriptor {
    type Error = NodeError;

    fn try_from(wire: NodeWire) -> Result<Self> {
        let relay_node_id =
            (wire.relay_type == 1 && wire.relay_node_id > 0).then_some(wire.relay_node_id);
        Ok(NodeDescriptor {
            id: wire.id,
            protocol: wire.stream.protocol(&wire.node_type)?,
            port: wire.port,
            transport: wire.stream.transport()?,
            security: wire.stream.security()?,
            speed_limit: mbps_to_bytes_per_second(wire.speedlimit),
            relay_node_id,
            blocking: BlockingRules {
                ports: wire.block_ports,
                domains: wire.block_domains,
                ips: wire.block_ips,
                protocols: wire.block_protocols,
            },
            update_interval: Duration::from_secs(wire.update_interval),
        })
    }
}

/// `POST /api/server/transit/{id}` payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayNodeWire {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    pub address: String,
    pub port: u16,
    #[serde(flatten)]
    pub stream: StreamWire,
}

impl TryFrom<RelayNodeWire> for RelayNodeDescriptor {
    type Error = NodeError;

    fn try_from(wire: RelayNodeWire) -> Result<Self> {
        Ok(RelayNodeDescriptor {
            id: wire.id,
            protocol: wire.stream.protocol(&wire.node_type)?,
            address: wire.address,
            port: wire.port,
            transport: wire.stream.transport()?,
            security: wire.stream.security()?,
        })
    }
}

/// One entry of `POST /api/server/subscription/lists/{id}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionWire {
    pub id: SubscriberId,
    pub email: String,
    pub passwd: String,
    #[serde(default)]
    pub iplimit: u32,
    /// Mbps, 0 = unlimited
    #[serde(default)]
    pub speedlimit: u64,
}

impl From<SubscriptionWire> for SubscriberRecord {
    fn from(wire: SubscriptionWire) -> Self {
        SubscriberRecord {
            id: wire.id,
            identifier: wire.email,
            secret: wire.passwd,
            ip_limit: wire.iplimit,
            speed_limit: mbps_to_bytes_per_second(wire.speedlimit),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrafficWire {
    pub id: SubscriberId,
    pub u: u64,
    pub d: u64,
}

impl From<&Usage> for TrafficWire {
    fn from(usage: &Usage) -> Self {
        Self {
            id: usage.id,
            u: usage.upload,
            d: usage.download,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliveIpWire {
    pub id: SubscriberId,
    pub ip: String,
}

impl From<&OnlineIp> for AliveIpWire {
    fn from(online: &OnlineIp) -> Self {
        Self {
            id: online.id,
            ip: online.ip.clone(),
        }
    }
}
