//! Rule matching for route resolution
//!
//! Matcher semantics follow the field-rule model of the proxy engines the
//! panel targets: every non-empty matcher list of a rule must match, and
//! within a list any entry may match.

use std::net::IpAddr;

use crate::core::tag::Tag;
use crate::core::topology::RouteSpec;

/// Attributes of one proxied flow, as seen by the engine
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub inbound: Option<Tag>,
    /// Credential key of the authenticated subscriber
    pub user: Option<String>,
    pub port: u16,
    pub domain: Option<String>,
    pub ip: Option<IpAddr>,
    /// Sniffed application protocol (e.g. "bittorrent", "http")
    pub protocol: Option<String>,
}

impl Flow {
    pub fn new(inbound: Tag, port: u16) -> Self {
        Self {
            inbound: Some(inbound),
            port,
            ..Default::default()
        }
    }

    pub fn user(mut self, key: impl Into<String>) -> Self {
        self.user = Some(key.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Whether `rule` applies to `flow`
pub fn rule_matches(rule: &RouteSpec, flow: &Flow) -> bool {
    if flow.inbound.as_ref() != Some(&rule.inbound_tag) {
        return false;
    }
    if !rule.users.is_empty() {
        match &flow.user {
            Some(user) if rule.users.iter().any(|u| u == user) => {}
            _ => return false,
        }
    }
    if !rule.ports.is_empty() && !rule.ports.iter().any(|r| r.contains(flow.port)) {
        return false;
    }
    if !rule.domains.is_empty() {
        match &flow.domain {
            Some(domain) if rule.domains.iter().any(|d| domain_matches(d, domain)) => {}
            _ => return false,
        }
    }
    if !rule.ips.is_empty() {
        match flow.ip {
            Some(ip) if rule.ips.iter().any(|cidr| ip_matches(cidr, ip)) => {}
            _ => return false,
        }
    }
    if !rule.protocols.is_empty() {
        match &flow.protocol {
            Some(protocol) if rule.protocols.iter().any(|p| p.eq_ignore_ascii_case(protocol)) => {}
            _ => return false,
        }
    }
    true
}

/// Domain matcher: `full:`, `domain:` (the domain or any subdomain),
/// `keyword:` and bare substring
pub fn domain_matches(pattern: &str, domain: &str) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if let Some(full) = pattern.strip_prefix("full:") {
        return domain == full.to_ascii_lowercase();
    }
    if let Some(suffix) = pattern.strip_prefix("domain:") {
        let suffix = suffix.to_ascii_lowercase();
        return domain == suffix || domain.ends_with(&format!(".{}", suffix));
    }
    let keyword = pattern.strip_prefix("keyword:").unwrap_or(pattern);
    domain.contains(&keyword.to_ascii_lowercase())
}

/// IP matcher: a single address or a CIDR block; malformed entries never match
pub fn ip_matches(pattern: &str, ip: IpAddr) -> bool {
    let (addr, prefix) = match pattern.split_once('/') {
        Some((addr, prefix)) => match prefix.parse::<u8>() {
            Ok(prefix) => (addr, Some(prefix)),
            Err(_) => return false,
        },
        None => (pattern, None),
    };
    let Ok(network) = addr.trim().parse::<IpAddr>() else {
        return false;
    };

    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let prefix = prefix.unwrap_or(32);
            if prefix > 32 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(net) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let prefix = prefix.unwrap_or(128);
            if prefix > 128 {
                return false;
            }
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(net) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}
