//! In-process live object registry
//!
//! Holds listeners, outbounds, routing rules and credentials by tag. A proxy
//! engine embedded in the process reads it to authenticate clients, resolve
//! the outbound of a flow and record traffic.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::password_to_hex;
use super::routing::{rule_matches, Flow};
use super::stats::TrafficStats;
use crate::core::hooks::{Authenticator, DataPlane, TrafficCounters, TrafficRecorder};
use crate::core::model::SubscriberId;
use crate::core::tag::Tag;
use crate::core::topology::{Account, Credential, InboundSpec, OutboundSpec, RouteSpec};
use crate::error::{NodeError, Result};
use crate::logger::log;

/// A live listener and the credentials installed on it
#[derive(Debug)]
struct InboundEntry {
    spec: InboundSpec,
    /// key -> credential
    credentials: HashMap<String, Credential>,
    /// Trojan password hash -> key
    trojan: HashMap<[u8; 56], String>,
}

impl InboundEntry {
    fn new(spec: InboundSpec) -> Self {
        Self {
            spec,
            credentials: HashMap::new(),
            trojan: HashMap::new(),
        }
    }

    fn insert(&mut self, credential: Credential) {
        self.remove(&credential.key);
        if let Account::Trojan { password } = &credential.account {
            self.trojan
                .insert(password_to_hex(password), credential.key.clone());
        }
        self.credentials.insert(credential.key.clone(), credential);
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.credentials.remove(key) {
            Some(previous) => {
                if let Account::Trojan { password } = &previous.account {
                    self.trojan.remove(&password_to_hex(password));
                }
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    seq: u64,
    spec: RouteSpec,
}

/// In-memory data plane
#[derive(Debug, Default)]
pub struct MemoryDataPlane {
    inbounds: DashMap<Tag, InboundEntry>,
    outbounds: DashMap<Tag, OutboundSpec>,
    routes: DashMap<Tag, RouteEntry>,
    route_seq: AtomicU64,
    traffic: TrafficStats,
    /// Number of add/remove/modify calls received
    mutations: AtomicU64,
}

impl MemoryDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    /// Count of mutating calls made against this data plane
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    pub fn has_inbound(&self, tag: &Tag) -> bool {
        self.inbounds.contains_key(tag)
    }

    pub fn inbound(&self, tag: &Tag) -> Option<InboundSpec> {
        self.inbounds.get(tag).map(|entry| entry.spec.clone())
    }

    pub fn has_outbound(&self, tag: &Tag) -> bool {
        self.outbounds.contains_key(tag)
    }

    pub fn outbound(&self, tag: &Tag) -> Option<OutboundSpec> {
        self.outbounds.get(tag).map(|entry| entry.clone())
    }

    pub fn has_route(&self, rule_tag: &Tag) -> bool {
        self.routes.contains_key(rule_tag)
    }

    pub fn inbound_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.inbounds.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    pub fn outbound_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.outbounds.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    pub fn route_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.routes.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Credential keys installed on `tag`, sorted
    pub fn credential_keys(&self, tag: &Tag) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inbounds
            .get(tag)
            .map(|entry| entry.credentials.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn credential(&self, tag: &Tag, key: &str) -> Option<Credential> {
        self.inbounds
            .get(tag)
            .and_then(|entry| entry.credentials.get(key).cloned())
    }

    /// Outbound a flow is routed to: blocking rules first, then per-user relay
    /// rules, then default rules, insertion order within a class.
    pub fn resolve(&self, flow: &Flow) -> Option<Tag> {
        let mut candidates: Vec<RouteEntry> = self
            .routes
            .iter()
            .filter(|entry| rule_matches(&entry.value().spec, flow))
            .map(|entry| entry.value().clone())
            .collect();
        candidates.sort_by_key(|entry| (entry.spec.kind, entry.seq));
        candidates
            .into_iter()
            .next()
            .map(|entry| entry.spec.outbound_tag)
    }

    pub fn traffic_stats(&self) -> &TrafficStats {
        &self.traffic
    }
}

#[async_trait]
impl DataPlane for MemoryDataPlane {
    async fn add_inbound(&self, spec: &InboundSpec) -> Result<()> {
        self.mutated();
        if self.inbounds.contains_key(&spec.tag) {
            log::debug!(tag = %spec.tag, "Inbound already present");
            return Ok(());
        }
        self.inbounds
            .insert(spec.tag.clone(), InboundEntry::new(spec.clone()));
        log::debug!(tag = %spec.tag, port = spec.port, "Inbound added");
        Ok(())
    }

    async fn remove_inbound(&self, tag: &Tag) -> Result<()> {
        self.mutated();
        if self.inbounds.remove(tag).is_some() {
            log::debug!(tag = %tag, "Inbound removed");
        }
        Ok(())
    }

    async fn add_outbound(&self, spec: &OutboundSpec) -> Result<()> {
        self.mutated();
        self.outbounds
            .entry(spec.tag.clone())
            .or_insert_with(|| spec.clone());
        Ok(())
    }

    async fn remove_outbound(&self, tag: &Tag) -> Result<()> {
        self.mutated();
        self.outbounds.remove(tag);
        Ok(())
    }

    async fn add_route(&self, spec: &RouteSpec) -> Result<()> {
        self.mutated();
        if !self.routes.contains_key(&spec.rule_tag) {
            let seq = self.route_seq.fetch_add(1, Ordering::Relaxed);
            self.routes.insert(
                spec.rule_tag.clone(),
                RouteEntry {
                    seq,
                    spec: spec.clone(),
                },
            );
        }
        Ok(())
    }

    async fn remove_route(&self, rule_tag: &Tag) -> Result<()> {
        self.mutated();
        self.routes.remove(rule_tag);
        Ok(())
    }

    async fn add_credentials(&self, tag: &Tag, credentials: &[Credential]) -> Result<()> {
        self.mutated();
        let mut entry = self
            .inbounds
            .get_mut(tag)
            .ok_or_else(|| NodeError::DataPlane(format!("no such inbound: {}", tag)))?;
        for credential in credentials {
            entry.insert(credential.clone());
        }
        Ok(())
    }

    async fn remove_credentials(&self, tag: &Tag, keys: &[String]) -> Result<()> {
        self.mutated();
        if let Some(mut entry) = self.inbounds.get_mut(tag) {
            for key in keys {
                entry.remove(key);
            }
        }
        Ok(())
    }

    async fn modify_credential(&self, tag: &Tag, credential: &Credential) -> Result<()> {
        self.mutated();
        let mut entry = self
            .inbounds
            .get_mut(tag)
            .ok_or_else(|| NodeError::DataPlane(format!("no such inbound: {}", tag)))?;
        entry.insert(credential.clone());
        Ok(())
    }

    async fn traffic(&self, key: &str) -> TrafficCounters {
        self.traffic.get(key)
    }

    async fn reset_traffic(&self, key: &str, acknowledged: TrafficCounters) -> Result<()> {
        self.traffic.subtract(key, acknowledged);
        Ok(())
    }

    async fn forget_traffic(&self, key: &str) -> Result<bool> {
        Ok(self.traffic.remove_if_zero(key))
    }
}

impl Authenticator for MemoryDataPlane {
    fn authenticate(&self, tag: &Tag, password: &[u8; 56]) -> Option<(SubscriberId, String)> {
        let entry = self.inbounds.get(tag)?;
        let key = entry.trojan.get(password)?;
        let credential = entry.credentials.get(key)?;
        Some((credential.subscriber_id, key.clone()))
    }
}

impl TrafficRecorder for MemoryDataPlane {
    fn record_upload(&self, key: &str, bytes: u64) {
        self.traffic.record_upload(key, bytes);
    }

    fn record_download(&self, key: &str, bytes: u64) {
        self.traffic.record_download(key, bytes);
    }
}
