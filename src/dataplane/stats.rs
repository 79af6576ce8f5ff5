//! Per-credential traffic counters
//!
//! Counters are keyed by the composite credential key and only ever shrink by
//! the amounts a report acknowledged, so bytes recorded between a read and
//! the matching reset carry over to the next report.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::hooks::TrafficCounters;

/// Counters for a single credential
#[derive(Debug, Default)]
pub struct CredentialStats {
    /// Total bytes uploaded (client -> remote)
    upload_bytes: AtomicU64,
    /// Total bytes downloaded (remote -> client)
    download_bytes: AtomicU64,
}

impl CredentialStats {
    #[inline]
    pub fn add_upload(&self, bytes: u64) {
        self.upload_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_download(&self, bytes: u64) {
        self.download_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self) -> TrafficCounters {
        TrafficCounters {
            upload: self.upload_bytes.load(Ordering::Acquire),
            download: self.download_bytes.load(Ordering::Acquire),
        }
    }

    /// Subtract acknowledged amounts, saturating at zero
    pub fn subtract(&self, acknowledged: TrafficCounters) {
        saturating_sub(&self.upload_bytes, acknowledged.upload);
        saturating_sub(&self.download_bytes, acknowledged.download);
    }
}

fn saturating_sub(counter: &AtomicU64, amount: u64) {
    // The closure never returns None, so the update cannot fail
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(amount))
    });
}

/// Traffic counters for every credential of the data plane
#[derive(Debug, Clone, Default)]
pub struct TrafficStats {
    counters: Arc<DashMap<String, Arc<CredentialStats>>>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create counters for a credential key
    pub fn get_or_create(&self, key: &str) -> Arc<CredentialStats> {
        if let Some(stats) = self.counters.get(key) {
            return Arc::clone(stats.value());
        }
        self.counters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CredentialStats::default()))
            .clone()
    }

    /// Counters for `key`, zero when nothing was ever recorded
    pub fn get(&self, key: &str) -> TrafficCounters {
        self.counters
            .get(key)
            .map(|entry| entry.value().get())
            .unwrap_or_default()
    }

    pub fn subtract(&self, key: &str, acknowledged: TrafficCounters) {
        if let Some(entry) = self.counters.get(key) {
            entry.value().subtract(acknowledged);
        }
    }

    #[inline]
    pub fn record_upload(&self, key: &str, bytes: u64) {
        self.get_or_create(key).add_upload(bytes);
    }

    #[inline]
    pub fn record_download(&self, key: &str, bytes: u64) {
        self.get_or_create(key).add_download(bytes);
    }

    /// Drop the counters of `key` once they read zero.
    ///
    /// Returns false when traffic is still pending, so retired credentials
    /// do not leave entries behind and the map stays bounded.
    pub fn remove_if_zero(&self, key: &str) -> bool {
        self.counters
            .remove_if(key, |_, stats| stats.get().is_zero());
        !self.counters.contains_key(key)
    }

    /// Get the number of tracked credentials
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}
