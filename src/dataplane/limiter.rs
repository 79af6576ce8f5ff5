//! Per-tag rate limiting and online-endpoint tracking
//!
//! Each tag carries the node speed limit and one entry per subscriber. The
//! effective byte rate of a subscriber is the smaller non-zero of the node
//! and subscriber limits, enforced by a token bucket metered in 1 KiB cells.

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::core::hooks::LimiterRegistry;
use crate::core::model::{OnlineIp, SubscriberId, SubscriberRecord};
use crate::core::tag::Tag;
use crate::error::Result;
use crate::logger::log;

/// Bytes per token bucket cell
const CELL_BYTES: u64 = 1024;

type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Smaller non-zero of two limits, 0 when both are unlimited
pub fn effective_rate(node_limit: u64, user_limit: u64) -> u64 {
    match (node_limit, user_limit) {
        (0, user) => user,
        (node, 0) => node,
        (node, user) => node.min(user),
    }
}

/// Shared handle throttling the byte stream of one subscriber
#[derive(Clone)]
pub struct Throttle {
    bucket: Arc<Bucket>,
    burst_cells: u32,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("burst_cells", &self.burst_cells)
            .finish()
    }
}

impl Throttle {
    fn new(bytes_per_second: u64) -> Self {
        let cells = bytes_per_second.div_ceil(CELL_BYTES).clamp(1, u32::MAX as u64) as u32;
        let per_second = NonZeroU32::new(cells).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            burst_cells: per_second.get(),
        }
    }

    /// Wait until `bytes` may pass
    pub async fn consume(&self, bytes: u64) {
        let mut cells = bytes.div_ceil(CELL_BYTES);
        while cells > 0 {
            let chunk = cells.min(self.burst_cells as u64) as u32;
            if let Some(n) = NonZeroU32::new(chunk) {
                // Chunks never exceed the burst size, so capacity is always sufficient
                let _ = self.bucket.until_n_ready(n).await;
            }
            cells -= chunk as u64;
        }
    }

    /// Take `bytes` without waiting; false when the bucket is short
    pub fn try_consume(&self, bytes: u64) -> bool {
        let cells = bytes.div_ceil(CELL_BYTES).min(self.burst_cells as u64) as u32;
        match NonZeroU32::new(cells) {
            Some(n) => matches!(self.bucket.check_n(n), Ok(Ok(()))),
            None => true,
        }
    }
}

/// Outcome of a connection admission check
#[derive(Debug, Clone)]
pub enum Admission {
    /// Accepted; carries the subscriber's throttle when a rate applies
    Accepted(Option<Throttle>),
    /// The subscriber already uses as many distinct IPs as allowed
    TooManyIps,
    /// No limiter is installed for the tag, or the subscriber is unknown to it
    Unknown,
}

#[derive(Debug)]
struct SubscriberLimit {
    ip_limit: u32,
    speed_limit: u64,
    throttle: Option<Throttle>,
    /// ip -> open connections
    online: HashMap<String, usize>,
}

impl SubscriberLimit {
    fn new(node_limit: u64, record: &SubscriberRecord) -> Self {
        let rate = effective_rate(node_limit, record.speed_limit);
        Self {
            ip_limit: record.ip_limit,
            speed_limit: record.speed_limit,
            throttle: (rate > 0).then(|| Throttle::new(rate)),
            online: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct TagLimiter {
    node_speed_limit: u64,
    subscribers: HashMap<SubscriberId, SubscriberLimit>,
}

/// In-memory limiter registry
#[derive(Debug, Default)]
pub struct MemoryLimiter {
    tags: DashMap<Tag, TagLimiter>,
}

impl MemoryLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_limiter(&self, tag: &Tag) -> bool {
        self.tags.contains_key(tag)
    }

    /// Node speed limit a tag was installed with
    pub fn node_speed_limit(&self, tag: &Tag) -> Option<u64> {
        self.tags.get(tag).map(|entry| entry.node_speed_limit)
    }

    /// Subscriber ids known to the limiter of `tag`, sorted
    pub fn subscriber_ids(&self, tag: &Tag) -> Vec<SubscriberId> {
        let mut ids: Vec<SubscriberId> = self
            .tags
            .get(tag)
            .map(|entry| entry.subscribers.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Per-subscriber speed limit as last pushed
    pub fn subscriber_speed_limit(&self, tag: &Tag, id: SubscriberId) -> Option<u64> {
        self.tags
            .get(tag)
            .and_then(|entry| entry.subscribers.get(&id).map(|s| s.speed_limit))
    }

    /// Admit a connection of subscriber `id` from `ip`
    pub fn admit(&self, tag: &Tag, id: SubscriberId, ip: &str) -> Admission {
        let Some(mut entry) = self.tags.get_mut(tag) else {
            return Admission::Unknown;
        };
        let Some(subscriber) = entry.subscribers.get_mut(&id) else {
            return Admission::Unknown;
        };

        let known_ip = subscriber.online.contains_key(ip);
        if !known_ip
            && subscriber.ip_limit > 0
            && subscriber.online.len() >= subscriber.ip_limit as usize
        {
            log::debug!(tag = %tag, id = id, ip = ip, "Connection rejected by IP limit");
            return Admission::TooManyIps;
        }
        *subscriber.online.entry(ip.to_string()).or_insert(0) += 1;
        Admission::Accepted(subscriber.throttle.clone())
    }

    /// Release one connection previously admitted
    pub fn release(&self, tag: &Tag, id: SubscriberId, ip: &str) {
        let Some(mut entry) = self.tags.get_mut(tag) else {
            return;
        };
        if let Some(subscriber) = entry.subscribers.get_mut(&id) {
            if let Some(count) = subscriber.online.get_mut(ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    subscriber.online.remove(ip);
                }
            }
        }
    }
}

#[async_trait]
impl LimiterRegistry for MemoryLimiter {
    async fn add_limiter(
        &self,
        tag: &Tag,
        node_speed_limit: u64,
        subscribers: &[SubscriberRecord],
    ) -> Result<()> {
        let limiter = TagLimiter {
            node_speed_limit,
            subscribers: subscribers
                .iter()
                .map(|record| (record.id, SubscriberLimit::new(node_speed_limit, record)))
                .collect(),
        };
        self.tags.insert(tag.clone(), limiter);
        log::debug!(
            tag = %tag,
            node_speed_limit = node_speed_limit,
            subscribers = subscribers.len(),
            "Limiter installed"
        );
        Ok(())
    }

    async fn update_limiter(&self, tag: &Tag, subscribers: &[SubscriberRecord]) -> Result<()> {
        if let Some(mut entry) = self.tags.get_mut(tag) {
            let node_limit = entry.node_speed_limit;
            for record in subscribers {
                let mut limit = SubscriberLimit::new(node_limit, record);
                // Connected endpoints survive a limit change
                if let Some(previous) = entry.subscribers.remove(&record.id) {
                    limit.online = previous.online;
                }
                entry.subscribers.insert(record.id, limit);
            }
        }
        Ok(())
    }

    async fn remove_limiter(&self, tag: &Tag) -> Result<()> {
        self.tags.remove(tag);
        Ok(())
    }

    async fn online_endpoints(&self, tag: &Tag) -> Result<Vec<OnlineIp>> {
        let online: BTreeSet<OnlineIp> = self
            .tags
            .get(tag)
            .map(|entry| {
                entry
                    .subscribers
                    .iter()
                    .flat_map(|(id, limit)| {
                        limit.online.keys().map(move |ip| OnlineIp {
                            id: *id,
                            ip: ip.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(online.into_iter().collect())
    }
}
