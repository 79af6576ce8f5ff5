//! Subscriber provisioning on a live listener, plus usage and presence reporting

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::hooks::{DataPlane, LimiterRegistry, PanelApi, TrafficCounters};
use crate::core::model::{NodeDescriptor, SubscriberId, SubscriberRecord, Usage};
use crate::core::tag::Tag;
use crate::core::topology::{build_credentials, CredentialBatch};
use crate::error::Result;
use crate::logger::log;

/// Format bytes into human-readable string (KB, MB, GB)
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Totals of one acknowledged usage report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub subscribers: usize,
    pub upload: u64,
    pub download: u64,
}

/// Applies and removes subscriber credentials on the listener of a tag
pub struct SubscriberProvisioner {
    data_plane: Arc<dyn DataPlane>,
    limiter: Arc<dyn LimiterRegistry>,
    /// Keys of removed credentials whose traffic is not yet acknowledged
    retired: DashMap<String, SubscriberId>,
}

impl SubscriberProvisioner {
    pub fn new(data_plane: Arc<dyn DataPlane>, limiter: Arc<dyn LimiterRegistry>) -> Self {
        Self {
            data_plane,
            limiter,
            retired: DashMap::new(),
        }
    }

    /// Keep reporting the traffic of `records` under `tag` after their
    /// credentials are gone. Called before any credential or listener removal.
    pub fn retire(&self, tag: &Tag, records: &[SubscriberRecord]) {
        for record in records {
            self.retired.insert(tag.subscriber_key(record), record.id);
        }
    }

    /// Number of retired keys still awaiting a report
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn credentials(
        &self,
        node: &NodeDescriptor,
        tag: &Tag,
        records: &[SubscriberRecord],
    ) -> Result<CredentialBatch> {
        let batch = build_credentials(&node.protocol, tag, records)?;
        for (id, error) in &batch.skipped {
            log::warn!(tag = %tag, id = id, error = %error, "Subscriber skipped");
        }
        Ok(batch)
    }

    /// Install credentials for `records` on the listener `tag`.
    ///
    /// An unsupported protocol aborts the whole call; a subscriber whose key
    /// cannot be derived is skipped. Returns the number installed.
    pub async fn add_subscribers(
        &self,
        node: &NodeDescriptor,
        tag: &Tag,
        records: &[SubscriberRecord],
    ) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let batch = self.credentials(node, tag, records)?;
        self.data_plane
            .add_credentials(tag, &batch.credentials)
            .await?;
        log::info!(tag = %tag, count = batch.credentials.len(), "Subscribers added");
        Ok(batch.credentials.len())
    }

    /// Remove credentials by composite key `tag|identifier|id`
    pub async fn remove_subscribers(&self, tag: &Tag, records: &[SubscriberRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.retire(tag, records);
        let keys: Vec<String> = records.iter().map(|r| tag.subscriber_key(r)).collect();
        self.data_plane.remove_credentials(tag, &keys).await?;
        log::info!(tag = %tag, count = keys.len(), "Subscribers removed");
        Ok(keys.len())
    }

    /// Push credential changes of modified subscribers.
    ///
    /// A changed secret is replaced in place and limit-only changes need no
    /// credential call. A changed identifier is the exception to in-place
    /// modification: it changes the composite key, so the old credential is
    /// removed and the new one added, and the old key is retired so its
    /// unreported traffic still reaches the panel. Returns the number of
    /// credentials touched.
    pub async fn modify_subscribers(
        &self,
        node: &NodeDescriptor,
        tag: &Tag,
        previous: &[SubscriberRecord],
        modified: &[SubscriberRecord],
    ) -> Result<usize> {
        let mut touched = 0;
        for record in modified {
            let Some(old) = previous.iter().find(|p| p.id == record.id) else {
                continue;
            };
            if old.identifier == record.identifier && old.secret == record.secret {
                continue;
            }

            let batch = self.credentials(node, tag, std::slice::from_ref(record))?;
            if old.identifier != record.identifier {
                self.retire(tag, std::slice::from_ref(old));
                self.data_plane
                    .remove_credentials(tag, &[tag.subscriber_key(old)])
                    .await?;
                if !batch.credentials.is_empty() {
                    self.data_plane
                        .add_credentials(tag, &batch.credentials)
                        .await?;
                }
            } else if let Some(credential) = batch.credentials.first() {
                self.data_plane.modify_credential(tag, credential).await?;
            }
            touched += 1;
        }
        if touched > 0 {
            log::info!(tag = %tag, count = touched, "Subscriber credentials modified");
        }
        Ok(touched)
    }

    /// Report non-zero usage and reset exactly what was acknowledged.
    ///
    /// Counters are only reduced after the panel accepted the report, so a
    /// failed report is re-sent, with later accrual, on the next call.
    /// Retired keys are reported alongside the live ones and dropped once
    /// their counters are back to zero.
    pub async fn report_usage(
        &self,
        panel: &dyn PanelApi,
        tag: &Tag,
        records: &[SubscriberRecord],
    ) -> Result<UsageReport> {
        let mut sources: Vec<(String, SubscriberId)> = records
            .iter()
            .map(|record| (tag.subscriber_key(record), record.id))
            .collect();
        // A key that is live again is reported as a live one
        self.retired
            .retain(|key, _| !sources.iter().any(|(live, _)| live == key));
        let retired: Vec<(String, SubscriberId)> = self
            .retired
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        sources.extend(retired.iter().cloned());

        let mut usage: Vec<Usage> = Vec::new();
        let mut by_id: HashMap<SubscriberId, usize> = HashMap::new();
        let mut acknowledged: Vec<(String, TrafficCounters)> = Vec::new();
        for (key, id) in sources {
            let counters = self.data_plane.traffic(&key).await;
            if counters.is_zero() {
                continue;
            }
            // One entry per subscriber even when a rename left two keys
            match by_id.get(&id) {
                Some(&index) => {
                    usage[index].upload += counters.upload;
                    usage[index].download += counters.download;
                }
                None => {
                    by_id.insert(id, usage.len());
                    usage.push(Usage {
                        id,
                        upload: counters.upload,
                        download: counters.download,
                    });
                }
            }
            acknowledged.push((key, counters));
        }

        if !usage.is_empty() {
            panel.report_usage(&usage).await?;
            for (key, counters) in acknowledged {
                if let Err(e) = self.data_plane.reset_traffic(&key, counters).await {
                    log::warn!(key = %key, error = %e, "Failed to reset traffic counters");
                }
            }
        }
        self.prune_retired(&retired).await;

        if usage.is_empty() {
            return Ok(UsageReport::default());
        }
        let report = UsageReport {
            subscribers: usage.len(),
            upload: usage.iter().map(|u| u.upload).sum(),
            download: usage.iter().map(|u| u.download).sum(),
        };
        log::info!(
            tag = %tag,
            subscribers = report.subscribers,
            upload = %format_bytes(report.upload),
            download = %format_bytes(report.download),
            "Traffic reported"
        );
        Ok(report)
    }

    /// Forget retired keys whose traffic has been fully acknowledged
    async fn prune_retired(&self, retired: &[(String, SubscriberId)]) {
        for (key, _) in retired {
            match self.data_plane.forget_traffic(key).await {
                Ok(true) => {
                    self.retired.remove(key);
                }
                Ok(false) => {}
                Err(e) => log::warn!(key = %key, error = %e, "Failed to drop retired counters"),
            }
        }
    }

    /// Forward connected endpoints of `tag` to the panel
    pub async fn report_online_presence(&self, panel: &dyn PanelApi, tag: &Tag) -> Result<usize> {
        let online = self.limiter.online_endpoints(tag).await?;
        panel.report_online(&online).await?;
        log::debug!(tag = %tag, count = online.len(), "Online endpoints reported");
        Ok(online.len())
    }
}
