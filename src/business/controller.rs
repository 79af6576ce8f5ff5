//! Reconciliation controller
//!
//! One controller owns one node identity. It stands the node up once, then
//! polls the panel on the node's update interval and drives the lifecycle
//! manager and the subscriber provisioner so the live data plane follows the
//! panel. Usage reporting and certificate renewal run as sibling tasks.
//!
//! State is an immutable [`NodeState`] value; every tick works on a copy and
//! publishes it wholesale when it returns, successful or not, so the retained
//! state always reflects the last completed step.

use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{Instrument, Span};

use super::lifecycle::{NodeLifecycle, RelayState};
use super::provisioner::{SubscriberProvisioner, UsageReport};
use super::tasks::TaskManager;
use crate::config::NodeOptions;
use crate::core::diff::{compare, duplicate_id};
use crate::core::hooks::{
    CertRenewer, ClientInfo, DataPlane, LimiterRegistry, PanelApi, RenewedCert, Restart,
};
use crate::core::model::{NodeDescriptor, SubscriberRecord};
use crate::core::tag::Tag;
use crate::core::topology::NodeTopology;
use crate::error::{NodeError, Result};
use crate::logger::log;

/// Certificate renewal runs this many poll intervals apart
const CERT_INTERVAL_FACTOR: u32 = 60;

/// Everything the controller retains between ticks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub node: NodeDescriptor,
    pub tag: Tag,
    /// Last subscriber snapshot actually provisioned
    pub subscribers: Vec<SubscriberRecord>,
    pub relay: Option<RelayState>,
}

/// What one poll tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Unchanged,
    SubscribersUpdated {
        deleted: usize,
        added: usize,
        modified: usize,
    },
    NodeReplaced {
        old_tag: Tag,
        new_tag: Tag,
    },
    /// A relay head got back the relay it lost on an earlier tick
    RelayRestored,
}

/// Restart capability backed by a [`Notify`]
///
/// The supervisor awaits [`RestartSignal::requested`]; a request made while
/// nobody is waiting is kept until the next wait.
#[derive(Clone, Default)]
pub struct RestartSignal {
    notify: Arc<Notify>,
}

impl RestartSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}

impl Restart for RestartSignal {
    fn restart(&self) {
        log::warn!("Full restart requested");
        self.notify.notify_one();
    }
}

/// `[apiHost] type(NodeID=id)`
pub fn log_prefix(info: &ClientInfo, kind: &str) -> String {
    format!("[{}] {}(NodeID={})", info.api_host, kind, info.node_id)
}

/// Builder for constructing a Controller
#[derive(Default)]
pub struct ControllerBuilder {
    panel: Option<Arc<dyn PanelApi>>,
    data_plane: Option<Arc<dyn DataPlane>>,
    limiter: Option<Arc<dyn LimiterRegistry>>,
    cert_renewer: Option<Arc<dyn CertRenewer>>,
    restart: Option<Arc<dyn Restart>>,
    options: NodeOptions,
}

impl ControllerBuilder {
    pub fn panel(mut self, panel: Arc<dyn PanelApi>) -> Self {
        self.panel = Some(panel);
        self
    }

    pub fn data_plane(mut self, data_plane: Arc<dyn DataPlane>) -> Self {
        self.data_plane = Some(data_plane);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn LimiterRegistry>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Optional; without it certificates are never renewed
    pub fn cert_renewer(mut self, cert_renewer: Arc<dyn CertRenewer>) -> Self {
        self.cert_renewer = Some(cert_renewer);
        self
    }

    pub fn restart(mut self, restart: Arc<dyn Restart>) -> Self {
        self.restart = Some(restart);
        self
    }

    pub fn options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Controller> {
        let missing = |what: &str| NodeError::Config(format!("controller needs a {}", what));
        let panel = self.panel.ok_or_else(|| missing("panel client"))?;
        let data_plane = self.data_plane.ok_or_else(|| missing("data plane"))?;
        let limiter = self.limiter.ok_or_else(|| missing("limiter registry"))?;
        let restart = self.restart.ok_or_else(|| missing("restart capability"))?;

        let info = panel.describe();
        let span = tracing::info_span!("node", prefix = tracing::field::Empty);
        span.record("prefix", log_prefix(&info, "unknown").as_str());

        let (state, _) = watch::channel(None);
        Ok(Controller {
            inner: Arc::new(Inner {
                lifecycle: NodeLifecycle::new(
                    Arc::clone(&data_plane),
                    Arc::clone(&limiter),
                    self.options,
                ),
                provisioner: SubscriberProvisioner::new(data_plane, limiter),
                panel,
                info,
                cert_renewer: self.cert_renewer,
                restart,
                state,
                tick_lock: Mutex::new(()),
                span,
            }),
            tasks: TaskManager::new(),
        })
    }
}

/// Keeps one node on the live data plane in sync with the panel
pub struct Controller {
    inner: Arc<Inner>,
    tasks: TaskManager,
}

struct Inner {
    panel: Arc<dyn PanelApi>,
    info: ClientInfo,
    lifecycle: NodeLifecycle,
    provisioner: SubscriberProvisioner,
    cert_renewer: Option<Arc<dyn CertRenewer>>,
    restart: Arc<dyn Restart>,
    state: watch::Sender<Option<Arc<NodeState>>>,
    /// Serializes poll ticks, including ones triggered by `reconcile_now`
    tick_lock: Mutex<()>,
    span: Span,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::default()
    }

    /// Stand the node up and schedule its periodic tasks.
    ///
    /// Any failure returns before a single task is scheduled.
    pub async fn start(&mut self) -> Result<()> {
        if self.inner.state.borrow().is_some() {
            return Err(NodeError::Other("controller already started".to_string()));
        }

        let span = self.inner.span.clone();
        let state = match self.inner.stand_up().instrument(span.clone()).await {
            Ok(state) => state,
            Err(e) => {
                span.in_scope(|| log::error!(error = %e, "Node startup failed"));
                return Err(e);
            }
        };

        let period = state.node.poll_interval();
        let challenge = state
            .node
            .tls()
            .and_then(|tls| tls.cert_mode.challenge())
            .filter(|_| self.inner.cert_renewer.is_some());
        self.inner.state.send_replace(Some(Arc::new(state)));

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn_periodic("poll", period, span.clone(), move || {
            let inner = Arc::clone(&inner);
            async move {
                let _ = inner.poll().await;
            }
        });

        let inner = Arc::clone(&self.inner);
        self.tasks.spawn_periodic("report", period, span.clone(), move || {
            let inner = Arc::clone(&inner);
            async move {
                let _ = inner.report().await;
            }
        });

        if challenge.is_some() {
            let inner = Arc::clone(&self.inner);
            self.tasks.spawn_periodic(
                "cert",
                period.saturating_mul(CERT_INTERVAL_FACTOR),
                span.clone(),
                move || {
                    let inner = Arc::clone(&inner);
                    async move {
                        let _ = inner.renew_cert().await;
                    }
                },
            );
        }

        span.in_scope(|| {
            log::info!(
                tasks = self.tasks.count(),
                interval = ?period,
                "Node started"
            )
        });
        Ok(())
    }

    /// Stop periodic tasks. The live topology is left in place.
    pub async fn close(&mut self) {
        self.tasks.close_all().await;
        self.inner
            .span
            .in_scope(|| log::info!("Node controller closed"));
    }

    /// Run one poll tick now, serialized with the scheduled ones
    pub async fn reconcile_now(&self) -> Result<TickOutcome> {
        self.inner.poll().instrument(self.inner.span.clone()).await
    }

    /// Run one usage and online-presence report now
    pub async fn report_now(&self) -> Result<UsageReport> {
        self.inner.report().instrument(self.inner.span.clone()).await
    }

    /// Run one certificate renewal now; `None` when the node has no auto-cert
    pub async fn renew_cert_now(&self) -> Result<Option<RenewedCert>> {
        self.inner
            .renew_cert()
            .instrument(self.inner.span.clone())
            .await
    }

    /// Retained state, `None` before a successful start
    pub fn snapshot(&self) -> Option<Arc<NodeState>> {
        self.inner.state.borrow().clone()
    }

    /// Number of scheduled periodic tasks
    pub fn task_count(&self) -> usize {
        self.tasks.count()
    }
}

impl Inner {
    fn current(&self) -> Result<Arc<NodeState>> {
        self.state
            .borrow()
            .clone()
            .ok_or_else(|| NodeError::Other("controller not started".to_string()))
    }

    fn describe_node(&self, node: &NodeDescriptor) {
        self.span
            .record("prefix", log_prefix(&self.info, node.protocol.kind()).as_str());
    }

    /// starting: fetch once, relay before primary, then credentials and limiter
    async fn stand_up(&self) -> Result<NodeState> {
        let node = self.panel.fetch_node().await?.changed().ok_or_else(|| {
            NodeError::Api("node descriptor answered not-modified at startup".to_string())
        })?;
        self.describe_node(&node);

        let subscribers = self
            .panel
            .fetch_subscribers()
            .await?
            .changed()
            .ok_or_else(|| {
                NodeError::Api("subscriber list answered not-modified at startup".to_string())
            })?;
        check_unique(&subscribers)?;

        let tag = Tag::for_node(&node);
        let topology = self.lifecycle.build(&node, &tag)?;

        let relay = if node.is_relay_head() {
            let relay = self.panel.fetch_relay_node().await?;
            Some(
                self.lifecycle
                    .apply_relay(&relay, &tag, &subscribers)
                    .await?,
            )
        } else {
            None
        };

        self.lifecycle.apply(&topology).await?;
        self.provisioner
            .add_subscribers(&node, &tag, &subscribers)
            .await?;
        self.lifecycle
            .install_limiter(&tag, node.speed_limit, &subscribers)
            .await?;

        Ok(NodeState {
            node,
            tag,
            subscribers,
            relay,
        })
    }

    /// One poll tick, logged
    async fn poll(&self) -> Result<TickOutcome> {
        let result = self.poll_tick().await;
        match &result {
            Ok(TickOutcome::Unchanged) => log::debug!("Node and subscribers unchanged"),
            Ok(TickOutcome::SubscribersUpdated {
                deleted,
                added,
                modified,
            }) => log::info!(
                deleted = deleted,
                added = added,
                modified = modified,
                "Subscribers synchronized"
            ),
            Ok(TickOutcome::NodeReplaced { old_tag, new_tag }) => {
                log::info!(old = %old_tag, new = %new_tag, "Node replaced")
            }
            Ok(TickOutcome::RelayRestored) => log::info!("Relay restored"),
            Err(e) => log::warn!(error = %e, "Poll tick failed"),
        }
        result
    }

    async fn poll_tick(&self) -> Result<TickOutcome> {
        let _guard = self.tick_lock.lock().await;
        let current = self.current()?;

        let node = self.panel.fetch_node().await?;
        let subscribers = self.panel.fetch_subscribers().await?;

        // A value equal to what is already live counts as unchanged
        let new_node = node.changed().filter(|n| *n != current.node);
        let new_subscribers = match subscribers.changed() {
            Some(records) => {
                check_unique(&records)?;
                Some(records).filter(|r| *r != current.subscribers)
            }
            None => None,
        };
        // A relay head without its relay keeps retrying until it has one
        let relay_missing = current.node.is_relay_head() && current.relay.is_none();
        if new_node.is_none() && new_subscribers.is_none() && !relay_missing {
            return Ok(TickOutcome::Unchanged);
        }

        let mut next = NodeState::clone(&current);
        let result = self
            .apply_changes(&mut next, new_node, new_subscribers)
            .await;
        self.state.send_replace(Some(Arc::new(next)));
        result
    }

    async fn apply_changes(
        &self,
        state: &mut NodeState,
        new_node: Option<NodeDescriptor>,
        new_subscribers: Option<Vec<SubscriberRecord>>,
    ) -> Result<TickOutcome> {
        // Build before touching anything live so a bad descriptor aborts cleanly
        let replacement: Option<(NodeDescriptor, Tag, NodeTopology)> = match new_node {
            Some(node) => {
                let tag = Tag::for_node(&node);
                let topology = self.lifecycle.build(&node, &tag)?;
                Some((node, tag, topology))
            }
            None => None,
        };
        let target_subscribers = new_subscribers
            .clone()
            .unwrap_or_else(|| state.subscribers.clone());

        // Relay failures never stop the remaining steps; the first is returned
        let mut relay_error: Option<NodeError> = None;

        // The relay sub-topology is rebuilt wholesale on every dirty tick
        if let Some(relay) = state.relay.take() {
            if let Err(e) = self.lifecycle.remove_relay(&relay).await {
                log::warn!(relay = %relay.relay_tag, error = %e, "Relay teardown failed");
                relay_error.get_or_insert(e);
            }
        }

        let (target_node, target_tag) = match &replacement {
            Some((node, tag, _)) => (node, tag),
            None => (&state.node, &state.tag),
        };
        if target_node.is_relay_head() {
            let applied = match self.panel.fetch_relay_node().await {
                Ok(relay) => {
                    self.lifecycle
                        .apply_relay(&relay, target_tag, &target_subscribers)
                        .await
                }
                Err(e) => Err(e),
            };
            match applied {
                Ok(relay) => state.relay = Some(relay),
                Err(e) => {
                    log::error!(error = %e, "Relay unavailable, retrying next tick");
                    relay_error.get_or_insert(e);
                }
            }
        }

        let outcome = match (replacement, new_subscribers) {
            (Some((node, tag, topology)), _) => {
                self.replace_node(state, node, tag, topology, target_subscribers)
                    .await
            }
            (None, Some(subscribers)) => self.update_subscribers(state, subscribers).await,
            (None, None) if state.relay.is_some() => Ok(TickOutcome::RelayRestored),
            (None, None) => Ok(TickOutcome::Unchanged),
        };
        match relay_error {
            Some(e) => {
                if let Err(later) = &outcome {
                    log::warn!(error = %later, "Node update failed after relay failure");
                }
                Err(e)
            }
            None => outcome,
        }
    }

    /// Full identity replacement: old tag down, new tag up with every subscriber
    async fn replace_node(
        &self,
        state: &mut NodeState,
        node: NodeDescriptor,
        tag: Tag,
        topology: NodeTopology,
        subscribers: Vec<SubscriberRecord>,
    ) -> Result<TickOutcome> {
        let old_tag = state.tag.clone();
        self.provisioner.retire(&old_tag, &state.subscribers);
        // Teardown is best-effort; whatever it left behind must not keep the
        // new identity from coming up
        let teardown = self.lifecycle.deactivate(&old_tag).await;
        if let Err(e) = &teardown {
            log::error!(tag = %old_tag, error = %e, "Old node not fully removed");
        }

        self.describe_node(&node);
        state.node = node;
        state.tag = tag.clone();
        state.subscribers = Vec::new();

        if let Err(e) = self.lifecycle.apply(&topology).await {
            log::error!(tag = %tag, error = %e, "Failed to stand up replacement node");
            self.restart.restart();
            return Err(e);
        }

        let added = self
            .provisioner
            .add_subscribers(&state.node, &tag, &subscribers)
            .await;
        let limiter = self
            .lifecycle
            .install_limiter(&tag, state.node.speed_limit, &subscribers)
            .await;
        added?;
        state.subscribers = subscribers;
        limiter?;
        teardown?;

        Ok(TickOutcome::NodeReplaced {
            old_tag,
            new_tag: tag,
        })
    }

    /// Apply exactly the subscriber delta; later steps still run after a failure
    async fn update_subscribers(
        &self,
        state: &mut NodeState,
        subscribers: Vec<SubscriberRecord>,
    ) -> Result<TickOutcome> {
        let changes = compare(Some(&state.subscribers), Some(&subscribers));
        let mut first_error: Option<NodeError> = None;
        let mut keep = |step: &str, result: Result<()>| {
            if let Err(e) = result {
                log::warn!(step = step, error = %e, "Subscriber update step failed");
                first_error.get_or_insert(e);
            }
        };

        let removed = self
            .provisioner
            .remove_subscribers(&state.tag, &changes.deleted)
            .await;
        keep("remove", removed.map(drop));

        let added = self
            .provisioner
            .add_subscribers(&state.node, &state.tag, &changes.added)
            .await;
        keep("add", added.map(drop));
        let limited = self
            .lifecycle
            .update_limiter(&state.tag, &changes.added)
            .await;
        keep("limit added", limited);

        let modified = self
            .provisioner
            .modify_subscribers(&state.node, &state.tag, &state.subscribers, &changes.modified)
            .await;
        keep("modify", modified.map(drop));
        let limited = self
            .lifecycle
            .update_limiter(&state.tag, &changes.modified)
            .await;
        keep("limit modified", limited);

        state.subscribers = subscribers;
        match first_error {
            Some(e) => Err(e),
            None => Ok(TickOutcome::SubscribersUpdated {
                deleted: changes.deleted.len(),
                added: changes.added.len(),
                modified: changes.modified.len(),
            }),
        }
    }

    /// Usage first, then online presence; a usage failure does not hold back presence
    async fn report(&self) -> Result<UsageReport> {
        let current = self.current()?;
        let usage = self
            .provisioner
            .report_usage(self.panel.as_ref(), &current.tag, &current.subscribers)
            .await;
        if let Err(e) = &usage {
            log::warn!(error = %e, "Failed to report traffic");
        }

        let online = self
            .provisioner
            .report_online_presence(self.panel.as_ref(), &current.tag)
            .await;
        if let Err(e) = &online {
            log::warn!(error = %e, "Failed to report online endpoints");
        }

        let report = usage?;
        online?;
        Ok(report)
    }

    async fn renew_cert(&self) -> Result<Option<RenewedCert>> {
        let current = self.current()?;
        let (Some(renewer), Some(tls)) = (&self.cert_renewer, current.node.tls()) else {
            return Ok(None);
        };
        let Some(challenge) = tls.cert_mode.challenge() else {
            return Ok(None);
        };

        match renewer.renew_cert(challenge, tls.domain()).await {
            Ok(cert) => {
                if cert.renewed {
                    log::info!(
                        domain = tls.domain(),
                        cert = %cert.cert_path.display(),
                        "Certificate renewed"
                    );
                } else {
                    log::debug!(domain = tls.domain(), "Certificate still valid");
                }
                Ok(Some(cert))
            }
            Err(e) => {
                log::warn!(domain = tls.domain(), error = %e, "Certificate renewal failed");
                Err(e)
            }
        }
    }
}

fn check_unique(records: &[SubscriberRecord]) -> Result<()> {
    match duplicate_id(records) {
        Some(id) => Err(NodeError::Api(format!(
            "subscriber snapshot lists id {} more than once",
            id
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::Fetched;
    use crate::core::model::{OnlineIp, RelayNodeDescriptor, Usage};
    use crate::dataplane::{MemoryDataPlane, MemoryLimiter};
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownPanel;

    #[async_trait]
    impl PanelApi for DownPanel {
        fn describe(&self) -> ClientInfo {
            ClientInfo {
                api_host: "https://panel.example.com".to_string(),
                node_id: 3,
            }
        }
        async fn fetch_node(&self) -> Result<Fetched<NodeDescriptor>> {
            Err(NodeError::Api("connection refused".to_string()))
        }
        async fn fetch_relay_node(&self) -> Result<RelayNodeDescriptor> {
            Err(NodeError::Api("connection refused".to_string()))
        }
        async fn fetch_subscribers(&self) -> Result<Fetched<Vec<SubscriberRecord>>> {
            Err(NodeError::Api("connection refused".to_string()))
        }
        async fn report_usage(&self, _usage: &[Usage]) -> Result<()> {
            Ok(())
        }
        async fn report_online(&self, _online: &[OnlineIp]) -> Result<()> {
            Ok(())
        }
    }

    fn builder() -> ControllerBuilder {
        Controller::builder()
            .panel(Arc::new(DownPanel))
            .data_plane(Arc::new(MemoryDataPlane::new()))
            .limiter(Arc::new(MemoryLimiter::new()))
            .restart(Arc::new(RestartSignal::new()))
    }

    #[test]
    fn test_log_prefix() {
        let info = ClientInfo {
            api_host: "https://panel.example.com".to_string(),
            node_id: 12,
        };
        assert_eq!(
            log_prefix(&info, "vless"),
            "[https://panel.example.com] vless(NodeID=12)"
        );
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Controller::builder()
            .panel(Arc::new(DownPanel))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::Config(_)));
        assert!(builder().build().is_ok());
    }

    #[tokio::test]
    async fn test_start_failure_schedules_nothing() {
        let mut controller = builder().build().unwrap();
        assert!(controller.start().await.is_err());
        assert_eq!(controller.task_count(), 0);
        assert!(controller.snapshot().is_none());
        assert!(controller.reconcile_now().await.is_err());
    }

    #[tokio::test]
    async fn test_restart_signal_keeps_early_request() {
        let signal = RestartSignal::new();
        signal.restart();
        tokio::time::timeout(Duration::from_secs(1), signal.requested())
            .await
            .unwrap();
    }
}
