//! Business logic implementations
//!
//! This module contains the stateful side of the node agent:
//! - Panel API client
//! - Subscriber provisioning and usage reporting
//! - Node lifecycle (stand up, tear down, relay)
//! - Reconciliation controller and its periodic tasks
//! - Certificate renewal

pub mod api;
mod cert;
mod controller;
mod lifecycle;
mod provisioner;
mod tasks;

pub use api::{PanelClient, PanelConfig};
pub use cert::CommandCertRenewer;
pub use controller::{
    log_prefix, Controller, ControllerBuilder, NodeState, RestartSignal, TickOutcome,
};
pub use lifecycle::{NodeLifecycle, RelayState};
pub use provisioner::{SubscriberProvisioner, UsageReport};
pub use tasks::TaskManager;
