//! Core reconciliation domain
//!
//! This module contains the pure side of the node agent:
//! - Node and subscriber descriptors
//! - Tag derivation
//! - Subscriber snapshot diffing
//! - Topology building
//! - Hook traits for the collaborators the controller drives

pub mod diff;
pub mod hooks;
pub mod model;
pub mod tag;
pub mod topology;

pub use diff::{compare, ChangeSet};
pub use hooks::{
    Authenticator, CertRenewer, ClientInfo, DataPlane, Fetched, LimiterRegistry, PanelApi,
    RenewedCert, Restart, TrafficCounters, TrafficRecorder,
};
pub use model::{
    NodeDescriptor, NodeId, OnlineIp, Protocol, RelayNodeDescriptor, Security, SubscriberId,
    SubscriberRecord, Transport, Usage,
};
pub use tag::Tag;
