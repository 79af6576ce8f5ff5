//! Node agent keeping a proxy data plane in sync with a remote panel
//!
//! Architecture:
//! - `core/`: Pure domain (descriptors, tags, diff, topology) and hook traits
//! - `business/`: Panel client, provisioning, lifecycle, controller, certificates
//! - `dataplane/`: In-process live registry, routing and rate limiting
//! - `config`, `logger`, `error`: CLI, tracing setup and error types

pub mod business;
pub mod config;
pub mod core;
pub mod dataplane;
pub mod error;
pub mod logger;
