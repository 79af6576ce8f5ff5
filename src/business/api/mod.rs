//! Remote panel API integration
//!
//! This module handles:
//! - Conditional node and subscriber fetches (ETag / 304)
//! - Relay node lookup
//! - Traffic and online-endpoint reporting

mod client;
pub mod models;

pub use client::{PanelClient, PanelConfig};
