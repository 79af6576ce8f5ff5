//! In-process data plane
//!
//! This module contains the live registries the reconciler drives:
//! - Listener, outbound, routing-rule and credential registry
//! - Route resolution for an embedded proxy engine
//! - Per-credential traffic counters
//! - Per-tag rate limiter and online-endpoint tracking

mod limiter;
mod registry;
pub mod routing;
mod stats;

pub use limiter::{effective_rate, Admission, MemoryLimiter, Throttle};
pub use registry::MemoryDataPlane;
pub use routing::Flow;
pub use stats::{CredentialStats, TrafficStats};

use sha2::{Digest, Sha224};

/// Hash password using SHA224
fn hash_password(password: &str) -> [u8; 28] {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 28];
    hash.copy_from_slice(&result);
    hash
}

/// Convert a trojan password to its hex token (56 bytes)
pub fn password_to_hex(password: &str) -> [u8; 56] {
    let hash = hash_password(password);
    let hex_string = hex::encode(hash);
    let mut hex_bytes: [u8; 56] = [0u8; 56];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}
