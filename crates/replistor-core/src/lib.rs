//! Replistor Core - Fundamental types for the Replistor storage driver
//!
//! This crate provides:
//! - Volume and snapshot records handed over by the orchestrator
//! - The typed backend property map and its reserved system-id key
//! - Capacity conversion between system and backend units
//! - Driver configuration
//! - Error types with miette diagnostics

pub mod capacity;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use capacity::{to_backend_units, to_system_units, KIB_PER_GIB};
pub use config::{DriverConfig, ReconnectPolicy, ResizeMode};
pub use error::{DriverError, Result};
pub use types::{Properties, SnapshotRecord, SnapshotReference, VolumeRecord, SYSTEM_ID_KEY};
