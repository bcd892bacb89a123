//! Replistor Driver - Volume lifecycle against a replicated block-storage backend
//!
//! The driver layers three pieces:
//! - `transport`: the backend call channel with transparent reconnect-and-retry
//! - `naming`: system-id to backend-name mapping and property-based reverse lookup
//! - `driver`: the volume and snapshot operations the orchestrator invokes
//!
//! `MockBackend` stands in for a control plane in tests.

pub mod driver;
pub mod mock;
pub mod naming;
pub mod protocol;
pub mod transport;

// Re-export primary types
pub use driver::{VolumeDriver, VolumeStats};
pub use mock::MockBackend;
pub use naming::{BackendSnapshot, BackendVolume, ResourceNaming};
pub use protocol::{BackendRequest, CallReply, CallResult, PayloadEntry, StatusCode};
pub use transport::{BackendTransport, Connection, Connector, HttpConnector};
