//! Wire vocabulary of the backend control plane.
//!
//! Every call is a [`BackendRequest`] and every answer a [`CallReply`]: a list
//! of [`CallResult`] statuses plus a payload list. Payload entries must not be
//! trusted until the statuses have been checked with [`CallReply::check`].

use replistor_core::{DriverError, Properties, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Text query command resolving the local device path of a volume
pub const TQ_GET_PATH: &str = "get_path";

/// Serial value meaning "apply regardless of the backend's change serial"
pub const ANY_SERIAL: i64 = -1;

/// Status code of a single call result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum StatusCode {
    Success,
    AlreadyExists,
    NotFound,
    GenericError,
    /// Any other backend failure code, kept verbatim
    Other(i32),
}

impl StatusCode {
    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::GenericError => "GENERIC_ERROR",
            StatusCode::Other(_) => "UNCLASSIFIED",
        }
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        match code {
            0 => StatusCode::Success,
            1 => StatusCode::AlreadyExists,
            2 => StatusCode::NotFound,
            1000 => StatusCode::GenericError,
            other => StatusCode::Other(other),
        }
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        match status {
            StatusCode::Success => 0,
            StatusCode::AlreadyExists => 1,
            StatusCode::NotFound => 2,
            StatusCode::GenericError => 1000,
            StatusCode::Other(code) => code,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Other(code) => write!(f, "{}({})", self.as_str(), code),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// Outcome of one backend step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResult {
    pub status: StatusCode,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl CallResult {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn ack() -> Self {
        Self::new(StatusCode::Success, "ack")
    }
}

/// Volumes of one backend resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVolumes {
    pub resource: String,
    pub properties: Properties,
    pub volumes: Vec<VolumeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub number: u32,
    pub size_kib: u64,
    pub properties: Properties,
}

/// Deployment of a resource on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentEntry {
    pub node: String,
    pub resource: String,
    pub properties: Properties,
}

/// Snapshots of one backend resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshots {
    pub resource: String,
    pub snapshots: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub name: String,
    pub properties: Properties,
}

/// Cluster capacity for a given redundancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityEntry {
    pub free_kib: u64,
    pub total_kib: u64,
}

/// One element of a reply payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PayloadEntry {
    Volumes(ResourceVolumes),
    Assignment(AssignmentEntry),
    Snapshots(ResourceSnapshots),
    Capacity(CapacityEntry),
    Text(String),
}

/// A request to the backend control plane, tagged by operation name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum BackendRequest {
    CreateResource {
        resource: String,
        properties: Properties,
    },
    RemoveResource {
        resource: String,
        force: bool,
    },
    CreateVolume {
        resource: String,
        size_kib: u64,
        properties: Properties,
    },
    /// `relative` selects between a signed delta and a full replacement size
    ResizeVolume {
        resource: String,
        volume_nr: u32,
        serial: i64,
        size_kib: i64,
        relative: bool,
    },
    RemoveVolume {
        resource: String,
        volume_nr: u32,
        force: bool,
    },
    ListVolumes {
        resource: Option<String>,
        filter: Properties,
    },
    AutoDeploy {
        resource: String,
        redundancy: u32,
        delta: i32,
        site_clients: bool,
    },
    ListAssignments {
        resource: Option<String>,
        filter: Properties,
    },
    TextQuery {
        command: Vec<String>,
    },
    CreateSnapshot {
        resource: String,
        snapshot: String,
        nodes: Vec<String>,
        properties: Properties,
    },
    ListSnapshots {
        resource: Option<String>,
        snapshot: Option<String>,
        filter: Properties,
    },
    RemoveSnapshot {
        resource: String,
        snapshot: String,
        force: bool,
    },
    RestoreSnapshot {
        resource: String,
        source_resource: String,
        snapshot: String,
        size_kib: u64,
        resource_properties: Properties,
        volume_properties: Properties,
    },
    ModifySnapshot {
        resource: String,
        snapshot: String,
        properties: Properties,
    },
    ClusterFreeQuery {
        redundancy: u32,
    },
}

impl BackendRequest {
    /// Operation name as it appears on the wire
    pub fn operation(&self) -> &'static str {
        match self {
            BackendRequest::CreateResource { .. } => "create_resource",
            BackendRequest::RemoveResource { .. } => "remove_resource",
            BackendRequest::CreateVolume { .. } => "create_volume",
            BackendRequest::ResizeVolume { .. } => "resize_volume",
            BackendRequest::RemoveVolume { .. } => "remove_volume",
            BackendRequest::ListVolumes { .. } => "list_volumes",
            BackendRequest::AutoDeploy { .. } => "auto_deploy",
            BackendRequest::ListAssignments { .. } => "list_assignments",
            BackendRequest::TextQuery { .. } => "text_query",
            BackendRequest::CreateSnapshot { .. } => "create_snapshot",
            BackendRequest::ListSnapshots { .. } => "list_snapshots",
            BackendRequest::RemoveSnapshot { .. } => "remove_snapshot",
            BackendRequest::RestoreSnapshot { .. } => "restore_snapshot",
            BackendRequest::ModifySnapshot { .. } => "modify_snapshot",
            BackendRequest::ClusterFreeQuery { .. } => "cluster_free_query",
        }
    }

    /// Kind and name of the object a failure `status` refers to
    fn subject(&self, status: StatusCode) -> (&'static str, String) {
        match self {
            BackendRequest::CreateResource { resource, .. }
            | BackendRequest::RemoveResource { resource, .. }
            | BackendRequest::CreateVolume { resource, .. }
            | BackendRequest::AutoDeploy { resource, .. } => ("resource", resource.clone()),
            BackendRequest::ResizeVolume {
                resource,
                volume_nr,
                ..
            }
            | BackendRequest::RemoveVolume {
                resource,
                volume_nr,
                ..
            } => ("volume", format!("{}/{}", resource, volume_nr)),
            BackendRequest::ListVolumes { resource, .. }
            | BackendRequest::ListAssignments { resource, .. } => {
                ("resource", resource.clone().unwrap_or_default())
            }
            BackendRequest::TextQuery { command } => {
                ("resource", command.get(1).cloned().unwrap_or_default())
            }
            BackendRequest::CreateSnapshot {
                resource, snapshot, ..
            }
            | BackendRequest::RemoveSnapshot {
                resource, snapshot, ..
            }
            | BackendRequest::ModifySnapshot {
                resource, snapshot, ..
            } => ("snapshot", format!("{}/{}", resource, snapshot)),
            BackendRequest::ListSnapshots {
                resource, snapshot, ..
            } => (
                "snapshot",
                format!(
                    "{}/{}",
                    resource.as_deref().unwrap_or("*"),
                    snapshot.as_deref().unwrap_or("*")
                ),
            ),
            // The restore target may already exist; its source may be missing
            BackendRequest::RestoreSnapshot {
                resource,
                source_resource,
                snapshot,
                ..
            } => match status {
                StatusCode::NotFound => ("snapshot", format!("{}/{}", source_resource, snapshot)),
                _ => ("resource", resource.clone()),
            },
            BackendRequest::ClusterFreeQuery { .. } => ("cluster", String::new()),
        }
    }
}

/// Statuses and payload returned by one backend call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReply {
    pub results: Vec<CallResult>,
    #[serde(default)]
    pub payload: Vec<PayloadEntry>,
}

impl CallReply {
    pub fn new(results: Vec<CallResult>, payload: Vec<PayloadEntry>) -> Self {
        Self { results, payload }
    }

    /// Reply carrying a single status and no payload
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(vec![CallResult::new(status, message)], Vec::new())
    }

    /// Inspect every result of the reply to `request`.
    ///
    /// Returns `Success` when all results succeeded, or the first failure
    /// status listed in `tolerated`. An untolerated ALREADY_EXISTS or
    /// NOT_FOUND becomes the matching typed error; any other failure becomes
    /// a `GenericError` carrying the backend message and details.
    pub fn check(
        &self,
        request: &BackendRequest,
        tolerated: &[StatusCode],
    ) -> Result<StatusCode> {
        let operation = request.operation();
        if self.results.is_empty() {
            return Err(DriverError::inconsistency(format!(
                "backend returned no status for '{}'",
                operation
            )));
        }

        let mut outcome = StatusCode::Success;
        for result in &self.results {
            if result.status.is_success() {
                continue;
            }
            if tolerated.contains(&result.status) {
                if outcome.is_success() {
                    outcome = result.status;
                }
                continue;
            }
            return Err(match result.status {
                StatusCode::AlreadyExists => {
                    DriverError::already_exists(request.subject(result.status).1)
                }
                StatusCode::NotFound => {
                    let (kind, id) = request.subject(result.status);
                    DriverError::not_found(kind, id)
                }
                status => DriverError::generic(
                    operation,
                    status.to_string(),
                    &result.message,
                    &result.details,
                ),
            });
        }
        Ok(outcome)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &ResourceVolumes> {
        self.payload.iter().filter_map(|p| match p {
            PayloadEntry::Volumes(v) => Some(v),
            _ => None,
        })
    }

    pub fn assignments(&self) -> impl Iterator<Item = &AssignmentEntry> {
        self.payload.iter().filter_map(|p| match p {
            PayloadEntry::Assignment(a) => Some(a),
            _ => None,
        })
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ResourceSnapshots> {
        self.payload.iter().filter_map(|p| match p {
            PayloadEntry::Snapshots(s) => Some(s),
            _ => None,
        })
    }

    pub fn capacity(&self) -> Option<CapacityEntry> {
        self.payload.iter().find_map(|p| match p {
            PayloadEntry::Capacity(c) => Some(*c),
            _ => None,
        })
    }

    pub fn text(&self) -> Option<&str> {
        self.payload.iter().find_map(|p| match p {
            PayloadEntry::Text(t) => Some(t.as_str()),
            _ => None,
        })
    }
}
