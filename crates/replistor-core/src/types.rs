use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved property key carrying the system identifier on backend resources.
///
/// The backend must return it verbatim on read-back; reverse lookup depends
/// on it.
pub const SYSTEM_ID_KEY: &str = "system-id";

/// Volume record owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    /// Stable system identifier
    pub id: String,
    pub project_id: String,
    pub display_name: String,
    /// Size in GiB
    pub size: u64,
    /// Backend resource name, once provisioned
    pub backend_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VolumeRecord {
    /// Create a record for a volume that is not yet provisioned
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            project_id: String::new(),
            display_name: String::new(),
            size,
            backend_ref: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// Snapshot record owned by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    /// Source volume system identifier
    pub volume_id: String,
    pub backend_ref: Option<String>,
}

impl SnapshotRecord {
    pub fn new(id: impl Into<String>, volume_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            volume_id: volume_id.into(),
            backend_ref: None,
        }
    }
}

/// Reference to an untracked backend snapshot, as passed to "manage existing"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReference {
    /// Backend resource the snapshot belongs to
    pub resource: String,
    /// Backend snapshot name
    pub snapshot: String,
}

/// Typed backend property bag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Property bag holding only the system identifier
    pub fn for_system_id(id: impl Into<String>) -> Self {
        let mut props = Self::new();
        props.set_system_id(id);
        props
    }

    pub fn system_id(&self) -> Option<&str> {
        self.get(SYSTEM_ID_KEY)
    }

    pub fn set_system_id(&mut self, id: impl Into<String>) {
        self.0.insert(SYSTEM_ID_KEY.to_string(), id.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every entry of `filter` is present with the same value
    pub fn matches(&self, filter: &Properties) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).is_some_and(|own| own == v))
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", pairs.join(", "))
    }
}
