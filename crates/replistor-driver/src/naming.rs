use crate::protocol::{BackendRequest, StatusCode};
use crate::transport::BackendTransport;
use replistor_core::{DriverError, Properties, Result};
use std::sync::Arc;
use tracing::debug;

/// A backend volume resolved from a system identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendVolume {
    pub resource: String,
    pub volume_nr: u32,
    pub size_kib: u64,
    pub properties: Properties,
}

/// A backend snapshot resolved from a system identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub resource: String,
    pub snapshot: String,
    pub properties: Properties,
}

/// Maps system identifiers to backend names and resolves them back
///
/// Lookups always query the backend; nothing is cached, since resources may
/// change out-of-band.
pub struct ResourceNaming {
    transport: Arc<BackendTransport>,
    resource_prefix: String,
    snapshot_prefix: String,
}

impl ResourceNaming {
    pub fn new(
        transport: Arc<BackendTransport>,
        resource_prefix: impl Into<String>,
        snapshot_prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            resource_prefix: resource_prefix.into(),
            snapshot_prefix: snapshot_prefix.into(),
        }
    }

    /// Backend resource name for a volume id
    pub fn resource_name(&self, volume_id: &str) -> String {
        format!("{}{}", self.resource_prefix, volume_id)
    }

    /// Backend snapshot name for a snapshot id
    pub fn snapshot_name(&self, snapshot_id: &str) -> String {
        format!("{}{}", self.snapshot_prefix, snapshot_id)
    }

    /// Find the backend volume tagged with `volume_id`.
    ///
    /// `None` when the backend reports NOT_FOUND or returns no match; more
    /// than one match is a `DriverInconsistency`.
    pub async fn find_volume(&self, volume_id: &str) -> Result<Option<BackendVolume>> {
        let request = BackendRequest::ListVolumes {
            resource: None,
            filter: Properties::for_system_id(volume_id),
        };
        let (status, reply) = self
            .transport
            .call_checked(&request, &[StatusCode::NotFound])
            .await?;
        if status == StatusCode::NotFound {
            debug!("No backend volume for {}", volume_id);
            return Ok(None);
        }

        let matches: Vec<BackendVolume> = reply
            .volumes()
            .flat_map(|res| {
                res.volumes.iter().map(|vol| BackendVolume {
                    resource: res.resource.clone(),
                    volume_nr: vol.number,
                    size_kib: vol.size_kib,
                    properties: vol.properties.clone(),
                })
            })
            .collect();

        single_match(matches, "volume", volume_id)
    }

    /// Find the backend snapshot tagged with `snapshot_id`, scoped to the
    /// backend `resource` when given.
    ///
    /// The scope must be the resource the source volume actually lives in,
    /// as resolved by `find_volume`; it need not be `resource_name` of the
    /// volume id.
    pub async fn find_snapshot(
        &self,
        resource: Option<&str>,
        snapshot_id: &str,
    ) -> Result<Option<BackendSnapshot>> {
        let request = BackendRequest::ListSnapshots {
            resource: resource.map(str::to_string),
            snapshot: None,
            filter: Properties::for_system_id(snapshot_id),
        };
        self.query_snapshot(&request, snapshot_id).await
    }

    /// Find a snapshot by its backend names, regardless of its properties
    pub async fn find_snapshot_by_name(
        &self,
        resource: &str,
        snapshot: &str,
    ) -> Result<Option<BackendSnapshot>> {
        let request = BackendRequest::ListSnapshots {
            resource: Some(resource.to_string()),
            snapshot: Some(snapshot.to_string()),
            filter: Properties::new(),
        };
        self.query_snapshot(&request, &format!("{}/{}", resource, snapshot))
            .await
    }

    /// Nodes the resource is currently deployed on
    pub async fn find_assignments(&self, resource: &str) -> Result<Vec<String>> {
        let request = BackendRequest::ListAssignments {
            resource: Some(resource.to_string()),
            filter: Properties::new(),
        };
        let (status, reply) = self
            .transport
            .call_checked(&request, &[StatusCode::NotFound])
            .await?;
        if status == StatusCode::NotFound {
            return Ok(Vec::new());
        }
        Ok(reply.assignments().map(|a| a.node.clone()).collect())
    }

    async fn query_snapshot(
        &self,
        request: &BackendRequest,
        label: &str,
    ) -> Result<Option<BackendSnapshot>> {
        let (status, reply) = self
            .transport
            .call_checked(request, &[StatusCode::NotFound])
            .await?;
        if status == StatusCode::NotFound {
            debug!("No backend snapshot for {}", label);
            return Ok(None);
        }

        let matches: Vec<BackendSnapshot> = reply
            .snapshots()
            .flat_map(|res| {
                res.snapshots.iter().map(|snap| BackendSnapshot {
                    resource: res.resource.clone(),
                    snapshot: snap.name.clone(),
                    properties: snap.properties.clone(),
                })
            })
            .collect();

        single_match(matches, "snapshot", label)
    }
}

fn single_match<T>(mut matches: Vec<T>, kind: &str, id: &str) -> Result<Option<T>> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.pop()),
        n => Err(DriverError::inconsistency(format!(
            "{} backend {}s carry system id {}",
            n, kind, id
        ))),
    }
}
