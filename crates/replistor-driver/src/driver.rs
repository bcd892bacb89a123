use crate::naming::{BackendSnapshot, BackendVolume, ResourceNaming};
use crate::protocol::{BackendRequest, StatusCode, ANY_SERIAL, TQ_GET_PATH};
use crate::transport::{BackendTransport, Connector};
use replistor_core::capacity::backend_delta;
use replistor_core::{
    to_backend_units, DriverConfig, DriverError, Properties, ResizeMode, Result, SnapshotRecord,
    SnapshotReference, VolumeRecord, KIB_PER_GIB,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity and identity report for the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeStats {
    pub backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gib: u64,
    pub free_capacity_gib: u64,
    pub reserved_percentage: u8,
}

/// Storage backend driver
///
/// Each lifecycle operation is an ordered sequence of backend calls. Steps
/// are idempotent by lookup where possible, but no operation is
/// transactional: a failure partway leaves backend state for the caller to
/// retry or clean up with the same operations. The driver keeps no backend
/// state between calls and takes no locks across volumes.
pub struct VolumeDriver {
    config: DriverConfig,
    transport: Arc<BackendTransport>,
    naming: ResourceNaming,
}

impl VolumeDriver {
    pub fn new(config: DriverConfig, connector: Arc<dyn Connector>) -> Self {
        let transport = Arc::new(BackendTransport::new(connector, config.reconnect.clone()));
        let naming = ResourceNaming::new(
            transport.clone(),
            config.resource_prefix.clone(),
            config.snapshot_prefix.clone(),
        );
        Self {
            config,
            transport,
            naming,
        }
    }

    pub fn naming(&self) -> &ResourceNaming {
        &self.naming
    }

    /// Validate configuration and connect to the backend
    pub async fn setup(&self) -> Result<()> {
        self.config.validate()?;
        self.transport.connect().await?;
        info!(
            "Driver ready (endpoint: {}, redundancy: {})",
            self.config.endpoint, self.config.redundancy
        );
        Ok(())
    }

    /// Create resource → create volume → deploy. Returns the resource name.
    ///
    /// An existing resource container is reused, and a volume already tagged
    /// with the id is only deployed again, so a retry after a partial failure
    /// converges. Earlier steps are not rolled back when a later one fails.
    pub async fn create_volume(&self, volume: &VolumeRecord) -> Result<String> {
        let size_kib = to_backend_units(volume.size)?;
        if let Some(existing) = self.naming.find_volume(&volume.id).await? {
            info!(
                "Volume {} already exists in {}, resuming deploy",
                volume.id, existing.resource
            );
            self.deploy(&existing.resource).await?;
            return Ok(existing.resource);
        }

        let resource = self.naming.resource_name(&volume.id);
        info!(
            "Creating volume {} as {} ({} KiB)",
            volume.id, resource, size_kib
        );

        let (status, _) = self
            .transport
            .call_checked(
                &BackendRequest::CreateResource {
                    resource: resource.clone(),
                    properties: Properties::for_system_id(&volume.id),
                },
                &[StatusCode::AlreadyExists],
            )
            .await?;
        if status == StatusCode::AlreadyExists {
            debug!("Resource {} already exists, reusing it", resource);
        }

        self.transport
            .call_checked(
                &BackendRequest::CreateVolume {
                    resource: resource.clone(),
                    size_kib,
                    properties: Properties::for_system_id(&volume.id),
                },
                &[],
            )
            .await?;

        self.deploy(&resource).await?;
        info!("Volume {} created", volume.id);
        Ok(resource)
    }

    /// Remove the backend volume, and its resource once empty.
    ///
    /// Deleting a volume the backend does not know succeeds.
    pub async fn delete_volume(&self, volume: &VolumeRecord) -> Result<()> {
        let Some(found) = self.naming.find_volume(&volume.id).await? else {
            info!("Volume {} not on backend, nothing to delete", volume.id);
            return Ok(());
        };
        info!("Deleting volume {} ({})", volume.id, found.resource);

        self.transport
            .call_checked(
                &BackendRequest::RemoveVolume {
                    resource: found.resource.clone(),
                    volume_nr: found.volume_nr,
                    force: true,
                },
                &[StatusCode::NotFound],
            )
            .await?;

        let (status, reply) = self
            .transport
            .call_checked(
                &BackendRequest::ListVolumes {
                    resource: Some(found.resource.clone()),
                    filter: Properties::new(),
                },
                &[StatusCode::NotFound],
            )
            .await?;
        if status == StatusCode::NotFound {
            return Ok(());
        }

        let remaining: usize = reply.volumes().map(|r| r.volumes.len()).sum();
        if remaining == 0 {
            self.transport
                .call_checked(
                    &BackendRequest::RemoveResource {
                        resource: found.resource.clone(),
                        force: true,
                    },
                    &[StatusCode::NotFound],
                )
                .await?;
            debug!("Removed empty resource {}", found.resource);
        } else {
            debug!(
                "Resource {} keeps {} other volume(s)",
                found.resource, remaining
            );
        }
        Ok(())
    }

    /// Grow (or, when allowed, shrink) a volume to `new_size` GiB
    pub async fn extend_volume(&self, volume: &VolumeRecord, new_size: u64) -> Result<()> {
        let delta = backend_delta(volume.size, new_size)?;
        if delta < 0 && !self.config.allow_shrink {
            return Err(DriverError::invalid_operation(
                format!(
                    "cannot shrink volume {} from {} to {} GiB",
                    volume.id, volume.size, new_size
                ),
                "Shrinking is disabled; set 'allow_shrink' if the backend supports it",
            ));
        }
        if delta == 0 {
            debug!("Volume {} already {} GiB", volume.id, new_size);
            return Ok(());
        }

        let found = self.require_volume(&volume.id).await?;
        let (size_kib, relative) = match self.config.resize_mode {
            ResizeMode::Relative => (delta, true),
            ResizeMode::Absolute => {
                let absolute = to_backend_units(new_size)?;
                let absolute =
                    i64::try_from(absolute).map_err(|_| DriverError::invalid_size(new_size))?;
                (absolute, false)
            }
        };
        info!(
            "Resizing volume {} from {} to {} GiB",
            volume.id, volume.size, new_size
        );

        self.transport
            .call_checked(
                &BackendRequest::ResizeVolume {
                    resource: found.resource,
                    volume_nr: found.volume_nr,
                    serial: ANY_SERIAL,
                    size_kib,
                    relative,
                },
                &[],
            )
            .await?;
        Ok(())
    }

    /// Device path reported by the backend for a volume
    pub async fn local_path(&self, volume: &VolumeRecord) -> Result<String> {
        let found = self.require_volume(&volume.id).await?;
        let (_, reply) = self
            .transport
            .call_checked(
                &BackendRequest::TextQuery {
                    command: vec![
                        TQ_GET_PATH.to_string(),
                        found.resource.clone(),
                        found.volume_nr.to_string(),
                    ],
                },
                &[],
            )
            .await?;

        match reply.text() {
            Some(path) if !path.is_empty() => Ok(path.to_string()),
            _ => Err(DriverError::inconsistency(format!(
                "backend returned no device path for {}",
                found.resource
            ))),
        }
    }

    /// Snapshot the source volume on every node it is deployed on.
    /// Returns the backend snapshot name.
    pub async fn create_snapshot(&self, snapshot: &SnapshotRecord) -> Result<String> {
        let found = self.require_volume(&snapshot.volume_id).await?;
        let nodes = self.deployed_nodes(&found.resource).await?;
        let name = self.naming.snapshot_name(&snapshot.id);
        info!(
            "Creating snapshot {} of {} on {} node(s)",
            name,
            found.resource,
            nodes.len()
        );

        self.transport
            .call_checked(
                &BackendRequest::CreateSnapshot {
                    resource: found.resource,
                    snapshot: name.clone(),
                    nodes,
                    properties: Properties::for_system_id(&snapshot.id),
                },
                &[],
            )
            .await?;
        Ok(name)
    }

    /// Remove a snapshot. Deleting a snapshot the backend does not know
    /// succeeds.
    pub async fn delete_snapshot(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let Some(found) = self.locate_snapshot(snapshot).await? else {
            info!("Snapshot {} not on backend, nothing to delete", snapshot.id);
            return Ok(());
        };
        self.remove_snapshot(&found).await
    }

    /// Restore a snapshot into a new volume. Returns the new resource name.
    pub async fn create_volume_from_snapshot(
        &self,
        volume: &VolumeRecord,
        snapshot: &SnapshotRecord,
    ) -> Result<String> {
        let size_kib = to_backend_units(volume.size)?;
        let found = self
            .locate_snapshot(snapshot)
            .await?
            .ok_or_else(|| DriverError::not_found("snapshot", &snapshot.id))?;
        self.restore(volume, &found, size_kib).await
    }

    /// Clone via a transient snapshot: snapshot → restore → remove snapshot.
    ///
    /// Once the transient snapshot exists its removal is always attempted,
    /// also when the restore fails. A failed removal is logged and never
    /// replaces the outcome of the restore.
    pub async fn create_cloned_volume(
        &self,
        volume: &VolumeRecord,
        source: &VolumeRecord,
    ) -> Result<String> {
        if volume.size < source.size {
            return Err(DriverError::invalid_operation(
                format!(
                    "clone {} ({} GiB) is smaller than source {} ({} GiB)",
                    volume.id, volume.size, source.id, source.size
                ),
                "Request a clone at least as large as its source",
            ));
        }
        let size_kib = to_backend_units(volume.size)?;
        let found = self.require_volume(&source.id).await?;
        let nodes = self.deployed_nodes(&found.resource).await?;

        let transient_id = Uuid::new_v4().to_string();
        let transient_name = self.naming.snapshot_name(&transient_id);
        info!(
            "Cloning {} into {} via transient snapshot {}",
            source.id, volume.id, transient_name
        );

        self.transport
            .call_checked(
                &BackendRequest::CreateSnapshot {
                    resource: found.resource.clone(),
                    snapshot: transient_name,
                    nodes,
                    properties: Properties::for_system_id(&transient_id),
                },
                &[],
            )
            .await?;

        let outcome = self
            .restore_transient(volume, &found.resource, &transient_id, size_kib)
            .await;
        self.cleanup_transient(&found.resource, &transient_id).await;
        outcome
    }

    /// Take over an untracked backend snapshot by tagging it with the
    /// snapshot record's id. Returns the backend snapshot name.
    pub async fn manage_existing_snapshot(
        &self,
        snapshot: &SnapshotRecord,
        reference: &SnapshotReference,
    ) -> Result<String> {
        let volume = self.require_volume(&snapshot.volume_id).await?;
        if volume.resource != reference.resource {
            return Err(DriverError::invalid_operation(
                format!(
                    "snapshot reference {}/{} does not belong to volume {}",
                    reference.resource, reference.snapshot, snapshot.volume_id
                ),
                format!("Reference a snapshot of resource {}", volume.resource),
            ));
        }

        let found = self
            .naming
            .find_snapshot_by_name(&reference.resource, &reference.snapshot)
            .await?
            .ok_or_else(|| {
                DriverError::not_found(
                    "snapshot",
                    format!("{}/{}", reference.resource, reference.snapshot),
                )
            })?;
        if let Some(owner) = found.properties.system_id() {
            if owner != snapshot.id {
                return Err(DriverError::invalid_operation(
                    format!("snapshot {} is already managed as {}", found.snapshot, owner),
                    "Unmanage or delete the existing snapshot record first",
                ));
            }
        }

        info!("Managing snapshot {} as {}", found.snapshot, snapshot.id);
        self.transport
            .call_checked(
                &BackendRequest::ModifySnapshot {
                    resource: found.resource,
                    snapshot: found.snapshot.clone(),
                    properties: Properties::for_system_id(&snapshot.id),
                },
                &[],
            )
            .await?;
        Ok(found.snapshot)
    }

    /// Report capacity for the configured redundancy
    pub async fn volume_stats(&self) -> Result<VolumeStats> {
        let (_, reply) = self
            .transport
            .call_checked(
                &BackendRequest::ClusterFreeQuery {
                    redundancy: self.config.redundancy,
                },
                &[],
            )
            .await?;
        let capacity = reply
            .capacity()
            .ok_or_else(|| DriverError::inconsistency("backend returned no capacity"))?;

        Ok(VolumeStats {
            backend_name: self.config.backend_name.clone(),
            vendor_name: "Replistor".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            storage_protocol: "local".to_string(),
            total_capacity_gib: capacity.total_kib / KIB_PER_GIB,
            free_capacity_gib: capacity.free_kib / KIB_PER_GIB,
            reserved_percentage: self.config.reserved_percentage,
        })
    }

    async fn require_volume(&self, volume_id: &str) -> Result<BackendVolume> {
        self.naming
            .find_volume(volume_id)
            .await?
            .ok_or_else(|| DriverError::not_found("volume", volume_id))
    }

    /// Resolve a snapshot record within the resource its volume lives in.
    /// Falls back to an unscoped lookup when the volume is gone.
    async fn locate_snapshot(
        &self,
        snapshot: &SnapshotRecord,
    ) -> Result<Option<BackendSnapshot>> {
        let volume = self.naming.find_volume(&snapshot.volume_id).await?;
        let scope = volume.as_ref().map(|v| v.resource.as_str());
        self.naming.find_snapshot(scope, &snapshot.id).await
    }

    async fn deployed_nodes(&self, resource: &str) -> Result<Vec<String>> {
        let nodes = self.naming.find_assignments(resource).await?;
        if nodes.is_empty() {
            return Err(DriverError::inconsistency(format!(
                "resource {} is not deployed on any node",
                resource
            )));
        }
        Ok(nodes)
    }

    async fn deploy(&self, resource: &str) -> Result<()> {
        self.transport
            .call_checked(
                &BackendRequest::AutoDeploy {
                    resource: resource.to_string(),
                    redundancy: self.config.redundancy,
                    delta: 0,
                    site_clients: false,
                },
                &[],
            )
            .await?;
        Ok(())
    }

    async fn restore(
        &self,
        volume: &VolumeRecord,
        snapshot: &BackendSnapshot,
        size_kib: u64,
    ) -> Result<String> {
        let resource = self.naming.resource_name(&volume.id);
        info!(
            "Restoring {}/{} into {}",
            snapshot.resource, snapshot.snapshot, resource
        );
        self.transport
            .call_checked(
                &BackendRequest::RestoreSnapshot {
                    resource: resource.clone(),
                    source_resource: snapshot.resource.clone(),
                    snapshot: snapshot.snapshot.clone(),
                    size_kib,
                    resource_properties: Properties::for_system_id(&volume.id),
                    volume_properties: Properties::for_system_id(&volume.id),
                },
                &[],
            )
            .await?;
        Ok(resource)
    }

    async fn restore_transient(
        &self,
        volume: &VolumeRecord,
        source_resource: &str,
        transient_id: &str,
        size_kib: u64,
    ) -> Result<String> {
        let snapshot = self
            .naming
            .find_snapshot(Some(source_resource), transient_id)
            .await?
            .ok_or_else(|| {
                DriverError::inconsistency(format!(
                    "transient snapshot {} vanished before restore",
                    transient_id
                ))
            })?;
        self.restore(volume, &snapshot, size_kib).await
    }

    async fn cleanup_transient(&self, source_resource: &str, transient_id: &str) {
        let lookup = self
            .naming
            .find_snapshot(Some(source_resource), transient_id)
            .await;
        let result = match lookup {
            Ok(Some(snapshot)) => self.remove_snapshot(&snapshot).await,
            Ok(None) => {
                warn!("Transient snapshot {} already gone", transient_id);
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(
                "Failed to remove transient snapshot {}: {}",
                transient_id, e
            );
        }
    }

    async fn remove_snapshot(&self, snapshot: &BackendSnapshot) -> Result<()> {
        info!(
            "Removing snapshot {}/{}",
            snapshot.resource, snapshot.snapshot
        );
        self.transport
            .call_checked(
                &BackendRequest::RemoveSnapshot {
                    resource: snapshot.resource.clone(),
                    snapshot: snapshot.snapshot.clone(),
                    force: true,
                },
                &[StatusCode::NotFound],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    const VOL_ID: &str = "ba253fd0-8068-11e4-98c0-5254008ea111";
    const SNAP_ID: &str = "ca253fd0-8068-11e4-98c0-5254008ea111";

    fn make_driver(mock: &MockBackend) -> VolumeDriver {
        make_driver_with(mock, DriverConfig::default())
    }

    fn make_driver_with(mock: &MockBackend, config: DriverConfig) -> VolumeDriver {
        VolumeDriver::new(config, Arc::new(mock.clone()))
    }

    fn make_volume(id: &str, size: u64) -> VolumeRecord {
        VolumeRecord::new(id, size)
            .with_project("testprjid")
            .with_display_name("testvol")
    }

    /// Backend holding a deployed 1 GiB volume for VOL_ID
    async fn provisioned() -> (MockBackend, VolumeDriver) {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        driver.create_volume(&make_volume(VOL_ID, 1)).await.unwrap();
        mock.clear_calls().await;
        (mock, driver)
    }

    #[tokio::test]
    async fn test_create_volume_sequence() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);

        let resource = driver.create_volume(&make_volume(VOL_ID, 1)).await.unwrap();
        assert_eq!(resource, format!("vol-{}", VOL_ID));

        let calls = mock.calls().await;
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "create_resource", "create_volume", "auto_deploy"]
        );
        match &calls[2] {
            BackendRequest::CreateVolume {
                size_kib,
                properties,
                ..
            } => {
                assert_eq!(*size_kib, 1_048_576);
                assert_eq!(properties.system_id(), Some(VOL_ID));
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert_eq!(mock.assignments(&resource).await, vec!["node-1"]);
    }

    #[tokio::test]
    async fn test_create_volume_proceeds_past_existing_resource() {
        let mock = MockBackend::new();
        // Leftover container from an earlier, partially failed create
        mock.seed_volume(&format!("vol-{}", VOL_ID), "stale", 1024)
            .await;
        let driver = make_driver(&mock);

        driver.create_volume(&make_volume(VOL_ID, 1)).await.unwrap();
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "create_resource", "create_volume", "auto_deploy"]
        );
        assert!(driver.naming().find_volume(VOL_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_volume_retry_after_failed_deploy_converges() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        let vol = make_volume(VOL_ID, 1);
        mock.fail_next("auto_deploy", StatusCode::GenericError).await;

        assert!(driver.create_volume(&vol).await.is_err());
        mock.clear_calls().await;

        let resource = driver.create_volume(&vol).await.unwrap();
        assert_eq!(mock.operations().await, vec!["list_volumes", "auto_deploy"]);
        assert_eq!(mock.assignments(&resource).await, vec!["node-1"]);

        // Still exactly one volume carries the id, so cleanup works
        let found = driver.naming().find_volume(VOL_ID).await.unwrap().unwrap();
        assert_eq!(found.resource, resource);
        driver.delete_volume(&vol).await.unwrap();
        assert!(mock.resource_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_surfaces_failing_step() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        mock.fail_next("create_volume", StatusCode::GenericError).await;

        let err = driver
            .create_volume(&make_volume(VOL_ID, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::GenericError { ref operation, .. } if operation == "create_volume"
        ));
        // No rollback and no deploy
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "create_resource", "create_volume"]
        );
        assert_eq!(mock.resource_names().await, vec![format!("vol-{}", VOL_ID)]);
    }

    #[tokio::test]
    async fn test_create_volume_rejects_zero_size() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        assert!(matches!(
            driver.create_volume(&make_volume(VOL_ID, 0)).await,
            Err(DriverError::InvalidSize { .. })
        ));
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_volume_sequence() {
        let (mock, driver) = provisioned().await;

        driver.delete_volume(&make_volume(VOL_ID, 1)).await.unwrap();

        let calls = mock.calls().await;
        assert_eq!(
            mock.operations().await,
            vec![
                "list_volumes",
                "remove_volume",
                "list_volumes",
                "remove_resource"
            ]
        );
        match &calls[0] {
            BackendRequest::ListVolumes { filter, .. } => {
                assert_eq!(filter.get("system-id"), Some(VOL_ID))
            }
            other => panic!("unexpected call: {other:?}"),
        }
        match &calls[1] {
            BackendRequest::RemoveVolume { force, .. } => assert!(*force),
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(mock.resource_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_volume_is_idempotent() {
        let (mock, driver) = provisioned().await;
        let vol = make_volume(VOL_ID, 1);

        driver.delete_volume(&vol).await.unwrap();
        mock.clear_calls().await;
        driver.delete_volume(&vol).await.unwrap();

        assert_eq!(mock.operations().await, vec!["list_volumes"]);
    }

    #[tokio::test]
    async fn test_delete_volume_not_found_status_is_success() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        mock.fail_next("list_volumes", StatusCode::NotFound).await;

        driver
            .delete_volume(&make_volume("deadbeef", 1))
            .await
            .unwrap();
        assert_eq!(mock.operations().await, vec!["list_volumes"]);
    }

    #[tokio::test]
    async fn test_delete_volume_keeps_resource_with_other_volumes() {
        let mock = MockBackend::new();
        mock.seed_volume("vol-shared", "a", 1024).await;
        mock.seed_volume("vol-shared", "b", 1024).await;
        let driver = make_driver(&mock);

        driver.delete_volume(&make_volume("a", 1)).await.unwrap();
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "remove_volume", "list_volumes"]
        );
        assert_eq!(mock.resource_names().await, vec!["vol-shared"]);
    }

    #[tokio::test]
    async fn test_extend_volume_relative_delta() {
        let (mock, driver) = provisioned().await;

        driver
            .extend_volume(&make_volume(VOL_ID, 1), 5)
            .await
            .unwrap();

        let calls = mock.calls().await;
        assert_eq!(mock.operations().await, vec!["list_volumes", "resize_volume"]);
        match &calls[1] {
            BackendRequest::ResizeVolume {
                resource,
                serial,
                size_kib,
                relative,
                ..
            } => {
                assert_eq!(resource, &format!("vol-{}", VOL_ID));
                assert_eq!(*serial, -1);
                assert_eq!(*size_kib, 4_194_304);
                assert!(*relative);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert_eq!(
            mock.volume_size(&format!("vol-{}", VOL_ID), 0).await,
            Some(5_242_880)
        );
    }

    #[tokio::test]
    async fn test_extend_volume_absolute_size() {
        let mock = MockBackend::new();
        let config = DriverConfig {
            resize_mode: ResizeMode::Absolute,
            ..Default::default()
        };
        let driver = make_driver_with(&mock, config);
        driver.create_volume(&make_volume(VOL_ID, 1)).await.unwrap();
        mock.clear_calls().await;

        driver
            .extend_volume(&make_volume(VOL_ID, 1), 5)
            .await
            .unwrap();

        match &mock.calls().await[1] {
            BackendRequest::ResizeVolume {
                size_kib, relative, ..
            } => {
                assert_eq!(*size_kib, 5_242_880);
                assert!(!*relative);
            }
            other => panic!("unexpected call: {other:?}"),
        }
        assert_eq!(
            mock.volume_size(&format!("vol-{}", VOL_ID), 0).await,
            Some(5_242_880)
        );
    }

    #[tokio::test]
    async fn test_shrink_rejected_without_backend_call() {
        let (mock, driver) = provisioned().await;

        let err = driver
            .extend_volume(&make_volume(VOL_ID, 5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidOperation { .. }));
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_shrink_allowed_sends_negative_delta() {
        let mock = MockBackend::new();
        let config = DriverConfig {
            allow_shrink: true,
            ..Default::default()
        };
        let driver = make_driver_with(&mock, config);
        driver.create_volume(&make_volume(VOL_ID, 5)).await.unwrap();
        mock.clear_calls().await;

        driver
            .extend_volume(&make_volume(VOL_ID, 5), 2)
            .await
            .unwrap();
        match &mock.calls().await[1] {
            BackendRequest::ResizeVolume { size_kib, .. } => {
                assert_eq!(*size_kib, -3 * 1_048_576)
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_extend_to_same_size_is_noop() {
        let (mock, driver) = provisioned().await;
        driver
            .extend_volume(&make_volume(VOL_ID, 1), 1)
            .await
            .unwrap();
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_extend_to_same_size_skips_lookup() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        // Nothing to resize, so the backend is not consulted at all
        driver
            .extend_volume(&make_volume("missing", 3), 3)
            .await
            .unwrap();
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_extend_missing_volume_is_not_found() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        assert!(matches!(
            driver.extend_volume(&make_volume("missing", 1), 2).await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_path() {
        let (mock, driver) = provisioned().await;

        let path = driver.local_path(&make_volume(VOL_ID, 1)).await.unwrap();
        assert!(path.starts_with("/dev/drbd"));

        match &mock.calls().await[1] {
            BackendRequest::TextQuery { command } => {
                assert_eq!(command[0], TQ_GET_PATH);
                assert_eq!(command[1], format!("vol-{}", VOL_ID));
                assert_eq!(command[2], "0");
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_path_unresolved_is_not_found() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        assert!(matches!(
            driver.local_path(&make_volume("missing", 1)).await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_path_error_status_is_generic() {
        let (mock, driver) = provisioned().await;
        mock.fail_next("text_query", StatusCode::GenericError).await;
        assert!(matches!(
            driver.local_path(&make_volume(VOL_ID, 1)).await,
            Err(DriverError::GenericError { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_snapshot_sequence() {
        let (mock, driver) = provisioned().await;

        let name = driver
            .create_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID))
            .await
            .unwrap();
        assert_eq!(name, format!("snap-{}", SNAP_ID));

        let calls = mock.calls().await;
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "list_assignments", "create_snapshot"]
        );
        match &calls[2] {
            BackendRequest::CreateSnapshot {
                nodes, properties, ..
            } => {
                assert!(nodes.contains(&"node-1".to_string()));
                assert_eq!(properties.system_id(), Some(SNAP_ID));
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_snapshot_undeployed_volume_is_inconsistent() {
        let mock = MockBackend::new();
        mock.seed_volume("vol-v1", "v1", 1_048_576).await;
        let driver = make_driver(&mock);

        let err = driver
            .create_snapshot(&SnapshotRecord::new(SNAP_ID, "v1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::DriverInconsistency { .. }));
        assert!(!mock.operations().await.contains(&"create_snapshot"));
    }

    #[tokio::test]
    async fn test_create_snapshot_missing_volume_is_not_found() {
        let mock = MockBackend::new();
        let driver = make_driver(&mock);
        assert!(matches!(
            driver
                .create_snapshot(&SnapshotRecord::new(SNAP_ID, "missing"))
                .await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_snapshot_sequence_and_idempotence() {
        let (mock, driver) = provisioned().await;
        let snap = SnapshotRecord::new(SNAP_ID, VOL_ID);
        driver.create_snapshot(&snap).await.unwrap();
        mock.clear_calls().await;

        driver.delete_snapshot(&snap).await.unwrap();
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "list_snapshots", "remove_snapshot"]
        );
        assert!(mock
            .snapshot_names(&format!("vol-{}", VOL_ID))
            .await
            .is_empty());

        mock.clear_calls().await;
        driver.delete_snapshot(&snap).await.unwrap();
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "list_snapshots"]
        );
    }

    #[tokio::test]
    async fn test_delete_snapshot_of_vanished_volume_searches_all_resources() {
        let mock = MockBackend::new();
        mock.seed_volume("vol-other", "other", 1024).await;
        mock.seed_snapshot("vol-other", "snap-orphan", SNAP_ID).await;
        let driver = make_driver(&mock);

        driver
            .delete_snapshot(&SnapshotRecord::new(SNAP_ID, "gone"))
            .await
            .unwrap();
        match &mock.calls().await[1] {
            BackendRequest::ListSnapshots { resource, .. } => assert!(resource.is_none()),
            other => panic!("unexpected call: {other:?}"),
        }
        assert!(mock.snapshot_names("vol-other").await.is_empty());
    }

    #[tokio::test]
    async fn test_create_snapshot_twice_is_already_exists() {
        let (_mock, driver) = provisioned().await;
        let snap = SnapshotRecord::new(SNAP_ID, VOL_ID);
        driver.create_snapshot(&snap).await.unwrap();

        match driver.create_snapshot(&snap).await.unwrap_err() {
            DriverError::AlreadyExists { resource } => {
                assert_eq!(resource, format!("vol-{}/snap-{}", VOL_ID, SNAP_ID))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    /// Backend holding volumes "a" and "b" in one resource named `vol-shared`
    async fn shared_container() -> (MockBackend, VolumeDriver) {
        let mock = MockBackend::new();
        mock.seed_volume("vol-shared", "a", 1_048_576).await;
        mock.seed_volume("vol-shared", "b", 1_048_576).await;
        mock.seed_assignment("vol-shared", "node-1").await;
        let driver = make_driver(&mock);
        (mock, driver)
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_in_shared_container() {
        let (mock, driver) = shared_container().await;
        let snap = SnapshotRecord::new(SNAP_ID, "a");

        driver.create_snapshot(&snap).await.unwrap();
        assert_eq!(
            mock.snapshot_names("vol-shared").await,
            vec![format!("snap-{}", SNAP_ID)]
        );

        let restored = driver
            .create_volume_from_snapshot(&make_volume("restored", 1), &snap)
            .await
            .unwrap();
        assert_eq!(restored, "vol-restored");

        driver.delete_snapshot(&snap).await.unwrap();
        assert!(mock.snapshot_names("vol-shared").await.is_empty());
    }

    #[tokio::test]
    async fn test_clone_from_shared_container_removes_transient_snapshot() {
        let (mock, driver) = shared_container().await;

        let resource = driver
            .create_cloned_volume(&make_volume("c", 1), &make_volume("a", 1))
            .await
            .unwrap();
        assert_eq!(resource, "vol-c");
        assert_eq!(mock.operations().await.last(), Some(&"remove_snapshot"));
        assert!(mock.snapshot_names("vol-shared").await.is_empty());
    }

    #[tokio::test]
    async fn test_create_cloned_volume_sequence() {
        let (mock, driver) = provisioned().await;
        let source = make_volume(VOL_ID, 1);
        let clone = make_volume(SNAP_ID, 1);

        let resource = driver.create_cloned_volume(&clone, &source).await.unwrap();
        assert_eq!(resource, format!("vol-{}", SNAP_ID));

        assert_eq!(
            mock.operations().await,
            vec![
                "list_volumes",
                "list_assignments",
                "create_snapshot",
                "list_snapshots",
                "restore_snapshot",
                "list_snapshots",
                "remove_snapshot",
            ]
        );
        assert!(mock
            .snapshot_names(&format!("vol-{}", VOL_ID))
            .await
            .is_empty());

        // The clone is tagged with its own id and resolvable
        let found = driver.naming().find_volume(SNAP_ID).await.unwrap().unwrap();
        assert_eq!(found.resource, resource);
    }

    #[tokio::test]
    async fn test_clone_removes_transient_snapshot_when_restore_fails() {
        let (mock, driver) = provisioned().await;
        mock.fail_next("restore_snapshot", StatusCode::GenericError)
            .await;

        let err = driver
            .create_cloned_volume(&make_volume(SNAP_ID, 1), &make_volume(VOL_ID, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::GenericError { ref operation, .. } if operation == "restore_snapshot"
        ));

        let ops = mock.operations().await;
        assert_eq!(ops.last(), Some(&"remove_snapshot"));
        assert!(mock
            .snapshot_names(&format!("vol-{}", VOL_ID))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_clone_removes_transient_snapshot_when_resolve_fails() {
        let (mock, driver) = provisioned().await;
        mock.fail_next("list_snapshots", StatusCode::GenericError)
            .await;

        let err = driver
            .create_cloned_volume(&make_volume(SNAP_ID, 1), &make_volume(VOL_ID, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::GenericError { ref operation, .. } if operation == "list_snapshots"
        ));
        assert_eq!(
            mock.operations().await,
            vec![
                "list_volumes",
                "list_assignments",
                "create_snapshot",
                "list_snapshots",
                "list_snapshots",
                "remove_snapshot",
            ]
        );
        assert!(mock
            .snapshot_names(&format!("vol-{}", VOL_ID))
            .await
            .is_empty());
        assert!(!mock.resource_names().await.contains(&format!("vol-{}", SNAP_ID)));
    }

    #[tokio::test]
    async fn test_clone_cleanup_failure_does_not_mask_success() {
        let (mock, driver) = provisioned().await;
        mock.fail_next("remove_snapshot", StatusCode::GenericError)
            .await;

        driver
            .create_cloned_volume(&make_volume(SNAP_ID, 1), &make_volume(VOL_ID, 1))
            .await
            .unwrap();
        // The transient snapshot is left behind for the caller to notice
        assert_eq!(
            mock.snapshot_names(&format!("vol-{}", VOL_ID)).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_clone_smaller_than_source_rejected() {
        let (mock, driver) = provisioned().await;
        let err = driver
            .create_cloned_volume(&make_volume(SNAP_ID, 1), &make_volume(VOL_ID, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidOperation { .. }));
        assert!(mock.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_volume_from_snapshot() {
        let (mock, driver) = provisioned().await;
        let snap = SnapshotRecord::new(SNAP_ID, VOL_ID);
        driver.create_snapshot(&snap).await.unwrap();
        mock.clear_calls().await;

        let new_vol = make_volume("restored", 3);
        let resource = driver
            .create_volume_from_snapshot(&new_vol, &snap)
            .await
            .unwrap();
        assert_eq!(resource, "vol-restored");
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "list_snapshots", "restore_snapshot"]
        );
        assert_eq!(mock.volume_size("vol-restored", 0).await, Some(3 * 1_048_576));
    }

    #[tokio::test]
    async fn test_create_volume_from_missing_snapshot() {
        let (_mock, driver) = provisioned().await;
        assert!(matches!(
            driver
                .create_volume_from_snapshot(
                    &make_volume("restored", 1),
                    &SnapshotRecord::new("missing", VOL_ID)
                )
                .await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_manage_existing_snapshot() {
        let (mock, driver) = provisioned().await;
        let resource = format!("vol-{}", VOL_ID);
        mock.seed_snapshot(&resource, "backup-1", "").await;
        let reference = SnapshotReference {
            resource: resource.clone(),
            snapshot: "backup-1".to_string(),
        };
        mock.clear_calls().await;

        let name = driver
            .manage_existing_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID), &reference)
            .await
            .unwrap();
        assert_eq!(name, "backup-1");
        assert_eq!(
            mock.operations().await,
            vec!["list_volumes", "list_snapshots", "modify_snapshot"]
        );
        assert_eq!(
            mock.snapshot_properties(&resource, "backup-1")
                .await
                .unwrap()
                .system_id(),
            Some(SNAP_ID)
        );

        // Managed snapshots resolve through the normal lookup
        let found = driver
            .naming()
            .find_snapshot(Some(resource.as_str()), SNAP_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.snapshot, "backup-1");

        // Managing again under the same id is accepted
        driver
            .manage_existing_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID), &reference)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manage_snapshot_owned_by_other_record_rejected() {
        let (mock, driver) = provisioned().await;
        let resource = format!("vol-{}", VOL_ID);
        mock.seed_snapshot(&resource, "backup-1", "someone-else")
            .await;
        let reference = SnapshotReference {
            resource,
            snapshot: "backup-1".to_string(),
        };

        assert!(matches!(
            driver
                .manage_existing_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID), &reference)
                .await,
            Err(DriverError::InvalidOperation { .. })
        ));
        assert!(!mock.operations().await.contains(&"modify_snapshot"));
    }

    #[tokio::test]
    async fn test_manage_snapshot_of_other_volume_rejected() {
        let (_mock, driver) = provisioned().await;
        let reference = SnapshotReference {
            resource: "vol-elsewhere".to_string(),
            snapshot: "backup-1".to_string(),
        };
        assert!(matches!(
            driver
                .manage_existing_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID), &reference)
                .await,
            Err(DriverError::InvalidOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_manage_missing_snapshot_is_not_found() {
        let (_mock, driver) = provisioned().await;
        let reference = SnapshotReference {
            resource: format!("vol-{}", VOL_ID),
            snapshot: "nope".to_string(),
        };
        assert!(matches!(
            driver
                .manage_existing_snapshot(&SnapshotRecord::new(SNAP_ID, VOL_ID), &reference)
                .await,
            Err(DriverError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_volume_stats() {
        let mock = MockBackend::new();
        mock.set_total_capacity(10 * KIB_PER_GIB).await;
        let config = DriverConfig {
            backend_name: "replicated-ssd".to_string(),
            reserved_percentage: 5,
            ..Default::default()
        };
        let driver = make_driver_with(&mock, config);
        driver.create_volume(&make_volume(VOL_ID, 2)).await.unwrap();

        let stats = driver.volume_stats().await.unwrap();
        assert_eq!(stats.backend_name, "replicated-ssd");
        assert_eq!(stats.total_capacity_gib, 10);
        assert_eq!(stats.free_capacity_gib, 8);
        assert_eq!(stats.reserved_percentage, 5);
    }

    #[tokio::test]
    async fn test_setup_connects_and_validates() {
        let mock = MockBackend::new();
        make_driver(&mock).setup().await.unwrap();
        assert_eq!(mock.connect_count().await, 1);

        let bad = DriverConfig {
            redundancy: 0,
            ..Default::default()
        };
        assert!(matches!(
            make_driver_with(&mock, bad).setup().await,
            Err(DriverError::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_backend_restart_mid_operation_is_transparent() {
        let (mock, driver) = provisioned().await;
        mock.restart().await;

        let path = driver.local_path(&make_volume(VOL_ID, 1)).await.unwrap();
        assert!(path.starts_with("/dev/drbd"));
        assert_eq!(mock.operations().await, vec!["list_volumes", "text_query"]);
        assert_eq!(mock.connect_count().await, 2);
    }

    #[tokio::test]
    async fn test_concurrent_operations_on_different_volumes() {
        let mock = MockBackend::new();
        let driver = Arc::new(make_driver(&mock));

        let mut handles = Vec::new();
        for i in 0..8 {
            let driver = driver.clone();
            handles.push(tokio::spawn(async move {
                driver
                    .create_volume(&make_volume(&format!("v{}", i), 1))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(mock.resource_names().await.len(), 8);
        assert_eq!(mock.connect_count().await, 1);
    }
}
