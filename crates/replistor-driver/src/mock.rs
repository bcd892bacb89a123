use crate::protocol::*;
use crate::transport::{Connection, Connector};
use async_trait::async_trait;
use replistor_core::{DriverError, Properties, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct MockVolume {
    size_kib: u64,
    minor: u32,
    properties: Properties,
}

#[derive(Debug, Clone)]
struct MockSnapshot {
    nodes: Vec<String>,
    properties: Properties,
    /// Volume sizes captured at snapshot time
    volumes: BTreeMap<u32, u64>,
}

#[derive(Debug, Clone, Default)]
struct MockResource {
    properties: Properties,
    volumes: BTreeMap<u32, MockVolume>,
    assignments: BTreeSet<String>,
    snapshots: BTreeMap<String, MockSnapshot>,
}

#[derive(Debug, Default)]
struct MockState {
    nodes: Vec<String>,
    resources: BTreeMap<String, MockResource>,
    calls: Vec<BackendRequest>,
    /// Bumped on restart; connections from older epochs are stale
    epoch: u64,
    connects: u32,
    failing_connects: u32,
    stalled_calls: u32,
    injected: HashMap<String, StatusCode>,
    next_minor: u32,
    total_kib: u64,
}

/// In-memory backend for testing the driver without a control plane
///
/// Models resources, volumes, assignments and snapshots, records every call
/// that reaches the backend, and supports fault injection: stale
/// connections after `restart()`, failing connects, stalled calls and
/// one-shot failure statuses per operation.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<RwLock<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend with three nodes
    pub fn new() -> Self {
        Self::with_nodes(&["node-1", "node-2", "node-3"])
    }

    pub fn with_nodes(nodes: &[&str]) -> Self {
        let state = MockState {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            total_kib: 100 * 1024 * 1024,
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Every call that reached the backend, in order
    pub async fn calls(&self) -> Vec<BackendRequest> {
        self.state.read().await.calls.clone()
    }

    /// Operation names of recorded calls, in order
    pub async fn operations(&self) -> Vec<&'static str> {
        self.state
            .read()
            .await
            .calls
            .iter()
            .map(|c| c.operation())
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.write().await.calls.clear();
    }

    pub async fn connect_count(&self) -> u32 {
        self.state.read().await.connects
    }

    /// Simulate a backend restart: existing connections go stale
    pub async fn restart(&self) {
        self.state.write().await.epoch += 1;
    }

    /// Fail the next `n` connect attempts
    pub async fn fail_connects(&self, n: u32) {
        self.state.write().await.failing_connects = n;
    }

    /// Never answer the next `n` calls
    pub async fn stall_calls(&self, n: u32) {
        self.state.write().await.stalled_calls = n;
    }

    /// Answer the next call of `operation` with `status` instead of running it
    pub async fn fail_next(&self, operation: &str, status: StatusCode) {
        self.state
            .write()
            .await
            .injected
            .insert(operation.to_string(), status);
    }

    pub async fn set_total_capacity(&self, total_kib: u64) {
        self.state.write().await.total_kib = total_kib;
    }

    /// Add a resource with one volume tagged with `system_id`
    pub async fn seed_volume(&self, resource: &str, system_id: &str, size_kib: u64) {
        let mut state = self.state.write().await;
        let minor = state.next_minor;
        state.next_minor += 1;
        let res = state.resources.entry(resource.to_string()).or_default();
        res.properties = Properties::for_system_id(system_id);
        let nr = res.volumes.len() as u32;
        res.volumes.insert(
            nr,
            MockVolume {
                size_kib,
                minor,
                properties: Properties::for_system_id(system_id),
            },
        );
    }

    pub async fn seed_assignment(&self, resource: &str, node: &str) {
        let mut state = self.state.write().await;
        if let Some(res) = state.resources.get_mut(resource) {
            res.assignments.insert(node.to_string());
        }
    }

    /// Add a snapshot of an existing resource; an empty `system_id` leaves
    /// it untagged
    pub async fn seed_snapshot(&self, resource: &str, snapshot: &str, system_id: &str) {
        let properties = if system_id.is_empty() {
            Properties::new()
        } else {
            Properties::for_system_id(system_id)
        };
        let mut state = self.state.write().await;
        if let Some(res) = state.resources.get_mut(resource) {
            let volumes = res.volumes.iter().map(|(nr, v)| (*nr, v.size_kib)).collect();
            res.snapshots.insert(
                snapshot.to_string(),
                MockSnapshot {
                    nodes: res.assignments.iter().cloned().collect(),
                    properties,
                    volumes,
                },
            );
        }
    }

    pub async fn resource_names(&self) -> Vec<String> {
        self.state.read().await.resources.keys().cloned().collect()
    }

    pub async fn snapshot_names(&self, resource: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .resources
            .get(resource)
            .map(|r| r.snapshots.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn snapshot_properties(&self, resource: &str, snapshot: &str) -> Option<Properties> {
        self.state
            .read()
            .await
            .resources
            .get(resource)
            .and_then(|r| r.snapshots.get(snapshot))
            .map(|s| s.properties.clone())
    }

    pub async fn volume_size(&self, resource: &str, volume_nr: u32) -> Option<u64> {
        self.state
            .read()
            .await
            .resources
            .get(resource)
            .and_then(|r| r.volumes.get(&volume_nr))
            .map(|v| v.size_kib)
    }

    pub async fn assignments(&self, resource: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .resources
            .get(resource)
            .map(|r| r.assignments.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MockBackend {
    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let mut state = self.state.write().await;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(DriverError::connection_failure("Mock: connection refused"));
        }
        state.connects += 1;
        debug!("Mock: connected (epoch {})", state.epoch);
        Ok(Arc::new(MockConnection {
            backend: self.clone(),
            epoch: state.epoch,
        }))
    }
}

struct MockConnection {
    backend: MockBackend,
    epoch: u64,
}

#[async_trait]
impl Connection for MockConnection {
    async fn call(&self, request: &BackendRequest) -> Result<CallReply> {
        let stall = {
            let mut state = self.backend.state.write().await;
            if state.epoch != self.epoch {
                return Err(DriverError::connection_failure("Mock: stale connection"));
            }
            if state.stalled_calls > 0 {
                state.stalled_calls -= 1;
                true
            } else {
                false
            }
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = self.backend.state.write().await;
        state.calls.push(request.clone());
        if let Some(status) = state.injected.remove(request.operation()) {
            debug!("Mock: injected {} for {}", status, request.operation());
            return Ok(CallReply::status(status, "injected"));
        }
        Ok(state.apply(request))
    }
}

fn not_found(what: &str) -> CallReply {
    CallReply::status(StatusCode::NotFound, format!("{} not found", what))
}

fn error(message: impl Into<String>) -> CallReply {
    CallReply::status(StatusCode::GenericError, message)
}

fn ack() -> CallReply {
    CallReply::new(vec![CallResult::ack()], Vec::new())
}

impl MockState {
    fn alloc_minor(&mut self) -> u32 {
        let minor = self.next_minor;
        self.next_minor += 1;
        minor
    }

    fn apply(&mut self, request: &BackendRequest) -> CallReply {
        match request {
            BackendRequest::CreateResource {
                resource,
                properties,
            } => {
                if self.resources.contains_key(resource) {
                    return CallReply::status(StatusCode::AlreadyExists, "resource exists");
                }
                self.resources.insert(
                    resource.clone(),
                    MockResource {
                        properties: properties.clone(),
                        ..Default::default()
                    },
                );
                ack()
            }
            BackendRequest::RemoveResource { resource, force } => {
                match self.resources.get(resource) {
                    None => return not_found(resource),
                    Some(res) if !force && !res.volumes.is_empty() => {
                        return error("resource still has volumes")
                    }
                    Some(_) => {}
                }
                self.resources.remove(resource);
                ack()
            }
            BackendRequest::CreateVolume {
                resource,
                size_kib,
                properties,
            } => {
                let minor = self.alloc_minor();
                let Some(res) = self.resources.get_mut(resource) else {
                    return not_found(resource);
                };
                let nr = res.volumes.keys().next_back().map_or(0, |n| n + 1);
                res.volumes.insert(
                    nr,
                    MockVolume {
                        size_kib: *size_kib,
                        minor,
                        properties: properties.clone(),
                    },
                );
                ack()
            }
            BackendRequest::ResizeVolume {
                resource,
                volume_nr,
                size_kib,
                relative,
                ..
            } => {
                let Some(vol) = self
                    .resources
                    .get_mut(resource)
                    .and_then(|r| r.volumes.get_mut(volume_nr))
                else {
                    return not_found(resource);
                };
                let new_size = if *relative {
                    vol.size_kib as i64 + size_kib
                } else {
                    *size_kib
                };
                if new_size <= 0 {
                    return error(format!("invalid resulting size {}", new_size));
                }
                vol.size_kib = new_size as u64;
                ack()
            }
            BackendRequest::RemoveVolume {
                resource,
                volume_nr,
                ..
            } => {
                let removed = self
                    .resources
                    .get_mut(resource)
                    .and_then(|r| r.volumes.remove(volume_nr));
                match removed {
                    Some(_) => ack(),
                    None => not_found(resource),
                }
            }
            BackendRequest::ListVolumes { resource, filter } => {
                if let Some(name) = resource {
                    if !self.resources.contains_key(name) {
                        return not_found(name);
                    }
                }
                let payload = self
                    .resources
                    .iter()
                    .filter(|(name, _)| resource.as_ref().is_none_or(|r| r == *name))
                    .filter_map(|(name, res)| {
                        let volumes: Vec<VolumeEntry> = res
                            .volumes
                            .iter()
                            .filter(|(_, v)| v.properties.matches(filter))
                            .map(|(nr, v)| VolumeEntry {
                                number: *nr,
                                size_kib: v.size_kib,
                                properties: v.properties.clone(),
                            })
                            .collect();
                        if volumes.is_empty() && !filter.is_empty() {
                            return None;
                        }
                        Some(PayloadEntry::Volumes(ResourceVolumes {
                            resource: name.clone(),
                            properties: res.properties.clone(),
                            volumes,
                        }))
                    })
                    .collect();
                CallReply::new(vec![CallResult::ack()], payload)
            }
            BackendRequest::AutoDeploy {
                resource,
                redundancy,
                ..
            } => {
                let redundancy = *redundancy as usize;
                if self.nodes.len() < redundancy {
                    return error(format!(
                        "redundancy {} exceeds {} nodes",
                        redundancy,
                        self.nodes.len()
                    ));
                }
                let targets: Vec<String> = self.nodes.iter().take(redundancy).cloned().collect();
                let Some(res) = self.resources.get_mut(resource) else {
                    return not_found(resource);
                };
                res.assignments.extend(targets);
                CallReply::new(vec![CallResult::ack(); redundancy], Vec::new())
            }
            BackendRequest::ListAssignments { resource, filter } => {
                if let Some(name) = resource {
                    if !self.resources.contains_key(name) {
                        return not_found(name);
                    }
                }
                let payload = self
                    .resources
                    .iter()
                    .filter(|(name, _)| resource.as_ref().is_none_or(|r| r == *name))
                    .filter(|(_, res)| res.properties.matches(filter))
                    .flat_map(|(name, res)| {
                        res.assignments.iter().map(move |node| {
                            PayloadEntry::Assignment(AssignmentEntry {
                                node: node.clone(),
                                resource: name.clone(),
                                properties: Properties::new(),
                            })
                        })
                    })
                    .collect();
                CallReply::new(vec![CallResult::ack()], payload)
            }
            BackendRequest::TextQuery { command } => match command.as_slice() {
                [cmd, resource, nr] if cmd == TQ_GET_PATH => {
                    let vol = nr.parse::<u32>().ok().and_then(|nr| {
                        self.resources
                            .get(resource)
                            .and_then(|r| r.volumes.get(&nr))
                    });
                    match vol {
                        Some(v) => CallReply::new(
                            vec![CallResult::ack()],
                            vec![PayloadEntry::Text(format!("/dev/drbd{}", v.minor))],
                        ),
                        None => not_found(resource),
                    }
                }
                _ => error("unknown command"),
            },
            BackendRequest::CreateSnapshot {
                resource,
                snapshot,
                nodes,
                properties,
            } => {
                let Some(res) = self.resources.get_mut(resource) else {
                    return not_found(resource);
                };
                if nodes.is_empty() {
                    return error("no nodes given for snapshot");
                }
                if let Some(node) = nodes.iter().find(|n| !res.assignments.contains(*n)) {
                    return error(format!("{} is not deployed on {}", resource, node));
                }
                if res.snapshots.contains_key(snapshot) {
                    return CallReply::status(StatusCode::AlreadyExists, "snapshot exists");
                }
                let volumes = res.volumes.iter().map(|(nr, v)| (*nr, v.size_kib)).collect();
                res.snapshots.insert(
                    snapshot.clone(),
                    MockSnapshot {
                        nodes: nodes.clone(),
                        properties: properties.clone(),
                        volumes,
                    },
                );
                ack()
            }
            BackendRequest::ListSnapshots {
                resource,
                snapshot,
                filter,
            } => {
                if let Some(name) = resource {
                    if !self.resources.contains_key(name) {
                        return not_found(name);
                    }
                }
                let payload = self
                    .resources
                    .iter()
                    .filter(|(name, _)| resource.as_ref().is_none_or(|r| r == *name))
                    .filter_map(|(name, res)| {
                        let snapshots: Vec<SnapshotEntry> = res
                            .snapshots
                            .iter()
                            .filter(|(sn, _)| snapshot.as_ref().is_none_or(|s| s == *sn))
                            .filter(|(_, s)| s.properties.matches(filter))
                            .map(|(sn, s)| SnapshotEntry {
                                name: sn.clone(),
                                properties: s.properties.clone(),
                            })
                            .collect();
                        (!snapshots.is_empty()).then(|| {
                            PayloadEntry::Snapshots(ResourceSnapshots {
                                resource: name.clone(),
                                snapshots,
                            })
                        })
                    })
                    .collect();
                CallReply::new(vec![CallResult::ack()], payload)
            }
            BackendRequest::RemoveSnapshot {
                resource, snapshot, ..
            } => {
                let removed = self
                    .resources
                    .get_mut(resource)
                    .and_then(|r| r.snapshots.remove(snapshot));
                match removed {
                    Some(_) => ack(),
                    None => not_found(snapshot),
                }
            }
            BackendRequest::RestoreSnapshot {
                resource,
                source_resource,
                snapshot,
                size_kib,
                resource_properties,
                volume_properties,
            } => {
                if self.resources.contains_key(resource) {
                    return CallReply::status(StatusCode::AlreadyExists, "resource exists");
                }
                let Some(snap) = self
                    .resources
                    .get(source_resource)
                    .and_then(|r| r.snapshots.get(snapshot))
                    .cloned()
                else {
                    return not_found(snapshot);
                };
                let mut restored = MockResource {
                    properties: resource_properties.clone(),
                    assignments: snap.nodes.iter().cloned().collect(),
                    ..Default::default()
                };
                for (nr, snap_size) in &snap.volumes {
                    let minor = self.alloc_minor();
                    restored.volumes.insert(
                        *nr,
                        MockVolume {
                            size_kib: (*snap_size).max(*size_kib),
                            minor,
                            properties: volume_properties.clone(),
                        },
                    );
                }
                self.resources.insert(resource.clone(), restored);
                ack()
            }
            BackendRequest::ModifySnapshot {
                resource,
                snapshot,
                properties,
            } => {
                let Some(snap) = self
                    .resources
                    .get_mut(resource)
                    .and_then(|r| r.snapshots.get_mut(snapshot))
                else {
                    return not_found(snapshot);
                };
                if let Some(id) = properties.system_id() {
                    snap.properties.set_system_id(id);
                }
                ack()
            }
            BackendRequest::ClusterFreeQuery { redundancy } => {
                let used: u64 = self
                    .resources
                    .values()
                    .map(|r| {
                        let replicas = r.assignments.len().max(1) as u64;
                        r.volumes.values().map(|v| v.size_kib).sum::<u64>() * replicas
                    })
                    .sum();
                let free = self.total_kib.saturating_sub(used) / u64::from((*redundancy).max(1));
                CallReply::new(
                    vec![CallResult::ack()],
                    vec![PayloadEntry::Capacity(CapacityEntry {
                        free_kib: free,
                        total_kib: self.total_kib,
                    })],
                )
            }
        }
    }
}
