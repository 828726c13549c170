//! Node capacity snapshots.
//!
//! The panel is the source of truth for node memory, but querying it on
//! every storefront request is too slow and too chatty. A background task
//! polls the panel, folds the node listing into a per-location snapshot,
//! and keeps it both in memory and on disk so availability checks are a
//! local read. A stale snapshot is served as-is; placement re-checks the
//! panel at provisioning time anyway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};

use crate::panel::types::PanelLocation;
use crate::panel::{PanelClient, PanelError};

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error(transparent)]
    Panel(#[from] PanelError),

    #[error("Failed to read snapshot from {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write snapshot to {path}: {source}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed snapshot file: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub id: i64,
    pub name: String,
    pub fqdn: String,
    pub total_mb: i64,
    pub allocated_mb: i64,
    pub free_mb: i64,
    pub used_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationCapacity {
    /// The panel's short location code.
    pub location: String,
    pub node_count: usize,
    pub total_mb: i64,
    pub allocated_mb: i64,
    pub free_mb: i64,
    pub used_pct: f64,
    /// Largest single-node headroom. A location can have plenty of free
    /// memory in aggregate and still not fit one more server.
    pub max_free_mb: i64,
    /// Used percentage of the node with the most headroom.
    pub freest_node_used_pct: f64,
    pub nodes: Vec<NodeCapacity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub generated_at: DateTime<Utc>,
    pub locations: Vec<LocationCapacity>,
}

impl CapacitySnapshot {
    pub fn location(&self, short: &str) -> Option<&LocationCapacity> {
        self.locations.iter().find(|l| l.location == short)
    }
}

fn used_pct(allocated_mb: i64, total_mb: i64) -> f64 {
    if total_mb <= 0 {
        return 0.0;
    }
    allocated_mb as f64 * 100.0 / total_mb as f64
}

/// Fold a panel location listing (with nodes included) into a snapshot.
pub fn compute_snapshot(locations: &[PanelLocation]) -> CapacitySnapshot {
    let locations = locations
        .iter()
        .map(|location| {
            let nodes: Vec<NodeCapacity> = location
                .nodes()
                .into_iter()
                .map(|node| NodeCapacity {
                    id: node.id,
                    name: node.name.clone(),
                    fqdn: node.fqdn.clone(),
                    total_mb: node.memory,
                    allocated_mb: node.allocated_mb(),
                    free_mb: node.free_mb(),
                    used_pct: used_pct(node.allocated_mb(), node.memory),
                })
                .collect();

            let total_mb: i64 = nodes.iter().map(|n| n.total_mb).sum();
            let allocated_mb: i64 = nodes.iter().map(|n| n.allocated_mb).sum();
            let freest = nodes.iter().max_by_key(|n| n.free_mb);

            LocationCapacity {
                location: location.short.clone(),
                node_count: nodes.len(),
                total_mb,
                allocated_mb,
                free_mb: nodes.iter().map(|n| n.free_mb).sum(),
                used_pct: used_pct(allocated_mb, total_mb),
                max_free_mb: freest.map(|n| n.free_mb).unwrap_or(0),
                freest_node_used_pct: freest.map(|n| n.used_pct).unwrap_or(0.0),
                nodes,
            }
        })
        .collect();

    CapacitySnapshot {
        generated_at: Utc::now(),
        locations,
    }
}

/// Shared snapshot holder. Swapped atomically on refresh and mirrored to
/// disk so a restart starts from the last known state.
#[derive(Clone)]
pub struct CapacityCache {
    inner: Arc<RwLock<Option<CapacitySnapshot>>>,
    snapshot_path: PathBuf,
}

impl CapacityCache {
    pub fn new(snapshot_path: &Path) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            snapshot_path: snapshot_path.to_path_buf(),
        }
    }

    /// Seed the in-memory snapshot from disk. Missing file is not an error.
    pub async fn load_from_disk(&self) -> Result<bool, CapacityError> {
        if !self.snapshot_path.exists() {
            return Ok(false);
        }

        let raw = std::fs::read_to_string(&self.snapshot_path).map_err(|e| {
            CapacityError::ReadError {
                path: self.snapshot_path.clone(),
                source: e,
            }
        })?;
        let snapshot: CapacitySnapshot = serde_json::from_str(&raw)?;

        info!(
            generated_at = %snapshot.generated_at,
            locations = snapshot.locations.len(),
            "Loaded capacity snapshot from disk"
        );

        *self.inner.write().await = Some(snapshot);
        Ok(true)
    }

    pub async fn store(&self, snapshot: CapacitySnapshot) -> Result<(), CapacityError> {
        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CapacityError::WriteError {
                path: self.snapshot_path.clone(),
                source: e,
            })?;
        }

        let serialized = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&self.snapshot_path, serialized).map_err(|e| {
            CapacityError::WriteError {
                path: self.snapshot_path.clone(),
                source: e,
            }
        })?;

        *self.inner.write().await = Some(snapshot);
        Ok(())
    }

    pub async fn snapshot(&self) -> Option<CapacitySnapshot> {
        self.inner.read().await.clone()
    }

    /// Whether a location can fit one more server of the given size.
    /// Unknown locations (or no snapshot yet) read as unavailable.
    pub async fn location_available(&self, short: &str, required_mb: i64) -> bool {
        let guard = self.inner.read().await;
        guard
            .as_ref()
            .and_then(|s| s.location(short))
            .map(|l| l.max_free_mb >= required_mb)
            .unwrap_or(false)
    }
}

/// Background task that periodically rebuilds the snapshot from the panel.
pub struct CapacityRefresher {
    panel: PanelClient,
    cache: CapacityCache,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl CapacityRefresher {
    pub fn new(
        panel: PanelClient,
        cache: CapacityCache,
        interval_secs: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            panel,
            cache,
            interval: Duration::from_secs(interval_secs),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(interval = ?self.interval, "Starting capacity refresher");

        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = refresh_once(&self.panel, &self.cache).await {
                        error!(error = %e, "Capacity refresh failed");
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("Capacity refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// One refresh cycle: pull all locations with nodes, rebuild, persist.
pub async fn refresh_once(
    panel: &PanelClient,
    cache: &CapacityCache,
) -> Result<CapacitySnapshot, CapacityError> {
    let locations = panel.list_locations(true).await?;
    let snapshot = compute_snapshot(&locations);

    debug!(locations = snapshot.locations.len(), "Capacity snapshot rebuilt");
    cache.store(snapshot.clone()).await?;

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::types::{
        AllocatedResources, DataList, LocationRelationships, PanelNode, Wrapped,
    };

    fn node(id: i64, memory: i64, allocated: i64) -> PanelNode {
        PanelNode {
            id,
            name: format!("node{id}"),
            fqdn: format!("node{id}.example.com"),
            memory,
            allocated_resources: Some(AllocatedResources {
                memory: allocated,
                disk: 0,
            }),
            relationships: None,
        }
    }

    fn location(short: &str, nodes: Vec<PanelNode>) -> PanelLocation {
        PanelLocation {
            id: 1,
            short: short.to_string(),
            long: None,
            relationships: Some(LocationRelationships {
                nodes: Some(DataList {
                    data: nodes.into_iter().map(|n| Wrapped { attributes: n }).collect(),
                }),
            }),
        }
    }

    #[test]
    fn test_compute_snapshot_sums_and_max() {
        let locations = vec![location(
            "eu",
            vec![node(1, 32768, 20000), node(2, 16384, 2000)],
        )];

        let snapshot = compute_snapshot(&locations);
        let eu = snapshot.location("eu").unwrap();

        assert_eq!(eu.node_count, 2);
        assert_eq!(eu.total_mb, 49152);
        assert_eq!(eu.allocated_mb, 22000);
        assert_eq!(eu.free_mb, 27152);
        assert_eq!(eu.max_free_mb, 14384);
        assert_eq!(eu.nodes.len(), 2);
        assert!((eu.used_pct - 22000.0 * 100.0 / 49152.0).abs() < 1e-9);
        // node 2 has the most headroom; 2000 of 16384 MB allocated
        assert!((eu.freest_node_used_pct - 2000.0 * 100.0 / 16384.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_snapshot_empty_location() {
        let locations = vec![location("eu", vec![])];
        let snapshot = compute_snapshot(&locations);
        let eu = snapshot.location("eu").unwrap();

        assert_eq!(eu.node_count, 0);
        assert_eq!(eu.total_mb, 0);
        assert_eq!(eu.max_free_mb, 0);
        assert_eq!(eu.used_pct, 0.0);
        assert_eq!(eu.freest_node_used_pct, 0.0);
    }

    #[tokio::test]
    async fn test_location_available_uses_max_free() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CapacityCache::new(&dir.path().join("capacity.json"));

        // Two half-full nodes: 27152 MB free in aggregate, but no single
        // node can fit more than 14384 MB.
        let locations = vec![location(
            "eu",
            vec![node(1, 32768, 20000), node(2, 16384, 2000)],
        )];
        cache.store(compute_snapshot(&locations)).await.unwrap();

        assert!(cache.location_available("eu", 8192).await);
        assert!(cache.location_available("eu", 14384).await);
        assert!(!cache.location_available("eu", 14385).await);
        assert!(!cache.location_available("us", 1024).await);
    }

    #[tokio::test]
    async fn test_snapshot_persists_across_cache_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capacity.json");

        let cache = CapacityCache::new(&path);
        let locations = vec![location("eu", vec![node(1, 8192, 1024)])];
        cache.store(compute_snapshot(&locations)).await.unwrap();

        let reloaded = CapacityCache::new(&path);
        assert!(reloaded.load_from_disk().await.unwrap());
        let snapshot = reloaded.snapshot().await.unwrap();
        assert_eq!(snapshot.location("eu").unwrap().free_mb, 7168);
    }

    #[tokio::test]
    async fn test_load_from_disk_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CapacityCache::new(&dir.path().join("nope.json"));

        assert!(!cache.load_from_disk().await.unwrap());
        assert!(cache.snapshot().await.is_none());
    }
}
