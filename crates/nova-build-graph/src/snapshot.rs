use crate::graph::BuildGraph;
use parking_lot::RwLock;
use std::{sync::Arc, time::SystemTime};

/// Information about the query run a snapshot was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// blake3 digest (hex) of the raw query output, when the sync pipeline provides it.
    pub query_digest: Option<String>,
    pub created_at: SystemTime,
}

impl SnapshotMetadata {
    pub fn now() -> Self {
        Self {
            query_digest: None,
            created_at: SystemTime::now(),
        }
    }

    /// Metadata carrying the digest of `query_output`.
    pub fn for_query_output(query_output: &[u8]) -> Self {
        Self {
            query_digest: Some(blake3::hash(query_output).to_hex().to_string()),
            created_at: SystemTime::now(),
        }
    }
}

impl Default for SnapshotMetadata {
    fn default() -> Self {
        Self::now()
    }
}

/// One published, immutable view of the project's build graph.
#[derive(Debug, Clone)]
pub struct ProjectSnapshot {
    graph: Arc<BuildGraph>,
    version: u64,
    metadata: SnapshotMetadata,
}

impl ProjectSnapshot {
    /// A standalone snapshot. Snapshots shared between threads should be published through a
    /// [`SnapshotHolder`], which assigns versions.
    pub fn new(graph: BuildGraph, version: u64, metadata: SnapshotMetadata) -> Self {
        Self {
            graph: Arc::new(graph),
            version,
            metadata,
        }
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }
}

/// The single shared reference to the current project snapshot.
///
/// The sync pipeline publishes complete snapshots; readers call [`SnapshotHolder::current`]
/// once per operation and keep using that `Arc` for the rest of it, so a publication that
/// lands mid-operation is never observed half-way.
#[derive(Debug, Default)]
pub struct SnapshotHolder {
    state: RwLock<HolderState>,
}

#[derive(Debug, Default)]
struct HolderState {
    current: Option<Arc<ProjectSnapshot>>,
    /// Survives [`SnapshotHolder::clear`] so versions never repeat.
    last_version: u64,
}

impl SnapshotHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest published snapshot, or `None` before the first sync completes.
    pub fn current(&self) -> Option<Arc<ProjectSnapshot>> {
        self.state.read().current.clone()
    }

    /// Wrap `graph` in a new snapshot and make it current.
    ///
    /// Versions start at 1 and increase by one with every publication of this holder.
    pub fn publish(&self, graph: BuildGraph, metadata: SnapshotMetadata) -> Arc<ProjectSnapshot> {
        let graph = Arc::new(graph);
        let mut state = self.state.write();
        state.last_version = state.last_version.saturating_add(1);
        let version = state.last_version;
        let snapshot = Arc::new(ProjectSnapshot {
            graph,
            version,
            metadata,
        });
        state.current = Some(Arc::clone(&snapshot));
        drop(state);

        tracing::debug!(
            target = "nova.build.graph",
            version,
            targets = snapshot.graph.len(),
            "published project snapshot"
        );
        snapshot
    }

    /// Drop the current snapshot, e.g. when the project is closed or a full re-sync starts.
    pub fn clear(&self) {
        self.state.write().current = None;
    }
}
