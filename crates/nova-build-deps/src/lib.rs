//! Dependency tracking for Bazel query sync.
//!
//! Given edited files, BUILD files or directories, this crate works out which targets outside
//! the editable workspace have to be built before the IDE can analyze them, and remembers
//! which of those are already built:
//! - [`compute_requested_targets`] resolves paths to owning targets and their expected
//!   dependency closure against one [`ProjectSnapshot`](nova_build_graph::ProjectSnapshot)
//! - [`ArtifactTracker`] keeps the set of live cached targets, persisted across restarts
//! - [`DependencyTracker`] ties both to a pluggable [`DependencyBuilder`]

mod artifact;
mod builder;
mod config;
mod error;
mod tracker;

pub use crate::{
    artifact::{
        digest_file, ArtifactEntry, ArtifactTracker, FileDigest, UpdateResult,
        ARTIFACT_STATE_SCHEMA_VERSION,
    },
    builder::{BuildOutput, DependencyBuilder},
    config::{init_tracing, ConfigError, DepsConfig, LoggingConfig, DEFAULT_STATE_FILE},
    error::DepsError,
    tracker::{
        compute_requested_targets, BuildDepsOutcome, DependencyTracker, RequestedTargets,
        UnresolvedPath, UnresolvedReason,
    },
};
