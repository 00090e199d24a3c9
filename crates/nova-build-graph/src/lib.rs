//! Immutable build graph model for Bazel query sync.
//!
//! This crate holds the data that a sync produces and that every dependency query reads:
//! - [`Label`]: structured target identifiers (`//pkg:name`, `@repo//pkg:name`)
//! - [`BuildGraph`]: targets keyed by label, with source / BUILD file / reverse-dep indices
//! - [`ProjectSnapshot`] and [`SnapshotHolder`]: versioned graphs published by atomic swap
//!
//! Nothing here runs Bazel. Query output is parsed elsewhere and handed over as
//! [`QueryTarget`] records or ready-made [`TargetNode`]s.

mod graph;
mod label;
mod snapshot;
mod target;

pub use crate::{
    graph::{BuildGraph, GraphError},
    label::{Label, LabelError},
    snapshot::{ProjectSnapshot, SnapshotHolder, SnapshotMetadata},
    target::{QueryTarget, TargetKind, TargetNode},
};
