use nova_build_graph::Label;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

/// What a dependency build reported back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Exit code of the build tool; `0` is success.
    pub exit_code: i32,
    /// Output files per target that was actually built. A target that produced no files still
    /// appears with an empty list.
    pub artifacts: BTreeMap<Label, Vec<PathBuf>>,
    pub targets_with_errors: BTreeSet<Label>,
}

impl BuildOutput {
    /// A successful build of `targets` that produced no files.
    pub fn succeeded(targets: impl IntoIterator<Item = Label>) -> Self {
        Self {
            exit_code: 0,
            artifacts: targets.into_iter().map(|label| (label, Vec::new())).collect(),
            targets_with_errors: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builds a set of pending targets. Implementations run the build tool and may block; callers
/// invoke them off latency-sensitive threads.
pub trait DependencyBuilder: Send + Sync + std::fmt::Debug {
    fn build(&self, targets: &BTreeSet<Label>) -> anyhow::Result<BuildOutput>;
}
