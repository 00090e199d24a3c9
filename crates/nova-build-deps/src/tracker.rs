use crate::{
    artifact::ArtifactTracker,
    builder::{BuildOutput, DependencyBuilder},
    error::{DepsError, Result},
};
use nova_build_graph::{BuildGraph, Label, ProjectSnapshot, SnapshotHolder};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Why a requested path resolved to no targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// The path lies inside a package but no target lists it as a source.
    UntrackedInPackage { build_file: PathBuf },
    /// No synced package encloses the path.
    OutsideProject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPath {
    pub path: PathBuf,
    pub reason: UnresolvedReason,
}

/// Targets owning a set of paths, and what has to be built before they can be analyzed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestedTargets {
    pub build_targets: BTreeSet<Label>,
    pub expected_dependency_targets: BTreeSet<Label>,
    /// Paths that contributed no targets. Not an error; reported so callers can tell an
    /// untracked file from one outside the synced project.
    pub unresolved: Vec<UnresolvedPath>,
}

/// Resolve `paths` (workspace-relative) to their owning targets against `snapshot`.
///
/// Returns `None` when there is no snapshot yet, i.e. a sync is required before the question
/// can be answered. Each path resolves, in order of precedence, as a known source file, a
/// BUILD file, or a directory containing packages; anything else is recorded in
/// [`RequestedTargets::unresolved`] and skipped.
pub fn compute_requested_targets<P: AsRef<Path>>(
    snapshot: Option<&ProjectSnapshot>,
    paths: impl IntoIterator<Item = P>,
) -> Option<RequestedTargets> {
    let graph = snapshot?.graph();

    let mut requested = RequestedTargets::default();
    for path in paths {
        let path = path.as_ref();
        match owning_targets(graph, path) {
            Ok(owners) => requested.build_targets.extend(owners),
            Err(reason) => {
                tracing::debug!(
                    target = "nova.build.deps",
                    path = %path.display(),
                    reason = ?reason,
                    "no targets own path"
                );
                requested.unresolved.push(UnresolvedPath {
                    path: path.to_path_buf(),
                    reason,
                });
            }
        }
    }

    for target in &requested.build_targets {
        requested
            .expected_dependency_targets
            .extend(graph.expected_dependencies(target).iter().cloned());
    }

    Some(requested)
}

fn owning_targets(
    graph: &BuildGraph,
    path: &Path,
) -> std::result::Result<BTreeSet<Label>, UnresolvedReason> {
    if let Some(owners) = graph.owners_of_source(path) {
        return Ok(owners.clone());
    }
    if let Some(targets) = graph.targets_in_build_file(path) {
        return Ok(targets.clone());
    }

    let under_directory = graph.targets_under_directory(path);
    if !under_directory.is_empty() {
        return Ok(under_directory);
    }

    Err(match graph.package_containing(path) {
        Some(build_file) => UnresolvedReason::UntrackedInPackage {
            build_file: build_file.to_path_buf(),
        },
        None => UnresolvedReason::OutsideProject,
    })
}

/// Result of a dependency build request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildDepsOutcome {
    /// Version of the snapshot the request was resolved against.
    pub snapshot_version: u64,
    pub requested: RequestedTargets,
    /// Labels handed to the builder. Empty when everything was already cached.
    pub pending: BTreeSet<Label>,
    /// Labels recorded as built.
    pub built: BTreeSet<Label>,
    /// Pending labels that are still not cached after the build. Disjoint from `built`.
    pub not_built: BTreeSet<Label>,
    pub targets_with_errors: BTreeSet<Label>,
}

impl BuildDepsOutcome {
    /// Whether the builder was invoked at all.
    pub fn did_build(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Answers "what still needs building" for edited paths, and builds it on request.
#[derive(Debug)]
pub struct DependencyTracker {
    project: Arc<SnapshotHolder>,
    artifacts: Arc<ArtifactTracker>,
    builder: Arc<dyn DependencyBuilder>,
    workspace_root: Option<PathBuf>,
}

impl DependencyTracker {
    pub fn new(
        project: Arc<SnapshotHolder>,
        artifacts: Arc<ArtifactTracker>,
        builder: Arc<dyn DependencyBuilder>,
    ) -> Self {
        Self {
            project,
            artifacts,
            builder,
            workspace_root: None,
        }
    }

    /// Accept absolute paths under `root`, relativizing them before lookup.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn artifacts(&self) -> &ArtifactTracker {
        &self.artifacts
    }

    /// [`compute_requested_targets`] against the current snapshot.
    pub fn requested_targets<P: AsRef<Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Option<RequestedTargets> {
        let snapshot = self.project.current()?;
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|path| self.workspace_relative(path.as_ref()))
            .collect();
        compute_requested_targets(Some(snapshot.as_ref()), paths)
    }

    /// `labels` minus the live cached targets.
    pub fn pending_external_deps(&self, labels: &BTreeSet<Label>) -> BTreeSet<Label> {
        if labels.is_empty() {
            return BTreeSet::new();
        }
        let cached = self.artifacts.live_cached_targets();
        labels.difference(&cached).cloned().collect()
    }

    /// What still needs building before `path` can be analyzed.
    ///
    /// A file owned by several targets is ready as soon as one of them is: the smallest
    /// pending set among the owners is returned. `None` if there is no snapshot or nothing
    /// owns the path.
    pub fn pending_targets_for_path(&self, path: impl AsRef<Path>) -> Option<BTreeSet<Label>> {
        let snapshot = self.project.current()?;
        let path = self.workspace_relative(path.as_ref());
        let owners = owning_targets(snapshot.graph(), &path).ok()?;

        let cached = self.artifacts.live_cached_targets();
        owners
            .iter()
            .map(|owner| {
                snapshot
                    .graph()
                    .expected_dependencies(owner)
                    .difference(&cached)
                    .cloned()
                    .collect::<BTreeSet<_>>()
            })
            .min_by_key(BTreeSet::len)
    }

    /// Build whatever the targets owning `paths` are still missing.
    pub fn build_dependencies_for_paths<P: AsRef<Path>>(
        &self,
        paths: impl IntoIterator<Item = P>,
    ) -> Result<BuildDepsOutcome> {
        let snapshot = self.project.current().ok_or(DepsError::SyncRequired)?;
        let paths: Vec<PathBuf> = paths
            .into_iter()
            .map(|path| self.workspace_relative(path.as_ref()))
            .collect();
        let requested = compute_requested_targets(Some(snapshot.as_ref()), paths)
            .ok_or(DepsError::SyncRequired)?;
        self.build_requested(&snapshot, requested)
    }

    /// Build `target` itself, regardless of its kind.
    pub fn build_dependencies_for_target(&self, target: Label) -> Result<BuildDepsOutcome> {
        let snapshot = self.project.current().ok_or(DepsError::SyncRequired)?;
        let requested = RequestedTargets {
            build_targets: BTreeSet::from([target.clone()]),
            expected_dependency_targets: BTreeSet::from([target]),
            unresolved: Vec::new(),
        };
        self.build_requested(&snapshot, requested)
    }

    fn build_requested(
        &self,
        snapshot: &ProjectSnapshot,
        requested: RequestedTargets,
    ) -> Result<BuildDepsOutcome> {
        let pending = self.pending_external_deps(&requested.expected_dependency_targets);
        let mut outcome = BuildDepsOutcome {
            snapshot_version: snapshot.version(),
            requested,
            pending,
            ..BuildDepsOutcome::default()
        };
        if outcome.pending.is_empty() {
            tracing::debug!(
                target = "nova.build.deps",
                build_targets = outcome.requested.build_targets.len(),
                "all expected dependencies are cached"
            );
            return Ok(outcome);
        }

        tracing::info!(
            target = "nova.build.deps",
            snapshot_version = snapshot.version(),
            pending = outcome.pending.len(),
            "building dependencies"
        );
        let output = self
            .builder
            .build(&outcome.pending)
            .map_err(DepsError::Build)?;
        report_errors(snapshot.graph(), &output)?;

        let inputs = input_files(snapshot.graph(), &outcome.pending);
        let update = self
            .artifacts
            .record_build_output(&outcome.pending, &output, &inputs);

        outcome.built = update.recorded;
        outcome.not_built = update.not_built;
        outcome.targets_with_errors = output.targets_with_errors;
        Ok(outcome)
    }

    fn workspace_relative(&self, path: &Path) -> PathBuf {
        match &self.workspace_root {
            Some(root) if path.is_absolute() => path
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.to_path_buf()),
            _ => path.to_path_buf(),
        }
    }
}

fn report_errors(graph: &BuildGraph, output: &BuildOutput) -> Result<()> {
    if output.is_empty() {
        return Err(DepsError::NoDependenciesBuilt);
    }

    if !output.targets_with_errors.is_empty() {
        let (project, external): (Vec<&Label>, Vec<&Label>) = output
            .targets_with_errors
            .iter()
            .partition(|label| !label.is_external() && graph.contains(label));
        if !external.is_empty() {
            tracing::warn!(
                target = "nova.build.deps",
                count = external.len(),
                targets = %summarize(&external),
                "external dependencies had build errors"
            );
        }
        if !project.is_empty() {
            tracing::warn!(
                target = "nova.build.deps",
                count = project.len(),
                targets = %summarize(&project),
                "project targets had build errors"
            );
        }
    } else if !output.is_success() {
        // Errors in BUILD files fail the build before any action runs.
        tracing::warn!(
            target = "nova.build.deps",
            exit_code = output.exit_code,
            "dependency build finished with errors"
        );
    }
    Ok(())
}

fn summarize(labels: &[&Label]) -> String {
    const LIMIT: usize = 10;
    let mut out = labels
        .iter()
        .take(LIMIT)
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if labels.len() > LIMIT {
        out.push_str(&format!(" and {} more", labels.len() - LIMIT));
    }
    out
}

/// Workspace inputs of each in-project label, used to detect stale artifacts later.
fn input_files(graph: &BuildGraph, labels: &BTreeSet<Label>) -> BTreeMap<Label, Vec<PathBuf>> {
    labels
        .iter()
        .filter(|label| !label.is_external())
        .filter_map(|label| {
            let node = graph.get(label)?;
            let mut inputs: Vec<PathBuf> = node.sources.iter().cloned().collect();
            inputs.push(node.build_file.clone());
            Some((label.clone(), inputs))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_build_graph::{SnapshotMetadata, TargetKind, TargetNode};

    fn label(text: &str) -> Label {
        Label::parse(text).unwrap()
    }

    #[test]
    fn summarize_truncates_long_lists() {
        let labels: Vec<Label> = (0..12)
            .map(|i| Label::new("ext", "", format!("t{i}")))
            .collect();
        let refs: Vec<&Label> = labels.iter().collect();
        let summary = summarize(&refs);
        assert!(summary.starts_with("@ext//:t0, @ext//:t1"), "{summary}");
        assert!(summary.ends_with(" and 2 more"), "{summary}");
    }

    #[test]
    fn input_files_cover_sources_and_build_file_of_project_targets() {
        let graph = BuildGraph::new([TargetNode::new(label("//native:lib"), TargetKind::OpaqueNative)
            .with_sources(["native/lib.cc"])])
        .unwrap();
        let inputs = input_files(
            &graph,
            &BTreeSet::from([label("//native:lib"), label("@zlib//:zlib")]),
        );
        assert_eq!(
            inputs,
            BTreeMap::from([(
                label("//native:lib"),
                vec![PathBuf::from("native/lib.cc"), PathBuf::from("native/BUILD")]
            )])
        );
    }

    #[test]
    fn unresolved_paths_distinguish_untracked_files() {
        let snapshot = ProjectSnapshot::new(
            BuildGraph::new([TargetNode::new(
                label("//lib:a"),
                TargetKind::SupportedSymbolLanguage,
            )
            .with_sources(["lib/A.java"])])
            .unwrap(),
            1,
            SnapshotMetadata::now(),
        );

        let requested =
            compute_requested_targets(Some(&snapshot), ["lib/Untracked.java", "other/B.java"])
                .unwrap();
        assert!(requested.build_targets.is_empty());
        assert_eq!(
            requested.unresolved,
            vec![
                UnresolvedPath {
                    path: PathBuf::from("lib/Untracked.java"),
                    reason: UnresolvedReason::UntrackedInPackage {
                        build_file: PathBuf::from("lib/BUILD"),
                    },
                },
                UnresolvedPath {
                    path: PathBuf::from("other/B.java"),
                    reason: UnresolvedReason::OutsideProject,
                },
            ]
        );
    }
}
