use nova_build_deps::{
    ArtifactTracker, BuildOutput, DependencyBuilder, DependencyTracker, DepsError,
};
use nova_build_graph::{
    BuildGraph, Label, SnapshotHolder, SnapshotMetadata, TargetKind, TargetNode,
};
use pretty_assertions::assert_eq;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tempfile::tempdir;

fn label(text: &str) -> Label {
    Label::parse(text).unwrap()
}

fn labels<const N: usize>(texts: [&str; N]) -> BTreeSet<Label> {
    texts.into_iter().map(label).collect()
}

/// Replies with a canned output for every build and records what was requested.
#[derive(Clone, Debug, Default)]
struct RecordingBuilder {
    calls: Arc<Mutex<Vec<BTreeSet<Label>>>>,
    reply: Arc<Mutex<Option<BuildOutput>>>,
}

impl RecordingBuilder {
    fn replying(output: BuildOutput) -> Self {
        let builder = Self::default();
        *builder.reply.lock().unwrap() = Some(output);
        builder
    }

    fn calls(&self) -> Vec<BTreeSet<Label>> {
        self.calls.lock().unwrap().clone()
    }
}

impl DependencyBuilder for RecordingBuilder {
    fn build(&self, targets: &BTreeSet<Label>) -> anyhow::Result<BuildOutput> {
        self.calls.lock().unwrap().push(targets.clone());
        match self.reply.lock().unwrap().clone() {
            Some(output) => Ok(output),
            None => Ok(BuildOutput::succeeded(targets.iter().cloned())),
        }
    }
}

#[derive(Debug)]
struct FailingBuilder;

impl DependencyBuilder for FailingBuilder {
    fn build(&self, _targets: &BTreeSet<Label>) -> anyhow::Result<BuildOutput> {
        anyhow::bail!("bazel exited with status 37")
    }
}

fn graph() -> BuildGraph {
    BuildGraph::new([
        TargetNode::new(label("//lib:a"), TargetKind::SupportedSymbolLanguage)
            .with_sources(["lib/A.java"])
            .with_deps([label("@guava//jar:jar"), label("@gson//:gson")]),
        TargetNode::new(label("//native:lib"), TargetKind::OpaqueNative)
            .with_sources(["native/lib.cc"])
            .with_deps([label("@zlib//:zlib")]),
    ])
    .unwrap()
}

fn tracker_with(builder: Arc<dyn DependencyBuilder>) -> DependencyTracker {
    let project = Arc::new(SnapshotHolder::new());
    project.publish(graph(), SnapshotMetadata::now());
    DependencyTracker::new(project, Arc::new(ArtifactTracker::new()), builder)
}

#[test]
fn builds_only_what_is_pending() {
    let builder = RecordingBuilder::default();
    let tracker = tracker_with(Arc::new(builder.clone()));
    tracker.artifacts().record_built([label("@gson//:gson")]);

    let outcome = tracker.build_dependencies_for_paths(["lib/A.java"]).unwrap();
    assert_eq!(outcome.snapshot_version, 1);
    assert_eq!(outcome.pending, labels(["@guava//jar:jar"]));
    assert_eq!(outcome.built, labels(["@guava//jar:jar"]));
    assert!(outcome.not_built.is_empty());
    assert_eq!(builder.calls(), vec![labels(["@guava//jar:jar"])]);

    // Everything is cached now; a second request does not reach the builder.
    let outcome = tracker.build_dependencies_for_paths(["lib/A.java"]).unwrap();
    assert!(!outcome.did_build());
    assert_eq!(builder.calls().len(), 1);
    assert!(tracker
        .pending_external_deps(&outcome.requested.expected_dependency_targets)
        .is_empty());
}

#[test]
fn building_a_target_requests_exactly_that_target() {
    let builder = RecordingBuilder::default();
    let tracker = tracker_with(Arc::new(builder.clone()));

    let outcome = tracker
        .build_dependencies_for_target(label("//lib:a"))
        .unwrap();
    assert_eq!(outcome.requested.build_targets, labels(["//lib:a"]));
    assert_eq!(builder.calls(), vec![labels(["//lib:a"])]);
    assert!(tracker.artifacts().is_cached(&label("//lib:a")));
}

#[test]
fn opaque_target_inputs_are_recorded() {
    let tracker = tracker_with(Arc::new(RecordingBuilder::replying(BuildOutput {
        exit_code: 0,
        artifacts: BTreeMap::from([(
            label("//native:lib"),
            vec![PathBuf::from("bazel-out/native/liblib.a")],
        )]),
        targets_with_errors: BTreeSet::new(),
    })));

    let outcome = tracker
        .build_dependencies_for_paths(["native/lib.cc"])
        .unwrap();
    assert_eq!(outcome.built, labels(["//native:lib"]));

    let entry = tracker.artifacts().entry(&label("//native:lib")).unwrap();
    assert_eq!(
        entry.artifacts,
        vec![PathBuf::from("bazel-out/native/liblib.a")]
    );
    let inputs: Vec<PathBuf> = entry.inputs.into_iter().map(|input| input.path).collect();
    assert_eq!(
        inputs,
        vec![PathBuf::from("native/lib.cc"), PathBuf::from("native/BUILD")]
    );
}

#[test]
fn alias_outputs_are_attributed_to_the_requested_label() {
    let tracker = tracker_with(Arc::new(RecordingBuilder::replying(BuildOutput {
        exit_code: 0,
        artifacts: BTreeMap::from([
            (
                label("@maven//:com_google_guava_guava"),
                vec![PathBuf::from("external/maven/guava.jar")],
            ),
            (label("@gson//:gson"), vec![PathBuf::from("external/gson.jar")]),
        ]),
        targets_with_errors: BTreeSet::new(),
    })));

    let outcome = tracker.build_dependencies_for_paths(["lib/A.java"]).unwrap();
    assert_eq!(outcome.built, labels(["@guava//jar:jar", "@gson//:gson"]));
    assert!(outcome.not_built.is_empty());
    assert_eq!(
        tracker.artifacts().cached_artifacts(&label("@guava//jar:jar")),
        Some(vec![PathBuf::from("external/maven/guava.jar")])
    );
    assert!(!tracker
        .artifacts()
        .is_cached(&label("@maven//:com_google_guava_guava")));
}

#[test]
fn targets_with_errors_are_not_recorded() {
    let tracker = tracker_with(Arc::new(RecordingBuilder::replying(BuildOutput {
        exit_code: 1,
        artifacts: BTreeMap::from([
            (label("@guava//jar:jar"), vec![PathBuf::from("guava.jar")]),
            (label("@gson//:gson"), Vec::new()),
        ]),
        targets_with_errors: labels(["@gson//:gson"]),
    })));

    let outcome = tracker.build_dependencies_for_paths(["lib/A.java"]).unwrap();
    assert_eq!(outcome.built, labels(["@guava//jar:jar"]));
    assert_eq!(outcome.not_built, labels(["@gson//:gson"]));
    assert_eq!(outcome.targets_with_errors, labels(["@gson//:gson"]));
    assert_eq!(
        *tracker.artifacts().live_cached_targets(),
        labels(["@guava//jar:jar"])
    );
}

#[test]
fn empty_build_output_is_an_error() {
    let tracker = tracker_with(Arc::new(RecordingBuilder::replying(BuildOutput {
        exit_code: 1,
        ..BuildOutput::default()
    })));

    let err = tracker
        .build_dependencies_for_paths(["lib/A.java"])
        .unwrap_err();
    assert!(matches!(err, DepsError::NoDependenciesBuilt), "{err}");
    assert!(tracker.artifacts().is_empty());
}

#[test]
fn builder_failures_are_surfaced() {
    let tracker = tracker_with(Arc::new(FailingBuilder));
    let err = tracker
        .build_dependencies_for_paths(["lib/A.java"])
        .unwrap_err();
    assert!(matches!(err, DepsError::Build(_)), "{err}");
    assert!(err.to_string().contains("status 37"), "{err}");
}

#[test]
fn building_without_a_snapshot_requires_sync() {
    let tracker = DependencyTracker::new(
        Arc::new(SnapshotHolder::new()),
        Arc::new(ArtifactTracker::new()),
        Arc::new(FailingBuilder),
    );
    let err = tracker
        .build_dependencies_for_paths(["lib/A.java"])
        .unwrap_err();
    assert!(matches!(err, DepsError::SyncRequired), "{err}");
}

#[test]
fn changed_inputs_make_built_targets_pending_again() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("native")).unwrap();
    fs::write(dir.path().join("native/lib.cc"), "int f() { return 1; }").unwrap();
    fs::write(dir.path().join("native/BUILD"), "cc_library(name = \"lib\")").unwrap();

    let project = Arc::new(SnapshotHolder::new());
    project.publish(graph(), SnapshotMetadata::now());
    let artifacts = Arc::new(ArtifactTracker::new().with_workspace_root(dir.path()));
    let tracker = DependencyTracker::new(
        project,
        Arc::clone(&artifacts),
        Arc::new(RecordingBuilder::default()),
    );

    tracker
        .build_dependencies_for_paths(["native/lib.cc"])
        .unwrap();
    assert_eq!(artifacts.invalidate_stale(), 0);
    assert_eq!(
        tracker.pending_targets_for_path("native/lib.cc"),
        Some(BTreeSet::new())
    );

    fs::write(dir.path().join("native/lib.cc"), "int f() { return 2; }").unwrap();
    assert_eq!(artifacts.invalidate_stale(), 1);
    assert_eq!(
        tracker.pending_targets_for_path("native/lib.cc"),
        Some(labels(["//native:lib"]))
    );
}
