use crate::{
    builder::BuildOutput,
    error::{DepsError, Result},
};
use nova_build_graph::Label;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::sync::OnceLock;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    fs, io,
    io::Write,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

pub const ARTIFACT_STATE_SCHEMA_VERSION: u32 = 1;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: PathBuf,
    pub digest_hex: String,
}

/// What is known about one built target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Output files of the build. May be empty for targets that produce none.
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Digests of the inputs the outputs were built from, for staleness checks.
    #[serde(default)]
    pub inputs: Vec<FileDigest>,
}

/// Result of merging a build's output into the tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Labels that are now live.
    pub recorded: BTreeSet<Label>,
    /// Expected labels that are not live after the build: unreported ones no alias stood in
    /// for, and ones that reported errors.
    pub not_built: BTreeSet<Label>,
    pub updated_files: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct ArtifactState {
    entries: BTreeMap<Label, ArtifactEntry>,
    /// Keys of `entries`, rebuilt on every change and handed out to readers as-is.
    live: Arc<BTreeSet<Label>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    schema_version: u32,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    target: Label,
    #[serde(flatten)]
    entry: ArtifactEntry,
}

/// The set of targets whose most recent build succeeded and whose inputs have not changed
/// since.
///
/// Readers get an immutable `Arc` snapshot of the live set and never block writers for longer
/// than an `Arc` clone. Writers copy the state, modify the copy and publish it. When a state
/// file is configured, every change is written to it (best effort) so built targets stay usable
/// across restarts.
#[derive(Debug, Default)]
pub struct ArtifactTracker {
    state: RwLock<Arc<ArtifactState>>,
    state_file: Option<PathBuf>,
    workspace_root: Option<PathBuf>,
    /// Serializes writes of the state file.
    persist_lock: Mutex<()>,
}

impl ArtifactTracker {
    /// An in-memory tracker with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load previously recorded state from `path` and persist future changes to it.
    ///
    /// A missing file starts empty. An unreadable, corrupt or incompatible file is discarded
    /// and the tracker starts empty.
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        tracing::debug!(
            target = "nova.build.deps",
            path = %path.display(),
            entries = entries.len(),
            "loaded artifact state"
        );
        *self.state.get_mut() = Arc::new(ArtifactState::from_entries(entries));
        self.state_file = Some(path);
        self
    }

    /// Resolve relative input paths against `root` when digesting them.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    /// A consistent snapshot of the live cached targets.
    pub fn live_cached_targets(&self) -> Arc<BTreeSet<Label>> {
        Arc::clone(&self.state.read().live)
    }

    pub fn is_cached(&self, label: &Label) -> bool {
        self.state.read().entries.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Output files recorded for `label`. `None` if the label has not been built; an empty
    /// list means it was built and produced no files.
    pub fn cached_artifacts(&self, label: &Label) -> Option<Vec<PathBuf>> {
        self.state
            .read()
            .entries
            .get(label)
            .map(|entry| entry.artifacts.clone())
    }

    pub fn entry(&self, label: &Label) -> Option<ArtifactEntry> {
        self.state.read().entries.get(label).cloned()
    }

    /// Mark `labels` as successfully built.
    ///
    /// Existing artifact records are kept. Inputs already recorded for a label are digested
    /// again, so staleness is measured against the files this build saw.
    pub fn record_built(&self, labels: impl IntoIterator<Item = Label>) {
        let labels: Vec<Label> = labels.into_iter().collect();
        if labels.is_empty() {
            return;
        }

        let snapshot = Arc::clone(&*self.state.read());
        let refreshed: Vec<(Label, Option<Vec<FileDigest>>)> = labels
            .into_iter()
            .map(|label| {
                let inputs = snapshot
                    .entries
                    .get(&label)
                    .filter(|entry| !entry.inputs.is_empty())
                    .map(|entry| {
                        let paths: Vec<PathBuf> =
                            entry.inputs.iter().map(|input| input.path.clone()).collect();
                        self.digest_inputs(&paths)
                    });
                (label, inputs)
            })
            .collect();
        drop(snapshot);

        self.mutate(|entries| {
            let mut changed = false;
            for (label, inputs) in refreshed {
                match entries.entry(label) {
                    Entry::Vacant(vacant) => {
                        vacant.insert(ArtifactEntry::default());
                        changed = true;
                    }
                    Entry::Occupied(mut occupied) => {
                        if let Some(inputs) = inputs {
                            if occupied.get().inputs != inputs {
                                occupied.get_mut().inputs = inputs;
                                changed = true;
                            }
                        }
                    }
                }
            }
            changed
        });
    }

    /// Record `label` as built with the given outputs, digesting `inputs` now so later
    /// changes to them make the entry stale.
    pub fn record_artifacts(&self, label: Label, artifacts: Vec<PathBuf>, inputs: &[PathBuf]) {
        let inputs = self.digest_inputs(inputs);
        self.mutate(|entries| {
            entries.insert(label, ArtifactEntry { artifacts, inputs });
            true
        });
    }

    /// Merge a build's output, given the labels that were expected to be built.
    ///
    /// Expected labels reported by the build are recorded with their outputs. A build may
    /// report a different label than requested (an alias resolving to its `actual` target);
    /// outputs of such unexpected labels are attributed to every expected label the build did
    /// not report. Targets with errors are never recorded.
    pub fn record_build_output(
        &self,
        expected: &BTreeSet<Label>,
        output: &BuildOutput,
        inputs: &BTreeMap<Label, Vec<PathBuf>>,
    ) -> UpdateResult {
        let built: BTreeSet<Label> = output
            .artifacts
            .keys()
            .filter(|label| expected.contains(*label))
            .cloned()
            .collect();
        let unreported: BTreeSet<Label> = expected.difference(&built).cloned().collect();

        let mut staged: BTreeMap<Label, Vec<PathBuf>> = BTreeMap::new();
        for (label, paths) in &output.artifacts {
            if expected.contains(label) {
                staged.entry(label.clone()).or_default().extend(paths.iter().cloned());
            } else {
                for missing in &unreported {
                    staged
                        .entry(missing.clone())
                        .or_default()
                        .extend(paths.iter().cloned());
                }
            }
        }
        staged.retain(|label, _| !output.targets_with_errors.contains(label));

        for label in unreported.iter().filter(|label| !staged.contains_key(*label)) {
            tracing::warn!(
                target = "nova.build.deps",
                label = %label,
                "target was not built"
            );
        }

        let mut result = UpdateResult::default();
        if staged.is_empty() {
            result.not_built = expected.clone();
            return result;
        }

        let staged: Vec<(Label, ArtifactEntry)> = staged
            .into_iter()
            .map(|(label, artifacts)| {
                let inputs = inputs
                    .get(&label)
                    .map(|paths| self.digest_inputs(paths))
                    .unwrap_or_default();
                (label, ArtifactEntry { artifacts, inputs })
            })
            .collect();

        for (label, entry) in &staged {
            result.recorded.insert(label.clone());
            result.updated_files.extend(entry.artifacts.iter().cloned());
        }
        result.not_built = expected.difference(&result.recorded).cloned().collect();

        self.mutate(|entries| {
            entries.extend(staged);
            true
        });
        result
    }

    /// Remove `labels` from the live set. Returns how many were cached.
    pub fn invalidate<'a>(&self, labels: impl IntoIterator<Item = &'a Label>) -> usize {
        let labels: BTreeSet<&Label> = labels.into_iter().collect();
        self.invalidate_where(|label, _| labels.contains(label))
    }

    /// Remove every entry matching `predicate`. Returns how many were removed.
    ///
    /// The predicate runs against a snapshot with no lock held, so it may call back into the
    /// tracker. An entry re-recorded while the predicate runs is kept.
    pub fn invalidate_where(
        &self,
        mut predicate: impl FnMut(&Label, &ArtifactEntry) -> bool,
    ) -> usize {
        let snapshot = Arc::clone(&*self.state.read());
        let matching: BTreeMap<&Label, &ArtifactEntry> = snapshot
            .entries
            .iter()
            .filter(|(label, entry)| predicate(*label, *entry))
            .collect();
        self.remove_unchanged(&matching)
    }

    /// Remove entries built from any of `changed` (paths as recorded, typically
    /// workspace-relative).
    pub fn invalidate_changed_inputs(&self, changed: &[PathBuf]) -> usize {
        if changed.is_empty() {
            return 0;
        }
        self.invalidate_where(|_, entry| {
            entry
                .inputs
                .iter()
                .any(|input| changed.iter().any(|c| c == &input.path))
        })
    }

    /// Re-digest every recorded input and remove entries whose inputs changed on disk.
    ///
    /// Digesting happens outside the lock; an entry re-recorded in the meantime is kept.
    pub fn invalidate_stale(&self) -> usize {
        let snapshot = Arc::clone(&*self.state.read());
        let stale: BTreeMap<&Label, &ArtifactEntry> = snapshot
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .inputs
                    .iter()
                    .any(|input| self.digest_input(&input.path) != input.digest_hex)
            })
            .collect();
        self.remove_unchanged(&stale)
    }

    /// Remove the given entries unless they were replaced since they were read.
    fn remove_unchanged(&self, matching: &BTreeMap<&Label, &ArtifactEntry>) -> usize {
        if matching.is_empty() {
            return 0;
        }
        let mut removed = 0;
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|label, entry| matching.get(label).is_none_or(|old| **old != *entry));
            removed = before - entries.len();
            removed > 0
        });
        if removed > 0 {
            tracing::debug!(target = "nova.build.deps", removed, "invalidated cached targets");
        }
        removed
    }

    /// Forget every cached target.
    pub fn reset(&self) {
        self.mutate(|entries| {
            let changed = !entries.is_empty();
            entries.clear();
            changed
        });
    }

    /// Write the current state to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Arc::clone(&*self.state.read());
        save_entries(path, &snapshot.entries)
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<Label, ArtifactEntry>) -> bool) {
        let changed = {
            let mut guard = self.state.write();
            // Readers holding the previous `Arc` keep seeing the previous state.
            let state = Arc::make_mut(&mut *guard);
            let changed = f(&mut state.entries);
            if changed {
                state.live = Arc::new(state.entries.keys().cloned().collect());
            }
            changed
        };
        if changed {
            self.persist();
        }
    }

    fn persist(&self) {
        let Some(path) = &self.state_file else {
            return;
        };

        // Take the latest state under the persist lock so the last write always reflects
        // the newest change.
        let _guard = self.persist_lock.lock();
        let snapshot = Arc::clone(&*self.state.read());
        if let Err(err) = save_entries(path, &snapshot.entries) {
            tracing::debug!(
                target = "nova.build.deps",
                path = %path.display(),
                error = %err,
                "failed to persist artifact state"
            );
        }
    }

    fn digest_inputs(&self, paths: &[PathBuf]) -> Vec<FileDigest> {
        paths
            .iter()
            .map(|path| FileDigest {
                path: path.clone(),
                digest_hex: self.digest_input(path),
            })
            .collect()
    }

    fn digest_input(&self, path: &Path) -> String {
        let abs = match &self.workspace_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        };
        match digest_file(&abs) {
            Ok(digest) => digest.digest_hex,
            Err(DepsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                "absent".to_string()
            }
            // Unreadable inputs never match a recorded digest.
            Err(_) => "unreadable".to_string(),
        }
    }
}

impl ArtifactState {
    fn from_entries(entries: BTreeMap<Label, ArtifactEntry>) -> Self {
        let live = Arc::new(entries.keys().cloned().collect());
        Self { entries, live }
    }
}

/// blake3 digest of a file's contents.
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    let bytes = fs::read(path).map_err(|err| DepsError::io(path, err))?;
    Ok(FileDigest {
        path: path.to_path_buf(),
        digest_hex: blake3::hash(&bytes).to_hex().to_string(),
    })
}

fn load_entries(path: &Path) -> BTreeMap<Label, ArtifactEntry> {
    match read_entries(path) {
        Ok(entries) => entries,
        Err(DepsError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            BTreeMap::new()
        }
        Err(err) => {
            tracing::debug!(
                target = "nova.build.deps",
                path = %path.display(),
                error = %err,
                "failed to load artifact state; deleting and treating as empty"
            );
            if let Err(remove_err) = fs::remove_file(path) {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(
                        target = "nova.build.deps",
                        path = %path.display(),
                        error = %remove_err,
                        "failed to remove invalid artifact state file"
                    );
                }
            }
            BTreeMap::new()
        }
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<Label, ArtifactEntry>> {
    let data = fs::read_to_string(path).map_err(|err| DepsError::io(path, err))?;
    let persisted: PersistedState =
        serde_json::from_str(&data).map_err(|err| DepsError::json(path, &err))?;
    if persisted.schema_version != ARTIFACT_STATE_SCHEMA_VERSION {
        return Err(DepsError::IncompatibleSchemaVersion {
            expected: ARTIFACT_STATE_SCHEMA_VERSION,
            found: persisted.schema_version,
        });
    }
    Ok(persisted
        .entries
        .into_iter()
        .map(|persisted| (persisted.target, persisted.entry))
        .collect())
}

fn save_entries(path: &Path, entries: &BTreeMap<Label, ArtifactEntry>) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DepsError::io(path, io::Error::other("path has no parent")))?;
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    fs::create_dir_all(parent).map_err(|err| DepsError::io(parent, err))?;

    let persisted = PersistedState {
        schema_version: ARTIFACT_STATE_SCHEMA_VERSION,
        entries: entries
            .iter()
            .map(|(target, entry)| PersistedEntry {
                target: target.clone(),
                entry: entry.clone(),
            })
            .collect(),
    };
    let data = serde_json::to_string_pretty(&persisted).map_err(|err| DepsError::json(path, &err))?;

    let (tmp_path, mut file) =
        open_unique_tmp_file(path, parent).map_err(|err| DepsError::io(path, err))?;
    if let Err(err) = file
        .write_all(data.as_bytes())
        .and_then(|()| file.sync_all())
    {
        drop(file);
        remove_tmp_best_effort(&tmp_path);
        return Err(DepsError::io(&tmp_path, err));
    }
    drop(file);

    if let Err(err) = rename_replacing(&tmp_path, path) {
        remove_tmp_best_effort(&tmp_path);
        return Err(DepsError::io(path, err));
    }

    sync_dir_best_effort(parent);
    Ok(())
}

fn rename_replacing(from: &Path, to: &Path) -> io::Result<()> {
    // `rename` replaces the destination atomically on Unix. On Windows it fails when the
    // destination exists, so remove it and retry.
    const MAX_RENAME_ATTEMPTS: usize = 1024;
    let mut attempts = 0usize;
    loop {
        match fs::rename(from, to) {
            Ok(()) => return Ok(()),
            Err(err)
                if cfg!(windows)
                    && (err.kind() == io::ErrorKind::AlreadyExists || to.exists()) =>
            {
                match fs::remove_file(to) {
                    Ok(()) => {}
                    Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                    Err(remove_err) => return Err(remove_err),
                }
                attempts += 1;
                if attempts >= MAX_RENAME_ATTEMPTS {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn remove_tmp_best_effort(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(
                target = "nova.build.deps",
                path = %tmp_path.display(),
                error = %err,
                "failed to remove temporary artifact state file"
            );
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    static SYNC_DIR_ERROR_LOGGED: OnceLock<()> = OnceLock::new();

    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                if SYNC_DIR_ERROR_LOGGED.set(()).is_ok() {
                    tracing::debug!(
                        target = "nova.build.deps",
                        dir = %dir.display(),
                        error = %err,
                        "failed to sync directory (best effort)"
                    );
                }
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}
