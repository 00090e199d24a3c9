use crate::{
    label::{Label, LabelError},
    target::{QueryTarget, TargetKind, TargetNode},
};
use parking_lot::Mutex;
use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("target {0} appears more than once in the query output")]
    DuplicateLabel(Label),

    #[error("invalid label `{text}`: {source}")]
    InvalidLabel {
        text: String,
        #[source]
        source: LabelError,
    },
}

/// All targets produced by one query, plus the lookup indices derived from them.
///
/// A graph is never mutated after construction; a re-sync builds a new one. The graph may
/// contain cycles and may reference labels it does not contain: every traversal tracks a
/// visited set and treats unknown labels as leaves.
pub struct BuildGraph {
    targets: BTreeMap<Label, TargetNode>,
    /// Source file -> every target listing it in `sources`.
    source_owners: BTreeMap<PathBuf, BTreeSet<Label>>,
    /// BUILD file -> every target declared in it.
    build_file_targets: BTreeMap<PathBuf, BTreeSet<Label>>,
    /// Package directory -> its BUILD file.
    packages: BTreeMap<PathBuf, PathBuf>,
    reverse_deps: BTreeMap<Label, BTreeSet<Label>>,
    /// Memoized expected-dependency closures. Valid for the graph's whole lifetime.
    closures: Mutex<HashMap<Label, Arc<BTreeSet<Label>>>>,
}

impl BuildGraph {
    pub fn empty() -> Self {
        Self {
            targets: BTreeMap::new(),
            source_owners: BTreeMap::new(),
            build_file_targets: BTreeMap::new(),
            packages: BTreeMap::new(),
            reverse_deps: BTreeMap::new(),
            closures: Mutex::new(HashMap::new()),
        }
    }

    /// Build a graph from already-typed nodes.
    ///
    /// Fails on the first label that appears twice; a graph with ambiguous targets must not
    /// be published.
    pub fn new(nodes: impl IntoIterator<Item = TargetNode>) -> Result<Self, GraphError> {
        let mut graph = Self::empty();

        for node in nodes {
            for source in &node.sources {
                graph
                    .source_owners
                    .entry(source.clone())
                    .or_default()
                    .insert(node.label.clone());
            }

            graph
                .build_file_targets
                .entry(node.build_file.clone())
                .or_default()
                .insert(node.label.clone());
            let package_dir = node
                .build_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            graph
                .packages
                .entry(package_dir)
                .or_insert_with(|| node.build_file.clone());

            for dep in &node.direct_deps {
                graph
                    .reverse_deps
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.label.clone());
            }

            match graph.targets.entry(node.label.clone()) {
                Entry::Occupied(entry) => {
                    return Err(GraphError::DuplicateLabel(entry.key().clone()));
                }
                Entry::Vacant(entry) => {
                    entry.insert(node);
                }
            }
        }

        tracing::debug!(
            target = "nova.build.graph",
            targets = graph.targets.len(),
            source_files = graph.source_owners.len(),
            build_files = graph.build_file_targets.len(),
            "built build graph"
        );

        Ok(graph)
    }

    /// Build a graph from raw query records, parsing labels along the way.
    pub fn from_query(targets: impl IntoIterator<Item = QueryTarget>) -> Result<Self, GraphError> {
        let nodes = targets
            .into_iter()
            .map(|target| {
                target
                    .into_node()
                    .map_err(|(text, source)| GraphError::InvalidLabel { text, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(nodes)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn get(&self, label: &Label) -> Option<&TargetNode> {
        self.targets.get(label)
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.targets.contains_key(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.targets.keys()
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetNode> {
        self.targets.values()
    }

    pub fn source_files(&self) -> impl Iterator<Item = &Path> {
        self.source_owners.keys().map(PathBuf::as_path)
    }

    pub fn build_files(&self) -> impl Iterator<Item = &Path> {
        self.build_file_targets.keys().map(PathBuf::as_path)
    }

    pub fn is_source_file(&self, path: &Path) -> bool {
        self.source_owners.contains_key(path)
    }

    pub fn is_build_file(&self, path: &Path) -> bool {
        self.build_file_targets.contains_key(path)
    }

    /// Targets whose `sources` contain `path`. `None` if the path is not a known source.
    pub fn owners_of_source(&self, path: &Path) -> Option<&BTreeSet<Label>> {
        self.source_owners.get(path)
    }

    /// Targets declared in the BUILD file at `path`. `None` if it is not a known BUILD file.
    pub fn targets_in_build_file(&self, path: &Path) -> Option<&BTreeSet<Label>> {
        self.build_file_targets.get(path)
    }

    /// Known BUILD files located at or below `dir`, compared component-wise.
    pub fn build_files_under<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        // Paths sharing a component prefix sort contiguously, starting at the prefix itself.
        self.build_file_targets
            .range(dir.to_path_buf()..)
            .map(|(path, _)| path.as_path())
            .take_while(move |path| path.starts_with(dir))
    }

    /// Every target declared in a BUILD file anywhere below `dir`.
    ///
    /// Nested packages each contribute their own targets. Empty when `dir` contains no
    /// known package.
    pub fn targets_under_directory(&self, dir: &Path) -> BTreeSet<Label> {
        self.build_files_under(dir)
            .filter_map(|build_file| self.build_file_targets.get(build_file))
            .flatten()
            .cloned()
            .collect()
    }

    /// The BUILD file of the innermost package enclosing `path`, if any.
    pub fn package_containing(&self, path: &Path) -> Option<&Path> {
        path.ancestors()
            .skip(1)
            .find_map(|dir| self.packages.get(dir))
            .map(PathBuf::as_path)
    }

    /// Every external label referenced as a dependency anywhere in the graph.
    pub fn external_dependencies(&self) -> BTreeSet<Label> {
        self.reverse_deps
            .keys()
            .filter(|label| label.is_external())
            .cloned()
            .collect()
    }

    /// The labels that must be built before `label`'s sources can be analyzed.
    ///
    /// - [`TargetKind::SupportedSymbolLanguage`]: the external labels reachable through
    ///   internal dependencies. External labels are leaves and are never expanded.
    /// - [`TargetKind::OpaqueNative`]: the target itself; its deps are ignored.
    /// - [`TargetKind::Other`] or a label not in the graph: nothing.
    pub fn expected_dependencies(&self, label: &Label) -> Arc<BTreeSet<Label>> {
        if let Some(cached) = self.closures.lock().get(label) {
            return Arc::clone(cached);
        }

        let closure = Arc::new(match self.targets.get(label) {
            Some(node) => match node.kind {
                TargetKind::SupportedSymbolLanguage => self.external_closure(node),
                TargetKind::OpaqueNative => BTreeSet::from([node.label.clone()]),
                TargetKind::Other => BTreeSet::new(),
            },
            None => BTreeSet::new(),
        });

        // Two threads may race to compute the same closure; both results are identical.
        self.closures
            .lock()
            .entry(label.clone())
            .or_insert(closure)
            .clone()
    }

    fn external_closure(&self, root: &TargetNode) -> BTreeSet<Label> {
        let mut external = BTreeSet::new();
        let mut visited: HashSet<&Label> = HashSet::from([&root.label]);
        let mut stack: Vec<&Label> = root.direct_deps.iter().collect();

        while let Some(dep) = stack.pop() {
            if dep.is_external() {
                external.insert(dep.clone());
                continue;
            }
            if !visited.insert(dep) {
                continue;
            }
            // Dangling internal labels are leaves.
            if let Some(node) = self.targets.get(dep) {
                stack.extend(node.direct_deps.iter());
            }
        }

        external
    }

    /// In-graph targets that depend on an owner of `path` through in-graph edges, owners
    /// included. Sorted by label.
    pub fn reverse_deps_for_source(&self, path: &Path) -> Vec<&TargetNode> {
        let Some(owners) = self.source_owners.get(path) else {
            return Vec::new();
        };

        let mut visited = BTreeSet::<&Label>::new();
        let mut queue: VecDeque<&Label> = owners.iter().collect();
        while let Some(next) = queue.pop_front() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(rdeps) = self.reverse_deps.get(next) {
                queue.extend(rdeps.iter().filter(|label| self.targets.contains_key(*label)));
            }
        }

        visited
            .into_iter()
            .filter_map(|label| self.targets.get(label))
            .collect()
    }
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BuildGraph {
    // Graphs can hold hundreds of thousands of targets; keep debug output short.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildGraph")
            .field("targets", &self.targets.len())
            .field("source_files", &self.source_owners.len())
            .field("build_files", &self.build_file_targets.len())
            .finish_non_exhaustive()
    }
}
