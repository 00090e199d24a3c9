use crate::label::{Label, LabelError};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::{Path, PathBuf}};

/// How the IDE consumes a target when deciding what must be built before analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Sources are analyzed directly; only externally produced artifacts are needed.
    SupportedSymbolLanguage,
    /// The build tool's own output is the only source of compile information.
    OpaqueNative,
    /// No dependency expectations are tracked.
    Other,
}

impl TargetKind {
    /// Map a Bazel rule class (`java_library`, `cc_binary`, ...) onto a target kind.
    pub fn from_rule_class(rule_class: &str) -> Self {
        const SUPPORTED_PREFIXES: &[&str] = &["java_", "kt_jvm_", "android_", "kt_android_"];
        const SUPPORTED_RULES: &[&str] = &["java_proto_library", "java_lite_proto_library"];
        const OPAQUE_PREFIXES: &[&str] = &["cc_", "objc_"];

        let rule_class = rule_class.trim();
        if SUPPORTED_RULES.contains(&rule_class)
            || SUPPORTED_PREFIXES
                .iter()
                .any(|prefix| rule_class.starts_with(prefix))
        {
            TargetKind::SupportedSymbolLanguage
        } else if OPAQUE_PREFIXES
            .iter()
            .any(|prefix| rule_class.starts_with(prefix))
        {
            TargetKind::OpaqueNative
        } else {
            TargetKind::Other
        }
    }
}

/// One rule from the query output. Paths are workspace-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNode {
    pub label: Label,
    pub kind: TargetKind,
    pub sources: BTreeSet<PathBuf>,
    pub direct_deps: BTreeSet<Label>,
    pub build_file: PathBuf,
}

impl TargetNode {
    /// A node with no sources and no deps, declared in its default BUILD file.
    pub fn new(label: Label, kind: TargetKind) -> Self {
        let build_file = default_build_file(&label);
        Self {
            label,
            kind,
            sources: BTreeSet::new(),
            direct_deps: BTreeSet::new(),
            build_file,
        }
    }

    pub fn with_sources<I, P>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn with_deps(mut self, deps: impl IntoIterator<Item = Label>) -> Self {
        self.direct_deps.extend(deps);
        self
    }

    pub fn with_build_file(mut self, build_file: impl Into<PathBuf>) -> Self {
        self.build_file = build_file.into();
        self
    }
}

/// `<package>/BUILD` for workspace labels; `external/<repo>/<package>/BUILD` for labels of
/// other repositories, so they never land in a workspace package.
fn default_build_file(label: &Label) -> PathBuf {
    let mut path = if label.is_external() {
        Path::new("external").join(label.repository())
    } else {
        PathBuf::new()
    };
    if !label.package().is_empty() {
        path.push(label.package());
    }
    path.join("BUILD")
}

/// A raw, string-typed target record as emitted by the query step.
///
/// Either `kind` or `rule_class` decides the [`TargetKind`]; an explicit `kind` wins.
/// Dependency labels may be package-relative (`:util`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTarget {
    pub label: String,
    #[serde(default)]
    pub rule_class: String,
    #[serde(default)]
    pub kind: Option<TargetKind>,
    #[serde(default)]
    pub sources: Vec<PathBuf>,
    #[serde(default)]
    pub deps: Vec<String>,
    /// Defaults to `<package>/BUILD` when absent.
    #[serde(default)]
    pub build_file: Option<PathBuf>,
}

impl QueryTarget {
    pub(crate) fn into_node(self) -> Result<TargetNode, (String, LabelError)> {
        let label = Label::parse(&self.label).map_err(|err| (self.label.clone(), err))?;
        let kind = self
            .kind
            .unwrap_or_else(|| TargetKind::from_rule_class(&self.rule_class));

        let mut direct_deps = BTreeSet::new();
        for dep in &self.deps {
            let dep = Label::parse_relative(dep, &label).map_err(|err| (dep.clone(), err))?;
            direct_deps.insert(dep);
        }

        let build_file = self
            .build_file
            .unwrap_or_else(|| default_build_file(&label));

        Ok(TargetNode {
            label,
            kind,
            sources: self.sources.into_iter().collect(),
            direct_deps,
            build_file,
        })
    }
}
