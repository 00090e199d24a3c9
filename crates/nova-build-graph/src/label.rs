use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("empty label")]
    Empty,

    #[error("label `{0}` is relative and no package was given to resolve it against")]
    Relative(String),

    #[error("label `{0}` has an empty repository name")]
    EmptyRepository(String),

    #[error("label `{0}` has no target name")]
    MissingName(String),

    #[error("label `{0}` has a malformed package path")]
    InvalidPackage(String),

    #[error("label `{0}` has a malformed target name")]
    InvalidName(String),
}

/// A Bazel target identifier.
///
/// `repository` is empty for the main workspace and holds the (apparent or canonical)
/// repository name otherwise. Labels compare and sort structurally: repository, then
/// package, then name, which keeps every `BTreeSet<Label>` deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label {
    repository: String,
    package: String,
    name: String,
}

impl Label {
    /// Build a label from already-split components. No syntax validation is performed.
    pub fn new(
        repository: impl Into<String>,
        package: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            package: package.into(),
            name: name.into(),
        }
    }

    /// Parse an absolute label (`//pkg:name`, `@repo//pkg:name`, `@@repo//pkg`, `@repo`).
    pub fn parse(text: &str) -> Result<Self, LabelError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LabelError::Empty);
        }

        let (repository, rest) = if let Some(stripped) = text.strip_prefix('@') {
            // `@@repo` is Bzlmod's canonical form; the repo name itself is the same.
            let stripped = stripped.strip_prefix('@').unwrap_or(stripped);
            match stripped.split_once("//") {
                Some((repo, rest)) => (repo, rest),
                None => {
                    // `@repo` is shorthand for `@repo//:repo`.
                    if stripped.is_empty() {
                        return Err(LabelError::EmptyRepository(text.to_string()));
                    }
                    validate_name(text, stripped)?;
                    return Ok(Self::new(stripped, "", stripped));
                }
            }
        } else if let Some(rest) = text.strip_prefix("//") {
            ("", rest)
        } else {
            return Err(LabelError::Relative(text.to_string()));
        };

        if repository.contains('/') || repository.contains(':') {
            return Err(LabelError::InvalidPackage(text.to_string()));
        }

        let (package, name) = match rest.split_once(':') {
            Some((package, name)) => (package, name),
            None => {
                // `//foo/bar` is shorthand for `//foo/bar:bar`.
                let name = rest.rsplit('/').next().unwrap_or_default();
                if name.is_empty() {
                    return Err(LabelError::MissingName(text.to_string()));
                }
                (rest, name)
            }
        };

        validate_package(text, package)?;
        validate_name(text, name)?;
        Ok(Self::new(repository, package, name))
    }

    /// Parse a label that may be relative to `context`'s package (`:name` or `name`).
    pub fn parse_relative(text: &str, context: &Label) -> Result<Self, LabelError> {
        let trimmed = text.trim();
        if trimmed.starts_with('@') || trimmed.starts_with("//") {
            return Self::parse(trimmed);
        }
        if trimmed.is_empty() {
            return Err(LabelError::Empty);
        }

        let name = trimmed.strip_prefix(':').unwrap_or(trimmed);
        validate_name(trimmed, name)?;
        Ok(Self::new(
            context.repository.clone(),
            context.package.clone(),
            name,
        ))
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this label names a target outside the main workspace.
    pub fn is_external(&self) -> bool {
        !self.repository.is_empty()
    }
}

fn validate_package(text: &str, package: &str) -> Result<(), LabelError> {
    if package.is_empty() {
        return Ok(());
    }
    if package.starts_with('/')
        || package.ends_with('/')
        || package.contains("//")
        || package.contains(':')
    {
        return Err(LabelError::InvalidPackage(text.to_string()));
    }
    Ok(())
}

fn validate_name(text: &str, name: &str) -> Result<(), LabelError> {
    if name.is_empty() {
        return Err(LabelError::MissingName(text.to_string()));
    }
    if name.contains(':') || name.starts_with('/') || name.ends_with('/') {
        return Err(LabelError::InvalidName(text.to_string()));
    }
    Ok(())
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.repository.is_empty() {
            write!(f, "@{}", self.repository)?;
        }
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl FromStr for Label {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Label {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.to_string()
    }
}
