use crate::config::ConfigError;
use std::path::PathBuf;

pub type Result<T, E = DepsError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DepsError {
    /// No project snapshot has been published yet.
    #[error("project sync is not complete; sync before building dependencies")]
    SyncRequired,

    #[error("build produced no usable outputs; fix any build errors and retry")]
    NoDependenciesBuilt,

    #[error("dependency build failed: {0:#}")]
    Build(#[source] anyhow::Error),

    #[error("failed to access artifact state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse artifact state {path}: {message}")]
    Json { path: PathBuf, message: String },

    #[error("incompatible artifact state schema version: expected {expected}, found {found}")]
    IncompatibleSchemaVersion { expected: u32, found: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DepsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, err: &serde_json::Error) -> Self {
        // State files hold labels and paths; keep string values out of error messages.
        Self::Json {
            path: path.into(),
            message: sanitize_error_message(&err.to_string()),
        }
    }
}

pub(crate) fn sanitize_error_message(message: &str) -> String {
    // Redact every double-quoted substring, keeping the overall structure and line/column info.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let mut end = None;
        let bytes = rest.as_bytes();
        for (idx, &b) in bytes.iter().enumerate() {
            if b != b'"' {
                continue;
            }

            // Treat quotes preceded by an odd number of backslashes as escaped.
            let mut backslashes = 0usize;
            let mut k = idx;
            while k > 0 && bytes[k - 1] == b'\\' {
                backslashes += 1;
                k -= 1;
            }
            if backslashes % 2 == 0 {
                end = Some(idx);
                break;
            }
        }

        let Some(end) = end else {
            out.push_str("<redacted>");
            rest = "";
            break;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `unknown field `secret`, expected ...`: redact the first backticked segment only.
    if let Some(start) = out.find('`') {
        let after_start = &out[start + 1..];
        let end = after_start
            .find("`, expected")
            .or_else(|| after_start.find('`'))
            .map(|end_rel| start + 1 + end_rel);
        if let Some(end) = end {
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}
