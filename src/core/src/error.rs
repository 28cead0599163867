use thiserror::Error;

fn join_errors(errors: &[StrataError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Malformed image reference supplied by the caller
    #[error("invalid image reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },

    /// HTTP transport failure talking to a registry
    #[error("registry request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// Manifest could not be parsed under any supported schema
    #[error("manifest format error: {0}")]
    ManifestFormat(String),

    /// No manifest-index entry matches the host platform
    #[error("no manifest for {os}/{arch} in index")]
    PlatformMismatch { os: String, arch: String },

    /// Blob was shorter than its descriptor promised
    #[error("blob {digest}: wrote {written} bytes, expected at least {expected}")]
    SizeMismatch {
        digest: String,
        written: u64,
        expected: u64,
    },

    /// Blob content does not hash to its descriptor digest
    #[error("blob {digest}: content digest verification failed")]
    DigestMismatch { digest: String },

    /// Fatal error in a layer tar stream
    #[error("malformed layer archive: {0}")]
    TarMalformed(String),

    /// Filesystem operation failed
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    /// Overlay mount invocation failed
    #[error("mount failed: {0}")]
    Mount(String),

    /// Aggregate of per-layer failures from a pull or mount
    #[error("{} layer(s) failed: {}", .0.len(), join_errors(.0))]
    Layers(Vec<StrataError>),
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::ManifestFormat(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layers_display_joins_errors() {
        let err = StrataError::Layers(vec![
            StrataError::DigestMismatch {
                digest: "sha256:aaa".to_string(),
            },
            StrataError::ManifestFormat("bad json".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 layer(s) failed"));
        assert!(msg.contains("sha256:aaa"));
        assert!(msg.contains("bad json"));
    }

    #[test]
    fn test_io_error_converts_to_filesystem() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: StrataError = io.into();
        assert!(matches!(err, StrataError::Filesystem(_)));
    }
}
