//! Image reference parsing.
//!
//! Turns image strings like `library/alpine:3.6` or
//! `gcr.io/project/image@sha256:...` into a (registry URL, repository,
//! reference) triple.

use std::fmt;

use strata_core::error::{Result, StrataError};

use crate::digest::Digest;

/// Registry used when the image name carries no host component.
pub const DEFAULT_REGISTRY: &str = "https://registry-1.docker.io";

/// Reference used when neither a tag nor a digest is present.
const DEFAULT_REFERENCE: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry URL, scheme included (e.g. "https://registry-1.docker.io")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    /// Tag, or the full digest string when the image is digest-pinned
    pub reference: String,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Rules:
    /// - a `@digest` suffix is authoritative; a `:tag` alongside it is
    ///   discarded
    /// - a leading path component containing `.` names the registry
    ///   (lowercased, `https://` assumed)
    /// - `k8s.gcr.io` is an alias for GCR and is rewritten to `gcr.io`
    ///   with a `google_containers/` repository prefix
    /// - a bare single-segment name such as `alpine` refers to
    ///   `library/alpine` on the default registry
    pub fn parse(image: &str) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(invalid(image, "empty image reference"));
        }

        let (registry, rest) = if let Some(rest) = image.strip_prefix("k8s.gcr.io/") {
            // k8s.gcr.io is an alias used by GCR.
            (
                "https://gcr.io".to_string(),
                format!("google_containers/{rest}"),
            )
        } else {
            match image.split_once('/') {
                Some((first, rest)) if first.contains('.') => {
                    let host = first.to_lowercase();
                    (format!("https://{host}"), rest.to_string())
                }
                _ => (DEFAULT_REGISTRY.to_string(), image.to_string()),
            }
        };
        let had_registry = registry != DEFAULT_REGISTRY;

        let mut repo = rest;
        let mut reference = DEFAULT_REFERENCE.to_string();
        let mut pinned = false;
        if repo.contains('@') {
            // Exact hash for the image.
            let parts: Vec<&str> = repo.split('@').collect();
            if parts.len() != 2 {
                return Err(invalid(image, "more than one '@'"));
            }
            let digest =
                Digest::parse(parts[1]).map_err(|_| invalid(image, "invalid digest after '@'"))?;
            let new_repo = parts[0].to_string();
            repo = new_repo;
            reference = digest.to_string();
            pinned = true;
        }
        if repo.contains(':') {
            let parts: Vec<&str> = repo.split(':').collect();
            if parts.len() != 2 {
                return Err(invalid(image, "more than one ':'"));
            }
            let new_repo = parts[0].to_string();
            let new_reference = parts[1].to_string();
            repo = new_repo;
            if !pinned {
                // Only use the tag if no digest is specified.
                reference = new_reference;
            }
        }
        if repo.is_empty() {
            return Err(invalid(image, "empty repository"));
        }
        if !had_registry && !repo.contains('/') {
            // Old docker-style image name, e.g. "alpine".
            repo = format!("library/{repo}");
        }

        Ok(Self {
            registry,
            repository: repo,
            reference,
        })
    }

    /// Registry host without the URL scheme.
    pub fn host(&self) -> &str {
        self.registry
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Whether the reference is a content digest rather than a tag.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(
            f,
            "{}/{}{}{}",
            self.host(),
            self.repository,
            sep,
            self.reference
        )
    }
}

fn invalid(reference: &str, message: &str) -> StrataError {
    StrataError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}
