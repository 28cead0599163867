//! Docker/OCI registry v2 HTTP client.
//!
//! Speaks the distribution API directly: content-type-negotiated
//! manifest GETs (with manifest-index resolution against the host
//! platform), and blob GETs as opaque byte streams. Digest and size
//! enforcement for streamed blobs is the blob cache's job; the verified
//! in-memory fetch here exists for small config blobs.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header;
use serde::Deserialize;

use strata_core::error::{Result, StrataError};

use crate::digest::Digest;
use crate::manifest::{Descriptor, Schema1Manifest, Schema2Manifest};

pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const MEDIA_TYPE_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// A manifest index (schema-2 manifest list). Never persisted: it is
/// resolved to a platform-specific inner manifest at fetch time.
#[derive(Debug, Deserialize)]
struct ManifestIndex {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: Digest,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

/// Registry architecture name for the host (`amd64`, not `x86_64`).
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

fn host_os() -> &'static str {
    std::env::consts::OS
}

/// HTTP client for a single registry.
pub struct RegistryClient {
    http: reqwest::Client,
    base: String,
    username: String,
    password: String,
}

impl RegistryClient {
    /// Create a client for the registry at `url`. Empty credentials
    /// mean anonymous access.
    ///
    /// The transport uses a short connect timeout: pulls commonly run
    /// inside cloud environments where hanging on an unreachable
    /// registry is worse than failing fast.
    pub fn new(url: &str, username: &str, password: &str) -> Result<Self> {
        let base = url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            http,
            base,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// Registry host without the URL scheme.
    pub fn host(&self) -> &str {
        self.base
            .trim_start_matches("https://")
            .trim_start_matches("http://")
    }

    /// Probe the `/v2/` endpoint. Advisory only: some registries do not
    /// implement it, so failure is logged and ignored.
    pub async fn ping(&self) {
        let url = format!("{}/v2/", self.base);
        match self.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(registry = %self.base, "registry ping ok");
            }
            Ok(resp) => {
                tracing::warn!(
                    registry = %self.base,
                    status = %resp.status(),
                    "pinging registry failed"
                );
            }
            Err(err) => {
                tracing::warn!(registry = %self.base, error = %err, "pinging registry failed");
            }
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        if self.username.is_empty() && self.password.is_empty() {
            req
        } else {
            req.basic_auth(&self.username, Some(&self.password))
        }
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base, repo, reference)
    }

    fn blob_url(&self, repo: &str, digest: &Digest) -> String {
        format!("{}/v2/{}/blobs/{}", self.base, repo, digest)
    }

    async fn fetch_manifest(
        &self,
        repo: &str,
        reference: &str,
        accepts: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        let url = self.manifest_url(repo, reference);
        tracing::debug!(%url, "fetching manifest");
        let resp = self
            .get(&url)
            .header(header::ACCEPT, accepts.join(", "))
            .send()
            .await?
            .error_for_status()?;
        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let body = resp.bytes().await?;
        Ok((body.to_vec(), content_type))
    }

    /// Fetch a schema-2 manifest.
    ///
    /// The request advertises both the schema-2 manifest and
    /// manifest-list media types. A manifest-list response is resolved
    /// to the entry matching the host (OS, architecture) and the inner
    /// manifest is fetched by digest; a list that resolves to another
    /// list is rejected. Returns the parsed manifest together with the
    /// canonical payload bytes.
    pub async fn manifest_v2(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Schema2Manifest, Vec<u8>)> {
        let accepts = [MEDIA_TYPE_MANIFEST_V2, MEDIA_TYPE_MANIFEST_LIST];
        let (body, content_type) = self.fetch_manifest(repo, reference, &accepts).await?;
        if content_type == MEDIA_TYPE_MANIFEST_LIST {
            let inner = select_platform_manifest(&body)?;
            tracing::debug!(
                repo,
                digest = %inner,
                os = host_os(),
                arch = host_arch(),
                "resolved manifest index entry"
            );
            let (body, content_type) = self
                .fetch_manifest(repo, &inner.to_string(), &accepts)
                .await?;
            if content_type == MEDIA_TYPE_MANIFEST_LIST {
                return Err(StrataError::ManifestFormat(
                    "manifest index resolved to another manifest index".to_string(),
                ));
            }
            return parse_schema2(&body, &content_type);
        }
        parse_schema2(&body, &content_type)
    }

    /// Fetch a legacy schema-1 signed manifest.
    pub async fn manifest_v1(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Schema1Manifest, Vec<u8>)> {
        let accepts = [MEDIA_TYPE_MANIFEST_V1, MEDIA_TYPE_MANIFEST_V1_SIGNED];
        let (body, _content_type) = self.fetch_manifest(repo, reference, &accepts).await?;
        let manifest: Schema1Manifest = serde_json::from_slice(&body)?;
        if manifest.schema_version != 1 {
            return Err(StrataError::ManifestFormat(format!(
                "expected schema-1 manifest, got schema version {}",
                manifest.schema_version
            )));
        }
        Ok((manifest, body))
    }

    /// Open a blob as an opaque byte stream. The caller is responsible
    /// for digest verification and size enforcement.
    pub async fn open_blob(
        &self,
        repo: &str,
        digest: &Digest,
    ) -> Result<BoxStream<'static, reqwest::Result<Bytes>>> {
        let url = self.blob_url(repo, digest);
        tracing::debug!(%url, "opening blob");
        let resp = self.get(&url).send().await?.error_for_status()?;
        Ok(resp.bytes_stream().boxed())
    }

    /// Fetch a small blob into memory, verifying digest and size.
    pub async fn get_blob(&self, repo: &str, desc: &Descriptor) -> Result<Vec<u8>> {
        let mut stream = self.open_blob(repo, &desc.digest).await?;
        let mut verifier = desc.digest.verifier();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            verifier.update(&chunk);
            buf.extend_from_slice(&chunk);
        }
        if (buf.len() as u64) < desc.size {
            return Err(StrataError::SizeMismatch {
                digest: desc.digest.to_string(),
                written: buf.len() as u64,
                expected: desc.size,
            });
        }
        if !verifier.verified() {
            return Err(StrataError::DigestMismatch {
                digest: desc.digest.to_string(),
            });
        }
        Ok(buf)
    }
}

fn parse_schema2(body: &[u8], content_type: &str) -> Result<(Schema2Manifest, Vec<u8>)> {
    if content_type != MEDIA_TYPE_MANIFEST_V2 {
        return Err(StrataError::ManifestFormat(format!(
            "unexpected manifest content type {content_type:?}"
        )));
    }
    let manifest: Schema2Manifest = serde_json::from_slice(body)?;
    Ok((manifest, body.to_vec()))
}

/// Pick the index entry matching the host platform and return its
/// digest.
fn select_platform_manifest(body: &[u8]) -> Result<Digest> {
    let index: ManifestIndex = serde_json::from_slice(body)?;
    if index.schema_version != 2 {
        return Err(StrataError::ManifestFormat(format!(
            "invalid schema version {} in manifest index",
            index.schema_version
        )));
    }
    let (os, arch) = (host_os(), host_arch());
    for entry in index.manifests {
        match &entry.platform {
            Some(platform) if platform.os == os && platform.architecture == arch => {
                return Ok(entry.digest);
            }
            _ => continue,
        }
    }
    Err(StrataError::PlatformMismatch {
        os: os.to_string(),
        arch: arch.to_string(),
    })
}
