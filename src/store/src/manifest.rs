//! Unified view over schema-1 and schema-2 image manifests.
//!
//! The two registry schemas disagree on nearly everything: layer
//! ordering (schema-1 lists the top layer first, schema-2 the bottom),
//! duplicates (schema-1 may repeat a layer), where the config lives
//! (embedded history entry vs. a separate blob), and what identifies an
//! image (nothing cryptographic vs. the config digest). [`Manifest`]
//! normalizes all of it behind one operation set.

use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use strata_core::error::{Result, StrataError};
use strata_core::fs::atomic_write_file;

use crate::digest::Digest;
use crate::registry::RegistryClient;

/// Media type assumed for schema-1 layer references, which carry none.
pub const MEDIA_TYPE_LAYER_TAR_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// A verifiable pointer to a blob in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: Digest,
    /// Blob size in bytes. Zero means "unknown" (schema-1 layers); the
    /// blob cache must not enforce a size floor for those.
    #[serde(default)]
    pub size: u64,
}

/// Schema-2 manifest: a config descriptor plus bottom-up layer list.
#[derive(Debug, Clone, Deserialize)]
pub struct Schema2Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Schema-1 signed manifest: top-first layer references and an embedded
/// history whose first entry is the JSON config.
///
/// The required fields double as the schema discriminator when loading
/// from disk: a schema-2 payload has no `fsLayers` or `history` and
/// fails this deserialization cleanly.
#[derive(Debug, Clone, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    pub name: String,
    pub tag: String,
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub signatures: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Debug)]
enum Schema {
    V1 {
        manifest: Schema1Manifest,
        payload: Vec<u8>,
    },
    V2 {
        manifest: Schema2Manifest,
        payload: Vec<u8>,
    },
}

/// An image manifest bound to the repository and reference it was
/// fetched or loaded under.
#[derive(Debug)]
pub struct Manifest {
    /// Repository path, e.g. "library/alpine"
    repo: String,
    /// Tag or digest the manifest was resolved from
    reference: String,
    /// Registry-qualified image name, e.g. "gcr.io/google_containers/redis"
    image: String,
    schema: Schema,
}

impl Manifest {
    /// Fetch a manifest from the registry, normalizing across schemas.
    ///
    /// Schema-2 (with manifest-index resolution) is tried first. If the
    /// request fails, or succeeds but reports `schemaVersion` 1, the
    /// schema-2 result is discarded and a schema-1 fetch is issued.
    pub async fn fetch(reg: &RegistryClient, repo: &str, reference: &str) -> Result<Manifest> {
        let image = format!("{}/{}", reg.host(), repo);
        match reg.manifest_v2(repo, reference).await {
            Ok((manifest, payload)) if manifest.schema_version != 1 => Ok(Manifest {
                repo: repo.to_string(),
                reference: reference.to_string(),
                image,
                schema: Schema::V2 { manifest, payload },
            }),
            result => {
                if let Err(err) = &result {
                    tracing::warn!(
                        repo,
                        reference,
                        error = %err,
                        "schema-2 manifest fetch failed, trying schema-1"
                    );
                }
                let (manifest, payload) = reg.manifest_v1(repo, reference).await?;
                Ok(Manifest {
                    repo: repo.to_string(),
                    reference: reference.to_string(),
                    image,
                    schema: Schema::V1 { manifest, payload },
                })
            }
        }
    }

    /// Load a previously saved manifest through its `repo:reference`
    /// link. Schema-1 deserialization is attempted first; it is
    /// structurally richer and fails cleanly on schema-2 payloads.
    pub fn load(reg: &RegistryClient, dir: &Path, repo: &str, reference: &str) -> Result<Manifest> {
        let link = dir.join(format!("{repo}:{reference}"));
        tracing::debug!(repo, reference, link = %link.display(), "loading manifest");
        let payload = fs::read(&link)?;
        let image = format!("{}/{}", reg.host(), repo);
        if let Ok(manifest) = serde_json::from_slice::<Schema1Manifest>(&payload) {
            if manifest.schema_version == 1 {
                return Ok(Manifest {
                    repo: repo.to_string(),
                    reference: reference.to_string(),
                    image,
                    schema: Schema::V1 { manifest, payload },
                });
            }
        }
        match serde_json::from_slice::<Schema2Manifest>(&payload) {
            Ok(manifest) => Ok(Manifest {
                repo: repo.to_string(),
                reference: reference.to_string(),
                image,
                schema: Schema::V2 { manifest, payload },
            }),
            Err(err) => Err(StrataError::ManifestFormat(format!(
                "cached manifest for {repo}:{reference} matches neither schema: {err}"
            ))),
        }
    }

    /// Layer descriptors in application order: lowest layer first, no
    /// digest twice. Schema-1 sources are reversed and deduplicated
    /// (keeping the first occurrence); schema-2 sources pass through.
    pub fn layers(&self) -> Vec<Descriptor> {
        match &self.schema {
            Schema::V1 { manifest, .. } => {
                let mut layers: Vec<Descriptor> = Vec::with_capacity(manifest.fs_layers.len());
                for fs_layer in manifest.fs_layers.iter().rev() {
                    // fsLayers might have duplicates.
                    if layers.iter().any(|l| l.digest == fs_layer.blob_sum) {
                        continue;
                    }
                    layers.push(Descriptor {
                        media_type: MEDIA_TYPE_LAYER_TAR_GZIP.to_string(),
                        digest: fs_layer.blob_sum.clone(),
                        size: 0,
                    });
                }
                layers
            }
            Schema::V2 { manifest, .. } => manifest.layers.clone(),
        }
    }

    /// The raw image config JSON. Embedded in schema-1 manifests;
    /// fetched from the config blob for schema-2.
    pub async fn config_bytes(&self, reg: &RegistryClient) -> Result<Vec<u8>> {
        match &self.schema {
            Schema::V1 { manifest, .. } => {
                let entry = manifest.history.first().ok_or_else(|| {
                    StrataError::ManifestFormat(format!(
                        "schema-1 manifest for {} has no history",
                        self.image
                    ))
                })?;
                Ok(entry.v1_compatibility.clone().into_bytes())
            }
            Schema::V2 { manifest, .. } => reg.get_blob(&self.repo, &manifest.config).await,
        }
    }

    /// Stable on-disk identity. Schema-2 images are identified by their
    /// content-addressed config digest; schema-1 has no cryptographic
    /// image id, so one is synthesized from the qualified name and tag.
    pub fn id(&self) -> String {
        match &self.schema {
            Schema::V1 { .. } => format!(
                "v1:{}:{}",
                self.image.replace('/', ":"),
                self.reference
            ),
            Schema::V2 { manifest, .. } => format!("v2:{}", manifest.config.digest),
        }
    }

    /// The canonical manifest bytes as served by the registry.
    pub fn payload_bytes(&self) -> &[u8] {
        match &self.schema {
            Schema::V1 { payload, .. } | Schema::V2 { payload, .. } => payload,
        }
    }

    /// Persist the manifest under `dir`.
    ///
    /// The payload is written to `<dir>/<id>` if absent, then the
    /// mutable `<dir>/<repo>:<reference>` symlink is pointed at it. The
    /// link target is relative so the cache directory stays relocatable.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let id = self.id();
        let path = dir.join(&id);
        if !path.exists() {
            atomic_write_file(&path, self.payload_bytes(), 0o644)?;
        }
        let link = dir.join(format!("{}:{}", self.repo, self.reference));
        let link_dir = link.parent().unwrap_or(dir);
        fs::create_dir_all(link_dir)?;
        let mut target = PathBuf::new();
        for _ in 0..self.repo.matches('/').count() {
            target.push("..");
        }
        target.push(&id);
        let _ = fs::remove_file(&link);
        unix_fs::symlink(&target, &link)?;
        tracing::debug!(
            link = %link.display(),
            target = %target.display(),
            "saved manifest"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG_DIGEST: &str =
        "sha256:c059bfaa849c4d8e4aecaeb3a10c2d9b3d85f5165c66ad3a4d937758128c4d18";
    const LAYER_A: &str =
        "sha256:59bf1c3509f33515622619af21ed55bbe26d24913cedbca106468a5fb37a50c3";
    const LAYER_B: &str =
        "sha256:8e012198eea15b2554b07014081c85fec4967a1b9cc4b65bd9a4bce3ae1c0c88";

    fn test_client() -> RegistryClient {
        RegistryClient::new("https://registry-1.docker.io", "", "").unwrap()
    }

    fn gcr_client() -> RegistryClient {
        RegistryClient::new("https://gcr.io", "", "").unwrap()
    }

    fn schema2_json() -> String {
        format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "digest": "{CONFIG_DIGEST}",
    "size": 1469
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "digest": "{LAYER_A}",
      "size": 2818413
    }},
    {{
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "digest": "{LAYER_B}",
      "size": 120
    }}
  ]
}}"#
        )
    }

    fn schema1_json() -> String {
        // Layers listed top-most first, with a duplicate blobSum.
        format!(
            r#"{{
  "schemaVersion": 1,
  "name": "google_containers/redis",
  "tag": "e2e",
  "architecture": "amd64",
  "fsLayers": [
    {{ "blobSum": "{LAYER_B}" }},
    {{ "blobSum": "{LAYER_A}" }},
    {{ "blobSum": "{LAYER_A}" }}
  ],
  "history": [
    {{ "v1Compatibility": "{{\"config\":{{\"Cmd\":[\"redis-server\"]}}}}" }},
    {{ "v1Compatibility": "{{}}" }},
    {{ "v1Compatibility": "{{}}" }}
  ],
  "signatures": []
}}"#
        )
    }

    fn save_and_load(reg: &RegistryClient, dir: &Path, repo: &str, reference: &str, json: &str) -> Manifest {
        let link = dir.join(format!("{repo}:{reference}"));
        fs::create_dir_all(link.parent().unwrap()).unwrap();
        fs::write(&link, json).unwrap();
        Manifest::load(reg, dir, repo, reference).unwrap()
    }

    #[test]
    fn test_load_schema2() {
        let tmp = TempDir::new().unwrap();
        let reg = test_client();
        let m = save_and_load(&reg, tmp.path(), "library/alpine", "3.6", &schema2_json());
        assert_eq!(m.id(), format!("v2:{CONFIG_DIGEST}"));
        assert_eq!(m.payload_bytes(), schema2_json().as_bytes());
    }

    #[test]
    fn test_load_schema1() {
        let tmp = TempDir::new().unwrap();
        let reg = gcr_client();
        let m = save_and_load(
            &reg,
            tmp.path(),
            "google_containers/redis",
            "e2e",
            &schema1_json(),
        );
        assert_eq!(m.id(), "v1:gcr.io:google_containers:redis:e2e");
    }

    #[test]
    fn test_load_rejects_garbage() {
        let tmp = TempDir::new().unwrap();
        let reg = test_client();
        let link = tmp.path().join("junk:latest");
        fs::write(&link, "{\"neither\": true}").unwrap();
        assert!(Manifest::load(&reg, tmp.path(), "junk", "latest").is_err());
    }

    #[test]
    fn test_schema2_layers_preserve_order() {
        let tmp = TempDir::new().unwrap();
        let reg = test_client();
        let m = save_and_load(&reg, tmp.path(), "library/alpine", "3.6", &schema2_json());
        let layers = m.layers();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest.to_string(), LAYER_A);
        assert_eq!(layers[1].digest.to_string(), LAYER_B);
        assert_eq!(layers[0].size, 2818413);
    }

    #[test]
    fn test_schema1_layers_reversed_and_deduplicated() {
        let tmp = TempDir::new().unwrap();
        let reg = gcr_client();
        let m = save_and_load(
            &reg,
            tmp.path(),
            "google_containers/redis",
            "e2e",
            &schema1_json(),
        );
        let layers = m.layers();
        // Source order was [B, A, A] top-first; normalized is [A, B].
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest.to_string(), LAYER_A);
        assert_eq!(layers[1].digest.to_string(), LAYER_B);
        // Schema-1 descriptors have no trustworthy size.
        assert!(layers.iter().all(|l| l.size == 0));
        assert!(layers.iter().all(|l| l.media_type == MEDIA_TYPE_LAYER_TAR_GZIP));
    }

    #[tokio::test]
    async fn test_schema1_config_is_first_history_entry() {
        let tmp = TempDir::new().unwrap();
        let reg = gcr_client();
        let m = save_and_load(
            &reg,
            tmp.path(),
            "google_containers/redis",
            "e2e",
            &schema1_json(),
        );
        let config = m.config_bytes(&reg).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&config).unwrap();
        assert_eq!(parsed["config"]["Cmd"][0], "redis-server");
    }

    #[test]
    fn test_save_writes_payload_and_relative_link() {
        let tmp = TempDir::new().unwrap();
        let reg = test_client();
        let m = save_and_load(&reg, tmp.path(), "library/alpine", "3.6", &schema2_json());

        let out = TempDir::new().unwrap();
        m.save(out.path()).unwrap();

        let id_path = out.path().join(format!("v2:{CONFIG_DIGEST}"));
        assert!(id_path.exists());
        assert_eq!(fs::read(&id_path).unwrap(), schema2_json().as_bytes());

        let link = out.path().join("library/alpine:3.6");
        let target = fs::read_link(&link).unwrap();
        assert!(!target.is_absolute());
        assert_eq!(target, PathBuf::from(format!("../v2:{CONFIG_DIGEST}")));
        // The link must resolve to the payload.
        assert_eq!(fs::read(&link).unwrap(), schema2_json().as_bytes());
    }

    #[test]
    fn test_save_twice_updates_link() {
        let tmp = TempDir::new().unwrap();
        let reg = test_client();
        let m = save_and_load(&reg, tmp.path(), "library/alpine", "3.6", &schema2_json());

        let out = TempDir::new().unwrap();
        m.save(out.path()).unwrap();
        m.save(out.path()).unwrap();
        assert!(out.path().join("library/alpine:3.6").exists());
    }

    #[test]
    fn test_descriptor_defaults_size_to_zero() {
        let d: Descriptor = serde_json::from_str(&format!(
            r#"{{"mediaType": "x", "digest": "{LAYER_A}"}}"#
        ))
        .unwrap();
        assert_eq!(d.size, 0);
    }
}
