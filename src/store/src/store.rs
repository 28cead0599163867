//! The image store: pull, unpack, mount, and config export.
//!
//! Owns the cache directories and the layer worker pool. All operations
//! are idempotent modulo external mutation of the cache: blobs,
//! manifests, and per-layer extraction directories are content-addressed
//! and written once; only the `repo:reference` manifest link moves.

use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use strata_core::error::{Result, StrataError};
use strata_core::fs::{atomic_write_file, is_empty_dir};

use crate::blob::BlobCache;
use crate::config::ImageConfig;
use crate::manifest::{Descriptor, Manifest};
use crate::mount::{ensure_short_link, mount_overlay, read_short_link};
use crate::reference::ImageReference;
use crate::registry::RegistryClient;
use crate::unpack::{unpack_layer, UnpackOptions};

/// Workers used for layer downloads when the caller does not say.
pub const DEFAULT_PARALLELISM: i32 = 4;

/// Disk-backed image store bound to one registry client.
pub struct ImageStore {
    base_dir: PathBuf,
    blobs: BlobCache,
    config_dir: PathBuf,
    manifest_dir: PathBuf,
    overlay_dir: PathBuf,
    parallelism: i32,
    reg: Arc<RegistryClient>,
}

impl ImageStore {
    /// Create a store rooted at `base_dir`, with layers unpacked under
    /// `overlay_dir` (defaults to `<base_dir>/overlays`; its filesystem
    /// must support the file types found in images). `parallelism`
    /// bounds concurrent layer downloads; zero or negative means one
    /// worker per layer.
    pub fn new(
        base_dir: &Path,
        overlay_dir: Option<&Path>,
        parallelism: i32,
        validate_cache: bool,
        reg: Arc<RegistryClient>,
    ) -> Result<Self> {
        let layer_dir = base_dir.join("layers");
        let config_dir = base_dir.join("configs");
        let manifest_dir = base_dir.join("manifests");
        let overlay_dir = overlay_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base_dir.join("overlays"));
        for dir in [&layer_dir, &config_dir, &manifest_dir, &overlay_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            blobs: BlobCache::new(layer_dir, validate_cache),
            config_dir,
            manifest_dir,
            overlay_dir,
            parallelism,
            reg,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Pull an image: fetch and normalize its manifest, download,
    /// verify and extract every layer, then record manifest and config
    /// in the cache. Returns the image id.
    pub async fn pull(&self, image: &str) -> Result<String> {
        let parsed = ImageReference::parse(image)?;
        tracing::info!(image, repo = %parsed.repository, reference = %parsed.reference, "pulling image");
        let mfest = Manifest::fetch(&self.reg, &parsed.repository, &parsed.reference).await?;
        self.pull_layers(&parsed.repository, &mfest).await?;
        mfest.save(&self.manifest_dir)?;
        let id = mfest.id();
        let config_path = self.config_dir.join(&id);
        if !config_path.exists() {
            self.write_config(&mfest, &config_path).await?;
        }
        Ok(id)
    }

    /// Extract every layer of a cached image, in order, into a single
    /// directory, producing the merged root filesystem.
    pub async fn unpack(&self, image: &str, dest: &Path) -> Result<()> {
        let parsed = ImageReference::parse(image)?;
        let mfest = Manifest::load(
            &self.reg,
            &self.manifest_dir,
            &parsed.repository,
            &parsed.reference,
        )?;
        let opts = UnpackOptions {
            atomic: false,
            apply_whiteouts: true,
            chown: false,
        };
        for layer in mfest.layers() {
            let tarball = self.blobs.blob_path(&layer.digest);
            let dest = dest.to_path_buf();
            run_blocking(move || unpack_layer(&tarball, &dest, &opts)).await?;
        }
        Ok(())
    }

    /// Mount a cached image as an overlay filesystem at `dest`.
    ///
    /// `dest` must be empty or creatable; writable `<dest>.upper` and
    /// `<dest>.work` siblings are created next to it. Layers missing
    /// from the overlay directory are re-extracted from cached blobs,
    /// one task per layer, before the single mount call.
    pub async fn mount(&self, image: &str, dest: &Path) -> Result<()> {
        let parsed = ImageReference::parse(image)?;
        let mfest = Manifest::load(
            &self.reg,
            &self.manifest_dir,
            &parsed.repository,
            &parsed.reference,
        )?;

        fs::create_dir_all(dest)?;
        if !is_empty_dir(dest) {
            return Err(StrataError::Mount(format!(
                "mount dir {} is not empty or accessible",
                dest.display()
            )));
        }
        let upper = sibling(dest, ".upper");
        let work = sibling(dest, ".work");
        for dir in [&upper, &work] {
            fs::create_dir_all(dir)?;
            if !is_empty_dir(dir) {
                return Err(StrataError::Mount(format!(
                    "overlay dir {} is not empty or accessible",
                    dir.display()
                )));
            }
        }

        let layers = mfest.layers();
        let (tx, mut rx) = mpsc::channel(layers.len().max(1));
        for layer in layers.clone() {
            let tx = tx.clone();
            let blobs = self.blobs.clone();
            let overlay_dir = self.overlay_dir.clone();
            tokio::spawn(async move {
                let result = ensure_layer_extracted(&blobs, &overlay_dir, &layer).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            if let Err(err) = result {
                tracing::warn!(image, error = %err, "preparing layer failed");
                errors.push(err);
            }
        }
        if !errors.is_empty() {
            return Err(StrataError::Layers(errors));
        }

        // The mount wants lowerdirs top-down; layers() is bottom-up.
        let mut lowers = Vec::with_capacity(layers.len());
        for layer in layers.iter().rev() {
            lowers.push(read_short_link(&self.overlay_dir, &layer.digest)?);
        }
        mount_overlay(&self.overlay_dir, &lowers, &upper, &work, dest)
    }

    /// Write the image's container config JSON to `dest`, from the
    /// cache when present, recomputed from the manifest otherwise.
    pub async fn save_config(&self, image: &str, dest: &Path) -> Result<()> {
        let parsed = ImageReference::parse(image)?;
        let mfest = Manifest::load(
            &self.reg,
            &self.manifest_dir,
            &parsed.repository,
            &parsed.reference,
        )?;
        let config_path = self.config_dir.join(mfest.id());
        match fs::read(&config_path) {
            Ok(buf) => {
                atomic_write_file(dest, &buf, 0o644)?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.write_config(&mfest, dest).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn pull_layers(&self, repo: &str, mfest: &Manifest) -> Result<()> {
        let layers = mfest.layers();
        if layers.is_empty() {
            return Ok(());
        }
        let parallelism = if self.parallelism <= 0 {
            layers.len()
        } else {
            self.parallelism as usize
        };
        tracing::debug!(repo, workers = parallelism, layers = layers.len(), "starting layer workers");

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let (tx, mut rx) = mpsc::channel(layers.len());
        for layer in layers {
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            let reg = self.reg.clone();
            let blobs = self.blobs.clone();
            let overlay_dir = self.overlay_dir.clone();
            let repo = repo.to_string();
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = pull_one_layer(&reg, &blobs, &overlay_dir, &repo, &layer).await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        // All-collect: a failed layer does not cancel its siblings.
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            if let Err(err) = result {
                tracing::warn!(repo, error = %err, "pulling layer failed");
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StrataError::Layers(errors))
        }
    }

    /// Fetch the config, trim it to its `config` sub-object, and write
    /// it atomically to `path`.
    async fn write_config(&self, mfest: &Manifest, path: &Path) -> Result<()> {
        let data = mfest.config_bytes(&self.reg).await?;
        let full: ImageConfig = serde_json::from_slice(&data)?;
        let config = full.config.ok_or_else(|| {
            StrataError::ManifestFormat(format!("{}: missing config in manifest", mfest.id()))
        })?;
        let buf = serde_json::to_vec(&config)?;
        atomic_write_file(path, &buf, 0o644)?;
        tracing::debug!(id = %mfest.id(), path = %path.display(), "saved container config");
        Ok(())
    }
}

/// Download (if needed), extract (if needed) and short-link one layer.
async fn pull_one_layer(
    reg: &RegistryClient,
    blobs: &BlobCache,
    overlay_dir: &Path,
    repo: &str,
    layer: &Descriptor,
) -> Result<()> {
    tracing::debug!(repo, layer = %layer.digest, "pulling layer");
    blobs.save(reg, repo, layer).await?;
    ensure_layer_extracted(blobs, overlay_dir, layer).await
}

/// Extract a cached layer blob into its per-layer directory (atomic,
/// whiteout sentinels dropped) unless already present, then make sure a
/// short link exists.
async fn ensure_layer_extracted(
    blobs: &BlobCache,
    overlay_dir: &Path,
    layer: &Descriptor,
) -> Result<()> {
    let into = overlay_dir.join(layer.digest.encoded());
    if !into.exists() {
        tracing::debug!(layer = %layer.digest, into = %into.display(), "unpacking layer");
        let tarball = blobs.blob_path(&layer.digest);
        let opts = UnpackOptions {
            atomic: true,
            apply_whiteouts: false,
            chown: false,
        };
        run_blocking(move || unpack_layer(&tarball, &into, &opts)).await?;
    }
    ensure_short_link(overlay_dir, &layer.digest)
}

/// Run a blocking extraction on the blocking thread pool.
async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| StrataError::Filesystem(std::io::Error::other(err)))?
}

/// `<path><suffix>` as a sibling of `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_client() -> Arc<RegistryClient> {
        Arc::new(RegistryClient::new("https://registry-1.docker.io", "", "").unwrap())
    }

    fn test_store(tmp: &TempDir) -> ImageStore {
        ImageStore::new(tmp.path(), None, DEFAULT_PARALLELISM, false, test_client()).unwrap()
    }

    const CONFIG_DIGEST: &str =
        "sha256:c059bfaa849c4d8e4aecaeb3a10c2d9b3d85f5165c66ad3a4d937758128c4d18";

    /// Seed the manifest cache with a schema-2 manifest for
    /// `test/app:latest` referencing no layers.
    fn seed_manifest(store: &ImageStore) -> String {
        let json = format!(
            r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {{ "mediaType": "application/vnd.docker.container.image.v1+json", "digest": "{CONFIG_DIGEST}", "size": 2 }},
  "layers": []
}}"#
        );
        let dir = store.manifest_dir.join("test");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("app:latest"), &json).unwrap();
        format!("v2:{CONFIG_DIGEST}")
    }

    #[test]
    fn test_new_creates_cache_layout() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        for dir in ["layers", "configs", "manifests", "overlays"] {
            assert!(tmp.path().join(dir).is_dir(), "{dir} missing");
        }
        assert_eq!(store.base_dir(), tmp.path());
    }

    #[test]
    fn test_new_honors_overlay_dir_override() {
        let tmp = TempDir::new().unwrap();
        let overlays = tmp.path().join("elsewhere");
        let store = ImageStore::new(
            &tmp.path().join("cache"),
            Some(&overlays),
            DEFAULT_PARALLELISM,
            false,
            test_client(),
        )
        .unwrap();
        assert!(overlays.is_dir());
        assert_eq!(store.overlay_dir, overlays);
    }

    #[test]
    fn test_sibling_appends_suffix() {
        assert_eq!(
            sibling(Path::new("/mnt/root"), ".upper"),
            PathBuf::from("/mnt/root.upper")
        );
    }

    #[tokio::test]
    async fn test_save_config_copies_cached_config() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let id = seed_manifest(&store);
        let cached = br#"{"Cmd":["sh"]}"#;
        fs::write(store.config_dir.join(&id), cached).unwrap();

        let dest = tmp.path().join("out.json");
        store.save_config("test/app:latest", &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), cached);
    }

    #[tokio::test]
    async fn test_save_config_fails_for_unknown_image() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let dest = tmp.path().join("out.json");
        assert!(store.save_config("test/unknown:latest", &dest).await.is_err());
    }

    #[tokio::test]
    async fn test_unpack_of_empty_image_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        seed_manifest(&store);
        let dest = tmp.path().join("rootfs");
        fs::create_dir_all(&dest).unwrap();
        store.unpack("test/app:latest", &dest).await.unwrap();
        assert!(is_empty_dir(&dest));
    }

    #[tokio::test]
    async fn test_mount_rejects_non_empty_destination() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        seed_manifest(&store);
        let dest = tmp.path().join("mnt");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("occupied"), b"x").unwrap();

        let err = store.mount("test/app:latest", &dest).await.unwrap_err();
        assert!(matches!(err, StrataError::Mount(_)));
    }
}
