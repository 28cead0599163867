//! Content-addressed blob cache.
//!
//! Blobs live under a single directory, named by the hex portion of
//! their digest. They are written once via a temp-dir-and-rename
//! discipline and are immutable afterwards; two concurrent downloads of
//! the same digest write into disjoint temp directories and race
//! harmlessly on the final rename.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use strata_core::error::{Result, StrataError};

use crate::digest::Digest;
use crate::manifest::Descriptor;
use crate::registry::RegistryClient;

/// Digest-verified, atomically written blob storage.
#[derive(Debug, Clone)]
pub struct BlobCache {
    dir: PathBuf,
    validate: bool,
}

impl BlobCache {
    /// Create a cache over `dir`. With `validate` set, cached blobs are
    /// re-hashed on every hit instead of being trusted by name.
    pub fn new(dir: PathBuf, validate: bool) -> Self {
        Self { dir, validate }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a blob with this digest would occupy in the cache.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir.join(digest.encoded())
    }

    /// Ensure the blob named by `desc` is present in the cache,
    /// downloading it from `repo` if needed, and return its path.
    ///
    /// The download streams into a temp file while a digest verifier is
    /// fed in parallel. After EOF the byte count must reach the
    /// descriptor size (at least one byte when the size is unknown) and
    /// the verifier must match, or the temp directory is discarded and
    /// an error returned.
    pub async fn save(
        &self,
        reg: &RegistryClient,
        repo: &str,
        desc: &Descriptor,
    ) -> Result<PathBuf> {
        let name = self.blob_path(&desc.digest);
        if name.exists() {
            if !self.validate || blob_is_valid(&name, &desc.digest) {
                tracing::debug!(repo, blob = %name.display(), "blob already cached");
                return Ok(name);
            }
            tracing::warn!(
                repo,
                blob = %name.display(),
                "cached blob failed validation, downloading again"
            );
        }

        tracing::debug!(repo, blob = %name.display(), "saving blob");
        let tmpdir = tempfile::Builder::new()
            .prefix("tmp-")
            .tempdir_in(&self.dir)?;
        let tmpname = tmpdir.path().join(desc.digest.encoded());

        let mut stream = reg.open_blob(repo, &desc.digest).await?;
        let mut file = tokio::fs::File::create(&tmpname).await?;
        let mut verifier = desc.digest.verifier();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            verifier.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        // Schema-1 descriptors carry size 0; for those any non-empty
        // payload that verifies is complete.
        let floor = if desc.size == 0 { 1 } else { desc.size };
        if written < floor {
            return Err(StrataError::SizeMismatch {
                digest: desc.digest.to_string(),
                written,
                expected: floor,
            });
        }
        if !verifier.verified() {
            return Err(StrataError::DigestMismatch {
                digest: desc.digest.to_string(),
            });
        }

        fs::set_permissions(&tmpname, fs::Permissions::from_mode(0o644))?;
        fs::rename(&tmpname, &name)?;
        tracing::debug!(repo, blob = %name.display(), bytes = written, "saved blob");
        Ok(name)
    }
}

/// Re-hash a cached blob file against its digest.
fn blob_is_valid(path: &Path, digest: &Digest) -> bool {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return false,
    };
    let mut verifier = digest.verifier();
    let mut buf = [0u8; 64 * 1024];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => verifier.update(&buf[..n]),
            Err(_) => return false,
        }
    }
    verifier.verified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Never reached by the cache-hit paths; connection attempts to it
    // fail immediately for the re-download paths.
    fn unreachable_client() -> RegistryClient {
        RegistryClient::new("http://127.0.0.1:1", "", "").unwrap()
    }

    fn descriptor_for(data: &[u8]) -> Descriptor {
        Descriptor {
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
            digest: Digest::from_bytes(data),
            size: data.len() as u64,
        }
    }

    fn seed_blob(cache: &BlobCache, data: &[u8]) -> (Descriptor, PathBuf) {
        let desc = descriptor_for(data);
        let path = cache.blob_path(&desc.digest);
        fs::write(&path, data).unwrap();
        (desc, path)
    }

    #[tokio::test]
    async fn test_save_returns_cached_blob_without_network() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path().to_path_buf(), false);
        let (desc, path) = seed_blob(&cache, b"cached layer bytes");

        let got = cache
            .save(&unreachable_client(), "library/alpine", &desc)
            .await
            .unwrap();
        assert_eq!(got, path);
    }

    #[tokio::test]
    async fn test_save_revalidates_when_enabled() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path().to_path_buf(), true);
        let (desc, _path) = seed_blob(&cache, b"cached layer bytes");

        // Valid cached content: no download attempted.
        assert!(cache
            .save(&unreachable_client(), "library/alpine", &desc)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_save_redownloads_corrupt_blob() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path().to_path_buf(), true);
        let (desc, path) = seed_blob(&cache, b"cached layer bytes");
        fs::write(&path, b"truncated").unwrap();

        // Validation fails, the re-download hits the unreachable
        // registry, and the corrupt blob stays for the next attempt.
        let err = cache
            .save(&unreachable_client(), "library/alpine", &desc)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Network(_)));
    }

    #[tokio::test]
    async fn test_corrupt_blob_trusted_when_validation_disabled() {
        let tmp = TempDir::new().unwrap();
        let cache = BlobCache::new(tmp.path().to_path_buf(), false);
        let (desc, path) = seed_blob(&cache, b"cached layer bytes");
        fs::write(&path, b"truncated").unwrap();

        // Content-addressing is trusted by default; no re-hash, no
        // network.
        assert!(cache
            .save(&unreachable_client(), "library/alpine", &desc)
            .await
            .is_ok());
    }

    #[test]
    fn test_blob_is_valid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob");
        fs::write(&path, b"data").unwrap();
        assert!(blob_is_valid(&path, &Digest::from_bytes(b"data")));
        assert!(!blob_is_valid(&path, &Digest::from_bytes(b"other")));
        assert!(!blob_is_valid(
            &tmp.path().join("missing"),
            &Digest::from_bytes(b"data")
        ));
    }

    #[test]
    fn test_save_leaves_no_temp_dirs_in_cache_dir() {
        // The failure paths drop the TempDir guard, which removes the
        // directory; assert the guard's behavior holds for our prefix.
        let tmp = TempDir::new().unwrap();
        {
            let _guard = tempfile::Builder::new()
                .prefix("tmp-")
                .tempdir_in(tmp.path())
                .unwrap();
        }
        assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
    }
}
