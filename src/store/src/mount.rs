//! Overlay composition: short layer links and the mount invocation.
//!
//! The kernel caps the total length of the overlay `lowerdir=` option,
//! and 64-hex-character layer directory names blow through that cap
//! for deep images. Every extracted layer therefore gets a short random
//! symlink next to it; `<digest>.link` records the allocated name and
//! is the canonical marker that a short name exists. The mount runs
//! with the overlay directory as its working directory so the short
//! names resolve.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

use strata_core::error::{Result, StrataError};
use strata_core::fs::atomic_write_file;

use crate::digest::Digest;

const MAX_RETRIES: u32 = 10;

/// A base-36 token from 63 bits of OS randomness.
///
/// The randomness must be cryptographically strong: multiple processes
/// may share one cache, and a weak generator seeded alike in each would
/// collide. RNG failures back off exponentially before giving up.
fn random_token() -> Result<String> {
    for retry in 0..MAX_RETRIES {
        let mut buf = [0u8; 8];
        match OsRng.try_fill_bytes(&mut buf) {
            Ok(()) => {
                let n = u64::from_le_bytes(buf) & (i64::MAX as u64);
                return Ok(to_base36(n));
            }
            Err(err) => {
                tracing::warn!(error = %err, retry, "reading the system RNG failed");
                std::thread::sleep(Duration::from_millis(100u64 << retry));
            }
        }
    }
    Err(StrataError::Filesystem(io::Error::other(
        "giving up reading the system RNG",
    )))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out: Vec<u8> = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    out.iter().map(|&b| b as char).collect()
}

/// Ensure a short symlink exists for the layer directory named by
/// `digest` under `overlay_dir`.
///
/// If `<digest>.link` is already present, its name is kept. Otherwise a
/// fresh token is allocated (retrying on name collisions), the relative
/// symlink created, and the `.link` file written atomically.
pub fn ensure_short_link(overlay_dir: &Path, digest: &Digest) -> Result<()> {
    let layer_name = digest.encoded();
    let saved_link = overlay_dir.join(format!("{layer_name}.link"));
    if saved_link.exists() {
        return Ok(());
    }
    let mut last_err: Option<io::Error> = None;
    for _ in 0..MAX_RETRIES {
        let token = random_token()?;
        let link = overlay_dir.join(&token);
        if let Err(err) = symlink(layer_name, &link) {
            tracing::debug!(link = %link.display(), "short link name taken, retrying");
            last_err = Some(err);
            continue;
        }
        if let Err(err) = atomic_write_file(&saved_link, token.as_bytes(), 0o644) {
            let _ = fs::remove_file(&link);
            return Err(err.into());
        }
        tracing::debug!(layer = layer_name, token = %token, "created short link");
        return Ok(());
    }
    Err(StrataError::Filesystem(io::Error::other(format!(
        "giving up creating a short link for {layer_name}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))))
}

/// The short name recorded for a layer, as used in `lowerdir=`.
pub fn read_short_link(overlay_dir: &Path, digest: &Digest) -> Result<String> {
    let link = overlay_dir.join(format!("{}.link", digest.encoded()));
    let token = fs::read_to_string(&link)?;
    Ok(token.trim().to_string())
}

/// Mount an overlay at `dest` from short-named lower dirs plus the
/// given upper and work directories.
///
/// `lowers` must already be in top-down order. Upper, work and target
/// paths are made absolute since the mount command runs with
/// `overlay_dir` as its working directory.
pub fn mount_overlay(
    overlay_dir: &Path,
    lowers: &[String],
    upper: &Path,
    work: &Path,
    dest: &Path,
) -> Result<()> {
    let upper = fs::canonicalize(upper)?;
    let work = fs::canonicalize(work)?;
    let dest = fs::canonicalize(dest)?;
    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lowers.join(":"),
        upper.display(),
        work.display()
    );
    tracing::debug!(%options, target = %dest.display(), "mounting overlay");
    let output = Command::new("mount")
        .args(["-t", "overlay", "overlay", "-o", &options])
        .arg(&dest)
        .current_dir(overlay_dir)
        .output()?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StrataError::Mount(format!(
            "mounting to {}: {}; output: {}{}",
            dest.display(),
            output.status,
            stdout,
            stderr
        )));
    }
    Ok(())
}
