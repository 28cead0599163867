//! Layer extraction: tar+gzip with whiteout and link handling.
//!
//! Container layers are gzip-compressed tar streams with two quirks the
//! plain `Archive::unpack` path cannot express: whiteout sentinel files
//! encoding deletions against lower layers, and link entries whose
//! targets may not have been extracted yet. Extraction therefore runs
//! in two passes: the archive walk writes directories and regular files
//! and records whiteouts and links, then links are created and (in flat
//! mode) whiteouts applied.

use std::fs::{self, File, Permissions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use rustix::fs::{AtFlags, Gid, Uid, CWD};
use tar::{Archive, EntryType};

use strata_core::error::{Result, StrataError};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// How a layer is written into its destination.
#[derive(Debug, Clone, Copy)]
pub struct UnpackOptions {
    /// Extract into a dot-prefixed sibling directory and rename it over
    /// the destination once complete, so concurrent readers never see a
    /// partial tree.
    pub atomic: bool,
    /// Delete the paths named by `.wh.` entries once extraction
    /// finishes. Left off when the destination is an overlay lower dir,
    /// where the sentinels are simply dropped.
    pub apply_whiteouts: bool,
    /// Apply uid/gid from tar headers. Failures are warnings: without
    /// privileges the tree keeps whatever owner the process can write.
    pub chown: bool,
}

struct DeferredLink {
    target: PathBuf,
    path: PathBuf,
    hardlink: bool,
    mode: u32,
    uid: u64,
    gid: u64,
}

/// Extract a gzip-compressed layer tarball into `dest`.
pub fn unpack_layer(tarball: &Path, dest: &Path, opts: &UnpackOptions) -> Result<()> {
    tracing::debug!(
        layer = %tarball.display(),
        dest = %dest.display(),
        atomic = opts.atomic,
        "unpacking layer"
    );
    if !opts.atomic {
        fs::create_dir_all(dest)?;
        return extract_into(tarball, dest, opts);
    }

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let base = dest.file_name().ok_or_else(|| {
        std::io::Error::new(
            ErrorKind::InvalidInput,
            format!("{} has no directory name", dest.display()),
        )
    })?;
    let tmpdir = dir.join(format!(".{}", base.to_string_lossy()));
    fs::create_dir(&tmpdir)?;
    if let Err(err) = extract_into(tarball, &tmpdir, opts) {
        let _ = fs::remove_dir_all(&tmpdir);
        return Err(err);
    }
    if let Err(err) = fs::rename(&tmpdir, dest) {
        let _ = fs::remove_dir_all(&tmpdir);
        // A concurrent extractor of the same digest may have renamed
        // first; its tree is identical, so losing the race is fine.
        if dest.is_dir() {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

fn extract_into(tarball: &Path, dest: &Path, opts: &UnpackOptions) -> Result<()> {
    let file = File::open(tarball)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut links: Vec<DeferredLink> = Vec::new();
    let mut whiteouts: Vec<PathBuf> = Vec::new();

    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let raw = entry.path().map_err(tar_err)?.into_owned();
        let rel = sanitize(&raw);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let name = dest.join(&rel);
        let base = match name.file_name().and_then(|b| b.to_str()) {
            Some(base) => base.to_owned(),
            None => continue,
        };

        if base == OPAQUE_WHITEOUT {
            // Only meaningful when layers are composed by the overlay
            // driver; nothing to delete at per-layer extraction.
            continue;
        }
        if let Some(stripped) = base.strip_prefix(WHITEOUT_PREFIX) {
            // Reconstruct the path without the .wh. prefix in the
            // final component.
            let victim = match name.parent() {
                Some(parent) => parent.join(stripped),
                None => dest.join(stripped),
            };
            tracing::debug!(whiteout = %name.display(), target = %victim.display(), "found whiteout");
            whiteouts.push(victim);
            continue;
        }

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let uid = entry.header().uid().unwrap_or(0);
        let gid = entry.header().gid().unwrap_or(0);

        // Some images carry entries before their parent directories
        // (seen with jenkinsxio/jx:2.0.22).
        if let Some(parent) = name.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        match entry_type {
            EntryType::Directory => {
                if let Err(err) = fs::create_dir(&name) {
                    if err.kind() != ErrorKind::AlreadyExists {
                        return Err(err.into());
                    }
                }
                fs::set_permissions(&name, Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                let size = entry.header().size().unwrap_or(0);
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(tar_err)?;
                if (data.len() as u64) < size {
                    return Err(StrataError::TarMalformed(format!(
                        "{}: read {} of {} bytes",
                        rel.display(),
                        data.len(),
                        size
                    )));
                }
                // An upper layer may replace a symlink (or stale file)
                // with a regular file; clear the path first.
                let _ = fs::remove_file(&name);
                fs::write(&name, &data)?;
                fs::set_permissions(&name, Permissions::from_mode(mode))?;
            }
            EntryType::Link | EntryType::Symlink => {
                let link_target = entry
                    .link_name()
                    .map_err(tar_err)?
                    .ok_or_else(|| {
                        StrataError::TarMalformed(format!(
                            "{}: link entry without a target",
                            rel.display()
                        ))
                    })?
                    .into_owned();
                let hardlink = entry_type == EntryType::Link;
                // Hard link targets are relative to the archive root;
                // rebase them under the destination. Symlink targets
                // are kept verbatim.
                let target = if hardlink {
                    dest.join(sanitize(&link_target))
                } else {
                    link_target
                };
                // Targets may not have been extracted yet; create all
                // links after the walk.
                links.push(DeferredLink {
                    target,
                    path: name,
                    hardlink,
                    mode,
                    uid,
                    gid,
                });
                continue;
            }
            other => {
                tracing::warn!(
                    entry = %rel.display(),
                    entry_type = ?other,
                    layer = %tarball.display(),
                    "ignoring unsupported tar entry type"
                );
                continue;
            }
        }

        if opts.chown {
            chown_tolerant(&name, uid, gid, false);
        }
    }

    create_deferred_links(&links, opts)?;

    if opts.apply_whiteouts {
        apply_whiteouts(&whiteouts)?;
    }
    Ok(())
}

fn create_deferred_links(links: &[DeferredLink], opts: &UnpackOptions) -> Result<()> {
    for link in links {
        // Clear any entry left by a lower layer.
        let _ = fs::remove_file(&link.path);
        if link.hardlink {
            fs::hard_link(&link.target, &link.path).map_err(|err| {
                tracing::error!(
                    link = %link.path.display(),
                    target = %link.target.display(),
                    error = %err,
                    "creating hardlink failed"
                );
                StrataError::Filesystem(err)
            })?;
            fs::set_permissions(&link.path, Permissions::from_mode(link.mode))?;
            if opts.chown {
                chown_tolerant(&link.path, link.uid, link.gid, false);
            }
        } else {
            symlink(&link.target, &link.path).map_err(|err| {
                tracing::error!(
                    link = %link.path.display(),
                    target = %link.target.display(),
                    error = %err,
                    "creating symlink failed"
                );
                StrataError::Filesystem(err)
            })?;
            if opts.chown {
                chown_tolerant(&link.path, link.uid, link.gid, true);
            }
        }
    }
    Ok(())
}

fn apply_whiteouts(whiteouts: &[PathBuf]) -> Result<()> {
    for path in whiteouts {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "whiteout target does not exist, ignoring");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if meta.is_dir() {
            tracing::debug!(path = %path.display(), "removing whited-out directory");
            fs::remove_dir_all(path)?;
        } else {
            tracing::debug!(path = %path.display(), "removing whited-out file");
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Reduce a tar entry path to its normal components, dropping root,
/// `.` and `..` so entries cannot land outside the destination.
fn sanitize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn chown_tolerant(path: &Path, uid: u64, gid: u64, nofollow: bool) {
    let flags = if nofollow {
        AtFlags::SYMLINK_NOFOLLOW
    } else {
        AtFlags::empty()
    };
    if let Err(err) = rustix::fs::chownat(
        CWD,
        path,
        Some(unsafe { Uid::from_raw(uid as u32) }),
        Some(unsafe { Gid::from_raw(gid as u32) }),
        flags,
    ) {
        tracing::warn!(path = %path.display(), uid, gid, error = %err, "chown failed");
    }
}

fn tar_err(err: std::io::Error) -> StrataError {
    StrataError::TarMalformed(err.to_string())
}
