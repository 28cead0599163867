//! Filesystem helpers shared across the workspace.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write `buf` to `path` atomically.
///
/// The bytes are written to a file of the same name inside a fresh
/// temporary directory next to the target, then renamed into place.
/// The temporary directory keeps concurrent writers of the same target
/// from colliding on the temp name itself.
pub fn atomic_write_file(path: &Path, buf: &[u8], mode: u32) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let tmpdir = tempfile::Builder::new().prefix("tmp-").tempdir_in(dir)?;
    let tmpname = tmpdir.path().join(base);
    fs::write(&tmpname, buf)?;
    fs::set_permissions(&tmpname, fs::Permissions::from_mode(mode))?;
    fs::rename(&tmpname, path)?;
    Ok(())
}

/// Whether `dir` is an empty, readable directory.
pub fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_file_with_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.json");
        atomic_write_file(&path, b"{}", 0o644).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{}");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out");
        fs::write(&path, b"old").unwrap();
        atomic_write_file(&path, b"new", 0o644).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_dirs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out");
        atomic_write_file(&path, b"data", 0o600).unwrap();
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_is_empty_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(is_empty_dir(tmp.path()));
        fs::write(tmp.path().join("f"), b"x").unwrap();
        assert!(!is_empty_dir(tmp.path()));
        assert!(!is_empty_dir(&tmp.path().join("missing")));
    }
}
