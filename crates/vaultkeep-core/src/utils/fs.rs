//! Owner-only, atomically replaced files.
//!
//! Every file vaultkeep writes (token, PID file, SSH key) is secret or
//! shared with the detached watchdog, so all of them go through
//! [`write_private`]: the bytes land in a temp file in the destination
//! directory, created with mode 0600, and are renamed over the target.
//! Readers see either the previous complete file or the new one.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Prefix for in-flight temp files, so stray ones are recognisable
const TEMP_PREFIX: &str = ".vaultkeep-";

/// Create `dir` (and parents) with mode 0700 if it does not exist yet.
/// An existing directory is left as it is.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Atomically replace `path` with `contents`, readable by the owner only.
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_private_dir(dir)?;

    // tempfile creates with 0600 on unix before any byte is written
    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_private_replaces_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value");

        write_private(&path, b"first").expect("write");
        write_private(&path, b"second").expect("overwrite");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        // No temp files left behind
        let leftovers = fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_write_private_creates_parent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("deeper").join("value");

        write_private(&path, b"x").expect("write");
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("keys");
        let path = sub.join("secret");
        write_private(&path, b"x").expect("write");

        let file_mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        let dir_mode = fs::metadata(&sub).expect("meta").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        assert_eq!(dir_mode, 0o700);
    }
}
