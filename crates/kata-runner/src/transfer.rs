//! Host → container file delivery.
//!
//! Files are staged under a host temp dir, packed as a gzipped tar of that
//! dir, and fed to a `docker exec --interactive` whose script unpacks stdin
//! into the avatar's sandbox. Ownership comes from the exec's `--user`.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Field, Result, ValidationError};

/// Relative path → content. Content may be binary.
pub type Files = BTreeMap<String, Vec<u8>>;

pub trait Disk {
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HostDisk;

impl Disk for HostDisk {
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        std::fs::write(path, content)
    }
}

/// Non-empty, relative, no `.`/`..` components, no NUL.
pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::invalid(Field::Filename);
    if name.is_empty() || name.contains('\0') || name.starts_with('/') {
        return Err(invalid());
    }
    let path = Path::new(name);
    for comp in path.components() {
        match comp {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    if name.split('/').any(|part| part.is_empty() || part == ".") {
        return Err(invalid());
    }
    Ok(())
}

/// Writes `files` under `dir`, creating sub-directories as needed.
pub fn stage(disk: &dyn Disk, files: &Files, dir: &Path) -> Result<()> {
    for (name, content) in files {
        validate_filename(name)?;
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            if parent != dir {
                std::fs::create_dir_all(parent)?;
            }
        }
        disk.write(&path, content)?;
    }
    Ok(())
}

/// gzipped tar of the contents of `dir`, rooted at `.`.
pub fn archive_dir(dir: &Path) -> Result<Vec<u8>> {
    let gz = GzEncoder::new(Vec::new(), Compression::fast());
    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let gz = builder.into_inner()?;
    Ok(gz.finish()?)
}

/// Stages `files` in a fresh temp dir and returns its archive. The temp dir
/// is removed before returning, on every path.
pub fn pack(disk: &dyn Disk, files: &Files) -> Result<Vec<u8>> {
    let staging = tempfile::Builder::new().prefix("kata-runner").tempdir()?;
    #[cfg(unix)]
    {
        // The archive's `.` entry carries this mode onto the avatar's dir.
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(staging.path(), std::fs::Permissions::from_mode(0o755))?;
    }
    stage(disk, files, staging.path())?;
    archive_dir(staging.path())
}

/// In-container script: unpack stdin into `sandbox`, then run `then`. Chained
/// with `&&` so `then` never sees a partially unpacked tree.
///
/// `--touch` stamps extraction time as mtime; its granularity depends on the
/// image's tar and coreutils.
pub fn unpack_script(sandbox: &str, then: &str) -> String {
    format!(
        "cd {} && tar --touch -zxf - -C . && {then}",
        shell_words::quote(sandbox)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    fn unpack(bytes: &[u8]) -> BTreeMap<String, Vec<u8>> {
        let gz = flate2::read::GzDecoder::new(bytes);
        let mut ar = tar::Archive::new(gz);
        let mut out = BTreeMap::new();
        for entry in ar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                let path = entry.path().unwrap().to_string_lossy().to_string();
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).unwrap();
                out.insert(path.trim_start_matches("./").to_string(), buf);
            }
        }
        out
    }

    #[test]
    fn filename_validation() {
        for ok in ["cyber-dojo.sh", "src/hiker.c", "a/b/c.txt", ".hidden"] {
            assert!(validate_filename(ok).is_ok(), "{ok}");
        }
        for bad in ["", "/etc/passwd", "../x", "a/../b", "./x", "a//b", "a/", "a\0b"] {
            assert!(validate_filename(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn pack_preserves_text_and_binary_content() {
        let mut files = Files::new();
        files.insert("cyber-dojo.sh".to_string(), b"echo hello".to_vec());
        files.insert("sub/dir/data.bin".to_string(), vec![0, 159, 146, 150, 255]);
        let bytes = pack(&HostDisk, &files).unwrap();
        assert_eq!(unpack(&bytes), files);
    }

    #[test]
    fn stage_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Files::new();
        files.insert("../escape".to_string(), b"x".to_vec());
        let err = stage(&HostDisk, &files, dir.path()).unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::invalid(Field::Filename))
        );
    }

    #[test]
    fn unpack_script_chains_with_and() {
        assert_eq!(
            unpack_script("/sandboxes/salmon", "sh ./cyber-dojo.sh"),
            "cd /sandboxes/salmon && tar --touch -zxf - -C . && sh ./cyber-dojo.sh"
        );
    }
}
