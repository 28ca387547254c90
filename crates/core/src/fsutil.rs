//! Filesystem helpers for crash-safe writes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

/// Write `data` to `path` atomically using temp-file-then-rename.
///
/// The temp file lives next to the target so the rename never crosses a
/// filesystem. Either the old or the new content is visible, never a partial
/// write. Parent directories are created as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{}.shadowsync-{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Copy `src` over `dst` with copy-then-rename semantics.
pub fn atomic_copy(src: &Path, dst: &Path) -> io::Result<()> {
    let data = fs::read(src)?;
    atomic_write(dst, &data)
}

/// Remove a file, treating "already gone" as success. Empty parent
/// directories up to (not including) `root` are pruned.
pub fn remove_file_if_exists(root: &Path, path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
    Ok(())
}

/// Read a file as UTF-8 text. Missing files and binary content are `None`.
pub fn read_text(path: &Path) -> io::Result<Option<String>> {
    Ok(read_bytes(path)?.and_then(bytes_to_text))
}

/// Read a file, `None` if it does not exist.
pub fn read_bytes(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decode bytes as text, rejecting binary content (NUL bytes or invalid UTF-8).
pub fn bytes_to_text(bytes: Vec<u8>) -> Option<String> {
    if looks_binary(&bytes) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

/// Git's heuristic: a NUL byte in the first 8000 bytes means binary.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8000).any(|b| *b == 0)
}

/// Normalize a relative path to forward slashes.
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
