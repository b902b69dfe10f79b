//! File primitives for the cache: locked reads and atomic replacement.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use uuid::Uuid;

use crate::cache::types::CacheError;

/// Read a whole file under a shared lock.
///
/// Returns `Ok(None)` if the file does not exist.
pub(crate) fn read_shared(path: &Path) -> std::io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    file.lock_shared()?;
    let mut content = String::new();
    let read = file.read_to_string(&mut content);
    let _ = file.unlock();
    read?;

    Ok(Some(content))
}

/// Replace `path` with `bytes` so that no reader ever sees a partial file.
///
/// Writes a uniquely named temp file in the same directory, syncs it, then
/// renames it over the target. Concurrent writers of the same key each use
/// their own temp file; the last rename wins with a complete entry.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let dir = path
        .parent()
        .ok_or_else(|| CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: "cache path has no parent directory".to_string(),
        })?;
    std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = result {
        let _ = std::fs::remove_file(&temp_path);
        return Err(CacheError::io(&temp_path, e));
    }

    // Atomic rename
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(CacheError::io(path, e));
    }

    Ok(())
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
