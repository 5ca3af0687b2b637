use crate::error::{CacheError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
#[cfg(test)]
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard upper bound for any payload the cache will write or read back.
///
/// Corruption should degrade to a cache miss, not an out-of-memory crash: a
/// damaged length prefix must never make us allocate an enormous buffer.
pub const PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Milliseconds since the unix epoch; a clock set before 1970 degrades to 0.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

pub(crate) fn bincode_options_limited() -> impl bincode::Options + Copy {
    bincode_options().with_limit(PAYLOAD_LIMIT_BYTES as u64)
}

pub(crate) fn bincode_serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode_options().serialize(value)?)
}

pub(crate) fn bincode_deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode_options_limited().deserialize(bytes)?)
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Replaces `dest` atomically: the content is produced into a unique
/// temporary file in the same directory, synced, then renamed over `dest`.
///
/// Readers either see the previous file or the complete new one, never a
/// partial write.
pub(crate) fn replace_file_atomic(
    dest: &Path,
    write: impl FnOnce(&mut fs::File) -> Result<()>,
) -> Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent)?;

    let (tmp_path, mut file) = open_unique_tmp(dest, &parent)?;
    let written = write(&mut file).and_then(|()| Ok(file.sync_all()?));
    drop(file);
    if let Err(err) = written {
        remove_file_best_effort(&tmp_path, "replace_file_atomic.write_failed");
        return Err(err);
    }

    if let Err(err) = rename_over(&tmp_path, dest) {
        remove_file_best_effort(&tmp_path, "replace_file_atomic.rename_failed");
        return Err(CacheError::from(err));
    }

    sync_dir_best_effort(&parent);
    Ok(())
}

fn rename_over(tmp_path: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(tmp_path, dest) {
        Ok(()) => Ok(()),
        Err(err) if cfg!(windows) && dest.exists() => {
            // Windows `rename` does not overwrite; remove the destination and
            // try once more.
            match fs::remove_file(dest) {
                Ok(()) => {}
                Err(remove_err) if remove_err.kind() == io::ErrorKind::NotFound => {}
                Err(_) => return Err(err),
            }
            fs::rename(tmp_path, dest)
        }
        Err(err) => Err(err),
    }
}

fn open_unique_tmp(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}

pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(
                target = "quill.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
        }
    }
}

pub(crate) fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(
                    target = "quill.cache",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync directory (best effort)"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}
