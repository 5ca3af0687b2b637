use crate::error::{CacheError, Result};
use crate::lock::MapLock;
use crate::util::{remove_file_best_effort, replace_file_atomic, sync_dir_best_effort, PAYLOAD_LIMIT_BYTES};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"QMAP";
/// Version of the log container itself, independent of the artifact format
/// tag supplied by callers.
const CONTAINER_FORMAT: u16 = 1;
const HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 9;

const OP_REMOVE: u8 = 0;
const OP_PUT: u8 = 1;

/// Compact on close only once at least this much of the log is dead weight.
const COMPACT_MIN_DEAD_BYTES: u64 = 64 * 1024;

/// A version-gated on-disk map from small integer keys to byte blobs.
///
/// The map is a single append log replayed into an in-memory index at open:
/// - 16-byte header: magic, container format, the caller's version tag
/// - records: `key u32 | op u8 | len u32 | payload`
///
/// Opening with a version tag different from the one stamped on disk (or an
/// unreadable header) discards the whole file and recreates it empty; this
/// is the single invalidation mechanism for format-level incompatibility.
/// A torn tail record left by a crash is dropped at the next open without
/// affecting other keys. `close` compacts the log when enough of it is dead.
///
/// The map holds an exclusive lock (in-process and cross-process) on a
/// sibling `.lock` file for its whole open lifetime.
#[derive(Debug)]
pub struct PersistentMap {
    path: PathBuf,
    version: u32,
    file: File,
    index: HashMap<u32, IndexEntry>,
    /// End of the last complete record; appends always start here.
    log_end: u64,
    /// Bytes occupied by overwritten records and tombstones.
    dead_bytes: u64,
    _lock: MapLock,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Payload offset within the log file.
    offset: u64,
    len: u32,
}

enum OpenOutcome {
    Opened {
        file: File,
        index: HashMap<u32, IndexEntry>,
        log_end: u64,
    },
    Missing,
    Recreate { reason: &'static str },
}

impl PersistentMap {
    /// Opens the map at `path` if present and stamped with `version`;
    /// otherwise discards whatever is there and creates a fresh, empty map.
    pub fn open(path: impl AsRef<Path>, version: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = MapLock::try_exclusive(&lock_path(&path))?;

        match Self::try_open_existing(&path, version)? {
            OpenOutcome::Opened {
                file,
                index,
                log_end,
            } => {
                let dead_bytes = dead_bytes(&index, log_end);
                Ok(Self {
                    path,
                    version,
                    file,
                    index,
                    log_end,
                    dead_bytes,
                    _lock: lock,
                })
            }
            OpenOutcome::Missing => Self::create_empty(path, version, lock),
            OpenOutcome::Recreate { reason } => {
                tracing::info!(
                    target = "quill.cache",
                    path = %path.display(),
                    version,
                    reason,
                    "discarding incompatible persistent map"
                );
                remove_file_best_effort(&path, "persistent_map.recreate");
                Self::create_empty(path, version, lock)
            }
        }
    }

    fn try_open_existing(path: &Path, version: u32) -> Result<OpenOutcome> {
        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(OpenOutcome::Missing),
            Err(err) => return Err(err.into()),
        };

        match read_header(&mut file) {
            Ok(Some(stored)) if stored == version => {}
            Ok(Some(_)) => return Ok(OpenOutcome::Recreate {
                reason: "version tag mismatch",
            }),
            Ok(None) => return Ok(OpenOutcome::Recreate {
                reason: "unrecognized header",
            }),
            Err(_) => return Ok(OpenOutcome::Recreate {
                reason: "unreadable header",
            }),
        }

        let replayed = match replay(&mut file) {
            Ok(replayed) => replayed,
            Err(_) => return Ok(OpenOutcome::Recreate {
                reason: "unreadable log",
            }),
        };

        if replayed.valid_end < replayed.file_len {
            tracing::debug!(
                target = "quill.cache",
                path = %path.display(),
                valid_end = replayed.valid_end,
                file_len = replayed.file_len,
                "dropping torn tail of persistent map log"
            );
            file.set_len(replayed.valid_end)?;
        }

        Ok(OpenOutcome::Opened {
            file,
            index: replayed.index,
            log_end: replayed.valid_end,
        })
    }

    fn create_empty(path: PathBuf, version: u32, lock: MapLock) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(&encode_header(version))?;
        file.sync_all()?;
        if let Some(parent) = path.parent() {
            sync_dir_best_effort(parent);
        }

        Ok(Self {
            path,
            version,
            file,
            index: HashMap::new(),
            log_end: HEADER_LEN as u64,
            dead_bytes: 0,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The version tag this map was opened with.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Returns the stored bytes for `key`, or `None` if absent.
    pub fn get(&mut self, key: u32) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.index.get(&key).copied() else {
            return Ok(None);
        };
        let mut buf = vec![0_u8; entry.len as usize];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(Some(buf))
    }

    /// Upserts `value` under `key`.
    pub fn put(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if value.len() > PAYLOAD_LIMIT_BYTES {
            return Err(CacheError::EntryTooLarge {
                len: value.len(),
                limit: PAYLOAD_LIMIT_BYTES,
            });
        }

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + value.len());
        record.extend_from_slice(&key.to_le_bytes());
        record.push(OP_PUT);
        record.extend_from_slice(&(value.len() as u32).to_le_bytes());
        record.extend_from_slice(value);

        self.append(&record)?;

        let entry = IndexEntry {
            offset: self.log_end + RECORD_HEADER_LEN as u64,
            len: value.len() as u32,
        };
        if let Some(prev) = self.index.insert(key, entry) {
            self.dead_bytes += RECORD_HEADER_LEN as u64 + u64::from(prev.len);
        }
        self.log_end += record.len() as u64;
        Ok(())
    }

    /// Deletes the entry for `key`; absent keys are a no-op.
    pub fn remove(&mut self, key: u32) -> Result<()> {
        if !self.index.contains_key(&key) {
            return Ok(());
        }

        let mut record = [0_u8; RECORD_HEADER_LEN];
        record[..4].copy_from_slice(&key.to_le_bytes());
        record[4] = OP_REMOVE;
        // len stays zero

        self.append(&record)?;

        if let Some(prev) = self.index.remove(&key) {
            self.dead_bytes += RECORD_HEADER_LEN as u64 + u64::from(prev.len);
        }
        // The tombstone itself is dead weight for the next compaction.
        self.dead_bytes += RECORD_HEADER_LEN as u64;
        self.log_end += RECORD_HEADER_LEN as u64;
        Ok(())
    }

    fn append(&mut self, record: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.log_end))?;
        if let Err(err) = self.file.write_all(record) {
            // A torn append is confined to the tail; cut it off so the next
            // append starts from a clean offset.
            let _ = self.file.set_len(self.log_end);
            return Err(err.into());
        }
        Ok(())
    }

    /// Flushes buffered writes to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Flushes and releases the map, compacting the log first when enough of
    /// it is dead. Dropping the map without `close` still syncs the file but
    /// skips compaction.
    pub fn close(mut self) -> Result<()> {
        self.maybe_compact()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let total = self.log_end.saturating_sub(HEADER_LEN as u64);
        if self.dead_bytes < COMPACT_MIN_DEAD_BYTES || self.dead_bytes * 2 < total {
            return Ok(());
        }
        self.compact()
    }

    fn compact(&mut self) -> Result<()> {
        let mut entries: Vec<(u32, IndexEntry)> =
            self.index.iter().map(|(key, entry)| (*key, *entry)).collect();
        entries.sort_by_key(|(key, _)| *key);

        let path = self.path.clone();
        let version = self.version;
        let file = &mut self.file;
        let mut new_index = HashMap::with_capacity(entries.len());
        let mut new_end = HEADER_LEN as u64;

        replace_file_atomic(&path, |out| {
            out.write_all(&encode_header(version))?;
            for (key, entry) in &entries {
                let mut payload = vec![0_u8; entry.len as usize];
                file.seek(SeekFrom::Start(entry.offset))?;
                file.read_exact(&mut payload)?;

                let mut header = [0_u8; RECORD_HEADER_LEN];
                header[..4].copy_from_slice(&key.to_le_bytes());
                header[4] = OP_PUT;
                header[5..].copy_from_slice(&entry.len.to_le_bytes());
                out.write_all(&header)?;
                out.write_all(&payload)?;

                new_index.insert(
                    *key,
                    IndexEntry {
                        offset: new_end + RECORD_HEADER_LEN as u64,
                        len: entry.len,
                    },
                );
                new_end += RECORD_HEADER_LEN as u64 + u64::from(entry.len);
            }
            Ok(())
        })?;

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.index = new_index;
        self.log_end = new_end;
        self.dead_bytes = 0;

        tracing::debug!(
            target = "quill.cache",
            path = %self.path.display(),
            entries = self.index.len(),
            bytes = self.log_end,
            "compacted persistent map log"
        );
        Ok(())
    }
}

impl Drop for PersistentMap {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

fn encode_header(version: u32) -> [u8; HEADER_LEN] {
    let mut header = [0_u8; HEADER_LEN];
    header[..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&CONTAINER_FORMAT.to_le_bytes());
    // bytes 6..8 reserved
    header[8..12].copy_from_slice(&version.to_le_bytes());
    // bytes 12..16 reserved
    header
}

/// Reads the header and returns the stored version tag, or `None` when the
/// file does not look like a map of ours.
fn read_header(file: &mut File) -> io::Result<Option<u32>> {
    let mut header = [0_u8; HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    if header[..4] != MAGIC {
        return Ok(None);
    }
    let container = u16::from_le_bytes([header[4], header[5]]);
    if container != CONTAINER_FORMAT {
        return Ok(None);
    }
    Ok(Some(u32::from_le_bytes([
        header[8], header[9], header[10], header[11],
    ])))
}

struct Replayed {
    index: HashMap<u32, IndexEntry>,
    /// End of the last complete, well-formed record.
    valid_end: u64,
    file_len: u64,
}

fn replay(file: &mut File) -> io::Result<Replayed> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(HEADER_LEN as u64))?;
    let mut reader = BufReader::new(&mut *file);

    let mut index = HashMap::new();
    let mut offset = HEADER_LEN as u64;

    while file_len - offset >= RECORD_HEADER_LEN as u64 {
        let mut header = [0_u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut header)?;
        let key = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let op = header[4];
        let len = u64::from(u32::from_le_bytes([
            header[5], header[6], header[7], header[8],
        ]));

        match op {
            OP_REMOVE if len == 0 => {
                index.remove(&key);
                offset += RECORD_HEADER_LEN as u64;
            }
            OP_PUT
                if len <= PAYLOAD_LIMIT_BYTES as u64
                    && len <= file_len - offset - RECORD_HEADER_LEN as u64 =>
            {
                index.insert(
                    key,
                    IndexEntry {
                        offset: offset + RECORD_HEADER_LEN as u64,
                        len: len as u32,
                    },
                );
                reader.seek_relative(len as i64)?;
                offset += RECORD_HEADER_LEN as u64 + len;
            }
            // Malformed record: everything from here on is dropped.
            _ => break,
        }
    }

    Ok(Replayed {
        index,
        valid_end: offset,
        file_len,
    })
}

fn dead_bytes(index: &HashMap<u32, IndexEntry>, log_end: u64) -> u64 {
    let live: u64 = index
        .values()
        .map(|entry| RECORD_HEADER_LEN as u64 + u64::from(entry.len))
        .sum();
    log_end.saturating_sub(HEADER_LEN as u64).saturating_sub(live)
}
