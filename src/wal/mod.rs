//! Write-Ahead Log Module
//!
//! A durable, append-only operation log for the LSM memtable. Every
//! insert or delete is recorded here *before* it mutates the memtable,
//! so replaying the log after a crash reproduces the lost in-memory
//! state.
//!
//! # On-disk layout
//!
//! ```text
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! Each record is a [`LogRecord`] — `(prefix, timestamp, entry)` —
//! serialized with [`crate::encoding`] and framed by a 4-byte
//! little-endian length and a CRC32 computed over `len || bytes`.
//!
//! # Guarantees
//!
//! - **Durability:** every [`Wal::append`] is followed by `fsync`.
//! - **Integrity:** record checksums are verified during replay.
//! - **Corruption detection:** replay yields an error at the first
//!   failed checksum or truncated write; the caller keeps everything
//!   recovered up to that point.


use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Default WAL file name inside the engine directory.
pub const WAL_FILE_NAME: &str = "WAL";

/// Maximum size of a single serialized record (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Record exceeds [`MAX_RECORD_SIZE`].
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Unexpected end-of-file during replay (torn write).
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Operation tag of a log record, stored as its canonical string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPrefix {
    /// A key-value insertion.
    Insert,
    /// A point deletion (tombstone).
    Delete,
}

impl LogPrefix {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Delete => "delete",
        }
    }
}

/// One logged mutation: `(prefix, timestamp, entry)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Operation tag.
    pub prefix: LogPrefix,

    /// Wall-clock timestamp in nanoseconds since the UNIX epoch.
    pub timestamp: u64,

    /// The key bytes.
    pub key: Vec<u8>,

    /// The value bytes; empty for deletes.
    pub value: Vec<u8>,
}

impl Encode for LogRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.prefix.as_str().encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for LogRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (prefix, n) = String::decode_from(&buf[off..])?;
        off += n;
        let prefix = match prefix.as_str() {
            "insert" => LogPrefix::Insert,
            "delete" => LogPrefix::Delete,
            _ => {
                return Err(EncodingError::InvalidTag {
                    tag: 0,
                    type_name: "LogPrefix",
                });
            }
        };
        let (timestamp, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (key, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                prefix,
                timestamp,
                key,
                value,
            },
            off,
        ))
    }
}

/// The write-ahead log handle.
///
/// The file handle is shared behind a mutex so appenders and replay
/// iterators can coexist; the iterator tracks its own offset and seeks
/// before every read.
#[derive(Debug)]
pub struct Wal {
    file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl Wal {
    /// Opens (or creates) the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        info!(path = %path.display(), "WAL opened");
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Appends one record and fsyncs.
    ///
    /// Framing: `[u32 len LE][record bytes][u32 crc32 LE]` with the CRC
    /// computed over `len || bytes`.
    pub fn append(&self, record: &LogRecord) -> Result<(), WalError> {
        let record_bytes = encoding::encode_to_vec(record)?;
        if record_bytes.len() > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(record_bytes.len()));
        }
        let len_bytes = (record_bytes.len() as u32).to_le_bytes();

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        let checksum = hasher.finalize();

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        guard.write_all(&len_bytes)?;
        guard.write_all(&record_bytes)?;
        guard.write_all(&checksum.to_le_bytes())?;
        guard.sync_all()?;

        trace!(
            len = record_bytes.len(),
            crc = format_args!("{checksum:08x}"),
            "WAL record appended"
        );
        Ok(())
    }

    /// Returns an iterator replaying records from the start of the log.
    pub fn replay(&self) -> WalIter {
        debug!(path = %self.path.display(), "WAL replay started");
        WalIter {
            file: Arc::clone(&self.file),
            offset: 0,
        }
    }

    /// Clears the log. Called once the logged state has been made
    /// durable elsewhere (memtable flushed into an SSTable).
    pub fn truncate(&self) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        guard.set_len(0)?;
        guard.sync_all()?;
        info!(path = %self.path.display(), "WAL truncated");
        Ok(())
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        Ok(guard.metadata()?.len())
    }
}

/// Streaming replay iterator.
///
/// Holds an `Arc` to the shared file handle, so it may outlive the
/// [`Wal`] that created it. Each `next` locks the file, seeks to its
/// logical offset, and reads exactly one framed record.
pub struct WalIter {
    file: Arc<Mutex<File>>,
    offset: u64,
}

impl Iterator for WalIter {
    type Item = Result<LogRecord, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(_) => return Some(Err(WalError::Internal("mutex poisoned".into()))),
        };

        if let Err(e) = guard.seek(SeekFrom::Start(self.offset)) {
            return Some(Err(WalError::Io(e)));
        }

        let mut len_bytes = [0u8; U32_SIZE];
        match guard.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                trace!(offset = self.offset, "WAL replay reached end of file");
                return None;
            }
            Err(e) => return Some(Err(WalError::Io(e))),
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > MAX_RECORD_SIZE {
            return Some(Err(WalError::RecordTooLarge(record_len)));
        }

        let mut record_bytes = vec![0u8; record_len];
        if let Err(e) = guard.read_exact(&mut record_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(offset = self.offset, len = record_len, "WAL torn record");
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }

        let mut checksum_bytes = [0u8; U32_SIZE];
        if let Err(e) = guard.read_exact(&mut checksum_bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                warn!(offset = self.offset, "WAL torn checksum");
                return Some(Err(WalError::UnexpectedEof));
            }
            return Some(Err(WalError::Io(e)));
        }
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        if let Ok(pos) = guard.stream_position() {
            self.offset = pos;
        }

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(&record_bytes);
        if hasher.finalize() != stored_checksum {
            warn!(offset = self.offset, "WAL record checksum mismatch");
            return Some(Err(WalError::ChecksumMismatch));
        }

        match encoding::decode_from_slice::<LogRecord>(&record_bytes) {
            Ok((record, _)) => Some(Ok(record)),
            Err(e) => Some(Err(WalError::Encoding(e))),
        }
    }
}
