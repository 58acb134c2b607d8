//! Append-only, single-writer, durably-ordered record log with
//! deterministic replay.
//!
//! On-disk framing (normative): `length:u32 LE | type:u8 | payload:bytes |
//! crc32:u32 LE`, where the CRC covers `type | payload` and `length` counts
//! everything after itself (the type byte, the payload, and the trailing
//! CRC). A torn write at the tail manifests as either a short read or a CRC
//! mismatch; both truncate replay at that point. A checksum failure on any
//! record that is *not* the last one on disk is fatal corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use ward_core::Record;

const LENGTH_PREFIX_BYTES: u64 = 4;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("mid-log corruption at offset {offset}: {reason}")]
    Corruption { offset: u64, reason: String },

    #[error("record decode error: {0}")]
    Decode(#[from] bincode::Error),
}

pub type WalResult<T> = Result<T, WalError>;

/// One successfully decoded record plus the byte offset it started at.
pub struct ReplayedRecord {
    pub offset: u64,
    pub record: Record,
}

pub struct Wal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    offset: AtomicU64,
}

impl Wal {
    /// Opens (creating if necessary) the log at `path` for append, and
    /// positions the internal offset counter at the current end of file.
    /// Does not replay; call [`Wal::replay`] explicitly on startup.
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            offset: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Serializes and appends one record. Returns the offset it was written
    /// at. Bytes have entered the OS file by the time this returns, but
    /// durability across a crash requires a subsequent [`Wal::sync`].
    pub fn append(&self, record: &Record) -> WalResult<u64> {
        let frame = encode_frame(record);
        let mut writer = self.writer.lock().expect("wal writer lock poisoned");
        let offset = self.offset.load(Ordering::Acquire);
        writer.write_all(&frame)?;
        writer.flush()?;
        self.offset.fetch_add(frame.len() as u64, Ordering::AcqRel);
        Ok(offset)
    }

    /// Forces an fsync. Every record appended before a successful return is
    /// durable across process crash and OS reboot.
    pub fn sync(&self) -> WalResult<()> {
        let writer = self.writer.lock().expect("wal writer lock poisoned");
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Decodes records in order starting at offset zero, invoking `apply_fn`
    /// exactly once per well-formed record. Stops at EOF or at the first
    /// record that fails frame/checksum validation *if it is the last bytes
    /// in the file* (tail corruption, discarded silently). A checksum
    /// failure on a record that has more bytes following it is fatal.
    pub fn replay(&self, mut apply_fn: impl FnMut(ReplayedRecord) -> WalResult<()>) -> WalResult<usize> {
        let mut file = OpenOptions::new().read(true).open(&self.path)?;
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut pos = 0usize;
        let mut count = 0usize;
        while pos < buf.len() {
            match decode_one(&buf[pos..]) {
                FrameOutcome::Complete { record, consumed } => {
                    apply_fn(ReplayedRecord {
                        offset: pos as u64,
                        record,
                    })?;
                    pos += consumed;
                    count += 1;
                }
                FrameOutcome::TornTail => {
                    tracing::warn!(
                        offset = pos as u64,
                        remaining_bytes = buf.len() - pos,
                        "wal replay: discarding torn tail record"
                    );
                    break;
                }
                FrameOutcome::BadChecksum { consumed } => {
                    let is_tail = pos + consumed >= buf.len();
                    if is_tail {
                        tracing::warn!(offset = pos as u64, "wal replay: discarding tail record with bad checksum");
                        break;
                    }
                    return Err(WalError::Corruption {
                        offset: pos as u64,
                        reason: "checksum mismatch on a non-tail record".to_string(),
                    });
                }
            }
        }
        Ok(count)
    }

    pub fn close(self) -> WalResult<()> {
        self.sync()
    }
}

fn encode_frame(record: &Record) -> Vec<u8> {
    let type_tag = record.type_tag();
    let payload = record.encode_payload();

    let mut crc_input = Vec::with_capacity(1 + payload.len());
    crc_input.push(type_tag);
    crc_input.extend_from_slice(&payload);
    let crc = crc32fast::hash(&crc_input);

    // length excludes its own four bytes: type(1) + payload + crc32(4).
    let length = (1 + payload.len() + 4) as u32;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES as usize + length as usize);
    frame.extend_from_slice(&length.to_le_bytes());
    frame.push(type_tag);
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

enum FrameOutcome {
    Complete { record: Record, consumed: usize },
    TornTail,
    BadChecksum { consumed: usize },
}

fn decode_one(buf: &[u8]) -> FrameOutcome {
    if buf.len() < LENGTH_PREFIX_BYTES as usize {
        return FrameOutcome::TornTail;
    }
    let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let total = 4 + length;
    if buf.len() < total || length < 5 {
        return FrameOutcome::TornTail;
    }

    let type_tag = buf[4];
    let payload_end = 4 + length - 4;
    let payload = &buf[5..payload_end];
    let stored_crc = u32::from_le_bytes(buf[payload_end..total].try_into().unwrap());

    let mut crc_input = Vec::with_capacity(1 + payload.len());
    crc_input.push(type_tag);
    crc_input.extend_from_slice(payload);
    let actual_crc = crc32fast::hash(&crc_input);

    if actual_crc != stored_crc {
        return FrameOutcome::BadChecksum { consumed: total };
    }

    match Record::decode_payload(payload) {
        Ok(record) => FrameOutcome::Complete {
            record,
            consumed: total,
        },
        Err(_) => FrameOutcome::BadChecksum { consumed: total },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;
    use ward_core::RetryPolicy;

    fn sample_record() -> Record {
        Record::TaskCreated {
            task_id: Uuid::new_v4(),
            payload: vec![1, 2, 3, 4],
            execution_window_secs: 30,
            retry_policy: RetryPolicy::none(),
            request_id: Some("req-1".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        let rec1 = sample_record();
        let rec2 = sample_record();
        wal.append(&rec1).unwrap();
        wal.append(&rec2).unwrap();
        wal.sync().unwrap();

        let mut seen = Vec::new();
        let count = wal
            .replay(|r| {
                seen.push(r.record.type_tag());
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec![1, 1]);
    }

    #[test]
    fn reopen_after_close_preserves_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(&sample_record()).unwrap();
            wal.close().unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        let count = wal.replay(|_| Ok(())).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn torn_tail_is_discarded_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_record()).unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Simulate a crash mid-write: append a few garbage bytes that look
        // like the start of a length prefix but never complete.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        let mut count = 0;
        let result = wal.replay(|_| {
            count += 1;
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(count, 1);
    }

    #[test]
    fn bad_checksum_on_non_tail_record_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = Wal::open(&path).unwrap();
        wal.append(&sample_record()).unwrap();
        wal.append(&sample_record()).unwrap();
        wal.sync().unwrap();
        drop(wal);

        // Corrupt a byte inside the first record's payload region.
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let wal = Wal::open(&path).unwrap();
        let result = wal.replay(|_| Ok(()));
        assert!(matches!(result, Err(WalError::Corruption { .. })));
    }
}
