//! Log-structured single-file backend
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("VTRIE_DB")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - reserved: 48 bytes
//!
//! [FRAMES: variable]
//!   - payload_len: 4 bytes (u32 LE)
//!   - checksum: 32 bytes (BLAKE3 of payload)
//!   - payload: zstd(bincode(WriteBatch))
//! ```
//!
//! One `write` appends one frame, so a batch is durable as a unit. The live
//! key space is kept in memory and rebuilt by replaying frames on open. A
//! frame cut short by the end of the file is the tail of an unacknowledged
//! write and is truncated away. A complete frame that fails its checksum or
//! does not decode is corruption: open fails and the file is left untouched.

use crate::store::backend::{Durability, KvBackend, WriteBatch, WriteOp};
use crate::store::memory::{apply_ops, range_of};
use crate::{Error, Result, FORMAT_VERSION, MAGIC};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HEADER_SIZE: u64 = 64;
const FRAME_HEADER_SIZE: usize = 4 + 32;
const COMPRESSION_LEVEL: i32 = 3;

/// Append handle and its position
struct LogWriter {
    file: File,
    offset: u64,
    frames: u64,
}

/// Summary of a compaction pass
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CompactionStats {
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub live_entries: usize,
}

/// A key-value backend persisted as an append-only log of batches
pub struct FileStore {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(MAGIC);
    header[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    file.write_all(&header)?;
    Ok(())
}

fn encode_frame(batch: &WriteBatch) -> Result<Vec<u8>> {
    let raw = bincode::serialize(batch)?;
    let payload = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidBatch(format!("batch of {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(blake3::hash(&payload).as_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// What replay found at the current offset
enum Frame {
    /// A complete frame and its size on disk
    Batch(WriteBatch, u64),
    End,
    /// An unfinished final write
    Torn,
}

/// Read the frame at `offset`; `remaining` is the file length past it.
fn read_frame<R: Read>(file: &mut R, offset: u64, remaining: u64) -> Result<Frame> {
    if remaining == 0 {
        return Ok(Frame::End);
    }
    if remaining < FRAME_HEADER_SIZE as u64 {
        return Ok(Frame::Torn);
    }
    let mut head = [0u8; FRAME_HEADER_SIZE];
    file.read_exact(&mut head)?;
    let len = u64::from(u32::from_le_bytes([head[0], head[1], head[2], head[3]]));
    let size = FRAME_HEADER_SIZE as u64 + len;
    if size > remaining {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len as usize];
    file.read_exact(&mut payload)?;
    if blake3::hash(&payload).as_bytes() != &head[4..] {
        return Err(Error::Corruption(format!("checksum mismatch in frame at offset {}", offset)));
    }
    let raw = zstd::decode_all(payload.as_slice())
        .map_err(|e| Error::Corruption(format!("frame at offset {}: {}", offset, e)))?;
    let batch = bincode::deserialize(&raw)
        .map_err(|e| Error::Corruption(format!("frame at offset {}: {}", offset, e)))?;
    Ok(Frame::Batch(batch, size))
}

/// File operations an append relies on
trait LogFile: Write + Seek {
    fn set_len(&self, size: u64) -> std::io::Result<()>;
    fn sync_data(&self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn set_len(&self, size: u64) -> std::io::Result<()> {
        File::set_len(self, size)
    }

    fn sync_data(&self) -> std::io::Result<()> {
        File::sync_data(self)
    }
}

/// Append `frame` at `offset`. On any failure the file is cut back to
/// `offset`: a frame survives a reopen only if the append returned `Ok`.
fn append_frame<F: LogFile>(file: &mut F, offset: u64, frame: &[u8], sync: bool) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut written = file.write_all(frame);
    if written.is_ok() && sync {
        written = file.sync_data();
    }
    if let Err(e) = written {
        if let Err(cut) = file.set_len(offset) {
            warn!(offset, error = %cut, "failed frame could not be truncated");
        }
        return Err(e.into());
    }
    Ok(())
}

impl FileStore {
    /// Create a new, empty log file (truncating any existing one)
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        write_header(&mut file)?;
        file.sync_all()?;
        info!(path = %path.display(), "created log store");

        Ok(FileStore {
            path,
            writer: Mutex::new(LogWriter {
                file,
                offset: HEADER_SIZE,
                frames: 0,
            }),
            map: RwLock::new(BTreeMap::new()),
        })
    }

    /// Open an existing log file and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| Error::InvalidFile("file shorter than header".into()))?;
        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != FORMAT_VERSION {
            return Err(Error::FormatVersion {
                expected: FORMAT_VERSION,
                found: version,
            });
        }

        let len = file.metadata()?.len();
        let mut map = BTreeMap::new();
        let mut offset = HEADER_SIZE;
        let mut frames = 0u64;
        loop {
            match read_frame(&mut file, offset, len - offset)? {
                Frame::Batch(batch, size) => {
                    apply_ops(&mut map, batch.into_ops());
                    offset += size;
                    frames += 1;
                }
                Frame::End => break,
                Frame::Torn => {
                    warn!(
                        path = %path.display(),
                        discarded = len - offset,
                        "truncating incomplete tail of log"
                    );
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
            }
        }
        debug!(path = %path.display(), frames, entries = map.len(), "replayed log store");

        Ok(FileStore {
            path,
            writer: Mutex::new(LogWriter {
                file,
                offset,
                frames,
            }),
            map: RwLock::new(map),
        })
    }

    /// Open or create a log file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes
    pub fn log_size(&self) -> u64 {
        self.writer.lock().offset
    }

    /// Number of frames appended since the log was created or compacted
    pub fn frame_count(&self) -> u64 {
        self.writer.lock().frames
    }

    /// Rewrite the log as a single frame holding only live entries.
    ///
    /// Writes go to a sibling temp file that replaces the log by rename, so
    /// a crash mid-compaction leaves the old log intact.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut writer = self.writer.lock();
        let bytes_before = writer.offset;

        let snapshot = {
            let map = self.map.read();
            let mut batch = WriteBatch::with_capacity(map.len());
            for (k, v) in map.iter() {
                batch.put(k.clone(), v.clone());
            }
            batch
        };
        let live_entries = snapshot.len();

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;
        let mut offset = HEADER_SIZE;
        let mut frames = 0;
        if !snapshot.is_empty() {
            let frame = encode_frame(&snapshot)?;
            tmp.write_all(&frame)?;
            offset += frame.len() as u64;
            frames = 1;
        }
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        *writer = LogWriter {
            file,
            offset,
            frames,
        };

        info!(
            path = %self.path.display(),
            bytes_before,
            bytes_after = offset,
            live_entries,
            "compacted log store"
        );
        Ok(CompactionStats {
            bytes_before,
            bytes_after: offset,
            live_entries,
        })
    }
}

impl KvBackend for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(None);
        }
        let map = self.map.read();
        let last = range_of(&map, start, end)
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(last)
    }

    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let map = self.map.read();
        Ok(range_of(&map, start, end)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch, durability: Durability) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(&batch)?;

        let mut writer = self.writer.lock();
        let offset = writer.offset;
        append_frame(&mut writer.file, offset, &frame, durability == Durability::Sync)?;
        writer.offset = offset + frame.len() as u64;
        writer.frames += 1;

        // Publish while still holding the writer so frames and map agree on order.
        let ops: Vec<WriteOp> = batch.into_ops();
        apply_ops(&mut self.map.write(), ops);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best effort: buffered writes should reach disk on a clean shutdown.
        let _ = self.writer.lock().file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::conformance;
    use tempfile::tempdir;

    #[test]
    fn test_file_ranges() {
        let dir = tempdir().unwrap();
        conformance::ranges(&FileStore::create(dir.path().join("log.db")).unwrap());
    }

    #[test]
    fn test_file_batches() {
        let dir = tempdir().unwrap();
        conformance::batch_overwrite_and_delete(
            &FileStore::create(dir.path().join("log.db")).unwrap(),
        );
    }

    #[test]
    fn test_reopen_replays_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        {
            let store = FileStore::create(&path).unwrap();
            store.put(b"a", b"1").unwrap();
            store.put(b"b", b"2").unwrap();
            store.delete(b"a").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.frame_count(), 3);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let good_len = {
            let store = FileStore::create(&path).unwrap();
            store.put(b"kept", b"yes").unwrap();
            let len = store.log_size();
            store.put(b"torn", b"no").unwrap();
            len
        };
        let full_len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full_len - 3).unwrap();
        drop(file);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(store.get(b"torn").unwrap(), None);
        assert_eq!(store.log_size(), good_len);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        // appends continue from the truncated position
        store.put(b"after", b"ok").unwrap();
        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"after").unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_corrupt_frame_fails_open_without_truncating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let first_end = {
            let store = FileStore::create(&path).unwrap();
            store.put(b"v1", b"1").unwrap();
            let end = store.log_size();
            store.put(b"v2", b"2").unwrap();
            store.put(b"v3", b"3").unwrap();
            end
        };
        let original = fs::read(&path).unwrap();
        let mut bytes = original.clone();
        bytes[first_end as usize - 1] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(FileStore::open(&path), Err(Error::Corruption(_))));
        assert_eq!(fs::read(&path).unwrap(), bytes, "a corrupt log must not be rewritten");

        fs::write(&path, &original).unwrap();
        let store = FileStore::open(&path).unwrap();
        for (k, v) in [(b"v1", b"1"), (b"v2", b"2"), (b"v3", b"3")] {
            assert_eq!(store.get(k).unwrap(), Some(v.to_vec()));
        }
    }

    #[test]
    fn test_oversized_length_is_a_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let good_len = {
            let store = FileStore::create(&path).unwrap();
            store.put(b"kept", b"yes").unwrap();
            let len = store.log_size();
            store.put(b"torn", b"no").unwrap();
            len
        };
        let mut bytes = fs::read(&path).unwrap();
        let at = good_len as usize;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &bytes).unwrap();

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"yes".to_vec()));
        assert_eq!(store.get(b"torn").unwrap(), None);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    /// A log file whose sync always fails
    struct FailingSync(File);

    impl Write for FailingSync {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }

    impl Seek for FailingSync {
        fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
            self.0.seek(pos)
        }
    }

    impl LogFile for FailingSync {
        fn set_len(&self, size: u64) -> std::io::Result<()> {
            self.0.set_len(size)
        }

        fn sync_data(&self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "device gone"))
        }
    }

    #[test]
    fn test_failed_sync_leaves_no_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let offset = {
            let store = FileStore::create(&path).unwrap();
            store.put(b"acked", b"1").unwrap();
            store.log_size()
        };

        let mut batch = WriteBatch::new();
        batch.put(b"failed".to_vec(), b"2".to_vec());
        let frame = encode_frame(&batch).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut failing = FailingSync(file);
        assert!(matches!(
            append_frame(&mut failing, offset, &frame, true),
            Err(Error::Io(_))
        ));
        drop(failing);
        assert_eq!(fs::metadata(&path).unwrap().len(), offset);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"acked").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"failed").unwrap(), None);
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.db");
        fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(FileStore::open(&path), Err(Error::InvalidFile(_))));
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");
        let store = FileStore::create(&path).unwrap();
        for i in 0..20u32 {
            store.put(b"hot", &i.to_be_bytes()).unwrap();
        }
        store.put(b"cold", b"c").unwrap();

        let stats = store.compact().unwrap();
        assert_eq!(stats.live_entries, 2);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(store.frame_count(), 1);

        store.put(b"new", b"n").unwrap();
        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(b"hot").unwrap(), Some(19u32.to_be_bytes().to_vec()));
        assert_eq!(store.get(b"cold").unwrap(), Some(b"c".to_vec()));
        assert_eq!(store.get(b"new").unwrap(), Some(b"n".to_vec()));
    }
}
