use super::{Engine, Status};
use crate::error::{Error, Result};

use fs4::FileExt as _;
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read as _, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;

/// A very simple variant of BitCask, itself a very simple log-structured
/// key/value engine. It is used for the Raft log, which is mostly appended
/// to and read sequentially, with prefix deletes when the log is compacted.
///
/// BitCask writes key/value pairs to an append-only log file, and keeps a
/// mapping of keys to file positions in memory (the keydir). All live keys
/// must fit in memory. Deletes write a tombstone value to the log file. To
/// remove old garbage, logs can be compacted by writing new logs containing
/// only live data, skipping replaced values and tombstones.
///
/// This implementation makes several simplifications over standard BitCask:
///
/// - Instead of writing multiple fixed-size log files, it uses a single
///   append-only log file of arbitrary size. This increases the compaction
///   volume, since the entire log file must be rewritten on every compaction.
///
/// - Hint files are not used, the keydir is rebuilt by scanning the log on
///   startup. The Raft log is regularly truncated, so it stays small.
///
/// The log file format is:
///
/// - Checksum as big-endian u32: CRC32 of the rest of the record.
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
///
/// A torn record at the end of the file (e.g. after a crash during a write)
/// is truncated on startup. A checksum mismatch anywhere else is a corrupt
/// log, and opening the engine fails with Error::LogInconsistency.
pub struct BitCask {
    /// The active append-only log file.
    log: Log,
    /// Maps keys to a value position and length in the log file.
    keydir: KeyDir,
}

/// Maps keys to a value position and length in the log file.
type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

/// The size of a record header: checksum, key length, and value length.
const HEADER_SIZE: u64 = 12;

impl BitCask {
    /// Opens or creates a BitCask database in the given file.
    pub fn new(path: PathBuf) -> Result<Self> {
        info!("Opening log storage {}", path.display());
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        info!("Indexed {} live keys in {}", keydir.len(), log.path.display());
        Ok(Self { log, keydir })
    }

    /// Opens a BitCask database, and automatically compacts it if the amount
    /// of garbage exceeds the given ratio and byte size when opened.
    pub fn new_compact(path: PathBuf, garbage_min_fraction: f64, garbage_min_bytes: u64) -> Result<Self> {
        let mut s = Self::new(path)?;

        let status = s.status()?;
        if status.garbage_disk_size > 0
            && status.garbage_disk_size >= garbage_min_bytes
            && status.garbage_disk_percent() / 100.0 >= garbage_min_fraction
        {
            info!(
                "Compacting {} to remove {:.0}% garbage ({} MB out of {} MB)",
                s.log.path.display(),
                status.garbage_disk_percent(),
                status.garbage_disk_size / 1024 / 1024,
                status.total_disk_size / 1024 / 1024
            );
            s.compact()?;
            info!(
                "Compacted {} to size {} MB",
                s.log.path.display(),
                (status.total_disk_size - status.garbage_disk_size) / 1024 / 1024
            );
        }

        Ok(s)
    }

    /// Compacts the current log file by writing out a new log file containing
    /// only live keys and replacing the current file with it.
    pub fn compact(&mut self) -> Result<()> {
        let mut tmp_path = self.log.path.clone();
        tmp_path.set_extension("new");
        let (mut new_log, new_keydir) = self.write_log(tmp_path)?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    /// Writes out a new log file with the live entries of the current log
    /// file and returns it along with its keydir. Entries are written in key
    /// order.
    fn write_log(&mut self, path: PathBuf) -> Result<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?; // truncate file if it exists
        new_log.len = 0;
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }
        new_log.file.sync_all()?;
        Ok((new_log, new_keydir))
    }
}

impl Engine for BitCask {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        // Keys that aren't in the keydir have no live record to shadow.
        if self.keydir.remove(key).is_some() {
            self.log.write_entry(key, None)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(self.log.file.sync_all()?)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some((value_pos, value_len)) => Ok(Some(self.log.read_value(*value_pos, *value_len)?)),
            None => Ok(None),
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { inner: self.keydir.range(range), log: &mut self.log }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let (pos, len) = self.log.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir.insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .fold(0, |size, (key, (_, value_len))| size + key.len() as u64 + *value_len as u64);
        let total_disk_size = self.log.file.metadata()?.len();
        let live_disk_size = size + HEADER_SIZE * keys;
        let garbage_disk_size = total_disk_size.saturating_sub(live_disk_size);
        Ok(Status {
            name: "bitcask".to_string(),
            keys,
            size,
            total_disk_size,
            live_disk_size,
            garbage_disk_size,
        })
    }
}

/// Attempt to flush the file when the database is closed.
impl Drop for BitCask {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            error!("failed to flush file: {}", error)
        }
    }
}

pub struct ScanIterator<'a> {
    inner: std::collections::btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    log: &'a mut Log,
}

impl ScanIterator<'_> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), self.log.read_value(*value_pos, *value_len)?))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

/// A BitCask append-only log file, containing a sequence of checksummed
/// key/value records.
struct Log {
    /// Path to the log file.
    path: PathBuf,
    /// The opened file containing the log.
    file: File,
    /// The current length of the file, i.e. the next write position.
    len: u64,
}

impl Log {
    /// Opens a log file, or creates one if it does not exist. Takes out an
    /// exclusive lock on the file, failing if another process holds it.
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;
        let len = file.metadata()?.len();
        Ok(Self { path, file, len })
    }

    /// Builds a keydir by scanning the log file. A torn record at the end of
    /// the file is truncated, other checksum mismatches are errors.
    fn build_keydir(&mut self) -> Result<KeyDir> {
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&mut self.file);
        let mut pos = reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        let mut torn = false;

        while pos < file_len {
            if file_len - pos < HEADER_SIZE {
                torn = true;
                break;
            }
            reader.read_exact(&mut header)?;
            let checksum = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let key_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let value_len = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
            let body_len = key_len as u64 + value_len.max(0) as u64;
            if pos + HEADER_SIZE + body_len > file_len {
                torn = true;
                break;
            }

            let mut body = vec![0; body_len as usize];
            reader.read_exact(&mut body)?;
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header[4..]);
            hasher.update(&body);
            if hasher.finalize() != checksum {
                return Err(Error::LogInconsistency(format!(
                    "checksum mismatch at offset {pos} in {}",
                    self.path.display()
                )));
            }

            body.truncate(key_len as usize);
            let key = body;
            if value_len >= 0 {
                let value_pos = pos + HEADER_SIZE + key_len as u64;
                keydir.insert(key, (value_pos, value_len as u32));
            } else {
                keydir.remove(&key);
            }
            pos += HEADER_SIZE + body_len;
        }
        drop(reader);

        if torn {
            warn!("Found incomplete record at offset {pos} in {}, truncating", self.path.display());
            self.file.set_len(pos)?;
        }
        self.len = pos;
        Ok(keydir)
    }

    /// Reads a value from the log file.
    fn read_value(&mut self, value_pos: u64, value_len: u32) -> Result<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends a key/value record to the log file, using a None value for
    /// tombstones. It returns the position and length of the record.
    fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(u64, u32)> {
        let key_len = u32::try_from(key.len())?;
        let value_len = match value {
            Some(value) => i32::try_from(value.len())?,
            None => -1,
        };
        let len = HEADER_SIZE as usize + key.len() + value.map_or(0, |v| v.len());

        let mut record = Vec::with_capacity(len);
        record.extend_from_slice(&[0; 4]);
        record.extend_from_slice(&key_len.to_be_bytes());
        record.extend_from_slice(&value_len.to_be_bytes());
        record.extend_from_slice(key);
        if let Some(value) = value {
            record.extend_from_slice(value);
        }
        let checksum = crc32fast::hash(&record[4..]);
        record[0..4].copy_from_slice(&checksum.to_be_bytes());

        let pos = self.len;
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(&record)?;
        self.len += record.len() as u64;
        Ok((pos, record.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::test::test_engine;
    use super::*;

    test_engine!({
        let dir = tempfile::TempDir::with_prefix("agency")?;
        BitCask::new(dir.path().join("bitcask"))?
    });

    /// Writes a few keys, including a replaced value and a tombstone.
    fn setup(path: PathBuf) -> Result<BitCask> {
        let mut s = BitCask::new(path)?;
        s.set(b"a", vec![1])?;
        s.set(b"b", vec![2])?;
        s.set(b"c", vec![3])?;
        s.set(b"b", vec![4])?;
        s.delete(b"c")?;
        s.flush()?;
        Ok(s)
    }

    fn dump(s: &mut BitCask) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        s.scan(..).collect()
    }

    #[test]
    /// A file can only be opened once at a time.
    fn exclusive() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        let s = BitCask::new(path.clone())?;
        assert!(matches!(BitCask::new(path.clone()), Err(Error::IO(_))));
        drop(s);
        BitCask::new(path)?;
        Ok(())
    }

    #[test]
    /// Data survives reopening the file.
    fn reopen() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        let mut s = setup(path.clone())?;
        let expect = dump(&mut s)?;
        assert_eq!(expect, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![4])]);
        drop(s);

        let mut s = BitCask::new(path)?;
        assert_eq!(dump(&mut s)?, expect);
        Ok(())
    }

    #[test]
    /// Garbage is accounted for, and compaction removes it.
    fn compact() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        let mut s = setup(path.clone())?;
        let expect = dump(&mut s)?;

        let status = s.status()?;
        assert_eq!(status.keys, 2);
        assert_eq!(status.live_disk_size, 2 * (HEADER_SIZE + 2));
        assert!(status.garbage_disk_size > 0);

        s.compact()?;
        let status = s.status()?;
        assert_eq!(status.garbage_disk_size, 0);
        assert_eq!(status.total_disk_size, 2 * (HEADER_SIZE + 2));
        assert_eq!(dump(&mut s)?, expect);

        // Writes after compaction land in the new file.
        s.set(b"d", vec![5])?;
        drop(s);
        let mut s = BitCask::new(path)?;
        assert_eq!(s.get(b"d")?, Some(vec![5]));
        assert_eq!(s.get(b"b")?, Some(vec![4]));
        Ok(())
    }

    #[test]
    /// new_compact() only compacts past the garbage thresholds.
    fn new_compact() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        drop(setup(path.clone())?);

        let mut s = BitCask::new_compact(path.clone(), 0.99, 0)?;
        assert!(s.status()?.garbage_disk_size > 0);
        drop(s);

        let mut s = BitCask::new_compact(path, 0.2, 0)?;
        assert_eq!(s.status()?.garbage_disk_size, 0);
        Ok(())
    }

    #[test]
    /// A partially written trailing record is truncated on open.
    fn torn_write() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        drop(setup(path.clone())?);

        let len = std::fs::metadata(&path)?.len();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0, 1, 2, 3, 0, 0, 0, 9])?;
        drop(file);

        let mut s = BitCask::new(path.clone())?;
        assert_eq!(dump(&mut s)?, vec![(b"a".to_vec(), vec![1]), (b"b".to_vec(), vec![4])]);
        assert_eq!(std::fs::metadata(&path)?.len(), len);
        Ok(())
    }

    #[test]
    /// A corrupt record fails opening the engine.
    fn corruption() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("agency")?;
        let path = dir.path().join("bitcask");
        drop(setup(path.clone())?);

        // Flip the value byte of the first record.
        let mut bytes = std::fs::read(&path)?;
        bytes[HEADER_SIZE as usize + 1] ^= 0xff;
        std::fs::write(&path, bytes)?;

        assert!(matches!(BitCask::new(path), Err(Error::LogInconsistency(_))));
        Ok(())
    }
}
