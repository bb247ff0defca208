//! File-based storage implementation
//!
//! Stores state in four files within a directory:
//! - `term` - current term (u64) with checksum
//! - `vote` - voted-for member id with checksum
//! - `log` - retained log entries (JSON lines, each line checksummed)
//! - `snapshot` - most recent snapshot (JSON with checksum)
//!
//! Checksums detect corruption from partial writes; log rewrites (truncate,
//! compact) go through a temp-file-and-rename so a crash mid-rewrite leaves
//! the previous file intact.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::{Storage, StorageError};
use crate::cluster::MemberId;
use crate::core::replica::LogEntry;
use crate::core::snapshot::Snapshot;

/// Simple CRC32 checksum (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory, creating the
    /// directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(FileStorage { dir })
    }

    fn term_path(&self) -> PathBuf {
        self.dir.join("term")
    }

    fn vote_path(&self) -> PathBuf {
        self.dir.join("vote")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Write data with checksum: "{data} {crc32_hex}\n"
    fn write_with_checksum(&self, path: &Path, data: &str) -> Result<(), StorageError> {
        let checksum = crc32(data.as_bytes());
        let content = format!("{} {:08x}\n", data, checksum);

        let mut file = File::create(path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(content.as_bytes())
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    /// Read and verify checksum, returning the data portion.
    fn read_with_checksum(&self, path: &Path) -> Result<Option<String>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path).map_err(|e| StorageError::Io(e.to_string()))?;
        let content = content.trim();

        if content.is_empty() {
            return Ok(None);
        }

        let parts: Vec<&str> = content.rsplitn(2, ' ').collect();
        if parts.len() != 2 {
            return Err(StorageError::Corruption(format!(
                "invalid format in {:?}: missing checksum",
                path
            )));
        }

        let checksum_str = parts[0];
        let data = parts[1];

        let stored_checksum = u32::from_str_radix(checksum_str, 16).map_err(|_| {
            StorageError::Corruption(format!("invalid checksum format in {:?}", path))
        })?;

        let computed_checksum = crc32(data.as_bytes());
        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
                path, stored_checksum, computed_checksum
            )));
        }

        Ok(Some(data.to_string()))
    }

    /// Atomically replace a file (write to temp, fsync, rename).
    fn atomic_write(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path).map_err(|e| StorageError::Io(e.to_string()))?;
        file.write_all(data)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        fs::rename(&temp_path, path).map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn encode_log(&self, entries: &[LogEntry]) -> Result<String, StorageError> {
        let mut content = String::new();
        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            content.push_str(&format!("{} {:08x}\n", json, checksum));
        }
        Ok(content)
    }
}

impl Storage for FileStorage {
    fn load_term(&self) -> Result<u64, StorageError> {
        match self.read_with_checksum(&self.term_path())? {
            None => Ok(0),
            Some(data) => data
                .parse()
                .map_err(|e| StorageError::Corruption(format!("invalid term: {}", e))),
        }
    }

    fn save_term(&mut self, term: u64) -> Result<(), StorageError> {
        self.write_with_checksum(&self.term_path(), &term.to_string())
    }

    fn load_vote(&self) -> Result<Option<MemberId>, StorageError> {
        match self.read_with_checksum(&self.vote_path())? {
            None => Ok(None),
            Some(data) if data == "none" => Ok(None),
            Some(data) => {
                let id = data
                    .parse()
                    .map_err(|e| StorageError::Corruption(format!("invalid vote: {}", e)))?;
                Ok(Some(id))
            }
        }
    }

    fn save_vote(&mut self, vote: Option<MemberId>) -> Result<(), StorageError> {
        let data = match vote {
            Some(id) => id.to_string(),
            None => "none".to_string(),
        };
        self.write_with_checksum(&self.vote_path(), &data)
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path).map_err(|e| StorageError::Io(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| StorageError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }

            // Each line: "{json} {checksum}"
            let parts: Vec<&str> = line.rsplitn(2, ' ').collect();
            if parts.len() != 2 {
                return Err(StorageError::Corruption(format!(
                    "invalid log format at line {}: missing checksum",
                    line_num + 1
                )));
            }

            let checksum_str = parts[0];
            let json = parts[1];

            let stored_checksum = u32::from_str_radix(checksum_str, 16).map_err(|_| {
                StorageError::Corruption(format!("invalid checksum format at line {}", line_num + 1))
            })?;

            let computed_checksum = crc32(json.as_bytes());
            if stored_checksum != computed_checksum {
                return Err(StorageError::Corruption(format!(
                    "checksum mismatch at line {}: stored {:08x}, computed {:08x}",
                    line_num + 1,
                    stored_checksum,
                    computed_checksum
                )));
            }

            let entry: LogEntry = serde_json::from_str(json).map_err(|e| {
                StorageError::Corruption(format!("invalid log entry at line {}: {}", line_num + 1, e))
            })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let path = self.log_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        for entry in entries {
            let json = serde_json::to_string(entry)
                .map_err(|e| StorageError::Io(format!("serialization error: {}", e)))?;
            let checksum = crc32(json.as_bytes());
            writeln!(file, "{} {:08x}", json, checksum)
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }

        file.sync_all().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn truncate_after(&mut self, index: u64) -> Result<(), StorageError> {
        let entries = self.load_entries()?;
        let keep: Vec<_> = entries.into_iter().filter(|e| e.index <= index).collect();
        let content = self.encode_log(&keep)?;
        self.atomic_write(&self.log_path(), content.as_bytes())
    }

    fn compact_before(&mut self, index: u64, snapshot: &Snapshot) -> Result<(), StorageError> {
        // Snapshot first: a crash between the two writes leaves a snapshot
        // that covers more than the log dropped, which recovery tolerates.
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Io(format!("snapshot serialization error: {}", e)))?;
        self.write_with_checksum(&self.snapshot_path(), &json)?;

        let entries = self.load_entries()?;
        let keep: Vec<_> = entries.into_iter().filter(|e| e.index > index).collect();
        let content = self.encode_log(&keep)?;
        self.atomic_write(&self.log_path(), content.as_bytes())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.read_with_checksum(&self.snapshot_path())? {
            None => Ok(None),
            Some(json) => {
                let snapshot: Snapshot = serde_json::from_str(&json)
                    .map_err(|e| StorageError::Corruption(format!("invalid snapshot: {}", e)))?;
                Ok(Some(snapshot))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterConfig, MemberConfig};
    use crate::core::replica::EntryPayload;
    use crate::core::snapshot::SnapshotMeta;
    use crate::state_machine::Command;
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (storage, dir)
    }

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            payload: EntryPayload::Command(Command::new("set", ["x", "1"])),
        }
    }

    fn snapshot(last_index: u64, last_term: u64) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_included_index: last_index,
                last_included_term: last_term,
                config: ClusterConfig::new([MemberConfig::new(1, "127.0.0.1:8001")]),
            },
            data: vec![10, 20, 30],
        }
    }

    #[test]
    fn test_term_round_trip() {
        let (mut storage, _dir) = test_storage();

        assert_eq!(storage.load_term().unwrap(), 0);

        storage.save_term(5).unwrap();
        assert_eq!(storage.load_term().unwrap(), 5);

        storage.save_term(100).unwrap();
        assert_eq!(storage.load_term().unwrap(), 100);
    }

    #[test]
    fn test_vote_round_trip() {
        let (mut storage, _dir) = test_storage();

        assert_eq!(storage.load_vote().unwrap(), None);

        storage.save_vote(Some(3)).unwrap();
        assert_eq!(storage.load_vote().unwrap(), Some(3));

        storage.save_vote(None).unwrap();
        assert_eq!(storage.load_vote().unwrap(), None);
    }

    #[test]
    fn test_log_append_and_load() {
        let (mut storage, _dir) = test_storage();

        assert!(storage.load_entries().unwrap().is_empty());

        storage.append_entries(&[entry(1, 1), entry(2, 1)]).unwrap();

        let loaded = storage.load_entries().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].index, 1);
        assert_eq!(loaded[1].index, 2);
    }

    #[test]
    fn test_truncate_after() {
        let (mut storage, _dir) = test_storage();

        storage
            .append_entries(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();

        storage.truncate_after(1).unwrap();

        let loaded = storage.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].index, 1);
    }

    #[test]
    fn test_compact_before() {
        let (mut storage, _dir) = test_storage();

        storage
            .append_entries(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();

        storage.compact_before(2, &snapshot(2, 1)).unwrap();

        let loaded = storage.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].index, 3);

        let snap = storage.load_snapshot().unwrap().unwrap();
        assert_eq!(snap.meta.last_included_index, 2);
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();

        // First instance - write data
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term(42).unwrap();
            storage.save_vote(Some(7)).unwrap();
            storage.append_entries(&[entry(1, 42)]).unwrap();
        }

        // Second instance - read data (simulates restart)
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.load_term().unwrap(), 42);
            assert_eq!(storage.load_vote().unwrap(), Some(7));
            let log = storage.load_entries().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].index, 1);
        }
    }

    #[test]
    fn test_detects_corrupted_term() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term(42).unwrap();

        // Corrupt the file by modifying data but not checksum
        fs::write(dir.path().join("term"), "99 12345678\n").unwrap();

        let result = storage.load_term();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_detects_corrupted_log_entry() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[entry(1, 1)]).unwrap();

        // Corrupt by appending a line with a bogus checksum
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("log"))
            .unwrap();
        writeln!(file, "{{\"index\":2,\"term\":2,\"payload\":\"Noop\"}} deadbeef").unwrap();

        let result = storage.load_entries();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_detects_corrupted_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.compact_before(2, &snapshot(2, 1)).unwrap();

        fs::write(dir.path().join("snapshot"), "{\"bad\":\"data\"} 12345678\n").unwrap();

        let result = storage.load_snapshot();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_snapshot_persistence_across_instances() {
        let dir = TempDir::new().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.compact_before(100, &snapshot(100, 5)).unwrap();
        }

        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let loaded = storage.load_snapshot().unwrap().unwrap();
            assert_eq!(loaded.meta.last_included_index, 100);
            assert_eq!(loaded.meta.last_included_term, 5);
            assert_eq!(loaded.data, vec![10, 20, 30]);
        }
    }

    #[test]
    fn test_crc32_basic() {
        // Test vector: "123456789" should have CRC32 = 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }
}
