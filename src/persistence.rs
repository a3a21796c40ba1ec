//! Durable backend: an in-memory index replayed from an append-only log.
//!
//! Every mutation is appended to the log before it becomes visible. Frames
//! are `[tag: u8][len: u32][payload]`; a put carries a bincode record, a
//! delete carries the raw identifier. On open the log is replayed into
//! memory and a torn trailing frame is cut off. Once the log grows past the
//! configured threshold it is compacted to one put per live entry.

use crate::error::{GeoFireError, Result};
use crate::geohash::HashRange;
use crate::spatial::Location;
use crate::storage::{
    ChangeCallback, Entry, LocationBackend, MemoryBackend, StorageStats, SubscriptionId,
};
use crate::types::{Config, SyncPolicy};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind as IoErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const TAG_PUT: u8 = 0;
const TAG_DELETE: u8 = 1;
const HEADER_LEN: u64 = 5;

#[derive(Debug, Serialize, Deserialize)]
struct PutRecord {
    id: String,
    latitude: f64,
    longitude: f64,
    /// JSON text; the payload is schemaless
    data: Option<String>,
}

/// A decoded log frame.
#[derive(Debug)]
enum LogCommand {
    Put(PutRecord),
    Delete(String),
}

impl LogCommand {
    fn put(entry: &Entry) -> Result<Self> {
        Ok(LogCommand::Put(PutRecord {
            id: entry.id.clone(),
            latitude: entry.location.latitude(),
            longitude: entry.location.longitude(),
            data: entry.data.as_ref().map(serde_json::to_string).transpose()?,
        }))
    }

    fn encode(&self) -> Result<BytesMut> {
        let (tag, payload) = match self {
            LogCommand::Put(record) => (TAG_PUT, bincode::serialize(record)?),
            LogCommand::Delete(id) => (TAG_DELETE, id.as_bytes().to_vec()),
        };
        let mut buf = BytesMut::with_capacity(HEADER_LEN as usize + payload.len());
        buf.put_u8(tag);
        buf.put_u32(payload.len() as u32);
        buf.put(payload.as_slice());
        Ok(buf)
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        match tag {
            TAG_PUT => Ok(LogCommand::Put(bincode::deserialize(payload)?)),
            TAG_DELETE => String::from_utf8(payload.to_vec())
                .map(LogCommand::Delete)
                .map_err(|e| GeoFireError::Serialization(format!("delete frame: {}", e))),
            other => Err(GeoFireError::Serialization(format!(
                "unknown log frame tag {}",
                other
            ))),
        }
    }
}

fn read_frame(reader: &mut impl Read) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN as usize];
    match reader.read_exact(&mut header[..1]) {
        Ok(()) => {}
        Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    reader.read_exact(&mut header[1..])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some((header[0], payload)))
}

struct AofLog {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    size: u64,
    last_rewrite_size: u64,
    sync_policy: SyncPolicy,
    rewrite_size_threshold: u64,
}

impl AofLog {
    fn open(path: &Path, config: &Config) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let size = file.metadata()?.len();
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path: path.to_path_buf(),
            size,
            last_rewrite_size: size,
            sync_policy: config.sync_policy,
            rewrite_size_threshold: config.rewrite_size_threshold,
        })
    }

    /// Replay every complete frame into `memory`, truncating a torn tail.
    fn replay(&mut self, memory: &MemoryBackend, precision: usize) -> Result<usize> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);
        let mut offset = 0u64;
        let mut applied = 0;
        loop {
            let (tag, payload) = match read_frame(&mut reader) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if e.kind() == IoErrorKind::UnexpectedEof => {
                    warn!(
                        "[AofBackend] torn frame at offset {} in {}, truncating",
                        offset,
                        self.path.display()
                    );
                    self.file.set_len(offset)?;
                    self.size = offset;
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            offset += HEADER_LEN + payload.len() as u64;
            match LogCommand::decode(tag, &payload)? {
                LogCommand::Put(record) => {
                    let location = Location::new(record.latitude, record.longitude)?;
                    let data: Option<serde_json::Value> = record
                        .data
                        .as_deref()
                        .map(serde_json::from_str)
                        .transpose()?;
                    memory.load(Entry::new(record.id, location, precision)?.with_data(data))?;
                }
                LogCommand::Delete(id) => memory.unload(&id)?,
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn append(&mut self, command: &LogCommand) -> Result<()> {
        let frame = command.encode()?;
        self.writer.write_all(&frame)?;
        self.size += frame.len() as u64;
        match self.sync_policy {
            SyncPolicy::Always => self.sync(),
            SyncPolicy::Never => {
                self.writer.flush()?;
                Ok(())
            }
        }
    }

    fn should_rewrite(&self) -> bool {
        self.size >= self
            .rewrite_size_threshold
            .max(self.last_rewrite_size.saturating_mul(2))
    }

    /// Replace the log with one put per live entry.
    fn rewrite(&mut self, entries: &[Entry]) -> Result<()> {
        self.writer.flush()?;
        let rewrite_path = self.path.with_extension("aof.rewrite");
        let rewritten = File::create(&rewrite_path)?;
        let mut writer = BufWriter::new(&rewritten);
        for entry in entries {
            writer.write_all(&LogCommand::put(entry)?.encode()?)?;
        }
        writer.flush()?;
        drop(writer);
        rewritten.sync_all()?;

        std::fs::rename(&rewrite_path, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)?;
        let size = file.metadata()?.len();
        info!(
            "[AofBackend] compacted {} from {} to {} bytes",
            self.path.display(),
            self.size,
            size
        );
        self.writer = BufWriter::new(file.try_clone()?);
        self.file = file;
        self.size = size;
        self.last_rewrite_size = size;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

impl Drop for AofLog {
    fn drop(&mut self) {
        // Best effort flush on drop, ignore errors
        let _ = self.writer.flush();
    }
}

/// Durable [`LocationBackend`] persisting to an append-only file.
pub struct AofBackend {
    memory: MemoryBackend,
    log: Mutex<AofLog>,
}

impl AofBackend {
    /// Open (or create) the log at `path` and replay it.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        config.validate()?;
        let memory = MemoryBackend::new();
        let mut log = AofLog::open(path.as_ref(), config)?;
        let applied = log.replay(&memory, config.precision)?;
        info!(
            "[AofBackend] opened {} ({} frames, {} entries)",
            path.as_ref().display(),
            applied,
            memory.len()?
        );
        Ok(Self {
            memory,
            log: Mutex::new(log),
        })
    }

    pub fn path(&self) -> Result<PathBuf> {
        Ok(self.lock_log()?.path.clone())
    }

    /// Current log size in bytes.
    pub fn log_size(&self) -> Result<u64> {
        Ok(self.lock_log()?.size)
    }

    /// Compact the log now, regardless of its size.
    pub fn compact(&self) -> Result<()> {
        let mut log = self.lock_log()?;
        let entries = self.memory.entries()?;
        log.rewrite(&entries)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        self.memory.stats()
    }

    fn lock_log(&self) -> Result<MutexGuard<'_, AofLog>> {
        self.log
            .lock()
            .map_err(|_| GeoFireError::Lock("Failed to acquire log lock".to_string()))
    }

    fn maybe_compact(&self, log: &mut AofLog) -> Result<()> {
        if log.should_rewrite() {
            debug!("[AofBackend] log at {} bytes, compacting", log.size);
            let entries = self.memory.entries()?;
            log.rewrite(&entries)?;
        }
        Ok(())
    }
}

impl LocationBackend for AofBackend {
    fn put(&self, entry: Entry) -> Result<()> {
        // The log lock orders mutations, so it is held through notification.
        let mut log = self.lock_log()?;
        log.append(&LogCommand::put(&entry)?)?;
        self.memory.put_ordered(entry)?;
        self.maybe_compact(&mut log)
    }

    fn delete(&self, id: &str) -> Result<Option<Entry>> {
        let mut log = self.lock_log()?;
        if self.memory.get(id)?.is_none() {
            return Ok(None);
        }
        log.append(&LogCommand::Delete(id.to_string()))?;
        let removed = self.memory.delete_ordered(id)?;
        self.maybe_compact(&mut log)?;
        Ok(removed)
    }

    fn get(&self, id: &str) -> Result<Option<Entry>> {
        self.memory.get(id)
    }

    fn scan_prefix_range(&self, range: &HashRange) -> Result<Vec<Entry>> {
        self.memory.scan_prefix_range(range)
    }

    fn watch_prefix_range(
        &self,
        range: HashRange,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionId> {
        self.memory.watch_prefix_range(range, on_change)
    }

    fn unwatch(&self, subscription: SubscriptionId) -> Result<bool> {
        self.memory.unwatch(subscription)
    }

    fn len(&self) -> Result<usize> {
        self.memory.len()
    }

    fn sync(&self) -> Result<()> {
        self.lock_log()?.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entry(id: &str, lat: f64, lon: f64) -> Entry {
        Entry::new(id, Location::new(lat, lon).unwrap(), 10).unwrap()
    }

    #[test]
    fn test_replay_restores_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locations.aof");
        let config = Config::default();

        {
            let backend = AofBackend::open(&path, &config).unwrap();
            backend
                .put(entry("a", 1.0, 2.0).with_data(Some(json!({"k": [1, 2]}))))
                .unwrap();
            backend.put(entry("b", 3.0, 4.0)).unwrap();
            backend.put(entry("b", 5.0, 6.0)).unwrap();
            backend.delete("a").unwrap();
            assert!(backend.delete("missing").unwrap().is_none());
        }

        let backend = AofBackend::open(&path, &config).unwrap();
        assert_eq!(backend.len().unwrap(), 1);
        let b = backend.get("b").unwrap().unwrap();
        assert_eq!(b.location, Location::new(5.0, 6.0).unwrap());
        assert!(backend.get("a").unwrap().is_none());
    }

    #[test]
    fn test_payload_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locations.aof");
        let config = Config::default().with_sync_policy(SyncPolicy::Never);
        {
            let backend = AofBackend::open(&path, &config).unwrap();
            backend
                .put(entry("a", 1.0, 2.0).with_data(Some(json!({"name": "cab", "seats": 4}))))
                .unwrap();
        }
        let backend = AofBackend::open(&path, &config).unwrap();
        assert_eq!(
            backend.get("a").unwrap().unwrap().data,
            Some(json!({"name": "cab", "seats": 4}))
        );
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locations.aof");
        let config = Config::default();
        {
            let backend = AofBackend::open(&path, &config).unwrap();
            backend.put(entry("a", 1.0, 2.0)).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[TAG_PUT, 0, 0, 0, 40, 1, 2]).unwrap();
        }

        let backend = AofBackend::open(&path, &config).unwrap();
        assert_eq!(backend.len().unwrap(), 1);
        assert_eq!(backend.log_size().unwrap(), intact);
        backend.put(entry("b", 1.0, 2.0)).unwrap();
        drop(backend);

        let backend = AofBackend::open(&path, &config).unwrap();
        assert_eq!(backend.len().unwrap(), 2);
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locations.aof");
        let config = Config::default().with_rewrite_size_threshold(512);

        {
            let backend = AofBackend::open(&path, &config).unwrap();
            for i in 0..200 {
                backend
                    .put(entry("mover", (i % 80) as f64, (i % 170) as f64))
                    .unwrap();
            }
            backend.put(entry("still", 10.0, 10.0)).unwrap();
            // 200 frames would be several kilobytes uncompacted
            assert!(backend.log_size().unwrap() < 2048);
            backend.compact().unwrap();
        }

        let backend = AofBackend::open(&path, &config).unwrap();
        assert_eq!(backend.len().unwrap(), 2);
        assert_eq!(
            backend.get("mover").unwrap().unwrap().location,
            Location::new(39.0, 29.0).unwrap()
        );
        assert!(!path.with_extension("aof.rewrite").exists());
    }
}
