//! On-disk progress log for resumable downloads.
//!
//! A checkpoint lives next to the local file as `.grc.<name>.trx_status`.
//! It is newline-delimited JSON: one header line followed by any number of
//! range entries.
//!
//! ```text
//! {"path":"/data/a.bin","status_file_path":"/data/.grc.a.bin.trx_status","size":104857600,"threads":4}
//! {"start_offset":0,"length":26214400,"completed_length":8388608}
//! {"start_offset":26214400,"length":26214400,"completed_length":26214400}
//! ```
//!
//! Entries are appended as progress is made. On replay, the entry with the
//! largest `completed_length` for each `start_offset` wins. Each entry marks
//! `[start_offset, start_offset + completed_length)` as present locally, so
//! a resume may split the file differently from the attempt that wrote it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::TransferError;
use crate::types::ByteRange;

const PREFIX: &str = ".grc.";
const SUFFIX: &str = ".trx_status";

/// Returns the checkpoint path for a local file.
///
/// Passing a checkpoint path returns it unchanged.
pub fn checkpoint_path(path: &Path) -> PathBuf {
    if is_checkpoint_path(path) {
        return path.to_path_buf();
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{PREFIX}{name}{SUFFIX}"))
}

/// Returns `true` if `path` names a checkpoint file.
pub fn is_checkpoint_path(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with(PREFIX) && n.ends_with(SUFFIX)
        })
        .unwrap_or(false)
}

/// Progress of one byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub start_offset: i64,
    pub length: i64,
    pub completed_length: i64,
}

impl CheckpointEntry {
    pub fn is_complete(&self) -> bool {
        self.completed_length >= self.length
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    path: String,
    status_file_path: String,
    size: i64,
    threads: usize,
}

/// Replayed state of a checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCheckpoint {
    pub path: String,
    pub status_file_path: String,
    pub size: i64,
    pub threads: usize,
    entries: BTreeMap<i64, CheckpointEntry>,
}

impl TransferCheckpoint {
    /// Creates an empty checkpoint for `path`.
    pub fn new(path: &Path, size: i64, threads: usize) -> Self {
        Self {
            path: path.to_string_lossy().into_owned(),
            status_file_path: checkpoint_path(path).to_string_lossy().into_owned(),
            size,
            threads,
            entries: BTreeMap::new(),
        }
    }

    /// Parses checkpoint file contents.
    ///
    /// Blank lines are skipped; any other line that does not decode is an
    /// error.
    pub fn parse(content: &str) -> Result<Self, TransferError> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());

        let header_line = lines
            .next()
            .ok_or_else(|| TransferError::Checkpoint("missing header".into()))?;
        let header: Header = serde_json::from_str(header_line)
            .map_err(|e| TransferError::Checkpoint(format!("bad header: {e}")))?;

        let mut checkpoint = Self {
            path: header.path,
            status_file_path: header.status_file_path,
            size: header.size,
            threads: header.threads,
            entries: BTreeMap::new(),
        };

        for (n, line) in lines.enumerate() {
            let entry: CheckpointEntry = serde_json::from_str(line)
                .map_err(|e| TransferError::Checkpoint(format!("bad entry {}: {e}", n + 1)))?;
            checkpoint.record(entry);
        }
        Ok(checkpoint)
    }

    /// Loads the checkpoint for `local_path`, if one exists.
    pub fn load(local_path: &Path) -> Result<Option<Self>, TransferError> {
        let status_path = checkpoint_path(local_path);
        match std::fs::read_to_string(&status_path) {
            Ok(content) => Self::parse(&content).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a checkpoint usable for `local_path` of `size` bytes.
    ///
    /// Reuses the one on disk when it belongs to the same file and size;
    /// anything else (missing, unreadable, mismatched) yields a fresh one.
    pub fn get_or_create(local_path: &Path, size: i64, threads: usize) -> Self {
        match Self::load(local_path) {
            Ok(Some(existing)) if existing.validate(local_path, size) => {
                debug!(
                    path = %local_path.display(),
                    entries = existing.entries.len(),
                    "resuming from checkpoint"
                );
                existing
            }
            Ok(Some(_)) => {
                debug!(path = %local_path.display(), "checkpoint does not match, starting over");
                Self::new(local_path, size, threads)
            }
            Ok(None) => Self::new(local_path, size, threads),
            Err(e) => {
                warn!(path = %local_path.display(), error = %e, "unreadable checkpoint, starting over");
                Self::new(local_path, size, threads)
            }
        }
    }

    /// Returns `true` if this checkpoint describes `local_path` at `size`.
    ///
    /// The thread count is not compared.
    pub fn validate(&self, local_path: &Path, size: i64) -> bool {
        self.path == local_path.to_string_lossy()
            && self.status_file_path == checkpoint_path(local_path).to_string_lossy()
            && self.size == size
    }

    /// Merges an entry, keeping the furthest progress per start offset.
    pub fn record(&mut self, entry: CheckpointEntry) {
        self.entries
            .entry(entry.start_offset)
            .and_modify(|e| {
                if entry.completed_length >= e.completed_length {
                    *e = entry;
                }
            })
            .or_insert(entry);
    }

    pub fn entry(&self, start_offset: i64) -> Option<&CheckpointEntry> {
        self.entries.get(&start_offset)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CheckpointEntry> {
        self.entries.values()
    }

    /// Returns `true` if no progress has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|e| e.completed_length <= 0)
    }

    /// Byte ranges known to be present locally, sorted and merged.
    pub fn covered(&self) -> Vec<ByteRange> {
        let mut merged: Vec<ByteRange> = Vec::new();
        for e in self.entries.values() {
            let done = e.completed_length.clamp(0, e.length.max(0));
            if done == 0 {
                continue;
            }
            let span = ByteRange::new(e.start_offset, done);
            match merged.last_mut() {
                Some(last) if span.offset <= last.end() => {
                    last.length = last.length.max(span.end() - last.offset);
                }
                _ => merged.push(span),
            }
        }
        merged
    }

    /// Parts of `range` not yet present locally, in offset order.
    pub fn remaining(&self, range: ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = range.offset;
        for span in self.covered() {
            if span.end() <= cursor {
                continue;
            }
            if span.offset >= range.end() {
                break;
            }
            if span.offset > cursor {
                gaps.push(ByteRange::new(cursor, span.offset - cursor));
            }
            cursor = span.end();
        }
        if cursor < range.end() {
            gaps.push(ByteRange::new(cursor, range.end() - cursor));
        }
        gaps
    }

    /// Bytes of `[start, start + length)` already present locally.
    pub fn completed_for(&self, start_offset: i64, length: i64) -> i64 {
        let range = ByteRange::new(start_offset, length);
        let missing: i64 = self.remaining(range).iter().map(|r| r.length).sum();
        length - missing
    }

    fn header_line(&self) -> Result<Vec<u8>, TransferError> {
        let header = Header {
            path: self.path.clone(),
            status_file_path: self.status_file_path.clone(),
            size: self.size,
            threads: self.threads,
        };
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Append-only writer for a checkpoint file.
///
/// Only one writer per transfer; tasks forward entries to its owner.
pub struct CheckpointWriter {
    file: File,
    path: PathBuf,
}

impl CheckpointWriter {
    /// Recreates the checkpoint file from `checkpoint`.
    ///
    /// The header is written first, followed by every entry already known,
    /// so the file stays a complete log after a restart.
    pub async fn create(checkpoint: &TransferCheckpoint) -> Result<Self, TransferError> {
        let path = PathBuf::from(&checkpoint.status_file_path);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut buf = checkpoint.header_line()?;
        for entry in checkpoint.entries() {
            buf.extend(serde_json::to_vec(entry)?);
            buf.push(b'\n');
        }
        file.write_all(&buf).await?;
        file.flush().await?;

        Ok(Self { file, path })
    }

    /// Appends one entry and flushes it.
    pub async fn append(&mut self, entry: &CheckpointEntry) -> Result<(), TransferError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Closes and deletes the checkpoint file.
    pub async fn remove(self) -> Result<(), TransferError> {
        let Self { file, path } = self;
        drop(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(start: i64, length: i64, completed: i64) -> CheckpointEntry {
        CheckpointEntry {
            start_offset: start,
            length,
            completed_length: completed,
        }
    }

    #[test]
    fn path_derivation() {
        let p = checkpoint_path(Path::new("/data/a.bin"));
        assert_eq!(p, PathBuf::from("/data/.grc.a.bin.trx_status"));
        assert!(is_checkpoint_path(&p));
        assert!(!is_checkpoint_path(Path::new("/data/a.bin")));
    }

    #[test]
    fn path_derivation_is_idempotent() {
        let once = checkpoint_path(Path::new("/data/a.bin"));
        assert_eq!(checkpoint_path(&once), once);
    }

    #[test]
    fn validate() {
        let local = Path::new("/data/a.bin");
        let cp = TransferCheckpoint::new(local, 100, 4);
        assert!(cp.validate(local, 100));
        assert!(!cp.validate(local, 101));
        assert!(!cp.validate(Path::new("/data/b.bin"), 100));
    }

    #[test]
    fn furthest_progress_wins() {
        let mut cp = TransferCheckpoint::new(Path::new("/d/a"), 100, 2);
        cp.record(entry(0, 50, 40));
        cp.record(entry(0, 50, 10));
        cp.record(entry(50, 50, 50));
        assert_eq!(cp.entry(0).unwrap().completed_length, 40);
        assert!(cp.entry(50).unwrap().is_complete());
        assert_eq!(cp.completed_for(0, 50), 40);
    }

    #[test]
    fn progress_carries_over_to_a_different_split() {
        let mut cp = TransferCheckpoint::new(Path::new("/d/a"), 100, 2);
        cp.record(entry(0, 50, 40));
        cp.record(entry(50, 50, 50));

        assert_eq!(cp.covered(), vec![ByteRange::new(0, 40), ByteRange::new(50, 50)]);
        assert_eq!(cp.completed_for(0, 60), 50);
        assert_eq!(cp.completed_for(25, 50), 40);
        assert_eq!(cp.remaining(ByteRange::new(0, 34)), vec![]);
        assert_eq!(cp.remaining(ByteRange::new(34, 33)), vec![ByteRange::new(40, 10)]);
        assert_eq!(cp.remaining(ByteRange::new(67, 33)), vec![]);
    }

    #[test]
    fn overlapping_entries_merge() {
        let mut cp = TransferCheckpoint::new(Path::new("/d/a"), 100, 4);
        cp.record(entry(0, 30, 30));
        cp.record(entry(10, 60, 25));
        cp.record(entry(80, 20, 0));

        assert_eq!(cp.covered(), vec![ByteRange::new(0, 35)]);
        assert_eq!(
            cp.remaining(ByteRange::new(0, 100)),
            vec![ByteRange::new(35, 65)]
        );
        assert!(!cp.is_empty());
        assert!(TransferCheckpoint::new(Path::new("/d/a"), 100, 4).is_empty());
    }

    #[test]
    fn parse_rejects_malformed_entry() {
        let content = concat!(
            r#"{"path":"/d/a","status_file_path":"/d/.grc.a.trx_status","size":10,"threads":1}"#,
            "\n",
            "not json\n"
        );
        let err = TransferCheckpoint::parse(content).unwrap_err();
        assert!(matches!(err, TransferError::Checkpoint(_)));
    }

    #[test]
    fn parse_rejects_empty_file() {
        assert!(TransferCheckpoint::parse("").is_err());
    }

    #[tokio::test]
    async fn write_then_load_regardless_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("obj.bin");

        let cp = TransferCheckpoint::new(&local, 300, 3);
        let mut writer = CheckpointWriter::create(&cp).await.unwrap();
        writer.append(&entry(200, 100, 100)).await.unwrap();
        writer.append(&entry(0, 100, 30)).await.unwrap();
        writer.append(&entry(100, 100, 70)).await.unwrap();
        writer.append(&entry(0, 100, 60)).await.unwrap();

        let loaded = TransferCheckpoint::load(&local).unwrap().unwrap();
        assert!(loaded.validate(&local, 300));
        assert_eq!(loaded.threads, 3);
        let got: Vec<_> = loaded.entries().copied().collect();
        assert_eq!(
            got,
            vec![entry(0, 100, 60), entry(100, 100, 70), entry(200, 100, 100)]
        );
    }

    #[tokio::test]
    async fn create_reappends_known_entries() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("obj.bin");

        let mut cp = TransferCheckpoint::new(&local, 200, 2);
        cp.record(entry(0, 100, 100));
        CheckpointWriter::create(&cp).await.unwrap();

        let loaded = TransferCheckpoint::load(&local).unwrap().unwrap();
        assert_eq!(loaded, cp);
    }

    #[tokio::test]
    async fn get_or_create_fresh_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("obj.bin");

        let mut cp = TransferCheckpoint::new(&local, 200, 2);
        cp.record(entry(0, 100, 100));
        CheckpointWriter::create(&cp).await.unwrap();

        let same = TransferCheckpoint::get_or_create(&local, 200, 4);
        assert_eq!(same.entries().count(), 1);

        let other = TransferCheckpoint::get_or_create(&local, 999, 4);
        assert_eq!(other.entries().count(), 0);
        assert_eq!(other.size, 999);
    }

    #[test]
    fn get_or_create_fresh_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("obj.bin");
        std::fs::write(checkpoint_path(&local), "garbage").unwrap();

        let cp = TransferCheckpoint::get_or_create(&local, 10, 1);
        assert_eq!(cp.entries().count(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("obj.bin");
        let writer = CheckpointWriter::create(&TransferCheckpoint::new(&local, 1, 1))
            .await
            .unwrap();
        let path = writer.path().to_path_buf();
        assert!(path.exists());
        writer.remove().await.unwrap();
        assert!(!path.exists());
        assert!(TransferCheckpoint::load(&local).unwrap().is_none());
    }
}
