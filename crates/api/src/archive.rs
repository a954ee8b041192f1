//! The archive-writer boundary and two writers: in memory and on disk.
//!
//! Both enforce the archive ceiling the same way. A record that does not fit
//! is dropped unless it is always-stored; an always-stored record evicts
//! the largest optional records until it fits.

use std::path::{Component, Path, PathBuf};

use harvest_core::Record;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{HarvestError, HarvestResult};

/// Outcome of a finished archive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub written: usize,
    pub bytes: usize,
    /// Paths left out to stay under the ceiling.
    pub dropped: Vec<String>,
}

pub trait ArchiveSink: Send {
    /// `bytes` is the marshalled body of `record`.
    fn accept(&mut self, record: &Record, bytes: Vec<u8>) -> HarvestResult<()>;
    fn finish(&mut self) -> HarvestResult<ArchiveStats>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: String,
    pub always_stored: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct MemoryArchive {
    max_bytes: usize,
    size: usize,
    files: Vec<StoredFile>,
    dropped: Vec<String>,
}

impl MemoryArchive {
    pub fn new(max_bytes: usize) -> Self { Self { max_bytes, ..Self::default() } }

    pub fn files(&self) -> &[StoredFile] { &self.files }
    pub fn size(&self) -> usize { self.size }

    pub fn get(&self, path: &str) -> Option<&[u8]> { self.files.iter().find(|f| f.path == path).map(|f| f.data.as_slice()) }

    fn evict_for(&mut self, needed: usize) {
        while self.size + needed > self.max_bytes {
            let victim = self
                .files
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.always_stored)
                .max_by_key(|(_, f)| f.data.len())
                .map(|(i, _)| i);
            let Some(i) = victim else { break };
            let f = self.files.remove(i);
            self.size -= f.data.len();
            debug!(path = %f.path, bytes = f.data.len(), "archive: evicted");
            self.dropped.push(f.path);
        }
    }

    fn take(&mut self) -> (Vec<StoredFile>, ArchiveStats) {
        let stats = ArchiveStats { written: self.files.len(), bytes: self.size, dropped: std::mem::take(&mut self.dropped) };
        self.size = 0;
        (std::mem::take(&mut self.files), stats)
    }
}

impl ArchiveSink for MemoryArchive {
    fn accept(&mut self, record: &Record, bytes: Vec<u8>) -> HarvestResult<()> {
        let path = record.path();
        if let Some(i) = self.files.iter().position(|f| f.path == path) {
            let old = self.files.remove(i);
            self.size -= old.data.len();
            warn!(path = %path, "archive: replacing file with the same path");
        }
        if self.size + bytes.len() > self.max_bytes {
            if !record.always_stored {
                warn!(path = %path, bytes = bytes.len(), limit = self.max_bytes, "archive: record exceeds the size limit, dropped");
                self.dropped.push(path);
                return Ok(());
            }
            self.evict_for(bytes.len());
        }
        self.size += bytes.len();
        self.files.push(StoredFile { path, always_stored: record.always_stored, data: bytes });
        Ok(())
    }

    fn finish(&mut self) -> HarvestResult<ArchiveStats> {
        gauge!("harvest_archive_bytes", self.size as f64);
        Ok(ArchiveStats { written: self.files.len(), bytes: self.size, dropped: self.dropped.clone() })
    }
}

/// Writes the archive as a directory tree on [`finish`](ArchiveSink::finish).
#[derive(Debug)]
pub struct DirArchive {
    root: PathBuf,
    memory: MemoryArchive,
}

/// Record paths must stay relative and inside the archive root.
fn relative(path: &str) -> HarvestResult<PathBuf> {
    let p = Path::new(path);
    if path.is_empty() || p.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(HarvestError::Archive(format!("record path {path:?} escapes the archive")));
    }
    Ok(p.to_path_buf())
}

impl DirArchive {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self { Self { root: root.into(), memory: MemoryArchive::new(max_bytes) } }

    pub fn root(&self) -> &Path { &self.root }

    /// Files under `root`, relative and sorted.
    pub fn list(root: &Path) -> HarvestResult<Vec<String>> {
        let mut out = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| HarvestError::Archive(format!("reading {}: {e}", dir.display())))?;
            for entry in entries {
                let entry = entry.map_err(|e| HarvestError::Archive(e.to_string()))?;
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

impl ArchiveSink for DirArchive {
    fn accept(&mut self, record: &Record, bytes: Vec<u8>) -> HarvestResult<()> {
        relative(&record.path())?;
        self.memory.accept(record, bytes)
    }

    fn finish(&mut self) -> HarvestResult<ArchiveStats> {
        let (files, stats) = self.memory.take();
        for f in files {
            let target = self.root.join(relative(&f.path)?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| HarvestError::Archive(format!("creating {}: {e}", parent.display())))?;
            }
            std::fs::write(&target, &f.data).map_err(|e| HarvestError::Archive(format!("writing {}: {e}", target.display())))?;
        }
        gauge!("harvest_archive_bytes", stats.bytes as f64);
        info!(root = %self.root.display(), files = stats.written, bytes = stats.bytes, dropped = stats.dropped.len(), "archive: written");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{JsonMarshaller, RawBytes};

    fn rec(name: &str) -> Record { Record::new(name, RawBytes::text("")) }

    #[test]
    fn optional_records_over_the_limit_are_dropped() {
        let mut a = MemoryArchive::new(10);
        a.accept(&rec("config/a"), vec![0; 6]).expect("a");
        a.accept(&rec("config/b"), vec![0; 6]).expect("b");
        a.accept(&rec("config/c"), vec![0; 4]).expect("c");
        let stats = a.finish().expect("finish");
        assert_eq!(stats, ArchiveStats { written: 2, bytes: 10, dropped: vec!["config/b".into()] });
    }

    #[test]
    fn always_stored_records_evict_the_largest_optional_ones() {
        let mut a = MemoryArchive::new(10);
        a.accept(&rec("config/small"), vec![0; 2]).expect("small");
        a.accept(&rec("config/big"), vec![0; 7]).expect("big");
        let meta = Record::new("insights-operator/gathers", JsonMarshaller(0)).always_stored();
        a.accept(&meta, vec![1; 5]).expect("meta");
        assert_eq!(a.files().iter().map(|f| f.path.as_str()).collect::<Vec<_>>(), vec!["config/small", "insights-operator/gathers.json"]);
        assert_eq!(a.size(), 7);
        assert_eq!(a.finish().expect("finish").dropped, vec!["config/big"]);
    }

    #[test]
    fn escaping_paths_are_rejected() {
        assert!(relative("config/pod/ns/logs/p/errors.log").is_ok());
        assert!(matches!(relative("../etc/passwd"), Err(HarvestError::Archive(_))));
        assert!(relative("/abs").is_err());
        assert!(relative("").is_err());
    }
}
