//! Fingerprint registry index
//!
//! A single append-only JSONL file under the cache root maps
//! (recording_id, stage, fingerprint) to an artifact location and checksum.
//! Entries are never rewritten: a parameter change produces a new fingerprint
//! and a new line; invalidation appends a tombstone. Per-(recording, stage)
//! mutexes serialize publishes of the same artifact while leaving unrelated
//! recordings fully parallel.

use crate::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Name of the index file under the cache root.
pub const INDEX_FILE: &str = "registry.jsonl";

/// Lock granularity: one recording and one pipeline stage.
pub type StageKey = (String, String);

type EntryKey = (String, String, String);

/// One published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub recording_id: String,
    /// Pipeline stage, e.g. "segments", "segments+refined", "spectrograms",
    /// "feature:<name>".
    pub stage: String,
    /// Fingerprint of the parameter set that produced the artifact.
    pub fingerprint: String,
    /// Artifact location, relative to the cache root.
    pub artifact_path: String,
    /// CRC-64 of the artifact payload (0 for text sidecars).
    pub checksum: u64,
    /// Row count of the artifact (segments or records).
    pub rows: u32,
    /// Size of the source recording when the artifact was produced.
    pub source_size: u64,
    /// Modification time (seconds since epoch) of the source recording.
    pub source_mtime: i64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum IndexLine {
    Publish {
        #[serde(flatten)]
        entry: RegistryEntry,
    },
    Retract {
        recording_id: String,
        stage: String,
        fingerprint: String,
    },
}

pub struct Registry {
    root: PathBuf,
    index: Mutex<HashMap<EntryKey, RegistryEntry>>,
    key_locks: Mutex<HashMap<StageKey, Arc<Mutex<()>>>>,
    appender: Mutex<File>,
}

impl Registry {
    /// Open (or create) the registry under `root`, replaying the index.
    ///
    /// A torn trailing line from a crash mid-append is skipped with a
    /// warning; a malformed line anywhere else is corruption.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let index_path = root.join(INDEX_FILE);

        let mut index = HashMap::new();
        if index_path.exists() {
            let file = File::open(&index_path)?;
            let lines: Vec<String> = BufReader::new(file).lines().collect::<std::io::Result<_>>()?;
            let last = lines.len().saturating_sub(1);

            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: std::result::Result<IndexLine, _> = serde_json::from_str(line);
                match parsed {
                    Ok(IndexLine::Publish { entry }) => {
                        let key = entry_key(&entry.recording_id, &entry.stage, &entry.fingerprint);
                        index.insert(key, entry);
                    }
                    Ok(IndexLine::Retract {
                        recording_id,
                        stage,
                        fingerprint,
                    }) => {
                        index.remove(&entry_key(&recording_id, &stage, &fingerprint));
                    }
                    Err(e) if i == last => {
                        log::warn!(
                            "ignoring torn trailing registry line in {}: {}",
                            index_path.display(),
                            e
                        );
                    }
                    Err(e) => {
                        return Err(StoreError::Corrupt {
                            path: index_path,
                            reason: format!("malformed index line {}: {}", i + 1, e),
                        });
                    }
                }
            }
        }

        let appender = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;

        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
            key_locks: Mutex::new(HashMap::new()),
            appender: Mutex::new(appender),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an entry's artifact.
    pub fn artifact_path(&self, entry: &RegistryEntry) -> PathBuf {
        self.root.join(&entry.artifact_path)
    }

    /// The mutex guarding one (recording, stage) key. Callers hold the
    /// returned lock across the lookup-compute-publish sequence so two
    /// callers never compute the same artifact concurrently.
    pub fn stage_lock(&self, recording_id: &str, stage: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("lock table poisoned");
        locks
            .entry((recording_id.to_string(), stage.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn lookup(
        &self,
        recording_id: &str,
        stage: &str,
        fingerprint: &str,
    ) -> Option<RegistryEntry> {
        let index = self.index.lock().expect("index poisoned");
        index.get(&entry_key(recording_id, stage, fingerprint)).cloned()
    }

    /// Record a published artifact. Re-publishing the same key with the same
    /// checksum is an idempotent no-op; a different checksum is refused,
    /// since fingerprinted artifacts are immutable.
    pub fn publish(&self, entry: RegistryEntry) -> Result<()> {
        let key = entry_key(&entry.recording_id, &entry.stage, &entry.fingerprint);

        let mut index = self.index.lock().expect("index poisoned");
        if let Some(existing) = index.get(&key) {
            if existing.checksum == entry.checksum && existing.rows == entry.rows {
                return Ok(());
            }
            return Err(StoreError::Immutable {
                recording_id: entry.recording_id,
                stage: entry.stage,
                fingerprint: entry.fingerprint,
            });
        }

        self.append_line(&IndexLine::Publish {
            entry: entry.clone(),
        })?;
        index.insert(key, entry);
        Ok(())
    }

    /// Append a tombstone for an entry; the artifact bytes are left in place
    /// and simply no longer resolvable.
    pub fn retract(&self, recording_id: &str, stage: &str, fingerprint: &str) -> Result<()> {
        let mut index = self.index.lock().expect("index poisoned");
        if index.remove(&entry_key(recording_id, stage, fingerprint)).is_none() {
            return Ok(());
        }
        self.append_line(&IndexLine::Retract {
            recording_id: recording_id.to_string(),
            stage: stage.to_string(),
            fingerprint: fingerprint.to_string(),
        })
    }

    /// Snapshot of all live entries, ordered by (recording, stage, fingerprint).
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        let index = self.index.lock().expect("index poisoned");
        let mut entries: Vec<_> = index.values().cloned().collect();
        entries.sort_by(|a, b| {
            (&a.recording_id, &a.stage, &a.fingerprint)
                .cmp(&(&b.recording_id, &b.stage, &b.fingerprint))
        });
        entries
    }

    /// Live entries for one recording and stage, any fingerprint.
    pub fn entries_for_stage(&self, recording_id: &str, stage: &str) -> Vec<RegistryEntry> {
        let index = self.index.lock().expect("index poisoned");
        let mut entries: Vec<_> = index
            .values()
            .filter(|e| e.recording_id == recording_id && e.stage == stage)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        entries
    }

    fn append_line(&self, line: &IndexLine) -> Result<()> {
        let mut json = serde_json::to_string(line)?;
        json.push('\n');
        let mut appender = self.appender.lock().expect("appender poisoned");
        appender.write_all(json.as_bytes())?;
        appender.flush()?;
        Ok(())
    }
}

fn entry_key(recording_id: &str, stage: &str, fingerprint: &str) -> EntryKey {
    (
        recording_id.to_string(),
        stage.to_string(),
        fingerprint.to_string(),
    )
}

/// Stamp for registry entries.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(recording: &str, stage: &str, fp: &str, checksum: u64) -> RegistryEntry {
        RegistryEntry {
            recording_id: recording.to_string(),
            stage: stage.to_string(),
            fingerprint: fp.to_string(),
            artifact_path: format!("{}/{}-{}.syxa", stage, recording.replace('/', "_"), fp),
            checksum,
            rows: 3,
            source_size: 1024,
            source_mtime: 1700000000,
            created_at: now_rfc3339(),
        }
    }

    #[test]
    fn test_publish_lookup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let e = entry("bird7/rec1.wav", "segments", "aaaaaaaaaaaaaaaa", 42);
        registry.publish(e.clone()).unwrap();

        let found = registry
            .lookup("bird7/rec1.wav", "segments", "aaaaaaaaaaaaaaaa")
            .unwrap();
        assert_eq!(found, e);
        assert!(registry
            .lookup("bird7/rec1.wav", "segments", "bbbbbbbbbbbbbbbb")
            .is_none());
    }

    #[test]
    fn test_replay_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry
                .publish(entry("r1", "segments", "aaaaaaaaaaaaaaaa", 1))
                .unwrap();
            registry
                .publish(entry("r1", "spectrograms", "cccccccccccccccc", 2))
                .unwrap();
            registry.retract("r1", "segments", "aaaaaaaaaaaaaaaa").unwrap();
        }

        let reopened = Registry::open(dir.path()).unwrap();
        assert!(reopened.lookup("r1", "segments", "aaaaaaaaaaaaaaaa").is_none());
        assert!(reopened
            .lookup("r1", "spectrograms", "cccccccccccccccc")
            .is_some());
    }

    #[test]
    fn test_republish_same_checksum_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let e = entry("r1", "segments", "aaaaaaaaaaaaaaaa", 7);
        registry.publish(e.clone()).unwrap();
        registry.publish(e).unwrap();
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_overwrite_with_new_checksum_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        registry
            .publish(entry("r1", "segments", "aaaaaaaaaaaaaaaa", 7))
            .unwrap();
        let err = registry.publish(entry("r1", "segments", "aaaaaaaaaaaaaaaa", 8));
        assert!(matches!(err, Err(StoreError::Immutable { .. })));
    }

    #[test]
    fn test_torn_trailing_line_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = Registry::open(dir.path()).unwrap();
            registry
                .publish(entry("r1", "segments", "aaaaaaaaaaaaaaaa", 1))
                .unwrap();
        }
        // Simulate a crash mid-append.
        let index_path = dir.path().join(INDEX_FILE);
        let mut file = OpenOptions::new().append(true).open(&index_path).unwrap();
        file.write_all(b"{\"op\":\"publish\",\"recording_id\":\"r2\"").unwrap();

        let reopened = Registry::open(dir.path()).unwrap();
        assert!(reopened.lookup("r1", "segments", "aaaaaaaaaaaaaaaa").is_some());
        assert_eq!(reopened.snapshot().len(), 1);
    }

    #[test]
    fn test_malformed_interior_line_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join(INDEX_FILE);
        std::fs::write(&index_path, "not json at all\n{\"op\":\"retract\",\"recording_id\":\"r\",\"stage\":\"s\",\"fingerprint\":\"f\"}\n").unwrap();

        let err = Registry::open(dir.path());
        assert!(matches!(err, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_stage_lock_distinct_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(dir.path()).unwrap();

        let a = registry.stage_lock("r1", "segments");
        let b = registry.stage_lock("r1", "segments");
        let c = registry.stage_lock("r2", "segments");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
