//! Resident statistics tables keyed by (date, camera).
//!
//! A table is loaded from its file (or zero-initialized) the first time its
//! key is touched and stays in memory afterwards; memory is authoritative
//! until the table is flushed back out. Each key has its own slot lock and
//! the load runs under it, so a slow file read only holds up its own key.

use super::table::StatsTable;
use super::StatsError;
use crate::clock;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const STATS_EXTENSION: &str = "csv";

/// Primary key for statistics and directory addressing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DateCameraKey {
    pub date: NaiveDate,
    pub camera: String,
}

impl DateCameraKey {
    pub fn new(date: NaiveDate, camera: impl Into<String>) -> Self {
        Self {
            date,
            camera: camera.into(),
        }
    }

    /// `YYYY-MM-DD_<camera>.csv`
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.{}",
            clock::format_date(self.date),
            self.camera,
            STATS_EXTENSION
        )
    }

    /// Inverse of [`DateCameraKey::file_name`]; `None` for anything else.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(STATS_EXTENSION)?.strip_suffix('.')?;
        let (date, camera) = stem.split_once('_')?;
        if camera.is_empty() {
            return None;
        }
        Some(Self::new(clock::parse_date(date)?, camera))
    }
}

impl std::fmt::Display for DateCameraKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", clock::format_date(self.date), self.camera)
    }
}

struct Resident {
    table: StatsTable,
    dirty: bool,
}

/// Empty until the first access has loaded the file.
type Slot = Arc<Mutex<Option<Resident>>>;

pub struct StatsStore {
    dir: PathBuf,
    tables: Mutex<HashMap<DateCameraKey, Slot>>,
}

impl StatsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &DateCameraKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    fn slot(&self, key: &DateCameraKey) -> Slot {
        self.tables.lock().entry(key.clone()).or_default().clone()
    }

    /// Run `f` on the resident table for `key`, loading it on first access.
    /// The load happens under the slot lock, so a key is reconciled with its
    /// file exactly once.
    fn with_resident<R>(&self, key: &DateCameraKey, f: impl FnOnce(&mut Resident) -> R) -> R {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        let resident = guard.get_or_insert_with(|| Resident {
            table: self.load(key),
            dirty: false,
        });
        f(resident)
    }

    fn load(&self, key: &DateCameraKey) -> StatsTable {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(text) => match StatsTable::from_records(&text) {
                Ok(table) => {
                    debug!(key = %key, "Loaded statistics table");
                    table
                }
                Err(reason) => {
                    let err = StatsError::Corrupt { path, reason };
                    warn!(error = %err, "Ignoring unreadable statistics");
                    StatsTable::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => StatsTable::new(),
            Err(source) => {
                let err = StatsError::Persistence { path, source };
                warn!(error = %err, "Ignoring unreadable statistics");
                StatsTable::new()
            }
        }
    }

    /// Mutate the table for `key` under its lock.
    pub fn update<R>(&self, key: &DateCameraKey, f: impl FnOnce(&mut StatsTable) -> R) -> R {
        self.with_resident(key, |resident| {
            resident.dirty = true;
            f(&mut resident.table)
        })
    }

    /// Copy of the table for `key`.
    pub fn table(&self, key: &DateCameraKey) -> StatsTable {
        self.with_resident(key, |resident| resident.table.clone())
    }

    pub fn resident_keys(&self) -> Vec<DateCameraKey> {
        let mut keys: Vec<_> = self.tables.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Write the table for `key`, replacing any previous file.
    ///
    /// On failure the table stays resident and dirty for the next attempt.
    pub fn flush(&self, key: &DateCameraKey) -> Result<(), StatsError> {
        self.with_resident(key, |resident| {
            self.write(key, &resident.table)?;
            resident.dirty = false;
            Ok(())
        })
    }

    /// Flush every table modified since its last flush. Returns the number
    /// written and the failures.
    pub fn flush_dirty(&self) -> (usize, Vec<StatsError>) {
        let entries: Vec<(DateCameraKey, Slot)> = self
            .tables
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut written = 0;
        let mut errors = Vec::new();
        for (key, slot) in entries {
            let mut guard = slot.lock();
            let Some(resident) = guard.as_mut().filter(|r| r.dirty) else {
                continue;
            };
            match self.write(&key, &resident.table) {
                Ok(()) => {
                    resident.dirty = false;
                    written += 1;
                }
                Err(e) => errors.push(e),
            }
        }
        (written, errors)
    }

    fn write(&self, key: &DateCameraKey, table: &StatsTable) -> Result<(), StatsError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("csv.tmp");
        let persist = |source: io::Error| StatsError::Persistence {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(persist)?;
        fs::write(&tmp, table.to_records()).map_err(persist)?;
        fs::rename(&tmp, &path).map_err(persist)?;

        debug!(key = %key, path = %path.display(), "Flushed statistics table");
        Ok(())
    }

    /// Delete statistics files, and drop resident tables, dated before
    /// `oldest_kept`. Files with unrecognized names are left alone.
    pub fn expire(&self, oldest_kept: NaiveDate) -> Result<usize, StatsError> {
        self.tables.lock().retain(|key, _| key.date >= oldest_kept);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(StatsError::Persistence {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(key) = DateCameraKey::parse_file_name(&name) else {
                continue;
            };
            if key.date >= oldest_kept {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StatsError::Persistence {
                        path: entry.path(),
                        source,
                    })
                }
            }
        }

        if removed > 0 {
            info!(removed, oldest_kept = %clock::format_date(oldest_kept), "Expired statistics files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(date: &str, camera: &str) -> DateCameraKey {
        DateCameraKey::new(clock::parse_date(date).unwrap(), camera)
    }

    #[test]
    fn test_file_name_round_trip() {
        let k = key("2014-07-01", "cam_1");
        assert_eq!(k.file_name(), "2014-07-01_cam_1.csv");
        assert_eq!(DateCameraKey::parse_file_name("2014-07-01_cam_1.csv"), Some(k));
    }

    #[test]
    fn test_parse_file_name_rejects_others() {
        for name in ["things", "stuff", "2014-07-01.csv", "2014-07-01_.csv", "2014-7-1_cam.csv", "2014-07-01_cam.txt"] {
            assert_eq!(DateCameraKey::parse_file_name(name), None, "{}", name);
        }
    }

    #[test]
    fn test_flush_then_reload_from_disk() {
        let dir = TempDir::new().unwrap();
        let k = key("2014-07-01", "cam1");

        let store = StatsStore::new(dir.path());
        store.update(&k, |t| t.row_mut(61).record_created(4));
        store.flush(&k).unwrap();
        assert!(dir.path().join("2014-07-01_cam1.csv").is_file());

        let fresh = StatsStore::new(dir.path());
        assert_eq!(fresh.table(&k), store.table(&k));
        assert_eq!(fresh.table(&k).row(61).created, 1);
    }

    #[test]
    fn test_memory_is_authoritative_after_load() {
        let dir = TempDir::new().unwrap();
        let k = key("2014-07-01", "cam1");
        let store = StatsStore::new(dir.path());
        store.update(&k, |t| t.row_mut(0).record_processed());

        // a file appearing after the key is resident is not re-read
        let mut other = StatsTable::new();
        other.row_mut(0).processed = 99;
        fs::write(store.path_for(&k), other.to_records()).unwrap();

        assert_eq!(store.table(&k).row(0).processed, 1);
    }

    #[test]
    fn test_corrupt_file_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let k = key("2014-07-01", "cam1");
        fs::write(dir.path().join(k.file_name()), "garbage\n").unwrap();

        let store = StatsStore::new(dir.path());
        assert_eq!(store.table(&k), StatsTable::new());
    }

    #[test]
    fn test_flush_dirty_only_writes_modified() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        let a = key("2014-07-01", "cam1");
        let b = key("2014-07-01", "cam2");

        store.update(&a, |t| t.row_mut(0).record_processed());
        let _ = store.table(&b);

        let (written, errors) = store.flush_dirty();
        assert_eq!((written, errors.len()), (1, 0));
        assert!(store.path_for(&a).exists());
        assert!(!store.path_for(&b).exists());

        let (written, _) = store.flush_dirty();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_flush_failure_keeps_table() {
        let dir = TempDir::new().unwrap();
        // stats directory path is occupied by a regular file
        let blocked = dir.path().join("stats");
        fs::write(&blocked, b"").unwrap();

        let store = StatsStore::new(&blocked);
        let k = key("2014-07-01", "cam1");
        store.update(&k, |t| t.row_mut(10).record_processed());

        assert!(matches!(store.flush(&k), Err(StatsError::Persistence { .. })));
        let (written, errors) = store.flush_dirty();
        assert_eq!((written, errors.len()), (0, 1));
        assert_eq!(store.table(&k).row(10).processed, 1);
    }

    #[test]
    fn test_expire_drops_resident_tables() {
        let dir = TempDir::new().unwrap();
        let store = StatsStore::new(dir.path());
        store.update(&key("2000-01-01", "cam1"), |t| t.row_mut(0).record_processed());
        store.update(&key("2000-01-05", "cam1"), |t| t.row_mut(0).record_processed());

        store.expire(clock::parse_date("2000-01-03").unwrap()).unwrap();
        assert_eq!(store.resident_keys(), vec![key("2000-01-05", "cam1")]);
    }

    #[test]
    fn test_loading_one_key_does_not_block_another() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StatsStore::new(dir.path()));
        let a = key("2014-07-01", "cam1");
        let b = key("2014-07-01", "cam2");

        // hold b's slot as a load in progress would
        let slot_b = store.slot(&b);
        let loading = slot_b.lock();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.update(&a, |t| t.row_mut(0).record_processed());
                tx.send(store.table(&a).row(0).processed).unwrap();
            })
        };
        let processed = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(loading);
        worker.join().unwrap();
        assert_eq!(processed, Ok(1));
    }

    #[test]
    fn test_concurrent_first_access_loads_once() {
        let dir = TempDir::new().unwrap();
        let k = key("2014-07-01", "cam1");
        let mut on_disk = StatsTable::new();
        on_disk.row_mut(0).processed = 5;
        fs::write(dir.path().join(k.file_name()), on_disk.to_records()).unwrap();

        let store = Arc::new(StatsStore::new(dir.path()));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let (store, k) = (store.clone(), k.clone());
                std::thread::spawn(move || store.update(&k, |t| t.row_mut(0).record_processed()))
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(store.table(&k).row(0).processed, 13);
    }
}
