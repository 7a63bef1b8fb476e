//! Walks the incoming tree and classifies each raw image by age.
//!
//! The tree is `<incoming_root>/<YYYY-MM-DD>/<camera>/<image>`. Entries that
//! do not fit that shape (stray files, the staging directory, hidden files)
//! are ignored. Scanning never modifies anything.

use crate::clock::{self, Clock};
use chrono::{DateTime, Local, NaiveDate};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Unreadable directory encountered during a scan.
#[derive(Debug, Error)]
#[error("Cannot read {path}: {source}")]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// One raw image found in the incoming tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEntry {
    pub date: NaiveDate,
    pub camera: String,
    pub filename: String,
    pub path: PathBuf,
    pub modified: DateTime<Local>,
    /// Old enough that the uploader must have finished writing it
    pub ready: bool,
}

/// Which date directories a scan visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    All,
    /// Only `date`
    Only(NaiveDate),
    /// Every date strictly before `date`
    Before(NaiveDate),
}

impl DateFilter {
    fn accepts(self, date: NaiveDate) -> bool {
        match self {
            DateFilter::All => true,
            DateFilter::Only(d) => date == d,
            DateFilter::Before(d) => date < d,
        }
    }
}

pub struct Scanner {
    root: PathBuf,
    aging_threshold: Duration,
    clock: Arc<dyn Clock>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, aging_threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            aging_threshold,
            clock,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazily enumerate images in the selected date directories, oldest date
    /// first, cameras and files in name order.
    pub fn scan(&self, filter: DateFilter) -> Scan {
        let mut errors = Vec::new();
        let dates = match list_date_dirs(&self.root) {
            Ok(dates) => dates
                .into_iter()
                .filter(|(date, _)| filter.accepts(*date))
                .collect(),
            Err(source) => {
                report(&mut errors, self.root.clone(), source);
                VecDeque::new()
            }
        };

        Scan {
            now: self.clock.now(),
            aging_threshold: chrono::Duration::from_std(self.aging_threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(1)),
            dates,
            cameras: VecDeque::new(),
            files: VecDeque::new(),
            errors,
        }
    }

    /// Whether a file last modified at `modified` is old enough to promote.
    pub fn is_ready(&self, modified: DateTime<Local>) -> bool {
        let threshold = chrono::Duration::from_std(self.aging_threshold)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.clock.now() - modified >= threshold
    }
}

/// Iterator returned by [`Scanner::scan`].
pub struct Scan {
    now: DateTime<Local>,
    aging_threshold: chrono::Duration,
    dates: VecDeque<(NaiveDate, PathBuf)>,
    cameras: VecDeque<(NaiveDate, String, PathBuf)>,
    files: VecDeque<ScanEntry>,
    errors: Vec<ScanError>,
}

impl Scan {
    /// Directories that could not be read so far; they were skipped.
    pub fn errors(&self) -> &[ScanError] {
        &self.errors
    }

    fn load_date(&mut self, date: NaiveDate, path: PathBuf) {
        match list_subdirs(&path) {
            Ok(cameras) => {
                for (camera, camera_path) in cameras {
                    self.cameras.push_back((date, camera, camera_path));
                }
            }
            Err(source) => report(&mut self.errors, path, source),
        }
    }

    fn load_camera(&mut self, date: NaiveDate, camera: String, path: PathBuf) {
        let images = match list_images(&path) {
            Ok(images) => images,
            Err(source) => {
                report(&mut self.errors, path, source);
                return;
            }
        };

        for (filename, file_path, modified) in images {
            let ready = self.now - modified >= self.aging_threshold;
            self.files.push_back(ScanEntry {
                date,
                camera: camera.clone(),
                filename,
                path: file_path,
                modified,
                ready,
            });
        }
    }
}

impl Iterator for Scan {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            if let Some(entry) = self.files.pop_front() {
                return Some(entry);
            }
            if let Some((date, camera, path)) = self.cameras.pop_front() {
                self.load_camera(date, camera, path);
                continue;
            }
            let (date, path) = self.dates.pop_front()?;
            self.load_date(date, path);
        }
    }
}

fn report(errors: &mut Vec<ScanError>, path: PathBuf, source: io::Error) {
    let err = ScanError { path, source };
    warn!(error = %err, "Skipping unreadable directory");
    errors.push(err);
}

/// Date directories directly under `root`, oldest first.
pub fn list_date_dirs(root: &Path) -> io::Result<Vec<(NaiveDate, PathBuf)>> {
    let mut dates: Vec<(NaiveDate, PathBuf)> = list_subdirs(root)?
        .into_iter()
        .filter_map(|(name, path)| clock::parse_date(&name).map(|d| (d, path)))
        .collect();
    dates.sort_by_key(|(date, _)| *date);
    Ok(dates)
}

/// Visible subdirectories of `dir`, by name.
fn list_subdirs(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            dirs.push((name, entry.path()));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Raw images directly inside a camera directory, by name.
fn list_images(dir: &Path) -> io::Result<Vec<(String, PathBuf, DateTime<Local>)>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_image_name(&name) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        images.push((name, entry.path(), clock::from_system_time(meta.modified()?)));
    }
    images.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(images)
}

/// Number of raw images in a camera directory; a missing directory counts 0.
pub fn count_images(dir: &Path) -> io::Result<usize> {
    match list_images(dir) {
        Ok(images) => Ok(images.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

pub fn is_image_name(name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn touch(path: &Path, modified: SystemTime) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        file.set_modified(modified).unwrap();
    }

    fn scanner(root: &Path, clock: Arc<FixedClock>) -> Scanner {
        Scanner::new(root, Duration::from_secs(3600), clock)
    }

    fn noon(y: i32, m: u32, d: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_scan_orders_and_classifies() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at(noon(2013, 7, 1)));
        let now: SystemTime = clock.now().into();
        let old = now - Duration::from_secs(7200);
        let fresh = now - Duration::from_secs(60);

        touch(&dir.path().join("2013-06-30/camera2/11-00-02-00001.jpg"), old);
        touch(&dir.path().join("2013-06-30/camera1/11-00-00-00002.jpg"), old);
        touch(&dir.path().join("2013-06-30/camera1/11-00-00-00001.jpg"), fresh);
        touch(&dir.path().join("2013-06-29/camera1/10-00-00-00001.jpg"), old);
        touch(&dir.path().join("2013-06-29/camera1/notes.txt"), old);
        touch(&dir.path().join("index.html"), old);
        fs::create_dir_all(dir.path().join(".work/2013-06-29")).unwrap();

        let entries: Vec<ScanEntry> = scanner(dir.path(), clock).scan(DateFilter::All).collect();
        let names: Vec<(String, String, bool)> = entries
            .iter()
            .map(|e| (clock::format_date(e.date), e.filename.clone(), e.ready))
            .collect();

        assert_eq!(
            names,
            vec![
                ("2013-06-29".to_string(), "10-00-00-00001.jpg".to_string(), true),
                ("2013-06-30".to_string(), "11-00-00-00001.jpg".to_string(), false),
                ("2013-06-30".to_string(), "11-00-00-00002.jpg".to_string(), true),
                ("2013-06-30".to_string(), "11-00-02-00001.jpg".to_string(), true),
            ]
        );
        assert_eq!(entries[3].camera, "camera2");
    }

    #[test]
    fn test_ready_boundary_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at(noon(2013, 7, 1)));
        let now: SystemTime = clock.now().into();
        touch(
            &dir.path().join("2013-06-30/camera1/a.jpg"),
            now - Duration::from_secs(3600),
        );
        touch(
            &dir.path().join("2013-06-30/camera1/b.jpg"),
            now - Duration::from_secs(3599),
        );

        let ready: Vec<bool> = scanner(dir.path(), clock)
            .scan(DateFilter::All)
            .map(|e| e.ready)
            .collect();
        assert_eq!(ready, vec![true, false]);
    }

    #[test]
    fn test_date_filters() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at(noon(2013, 7, 1)));
        let old: SystemTime = SystemTime::from(clock.now()) - Duration::from_secs(7200);
        for date in ["2013-06-29", "2013-06-30", "2013-07-01"] {
            touch(&dir.path().join(date).join("camera1/12-00-00-00001.jpg"), old);
        }

        let scanner = scanner(dir.path(), clock.clone());
        let today = clock.today();

        let before: Vec<NaiveDate> = scanner.scan(DateFilter::Before(today)).map(|e| e.date).collect();
        assert_eq!(before.len(), 2);
        assert!(before.iter().all(|d| *d < today));

        let only: Vec<NaiveDate> = scanner.scan(DateFilter::Only(today)).map(|e| e.date).collect();
        assert_eq!(only, vec![today]);
    }

    #[test]
    fn test_missing_root_is_reported_not_fatal() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::at(noon(2013, 7, 1)));
        let mut scan = scanner(&dir.path().join("nope"), clock).scan(DateFilter::All);
        assert!(scan.next().is_none());
        assert_eq!(scan.errors().len(), 1);
    }

    #[test]
    fn test_count_images() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        for i in 0..3 {
            touch(&dir.path().join(format!("cam/{:05}.jpg", i)), now);
        }
        touch(&dir.path().join("cam/readme.txt"), now);
        assert_eq!(count_images(&dir.path().join("cam")).unwrap(), 3);
        assert_eq!(count_images(&dir.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_is_image_name() {
        assert!(is_image_name("12-00-00-00001.jpg"));
        assert!(is_image_name("12-00-00-00001.JPG"));
        assert!(is_image_name("a.jpeg"));
        assert!(!is_image_name(".hidden.jpg"));
        assert!(!is_image_name("index.html"));
        assert!(!is_image_name("jpg"));
    }
}
