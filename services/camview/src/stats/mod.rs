//! Per-camera, per-minute throughput and latency statistics.
//!
//! Every promoted image contributes to three minute rows: the minute it was
//! captured, the minute it finished uploading and the minute its promotion
//! completed. Latencies are kept as running means in whole minutes. A
//! periodic snapshot records how many raw images are still waiting.

pub mod store;
pub mod table;

use crate::camera::Camera;
use crate::clock::{self, Clock};
use crate::scanner::{self, ScanError};
use chrono::{DateTime, Duration, Local};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use store::{DateCameraKey, StatsStore};
pub use table::{minute_of_day, StatsRow, StatsTable, MINUTES_PER_DAY};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Cannot persist statistics to {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt statistics file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Timestamps of one completed promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionEvent {
    pub camera: String,
    pub capture: DateTime<Local>,
    /// Modification time of the raw file
    pub upload: DateTime<Local>,
    pub completion: DateTime<Local>,
}

/// Signed difference in whole minutes, rounded half away from zero.
fn minutes_between(from: DateTime<Local>, to: DateTime<Local>) -> i64 {
    let seconds = (to - from).num_seconds() as f64;
    (seconds / 60.0).round() as i64
}

pub struct StatsEngine {
    store: StatsStore,
    incoming_root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl StatsEngine {
    pub fn new(
        stats_dir: impl Into<PathBuf>,
        incoming_root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: StatsStore::new(stats_dir),
            incoming_root: incoming_root.into(),
            clock,
        }
    }

    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    /// Copy of the table for `key`, loading it if needed.
    pub fn table(&self, key: &DateCameraKey) -> StatsTable {
        self.store.table(key)
    }

    pub fn record_event(&self, event: &PromotionEvent) {
        let upload_latency = minutes_between(event.capture, event.upload);
        let processing_latency = minutes_between(event.upload, event.completion);

        let created_at = event.capture;
        let key = DateCameraKey::new(created_at.date_naive(), &event.camera);
        self.store.update(&key, |t| {
            t.row_mut(minute_of_day(&created_at)).record_created(upload_latency)
        });

        // may land on a later date than the capture
        let uploaded_at = event.capture + Duration::minutes(upload_latency);
        let key = DateCameraKey::new(uploaded_at.date_naive(), &event.camera);
        self.store.update(&key, |t| {
            t.row_mut(minute_of_day(&uploaded_at))
                .record_uploaded(processing_latency)
        });

        let completed_at = event.completion;
        let key = DateCameraKey::new(completed_at.date_naive(), &event.camera);
        self.store.update(&key, |t| {
            t.row_mut(minute_of_day(&completed_at)).record_processed()
        });

        debug!(
            camera = %event.camera,
            upload_latency,
            processing_latency,
            "Recorded promotion statistics"
        );
    }

    /// Record how many raw images wait in today's and yesterday's incoming
    /// directories for each camera, in the row for `now`. A camera whose
    /// directory cannot be read is logged and skipped; returns the number
    /// of cameras recorded.
    pub fn snapshot_unprocessed(&self, now: DateTime<Local>, cameras: &[Camera]) -> usize {
        let today = now.date_naive();
        let yesterday = today - Duration::days(1);
        let minute = minute_of_day(&now);
        let mut recorded = 0;

        for camera in cameras {
            let count = |date| {
                let dir = self
                    .incoming_root
                    .join(clock::format_date(date))
                    .join(&camera.shortname);
                scanner::count_images(&dir)
                    .map(|n| n as u32)
                    .map_err(|source| ScanError { path: dir, source })
            };
            let (pending_today, pending_previous) = match (count(today), count(yesterday)) {
                (Ok(t), Ok(p)) => (t, p),
                (Err(e), _) | (_, Err(e)) => {
                    metrics::counter!("camview.stats.snapshot.skipped").increment(1);
                    warn!(camera = %camera.shortname, error = %e, "Backlog not counted");
                    continue;
                }
            };

            let key = DateCameraKey::new(today, &camera.shortname);
            self.store.update(&key, |t| {
                let row = t.row_mut(minute);
                row.unprocessed_today = pending_today;
                row.unprocessed_previous_day = pending_previous;
            });
            recorded += 1;
        }
        recorded
    }

    pub fn flush(&self, key: &DateCameraKey) -> Result<(), StatsError> {
        self.store.flush(key).inspect_err(|e| {
            metrics::counter!("camview.stats.flush.failed").increment(1);
            warn!(error = %e, key = %key, "Statistics flush failed");
        })
    }

    /// Flush every table changed since its last flush. Failures are logged
    /// and counted; the tables stay dirty for the next attempt.
    pub fn flush_dirty(&self) -> usize {
        let (written, errors) = self.store.flush_dirty();
        for e in &errors {
            metrics::counter!("camview.stats.flush.failed").increment(1);
            warn!(error = %e, "Statistics flush failed");
        }
        written
    }

    /// Delete statistics older than the retention window ending today.
    pub fn expire(&self, retain_days: u32) -> Result<usize, StatsError> {
        let oldest_kept = clock::oldest_retained(self.clock.today(), retain_days);
        self.store.expire(oldest_kept)
    }
}
