//! Control loop tying scanning, promotion, purging and statistics together.
//!
//! Three concurrent units run under one [`Orchestrator::run`]:
//!
//! - the main cycle promotes every ready image from dates before today,
//!   purges expired dates and reports whether it found work;
//! - the today-processor keeps promoting today's images between cycles;
//! - the stats loop wakes after each completed main cycle to snapshot the
//!   backlog, flush changed tables and expire old ones.
//!
//! The main cycle owns the handles of the other two and shuts them down in
//! order: today-processor first, then the stats loop, then a last flush.

use crate::camera::{self, Camera};
use crate::clock::Clock;
use crate::pipeline::{PromoteOutcome, PromotionPipeline};
use crate::purge::PurgeManager;
use crate::scanner::{DateFilter, ScanEntry, Scanner};
use crate::stats::StatsEngine;
use crate::waiter::{WaitOutcome, Waiter};
use chrono::Duration;
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one main-cycle pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: usize,
    pub failed: usize,
    pub not_ready: usize,
    pub purged: usize,
    /// A raw image from a date before today was seen this pass
    pub images_pending: bool,
    /// An expired date directory was removed this pass, or is waiting on a
    /// promotion still in flight
    pub purge_pending: bool,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        !self.images_pending && !self.purge_pending
    }
}

/// Progress published by the main cycle to the stats loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSignal {
    pub cycles_completed: u64,
    pub main_done: bool,
}

/// Totals for a whole [`Orchestrator::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub promoted: usize,
    pub failed: usize,
    pub purged: usize,
    pub today_passes: u64,
    pub today_promoted: usize,
    pub stats_passes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub retain_days: u32,
    pub exit_when_idle: bool,
    pub promotion_concurrency: usize,
}

struct Shared {
    scanner: Scanner,
    pipeline: PromotionPipeline,
    purge: PurgeManager,
    stats: Arc<StatsEngine>,
    clock: Arc<dyn Clock>,
    waiter: Arc<dyn Waiter>,
    settings: OrchestratorSettings,
}

#[derive(Debug, Clone, Copy, Default)]
struct PromotionTally {
    promoted: usize,
    failed: usize,
    not_ready: usize,
}

impl Shared {
    async fn promote_all(&self, entries: Vec<ScanEntry>) -> PromotionTally {
        let concurrency = self.settings.promotion_concurrency.max(1);
        let outcomes: Vec<_> = stream::iter(entries)
            .map(|entry| async move {
                let outcome = self.pipeline.promote(&entry).await;
                (entry, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut tally = PromotionTally::default();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(PromoteOutcome::Promoted) => tally.promoted += 1,
                Ok(PromoteOutcome::NotReady) => tally.not_ready += 1,
                Ok(PromoteOutcome::Skipped) => {}
                Err(e) => {
                    tally.failed += 1;
                    warn!(
                        date = %entry.date,
                        camera = %entry.camera,
                        file = %entry.filename,
                        error = %e,
                        "Promotion failed, will retry"
                    );
                }
            }
        }
        tally
    }

    async fn today_pass(&self) -> PromotionTally {
        let today = self.clock.today();
        let entries: Vec<ScanEntry> = self.scanner.scan(DateFilter::Only(today)).collect();
        self.promote_all(entries).await
    }

    /// Configured cameras plus any camera directory present under today or
    /// yesterday in the incoming tree.
    fn known_cameras(&self) -> Vec<Camera> {
        let mut cameras = self.pipeline.cameras().to_vec();
        let today = self.clock.today();
        for date in [today, today - Duration::days(1)] {
            let dir: PathBuf = self
                .scanner
                .root()
                .join(crate::clock::format_date(date));
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir && !name.starts_with('.') && camera::find(&cameras, &name).is_none() {
                    cameras.push(Camera::unconfigured(&name));
                }
            }
        }
        cameras
    }

    async fn stats_pass(self: &Arc<Self>) {
        let shared = self.clone();
        let result = tokio::task::spawn_blocking(move || {
            let now = shared.clock.now();
            let cameras = shared.known_cameras();
            let counted = shared.stats.snapshot_unprocessed(now, &cameras);
            debug!(cameras = counted, "Backlog snapshot taken");
            let flushed = shared.stats.flush_dirty();
            if let Err(e) = shared.stats.expire(shared.settings.retain_days) {
                warn!(error = %e, "Statistics expiry failed");
            }
            flushed
        })
        .await;

        match result {
            Ok(flushed) => debug!(flushed, "Statistics pass complete"),
            Err(e) => error!(error = %e, "Statistics pass panicked"),
        }
    }
}

/// Owns the today-processor task and its cancellation token.
pub struct TodayProcessorHandle {
    cancel: CancellationToken,
    task: JoinHandle<(u64, usize)>,
}

impl TodayProcessorHandle {
    fn spawn(shared: Arc<Shared>, cancel: CancellationToken) -> Self {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut passes = 0u64;
            let mut promoted = 0usize;
            loop {
                // a cancellation seen here still gets this one last pass
                let last = token.is_cancelled();
                let tally = shared.today_pass().await;
                passes += 1;
                promoted += tally.promoted;
                if last {
                    break;
                }
                shared.waiter.wait(&token).await;
            }
            debug!(passes, promoted, "Today-processor stopped");
            (passes, promoted)
        });
        Self { cancel, task }
    }

    /// Request a stop and wait for the final pass to finish.
    pub async fn stop(self) -> (u64, usize) {
        self.cancel.cancel();
        match self.task.await {
            Ok(totals) => totals,
            Err(e) => {
                error!(error = %e, "Today-processor panicked");
                (0, 0)
            }
        }
    }
}

/// Owns the stats loop task and the channel that releases it.
pub struct StatsLoopHandle {
    signal: watch::Sender<CycleSignal>,
    task: JoinHandle<u64>,
}

impl StatsLoopHandle {
    fn spawn(shared: Arc<Shared>) -> Self {
        let (signal, mut rx) = watch::channel(CycleSignal::default());
        let task = tokio::spawn(async move {
            let mut seen = 0u64;
            let mut passes = 0u64;
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let current = *rx.borrow_and_update();
                if current.main_done {
                    shared.stats_pass().await;
                    passes += 1;
                    break;
                }
                if current.cycles_completed > seen {
                    seen = current.cycles_completed;
                    shared.stats_pass().await;
                    passes += 1;
                }
            }
            debug!(passes, "Stats loop stopped");
            passes
        });
        Self { signal, task }
    }

    fn cycle_completed(&self, cycles: u64) {
        self.signal.send_replace(CycleSignal {
            cycles_completed: cycles,
            main_done: false,
        });
    }

    /// Tell the loop the main cycle is done and wait for its final pass.
    pub async fn finish(self, cycles: u64) -> u64 {
        self.signal.send_replace(CycleSignal {
            cycles_completed: cycles,
            main_done: true,
        });
        match self.task.await {
            Ok(passes) => passes,
            Err(e) => {
                error!(error = %e, "Stats loop panicked");
                0
            }
        }
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        scanner: Scanner,
        pipeline: PromotionPipeline,
        purge: PurgeManager,
        stats: Arc<StatsEngine>,
        clock: Arc<dyn Clock>,
        waiter: Arc<dyn Waiter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                scanner,
                purge: purge.with_claims(pipeline.claims()),
                pipeline,
                stats,
                clock,
                waiter,
                settings,
            }),
        }
    }

    /// One main-cycle pass: promote ready images from dates before today,
    /// then purge, then republish the site index if anything changed.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> CycleReport {
        let shared = &self.shared;
        let today = shared.clock.today();
        let oldest_kept = shared.purge.oldest_kept();

        // expired dates are purged, not promoted
        let entries: Vec<ScanEntry> = shared
            .scanner
            .scan(DateFilter::Before(today))
            .filter(|e| e.date >= oldest_kept)
            .collect();
        let images_pending = !entries.is_empty();
        let tally = shared.promote_all(entries).await;

        let purge = shared.purge.purge().await;
        let purged = purge.total();

        if tally.promoted > 0 || purged > 0 {
            if let Err(e) = shared.pipeline.publish_root_index().await {
                warn!(error = %e, "Site index not regenerated");
            }
        }

        let report = CycleReport {
            promoted: tally.promoted,
            failed: tally.failed,
            not_ready: tally.not_ready,
            purged,
            images_pending,
            // deferred dates clear once their promotion finishes
            purge_pending: purged > 0 || purge.deferred > 0,
        };
        info!(
            promoted = report.promoted,
            failed = report.failed,
            not_ready = report.not_ready,
            purged = report.purged,
            "Cycle complete"
        );
        report
    }

    /// Run until idle (when configured to exit when idle) or until
    /// `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> RunSummary {
        let shared = &self.shared;
        let today = TodayProcessorHandle::spawn(shared.clone(), shutdown.child_token());
        let stats = StatsLoopHandle::spawn(shared.clone());

        let mut summary = RunSummary::default();
        let mut was_idle = false;
        loop {
            let report = self.run_cycle().await;
            summary.cycles += 1;
            summary.promoted += report.promoted;
            summary.failed += report.failed;
            summary.purged += report.purged;
            stats.cycle_completed(summary.cycles);

            let idle = report.is_idle();
            if idle && shared.settings.exit_when_idle {
                info!(cycles = summary.cycles, "No work left, shutting down");
                break;
            }
            if idle && !was_idle {
                info!("Idle, waiting for new images");
            }
            was_idle = idle;

            if shutdown.is_cancelled() || shared.waiter.wait(&shutdown).await == WaitOutcome::Cancelled {
                info!(cycles = summary.cycles, "Shutdown requested");
                break;
            }
        }

        let (today_passes, today_promoted) = today.stop().await;
        summary.today_passes = today_passes;
        summary.today_promoted = today_promoted;
        summary.stats_passes = stats.finish(summary.cycles).await;

        // picks up events recorded by the today-processor's last pass
        let stats_engine = shared.stats.clone();
        if let Ok(flushed) = tokio::task::spawn_blocking(move || stats_engine.flush_dirty()).await {
            debug!(flushed, "Final statistics flush");
        }

        info!(
            cycles = summary.cycles,
            promoted = summary.promoted + summary.today_promoted,
            failed = summary.failed,
            purged = summary.purged,
            "Orchestrator stopped"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{self, FixedClock};
    use crate::codec::ImageCodec;
    use crate::config::DerivativeConfig;
    use crate::storage::{Backend, LocalStorage, WebStorage};
    use crate::waiter::IntervalWaiter;
    use chrono::{Local, NaiveDate};
    use std::fs;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn build(dir: &TempDir, now: chrono::DateTime<Local>, exit_when_idle: bool) -> Orchestrator {
        let incoming = dir.path().join("incoming");
        let web = dir.path().join("web");
        fs::create_dir_all(&incoming).unwrap();
        fs::create_dir_all(&web).unwrap();

        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let storage = Arc::new(WebStorage::with_backend(Backend::Local(LocalStorage::new())));
        let stats = Arc::new(StatsEngine::new(dir.path().join("stats"), &incoming, clock.clone()));
        let web_root = web.to_string_lossy().into_owned();
        let pipeline = PromotionPipeline::new(
            storage.clone(),
            web_root.clone(),
            dir.path().join("work"),
            "camview",
            vec![Camera::new("camera1", "One")],
            Arc::new(ImageCodec::new(&DerivativeConfig {
                medium_width: 32,
                thumbnail_width: 8,
                jpeg_quality: 70,
            })),
            stats.clone(),
            clock.clone(),
        );
        let purge = PurgeManager::new(&incoming, storage, web_root, 5, clock.clone());
        Orchestrator::new(
            Scanner::new(&incoming, StdDuration::from_secs(3600), clock.clone()),
            pipeline,
            purge,
            stats,
            clock,
            Arc::new(IntervalWaiter::new(StdDuration::from_millis(10))),
            OrchestratorSettings {
                retain_days: 5,
                exit_when_idle,
                promotion_concurrency: 2,
            },
        )
    }

    fn drop_image(dir: &TempDir, date: &str, name: &str) {
        let path = dir.path().join("incoming").join(date).join("camera1");
        fs::create_dir_all(&path).unwrap();
        image::RgbImage::from_pixel(16, 16, image::Rgb([1, 2, 3]))
            .save_with_format(path.join(name), image::ImageFormat::Jpeg)
            .unwrap();
    }

    fn future() -> chrono::DateTime<Local> {
        let tomorrow = Local::now().date_naive() + Duration::days(1);
        clock::local_datetime(tomorrow.and_hms_opt(12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_cycle_reports_work_then_idle() {
        let dir = TempDir::new().unwrap();
        let now = future();
        let yesterday = clock::format_date(now.date_naive() - Duration::days(1));
        drop_image(&dir, &yesterday, "10-00-00-00001.jpg");
        drop_image(&dir, &yesterday, "10-00-05-00002.jpg");

        let orchestrator = build(&dir, now, true);
        let first = orchestrator.run_cycle().await;
        assert_eq!(first.promoted, 2);
        assert!(first.images_pending);
        assert!(!first.is_idle());

        let second = orchestrator.run_cycle().await;
        assert!(second.is_idle());
        assert!(dir.path().join("web/index.html").is_file());
    }

    #[tokio::test]
    async fn test_run_exits_when_idle_and_flushes_stats() {
        let dir = TempDir::new().unwrap();
        let now = future();
        let today = clock::format_date(now.date_naive());
        let yesterday = clock::format_date(now.date_naive() - Duration::days(1));
        drop_image(&dir, &yesterday, "10-00-00-00001.jpg");
        drop_image(&dir, &today, "09-00-00-00001.jpg");

        let summary = build(&dir, now, true).run(CancellationToken::new()).await;
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.promoted, 1);
        assert_eq!(summary.today_promoted, 1);
        assert!(summary.today_passes >= 1);
        assert!(summary.stats_passes >= 1);

        let stats_file = dir.path().join("stats").join(format!("{}_camera1.csv", today));
        assert!(stats_file.is_file());
    }

    #[tokio::test]
    async fn test_daemon_mode_runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let orchestrator = build(&dir, future(), false);
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(StdDuration::from_secs(10), orchestrator.run(shutdown))
            .await
            .expect("orchestrator should stop on cancel");
        assert!(summary.cycles >= 2);
        assert_eq!(summary.promoted, 0);
    }

    #[tokio::test]
    async fn test_expired_dates_are_purged_not_promoted() {
        let dir = TempDir::new().unwrap();
        let now = future();
        let old: NaiveDate = now.date_naive() - Duration::days(10);
        drop_image(&dir, &clock::format_date(old), "10-00-00-00001.jpg");

        let report = build(&dir, now, true).run_cycle().await;
        assert_eq!(report.promoted, 0);
        assert_eq!(report.purged, 1);
        assert!(!dir.path().join("web").join(clock::format_date(old)).exists());
    }

    #[tokio::test]
    async fn test_purge_waits_for_in_flight_promotion() {
        let dir = TempDir::new().unwrap();
        let now = future();
        let old = now.date_naive() - Duration::days(10);
        drop_image(&dir, &clock::format_date(old), "10-00-00-00001.jpg");

        let orchestrator = build(&dir, now, true);
        let claims = orchestrator.shared.pipeline.claims();
        let promoting = claims.claim_file(old, "camera1", "10-00-00-00001.jpg").unwrap();

        let report = orchestrator.run_cycle().await;
        assert_eq!(report.purged, 0);
        assert!(!report.is_idle());
        assert!(dir.path().join("incoming").join(clock::format_date(old)).is_dir());

        drop(promoting);
        let report = orchestrator.run_cycle().await;
        assert_eq!(report.purged, 1);
        assert!(!dir.path().join("incoming").join(clock::format_date(old)).exists());
    }
}
