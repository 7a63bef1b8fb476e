use camview::clock::{self, FixedClock};
use camview::config::DerivativeConfig;
use camview::storage::{Backend, LocalStorage};
use camview::{
    Camera, Clock, ImageCodec, IntervalWaiter, Orchestrator, OrchestratorSettings,
    PromotionPipeline, PurgeManager, Scanner, StatsEngine, WebStorage,
};
use chrono::{DateTime, Duration, Local, NaiveDate};
use image::{ImageFormat, Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Site {
    dir: TempDir,
    now: DateTime<Local>,
}

impl Site {
    fn new() -> Self {
        // a day ahead so every file written by the test is past the aging threshold
        let tomorrow = Local::now().date_naive() + Duration::days(1);
        let now = clock::local_datetime(tomorrow.and_hms_opt(12, 0, 0).unwrap());
        let dir = TempDir::new().unwrap();
        for sub in ["incoming", "web", "stats"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir, now }
    }

    fn incoming(&self) -> PathBuf {
        self.dir.path().join("incoming")
    }

    fn web(&self) -> PathBuf {
        self.dir.path().join("web")
    }

    fn date(&self, days_ago: i64) -> String {
        clock::format_date(self.today() - Duration::days(days_ago))
    }

    fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    fn drop_images(&self, date: &str, camera: &str, count: usize) {
        let dir = self.incoming().join(date).join(camera);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            let name = format!("10-{:02}-00-{:05}.jpg", i, i + 1);
            RgbImage::from_pixel(48, 32, Rgb([20, 40, (i * 20) as u8]))
                .save_with_format(dir.join(name), ImageFormat::Jpeg)
                .unwrap();
        }
    }

    fn orchestrator(&self, retain_days: u32) -> Orchestrator {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(self.now));
        let storage = Arc::new(WebStorage::with_backend(Backend::Local(LocalStorage::new())));
        let stats = Arc::new(StatsEngine::new(
            self.dir.path().join("stats"),
            self.incoming(),
            clock.clone(),
        ));
        let web_root = self.web().to_string_lossy().into_owned();

        let pipeline = PromotionPipeline::new(
            storage.clone(),
            web_root.clone(),
            self.dir.path().join("work"),
            "camview",
            vec![
                Camera::new("camera1", "North Lot"),
                Camera::new("camera2", "South Lot"),
            ],
            Arc::new(ImageCodec::new(&DerivativeConfig {
                medium_width: 24,
                thumbnail_width: 12,
                jpeg_quality: 75,
            })),
            stats.clone(),
            clock.clone(),
        );
        let purge = PurgeManager::new(self.incoming(), storage, web_root, retain_days, clock.clone());

        Orchestrator::new(
            Scanner::new(self.incoming(), std::time::Duration::from_secs(3600), clock.clone()),
            pipeline,
            purge,
            stats,
            clock,
            Arc::new(IntervalWaiter::new(std::time::Duration::from_millis(10))),
            OrchestratorSettings {
                retain_days,
                exit_when_idle: true,
                promotion_concurrency: 4,
            },
        )
    }
}

fn image_count(dir: &Path) -> usize {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".jpg"))
            .count(),
        Err(_) => 0,
    }
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn promotes_backlog_and_stops_when_idle() {
    let site = Site::new();
    for days_ago in [1, 2] {
        for camera in ["camera1", "camera2"] {
            site.drop_images(&site.date(days_ago), camera, 10);
        }
    }

    let summary = site.orchestrator(7).run(CancellationToken::new()).await;

    assert_eq!(summary.promoted, 40);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cycles, 2);

    for days_ago in [1, 2] {
        let date = site.date(days_ago);
        for camera in ["camera1", "camera2"] {
            assert_eq!(image_count(&site.incoming().join(&date).join(camera)), 0);

            let published = site.web().join(&date).join(camera);
            assert_eq!(image_count(&published.join("hires")), 10);
            assert_eq!(image_count(&published.join("mediumres")), 10);
            assert_eq!(image_count(&published.join("thumbnails")), 10);
            assert_eq!(fs::read_dir(published.join("html")).unwrap().count(), 10);
            assert!(published.join("hires/10-03-00-00004.jpg").is_file());
            assert!(published.join("mediumres/10-03-00-00004_medium.jpg").is_file());
            assert!(published.join("thumbnails/10-03-00-00004_thumb.jpg").is_file());
            assert!(published.join("html/10-03-00-00004.html").is_file());

            let listing = fs::read_to_string(published.join("index.html")).unwrap();
            assert_eq!(listing.matches("_thumb.jpg").count(), 10);
            assert!(published.join("index_hidden.html").is_file());
        }
    }

    let root = fs::read_to_string(site.web().join("index.html")).unwrap();
    assert!(root.contains(&format!("{}/camera2/index.html", site.date(2))));

    // capture-day statistics were flushed for every camera and date
    for days_ago in [1, 2] {
        for camera in ["camera1", "camera2"] {
            let stats = site
                .dir
                .path()
                .join("stats")
                .join(format!("{}_{}.csv", site.date(days_ago), camera));
            let text = fs::read_to_string(&stats).unwrap();
            assert_eq!(text.lines().count(), 1440);
        }
    }
}

#[tokio::test]
async fn purges_dates_outside_retention_window() {
    let site = Site::new();
    for days_ago in 0..6 {
        let date = site.date(days_ago);
        site.drop_images(&date, "camera1", 2);
        fs::create_dir_all(site.web().join(&date).join("camera1")).unwrap();
    }

    let summary = site.orchestrator(3).run(CancellationToken::new()).await;

    let kept: Vec<String> = (0..3).rev().map(|d| site.date(d)).collect();
    assert_eq!(dir_names(&site.incoming()), kept);
    assert_eq!(dir_names(&site.web()), kept);
    assert_eq!(summary.purged, 6);

    // dates inside the window were promoted, including today
    assert_eq!(summary.promoted, 4);
    assert_eq!(summary.today_promoted, 2);
    for d in 0..3 {
        let published = site.web().join(site.date(d)).join("camera1");
        assert_eq!(image_count(&published.join("hires")), 2);
        assert_eq!(image_count(&published.join("mediumres")), 2);
        assert_eq!(image_count(&published.join("thumbnails")), 2);
        assert_eq!(fs::read_dir(published.join("html")).unwrap().count(), 2);

        let listing = fs::read_to_string(published.join("index.html")).unwrap();
        assert_eq!(listing.matches("_thumb.jpg").count(), 2);
        assert!(published.join("index_hidden.html").is_file());
        assert_eq!(image_count(&site.incoming().join(site.date(d)).join("camera1")), 0);
    }

    // the site index lists only surviving dates
    let root = fs::read_to_string(site.web().join("index.html")).unwrap();
    assert!(root.contains(&format!("{}/camera1/index.html", site.date(2))));
    assert!(!root.contains(&site.date(3)));
}
