//! Promotion of raw captures into published web artifacts.
//!
//! Each ready image becomes four published files under
//! `<date>/<camera>/{hires,mediumres,thumbnails,html}`. Artifacts are staged
//! in a private work directory first and then moved into web storage one by
//! one; if any move fails, the ones already published and whatever the
//! failed move left behind are removed again, and the raw file is kept for
//! the next cycle.

use crate::camera::{self, Camera};
use crate::claims::{Claims, FileClaim};
use crate::clock::{self, Clock};
use crate::codec::DerivativeCodec;
use crate::pages;
use crate::scanner::{self, ScanEntry};
use crate::stats::{PromotionEvent, StatsEngine};
use crate::storage::{StorageError, WebStorage};
use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

/// One published rendition of a raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Hires,
    Medium,
    Thumbnail,
    Html,
}

impl Artifact {
    /// Publication order. The detail page goes last so it never links to
    /// images that are not there yet.
    pub const ALL: [Artifact; 4] = [
        Artifact::Hires,
        Artifact::Medium,
        Artifact::Thumbnail,
        Artifact::Html,
    ];

    /// Directory under `<date>/<camera>`.
    pub fn dir(self) -> &'static str {
        match self {
            Artifact::Hires => "hires",
            Artifact::Medium => "mediumres",
            Artifact::Thumbnail => "thumbnails",
            Artifact::Html => "html",
        }
    }

    /// Published file name for the raw image `filename`.
    pub fn file_name(self, filename: &str) -> String {
        let stem = stem(filename);
        match self {
            Artifact::Hires => filename.to_string(),
            Artifact::Medium => format!("{}_medium.jpg", stem),
            Artifact::Thumbnail => format!("{}_thumb.jpg", stem),
            Artifact::Html => format!("{}.html", stem),
        }
    }
}

fn stem(filename: &str) -> &str {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => filename,
    }
}

/// Time of day encoded in a capture name such as `12-00-01-00001.jpg`.
pub fn capture_time_of_day(filename: &str) -> Option<NaiveTime> {
    let prefix = filename.get(..8)?;
    NaiveTime::parse_from_str(prefix, "%H-%M-%S").ok()
}

/// Capture instant of a scanned image: its date directory plus the time in
/// its name, or its modification time when the name carries none.
pub fn capture_time(entry: &ScanEntry) -> DateTime<Local> {
    match capture_time_of_day(&entry.filename) {
        Some(t) => clock::local_datetime(entry.date.and_time(t)),
        None => entry.modified,
    }
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("Cannot stage {path}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot publish {dest}: {source}")]
    Publish {
        dest: String,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Derivative task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoteOutcome {
    Promoted,
    /// Still inside the aging threshold
    NotReady,
    /// Claimed by another loop, or already gone
    Skipped,
}

pub struct PromotionPipeline {
    storage: Arc<WebStorage>,
    storage_root: String,
    work_dir: PathBuf,
    site_name: String,
    cameras: Vec<Camera>,
    codec: Arc<dyn DerivativeCodec>,
    stats: Arc<StatsEngine>,
    clock: Arc<dyn Clock>,
    claims: Arc<Claims>,
    page_seq: AtomicU64,
    // listings are rebuilt one at a time so the last writer sees every image
    listing_lock: tokio::sync::Mutex<()>,
}

impl PromotionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<WebStorage>,
        storage_root: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        site_name: impl Into<String>,
        cameras: Vec<Camera>,
        codec: Arc<dyn DerivativeCodec>,
        stats: Arc<StatsEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            storage_root: storage_root.into(),
            work_dir: work_dir.into(),
            site_name: site_name.into(),
            cameras,
            codec,
            stats,
            clock,
            claims: Arc::new(Claims::new()),
            page_seq: AtomicU64::new(0),
            listing_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Claims held by in-flight promotions; purge takes date claims here.
    pub fn claims(&self) -> Arc<Claims> {
        self.claims.clone()
    }

    pub fn cameras(&self) -> &[Camera] {
        &self.cameras
    }

    fn camera(&self, shortname: &str) -> Camera {
        camera::find(&self.cameras, shortname)
            .cloned()
            .unwrap_or_else(|| Camera::unconfigured(shortname))
    }

    fn web_path(&self, segments: &[&str]) -> String {
        let mut all = Vec::with_capacity(segments.len() + 1);
        all.push(self.storage_root.as_str());
        all.extend_from_slice(segments);
        crate::storage::path_join(&all)
    }

    pub(crate) fn claim(&self, entry: &ScanEntry) -> Option<FileClaim<'_>> {
        self.claims.claim_file(entry.date, &entry.camera, &entry.filename)
    }

    /// Promote one scanned image.
    #[instrument(skip(self, entry), fields(date = %entry.date, camera = %entry.camera, file = %entry.filename))]
    pub async fn promote(&self, entry: &ScanEntry) -> Result<PromoteOutcome, PromotionError> {
        if !entry.ready {
            metrics::counter!("camview.images.not_ready").increment(1);
            return Ok(PromoteOutcome::NotReady);
        }

        let Some(_claim) = self.claim(entry) else {
            debug!("Already being promoted, or its date is being purged");
            return Ok(PromoteOutcome::Skipped);
        };
        if fs::metadata(&entry.path).await.is_err() {
            debug!("Source vanished before promotion");
            return Ok(PromoteOutcome::Skipped);
        }

        let started = Instant::now();
        let camera = self.camera(&entry.camera);
        let date = clock::format_date(entry.date);
        let staging = self
            .work_dir
            .join(&date)
            .join(&entry.camera)
            .join(stem(&entry.filename));

        let result = self.stage_and_publish(entry, &camera, &staging).await;
        if let Err(e) = fs::remove_dir_all(&staging).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %staging.display(), error = %e, "Cannot remove staging directory");
            }
        }
        if let Err(e) = result {
            metrics::counter!("camview.images.failed").increment(1);
            return Err(e);
        }

        fs::remove_file(&entry.path)
            .await
            .map_err(|source| PromotionError::Stage {
                path: entry.path.clone(),
                source,
            })?;

        if let Err(e) = self.publish_listing(entry.date, &camera).await {
            warn!(error = %e, "Listing pages not regenerated");
        }

        self.stats.record_event(&PromotionEvent {
            camera: entry.camera.clone(),
            capture: capture_time(entry),
            upload: entry.modified,
            completion: self.clock.now(),
        });

        metrics::counter!("camview.images.promoted").increment(1);
        metrics::histogram!("camview.promotion.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        debug!("Promoted image");
        Ok(PromoteOutcome::Promoted)
    }

    async fn stage_and_publish(
        &self,
        entry: &ScanEntry,
        camera: &Camera,
        staging: &Path,
    ) -> Result<(), PromotionError> {
        let stage_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PromotionError::Stage { path, source }
        };

        fs::create_dir_all(staging).await.map_err(stage_err(staging))?;
        let staged = |artifact: Artifact| staging.join(artifact.file_name(&entry.filename));

        let hires = staged(Artifact::Hires);
        fs::copy(&entry.path, &hires).await.map_err(stage_err(&hires))?;

        let medium = staged(Artifact::Medium);
        let thumbnail = staged(Artifact::Thumbnail);
        let rendered = {
            let codec = self.codec.clone();
            let (source, medium, thumbnail) = (hires.clone(), medium.clone(), thumbnail.clone());
            let crop = camera.crop.clone();
            tokio::task::spawn_blocking(move || {
                codec.render(&source, crop.as_ref(), &medium, &thumbnail)
            })
            .await
            .map_err(|e| PromotionError::Task(e.to_string()))?
        };
        if let Err(e) = rendered {
            warn!(error = %e, "Derivatives unavailable, publishing source bytes instead");
            fs::copy(&hires, &medium).await.map_err(stage_err(&medium))?;
            fs::copy(&hires, &thumbnail).await.map_err(stage_err(&thumbnail))?;
        }

        let html = staged(Artifact::Html);
        fs::write(&html, pages::detail_page(camera, entry.date, &entry.filename))
            .await
            .map_err(stage_err(&html))?;

        let date = clock::format_date(entry.date);
        let mut dirs = vec![
            self.storage_root.clone(),
            self.web_path(&[&date]),
            self.web_path(&[&date, &entry.camera]),
        ];
        dirs.extend(
            Artifact::ALL
                .iter()
                .map(|a| self.web_path(&[&date, &entry.camera, a.dir()])),
        );
        for dir in &dirs {
            self.storage.mkdir(dir).await?;
        }

        let mut published = Vec::with_capacity(Artifact::ALL.len());
        for artifact in Artifact::ALL {
            let dest = self.web_path(&[
                &date,
                &entry.camera,
                artifact.dir(),
                &artifact.file_name(&entry.filename),
            ]);
            if let Err(source) = self.storage.move_to_web(&staged(artifact), &dest).await {
                // a failed move may still have left bytes at its destination
                published.push(dest.clone());
                self.roll_back(&published).await;
                return Err(PromotionError::Publish { dest, source });
            }
            published.push(dest);
        }
        Ok(())
    }

    async fn roll_back(&self, published: &[String]) {
        for dest in published {
            if let Err(e) = self.storage.remove_file(dest).await {
                warn!(dest = %dest, error = %e, "Cannot remove partially published artifact");
            }
        }
    }

    /// Write `contents` to a fresh file in the work directory.
    async fn stage_page(&self, contents: String) -> Result<PathBuf, PromotionError> {
        let dir = self.work_dir.join(".pages");
        let stage_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PromotionError::Stage { path, source }
        };
        fs::create_dir_all(&dir).await.map_err(stage_err(&dir))?;

        let seq = self.page_seq.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("page-{}.html", seq));
        fs::write(&path, contents).await.map_err(stage_err(&path))?;
        Ok(path)
    }

    async fn publish_page(&self, contents: String, dest: String) -> Result<(), PromotionError> {
        let staged = self.stage_page(contents).await?;
        let result = self.storage.move_to_web(&staged, &dest).await;
        if result.is_err() {
            let _ = fs::remove_file(&staged).await;
        }
        result.map_err(|source| PromotionError::Publish { dest, source })
    }

    /// Regenerate both listing pages for one camera and date from what is
    /// currently published.
    pub async fn publish_listing(&self, date: NaiveDate, camera: &Camera) -> Result<(), PromotionError> {
        let _serialized = self.listing_lock.lock().await;
        let date_name = clock::format_date(date);
        let hires_dir = self.web_path(&[&date_name, &camera.shortname, Artifact::Hires.dir()]);
        let mut images: Vec<String> = self
            .storage
            .listdir(&hires_dir)
            .await?
            .into_iter()
            .filter(|name| scanner::is_image_name(name))
            .collect();
        images.sort();

        self.publish_page(
            pages::listing_page(camera, date, &images),
            self.web_path(&[&date_name, &camera.shortname, pages::INDEX_PAGE]),
        )
        .await?;
        self.publish_page(
            pages::hidden_listing_page(camera, date, &images),
            self.web_path(&[&date_name, &camera.shortname, pages::HIDDEN_INDEX_PAGE]),
        )
        .await
    }

    /// Regenerate the site index listing every published date and camera.
    pub async fn publish_root_index(&self) -> Result<(), PromotionError> {
        self.storage.mkdir(&self.storage_root).await?;

        let mut dates: Vec<NaiveDate> = self
            .storage
            .listdir(&self.storage_root)
            .await?
            .iter()
            .filter_map(|name| clock::parse_date(name))
            .collect();
        dates.sort();

        let mut listing = Vec::with_capacity(dates.len());
        for date in dates {
            let date_name = clock::format_date(date);
            let mut names = match self.storage.listdir(&self.web_path(&[&date_name])).await {
                Ok(names) => names,
                Err(e) => {
                    warn!(date = %date_name, error = %e, "Skipping unlistable date");
                    continue;
                }
            };
            names.retain(|n| !n.starts_with('.') && !n.ends_with(".html"));
            names.sort();
            listing.push((date, names.iter().map(|n| self.camera(n)).collect()));
        }

        let count = listing.len();
        self.publish_page(
            pages::root_index(&self.site_name, &listing),
            self.web_path(&[pages::INDEX_PAGE]),
        )
        .await?;
        info!(dates = count, "Published site index");
        Ok(())
    }
}
