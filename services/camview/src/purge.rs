//! Retention: whole date directories past the window are deleted from both
//! the incoming tree and web storage, whether or not they were promoted.
//!
//! A date still being promoted is left for the next pass, and a directory
//! that cannot be removed is logged and skipped.

use crate::claims::Claims;
use crate::clock::{self, Clock};
use crate::scanner::{self, ScanError};
use crate::storage::{StorageError, WebStorage};
use chrono::NaiveDate;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Cannot remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of one purge pass, counted in date directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub incoming: usize,
    pub storage: usize,
    /// Expired but still claimed by a promotion
    pub deferred: usize,
    pub failed: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.incoming + self.storage
    }

    fn absorb(&mut self, side: SideReport) -> usize {
        self.deferred += side.deferred;
        self.failed += side.failed;
        side.removed
    }
}

/// Per-side tally.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SideReport {
    pub removed: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct PurgeManager {
    incoming_root: PathBuf,
    storage: Arc<WebStorage>,
    storage_root: String,
    retain_days: u32,
    clock: Arc<dyn Clock>,
    claims: Arc<Claims>,
}

impl PurgeManager {
    pub fn new(
        incoming_root: impl Into<PathBuf>,
        storage: Arc<WebStorage>,
        storage_root: impl Into<String>,
        retain_days: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            incoming_root: incoming_root.into(),
            storage,
            storage_root: storage_root.into(),
            retain_days,
            clock,
            claims: Arc::new(Claims::new()),
        }
    }

    /// Share the claim set of the promotion pipeline so a date is never
    /// removed under a running promotion.
    pub fn with_claims(mut self, claims: Arc<Claims>) -> Self {
        self.claims = claims;
        self
    }

    /// Oldest date that survives a purge run now.
    pub fn oldest_kept(&self) -> NaiveDate {
        clock::oldest_retained(self.clock.today(), self.retain_days)
    }

    /// Purge both trees. A failure on one side does not stop the other.
    #[instrument(skip(self), fields(retain_days = self.retain_days))]
    pub async fn purge(&self) -> PurgeReport {
        let oldest_kept = self.oldest_kept();
        let mut report = PurgeReport::default();

        match self.purge_incoming(oldest_kept).await {
            Ok(side) => report.incoming = report.absorb(side),
            Err(e) => warn!(error = %e, "Incoming purge incomplete"),
        }
        match self.purge_storage(oldest_kept).await {
            Ok(side) => report.storage = report.absorb(side),
            Err(e) => warn!(error = %e, "Web storage purge incomplete"),
        }

        if report.total() > 0 {
            metrics::counter!("camview.purge.directories").increment(report.total() as u64);
            info!(
                incoming = report.incoming,
                storage = report.storage,
                oldest_kept = %clock::format_date(oldest_kept),
                "Purged expired dates"
            );
        }
        if report.failed > 0 {
            metrics::counter!("camview.purge.failures").increment(report.failed as u64);
        }
        report
    }

    pub async fn purge_incoming(&self, oldest_kept: NaiveDate) -> Result<SideReport, PurgeError> {
        let dates = match scanner::list_date_dirs(&self.incoming_root) {
            Ok(dates) => dates,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SideReport::default()),
            Err(source) => {
                return Err(ScanError {
                    path: self.incoming_root.clone(),
                    source,
                }
                .into())
            }
        };

        let mut side = SideReport::default();
        for (date, path) in dates.into_iter().filter(|(d, _)| *d < oldest_kept) {
            let Some(_claim) = self.claims.claim_date(date) else {
                debug!(date = %clock::format_date(date), "Date still being promoted, purge deferred");
                side.deferred += 1;
                continue;
            };
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(date = %clock::format_date(date), "Removed incoming date");
                    side.removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => {
                    let e = PurgeError::Remove { path, source };
                    warn!(error = %e, "Skipping incoming date");
                    side.failed += 1;
                }
            }
        }
        Ok(side)
    }

    pub async fn purge_storage(&self, oldest_kept: NaiveDate) -> Result<SideReport, PurgeError> {
        let mut expired: Vec<(NaiveDate, String)> = self
            .storage
            .listdir(&self.storage_root)
            .await?
            .into_iter()
            .filter_map(|name| clock::parse_date(&name).map(|d| (d, name)))
            .filter(|(d, _)| *d < oldest_kept)
            .collect();
        expired.sort();

        let mut side = SideReport::default();
        for (date, name) in &expired {
            let Some(_claim) = self.claims.claim_date(*date) else {
                debug!(date = %name, "Date still being promoted, purge deferred");
                side.deferred += 1;
                continue;
            };
            let path = self.storage.path_join(&[&self.storage_root, name])?;
            match self.storage.rmtree(&path).await {
                Ok(true) => {
                    info!(date = %name, "Removed published date");
                    side.removed += 1;
                }
                // a stray file named like a date
                Ok(false) => {}
                Err(e) => {
                    warn!(date = %name, error = %e, "Skipping published date");
                    side.failed += 1;
                }
            }
        }
        Ok(side)
    }
}
