//! Minute-of-day statistics table and its on-disk record format.

use chrono::Timelike;
use std::fmt::Write;

/// Rows per table: one per local clock minute.
pub const MINUTES_PER_DAY: usize = 24 * 60;

/// Columns per persisted record.
const COLUMNS: usize = 7;

/// Statistics for one minute of one camera's day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsRow {
    /// Images captured during this minute
    pub created: u32,
    /// Mean capture-to-upload latency in minutes of those images
    pub avg_upload_latency: f64,
    /// Images that became visible in the incoming tree during this minute
    pub uploaded: u32,
    /// Mean upload-to-published latency in minutes of those images
    pub avg_processing_latency: f64,
    /// Images whose promotion completed during this minute
    pub processed: u32,
    /// Raw images waiting in today's directory at this minute
    pub unprocessed_today: u32,
    /// Raw images waiting in yesterday's directory at this minute
    pub unprocessed_previous_day: u32,
}

/// Fold `value` into a running mean that now covers `count` samples.
pub fn fold_mean(avg: f64, count: u32, value: f64) -> f64 {
    avg + (value - avg) / f64::from(count)
}

impl StatsRow {
    pub fn record_created(&mut self, upload_latency: i64) {
        self.created += 1;
        self.avg_upload_latency =
            fold_mean(self.avg_upload_latency, self.created, upload_latency as f64);
    }

    pub fn record_uploaded(&mut self, processing_latency: i64) {
        self.uploaded += 1;
        self.avg_processing_latency = fold_mean(
            self.avg_processing_latency,
            self.uploaded,
            processing_latency as f64,
        );
    }

    pub fn record_processed(&mut self) {
        self.processed += 1;
    }

    fn write_record(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "{:>7},{:>24},{:>7},{:>24},{:>7},{:>7},{:>7}",
            self.created,
            self.avg_upload_latency,
            self.uploaded,
            self.avg_processing_latency,
            self.processed,
            self.unprocessed_today,
            self.unprocessed_previous_day
        );
    }

    fn parse_record(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != COLUMNS {
            return Err(format!("expected {} columns, found {}", COLUMNS, fields.len()));
        }

        let count = |i: usize| {
            fields[i]
                .parse::<u32>()
                .map_err(|e| format!("column {}: {}", i + 1, e))
        };
        let mean = |i: usize| {
            fields[i]
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| format!("column {}: invalid average {:?}", i + 1, fields[i]))
        };

        Ok(Self {
            created: count(0)?,
            avg_upload_latency: mean(1)?,
            uploaded: count(2)?,
            avg_processing_latency: mean(3)?,
            processed: count(4)?,
            unprocessed_today: count(5)?,
            unprocessed_previous_day: count(6)?,
        })
    }
}

/// One day of statistics for one camera, indexed by minute of day.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsTable {
    rows: Vec<StatsRow>,
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTable {
    /// All-zero table.
    pub fn new() -> Self {
        Self {
            rows: vec![StatsRow::default(); MINUTES_PER_DAY],
        }
    }

    /// Row for `minute` (0..1440). Out-of-range minutes are clamped.
    pub fn row(&self, minute: usize) -> &StatsRow {
        &self.rows[minute.min(MINUTES_PER_DAY - 1)]
    }

    pub fn row_mut(&mut self, minute: usize) -> &mut StatsRow {
        &mut self.rows[minute.min(MINUTES_PER_DAY - 1)]
    }

    pub fn rows(&self) -> &[StatsRow] {
        &self.rows
    }

    /// Serialize to 1,440 newline-terminated records in minute order.
    pub fn to_records(&self) -> String {
        let mut out = String::with_capacity(MINUTES_PER_DAY * 90);
        for row in &self.rows {
            row.write_record(&mut out);
        }
        out
    }

    /// Parse the output of [`StatsTable::to_records`].
    pub fn from_records(text: &str) -> Result<Self, String> {
        let rows = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| StatsRow::parse_record(line).map_err(|e| format!("record {}: {}", i + 1, e)))
            .collect::<Result<Vec<_>, _>>()?;

        if rows.len() != MINUTES_PER_DAY {
            return Err(format!(
                "expected {} records, found {}",
                MINUTES_PER_DAY,
                rows.len()
            ));
        }

        Ok(Self { rows })
    }
}

/// Table index for a local clock time.
pub fn minute_of_day<T: Timelike>(t: &T) -> usize {
    (t.hour() * 60 + t.minute()) as usize
}
