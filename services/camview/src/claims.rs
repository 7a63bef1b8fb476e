//! Work claims shared by promotion and purge.
//!
//! Promotion claims one file at a time; purge claims a whole date. A date
//! cannot be claimed while any of its files is, and files of a date being
//! purged cannot be claimed.

use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

type FileKey = (NaiveDate, String, String);

#[derive(Default)]
struct State {
    files: HashSet<FileKey>,
    // live file claims per date
    per_date: HashMap<NaiveDate, usize>,
    purging: HashSet<NaiveDate>,
}

#[derive(Default)]
pub struct Claims {
    state: Mutex<State>,
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim one raw image. `None` if it is already claimed or its date is
    /// being purged.
    pub fn claim_file(&self, date: NaiveDate, camera: &str, filename: &str) -> Option<FileClaim<'_>> {
        let key = (date, camera.to_string(), filename.to_string());
        let mut state = self.state.lock();
        if state.purging.contains(&date) || state.files.contains(&key) {
            return None;
        }
        state.files.insert(key.clone());
        *state.per_date.entry(date).or_default() += 1;
        Some(FileClaim { claims: self, key })
    }

    /// Claim a whole date for removal. `None` while any file of it is claimed.
    pub fn claim_date(&self, date: NaiveDate) -> Option<DateClaim<'_>> {
        let mut state = self.state.lock();
        if state.per_date.contains_key(&date) || !state.purging.insert(date) {
            return None;
        }
        Some(DateClaim { claims: self, date })
    }

    pub fn is_busy(&self, date: NaiveDate) -> bool {
        let state = self.state.lock();
        state.per_date.contains_key(&date) || state.purging.contains(&date)
    }
}

pub struct FileClaim<'a> {
    claims: &'a Claims,
    key: FileKey,
}

impl Drop for FileClaim<'_> {
    fn drop(&mut self) {
        let mut state = self.claims.state.lock();
        state.files.remove(&self.key);
        if let Some(n) = state.per_date.get_mut(&self.key.0) {
            *n -= 1;
            if *n == 0 {
                state.per_date.remove(&self.key.0);
            }
        }
    }
}

pub struct DateClaim<'a> {
    claims: &'a Claims,
    date: NaiveDate,
}

impl Drop for DateClaim<'_> {
    fn drop(&mut self) {
        self.claims.state.lock().purging.remove(&self.date);
    }
}
