//! # Update Scheduler
//!
//! Decides when the next automatic wallpaper update is due and provides the
//! one-shot timer the manager arms for it.
//!
//! ## Timer Behavior
//! - `due = last successful update (or now) + frequency interval`
//! - Never earlier than 60 seconds from now, so startup doesn't change the wallpaper immediately
//! - Never earlier than 5 minutes after the last attempt, so failures can't loop tightly
//! - Exactly one pending timer; each completed run arms the next one

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;

use crate::config::ChangeFrequency;

/// Minimum delay between now and the next automatic update (seconds).
pub const MINIMUM_LEAD_TIME_SECS: i64 = 60;

/// Minimum delay between two attempts (seconds).
pub const MINIMUM_RETRY_DELAY_SECS: i64 = 300;

/// Computes when the next automatic update should run.
///
/// Returns `None` when nothing should be scheduled: the frequency is
/// [`ChangeFrequency::Never`] or no album is selected.
pub fn next_due_time(
    now: DateTime<Utc>,
    frequency: ChangeFrequency,
    album_selected: bool,
    last_successful_update: Option<DateTime<Utc>>,
    last_attempt: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let interval = frequency.interval()?;
    if !album_selected {
        return None;
    }

    let mut due = last_successful_update.unwrap_or(now) + interval;
    due = due.max(now + Duration::seconds(MINIMUM_LEAD_TIME_SECS));
    if let Some(attempt) = last_attempt {
        due = due.max(attempt + Duration::seconds(MINIMUM_RETRY_DELAY_SECS));
    }
    Some(due)
}

/// How long to sleep until `due`, at least one second.
pub fn timer_delay(now: DateTime<Utc>, due: DateTime<Utc>) -> std::time::Duration {
    (due - now)
        .to_std()
        .unwrap_or_default()
        .max(std::time::Duration::from_secs(1))
}

/// A pending one-shot timer.
///
/// Dropping it disarms it. The generation lets the owner recognise a fire
/// that was already queued when the timer was replaced.
#[derive(Debug)]
pub struct OneShotTimer {
    generation: u64,
    due: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl OneShotTimer {
    /// Spawns a task that calls `on_fire` once after `delay`.
    pub fn arm<F>(generation: u64, due: DateTime<Utc>, delay: std::time::Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire();
        });
        Self { generation, due, handle }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn due(&self) -> DateTime<Utc> {
        self.due
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
