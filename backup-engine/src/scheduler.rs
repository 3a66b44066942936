//! Periodic backups.
//!
//! Due times are recomputed from the backups on disk on every pass: the
//! next run of a schedule is its newest valid backup plus the interval, or
//! now when the category has no backup yet. Restarting the process therefore
//! neither loses nor replays runs, and missed ticks are not caught up.

use crate::config::ScheduleConfig;
use crate::engine::BackupEngine;
use crate::models::BackupCategory;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on one sleep, so backups added or removed by other processes are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(300);

/// Wait before retrying a schedule whose run failed.
const RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct Scheduler {
    engine: Arc<BackupEngine>,
    schedules: Vec<ScheduleConfig>,
}

impl Scheduler {
    pub fn new(engine: Arc<BackupEngine>, schedules: Vec<ScheduleConfig>) -> Self {
        Self { engine, schedules }
    }

    /// When `schedule` should run next, as seen at `now`.
    ///
    /// A category without any backup is due at `now`.
    pub async fn next_due(
        &self,
        schedule: &ScheduleConfig,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(schedule.interval())
            .map_err(|e| EngineError::Config(format!("schedule interval: {}", e)))?;

        Ok(match self.engine.newest_backup(schedule.category).await? {
            Some(newest) => newest.timestamp + interval,
            None => now,
        })
    }

    /// Run every schedule that is due at `now`. Returns the categories that were
    /// attempted with their outcome, and the earliest time anything is due next.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        retry_after: &mut HashMap<BackupCategory, DateTime<Utc>>,
    ) -> (Vec<(BackupCategory, Result<String>)>, DateTime<Utc>) {
        let retry = chrono::Duration::from_std(RETRY_DELAY)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut attempted = Vec::new();
        let mut next_wake = now + chrono::Duration::seconds(MAX_SLEEP.as_secs() as i64);

        for schedule in &self.schedules {
            let category = schedule.category;
            let mut due = match self.next_due(schedule, now).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::error!(category = %category, error = %e, "Cannot compute next due time");
                    now + retry
                }
            };
            if let Some(blocked_until) = retry_after.get(&category) {
                due = due.max(*blocked_until);
            }

            if due <= now {
                tracing::info!(category = %category, "Starting scheduled backup");
                match self.engine.create_backup(category, None).await {
                    Ok(summary) => {
                        retry_after.remove(&category);
                        due = summary.timestamp
                            + chrono::Duration::from_std(schedule.interval())
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        attempted.push((category, Ok(summary.backup_id)));
                    }
                    Err(EngineError::AlreadyRunning(_)) => {
                        tracing::warn!(category = %category, "Skipping scheduled run: backup already running");
                        due = now + retry;
                    }
                    Err(e) => {
                        tracing::error!(category = %category, error = %e, "Scheduled backup failed");
                        retry_after.insert(category, now + retry);
                        due = now + retry;
                        attempted.push((category, Err(e)));
                    }
                }
            }

            next_wake = next_wake.min(due);
        }

        (attempted, next_wake)
    }

    /// Drive the schedules until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(count = self.schedules.len(), "Scheduler started");
        let mut retry_after = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (_, next_wake) = self.tick(Utc::now(), &mut retry_after).await;
            let sleep = (next_wake - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(MAX_SLEEP)
                .max(Duration::from_millis(100));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }

        tracing::info!("Scheduler stopped");
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
