//! Cooperative task scheduler over `schedule_settings` rows.
//!
//! One loop, one tick: claim due tasks atomically (`is_running` flips in
//! SQL), run them with an optional timeout, always clear `is_running` and
//! recompute `next_run` on completion, success or not. A periodic sweep
//! force-clears rows stuck in `is_running` past the deadline. Ad hoc runs
//! queued through the API drain from `task_queue` on the same tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dbqueue::DbQueue;
use crate::models::ScheduleSetting;
use crate::store;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub stuck_hours: i64,
    /// Global task timeout; zero disables it.
    pub default_task_timeout: Duration,
}

/// What the scheduler drives; the orchestrator implements this.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        task_name: &str,
        task_config: serde_json::Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Deterministic next-run computation in the task's own timezone.
/// `weekdays` uses ISO numbering (1 = Monday); empty means every day.
pub fn compute_next_run(
    schedule_type: &str,
    hour: u32,
    minute: u32,
    weekdays: &[u32],
    timezone: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let tz: Tz = timezone.parse().ok()?;
    let local_now = now.with_timezone(&tz);
    let allowed = |weekday: chrono::Weekday| {
        weekdays.is_empty() || weekdays.contains(&weekday.number_from_monday())
    };

    match schedule_type {
        "daily" => {
            let today = local_now.date_naive();
            for offset in 0..14i64 {
                let date = today + chrono::Duration::days(offset);
                if !allowed(date.weekday()) {
                    continue;
                }
                let naive = date.and_hms_opt(hour, minute, 0)?;
                // Spring-forward gaps skip to the next day.
                if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
                    if candidate > local_now {
                        return Some(candidate.with_timezone(&Utc));
                    }
                }
            }
            None
        }
        "hourly" => {
            let base = local_now
                .date_naive()
                .and_hms_opt(local_now.hour(), minute, 0)?;
            for offset in 0..=(7 * 24) {
                let naive = base + chrono::Duration::hours(offset);
                if !allowed(naive.date().weekday()) {
                    continue;
                }
                if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
                    if candidate > local_now {
                        return Some(candidate.with_timezone(&Utc));
                    }
                }
            }
            None
        }
        other => {
            warn!(schedule_type = other, "unknown schedule type");
            None
        }
    }
}

fn next_run_for(setting: &ScheduleSetting, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    compute_next_run(
        &setting.schedule_type,
        setting.hour.clamp(0, 23) as u32,
        setting.minute.clamp(0, 59) as u32,
        &setting.weekdays_list(),
        &setting.timezone,
        now,
    )
}

pub struct Scheduler {
    queue: Arc<DbQueue>,
    config: SchedulerConfig,
    runner: Arc<dyn TaskRunner>,
}

impl Scheduler {
    pub fn new(queue: Arc<DbQueue>, config: SchedulerConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            queue,
            config,
            runner,
        }
    }

    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("scheduler started");
        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
            tick += 1;

            if tick % 10 == 0 {
                self.sweep_stuck().await;
            }

            if let Err(e) = self.tick(&cancel).await {
                error!(error = %e, "scheduler tick failed");
            }
            if let Err(e) = self.drain_ad_hoc(&cancel).await {
                error!(error = %e, "ad hoc task drain failed");
            }
        }
    }

    async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let settings = self
            .queue
            .read(|pool| Box::pin(async move { store::get_enabled_schedule_settings(&pool).await }))
            .await?;
        let now = Utc::now();

        for setting in settings {
            // Initialize next_run for fresh rows instead of firing
            // immediately.
            let next_run = match setting.next_run {
                Some(next) => next,
                None => {
                    let computed = next_run_for(&setting, now);
                    let id = setting.id;
                    self.queue
                        .write(
                            "schedule_settings",
                            Arc::new(move |conn| {
                                Box::pin(async move { store::finish_task(conn, id, computed).await })
                            }),
                        )
                        .await?;
                    continue;
                }
            };

            if setting.is_running || now < next_run {
                continue;
            }

            let id = setting.id;
            let claimed = self
                .queue
                .write_returning("schedule_settings", move |conn| {
                    Box::pin(async move { store::mark_task_running(conn, id).await })
                })
                .await?;
            if !claimed {
                debug!(task = %setting.task_name, "task already running, skipping");
                continue;
            }

            info!(task = %setting.task_name, "scheduled task starting");
            self.spawn_task(setting, cancel.clone());
        }
        Ok(())
    }

    fn spawn_task(&self, setting: ScheduleSetting, cancel: CancellationToken) {
        let runner = self.runner.clone();
        let queue = self.queue.clone();
        let timeout = task_timeout(&setting, self.config.default_task_timeout);

        tokio::spawn(async move {
            let task_cancel = cancel.child_token();
            let name = setting.task_name.clone();
            let work = runner.run(&name, setting.task_config_json(), task_cancel.clone());

            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_) => {
                        task_cancel.cancel();
                        Err(anyhow::anyhow!("task timed out after {}s", limit.as_secs()))
                    }
                },
                None => work.await,
            };

            match &result {
                Ok(()) => info!(task = %name, "scheduled task completed"),
                Err(e) => error!(task = %name, error = %e, "scheduled task failed"),
            }

            // is_running clears and next_run recomputes whatever happened.
            let next = next_run_for(&setting, Utc::now());
            let id = setting.id;
            let finish = queue
                .write(
                    "schedule_settings",
                    Arc::new(move |conn| {
                        Box::pin(async move { store::finish_task(conn, id, next).await })
                    }),
                )
                .await;
            if let Err(e) = finish {
                error!(task = %name, error = %e, "failed to finalize task schedule");
            }
        });
    }

    async fn sweep_stuck(&self) {
        let stuck_before = Utc::now() - chrono::Duration::hours(self.config.stuck_hours);
        let result = self
            .queue
            .write_returning("schedule_settings", move |conn| {
                Box::pin(async move { store::clear_stuck_tasks(conn, stuck_before).await })
            })
            .await;
        match result {
            Ok(0) => {}
            Ok(cleared) => warn!(cleared, "force-cleared stuck scheduler tasks"),
            Err(e) => error!(error = %e, "stuck task sweep failed"),
        }
    }

    /// One queued ad hoc run per tick, claimed atomically.
    async fn drain_ad_hoc(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let task = self
            .queue
            .write_returning("task_queue", |conn| {
                Box::pin(async move { store::claim_pending_task(conn).await })
            })
            .await?;
        let Some(task) = task else { return Ok(()) };

        info!(task_id = task.id, task_type = %task.task_type, "running ad hoc task");
        let result = self
            .runner
            .run(&task.task_type, serde_json::json!({}), cancel.child_token())
            .await;

        let id = task.id;
        match result {
            Ok(()) => {
                self.queue
                    .write(
                        "task_queue",
                        Arc::new(move |conn| {
                            Box::pin(async move { store::complete_task(conn, id).await })
                        }),
                    )
                    .await?;
            }
            Err(e) => {
                let message = e.to_string();
                self.queue
                    .write(
                        "task_queue",
                        Arc::new(move |conn| {
                            let message = message.clone();
                            Box::pin(async move { store::fail_task(conn, id, &message).await })
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

fn task_timeout(setting: &ScheduleSetting, default: Duration) -> Option<Duration> {
    let per_task = setting
        .task_config_json()
        .get("timeout_seconds")
        .and_then(|v| v.as_u64());
    match per_task {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None if default.is_zero() => None,
        None => Some(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_schedules_today_when_time_is_ahead() {
        // 08:00 UTC = 09:00 Belgrade (CET, winter).
        let now = at(2025, 1, 15, 7, 0);
        let next = compute_next_run("daily", 9, 0, &[], "Europe/Belgrade", now).unwrap();
        assert_eq!(next, at(2025, 1, 15, 8, 0));
    }

    #[test]
    fn daily_rolls_to_tomorrow_when_time_passed() {
        let now = at(2025, 1, 15, 9, 30);
        let next = compute_next_run("daily", 9, 0, &[], "Europe/Belgrade", now).unwrap();
        assert_eq!(next, at(2025, 1, 16, 8, 0));
    }

    #[test]
    fn daily_respects_weekday_subset() {
        // 2025-01-15 is a Wednesday; only Friday (5) allowed.
        let now = at(2025, 1, 15, 12, 0);
        let next = compute_next_run("daily", 9, 0, &[5], "UTC", now).unwrap();
        assert_eq!(next, at(2025, 1, 17, 9, 0));
    }

    #[test]
    fn hourly_fires_at_configured_minute() {
        let now = at(2025, 1, 15, 10, 20);
        let next = compute_next_run("hourly", 0, 30, &[], "UTC", now).unwrap();
        assert_eq!(next, at(2025, 1, 15, 10, 30));

        let now = at(2025, 1, 15, 10, 45);
        let next = compute_next_run("hourly", 0, 30, &[], "UTC", now).unwrap();
        assert_eq!(next, at(2025, 1, 15, 11, 30));
    }

    #[test]
    fn hourly_skips_disallowed_days() {
        // Wednesday 23:45, only Thursday (4) allowed.
        let now = at(2025, 1, 15, 23, 45);
        let next = compute_next_run("hourly", 0, 15, &[4], "UTC", now).unwrap();
        assert_eq!(next, at(2025, 1, 16, 0, 15));
    }

    #[test]
    fn unknown_schedule_type_yields_none() {
        let now = at(2025, 1, 15, 0, 0);
        assert!(compute_next_run("weekly", 9, 0, &[], "UTC", now).is_none());
    }

    #[test]
    fn computation_is_deterministic() {
        let now = at(2025, 6, 1, 12, 0);
        let a = compute_next_run("daily", 20, 0, &[1, 2, 3, 4, 5], "Europe/Belgrade", now);
        let b = compute_next_run("daily", 20, 0, &[1, 2, 3, 4, 5], "Europe/Belgrade", now);
        assert_eq!(a, b);
    }

    fn setting_with(config: &str) -> ScheduleSetting {
        ScheduleSetting {
            id: 1,
            task_name: "news_digest".into(),
            enabled: true,
            schedule_type: "daily".into(),
            hour: 9,
            minute: 0,
            weekdays: "[]".into(),
            timezone: "UTC".into(),
            last_run: None,
            next_run: None,
            is_running: false,
            task_config: config.into(),
        }
    }

    #[test]
    fn zero_timeout_disables() {
        let setting = setting_with(r#"{"timeout_seconds": 0}"#);
        assert_eq!(task_timeout(&setting, Duration::from_secs(300)), None);
    }

    #[test]
    fn per_task_timeout_overrides_global() {
        let setting = setting_with(r#"{"timeout_seconds": 42}"#);
        assert_eq!(
            task_timeout(&setting, Duration::from_secs(300)),
            Some(Duration::from_secs(42))
        );
    }

    #[test]
    fn global_timeout_applies_when_unset() {
        let setting = setting_with("{}");
        assert_eq!(
            task_timeout(&setting, Duration::from_secs(300)),
            Some(Duration::from_secs(300))
        );
        assert_eq!(task_timeout(&setting, Duration::ZERO), None);
    }
}
