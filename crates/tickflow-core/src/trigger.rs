//! Cron trigger scheduling.
//!
//! Workflows with a `TriggerConfig::Cron` trigger are fired by a
//! `tokio-cron-scheduler` job. Schedules may be standard cron expressions
//! or a small set of human-readable phrases.

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Normalize a schedule string to a 6-field cron expression.
///
/// Supported human-readable patterns (case-insensitive):
/// - "every N seconds"     -> "*/N * * * * *"
/// - "every N minutes"     -> "0 */N * * * *"
/// - "every N hours"       -> "0 0 */N * * *"
/// - "every minute"        -> "0 * * * * *"
/// - "every hour" / "hourly" -> "0 0 * * * *"
/// - "every day" / "daily" -> "0 0 0 * * *"
/// - "every day at HH:MM"  -> "0 MM HH * * *"
///
/// A 5-field cron expression gets a seconds field prepended; a 6-field one
/// passes through. The result is validated with `croner`.
pub fn normalize_schedule(input: &str) -> Result<String, TriggerError> {
    let normalized = normalize_unchecked(input)?;
    normalized
        .parse::<croner::Cron>()
        .map_err(|e| TriggerError::InvalidSchedule(format!("'{input}': {e}")))?;
    Ok(normalized)
}

fn normalize_unchecked(input: &str) -> Result<String, TriggerError> {
    let trimmed = input.trim();

    let parts: Vec<&str> = trimmed.split_whitespace().collect();
    if parts.len() == 5 && parts.iter().all(|p| !p.chars().any(|c| c.is_alphabetic())) {
        // Standard 5-field cron, fire at second zero.
        return Ok(format!("0 {trimmed}"));
    }
    if parts.len() == 6 && parts.iter().all(|p| !p.chars().any(|c| c.is_alphabetic())) {
        return Ok(trimmed.to_string());
    }

    let lower = trimmed.to_lowercase();
    if lower == "every minute" || lower == "minutely" {
        return Ok("0 * * * * *".to_string());
    }
    if lower == "every hour" || lower == "hourly" {
        return Ok("0 0 * * * *".to_string());
    }
    if lower == "every day" || lower == "daily" {
        return Ok("0 0 0 * * *".to_string());
    }

    if let Some(rest) = lower.strip_prefix("every ") {
        if let Some(at_part) = rest.strip_prefix("day at ") {
            let time_parts: Vec<&str> = at_part.split(':').collect();
            if time_parts.len() == 2 {
                let hour: u32 = time_parts[0]
                    .trim()
                    .parse()
                    .map_err(|_| TriggerError::InvalidSchedule(input.to_string()))?;
                let minute: u32 = time_parts[1]
                    .trim()
                    .parse()
                    .map_err(|_| TriggerError::InvalidSchedule(input.to_string()))?;
                if hour < 24 && minute < 60 {
                    return Ok(format!("0 {minute} {hour} * * *"));
                }
            }
            return Err(TriggerError::InvalidSchedule(input.to_string()));
        }

        let words: Vec<&str> = rest.split_whitespace().collect();
        if words.len() == 2 {
            let n: u32 = words[0]
                .parse()
                .map_err(|_| TriggerError::InvalidSchedule(input.to_string()))?;
            if n == 0 {
                return Err(TriggerError::InvalidSchedule(
                    "interval must be > 0".to_string(),
                ));
            }
            let unit = words[1].trim_end_matches('s');
            return match unit {
                "second" => Ok(format!("*/{n} * * * * *")),
                "minute" => Ok(format!("0 */{n} * * * *")),
                "hour" => Ok(format!("0 0 */{n} * * *")),
                _ => Err(TriggerError::InvalidSchedule(input.to_string())),
            };
        }
    }

    Err(TriggerError::InvalidSchedule(format!(
        "unrecognized schedule format: '{trimmed}'"
    )))
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Wraps `tokio_cron_scheduler::JobScheduler` with a start/stop lifecycle.
pub struct CronScheduler {
    inner: RwLock<Option<JobScheduler>>,
}

impl CronScheduler {
    /// Create a scheduler (not yet started).
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(None),
        }
    }

    /// Start the scheduler. Must be called before adding jobs.
    pub async fn start(&self) -> Result<(), TriggerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    /// Stop the scheduler and drop all jobs.
    pub async fn stop(&self) -> Result<(), TriggerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| TriggerError::Scheduler(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        Ok(())
    }

    /// Register a job invoking `fire` on the given schedule.
    pub async fn add_job<F, Fut>(&self, schedule: &str, fire: F) -> Result<Uuid, TriggerError>
    where
        F: Fn() -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let cron_expr = normalize_schedule(schedule)?;
        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| TriggerError::Scheduler("scheduler not started".to_string()))?;

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let fire = fire.clone();
            Box::pin(async move {
                tracing::debug!("cron trigger fired");
                fire().await;
            })
        })
        .map_err(|e| TriggerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| TriggerError::Scheduler(e.to_string()))?;
        tracing::info!(%job_id, schedule, "cron job registered");
        Ok(job_id)
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_5field_cron_gains_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(
            normalize_schedule("30 */5 * * * *").unwrap(),
            "30 */5 * * * *"
        );
    }

    #[test]
    fn human_readable_phrases() {
        assert_eq!(normalize_schedule("every 5 minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("every 10 seconds").unwrap(), "*/10 * * * * *");
        assert_eq!(normalize_schedule("every 2 hours").unwrap(), "0 0 */2 * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("every day at 09:30").unwrap(), "0 30 9 * * *");
    }

    #[test]
    fn bad_schedules_are_rejected() {
        assert!(normalize_schedule("run whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every day at 25:00").is_err());
    }

    #[tokio::test]
    async fn add_job_requires_start() {
        let scheduler = CronScheduler::new();
        let result = scheduler.add_job("every minute", || async {}).await;
        assert!(matches!(result, Err(TriggerError::Scheduler(_))));
    }
}
