use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a generation job.
///
/// The status is monotonic with a single exception: a failed job may go back
/// to `Processing` when the queue redelivers it for a retry attempt.
/// `Cancelled` is reachable only from `Queued`; once a job is processing,
/// an external provider call may already be in flight.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true if this status represents a terminal state.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self -> next` is permitted.
    ///
    /// `Failed -> Processing` is the retry edge and is only legal as a
    /// queue-driven redelivery; callers must additionally check the attempt
    /// budget. `Processing -> Processing` covers stall redelivery of the
    /// same entry.
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Processing)
                | (Self::Queued, Self::Cancelled)
                | (Self::Processing, Self::Processing)
                | (Self::Processing, Self::Succeeded)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Processing)
        )
    }
}

/// Structured options accepted alongside the prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

/// A generation job and its persisted lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: String,
    pub status: JobStatus,

    pub prompt: String,
    pub primary_image_key: String,
    pub secondary_image_key: Option<String>,
    pub options: GenerationOptions,
    pub priority: i32,

    pub attempts: i32,
    pub max_attempts: i32,
    pub retry_at: Option<DateTime<Utc>>,

    pub provider_task_id: Option<String>,

    pub output_image_id: Option<Uuid>,
    pub error: Option<String>,
    pub error_detail: Option<serde_json::Value>,

    pub queue_time_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether another retry attempt may still be scheduled.
    #[inline]
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Delay before the next retry after `attempts` deliveries have failed.
///
/// Exponential: `base * 2^attempts`.
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts);
    base.saturating_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn cancellation_only_from_queued() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for terminal in [JobStatus::Succeeded, JobStatus::Cancelled] {
            for next in [
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn failed_retries_back_into_processing_only() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn stall_redelivery_keeps_processing() {
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(60_000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(120_000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(240_000));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(JobStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(
            "succeeded".parse::<JobStatus>().unwrap(),
            JobStatus::Succeeded
        );
    }
}
