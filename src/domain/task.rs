//! Cold-path task queue types.
//!
//! ```text
//! PENDING --claim(atomic)--> RUNNING --success--> DONE
//!                            RUNNING --retry----> PENDING  (with backoff)
//!                            RUNNING --giveup---> FAILED   (attempts >= MAX)
//! ```
//! The claim is the only place `attempts` is incremented; the post-claim row
//! is the sole authority for retry decisions downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TASK_TYPE_ANALYZE: &str = "ANALYZE_EXECUTED";

/// Backoff schedule indexed by the authoritative post-claim attempts value:
/// attempt 1 retries after 300s, 2 after 900s, 3 after 3600s.
pub const RETRY_DELAYS_SECS: [i64; 3] = [300, 900, 3600];

pub const ERR_JUDGE_PARSE: &str = "ERR_JUDGE_PARSE";
pub const ERR_JSON_PARSE: &str = "ERR_JSON_PARSE";
pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_WORKER: &str = "ERR_WORKER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        Some(match s {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "DONE" => TaskStatus::Done,
            "FAILED" => TaskStatus::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub task_id: String,
    pub task_type: String,
    pub entity_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What to do with a RUNNING task that failed, given the authoritative
/// attempts value and the configured maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to PENDING with this delay.
    Retry { delay_secs: i64 },
    /// Permanently FAILED; flag the position.
    GiveUp,
}

pub fn failure_disposition(attempts_now: u32, max_attempts: u32) -> FailureDisposition {
    if attempts_now >= max_attempts {
        return FailureDisposition::GiveUp;
    }
    let idx = (attempts_now.saturating_sub(1) as usize).min(RETRY_DELAYS_SECS.len() - 1);
    FailureDisposition::Retry { delay_secs: RETRY_DELAYS_SECS[idx] }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_ladder_matches_schedule() {
        assert_eq!(failure_disposition(1, 4), FailureDisposition::Retry { delay_secs: 300 });
        assert_eq!(failure_disposition(2, 4), FailureDisposition::Retry { delay_secs: 900 });
        assert_eq!(failure_disposition(3, 4), FailureDisposition::Retry { delay_secs: 3600 });
        assert_eq!(failure_disposition(4, 4), FailureDisposition::GiveUp);
        assert_eq!(failure_disposition(9, 4), FailureDisposition::GiveUp);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done, TaskStatus::Failed] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("UNKNOWN"), None);
    }
}
