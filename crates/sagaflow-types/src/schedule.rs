//! Scheduled job descriptions exposed by the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a scheduled job recurs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire every `millis` milliseconds after the previous evaluation.
    Interval { millis: u64 },
    /// Fire at the next occurrence of a (normalized, 6-field) cron expression.
    Cron {
        /// Schedule as supplied by the caller.
        expression: String,
        /// Normalized 6-field cron expression.
        normalized: String,
    },
}

/// Read-only view of a scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub name: String,
    pub schedule: ScheduleSpec,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub enabled: bool,
}
