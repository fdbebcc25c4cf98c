//! Time-based scheduling: one-shot RFC 3339 timestamps and the fixed
//! recurring patterns `hourly`, `daily` and `weekly`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use avy_core::error::AppError;
use avy_core::types::new_id;

use crate::workflow::WorkflowOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Schedule {
    At(DateTime<Utc>),
    Hourly,
    Daily,
    Weekly,
}

impl Schedule {
    /// Parses a schedule expression: a recurrence keyword or an RFC 3339
    /// timestamp. Anything else is a validation error.
    pub fn parse(input: &str) -> Result<Self, AppError> {
        match input.trim() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => DateTime::parse_from_rfc3339(other)
                .map(|dt| Self::At(dt.with_timezone(&Utc)))
                .map_err(|_| {
                    AppError::Validation(format!(
                        "unrecognized schedule '{other}': expected hourly, daily, weekly or an RFC 3339 timestamp"
                    ))
                }),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::At(_))
    }

    /// Next fire time at or after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::At(when) => *when,
            Self::Hourly => now + Duration::hours(1),
            Self::Daily => now + Duration::days(1),
            Self::Weekly => now + Duration::weeks(1),
        }
    }
}

/// A pending timer entry. Converted into a regular queued job when its
/// fire time passes; recurring entries re-arm themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub workflow: String,
    pub payload: serde_json::Value,
    pub schedule: Schedule,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub options: WorkflowOptions,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(
        workflow: &str,
        payload: serde_json::Value,
        schedule: Schedule,
        options: WorkflowOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            workflow: workflow.to_string(),
            payload,
            fire_at: schedule.next_fire(now),
            schedule,
            options,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keywords_and_timestamps() {
        assert_eq!(Schedule::parse("hourly").unwrap(), Schedule::Hourly);
        assert_eq!(Schedule::parse(" daily ").unwrap(), Schedule::Daily);
        assert_eq!(Schedule::parse("weekly").unwrap(), Schedule::Weekly);
        let at = Schedule::parse("2026-09-01T12:00:00Z").unwrap();
        assert!(matches!(at, Schedule::At(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = Schedule::parse("every 5 minutes").unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(Schedule::parse("").is_err());
    }

    #[test]
    fn test_next_fire_advances_recurring() {
        let now = Utc::now();
        assert_eq!(Schedule::Hourly.next_fire(now), now + Duration::hours(1));
        assert_eq!(Schedule::Daily.next_fire(now), now + Duration::days(1));
        assert_eq!(Schedule::Weekly.next_fire(now), now + Duration::weeks(1));
        let when = now - Duration::minutes(5);
        assert_eq!(Schedule::At(when).next_fire(now), when);
    }
}
