use thiserror::Error;
use uuid::Uuid;

use crate::models::ScheduleType;

#[derive(Debug, Clone, Error)]
pub enum ProgressionError {
    #[error("no active progression rule for {0} schedule")]
    RuleNotFound(ScheduleType),

    #[error("student {student_id} was already progressed from level {level}")]
    AlreadyProgressed { student_id: String, level: u32 },

    #[error("storage error: {0}")]
    Persistence(String),

    #[error("storage call timed out after {0} ms")]
    Timeout(u64),

    #[error("invalid progress record for {student_id}: {detail}")]
    InvalidPeriod { student_id: String, detail: String },

    #[error("invalid progression rule: {0}")]
    InvalidRule(String),

    #[error("progress record {0} not found")]
    RecordNotFound(Uuid),

    #[error("student {student_id} is not eligible: {reason}")]
    NotEligible { student_id: String, reason: String },

    /// The student was advanced but no history entry exists for it.
    #[error("student {student_id} progressed {from_level} -> {to_level} but history was not recorded: {detail}")]
    HistoryMissing {
        student_id: String,
        from_level: u32,
        to_level: u32,
        detail: String,
    },
}

impl ProgressionError {
    pub fn persistence(err: impl std::fmt::Display) -> Self {
        ProgressionError::Persistence(err.to_string())
    }

    pub fn invalid_period(student_id: &str, detail: impl Into<String>) -> Self {
        ProgressionError::InvalidPeriod {
            student_id: student_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Storage faults that may clear up on their own. Only reads are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProgressionError::Persistence(_) | ProgressionError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for ProgressionError {
    fn from(err: sqlx::Error) -> Self {
        ProgressionError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProgressionError>;
