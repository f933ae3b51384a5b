use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ProgressDocument, ProgressionHistoryEntry, ProgressionStatus, RejectedAttempt, ScheduleType,
    StudentProgressRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A record for the same student and level was already stored.
    AlreadyExists,
}

/// Storage contract for per-student progress records. Reads hand back raw
/// documents; callers validate them with `StudentProgressRecord::try_from`.
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<ProgressDocument>>;

    async fn list_by_schedule_type(
        &self,
        schedule_type: ScheduleType,
    ) -> Result<Vec<ProgressDocument>>;

    /// Stores a record unless one exists for the same student and level.
    async fn create_if_absent(&self, record: &StudentProgressRecord) -> Result<CreateOutcome>;

    /// Sets the status only if the stored status is one of `expected`.
    /// Returns `false` when the stored status did not match.
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[ProgressionStatus],
        next: ProgressionStatus,
    ) -> Result<bool>;

    /// Removes record `id` only while it is still `not_eligible` with no
    /// periods, as `create_if_absent` left it, and record `origin` is not
    /// `progressed`. Returns whether it was removed.
    async fn delete_if_pristine(&self, id: Uuid, origin: Uuid) -> Result<bool>;
}

/// Append-only audit log.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    async fn append(&self, entry: &ProgressionHistoryEntry) -> Result<()>;

    async fn append_rejection(&self, attempt: &RejectedAttempt) -> Result<()>;

    /// Newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ProgressionHistoryEntry>>;

    /// Newest first.
    async fn recent_rejections(&self, limit: usize) -> Result<Vec<RejectedAttempt>>;
}

#[async_trait]
pub trait Roster: Send + Sync {
    async fn student_name(&self, student_id: &str) -> Result<Option<String>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
