use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::eligibility::evaluate;
use crate::error::{ProgressionError, Result};
use crate::models::{
    BatchReport, EligibilitySummary, OutcomeAction, ProgressionHistoryEntry, ProgressionRule,
    ProgressionStatus, ProgressionType, RejectedAttempt, RunMode, ScheduleType,
    StudentFailure, StudentOutcome, StudentProgressRecord,
};
use crate::repository::{Clock, CreateOutcome, HistoryRecorder, ProgressRepository, Roster};
use crate::rules::RuleStore;

/// Statuses a record may hold when the batch advances it.
const ADVANCEABLE: [ProgressionStatus; 2] =
    [ProgressionStatus::NotEligible, ProgressionStatus::Eligible];
const HELD: [ProgressionStatus; 1] = [ProgressionStatus::OnHold];
const OVERRIDABLE: [ProgressionStatus; 3] = [
    ProgressionStatus::NotEligible,
    ProgressionStatus::Eligible,
    ProgressionStatus::OnHold,
];

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub call_timeout: Duration,
    /// Extra attempts for read-only calls. Writes are never retried.
    pub read_retries: u32,
    pub performed_by: String,
    /// Record rejected attempts during commit runs.
    pub verbose: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            call_timeout: Duration::from_secs(5),
            read_retries: 2,
            performed_by: "system".to_string(),
            verbose: false,
        }
    }
}

pub struct Executor {
    rules: Arc<dyn RuleStore>,
    records: Arc<dyn ProgressRepository>,
    history: Arc<dyn HistoryRecorder>,
    roster: Arc<dyn Roster>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    cancelled: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        records: Arc<dyn ProgressRepository>,
        history: Arc<dyn HistoryRecorder>,
        roster: Arc<dyn Roster>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        Executor {
            rules,
            records,
            history,
            roster,
            clock,
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_store<S>(store: Arc<S>, clock: Arc<dyn Clock>, config: ExecutorConfig) -> Self
    where
        S: RuleStore + ProgressRepository + HistoryRecorder + Roster + 'static,
    {
        Executor::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store,
            clock,
            config,
        )
    }

    /// Once `trigger` resolves to `true`, running batches stop before their
    /// next student. Students already committed stay progressed. Abort the
    /// returned task when the work it guards is done.
    pub fn cancel_when<F>(&self, trigger: F) -> JoinHandle<()>
    where
        F: Future<Output = bool> + Send + 'static,
    {
        let cancelled = self.cancelled.clone();
        tokio::spawn(async move {
            if trigger.await {
                cancelled.store(true, Ordering::SeqCst);
            }
        })
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProgressionError::Timeout(
                self.config.call_timeout.as_millis() as u64,
            )),
        }
    }

    async fn read<T, F, Fut>(&self, what: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.timed(call()).await {
                Err(err) if err.is_transient() && attempt < self.config.read_retries => {
                    attempt += 1;
                    warn!(what, attempt, error = %err, "read failed; retrying");
                }
                result => return result,
            }
        }
    }

    /// Operator-invoked batch run over one schedule type.
    pub async fn run_progression(
        &self,
        schedule_type: ScheduleType,
        mode: RunMode,
        as_of: NaiveDate,
    ) -> BatchReport {
        self.run_batch(schedule_type, mode, as_of, ProgressionType::Manual)
            .await
    }

    pub async fn run_all(&self, mode: RunMode, as_of: NaiveDate) -> Vec<BatchReport> {
        let mut reports = Vec::with_capacity(ScheduleType::ALL.len());
        for schedule_type in ScheduleType::ALL {
            reports.push(self.run_progression(schedule_type, mode, as_of).await);
        }
        reports
    }

    /// Commits every schedule type whose active rule triggers on `as_of`.
    pub async fn run_scheduled(&self, as_of: NaiveDate) -> Vec<BatchReport> {
        let mut reports = Vec::with_capacity(ScheduleType::ALL.len());
        for schedule_type in ScheduleType::ALL {
            let rule = self
                .read("active rule", || self.rules.active_rule(schedule_type))
                .await;
            match rule {
                Ok(rule) if rule.triggers_on(as_of) => {
                    reports.push(
                        self.run_batch(schedule_type, RunMode::Commit, as_of, ProgressionType::Automatic)
                            .await,
                    );
                }
                Ok(rule) => {
                    let mut report = BatchReport::new(schedule_type, RunMode::Commit, as_of);
                    report.warnings.push(format!(
                        "{} is not the {} trigger date ({:02}-{:02}); nothing run",
                        as_of, schedule_type, rule.progression_month, rule.progression_day
                    ));
                    reports.push(report);
                }
                Err(err) => {
                    warn!(%schedule_type, error = %err, "scheduled run skipped");
                    let mut report = BatchReport::new(schedule_type, RunMode::Commit, as_of);
                    report.aborted = !matches!(err, ProgressionError::RuleNotFound(_));
                    report.warnings.push(err.to_string());
                    reports.push(report);
                }
            }
        }
        reports
    }

    #[tracing::instrument(skip_all, fields(%schedule_type, %mode, %as_of))]
    async fn run_batch(
        &self,
        schedule_type: ScheduleType,
        mode: RunMode,
        as_of: NaiveDate,
        progression_type: ProgressionType,
    ) -> BatchReport {
        let mut report = BatchReport::new(schedule_type, mode, as_of);

        debug!(state = "selecting");
        let rule = match self
            .read("active rule", || self.rules.active_rule(schedule_type))
            .await
        {
            Ok(rule) => rule,
            Err(err @ ProgressionError::RuleNotFound(_)) => {
                warn!(error = %err, "skipping schedule type");
                report
                    .warnings
                    .push(format!("{err}; students left unprocessed"));
                return report;
            }
            Err(err) => {
                warn!(error = %err, "rule store unreachable; aborting run");
                report.aborted = true;
                report.warnings.push(err.to_string());
                return report;
            }
        };

        let documents = match self
            .read("progress records", || {
                self.records.list_by_schedule_type(schedule_type)
            })
            .await
        {
            Ok(documents) => documents,
            Err(err) => {
                warn!(error = %err, "progress repository unreachable; aborting run");
                report.aborted = true;
                report.warnings.push(err.to_string());
                return report;
            }
        };

        debug!(state = "evaluating", candidates = documents.len());
        for document in documents {
            if self.cancelled.load(Ordering::SeqCst) {
                warn!("run cancelled; remaining students untouched");
                report.cancelled = true;
                break;
            }

            let record_id = document.id;
            let raw_student_id = document.student_id.clone();
            let record = match StudentProgressRecord::try_from(document) {
                Ok(record) => record,
                Err(err) => {
                    warn!(student_id = %raw_student_id, error = %err, "invalid progress record");
                    report.failures.push(StudentFailure {
                        student_id: raw_student_id,
                        record_id: Some(record_id),
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            if record.progression_status == ProgressionStatus::Progressed {
                continue;
            }
            report.processed += 1;

            let student_name = self.lookup_name(&record.student_id, &mut report).await;
            let verdict = evaluate(&record, &rule);
            let mut outcome = StudentOutcome {
                student_id: record.student_id.clone(),
                student_name,
                record_id: record.id,
                from_level: record.current_level,
                to_level: None,
                reason: verdict.reason.clone(),
                action: OutcomeAction::NotEligible,
            };

            if !verdict.eligible {
                if mode == RunMode::Commit && self.config.verbose {
                    self.record_rejection(&record, &verdict.reason, &mut report)
                        .await;
                }
                report.outcomes.push(outcome);
                continue;
            }
            report.eligible += 1;

            let result = match mode {
                RunMode::DryRun => rule.next_level(record.current_level),
                RunMode::Commit => {
                    self.advance(&record, &rule, &ADVANCEABLE, progression_type, as_of)
                        .await
                }
            };

            match result {
                Ok(to_level) => {
                    outcome.to_level = Some(to_level);
                    outcome.action = match mode {
                        RunMode::DryRun => OutcomeAction::WouldProgress,
                        RunMode::Commit => {
                            report.progressed += 1;
                            OutcomeAction::Progressed
                        }
                    };
                }
                Err(err @ ProgressionError::HistoryMissing { .. }) => {
                    warn!(student_id = %record.student_id, error = %err, "progressed without history; needs reconciling");
                    if let ProgressionError::HistoryMissing { to_level, .. } = &err {
                        outcome.to_level = Some(*to_level);
                    }
                    report.progressed += 1;
                    outcome.action = OutcomeAction::ProgressedUnrecorded;
                    outcome.reason = err.to_string();
                    report.unrecorded.push(StudentFailure {
                        student_id: record.student_id.clone(),
                        record_id: Some(record.id),
                        error: err.to_string(),
                    });
                }
                Err(ProgressionError::AlreadyProgressed { .. }) => {
                    debug!(student_id = %record.student_id, "progressed by another run");
                    report.skipped += 1;
                    outcome.action = OutcomeAction::SkippedConcurrent;
                    outcome.reason = crate::eligibility::ALREADY_PROGRESSED.to_string();
                }
                Err(err) => {
                    warn!(student_id = %record.student_id, error = %err, "progression failed");
                    outcome.action = OutcomeAction::Failed;
                    outcome.reason = err.to_string();
                    report.failures.push(StudentFailure {
                        student_id: record.student_id.clone(),
                        record_id: Some(record.id),
                        error: err.to_string(),
                    });
                }
            }
            report.outcomes.push(outcome);
        }

        info!(
            processed = report.processed,
            eligible = report.eligible,
            progressed = report.progressed,
            skipped = report.skipped,
            failures = report.failures.len(),
            unrecorded = report.unrecorded.len(),
            "run finished"
        );
        report
    }

    async fn lookup_name(&self, student_id: &str, report: &mut BatchReport) -> Option<String> {
        match self
            .read("roster", || self.roster.student_name(student_id))
            .await
        {
            Ok(Some(name)) => Some(name),
            Ok(None) => {
                report
                    .warnings
                    .push(format!("student {student_id} is not on the roster"));
                None
            }
            Err(err) => {
                warn!(student_id, error = %err, "roster lookup failed");
                None
            }
        }
    }

    async fn record_rejection(
        &self,
        record: &StudentProgressRecord,
        reason: &str,
        report: &mut BatchReport,
    ) {
        let attempt = RejectedAttempt {
            id: Uuid::new_v4(),
            student_id: record.student_id.clone(),
            schedule_type: record.schedule_type,
            level: record.current_level,
            reason: reason.to_string(),
            performed_by: self.config.performed_by.clone(),
            attempted_at: self.clock.now(),
        };
        if let Err(err) = self.timed(self.history.append_rejection(&attempt)).await {
            warn!(student_id = %record.student_id, error = %err, "could not log rejected attempt");
            report.warnings.push(format!(
                "rejected attempt for {} not logged: {err}",
                record.student_id
            ));
        }
    }

    /// Advances one student and returns the new level. The next-level record
    /// is created first (no-op if present), then the old record is moved to
    /// `progressed` with a compare-and-set, then one history entry is
    /// appended. If the old record is not advanced, a next-level record this
    /// call created is removed again, so the student is left as it was.
    async fn advance(
        &self,
        record: &StudentProgressRecord,
        rule: &ProgressionRule,
        expected: &[ProgressionStatus],
        progression_type: ProgressionType,
        as_of: NaiveDate,
    ) -> Result<u32> {
        debug!(state = "committing", student_id = %record.student_id);
        let next = record.next_level_record(rule)?;

        let created = match self.timed(self.records.create_if_absent(&next)).await {
            Ok(CreateOutcome::Created) => {
                debug!(student_id = %record.student_id, level = next.current_level, "next level record created");
                true
            }
            Ok(CreateOutcome::AlreadyExists) => {
                debug!(student_id = %record.student_id, level = next.current_level, "next level record already present");
                false
            }
            Err(err) => {
                // The insert may have landed before the call failed.
                self.discard(record, &next).await;
                return Err(err);
            }
        };

        let won = match self
            .timed(self.records.compare_and_set_status(
                record.id,
                expected,
                ProgressionStatus::Progressed,
            ))
            .await
        {
            Ok(won) => won,
            Err(err) => return Err(self.unconfirmed(record, &next, created, err).await),
        };
        if !won {
            let err = self.lost_race(record).await;
            if created
                && matches!(
                    err,
                    ProgressionError::NotEligible { .. } | ProgressionError::RecordNotFound(_)
                )
            {
                self.discard(record, &next).await;
            }
            return Err(err);
        }

        let entry = ProgressionHistoryEntry {
            id: Uuid::new_v4(),
            student_id: record.student_id.clone(),
            schedule_type: record.schedule_type,
            from_level: record.current_level,
            to_level: next.current_level,
            progression_type,
            progression_date: as_of,
            performed_by: self.config.performed_by.clone(),
            recorded_at: self.clock.now(),
        };
        if let Err(err) = self.timed(self.history.append(&entry)).await {
            warn!(student_id = %record.student_id, error = %err, "progressed but history append failed; not retrying");
            return Err(ProgressionError::HistoryMissing {
                student_id: record.student_id.clone(),
                from_level: record.current_level,
                to_level: next.current_level,
                detail: err.to_string(),
            });
        }

        info!(
            student_id = %record.student_id,
            from = record.current_level,
            to = next.current_level,
            %progression_type,
            "student progressed"
        );
        Ok(next.current_level)
    }

    /// Removes the next-level record for a student that was not advanced.
    /// Only an untouched record is removed, and only while `record` itself
    /// is not progressed.
    async fn discard(&self, record: &StudentProgressRecord, next: &StudentProgressRecord) {
        match self
            .timed(self.records.delete_if_pristine(next.id, record.id))
            .await
        {
            Ok(true) => {
                debug!(student_id = %next.student_id, level = next.current_level, "unused next level record removed")
            }
            Ok(false) => {}
            Err(err) => {
                warn!(student_id = %next.student_id, level = next.current_level, error = %err, "could not remove unused next level record")
            }
        }
    }

    /// A compare-and-set that errored may still have been applied, e.g. a
    /// timeout while the update commits. Re-reads the record to tell which.
    async fn unconfirmed(
        &self,
        record: &StudentProgressRecord,
        next: &StudentProgressRecord,
        created: bool,
        err: ProgressionError,
    ) -> ProgressionError {
        let current = self
            .read("progress record", || self.records.get(record.id))
            .await;
        match current {
            Ok(Some(doc)) if doc.progression_status == ProgressionStatus::Progressed.as_str() => {
                warn!(student_id = %record.student_id, error = %err, "status update reported an error but was applied");
                ProgressionError::HistoryMissing {
                    student_id: record.student_id.clone(),
                    from_level: record.current_level,
                    to_level: next.current_level,
                    detail: format!("status update outcome unknown ({err})"),
                }
            }
            Ok(_) => {
                if created {
                    self.discard(record, next).await;
                }
                err
            }
            Err(read_err) => {
                warn!(student_id = %record.student_id, error = %read_err, "could not confirm status after failed update");
                err
            }
        }
    }

    /// Explains a lost compare-and-set by re-reading the stored status.
    async fn lost_race(&self, record: &StudentProgressRecord) -> ProgressionError {
        let current = self
            .read("progress record", || self.records.get(record.id))
            .await;
        match current {
            Ok(Some(doc)) if doc.progression_status == ProgressionStatus::Progressed.as_str() => {
                ProgressionError::AlreadyProgressed {
                    student_id: record.student_id.clone(),
                    level: record.current_level,
                }
            }
            Ok(Some(doc)) => ProgressionError::NotEligible {
                student_id: record.student_id.clone(),
                reason: format!("status changed to {} during the run", doc.progression_status),
            },
            Ok(None) => ProgressionError::RecordNotFound(record.id),
            Err(err) => err,
        }
    }

    async fn load_record(&self, record_id: Uuid) -> Result<StudentProgressRecord> {
        let document = self
            .read("progress record", || self.records.get(record_id))
            .await?
            .ok_or(ProgressionError::RecordNotFound(record_id))?;
        StudentProgressRecord::try_from(document)
    }

    /// Advances a single student outside a batch. `Manual` requires an
    /// eligible verdict; `Override` skips period counting and holds.
    #[tracing::instrument(skip_all, fields(%record_id, %progression_type))]
    pub async fn progress_student(
        &self,
        record_id: Uuid,
        progression_type: ProgressionType,
        as_of: NaiveDate,
    ) -> Result<StudentOutcome> {
        let record = self.load_record(record_id).await?;
        let rule = self
            .read("active rule", || self.rules.active_rule(record.schedule_type))
            .await?;
        let verdict = evaluate(&record, &rule);

        if record.progression_status == ProgressionStatus::Progressed {
            return Err(ProgressionError::AlreadyProgressed {
                student_id: record.student_id,
                level: record.current_level,
            });
        }
        let expected: &[ProgressionStatus] = match progression_type {
            ProgressionType::Override => &OVERRIDABLE[..],
            ProgressionType::Manual | ProgressionType::Automatic => {
                if !verdict.eligible {
                    return Err(ProgressionError::NotEligible {
                        student_id: record.student_id,
                        reason: verdict.reason,
                    });
                }
                &ADVANCEABLE[..]
            }
        };

        let to_level = self
            .advance(&record, &rule, expected, progression_type, as_of)
            .await?;

        let mut roster_warnings = BatchReport::new(record.schedule_type, RunMode::Commit, as_of);
        let student_name = self
            .lookup_name(&record.student_id, &mut roster_warnings)
            .await;
        Ok(StudentOutcome {
            student_id: record.student_id,
            student_name,
            record_id: record.id,
            from_level: record.current_level,
            to_level: Some(to_level),
            reason: match progression_type {
                ProgressionType::Override => format!("override: {}", verdict.reason),
                _ => verdict.reason,
            },
            action: OutcomeAction::Progressed,
        })
    }

    /// Places a record on hold or releases it back to `not_eligible`.
    /// Returns the status now stored.
    pub async fn set_hold(&self, record_id: Uuid, hold: bool) -> Result<ProgressionStatus> {
        let record = self.load_record(record_id).await?;
        if record.progression_status == ProgressionStatus::Progressed {
            return Err(ProgressionError::AlreadyProgressed {
                student_id: record.student_id,
                level: record.current_level,
            });
        }

        let (expected, next) = if hold {
            (&ADVANCEABLE[..], ProgressionStatus::OnHold)
        } else {
            (&HELD[..], ProgressionStatus::NotEligible)
        };
        if self
            .timed(self.records.compare_and_set_status(record_id, expected, next))
            .await?
        {
            info!(student_id = %record.student_id, status = %next, "hold updated");
            return Ok(next);
        }

        let current = self.load_record(record_id).await?;
        match current.progression_status {
            ProgressionStatus::Progressed => Err(ProgressionError::AlreadyProgressed {
                student_id: current.student_id,
                level: current.current_level,
            }),
            status => Ok(status),
        }
    }

    /// Dashboard counts. Each student is classified by their highest-level
    /// record; a student with any malformed record counts as invalid.
    pub async fn eligibility_summary(
        &self,
        schedule_type: ScheduleType,
    ) -> Result<EligibilitySummary> {
        let rule = self
            .read("active rule", || self.rules.active_rule(schedule_type))
            .await?;
        let documents = self
            .read("progress records", || {
                self.records.list_by_schedule_type(schedule_type)
            })
            .await?;

        let mut by_student: BTreeMap<String, Option<Vec<StudentProgressRecord>>> = BTreeMap::new();
        for document in documents {
            let student_id = document.student_id.trim().to_string();
            match StudentProgressRecord::try_from(document) {
                Ok(record) => {
                    if let Some(records) = by_student
                        .entry(student_id)
                        .or_insert_with(|| Some(Vec::new()))
                    {
                        records.push(record);
                    }
                }
                Err(_) => {
                    by_student.insert(student_id, None);
                }
            }
        }

        let mut summary = EligibilitySummary {
            total_students: by_student.len(),
            ..EligibilitySummary::default()
        };
        for records in by_student.into_values() {
            let Some(mut records) = records else {
                summary.invalid += 1;
                continue;
            };
            records.sort_by_key(|record| record.current_level);
            let Some(latest) = records.last() else {
                continue;
            };
            let advanced_before = records[..records.len() - 1]
                .iter()
                .any(|record| record.progression_status == ProgressionStatus::Progressed);

            match latest.progression_status {
                ProgressionStatus::Progressed => summary.already_progressed += 1,
                ProgressionStatus::OnHold => summary.on_hold += 1,
                _ if advanced_before && latest.periods_completed.is_empty() => {
                    summary.already_progressed += 1
                }
                _ if evaluate(latest, &rule).eligible => summary.eligible += 1,
                _ => summary.not_eligible += 1,
            }
        }
        Ok(summary)
    }

    pub async fn progression_history(&self, limit: usize) -> Result<Vec<ProgressionHistoryEntry>> {
        self.read("history", || self.history.recent(limit)).await
    }

    pub async fn rejected_attempts(&self, limit: usize) -> Result<Vec<RejectedAttempt>> {
        self.read("rejections", || self.history.recent_rejections(limit))
            .await
    }
}
