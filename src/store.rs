use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ProgressionError, Result};
use crate::models::{
    ProgressDocument, ProgressionHistoryEntry, ProgressionRule, ProgressionStatus,
    RejectedAttempt, ScheduleType, StudentProgressRecord,
};
use crate::repository::{CreateOutcome, HistoryRecorder, ProgressRepository, Roster};
use crate::rules::{select_active, RuleStore};

/// Everything held by a [`MemoryStore`], cloned out for comparison.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub rules: Vec<ProgressionRule>,
    pub records: BTreeMap<Uuid, ProgressDocument>,
    pub history: Vec<ProgressionHistoryEntry>,
    pub rejections: Vec<RejectedAttempt>,
}

/// In-process store backing offline simulation and tests.
#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<Vec<ProgressionRule>>,
    records: RwLock<BTreeMap<Uuid, ProgressDocument>>,
    students: RwLock<HashMap<String, String>>,
    history: RwLock<Vec<ProgressionHistoryEntry>>,
    rejections: RwLock<Vec<RejectedAttempt>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_student(&self, student_id: &str, full_name: &str) {
        self.students
            .write()
            .await
            .insert(student_id.to_string(), full_name.to_string());
    }

    /// Stores a raw document as-is, bypassing validation.
    pub async fn put_document(&self, document: ProgressDocument) {
        self.records.write().await.insert(document.id, document);
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Snapshot {
        Snapshot {
            rules: self.rules.read().await.clone(),
            records: self.records.read().await.clone(),
            history: self.history.read().await.clone(),
            rejections: self.rejections.read().await.clone(),
        }
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn active_rule(&self, schedule_type: ScheduleType) -> Result<ProgressionRule> {
        let rules = self.rules.read().await;
        select_active(&rules, schedule_type)
            .cloned()
            .ok_or(ProgressionError::RuleNotFound(schedule_type))
    }

    async fn list_rules(&self) -> Result<Vec<ProgressionRule>> {
        Ok(self.rules.read().await.clone())
    }

    async fn save_rule(&self, rule: &ProgressionRule) -> Result<()> {
        rule.validate()?;
        let mut rules = self.rules.write().await;
        if rule.is_active {
            for other in rules
                .iter_mut()
                .filter(|other| other.schedule_type == rule.schedule_type)
            {
                other.is_active = false;
            }
        }
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => *existing = rule.clone(),
            None => rules.push(rule.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<ProgressDocument>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_by_schedule_type(
        &self,
        schedule_type: ScheduleType,
    ) -> Result<Vec<ProgressDocument>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|doc| {
                doc.schedule_type
                    .trim()
                    .eq_ignore_ascii_case(schedule_type.as_str())
            })
            .cloned()
            .collect())
    }

    async fn create_if_absent(&self, record: &StudentProgressRecord) -> Result<CreateOutcome> {
        let mut records = self.records.write().await;
        let level = record.current_level as i32;
        let exists = records
            .values()
            .any(|doc| doc.student_id == record.student_id && doc.current_level == level);
        if exists {
            return Ok(CreateOutcome::AlreadyExists);
        }
        records.insert(record.id, record.to_document());
        Ok(CreateOutcome::Created)
    }

    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: &[ProgressionStatus],
        next: ProgressionStatus,
    ) -> Result<bool> {
        let mut records = self.records.write().await;
        let doc = records
            .get_mut(&id)
            .ok_or(ProgressionError::RecordNotFound(id))?;
        let matches = expected
            .iter()
            .any(|status| status.as_str() == doc.progression_status);
        if matches {
            doc.progression_status = next.to_string();
        }
        Ok(matches)
    }

    async fn delete_if_pristine(&self, id: Uuid, origin: Uuid) -> Result<bool> {
        let mut records = self.records.write().await;
        let origin_progressed = records
            .get(&origin)
            .is_some_and(|doc| doc.progression_status == ProgressionStatus::Progressed.as_str());
        let pristine = !origin_progressed
            && records.get(&id).is_some_and(|doc| {
                doc.progression_status == ProgressionStatus::NotEligible.as_str()
                    && doc.periods_completed.is_empty()
            });
        if pristine {
            records.remove(&id);
        }
        Ok(pristine)
    }
}

#[async_trait]
impl HistoryRecorder for MemoryStore {
    async fn append(&self, entry: &ProgressionHistoryEntry) -> Result<()> {
        self.history.write().await.push(entry.clone());
        Ok(())
    }

    async fn append_rejection(&self, attempt: &RejectedAttempt) -> Result<()> {
        self.rejections.write().await.push(attempt.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ProgressionHistoryEntry>> {
        let history = self.history.read().await;
        Ok(history.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_rejections(&self, limit: usize) -> Result<Vec<RejectedAttempt>> {
        let rejections = self.rejections.read().await;
        Ok(rejections.iter().rev().take(limit).cloned().collect())
    }
}

#[async_trait]
impl Roster for MemoryStore {
    async fn student_name(&self, student_id: &str) -> Result<Option<String>> {
        Ok(self.students.read().await.get(student_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DEFAULT_LEVEL_INCREMENT;

    fn weekend_rule() -> ProgressionRule {
        ProgressionRule {
            id: Uuid::new_v4(),
            schedule_type: ScheduleType::Weekend,
            required_periods: 2,
            progression_month: 1,
            progression_day: 10,
            period_names: vec!["First".to_string(), "Second".to_string()],
            level_increment: DEFAULT_LEVEL_INCREMENT,
            max_level: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn activating_a_rule_retires_the_previous_one() {
        let store = MemoryStore::new();
        let first = weekend_rule();
        let second = weekend_rule();
        store.save_rule(&first).await.unwrap();
        store.save_rule(&second).await.unwrap();

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.iter().filter(|r| r.is_active).count(), 1);
        assert_eq!(
            store.active_rule(ScheduleType::Weekend).await.unwrap().id,
            second.id
        );
        assert!(matches!(
            store.active_rule(ScheduleType::Regular).await,
            Err(ProgressionError::RuleNotFound(ScheduleType::Regular))
        ));
    }

    #[tokio::test]
    async fn create_if_absent_is_keyed_by_student_and_level() {
        let store = MemoryStore::new();
        let record = StudentProgressRecord::enrol("WK/2023/0007", 200, ScheduleType::Weekend);
        let duplicate = StudentProgressRecord::enrol("WK/2023/0007", 200, ScheduleType::Weekend);

        assert_eq!(
            store.create_if_absent(&record).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            store.create_if_absent(&duplicate).await.unwrap(),
            CreateOutcome::AlreadyExists
        );
        assert_eq!(store.snapshot().await.records.len(), 1);
    }

    #[tokio::test]
    async fn compare_and_set_only_moves_from_expected_status() {
        let store = MemoryStore::new();
        let record = StudentProgressRecord::enrol("WK/2023/0008", 100, ScheduleType::Weekend);
        store.create_if_absent(&record).await.unwrap();

        let from = [ProgressionStatus::NotEligible, ProgressionStatus::Eligible];
        assert!(store
            .compare_and_set_status(record.id, &from, ProgressionStatus::Progressed)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set_status(record.id, &from, ProgressionStatus::Progressed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn only_untouched_records_can_be_deleted() {
        let store = MemoryStore::new();
        let origin = StudentProgressRecord::enrol("WK/2023/0009", 100, ScheduleType::Weekend);
        let fresh = StudentProgressRecord::enrol("WK/2023/0009", 200, ScheduleType::Weekend);
        let mut started = StudentProgressRecord::enrol("WK/2023/0010", 200, ScheduleType::Weekend);
        started.periods_completed = vec!["First".to_string()];
        let held = StudentProgressRecord::enrol("WK/2023/0011", 200, ScheduleType::Weekend);
        for record in [&origin, &fresh, &started, &held] {
            store.create_if_absent(record).await.unwrap();
        }
        store
            .compare_and_set_status(
                held.id,
                &[ProgressionStatus::NotEligible],
                ProgressionStatus::OnHold,
            )
            .await
            .unwrap();

        assert!(!store.delete_if_pristine(started.id, origin.id).await.unwrap());
        assert!(!store.delete_if_pristine(held.id, origin.id).await.unwrap());

        // Successor of a progressed record is in use.
        store
            .compare_and_set_status(
                origin.id,
                &[ProgressionStatus::NotEligible],
                ProgressionStatus::Progressed,
            )
            .await
            .unwrap();
        assert!(!store.delete_if_pristine(fresh.id, origin.id).await.unwrap());

        store
            .compare_and_set_status(
                origin.id,
                &[ProgressionStatus::Progressed],
                ProgressionStatus::OnHold,
            )
            .await
            .unwrap();
        assert!(store.delete_if_pristine(fresh.id, origin.id).await.unwrap());
        assert!(!store.delete_if_pristine(fresh.id, origin.id).await.unwrap());
        assert_eq!(store.snapshot().await.records.len(), 3);
    }
}
