use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProgressionError;

pub const DEFAULT_LEVEL_INCREMENT: u32 = 100;

/// Highest level the signed storage column can hold.
pub const LEVEL_CEILING: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Regular,
    Weekend,
    Evening,
}

impl ScheduleType {
    pub const ALL: [ScheduleType; 3] = [
        ScheduleType::Regular,
        ScheduleType::Weekend,
        ScheduleType::Evening,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Regular => "regular",
            ScheduleType::Weekend => "weekend",
            ScheduleType::Evening => "evening",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "regular" => Ok(ScheduleType::Regular),
            "weekend" => Ok(ScheduleType::Weekend),
            "evening" => Ok(ScheduleType::Evening),
            other => Err(format!("unknown schedule type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressionStatus {
    NotEligible,
    Eligible,
    Progressed,
    OnHold,
}

impl ProgressionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressionStatus::NotEligible => "not_eligible",
            ProgressionStatus::Eligible => "eligible",
            ProgressionStatus::Progressed => "progressed",
            ProgressionStatus::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for ProgressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressionStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "not_eligible" => Ok(ProgressionStatus::NotEligible),
            "eligible" => Ok(ProgressionStatus::Eligible),
            "progressed" => Ok(ProgressionStatus::Progressed),
            "on_hold" => Ok(ProgressionStatus::OnHold),
            other => Err(format!("unknown progression status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressionType {
    Automatic,
    Manual,
    Override,
}

impl ProgressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressionType::Automatic => "automatic",
            ProgressionType::Manual => "manual",
            ProgressionType::Override => "override",
        }
    }
}

impl fmt::Display for ProgressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressionType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "automatic" => Ok(ProgressionType::Automatic),
            "manual" => Ok(ProgressionType::Manual),
            "override" => Ok(ProgressionType::Override),
            other => Err(format!("unknown progression type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionRule {
    pub id: Uuid,
    pub schedule_type: ScheduleType,
    pub required_periods: u32,
    pub progression_month: u32,
    pub progression_day: u32,
    pub period_names: Vec<String>,
    pub level_increment: u32,
    pub max_level: Option<u32>,
    pub is_active: bool,
}

impl ProgressionRule {
    pub fn validate(&self) -> Result<(), ProgressionError> {
        if self.required_periods == 0 {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule must require at least one period",
                self.schedule_type
            )));
        }
        if self.required_periods as usize > self.period_names.len() {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule requires {} periods but only names {}",
                self.schedule_type,
                self.required_periods,
                self.period_names.len()
            )));
        }
        let mut seen = HashSet::new();
        for name in &self.period_names {
            let name = name.trim();
            if name.is_empty() {
                return Err(ProgressionError::InvalidRule(format!(
                    "{} rule has a blank period name",
                    self.schedule_type
                )));
            }
            if !seen.insert(name) {
                return Err(ProgressionError::InvalidRule(format!(
                    "{} rule lists period '{}' twice",
                    self.schedule_type, name
                )));
            }
        }
        // 2024 is a leap year, so 29 February stays a legal trigger.
        if NaiveDate::from_ymd_opt(2024, self.progression_month, self.progression_day).is_none() {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule trigger {}/{} is not a calendar date",
                self.schedule_type, self.progression_month, self.progression_day
            )));
        }
        if self.level_increment == 0 {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule level increment must be positive",
                self.schedule_type
            )));
        }
        if self.level_increment > LEVEL_CEILING {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule level increment {} exceeds {LEVEL_CEILING}",
                self.schedule_type, self.level_increment
            )));
        }
        if let Some(max_level) = self.max_level.filter(|level| *level > LEVEL_CEILING) {
            return Err(ProgressionError::InvalidRule(format!(
                "{} rule final level {max_level} exceeds {LEVEL_CEILING}",
                self.schedule_type
            )));
        }
        Ok(())
    }

    pub fn triggers_on(&self, date: NaiveDate) -> bool {
        date.month() == self.progression_month && date.day() == self.progression_day
    }

    pub fn next_level(&self, level: u32) -> Result<u32, ProgressionError> {
        level
            .checked_add(self.level_increment)
            .filter(|next| *next <= LEVEL_CEILING)
            .ok_or_else(|| {
                ProgressionError::InvalidRule(format!(
                    "{} rule cannot advance level {level} by {}",
                    self.schedule_type, self.level_increment
                ))
            })
    }

    pub fn counts_period(&self, period: &str) -> bool {
        let period = period.trim();
        self.period_names.iter().any(|name| name.trim() == period)
    }
}

/// Progress record as it sits in storage: enums as text, level as a signed
/// column value. Only [`StudentProgressRecord`] is handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDocument {
    pub id: Uuid,
    pub student_id: String,
    pub current_level: i32,
    pub schedule_type: String,
    pub periods_completed: Vec<String>,
    pub progression_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProgressRecord {
    pub id: Uuid,
    pub student_id: String,
    pub current_level: u32,
    pub schedule_type: ScheduleType,
    pub periods_completed: Vec<String>,
    pub progression_status: ProgressionStatus,
}

impl StudentProgressRecord {
    pub fn enrol(student_id: &str, level: u32, schedule_type: ScheduleType) -> Self {
        StudentProgressRecord {
            id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            current_level: level,
            schedule_type,
            periods_completed: Vec::new(),
            progression_status: ProgressionStatus::NotEligible,
        }
    }

    pub fn next_level_record(&self, rule: &ProgressionRule) -> Result<Self, ProgressionError> {
        Ok(Self::enrol(
            &self.student_id,
            rule.next_level(self.current_level)?,
            self.schedule_type,
        ))
    }

    pub fn to_document(&self) -> ProgressDocument {
        ProgressDocument {
            id: self.id,
            student_id: self.student_id.clone(),
            current_level: self.current_level as i32,
            schedule_type: self.schedule_type.to_string(),
            periods_completed: self.periods_completed.clone(),
            progression_status: self.progression_status.to_string(),
        }
    }
}

impl TryFrom<ProgressDocument> for StudentProgressRecord {
    type Error = ProgressionError;

    fn try_from(doc: ProgressDocument) -> Result<Self, Self::Error> {
        let student_id = doc.student_id.trim().to_string();
        if student_id.is_empty() {
            return Err(ProgressionError::invalid_period(
                &doc.id.to_string(),
                "record has no student id",
            ));
        }
        if doc.current_level <= 0 {
            return Err(ProgressionError::invalid_period(
                &student_id,
                format!("level {} is not a positive level", doc.current_level),
            ));
        }
        let schedule_type = doc
            .schedule_type
            .parse::<ScheduleType>()
            .map_err(|err| ProgressionError::invalid_period(&student_id, err))?;
        let progression_status = doc
            .progression_status
            .parse::<ProgressionStatus>()
            .map_err(|err| ProgressionError::invalid_period(&student_id, err))?;

        let mut seen = HashSet::new();
        let mut periods_completed = Vec::with_capacity(doc.periods_completed.len());
        for period in doc.periods_completed {
            let period = period.trim().to_string();
            if period.is_empty() {
                return Err(ProgressionError::invalid_period(
                    &student_id,
                    "blank period label",
                ));
            }
            if !seen.insert(period.clone()) {
                return Err(ProgressionError::invalid_period(
                    &student_id,
                    format!("period '{period}' recorded twice"),
                ));
            }
            periods_completed.push(period);
        }

        Ok(StudentProgressRecord {
            id: doc.id,
            student_id,
            current_level: doc.current_level as u32,
            schedule_type,
            periods_completed,
            progression_status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionHistoryEntry {
    pub id: Uuid,
    pub student_id: String,
    pub schedule_type: ScheduleType,
    pub from_level: u32,
    pub to_level: u32,
    pub progression_type: ProgressionType,
    pub progression_date: NaiveDate,
    pub performed_by: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAttempt {
    pub id: Uuid,
    pub student_id: String,
    pub schedule_type: ScheduleType,
    pub level: u32,
    pub reason: String,
    pub performed_by: String,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub eligible: bool,
    pub reason: String,
    pub counted: u32,
    pub required: u32,
    pub unknown_periods: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    DryRun,
    Commit,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::DryRun => f.write_str("dry run"),
            RunMode::Commit => f.write_str("commit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeAction {
    /// Dry run found the student eligible; nothing was written.
    WouldProgress,
    Progressed,
    NotEligible,
    /// Another run progressed the student between selection and commit.
    SkippedConcurrent,
    /// Advanced, but the history entry is missing and must be reconciled.
    ProgressedUnrecorded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentOutcome {
    pub student_id: String,
    pub student_name: Option<String>,
    pub record_id: Uuid,
    pub from_level: u32,
    pub to_level: Option<u32>,
    pub reason: String,
    pub action: OutcomeAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentFailure {
    pub student_id: String,
    pub record_id: Option<Uuid>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub schedule_type: ScheduleType,
    pub mode: RunMode,
    pub as_of: NaiveDate,
    pub processed: usize,
    pub eligible: usize,
    pub progressed: usize,
    pub skipped: usize,
    pub failures: Vec<StudentFailure>,
    /// Progressed students without a history entry.
    pub unrecorded: Vec<StudentFailure>,
    pub warnings: Vec<String>,
    pub outcomes: Vec<StudentOutcome>,
    pub aborted: bool,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn new(schedule_type: ScheduleType, mode: RunMode, as_of: NaiveDate) -> Self {
        BatchReport {
            schedule_type,
            mode,
            as_of,
            processed: 0,
            eligible: 0,
            progressed: 0,
            skipped: 0,
            failures: Vec::new(),
            unrecorded: Vec::new(),
            warnings: Vec::new(),
            outcomes: Vec::new(),
            aborted: false,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EligibilitySummary {
    pub total_students: usize,
    pub eligible: usize,
    pub not_eligible: usize,
    pub already_progressed: usize,
    pub on_hold: usize,
    pub invalid: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(level: i32, periods: &[&str]) -> ProgressDocument {
        ProgressDocument {
            id: Uuid::new_v4(),
            student_id: "UG/2024/0101".to_string(),
            current_level: level,
            schedule_type: "Regular".to_string(),
            periods_completed: periods.iter().map(|p| p.to_string()).collect(),
            progression_status: "not_eligible".to_string(),
        }
    }

    fn rule() -> ProgressionRule {
        ProgressionRule {
            id: Uuid::new_v4(),
            schedule_type: ScheduleType::Regular,
            required_periods: 2,
            progression_month: 9,
            progression_day: 1,
            period_names: vec!["First".to_string(), "Second".to_string()],
            level_increment: DEFAULT_LEVEL_INCREMENT,
            max_level: None,
            is_active: true,
        }
    }

    #[test]
    fn document_with_trimmed_periods_converts() {
        let record = StudentProgressRecord::try_from(document(100, &[" First ", "Second"]))
            .expect("valid document");
        assert_eq!(record.schedule_type, ScheduleType::Regular);
        assert_eq!(record.periods_completed, vec!["First", "Second"]);
        assert_eq!(record.progression_status, ProgressionStatus::NotEligible);
    }

    #[test]
    fn duplicate_or_blank_periods_are_rejected() {
        let duplicate = StudentProgressRecord::try_from(document(100, &["First", "First"]));
        assert!(matches!(duplicate, Err(ProgressionError::InvalidPeriod { .. })));

        let blank = StudentProgressRecord::try_from(document(100, &["First", "  "]));
        assert!(matches!(blank, Err(ProgressionError::InvalidPeriod { .. })));
    }

    #[test]
    fn unknown_status_and_bad_level_are_rejected() {
        let mut doc = document(100, &[]);
        doc.progression_status = "graduated".to_string();
        assert!(StudentProgressRecord::try_from(doc).is_err());

        assert!(StudentProgressRecord::try_from(document(0, &[])).is_err());
    }

    #[test]
    fn rule_validation_catches_config_gaps() {
        assert!(rule().validate().is_ok());

        let mut too_many = rule();
        too_many.required_periods = 3;
        assert!(matches!(too_many.validate(), Err(ProgressionError::InvalidRule(_))));

        let mut bad_date = rule();
        bad_date.progression_month = 2;
        bad_date.progression_day = 30;
        assert!(bad_date.validate().is_err());

        let mut leap = rule();
        leap.progression_month = 2;
        leap.progression_day = 29;
        assert!(leap.validate().is_ok());

        let mut huge_step = rule();
        huge_step.level_increment = u32::MAX;
        assert!(matches!(huge_step.validate(), Err(ProgressionError::InvalidRule(_))));

        let mut huge_final = rule();
        huge_final.max_level = Some(LEVEL_CEILING + 1);
        assert!(matches!(huge_final.validate(), Err(ProgressionError::InvalidRule(_))));
    }

    #[test]
    fn next_level_refuses_to_leave_the_storable_range() {
        let mut rule = rule();
        assert_eq!(rule.next_level(100).unwrap(), 200);

        rule.level_increment = LEVEL_CEILING;
        assert!(matches!(rule.next_level(100), Err(ProgressionError::InvalidRule(_))));

        rule.level_increment = u32::MAX;
        assert!(rule.next_level(100).is_err());
        let record = StudentProgressRecord::enrol("UG/2024/0101", 100, ScheduleType::Regular);
        assert!(record.next_level_record(&rule).is_err());
    }

    #[test]
    fn trigger_matches_month_and_day_only() {
        let rule = rule();
        assert!(rule.triggers_on(NaiveDate::from_ymd_opt(2026, 9, 1).unwrap()));
        assert!(rule.triggers_on(NaiveDate::from_ymd_opt(2031, 9, 1).unwrap()));
        assert!(!rule.triggers_on(NaiveDate::from_ymd_opt(2026, 9, 2).unwrap()));
    }

    #[test]
    fn schedule_type_parses_case_insensitively() {
        assert_eq!("WEEKEND".parse::<ScheduleType>(), Ok(ScheduleType::Weekend));
        assert!("sandwich".parse::<ScheduleType>().is_err());
    }
}
