use std::io::Read;

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

use crate::models::{
    ProgressDocument, ProgressionRule, ProgressionStatus, ScheduleType, StudentProgressRecord,
    DEFAULT_LEVEL_INCREMENT,
};

/// Period lists are packed into one CSV cell, separated by `|`.
const PERIOD_SEPARATOR: char = '|';

#[derive(Debug, Clone)]
pub struct EnrolmentRow {
    pub full_name: String,
    pub record: StudentProgressRecord,
}

#[derive(Debug)]
pub struct Parsed<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<String>,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Parsed {
            rows: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// Blank labels between separators are kept so validation can reject them.
fn split_periods(cell: &str) -> Vec<String> {
    if cell.trim().is_empty() {
        return Vec::new();
    }
    cell.split(PERIOD_SEPARATOR)
        .map(|p| p.trim().to_string())
        .collect()
}

pub fn read_rules<R: Read>(input: R) -> anyhow::Result<Parsed<ProgressionRule>> {
    #[derive(Deserialize)]
    struct CsvRow {
        schedule_type: String,
        required_periods: u32,
        progression_month: u32,
        progression_day: u32,
        period_names: String,
        level_increment: Option<u32>,
        max_level: Option<u32>,
        is_active: Option<bool>,
    }

    let mut reader = csv::Reader::from_reader(input);
    let mut parsed = Parsed::default();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed rule row {}", index + 1))?;
        let schedule_type = match row.schedule_type.parse::<ScheduleType>() {
            Ok(value) => value,
            Err(err) => {
                parsed.rejected.push(format!("rule row {}: {err}", index + 1));
                continue;
            }
        };
        let rule = ProgressionRule {
            id: Uuid::new_v4(),
            schedule_type,
            required_periods: row.required_periods,
            progression_month: row.progression_month,
            progression_day: row.progression_day,
            period_names: split_periods(&row.period_names),
            level_increment: row.level_increment.unwrap_or(DEFAULT_LEVEL_INCREMENT),
            max_level: row.max_level,
            is_active: row.is_active.unwrap_or(true),
        };
        match rule.validate() {
            Ok(()) => parsed.rows.push(rule),
            Err(err) => parsed.rejected.push(format!("rule row {}: {err}", index + 1)),
        }
    }

    Ok(parsed)
}

pub fn read_enrolments<R: Read>(input: R) -> anyhow::Result<Parsed<EnrolmentRow>> {
    #[derive(Deserialize)]
    struct CsvRow {
        student_id: String,
        full_name: String,
        schedule_type: String,
        current_level: i32,
        periods_completed: Option<String>,
        progression_status: Option<String>,
    }

    let mut reader = csv::Reader::from_reader(input);
    let mut parsed = Parsed::default();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed progress row {}", index + 1))?;
        let document = ProgressDocument {
            id: Uuid::new_v4(),
            student_id: row.student_id,
            current_level: row.current_level,
            schedule_type: row.schedule_type,
            periods_completed: row
                .periods_completed
                .as_deref()
                .map(split_periods)
                .unwrap_or_default(),
            progression_status: row
                .progression_status
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| ProgressionStatus::NotEligible.to_string()),
        };
        match StudentProgressRecord::try_from(document) {
            Ok(record) => parsed.rows.push(EnrolmentRow {
                full_name: row.full_name.trim().to_string(),
                record,
            }),
            Err(err) => parsed.rejected.push(format!("progress row {}: {err}", index + 1)),
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_csv_applies_defaults_and_rejects_bad_rows() {
        let input = "\
schedule_type,required_periods,progression_month,progression_day,period_names,level_increment,max_level,is_active
Regular,3,9,1,First Trimester|Second Trimester|Third Trimester,,400,
Weekend,4,1,10,First|Second,,,true
Sandwich,1,1,1,First,,,
";
        let parsed = read_rules(input.as_bytes()).expect("csv parses");
        assert_eq!(parsed.rows.len(), 1);
        let regular = &parsed.rows[0];
        assert_eq!(regular.period_names.len(), 3);
        assert_eq!(regular.level_increment, DEFAULT_LEVEL_INCREMENT);
        assert_eq!(regular.max_level, Some(400));
        assert!(regular.is_active);
        assert_eq!(parsed.rejected.len(), 2);
    }

    #[test]
    fn enrolment_csv_validates_each_row() {
        let input = "\
student_id,full_name,schedule_type,current_level,periods_completed,progression_status
UG/2024/0001,Ama Owusu,regular,100,First|Second,
UG/2024/0002,Kofi Mensah,weekend,200,,on_hold
UG/2024/0003,Esi Boateng,regular,-100,,
UG/2024/0004,Yaw Asante,regular,100,First|First,
";
        let parsed = read_enrolments(input.as_bytes()).expect("csv parses");
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].record.periods_completed, vec!["First", "Second"]);
        assert_eq!(
            parsed.rows[1].record.progression_status,
            ProgressionStatus::OnHold
        );
        assert_eq!(parsed.rejected.len(), 2);
    }

    #[test]
    fn blank_period_between_separators_is_rejected() {
        let input = "\
student_id,full_name,schedule_type,current_level,periods_completed,progression_status
UG/2024/0005,Adwoa Frimpong,regular,100,First||Second,
UG/2024/0006,Kwesi Appiah,regular,100,,
";
        let parsed = read_enrolments(input.as_bytes()).expect("csv parses");
        assert_eq!(parsed.rows.len(), 1);
        assert_eq!(parsed.rows[0].record.student_id, "UG/2024/0006");
        assert!(parsed.rows[0].record.periods_completed.is_empty());
        assert_eq!(parsed.rejected.len(), 1);
        assert!(parsed.rejected[0].contains("blank period label"));
    }

    #[test]
    fn rule_with_blank_period_name_is_rejected() {
        let input = "\
schedule_type,required_periods,progression_month,progression_day,period_names,level_increment,max_level,is_active
regular,2,9,1,First||Second,,,
";
        let parsed = read_rules(input.as_bytes()).expect("csv parses");
        assert!(parsed.rows.is_empty());
        assert!(parsed.rejected[0].contains("blank period name"));
    }
}
