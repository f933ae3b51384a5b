use crate::models::{ProgressionRule, ProgressionStatus, StudentProgressRecord, Verdict};

pub const ALREADY_PROGRESSED: &str = "already progressed this cycle";
pub const ON_HOLD: &str = "progression on hold";

/// Decides whether a record satisfies its schedule's rule. Pure: the same
/// inputs always give the same verdict and reason.
pub fn evaluate(record: &StudentProgressRecord, rule: &ProgressionRule) -> Verdict {
    let required = rule.required_periods;

    if record.progression_status == ProgressionStatus::Progressed {
        return ineligible(ALREADY_PROGRESSED.to_string(), 0, required);
    }
    if record.progression_status == ProgressionStatus::OnHold {
        return ineligible(ON_HOLD.to_string(), 0, required);
    }
    if let Some(max_level) = rule.max_level {
        if record.current_level >= max_level {
            return ineligible(format!("already at final level {max_level}"), 0, required);
        }
    }

    let (known, unknown): (Vec<&String>, Vec<&String>) = record
        .periods_completed
        .iter()
        .partition(|period| rule.counts_period(period));
    let counted = known.len() as u32;
    let unknown_periods: Vec<String> = unknown.into_iter().cloned().collect();

    let mut reason = format!("completed {counted}/{required} required periods");
    if !unknown_periods.is_empty() {
        reason.push_str(&format!(
            " (ignored unknown periods: {})",
            unknown_periods.join(", ")
        ));
    }

    Verdict {
        eligible: counted >= required,
        reason,
        counted,
        required,
        unknown_periods,
    }
}

fn ineligible(reason: String, counted: u32, required: u32) -> Verdict {
    Verdict {
        eligible: false,
        reason,
        counted,
        required,
        unknown_periods: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScheduleType, DEFAULT_LEVEL_INCREMENT};
    use uuid::Uuid;

    fn regular_rule(required_periods: u32) -> ProgressionRule {
        ProgressionRule {
            id: Uuid::new_v4(),
            schedule_type: ScheduleType::Regular,
            required_periods,
            progression_month: 9,
            progression_day: 1,
            period_names: vec![
                "First".to_string(),
                "Second".to_string(),
                "Third".to_string(),
            ],
            level_increment: DEFAULT_LEVEL_INCREMENT,
            max_level: None,
            is_active: true,
        }
    }

    fn record(periods: &[&str], status: ProgressionStatus) -> StudentProgressRecord {
        let mut record = StudentProgressRecord::enrol("UG/2025/0042", 100, ScheduleType::Regular);
        record.periods_completed = periods.iter().map(|p| p.to_string()).collect();
        record.progression_status = status;
        record
    }

    #[test]
    fn enough_periods_is_eligible() {
        let verdict = evaluate(
            &record(&["First", "Second"], ProgressionStatus::NotEligible),
            &regular_rule(2),
        );
        assert!(verdict.eligible);
        assert_eq!(verdict.reason, "completed 2/2 required periods");
    }

    #[test]
    fn too_few_periods_is_not_eligible() {
        let verdict = evaluate(
            &record(&["First"], ProgressionStatus::NotEligible),
            &regular_rule(2),
        );
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, "completed 1/2 required periods");
    }

    #[test]
    fn progressed_record_is_never_eligible() {
        let verdict = evaluate(
            &record(&["First", "Second", "Third"], ProgressionStatus::Progressed),
            &regular_rule(2),
        );
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, ALREADY_PROGRESSED);
    }

    #[test]
    fn hold_blocks_progression() {
        let verdict = evaluate(
            &record(&["First", "Second"], ProgressionStatus::OnHold),
            &regular_rule(2),
        );
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, ON_HOLD);
    }

    #[test]
    fn unknown_periods_do_not_count() {
        let verdict = evaluate(
            &record(&["First", "Summer School"], ProgressionStatus::NotEligible),
            &regular_rule(2),
        );
        assert!(!verdict.eligible);
        assert_eq!(verdict.counted, 1);
        assert_eq!(verdict.unknown_periods, vec!["Summer School"]);
        assert_eq!(
            verdict.reason,
            "completed 1/2 required periods (ignored unknown periods: Summer School)"
        );
    }

    #[test]
    fn final_level_stops_progression() {
        let mut rule = regular_rule(2);
        rule.max_level = Some(400);
        let mut final_year = record(&["First", "Second"], ProgressionStatus::NotEligible);
        final_year.current_level = 400;

        let verdict = evaluate(&final_year, &rule);
        assert!(!verdict.eligible);
        assert_eq!(verdict.reason, "already at final level 400");
    }

    #[test]
    fn evaluation_is_deterministic() {
        let record = record(&["Second", "First"], ProgressionStatus::Eligible);
        let rule = regular_rule(3);
        assert_eq!(evaluate(&record, &rule), evaluate(&record, &rule));
    }
}
