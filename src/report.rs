use std::fmt::Write;

use crate::models::{
    BatchReport, EligibilitySummary, OutcomeAction, ProgressionHistoryEntry, RejectedAttempt,
};

fn action_label(action: OutcomeAction) -> &'static str {
    match action {
        OutcomeAction::WouldProgress => "would progress",
        OutcomeAction::Progressed => "progressed",
        OutcomeAction::NotEligible => "not eligible",
        OutcomeAction::SkippedConcurrent => "skipped (already progressed)",
        OutcomeAction::ProgressedUnrecorded => "progressed (history missing)",
        OutcomeAction::Failed => "failed",
    }
}

/// Short console summary of one batch run.
pub fn batch_summary(report: &BatchReport) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "{} schedule, {} as of {}: {} processed, {} eligible, {} progressed, {} skipped, {} failures",
        report.schedule_type,
        report.mode,
        report.as_of,
        report.processed,
        report.eligible,
        report.progressed,
        report.skipped,
        report.failures.len()
    );
    if report.aborted {
        let _ = writeln!(
            output,
            "  ABORTED: storage was unreachable; review any partial commits before re-running"
        );
    }
    if report.cancelled {
        let _ = writeln!(
            output,
            "  cancelled: students already progressed stay progressed; safe to re-run"
        );
    }
    for warning in &report.warnings {
        let _ = writeln!(output, "  warning: {warning}");
    }
    for failure in &report.failures {
        let _ = writeln!(output, "  failure: {} - {}", failure.student_id, failure.error);
    }
    for missing in &report.unrecorded {
        let _ = writeln!(output, "  reconcile: {} - {}", missing.student_id, missing.error);
    }
    output
}

pub fn outcome_lines(report: &BatchReport) -> String {
    let mut output = String::new();
    for outcome in &report.outcomes {
        let target = outcome
            .to_level
            .map(|level| format!(" -> {level}"))
            .unwrap_or_default();
        let _ = writeln!(
            output,
            "- {} ({}) level {}{}: {} ({})",
            outcome.student_name.as_deref().unwrap_or("unknown student"),
            outcome.student_id,
            outcome.from_level,
            target,
            action_label(outcome.action),
            outcome.reason
        );
    }
    output
}

pub fn history_lines(entries: &[ProgressionHistoryEntry]) -> String {
    let mut output = String::new();
    if entries.is_empty() {
        let _ = writeln!(output, "No progressions recorded.");
    }
    for entry in entries {
        let _ = writeln!(
            output,
            "- {} {}: {} -> {} ({}, {} schedule, by {})",
            entry.progression_date,
            entry.student_id,
            entry.from_level,
            entry.to_level,
            entry.progression_type,
            entry.schedule_type,
            entry.performed_by
        );
    }
    output
}

pub fn rejection_lines(attempts: &[RejectedAttempt]) -> String {
    let mut output = String::new();
    if attempts.is_empty() {
        let _ = writeln!(output, "No rejected attempts recorded.");
    }
    for attempt in attempts {
        let _ = writeln!(
            output,
            "- {} {} at level {}: {}",
            attempt.attempted_at.format("%Y-%m-%d %H:%M"),
            attempt.student_id,
            attempt.level,
            attempt.reason
        );
    }
    output
}

pub fn summary_lines(summary: &EligibilitySummary) -> String {
    let mut output = String::new();
    let _ = writeln!(output, "- Students: {}", summary.total_students);
    let _ = writeln!(output, "- Eligible: {}", summary.eligible);
    let _ = writeln!(output, "- Not eligible: {}", summary.not_eligible);
    let _ = writeln!(output, "- Already progressed: {}", summary.already_progressed);
    let _ = writeln!(output, "- On hold: {}", summary.on_hold);
    if summary.invalid > 0 {
        let _ = writeln!(output, "- Invalid records: {}", summary.invalid);
    }
    output
}

pub fn build_report(
    batch: &BatchReport,
    summary: Option<&EligibilitySummary>,
    history: &[ProgressionHistoryEntry],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Level Progression Report");
    let _ = writeln!(
        output,
        "Generated for the {} schedule ({} as of {})",
        batch.schedule_type, batch.mode, batch.as_of
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Eligibility");

    match summary {
        Some(summary) => output.push_str(&summary_lines(summary)),
        None => {
            let _ = writeln!(output, "No active rule, so eligibility was not computed.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Run Outcome");
    output.push_str(&batch_summary(batch));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students");
    if batch.outcomes.is_empty() {
        let _ = writeln!(output, "No students evaluated in this run.");
    } else {
        let mut ranked = batch.clone();
        // Eligible students first, then by student id.
        ranked.outcomes.sort_by(|a, b| {
            let a_key = (a.to_level.is_none(), &a.student_id);
            let b_key = (b.to_level.is_none(), &b.student_id);
            a_key.cmp(&b_key)
        });
        output.push_str(&outcome_lines(&ranked));
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Progressions");
    output.push_str(&history_lines(history));

    output
}
