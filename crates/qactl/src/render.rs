//! Output rendering for qactl.
//!
//! Formats assignments, statistics and audit records for terminal display.

use chrono::{DateTime, Utc};
use qa_core::events::Event;
use qa_core::ledger::StepCounts;
use qa_core::lifecycle::AttemptRecord;
use qa_core::normalize::normalize;
use qa_core::rollup::Judgment;
use qa_core::visibility::{Dashboard, VisibleAssignment};
use qa_core::{Assignment, AssignmentSummary, Member, Test, TestStatistics};

pub fn print_member(member: &Member) {
    println!(
        "Member {} in {}: {}",
        member.user_id,
        member.org_id,
        member.role.as_str()
    );
}

pub fn print_test_saved(test: &Test) {
    println!("Saved test: {}", test.id);
    println!("  Title:    {}", test.title);
    println!("  Status:   {}", test.status.as_str());
    println!("  Priority: {}", test.priority);
    let required = test.steps.iter().filter(|s| s.required).count();
    println!("  Steps:    {} ({} required)", test.steps.len(), required);
}

/// Print confirmation after creating or reassigning an assignment.
pub fn print_assignment_created(assignment: &Assignment) {
    println!("Assignment: {}", assignment.id);
    println!("  Test:     {}", assignment.test_id);
    println!("  Assignee: {}", assignment.assignee_id);
    println!("  State:    {}", assignment.state.as_str());
    if let Some(due) = &assignment.due_date {
        println!("  Due:      {}", format_time(due));
    }
}

/// Print a list of visible assignments in tabular format.
pub fn print_assignment_list(assignments: &[VisibleAssignment]) {
    if assignments.is_empty() {
        println!("No assignments found.");
        return;
    }

    println!(
        "{:<36}  {:<20}  {:<12}  {:<12}  {:<14}  {:<20}",
        "ID", "ASSIGNEE", "STATE", "RESULT", "P/F/S", "UPDATED"
    );
    println!("{}", "-".repeat(124));

    for a in assignments {
        println!(
            "{:<36}  {:<20}  {:<12}  {:<12}  {:<14}  {:<20}",
            a.assignment_id.0,
            truncate(&a.assignee_label, 20),
            a.state.as_str(),
            a.overall.as_str(),
            format_counts(&a.counts),
            format_time(&a.updated_at),
        );
    }

    println!();
    println!("{} assignment(s)", assignments.len());
}

/// Print detailed information about an assignment and its ledger.
pub fn print_assignment_details(assignment: &Assignment) {
    println!("Assignment: {}", assignment.id);
    println!();
    println!("  Test:           {}", assignment.test_id);
    println!("  Assignee:       {}", assignment.assignee_id);
    println!("  State:          {}", assignment.state.as_str());
    println!("  Reassigned:     {} time(s)", assignment.reassign_count);
    if let Some(due) = &assignment.due_date {
        println!("  Due:            {}", format_time(due));
    }
    if let Some(notes) = &assignment.notes {
        println!("  Notes:          {}", notes);
    }
    println!();
    println!("  Created:        {}", format_time(&assignment.created_at));
    if let Some(started) = &assignment.started_at {
        println!("  Started:        {}", format_time(started));
    }
    println!("  Updated:        {}", format_time(&assignment.updated_at));

    let results = assignment.ledger.results();
    if results.is_empty() {
        return;
    }

    println!();
    println!("  Steps:");
    println!("    {:<6}  {:<10}  {:<40}", "INDEX", "VERDICT", "NOTES");
    println!("    {}", "-".repeat(60));
    for step in results {
        let verdict = normalize(step).map_or("-", |v| v.as_str());
        println!(
            "    {:<6}  {:<10}  {:<40}",
            step.step_index,
            verdict,
            truncate(step.notes.as_deref().unwrap_or(""), 40),
        );
    }
}

pub fn print_statistics(stats: &TestStatistics) {
    println!("  Attempts:  {}", stats.total);
    println!("  Passed:    {}", stats.passed);
    println!("  Failed:    {}", stats.failed);
    println!("  Pass rate: {}%", stats.pass_rate);
}

pub fn print_dashboard(dashboard: &Dashboard) {
    println!("Test: {}", dashboard.test_id);
    println!();
    print_statistics(&dashboard.statistics);

    if dashboard.assignees.is_empty() {
        println!();
        println!("No assignees.");
        return;
    }

    println!();
    println!(
        "  {:<20}  {:<12}  {:<12}  {:<14}  {:<36}",
        "ASSIGNEE", "STATE", "RESULT", "P/F/S", "ASSIGNMENT"
    );
    println!("  {}", "-".repeat(102));
    for row in &dashboard.assignees {
        println!(
            "  {:<20}  {:<12}  {:<12}  {:<14}  {:<36}",
            truncate(&row.assignee_id, 20),
            row.state.as_str(),
            row.overall.as_str(),
            format_counts(&row.counts),
            row.assignment_id.0,
        );
    }
}

pub fn print_summary(summary: &AssignmentSummary) {
    println!("Assignment: {}", summary.assignment_id);
    println!("  State:    {}", summary.state.as_str());
    println!("  Steps:    {}", format_counts(&summary.counts));
    println!("  Rollup:   {}", format_judgment(&summary.rollup));
    if let Some(gate) = &summary.gate {
        println!("  Gate:     {}", format_judgment(gate));
    }
}

/// Print archived attempts of one assignment.
pub fn print_history(attempts: &[AttemptRecord]) {
    if attempts.is_empty() {
        println!("No archived attempts.");
        return;
    }

    println!(
        "{:<4}  {:<12}  {:<12}  {:<6}  {:<20}  {:<16}",
        "SEQ", "STATE", "RESULT", "STEPS", "ARCHIVED", "DIGEST"
    );
    println!("{}", "-".repeat(80));
    for attempt in attempts {
        println!(
            "{:<4}  {:<12}  {:<12}  {:<6}  {:<20}  {:<16}",
            attempt.sequence,
            attempt.state.as_str(),
            attempt.overall.as_str(),
            attempt.ledger.len(),
            format_time(&attempt.archived_at),
            truncate(&attempt.ledger_digest, 16),
        );
    }

    println!();
    println!("{} attempt(s)", attempts.len());
}

pub fn print_events(events: &[Event]) {
    if events.is_empty() {
        println!("No events found.");
        return;
    }

    println!("{:<20}  {:<24}  {:<50}", "TIME", "TYPE", "PAYLOAD");
    println!("{}", "-".repeat(98));
    for event in events {
        println!(
            "{:<20}  {:<24}  {:<50}",
            format_time(&event.timestamp),
            event.event_type,
            truncate(&event.payload_json, 50),
        );
    }

    println!();
    println!("{} event(s)", events.len());
}

fn format_counts(counts: &StepCounts) -> String {
    format!("{}/{}/{}", counts.passed, counts.failed, counts.skipped)
}

fn format_judgment(judgment: &Judgment) -> String {
    let rule = match judgment.rule {
        qa_core::rollup::JudgmentRule::Rollup => "rollup",
        qa_core::rollup::JudgmentRule::RequiredStepGate => "required-step gate",
    };
    format!("{} ({})", judgment.result.as_str(), rule)
}

fn format_time(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qa_core::rollup::{JudgmentRule, OverallResult};

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("alice", 20), "alice");
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("Ünïcödé-tester", 8), "Ünïcö...");
    }

    #[test]
    fn counts_render_as_pass_fail_skip() {
        let counts = StepCounts {
            passed: 3,
            failed: 1,
            skipped: 2,
            undecided: 4,
        };
        assert_eq!(format_counts(&counts), "3/1/2");
    }

    #[test]
    fn judgment_names_its_rule() {
        let judgment = Judgment {
            rule: JudgmentRule::RequiredStepGate,
            result: OverallResult::InProgress,
        };
        assert_eq!(format_judgment(&judgment), "in_progress (required-step gate)");
    }
}
