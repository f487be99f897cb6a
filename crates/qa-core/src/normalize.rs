//! Step verdict normalization.
//!
//! Persisted step results use either the adjective vocabulary
//! (`passed|failed|skipped`) or the short one (`pass|fail|skip`), under either
//! the `status` or the legacy `result` field. This module is the only place
//! those strings are interpreted; everything that reads a ledger goes through
//! [`normalize`].

use crate::types::{StepResult, StepVerdict};

/// Map a raw status string onto the canonical vocabulary.
///
/// Matching ignores surrounding whitespace and ASCII case. Anything
/// unrecognized is `None`, meaning "no verdict yet".
pub fn normalize_str(value: &str) -> Option<StepVerdict> {
    match value.trim().to_ascii_lowercase().as_str() {
        "pass" | "passed" => Some(StepVerdict::Pass),
        "fail" | "failed" => Some(StepVerdict::Fail),
        "skip" | "skipped" => Some(StepVerdict::Skip),
        _ => None,
    }
}

/// The verdict a stored step result carries.
///
/// `status` wins over `result` whenever it holds a non-blank value, even an
/// unrecognized one.
pub fn normalize(step: &StepResult) -> Option<StepVerdict> {
    raw_status(step).and_then(normalize_str)
}

/// Rewrite a step result into canonical form.
///
/// The verdict is written under `status` in the short vocabulary and the
/// legacy field is dropped. Unrecognized values become an absent status.
pub fn canonicalize(step: &StepResult) -> StepResult {
    StepResult {
        step_index: step.step_index,
        status: normalize(step).map(|v| v.as_str().to_string()),
        result: None,
        notes: step.notes.clone(),
    }
}

fn raw_status(step: &StepResult) -> Option<&str> {
    fn non_blank(s: &Option<String>) -> Option<&str> {
        s.as_deref().filter(|v| !v.trim().is_empty())
    }
    non_blank(&step.status).or_else(|| non_blank(&step.result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: Option<&str>, result: Option<&str>) -> StepResult {
        StepResult {
            step_index: 0,
            status: status.map(String::from),
            result: result.map(String::from),
            notes: None,
        }
    }

    #[test]
    fn both_vocabularies_map_to_same_verdict() {
        for (legacy, short, verdict) in [
            ("passed", "pass", StepVerdict::Pass),
            ("failed", "fail", StepVerdict::Fail),
            ("skipped", "skip", StepVerdict::Skip),
        ] {
            assert_eq!(normalize(&raw(Some(legacy), None)), Some(verdict));
            assert_eq!(normalize(&raw(Some(short), None)), Some(verdict));
            assert_eq!(normalize(&raw(None, Some(legacy))), Some(verdict));
        }
    }

    #[test]
    fn status_preferred_over_result() {
        assert_eq!(
            normalize(&raw(Some("fail"), Some("passed"))),
            Some(StepVerdict::Fail)
        );
        // A present but unknown status still shadows the legacy field.
        assert_eq!(normalize(&raw(Some("blocked"), Some("passed"))), None);
    }

    #[test]
    fn blank_status_falls_back_to_result() {
        assert_eq!(
            normalize(&raw(Some("  "), Some("skipped"))),
            Some(StepVerdict::Skip)
        );
    }

    #[test]
    fn unrecognized_and_absent_are_no_verdict() {
        assert_eq!(normalize(&raw(None, None)), None);
        assert_eq!(normalize(&raw(Some("pending"), None)), None);
        assert_eq!(normalize_str(""), None);
    }

    #[test]
    fn matching_ignores_case_and_whitespace() {
        assert_eq!(normalize_str(" PASSED "), Some(StepVerdict::Pass));
        assert_eq!(normalize_str("Fail"), Some(StepVerdict::Fail));
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let inputs = [
            raw(Some("passed"), None),
            raw(None, Some("failed")),
            raw(Some("skip"), Some("passed")),
            raw(Some("weird"), None),
            raw(None, None),
        ];
        for step in &inputs {
            let once = canonicalize(step);
            let twice = canonicalize(&once);
            assert_eq!(once, twice);
            assert_eq!(normalize(&once), normalize(step));
            assert_eq!(once.result, None);
        }
    }
}
