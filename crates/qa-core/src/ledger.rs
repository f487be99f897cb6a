//! Step result ledger for one execution attempt.
//!
//! Entries written through this module land in ascending `step_index` order
//! with at most one entry per index; existing entries are never moved.
//! Index `i` refers to step `i` of the test definition; the ledger may be
//! shorter than the step list while an attempt is underway.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::normalize::{canonicalize, normalize};
use crate::types::{StepResult, StepVerdict};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("step index {index} out of range (test has {step_count} steps)")]
    StepOutOfRange { index: u32, step_count: usize },
    #[error("duplicate result for step index {0}")]
    DuplicateStep(u32),
}

/// Per-verdict counts over a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Entries whose status does not normalize to a verdict.
    pub undecided: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger(Vec<StepResult>);

impl Ledger {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wrap results exactly as stored. Order and vocabulary are preserved.
    pub fn from_stored(results: Vec<StepResult>) -> Self {
        Self(results)
    }

    /// Build a ledger from a full client submission.
    ///
    /// Every entry is canonicalized and checked against the test's step
    /// count; duplicate indices are rejected.
    pub fn from_submission(
        results: &[StepResult],
        step_count: usize,
    ) -> Result<Self, LedgerError> {
        let mut ledger = Self::new();
        for step in results {
            check_index(step.step_index, step_count)?;
            if ledger.get(step.step_index).is_some() {
                return Err(LedgerError::DuplicateStep(step.step_index));
            }
            ledger.upsert(canonicalize(step));
        }
        Ok(ledger)
    }

    pub fn results(&self) -> &[StepResult] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn get(&self, step_index: u32) -> Option<&StepResult> {
        self.0.iter().find(|s| s.step_index == step_index)
    }

    /// Normalized verdict recorded for a step, if any.
    pub fn verdict_at(&self, step_index: u32) -> Option<StepVerdict> {
        self.get(step_index).and_then(normalize)
    }

    /// Normalized verdicts in ledger order.
    pub fn verdicts(&self) -> impl Iterator<Item = Option<StepVerdict>> + '_ {
        self.0.iter().map(normalize)
    }

    /// Record a verdict for one step, replacing any earlier entry for it.
    pub fn record(
        &mut self,
        step_index: u32,
        verdict: StepVerdict,
        notes: Option<String>,
        step_count: usize,
    ) -> Result<(), LedgerError> {
        check_index(step_index, step_count)?;
        self.upsert(StepResult::new(step_index, verdict, notes));
        Ok(())
    }

    fn upsert(&mut self, step: StepResult) {
        // Stored ledgers are not guaranteed sorted, so no binary search.
        if let Some(existing) = self.0.iter_mut().find(|s| s.step_index == step.step_index) {
            *existing = step;
            return;
        }
        let pos = self
            .0
            .iter()
            .position(|s| s.step_index > step.step_index)
            .unwrap_or(self.0.len());
        self.0.insert(pos, step);
    }

    pub fn counts(&self) -> StepCounts {
        let mut counts = StepCounts::default();
        for verdict in self.verdicts() {
            match verdict {
                Some(StepVerdict::Pass) => counts.passed += 1,
                Some(StepVerdict::Fail) => counts.failed += 1,
                Some(StepVerdict::Skip) => counts.skipped += 1,
                None => counts.undecided += 1,
            }
        }
        counts
    }

    /// SHA-256 over the canonical JSON encoding of the normalized entries.
    pub fn digest(&self) -> String {
        let canonical: Vec<StepResult> = self.0.iter().map(canonicalize).collect();
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

fn check_index(step_index: u32, step_count: usize) -> Result<(), LedgerError> {
    if (step_index as usize) < step_count {
        Ok(())
    } else {
        Err(LedgerError::StepOutOfRange {
            index: step_index,
            step_count,
        })
    }
}
