//! Outcome reporting for best-effort hardware mutations
//!
//! Operations that touch several kernel objects (VF counts, VF attributes,
//! core bindings) return `Result<MutationReport, E>`. An `Err` means the
//! request was rejected before anything was written. An `Ok` report tells
//! whether every item was applied or only some of them.

use serde::{Deserialize, Serialize};

/// Aggregate outcome of a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Every item was written
    Applied,
    /// Some items failed, see [`MutationReport::failures`]
    Partial,
}

/// One item that could not be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationFailure {
    /// Object the write targeted (PCI address, attribute, CPU, ...)
    pub target: String,
    /// Error text reported by the kernel or tool
    pub reason: String,
}

/// Per-item record of a mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    applied: Vec<String>,
    failures: Vec<MutationFailure>,
}

impl MutationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report with a single applied item
    pub fn applied(target: impl Into<String>) -> Self {
        let mut report = Self::new();
        report.record_applied(target);
        report
    }

    pub fn record_applied(&mut self, target: impl Into<String>) {
        self.applied.push(target.into());
    }

    pub fn record_failure(&mut self, target: impl Into<String>, reason: impl ToString) {
        self.failures.push(MutationFailure {
            target: target.into(),
            reason: reason.to_string(),
        });
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: MutationReport) {
        self.applied.extend(other.applied);
        self.failures.extend(other.failures);
    }

    pub fn outcome(&self) -> Outcome {
        if self.failures.is_empty() {
            Outcome::Applied
        } else {
            Outcome::Partial
        }
    }

    pub fn is_applied(&self) -> bool {
        self.outcome() == Outcome::Applied
    }

    /// True when items were attempted and none of them succeeded
    pub fn nothing_applied(&self) -> bool {
        self.applied.is_empty() && !self.failures.is_empty()
    }

    pub fn applied_items(&self) -> &[String] {
        &self.applied
    }

    pub fn failures(&self) -> &[MutationFailure] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_tracks_failures() {
        let mut report = MutationReport::applied("0000:03:00.0/mac");
        assert_eq!(report.outcome(), Outcome::Applied);

        report.record_failure("0000:03:00.0/vlan", "Operation not permitted");
        assert_eq!(report.outcome(), Outcome::Partial);
        assert!(!report.nothing_applied());
        assert_eq!(report.failures()[0].target, "0000:03:00.0/vlan");
    }

    #[test]
    fn test_nothing_applied() {
        let mut report = MutationReport::new();
        assert!(!report.nothing_applied());

        report.record_failure("cpu3", "EINVAL");
        assert!(report.nothing_applied());

        let mut merged = MutationReport::applied("cpu2");
        merged.merge(report);
        assert_eq!(merged.applied_items(), ["cpu2".to_string()]);
        assert_eq!(merged.outcome(), Outcome::Partial);
    }
}
