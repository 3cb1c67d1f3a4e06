use serde::{Deserialize, Serialize};

use super::DryRunResult;

/// Decides whether a destructive run needs explicit user confirmation.
///
/// Both thresholds must be reached: a handful of deletions in a large tree
/// and a single deletion in a tiny tree both pass without asking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeletionGate {
    /// Minimum absolute number of deletions.
    pub min_deletions: u64,
    /// Minimum share of the source tree, in `0.0..=1.0`.
    pub min_fraction: f64,
}

impl Default for DeletionGate {
    fn default() -> Self {
        Self {
            min_deletions: 5,
            min_fraction: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    Proceed,
    ConfirmationRequired { deletion_fraction: f64 },
}

/// Share of the source tree that would be deleted. An empty source with
/// pending deletions counts as a full wipe.
pub fn deletion_fraction(deletion_count: u64, total_source_count: u64) -> f64 {
    if total_source_count > 0 {
        deletion_count as f64 / total_source_count as f64
    } else if deletion_count > 0 {
        1.0
    } else {
        0.0
    }
}

impl DeletionGate {
    pub fn from_percent(min_deletions: u64, min_percent: f64) -> Self {
        Self {
            min_deletions,
            min_fraction: min_percent / 100.0,
        }
    }

    pub fn requires_confirmation(&self, deletion_count: u64, total_source_count: u64) -> bool {
        deletion_count >= self.min_deletions
            && deletion_fraction(deletion_count, total_source_count) >= self.min_fraction
    }

    pub fn evaluate(&self, result: &DryRunResult) -> GateDecision {
        if self.requires_confirmation(result.deletion_count, result.total_source_count) {
            GateDecision::ConfirmationRequired {
                deletion_fraction: deletion_fraction(result.deletion_count, result.total_source_count),
            }
        } else {
            GateDecision::Proceed
        }
    }
}
