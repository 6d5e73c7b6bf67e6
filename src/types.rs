//! Shared domain types for the sync core.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categories of buffered mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A single exercise marked done
    ExerciseCompletion,
    /// Moving on to the next training day
    DayProgression,
    /// Advancing to the next milestone
    MilestoneAdvancement,
    /// Aggregate user progress save
    ProgressUpdate,
}

impl OperationKind {
    /// Stable string form, used in ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExerciseCompletion => "exercise_completion",
            Self::DayProgression => "day_progression",
            Self::MilestoneAdvancement => "milestone_advancement",
            Self::ProgressUpdate => "progress_update",
        }
    }

    /// All known kinds
    pub const ALL: [OperationKind; 4] = [
        OperationKind::ExerciseCompletion,
        OperationKind::DayProgression,
        OperationKind::MilestoneAdvancement,
        OperationKind::ProgressUpdate,
    ];
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain entities with divergence risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Per-exercise set/rep/weight record
    ExerciseProgress,
    /// A training day's completion state
    DayCompletion,
    /// Milestone/day position pointer
    MilestoneAdvancement,
    /// Aggregate lifetime counters
    UserProgress,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExerciseProgress => "exercise_progress",
            Self::DayCompletion => "day_completion",
            Self::MilestoneAdvancement => "milestone_advancement",
            Self::UserProgress => "user_progress",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract a comparable timestamp from a JSON snapshot.
///
/// The first key in `keys` present on the snapshot wins. Accepts epoch
/// numbers as-is and RFC 3339 strings as epoch milliseconds; both sides
/// of a conflict use the same representation, so values stay comparable.
pub fn timestamp_field(value: &Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        let Some(field) = value.get(*key) else {
            continue;
        };
        if let Some(n) = field.as_i64() {
            return Some(n);
        }
        if let Some(f) = field.as_f64() {
            return Some(f as i64);
        }
        if let Some(s) = field.as_str() {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(s) {
                return Some(parsed.timestamp_millis());
            }
        }
    }
    None
}
