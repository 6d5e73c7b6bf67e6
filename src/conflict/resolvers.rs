//! Built-in resolution strategies.
//!
//! Field names below are the mobile client's JSON snapshot keys. Every
//! merge rule relies on the fields being monotonic (counters, position
//! pointers) or carrying a usable timestamp; anything else wins or loses
//! wholesale.

use chrono::Utc;
use serde_json::{Map, Value};

use super::{ConflictCase, Resolution, ResolutionStrategy, Resolver, UserChoice};
use crate::types::{timestamp_field, EntityKind};

const MILESTONE: &str = "currentMilestone";
const DAY: &str = "currentDay";
const COMPLETED_EXERCISES: &str = "completedExercises";
const DAY_COMPLETED_AT: &str = "dayCompletedAt";
const EXERCISE_INDEX: &str = "currentExerciseIndex";

/// Lifetime counters that only ever grow
const COUNTER_FIELDS: [&str; 3] = ["totalWorkouts", "totalExercisesCompleted", "totalTimeMinutes"];
/// Furthest-forward position markers
const POSITION_FIELDS: [&str; 2] = [MILESTONE, DAY];
/// Date-valued fields where the latest observation wins
const DATE_FIELDS: [&str; 2] = ["lastWorkoutAt", "updatedAt"];

fn resolution(
    case: &ConflictCase,
    strategy: ResolutionStrategy,
    resolved: Value,
    rationale: Vec<String>,
) -> Resolution {
    Resolution {
        case_id: case.case_id.clone(),
        strategy,
        resolved: Some(resolved),
        rationale,
        resolved_at: Utc::now(),
        resolved_by_user: false,
        forced: false,
    }
}

fn int_field(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

/// Insert the larger of the two sides' numeric values for `key`, keeping
/// the winning side's original representation.
fn merge_max_field(merged: &mut Map<String, Value>, local: &Value, remote: &Value, key: &str) {
    let l = local.get(key).and_then(Value::as_f64);
    let r = remote.get(key).and_then(Value::as_f64);
    let winner = match (l, r) {
        (Some(l), Some(r)) => {
            if r > l {
                remote.get(key)
            } else {
                local.get(key)
            }
        }
        (Some(_), None) => local.get(key),
        (None, Some(_)) => remote.get(key),
        (None, None) => None,
    };
    if let Some(value) = winner {
        merged.insert(key.to_string(), value.clone());
    }
}

/// Insert the later of the two sides' date values for `key`.
fn merge_latest_field(merged: &mut Map<String, Value>, local: &Value, remote: &Value, key: &str) {
    let keys = [key];
    let l = timestamp_field(local, &keys);
    let r = timestamp_field(remote, &keys);
    let winner = match (l, r) {
        (Some(l), Some(r)) => {
            if r > l {
                remote.get(key)
            } else {
                local.get(key)
            }
        }
        (Some(_), None) => local.get(key),
        (None, Some(_)) => remote.get(key),
        (None, None) => None,
    };
    if let Some(value) = winner {
        merged.insert(key.to_string(), value.clone());
    }
}

/// Progress position is a single scalar pointer, not an aggregable
/// quantity: the snapshot that is further along wins outright.
pub struct MilestoneAdvancementResolver;

impl Resolver for MilestoneAdvancementResolver {
    fn name(&self) -> &'static str {
        "milestone-advancement"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_resolve(&self, case: &ConflictCase) -> bool {
        case.entity_kind == EntityKind::MilestoneAdvancement
            && case.local.get(MILESTONE).is_some()
            && case.remote.get(MILESTONE).is_some()
    }

    fn resolve(&self, case: &ConflictCase, _user_choice: Option<UserChoice>) -> Resolution {
        let local_pos = (
            int_field(&case.local, MILESTONE).unwrap_or(0),
            int_field(&case.local, DAY).unwrap_or(0),
        );
        let remote_pos = (
            int_field(&case.remote, MILESTONE).unwrap_or(0),
            int_field(&case.remote, DAY).unwrap_or(0),
        );

        if remote_pos > local_pos {
            resolution(
                case,
                ResolutionStrategy::RemoteWins,
                case.remote.clone(),
                vec![format!(
                    "remote position {:?} is further along than local {:?}",
                    remote_pos, local_pos
                )],
            )
        } else {
            // Ties keep the device-held snapshot.
            resolution(
                case,
                ResolutionStrategy::LocalWins,
                case.local.clone(),
                vec![format!(
                    "local position {:?} is at or past remote {:?}",
                    local_pos, remote_pos
                )],
            )
        }
    }
}

/// Completed-exercise markers are monotonic, so the union is always
/// safe; scalar completion fields follow the side with the later
/// completion timestamp, and the exercise pointer takes the maximum.
pub struct DayCompletionResolver;

impl Resolver for DayCompletionResolver {
    fn name(&self) -> &'static str {
        "day-completion"
    }

    fn priority(&self) -> i32 {
        9
    }

    fn can_resolve(&self, case: &ConflictCase) -> bool {
        case.entity_kind == EntityKind::DayCompletion
            && case.local.is_object()
            && case.remote.is_object()
    }

    fn resolve(&self, case: &ConflictCase, _user_choice: Option<UserChoice>) -> Resolution {
        let keys = [DAY_COMPLETED_AT];
        let local_ts = timestamp_field(&case.local, &keys);
        let remote_ts = timestamp_field(&case.remote, &keys);
        let remote_is_later = match (local_ts, remote_ts) {
            (Some(l), Some(r)) => r > l,
            (None, Some(_)) => true,
            _ => false,
        };
        let (base, other, base_name) = if remote_is_later {
            (&case.remote, &case.local, "remote")
        } else {
            (&case.local, &case.remote, "local")
        };

        let mut merged = base.as_object().cloned().unwrap_or_default();
        if let Some(extras) = other.as_object() {
            for (key, value) in extras {
                if !merged.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        let mut exercise_ids: Vec<Value> = base
            .get(COMPLETED_EXERCISES)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(additions) = other.get(COMPLETED_EXERCISES).and_then(Value::as_array) {
            for id in additions {
                if !exercise_ids.contains(id) {
                    exercise_ids.push(id.clone());
                }
            }
        }
        let union_len = exercise_ids.len();
        merged.insert(COMPLETED_EXERCISES.to_string(), Value::Array(exercise_ids));

        merge_max_field(&mut merged, &case.local, &case.remote, EXERCISE_INDEX);

        resolution(
            case,
            ResolutionStrategy::Merged,
            Value::Object(merged),
            vec![
                format!("union of completed exercises ({} total)", union_len),
                format!(
                    "completion fields taken from {} (later completion timestamp)",
                    base_name
                ),
                "exercise pointer merged by maximum".to_string(),
            ],
        )
    }
}

/// Set/rep/weight data is not merge-safe field-by-field, so the later
/// snapshot wins untouched.
pub struct ExerciseProgressResolver;

impl Resolver for ExerciseProgressResolver {
    fn name(&self) -> &'static str {
        "exercise-progress"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn can_resolve(&self, case: &ConflictCase) -> bool {
        let keys = ["completedAt", "timestamp"];
        case.entity_kind == EntityKind::ExerciseProgress
            && timestamp_field(&case.local, &keys).is_some()
            && timestamp_field(&case.remote, &keys).is_some()
    }

    fn resolve(&self, case: &ConflictCase, _user_choice: Option<UserChoice>) -> Resolution {
        let keys = ["completedAt", "timestamp"];
        let local_ts = timestamp_field(&case.local, &keys).unwrap_or(0);
        let remote_ts = timestamp_field(&case.remote, &keys).unwrap_or(0);

        if remote_ts > local_ts {
            resolution(
                case,
                ResolutionStrategy::RemoteWins,
                case.remote.clone(),
                vec![format!(
                    "remote snapshot is newer ({} > {})",
                    remote_ts, local_ts
                )],
            )
        } else {
            resolution(
                case,
                ResolutionStrategy::LocalWins,
                case.local.clone(),
                vec![format!(
                    "local snapshot is at least as new ({} >= {})",
                    local_ts, remote_ts
                )],
            )
        }
    }
}

/// Aggregate user progress merges field-wise: every merged field is
/// either a monotonically increasing counter or a furthest-forward
/// marker, so taking the maximum (or the latest date) is safe.
pub struct UserProgressResolver;

impl Resolver for UserProgressResolver {
    fn name(&self) -> &'static str {
        "user-progress"
    }

    fn priority(&self) -> i32 {
        7
    }

    fn can_resolve(&self, case: &ConflictCase) -> bool {
        case.entity_kind == EntityKind::UserProgress
            && case.local.is_object()
            && case.remote.is_object()
    }

    fn resolve(&self, case: &ConflictCase, _user_choice: Option<UserChoice>) -> Resolution {
        let mut merged = case.local.as_object().cloned().unwrap_or_default();
        if let Some(extras) = case.remote.as_object() {
            for (key, value) in extras {
                if !merged.contains_key(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        for key in COUNTER_FIELDS.iter().chain(POSITION_FIELDS.iter()) {
            merge_max_field(&mut merged, &case.local, &case.remote, key);
        }
        for key in DATE_FIELDS {
            merge_latest_field(&mut merged, &case.local, &case.remote, key);
        }

        resolution(
            case,
            ResolutionStrategy::Merged,
            Value::Object(merged),
            vec![
                "cumulative counters merged by maximum".to_string(),
                "position pointers merged by maximum".to_string(),
                "date fields merged by latest".to_string(),
            ],
        )
    }
}

/// Safety net for conflict kinds without a dedicated resolver: applies
/// whenever both snapshots carry some timestamp-like field.
pub struct TimestampFallbackResolver;

impl Resolver for TimestampFallbackResolver {
    fn name(&self) -> &'static str {
        "generic-timestamp"
    }

    fn priority(&self) -> i32 {
        1
    }

    fn can_resolve(&self, case: &ConflictCase) -> bool {
        let keys = ["timestamp", "updatedAt"];
        timestamp_field(&case.local, &keys).is_some()
            && timestamp_field(&case.remote, &keys).is_some()
    }

    fn resolve(&self, case: &ConflictCase, _user_choice: Option<UserChoice>) -> Resolution {
        let keys = ["timestamp", "updatedAt"];
        let local_ts = timestamp_field(&case.local, &keys).unwrap_or(0);
        let remote_ts = timestamp_field(&case.remote, &keys).unwrap_or(0);

        if remote_ts > local_ts {
            resolution(
                case,
                ResolutionStrategy::RemoteWins,
                case.remote.clone(),
                vec![format!(
                    "fallback: remote timestamp {} beats local {}",
                    remote_ts, local_ts
                )],
            )
        } else {
            resolution(
                case,
                ResolutionStrategy::LocalWins,
                case.local.clone(),
                vec![format!(
                    "fallback: local timestamp {} is at least remote {}",
                    local_ts, remote_ts
                )],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictEngine;
    use serde_json::json;

    fn detect(engine: &ConflictEngine, local: Value, remote: Value, kind: EntityKind) -> ConflictCase {
        engine
            .detect_conflict(&local, &remote, kind, vec![])
            .expect("snapshots must differ")
    }

    #[test]
    fn test_milestone_more_progress_wins_regardless_of_day() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"currentMilestone": 3, "currentDay": 1}),
            json!({"currentMilestone": 2, "currentDay": 29}),
            EntityKind::MilestoneAdvancement,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::LocalWins);
        assert_eq!(resolution.resolved, Some(case.local.clone()));
    }

    #[test]
    fn test_milestone_day_breaks_milestone_tie() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"currentMilestone": 2, "currentDay": 5}),
            json!({"currentMilestone": 2, "currentDay": 12}),
            EntityKind::MilestoneAdvancement,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::RemoteWins);
        assert_eq!(resolution.resolved, Some(case.remote.clone()));
    }

    #[test]
    fn test_day_completion_merges_union_and_later_completion() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({
                "dayCompleted": true,
                "dayCompletedAt": 2000,
                "completedExercises": ["squat", "bench"],
                "currentExerciseIndex": 2,
            }),
            json!({
                "dayCompleted": false,
                "dayCompletedAt": 1000,
                "completedExercises": ["row", "curl"],
                "currentExerciseIndex": 3,
            }),
            EntityKind::DayCompletion,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::Merged);

        let merged = resolution.resolved.unwrap();
        let ids = merged["completedExercises"].as_array().unwrap();
        assert_eq!(ids.len(), 4);
        // Completion flag and timestamp follow the later side (local).
        assert_eq!(merged["dayCompleted"], json!(true));
        assert_eq!(merged["dayCompletedAt"], json!(2000));
        // Exercise pointer: further along wins.
        assert_eq!(merged["currentExerciseIndex"], json!(3));
    }

    #[test]
    fn test_day_completion_union_has_no_duplicates() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"completedExercises": ["squat", "bench"], "dayCompletedAt": 500}),
            json!({"completedExercises": ["bench", "dip"], "dayCompletedAt": 900}),
            EntityKind::DayCompletion,
        );

        let resolution = engine.resolve_conflict(&case, None);
        let merged = resolution.resolved.unwrap();
        let ids: Vec<&str> = merged["completedExercises"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(ids, vec!["bench", "dip", "squat"]);
    }

    #[test]
    fn test_exercise_progress_later_snapshot_wins_untouched() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"completedAt": 1000, "sets": [{"reps": 12, "weightKg": 60}]}),
            json!({"completedAt": 2000, "sets": [{"reps": 10, "weightKg": 65}]}),
            EntityKind::ExerciseProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::RemoteWins);
        assert_eq!(resolution.resolved, Some(case.remote.clone()));
    }

    #[test]
    fn test_exercise_progress_prefers_completed_at_over_timestamp() {
        let engine = ConflictEngine::with_builtin_resolvers();
        // completedAt says local is newer even though timestamp disagrees.
        let case = detect(
            &engine,
            json!({"completedAt": 5000, "timestamp": 1}),
            json!({"completedAt": 4000, "timestamp": 9}),
            EntityKind::ExerciseProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::LocalWins);
    }

    #[test]
    fn test_user_progress_counters_merge_by_maximum() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({
                "totalWorkouts": 42,
                "totalExercisesCompleted": 310,
                "totalTimeMinutes": 1180,
                "currentMilestone": 2,
                "currentDay": 14,
                "updatedAt": 1000,
            }),
            json!({
                "totalWorkouts": 40,
                "totalExercisesCompleted": 325,
                "totalTimeMinutes": 1205,
                "currentMilestone": 3,
                "currentDay": 2,
                "updatedAt": 2000,
            }),
            EntityKind::UserProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::Merged);

        let merged = resolution.resolved.unwrap();
        assert_eq!(merged["totalWorkouts"], json!(42));
        assert_eq!(merged["totalExercisesCompleted"], json!(325));
        assert_eq!(merged["totalTimeMinutes"], json!(1205));
        assert_eq!(merged["currentMilestone"], json!(3));
        assert_eq!(merged["currentDay"], json!(14));
        assert_eq!(merged["updatedAt"], json!(2000));
    }

    #[test]
    fn test_user_progress_keeps_one_sided_fields() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"totalWorkouts": 10, "streakDays": 6}),
            json!({"totalWorkouts": 12, "favoriteExercise": "deadlift"}),
            EntityKind::UserProgress,
        );

        let merged = engine.resolve_conflict(&case, None).resolved.unwrap();
        assert_eq!(merged["totalWorkouts"], json!(12));
        assert_eq!(merged["streakDays"], json!(6));
        assert_eq!(merged["favoriteExercise"], json!("deadlift"));
    }

    #[test]
    fn test_fallback_applies_to_unmatched_kind_with_timestamps() {
        let engine = ConflictEngine::with_builtin_resolvers();
        // Exercise progress without completedAt/timestamp fields falls
        // through the specialized resolver to the generic one.
        let case = detect(
            &engine,
            json!({"updatedAt": 300, "note": "local"}),
            json!({"updatedAt": 700, "note": "remote"}),
            EntityKind::ExerciseProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::RemoteWins);
        assert_eq!(resolution.resolved, Some(case.remote.clone()));
    }

    #[test]
    fn test_no_timestamps_anywhere_defers() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"note": "local"}),
            json!({"note": "remote"}),
            EntityKind::ExerciseProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::DeferredToUser);
        assert!(resolution.resolved.is_none());
    }

    #[test]
    fn test_rfc3339_timestamps_compare_correctly() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = detect(
            &engine,
            json!({"completedAt": "2024-05-01T10:00:00Z", "sets": 3}),
            json!({"completedAt": "2024-05-01T18:30:00Z", "sets": 4}),
            EntityKind::ExerciseProgress,
        );

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::RemoteWins);
    }
}
