//! # Conflict Resolution Engine
//!
//! Given two divergent snapshots of one logical entity, deterministically
//! produces a single resolved value plus justification, using a
//! pluggable, priority-ranked set of resolution strategies.
//!
//! Dispatch is first-match-wins over resolvers sorted by descending
//! priority, so new entity kinds get a new resolver instead of edits to
//! existing ones.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::EntityKind;

pub mod resolvers;

pub use resolvers::{
    DayCompletionResolver, ExerciseProgressResolver, MilestoneAdvancementResolver,
    TimestampFallbackResolver, UserProgressResolver,
};

/// A single detected disagreement between two snapshots of one entity.
///
/// A case never exists for byte-identical snapshots; detection
/// short-circuits first. Re-detecting the same disagreement produces a
/// new case with a new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCase {
    pub case_id: String,
    pub entity_kind: EntityKind,
    pub local: Value,
    pub remote: Value,
    /// Which nested value is in question; empty means whole-entity
    pub field_path: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

/// How a conflict was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    Merged,
    DeferredToUser,
}

/// Outcome of resolving a [`ConflictCase`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub case_id: String,
    pub strategy: ResolutionStrategy,
    /// Resolved entity value; absent only for `DeferredToUser`
    pub resolved: Option<Value>,
    /// Human-readable reasons for the decision
    pub rationale: Vec<String>,
    pub resolved_at: DateTime<Utc>,
    /// Whether a human made the final call
    pub resolved_by_user: bool,
    /// Whether a batch override bypassed the resolver registry
    pub forced: bool,
}

/// Explicit human decision for a deferred case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserChoice {
    KeepLocal,
    KeepRemote,
}

/// A named strategy able to decide a subset of conflict cases.
pub trait Resolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher priorities are consulted first.
    fn priority(&self) -> i32;

    /// Whether this strategy claims the case.
    fn can_resolve(&self, case: &ConflictCase) -> bool;

    fn resolve(&self, case: &ConflictCase, user_choice: Option<UserChoice>) -> Resolution;
}

/// Blanket strategy for [`ConflictEngine::resolve_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStrategy {
    /// Per-case resolution through the registry
    Auto,
    /// Every case keeps the local snapshot, bypassing the registry
    LocalWinsAll,
    /// Every case keeps the remote snapshot, bypassing the registry
    RemoteWinsAll,
}

/// Resolution engine with a priority-ranked resolver registry.
///
/// Construct once at application start; the active and resolved maps are
/// only mutated through the engine's own methods.
pub struct ConflictEngine {
    resolvers: RwLock<Vec<Arc<dyn Resolver>>>,
    active: RwLock<HashMap<String, ConflictCase>>,
    resolved: RwLock<HashMap<String, Resolution>>,
}

impl ConflictEngine {
    /// Engine with no resolvers registered.
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(Vec::new()),
            active: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with the built-in strategy set installed.
    pub fn with_builtin_resolvers() -> Self {
        let engine = Self::new();
        engine.register_resolver(Arc::new(MilestoneAdvancementResolver));
        engine.register_resolver(Arc::new(DayCompletionResolver));
        engine.register_resolver(Arc::new(ExerciseProgressResolver));
        engine.register_resolver(Arc::new(UserProgressResolver));
        engine.register_resolver(Arc::new(TimestampFallbackResolver));
        engine
    }

    /// Register a strategy. The registry stays sorted by descending
    /// priority so dispatch is first-match-wins.
    pub fn register_resolver(&self, resolver: Arc<dyn Resolver>) {
        let mut resolvers = self.resolvers.write();
        debug!(
            target: "conflict",
            name = resolver.name(),
            priority = resolver.priority(),
            "Resolver registered"
        );
        resolvers.push(resolver);
        resolvers.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// Compare two snapshots of one entity; `None` when they are
    /// structurally identical. A detected case is retained in the active
    /// set until resolved.
    pub fn detect_conflict(
        &self,
        local: &Value,
        remote: &Value,
        entity_kind: EntityKind,
        field_path: Vec<String>,
    ) -> Option<ConflictCase> {
        if local == remote {
            return None;
        }

        let case = ConflictCase {
            case_id: format!("conflict-{}", Uuid::new_v4()),
            entity_kind,
            local: local.clone(),
            remote: remote.clone(),
            field_path,
            observed_at: Utc::now(),
        };
        debug!(
            target: "conflict",
            case_id = %case.case_id,
            kind = %entity_kind,
            "Divergence detected"
        );
        self.active.write().insert(case.case_id.clone(), case.clone());
        Some(case)
    }

    /// Resolve a case. Idempotent per `case_id`: an already-resolved case
    /// returns the cached resolution instead of recomputing. Deferred
    /// outcomes are not cached, so the case can be closed later with a
    /// user choice.
    pub fn resolve_conflict(
        &self,
        case: &ConflictCase,
        user_choice: Option<UserChoice>,
    ) -> Resolution {
        if let Some(cached) = self.resolved.read().get(&case.case_id) {
            return cached.clone();
        }

        let resolution = self.compute_resolution(case, user_choice);

        if resolution.strategy == ResolutionStrategy::DeferredToUser {
            info!(
                target: "conflict",
                case_id = %case.case_id,
                "No resolver claimed case, deferred to user"
            );
            return resolution;
        }

        self.active.write().remove(&case.case_id);
        self.resolved
            .write()
            .insert(case.case_id.clone(), resolution.clone());
        info!(
            target: "conflict",
            case_id = %case.case_id,
            strategy = ?resolution.strategy,
            "Conflict resolved"
        );
        resolution
    }

    fn compute_resolution(
        &self,
        case: &ConflictCase,
        user_choice: Option<UserChoice>,
    ) -> Resolution {
        {
            let resolvers = self.resolvers.read();
            if let Some(resolver) = resolvers.iter().find(|r| r.can_resolve(case)) {
                debug!(
                    target: "conflict",
                    case_id = %case.case_id,
                    resolver = resolver.name(),
                    "Dispatching case"
                );
                return resolver.resolve(case, user_choice);
            }
        }

        if let Some(choice) = user_choice {
            // Human adjudication of an otherwise-unclaimed case.
            let (strategy, value, why) = match choice {
                UserChoice::KeepLocal => (
                    ResolutionStrategy::LocalWins,
                    case.local.clone(),
                    "user chose the local version",
                ),
                UserChoice::KeepRemote => (
                    ResolutionStrategy::RemoteWins,
                    case.remote.clone(),
                    "user chose the remote version",
                ),
            };
            return Resolution {
                case_id: case.case_id.clone(),
                strategy,
                resolved: Some(value),
                rationale: vec![why.to_string()],
                resolved_at: Utc::now(),
                resolved_by_user: true,
                forced: false,
            };
        }

        Resolution {
            case_id: case.case_id.clone(),
            strategy: ResolutionStrategy::DeferredToUser,
            resolved: None,
            rationale: vec!["no registered resolver claimed this case".to_string()],
            resolved_at: Utc::now(),
            resolved_by_user: false,
            forced: false,
        }
    }

    /// Resolve many cases with either per-case automatic resolution or a
    /// blanket override that bypasses the resolver registry entirely.
    pub fn resolve_batch(&self, cases: &[ConflictCase], strategy: BatchStrategy) -> Vec<Resolution> {
        cases
            .iter()
            .map(|case| match strategy {
                BatchStrategy::Auto => self.resolve_conflict(case, None),
                BatchStrategy::LocalWinsAll => self.force_resolution(case, UserChoice::KeepLocal),
                BatchStrategy::RemoteWinsAll => self.force_resolution(case, UserChoice::KeepRemote),
            })
            .collect()
    }

    fn force_resolution(&self, case: &ConflictCase, choice: UserChoice) -> Resolution {
        if let Some(cached) = self.resolved.read().get(&case.case_id) {
            return cached.clone();
        }

        let (strategy, value, why) = match choice {
            UserChoice::KeepLocal => (
                ResolutionStrategy::LocalWins,
                case.local.clone(),
                "batch override: local wins",
            ),
            UserChoice::KeepRemote => (
                ResolutionStrategy::RemoteWins,
                case.remote.clone(),
                "batch override: remote wins",
            ),
        };
        let resolution = Resolution {
            case_id: case.case_id.clone(),
            strategy,
            resolved: Some(value),
            rationale: vec![why.to_string()],
            resolved_at: Utc::now(),
            resolved_by_user: false,
            forced: true,
        };
        self.active.write().remove(&case.case_id);
        self.resolved
            .write()
            .insert(case.case_id.clone(), resolution.clone());
        resolution
    }

    /// Cases detected but not yet resolved.
    pub fn active_cases(&self) -> Vec<ConflictCase> {
        self.active.read().values().cloned().collect()
    }

    /// The retained resolution for a case, if any.
    pub fn resolution_for(&self, case_id: &str) -> Option<Resolution> {
        self.resolved.read().get(case_id).cloned()
    }

    /// Drop retained resolutions to bound memory growth. Returns how many
    /// were cleared.
    pub fn clear_resolved(&self) -> usize {
        let mut resolved = self.resolved.write();
        let cleared = resolved.len();
        resolved.clear();
        cleared
    }
}

impl Default for ConflictEngine {
    fn default() -> Self {
        Self::with_builtin_resolvers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_snapshots_never_become_a_case() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let snapshot = json!({"currentMilestone": 2, "currentDay": 14});

        assert!(engine
            .detect_conflict(&snapshot, &snapshot, EntityKind::MilestoneAdvancement, vec![])
            .is_none());
        assert!(engine.active_cases().is_empty());
    }

    #[test]
    fn test_detection_retains_active_case() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let local = json!({"currentMilestone": 3, "currentDay": 2});
        let remote = json!({"currentMilestone": 2, "currentDay": 30});

        let case = engine
            .detect_conflict(&local, &remote, EntityKind::MilestoneAdvancement, vec![])
            .unwrap();
        assert!(case.case_id.starts_with("conflict-"));
        assert_eq!(engine.active_cases().len(), 1);

        engine.resolve_conflict(&case, None);
        assert!(engine.active_cases().is_empty());
        assert!(engine.resolution_for(&case.case_id).is_some());
    }

    #[test]
    fn test_redetection_produces_new_case_id() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let local = json!({"currentMilestone": 3});
        let remote = json!({"currentMilestone": 2});

        let first = engine
            .detect_conflict(&local, &remote, EntityKind::MilestoneAdvancement, vec![])
            .unwrap();
        let second = engine
            .detect_conflict(&local, &remote, EntityKind::MilestoneAdvancement, vec![])
            .unwrap();
        assert_ne!(first.case_id, second.case_id);
    }

    #[test]
    fn test_resolution_is_idempotent_per_case() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = engine
            .detect_conflict(
                &json!({"currentMilestone": 3, "currentDay": 1}),
                &json!({"currentMilestone": 1, "currentDay": 29}),
                EntityKind::MilestoneAdvancement,
                vec![],
            )
            .unwrap();

        let first = engine.resolve_conflict(&case, None);
        let second = engine.resolve_conflict(&case, None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unclaimed_case_defers_to_user() {
        let engine = ConflictEngine::new();
        let case = engine
            .detect_conflict(
                &json!({"note": "a"}),
                &json!({"note": "b"}),
                EntityKind::ExerciseProgress,
                vec![],
            )
            .unwrap();

        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::DeferredToUser);
        assert!(resolution.resolved.is_none());
        assert!(!resolution.resolved_by_user);

        // Deferred outcomes stay active and uncached.
        assert_eq!(engine.active_cases().len(), 1);
        assert!(engine.resolution_for(&case.case_id).is_none());
    }

    #[test]
    fn test_user_choice_closes_deferred_case() {
        let engine = ConflictEngine::new();
        let case = engine
            .detect_conflict(
                &json!({"note": "local"}),
                &json!({"note": "remote"}),
                EntityKind::ExerciseProgress,
                vec![],
            )
            .unwrap();

        let deferred = engine.resolve_conflict(&case, None);
        assert_eq!(deferred.strategy, ResolutionStrategy::DeferredToUser);

        let resolved = engine.resolve_conflict(&case, Some(UserChoice::KeepRemote));
        assert_eq!(resolved.strategy, ResolutionStrategy::RemoteWins);
        assert_eq!(resolved.resolved, Some(json!({"note": "remote"})));
        assert!(resolved.resolved_by_user);
        assert!(engine.active_cases().is_empty());
    }

    #[test]
    fn test_batch_override_bypasses_resolvers_and_flags_forced() {
        let engine = ConflictEngine::with_builtin_resolvers();
        // A case the milestone resolver would hand to the remote side.
        let case = engine
            .detect_conflict(
                &json!({"currentMilestone": 1, "currentDay": 3}),
                &json!({"currentMilestone": 4, "currentDay": 1}),
                EntityKind::MilestoneAdvancement,
                vec![],
            )
            .unwrap();

        let resolutions = engine.resolve_batch(std::slice::from_ref(&case), BatchStrategy::LocalWinsAll);
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].strategy, ResolutionStrategy::LocalWins);
        assert_eq!(resolutions[0].resolved, Some(case.local.clone()));
        assert!(resolutions[0].forced);
    }

    #[test]
    fn test_batch_auto_uses_registry() {
        let engine = ConflictEngine::with_builtin_resolvers();
        let case = engine
            .detect_conflict(
                &json!({"currentMilestone": 1, "currentDay": 3}),
                &json!({"currentMilestone": 4, "currentDay": 1}),
                EntityKind::MilestoneAdvancement,
                vec![],
            )
            .unwrap();

        let resolutions = engine.resolve_batch(std::slice::from_ref(&case), BatchStrategy::Auto);
        assert_eq!(resolutions[0].strategy, ResolutionStrategy::RemoteWins);
        assert!(!resolutions[0].forced);
    }

    #[test]
    fn test_higher_priority_resolver_wins_overlap() {
        struct Stubborn(&'static str, i32, ResolutionStrategy);
        impl Resolver for Stubborn {
            fn name(&self) -> &'static str {
                self.0
            }
            fn priority(&self) -> i32 {
                self.1
            }
            fn can_resolve(&self, _case: &ConflictCase) -> bool {
                true
            }
            fn resolve(&self, case: &ConflictCase, _choice: Option<UserChoice>) -> Resolution {
                Resolution {
                    case_id: case.case_id.clone(),
                    strategy: self.2,
                    resolved: Some(case.local.clone()),
                    rationale: vec![self.0.to_string()],
                    resolved_at: Utc::now(),
                    resolved_by_user: false,
                    forced: false,
                }
            }
        }

        let engine = ConflictEngine::new();
        engine.register_resolver(Arc::new(Stubborn("low", 1, ResolutionStrategy::RemoteWins)));
        engine.register_resolver(Arc::new(Stubborn("high", 9, ResolutionStrategy::LocalWins)));

        let case = engine
            .detect_conflict(&json!(1), &json!(2), EntityKind::UserProgress, vec![])
            .unwrap();
        let resolution = engine.resolve_conflict(&case, None);
        assert_eq!(resolution.strategy, ResolutionStrategy::LocalWins);
        assert_eq!(resolution.rationale, vec!["high".to_string()]);
    }

    #[test]
    fn test_clear_resolved_bounds_memory() {
        let engine = ConflictEngine::with_builtin_resolvers();
        for day in 0..3 {
            let case = engine
                .detect_conflict(
                    &json!({"currentMilestone": day, "currentDay": 1}),
                    &json!({"currentMilestone": day + 1, "currentDay": 1}),
                    EntityKind::MilestoneAdvancement,
                    vec![],
                )
                .unwrap();
            engine.resolve_conflict(&case, None);
        }

        assert_eq!(engine.clear_resolved(), 3);
        assert_eq!(engine.clear_resolved(), 0);
    }
}
