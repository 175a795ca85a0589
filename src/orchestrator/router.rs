//! Table-driven routing.
//!
//! Every `(stage, outcome)` pair a registered stage declares must map to a
//! `NextStep`. Completeness is checked once, when the router is built, so an
//! incomplete table never reaches a running workflow.

use breachgraph_common::{Context, NextStep};
use std::collections::BTreeMap;

use crate::errors::{ConfigurationError, StageError};
use crate::stage::StageRegistry;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingTable {
    routes: BTreeMap<String, BTreeMap<String, NextStep>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, stage: &str, outcome: &str, next: NextStep) -> Self {
        self.insert(stage, outcome, next);
        self
    }

    pub fn insert(&mut self, stage: &str, outcome: &str, next: NextStep) {
        self.routes
            .entry(stage.to_string())
            .or_default()
            .insert(outcome.to_string(), next);
    }

    pub fn get(&self, stage: &str, outcome: &str) -> Option<&NextStep> {
        self.routes.get(stage).and_then(|o| o.get(outcome))
    }

    /// `(stage, outcome, next)` in stage then outcome order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &NextStep)> {
        self.routes.iter().flat_map(|(stage, outcomes)| {
            outcomes
                .iter()
                .map(move |(outcome, next)| (stage.as_str(), outcome.as_str(), next))
        })
    }
}

/// Validated routing table plus the per-stage retry budgets it enforces.
#[derive(Debug, Clone)]
pub struct Router {
    table: RoutingTable,
    max_retries: BTreeMap<String, u32>,
}

impl Router {
    /// Check `table` against `registry` and build the router.
    pub fn new(table: RoutingTable, registry: &StageRegistry) -> Result<Self, ConfigurationError> {
        validate(&table, registry)?;
        let max_retries = registry
            .stages()
            .map(|def| (def.name.clone(), def.max_retries))
            .collect();
        Ok(Self { table, max_retries })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Next step after `current` reported `outcome`.
    ///
    /// Pure table lookup; `context` is accepted so routing stays a function of
    /// the run's visible state.
    pub fn route(
        &self,
        current: &str,
        outcome: &str,
        _context: &Context,
    ) -> Result<NextStep, StageError> {
        self.table
            .get(current, outcome)
            .cloned()
            .ok_or_else(|| StageError::UndeclaredOutcome {
                stage: current.to_string(),
                outcome: outcome.to_string(),
            })
    }

    /// Fail when entering `stage` for its `revisits`-th repeat would exceed
    /// its retry budget.
    pub fn check_revisit(&self, stage: &str, revisits: u32) -> Result<(), StageError> {
        let max = self.max_retries.get(stage).copied().unwrap_or(0);
        if revisits > max {
            return Err(StageError::RetryLimitExceeded {
                stage: stage.to_string(),
                attempts: revisits,
                max,
            });
        }
        Ok(())
    }
}

fn validate(table: &RoutingTable, registry: &StageRegistry) -> Result<(), ConfigurationError> {
    if registry.is_empty() {
        return Err(ConfigurationError::EmptyRegistry);
    }
    if !registry.contains(registry.entry()) {
        return Err(ConfigurationError::UnknownEntryStage {
            stage: registry.entry().to_string(),
        });
    }
    for def in registry.stages() {
        for outcome in def.declared_outcomes() {
            if table.get(&def.name, outcome).is_none() {
                return Err(ConfigurationError::MissingRoute {
                    stage: def.name.clone(),
                    outcome: outcome.to_string(),
                });
            }
        }
    }
    for (stage, outcome, next) in table.entries() {
        if !registry.contains(stage) {
            return Err(ConfigurationError::UnroutedStage {
                stage: stage.to_string(),
            });
        }
        if let Some(target) = next.target()
            && !registry.contains(target)
        {
            return Err(ConfigurationError::UnknownTarget {
                stage: stage.to_string(),
                outcome: outcome.to_string(),
                target: target.to_string(),
            });
        }
        if let NextStep::Pause { stage: target, choices, .. } = next
            && choices.is_empty()
        {
            return Err(ConfigurationError::EmptyChoices {
                stage: target.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{FnStage, StageDefinition, StageHandler, StageOutput};
    use std::sync::Arc;
    use std::time::Duration;

    fn noop() -> Arc<dyn StageHandler> {
        Arc::new(FnStage(|_ctx: Context| async {
            Ok::<_, anyhow::Error>(StageOutput::ok())
        }))
    }

    fn registry() -> StageRegistry {
        let mut registry = StageRegistry::new("enumerate");
        registry
            .register(StageDefinition::new("enumerate", noop(), &["ok", "retry"]))
            .unwrap();
        registry
            .register(StageDefinition::new("ingest", noop(), &["ok"]).with_max_retries(1))
            .unwrap();
        registry
    }

    fn table() -> RoutingTable {
        RoutingTable::new()
            .route("enumerate", "ok", NextStep::stage("ingest"))
            .route("enumerate", "retry", NextStep::stage("enumerate"))
            .route("ingest", "ok", NextStep::completed())
    }

    #[test]
    fn complete_table_routes_every_declared_pair() {
        let registry = registry();
        let router = Router::new(table(), &registry).unwrap();
        let ctx = Context::new();
        for def in registry.stages() {
            for outcome in def.declared_outcomes() {
                assert!(router.route(&def.name, outcome, &ctx).is_ok());
            }
        }
        assert_eq!(
            router.route("enumerate", "retry", &ctx).unwrap(),
            NextStep::stage("enumerate")
        );
    }

    #[test]
    fn missing_pair_is_rejected_at_construction() {
        let table = RoutingTable::new()
            .route("enumerate", "ok", NextStep::stage("ingest"))
            .route("ingest", "ok", NextStep::completed());
        let err = Router::new(table, &registry()).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::MissingRoute {
                stage: "enumerate".into(),
                outcome: "retry".into()
            }
        );
    }

    #[test]
    fn implicit_timeout_needs_a_route() {
        let mut registry = StageRegistry::new("q");
        registry
            .register(
                StageDefinition::new("q", noop(), &["ok"])
                    .with_timeout(Some(Duration::from_secs(5))),
            )
            .unwrap();
        let table = RoutingTable::new().route("q", "ok", NextStep::completed());
        let err = Router::new(table, &registry).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingRoute { outcome, .. } if outcome == "timeout"));
    }

    #[test]
    fn unknown_target_is_rejected() {
        let table = table().route("ingest", "ok", NextStep::stage("analyze"));
        let err = Router::new(table, &registry()).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownTarget { target, .. } if target == "analyze"));
    }

    #[test]
    fn routes_for_unregistered_stage_are_rejected() {
        let table = table().route("ghost", "ok", NextStep::completed());
        let err = Router::new(table, &registry()).unwrap_err();
        assert_eq!(err, ConfigurationError::UnroutedStage { stage: "ghost".into() });
    }

    #[test]
    fn pause_without_choices_is_rejected() {
        let table = table().route("ingest", "ok", NextStep::pause("enumerate", "again?", &[]));
        let err = Router::new(table, &registry()).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyChoices { stage: "enumerate".into() });
    }

    #[test]
    fn unknown_entry_and_empty_registry_are_rejected() {
        let err = Router::new(RoutingTable::new(), &StageRegistry::new("x")).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyRegistry);

        let mut registry = StageRegistry::new("missing");
        registry
            .register(StageDefinition::new("a", noop(), &[]))
            .unwrap();
        let err = Router::new(RoutingTable::new(), &registry).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownEntryStage { stage: "missing".into() });
    }

    #[test]
    fn undeclared_outcome_is_a_stage_error() {
        let router = Router::new(table(), &registry()).unwrap();
        let err = router.route("ingest", "maybe", &Context::new()).unwrap_err();
        assert!(matches!(err, StageError::UndeclaredOutcome { .. }));
    }

    #[test]
    fn revisit_budget_is_per_stage() {
        let router = Router::new(table(), &registry()).unwrap();
        assert!(router.check_revisit("enumerate", 3).is_ok());
        assert!(router.check_revisit("enumerate", 4).is_err());
        assert!(router.check_revisit("ingest", 1).is_ok());
        let err = router.check_revisit("ingest", 2).unwrap_err();
        assert!(matches!(err, StageError::RetryLimitExceeded { attempts: 2, max: 1, .. }));
    }
}
