//! Step Registry & Dependency Resolver
//!
//! Steps are registered once at program start. [`StepRegistry::resolve`]
//! turns the declared dependencies into an execution order before any step
//! runs, so a misconfigured graph is a startup error rather than a mid-run
//! surprise.
//!
//! # Ordering Rules
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Several steps ready at once | earliest registered runs first |
//! | Dependency on an unregistered id | `UnknownDependency` |
//! | Dependency cycle | `Cycle`, naming every step left unresolved |
//!
//! The order is a pure function of the registrations, so identical
//! registrations always produce identical runs.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::step::Step;

/// State keys the orchestrator writes for its own bookkeeping.
///
/// Steps cannot use these as idempotency keys.
pub const RESERVED_KEYS: &[&str] = &["LAST_FAILED_STEP", "LAST_FAILURE_REASON", "LAST_FAILURE_AT"];

/// Registration and ordering errors. All are fatal configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("step {0} is registered twice")]
    DuplicateStep(String),

    #[error("steps {first} and {second} share idempotency key {key}")]
    DuplicateKey {
        key: String,
        first: String,
        second: String,
    },

    #[error("step {step} uses reserved state key {key}")]
    ReservedKey { step: String, key: String },

    #[error("step {step} has an invalid idempotency key: {reason}")]
    InvalidKey { step: String, reason: String },

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("unknown step {0}")]
    UnknownStep(String),
}

/// Ordered collection of registered steps.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<Step>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a builder.
    pub fn builder() -> StepRegistryBuilder {
        StepRegistryBuilder::default()
    }

    /// Register a step.
    ///
    /// # Errors
    ///
    /// - `DuplicateStep` if the id is taken
    /// - `DuplicateKey` if another step records completion under the same key
    /// - `ReservedKey` / `InvalidKey` if the key cannot be a state key
    pub fn register(&mut self, step: Step) -> Result<(), ResolveError> {
        if self.get(step.id()).is_some() {
            return Err(ResolveError::DuplicateStep(step.id().to_string()));
        }
        if RESERVED_KEYS.contains(&step.key()) {
            return Err(ResolveError::ReservedKey {
                step: step.id().to_string(),
                key: step.key().to_string(),
            });
        }
        if let Err(e) = crate::state_store::validate_key(step.key()) {
            return Err(ResolveError::InvalidKey {
                step: step.id().to_string(),
                reason: e.to_string(),
            });
        }
        if let Some(existing) = self.steps.iter().find(|s| s.key() == step.key()) {
            return Err(ResolveError::DuplicateKey {
                key: step.key().to_string(),
                first: existing.id().to_string(),
                second: step.id().to_string(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Look up a step by id.
    pub fn get(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    /// Steps in registration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Deterministic topological order of all registered steps.
    ///
    /// Kahn's algorithm where the ready set is keyed by registration index,
    /// so ties always go to the earliest registered step.
    pub fn resolve(&self) -> Result<Vec<&Step>, ResolveError> {
        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id(), i))
            .collect();

        let mut remaining_deps = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];

        for (i, step) in self.steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in step.dependencies() {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(ResolveError::UnknownDependency {
                        step: step.id().to_string(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(d) {
                    remaining_deps[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = remaining_deps
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(next) = ready.pop_first() {
            order.push(&self.steps[next]);
            for &dependent in &dependents[next] {
                remaining_deps[dependent] -= 1;
                if remaining_deps[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.steps.len() {
            let cyclic = self
                .steps
                .iter()
                .enumerate()
                .filter(|(i, _)| remaining_deps[*i] > 0)
                .map(|(_, s)| s.id().to_string())
                .collect();
            return Err(ResolveError::Cycle(cyclic));
        }

        Ok(order)
    }
}

/// Builder populating a [`StepRegistry`] at program start.
#[derive(Debug, Default)]
pub struct StepRegistryBuilder {
    steps: Vec<Step>,
}

impl StepRegistryBuilder {
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Register every step and verify the graph resolves.
    pub fn build(self) -> Result<StepRegistry, ResolveError> {
        let mut registry = StepRegistry::new();
        for step in self.steps {
            registry.register(step)?;
        }
        registry.resolve()?;
        Ok(registry)
    }
}
