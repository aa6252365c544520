use std::collections::HashSet;

use reconverge_core::error::{ConvergeError, Result};
use reconverge_core::spec::{GraphSpec, END, START};

use crate::registry::{RoutingRegistry, StepRegistry};

/// Checks a `GraphSpec` against the registries before compilation.
///
/// Checks run in a fixed order and the first violated category is reported:
/// step types, unique non-reserved names, non-empty graph, transition endpoints, routing
/// names, entry point.
pub struct TopologyValidator<'a> {
    steps: &'a StepRegistry,
    routes: &'a RoutingRegistry,
}

impl<'a> TopologyValidator<'a> {
    pub fn new(steps: &'a StepRegistry, routes: &'a RoutingRegistry) -> Self {
        Self { steps, routes }
    }

    pub fn validate(&self, spec: &GraphSpec) -> Result<()> {
        self.check_step_types(spec)?;
        check_unique_names(spec)?;
        if spec.steps.is_empty() {
            return Err(ConvergeError::EmptyGraph);
        }
        check_endpoints(spec)?;
        self.check_routing(spec)?;
        if let Some(entry) = &spec.entry {
            if !spec.has_step(entry) {
                return Err(ConvergeError::InvalidEntry(entry.clone()));
            }
        }
        Ok(())
    }

    fn check_step_types(&self, spec: &GraphSpec) -> Result<()> {
        for step in &spec.steps {
            if !self.steps.is_registered(&step.step_type) {
                return Err(ConvergeError::UnknownStepType {
                    step: step.name.clone(),
                    step_type: step.step_type.clone(),
                    available: self.steps.available(),
                });
            }
        }
        Ok(())
    }

    fn check_routing(&self, spec: &GraphSpec) -> Result<()> {
        for routing in spec.transitions.iter().filter_map(|t| t.routing.as_deref()) {
            if !self.routes.is_registered(routing) {
                return Err(ConvergeError::UnknownRouting {
                    routing: routing.to_string(),
                    available: self.routes.available(),
                });
            }
        }
        Ok(())
    }
}

fn check_unique_names(spec: &GraphSpec) -> Result<()> {
    if let Some(reserved) = spec.step_names().find(|n| *n == START || *n == END) {
        return Err(ConvergeError::ReservedStepName(reserved.to_string()));
    }
    let mut seen = HashSet::new();
    let mut duplicates: Vec<&str> = Vec::new();
    for name in spec.step_names() {
        if !seen.insert(name) && !duplicates.contains(&name) {
            duplicates.push(name);
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ConvergeError::DuplicateStepName(duplicates.join(", ")))
    }
}

fn check_endpoints(spec: &GraphSpec) -> Result<()> {
    for t in &spec.transitions {
        let to = t.to.as_slice().join(", ");
        let dangling = |unknown: &str| ConvergeError::DanglingTransition {
            from: t.from.clone(),
            to: to.clone(),
            unknown: unknown.to_string(),
        };

        if t.from != START && !spec.has_step(&t.from) {
            return Err(dangling(&t.from));
        }
        if t.to.is_empty() {
            return Err(dangling("(no target)"));
        }
        for target in t.to.as_slice() {
            if target != END && !spec.has_step(target) {
                return Err(dangling(target));
            }
        }
    }
    Ok(())
}
