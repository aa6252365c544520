use std::time::Instant;

use tracing::{debug, info, info_span, Instrument};

use reconverge_core::error::{ConvergeError, Result};
use reconverge_core::state::ConvergenceState;

use crate::compiler::{CompiledGraph, Successor, Target};

/// Step ceiling used when none is configured: `6 × max_attempts + 10`.
pub fn default_step_limit(max_attempts: u32) -> usize {
    6 * max_attempts as usize + 10
}

/// Result of driving a graph to completion.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The final merged state.
    pub state: ConvergenceState,
    /// Step names in execution order.
    pub visited: Vec<String>,
    /// Total execution time in milliseconds.
    pub total_elapsed_ms: u64,
}

/// Drives a `CompiledGraph` from its entry step to `END`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    step_limit: Option<usize>,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the step ceiling.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = Some(limit);
        self
    }

    /// The ceiling that applies to a run starting from `state`.
    pub fn step_limit_for(&self, state: &ConvergenceState) -> usize {
        self.step_limit
            .unwrap_or_else(|| default_step_limit(state.max_attempts()))
    }

    /// Run the graph and return the final state.
    pub async fn run(
        &self,
        graph: &CompiledGraph,
        state: ConvergenceState,
    ) -> Result<ConvergenceState> {
        Ok(self.run_traced(graph, state).await?.state)
    }

    /// Run the graph, also reporting the visited steps and elapsed time.
    pub async fn run_traced(
        &self,
        graph: &CompiledGraph,
        state: ConvergenceState,
    ) -> Result<ExecutionResult> {
        let span = info_span!("run", run_id = %state.run_id);
        self.drive(graph, state).instrument(span).await
    }

    async fn drive(
        &self,
        graph: &CompiledGraph,
        mut state: ConvergenceState,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let limit = self.step_limit_for(&state);
        let mut visited: Vec<String> = Vec::new();
        let mut current = graph.entry().to_string();

        info!(entry = %current, limit, "Starting graph run");

        loop {
            if visited.len() >= limit {
                return Err(ConvergeError::RecursionExceeded {
                    limit,
                    steps: visited.len() + 1,
                });
            }

            let step = graph.step(&current)?;
            debug!(step = %current, attempt = state.attempt, "Executing step");

            let patch = step.run(&state).await.map_err(|e| match e {
                ConvergeError::StepFailed { .. } => e,
                other => ConvergeError::StepFailed {
                    step: current.clone(),
                    message: other.to_string(),
                },
            })?;
            state.apply(patch);
            visited.push(current.clone());

            let next = match graph.successor(&current) {
                None => {
                    debug!(step = %current, "No outgoing transition, run complete");
                    break;
                }
                Some(Successor::Fixed(target)) => target.clone(),
                Some(Successor::Routed {
                    routing,
                    router,
                    table,
                }) => {
                    let outcome = router.route(&state);
                    debug!(step = %current, routing = %routing, outcome = %outcome, "Routed");
                    table
                        .get(&outcome)
                        .cloned()
                        .ok_or_else(|| ConvergeError::UnknownOutcome {
                            step: current.clone(),
                            routing: routing.clone(),
                            outcome,
                        })?
                }
            };

            match next {
                Target::End => break,
                Target::Step(name) => current = name,
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            steps = visited.len(),
            attempt = state.attempt,
            success = state.success,
            total_elapsed_ms,
            "Graph run complete"
        );

        Ok(ExecutionResult {
            state,
            visited,
            total_elapsed_ms,
        })
    }
}
