//! Built-in routing functions for the default convergence topology.
//!
//! Routers are pure: they read the state and name an outcome, nothing else.

use reconverge_graph::RoutingRegistry;
use reconverge_core::state::ConvergenceState;
use reconverge_core::traits::Router;

pub const CONTINUE: &str = "continue";
pub const END_FAILURE: &str = "end_failure";
pub const END_SUCCESS: &str = "end_success";
pub const VALIDATORS_PASSED: &str = "validators_passed";
pub const RETRY: &str = "retry";
pub const RUN_MAIN_SCRIPT: &str = "run_main_script";
pub const AI_FIX: &str = "ai_fix";

fn outcomes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Stop when any setup action failed.
pub struct CheckPreActions;

impl Router for CheckPreActions {
    fn outcomes(&self) -> Vec<String> {
        outcomes(&[CONTINUE, END_FAILURE])
    }

    fn route(&self, state: &ConvergenceState) -> String {
        let outcome = if state.pre_actions_failed {
            END_FAILURE
        } else {
            CONTINUE
        };
        outcome.to_string()
    }
}

/// Finish straight away when the primary task succeeded; otherwise start fixing.
pub struct CheckMainScript;

impl Router for CheckMainScript {
    fn outcomes(&self) -> Vec<String> {
        outcomes(&[END_SUCCESS, CONTINUE])
    }

    fn route(&self, state: &ConvergenceState) -> String {
        let outcome = if state.primary_task_succeeded {
            END_SUCCESS
        } else {
            CONTINUE
        };
        outcome.to_string()
    }
}

/// Decide after validation. An exhausted budget wins over passing checks.
pub struct ShouldContinue;

impl Router for ShouldContinue {
    fn outcomes(&self) -> Vec<String> {
        outcomes(&[VALIDATORS_PASSED, END_FAILURE, RETRY])
    }

    fn route(&self, state: &ConvergenceState) -> String {
        let outcome = if state.budget_exhausted() {
            END_FAILURE
        } else if state.success {
            VALIDATORS_PASSED
        } else {
            RETRY
        };
        outcome.to_string()
    }
}

/// After a new attempt is counted: re-run the primary task once the checks
/// pass, keep fixing while they fail.
pub struct RouteAfterIncrement;

impl Router for RouteAfterIncrement {
    fn outcomes(&self) -> Vec<String> {
        outcomes(&[RUN_MAIN_SCRIPT, AI_FIX])
    }

    fn route(&self, state: &ConvergenceState) -> String {
        let outcome = if state.success {
            RUN_MAIN_SCRIPT
        } else {
            AI_FIX
        };
        outcome.to_string()
    }
}

/// Registry holding every built-in routing function.
pub fn builtin_routes() -> RoutingRegistry {
    let mut routes = RoutingRegistry::new();
    routes.register("check_pre_actions", CheckPreActions);
    routes.register("check_main_script", CheckMainScript);
    routes.register("should_continue", ShouldContinue);
    routes.register("route_after_increment", RouteAfterIncrement);
    routes
}
