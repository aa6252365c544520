use std::collections::BTreeMap;
use std::path::Path;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::state::{ActionResult, ConvergenceState, FixOutcome, FixRequest, StatePatch, ValidationResult};

/// One unit of work in a workflow graph.
///
/// Steps read the current state and return a partial update. They should
/// report failure through the state rather than by erroring; an `Err` aborts
/// the run.
pub trait Step: Send + Sync + 'static {
    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Run the step against a snapshot of the state.
    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>>;
}

/// Picks the next transition target from the state.
pub trait Router: Send + Sync + 'static {
    /// Every outcome `route` can return.
    fn outcomes(&self) -> Vec<String>;

    /// Pure decision over the state. Must return one of `outcomes()`.
    fn route(&self, state: &ConvergenceState) -> String;
}

/// Where an action or check runs, and the run it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub working_dir: &'a Path,
    pub state: &'a ConvergenceState,
}

impl<'a> ActionContext<'a> {
    pub fn new(working_dir: &'a Path, state: &'a ConvergenceState) -> Self {
        Self { working_dir, state }
    }

    /// Variables available for `${VAR}` substitution.
    pub fn env_vars(&self) -> &'a BTreeMap<String, String> {
        &self.state.env_vars
    }

    pub fn config_dir(&self) -> Option<&'a Path> {
        self.state.config_directory.as_deref()
    }
}

/// A pre-action or the main script.
pub trait Action: Send + Sync + 'static {
    fn description(&self) -> &str;

    /// Run the action. Failures are reported in the result, never as errors.
    fn run<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ActionResult>;
}

/// One condition check.
pub trait Validator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run the check. Failures are reported in the result, never as errors.
    fn validate<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult>;
}

/// The external agent that attempts a repair.
pub trait Fixer: Send + Sync + 'static {
    fn fix(&self, request: FixRequest) -> BoxFuture<'_, FixOutcome>;
}

/// Step built from a synchronous closure.
pub struct FnStep<F> {
    description: String,
    f: F,
}

impl<F> FnStep<F>
where
    F: Fn(&ConvergenceState) -> Result<StatePatch> + Send + Sync + 'static,
{
    pub fn new(description: impl Into<String>, f: F) -> Self {
        Self {
            description: description.into(),
            f,
        }
    }
}

impl<F> Step for FnStep<F>
where
    F: Fn(&ConvergenceState) -> Result<StatePatch> + Send + Sync + 'static,
{
    fn description(&self) -> &str {
        &self.description
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        let result = (self.f)(state);
        Box::pin(async move { result })
    }
}

/// Router built from a closure and its declared outcomes.
pub struct FnRouter<F> {
    outcomes: Vec<String>,
    f: F,
}

impl<F> FnRouter<F>
where
    F: Fn(&ConvergenceState) -> String + Send + Sync + 'static,
{
    pub fn new<I, S>(outcomes: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outcomes: outcomes.into_iter().map(Into::into).collect(),
            f,
        }
    }
}

impl<F> Router for FnRouter<F>
where
    F: Fn(&ConvergenceState) -> String + Send + Sync + 'static,
{
    fn outcomes(&self) -> Vec<String> {
        self.outcomes.clone()
    }

    fn route(&self, state: &ConvergenceState) -> String {
        (self.f)(state)
    }
}
