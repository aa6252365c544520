//! Scripted collaborators and state fixtures for tests.
//!
//! Every scripted collaborator hands out a `CallCounter` before it is moved
//! into a `Collaborators` set, so tests can assert how often it ran.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use reconverge_core::state::{
    ActionResult, Collaborators, ConvergenceState, FixOutcome, FixRequest, ValidationResult,
};
use reconverge_core::traits::{Action, ActionContext, Fixer, Validator};

/// Shared invocation counter.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Record a call; returns the zero-based index of this call.
    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Outcome for call `n`; the last entry repeats forever.
fn scripted(outcomes: &[bool], n: usize) -> bool {
    outcomes
        .get(n)
        .or_else(|| outcomes.last())
        .copied()
        .unwrap_or(true)
}

// ── ScriptedAction ──────────────────────────────────────────────

/// Action whose success follows a fixed script.
pub struct ScriptedAction {
    description: String,
    outcomes: Vec<bool>,
    calls: CallCounter,
}

impl ScriptedAction {
    pub fn sequence(description: impl Into<String>, outcomes: Vec<bool>) -> Self {
        Self {
            description: description.into(),
            outcomes,
            calls: CallCounter::default(),
        }
    }

    pub fn succeeding(description: impl Into<String>) -> Self {
        Self::sequence(description, vec![true])
    }

    pub fn failing(description: impl Into<String>) -> Self {
        Self::sequence(description, vec![false])
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl Action for ScriptedAction {
    fn description(&self) -> &str {
        &self.description
    }

    fn run<'a>(&'a self, _ctx: ActionContext<'a>) -> BoxFuture<'a, ActionResult> {
        let n = self.calls.bump();
        let success = scripted(&self.outcomes, n);
        Box::pin(async move {
            ActionResult {
                action: self.description.clone(),
                success,
                output: format!("call {}", n + 1),
                stderr: if success { String::new() } else { "scripted failure".into() },
                exit_code: Some(if success { 0 } else { 1 }),
                duration_ms: 0,
                metadata: Default::default(),
            }
        })
    }
}

// ── ScriptedValidator ───────────────────────────────────────────

/// Condition check whose result follows a fixed script.
pub struct ScriptedValidator {
    name: String,
    outcomes: Vec<bool>,
    calls: CallCounter,
}

impl ScriptedValidator {
    pub fn sequence(name: impl Into<String>, outcomes: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            outcomes,
            calls: CallCounter::default(),
        }
    }

    pub fn passing(name: impl Into<String>) -> Self {
        Self::sequence(name, vec![true])
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self::sequence(name, vec![false])
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }
}

impl Validator for ScriptedValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate<'a>(&'a self, _ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult> {
        let n = self.calls.bump();
        let success = scripted(&self.outcomes, n);
        Box::pin(async move {
            if success {
                ValidationResult::passed(&self.name, format!("check {} passed", n + 1))
            } else {
                let mut result =
                    ValidationResult::failed(&self.name, "scripted failure", Some(1));
                result.output = format!("check {} failed", n + 1);
                result
            }
        })
    }
}

// ── CountingFixer ───────────────────────────────────────────────

/// Shared log of the requests a `CountingFixer` received.
#[derive(Debug, Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<FixRequest>>>);

impl RequestLog {
    pub fn all(&self) -> Vec<FixRequest> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixer that records requests and returns a canned outcome.
pub struct CountingFixer {
    outcome: FixOutcome,
    calls: CallCounter,
    requests: RequestLog,
}

impl CountingFixer {
    pub fn new() -> Self {
        Self::returning(FixOutcome::completed(vec!["applied a fix".into()], 1))
    }

    pub fn returning(outcome: FixOutcome) -> Self {
        Self {
            outcome,
            calls: CallCounter::default(),
            requests: RequestLog::default(),
        }
    }

    pub fn calls(&self) -> CallCounter {
        self.calls.clone()
    }

    pub fn requests(&self) -> RequestLog {
        self.requests.clone()
    }
}

impl Default for CountingFixer {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixer for CountingFixer {
    fn fix(&self, request: FixRequest) -> BoxFuture<'_, FixOutcome> {
        self.calls.bump();
        self.requests.0.lock().unwrap().push(request);
        let outcome = self.outcome.clone();
        Box::pin(async move { outcome })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Fresh state in `dir` with the given collaborators.
pub fn state_with(max_attempts: u32, dir: &Path, collaborators: Collaborators) -> ConvergenceState {
    ConvergenceState::new(max_attempts, dir).with_collaborators(collaborators)
}

/// Temporary working directory, removed on drop.
pub fn temp_workdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}
