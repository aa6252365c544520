//! Declarative workflow topology.
//!
//! A `GraphSpec` lists named steps (each bound to a registered step type) and
//! the transitions between them. Transitions leave either a step or the
//! reserved `START` marker and arrive at one or more steps or the reserved
//! `END` marker. Transitions with several targets pick one at run time through
//! a named routing function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reserved source marker for the entry transition.
pub const START: &str = "START";
/// Reserved target marker for run termination.
pub const END: &str = "END";

/// A named step bound to a registered step type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique name within the graph.
    pub name: String,
    /// Registered step type.
    #[serde(rename = "type")]
    pub step_type: String,
}

/// One target or an ordered list of targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Targets {
    One(String),
    Many(Vec<String>),
}

impl Targets {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Targets::One(t) => std::slice::from_ref(t),
            Targets::Many(ts) => ts,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<&str> for Targets {
    fn from(s: &str) -> Self {
        Targets::One(s.to_string())
    }
}

impl From<String> for Targets {
    fn from(s: String) -> Self {
        Targets::One(s)
    }
}

impl From<Vec<&str>> for Targets {
    fn from(v: Vec<&str>) -> Self {
        Targets::Many(v.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for Targets {
    fn from(v: Vec<String>) -> Self {
        Targets::Many(v)
    }
}

/// A transition out of a step (or `START`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSpec {
    pub from: String,
    pub to: Targets,
    /// Registered routing function; required when `to` has several targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
    /// Explicit outcome -> target binding, overriding inference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<BTreeMap<String, String>>,
}

impl TransitionSpec {
    /// Create an unconditional transition.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Targets::One(to.into()),
            routing: None,
            outcomes: None,
        }
    }

    /// Create a routed transition.
    pub fn routed(
        from: impl Into<String>,
        to: impl Into<Targets>,
        routing: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            routing: Some(routing.into()),
            outcomes: None,
        }
    }

    /// Bind outcomes to targets explicitly.
    pub fn with_outcomes<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.outcomes = Some(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn is_conditional(&self) -> bool {
        self.routing.is_some()
    }
}

/// Declarative workflow: steps, transitions, optional entry point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub transitions: Vec<TransitionSpec>,
    /// Entry step; defaults to the first declared step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl GraphSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a step.
    pub fn step(mut self, name: impl Into<String>, step_type: impl Into<String>) -> Self {
        self.steps.push(StepSpec {
            name: name.into(),
            step_type: step_type.into(),
        });
        self
    }

    /// Add an unconditional transition.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.transitions.push(TransitionSpec::always(from, to));
        self
    }

    /// Add a routed transition.
    pub fn route(
        mut self,
        from: impl Into<String>,
        to: impl Into<Targets>,
        routing: impl Into<String>,
    ) -> Self {
        self.transitions.push(TransitionSpec::routed(from, to, routing));
        self
    }

    /// Add a fully specified transition.
    pub fn transition(mut self, transition: TransitionSpec) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Set the entry step.
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = GraphSpec::new()
            .step("setup", "pre_actions")
            .step("main", "run_main_script")
            .edge(START, "setup")
            .route("setup", vec!["main", END], "check_pre_actions")
            .edge("main", END);

        assert_eq!(spec.steps.len(), 2);
        assert_eq!(spec.transitions.len(), 3);
        assert!(spec.has_step("main"));
        assert!(!spec.has_step(END));
        assert!(spec.transitions[1].is_conditional());
        assert_eq!(spec.transitions[1].to.len(), 2);
    }

    #[test]
    fn test_parse_from_toml() {
        let toml_str = r#"
entry = "setup"

[[steps]]
name = "setup"
type = "pre_actions"

[[steps]]
name = "main"
type = "run_main_script"

[[transitions]]
from = "setup"
to = ["main", "END"]
routing = "check_pre_actions"

[[transitions]]
from = "main"
to = "END"
"#;
        let spec: GraphSpec = toml::from_str(toml_str).unwrap();
        assert_eq!(spec.entry.as_deref(), Some("setup"));
        assert_eq!(spec.steps[0].step_type, "pre_actions");
        assert_eq!(
            spec.transitions[0].to,
            Targets::Many(vec!["main".into(), "END".into()])
        );
        assert_eq!(spec.transitions[1].to, Targets::One("END".into()));
        assert!(spec.transitions[1].routing.is_none());
    }

    #[test]
    fn test_explicit_outcomes() {
        let t = TransitionSpec::routed("decide", vec!["again", END], "should_continue")
            .with_outcomes([("retry", "again"), ("end_failure", END)]);
        let outcomes = t.outcomes.unwrap();
        assert_eq!(outcomes.get("retry").map(String::as_str), Some("again"));
    }
}
