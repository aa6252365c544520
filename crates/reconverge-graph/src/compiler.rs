use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use reconverge_core::error::{ConvergeError, Result};
use reconverge_core::spec::{GraphSpec, TransitionSpec, END, START};
use reconverge_core::traits::{Router, Step};

use crate::registry::{RoutingRegistry, StepRegistry};
use crate::validator::TopologyValidator;

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Step(String),
    End,
}

impl Target {
    fn parse(name: &str) -> Self {
        if name == END {
            Target::End
        } else {
            Target::Step(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Target::Step(name) => name,
            Target::End => END,
        }
    }
}

/// The resolved outgoing transition of a step.
#[derive(Clone)]
pub enum Successor {
    /// Unconditional.
    Fixed(Target),
    /// Chosen at run time by a router.
    Routed {
        routing: String,
        router: Arc<dyn Router>,
        table: BTreeMap<String, Target>,
    },
}

impl Successor {
    /// Every target this transition can lead to.
    pub fn targets(&self) -> Vec<&Target> {
        match self {
            Successor::Fixed(t) => vec![t],
            Successor::Routed { table, .. } => {
                let mut out: Vec<&Target> = Vec::new();
                for t in table.values() {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
                out
            }
        }
    }
}

impl fmt::Debug for Successor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Successor::Fixed(t) => f.debug_tuple("Fixed").field(t).finish(),
            Successor::Routed { routing, table, .. } => f
                .debug_struct("Routed")
                .field("routing", routing)
                .field("table", table)
                .finish(),
        }
    }
}

pub(crate) struct CompiledStep {
    pub(crate) step_type: String,
    pub(crate) step: Arc<dyn Step>,
}

/// An executable state machine. Immutable and reusable across runs.
pub struct CompiledGraph {
    entry: String,
    order: Vec<String>,
    steps: HashMap<String, CompiledStep>,
    successors: HashMap<String, Successor>,
}

impl CompiledGraph {
    /// Name of the first step to run.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Step names in declaration order.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn step_type(&self, name: &str) -> Option<&str> {
        self.steps.get(name).map(|s| s.step_type.as_str())
    }

    pub(crate) fn step(&self, name: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(name)
            .map(|s| s.step.clone())
            .ok_or_else(|| ConvergeError::NotFound {
                kind: "step",
                name: name.to_string(),
                available: self.order.join(", "),
            })
    }

    /// The outgoing transition of a step; `None` means the step is terminal.
    pub fn successor(&self, name: &str) -> Option<&Successor> {
        self.successors.get(name)
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("entry", &self.entry)
            .field("steps", &self.order)
            .field("successors", &self.successors)
            .finish()
    }
}

impl fmt::Display for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{START} -> {}", self.entry)?;
        for name in &self.order {
            let step_type = self.step_type(name).unwrap_or("?");
            match self.successors.get(name) {
                None => writeln!(f, "{name} ({step_type}) -> {END}")?,
                Some(Successor::Fixed(t)) => {
                    writeln!(f, "{name} ({step_type}) -> {}", t.as_str())?
                }
                Some(Successor::Routed { routing, table, .. }) => {
                    let arms = table
                        .iter()
                        .map(|(outcome, t)| format!("{outcome} => {}", t.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(f, "{name} ({step_type}) -[{routing}]-> {{ {arms} }}")?
                }
            }
        }
        Ok(())
    }
}

/// Turns a `GraphSpec` into a `CompiledGraph`.
pub struct GraphCompiler<'a> {
    steps: &'a StepRegistry,
    routes: &'a RoutingRegistry,
}

impl<'a> GraphCompiler<'a> {
    pub fn new(steps: &'a StepRegistry, routes: &'a RoutingRegistry) -> Self {
        Self { steps, routes }
    }

    /// Validate and compile. Deterministic for a given spec and registries.
    pub fn compile(&self, spec: &GraphSpec) -> Result<CompiledGraph> {
        TopologyValidator::new(self.steps, self.routes).validate(spec)?;

        let mut steps = HashMap::new();
        for s in &spec.steps {
            steps.insert(
                s.name.clone(),
                CompiledStep {
                    step_type: s.step_type.clone(),
                    step: self.steps.get(&s.step_type)?,
                },
            );
        }

        let mut start_target: Option<String> = None;
        let mut successors: HashMap<String, Successor> = HashMap::new();

        for t in &spec.transitions {
            if t.from == START {
                if start_target.is_some() {
                    return Err(ConvergeError::DuplicateTransition(START.to_string()));
                }
                start_target = Some(start_entry(t)?);
                continue;
            }
            if successors.contains_key(&t.from) {
                return Err(ConvergeError::DuplicateTransition(t.from.clone()));
            }
            let successor = self.resolve(t)?;
            successors.insert(t.from.clone(), successor);
        }

        let entry = start_target
            .or_else(|| spec.entry.clone())
            .or_else(|| spec.steps.first().map(|s| s.name.clone()))
            .ok_or(ConvergeError::EmptyGraph)?;

        let graph = CompiledGraph {
            entry,
            order: spec.steps.iter().map(|s| s.name.clone()).collect(),
            steps,
            successors,
        };
        warn_unreachable(&graph);
        debug!(entry = %graph.entry, steps = graph.order.len(), "Compiled graph");
        Ok(graph)
    }

    fn resolve(&self, t: &TransitionSpec) -> Result<Successor> {
        let targets = t.to.as_slice();
        match &t.routing {
            None if targets.len() > 1 => Err(ConvergeError::MissingRouting {
                from: t.from.clone(),
                targets: targets.join(", "),
            }),
            None if t.outcomes.is_some() => Err(ConvergeError::OutcomeMismatch {
                routing: "(none)".to_string(),
                from: t.from.clone(),
                detail: "an outcomes map needs a routing function".to_string(),
            }),
            None => Ok(Successor::Fixed(Target::parse(&targets[0]))),
            Some(routing) => {
                let router = self.routes.get(routing)?;
                let table = bind_outcomes(t, routing, &router.outcomes())?;
                Ok(Successor::Routed {
                    routing: routing.clone(),
                    router,
                    table,
                })
            }
        }
    }
}

fn start_entry(t: &TransitionSpec) -> Result<String> {
    match t.to.as_slice() {
        [single] if single != END && t.routing.is_none() => Ok(single.clone()),
        _ => Err(ConvergeError::InvalidEntry(format!(
            "{START} must lead unconditionally to a single step, got [{}]",
            t.to.as_slice().join(", ")
        ))),
    }
}

/// Map each router outcome to a target of the transition.
///
/// An explicit `outcomes` map wins. Otherwise an outcome named like a target
/// binds to it, an `end*` outcome binds to `END` when `END` is a target, and
/// the rest bind to the remaining step targets positionally (or all to the
/// single remaining one). Every outcome must bind and every target must be
/// reachable.
fn bind_outcomes(
    t: &TransitionSpec,
    routing: &str,
    outcomes: &[String],
) -> Result<BTreeMap<String, Target>> {
    let targets = t.to.as_slice();
    let mismatch = |detail: String| ConvergeError::OutcomeMismatch {
        routing: routing.to_string(),
        from: t.from.clone(),
        detail,
    };

    let mut table: BTreeMap<String, Target> = BTreeMap::new();

    if let Some(explicit) = &t.outcomes {
        for (outcome, target) in explicit {
            if !outcomes.contains(outcome) {
                return Err(mismatch(format!(
                    "'{outcome}' is not an outcome (outcomes: {})",
                    outcomes.join(", ")
                )));
            }
            if !targets.contains(target) {
                return Err(mismatch(format!(
                    "'{target}' is not a target of this transition"
                )));
            }
            table.insert(outcome.clone(), Target::parse(target));
        }
    } else {
        let has_end = targets.iter().any(|t| t == END);
        let mut unbound: Vec<&String> = Vec::new();
        for outcome in outcomes {
            if outcome != END && targets.contains(outcome) {
                table.insert(outcome.clone(), Target::parse(outcome));
            } else if has_end && outcome.starts_with("end") {
                table.insert(outcome.clone(), Target::End);
            } else {
                unbound.push(outcome);
            }
        }

        if !unbound.is_empty() {
            let bound: HashSet<&Target> = table.values().collect();
            let remaining: Vec<Target> = targets
                .iter()
                .filter(|t| *t != END)
                .map(|t| Target::parse(t))
                .filter(|t| !bound.contains(t))
                .collect();

            if remaining.len() == 1 {
                for outcome in unbound {
                    table.insert(outcome.clone(), remaining[0].clone());
                }
            } else if remaining.len() == unbound.len() {
                for (outcome, target) in unbound.into_iter().zip(remaining) {
                    table.insert(outcome.clone(), target);
                }
            } else {
                return Err(mismatch(format!(
                    "cannot bind outcomes [{}] to remaining targets [{}]",
                    unbound.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                    remaining.iter().map(Target::as_str).collect::<Vec<_>>().join(", ")
                )));
            }
        }
    }

    for outcome in outcomes {
        if !table.contains_key(outcome) {
            return Err(mismatch(format!("outcome '{outcome}' is not bound to a target")));
        }
    }
    for target in targets {
        let target = Target::parse(target);
        if !table.values().any(|t| *t == target) {
            return Err(mismatch(format!(
                "target '{}' is unreachable: no outcome leads to it",
                target.as_str()
            )));
        }
    }

    Ok(table)
}

fn warn_unreachable(graph: &CompiledGraph) {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(graph.entry());

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        if let Some(successor) = graph.successor(name) {
            for t in successor.targets() {
                if let Target::Step(next) = t {
                    queue.push_back(next);
                }
            }
        }
    }

    for name in graph.step_names() {
        if !seen.contains(name) {
            warn!(step = %name, "Step is unreachable from the entry point");
        }
    }
}
