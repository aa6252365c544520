//! Workflow graph machinery.
//!
//! A `GraphSpec` is checked by the `TopologyValidator` against a
//! `StepRegistry` and a `RoutingRegistry`, turned into an immutable
//! `CompiledGraph` by the `GraphCompiler`, and driven from its entry step to
//! `END` by the `ExecutionEngine`, which merges each step's partial update
//! into the run state under a hard step-count ceiling.

pub mod compiler;
pub mod engine;
pub mod registry;
pub mod validator;

pub use compiler::{CompiledGraph, GraphCompiler, Successor, Target};
pub use engine::{default_step_limit, ExecutionEngine, ExecutionResult};
pub use registry::{Registry, RoutingRegistry, StepRegistry};
pub use validator::TopologyValidator;
