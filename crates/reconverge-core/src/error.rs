use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvergeError {
    // Topology errors
    #[error("Unknown step type '{step_type}' for step '{step}'. Available types: {available}")]
    UnknownStepType {
        step: String,
        step_type: String,
        available: String,
    },

    #[error("Duplicate step names: {0}")]
    DuplicateStepName(String),

    #[error("Step name '{0}' is reserved for a graph boundary marker")]
    ReservedStepName(String),

    #[error("Graph declares no steps")]
    EmptyGraph,

    #[error("Transition {from} -> {to} references unknown step '{unknown}'")]
    DanglingTransition {
        from: String,
        to: String,
        unknown: String,
    },

    #[error("Unknown routing function '{routing}'. Available routing functions: {available}")]
    UnknownRouting { routing: String, available: String },

    #[error("Entry point '{0}' is not a declared step")]
    InvalidEntry(String),

    #[error("Transition from '{from}' has multiple targets [{targets}] and needs a routing function")]
    MissingRouting { from: String, targets: String },

    #[error("Routing function '{routing}' on transition from '{from}' does not match its targets: {detail}")]
    OutcomeMismatch {
        routing: String,
        from: String,
        detail: String,
    },

    #[error("Step '{0}' has more than one outgoing transition")]
    DuplicateTransition(String),

    #[error("Unknown {kind}: '{name}'. Available: {available}")]
    NotFound {
        kind: &'static str,
        name: String,
        available: String,
    },

    // Execution errors
    #[error("Step limit of {limit} exceeded after {steps} steps; the graph likely contains an unintended cycle or max_attempts is mis-sized")]
    RecursionExceeded { limit: usize, steps: usize },

    #[error("Routing function '{routing}' after step '{step}' returned unmapped outcome '{outcome}'")]
    UnknownOutcome {
        step: String,
        routing: String,
        outcome: String,
    },

    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvergeError {
    /// True for errors raised while checking or compiling a graph, before any step runs.
    pub fn is_specification_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownStepType { .. }
                | Self::DuplicateStepName(_)
                | Self::ReservedStepName(_)
                | Self::EmptyGraph
                | Self::DanglingTransition { .. }
                | Self::UnknownRouting { .. }
                | Self::InvalidEntry(_)
                | Self::MissingRouting { .. }
                | Self::OutcomeMismatch { .. }
                | Self::DuplicateTransition(_)
                | Self::NotFound { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConvergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ConvergeError::EmptyGraph.is_specification_error());
        assert!(ConvergeError::MissingRouting {
            from: "a".into(),
            targets: "b, c".into()
        }
        .is_specification_error());
        assert!(!ConvergeError::RecursionExceeded { limit: 16, steps: 17 }.is_specification_error());
        assert!(!ConvergeError::Config("bad".into()).is_specification_error());
    }

    #[test]
    fn test_missing_routing_message() {
        let err = ConvergeError::MissingRouting {
            from: "main".into(),
            targets: "END, fix".into(),
        };
        assert!(err.to_string().contains("needs a routing function"));
    }
}
