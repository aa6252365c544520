use reconverge_core::spec::{GraphSpec, END, START};

/// The standard convergence loop:
///
/// ```text
/// START -> pre_actions
/// pre_actions       -[check_pre_actions]->     run_main_script | END
/// run_main_script   -[check_main_script]->     END | ai_fix
/// ai_fix            -> validate -> decide
/// decide            -[should_continue]->       increment_attempt | END
/// increment_attempt -[route_after_increment]-> run_main_script | ai_fix
/// ```
///
/// Every step is named after its step type.
pub fn default_topology() -> GraphSpec {
    GraphSpec::new()
        .step("pre_actions", "pre_actions")
        .step("run_main_script", "run_main_script")
        .step("ai_fix", "ai_fix")
        .step("validate", "validate")
        .step("decide", "decide")
        .step("increment_attempt", "increment_attempt")
        .edge(START, "pre_actions")
        .route("pre_actions", vec!["run_main_script", END], "check_pre_actions")
        .route("run_main_script", vec![END, "ai_fix"], "check_main_script")
        .edge("ai_fix", "validate")
        .edge("validate", "decide")
        .route("decide", vec!["increment_attempt", END], "should_continue")
        .route(
            "increment_attempt",
            vec!["run_main_script", "ai_fix"],
            "route_after_increment",
        )
}
