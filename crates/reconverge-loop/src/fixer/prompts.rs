use reconverge_core::state::ConvergenceState;

/// Characters of each historical failure shown to the fixer.
const HISTORY_EXCERPT: usize = 200;

/// System prompt: optional custom role prompt, then loop context and history.
pub fn build_fix_prompt(state: &ConvergenceState, custom_prompt: Option<&str>) -> String {
    let mut prompt = match custom_prompt.map(str::trim) {
        Some(custom) if !custom.is_empty() => format!("{custom}\n\n---\n\n"),
        _ => String::new(),
    };

    let failed = if state.failed_checks.is_empty() {
        "None".to_string()
    } else {
        state.failed_checks.join(", ")
    };

    prompt.push_str(&format!(
        "Attempt: {}/{}\n\n\
         IMPORTANT: The framework runs validators (build, tests, conflict checks) and reports results to you.\n\
         Your job is to investigate WHY they failed and FIX the issues using the tools available to you.\n\n\
         Failed Validators (run by framework, not you):\n{}\n\n\
         Use whatever tools are needed to understand the failures and apply fixes. \
         The framework will re-run validators after you're done.\n\n\
         Previous attempts:\n",
        state.attempt + 1,
        state.max_attempts(),
        failed
    ));

    for (i, cycle) in state.failure_history.iter().enumerate() {
        prompt.push_str(&format!("\nAttempt {}:\n", i + 1));
        for result in cycle.iter().filter(|r| !r.success) {
            let excerpt: String = result.output.chars().take(HISTORY_EXCERPT).collect();
            prompt.push_str(&format!("  - {}: {}\n", result.validator_name, excerpt));
        }
    }

    prompt
}

/// User message describing what failed most recently.
///
/// Failed checks from the last validation take precedence (refinement after a
/// previous fix); otherwise the main script failure is shown.
pub fn build_user_message(state: &ConvergenceState) -> String {
    let failed: Vec<_> = state
        .validation_results
        .iter()
        .filter(|r| !r.success)
        .collect();

    if !failed.is_empty() {
        let mut message = String::from("## Validators Failed After Your Previous Fix\n\n");
        for result in failed {
            message.push_str(&format!("### Validator: {}\n", result.validator_name));
            message.push_str(&format!("Exit Code: {}\n", exit_code_str(result.exit_code)));
            if let Some(command) = result.metadata.get("command").and_then(|v| v.as_str()) {
                message.push_str(&format!("Command: `{command}`\n"));
            }
            message.push('\n');
            if !result.output.is_empty() {
                message.push_str(&format!(
                    "Output (last {} lines):\n```\n{}\n```\n\n",
                    result.output.lines().count(),
                    result.output
                ));
            }
            if !result.stderr.is_empty() {
                message.push_str(&format!("Stderr:\n```\n{}\n```\n\n", result.stderr));
            }
        }
        message.push_str("Please refine your approach to fix these validation failures.");
        return message;
    }

    match &state.main_script_result {
        Some(main) if !main.success => {
            let mut message = String::from("## Main Script Failed\n\n");
            message.push_str(&format!("**Description:** {}\n", main.action));
            if let Some(command) = main.metadata.get("command").and_then(|v| v.as_str()) {
                message.push_str(&format!("**Command:** `{command}`\n"));
            }
            message.push_str(&format!("**Exit Code:** {}\n\n", exit_code_str(main.exit_code)));
            if !main.stderr.is_empty() {
                message.push_str(&format!("**Error Output:**\n```\n{}\n```\n\n", main.stderr));
            }
            if !main.output.is_empty() {
                message.push_str(&format!("**Standard Output:**\n```\n{}\n```\n\n", main.output));
            }
            message.push_str("Please investigate the main script failure and apply fixes.");
            message
        }
        _ => "Please investigate and fix the issues.".to_string(),
    }
}

fn exit_code_str(code: Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "N/A".to_string())
}
