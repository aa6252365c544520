//! The external fix step: prompt construction and the agent-CLI fixer.

pub mod agent;
pub mod prompts;

pub use agent::{AgentFixer, Provider};
pub use prompts::{build_fix_prompt, build_user_message};
