//! Child-process environment construction
//!
//! The bootstrap script's environment merges, in increasing precedence:
//! the job's own variables, the agent identity, and the resolved config.
//! Identity and config always win so a job cannot spoof the token or
//! endpoint that nested `convoy artifact`/`convoy meta-data` invocations
//! self-scope with.

use convoy_core::{AgentConfig, AgentIdentity, Job};
use std::collections::HashMap;

/// The job-supplied command variable. Stripped when command-eval is
/// disabled — with it gone, only the fixed bootstrap script path decides
/// what runs. This is a security boundary, not a convenience flag.
pub const COMMAND_VAR: &str = "CONVOY_COMMAND";

/// Build the environment for one job's bootstrap process.
pub fn build_environment(
    job: &Job,
    identity: &AgentIdentity,
    config: &AgentConfig,
) -> HashMap<String, String> {
    let mut env = job.env.clone();

    if !config.command_eval {
        if env.remove(COMMAND_VAR).is_some() {
            tracing::warn!(
                "Stripped job-supplied {} (command-eval is disabled on this agent)",
                COMMAND_VAR
            );
        }
    }

    env.insert("CONVOY_JOB_ID".to_string(), job.id.clone());
    env.insert("CONVOY_BUILD_ID".to_string(), job.build_id.clone());
    if let Some(step) = &job.step {
        env.insert("CONVOY_STEP".to_string(), step.clone());
    }
    env.insert("CONVOY_AGENT_ID".to_string(), identity.id.clone());
    env.insert("CONVOY_AGENT_NAME".to_string(), identity.name.clone());
    env.insert(
        "CONVOY_AGENT_ACCESS_TOKEN".to_string(),
        identity.access_token.clone(),
    );
    env.insert("CONVOY_AGENT_ENDPOINT".to_string(), config.endpoint.clone());
    env.insert(
        "CONVOY_BUILD_PATH".to_string(),
        config.build_path.to_string_lossy().to_string(),
    );
    if let Some(hooks) = &config.hooks_path {
        env.insert(
            "CONVOY_HOOKS_PATH".to_string(),
            hooks.to_string_lossy().to_string(),
        );
    }

    env
}
