//! Agent registration
//!
//! Runs exactly once at startup. An agent that cannot register must not
//! proceed to polling, so every error here is fatal to the caller: auth
//! failures immediately, transient failures once the client's bounded
//! retry budget is spent.

use crate::wire::{RegisterRequest, RegisterResponse};
use crate::ApiClient;
use convoy_core::{AgentConfig, AgentIdentity, Result};

/// Register the agent with the coordination service.
///
/// Sends name, priority and meta-data tags; receives the durable agent ID
/// and the access token used by all subsequent calls.
pub async fn register(client: &ApiClient, config: &AgentConfig) -> Result<AgentIdentity> {
    tracing::info!("Registering agent \"{}\" with {}", config.name, client.base_url());

    let request = RegisterRequest {
        name: config.name.clone(),
        priority: config.priority.clone(),
        meta_data: config.meta_data.clone(),
    };

    let response: RegisterResponse = client.post("/register", &request).await?;
    let identity: AgentIdentity = response.into();

    tracing::info!("Registered as agent {} ({})", identity.id, identity.name);
    Ok(identity)
}
