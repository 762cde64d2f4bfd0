//! Completion providers used by the translator agent.

use std::sync::Arc;

pub mod openai;
pub mod provider;

pub use provider::{CompletionRequest, Provider, ProviderError, Result};

use crate::config::CompletionConfig;

/// Provider factory.
pub fn create_provider(config: &CompletionConfig) -> Result<Arc<dyn Provider>> {
    let provider = openai::OpenAiProvider::new(config)?;
    tracing::debug!(provider = provider.name(), model = provider.model(), "Created completion provider");
    Ok(Arc::new(provider))
}
