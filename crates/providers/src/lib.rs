//! Text-completion provider implementations for Quarry.
//!
//! All providers implement the `quarry_core::Provider` trait.
//! [`build_from_config`] constructs the configured one.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use quarry_config::ProviderConfig;
use quarry_core::Provider;
use quarry_core::error::ProviderError;
use std::sync::Arc;

/// Build the provider described by `config`.
///
/// A missing API key is only accepted for local endpoints, which commonly
/// run without authentication.
pub fn build_from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None if is_local(&config.base_url) => String::new(),
        None => {
            return Err(ProviderError::NotConfigured(
                "no API key; set QUARRY_API_KEY or OPENAI_API_KEY".into(),
            ));
        }
    };

    let provider = OpenAiCompatProvider::new(config.name.clone(), config.base_url.clone(), api_key)?;
    tracing::debug!(provider = %config.name, base_url = %config.base_url, "Provider configured");
    Ok(Arc::new(provider))
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("://localhost") || base_url.contains("://127.0.0.1")
}
