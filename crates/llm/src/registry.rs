//! Provider registry: builds one adapter per configured provider.
//!
//! Providers whose credentials are missing are skipped with a warning
//! (collected for the system warnings endpoint) so the gateway still boots
//! without every key present.

use std::collections::HashMap;
use std::sync::Arc;

use tarsy_domain::config::{LlmConfig, LlmProviderConfig, ProviderKind};
use tarsy_domain::error::Error;
use tarsy_domain::Result;

use crate::anthropic::AnthropicProvider;
use crate::google::GoogleProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_provider: Option<String>,
    /// Per-provider tool-result token budgets for the summarization path.
    max_tool_result_tokens: HashMap<String, u32>,
}

impl ProviderRegistry {
    /// Build all configured adapters. Returns the registry plus non-fatal
    /// warnings (skipped providers).
    pub fn from_config(config: &LlmConfig) -> (Self, Vec<String>) {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        let mut max_tool_result_tokens = HashMap::new();
        let mut warnings = Vec::new();

        for (name, provider_config) in &config.providers {
            match build_provider(name, provider_config) {
                Ok(provider) => {
                    max_tool_result_tokens
                        .insert(name.clone(), provider_config.max_tool_result_tokens);
                    providers.insert(name.clone(), provider);
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "skipping LLM provider");
                    warnings.push(format!("LLM provider '{name}' unavailable: {e}"));
                }
            }
        }

        let default_provider = config
            .effective_default()
            .filter(|name| providers.contains_key(*name))
            .map(String::from)
            .or_else(|| providers.keys().next().cloned());

        if let Some(default) = &default_provider {
            tracing::info!(
                default_provider = %default,
                provider_count = providers.len(),
                "LLM provider registry ready"
            );
        }

        (
            Self {
                providers,
                default_provider,
                max_tool_result_tokens,
            },
            warnings,
        )
    }

    /// Resolve a provider by name, or the default when `None`.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn LlmProvider>> {
        let name = match name {
            Some(name) => name,
            None => self
                .default_provider
                .as_deref()
                .ok_or_else(|| Error::Config("no LLM providers configured".into()))?,
        };
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("LLM provider '{name}'")))
    }

    /// Tool-result token budget for a provider (the summarization trigger).
    pub fn max_tool_result_tokens(&self, name: Option<&str>) -> Option<u32> {
        let name = name.or(self.default_provider.as_deref())?;
        self.max_tool_result_tokens.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registry with exactly one provider. Used by tests and one-off tools
    /// that bring their own adapter.
    pub fn with_provider(name: &str, provider: Arc<dyn LlmProvider>) -> Self {
        let mut providers = HashMap::new();
        providers.insert(name.to_string(), provider);
        Self {
            providers,
            default_provider: Some(name.to_string()),
            max_tool_result_tokens: HashMap::new(),
        }
    }
}

fn build_provider(
    name: &str,
    config: &LlmProviderConfig,
) -> Result<Arc<dyn LlmProvider>> {
    config.validate(name)?;
    let provider: Arc<dyn LlmProvider> = match config.kind {
        ProviderKind::Openai => Arc::new(OpenAiCompatProvider::from_config(name, config, false)?),
        ProviderKind::Xai => Arc::new(OpenAiCompatProvider::from_config(name, config, true)?),
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(name, config)?),
        ProviderKind::Google | ProviderKind::Vertexai => {
            Arc::new(GoogleProvider::from_config(name, config)?)
        }
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_config(kind: ProviderKind, api_key_env: &str) -> LlmProviderConfig {
        LlmProviderConfig {
            kind,
            model: "test-model".into(),
            api_key_env: api_key_env.into(),
            base_url: None,
            verify_ssl: true,
            max_tool_result_tokens: 5000,
            native_tools_enabled: false,
            max_tokens: None,
            temperature: None,
        }
    }

    #[test]
    fn missing_api_key_skips_provider_with_warning() {
        let mut providers = HashMap::new();
        providers.insert(
            "broken".to_string(),
            provider_config(ProviderKind::Openai, "TARSY_TEST_UNSET_KEY"),
        );
        let config = LlmConfig {
            default_provider: Some("broken".into()),
            providers,
        };
        let (registry, warnings) = ProviderRegistry::from_config(&config);
        assert!(registry.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(registry.get(None).is_err());
    }

    #[test]
    fn configured_provider_resolves_and_carries_budget() {
        std::env::set_var("TARSY_TEST_API_KEY", "k");
        let mut providers = HashMap::new();
        providers.insert(
            "main".to_string(),
            provider_config(ProviderKind::Openai, "TARSY_TEST_API_KEY"),
        );
        let config = LlmConfig {
            default_provider: None,
            providers,
        };
        let (registry, warnings) = ProviderRegistry::from_config(&config);
        assert!(warnings.is_empty());
        assert_eq!(registry.get(None).unwrap().name(), "main");
        assert_eq!(registry.max_tool_result_tokens(None), Some(5000));
        assert!(registry.get(Some("ghost")).is_err());
    }
}
