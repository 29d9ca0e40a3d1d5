//! LLM provider configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Provider used when nothing in the hierarchy overrides it.
    #[serde(default)]
    pub default_provider: Option<String>,
    /// Registered providers (key = provider name referenced by chains).
    #[serde(default)]
    pub providers: HashMap<String, LlmProviderConfig>,
}

impl LlmConfig {
    /// The provider name to use when no override applies.
    pub fn effective_default(&self) -> Option<&str> {
        self.default_provider
            .as_deref()
            .or_else(|| self.providers.keys().next().map(String::as_str))
    }
}

/// Wire family of a provider. xAI speaks the OpenAI-compatible protocol and
/// VertexAI the Gemini protocol, so both map onto an existing adapter with a
/// different base url / auth mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Xai,
    Anthropic,
    Google,
    Vertexai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "d_true")]
    pub verify_ssl: bool,
    /// Token budget for a single MCP tool observation before the
    /// summarizer kicks in.
    #[serde(default = "d_max_tool_result_tokens")]
    pub max_tool_result_tokens: u32,
    /// Enable provider-native search/url-context/code-execution tools
    /// where the provider supports them.
    #[serde(default)]
    pub native_tools_enabled: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl LlmProviderConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config(format!("provider '{name}': model must not be empty")));
        }
        if self.api_key_env.trim().is_empty() {
            return Err(Error::Config(format!(
                "provider '{name}': api_key_env must not be empty"
            )));
        }
        Ok(())
    }

    /// Read the API key from the configured env var.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env)
            .map_err(|_| Error::Auth(format!("env var {} is not set", self.api_key_env)))
    }
}

fn d_true() -> bool {
    true
}

fn d_max_tool_result_tokens() -> u32 {
    8_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_config_from_yaml() {
        let cfg: LlmProviderConfig = serde_yaml::from_str(
            r#"
type: google
model: gemini-2.0-flash
api_key_env: GEMINI_API_KEY
native_tools_enabled: true
"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, ProviderKind::Google);
        assert!(cfg.verify_ssl);
        assert_eq!(cfg.max_tool_result_tokens, 8_000);
        cfg.validate("google-default").unwrap();
    }

    #[test]
    fn empty_model_rejected() {
        let cfg = LlmProviderConfig {
            kind: ProviderKind::Openai,
            model: "".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            base_url: None,
            verify_ssl: true,
            max_tool_result_tokens: 8000,
            native_tools_enabled: false,
            max_tokens: None,
            temperature: None,
        };
        assert!(cfg.validate("p").is_err());
    }

    #[test]
    fn effective_default_prefers_explicit() {
        let mut providers = HashMap::new();
        providers.insert(
            "b".to_string(),
            LlmProviderConfig {
                kind: ProviderKind::Anthropic,
                model: "claude".into(),
                api_key_env: "K".into(),
                base_url: None,
                verify_ssl: true,
                max_tool_result_tokens: 8000,
                native_tools_enabled: false,
                max_tokens: None,
                temperature: None,
            },
        );
        let cfg = LlmConfig {
            default_provider: Some("a".into()),
            providers,
        };
        assert_eq!(cfg.effective_default(), Some("a"));
    }
}
