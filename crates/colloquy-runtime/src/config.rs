//! Runtime configuration
//!
//! Read from the environment (after loading `.env`):
//!
//! | variable | default |
//! |---|---|
//! | `COLLOQUY_PROVIDER` | `ollama` |
//! | `COLLOQUY_MODEL` | provider specific |
//! | `OLLAMA_HOST` / `OLLAMA_PORT` | `http://localhost` / `11434` |
//! | `OPENAI_BASE_URL` / `OPENAI_API_KEY` | `https://api.openai.com/v1` / none |
//! | `ANTHROPIC_API_KEY` | none |
//! | `COLLOQUY_WORKSPACE` | current directory |
//! | `SEARXNG_URL` | none (web search off) |
//! | `COLLOQUY_TIMEOUT_SECS` | `120` |
//! | `COLLOQUY_MAX_ITERATIONS` | `10` |

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use colloquy_core::{
    error::{AgentError, Result},
    provider::LlmProvider,
    reasoning::AgentConfig,
    registry::ToolRegistry,
};

use crate::search::SearxngClient;
use crate::tools::{Workspace, default_registry};

/// Which adapter to build
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProviderKind {
    #[default]
    Ollama,
    OpenAi,
    Anthropic,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            other => bail!("unknown provider '{other}' (expected ollama, openai or anthropic)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub provider: ProviderKind,
    pub model: Option<String>,
    pub ollama_host: String,
    pub ollama_port: u16,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub workspace: PathBuf,
    pub searxng_url: Option<String>,
    pub timeout_secs: u64,
    pub max_iterations: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            model: None,
            ollama_host: "http://localhost".into(),
            ollama_port: 11434,
            openai_base_url: "https://api.openai.com/v1".into(),
            openai_api_key: None,
            anthropic_api_key: None,
            workspace: PathBuf::from("."),
            searxng_url: None,
            timeout_secs: 120,
            max_iterations: 10,
        }
    }
}

fn parsed<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.map_or(Ok(default), |v| {
        v.trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value '{v}'"))
    })
}

impl RuntimeConfig {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let provider = match get("COLLOQUY_PROVIDER") {
            Some(name) => name.parse()?,
            None => defaults.provider,
        };

        Ok(Self {
            provider,
            model: get("COLLOQUY_MODEL"),
            ollama_host: get("OLLAMA_HOST").unwrap_or(defaults.ollama_host),
            ollama_port: parsed(get("OLLAMA_PORT"), "OLLAMA_PORT", defaults.ollama_port)?,
            openai_base_url: get("OPENAI_BASE_URL").unwrap_or(defaults.openai_base_url),
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            workspace: get("COLLOQUY_WORKSPACE").map_or(defaults.workspace, PathBuf::from),
            searxng_url: get("SEARXNG_URL"),
            timeout_secs: parsed(get("COLLOQUY_TIMEOUT_SECS"), "COLLOQUY_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_iterations: parsed(
                get("COLLOQUY_MAX_ITERATIONS"),
                "COLLOQUY_MAX_ITERATIONS",
                defaults.max_iterations,
            )?,
        })
    }

    /// Construct the configured provider adapter
    pub fn build_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        tracing::info!(provider = ?self.provider, model = ?self.model, "Building provider");
        match self.provider {
            ProviderKind::Ollama => self.ollama(),
            ProviderKind::OpenAi => self.openai(),
            ProviderKind::Anthropic => self.anthropic(),
        }
    }

    #[cfg(feature = "ollama")]
    fn ollama(&self) -> Result<Arc<dyn LlmProvider>> {
        use crate::ollama::{OllamaConfig, OllamaProvider};

        let mut config = OllamaConfig {
            host: self.ollama_host.clone(),
            port: self.ollama_port,
            timeout_secs: self.timeout_secs,
            ..Default::default()
        };
        if let Some(model) = &self.model {
            config.generation.model.clone_from(model);
        }
        Ok(Arc::new(OllamaProvider::from_config(config)?))
    }

    #[cfg(feature = "openai")]
    fn openai(&self) -> Result<Arc<dyn LlmProvider>> {
        use crate::openai::{OpenAiConfig, OpenAiProvider};

        let mut config = OpenAiConfig {
            base_url: self.openai_base_url.clone(),
            api_key: self.openai_api_key.clone(),
            timeout_secs: self.timeout_secs,
            ..Default::default()
        };
        if let Some(model) = &self.model {
            config.generation.model.clone_from(model);
        }
        Ok(Arc::new(OpenAiProvider::from_config(config)?))
    }

    #[cfg(feature = "anthropic")]
    fn anthropic(&self) -> Result<Arc<dyn LlmProvider>> {
        use crate::anthropic::{AnthropicConfig, AnthropicProvider};

        let mut config = AnthropicConfig {
            api_key: self.anthropic_api_key.clone().unwrap_or_default(),
            timeout_secs: self.timeout_secs,
            ..Default::default()
        };
        if let Some(model) = &self.model {
            config.generation.model.clone_from(model);
        }
        Ok(Arc::new(AnthropicProvider::from_config(config)?))
    }

    #[cfg(not(feature = "ollama"))]
    fn ollama(&self) -> Result<Arc<dyn LlmProvider>> {
        Err(AgentError::Config("built without the ollama feature".into()))
    }

    #[cfg(not(feature = "openai"))]
    fn openai(&self) -> Result<Arc<dyn LlmProvider>> {
        Err(AgentError::Config("built without the openai feature".into()))
    }

    #[cfg(not(feature = "anthropic"))]
    fn anthropic(&self) -> Result<Arc<dyn LlmProvider>> {
        Err(AgentError::Config("built without the anthropic feature".into()))
    }

    /// Agent settings carried by the environment
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_iterations: self.max_iterations,
            ..Default::default()
        }
    }

    /// Default tools rooted at the configured workspace
    pub fn default_tools(&self) -> Result<ToolRegistry> {
        let workspace = Workspace::new(&self.workspace)?;
        let search = self
            .searxng_url
            .as_deref()
            .map(|url| SearxngClient::new(url, self.timeout_secs))
            .transpose()?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(default_registry(&workspace, search, http))
    }

    /// Media resolver backed by SearxNG, when configured
    pub fn media_resolver(&self) -> Result<Option<SearxngClient>> {
        self.searxng_url
            .as_deref()
            .map(|url| SearxngClient::new(url, self.timeout_secs))
            .transpose()
    }
}
