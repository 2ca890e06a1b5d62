//! Operator configuration: `config.yaml`, environment overrides and the
//! `sources.yaml` registry.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bdbot_adapters::SourceDefinition;
use bdbot_match::LlmSettings;
use bdbot_storage::HttpClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_SOURCES_PATH: &str = "sources.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} already exists", .0.display())]
    Exists(PathBuf),
    #[error("serializing configuration: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub llm_url: Option<String>,
    pub llm_key: Option<String>,
    pub llm_model: Option<String>,
    pub log_level: String,
    pub log_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub scrape_timeout_secs: u64,
    pub persist_timeout_secs: u64,
    pub match_timeout_secs: u64,
    pub match_concurrency: usize,
    pub source_concurrency: usize,
    pub sources_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            llm_url: None,
            llm_key: None,
            llm_model: None,
            log_level: "info".to_string(),
            log_path: None,
            user_agent: concat!("bdbot/", env!("CARGO_PKG_VERSION")).to_string(),
            http_timeout_secs: 20,
            llm_timeout_secs: 60,
            scrape_timeout_secs: 600,
            persist_timeout_secs: 120,
            match_timeout_secs: 1800,
            match_concurrency: 4,
            source_concurrency: 2,
            sources_path: PathBuf::from(DEFAULT_SOURCES_PATH),
        }
    }
}

/// `sources.yaml` layout.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl SourceRegistry {
    pub fn enabled(&self) -> impl Iterator<Item = &SourceDefinition> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

impl AppConfig {
    /// File values, then process environment on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    /// Write this configuration to a new file; an existing file is left untouched.
    pub fn write_new(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_yaml()?;
        let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ConfigError::Exists(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        io::Write::write_all(&mut file, text.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = get("BDBOT_LLM_URL") {
            self.llm_url = Some(v);
        }
        if let Some(v) = get("BDBOT_LLM_KEY") {
            self.llm_key = Some(v);
        }
        if let Some(v) = get("BDBOT_LLM_MODEL") {
            self.llm_model = Some(v);
        }
        if let Some(v) = get("BDBOT_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = get("BDBOT_LOG_PATH") {
            self.log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BDBOT_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("BDBOT_SOURCES") {
            self.sources_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.match_concurrency == 0 {
            return Err(ConfigError::Invalid("match_concurrency must be at least 1".into()));
        }
        if self.source_concurrency == 0 {
            return Err(ConfigError::Invalid("source_concurrency must be at least 1".into()));
        }
        if self.scrape_timeout_secs == 0
            || self.persist_timeout_secs == 0
            || self.match_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("run timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("database_url"))
    }

    pub fn llm_settings(&self) -> Result<LlmSettings, ConfigError> {
        let base_url = self
            .llm_url
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("llm_url"))?;
        let model = self
            .llm_model
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("llm_model"))?;
        Ok(LlmSettings {
            base_url,
            api_key: self.llm_key.clone(),
            model,
            timeout: self.llm_timeout(),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    pub fn persist_timeout(&self) -> Duration {
        Duration::from_secs(self.persist_timeout_secs)
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_secs(self.match_timeout_secs)
    }

    /// Read `sources_path`; without that file only the Georgia registry is used.
    pub fn load_sources(&self) -> Result<SourceRegistry, ConfigError> {
        load_source_registry(&self.sources_path)
    }
}

pub fn load_source_registry(path: &Path) -> Result<SourceRegistry, ConfigError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no source registry, using georgia default");
            return Ok(SourceRegistry {
                sources: vec![SourceDefinition::georgia_default()],
            });
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let registry: SourceRegistry = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut names = std::collections::HashSet::new();
    for def in &registry.sources {
        if !names.insert(def.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "source {} is listed twice in {}",
                def.name,
                path.display()
            )));
        }
    }
    Ok(registry)
}
