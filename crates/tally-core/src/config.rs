//! Configuration loading
//!
//! Resolution order: an explicit `--config` path, then
//! `~/.local/share/tally/config.toml`, then the embedded default. Environment
//! variables override the `[ai]` section afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default config embedded at compile time
const DEFAULT_CONFIG: &str = include_str!("../../../config/tally.toml");

/// Which classifier backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Ollama,
    OpenAICompatible,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAICompatible => "openai_compatible",
            Self::Mock => "mock",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai_compatible" | "openai" | "vllm" | "localai" | "llamacpp" => {
                Ok(Self::OpenAICompatible)
            }
            "mock" => Ok(Self::Mock),
            _ => Err(format!("Unknown AI backend: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub backend: BackendKind,
    pub host: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub auto_accept_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub dir: Option<PathBuf>,
    pub keep_auto: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ai: AiConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub checkpoints: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ai: AiConfig {
                backend: BackendKind::Ollama,
                host: None,
                model: "llama3.2".to_string(),
                api_key: None,
                timeout: Duration::from_secs(60),
            },
            retry: RetryConfig {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(8),
            },
            batch: BatchConfig {
                workers: 5,
                batch_size: 20,
                auto_accept_threshold: 0.95,
            },
            checkpoints: CheckpointConfig {
                dir: None,
                keep_auto: 10,
            },
        }
    }
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("tally").join("config.toml"))
}

impl Config {
    /// Load configuration (override first, then default) and apply environment overrides
    pub fn load(override_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_file(override_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load without consulting the environment
    pub fn load_file(override_path: Option<&Path>) -> Result<Self> {
        let path = override_path
            .map(Path::to_path_buf)
            .or_else(default_config_path)
            .filter(|p| p.exists());

        match path {
            Some(path) => {
                debug!(path = %path.display(), "Loading config");
                let content = fs::read_to_string(&path)
                    .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
                Self::parse(&content)
            }
            None => Self::parse(DEFAULT_CONFIG),
        }
    }

    /// Parse config from TOML content; missing keys keep their defaults
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

        let mut config = Config::default();

        if let Some(ai) = raw.ai {
            if let Some(backend) = ai.backend {
                config.ai.backend = backend.parse().map_err(Error::Config)?;
            }
            if ai.host.is_some() {
                config.ai.host = ai.host;
            }
            if let Some(model) = ai.model {
                config.ai.model = model;
            }
            if ai.api_key.is_some() {
                config.ai.api_key = ai.api_key;
            }
            if let Some(secs) = ai.timeout_secs {
                config.ai.timeout = Duration::from_secs(secs);
            }
        }

        if let Some(retry) = raw.retry {
            if let Some(n) = retry.max_retries {
                config.retry.max_retries = n;
            }
            if let Some(ms) = retry.base_delay_ms {
                config.retry.base_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_delay_ms {
                config.retry.max_delay = Duration::from_millis(ms);
            }
        }

        if let Some(batch) = raw.batch {
            if let Some(workers) = batch.workers {
                config.batch.workers = workers;
            }
            if let Some(size) = batch.batch_size {
                config.batch.batch_size = size;
            }
            if let Some(threshold) = batch.auto_accept_threshold {
                config.batch.auto_accept_threshold = threshold;
            }
        }

        if let Some(checkpoints) = raw.checkpoints {
            if checkpoints.dir.is_some() {
                config.checkpoints.dir = checkpoints.dir;
            }
            if let Some(keep) = checkpoints.keep_auto {
                config.checkpoints.keep_auto = keep;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(backend) = lookup("TALLY_AI_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.ai.backend = kind,
                Err(_) => {
                    warn!(backend = %backend, "Unknown TALLY_AI_BACKEND, keeping configured backend")
                }
            }
        }

        let (host_var, model_var) = match self.ai.backend {
            BackendKind::OpenAICompatible => ("OPENAI_COMPATIBLE_HOST", "OPENAI_COMPATIBLE_MODEL"),
            _ => ("OLLAMA_HOST", "OLLAMA_MODEL"),
        };
        if let Some(host) = lookup(host_var) {
            self.ai.host = Some(host);
        }
        if let Some(model) = lookup(model_var) {
            self.ai.model = model;
        }
        if self.ai.backend == BackendKind::OpenAICompatible {
            if let Some(key) = lookup("OPENAI_COMPATIBLE_API_KEY") {
                self.ai.api_key = Some(key);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch.workers == 0 || self.batch.batch_size == 0 {
            return Err(Error::Config(
                "batch.workers and batch.batch_size must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.batch.auto_accept_threshold) {
            return Err(Error::Config(format!(
                "batch.auto_accept_threshold {} outside [0, 1]",
                self.batch.auto_accept_threshold
            )));
        }
        Ok(())
    }
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    ai: Option<RawAi>,
    retry: Option<RawRetry>,
    batch: Option<RawBatch>,
    checkpoints: Option<RawCheckpoints>,
}

#[derive(Debug, Deserialize)]
struct RawAi {
    backend: Option<String>,
    host: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    workers: Option<usize>,
    batch_size: Option<usize>,
    auto_accept_threshold: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawCheckpoints {
    dir: Option<PathBuf>,
    keep_auto: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_embedded_default_parses() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.ai.backend, BackendKind::Ollama);
        assert_eq!(config.batch.workers, 5);
        assert_eq!(config.batch.batch_size, 20);
        assert_eq!(config.batch.auto_accept_threshold, 0.95);
        assert_eq!(config.checkpoints.keep_auto, 10);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse("[batch]\nworkers = 2\n").unwrap();
        assert_eq!(config.batch.workers, 2);
        assert_eq!(config.batch.batch_size, 20);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::parse("[batch]\nworkers = 0\n").is_err());
        assert!(Config::parse("[batch]\nauto_accept_threshold = 1.5\n").is_err());
        assert!(Config::parse("[ai]\nbackend = \"carrier-pigeon\"\n").is_err());
        assert!(Config::parse("not toml [").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TALLY_AI_BACKEND", "openai_compatible"),
            ("OPENAI_COMPATIBLE_HOST", "http://localhost:8080"),
            ("OPENAI_COMPATIBLE_MODEL", "qwen2.5"),
            ("OPENAI_COMPATIBLE_API_KEY", "secret"),
            ("OLLAMA_HOST", "http://ignored:11434"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.ai.backend, BackendKind::OpenAICompatible);
        assert_eq!(config.ai.host.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.ai.model, "qwen2.5");
        assert_eq!(config.ai.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_load_file_from_override_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.toml");
        std::fs::write(&path, "[checkpoints]\nkeep_auto = 3\n").unwrap();
        let config = Config::load_file(Some(&path)).unwrap();
        assert_eq!(config.checkpoints.keep_auto, 3);
    }
}
