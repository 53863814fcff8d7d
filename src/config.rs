use crate::defaults;
use crate::error::{Result, SeparationError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub jobs: JobsConfig,
    pub engine: EngineConfig,
}

/// HTTP front door configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: u64,
    /// Allow any origin, method and header.
    pub cors: bool,
}

/// Artifact cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root. `None` resolves to the platform cache dir.
    pub dir: Option<PathBuf>,
    pub max_bytes: u64,
}

/// Job coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
    pub timeout_secs: u64,
    pub retention_secs: u64,
    pub max_duration_secs: u64,
    pub admission_ceiling_bytes: u64,
}

/// Separation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Model file for backends that load weights from disk.
    pub model_path: Option<PathBuf>,
}

/// Separation backend enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Built-in deterministic crossover separator
    #[default]
    Bandsplit,
    /// Pretrained ONNX model (requires the `onnx` feature)
    Onnx,
}

impl std::str::FromStr for BackendKind {
    type Err = SeparationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bandsplit" => Ok(Self::Bandsplit),
            "onnx" => Ok(Self::Onnx),
            other => Err(SeparationError::ConfigInvalidValue {
                key: "engine.backend".to_string(),
                message: format!("unknown backend '{other}' (expected bandsplit or onnx)"),
            }),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            max_upload_bytes: defaults::MAX_UPLOAD_BYTES,
            cors: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_bytes: defaults::CACHE_MAX_BYTES,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: defaults::worker_count(),
            timeout_secs: defaults::JOB_TIMEOUT_SECS,
            retention_secs: defaults::JOB_RETENTION_SECS,
            max_duration_secs: defaults::MAX_DURATION_SECS,
            admission_ceiling_bytes: defaults::ADMISSION_CEILING_BYTES,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Bandsplit,
            model_path: None,
        }
    }
}

impl JobsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl CacheConfig {
    /// Resolved cache root: configured dir, else `<platform cache>/stemsplit`.
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join(defaults::CACHE_DIR_NAME)
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing fields use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if the file doesn't exist.
    ///
    /// Invalid TOML is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(SeparationError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            Err(e) => Err(SeparationError::ConfigParse {
                message: format!("{}: {}", path.display(), e),
            }),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - SPLEETER_CACHE_DIR → cache.dir
    /// - PORT → server.port
    /// - STEMSPLIT_HOST → server.host
    /// - STEMSPLIT_WORKERS → jobs.workers
    /// - STEMSPLIT_JOB_TIMEOUT_SECS → jobs.timeout_secs
    /// - STEMSPLIT_CACHE_MAX_BYTES → cache.max_bytes
    /// - STEMSPLIT_MAX_UPLOAD_BYTES → server.max_upload_bytes
    /// - STEMSPLIT_BACKEND → engine.backend
    /// - STEMSPLIT_MODEL_PATH → engine.model_path
    ///
    /// Empty values are ignored; unparsable values are an error.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(dir) = env_value(defaults::CACHE_DIR_ENV) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        if let Some(port) = env_value("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(host) = env_value("STEMSPLIT_HOST") {
            self.server.host = host;
        }
        if let Some(workers) = env_value("STEMSPLIT_WORKERS") {
            self.jobs.workers = parse_env("STEMSPLIT_WORKERS", &workers)?;
        }
        if let Some(timeout) = env_value("STEMSPLIT_JOB_TIMEOUT_SECS") {
            self.jobs.timeout_secs = parse_env("STEMSPLIT_JOB_TIMEOUT_SECS", &timeout)?;
        }
        if let Some(max_bytes) = env_value("STEMSPLIT_CACHE_MAX_BYTES") {
            self.cache.max_bytes = parse_env("STEMSPLIT_CACHE_MAX_BYTES", &max_bytes)?;
        }
        if let Some(max_upload) = env_value("STEMSPLIT_MAX_UPLOAD_BYTES") {
            self.server.max_upload_bytes = parse_env("STEMSPLIT_MAX_UPLOAD_BYTES", &max_upload)?;
        }
        if let Some(backend) = env_value("STEMSPLIT_BACKEND") {
            self.engine.backend = backend.parse()?;
        }
        if let Some(model_path) = env_value("STEMSPLIT_MODEL_PATH") {
            self.engine.model_path = Some(PathBuf::from(model_path));
        }
        Ok(self)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.jobs.workers == 0 {
            return Err(invalid("jobs.workers", "must be at least 1"));
        }
        if self.jobs.timeout_secs == 0 {
            return Err(invalid("jobs.timeout_secs", "must be positive"));
        }
        if self.jobs.max_duration_secs == 0 {
            return Err(invalid("jobs.max_duration_secs", "must be positive"));
        }
        if self.jobs.admission_ceiling_bytes == 0 {
            return Err(invalid("jobs.admission_ceiling_bytes", "must be positive"));
        }
        if self.cache.max_bytes == 0 {
            return Err(invalid("cache.max_bytes", "must be positive"));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(invalid("server.max_upload_bytes", "must be positive"));
        }
        Ok(())
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/stemsplit/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("stemsplit")
            .join("config.toml")
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| SeparationError::ConfigInvalidValue {
            key: key.to_string(),
            message: format!("'{value}': {e}"),
        })
}

fn invalid(key: &str, message: &str) -> SeparationError {
    SeparationError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
