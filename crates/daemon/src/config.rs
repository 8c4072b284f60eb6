//! Settings from the config file and the command line.
//!
//! Both sources deserialize into [`FileConfig`]; flags are overlaid on the
//! file and the result is resolved into [`Settings`].

use std::io::Write;
use std::path::{Path, PathBuf};

use common::config::{parse_size, CacheKind, EngineConfig, SizeParseError};
use common::volume::VolumeFormat;
use serde::{Deserialize, Serialize};
use store::StoreConfig;
use zeroize::Zeroizing;

pub const DEFAULT_CONFIG_FILE: &str = ".cloudfs.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("missing required option --{0}")]
    Missing(&'static str),
    #[error("invalid value for --{option}: {reason}")]
    Invalid { option: &'static str, reason: String },
    #[error(transparent)]
    Size(#[from] SizeParseError),
    #[error("no password given, use --password or --password-prompt")]
    NoPassword,
    #[error("failed to read password: {0}")]
    Prompt(std::io::Error),
}

/// A size written either as a plain byte count or with a suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    pub fn bytes(&self) -> Result<u64, SizeParseError> {
        match self {
            SizeValue::Bytes(bytes) => Ok(*bytes),
            SizeValue::Text(text) => parse_size(text),
        }
    }
}

/// Every option the config file may set. Keys mirror the long option
/// names with underscores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store: Option<String>,
    pub bucket: Option<String>,
    pub volume: Option<String>,
    pub log: Option<PathBuf>,
    pub log_level: Option<String>,
    pub password: Option<String>,
    pub password_prompt: Option<bool>,
    pub readonly: Option<bool>,
    pub nofork: Option<bool>,
    pub norandom: Option<bool>,
    pub force: Option<bool>,
    pub use_https: Option<bool>,
    pub cache_type: Option<String>,
    pub cache_max: Option<SizeValue>,
    pub cache_path: Option<PathBuf>,
    pub auto_create_bucket: Option<bool>,
    pub format: Option<String>,
    pub size: Option<SizeValue>,
    pub workers: Option<usize>,
    pub writeback_secs: Option<u64>,
    /// Argon2 cost for newly created volumes
    pub kdf_memory_kib: Option<u32>,
    pub kdf_iterations: Option<u32>,
    pub state_dir: Option<PathBuf>,
    pub amazon_key: Option<String>,
    pub amazon_secret: Option<String>,
    pub amazon_endpoint: Option<String>,
    pub amazon_region: Option<String>,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_project_id: Option<String>,
    pub google_token_file: Option<PathBuf>,
    pub dummy_path: Option<PathBuf>,
}

macro_rules! overlay {
    ($upper:ident, $lower:ident, { $($field:ident),* $(,)? }) => {
        FileConfig {
            $($field: $upper.$field.or($lower.$field),)*
        }
    };
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.cloudfs.toml`, or nothing if it does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE)) {
            Some(path) if path.exists() => {
                tracing::debug!(path = %path.display(), "loading default config");
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Fields set in `self` win over `lower`.
    pub fn overlay(self, lower: FileConfig) -> FileConfig {
        let upper = self;
        overlay!(upper, lower, {
            store,
            bucket,
            volume,
            log,
            log_level,
            password,
            password_prompt,
            readonly,
            nofork,
            norandom,
            force,
            use_https,
            cache_type,
            cache_max,
            cache_path,
            auto_create_bucket,
            format,
            size,
            workers,
            writeback_secs,
            kdf_memory_kib,
            kdf_iterations,
            state_dir,
            amazon_key,
            amazon_secret,
            amazon_endpoint,
            amazon_region,
            google_client_id,
            google_client_secret,
            google_project_id,
            google_token_file,
            dummy_path,
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum PasswordSource {
    Given(String),
    Prompt,
    Missing,
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordSource::Given(_) => f.write_str("Given(..)"),
            PasswordSource::Prompt => f.write_str("Prompt"),
            PasswordSource::Missing => f.write_str("Missing"),
        }
    }
}

impl PasswordSource {
    /// Resolve the password. [`PasswordSource::Prompt`] asks on stderr and
    /// reads from the terminal with echo turned off.
    pub fn resolve(&self) -> Result<Zeroizing<String>, ConfigError> {
        match self {
            PasswordSource::Given(password) => Ok(Zeroizing::new(password.clone())),
            PasswordSource::Prompt => {
                eprint!("Password: ");
                std::io::stderr().flush().map_err(ConfigError::Prompt)?;
                let password =
                    Zeroizing::new(rpassword::read_password().map_err(ConfigError::Prompt)?);
                if password.is_empty() {
                    return Err(ConfigError::NoPassword);
                }
                Ok(password)
            }
            PasswordSource::Missing => Err(ConfigError::NoPassword),
        }
    }
}

/// Fully resolved options for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store: StoreConfig,
    pub bucket: String,
    pub volume: Option<String>,
    pub engine: EngineConfig,
    pub password: PasswordSource,
    pub readonly: bool,
    pub force: bool,
    /// Accepted for compatibility; sessions always run in the foreground
    pub nofork: bool,
    pub auto_create_bucket: bool,
    pub format: VolumeFormat,
    pub size: Option<u64>,
    pub log: Option<PathBuf>,
    pub log_level: tracing::Level,
    pub state_dir: PathBuf,
}

impl Settings {
    pub fn volume(&self) -> Result<&str, ConfigError> {
        self.volume.as_deref().ok_or(ConfigError::Missing("volume"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }
}

/// `~/.cloudfs`, falling back to the working directory.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudfs")
}

fn required<T>(value: Option<T>, option: &'static str) -> Result<T, ConfigError> {
    value.ok_or(ConfigError::Missing(option))
}

fn store_config(config: &mut FileConfig) -> Result<StoreConfig, ConfigError> {
    let kind = required(config.store.take(), "store")?;
    match kind.as_str() {
        "dummy" => Ok(StoreConfig::Dummy {
            path: required(config.dummy_path.take(), "dummy-path")?,
        }),
        "amazon" => Ok(StoreConfig::Amazon {
            access_key: required(config.amazon_key.take(), "amazon-key")?,
            secret_key: required(config.amazon_secret.take(), "amazon-secret")?,
            endpoint: config.amazon_endpoint.take(),
            region: config.amazon_region.take(),
            use_https: config.use_https.unwrap_or(false),
        }),
        "google" => Ok(StoreConfig::Google {
            token_file: config.google_token_file.take(),
            client_id: config.google_client_id.take(),
            client_secret: config.google_client_secret.take(),
            project_id: config.google_project_id.take(),
        }),
        other => Err(ConfigError::Invalid {
            option: "store",
            reason: format!("unknown store '{other}' (expected dummy, amazon or google)"),
        }),
    }
}

impl TryFrom<FileConfig> for Settings {
    type Error = ConfigError;

    fn try_from(mut config: FileConfig) -> Result<Self, Self::Error> {
        let store = store_config(&mut config)?;
        let bucket = required(config.bucket, "bucket")?;

        let mut engine = EngineConfig::default();
        if let Some(kind) = config.cache_type {
            engine.cache.kind = kind.parse::<CacheKind>().map_err(|reason| ConfigError::Invalid {
                option: "cache-type",
                reason,
            })?;
        }
        if let Some(max) = config.cache_max {
            engine.cache.max_bytes = max.bytes()?;
        }
        engine.cache.path = config.cache_path;
        if let Some(workers) = config.workers {
            if workers == 0 {
                return Err(ConfigError::Invalid {
                    option: "workers",
                    reason: "must be at least 1".to_string(),
                });
            }
            engine.workers = workers;
        }
        if let Some(secs) = config.writeback_secs {
            engine.writeback_secs = secs;
        }
        if let Some(kib) = config.kdf_memory_kib {
            engine.kdf.mem_cost_kib = kib;
        }
        if let Some(iterations) = config.kdf_iterations {
            engine.kdf.time_cost = iterations;
        }
        engine.norandom = config.norandom.unwrap_or(false);

        let format = match config.format {
            Some(format) => format.parse::<VolumeFormat>().map_err(|reason| ConfigError::Invalid {
                option: "format",
                reason,
            })?,
            None => VolumeFormat::Tree,
        };
        let size = config.size.map(|size| size.bytes()).transpose()?;

        let log_level = match config.log_level {
            Some(level) => level.parse().map_err(|_| ConfigError::Invalid {
                option: "log-level",
                reason: format!("unknown level '{level}'"),
            })?,
            None => tracing::Level::INFO,
        };

        let password = match (config.password, config.password_prompt.unwrap_or(false)) {
            (_, true) => PasswordSource::Prompt,
            (Some(password), false) => PasswordSource::Given(password),
            (None, false) => PasswordSource::Missing,
        };

        Ok(Settings {
            store,
            bucket,
            volume: config.volume,
            engine,
            password,
            readonly: config.readonly.unwrap_or(false),
            force: config.force.unwrap_or(false),
            nofork: config.nofork.unwrap_or(false),
            auto_create_bucket: config.auto_create_bucket.unwrap_or(false),
            format,
            size,
            log: config.log,
            log_level,
            state_dir: config.state_dir.unwrap_or_else(default_state_dir),
        })
    }
}
