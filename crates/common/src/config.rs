//! Engine configuration.
//!
//! Built once at startup (the CLI layers a TOML file and flags on top of the
//! defaults) and passed by reference into the volume engine, cache and crypt
//! engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use store::RetryPolicy;

use crate::crypto::KdfParams;
use crate::pool::DEFAULT_WORKERS;

pub const DEFAULT_CACHE_MAX: u64 = 256 * 1024 * 1024;
pub const DEFAULT_FLUSH_RETRIES: u32 = 3;
pub const DEFAULT_WRITEBACK_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    #[default]
    Memory,
    File,
}

impl std::str::FromStr for CacheKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(CacheKind::Memory),
            "file" => Ok(CacheKind::File),
            other => Err(format!("unknown cache type '{other}' (expected memory or file)")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// Resident byte budget
    pub max_bytes: u64,
    /// Spill directory for the file cache. Defaults to the system temp dir.
    pub path: Option<PathBuf>,
    /// Attempts per dirty entry before a flush error is surfaced
    pub flush_retries: u32,
    pub flush_backoff_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::Memory,
            max_bytes: DEFAULT_CACHE_MAX,
            path: None,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub workers: usize,
    pub kdf: KdfParams,
    /// Use the seeded generator instead of the OS RNG for nonces and salts
    pub norandom: bool,
    /// Period of the background flusher while a volume is mounted
    pub writeback_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            workers: DEFAULT_WORKERS,
            kdf: KdfParams::default(),
            norandom: false,
            writeback_secs: DEFAULT_WRITEBACK_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Small, fast settings for tests.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                max_bytes: 1024 * 1024,
                flush_backoff_ms: 1,
                ..CacheConfig::default()
            },
            workers: 4,
            kdf: KdfParams::for_testing(),
            retry: RetryPolicy::none(),
            ..Self::default()
        }
    }

    pub fn writeback_interval(&self) -> Duration {
        Duration::from_secs(self.writeback_secs.max(1))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid size '{0}': expected a number with an optional K, M, G or T suffix")]
pub struct SizeParseError(pub String);

/// Parse sizes like `4096`, `512K`, `10G` (powers of 1024).
pub fn parse_size(input: &str) -> Result<u64, SizeParseError> {
    let err = || SizeParseError(input.to_string());
    let trimmed = input.trim();
    let (digits, shift) = match trimmed.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(err()),
            };
            (&trimmed[..i], shift)
        }
        Some(_) => (trimmed, 0),
        None => return Err(err()),
    };
    let value: u64 = digits.trim().parse().map_err(|_| err())?;
    value.checked_mul(1u64 << shift).ok_or_else(err)
}

/// Render a byte count with the largest exact suffix.
pub fn format_size(bytes: u64) -> String {
    for (suffix, shift) in [("T", 40), ("G", 30), ("M", 20), ("K", 10)] {
        let unit = 1u64 << shift;
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("512m"), Ok(512 << 20));
        assert_eq!(parse_size("10G"), Ok(10 << 30));
        assert_eq!(parse_size("1T"), Ok(1 << 40));
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("99999999999T").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(1 << 30), "1G");
        assert_eq!(format_size(3 << 20), "3M");
        assert_eq!(format_size(1500), "1500");
    }

    #[test]
    fn test_config_from_partial_toml_like_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"workers": 2, "cache": {"kind": "file"}}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.cache.kind, CacheKind::File);
        assert_eq!(config.cache.flush_retries, DEFAULT_FLUSH_RETRIES);
    }
}
