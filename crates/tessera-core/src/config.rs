//! # Configuration
//!
//! Persistence settings, loadable from TOML.
//!
//! ```toml
//! connection_url = "local:tessera.db"
//! optimistic = true
//! result_cache = "soft"
//! soft_cache_capacity = 512
//! fetch_size = "greedy"
//! load_results_at_commit = true
//! allocation_size = 10
//! ```

use crate::TesseraError;
use crate::primitives::{
    DEFAULT_ALLOCATION_SIZE, DEFAULT_SOFT_CACHE_CAPACITY, LOCAL_URL_PREFIX, MEMORY_URL_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// =============================================================================
// RETENTION POLICY
// =============================================================================

/// How long a materialized result row stays reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Never retained; every access materializes again.
    None,
    /// Retained while some caller still holds the row.
    #[default]
    Weak,
    /// Retained up to a bounded capacity, least recently used evicted first.
    Soft,
    /// Retained until the result set is closed.
    Hard,
}

impl RetentionPolicy {
    /// Whether this policy keeps anything at all.
    #[must_use]
    pub const fn retains(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl FromStr for RetentionPolicy {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "weak" => Ok(Self::Weak),
            "soft" => Ok(Self::Soft),
            "hard" => Ok(Self::Hard),
            other => Err(TesseraError::InvalidConfig(format!(
                "unknown result cache type '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// FETCH SIZE
// =============================================================================

/// How many result rows to materialize when a result set is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchSize {
    /// Materialize every row up front.
    Greedy,
    /// Let the result set decide; rows are materialized on access inside a
    /// transaction and eagerly outside one.
    #[default]
    Optimal,
    /// Materialize the first `n` rows up front.
    Rows(usize),
}

impl FromStr for FetchSize {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "greedy" => Ok(Self::Greedy),
            "optimal" => Ok(Self::Optimal),
            n => n.parse::<usize>().map(Self::Rows).map_err(|_| {
                TesseraError::InvalidConfig(format!("invalid fetch size '{}'", s))
            }),
        }
    }
}

impl fmt::Display for FetchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Greedy => f.write_str("greedy"),
            Self::Optimal => f.write_str("optimal"),
            Self::Rows(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for FetchSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Rows(n) => serializer.serialize_u64(*n as u64),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for FetchSize {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Self::Rows(n as usize)),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// CONNECTION TARGET
// =============================================================================

/// Store selected by a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// In-process memory store.
    Memory,
    /// Embedded redb database at the given path.
    Local(PathBuf),
}

impl StoreTarget {
    /// Parse a connection URL.
    ///
    /// # Errors
    ///
    /// Returns `TesseraError::InvalidConfig` unless the URL starts with
    /// `memory:` or `local:<path>`.
    pub fn parse(url: &str) -> Result<Self, TesseraError> {
        if url.starts_with(MEMORY_URL_PREFIX) {
            Ok(Self::Memory)
        } else if let Some(path) = url.strip_prefix(LOCAL_URL_PREFIX) {
            if path.is_empty() {
                return Err(TesseraError::InvalidConfig(
                    "local: URL requires a database path".to_string(),
                ));
            }
            Ok(Self::Local(PathBuf::from(path)))
        } else {
            Err(TesseraError::InvalidConfig(format!(
                "connection URL '{}' must start with '{}' or '{}'",
                url, MEMORY_URL_PREFIX, LOCAL_URL_PREFIX
            )))
        }
    }
}

// =============================================================================
// PERSISTENCE CONFIG
// =============================================================================

/// Settings of a session and the result sets it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store to connect to (`memory:` or `local:<path>`).
    pub connection_url: String,
    /// Version-check updates and deletes of versioned classes before writing.
    pub optimistic: bool,
    /// Default retention of materialized result rows.
    pub result_cache: RetentionPolicy,
    /// Capacity of soft-retention caches.
    pub soft_cache_capacity: usize,
    /// Default eager materialization.
    pub fetch_size: FetchSize,
    /// Materialize every remaining row when the connection closes.
    pub load_results_at_commit: bool,
    /// Identifiers a sequence counter advances per reservation.
    pub allocation_size: i64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            connection_url: MEMORY_URL_PREFIX.to_string(),
            optimistic: true,
            result_cache: RetentionPolicy::default(),
            soft_cache_capacity: DEFAULT_SOFT_CACHE_CAPACITY,
            fetch_size: FetchSize::default(),
            load_results_at_commit: true,
            allocation_size: DEFAULT_ALLOCATION_SIZE,
        }
    }
}

impl PersistenceConfig {
    /// Parse from TOML text and validate.
    pub fn from_toml_str(text: &str) -> Result<Self, TesseraError> {
        let config: Self =
            toml::from_str(text).map_err(|e| TesseraError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TesseraError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TesseraError::IoError(format!(
                "cannot read config '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), TesseraError> {
        StoreTarget::parse(&self.connection_url)?;
        if self.allocation_size < 1 {
            return Err(TesseraError::InvalidConfig(format!(
                "allocation_size must be positive, got {}",
                self.allocation_size
            )));
        }
        if self.result_cache == RetentionPolicy::Soft && self.soft_cache_capacity == 0 {
            return Err(TesseraError::InvalidConfig(
                "soft_cache_capacity must be positive for a soft result cache".to_string(),
            ));
        }
        Ok(())
    }

    /// Store selected by `connection_url`.
    pub fn store_target(&self) -> Result<StoreTarget, TesseraError> {
        StoreTarget::parse(&self.connection_url)
    }
}

// =============================================================================
// PER-QUERY OPTIONS
// =============================================================================

/// Overrides of the result-set settings for a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Retention policy of materialized rows.
    pub result_cache: Option<RetentionPolicy>,
    /// Eager materialization.
    pub fetch_size: Option<FetchSize>,
    /// Materialize remaining rows when the connection closes.
    pub load_results_at_commit: Option<bool>,
}

impl QueryOptions {
    /// Effective settings: overrides first, then `config`.
    #[must_use]
    pub fn settings(&self, config: &PersistenceConfig, transaction_active: bool) -> ResultSettings {
        ResultSettings {
            retention: self.result_cache.unwrap_or(config.result_cache),
            soft_capacity: config.soft_cache_capacity,
            fetch_size: self.fetch_size.unwrap_or(config.fetch_size),
            load_at_close: self
                .load_results_at_commit
                .unwrap_or(config.load_results_at_commit),
            transaction_active,
        }
    }
}

/// Settings one result set is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSettings {
    /// Retention policy of materialized rows.
    pub retention: RetentionPolicy,
    /// Capacity of a soft cache.
    pub soft_capacity: usize,
    /// Eager materialization.
    pub fetch_size: FetchSize,
    /// Materialize remaining rows when the connection closes.
    pub load_at_close: bool,
    /// Whether the opening session is inside a transaction.
    pub transaction_active: bool,
}

impl Default for ResultSettings {
    fn default() -> Self {
        QueryOptions::default().settings(&PersistenceConfig::default(), false)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PersistenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store_target().expect("target"), StoreTarget::Memory);
        assert_eq!(config.result_cache, RetentionPolicy::Weak);
    }

    #[test]
    fn parses_toml_with_overrides() {
        let config = PersistenceConfig::from_toml_str(
            r#"
            connection_url = "local:/tmp/t.db"
            result_cache = "hard"
            fetch_size = 20
            allocation_size = 10
            "#,
        )
        .expect("parse");

        assert_eq!(config.result_cache, RetentionPolicy::Hard);
        assert_eq!(config.fetch_size, FetchSize::Rows(20));
        assert_eq!(config.allocation_size, 10);
        assert!(config.optimistic);
        assert_eq!(
            config.store_target().expect("target"),
            StoreTarget::Local(PathBuf::from("/tmp/t.db"))
        );
    }

    #[test]
    fn parses_named_fetch_size() {
        let config = PersistenceConfig::from_toml_str("fetch_size = \"greedy\"").expect("parse");
        assert_eq!(config.fetch_size, FetchSize::Greedy);
    }

    #[test]
    fn rejects_unknown_url_scheme() {
        let result = PersistenceConfig::from_toml_str("connection_url = \"remote:host\"");
        assert!(matches!(result, Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_non_positive_allocation() {
        let result = PersistenceConfig::from_toml_str("allocation_size = 0");
        assert!(matches!(result, Err(TesseraError::InvalidConfig(_))));
    }

    #[test]
    fn query_options_override_config() {
        let config = PersistenceConfig {
            result_cache: RetentionPolicy::Soft,
            ..PersistenceConfig::default()
        };
        let options = QueryOptions {
            fetch_size: Some(FetchSize::Greedy),
            ..QueryOptions::default()
        };
        let settings = options.settings(&config, true);
        assert_eq!(settings.retention, RetentionPolicy::Soft);
        assert_eq!(settings.fetch_size, FetchSize::Greedy);
        assert!(settings.transaction_active);
        assert!(settings.load_at_close);
    }

    #[test]
    fn retention_policy_from_str() {
        assert_eq!("SOFT".parse::<RetentionPolicy>().expect("parse"), RetentionPolicy::Soft);
        assert!("sometimes".parse::<RetentionPolicy>().is_err());
        assert!(!RetentionPolicy::None.retains());
    }
}
