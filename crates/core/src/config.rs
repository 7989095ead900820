//! TOML-based configuration for treemerge.
//!
//! Every section has defaults, so an empty file yields an in-memory store
//! with no resolution policies beyond the built-in ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conflict::{ConflictType, NamePatternPolicy, PolicyChain, Side, TextMergePolicy};
use crate::db::SqliteSubstrate;
use crate::errors::{ConfigError, CoreError};
use crate::store::{MemorySubstrate, Substrate};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Node store and merge loop settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Conflict resolution policies.
    #[serde(default)]
    pub resolution: ResolutionConfig,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Where node documents are kept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Process-local; lost on exit.
    #[default]
    Memory,
    /// SQLite database at `database_path`.
    Sqlite,
}

/// Node store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Children fetched per substrate query when listing (default 100).
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// Merge attempts before giving up on a moving head (default 5).
    #[serde(default = "default_max_merge_attempts")]
    pub max_merge_attempts: u32,

    #[serde(default)]
    pub backend: Backend,

    /// Required when `backend = "sqlite"`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_page_limit() -> usize {
    100
}
fn default_max_merge_attempts() -> u32 {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            page_limit: default_page_limit(),
            max_merge_attempts: default_max_merge_attempts(),
            backend: Backend::default(),
            database_path: None,
        }
    }
}

impl StoreConfig {
    /// Open the configured substrate.
    pub fn open_substrate(&self) -> Result<Arc<dyn Substrate>, CoreError> {
        match self.backend {
            Backend::Memory => Ok(Arc::new(MemorySubstrate::new())),
            Backend::Sqlite => {
                let path = self.database_path.as_ref().ok_or_else(|| ConfigError::InvalidValue {
                    field: "store.database_path".into(),
                    detail: "required for the sqlite backend".into(),
                })?;
                info!(path = %path.display(), "opening sqlite substrate");
                Ok(Arc::new(SqliteSubstrate::new(path)?))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Conflict resolution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Attempt a line-based merge of strings changed on both sides.
    #[serde(default)]
    pub text_merge: bool,

    /// Name-pattern rules, tried in file order.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Keep one side for conflicts on names matching `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    /// Glob matched against the conflicting property or child name.
    pub pattern: String,

    /// Conflict type names the rule applies to, e.g. `changeChangedProperty`.
    /// All types when omitted.
    #[serde(default)]
    pub conflict_types: Option<Vec<String>>,

    pub decision: Side,
}

impl PolicyRule {
    fn conflict_types(&self) -> Result<Option<Vec<ConflictType>>, ConfigError> {
        let Some(names) = &self.conflict_types else {
            return Ok(None);
        };
        names
            .iter()
            .map(|n| {
                ConflictType::from_name(n).ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("resolution.rules.{}.conflict_types", self.name),
                    detail: format!("unknown conflict type '{n}'"),
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    fn policy(&self) -> Result<NamePatternPolicy, ConfigError> {
        let policy = NamePatternPolicy::new(&self.name, &self.pattern, self.decision);
        Ok(match self.conflict_types()? {
            Some(types) => policy.only(types),
            None => policy,
        })
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl MergeConfig {
    /// Load a [`MergeConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate that all values are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.page_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.page_limit".into(),
                detail: "page limit must be > 0".into(),
            });
        }
        if self.store.max_merge_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store.max_merge_attempts".into(),
                detail: "at least one merge attempt is required".into(),
            });
        }
        if self.store.backend == Backend::Sqlite && self.store.database_path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "store.database_path".into(),
                detail: "required for the sqlite backend".into(),
            });
        }
        for rule in &self.resolution.rules {
            if rule.pattern.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("resolution.rules.{}.pattern", rule.name),
                    detail: "pattern must not be empty".into(),
                });
            }
            rule.conflict_types()?;
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the resolution chain: configured rules in file order, then the
    /// text merge when enabled.
    pub fn policy_chain(&self) -> Result<PolicyChain, ConfigError> {
        let mut chain = PolicyChain::new();
        for rule in &self.resolution.rules {
            chain.push(rule.policy()?);
        }
        if self.resolution.text_merge {
            chain.push(TextMergePolicy);
        }
        debug!(policies = ?chain.names(), "built resolution chain");
        Ok(chain)
    }
}
