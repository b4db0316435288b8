//! Memory configuration
//!
//! JSON file with four sections, each optional and merged onto the defaults:
//!
//! ```json
//! {
//!   "storage":    { "backend": "sqlite", "path": "recall_memory.db" },
//!   "compaction": { "soft_threshold_ratio": 0.6, "hard_threshold_ratio": 0.85,
//!                   "model_context_window": 200000, "recent_window_size": 20, "chunk_size": 15 },
//!   "retrieval":  { "default_policy": "last_k", "default_k": 50, "namespaces": ["default"] },
//!   "tokenizer":  { "type": "word_estimate", "ratio": 1.3 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{PersistentMemoryAdapter, RetrievalConfig};
use crate::compaction::CompactionConfig;
use crate::error::{MemoryError, Result};
use crate::storage::pooled::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_POOL_SIZE};
use crate::storage::{PooledBackend, SqliteBackend, StorageBackend};
use crate::tokenizer::TokenizerConfig;

/// Environment variable holding the path of the configuration file
pub const CONFIG_ENV: &str = "RECALL_MEMORY_CONFIG";

/// Default database file of the embedded backend
pub const DEFAULT_SQLITE_PATH: &str = "recall_memory.db";

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlite`, or `pooled` (aliases: `sqlalchemy`, `postgres`)
    pub backend: String,

    /// Database file for `sqlite`
    pub path: PathBuf,

    /// Database URL for `pooled` (`postgres://...` or `sqlite://...`)
    pub url: Option<String>,

    /// Maximum pooled connections
    pub pool_size: u32,

    /// Wait for a pooled connection before timing out
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from(DEFAULT_SQLITE_PATH),
            url: None,
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl StorageConfig {
    /// Embedded backend at `path`
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Pooled backend at `url`
    pub fn pooled(url: impl Into<String>) -> Self {
        Self {
            backend: "pooled".to_string(),
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Open the configured backend
    pub fn open(&self) -> Result<Arc<dyn StorageBackend>> {
        match self.backend.as_str() {
            "sqlite" => Ok(Arc::new(SqliteBackend::open(&self.path)?)),
            "pooled" | "sqlalchemy" | "postgres" | "postgresql" => {
                let url = self.url.as_deref().ok_or_else(|| {
                    MemoryError::config(format!("storage backend '{}' requires a 'url'", self.backend))
                })?;
                Ok(Arc::new(PooledBackend::connect_with(
                    url,
                    self.pool_size,
                    Duration::from_secs(self.connect_timeout_secs),
                )?))
            }
            other => Err(MemoryError::config(format!("unknown storage backend '{other}'"))),
        }
    }
}

/// Full memory configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Backend selection
    pub storage: StorageConfig,
    /// Thresholds and windows of compaction
    pub compaction: CompactionConfig,
    /// Default retrieval policy
    pub retrieval: RetrievalConfig,
    /// Token counting
    pub tokenizer: TokenizerConfig,
}

impl MemoryConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a JSON string, merging onto the defaults
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| MemoryError::config(format!("invalid memory configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; a missing file is a configuration error
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MemoryError::config(format!("cannot read config file '{}': {e}", path.display()))
        })?;
        let config = Self::from_json(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded memory configuration");
        Ok(config)
    }

    /// Load from the file named by [`CONFIG_ENV`]
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).map_err(|_| {
            MemoryError::config(format!("environment variable {CONFIG_ENV} is not set"))
        })?;
        Self::from_file(path)
    }

    /// Replace the storage section
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the compaction section
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    /// Replace the retrieval section
    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Replace the tokenizer section
    pub fn with_tokenizer(mut self, tokenizer: TokenizerConfig) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Check the sections that can be checked without opening anything
    pub fn validate(&self) -> Result<()> {
        self.compaction.validate()?;
        if self.retrieval.default_k == 0 {
            return Err(MemoryError::config("retrieval.default_k must be positive"));
        }
        Ok(())
    }

    /// Open the backend, build the tokenizer and construct an adapter
    pub fn build_adapter(
        &self,
        agent_id: &str,
        conversation_id: &str,
    ) -> Result<PersistentMemoryAdapter> {
        self.validate()?;
        let tokenizer = self.tokenizer.build()?;
        let backend = self.storage.open()?;
        PersistentMemoryAdapter::builder(backend, agent_id)
            .conversation(conversation_id)
            .tokenizer(tokenizer)
            .compaction(self.compaction.clone())
            .retrieval(self.retrieval.clone())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RetrievalPolicy;

    #[test]
    fn test_defaults() {
        let config = MemoryConfig::new();
        assert_eq!(config.storage.backend, "sqlite");
        assert_eq!(config.storage.path, PathBuf::from("recall_memory.db"));
        assert_eq!(config.storage.pool_size, 5);
        assert_eq!(config.compaction.soft_threshold_ratio, 0.6);
        assert_eq!(config.compaction.hard_threshold_ratio, 0.85);
        assert_eq!(config.compaction.model_context_window, 200_000);
        assert_eq!(config.compaction.recent_window_size, 20);
        assert_eq!(config.compaction.chunk_size, 15);
        assert_eq!(config.retrieval.default_policy, RetrievalPolicy::LastK);
        assert_eq!(config.retrieval.default_k, 50);
        assert_eq!(config.tokenizer.kind, "word_estimate");
    }

    #[test]
    fn test_partial_json_merges_onto_defaults() {
        let config = MemoryConfig::from_json(
            r#"{
                "compaction": { "hard_threshold_ratio": 0.9 },
                "retrieval": { "default_policy": "windowed" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.compaction.hard_threshold_ratio, 0.9);
        assert_eq!(config.compaction.soft_threshold_ratio, 0.6);
        assert_eq!(config.retrieval.default_policy, RetrievalPolicy::Windowed);
        assert_eq!(config.retrieval.default_k, 50);
        assert_eq!(config.retrieval.namespaces, vec!["default".to_string()]);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = MemoryConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));

        let err = MemoryConfig::from_json(r#"{"retrieval": {"default_policy": "semantic"}}"#)
            .unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let storage = StorageConfig {
            backend: "mongodb".into(),
            ..Default::default()
        };
        assert!(matches!(storage.open(), Err(MemoryError::Configuration(_))));
    }

    #[test]
    fn test_pooled_without_url_is_config_error() {
        let storage = StorageConfig {
            backend: "sqlalchemy".into(),
            ..Default::default()
        };
        assert!(matches!(storage.open(), Err(MemoryError::Configuration(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = MemoryConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, MemoryError::Configuration(_)));
    }

    #[test]
    fn test_env_loading() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("memory.db");
        let file = dir.path().join("memory.json");
        let json = serde_json::json!({
            "storage": { "backend": "sqlite", "path": db },
            "retrieval": { "default_k": 7 }
        });
        std::fs::write(&file, json.to_string()).unwrap();

        std::env::remove_var(CONFIG_ENV);
        assert!(matches!(
            MemoryConfig::from_env(),
            Err(MemoryError::Configuration(_))
        ));

        std::env::set_var(CONFIG_ENV, &file);
        let adapter = PersistentMemoryAdapter::from_env("env-agent", "conv").unwrap();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(adapter.retrieval_config().default_k, 7);
        adapter.store("persisted", None).unwrap();
        assert!(db.exists());
    }

    #[test]
    fn test_pooled_sqlite_from_config() {
        let config = MemoryConfig::new().with_storage(StorageConfig::pooled("sqlite::memory:"));
        let adapter = config.build_adapter("pooled-agent", "conv").unwrap();
        assert_eq!(adapter.backend().name(), "pooled:sqlite");
        adapter.store("hello", None).unwrap();
        assert_eq!(adapter.stats().unwrap().message_count, 1);
    }
}
