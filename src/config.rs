//! On-disk configuration. Loaded once from `<root>/.semantic-code.json`,
//! falling back silently to defaults on a missing file or parse error (logged
//! at `warn`). Every field has a default, so a partial or empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::logging::LogFormat;
use crate::retrieval::{DEFAULT_CANDIDATE_MULTIPLIER, DEFAULT_LIMIT};

pub const CONFIG_FILE_NAME: &str = ".semantic-code.json";

/// Hard ceiling applied regardless of configuration: files larger than this are
/// always skipped during a scan.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 1_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn parsed_log_format(&self) -> LogFormat {
        self.log_format.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    /// Where the persisted index lives, relative to the indexed root.
    pub index_dir: PathBuf,
    /// Where embedder/reranker weights are cached. `None` uses the user cache dir.
    pub model_cache_dir: Option<PathBuf>,
    /// Directory *names* skipped anywhere in the tree, in addition to the
    /// built-in default ignore set.
    pub exclude_dir_names: Vec<String>,
    pub model: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_dir: PathBuf::from(".semantic-code/index"),
            model_cache_dir: None,
            exclude_dir_names: vec![],
            model: "minishlab/potion-retrieval-32M".to_string(),
        }
    }
}

impl IndexConfig {
    /// `exclude_dir_names` plus the index directory's own top-level component,
    /// so a scan never walks back into the index it is writing — without this
    /// the store's own on-disk files get chunked and re-indexed as source.
    pub fn scan_exclude_dir_names(&self) -> Vec<String> {
        let mut names = self.exclude_dir_names.clone();
        if let Some(top) = self.index_dir.components().next() {
            let top = top.as_os_str().to_string_lossy().to_string();
            if !top.is_empty() && !names.iter().any(|n| n == &top) {
                names.push(top);
            }
        }
        names
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub candidate_multiplier: usize,
    pub use_reranking: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            candidate_multiplier: DEFAULT_CANDIDATE_MULTIPLIER,
            use_reranking: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub grammar_cache_capacity: usize,
    pub query_embedding_cache_capacity: usize,
    pub query_embedding_cache_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grammar_cache_capacity: 9,
            query_embedding_cache_capacity: 256,
            query_embedding_cache_ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
}

/// Load config from `<root>/.semantic-code.json`, falling back silently (with a
/// `warn`-level log) to defaults on a missing file or parse error.
pub fn load_config(repo_root: &Path) -> Config {
    let path = repo_root.join(CONFIG_FILE_NAME);

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Config::default(),
        Err(e) => {
            warn!(component = "config", path = %path.display(), error = %e, "failed to read config file, using defaults");
            return Config::default();
        }
    };

    match serde_json::from_str::<Config>(&text) {
        Ok(config) => config,
        Err(e) => {
            warn!(component = "config", path = %path.display(), error = %e, "failed to parse config file, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.retrieval.default_limit, DEFAULT_LIMIT);
        assert_eq!(config.cache.query_embedding_cache_capacity, 256);
        assert_eq!(config.cache.query_embedding_cache_ttl_seconds, 300);
    }

    #[test]
    fn missing_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_config_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{not json").unwrap();
        let config = load_config(dir.path());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_config_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"retrieval": {"default_limit": 20}}"#,
        )
        .unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.retrieval.default_limit, 20);
        assert_eq!(config.retrieval.candidate_multiplier, DEFAULT_CANDIDATE_MULTIPLIER);
        assert_eq!(config.server.log_level, "info");
    }

    #[test]
    fn log_format_parses_from_string() {
        let mut config = ServerConfig::default();
        config.log_format = "json".to_string();
        assert_eq!(config.parsed_log_format(), LogFormat::Json);
    }

    #[test]
    fn scan_exclude_dir_names_includes_index_dir_top_component() {
        let config = IndexConfig::default();
        let names = config.scan_exclude_dir_names();
        assert!(names.contains(&".semantic-code".to_string()));
    }

    #[test]
    fn scan_exclude_dir_names_does_not_duplicate_existing_entry() {
        let mut config = IndexConfig::default();
        config.exclude_dir_names = vec![".semantic-code".to_string(), "vendor".to_string()];
        let names = config.scan_exclude_dir_names();
        assert_eq!(names.iter().filter(|n| *n == ".semantic-code").count(), 1);
        assert!(names.contains(&"vendor".to_string()));
    }

    #[test]
    fn scan_exclude_dir_names_honors_custom_index_dir() {
        let mut config = IndexConfig::default();
        config.index_dir = PathBuf::from(".custom-index/data");
        let names = config.scan_exclude_dir_names();
        assert!(names.contains(&".custom-index".to_string()));
    }
}
