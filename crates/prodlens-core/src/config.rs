use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProdLensError, Result};
use crate::types::{Confidence, Route};

/// Top-level configuration for ProdLens.
///
/// Loaded from `~/.prodlens/config.toml` by default. Every section falls back
/// to its defaults when absent, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProdLensConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl ProdLensConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProdLensConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist, cannot be parsed, or fails validation.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if !self.routing.small_talk_enabled && self.routing.fallback_route == Route::SmallTalk {
            return Err(ProdLensError::Config(
                "routing.fallback_route cannot be small_talk when small_talk_enabled is false"
                    .to_string(),
            ));
        }

        let temperatures = [
            ("llm.rewrite_temperature", self.llm.rewrite_temperature),
            ("llm.decision_temperature", self.llm.decision_temperature),
            ("llm.synthesis_temperature", self.llm.synthesis_temperature),
            ("llm.translator_temperature", self.llm.translator_temperature),
        ];
        for (name, value) in temperatures {
            if !(0.0..=2.0).contains(&value) {
                return Err(ProdLensError::Config(format!(
                    "{} must be between 0.0 and 2.0, got {}",
                    name, value
                )));
            }
        }

        if self.conversation.context_messages == 0 {
            return Err(ProdLensError::Config(
                "conversation.context_messages must be at least 1".to_string(),
            ));
        }
        if self.conversation.max_message_chars == 0 {
            return Err(ProdLensError::Config(
                "conversation.max_message_chars must be at least 1".to_string(),
            ));
        }
        if self.conversation.node_timeout_secs == 0 {
            return Err(ProdLensError::Config(
                "conversation.node_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.conversation.max_history_messages != 0 && self.conversation.max_history_messages < 2
        {
            return Err(ProdLensError::Config(
                "conversation.max_history_messages must be 0 (unbounded) or at least 2".to_string(),
            ));
        }
        if self.retrieval.top_k == 0 {
            return Err(ProdLensError::Config(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.retrieval.reference_category == self.retrieval.opinion_category {
            return Err(ProdLensError::Config(
                "retrieval.reference_category and retrieval.opinion_category must differ"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// The data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    /// Resolve a path from the config relative to the data directory.
    ///
    /// Absolute paths and `~` paths are returned as-is (after expansion).
    pub fn data_path(&self, relative: &str) -> PathBuf {
        let expanded = expand_home(relative);
        if expanded.is_absolute() {
            expanded
        } else {
            self.data_dir().join(expanded)
        }
    }
}

/// Expand `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for session store, catalog, vector snapshot.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.prodlens/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Language-model service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Model used for rewriting, routing, extraction, small talk and synthesis.
    pub chat_model: String,
    /// Model used for text-to-SQL translation.
    pub translator_model: String,
    /// `"mock"` selects deterministic offline embeddings.
    pub embedding_model: String,
    /// Length of vectors returned by `embedding_model`.
    pub embedding_dimensions: usize,
    pub rewrite_temperature: f32,
    pub decision_temperature: f32,
    pub synthesis_temperature: f32,
    pub translator_temperature: f32,
    pub translator_max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            translator_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 1536,
            rewrite_temperature: 0.1,
            decision_temperature: 0.1,
            synthesis_temperature: 0.7,
            translator_temperature: 0.0,
            translator_max_tokens: 800,
            request_timeout_secs: 30,
        }
    }
}

/// Intent routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Whether the small-talk branch exists.
    pub small_talk_enabled: bool,
    /// Route used when the router fails or returns an unknown label.
    pub fallback_route: Route,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            small_talk_enabled: true,
            fallback_route: Route::SmallTalk,
        }
    }
}

/// Conversation window, retention and per-node limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// History entries read by context-dependent steps.
    pub context_messages: usize,
    /// Longest accepted user message, in characters.
    pub max_message_chars: usize,
    /// Per-session history cap; 0 keeps everything.
    pub max_history_messages: usize,
    /// Idle sessions older than this are evicted; 0 never evicts.
    pub session_ttl_minutes: u64,
    /// Upper bound on any single external call.
    pub node_timeout_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            context_messages: 6,
            max_message_chars: 2000,
            max_history_messages: 1000,
            session_ttl_minutes: 0,
            node_timeout_secs: 45,
        }
    }
}

/// Entity resolver policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Lowest confidence at which a context-extracted id is trusted.
    pub min_context_confidence: Confidence,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_context_confidence: Confidence::High,
        }
    }
}

/// Semantic retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Metadata key holding the passage category.
    pub category_key: String,
    /// Metadata key holding the product id.
    pub entity_key: String,
    /// Category value for reference material.
    pub reference_category: String,
    /// Category value for user opinions.
    pub opinion_category: String,
    /// JSONL snapshot of the vector index, relative to `data_dir`.
    pub index_path: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            category_key: "type".to_string(),
            entity_key: "product_id".to_string(),
            reference_category: "spec".to_string(),
            opinion_category: "reviews".to_string(),
            index_path: "vectors.jsonl".to_string(),
        }
    }
}

/// Product catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// SQLite catalog, relative to `data_dir`.
    pub database_path: String,
    /// Schema description handed to the translator, relative to `data_dir`.
    pub schema_path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_path: "catalog.db".to_string(),
            schema_path: "schema.sql".to_string(),
        }
    }
}

/// Prompt template settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Directory whose `<name>.txt` files override the built-in templates.
    pub template_dir: Option<String>,
    pub version: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            version: "v1".to_string(),
        }
    }
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite session database relative to `data_dir`; empty keeps sessions in memory.
    pub session_db: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_db: "sessions.db".to_string(),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3040,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = ProdLensConfig::default();
        assert_eq!(config.general.data_dir, "~/.prodlens/data");
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.llm.chat_model, "gpt-4o-mini");
        assert_eq!(config.llm.translator_model, "gpt-4o");
        assert_eq!(config.llm.translator_max_tokens, 800);
        assert!(config.routing.small_talk_enabled);
        assert_eq!(config.routing.fallback_route, Route::SmallTalk);
        assert_eq!(config.conversation.context_messages, 6);
        assert_eq!(config.resolver.min_context_confidence, Confidence::High);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.reference_category, "spec");
        assert_eq!(config.retrieval.opinion_category, "reviews");
        assert_eq!(config.api.port, 3040);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
data_dir = "/custom/data"
log_level = "debug"

[llm]
endpoint = "http://localhost:11434/v1"
chat_model = "llama3"

[routing]
small_talk_enabled = false
fallback_route = "structured_lookup"

[resolver]
min_context_confidence = "medium"

[retrieval]
top_k = 5
"#;
        let file = create_temp_config(content);
        let config = ProdLensConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "/custom/data");
        assert_eq!(config.llm.endpoint, "http://localhost:11434/v1");
        assert_eq!(config.llm.chat_model, "llama3");
        assert!(!config.routing.small_talk_enabled);
        assert_eq!(config.routing.fallback_route, Route::StructuredLookup);
        assert_eq!(config.resolver.min_context_confidence, Confidence::Medium);
        assert_eq!(config.retrieval.top_k, 5);
        // Untouched sections keep defaults.
        assert_eq!(config.conversation.node_timeout_secs, 45);
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[general]
log_level = "warn"
"#;
        let file = create_temp_config(content);
        let config = ProdLensConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "warn");
        assert_eq!(config.general.data_dir, "~/.prodlens/data");
        assert_eq!(config.storage.session_db, "sessions.db");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = ProdLensConfig::load_or_default(Path::new("/nonexistent/config.toml"));
        assert_eq!(config.general.data_dir, "~/.prodlens/data");
    }

    #[test]
    fn test_load_rejects_unknown_route_label() {
        let content = r#"
[routing]
fallback_route = "weather"
"#;
        let file = create_temp_config(content);
        assert!(ProdLensConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let file = create_temp_config("this is {{ not valid TOML");
        let result = ProdLensConfig::load(file.path());
        assert!(matches!(result, Err(ProdLensError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_small_talk_fallback_without_branch() {
        let mut config = ProdLensConfig::default();
        config.routing.small_talk_enabled = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fallback_route"));

        config.routing.fallback_route = Route::StructuredLookup;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_temperature() {
        let mut config = ProdLensConfig::default();
        config.llm.synthesis_temperature = 3.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("synthesis_temperature"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = ProdLensConfig::default();
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = ProdLensConfig::default();
        config.conversation.context_messages = 0;
        assert!(config.validate().is_err());

        let mut config = ProdLensConfig::default();
        config.conversation.max_history_messages = 1;
        assert!(config.validate().is_err());

        let mut config = ProdLensConfig::default();
        config.conversation.max_history_messages = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_identical_categories() {
        let mut config = ProdLensConfig::default();
        config.retrieval.opinion_category = "spec".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_on_invalid_values() {
        let content = r#"
[retrieval]
top_k = 0
"#;
        let file = create_temp_config(content);
        let config = ProdLensConfig::load_or_default(file.path());
        assert_eq!(config.retrieval.top_k, 3);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let mut config = ProdLensConfig::default();
        config.prompts.template_dir = Some("/etc/prodlens/templates".to_string());
        config.save(&path).unwrap();

        let reloaded = ProdLensConfig::load(&path).unwrap();
        assert_eq!(reloaded.general.data_dir, config.general.data_dir);
        assert_eq!(
            reloaded.prompts.template_dir.as_deref(),
            Some("/etc/prodlens/templates")
        );
        assert_eq!(reloaded.routing.fallback_route, Route::SmallTalk);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let file = create_temp_config("");
        let config = ProdLensConfig::load(file.path()).unwrap();
        assert_eq!(config.general.data_dir, "~/.prodlens/data");
        assert_eq!(config.catalog.database_path, "catalog.db");
        assert!(config.prompts.template_dir.is_none());
    }

    #[test]
    fn test_data_path_resolution() {
        let mut config = ProdLensConfig::default();
        config.general.data_dir = "/var/lib/prodlens".to_string();
        assert_eq!(
            config.data_path("catalog.db"),
            PathBuf::from("/var/lib/prodlens/catalog.db")
        );
        assert_eq!(
            config.data_path("/opt/catalog.db"),
            PathBuf::from("/opt/catalog.db")
        );
    }

    #[test]
    fn test_expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("relative/dir"), PathBuf::from("relative/dir"));
        assert!(!expand_home("~/x").to_string_lossy().starts_with('~'));
    }
}
