use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, AgentResult};

/// Environment prefix for configuration overrides, e.g. `ASTRO__MEMORY__USER_ID`.
pub(crate) const ENV_PREFIX: &str = "ASTRO";

/// Maximum number of rotating credentials the memory system accepts.
pub(crate) const MAX_CREDENTIALS: usize = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub memory: MemoryConfig,
    pub keys: KeysConfig,
    pub tools: ToolsConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load the configuration from an optional TOML file layered with
    /// `ASTRO__*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| AgentError::Config(format!("{}: {e}", path.display())))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.memory.user_id.trim().is_empty() {
            return Err(AgentError::Config("memory.user_id must not be empty".into()));
        }
        if self.memory.collection_name.trim().is_empty() {
            return Err(AgentError::Config(
                "memory.collection_name must not be empty".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.memory.llm_temperature) {
            return Err(AgentError::Config(format!(
                "memory.llm_temperature out of range: {}",
                self.memory.llm_temperature
            )));
        }
        Ok(())
    }
}

/// Memory system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Enable/disable the memory system entirely
    pub enabled: bool,
    /// Memories are filtered by this identifier
    pub user_id: String,
    pub collection_name: String,
    /// Directory holding the on-disk collections
    pub store_path: PathBuf,
    /// Directory for raw session dumps written when every credential is exhausted
    pub fallback_dir: PathBuf,
    /// OpenAI-compatible base URL of the extraction model
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: i32,
    /// Per-request timeout of the extraction call; keep it below `session.flush_timeout_secs`
    pub llm_timeout_secs: u64,
    /// Upper bound on memories injected into the session at startup
    pub max_memories_load: Option<usize>,
    /// Soft limit; exceeding it only logs a warning
    pub max_tokens_per_flush: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_id: "default_user".to_string(),
            collection_name: "astro_memories".to_string(),
            store_path: PathBuf::from("./memory_db"),
            fallback_dir: PathBuf::from("./memory_fallback"),
            llm_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            llm_model: "gemini-2.5-flash".to_string(),
            llm_temperature: 0.2,
            llm_max_tokens: 2000,
            llm_timeout_secs: 20,
            max_memories_load: Some(10),
            max_tokens_per_flush: 8000,
        }
    }
}

/// Credential rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// File holding the persisted rotation index
    pub index_file: PathBuf,
    /// Environment variable prefix; keys are read from `<prefix>1` .. `<prefix>5`
    pub env_prefix: String,
    /// Explicit credentials, in priority order. Take precedence over the environment.
    pub credentials: Vec<String>,
    pub quota: QuotaConfig,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            index_file: PathBuf::from("./memory_key_index.txt"),
            env_prefix: "GOOGLE_API_MEMORY_KEY".to_string(),
            credentials: Vec::new(),
            quota: QuotaConfig::default(),
        }
    }
}

/// What counts as a quota/rate-limit error from the extraction provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub status_codes: Vec<u16>,
    pub markers: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            status_codes: vec![429],
            markers: vec![
                "RESOURCE_EXHAUSTED".to_string(),
                "quota".to_string(),
                "rate limit".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub weather_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub email_timeout_secs: u64,
    pub search_max_chars: usize,
    pub email: EmailConfig,
    /// Plaintext file that `generate_password` appends to when asked to save
    pub password_file: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            weather_timeout_secs: 8,
            search_timeout_secs: 20,
            email_timeout_secs: 15,
            search_max_chars: 800,
            email: EmailConfig::default(),
            password_file: PathBuf::from("./generated_passwords.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    /// Falls back to `GMAIL_USER`
    pub username: Option<String>,
    /// Falls back to `GMAIL_APP_PASSWORD`
    pub password: Option<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_server: "smtp.gmail.com".to_string(),
            smtp_port: 465,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Phrases that end the session, matched case-insensitively
    pub shutdown_phrases: Vec<String>,
    pub flush_timeout_secs: u64,
    pub goodbye_message: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_phrases: vec![
                "shutdown yourself".to_string(),
                "end session".to_string(),
                "end the session".to_string(),
                "turn off".to_string(),
            ],
            flush_timeout_secs: 30,
            goodbye_message:
                "Shutting down now. Goodbye, sir. It has been a pleasure serving you.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub dir: PathBuf,
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("./logs"),
            file_name: "astro.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("missing.toml")).unwrap();

        assert!(config.memory.enabled);
        assert_eq!(config.memory.user_id, "default_user");
        assert_eq!(config.keys.quota.status_codes, vec![429]);
        assert_eq!(config.tools.weather_timeout_secs, 8);
        assert_eq!(config.tools.search_timeout_secs, 20);
        assert_eq!(config.tools.email_timeout_secs, 15);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[memory]\nuser_id = \"tony\"\ncollection_name = \"jarvis\"\n\n[keys]\ncredentials = [\"a\", \"b\"]"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.memory.user_id, "tony");
        assert_eq!(config.memory.collection_name, "jarvis");
        assert_eq!(config.memory.llm_model, "gemini-2.5-flash");
        assert_eq!(config.keys.credentials, vec!["a", "b"]);
        assert_eq!(config.keys.env_prefix, "GOOGLE_API_MEMORY_KEY");
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[memory]\nuser_id = \"  \"").unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
