use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    // Generation capability (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Model for the structured classification call; falls back to llm_model.
    #[serde(default)]
    pub classify_model: Option<String>,

    // Database
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Conversation shape
    #[serde(default = "default_turn_cap")]
    pub turn_cap: usize,

    // Batch execution
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,

    // Retry policy for transient external failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    // Pairing
    #[serde(default = "default_cooldown_days")]
    pub cooldown_days: i64,

    // Shared quota windows (calls per minute)
    #[serde(default = "default_generation_per_minute")]
    pub generation_per_minute: u32,
    #[serde(default = "default_email_per_minute")]
    pub email_per_minute: u32,

    // Outbound email (HTTP mail API)
    #[serde(default)]
    pub email_api_url: String,
    #[serde(default)]
    pub email_api_key: Option<String>,
    #[serde(default = "default_email_from")]
    pub email_from: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_database_path() -> String {
    "nightshift.db".to_string()
}

fn default_turn_cap() -> usize {
    6
}

fn default_concurrency() -> usize {
    4
}

fn default_run_deadline_secs() -> u64 {
    6 * 3600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_cooldown_days() -> i64 {
    14
}

fn default_generation_per_minute() -> u32 {
    60
}

fn default_email_per_minute() -> u32 {
    30
}

fn default_email_from() -> String {
    "reports@nightshift.local".to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            classify_model: None,
            database_path: default_database_path(),
            turn_cap: default_turn_cap(),
            concurrency: default_concurrency(),
            run_deadline_secs: default_run_deadline_secs(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            cooldown_days: default_cooldown_days(),
            generation_per_minute: default_generation_per_minute(),
            email_per_minute: default_email_per_minute(),
            email_api_url: String::new(),
            email_api_key: None,
            email_from: default_email_from(),
        }
    }
}

impl PipelineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("nightshift_config.toml")
    }

    /// Load config from nightshift_config.toml next to the executable,
    /// falling back to defaults plus env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<PipelineConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("NIGHTSHIFT_LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("NIGHTSHIFT_LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("NIGHTSHIFT_LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(model) = env::var("NIGHTSHIFT_CLASSIFY_MODEL") {
            if !model.trim().is_empty() {
                config.classify_model = Some(model);
            }
        }

        if let Ok(path) = env::var("NIGHTSHIFT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(cap) = env::var("NIGHTSHIFT_TURN_CAP") {
            if let Ok(turns) = cap.parse() {
                config.turn_cap = turns;
            }
        }

        if let Ok(workers) = env::var("NIGHTSHIFT_CONCURRENCY") {
            if let Ok(count) = workers.parse() {
                config.concurrency = count;
            }
        }

        if let Ok(deadline) = env::var("NIGHTSHIFT_RUN_DEADLINE_SECS") {
            if let Ok(seconds) = deadline.parse() {
                config.run_deadline_secs = seconds;
            }
        }

        if let Ok(days) = env::var("NIGHTSHIFT_COOLDOWN_DAYS") {
            if let Ok(days) = days.parse() {
                config.cooldown_days = days;
            }
        }

        if let Ok(url) = env::var("NIGHTSHIFT_EMAIL_API_URL") {
            config.email_api_url = url;
        }

        if let Ok(key) = env::var("NIGHTSHIFT_EMAIL_API_KEY") {
            config.email_api_key = Some(key);
        }

        if let Ok(from) = env::var("NIGHTSHIFT_EMAIL_FROM") {
            if !from.trim().is_empty() {
                config.email_from = from;
            }
        }

        config
    }
}
