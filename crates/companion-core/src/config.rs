// Configuration loading and parsing (companion.toml, credentials.toml).

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::personality::{keyword_matcher, MATCHER_SIZE_LIMIT};
use crate::store::StoreBackend;

/// Shipped copy of `defaults/companion.toml`, written out when neither
/// `defaults/` nor `config/` exists next to the binary.
const EMBEDDED_COMPANION_TOML: &str = include_str!("../../../defaults/companion.toml");

const COMPANION_FILE: &str = "companion.toml";
const CREDENTIALS_FILE: &str = "credentials.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub relay: RelayClientConfig,
    pub personality: PersonalityConfig,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// companion.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire companion.toml file.
#[derive(Debug, Clone, Deserialize)]
struct CompanionFile {
    server: ServerConfig,
    llm: LlmConfig,
    storage: StorageConfig,
    relay: RelayClientConfig,
    #[serde(default)]
    personality: PersonalityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: String,
    /// Allowed CORS origins. Absent or empty means any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            static_dir: "static".into(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Number of recent turns quoted back to the model as conversation history.
    pub history_turns: usize,
    /// Number of recent turns the personality profile is computed from.
    pub profile_window: usize,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub primary: StoreBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
    pub sqlite_path: String,
}

fn default_redis_timeout_ms() -> u64 {
    1000
}

/// Where the CLI helpers find a running relay.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayClientConfig {
    pub trigger_url: String,
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersonalityConfig {
    pub dimensions: Vec<DimensionConfig>,
}

/// One personality axis: a weighted keyword dictionary.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DimensionConfig {
    /// Stable identifier used in code (`tsundere`, `gentleness`, ...).
    pub id: String,
    /// Human-facing name written into the model prompt.
    pub label: String,
    pub weight: f64,
    pub keywords: Vec<String>,
}

impl DimensionConfig {
    fn new(id: &str, label: &str, weight: f64, keywords: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            weight,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            dimensions: vec![
                DimensionConfig::new(
                    "tsundere",
                    "傲娇指数",
                    1.2,
                    &["笨蛋", "才不是", "讨厌", "不要你管", "哼", "才没有"],
                ),
                DimensionConfig::new(
                    "gentleness",
                    "温柔度",
                    1.0,
                    &["谢谢", "请", "好吗", "辛苦了", "帮帮我", "没关系"],
                ),
                DimensionConfig::new(
                    "combativeness",
                    "战斗倾向",
                    0.8,
                    &["攻击", "斩杀", "必胜", "战技", "敌人", "防御"],
                ),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/companion.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// Does not copy defaults; `load_config()` does that first.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    let companion_path = config_dir.join(COMPANION_FILE);
    let companion_text = read_file(&companion_path)?;
    let file = parse_companion(&companion_text, &companion_path)?;

    let credentials_path = config_dir.join(CREDENTIALS_FILE);
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: file.server,
        llm: file.llm,
        storage: file.storage,
        relay: file.relay,
        personality: file.personality,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

fn parse_companion(text: &str, path: &Path) -> Result<CompanionFile, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were created. Skips `.example` files.
///
/// When there is no `defaults/` directory either, the built-in
/// `companion.toml` is written instead.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let mut copied = Vec::new();

    if !defaults_dir.is_dir() {
        let target = config_dir.join(COMPANION_FILE);
        if write_new(&target, EMBEDDED_COMPANION_TOML.as_bytes())? {
            copied.push(target);
        }
        return Ok(copied);
    }

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();

        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }

        let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let target = config_dir.join(file_name);
        if write_new(&target, &content)? {
            copied.push(target);
        }
    }

    Ok(copied)
}

/// Create `target` with `content` unless it already exists. Returns whether
/// the file was written.
fn write_new(target: &Path, content: &[u8]) -> Result<bool, ConfigError> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(mut dest) => {
            std::io::Write::write_all(&mut dest, content).map_err(|e| {
                ConfigError::DefaultsCopyError {
                    message: format!("failed to write {}: {e}", target.display()),
                }
            })?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", target.display()),
        }),
    }
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port", "must be greater than 0"));
    }

    let endpoint = &config.llm.endpoint;
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(invalid(
            "llm.endpoint",
            format!("must be an http(s) URL, got {endpoint:?}"),
        ));
    }

    let llm_fields: &[(&str, u64)] = &[
        ("llm.timeout_secs", config.llm.timeout_secs),
        ("llm.history_turns", config.llm.history_turns as u64),
        ("llm.profile_window", config.llm.profile_window as u64),
    ];
    for (name, val) in llm_fields {
        if *val == 0 {
            return Err(invalid(*name, "must be > 0"));
        }
    }

    if config.storage.primary == StoreBackend::Redis && config.storage.redis_url.is_none() {
        return Err(invalid(
            "storage.redis_url",
            "required when storage.primary = \"redis\"",
        ));
    }

    let dims = &config.personality.dimensions;
    if dims.is_empty() {
        return Err(invalid(
            "personality.dimensions",
            "at least one dimension is required",
        ));
    }

    let mut seen = HashSet::new();
    for dim in dims {
        if !seen.insert(dim.id.as_str()) {
            return Err(invalid(
                "personality.dimensions.id",
                format!("duplicate dimension id {:?}", dim.id),
            ));
        }
        if dim.weight <= 0.0 {
            return Err(invalid(
                format!("personality.{}.weight", dim.id),
                format!("must be > 0, got {}", dim.weight),
            ));
        }
        if dim.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(invalid(
                format!("personality.{}.keywords", dim.id),
                "must contain at least one non-empty keyword",
            ));
        }
    }

    let keywords = dims.iter().flat_map(|d| d.keywords.iter().map(String::as_str));
    if let Err(e) = keyword_matcher(keywords, MATCHER_SIZE_LIMIT) {
        return Err(invalid(
            "personality.dimensions.keywords",
            format!("keyword dictionary cannot be compiled: {e}"),
        ));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
