use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::state::Mode;

/// Environment variables consulted on top of the config file.
pub const ENV_PROVIDER: &str = "COMPANION_PROVIDER";
pub const ENV_MODEL: &str = "COMPANION_MODEL";
pub const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_ENDPOINT: &str = "OPENAI_BASE_URL";
pub const ENV_GEMINI_KEY: &str = "GEMINI_API_KEY";

/// Which backend serves analysis requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(alias = "open_ai")]
    OpenAi,
    Gemini,
    Local,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Gemini, Self::Local];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" | "open_ai" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "local" | "ollama" => Some(Self::Local),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Gemini => write!(f, "gemini"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Clone)]
pub struct ApiConfig {
    /// Default provider. If omitted, the first provider with a usable key wins.
    pub provider: Option<ProviderKind>,
    /// Default model for the default provider.
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub local: LocalModelConfig,
}

#[derive(Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_openai_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

#[derive(Deserialize, Clone)]
pub struct GeminiConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default = "default_gemini_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

#[derive(Deserialize, Clone)]
pub struct LocalModelConfig {
    #[serde(default = "default_local_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_local_model")]
    pub model: String,
}

#[derive(Deserialize, Clone)]
pub struct CaptureConfig {
    /// Number of rotating screenshot slots.
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Pause after hiding the overlay so it is not part of the capture.
    #[serde(default = "default_hide_delay_ms")]
    pub hide_delay_ms: u64,
    /// Override screenshot directory. Default: "<tmp>/companion/screenshots".
    pub directory: Option<String>,
    /// Capture command; `{path}` is replaced with the output file.
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub mode: Mode,
    pub code_prompt: Option<String>,
    pub general_prompt: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Override log directory. Default: "logs/" next to the executable.
    pub directory: Option<String>,
}

fn default_max_tokens() -> u32 { 4000 }
fn default_temperature() -> f32 { 0.2 }
fn default_timeout_secs() -> u64 { 60 }
fn default_openai_endpoint() -> String { "https://api.openai.com/v1/chat/completions".into() }
fn default_openai_model() -> String { "gpt-4o".into() }
fn default_gemini_endpoint() -> String { "https://generativelanguage.googleapis.com/v1beta".into() }
fn default_gemini_model() -> String { "gemini-2.5-flash".into() }
fn default_local_endpoint() -> String { "http://localhost:11434/v1/chat/completions".into() }
fn default_local_model() -> String { "minicpm-v".into() }
fn default_slots() -> usize { crate::slots::DEFAULT_MAX_SLOTS }
fn default_max_width() -> u32 { 1920 }
fn default_debounce_ms() -> u64 { 500 }
fn default_hide_delay_ms() -> u64 { 250 }
fn default_logging_enabled() -> bool { true }

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
            local: LocalModelConfig::default(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            endpoint: default_openai_endpoint(),
            model: default_openai_model(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            endpoint: default_gemini_endpoint(),
            model: default_gemini_model(),
        }
    }
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_local_endpoint(),
            model: default_local_model(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            max_width: default_max_width(),
            debounce_ms: default_debounce_ms(),
            hide_delay_ms: default_hide_delay_ms(),
            directory: None,
            command: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            code_prompt: None,
            general_prompt: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            directory: None,
        }
    }
}

pub(crate) fn exe_directory() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(|p| p.to_path_buf())
}

impl Config {
    /// Load `companion.toml` from `path`, or from next to the executable.
    /// Missing or malformed files fall back to defaults. Environment
    /// overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Config {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match exe_directory() {
                Some(dir) => dir.join("companion.toml"),
                None => {
                    eprintln!("[companion] Could not determine executable directory, using defaults");
                    let mut config = Config::default();
                    config.apply_env();
                    return config;
                }
            },
        };

        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => Config::parse(&contents).unwrap_or_else(|e| {
                eprintln!("[companion] Failed to parse {}: {e}", config_path.display());
                Config::default()
            }),
            Err(_) => {
                eprintln!(
                    "[companion] {} not found, using defaults",
                    config_path.display()
                );
                Config::default()
            }
        };
        config.apply_env();
        config
    }

    pub fn parse(contents: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Environment values win over the config file.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(provider) = non_empty(ENV_PROVIDER) {
            match ProviderKind::parse(&provider) {
                Some(kind) => self.api.provider = Some(kind),
                None => eprintln!("[companion] Unknown provider in {ENV_PROVIDER}: {provider}"),
            }
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.api.model = Some(model);
        }
        if let Some(key) = non_empty(ENV_OPENAI_KEY) {
            self.api.openai.key = key;
        }
        if let Some(endpoint) = non_empty(ENV_OPENAI_ENDPOINT) {
            self.api.openai.endpoint = endpoint;
        }
        if let Some(key) = non_empty(ENV_GEMINI_KEY) {
            self.api.gemini.key = key;
        }
    }

    pub fn screenshot_directory(&self) -> PathBuf {
        match self.capture.directory {
            Some(ref dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join("companion").join("screenshots"),
        }
    }

    pub fn log_directory(&self) -> Option<PathBuf> {
        if let Some(ref custom) = self.logging.directory {
            return Some(PathBuf::from(custom));
        }
        exe_directory().map(|d| d.join("logs"))
    }
}

/// Load the first dotfile found in: `explicit`, `./.env`, `<exe dir>/.env`,
/// `~/.companion/.env`. Variables already set in the environment are kept.
pub fn load_dotenv(explicit: Option<&Path>) -> Option<PathBuf> {
    let candidates = dotenv_candidates(explicit);
    let found = candidates.into_iter().find(|p| p.is_file())?;
    match dotenvy::from_path(&found) {
        Ok(()) => Some(found),
        Err(e) => {
            eprintln!("[companion] Failed to load {}: {e}", found.display());
            None
        }
    }
}

fn dotenv_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(p) = explicit {
        candidates.push(p.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(".env"));
    }
    if let Some(dir) = exe_directory() {
        candidates.push(dir.join(".env"));
    }
    if let Some(home) = home::home_dir() {
        candidates.push(home.join(".companion").join(".env"));
    }
    candidates
}
