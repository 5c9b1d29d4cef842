//! Hub configuration loaded from file and environment.
//!
//! Precedence: env `COUNSEL_HUB_CONFIG` path > `config/hub.toml` > defaults, then
//! `COUNSEL_HUB__SECTION__KEY` environment overrides (e.g. `COUNSEL_HUB__GEMINI__API_KEY`).
//!
//! | Section | Key | Default |
//! |---------|-----|---------|
//! | server | bind | 127.0.0.1:8000 |
//! | gemini | api_key, model, base_url | none, gemini-1.5-flash, generativelanguage.googleapis.com |
//! | hub | backend, spreadsheet_title, worksheet | sheets, School_Counseling_Hub, Records |
//! | hub | service_account_path, sled_path | none, ./data/counsel_hub |
//! | gate | password | none (gate open) |
//! | smtp | host, port, username, password, from, to | none, 587 |
//! | alerts | require_confirmation | true |

use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_SPREADSHEET_TITLE: &str = "School_Counseling_Hub";
pub const DEFAULT_WORKSHEET: &str = "Records";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub hub: StoreConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl GeminiConfig {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL)
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_GEMINI_BASE_URL)
    }

    /// Trimmed key, `None` when unset or blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Google Sheets (the shared Hub).
    Sheets,
    /// Local sled database; offline and dev use.
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub spreadsheet_title: String,
    pub worksheet: String,
    #[serde(default)]
    pub service_account_path: Option<String>,
    pub sled_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sheets,
            spreadsheet_title: DEFAULT_SPREADSHEET_TITLE.to_string(),
            worksheet: DEFAULT_WORKSHEET.to_string(),
            service_account_path: None,
            sled_path: "./data/counsel_hub".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Shared staff password. Unset means the gate is open.
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Alert recipients (counseling lead, school social worker, ...).
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gemini: GeminiConfig::default(),
            hub: StoreConfig::default(),
            gate: GateConfig::default(),
            smtp: None,
            alerts: AlertConfig::default(),
        }
    }
}

impl HubConfig {
    /// Load from `COUNSEL_HUB_CONFIG` (or `config/hub.toml`) and `COUNSEL_HUB__*` env vars.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("COUNSEL_HUB_CONFIG").unwrap_or_else(|_| "config/hub.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("server.bind", "127.0.0.1:8000")?
            .set_default("hub.backend", "sheets")?
            .set_default("hub.spreadsheet_title", DEFAULT_SPREADSHEET_TITLE)?
            .set_default("hub.worksheet", DEFAULT_WORKSHEET)?
            .set_default("hub.sled_path", "./data/counsel_hub")?
            .set_default("alerts.require_confirmation", true)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("COUNSEL_HUB")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("smtp.to")
                    .try_parsing(true),
            )
            .build()?;

        built.try_deserialize()
    }

    /// Secret-bearing sections that are present, for diagnostics. Values are never listed.
    pub fn configured_sections(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.gemini.api_key().is_some() {
            out.push("gemini");
        }
        if self.hub.service_account_path.is_some() {
            out.push("gcp_service_account");
        }
        if self.gate.password.as_deref().is_some_and(|p| !p.is_empty()) {
            out.push("gate");
        }
        if self.smtp.is_some() {
            out.push("smtp");
        }
        out
    }
}
