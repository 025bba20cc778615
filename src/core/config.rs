use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Settings {
    server: ServerSettings,
    providers: ProviderSettings,
    ocr: OcrSettings,
    archive: ArchiveSettings,
    store: StoreSettings,
    telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    host: ServerHost,
    port: ServerPort,
}

/// Key and base URL for one LLM endpoint. An empty key is not a load-time
/// error; the call site fails fast with a missing-key error instead.
#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoint {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub openai: ProviderEndpoint,
    pub deepseek: ProviderEndpoint,
    pub gemini: ProviderEndpoint,
    pub openrouter: ProviderEndpoint,
    /// App-identifying strings sent on OpenRouter requests.
    pub app_url: String,
    pub app_title: String,
    pub request_timeout: Duration,
}

/// OCR vendor access plus the polling tunables. The backoff ceilings and
/// attempt caps mirror the vendor's observed behavior and are deliberately
/// configuration, not hard constants.
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub api_key: String,
    pub base_url: String,
    pub base_poll_delay: Duration,
    pub poll_ceiling: Duration,
    pub rate_limited_poll_ceiling: Duration,
    pub rate_limit_backoff_ceiling: Duration,
    pub max_poll_attempts: u32,
    pub wall_clock_cap: Duration,
    pub request_timeout: Duration,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://www.handwritingocr.com/api/v3".to_string(),
            base_poll_delay: Duration::from_secs(2),
            poll_ceiling: Duration::from_secs(20),
            rate_limited_poll_ceiling: Duration::from_secs(30),
            rate_limit_backoff_ceiling: Duration::from_secs(45),
            max_poll_attempts: 120,
            wall_clock_cap: Duration::from_secs(240),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    /// Where transcript markdown copies are written.
    pub directory: PathBuf,
    /// Optional local save server; `None` disables the side channel.
    pub save_endpoint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub snapshot_path: PathBuf,
    pub save_debounce: Duration,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
}

#[derive(Debug, Clone)]
struct ServerHost(String);

#[derive(Debug, Clone, Copy)]
struct ServerPort(u16);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server host: {0}")]
    InvalidHost(String),
    #[error("invalid server port: {0}")]
    InvalidPort(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("REDINK_HOST", "127.0.0.1");
        let port = env_or_default("REDINK_PORT", "3901");

        let openai = ProviderEndpoint {
            api_key: env_or_default("OPENAI_API_KEY", ""),
            base_url: trimmed_url(env_or_default("OPENAI_BASE_URL", "https://api.openai.com/v1")),
            default_model: env_or_default("OPENAI_MODEL", "gpt-4o-mini"),
        };
        let deepseek = ProviderEndpoint {
            api_key: env_or_default("DEEPSEEK_API_KEY", ""),
            base_url: trimmed_url(env_or_default(
                "DEEPSEEK_BASE_URL",
                "https://api.deepseek.com/v1",
            )),
            default_model: env_or_default("DEEPSEEK_MODEL", "deepseek-chat"),
        };
        let gemini = ProviderEndpoint {
            api_key: env_or_default("GEMINI_API_KEY", ""),
            base_url: trimmed_url(env_or_default(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )),
            default_model: env_or_default("GEMINI_MODEL", "gemini-2.0-flash"),
        };
        let openrouter = ProviderEndpoint {
            api_key: env_or_default("OPENROUTER_API_KEY", ""),
            base_url: trimmed_url(env_or_default(
                "OPENROUTER_BASE_URL",
                "https://openrouter.ai/api/v1",
            )),
            default_model: env_or_default("OPENROUTER_MODEL", "openai/gpt-4o-mini"),
        };
        let app_url = env_or_default("REDINK_APP_URL", "https://github.com/redink/redink");
        let app_title = env_or_default("REDINK_APP_TITLE", "Redink Essay Grader");
        let provider_request_timeout = parse_u64(
            "PROVIDER_REQUEST_TIMEOUT",
            env_or_default("PROVIDER_REQUEST_TIMEOUT", "180"),
        )?;

        let ocr_defaults = OcrSettings::default();
        let ocr = OcrSettings {
            api_key: env_or_default("OCR_API_KEY", ""),
            base_url: trimmed_url(env_optional("OCR_BASE_URL").unwrap_or(ocr_defaults.base_url)),
            base_poll_delay: Duration::from_millis(parse_u64(
                "OCR_POLL_DELAY_MS",
                env_or_default("OCR_POLL_DELAY_MS", "2000"),
            )?),
            poll_ceiling: Duration::from_millis(parse_u64(
                "OCR_POLL_CEILING_MS",
                env_or_default("OCR_POLL_CEILING_MS", "20000"),
            )?),
            rate_limited_poll_ceiling: Duration::from_millis(parse_u64(
                "OCR_RATE_LIMITED_POLL_CEILING_MS",
                env_or_default("OCR_RATE_LIMITED_POLL_CEILING_MS", "30000"),
            )?),
            rate_limit_backoff_ceiling: Duration::from_millis(parse_u64(
                "OCR_RATE_LIMIT_BACKOFF_CEILING_MS",
                env_or_default("OCR_RATE_LIMIT_BACKOFF_CEILING_MS", "45000"),
            )?),
            max_poll_attempts: parse_u32(
                "OCR_MAX_POLL_ATTEMPTS",
                env_or_default("OCR_MAX_POLL_ATTEMPTS", "120"),
            )?,
            wall_clock_cap: Duration::from_secs(parse_u64(
                "OCR_WALL_CLOCK_CAP_SECONDS",
                env_or_default("OCR_WALL_CLOCK_CAP_SECONDS", "240"),
            )?),
            request_timeout: Duration::from_secs(parse_u64(
                "OCR_REQUEST_TIMEOUT",
                env_or_default("OCR_REQUEST_TIMEOUT", "60"),
            )?),
        };

        let archive = ArchiveSettings {
            directory: PathBuf::from(env_or_default("REDINK_ARCHIVE_DIR", "ocr-archive")),
            save_endpoint: env_optional("REDINK_SAVE_ENDPOINT"),
        };

        let store = StoreSettings {
            snapshot_path: PathBuf::from(env_or_default(
                "REDINK_SNAPSHOT_PATH",
                "redink-essays.json",
            )),
            save_debounce: Duration::from_millis(parse_u64(
                "REDINK_SAVE_DEBOUNCE_MS",
                env_or_default("REDINK_SAVE_DEBOUNCE_MS", "600"),
            )?),
        };

        let log_level = env_or_default("REDINK_LOG_LEVEL", "info");
        let json = env_optional("REDINK_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);

        Ok(Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            providers: ProviderSettings {
                openai,
                deepseek,
                gemini,
                openrouter,
                app_url,
                app_title,
                request_timeout: Duration::from_secs(provider_request_timeout),
            },
            ocr,
            archive,
            store,
            telemetry: TelemetrySettings { log_level, json },
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub fn providers(&self) -> &ProviderSettings {
        &self.providers
    }

    pub fn ocr(&self) -> &OcrSettings {
        &self.ocr
    }

    pub fn archive(&self) -> &ArchiveSettings {
        &self.archive
    }

    pub fn store(&self) -> &StoreSettings {
        &self.store
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }
}

impl ServerHost {
    fn parse(value: String) -> Result<Self, ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidHost(value));
        }
        Ok(Self(value))
    }
}

impl ServerPort {
    fn parse(value: String) -> Result<Self, ConfigError> {
        let parsed: u16 = value.parse().map_err(|_| ConfigError::InvalidPort(value.clone()))?;
        if parsed == 0 {
            return Err(ConfigError::InvalidPort(value));
        }
        Ok(Self(parsed))
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn env_or_default(key: &str, default: &str) -> String {
    env_optional(key).unwrap_or_else(|| default.to_string())
}

fn parse_u32(field: &'static str, value: String) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_u64(field: &'static str, value: String) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidValue { field, value })
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON")
}

fn trimmed_url(value: String) -> String {
    value.trim_end_matches('/').to_string()
}
