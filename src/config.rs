use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful tutor that provides detailed step-by-step solutions to academic problems. \
Always break down complex problems into smaller, manageable steps. \
Explain each step clearly and concisely. \
If relevant, include mathematical formulas, scientific principles, or theoretical concepts. \
End with a brief summary of the solution.";

pub const DEFAULT_FALLBACK_MESSAGE: &str = "Sorry, I encountered an error. Please try again later.";

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[cfg(feature = "sentry")]
    pub sentry: Option<SentryConfig>,

    #[serde(default)]
    pub http: HTTPConfig,

    #[serde(default)]
    pub line: LineConfig,

    #[serde(default)]
    pub completion: CompletionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Never read from the TOML file, always filled from the environment.
    #[serde(skip)]
    pub credentials: Credentials,
}
impl AppConfig {
    /// Loads the TOML config and then the required credentials from the environment.
    /// An explicitly given config file must exist, the default one may be absent.
    pub fn load(config_filepath: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::from_file(config_filepath)?;
        config.credentials = Credentials::from_env()?;
        Ok(config)
    }

    fn from_file(config_filepath: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_filepath {
            Some(path) => path,
            None => {
                let path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if !path.exists() {
                    return Self::from_toml("");
                }
                path
            }
        };

        let config_content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {config_path:?}"))?;

        Self::from_toml(&config_content)
            .with_context(|| format!("Failed to parse TOML config file: {config_path:?}"))
    }

    fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.line.validate()?;
        config.completion.validate()?;
        config.logging.validate()?;
        Ok(config)
    }
}

/// Secrets that must be supplied at process start.
#[derive(Clone, Default)]
pub struct Credentials {
    pub channel_secret: String,
    pub channel_access_token: String,
    pub completion_api_key: String,

    /// Enables the `/sys` routes when present.
    pub admin_token: Option<String>,
}
impl Credentials {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            channel_secret: required_env("LINE_CHANNEL_SECRET")?,
            channel_access_token: required_env("LINE_CHANNEL_ACCESS_TOKEN")?,
            completion_api_key: required_env("OPENROUTER_API_KEY")?,
            admin_token: std::env::var("BOT_ADMIN_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        })
    }
}
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("channel_secret", &"<redacted>")
            .field("channel_access_token", &"<redacted>")
            .field("completion_api_key", &"<redacted>")
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn required_env(name: &'static str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        Ok(_) => bail!("Required {name} environment variable is empty!"),
        Err(_) => bail!("Missing required {name} environment variable!"),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HTTPConfig {
    #[serde(default = "default_http_address")]
    pub address: SocketAddr,

    #[serde(default = "default_callback_path")]
    pub callback_path: String,

    #[serde(default)]
    pub tls: Option<TLSConfig>,
}
impl Default for HTTPConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
            callback_path: default_callback_path(),
            tls: None,
        }
    }
}

#[cfg_attr(
    not(any(feature = "tls-rustls", feature = "tls-native")),
    allow(dead_code)
)]
#[derive(Debug, Clone, Deserialize)]
pub struct TLSConfig {
    #[serde(deserialize_with = "deserialize_existing_file")]
    pub certificate_path: PathBuf,

    #[serde(deserialize_with = "deserialize_existing_file")]
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_line_api_base")]
    pub api_base: String,

    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}
impl LineConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            bail!("line.api_base must not be empty");
        }
        if self.reply_timeout_secs == 0 {
            bail!("line.reply_timeout_secs must be at least 1");
        }
        Ok(())
    }
}
impl Default for LineConfig {
    fn default() -> Self {
        Self {
            api_base: default_line_api_base(),
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Per attempt, not for the whole retry sequence.
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, doubled for every attempt after that.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Sent with the reply token when the completion fails. Set to an empty
    /// string to send nothing.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
}
impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn fallback_message(&self) -> Option<&str> {
        let message = self.fallback_message.trim();
        (!message.is_empty()).then_some(message)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("completion.max_attempts must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            bail!(
                "completion.temperature must be within 0.0 and 2.0, got {}",
                self.temperature
            );
        }
        if self.timeout_secs == 0 {
            bail!("completion.timeout_secs must be at least 1");
        }
        Ok(())
    }
}
impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_completion_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            system_prompt: default_system_prompt(),
            timeout_secs: default_completion_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            fallback_message: default_fallback_message(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Writes daily rotated `info.*.log` and `error.*.log` files here when set.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Rotated files kept per log, older ones are removed.
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}
impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        if self.max_files == 0 {
            bail!("logging.max_files must be at least 1");
        }
        Ok(())
    }
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_files: default_max_log_files(),
        }
    }
}

#[cfg(feature = "sentry")]
#[derive(Debug, Deserialize)]
pub struct SentryConfig {
    pub dsn: String,

    #[serde(default)]
    pub environment: Option<String>,

    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub send_default_pii: bool,
}

fn default_http_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5000)
}
fn default_callback_path() -> String {
    "/callback".to_string()
}
fn default_line_api_base() -> String {
    "https://api.line.me".to_string()
}
fn default_reply_timeout_secs() -> u64 {
    10
}
fn default_completion_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_model() -> String {
    "openai/gpt-4".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_completion_timeout_secs() -> u64 {
    20
}
fn default_max_attempts() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_fallback_message() -> String {
    DEFAULT_FALLBACK_MESSAGE.to_string()
}
fn default_max_log_files() -> usize {
    5
}

fn deserialize_existing_file<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let path = PathBuf::deserialize(deserializer)?;
    if !path.exists() {
        return Err(serde::de::Error::custom(format!(
            "File does not exist: {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(serde::de::Error::custom(format!(
            "Path is not a file: {}",
            path.display()
        )));
    }
    Ok(path)
}
