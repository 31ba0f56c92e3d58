use anyhow::{bail, Context, Result};
use ::config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/rsibot.toml";
const ENV_PREFIX: &str = "RSIBOT";

/// Process-wide configuration, built once at startup and handed to each
/// component's constructor.
///
/// Sources, lowest priority first:
/// 1. serde defaults below
/// 2. TOML file (`config/rsibot.toml` or `--config`)
/// 3. `RSIBOT__*` environment variables (`RSIBOT__BROKER__TOKEN`, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Instrument identifier understood by the broker (FIGI)
    pub instrument_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
    pub broker: BrokerConfig,
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_interval_secs: u64,
    /// Shorter sleep used after a transient failure
    pub retry_interval_secs: u64,
    pub rsi_window: usize,
    /// How far back to request closes each tick
    pub lookback_minutes: u64,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    pub confirm_timeout_secs: u64,
    pub quantity_timeout_secs: u64,
    /// Upper bound on the quantity buttons offered in one prompt
    pub max_quantity_options: u64,
    /// Post the indicator value to the chat on every evaluated tick
    pub announce_rsi: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            retry_interval_secs: 30,
            rsi_window: 14,
            lookback_minutes: 320, // (14 + 50) five-minute candles
            buy_threshold: 45.0,
            sell_threshold: 60.0,
            confirm_timeout_secs: 30,
            quantity_timeout_secs: 45,
            max_quantity_options: 50,
            announce_rsi: false,
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn quantity_timeout(&self) -> Duration {
        Duration::from_secs(self.quantity_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub base_url: String,
    pub token: String,
    pub account_id: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Candle width used for the close series: 1, 5, 15 or 60
    #[serde(default = "default_candle_minutes")]
    pub candle_minutes: u32,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub market_hours: MarketHoursConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketHoursConfig {
    /// Exchange local time offset from UTC
    pub utc_offset_hours: i32,
    pub open: String,
    pub close: String,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        // Moscow Exchange main session
        Self {
            utc_offset_hours: 3,
            open: "10:00".to_string(),
            close: "18:45".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_telegram_url")]
    pub api_url: String,
    pub token: String,
    /// The only chat allowed to drive the bot; also the confirmation session
    pub chat_id: i64,
    #[serde(default = "default_long_poll_secs")]
    pub long_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    File { path: PathBuf },
    Redis { url: String, key_prefix: String },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File {
            path: PathBuf::from("position.json"),
        }
    }
}

fn default_broker_url() -> String {
    "https://invest-public-api.tinkoff.ru/rest".to_string()
}

fn default_requests_per_minute() -> u32 {
    100
}

fn default_candle_minutes() -> u32 {
    5
}

fn default_currency() -> String {
    "rub".to_string()
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_long_poll_secs() -> u64 {
    25
}

impl BotConfig {
    /// Load configuration from `.env`, the TOML file and the environment.
    ///
    /// An explicitly given file must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let builder = Config::builder()
            .add_source(File::from(path.as_path()).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        Self::build(builder)
            .with_context(|| format!("Failed to load configuration ({})", path.display()))
    }

    /// Parse configuration from a TOML document only
    pub fn from_toml(source: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(source, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let config: BotConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instrument_id.trim().is_empty() {
            bail!("instrument_id must not be empty");
        }
        if self.broker.token.trim().is_empty() || self.broker.account_id.trim().is_empty() {
            bail!("broker.token and broker.account_id are required");
        }
        if self.telegram.token.trim().is_empty() {
            bail!("telegram.token is required");
        }

        let engine = &self.engine;
        if engine.rsi_window == 0 {
            bail!("engine.rsi_window must be positive");
        }
        if engine.poll_interval_secs == 0 || engine.retry_interval_secs == 0 {
            bail!("engine intervals must be positive");
        }
        if !(0.0..=100.0).contains(&engine.buy_threshold)
            || !(0.0..=100.0).contains(&engine.sell_threshold)
        {
            bail!("engine thresholds must lie within [0, 100]");
        }
        if engine.buy_threshold >= engine.sell_threshold {
            bail!(
                "engine.buy_threshold ({}) must be below engine.sell_threshold ({})",
                engine.buy_threshold,
                engine.sell_threshold
            );
        }
        if engine.max_quantity_options == 0 {
            bail!("engine.max_quantity_options must be positive");
        }

        if ![1, 5, 15, 60].contains(&self.broker.candle_minutes) {
            bail!(
                "broker.candle_minutes must be one of 1, 5, 15, 60 (got {})",
                self.broker.candle_minutes
            );
        }
        if self.broker.requests_per_minute == 0 {
            bail!("broker.requests_per_minute must be positive");
        }

        if let StorageConfig::Redis { url, key_prefix } = &self.storage {
            if url.is_empty() || key_prefix.is_empty() {
                bail!("storage.url and storage.key_prefix are required for redis");
            }
        }

        Ok(())
    }
}
