//! Layered configuration loading utilities.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveTime;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

mod deserializer;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            log: LogConfig::default(),
            trading: TradingConfig::default(),
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            engine: EngineConfig::default(),
            strategies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also log the request/response documents handled by the gateway.
    #[serde(default)]
    pub query: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub shipper: ShipperConfig,
}

/// Forwarding settings for the structured-log collector.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShipperConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_shipper_host")]
    pub host: String,
    #[serde(default = "default_shipper_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_trading_enable")]
    pub enable: bool,
    #[serde(default = "default_trading_start", with = "deserializer::hhmm")]
    pub start: NaiveTime,
    #[serde(default = "default_trading_end", with = "deserializer::hhmm")]
    pub end: NaiveTime,
    #[serde(default = "default_daily_clean_time", with = "deserializer::hhmm")]
    pub daily_clean_time: NaiveTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_driver")]
    pub driver: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_ssl_verify")]
    pub ssl_verify: bool,
    #[serde(default = "default_retry_cap")]
    pub connect_retry_cap: u32,
    #[serde(default = "default_submit_timeout_secs")]
    pub order_submit_timeout_secs: u64,
    #[serde(default = "default_submit_retry_delay_secs")]
    pub order_submit_retry_delay_secs: u64,
    /// Driver-specific settings forwarded to the connector factory untouched.
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_addr")]
    pub listen_addr: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tracker_timeout_secs")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_portfolio_refresh_secs")]
    pub portfolio_refresh_secs: u64,
    #[serde(default = "default_account_refresh_secs")]
    pub account_refresh_secs: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_staleness_floor_secs")]
    pub staleness_floor_secs: u64,
}

/// One strategy instance bound to an instrument for the trading day.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub instrument: String,
    #[serde(default)]
    pub broker_symbol: String,
    /// Strategy-native timeframe, e.g. "5m".
    pub timeframe: String,
    /// Broker-native data timeframe, e.g. "1m".
    #[serde(default = "default_data_timeframe")]
    pub data_timeframe: String,
    /// Evaluate in-progress bars too, not only completed windows.
    #[serde(default)]
    pub evaluate_in_progress: bool,
    #[serde(default = "default_params")]
    pub params: toml::Value,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            query: false,
            dir: default_log_dir(),
            shipper: ShipperConfig::default(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            enable: default_trading_enable(),
            start: default_trading_start(),
            end: default_trading_end(),
            daily_clean_time: default_daily_clean_time(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            driver: default_broker_driver(),
            base_url: String::new(),
            ssl_verify: default_ssl_verify(),
            connect_retry_cap: default_retry_cap(),
            order_submit_timeout_secs: default_submit_timeout_secs(),
            order_submit_retry_delay_secs: default_submit_retry_delay_secs(),
            params: serde_json::Value::Null,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_gateway_addr(),
            max_clients: default_max_clients(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_tracker_timeout_secs(),
            portfolio_refresh_secs: default_portfolio_refresh_secs(),
            account_refresh_secs: default_account_refresh_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            action_timeout_secs: default_action_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            staleness_floor_secs: default_staleness_floor_secs(),
        }
    }
}

fn default_account_id() -> String {
    "UNSET".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_shipper_host() -> String {
    "127.0.0.1".to_string()
}

fn default_shipper_port() -> u16 {
    24224
}

fn default_trading_enable() -> bool {
    true
}

fn default_trading_start() -> NaiveTime {
    NaiveTime::from_hms_opt(8, 0, 0).expect("valid constant")
}

fn default_trading_end() -> NaiveTime {
    NaiveTime::from_hms_opt(22, 0, 0).expect("valid constant")
}

fn default_daily_clean_time() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 45, 0).expect("valid constant")
}

fn default_broker_driver() -> String {
    "paper".to_string()
}

fn default_ssl_verify() -> bool {
    true
}

fn default_retry_cap() -> u32 {
    10
}

fn default_submit_timeout_secs() -> u64 {
    120
}

fn default_submit_retry_delay_secs() -> u64 {
    30
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/kestrel.db")
}

fn default_gateway_addr() -> String {
    "0.0.0.0:2260".to_string()
}

fn default_max_clients() -> usize {
    10
}

fn default_tracker_timeout_secs() -> u64 {
    30
}

fn default_portfolio_refresh_secs() -> u64 {
    30
}

fn default_account_refresh_secs() -> u64 {
    300
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

fn default_action_timeout_secs() -> u64 {
    600
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_staleness_floor_secs() -> u64 {
    60
}

fn default_data_timeframe() -> String {
    "1m".to_string()
}

fn default_params() -> toml::Value {
    toml::Value::Table(toml::value::Table::new())
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml` (optional; pure-env deployments are supported)
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `KESTREL__`
/// 5. Flat legacy environment names (`LOG_LEVEL`, `ACCOUNT_ID`, ...)
pub fn load_config(env_name: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env_name {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("KESTREL")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    let mut app: AppConfig = config
        .try_deserialize()
        .map_err(|err: ConfigError| anyhow::Error::from(err))?;
    apply_legacy_env(&mut app)?;
    Ok(app)
}

/// Overrides from the flat environment names the deployment tooling exports.
fn apply_legacy_env(cfg: &mut AppConfig) -> Result<()> {
    if let Ok(level) = env::var("LOG_LEVEL") {
        cfg.log.level = level;
    }
    if let Ok(query) = env::var("LOG_QUERY") {
        cfg.log.query = parse_bool(&query);
    }
    if let Ok(enable) = env::var("TRADING_ENABLE") {
        cfg.trading.enable = parse_bool(&enable);
    }
    if let Ok(clean) = env::var("DAILY_CLEAN_TIME") {
        cfg.trading.daily_clean_time = NaiveTime::parse_from_str(&clean, "%H:%M")
            .map_err(|err| anyhow::anyhow!("invalid DAILY_CLEAN_TIME '{clean}': {err}"))?;
    }
    if let Ok(enable) = env::var("FLUENTD_ENABLE") {
        cfg.log.shipper.enable = parse_bool(&enable);
    }
    if let Ok(host) = env::var("FLUENTD_HOST") {
        cfg.log.shipper.host = host;
    }
    if let Ok(port) = env::var("FLUENTD_PORT") {
        cfg.log.shipper.port = port
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid FLUENTD_PORT '{port}': {err}"))?;
    }
    if let Ok(level) = env::var("FLUENTD_LEVEL") {
        cfg.log.shipper.level = level;
    }
    if let Ok(url) = env::var("WS_BASEURL") {
        cfg.broker.base_url = url;
    }
    if let Ok(verify) = env::var("WS_SSL_VERIFY") {
        cfg.broker.ssl_verify = parse_bool(&verify);
    }
    if let Ok(name) = env::var("DB_NAME") {
        cfg.store.path = PathBuf::from(name);
    }
    if let Ok(account) = env::var("ACCOUNT_ID") {
        cfg.account_id = account;
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.gateway.listen_addr, "0.0.0.0:2260");
        assert_eq!(cfg.gateway.max_clients, 10);
        assert_eq!(cfg.engine.order_timeout_secs, 30);
        assert_eq!(
            cfg.trading.daily_clean_time,
            NaiveTime::from_hms_opt(23, 45, 0).unwrap()
        );
        assert_eq!(cfg.broker.connect_retry_cap, 10);
    }

    #[test]
    fn legacy_env_overrides_apply() {
        let mut cfg = AppConfig::default();
        env::set_var("DAILY_CLEAN_TIME", "22:30");
        env::set_var("ACCOUNT_ID", "ACC-77");
        env::set_var("TRADING_ENABLE", "0");
        apply_legacy_env(&mut cfg).unwrap();
        env::remove_var("DAILY_CLEAN_TIME");
        env::remove_var("ACCOUNT_ID");
        env::remove_var("TRADING_ENABLE");

        assert_eq!(
            cfg.trading.daily_clean_time,
            NaiveTime::from_hms_opt(22, 30, 0).unwrap()
        );
        assert_eq!(cfg.account_id, "ACC-77");
        assert!(!cfg.trading.enable);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("1"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("off"));
    }
}
