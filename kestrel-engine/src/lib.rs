//! The Trade Manager runtime: one cooperative loop owning the day's session,
//! wired between the Market Data Router, the Strategy Framework, the Order
//! Tracker and the Broker Adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use uuid::Uuid;

use kestrel_config::StrategyConfig;
use kestrel_core::{
    AccountInfo, Alert, Instrument, Portfolio, Price, Quantity, Session, Side, Symbol, Timeframe,
};
use kestrel_strategy::{load_strategy, InstanceSpec, StrategyInstance};

mod manager;
mod translate;

pub use manager::{TradeManager, TradeManagerConfig};
pub use translate::{translate_decision, translate_follow_up};

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid strategy configuration '{name}': {reason}")]
    InvalidStrategyConfig { name: String, reason: String },
    #[error(transparent)]
    Store(#[from] kestrel_store::StoreError),
    #[error(transparent)]
    Strategy(#[from] kestrel_strategy::StrategyError),
    #[error(transparent)]
    MarketData(#[from] kestrel_marketdata::MarketDataError),
    #[error("engine command channel closed")]
    ChannelClosed,
}

/// Cooperative shutdown flag shared across the runtime.
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Variant that trips on ctrl-c.
    #[must_use]
    pub fn with_ctrl_c() -> Self {
        let signal = Self::new();
        let clone = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                clone.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            flag: self.flag.clone(),
            notify: self.notify.clone(),
        }
    }
}

/// One strategy's externally visible status.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrategyStatus {
    pub id: Uuid,
    pub name: String,
    pub instrument: Symbol,
    pub initialized: bool,
    pub errored: bool,
    pub completed: bool,
    pub blocked: bool,
    /// Wire encoding of the most recent action.
    pub last_action: u8,
}

/// One order's externally visible status.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderStatus {
    pub id: Uuid,
    pub instrument: Symbol,
    pub side: String,
    pub quantity: Quantity,
    /// Deal-status wire code.
    pub state: u8,
    pub deal_reference: Option<String>,
    pub error: Option<String>,
}

/// Engine status document served to clients.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineStatus {
    pub account: String,
    pub session: Option<Session>,
    pub api_connected: bool,
    pub feed_connected: bool,
    pub trading_enabled: bool,
    pub account_info: Option<AccountInfo>,
    pub portfolio: Portfolio,
    pub strategies: Vec<StrategyStatus>,
    pub open_orders: Vec<OrderStatus>,
}

/// Commands posted by the Client Channel, answered over oneshots.
#[derive(Debug)]
pub enum EngineCommand {
    Status {
        respond: oneshot::Sender<EngineStatus>,
    },
    OpenPosition {
        instrument: Symbol,
        side: Side,
        quantity: Quantity,
        stop_price: Option<Price>,
        respond: oneshot::Sender<Result<Uuid, String>>,
    },
    ClosePosition {
        instrument: Symbol,
        quantity: Option<Quantity>,
        respond: oneshot::Sender<Result<Uuid, String>>,
    },
    UpdateAccountConfig {
        trading_enable: Option<bool>,
        respond: oneshot::Sender<Result<(), String>>,
    },
    ValidateSignal {
        strategy: String,
        instrument: Symbol,
        timeframe: Timeframe,
        params: toml::Value,
        respond: oneshot::Sender<Result<bool, String>>,
    },
    StrategyMetadata {
        respond: oneshot::Sender<Vec<StrategyStatus>>,
    },
    AccountActivity {
        respond: oneshot::Sender<Vec<OrderStatus>>,
    },
}

/// Cloneable handle the gateway uses to reach the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    alerts: broadcast::Sender<Alert>,
}

impl EngineHandle {
    #[must_use]
    pub fn new(commands: mpsc::Sender<EngineCommand>, alerts: broadcast::Sender<Alert>) -> Self {
        Self { commands, alerts }
    }

    pub async fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }

    /// Subscribe to the push alert stream.
    #[must_use]
    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Status { respond: tx }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// The trading-hours window in local wall-clock time.
#[derive(Clone, Copy, Debug)]
pub struct TradingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradingWindow {
    #[must_use]
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Overnight window (e.g. 22:00 -> 06:00).
            time >= self.start || time < self.end
        }
    }
}

/// Build the day's strategy instances from configuration, enforcing the
/// validate-time timeframe rules.
pub fn build_instances(configs: &[StrategyConfig]) -> EngineResult<Vec<StrategyInstance>> {
    let mut instances = Vec::with_capacity(configs.len());
    for config in configs {
        let timeframe: Timeframe =
            config
                .timeframe
                .parse()
                .map_err(|err| EngineError::InvalidStrategyConfig {
                    name: config.name.clone(),
                    reason: err,
                })?;
        let data_timeframe: Timeframe =
            config
                .data_timeframe
                .parse()
                .map_err(|err| EngineError::InvalidStrategyConfig {
                    name: config.name.clone(),
                    reason: err,
                })?;
        if !timeframe.is_multiple_of(data_timeframe) {
            return Err(EngineError::InvalidStrategyConfig {
                name: config.name.clone(),
                reason: format!(
                    "timeframe {timeframe} is not a multiple of data timeframe {data_timeframe}"
                ),
            });
        }
        let strategy = load_strategy(&config.name, config.params.clone())?;
        let broker_symbol = if config.broker_symbol.is_empty() {
            config.instrument.clone()
        } else {
            config.broker_symbol.clone()
        };
        instances.push(StrategyInstance::new(
            InstanceSpec {
                name: config.name.clone(),
                instrument: Instrument {
                    symbol: config.instrument.clone(),
                    broker_symbol,
                    description: String::new(),
                    currency: String::new(),
                    timeframe,
                },
                data_timeframe,
                evaluate_in_progress: config.evaluate_in_progress,
                params: config.params.clone(),
            },
            strategy,
        ));
    }
    Ok(instances)
}
