//! Broker-agnostic traits used by the rest of the engine.
//!
//! A concrete connector implements [`BrokerAdapter`]; the engine only ever
//! sees the normalized request surface and the typed [`AdapterEvent`] stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::{
    AccountInfo, Bar, ConnectionState, Fill, Instrument, Order, Portfolio, Symbol, Timeframe,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

mod connection;
mod connector;
mod runtime;

pub use connection::{BackoffVerdict, ConnectionSupervisor};
pub use connector::{
    get_connector_factory, register_connector_factory, registered_connectors, ConnectorFactory,
};
pub use runtime::{event_channel, spawn_adapter, AdapterHandle, AdapterRequest, RuntimeSettings};

/// Convenience alias for adapter results.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Normalized, closed error-code set every connector maps broker errors into.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AdapterErrorCode {
    Ok,
    Broker,
    Network,
    InvalidInstrument,
    InvalidTimeframe,
    NotConnected,
    Auth,
    General,
}

impl AdapterErrorCode {
    /// Transient failures the engine may retry.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Broker | Self::Network | Self::NotConnected)
    }

    /// Permanent per-instrument failures: the instrument stays disabled
    /// until reconfigured.
    #[must_use]
    pub fn is_permanent_for_instrument(self) -> bool {
        matches!(self, Self::InvalidInstrument | Self::InvalidTimeframe)
    }

    /// Fatal for the whole session, no retries.
    #[must_use]
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Auth)
    }
}

/// Common error type returned by adapter implementations.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct AdapterError {
    pub code: AdapterErrorCode,
    pub message: String,
}

impl AdapterError {
    #[must_use]
    pub fn new(code: AdapterErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorCode::Auth, message)
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorCode::Network, message)
    }
}

/// Everything the adapter learns during one-time initialization.
#[derive(Clone, Debug)]
pub struct AdapterInit {
    pub account: AccountInfo,
    pub portfolio: Portfolio,
    /// Timeframes the broker can serve as history downloads.
    pub history_timeframes: Vec<Timeframe>,
    /// Timeframes the broker can stream live.
    pub data_timeframes: Vec<Timeframe>,
}

/// Typed callback surface: connectors push these onto the bounded event
/// queue, the Trade Manager drains them once per loop iteration, in arrival
/// order.
#[derive(Clone, Debug)]
pub enum AdapterEvent {
    AccountInfo(AccountInfo),
    Portfolio(Portfolio),
    MarketDataSubscribed {
        instrument: Symbol,
        ok: bool,
        code: AdapterErrorCode,
    },
    MarketData {
        instrument: Symbol,
        bar: Bar,
    },
    OrderAccepted {
        order_id: Uuid,
        deal_reference: String,
    },
    OrderRejected {
        order_id: Uuid,
        code: AdapterErrorCode,
        reason: String,
    },
    OrderFilled {
        order_id: Uuid,
        fill: Fill,
    },
    OrderCancelled {
        order_id: Uuid,
    },
    OrderError {
        order_id: Uuid,
        code: AdapterErrorCode,
        reason: String,
    },
    /// `code` 1: the connect retry cap was exhausted. `code` 2: a
    /// previously-connected channel dropped; the adapter keeps retrying.
    AccountDisconnected {
        code: u8,
    },
    /// A lost channel came back.
    AccountReconnected,
}

/// Cloneable handle connectors use to emit events toward the engine.
#[derive(Clone)]
pub struct AdapterEventSender {
    tx: mpsc::Sender<AdapterEvent>,
}

impl AdapterEventSender {
    #[must_use]
    pub fn new(tx: mpsc::Sender<AdapterEvent>) -> Self {
        Self { tx }
    }

    /// Push an event, dropping it (with a log line) if the engine is gone.
    pub async fn emit(&self, event: AdapterEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::warn!("engine event queue closed, adapter event dropped");
        }
    }

    /// Non-async variant for synchronous connector internals.
    pub fn emit_blocking(&self, event: AdapterEvent) {
        if self.tx.blocking_send(event).is_err() {
            tracing::warn!("engine event queue closed, adapter event dropped");
        }
    }
}

/// Connection status of the adapter's two channels.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChannelsStatus {
    pub api: ConnectionState,
    pub feed: ConnectionState,
}

impl ChannelsStatus {
    /// Trading work requires the API channel; market data only the feed.
    #[must_use]
    pub fn api_usable(self) -> bool {
        self.api == ConnectionState::Connected
    }
}

/// Contract every concrete broker connector implements.
///
/// All `request_*` methods are non-blocking from the engine's point of view:
/// they enqueue work inside the connector and return promptly; outcomes
/// arrive later as [`AdapterEvent`] values. The adapter runs on its own task
/// (the adapter domain) and is the only place broker I/O may suspend.
#[async_trait]
pub trait BrokerAdapter: Send {
    /// Driver name used in logs and the connector registry.
    fn name(&self) -> &str;

    /// One-time initialization, performed before the adapter is driven.
    async fn init(&mut self) -> AdapterResult<AdapterInit>;

    /// Advance the connection state machine, drain network I/O, fire events.
    /// Called on every runtime iteration.
    async fn tick(&mut self, now: DateTime<Utc>) -> AdapterResult<()>;

    async fn request_account_info(&mut self) -> AdapterResult<()>;

    async fn request_portfolio(&mut self) -> AdapterResult<()>;

    /// Subscribe the instrument's market data at the given broker-native
    /// timeframe. Ack arrives as `MarketDataSubscribed`.
    async fn request_subscribe(
        &mut self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> AdapterResult<()>;

    async fn request_unsubscribe(&mut self, instrument: &str) -> AdapterResult<()>;

    async fn request_open(&mut self, order: &Order) -> AdapterResult<()>;

    async fn request_close(&mut self, order: &Order) -> AdapterResult<()>;

    async fn request_stop(&mut self, order: &Order) -> AdapterResult<()>;

    /// Best-effort cancel of a working order. Brokers without native cancel
    /// support may leave the default no-op; the tracker reconciles later.
    async fn request_cancel(&mut self, _order: &Order) -> AdapterResult<()> {
        Ok(())
    }

    /// Graceful close of both API and feed channels.
    async fn shutdown(&mut self) -> AdapterResult<()>;

    /// Current state of the API and feed channels.
    fn channels(&self) -> ChannelsStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_classification() {
        assert!(AdapterErrorCode::Network.is_retryable());
        assert!(AdapterErrorCode::Broker.is_retryable());
        assert!(AdapterErrorCode::NotConnected.is_retryable());
        assert!(!AdapterErrorCode::Auth.is_retryable());
        assert!(AdapterErrorCode::Auth.is_fatal());
        assert!(AdapterErrorCode::InvalidInstrument.is_permanent_for_instrument());
        assert!(AdapterErrorCode::InvalidTimeframe.is_permanent_for_instrument());
        assert!(!AdapterErrorCode::Ok.is_fatal());
    }
}
