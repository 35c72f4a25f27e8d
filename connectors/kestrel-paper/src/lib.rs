//! In-memory broker connector: immediate fills at the last known price,
//! scriptable market data and failure injection for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_adapter::{
    register_connector_factory, AdapterError, AdapterErrorCode, AdapterEvent, AdapterEventSender,
    AdapterInit, AdapterResult, BrokerAdapter, ChannelsStatus, ConnectionSupervisor,
    ConnectorFactory,
};
use kestrel_core::{
    AccountInfo, Bar, ConnectionState, Fill, Instrument, Order, Portfolio, PositionSnapshot,
    Price, Side, Symbol, Timeframe,
};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

/// Driver-specific configuration accepted by the factory.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub account_id: String,
    pub account_name: String,
    pub currency: String,
    pub cash: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            account_id: "PAPER-1".into(),
            account_name: "Paper account".into(),
            currency: "EUR".into(),
            cash: Decimal::from(100_000),
        }
    }
}

#[derive(Default)]
struct PaperState {
    subscriptions: HashMap<Symbol, Timeframe>,
    /// Total subscribe calls that created a broker-side subscription.
    subscription_count: usize,
    last_prices: HashMap<Symbol, Price>,
    positions: HashMap<Symbol, PositionSnapshot>,
    pending_bars: VecDeque<(Symbol, Bar)>,
    /// Failure injection knobs.
    fail_auth: bool,
    reject_next_order: Option<String>,
    feed_down: bool,
    suppress_portfolio: bool,
    injected_events: VecDeque<AdapterEvent>,
    orders_seen: Vec<Order>,
    deal_counter: u64,
}

/// Test-side handle sharing state with a running [`PaperAdapter`].
#[derive(Clone, Default)]
pub struct PaperHandle {
    state: Arc<Mutex<PaperState>>,
}

impl PaperHandle {
    /// Queue a bar for delivery on the next adapter tick.
    pub fn push_bar(&self, instrument: impl Into<Symbol>, bar: Bar) {
        let mut state = self.state.lock().unwrap();
        let instrument = instrument.into();
        state.last_prices.insert(instrument.clone(), bar.close);
        state.pending_bars.push_back((instrument, bar));
    }

    /// Make `init` fail with an authentication error.
    pub fn fail_auth(&self) {
        self.state.lock().unwrap().fail_auth = true;
    }

    /// Reject the next order request with the given reason.
    pub fn reject_next_order(&self, reason: impl Into<String>) {
        self.state.lock().unwrap().reject_next_order = Some(reason.into());
    }

    /// Simulate a market-feed outage; queued bars stop flowing.
    pub fn set_feed_down(&self, down: bool) {
        self.state.lock().unwrap().feed_down = down;
    }

    pub fn set_price(&self, instrument: impl Into<Symbol>, price: Price) {
        self.state
            .lock()
            .unwrap()
            .last_prices
            .insert(instrument.into(), price);
    }

    /// Number of broker-side subscriptions ever created.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().unwrap().subscription_count
    }

    /// Queue a raw adapter event for delivery on the next tick; used to
    /// script broker-side behavior the normal flow cannot produce.
    pub fn inject_event(&self, event: AdapterEvent) {
        self.state.lock().unwrap().injected_events.push_back(event);
    }

    /// Swallow portfolio requests so reconciliation can be sequenced.
    pub fn suppress_portfolio(&self, suppress: bool) {
        self.state.lock().unwrap().suppress_portfolio = suppress;
    }

    /// Every order request the adapter has seen, in arrival order.
    #[must_use]
    pub fn orders_seen(&self) -> Vec<Order> {
        self.state.lock().unwrap().orders_seen.clone()
    }

    #[must_use]
    pub fn position(&self, instrument: &str) -> Option<PositionSnapshot> {
        self.state.lock().unwrap().positions.get(instrument).cloned()
    }
}

/// The paper broker adapter proper.
pub struct PaperAdapter {
    config: PaperConfig,
    state: Arc<Mutex<PaperState>>,
    events: AdapterEventSender,
    api: ConnectionSupervisor,
    feed: ConnectionSupervisor,
}

impl PaperAdapter {
    #[must_use]
    pub fn new(config: PaperConfig, events: AdapterEventSender) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PaperState::default())),
            events,
            api: ConnectionSupervisor::new("api", 10),
            feed: ConnectionSupervisor::new("feed", 10),
        }
    }

    /// Shared-state handle for tests and the scripted feed.
    #[must_use]
    pub fn handle(&self) -> PaperHandle {
        PaperHandle {
            state: self.state.clone(),
        }
    }

    fn account_info(&self) -> AccountInfo {
        AccountInfo {
            account_id: self.config.account_id.clone(),
            account_name: self.config.account_name.clone(),
            currency: self.config.currency.clone(),
            cash: self.config.cash,
            used_margin: Decimal::ZERO,
            pnl: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    fn portfolio(&self) -> Portfolio {
        let state = self.state.lock().unwrap();
        Portfolio(state.positions.clone())
    }

    fn apply_fill(&self, instrument: &str, side: Side, quantity: Decimal, price: Price) {
        let mut state = self.state.lock().unwrap();
        let entry = state.positions.entry(instrument.to_string()).or_default();
        let signed = quantity * Decimal::from(side.as_i8());
        let new_qty = entry.quantity + signed;
        if new_qty.is_zero() {
            entry.quantity = Decimal::ZERO;
            entry.average_price = Decimal::ZERO;
        } else if entry.quantity.is_zero() || entry.quantity.signum() == signed.signum() {
            let prev_notional = entry.average_price * entry.quantity.abs();
            entry.average_price = (prev_notional + price * quantity) / new_qty.abs();
            entry.quantity = new_qty;
        } else {
            entry.quantity = new_qty;
            if entry.quantity.signum() != Decimal::ZERO && new_qty.signum() == signed.signum() {
                entry.average_price = price;
            }
        }
        entry.unrealized_pnl = Some(Decimal::ZERO);
    }

    async fn execute_order(&mut self, order: &Order, side: Side) -> AdapterResult<()> {
        self.state.lock().unwrap().orders_seen.push(order.clone());
        if !self.api.is_connected() {
            return Err(AdapterError::new(
                AdapterErrorCode::NotConnected,
                "paper api channel is not connected",
            ));
        }
        let (reject, deal_reference, price) = {
            let mut state = self.state.lock().unwrap();
            let reject = state.reject_next_order.take();
            state.deal_counter += 1;
            let reference = format!("PAPER-{:06}", state.deal_counter);
            let price = state.last_prices.get(&order.instrument).copied();
            (reject, reference, price)
        };
        if let Some(reason) = reject {
            self.events
                .emit(AdapterEvent::OrderRejected {
                    order_id: order.id,
                    code: AdapterErrorCode::Broker,
                    reason,
                })
                .await;
            return Ok(());
        }
        let Some(price) = price else {
            self.events
                .emit(AdapterEvent::OrderError {
                    order_id: order.id,
                    code: AdapterErrorCode::InvalidInstrument,
                    reason: format!("no market price for {}", order.instrument),
                })
                .await;
            return Ok(());
        };
        self.events
            .emit(AdapterEvent::OrderAccepted {
                order_id: order.id,
                deal_reference: deal_reference.clone(),
            })
            .await;
        self.apply_fill(&order.instrument, side, order.quantity, price);
        self.events
            .emit(AdapterEvent::OrderFilled {
                order_id: order.id,
                fill: Fill {
                    price,
                    quantity: order.quantity,
                    timestamp: Utc::now(),
                },
            })
            .await;
        info!(
            instrument = %order.instrument,
            qty = %order.quantity,
            %price,
            deal = %deal_reference,
            "paper order filled"
        );
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for PaperAdapter {
    fn name(&self) -> &str {
        "paper"
    }

    async fn init(&mut self) -> AdapterResult<AdapterInit> {
        if self.state.lock().unwrap().fail_auth {
            return Err(AdapterError::auth("paper credentials rejected"));
        }
        self.api.on_attempt();
        self.api.on_connected();
        self.feed.on_attempt();
        self.feed.on_connected();
        Ok(AdapterInit {
            account: self.account_info(),
            portfolio: self.portfolio(),
            history_timeframes: vec![Timeframe::ONE_MINUTE, Timeframe::FIVE_MINUTES],
            data_timeframes: vec![Timeframe::ONE_MINUTE],
        })
    }

    async fn tick(&mut self, now: DateTime<Utc>) -> AdapterResult<()> {
        loop {
            let injected = self.state.lock().unwrap().injected_events.pop_front();
            match injected {
                Some(event) => self.events.emit(event).await,
                None => break,
            }
        }
        let feed_down = self.state.lock().unwrap().feed_down;
        if feed_down {
            // A silent stall: the channel degrades without a disconnect
            // callback; the engine's freshness watchdog is the detector.
            if self.feed.is_connected() {
                self.feed.on_failure(now);
            }
            return Ok(());
        }
        if !self.feed.is_connected() {
            self.feed.on_attempt();
            self.feed.on_connected();
        }
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.pending_bars.pop_front() {
                    Some((instrument, bar)) if state.subscriptions.contains_key(&instrument) => {
                        Some((instrument, bar))
                    }
                    Some(_) => continue,
                    None => None,
                }
            };
            let Some((instrument, bar)) = next else { break };
            self.events
                .emit(AdapterEvent::MarketData { instrument, bar })
                .await;
        }
        Ok(())
    }

    async fn request_account_info(&mut self) -> AdapterResult<()> {
        let info = self.account_info();
        self.events.emit(AdapterEvent::AccountInfo(info)).await;
        Ok(())
    }

    async fn request_portfolio(&mut self) -> AdapterResult<()> {
        if self.state.lock().unwrap().suppress_portfolio {
            return Ok(());
        }
        let portfolio = self.portfolio();
        self.events.emit(AdapterEvent::Portfolio(portfolio)).await;
        Ok(())
    }

    async fn request_subscribe(
        &mut self,
        instrument: &Instrument,
        timeframe: Timeframe,
    ) -> AdapterResult<()> {
        if self.state.lock().unwrap().feed_down {
            self.events
                .emit(AdapterEvent::MarketDataSubscribed {
                    instrument: instrument.symbol.clone(),
                    ok: false,
                    code: AdapterErrorCode::Network,
                })
                .await;
            return Ok(());
        }
        let already = {
            let mut state = self.state.lock().unwrap();
            let already = state.subscriptions.contains_key(&instrument.symbol);
            if !already {
                state
                    .subscriptions
                    .insert(instrument.symbol.clone(), timeframe);
                state.subscription_count += 1;
            }
            already
        };
        if already {
            debug!(instrument = %instrument.symbol, "subscribe is idempotent, reusing live subscription");
        }
        self.events
            .emit(AdapterEvent::MarketDataSubscribed {
                instrument: instrument.symbol.clone(),
                ok: true,
                code: AdapterErrorCode::Ok,
            })
            .await;
        Ok(())
    }

    async fn request_unsubscribe(&mut self, instrument: &str) -> AdapterResult<()> {
        self.state.lock().unwrap().subscriptions.remove(instrument);
        Ok(())
    }

    async fn request_open(&mut self, order: &Order) -> AdapterResult<()> {
        let side = order.side;
        self.execute_order(order, side).await
    }

    async fn request_close(&mut self, order: &Order) -> AdapterResult<()> {
        let side = order.side;
        self.execute_order(order, side).await
    }

    async fn request_cancel(&mut self, order: &Order) -> AdapterResult<()> {
        self.events
            .emit(AdapterEvent::OrderCancelled { order_id: order.id })
            .await;
        Ok(())
    }

    async fn request_stop(&mut self, order: &Order) -> AdapterResult<()> {
        // Stops rest broker-side; acknowledge and keep the reference.
        let deal_reference = {
            let mut state = self.state.lock().unwrap();
            state.deal_counter += 1;
            format!("PAPER-{:06}", state.deal_counter)
        };
        self.events
            .emit(AdapterEvent::OrderAccepted {
                order_id: order.id,
                deal_reference,
            })
            .await;
        Ok(())
    }

    async fn shutdown(&mut self) -> AdapterResult<()> {
        self.api.on_closed();
        self.feed.on_closed();
        Ok(())
    }

    fn channels(&self) -> ChannelsStatus {
        ChannelsStatus {
            api: self.api.state(),
            feed: self.feed.state(),
        }
    }
}

/// Factory wired into the connector registry.
#[derive(Default)]
pub struct PaperFactory;

impl ConnectorFactory for PaperFactory {
    fn driver(&self) -> &'static str {
        "paper"
    }

    fn build(
        &self,
        params: &serde_json::Value,
        events: AdapterEventSender,
    ) -> AdapterResult<Box<dyn BrokerAdapter>> {
        let config: PaperConfig = if params.is_null() {
            PaperConfig::default()
        } else {
            serde_json::from_value(params.clone()).map_err(|err| {
                AdapterError::new(
                    AdapterErrorCode::General,
                    format!("invalid paper connector params: {err}"),
                )
            })?
        };
        Ok(Box::new(PaperAdapter::new(config, events)))
    }
}

/// Init hook: make the paper driver available.
pub fn register_factory() {
    register_connector_factory(Arc::new(PaperFactory));
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_adapter::event_channel;
    use rust_decimal_macros::dec;

    fn instrument(symbol: &str) -> Instrument {
        Instrument {
            symbol: symbol.into(),
            broker_symbol: format!("X.{symbol}"),
            description: String::new(),
            currency: "EUR".into(),
            timeframe: Timeframe::FIVE_MINUTES,
        }
    }

    fn bar(close: Decimal) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (tx, mut rx) = event_channel();
        let mut adapter = PaperAdapter::new(PaperConfig::default(), tx);
        adapter.init().await.unwrap();
        let handle = adapter.handle();

        let ftse = instrument("FTSE");
        adapter
            .request_subscribe(&ftse, Timeframe::ONE_MINUTE)
            .await
            .unwrap();
        adapter
            .request_subscribe(&ftse, Timeframe::ONE_MINUTE)
            .await
            .unwrap();
        assert_eq!(handle.subscription_count(), 1);

        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                AdapterEvent::MarketDataSubscribed { ok, code, .. } => {
                    assert!(ok);
                    assert_eq!(code, AdapterErrorCode::Ok);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn orders_accept_then_fill_at_last_price() {
        let (tx, mut rx) = event_channel();
        let mut adapter = PaperAdapter::new(PaperConfig::default(), tx);
        adapter.init().await.unwrap();
        let handle = adapter.handle();
        handle.set_price("FTSE", dec!(7400));

        let order = Order::from_draft(
            kestrel_core::OrderDraft {
                instrument: "FTSE".into(),
                side: Side::Buy,
                op: kestrel_core::OrderOp::Open,
                quantity: dec!(100),
                stop_price: None,
                limit_price: None,
                author: kestrel_core::OrderAuthor::System,
                strategy_id: None,
                on_filled: None,
            },
            Utc::now(),
        );
        adapter.request_open(&order).await.unwrap();

        match rx.recv().await.unwrap() {
            AdapterEvent::OrderAccepted { order_id, deal_reference } => {
                assert_eq!(order_id, order.id);
                assert!(deal_reference.starts_with("PAPER-"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            AdapterEvent::OrderFilled { fill, .. } => {
                assert_eq!(fill.price, dec!(7400));
                assert_eq!(fill.quantity, dec!(100));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.position("FTSE").unwrap().quantity, dec!(100));
    }

    #[tokio::test]
    async fn feed_outage_stops_bar_delivery() {
        let (tx, mut rx) = event_channel();
        let mut adapter = PaperAdapter::new(PaperConfig::default(), tx);
        adapter.init().await.unwrap();
        let handle = adapter.handle();
        adapter
            .request_subscribe(&instrument("FTSE"), Timeframe::ONE_MINUTE)
            .await
            .unwrap();
        let _ = rx.recv().await;

        handle.set_feed_down(true);
        handle.push_bar("FTSE", bar(dec!(7400)));
        adapter.tick(Utc::now()).await.unwrap();
        assert_eq!(adapter.channels().feed, ConnectionState::Backoff);
        assert!(rx.try_recv().is_err());

        handle.set_feed_down(false);
        adapter.tick(Utc::now()).await.unwrap();
        match rx.recv().await.unwrap() {
            AdapterEvent::MarketData { instrument, .. } => assert_eq!(instrument, "FTSE"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_failure_at_init() {
        let (tx, _rx) = event_channel();
        let mut adapter = PaperAdapter::new(PaperConfig::default(), tx);
        adapter.handle().fail_auth();
        let err = adapter.init().await.unwrap_err();
        assert_eq!(err.code, AdapterErrorCode::Auth);
    }
}
