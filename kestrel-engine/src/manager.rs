//! The Trade Manager loop.
//!
//! Single-task with respect to per-session state: all strategy callbacks,
//! order transitions and aggregation run here. Broker I/O lives in the
//! adapter task; clients live in the gateway tasks; both talk to this loop
//! over bounded queues only.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kestrel_adapter::{
    AdapterErrorCode, AdapterEvent, AdapterHandle, AdapterInit, AdapterRequest,
};
use kestrel_config::{AppConfig, StrategyConfig};
use kestrel_core::{
    AccountInfo, Alert, AlertSeverity, Order, OrderAuthor, OrderDraft, OrderOp, OrderState,
    Portfolio, Session, SessionState,
};
use kestrel_marketdata::{AckOutcome, FeedState, MarketDataRouter, SubscribeOutcome};
use kestrel_orders::{BrokerOrderEvent, OrderTracker, OrderUpdate};
use kestrel_store::{Store, StoreError};
use kestrel_strategy::{load_strategy, SignalDoc, StrategyInstance};

use crate::{
    build_instances, translate::translate_decision, translate::translate_follow_up, EngineCommand,
    EngineResult, EngineStatus, OrderStatus, ShutdownSignal, StrategyStatus, TradingWindow,
};

/// Engine-facing subset of the application configuration.
#[derive(Clone, Debug)]
pub struct TradeManagerConfig {
    pub account: String,
    pub trading_enable: bool,
    pub window: TradingWindow,
    pub daily_clean_time: NaiveTime,
    pub order_timeout: Duration,
    pub portfolio_refresh: Duration,
    pub account_refresh: Duration,
    pub action_timeout: Duration,
    pub shutdown_deadline: StdDuration,
    pub tick_interval: StdDuration,
    pub staleness_floor: Duration,
    pub strategies: Vec<StrategyConfig>,
}

impl TradeManagerConfig {
    /// Derive the engine configuration from the application config.
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            account: config.account_id.clone(),
            trading_enable: config.trading.enable,
            window: TradingWindow {
                start: config.trading.start,
                end: config.trading.end,
            },
            daily_clean_time: config.trading.daily_clean_time,
            order_timeout: Duration::seconds(config.engine.order_timeout_secs as i64),
            portfolio_refresh: Duration::seconds(config.engine.portfolio_refresh_secs as i64),
            account_refresh: Duration::seconds(config.engine.account_refresh_secs as i64),
            action_timeout: Duration::seconds(config.engine.action_timeout_secs as i64),
            shutdown_deadline: StdDuration::from_secs(config.engine.shutdown_deadline_secs),
            tick_interval: StdDuration::from_millis(config.engine.tick_interval_ms),
            staleness_floor: Duration::seconds(config.engine.staleness_floor_secs as i64),
            strategies: config.strategies.clone(),
        }
    }
}

/// The central runtime object; owns the session, the order set and the
/// strategy instances for the day.
pub struct TradeManager {
    config: TradeManagerConfig,
    store: Arc<Store>,
    adapter: AdapterHandle,
    commands: mpsc::Receiver<EngineCommand>,
    alerts: broadcast::Sender<Alert>,
    shutdown: ShutdownSignal,

    tracker: OrderTracker,
    router: MarketDataRouter,
    instances: Vec<StrategyInstance>,

    session: Option<Session>,
    session_id: String,
    portfolio: Portfolio,
    account_info: Option<AccountInfo>,

    trading_enabled: bool,
    api_connected: bool,
    feed_connected: bool,
    /// Authentication failed at init: stay idle, never open a session.
    fatal_auth: bool,
    quitting: bool,
    store_block_applied: bool,

    last_portfolio_refresh: DateTime<Utc>,
    last_account_refresh: DateTime<Utc>,
    cleaned_on: Option<NaiveDate>,
    /// Orders adopted in Submitting at recovery, waiting on broker proof.
    recovery_pending: Vec<Uuid>,
    /// Paced resubscription schedule for stale instruments.
    resubscribe_after: HashMap<String, DateTime<Utc>>,
}

impl TradeManager {
    /// Assemble the manager. `init` is `None` when the adapter refused
    /// authentication; the engine then idles with a single CRITICAL alert.
    pub fn new(
        config: TradeManagerConfig,
        store: Arc<Store>,
        adapter: AdapterHandle,
        init: Option<AdapterInit>,
        commands: mpsc::Receiver<EngineCommand>,
        alerts: broadcast::Sender<Alert>,
        shutdown: ShutdownSignal,
    ) -> EngineResult<Self> {
        let instances = build_instances(&config.strategies)?;
        let (portfolio, account_info, fatal_auth) = match init {
            Some(init) => (init.portfolio, Some(init.account), false),
            None => (Portfolio::default(), None, true),
        };
        let now = Utc::now();
        let tracker = OrderTracker::new(store.clone(), config.order_timeout);
        let trading_enabled = config.trading_enable;
        let mut router = MarketDataRouter::new();
        router.set_staleness_floor(config.staleness_floor);
        Ok(Self {
            config,
            store,
            adapter,
            commands,
            alerts,
            shutdown,
            tracker,
            router,
            instances,
            session: None,
            session_id: String::new(),
            portfolio,
            account_info,
            trading_enabled,
            api_connected: !fatal_auth,
            feed_connected: !fatal_auth,
            fatal_auth,
            quitting: false,
            store_block_applied: false,
            last_portfolio_refresh: now,
            last_account_refresh: now,
            cleaned_on: None,
            recovery_pending: Vec::new(),
            resubscribe_after: HashMap::new(),
        })
    }

    /// Run until shutdown. Performs crash recovery first.
    pub async fn run(mut self) -> EngineResult<()> {
        if self.fatal_auth {
            self.alert(
                AlertSeverity::Critical,
                "auth",
                "broker authentication failed; engine idle until restart with corrected credentials",
            );
        } else {
            self.recover().await;
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.shutdown.triggered() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick(Utc::now());
                }
                maybe_event = self.adapter.events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            self.on_adapter_event(event, Utc::now());
                            // Drain whatever else arrived, in order.
                            while let Ok(event) = self.adapter.events.try_recv() {
                                self.on_adapter_event(event, Utc::now());
                            }
                        }
                        None => {
                            warn!("adapter event channel closed");
                            break;
                        }
                    }
                }
                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => self.on_command(command),
                        None => break,
                    }
                }
                _ = self.shutdown.wait() => break,
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    // --- one loop iteration --------------------------------------------------

    fn on_tick(&mut self, now: DateTime<Utc>) {
        if self.fatal_auth || self.quitting {
            return;
        }

        // A sick store freezes everything order- and strategy-related.
        if !self.store.healthy() {
            if !self.store_block_applied {
                self.store_block_applied = true;
                for instance in &mut self.instances {
                    instance.set_blocked(true);
                }
                self.alert(
                    AlertSeverity::Critical,
                    "store",
                    "persistence unavailable; order transitions refused and strategies blocked",
                );
            }
            return;
        } else if self.store_block_applied {
            self.store_block_applied = false;
            for instance in &mut self.instances {
                instance.set_blocked(false);
            }
            self.alert(AlertSeverity::Warning, "store", "persistence recovered");
        }

        let local = Local::now();
        let in_hours = self.config.window.contains(local.time());

        // Daily cleanup closes the session and resets for the next day.
        if local.time() >= self.config.daily_clean_time
            && self.cleaned_on != Some(local.date_naive())
        {
            self.daily_cleanup(now, local.date_naive());
            return;
        }

        // API down: keep the loop alive, skip trading work this tick.
        if !self.api_connected {
            return;
        }

        if in_hours && self.trading_enabled && self.session.is_none() {
            self.open_session(now, local.date_naive());
        }

        // Submit-window timeouts.
        let timed_out = self.tracker.check_timeouts(now);
        for update in timed_out {
            if let OrderUpdate::TimedOut(order) = update {
                self.adapter.try_request(AdapterRequest::Cancel(order.clone()));
                self.notify_order_error(&order);
                self.alert(
                    AlertSeverity::Warning,
                    "orders",
                    format!("order {} submit timed out, cancel requested", order.id),
                );
            }
        }

        // Market data freshness, only meaningful inside trading hours.
        if in_hours {
            let alerts = self.router.check_staleness(now);
            for stale in alerts {
                for strategy_id in &stale.subscribers {
                    if let Some(idx) = self.instance_index(*strategy_id) {
                        self.instances[idx].on_market_data_error();
                        self.commit_snapshot(idx);
                    }
                }
                self.alert(
                    AlertSeverity::Warning,
                    "marketdata",
                    format!("no market data for {}, resubscribing", stale.instrument),
                );
                self.request_resubscribe(&stale.instrument, now);
            }
            // Paced retries for instruments still waiting on a good ack.
            let due: Vec<String> = self
                .resubscribe_after
                .iter()
                .filter(|(_, at)| now >= **at)
                .map(|(instrument, _)| instrument.clone())
                .collect();
            for instrument in due {
                match self.router.feed_state(&instrument) {
                    Some(FeedState::Stale | FeedState::Pending) => {
                        self.request_resubscribe(&instrument, now);
                    }
                    _ => {
                        self.resubscribe_after.remove(&instrument);
                    }
                }
            }
        }

        // Remembered actions decay after the configured timeout.
        for instance in &mut self.instances {
            instance.decay_action(now, self.config.action_timeout);
        }

        // Periodic broker refreshes.
        if now - self.last_portfolio_refresh >= self.config.portfolio_refresh {
            self.last_portfolio_refresh = now;
            self.adapter.try_request(AdapterRequest::Portfolio);
        }
        if now - self.last_account_refresh >= self.config.account_refresh {
            self.last_account_refresh = now;
            self.adapter.try_request(AdapterRequest::AccountInfo);
        }
    }

    // --- adapter events ------------------------------------------------------

    fn on_adapter_event(&mut self, event: AdapterEvent, now: DateTime<Utc>) {
        match event {
            AdapterEvent::AccountInfo(info) => {
                self.account_info = Some(info);
            }
            AdapterEvent::Portfolio(portfolio) => self.on_portfolio(portfolio, now),
            AdapterEvent::MarketDataSubscribed {
                instrument,
                ok,
                code,
            } => self.on_subscription_ack(&instrument, ok, code, now),
            AdapterEvent::MarketData { instrument, bar } => self.on_bar(&instrument, bar, now),
            AdapterEvent::OrderAccepted {
                order_id,
                deal_reference,
            } => {
                self.recovery_pending.retain(|id| *id != order_id);
                self.apply_order_event(
                    order_id,
                    BrokerOrderEvent::Accepted { deal_reference },
                    now,
                );
            }
            AdapterEvent::OrderRejected {
                order_id, reason, ..
            } => {
                self.apply_order_event(order_id, BrokerOrderEvent::Rejected { reason }, now);
            }
            AdapterEvent::OrderFilled { order_id, fill } => {
                self.apply_order_event(order_id, BrokerOrderEvent::Fill(fill), now);
            }
            AdapterEvent::OrderCancelled { order_id } => {
                self.apply_order_event(order_id, BrokerOrderEvent::CancelAcknowledged, now);
            }
            AdapterEvent::OrderError {
                order_id, reason, ..
            } => {
                self.apply_order_event(order_id, BrokerOrderEvent::Fatal { reason }, now);
            }
            AdapterEvent::AccountDisconnected { code } => {
                self.api_connected = false;
                self.feed_connected = false;
                let severity = if code == 1 {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                self.alert(
                    severity,
                    "broker",
                    format!("broker disconnected (code {code})"),
                );
                if code == 1 {
                    if let Some(session) = self.session.as_mut() {
                        session.state = SessionState::Error;
                        let session = session.clone();
                        if let Err(err) = self.store.put_session(&session) {
                            error!(error = %err, "failed to persist session error state");
                        }
                    }
                }
            }
            AdapterEvent::AccountReconnected => {
                self.api_connected = true;
                self.feed_connected = true;
                self.alert(AlertSeverity::Warning, "broker", "broker reconnected");
            }
        }
    }

    fn on_portfolio(&mut self, portfolio: Portfolio, _now: DateTime<Utc>) {
        self.portfolio = portfolio;
        for instance in &mut self.instances {
            let position = self.portfolio.position(&instance.instrument().symbol).cloned();
            instance.update_position(position);
        }

        // Recovery reconciliation: a submit that the broker never
        // acknowledged by the first refresh is dead.
        let pending: Vec<Uuid> = self.recovery_pending.drain(..).collect();
        for order_id in pending {
            let still_submitting = self
                .tracker
                .get(order_id)
                .map(|order| order.state == OrderState::Submitting)
                .unwrap_or(false);
            if still_submitting {
                self.apply_order_event(
                    order_id,
                    BrokerOrderEvent::Fatal {
                        reason: "no broker record after restart".into(),
                    },
                    Utc::now(),
                );
                self.alert(
                    AlertSeverity::Critical,
                    "recovery",
                    format!("order {order_id} had no broker record after restart"),
                );
            }
        }

        // Timed-out orders flagged for reconciliation are surfaced here.
        for order_id in self.tracker.take_reconciliation() {
            self.alert(
                AlertSeverity::Warning,
                "orders",
                format!("order {order_id} awaiting manual reconciliation"),
            );
        }
    }

    fn on_subscription_ack(
        &mut self,
        instrument: &str,
        ok: bool,
        code: AdapterErrorCode,
        now: DateTime<Utc>,
    ) {
        if code.is_fatal() {
            self.alert(
                AlertSeverity::Critical,
                "marketdata",
                format!("authentication failure on subscription for {instrument}"),
            );
            return;
        }
        let outcome = match self.router.on_subscription_ack(instrument, ok, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(error = %err, "subscription ack for untracked instrument");
                return;
            }
        };
        match outcome {
            AckOutcome::Live => {
                self.resubscribe_after.remove(instrument);
            }
            AckOutcome::Restored(subscribers) => {
                self.resubscribe_after.remove(instrument);
                for strategy_id in subscribers {
                    if let Some(idx) = self.instance_index(strategy_id) {
                        self.instances[idx].on_market_data_restore();
                        self.commit_snapshot(idx);
                    }
                }
                self.alert(
                    AlertSeverity::Warning,
                    "marketdata",
                    format!("market data restored for {instrument}"),
                );
            }
            AckOutcome::Failed {
                attempts,
                blocked,
                subscribers,
            } => {
                let permanent = code.is_permanent_for_instrument();
                if blocked || permanent {
                    for strategy_id in subscribers {
                        if let Some(idx) = self.instance_index(strategy_id) {
                            self.instances[idx].set_blocked(true);
                        }
                    }
                    self.alert(
                        AlertSeverity::Critical,
                        "marketdata",
                        format!(
                            "instrument {instrument} disabled after {attempts} failed subscriptions (code {code:?})"
                        ),
                    );
                    self.resubscribe_after.remove(instrument);
                } else {
                    // The paced retry loop in `on_tick` tries again.
                    self.resubscribe_after
                        .entry(instrument.to_string())
                        .or_insert(now + Duration::seconds(1));
                }
            }
        }
    }

    fn on_bar(&mut self, instrument: &str, bar: kestrel_core::Bar, now: DateTime<Utc>) {
        let deliveries = self.router.on_bar(instrument, &bar, now);
        for (strategy_id, strategy_bar) in deliveries {
            let Some(idx) = self.instance_index(strategy_id) else {
                continue;
            };
            if strategy_bar.closed && !self.session_id.is_empty() {
                let key = self.instances[idx].id().to_string();
                if let Err(err) = self.store.append_bar(&self.session_id, &key, &strategy_bar) {
                    warn!(error = %err, "failed to append bar to the day log");
                }
            }
            // An order already working this instrument: hold strategy fire.
            if self.tracker.has_inflight(self.instances[idx].symbol()) {
                continue;
            }
            let decision = {
                let instance = &mut self.instances[idx];
                instance.process(&strategy_bar, &self.portfolio, now)
            };
            self.commit_snapshot(idx);
            let Some(decision) = decision else { continue };
            if decision.is_noop() {
                continue;
            }
            let instance = &self.instances[idx];
            info!(
                instance = %instance.name(),
                instrument = %instance.symbol(),
                action = ?decision.action,
                qty = %decision.quantity,
                "strategy decision"
            );
            if !instance.can_trade() {
                continue;
            }
            let position = self.portfolio.quantity(instance.symbol());
            let draft = translate_decision(&decision, instance.symbol(), position, instance.id());
            if let Some(draft) = draft {
                if let Err(reason) = self.dispatch_order(draft, now) {
                    warn!(reason = %reason, "strategy order not dispatched");
                }
            }
        }
    }

    // --- orders --------------------------------------------------------------

    fn dispatch_order(&mut self, draft: OrderDraft, now: DateTime<Utc>) -> Result<Uuid, String> {
        if self.quitting {
            return Err("engine shutting down".into());
        }
        if !self.trading_enabled {
            return Err("trading disabled".into());
        }
        if !self.api_connected {
            return Err("broker api disconnected".into());
        }
        if !self.store.healthy() {
            return Err("persistence unavailable".into());
        }
        let op = draft.op;
        let id = self.tracker.create(draft, now);
        let order = self.tracker.submit(id, now).map_err(|err| err.to_string())?;
        let request = match op {
            OrderOp::Open => AdapterRequest::Open(order),
            OrderOp::Close => AdapterRequest::Close(order),
            OrderOp::UpdateStop => AdapterRequest::Stop(order),
        };
        if !self.adapter.try_request(request) {
            return Err("adapter request queue full".into());
        }
        Ok(id)
    }

    fn apply_order_event(&mut self, order_id: Uuid, event: BrokerOrderEvent, now: DateTime<Utc>) {
        let update = match self.tracker.on_broker_event(order_id, event, now) {
            Ok(Some(update)) => update,
            Ok(None) => return,
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "broker order event not applied");
                return;
            }
        };
        match update {
            OrderUpdate::Accepted(order) => {
                if let Some(idx) = order.strategy_id.and_then(|id| self.instance_index_by_strategy(id)) {
                    self.instances[idx].on_order_accepted(&order);
                    self.commit_snapshot(idx);
                }
            }
            OrderUpdate::PartiallyFilled(order) => {
                debug!(order_id = %order.id, filled = %order.filled_quantity(), "partial fill");
            }
            OrderUpdate::Filled(order) => {
                if let Some(idx) = order.strategy_id.and_then(|id| self.instance_index_by_strategy(id)) {
                    self.instances[idx].on_order_filled(&order, now);
                    self.commit_snapshot(idx);
                }
                // The broker is authoritative: refresh after every fill.
                self.last_portfolio_refresh = now;
                self.adapter.try_request(AdapterRequest::Portfolio);
                // Second leg of a turnaround.
                if let Some(follow_up) = order.on_filled {
                    if let Some(draft) =
                        translate_follow_up(&follow_up, &order.instrument, order.strategy_id)
                    {
                        if let Err(reason) = self.dispatch_order(draft, now) {
                            warn!(reason = %reason, "follow-up order not dispatched");
                        }
                    }
                }
            }
            OrderUpdate::Rejected(order) | OrderUpdate::Errored(order) => {
                self.notify_order_error(&order);
            }
            OrderUpdate::Cancelled(order) => {
                debug!(order_id = %order.id, "order cancelled");
            }
            OrderUpdate::TimedOut(order) => {
                self.adapter.try_request(AdapterRequest::Cancel(order.clone()));
                self.notify_order_error(&order);
            }
        }
    }

    fn notify_order_error(&mut self, order: &Order) {
        if order.author == OrderAuthor::User {
            self.alert(
                AlertSeverity::Warning,
                "orders",
                format!(
                    "user order {} failed: {}",
                    order.id,
                    order.error.as_deref().unwrap_or("unknown")
                ),
            );
        }
        if let Some(idx) = order.strategy_id.and_then(|id| self.instance_index_by_strategy(id)) {
            self.instances[idx].on_order_error(order);
            self.commit_snapshot(idx);
        }
    }

    // --- session lifecycle ---------------------------------------------------

    fn open_session(&mut self, now: DateTime<Utc>, day: NaiveDate) {
        if self.instances.is_empty() {
            match build_instances(&self.config.strategies) {
                Ok(instances) => self.instances = instances,
                Err(err) => {
                    error!(error = %err, "cannot rebuild strategy instances");
                    return;
                }
            }
        }
        let mut session = Session::pending(day, &self.config.account);
        session.state = SessionState::Open;
        session.opened_at = Some(now);
        if let Err(err) = self.store.put_session(&session) {
            error!(error = %err, "failed to persist session open");
            return;
        }
        self.session_id = Store::session_id(day, &self.config.account);
        self.session = Some(session);
        info!(account = %self.config.account, %day, "session opened");

        for idx in 0..self.instances.len() {
            let signal = SignalDoc {
                instrument: self.instances[idx].symbol().to_string(),
                timeframe: self.instances[idx].timeframe(),
            };
            let valid = {
                let portfolio = self.portfolio.clone();
                self.instances[idx].validate(&signal, &portfolio)
            };
            if !valid {
                self.alert(
                    AlertSeverity::Warning,
                    "strategy",
                    format!(
                        "strategy {} on {} failed validation and is excluded from the session",
                        self.instances[idx].name(),
                        self.instances[idx].symbol()
                    ),
                );
                self.instances[idx].set_blocked(true);
                continue;
            }
            self.instances[idx].init();
            let portfolio = self.portfolio.clone();
            if !self.instances[idx].initialize(&portfolio, true) {
                self.alert(
                    AlertSeverity::Critical,
                    "strategy",
                    format!("strategy {} failed to initialize", self.instances[idx].name()),
                );
                continue;
            }
            self.commit_snapshot(idx);
            self.subscribe_instance(idx);
        }
    }

    fn subscribe_instance(&mut self, idx: usize) {
        let (strategy_id, instrument, data_tf, target_tf) = {
            let instance = &self.instances[idx];
            (
                instance.id(),
                instance.instrument().clone(),
                instance.data_timeframe(),
                instance.timeframe(),
            )
        };
        match self
            .router
            .subscribe(strategy_id, &instrument.symbol, data_tf, target_tf)
        {
            Ok(SubscribeOutcome::NeedsBrokerSubscribe) => {
                self.adapter.try_request(AdapterRequest::Subscribe {
                    instrument,
                    timeframe: data_tf,
                });
            }
            Ok(SubscribeOutcome::AlreadyLive) => {}
            Err(err) => {
                error!(error = %err, "subscription rejected");
                self.instances[idx].set_blocked(true);
            }
        }
    }

    fn request_resubscribe(&mut self, instrument: &str, now: DateTime<Utc>) {
        let found = self
            .instances
            .iter()
            .find(|instance| instance.symbol() == instrument)
            .map(|instance| (instance.instrument().clone(), instance.data_timeframe()));
        if let Some((instrument_meta, timeframe)) = found {
            // One attempt per base-bar interval, one second at minimum.
            let pace = timeframe
                .as_duration()
                .max(Duration::seconds(1));
            self.resubscribe_after
                .insert(instrument.to_string(), now + pace);
            self.adapter.try_request(AdapterRequest::Subscribe {
                instrument: instrument_meta,
                timeframe,
            });
        }
    }

    fn daily_cleanup(&mut self, now: DateTime<Utc>, day: NaiveDate) {
        self.cleaned_on = Some(day);
        let Some(mut session) = self.session.take() else {
            return;
        };
        info!(account = %self.config.account, "daily cleanup");
        // Flush whatever is dirty before tearing down.
        for idx in 0..self.instances.len() {
            self.commit_snapshot(idx);
        }
        for idx in 0..self.instances.len() {
            let strategy_id = self.instances[idx].id();
            let symbol = self.instances[idx].symbol().to_string();
            if self.router.unsubscribe(strategy_id, &symbol) {
                self.adapter
                    .try_request(AdapterRequest::Unsubscribe { instrument: symbol });
            }
        }
        session.state = SessionState::Closed;
        session.closed_at = Some(now);
        if let Err(err) = self.store.put_session(&session) {
            error!(error = %err, "failed to persist session close");
        }
        self.instances.clear();
        self.session_id.clear();
        info!("session closed, engine ready for the next trading day");
    }

    // --- crash recovery ------------------------------------------------------

    async fn recover(&mut self) {
        let day = Local::now().date_naive();
        let context = match self.store.load_recovery_context(&self.config.account, day) {
            Ok(context) => context,
            Err(err) => {
                error!(error = %err, "recovery context unavailable");
                return;
            }
        };
        let Some(session) = context.session else {
            return;
        };
        if session.state != SessionState::Open {
            return;
        }
        info!(%day, "recovering open session");
        self.session_id = Store::session_id(day, &self.config.account);

        let mut bars_by_instance: HashMap<String, Vec<kestrel_core::Bar>> = HashMap::new();
        for (key, bar) in context.bars {
            bars_by_instance.entry(key).or_default().push(bar);
        }

        let mut recovered = Vec::new();
        for persisted in context.strategies {
            let mut instance =
                match StrategyInstance::recover(persisted.strategy_id, &persisted.state) {
                    Ok(instance) => instance,
                    Err(err) => {
                        self.alert(
                            AlertSeverity::Critical,
                            "recovery",
                            format!(
                                "strategy {} could not be re-created: {err}",
                                persisted.strategy_id
                            ),
                        );
                        continue;
                    }
                };
            let bars = bars_by_instance
                .remove(&persisted.strategy_id.to_string())
                .unwrap_or_default();
            let ok = instance.resume(
                persisted.state.clone(),
                persisted.version,
                &bars,
                &self.portfolio,
                &[],
                Utc::now(),
            );
            if !ok {
                self.alert(
                    AlertSeverity::Critical,
                    "recovery",
                    format!("strategy {} failed to resume", instance.name()),
                );
            }
            recovered.push(instance);
        }
        if !recovered.is_empty() {
            self.instances = recovered;
        }
        self.session = Some(session);

        // Re-establish market data.
        for idx in 0..self.instances.len() {
            self.subscribe_instance(idx);
        }

        // Adopt open orders and reconcile them against the broker.
        let now = Utc::now();
        for order in context.open_orders {
            let needs_proof =
                order.state == OrderState::Submitting && order.deal_reference.is_none();
            if needs_proof {
                self.recovery_pending.push(order.id);
            }
            self.tracker.adopt(order, now);
        }
        if !self.recovery_pending.is_empty() {
            // The next portfolio snapshot decides their fate.
            self.adapter.try_request(AdapterRequest::Portfolio);
        }
        info!(
            instances = self.instances.len(),
            pending_orders = self.recovery_pending.len(),
            "recovery complete"
        );
    }

    // --- client commands -----------------------------------------------------

    fn on_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Status { respond } => {
                let _ = respond.send(self.status());
            }
            EngineCommand::OpenPosition {
                instrument,
                side,
                quantity,
                stop_price,
                respond,
            } => {
                let draft = OrderDraft {
                    instrument,
                    side,
                    op: OrderOp::Open,
                    quantity,
                    stop_price,
                    limit_price: None,
                    author: OrderAuthor::User,
                    strategy_id: None,
                    on_filled: None,
                };
                let _ = respond.send(self.dispatch_order(draft, Utc::now()));
            }
            EngineCommand::ClosePosition {
                instrument,
                quantity,
                respond,
            } => {
                let position = self.portfolio.quantity(&instrument);
                if position.is_zero() {
                    let _ = respond.send(Err(format!("no open position for {instrument}")));
                    return;
                }
                let qty = quantity.unwrap_or_else(|| position.abs()).min(position.abs());
                let draft = OrderDraft {
                    instrument,
                    side: if position > rust_decimal::Decimal::ZERO {
                        kestrel_core::Side::Sell
                    } else {
                        kestrel_core::Side::Buy
                    },
                    op: OrderOp::Close,
                    quantity: qty,
                    stop_price: None,
                    limit_price: None,
                    author: OrderAuthor::User,
                    strategy_id: None,
                    on_filled: None,
                };
                let _ = respond.send(self.dispatch_order(draft, Utc::now()));
            }
            EngineCommand::UpdateAccountConfig {
                trading_enable,
                respond,
            } => {
                if let Some(enable) = trading_enable {
                    self.trading_enabled = enable;
                    info!(enable, "trading flag updated by operator");
                }
                let _ = respond.send(Ok(()));
            }
            EngineCommand::ValidateSignal {
                strategy,
                instrument,
                timeframe,
                params,
                respond,
            } => {
                let result = self.validate_signal(&strategy, &instrument, timeframe, params);
                let _ = respond.send(result);
            }
            EngineCommand::StrategyMetadata { respond } => {
                let _ = respond.send(self.strategy_statuses());
            }
            EngineCommand::AccountActivity { respond } => {
                let _ = respond.send(self.order_statuses());
            }
        }
    }

    fn validate_signal(
        &self,
        strategy: &str,
        instrument: &str,
        timeframe: kestrel_core::Timeframe,
        params: toml::Value,
    ) -> Result<bool, String> {
        let built = load_strategy(strategy, params.clone()).map_err(|err| err.to_string())?;
        let signal = SignalDoc {
            instrument: instrument.to_string(),
            timeframe,
        };
        let portfolio = self.portfolio.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            built.validate(&signal, &params, &portfolio)
        }));
        match outcome {
            Ok(ok) => Ok(ok),
            Err(_) => Err("strategy panicked during validation".into()),
        }
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            account: self.config.account.clone(),
            session: self.session.clone(),
            api_connected: self.api_connected,
            feed_connected: self.feed_connected,
            trading_enabled: self.trading_enabled,
            account_info: self.account_info.clone(),
            portfolio: self.portfolio.clone(),
            strategies: self.strategy_statuses(),
            open_orders: self.order_statuses(),
        }
    }

    fn strategy_statuses(&self) -> Vec<StrategyStatus> {
        self.instances
            .iter()
            .map(|instance| {
                let flags = instance.flags();
                StrategyStatus {
                    id: instance.id(),
                    name: instance.name().to_string(),
                    instrument: instance.symbol().to_string(),
                    initialized: flags.initialized,
                    errored: flags.errored,
                    completed: flags.completed,
                    blocked: flags.blocked,
                    last_action: instance.last_action().wire_code(),
                }
            })
            .collect()
    }

    fn order_statuses(&self) -> Vec<OrderStatus> {
        self.tracker
            .open_orders()
            .into_iter()
            .map(|order| OrderStatus {
                id: order.id,
                instrument: order.instrument.clone(),
                side: format!("{:?}", order.side),
                quantity: order.quantity,
                state: order.state.deal_status(),
                deal_reference: order.deal_reference.clone(),
                error: order.error.clone(),
            })
            .collect()
    }

    // --- shutdown ------------------------------------------------------------

    async fn shutdown_sequence(&mut self) {
        info!("engine shutting down");
        self.quitting = true;
        for idx in 0..self.instances.len() {
            self.commit_snapshot(idx);
        }
        if let Some(session) = self.session.clone() {
            if let Err(err) = self.store.put_session(&session) {
                warn!(error = %err, "failed to persist session at shutdown");
            }
        }
        let _ = self.adapter.requests.send(AdapterRequest::Shutdown).await;
        let deadline = self.config.shutdown_deadline;
        let task = &mut self.adapter.task;
        if tokio::time::timeout(deadline, task).await.is_err() {
            warn!("adapter did not drain within the shutdown deadline");
        }
    }

    // --- helpers -------------------------------------------------------------

    fn instance_index(&self, strategy_id: Uuid) -> Option<usize> {
        self.instances
            .iter()
            .position(|instance| instance.id() == strategy_id)
    }

    fn instance_index_by_strategy(&self, strategy_id: Uuid) -> Option<usize> {
        self.instance_index(strategy_id)
    }

    /// Durably write a dirty state container before anything else observes
    /// the instance again. StaleVersion here means two writers share one
    /// container, which the single-task design rules out.
    fn commit_snapshot(&mut self, idx: usize) {
        if self.session_id.is_empty() {
            return;
        }
        let instance = &self.instances[idx];
        if !instance.needs_snapshot() {
            return;
        }
        let (payload, expected) = instance.snapshot();
        match self
            .store
            .put_strategy_state(&self.session_id, instance.id(), &payload, expected)
        {
            Ok(version) => self.instances[idx].commit_snapshot(version),
            Err(StoreError::StaleVersion { expected, found }) => {
                error!(
                    instance = %self.instances[idx].name(),
                    expected,
                    found,
                    severity = "CRITICAL",
                    "state snapshot version conflict: framework bug"
                );
            }
            Err(err) => {
                warn!(error = %err, "state snapshot not persisted");
            }
        }
    }

    fn alert(&self, severity: AlertSeverity, topic: &str, message: impl Into<String>) {
        let message = message.into();
        match severity {
            AlertSeverity::Warning => warn!(topic, message = %message, "engine alert"),
            AlertSeverity::Critical => {
                error!(topic, message = %message, severity = "CRITICAL", "engine alert")
            }
        }
        let _ = self.alerts.send(Alert::new(severity, topic, message));
    }
}
