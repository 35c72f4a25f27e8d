//! The framework side of the strategy contract: one harness per live
//! (strategy, instrument, parameters) binding.
//!
//! Every plugin callback goes through here. The harness rehydrates and
//! snapshots the state container, enforces the implicit-dirty rule for
//! emitted actions, and turns panics escaping a buggy plugin into the
//! errored flag instead of letting them reach the Trade Manager loop.

use std::panic::{catch_unwind, AssertUnwindSafe};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use kestrel_core::{
    Bar, Instrument, Order, OrderAuthor, Portfolio, PositionSnapshot, SystemAction, Timeframe,
};

use crate::{Decision, SignalDoc, StateContainer, Strategy, StrategyCtx};

/// Operating flags of a strategy instance.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceFlags {
    pub initialized: bool,
    pub errored: bool,
    pub completed: bool,
    pub blocked: bool,
}

/// Static description of one instance binding.
#[derive(Clone, Debug)]
pub struct InstanceSpec {
    pub name: String,
    pub instrument: Instrument,
    /// Broker-native timeframe the market data arrives in.
    pub data_timeframe: Timeframe,
    pub evaluate_in_progress: bool,
    pub params: toml::Value,
}

/// One live strategy bound to an instrument for the session.
pub struct StrategyInstance {
    id: Uuid,
    spec: InstanceSpec,
    strategy: Box<dyn Strategy>,
    state: StateContainer,
    flags: InstanceFlags,
    last_action: SystemAction,
    action_time: Option<DateTime<Utc>>,
    last_closed_ts: Option<DateTime<Utc>>,
    last_position: Option<PositionSnapshot>,
}

impl std::fmt::Debug for StrategyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyInstance")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("flags", &self.flags)
            .field("last_action", &self.last_action)
            .field("action_time", &self.action_time)
            .field("last_closed_ts", &self.last_closed_ts)
            .field("last_position", &self.last_position)
            .finish()
    }
}

impl StrategyInstance {
    #[must_use]
    pub fn new(spec: InstanceSpec, strategy: Box<dyn Strategy>) -> Self {
        Self::with_id(Uuid::new_v4(), spec, strategy)
    }

    /// Re-create an instance under its persisted identifier (recovery).
    #[must_use]
    pub fn with_id(id: Uuid, spec: InstanceSpec, strategy: Box<dyn Strategy>) -> Self {
        Self {
            id,
            spec,
            strategy,
            state: StateContainer::new(),
            flags: InstanceFlags::default(),
            last_action: SystemAction::NoAction,
            action_time: None,
            last_closed_ts: None,
            last_position: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.spec.instrument
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.spec.instrument.symbol
    }

    #[must_use]
    pub fn timeframe(&self) -> Timeframe {
        self.spec.instrument.timeframe
    }

    #[must_use]
    pub fn data_timeframe(&self) -> Timeframe {
        self.spec.data_timeframe
    }

    #[must_use]
    pub fn evaluate_in_progress(&self) -> bool {
        self.spec.evaluate_in_progress
    }

    #[must_use]
    pub fn params(&self) -> &toml::Value {
        &self.spec.params
    }

    #[must_use]
    pub fn flags(&self) -> InstanceFlags {
        self.flags
    }

    #[must_use]
    pub fn last_action(&self) -> SystemAction {
        self.last_action
    }

    #[must_use]
    pub fn last_position(&self) -> Option<&PositionSnapshot> {
        self.last_position.as_ref()
    }

    /// Engine-side cache of the broker's view for this instrument.
    pub fn update_position(&mut self, position: Option<PositionSnapshot>) {
        self.last_position = position;
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        if self.flags.blocked != blocked {
            info!(
                instance = %self.spec.name,
                instrument = %self.symbol(),
                blocked,
                "instance block flag changed"
            );
            self.flags.blocked = blocked;
        }
    }

    /// Operator reset of the errored flag.
    pub fn reset_error(&mut self) {
        self.flags.errored = false;
    }

    /// True when the instance may emit orders.
    #[must_use]
    pub fn can_trade(&self) -> bool {
        self.flags.initialized
            && !self.flags.errored
            && !self.flags.blocked
            && !self.flags.completed
    }

    // --- lifecycle callbacks -------------------------------------------------

    /// One-time constructor hook.
    pub fn init(&mut self) {
        let Self {
            strategy,
            state,
            spec,
            ..
        } = self;
        let instrument = spec.instrument.symbol.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = StrategyCtx::new(state, &instrument);
            strategy.init(&mut ctx)
        }));
        self.absorb_outcome("init", outcome);
    }

    /// Pre-startup validation. Rejection (or a panic) is final.
    pub fn validate(&mut self, signal: &SignalDoc, portfolio: &Portfolio) -> bool {
        let strategy = &self.strategy;
        let params = &self.spec.params;
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            strategy.validate(signal, params, portfolio)
        }));
        match outcome {
            Ok(ok) => ok,
            Err(_) => {
                self.mark_panicked("validate");
                false
            }
        }
    }

    /// Bind parameters and prepare buffers; sets the initialized flag.
    pub fn initialize(&mut self, portfolio: &Portfolio, is_first_init: bool) -> bool {
        let Self {
            strategy,
            state,
            spec,
            ..
        } = self;
        let instrument = spec.instrument.symbol.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = StrategyCtx::new(state, &instrument);
            let result = strategy.initialize(&mut ctx, portfolio, is_first_init);
            (result, ctx.completion_requested())
        }));
        match outcome {
            Ok((Ok(()), completion)) => {
                self.flags.initialized = true;
                if completion {
                    self.flags.completed = true;
                }
                self.state.mark_dirty();
                info!(
                    instance = %self.spec.name,
                    instrument = %self.symbol(),
                    is_first_init,
                    "instance initialized"
                );
                true
            }
            Ok((Err(err), _)) => {
                error!(
                    instance = %self.spec.name,
                    instrument = %self.symbol(),
                    error = %err,
                    "instance initialization failed"
                );
                false
            }
            Err(_) => {
                self.mark_panicked("initialize");
                false
            }
        }
    }

    /// Rehydrate flags and state from a persisted snapshot payload, then run
    /// the plugin's `resume` with the day's bar log. Returns false (and sets
    /// errored) when the plugin cannot restore itself.
    pub fn resume(
        &mut self,
        payload: serde_json::Value,
        version: u64,
        bars_today: &[Bar],
        portfolio: &Portfolio,
        log: &[String],
        now: DateTime<Utc>,
    ) -> bool {
        self.rehydrate(payload, version);
        let Self {
            strategy,
            state,
            spec,
            ..
        } = self;
        let instrument = spec.instrument.symbol.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = StrategyCtx::new(state, &instrument);
            strategy.resume(&mut ctx, bars_today, portfolio, log, now)
        }));
        match outcome {
            Ok(Ok(())) => {
                self.flags.initialized = true;
                info!(
                    instance = %self.spec.name,
                    instrument = %self.symbol(),
                    bars = bars_today.len(),
                    "instance resumed after restart"
                );
                true
            }
            Ok(Err(err)) => {
                error!(
                    instance = %self.spec.name,
                    error = %err,
                    severity = "CRITICAL",
                    "instance resume failed"
                );
                self.flags.errored = true;
                false
            }
            Err(_) => {
                self.mark_panicked("resume");
                false
            }
        }
    }

    /// The hot path. Returns `None` when the bar was skipped or the plugin
    /// failed; a suppressed (blocked) decision also comes back as `None`.
    pub fn process(
        &mut self,
        bar: &Bar,
        portfolio: &Portfolio,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        if !self.flags.initialized || self.flags.errored || self.flags.completed {
            return None;
        }
        if !bar.closed && !self.spec.evaluate_in_progress {
            return None;
        }
        if bar.closed {
            // Bars within one instance stream are monotone; a closed window
            // never repeats.
            if let Some(last) = self.last_closed_ts {
                if bar.timestamp <= last {
                    warn!(
                        instance = %self.spec.name,
                        ts = %bar.timestamp,
                        "non-monotone closed bar dropped"
                    );
                    return None;
                }
            }
            self.last_closed_ts = Some(bar.timestamp);
        }

        let Self {
            strategy,
            state,
            spec,
            ..
        } = self;
        let instrument = spec.instrument.symbol.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = StrategyCtx::new(state, &instrument);
            let decision = strategy.process(&mut ctx, bar, portfolio);
            (decision, ctx.completion_requested())
        }));
        let (decision, completion) = match outcome {
            Ok((Ok(decision), completion)) => (decision, completion),
            Ok((Err(err), _)) => {
                error!(
                    instance = %self.spec.name,
                    instrument = %self.symbol(),
                    error = %err,
                    severity = "CRITICAL",
                    "process failed, instance moved to errored state"
                );
                self.flags.errored = true;
                return None;
            }
            Err(_) => {
                self.mark_panicked("process");
                return None;
            }
        };
        if completion {
            self.flags.completed = true;
            self.state.mark_dirty();
        }
        if decision.is_noop() {
            self.decay_action(now, Duration::seconds(600));
            return Some(decision);
        }

        // An emitted action implies state worth snapshotting.
        self.state.mark_dirty();
        self.last_action = decision.action;
        self.action_time = Some(now);

        if self.flags.blocked {
            warn!(
                instance = %self.spec.name,
                instrument = %self.symbol(),
                action = ?decision.action,
                "action skipped: instance is blocked"
            );
            return None;
        }
        Some(decision)
    }

    /// Remembered actions not consumed within the timeout decay to NoAction.
    pub fn decay_action(&mut self, now: DateTime<Utc>, timeout: Duration) {
        if self.last_action != SystemAction::NoAction {
            if let Some(at) = self.action_time {
                if now - at > timeout {
                    self.last_action = SystemAction::NoAction;
                    self.action_time = None;
                }
            }
        }
    }

    pub fn on_order_accepted(&mut self, order: &Order) {
        self.run_hook("on_order_accepted", |strategy, ctx| {
            strategy.on_order_accepted(ctx, order)
        });
    }

    pub fn on_order_filled(&mut self, order: &Order, now: DateTime<Utc>) {
        self.run_hook("on_order_filled", |strategy, ctx| {
            strategy.on_order_filled(ctx, order, now)
        });
    }

    /// Order failure hook. Errors on engine-originated orders put the
    /// instance into the errored state; user orders only alert.
    pub fn on_order_error(&mut self, order: &Order) {
        self.run_hook("on_order_error", |strategy, ctx| {
            strategy.on_order_error(ctx, order)
        });
        if order.author != OrderAuthor::User && !self.flags.completed {
            error!(
                instance = %self.spec.name,
                instrument = %self.symbol(),
                order_id = %order.id,
                severity = "CRITICAL",
                "order error, instance moved to errored state"
            );
            self.flags.errored = true;
            self.state.mark_dirty();
        }
    }

    pub fn on_market_data_error(&mut self) {
        self.run_hook("on_market_data_error", |strategy, ctx| {
            strategy.on_market_data_error(ctx)
        });
    }

    pub fn on_market_data_restore(&mut self) {
        self.run_hook("on_market_data_restore", |strategy, ctx| {
            strategy.on_market_data_restore(ctx)
        });
    }

    // --- snapshotting --------------------------------------------------------

    /// Whether the container changed since the last durable snapshot.
    #[must_use]
    pub fn needs_snapshot(&self) -> bool {
        self.state.is_dirty()
    }

    /// Snapshot payload and the version it CAS-writes over. The payload
    /// carries the binding (class, instrument, parameters) alongside flags
    /// and state so recovery can re-create the instance from the store
    /// alone.
    #[must_use]
    pub fn snapshot(&self) -> (serde_json::Value, u64) {
        let payload = json!({
            "name": self.spec.name,
            "instrument": self.spec.instrument,
            "data_timeframe": self.spec.data_timeframe,
            "evaluate_in_progress": self.spec.evaluate_in_progress,
            "params": self.spec.params,
            "flags": self.flags,
            "last_action": self.last_action,
            "state": self.state.snapshot(),
        });
        (payload, self.state.version())
    }

    /// The snapshot at `new_version` is durable; clear the dirty flag.
    pub fn commit_snapshot(&mut self, new_version: u64) {
        self.state.committed(new_version);
    }

    /// Re-create an instance from a persisted snapshot payload: the stored
    /// (class, parameters) drive the registry build; the caller follows up
    /// with [`StrategyInstance::resume`] to rehydrate state and run the
    /// plugin's recovery hook.
    pub fn recover(
        strategy_id: Uuid,
        payload: &serde_json::Value,
    ) -> crate::StrategyResult<Self> {
        let object = payload.as_object().ok_or_else(|| {
            crate::StrategyError::Internal("strategy snapshot is not an object".into())
        })?;
        let name: String = field(object, "name")?;
        let instrument: Instrument = field(object, "instrument")?;
        let data_timeframe: Timeframe = field(object, "data_timeframe")?;
        let evaluate_in_progress: bool = field(object, "evaluate_in_progress")?;
        let params: toml::Value = field(object, "params")?;
        let strategy = crate::load_strategy(&name, params.clone())?;
        Ok(Self::with_id(
            strategy_id,
            InstanceSpec {
                name,
                instrument,
                data_timeframe,
                evaluate_in_progress,
                params,
            },
            strategy,
        ))
    }

    fn rehydrate(&mut self, payload: serde_json::Value, version: u64) {
        let (flags, last_action, state) = match payload {
            serde_json::Value::Object(mut map) => {
                let flags = map
                    .remove("flags")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let last_action = map
                    .remove("last_action")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or(SystemAction::NoAction);
                let state = map.remove("state").unwrap_or(serde_json::Value::Null);
                (flags, last_action, state)
            }
            other => (InstanceFlags::default(), SystemAction::NoAction, other),
        };
        self.flags = flags;
        self.last_action = last_action;
        self.state.rehydrate(state, version);
    }

    // --- internals -----------------------------------------------------------

    fn run_hook(
        &mut self,
        hook: &'static str,
        f: impl FnOnce(&mut Box<dyn Strategy>, &mut StrategyCtx<'_>) -> crate::StrategyResult<()>,
    ) {
        if self.flags.errored {
            return;
        }
        let Self {
            strategy,
            state,
            spec,
            ..
        } = self;
        let instrument = spec.instrument.symbol.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = StrategyCtx::new(state, &instrument);
            let result = f(strategy, &mut ctx);
            (result, ctx.completion_requested())
        }));
        match outcome {
            Ok((Ok(()), completion)) => {
                if completion {
                    self.flags.completed = true;
                    self.state.mark_dirty();
                }
            }
            Ok((Err(err), _)) => {
                error!(
                    instance = %self.spec.name,
                    hook,
                    error = %err,
                    severity = "CRITICAL",
                    "strategy hook failed, instance moved to errored state"
                );
                self.flags.errored = true;
            }
            Err(_) => self.mark_panicked(hook),
        }
    }

    fn absorb_outcome(
        &mut self,
        hook: &'static str,
        outcome: Result<crate::StrategyResult<()>, Box<dyn std::any::Any + Send>>,
    ) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(instance = %self.spec.name, hook, error = %err, "strategy hook failed");
                self.flags.errored = true;
            }
            Err(_) => self.mark_panicked(hook),
        }
    }

    fn mark_panicked(&mut self, hook: &'static str) {
        error!(
            instance = %self.spec.name,
            instrument = %self.symbol(),
            hook,
            severity = "CRITICAL",
            "panic escaped strategy callback; instance moved to errored state"
        );
        self.flags.errored = true;
        self.state.mark_dirty();
    }
}

fn field<T: serde::de::DeserializeOwned>(
    object: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> crate::StrategyResult<T> {
    let value = object.get(key).cloned().ok_or_else(|| {
        crate::StrategyError::Internal(format!("strategy snapshot missing '{key}'"))
    })?;
    serde_json::from_value(value).map_err(|err| {
        crate::StrategyError::Internal(format!("strategy snapshot field '{key}': {err}"))
    })
}
