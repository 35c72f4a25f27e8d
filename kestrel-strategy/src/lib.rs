//! Strategy trait definitions, the crash-safe instance harness and the
//! built-in strategy portfolio.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use kestrel_core::{Bar, Order, Portfolio, Price, Quantity, Symbol, SystemAction, Timeframe};

mod instance;
mod state;

pub use instance::{InstanceFlags, InstanceSpec, StrategyInstance};
pub use state::StateContainer;

/// Result alias used within strategy implementations.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants surfaced by strategies.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Raised when a strategy's parameters cannot be parsed or are invalid.
    #[error("configuration is invalid: {0}")]
    InvalidConfig(String),
    /// Raised when the strategy lacks sufficient data to proceed.
    #[error("not enough market data to evaluate")]
    NotEnoughData,
    /// Used for all other errors that should bubble up to the framework.
    #[error("an internal strategy error occurred: {0}")]
    Internal(String),
}

/// What a strategy wants done after processing a bar.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Decision {
    pub action: SystemAction,
    pub quantity: Quantity,
    pub stop_price: Option<Price>,
}

impl Decision {
    /// The no-op decision.
    #[must_use]
    pub fn none() -> Self {
        Self {
            action: SystemAction::NoAction,
            quantity: Decimal::ZERO,
            stop_price: None,
        }
    }

    #[must_use]
    pub fn new(action: SystemAction, quantity: Quantity, stop_price: Option<Price>) -> Self {
        Self {
            action,
            quantity,
            stop_price,
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.action == SystemAction::NoAction
    }
}

impl Default for Decision {
    fn default() -> Self {
        Self::none()
    }
}

/// Operator-submitted signal document a strategy validates against.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignalDoc {
    pub instrument: Symbol,
    pub timeframe: Timeframe,
}

/// Per-callback view handed to strategy hooks: the state container, the
/// bound instrument and the lifecycle controls the framework honors after
/// the callback returns.
pub struct StrategyCtx<'a> {
    pub state: &'a mut StateContainer,
    pub instrument: &'a str,
    completed: bool,
}

impl<'a> StrategyCtx<'a> {
    #[must_use]
    pub fn new(state: &'a mut StateContainer, instrument: &'a str) -> Self {
        Self {
            state,
            instrument,
            completed: false,
        }
    }

    /// Ask the framework to mark this instance completed; a completed
    /// instance never emits another order for the session.
    pub fn set_completed(&mut self) {
        self.completed = true;
    }

    #[must_use]
    pub fn completion_requested(&self) -> bool {
        self.completed
    }
}

/// Base contract every strategy plugin implements.
///
/// Hooks run inside the Trade Manager domain and must not block on I/O.
/// Mutations go through `ctx.state`; the framework observes them and
/// snapshots after the callback.
pub trait Strategy: Send {
    /// Identifier used in logs; usually the registered name.
    fn name(&self) -> &str;

    /// One-time constructor hook; initializes the strategy's state keys.
    fn init(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }

    /// Pre-startup validation of an operator signal. Rejection is final for
    /// the session until the operator re-submits.
    fn validate(&self, signal: &SignalDoc, params: &toml::Value, portfolio: &Portfolio) -> bool;

    /// Bind parameters into instance fields and prepare working buffers.
    fn initialize(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        portfolio: &Portfolio,
        is_first_init: bool,
    ) -> StrategyResult<()>;

    /// The hot path: one bar in, one decision out.
    fn process(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        bar: &Bar,
        portfolio: &Portfolio,
    ) -> StrategyResult<Decision>;

    /// Called exactly once after a restart, before any live bar; the state
    /// container has already been rehydrated.
    fn resume(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        bars_today: &[Bar],
        portfolio: &Portfolio,
        log: &[String],
        now: DateTime<Utc>,
    ) -> StrategyResult<()>;

    fn on_order_accepted(&mut self, _ctx: &mut StrategyCtx<'_>, _order: &Order) -> StrategyResult<()> {
        Ok(())
    }

    fn on_order_filled(
        &mut self,
        _ctx: &mut StrategyCtx<'_>,
        _order: &Order,
        _now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        Ok(())
    }

    fn on_order_error(&mut self, _ctx: &mut StrategyCtx<'_>, _order: &Order) -> StrategyResult<()> {
        Ok(())
    }

    fn on_market_data_error(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }

    fn on_market_data_restore(&mut self, _ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// Strategy registry
// -------------------------------------------------------------------------------------------------

/// Factory contract used to construct strategies from configuration.
pub trait StrategyFactory: Send + Sync {
    /// Canonical, user-facing identifier (e.g. "Sma").
    fn canonical_name(&self) -> &'static str;

    /// Builds a strategy instance with the provided parameters.
    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>>;
}

static STRATEGY_REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn StrategyFactory>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a strategy factory with the global registry.
pub fn register_strategy_factory(factory: Arc<dyn StrategyFactory>) {
    let mut registry = STRATEGY_REGISTRY.write().expect("registry poisoned");
    let key = normalize_name(factory.canonical_name());
    if registry.insert(key, factory.clone()).is_some() {
        tracing::warn!(
            strategy = factory.canonical_name(),
            "duplicate strategy registration detected; overriding previous factory"
        );
    }
}

/// Builds a strategy by name using the registered factories.
pub fn load_strategy(name: &str, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
    let factory = {
        let registry = STRATEGY_REGISTRY.read().expect("registry poisoned");
        registry.get(&normalize_name(name)).cloned()
    };
    factory
        .ok_or_else(|| StrategyError::InvalidConfig(format!("unknown strategy: {name}")))?
        .build(params)
}

/// Returns the registered strategy identifiers in sorted order.
pub fn registered_strategy_names() -> Vec<&'static str> {
    let registry = STRATEGY_REGISTRY.read().expect("registry poisoned");
    let mut names: Vec<&'static str> = registry
        .values()
        .map(|factory| factory.canonical_name())
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// Init hook: make the built-in strategies available.
pub fn register_builtin_strategies() {
    register_strategy_factory(Arc::new(SmaFactory));
    register_strategy_factory(Arc::new(FutmFactory));
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

// -------------------------------------------------------------------------------------------------
// Sma: dual moving-average trend follower
// -------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmaParams {
    pub fast: usize,
    pub slow: usize,
    pub stop_percent: Decimal,
    pub qty: Quantity,
    /// Bars to observe before the first evaluation; defaults to
    /// `fast + slow + 2` when absent.
    pub min_samples: Option<usize>,
}

impl Default for SmaParams {
    fn default() -> Self {
        Self {
            fast: 3,
            slow: 5,
            stop_percent: Decimal::from(2),
            qty: Decimal::from(100),
            min_samples: None,
        }
    }
}

impl SmaParams {
    fn warmup(&self) -> usize {
        self.min_samples.unwrap_or(self.fast + self.slow + 2)
    }
}

/// Dual SMA trend follower: long while the fast average is strictly above
/// the slow one, flat when it drops back below.
pub struct Sma {
    params: SmaParams,
    samples: usize,
}

impl Sma {
    #[must_use]
    pub fn new(params: SmaParams) -> Self {
        Self { params, samples: 0 }
    }

    fn sma(closes: &[Decimal], period: usize) -> Option<Decimal> {
        if period == 0 || closes.len() < period {
            return None;
        }
        let sum: Decimal = closes[closes.len() - period..].iter().copied().sum();
        Some(sum / Decimal::from(period as u64))
    }

    fn push_close(&mut self, ctx: &mut StrategyCtx<'_>, close: Decimal) -> Vec<Decimal> {
        let mut closes: Vec<Decimal> = ctx.state.get_as("closes").unwrap_or_default();
        closes.push(close);
        let keep = self.params.slow.max(self.params.fast);
        if closes.len() > keep {
            closes.drain(..closes.len() - keep);
        }
        ctx.state.set("closes", &closes);
        closes
    }
}

impl Strategy for Sma {
    fn name(&self) -> &str {
        "sma"
    }

    fn init(&mut self, ctx: &mut StrategyCtx<'_>) -> StrategyResult<()> {
        if !ctx.state.contains("closes") {
            ctx.state.set("closes", Vec::<Decimal>::new());
        }
        Ok(())
    }

    fn validate(&self, signal: &SignalDoc, params: &toml::Value, _portfolio: &Portfolio) -> bool {
        let parsed: Result<SmaParams, _> = params.clone().try_into();
        let Ok(parsed) = parsed else {
            tracing::error!(instrument = %signal.instrument, "sma parameters failed to parse");
            return false;
        };
        if parsed.fast == 0 || parsed.slow == 0 || parsed.fast >= parsed.slow {
            tracing::error!(
                instrument = %signal.instrument,
                fast = parsed.fast,
                slow = parsed.slow,
                "sma periods must satisfy 0 < fast < slow"
            );
            return false;
        }
        if parsed.qty <= Decimal::ZERO || parsed.stop_percent < Decimal::ZERO {
            tracing::error!(instrument = %signal.instrument, "sma qty/stop_percent out of range");
            return false;
        }
        true
    }

    fn initialize(
        &mut self,
        _ctx: &mut StrategyCtx<'_>,
        _portfolio: &Portfolio,
        is_first_init: bool,
    ) -> StrategyResult<()> {
        if is_first_init {
            self.samples = 0;
        }
        Ok(())
    }

    fn process(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        bar: &Bar,
        portfolio: &Portfolio,
    ) -> StrategyResult<Decision> {
        if !bar.closed {
            return Ok(Decision::none());
        }
        let closes = self.push_close(ctx, bar.close);
        self.samples += 1;
        ctx.state.set("samples", self.samples);
        if self.samples < self.params.warmup() {
            return Ok(Decision::none());
        }
        let (Some(fast), Some(slow)) = (
            Self::sma(&closes, self.params.fast),
            Self::sma(&closes, self.params.slow),
        ) else {
            return Ok(Decision::none());
        };

        let position = portfolio.quantity(ctx.instrument);

        if fast > slow && position <= Decimal::ZERO {
            let hundred = Decimal::from(100);
            let stop = bar.close * (Decimal::ONE - self.params.stop_percent / hundred);
            return Ok(Decision::new(
                SystemAction::Buy,
                self.params.qty,
                Some(stop),
            ));
        }
        if fast < slow && position > Decimal::ZERO {
            return Ok(Decision::new(SystemAction::Flat, position, None));
        }
        Ok(Decision::none())
    }

    fn resume(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        bars_today: &[Bar],
        _portfolio: &Portfolio,
        _log: &[String],
        _now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        // Rebuild the averages from the day's closed bars; the rehydrated
        // container already carries the pre-crash sample counter.
        let mut closes: Vec<Decimal> = Vec::new();
        let mut samples = 0usize;
        for bar in bars_today.iter().filter(|bar| bar.closed) {
            closes.push(bar.close);
            samples += 1;
        }
        let keep = self.params.slow.max(self.params.fast);
        if closes.len() > keep {
            closes.drain(..closes.len() - keep);
        }
        self.samples = ctx.state.get_as("samples").unwrap_or(samples);
        ctx.state.set("closes", &closes);
        Ok(())
    }
}

struct SmaFactory;

impl StrategyFactory for SmaFactory {
    fn canonical_name(&self) -> &'static str {
        "Sma"
    }

    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
        let params: SmaParams = params.try_into().map_err(|err: toml::de::Error| {
            StrategyError::InvalidConfig(format!("failed to parse Sma params: {err}"))
        })?;
        if params.fast == 0 || params.slow == 0 || params.fast >= params.slow {
            return Err(StrategyError::InvalidConfig(
                "sma periods must satisfy 0 < fast < slow".into(),
            ));
        }
        Ok(Box::new(Sma::new(params)))
    }
}

// -------------------------------------------------------------------------------------------------
// Futm: one-shot signal executor
// -------------------------------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct FutmParams {
    pub signal: String,
    pub qty: Quantity,
    pub stop_percent: Decimal,
}

impl Default for FutmParams {
    fn default() -> Self {
        Self {
            signal: String::new(),
            qty: Decimal::ZERO,
            stop_percent: Decimal::from(2),
        }
    }
}

/// Executes one operator-configured directional signal on the first
/// completed bar, then completes once the resulting order fills.
pub struct Futm {
    params: FutmParams,
}

impl Futm {
    #[must_use]
    pub fn new(params: FutmParams) -> Self {
        Self { params }
    }

    fn configured_action(&self) -> SystemAction {
        match self.params.signal.as_str() {
            "BUY" => SystemAction::Buy,
            "SELL" => SystemAction::Sell,
            "FLAT" => SystemAction::Flat,
            "HOLD" => SystemAction::Hold,
            _ => SystemAction::NoAction,
        }
    }
}

impl Strategy for Futm {
    fn name(&self) -> &str {
        "futm"
    }

    fn validate(&self, signal: &SignalDoc, params: &toml::Value, _portfolio: &Portfolio) -> bool {
        let parsed: Result<FutmParams, _> = params.clone().try_into();
        let Ok(parsed) = parsed else {
            tracing::error!(instrument = %signal.instrument, "futm parameters failed to parse");
            return false;
        };
        if !matches!(parsed.signal.as_str(), "BUY" | "SELL" | "FLAT" | "HOLD") {
            tracing::error!(
                instrument = %signal.instrument,
                signal = %parsed.signal,
                "futm signal must be one of BUY/SELL/FLAT/HOLD"
            );
            return false;
        }
        if matches!(parsed.signal.as_str(), "BUY" | "SELL") && parsed.qty <= Decimal::ZERO {
            tracing::error!(instrument = %signal.instrument, "futm qty must be positive");
            return false;
        }
        true
    }

    fn initialize(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        _portfolio: &Portfolio,
        is_first_init: bool,
    ) -> StrategyResult<()> {
        if is_first_init {
            ctx.state.set("executed", false);
        }
        Ok(())
    }

    fn process(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        bar: &Bar,
        portfolio: &Portfolio,
    ) -> StrategyResult<Decision> {
        if !bar.closed || ctx.state.get_as("executed").unwrap_or(false) {
            return Ok(Decision::none());
        }
        let action = self.configured_action();
        if !action.creates_order() {
            // HOLD and friends are reporting-only; nothing left to do.
            ctx.set_completed();
            return Ok(Decision::new(action, Decimal::ZERO, None));
        }
        let hundred = Decimal::from(100);
        let stop = match action {
            SystemAction::Buy => {
                Some(bar.close * (Decimal::ONE - self.params.stop_percent / hundred))
            }
            SystemAction::Sell => {
                Some(bar.close * (Decimal::ONE + self.params.stop_percent / hundred))
            }
            _ => None,
        };
        let qty = if action == SystemAction::Flat {
            portfolio.quantity(ctx.instrument).abs()
        } else {
            self.params.qty
        };
        ctx.state.set("executed", true);
        Ok(Decision::new(action, qty, stop))
    }

    fn resume(
        &mut self,
        _ctx: &mut StrategyCtx<'_>,
        _bars_today: &[Bar],
        _portfolio: &Portfolio,
        _log: &[String],
        _now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        // The `executed` flag is rehydrated with the container; nothing to
        // recompute.
        Ok(())
    }

    fn on_order_filled(
        &mut self,
        ctx: &mut StrategyCtx<'_>,
        _order: &Order,
        _now: DateTime<Utc>,
    ) -> StrategyResult<()> {
        ctx.set_completed();
        Ok(())
    }
}

struct FutmFactory;

impl StrategyFactory for FutmFactory {
    fn canonical_name(&self) -> &'static str {
        "Futm"
    }

    fn build(&self, params: toml::Value) -> StrategyResult<Box<dyn Strategy>> {
        let params: FutmParams = params.try_into().map_err(|err: toml::de::Error| {
            StrategyError::InvalidConfig(format!("failed to parse Futm params: {err}"))
        })?;
        Ok(Box::new(Futm::new(params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn closed_bar(ts: i64, close: Decimal) -> Bar {
        Bar {
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            closed: true,
        }
    }

    fn sma_params() -> toml::Value {
        let mut table = toml::value::Table::new();
        table.insert("fast".into(), toml::Value::Integer(3));
        table.insert("slow".into(), toml::Value::Integer(5));
        table.insert("stop_percent".into(), toml::Value::Float(2.0));
        toml::Value::Table(table)
    }

    fn run_sma(closes: &[Decimal], portfolio: &Portfolio) -> Vec<Decision> {
        let params: SmaParams = sma_params().try_into().unwrap();
        let mut strategy = Sma::new(params);
        let mut state = StateContainer::new();
        let mut decisions = Vec::new();
        let mut ctx = StrategyCtx::new(&mut state, "FTSE");
        strategy.init(&mut ctx).unwrap();
        strategy.initialize(&mut ctx, portfolio, true).unwrap();
        for (i, close) in closes.iter().enumerate() {
            let bar = closed_bar(1_700_000_000 + (i as i64) * 300, *close);
            let mut ctx = StrategyCtx::new(&mut state, "FTSE");
            decisions.push(strategy.process(&mut ctx, &bar, portfolio).unwrap());
        }
        decisions
    }

    #[test]
    fn golden_cross_fires_a_buy_with_exact_stop() {
        let closes: Vec<Decimal> = [10, 10, 10, 10, 10, 10, 11, 12, 13, 14]
            .iter()
            .map(|n| Decimal::from(*n))
            .collect();
        let decisions = run_sma(&closes, &Portfolio::default());
        // Nothing before the warmup window completes.
        for decision in &decisions[..9] {
            assert!(decision.is_noop());
        }
        let fire = &decisions[9];
        assert_eq!(fire.action, SystemAction::Buy);
        assert_eq!(fire.quantity, dec!(100));
        assert_eq!(fire.stop_price, Some(dec!(13.72)));
    }

    #[test]
    fn flat_sequence_never_fires() {
        let closes = vec![dec!(20); 20];
        let decisions = run_sma(&closes, &Portfolio::default());
        assert!(decisions.iter().all(Decision::is_noop));
    }

    #[test]
    fn death_cross_flattens_an_open_position() {
        let mut portfolio = Portfolio::default();
        portfolio.upsert(
            "FTSE",
            kestrel_core::PositionSnapshot {
                quantity: dec!(100),
                average_price: dec!(14),
                unrealized_pnl: None,
            },
        );
        let closes: Vec<Decimal> = [10, 10, 10, 10, 10, 10, 11, 12, 13, 14, 13, 12, 11, 10, 9]
            .iter()
            .map(|n| Decimal::from(*n))
            .collect();
        let decisions = run_sma(&closes, &portfolio);
        let flats: Vec<usize> = decisions
            .iter()
            .enumerate()
            .filter(|(_, d)| d.action == SystemAction::Flat)
            .map(|(i, _)| i)
            .collect();
        assert!(!flats.is_empty(), "death cross must flatten");
        // First flat fires at the bar where fast drops below slow (index 12).
        assert_eq!(flats[0], 12);
        assert_eq!(decisions[flats[0]].quantity, dec!(100));
    }

    #[test]
    fn sma_validate_rejects_bad_periods() {
        let strategy = Sma::new(SmaParams::default());
        let signal = SignalDoc {
            instrument: "FTSE".into(),
            timeframe: Timeframe::FIVE_MINUTES,
        };
        let mut table = toml::value::Table::new();
        table.insert("fast".into(), toml::Value::Integer(5));
        table.insert("slow".into(), toml::Value::Integer(3));
        assert!(!strategy.validate(
            &signal,
            &toml::Value::Table(table),
            &Portfolio::default()
        ));
        assert!(strategy.validate(&signal, &sma_params(), &Portfolio::default()));
    }

    #[test]
    fn futm_executes_once_and_completes_on_fill() {
        let mut strategy = Futm::new(FutmParams {
            signal: "BUY".into(),
            qty: dec!(10),
            stop_percent: dec!(2),
        });
        let mut state = StateContainer::new();
        let portfolio = Portfolio::default();
        {
            let mut ctx = StrategyCtx::new(&mut state, "FTSE");
            strategy.initialize(&mut ctx, &portfolio, true).unwrap();
        }
        let bar = closed_bar(1_700_000_000, dec!(50));
        let decision = {
            let mut ctx = StrategyCtx::new(&mut state, "FTSE");
            strategy.process(&mut ctx, &bar, &portfolio).unwrap()
        };
        assert_eq!(decision.action, SystemAction::Buy);
        assert_eq!(decision.stop_price, Some(dec!(49)));

        // Second bar: already executed, no repeat.
        let decision = {
            let mut ctx = StrategyCtx::new(&mut state, "FTSE");
            strategy
                .process(&mut ctx, &closed_bar(1_700_000_300, dec!(51)), &portfolio)
                .unwrap()
        };
        assert!(decision.is_noop());

        // Fill completes the instance.
        let order = Order::from_draft(
            kestrel_core::OrderDraft {
                instrument: "FTSE".into(),
                side: kestrel_core::Side::Buy,
                op: kestrel_core::OrderOp::Open,
                quantity: dec!(10),
                stop_price: None,
                limit_price: None,
                author: kestrel_core::OrderAuthor::System,
                strategy_id: None,
                on_filled: None,
            },
            Utc::now(),
        );
        let mut ctx = StrategyCtx::new(&mut state, "FTSE");
        strategy.on_order_filled(&mut ctx, &order, Utc::now()).unwrap();
        assert!(ctx.completion_requested());
    }

    #[test]
    fn registry_builds_by_name() {
        register_builtin_strategies();
        assert!(registered_strategy_names().contains(&"Sma"));
        let strategy = load_strategy("sma", sma_params()).unwrap();
        assert_eq!(strategy.name(), "sma");
        assert!(load_strategy("nope", toml::Value::Table(Default::default())).is_err());
    }
}
