//! Fundamental data types shared across the entire workspace.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Engine-side instrument code (the "epic" in client documents).
pub type Symbol = String;

/// Immutable metadata describing a tradable instrument.
///
/// `symbol` is the stable engine-side code; `broker_symbol` is whatever the
/// active broker calls the same market.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Instrument {
    pub symbol: Symbol,
    pub broker_symbol: String,
    pub description: String,
    pub currency: String,
    /// Strategy-native timeframe the instrument is traded on.
    pub timeframe: Timeframe,
}

/// Bar/aggregation interval expressed in whole seconds.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Timeframe(u32);

impl Timeframe {
    pub const ONE_MINUTE: Timeframe = Timeframe(60);
    pub const FIVE_MINUTES: Timeframe = Timeframe(300);

    /// Build a timeframe from a positive number of seconds.
    #[must_use]
    pub fn from_secs(secs: u32) -> Option<Self> {
        (secs > 0).then_some(Self(secs))
    }

    #[must_use]
    pub fn as_secs(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::seconds(i64::from(self.0))
    }

    /// True when `self` can be assembled from whole bars of `base`.
    #[must_use]
    pub fn is_multiple_of(self, base: Timeframe) -> bool {
        self.0 >= base.0 && self.0 % base.0 == 0
    }

    /// Align a timestamp down to the start of its window.
    #[must_use]
    pub fn window_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let span = i64::from(self.0);
        DateTime::from_timestamp(secs - secs.rem_euclid(span), 0).unwrap_or(ts)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 3600 == 0 {
            write!(f, "{}h", self.0 / 3600)
        } else if self.0 % 60 == 0 {
            write!(f, "{}m", self.0 / 60)
        } else {
            write!(f, "{}s", self.0)
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        let (digits, unit) = value.split_at(value.len().saturating_sub(1));
        let parse = |digits: &str, mult: u32| -> Result<Timeframe, String> {
            let n: u32 = digits
                .parse()
                .map_err(|_| format!("unsupported timeframe '{value}'"))?;
            Timeframe::from_secs(n * mult).ok_or_else(|| format!("timeframe '{value}' is zero"))
        };
        match unit {
            "s" => parse(digits, 1),
            "m" => parse(digits, 60),
            "h" => parse(digits, 3600),
            _ => parse(&value, 1),
        }
    }
}

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed unit used when applying quantities to a position.
    #[must_use]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

/// OHLCV sample for an instrument over a single time window.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: Quantity,
    /// True on the bar that completes its window; in-progress bars carry false.
    pub closed: bool,
}

impl Bar {
    /// OHLC sanity: low <= min(open, close) <= max(open, close) <= high, volume >= 0.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.low <= body_low && body_high <= self.high && self.volume >= Decimal::ZERO
    }
}

/// Closed action set returned by strategies.
///
/// Only `Buy`, `Sell`, `BuySell`, `Flat` and `Stpr` cause an order to be
/// created; the remaining values are reporting flags carried on the instance.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum SystemAction {
    #[default]
    NoAction,
    Delay,
    PreBuy,
    Buy,
    PreSell,
    Sell,
    BuyLost,
    SellLost,
    BuySell,
    Hold,
    Flat,
    Stpr,
}

impl SystemAction {
    /// Integer encoding used on the client wire.
    #[must_use]
    pub fn wire_code(self) -> u8 {
        match self {
            Self::NoAction => 0,
            Self::Delay => 1,
            Self::PreBuy => 2,
            Self::Buy => 3,
            Self::PreSell => 4,
            Self::Sell => 5,
            Self::BuyLost => 6,
            Self::SellLost => 7,
            Self::BuySell => 8,
            Self::Hold => 9,
            Self::Flat => 10,
            Self::Stpr => 11,
        }
    }

    /// True when the action translates into an order.
    #[must_use]
    pub fn creates_order(self) -> bool {
        matches!(
            self,
            Self::Buy | Self::Sell | Self::BuySell | Self::Flat | Self::Stpr
        )
    }
}

/// What an order asks the broker to do with the position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderOp {
    /// Open (or extend) a position.
    Open,
    /// Close (or reduce) the position.
    Close,
    /// Move the protective stop on an open position.
    UpdateStop,
}

/// Who originated an order.
///
/// Failures of `System` and `Restart` orders put the owning strategy into the
/// errored state; `User` order failures only alert the operator.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderAuthor {
    System,
    Restart,
    User,
}

/// Lifecycle states of a tracked order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderState {
    Draft,
    Submitting,
    Submitted,
    Accepted,
    Partial,
    Filled,
    Rejected,
    Cancelling,
    Cancelled,
    Error,
}

impl OrderState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Rejected | Self::Cancelled | Self::Error
        )
    }

    /// Collapse to the deal-status code clients expect
    /// (NOT_SUBMITTED=0, DELAYED=1, SUBMITTING=2, SUBMITTED=3, EXECUTING=4, REJECTED=5).
    #[must_use]
    pub fn deal_status(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Submitting => 2,
            Self::Submitted | Self::Accepted => 3,
            Self::Partial | Self::Cancelling | Self::Filled => 4,
            Self::Rejected | Self::Error | Self::Cancelled => 5,
        }
    }
}

/// Execution information recorded whenever the broker reports a fill.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Fill {
    pub price: Price,
    pub quantity: Quantity,
    pub timestamp: DateTime<Utc>,
}

/// Follow-up emitted after a closing order fills (position reversal).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FollowUpAction {
    pub action: SystemAction,
    pub quantity: Quantity,
    pub stop_price: Option<Price>,
}

/// Immutable request to create an order, produced by action translation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderDraft {
    pub instrument: Symbol,
    pub side: Side,
    pub op: OrderOp,
    pub quantity: Quantity,
    pub stop_price: Option<Price>,
    pub limit_price: Option<Price>,
    pub author: OrderAuthor,
    /// Strategy instance the order belongs to, when system-originated.
    pub strategy_id: Option<Uuid>,
    pub on_filled: Option<FollowUpAction>,
}

/// An order as tracked by the engine across its whole lifecycle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub id: Uuid,
    /// Broker-issued opaque identifier, set once the broker accepts.
    pub deal_reference: Option<String>,
    pub instrument: Symbol,
    pub side: Side,
    pub op: OrderOp,
    pub quantity: Quantity,
    pub stop_price: Option<Price>,
    pub limit_price: Option<Price>,
    pub author: OrderAuthor,
    pub strategy_id: Option<Uuid>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    pub fills: Vec<Fill>,
    pub error: Option<String>,
    pub on_filled: Option<FollowUpAction>,
}

impl Order {
    /// Materialize a draft into a tracked order in the `Draft` state.
    #[must_use]
    pub fn from_draft(draft: OrderDraft, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            deal_reference: None,
            instrument: draft.instrument,
            side: draft.side,
            op: draft.op,
            quantity: draft.quantity.abs(),
            stop_price: draft.stop_price,
            limit_price: draft.limit_price,
            author: draft.author,
            strategy_id: draft.strategy_id,
            state: OrderState::Draft,
            created_at: now,
            last_modified_at: now,
            fills: Vec::new(),
            error: None,
            on_filled: draft.on_filled,
        }
    }

    /// Quantity filled so far across all partial executions.
    #[must_use]
    pub fn filled_quantity(&self) -> Quantity {
        self.fills.iter().map(|fill| fill.quantity).sum()
    }

    /// Volume-weighted average fill price, when any fill exists.
    #[must_use]
    pub fn avg_fill_price(&self) -> Option<Price> {
        let filled = self.filled_quantity();
        if filled.is_zero() {
            return None;
        }
        let notional: Price = self
            .fills
            .iter()
            .map(|fill| fill.price * fill.quantity)
            .sum();
        Some(notional / filled)
    }
}

/// Broker-authoritative view of a single position.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PositionSnapshot {
    /// Signed quantity: positive long, negative short.
    pub quantity: Quantity,
    pub average_price: Price,
    pub unrealized_pnl: Option<Price>,
}

/// Portfolio snapshot keyed by instrument. The engine only ever reads it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Portfolio(pub HashMap<Symbol, PositionSnapshot>);

impl Portfolio {
    /// Signed position quantity for an instrument (zero when flat).
    #[must_use]
    pub fn quantity(&self, symbol: &str) -> Quantity {
        self.0
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&PositionSnapshot> {
        self.0.get(symbol)
    }

    pub fn upsert(&mut self, symbol: impl Into<Symbol>, position: PositionSnapshot) {
        self.0.insert(symbol.into(), position);
    }
}

/// Normalized account information delivered by the broker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub account_name: String,
    pub currency: String,
    pub cash: Price,
    pub used_margin: Price,
    pub pnl: Price,
    pub updated_at: DateTime<Utc>,
}

/// Connection state of one broker channel (API or market feed).
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    Failed,
}

/// Recognized session states for a trading day.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SessionState {
    Pending,
    Open,
    Closed,
    Error,
}

/// A single trading day's activity for the account this instance serves.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub trading_day: NaiveDate,
    pub account: String,
    pub state: SessionState,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn pending(trading_day: NaiveDate, account: impl Into<String>) -> Self {
        Self {
            trading_day,
            account: account.into(),
            state: SessionState::Pending,
            opened_at: None,
            closed_at: None,
        }
    }
}

/// User-visible severities surfaced by the engine.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum AlertSeverity {
    /// Degradation the engine recovers from on its own.
    Warning,
    /// Manual intervention required.
    Critical,
}

/// Operator alert delivered via the client channel and the log shipper.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub topic: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    #[must_use]
    pub fn new(severity: AlertSeverity, topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            topic: topic.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
