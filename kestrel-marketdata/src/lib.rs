//! Market data routing: one live broker subscription per instrument, bar
//! promotion from broker-native to strategy-native timeframes, and gap /
//! freshness detection.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use kestrel_core::{Bar, Symbol, Timeframe};

mod aggregator;

pub use aggregator::BarAggregator;

/// Result alias for router operations.
pub type MarketDataResult<T> = Result<T, MarketDataError>;

#[derive(Debug, Error)]
pub enum MarketDataError {
    /// The strategy timeframe cannot be assembled from whole broker bars.
    #[error("timeframe {target} is not a multiple of broker timeframe {base}")]
    UnevenTimeframes { base: Timeframe, target: Timeframe },
    #[error("instrument '{0}' has no subscription entry")]
    UnknownInstrument(Symbol),
}

/// Consecutive resubscription failures tolerated before the instrument is
/// marked DATA_ERROR and its strategies get blocked.
pub const MAX_RESUBSCRIBE_FAILURES: u32 = 5;

/// Health of one instrument's market data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeedState {
    /// Broker subscription requested, no ack yet.
    Pending,
    Live,
    /// Watchdog fired; waiting on a resubscription ack.
    Stale,
    /// Resubscription budget exhausted.
    DataError,
}

struct Subscriber {
    strategy_id: Uuid,
    aggregator: BarAggregator,
}

struct Entry {
    base: Timeframe,
    state: FeedState,
    last_bar_at: Option<DateTime<Utc>>,
    resubscribe_failures: u32,
    subscribers: Vec<Subscriber>,
}

/// What the engine must do after a router operation.
#[derive(Debug, Eq, PartialEq)]
pub enum SubscribeOutcome {
    /// First subscriber: ask the adapter for a live subscription.
    NeedsBrokerSubscribe,
    /// The instrument already has a live subscription.
    AlreadyLive,
}

#[derive(Debug)]
pub enum AckOutcome {
    /// Initial subscription established.
    Live,
    /// A stale feed recovered: emit `on_market_data_restore` to these
    /// strategies, exactly once.
    Restored(Vec<Uuid>),
    /// Subscription failed; retry unless `blocked`.
    Failed {
        attempts: u32,
        blocked: bool,
        subscribers: Vec<Uuid>,
    },
}

#[derive(Debug)]
pub struct StalenessAlert {
    pub instrument: Symbol,
    /// Strategies to notify via `on_market_data_error`.
    pub subscribers: Vec<Uuid>,
}

/// Maintains the (instrument -> subscribers) map and fans broker bars out to
/// per-strategy aggregators.
pub struct MarketDataRouter {
    entries: HashMap<Symbol, Entry>,
    staleness_floor: Duration,
}

impl Default for MarketDataRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketDataRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            staleness_floor: Duration::seconds(60),
        }
    }

    /// Override the 60-second freshness floor (used by fast test rigs).
    pub fn set_staleness_floor(&mut self, floor: Duration) {
        self.staleness_floor = floor;
    }

    /// Register a strategy on an instrument. Rejects uneven timeframe pairs
    /// (validated again here even though strategy validation already checks).
    pub fn subscribe(
        &mut self,
        strategy_id: Uuid,
        instrument: &str,
        base: Timeframe,
        target: Timeframe,
    ) -> MarketDataResult<SubscribeOutcome> {
        let aggregator = BarAggregator::new(base, target)?;
        match self.entries.get_mut(instrument) {
            Some(entry) => {
                entry.subscribers.retain(|sub| sub.strategy_id != strategy_id);
                entry.subscribers.push(Subscriber {
                    strategy_id,
                    aggregator,
                });
                Ok(SubscribeOutcome::AlreadyLive)
            }
            None => {
                self.entries.insert(
                    instrument.to_string(),
                    Entry {
                        base,
                        state: FeedState::Pending,
                        last_bar_at: None,
                        resubscribe_failures: 0,
                        subscribers: vec![Subscriber {
                            strategy_id,
                            aggregator,
                        }],
                    },
                );
                Ok(SubscribeOutcome::NeedsBrokerSubscribe)
            }
        }
    }

    /// Remove a strategy; returns true when the broker-side subscription
    /// should be torn down (no subscribers left).
    pub fn unsubscribe(&mut self, strategy_id: Uuid, instrument: &str) -> bool {
        if let Some(entry) = self.entries.get_mut(instrument) {
            entry.subscribers.retain(|sub| sub.strategy_id != strategy_id);
            if entry.subscribers.is_empty() {
                self.entries.remove(instrument);
                return true;
            }
        }
        false
    }

    /// Apply a subscription ack from the adapter.
    pub fn on_subscription_ack(
        &mut self,
        instrument: &str,
        ok: bool,
        now: DateTime<Utc>,
    ) -> MarketDataResult<AckOutcome> {
        let entry = self
            .entries
            .get_mut(instrument)
            .ok_or_else(|| MarketDataError::UnknownInstrument(instrument.to_string()))?;
        if ok {
            let was_stale = entry.state == FeedState::Stale;
            entry.state = FeedState::Live;
            entry.resubscribe_failures = 0;
            entry.last_bar_at = Some(now);
            if was_stale {
                Ok(AckOutcome::Restored(
                    entry.subscribers.iter().map(|s| s.strategy_id).collect(),
                ))
            } else {
                Ok(AckOutcome::Live)
            }
        } else {
            entry.resubscribe_failures += 1;
            let blocked = entry.resubscribe_failures >= MAX_RESUBSCRIBE_FAILURES;
            if blocked {
                entry.state = FeedState::DataError;
                warn!(
                    instrument,
                    failures = entry.resubscribe_failures,
                    "instrument marked DATA_ERROR"
                );
            }
            Ok(AckOutcome::Failed {
                attempts: entry.resubscribe_failures,
                blocked,
                subscribers: entry.subscribers.iter().map(|s| s.strategy_id).collect(),
            })
        }
    }

    /// Route one broker bar: refresh freshness, run every subscriber's
    /// aggregator, return the (strategy, bar) deliveries in order.
    pub fn on_bar(
        &mut self,
        instrument: &str,
        bar: &Bar,
        now: DateTime<Utc>,
    ) -> Vec<(Uuid, Bar)> {
        let Some(entry) = self.entries.get_mut(instrument) else {
            debug!(instrument, "bar for unsubscribed instrument dropped");
            return Vec::new();
        };
        entry.last_bar_at = Some(now);
        if entry.state == FeedState::Pending {
            entry.state = FeedState::Live;
        }
        let mut deliveries = Vec::new();
        for sub in &mut entry.subscribers {
            for out in sub.aggregator.update(bar) {
                deliveries.push((sub.strategy_id, out));
            }
        }
        deliveries
    }

    /// Watchdog: instruments silent for `max(5*B, 60s)` during trading
    /// hours become stale; the caller notifies subscribers and requests a
    /// resubscription.
    pub fn check_staleness(&mut self, now: DateTime<Utc>) -> Vec<StalenessAlert> {
        let mut alerts = Vec::new();
        for (instrument, entry) in &mut self.entries {
            if entry.state != FeedState::Live {
                continue;
            }
            let Some(last) = entry.last_bar_at else {
                continue;
            };
            let five_bars = entry.base.as_duration() * 5;
            let threshold = if five_bars > self.staleness_floor {
                five_bars
            } else {
                self.staleness_floor
            };
            if now - last >= threshold {
                entry.state = FeedState::Stale;
                warn!(
                    instrument = instrument.as_str(),
                    silent_secs = (now - last).num_seconds(),
                    "market data stale"
                );
                alerts.push(StalenessAlert {
                    instrument: instrument.clone(),
                    subscribers: entry.subscribers.iter().map(|s| s.strategy_id).collect(),
                });
            }
        }
        alerts
    }

    /// Feed state for one instrument, if tracked.
    #[must_use]
    pub fn feed_state(&self, instrument: &str) -> Option<FeedState> {
        self.entries.get(instrument).map(|entry| entry.state)
    }

    /// Instruments currently needing a (re)subscription request.
    #[must_use]
    pub fn stale_instruments(&self) -> Vec<Symbol> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == FeedState::Stale)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }
}

/// `max(5*B, 60s)` per the freshness contract.
#[must_use]
pub fn staleness_threshold(base: Timeframe) -> Duration {
    let five_bars = base.as_duration() * 5;
    let floor = Duration::seconds(60);
    if five_bars > floor {
        five_bars
    } else {
        floor
    }
}
