//! Promotion of broker-native bars into strategy-native windows.

use chrono::{DateTime, Utc};
use kestrel_core::{Bar, Price, Quantity, Timeframe};
use rust_decimal::Decimal;
use tracing::debug;

use crate::{MarketDataError, MarketDataResult};

#[derive(Clone, Debug)]
struct Window {
    start: DateTime<Utc>,
    open: Price,
    high: Price,
    low: Price,
    close: Price,
    volume: Quantity,
}

impl Window {
    fn begin(start: DateTime<Utc>, bar: &Bar) -> Self {
        Self {
            start,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }

    fn absorb(&mut self, bar: &Bar) {
        self.high = self.high.max(bar.high);
        self.low = self.low.min(bar.low);
        self.close = bar.close;
        self.volume += bar.volume;
    }

    fn snapshot(&self, closed: bool) -> Bar {
        Bar {
            timestamp: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            closed,
        }
    }
}

/// Aggregates broker bars of timeframe B into strategy bars of timeframe T.
///
/// For a window `[w, w+T)`: open is the first open, close the last close,
/// high/low the extremes and volume the sum. The completed bar (closed=true)
/// is emitted on the first broker bar whose timestamp reaches `w+T`; every
/// broker bar inside the window additionally yields an in-progress snapshot
/// (closed=false) so strategies may peek at partial windows. Aggregated bars
/// are stamped with their window start; a window that has emitted its closed
/// bar is never produced again, so replays after a resubscribe can only add
/// a fresh in-progress bar, never a retrograde closed one.
#[derive(Debug)]
pub struct BarAggregator {
    base: Timeframe,
    target: Timeframe,
    window: Option<Window>,
    last_closed: Option<DateTime<Utc>>,
}

impl BarAggregator {
    pub fn new(base: Timeframe, target: Timeframe) -> MarketDataResult<Self> {
        if !target.is_multiple_of(base) {
            return Err(MarketDataError::UnevenTimeframes { base, target });
        }
        Ok(Self {
            base,
            target,
            window: None,
            last_closed: None,
        })
    }

    #[must_use]
    pub fn base(&self) -> Timeframe {
        self.base
    }

    #[must_use]
    pub fn target(&self) -> Timeframe {
        self.target
    }

    /// Feed one broker bar; returns zero, one or two aggregated bars
    /// (a closed prior window followed by the new in-progress snapshot).
    pub fn update(&mut self, bar: &Bar) -> Vec<Bar> {
        let window_start = self.target.window_start(bar.timestamp);
        if let Some(last_closed) = self.last_closed {
            if window_start <= last_closed {
                debug!(
                    ts = %bar.timestamp,
                    "broker bar belongs to an already-closed window, dropped"
                );
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        match self.window.as_mut() {
            Some(window) if window.start == window_start => {
                window.absorb(bar);
                out.push(window.snapshot(false));
            }
            Some(window) if window_start < window.start => {
                debug!(ts = %bar.timestamp, "out-of-order broker bar dropped");
            }
            Some(window) => {
                // First bar at or past w+T completes the previous window.
                out.push(window.snapshot(true));
                self.last_closed = Some(window.start);
                let fresh = Window::begin(window_start, bar);
                out.push(fresh.snapshot(false));
                self.window = Some(fresh);
            }
            None => {
                let fresh = Window::begin(window_start, bar);
                out.push(fresh.snapshot(false));
                self.window = Some(fresh);
            }
        }
        out
    }
}
