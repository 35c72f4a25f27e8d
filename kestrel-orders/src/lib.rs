//! Order lifecycle tracking.
//!
//! One state machine per outstanding order. Every transition is written to
//! the append-only order event log *before* anyone is notified, so the
//! persisted history always forms a directed path through the legal
//! transition table and recovery can trust the last row.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use kestrel_core::{Fill, Order, OrderDraft, OrderState, Symbol};
use kestrel_store::{Store, StoreError};

/// Result alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown order {0}")]
    UnknownOrder(Uuid),
    #[error("illegal transition from {from:?} on {event}")]
    IllegalTransition { from: OrderState, event: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Normalized broker-side outcomes applied to a tracked order.
#[derive(Clone, Debug)]
pub enum BrokerOrderEvent {
    Accepted { deal_reference: String },
    Rejected { reason: String },
    Fill(Fill),
    CancelAcknowledged,
    Fatal { reason: String },
}

impl BrokerOrderEvent {
    fn label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "broker accept",
            Self::Rejected { .. } => "broker reject",
            Self::Fill(_) => "fill",
            Self::CancelAcknowledged => "cancel ack",
            Self::Fatal { .. } => "fatal broker error",
        }
    }
}

/// What happened to an order, handed back so the engine can drive the
/// owning strategy's event hooks.
#[derive(Clone, Debug)]
pub enum OrderUpdate {
    Accepted(Order),
    PartiallyFilled(Order),
    Filled(Order),
    Rejected(Order),
    Cancelled(Order),
    Errored(Order),
    /// Submit window elapsed; the engine should attempt a broker-side cancel.
    TimedOut(Order),
}

/// Owns the order set and is the sole writer of `Order::state`.
pub struct OrderTracker {
    store: Arc<Store>,
    orders: HashMap<Uuid, Order>,
    submit_deadlines: HashMap<Uuid, DateTime<Utc>>,
    reconcile: HashSet<Uuid>,
    submit_timeout: Duration,
}

impl OrderTracker {
    #[must_use]
    pub fn new(store: Arc<Store>, submit_timeout: Duration) -> Self {
        Self {
            store,
            orders: HashMap::new(),
            submit_deadlines: HashMap::new(),
            reconcile: HashSet::new(),
            submit_timeout,
        }
    }

    /// Reserve an engine identifier for a draft. Nothing is persisted until
    /// the first transition (`submit`).
    pub fn create(&mut self, draft: OrderDraft, now: DateTime<Utc>) -> Uuid {
        let order = Order::from_draft(draft, now);
        let id = order.id;
        self.orders.insert(id, order);
        id
    }

    /// Re-insert an order recovered from the persisted open set.
    pub fn adopt(&mut self, order: Order, now: DateTime<Utc>) {
        if order.state == OrderState::Submitting {
            self.submit_deadlines.insert(order.id, now + self.submit_timeout);
        }
        self.orders.insert(order.id, order);
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Orders not yet in a terminal state.
    #[must_use]
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .values()
            .filter(|order| !order.state.is_terminal())
            .cloned()
            .collect()
    }

    /// True while any order for the instrument is between submit and a
    /// terminal state; strategies must not stack actions on top of it.
    #[must_use]
    pub fn has_inflight(&self, instrument: &str) -> bool {
        self.orders.values().any(|order| {
            order.instrument == instrument
                && matches!(
                    order.state,
                    OrderState::Submitting
                        | OrderState::Submitted
                        | OrderState::Partial
                        | OrderState::Cancelling
                )
        })
    }

    /// Orders flagged for reconciliation at the next portfolio refresh.
    pub fn take_reconciliation(&mut self) -> Vec<Uuid> {
        self.reconcile.drain().collect()
    }

    /// Draft -> Submitting. Returns the order snapshot to hand the adapter.
    pub fn submit(&mut self, id: Uuid, now: DateTime<Utc>) -> TrackerResult<Order> {
        let order = self.orders.get(&id).ok_or(TrackerError::UnknownOrder(id))?;
        if order.state != OrderState::Draft {
            return Err(TrackerError::IllegalTransition {
                from: order.state,
                event: "submit".into(),
            });
        }
        let updated = self.transition(id, OrderState::Submitting, now, |_| {})?;
        self.submit_deadlines.insert(id, now + self.submit_timeout);
        Ok(updated)
    }

    /// Submitted|Partial -> Cancelling. Returns the snapshot for the adapter.
    pub fn cancel(&mut self, id: Uuid, now: DateTime<Utc>) -> TrackerResult<Order> {
        let order = self.orders.get(&id).ok_or(TrackerError::UnknownOrder(id))?;
        if !matches!(order.state, OrderState::Submitted | OrderState::Partial) {
            return Err(TrackerError::IllegalTransition {
                from: order.state,
                event: "cancel request".into(),
            });
        }
        self.transition(id, OrderState::Cancelling, now, |_| {})
    }

    /// Apply a broker-side event. Returns the resulting update, or `None`
    /// when the event is benign noise (e.g. a duplicate ack).
    pub fn on_broker_event(
        &mut self,
        id: Uuid,
        event: BrokerOrderEvent,
        now: DateTime<Utc>,
    ) -> TrackerResult<Option<OrderUpdate>> {
        let order = self.orders.get(&id).ok_or(TrackerError::UnknownOrder(id))?;
        let from = order.state;

        let update = match (&event, from) {
            (BrokerOrderEvent::Accepted { deal_reference }, OrderState::Submitting) => {
                let reference = deal_reference.clone();
                let updated = self.transition(id, OrderState::Submitted, now, move |order| {
                    order.deal_reference = Some(reference.clone());
                })?;
                self.submit_deadlines.remove(&id);
                Some(OrderUpdate::Accepted(updated))
            }
            (BrokerOrderEvent::Rejected { reason }, OrderState::Submitting) => {
                let reason = reason.clone();
                let updated = self.transition(id, OrderState::Rejected, now, move |order| {
                    order.error = Some(reason.clone());
                })?;
                self.submit_deadlines.remove(&id);
                Some(OrderUpdate::Rejected(updated))
            }
            (BrokerOrderEvent::Fill(fill), OrderState::Submitted | OrderState::Partial) => {
                let fill = fill.clone();
                let target_qty = order.quantity;
                let already = order.filled_quantity();
                let full = already + fill.quantity >= target_qty;
                let to = if full {
                    OrderState::Filled
                } else {
                    OrderState::Partial
                };
                let updated = self.transition(id, to, now, move |order| {
                    order.fills.push(fill.clone());
                })?;
                Some(if full {
                    OrderUpdate::Filled(updated)
                } else {
                    OrderUpdate::PartiallyFilled(updated)
                })
            }
            (BrokerOrderEvent::Fill(fill), OrderState::Cancelling) => {
                // Late fill wins over the cancel.
                let fill = fill.clone();
                let updated = self.transition(id, OrderState::Filled, now, move |order| {
                    order.fills.push(fill.clone());
                })?;
                Some(OrderUpdate::Filled(updated))
            }
            (BrokerOrderEvent::CancelAcknowledged, OrderState::Cancelling) => {
                let updated = self.transition(id, OrderState::Cancelled, now, |_| {})?;
                Some(OrderUpdate::Cancelled(updated))
            }
            (BrokerOrderEvent::Fatal { reason }, from) if !from.is_terminal() => {
                let reason = reason.clone();
                let updated = self.transition(id, OrderState::Error, now, move |order| {
                    order.error = Some(reason.clone());
                })?;
                self.submit_deadlines.remove(&id);
                Some(OrderUpdate::Errored(updated))
            }
            (_, from) if from.is_terminal() => {
                warn!(order_id = %id, state = ?from, event = event.label(), "event on terminal order ignored");
                None
            }
            (_, from) => {
                return Err(TrackerError::IllegalTransition {
                    from,
                    event: event.label().into(),
                });
            }
        };
        Ok(update)
    }

    /// Expire submits that outlived their window: Submitting -> Error, and
    /// mark the order for reconciliation at the next portfolio refresh.
    pub fn check_timeouts(&mut self, now: DateTime<Utc>) -> Vec<OrderUpdate> {
        let expired: Vec<Uuid> = self
            .submit_deadlines
            .iter()
            .filter(|(id, deadline)| {
                now >= **deadline
                    && self
                        .orders
                        .get(id)
                        .map(|order| order.state == OrderState::Submitting)
                        .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut updates = Vec::new();
        for id in expired {
            self.submit_deadlines.remove(&id);
            match self.transition(id, OrderState::Error, now, |order| {
                order.error = Some("submit timed out".into());
            }) {
                Ok(updated) => {
                    warn!(order_id = %id, "order submit timed out, flagged for reconciliation");
                    self.reconcile.insert(id);
                    updates.push(OrderUpdate::TimedOut(updated));
                }
                Err(err) => warn!(order_id = %id, error = %err, "timeout transition failed"),
            }
        }
        updates
    }

    /// Instruments with at least one open order, used by reconciliation.
    #[must_use]
    pub fn open_instruments(&self) -> Vec<Symbol> {
        let mut seen = HashSet::new();
        self.orders
            .values()
            .filter(|order| !order.state.is_terminal())
            .filter_map(|order| seen.insert(order.instrument.clone()).then(|| order.instrument.clone()))
            .collect()
    }

    /// Persist-then-commit: the event row is durable before the in-memory
    /// order (and therefore any notification) observes the new state.
    fn transition(
        &mut self,
        id: Uuid,
        to: OrderState,
        now: DateTime<Utc>,
        mutate: impl Fn(&mut Order),
    ) -> TrackerResult<Order> {
        let current = self.orders.get(&id).ok_or(TrackerError::UnknownOrder(id))?;
        let mut next = current.clone();
        mutate(&mut next);
        next.state = to;
        next.last_modified_at = now;
        let payload = serde_json::to_value(&next).map_err(StoreError::from)?;
        self.store
            .append_order_event(id, current.state, to, now, &payload)?;
        info!(order_id = %id, from = ?current.state, to = ?to, "order transition");
        self.orders.insert(id, next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{OrderAuthor, OrderOp, Side};
    use rust_decimal_macros::dec;

    fn tracker() -> OrderTracker {
        OrderTracker::new(
            Arc::new(Store::open_in_memory().unwrap()),
            Duration::seconds(30),
        )
    }

    fn draft(qty: rust_decimal::Decimal) -> OrderDraft {
        OrderDraft {
            instrument: "FTSE".into(),
            side: Side::Buy,
            op: OrderOp::Open,
            quantity: qty,
            stop_price: None,
            limit_price: None,
            author: OrderAuthor::System,
            strategy_id: Some(Uuid::new_v4()),
            on_filled: None,
        }
    }

    fn fill(qty: rust_decimal::Decimal) -> BrokerOrderEvent {
        BrokerOrderEvent::Fill(Fill {
            price: dec!(7400),
            quantity: qty,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn happy_path_accept_then_fill() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(100)), now);
        tracker.submit(id, now).unwrap();

        let update = tracker
            .on_broker_event(
                id,
                BrokerOrderEvent::Accepted {
                    deal_reference: "D-1".into(),
                },
                now,
            )
            .unwrap()
            .unwrap();
        assert!(matches!(update, OrderUpdate::Accepted(_)));
        assert_eq!(
            tracker.get(id).unwrap().deal_reference.as_deref(),
            Some("D-1")
        );

        let update = tracker.on_broker_event(id, fill(dec!(100)), now).unwrap().unwrap();
        match update {
            OrderUpdate::Filled(order) => {
                assert_eq!(order.state, OrderState::Filled);
                assert_eq!(order.filled_quantity(), dec!(100));
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[test]
    fn partial_fills_accumulate_until_full() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(100)), now);
        tracker.submit(id, now).unwrap();
        tracker
            .on_broker_event(
                id,
                BrokerOrderEvent::Accepted {
                    deal_reference: "D-2".into(),
                },
                now,
            )
            .unwrap();

        let update = tracker.on_broker_event(id, fill(dec!(40)), now).unwrap().unwrap();
        assert!(matches!(update, OrderUpdate::PartiallyFilled(_)));
        assert_eq!(tracker.get(id).unwrap().state, OrderState::Partial);

        let update = tracker.on_broker_event(id, fill(dec!(60)), now).unwrap().unwrap();
        assert!(matches!(update, OrderUpdate::Filled(_)));
    }

    #[test]
    fn cancel_then_late_fill_wins() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(50)), now);
        tracker.submit(id, now).unwrap();
        tracker
            .on_broker_event(
                id,
                BrokerOrderEvent::Accepted {
                    deal_reference: "D-3".into(),
                },
                now,
            )
            .unwrap();
        tracker.cancel(id, now).unwrap();
        assert_eq!(tracker.get(id).unwrap().state, OrderState::Cancelling);

        let update = tracker.on_broker_event(id, fill(dec!(50)), now).unwrap().unwrap();
        assert!(matches!(update, OrderUpdate::Filled(_)));
    }

    #[test]
    fn illegal_transitions_are_rejected_without_mutation() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(10)), now);

        // Fill before submit is illegal.
        let err = tracker.on_broker_event(id, fill(dec!(10)), now).unwrap_err();
        assert!(matches!(err, TrackerError::IllegalTransition { .. }));
        assert_eq!(tracker.get(id).unwrap().state, OrderState::Draft);

        // Cancel before accept is illegal.
        tracker.submit(id, now).unwrap();
        let err = tracker.cancel(id, now).unwrap_err();
        assert!(matches!(err, TrackerError::IllegalTransition { .. }));
        assert_eq!(tracker.get(id).unwrap().state, OrderState::Submitting);
    }

    #[test]
    fn submit_timeout_errors_and_flags_reconciliation() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(10)), now);
        tracker.submit(id, now).unwrap();

        assert!(tracker.check_timeouts(now + Duration::seconds(5)).is_empty());
        let updates = tracker.check_timeouts(now + Duration::seconds(31));
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0], OrderUpdate::TimedOut(_)));
        assert_eq!(tracker.get(id).unwrap().state, OrderState::Error);
        assert_eq!(tracker.take_reconciliation(), vec![id]);
    }

    #[test]
    fn persisted_history_forms_a_directed_path() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut tracker = OrderTracker::new(store.clone(), Duration::seconds(30));
        let now = Utc::now();
        let id = tracker.create(draft(dec!(100)), now);
        tracker.submit(id, now).unwrap();
        tracker
            .on_broker_event(
                id,
                BrokerOrderEvent::Accepted {
                    deal_reference: "D-9".into(),
                },
                now,
            )
            .unwrap();
        tracker.on_broker_event(id, fill(dec!(40)), now).unwrap();
        tracker.on_broker_event(id, fill(dec!(60)), now).unwrap();

        let events = store.order_events(id).unwrap();
        let states: Vec<OrderState> = events.iter().map(|row| row.to_state).collect();
        assert_eq!(
            states,
            vec![
                OrderState::Submitting,
                OrderState::Submitted,
                OrderState::Partial,
                OrderState::Filled
            ]
        );
        for pair in events.windows(2) {
            assert_eq!(pair[0].to_state, pair[1].from_state);
        }
    }

    #[test]
    fn inflight_detection_per_instrument() {
        let mut tracker = tracker();
        let now = Utc::now();
        let id = tracker.create(draft(dec!(10)), now);
        assert!(!tracker.has_inflight("FTSE"));
        tracker.submit(id, now).unwrap();
        assert!(tracker.has_inflight("FTSE"));
        assert!(!tracker.has_inflight("DAX"));
        tracker
            .on_broker_event(
                id,
                BrokerOrderEvent::Fatal {
                    reason: "margin".into(),
                },
                now,
            )
            .unwrap();
        assert!(!tracker.has_inflight("FTSE"));
    }
}
