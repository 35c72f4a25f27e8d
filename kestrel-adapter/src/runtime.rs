//! The adapter domain: one task per broker adapter.
//!
//! The engine talks to the adapter through two bounded queues — requests in,
//! events out — so no broker I/O can ever suspend the Trade Manager loop.
//! Order requests that fail transiently are parked in a retry queue and
//! re-driven on ticks until the submit window closes.

use std::time::{Duration, Instant};

use chrono::Utc;
use kestrel_core::{Instrument, Order, Symbol, Timeframe};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{AdapterError, AdapterEvent, AdapterEventSender, BrokerAdapter};

/// Work items the engine enqueues toward the adapter.
#[derive(Debug)]
pub enum AdapterRequest {
    AccountInfo,
    Portfolio,
    Subscribe {
        instrument: Instrument,
        timeframe: Timeframe,
    },
    Unsubscribe {
        instrument: Symbol,
    },
    Open(Order),
    Close(Order),
    Stop(Order),
    Cancel(Order),
    Shutdown,
}

/// Pacing of the adapter task.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeSettings {
    pub tick_interval: Duration,
    /// Window within which a transiently-failing order submit keeps being
    /// retried before it is rejected back to the engine.
    pub submit_timeout: Duration,
    pub submit_retry_delay: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            submit_timeout: Duration::from_secs(120),
            submit_retry_delay: Duration::from_secs(30),
        }
    }
}

/// Engine-side handle to a running adapter task.
pub struct AdapterHandle {
    pub requests: mpsc::Sender<AdapterRequest>,
    pub events: mpsc::Receiver<AdapterEvent>,
    pub task: JoinHandle<()>,
}

impl AdapterHandle {
    /// Enqueue a request without waiting; full queues are reported, not
    /// blocked on.
    pub fn try_request(&self, request: AdapterRequest) -> bool {
        match self.requests.try_send(request) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "adapter request queue rejected a request");
                false
            }
        }
    }
}

const REQUEST_QUEUE_DEPTH: usize = 256;
pub(crate) const EVENT_QUEUE_DEPTH: usize = 1024;

/// Create the event channel pair an adapter is constructed with. The sender
/// half is cloneable: one clone goes to the connector, another to
/// [`spawn_adapter`] for runtime-side rejections.
#[must_use]
pub fn event_channel() -> (crate::AdapterEventSender, mpsc::Receiver<AdapterEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (crate::AdapterEventSender::new(tx), rx)
}

#[derive(Clone, Copy, Debug)]
enum OrderCall {
    Open,
    Close,
    Stop,
    Cancel,
}

struct PendingSubmit {
    order: Order,
    call: OrderCall,
    deadline: Instant,
    next_attempt: Instant,
    last_error: String,
}

/// Spawn the adapter's worker task.
///
/// The adapter must already be initialized (`init` called and its result
/// consumed by the engine). The task drains the request queue, calls `tick`
/// on the configured interval, and exits on `Shutdown` or when the engine
/// drops the request sender.
pub fn spawn_adapter(
    mut adapter: Box<dyn BrokerAdapter>,
    events: AdapterEventSender,
    events_rx: mpsc::Receiver<AdapterEvent>,
    settings: RuntimeSettings,
) -> AdapterHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<AdapterRequest>(REQUEST_QUEUE_DEPTH);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut retry_queue: Vec<PendingSubmit> = Vec::new();
        loop {
            tokio::select! {
                maybe_request = request_rx.recv() => {
                    match maybe_request {
                        None => break,
                        Some(AdapterRequest::Shutdown) => {
                            if let Err(err) = adapter.shutdown().await {
                                warn!(adapter = adapter.name(), error = %err, "adapter shutdown failed");
                            }
                            break;
                        }
                        Some(request) => {
                            dispatch(adapter.as_mut(), &events, request, &settings, &mut retry_queue)
                                .await;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = adapter.tick(Utc::now()).await {
                        warn!(adapter = adapter.name(), error = %err, "adapter tick failed");
                    }
                    drive_retries(adapter.as_mut(), &events, &settings, &mut retry_queue).await;
                }
            }
        }
        debug!(adapter = adapter.name(), "adapter task stopped");
    });

    AdapterHandle {
        requests: request_tx,
        events: events_rx,
        task,
    }
}

async fn dispatch(
    adapter: &mut dyn BrokerAdapter,
    events: &AdapterEventSender,
    request: AdapterRequest,
    settings: &RuntimeSettings,
    retry_queue: &mut Vec<PendingSubmit>,
) {
    let (order, call) = match request {
        AdapterRequest::AccountInfo => {
            if let Err(err) = adapter.request_account_info().await {
                warn!(adapter = adapter.name(), error = %err, "account info request failed");
            }
            return;
        }
        AdapterRequest::Portfolio => {
            if let Err(err) = adapter.request_portfolio().await {
                warn!(adapter = adapter.name(), error = %err, "portfolio request failed");
            }
            return;
        }
        AdapterRequest::Subscribe {
            instrument,
            timeframe,
        } => {
            if let Err(err) = adapter.request_subscribe(&instrument, timeframe).await {
                warn!(adapter = adapter.name(), error = %err, "subscribe request failed");
            }
            return;
        }
        AdapterRequest::Unsubscribe { instrument } => {
            if let Err(err) = adapter.request_unsubscribe(&instrument).await {
                warn!(adapter = adapter.name(), error = %err, "unsubscribe request failed");
            }
            return;
        }
        AdapterRequest::Open(order) => (order, OrderCall::Open),
        AdapterRequest::Close(order) => (order, OrderCall::Close),
        AdapterRequest::Stop(order) => (order, OrderCall::Stop),
        AdapterRequest::Cancel(order) => (order, OrderCall::Cancel),
        AdapterRequest::Shutdown => unreachable!("handled by the task loop"),
    };
    submit_order(adapter, events, order, call, settings, retry_queue, None).await;
}

/// Try one order call; transient failures park the order for a later retry
/// within the submit window, permanent ones go straight back as errors.
async fn submit_order(
    adapter: &mut dyn BrokerAdapter,
    events: &AdapterEventSender,
    order: Order,
    call: OrderCall,
    settings: &RuntimeSettings,
    retry_queue: &mut Vec<PendingSubmit>,
    existing_deadline: Option<Instant>,
) {
    let outcome = match call {
        OrderCall::Open => adapter.request_open(&order).await,
        OrderCall::Close => adapter.request_close(&order).await,
        OrderCall::Stop => adapter.request_stop(&order).await,
        OrderCall::Cancel => adapter.request_cancel(&order).await,
    };
    let Err(err) = outcome else { return };
    let AdapterError { code, message } = err;
    if code.is_retryable() {
        let now = Instant::now();
        let deadline = existing_deadline.unwrap_or(now + settings.submit_timeout);
        warn!(
            adapter = adapter.name(),
            order_id = %order.id,
            error = %message,
            retry_in_secs = settings.submit_retry_delay.as_secs(),
            "order submit failed transiently, queued for retry"
        );
        retry_queue.push(PendingSubmit {
            order,
            call,
            deadline,
            next_attempt: now + settings.submit_retry_delay,
            last_error: message,
        });
    } else {
        events
            .emit(AdapterEvent::OrderError {
                order_id: order.id,
                code,
                reason: message,
            })
            .await;
    }
}

/// Re-drive parked submits; expired ones are rejected back to the engine.
async fn drive_retries(
    adapter: &mut dyn BrokerAdapter,
    events: &AdapterEventSender,
    settings: &RuntimeSettings,
    retry_queue: &mut Vec<PendingSubmit>,
) {
    if retry_queue.is_empty() {
        return;
    }
    let now = Instant::now();
    let mut due = Vec::new();
    let mut keep = Vec::new();
    for pending in retry_queue.drain(..) {
        if now >= pending.deadline {
            events
                .emit(AdapterEvent::OrderRejected {
                    order_id: pending.order.id,
                    code: crate::AdapterErrorCode::General,
                    reason: format!("submit window expired: {}", pending.last_error),
                })
                .await;
        } else if now >= pending.next_attempt {
            due.push(pending);
        } else {
            keep.push(pending);
        }
    }
    *retry_queue = keep;
    for pending in due {
        submit_order(
            adapter,
            events,
            pending.order,
            pending.call,
            settings,
            retry_queue,
            Some(pending.deadline),
        )
        .await;
    }
}
