//! End-to-end scenarios driving the Trade Manager against the paper broker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Local, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use kestrel_adapter::{event_channel, spawn_adapter, BrokerAdapter, RuntimeSettings};
use kestrel_core::{
    Alert, AlertSeverity, Bar, OrderAuthor, OrderDraft, OrderOp, OrderState, Session,
    SessionState, Side,
};
use kestrel_config::StrategyConfig;
use kestrel_engine::{
    EngineHandle, EngineStatus, ShutdownSignal, TradeManager, TradeManagerConfig, TradingWindow,
};
use kestrel_orders::OrderTracker;
use kestrel_paper::{PaperAdapter, PaperConfig, PaperHandle};
use kestrel_store::Store;
use kestrel_strategy::{register_builtin_strategies, StrategyInstance};

const BASE_TS: i64 = 1_700_000_100; // aligned to whole minutes

fn sma_strategy_config(timeframe: &str, data_timeframe: &str) -> StrategyConfig {
    let mut params = toml::value::Table::new();
    params.insert("fast".into(), toml::Value::Integer(3));
    params.insert("slow".into(), toml::Value::Integer(5));
    params.insert("stop_percent".into(), toml::Value::Float(2.0));
    StrategyConfig {
        name: "Sma".into(),
        instrument: "FTSE".into(),
        broker_symbol: "IX.FTSE".into(),
        timeframe: timeframe.into(),
        data_timeframe: data_timeframe.into(),
        evaluate_in_progress: false,
        params: toml::Value::Table(params),
    }
}

fn manager_config(strategies: Vec<StrategyConfig>, staleness_floor_secs: i64) -> TradeManagerConfig {
    TradeManagerConfig {
        account: "ACC-TEST".into(),
        trading_enable: true,
        window: TradingWindow {
            start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        },
        daily_clean_time: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        order_timeout: Duration::seconds(30),
        portfolio_refresh: Duration::seconds(30),
        account_refresh: Duration::seconds(300),
        action_timeout: Duration::seconds(600),
        shutdown_deadline: StdDuration::from_secs(5),
        tick_interval: StdDuration::from_millis(10),
        staleness_floor: Duration::seconds(staleness_floor_secs),
        strategies,
    }
}

struct Rig {
    handle: EngineHandle,
    alerts: broadcast::Receiver<Alert>,
    paper: PaperHandle,
    shutdown: ShutdownSignal,
    task: JoinHandle<()>,
    _tmp: Option<TempDir>,
}

impl Rig {
    async fn stop(self) {
        self.shutdown.trigger();
        let _ = timeout(StdDuration::from_secs(10), self.task).await;
    }
}

async fn start_rig(
    store_path: &Path,
    config: TradeManagerConfig,
    fail_auth: bool,
    suppress_portfolio: bool,
    tmp: Option<TempDir>,
) -> Result<Rig> {
    register_builtin_strategies();
    let store = Arc::new(Store::open(store_path)?);

    let (events_tx, events_rx) = event_channel();
    let mut adapter = PaperAdapter::new(PaperConfig::default(), events_tx.clone());
    let paper = adapter.handle();
    if fail_auth {
        paper.fail_auth();
    }
    if suppress_portfolio {
        paper.suppress_portfolio(true);
    }
    let init = match adapter.init().await {
        Ok(init) => Some(init),
        Err(err) => {
            assert!(err.code.is_fatal());
            None
        }
    };
    let adapter_handle = spawn_adapter(
        Box::new(adapter),
        events_tx,
        events_rx,
        RuntimeSettings {
            tick_interval: StdDuration::from_millis(5),
            ..RuntimeSettings::default()
        },
    );

    let (command_tx, command_rx) = mpsc::channel(64);
    let (alert_tx, alert_rx) = broadcast::channel(256);
    let handle = EngineHandle::new(command_tx, alert_tx.clone());
    let shutdown = ShutdownSignal::new();
    let manager = TradeManager::new(
        config,
        store,
        adapter_handle,
        init,
        command_rx,
        alert_tx,
        shutdown.clone(),
    )?;
    let task = tokio::spawn(async move {
        let _ = manager.run().await;
    });
    Ok(Rig {
        handle,
        alerts: alert_rx,
        paper,
        shutdown,
        task,
        _tmp: tmp,
    })
}

async fn wait_status(
    handle: &EngineHandle,
    secs: u64,
    predicate: impl Fn(&EngineStatus) -> bool,
) -> EngineStatus {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(secs);
    loop {
        if let Ok(status) = handle.status().await {
            if predicate(&status) {
                return status;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("status condition not met in time: {status:?}");
            }
        }
        sleep(StdDuration::from_millis(20)).await;
    }
}

async fn wait_subscription(paper: &PaperHandle, secs: u64) {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(secs);
    while paper.subscription_count() == 0 {
        if tokio::time::Instant::now() >= deadline {
            panic!("broker subscription never established");
        }
        sleep(StdDuration::from_millis(10)).await;
    }
}

fn minute_bar(index: i64, close: Decimal) -> Bar {
    Bar {
        timestamp: chrono::DateTime::from_timestamp(BASE_TS + index * 60, 0).unwrap(),
        open: close,
        high: close + dec!(0.5),
        low: close - dec!(0.5),
        close,
        volume: dec!(10),
        closed: true,
    }
}

async fn expect_alert(
    alerts: &mut broadcast::Receiver<Alert>,
    secs: u64,
    predicate: impl Fn(&Alert) -> bool,
) -> Alert {
    let deadline = tokio::time::Instant::now() + StdDuration::from_secs(secs);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_default();
        match timeout(remaining.max(StdDuration::from_millis(1)), alerts.recv()).await {
            Ok(Ok(alert)) if predicate(&alert) => return alert,
            Ok(Ok(_)) => continue,
            Ok(Err(err)) => panic!("alert stream closed: {err}"),
            Err(_) => panic!("expected alert not observed in time"),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn golden_cross_buys_then_death_cross_flattens() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        false,
        Some(tmp),
    )
    .await?;

    rig.paper.set_price("FTSE", dec!(10));
    wait_subscription(&rig.paper, 5).await;

    // Ten closed one-minute bars plus the bar that seals the tenth window.
    let closes = [10, 10, 10, 10, 10, 10, 11, 12, 13, 14, 14];
    for (i, close) in closes.iter().enumerate() {
        rig.paper
            .push_bar("FTSE", minute_bar(i as i64, Decimal::from(*close)));
    }

    let status = wait_status(&rig.handle, 5, |status| {
        status.portfolio.quantity("FTSE") == dec!(100)
    })
    .await;
    assert!(status.api_connected);
    assert_eq!(status.strategies.len(), 1);
    assert_eq!(status.strategies[0].last_action, 3); // ACTION_BUY

    let seen = rig.paper.orders_seen();
    assert_eq!(seen.len(), 1);
    let buy = &seen[0];
    assert_eq!(buy.side, Side::Buy);
    assert_eq!(buy.op, OrderOp::Open);
    assert_eq!(buy.quantity, dec!(100));
    assert_eq!(buy.stop_price, Some(dec!(13.72)));
    assert_eq!(buy.author, OrderAuthor::System);

    // Death cross: deliver the decline and the sealing bar.
    let declines = [13, 12, 11, 10, 9, 9];
    for (i, close) in declines.iter().enumerate() {
        rig.paper.push_bar(
            "FTSE",
            minute_bar(closes.len() as i64 + i as i64, Decimal::from(*close)),
        );
    }
    wait_status(&rig.handle, 5, |status| {
        status.portfolio.quantity("FTSE").is_zero()
    })
    .await;

    let seen = rig.paper.orders_seen();
    assert_eq!(seen.len(), 2);
    let flat = &seen[1];
    assert_eq!(flat.side, Side::Sell);
    assert_eq!(flat.op, OrderOp::Close);
    assert_eq!(flat.quantity, dec!(100));

    rig.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn flat_close_sequence_never_emits_an_order() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        false,
        Some(tmp),
    )
    .await?;

    rig.paper.set_price("FTSE", dec!(20));
    wait_subscription(&rig.paper, 5).await;
    for i in 0..21 {
        rig.paper.push_bar("FTSE", minute_bar(i, dec!(20)));
    }

    // Give the engine ample time to process everything.
    sleep(StdDuration::from_millis(500)).await;
    let status = rig.handle.status().await?;
    assert_eq!(status.strategies[0].last_action, 0);
    assert!(rig.paper.orders_seen().is_empty());
    assert!(status.portfolio.quantity("FTSE").is_zero());

    rig.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_failure_keeps_the_engine_idle() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    let mut rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        true,
        false,
        Some(tmp),
    )
    .await?;

    let alert = expect_alert(&mut rig.alerts, 5, |alert| alert.topic == "auth").await;
    assert_eq!(alert.severity, AlertSeverity::Critical);

    // No session, no subscriptions, no retries.
    sleep(StdDuration::from_millis(300)).await;
    let status = rig.handle.status().await?;
    assert!(status.session.is_none());
    assert_eq!(rig.paper.subscription_count(), 0);

    rig.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_resumes_strategy_state_and_fires_later() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");

    // Day one, first life: observe the flat prefix, then die.
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        false,
        None,
    )
    .await?;
    rig.paper.set_price("FTSE", dec!(10));
    wait_subscription(&rig.paper, 5).await;
    for i in 0..6 {
        rig.paper.push_bar("FTSE", minute_bar(i, dec!(10)));
    }
    wait_status(&rig.handle, 5, |status| {
        status.session.as_ref().map(|s| s.state) == Some(SessionState::Open)
    })
    .await;
    sleep(StdDuration::from_millis(300)).await;
    rig.stop().await;

    // Second life: recovery rehydrates the SMA window, the rally continues
    // and the cross still fires.
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        false,
        Some(tmp),
    )
    .await?;
    rig.paper.set_price("FTSE", dec!(15));
    wait_subscription(&rig.paper, 5).await;
    let status = rig.handle.status().await?;
    assert_eq!(
        status.session.as_ref().map(|s| s.state),
        Some(SessionState::Open),
        "recovered session must be open"
    );

    for (i, close) in [11, 12, 13, 14, 15, 15].iter().enumerate() {
        rig.paper
            .push_bar("FTSE", minute_bar(6 + i as i64, Decimal::from(*close)));
    }
    wait_status(&rig.handle, 5, |status| {
        status.portfolio.quantity("FTSE") == dec!(100)
    })
    .await;
    let seen = rig.paper.orders_seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].quantity, dec!(100));
    assert_eq!(seen[0].side, Side::Buy);

    rig.stop().await;
    Ok(())
}

/// Builds the store state of a process that died between persisting
/// SUBMITTING and hearing back from the broker.
fn plant_crashed_submit(path: &Path) -> Result<(uuid::Uuid, uuid::Uuid)> {
    register_builtin_strategies();
    let store = Arc::new(Store::open(path)?);
    let day = Local::now().date_naive();
    let mut session = Session::pending(day, "ACC-TEST");
    session.state = SessionState::Open;
    session.opened_at = Some(Utc::now());
    store.put_session(&session)?;
    let session_id = Store::session_id(day, "ACC-TEST");

    let config = sma_strategy_config("1m", "1m");
    let instances = kestrel_engine::build_instances(std::slice::from_ref(&config))?;
    let mut instance: StrategyInstance = instances.into_iter().next().unwrap();
    instance.init();
    instance.initialize(&kestrel_core::Portfolio::default(), true);
    let (payload, expected) = instance.snapshot();
    store.put_strategy_state(&session_id, instance.id(), &payload, expected)?;

    let mut tracker = OrderTracker::new(store.clone(), Duration::seconds(30));
    let order_id = tracker.create(
        OrderDraft {
            instrument: "FTSE".into(),
            side: Side::Buy,
            op: OrderOp::Open,
            quantity: dec!(100),
            stop_price: None,
            limit_price: None,
            author: OrderAuthor::System,
            strategy_id: Some(instance.id()),
            on_filled: None,
        },
        Utc::now(),
    );
    tracker.submit(order_id, Utc::now())?;
    Ok((order_id, instance.id()))
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_errors_a_submit_the_broker_never_saw() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    let (order_id, _) = plant_crashed_submit(&path)?;

    let mut rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        false,
        None,
    )
    .await?;

    expect_alert(&mut rig.alerts, 5, |alert| {
        alert.topic == "recovery" && alert.severity == AlertSeverity::Critical
    })
    .await;

    let store = Store::open(&path)?;
    let events = store.order_events(order_id)?;
    assert_eq!(events.last().unwrap().to_state, OrderState::Error);

    rig.stop().await;
    drop(tmp);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_adopts_a_submit_the_broker_accepted() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    let (order_id, _) = plant_crashed_submit(&path)?;

    // Portfolio responses are held back so the broker's accept wins the race.
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1m", "1m")], 60),
        false,
        true,
        None,
    )
    .await?;
    rig.paper.inject_event(kestrel_adapter::AdapterEvent::OrderAccepted {
        order_id,
        deal_reference: "DEAL-RECOVERED".into(),
    });

    wait_status(&rig.handle, 5, |status| {
        status
            .open_orders
            .iter()
            .any(|order| order.id == order_id && order.deal_reference.is_some())
    })
    .await;
    rig.paper.suppress_portfolio(false);

    let store = Store::open(&path)?;
    let events = store.order_events(order_id)?;
    assert_eq!(events.last().unwrap().to_state, OrderState::Submitted);
    assert!(events
        .iter()
        .all(|event| event.to_state != OrderState::Error));

    rig.stop().await;
    drop(tmp);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn feed_flap_alerts_resubscribes_and_restores_once() -> Result<()> {
    let tmp = TempDir::new()?;
    let path = tmp.path().join("kestrel.db");
    // One-second bars with a one-second floor: staleness threshold is 5s.
    let rig = start_rig(
        &path,
        manager_config(vec![sma_strategy_config("1s", "1s")], 1),
        false,
        false,
        Some(tmp),
    )
    .await?;
    let mut alerts = rig.handle.alerts();

    rig.paper.set_price("FTSE", dec!(10));
    wait_subscription(&rig.paper, 5).await;

    // Cut the feed. Within the threshold the watchdog must fire.
    rig.paper.set_feed_down(true);
    expect_alert(&mut alerts, 10, |alert| {
        alert.topic == "marketdata" && alert.message.contains("no market data")
    })
    .await;

    // Let two failed resubscription attempts happen, then restore.
    sleep(StdDuration::from_secs(2)).await;
    rig.paper.set_feed_down(false);

    expect_alert(&mut alerts, 10, |alert| {
        alert.topic == "marketdata" && alert.message.contains("restored")
    })
    .await;

    // Keep the feed fresh so only a genuine second outage could re-fire.
    let freshener = {
        let paper = rig.paper.clone();
        tokio::spawn(async move {
            for _ in 0..30 {
                let mut bar = minute_bar(0, dec!(10));
                bar.timestamp = chrono::Utc::now();
                paper.push_bar("FTSE", bar);
                sleep(StdDuration::from_millis(100)).await;
            }
        })
    };

    // Exactly once: no further restore alert arrives.
    let extra = timeout(StdDuration::from_secs(2), async {
        loop {
            match alerts.recv().await {
                Ok(alert)
                    if alert.topic == "marketdata" && alert.message.contains("restored") =>
                {
                    break alert;
                }
                Ok(_) => continue,
                Err(_) => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(extra.is_err(), "restore must be emitted exactly once");

    // The strategy is not blocked and data flows again.
    let status = rig.handle.status().await?;
    assert!(!status.strategies[0].blocked);
    assert!(!status.strategies[0].errored);

    freshener.abort();
    rig.stop().await;
    Ok(())
}
