//! Wire-level tests of the client channel against a scripted engine.

use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};

use kestrel_core::{Alert, AlertSeverity, Portfolio};
use kestrel_engine::{EngineCommand, EngineHandle, EngineStatus, ShutdownSignal};
use kestrel_gateway::{spawn_gateway, GatewaySettings};

const EOT: u8 = 0x04;

fn sample_status() -> EngineStatus {
    EngineStatus {
        account: "ACC-TEST".into(),
        session: None,
        api_connected: true,
        feed_connected: true,
        trading_enabled: true,
        account_info: None,
        portfolio: Portfolio::default(),
        strategies: Vec::new(),
        open_orders: Vec::new(),
    }
}

/// A scripted engine answering commands with canned data.
fn spawn_fake_engine() -> (EngineHandle, broadcast::Sender<Alert>) {
    let (command_tx, mut command_rx) = mpsc::channel::<EngineCommand>(16);
    let (alert_tx, _) = broadcast::channel(16);
    let handle = EngineHandle::new(command_tx, alert_tx.clone());
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            match command {
                EngineCommand::Status { respond } => {
                    let _ = respond.send(sample_status());
                }
                EngineCommand::StrategyMetadata { respond } => {
                    let _ = respond.send(Vec::new());
                }
                EngineCommand::AccountActivity { respond } => {
                    let _ = respond.send(Vec::new());
                }
                EngineCommand::OpenPosition {
                    instrument,
                    quantity,
                    respond,
                    ..
                } => {
                    assert_eq!(instrument, "FTSE");
                    assert_eq!(quantity, rust_decimal_macros::dec!(100));
                    let _ = respond.send(Ok(uuid::Uuid::new_v4()));
                }
                EngineCommand::ClosePosition { respond, .. } => {
                    let _ = respond.send(Err("no open position for FTSE".into()));
                }
                EngineCommand::UpdateAccountConfig { respond, .. } => {
                    let _ = respond.send(Ok(()));
                }
                EngineCommand::ValidateSignal {
                    strategy, respond, ..
                } => {
                    let _ = respond.send(Ok(strategy == "Sma"));
                }
            }
        }
    });
    (handle, alert_tx)
}

async fn start_gateway(log_dir: std::path::PathBuf) -> Result<(String, broadcast::Sender<Alert>, ShutdownSignal)> {
    let (engine, alerts) = spawn_fake_engine();
    // Bind to an ephemeral port by probing.
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    drop(listener);
    let shutdown = ShutdownSignal::new();
    spawn_gateway(
        GatewaySettings {
            listen_addr: addr.clone(),
            max_clients: 4,
            log_dir,
            log_query: false,
        },
        engine,
        shutdown.clone(),
    );
    // Give the listener a beat to come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok((addr, alerts, shutdown))
}

async fn send_request(stream: &mut TcpStream, request: Value) -> Result<()> {
    let mut bytes = serde_json::to_vec(&request)?;
    bytes.push(EOT);
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_document(stream: &mut TcpStream) -> Result<Value> {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == EOT {
            break;
        }
        buffer.push(byte[0]);
    }
    Ok(serde_json::from_slice(&buffer)?)
}

#[tokio::test(flavor = "multi_thread")]
async fn trading_commands_round_trip() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (addr, _alerts, shutdown) = start_gateway(tmp.path().to_path_buf()).await?;
    let mut stream = TcpStream::connect(&addr).await?;

    // Open position.
    send_request(
        &mut stream,
        json!({
            "service": 2,
            "srvOpId": 1,
            "data": {"epic": "FTSE", "direction": 1, "qty": 100},
        }),
    )
    .await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 0);
    assert!(reply["data"]["orderId"].is_string());

    // Close with no position surfaces the engine's error text.
    send_request(
        &mut stream,
        json!({
            "service": 2,
            "srvOpId": 2,
            "data": {"epic": "FTSE"},
        }),
    )
    .await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 0);
    assert_eq!(reply["data"]["error"], "no open position for FTSE");

    // Validate signal.
    send_request(
        &mut stream,
        json!({
            "service": 2,
            "srvOpId": 8,
            "data": {
                "system": "Sma",
                "epic": "FTSE",
                "timeFrame": "5m",
                "params": {"fast": 3, "slow": 5},
            },
        }),
    )
    .await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["data"]["valid"], true);

    // Update account config.
    send_request(
        &mut stream,
        json!({
            "service": 2,
            "srvOpId": 5,
            "data": {"tradingEnable": false},
        }),
    )
    .await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 0);

    shutdown.trigger();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_and_unsupported_services_are_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (addr, _alerts, shutdown) = start_gateway(tmp.path().to_path_buf()).await?;
    let mut stream = TcpStream::connect(&addr).await?;

    send_request(&mut stream, json!({"service": 4, "srvOpId": 0, "data": {}})).await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 1);
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .contains("not supported"));

    send_request(&mut stream, json!({"service": 99, "srvOpId": 0, "data": {}})).await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 1);

    // Malformed documents do not kill the connection.
    stream.write_all(b"this is not json\x04").await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 1);

    shutdown.trigger();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn strategy_metadata_answers() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (addr, _alerts, shutdown) = start_gateway(tmp.path().to_path_buf()).await?;
    let mut stream = TcpStream::connect(&addr).await?;

    send_request(&mut stream, json!({"service": 3, "srvOpId": 0, "data": {}})).await?;
    let reply = read_document(&mut stream).await?;
    assert_eq!(reply["result"], 0);
    assert!(reply["data"]["strategies"].is_array());

    shutdown.trigger();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn server_log_download_uses_binary_framing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    std::fs::write(tmp.path().join("kestrel-2025-03-14.log"), b"log line one\n")?;
    let (addr, _alerts, shutdown) = start_gateway(tmp.path().to_path_buf()).await?;
    let mut stream = TcpStream::connect(&addr).await?;

    send_request(
        &mut stream,
        json!({"service": 1, "srvOpId": 0, "data": {"date": "2025-03-14"}}),
    )
    .await?;

    // Header document runs until the binary delimiter.
    let delimiter: &[u8] = &[
        0x00, 0xFF, b'm', b't', b'b', b'i', b'n', b'a', b'r', b'y', 0x00, 0xFF,
    ];
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    while !collected.ends_with(delimiter) {
        stream.read_exact(&mut byte).await?;
        collected.push(byte[0]);
    }
    let header: Value =
        serde_json::from_slice(&collected[..collected.len() - delimiter.len()])?;
    assert_eq!(header["result"], 0);

    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    assert_eq!(header["data"]["size"], len);

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    assert_eq!(&payload[..2], b"PK");

    shutdown.trigger();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn alerts_are_pushed_to_connected_clients() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let (addr, alerts, shutdown) = start_gateway(tmp.path().to_path_buf()).await?;
    let mut stream = TcpStream::connect(&addr).await?;
    // The connection handler needs a beat to subscribe.
    tokio::time::sleep(Duration::from_millis(100)).await;

    alerts.send(Alert::new(
        AlertSeverity::Critical,
        "broker",
        "broker disconnected (code 1)",
    ))?;

    let push = read_document(&mut stream).await?;
    assert_eq!(push["service"], 0);
    assert_eq!(push["data"]["topic"], "broker");
    assert_eq!(push["data"]["severity"], "Critical");

    shutdown.trigger();
    Ok(())
}
