//! The Client Channel: a TCP request/response and push surface consumed by
//! the external gateway application.
//!
//! One connection per client, each served by its own task under a hard cap.
//! Requests are JSON documents terminated by a single 0x04 byte; responses
//! are JSON + 0x04, except binary downloads which follow the document with
//! the `mtbinary` delimiter, a big-endian length and the raw payload.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kestrel_core::{Quantity, Side};
use kestrel_engine::{EngineCommand, EngineHandle, ShutdownSignal};

/// Frame terminator for JSON documents.
const EOT: u8 = 0x04;
/// Separator announcing a binary payload after the response document.
const BINARY_DELIMITER: &[u8] = &[
    0x00, 0xFF, b'm', b't', b'b', b'i', b'n', b'a', b'r', b'y', 0x00, 0xFF,
];
/// Upper bound on a single request frame.
const MAX_FRAME: usize = 256 * 1024;
/// How long a command may wait on the engine before the client gets an error.
const ENGINE_TIMEOUT: Duration = Duration::from_secs(5);

/// Service identifiers of the client protocol.
mod service {
    pub const PUSH: i64 = 0;
    pub const SERVER_LOG: i64 = 1;
    pub const TRADING: i64 = 2;
    pub const STRATEGY_METADATA: i64 = 3;
    pub const BACKTEST: i64 = 4;
    pub const ACCOUNT_ACTIVITY: i64 = 5;
}

/// Trading sub-operations (`srvOpId` under service 2).
mod trading_op {
    pub const OPEN_POSITION: i64 = 1;
    pub const CLOSE_POSITION: i64 = 2;
    pub const UPDATE_ACCOUNT_CONFIG: i64 = 5;
    pub const VALIDATE_SIGNAL: i64 = 8;
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("frame exceeds {MAX_FRAME} bytes")]
    FrameTooLarge,
    #[error("engine unavailable")]
    EngineUnavailable,
}

/// Settings the gateway needs from the application config.
#[derive(Clone, Debug)]
pub struct GatewaySettings {
    pub listen_addr: String,
    pub max_clients: usize,
    /// Directory scanned for the server-log download service.
    pub log_dir: PathBuf,
    /// Log request/response documents at debug level.
    pub log_query: bool,
}

/// Accept loop. Runs until the shutdown signal trips.
pub async fn serve(
    settings: GatewaySettings,
    engine: EngineHandle,
    shutdown: ShutdownSignal,
) -> GatewayResult<()> {
    let listener = TcpListener::bind(&settings.listen_addr).await?;
    info!(addr = %settings.listen_addr, "client channel listening");
    let permits = Arc::new(Semaphore::new(settings.max_clients.max(1)));
    let settings = Arc::new(settings);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!(%peer, "connection refused: client cap reached");
                    drop(socket);
                    continue;
                };
                let engine = engine.clone();
                let settings = settings.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = serve_connection(socket, engine, settings, shutdown).await {
                        debug!(%peer, error = %err, "client connection ended");
                    }
                });
            }
            _ = shutdown.wait() => break,
        }
    }
    Ok(())
}

/// Spawn [`serve`] on its own task.
pub fn spawn_gateway(
    settings: GatewaySettings,
    engine: EngineHandle,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = serve(settings, engine, shutdown).await {
            warn!(error = %err, "client channel exited with error");
        }
    })
}

#[derive(Debug, Deserialize)]
struct Request {
    service: i64,
    #[serde(rename = "srvOpId", default)]
    srv_op_id: i64,
    #[serde(default)]
    data: Value,
}

enum Reply {
    Document(Value),
    Binary { document: Value, payload: Vec<u8> },
}

async fn serve_connection(
    mut socket: TcpStream,
    engine: EngineHandle,
    settings: Arc<GatewaySettings>,
    shutdown: ShutdownSignal,
) -> GatewayResult<()> {
    let mut alerts = engine.alerts();
    let mut buffer: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        // Serve a complete frame when one is already buffered.
        if let Some(pos) = buffer.iter().position(|byte| *byte == EOT) {
            let frame: Vec<u8> = buffer.drain(..=pos).collect();
            let frame = &frame[..frame.len() - 1];
            let reply = handle_frame(frame, &engine, &settings).await;
            write_reply(&mut socket, reply).await?;
            continue;
        }
        if buffer.len() > MAX_FRAME {
            return Err(GatewayError::FrameTooLarge);
        }

        tokio::select! {
            read = socket.read(&mut chunk) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                buffer.extend_from_slice(&chunk[..n]);
            }
            alert = alerts.recv() => {
                if let Ok(alert) = alert {
                    let push = json!({
                        "service": service::PUSH,
                        "srvOpId": 0,
                        "data": alert,
                    });
                    write_reply(&mut socket, Reply::Document(push)).await?;
                }
            }
            _ = shutdown.wait() => return Ok(()),
        }
    }
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) -> GatewayResult<()> {
    match reply {
        Reply::Document(document) => {
            let mut bytes = serde_json::to_vec(&document)
                .map_err(|err| GatewayError::Malformed(err.to_string()))?;
            bytes.push(EOT);
            socket.write_all(&bytes).await?;
        }
        Reply::Binary { document, payload } => {
            let header = serde_json::to_vec(&document)
                .map_err(|err| GatewayError::Malformed(err.to_string()))?;
            let mut bytes =
                Vec::with_capacity(header.len() + BINARY_DELIMITER.len() + 4 + payload.len());
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(BINARY_DELIMITER);
            bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            bytes.extend_from_slice(&payload);
            socket.write_all(&bytes).await?;
        }
    }
    socket.flush().await?;
    Ok(())
}

async fn handle_frame(
    frame: &[u8],
    engine: &EngineHandle,
    settings: &GatewaySettings,
) -> Reply {
    let request: Request = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(err) => {
            return Reply::Document(error_document(0, 0, format!("malformed request: {err}")));
        }
    };
    if settings.log_query {
        debug!(service = request.service, op = request.srv_op_id, "client request");
    }
    match request.service {
        service::SERVER_LOG => server_log_reply(&request, settings).await,
        service::TRADING => trading_reply(&request, engine).await,
        service::STRATEGY_METADATA => {
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::StrategyMetadata { respond: tx },
                rx,
                &request,
                |strategies| json!({ "strategies": strategies }),
            )
            .await
        }
        service::BACKTEST => Reply::Document(error_document(
            request.service,
            request.srv_op_id,
            "backtesting is not supported by this engine",
        )),
        service::ACCOUNT_ACTIVITY => {
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::AccountActivity { respond: tx },
                rx,
                &request,
                |orders| json!({ "orders": orders }),
            )
            .await
        }
        other => Reply::Document(error_document(
            other,
            request.srv_op_id,
            format!("unknown service {other}"),
        )),
    }
}

async fn respond_via<T: serde::Serialize>(
    engine: &EngineHandle,
    command: EngineCommand,
    rx: oneshot::Receiver<T>,
    request: &Request,
    shape: impl FnOnce(T) -> Value,
) -> Reply {
    if engine.send(command).await.is_err() {
        return Reply::Document(error_document(
            request.service,
            request.srv_op_id,
            "engine unavailable",
        ));
    }
    match tokio::time::timeout(ENGINE_TIMEOUT, rx).await {
        Ok(Ok(value)) => Reply::Document(ok_document(
            request.service,
            request.srv_op_id,
            shape(value),
        )),
        _ => Reply::Document(error_document(
            request.service,
            request.srv_op_id,
            "engine did not answer in time",
        )),
    }
}

// --- service 2: trading commands ---------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenPositionDoc {
    epic: String,
    /// 1 = buy, 2 = sell.
    direction: u8,
    qty: Quantity,
    #[serde(default, rename = "stopPrice")]
    stop_price: Option<rust_decimal::Decimal>,
}

#[derive(Debug, Deserialize)]
struct ClosePositionDoc {
    epic: String,
    #[serde(default)]
    qty: Option<Quantity>,
}

#[derive(Debug, Deserialize)]
struct AccountConfigDoc {
    #[serde(default, rename = "tradingEnable")]
    trading_enable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ValidateSignalDoc {
    system: String,
    epic: String,
    #[serde(rename = "timeFrame")]
    time_frame: String,
    #[serde(default)]
    params: Value,
}

async fn trading_reply(request: &Request, engine: &EngineHandle) -> Reply {
    match request.srv_op_id {
        trading_op::OPEN_POSITION => {
            let doc: OpenPositionDoc = match parse_data(&request.data) {
                Ok(doc) => doc,
                Err(message) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        message,
                    ))
                }
            };
            let side = match doc.direction {
                1 => Side::Buy,
                2 => Side::Sell,
                other => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        format!("direction {other} is not 1 or 2"),
                    ));
                }
            };
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::OpenPosition {
                    instrument: doc.epic,
                    side,
                    quantity: doc.qty,
                    stop_price: doc.stop_price,
                    respond: tx,
                },
                rx,
                request,
                |result| match result {
                    Ok(order_id) => json!({ "orderId": order_id }),
                    Err(message) => json!({ "error": message }),
                },
            )
            .await
        }
        trading_op::CLOSE_POSITION => {
            let doc: ClosePositionDoc = match parse_data(&request.data) {
                Ok(doc) => doc,
                Err(message) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        message,
                    ))
                }
            };
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::ClosePosition {
                    instrument: doc.epic,
                    quantity: doc.qty,
                    respond: tx,
                },
                rx,
                request,
                |result| match result {
                    Ok(order_id) => json!({ "orderId": order_id }),
                    Err(message) => json!({ "error": message }),
                },
            )
            .await
        }
        trading_op::UPDATE_ACCOUNT_CONFIG => {
            let doc: AccountConfigDoc = match parse_data(&request.data) {
                Ok(doc) => doc,
                Err(message) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        message,
                    ))
                }
            };
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::UpdateAccountConfig {
                    trading_enable: doc.trading_enable,
                    respond: tx,
                },
                rx,
                request,
                |result| match result {
                    Ok(()) => json!({}),
                    Err(message) => json!({ "error": message }),
                },
            )
            .await
        }
        trading_op::VALIDATE_SIGNAL => {
            let doc: ValidateSignalDoc = match parse_data(&request.data) {
                Ok(doc) => doc,
                Err(message) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        message,
                    ))
                }
            };
            let timeframe = match doc.time_frame.parse() {
                Ok(timeframe) => timeframe,
                Err(err) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        format!("invalid timeFrame: {err}"),
                    ));
                }
            };
            let params: toml::Value = match serde_json::from_value(doc.params.clone()) {
                Ok(params) => params,
                Err(err) => {
                    return Reply::Document(error_document(
                        request.service,
                        request.srv_op_id,
                        format!("invalid params: {err}"),
                    ));
                }
            };
            let (tx, rx) = oneshot::channel();
            respond_via(
                engine,
                EngineCommand::ValidateSignal {
                    strategy: doc.system,
                    instrument: doc.epic,
                    timeframe,
                    params,
                    respond: tx,
                },
                rx,
                request,
                |result| match result {
                    Ok(valid) => json!({ "valid": valid }),
                    Err(message) => json!({ "error": message }),
                },
            )
            .await
        }
        other => Reply::Document(error_document(
            request.service,
            other,
            format!("unknown trading operation {other}"),
        )),
    }
}

// --- service 1: server log download ------------------------------------------

#[derive(Debug, Deserialize)]
struct ServerLogDoc {
    /// Day to collect, `YYYY-MM-DD`.
    date: String,
}

async fn server_log_reply(request: &Request, settings: &GatewaySettings) -> Reply {
    let doc: ServerLogDoc = match parse_data(&request.data) {
        Ok(doc) => doc,
        Err(message) => {
            return Reply::Document(error_document(request.service, request.srv_op_id, message))
        }
    };
    let dir = settings.log_dir.clone();
    let date = doc.date.clone();
    let zipped = tokio::task::spawn_blocking(move || zip_logs_for_day(&dir, &date)).await;
    match zipped {
        Ok(Ok(payload)) => Reply::Binary {
            document: ok_document(
                request.service,
                request.srv_op_id,
                json!({ "size": payload.len(), "date": doc.date }),
            ),
            payload,
        },
        Ok(Err(err)) => {
            Reply::Document(error_document(request.service, request.srv_op_id, err))
        }
        Err(err) => Reply::Document(error_document(
            request.service,
            request.srv_op_id,
            format!("log collection failed: {err}"),
        )),
    }
}

/// Zip every log file whose name mentions the requested day.
fn zip_logs_for_day(dir: &PathBuf, date: &str) -> Result<Vec<u8>, String> {
    let entries = std::fs::read_dir(dir).map_err(|err| format!("log dir unreadable: {err}"))?;
    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let mut count = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.contains(date) {
            continue;
        }
        let contents =
            std::fs::read(entry.path()).map_err(|err| format!("cannot read {name}: {err}"))?;
        writer
            .start_file(name, options)
            .map_err(|err| format!("zip error: {err}"))?;
        writer
            .write_all(&contents)
            .map_err(|err| format!("zip error: {err}"))?;
        count += 1;
    }
    if count == 0 {
        return Err(format!("no logs found for {date}"));
    }
    let cursor = writer
        .finish()
        .map_err(|err| format!("zip error: {err}"))?;
    Ok(cursor.into_inner())
}

// --- helpers ------------------------------------------------------------------

fn parse_data<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, String> {
    serde_json::from_value(data.clone()).map_err(|err| format!("malformed data: {err}"))
}

fn ok_document(service: i64, srv_op_id: i64, data: Value) -> Value {
    json!({
        "service": service,
        "srvOpId": srv_op_id,
        "result": 0,
        "data": data,
    })
}

fn error_document(service: i64, srv_op_id: i64, message: impl Into<String>) -> Value {
    json!({
        "service": service,
        "srvOpId": srv_op_id,
        "result": 1,
        "message": message.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_delimiter_matches_the_protocol() {
        assert_eq!(&BINARY_DELIMITER[..2], &[0x00, 0xFF]);
        assert_eq!(&BINARY_DELIMITER[2..10], b"mtbinary");
        assert_eq!(&BINARY_DELIMITER[10..], &[0x00, 0xFF]);
    }

    #[test]
    fn documents_carry_service_and_result() {
        let ok = ok_document(3, 0, json!({"x": 1}));
        assert_eq!(ok["service"], 3);
        assert_eq!(ok["result"], 0);
        let err = error_document(4, 2, "nope");
        assert_eq!(err["result"], 1);
        assert_eq!(err["message"], "nope");
    }

    #[test]
    fn zip_logs_collects_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kestrel-2025-03-14.log"), b"hello").unwrap();
        std::fs::write(dir.path().join("kestrel-2025-03-15.log"), b"other").unwrap();
        let payload = zip_logs_for_day(&dir.path().to_path_buf(), "2025-03-14").unwrap();
        // ZIP local file header magic.
        assert_eq!(&payload[..2], b"PK");
        assert!(zip_logs_for_day(&dir.path().to_path_buf(), "1999-01-01").is_err());
    }
}
