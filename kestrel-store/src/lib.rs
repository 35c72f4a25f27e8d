//! SQLite-backed persistence for engine runtime state.
//!
//! The store hides the concrete database behind a small contract: an atomic
//! session row, CAS-versioned strategy snapshots, an append-only order event
//! log and the ordered bar log used for crash recovery. All access happens
//! from the Trade Manager domain; adapters never touch it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use kestrel_core::{Bar, Order, OrderState, Session, Symbol};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure variants surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency failure: the on-disk version is newer.
    #[error("stale strategy state version: expected {expected}, found {found}")]
    StaleVersion { expected: u64, found: u64 },
    /// The database is unreachable and reconnection attempts were exhausted.
    #[error("store unavailable after {attempts} reconnect attempts")]
    Unavailable { attempts: u32 },
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// One persisted strategy snapshot with its CAS version.
#[derive(Clone, Debug)]
pub struct PersistedStrategy {
    pub strategy_id: Uuid,
    pub version: u64,
    pub state: serde_json::Value,
}

/// One row of the append-only order event log.
#[derive(Clone, Debug)]
pub struct OrderEventRow {
    pub seq: i64,
    pub order_id: Uuid,
    pub from_state: OrderState,
    pub to_state: OrderState,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Everything recovery needs to rebuild a running session.
#[derive(Debug, Default)]
pub struct RecoveryContext {
    pub session: Option<Session>,
    pub strategies: Vec<PersistedStrategy>,
    pub open_orders: Vec<Order>,
    /// Ordered bar log since day start, oldest first.
    pub bars: Vec<(Symbol, Bar)>,
}

/// Durable key/value and append-log storage over a single SQLite file.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
    healthy: AtomicBool,
}

impl Store {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|err| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(format!("cannot create {}: {err}", dir.display())),
                    )
                })?;
            }
        }
        let conn = Self::connect(&path)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
            healthy: AtomicBool::new(true),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
            healthy: AtomicBool::new(true),
        })
    }

    fn connect(path: &Path) -> StoreResult<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                trading_day TEXT NOT NULL,
                account     TEXT NOT NULL,
                payload     TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (trading_day, account)
            );

            CREATE TABLE IF NOT EXISTS strategy_states (
                session_id  TEXT NOT NULL,
                strategy_id TEXT NOT NULL,
                version     INTEGER NOT NULL,
                payload     TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (session_id, strategy_id)
            );

            CREATE TABLE IF NOT EXISTS order_events (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id   TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state   TEXT NOT NULL,
                timestamp  TEXT NOT NULL,
                payload    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_order_events_order ON order_events(order_id, seq);

            CREATE TABLE IF NOT EXISTS bar_log (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                instrument TEXT NOT NULL,
                payload    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bar_log_session ON bar_log(session_id, seq);
            "#,
        )?;
        Ok(())
    }

    /// Whether the last reconnect cycle left the store usable.
    ///
    /// While false the engine must refuse order-state transitions and keep
    /// strategies blocked.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Canonical session identifier used to key dependent rows.
    #[must_use]
    pub fn session_id(day: NaiveDate, account: &str) -> String {
        format!("{day}:{account}")
    }

    fn run<T>(&self, op: impl Fn(&Connection) -> Result<T, rusqlite::Error>) -> StoreResult<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        match op(&conn) {
            Ok(value) => {
                self.healthy.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Err(err) if is_connection_failure(&err) => {
                warn!(error = %err, "store connection failure, attempting reconnect");
                for attempt in 1..=RECONNECT_ATTEMPTS {
                    thread::sleep(RECONNECT_BACKOFF);
                    match Self::connect(&self.path) {
                        Ok(fresh) => {
                            *conn = fresh;
                            match op(&conn) {
                                Ok(value) => {
                                    self.healthy.store(true, Ordering::SeqCst);
                                    return Ok(value);
                                }
                                Err(retry_err) if is_connection_failure(&retry_err) => {
                                    warn!(attempt, error = %retry_err, "store retry failed");
                                }
                                Err(other) => return Err(other.into()),
                            }
                        }
                        Err(open_err) => {
                            warn!(attempt, error = %open_err, "store reopen failed");
                        }
                    }
                }
                self.healthy.store(false, Ordering::SeqCst);
                error!("store marked unhealthy, engine must freeze state transitions");
                Err(StoreError::Unavailable {
                    attempts: RECONNECT_ATTEMPTS,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the session row for its (day, account) key.
    pub fn put_session(&self, session: &Session) -> StoreResult<()> {
        let payload = serde_json::to_string(session)?;
        let day = session.trading_day.to_string();
        let account = session.account.clone();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO sessions (trading_day, account, payload, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(trading_day, account) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
                "#,
                params![day, account, payload, Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
    }

    pub fn get_session(&self, day: NaiveDate, account: &str) -> StoreResult<Option<Session>> {
        let day = day.to_string();
        let account = account.to_string();
        let raw: Option<String> = self.run(move |conn| {
            conn.query_row(
                "SELECT payload FROM sessions WHERE trading_day = ?1 AND account = ?2",
                params![day, account],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    /// Compare-and-swap write of a strategy state blob.
    ///
    /// `expected_version` is the version the caller last observed (0 for the
    /// first write). Returns the new on-disk version.
    pub fn put_strategy_state(
        &self,
        session_id: &str,
        strategy_id: Uuid,
        state: &serde_json::Value,
        expected_version: u64,
    ) -> StoreResult<u64> {
        let payload = serde_json::to_string(state)?;
        let session_id = session_id.to_string();
        let sid = strategy_id.to_string();
        let current: Option<u64> = self.run({
            let session_id = session_id.clone();
            let sid = sid.clone();
            move |conn| {
                conn.query_row(
                    "SELECT version FROM strategy_states WHERE session_id = ?1 AND strategy_id = ?2",
                    params![session_id, sid],
                    |row| row.get::<_, i64>(0).map(|v| v as u64),
                )
                .optional()
            }
        })?;
        if let Some(found) = current {
            if found > expected_version {
                return Err(StoreError::StaleVersion {
                    expected: expected_version,
                    found,
                });
            }
        }
        let new_version = expected_version + 1;
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO strategy_states (session_id, strategy_id, version, payload, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id, strategy_id) DO UPDATE SET
                    version = excluded.version,
                    payload = excluded.payload,
                    updated_at = excluded.updated_at
                "#,
                params![
                    session_id,
                    sid,
                    new_version as i64,
                    payload,
                    Utc::now().to_rfc3339()
                ],
            )
            .map(|_| ())
        })?;
        Ok(new_version)
    }

    /// Append one order state transition. Durable once this returns.
    pub fn append_order_event(
        &self,
        order_id: Uuid,
        from_state: OrderState,
        to_state: OrderState,
        timestamp: DateTime<Utc>,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        let payload = serde_json::to_string(payload)?;
        let oid = order_id.to_string();
        let from = format!("{from_state:?}");
        let to = format!("{to_state:?}");
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO order_events (order_id, from_state, to_state, timestamp, payload)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![oid, from, to, timestamp.to_rfc3339(), payload],
            )
            .map(|_| ())
        })
    }

    /// Full transition history of one order, in append order.
    pub fn order_events(&self, order_id: Uuid) -> StoreResult<Vec<OrderEventRow>> {
        let oid = order_id.to_string();
        let rows: Vec<(i64, String, String, String, String)> = self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, from_state, to_state, timestamp, payload
                 FROM order_events WHERE order_id = ?1 ORDER BY seq",
            )?;
            let mapped = stmt.query_map(params![oid], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect()
        })?;
        rows.into_iter()
            .map(|(seq, from, to, ts, payload)| {
                Ok(OrderEventRow {
                    seq,
                    order_id,
                    from_state: parse_state(&from)?,
                    to_state: parse_state(&to)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    /// Append one bar to the day's ordered log.
    pub fn append_bar(&self, session_id: &str, instrument: &str, bar: &Bar) -> StoreResult<()> {
        let payload = serde_json::to_string(bar)?;
        let session_id = session_id.to_string();
        let instrument = instrument.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO bar_log (session_id, instrument, payload) VALUES (?1, ?2, ?3)",
                params![session_id, instrument, payload],
            )
            .map(|_| ())
        })
    }

    /// Load the session, latest strategy blobs, open orders and the bar log.
    pub fn load_recovery_context(
        &self,
        account: &str,
        day: NaiveDate,
    ) -> StoreResult<RecoveryContext> {
        let session = self.get_session(day, account)?;
        let session_id = Self::session_id(day, account);

        let strategies = {
            let session_id = session_id.clone();
            let rows: Vec<(String, i64, String)> = self.run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT strategy_id, version, payload FROM strategy_states WHERE session_id = ?1",
                )?;
                let mapped = stmt.query_map(params![session_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                mapped.collect()
            })?;
            rows.into_iter()
                .filter_map(|(sid, version, payload)| {
                    let strategy_id = Uuid::parse_str(&sid).ok()?;
                    let state = serde_json::from_str(&payload).ok()?;
                    Some(PersistedStrategy {
                        strategy_id,
                        version: version as u64,
                        state,
                    })
                })
                .collect()
        };

        // Latest event per order; non-terminal latest state means the order
        // was still open at crash time.
        let latest: Vec<String> = self.run(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT payload FROM order_events e
                WHERE seq = (SELECT MAX(seq) FROM order_events WHERE order_id = e.order_id)
                "#,
            )?;
            let mapped = stmt.query_map([], |row| row.get(0))?;
            mapped.collect()
        })?;
        let mut open_orders = Vec::new();
        for payload in latest {
            match serde_json::from_str::<Order>(&payload) {
                Ok(order) if !order.state.is_terminal() => open_orders.push(order),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping undecodable order event payload"),
            }
        }

        let bars = {
            let session_id = session_id.clone();
            let rows: Vec<(String, String)> = self.run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT instrument, payload FROM bar_log WHERE session_id = ?1 ORDER BY seq",
                )?;
                let mapped =
                    stmt.query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                mapped.collect()
            })?;
            rows.into_iter()
                .filter_map(|(instrument, payload)| {
                    serde_json::from_str::<Bar>(&payload)
                        .ok()
                        .map(|bar| (instrument, bar))
                })
                .collect()
        };

        Ok(RecoveryContext {
            session,
            strategies,
            open_orders,
            bars,
        })
    }
}

fn parse_state(raw: &str) -> StoreResult<OrderState> {
    serde_json::from_value(serde_json::Value::String(raw.to_string())).map_err(Into::into)
}

fn is_connection_failure(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::DiskFull
                    | ErrorCode::SystemIoFailure
            )
    )
}
