//! Single-flight query dispatch.
//!
//! A dispatcher owns one user session: the selected server, at most one
//! in-flight query, an optional session-scoped direct connection, and the
//! watched-expression list refreshed after every query.
//!
//! For the array-database dialect the user's query is not sent verbatim.
//! It goes inside a protective envelope whose remote evaluation yields a
//! fixed 3-tuple `(sizeOk, (runOk, payload, stackTrace), consoleText)` —
//! this shape is a wire contract with existing remote processes and must
//! not change. Relational dialects skip the envelope and run through the
//! connection pool.
//!
//! Cancellation is best-effort and local: the in-flight handle is severed,
//! which makes the pending read fail; the remote server is not told to
//! stop and may keep computing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{Connection, Cursor, DriverRegistry, Value};
use crate::error::{QdeskError, Result};
use crate::pool::ConnectionManager;
use crate::server::ServerConfig;
use crate::watch::WatchList;

/// Marker locating the envelope's own frames in a remote stack trace.
/// Everything from the marker's line onward belongs to the wrapper, not
/// the user's query, and is trimmed before display.
const TRACE_MARKER: &str = ".Q.trp";

/// The protective meta-expression. Applied to `[maxBytes; queryText]` it
/// evaluates the query under a trap, captures the console rendering, and
/// checks the serialized size, yielding the fixed 3-tuple reply shape.
const QUERY_WRAPPER: &str = "{[mx;qe] r:.Q.trp[{(1b;value x;\"\")};qe;{[e;bt](0b;e;.Q.sbt bt)}]; c:$[first r;.Q.s r 1;\"\"]; s:count -8!r 1; ok:(mx=0)|s<=mx; (ok;$[ok;r;(first r;::;r 2)];c)}";

/// Outcome of one dispatched query. Exactly one of these is delivered per
/// `send`, whatever happens.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// The query ran. `value` is `None` when the result exceeded the size
    /// limit, leaving only the console text.
    Success {
        query: String,
        value: Option<Value>,
        cursor: Option<Cursor>,
        console: String,
    },
    /// The query (or the connection under it) failed.
    Error {
        query: String,
        message: String,
        trace: Option<String>,
    },
    /// The user cancelled while the query was in flight.
    Cancelled { query: String },
}

impl QueryResult {
    pub fn query(&self) -> &str {
        match self {
            QueryResult::Success { query, .. }
            | QueryResult::Error { query, .. }
            | QueryResult::Cancelled { query } => query,
        }
    }
}

/// Observer for dispatch lifecycle events. All callbacks default to no-ops.
pub trait DispatchListener: Send + Sync {
    fn query_started(&self, query: &str) {
        let _ = query;
    }

    fn query_finished(&self, result: &QueryResult) {
        let _ = result;
    }

    fn watches_refreshed(&self) {}
}

/// Per-session dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOptions {
    /// Send array-database queries inside the protective envelope.
    /// Disabling this sends raw queries, mainly for diagnosing
    /// wrapper-related failures.
    pub wrap_queries: bool,
    /// Maximum serialized result size in bytes; 0 means unlimited.
    pub max_result_bytes: u64,
    /// Keep one direct connection open across queries instead of opening
    /// and closing one per query.
    pub persist_connection: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            wrap_queries: true,
            max_result_bytes: 0,
            persist_connection: false,
        }
    }
}

#[derive(Default)]
struct DispatchState {
    querying: bool,
    cancelled: bool,
    server: Option<ServerConfig>,
    /// Handle used by the in-flight query; severed by `cancel`.
    current: Option<Arc<dyn Connection>>,
    /// Session-scoped direct connection, kept while persistence is on.
    session: Option<Arc<dyn Connection>>,
}

pub struct QueryDispatcher {
    manager: Arc<ConnectionManager>,
    drivers: Arc<DriverRegistry>,
    options: Mutex<DispatchOptions>,
    watches: Arc<WatchList>,
    listeners: Mutex<Vec<Arc<dyn DispatchListener>>>,
    state: Mutex<DispatchState>,
}

impl QueryDispatcher {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        let drivers = manager.drivers().clone();
        Arc::new(Self {
            manager,
            drivers,
            options: Mutex::new(DispatchOptions::default()),
            watches: Arc::new(WatchList::new()),
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(DispatchState::default()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn DispatchListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn watches(&self) -> &Arc<WatchList> {
        &self.watches
    }

    pub fn options(&self) -> DispatchOptions {
        self.options.lock().unwrap().clone()
    }

    pub fn set_options(&self, options: DispatchOptions) {
        let drop_session = !options.persist_connection;
        *self.options.lock().unwrap() = options;
        if drop_session {
            self.close_session();
        }
    }

    /// Select the target server. Switching servers drops any session
    /// connection to the previous one.
    pub fn set_server(&self, server: Option<ServerConfig>) {
        let old_session = {
            let mut state = self.state.lock().unwrap();
            if state.server == server {
                return;
            }
            state.server = server;
            state.session.take()
        };
        if let Some(conn) = old_session {
            conn.close();
        }
    }

    pub fn server(&self) -> Option<ServerConfig> {
        self.state.lock().unwrap().server.clone()
    }

    pub fn is_querying(&self) -> bool {
        self.state.lock().unwrap().querying
    }

    /// Close the session-scoped connection, if any.
    pub fn close_session(&self) {
        let session = self.state.lock().unwrap().session.take();
        if let Some(conn) = session {
            conn.close();
        }
    }

    /// Start a query on a background task.
    ///
    /// Fails immediately when another query is already in flight or no
    /// server is selected; the returned handle resolves to exactly one
    /// [`QueryResult`], which is also delivered to listeners.
    pub fn send(self: &Arc<Self>, query: &str) -> Result<JoinHandle<QueryResult>> {
        let server = {
            let mut state = self.state.lock().unwrap();
            if state.querying {
                return Err(QdeskError::AlreadyQuerying);
            }
            let Some(server) = state.server.clone() else {
                return Err(QdeskError::Connectivity("no server selected".into()));
            };
            state.querying = true;
            state.cancelled = false;
            server
        };

        self.notify(|l| l.query_started(query));
        let this = self.clone();
        let query = query.to_string();
        Ok(tokio::spawn(async move { this.run(server, query).await }))
    }

    /// Best-effort cancellation: sever the in-flight handle so the pending
    /// read fails locally. The outcome is reported as `Cancelled`, never as
    /// an error.
    pub fn cancel(&self) {
        let conn = {
            let mut state = self.state.lock().unwrap();
            if !state.querying {
                return;
            }
            state.cancelled = true;
            state.current.clone()
        };
        if let Some(conn) = conn {
            debug!("cancelling in-flight query");
            conn.close();
        }
    }

    async fn run(self: Arc<Self>, server: ServerConfig, query: String) -> QueryResult {
        let options = self.options();
        let outcome = if server.dialect.dialect().wraps_queries() {
            self.run_direct(&server, &query, &options).await
        } else {
            self.run_pooled(&server, &query).await
        };
        let result = match outcome {
            Ok(result) => result,
            Err(e) => self.classify_failure(&query, e),
        };

        // Completion is delivered before the watch refresh begins.
        self.notify(|l| l.query_finished(&result));
        if !matches!(result, QueryResult::Cancelled { .. }) {
            self.refresh_watches(&server).await;
        }
        self.finish(&options);
        result
    }

    async fn run_direct(
        &self,
        server: &ServerConfig,
        query: &str,
        options: &DispatchOptions,
    ) -> Result<QueryResult> {
        let conn = self.direct_connection(server, options).await?;
        if options.wrap_queries {
            let wrapped = wrap_query(query, options.max_result_bytes);
            let reply = conn.query(&wrapped).await?;
            decode_envelope(query, reply)
        } else {
            let value = conn.query(query).await?;
            Ok(QueryResult::Success {
                query: query.to_string(),
                console: value.console(),
                cursor: value.as_cursor(),
                value: Some(value),
            })
        }
    }

    async fn run_pooled(&self, server: &ServerConfig, query: &str) -> Result<QueryResult> {
        let cursor = self.manager.query(server, query).await?;
        Ok(QueryResult::Success {
            query: query.to_string(),
            console: format!("{} row(s)", cursor.rows.len()),
            value: Some(Value::Table(cursor.clone())),
            cursor: Some(cursor),
        })
    }

    /// Reuse the session connection when persistence is on and it is still
    /// open; otherwise open a fresh direct connection.
    async fn direct_connection(
        &self,
        server: &ServerConfig,
        options: &DispatchOptions,
    ) -> Result<Arc<dyn Connection>> {
        if options.persist_connection {
            let existing = self.state.lock().unwrap().session.clone();
            if let Some(conn) = existing {
                if conn.is_open() {
                    self.state.lock().unwrap().current = Some(conn.clone());
                    return Ok(conn);
                }
            }
        }

        let resolved = self.manager.resolve(server);
        let driver = self.drivers.driver_for(server.dialect)?;
        let conn = driver.connect(&resolved).await?;

        let mut state = self.state.lock().unwrap();
        state.current = Some(conn.clone());
        if options.persist_connection {
            state.session = Some(conn.clone());
        }
        Ok(conn)
    }

    fn classify_failure(&self, query: &str, err: QdeskError) -> QueryResult {
        if self.state.lock().unwrap().cancelled {
            return QueryResult::Cancelled {
                query: query.to_string(),
            };
        }
        match err {
            QdeskError::Remote { message, trace } => QueryResult::Error {
                query: query.to_string(),
                message,
                trace,
            },
            other => QueryResult::Error {
                query: query.to_string(),
                message: other.to_string(),
                trace: None,
            },
        }
    }

    async fn refresh_watches(&self, server: &ServerConfig) {
        if !self.watches.is_empty() {
            let conn = self.state.lock().unwrap().current.clone();
            match conn {
                Some(conn) if conn.is_open() => {
                    self.watches
                        .refresh(move |expr| {
                            let conn = conn.clone();
                            Box::pin(async move { conn.query(&expr).await })
                        })
                        .await;
                }
                _ => {
                    let manager = self.manager.clone();
                    let server = server.clone();
                    self.watches
                        .refresh(move |expr| {
                            let manager = manager.clone();
                            let server = server.clone();
                            Box::pin(async move {
                                let cursor = manager.query(&server, &expr).await?;
                                Ok(Value::Table(cursor))
                            })
                        })
                        .await;
                }
            }
        }
        self.notify(|l| l.watches_refreshed());
    }

    /// Release or retain the query's connection and leave the querying
    /// state.
    fn finish(&self, options: &DispatchOptions) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.current.take() {
            if options.persist_connection && !state.cancelled && conn.is_open() {
                state.session = Some(conn);
            } else {
                conn.close();
                state.session = None;
            }
        }
        state.querying = false;
    }

    fn notify(&self, f: impl Fn(&dyn DispatchListener)) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("dispatch listener panicked");
            }
        }
    }
}

/// Build the outgoing wrapped expression for a user query.
fn wrap_query(query: &str, max_result_bytes: u64) -> String {
    format!(
        "{}[{};{}]",
        QUERY_WRAPPER,
        max_result_bytes,
        escape_q_string(query)
    )
}

/// Quote a query as a string literal in the remote language.
fn escape_q_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn protocol_error() -> QdeskError {
    QdeskError::Protocol("reply does not match the expected 3-element envelope".into())
}

/// Decode the wrapped reply `(sizeOk, (runOk, payload, stackTrace),
/// consoleText)` into a result. A reply of any other shape is a
/// protocol-format error, fatal for this call.
fn decode_envelope(query: &str, reply: Value) -> Result<QueryResult> {
    let Value::List(items) = reply else {
        return Err(protocol_error());
    };
    let [size_ok, run, console]: [Value; 3] = items.try_into().map_err(|_| protocol_error())?;
    let size_ok = size_ok.as_bool().ok_or_else(protocol_error)?;
    let console = console.text();

    if !size_ok {
        // Oversized result: only the console text came back.
        return Ok(QueryResult::Success {
            query: query.to_string(),
            value: None,
            cursor: None,
            console,
        });
    }

    let Value::List(run_items) = run else {
        return Err(protocol_error());
    };
    let [run_ok, payload, trace]: [Value; 3] =
        run_items.try_into().map_err(|_| protocol_error())?;
    let run_ok = run_ok.as_bool().ok_or_else(protocol_error)?;

    if run_ok {
        Ok(QueryResult::Success {
            query: query.to_string(),
            cursor: payload.as_cursor(),
            value: Some(payload),
            console,
        })
    } else {
        let trace = trim_wrapper_frames(&trace.text());
        Ok(QueryResult::Error {
            query: query.to_string(),
            message: payload.text(),
            trace: if trace.is_empty() { None } else { Some(trace) },
        })
    }
}

/// Drop the wrapper's own frames from a remote stack trace: the marker's
/// line and everything after it belong to the envelope, not the query.
fn trim_wrapper_frames(trace: &str) -> String {
    match trace.find(TRACE_MARKER) {
        Some(pos) => match trace[..pos].rfind('\n') {
            Some(newline) => trace[..newline].to_string(),
            None => String::new(),
        },
        None => trace.to_string(),
    }
}
