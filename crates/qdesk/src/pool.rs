//! Pooled connection manager for relational backends.
//!
//! One pool per server identity, created lazily. Pools are keyed by config
//! *value*, so two structurally-equal configs share a pool. Borrowed handles
//! are exclusive until returned; `give_back` must run on every path or the
//! pool leaks a slot.
//!
//! The manager also owns the stale-handle retry: some long-lived remote
//! processes silently close idle handles, detectable only by error text on
//! the next use. Such a call is retried exactly once on a fresh handle.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::driver::{Connection, Cursor, DriverRegistry};
use crate::error::{QdeskError, Result};
use crate::server::{DialectTag, ServerConfig};

/// Default login applied to configs that carry no credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Pluggable per-dialect credential resolver. May rewrite host, port,
/// database, or credentials before a pool connects.
pub trait Authenticator: Send + Sync {
    fn resolve(&self, server: &ServerConfig) -> ServerConfig;
}

/// Observer for edge-triggered connection-state changes.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, server: &ServerConfig) {
        let _ = server;
    }

    fn disconnected(&self, server: &ServerConfig) {
        let _ = server;
    }
}

/// Pool sizing and acquisition limits.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum handles per server pool.
    pub max_size: usize,
    /// How long a borrow waits on an exhausted pool before failing.
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// One pool of reusable handles plus the last-known-connected flag.
struct ServerPool {
    resolved: ServerConfig,
    idle: Mutex<Vec<Arc<dyn Connection>>>,
    slots: Arc<Semaphore>,
    connected: AtomicBool,
}

/// Owns one connection pool per server identity.
pub struct ConnectionManager {
    drivers: Arc<DriverRegistry>,
    options: PoolOptions,
    pools: Mutex<HashMap<ServerConfig, Arc<ServerPool>>>,
    default_login: Mutex<Option<Credentials>>,
    authenticators: Mutex<HashMap<DialectTag, Arc<dyn Authenticator>>>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionManager {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self::with_options(drivers, PoolOptions::default())
    }

    pub fn with_options(drivers: Arc<DriverRegistry>, options: PoolOptions) -> Self {
        Self {
            drivers,
            options,
            pools: Mutex::new(HashMap::new()),
            default_login: Mutex::new(None),
            authenticators: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    /// Set or clear the default login. Existing pools were resolved against
    /// the old credentials, so they are all closed.
    pub fn set_default_login(&self, login: Option<Credentials>) {
        *self.default_login.lock().unwrap() = login;
        self.close_all();
    }

    pub fn register_authenticator(&self, tag: DialectTag, auth: Arc<dyn Authenticator>) {
        self.authenticators.lock().unwrap().insert(tag, auth);
    }

    /// Apply default-login and authenticator rewrites to a config.
    pub fn resolve(&self, server: &ServerConfig) -> ServerConfig {
        let mut resolved = server.clone();
        if resolved.username.is_empty() && resolved.password.is_empty() {
            if let Some(login) = self.default_login.lock().unwrap().clone() {
                resolved.username = login.username;
                resolved.password = login.password;
            }
        }
        let auth = self.authenticators.lock().unwrap().get(&server.dialect).cloned();
        if let Some(auth) = auth {
            resolved = auth.resolve(&resolved);
        }
        resolved
    }

    /// Last-known-connected state for a server.
    pub fn is_connected(&self, server: &ServerConfig) -> bool {
        self.pools
            .lock()
            .unwrap()
            .get(server)
            .map(|p| p.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn pool_for(&self, server: &ServerConfig) -> Arc<ServerPool> {
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(server.clone())
            .or_insert_with(|| {
                debug!("creating pool for '{}'", server.name);
                Arc::new(ServerPool {
                    resolved: self.resolve(server),
                    idle: Mutex::new(Vec::new()),
                    slots: Arc::new(Semaphore::new(self.options.max_size)),
                    connected: AtomicBool::new(false),
                })
            })
            .clone()
    }

    /// Borrow an exclusive handle, creating the pool on first use.
    ///
    /// Blocks (up to the acquire timeout) when the pool is exhausted. Dead
    /// idle handles are invalidated rather than handed out.
    pub async fn borrow(&self, server: &ServerConfig) -> Result<Arc<dyn Connection>> {
        let pool = self.pool_for(server);

        let acquired = tokio::time::timeout(
            self.options.acquire_timeout,
            pool.slots.clone().acquire_owned(),
        )
        .await;
        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(QdeskError::Connectivity(format!(
                    "pool for '{}' is closed",
                    server.name
                )))
            }
            Err(_) => {
                return Err(QdeskError::Connectivity(format!(
                    "timed out waiting for a connection to '{}'",
                    server.name
                )))
            }
        };
        // The slot is tracked manually: give_back restores it.
        permit.forget();

        loop {
            let candidate = pool.idle.lock().unwrap().pop();
            match candidate {
                Some(conn) if conn.is_open() => {
                    self.mark_connected(server, &pool);
                    return Ok(conn);
                }
                Some(conn) => conn.close(),
                None => break,
            }
        }

        let driver = match self.drivers.driver_for(server.dialect) {
            Ok(driver) => driver,
            Err(e) => {
                pool.slots.add_permits(1);
                self.mark_disconnected(server, &pool);
                return Err(e);
            }
        };

        match driver.connect(&pool.resolved).await {
            Ok(conn) if conn.is_open() => {
                self.mark_connected(server, &pool);
                Ok(conn)
            }
            Ok(conn) => {
                conn.close();
                pool.slots.add_permits(1);
                self.mark_disconnected(server, &pool);
                Err(QdeskError::Connectivity(format!(
                    "driver returned a closed handle for '{}'",
                    server.name
                )))
            }
            Err(e) => {
                pool.slots.add_permits(1);
                self.mark_disconnected(server, &pool);
                Err(e)
            }
        }
    }

    /// Return a borrowed handle. Must be called on every code path,
    /// including failures, or the pool slot leaks.
    ///
    /// The handle goes back to the idle set when healthy; it is discarded
    /// when `invalidate` is set or the handle is closed.
    pub fn give_back(&self, server: &ServerConfig, conn: Arc<dyn Connection>, invalidate: bool) {
        let pool = self.pools.lock().unwrap().get(server).cloned();
        let Some(pool) = pool else {
            // Pool was closed while the handle was out.
            conn.close();
            return;
        };

        if invalidate || !conn.is_open() {
            conn.close();
        } else {
            pool.idle.lock().unwrap().push(conn);
        }
        pool.slots.add_permits(1);
    }

    /// Drain and discard the pool for one server, marking it disconnected.
    pub fn close_pool(&self, server: &ServerConfig) {
        let pool = self.pools.lock().unwrap().remove(server);
        if let Some(pool) = pool {
            self.drain_pool(server, &pool);
        }
    }

    /// Close every pool. An individual pool failing to drain must not stop
    /// the rest from closing.
    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().unwrap().drain().collect();
        for (server, pool) in pools {
            let result = catch_unwind(AssertUnwindSafe(|| self.drain_pool(&server, &pool)));
            if result.is_err() {
                warn!("failed to close pool for '{}'", server.name);
            }
        }
    }

    fn drain_pool(&self, server: &ServerConfig, pool: &ServerPool) {
        let idle: Vec<_> = pool.idle.lock().unwrap().drain(..).collect();
        for conn in idle {
            conn.close();
        }
        if pool.connected.swap(false, Ordering::SeqCst) {
            self.notify(|l| l.disconnected(server));
        }
    }

    fn mark_connected(&self, server: &ServerConfig, pool: &ServerPool) {
        if pool
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.notify(|l| l.connected(server));
        }
    }

    fn mark_disconnected(&self, server: &ServerConfig, pool: &ServerPool) {
        if pool.connected.swap(false, Ordering::SeqCst) {
            self.notify(|l| l.disconnected(server));
        }
    }

    fn notify(&self, f: impl Fn(&dyn ConnectionListener)) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                warn!("connection listener panicked");
            }
        }
    }

    /// Borrow, run `op`, and always return the handle.
    ///
    /// A first failure whose text carries a stale-handle marker gets one
    /// silent retry on a fresh handle. A second consecutive failure
    /// propagates unchanged and proactively invalidates the whole pool
    /// entry — two failures in a row mean the endpoint, not the handle.
    async fn run_with_retry<T, F>(&self, server: &ServerConfig, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>) -> BoxFuture<'static, Result<T>>,
    {
        let conn = self.borrow(server).await?;
        match op(conn.clone()).await {
            Ok(value) => {
                self.give_back(server, conn, false);
                Ok(value)
            }
            Err(first) if is_stale_error(server.dialect, &first) => {
                debug!("stale handle on '{}', retrying once: {}", server.name, first);
                self.give_back(server, conn, true);

                let fresh = self.borrow(server).await?;
                match op(fresh.clone()).await {
                    Ok(value) => {
                        self.give_back(server, fresh, false);
                        Ok(value)
                    }
                    Err(second) => {
                        self.give_back(server, fresh, true);
                        self.close_pool(server);
                        Err(second)
                    }
                }
            }
            Err(other) => {
                self.give_back(server, conn, false);
                Err(other)
            }
        }
    }

    /// Run a query and return its relational cursor view.
    pub async fn query(&self, server: &ServerConfig, sql: &str) -> Result<Cursor> {
        let sql = sql.to_string();
        let value = self
            .run_with_retry(server, move |conn| {
                let sql = sql.clone();
                Box::pin(async move { conn.query(&sql).await })
            })
            .await?;
        Ok(value.into_cursor())
    }

    /// Run a statement, reporting success as a boolean. Statement-level
    /// errors are logged, never thrown to the caller.
    pub async fn execute(&self, server: &ServerConfig, sql: &str) -> bool {
        let sql_owned = sql.to_string();
        let outcome = self
            .run_with_retry(server, move |conn| {
                let sql = sql_owned.clone();
                Box::pin(async move { conn.execute(&sql).await })
            })
            .await;
        match outcome {
            Ok(_) => true,
            Err(e) => {
                warn!("statement failed on '{}': {}", server.name, e);
                false
            }
        }
    }
}

/// Whether an error's text carries one of the dialect's stale-handle
/// markers. A textual contract: the remote servers only emit text.
fn is_stale_error(tag: DialectTag, err: &QdeskError) -> bool {
    let markers = tag.dialect().stale_handle_markers();
    if markers.is_empty() {
        return false;
    }
    match err {
        QdeskError::Remote { .. } | QdeskError::Connectivity(_) => {
            let text = err.to_string();
            markers.iter().any(|m| text.contains(m))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, Value};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct MockConnection {
        open: AtomicBool,
        replies: Mutex<VecDeque<Result<Value>>>,
        calls: AtomicUsize,
    }

    impl MockConnection {
        fn new() -> Arc<Self> {
            Self::scripted(Vec::new())
        }

        fn scripted(replies: Vec<Result<Value>>) -> Arc<Self> {
            Arc::new(Self {
                open: AtomicBool::new(true),
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn query(&self, _text: &str) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::Long(0)))
        }

        async fn execute(&self, text: &str) -> Result<u64> {
            self.query(text).await.map(|_| 1)
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
    }

    struct MockDriver {
        tag: DialectTag,
        connects: AtomicUsize,
        scripted: Mutex<VecDeque<Arc<MockConnection>>>,
        seen: Mutex<Vec<ServerConfig>>,
    }

    impl MockDriver {
        fn new(tag: DialectTag) -> Arc<Self> {
            Arc::new(Self {
                tag,
                connects: AtomicUsize::new(0),
                scripted: Mutex::new(VecDeque::new()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn push(&self, conn: Arc<MockConnection>) {
            self.scripted.lock().unwrap().push_back(conn);
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        fn dialect(&self) -> DialectTag {
            self.tag
        }

        async fn connect(&self, server: &ServerConfig) -> Result<Arc<dyn Connection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(server.clone());
            let conn = self
                .scripted
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(MockConnection::new);
            Ok(conn)
        }
    }

    fn setup(tag: DialectTag) -> (Arc<MockDriver>, ConnectionManager) {
        let driver = MockDriver::new(tag);
        let registry = Arc::new(DriverRegistry::new());
        registry.register(driver.clone());
        (driver, ConnectionManager::new(registry))
    }

    fn server(tag: DialectTag) -> ServerConfig {
        ServerConfig::new("test/srv", "localhost", 5000).with_dialect(tag)
    }

    #[tokio::test]
    async fn test_borrow_reuses_returned_handle() {
        let (driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        let conn = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, conn, false);
        let _again = manager.borrow(&srv).await.unwrap();

        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_borrow_invalidates_dead_idle_handle() {
        let (driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        let conn = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, conn.clone(), false);
        conn.close();

        let fresh = manager.borrow(&srv).await.unwrap();
        assert!(fresh.is_open());
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_give_back_invalidate_discards() {
        let (driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        let conn = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, conn.clone(), true);
        assert!(!conn.is_open());

        let _fresh = manager.borrow(&srv).await.unwrap();
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
    }

    struct CountingListener {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl ConnectionListener for CountingListener {
        fn connected(&self, _server: &ServerConfig) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn disconnected(&self, _server: &ServerConfig) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_edge_triggered_notifications() {
        let (_driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);
        let listener = Arc::new(CountingListener {
            connected: AtomicUsize::new(0),
            disconnected: AtomicUsize::new(0),
        });
        manager.add_listener(listener.clone());

        let a = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, a, false);
        let b = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, b, false);

        // Two successful borrows, one state flip.
        assert_eq!(listener.connected.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected(&srv));

        manager.close_pool(&srv);
        manager.close_pool(&srv); // second close is a no-op
        assert_eq!(listener.disconnected.load(Ordering::SeqCst), 1);
        assert!(!manager.is_connected(&srv));
    }

    #[tokio::test]
    async fn test_stale_handle_retry_succeeds_once() {
        let (driver, manager) = setup(DialectTag::Kq);
        let srv = server(DialectTag::Kq);

        let stale = MockConnection::scripted(vec![Err(QdeskError::remote(
            "read failed: Connection reset by peer",
        ))]);
        let fresh = MockConnection::scripted(vec![Ok(Value::Long(42))]);
        driver.push(stale.clone());
        driver.push(fresh.clone());

        let cursor = manager.query(&srv, "select 1").await.unwrap();
        assert_eq!(cursor.rows, vec![vec!["42".to_string()]]);
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(stale.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fresh.calls.load(Ordering::SeqCst), 1);
        // The stale handle was invalidated, not pooled.
        assert!(!stale.is_open());
    }

    #[tokio::test]
    async fn test_stale_retry_failure_propagates_and_invalidates_pool() {
        let (driver, manager) = setup(DialectTag::Kq);
        let srv = server(DialectTag::Kq);

        driver.push(MockConnection::scripted(vec![Err(QdeskError::remote(
            "end of stream reached",
        ))]));
        driver.push(MockConnection::scripted(vec![Err(QdeskError::remote(
            "end of stream reached",
        ))]));

        let err = manager.query(&srv, "select 1").await.unwrap_err();
        assert!(err.to_string().contains("end of stream"));
        assert_eq!(driver.connects.load(Ordering::SeqCst), 2);
        // Consecutive-failure policy: the pool entry is gone.
        assert!(!manager.is_connected(&srv));
        assert!(manager.pools.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_stale_error_is_not_retried() {
        let (driver, manager) = setup(DialectTag::Kq);
        let srv = server(DialectTag::Kq);

        driver.push(MockConnection::scripted(vec![Err(QdeskError::remote("type"))]));

        let err = manager.query(&srv, "1+`a").await.unwrap_err();
        assert_eq!(err.to_string(), "remote error: type");
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_markers_do_not_apply_to_relational_dialects() {
        let (driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        driver.push(MockConnection::scripted(vec![Err(QdeskError::remote(
            "Connection reset by peer",
        ))]));

        assert!(manager.query(&srv, "select 1").await.is_err());
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_reports_failure_without_throwing() {
        let (driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        driver.push(MockConnection::scripted(vec![Err(QdeskError::remote(
            "syntax error",
        ))]));

        assert!(!manager.execute(&srv, "create table t()").await);
        assert!(manager.execute(&srv, "create table t(a int)").await);
        // The failed statement did not leak the pool slot.
        assert_eq!(driver.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_login_and_authenticator_resolution() {
        struct Rewriter;

        impl Authenticator for Rewriter {
            fn resolve(&self, server: &ServerConfig) -> ServerConfig {
                let mut out = server.clone();
                out.host = "gateway.example.com".into();
                out.port = 6000;
                out
            }
        }

        let (driver, manager) = setup(DialectTag::Kq);
        manager.set_default_login(Some(Credentials::new("default", "hunter2")));
        manager.register_authenticator(DialectTag::Kq, Arc::new(Rewriter));

        let srv = server(DialectTag::Kq);
        let conn = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, conn, false);

        let seen = driver.seen.lock().unwrap();
        assert_eq!(seen[0].username, "default");
        assert_eq!(seen[0].password, "hunter2");
        assert_eq!(seen[0].host, "gateway.example.com");
        assert_eq!(seen[0].port, 6000);
    }

    #[tokio::test]
    async fn test_credential_change_closes_pools() {
        let (_driver, manager) = setup(DialectTag::Postgres);
        let srv = server(DialectTag::Postgres);

        let conn = manager.borrow(&srv).await.unwrap();
        manager.give_back(&srv, conn, false);
        assert!(manager.is_connected(&srv));

        manager.set_default_login(Some(Credentials::new("u", "p")));
        assert!(!manager.is_connected(&srv));
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let driver = MockDriver::new(DialectTag::Postgres);
        let registry = Arc::new(DriverRegistry::new());
        registry.register(driver);
        let manager = ConnectionManager::with_options(
            registry,
            PoolOptions {
                max_size: 1,
                acquire_timeout: Duration::from_millis(20),
            },
        );
        let srv = server(DialectTag::Postgres);

        let held = manager.borrow(&srv).await.unwrap();
        let err = manager.borrow(&srv).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        manager.give_back(&srv, held, false);
        assert!(manager.borrow(&srv).await.is_ok());
    }
}
