//! PostgreSQL connection pool.
//!
//! A fixed set of slots, one connection each. A caller holds a slot for the
//! whole checkout, so each connection runs at most one query at a time.
//! Waiters park on a semaphore with one permit per slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::config::PgConfig;
use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::row::{FromRow, QueryResult};

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PgPoolConfig {
    /// Database connection URL
    pub url: String,
    /// Number of slots, i.e. the maximum number of connections
    pub size: usize,
    /// Connections opened by [`PgPool::connect`] before it returns
    pub min_connections: usize,
    /// How long `acquire` waits for a free slot (milliseconds when deserialized)
    #[serde(deserialize_with = "deserialize_millis")]
    pub acquire_timeout: Duration,
    /// How many times a query is retried on a fresh connection after a
    /// fatal connection error
    pub fatal_retries: u32,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self::new("postgresql://localhost/postgres")
    }
}

impl PgPoolConfig {
    /// Create a new pool configuration.
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            size: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_millis(5000),
            fatal_retries: 1,
        }
    }

    /// Set the number of slots.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the minimum number of connections.
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn fatal_retries(mut self, retries: u32) -> Self {
        self.fatal_retries = retries;
        self
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to its slot and the slot is
/// unlocked, whatever state the connection is in. A connection dropped
/// while a query is still in flight is reset first, so the slot reconnects
/// on its next checkout.
pub struct PooledConnection {
    /// The actual connection (None once returned to the slot)
    conn: Option<PgConnection>,
    /// Slot this connection belongs to
    index: usize,
    /// Reference back to the pool
    pool: Arc<PgPoolInner>,
    /// Released after `Drop::drop` has unlocked the slot
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Execute a simple query.
    pub async fn query(&mut self, sql: &str) -> PgResult<QueryResult> {
        self.conn
            .as_mut()
            .ok_or(PgError::NotConnected)?
            .query(sql)
            .await
    }

    pub fn connection(&self) -> Option<&PgConnection> {
        self.conn.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut PgConnection> {
        self.conn.as_mut()
    }

    /// Slot index within the pool.
    pub fn slot(&self) -> usize {
        self.index
    }

    /// Connect the slot's connection if it is not connected yet.
    async fn ensure_connected(&mut self) -> PgResult<()> {
        let conn = self.conn.as_mut().ok_or(PgError::NotConnected)?;
        if !conn.is_connected() {
            debug!(slot = self.index, "opening pooled connection");
            conn.connect().await?;
        }
        Ok(())
    }

    /// Discard the current connection and connect a fresh one.
    async fn replace(&mut self) -> PgResult<()> {
        let conn = self
            .conn
            .insert(PgConnection::new(self.pool.conn_config.clone()));
        conn.connect().await
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("index", &self.index)
            .field("conn", &self.conn)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // A query cancelled mid-response leaves unread messages behind.
        if let Some(conn) = self.conn.as_mut().filter(|c| c.is_busy()) {
            warn!(slot = self.index, "dropping connection with a cancelled query");
            conn.reset();
        }

        let mut slots = self.pool.slots.lock();
        if let Some(slot) = slots.get_mut(self.index) {
            slot.conn = self.conn.take();
            slot.locked = false;
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct PoolSlot {
    locked: bool,
    /// Created on first checkout
    conn: Option<PgConnection>,
}

impl PoolSlot {
    fn is_idle(&self) -> bool {
        !self.locked && self.conn.as_ref().is_some_and(|c| c.is_connected())
    }
}

/// Internal pool state.
struct PgPoolInner {
    /// Pool configuration
    config: PgPoolConfig,
    /// Parsed from `config.url`
    conn_config: PgConfig,
    slots: Mutex<Vec<PoolSlot>>,
    /// One permit per unlocked slot
    semaphore: Arc<Semaphore>,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// Cloning is cheap; all clones share the same slots.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl PgPool {
    /// Create a pool without opening any connection.
    pub fn new(config: PgPoolConfig) -> PgResult<Self> {
        let conn_config = PgConfig::from_url(&config.url)?;
        Self::with_connection_config(config, conn_config)
    }

    /// Create a pool whose connections use `conn_config` instead of `config.url`.
    pub fn with_connection_config(config: PgPoolConfig, conn_config: PgConfig) -> PgResult<Self> {
        if config.size == 0 {
            return Err(PgError::Config("pool size must be at least 1".to_string()));
        }
        if config.min_connections > config.size {
            return Err(PgError::Config(format!(
                "min_connections ({}) exceeds pool size ({})",
                config.min_connections, config.size
            )));
        }

        let slots = (0..config.size)
            .map(|_| PoolSlot {
                locked: false,
                conn: None,
            })
            .collect();

        Ok(Self {
            inner: Arc::new(PgPoolInner {
                semaphore: Arc::new(Semaphore::new(config.size)),
                slots: Mutex::new(slots),
                conn_config,
                config,
            }),
        })
    }

    /// Create a pool and open `min_connections` connections.
    pub async fn connect(config: PgPoolConfig) -> PgResult<Self> {
        let pool = Self::new(config)?;

        // Pre-create minimum connections
        for index in 0..pool.inner.config.min_connections {
            let conn = PgConnection::open(pool.inner.conn_config.clone()).await?;
            if let Some(slot) = pool.inner.slots.lock().get_mut(index) {
                slot.conn = Some(conn);
            }
        }

        Ok(pool)
    }

    /// Check out a slot, waiting up to `acquire_timeout` for one to free up.
    ///
    /// The slot's connection is opened here if it is not connected.
    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        let timeout = self.inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PgError::Config("connection pool is closed".to_string())),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for a pooled connection");
                return Err(PgError::PoolTimeout(timeout));
            }
        };

        let (index, conn) = {
            let mut slots = self.inner.slots.lock();
            // Prefer a slot that already holds a live connection.
            let index = slots
                .iter()
                .position(PoolSlot::is_idle)
                .or_else(|| slots.iter().position(|s| !s.locked))
                .ok_or_else(|| PgError::Config("no unlocked slot for granted permit".to_string()))?;

            let slot = &mut slots[index];
            slot.locked = true;
            let conn = slot
                .conn
                .take()
                .unwrap_or_else(|| PgConnection::new(self.inner.conn_config.clone()));
            (index, conn)
        };

        let mut pooled = PooledConnection {
            conn: Some(conn),
            index,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        };
        pooled.ensure_connected().await?;
        Ok(pooled)
    }

    /// Execute a simple query on a pooled connection.
    ///
    /// A fatal connection error replaces the connection and retries, up to
    /// `fatal_retries` times. Server errors are returned as is.
    pub async fn query(&self, sql: &str) -> PgResult<QueryResult> {
        let mut conn = self.acquire().await?;
        let mut retries = self.inner.config.fatal_retries;

        loop {
            match conn.query(sql).await {
                Err(e) if e.is_fatal() && retries > 0 => {
                    retries -= 1;
                    warn!(slot = conn.index, error = %e, "replacing connection and retrying query");
                    conn.replace().await?;
                }
                result => return result,
            }
        }
    }

    /// Execute a query and convert each row with [`FromRow`].
    pub async fn query_as<T: FromRow>(&self, sql: &str) -> PgResult<QueryResult<T>> {
        self.query(sql).await?.into_typed()
    }

    /// Execute a query without returning results (INSERT, UPDATE, DELETE).
    pub async fn execute(&self, sql: &str) -> PgResult<u64> {
        let result = self.query(sql).await?;
        // Parse rows affected from command tag (e.g., "INSERT 0 5" -> 5)
        Ok(result.rows_affected())
    }

    /// Close every connection not currently checked out.
    pub async fn terminate(&self) {
        let connections: Vec<PgConnection> = {
            let mut slots = self.inner.slots.lock();
            slots
                .iter_mut()
                .filter(|s| !s.locked)
                .filter_map(|s| s.conn.take())
                .collect()
        };

        for mut conn in connections {
            if let Err(e) = conn.terminate().await {
                debug!(error = %e, "error while terminating pooled connection");
            }
        }
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.inner.config.size
    }

    /// Get the current number of idle connected slots.
    pub fn idle_count(&self) -> usize {
        self.inner.slots.lock().iter().filter(|s| s.is_idle()).count()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PgPoolConfig {
        &self.inner.config
    }
}
