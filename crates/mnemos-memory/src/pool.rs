//! Bounded pool of store handles.
//!
//! Checkout is gated by a semaphore with `capacity` permits. Idle handles are
//! reused; a new one is opened through the factory only when none is idle,
//! on the blocking thread pool for async checkouts. A checked-out handle goes
//! back to the idle list when its guard drops, so every error path returns it.

use mnemos_types::error::{MnemosError, MnemosResult};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type Factory<C> = Arc<dyn Fn() -> MnemosResult<C> + Send + Sync>;

/// Pool of SQLite store handles.
pub type ConnectionPool = Pool<rusqlite::Connection>;

struct PoolInner<C> {
    idle: Mutex<Vec<C>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    checkout_timeout: Duration,
    factory: Factory<C>,
}

/// A bounded, cloneable pool of handles of type `C`.
pub struct Pool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub idle: usize,
}

impl<C: Send + 'static> Pool<C> {
    /// Create a pool that opens handles lazily through `factory`.
    pub fn new<F>(capacity: usize, checkout_timeout: Duration, factory: F) -> Self
    where
        F: Fn() -> MnemosResult<C> + Send + Sync + 'static,
    {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                checkout_timeout,
                factory: Arc::new(factory),
            }),
        }
    }

    /// Check out a handle, waiting up to the configured checkout timeout.
    pub async fn acquire(&self) -> MnemosResult<PooledConnection<C>> {
        self.acquire_timeout(self.inner.checkout_timeout).await
    }

    /// Check out a handle, waiting up to `timeout`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> MnemosResult<PooledConnection<C>> {
        let permit = tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| self.exhausted())?
            .map_err(|e| MnemosError::Internal(format!("pool closed: {e}")))?;
        if let Some(conn) = self.pop_idle() {
            return Ok(self.guard(conn, permit));
        }

        debug!(capacity = self.inner.capacity, "Opening new pooled handle");
        let factory = Arc::clone(&self.inner.factory);
        let conn = tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| MnemosError::Internal(format!("pool open task failed: {e}")))??;
        Ok(self.guard(conn, permit))
    }

    /// Check out a handle without waiting. Opens a handle on the calling
    /// thread when none is idle.
    pub fn try_acquire(&self) -> MnemosResult<PooledConnection<C>> {
        let permit = Arc::clone(&self.inner.permits)
            .try_acquire_owned()
            .map_err(|_| self.exhausted())?;
        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => (self.inner.factory)()?,
        };
        Ok(self.guard(conn, permit))
    }

    fn pop_idle(&self) -> Option<C> {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
    }

    fn guard(&self, conn: C, permit: OwnedSemaphorePermit) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    fn exhausted(&self) -> MnemosError {
        let stats = self.stats();
        MnemosError::PoolExhausted {
            in_use: stats.in_use,
            capacity: stats.capacity,
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let available = self.inner.permits.available_permits();
        let idle = self
            .inner
            .idle
            .lock()
            .map(|idle| idle.len())
            .unwrap_or_default();
        PoolStats {
            capacity: self.inner.capacity,
            in_use: self.inner.capacity.saturating_sub(available),
            idle,
        }
    }
}

impl ConnectionPool {
    /// Pool of store handles opened (and recovered) at `path`.
    pub fn open(
        path: PathBuf,
        capacity: usize,
        checkout_timeout: Duration,
        busy_timeout: Duration,
    ) -> MnemosResult<Self> {
        // Every handle is opened up front: schema and recovery errors surface
        // at boot and checkouts never open SQLite on an async worker.
        let first = crate::open::open_store(&path, busy_timeout)?;
        let factory_path = path.clone();
        let pool = Self::new(capacity, checkout_timeout, move || {
            crate::open::open_store(&factory_path, busy_timeout)
        });
        let mut handles = vec![first];
        while handles.len() < pool.inner.capacity {
            handles.push(crate::open::open_store(&path, busy_timeout)?);
        }
        *pool.inner.idle.lock().unwrap_or_else(|e| e.into_inner()) = handles;
        Ok(pool)
    }
}

/// A checked-out handle. Returned to the pool on drop.
pub struct PooledConnection<C> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only taken in Drop.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<C> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(conn);
        }
    }
}
