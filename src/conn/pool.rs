use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::{Duration, Instant},
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{Connection, Handshaker};
use crate::{
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// The subset of client options a per-address pool needs.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) max_idle_time: Option<Duration>,
    pub(crate) max_pool_size: Option<u32>,
    pub(crate) min_pool_size: Option<u32>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
        }
    }
}

/// A per-address pool of established connections.
///
/// Checked-in connections are kept LIFO so that operations prefer warm links;
/// connections idle longer than `maxIdleTimeMS` are discarded at checkout
/// (unless doing so would drop the pool below `minPoolSize`). Clearing the
/// pool bumps its generation, which lazily discards all connections
/// established before the clear.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    address: ServerAddress,
    handshaker: Handshaker,
    options: ConnectionPoolOptions,
    semaphore: Arc<Semaphore>,
    connections: Mutex<Vec<Connection>>,
    generation: AtomicU32,
    next_id: AtomicU32,
    total: AtomicU32,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        handshaker: Handshaker,
        options: ConnectionPoolOptions,
    ) -> Self {
        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);
        Self {
            inner: Arc::new(PoolInner {
                address,
                handshaker,
                options,
                semaphore: Arc::new(Semaphore::new(max_pool_size as usize)),
                connections: Mutex::new(Vec::new()),
                generation: AtomicU32::new(0),
                next_id: AtomicU32::new(0),
                total: AtomicU32::new(0),
            }),
        }
    }

    /// Checks out an exclusive connection, establishing a new one if no pooled
    /// connection is suitable. Blocks while the pool is at `maxPoolSize`; the
    /// caller bounds the wait with its own deadline.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::internal("connection pool closed"))?;

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let min_pool_size = self.inner.options.min_pool_size.unwrap_or(0);

        loop {
            let conn = self.inner.connections.lock().unwrap().pop();
            let conn = match conn {
                Some(conn) => conn,
                None => break,
            };

            if conn.generation != generation {
                self.discard(conn, "stale generation");
                continue;
            }
            if conn.is_idle(self.inner.options.max_idle_time)
                && self.inner.total.load(Ordering::SeqCst) > min_pool_size
            {
                self.discard(conn, "exceeded max idle time");
                continue;
            }

            return Ok(PooledConnection {
                conn: Some(conn),
                pool: self.inner.clone(),
                _permit: permit,
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut conn = Connection::connect(
            self.inner.address.clone(),
            id,
            generation,
            self.inner.options.connect_timeout,
            self.inner.options.socket_timeout,
        )
        .await?;
        self.inner.handshaker.handshake(&mut conn).await?;
        self.inner.total.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Invalidates every connection established before this call. In-flight
    /// connections are discarded when they are next checked in.
    pub(crate) fn clear(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(address = %self.inner.address, generation, "cleared connection pool");
    }

    #[cfg(test)]
    pub(crate) fn available_len(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    fn discard(&self, conn: Connection, reason: &str) {
        self.inner.discard(conn, reason)
    }
}

impl PoolInner {
    fn discard(&self, conn: Connection, reason: &str) {
        debug!(address = %self.address, id = conn.id, reason, "discarding connection");
        self.total.fetch_sub(1, Ordering::SeqCst);
        drop(conn);
    }
}

/// An exclusively owned connection. Returning it to the pool happens on drop;
/// poisoned connections and connections from cleared generations are closed
/// instead of pooled.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // The Option is only vacated in drop.
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if conn.poisoned {
            self.pool.discard(conn, "poisoned");
            return;
        }
        if conn.generation != self.pool.generation.load(Ordering::SeqCst) {
            self.pool.discard(conn, "stale generation");
            return;
        }
        conn.ready_and_available_time = Some(Instant::now());
        self.pool.connections.lock().unwrap().push(conn);
    }
}
