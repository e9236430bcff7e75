//! Bounded pool of control connections
//!
//! Hands out idle connections for reuse, creates new ones up to a cap, and
//! queues callers FIFO when the cap is reached. Released connections are
//! handed directly to the oldest waiter (never transiting the idle pool, so
//! fairness holds), and excess idle capacity left over from load spikes is
//! drained back down.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::error::{Result, SpriteError};
use crate::mux::{ControlConnection, ControlEndpoint};

/// Pool sizing knobs
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Hard cap on concurrently open control connections
    pub max_size: usize,
    /// Roster size above which idle connections are drained
    pub drain_threshold: usize,
    /// Roster size the drain shrinks down to
    pub drain_target: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            drain_threshold: 20,
            drain_target: 10,
        }
    }
}

/// A waiter receives either a connection handed off directly (still marked
/// active) or `None`, meaning capacity freed up and it should retry.
type Waiter = oneshot::Sender<Option<Arc<ControlConnection>>>;

struct PoolInner {
    roster: Vec<Arc<ControlConnection>>,
    /// Dials in flight; counted against `max_size` but not yet in the roster
    reserved: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl PoolInner {
    /// Tell the oldest live waiter that a roster slot freed up
    fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(None).is_ok() {
                return;
            }
        }
    }
}

/// Bounded, reusable set of control connections with fair waiter handling
pub struct ConnectionPool {
    endpoint: ControlEndpoint,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    /// Create an empty pool dialing the given endpoint
    pub fn new(endpoint: ControlEndpoint, config: PoolConfig) -> Self {
        Self {
            endpoint,
            config,
            inner: Mutex::new(PoolInner {
                roster: Vec::new(),
                reserved: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Check out a connection, exclusively owned until released
    ///
    /// Reuses an idle connection when one exists, otherwise connects a new
    /// one while the roster is below `max_size`. At capacity the caller is
    /// queued FIFO and suspends until a `release` hands it a connection or
    /// the pool closes. There is no acquire-side timeout: a saturated pool
    /// that never frees a slot blocks callers indefinitely.
    pub async fn acquire(&self) -> Result<Arc<ControlConnection>> {
        loop {
            // Roster mutation happens only in this synchronous section; the
            // dial itself runs with the lock released so other pool calls
            // stay responsive behind a slow endpoint.
            let rx = {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(SpriteError::PoolClosed);
                }
                inner.roster.retain(|conn| !conn.is_closed());

                if let Some(conn) = inner.roster.iter().find(|conn| conn.is_idle()).cloned() {
                    conn.set_active(true);
                    return Ok(conn);
                }

                if inner.roster.len() + inner.reserved < self.config.max_size {
                    inner.reserved += 1;
                    None
                } else {
                    let (tx, rx) = oneshot::channel();
                    inner.waiters.push_back(tx);
                    Some(rx)
                }
            };

            let Some(rx) = rx else {
                return self.dial_reserved().await;
            };
            match rx.await {
                Ok(Some(conn)) => return Ok(conn),
                // Capacity freed without a connection to hand over; retry
                Ok(None) => continue,
                Err(_) => return Err(SpriteError::PoolClosed),
            }
        }
    }

    /// Dial a new connection for a slot reserved under the lock
    async fn dial_reserved(&self) -> Result<Arc<ControlConnection>> {
        let conn = Arc::new(ControlConnection::new(self.endpoint.clone()));
        let result = conn.connect().await;

        let mut inner = self.inner.lock().await;
        inner.reserved -= 1;
        match result {
            Ok(()) => {
                if inner.closed {
                    conn.close();
                    return Err(SpriteError::PoolClosed);
                }
                conn.set_active(true);
                inner.roster.push(conn.clone());
                debug!(roster = inner.roster.len(), "opened pooled control connection");
                Ok(conn)
            }
            Err(e) => {
                // The reservation freed a slot a queued caller can take
                inner.wake_one();
                Err(e)
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// Queued waiters are served oldest-first, receiving the connection
    /// directly so it never appears idle between handoffs. With no waiters,
    /// the idle roster is drained if it outgrew the configured threshold.
    pub async fn release(&self, conn: &Arc<ControlConnection>) {
        let mut inner = self.inner.lock().await;
        conn.set_active(false);
        conn.clear_op();

        if conn.is_closed() {
            inner.roster.retain(|c| !Arc::ptr_eq(c, conn));
            // The dead connection's slot is free; the oldest waiter can
            // dial a replacement.
            inner.wake_one();
        } else {
            while let Some(waiter) = inner.waiters.pop_front() {
                conn.set_active(true);
                match waiter.send(Some(conn.clone())) {
                    Ok(()) => return,
                    // Waiter went away; try the next one
                    Err(_) => conn.set_active(false),
                }
            }
        }

        self.drain_idle(&mut inner);
    }

    /// Close idle connections until the roster shrinks to the drain target
    fn drain_idle(&self, inner: &mut PoolInner) {
        if !inner.waiters.is_empty() {
            return;
        }
        let mut roster = std::mem::take(&mut inner.roster);
        roster.retain(|conn| !conn.is_closed());
        if roster.len() <= self.config.drain_threshold {
            inner.roster = roster;
            return;
        }

        let mut remaining = roster.len();
        let mut kept = Vec::with_capacity(roster.len());
        for conn in roster {
            if remaining > self.config.drain_target && conn.is_idle() {
                conn.close();
                remaining -= 1;
            } else {
                kept.push(conn);
            }
        }
        debug!(kept = kept.len(), "drained idle control connections");
        inner.roster = kept;
    }

    /// Close every connection and reject all queued waiters
    ///
    /// Subsequent `acquire` calls fail immediately with `PoolClosed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.closed = true;
        // Dropping the senders rejects the waiters with PoolClosed
        inner.waiters.clear();
        for conn in inner.roster.drain(..) {
            conn.close();
        }
    }

    /// Current roster size
    pub async fn size(&self) -> usize {
        self.inner.lock().await.roster.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use url::Url;

    /// Server that accepts any number of connections and holds them open
    async fn accepting_endpoint() -> ControlEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    if let Ok(mut ws) = accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
        ControlEndpoint {
            url: Url::parse(&format!("ws://{addr}/control")).unwrap(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_idle_connection() {
        let pool = ConnectionPool::new(accepting_endpoint().await, PoolConfig::default());

        let first = pool.acquire().await.unwrap();
        pool.release(&first).await;
        let second = pool.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_roster_never_exceeds_max_size() {
        let config = PoolConfig {
            max_size: 3,
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(accepting_endpoint().await, config));

        let mut handles = Vec::new();
        for _ in 0..30 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                assert!(pool.size().await <= 3);
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(&conn).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.size().await <= 3);
    }

    #[tokio::test]
    async fn test_waiters_served_fifo() {
        let config = PoolConfig {
            max_size: 1,
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(accepting_endpoint().await, config));
        let held = pool.acquire().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for id in 1..=3 {
            let pool = pool.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                // Handed off directly, still marked active
                assert!(conn.is_active());
                order_tx.send(id).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(&conn).await;
            });
            // Make enqueue order deterministic
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        pool.release(&held).await;

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_release_drains_oversized_idle_roster() {
        let config = PoolConfig {
            max_size: 100,
            drain_threshold: 20,
            drain_target: 10,
        };
        let pool = ConnectionPool::new(accepting_endpoint().await, config);

        // Build a roster of 25 connections, all checked out
        let mut conns = Vec::new();
        for _ in 0..25 {
            conns.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.size().await, 25);

        // Park 24 of them idle without triggering drain evaluation
        for conn in &conns[..24] {
            conn.set_active(false);
        }

        // A single release now sees 25 idle connections and drains to target
        pool.release(&conns[24]).await;
        assert_eq!(pool.size().await, 10);
    }

    /// Server that accepts TCP connections but never answers the WebSocket
    /// handshake, so dials hang indefinitely
    async fn hanging_endpoint() -> ControlEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        ControlEndpoint {
            url: Url::parse(&format!("ws://{addr}/control")).unwrap(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_waiter_served_after_closed_connection_release() {
        let config = PoolConfig {
            max_size: 1,
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(accepting_endpoint().await, config));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(25)).await;

        // The held connection's transport dies before it is returned; its
        // release must still free the slot for the queued waiter.
        held.close();
        pool.release(&held).await;

        let conn = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter starved after closed connection was released")
            .unwrap()
            .unwrap();
        assert!(!conn.is_closed());
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_pool_stays_responsive_during_hanging_dial() {
        let pool = Arc::new(ConnectionPool::new(hanging_endpoint().await, PoolConfig::default()));

        let dialing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stuck dial must not hold the pool lock
        let size = tokio::time::timeout(Duration::from_millis(250), pool.size())
            .await
            .expect("pool blocked behind a hanging dial");
        assert_eq!(size, 0);

        tokio::time::timeout(Duration::from_millis(250), pool.close())
            .await
            .expect("close blocked behind a hanging dial");
        dialing.abort();
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let config = PoolConfig {
            max_size: 1,
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(accepting_endpoint().await, config));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(25)).await;

        pool.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(SpriteError::PoolClosed)));
        assert!(matches!(pool.acquire().await, Err(SpriteError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_roster_on_release() {
        let pool = ConnectionPool::new(accepting_endpoint().await, PoolConfig::default());
        let conn = pool.acquire().await.unwrap();
        conn.close();
        pool.release(&conn).await;
        assert_eq!(pool.size().await, 0);
    }
}
