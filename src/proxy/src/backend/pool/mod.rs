//! Shared pool of idle server-side sessions.
//!
//! Two keyed multi-maps guard the idle sessions: the `pool` anyone may
//! take from, and the `stash`, which remembers which client parked a
//! session so that client gets it back as long as the sharing delay has
//! not elapsed. Critical sections never span an await; graceful closes
//! happen on already-extracted connections.

use crate::backend::conn::BackendConn;
use crate::backend::{ClientIdentifier, Endpoint};

use common::metrics;
use common::metrics::metric_def::{POOL_IDLE_CONN, POOL_STASHED_CONN};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_server_connections: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_server_connections: 64,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct PooledEntry {
    conn: BackendConn,
    expires_at: Instant,
}

struct StashedEntry {
    conn: BackendConn,
    from: ClientIdentifier,
    /// earliest instant another client may steal this entry
    after: Instant,
    expires_at: Instant,
}

#[derive(Default)]
struct Maps {
    pool: HashMap<Endpoint, Vec<PooledEntry>>,
    stash: HashMap<Endpoint, Vec<StashedEntry>>,
}

impl Maps {
    fn pooled_count(&self) -> usize {
        self.pool.values().map(Vec::len).sum()
    }

    fn stashed_count(&self) -> usize {
        self.stash.values().map(Vec::len).sum()
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    maps: Mutex<Maps>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            maps: Mutex::new(Maps::default()),
        });
        Self::spawn_reaper(&pool);
        pool
    }

    /// Background eviction of entries whose idle timeout has expired.
    fn spawn_reaper(pool: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(pool);
        let tick = pool.config.idle_timeout.min(Duration::from_secs(1)).max(
            Duration::from_millis(10),
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tick).await;
                let Some(pool) = weak.upgrade() else {
                    return;
                };
                pool.evict_expired().await;
            }
        });
    }

    async fn evict_expired(&self) {
        let now = Instant::now();
        let expired: Vec<BackendConn> = {
            let mut maps = self.maps.lock();
            let mut out = Vec::new();
            for entries in maps.pool.values_mut() {
                let mut keep = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if entry.expires_at <= now {
                        out.push(entry.conn);
                    } else {
                        keep.push(entry);
                    }
                }
                *entries = keep;
            }
            for entries in maps.stash.values_mut() {
                let mut keep = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if entry.expires_at <= now {
                        out.push(entry.conn);
                    } else {
                        keep.push(entry);
                    }
                }
                *entries = keep;
            }
            maps.pool.retain(|_, v| !v.is_empty());
            maps.stash.retain(|_, v| !v.is_empty());
            out
        };

        for conn in expired {
            debug!("evicting idle backend connection to {}", conn.endpoint());
            conn.quit_and_close().await;
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        let (pooled, stashed) = {
            let maps = self.maps.lock();
            (maps.pooled_count(), maps.stashed_count())
        };
        metrics::gauge(POOL_IDLE_CONN, pooled as f64, None);
        metrics::gauge(POOL_STASHED_CONN, stashed as f64, None);
    }

    /// Park `conn` for anyone. A full pool closes the connection
    /// gracefully instead.
    pub async fn add(&self, conn: BackendConn) {
        if let Some(overflow) = self.add_if_not_full(conn) {
            overflow.quit_and_close().await;
        }
    }

    /// Like [`ConnectionPool::add`], but hands the connection back on
    /// overflow so the caller may keep using it.
    pub fn add_if_not_full(&self, conn: BackendConn) -> Option<BackendConn> {
        let expires_at = Instant::now() + self.config.idle_timeout;
        let overflow = {
            let mut maps = self.maps.lock();
            if maps.pooled_count() >= self.config.max_idle_server_connections {
                Some(conn)
            } else {
                maps.pool
                    .entry(conn.endpoint().to_string())
                    .or_default()
                    .push(PooledEntry { conn, expires_at });
                None
            }
        };
        if overflow.is_none() {
            self.update_gauges();
        }
        overflow
    }

    /// Park `conn` for its own client; others must wait out `delay`.
    pub fn stash(&self, conn: BackendConn, from: ClientIdentifier, delay: Duration) {
        let now = Instant::now();
        {
            let mut maps = self.maps.lock();
            maps.stash
                .entry(conn.endpoint().to_string())
                .or_default()
                .push(StashedEntry {
                    conn,
                    from,
                    after: now + delay,
                    expires_at: now + self.config.idle_timeout,
                });
        }
        self.update_gauges();
    }

    /// The same client gets its stashed session back, sharing delay or
    /// not.
    pub fn unstash_mine(
        &self,
        endpoint: &str,
        from: &ClientIdentifier,
    ) -> Option<BackendConn> {
        let conn = {
            let mut maps = self.maps.lock();
            let entries = maps.stash.get_mut(endpoint)?;
            let idx = entries.iter().position(|entry| &entry.from == from)?;
            Some(entries.remove(idx).conn)
        };
        self.update_gauges();
        conn
    }

    /// Any stash entry whose sharing delay has elapsed and that satisfies
    /// `pred`.
    pub fn unstash_if<F>(
        &self,
        endpoint: &str,
        pred: F,
        ignore_sharing_delay: bool,
    ) -> Option<BackendConn>
    where
        F: Fn(&BackendConn) -> bool,
    {
        let now = Instant::now();
        let conn = {
            let mut maps = self.maps.lock();
            let entries = maps.stash.get_mut(endpoint)?;
            let idx = entries.iter().position(|entry| {
                (ignore_sharing_delay || now >= entry.after) && pred(&entry.conn)
            })?;
            Some(entries.remove(idx).conn)
        };
        self.update_gauges();
        conn
    }

    /// Take one pooled session for `endpoint`, skipping entries whose
    /// server went away while they idled.
    pub fn pop(&self, endpoint: &str) -> Option<BackendConn> {
        loop {
            let candidate = {
                let mut maps = self.maps.lock();
                let entries = maps.pool.get_mut(endpoint)?;
                if entries.is_empty() {
                    return None;
                }
                Some(entries.remove(0).conn)
            };
            self.update_gauges();
            let mut conn = candidate?;
            if conn.is_idle_and_live() {
                return Some(conn);
            }
            debug!("dropping dead pooled connection to {endpoint}");
            drop(conn);
        }
    }

    /// A disconnecting client's stash entries move to the shared pool (or
    /// close when it is full).
    pub async fn discard_all_stashed(&self, from: &ClientIdentifier) {
        let mine: Vec<BackendConn> = {
            let mut maps = self.maps.lock();
            let mut out = Vec::new();
            for entries in maps.stash.values_mut() {
                let mut keep = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if &entry.from == from {
                        out.push(entry.conn);
                    } else {
                        keep.push(entry);
                    }
                }
                *entries = keep;
            }
            maps.stash.retain(|_, v| !v.is_empty());
            out
        };

        for conn in mine {
            self.add(conn).await;
        }
        self.update_gauges();
    }

    pub fn current_pooled_connections(&self) -> usize {
        self.maps.lock().pooled_count()
    }

    pub fn current_stashed_connections(&self) -> usize {
        self.maps.lock().stashed_count()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::conn::BackendStream;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_conn(keep: &mut Vec<TcpStream>) -> BackendConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (stream, accepted) = tokio::join!(BackendStream::connect(&addr), async {
            listener.accept().await.unwrap().0
        });
        keep.push(accepted);
        BackendConn::new("db-1:3306".to_string(), stream.unwrap())
    }

    fn quick_pool(max: usize, idle: Duration) -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig {
            max_idle_server_connections: max,
            idle_timeout: idle,
        })
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let mut keep = Vec::new();
        let pool = quick_pool(1, Duration::from_secs(60));

        pool.add(test_conn(&mut keep).await).await;
        pool.add(test_conn(&mut keep).await).await;

        assert_eq!(pool.current_pooled_connections(), 1);
    }

    #[tokio::test]
    async fn add_if_not_full_returns_overflow() {
        let mut keep = Vec::new();
        let pool = quick_pool(1, Duration::from_secs(60));

        assert!(pool.add_if_not_full(test_conn(&mut keep).await).is_none());
        let overflow = pool.add_if_not_full(test_conn(&mut keep).await);
        assert!(overflow.is_some());
        assert_eq!(pool.current_pooled_connections(), 1);
    }

    #[tokio::test]
    async fn stash_affinity_window() {
        let mut keep = Vec::new();
        let pool = quick_pool(4, Duration::from_secs(60));
        let me = ClientIdentifier::new();
        let someone_else = ClientIdentifier::new();

        let conn = test_conn(&mut keep).await;
        pool.stash(conn, me.clone(), Duration::from_secs(3600));
        assert_eq!(pool.current_stashed_connections(), 1);

        // within the delay another client sees nothing ...
        assert!(pool
            .unstash_if("db-1:3306", |_| true, false)
            .is_none());
        assert!(pool.unstash_mine("db-1:3306", &someone_else).is_none());

        // ... but the owner gets it back at once
        let mine = pool.unstash_mine("db-1:3306", &me);
        assert!(mine.is_some());
        assert_eq!(pool.current_stashed_connections(), 0);
    }

    #[tokio::test]
    async fn unstash_if_ignores_delay_when_told() {
        let mut keep = Vec::new();
        let pool = quick_pool(4, Duration::from_secs(60));
        let me = ClientIdentifier::new();

        pool.stash(
            test_conn(&mut keep).await,
            me,
            Duration::from_secs(3600),
        );
        assert!(pool.unstash_if("db-1:3306", |_| true, true).is_some());
    }

    #[tokio::test]
    async fn discard_moves_stash_to_pool() {
        let mut keep = Vec::new();
        let pool = quick_pool(4, Duration::from_secs(60));
        let me = ClientIdentifier::new();

        pool.stash(
            test_conn(&mut keep).await,
            me.clone(),
            Duration::from_secs(3600),
        );
        pool.discard_all_stashed(&me).await;

        assert_eq!(pool.current_stashed_connections(), 0);
        assert_eq!(pool.current_pooled_connections(), 1);
    }

    #[tokio::test]
    async fn discard_closes_when_pool_full() {
        let mut keep = Vec::new();
        let pool = quick_pool(1, Duration::from_secs(60));
        let me = ClientIdentifier::new();

        pool.add(test_conn(&mut keep).await).await;
        pool.stash(
            test_conn(&mut keep).await,
            me.clone(),
            Duration::from_secs(3600),
        );
        pool.discard_all_stashed(&me).await;

        assert_eq!(pool.current_stashed_connections(), 0);
        assert_eq!(pool.current_pooled_connections(), 1);
    }

    #[tokio::test]
    async fn idle_timeout_evicts() {
        let mut keep = Vec::new();
        let pool = quick_pool(4, Duration::from_millis(30));

        pool.add(test_conn(&mut keep).await).await;
        assert_eq!(pool.current_pooled_connections(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.current_pooled_connections(), 0);
    }

    #[tokio::test]
    async fn pop_skips_closed_connections() {
        let mut keep = Vec::new();
        let pool = quick_pool(4, Duration::from_secs(60));

        pool.add(test_conn(&mut keep).await).await;
        // server side goes away while the entry idles
        keep.clear();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pool.pop("db-1:3306").is_none());
        assert_eq!(pool.current_pooled_connections(), 0);
    }
}
