//! Idle-connection pool.

use crate::client::conn::{Connection, ConnectionId};
use log::trace;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Insertion-ordered map from connection identity to idle connection.
///
/// The deque keeps check-in order; overflow evicts the oldest idle entry
/// (FIFO). A linear scan is fine at the pool's bounded size.
pub(crate) struct ConnectionPool {
    conns: Mutex<VecDeque<(ConnectionId, Connection)>>,
    max_idle: usize,
    keep_alive: bool,
}

impl ConnectionPool {
    pub(crate) fn new(max_idle: usize, keep_alive: bool) -> Self {
        Self {
            conns: Mutex::new(VecDeque::new()),
            max_idle,
            keep_alive,
        }
    }

    /// Checks out the idle connection for `id`, if a live one exists.
    /// A closing entry is discarded so the caller dials fresh.
    pub(crate) async fn get(&self, id: &ConnectionId) -> Option<Connection> {
        let mut conns = self.conns.lock().await;

        let index = conns.iter().position(|(conn_id, _)| conn_id == id)?;
        let (_, mut conn) = conns.remove(index)?;
        drop(conns);

        if conn.closing() {
            trace!("discarding closed pooled connection to {}", id.authority);
            conn.close();
            conn.wait_closed().await;

            return None;
        }

        trace!("reusing pooled connection to {}", id.authority);

        Some(conn)
    }

    /// Checks a connection back in. Closing connections, duplicates of
    /// an already-pooled identity, and everything while keep-alive is
    /// disabled are closed instead of stored.
    pub(crate) async fn put(&self, mut conn: Connection) {
        if conn.closing() || !self.keep_alive {
            conn.close();
            conn.wait_closed().await;

            return;
        }

        let id = conn.id().clone();
        let mut conns = self.conns.lock().await;

        if conns.iter().any(|(conn_id, _)| *conn_id == id) {
            // The existing idle entry wins the race.
            drop(conns);
            conn.close();
            conn.wait_closed().await;

            return;
        }

        trace!("pooling connection to {}", id.authority);
        conns.push_back((id, conn));

        let mut evicted = Vec::new();

        while conns.len() > self.max_idle {
            if let Some((id, conn)) = conns.pop_front() {
                trace!("evicting oldest pooled connection to {}", id.authority);
                evicted.push(conn);
            }
        }

        drop(conns);

        for mut conn in evicted {
            conn.close();
            conn.wait_closed().await;
        }
    }

    /// Closes every pooled connection and awaits each teardown.
    pub(crate) async fn close_all(&self) {
        let mut conns = std::mem::take(&mut *self.conns.lock().await);

        for (_, conn) in conns.iter_mut() {
            conn.close();
        }

        futures::future::join_all(conns.iter().map(|(_, conn)| conn.wait_closed())).await;
    }

    #[cfg(test)]
    pub(crate) async fn idle_count(&self) -> usize {
        self.conns.lock().await.len()
    }
}
