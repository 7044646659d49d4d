use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{agent::UpstreamConn, descriptor::PoolKey};

/// Idle upstream HTTP/1 connections, keyed by endpoint and circuit identity.
///
/// A connection is checked in only after its previous response body was read
/// to the end, so every idle entry is ready for the next request.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    idle: Mutex<HashMap<PoolKey, Vec<Idle>>>,
    idle_timeout: Duration,
    max_idle_per_key: usize,
}

#[derive(Debug)]
struct Idle {
    conn: UpstreamConn,
    since: Instant,
}

impl Idle {
    fn is_usable(&self, idle_timeout: Duration) -> bool {
        !self.conn.sender.is_closed() && self.since.elapsed() < idle_timeout
    }
}

impl ConnectionPool {
    pub(crate) fn new(idle_timeout: Duration, max_idle_per_key: usize) -> Self {
        Self {
            idle: Default::default(),
            idle_timeout,
            max_idle_per_key,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.max_idle_per_key > 0
    }

    /// Takes the most recently used live connection for `key`, dropping stale ones.
    pub(crate) fn checkout(&self, key: &PoolKey) -> Option<UpstreamConn> {
        let mut idle = self.idle.lock().ok()?;
        let entries = idle.get_mut(key)?;
        let mut found = None;
        while let Some(entry) = entries.pop() {
            if entry.is_usable(self.idle_timeout) {
                found = Some(entry.conn);
                break;
            }
            trace!(?key, "dropping stale pooled connection");
        }
        if entries.is_empty() {
            idle.remove(key);
        }
        found
    }

    pub(crate) fn checkin(&self, key: PoolKey, conn: UpstreamConn) {
        if !self.is_enabled() || conn.sender.is_closed() {
            return;
        }
        let Ok(mut idle) = self.idle.lock() else {
            return;
        };
        let entries = idle.entry(key).or_default();
        entries.retain(|entry| entry.is_usable(self.idle_timeout));
        if entries.len() >= self.max_idle_per_key {
            entries.remove(0);
        }
        entries.push(Idle {
            conn,
            since: Instant::now(),
        });
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.get(key).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }
}
