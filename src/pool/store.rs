//! Unclaimed connection storage.
//!
//! Plain container; locking and wakeups live in the manager.

use std::time::Duration;

use tokio::time::Instant;

use crate::net::{PooledConnection, Protocol};

#[derive(Debug, Default)]
pub struct ConnectionStore {
    conns: Vec<PooledConnection>,
}

impl ConnectionStore {
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn insert(&mut self, conn: PooledConnection) {
        self.conns.push(conn);
    }

    /// Remove connections older than `max_age`.
    pub fn take_expired(&mut self, now: Instant, max_age: Duration) -> Vec<PooledConnection> {
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.conns)
            .into_iter()
            .partition(|c| c.info().age(now) > max_age);
        self.conns = kept;
        expired
    }

    /// Remove the connection with the shortest handshake. Insertion order
    /// breaks ties.
    pub fn take_fastest(&mut self, protocol: Option<Protocol>) -> Option<PooledConnection> {
        let index = self
            .conns
            .iter()
            .enumerate()
            .filter(|(_, c)| protocol.map_or(true, |p| c.protocol() == p))
            .min_by_key(|(i, c)| (c.handshake_time(), *i))
            .map(|(i, _)| i)?;
        Some(self.conns.remove(index))
    }

    pub fn take_slowest(&mut self) -> Option<PooledConnection> {
        let index = self
            .conns
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.handshake_time())
            .map(|(i, _)| i)?;
        Some(self.conns.remove(index))
    }

    pub fn drain(&mut self) -> Vec<PooledConnection> {
        std::mem::take(&mut self.conns)
    }

    pub fn count(&self, protocol: Protocol) -> usize {
        self.conns.iter().filter(|c| c.protocol() == protocol).count()
    }
}
