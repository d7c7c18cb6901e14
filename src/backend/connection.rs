//! Handle-carrying channel between two stages.
//!
//! A `Connection` is an unbounded crossbeam queue of [`ConnectionPacket`]s.
//! It never drops a packet: producers are expected to check
//! [`Connection::is_full`] and hold their result until the consumer catches
//! up. Cloning a connection shares the same queue, which is how several
//! producers feed one consumer.
//!
//! Ordering: packets from one producer arrive in the order written. Packets
//! from different producers interleave in whatever order their writes land.

use crate::backend::packet::ConnectionPacket;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Bounded-by-convention packet channel with visible backpressure.
#[derive(Clone)]
pub struct Connection {
    name: Arc<str>,
    tx: Sender<ConnectionPacket>,
    rx: Receiver<ConnectionPacket>,
}

impl Connection {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            name: Arc::from(name),
            tx,
            rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a packet. Never blocks and never drops.
    pub fn write(&self, packet: ConnectionPacket) {
        // The connection owns a receiver, so the channel cannot be disconnected.
        if let Err(e) = self.tx.send(packet) {
            tracing::error!("Connection '{}' rejected packet: {}", self.name, e);
        }
    }

    /// Wait up to `timeout` for a packet.
    pub fn read(&self, timeout: Duration) -> Option<ConnectionPacket> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take a packet if one is queued.
    pub fn try_read(&self) -> Option<ConnectionPacket> {
        self.rx.try_recv().ok()
    }

    /// True when at least `n` packets are queued.
    pub fn is_full(&self, n: usize) -> bool {
        self.rx.len() >= n
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Drop every queued packet, releasing their heap references.
    pub fn clear(&self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("queued", &self.len())
            .finish()
    }
}
