//! # Flow-Control Correlation
//!
//! Two small tables correlate messages with their acknowledgements on the
//! service connection:
//!
//! - inbound deliveries awaiting `INCOMING_MSG_ACK`, keyed by
//!   `(sender, fc_id)` with ids allocated monotonically per communicator
//!   instance;
//! - outbound `SEND_MSG`s awaiting their post-send notification, a plain
//!   `{receiver, mid}` list.
//!
//! A duplicate or unknown fc id on ack is a protocol violation: the caller
//! must drop the service connection. On disconnect both tables purge,
//! failing every waiter.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::identity::PeerId;

/// One flow-control acknowledgement, delivered to whoever asked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowAck {
    pub sender: PeerId,
    pub fc_id: u64,
    /// `true` when the service acked; `false` when purged on disconnect.
    pub ok: bool,
}

/// Where acks are reported. A clone is stored per outstanding entry.
pub type FlowNotify = mpsc::UnboundedSender<FlowAck>;

/// Verdict of a flow-controlled delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryVerdict {
    /// Envelope enqueued towards the service.
    Accepted,
    /// Queue above threshold and no callback supplied: the communicator
    /// should apply reverse pressure on its wire reader.
    SoftDrop,
    /// No service connection; the message is gone.
    Dropped,
}

/// Inbound-delivered messages awaiting their ack.
#[derive(Debug, Default)]
pub struct FlowControl {
    next_id: u64,
    pending: HashMap<(PeerId, u64), FlowNotify>,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for one delivery and remember its callback.
    pub fn allocate(&mut self, sender: PeerId, notify: FlowNotify) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert((sender, id), notify);
        id
    }

    /// Handle an `INCOMING_MSG_ACK`.
    ///
    /// `Err(())` marks a duplicate or unknown id: a protocol violation the
    /// caller turns into a reconnect.
    pub fn ack(&mut self, sender: &PeerId, fc_id: u64) -> Result<(), ()> {
        match self.pending.remove(&(*sender, fc_id)) {
            Some(notify) => {
                let _ = notify.send(FlowAck { sender: *sender, fc_id, ok: true });
                Ok(())
            }
            None => Err(()),
        }
    }

    /// Fail every outstanding entry (service disconnect).
    pub fn purge(&mut self) {
        for ((sender, fc_id), notify) in self.pending.drain() {
            let _ = notify.send(FlowAck { sender, fc_id, ok: false });
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Outbound `SEND_MSG`s awaiting their post-send notification.
#[derive(Debug, Default)]
pub struct AckPending {
    entries: Vec<(PeerId, u64)>,
}

impl AckPending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, receiver: PeerId, mid: u64) {
        self.entries.push((receiver, mid));
    }

    /// Remove one entry; `false` when it was not tracked (already purged).
    pub fn remove(&mut self, receiver: &PeerId, mid: u64) -> bool {
        match self.entries.iter().position(|(r, m)| r == receiver && *m == mid) {
            Some(idx) => {
                self.entries.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Drop everything (service disconnect); acks for these would be
    /// meaningless on a fresh connection.
    pub fn purge(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_acks_match() {
        let mut fc = FlowControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let a = fc.allocate(peer(1), tx.clone());
        let b = fc.allocate(peer(1), tx.clone());
        assert!(b > a);
        assert_eq!(fc.outstanding(), 2);

        fc.ack(&peer(1), a).unwrap();
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.fc_id, a);
        assert!(ack.ok);
        assert_eq!(fc.outstanding(), 1);
    }

    #[test]
    fn unknown_or_duplicate_ack_is_violation() {
        let mut fc = FlowControl::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = fc.allocate(peer(1), tx);

        // Unknown id.
        assert!(fc.ack(&peer(1), id + 1).is_err());
        // Wrong sender.
        assert!(fc.ack(&peer(2), id).is_err());
        // Duplicate.
        assert!(fc.ack(&peer(1), id).is_ok());
        assert!(fc.ack(&peer(1), id).is_err());
    }

    #[tokio::test]
    async fn purge_fails_all_waiters() {
        let mut fc = FlowControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fc.allocate(peer(1), tx.clone());
        fc.allocate(peer(2), tx.clone());
        fc.purge();
        assert_eq!(fc.outstanding(), 0);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!first.ok);
        assert!(!second.ok);
    }

    #[test]
    fn ack_pending_remove_and_purge() {
        let mut acks = AckPending::new();
        acks.push(peer(1), 10);
        acks.push(peer(1), 11);
        assert!(acks.remove(&peer(1), 10));
        assert!(!acks.remove(&peer(1), 10));
        assert_eq!(acks.len(), 1);
        acks.purge();
        assert!(acks.is_empty());
    }
}
