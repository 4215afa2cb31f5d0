//! # Session Table
//!
//! A session is a live conversation with one peer at one address. The table
//! is the single owner of every session; everything else (pending sends,
//! service queue handles, transport state) refers to a session by its
//! copyable [`SessionId`]. That keeps back-references impossible to dangle:
//! a stale id simply fails the lookup.
//!
//! One peer may hold several sessions at different addresses, so the table
//! is a multi-value map keyed by peer identity with at-most-one session per
//! (peer, address) pair.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::address::Address;
use crate::identity::PeerId;

/// Identifier for one live session. Never reused within a communicator.
pub type SessionId = u64;

/// Session-table errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Removal or lookup of a session that is not in the table.
    #[error("session {0} not in table")]
    NotFound(SessionId),

    /// A second session for the same (peer, address) pair.
    #[error("peer {peer} already has a session at {address}")]
    DuplicateAddress { peer: String, address: String },
}

/// Emitted to the session monitor on every lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Session created, or still alive at a timer check.
    Up { peer: PeerId, address: Address },
    /// Session destroyed.
    Down { peer: PeerId, address: Address },
}

/// A live association with one peer at one address.
#[derive(Debug, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub peer: PeerId,
    pub address: Address,
    pub created_at: Instant,
    /// Idle deadline; refreshed by any successful send or receive.
    pub timeout_deadline: Instant,
    /// When the idle timer next inspects this session. Not moved by
    /// activity; the timer re-arms itself to the remaining time.
    pub next_check: Instant,
    /// Bytes of framed payload queued for this session.
    pub bytes_in_queue: u64,
    /// Pending wrappers queued for this session.
    pub msgs_in_queue: u32,
    /// Queue id announced to the service, once QUEUE_SETUP went out.
    pub queue_id: Option<u32>,
    /// Earliest instant the next inbound chunk may be processed.
    pub next_receive: Option<Instant>,
}

impl Session {
    fn new(id: SessionId, peer: PeerId, address: Address, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            id,
            peer,
            address,
            created_at: now,
            timeout_deadline: now + idle_timeout,
            next_check: now + idle_timeout,
            bytes_in_queue: 0,
            msgs_in_queue: 0,
            queue_id: None,
            next_receive: None,
        }
    }

    /// Push the idle deadline out after activity.
    pub fn refresh(&mut self, now: Instant, idle_timeout: Duration) {
        self.timeout_deadline = now + idle_timeout;
    }

    /// Whether the idle deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.timeout_deadline <= now
    }
}

/// Owner of all sessions of one communicator.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, Session>,
    by_peer: HashMap<PeerId, Vec<SessionId>>,
    next_id: SessionId,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for (peer, address).
    ///
    /// Fails when the pair already has one; callers wanting get-or-create
    /// semantics check [`find_by_address`](Self::find_by_address) first.
    pub fn create(
        &mut self,
        peer: PeerId,
        address: Address,
        idle_timeout: Duration,
        now: Instant,
    ) -> Result<SessionId, SessionError> {
        if self.find_by_address(&peer, &address).is_some() {
            return Err(SessionError::DuplicateAddress {
                peer: peer.short(),
                address: address.to_string(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.sessions
            .insert(id, Session::new(id, peer, address, idle_timeout, now));
        self.by_peer.entry(peer).or_default().push(id);
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Remove a session. Removing an absent session is an error, not a no-op.
    pub fn remove(&mut self, id: SessionId) -> Result<Session, SessionError> {
        let session = self.sessions.remove(&id).ok_or(SessionError::NotFound(id))?;
        if let Some(ids) = self.by_peer.get_mut(&session.peer) {
            ids.retain(|&sid| sid != id);
            if ids.is_empty() {
                self.by_peer.remove(&session.peer);
            }
        }
        Ok(session)
    }

    /// The session this peer holds at exactly this address, if any.
    pub fn find_by_address(&self, peer: &PeerId, address: &Address) -> Option<SessionId> {
        self.by_peer.get(peer)?.iter().copied().find(|id| {
            self.sessions
                .get(id)
                .map(|s| Address::equals(&s.address, address))
                .unwrap_or(false)
        })
    }

    /// All sessions of one peer (multi-value lookup).
    pub fn for_peer<'a>(&'a self, peer: &PeerId) -> impl Iterator<Item = &'a Session> + 'a {
        self.by_peer
            .get(peer)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id))
    }

    /// Session owning the given service queue id.
    pub fn find_by_queue_id(&self, queue_id: u32) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.queue_id == Some(queue_id))
            .map(|s| s.id)
    }

    /// Earliest timer-check instant across all sessions.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.next_check).min()
    }

    /// Ids of all sessions whose timer check is due.
    ///
    /// Returned as a snapshot so the caller may destroy while iterating.
    pub fn due(&self, now: Instant) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.next_check <= now)
            .map(|s| s.id)
            .collect()
    }

    /// Snapshot of all ids, tolerant of removal during the walk.
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
