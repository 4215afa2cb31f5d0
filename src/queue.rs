//! # Send Queue
//!
//! The per-communicator FIFO of pending sends. Each entry wraps one framed
//! payload together with its session id, absolute deadline, opaque priority,
//! and a completion that fires exactly once with either the sent payload
//! size or a failure.
//!
//! Completions are channels, not closures: local callers get a `oneshot`,
//! and sends consumed from the service report back over a shared
//! [`SentNotice`] stream so the driver can emit the matching SEND_MSG_ACK.
//!
//! Counter invariants maintained here (and checked by tests):
//! `bytes_in_queue == Σ msgsize` and `msgs_in_queue == |queue|`, both for
//! the whole queue and per session.

use std::collections::VecDeque;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::identity::PeerId;
use crate::session::SessionId;

/// Why a pending send failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The desired timeout passed before the wrapper reached the wire.
    #[error("send timed out before transmission")]
    Timeout,

    /// The session was destroyed while the wrapper was queued.
    #[error("session gone")]
    SessionGone,

    /// The service queue backing this send disappeared.
    #[error("queue gone")]
    QueueGone,

    /// A permanent transport error.
    #[error("transport error: {0}")]
    Io(String),

    /// Communicator shut down with the wrapper still queued.
    #[error("communicator shut down")]
    Shutdown,
}

/// Outcome of one send: payload bytes accepted by the wire, or the failure.
pub type SendResult = Result<usize, SendError>;

/// Post-send notification for a service-originated send.
#[derive(Debug)]
pub struct SentNotice {
    pub mid: u64,
    pub receiver: PeerId,
    pub result: SendResult,
}

/// How a wrapper reports its fate.
#[derive(Debug)]
pub enum Completion {
    /// Local caller awaiting a oneshot.
    Channel(oneshot::Sender<SendResult>),
    /// Service SEND_MSG awaiting a SEND_MSG_ACK.
    ServiceAck {
        mid: u64,
        receiver: PeerId,
        notify: mpsc::UnboundedSender<SentNotice>,
    },
    /// Fire-and-forget.
    None,
}

impl Completion {
    fn fire(self, result: SendResult) {
        match self {
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::ServiceAck { mid, receiver, notify } => {
                let _ = notify.send(SentNotice { mid, receiver, result });
            }
            Completion::None => {}
        }
    }
}

/// One pending send.
#[derive(Debug)]
pub struct PendingMessage {
    session: SessionId,
    frame: Vec<u8>,
    payload_len: usize,
    deadline: Instant,
    /// Opaque; preserved but never interpreted.
    priority: u32,
    /// Bytes already handed to a streaming transport (HTTP PUT).
    offset: usize,
    completion: Option<Completion>,
}

impl PendingMessage {
    pub fn new(
        session: SessionId,
        frame: Vec<u8>,
        payload_len: usize,
        timeout: Duration,
        priority: u32,
        completion: Completion,
    ) -> Self {
        Self {
            session,
            payload_len,
            deadline: Instant::now() + timeout,
            priority,
            offset: 0,
            completion: Some(completion),
            frame,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Total framed size: what the byte counters account.
    pub fn msgsize(&self) -> usize {
        self.frame.len()
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline < now
    }

    /// The full frame, for datagram transports.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    /// Bytes not yet handed over, for streaming transports.
    pub fn remaining(&self) -> &[u8] {
        &self.frame[self.offset..]
    }

    pub fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.frame.len());
    }

    pub fn is_drained(&self) -> bool {
        self.offset >= self.frame.len()
    }

    fn finish(mut self, result: SendResult) {
        if let Some(completion) = self.completion.take() {
            completion.fire(result);
        }
    }
}

/// FIFO of pending sends with byte/message accounting.
#[derive(Debug, Default)]
pub struct SendQueue {
    queue: VecDeque<PendingMessage>,
    bytes_in_queue: u64,
    msgs_in_queue: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_tail(&mut self, wrapper: PendingMessage) {
        self.bytes_in_queue += wrapper.msgsize() as u64;
        self.msgs_in_queue += 1;
        self.queue.push_back(wrapper);
    }

    pub fn head(&self) -> Option<&PendingMessage> {
        self.queue.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut PendingMessage> {
        self.queue.front_mut()
    }

    /// Remove the head and complete it with `result`.
    ///
    /// Returns the (session, msgsize) pair so the caller can settle the
    /// session counters in the same step.
    pub fn finish_head(&mut self, result: SendResult) -> Option<(SessionId, usize)> {
        let wrapper = self.queue.pop_front()?;
        self.bytes_in_queue -= wrapper.msgsize() as u64;
        self.msgs_in_queue -= 1;
        let key = (wrapper.session(), wrapper.msgsize());
        wrapper.finish(result);
        Some(key)
    }

    /// Fail every wrapper whose deadline has passed (timed-out sends fire
    /// with failure and payload size zero). Returns the removed
    /// (session, msgsize) pairs.
    pub fn fail_expired(&mut self, now: Instant) -> Vec<(SessionId, usize)> {
        self.take_and_fail(|w| w.is_expired(now), SendError::Timeout)
    }

    /// Fail every wrapper belonging to `session` (session teardown).
    pub fn fail_session(&mut self, session: SessionId, error: SendError) -> Vec<(SessionId, usize)> {
        self.take_and_fail(|w| w.session() == session, error)
    }

    /// Fail everything (communicator shutdown).
    pub fn fail_all(&mut self, error: SendError) -> Vec<(SessionId, usize)> {
        self.take_and_fail(|_| true, error)
    }

    fn take_and_fail(
        &mut self,
        mut pred: impl FnMut(&PendingMessage) -> bool,
        error: SendError,
    ) -> Vec<(SessionId, usize)> {
        let mut removed = Vec::new();
        let mut keep = VecDeque::with_capacity(self.queue.len());
        while let Some(wrapper) = self.queue.pop_front() {
            if pred(&wrapper) {
                self.bytes_in_queue -= wrapper.msgsize() as u64;
                self.msgs_in_queue -= 1;
                removed.push((wrapper.session(), wrapper.msgsize()));
                wrapper.finish(Err(error.clone()));
            } else {
                keep.push_back(wrapper);
            }
        }
        self.queue = keep;
        removed
    }

    pub fn bytes_in_queue(&self) -> u64 {
        self.bytes_in_queue
    }

    pub fn msgs_in_queue(&self) -> usize {
        self.msgs_in_queue
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Earliest deadline in the queue, for scheduling the expiry sweep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.iter().map(|w| w.deadline).min()
    }

    /// Per-session byte/message totals, for invariant checks.
    pub fn session_totals(&self, session: SessionId) -> (u64, u32) {
        let mut bytes = 0u64;
        let mut msgs = 0u32;
        for w in self.queue.iter().filter(|w| w.session() == session) {
            bytes += w.msgsize() as u64;
            msgs += 1;
        }
        (bytes, msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapper(session: SessionId, len: usize, timeout: Duration) -> (PendingMessage, oneshot::Receiver<SendResult>) {
        let (tx, rx) = oneshot::channel();
        let w = PendingMessage::new(
            session,
            vec![0u8; len],
            len.saturating_sub(4),
            timeout,
            0,
            Completion::Channel(tx),
        );
        (w, rx)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn counters_track_contents() {
        let mut q = SendQueue::new();
        let (w1, _rx1) = wrapper(1, 100, MINUTE);
        let (w2, _rx2) = wrapper(2, 50, MINUTE);
        q.enqueue_tail(w1);
        q.enqueue_tail(w2);
        assert_eq!(q.bytes_in_queue(), 150);
        assert_eq!(q.msgs_in_queue(), 2);
        assert_eq!(q.session_totals(1), (100, 1));
        assert_eq!(q.session_totals(2), (50, 1));

        q.finish_head(Ok(96));
        assert_eq!(q.bytes_in_queue(), 50);
        assert_eq!(q.msgs_in_queue(), 1);
        assert_eq!(q.session_totals(1), (0, 0));
    }

    #[tokio::test]
    async fn completion_fires_once_with_result() {
        let mut q = SendQueue::new();
        let (w, rx) = wrapper(1, 10, MINUTE);
        q.enqueue_tail(w);
        q.finish_head(Ok(6));
        assert_eq!(rx.await.unwrap(), Ok(6));
    }

    #[tokio::test]
    async fn expired_wrappers_fail_with_timeout() {
        let mut q = SendQueue::new();
        let (w, rx) = wrapper(1, 10, Duration::from_millis(0));
        q.enqueue_tail(w);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = q.fail_expired(Instant::now());
        assert_eq!(removed.len(), 1);
        assert!(q.is_empty());
        assert_eq!(rx.await.unwrap(), Err(SendError::Timeout));
    }

    #[tokio::test]
    async fn fail_session_preserves_others_and_order() {
        let mut q = SendQueue::new();
        let (w1, rx1) = wrapper(1, 10, MINUTE);
        let (w2, _rx2) = wrapper(2, 20, MINUTE);
        let (w3, _rx3) = wrapper(2, 30, MINUTE);
        q.enqueue_tail(w1);
        q.enqueue_tail(w2);
        q.enqueue_tail(w3);

        let removed = q.fail_session(1, SendError::SessionGone);
        assert_eq!(removed, vec![(1, 10)]);
        assert_eq!(rx1.await.unwrap(), Err(SendError::SessionGone));

        // FIFO order of the survivors is untouched.
        assert_eq!(q.head().unwrap().msgsize(), 20);
        assert_eq!(q.bytes_in_queue(), 50);
    }

    #[tokio::test]
    async fn service_ack_completion_reports_on_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = PeerId::from_bytes([7; 32]);
        let w = PendingMessage::new(
            1,
            vec![0u8; 40],
            36,
            MINUTE,
            0,
            Completion::ServiceAck { mid: 99, receiver, notify: tx },
        );
        let mut q = SendQueue::new();
        q.enqueue_tail(w);
        q.finish_head(Ok(36));

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.mid, 99);
        assert_eq!(notice.receiver, receiver);
        assert_eq!(notice.result, Ok(36));
    }

    #[test]
    fn streaming_offset_bookkeeping() {
        let (mut w, _rx) = wrapper(1, 10, MINUTE);
        assert_eq!(w.remaining().len(), 10);
        w.advance(4);
        assert_eq!(w.remaining().len(), 6);
        assert!(!w.is_drained());
        w.advance(100);
        assert!(w.is_drained());
    }
}
