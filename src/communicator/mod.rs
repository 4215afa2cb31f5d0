//! # Communicators
//!
//! A communicator is a protocol-specific plug-in that carries framed,
//! peer-identified datagrams between the local transport service and the
//! matching communicator of another peer. All communicators implement the
//! same [`Communicator`] trait and are built through the
//! [`CommunicatorFactory`].
//!
//! ## Driver model
//!
//! Each communicator runs one driver task that exclusively owns its session
//! table, send queue, flow tables, and service connection, multiplexing
//! socket readiness, timers, and channel events in a single `select!` loop.
//! Auxiliary tasks (HTTP transfers) never touch shared state; they shovel
//! bytes over channels. Callers talk to the driver through a cloneable
//! [`CommunicatorHandle`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::address::Address;
use crate::config::Config;
use crate::flow::{DeliveryVerdict, FlowNotify};
use crate::identity::PeerId;
use crate::queue::{PendingMessage, SendError, SendQueue, SendResult};
use crate::service::ServiceClient;
use crate::session::{MonitorEvent, SessionError, SessionId, SessionTable};

pub mod http;
pub mod unix;

pub use http::HttpCommunicator;
pub use unix::UnixCommunicator;

/// The transport protocols this suite implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Unix,
    Http,
    Https,
}

impl Protocol {
    /// Address prefix / communicator name on the service protocol.
    pub fn prefix(&self) -> &'static str {
        match self {
            Protocol::Unix => "unix",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Requests a caller can make of a running communicator.
#[derive(Debug)]
pub enum Command {
    /// Queue one boxed message towards (peer, address).
    Send {
        peer: PeerId,
        address: Address,
        /// One boxed `{u16 size, u16 type, body}` message.
        payload: Vec<u8>,
        timeout: Duration,
        priority: u32,
        completion: oneshot::Sender<SendResult>,
    },
    /// Tear down the session at (peer, address), failing its queued sends.
    Disconnect { peer: PeerId, address: Address },
    /// Relay a payload to another communicator via the service backchannel.
    Backchannel {
        pid: PeerId,
        body: Vec<u8>,
        target: String,
    },
    /// Stop the driver; pending work fails synchronously.
    Shutdown,
}

/// A backchannel payload delivered by the service.
#[derive(Debug, Clone)]
pub struct BackchannelNotice {
    pub pid: PeerId,
    pub payload: Bytes,
}

/// Cloneable front door to a communicator's driver task.
#[derive(Debug, Clone)]
pub struct CommunicatorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CommunicatorHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    /// Queue one boxed message; the returned channel fires exactly once.
    pub fn send(
        &self,
        peer: PeerId,
        address: Address,
        payload: Vec<u8>,
        timeout: Duration,
        priority: u32,
    ) -> oneshot::Receiver<SendResult> {
        let (tx, rx) = oneshot::channel();
        let command = Command::Send {
            peer,
            address,
            payload,
            timeout,
            priority,
            completion: tx,
        };
        if self.commands.send(command).is_err() {
            // Driver already gone; the dropped sender fails the receiver.
        }
        rx
    }

    pub fn disconnect(&self, peer: PeerId, address: Address) {
        let _ = self.commands.send(Command::Disconnect { peer, address });
    }

    pub fn backchannel(&self, pid: PeerId, body: Vec<u8>, target: &str) {
        let _ = self.commands.send(Command::Backchannel {
            pid,
            body,
            target: target.to_string(),
        });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Queue attributes a protocol announces for its sessions.
#[derive(Debug, Clone, Copy)]
pub struct QueueParams {
    pub network_type: u32,
    pub mtu: u32,
    pub qlen: u64,
    pub priority: u32,
    pub connection_status: u32,
}

/// Generic communicator interface, one implementation per protocol.
#[async_trait]
pub trait Communicator: Send {
    /// The protocol this communicator speaks.
    fn protocol(&self) -> Protocol;

    /// A handle for issuing commands to the driver.
    fn handle(&self) -> CommunicatorHandle;

    /// Take the session monitor stream. Yields once; later calls get `None`.
    fn take_monitor(&mut self) -> Option<mpsc::UnboundedReceiver<MonitorEvent>>;

    /// Take the backchannel notification stream.
    fn take_backchannel(&mut self) -> Option<mpsc::UnboundedReceiver<BackchannelNotice>>;

    /// Drive the communicator until shutdown.
    async fn run(&mut self) -> anyhow::Result<()>;
}

/// Factory for communicator instances.
pub struct CommunicatorFactory;

impl CommunicatorFactory {
    /// Create a communicator for the given protocol.
    ///
    /// Fails startup-fatally on missing config or unusable sockets; every
    /// partially-built resource is released on the error path.
    pub fn create(
        protocol: Protocol,
        identity: PeerId,
        config: &Config,
        service_socket: std::path::PathBuf,
    ) -> anyhow::Result<Box<dyn Communicator>> {
        match protocol {
            Protocol::Unix => Ok(Box::new(UnixCommunicator::new(
                identity,
                config,
                service_socket,
            )?)),
            Protocol::Http | Protocol::Https => Ok(Box::new(HttpCommunicator::new(
                protocol,
                identity,
                config,
                service_socket,
            )?)),
        }
    }
}

/// State shared by every driver: sessions, queue, service, accounting.
///
/// All mutation funnels through here so the counter invariants
/// (`bytes_in_queue == Σ msgsize`, per queue and per session) hold at every
/// await point.
pub(crate) struct CommunicatorCore {
    pub identity: PeerId,
    pub sessions: SessionTable,
    pub queue: SendQueue,
    pub service: ServiceClient,
    pub idle_timeout: Duration,
    monitor_tx: mpsc::UnboundedSender<MonitorEvent>,
    /// Messages discarded before reaching the service or the wire.
    pub discarded: u64,
}

impl CommunicatorCore {
    pub fn new(
        identity: PeerId,
        service: ServiceClient,
        idle_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        (
            Self {
                identity,
                sessions: SessionTable::new(),
                queue: SendQueue::new(),
                service,
                idle_timeout,
                monitor_tx,
                discarded: 0,
            },
            monitor_rx,
        )
    }

    /// Look up or create the session for (peer, address), announcing a queue
    /// for new sessions and emitting a monitor `Up`.
    pub fn get_or_create_session(
        &mut self,
        peer: PeerId,
        address: &Address,
        params: QueueParams,
        now: Instant,
    ) -> Result<SessionId, SessionError> {
        if let Some(id) = self.sessions.find_by_address(&peer, address) {
            return Ok(id);
        }
        let id = self
            .sessions
            .create(peer, address.clone(), self.idle_timeout, now)?;
        let qid = self.service.queue_setup(
            peer,
            &address.to_string(),
            params.network_type,
            params.mtu,
            params.qlen,
            params.priority,
            params.connection_status,
        );
        if let Some(session) = self.sessions.get_mut(id) {
            session.queue_id = Some(qid);
        }
        debug!("session {id} up: peer {} at {address}", peer.short());
        let _ = self.monitor_tx.send(MonitorEvent::Up {
            peer,
            address: address.clone(),
        });
        Ok(id)
    }

    /// Record activity on a session.
    pub fn touch(&mut self, id: SessionId, now: Instant) {
        let idle = self.idle_timeout;
        if let Some(session) = self.sessions.get_mut(id) {
            session.refresh(now, idle);
        }
    }

    /// Destroy a session: fail its queued wrappers, withdraw its queue,
    /// emit monitor `Down`. Completion callbacks fire before the `Down`.
    pub fn destroy_session(&mut self, id: SessionId, error: SendError) {
        let removed = self.queue.fail_session(id, error);
        self.discarded += removed.len() as u64;
        let Ok(session) = self.sessions.remove(id) else {
            return;
        };
        if let Some(qid) = session.queue_id {
            self.service.queue_teardown(qid);
        }
        debug!(
            "session {id} down: peer {} at {}",
            session.peer.short(),
            session.address
        );
        let _ = self.monitor_tx.send(MonitorEvent::Down {
            peer: session.peer,
            address: session.address,
        });
    }

    /// Enqueue one framed wrapper, keeping the session counters in step.
    pub fn enqueue_send(&mut self, wrapper: PendingMessage) {
        let id = wrapper.session();
        if let Some(session) = self.sessions.get_mut(id) {
            session.bytes_in_queue += wrapper.msgsize() as u64;
            session.msgs_in_queue += 1;
        }
        self.queue.enqueue_tail(wrapper);
    }

    /// Complete the head wrapper and settle counters; refresh the session
    /// on success.
    pub fn finish_head(&mut self, result: SendResult, now: Instant) {
        let success = result.is_ok();
        if let Some((sid, size)) = self.queue.finish_head(result) {
            self.settle(&[(sid, size)]);
            if success {
                self.touch(sid, now);
            } else {
                self.discarded += 1;
            }
        }
    }

    /// Drop wrappers whose desired timeout passed, settling counters.
    pub fn sweep_expired(&mut self, now: Instant) {
        let removed = self.queue.fail_expired(now);
        self.discarded += removed.len() as u64;
        self.settle(&removed);
    }

    fn settle(&mut self, removed: &[(SessionId, usize)]) {
        for &(sid, size) in removed {
            if let Some(session) = self.sessions.get_mut(sid) {
                session.bytes_in_queue -= size as u64;
                session.msgs_in_queue -= 1;
            }
        }
    }

    /// Run the per-session idle timers that are due.
    ///
    /// A session still inside its idle window gets a monitor `Up` (defeating
    /// monitor pessimism) and a re-armed check at its current deadline; an
    /// expired one is destroyed.
    pub fn check_timers(&mut self, now: Instant) {
        for id in self.sessions.due(now) {
            let Some(session) = self.sessions.get(id) else {
                continue;
            };
            if session.is_expired(now) {
                self.destroy_session(id, SendError::SessionGone);
            } else {
                let deadline = session.timeout_deadline;
                let peer = session.peer;
                let address = session.address.clone();
                if let Some(session) = self.sessions.get_mut(id) {
                    session.next_check = deadline;
                }
                let _ = self.monitor_tx.send(MonitorEvent::Up { peer, address });
            }
        }
    }

    /// Deliver one boxed message to the service, counting drops.
    pub fn deliver(
        &mut self,
        sender: PeerId,
        body: Vec<u8>,
        notify: Option<&FlowNotify>,
    ) -> DeliveryVerdict {
        let verdict = self.service.deliver(sender, body, notify);
        if !matches!(verdict, DeliveryVerdict::Accepted) {
            self.discarded += 1;
        }
        verdict
    }

    /// Next instant the driver must wake for timers.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.sessions.next_deadline(), self.queue.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Fail everything synchronously; the driver closes sockets afterwards.
    pub fn shutdown(&mut self) {
        let removed = self.queue.fail_all(SendError::Shutdown);
        self.discarded += removed.len() as u64;
        for id in self.sessions.ids() {
            self.destroy_session(id, SendError::Shutdown);
        }
        self.service.shutdown();
        if self.discarded > 0 {
            warn!("shut down with {} discarded messages", self.discarded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::UnixAddress;
    use crate::protocol::{CC_RELIABLE, CS_UP, NT_LOOPBACK};
    use crate::queue::Completion;
    use crate::service::ServiceSettings;

    fn core() -> (CommunicatorCore, mpsc::UnboundedReceiver<MonitorEvent>) {
        let settings = ServiceSettings::new(
            std::path::PathBuf::from("/tmp/nonexistent-svc.sock"),
            "unix",
            CC_RELIABLE,
        );
        CommunicatorCore::new(
            PeerId::from_bytes([9; 32]),
            ServiceClient::new(settings),
            Duration::from_secs(300),
        )
    }

    fn params() -> QueueParams {
        QueueParams {
            network_type: NT_LOOPBACK,
            mtu: 65000,
            qlen: 16,
            priority: 0,
            connection_status: CS_UP,
        }
    }

    fn addr(path: &str) -> Address {
        Address::Unix(UnixAddress::new(path))
    }

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    #[tokio::test]
    async fn session_and_queue_counters_stay_in_sync() {
        let (mut core, _monitor) = core();
        let now = Instant::now();
        let sid = core
            .get_or_create_session(peer(1), &addr("/tmp/a"), params(), now)
            .unwrap();

        let (tx, _rx) = oneshot::channel();
        core.enqueue_send(PendingMessage::new(
            sid,
            vec![0u8; 40],
            36,
            Duration::from_secs(60),
            0,
            Completion::Channel(tx),
        ));

        assert_eq!(core.queue.bytes_in_queue(), 40);
        let session = core.sessions.get(sid).unwrap();
        assert_eq!(session.bytes_in_queue, 40);
        assert_eq!(session.msgs_in_queue, 1);
        assert_eq!(core.queue.session_totals(sid), (40, 1));

        core.finish_head(Ok(36), now);
        let session = core.sessions.get(sid).unwrap();
        assert_eq!(session.bytes_in_queue, 0);
        assert_eq!(session.msgs_in_queue, 0);
        assert_eq!(core.queue.bytes_in_queue(), 0);
    }

    #[tokio::test]
    async fn destroy_session_fails_wrappers_then_reports_down() {
        let (mut core, mut monitor) = core();
        let now = Instant::now();
        let sid = core
            .get_or_create_session(peer(1), &addr("/tmp/a"), params(), now)
            .unwrap();
        assert!(matches!(
            monitor.recv().await,
            Some(MonitorEvent::Up { .. })
        ));

        let (tx, rx) = oneshot::channel();
        core.enqueue_send(PendingMessage::new(
            sid,
            vec![0u8; 8],
            4,
            Duration::from_secs(60),
            0,
            Completion::Channel(tx),
        ));
        core.destroy_session(sid, SendError::SessionGone);

        // Completion fires before the Down notification is observable.
        assert_eq!(rx.await.unwrap(), Err(SendError::SessionGone));
        assert!(matches!(
            monitor.recv().await,
            Some(MonitorEvent::Down { .. })
        ));
        assert!(core.sessions.is_empty());
        assert!(core.queue.is_empty());
    }

    #[tokio::test]
    async fn timer_rearm_emits_up_for_active_session() {
        let (mut core, mut monitor) = core();
        let now = Instant::now();
        let sid = core
            .get_or_create_session(peer(1), &addr("/tmp/a"), params(), now)
            .unwrap();
        let _ = monitor.recv().await; // initial Up

        // Activity moves the deadline; the due timer must re-arm, not kill.
        let check = core.sessions.get(sid).unwrap().next_check;
        core.touch(sid, check - Duration::from_secs(1));
        core.check_timers(check);

        assert!(core.sessions.contains(sid));
        assert!(matches!(
            monitor.recv().await,
            Some(MonitorEvent::Up { .. })
        ));
        // Re-armed to the refreshed deadline.
        let session = core.sessions.get(sid).unwrap();
        assert_eq!(session.next_check, session.timeout_deadline);
    }

    #[tokio::test]
    async fn timer_destroys_idle_session() {
        let (mut core, mut monitor) = core();
        let now = Instant::now();
        let sid = core
            .get_or_create_session(peer(1), &addr("/tmp/a"), params(), now)
            .unwrap();
        let _ = monitor.recv().await;

        let deadline = core.sessions.get(sid).unwrap().timeout_deadline;
        core.check_timers(deadline);
        assert!(!core.sessions.contains(sid));
        assert!(matches!(
            monitor.recv().await,
            Some(MonitorEvent::Down { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_fails_all_pending_work() {
        let (mut core, _monitor) = core();
        let now = Instant::now();
        let sid = core
            .get_or_create_session(peer(1), &addr("/tmp/a"), params(), now)
            .unwrap();
        let (tx, rx) = oneshot::channel();
        core.enqueue_send(PendingMessage::new(
            sid,
            vec![0u8; 8],
            4,
            Duration::from_secs(60),
            0,
            Completion::Channel(tx),
        ));

        core.shutdown();
        assert_eq!(rx.await.unwrap(), Err(SendError::Shutdown));
        assert!(core.sessions.is_empty());
    }
}
