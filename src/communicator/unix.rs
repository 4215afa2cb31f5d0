//! # UNIX Datagram Communicator
//!
//! Carries frames over a `SOCK_DGRAM` UNIX socket, bound either at a
//! filesystem path (`transport-unix/UNIXPATH`) or in the Linux abstract
//! namespace (`testing/USE_ABSTRACT_SOCKETS`). One datagram is one outer
//! frame; the peer's own bound address is recovered from `recvfrom`, so an
//! inbound datagram from an unknown address creates a session on the spot.
//!
//! The send path is a readiness loop over the global FIFO head:
//!
//! - `EAGAIN` leaves the wrapper in place for the next writable edge;
//! - `ENOBUFS` backs off briefly and retries;
//! - `EMSGSIZE` grows `SO_SNDBUF` to the next-thousand bound above the
//!   frame and retries that send exactly once;
//! - anything else fails the wrapper permanently.
//!
//! Inbound flow control: every delivery towards the service carries a
//! flow-control hook, and reading pauses while the number of unacked
//! deliveries reaches the configured queue length.

use std::collections::HashMap;
use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixDatagram};
use std::path::PathBuf;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::address::{Address, UnixAddress};
use crate::communicator::{
    BackchannelNotice, Command, Communicator, CommunicatorCore, CommunicatorHandle, Protocol,
    QueueParams,
};
use crate::config::{Config, UnixConfig};
use crate::defaults;
use crate::flow::{DeliveryVerdict, FlowAck, FlowNotify};
use crate::frame::{self, FrameError};
use crate::identity::PeerId;
use crate::protocol::{CC_RELIABLE, CS_UP, NT_LOOPBACK};
use crate::queue::{Completion, PendingMessage, SendError, SentNotice};
use crate::service::{ServiceClient, ServiceEvent, ServiceSettings};
use crate::session::{MonitorEvent, SessionId};

/// Outcome of one head-of-queue send attempt.
enum SendAttempt {
    /// Frame on the wire; wrapper is done.
    Sent,
    /// Spurious readiness; wait for the next writable edge.
    NotReady,
    /// Kernel buffers exhausted; retry after a short pause.
    BackOff,
    /// Permanent failure for this wrapper.
    Failed(SendError),
}

/// The UNIX datagram communicator.
pub struct UnixCommunicator {
    core: CommunicatorCore,
    socket: AsyncFd<UnixDatagram>,
    cfg: UnixConfig,
    own_address: Address,
    /// Resolved sockaddr per session, filled at session setup.
    peers: HashMap<SessionId, UnixSocketAddr>,
    recv_buf: Vec<u8>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    sent_tx: mpsc::UnboundedSender<SentNotice>,
    sent_rx: mpsc::UnboundedReceiver<SentNotice>,
    fc_tx: FlowNotify,
    fc_rx: mpsc::UnboundedReceiver<FlowAck>,
    /// Deliveries towards the service still awaiting their flow ack.
    outstanding_fc: usize,
    monitor_rx: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    backchannel_tx: mpsc::UnboundedSender<BackchannelNotice>,
    backchannel_rx: Option<mpsc::UnboundedReceiver<BackchannelNotice>>,
    /// ENOBUFS pacing: no send attempts before this instant.
    send_backoff: Option<Instant>,
    /// Filesystem socket to unlink on drop, when this instance bound it.
    owned_socket_path: Option<PathBuf>,
}

impl UnixCommunicator {
    /// Bind the socket and assemble the communicator.
    ///
    /// Startup-fatal on missing `UNIXPATH`, unusable socket, or bad config;
    /// nothing leaks on the error path (the bound socket unlinks on drop of
    /// the partially built value only once it is stored here).
    pub fn new(
        identity: PeerId,
        config: &Config,
        service_socket: PathBuf,
    ) -> anyhow::Result<Self> {
        let cfg = UnixConfig::from_config(config)?;

        let use_abstract = cfg.use_abstract && cfg!(target_os = "linux");
        if cfg.use_abstract && !use_abstract {
            warn!("abstract sockets requested but unsupported here; using a path");
        }

        let path_str = cfg.socket_path.to_string_lossy().to_string();
        let (socket, own_unix, owned_socket_path) = if use_abstract {
            let name = path_str.trim_start_matches('@').to_string();
            let own = UnixAddress::new(format!("@{name}"));
            let sockaddr = own.to_socket_addr()?;
            let socket = UnixDatagram::bind_addr(&sockaddr)?;
            (socket, own, None)
        } else {
            // A stale socket file from a crashed run would fail the bind.
            let _ = std::fs::remove_file(&cfg.socket_path);
            let socket = UnixDatagram::bind(&cfg.socket_path)?;
            (socket, UnixAddress::new(path_str), Some(cfg.socket_path.clone()))
        };
        socket.set_nonblocking(true)?;
        if let Some(sndbuf) = cfg.sndbuf {
            SockRef::from(&socket).set_send_buffer_size(sndbuf)?;
        }
        let socket = AsyncFd::new(socket)?;

        let mut settings = ServiceSettings::new(service_socket, "unix", CC_RELIABLE);
        settings.max_queue_length = cfg.max_queue_length;
        let mut service = ServiceClient::new(settings);

        let own_address = Address::Unix(own_unix);
        service.add_address(&own_address.to_string(), NT_LOOPBACK);
        info!("unix communicator at {own_address}");

        let (core, monitor_rx) =
            CommunicatorCore::new(identity, service, defaults::IDLE_TIMEOUT);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (fc_tx, fc_rx) = mpsc::unbounded_channel();
        let (backchannel_tx, backchannel_rx) = mpsc::unbounded_channel();

        Ok(Self {
            core,
            socket,
            cfg,
            own_address,
            peers: HashMap::new(),
            recv_buf: vec![0u8; defaults::RECV_BUFFER],
            commands_tx,
            commands_rx,
            sent_tx,
            sent_rx,
            fc_tx,
            fc_rx,
            outstanding_fc: 0,
            monitor_rx: Some(monitor_rx),
            backchannel_tx,
            backchannel_rx: Some(backchannel_rx),
            send_backoff: None,
            owned_socket_path,
        })
    }

    fn queue_params(&self) -> QueueParams {
        QueueParams {
            network_type: NT_LOOPBACK,
            mtu: (frame::MAX_DATAGRAM - frame::FRAME_HEADER_LEN) as u32,
            qlen: self.cfg.max_queue_length as u64,
            priority: 0,
            connection_status: CS_UP,
        }
    }

    /// Session for (peer, address), created and registered on first use.
    fn session_for(
        &mut self,
        peer: PeerId,
        address: &Address,
        now: Instant,
    ) -> Result<SessionId, SendError> {
        let Address::Unix(unix) = address else {
            return Err(SendError::Io(format!("not a unix address: {address}")));
        };
        if let Some(id) = self.core.sessions.find_by_address(&peer, address) {
            return Ok(id);
        }
        let sockaddr = unix
            .to_socket_addr()
            .map_err(|e| SendError::Io(e.to_string()))?;
        let params = self.queue_params();
        let id = self
            .core
            .get_or_create_session(peer, address, params, now)
            .map_err(|e| SendError::Io(e.to_string()))?;
        self.peers.insert(id, sockaddr);
        Ok(id)
    }

    /// Enqueue one boxed payload for (peer, address).
    fn queue_frame(
        &mut self,
        peer: PeerId,
        address: &Address,
        payload: Vec<u8>,
        timeout: Duration,
        priority: u32,
        completion: Completion,
    ) {
        let now = Instant::now();
        if crate::protocol::validate_boxed(&payload).is_err() {
            self.complete_now(
                completion,
                Err(SendError::Io("payload is not a boxed message".into())),
            );
            return;
        }
        let session = match self.session_for(peer, address, now) {
            Ok(id) => id,
            Err(e) => {
                self.complete_now(completion, Err(e));
                return;
            }
        };
        let frame = match frame::encode_frame(&self.core.identity, &payload) {
            Ok(frame) => frame,
            Err(e) => {
                self.complete_now(completion, Err(SendError::Io(e.to_string())));
                return;
            }
        };
        let payload_len = payload.len();
        self.core.enqueue_send(PendingMessage::new(
            session,
            frame,
            payload_len,
            timeout,
            priority,
            completion,
        ));
    }

    fn complete_now(&mut self, completion: Completion, result: crate::queue::SendResult) {
        self.core.discarded += 1;
        match completion {
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::ServiceAck { mid, receiver, notify } => {
                let _ = notify.send(SentNotice { mid, receiver, result });
            }
            Completion::None => {}
        }
    }

    /// One send attempt for the FIFO head, inside a writable guard.
    ///
    /// Free function over disjoint fields: the guard borrows the socket
    /// while the core is mutated.
    fn attempt_send(
        socket: &AsyncFd<UnixDatagram>,
        guard: &mut AsyncFdReadyGuard<'_, UnixDatagram>,
        core: &CommunicatorCore,
        peers: &HashMap<SessionId, UnixSocketAddr>,
    ) -> SendAttempt {
        let Some(head) = core.queue.head() else {
            return SendAttempt::NotReady;
        };
        let Some(target) = peers.get(&head.session()) else {
            return SendAttempt::Failed(SendError::SessionGone);
        };
        let frame_len = head.frame().len();

        match guard.try_io(|fd| fd.get_ref().send_to_addr(head.frame(), target)) {
            Err(_would_block) => SendAttempt::NotReady,
            Ok(Ok(n)) if n == frame_len => SendAttempt::Sent,
            Ok(Ok(n)) => SendAttempt::Failed(SendError::Io(format!(
                "datagram truncated: {n} of {frame_len} bytes"
            ))),
            Ok(Err(e)) => match e.raw_os_error() {
                Some(libc::ENOBUFS) => SendAttempt::BackOff,
                Some(libc::EMSGSIZE) => {
                    Self::grow_and_retry(socket, guard, head.frame(), target)
                }
                _ => SendAttempt::Failed(SendError::Io(e.to_string())),
            },
        }
    }

    /// The EMSGSIZE path: grow SO_SNDBUF and retry the same send once.
    fn grow_and_retry(
        socket: &AsyncFd<UnixDatagram>,
        guard: &mut AsyncFdReadyGuard<'_, UnixDatagram>,
        frame: &[u8],
        target: &UnixSocketAddr,
    ) -> SendAttempt {
        let sock = SockRef::from(socket.get_ref());
        let current = match sock.send_buffer_size() {
            Ok(size) => size,
            Err(e) => return SendAttempt::Failed(SendError::Io(e.to_string())),
        };
        if current >= frame.len() {
            // Growing cannot help; the frame is oversized for this socket.
            return SendAttempt::Failed(SendError::Io(format!(
                "EMSGSIZE with sndbuf {current} >= frame {}",
                frame.len()
            )));
        }
        let target_size = ((frame.len() / 1000) + 2) * 1000;
        if let Err(e) = sock.set_send_buffer_size(target_size) {
            return SendAttempt::Failed(SendError::Io(e.to_string()));
        }
        debug!("grew SO_SNDBUF to {target_size} for a {} byte frame", frame.len());

        match guard.try_io(|fd| fd.get_ref().send_to_addr(frame, target)) {
            Err(_would_block) => SendAttempt::NotReady,
            Ok(Ok(n)) if n == frame.len() => SendAttempt::Sent,
            Ok(Ok(n)) => SendAttempt::Failed(SendError::Io(format!(
                "datagram truncated: {n} of {} bytes",
                frame.len()
            ))),
            Ok(Err(e)) => SendAttempt::Failed(SendError::Io(e.to_string())),
        }
    }

    /// Process one inbound datagram.
    fn handle_datagram(&mut self, len: usize, from: UnixSocketAddr) {
        let now = Instant::now();
        let Some(sender_address) = sender_address(&from) else {
            trace!("dropping datagram from unnamed socket");
            self.core.discarded += 1;
            return;
        };

        let datagram = {
            let buf = &self.recv_buf[..len];
            match frame::decode_frame(buf) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping malformed datagram from {sender_address:?}: {e}");
                    self.core.discarded += 1;
                    return;
                }
            }
        };

        let address = Address::Unix(sender_address);
        let session = match self.session_for(datagram.sender, &address, now) {
            Ok(id) => id,
            Err(e) => {
                debug!("no session for inbound datagram: {e}");
                self.core.discarded += 1;
                return;
            }
        };
        self.core.touch(session, now);

        for item in frame::InnerMessages::new(datagram.body) {
            match item {
                Ok(message) => {
                    let notify = self.fc_tx.clone();
                    match self.core.deliver(
                        datagram.sender,
                        message.raw().to_vec(),
                        Some(&notify),
                    ) {
                        DeliveryVerdict::Accepted => self.outstanding_fc += 1,
                        DeliveryVerdict::SoftDrop | DeliveryVerdict::Dropped => {}
                    }
                }
                Err(FrameError::BadInnerSize { size, offset }) => {
                    debug!("stopping tokenization at offset {offset} (size {size})");
                    self.core.discarded += 1;
                    break;
                }
                Err(e) => {
                    debug!("tokenization error: {e}");
                    self.core.discarded += 1;
                    break;
                }
            }
        }
    }

    fn handle_service_event(&mut self, event: ServiceEvent) {
        let now = Instant::now();
        match event {
            ServiceEvent::Connected => {
                debug!("service connection established");
            }
            ServiceEvent::QueueCreate { request_id, peer, address } => {
                let parsed = Address::parse(&address);
                let ok = match parsed {
                    Ok(addr) => self.session_for(peer, &addr, now).is_ok(),
                    Err(e) => {
                        debug!("QUEUE_CREATE with bad address {address:?}: {e}");
                        false
                    }
                };
                self.core.service.queue_create_reply(ok, request_id, peer);
            }
            ServiceEvent::SendMsg { queue_id, mid, receiver, payload } => {
                let Some(session) = self.core.sessions.find_by_queue_id(queue_id) else {
                    // Queue is gone; report NO right away.
                    self.core.service.send_msg_ack(false, mid, receiver);
                    return;
                };
                let Some(address) = self.core.sessions.get(session).map(|s| s.address.clone())
                else {
                    self.core.service.send_msg_ack(false, mid, receiver);
                    return;
                };
                let completion = Completion::ServiceAck {
                    mid,
                    receiver,
                    notify: self.sent_tx.clone(),
                };
                self.queue_frame(
                    receiver,
                    &address,
                    payload.to_vec(),
                    defaults::SEND_TIMEOUT,
                    0,
                    completion,
                );
            }
            ServiceEvent::BackchannelIncoming { pid, payload } => {
                let _ = self.backchannel_tx.send(BackchannelNotice { pid, payload });
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { peer, address, payload, timeout, priority, completion } => {
                self.queue_frame(
                    peer,
                    &address,
                    payload,
                    timeout,
                    priority,
                    Completion::Channel(completion),
                );
                true
            }
            Command::Disconnect { peer, address } => {
                if let Some(id) = self.core.sessions.find_by_address(&peer, &address) {
                    self.core.destroy_session(id, SendError::SessionGone);
                    self.peers.remove(&id);
                }
                true
            }
            Command::Backchannel { pid, body, target } => {
                self.core.service.backchannel(pid, body, &target);
                true
            }
            Command::Shutdown => false,
        }
    }

    fn run_timers(&mut self, now: Instant) {
        self.core.sweep_expired(now);
        self.core.check_timers(now);
        self.peers.retain(|id, _| self.core.sessions.contains(*id));
        if let Some(at) = self.send_backoff {
            if at <= now {
                self.send_backoff = None;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        [self.core.next_wakeup(), self.send_backoff]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Map a datagram source to its transport address.
fn sender_address(from: &UnixSocketAddr) -> Option<UnixAddress> {
    if let Some(path) = from.as_pathname() {
        return Some(UnixAddress::new(path.to_string_lossy().to_string()));
    }
    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        if let Some(name) = from.as_abstract_name() {
            return Some(UnixAddress::new(format!(
                "@{}",
                String::from_utf8_lossy(name)
            )));
        }
    }
    None
}

#[async_trait]
impl Communicator for UnixCommunicator {
    fn protocol(&self) -> Protocol {
        Protocol::Unix
    }

    fn handle(&self) -> CommunicatorHandle {
        CommunicatorHandle::new(self.commands_tx.clone())
    }

    fn take_monitor(&mut self) -> Option<mpsc::UnboundedReceiver<MonitorEvent>> {
        self.monitor_rx.take()
    }

    fn take_backchannel(&mut self) -> Option<mpsc::UnboundedReceiver<BackchannelNotice>> {
        self.backchannel_rx.take()
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        info!("unix communicator running at {}", self.own_address);
        loop {
            let now = Instant::now();
            let want_send = !self.core.queue.is_empty()
                && self.send_backoff.map_or(true, |at| at <= now);
            let can_recv = self.outstanding_fc < self.cfg.max_queue_length;
            let wake = self.next_wakeup();
            let has_wake = wake.is_some();
            let wake_at = wake.unwrap_or_else(|| now + Duration::from_secs(3600));

            tokio::select! {
                biased;

                command = self.commands_rx.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command),
                        None => false,
                    };
                    if !keep_running {
                        break;
                    }
                }

                Some(notice) = self.sent_rx.recv() => {
                    self.core.service.send_msg_ack(
                        notice.result.is_ok(),
                        notice.mid,
                        notice.receiver,
                    );
                }

                Some(_ack) = self.fc_rx.recv() => {
                    self.outstanding_fc = self.outstanding_fc.saturating_sub(1);
                }

                event = self.core.service.drive() => {
                    self.handle_service_event(event);
                }

                guard = self.socket.writable(), if want_send => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            error!("socket poll error: {e}");
                            return Err(e.into());
                        }
                    };
                    let attempt = Self::attempt_send(
                        &self.socket,
                        &mut guard,
                        &self.core,
                        &self.peers,
                    );
                    drop(guard);
                    let now = Instant::now();
                    match attempt {
                        SendAttempt::Sent => {
                            let payload = self
                                .core
                                .queue
                                .head()
                                .map(|w| w.payload_len())
                                .unwrap_or(0);
                            self.core.finish_head(Ok(payload), now);
                        }
                        SendAttempt::NotReady => {}
                        SendAttempt::BackOff => {
                            self.send_backoff = Some(now + Duration::from_millis(2));
                        }
                        SendAttempt::Failed(error) => {
                            self.core.finish_head(Err(error), now);
                        }
                    }
                }

                guard = self.socket.readable(), if can_recv => {
                    let mut guard = match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            error!("socket poll error: {e}");
                            return Err(e.into());
                        }
                    };
                    let received = guard
                        .try_io(|fd| fd.get_ref().recv_from(&mut self.recv_buf));
                    drop(guard);
                    match received {
                        Err(_would_block) => {}
                        Ok(Ok((len, from))) => self.handle_datagram(len, from),
                        Ok(Err(e)) => {
                            debug!("recv error: {e}");
                        }
                    }
                }

                _ = tokio::time::sleep_until(wake_at), if has_wake => {
                    self.run_timers(Instant::now());
                }
            }

            // Timed-out wrappers are drained on every pass, not only on
            // timer wakeups, so a busy socket cannot starve expiry.
            self.core.sweep_expired(Instant::now());
        }

        self.core.shutdown();
        info!(
            "unix communicator stopped ({} delivered, {} discarded)",
            self.core.service.delivered(),
            self.core.discarded
        );
        Ok(())
    }
}

impl Drop for UnixCommunicator {
    fn drop(&mut self) {
        if let Some(path) = &self.owned_socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove socket file {}: {e}", path.display());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sndbuf_growth_rounds_to_next_thousand() {
        // The EMSGSIZE growth schedule from the send path.
        let grow = |len: usize| ((len / 1000) + 2) * 1000;
        assert_eq!(grow(40_036), 42_000);
        assert_eq!(grow(999), 2_000);
        assert_eq!(grow(1_000), 3_000);
    }

    #[test]
    fn sender_address_prefers_pathname() {
        let addr = UnixSocketAddr::from_pathname("/tmp/peer.sock").unwrap();
        let unix = sender_address(&addr).unwrap();
        assert_eq!(unix.path, "/tmp/peer.sock");
        assert!(!unix.is_abstract());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sender_address_marks_abstract() {
        use std::os::linux::net::SocketAddrExt;
        let addr = UnixSocketAddr::from_abstract_name(b"abs-peer").unwrap();
        let unix = sender_address(&addr).unwrap();
        assert_eq!(unix.path, "@abs-peer");
        assert!(unix.is_abstract());
    }
}
