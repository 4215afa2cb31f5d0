//! # HTTP(S) Long-Polling Communicator
//!
//! Carries the sub-message stream over paired HTTP requests per session: a
//! PUT whose streamed request body is the egress path, and a long-lived GET
//! whose streamed response body is the ingress path. The remote peer
//! identifies the talker from the URL's trailing identity segment.
//!
//! ## PUT state machine
//!
//! ```text
//! NotConnected ──▶ Connected ◀──▶ Paused
//!                     ▲             │ idle ≥ 1 s
//!                     │             ▼
//!                     │       TmpDisconnecting ──▶ TmpDisconnected
//!                     │             │ send arrives        │ send arrives
//!                     │             ▼                     │
//!                     └── TmpReconnectRequired ◀──────────┘
//! ```
//!
//! A fatal transfer error in either direction disconnects the session. In
//! XHR-emulation mode the PUT body is closed as soon as the session's queue
//! drains and every completed GET is immediately replaced by a fresh one.
//!
//! The request futures run as plain byte-shovelling tasks tagged with the
//! session id; every state transition happens in the driver task. The GET
//! task hands the driver one chunk at a time and waits for a resume permit,
//! which is how inbound throttling (`next_receive`) delays the reader
//! without buffering unbounded data.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};

use crate::address::Address;
use crate::communicator::{
    BackchannelNotice, Command, Communicator, CommunicatorCore, CommunicatorHandle, Protocol,
    QueueParams,
};
use crate::config::{Config, HttpConfig};
use crate::defaults;
use crate::flow::{DeliveryVerdict, FlowAck, FlowNotify};
use crate::frame::{StreamTokenizer, MAX_DATAGRAM};
use crate::identity::PeerId;
use crate::protocol::{CC_RELIABLE, CS_DOWN, CS_UP, NT_WAN};
use crate::queue::{Completion, PendingMessage, SendError, SentNotice};
use crate::service::{ServiceClient, ServiceEvent, ServiceSettings};
use crate::session::{MonitorEvent, SessionId};

/// Upload-side request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    NotConnected,
    Connected,
    /// Connected but with nothing to send; the idle timer is armed.
    Paused,
    /// Idle timer fired; the body is closing.
    TmpDisconnecting,
    TmpDisconnected,
    /// A send arrived while the body was closing; reconnect when it ends.
    TmpReconnectRequired,
    Disconnected,
}

/// Download-side request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    NotConnected,
    Connected,
    Disconnected,
}

type BodyChunk = Result<Bytes, std::io::Error>;

/// Notifications from the request tasks to the driver.
enum HttpEvent {
    PutDone {
        session: SessionId,
        result: Result<(), String>,
    },
    GetChunk {
        session: SessionId,
        chunk: Bytes,
        /// The driver answers with an optional resume instant; dropping the
        /// sender tells the task to stop.
        resume: oneshot::Sender<Option<Instant>>,
    },
    GetDone {
        session: SessionId,
        result: Result<(), String>,
    },
}

/// Per-session transport state; all of it owned by the driver.
struct HttpSessionState {
    put_state: PutState,
    get_state: GetState,
    put_tx: Option<mpsc::Sender<BodyChunk>>,
    put_task: Option<JoinHandle<()>>,
    get_task: Option<JoinHandle<()>>,
    /// Deadline for the put-disconnect timer while `Paused`.
    put_idle_at: Option<Instant>,
    tokenizer: StreamTokenizer,
    /// Request target: base URL with the local identity appended.
    url: String,
    verify_cert: bool,
}

impl HttpSessionState {
    fn new(url: String, verify_cert: bool) -> Self {
        Self {
            put_state: PutState::NotConnected,
            get_state: GetState::NotConnected,
            put_tx: None,
            put_task: None,
            get_task: None,
            put_idle_at: None,
            tokenizer: StreamTokenizer::new(MAX_DATAGRAM),
            url,
            verify_cert,
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.put_task.take() {
            task.abort();
        }
        if let Some(task) = self.get_task.take() {
            task.abort();
        }
        self.put_tx = None;
    }
}

/// The HTTP(S) long-polling communicator.
pub struct HttpCommunicator {
    core: CommunicatorCore,
    cfg: HttpConfig,
    protocol: Protocol,
    /// TLS-verifying and non-verifying clients; picked per address option.
    client_verify: reqwest::Client,
    client_lax: reqwest::Client,
    http_sessions: HashMap<SessionId, HttpSessionState>,
    events_tx: mpsc::Sender<HttpEvent>,
    events_rx: mpsc::Receiver<HttpEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    sent_tx: mpsc::UnboundedSender<SentNotice>,
    sent_rx: mpsc::UnboundedReceiver<SentNotice>,
    fc_tx: FlowNotify,
    fc_rx: mpsc::UnboundedReceiver<FlowAck>,
    outstanding_fc: usize,
    monitor_rx: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    backchannel_tx: mpsc::UnboundedSender<BackchannelNotice>,
    backchannel_rx: Option<mpsc::UnboundedReceiver<BackchannelNotice>>,
}

impl HttpCommunicator {
    pub fn new(
        protocol: Protocol,
        identity: PeerId,
        config: &Config,
        service_socket: PathBuf,
    ) -> anyhow::Result<Self> {
        let https = matches!(protocol, Protocol::Https);
        let cfg = HttpConfig::from_config(config, https)?;

        let client_verify = Self::build_client(&cfg, true)?;
        let client_lax = Self::build_client(&cfg, false)?;

        let mut settings = ServiceSettings::new(service_socket, protocol.prefix(), CC_RELIABLE);
        settings.max_queue_length = cfg.max_queue_length;
        let service = ServiceClient::new(settings);

        let (core, monitor_rx) = CommunicatorCore::new(identity, service, defaults::IDLE_TIMEOUT);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (fc_tx, fc_rx) = mpsc::unbounded_channel();
        let (backchannel_tx, backchannel_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);

        info!("{protocol} communicator ready (xhr={})", cfg.emulate_xhr);
        Ok(Self {
            core,
            cfg,
            protocol,
            client_verify,
            client_lax,
            http_sessions: HashMap::new(),
            events_tx,
            events_rx,
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
        })
    }

    fn build_client(cfg: &HttpConfig, verify: bool) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(defaults::CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(!verify);
        if let Some(proxy) = &cfg.proxy {
            let mut p = reqwest::Proxy::all(proxy.url())?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                p = p.basic_auth(user, pass);
            }
            if proxy.http_tunneling {
                debug!("PROXY_HTTP_TUNNELING set; tunnelling follows the target scheme");
            }
            builder = builder.proxy(p);
        }
        if let Some(bind) = &cfg.bind_to {
            let addr: IpAddr = bind.parse()?;
            builder = builder.local_address(addr);
        } else if let Some(bind6) = &cfg.bind_to6 {
            if !cfg.disable_v6 {
                let addr: IpAddr = bind6.parse()?;
                builder = builder.local_address(addr);
            }
        } else if cfg.disable_v6 {
            builder = builder.local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        }
        Ok(builder.build()?)
    }

    fn client_for(&self, verify_cert: bool) -> &reqwest::Client {
        if verify_cert {
            &self.client_verify
        } else {
            &self.client_lax
        }
    }

    fn queue_params(&self) -> QueueParams {
        QueueParams {
            network_type: NT_WAN,
            // Streamed transport: no per-message size bound below the frame
            // format's own.
            mtu: u32::MAX,
            qlen: self.cfg.max_queue_length as u64,
            priority: 0,
            connection_status: CS_DOWN,
        }
    }

    /// Session for (peer, address), created with its GET already running.
    fn session_for(
        &mut self,
        peer: PeerId,
        address: &Address,
        now: Instant,
    ) -> Result<SessionId, SendError> {
        let Address::Http(http) = address else {
            return Err(SendError::Io(format!("not an http address: {address}")));
        };
        if let Some(id) = self.core.sessions.find_by_address(&peer, address) {
            return Ok(id);
        }
        if self.http_sessions.len() >= self.cfg.max_connections {
            return Err(SendError::Io(format!(
                "connection limit {} reached",
                self.cfg.max_connections
            )));
        }
        let params = self.queue_params();
        let id = self
            .core
            .get_or_create_session(peer, address, params, now)
            .map_err(|e| SendError::Io(e.to_string()))?;
        let url = format!("{}/{}", http.base_url(), self.core.identity.to_hex());
        let state = HttpSessionState::new(url, http.verify_cert());
        self.http_sessions.insert(id, state);
        self.start_get(id);
        Ok(id)
    }

    fn start_put(&mut self, id: SessionId) {
        let Some((url, verify)) = self
            .http_sessions
            .get(&id)
            .map(|s| (s.url.clone(), s.verify_cert))
        else {
            return;
        };
        let (tx, rx) = mpsc::channel::<BodyChunk>(4);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let request = self.client_for(verify).put(&url).body(body);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let result = match request.send().await {
                Ok(response) if response.status().is_success() => Ok(()),
                Ok(response) => Err(format!("PUT ended with status {}", response.status())),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(HttpEvent::PutDone { session: id, result }).await;
        });
        if let Some(state) = self.http_sessions.get_mut(&id) {
            state.put_tx = Some(tx);
            state.put_task = Some(task);
            state.put_idle_at = None;
            state.put_state = PutState::Connected;
        }
        self.queue_status(id, CS_UP);
        trace!("session {id}: PUT connected");
    }

    fn start_get(&mut self, id: SessionId) {
        // One GET per session; a still-connected reader keeps its stream.
        let Some((url, verify)) = self
            .http_sessions
            .get(&id)
            .filter(|s| s.get_state != GetState::Connected)
            .map(|s| (s.url.clone(), s.verify_cert))
        else {
            return;
        };
        let request = self.client_for(verify).get(&url);
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let outcome = async {
                let response = request.send().await.map_err(|e| e.to_string())?;
                if !response.status().is_success() {
                    return Err(format!("GET ended with status {}", response.status()));
                }
                let mut stream = Box::pin(response.bytes_stream());
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| e.to_string())?;
                    let (resume_tx, resume_rx) = oneshot::channel();
                    let event = HttpEvent::GetChunk {
                        session: id,
                        chunk,
                        resume: resume_tx,
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                    match resume_rx.await {
                        Ok(Some(at)) => tokio::time::sleep_until(at).await,
                        Ok(None) => {}
                        // Driver dropped the permit: session is gone.
                        Err(_) => return Ok(()),
                    }
                }
                Ok(())
            }
            .await;
            let _ = events
                .send(HttpEvent::GetDone { session: id, result: outcome })
                .await;
        });
        if let Some(state) = self.http_sessions.get_mut(&id) {
            state.get_task = Some(task);
            state.get_state = GetState::Connected;
        }
        trace!("session {id}: GET connected");
    }

    fn queue_status(&mut self, id: SessionId, connection_status: u32) {
        let Some(session) = self.core.sessions.get(id) else {
            return;
        };
        let Some(qid) = session.queue_id else {
            return;
        };
        self.core
            .service
            .queue_update(qid, self.cfg.max_queue_length as u64, 0, connection_status);
    }

    /// Tear down one session and its transfers (per-session fatal path).
    fn disconnect_session(&mut self, id: SessionId, error: SendError) {
        if let Some(mut state) = self.http_sessions.remove(&id) {
            state.put_state = PutState::Disconnected;
            state.get_state = GetState::Disconnected;
            state.abort_tasks();
        }
        self.core.destroy_session(id, error);
    }

    /// Enqueue one boxed payload, waking or re-establishing the PUT.
    fn queue_payload(
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
        let payload_len = payload.len();
        self.core.enqueue_send(PendingMessage::new(
            session,
            payload,
            payload_len,
            timeout,
            priority,
            completion,
        ));
        self.wake_put(session);
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

    /// Walk the PUT state machine for "data is now available".
    fn wake_put(&mut self, id: SessionId) {
        let Some(state) = self.http_sessions.get_mut(&id) else {
            return;
        };
        match state.put_state {
            PutState::NotConnected | PutState::TmpDisconnected => {
                self.start_put(id);
            }
            PutState::Paused => {
                state.put_state = PutState::Connected;
                state.put_idle_at = None;
            }
            PutState::TmpDisconnecting => {
                state.put_state = PutState::TmpReconnectRequired;
            }
            PutState::Connected | PutState::TmpReconnectRequired | PutState::Disconnected => {}
        }
    }

    /// After the head wrapper finished: pause or close a drained PUT.
    fn after_head_done(&mut self, id: SessionId, now: Instant) {
        let (_, msgs) = self.core.queue.session_totals(id);
        if msgs > 0 {
            return;
        }
        let xhr = self.cfg.emulate_xhr;
        let Some(state) = self.http_sessions.get_mut(&id) else {
            return;
        };
        if state.put_state != PutState::Connected {
            return;
        }
        if xhr {
            // End the request as soon as the queue drains.
            state.put_tx = None;
            state.put_state = PutState::TmpDisconnecting;
        } else {
            state.put_state = PutState::Paused;
            state.put_idle_at = Some(now + defaults::PUT_DISCONNECT_TIMEOUT);
        }
    }

    /// The sender clone for the FIFO head's PUT, when it can take bytes.
    fn head_feeder(&self) -> Option<(SessionId, mpsc::Sender<BodyChunk>)> {
        let head = self.core.queue.head()?;
        let state = self.http_sessions.get(&head.session())?;
        if state.put_state != PutState::Connected {
            return None;
        }
        let tx = state.put_tx.clone()?;
        Some((head.session(), tx))
    }

    /// Establish or wake the head session's PUT if it cannot take bytes yet.
    fn prepare_head(&mut self) {
        let Some(head) = self.core.queue.head() else {
            return;
        };
        let id = head.session();
        match self.http_sessions.get(&id).map(|s| s.put_state) {
            Some(PutState::Connected) => {}
            Some(_) => self.wake_put(id),
            None => {
                // Session vanished under its wrappers; fail them.
                let now = Instant::now();
                self.core.finish_head(Err(SendError::SessionGone), now);
            }
        }
    }

    /// Feed one chunk of the head wrapper through a reserved permit.
    fn feed_head(&mut self, id: SessionId, permit: mpsc::Permit<'_, BodyChunk>) {
        let now = Instant::now();
        let Some(head) = self.core.queue.head_mut() else {
            return;
        };
        if head.session() != id {
            // The queue moved between reserve and grant; drop the slot.
            return;
        }
        let remaining = head.remaining();
        let take = remaining.len().min(defaults::HTTP_CHUNK);
        let chunk = Bytes::copy_from_slice(&remaining[..take]);
        head.advance(take);
        let drained = head.is_drained();
        permit.send(Ok(chunk));
        if drained {
            let payload = self.core.queue.head().map(|w| w.payload_len()).unwrap_or(0);
            self.core.finish_head(Ok(payload), now);
            self.after_head_done(id, now);
        }
    }

    fn handle_event(&mut self, event: HttpEvent) {
        let now = Instant::now();
        match event {
            HttpEvent::PutDone { session, result } => {
                let Some(state) = self.http_sessions.get_mut(&session) else {
                    return;
                };
                state.put_task = None;
                state.put_tx = None;
                match result {
                    Err(reason) => {
                        debug!("session {session}: PUT failed: {reason}");
                        self.disconnect_session(session, SendError::Io(reason));
                    }
                    Ok(()) => match state.put_state {
                        PutState::TmpDisconnecting => {
                            state.put_state = PutState::TmpDisconnected;
                            self.queue_status(session, CS_DOWN);
                            trace!("session {session}: PUT tmp-disconnected");
                        }
                        PutState::TmpReconnectRequired => {
                            // The send that demanded the reconnect may have
                            // timed out meanwhile; only reopen for real data.
                            if self.core.queue.session_totals(session).1 > 0 {
                                self.start_put(session);
                            } else {
                                state.put_state = PutState::NotConnected;
                            }
                        }
                        _ => {
                            // The server ended an active PUT. Under XHR
                            // emulation that is the normal cadence.
                            let pending = self.core.queue.session_totals(session).1 > 0;
                            if pending {
                                self.start_put(session);
                            } else {
                                state.put_state = PutState::TmpDisconnected;
                                self.queue_status(session, CS_DOWN);
                            }
                        }
                    },
                }
            }
            HttpEvent::GetChunk { session, chunk, resume } => {
                if !self.core.sessions.contains(session) {
                    drop(resume);
                    return;
                }
                self.ingest_chunk(session, chunk, resume, now);
            }
            HttpEvent::GetDone { session, result } => {
                let Some(state) = self.http_sessions.get_mut(&session) else {
                    return;
                };
                state.get_task = None;
                state.get_state = GetState::NotConnected;
                match result {
                    Ok(()) if self.cfg.emulate_xhr => {
                        // XHR emulation: a fresh GET after every completion.
                        self.start_get(session);
                    }
                    Ok(()) => {
                        debug!("session {session}: GET ended");
                        self.disconnect_session(session, SendError::SessionGone);
                    }
                    Err(reason) => {
                        debug!("session {session}: GET failed: {reason}");
                        self.disconnect_session(session, SendError::Io(reason));
                    }
                }
            }
        }
    }

    /// Tokenize one ingress chunk, deliver its messages, answer the permit.
    fn ingest_chunk(
        &mut self,
        session: SessionId,
        chunk: Bytes,
        resume: oneshot::Sender<Option<Instant>>,
        now: Instant,
    ) {
        let chunk_len = chunk.len();
        let Some(state) = self.http_sessions.get_mut(&session) else {
            drop(resume);
            return;
        };
        let messages = match state.tokenizer.push(&chunk) {
            Ok(messages) => messages,
            Err(e) => {
                debug!("session {session}: ingress stream broken: {e}");
                drop(resume);
                self.disconnect_session(session, SendError::Io(e.to_string()));
                return;
            }
        };

        let Some(peer) = self.core.sessions.get(session).map(|s| s.peer) else {
            drop(resume);
            return;
        };
        self.core.touch(session, now);
        for message in messages {
            let notify = self.fc_tx.clone();
            match self
                .core
                .deliver(peer, message.raw().to_vec(), Some(&notify))
            {
                DeliveryVerdict::Accepted => self.outstanding_fc += 1,
                DeliveryVerdict::SoftDrop | DeliveryVerdict::Dropped => {}
            }
        }

        // Inbound throttling: push next_receive out by the configured rate
        // and keep the reader paused until then.
        let pause_until = self.cfg.inbound_limit.filter(|&limit| limit > 0).map(|limit| {
            let delay = Duration::from_secs_f64(chunk_len as f64 / limit as f64);
            now + delay
        });
        if let Some(session_state) = self.core.sessions.get_mut(session) {
            session_state.next_receive = pause_until;
        }
        let _ = resume.send(pause_until.filter(|&at| at > now));
    }

    fn handle_service_event(&mut self, event: ServiceEvent) {
        let now = Instant::now();
        match event {
            ServiceEvent::Connected => {
                debug!("service connection established");
            }
            ServiceEvent::QueueCreate { request_id, peer, address } => {
                let ok = match Address::parse(&address) {
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
                self.queue_payload(
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
                self.queue_payload(
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
                    self.disconnect_session(id, SendError::SessionGone);
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

        // Sessions the idle timer destroyed still hold transfer tasks.
        let dead: Vec<SessionId> = self
            .http_sessions
            .keys()
            .copied()
            .filter(|id| !self.core.sessions.contains(*id))
            .collect();
        for id in dead {
            if let Some(mut state) = self.http_sessions.remove(&id) {
                state.abort_tasks();
            }
        }

        // Fire due put-disconnect timers.
        let due: Vec<SessionId> = self
            .http_sessions
            .iter()
            .filter(|(_, s)| {
                s.put_state == PutState::Paused
                    && s.put_idle_at.map_or(false, |at| at <= now)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(state) = self.http_sessions.get_mut(&id) {
                trace!("session {id}: PUT idle, closing body");
                state.put_state = PutState::TmpDisconnecting;
                state.put_idle_at = None;
                // Dropping the sender ends the streamed body gracefully.
                state.put_tx = None;
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let put_idle = self
            .http_sessions
            .values()
            .filter_map(|s| s.put_idle_at)
            .min();
        [self.core.next_wakeup(), put_idle]
            .into_iter()
            .flatten()
            .min()
    }
}

/// Reserve capacity on the head PUT's body channel, pending forever when
/// there is none to feed.
async fn reserve_feeder(
    feeder: &Option<(SessionId, mpsc::Sender<BodyChunk>)>,
) -> Option<mpsc::Permit<'_, BodyChunk>> {
    match feeder {
        Some((_, tx)) => tx.reserve().await.ok(),
        None => std::future::pending().await,
    }
}

#[async_trait]
impl Communicator for HttpCommunicator {
    fn protocol(&self) -> Protocol {
        self.protocol
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
        info!("{} communicator running", self.protocol);
        loop {
            self.prepare_head();
            let feeder = self.head_feeder();
            let wake = self.next_wakeup();
            let has_wake = wake.is_some();
            let wake_at =
                wake.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

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

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }

                permit = reserve_feeder(&feeder) => {
                    match (permit, &feeder) {
                        (Some(permit), Some((id, _))) => self.feed_head(*id, permit),
                        // Channel closed: the PUT is going down and its
                        // PutDone event will walk the state machine.
                        _ => {}
                    }
                }

                _ = tokio::time::sleep_until(wake_at), if has_wake => {
                    self.run_timers(Instant::now());
                }
            }

            self.core.sweep_expired(Instant::now());
        }

        for (_, mut state) in self.http_sessions.drain() {
            state.abort_tasks();
        }
        self.core.shutdown();
        info!(
            "{} communicator stopped ({} delivered, {} discarded)",
            self.protocol,
            self.core.service.delivered(),
            self.core.discarded
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_states_walk_the_documented_machine() {
        // The transition table from the module docs, exercised as data.
        let wake = |s: PutState| match s {
            PutState::NotConnected | PutState::TmpDisconnected => PutState::Connected,
            PutState::Paused => PutState::Connected,
            PutState::TmpDisconnecting => PutState::TmpReconnectRequired,
            other => other,
        };
        assert_eq!(wake(PutState::NotConnected), PutState::Connected);
        assert_eq!(wake(PutState::Paused), PutState::Connected);
        assert_eq!(wake(PutState::TmpDisconnecting), PutState::TmpReconnectRequired);
        assert_eq!(wake(PutState::TmpDisconnected), PutState::Connected);
        assert_eq!(wake(PutState::Connected), PutState::Connected);
    }

    #[test]
    fn throttle_delay_scales_with_chunk_size() {
        let limit = 1024u64; // bytes per second
        let delay = Duration::from_secs_f64(512.0 / limit as f64);
        assert_eq!(delay, Duration::from_millis(500));
    }
}
