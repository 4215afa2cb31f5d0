//! # Service Client
//!
//! The communicator side of the communicator↔service protocol. One
//! [`ServiceClient`] is owned by each communicator's driver task and drives
//! a stream UNIX connection to the local transport service.
//!
//! Responsibilities:
//!
//! - connect, and reconnect with exponential backoff after any error;
//! - announce the communicator, every live address, and every live queue on
//!   each (re)connect, keeping their original ids;
//! - deliver received messages (`INCOMING_MSG`) with optional flow-control
//!   correlation and soft-drop backpressure;
//! - surface service requests (`QUEUE_CREATE`, `SEND_MSG`, backchannel) to
//!   the driver;
//! - track ack-pending sends and emit `SEND_MSG_ACK`s.
//!
//! All I/O is readiness-based (`ready()` + `try_read_buf`/`try_write`), so
//! [`drive`](ServiceClient::drive) is safe to poll inside the driver's
//! `select!` loop: cancellation can never tear an envelope in half.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::flow::{AckPending, DeliveryVerdict, FlowControl, FlowNotify};
use crate::identity::PeerId;
use crate::protocol::{
    decode_control, split_envelope, ControlIn, ControlOut, ProtocolError,
};

/// Static parameters of one service connection.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Path of the service's UNIX listening socket.
    pub socket_path: PathBuf,
    /// Address-prefix / communicator name sent in NEW_COMMUNICATOR.
    pub prefix: String,
    /// Communicator characteristics (reliability class).
    pub characteristics: u32,
    /// Soft cap on pending INCOMING_MSG envelopes before soft-drop.
    pub max_queue_length: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Advertised validity of offered addresses.
    pub address_validity: Duration,
}

impl ServiceSettings {
    pub fn new(socket_path: PathBuf, prefix: impl Into<String>, characteristics: u32) -> Self {
        Self {
            socket_path,
            prefix: prefix.into(),
            characteristics,
            max_queue_length: crate::defaults::MAX_QUEUE_LENGTH,
            backoff_initial: crate::defaults::BACKOFF_INITIAL,
            backoff_max: crate::defaults::BACKOFF_MAX,
            address_validity: crate::defaults::ADDRESS_VALIDITY,
        }
    }
}

/// Requests the service makes of the communicator.
#[derive(Debug)]
pub enum ServiceEvent {
    /// Connection (re)established; announcements are already queued.
    Connected,
    /// The service wants an outbound queue to `peer` at `address`.
    QueueCreate {
        request_id: u32,
        peer: PeerId,
        address: String,
    },
    /// The service wants `payload` sent on a previously announced queue.
    SendMsg {
        queue_id: u32,
        mid: u64,
        receiver: PeerId,
        payload: Bytes,
    },
    /// Backchannel payload for this communicator's notify hook.
    BackchannelIncoming { pid: PeerId, payload: Bytes },
}

/// One offered address, re-announced on every reconnect under the same aid.
#[derive(Debug, Clone)]
struct AddressEntry {
    aid: u32,
    address: String,
    network_type: u32,
}

/// One announced queue, re-announced on every reconnect under the same qid.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub qid: u32,
    pub peer: PeerId,
    pub address: String,
    pub network_type: u32,
    pub mtu: u32,
    pub qlen: u64,
    pub priority: u32,
    pub connection_status: u32,
}

#[derive(Debug)]
struct OutEnvelope {
    bytes: Vec<u8>,
    is_incoming_msg: bool,
}

/// Client of the local transport service.
#[derive(Debug)]
pub struct ServiceClient {
    settings: ServiceSettings,
    conn: Option<UnixStream>,
    inbuf: BytesMut,
    outbound: VecDeque<OutEnvelope>,
    /// Bytes of the front envelope already written.
    write_offset: usize,
    /// INCOMING_MSG envelopes currently queued (backpressure gauge).
    incoming_in_flight: usize,
    backoff: Duration,
    reconnect_at: Instant,
    addresses: Vec<AddressEntry>,
    next_aid: u32,
    queues: Vec<QueueRecord>,
    next_qid: u32,
    flow: FlowControl,
    ack_pending: AckPending,
    delivered: u64,
    dropped: u64,
}

impl ServiceClient {
    pub fn new(settings: ServiceSettings) -> Self {
        let backoff = settings.backoff_initial;
        Self {
            settings,
            conn: None,
            inbuf: BytesMut::with_capacity(8192),
            outbound: VecDeque::new(),
            write_offset: 0,
            incoming_in_flight: 0,
            backoff,
            reconnect_at: Instant::now(),
            addresses: Vec::new(),
            next_aid: 0,
            queues: Vec::new(),
            next_qid: 0,
            flow: FlowControl::new(),
            ack_pending: AckPending::new(),
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Drive the connection until the next event for the driver.
    ///
    /// Reconnects, announcement replay, flow acks, and write flushing all
    /// happen internally; only work the driver must act on is returned.
    pub async fn drive(&mut self) -> ServiceEvent {
        loop {
            if self.conn.is_none() {
                tokio::time::sleep_until(self.reconnect_at).await;
                match UnixStream::connect(&self.settings.socket_path).await {
                    Ok(stream) => {
                        info!(
                            "connected to transport service at {:?}",
                            self.settings.socket_path
                        );
                        self.conn = Some(stream);
                        self.backoff = self.settings.backoff_initial;
                        self.announce_all();
                        return ServiceEvent::Connected;
                    }
                    Err(e) => {
                        debug!(
                            "service connect to {:?} failed: {e}",
                            self.settings.socket_path
                        );
                        self.schedule_reconnect();
                        continue;
                    }
                }
            }

            // Surface anything already buffered before touching the socket.
            match self.next_buffered_event() {
                Ok(Some(event)) => return event,
                Ok(None) => {}
                Err(violation) => {
                    warn!("protocol violation from service: {violation}");
                    self.disconnect();
                    continue;
                }
            }

            let want_write = !self.outbound.is_empty();
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            let stream = self.conn.as_mut().expect("connected above");
            let ready = match stream.ready(interest).await {
                Ok(ready) => ready,
                Err(e) => {
                    warn!("service connection error: {e}");
                    self.disconnect();
                    continue;
                }
            };

            if ready.is_readable() {
                match stream.try_read_buf(&mut self.inbuf) {
                    Ok(0) => {
                        warn!("service closed the connection");
                        self.disconnect();
                        continue;
                    }
                    Ok(n) => trace!("read {n} bytes from service"),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        warn!("service read error: {e}");
                        self.disconnect();
                        continue;
                    }
                }
            }

            if ready.is_writable() && !self.outbound.is_empty() {
                if let Err(e) = self.flush_ready() {
                    warn!("service write error: {e}");
                    self.disconnect();
                    continue;
                }
            }
        }
    }

    /// Parse buffered envelopes; internal messages (flow acks) are consumed
    /// here, everything else becomes an event.
    fn next_buffered_event(&mut self) -> Result<Option<ServiceEvent>, ProtocolError> {
        while let Some(envelope) = split_envelope(&mut self.inbuf)? {
            match decode_control(&envelope)? {
                ControlIn::IncomingMsgAck { fc_id, sender } => {
                    self.flow.ack(&sender, fc_id).map_err(|()| {
                        ProtocolError::UnknownFlowId {
                            sender: sender.short(),
                            fc_id,
                        }
                    })?;
                    trace!("flow ack {fc_id} from {}", sender.short());
                }
                ControlIn::QueueCreate { request_id, peer, address } => {
                    return Ok(Some(ServiceEvent::QueueCreate { request_id, peer, address }));
                }
                ControlIn::SendMsg { queue_id, mid, receiver, payload } => {
                    self.ack_pending.push(receiver, mid);
                    return Ok(Some(ServiceEvent::SendMsg { queue_id, mid, receiver, payload }));
                }
                ControlIn::BackchannelIncoming { pid, payload } => {
                    return Ok(Some(ServiceEvent::BackchannelIncoming { pid, payload }));
                }
            }
        }
        Ok(None)
    }

    /// Write as much of the outbound queue as the socket accepts right now.
    fn flush_ready(&mut self) -> std::io::Result<()> {
        let stream = match self.conn.as_mut() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        while let Some(front) = self.outbound.front() {
            match stream.try_write(&front.bytes[self.write_offset..]) {
                Ok(n) => {
                    self.write_offset += n;
                    if self.write_offset >= front.bytes.len() {
                        let sent = self.outbound.pop_front().expect("front exists");
                        if sent.is_incoming_msg {
                            self.incoming_in_flight -= 1;
                        }
                        self.write_offset = 0;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.conn = None;
        self.inbuf.clear();
        self.outbound.clear();
        self.write_offset = 0;
        self.incoming_in_flight = 0;
        // Outstanding correlation state is meaningless on a new connection.
        self.flow.purge();
        self.ack_pending.purge();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect_at = Instant::now() + self.backoff;
        debug!("service reconnect in {:?}", self.backoff);
        self.backoff = (self.backoff * 2).min(self.settings.backoff_max);
    }

    /// Replay NEW_COMMUNICATOR, all addresses, all queues after a connect.
    fn announce_all(&mut self) {
        self.enqueue(
            ControlOut::NewCommunicator {
                characteristics: self.settings.characteristics,
                prefix: self.settings.prefix.clone(),
            }
            .encode(),
            false,
        );
        let expiration_us = self.address_expiration_us();
        for entry in self.addresses.clone() {
            self.enqueue(
                ControlOut::AddAddress {
                    aid: entry.aid,
                    network_type: entry.network_type,
                    expiration_us,
                    address: entry.address,
                }
                .encode(),
                false,
            );
        }
        for queue in self.queues.clone() {
            self.enqueue(
                ControlOut::QueueSetup {
                    queue_id: queue.qid,
                    peer: queue.peer,
                    network_type: queue.network_type,
                    mtu: queue.mtu,
                    qlen: queue.qlen,
                    priority: queue.priority,
                    connection_status: queue.connection_status,
                    address: queue.address,
                }
                .encode(),
                false,
            );
        }
    }

    fn address_expiration_us(&self) -> u64 {
        let until = SystemTime::now() + self.settings.address_validity;
        until
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn enqueue(&mut self, bytes: Vec<u8>, is_incoming_msg: bool) {
        if self.conn.is_none() {
            return;
        }
        if is_incoming_msg {
            self.incoming_in_flight += 1;
        }
        self.outbound.push_back(OutEnvelope { bytes, is_incoming_msg });
    }

    /// Offer an address. Announced now and after every reconnect, withdrawn
    /// only by [`del_address`](Self::del_address).
    pub fn add_address(&mut self, address: &str, network_type: u32) -> u32 {
        let aid = self.next_aid;
        self.next_aid += 1;
        self.addresses.push(AddressEntry {
            aid,
            address: address.to_string(),
            network_type,
        });
        let expiration_us = self.address_expiration_us();
        self.enqueue(
            ControlOut::AddAddress {
                aid,
                network_type,
                expiration_us,
                address: address.to_string(),
            }
            .encode(),
            false,
        );
        aid
    }

    pub fn del_address(&mut self, aid: u32) {
        self.addresses.retain(|a| a.aid != aid);
        self.enqueue(ControlOut::DelAddress { aid }.encode(), false);
    }

    /// Announce a live queue; returns its qid.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_setup(
        &mut self,
        peer: PeerId,
        address: &str,
        network_type: u32,
        mtu: u32,
        qlen: u64,
        priority: u32,
        connection_status: u32,
    ) -> u32 {
        let qid = self.next_qid;
        self.next_qid += 1;
        self.queues.push(QueueRecord {
            qid,
            peer,
            address: address.to_string(),
            network_type,
            mtu,
            qlen,
            priority,
            connection_status,
        });
        self.enqueue(
            ControlOut::QueueSetup {
                queue_id: qid,
                peer,
                network_type,
                mtu,
                qlen,
                priority,
                connection_status,
                address: address.to_string(),
            }
            .encode(),
            false,
        );
        qid
    }

    /// Update the mutable attributes of an announced queue.
    pub fn queue_update(&mut self, qid: u32, qlen: u64, priority: u32, connection_status: u32) {
        let Some(queue) = self.queues.iter_mut().find(|q| q.qid == qid) else {
            return;
        };
        queue.qlen = qlen;
        queue.priority = priority;
        queue.connection_status = connection_status;
        let update = ControlOut::QueueUpdate {
            queue_id: qid,
            peer: queue.peer,
            network_type: queue.network_type,
            mtu: queue.mtu,
            qlen,
            priority,
            connection_status,
        };
        self.enqueue(update.encode(), false);
    }

    pub fn queue_teardown(&mut self, qid: u32) {
        let Some(idx) = self.queues.iter().position(|q| q.qid == qid) else {
            return;
        };
        let queue = self.queues.swap_remove(idx);
        self.enqueue(
            ControlOut::QueueTeardown { queue_id: qid, peer: queue.peer }.encode(),
            false,
        );
    }

    /// Deliver one received message to the service.
    ///
    /// With a `notify` hook the delivery is flow-controlled: an id is
    /// allocated and the hook fires when the matching `INCOMING_MSG_ACK`
    /// arrives (or with `ok == false` on disconnect). Without a hook the
    /// delivery is subject to the soft-drop backpressure cap.
    pub fn deliver(
        &mut self,
        sender: PeerId,
        body: Vec<u8>,
        notify: Option<&FlowNotify>,
    ) -> DeliveryVerdict {
        if self.conn.is_none() {
            self.dropped += 1;
            return DeliveryVerdict::Dropped;
        }
        if notify.is_none() && self.incoming_in_flight >= self.settings.max_queue_length {
            self.dropped += 1;
            return DeliveryVerdict::SoftDrop;
        }
        let (fc_on, fc_id) = match notify {
            Some(hook) => (true, self.flow.allocate(sender, hook.clone())),
            None => (false, 0),
        };
        self.enqueue(
            ControlOut::IncomingMsg {
                sender,
                expected_addr_validity_us: self.settings.address_validity.as_micros() as u64,
                fc_on,
                fc_id,
                body,
            }
            .encode(),
            true,
        );
        self.delivered += 1;
        DeliveryVerdict::Accepted
    }

    /// Report the egress result of a service-originated send.
    ///
    /// A no-op when the entry was purged by a reconnect; the fresh
    /// connection never saw the SEND_MSG, so an ack would be noise.
    pub fn send_msg_ack(&mut self, ok: bool, mid: u64, receiver: PeerId) {
        if !self.ack_pending.remove(&receiver, mid) {
            return;
        }
        self.enqueue(ControlOut::SendMsgAck { ok, mid, receiver }.encode(), false);
    }

    /// Reply to a QUEUE_CREATE request.
    pub fn queue_create_reply(&mut self, ok: bool, request_id: u32, peer: PeerId) {
        let reply = if ok {
            ControlOut::QueueCreateOk { request_id, peer }
        } else {
            ControlOut::QueueCreateFail { request_id, peer }
        };
        self.enqueue(reply.encode(), false);
    }

    /// Ask the service to relay a backchannel payload.
    pub fn backchannel(&mut self, pid: PeerId, body: Vec<u8>, target: &str) {
        self.enqueue(
            ControlOut::Backchannel { pid, body, target: target.to_string() }.encode(),
            false,
        );
    }

    /// Number of queued-but-unwritten envelopes (tests, introspection).
    pub fn pending_envelopes(&self) -> usize {
        self.outbound.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn queue_record(&self, qid: u32) -> Option<&QueueRecord> {
        self.queues.iter().find(|q| q.qid == qid)
    }

    /// Fail all outstanding correlation state and drop the connection.
    ///
    /// Part of communicator shutdown: completions fire before the sockets
    /// close.
    pub fn shutdown(&mut self) {
        self.flow.purge();
        self.ack_pending.purge();
        self.outbound.clear();
        self.incoming_in_flight = 0;
        self.conn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 32])
    }

    fn settings(path: &std::path::Path, max_queue: usize) -> ServiceSettings {
        let mut s = ServiceSettings::new(path.to_path_buf(), "unix", crate::protocol::CC_RELIABLE);
        s.max_queue_length = max_queue;
        s.backoff_initial = Duration::from_millis(10);
        s.backoff_max = Duration::from_millis(50);
        s
    }

    #[tokio::test]
    async fn soft_drop_applies_to_third_callbackless_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 2));
        match client.drive().await {
            ServiceEvent::Connected => {}
            other => panic!("expected Connected, got {other:?}"),
        }

        let body = crate::frame::box_message(1, b"m").unwrap();
        assert_eq!(
            client.deliver(peer(1), body.clone(), None),
            DeliveryVerdict::Accepted
        );
        assert_eq!(
            client.deliver(peer(1), body.clone(), None),
            DeliveryVerdict::Accepted
        );
        assert_eq!(
            client.deliver(peer(1), body, None),
            DeliveryVerdict::SoftDrop
        );
        assert_eq!(client.dropped(), 1);
    }

    #[tokio::test]
    async fn flow_controlled_delivery_bypasses_soft_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 1));
        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };

        let (tx, _rx) = mpsc::unbounded_channel();
        for _ in 0..4 {
            let body = crate::frame::box_message(1, b"m").unwrap();
            assert_eq!(
                client.deliver(peer(1), body, Some(&tx)),
                DeliveryVerdict::Accepted
            );
        }
    }

    #[tokio::test]
    async fn delivery_without_connection_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let mut client = ServiceClient::new(settings(&path, 16));
        let body = crate::frame::box_message(1, b"m").unwrap();
        assert_eq!(client.deliver(peer(1), body, None), DeliveryVerdict::Dropped);
    }

    #[tokio::test]
    async fn announcements_flush_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 16));
        client.add_address("unix-/tmp/me.sock", crate::protocol::NT_LOOPBACK);

        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };

        let (mut server_side, _) = listener.accept().await.unwrap();
        // Drive until both announcements are on the wire; the read side
        // collects them concurrently.
        // NEW_COMMUNICATOR is 13 bytes (header, characteristics, "unix\0");
        // read far enough to see the following envelope's header too.
        let reader = tokio::spawn(async move {
            let mut collected = Vec::new();
            let mut buf = [0u8; 1024];
            while collected.len() < 13 + 4 {
                let n = server_side.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..n]);
            }
            collected
        });
        // drive() blocks on the next event; give it a bounded slice to flush.
        let _ = tokio::time::timeout(Duration::from_millis(200), client.drive()).await;

        let bytes = reader.await.unwrap();
        // First envelope: NEW_COMMUNICATOR.
        assert_eq!(
            u16::from_be_bytes([bytes[2], bytes[3]]),
            crate::protocol::MT_NEW_COMMUNICATOR
        );
        let first_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        // Second envelope: the address announcement.
        assert_eq!(
            u16::from_be_bytes([bytes[first_len + 2], bytes[first_len + 3]]),
            crate::protocol::MT_ADD_ADDRESS
        );
    }

    #[tokio::test]
    async fn del_address_withdraws_from_replay_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 16));
        let aid_a = client.add_address("unix-/tmp/a.sock", crate::protocol::NT_LOOPBACK);
        let aid_b = client.add_address("unix-/tmp/b.sock", crate::protocol::NT_LOOPBACK);
        assert_ne!(aid_a, aid_b);

        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };
        let before = client.pending_envelopes();
        client.del_address(aid_a);
        assert_eq!(client.pending_envelopes(), before + 1);
        assert_eq!(client.addresses.len(), 1);
        assert_eq!(client.addresses[0].aid, aid_b);
    }

    #[tokio::test]
    async fn reconnect_reannounces_with_same_aid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 16));
        let aid = client.add_address("unix-/tmp/me.sock", crate::protocol::NT_LOOPBACK);
        assert_eq!(aid, 0);

        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };
        let (first_conn, _) = listener.accept().await.unwrap();

        // Kill the service side; the client must reconnect and replay.
        drop(first_conn);
        let reconnected = tokio::time::timeout(Duration::from_secs(2), client.drive()).await;
        assert!(
            matches!(reconnected, Ok(ServiceEvent::Connected)),
            "client should reconnect after service loss"
        );

        // The replayed announcement set keeps the original aid.
        assert_eq!(client.addresses[0].aid, aid);
        assert!(client
            .outbound
            .iter()
            .any(|env| u16::from_be_bytes([env.bytes[2], env.bytes[3]])
                == crate::protocol::MT_ADD_ADDRESS));
    }

    #[tokio::test]
    async fn unknown_flow_ack_forces_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 16));
        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };
        let (server_side, _) = listener.accept().await.unwrap();

        // Ack an fc id that was never allocated.
        let mut env = Vec::new();
        env.extend_from_slice(&44u16.to_be_bytes());
        env.extend_from_slice(&crate::protocol::MT_INCOMING_MSG_ACK.to_be_bytes());
        env.extend_from_slice(&77u64.to_be_bytes());
        env.extend_from_slice(peer(1).as_bytes());
        server_side.writable().await.unwrap();
        server_side.try_write(&env).unwrap();

        // The client must survive, drop the connection, and come back.
        let next = tokio::time::timeout(Duration::from_secs(2), client.drive()).await;
        assert!(matches!(next, Ok(ServiceEvent::Connected)));
    }

    #[tokio::test]
    async fn send_msg_event_tracks_ack_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let mut client = ServiceClient::new(settings(&path, 16));
        let ServiceEvent::Connected = client.drive().await else {
            panic!("expected Connected");
        };
        let (server_side, _) = listener.accept().await.unwrap();

        let payload = crate::frame::box_message(5, b"pay").unwrap();
        let body_len = 4 + 8 + 32 + payload.len();
        let mut env = Vec::new();
        env.extend_from_slice(&((4 + body_len) as u16).to_be_bytes());
        env.extend_from_slice(&crate::protocol::MT_SEND_MSG.to_be_bytes());
        env.extend_from_slice(&2u32.to_be_bytes());
        env.extend_from_slice(&41u64.to_be_bytes());
        env.extend_from_slice(peer(6).as_bytes());
        env.extend_from_slice(&payload);
        server_side.writable().await.unwrap();
        server_side.try_write(&env).unwrap();

        match tokio::time::timeout(Duration::from_secs(1), client.drive()).await {
            Ok(ServiceEvent::SendMsg { queue_id, mid, receiver, payload }) => {
                assert_eq!(queue_id, 2);
                assert_eq!(mid, 41);
                assert_eq!(receiver, peer(6));
                assert_eq!(&payload[4..], b"pay");
            }
            other => panic!("expected SendMsg, got {other:?}"),
        }
        assert_eq!(client.ack_pending.len(), 1);

        client.send_msg_ack(true, 41, peer(6));
        assert!(client.ack_pending.is_empty());
        // Duplicate ack is swallowed.
        let before = client.pending_envelopes();
        client.send_msg_ack(true, 41, peer(6));
        assert_eq!(client.pending_envelopes(), before);
    }
}
