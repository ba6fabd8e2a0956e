// Client-side session task.
//
// Mirrors the server task's shape: one select loop owns the session state,
// the seq/ack buffer, heartbeats, and the grace deadline. The differences
// are direction: this side initiates the handshake, initiates streams, and
// routes inbound messages to local readers instead of dispatching handlers.
//
// The task outlives any single session. When a session dies (grace expiry,
// handshake rejection, invariant violation) it reverts to NoConnection and
// mints fresh ids on the next activity.

use std::collections::HashMap;
use std::sync::Arc;

use river_protocol::{
    ControlFlags, ErrorPayload, HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION,
    ResultPayload, TransportMessage, WireFrame, error_codes,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Readable, ReadableFeed, StreamOut, Writable, WritableControl, readable_pair, writable_pair};
use crate::client::ClientShared;
use crate::events::{ProtocolErrorKind, RiverEvent, SessionStateKind};
use crate::registry::ProcedureKind;
use crate::session::{RecvClass, SessionCore, TombstoneSet};
use crate::transport::{TransportEvent, TransportEvents};

/// Commands from the invocation surface to the session task.
pub(crate) enum ClientCommand {
    Open {
        service: String,
        procedure: String,
        init: Value,
        kind: ProcedureKind,
        reply: oneshot::Sender<OpenedStream>,
    },
    Shutdown,
}

/// Handles returned for a freshly opened stream.
pub(crate) struct OpenedStream {
    pub stream_id: String,
    pub readable: Readable,
    pub writable: Option<Writable>,
    pub out: mpsc::UnboundedSender<StreamOut>,
}

struct ClientStream {
    feed: ReadableFeed,
    writable: Option<WritableControl>,
    client_half_closed: bool,
    server_half_closed: bool,
}

pub(crate) struct ClientSessionTask {
    shared: Arc<ClientShared>,
    core: Option<SessionCore>,
    state: SessionStateKind,
    link_up: bool,
    started: bool,
    streams: HashMap<String, ClientStream>,
    tombstones: TombstoneSet,
    stream_out_tx: mpsc::UnboundedSender<StreamOut>,
    missed_beats: u32,
    inbound_since_beat: bool,
    grace_deadline: Option<tokio::time::Instant>,
}

pub(crate) async fn run(
    shared: Arc<ClientShared>,
    mut events: TransportEvents,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
) {
    let (stream_out_tx, mut stream_out_rx) = mpsc::unbounded_channel();
    let tombstone_cap = shared.config.max_aborted_stream_tombstones_per_session;
    let eager = shared.eagerly_connect;
    let mut task = ClientSessionTask {
        shared,
        core: None,
        state: SessionStateKind::NoConnection,
        link_up: false,
        started: eager,
        streams: HashMap::new(),
        tombstones: TombstoneSet::new(tombstone_cap),
        stream_out_tx,
        missed_beats: 0,
        inbound_since_beat: false,
        grace_deadline: None,
    };

    let mut heartbeat = tokio::time::interval(task.shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.tick().await;

    loop {
        let grace = task.grace_deadline;
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => task.on_transport_event(event).await,
                    None => {
                        task.destroy_session("transport gone");
                        break;
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ClientCommand::Open { service, procedure, init, kind, reply }) => {
                        task.on_open(&service, &procedure, init, kind, reply).await;
                    }
                    Some(ClientCommand::Shutdown) | None => {
                        task.destroy_session("client closed");
                        task.shared.transport.close(&task.shared.server_id).await;
                        break;
                    }
                }
            }
            Some(out) = stream_out_rx.recv() => {
                task.on_stream_out(out).await;
            }
            _ = heartbeat.tick(), if task.state == SessionStateKind::Connected && task.link_up => {
                task.on_heartbeat_tick().await;
            }
            () = tokio::time::sleep_until(grace.unwrap_or_else(tokio::time::Instant::now)),
                if grace.is_some() =>
            {
                info!("grace period expired");
                task.destroy_session("grace period expired");
            }
        }
    }
}

impl ClientSessionTask {
    fn publish_transition(&self, session_id: &str, state: SessionStateKind) {
        self.shared.events.publish(RiverEvent::SessionTransition {
            session_id: session_id.to_owned(),
            state,
        });
    }

    fn publish_protocol_error(&self, kind: ProtocolErrorKind, message: &str) {
        self.shared.events.publish(RiverEvent::ProtocolError {
            kind,
            message: message.to_owned(),
        });
    }

    // -- transport events --

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { peer } => {
                if peer != self.shared.server_id {
                    return;
                }
                self.link_up = true;
                if self.started {
                    self.start_handshake().await;
                }
            }
            TransportEvent::Disconnected { peer } => {
                if peer != self.shared.server_id {
                    return;
                }
                self.link_up = false;
                match self.state {
                    SessionStateKind::Connected | SessionStateKind::Handshaking
                        if self.core.is_some() =>
                    {
                        self.enter_pending_reconnect();
                    }
                    SessionStateKind::Handshaking => {
                        self.state = SessionStateKind::NoConnection;
                    }
                    _ => {}
                }
            }
            TransportEvent::Frame { peer, bytes } => {
                if peer != self.shared.server_id {
                    return;
                }
                match self.shared.codec.decode(&bytes) {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(e) => {
                        self.publish_protocol_error(
                            ProtocolErrorKind::InvariantViolation,
                            &format!("undecodable frame: {e}"),
                        );
                    }
                }
            }
        }
    }

    fn enter_pending_reconnect(&mut self) {
        self.state = SessionStateKind::PendingReconnect;
        self.grace_deadline =
            Some(tokio::time::Instant::now() + self.shared.config.grace_period);
        if let Some(core) = &self.core {
            info!(session_id = %core.local_id, "session pending reconnect");
            self.publish_transition(&core.local_id.clone(), SessionStateKind::PendingReconnect);
        }
    }

    // -- handshake --

    async fn start_handshake(&mut self) {
        if self.state == SessionStateKind::Connected
            || self.state == SessionStateKind::Handshaking
        {
            return;
        }
        if self.core.is_none() {
            self.core = Some(SessionCore::new());
        }
        let core = self.core.as_ref().expect("core just ensured");
        let metadata = match &self.shared.metadata_construct {
            Some(construct) => construct(),
            None => Value::Null,
        };
        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            session_id: core.local_id.clone(),
            expected_session_id: core.remote_id.clone(),
            metadata,
        };
        let local_id = core.local_id.clone();
        let had_session = core.remote_id.is_some();

        match self.shared.codec.encode(&WireFrame::HandshakeRequest(request)) {
            Ok(bytes) => {
                self.state = SessionStateKind::Handshaking;
                self.publish_transition(&local_id, SessionStateKind::Handshaking);
                if let Err(e) = self
                    .shared
                    .transport
                    .send(&self.shared.server_id, bytes)
                    .await
                {
                    debug!(error = %e, "handshake send failed");
                }
            }
            Err(e) => {
                // Torn down without session establishment; a fresh attempt
                // mints fresh ids unless an established session is mid-resume.
                self.publish_protocol_error(
                    ProtocolErrorKind::MessageSendFailure,
                    &format!("handshake encode failed: {e}"),
                );
                if !had_session {
                    self.core = None;
                }
                self.shared.transport.close(&self.shared.server_id).await;
            }
        }
    }

    async fn on_handshake_response(&mut self, resp: HandshakeResponse) {
        if self.state != SessionStateKind::Handshaking
            && self.state != SessionStateKind::PendingReconnect
        {
            return;
        }
        let Some(core) = self.core.as_mut() else {
            return;
        };

        let Some(new_remote) = (if resp.ok { resp.session_id.clone() } else { None }) else {
            let reason = resp
                .code
                .unwrap_or_else(|| error_codes::HANDSHAKE_FAILED.to_owned());
            warn!(code = %reason, "handshake rejected by server");
            self.publish_protocol_error(ProtocolErrorKind::HandshakeFailed, &reason);
            self.destroy_session("handshake rejected");
            return;
        };

        if let Some(old_remote) = core.remote_id.clone() {
            if old_remote != new_remote {
                // The server refused to resume and minted a fresh session.
                // Everything buffered or open belonged to the dead one.
                let local_id = core.local_id.clone();
                self.abort_all_streams("session not resumed");
                let mut fresh = SessionCore::new();
                fresh.local_id = local_id;
                fresh.remote_id = Some(new_remote);
                self.core = Some(fresh);
                self.finish_connect().await;
                return;
            }
        }
        core.remote_id = Some(new_remote);
        self.finish_connect().await;
    }

    async fn finish_connect(&mut self) {
        let (local_id, replay) = match self.core.as_ref() {
            Some(core) => (core.local_id.clone(), core.replay_messages()),
            None => return,
        };
        self.state = SessionStateKind::Connected;
        self.grace_deadline = None;
        self.missed_beats = 0;
        self.inbound_since_beat = true;
        info!(session_id = %local_id, "session connected");
        self.publish_transition(&local_id, SessionStateKind::Connected);
        // Replay everything unacked, in seq order, before any new sends.
        if !replay.is_empty() {
            debug!(count = replay.len(), "replaying unacked messages");
        }
        for msg in replay {
            self.encode_and_send(msg).await;
        }
    }

    // -- inbound frames --

    async fn on_frame(&mut self, frame: WireFrame) {
        match frame {
            WireFrame::HandshakeResponse(resp) => self.on_handshake_response(resp).await,
            WireFrame::HandshakeRequest(_) => {
                warn!("unexpected handshake request on client side");
            }
            WireFrame::Message(msg) => self.on_message(msg).await,
        }
    }

    async fn on_message(&mut self, msg: TransportMessage) {
        if self.state != SessionStateKind::Connected {
            debug!("dropping message outside connected state");
            return;
        }
        self.inbound_since_beat = true;

        {
            let Some(core) = self.core.as_mut() else { return };
            if let Err(reason) = core.apply_ack(msg.ack) {
                self.invariant_violation(&reason).await;
                return;
            }
        }
        if msg.control_flags.is_ack_only() {
            return;
        }
        let class = match self.core.as_mut() {
            Some(core) => core.classify_recv(msg.seq),
            None => return,
        };
        match class {
            RecvClass::Duplicate => return,
            RecvClass::Gap => {
                self.invariant_violation(&format!("seq {} skips past contiguous tail", msg.seq))
                    .await;
                return;
            }
            RecvClass::Fresh => {}
        }

        self.shared.events.publish(RiverEvent::MessageReceived {
            from: msg.from.clone(),
            stream_id: msg.stream_id.clone(),
        });

        if self.tombstones.contains(&msg.stream_id) {
            return;
        }

        if msg.control_flags.is_stream_cancel() {
            let error = serde_json::from_value::<ResultPayload>(msg.payload.clone())
                .map(ResultPayload::into_result)
                .ok()
                .and_then(Result::err)
                .unwrap_or_else(|| {
                    ErrorPayload::new(error_codes::CANCEL, "stream cancelled by peer")
                });
            if let Some(mut stream) = self.streams.remove(&msg.stream_id) {
                poison_stream(&mut stream, &error);
            }
            self.tombstones.insert(&msg.stream_id);
            return;
        }

        let Some(stream) = self.streams.get_mut(&msg.stream_id) else {
            debug!(stream_id = %msg.stream_id, "dropping message for unknown stream");
            return;
        };

        let closes = msg.control_flags.is_stream_closed();
        if !(msg.payload.is_null() && closes) {
            match serde_json::from_value::<ResultPayload>(msg.payload) {
                Ok(result) => match result.into_result() {
                    Ok(value) => stream.feed.push(value),
                    Err(error) => {
                        stream.feed.error(error);
                        stream.server_half_closed = true;
                    }
                },
                Err(e) => {
                    debug!(stream_id = %msg.stream_id, error = %e, "malformed result payload");
                }
            }
        }
        if closes {
            stream.server_half_closed = true;
            stream.feed.close();
        }
        if stream.client_half_closed && stream.server_half_closed {
            self.streams.remove(&msg.stream_id);
        }
    }

    // -- local operations --

    async fn on_open(
        &mut self,
        service: &str,
        procedure: &str,
        init: Value,
        kind: ProcedureKind,
        reply: oneshot::Sender<OpenedStream>,
    ) {
        self.started = true;
        if self.core.is_none() {
            self.core = Some(SessionCore::new());
        }

        let stream_id = Uuid::new_v4().to_string();
        let (feed, readable) = readable_pair();
        let (writable, writable_ctrl) = if kind.client_can_send() {
            let (writable, ctrl) = writable_pair(&stream_id, self.stream_out_tx.clone());
            (Some(writable), Some(ctrl))
        } else {
            (None, None)
        };

        self.streams.insert(
            stream_id.clone(),
            ClientStream {
                feed,
                writable: writable_ctrl,
                client_half_closed: !kind.client_can_send(),
                server_half_closed: false,
            },
        );

        let mut flags = ControlFlags::STREAM_OPEN;
        if !kind.client_can_send() {
            flags = flags | ControlFlags::STREAM_CLOSED;
        }
        let mut msg = TransportMessage::new(
            &self.shared.client_id,
            &self.shared.server_id,
            &stream_id,
            flags,
            init,
        );
        msg.service_name = Some(service.to_owned());
        msg.procedure_name = Some(procedure.to_owned());
        debug!(stream_id = %stream_id, service, procedure, kind = kind.as_str(), "opening stream");
        self.send_sequenced(&mut msg).await;

        let _ = reply.send(OpenedStream {
            stream_id,
            readable,
            writable,
            out: self.stream_out_tx.clone(),
        });

        if self.link_up
            && self.state != SessionStateKind::Connected
            && self.state != SessionStateKind::Handshaking
        {
            self.start_handshake().await;
        }
    }

    async fn on_stream_out(&mut self, out: StreamOut) {
        match out {
            StreamOut::Data { stream_id, value } => {
                let live = self
                    .streams
                    .get(&stream_id)
                    .is_some_and(|s| !s.client_half_closed);
                if !live {
                    return;
                }
                let mut msg = TransportMessage::new(
                    &self.shared.client_id,
                    &self.shared.server_id,
                    &stream_id,
                    ControlFlags::NONE,
                    value,
                );
                self.send_sequenced(&mut msg).await;
            }
            StreamOut::Close { stream_id } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if stream.client_half_closed {
                    return;
                }
                stream.client_half_closed = true;
                let complete = stream.server_half_closed;
                let mut msg = TransportMessage::new(
                    &self.shared.client_id,
                    &self.shared.server_id,
                    &stream_id,
                    ControlFlags::STREAM_CLOSED,
                    Value::Null,
                );
                self.send_sequenced(&mut msg).await;
                if complete {
                    self.streams.remove(&stream_id);
                }
            }
            StreamOut::Cancel { stream_id, error } => {
                if self.tombstones.contains(&stream_id) {
                    return;
                }
                let Some(mut stream) = self.streams.remove(&stream_id) else {
                    return;
                };
                poison_stream(&mut stream, &error);
                self.tombstones.insert(&stream_id);
                let mut msg = TransportMessage::new(
                    &self.shared.client_id,
                    &self.shared.server_id,
                    &stream_id,
                    ControlFlags::STREAM_CANCEL,
                    serde_json::to_value(ResultPayload::err(&error)).unwrap_or(Value::Null),
                );
                self.send_sequenced(&mut msg).await;
            }
            StreamOut::Result { stream_id, .. } => {
                debug!(stream_id = %stream_id, "unexpected result on client side");
            }
        }
    }

    // -- outbound plumbing --

    async fn send_sequenced(&mut self, msg: &mut TransportMessage) {
        let Some(core) = self.core.as_mut() else {
            return;
        };
        core.stamp_and_buffer(msg);
        if self.state == SessionStateKind::Connected && self.link_up {
            self.encode_and_send(msg.clone()).await;
        }
    }

    async fn encode_and_send(&self, msg: TransportMessage) {
        match self.shared.codec.encode(&WireFrame::Message(msg)) {
            Ok(bytes) => {
                if let Err(e) = self
                    .shared
                    .transport
                    .send(&self.shared.server_id, bytes)
                    .await
                {
                    debug!(error = %e, "transport send failed");
                }
            }
            Err(e) => {
                self.publish_protocol_error(
                    ProtocolErrorKind::MessageSendFailure,
                    &format!("encode failed: {e}"),
                );
            }
        }
    }

    async fn on_heartbeat_tick(&mut self) {
        if self.inbound_since_beat {
            self.missed_beats = 0;
        } else {
            self.missed_beats += 1;
        }
        self.inbound_since_beat = false;

        if self.missed_beats >= self.shared.config.heartbeats_until_dead {
            warn!("missed heartbeats, presuming connection dead");
            self.shared.transport.close(&self.shared.server_id).await;
            if self.state == SessionStateKind::Connected {
                self.enter_pending_reconnect();
            }
            return;
        }

        let Some(core) = self.core.as_mut() else {
            return;
        };
        let mut hb = TransportMessage::ack_only(&self.shared.client_id, &self.shared.server_id);
        core.stamp_ack_only(&mut hb);
        self.encode_and_send(hb).await;
    }

    async fn invariant_violation(&mut self, reason: &str) {
        warn!(reason, "protocol invariant violated");
        self.publish_protocol_error(ProtocolErrorKind::InvariantViolation, reason);
        self.destroy_session("protocol invariant violated");
        self.shared.transport.close(&self.shared.server_id).await;
    }

    fn abort_all_streams(&mut self, reason: &str) {
        let error = ErrorPayload::new(error_codes::UNEXPECTED_DISCONNECT, reason);
        for (_, mut stream) in self.streams.drain() {
            poison_stream(&mut stream, &error);
        }
    }

    /// Tear the current session down and revert to a clean slate. The task
    /// keeps running; the next activity establishes a fresh session with
    /// fresh ids.
    fn destroy_session(&mut self, reason: &str) {
        self.abort_all_streams(reason);
        if let Some(core) = &self.core {
            info!(session_id = %core.local_id, reason, "session destroyed");
            self.publish_transition(&core.local_id.clone(), SessionStateKind::Closed);
        }
        self.core = None;
        self.grace_deadline = None;
        self.tombstones =
            TombstoneSet::new(self.shared.config.max_aborted_stream_tombstones_per_session);
        self.state = SessionStateKind::NoConnection;
    }
}

fn poison_stream(stream: &mut ClientStream, error: &ErrorPayload) {
    stream.feed.error(error.clone());
    if let Some(ctrl) = &stream.writable {
        ctrl.abort();
    }
}
