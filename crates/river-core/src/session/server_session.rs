// Server-side per-peer session task.
//
// One task owns all state for a peer: handshake, heartbeats, the seq/ack
// send buffer, the grace deadline, and every stream the peer has open.
// Inputs arrive on an mpsc from the accept loop; handler output funnels
// back through the StreamOut channel. All transitions happen on this task,
// so no suspension point can observe a half-applied state change.

use std::collections::HashMap;
use std::sync::Arc;

use river_protocol::{
    ControlFlags, ErrorPayload, HandshakeRequest, HandshakeResponse, PROTOCOL_VERSION,
    ResultPayload, TransportMessage, WireFrame, error_codes,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ReadableFeed, StreamOut, WritableControl, readable_pair, writable_pair};
use crate::context::{CancelToken, Ctx};
use crate::events::{ProtocolErrorKind, RiverEvent, SessionStateKind};
use crate::registry::{ProcedureHandler, ProcedureKind, ServiceRegistry};
use crate::schema::Schema;
use crate::server::ServerShared;
use crate::session::{RecvClass, SessionConfig, SessionCore, TombstoneSet};

/// Inputs routed from the accept loop to a peer's session task.
#[derive(Debug)]
pub(crate) enum SessionInput {
    Connected,
    Disconnected,
    Frame(WireFrame),
    Shutdown,
}

/// rpc/upload produce a single final result; subscription/stream run until
/// the handler returns, closing the writable themselves.
enum HandlerOutcome {
    Final(Result<Value, ErrorPayload>),
    Streaming(Result<(), ErrorPayload>),
}

struct ServerStream {
    kind: ProcedureKind,
    input_schema: Option<Schema>,
    feed: Option<ReadableFeed>,
    writable: Option<WritableControl>,
    token: CancelToken,
    client_half_closed: bool,
    server_half_closed: bool,
}

pub(crate) struct ServerSessionTask {
    shared: Arc<ServerShared>,
    peer: String,
    core: Option<SessionCore>,
    metadata: Value,
    state: SessionStateKind,
    link_up: bool,
    streams: HashMap<String, ServerStream>,
    tombstones: TombstoneSet,
    stream_out_tx: mpsc::UnboundedSender<StreamOut>,
    missed_beats: u32,
    inbound_since_beat: bool,
    grace_deadline: Option<tokio::time::Instant>,
}

pub(crate) async fn run(
    shared: Arc<ServerShared>,
    peer: String,
    mut input_rx: mpsc::UnboundedReceiver<SessionInput>,
    ended_tx: mpsc::UnboundedSender<String>,
) {
    let (stream_out_tx, mut stream_out_rx) = mpsc::unbounded_channel();
    let tombstone_cap = shared.config.max_aborted_stream_tombstones_per_session;
    let mut task = ServerSessionTask {
        shared,
        peer: peer.clone(),
        core: None,
        metadata: Value::Null,
        state: SessionStateKind::NoConnection,
        link_up: false,
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
            input = input_rx.recv() => {
                match input {
                    Some(SessionInput::Connected) => task.on_link_up(),
                    Some(SessionInput::Disconnected) => task.on_link_down(),
                    Some(SessionInput::Frame(frame)) => task.on_frame(frame).await,
                    Some(SessionInput::Shutdown) | None => {
                        task.destroy_session("server shut down");
                        task.shared.transport.close(&task.peer).await;
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
                info!(peer = %task.peer, "grace period expired");
                task.destroy_session("grace period expired");
            }
        }

        if task.state == SessionStateKind::Closed {
            break;
        }
    }

    let _ = ended_tx.send(peer);
}

impl ServerSessionTask {
    fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

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

    // -- link lifecycle --

    fn on_link_up(&mut self) {
        self.link_up = true;
        if self.state == SessionStateKind::NoConnection {
            self.state = SessionStateKind::Handshaking;
        }
        // A resuming session stays PendingReconnect until the handshake
        // completes; the grace deadline keeps running until then.
    }

    fn on_link_down(&mut self) {
        self.link_up = false;
        match self.state {
            SessionStateKind::Connected => self.enter_pending_reconnect(),
            SessionStateKind::Handshaking if self.core.is_none() => {
                self.state = SessionStateKind::NoConnection;
            }
            _ => {}
        }
    }

    fn enter_pending_reconnect(&mut self) {
        self.state = SessionStateKind::PendingReconnect;
        self.grace_deadline =
            Some(tokio::time::Instant::now() + self.config().grace_period);
        if let Some(core) = &self.core {
            info!(peer = %self.peer, session_id = %core.local_id, "session pending reconnect");
            self.publish_transition(&core.local_id.clone(), SessionStateKind::PendingReconnect);
        }
    }

    // -- frames --

    async fn on_frame(&mut self, frame: WireFrame) {
        match frame {
            WireFrame::HandshakeRequest(req) => self.on_handshake(req).await,
            WireFrame::HandshakeResponse(_) => {
                warn!(peer = %self.peer, "unexpected handshake response on server side");
            }
            WireFrame::Message(msg) => self.on_message(msg).await,
        }
    }

    async fn on_handshake(&mut self, req: HandshakeRequest) {
        // A handshake can only arrive over a live connection; the task may
        // have been created without seeing the Connected event.
        self.link_up = true;
        if req.protocol_version != PROTOCOL_VERSION {
            self.reject_handshake(&format!(
                "protocol version mismatch: got {}, want {}",
                req.protocol_version, PROTOCOL_VERSION
            ))
            .await;
            return;
        }
        if let Some(validate) = &self.shared.handshake_validate {
            if let Err(reason) = validate(&req.metadata) {
                self.reject_handshake(&format!("handshake metadata rejected: {reason}"))
                    .await;
                return;
            }
        }

        let resumes = match &self.core {
            Some(core) => {
                core.remote_id.as_deref() == Some(req.session_id.as_str())
                    && req.expected_session_id.as_deref() == Some(core.local_id.as_str())
            }
            None => false,
        };

        if !resumes {
            // A mismatched expectation forces a brand-new session; the old
            // one (if any) is destroyed first, streams and all.
            if self.core.is_some() {
                self.destroy_session("superseded by new handshake");
            }
            let mut core = SessionCore::new();
            core.remote_id = Some(req.session_id.clone());
            self.metadata = req.metadata.clone();
            self.tombstones =
                TombstoneSet::new(self.config().max_aborted_stream_tombstones_per_session);
            info!(
                peer = %self.peer,
                session_id = %core.local_id,
                remote_session_id = %req.session_id,
                "session established"
            );
            self.core = Some(core);
        }

        let local_id = self
            .core
            .as_ref()
            .map(|core| core.local_id.clone())
            .unwrap_or_default();
        let response = HandshakeResponse {
            ok: true,
            session_id: Some(local_id.clone()),
            code: None,
        };
        if !self.send_handshake_frame(WireFrame::HandshakeResponse(response)).await {
            return;
        }

        self.state = SessionStateKind::Connected;
        self.grace_deadline = None;
        self.missed_beats = 0;
        self.inbound_since_beat = true;
        self.publish_transition(&local_id, SessionStateKind::Connected);

        if resumes {
            self.replay_buffer().await;
        }
    }

    async fn reject_handshake(&mut self, reason: &str) {
        warn!(peer = %self.peer, reason, "handshake rejected");
        self.publish_protocol_error(ProtocolErrorKind::HandshakeFailed, reason);
        let response = HandshakeResponse {
            ok: false,
            session_id: None,
            code: Some(error_codes::HANDSHAKE_FAILED.to_owned()),
        };
        let _ = self.send_handshake_frame(WireFrame::HandshakeResponse(response)).await;
        self.shared.transport.close(&self.peer).await;
    }

    /// Returns false when the frame could not be encoded (the connection is
    /// torn down in that case — a session must not half-establish).
    async fn send_handshake_frame(&mut self, frame: WireFrame) -> bool {
        match self.shared.codec.encode(&frame) {
            Ok(bytes) => {
                if let Err(e) = self.shared.transport.send(&self.peer, bytes).await {
                    warn!(peer = %self.peer, error = %e, "handshake send failed");
                }
                true
            }
            Err(e) => {
                self.publish_protocol_error(
                    ProtocolErrorKind::MessageSendFailure,
                    &format!("handshake encode failed: {e}"),
                );
                self.shared.transport.close(&self.peer).await;
                false
            }
        }
    }

    async fn replay_buffer(&mut self) {
        let replay = match &self.core {
            Some(core) => core.replay_messages(),
            None => return,
        };
        debug!(peer = %self.peer, count = replay.len(), "replaying unacked messages");
        for msg in replay {
            self.encode_and_send(msg).await;
        }
    }

    async fn on_message(&mut self, msg: TransportMessage) {
        if self.state != SessionStateKind::Connected {
            debug!(peer = %self.peer, "dropping message outside connected state");
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
                self.invariant_violation(&format!(
                    "seq {} skips past contiguous tail",
                    msg.seq
                ))
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
            debug!(peer = %self.peer, stream_id = %msg.stream_id, "dropping message for tombstoned stream");
            return;
        }

        if msg.control_flags.is_stream_cancel() {
            self.on_peer_cancel(&msg);
            return;
        }

        if self.streams.contains_key(&msg.stream_id) {
            self.on_stream_data(msg).await;
        } else if msg.control_flags.is_stream_open() {
            self.on_stream_open(msg).await;
        } else {
            self.reject_stream(&msg.stream_id, "missing stream open bit").await;
        }
    }

    fn on_peer_cancel(&mut self, msg: &TransportMessage) {
        let error = serde_json::from_value::<ResultPayload>(msg.payload.clone())
            .map(ResultPayload::into_result)
            .ok()
            .and_then(Result::err)
            .unwrap_or_else(|| ErrorPayload::new(error_codes::CANCEL, "stream cancelled by peer"));
        if let Some(mut stream) = self.streams.remove(&msg.stream_id) {
            poison_stream(&mut stream, &error);
        }
        // Tombstone regardless: late frames for the id drop silently, and
        // no abort is echoed back at a cancelling peer.
        self.tombstones.insert(&msg.stream_id);
    }

    // -- stream open --

    async fn on_stream_open(&mut self, msg: TransportMessage) {
        let stream_id = msg.stream_id.clone();
        let (Some(service_name), Some(procedure_name)) =
            (msg.service_name.clone(), msg.procedure_name.clone())
        else {
            self.reject_stream(&stream_id, "missing service/procedure name")
                .await;
            return;
        };

        let registry: &ServiceRegistry = &self.shared.registry;
        let Some(service) = registry.get(&service_name) else {
            self.reject_stream(&stream_id, "couldn't find service").await;
            return;
        };
        let Some(procedure) = service.get(&procedure_name) else {
            self.reject_stream(&stream_id, "couldn't find matching procedure")
                .await;
            return;
        };
        if let Err(reason) = procedure.init.validate(&msg.payload) {
            debug!(peer = %self.peer, stream_id = %stream_id, reason = %reason, "init rejected");
            self.reject_stream(&stream_id, "init failed validation").await;
            return;
        }

        let kind = procedure.kind;
        let state = service.state_handle();
        let handler = procedure.handler.clone();
        let input_schema = procedure.input.clone();
        let init = msg.payload.clone();

        let token = CancelToken::new();
        let (feed, readable) = if kind.client_can_send() {
            let (feed, readable) = readable_pair();
            (Some(feed), Some(readable))
        } else {
            (None, None)
        };
        let (writable, writable_ctrl) = if kind.server_streams() {
            let (writable, ctrl) = writable_pair(&stream_id, self.stream_out_tx.clone());
            (Some(writable), Some(ctrl))
        } else {
            (None, None)
        };

        let session_id = self
            .core
            .as_ref()
            .map(|core| core.local_id.clone())
            .unwrap_or_default();
        let ctx = Ctx::new(
            &self.peer,
            &session_id,
            &stream_id,
            self.metadata.clone(),
            state,
            token.clone(),
            self.stream_out_tx.clone(),
        );

        for middleware in &self.shared.middlewares {
            middleware(&ctx, &init);
        }

        let mut record = ServerStream {
            kind,
            input_schema,
            feed,
            writable: writable_ctrl,
            token,
            client_half_closed: msg.control_flags.is_stream_closed(),
            server_half_closed: false,
        };
        if record.client_half_closed {
            if let Some(feed) = record.feed.as_mut() {
                feed.close();
            }
        }

        debug!(
            peer = %self.peer,
            stream_id = %stream_id,
            service = %service_name,
            procedure = %procedure_name,
            kind = kind.as_str(),
            "stream opened"
        );

        self.spawn_handler(&stream_id, handler, ctx, init, readable, writable);
        self.streams.insert(stream_id, record);
    }

    fn spawn_handler(
        &self,
        stream_id: &str,
        handler: ProcedureHandler,
        ctx: Ctx,
        init: Value,
        readable: Option<crate::channel::Readable>,
        writable: Option<crate::channel::Writable>,
    ) {
        let fut = async move {
            match handler {
                ProcedureHandler::Rpc(f) => HandlerOutcome::Final(f(ctx, init).await),
                ProcedureHandler::Upload(f) => {
                    let readable = readable.expect("upload shape carries a readable");
                    HandlerOutcome::Final(f(ctx, init, readable).await)
                }
                ProcedureHandler::Subscription(f) => {
                    let writable = writable.expect("subscription shape carries a writable");
                    HandlerOutcome::Streaming(f(ctx, init, writable).await)
                }
                ProcedureHandler::Stream(f) => {
                    let readable = readable.expect("stream shape carries a readable");
                    let writable = writable.expect("stream shape carries a writable");
                    HandlerOutcome::Streaming(f(ctx, init, readable, writable).await)
                }
            }
        };
        let out = self.stream_out_tx.clone();
        let sid = stream_id.to_owned();
        let inner = tokio::spawn(fut);
        tokio::spawn(async move {
            match inner.await {
                Ok(HandlerOutcome::Final(result)) => {
                    let _ = out.send(StreamOut::Result {
                        stream_id: sid,
                        result,
                    });
                }
                Ok(HandlerOutcome::Streaming(Ok(()))) => {}
                Ok(HandlerOutcome::Streaming(Err(error))) => {
                    let _ = out.send(StreamOut::Cancel {
                        stream_id: sid,
                        error,
                    });
                }
                Err(join_error) => {
                    let message = if join_error.is_panic() {
                        "handler panicked"
                    } else {
                        "handler aborted"
                    };
                    let _ = out.send(StreamOut::Cancel {
                        stream_id: sid,
                        error: ErrorPayload::new(error_codes::UNCAUGHT_ERROR, message),
                    });
                }
            }
        });
    }

    // -- stream data --

    async fn on_stream_data(&mut self, msg: TransportMessage) {
        let stream_id = msg.stream_id.clone();
        let closes = msg.control_flags.is_stream_closed();
        let control_only = msg.payload.is_null() && closes;

        let rejection = {
            let Some(stream) = self.streams.get(&stream_id) else {
                return;
            };
            if msg.control_flags.is_stream_open() {
                // A duplicate open for a live stream; replay dedup already
                // dropped real duplicates, so just ignore.
                return;
            }
            if stream.client_half_closed && !control_only {
                Some("stream is closed")
            } else if !control_only && !stream.kind.client_can_send() {
                Some("unexpected control payload")
            } else if !control_only {
                match &stream.input_schema {
                    Some(schema) => schema.validate(&msg.payload).err().map(|reason| {
                        debug!(peer = %self.peer, stream_id = %stream_id, reason = %reason, "input rejected");
                        "input payload failed validation"
                    }),
                    None => None,
                }
            } else {
                None
            }
        };
        if let Some(message) = rejection {
            self.reject_stream(&stream_id, message).await;
            return;
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !control_only {
            if let Some(feed) = stream.feed.as_mut() {
                feed.push(msg.payload);
            }
        }
        if closes {
            stream.client_half_closed = true;
            if let Some(feed) = stream.feed.as_mut() {
                feed.close();
            }
            if stream.kind == ProcedureKind::Stream {
                if let Some(ctrl) = &stream.writable {
                    ctrl.request_close();
                }
            }
            self.finish_if_complete(&stream_id);
        }
    }

    /// Abort an incoming stream id with a single `INVALID_REQUEST`, then
    /// tombstone it so repeats are dropped silently.
    async fn reject_stream(&mut self, stream_id: &str, message: &str) {
        if self.tombstones.contains(stream_id) {
            return;
        }
        self.tombstones.insert(stream_id);
        let error = ErrorPayload::new(error_codes::INVALID_REQUEST, message);
        if let Some(mut stream) = self.streams.remove(stream_id) {
            poison_stream(&mut stream, &error);
        }
        warn!(peer = %self.peer, stream_id = %stream_id, message, "stream rejected");
        self.send_cancel(stream_id, &error).await;
    }

    // -- handler output --

    async fn on_stream_out(&mut self, out: StreamOut) {
        match out {
            StreamOut::Data { stream_id, value } => {
                let live = self
                    .streams
                    .get(&stream_id)
                    .is_some_and(|s| !s.server_half_closed);
                if !live {
                    return;
                }
                let mut msg = TransportMessage::new(
                    &self.shared.server_id,
                    &self.peer,
                    &stream_id,
                    ControlFlags::NONE,
                    serde_json::to_value(ResultPayload::ok(value)).unwrap_or(Value::Null),
                );
                self.send_sequenced(&mut msg).await;
            }
            StreamOut::Close { stream_id } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if stream.server_half_closed {
                    return;
                }
                stream.server_half_closed = true;
                let mut msg = TransportMessage::new(
                    &self.shared.server_id,
                    &self.peer,
                    &stream_id,
                    ControlFlags::STREAM_CLOSED,
                    Value::Null,
                );
                self.send_sequenced(&mut msg).await;
                self.finish_if_complete(&stream_id);
            }
            StreamOut::Result { stream_id, result } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if stream.server_half_closed {
                    return;
                }
                stream.server_half_closed = true;
                let payload = match &result {
                    Ok(value) => ResultPayload::ok(value.clone()),
                    Err(error) => ResultPayload::err(error),
                };
                let mut msg = TransportMessage::new(
                    &self.shared.server_id,
                    &self.peer,
                    &stream_id,
                    ControlFlags::STREAM_CLOSED,
                    serde_json::to_value(payload).unwrap_or(Value::Null),
                );
                self.send_sequenced(&mut msg).await;
                self.finish_if_complete(&stream_id);
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
                self.send_cancel(&stream_id, &error).await;
            }
        }
    }

    fn finish_if_complete(&mut self, stream_id: &str) {
        let done = self
            .streams
            .get(stream_id)
            .is_some_and(|s| s.client_half_closed && s.server_half_closed);
        if done {
            if let Some(stream) = self.streams.remove(stream_id) {
                // Natural close still fires the advisory signal so handler
                // cleanup registered on the token runs.
                stream
                    .token
                    .fire(ErrorPayload::new(error_codes::CANCEL, "stream closed"));
            }
            debug!(peer = %self.peer, stream_id = %stream_id, "stream closed");
        }
    }

    // -- outbound plumbing --

    async fn send_cancel(&mut self, stream_id: &str, error: &ErrorPayload) {
        let mut msg = TransportMessage::new(
            &self.shared.server_id,
            &self.peer,
            stream_id,
            ControlFlags::STREAM_CANCEL,
            serde_json::to_value(ResultPayload::err(error)).unwrap_or(Value::Null),
        );
        self.send_sequenced(&mut msg).await;
    }

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
                if let Err(e) = self.shared.transport.send(&self.peer, bytes).await {
                    debug!(peer = %self.peer, error = %e, "transport send failed");
                }
            }
            Err(e) => {
                // Dropped on the floor; the copy in the send buffer gets
                // another chance at replay time.
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

        if self.missed_beats >= self.config().heartbeats_until_dead {
            warn!(peer = %self.peer, "missed heartbeats, presuming connection dead");
            self.shared.transport.close(&self.peer).await;
            if self.state == SessionStateKind::Connected {
                self.enter_pending_reconnect();
            }
            return;
        }

        let Some(core) = self.core.as_mut() else {
            return;
        };
        let mut hb = TransportMessage::ack_only(&self.shared.server_id, &self.peer);
        core.stamp_ack_only(&mut hb);
        self.encode_and_send(hb).await;
    }

    async fn invariant_violation(&mut self, reason: &str) {
        warn!(peer = %self.peer, reason, "protocol invariant violated");
        self.publish_protocol_error(ProtocolErrorKind::InvariantViolation, reason);
        self.destroy_session("protocol invariant violated");
        self.shared.transport.close(&self.peer).await;
    }

    fn destroy_session(&mut self, reason: &str) {
        let error = ErrorPayload::new(error_codes::UNEXPECTED_DISCONNECT, reason);
        for (_, mut stream) in self.streams.drain() {
            poison_stream(&mut stream, &error);
        }
        if let Some(core) = &self.core {
            info!(peer = %self.peer, session_id = %core.local_id, reason, "session destroyed");
            self.publish_transition(&core.local_id.clone(), SessionStateKind::Closed);
        }
        self.core = None;
        self.grace_deadline = None;
        self.state = SessionStateKind::Closed;
    }
}

/// Abort one stream's local machinery: terminal error to the reader, writes
/// dropped from here on, cancellation token fired.
fn poison_stream(stream: &mut ServerStream, error: &ErrorPayload) {
    if let Some(feed) = stream.feed.as_mut() {
        feed.error(error.clone());
    }
    if let Some(ctrl) = &stream.writable {
        ctrl.abort();
    }
    stream.token.fire(error.clone());
}
