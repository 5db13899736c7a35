//! Per-session transport driver.
//!
//! One task per accepted socket. The task is the session's only writer:
//! acks produced by the state machine are written inline, and frames from
//! the dispatcher arrive over the session's queue and are drained by the
//! same `select!` loop, so frames are atomic on the wire by construction.
//!
//! The state machine decides everything protocol-shaped; this module only
//! moves bytes, consults the collaborators at the handshake seam, and
//! executes actions in order.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use fleetlink_core::{
    AdmissionController, CloseReason, CommandDispatcher, DeviceSession, EventSink, GatewayEvent,
    HandshakeVerdict, SessionAction, SessionHandle, SessionRegistry, SessionState,
};
use fleetlink_proto::imei;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{mpsc, watch},
};

/// Collaborators and limits shared by every session task.
pub(crate) struct SessionEnv {
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) dispatcher: Arc<CommandDispatcher>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_frame_bytes: usize,
}

/// Drive one session from accept to teardown.
pub(crate) async fn run_session(
    stream: TcpStream,
    handle: Arc<SessionHandle>,
    mut outbound: mpsc::Receiver<Bytes>,
    env: Arc<SessionEnv>,
    mut shutdown: watch::Receiver<bool>,
) {
    let session_id = handle.id();
    let peer = handle.peer();

    env.sink.emit(GatewayEvent::SessionOpened { session_id, peer }).await;
    tracing::debug!(session_id, %peer, "session task started");

    let (mut reader, mut writer) = stream.into_split();
    let mut machine = DeviceSession::new(env.max_frame_bytes);
    let mut chunk = BytesMut::with_capacity(8192);
    let mut deadline = handle.opened_at() + env.handshake_timeout;

    let reason = loop {
        chunk.clear();

        tokio::select! {
            read = reader.read_buf(&mut chunk) => match read {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(_) => {
                    let actions = machine.on_bytes(&chunk);
                    if let Some(reason) =
                        execute(actions, &mut machine, &handle, &mut writer, &env).await
                    {
                        break reason;
                    }
                    if machine.state() == SessionState::Streaming {
                        deadline = Instant::now() + env.idle_timeout;
                    }
                },
                Err(e) => {
                    tracing::debug!(session_id, %peer, error = %e, "socket read failed");
                    break CloseReason::ReadError;
                },
            },

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        tracing::debug!(session_id, %peer, error = %e, "socket write failed");
                        break CloseReason::WriteError;
                    }
                },
                None => break CloseReason::WriteError,
            },

            () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                break if machine.state() == SessionState::Streaming {
                    CloseReason::IdleTimeout
                } else {
                    CloseReason::HandshakeTimeout
                };
            },

            _ = shutdown.changed() => break CloseReason::Shutdown,
        }
    };

    machine.terminate();
    outbound.close();

    // Complete outstanding commands before the registry forgets us
    env.dispatcher.fail_session(&handle);

    let bound_imei = handle.imei().map(str::to_string);
    if let Some(ref bound) = bound_imei {
        env.registry.unbind(bound, &handle);
        env.admission.release(peer.ip(), bound, Instant::now());
    }

    env.sink
        .emit(GatewayEvent::SessionClosed { session_id, imei: bound_imei, reason })
        .await;
    tracing::info!(session_id, %peer, reason = reason.as_str(), "session closed");
}

/// Execute state machine actions in order. `Some(reason)` stops the
/// session.
async fn execute(
    actions: Vec<SessionAction>,
    machine: &mut DeviceSession,
    handle: &Arc<SessionHandle>,
    writer: &mut OwnedWriteHalf,
    env: &SessionEnv,
) -> Option<CloseReason> {
    let mut queue: VecDeque<SessionAction> = actions.into();

    while let Some(action) = queue.pop_front() {
        match action {
            SessionAction::Write(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    tracing::debug!(session_id = handle.id(), error = %e, "ack write failed");
                    return Some(CloseReason::WriteError);
                }
            },

            SessionAction::Authenticate { imei } => {
                let verdict = authenticate(&imei, handle, env).await;
                // The identity frame is always the last decoded frame of
                // its batch, so appending keeps execution order
                queue.extend(machine.resolve_handshake(verdict));
            },

            SessionAction::Batch { records, crc_ok } => {
                let imei = handle.imei().unwrap_or_default().to_string();
                if !crc_ok {
                    tracing::warn!(
                        session_id = handle.id(),
                        imei = %imei,
                        records = records.len(),
                        "telemetry batch with bad crc; records kept"
                    );
                }
                for record in records {
                    env.sink.emit(GatewayEvent::AvlRecord { imei: imei.clone(), record }).await;
                }
            },

            SessionAction::Response { text, crc_ok } => {
                let imei = handle.imei().unwrap_or_default().to_string();
                if !crc_ok {
                    tracing::warn!(
                        session_id = handle.id(),
                        imei = %imei,
                        "command response with bad crc; text kept"
                    );
                }
                // Pair with the oldest outstanding command first; only
                // then does the response become an event
                let solicited = env.dispatcher.on_response(handle, text.clone());
                env.sink
                    .emit(GatewayEvent::CommandResponse { imei, text, solicited })
                    .await;
            },

            SessionAction::Close { reason } => return Some(reason),
        }
    }

    None
}

/// Validate an offered identity and bind it. The admission attempt was
/// already counted at accept; a rejection here just leaves it spent.
async fn authenticate(
    offered: &str,
    handle: &Arc<SessionHandle>,
    env: &SessionEnv,
) -> HandshakeVerdict {
    let session_id = handle.id();
    let source = handle.peer().ip();
    let now = Instant::now();

    if let Err(e) = imei::validate(offered) {
        tracing::info!(session_id, %source, imei = %offered, error = %e, "handshake rejected");
        return HandshakeVerdict::Reject(CloseReason::HandshakeRejected);
    }

    if !env.admission.imei_allowed(offered) {
        tracing::info!(session_id, %source, imei = %offered, "identity not on allow-list");
        return HandshakeVerdict::Reject(CloseReason::HandshakeRejected);
    }

    if let Err(reason) = env.admission.evaluate_bind(source, offered, now) {
        tracing::warn!(
            session_id,
            %source,
            imei = %offered,
            reason = reason.as_str(),
            "bind denied by admission"
        );
        return HandshakeVerdict::Reject(CloseReason::AdmissionDenied);
    }

    if env.registry.bind(offered, handle).is_err() {
        // The established session stays authoritative. Undo our admission
        // record unless it is the established session's own (same source)
        let same_source = env
            .registry
            .lookup(offered)
            .is_some_and(|existing| existing.peer().ip() == source);
        if !same_source {
            env.admission.release(source, offered, now);
        }
        tracing::warn!(session_id, %source, imei = %offered, "identity already bound");
        return HandshakeVerdict::Reject(CloseReason::DuplicateImei);
    }

    env.sink
        .emit(GatewayEvent::Authenticated { session_id, imei: offered.to_string() })
        .await;
    tracing::info!(session_id, %source, imei = %offered, "session authenticated");
    HandshakeVerdict::Accept
}
