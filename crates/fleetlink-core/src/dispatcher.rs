//! Command dispatcher: operator text commands to devices.
//!
//! The protocol carries no correlation ids - a device answers commands
//! strictly in the order it received them - so pairing is implicit FIFO
//! per session. That makes unbounded pipelining unsafe: the dispatcher
//! refuses more than a configured number of in-flight commands per
//! session, and excess callers get a back-pressure error rather than a
//! silently ambiguous pairing.
//!
//! Timeouts are per command and never touch the session: a device that
//! answers late simply pairs its response with the next outstanding
//! command, exactly as it would on the wire.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fleetlink_proto::encode_codec12_request;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    handle::{PendingCommand, SessionHandle},
    registry::SessionRegistry,
};

/// Default cap on concurrent in-flight commands per session.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Ways a command can fail. All are local to the caller; none of them
/// closes the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No session is bound for the addressed identity.
    #[error("device is not connected")]
    DeviceNotConnected,

    /// The per-session in-flight cap is reached; retry after an
    /// outstanding command completes.
    #[error("too many commands in flight for this device")]
    PipelineFull,

    /// No paired response arrived before the deadline.
    #[error("no response before the deadline")]
    Timeout,

    /// The frame could not be handed to the session's write path.
    #[error("session write failed: {0}")]
    Write(String),

    /// The session ended with the command still outstanding.
    #[error("session closed before the response arrived")]
    SessionGone,
}

/// Thread-safe command API shared by every command source.
pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    max_in_flight: usize,
    next_token: AtomicU64,
}

impl CommandDispatcher {
    /// Create a dispatcher over `registry` with the given per-session
    /// in-flight cap.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, max_in_flight: usize) -> Self {
        Self { registry, max_in_flight, next_token: AtomicU64::new(1) }
    }

    /// Send `text` to the device bound as `imei` and await its response.
    ///
    /// The pending entry is enqueued before the frame is handed to the
    /// write path, so a response can never arrive ahead of its entry. On
    /// a write failure the entry is removed again and the error is
    /// surfaced as [`CommandError::Write`].
    pub async fn send(
        &self,
        imei: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, CommandError> {
        let session = self.registry.lookup(imei).ok_or(CommandError::DeviceNotConnected)?;
        let frame = encode_codec12_request(text);

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (done, mut response) = oneshot::channel();
        session.push_pending(PendingCommand { token, done }, self.max_in_flight)?;

        tracing::debug!(imei, token, bytes = frame.len(), "command dispatched");

        if let Err(e) = session.write(frame).await {
            session.remove_pending(token);
            return Err(CommandError::Write(e.to_string()));
        }

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(result)) => result,
            // Completion handle dropped without a verdict: the session
            // task died mid-teardown
            Ok(Err(_)) => Err(CommandError::SessionGone),
            Err(_elapsed) => {
                if session.remove_pending(token) {
                    return Err(CommandError::Timeout);
                }
                // The entry was paired in the same instant the deadline
                // fired; prefer the response that is already in flight
                response.try_recv().unwrap_or(Err(CommandError::Timeout))
            },
        }
    }

    /// Pair an inbound response with the oldest outstanding command on
    /// `session`. Returns whether the response was solicited; an
    /// unsolicited one belongs on the event sink, not in an error log.
    pub fn on_response(&self, session: &SessionHandle, text: String) -> bool {
        match session.pop_pending() {
            Some(cmd) => {
                let _ = cmd.done.send(Ok(text));
                true
            },
            None => false,
        }
    }

    /// Fail every outstanding command on `session` with
    /// [`CommandError::SessionGone`]. Called once at session teardown.
    pub fn fail_session(&self, session: &SessionHandle) {
        for cmd in session.drain_pending() {
            let _ = cmd.done.send(Err(CommandError::SessionGone));
        }
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("max_in_flight", &self.max_in_flight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Instant};

    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::*;

    const IMEI: &str = "353691844288760";

    struct Fixture {
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        session: Arc<SessionHandle>,
        wire: mpsc::Receiver<Bytes>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(CommandDispatcher::new(Arc::clone(&registry), 2));

        let (tx, wire) = mpsc::channel(16);
        let peer: SocketAddr = "10.0.0.1:40000".parse().unwrap();
        let session = Arc::new(SessionHandle::new(1, peer, tx, Instant::now()));
        registry.bind(IMEI, &session).ok();

        Fixture { registry, dispatcher, session, wire }
    }

    async fn wait_for_pending(session: &SessionHandle, n: usize) {
        while session.pending_len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn unknown_device_fails_fast() {
        let f = fixture();
        let err = f.dispatcher.send("356307042441013", "getver", Duration::from_secs(1)).await;
        assert_eq!(err, Err(CommandError::DeviceNotConnected));
    }

    #[tokio::test]
    async fn response_resolves_the_caller() {
        let mut f = fixture();
        let dispatcher = Arc::clone(&f.dispatcher);

        let call = tokio::spawn(async move {
            dispatcher.send(IMEI, "getver", Duration::from_secs(5)).await
        });

        // The encoded frame reaches the write path
        let frame = f.wire.recv().await.unwrap();
        assert_eq!(&frame[8..11], &[0x0C, 0x01, 0x05]);
        assert_eq!(f.session.pending_len(), 1);

        assert!(f.dispatcher.on_response(&f.session, "FW 03.27.14".to_string()));
        assert_eq!(call.await.unwrap(), Ok("FW 03.27.14".to_string()));
        assert_eq!(f.session.pending_len(), 0);
    }

    #[tokio::test]
    async fn responses_pair_in_dispatch_order() {
        let mut f = fixture();

        let d = Arc::clone(&f.dispatcher);
        let first =
            tokio::spawn(async move { d.send(IMEI, "A", Duration::from_secs(5)).await });
        wait_for_pending(&f.session, 1).await;

        let d = Arc::clone(&f.dispatcher);
        let second =
            tokio::spawn(async move { d.send(IMEI, "B", Duration::from_secs(5)).await });
        wait_for_pending(&f.session, 2).await;

        assert!(f.dispatcher.on_response(&f.session, "ra".to_string()));
        assert!(f.dispatcher.on_response(&f.session, "rb".to_string()));

        assert_eq!(first.await.unwrap(), Ok("ra".to_string()));
        assert_eq!(second.await.unwrap(), Ok("rb".to_string()));
        drop(f.wire);
    }

    #[tokio::test]
    async fn pipeline_cap_pushes_back() {
        let mut f = fixture();

        for _ in 0..2 {
            let d = Arc::clone(&f.dispatcher);
            tokio::spawn(async move { d.send(IMEI, "slow", Duration::from_secs(5)).await });
        }
        wait_for_pending(&f.session, 2).await;

        let err = f.dispatcher.send(IMEI, "one too many", Duration::from_secs(5)).await;
        assert_eq!(err, Err(CommandError::PipelineFull));
        drop(f.wire);
    }

    #[tokio::test]
    async fn deadline_removes_the_entry_and_spares_the_session() {
        let f = fixture();

        let err = f.dispatcher.send(IMEI, "getver", Duration::from_millis(20)).await;
        assert_eq!(err, Err(CommandError::Timeout));
        assert_eq!(f.session.pending_len(), 0);

        // The session is still bound and usable
        assert!(f.registry.lookup(IMEI).is_some());
    }

    #[tokio::test]
    async fn late_response_pairs_with_the_next_command() {
        let mut f = fixture();

        // First command times out; its entry leaves the queue
        let err = f.dispatcher.send(IMEI, "A", Duration::from_millis(20)).await;
        assert_eq!(err, Err(CommandError::Timeout));

        let d = Arc::clone(&f.dispatcher);
        let second =
            tokio::spawn(async move { d.send(IMEI, "B", Duration::from_secs(5)).await });
        wait_for_pending(&f.session, 1).await;

        // The device's (late) answer to A pairs with B - FIFO is the wire
        // contract, not intent
        assert!(f.dispatcher.on_response(&f.session, "ra".to_string()));
        assert_eq!(second.await.unwrap(), Ok("ra".to_string()));
        drop(f.wire);
    }

    #[tokio::test]
    async fn teardown_fails_all_outstanding_commands() {
        let mut f = fixture();

        let d = Arc::clone(&f.dispatcher);
        let call = tokio::spawn(async move { d.send(IMEI, "A", Duration::from_secs(5)).await });
        wait_for_pending(&f.session, 1).await;

        f.dispatcher.fail_session(&f.session);
        assert_eq!(call.await.unwrap(), Err(CommandError::SessionGone));
        drop(f.wire);
    }

    #[tokio::test]
    async fn write_failure_removes_the_entry() {
        let f = fixture();
        drop(f.wire); // writer gone: the queue is closed

        let err = f.dispatcher.send(IMEI, "getver", Duration::from_secs(1)).await;
        assert!(matches!(err, Err(CommandError::Write(_))));
        assert_eq!(f.session.pending_len(), 0);
    }

    #[tokio::test]
    async fn unsolicited_response_is_flagged() {
        let f = fixture();
        assert!(!f.dispatcher.on_response(&f.session, "surprise".to_string()));
    }
}
