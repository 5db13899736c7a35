//! Shared face of a live session.
//!
//! The session task owns the socket; everything else (the dispatcher, the
//! registry) interacts with a session only through its handle. The handle
//! carries the two pieces of shared mutable state: the serialized write
//! queue and the FIFO pending-command queue.
//!
//! The pending queue lock is a plain mutex held only for queue surgery,
//! never across an await or a socket write.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::CommandError;

/// The session's write queue has shut down.
///
/// Surfaces when a frame is handed to a session whose task already
/// stopped draining the queue; the caller treats it as a write failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("session write queue is closed")]
pub struct WriteQueueClosed;

/// One command awaiting its response, oldest first in the queue.
pub(crate) struct PendingCommand {
    /// Dispatcher-internal id, used to remove exactly this entry on
    /// timeout or write failure.
    pub(crate) token: u64,
    /// Completion handle back to the caller.
    pub(crate) done: oneshot::Sender<Result<String, CommandError>>,
}

/// Shared per-session state.
///
/// Cheap to share via `Arc`; everything on it is either immutable after
/// construction (`id`, `peer`, `opened_at`), write-once (`imei`, set by
/// the registry at bind), or internally locked (the pending queue).
pub struct SessionHandle {
    id: u64,
    peer: SocketAddr,
    opened_at: Instant,
    imei: OnceLock<String>,
    writer: mpsc::Sender<Bytes>,
    pending: Mutex<VecDeque<PendingCommand>>,
}

impl SessionHandle {
    /// Create a handle for a freshly accepted socket.
    #[must_use]
    pub fn new(id: u64, peer: SocketAddr, writer: mpsc::Sender<Bytes>, opened_at: Instant) -> Self {
        Self {
            id,
            peer,
            opened_at,
            imei: OnceLock::new(),
            writer,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Session id, unique per process lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Peer address captured at accept time.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// When the socket was accepted.
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Bound device identity. `None` until the handshake completes.
    #[must_use]
    pub fn imei(&self) -> Option<&str> {
        self.imei.get().map(String::as_str)
    }

    /// Record the bound identity. Only the registry calls this, exactly
    /// once per session.
    pub(crate) fn bind_imei(&self, imei: &str) {
        let _ = self.imei.set(imei.to_string());
    }

    /// Queue a frame on the session's serialized write path.
    ///
    /// Frames are written whole and in queue order; awaiting here applies
    /// back-pressure when the queue is full.
    pub async fn write(&self, frame: Bytes) -> Result<(), WriteQueueClosed> {
        self.writer.send(frame).await.map_err(|_| WriteQueueClosed)
    }

    /// Append a pending command, refusing beyond `max_in_flight`.
    pub(crate) fn push_pending(
        &self,
        cmd: PendingCommand,
        max_in_flight: usize,
    ) -> Result<(), CommandError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.len() >= max_in_flight {
            return Err(CommandError::PipelineFull);
        }
        pending.push_back(cmd);
        Ok(())
    }

    /// Pop the oldest pending command (FIFO pairing).
    pub(crate) fn pop_pending(&self) -> Option<PendingCommand> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    /// Remove a specific pending entry. `false` means it was already
    /// paired or removed.
    pub(crate) fn remove_pending(&self, token: u64) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let before = pending.len();
        pending.retain(|cmd| cmd.token != token);
        pending.len() != before
    }

    /// Take every pending entry, oldest first. Used at session teardown.
    pub(crate) fn drain_pending(&self) -> Vec<PendingCommand> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect()
    }

    /// Number of commands awaiting responses.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("imei", &self.imei.get())
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        let peer = "127.0.0.1:50000".parse().unwrap();
        (SessionHandle::new(7, peer, tx, Instant::now()), rx)
    }

    fn pending(token: u64) -> (PendingCommand, oneshot::Receiver<Result<String, CommandError>>) {
        let (done, rx) = oneshot::channel();
        (PendingCommand { token, done }, rx)
    }

    #[test]
    fn imei_is_write_once() {
        let (h, _rx) = handle();
        assert_eq!(h.imei(), None);

        h.bind_imei("353691844288760");
        h.bind_imei("356307042441013");
        assert_eq!(h.imei(), Some("353691844288760"));
    }

    #[test]
    fn pending_queue_is_fifo_and_bounded() {
        let (h, _rx) = handle();

        let (a, _ra) = pending(1);
        let (b, _rb) = pending(2);
        let (c, _rc) = pending(3);
        assert!(h.push_pending(a, 2).is_ok());
        assert!(h.push_pending(b, 2).is_ok());
        assert_eq!(h.push_pending(c, 2), Err(CommandError::PipelineFull));

        assert_eq!(h.pop_pending().map(|p| p.token), Some(1));
        assert_eq!(h.pop_pending().map(|p| p.token), Some(2));
        assert_eq!(h.pop_pending().map(|p| p.token), None);
    }

    #[test]
    fn remove_pending_targets_one_entry() {
        let (h, _rx) = handle();

        let (a, _ra) = pending(1);
        let (b, _rb) = pending(2);
        h.push_pending(a, 8).ok();
        h.push_pending(b, 8).ok();

        assert!(h.remove_pending(1));
        assert!(!h.remove_pending(1));
        assert_eq!(h.pending_len(), 1);
        assert_eq!(h.pop_pending().map(|p| p.token), Some(2));
    }

    #[tokio::test]
    async fn write_fails_once_queue_is_closed() {
        let (h, rx) = handle();
        drop(rx);
        assert_eq!(h.write(Bytes::from_static(b"x")).await, Err(WriteQueueClosed));
    }
}
