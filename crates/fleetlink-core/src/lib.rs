//! Session engine for the fleetlink gateway.
//!
//! Everything between the raw socket and the event bus lives here, with no
//! I/O of its own:
//!
//! - [`session::DeviceSession`]: per-connection state machine. Feeds the
//!   read buffer through the wire codecs and returns actions (write these
//!   bytes, authenticate this identity, emit these records) for the
//!   transport driver to execute.
//! - [`handle::SessionHandle`]: the shared face of a live session - the
//!   serialized write queue and the FIFO pending-command queue.
//! - [`registry::SessionRegistry`]: IMEI -> session map with atomic bind
//!   and stale-safe unbind.
//! - [`dispatcher::CommandDispatcher`]: `send(imei, text, timeout)` with
//!   implicit FIFO request/response pairing and bounded pipelining.
//! - [`admission::AdmissionController`]: connection gating - rate windows,
//!   soft-bans, per-source device caps, allow-lists - with runtime-mutable
//!   configuration.
//! - [`event::EventSink`]: the single observer seam the engine reports
//!   through. Concrete sinks (bus publisher, webhook, dashboard) live with
//!   the hosting process.
//!
//! The split follows the action pattern: state machines stay pure and are
//! driven by a thin runtime layer that owns the sockets.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod dispatcher;
pub mod event;
pub mod handle;
pub mod registry;
pub mod session;

pub use admission::{AdmissionConfig, AdmissionController, AdmissionUpdate, DenyReason};
pub use dispatcher::{CommandDispatcher, CommandError, DEFAULT_MAX_IN_FLIGHT};
pub use event::{CloseReason, EventSink, GatewayEvent};
pub use handle::{SessionHandle, WriteQueueClosed};
pub use registry::{BindConflict, SessionRegistry};
pub use session::{DeviceSession, HandshakeVerdict, SessionAction, SessionState};
