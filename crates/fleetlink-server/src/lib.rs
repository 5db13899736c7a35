//! Production fleetlink gateway.
//!
//! Binds the device-facing TCP port, gates accepts through the admission
//! controller, and runs one task per session. The engine's collaborators
//! (admission, registry, dispatcher) are constructed here and threaded
//! into every session; nothing in the engine is a global.
//!
//! # Components
//!
//! - [`Gateway`]: listener plus composition root; `bind` then `run`
//! - [`conn`]: per-session transport driver (read loop, serialized writes)
//! - [`LogSink`], [`ChannelSink`], [`FanoutSink`]: shipped event sinks
//!
//! Command sources (a bus subscriber, an admin surface) share the
//! [`CommandDispatcher`] handed out by [`Gateway::dispatcher`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod conn;
mod error;
mod sink;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

pub use error::ServerError;
use fleetlink_core::{
    AdmissionConfig, AdmissionController, CommandDispatcher, DEFAULT_MAX_IN_FLIGHT, EventSink,
    SessionHandle, SessionRegistry,
};
pub use sink::{ChannelSink, FanoutSink, LogSink};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinSet,
};

use crate::conn::SessionEnv;

/// Frames queued per session between the dispatcher and the socket.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind the device-facing port to.
    pub bind_address: String,
    /// Hard cap on concurrent connections, checked before admission.
    pub max_connections: usize,
    /// Per-session cap on in-flight commands.
    pub max_in_flight: usize,
    /// How long a connection may take to present its identity.
    pub handshake_timeout: Duration,
    /// How long a streaming session may stay silent.
    pub idle_timeout: Duration,
    /// Cap on unparsed bytes buffered per session.
    pub max_frame_bytes: usize,
    /// Cadence of the admission prune sweep.
    pub sweep_interval: Duration,
    /// Admission policy; runtime-mutable afterwards via
    /// [`Gateway::admission`].
    pub admission: AdmissionConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8833".to_string(),
            max_connections: 10_000,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            handshake_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            max_frame_bytes: 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
            admission: AdmissionConfig::default(),
        }
    }
}

/// Triggers a graceful stop from outside the accept loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    trigger: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and close every session with reason `shutdown`.
    pub fn shutdown(&self) {
        let _ = self.trigger.send(true);
    }
}

/// Production gateway: listener, collaborators, session supervision.
pub struct Gateway {
    listener: TcpListener,
    env: Arc<SessionEnv>,
    admission: Arc<AdmissionController>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    config: GatewayConfig,
    shutdown: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

impl Gateway {
    /// Bind the device-facing port and compose the engine.
    pub async fn bind(
        config: GatewayConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ServerError::Config(format!(
                "invalid bind address '{}': {e}",
                config.bind_address
            )))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        let admission = Arc::new(AdmissionController::new(config.admission.clone()));
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher =
            Arc::new(CommandDispatcher::new(Arc::clone(&registry), config.max_in_flight));

        let env = Arc::new(SessionEnv {
            admission: Arc::clone(&admission),
            registry: Arc::clone(&registry),
            dispatcher: Arc::clone(&dispatcher),
            sink,
            handshake_timeout: config.handshake_timeout,
            idle_timeout: config.idle_timeout,
            max_frame_bytes: config.max_frame_bytes,
        });

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            listener,
            env,
            admission,
            registry,
            dispatcher,
            config,
            shutdown: Arc::new(shutdown),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }

    /// Command API shared by every command source.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Admission controller, for runtime policy updates.
    #[must_use]
    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    /// Session registry, for operational queries.
    #[must_use]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Handle for triggering a graceful stop.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { trigger: Arc::clone(&self.shutdown) }
    }

    /// Accept connections until shut down, then drain every session.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.local_addr()?, "gateway listening");

        let sweeper = spawn_sweeper(
            Arc::clone(&self.admission),
            self.config.sweep_interval,
            self.shutdown.subscribe(),
        );

        let mut sessions = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer, &mut sessions),
                    Err(e) => {
                        // Transient accept failures (fd pressure, resets in
                        // the backlog) do not take the gateway down
                        tracing::error!(error = %e, "accept failed");
                    },
                },
                // Reap finished session tasks so the set stays small
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {},
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!(sessions = sessions.len(), "gateway stopping, draining sessions");
        while sessions.join_next().await.is_some() {}
        sweeper.abort();

        Ok(())
    }

    /// Gate one accepted socket and spawn its session task.
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        let active = self.active.load(Ordering::Relaxed);
        if active >= self.config.max_connections {
            tracing::warn!(%peer, active, "connection cap reached, refusing socket");
            drop(stream);
            return;
        }

        if let Err(reason) = self.env.admission.evaluate_open(peer.ip(), Instant::now()) {
            tracing::info!(%peer, reason = reason.as_str(), "admission denied");
            drop(stream);
            return;
        }

        let _ = stream.set_nodelay(true);

        let session_id = next_session_id();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let handle = Arc::new(SessionHandle::new(session_id, peer, writer_tx, Instant::now()));

        let env = Arc::clone(&self.env);
        let shutdown_rx = self.shutdown.subscribe();
        let counter = Arc::clone(&self.active);
        counter.fetch_add(1, Ordering::Relaxed);

        sessions.spawn(async move {
            conn::run_session(stream, handle, writer_rx, env, shutdown_rx).await;
            counter.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Background task pruning expired admission state at a fixed cadence.
fn spawn_sweeper(
    admission: Arc<AdmissionController>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = admission.sweep(Instant::now());
                    if pruned > 0 {
                        tracing::debug!(pruned, "admission sweep");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

/// Random session id from the OS RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails; a gateway that cannot generate unique
/// session ids cannot operate.
fn next_session_id() -> u64 {
    let mut buf = [0u8; 8];
    #[allow(clippy::expect_used)]
    getrandom::fill(&mut buf).expect("invariant: OS RNG failure is unrecoverable");
    u64::from_be_bytes(buf)
}
