//! Concrete event sinks.
//!
//! The engine only knows the [`EventSink`] trait; these are the sinks the
//! server ships. Downstream consumers (bus publisher, webhook forwarder,
//! dashboard broadcast) attach through a [`ChannelSink`] and drain events
//! at their own pace.

use async_trait::async_trait;
use fleetlink_core::{EventSink, GatewayEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sink that renders every event through `tracing`.
///
/// Telemetry records go out at debug level - at fleet scale they are far
/// too chatty for info - while lifecycle events are info.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::SessionOpened { session_id, peer } => {
                tracing::info!(session_id, %peer, "session opened");
            },
            GatewayEvent::Authenticated { session_id, imei } => {
                tracing::info!(session_id, imei = %imei, "session authenticated");
            },
            GatewayEvent::AvlRecord { imei, record } => {
                tracing::debug!(
                    imei = %imei,
                    timestamp_ms = record.timestamp_ms,
                    lat = record.fix.latitude,
                    lng = record.fix.longitude,
                    speed = record.fix.speed,
                    satellites = record.fix.satellites,
                    event_id = record.event_id,
                    io_count = record.io.len(),
                    "telemetry record"
                );
            },
            GatewayEvent::CommandResponse { imei, text, solicited } => {
                tracing::info!(imei = %imei, text = %text, solicited, "command response");
            },
            GatewayEvent::SessionClosed { session_id, imei, reason } => {
                tracing::info!(session_id, imei = ?imei, reason = reason.as_str(), "session closed");
            },
        }
    }
}

/// Asynchronous queue adapter in front of a slow consumer.
///
/// `emit` awaits queue capacity, so a consumer that stops draining
/// back-pressures the sessions feeding it. Events emitted after the
/// consumer is gone are dropped silently.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<GatewayEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its consumer drains.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: GatewayEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Deliver every event to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    /// Combine `sinks` into one.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn emit(&self, event: GatewayEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone()).await;
        }
    }
}
