//! `CaptureService`: the single-threaded event loop around the negotiator.
//!
//! ```text
//! CaptureHandle ──commands──►┐
//! ResponseSink ───events────►├──► SessionNegotiator ──► CaptureEvent channel ──► consumer
//! FrameSink ──────events────►┘         ▲
//!                      attempt deadline┘
//! ```
//!
//! Foreign threads (D-Bus listener, GStreamer streaming thread) only queue
//! events; every state transition runs on the loop task. The consumer reads
//! [`CaptureEvent`]s from the returned receiver, with `recv().await` or
//! `blocking_recv()` from a UI thread.

use std::sync::Arc;

use portalshot_core::{CaptureConfig, CaptureError, CaptureEvent};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::broker::{Broker, ResponseSink};
use crate::negotiator::{EngineEvent, SessionNegotiator};
use crate::pipeline::PipelineFactory;

#[derive(Debug)]
enum Command {
    Start,
    Shutdown,
}

// ── CaptureHandle ─────────────────────────────────────────────────────────────

/// Cloneable handle used to drive a running [`CaptureService`].
#[derive(Clone, Debug)]
pub struct CaptureHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CaptureHandle {
    /// Start a capture, superseding any attempt still in flight.
    ///
    /// The outcome arrives as one [`CaptureEvent`].
    pub fn start_capture(&self) -> Result<(), CaptureError> {
        self.commands.send(Command::Start).map_err(|_| CaptureError::ServiceStopped)
    }

    /// Clean up and stop the loop (non-blocking).
    pub fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_err() {
            debug!("Capture service already stopped; nothing to shut down");
        }
    }
}

// ── CaptureService ────────────────────────────────────────────────────────────

/// Owns the engine's event queue until [`spawn`](Self::spawn) hands it to
/// the loop task. Create it first so the broker can be given a
/// [`ResponseSink`].
pub struct CaptureService {
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl Default for CaptureService {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureService {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self { events_tx, events_rx }
    }

    /// Sink a broker implementation delivers its `Response` events into.
    pub fn response_sink(&self) -> ResponseSink {
        ResponseSink::new(self.events_tx.clone())
    }

    /// Spawn the loop on the current tokio runtime.
    ///
    /// The loop runs until [`CaptureHandle::shutdown`] or until every handle
    /// has been dropped; it then cleans up and closes the event channel.
    pub fn spawn(
        self,
        broker: Option<Arc<dyn Broker>>,
        pipelines: Arc<dyn PipelineFactory>,
        config: CaptureConfig,
    ) -> (CaptureHandle, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let negotiator = SessionNegotiator::new(broker, pipelines, config, self.events_tx, outcome_tx);
        tokio::spawn(run_loop(negotiator, commands_rx, self.events_rx));

        (CaptureHandle { commands: commands_tx }, outcome_rx)
    }
}

async fn run_loop(
    mut negotiator: SessionNegotiator,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    info!("Capture service running");
    loop {
        let deadline = negotiator.deadline();
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start) => negotiator.start_capture().await,
                Some(Command::Shutdown) | None => break,
            },
            Some(event) = events.recv() => negotiator.handle_event(event).await,
            _ = sleep_until(deadline) => {
                debug!("Attempt deadline reached");
                negotiator.on_deadline().await;
            }
        }
    }
    negotiator.cleanup().await;
    info!("Capture service stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
