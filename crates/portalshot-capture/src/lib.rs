//! portalshot-capture: one-shot screen capture through a portal broker.
//!
//! # Usage
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use portalshot_capture::spawn_portal;
//! use portalshot_core::{CaptureConfig, CaptureEvent};
//!
//! let (handle, mut events) = spawn_portal(CaptureConfig::default()).await?;
//! handle.start_capture()?;
//! match events.recv().await {
//!     Some(CaptureEvent::Succeeded(frame)) => println!("{frame}"),
//!     Some(CaptureEvent::Failed(e)) => eprintln!("{e}"),
//!     None => {}
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//!  CreateSession ──► SelectSources ──► Start ──► stream node_id
//!        │                 │             │              │
//!        └── Response ─────┴── Response ─┘              ▼
//!              ▲                                 pipewiresrc(path=node)
//!        ResponseRouter                                 │
//!     (request handle → step)                    videoconvert ─► RGB
//!                                                       │
//!                                                    appsink ─► FrameBuffer
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | [`router`] | correlates asynchronous `Response` events with their request |
//! | [`negotiator`] | drives the three-step handshake, one attempt at a time |
//! | [`pipeline`] | owns the frame pipeline and extracts the first frame |
//! | `lifecycle` | idempotent cleanup of every per-attempt resource |
//! | [`service`] | the event loop the above run on |
//! | `portal` / `gst_pipeline` | the D-Bus and GStreamer backends (Linux) |

pub mod broker;
mod lifecycle;
pub mod negotiator;
pub mod pipeline;
pub mod protocol;
pub mod router;
pub mod service;

#[cfg(target_os = "linux")]
pub mod gst_pipeline;
#[cfg(target_os = "linux")]
pub mod portal;

pub use broker::{Broker, ResponseSink};
pub use negotiator::{EngineEvent, NegotiationState, SessionNegotiator};
pub use pipeline::{FramePipeline, FrameSink, PipelineController, PipelineFactory, VideoSample};
pub use router::ResponseRouter;
pub use service::{CaptureHandle, CaptureService};

/// Start a capture service wired to the session-bus portal and GStreamer.
///
/// A missing or unreachable portal is not fatal here: the service still
/// runs and reports `BrokerUnavailable` for each requested capture.
#[cfg(target_os = "linux")]
pub async fn spawn_portal(
    config: portalshot_core::CaptureConfig,
) -> Result<
    (CaptureHandle, tokio::sync::mpsc::UnboundedReceiver<portalshot_core::CaptureEvent>),
    portalshot_core::CaptureError,
> {
    use std::sync::Arc;

    config.validate()?;
    let service = CaptureService::new();
    let broker: Option<Arc<dyn Broker>> = match portal::PortalBroker::connect(service.response_sink()).await {
        Ok(broker) => Some(Arc::new(broker)),
        Err(e) => {
            tracing::warn!("Screen-cast portal unavailable: {}", e);
            None
        }
    };
    Ok(service.spawn(broker, Arc::new(gst_pipeline::GstPipelineFactory), config))
}
