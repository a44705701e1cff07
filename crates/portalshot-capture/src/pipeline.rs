//! `PipelineController`: one-shot decode of a single frame.
//!
//! # Pipeline
//!
//! ```text
//! source(node id [, remote fd])
//!        │
//!  format-convert
//!        │
//!  sink(format=RGB, max-buffered=1, drop-extra=true) ──► FrameSink ──► engine
//! ```
//!
//! The pipeline itself lives behind [`PipelineFactory`] / [`FramePipeline`];
//! the controller owns at most one instance and turns the first sample into
//! a tightly packed [`FrameBuffer`] with [`extract_frame`].

use std::ops::Deref;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use bytes::Bytes;
use portalshot_core::{CaptureError, FrameBuffer, PixelFormat};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::negotiator::EngineEvent;

// ── Seams ─────────────────────────────────────────────────────────────────────

/// Where the pipeline source should attach.
#[derive(Debug)]
pub struct StreamTarget {
    pub node_id: u32,
    /// Remote obtained from the broker; `None` uses the default connection.
    pub remote:  Option<OwnedFd>,
}

/// Result of activating a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Activated synchronously.
    Playing,
    /// Activation continues asynchronously.
    Pending,
}

/// A built, not yet running, one-shot pipeline.
pub trait FramePipeline: Send + Sync {
    fn run(&mut self) -> Result<RunState, CaptureError>;

    /// Deactivate. Must be safe to call more than once.
    fn stop(&mut self);
}

/// Builds pipelines bound to a negotiated stream.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, target: StreamTarget, sink: FrameSink) -> Result<Box<dyn FramePipeline>, CaptureError>;
}

/// One decoded sample as handed over by the pipeline sink.
pub trait VideoSample: Send {
    /// `(width, height)` from the negotiated stream format.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Bytes between row starts; `None` means rows are tightly packed.
    fn stride(&self) -> Option<usize> {
        None
    }

    /// Read access to the sample's buffer.
    fn bytes(&self) -> Option<SampleBytes<'_>>;
}

/// Borrowed view of a sample buffer.
pub struct SampleBytes<'a>(Box<dyn Deref<Target = [u8]> + 'a>);

impl<'a> SampleBytes<'a> {
    pub fn new(bytes: impl Deref<Target = [u8]> + 'a) -> Self {
        Self(Box::new(bytes))
    }
}

impl Deref for SampleBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &**self.0
    }
}

// ── Pipeline events ───────────────────────────────────────────────────────────

pub enum PipelineEvent {
    Sample(Box<dyn VideoSample>),
    /// The sink signalled a sample but none could be pulled.
    RetrievalFailed(String),
    Error(String),
    EndOfStream,
}

impl std::fmt::Debug for PipelineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sample(s) => write!(f, "Sample({:?})", s.dimensions()),
            Self::RetrievalFailed(r) => write!(f, "RetrievalFailed({r})"),
            Self::Error(e) => write!(f, "Error({e})"),
            Self::EndOfStream => write!(f, "EndOfStream"),
        }
    }
}

/// Thread-safe handle the pipeline uses to report back to the engine.
///
/// Tagged with the attempt generation so events from a torn-down pipeline
/// are recognisable and dropped.
#[derive(Clone, Debug)]
pub struct FrameSink {
    generation: u64,
    tx:         mpsc::UnboundedSender<EngineEvent>,
}

impl FrameSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sample(&self, sample: Box<dyn VideoSample>) -> bool {
        self.send(PipelineEvent::Sample(sample))
    }

    pub fn retrieval_failed(&self, reason: impl Into<String>) -> bool {
        self.send(PipelineEvent::RetrievalFailed(reason.into()))
    }

    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.send(PipelineEvent::Error(reason.into()))
    }

    pub fn end_of_stream(&self) -> bool {
        self.send(PipelineEvent::EndOfStream)
    }

    fn send(&self, event: PipelineEvent) -> bool {
        self.tx
            .send(EngineEvent::Pipeline { generation: self.generation, event })
            .is_ok()
    }
}

// ── PipelineController ────────────────────────────────────────────────────────

pub struct PipelineController {
    factory: Arc<dyn PipelineFactory>,
    active:  Option<Box<dyn FramePipeline>>,
}

impl PipelineController {
    pub fn new(factory: Arc<dyn PipelineFactory>) -> Self {
        Self { factory, active: None }
    }

    /// Build a pipeline for `target`, replacing any previous one.
    pub fn build(&mut self, target: StreamTarget, sink: FrameSink) -> Result<(), CaptureError> {
        self.stop();
        let node_id = target.node_id;
        let pipeline = self.factory.build(target, sink)?;
        debug!("Pipeline built for node {}", node_id);
        self.active = Some(pipeline);
        Ok(())
    }

    /// Activate the built pipeline.
    pub fn run(&mut self) -> Result<RunState, CaptureError> {
        let pipeline = self.active.as_mut().ok_or_else(|| CaptureError::PipelineStartFailed {
            reason: "no pipeline has been built".into(),
        })?;
        let state = pipeline.run()?;
        match state {
            RunState::Playing => info!("Pipeline playing"),
            RunState::Pending => info!("Pipeline activation continues asynchronously"),
        }
        Ok(state)
    }

    /// Deactivate and discard the pipeline. Returns whether one existed.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(mut pipeline) => {
                pipeline.stop();
                debug!("Pipeline stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

// ── Frame extraction ──────────────────────────────────────────────────────────

fn retrieval(reason: impl Into<String>) -> CaptureError {
    CaptureError::SampleRetrievalFailed { reason: reason.into() }
}

/// Copy exactly one tightly packed RGB frame out of `sample`.
///
/// A buffer holding fewer bytes than the frame needs is a
/// [`CaptureError::ShortBuffer`]; a truncated frame is never produced.
pub fn extract_frame(sample: &dyn VideoSample) -> Result<FrameBuffer, CaptureError> {
    let (width, height) = sample
        .dimensions()
        .ok_or_else(|| retrieval("sample carries no video format"))?;
    let expected = FrameBuffer::packed_len(width, height)
        .ok_or_else(|| retrieval(format!("{width}×{height} frame is too large")))?;
    if expected == 0 {
        return Err(retrieval(format!("{width}×{height} frame is empty")));
    }

    let row = width as usize * PixelFormat::Rgb.bytes_per_pixel();
    let stride = sample.stride().unwrap_or(row);
    if stride < row {
        return Err(retrieval(format!("row stride {stride} is shorter than a {row}-byte row")));
    }
    let required = stride
        .checked_mul(height as usize - 1)
        .and_then(|n| n.checked_add(row))
        .ok_or_else(|| retrieval(format!("stride {stride} overflows a {height}-row frame")))?;

    let bytes = sample
        .bytes()
        .ok_or_else(|| retrieval("sample buffer could not be mapped"))?;
    if bytes.len() < required {
        return Err(CaptureError::ShortBuffer { expected: required, actual: bytes.len() });
    }

    let data = if stride == row {
        Bytes::copy_from_slice(&bytes[..expected])
    } else {
        let mut packed = Vec::with_capacity(expected);
        for line in bytes.chunks(stride).take(height as usize) {
            packed.extend_from_slice(&line[..row]);
        }
        Bytes::from(packed)
    };

    Ok(FrameBuffer { width, height, format: PixelFormat::Rgb, data })
}
