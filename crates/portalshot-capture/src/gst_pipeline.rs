//! GStreamer one-shot pipeline.
//!
//! ```text
//!  pipewiresrc (fd, path=node) ─► videoconvert ─► video/x-raw,format=RGB ─► appsink
//!                                                                              │
//!                           first sample only, later samples are refused ◄─────┘
//!                                                                              │
//!  bus watcher thread ── Error / EOS ──► FrameSink ──► engine loop ◄───────────┘
//! ```
//!
//! The appsink keeps at most one buffer and drops the rest, so the engine
//! always receives the most recent frame available when it asks.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSinkCallbacks};
use gstreamer_video::VideoInfo;
use portalshot_core::CaptureError;
use tracing::{debug, error, info, warn};

use crate::pipeline::{
    FramePipeline, FrameSink, PipelineFactory, RunState, SampleBytes, StreamTarget, VideoSample,
};

const BUS_POLL: gst::ClockTime = gst::ClockTime::from_mseconds(200);

/// Launch description for a stream node, optionally bound to a portal remote.
pub fn pipeline_description(node_id: u32, remote_fd: Option<i32>) -> String {
    let fd = remote_fd.map(|fd| format!("fd={fd} ")).unwrap_or_default();
    format!(
        "pipewiresrc {fd}path={node_id} do-timestamp=true \
         ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=sink max-buffers=1 drop=true sync=false emit-signals=false"
    )
}

fn start_failed(reason: impl std::fmt::Display) -> CaptureError {
    CaptureError::PipelineStartFailed { reason: reason.to_string() }
}

// MARK: - Factory

#[derive(Debug, Default, Clone, Copy)]
pub struct GstPipelineFactory;

impl PipelineFactory for GstPipelineFactory {
    fn build(&self, target: StreamTarget, sink: FrameSink) -> Result<Box<dyn FramePipeline>, CaptureError> {
        gst::init().map_err(|e| start_failed(format!("GStreamer init: {e}")))?;

        let desc = pipeline_description(target.node_id, target.remote.as_ref().map(|fd| fd.as_raw_fd()));
        debug!("GStreamer pipeline: {}", desc);

        let pipeline = gst::parse::launch(&desc)
            .map_err(|e| start_failed(format!("parsing pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| start_failed("expected a Pipeline element"))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| start_failed("appsink 'sink' not found"))?
            .downcast::<AppSink>()
            .map_err(|_| start_failed("'sink' is not an AppSink"))?;

        let delivered = Arc::new(AtomicBool::new(false));
        let frames = sink.clone();
        appsink.set_callbacks(
            AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    if delivered.swap(true, Ordering::SeqCst) {
                        return Err(gst::FlowError::Eos);
                    }
                    match appsink.pull_sample() {
                        Ok(sample) => {
                            frames.sample(Box::new(GstSample(sample)));
                            Ok(gst::FlowSuccess::Ok)
                        }
                        Err(e) => {
                            frames.retrieval_failed(format!("pull_sample: {e}"));
                            Err(gst::FlowError::Error)
                        }
                    }
                })
                .build(),
        );

        Ok(Box::new(GstFramePipeline {
            pipeline,
            sink,
            stopped: Arc::new(AtomicBool::new(false)),
            _remote: target.remote,
        }))
    }
}

// MARK: - Pipeline

struct GstFramePipeline {
    pipeline: gst::Pipeline,
    sink:     FrameSink,
    stopped:  Arc<AtomicBool>,
    /// Portal remote; `pipewiresrc` reads from it until the pipeline is torn down.
    _remote:  Option<OwnedFd>,
}

impl FramePipeline for GstFramePipeline {
    fn run(&mut self) -> Result<RunState, CaptureError> {
        let bus = self.pipeline.bus().ok_or_else(|| start_failed("pipeline has no bus"))?;

        let state = match self.pipeline.set_state(gst::State::Playing) {
            Ok(gst::StateChangeSuccess::Async) => RunState::Pending,
            Ok(_) => RunState::Playing,
            Err(e) => {
                let _ = self.pipeline.set_state(gst::State::Null);
                return Err(start_failed(format!("set Playing: {e}")));
            }
        };

        let sink = self.sink.clone();
        let stopped = Arc::clone(&self.stopped);
        std::thread::Builder::new()
            .name(format!("portalshot-bus-{}", sink.generation()))
            .spawn(move || watch_bus(bus, sink, stopped))
            .map_err(|e| start_failed(format!("bus watcher: {e}")))?;

        info!("Pipeline running (generation {})", self.sink.generation());
        Ok(state)
    }

    fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Pipeline did not reach NULL: {}", e);
        }
        debug!("Pipeline stopped (generation {})", self.sink.generation());
    }
}

impl Drop for GstFramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_bus(bus: gst::Bus, sink: FrameSink, stopped: Arc<AtomicBool>) {
    while !stopped.load(Ordering::SeqCst) {
        let Some(msg) = bus.timed_pop_filtered(BUS_POLL, &[gst::MessageType::Error, gst::MessageType::Eos])
        else {
            continue;
        };
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        match msg.view() {
            gst::MessageView::Error(e) => {
                let reason = match e.debug() {
                    Some(detail) => format!("{} ({})", e.error(), detail),
                    None => e.error().to_string(),
                };
                error!("GStreamer error: {}", reason);
                sink.error(reason);
                break;
            }
            gst::MessageView::Eos(_) => {
                info!("GStreamer pipeline EOS");
                sink.end_of_stream();
                break;
            }
            _ => {}
        }
    }
}

// MARK: - Sample

struct GstSample(gst::Sample);

impl GstSample {
    fn info(&self) -> Option<VideoInfo> {
        VideoInfo::from_caps(self.0.caps()?).ok()
    }
}

impl VideoSample for GstSample {
    fn dimensions(&self) -> Option<(u32, u32)> {
        self.info().map(|info| (info.width(), info.height()))
    }

    fn stride(&self) -> Option<usize> {
        let info = self.info()?;
        info.stride().first().and_then(|s| usize::try_from(*s).ok())
    }

    fn bytes(&self) -> Option<SampleBytes<'_>> {
        let map = self.0.buffer()?.map_readable().ok()?;
        Some(SampleBytes::new(map))
    }
}
