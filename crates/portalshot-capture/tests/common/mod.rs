//! In-memory broker and pipeline used by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portalshot_capture::pipeline::{RunState, SampleBytes, StreamTarget};
use portalshot_capture::protocol::{
    BrokerResponse, CreateSessionOptions, RequestHandle, SelectSourcesOptions, SessionHandle,
    StartOptions, Variant,
};
use portalshot_capture::{
    Broker, EngineEvent, FramePipeline, FrameSink, PipelineFactory, ResponseSink, SessionNegotiator,
    VideoSample,
};
use portalshot_core::{CaptureConfig, CaptureError, CaptureEvent, CaptureStep};
use tokio::sync::mpsc;

pub const SESSION: &str = "/s/1";

// ── FakeBroker ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    CreateSession { token: String },
    SelectSources { session: String, types: u32, multiple: bool, token: String },
    Start { session: String, token: String },
    OpenRemote { session: String },
    Close { session: String },
}

/// Records every call; answers only when scripted.
#[derive(Default)]
pub struct FakeBroker {
    calls:      Mutex<Vec<BrokerCall>>,
    requests:   AtomicU64,
    last:       Mutex<Option<RequestHandle>>,
    fail_close: bool,
    /// Calls for this step never return.
    hang_on:    Option<CaptureStep>,
    /// Calls for this step return an error instead of a handle.
    reject:     Option<CaptureStep>,
    /// Answers queued straight into the engine from inside the call.
    script:     Option<(ResponseSink, Mutex<VecDeque<(u32, Vec<(String, Variant)>)>>)>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_close() -> Self {
        Self { fail_close: true, ..Self::default() }
    }

    pub fn hanging_on(step: CaptureStep) -> Self {
        Self { hang_on: Some(step), ..Self::default() }
    }

    pub fn rejecting(step: CaptureStep) -> Self {
        Self { reject: Some(step), ..Self::default() }
    }

    /// Answer each request, in order, with the next scripted response.
    pub fn scripted(sink: ResponseSink, responses: Vec<(u32, Vec<(String, Variant)>)>) -> Self {
        Self { script: Some((sink, Mutex::new(responses.into()))), ..Self::default() }
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, BrokerCall::Close { .. })).count()
    }

    pub fn count(&self, pred: impl Fn(&BrokerCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    /// Handle returned by the most recent request.
    pub fn last_request(&self) -> RequestHandle {
        self.last.lock().unwrap().clone().expect("no request issued yet")
    }

    async fn request(&self, step: CaptureStep, call: BrokerCall) -> Result<RequestHandle, CaptureError> {
        self.calls.lock().unwrap().push(call);
        if self.hang_on == Some(step) {
            std::future::pending::<()>().await;
        }
        if self.reject == Some(step) {
            return Err(CaptureError::CallFailed { step, reason: "access denied".into() });
        }

        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = RequestHandle::new(format!("/org/freedesktop/portal/desktop/request/1_1/r{n}"));
        *self.last.lock().unwrap() = Some(handle.clone());

        if let Some((sink, responses)) = &self.script {
            if let Some((code, results)) = responses.lock().unwrap().pop_front() {
                sink.deliver(BrokerResponse::new(handle.clone(), code, results));
            }
        }
        Ok(handle)
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn create_session(&self, options: CreateSessionOptions) -> Result<RequestHandle, CaptureError> {
        let call = BrokerCall::CreateSession { token: options.session_handle_token };
        self.request(CaptureStep::CreateSession, call).await
    }

    async fn select_sources(
        &self,
        session: &SessionHandle,
        options: SelectSourcesOptions,
    ) -> Result<RequestHandle, CaptureError> {
        let call = BrokerCall::SelectSources {
            session:  session.as_str().to_owned(),
            types:    options.types,
            multiple: options.multiple,
            token:    options.handle_token,
        };
        self.request(CaptureStep::SelectSources, call).await
    }

    async fn start(&self, session: &SessionHandle, options: StartOptions) -> Result<RequestHandle, CaptureError> {
        let call = BrokerCall::Start { session: session.as_str().to_owned(), token: options.handle_token };
        self.request(CaptureStep::Start, call).await
    }

    async fn open_pipewire_remote(
        &self,
        session: &SessionHandle,
    ) -> Result<Option<std::os::fd::OwnedFd>, CaptureError> {
        self.calls.lock().unwrap().push(BrokerCall::OpenRemote { session: session.as_str().to_owned() });
        Ok(None)
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<(), CaptureError> {
        self.calls.lock().unwrap().push(BrokerCall::Close { session: session.as_str().to_owned() });
        if self.fail_close {
            return Err(CaptureError::BrokerUnavailable { reason: "session already gone".into() });
        }
        Ok(())
    }
}

// ── FakePipelines ─────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePipelines {
    built:       Mutex<Vec<u32>>,
    sinks:       Mutex<Vec<FrameSink>>,
    stops:       Arc<AtomicUsize>,
    fail_build:  bool,
    /// Emit a frame of this size as soon as the pipeline runs.
    auto_sample: Option<(u32, u32)>,
}

impl FakePipelines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail_build: true, ..Self::default() }
    }

    pub fn auto(width: u32, height: u32) -> Self {
        Self { auto_sample: Some((width, height)), ..Self::default() }
    }

    pub fn built(&self) -> Vec<u32> {
        self.built.lock().unwrap().clone()
    }

    /// Sink of the most recently built pipeline.
    pub fn sink(&self) -> FrameSink {
        self.sinks.lock().unwrap().last().cloned().expect("no pipeline built")
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl PipelineFactory for FakePipelines {
    fn build(&self, target: StreamTarget, sink: FrameSink) -> Result<Box<dyn FramePipeline>, CaptureError> {
        if self.fail_build {
            return Err(CaptureError::PipelineStartFailed { reason: "no element 'pipewiresrc'".into() });
        }
        self.built.lock().unwrap().push(target.node_id);
        self.sinks.lock().unwrap().push(sink.clone());
        Ok(Box::new(FakePipeline {
            sink,
            auto_sample: self.auto_sample,
            stops:       Arc::clone(&self.stops),
            stopped:     false,
        }))
    }
}

struct FakePipeline {
    sink:        FrameSink,
    auto_sample: Option<(u32, u32)>,
    stops:       Arc<AtomicUsize>,
    stopped:     bool,
}

impl FramePipeline for FakePipeline {
    fn run(&mut self) -> Result<RunState, CaptureError> {
        if let Some((w, h)) = self.auto_sample {
            self.sink.sample(Box::new(MemorySample::rgb(w, h)));
        }
        Ok(RunState::Playing)
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── MemorySample ──────────────────────────────────────────────────────────────

pub struct MemorySample {
    pub width:  u32,
    pub height: u32,
    pub stride: Option<usize>,
    pub data:   Vec<u8>,
}

impl MemorySample {
    /// Packed frame whose byte at offset `i` is `i % 251`.
    pub fn rgb(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 3;
        Self { width, height, stride: None, data: (0..len).map(|i| (i % 251) as u8).collect() }
    }

    pub fn truncated(width: u32, height: u32, len: usize) -> Self {
        Self { width, height, stride: None, data: vec![0; len] }
    }
}

impl VideoSample for MemorySample {
    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn stride(&self) -> Option<usize> {
        self.stride
    }

    fn bytes(&self) -> Option<SampleBytes<'_>> {
        Some(SampleBytes::new(self.data.as_slice()))
    }
}

// ── Response bodies ───────────────────────────────────────────────────────────

pub fn session_created(session: &str) -> Vec<(String, Variant)> {
    vec![("session_handle".to_owned(), Variant::Str(session.to_owned()))]
}

/// `streams` result: one `(node id, properties)` entry per node.
pub fn streams(nodes: &[u32]) -> Vec<(String, Variant)> {
    let entries = nodes
        .iter()
        .map(|node| {
            Variant::Struct(vec![
                Variant::UInt32(*node),
                Variant::Dict(vec![(
                    Variant::Str("source_type".into()),
                    Variant::UInt32(1).boxed(),
                )]),
            ])
        })
        .collect();
    vec![("streams".to_owned(), Variant::Array(entries))]
}

pub fn streams_raw(entries: Vec<Variant>) -> Vec<(String, Variant)> {
    vec![("streams".to_owned(), Variant::Array(entries))]
}

// ── Harness ───────────────────────────────────────────────────────────────────

/// A negotiator driven step by step, without the service loop.
pub struct Harness {
    pub negotiator: SessionNegotiator,
    pub broker:     Arc<FakeBroker>,
    pub pipelines:  Arc<FakePipelines>,
    events:         mpsc::UnboundedReceiver<EngineEvent>,
    outcomes:       mpsc::UnboundedReceiver<CaptureEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeBroker::new(), FakePipelines::new(), CaptureConfig::default())
    }

    pub fn with(broker: FakeBroker, pipelines: FakePipelines, config: CaptureConfig) -> Self {
        let broker = Arc::new(broker);
        let pipelines = Arc::new(pipelines);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let negotiator = SessionNegotiator::new(
            Some(broker.clone() as Arc<dyn Broker>),
            pipelines.clone(),
            config,
            events_tx,
            outcomes_tx,
        );
        Self { negotiator, broker, pipelines, events, outcomes }
    }

    /// Answer the most recent request.
    pub async fn respond(&mut self, code: u32, results: Vec<(String, Variant)>) {
        let handle = self.broker.last_request();
        self.negotiator.on_response(BrokerResponse::new(handle, code, results)).await;
    }

    /// Feed every queued engine event (pipeline output) to the negotiator.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.negotiator.handle_event(event).await;
        }
    }

    /// Drive a fresh capture up to a running pipeline on `node`.
    pub async fn negotiate(&mut self, node: u32) {
        self.negotiator.start_capture().await;
        self.respond(0, session_created(SESSION)).await;
        self.respond(0, vec![]).await;
        self.respond(0, streams(&[node])).await;
    }

    /// Terminal notifications received so far.
    pub fn outcomes(&mut self) -> Vec<CaptureEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.outcomes.try_recv() {
            out.push(event);
        }
        out
    }

    pub fn single_failure(&mut self) -> CaptureError {
        match self.outcomes().as_slice() {
            [CaptureEvent::Failed(error)] => error.clone(),
            other => panic!("expected exactly one failure, got {other:?}"),
        }
    }
}
