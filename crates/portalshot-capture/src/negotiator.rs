//! `SessionNegotiator`: the capture state machine.
//!
//! # Handshake
//!
//! ```text
//! start_capture()
//!   │  CreateSession {session_handle_token}
//!   ▼
//! CREATING ─────────(0, {session_handle})──► SESSION_READY
//!                                              │  SelectSources {multiple, types, handle_token}
//!                                              ▼
//! SESSION_READY ────(0, {})────────────────► SOURCES_SELECTED
//!                                              │  Start {handle_token}
//!                                              ▼
//! SOURCES_SELECTED ─(0, {streams})─────────► STREAM_READY ──► pipeline ──► CAPTURED
//!
//! any non-zero code / error / deadline ────► FAILED ──► cleanup ──► Failed event
//! ```
//!
//! Exactly one attempt is live at a time. The next request is only issued
//! once the previous one's response has been routed back, and every exit
//! path goes through [`SessionNegotiator::cleanup`] before the consumer is
//! told.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use portalshot_core::{CaptureConfig, CaptureError, CaptureEvent, CaptureStep, FrameBuffer};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::pipeline::{
    extract_frame, FrameSink, PipelineController, PipelineEvent, PipelineFactory, StreamTarget,
};
use crate::protocol::{
    BrokerResponse, CreateSessionOptions, RequestHandle, Results, SelectSourcesOptions,
    SessionHandle, StartOptions, StreamDescriptor, Value,
};
use crate::router::{ResponseRouter, Routed, SubscriptionId};

// ── Engine events ─────────────────────────────────────────────────────────────

/// Everything that can wake the engine besides a consumer command.
#[derive(Debug)]
pub enum EngineEvent {
    Response(BrokerResponse),
    Pipeline { generation: u64, event: PipelineEvent },
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Creating,
    SessionReady,
    SourcesSelected,
    StreamReady,
    /// A frame was delivered.
    Captured,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Captured | Self::Failed)
    }
}

/// The one request whose response is awaited.
pub(crate) struct PendingRequest {
    pub(crate) handle:       RequestHandle,
    pub(crate) step:         CaptureStep,
    pub(crate) subscription: SubscriptionId,
}

pub(crate) struct Deadline {
    at:    Instant,
    stage: String,
    after: Duration,
}

impl Deadline {
    fn new(stage: impl Into<String>, after: Duration) -> Self {
        Self { at: Instant::now() + after, stage: stage.into(), after }
    }
}

/// Mutable context of one capture. Replaced wholesale per attempt.
pub(crate) struct CaptureAttempt {
    pub(crate) generation:    u64,
    pub(crate) session_token: String,
    pub(crate) session:       Option<SessionHandle>,
    pub(crate) pending:       Option<PendingRequest>,
    pub(crate) state:         NegotiationState,
    pub(crate) node_id:       Option<u32>,
    pub(crate) deadline:      Option<Deadline>,
}

impl CaptureAttempt {
    fn new(generation: u64, session_token: String) -> Self {
        Self {
            generation,
            session_token,
            session: None,
            pending: None,
            state: NegotiationState::Creating,
            node_id: None,
            deadline: None,
        }
    }
}

/// Session and request tokens: `<prefix>_sess_<pid>_<n>` / `<prefix>_req_<pid>_<n>`.
struct TokenSource {
    prefix:   String,
    pid:      u32,
    sessions: u64,
    requests: u64,
}

impl TokenSource {
    fn new(prefix: &str) -> Self {
        Self { prefix: prefix.to_owned(), pid: std::process::id(), sessions: 0, requests: 0 }
    }

    fn session(&mut self) -> String {
        self.sessions += 1;
        format!("{}_sess_{}_{}", self.prefix, self.pid, self.sessions)
    }

    fn request(&mut self) -> String {
        self.requests += 1;
        format!("{}_req_{}_{}", self.prefix, self.pid, self.requests)
    }
}

fn violation(reason: impl Into<String>) -> CaptureError {
    CaptureError::ProtocolViolation { reason: reason.into() }
}

/// Run a broker call under a deadline.
pub(crate) async fn bounded<T>(
    stage: impl std::fmt::Display,
    limit: Duration,
    call: impl Future<Output = Result<T, CaptureError>>,
) -> Result<T, CaptureError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| CaptureError::Timeout {
            stage:    format!("{stage} call"),
            after_ms: limit.as_millis() as u64,
        })?
}

// ── SessionNegotiator ─────────────────────────────────────────────────────────

pub struct SessionNegotiator {
    pub(crate) broker:   Option<Arc<dyn Broker>>,
    pub(crate) config:   CaptureConfig,
    pub(crate) router:   ResponseRouter,
    pub(crate) pipeline: PipelineController,
    pub(crate) attempt:  Option<CaptureAttempt>,
    events:     mpsc::UnboundedSender<EngineEvent>,
    notifier:   mpsc::UnboundedSender<CaptureEvent>,
    tokens:     TokenSource,
    generation: u64,
}

impl SessionNegotiator {
    /// `broker` is `None` when no broker connection could be established;
    /// every capture then fails with [`CaptureError::BrokerUnavailable`].
    pub fn new(
        broker: Option<Arc<dyn Broker>>,
        pipelines: Arc<dyn PipelineFactory>,
        config: CaptureConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
        notifier: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Self {
        let tokens = TokenSource::new(&config.token_prefix);
        Self {
            broker,
            config,
            router: ResponseRouter::new(),
            pipeline: PipelineController::new(pipelines),
            attempt: None,
            events,
            notifier,
            tokens,
            generation: 0,
        }
    }

    // ── Inspection ────────────────────────────────────────────────────────

    /// State of the live attempt, `None` between attempts.
    pub fn state(&self) -> Option<NegotiationState> {
        self.attempt.as_ref().map(|a| a.state)
    }

    pub fn is_idle(&self) -> bool {
        self.attempt.is_none() && !self.pipeline.is_active() && self.router.live_count() == 0
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.attempt.as_ref()?.session.as_ref()
    }

    pub fn node_id(&self) -> Option<u32> {
        self.attempt.as_ref()?.node_id
    }

    pub fn live_subscriptions(&self) -> usize {
        self.router.live_count()
    }

    pub fn pipeline_active(&self) -> bool {
        self.pipeline.is_active()
    }

    /// Generation of the most recent attempt (1-based, 0 before the first).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When the live attempt gives up waiting, if it is waiting at all.
    pub fn deadline(&self) -> Option<Instant> {
        self.attempt.as_ref()?.deadline.as_ref().map(|d| d.at)
    }

    // ── Entry point ───────────────────────────────────────────────────────

    /// Begin a new capture, superseding any attempt still in flight.
    pub async fn start_capture(&mut self) {
        if self.broker.is_none() {
            let error = CaptureError::BrokerUnavailable {
                reason: "no connection to the screen-cast broker".into(),
            };
            warn!("Capture not started: {}", error);
            self.notify(CaptureEvent::Failed(error));
            return;
        }

        if let Some(stale) = &self.attempt {
            info!("Superseding capture attempt #{} ({:?})", stale.generation, stale.state);
        }
        self.cleanup().await;

        self.generation += 1;
        let attempt = CaptureAttempt::new(self.generation, self.tokens.session());
        info!("Capture attempt #{} started (session token {})", attempt.generation, attempt.session_token);
        self.attempt = Some(attempt);

        self.advance(CaptureStep::CreateSession).await;
    }

    // ── Event dispatch ────────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Response(response) => self.on_response(response).await,
            EngineEvent::Pipeline { generation, event } => self.on_pipeline_event(generation, event).await,
        }
    }

    /// Route one broker completion event into the state machine.
    pub async fn on_response(&mut self, response: BrokerResponse) {
        let delivery = match self.router.route(response) {
            Routed::Delivered(delivery) => delivery,
            Routed::Unmatched(handle) => {
                debug!("Ignoring Response on {} (no live subscription)", handle);
                return;
            }
        };

        let Some(attempt) = self.attempt.as_mut() else {
            debug!("Ignoring Response on {} (no capture attempt)", delivery.handle);
            return;
        };
        match attempt.pending.take() {
            Some(pending) if pending.subscription == delivery.subscription => {
                debug!("Request {} ({}) answered", pending.handle, pending.step);
            }
            other => {
                attempt.pending = other;
                warn!("Response on {} does not answer the pending request", delivery.handle);
                return;
            }
        }
        attempt.deadline = None;
        let state = attempt.state;

        let (code, results) = match delivery.outcome {
            Ok(outcome) => outcome,
            Err(error) => return self.fail(error).await,
        };
        debug!("{} Response: code={} results={:?}", delivery.step, code, results);
        if code != 0 {
            return self.fail(CaptureError::RequestFailed { step: delivery.step, code }).await;
        }

        match (state, delivery.step) {
            (NegotiationState::Creating, CaptureStep::CreateSession) => self.on_session_created(results).await,
            (NegotiationState::SessionReady, CaptureStep::SelectSources) => self.on_sources_selected(results).await,
            (NegotiationState::SourcesSelected, CaptureStep::Start) => self.on_started(results).await,
            (state, step) => self.fail(violation(format!("unexpected {step} Response while {state:?}"))).await,
        }
    }

    /// Handle a sample, error or end-of-stream from the pipeline.
    pub async fn on_pipeline_event(&mut self, generation: u64, event: PipelineEvent) {
        let current = self
            .attempt
            .as_ref()
            .is_some_and(|a| a.generation == generation && a.state == NegotiationState::StreamReady);
        if !current {
            debug!("Dropping {:?} from pipeline generation {}", event, generation);
            return;
        }

        match event {
            PipelineEvent::Sample(sample) => match extract_frame(&*sample) {
                Ok(frame) => self.succeed(frame).await,
                Err(error) => self.fail(error).await,
            },
            PipelineEvent::RetrievalFailed(reason) => {
                self.fail(CaptureError::SampleRetrievalFailed { reason }).await
            }
            PipelineEvent::Error(reason) => self.fail(CaptureError::PipelineFailed { reason }).await,
            PipelineEvent::EndOfStream => self.fail(CaptureError::EndOfStream).await,
        }
    }

    /// The live attempt's deadline passed.
    pub async fn on_deadline(&mut self) {
        let Some(deadline) = self.attempt.as_mut().and_then(|a| a.deadline.take()) else {
            return;
        };
        self.fail(CaptureError::Timeout {
            stage:    deadline.stage,
            after_ms: deadline.after.as_millis() as u64,
        })
        .await;
    }

    // ── Transitions ───────────────────────────────────────────────────────

    async fn on_session_created(&mut self, results: Results) {
        let Some(session) = results.get("session_handle").and_then(Value::as_str).map(SessionHandle::new) else {
            return self.fail(violation("CreateSession response lacks a string `session_handle`")).await;
        };
        info!("Session created: {}", session);
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.session = Some(session);
            attempt.state = NegotiationState::SessionReady;
        }
        self.advance(CaptureStep::SelectSources).await;
    }

    async fn on_sources_selected(&mut self, results: Results) {
        if results.contains_key("streams") {
            debug!("Ignoring `streams` in SelectSources response");
        }
        info!("Sources selected");
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.state = NegotiationState::SourcesSelected;
        }
        self.advance(CaptureStep::Start).await;
    }

    async fn on_started(&mut self, results: Results) {
        let Some(streams) = results.get("streams") else {
            return self.fail(violation("Start response lacks `streams`")).await;
        };
        let (descriptor, count) = match StreamDescriptor::first_of(streams) {
            Ok(parsed) => parsed,
            Err(error) => return self.fail(error).await,
        };
        if count > 1 {
            info!("Broker reported {} streams; using the first", count);
        }

        let node_id = descriptor.node_id;
        let Some(attempt) = self.attempt.as_mut() else { return };
        attempt.node_id = Some(node_id);
        attempt.state = NegotiationState::StreamReady;
        let generation = attempt.generation;
        let session = attempt.session.clone();
        info!("Stream ready: node {} {:?}", node_id, descriptor.properties);

        if let Err(error) = self.start_pipeline(generation, node_id, session).await {
            self.fail(error).await;
        }
    }

    async fn start_pipeline(
        &mut self,
        generation: u64,
        node_id: u32,
        session: Option<SessionHandle>,
    ) -> Result<(), CaptureError> {
        let remote = match (&self.broker, session) {
            (Some(broker), Some(session)) if self.config.open_pipewire_remote => {
                bounded("OpenPipeWireRemote", self.config.call_timeout(), broker.open_pipewire_remote(&session))
                    .await?
            }
            _ => None,
        };

        let sink = FrameSink::new(generation, self.events.clone());
        self.pipeline.build(StreamTarget { node_id, remote }, sink)?;
        self.pipeline.run()?;

        let deadline = Deadline::new("first frame", self.config.frame_timeout());
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.deadline = Some(deadline);
        }
        Ok(())
    }

    async fn advance(&mut self, step: CaptureStep) {
        if let Err(error) = self.issue(step).await {
            self.fail(error).await;
        }
    }

    /// Issue the request for `step` and subscribe to its response.
    async fn issue(&mut self, step: CaptureStep) -> Result<(), CaptureError> {
        let broker = self.broker.clone().ok_or_else(|| CaptureError::BrokerUnavailable {
            reason: "no connection to the screen-cast broker".into(),
        })?;
        let attempt = self.attempt.as_ref().ok_or_else(|| violation("no capture attempt in progress"))?;
        let limit = self.config.call_timeout();

        let handle = match step {
            CaptureStep::CreateSession => {
                let options = CreateSessionOptions { session_handle_token: attempt.session_token.clone() };
                debug!("CreateSession {:?}", options);
                bounded(step, limit, broker.create_session(options)).await?
            }
            CaptureStep::SelectSources => {
                let session = attempt.session.clone().ok_or_else(|| violation("SelectSources before a session exists"))?;
                let options = SelectSourcesOptions {
                    multiple:     false,
                    types:        self.config.source_mask(),
                    handle_token: self.tokens.request(),
                };
                debug!("SelectSources on {} {:?}", session, options);
                bounded(step, limit, broker.select_sources(&session, options)).await?
            }
            CaptureStep::Start => {
                let session = attempt.session.clone().ok_or_else(|| violation("Start before a session exists"))?;
                let options = StartOptions { handle_token: self.tokens.request() };
                debug!("Start on {} {:?}", session, options);
                bounded(step, limit, broker.start(&session, options)).await?
            }
        };

        let subscription = self.router.subscribe(handle.clone(), step);
        let deadline = self
            .config
            .response_timeout()
            .map(|after| Deadline::new(format!("{step} response"), after));
        match self.attempt.as_mut() {
            Some(attempt) => {
                if let Some(stale) = attempt.pending.replace(PendingRequest { handle, step, subscription }) {
                    warn!("Request {} superseded before its response", stale.handle);
                    self.router.unsubscribe(Some(stale.subscription));
                }
                attempt.deadline = deadline;
                Ok(())
            }
            None => {
                self.router.unsubscribe(Some(subscription));
                Err(violation("capture attempt vanished while issuing a request"))
            }
        }
    }

    // ── Terminal paths ────────────────────────────────────────────────────

    async fn succeed(&mut self, frame: FrameBuffer) {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.state = NegotiationState::Captured;
            attempt.deadline = None;
        }
        info!("Frame captured: {}", frame);
        self.notify(CaptureEvent::Succeeded(frame));
        self.pipeline.stop();
        self.cleanup().await;
    }

    /// Fail the live attempt: cleanup first, then exactly one notification.
    async fn fail(&mut self, error: CaptureError) {
        match self.attempt.as_mut() {
            Some(attempt) if !attempt.state.is_terminal() => {
                attempt.state = NegotiationState::Failed;
                attempt.deadline = None;
            }
            _ => {
                debug!("Suppressing failure for a finished attempt: {}", error);
                return;
            }
        }
        warn!("Capture failed: {}", error);
        self.cleanup().await;
        self.notify(CaptureEvent::Failed(error));
    }

    fn notify(&self, event: CaptureEvent) {
        if self.notifier.send(event).is_err() {
            warn!("Capture consumer has gone away; dropping notification");
        }
    }
}
