use std::os::fd::OwnedFd;

use async_trait::async_trait;
use portalshot_core::CaptureError;
use tokio::sync::mpsc;

use crate::negotiator::EngineEvent;
use crate::protocol::{
    BrokerResponse, CreateSessionOptions, RequestHandle, SelectSourcesOptions, SessionHandle,
    StartOptions,
};

// MARK: - Broker trait

/// The privileged service that mediates access to screen content.
///
/// Request methods return the correlation handle of the issued request; its
/// single completion event arrives later through the [`ResponseSink`] the
/// implementation was given.
///
/// Implementations:
/// - `PortalBroker`: xdg-desktop-portal ScreenCast over the session bus
#[async_trait]
pub trait Broker: Send + Sync {
    async fn create_session(&self, options: CreateSessionOptions) -> Result<RequestHandle, CaptureError>;

    async fn select_sources(
        &self,
        session: &SessionHandle,
        options: SelectSourcesOptions,
    ) -> Result<RequestHandle, CaptureError>;

    async fn start(&self, session: &SessionHandle, options: StartOptions) -> Result<RequestHandle, CaptureError>;

    /// File descriptor of a media-transport remote scoped to `session`.
    ///
    /// `None` means the pipeline should connect to the default remote.
    async fn open_pipewire_remote(&self, _session: &SessionHandle) -> Result<Option<OwnedFd>, CaptureError> {
        Ok(None)
    }

    /// Close the broker-side session. Parameterless `Close` on its handle.
    async fn close_session(&self, session: &SessionHandle) -> Result<(), CaptureError>;
}

// MARK: - ResponseSink

/// Queue into the capture engine for broker completion events.
///
/// Sending never blocks; events are processed in arrival order on the
/// engine's task.
#[derive(Clone, Debug)]
pub struct ResponseSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ResponseSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Returns `false` once the engine has gone away.
    pub fn deliver(&self, response: BrokerResponse) -> bool {
        self.tx.send(EngineEvent::Response(response)).is_ok()
    }
}
