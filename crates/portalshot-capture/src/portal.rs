//! `PortalBroker`: xdg-desktop-portal ScreenCast over the session bus.
//!
//! ```text
//! org.freedesktop.portal.Desktop  /org/freedesktop/portal/desktop
//!   ScreenCast.CreateSession(a{sv})          → o request
//!   ScreenCast.SelectSources(o, a{sv})       → o request
//!   ScreenCast.Start(o, s, a{sv})            → o request
//!   ScreenCast.OpenPipeWireRemote(o, a{sv})  → h fd
//!   Request.Response(u, a{sv})               ← one signal per request
//!   Session.Close()
//! ```
//!
//! A single match rule for `Request.Response` is installed when connecting,
//! before any request is issued, so a response sent immediately after the
//! method returns is never missed. Every response is queued to the engine
//! and the router decides whether anyone is waiting for it.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use ashpd::zbus;
use ashpd::zvariant::{self, ObjectPath, OwnedObjectPath, OwnedValue, Value};
use async_trait::async_trait;
use portalshot_core::{CaptureError, CaptureStep};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::broker::{Broker, ResponseSink};
use crate::protocol::{
    BrokerResponse, CreateSessionOptions, RequestHandle, SelectSourcesOptions, SessionHandle,
    StartOptions, Variant,
};

pub const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";
pub const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/desktop";
pub const SCREENCAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
pub const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
pub const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

type Options<'a> = HashMap<&'static str, Value<'a>>;

fn unavailable(e: zbus::Error) -> CaptureError {
    CaptureError::BrokerUnavailable { reason: e.to_string() }
}

fn call_failed(step: CaptureStep) -> impl Fn(zbus::Error) -> CaptureError {
    move |e| CaptureError::CallFailed { step, reason: e.to_string() }
}

fn object_path(session: &SessionHandle) -> Result<ObjectPath<'_>, CaptureError> {
    ObjectPath::try_from(session.as_str()).map_err(|e| CaptureError::ProtocolViolation {
        reason: format!("session handle '{session}' is not an object path: {e}"),
    })
}

// ── PortalBroker ──────────────────────────────────────────────────────────────

pub struct PortalBroker {
    connection: zbus::Connection,
    screencast: zbus::Proxy<'static>,
    listener:   tokio::task::JoinHandle<()>,
}

impl PortalBroker {
    /// Connect to the session bus and start listening for `Response` signals.
    pub async fn connect(sink: ResponseSink) -> Result<Self, CaptureError> {
        let connection = zbus::Connection::session().await.map_err(unavailable)?;
        let screencast = zbus::Proxy::new(&connection, PORTAL_BUS_NAME, PORTAL_OBJECT_PATH, SCREENCAST_INTERFACE)
            .await
            .map_err(unavailable)?;

        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(PORTAL_BUS_NAME)
            .and_then(|b| b.interface(REQUEST_INTERFACE))
            .and_then(|b| b.member("Response"))
            .map_err(unavailable)?
            .build();
        let stream = zbus::MessageStream::for_match_rule(rule, &connection, None)
            .await
            .map_err(unavailable)?;
        let listener = tokio::spawn(forward_responses(stream, sink));

        info!("Screen-cast portal connected ({})", PORTAL_BUS_NAME);
        Ok(Self { connection, screencast, listener })
    }
}

impl Drop for PortalBroker {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Broker for PortalBroker {
    async fn create_session(&self, options: CreateSessionOptions) -> Result<RequestHandle, CaptureError> {
        let mut opts = Options::new();
        opts.insert("session_handle_token", Value::from(options.session_handle_token.as_str()));

        let request: OwnedObjectPath = self
            .screencast
            .call("CreateSession", &(opts,))
            .await
            .map_err(call_failed(CaptureStep::CreateSession))?;
        Ok(RequestHandle::new(request.as_str()))
    }

    async fn select_sources(
        &self,
        session: &SessionHandle,
        options: SelectSourcesOptions,
    ) -> Result<RequestHandle, CaptureError> {
        let mut opts = Options::new();
        opts.insert("multiple", Value::from(options.multiple));
        opts.insert("types", Value::from(options.types));
        opts.insert("handle_token", Value::from(options.handle_token.as_str()));

        let request: OwnedObjectPath = self
            .screencast
            .call("SelectSources", &(object_path(session)?, opts))
            .await
            .map_err(call_failed(CaptureStep::SelectSources))?;
        Ok(RequestHandle::new(request.as_str()))
    }

    async fn start(&self, session: &SessionHandle, options: StartOptions) -> Result<RequestHandle, CaptureError> {
        let mut opts = Options::new();
        opts.insert("handle_token", Value::from(options.handle_token.as_str()));

        // No parent window: empty window identifier.
        let request: OwnedObjectPath = self
            .screencast
            .call("Start", &(object_path(session)?, "", opts))
            .await
            .map_err(call_failed(CaptureStep::Start))?;
        Ok(RequestHandle::new(request.as_str()))
    }

    async fn open_pipewire_remote(&self, session: &SessionHandle) -> Result<Option<OwnedFd>, CaptureError> {
        let fd: zvariant::OwnedFd = self
            .screencast
            .call("OpenPipeWireRemote", &(object_path(session)?, Options::new()))
            .await
            .map_err(|e| CaptureError::PipelineStartFailed { reason: format!("OpenPipeWireRemote: {e}") })?;
        Ok(Some(fd.into()))
    }

    async fn close_session(&self, session: &SessionHandle) -> Result<(), CaptureError> {
        let proxy = zbus::Proxy::new(&self.connection, PORTAL_BUS_NAME, object_path(session)?, SESSION_INTERFACE)
            .await
            .map_err(unavailable)?;
        proxy
            .call_method("Close", &())
            .await
            .map_err(|e| CaptureError::BrokerUnavailable { reason: format!("Close: {e}") })?;
        Ok(())
    }
}

// ── Response listener ─────────────────────────────────────────────────────────

async fn forward_responses(mut stream: zbus::MessageStream, sink: ResponseSink) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("Response stream error: {}", e);
                continue;
            }
        };
        let header = message.header();
        let Some(path) = header.path() else { continue };
        let handle = RequestHandle::new(path.as_str());

        let body = match message.body().deserialize::<(u32, HashMap<String, OwnedValue>)>() {
            Ok((code, results)) => response_body(code, &results),
            Err(e) => {
                warn!("Undecodable Response on {}: {}", handle, e);
                Variant::Struct(Vec::new())
            }
        };
        debug!("Response signal on {}", handle);
        if !sink.deliver(BrokerResponse { handle, body }) {
            debug!("Capture engine gone; response listener exiting");
            break;
        }
    }
}

/// Wire shape of a `Response` body: `(u, a{sv})`.
fn response_body(code: u32, results: &HashMap<String, OwnedValue>) -> Variant {
    let entries = results
        .iter()
        .map(|(key, value)| (Variant::Str(key.clone()), to_variant(value).boxed()))
        .collect();
    Variant::Struct(vec![Variant::UInt32(code), Variant::Dict(entries)])
}

/// Mirror a D-Bus value into the engine's tagged [`Variant`].
pub fn to_variant(value: &Value<'_>) -> Variant {
    match value {
        Value::U8(n) => Variant::Byte(*n),
        Value::Bool(b) => Variant::Bool(*b),
        Value::I16(n) => Variant::Int16(*n),
        Value::U16(n) => Variant::UInt16(*n),
        Value::I32(n) => Variant::Int32(*n),
        Value::U32(n) => Variant::UInt32(*n),
        Value::I64(n) => Variant::Int64(*n),
        Value::U64(n) => Variant::UInt64(*n),
        Value::F64(x) => Variant::Double(*x),
        Value::Str(s) => Variant::Str(s.to_string()),
        Value::Signature(s) => Variant::Signature(s.to_string()),
        Value::ObjectPath(p) => Variant::ObjectPath(p.to_string()),
        Value::Value(inner) => to_variant(inner).boxed(),
        Value::Array(items) => Variant::Array(items.iter().map(to_variant).collect()),
        Value::Dict(dict) => Variant::Dict(dict.iter().map(|(k, v)| (to_variant(k), to_variant(v))).collect()),
        Value::Structure(fields) => Variant::Struct(fields.fields().iter().map(to_variant).collect()),
        other => {
            debug!("Unsupported D-Bus value {:?}", other);
            Variant::Str(String::new())
        }
    }
}
