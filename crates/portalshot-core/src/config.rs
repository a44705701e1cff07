use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::CaptureError;
use crate::types::SourceKind;

/// Configuration of the capture engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Source kinds offered in the broker's picker.
    #[serde(alias = "sourceTypes")]
    pub source_types: Vec<SourceKind>,
    /// Prefix of the session and request tokens handed to the broker.
    #[serde(alias = "tokenPrefix")]
    pub token_prefix: String,
    /// How long to wait for each broker `Response`. `None` waits forever.
    #[serde(alias = "responseTimeoutMs")]
    pub response_timeout_ms: Option<u64>,
    /// How long each broker method call may take to return its handle.
    #[serde(alias = "callTimeoutMs")]
    pub call_timeout_ms: u64,
    /// How long the running pipeline may take to produce its first sample.
    #[serde(alias = "frameTimeoutMs")]
    pub frame_timeout_ms: u64,
    /// Bind the pipeline to a PipeWire remote obtained from the broker.
    #[serde(alias = "openPipewireRemote")]
    pub open_pipewire_remote: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source_types:         vec![SourceKind::Monitor, SourceKind::Window],
            token_prefix:         "portalshot".to_owned(),
            response_timeout_ms:  Some(120_000),
            call_timeout_ms:      10_000,
            frame_timeout_ms:     10_000,
            open_pipewire_remote: true,
        }
    }
}

impl CaptureConfig {
    /// `types` bitmask for SelectSources.
    pub fn source_mask(&self) -> u32 {
        SourceKind::mask(&self.source_types)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Tokens end up as D-Bus object path elements, so only `[A-Za-z0-9_]`.
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.token_prefix.is_empty()
            || !self.token_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CaptureError::ConfigurationInvalid {
                reason: format!("token prefix '{}' must be non-empty [A-Za-z0-9_]", self.token_prefix),
            });
        }
        if self.source_types.is_empty() {
            return Err(CaptureError::ConfigurationInvalid {
                reason: "at least one source type is required".into(),
            });
        }
        Ok(())
    }
}
