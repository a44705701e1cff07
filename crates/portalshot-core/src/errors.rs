use thiserror::Error;

use crate::types::CaptureStep;

/// Every way a capture attempt can end without a frame.
///
/// Cloneable because it is delivered to the consumer inside
/// [`CaptureEvent::Failed`](crate::CaptureEvent::Failed).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Screen-cast broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    #[error("{step} call failed: {reason}")]
    CallFailed { step: CaptureStep, reason: String },

    #[error("{step} request failed with response code {code} ({})", response_meaning(.code))]
    RequestFailed { step: CaptureStep, code: i64 },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Invalid stream descriptor: {reason}")]
    InvalidStreamDescriptor { reason: String },

    #[error("Pipeline failed to start: {reason}")]
    PipelineStartFailed { reason: String },

    #[error("Received incomplete frame buffer: {actual} bytes, expected at least {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("Failed to retrieve sample: {reason}")]
    SampleRetrievalFailed { reason: String },

    #[error("Pipeline error: {reason}")]
    PipelineFailed { reason: String },

    #[error("Pipeline reached end of stream before a frame arrived")]
    EndOfStream,

    #[error("Timed out after {after_ms}ms waiting for {stage}")]
    Timeout { stage: String, after_ms: u64 },

    #[error("Configuration invalid: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("Capture service is no longer running")]
    ServiceStopped,
}

/// Human-readable meaning of a portal `Response` code.
pub fn describe_response_code(code: i64) -> &'static str {
    match code {
        0 => "success",
        1 => "cancelled by the user",
        2 => "ended by the broker",
        _ => "unknown",
    }
}

fn response_meaning(code: &i64) -> &'static str {
    describe_response_code(*code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_failure_names_step_and_code() {
        let err = CaptureError::RequestFailed { step: CaptureStep::CreateSession, code: 1 };
        let text = err.to_string();
        assert!(text.contains("CreateSession"), "{text}");
        assert!(text.contains("code 1"), "{text}");
        assert!(text.contains("cancelled"), "{text}");
    }

    #[test]
    fn short_buffer_reports_sizes() {
        let err = CaptureError::ShortBuffer { expected: 15_000, actual: 14_999 };
        assert_eq!(
            err.to_string(),
            "Received incomplete frame buffer: 14999 bytes, expected at least 15000"
        );
    }
}
