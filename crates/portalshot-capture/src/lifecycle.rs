//! Teardown of a capture attempt.
//!
//! Reachable from every state, including before the first request was
//! issued, and idempotent: a second call finds nothing left to release and
//! issues no broker call.

use tracing::{debug, info, warn};

use crate::negotiator::{bounded, SessionNegotiator};
use crate::protocol::SessionHandle;

impl SessionNegotiator {
    /// Release everything the current attempt holds.
    ///
    /// 1. drop the pending response subscription
    /// 2. deactivate and discard the pipeline
    /// 3. best-effort `Close` of the broker session (errors are logged only)
    /// 4. forget the attempt
    pub async fn cleanup(&mut self) {
        let mut attempt = self.attempt.take();

        let pending = attempt.as_mut().and_then(|a| a.pending.take());
        self.router.unsubscribe(pending.map(|p| p.subscription));
        let stray = self.router.clear();
        if stray > 0 {
            warn!("Dropped {} stray response subscription(s)", stray);
        }

        if self.pipeline.stop() {
            debug!("Pipeline released");
        }

        if let Some(session) = attempt.and_then(|a| a.session) {
            self.close_session(session).await;
        }
    }

    async fn close_session(&self, session: SessionHandle) {
        let Some(broker) = &self.broker else {
            warn!("No broker connection to close session {}", session);
            return;
        };
        match bounded("Close", self.config.call_timeout(), broker.close_session(&session)).await {
            Ok(()) => info!("Closed session {}", session),
            Err(e) => warn!("Closing session {} failed: {}", session, e),
        }
    }
}
