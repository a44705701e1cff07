//! `ResponseRouter`: at-most-once delivery of broker completion events.
//!
//! Each subscription covers exactly one future `Response` for one request
//! handle. The subscription is removed *before* its delivery is handed to
//! the caller, so a handler that immediately issues the next request (and
//! subscribes again) can never see a duplicate of the old event. Responses
//! for handles without a live subscription, whether superseded, already
//! delivered, or never ours, are reported as [`Routed::Unmatched`].

use std::collections::HashMap;

use portalshot_core::{CaptureError, CaptureStep};
use tracing::{debug, warn};

use crate::protocol::{unwrap_body, BrokerResponse, RequestHandle, Results};

/// Identity of one live subscription.
///
/// Deliberately not `Clone`: it is consumed by [`ResponseRouter::unsubscribe`]
/// or surrendered with its [`Delivery`], so it cannot be reused.
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Subscription {
    id:   u64,
    step: CaptureStep,
}

/// The one completion event a subscription was waiting for.
#[derive(Debug)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub handle:       RequestHandle,
    pub step:         CaptureStep,
    /// `(response code, normalized results)`, or why the body was unreadable.
    pub outcome:      Result<(i64, Results), CaptureError>,
}

#[derive(Debug)]
pub enum Routed {
    Delivered(Delivery),
    Unmatched(RequestHandle),
}

#[derive(Debug, Default)]
pub struct ResponseRouter {
    next_id: u64,
    live:    HashMap<RequestHandle, Subscription>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the single completion event of `handle`.
    pub fn subscribe(&mut self, handle: RequestHandle, step: CaptureStep) -> SubscriptionId {
        self.next_id += 1;
        let id = self.next_id;
        if let Some(old) = self.live.insert(handle.clone(), Subscription { id, step }) {
            warn!("Replacing subscription #{} on {} with #{}", old.id, handle, id);
        }
        debug!("Subscribed #{} to {} Response on {}", id, step, handle);
        SubscriptionId(id)
    }

    /// Drop a subscription. Safe with `None` and with ids that already fired.
    pub fn unsubscribe(&mut self, id: Option<SubscriptionId>) -> bool {
        let Some(SubscriptionId(id)) = id else { return false };
        let before = self.live.len();
        self.live.retain(|_, sub| sub.id != id);
        let removed = self.live.len() != before;
        if removed {
            debug!("Unsubscribed #{}", id);
        }
        removed
    }

    /// Drop every live subscription, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.live.len();
        self.live.clear();
        count
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Match a raw completion event to its subscription, consuming it.
    pub fn route(&mut self, response: BrokerResponse) -> Routed {
        let Some(sub) = self.live.remove(&response.handle) else {
            return Routed::Unmatched(response.handle);
        };
        debug!("Delivering {} Response on {} (#{})", sub.step, response.handle, sub.id);
        Routed::Delivered(Delivery {
            subscription: SubscriptionId(sub.id),
            handle:       response.handle,
            step:         sub.step,
            outcome:      unwrap_body(&response.body),
        })
    }
}
