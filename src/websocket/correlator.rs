use crate::error::{AppError, Result};
use crate::types::{InboundMessage, Route};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::warn;

use super::registry::PushHandler;

/// Subscription to activate when the response arrives.
pub(crate) struct PendingSubscription {
    pub route: Route,
    pub handler: PushHandler,
    /// Generation of the intent this request was made for.
    pub generation: u64,
}

/// An in-flight request awaiting its response.
pub(crate) struct PendingRequest {
    /// Absent for requests replayed by the actor itself.
    responder: Option<oneshot::Sender<Result<InboundMessage>>>,
    pub subscription: Option<PendingSubscription>,
}

impl PendingRequest {
    pub fn new(responder: oneshot::Sender<Result<InboundMessage>>) -> Self {
        Self {
            responder: Some(responder),
            subscription: None,
        }
    }

    pub fn replay(subscription: Option<PendingSubscription>) -> Self {
        Self {
            responder: None,
            subscription,
        }
    }

    pub fn with_subscription(mut self, subscription: PendingSubscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Resolve the waiting caller. Replayed requests only log failures.
    pub fn respond(self, result: Result<InboundMessage>) {
        match self.responder {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Replayed request failed: {}", e);
                }
            }
        }
    }
}

/// Matches responses to requests by `req_id`.
pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocate a request id. Ids increase strictly and are never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, req_id: u64, request: PendingRequest) {
        self.pending.insert(req_id, request);
    }

    pub(crate) fn take(&self, req_id: u64) -> Option<PendingRequest> {
        self.pending.remove(&req_id).map(|(_, request)| request)
    }

    /// Fail one pending request.
    pub fn reject(&self, req_id: u64, error: AppError) {
        if let Some(request) = self.take(req_id) {
            request.respond(Err(error));
        }
    }

    /// Fail every pending request. Returns how many were rejected.
    pub fn reject_all(&self, error: AppError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some(request) = self.take(id) {
                request.respond(Err(error.clone()));
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
