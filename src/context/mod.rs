//! Per-pass execution context
//!
//! A `PassContext` is created for every reconciliation pass and threaded
//! through every collaborator call made during it. It carries:
//! - the cancellation token propagated from process shutdown
//! - a pass identifier for log correlation
//!
//! Each outbound call derives a `RequestContext` with its own short
//! correlation identifier, which is logged on start, success and failure and
//! forwarded to HTTP collaborators as `X-Request-Id`.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Length of the correlation identifiers attached to outbound calls
pub const REQUEST_ID_LEN: usize = 8;

/// Returned when a pass is abandoned because shutdown was requested
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Context object shared by every step of one reconciliation pass
#[derive(Debug, Clone)]
pub struct PassContext {
    pass_id: String,
    cancel: CancellationToken,
}

impl PassContext {
    /// Create a context for a new pass bound to the given shutdown token
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            pass_id: short_id(),
            cancel,
        }
    }

    /// Identifier of this pass
    pub fn pass_id(&self) -> &str {
        &self.pass_id
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if shutdown was requested
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Derive the context for a single outbound call
    pub fn request(&self) -> RequestContext {
        RequestContext {
            request_id: short_id(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Context of one outbound collaborator call
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    cancel: CancellationToken,
}

impl RequestContext {
    /// A request context that is never cancelled, for calls made outside a pass
    /// (credential refresh driven by the HTTP layer)
    pub fn detached() -> Self {
        Self {
            request_id: short_id(),
            cancel: CancellationToken::new(),
        }
    }

    /// Correlation identifier of this call
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drive `fut` to completion unless shutdown is requested first
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(REQUEST_ID_LEN);
    id
}
