use std::sync::Arc;
use tokio::sync::oneshot;

type ReplySender = oneshot::Sender<Result<(), String>>;

/// Request to restart a worker, published by workflow recovery and served by
/// the worker coordinator.
///
/// The request travels over an [`EventBus`](crate::EventBus), so it must be
/// `Clone`; the reply slot is shared and only the first [`respond`] call is
/// delivered.
///
/// [`respond`]: RestartRequest::respond
#[derive(Debug, Clone)]
pub struct RestartRequest {
    /// Correlates log lines between requester and server.
    pub request_id: u64,
    /// Worker to restart. `None` means every worker that is currently failing.
    pub worker: Option<String>,
    pub workflow_id: String,
    pub step_id: String,
    reply: Arc<parking_lot::Mutex<Option<ReplySender>>>,
}

/// Waiting half of a [`RestartRequest`].
pub type RestartReply = oneshot::Receiver<Result<(), String>>;

impl RestartRequest {
    /// Build a request and the receiver its answer will arrive on.
    pub fn new(
        request_id: u64,
        worker: Option<String>,
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> (Self, RestartReply) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            request_id,
            worker,
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            reply: Arc::new(parking_lot::Mutex::new(Some(tx))),
        };
        (request, rx)
    }

    /// Answer the request. Returns `false` if it was already answered or the
    /// requester stopped waiting.
    pub fn respond(&self, result: Result<(), String>) -> bool {
        match self.reply.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}
