use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::error::TransportError;

pub(crate) type CallResult = Result<serde_json::Value, TransportError>;

/// Outstanding request/response calls keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    pub(crate) fn register(&self, correlation_id: &str) -> oneshot::Receiver<CallResult> {
        let (sender, receiver) = oneshot::channel();
        match self.calls.lock() {
            Ok(mut calls) => {
                calls.insert(correlation_id.to_string(), sender);
            }
            Err(error) => {
                tracing::error!(lock_error = %error, "Pending call table is poisoned");
                let _ = sender.send(Err(TransportError::Disconnected));
            }
        }
        receiver
    }

    /// Completes the call waiting on `correlation_id`; false when nobody is waiting.
    pub(crate) fn resolve(&self, correlation_id: &str, result: CallResult) -> bool {
        let Some(sender) = self.take(correlation_id) else {
            return false;
        };

        if sender.send(result).is_err() {
            tracing::debug!(correlation_id, "Pending call receiver dropped before resolution");
        }
        true
    }

    /// Forgets a call without completing it (the caller already gave up).
    pub(crate) fn release(&self, correlation_id: &str) {
        self.take(correlation_id);
    }

    /// Fails every outstanding call with `error`; returns how many were rejected.
    pub(crate) fn reject_all(&self, error: TransportError) -> usize {
        let drained: Vec<oneshot::Sender<CallResult>> = match self.calls.lock() {
            Ok(mut calls) => calls.drain().map(|(_, sender)| sender).collect(),
            Err(lock_error) => {
                tracing::error!(lock_error = %lock_error, "Pending call table is poisoned");
                return 0;
            }
        };

        let rejected = drained.len();
        for sender in drained {
            let _ = sender.send(Err(error.clone()));
        }
        rejected
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    fn take(&self, correlation_id: &str) -> Option<oneshot::Sender<CallResult>> {
        self.calls
            .lock()
            .ok()
            .and_then(|mut calls| calls.remove(correlation_id))
    }
}
