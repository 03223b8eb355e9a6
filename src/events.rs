//! Local completion handles for in-flight requests.
//!
//! The originating instance parks each submitted request on a one-shot
//! handle keyed by request id. When the controller publishes `requestReady`
//! the router resolves the handle and the pipeline proceeds. Completion is
//! idempotent: the first resolution wins and later ones are ignored, which
//! makes duplicate `requestReady` deliveries during controller transitions
//! harmless.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::request::RequestRecord;

#[derive(Default)]
pub struct CompletionBus {
    pending: Mutex<HashMap<String, oneshot::Sender<RequestRecord>>>,
}

impl CompletionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `request_id`. A second registration for the
    /// same id replaces the first.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<RequestRecord> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Resolves the waiter for `request_id`, if any. Returns whether a
    /// waiter was present.
    pub fn complete(&self, request_id: &str, record: RequestRecord) -> bool {
        let sender = self.pending.lock().unwrap().remove(request_id);
        match sender {
            Some(tx) => tx.send(record).is_ok(),
            None => false,
        }
    }

    /// Drops the waiter for `request_id` without resolving it.
    pub fn discard(&self, request_id: &str) {
        self.pending.lock().unwrap().remove(request_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
