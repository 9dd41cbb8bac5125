//! Per-fingerprint single-flight.
//!
//! When two dispatches compute the same fingerprint concurrently, the first
//! becomes the leader and runs the pipeline; the rest follow its watch
//! channel and share the outcome without issuing a second runtime call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::error::DispatchError;
use crate::task::TaskResult;

type Outcome = Result<TaskResult, DispatchError>;
type Registry = Arc<Mutex<HashMap<String, watch::Receiver<Option<Outcome>>>>>;

/// Role assigned to a dispatch joining a fingerprint.
pub(crate) enum Flight {
    /// Run the pipeline and broadcast through the guard.
    Leader(FlightGuard),
    /// Await the leader's outcome.
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Registry of fingerprints currently being computed.
#[derive(Default)]
pub(crate) struct SingleFlight {
    inflight: Registry,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Joins the flight for `key`, becoming leader if none is active.
    pub(crate) fn join(&self, key: &str) -> Flight {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(key) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            tx: Some(tx),
            registry: Arc::clone(&self.inflight),
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Leader's handle: deregisters the key and broadcasts the outcome.
pub(crate) struct FlightGuard {
    key: String,
    tx: Option<watch::Sender<Option<Outcome>>>,
    registry: Registry,
}

impl FlightGuard {
    /// Publishes `outcome` to every follower and retires the flight.
    pub(crate) fn complete(mut self, outcome: Outcome) {
        self.registry.lock().remove(&self.key);
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Leader aborted without completing (cancel or panic); fail the
        // followers fast instead of letting them wait out their deadlines.
        if let Some(tx) = self.tx.take() {
            self.registry.lock().remove(&self.key);
            let _ = tx.send(Some(Err(DispatchError::Unavailable {
                reason: "concurrent identical request was aborted".to_string(),
            })));
        }
    }
}
