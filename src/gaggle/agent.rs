//! The manager's handle on one subscribed worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::gaggle::common::Event;
use crate::util::CancelHandle;
use crate::SkeinError;

/// How long closing waits for room to queue the final disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Queues events for one worker's subscription.
///
/// The queue holds a single event, so senders wait until the subscription loop has
/// written the previous one to the socket.
#[derive(Debug)]
pub struct WorkerAgent {
    id: String,
    extras: BTreeMap<String, String>,
    input: flume::Sender<Event>,
    closed: AtomicBool,
    // Wakes senders blocked on a full queue once the agent closes.
    sealed: CancelHandle,
}

impl WorkerAgent {
    /// Returns the agent and the queue its subscription loop drains.
    pub(crate) fn new(id: &str, extras: BTreeMap<String, String>) -> (Arc<Self>, flume::Receiver<Event>) {
        let (input, output) = flume::bounded(1);
        let agent = WorkerAgent {
            id: id.to_string(),
            extras,
            input,
            closed: AtomicBool::new(false),
            sealed: CancelHandle::new(),
        };
        (Arc::new(agent), output)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// A copy of the metadata the worker subscribed with.
    pub fn extras(&self) -> BTreeMap<String, String> {
        self.extras.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue `event`, waiting for room. Fails once the agent is closed.
    pub async fn send(&self, event: Event) -> Result<(), SkeinError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        tokio::select! {
            sent = self.input.send_async(event) => sent.map_err(|_| self.closed_error()),
            _ = self.sealed.cancelled() => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> SkeinError {
        SkeinError::WorkerClosed {
            worker_id: self.id.clone(),
        }
    }

    /// Queue a final disconnect and refuse any further event. Only the first call does
    /// anything.
    pub async fn close(&self) -> Result<(), SkeinError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let queued = tokio::time::timeout(CLOSE_TIMEOUT, self.input.send_async(Event::Disconnect)).await;
        self.sealed.cancel();
        match queued {
            Ok(Ok(())) => Ok(()),
            // The subscription loop is already gone.
            Ok(Err(_)) => Ok(()),
            Err(_) => Err(SkeinError::WorkerRegistration {
                worker_id: self.id.clone(),
                detail: "the event queue is blocked, cannot queue disconnect".to_string(),
            }),
        }
    }

    /// Queue a ping every `every` until the agent closes.
    pub(crate) async fn keep_alive(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send(Event::Ping).await {
                        debug!("stopping keep-alive for worker {}: {}", self.id, e);
                        return;
                    }
                }
                _ = self.sealed.cancelled() => return,
            }
        }
    }
}
