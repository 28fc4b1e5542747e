//! Fan reports and results out to subscribed handlers.
//!
//! Reports are rare and flow through a single small queue. Results arrive once per fire,
//! so they are spread round-robin over several sub-queues drained concurrently. Each
//! queue is drained by one task which calls every handler in subscription order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::statistics::{AttackResult, SummaryReport};

const REPORT_QUEUE_CAPACITY: usize = 3;
const RESULT_QUEUES: usize = 20;
const RESULT_QUEUE_CAPACITY: usize = 100;

/// Called with every published report.
pub type ReportHandler = Arc<dyn Fn(&SummaryReport) + Send + Sync>;
/// Called with every published result.
pub type ResultHandler = Arc<dyn Fn(&AttackResult) + Send + Sync>;

struct Queues {
    report: flume::Sender<SummaryReport>,
    results: Vec<flume::Sender<AttackResult>>,
}

struct BusInner {
    // None once closed.
    senders: Mutex<Option<Queues>>,
    report_rx: flume::Receiver<SummaryReport>,
    result_rxs: Vec<flume::Receiver<AttackResult>>,
    report_handlers: RwLock<Vec<ReportHandler>>,
    result_handlers: RwLock<Vec<ResultHandler>>,
    counter: AtomicUsize,
    started: AtomicBool,
    closed: AtomicBool,
    drains: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A cloneable handle to one event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (report, report_rx) = flume::bounded(REPORT_QUEUE_CAPACITY);
        let (results, result_rxs): (Vec<_>, Vec<_>) = (0..RESULT_QUEUES)
            .map(|_| flume::bounded(RESULT_QUEUE_CAPACITY))
            .unzip();
        EventBus {
            inner: Arc::new(BusInner {
                senders: Mutex::new(Some(Queues { report, results })),
                report_rx,
                result_rxs,
                report_handlers: RwLock::new(Vec::new()),
                result_handlers: RwLock::new(Vec::new()),
                counter: AtomicUsize::new(0),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                drains: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn subscribe_report(&self, handler: ReportHandler) {
        self.inner.report_handlers.write().await.push(handler);
    }

    pub async fn subscribe_result(&self, handler: ResultHandler) {
        self.inner.result_handlers.write().await.push(handler);
    }

    /// Whether anybody listens for results; publishers may skip the work otherwise.
    pub async fn has_result_handlers(&self) -> bool {
        !self.inner.result_handlers.read().await.is_empty()
    }

    /// Queue `report`, waiting for room. Dropped once the bus is closed.
    pub async fn publish_report(&self, report: SummaryReport) {
        let sender = match self.inner.senders.lock().await.as_ref() {
            Some(queues) => queues.report.clone(),
            None => return,
        };
        if sender.send_async(report).await.is_err() {
            debug!("report bus is closed, dropping report");
        }
    }

    /// Queue `result` on the next sub-queue, waiting for room. Dropped once the bus is closed.
    pub async fn publish_result(&self, result: AttackResult) {
        let sender = match self.inner.senders.lock().await.as_ref() {
            Some(queues) => {
                let index = self.inner.counter.fetch_add(1, Ordering::Relaxed) % RESULT_QUEUES;
                queues.results[index].clone()
            }
            None => return,
        };
        if sender.send_async(result).await.is_err() {
            debug!("result bus is closed, dropping result");
        }
    }

    /// Start draining every queue. Only the first call does anything.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut drains = self.inner.drains.lock().await;

        let inner = Arc::clone(&self.inner);
        drains.push(tokio::spawn(async move {
            while let Ok(report) = inner.report_rx.recv_async().await {
                let handlers = inner.report_handlers.read().await.clone();
                for handler in handlers.iter() {
                    handler(&report);
                }
            }
        }));

        for index in 0..RESULT_QUEUES {
            let inner = Arc::clone(&self.inner);
            drains.push(tokio::spawn(async move {
                while let Ok(result) = inner.result_rxs[index].recv_async().await {
                    let handlers = inner.result_handlers.read().await.clone();
                    for handler in handlers.iter() {
                        handler(&result);
                    }
                }
            }));
        }
        debug!("event bus started with {} result queues", RESULT_QUEUES);
    }

    /// Stop accepting events and wait for queued ones to be handled.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders ends every drain once its queue is empty.
        self.inner.senders.lock().await.take();
        let drains = std::mem::take(&mut *self.inner.drains.lock().await);
        for result in futures::future::join_all(drains).await {
            if let Err(e) = result {
                warn!("event handler failed: {}", e);
            }
        }
        debug!("event bus closed");
    }
}
