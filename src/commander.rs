//! The worker-side engine turning an attack strategy into live executors.
//!
//! A [`Commander`] owns a pool of executors, each one a tokio task standing in for one
//! virtual user. Every [`Commander::command`] diffs the previous strategy against the
//! new one and walks the resulting ramp steps, spawning or cancelling executors and
//! pausing between steps. Each executor loops until cancelled:
//!
//!  1. pick an attacker from the [`Task`],
//!  2. fire it,
//!  3. push the [`AttackResult`] onto the result channel,
//!  4. pause according to the current [`Timer`].
//!
//! The timer is shared through a watch channel, so a new stage changes the pacing of
//! executors that are already running. A panicking attacker only takes down its own
//! executor.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use crate::statistics::AttackResult;
use crate::strategy::AttackStrategy;
use crate::task::Task;
use crate::timer::Timer;
use crate::util::{self, CancelHandle};
use crate::SkeinError;

/// Results waiting to be consumed before executors block.
const RESULT_CHANNEL_CAPACITY: usize = 100;

pub(crate) type ExecutorJoinHandle = tokio::task::JoinHandle<()>;

/// Executors keyed by id, each with its own cancellation handle.
type ExecutorPool = Arc<Mutex<HashMap<u64, CancelHandle>>>;

/// Runs executors for one worker process.
pub struct Commander {
    task: Arc<Task>,
    // Cancels every executor at once.
    root: CancelHandle,
    pool: ExecutorPool,
    counter: AtomicU64,
    timer: watch::Sender<Timer>,
    // The last commanded strategy; holding the lock serializes ramps.
    strategy: Mutex<Option<AttackStrategy>>,
    output: Mutex<Option<flume::Sender<AttackResult>>>,
    handles: Mutex<Vec<ExecutorJoinHandle>>,
    closed: AtomicBool,
}

impl Commander {
    /// Bind a commander to `task`, returning it with the read side of its results.
    ///
    /// The result channel disconnects once [`Commander::close`] has drained every
    /// executor.
    pub fn open(task: Arc<Task>) -> (Commander, flume::Receiver<AttackResult>) {
        let (output_tx, output_rx) = flume::bounded(RESULT_CHANNEL_CAPACITY);
        let (timer, _) = watch::channel(Timer::NonStop);
        let commander = Commander {
            task,
            root: CancelHandle::new(),
            pool: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            timer,
            strategy: Mutex::new(None),
            output: Mutex::new(Some(output_tx)),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        (commander, output_rx)
    }

    /// Executors currently in the pool.
    pub async fn concurrent_users(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// The last strategy passed to [`Commander::command`].
    pub async fn strategy(&self) -> Option<AttackStrategy> {
        self.strategy.lock().await.clone()
    }

    /// Move to `strategy`, pacing every executor with `timer` (no pause if `None`).
    ///
    /// Returns once every ramp step has been applied, or early if the commander is
    /// closed in the meantime. Concurrent calls are applied one after the other.
    pub async fn command(
        &self,
        strategy: AttackStrategy,
        timer: Option<Timer>,
    ) -> Result<(), SkeinError> {
        let mut current = self.strategy.lock().await;
        if self.root.is_cancelled() {
            return Err(SkeinError::Closed {
                detail: "commander is already closed".to_string(),
            });
        }

        let steps = match current.as_ref() {
            Some(previous) => previous.switch(&strategy)?,
            // A worker may be handed an empty share of a small strategy.
            None if strategy.concurrent_users() == 0 => Vec::new(),
            None => strategy.spawn()?,
        };
        debug!("moving to {:?} in {} steps", strategy, steps.len());
        *current = Some(strategy);

        // Existing executors pick up the new timer before their next pause.
        self.timer.send_replace(timer.unwrap_or_default());

        for step in steps {
            if step.n < 0 {
                let killed = self.kill_executors(step.n.unsigned_abs() as usize).await;
                info!("killed {} users in ramp-up step", killed);
            } else if step.n > 0 {
                let mut spawned = 0;
                for _ in 0..step.n {
                    if self.root.is_cancelled() {
                        warn!("commander was cancelled, leaving the ramp-up period");
                        return Ok(());
                    }
                    self.spawn_executor().await?;
                    spawned += 1;
                }
                info!("spawned {} users in ramp-up step", spawned);
            }

            if util::sleep_or_cancel(step.interval, &self.root).await {
                warn!("commander was cancelled, leaving the ramp-up period");
                return Ok(());
            }
        }
        Ok(())
    }

    // Cancel up to `n` executors, returning how many were actually in the pool.
    async fn kill_executors(&self, n: usize) -> usize {
        let mut pool = self.pool.lock().await;
        // Victims are whichever executors the pool yields first.
        let victims: Vec<u64> = pool.keys().take(n).copied().collect();
        for id in victims.iter() {
            if let Some(cancel) = pool.remove(id) {
                cancel.cancel();
            }
        }
        victims.len()
    }

    async fn spawn_executor(&self) -> Result<(), SkeinError> {
        let output = match self.output.lock().await.as_ref() {
            Some(output) => output.clone(),
            None => {
                return Err(SkeinError::Closed {
                    detail: "result channel is closed".to_string(),
                })
            }
        };
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelHandle::new();
        self.pool.lock().await.insert(id, cancel.clone());

        let executor = Executor {
            id,
            task: Arc::clone(&self.task),
            root: self.root.clone(),
            cancel,
            timer: self.timer.subscribe(),
            output,
        };
        let pool = Arc::clone(&self.pool);
        let handle = tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(executor.run()).catch_unwind().await {
                error!("executor {} panicked: {}", id, panic_message(&panic));
            }
            // Whether cancelled, finished or panicked, the executor leaves the pool.
            pool.lock().await.remove(&id);
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|handle| !handle.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Cancel every executor, wait for them to exit, and close the result channel.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.root.cancel();
        // Wait for a ramp in progress to notice the cancellation.
        let _ramp = self.strategy.lock().await;

        let handles = std::mem::take(&mut *self.handles.lock().await);
        debug!("waiting for {} executors to exit", handles.len());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("executor did not exit cleanly: {}", e);
            }
        }
        self.pool.lock().await.clear();
        // Dropping the last sender disconnects the result channel.
        self.output.lock().await.take();
        info!("commander closed");
    }
}

struct Executor {
    id: u64,
    task: Arc<Task>,
    root: CancelHandle,
    cancel: CancelHandle,
    timer: watch::Receiver<Timer>,
    output: flume::Sender<AttackResult>,
}

impl Executor {
    fn stopped(&self) -> bool {
        self.root.is_cancelled() || self.cancel.is_cancelled()
    }

    async fn run(self) {
        trace!("executor {} starting", self.id);
        loop {
            if self.stopped() {
                break;
            }
            let attacker = match self.task.pick_up() {
                Some(attacker) => attacker,
                None => {
                    warn!("executor {} has no attackers to fire", self.id);
                    break;
                }
            };

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = attacker.fire() => outcome,
                _ = self.root.cancelled() => break,
                _ = self.cancel.cancelled() => break,
            };
            let result = AttackResult {
                name: attacker.name().to_string(),
                duration: started.elapsed(),
                error: outcome.err().map(|e| e.to_string()),
            };

            // Don't block shutdown on a full channel.
            tokio::select! {
                sent = self.output.send_async(result) => {
                    if sent.is_err() {
                        debug!("executor {} lost its result channel", self.id);
                        break;
                    }
                }
                _ = self.root.cancelled() => break,
                _ = self.cancel.cancelled() => break,
            }

            if self.stopped() {
                break;
            }
            let wait = self.timer.borrow().next_wait();
            if wait > Duration::from_secs(0) {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.root.cancelled() => break,
                    _ = self.cancel.cancelled() => break,
                }
            } else {
                // Let other tasks run even if every attacker completes synchronously.
                tokio::task::yield_now().await;
            }
        }
        trace!("executor {} exiting", self.id);
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
