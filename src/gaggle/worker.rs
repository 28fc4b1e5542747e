//! Worker-specific code: follow a manager's events and run its stages locally.

use futures::{SinkExt, Stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::commander::Commander;
use crate::eventbus::{EventBus, ResultHandler};
use crate::gaggle::common::{
    decode_message, send_json, BatchId, Event, Hello, SubmitRequest, SubmitResponse, SubmitResult,
};
use crate::statistics::snapshot::GroupSnapshot;
use crate::statistics::{StatisticianGroup, PLAN_TAG};
use crate::strategy::AttackStrategy;
use crate::task::Task;
use crate::timer::Timer;
use crate::util::{self, CancelHandle};
use crate::SkeinError;

// Everything belonging to the plan currently running on this worker.
struct PlanSession {
    commander: Arc<Commander>,
    stages: flume::Sender<(AttackStrategy, Timer)>,
    driver: tokio::task::JoinHandle<()>,
    recorder: tokio::task::JoinHandle<()>,
}

/// Connects to a manager and runs whatever it asks for.
pub struct WorkerRunner {
    worker_id: String,
    extras: BTreeMap<String, String>,
    manager: Url,
    task: Arc<Task>,
    stats: Arc<Mutex<StatisticianGroup>>,
    bus: EventBus,
    session: Option<PlanSession>,
}

impl WorkerRunner {
    /// A worker with a random id, firing the attackers of `task`.
    pub fn new(manager: Url, task: Arc<Task>) -> Self {
        WorkerRunner {
            worker_id: util::random_id(),
            extras: BTreeMap::new(),
            manager,
            task,
            stats: Arc::new(Mutex::new(StatisticianGroup::new())),
            bus: EventBus::new(),
            session: None,
        }
    }

    pub fn with_worker_id(mut self, worker_id: &str) -> Self {
        self.worker_id = worker_id.to_string();
        self
    }

    /// Metadata reported to the manager on subscription.
    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extras.insert(key.to_string(), value.to_string());
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Statistics recorded by this worker for the current plan.
    pub fn stats(&self) -> Arc<Mutex<StatisticianGroup>> {
        Arc::clone(&self.stats)
    }

    /// Call `handler` with every attack result.
    pub async fn subscribe_result(&self, handler: ResultHandler) {
        self.bus.subscribe_result(handler).await;
    }

    /// Subscribe to the manager and follow its events until it disconnects us, the
    /// connection drops, or `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancelHandle) -> Result<(), SkeinError> {
        info!("worker {} connecting to manager at {}", self.worker_id, self.manager);
        let (stream, _) = tokio_tungstenite::connect_async(self.manager.as_str()).await?;
        let (mut ws_sender, mut ws_receiver) = stream.split();
        send_json(
            &mut ws_sender,
            &Hello::Subscribe {
                worker_id: self.worker_id.clone(),
                extras: self.extras.clone(),
            },
        )
        .await?;

        match next_event(&mut ws_receiver).await? {
            Some(Event::Connected) => info!("worker {} connected to manager", self.worker_id),
            Some(event) => {
                return Err(SkeinError::Protocol {
                    detail: format!("expected a connected event, received {}", event),
                })
            }
            None => {
                return Err(SkeinError::Protocol {
                    detail: "manager closed the connection before accepting the worker".to_string(),
                })
            }
        }
        self.bus.start().await;

        loop {
            let event = tokio::select! {
                event = next_event(&mut ws_receiver) => event,
                _ = shutdown.cancelled() => {
                    info!("worker {} shutting down", self.worker_id);
                    break;
                }
            };
            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("manager closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("lost connection to manager: {}", e);
                    break;
                }
            };
            debug!("worker {} received {}", self.worker_id, event);

            match event {
                Event::Ping => {}
                Event::Connected => warn!("worker {} is already connected", self.worker_id),
                Event::Disconnect => {
                    info!("manager disconnected worker {}", self.worker_id);
                    break;
                }
                Event::PlanStarted { plan_name } => self.start_plan(&plan_name).await,
                Event::NextStageStarted { strategy, timer } => {
                    let stage = AttackStrategy::from_descriptor(&strategy)
                        .and_then(|strategy| Ok((strategy, Timer::from_descriptor(&timer)?)));
                    match stage {
                        Ok(stage) => self.next_stage(stage),
                        Err(e) => warn!("skipping stage that cannot be decoded: {}", e),
                    }
                }
                Event::StatsAggregate { batch_id } => {
                    let stats = GroupSnapshot::from(&*self.stats.lock().await);
                    let manager = self.manager.clone();
                    let worker_id = self.worker_id.clone();
                    tokio::spawn(async move {
                        match submit_stats(&manager, &worker_id, batch_id, stats).await {
                            Ok(()) => debug!("batch {} accepted", batch_id),
                            Err(e) => warn!("failed to submit batch {}: {}", batch_id, e),
                        }
                    });
                }
                Event::PlanFinished | Event::PlanInterrupted => self.stop_plan().await,
            }
        }

        self.stop_plan().await;
        let _ = ws_sender.close().await;
        self.bus.close().await;
        Ok(())
    }

    async fn start_plan(&mut self, plan_name: &str) {
        if self.session.is_some() {
            warn!("plan {} started before the previous one stopped", plan_name);
            self.stop_plan().await;
        }
        {
            let mut stats = self.stats.lock().await;
            stats.reset();
            stats.attach(PLAN_TAG, plan_name);
        }
        info!("worker {} starting plan {}", self.worker_id, plan_name);

        let (commander, results) = Commander::open(Arc::clone(&self.task));
        let commander = Arc::new(commander);

        let stats = Arc::clone(&self.stats);
        let bus = self.bus.clone();
        let recorder = tokio::spawn(async move {
            let publish = bus.has_result_handlers().await;
            while let Ok(result) = results.recv_async().await {
                stats.lock().await.record(&result);
                if publish {
                    bus.publish_result(result).await;
                }
            }
        });

        // Stages are applied one after the other, in the order they arrived.
        let (stages, queued) = flume::unbounded::<(AttackStrategy, Timer)>();
        let driving = Arc::clone(&commander);
        let driver = tokio::spawn(async move {
            while let Ok((strategy, timer)) = queued.recv_async().await {
                if let Err(e) = driving.command(strategy, Some(timer)).await {
                    error!("failed to apply stage: {}", e);
                }
            }
        });

        self.session = Some(PlanSession {
            commander,
            stages,
            driver,
            recorder,
        });
    }

    fn next_stage(&mut self, stage: (AttackStrategy, Timer)) {
        match self.session.as_ref() {
            Some(session) => {
                info!(
                    "worker {} moving to {} users",
                    self.worker_id,
                    stage.0.concurrent_users()
                );
                if session.stages.send(stage).is_err() {
                    warn!("stage arrived while the plan was stopping");
                }
            }
            None => warn!("ignoring stage received outside of a plan"),
        }
    }

    async fn stop_plan(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session.stages);
            session.commander.close().await;
            if let Err(e) = session.driver.await {
                warn!("stage driver failed: {}", e);
            }
            if let Err(e) = session.recorder.await {
                warn!("result recorder failed: {}", e);
            }
            info!("worker {} stopped its plan", self.worker_id);
        }
    }
}

/// Wait for the next event, skipping control frames. `None` once the connection closes.
async fn next_event<S>(receiver: &mut S) -> Result<Option<Event>, SkeinError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = receiver.next().await {
        let message = message?;
        if message.is_close() {
            return Ok(None);
        }
        if let Some(event) = decode_message(&message)? {
            return Ok(Some(event));
        }
    }
    Ok(None)
}

/// Submit one snapshot over its own connection. Fails unless the manager accepts it.
pub(crate) async fn submit_stats(
    manager: &Url,
    worker_id: &str,
    batch_id: BatchId,
    stats: GroupSnapshot,
) -> Result<(), SkeinError> {
    let (stream, _) = tokio_tungstenite::connect_async(manager.as_str()).await?;
    let (mut ws_sender, mut ws_receiver) = stream.split();
    send_json(
        &mut ws_sender,
        &Hello::Submit(SubmitRequest {
            worker_id: worker_id.to_string(),
            batch_id,
            stats,
        }),
    )
    .await?;

    let response = loop {
        match ws_receiver.next().await {
            Some(message) => {
                if let Some(response) = decode_message::<SubmitResponse>(&message?)? {
                    break response;
                }
            }
            None => {
                return Err(SkeinError::Protocol {
                    detail: "manager closed the connection without answering".to_string(),
                })
            }
        }
    };
    let _ = ws_sender.close().await;
    match response.result {
        SubmitResult::Accepted => Ok(()),
        result => Err(SkeinError::Submission {
            result,
            detail: format!("batch {} from worker {}", batch_id, worker_id),
        }),
    }
}
