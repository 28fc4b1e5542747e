//! Manager-side bookkeeping of subscribed workers.
//!
//! The [`Supervisor`] fans plan and stage changes out to every [`WorkerAgent`] and runs
//! statistics collection rounds. A round ("batch") asks every worker for a snapshot and
//! waits for all of them under one shared deadline. One missing worker fails the whole
//! round, partial results are never merged. Submissions are matched to the waiting
//! round by batch id and worker id, and each worker may answer a batch only once.

use futures::future;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::gaggle::agent::WorkerAgent;
use crate::gaggle::common::{BatchId, Event, SubmitRequest, SubmitResult};
use crate::statistics::{StatisticianGroup, SummaryReport};
use crate::strategy::AttackStrategy;
use crate::timer::Timer;
use crate::SkeinError;

/// Tunables for a [`Supervisor`].
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisorConfig {
    /// Shared deadline for every worker to submit its snapshot.
    pub aggregate_timeout: Duration,
    /// How often subscribed workers are pinged.
    pub keepalive_interval: Duration,
    /// How many newer batches may be started before a round is considered stale.
    pub tolerance_for_delay: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            aggregate_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(5),
            tolerance_for_delay: 3,
        }
    }
}

// Completed at most once, by the first matching submission.
type StatsCallback = Option<oneshot::Sender<StatisticianGroup>>;

#[derive(Default)]
struct Batches {
    counter: BatchId,
    pending: HashMap<BatchId, HashMap<String, StatsCallback>>,
}

/// Tracks workers and correlates their statistics submissions.
pub struct Supervisor {
    config: SupervisorConfig,
    agents: RwLock<HashMap<String, Arc<WorkerAgent>>>,
    batches: Mutex<Batches>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Supervisor {
            config,
            agents: RwLock::new(HashMap::new()),
            batches: Mutex::new(Batches::default()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Register a worker and return the queue of events to relay to it.
    ///
    /// The first queued event is always [`Event::Connected`], followed by periodic pings.
    pub async fn subscribe(
        &self,
        worker_id: &str,
        extras: BTreeMap<String, String>,
    ) -> Result<(Arc<WorkerAgent>, flume::Receiver<Event>), SkeinError> {
        if worker_id.is_empty() {
            return Err(SkeinError::WorkerRegistration {
                worker_id: worker_id.to_string(),
                detail: "empty worker id".to_string(),
            });
        }
        let (agent, events) = WorkerAgent::new(worker_id, extras);
        // Queued before the agent is visible to broadcasts; the empty queue takes it at once.
        agent.send(Event::Connected).await?;
        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(worker_id) {
                return Err(SkeinError::WorkerRegistration {
                    worker_id: worker_id.to_string(),
                    detail: "duplicated worker id".to_string(),
                });
            }
            agents.insert(worker_id.to_string(), Arc::clone(&agent));
        }
        info!("worker {} subscribed with extras {:?}", worker_id, agent.extras());

        let pinger = Arc::clone(&agent);
        let keepalive_interval = self.config.keepalive_interval;
        tokio::spawn(async move { pinger.keep_alive(keepalive_interval).await });
        Ok((agent, events))
    }

    /// Forget a worker and close its agent.
    pub async fn unsubscribe(&self, worker_id: &str) {
        let agent = self.agents.write().await.remove(worker_id);
        if let Some(agent) = agent {
            info!("worker {} unsubscribed", worker_id);
            if let Err(e) = agent.close().await {
                warn!("failed to close worker {}: {}", worker_id, e);
            }
        }
    }

    /// Disconnect every worker.
    pub async fn close(&self) {
        let agents: Vec<Arc<WorkerAgent>> = self.agents.write().await.drain().map(|(_, a)| a).collect();
        for agent in agents {
            if let Err(e) = agent.close().await {
                warn!("failed to close worker {}: {}", agent.id(), e);
            }
        }
    }

    pub async fn exists(&self, worker_id: &str) -> bool {
        self.agents.read().await.contains_key(worker_id)
    }

    pub async fn get(&self, worker_id: &str) -> Option<Arc<WorkerAgent>> {
        self.agents.read().await.get(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<Arc<WorkerAgent>> {
        self.agents.read().await.values().cloned().collect()
    }

    async fn broadcast(&self, event: Event) -> Result<(), SkeinError> {
        let agents = self.workers().await;
        if agents.is_empty() {
            return Err(SkeinError::NoWorkers);
        }
        debug!("broadcasting {} to {} workers", event, agents.len());
        future::try_join_all(agents.iter().map(|agent| agent.send(event.clone()))).await?;
        Ok(())
    }

    pub async fn start_new_plan(&self, plan_name: &str) -> Result<(), SkeinError> {
        self.broadcast(Event::PlanStarted {
            plan_name: plan_name.to_string(),
        })
        .await
    }

    /// Give every worker its share of `strategy`, paced by `timer` (no pause if `None`).
    pub async fn next_stage(&self, strategy: &AttackStrategy, timer: Option<Timer>) -> Result<(), SkeinError> {
        let agents = self.workers().await;
        if agents.is_empty() {
            return Err(SkeinError::NoWorkers);
        }
        let timer = timer.unwrap_or_default().to_descriptor()?;
        let mut events = Vec::with_capacity(agents.len());
        for share in strategy.split(agents.len())? {
            events.push(Event::NextStageStarted {
                strategy: share.to_descriptor()?,
                timer: timer.clone(),
            });
        }
        future::try_join_all(
            agents
                .iter()
                .zip(events)
                .map(|(agent, event)| agent.send(event)),
        )
        .await?;
        Ok(())
    }

    /// Tell every worker the plan finished (`done`) or was interrupted.
    pub async fn stop(&self, done: bool) -> Result<(), SkeinError> {
        let event = if done {
            Event::PlanFinished
        } else {
            Event::PlanInterrupted
        };
        self.broadcast(event).await
    }

    /// Collect and merge one snapshot from every worker.
    ///
    /// `full_history` selects cumulative rather than windowed figures.
    pub async fn aggregate(&self, full_history: bool) -> Result<SummaryReport, SkeinError> {
        let agents = self.workers().await;
        let (batch, waits) = {
            let mut batches = self.batches.lock().await;
            let batch = batches.counter;
            batches.counter = batches.counter.wrapping_add(1);
            if agents.is_empty() {
                return Err(SkeinError::NoWorkers);
            }
            let mut callbacks = HashMap::with_capacity(agents.len());
            let mut waits = Vec::with_capacity(agents.len());
            for agent in agents {
                let (tx, rx) = oneshot::channel();
                callbacks.insert(agent.id().to_string(), Some(tx));
                waits.push((agent, rx));
            }
            batches.pending.insert(batch, callbacks);
            (batch, waits)
        };

        let result = self.collect(batch, waits, full_history).await;
        // Whatever happened, this batch is done.
        self.batches.lock().await.pending.remove(&batch);
        result
    }

    async fn collect(
        &self,
        batch: BatchId,
        waits: Vec<(Arc<WorkerAgent>, oneshot::Receiver<StatisticianGroup>)>,
        full_history: bool,
    ) -> Result<SummaryReport, SkeinError> {
        let deadline = tokio::time::Instant::now() + self.config.aggregate_timeout;
        let rounds = waits.into_iter().map(|(agent, submitted)| async move {
            let worker_id = agent.id().to_string();
            let round = async {
                agent.send(Event::StatsAggregate { batch_id: batch }).await?;
                submitted.await.map_err(|_| SkeinError::Aggregate {
                    batch,
                    detail: format!("[{}] submission was abandoned", worker_id),
                })
            };
            match tokio::time::timeout_at(deadline, round).await {
                Ok(Ok(group)) => Ok(group),
                Ok(Err(e @ SkeinError::Aggregate { .. })) => Err(e),
                Ok(Err(e)) => Err(SkeinError::Aggregate {
                    batch,
                    detail: format!("[{}] {}", worker_id, e),
                }),
                Err(_) => Err(SkeinError::Aggregate {
                    batch,
                    detail: format!("[{}] not submitted by the deadline", worker_id),
                }),
            }
        });
        let groups = future::try_join_all(rounds).await?;

        let counter = self.batches.lock().await.counter;
        if counter.wrapping_sub(batch.wrapping_add(1)) > self.config.tolerance_for_delay {
            return Err(SkeinError::Aggregate {
                batch,
                detail: "too late to accept summary report".to_string(),
            });
        }

        let mut merged = StatisticianGroup::new();
        for group in groups.iter() {
            merged.merge(group).map_err(|e| SkeinError::Aggregate {
                batch,
                detail: e.to_string(),
            })?;
        }
        Ok(merged.report(full_history))
    }

    /// Hand a worker's snapshot to the round waiting for it.
    pub async fn submit(&self, request: SubmitRequest) -> SubmitResult {
        let SubmitRequest {
            worker_id,
            batch_id,
            stats,
        } = request;
        if !self.exists(&worker_id).await {
            warn!("rejected batch {} from unregistered worker {}", batch_id, worker_id);
            return SubmitResult::UnregisteredWorker;
        }
        let group = match StatisticianGroup::try_from(stats) {
            Ok(group) => group,
            Err(e) => {
                warn!("worker {} submitted bad statistics for batch {}: {}", worker_id, batch_id, e);
                return SubmitResult::BadSubmission;
            }
        };

        let mut batches = self.batches.lock().await;
        let callback = batches
            .pending
            .get_mut(&batch_id)
            .and_then(|callbacks| callbacks.get_mut(&worker_id));
        match callback {
            None => {
                warn!("no pending batch {} for worker {}", batch_id, worker_id);
                SubmitResult::BatchRejected
            }
            Some(callback) => match callback.take() {
                None => {
                    warn!("worker {} already submitted batch {}", worker_id, batch_id);
                    SubmitResult::BatchRejected
                }
                Some(sender) => {
                    if sender.send(group).is_err() {
                        warn!("batch {} is no longer waiting for worker {}", batch_id, worker_id);
                        return SubmitResult::BatchRejected;
                    }
                    debug!("accepted batch {} from worker {}", batch_id, worker_id);
                    SubmitResult::Accepted
                }
            },
        }
    }

    /// Batches still waiting for submissions.
    pub(crate) async fn pending_batches(&self) -> usize {
        self.batches.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistics::snapshot::GroupSnapshot;
    use crate::statistics::AttackResult;
    use crate::strategy::FixedConcurrentUsers;

    fn fast() -> SupervisorConfig {
        SupervisorConfig {
            aggregate_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn group(requests: u64) -> StatisticianGroup {
        let mut group = StatisticianGroup::new();
        for n in 0..requests {
            group.record(&AttackResult::success("get", Duration::from_millis(n + 1)));
        }
        group
    }

    // Answer every stats request after `delay`, `copies` times.
    fn answer(
        supervisor: Arc<Supervisor>,
        worker_id: &str,
        events: flume::Receiver<Event>,
        stats: StatisticianGroup,
        delay: Duration,
        copies: usize,
    ) -> tokio::task::JoinHandle<Vec<SubmitResult>> {
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let mut submissions = Vec::new();
            while let Ok(event) = events.recv_async().await {
                match event {
                    Event::StatsAggregate { batch_id } => {
                        let supervisor = Arc::clone(&supervisor);
                        let request = SubmitRequest {
                            worker_id: worker_id.clone(),
                            batch_id,
                            stats: GroupSnapshot::from(&stats),
                        };
                        submissions.push(tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let mut results = Vec::new();
                            for _ in 0..copies {
                                results.push(supervisor.submit(request.clone()).await);
                            }
                            results
                        }));
                    }
                    Event::Disconnect => break,
                    _ => {}
                }
            }
            let mut results = Vec::new();
            for submission in submissions {
                results.extend(submission.await.unwrap());
            }
            results
        })
    }

    #[tokio::test]
    async fn registration() {
        let supervisor = Supervisor::new(fast());
        let (_agent, events) = supervisor.subscribe("w-1", BTreeMap::new()).await.unwrap();
        assert_eq!(events.recv_async().await.unwrap(), Event::Connected);
        assert!(supervisor.subscribe("w-1", BTreeMap::new()).await.is_err());
        assert!(supervisor.subscribe("", BTreeMap::new()).await.is_err());
        assert!(supervisor.exists("w-1").await);
        assert_eq!(supervisor.get("w-1").await.unwrap().id(), "w-1");

        supervisor.unsubscribe("w-1").await;
        assert!(!supervisor.exists("w-1").await);
        assert_eq!(events.recv_async().await.unwrap(), Event::Disconnect);
        // The id can be reused.
        assert!(supervisor.subscribe("w-1", BTreeMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn connected_comes_before_broadcasts() {
        let supervisor = Arc::new(Supervisor::new(fast()));
        let (_agent, events) = supervisor.subscribe("w-1", BTreeMap::new()).await.unwrap();
        // Broadcast as soon as the worker is visible, before its queue is read.
        let broadcaster = Arc::clone(&supervisor);
        let broadcast = tokio::spawn(async move { broadcaster.start_new_plan("early").await });
        tokio::task::yield_now().await;

        assert_eq!(events.recv_async().await.unwrap(), Event::Connected);
        assert_eq!(
            events.recv_async().await.unwrap(),
            Event::PlanStarted {
                plan_name: "early".to_string()
            }
        );
        broadcast.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn aggregation_without_workers_fails() {
        let supervisor = Supervisor::new(fast());
        match supervisor.aggregate(false).await {
            Err(SkeinError::NoWorkers) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(supervisor.stop(true).await.is_err());
        assert_eq!(supervisor.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn aggregation_merges_every_worker() {
        let supervisor = Arc::new(Supervisor::new(fast()));
        let mut answering = Vec::new();
        for (id, requests) in [("w-1", 3), ("w-2", 5)].iter() {
            let (_, events) = supervisor.subscribe(id, BTreeMap::new()).await.unwrap();
            answering.push(answer(
                Arc::clone(&supervisor),
                id,
                events,
                group(*requests),
                Duration::from_millis(10),
                1,
            ));
        }

        let report = supervisor.aggregate(true).await.unwrap();
        assert_eq!(report.total_requests, 8);
        assert_eq!(report.reports["get"].max, Duration::from_millis(5));
        assert_eq!(supervisor.pending_batches().await, 0);

        supervisor.close().await;
        for answers in answering {
            assert_eq!(answers.await.unwrap(), vec![SubmitResult::Accepted]);
        }
    }

    #[tokio::test]
    async fn silent_workers_fail_the_round() {
        let supervisor = Arc::new(Supervisor::new(fast()));
        let (_, silent) = supervisor.subscribe("silent", BTreeMap::new()).await.unwrap();
        // Drain events without ever submitting.
        let drain = tokio::spawn(async move { while silent.recv_async().await.is_ok() {} });

        match supervisor.aggregate(false).await {
            Err(SkeinError::Aggregate { batch, .. }) => assert_eq!(batch, 0),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(supervisor.pending_batches().await, 0);

        // Later rounds are unaffected once the worker is gone.
        supervisor.unsubscribe("silent").await;
        drain.await.unwrap();
        let (_, events) = supervisor.subscribe("chatty", BTreeMap::new()).await.unwrap();
        let _answers = answer(
            Arc::clone(&supervisor),
            "chatty",
            events,
            group(2),
            Duration::from_millis(0),
            1,
        );
        let report = supervisor.aggregate(false).await.unwrap();
        assert_eq!(report.total_requests, 2);
        assert_eq!(supervisor.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn double_submission_is_rejected() {
        let supervisor = Arc::new(Supervisor::new(fast()));
        let (_, events) = supervisor.subscribe("twice", BTreeMap::new()).await.unwrap();
        let answers = answer(
            Arc::clone(&supervisor),
            "twice",
            events,
            group(4),
            Duration::from_millis(0),
            2,
        );

        let report = supervisor.aggregate(true).await.unwrap();
        assert_eq!(report.total_requests, 4);
        supervisor.close().await;
        assert_eq!(
            answers.await.unwrap(),
            vec![SubmitResult::Accepted, SubmitResult::BatchRejected]
        );
    }

    #[tokio::test]
    async fn submissions_are_validated() {
        let supervisor = Supervisor::new(fast());
        let request = |worker_id: &str, stats: GroupSnapshot| SubmitRequest {
            worker_id: worker_id.to_string(),
            batch_id: 7,
            stats,
        };
        assert_eq!(
            supervisor.submit(request("nobody", GroupSnapshot::default())).await,
            SubmitResult::UnregisteredWorker
        );

        let _subscription = supervisor.subscribe("w-1", BTreeMap::new()).await.unwrap();
        assert_eq!(
            supervisor.submit(request("w-1", GroupSnapshot::default())).await,
            SubmitResult::BatchRejected
        );

        let mut broken = GroupSnapshot::from(&group(2));
        broken.statisticians[0].requests = 99;
        assert_eq!(
            supervisor.submit(request("w-1", broken)).await,
            SubmitResult::BadSubmission
        );
    }

    #[tokio::test]
    async fn stale_rounds_are_rejected() {
        let supervisor = Arc::new(Supervisor::new(SupervisorConfig {
            aggregate_timeout: Duration::from_secs(2),
            tolerance_for_delay: 0,
            ..Default::default()
        }));
        let (_, events) = supervisor.subscribe("slow", BTreeMap::new()).await.unwrap();
        let _answers = answer(
            Arc::clone(&supervisor),
            "slow",
            events,
            group(1),
            Duration::from_millis(50),
            1,
        );

        // Both batches are allocated before either is answered.
        let (older, newer) = tokio::join!(supervisor.aggregate(false), supervisor.aggregate(false));
        match older {
            Err(SkeinError::Aggregate { batch, detail }) => {
                assert_eq!(batch, 0);
                assert!(detail.contains("too late"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(newer.unwrap().total_requests, 1);
        assert_eq!(supervisor.pending_batches().await, 0);
    }

    #[tokio::test]
    async fn stages_are_split_across_workers() {
        let supervisor = Supervisor::new(fast());
        let mut queues = Vec::new();
        for id in ["a", "b", "c"].iter() {
            let (_, events) = supervisor.subscribe(id, BTreeMap::new()).await.unwrap();
            assert_eq!(events.recv_async().await.unwrap(), Event::Connected);
            queues.push(events);
        }

        let strategy: AttackStrategy = FixedConcurrentUsers::new(10, 0).into();
        supervisor.next_stage(&strategy, None).await.unwrap();
        let mut users = Vec::new();
        for events in queues.iter() {
            match events.recv_async().await.unwrap() {
                Event::NextStageStarted { strategy, timer } => {
                    users.push(AttackStrategy::from_descriptor(&strategy).unwrap().concurrent_users());
                    assert_eq!(Timer::from_descriptor(&timer).unwrap(), Timer::NonStop);
                }
                other => panic!("unexpected {}", other),
            }
        }
        users.sort_unstable();
        assert_eq!(users, vec![3, 3, 4]);

        supervisor.start_new_plan("smoke").await.unwrap();
        for events in queues.iter() {
            assert_eq!(
                events.recv_async().await.unwrap(),
                Event::PlanStarted {
                    plan_name: "smoke".to_string()
                }
            );
        }
    }
}
