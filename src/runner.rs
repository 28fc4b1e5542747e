//! Runners tie the pieces together for one process.
//!
//! A [`MasterRunner`] serves workers and schedules plans across them. A [`LocalRunner`]
//! runs a plan in-process with a single [`Commander`], checking exit conditions
//! against its own statistics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::commander::Commander;
use crate::eventbus::{EventBus, ReportHandler, ResultHandler};
use crate::gaggle::manager::{bind_manager, manager_main};
use crate::gaggle::supervisor::{Supervisor, SupervisorConfig};
use crate::plan::{Advance, Plan, PlanStatus};
use crate::scheduler::Scheduler;
use crate::statistics::{StatisticianGroup, SummaryReport, PLAN_TAG};
use crate::strategy::AttackStrategy;
use crate::task::Task;
use crate::timer::Timer;
use crate::util::CancelHandle;
use crate::SkeinError;

/// Log a one-line summary of every report.
pub fn log_report(report: &SummaryReport) {
    let plan = report.extras.get(PLAN_TAG).map(String::as_str).unwrap_or("-");
    if report.full_history {
        info!("[{}] final: {}", plan, report);
    } else {
        info!("[{}] {}", plan, report);
    }
}

// The plan being scheduled and its patrol loop.
struct ActivePlan {
    scheduler: Arc<Scheduler>,
    patrol: Option<JoinHandle<Result<(), SkeinError>>>,
}

/// Serves workers and runs plans across them.
pub struct MasterRunner {
    supervisor: Arc<Supervisor>,
    bus: EventBus,
    patrol_interval: Duration,
    active: Mutex<Option<ActivePlan>>,
    shutdown: CancelHandle,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl MasterRunner {
    pub fn new(config: SupervisorConfig, patrol_interval: Duration) -> Self {
        MasterRunner {
            supervisor: Arc::new(Supervisor::new(config)),
            bus: EventBus::new(),
            patrol_interval,
            active: Mutex::new(None),
            shutdown: CancelHandle::new(),
            server: Mutex::new(None),
        }
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Call `handler` with every report, windowed ones while a plan runs and a final
    /// cumulative one when it stops.
    pub async fn subscribe_report(&self, handler: ReportHandler) {
        self.bus.subscribe_report(handler).await;
    }

    /// Bind `address` and serve workers in the background. Returns the bound address,
    /// which is useful when binding port 0.
    pub async fn launch(&self, address: &str) -> Result<SocketAddr, SkeinError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(SkeinError::InvalidOption {
                option: "manager_bind".to_string(),
                value: address.to_string(),
                detail: "the manager is already serving workers".to_string(),
            });
        }
        let (listener, local_address) = bind_manager(address).await?;
        self.bus.subscribe_report(Arc::new(log_report)).await;
        self.bus.start().await;
        *server = Some(tokio::spawn(manager_main(
            listener,
            Arc::clone(&self.supervisor),
            self.shutdown.clone(),
        )));
        Ok(local_address)
    }

    /// Wait until at least `count` workers are subscribed. Returns false if `cancel`
    /// fires first.
    pub async fn wait_for_workers(&self, count: usize, cancel: &CancelHandle) -> bool {
        let mut announced = usize::MAX;
        loop {
            let subscribed = self.supervisor.workers().await.len();
            if subscribed >= count {
                return true;
            }
            if subscribed != announced {
                info!("waiting for workers: {} of {} subscribed", subscribed, count);
                announced = subscribed;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    /// Start `plan` on every subscribed worker and patrol it in the background.
    ///
    /// Fails while a previous plan is still running.
    pub async fn start_plan(&self, plan: Plan) -> Result<(), SkeinError> {
        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            if current.scheduler.status().await == PlanStatus::Running {
                return Err(SkeinError::InvalidPlan {
                    detail: format!("plan {} is still running", current.scheduler.plan_name().await),
                });
            }
        }

        let scheduler = Arc::new(Scheduler::new(plan, Arc::clone(&self.supervisor), self.bus.clone()));
        scheduler.start().await?;
        info!("plan {} started", scheduler.plan_name().await);

        let patrolling = Arc::clone(&scheduler);
        let every = self.patrol_interval;
        let patrol = tokio::spawn(async move { patrolling.patrol(every).await });
        *active = Some(ActivePlan {
            scheduler,
            patrol: Some(patrol),
        });
        Ok(())
    }

    /// Interrupt the running plan.
    pub async fn stop_plan(&self) -> Result<(), SkeinError> {
        let scheduler = match self.active.lock().await.as_ref() {
            Some(current) => Arc::clone(&current.scheduler),
            None => {
                return Err(SkeinError::InvalidPlan {
                    detail: "no plan was started".to_string(),
                })
            }
        };
        scheduler.stop(false).await
    }

    /// Status of the most recent plan, if any.
    pub async fn plan_status(&self) -> Option<PlanStatus> {
        match self.active.lock().await.as_ref() {
            Some(current) => Some(current.scheduler.status().await),
            None => None,
        }
    }

    /// Wait for the current plan's patrol to end, whether it finished or was stopped.
    pub async fn wait_plan(&self) -> Result<(), SkeinError> {
        let patrol = self.active.lock().await.as_mut().and_then(|current| current.patrol.take());
        match patrol {
            Some(patrol) => patrol.await?,
            None => Ok(()),
        }
    }

    /// Interrupt any running plan, disconnect every worker and stop serving.
    pub async fn shutdown(&self) {
        if self.plan_status().await == Some(PlanStatus::Running) {
            if let Err(e) = self.stop_plan().await {
                warn!("failed to stop plan during shutdown: {}", e);
            }
        }
        if let Err(e) = self.wait_plan().await {
            warn!("patrol ended with an error: {}", e);
        }
        self.shutdown.cancel();
        self.supervisor.close().await;
        if let Some(server) = self.server.lock().await.take() {
            if let Err(e) = server.await {
                warn!("manager server failed: {}", e);
            }
        }
        self.bus.close().await;
        info!("manager shut down");
    }
}

/// Runs plans in-process, without workers.
pub struct LocalRunner {
    task: Arc<Task>,
    bus: EventBus,
    patrol_interval: Duration,
    stats: Arc<Mutex<StatisticianGroup>>,
}

impl LocalRunner {
    pub fn new(task: Arc<Task>, patrol_interval: Duration) -> Self {
        LocalRunner {
            task,
            bus: EventBus::new(),
            patrol_interval,
            stats: Arc::new(Mutex::new(StatisticianGroup::new())),
        }
    }

    pub async fn subscribe_report(&self, handler: ReportHandler) {
        self.bus.subscribe_report(handler).await;
    }

    pub async fn subscribe_result(&self, handler: ResultHandler) {
        self.bus.subscribe_result(handler).await;
    }

    /// Run `plan` until its last stage ends or `stop` fires, and return the final
    /// cumulative report. Handlers have seen every report once this returns.
    pub async fn run(self, mut plan: Plan, stop: CancelHandle) -> Result<SummaryReport, SkeinError> {
        plan.check()?;
        {
            let mut stats = self.stats.lock().await;
            stats.reset();
            stats.attach(PLAN_TAG, plan.name());
        }
        self.bus.subscribe_report(Arc::new(log_report)).await;
        self.bus.start().await;

        let (commander, results) = Commander::open(Arc::clone(&self.task));
        let commander = Arc::new(commander);
        let recorder = {
            let stats = Arc::clone(&self.stats);
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let publish = bus.has_result_handlers().await;
                while let Ok(result) = results.recv_async().await {
                    stats.lock().await.record(&result);
                    if publish {
                        bus.publish_result(result).await;
                    }
                }
            })
        };
        // Ramping up can take a while, stages are applied in the background.
        let (stages, queued) = flume::unbounded::<(AttackStrategy, Timer)>();
        let driver = {
            let commander = Arc::clone(&commander);
            tokio::spawn(async move {
                while let Ok((strategy, timer)) = queued.recv_async().await {
                    if let Err(e) = commander.command(strategy, Some(timer)).await {
                        error!("failed to apply stage: {}", e);
                    }
                }
            })
        };

        let outcome = self.patrol(&mut plan, &stages, &stop).await;

        drop(stages);
        commander.close().await;
        driver.await?;
        recorder.await?;

        let report = self.stats.lock().await.report(true);
        self.bus.publish_report(report.clone()).await;
        self.bus.close().await;
        outcome.map(|_| report)
    }

    async fn patrol(
        &self,
        plan: &mut Plan,
        stages: &flume::Sender<(AttackStrategy, Timer)>,
        stop: &CancelHandle,
    ) -> Result<(), SkeinError> {
        let mut stage_index = match plan.stop_current_and_start_next(None, &SummaryReport::default())? {
            Advance::Started(index, stage) => {
                self.send_stage(stages, stage.strategy, stage.timer)?;
                Some(index)
            }
            advance => {
                return Err(SkeinError::InvalidPlan {
                    detail: format!("plan {} could not start: {:?}", plan.name(), advance),
                })
            }
        };
        info!("plan {} started", plan.name());

        let mut ticker = tokio::time::interval(self.patrol_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => {
                    plan.interrupt();
                    info!("plan {} interrupted", plan.name());
                    return Ok(());
                }
            }

            let report = self.stats.lock().await.report(false);
            self.bus.publish_report(report.clone()).await;
            match plan.stop_current_and_start_next(stage_index, &report) {
                Ok(Advance::Unchanged) => {}
                Ok(Advance::Started(next, stage)) => {
                    self.send_stage(stages, stage.strategy, stage.timer)?;
                    stage_index = Some(next);
                }
                Ok(Advance::Finished) => {
                    info!("plan {} finished", plan.name());
                    return Ok(());
                }
                Err(e) => error!("failed to check the plan: {}", e),
            }
        }
    }

    fn send_stage(
        &self,
        stages: &flume::Sender<(AttackStrategy, Timer)>,
        strategy: AttackStrategy,
        timer: Timer,
    ) -> Result<(), SkeinError> {
        stages.send((strategy, timer)).map_err(|_| SkeinError::Closed {
            detail: "the stage driver stopped".to_string(),
        })
    }
}
