//! Drive one [`Plan`] across every subscribed worker.
//!
//! [`Scheduler::start`] locks the plan and pushes its first stage. [`Scheduler::patrol`]
//! then collects statistics every tick, publishes them, and moves to the next stage
//! once the current one is done. When the last stage ends, or the plan is stopped, a
//! final cumulative report is collected and published.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::eventbus::EventBus;
use crate::gaggle::supervisor::Supervisor;
use crate::plan::{Advance, Plan, PlanStatus};
use crate::statistics::SummaryReport;
use crate::util::CancelHandle;
use crate::SkeinError;

/// Runs a plan on behalf of the manager.
pub struct Scheduler {
    plan: Mutex<Plan>,
    supervisor: Arc<Supervisor>,
    bus: EventBus,
    // Stops patrolling.
    cancel: CancelHandle,
}

impl Scheduler {
    pub fn new(plan: Plan, supervisor: Arc<Supervisor>, bus: EventBus) -> Self {
        Scheduler {
            plan: Mutex::new(plan),
            supervisor,
            bus,
            cancel: CancelHandle::new(),
        }
    }

    pub async fn status(&self) -> PlanStatus {
        self.plan.lock().await.status()
    }

    pub async fn plan_name(&self) -> String {
        self.plan.lock().await.name().to_string()
    }

    /// Validate the plan, announce it, and push its first stage to every worker.
    pub async fn start(&self) -> Result<(), SkeinError> {
        let mut plan = self.plan.lock().await;
        plan.check()?;
        self.supervisor.start_new_plan(plan.name()).await?;
        match plan.stop_current_and_start_next(None, &SummaryReport::default())? {
            Advance::Started(index, stage) => {
                info!("plan {} starting stage {}", plan.name(), index);
                self.supervisor
                    .next_stage(&stage.strategy, Some(stage.timer))
                    .await
            }
            advance => Err(SkeinError::InvalidPlan {
                detail: format!("plan {} could not start: {:?}", plan.name(), advance),
            }),
        }
    }

    /// Every `every`, collect statistics and advance the plan, until it is finished,
    /// interrupted, or the scheduler is stopped.
    ///
    /// Failing collection rounds are logged and retried on the next tick.
    pub async fn patrol(&self, every: Duration) -> Result<(), SkeinError> {
        let mut stage_index = {
            let plan = self.plan.lock().await;
            if plan.status() != PlanStatus::Running {
                return Err(SkeinError::InvalidPlan {
                    detail: format!("cannot patrol plan {} while {}", plan.name(), plan.status()),
                });
            }
            plan.current_index()
        };

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.cancel.cancelled() => {
                    debug!("patrol cancelled");
                    return Ok(());
                }
            }

            let report = match self.supervisor.aggregate(false).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("failed to aggregate stats report: {}", e);
                    continue;
                }
            };
            self.bus.publish_report(report.clone()).await;

            let advance = self
                .plan
                .lock()
                .await
                .stop_current_and_start_next(stage_index, &report);
            match advance {
                Ok(Advance::Unchanged) => {}
                Ok(Advance::Started(next, stage)) => {
                    if let Err(e) = self
                        .supervisor
                        .next_stage(&stage.strategy, Some(stage.timer))
                        .await
                    {
                        error!("failed to send stage {} to workers: {}", next, e);
                    }
                    stage_index = Some(next);
                }
                Ok(Advance::Finished) => {
                    if let Err(e) = self.stop(true).await {
                        warn!("failed to stop finished plan: {}", e);
                    }
                    return Ok(());
                }
                Err(SkeinError::PlanClosed) => {
                    info!("plan is complete, stopping patrol");
                    return Ok(());
                }
                Err(e) => error!("failed to check the plan: {}", e),
            }
        }
    }

    /// Stop the plan: `done` if it ran to completion, interrupted otherwise.
    ///
    /// Workers are notified and one final cumulative report is collected and published,
    /// even if notifying failed. Stopping an interrupted plan again does nothing.
    pub async fn stop(&self, done: bool) -> Result<(), SkeinError> {
        {
            let mut plan = self.plan.lock().await;
            match (plan.status(), done) {
                (PlanStatus::Running, false) => plan.interrupt(),
                (PlanStatus::Finished, true) => {}
                (status, false) if status.is_terminal() => {
                    debug!("plan {} is already {}", plan.name(), status);
                    return Ok(());
                }
                (status, _) => {
                    return Err(SkeinError::InvalidPlan {
                        detail: format!(
                            "cannot stop plan {} as {} while it is {}",
                            plan.name(),
                            if done { "finished" } else { "interrupted" },
                            status
                        ),
                    })
                }
            }
        }

        let notified = self.supervisor.stop(done).await;
        if let Err(e) = notified.as_ref() {
            warn!("failed to stop workers: {}", e);
        }
        self.cancel.cancel();
        info!("cancelled all running manager jobs");

        let aggregated = self.supervisor.aggregate(true).await;
        match (notified, aggregated) {
            (Ok(()), Ok(report)) => {
                self.bus.publish_report(report).await;
                Ok(())
            }
            (Err(e), Ok(report)) => {
                self.bus.publish_report(report).await;
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(notify), Err(aggregate)) => Err(SkeinError::Shutdown {
                detail: format!("recent error: {} last error: {}", aggregate, notify),
            }),
        }
    }
}
