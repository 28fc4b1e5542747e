//! Test plans: an ordered list of stages and the rules for moving between them.
//!
//! A [`Plan`] starts out [`PlanStatus::Ready`]. Once [`Plan::check`] has validated and
//! locked it, the scheduler repeatedly hands it the latest [`SummaryReport`] through
//! [`Plan::stop_current_and_start_next`]. Each stage's exit condition is compared with
//! what happened *during that stage*: the requests and elapsed time consumed by earlier
//! stages are subtracted from the report's totals first.
//!
//! Plans can also be written as strings, one `users,ramp,exit` triple per stage,
//! separated by semicolons:
//!
//! ```rust
//! use skein::plan::Plan;
//!
//! // Ramp to 10 users over 5 seconds and hold for one minute, then to 50 users
//! // over 10 seconds until 100,000 requests have been made, then hold 20 users forever.
//! let plan: Plan = "10,5s,1m;50,10s,100000r;20,0,0".parse().unwrap();
//! assert_eq!(plan.stages().len(), 3);
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use strum_macros::Display;

use crate::statistics::SummaryReport;
use crate::strategy::{AttackStrategy, FixedConcurrentUsers};
use crate::timer::Timer;
use crate::util::{self, duration_nanos};
use crate::SkeinError;

/// Name given to plans created without one.
pub const UNKNOWN_PLAN: &str = "unknown";

/// Lifecycle of a [`Plan`]. `Finished` and `Interrupted` are terminal.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum PlanStatus {
    Ready,
    Running,
    Finished,
    Interrupted,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Finished | PlanStatus::Interrupted)
    }
}

/// When a stage ends: after `requests` results or after `duration`, whichever comes first.
///
/// A zero field is ignored; if both are zero the stage never ends on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitConditions {
    #[serde(default)]
    pub requests: u64,
    #[serde(default, with = "duration_nanos")]
    pub duration: Duration,
}

impl ExitConditions {
    pub fn after_requests(requests: u64) -> Self {
        ExitConditions {
            requests,
            ..Default::default()
        }
    }

    pub fn after_duration(duration: Duration) -> Self {
        ExitConditions {
            duration,
            ..Default::default()
        }
    }

    pub fn never_stop(&self) -> bool {
        self.requests == 0 && self.duration == Duration::from_secs(0)
    }

    /// Whether `actual` progress satisfies these conditions.
    pub fn met_by(&self, actual: &ExitConditions) -> bool {
        if self.never_stop() {
            return false;
        }
        (self.duration > Duration::from_secs(0) && self.duration <= actual.duration)
            || (self.requests > 0 && self.requests <= actual.requests)
    }
}

/// One phase of a [`Plan`].
#[derive(Clone, Debug, PartialEq)]
pub struct Stage {
    pub strategy: AttackStrategy,
    pub timer: Timer,
    pub exit_conditions: ExitConditions,
}

impl Stage {
    /// A stage running `strategy` without pauses, until the plan is stopped.
    pub fn new<S: Into<AttackStrategy>>(strategy: S) -> Self {
        Stage {
            strategy: strategy.into(),
            timer: Timer::NonStop,
            exit_conditions: ExitConditions::default(),
        }
    }

    pub fn with_timer(mut self, timer: Timer) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_exit_conditions(mut self, exit_conditions: ExitConditions) -> Self {
        self.exit_conditions = exit_conditions;
        self
    }
}

/// What [`Plan::stop_current_and_start_next`] decided.
#[derive(Clone, Debug, PartialEq)]
pub enum Advance {
    /// The current stage keeps running.
    Unchanged,
    /// The stage with this index starts now.
    Started(usize, Stage),
    /// The last stage just ended and the plan is now finished.
    Finished,
}

/// An ordered list of stages.
#[derive(Clone, Debug)]
pub struct Plan {
    name: String,
    stages: Vec<Stage>,
    status: PlanStatus,
    current: Option<usize>,
    locked: bool,
    // What each completed stage actually consumed.
    actual: Vec<ExitConditions>,
}

impl Plan {
    pub fn new(name: &str) -> Self {
        let name = if name.is_empty() { UNKNOWN_PLAN } else { name };
        Plan {
            name: name.to_string(),
            stages: Vec::new(),
            status: PlanStatus::Ready,
            current: None,
            locked: false,
            actual: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        if !name.is_empty() {
            self.name = name.to_string();
        }
    }

    /// Append a stage; only allowed before the plan is checked.
    pub fn add_stage(&mut self, stage: Stage) -> Result<(), SkeinError> {
        if self.locked || self.status != PlanStatus::Ready {
            return Err(SkeinError::InvalidPlan {
                detail: format!("cannot add stages to plan {} once it is locked", self.name),
            });
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Builder form of [`Plan::add_stage`].
    pub fn with_stage(mut self, stage: Stage) -> Result<Self, SkeinError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn status(&self) -> PlanStatus {
        self.status
    }

    /// The running stage, if any.
    pub fn current(&self) -> Option<(usize, &Stage)> {
        self.current.map(|index| (index, &self.stages[index]))
    }

    pub(crate) fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Validate the plan and lock its stages.
    ///
    /// Every strategy must be runnable and only the last stage may run forever.
    pub fn check(&mut self) -> Result<(), SkeinError> {
        if self.status != PlanStatus::Ready {
            return Err(SkeinError::InvalidPlan {
                detail: format!("cannot start plan {} while {}", self.name, self.status),
            });
        }
        if self.stages.is_empty() {
            return Err(SkeinError::InvalidPlan {
                detail: format!("plan {} has no stages", self.name),
            });
        }
        let last = self.stages.len() - 1;
        for (index, stage) in self.stages.iter().enumerate() {
            stage.strategy.validate()?;
            if index < last && stage.exit_conditions.never_stop() {
                return Err(SkeinError::InvalidPlan {
                    detail: format!("stage {} never stops but is not the last stage", index),
                });
            }
        }
        self.locked = true;
        self.actual = vec![ExitConditions::default(); self.stages.len()];
        Ok(())
    }

    /// Move from stage `expected` to the next one if its exit condition is met by `report`.
    ///
    /// `expected` is `None` to start the first stage. A stale `expected` leaves the plan
    /// unchanged. Fails with [`SkeinError::PlanClosed`] once the plan is finished or
    /// interrupted.
    pub fn stop_current_and_start_next(
        &mut self,
        expected: Option<usize>,
        report: &SummaryReport,
    ) -> Result<Advance, SkeinError> {
        if !self.locked {
            return Err(SkeinError::InvalidPlan {
                detail: format!("plan {} was not checked before starting", self.name),
            });
        }

        match (self.status, self.current) {
            (status, _) if status.is_terminal() => Err(SkeinError::PlanClosed),
            (PlanStatus::Running, Some(current)) => {
                if expected != Some(current) || !self.finished_stage(current, report) {
                    return Ok(Advance::Unchanged);
                }
                if current + 1 >= self.stages.len() {
                    self.status = PlanStatus::Finished;
                    info!("plan {} finished after stage {}", self.name, current);
                    return Ok(Advance::Finished);
                }
                let next = current + 1;
                self.current = Some(next);
                info!("plan {} moved from stage {} to stage {}", self.name, current, next);
                Ok(Advance::Started(next, self.stages[next].clone()))
            }
            (PlanStatus::Ready, None) => {
                self.status = PlanStatus::Running;
                self.current = Some(0);
                info!("plan {} started stage 0", self.name);
                Ok(Advance::Started(0, self.stages[0].clone()))
            }
            (status, current) => Err(SkeinError::InvalidPlan {
                detail: format!(
                    "plan {} is {} with current stage {:?}",
                    self.name, status, current
                ),
            }),
        }
    }

    // Compare stage-relative progress against the stage's exit conditions, recording
    // what the stage consumed once it is done.
    fn finished_stage(&mut self, index: usize, report: &SummaryReport) -> bool {
        let previous_requests: u64 = self.actual[..index].iter().map(|a| a.requests).sum();
        let previous_duration: Duration = self.actual[..index].iter().map(|a| a.duration).sum();
        let progress = ExitConditions {
            requests: report.total_results().saturating_sub(previous_requests),
            duration: report.elapsed().saturating_sub(previous_duration),
        };
        if self.stages[index].exit_conditions.met_by(&progress) {
            debug!("stage {} consumed {:?}", index, progress);
            self.actual[index] = progress;
            true
        } else {
            false
        }
    }

    /// Mark the plan interrupted, unless it already finished.
    pub fn interrupt(&mut self) {
        if self.status != PlanStatus::Finished {
            self.status = PlanStatus::Interrupted;
        }
    }
}

fn invalid_plan_string(value: &str, detail: &str) -> SkeinError {
    SkeinError::InvalidOption {
        option: "--plan".to_string(),
        value: value.to_string(),
        detail: detail.to_string(),
    }
}

/// Parse `"users,ramp,exit;users,ramp,exit"` into a plan named `unknown`.
///
/// `ramp` is a time span. `exit` is a time span, a request count suffixed with `r`,
/// or `0` for a stage that never stops. White space is ignored.
impl FromStr for Plan {
    type Err = SkeinError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut plan = Plan::new(UNKNOWN_PLAN);
        for line in s.split(';').map(str::trim).filter(|line| !line.is_empty()) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() != 3 {
                return Err(invalid_plan_string(
                    line,
                    "expected \"{users},{ramp},{exit}\", ie \"100,30s,10m\"",
                ));
            }
            let users = fields[0]
                .parse::<usize>()
                .map_err(|_| invalid_plan_string(line, "users must be an integer"))?;
            let ramp_up_period = util::parse_timespan(fields[1])?.as_secs();
            let exit_conditions = match fields[2].strip_suffix('r') {
                Some(requests) => ExitConditions::after_requests(
                    requests
                        .parse::<u64>()
                        .map_err(|_| invalid_plan_string(line, "request count must be an integer"))?,
                ),
                None => ExitConditions::after_duration(util::parse_timespan(fields[2])?),
            };
            plan.add_stage(
                Stage::new(FixedConcurrentUsers::new(users, ramp_up_period))
                    .with_exit_conditions(exit_conditions),
            )?;
        }
        if plan.stages.is_empty() {
            return Err(invalid_plan_string(s, "a plan needs at least one stage"));
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn stage(users: usize, exit_conditions: ExitConditions) -> Stage {
        Stage::new(FixedConcurrentUsers::new(users, 0)).with_exit_conditions(exit_conditions)
    }

    fn report(requests: u64, elapsed: Duration) -> SummaryReport {
        let first = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        SummaryReport {
            first_attack: Some(first),
            last_attack: Some(first + chrono::Duration::from_std(elapsed).unwrap()),
            total_requests: requests,
            ..Default::default()
        }
    }

    #[test]
    fn exit_conditions() {
        let never = ExitConditions::default();
        assert!(never.never_stop());
        assert!(!never.met_by(&ExitConditions::after_requests(u64::MAX)));

        let either = ExitConditions {
            requests: 100,
            duration: Duration::from_secs(60),
        };
        assert!(either.met_by(&ExitConditions::after_requests(100)));
        assert!(either.met_by(&ExitConditions::after_duration(Duration::from_secs(61))));
        assert!(!either.met_by(&ExitConditions {
            requests: 99,
            duration: Duration::from_secs(59)
        }));
    }

    #[test]
    fn check_rejects_bad_plans() {
        assert!(Plan::new("empty").check().is_err());

        let mut plan = Plan::new("endless-middle")
            .with_stage(stage(10, ExitConditions::default()))
            .unwrap()
            .with_stage(stage(10, ExitConditions::after_requests(10)))
            .unwrap();
        assert!(plan.check().is_err());

        let mut plan = Plan::new("no-users")
            .with_stage(stage(0, ExitConditions::default()))
            .unwrap();
        assert!(plan.check().is_err());

        let mut plan = Plan::new("")
            .with_stage(stage(1, ExitConditions::default()))
            .unwrap();
        assert_eq!(plan.name(), "unknown");
        assert!(plan.check().is_ok());
        assert!(plan.add_stage(stage(1, ExitConditions::default())).is_err());
    }

    #[test]
    fn stages_advance_on_relative_progress() {
        let hour = Duration::from_secs(3_600);
        let mut plan = Plan::new("soak")
            .with_stage(stage(10, ExitConditions::after_duration(hour)))
            .unwrap()
            .with_stage(stage(20, ExitConditions::after_requests(1_048_576)))
            .unwrap();
        plan.check().unwrap();

        let start = plan
            .stop_current_and_start_next(None, &SummaryReport::default())
            .unwrap();
        assert_eq!(start, Advance::Started(0, plan.stages()[0].clone()));
        assert_eq!(plan.status(), PlanStatus::Running);

        let prior = 7_000;
        let half_hour = report(prior, Duration::from_secs(30 * 60));
        assert_eq!(
            plan.stop_current_and_start_next(Some(0), &half_hour).unwrap(),
            Advance::Unchanged
        );

        let past_the_hour = report(prior, Duration::from_secs(61 * 60));
        let next = plan.stop_current_and_start_next(Some(0), &past_the_hour).unwrap();
        assert_eq!(next, Advance::Started(1, plan.stages()[1].clone()));
        assert_eq!(plan.current().map(|(index, _)| index), Some(1));

        // A stale caller doesn't move the plan.
        assert_eq!(
            plan.stop_current_and_start_next(Some(0), &report(u64::MAX / 2, hour * 5))
                .unwrap(),
            Advance::Unchanged
        );

        let almost = report(prior + 1_048_575, Duration::from_secs(90 * 60));
        assert_eq!(
            plan.stop_current_and_start_next(Some(1), &almost).unwrap(),
            Advance::Unchanged
        );
        let done = report(prior + 1_048_576, Duration::from_secs(90 * 60));
        assert_eq!(
            plan.stop_current_and_start_next(Some(1), &done).unwrap(),
            Advance::Finished
        );
        assert_eq!(plan.status(), PlanStatus::Finished);

        match plan.stop_current_and_start_next(Some(1), &done) {
            Err(SkeinError::PlanClosed) => {}
            other => panic!("expected a closed plan, got {:?}", other),
        }
        // Finished plans stay finished.
        plan.interrupt();
        assert_eq!(plan.status(), PlanStatus::Finished);
    }

    #[test]
    fn interrupted_plans_are_closed() {
        let mut plan = Plan::new("short")
            .with_stage(stage(1, ExitConditions::default()))
            .unwrap();
        plan.check().unwrap();
        plan.stop_current_and_start_next(None, &SummaryReport::default())
            .unwrap();
        plan.interrupt();
        assert_eq!(plan.status(), PlanStatus::Interrupted);
        assert_eq!(plan.status().to_string(), "interrupted");
        assert!(plan
            .stop_current_and_start_next(Some(0), &SummaryReport::default())
            .is_err());
    }

    #[test]
    fn unchecked_plans_cannot_start() {
        let mut plan = Plan::new("unchecked")
            .with_stage(stage(1, ExitConditions::default()))
            .unwrap();
        assert!(plan
            .stop_current_and_start_next(None, &SummaryReport::default())
            .is_err());
    }

    #[test]
    fn parse_plan_strings() {
        let plan: Plan = "10,5s,1m; 50, 10s, 100000r ;20,0,0".parse().unwrap();
        assert_eq!(plan.name(), "unknown");
        let ramped = |users: usize, ramp: u64, exit_conditions: ExitConditions| {
            Stage::new(FixedConcurrentUsers::new(users, ramp)).with_exit_conditions(exit_conditions)
        };
        assert_eq!(
            plan.stages(),
            &[
                ramped(10, 5, ExitConditions::after_duration(Duration::from_secs(60))),
                ramped(50, 10, ExitConditions::after_requests(100_000)),
                ramped(20, 0, ExitConditions::default()),
            ]
        );

        // A trailing separator is fine.
        assert_eq!("1,0,1h30m;".parse::<Plan>().unwrap().stages().len(), 1);

        assert!("".parse::<Plan>().is_err());
        assert!("10,5s".parse::<Plan>().is_err());
        assert!("ten,5s,1m".parse::<Plan>().is_err());
        assert!("10,5x,1m".parse::<Plan>().is_err());
        assert!("10,5s,manyr".parse::<Plan>().is_err());
    }
}
