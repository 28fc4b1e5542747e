//! # Skein
//!
//! A skein is a flock of geese in flight.
//!
//! Skein runs load test plans: ordered stages, each with a target number of concurrent
//! users, a pacing timer, and an exit condition. A plan runs in a single process, or
//! is spread over many Worker processes coordinated by one Manager.
//!
//! Load is generated by [`Attacker`](task::Attacker)s, each performing one named
//! transaction. Attackers are registered with a weight, and every simulated user picks
//! the next attacker with a smooth weighted round-robin, so a transaction with weight 3
//! fires three times as often as one with weight 1.
//!
//! ## Creating a load test
//!
//! ```rust,no_run
//! use skein::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SkeinError> {
//!     SkeinAttack::initialize()?
//!         .register_attacker(Arc::new(HttpAttacker::new("index", "http://localhost/")?), 3)?
//!         .register_attacker(Arc::new(HttpAttacker::new("about", "http://localhost/about")?), 1)?
//!         // Ramp to 10 users over 5 seconds and hold for a minute, then ramp to 50 users
//!         // over 10 seconds and stop after 100,000 more requests.
//!         .set_plan("10,5s,1m;50,10s,100000r".parse()?)
//!         .execute()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Running a distributed load test
//!
//! The same application runs as a Manager with `--manager` or as a Worker with
//! `--worker`. The Manager waits for `--expect-workers` Workers to subscribe, then
//! splits each stage's users between them and collects their statistics every
//! `--patrol-interval` to decide when to move on:
//!
//! ```bash
//! cargo run --release -- --manager --expect-workers 2 --plan "100,10s,5m"
//! cargo run --release -- --worker --manager-host 127.0.0.1
//! cargo run --release -- --worker --manager-host 127.0.0.1
//! ```
//!
//! Run with `-h` to list every option.
//!
//! ## License
//!
//! Copyright 2020-21 Jeremy Andrews
//!
//! Licensed under the Apache License, Version 2.0 (the "License");
//! you may not use this file except in compliance with the License.
//! You may obtain a copy of the License at
//!
//! <http://www.apache.org/licenses/LICENSE-2.0>
//!
//! Unless required by applicable law or agreed to in writing, software
//! distributed under the License is distributed on an "AS IS" BASIS,
//! WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//! See the License for the specific language governing permissions and
//! limitations under the License.

#[macro_use]
extern crate log;

pub mod attacker;
pub mod commander;
pub mod config;
pub mod descriptor;
pub mod eventbus;
pub mod gaggle;
pub mod plan;
pub mod prelude;
pub mod runner;
pub mod scheduler;
pub mod statistics;
pub mod strategy;
pub mod task;
pub mod timer;
pub mod util;

use gumdrop::Options;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use crate::config::{RunMode, RunnerConfig, SkeinConfiguration, SkeinDefaults};
use crate::eventbus::{ReportHandler, ResultHandler};
use crate::gaggle::common::{BatchId, SubmitResult};
use crate::gaggle::worker::WorkerRunner;
use crate::plan::Plan;
use crate::runner::{LocalRunner, MasterRunner};
use crate::statistics::{ReportTable, SummaryReport};
use crate::task::{Attacker, Task};
use crate::util::CancelHandle;

/// An enumeration of all errors Skein can return.
#[derive(Debug)]
pub enum SkeinError {
    /// Wraps a [`std::io::Error`](https://doc.rust-lang.org/std/io/struct.Error.html).
    Io(io::Error),
    /// Wraps a [`reqwest::Error`](https://docs.rs/reqwest/*/reqwest/struct.Error.html).
    Reqwest(reqwest::Error),
    /// Wraps a ['tokio::task::JoinError'](https://tokio-rs.github.io/tokio/doc/tokio/task/struct.JoinError.html).
    TokioJoin(tokio::task::JoinError),
    /// Wraps a [`serde_json::Error`](https://docs.rs/serde_json/*/serde_json/struct.Error.html).
    Json(serde_json::Error),
    /// Wraps a [`tungstenite::Error`](https://docs.rs/tungstenite/*/tungstenite/error/enum.Error.html).
    WebSocket(tungstenite::Error),
    /// Wraps a [`url::ParseError`](https://docs.rs/url/*/url/enum.ParseError.html).
    Url(url::ParseError),
    /// Invalid option or value specified, may only be invalid in context.
    InvalidOption {
        /// The invalid option that caused this error, may be only invalid in context.
        option: String,
        /// The invalid value that caused this error, may be only invalid in context.
        value: String,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid wait time specified.
    InvalidWaitTime {
        // The specified minimum wait time.
        min_wait: Duration,
        // The specified maximum wait time.
        max_wait: Duration,
        /// An optional explanation of the error.
        detail: String,
    },
    /// Invalid weight specified.
    InvalidWeight {
        // The specified weight.
        weight: usize,
        /// An optional explanation of the error.
        detail: String,
    },
    /// A strategy that cannot be applied.
    InvalidStrategy { detail: String },
    /// A plan that cannot be started or advanced.
    InvalidPlan { detail: String },
    /// The plan is finished or interrupted and cannot advance any more.
    PlanClosed,
    /// A descriptor whose payload doesn't decode.
    InvalidDescriptor { kind: String, detail: String },
    /// A descriptor kind no registry knows, never silently defaulted.
    UnknownDescriptor { kind: String },
    /// No attacker was registered.
    NoAttackers { detail: String },
    /// Statistics that cannot be merged or rebuilt.
    Statistics { detail: String },
    /// The operation needs at least one subscribed worker.
    NoWorkers,
    /// The worker's event queue is closed.
    WorkerClosed { worker_id: String },
    /// A worker could not be subscribed or unsubscribed cleanly.
    WorkerRegistration { worker_id: String, detail: String },
    /// A statistics collection round failed.
    Aggregate { batch: BatchId, detail: String },
    /// The manager did not accept a statistics submission.
    Submission { result: SubmitResult, detail: String },
    /// The peer broke the manager/worker protocol.
    Protocol { detail: String },
    /// Used after being closed.
    Closed { detail: String },
    /// Stopping a plan failed twice: notifying workers and collecting the final report.
    Shutdown { detail: String },
}

/// Implement a helper to provide a text description of all possible types of errors.
impl SkeinError {
    fn describe(&self) -> &str {
        match *self {
            SkeinError::Io(_) => "io::Error",
            SkeinError::Reqwest(_) => "reqwest::Error",
            SkeinError::TokioJoin(_) => "tokio::task::JoinError",
            SkeinError::Json(_) => "serde_json::Error",
            SkeinError::WebSocket(_) => "tungstenite::Error",
            SkeinError::Url(_) => "url::ParseError",
            SkeinError::InvalidOption { .. } => "invalid option or value specified",
            SkeinError::InvalidWaitTime { .. } => "invalid wait_time specified",
            SkeinError::InvalidWeight { .. } => "invalid weight specified",
            SkeinError::InvalidStrategy { .. } => "invalid strategy",
            SkeinError::InvalidPlan { .. } => "invalid plan",
            SkeinError::PlanClosed => "plan is closed",
            SkeinError::InvalidDescriptor { .. } => "invalid descriptor payload",
            SkeinError::UnknownDescriptor { .. } => "unknown descriptor kind",
            SkeinError::NoAttackers { .. } => "no attackers registered",
            SkeinError::Statistics { .. } => "invalid statistics",
            SkeinError::NoWorkers => "no workers subscribed",
            SkeinError::WorkerClosed { .. } => "worker is closed",
            SkeinError::WorkerRegistration { .. } => "worker registration failed",
            SkeinError::Aggregate { .. } => "failed to aggregate statistics",
            SkeinError::Submission { .. } => "statistics submission rejected",
            SkeinError::Protocol { .. } => "protocol error",
            SkeinError::Closed { .. } => "already closed",
            SkeinError::Shutdown { .. } => "failed to stop plan",
        }
    }
}

/// Implement format trait to allow displaying errors.
impl fmt::Display for SkeinError {
    // Implement display of error with `{}` marker.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SkeinError::Io(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::Reqwest(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::TokioJoin(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::Json(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::WebSocket(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::Url(ref source) => write!(f, "SkeinError: {} ({})", self.describe(), source),
            SkeinError::InvalidOption {
                ref option,
                ref value,
                ref detail,
            } => write!(f, "SkeinError: {} ({} = {}: {})", self.describe(), option, value, detail),
            SkeinError::InvalidWeight { weight, ref detail } => {
                write!(f, "SkeinError: {} ({}: {})", self.describe(), weight, detail)
            }
            SkeinError::UnknownDescriptor { ref kind } => write!(f, "SkeinError: {} ({})", self.describe(), kind),
            SkeinError::InvalidDescriptor { ref kind, ref detail } => {
                write!(f, "SkeinError: {} ({}: {})", self.describe(), kind, detail)
            }
            SkeinError::WorkerClosed { ref worker_id } => {
                write!(f, "SkeinError: {} ({})", self.describe(), worker_id)
            }
            SkeinError::WorkerRegistration {
                ref worker_id,
                ref detail,
            } => write!(f, "SkeinError: {} ({}: {})", self.describe(), worker_id, detail),
            SkeinError::Aggregate { batch, ref detail } => {
                write!(f, "SkeinError: {} (batch {}: {})", self.describe(), batch, detail)
            }
            SkeinError::Submission { result, ref detail } => {
                write!(f, "SkeinError: {} ({:?}: {})", self.describe(), result, detail)
            }
            SkeinError::InvalidWaitTime { ref detail, .. }
            | SkeinError::InvalidStrategy { ref detail }
            | SkeinError::InvalidPlan { ref detail }
            | SkeinError::NoAttackers { ref detail }
            | SkeinError::Statistics { ref detail }
            | SkeinError::Protocol { ref detail }
            | SkeinError::Closed { ref detail }
            | SkeinError::Shutdown { ref detail } => write!(f, "SkeinError: {} ({})", self.describe(), detail),
            SkeinError::PlanClosed | SkeinError::NoWorkers => write!(f, "SkeinError: {}", self.describe()),
        }
    }
}

// Define the lower level source of this error, if any.
impl std::error::Error for SkeinError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            SkeinError::Io(ref source) => Some(source),
            SkeinError::Reqwest(ref source) => Some(source),
            SkeinError::TokioJoin(ref source) => Some(source),
            SkeinError::Json(ref source) => Some(source),
            SkeinError::WebSocket(ref source) => Some(source),
            SkeinError::Url(ref source) => Some(source),
            _ => None,
        }
    }
}

/// Auto-convert Reqwest errors.
impl From<reqwest::Error> for SkeinError {
    fn from(err: reqwest::Error) -> SkeinError {
        SkeinError::Reqwest(err)
    }
}

/// Auto-convert IO errors.
impl From<io::Error> for SkeinError {
    fn from(err: io::Error) -> SkeinError {
        SkeinError::Io(err)
    }
}

/// Auto-convert TokioJoin errors.
impl From<tokio::task::JoinError> for SkeinError {
    fn from(err: tokio::task::JoinError) -> SkeinError {
        SkeinError::TokioJoin(err)
    }
}

/// Auto-convert JSON errors.
impl From<serde_json::Error> for SkeinError {
    fn from(err: serde_json::Error) -> SkeinError {
        SkeinError::Json(err)
    }
}

/// Auto-convert WebSocket errors.
impl From<tungstenite::Error> for SkeinError {
    fn from(err: tungstenite::Error) -> SkeinError {
        SkeinError::WebSocket(err)
    }
}

/// Auto-convert url errors.
impl From<url::ParseError> for SkeinError {
    fn from(err: url::ParseError) -> SkeinError {
        SkeinError::Url(err)
    }
}

/// Global internal state for a load test.
pub struct SkeinAttack {
    /// Options set on the command line.
    configuration: SkeinConfiguration,
    /// Programmatic defaults, overridden by the command line.
    pub(crate) defaults: SkeinDefaults,
    /// Attackers and their weights.
    task: Task,
    /// Plan used unless one is passed with `--plan`.
    plan: Option<Plan>,
    report_handlers: Vec<ReportHandler>,
    result_handlers: Vec<ResultHandler>,
}

impl SkeinAttack {
    /// Load configuration from the command line, exiting with help on bad options.
    ///
    /// # Example
    /// ```rust
    /// use skein::prelude::*;
    ///
    /// let skein_attack = SkeinAttack::initialize();
    /// ```
    pub fn initialize() -> Result<SkeinAttack, SkeinError> {
        Self::initialize_with_config(SkeinConfiguration::parse_args_default_or_exit())
    }

    /// Use an already built configuration, ignoring the command line.
    pub fn initialize_with_config(configuration: SkeinConfiguration) -> Result<SkeinAttack, SkeinError> {
        Ok(SkeinAttack {
            configuration,
            defaults: SkeinDefaults::default(),
            task: Task::new(),
            plan: None,
            report_handlers: Vec::new(),
            result_handlers: Vec::new(),
        })
    }

    /// Add an attacker; it is picked `weight` times per cycle of the total weight.
    pub fn register_attacker(mut self, attacker: Arc<dyn Attacker>, weight: usize) -> Result<Self, SkeinError> {
        self.task.add(attacker, weight)?;
        Ok(self)
    }

    /// Set the plan, used unless `--plan` is passed.
    pub fn set_plan(mut self, plan: Plan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Receive every report produced by a Manager or a local run.
    pub fn subscribe_report(mut self, handler: ReportHandler) -> Self {
        self.report_handlers.push(handler);
        self
    }

    /// Receive every attack result produced in this process.
    pub fn subscribe_result(mut self, handler: ResultHandler) -> Self {
        self.result_handlers.push(handler);
        self
    }

    /// Run as configured: locally, as a Manager or as a Worker. Ctrl-C interrupts the
    /// running plan. Returns the final cumulative report of this process.
    pub async fn execute(mut self) -> Result<SummaryReport, SkeinError> {
        if self.configuration.version {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        let config = self.configuration.configure(&self.defaults)?;
        if config.mode != RunMode::Manager && self.task.is_empty() {
            return Err(SkeinError::NoAttackers {
                detail: "register at least one attacker with register_attacker()".to_string(),
            });
        }

        let stop = CancelHandle::new();
        let ctrlc = util::setup_ctrlc_handler();
        let watcher = {
            let stop = stop.clone();
            tokio::spawn(async move {
                if ctrlc.recv_async().await.is_ok() {
                    stop.cancel();
                }
            })
        };

        let report = match config.mode {
            RunMode::Local => self.execute_local(&config, stop).await,
            RunMode::Manager => self.execute_manager(&config, stop).await,
            RunMode::Worker => self.execute_worker(&config, stop).await,
        };
        watcher.abort();

        let report = report?;
        if config.print_report {
            println!("{}", ReportTable(&report));
        }
        Ok(report)
    }

    fn take_plan(&mut self, config: &RunnerConfig) -> Result<Plan, SkeinError> {
        config
            .plan
            .clone()
            .or_else(|| self.plan.take())
            .ok_or_else(|| SkeinError::InvalidPlan {
                detail: "no plan configured, pass --plan or call set_plan()".to_string(),
            })
    }

    async fn execute_local(&mut self, config: &RunnerConfig, stop: CancelHandle) -> Result<SummaryReport, SkeinError> {
        let plan = self.take_plan(config)?;
        let runner = LocalRunner::new(Arc::new(std::mem::take(&mut self.task)), config.patrol_interval);
        for handler in self.report_handlers.drain(..) {
            runner.subscribe_report(handler).await;
        }
        for handler in self.result_handlers.drain(..) {
            runner.subscribe_result(handler).await;
        }
        runner.run(plan, stop).await
    }

    async fn execute_manager(&mut self, config: &RunnerConfig, stop: CancelHandle) -> Result<SummaryReport, SkeinError> {
        let plan = self.take_plan(config)?;
        let master = Arc::new(MasterRunner::new(config.supervisor.clone(), config.patrol_interval));
        for handler in self.report_handlers.drain(..) {
            master.subscribe_report(handler).await;
        }
        let (final_tx, final_rx) = flume::unbounded();
        master
            .subscribe_report(Arc::new(move |report: &SummaryReport| {
                if report.full_history {
                    let _ = final_tx.send(report.clone());
                }
            }))
            .await;
        master.launch(&config.manager_bind).await?;

        if !master.wait_for_workers(config.expect_workers, &stop).await {
            info!("interrupted while waiting for workers");
            master.shutdown().await;
            return Ok(SummaryReport::default());
        }
        if let Err(e) = master.start_plan(plan).await {
            master.shutdown().await;
            return Err(e);
        }

        let stopper = {
            let master = Arc::clone(&master);
            tokio::spawn(async move {
                stop.cancelled().await;
                if let Err(e) = master.stop_plan().await {
                    warn!("failed to stop plan: {}", e);
                }
            })
        };
        let outcome = master.wait_plan().await;
        stopper.abort();
        master.shutdown().await;
        outcome?;
        Ok(final_rx.try_iter().last().unwrap_or_default())
    }

    async fn execute_worker(&mut self, config: &RunnerConfig, stop: CancelHandle) -> Result<SummaryReport, SkeinError> {
        let mut worker = WorkerRunner::new(config.manager_url.clone(), Arc::new(std::mem::take(&mut self.task)))
            .with_extra("version", env!("CARGO_PKG_VERSION"));
        if let Some(worker_id) = config.worker_id.as_ref() {
            worker = worker.with_worker_id(worker_id);
        }
        for handler in self.result_handlers.drain(..) {
            worker.subscribe_result(handler).await;
        }
        let stats = worker.stats();
        worker.run(stop).await?;
        let report = stats.lock().await.report(true);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_describe_themselves() {
        let error = SkeinError::Aggregate {
            batch: 7,
            detail: "[w-1] not submitted by the deadline".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "SkeinError: failed to aggregate statistics (batch 7: [w-1] not submitted by the deadline)"
        );
        assert_eq!(SkeinError::NoWorkers.to_string(), "SkeinError: no workers subscribed");

        let wrapped: SkeinError = url::Url::parse("not a url").unwrap_err().into();
        assert!(std::error::Error::source(&wrapped).is_some());
        assert!(std::error::Error::source(&SkeinError::PlanClosed).is_none());
    }

    #[tokio::test]
    async fn execute_needs_attackers() {
        let no_attackers = SkeinAttack::initialize_with_config(SkeinConfiguration::default())
            .unwrap()
            .execute()
            .await;
        assert!(matches!(no_attackers, Err(SkeinError::NoAttackers { .. })));
    }
}
