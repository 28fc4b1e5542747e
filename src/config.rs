//! Functions and structures related to configuring Skein.
//!
//! Skein can be configured at run time by passing in the options and flags defined by
//! the [`SkeinConfiguration`] structure.
//!
//! Skein can be configured programmatically with [`SkeinDefaultType::set_default`].
//! Options passed on the command line always win over programmatic defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::gaggle::common::{self, DEFAULT_GAGGLE_HOST, DEFAULT_GAGGLE_PORT};
use crate::gaggle::supervisor::SupervisorConfig;
use crate::plan::Plan;
use crate::util;
use crate::{SkeinAttack, SkeinError};

/// How often a running plan is checked unless configured otherwise.
const DEFAULT_PATROL_INTERVAL: &str = "5s";

/// Runtime options available when launching Skein.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`SkeinDefaultType::set_default`].
///
/// Skein leverages [`gumdrop`](https://docs.rs/gumdrop/) to derive help from the
/// below structure.
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Skein runs staged load test plans, alone or spread over many workers
coordinated by one manager.

The following runtime options are available:"#
)]
pub struct SkeinConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Defines the plan as "users,ramp,exit;..."
    #[options(short = "p", meta = "\"PLAN\"")]
    pub plan: String,
    /// Names the plan
    #[options(no_short, meta = "NAME")]
    pub plan_name: String,
    /// How often the plan is checked (default: 5s)
    #[options(no_short, meta = "TIME")]
    pub patrol_interval: String,
    /// Doesn't print the final report
    // Add a blank line and then a Logging: header after this option
    #[options(no_short, help = "Doesn't print the final report\n\nLogging:")]
    pub no_print_report: bool,

    /// Sets log file name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases log file verbosity (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Skein verbosity (-q, -qq, etc)
    #[options(count, short = "q")]
    pub quiet: u8,
    /// Increases Skein verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a Gaggle: header after this option
        help = "Increases Skein verbosity (-v, -vv, etc)\n\nGaggle:"
    )]
    pub verbose: u8,

    /// Enables distributed load test Manager mode
    #[options(no_short)]
    pub manager: bool,
    /// Sets number of Workers to wait for before starting (default: 1)
    #[options(no_short, meta = "VALUE")]
    pub expect_workers: Option<usize>,
    /// Sets host Manager listens on (default: 127.0.0.1)
    #[options(no_short, meta = "HOST")]
    pub manager_bind_host: String,
    /// Sets port Manager listens on (default: 5115)
    #[options(no_short, meta = "PORT")]
    pub manager_bind_port: u16,
    /// Sets how long Workers have to submit statistics (default: 2s)
    #[options(no_short, meta = "TIME")]
    pub aggregate_timeout: String,
    /// Sets how often Workers are pinged (default: 5s)
    #[options(no_short, meta = "TIME")]
    pub keepalive_interval: String,
    /// Sets how many newer rounds a statistics round may lag (default: 3)
    #[options(no_short, meta = "VALUE")]
    pub tolerance_for_delay: Option<u32>,
    /// Enables distributed load test Worker mode
    #[options(no_short)]
    pub worker: bool,
    /// Sets the Worker id (default: random)
    #[options(no_short, meta = "ID")]
    pub worker_id: String,
    /// Sets host Worker connects to (default: 127.0.0.1)
    #[options(no_short, meta = "HOST")]
    pub manager_host: String,
    /// Sets port Worker connects to (default: 5115)
    #[options(no_short, meta = "PORT")]
    pub manager_port: u16,
}

/// Optional default values for Skein run-time options.
///
/// These custom defaults can be configured using [`SkeinDefaultType::set_default()`].
#[derive(Clone, Debug, Default)]
pub(crate) struct SkeinDefaults {
    /// An optional default plan, as a string.
    pub plan: Option<String>,
    /// An optional default plan name.
    pub plan_name: Option<String>,
    /// An optional default patrol interval.
    pub patrol_interval: Option<String>,
    /// An optional default for not printing the final report.
    pub no_print_report: Option<bool>,
    /// An optional default log file name.
    pub log_file: Option<String>,
    /// An optional default log file verbosity.
    pub log_level: Option<u8>,
    /// An optional default value for quiet level.
    pub quiet: Option<u8>,
    /// An optional default value for verbosity level.
    pub verbose: Option<u8>,
    /// An optional default for enabling Manager mode.
    pub manager: Option<bool>,
    /// An optional default number of Workers to expect.
    pub expect_workers: Option<usize>,
    /// An optional default for the host the Manager listens on.
    pub manager_bind_host: Option<String>,
    /// An optional default for the port the Manager listens on.
    pub manager_bind_port: Option<u16>,
    /// An optional default statistics deadline.
    pub aggregate_timeout: Option<String>,
    /// An optional default keep-alive interval.
    pub keepalive_interval: Option<String>,
    /// An optional default staleness tolerance.
    pub tolerance_for_delay: Option<u32>,
    /// An optional default for enabling Worker mode.
    pub worker: Option<bool>,
    /// An optional default Worker id.
    pub worker_id: Option<String>,
    /// An optional default for the host the Worker connects to.
    pub manager_host: Option<String>,
    /// An optional default for the port the Worker connects to.
    pub manager_port: Option<u16>,
}

/// Defines all [`SkeinConfiguration`] options that can be programmatically configured
/// with a custom default.
#[derive(Clone, Copy, Debug)]
pub enum SkeinDefault {
    /// The plan, as "users,ramp,exit;...". Takes a `&str`.
    Plan,
    /// Takes a `&str`.
    PlanName,
    /// Takes a `&str` time span.
    PatrolInterval,
    /// Takes a `bool`.
    NoPrintReport,
    /// Takes a `&str`.
    LogFile,
    /// Takes a `usize`.
    LogLevel,
    /// Takes a `usize`.
    Quiet,
    /// Takes a `usize`.
    Verbose,
    /// Takes a `bool`.
    Manager,
    /// Takes a `usize`.
    ExpectWorkers,
    /// Takes a `&str`.
    ManagerBindHost,
    /// Takes a `usize`.
    ManagerBindPort,
    /// Takes a `&str` time span.
    AggregateTimeout,
    /// Takes a `&str` time span.
    KeepaliveInterval,
    /// Takes a `usize`.
    ToleranceForDelay,
    /// Takes a `bool`.
    Worker,
    /// Takes a `&str`.
    WorkerId,
    /// Takes a `&str`.
    ManagerHost,
    /// Takes a `usize`.
    ManagerPort,
}

/// Set a [`SkeinDefault`] to a value of the type that option expects.
///
/// # Example
/// ```rust
/// use skein::prelude::*;
///
/// fn main() -> Result<(), SkeinError> {
///     SkeinAttack::initialize()?
///         // Check the plan every 10 seconds.
///         .set_default(SkeinDefault::PatrolInterval, "10s")?
///         // Do not display info level logs.
///         .set_default(SkeinDefault::Quiet, 1)?;
///
///     Ok(())
/// }
/// ```
pub trait SkeinDefaultType<T> {
    fn set_default(self, key: SkeinDefault, value: T) -> Result<Self, SkeinError>
    where
        Self: Sized;
}

fn wrong_type<T: fmt::Display>(key: SkeinDefault, value: T, expected: &str, received: &str) -> SkeinError {
    SkeinError::InvalidOption {
        option: format!("SkeinDefault::{:?}", key),
        value: value.to_string(),
        detail: format!(
            "set_default(SkeinDefault::{:?}, {}) expected {} value, received {}",
            key, value, expected, received
        ),
    }
}

impl SkeinDefaultType<&str> for SkeinAttack {
    fn set_default(mut self, key: SkeinDefault, value: &str) -> Result<Self, SkeinError> {
        let value_string = Some(value.to_string());
        match key {
            SkeinDefault::Plan => {
                // Fail early on a plan that will never parse.
                value.parse::<Plan>()?;
                self.defaults.plan = value_string;
            }
            SkeinDefault::PlanName => self.defaults.plan_name = value_string,
            SkeinDefault::PatrolInterval => {
                util::parse_timespan(value)?;
                self.defaults.patrol_interval = value_string;
            }
            SkeinDefault::AggregateTimeout => {
                util::parse_timespan(value)?;
                self.defaults.aggregate_timeout = value_string;
            }
            SkeinDefault::KeepaliveInterval => {
                util::parse_timespan(value)?;
                self.defaults.keepalive_interval = value_string;
            }
            SkeinDefault::LogFile => self.defaults.log_file = value_string,
            SkeinDefault::ManagerBindHost => self.defaults.manager_bind_host = value_string,
            SkeinDefault::ManagerHost => self.defaults.manager_host = value_string,
            SkeinDefault::WorkerId => self.defaults.worker_id = value_string,
            SkeinDefault::LogLevel
            | SkeinDefault::Quiet
            | SkeinDefault::Verbose
            | SkeinDefault::ExpectWorkers
            | SkeinDefault::ManagerBindPort
            | SkeinDefault::ToleranceForDelay
            | SkeinDefault::ManagerPort => return Err(wrong_type(key, value, "usize", "&str")),
            SkeinDefault::NoPrintReport | SkeinDefault::Manager | SkeinDefault::Worker => {
                return Err(wrong_type(key, value, "bool", "&str"))
            }
        }
        Ok(self)
    }
}

fn small<T: std::convert::TryFrom<usize>>(key: SkeinDefault, value: usize) -> Result<T, SkeinError> {
    T::try_from(value).map_err(|_| SkeinError::InvalidOption {
        option: format!("SkeinDefault::{:?}", key),
        value: value.to_string(),
        detail: format!("SkeinDefault::{:?} is out of range", key),
    })
}

impl SkeinDefaultType<usize> for SkeinAttack {
    fn set_default(mut self, key: SkeinDefault, value: usize) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::LogLevel => self.defaults.log_level = Some(small(key, value)?),
            SkeinDefault::Quiet => self.defaults.quiet = Some(small(key, value)?),
            SkeinDefault::Verbose => self.defaults.verbose = Some(small(key, value)?),
            SkeinDefault::ExpectWorkers => self.defaults.expect_workers = Some(value),
            SkeinDefault::ManagerBindPort => self.defaults.manager_bind_port = Some(small(key, value)?),
            SkeinDefault::ToleranceForDelay => {
                self.defaults.tolerance_for_delay = Some(small(key, value)?)
            }
            SkeinDefault::ManagerPort => self.defaults.manager_port = Some(small(key, value)?),
            SkeinDefault::Plan
            | SkeinDefault::PlanName
            | SkeinDefault::PatrolInterval
            | SkeinDefault::AggregateTimeout
            | SkeinDefault::KeepaliveInterval
            | SkeinDefault::LogFile
            | SkeinDefault::ManagerBindHost
            | SkeinDefault::ManagerHost
            | SkeinDefault::WorkerId => return Err(wrong_type(key, value, "&str", "usize")),
            SkeinDefault::NoPrintReport | SkeinDefault::Manager | SkeinDefault::Worker => {
                return Err(wrong_type(key, value, "bool", "usize"))
            }
        }
        Ok(self)
    }
}

impl SkeinDefaultType<bool> for SkeinAttack {
    fn set_default(mut self, key: SkeinDefault, value: bool) -> Result<Self, SkeinError> {
        match key {
            SkeinDefault::NoPrintReport => self.defaults.no_print_report = Some(value),
            SkeinDefault::Manager => self.defaults.manager = Some(value),
            SkeinDefault::Worker => self.defaults.worker = Some(value),
            SkeinDefault::LogLevel
            | SkeinDefault::Quiet
            | SkeinDefault::Verbose
            | SkeinDefault::ExpectWorkers
            | SkeinDefault::ManagerBindPort
            | SkeinDefault::ToleranceForDelay
            | SkeinDefault::ManagerPort => return Err(wrong_type(key, value, "usize", "bool")),
            _ => return Err(wrong_type(key, value, "&str", "bool")),
        }
        Ok(self)
    }
}

/// Used internally to configure [`SkeinConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct SkeinValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Skip this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

impl<'a, T> SkeinValue<'a, T> {
    // A value that is skipped when unset.
    fn from_option(value: Option<T>, message: &'a str) -> Self {
        SkeinValue {
            filter: value.is_none(),
            value,
            message,
        }
    }
}

pub(crate) trait SkeinConfigure<T> {
    /// Return the first value that is set and not filtered.
    fn get_value(&self, values: Vec<SkeinValue<T>>) -> Option<T>;
}

impl<T: fmt::Debug> SkeinConfigure<T> for SkeinConfiguration {
    fn get_value(&self, values: Vec<SkeinValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                }
                if !value.message.is_empty() {
                    info!("{} = {:?}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

// Empty strings mean "not set on the command line".
fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// How this process takes part in a load test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Runs the plan in-process.
    Local,
    /// Coordinates Workers.
    Manager,
    /// Follows a Manager.
    Worker,
}

/// Fully resolved configuration, ready to drive a runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub mode: RunMode,
    /// Unset for Workers, which receive stages from the Manager.
    pub plan: Option<Plan>,
    pub patrol_interval: Duration,
    pub supervisor: SupervisorConfig,
    pub expect_workers: usize,
    /// `host:port` the Manager binds to.
    pub manager_bind: String,
    /// Where a Worker finds its Manager.
    pub manager_url: Url,
    pub worker_id: Option<String>,
    pub print_report: bool,
}

impl SkeinConfiguration {
    /// Merge command line options over `defaults`, initialize logging, validate, and
    /// resolve everything into a [`RunnerConfig`].
    pub(crate) fn configure(&mut self, defaults: &SkeinDefaults) -> Result<RunnerConfig, SkeinError> {
        // Configure `quiet`.
        self.quiet = self
            .get_value(vec![
                // Use --quiet if set.
                SkeinValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                // Otherwise use SkeinDefault if set.
                SkeinValue::from_option(defaults.quiet, ""),
            ])
            .unwrap_or(0);

        // Configure `verbose`.
        self.verbose = self
            .get_value(vec![
                SkeinValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                SkeinValue::from_option(defaults.verbose, ""),
            ])
            .unwrap_or(0);

        // Configure `log_level`.
        self.log_level = self
            .get_value(vec![
                SkeinValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                SkeinValue::from_option(defaults.log_level, ""),
            ])
            .unwrap_or(0);

        // Configure `log_file`.
        self.log_file = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.log_file), ""),
                SkeinValue::from_option(defaults.log_file.clone(), ""),
            ])
            .unwrap_or_default();

        self.initialize_logger();

        // Modes are configured first, the remaining defaults depend on them.
        self.manager = self
            .get_value(vec![
                SkeinValue {
                    value: Some(true),
                    filter: !self.manager,
                    message: "manager",
                },
                SkeinValue::from_option(defaults.manager, "manager"),
            ])
            .unwrap_or(false);
        self.worker = self
            .get_value(vec![
                SkeinValue {
                    value: Some(true),
                    filter: !self.worker,
                    message: "worker",
                },
                SkeinValue::from_option(defaults.worker, "worker"),
            ])
            .unwrap_or(false);

        // Workers receive their stages from the Manager, so never use a default plan.
        self.plan = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.plan), "plan"),
                SkeinValue {
                    value: defaults.plan.clone(),
                    filter: defaults.plan.is_none() || self.worker,
                    message: "plan",
                },
            ])
            .unwrap_or_default();

        self.plan_name = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.plan_name), "plan_name"),
                SkeinValue {
                    value: defaults.plan_name.clone(),
                    filter: defaults.plan_name.is_none() || self.worker,
                    message: "plan_name",
                },
            ])
            .unwrap_or_default();

        self.patrol_interval = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.patrol_interval), "patrol_interval"),
                SkeinValue::from_option(defaults.patrol_interval.clone(), "patrol_interval"),
            ])
            .unwrap_or_else(|| DEFAULT_PATROL_INTERVAL.to_string());

        self.no_print_report = self
            .get_value(vec![
                SkeinValue {
                    value: Some(true),
                    filter: !self.no_print_report,
                    message: "no_print_report",
                },
                SkeinValue::from_option(defaults.no_print_report, "no_print_report"),
            ])
            .unwrap_or(false);

        // Manager-only options only take defaults in Manager mode.
        let is_manager = self.manager;
        let manager_default = |value: bool| !value || !is_manager;
        self.expect_workers = self.get_value(vec![
            SkeinValue::from_option(self.expect_workers, "expect_workers"),
            SkeinValue {
                value: defaults.expect_workers,
                filter: manager_default(defaults.expect_workers.is_some()),
                message: "expect_workers",
            },
        ]);
        self.manager_bind_host = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.manager_bind_host), "manager_bind_host"),
                SkeinValue {
                    value: defaults.manager_bind_host.clone(),
                    filter: manager_default(defaults.manager_bind_host.is_some()),
                    message: "manager_bind_host",
                },
            ])
            .unwrap_or_default();
        self.manager_bind_port = self
            .get_value(vec![
                SkeinValue {
                    value: Some(self.manager_bind_port),
                    filter: self.manager_bind_port == 0,
                    message: "manager_bind_port",
                },
                SkeinValue {
                    value: defaults.manager_bind_port,
                    filter: manager_default(defaults.manager_bind_port.is_some()),
                    message: "manager_bind_port",
                },
            ])
            .unwrap_or(0);
        self.aggregate_timeout = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.aggregate_timeout), "aggregate_timeout"),
                SkeinValue {
                    value: defaults.aggregate_timeout.clone(),
                    filter: manager_default(defaults.aggregate_timeout.is_some()),
                    message: "aggregate_timeout",
                },
            ])
            .unwrap_or_default();
        self.keepalive_interval = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.keepalive_interval), "keepalive_interval"),
                SkeinValue {
                    value: defaults.keepalive_interval.clone(),
                    filter: manager_default(defaults.keepalive_interval.is_some()),
                    message: "keepalive_interval",
                },
            ])
            .unwrap_or_default();
        self.tolerance_for_delay = self.get_value(vec![
            SkeinValue::from_option(self.tolerance_for_delay, "tolerance_for_delay"),
            SkeinValue {
                value: defaults.tolerance_for_delay,
                filter: manager_default(defaults.tolerance_for_delay.is_some()),
                message: "tolerance_for_delay",
            },
        ]);

        // Worker-only options only take defaults in Worker mode.
        let is_worker = self.worker;
        let worker_default = |value: bool| !value || !is_worker;
        self.worker_id = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.worker_id), "worker_id"),
                SkeinValue {
                    value: defaults.worker_id.clone(),
                    filter: worker_default(defaults.worker_id.is_some()),
                    message: "worker_id",
                },
            ])
            .unwrap_or_default();
        self.manager_host = self
            .get_value(vec![
                SkeinValue::from_option(non_empty(&self.manager_host), "manager_host"),
                SkeinValue {
                    value: defaults.manager_host.clone(),
                    filter: worker_default(defaults.manager_host.is_some()),
                    message: "manager_host",
                },
            ])
            .unwrap_or_default();
        self.manager_port = self
            .get_value(vec![
                SkeinValue {
                    value: Some(self.manager_port),
                    filter: self.manager_port == 0,
                    message: "manager_port",
                },
                SkeinValue {
                    value: defaults.manager_port,
                    filter: worker_default(defaults.manager_port.is_some()),
                    message: "manager_port",
                },
            ])
            .unwrap_or(0);

        self.validate()?;
        self.runner_config()
    }

    /// Reject contradictory or out of range options.
    pub(crate) fn validate(&self) -> Result<(), SkeinError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(SkeinError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`.".to_string(),
            });
        }

        if self.manager && self.worker {
            return Err(SkeinError::InvalidOption {
                option: "`configuration.manager`".to_string(),
                value: true.to_string(),
                detail: "`configuration.manager` can not be set with `configuration.worker`.".to_string(),
            });
        }

        for (option, value) in [
            ("patrol_interval", &self.patrol_interval),
            ("aggregate_timeout", &self.aggregate_timeout),
            ("keepalive_interval", &self.keepalive_interval),
        ] {
            if !value.is_empty() && util::parse_timespan(value)? == Duration::from_secs(0) {
                return Err(SkeinError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: value.to_string(),
                    detail: format!("`configuration.{}` must be greater than 0.", option),
                });
            }
        }

        if !self.manager {
            let manager_only = [
                ("expect_workers", self.expect_workers.is_some()),
                ("manager_bind_host", !self.manager_bind_host.is_empty()),
                ("manager_bind_port", self.manager_bind_port != 0),
                ("aggregate_timeout", !self.aggregate_timeout.is_empty()),
                ("keepalive_interval", !self.keepalive_interval.is_empty()),
                ("tolerance_for_delay", self.tolerance_for_delay.is_some()),
            ];
            if let Some((option, _)) = manager_only.iter().find(|(_, set)| *set) {
                return Err(SkeinError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: "set".to_string(),
                    detail: format!("`configuration.{}` can only be set on the Manager.", option),
                });
            }
        } else if self.expect_workers == Some(0) {
            return Err(SkeinError::InvalidOption {
                option: "`configuration.expect_workers`".to_string(),
                value: "0".to_string(),
                detail: "`configuration.expect_workers` must be set to at least 1.".to_string(),
            });
        }

        if !self.worker {
            let worker_only = [
                ("worker_id", !self.worker_id.is_empty()),
                ("manager_host", !self.manager_host.is_empty()),
                ("manager_port", self.manager_port != 0),
            ];
            if let Some((option, _)) = worker_only.iter().find(|(_, set)| *set) {
                return Err(SkeinError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: "set".to_string(),
                    detail: format!("`configuration.{}` can only be set on a Worker.", option),
                });
            }
        } else if !self.plan.is_empty() || !self.plan_name.is_empty() {
            return Err(SkeinError::InvalidOption {
                option: "`configuration.plan`".to_string(),
                value: self.plan.clone(),
                detail: "`configuration.plan` can not be set on a Worker, it follows the Manager's plan."
                    .to_string(),
            });
        }

        Ok(())
    }

    fn runner_config(&self) -> Result<RunnerConfig, SkeinError> {
        let mode = if self.manager {
            RunMode::Manager
        } else if self.worker {
            RunMode::Worker
        } else {
            RunMode::Local
        };

        let plan = if self.plan.is_empty() {
            None
        } else {
            let mut plan: Plan = self.plan.parse()?;
            if !self.plan_name.is_empty() {
                plan.set_name(&self.plan_name);
            }
            Some(plan)
        };

        let timespan_or = |value: &str, default: Duration| -> Result<Duration, SkeinError> {
            if value.is_empty() {
                Ok(default)
            } else {
                util::parse_timespan(value)
            }
        };
        let supervisor_defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            aggregate_timeout: timespan_or(&self.aggregate_timeout, supervisor_defaults.aggregate_timeout)?,
            keepalive_interval: timespan_or(&self.keepalive_interval, supervisor_defaults.keepalive_interval)?,
            tolerance_for_delay: self
                .tolerance_for_delay
                .unwrap_or(supervisor_defaults.tolerance_for_delay),
        };

        let bind_host = non_empty(&self.manager_bind_host).unwrap_or_else(|| DEFAULT_GAGGLE_HOST.to_string());
        let bind_port = if self.manager_bind_port == 0 {
            DEFAULT_GAGGLE_PORT.to_string()
        } else {
            self.manager_bind_port.to_string()
        };
        let manager_host = non_empty(&self.manager_host).unwrap_or_else(|| DEFAULT_GAGGLE_HOST.to_string());
        let manager_port = match self.manager_port {
            0 => DEFAULT_GAGGLE_PORT.parse::<u16>().map_err(|e| SkeinError::InvalidOption {
                option: "`configuration.manager_port`".to_string(),
                value: DEFAULT_GAGGLE_PORT.to_string(),
                detail: e.to_string(),
            })?,
            port => port,
        };

        Ok(RunnerConfig {
            mode,
            plan,
            patrol_interval: util::parse_timespan(&self.patrol_interval)?,
            supervisor,
            expect_workers: self.expect_workers.unwrap_or(1),
            manager_bind: format!("{}:{}", bind_host, bind_port),
            manager_url: common::manager_url(&manager_host, manager_port)?,
            worker_id: non_empty(&self.worker_id),
            print_report: !self.no_print_report,
        })
    }

    /// Initialize the logger, writing to standard out and optionally to a log file.
    ///
    /// Only the first logger of a process can be installed, later attempts are logged
    /// and ignored.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure log file level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> = vec![SimpleLogger::new(debug_level, Config::default())];
        let mut log_file: Option<PathBuf> = None;
        if !self.log_file.is_empty() {
            let path = PathBuf::from(&self.log_file);
            match std::fs::File::create(&path) {
                Ok(file) => {
                    loggers.push(WriteLogger::new(log_level, Config::default(), file));
                    log_file = Some(path);
                }
                Err(e) => eprintln!("failed to create log file {}: {}", path.display(), e),
            }
        }

        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(path) = log_file {
            info!("Writing to log file: {}", path.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::PlanStatus;

    fn attack() -> SkeinAttack {
        SkeinAttack::initialize_with_config(SkeinConfiguration::default()).unwrap()
    }

    #[test]
    fn set_defaults() {
        let skein_attack = attack()
            .set_default(SkeinDefault::Plan, "10,0,1m;20,5s,100r")
            .unwrap()
            .set_default(SkeinDefault::PlanName, "smoke")
            .unwrap()
            .set_default(SkeinDefault::PatrolInterval, "2s")
            .unwrap()
            .set_default(SkeinDefault::NoPrintReport, true)
            .unwrap()
            .set_default(SkeinDefault::LogFile, "skein.log")
            .unwrap()
            .set_default(SkeinDefault::LogLevel, 2)
            .unwrap()
            .set_default(SkeinDefault::Quiet, 1)
            .unwrap()
            .set_default(SkeinDefault::ExpectWorkers, 3)
            .unwrap()
            .set_default(SkeinDefault::ManagerBindPort, 9999)
            .unwrap()
            .set_default(SkeinDefault::ToleranceForDelay, 5)
            .unwrap()
            .set_default(SkeinDefault::AggregateTimeout, "4s")
            .unwrap()
            .set_default(SkeinDefault::WorkerId, "w-1")
            .unwrap();

        assert_eq!(skein_attack.defaults.plan, Some("10,0,1m;20,5s,100r".to_string()));
        assert_eq!(skein_attack.defaults.plan_name, Some("smoke".to_string()));
        assert_eq!(skein_attack.defaults.patrol_interval, Some("2s".to_string()));
        assert_eq!(skein_attack.defaults.no_print_report, Some(true));
        assert_eq!(skein_attack.defaults.log_file, Some("skein.log".to_string()));
        assert_eq!(skein_attack.defaults.log_level, Some(2));
        assert_eq!(skein_attack.defaults.quiet, Some(1));
        assert_eq!(skein_attack.defaults.expect_workers, Some(3));
        assert_eq!(skein_attack.defaults.manager_bind_port, Some(9999));
        assert_eq!(skein_attack.defaults.tolerance_for_delay, Some(5));
        assert_eq!(skein_attack.defaults.aggregate_timeout, Some("4s".to_string()));
        assert_eq!(skein_attack.defaults.worker_id, Some("w-1".to_string()));
    }

    #[test]
    fn defaults_reject_wrong_types() {
        assert!(attack().set_default(SkeinDefault::Plan, 10).is_err());
        assert!(attack().set_default(SkeinDefault::ManagerPort, "5115").is_err());
        assert!(attack().set_default(SkeinDefault::Manager, "yes").is_err());
        assert!(attack().set_default(SkeinDefault::Quiet, true).is_err());
        assert!(attack().set_default(SkeinDefault::PatrolInterval, "soon").is_err());
        assert!(attack().set_default(SkeinDefault::Plan, "10,0").is_err());
        assert!(attack().set_default(SkeinDefault::ManagerPort, 70_000).is_err());
    }

    #[test]
    fn command_line_wins_over_defaults() {
        let mut configuration = SkeinConfiguration {
            plan: "5,0,30s".to_string(),
            patrol_interval: "1s".to_string(),
            ..Default::default()
        };
        let defaults = SkeinDefaults {
            plan: Some("10,0,1m".to_string()),
            plan_name: Some("nightly".to_string()),
            patrol_interval: Some("10s".to_string()),
            ..Default::default()
        };
        let config = configuration.configure(&defaults).unwrap();
        assert_eq!(config.mode, RunMode::Local);
        assert_eq!(config.patrol_interval, Duration::from_secs(1));
        let plan = config.plan.unwrap();
        assert_eq!(plan.name(), "nightly");
        assert_eq!(plan.stages()[0].strategy.concurrent_users(), 5);
        assert_eq!(plan.status(), PlanStatus::Ready);
        assert!(config.print_report);
    }

    #[test]
    fn manager_defaults() {
        let mut configuration = SkeinConfiguration {
            manager: true,
            plan: "1,0,0".to_string(),
            ..Default::default()
        };
        let config = configuration.configure(&SkeinDefaults::default()).unwrap();
        assert_eq!(config.mode, RunMode::Manager);
        assert_eq!(config.manager_bind, "127.0.0.1:5115");
        assert_eq!(config.expect_workers, 1);
        assert_eq!(config.supervisor, SupervisorConfig::default());
        assert_eq!(config.patrol_interval, Duration::from_secs(5));
    }

    #[test]
    fn worker_ignores_default_plan() {
        let mut configuration = SkeinConfiguration {
            worker: true,
            manager_host: "10.0.0.1".to_string(),
            manager_port: 6000,
            ..Default::default()
        };
        let defaults = SkeinDefaults {
            plan: Some("10,0,1m".to_string()),
            worker_id: Some("w-7".to_string()),
            // Manager-only defaults are ignored on Workers.
            expect_workers: Some(4),
            ..Default::default()
        };
        let config = configuration.configure(&defaults).unwrap();
        assert_eq!(config.mode, RunMode::Worker);
        assert!(config.plan.is_none());
        assert_eq!(config.worker_id, Some("w-7".to_string()));
        assert_eq!(config.manager_url.as_str(), "ws://10.0.0.1:6000/");
    }

    #[test]
    fn contradictions_are_rejected() {
        let invalid = vec![
            SkeinConfiguration {
                manager: true,
                worker: true,
                ..Default::default()
            },
            SkeinConfiguration {
                verbose: 1,
                quiet: 1,
                ..Default::default()
            },
            SkeinConfiguration {
                patrol_interval: "0".to_string(),
                ..Default::default()
            },
            SkeinConfiguration {
                manager: true,
                aggregate_timeout: "0s".to_string(),
                ..Default::default()
            },
            SkeinConfiguration {
                expect_workers: Some(2),
                ..Default::default()
            },
            SkeinConfiguration {
                manager: true,
                expect_workers: Some(0),
                ..Default::default()
            },
            SkeinConfiguration {
                manager: true,
                worker_id: "w-1".to_string(),
                ..Default::default()
            },
            SkeinConfiguration {
                worker: true,
                plan: "1,0,0".to_string(),
                ..Default::default()
            },
        ];
        for configuration in invalid {
            match configuration.validate() {
                Err(SkeinError::InvalidOption { .. }) => {}
                other => panic!("{:?} should be invalid, got {:?}", configuration, other),
            }
        }
    }
}
