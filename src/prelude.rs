pub use crate::attacker::HttpAttacker;
pub use crate::config::{SkeinConfiguration, SkeinDefault, SkeinDefaultType};
pub use crate::plan::{ExitConditions, Plan, PlanStatus, Stage};
pub use crate::statistics::{AttackReport, AttackResult, ReportTable, SummaryReport};
pub use crate::strategy::{AttackStrategy, FixedConcurrentUsers};
pub use crate::task::{AttackError, Attacker, Task};
pub use crate::timer::{GaussianRandomTimer, Timer, UniformRandomTimer};
pub use crate::{SkeinAttack, SkeinError};

pub use async_trait::async_trait;
