//! Attack strategies and the ramp steps they produce.
//!
//! A strategy describes a steady-state concurrency target and how long to take
//! reaching it. [`AttackStrategy::spawn`] ramps up from zero,
//! [`AttackStrategy::switch`] moves from one strategy to the next, and
//! [`AttackStrategy::split`] shares a strategy across several workers.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::descriptor::{Descriptor, DescriptorRegistry};
use crate::SkeinError;

const FIXED_CONCURRENT_USERS: &str = "fixed-concurrent-users";

lazy_static! {
    static ref STRATEGY_REGISTRY: DescriptorRegistry<AttackStrategy> = {
        let mut registry = DescriptorRegistry::new();
        registry.register(FIXED_CONCURRENT_USERS, |d| {
            Ok(AttackStrategy::FixedConcurrentUsers(d.payload()?))
        });
        registry
    };
}

/// Add (positive `n`) or remove (negative `n`) executors, then wait `interval`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RampUpStep {
    pub n: i64,
    pub interval: Duration,
}

/// Hold a fixed number of concurrent users, reaching it over `ramp_up_period` seconds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedConcurrentUsers {
    pub concurrent_users: usize,
    /// Seconds; 0 starts everybody at once.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ramp_up_period: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl FixedConcurrentUsers {
    pub fn new(concurrent_users: usize, ramp_up_period: u64) -> Self {
        FixedConcurrentUsers {
            concurrent_users,
            ramp_up_period,
        }
    }
}

/// All known strategy variants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttackStrategy {
    FixedConcurrentUsers(FixedConcurrentUsers),
}

impl From<FixedConcurrentUsers> for AttackStrategy {
    fn from(strategy: FixedConcurrentUsers) -> Self {
        AttackStrategy::FixedConcurrentUsers(strategy)
    }
}

impl AttackStrategy {
    /// The stable tag used in descriptors.
    pub fn name(&self) -> &'static str {
        match self {
            AttackStrategy::FixedConcurrentUsers(_) => FIXED_CONCURRENT_USERS,
        }
    }

    /// Target concurrency.
    pub fn concurrent_users(&self) -> usize {
        match self {
            AttackStrategy::FixedConcurrentUsers(fcu) => fcu.concurrent_users,
        }
    }

    /// Make sure this strategy can be run on its own.
    pub fn validate(&self) -> Result<(), SkeinError> {
        if self.concurrent_users() == 0 {
            return Err(SkeinError::InvalidStrategy {
                detail: "the number of concurrent users must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Steps ramping up from zero users.
    pub fn spawn(&self) -> Result<Vec<RampUpStep>, SkeinError> {
        self.validate()?;
        match self {
            AttackStrategy::FixedConcurrentUsers(fcu) => Ok(ramp_steps(
                0,
                fcu.concurrent_users as i64,
                fcu.ramp_up_period,
                1,
            )),
        }
    }

    /// Steps moving from this strategy to `next`, using `next`'s ramp period.
    #[allow(unreachable_patterns)]
    pub fn switch(&self, next: &AttackStrategy) -> Result<Vec<RampUpStep>, SkeinError> {
        match (self, next) {
            (AttackStrategy::FixedConcurrentUsers(current), AttackStrategy::FixedConcurrentUsers(next)) => {
                Ok(ramp_steps(
                    current.concurrent_users as i64,
                    next.concurrent_users as i64,
                    next.ramp_up_period,
                    1,
                ))
            }
            _ => Err(SkeinError::InvalidStrategy {
                detail: format!("cannot switch from {} to {}", self.name(), next.name()),
            }),
        }
    }

    /// Share this strategy across `n` workers; the first `users % n` shares get one extra user.
    pub fn split(&self, n: usize) -> Result<Vec<AttackStrategy>, SkeinError> {
        if n == 0 {
            return Err(SkeinError::InvalidStrategy {
                detail: "cannot split a strategy into 0 shares".to_string(),
            });
        }
        match self {
            AttackStrategy::FixedConcurrentUsers(fcu) => {
                let remainder = fcu.concurrent_users % n;
                Ok((0..n)
                    .map(|i| {
                        let extra = if i < remainder { 1 } else { 0 };
                        AttackStrategy::FixedConcurrentUsers(FixedConcurrentUsers {
                            concurrent_users: fcu.concurrent_users / n + extra,
                            ramp_up_period: fcu.ramp_up_period,
                        })
                    })
                    .collect())
            }
        }
    }

    pub fn to_descriptor(&self) -> Result<Descriptor, SkeinError> {
        match self {
            AttackStrategy::FixedConcurrentUsers(fcu) => Descriptor::encode(self.name(), fcu),
        }
    }

    /// Rebuild a strategy, failing on unknown tags.
    pub fn from_descriptor(descriptor: &Descriptor) -> Result<Self, SkeinError> {
        STRATEGY_REGISTRY.decode(descriptor)
    }
}

/// Compute the steps moving from `current` to `target` users over `period` seconds.
///
/// The period is cut into `period / interval` steps of equal size, with the rounding
/// remainder folded into the last step so the steps always sum to `target - current`.
/// If the change is too small to give every step at least one user the interval is
/// widened until it does.
pub(crate) fn ramp_steps(current: i64, target: i64, period: u64, interval: u64) -> Vec<RampUpStep> {
    if current == target {
        return Vec::new();
    }
    let delta = target - current;
    let mut interval = interval.max(1);
    let period = period.max(interval);

    let (steps, per_step) = loop {
        let steps = (period / interval) as i64;
        let per_step = delta / steps;
        if per_step != 0 {
            break (steps, per_step);
        }
        interval += 1;
    };

    let interval = Duration::from_secs(interval);
    let mut ramp: Vec<RampUpStep> = (0..steps)
        .map(|_| RampUpStep {
            n: per_step,
            interval,
        })
        .collect();
    if let Some(last) = ramp.last_mut() {
        last.n += delta - per_step * steps;
    }
    ramp
}
