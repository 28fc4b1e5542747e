//! Pacing between two fires of the same executor.

use lazy_static::lazy_static;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::descriptor::{Descriptor, DescriptorRegistry};
use crate::util::duration_nanos;
use crate::SkeinError;

const NON_STOP_TIMER: &str = "non-stop-timer";
const UNIFORM_RANDOM_TIMER: &str = "uniform-random-timer";
// Tag kept byte-for-byte compatible with existing workers.
const GAUSSIAN_RANDOM_TIMER: &str = "gaussion-random-timer";

lazy_static! {
    static ref TIMER_REGISTRY: DescriptorRegistry<Timer> = {
        let mut registry = DescriptorRegistry::new();
        registry
            .register(NON_STOP_TIMER, |_| Ok(Timer::NonStop))
            .register(UNIFORM_RANDOM_TIMER, |d| {
                let timer: UniformRandomTimer = d.payload()?;
                timer.validate()?;
                Ok(Timer::UniformRandom(timer))
            })
            .register(GAUSSIAN_RANDOM_TIMER, |d| {
                let timer: GaussianRandomTimer = d.payload()?;
                timer.validate()?;
                Ok(Timer::GaussianRandom(timer))
            });
        registry
    };
}

/// Waits a random duration between `min_wait` and `max_wait`, inclusive.
///
/// A zero `max_wait` disables waiting.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UniformRandomTimer {
    #[serde(default, with = "duration_nanos")]
    pub min_wait: Duration,
    #[serde(default, with = "duration_nanos")]
    pub max_wait: Duration,
}

impl UniformRandomTimer {
    pub fn new(min_wait: Duration, max_wait: Duration) -> Result<Self, SkeinError> {
        let timer = UniformRandomTimer { min_wait, max_wait };
        timer.validate()?;
        Ok(timer)
    }

    fn validate(&self) -> Result<(), SkeinError> {
        if self.max_wait > Duration::from_secs(0) && self.min_wait > self.max_wait {
            return Err(SkeinError::InvalidWaitTime {
                min_wait: self.min_wait,
                max_wait: self.max_wait,
                detail: "min_wait can't be larger than max_wait".to_string(),
            });
        }
        Ok(())
    }
}

/// Waits a normally distributed number of milliseconds.
///
/// Negative samples don't wait at all.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GaussianRandomTimer {
    /// Standard deviation, in milliseconds.
    pub std_dev: f64,
    /// Desired mean, in milliseconds.
    pub desired_mean: f64,
}

// A day, in milliseconds.
const MAX_GAUSSIAN_MEAN: f64 = 86_400_000.0;

impl GaussianRandomTimer {
    pub fn new(std_dev: f64, desired_mean: f64) -> Result<Self, SkeinError> {
        let timer = GaussianRandomTimer { std_dev, desired_mean };
        timer.validate()?;
        Ok(timer)
    }

    fn validate(&self) -> Result<(), SkeinError> {
        let detail = if !self.std_dev.is_finite() || !self.desired_mean.is_finite() {
            "std_dev and desired_mean must be finite"
        } else if self.std_dev < 0.0 {
            "std_dev can't be negative"
        } else if self.desired_mean.abs() > MAX_GAUSSIAN_MEAN || self.std_dev > MAX_GAUSSIAN_MEAN {
            "std_dev and desired_mean can't exceed a day"
        } else {
            return Ok(());
        };
        let as_wait = |millis: f64| Duration::try_from_secs_f64(millis.abs() / 1_000.0).unwrap_or(Duration::MAX);
        Err(SkeinError::InvalidWaitTime {
            min_wait: as_wait(self.std_dev),
            max_wait: as_wait(self.desired_mean),
            detail: detail.to_string(),
        })
    }
}

/// How long an executor pauses after each fire.
#[derive(Clone, Debug, PartialEq)]
pub enum Timer {
    /// Fire again immediately.
    NonStop,
    UniformRandom(UniformRandomTimer),
    GaussianRandom(GaussianRandomTimer),
}

impl Default for Timer {
    fn default() -> Self {
        Timer::NonStop
    }
}

impl Timer {
    /// The stable tag used in descriptors.
    pub fn name(&self) -> &'static str {
        match self {
            Timer::NonStop => NON_STOP_TIMER,
            Timer::UniformRandom(_) => UNIFORM_RANDOM_TIMER,
            Timer::GaussianRandom(_) => GAUSSIAN_RANDOM_TIMER,
        }
    }

    /// Draw the next pause.
    pub fn next_wait(&self) -> Duration {
        match self {
            Timer::NonStop => Duration::from_secs(0),
            Timer::UniformRandom(timer) => {
                if timer.max_wait.as_nanos() == 0 {
                    return Duration::from_secs(0);
                }
                let spread = timer.max_wait.saturating_sub(timer.min_wait).as_nanos() as u64;
                timer.min_wait + Duration::from_nanos(rand::rng().random_range(0..=spread))
            }
            Timer::GaussianRandom(timer) => {
                let sample: f64 = rand::rng().sample(StandardNormal);
                let millis = sample * timer.std_dev + timer.desired_mean;
                if millis > 0.0 {
                    Duration::try_from_secs_f64(millis / 1_000.0).unwrap_or(Duration::MAX)
                } else {
                    Duration::from_secs(0)
                }
            }
        }
    }

    pub fn to_descriptor(&self) -> Result<Descriptor, SkeinError> {
        match self {
            Timer::NonStop => Ok(Descriptor {
                kind: NON_STOP_TIMER.to_string(),
                payload: serde_json::json!({}),
            }),
            Timer::UniformRandom(timer) => Descriptor::encode(UNIFORM_RANDOM_TIMER, timer),
            Timer::GaussianRandom(timer) => Descriptor::encode(GAUSSIAN_RANDOM_TIMER, timer),
        }
    }

    /// Rebuild a timer, failing on unknown tags.
    pub fn from_descriptor(descriptor: &Descriptor) -> Result<Self, SkeinError> {
        TIMER_REGISTRY.decode(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_wait_stays_in_bounds() {
        let timer = Timer::UniformRandom(
            UniformRandomTimer::new(Duration::from_millis(10), Duration::from_millis(20)).unwrap(),
        );
        for _ in 0..1_000 {
            let wait = timer.next_wait();
            assert!(wait >= Duration::from_millis(10));
            assert!(wait <= Duration::from_millis(20));
        }

        // A zero max_wait disables waiting.
        let timer = Timer::UniformRandom(UniformRandomTimer {
            min_wait: Duration::from_millis(10),
            max_wait: Duration::from_secs(0),
        });
        assert_eq!(timer.next_wait(), Duration::from_secs(0));

        assert!(UniformRandomTimer::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn gaussian_wait_is_never_negative() {
        let timer = Timer::GaussianRandom(GaussianRandomTimer {
            std_dev: 50.0,
            desired_mean: 0.0,
        });
        let mut total = Duration::from_secs(0);
        for _ in 0..1_000 {
            total += timer.next_wait();
        }
        // Roughly half the samples are clamped to zero, the rest average ~40ms.
        assert!(total > Duration::from_secs(1));
        assert!(total < Duration::from_secs(60));
        assert_eq!(Timer::NonStop.next_wait(), Duration::from_secs(0));
    }

    #[test]
    fn descriptors() {
        let timer = Timer::UniformRandom(UniformRandomTimer {
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_millis(1_500),
        });
        let descriptor = timer.to_descriptor().unwrap();
        assert_eq!(descriptor.kind, "uniform-random-timer");
        assert_eq!(descriptor.payload["max_wait"], 1_500_000_000u64);
        assert_eq!(Timer::from_descriptor(&descriptor).unwrap(), timer);

        let descriptor = Timer::NonStop.to_descriptor().unwrap();
        assert_eq!(Timer::from_descriptor(&descriptor).unwrap(), Timer::NonStop);

        // Gaussian payloads are plain milliseconds.
        let descriptor: Descriptor = serde_json::from_str(
            r#"{"type": "gaussion-random-timer", "payload": {"std_dev": 1.5, "desired_mean": 20}}"#,
        )
        .unwrap();
        assert_eq!(
            Timer::from_descriptor(&descriptor).unwrap(),
            Timer::GaussianRandom(GaussianRandomTimer {
                std_dev: 1.5,
                desired_mean: 20.0
            })
        );

        let unknown = Descriptor {
            kind: "fixed-timer".to_string(),
            payload: serde_json::Value::Null,
        };
        assert!(Timer::from_descriptor(&unknown).is_err());

        // An inverted range is rejected on the receiving side too.
        let inverted: Descriptor = serde_json::from_str(
            r#"{"type": "uniform-random-timer", "payload": {"min_wait": 2000, "max_wait": 1000}}"#,
        )
        .unwrap();
        assert!(Timer::from_descriptor(&inverted).is_err());
    }

    #[test]
    fn unusable_gaussian_timers_are_rejected() {
        for payload in &[
            r#"{"std_dev": 0.0, "desired_mean": 1e300}"#,
            r#"{"std_dev": -1.0, "desired_mean": 20}"#,
            r#"{"std_dev": 1e300, "desired_mean": 20}"#,
        ] {
            let descriptor = Descriptor {
                kind: "gaussion-random-timer".to_string(),
                payload: serde_json::from_str(payload).unwrap(),
            };
            assert!(matches!(
                Timer::from_descriptor(&descriptor),
                Err(SkeinError::InvalidWaitTime { .. })
            ));
        }
        assert!(GaussianRandomTimer::new(f64::NAN, 10.0).is_err());
        assert!(GaussianRandomTimer::new(f64::INFINITY, 10.0).is_err());

        // Built by hand past validation, the wait saturates instead of panicking.
        let huge = Timer::GaussianRandom(GaussianRandomTimer {
            std_dev: 0.0,
            desired_mean: 1e300,
        });
        assert_eq!(huge.next_wait(), Duration::MAX);

        let fixed = Timer::GaussianRandom(GaussianRandomTimer::new(0.0, 250.0).unwrap());
        assert_eq!(fixed.next_wait(), Duration::from_millis(250));
    }
}
