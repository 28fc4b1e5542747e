//! Attackers and the weighted Task that picks between them.
//!
//! An [`Attacker`] is one named transaction, for example a single HTTP request.
//! A [`Task`] groups attackers with integer weights and hands them out to
//! executors using smooth weighted round-robin: over every full cycle of
//! `total_weight` picks each attacker is chosen exactly `weight` times, and the
//! picks are spread out rather than bunched together.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::SkeinError;

/// The error type returned by a failed [`Attacker::fire`].
///
/// These errors are what is being measured, they are recorded in statistics and
/// never abort a load test.
pub type AttackError = Box<dyn std::error::Error + Send + Sync>;

/// One unit of load-generating work.
///
/// Implementations are shared by every executor on a worker and fired
/// concurrently, so they must be `Send + Sync`. A fire that is still in flight when
/// its executor is cancelled is dropped at its next await point.
///
/// # Example
/// ```rust
/// use skein::task::{AttackError, Attacker};
///
/// struct Noop;
///
/// #[async_trait::async_trait]
/// impl Attacker for Noop {
///     fn name(&self) -> &str {
///         "noop"
///     }
///
///     async fn fire(&self) -> Result<(), AttackError> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Attacker: Send + Sync {
    /// The transaction name statistics are grouped under.
    fn name(&self) -> &str;
    /// Perform the transaction once.
    async fn fire(&self) -> Result<(), AttackError>;
}

/// An ordered, weighted set of attackers.
#[derive(Default)]
pub struct Task {
    attackers: Vec<(Arc<dyn Attacker>, usize)>,
    total_weight: usize,
    // Materialized on first pick, a full SWRR cycle of indexes into `attackers`.
    sequence: OnceLock<Vec<usize>>,
    counter: AtomicUsize,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let attackers: Vec<(&str, usize)> = self
            .attackers
            .iter()
            .map(|(attacker, weight)| (attacker.name(), *weight))
            .collect();
        f.debug_struct("Task")
            .field("attackers", &attackers)
            .field("total_weight", &self.total_weight)
            .finish()
    }
}

impl Task {
    pub fn new() -> Self {
        Task::default()
    }

    /// Add an attacker with the given weight, which must be greater than 0.
    pub fn add(&mut self, attacker: Arc<dyn Attacker>, weight: usize) -> Result<(), SkeinError> {
        if weight == 0 {
            return Err(SkeinError::InvalidWeight {
                weight,
                detail: format!("attacker {} must have a weight of at least 1", attacker.name()),
            });
        }
        self.total_weight += weight;
        self.attackers.push((attacker, weight));
        // A previously materialized cycle no longer reflects the weights.
        self.sequence = OnceLock::new();
        Ok(())
    }

    /// Builder-style variant of [`Task::add`].
    pub fn with_attacker(mut self, attacker: Arc<dyn Attacker>, weight: usize) -> Result<Self, SkeinError> {
        self.add(attacker, weight)?;
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.attackers.is_empty()
    }

    pub fn total_weight(&self) -> usize {
        self.total_weight
    }

    /// Names of all attackers, in the order they were added.
    pub fn names(&self) -> Vec<&str> {
        self.attackers.iter().map(|(a, _)| a.name()).collect()
    }

    /// Pick the next attacker, returns `None` if no attacker has been added.
    ///
    /// Safe to call from many tasks at once; the pick cycle is computed exactly once.
    pub fn pick_up(&self) -> Option<Arc<dyn Attacker>> {
        if self.total_weight == 0 {
            return None;
        }
        let sequence = self.sequence.get_or_init(|| {
            let weights: Vec<usize> = self.attackers.iter().map(|(_, w)| *w).collect();
            smooth_weighted_round_robin(&weights)
        });
        let position = self.counter.fetch_add(1, Ordering::Relaxed) % sequence.len();
        let (attacker, _) = &self.attackers[sequence[position]];
        Some(Arc::clone(attacker))
    }
}

/// Compute one full SWRR cycle, returning the chosen index for every round.
///
/// Each round every entry gains its weight; the entry with the largest running
/// value wins (the first one on ties) and gives back the total weight.
fn smooth_weighted_round_robin(weights: &[usize]) -> Vec<usize> {
    let total: i64 = weights.iter().map(|w| *w as i64).sum();
    let mut current = vec![0i64; weights.len()];
    let mut cycle = Vec::with_capacity(total as usize);

    for _ in 0..total {
        let mut best = 0;
        for (index, weight) in weights.iter().enumerate() {
            current[index] += *weight as i64;
            if current[index] > current[best] {
                best = index;
            }
        }
        current[best] -= total;
        cycle.push(best);
    }
    cycle
}
