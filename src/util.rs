//! Utility functions used by Skein, and available when writing load tests.

use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::SkeinError;

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?$")
            .expect("timespan regex is valid");
}

/// Parse a string representing a time span.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use skein::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s").unwrap(), Duration::from_secs(3_723));
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45").unwrap(), Duration::from_secs(45));
///
/// // Anything else is rejected.
/// assert!(util::parse_timespan("foo").is_err());
/// ```
pub fn parse_timespan(time_str: &str) -> Result<Duration, SkeinError> {
    let time_str = time_str.trim();
    // If an integer is passed in, assume it's seconds
    if let Ok(t) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return Ok(Duration::from_secs(t));
    }

    let invalid = || SkeinError::InvalidOption {
        option: "timespan".to_string(),
        value: time_str.to_string(),
        detail: "expected a time span such as 30, 30s, 5m or 1h30m".to_string(),
    };
    if time_str.is_empty() {
        return Err(invalid());
    }
    let time_matches = TIMESPAN.captures(time_str).ok_or_else(invalid)?;
    let component = |name: &str| -> Result<u64, SkeinError> {
        match time_matches.name(name) {
            Some(value) => u64::from_str(value.as_str()).map_err(|_| invalid()),
            None => Ok(0),
        }
    };
    let hours = component("hours")?;
    let minutes = component("minutes")?;
    let seconds = component("seconds")?;
    let total = hours * 60 * 60 + minutes * 60 + seconds;
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    Ok(Duration::from_secs(total))
}

/// A cloneable cancellation flag.
///
/// Every clone observes the same flag, so cancelling any clone wakes every task
/// waiting in [`CancelHandle::cancelled`]. Once set the flag never resets.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        CancelHandle {
            sender: Arc::new(sender),
        }
    }

    /// Set the flag. Returns `true` only for the call that actually flipped it.
    pub fn cancel(&self) -> bool {
        !self.sender.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once the flag is set; resolves immediately if it already is.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as self, so this can't observe a closed channel.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// Returns `true` if the sleep was interrupted.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancelHandle) -> bool {
    if duration.as_nanos() == 0 {
        return cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => cancel.is_cancelled(),
        _ = cancel.cancelled() => true,
    }
}

/// Generate a random identifier, used as a worker id when none is configured.
pub fn random_id() -> String {
    let mut rng = rand::rng();
    format!("{:08x}-{:08x}", rng.random::<u32>(), rng.random::<u32>())
}

/// Serialize a [`Duration`] as an integer number of nanoseconds.
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
    }
}

/// Forward Ctrl-C to the returned channel so a running plan can be interrupted.
///
/// Only one handler can be installed per process; failure to install one is logged
/// and the returned channel then never fires.
pub(crate) fn setup_ctrlc_handler() -> flume::Receiver<()> {
    let (ctrlc_tx, ctrlc_rx) = flume::unbounded();
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, notify whoever is running the plan.
        warn!("caught ctrl-c, stopping...");
        let _ = ctrlc_tx.send(());
    }) {
        Ok(_) => (),
        Err(e) => {
            info!("failed to set ctrl-c handler: {}", e);
        }
    }
    ctrlc_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan() {
        assert_eq!(parse_timespan("0").unwrap(), Duration::from_secs(0));
        assert_eq!(parse_timespan("foo").is_err(), true);
        assert_eq!(parse_timespan("").is_err(), true);
        assert_eq!(parse_timespan("1").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_timespan("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_timespan("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_timespan("61").unwrap(), Duration::from_secs(61));
        assert_eq!(parse_timespan("1m1s").unwrap(), Duration::from_secs(61));
        assert_eq!(parse_timespan("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_timespan("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_timespan("1h1m1s").unwrap(), Duration::from_secs(3_661));
        assert_eq!(parse_timespan("1s1m").is_err(), true);
        assert_eq!(parse_timespan("30x").is_err(), true);
    }

    #[tokio::test]
    async fn cancel_handle() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        assert!(handle.cancel());
        // Cancelling twice only reports the first flip.
        assert!(!handle.cancel());
        waiter.await.unwrap();
        assert!(handle.is_cancelled());

        // Waiting on an already cancelled handle returns immediately.
        handle.cancelled().await;
    }

    #[tokio::test]
    async fn sleep_is_interruptible() {
        let handle = CancelHandle::new();
        let canceller = handle.clone();
        let started = std::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        assert!(sleep_or_cancel(Duration::from_secs(30), &handle).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        let fresh = CancelHandle::new();
        assert!(!sleep_or_cancel(Duration::from_millis(10), &fresh).await);
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(random_id(), random_id());
        assert_eq!(random_id().len(), 17);
    }
}
