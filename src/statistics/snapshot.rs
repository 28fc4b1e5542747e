//! Serializable copies of statisticians, exchanged between workers and the manager.
//!
//! Durations travel as nanoseconds and timestamps as unix nanoseconds, with `0`
//! meaning "no attack recorded yet".

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::time::Duration;

use crate::statistics::{AttackStatistician, StatisticianGroup, TimeWindow, RECENT_WINDOW_SECONDS};
use crate::SkeinError;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticianSnapshot {
    pub name: String,
    pub requests: u64,
    pub failures: u64,
    pub total_response_time: u64,
    pub min_response_time: u64,
    pub max_response_time: u64,
    #[serde(default)]
    pub recent_successes: BTreeMap<i64, u64>,
    #[serde(default)]
    pub recent_failures: BTreeMap<i64, u64>,
    /// Histogram bucket (nanoseconds) to count.
    #[serde(default)]
    pub response_bucket: BTreeMap<u64, u64>,
    #[serde(default)]
    pub failure_bucket: BTreeMap<String, u64>,
    pub first_attack: i64,
    pub last_attack: i64,
    pub interval: u64,
}

/// A whole [`StatisticianGroup`], as submitted by a worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub statisticians: Vec<StatisticianSnapshot>,
}

fn to_unix_nanos(time: Option<DateTime<Utc>>) -> i64 {
    time.and_then(|t| t.timestamp_nanos_opt()).unwrap_or(0)
}

fn from_unix_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        None
    } else {
        Some(Utc.timestamp_nanos(nanos))
    }
}

fn invalid(name: &str, detail: &str) -> SkeinError {
    SkeinError::Statistics {
        detail: format!("invalid snapshot for {}: {}", name, detail),
    }
}

impl From<&AttackStatistician> for StatisticianSnapshot {
    fn from(statistician: &AttackStatistician) -> Self {
        StatisticianSnapshot {
            name: statistician.name.clone(),
            requests: statistician.requests,
            failures: statistician.failures,
            total_response_time: statistician.total_response_time.as_nanos() as u64,
            min_response_time: statistician.min_response_time.as_nanos() as u64,
            max_response_time: statistician.max_response_time.as_nanos() as u64,
            recent_successes: statistician.recent_successes.buckets.clone(),
            recent_failures: statistician.recent_failures.buckets.clone(),
            response_bucket: statistician
                .response_bucket
                .iter()
                .map(|(bucket, count)| (bucket.as_nanos() as u64, *count))
                .collect(),
            failure_bucket: statistician.failure_bucket.clone(),
            first_attack: to_unix_nanos(statistician.first_attack),
            last_attack: to_unix_nanos(statistician.last_attack),
            interval: statistician.interval.as_nanos() as u64,
        }
    }
}

impl TryFrom<StatisticianSnapshot> for AttackStatistician {
    type Error = SkeinError;

    fn try_from(snapshot: StatisticianSnapshot) -> Result<Self, Self::Error> {
        if snapshot.name.is_empty() {
            return Err(invalid("<unnamed>", "empty attacker name"));
        }
        let bucketed: u64 = snapshot.response_bucket.values().sum();
        if bucketed != snapshot.requests {
            return Err(invalid(
                &snapshot.name,
                &format!(
                    "histogram holds {} requests, expected {}",
                    bucketed, snapshot.requests
                ),
            ));
        }
        if snapshot.requests > 0 && snapshot.min_response_time > snapshot.max_response_time {
            return Err(invalid(&snapshot.name, "min response time exceeds max"));
        }
        if snapshot.first_attack > snapshot.last_attack {
            return Err(invalid(&snapshot.name, "first attack is after last attack"));
        }

        let mut statistician = AttackStatistician::new(&snapshot.name);
        statistician.requests = snapshot.requests;
        statistician.failures = snapshot.failures;
        statistician.total_response_time = Duration::from_nanos(snapshot.total_response_time);
        statistician.min_response_time = Duration::from_nanos(snapshot.min_response_time);
        statistician.max_response_time = Duration::from_nanos(snapshot.max_response_time);
        statistician.recent_successes = TimeWindow {
            buckets: snapshot.recent_successes,
            range: RECENT_WINDOW_SECONDS,
        };
        statistician.recent_failures = TimeWindow {
            buckets: snapshot.recent_failures,
            range: RECENT_WINDOW_SECONDS,
        };
        statistician.response_bucket = snapshot
            .response_bucket
            .into_iter()
            .map(|(bucket, count)| (Duration::from_nanos(bucket), count))
            .collect();
        statistician.failure_bucket = snapshot.failure_bucket;
        statistician.first_attack = from_unix_nanos(snapshot.first_attack);
        statistician.last_attack = from_unix_nanos(snapshot.last_attack);
        if snapshot.interval > 0 {
            statistician.interval = Duration::from_nanos(snapshot.interval);
        }
        Ok(statistician)
    }
}

impl From<&StatisticianGroup> for GroupSnapshot {
    fn from(group: &StatisticianGroup) -> Self {
        GroupSnapshot {
            tags: group.tags().clone(),
            statisticians: group.statisticians().map(StatisticianSnapshot::from).collect(),
        }
    }
}

impl TryFrom<GroupSnapshot> for StatisticianGroup {
    type Error = SkeinError;

    fn try_from(snapshot: GroupSnapshot) -> Result<Self, Self::Error> {
        let mut group = StatisticianGroup::new();
        for (key, value) in snapshot.tags.iter() {
            group.attach(key, value);
        }
        for statistician in snapshot.statisticians {
            let statistician = AttackStatistician::try_from(statistician)?;
            if group.get(statistician.name()).is_some() {
                return Err(invalid(statistician.name(), "duplicated attacker name"));
            }
            group.replace_statistician(statistician);
        }
        Ok(group)
    }
}
