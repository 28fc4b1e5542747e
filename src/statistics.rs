//! Per-transaction latency and error statistics.
//!
//! Each executor outcome is an [`AttackResult`]. An [`AttackStatistician`] folds the
//! results of one transaction name into counters, a response-time histogram and two
//! short time-bucketed windows of recent activity. A [`StatisticianGroup`] holds one
//! statistician per name and produces [`SummaryReport`]s.
//!
//! Response times are stored in a histogram rather than sample by sample, so memory
//! stays bounded however long a load test runs. Histogram keys are rounded, exact to
//! the millisecond up to 100ms, then to 10ms up to 1s, then to 100ms. Percentiles
//! are therefore approximate, with an error bounded by the bucket width.
//!
//! Statisticians from different processes merge losslessly: merging two groups is
//! equivalent to having recorded every underlying event in a single group.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::SkeinError;

pub mod snapshot;

/// Percentiles included in every [`AttackReport`].
pub const TIME_DISTRIBUTIONS: [f64; 10] = [0.5, 0.6, 0.7, 0.8, 0.9, 0.95, 0.97, 0.98, 0.99, 1.0];

/// Trailing interval used for the windowed (current) throughput.
pub const CURRENT_TPS_TIME_RANGE: Duration = Duration::from_secs(12);

/// Tag carrying the plan name in statistics and reports.
pub const PLAN_TAG: &str = "plan";

/// Seconds of history kept in the success and failure windows.
pub(crate) const RECENT_WINDOW_SECONDS: i64 = 20;

/// The outcome of one fire.
#[derive(Clone, Debug, PartialEq)]
pub struct AttackResult {
    /// The attacker name.
    pub name: String,
    /// How long the fire took.
    pub duration: Duration,
    /// The error message if the fire failed.
    pub error: Option<String>,
}

impl AttackResult {
    pub fn success(name: &str, duration: Duration) -> Self {
        AttackResult {
            name: name.to_string(),
            duration,
            error: None,
        }
    }

    pub fn failure(name: &str, duration: Duration, error: &str) -> Self {
        AttackResult {
            name: name.to_string(),
            duration,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Event counts keyed by unix second, forgetting seconds that fall too far behind
/// the newest one.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TimeWindow {
    pub(crate) buckets: BTreeMap<i64, u64>,
    pub(crate) range: i64,
}

impl TimeWindow {
    fn new(range: i64) -> Self {
        TimeWindow {
            buckets: BTreeMap::new(),
            range,
        }
    }

    fn accumulate(&mut self, second: i64, count: u64) {
        let existed = self.buckets.contains_key(&second);
        *self.buckets.entry(second).or_insert(0) += count;
        if !existed {
            let newest = match self.buckets.keys().next_back() {
                Some(newest) => *newest,
                None => return,
            };
            let range = self.range;
            self.buckets.retain(|key, _| newest - *key <= range);
        }
    }

    fn sum(&self, from: i64, to: i64) -> u64 {
        self.buckets.range(from..=to).map(|(_, count)| count).sum()
    }
}

/// Round a response time to its histogram bucket.
pub(crate) fn response_bucket(duration: Duration) -> Duration {
    let nanos = duration.as_nanos() as u64;
    let rounded = if duration <= Duration::from_millis(100) {
        (nanos + 500_000) / 1_000_000 * 1_000_000
    } else if duration <= Duration::from_millis(1_000) {
        (nanos + 5_000_000) / 10_000_000 * 10_000_000
    } else {
        (nanos + 50_000_000) / 100_000_000 * 100_000_000
    };
    Duration::from_nanos(rounded)
}

/// Accumulates every result recorded for one attacker name.
#[derive(Clone, Debug, PartialEq)]
pub struct AttackStatistician {
    pub(crate) name: String,
    pub(crate) requests: u64,
    pub(crate) failures: u64,
    pub(crate) total_response_time: Duration,
    pub(crate) min_response_time: Duration,
    pub(crate) max_response_time: Duration,
    pub(crate) recent_successes: TimeWindow,
    pub(crate) recent_failures: TimeWindow,
    pub(crate) response_bucket: BTreeMap<Duration, u64>,
    pub(crate) failure_bucket: BTreeMap<String, u64>,
    pub(crate) first_attack: Option<DateTime<Utc>>,
    pub(crate) last_attack: Option<DateTime<Utc>>,
    pub(crate) interval: Duration,
}

impl AttackStatistician {
    pub fn new(name: &str) -> Self {
        AttackStatistician {
            name: name.to_string(),
            requests: 0,
            failures: 0,
            total_response_time: Duration::from_secs(0),
            min_response_time: Duration::from_secs(0),
            max_response_time: Duration::from_secs(0),
            recent_successes: TimeWindow::new(RECENT_WINDOW_SECONDS),
            recent_failures: TimeWindow::new(RECENT_WINDOW_SECONDS),
            response_bucket: BTreeMap::new(),
            failure_bucket: BTreeMap::new(),
            first_attack: None,
            last_attack: None,
            interval: CURRENT_TPS_TIME_RANGE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Successful requests.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn min(&self) -> Duration {
        self.min_response_time
    }

    pub fn max(&self) -> Duration {
        self.max_response_time
    }

    pub fn record(&mut self, result: &AttackResult) {
        self.record_at(result, Utc::now());
    }

    /// Record a result as if it completed at `now`. Results for other names are ignored.
    pub fn record_at(&mut self, result: &AttackResult, now: DateTime<Utc>) {
        if result.name != self.name {
            return;
        }
        match result.error {
            Some(ref error) => self.record_failure(error, now),
            None => self.record_success(result.duration, now),
        }
    }

    fn record_success(&mut self, duration: Duration, now: DateTime<Utc>) {
        // The first success seeds min and max, even if failures came before it.
        if self.requests == 0 {
            self.min_response_time = duration;
            self.max_response_time = duration;
        } else {
            self.min_response_time = self.min_response_time.min(duration);
            self.max_response_time = self.max_response_time.max(duration);
        }
        self.requests += 1;
        self.total_response_time += duration;
        self.touch(now);
        self.recent_successes.accumulate(now.timestamp(), 1);
        *self.response_bucket.entry(response_bucket(duration)).or_insert(0) += 1;
    }

    fn record_failure(&mut self, error: &str, now: DateTime<Utc>) {
        self.failures += 1;
        self.touch(now);
        *self.failure_bucket.entry(error.to_string()).or_insert(0) += 1;
        self.recent_failures.accumulate(now.timestamp(), 1);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if self.first_attack.is_none() {
            self.first_attack = Some(now);
        }
        self.last_attack = Some(now);
    }

    /// Successful requests per second over the whole run.
    pub fn total_tps(&self) -> f64 {
        match (self.first_attack, self.last_attack) {
            (Some(first), Some(last)) if last > first => {
                self.requests as f64 / seconds_between(first, last)
            }
            _ => 0.0,
        }
    }

    /// Successful requests per second over the trailing interval ending one second
    /// before `now`, as the current second is still incomplete.
    pub fn current_tps_at(&self, now: DateTime<Utc>) -> f64 {
        let (first, last) = match (self.first_attack, self.last_attack) {
            (Some(first), Some(last)) if last > first => (first, last),
            _ => return 0.0,
        };
        let end = now - chrono::Duration::seconds(1);
        if end < first {
            return 0.0;
        }
        let lookback = self.interval.saturating_sub(Duration::from_secs(1));
        let mut start = end - chrono::Duration::milliseconds(lookback.as_millis() as i64);
        if start < first {
            start = first;
        }
        if end <= start {
            return 0.0;
        }
        trace!("{} current tps from {} to {} (last {})", self.name, start, end, last);
        let count = self
            .recent_successes
            .sum(start.timestamp(), end.timestamp());
        count as f64 / (end.timestamp() - start.timestamp() + 1) as f64
    }

    /// Approximate response time percentiles, `percents` in `0.0..=1.0`.
    pub fn percentiles(&self, percents: &[f64]) -> Vec<Duration> {
        let requests = self.requests as i64;
        percents
            .iter()
            .map(|percent| {
                let mut index = (self.requests as f64 * percent + 0.5) as i64;
                if index >= requests {
                    return self.max_response_time;
                }
                if index <= 1 {
                    return self.min_response_time;
                }
                // BTreeMap keys iterate in ascending order.
                for (bucket, count) in self.response_bucket.iter() {
                    index -= *count as i64;
                    if index <= 0 {
                        return *bucket;
                    }
                }
                self.max_response_time
            })
            .collect()
    }

    pub fn average(&self) -> Duration {
        if self.requests == 0 {
            return Duration::from_secs(0);
        }
        Duration::from_nanos((self.total_response_time.as_nanos() / self.requests as u128) as u64)
    }

    /// Failures as a share of every recorded result.
    pub fn fail_ratio(&self) -> f64 {
        let total = self.requests + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }

    pub fn report(&self, full_history: bool) -> AttackReport {
        self.report_at(full_history, Utc::now())
    }

    /// Build a report; `full_history` selects cumulative throughput, otherwise the
    /// windowed throughput as of `now`.
    pub fn report_at(&self, full_history: bool, now: DateTime<Utc>) -> AttackReport {
        let percentiles = self.percentiles(&TIME_DISTRIBUTIONS);
        let distributions: BTreeMap<String, Duration> = TIME_DISTRIBUTIONS
            .iter()
            .zip(percentiles.iter())
            .map(|(percent, value)| (format!("{:.2}", percent), *value))
            .collect();
        AttackReport {
            name: self.name.clone(),
            requests: self.requests,
            failures: self.failures,
            min: self.min_response_time,
            max: self.max_response_time,
            median: percentiles[0],
            average: self.average(),
            tps: if full_history {
                self.total_tps()
            } else {
                self.current_tps_at(now)
            },
            distributions,
            fail_ratio: self.fail_ratio(),
            failure_details: self.failure_bucket.clone(),
            full_history,
            first_attack: self.first_attack,
            last_attack: self.last_attack,
        }
    }

    /// Fold `other` into this statistician; both must share a name.
    pub fn merge(&mut self, other: &AttackStatistician) -> Result<(), SkeinError> {
        if self.name != other.name {
            return Err(SkeinError::Statistics {
                detail: format!(
                    "cannot merge statistics for {} into statistics for {}",
                    other.name, self.name
                ),
            });
        }

        if other.requests > 0 {
            if self.requests == 0 {
                self.min_response_time = other.min_response_time;
                self.max_response_time = other.max_response_time;
            } else {
                self.min_response_time = self.min_response_time.min(other.min_response_time);
                self.max_response_time = self.max_response_time.max(other.max_response_time);
            }
        }
        self.requests += other.requests;
        self.failures += other.failures;
        self.total_response_time += other.total_response_time;

        for (second, count) in other.recent_successes.buckets.iter() {
            self.recent_successes.accumulate(*second, *count);
        }
        for (second, count) in other.recent_failures.buckets.iter() {
            self.recent_failures.accumulate(*second, *count);
        }
        for (bucket, count) in other.response_bucket.iter() {
            *self.response_bucket.entry(*bucket).or_insert(0) += count;
        }
        for (error, count) in other.failure_bucket.iter() {
            *self.failure_bucket.entry(error.clone()).or_insert(0) += count;
        }

        self.first_attack = earliest(self.first_attack, other.first_attack);
        self.last_attack = latest(self.last_attack, other.last_attack);
        Ok(())
    }
}

fn seconds_between(first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    (last - first)
        .to_std()
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// A point-in-time report for one attacker name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttackReport {
    pub name: String,
    /// Successful requests.
    pub requests: u64,
    pub failures: u64,
    pub min: Duration,
    pub max: Duration,
    pub median: Duration,
    pub average: Duration,
    /// Cumulative or windowed throughput, depending on `full_history`.
    pub tps: f64,
    /// Percentiles keyed `"0.50"` through `"1.00"`.
    pub distributions: BTreeMap<String, Duration>,
    pub fail_ratio: f64,
    /// Failure counts keyed by error message.
    pub failure_details: BTreeMap<String, u64>,
    pub full_history: bool,
    pub first_attack: Option<DateTime<Utc>>,
    pub last_attack: Option<DateTime<Utc>>,
}

/// A report covering every attacker name in a [`StatisticianGroup`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SummaryReport {
    pub first_attack: Option<DateTime<Utc>>,
    pub last_attack: Option<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_tps: f64,
    pub full_history: bool,
    pub reports: BTreeMap<String, AttackReport>,
    /// Tags attached to the group, such as the plan name.
    pub extras: BTreeMap<String, String>,
}

impl SummaryReport {
    /// Every recorded result, successful or not.
    pub fn total_results(&self) -> u64 {
        self.total_requests + self.total_failures
    }

    /// Time between the first and the last recorded result.
    pub fn elapsed(&self) -> Duration {
        match (self.first_attack, self.last_attack) {
            (Some(first), Some(last)) => (last - first).to_std().unwrap_or_default(),
            _ => Duration::from_secs(0),
        }
    }
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} requests, {} failures, {:.2} tps over {:?}",
            format_number(self.total_requests),
            format_number(self.total_failures),
            self.total_tps,
            self.elapsed(),
        )
    }
}

/// Multi-line table rendering of a [`SummaryReport`], printed when a plan ends.
pub struct ReportTable<'a>(pub &'a SummaryReport);

impl fmt::Display for ReportTable<'_> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.0;
        let rule = " ------------------------------------------------------------------------------";
        if let Some(plan) = summary.extras.get(PLAN_TAG) {
            writeln!(fmt, "\n === PLAN {} ===", plan)?;
        }

        writeln!(fmt, "\n === PER ATTACKER REQUESTS ===\n{}", rule)?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "tps", "fail %"
        )?;
        writeln!(fmt, "{}", rule)?;
        for report in summary.reports.values() {
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>14} | {:>8.2} | {:>7.1}",
                truncate(&report.name, 24),
                format_number(report.requests),
                format_number(report.failures),
                report.tps,
                report.fail_ratio * 100.0,
            )?;
        }
        if summary.reports.len() > 1 {
            writeln!(fmt, "{}", rule)?;
            writeln!(
                fmt,
                " {:<24} | {:>13} | {:>14} | {:>8.2} |",
                "Aggregated",
                format_number(summary.total_requests),
                format_number(summary.total_failures),
                summary.total_tps,
            )?;
        }

        writeln!(fmt, "\n === PER ATTACKER RESPONSE TIMES (ms) ===\n{}", rule)?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>10} | {:>11}",
            "Name", "Average", "Min", "Max", "Median"
        )?;
        writeln!(fmt, "{}", rule)?;
        for report in summary.reports.values() {
            writeln!(
                fmt,
                " {:<24} | {:>11.2} | {:>10} | {:>10} | {:>11}",
                truncate(&report.name, 24),
                report.average.as_secs_f64() * 1_000.0,
                report.min.as_millis(),
                report.max.as_millis(),
                report.median.as_millis(),
            )?;
        }

        let failures: Vec<(&str, &str, u64)> = summary
            .reports
            .values()
            .flat_map(|report| {
                report
                    .failure_details
                    .iter()
                    .map(move |(error, count)| (report.name.as_str(), error.as_str(), *count))
            })
            .collect();
        if !failures.is_empty() {
            writeln!(fmt, "\n === ERRORS ===\n{}", rule)?;
            writeln!(fmt, " {:<11} | {:<24} | Error", "Count", "Name")?;
            writeln!(fmt, "{}", rule)?;
            for (name, error, count) in failures {
                writeln!(fmt, " {:<11} | {:<24} | {}", format_number(count), truncate(name, 24), error)?;
            }
        }
        write!(fmt, "{}", rule)
    }
}

// Keep table columns aligned.
fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        value.to_string()
    } else {
        let mut truncated: String = value.chars().take(width - 2).collect();
        truncated.push_str("..");
        truncated
    }
}

/// Format large numbers in a more human-readable format with commas.
pub fn format_number(number: u64) -> String {
    use num_format::{Locale, ToFormattedString};
    number.to_formatted_string(&Locale::en)
}

/// One statistician per attacker name, plus key/value tags.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatisticianGroup {
    tags: BTreeMap<String, String>,
    container: BTreeMap<String, AttackStatistician>,
}

impl StatisticianGroup {
    pub fn new() -> Self {
        StatisticianGroup::default()
    }

    pub fn record(&mut self, result: &AttackResult) {
        self.record_at(result, Utc::now());
    }

    /// Record into the statistician for `result.name`, creating it on first use.
    pub fn record_at(&mut self, result: &AttackResult, now: DateTime<Utc>) {
        self.container
            .entry(result.name.clone())
            .or_insert_with(|| AttackStatistician::new(&result.name))
            .record_at(result, now);
    }

    pub fn get(&self, name: &str) -> Option<&AttackStatistician> {
        self.container.get(name)
    }

    /// Attacker names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.container.keys().map(|k| k.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    pub(crate) fn statisticians(&self) -> impl Iterator<Item = &AttackStatistician> {
        self.container.values()
    }

    pub fn report(&self, full_history: bool) -> SummaryReport {
        self.report_at(full_history, Utc::now())
    }

    pub fn report_at(&self, full_history: bool, now: DateTime<Utc>) -> SummaryReport {
        let mut summary = SummaryReport {
            full_history,
            extras: self.tags.clone(),
            ..Default::default()
        };
        for (name, statistician) in self.container.iter() {
            let report = statistician.report_at(full_history, now);
            summary.total_requests += report.requests;
            summary.total_failures += report.failures;
            summary.total_tps += report.tps;
            summary.first_attack = earliest(summary.first_attack, report.first_attack);
            summary.last_attack = latest(summary.last_attack, report.last_attack);
            summary.reports.insert(name.clone(), report);
        }
        summary
    }

    /// Merge `other` name by name; names only `other` knows are adopted as they are.
    pub fn merge(&mut self, other: &StatisticianGroup) -> Result<(), SkeinError> {
        for (name, statistician) in other.container.iter() {
            match self.container.get_mut(name) {
                Some(existing) => existing.merge(statistician)?,
                None => {
                    self.container.insert(name.clone(), statistician.clone());
                }
            }
        }
        for (key, value) in other.tags.iter() {
            self.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(())
    }

    /// Drop every statistician and tag.
    pub fn reset(&mut self) {
        self.container.clear();
        self.tags.clear();
    }

    /// Replace (or add) the statistician for its name.
    pub fn replace_statistician(&mut self, statistician: AttackStatistician) {
        self.container
            .insert(statistician.name.clone(), statistician);
    }

    /// Attach a tag, replacing any previous value for `key`.
    pub fn attach(&mut self, key: &str, value: &str) {
        self.tags.insert(key.to_string(), value.to_string());
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Attacker names ordered by descending request count, for log output.
    pub fn busiest(&self) -> Vec<&str> {
        self.container
            .values()
            .sorted_by(|a, b| b.requests.cmp(&a.requests).then(a.name.cmp(&b.name)))
            .map(|s| s.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + second, 0).unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn buckets() {
        assert_eq!(response_bucket(ms(7)), ms(7));
        assert_eq!(response_bucket(Duration::from_micros(7_400)), ms(7));
        assert_eq!(response_bucket(Duration::from_micros(7_600)), ms(8));
        assert_eq!(response_bucket(ms(100)), ms(100));
        assert_eq!(response_bucket(ms(104)), ms(100));
        assert_eq!(response_bucket(ms(105)), ms(110));
        assert_eq!(response_bucket(ms(999)), ms(1_000));
        assert_eq!(response_bucket(ms(1_049)), ms(1_000));
        assert_eq!(response_bucket(ms(1_050)), ms(1_100));
        assert_eq!(response_bucket(ms(12_345)), ms(12_300));
    }

    #[test]
    fn eleven_requests() {
        let mut statistician = AttackStatistician::new("x");
        for n in 1..=11 {
            statistician.record_at(&AttackResult::success("x", ms(n)), at(n as i64));
        }
        assert_eq!(statistician.requests(), 11);
        assert_eq!(statistician.failures(), 0);
        assert_eq!(statistician.min(), ms(1));
        assert_eq!(statistician.max(), ms(11));
        assert_eq!(
            statistician.percentiles(&[0.5, 0.9, 0.97]),
            vec![ms(6), ms(10), ms(11)]
        );
        assert_eq!(statistician.percentiles(&[0.0, 1.0]), vec![ms(1), ms(11)]);
        assert_eq!(statistician.average(), ms(6));

        let report = statistician.report_at(true, at(12));
        assert_eq!(report.median, ms(6));
        assert_eq!(report.distributions["0.90"], ms(10));
        assert_eq!(report.distributions["1.00"], ms(11));
        assert_eq!(report.distributions.len(), 10);
        // 11 requests between the 1st and the 11th second.
        assert!((report.tps - 1.1).abs() < 1e-9);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut statistician = AttackStatistician::new("x");
        for n in 1..=500 {
            statistician.record_at(&AttackResult::success("x", ms(n)), at(0));
        }
        let percents: Vec<f64> = (0..=100).map(|p| p as f64 / 100.0).collect();
        let values = statistician.percentiles(&percents);
        assert_eq!(values[0], statistician.min());
        assert_eq!(values[100], statistician.max());
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1], "{:?} > {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failures_do_not_touch_response_times() {
        let mut statistician = AttackStatistician::new("x");
        statistician.record_at(&AttackResult::failure("x", ms(900), "timeout"), at(0));
        assert_eq!(statistician.min(), ms(0));
        assert_eq!(statistician.max(), ms(0));

        // The first success seeds min and max even after a failure.
        statistician.record_at(&AttackResult::success("x", ms(40)), at(1));
        statistician.record_at(&AttackResult::failure("x", ms(5), "timeout"), at(2));
        statistician.record_at(&AttackResult::failure("x", ms(5), "refused"), at(2));
        assert_eq!(statistician.min(), ms(40));
        assert_eq!(statistician.max(), ms(40));
        assert_eq!(statistician.failures(), 3);
        assert_eq!(statistician.requests(), 1);
        assert_eq!(statistician.fail_ratio(), 0.75);

        let report = statistician.report_at(true, at(3));
        assert_eq!(report.failure_details["timeout"], 2);
        assert_eq!(report.failure_details["refused"], 1);
        assert_eq!(report.first_attack, Some(at(0)));
        assert_eq!(report.last_attack, Some(at(2)));

        // Results for other names are ignored.
        statistician.record_at(&AttackResult::success("y", ms(1)), at(3));
        assert_eq!(statistician.requests(), 1);
    }

    #[test]
    fn window_forgets_old_seconds() {
        let mut window = TimeWindow::new(20);
        window.accumulate(100, 1);
        window.accumulate(110, 2);
        window.accumulate(120, 3);
        assert_eq!(window.buckets.len(), 3);
        window.accumulate(121, 1);
        assert_eq!(window.buckets.keys().copied().collect::<Vec<_>>(), vec![110, 120, 121]);
        // Adding to an existing second doesn't evict.
        window.accumulate(110, 1);
        assert_eq!(window.sum(100, 121), 7);
    }

    #[test]
    fn window_merge_order_does_not_matter() {
        let seconds = [(121, 1), (100, 4), (110, 2)];
        let mut forward = TimeWindow::new(20);
        for (second, count) in seconds.iter() {
            forward.accumulate(*second, *count);
        }
        let mut backward = TimeWindow::new(20);
        for (second, count) in seconds.iter().rev() {
            backward.accumulate(*second, *count);
        }
        // An older second arriving after a newer one is still measured against the newest.
        assert_eq!(forward, backward);
        assert_eq!(forward.buckets.keys().copied().collect::<Vec<_>>(), vec![110, 121]);
    }

    #[test]
    fn current_tps() {
        let mut statistician = AttackStatistician::new("x");
        assert_eq!(statistician.current_tps_at(at(0)), 0.0);
        // 10 requests per second for 30 seconds.
        for second in 0..30 {
            for _ in 0..10 {
                statistician.record_at(&AttackResult::success("x", ms(5)), at(second));
            }
        }
        // The window covers seconds 18..=29.
        assert!((statistician.current_tps_at(at(30)) - 10.0).abs() < 1e-9);
        // Quiet for a while: only the tail end falls in the window.
        let tps = statistician.current_tps_at(at(35));
        // Seconds 23..=29 hold 70 requests, spread over 12 seconds.
        assert!((tps - 70.0 / 12.0).abs() < 1e-9);
        // Too early to say anything.
        let mut fresh = AttackStatistician::new("x");
        fresh.record_at(&AttackResult::success("x", ms(5)), at(0));
        fresh.record_at(&AttackResult::success("x", ms(5)), at(1));
        assert_eq!(fresh.current_tps_at(at(0)), 0.0);
    }

    #[test]
    fn merge_rejects_other_names() {
        let mut x = AttackStatistician::new("x");
        let y = AttackStatistician::new("y");
        assert!(x.merge(&y).is_err());
    }

    #[test]
    fn merge_matches_recording_everything_once() {
        let results: Vec<(AttackResult, i64)> = (0..300u64)
            .map(|n| {
                let result = if n % 7 == 0 {
                    AttackResult::failure("x", ms(n), "boom")
                } else {
                    AttackResult::success("x", ms(n * 3 % 1_700))
                };
                (result, (n / 10) as i64)
            })
            .collect();

        let mut single = AttackStatistician::new("x");
        let mut left = AttackStatistician::new("x");
        let mut right = AttackStatistician::new("x");
        for (index, (result, second)) in results.iter().enumerate() {
            single.record_at(result, at(*second));
            if index % 3 == 0 {
                left.record_at(result, at(*second));
            } else {
                right.record_at(result, at(*second));
            }
        }
        left.merge(&right).unwrap();
        let merged = left.report_at(true, at(40));
        let expected = single.report_at(true, at(40));
        assert_eq!(merged, expected);
    }

    #[test]
    fn merging_into_an_empty_statistician_adopts_min() {
        let mut empty = AttackStatistician::new("x");
        empty.record_at(&AttackResult::failure("x", ms(1), "boom"), at(0));
        let mut other = AttackStatistician::new("x");
        other.record_at(&AttackResult::success("x", ms(30)), at(1));
        other.record_at(&AttackResult::success("x", ms(50)), at(2));
        empty.merge(&other).unwrap();
        assert_eq!(empty.min(), ms(30));
        assert_eq!(empty.max(), ms(50));
        assert_eq!(empty.first_attack, Some(at(0)));
        assert_eq!(empty.last_attack, Some(at(2)));
    }

    #[test]
    fn group_reports() {
        let mut group = StatisticianGroup::new();
        group.attach(PLAN_TAG, "smoke");
        group.record_at(&AttackResult::success("a", ms(10)), at(1));
        group.record_at(&AttackResult::success("a", ms(20)), at(3));
        group.record_at(&AttackResult::success("b", ms(30)), at(0));
        group.record_at(&AttackResult::failure("b", ms(30), "boom"), at(5));
        assert_eq!(group.names(), vec!["a", "b"]);
        assert_eq!(group.busiest(), vec!["a", "b"]);

        let summary = group.report_at(true, at(6));
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_failures, 1);
        assert_eq!(summary.total_results(), 4);
        assert_eq!(summary.first_attack, Some(at(0)));
        assert_eq!(summary.last_attack, Some(at(5)));
        assert_eq!(summary.elapsed(), Duration::from_secs(5));
        assert_eq!(summary.extras["plan"], "smoke");
        assert!(summary.full_history);
        assert_eq!(summary.reports["a"].requests, 2);
        assert!((summary.total_tps - (2.0 / 2.0 + 1.0 / 5.0)).abs() < 1e-9);

        let replaced = AttackStatistician::new("a");
        group.replace_statistician(replaced);
        assert_eq!(group.get("a").unwrap().requests(), 0);

        group.reset();
        assert!(group.is_empty());
        assert!(group.tags().is_empty());
        assert_eq!(group.report(false), SummaryReport::default());
    }

    fn group_of(results: &[(&str, u64, bool, i64)]) -> StatisticianGroup {
        let mut group = StatisticianGroup::new();
        for (name, millis, failed, second) in results {
            let result = if *failed {
                AttackResult::failure(name, ms(*millis), "boom")
            } else {
                AttackResult::success(name, ms(*millis))
            };
            group.record_at(&result, at(*second));
        }
        group
    }

    #[test]
    fn group_merge_is_associative() {
        let a = group_of(&[("x", 5, false, 0), ("x", 120, false, 1), ("y", 9, true, 2)]);
        let b = group_of(&[("x", 2, false, 3), ("z", 1_400, false, 4)]);
        let c = group_of(&[("y", 33, false, 5), ("z", 3, false, 6), ("x", 77, true, 6)]);

        let mut left = a.clone();
        left.merge(&b).unwrap();
        left.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut right = a.clone();
        right.merge(&bc).unwrap();

        assert_eq!(left.report_at(true, at(10)), right.report_at(true, at(10)));
        let summary = left.report_at(true, at(10));
        assert_eq!(summary.reports["x"].min, ms(2));
        assert_eq!(summary.reports["x"].max, ms(120));
        assert_eq!(summary.reports["x"].failures, 1);
        assert_eq!(summary.reports["z"].requests, 2);
    }

    #[test]
    fn numbers_are_formatted() {
        assert_eq!(format_number(1_234_567), "1,234,567");
        assert_eq!(format_number(12), "12");
    }

    #[test]
    fn report_table_lists_attackers_and_errors() {
        let mut group = StatisticianGroup::new();
        group.attach(PLAN_TAG, "smoke");
        group.record_at(&AttackResult::success("get /", ms(4)), at(0));
        group.record_at(&AttackResult::failure("a-very-long-attacker-name-indeed", ms(9), "503"), at(1));
        let table = ReportTable(&group.report_at(true, at(2))).to_string();
        assert!(table.contains("=== PLAN smoke ==="));
        assert!(table.contains(" get / "));
        assert!(table.contains("a-very-long-attacker-n.."));
        assert!(table.contains("Aggregated"));
        assert!(table.contains("| 503"));
    }
}
