//! Metrics pipeline: trace records, per-target buckets, and the collector
//! task that owns them.
//!
//! Workers push [`TraceRecord`]s into a bounded channel; a single collector
//! task folds them into HDR histograms keyed by `(kind, target, subtarget)`.
//! Every management operation (print/export/import/reset) is a message to
//! that task, so the store is never touched from two places at once. A one
//! second ticker drives the per-bucket RPS estimator; each command drains
//! the trace channel before it runs so reports never trail the traffic that
//! produced them.

pub mod fingerprint;
mod print;
pub mod report;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use report::{HistogramData, Report, TargetResult};

/// Latency histograms span 1 µs to 5 minutes at 3 significant digits.
const LATENCY_MAX_MICROS: u64 = 300_000_000;
const RPS_MAX: u64 = 10_000_000;
const SIGFIGS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Http,
    Grpc,
    Sql,
    Pg,
    Clickhouse,
    Cql,
    Redis,
    Mongo,
    Smtp,
    Kafka,
    Custom,
    Raw,
}

impl TraceKind {
    /// Kinds whose subtarget is a query text that gets fingerprinted into a
    /// digest before bucketing.
    pub fn is_sql_family(self) -> bool {
        matches!(
            self,
            TraceKind::Sql | TraceKind::Pg | TraceKind::Cql | TraceKind::Clickhouse
        )
    }

    /// Display scale for latency values: histograms store microseconds and
    /// reports show milliseconds, except `Raw` which is unscaled.
    pub(crate) fn scale(self) -> f64 {
        if self == TraceKind::Raw {
            1.0
        } else {
            1000.0
        }
    }
}

/// The one event type crossing the worker → collector boundary.
#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub kind: TraceKind,
    pub target: String,
    pub subtarget: String,
    /// Elapsed time; nanosecond-precision raw value for [`TraceKind::Raw`],
    /// microseconds otherwise. Ignored for latency when `error` is set.
    pub duration: Duration,
    pub status: Option<u16>,
    pub error: bool,
    pub deadline_exceeded: bool,
}

impl TraceRecord {
    pub fn new(kind: TraceKind, target: impl Into<String>, subtarget: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            subtarget: subtarget.into(),
            duration: Duration::ZERO,
            status: None,
            error: false,
            deadline_exceeded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct BucketKey {
    pub(crate) kind: TraceKind,
    pub(crate) target: String,
    pub(crate) subtarget: String,
}

/// Owned exclusively by the collector; created on the first record for its
/// key and destroyed only on reset.
pub(crate) struct MetricsBucket {
    pub(crate) latency: Histogram<u64>,
    pub(crate) rps: Histogram<u64>,
    pub(crate) status_2xx: u64,
    pub(crate) status_3xx: u64,
    pub(crate) status_4xx: u64,
    pub(crate) status_5xx: u64,
    pub(crate) errors: u64,
    pub(crate) errors2: u64,
    last_reftime: Option<Instant>,
    last_total_count: u64,
}

impl MetricsBucket {
    fn new() -> Self {
        Self {
            latency: Histogram::new_with_bounds(1, LATENCY_MAX_MICROS, SIGFIGS)
                .expect("histogram creation"),
            rps: Histogram::new_with_bounds(1, RPS_MAX, SIGFIGS).expect("histogram creation"),
            status_2xx: 0,
            status_3xx: 0,
            status_4xx: 0,
            status_5xx: 0,
            errors: 0,
            errors2: 0,
            last_reftime: None,
            last_total_count: 0,
        }
    }

    /// Values above the histogram ceiling are clamped into the top bucket
    /// rather than dropped.
    fn record_latency(&mut self, value: u64) {
        if self.latency.record(value).is_err() {
            tracing::warn!(value, "latency outside histogram range, clamping");
            self.latency.saturating_record(value);
        }
    }

    fn update_rps(&mut self, now: Instant) {
        let total = self.latency.len();
        if let Some(last) = self.last_reftime {
            let elapsed_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            if elapsed_ms > 0.0 {
                let delta = total - self.last_total_count;
                let rps = (delta as f64 * 1000.0 / elapsed_ms).round() as u64;
                if rps != 0 {
                    self.rps.saturating_record(rps);
                }
            }
        }
        self.last_reftime = Some(now);
        self.last_total_count = total;
    }
}

/// All run state behind the collector task.
pub(crate) struct Store {
    pub(crate) id: String,
    pub(crate) requestrate: u64,
    pub(crate) concurrency: usize,
    pub(crate) duration: Duration,
    pub(crate) start_time: DateTime<Utc>,
    pub(crate) end_time: Option<DateTime<Utc>>,
    pub(crate) import_count: u64,
    pub(crate) buckets: HashMap<BucketKey, MetricsBucket>,
    pub(crate) digest_to_query: HashMap<String, String>,
}

impl Store {
    fn new(id: String, requestrate: u64, concurrency: usize, duration: Duration) -> Self {
        Self {
            id,
            requestrate,
            concurrency,
            duration,
            start_time: Utc::now(),
            end_time: None,
            import_count: 0,
            buckets: HashMap::new(),
            digest_to_query: HashMap::new(),
        }
    }

    fn bucket_mut(&mut self, kind: TraceKind, target: &str, subtarget: &str) -> &mut MetricsBucket {
        self.buckets
            .entry(BucketKey {
                kind,
                target: target.to_string(),
                subtarget: subtarget.to_string(),
            })
            .or_insert_with(MetricsBucket::new)
    }

    pub(crate) fn update(&mut self, mut record: TraceRecord) {
        if record.kind.is_sql_family() {
            let normalized = fingerprint::fingerprint(&record.subtarget);
            let digest = fingerprint::digest(&normalized);
            self.digest_to_query.insert(digest.clone(), normalized);
            record.subtarget = digest;
        }

        let kind = record.kind;
        let bucket = self.bucket_mut(kind, &record.target, &record.subtarget);

        match kind {
            TraceKind::Http => {
                if let Some(status) = record.status {
                    match status {
                        500.. => bucket.status_5xx += 1,
                        400..=499 => bucket.status_4xx += 1,
                        300..=399 => bucket.status_3xx += 1,
                        200..=299 => bucket.status_2xx += 1,
                        _ => {}
                    }
                }
            }
            TraceKind::Grpc => {
                if record.deadline_exceeded {
                    bucket.errors2 += 1;
                }
            }
            _ => {}
        }

        if record.error {
            bucket.errors += 1;
        } else if !record.duration.is_zero() {
            let value = if kind == TraceKind::Raw {
                record.duration.as_nanos() as u64
            } else {
                record.duration.as_micros() as u64
            };
            bucket.record_latency(value.max(1));
        }
    }

    pub(crate) fn update_rps(&mut self) {
        let now = Instant::now();
        for bucket in self.buckets.values_mut() {
            bucket.update_rps(now);
        }
    }

    pub(crate) fn export(&mut self) -> Report {
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }

        let mut results: Vec<TargetResult> = self
            .buckets
            .iter()
            .map(|(key, bucket)| report::result_for(key, bucket))
            .collect();
        results.sort_by(|a, b| {
            a.target
                .cmp(&b.target)
                .then_with(|| a.subtarget.cmp(&b.subtarget))
        });

        Report {
            id: self.id.clone(),
            requestrate: self.requestrate,
            concurrency: self.concurrency,
            duration: humantime::format_duration(self.duration).to_string(),
            start_time: self.start_time,
            end_time: self.end_time.unwrap_or_else(Utc::now),
            num_workers: (self.import_count > 0).then_some(self.import_count),
            results,
            digest_to_query: self.digest_to_query.clone(),
        }
    }

    /// Fold a remote worker's report into this store. Counters add; latency
    /// histograms merge; RPS is treated as additive across parallel fleet
    /// members, so the local rps histogram collapses to the running sum.
    pub(crate) fn import(&mut self, report: &Report) {
        self.requestrate += report.requestrate;
        self.concurrency += report.concurrency;
        if let Ok(d) = humantime::parse_duration(&report.duration) {
            self.duration += d;
        }
        if report.start_time < self.start_time {
            self.start_time = report.start_time;
        }
        match self.end_time {
            Some(end) if end >= report.end_time => {}
            _ => self.end_time = Some(report.end_time),
        }
        self.import_count += 1;

        for result in &report.results {
            let bucket = self.bucket_mut(result.kind, &result.target, &result.subtarget);

            bucket.status_2xx += result.status_2xx.unwrap_or(0);
            bucket.status_3xx += result.status_3xx.unwrap_or(0);
            bucket.status_4xx += result.status_4xx.unwrap_or(0);
            bucket.status_5xx += result.status_5xx.unwrap_or(0);
            bucket.errors += result.errors.unwrap_or(0);
            bucket.errors2 += result.errors2.unwrap_or(0);

            match &result.latency_snapshot {
                Some(snapshot) => match report::decode_histogram(snapshot) {
                    Ok(histogram) => {
                        if let Err(err) = bucket.latency.add(&histogram) {
                            tracing::warn!("dropped latency metrics on merge: {err}");
                        }
                    }
                    Err(err) => tracing::warn!("undecodable latency snapshot: {err:#}"),
                },
                None => tracing::warn!(
                    target = %result.target,
                    subtarget = %result.subtarget,
                    "report result carries no latency snapshot, merging counters only"
                ),
            }

            let current = bucket.rps.mean();
            bucket.rps.reset();
            let combined = (current + result.avg_rps).round();
            if combined >= 1.0 {
                bucket.rps.saturating_record(combined as u64);
            }
        }

        for (digest, query) in &report.digest_to_query {
            self.digest_to_query
                .insert(digest.clone(), query.clone());
        }
    }

    pub(crate) fn reset(&mut self) {
        self.reset_metrics();
        self.requestrate = 0;
        self.concurrency = 0;
        self.duration = Duration::ZERO;
    }

    pub(crate) fn reset_metrics(&mut self) {
        self.buckets.clear();
        self.digest_to_query.clear();
        self.start_time = Utc::now();
        self.end_time = None;
        self.import_count = 0;
    }
}

/// The collector task is gone; management calls cannot be served.
#[derive(Debug, thiserror::Error)]
#[error("stats collector unavailable")]
pub struct CollectorClosed;

enum Command {
    Print(oneshot::Sender<String>),
    Export(oneshot::Sender<Report>),
    Import(Box<Report>, oneshot::Sender<()>),
    Reset(oneshot::Sender<()>),
    ResetMetrics(oneshot::Sender<()>),
    Quit(oneshot::Sender<()>),
}

/// Cloneable handle to the collector task. Worker-path sends go over the
/// bounded trace channel; management calls rendezvous over oneshots.
#[derive(Clone)]
pub struct Stats {
    records: mpsc::Sender<TraceRecord>,
    commands: mpsc::Sender<Command>,
}

impl Stats {
    /// Spawn the collector. Channel capacity scales with the request rate so
    /// a fast producer burst never stalls workers in the steady state.
    /// `server` suppresses the RPS ticker: an aggregator only merges
    /// finished reports and must not dilute their rates with idle seconds.
    pub fn spawn(
        id: impl Into<String>,
        requestrate: u64,
        concurrency: usize,
        duration: Duration,
        server: bool,
    ) -> (Stats, JoinHandle<()>) {
        let capacity = (requestrate as usize).saturating_mul(100).max(10_000);
        let (record_tx, record_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(16);
        let store = Store::new(id.into(), requestrate, concurrency, duration);
        let handle = tokio::spawn(collect(store, record_rx, command_rx, server));
        (
            Stats {
                records: record_tx,
                commands: command_tx,
            },
            handle,
        )
    }

    pub async fn record(&self, record: TraceRecord) {
        if self.records.send(record).await.is_err() {
            tracing::warn!("trace channel closed, dropping record");
        }
    }

    /// Render the current metrics as text tables.
    pub async fn report(&self) -> String {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Print(tx)).await.is_err() {
            return String::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn export(&self) -> anyhow::Result<Report> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Export(tx))
            .await
            .map_err(|_| CollectorClosed)?;
        Ok(rx.await.map_err(|_| CollectorClosed)?)
    }

    pub async fn import(&self, report: Report) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Import(Box::new(report), tx))
            .await
            .map_err(|_| CollectorClosed)?;
        Ok(rx.await.map_err(|_| CollectorClosed)?)
    }

    pub async fn reset(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Reset(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Reset metrics only, keeping run identity. Fired at the warmup
    /// boundary to discard warmup noise.
    pub async fn reset_metrics(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::ResetMetrics(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the collector after it drained every pending record.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Quit(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn drain(store: &mut Store, records: &mut mpsc::Receiver<TraceRecord>) {
    while let Ok(record) = records.try_recv() {
        store.update(record);
    }
}

async fn collect(
    mut store: Store,
    mut records: mpsc::Receiver<TraceRecord>,
    mut commands: mpsc::Receiver<Command>,
    server: bool,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut records_open = true;

    loop {
        tokio::select! {
            maybe = records.recv(), if records_open => match maybe {
                Some(record) => store.update(record),
                None => records_open = false,
            },
            _ = ticker.tick(), if !server => {
                drain(&mut store, &mut records);
                store.update_rps();
            }
            maybe = commands.recv() => {
                let Some(command) = maybe else { break };
                drain(&mut store, &mut records);
                match command {
                    Command::Print(reply) => {
                        let _ = reply.send(store.print());
                    }
                    Command::Export(reply) => {
                        let _ = reply.send(store.export());
                    }
                    Command::Import(report, reply) => {
                        store.import(&report);
                        let _ = reply.send(());
                    }
                    Command::Reset(reply) => {
                        store.reset();
                        let _ = reply.send(());
                    }
                    Command::ResetMetrics(reply) => {
                        store.reset_metrics();
                        let _ = reply.send(());
                    }
                    Command::Quit(reply) => {
                        let _ = reply.send(());
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::new("test".into(), 10, 2, Duration::from_secs(1))
    }

    fn http_record(status: u16, duration_ms: u64) -> TraceRecord {
        let mut record = TraceRecord::new(TraceKind::Http, "http://127.0.0.1:8080", "/hello");
        record.status = Some(status);
        record.duration = Duration::from_millis(duration_ms);
        record
    }

    #[test]
    fn non_error_records_count_toward_latency() {
        let mut s = store();
        s.update(http_record(200, 12));
        s.update(http_record(200, 15));

        let mut error = http_record(200, 40);
        error.status = None;
        error.error = true;
        s.update(error);

        let bucket = s.buckets.values().next().unwrap();
        assert_eq!(bucket.latency.len(), 2);
        assert_eq!(bucket.errors, 1);
    }

    #[test]
    fn http_status_classes_bucket_exactly_once() {
        let mut s = store();
        for status in [200, 204, 301, 404, 503] {
            s.update(http_record(status, 1));
        }
        let bucket = s.buckets.values().next().unwrap();
        assert_eq!(bucket.status_2xx, 2);
        assert_eq!(bucket.status_3xx, 1);
        assert_eq!(bucket.status_4xx, 1);
        assert_eq!(bucket.status_5xx, 1);
        assert_eq!(
            bucket.status_2xx + bucket.status_3xx + bucket.status_4xx + bucket.status_5xx,
            5
        );
    }

    #[test]
    fn sql_records_fold_by_fingerprint() {
        let mut s = store();
        for query in ["SELECT * FROM t WHERE id=1", "SELECT * FROM t WHERE id=2"] {
            let mut record = TraceRecord::new(TraceKind::Sql, "db-host", query);
            record.duration = Duration::from_millis(3);
            s.update(record);
        }

        assert_eq!(s.buckets.len(), 1);
        assert_eq!(s.digest_to_query.len(), 1);
        let (_, query) = s.digest_to_query.iter().next().unwrap();
        assert_eq!(query, "select * from t where id=?");
        assert_eq!(s.buckets.values().next().unwrap().latency.len(), 2);
    }

    #[test]
    fn grpc_deadline_increments_errors2_without_latency() {
        let mut s = store();
        let mut record = TraceRecord::new(TraceKind::Grpc, "127.0.0.1:50051", "pkg.Svc/Method");
        record.error = true;
        record.deadline_exceeded = true;
        s.update(record);

        let bucket = s.buckets.values().next().unwrap();
        assert_eq!(bucket.errors2, 1);
        assert_eq!(bucket.errors, 1);
        assert_eq!(bucket.latency.len(), 0);
    }

    #[test]
    fn raw_records_are_unscaled() {
        let mut s = store();
        let mut record = TraceRecord::new(TraceKind::Raw, "raw", "key");
        record.duration = Duration::from_nanos(1234);
        s.update(record);

        let bucket = s.buckets.values().next().unwrap();
        assert_eq!(bucket.latency.len(), 1);
        assert!(bucket.latency.max() >= 1234);
    }

    #[test]
    fn merge_sums_counts_and_rps() {
        let mut first = store();
        let mut second = store();
        for _ in 0..5 {
            first.update(http_record(200, 10));
        }
        for _ in 0..7 {
            second.update(http_record(200, 20));
        }

        let mut report_a = first.export();
        let mut report_b = second.export();
        report_a.results[0].avg_rps = 10.0;
        report_b.results[0].avg_rps = 15.0;

        let mut merged = store();
        merged.import(&report_a);
        merged.import(&report_b);

        assert_eq!(merged.import_count, 2);
        let bucket = merged.buckets.values().next().unwrap();
        assert_eq!(bucket.latency.len(), 12);
        assert_eq!(bucket.status_2xx, 12);
        assert!((bucket.rps.mean() - 25.0).abs() < 1.0);
    }

    #[test]
    fn merge_of_empty_report_is_idempotent() {
        let mut s = store();
        for _ in 0..3 {
            s.update(http_record(200, 10));
        }
        let before = s.buckets.values().next().unwrap().latency.len();

        let empty = store().export();
        s.import(&empty);

        assert_eq!(s.buckets.values().next().unwrap().latency.len(), before);
    }

    #[test]
    fn reset_metrics_discards_buckets_but_keeps_identity() {
        let mut s = store();
        s.update(http_record(200, 10));
        s.reset_metrics();

        assert!(s.buckets.is_empty());
        assert!(s.digest_to_query.is_empty());
        assert_eq!(s.requestrate, 10);
    }

    #[test]
    fn rps_tick_records_rate_delta() {
        let mut s = store();
        s.update(http_record(200, 1));
        s.update_rps();
        for _ in 0..4 {
            s.update(http_record(200, 1));
        }
        std::thread::sleep(Duration::from_millis(50));
        s.update_rps();

        let bucket = s.buckets.values().next().unwrap();
        assert_eq!(bucket.rps.len(), 1);
        assert!(bucket.rps.max() >= 1);
    }

    #[tokio::test]
    async fn collector_round_trip() {
        let (stats, handle) = Stats::spawn("run", 1, 1, Duration::ZERO, false);

        stats.record(http_record(200, 10)).await;
        let report = stats.export().await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].histogram.count, 1);
        assert_eq!(report.results[0].status_2xx, Some(1));

        stats.stop().await;
        handle.await.unwrap();
    }
}
