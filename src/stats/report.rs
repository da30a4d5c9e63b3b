//! Report schema and histogram projection.
//!
//! A report is a deep snapshot of every metrics bucket plus run identity.
//! The same serde schema serves the JSON export file and the aggregator
//! wire; evolution is additive and unknown fields are ignored on decode.
//! Latency histograms travel as base64-encoded HDR V2 payloads so a remote
//! aggregator can merge them without loss.

use std::collections::HashMap;
use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use super::{BucketKey, MetricsBucket, TraceKind};

pub const PERCENTILES: [f64; 6] = [50.0, 75.0, 90.0, 95.0, 99.0, 99.99];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub requestrate: u64,
    pub concurrency: usize,
    pub duration: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Number of merged remote reports; only present on aggregated reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<u64>,
    pub results: Vec<TargetResult>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub digest_to_query: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetResult {
    pub kind: TraceKind,
    pub target: String,
    pub subtarget: String,
    pub avg_rps: f64,
    pub histogram: HistogramData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_2xx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_3xx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_4xx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_5xx: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors2: Option<u64>,
    /// Base64 HDR V2 encoding of the latency histogram, used for merging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_snapshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramData {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
    pub data: Vec<DistBucket>,
    pub percentiles: Vec<PercentilePoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistBucket {
    pub interval: f64,
    pub count: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentilePoint {
    pub percentile: f64,
    pub value: f64,
}

pub(crate) fn result_for(key: &BucketKey, bucket: &MetricsBucket) -> TargetResult {
    let scale = key.kind.scale();
    let http = key.kind == TraceKind::Http;
    TargetResult {
        kind: key.kind,
        target: key.target.clone(),
        subtarget: key.subtarget.clone(),
        avg_rps: bucket.rps.mean(),
        histogram: histogram_data(&bucket.latency, scale),
        status_2xx: http.then_some(bucket.status_2xx),
        status_3xx: http.then_some(bucket.status_3xx),
        status_4xx: http.then_some(bucket.status_4xx),
        status_5xx: http.then_some(bucket.status_5xx),
        errors: Some(bucket.errors),
        errors2: Some(bucket.errors2),
        latency_snapshot: encode_histogram(&bucket.latency),
    }
}

pub(crate) fn histogram_data(histogram: &Histogram<u64>, scale: f64) -> HistogramData {
    HistogramData {
        count: histogram.len(),
        min: if histogram.len() == 0 {
            0.0
        } else {
            histogram.min() as f64 / scale
        },
        max: histogram.max() as f64 / scale,
        avg: histogram.mean() / scale,
        stddev: histogram.stdev() / scale,
        data: distribution(histogram, scale),
        percentiles: PERCENTILES
            .iter()
            .map(|&p| PercentilePoint {
                percentile: p,
                value: histogram.value_at_quantile(p / 100.0) as f64 / scale,
            })
            .collect(),
    }
}

pub(crate) fn encode_histogram(histogram: &Histogram<u64>) -> Option<String> {
    let mut buf = Vec::new();
    match V2Serializer::new().serialize(histogram, &mut buf) {
        Ok(_) => Some(BASE64.encode(buf)),
        Err(err) => {
            tracing::warn!("failed to serialize latency histogram: {err:?}");
            None
        }
    }
}

pub(crate) fn decode_histogram(data: &str) -> anyhow::Result<Histogram<u64>> {
    let bytes = BASE64.decode(data)?;
    Deserializer::new()
        .deserialize(&mut Cursor::new(bytes))
        .map_err(|err| anyhow::anyhow!("{err:?}"))
}

/// One contiguous run of recorded values in the underlying histogram.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bar {
    pub(crate) from: u64,
    pub(crate) to: u64,
    pub(crate) count: u64,
}

fn bars(histogram: &Histogram<u64>) -> Vec<Bar> {
    histogram
        .iter_recorded()
        .map(|v| Bar {
            from: histogram.lowest_equivalent(v.value_iterated_to()),
            to: histogram.highest_equivalent(v.value_iterated_to()),
            count: v.count_at_value(),
        })
        .collect()
}

pub(crate) fn distribution(histogram: &Histogram<u64>, scale: f64) -> Vec<DistBucket> {
    let bars = bars(histogram);
    if bars.is_empty() {
        return Vec::new();
    }
    project(&bars, histogram.min(), histogram.max(), scale)
}

/// Project HDR bars onto 10 equal sub-ranges of `[min, max]`.
///
/// A bar entirely inside a sub-range contributes its whole count. A bar
/// straddling an edge is split by range ratio, rounding at the lower edge
/// and flooring at the upper so the projected total never exceeds the
/// histogram's. The trailing bar lands wholesale in the final sub-range.
pub(crate) fn project(bars: &[Bar], min: u64, max: u64, scale: f64) -> Vec<DistBucket> {
    const BUCKETS: usize = 10;
    let mut bounds = [0u64; BUCKETS + 1];
    let mut counts = [0u64; BUCKETS + 1];
    let step = (max - min) / BUCKETS as u64;
    for (i, bound) in bounds.iter_mut().enumerate().take(BUCKETS) {
        *bound = min + step * i as u64;
    }
    bounds[BUCKETS] = max;
    counts[BUCKETS] = bars[bars.len() - 1].count;

    let mut bi = 0usize;
    let mut i = 0usize;
    while i + 1 < bars.len() {
        let bar = &bars[i];
        if bar.from <= bounds[bi] && bar.to <= bounds[bi] {
            counts[bi] += bar.count;
            i += 1;
        } else if bar.from <= bounds[bi] && bar.to > bounds[bi] {
            let range = (bar.to - bar.from) as f64;
            let below = (bounds[bi] - bar.from) as f64;
            let above = (bar.to - bounds[bi]) as f64;
            counts[bi] += (bar.count as f64 * (below / range)).round() as u64;
            if bi < BUCKETS {
                bi += 1;
            }
            counts[bi] += (bar.count as f64 * (above / range)).floor() as u64;
            i += 1;
        } else if bi < BUCKETS {
            bi += 1;
        } else {
            break;
        }
    }

    let total: u64 = counts.iter().sum();
    bounds
        .iter()
        .zip(counts.iter())
        .filter(|(_, &count)| count > 0)
        .map(|(&bound, &count)| DistBucket {
            interval: bound as f64 / scale,
            count,
            percent: 100.0 * count as f64 / total as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histogram_with(values: &[u64]) -> Histogram<u64> {
        let mut h = Histogram::new_with_bounds(1, 300_000_000, 3).unwrap();
        for &v in values {
            h.record(v).unwrap();
        }
        h
    }

    #[test]
    fn percentiles_are_monotone() {
        let h = histogram_with(&[100, 200, 300, 400, 500, 10_000, 50_000]);
        let data = histogram_data(&h, 1000.0);
        let values: Vec<f64> = data.percentiles.iter().map(|p| p.value).collect();
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1], "percentiles must be non-decreasing");
        }
        assert!(*values.last().unwrap() <= data.max);
    }

    #[test]
    fn distribution_conserves_counts() {
        let values: Vec<u64> = (1..=1000).map(|i| i * 37).collect();
        let h = histogram_with(&values);
        let buckets = distribution(&h, 1.0);
        let total: u64 = buckets.iter().map(|b| b.count).sum();
        assert!(total <= h.len());
        // Splitting rounds down at worst one count per sub-range edge.
        assert!(total >= h.len().saturating_sub(11));
        let percent: f64 = buckets.iter().map(|b| b.percent).sum();
        assert!((percent - 100.0).abs() < 0.01);
    }

    #[test]
    fn single_value_lands_in_last_bucket() {
        let h = histogram_with(&[500]);
        let buckets = distribution(&h, 1.0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 1);
        assert!((buckets[0].percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_round_trips() {
        let h = histogram_with(&[10, 20, 30, 40]);
        let encoded = encode_histogram(&h).unwrap();
        let decoded = decode_histogram(&encoded).unwrap();
        assert_eq!(decoded.len(), h.len());
        assert_eq!(decoded.max(), h.max());
    }

    #[test]
    fn report_json_round_trips_and_ignores_unknown_fields(){
        let json = serde_json::json!({
            "id": "abc",
            "requestrate": 5,
            "concurrency": 2,
            "duration": "10s",
            "start_time": "2026-01-01T00:00:00Z",
            "end_time": "2026-01-01T00:00:10Z",
            "results": [],
            "some_future_field": true,
        });
        let report: Report = serde_json::from_value(json).unwrap();
        assert_eq!(report.requestrate, 5);
        assert!(report.digest_to_query.is_empty());
        let round = serde_json::to_string(&report).unwrap();
        assert!(!round.contains("num_workers"));
    }
}
