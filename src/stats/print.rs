//! Text rendering of the metrics store: per-kind sections, per-target
//! column tables and bar-chart latency histograms.

use std::collections::BTreeMap;
use std::fmt::Write;

use super::report::distribution;
use super::{MetricsBucket, Store, TraceKind};

const BAR_GLYPH: &str = "■";
const BAR_WIDTH: u64 = 40;

impl Store {
    pub(crate) fn print(&self) -> String {
        let mut out = String::new();
        out.push('\n');
        if self.import_count > 0 {
            let _ = writeln!(
                out,
                "\nMetrics collected from {} remote workers",
                self.import_count
            );
        }

        let mut kinds: BTreeMap<TraceKind, BTreeMap<&str, Vec<(&str, &MetricsBucket)>>> =
            BTreeMap::new();
        for (key, bucket) in &self.buckets {
            kinds
                .entry(key.kind)
                .or_default()
                .entry(key.target.as_str())
                .or_default()
                .push((key.subtarget.as_str(), bucket));
        }

        for (kind, targets) in &kinds {
            let (section, subkey_name, extras) = kind_columns(*kind);
            let raw = *kind == TraceKind::Raw;
            let scale = kind.scale();

            for (target, rows) in targets {
                let mut rows = rows.clone();
                rows.sort_by_key(|(_, bucket)| bucket.latency.len());

                let _ = write!(out, "\n{section}:\n\n{target}:\n");

                let mut headers: Vec<&str> = vec![
                    subkey_name,
                    "Avg",
                    "StdDev",
                    "Min",
                    "Max",
                    "p50",
                    "p95",
                    "p99",
                    "p99.99",
                    "Total",
                ];
                if !raw {
                    headers.extend(["AvgRPS", "Errors"]);
                }
                headers.extend(extras);

                let mut cells = Vec::with_capacity(rows.len());
                for (subtarget, bucket) in &rows {
                    let h = &bucket.latency;
                    let mut row = vec![
                        subtarget.to_string(),
                        format!("{:.2}", h.mean() / scale),
                        format!("{:.2}", h.stdev() / scale),
                        format!("{:.2}", h.min() as f64 / scale),
                        format!("{:.2}", h.max() as f64 / scale),
                        format!("{:.2}", h.value_at_quantile(0.50) as f64 / scale),
                        format!("{:.2}", h.value_at_quantile(0.95) as f64 / scale),
                        format!("{:.2}", h.value_at_quantile(0.99) as f64 / scale),
                        format!("{:.2}", h.value_at_quantile(0.9999) as f64 / scale),
                        h.len().to_string(),
                    ];
                    if !raw {
                        row.push(format!("{:.2}", bucket.rps.mean()));
                        row.push(bucket.errors.to_string());
                    }
                    for extra in extras {
                        row.push(match *extra {
                            "2xx" => bucket.status_2xx.to_string(),
                            "3xx" => bucket.status_3xx.to_string(),
                            "4xx" => bucket.status_4xx.to_string(),
                            "5xx" => bucket.status_5xx.to_string(),
                            "deadline" => bucket.errors2.to_string(),
                            other => {
                                tracing::error!("unknown column to print: {other}");
                                String::new()
                            }
                        });
                    }
                    cells.push(row);
                }

                out.push_str(&render_table(&headers, &cells));

                let description = if raw {
                    ""
                } else {
                    "Response time histogram (ms):"
                };
                for (subtarget, bucket) in &rows {
                    out.push_str(&bar_chart(subtarget, description, bucket, scale));
                }
            }
        }

        if !self.digest_to_query.is_empty() {
            out.push_str("Digest to query mapping:\n");
            let mut entries: Vec<_> = self.digest_to_query.iter().collect();
            entries.sort();
            for (digest, query) in entries {
                let _ = writeln!(out, "  {digest} : {query}");
            }
        }
        out.push('\n');

        out
    }
}

fn kind_columns(kind: TraceKind) -> (&'static str, &'static str, &'static [&'static str]) {
    match kind {
        TraceKind::Http => ("HTTP Metrics", "Url", &["2xx", "3xx", "4xx", "5xx"]),
        TraceKind::Grpc => ("GRPC Metrics", "Method", &["deadline"]),
        TraceKind::Sql => ("MySQL Metrics", "Query", &[]),
        TraceKind::Pg => ("PostgresQL Metrics", "Query", &[]),
        TraceKind::Clickhouse => ("ClickHouse Metrics", "Query", &[]),
        TraceKind::Cql => ("Cassandra Metrics", "Query", &[]),
        TraceKind::Redis => ("Redis Metrics", "Command", &[]),
        TraceKind::Mongo => ("MongoDB Metrics", "Operation", &[]),
        TraceKind::Smtp => ("SMTP Metrics", "Key", &[]),
        TraceKind::Kafka => ("Kafka Metrics", "Topic", &[]),
        TraceKind::Custom => ("Custom Metrics", "Key", &[]),
        TraceKind::Raw => ("Raw Metrics", "Key", &[]),
    }
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let mut out = String::new();
    for (i, header) in headers.iter().enumerate() {
        let _ = write!(out, "{:<width$}  ", header, width = widths[i]);
    }
    out.push('\n');
    for width in &widths {
        let _ = write!(out, "{}  ", "-".repeat(*width));
    }
    out.push('\n');
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            let _ = write!(out, "{:<width$}  ", cell, width = widths[i]);
        }
        out.push('\n');
    }
    out
}

fn bar_chart(title: &str, description: &str, bucket: &MetricsBucket, scale: f64) -> String {
    let buckets = distribution(&bucket.latency, scale);
    if buckets.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    if !description.is_empty() {
        let _ = write!(out, "\n{description}\n");
    }
    let _ = write!(out, "\n{title}:\n");

    let max = buckets.iter().map(|b| b.count).max().unwrap_or(0);
    for b in &buckets {
        let len = if max > 0 {
            (b.count * BAR_WIDTH + max / 2) / max
        } else {
            0
        };
        let _ = writeln!(
            out,
            "{:10.3} [{:10}]\t|{}",
            b.interval,
            b.count,
            BAR_GLYPH.repeat(len as usize)
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TraceRecord;
    use std::time::Duration;

    #[test]
    fn print_renders_sections_and_digest_map() {
        let mut store = Store::new("id".into(), 1, 1, Duration::ZERO);

        let mut http = TraceRecord::new(TraceKind::Http, "http://127.0.0.1:9999", "/hello");
        http.status = Some(200);
        http.duration = Duration::from_millis(12);
        store.update(http);

        let mut sql = TraceRecord::new(TraceKind::Sql, "db", "SELECT * FROM t WHERE id=9");
        sql.duration = Duration::from_millis(2);
        store.update(sql);

        let rendered = store.print();
        assert!(rendered.contains("HTTP Metrics"));
        assert!(rendered.contains("http://127.0.0.1:9999"));
        assert!(rendered.contains("/hello"));
        assert!(rendered.contains("MySQL Metrics"));
        assert!(rendered.contains("Digest to query mapping:"));
        assert!(rendered.contains("select * from t where id=?"));
    }
}
