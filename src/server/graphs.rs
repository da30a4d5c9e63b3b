//! Percentile chart rendering: one Chart.js line chart per target, one
//! dataset per subtarget (digests resolved back to their query text).

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::stats::Report;

pub(crate) fn render(report: &Report) -> String {
    let mut targets: BTreeMap<&str, Vec<serde_json::Value>> = BTreeMap::new();
    for result in &report.results {
        let label = report
            .digest_to_query
            .get(&result.subtarget)
            .unwrap_or(&result.subtarget);
        let points: Vec<serde_json::Value> = result
            .histogram
            .percentiles
            .iter()
            .map(|p| serde_json::json!({ "x": p.percentile, "y": p.value }))
            .collect();
        targets
            .entry(result.target.as_str())
            .or_default()
            .push(serde_json::json!({
                "label": label,
                "data": points,
                "fill": false,
                "pointRadius": 6,
                "borderColor": "rgba(250, 141, 98, 0.86)",
                "backgroundColor": "rgba(102, 194, 165, 0.86)",
            }));
    }

    let mut out = String::from(
        "<!DOCTYPE html><html><head><title>Load Generator</title>\
         <script src='https://cdn.jsdelivr.net/npm/chart.js@4'></script>\
         </head><body>\n",
    );
    for (index, (target, datasets)) in targets.iter().enumerate() {
        let config = serde_json::json!({
            "type": "line",
            "data": { "datasets": datasets },
            "options": {
                "responsive": false,
                "plugins": { "title": { "display": true, "text": target } },
                "scales": {
                    "x": {
                        "type": "linear",
                        "position": "bottom",
                        "title": { "display": true, "text": "Percentiles" },
                    },
                    "y": {
                        "type": "linear",
                        "title": { "display": true, "text": "Latency (ms)" },
                    },
                },
            },
        });
        let _ = write!(
            out,
            "<canvas id='chart{index}' width='800' height='400'></canvas>\n\
             <script>new Chart(document.getElementById('chart{index}'), {config});</script>\n"
        );
    }
    out.push_str("</body></html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn renders_one_chart_per_target() {
        let report = Report {
            id: "x".into(),
            requestrate: 1,
            concurrency: 1,
            duration: "1s".into(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            num_workers: None,
            results: vec![],
            digest_to_query: Default::default(),
        };
        let html = render(&report);
        assert!(html.contains("chart.js"));
        assert!(!html.contains("canvas"));
    }
}
