//! Aggregator server: receives reports from remote workers, merges them
//! into its own metrics store, and exposes text/JSON/graph views.
//!
//! Merges are serialized through the store's single-owner collector; the
//! HTTP layer adds no locking of its own. When started with a pre-loaded
//! report file the server is display-only and refuses imports.

mod graphs;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::stats::{Report, Stats};

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub addr: String,
    /// Pre-loaded report file; switches the server to display-only mode.
    pub import: Option<PathBuf>,
    /// Rewrite this file with the merged report after every import.
    pub export: Option<PathBuf>,
}

struct AppState {
    stats: Stats,
    preloaded: Option<Report>,
    export: Option<PathBuf>,
    imports: AtomicU64,
}

pub async fn run(stats: Stats, options: ServerOptions, cancel: CancellationToken) -> anyhow::Result<()> {
    stats.reset().await;

    let preloaded = match &options.import {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("cannot open report {}", path.display()))?;
            let report: Report = serde_json::from_reader(file)
                .with_context(|| format!("error importing report {}", path.display()))?;
            Some(report)
        }
        None => None,
    };

    let state = Arc::new(AppState {
        stats,
        preloaded,
        export: options.export.clone(),
        imports: AtomicU64::new(0),
    });

    let app = Router::new()
        .route("/", get(index))
        .route("/print", get(print_view))
        .route("/report", get(report_view))
        .route("/graphs", get(graphs_view))
        .route("/reset", get(reset_view))
        .route("/import", post(import_report))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&options.addr)
        .await
        .with_context(|| format!("cannot listen on {}", options.addr))?;
    tracing::info!("serving on http://{}", options.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn current_report(state: &AppState) -> anyhow::Result<Report> {
    match &state.preloaded {
        Some(report) => Ok(report.clone()),
        None => state.stats.export().await,
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX)
}

async fn print_view(State(state): State<Arc<AppState>>) -> String {
    state.stats.report().await
}

async fn report_view(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Report>, (StatusCode, String)> {
    current_report(&state)
        .await
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))
}

async fn graphs_view(
    State(state): State<Arc<AppState>>,
) -> Result<Html<String>, (StatusCode, String)> {
    let report = current_report(&state)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    Ok(Html(graphs::render(&report)))
}

async fn reset_view(State(state): State<Arc<AppState>>) -> &'static str {
    state.stats.reset().await;
    state.imports.store(0, Ordering::SeqCst);
    "OK"
}

async fn import_report(
    State(state): State<Arc<AppState>>,
    Json(report): Json<Report>,
) -> Result<Json<u64>, (StatusCode, String)> {
    if state.preloaded.is_some() {
        return Err((
            StatusCode::CONFLICT,
            "server is running in display only mode, not accepting metrics import".into(),
        ));
    }

    tracing::info!("importing report from {}", report.id);
    state
        .stats
        .import(report)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    let imports = state.imports.fetch_add(1, Ordering::SeqCst) + 1;

    println!("{}", state.stats.report().await);

    if let Some(path) = &state.export {
        match state.stats.export().await {
            Ok(merged) => {
                if let Err(err) = write_report(path, &merged) {
                    tracing::warn!("cannot rewrite export file: {err:#}");
                }
            }
            Err(err) => tracing::warn!("cannot export merged report: {err:#}"),
        }
    }

    Ok(Json(imports))
}

pub fn write_report(path: &PathBuf, report: &Report) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}

const INDEX: &str = r#"<head>
  <title>Load Generator</title>
  <style>
    .home-table { font-family: sans-serif; font-size: medium; border-collapse: collapse; }
    .home-row:nth-child(even) { background-color: #dddddd; }
    .home-data { border: 1px solid #dddddd; text-align: left; padding: 8px; }
  </style>
</head>
<body>
  <table class='home-table'>
    <thead>
      <th class='home-data'>Command</th>
      <th class='home-data'>Description</th>
    </thead>
    <tbody>
      <tr class='home-row'><td class='home-data'><a href='print'>print</a></td><td class='home-data'>print metrics</td></tr>
      <tr class='home-row'><td class='home-data'><a href='report'>report</a></td><td class='home-data'>report of metrics in json</td></tr>
      <tr class='home-row'><td class='home-data'><a href='graphs'>graphs</a></td><td class='home-data'>metrics graphs</td></tr>
      <tr class='home-row'><td class='home-data'><a href='reset'>reset</a></td><td class='home-data'>reset metrics</td></tr>
    </tbody>
  </table>
</body>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{TraceKind, TraceRecord};
    use std::time::Duration;

    async fn spawn_server(options: ServerOptions) -> (String, Stats, CancellationToken) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (stats, _handle) = Stats::spawn("server", 0, 0, Duration::ZERO, true);
        let cancel = CancellationToken::new();
        let server = {
            let stats = stats.clone();
            let cancel = cancel.clone();
            let options = ServerOptions {
                addr: addr.clone(),
                ..options
            };
            tokio::spawn(async move { run(stats, options, cancel).await })
        };
        // wait for the listener to come up
        for _ in 0..50 {
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = server;
        (addr, stats, cancel)
    }

    async fn sample_report() -> Report {
        let (stats, handle) = Stats::spawn("remote", 5, 2, Duration::from_secs(1), false);
        let mut record = TraceRecord::new(TraceKind::Http, "http://a", "/x");
        record.status = Some(200);
        record.duration = Duration::from_millis(5);
        stats.record(record).await;
        let report = stats.export().await.unwrap();
        stats.stop().await;
        handle.await.unwrap();
        report
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn import_merges_and_report_reflects_it() {
        let (addr, _stats, cancel) = spawn_server(ServerOptions::default()).await;
        let client = reqwest::Client::new();

        let report = sample_report().await;
        let response = client
            .post(format!("http://{addr}/import"))
            .json(&report)
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let merged: Report = client
            .get(format!("http://{addr}/report"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(merged.results.len(), 1);
        assert_eq!(merged.results[0].histogram.count, 1);
        assert_eq!(merged.num_workers, Some(1));

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn display_only_mode_refuses_imports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = sample_report().await;
        write_report(&path, &report).unwrap();

        let (addr, _stats, cancel) = spawn_server(ServerOptions {
            import: Some(path),
            ..Default::default()
        })
        .await;
        let client = reqwest::Client::new();

        let response = client
            .post(format!("http://{addr}/import"))
            .json(&report)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

        // the preloaded report is still served
        let served: Report = client
            .get(format!("http://{addr}/report"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(served.id, report.id);

        cancel.cancel();
    }
}
