//! Command-line surface: one subcommand per protocol plus `script`,
//! `server` and `version`. Shared options (rate, concurrency, warmup,
//! duration, export/publish) live on the root command.

mod clickhouse;
mod cql;
mod grpc;
mod http;
mod kafka;
mod mongo;
mod mysql;
mod psql;
mod redis;
mod script;
mod server;
mod smtp;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::generator::GeneratorFactory;
use crate::runner::Runner;
use crate::stats::Stats;

#[derive(Parser, Debug)]
#[command(
    name = "surge",
    version,
    about = "Multi-protocol load generator",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Request rate per second. 0 means no control on throughput
    #[arg(long, global = true, default_value_t = 1)]
    pub requestrate: u64,

    /// Number of concurrent workers. Defaults to the request rate
    #[arg(long, global = true, default_value_t = 0)]
    pub concurrency: usize,

    /// How long to run the test. 0 means forever
    #[arg(long, global = true, default_value = "0s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    /// Warmup time; metrics collected during warmup are discarded
    #[arg(long, global = true, default_value = "5s", value_parser = humantime::parse_duration)]
    pub warmup: Duration,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,

    /// Debug mode, useful to debug hung scripts
    #[arg(long, global = true)]
    pub debug: bool,

    /// Write a CPU flamegraph to this file at the end of the run
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// Export results in json format
    #[arg(long, global = true)]
    pub export: Option<PathBuf>,

    /// Publish the final report to a remote aggregator (host:port)
    #[arg(long, global = true)]
    pub server: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Http(http::HttpArgs),
    Grpc(grpc::GrpcArgs),
    Mysql(mysql::MysqlArgs),
    Psql(psql::PsqlArgs),
    Clickhouse(clickhouse::ClickhouseArgs),
    Cql(cql::CqlArgs),
    Redis(redis::RedisArgs),
    Mongo(mongo::MongoArgs),
    Kafka(kafka::KafkaArgs),
    Smtp(smtp::SmtpArgs),
    Script(script::ScriptArgs),
    Server(server::ServerArgs),
    /// Print the version
    Version,
}

pub async fn run(cancel: CancellationToken) -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            return code;
        }
    };

    init_tracing(cli.global.verbose || cli.global.debug);

    if matches!(cli.command, Command::Version) {
        println!("surge {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    match execute(cli, cancel).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

async fn execute(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let global = cli.global;
    let concurrency = match global.concurrency {
        0 => (global.requestrate as usize).max(1),
        n => n,
    };
    let id = uuid::Uuid::new_v4().to_string();
    let server_mode = matches!(cli.command, Command::Server(_));

    let (stats, collector) = Stats::spawn(
        id,
        global.requestrate,
        concurrency,
        global.duration,
        server_mode,
    );

    let profiler = match &global.profile {
        Some(_) => Some(
            pprof::ProfilerGuardBuilder::default()
                .frequency(99)
                .build()
                .context("cannot start profiler")?,
        ),
        None => None,
    };

    let result = match cli.command {
        Command::Http(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Grpc(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Mysql(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Psql(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Clickhouse(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Cql(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Redis(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Mongo(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Kafka(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Smtp(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Script(args) => {
            run_load(args.factory()?, &global, concurrency, &stats, &cancel).await
        }
        Command::Server(args) => {
            crate::server::run(stats.clone(), args.options(&global), cancel.clone()).await
        }
        Command::Version => unreachable!("handled before execute"),
    };

    if let (Some(path), Some(guard)) = (&global.profile, profiler) {
        if let Err(err) = write_flamegraph(path, &guard) {
            tracing::warn!("could not write profile: {err:#}");
        }
    }

    if !server_mode && result.is_ok() {
        if let Some(path) = &global.export {
            let report = stats.export().await?;
            crate::server::write_report(path, &report)?;
        }
        if let Some(addr) = &global.server {
            publish_report(addr, &stats).await?;
        }
    }

    stats.stop().await;
    let _ = collector.await;

    result
}

async fn run_load(
    factory: GeneratorFactory,
    global: &GlobalOpts,
    concurrency: usize,
    stats: &Stats,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    Runner::new(
        global.requestrate,
        concurrency,
        global.warmup,
        global.duration,
        cancel.clone(),
        stats.clone(),
        factory,
    )
    .run()
    .await;
    Ok(())
}

async fn publish_report(addr: &str, stats: &Stats) -> anyhow::Result<()> {
    tracing::info!("publishing stats to {addr}");
    let report = stats.export().await?;
    let url = if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{addr}/import")
    } else {
        format!("http://{addr}/import")
    };
    let response = reqwest::Client::new()
        .post(url)
        .json(&report)
        .send()
        .await
        .context("cannot publish, error connecting to server")?;
    anyhow::ensure!(
        response.status().is_success(),
        "publish error: server replied {}",
        response.status()
    );
    Ok(())
}

fn write_flamegraph(path: &PathBuf, guard: &pprof::ProfilerGuard<'_>) -> anyhow::Result<()> {
    let report = guard.report().build()?;
    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create profile file {}", path.display()))?;
    report.flamegraph(file)?;
    tracing::debug!("wrote CPU flamegraph to {}", path.display());
    Ok(())
}

/// Parse `Name: value` pairs the way curl-ish tools do.
pub(crate) fn parse_header_pairs(headers: &[String]) -> HashMap<String, String> {
    let mut parsed = HashMap::new();
    for header in headers {
        if let Some(split) = header.find(':') {
            if split > 0 && split + 1 < header.len() {
                parsed.insert(
                    header[..split].trim().to_string(),
                    header[split + 1..].trim().to_string(),
                );
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pairs_parse_and_trim() {
        let parsed = parse_header_pairs(&[
            "Accept: application/json".to_string(),
            "X-Token:abc".to_string(),
            "broken".to_string(),
        ]);
        assert_eq!(parsed.get("Accept").unwrap(), "application/json");
        assert_eq!(parsed.get("X-Token").unwrap(), "abc");
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn concurrency_defaults_to_requestrate() {
        let cli = Cli::try_parse_from([
            "surge",
            "http",
            "http://127.0.0.1/",
            "--requestrate",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.global.requestrate, 7);
        assert_eq!(cli.global.concurrency, 0);
    }

    #[test]
    fn duration_flags_accept_humantime() {
        let cli = Cli::try_parse_from([
            "surge",
            "http",
            "http://127.0.0.1/",
            "--duration",
            "90s",
            "--warmup",
            "1s",
        ])
        .unwrap();
        assert_eq!(cli.global.duration, Duration::from_secs(90));
        assert_eq!(cli.global.warmup, Duration::from_secs(1));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["surge", "http", "--definitely-not-a-flag"]).is_err());
    }
}
