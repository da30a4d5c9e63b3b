//! CQL (Cassandra/Scylla) adapter.
//!
//! All workers hitting the same target set share one session through the
//! connection share. Hostnames are resolved to IPs before the session is
//! built: handing DNS names to the driver tends to produce imbalanced
//! connection pools. Optionally every query also emits a second record
//! keyed by the coordinator node, taken from the statement history.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use scylla::history::HistoryCollector;
use scylla::load_balancing::DefaultPolicy;
use scylla::query::Query;
use scylla::statement::Consistency;
use scylla::transport::session::PoolSize;
use scylla::transport::{Compression, ExecutionProfile};
use scylla::{Session, SessionBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::share::{ClientShare, ShareHandle};
use crate::stats::{TraceKind, TraceRecord};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct CqlOptions {
    /// `host:port` seeds; hostnames are resolved to every A/AAAA record.
    #[builder(default)]
    pub targets: Vec<String>,
    #[builder(default = "SELECT uuid() FROM system.local".into(), setter(into))]
    pub query: String,
    #[builder(default, setter(into))]
    pub keyspace: String,
    /// ANY ONE TWO THREE QUORUM ALL LOCAL_QUORUM EACH_QUORUM LOCAL_ONE
    #[builder(default = "LOCAL_QUORUM".into(), setter(into))]
    pub consistency: String,
    #[builder(default, setter(into))]
    pub username: String,
    #[builder(default, setter(into))]
    pub password: String,
    #[builder(default = true)]
    pub plaintext: bool,
    #[builder(default)]
    pub insecure: bool,
    #[builder(default, setter(into))]
    pub ca_cert: String,
    #[serde(default, with = "humantime_serde")]
    #[builder(default)]
    pub connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    #[builder(default)]
    pub request_timeout: Option<Duration>,
    #[builder(default)]
    pub num_conns_per_host: usize,
    #[builder(default)]
    pub enable_compression: bool,
    /// RoundRobin, DCAwareRoundRobin, TokenAwareWithRoundRobinFallback,
    /// TokenAwareWithDCAwareRoundRobinFallback.
    #[builder(default = "RoundRobin".into(), setter(into))]
    pub host_selection_policy: String,
    #[builder(default, setter(into))]
    pub dc_name: String,
    #[builder(default)]
    pub track_metrics_per_node: bool,
}

impl Default for CqlOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct CqlGenerator {
    context: WorkerContext,
    options: CqlOptions,
    share: Arc<ClientShare<Arc<Session>>>,
    session: Option<ShareHandle<Arc<Session>>>,
    host_key: String,
}

impl CqlGenerator {
    pub fn new(
        context: WorkerContext,
        options: CqlOptions,
        share: Arc<ClientShare<Arc<Session>>>,
    ) -> Self {
        let host_key = options.targets.join("+");
        Self {
            context,
            options,
            share,
            session: None,
            host_key,
        }
    }

    async fn build_session(options: &CqlOptions) -> anyhow::Result<Arc<Session>> {
        anyhow::ensure!(!options.targets.is_empty(), "target cassandra server was not given");

        let nodes = resolve_targets(&options.targets).await?;
        tracing::info!("resolved targets: {nodes:?} from: {:?}", options.targets);

        let connect_timeout = options.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let request_timeout = options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let mut policy = DefaultPolicy::builder();
        match options.host_selection_policy.as_str() {
            "RoundRobin" => {
                policy = policy.token_aware(false);
            }
            "DCAwareRoundRobin" => {
                anyhow::ensure!(
                    !options.dc_name.is_empty(),
                    "DCAwareRoundRobin policy needs a datacenter name"
                );
                policy = policy.token_aware(false).prefer_datacenter(options.dc_name.clone());
            }
            "TokenAwareWithRoundRobinFallback" => {
                policy = policy.token_aware(true);
            }
            "TokenAwareWithDCAwareRoundRobinFallback" => {
                anyhow::ensure!(
                    !options.dc_name.is_empty(),
                    "TokenAwareWithDCAwareRoundRobinFallback policy needs a datacenter name"
                );
                policy = policy.token_aware(true).prefer_datacenter(options.dc_name.clone());
            }
            other => anyhow::bail!("unknown host selection policy: {other}"),
        }

        let profile = ExecutionProfile::builder()
            .consistency(parse_consistency(&options.consistency)?)
            .load_balancing_policy(policy.build())
            .request_timeout(Some(request_timeout))
            .build();

        let mut builder = SessionBuilder::new()
            .known_nodes(&nodes)
            .connection_timeout(connect_timeout)
            .default_execution_profile_handle(profile.into_handle());

        if !options.username.is_empty() {
            builder = builder.user(options.username.clone(), options.password.clone());
        }
        if !options.keyspace.is_empty() {
            builder = builder.use_keyspace(options.keyspace.clone(), false);
        }
        if options.enable_compression {
            builder = builder.compression(Some(Compression::Snappy));
        }
        if options.num_conns_per_host != 0 {
            let size = std::num::NonZeroUsize::new(options.num_conns_per_host)
                .context("num_conns_per_host must be positive")?;
            builder = builder.pool_size(PoolSize::PerHost(size));
        }
        if !options.plaintext {
            builder = builder.ssl_context(Some(ssl_context(options)?));
        }

        let session = builder.build().await.context("cannot create cql session")?;
        Ok(Arc::new(session))
    }
}

fn ssl_context(options: &CqlOptions) -> anyhow::Result<openssl::ssl::SslContext> {
    use openssl::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};

    let mut builder = SslContextBuilder::new(SslMethod::tls())?;
    if !options.ca_cert.is_empty() {
        builder
            .set_ca_file(&options.ca_cert)
            .with_context(|| format!("cannot load {}", options.ca_cert))?;
    }
    builder.set_verify(if options.insecure {
        SslVerifyMode::NONE
    } else {
        SslVerifyMode::PEER
    });
    Ok(builder.build())
}

fn parse_consistency(name: &str) -> anyhow::Result<Consistency> {
    Ok(match name.to_uppercase().as_str() {
        "ANY" => Consistency::Any,
        "ONE" => Consistency::One,
        "TWO" => Consistency::Two,
        "THREE" => Consistency::Three,
        "QUORUM" => Consistency::Quorum,
        "ALL" => Consistency::All,
        "LOCAL_QUORUM" => Consistency::LocalQuorum,
        "EACH_QUORUM" => Consistency::EachQuorum,
        "LOCAL_ONE" => Consistency::LocalOne,
        other => anyhow::bail!("unknown consistency level: {other}"),
    })
}

/// Expand every `host:port` seed into `ip:port` entries, one per resolved
/// address. Literal IPs pass through untouched.
async fn resolve_targets(targets: &[String]) -> anyhow::Result<Vec<String>> {
    let mut resolved = Vec::new();
    for target in targets {
        let (host, port) = target
            .rsplit_once(':')
            .with_context(|| format!("target {target} seems to be malformed, want host:port"))?;
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        if bare_host.parse::<IpAddr>().is_ok() {
            resolved.push(target.clone());
            continue;
        }
        let addrs: Vec<_> = tokio::net::lookup_host((host, port.parse::<u16>()?))
            .await
            .with_context(|| format!("unable to resolve {host}"))?
            .collect();
        anyhow::ensure!(!addrs.is_empty(), "unable to resolve {host}");
        for addr in addrs {
            resolved.push(format!("{}:{}", addr.ip(), addr.port()));
        }
    }
    Ok(resolved)
}

#[async_trait]
impl Generator for CqlGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        let options = self.options.clone();
        let (session, dialed) = self
            .share
            .get(&self.host_key, usize::MAX, || Self::build_session(&options))
            .await?;
        if dialed {
            tracing::debug!("created cql session for {}", self.host_key);
        }
        self.session = Some(session);
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let session = self
            .session
            .as_ref()
            .context("cql generator not initialized")?;

        let mut query = Query::new(self.options.query.clone());
        let history = self.options.track_metrics_per_node.then(|| {
            let collector = Arc::new(HistoryCollector::new());
            query.set_history_listener(collector.clone());
            collector
        });

        let mut record = TraceRecord::new(
            TraceKind::Cql,
            self.host_key.clone(),
            self.options.query.clone(),
        );
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.context.cancel.cancelled() => return Ok(()),
            result = session.query(query, ()) => result,
        };

        match result {
            Ok(_rows) => record.duration = start.elapsed(),
            Err(err) => {
                record.error = true;
                tracing::error!("cql error: {err}");
            }
        }

        if let Some(collector) = history {
            let structured = collector.clone_structured_history();
            let node = structured
                .queries
                .last()
                .and_then(|q| q.non_speculative_fiber.attempts.last())
                .map(|attempt| attempt.node_addr);
            if let Some(addr) = node {
                let mut per_node = record.clone();
                per_node.target = addr.to_string();
                self.context.stats.record(per_node).await;
            }
        }

        self.context.stats.record(record).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistency_names_parse() {
        assert!(matches!(
            parse_consistency("local_quorum").unwrap(),
            Consistency::LocalQuorum
        ));
        assert!(parse_consistency("SOMETIMES").is_err());
    }

    #[tokio::test]
    async fn literal_ips_skip_resolution() {
        let resolved = resolve_targets(&["10.0.0.1:9042".into(), "[::1]:9042".into()])
            .await
            .unwrap();
        assert_eq!(resolved[0], "10.0.0.1:9042");
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback() {
        let resolved = resolve_targets(&["localhost:9042".into()]).await.unwrap();
        assert!(resolved.iter().all(|t| t.ends_with(":9042")));
        assert!(resolved.iter().any(|t| t.contains("127.0.0.1") || t.contains("::1")));
    }

    #[test]
    fn malformed_targets_are_rejected() {
        let err = futures::executor::block_on(resolve_targets(&["no-port".into()]));
        assert!(err.is_err());
    }
}
