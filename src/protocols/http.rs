//! HTTP adapter.
//!
//! One tick is one request → response → body drain, timed end to end so the
//! measurement includes connection setup when the pool has to dial. The
//! subtarget is the request path, optionally rewritten by aggregation rules
//! so parameterized routes share one bucket.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::stats::{TraceKind, TraceRecord};

/// Path aggregation rule: `pattern` is a regex matched against the request
/// path, `replacement` may use capture groups. `method` restricts the rule
/// to one HTTP method; `"any"` applies when no method-specific rule matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRule {
    pub method: String,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct HttpOptions {
    #[builder(default, setter(into))]
    pub url: String,
    #[builder(default = "GET".into(), setter(into))]
    pub method: String,
    #[builder(default, setter(into))]
    pub data: String,
    #[builder(default)]
    pub headers: HashMap<String, String>,
    #[builder(default = true)]
    pub keep_alive: bool,
    #[builder(default)]
    pub insecure: bool,
    #[builder(default)]
    pub aggregate_paths: Vec<AggregateRule>,
    #[builder(default, setter(into))]
    pub tls_server_name: String,
    #[builder(default)]
    pub root_cas: Vec<String>,
    #[builder(default)]
    pub disable_compression: bool,
    #[builder(default)]
    pub disable_cookie_jar: bool,
    #[builder(default)]
    pub discard_response: bool,
    #[builder(default)]
    pub aws_sign: bool,
    #[builder(default, setter(into))]
    pub aws_region: String,
    #[builder(default, setter(into))]
    pub aws_service: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct CompiledRule {
    method: String,
    regex: Regex,
    replacement: String,
}

pub struct HttpGenerator {
    context: WorkerContext,
    options: HttpOptions,
    /// Extra per-instance headers; scripts mutate these between ticks.
    pub headers: HashMap<String, String>,
    client: Option<Client>,
    url: Option<Url>,
    target: String,
    rules: Vec<CompiledRule>,
}

impl HttpGenerator {
    pub fn new(context: WorkerContext, options: HttpOptions) -> Self {
        Self {
            context,
            options,
            headers: HashMap::new(),
            client: None,
            url: None,
            target: String::new(),
            rules: Vec::new(),
        }
    }

    async fn build_client(&self, url: &Url) -> anyhow::Result<(Client, Url)> {
        let tls = crate::tls::client_config(self.options.insecure, &self.options.root_cas)?;

        let mut builder = Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .cookie_store(!self.options.disable_cookie_jar)
            .user_agent(concat!("surge/", env!("CARGO_PKG_VERSION")));

        builder = if self.options.keep_alive {
            let per_host = (self.context.requestrate as usize).saturating_mul(2).max(2);
            builder.pool_max_idle_per_host(per_host)
        } else {
            builder.pool_max_idle_per_host(0)
        };

        if self.options.disable_compression {
            builder = builder.no_gzip();
        }

        // SNI/certificate-name override: address the request to the override
        // name while still dialing the configured host.
        let mut url = url.clone();
        let server_name = self.options.tls_server_name.trim();
        if !server_name.is_empty() {
            let host = url.host_str().context("url has no host")?.to_string();
            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<_> = tokio::net::lookup_host((host.as_str(), port))
                .await
                .with_context(|| format!("cannot resolve {host}"))?
                .collect();
            builder = builder.resolve_to_addrs(server_name, &addrs);
            url.set_host(Some(server_name))
                .context("invalid tls server name")?;
        }

        Ok((builder.build()?, url))
    }

    /// Issue one request and record its trace. Returns `None` when the run
    /// was canceled mid-flight; cancellation records nothing.
    pub async fn request(
        &mut self,
        method: &str,
        url: &str,
        extra_headers: Option<&HashMap<String, String>>,
        body: String,
    ) -> anyhow::Result<Option<(u16, Bytes)>> {
        let url: Url = url.parse().context("invalid url")?;
        let method = Method::from_bytes(method.as_bytes()).context("invalid method")?;
        let client = self.client.as_ref().context("http generator not initialized")?;

        let path = url.path().to_string();
        let target = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}://{host}:{port}", url.scheme()),
            (Some(host), None) => format!("{}://{host}", url.scheme()),
            _ => self.target.clone(),
        };
        let mut builder = client.request(method.clone(), url);
        for (name, value) in &self.options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(extra) = extra_headers {
            for (name, value) in extra {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let mut request = builder.body(body.clone()).build()?;
        if (method == Method::POST || method == Method::PUT)
            && !request.headers().contains_key(CONTENT_TYPE)
        {
            request.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }

        if self.options.aws_sign {
            self.sign(&mut request, &body)?;
        }

        let mut record = TraceRecord::new(TraceKind::Http, target, path.clone());
        let start = Instant::now();

        let response = tokio::select! {
            _ = self.context.cancel.cancelled() => return Ok(None),
            response = client.execute(request) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                if self.context.cancel.is_cancelled() {
                    return Ok(None);
                }
                record.error = true;
                self.context.stats.record(record).await;
                return Err(err.into());
            }
        };

        let status = response.status();
        let body = if self.options.discard_response {
            let mut response = response;
            loop {
                match response.chunk().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!("failed to read the response body: {err}");
                        break;
                    }
                }
            }
            Bytes::new()
        } else {
            match response.bytes().await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!("failed to read the response body: {err}");
                    Bytes::new()
                }
            }
        };

        // End time only after the body is fully drained.
        record.duration = start.elapsed();
        record.status = Some(status.as_u16());
        record.subtarget = self.aggregate_subtarget(method.as_str(), &path);
        self.context.stats.record(record).await;

        Ok(Some((status.as_u16(), body)))
    }

    fn aggregate_subtarget(&self, method: &str, path: &str) -> String {
        for rule in self
            .rules
            .iter()
            .filter(|rule| rule.method.eq_ignore_ascii_case(method))
        {
            if rule.regex.is_match(path) {
                return rule.regex.replace(path, rule.replacement.as_str()).into_owned();
            }
        }
        for rule in self.rules.iter().filter(|rule| rule.method == "any") {
            if rule.regex.is_match(path) {
                return rule.regex.replace(path, rule.replacement.as_str()).into_owned();
            }
        }
        path.to_string()
    }

    fn sign(&self, request: &mut reqwest::Request, body: &str) -> anyhow::Result<()> {
        use aws_credential_types::Credentials;
        use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
        use aws_sigv4::sign::v4;

        let access_key =
            std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID is not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY is not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();
        let identity =
            Credentials::new(access_key, secret_key, session_token, None, "environment").into();

        let signing_params: aws_sigv4::http_request::SigningParams = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.options.aws_region)
            .name(&self.options.aws_service)
            .time(std::time::SystemTime::now())
            .settings(SigningSettings::default())
            .build()?
            .into();

        let signable = SignableRequest::new(
            request.method().as_str(),
            request.url().as_str(),
            request
                .headers()
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
            SignableBody::Bytes(body.as_bytes()),
        )?;

        let (instructions, _signature) = sign(signable, &signing_params)?.into_parts();
        for (name, value) in instructions.headers() {
            request.headers_mut().insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes())
                    .context("invalid signed header name")?,
                reqwest::header::HeaderValue::from_str(value)
                    .context("invalid signed header value")?,
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        let mut url: Url = self.options.url.parse().context("invalid url")?;
        if url.path().is_empty() {
            url.set_path("/");
        }
        self.target = format!(
            "{}://{}",
            url.scheme(),
            match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                _ => anyhow::bail!("url has no host: {url}"),
            }
        );

        self.rules = self
            .options
            .aggregate_paths
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    method: rule.method.clone(),
                    regex: Regex::new(&rule.pattern)
                        .with_context(|| format!("invalid aggregate pattern {}", rule.pattern))?,
                    replacement: rule.replacement.clone(),
                })
            })
            .collect::<anyhow::Result<_>>()?;

        let (client, url) = self.build_client(&url).await?;
        self.client = Some(client);
        self.url = Some(url);
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let method = self.options.method.clone();
        let url = self
            .url
            .as_ref()
            .context("http generator not initialized")?
            .to_string();
        let data = self.options.data.clone();

        if let Err(err) = self.request(&method, &url, None, data).await {
            tracing::error!("http error: {err:#}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use axum::routing::get;
    use axum::Router;
    use std::net::SocketAddr;
    use tokio_util::sync::CancellationToken;

    fn context(stats: Stats, requestrate: u64) -> WorkerContext {
        WorkerContext {
            id: 1,
            requestrate,
            concurrency: 1,
            cancel: CancellationToken::new(),
            stats,
        }
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn aggregation_rewrites_first_match_with_any_fallback() {
        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let options = HttpOptions::builder()
            .url("http://127.0.0.1:1/")
            .aggregate_paths(vec![
                AggregateRule {
                    method: "GET".into(),
                    pattern: "^/api/users/[0-9]+$".into(),
                    replacement: "/api/user".into(),
                },
                AggregateRule {
                    method: "any".into(),
                    pattern: "^/api/tickets/[0-9]+$".into(),
                    replacement: "/api/ticket".into(),
                },
            ])
            .build();
        let mut generator = HttpGenerator::new(context(stats, 1), options);
        generator.init().await.unwrap();

        assert_eq!(
            generator.aggregate_subtarget("GET", "/api/users/42"),
            "/api/user"
        );
        assert_eq!(
            generator.aggregate_subtarget("POST", "/api/tickets/7"),
            "/api/ticket"
        );
        assert_eq!(generator.aggregate_subtarget("GET", "/other"), "/other");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn basic_run_records_latency_and_status() {
        let router = Router::new().route(
            "/hello",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                "Hello"
            }),
        );
        let addr = serve(router).await;

        let (stats, _handle) = Stats::spawn("t", 10, 1, Duration::from_secs(2), false);
        let options = HttpOptions::builder()
            .url(format!("http://{addr}/hello"))
            .discard_response(true)
            .build();
        let mut generator = HttpGenerator::new(context(stats.clone(), 10), options);
        generator.init().await.unwrap();

        for _ in 0..20 {
            generator.tick().await.unwrap();
        }

        let report = stats.export().await.unwrap();
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.target, format!("http://{addr}"));
        assert_eq!(result.subtarget, "/hello");
        assert_eq!(result.histogram.count, 20);
        assert_eq!(result.status_2xx, Some(20));
        assert_eq!(result.errors, Some(0));
        assert!(result.histogram.avg >= 10.0, "avg {}", result.histogram.avg);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aggregated_paths_share_one_bucket() {
        let router = Router::new().route("/api/tickets/:id", get(|| async { "ok" }));
        let addr = serve(router).await;

        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let options = HttpOptions::builder()
            .url(format!("http://{addr}/api/tickets/1"))
            .discard_response(true)
            .aggregate_paths(vec![AggregateRule {
                method: "any".into(),
                pattern: "^/api/tickets/[0-9]+$".into(),
                replacement: "/api/ticket".into(),
            }])
            .build();
        let mut generator = HttpGenerator::new(context(stats.clone(), 1), options);
        generator.init().await.unwrap();

        for id in [1, 2] {
            let url = format!("http://{addr}/api/tickets/{id}");
            generator
                .request("GET", &url, None, String::new())
                .await
                .unwrap();
        }

        let report = stats.export().await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].subtarget, "/api/ticket");
        assert_eq!(report.results[0].histogram.count, 2);
    }

    #[tokio::test]
    async fn connection_errors_count_as_errors() {
        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        // Nothing listens on this port.
        let options = HttpOptions::builder()
            .url("http://127.0.0.1:9/")
            .build();
        let mut generator = HttpGenerator::new(context(stats.clone(), 1), options);
        generator.init().await.unwrap();

        generator.tick().await.unwrap();

        let report = stats.export().await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].errors, Some(1));
        assert_eq!(report.results[0].histogram.count, 0);
    }
}
