use std::sync::Arc;

use anyhow::Context as _;
use clap::Args;
use url::Url;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::http::{AggregateRule, HttpGenerator, HttpOptions};

/// HTTP load generator
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge http https://example.com/some/path
  surge http --requestrate 10 http://example.com/some/path")]
pub struct HttpArgs {
    /// Target URL
    pub target: String,

    /// HTTP method
    #[arg(long, default_value = "GET")]
    pub method: String,

    /// Body of the request
    #[arg(long, default_value = "")]
    pub data: String,

    /// Add a custom header to the request (Name: value)
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// Disable HTTP keep-alive
    #[arg(long)]
    pub no_keepalive: bool,

    /// Allow invalid certificates when using TLS
    #[arg(long)]
    pub insecure: bool,

    /// Bucket matching paths together: 'pattern|replacement' or
    /// 'pattern|replacement|method'
    #[arg(long = "aggregate-path")]
    pub aggregate_paths: Vec<String>,

    /// Servername to use while validating the server certificate
    #[arg(long)]
    pub tls_server_name: Option<String>,

    /// Root CAs to add to the client trust store
    #[arg(long = "rootca")]
    pub root_cas: Vec<String>,

    /// Disable response compression
    #[arg(long)]
    pub disable_compression: bool,

    /// Disable the cookie jar
    #[arg(long)]
    pub disable_cookie_jar: bool,

    /// Sign requests with AWS Signature V4 (credentials from environment)
    #[arg(long)]
    pub aws_sign: bool,

    /// AWS region used for signing
    #[arg(long, default_value = "us-east-1")]
    pub aws_region: String,

    /// AWS service name used for signing
    #[arg(long, default_value = "execute-api")]
    pub aws_service: String,
}

impl HttpArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let url = Url::parse(&self.target)
            .with_context(|| format!("invalid url: {}", self.target))?;
        anyhow::ensure!(
            matches!(url.scheme(), "http" | "https"),
            "invalid url scheme: {} ({})",
            url.scheme(),
            self.target
        );

        let mut rules = Vec::new();
        for raw in &self.aggregate_paths {
            let parts: Vec<&str> = raw.split('|').collect();
            anyhow::ensure!(
                (2..=3).contains(&parts.len()),
                "aggregate path needs 'pattern|replacement' with an optional '|method': {raw}"
            );
            rules.push(AggregateRule {
                pattern: parts[0].to_string(),
                replacement: parts[1].to_string(),
                method: parts.get(2).unwrap_or(&"any").to_string(),
            });
        }

        let options = HttpOptions::builder()
            .url(url.to_string())
            .method(self.method.clone())
            .data(self.data.clone())
            .headers(super::parse_header_pairs(&self.headers))
            .keep_alive(!self.no_keepalive)
            .insecure(self.insecure)
            .aggregate_paths(rules)
            .tls_server_name(self.tls_server_name.clone().unwrap_or_default())
            .root_cas(self.root_cas.clone())
            .disable_compression(self.disable_compression)
            .disable_cookie_jar(self.disable_cookie_jar)
            .discard_response(true)
            .aws_sign(self.aws_sign)
            .aws_region(self.aws_region.clone())
            .aws_service(self.aws_service.clone())
            .build();

        Ok(Arc::new(move |context| {
            Box::new(HttpGenerator::new(context, options.clone())) as Box<dyn Generator>
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: HttpArgs,
    }

    #[test]
    fn rejects_non_http_schemes() {
        let harness = Harness::try_parse_from(["t", "ftp://example.com/"]).unwrap();
        assert!(harness.args.factory().is_err());
    }

    #[test]
    fn aggregate_rule_defaults_to_any_method() {
        let harness = Harness::try_parse_from([
            "t",
            "http://example.com/",
            "--aggregate-path",
            "^/api/tickets/[0-9]+$|/api/ticket",
            "--aggregate-path",
            "^/api/users/[0-9]+$|/api/user|GET",
        ])
        .unwrap();
        assert!(harness.args.factory().is_ok());
    }

    #[test]
    fn malformed_aggregate_rule_fails() {
        let harness = Harness::try_parse_from([
            "t",
            "http://example.com/",
            "--aggregate-path",
            "only-a-pattern",
        ])
        .unwrap();
        assert!(harness.args.factory().is_err());
    }
}
