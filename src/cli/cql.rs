use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::cql::{CqlGenerator, CqlOptions};
use crate::share::ClientShare;

/// Cassandra load generator over the CQL native protocol
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge cql --requestrate 1 --username foo --password 1234 --plaintext \\
      --query 'select * from mykeyspace.mytable where id=1234' localhost:9042")]
pub struct CqlArgs {
    /// Seed nodes (host:port), load spreads over every discovered node
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Query to execute
    #[arg(long, default_value = "SELECT uuid() FROM system.local")]
    pub query: String,

    /// Keyspace to operate on
    #[arg(long, default_value = "")]
    pub keyspace: String,

    /// Consistency level: ANY ONE TWO THREE QUORUM ALL LOCAL_QUORUM
    /// EACH_QUORUM LOCAL_ONE
    #[arg(long, default_value = "LOCAL_QUORUM")]
    pub consistency: String,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, default_value = "")]
    pub password: String,

    /// Use plaintext transport
    #[arg(long)]
    pub plaintext: bool,

    /// Allow invalid certificates when using TLS
    #[arg(long)]
    pub insecure: bool,

    /// File containing a trusted root certificate for verifying the server
    #[arg(long, default_value = "")]
    pub cacert: String,

    /// Connection timeout
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Per-request timeout
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub request_timeout: Duration,

    /// How many connections to establish to each host
    #[arg(long, default_value_t = 2)]
    pub num_conns_per_host: usize,

    /// Enable frame compression
    #[arg(long)]
    pub enable_compression: bool,

    /// Host selection policy: RoundRobin DCAwareRoundRobin
    /// TokenAwareWithRoundRobinFallback TokenAwareWithDCAwareRoundRobinFallback
    #[arg(long, default_value = "RoundRobin")]
    pub host_selection_policy: String,

    /// Datacenter name, needed by the DC-aware policies
    #[arg(long, default_value = "")]
    pub dc_name: String,

    /// Track overall metrics as well as per node
    #[arg(long)]
    pub track_metrics_per_node: bool,
}

impl CqlArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let options = CqlOptions::builder()
            .targets(self.targets.clone())
            .query(self.query.clone())
            .keyspace(self.keyspace.clone())
            .consistency(self.consistency.clone())
            .username(self.username.clone())
            .password(self.password.clone())
            .plaintext(self.plaintext)
            .insecure(self.insecure)
            .ca_cert(self.cacert.clone())
            .connect_timeout(Some(self.connect_timeout))
            .request_timeout(Some(self.request_timeout))
            .num_conns_per_host(self.num_conns_per_host)
            .enable_compression(self.enable_compression)
            .host_selection_policy(self.host_selection_policy.clone())
            .dc_name(self.dc_name.clone())
            .track_metrics_per_node(self.track_metrics_per_node)
            .build();

        let share = Arc::new(ClientShare::new());
        Ok(Arc::new(move |context| {
            Box::new(CqlGenerator::new(context, options.clone(), share.clone()))
                as Box<dyn Generator>
        }))
    }
}
