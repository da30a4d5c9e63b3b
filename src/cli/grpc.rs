use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::grpc::{GrpcGenerator, GrpcOptions};
use crate::share::ClientShare;

/// gRPC load generator
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge grpc --method 'helloworld.Greeter.SayHello' --data \"$(base64 req.bin)\" \\
      --plaintext example.com:50051")]
pub struct GrpcArgs {
    /// Target server address (host:port)
    pub target: String,

    /// Fully-qualified gRPC method
    #[arg(long)]
    pub method: String,

    /// Request payload: base64-encoded protobuf, or @file for raw bytes
    #[arg(long, default_value = "")]
    pub data: String,

    /// Add custom metadata to the request (name: value)
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// :authority header in the underlying http2 request
    #[arg(long, default_value = "")]
    pub authority: String,

    /// Per-call deadline (0 disables)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub deadline: Option<Duration>,

    /// How many streams to concurrently share one http2 connection
    #[arg(long, default_value_t = 1)]
    pub max_concurrent_streams: usize,

    /// Use plaintext transport
    #[arg(long)]
    pub plaintext: bool,

    /// File containing a trusted root certificate for verifying the server
    #[arg(long, default_value = "")]
    pub cacert: String,

    /// Servername to use while validating the server certificate
    #[arg(long, default_value = "")]
    pub tls_servername: String,
}

impl GrpcArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        anyhow::ensure!(!self.target.is_empty(), "target server address was not given");
        anyhow::ensure!(!self.method.is_empty(), "mandatory \"method\" argument was not given");

        let options = GrpcOptions::builder()
            .target(self.target.clone())
            .method(self.method.clone())
            .data(self.data.clone())
            .headers(self.headers.clone())
            .authority(self.authority.clone())
            .deadline(self.deadline)
            .max_concurrent_streams(self.max_concurrent_streams)
            .plaintext(self.plaintext)
            .ca_cert(self.cacert.clone())
            .tls_server_name(self.tls_servername.clone())
            .build();

        let share = Arc::new(ClientShare::new());
        Ok(Arc::new(move |context| {
            Box::new(GrpcGenerator::new(context, options.clone(), share.clone()))
                as Box<dyn Generator>
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
        args: GrpcArgs,
    }

    #[test]
    fn method_is_mandatory() {
        assert!(Harness::try_parse_from(["t", "127.0.0.1:50051"]).is_err());
    }

    #[test]
    fn deadline_parses_humantime() {
        let harness = Harness::try_parse_from([
            "t",
            "127.0.0.1:50051",
            "--method",
            "a.B/C",
            "--deadline",
            "10ms",
        ])
        .unwrap();
        assert_eq!(harness.args.deadline, Some(Duration::from_millis(10)));
        assert!(harness.args.factory().is_ok());
    }
}
