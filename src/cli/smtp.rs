use std::sync::Arc;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::smtp::{SmtpGenerator, SmtpOptions};

/// SMTP load generator
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge smtp --from me@example.com --to you@example.com --requestrate 10 \\
      127.0.0.1:25")]
pub struct SmtpArgs {
    /// Target server (host:port)
    pub target: String,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, default_value = "")]
    pub password: String,

    /// Mail sender address
    #[arg(long)]
    pub from: String,

    /// Mail recipient address
    #[arg(long)]
    pub to: String,

    /// Mail subject
    #[arg(long, default_value = "")]
    pub subject: String,

    /// Mail body
    #[arg(long, default_value = "hello")]
    pub data: String,

    /// Skip STARTTLS
    #[arg(long)]
    pub plaintext: bool,

    /// Allow invalid certificates when using TLS
    #[arg(long)]
    pub insecure: bool,

    /// TLS server name to send in the ClientHello SNI extension
    #[arg(long, default_value = "")]
    pub tls_server_name: String,

    /// Root CAs to add to the client trust store
    #[arg(long = "rootca")]
    pub root_cas: Vec<String>,

    /// Dial a fresh connection for every message
    #[arg(long)]
    pub disable_connection_reuse: bool,
}

impl SmtpArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let options = SmtpOptions::builder()
            .target(self.target.clone())
            .username(self.username.clone())
            .password(self.password.clone())
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.subject.clone())
            .data(self.data.clone())
            .plaintext(self.plaintext)
            .insecure(self.insecure)
            .tls_server_name(self.tls_server_name.clone())
            .root_cas(self.root_cas.clone())
            .disable_connection_reuse(self.disable_connection_reuse)
            .build();
        Ok(Arc::new(move |context| {
            Box::new(SmtpGenerator::new(context, options.clone())) as Box<dyn Generator>
        }))
    }
}
