//! SMTP adapter: MAIL → RCPT → DATA per tick, reusing the transport's
//! pooled connection unless reuse is disabled (then every tick dials).
//! STARTTLS is the default; `plaintext` opts out.

use anyhow::Context as _;
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Certificate, Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::stats::{TraceKind, TraceRecord};

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct SmtpOptions {
    /// `host:port` of the server.
    #[builder(default = "127.0.0.1:25".into(), setter(into))]
    pub target: String,
    #[builder(default, setter(into))]
    pub username: String,
    #[builder(default, setter(into))]
    pub password: String,
    #[builder(default, setter(into))]
    pub from: String,
    #[builder(default, setter(into))]
    pub to: String,
    #[builder(default, setter(into))]
    pub subject: String,
    #[builder(default = "hello".into(), setter(into))]
    pub data: String,
    #[builder(default)]
    pub plaintext: bool,
    #[builder(default)]
    pub insecure: bool,
    #[builder(default, setter(into))]
    pub tls_server_name: String,
    #[builder(default)]
    pub root_cas: Vec<String>,
    #[builder(default)]
    pub disable_connection_reuse: bool,
}

impl Default for SmtpOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct SmtpGenerator {
    context: WorkerContext,
    options: SmtpOptions,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    message: Option<Message>,
}

impl SmtpGenerator {
    pub fn new(context: WorkerContext, options: SmtpOptions) -> Self {
        Self {
            context,
            options,
            transport: None,
            message: None,
        }
    }

    fn build_transport(&self) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
        let (host, port) = match self.options.target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().context("invalid port")?),
            None => (self.options.target.clone(), 25),
        };

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host).port(port);

        if self.options.plaintext {
            builder = builder.tls(Tls::None);
        } else {
            let domain = if self.options.tls_server_name.is_empty() {
                host.clone()
            } else {
                self.options.tls_server_name.clone()
            };
            let mut tls = TlsParameters::builder(domain)
                .dangerous_accept_invalid_certs(self.options.insecure);
            for path in &self.options.root_cas {
                let pem =
                    std::fs::read(path).with_context(|| format!("cannot read {path}"))?;
                tls = tls.add_root_certificate(Certificate::from_pem(&pem)?);
            }
            builder = builder.tls(Tls::Required(tls.build()?));
        }

        if !self.options.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(
                    self.options.username.clone(),
                    self.options.password.clone(),
                ))
                .authentication(vec![Mechanism::Plain]);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Generator for SmtpGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        let from: Mailbox = self
            .options
            .from
            .parse()
            .with_context(|| format!("invalid sender address: {}", self.options.from))?;
        let to: Mailbox = self
            .options
            .to
            .parse()
            .with_context(|| format!("invalid recipient address: {}", self.options.to))?;
        self.message = Some(
            Message::builder()
                .from(from)
                .to(to)
                .subject(self.options.subject.clone())
                .body(self.options.data.clone())?,
        );

        let transport = self.build_transport()?;
        transport
            .test_connection()
            .await
            .with_context(|| format!("cannot connect to {}", self.options.target))?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let message = self
            .message
            .as_ref()
            .context("smtp generator not initialized")?
            .clone();

        // A fresh transport per tick when reuse is off, so every send pays
        // for its own connection.
        let transport = if self.options.disable_connection_reuse {
            self.build_transport()?
        } else {
            self.transport
                .as_ref()
                .context("smtp generator not initialized")?
                .clone()
        };

        let mut record = TraceRecord::new(
            TraceKind::Smtp,
            self.options.target.clone(),
            self.options.target.clone(),
        );
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.context.cancel.cancelled() => return Ok(()),
            result = transport.send(message) => result,
        };

        match result {
            Ok(_response) => record.duration = start.elapsed(),
            Err(err) => {
                record.error = true;
                tracing::error!("smtp error: {err}");
            }
        }
        self.context.stats.record(record).await;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.transport.take();
        Ok(())
    }
}
