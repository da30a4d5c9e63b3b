//! Kafka adapter.
//!
//! Produce mode fires one message per tick with no acks. Read mode polls
//! the consumer with a 50 ms deadline and always records success: the
//! measured unit is the attempt, not whether a message happened to be
//! waiting. SCRAM authentication and TLS map straight onto librdkafka
//! config keys.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::Message;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::stats::{TraceKind, TraceRecord};

/// Per-operation deadline; reads must never block a worker.
const OP_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct KafkaOptions {
    #[builder(default = vec!["localhost:9092".into()])]
    pub brokers: Vec<String>,
    #[builder(default = "test-topic".into(), setter(into))]
    pub topic: String,
    #[builder(default = "hello".into(), setter(into))]
    pub message_value: String,
    #[builder(default, setter(into))]
    pub message_key: String,
    #[builder(default, setter(into))]
    pub group_id: String,
    #[builder(default)]
    pub read_messages: bool,
    #[builder(default, setter(into))]
    pub username: String,
    #[builder(default, setter(into))]
    pub password: String,
    /// SCRAM-SHA-256 or SCRAM-SHA-512.
    #[builder(default, setter(into))]
    pub sasl_mechanism: String,
    #[builder(default)]
    pub use_tls: bool,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct KafkaGenerator {
    context: WorkerContext,
    options: KafkaOptions,
    producer: Option<FutureProducer>,
    consumer: Option<StreamConsumer>,
    target: String,
    subtarget: String,
}

impl KafkaGenerator {
    pub fn new(context: WorkerContext, options: KafkaOptions) -> Self {
        let target = options.brokers.join(",");
        let subtarget = if options.read_messages {
            format!("read:{}", options.topic)
        } else {
            format!("write:{}", options.topic)
        };
        Self {
            context,
            options,
            producer: None,
            consumer: None,
            target,
            subtarget,
        }
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", self.target.clone());
        config.set("allow.auto.create.topics", "true");

        let has_credentials = !self.options.username.is_empty()
            && !self.options.password.is_empty()
            && !self.options.sasl_mechanism.is_empty();
        if has_credentials {
            let mechanism = match self.options.sasl_mechanism.as_str() {
                "SCRAM-SHA-256" | "SCRAM-SHA-512" => self.options.sasl_mechanism.clone(),
                other => {
                    tracing::warn!(
                        "unsupported SASL mechanism {other}, defaulting to SCRAM-SHA-512"
                    );
                    "SCRAM-SHA-512".into()
                }
            };
            config.set("sasl.mechanism", mechanism);
            config.set("sasl.username", self.options.username.clone());
            config.set("sasl.password", self.options.password.clone());
            config.set(
                "security.protocol",
                if self.options.use_tls {
                    "sasl_ssl"
                } else {
                    "sasl_plaintext"
                },
            );
            tracing::info!(
                "using SASL authentication with mechanism {}",
                self.options.sasl_mechanism
            );
        } else if self.options.use_tls {
            config.set("security.protocol", "ssl");
        }

        config
    }
}

#[async_trait]
impl Generator for KafkaGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        if self.options.read_messages {
            let mut config = self.client_config();
            let group = if self.options.group_id.is_empty() {
                format!("surge-{}", self.context.id)
            } else {
                self.options.group_id.clone()
            };
            config.set("group.id", group);
            config.set("enable.auto.commit", "false");
            config.set("auto.offset.reset", "latest");

            let consumer: StreamConsumer = config.create().context("cannot create consumer")?;
            consumer
                .subscribe(&[self.options.topic.as_str()])
                .context("cannot subscribe")?;
            tracing::info!(
                "kafka reader initialized for topic {}; an empty topic is normal in load tests",
                self.options.topic
            );
            self.consumer = Some(consumer);
        } else {
            let mut config = self.client_config();
            config.set("message.timeout.ms", "5000");
            config.set("request.required.acks", "0");

            let producer: FutureProducer = config.create().context("cannot create producer")?;
            // Reachability probe only; brokers may still warm up.
            if let Err(err) = producer
                .client()
                .fetch_metadata(Some(&self.options.topic), Duration::from_secs(5))
            {
                tracing::warn!("kafka connection test failed: {err}; continuing anyway");
            }
            self.producer = Some(producer);
        }

        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let mut record = TraceRecord::new(
            TraceKind::Kafka,
            self.target.clone(),
            self.subtarget.clone(),
        );
        let start = Instant::now();

        if self.options.read_messages {
            let consumer = self
                .consumer
                .as_ref()
                .context("kafka generator not initialized")?;
            let received = tokio::select! {
                _ = self.context.cancel.cancelled() => return Ok(()),
                received = tokio::time::timeout(OP_TIMEOUT, consumer.recv()) => received,
            };
            match received {
                Ok(Ok(message)) => {
                    let bytes = message.payload().map(<[u8]>::len).unwrap_or(0);
                    tracing::debug!("message read: {bytes} bytes");
                }
                // No message within the deadline or a transient fetch error;
                // the attempt itself is the measured unit.
                Ok(Err(err)) => tracing::debug!("kafka read error: {err}"),
                Err(_elapsed) => {}
            }
        } else {
            let producer = self
                .producer
                .as_ref()
                .context("kafka generator not initialized")?;
            let message = FutureRecord::to(&self.options.topic)
                .payload(self.options.message_value.as_str())
                .key(self.options.message_key.as_str());
            let delivery = tokio::select! {
                _ = self.context.cancel.cancelled() => return Ok(()),
                delivery = producer.send(message, Timeout::After(OP_TIMEOUT)) => delivery,
            };
            if let Err((err, _message)) = delivery {
                record.error = true;
                tracing::error!("failed to write message: {err}");
            }
        }

        if !record.error {
            record.duration = start.elapsed();
        }
        self.context.stats.record(record).await;
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.producer.take();
        self.consumer.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use tokio_util::sync::CancellationToken;

    fn generator(options: KafkaOptions) -> KafkaGenerator {
        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let context = WorkerContext {
            id: 1,
            requestrate: 1,
            concurrency: 1,
            cancel: CancellationToken::new(),
            stats,
        };
        KafkaGenerator::new(context, options)
    }

    #[tokio::test]
    async fn subtarget_reflects_direction() {
        let write = generator(KafkaOptions::builder().topic("events").build());
        assert_eq!(write.subtarget, "write:events");

        let read = generator(
            KafkaOptions::builder()
                .topic("events")
                .read_messages(true)
                .build(),
        );
        assert_eq!(read.subtarget, "read:events");
    }

    #[tokio::test]
    async fn scram_credentials_set_sasl_keys() {
        let g = generator(
            KafkaOptions::builder()
                .brokers(vec!["b1:9093".into(), "b2:9093".into()])
                .username("admin")
                .password("secret")
                .sasl_mechanism("SCRAM-SHA-512")
                .use_tls(true)
                .build(),
        );
        let config = g.client_config();
        assert_eq!(config.get("bootstrap.servers"), Some("b1:9093,b2:9093"));
        assert_eq!(config.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(config.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(config.get("allow.auto.create.topics"), Some("true"));
    }

    #[tokio::test]
    async fn plain_config_carries_no_sasl() {
        let g = generator(KafkaOptions::default());
        let config = g.client_config();
        assert_eq!(config.get("sasl.mechanism"), None);
        assert_eq!(config.get("security.protocol"), None);
    }
}
