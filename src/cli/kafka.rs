use std::sync::Arc;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::kafka::{KafkaGenerator, KafkaOptions};

/// Kafka load generator; produces to or consumes from a topic
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge kafka --brokers localhost:9092 --topic test-topic --message 'Hello' \\
      --requestrate 10 --duration 30s
  surge kafka --brokers localhost:9092 --topic test-topic --group g1 --read \\
      --requestrate 10 --duration 30s
  surge kafka --brokers localhost:9093 --topic scram-topic --message hi \\
      --username admin --password secret --sasl-mechanism SCRAM-SHA-512")]
pub struct KafkaArgs {
    /// Broker addresses, may repeat or be comma separated
    #[arg(long = "brokers", value_delimiter = ',', default_value = "localhost:9092")]
    pub brokers: Vec<String>,

    /// Topic to produce to or consume from (auto-created when missing)
    #[arg(long, default_value = "test-topic")]
    pub topic: String,

    /// Message payload for produce mode
    #[arg(long = "message", default_value = "hello")]
    pub message_value: String,

    /// Message key for produce mode
    #[arg(long = "key", default_value = "")]
    pub message_key: String,

    /// Consumer group id for read mode
    #[arg(long = "group", default_value = "")]
    pub group_id: String,

    /// Consume messages instead of producing
    #[arg(long = "read")]
    pub read_messages: bool,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, default_value = "")]
    pub password: String,

    /// SASL mechanism: SCRAM-SHA-256 or SCRAM-SHA-512
    #[arg(long, default_value = "")]
    pub sasl_mechanism: String,

    /// Connect over TLS
    #[arg(long = "tls")]
    pub use_tls: bool,
}

impl KafkaArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let options = KafkaOptions::builder()
            .brokers(self.brokers.clone())
            .topic(self.topic.clone())
            .message_value(self.message_value.clone())
            .message_key(self.message_key.clone())
            .group_id(self.group_id.clone())
            .read_messages(self.read_messages)
            .username(self.username.clone())
            .password(self.password.clone())
            .sasl_mechanism(self.sasl_mechanism.clone())
            .use_tls(self.use_tls)
            .build();
        Ok(Arc::new(move |context| {
            Box::new(KafkaGenerator::new(context, options.clone())) as Box<dyn Generator>
        }))
    }
}
