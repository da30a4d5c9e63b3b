//! Redis adapter: one command per tick over a multiplexed connection.
//! A `nil` reply is a successful request.

use anyhow::Context as _;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Value};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use crate::generator::{Generator, WorkerContext};
use crate::stats::{TraceKind, TraceRecord};

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RedisOptions {
    /// `host:port` of the server.
    #[builder(default = "127.0.0.1:6379".into(), setter(into))]
    pub target: String,
    #[builder(default, setter(into))]
    pub username: String,
    #[builder(default, setter(into))]
    pub password: String,
    #[builder(default)]
    pub database: i64,
    #[builder(default, setter(into))]
    pub cmd: String,
    #[builder(default)]
    pub args: Vec<String>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct RedisGenerator {
    context: WorkerContext,
    options: RedisOptions,
    connection: Option<MultiplexedConnection>,
    subtarget: String,
}

impl RedisGenerator {
    pub fn new(context: WorkerContext, options: RedisOptions) -> Self {
        Self {
            context,
            options,
            connection: None,
            subtarget: String::new(),
        }
    }
}

#[async_trait]
impl Generator for RedisGenerator {
    async fn init(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.options.cmd.is_empty(), "redis command not given");
        self.subtarget = self.options.cmd.to_lowercase();

        let (host, port) = match self.options.target.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().context("invalid port")?),
            None => (self.options.target.clone(), 6379),
        };

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host, port),
            redis: RedisConnectionInfo {
                db: self.options.database,
                username: (!self.options.username.is_empty()).then(|| self.options.username.clone()),
                password: (!self.options.password.is_empty()).then(|| self.options.password.clone()),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info)?;
        let mut connection = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .context("redis ping failed")?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn tick(&mut self) -> anyhow::Result<()> {
        let connection = self
            .connection
            .as_mut()
            .context("redis generator not initialized")?;

        let mut cmd = redis::cmd(&self.options.cmd);
        for arg in &self.options.args {
            cmd.arg(arg);
        }

        let mut record = TraceRecord::new(
            TraceKind::Redis,
            self.options.target.clone(),
            self.subtarget.clone(),
        );
        let start = Instant::now();

        let result = tokio::select! {
            _ = self.context.cancel.cancelled() => return Ok(()),
            result = cmd.query_async::<Value>(connection) => result,
        };

        match result {
            // Nil is a miss, not a failure.
            Ok(_value) => record.duration = start.elapsed(),
            Err(err) => {
                record.error = true;
                tracing::error!("redis error: {err}");
            }
        }
        self.context.stats.record(record).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Stats;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn missing_command_fails_init() {
        let (stats, _handle) = Stats::spawn("t", 1, 1, Duration::ZERO, false);
        let context = WorkerContext {
            id: 1,
            requestrate: 1,
            concurrency: 1,
            cancel: CancellationToken::new(),
            stats,
        };
        let mut generator = RedisGenerator::new(context, RedisOptions::default());
        assert!(generator.init().await.is_err());
    }
}
