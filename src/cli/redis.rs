use std::sync::Arc;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::protocols::redis::{RedisGenerator, RedisOptions};

/// Redis load generator
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge redis --requestrate 10 --cmd GET --arg foo 127.0.0.1:6379")]
pub struct RedisArgs {
    /// Target server (host:port)
    pub target: String,

    /// Command to run
    #[arg(long)]
    pub cmd: String,

    /// Arguments to the command, may repeat
    #[arg(long = "arg")]
    pub args: Vec<String>,

    #[arg(long, default_value = "")]
    pub username: String,

    #[arg(long, default_value = "")]
    pub password: String,

    #[arg(long, default_value_t = 0)]
    pub database: i64,
}

impl RedisArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        let options = RedisOptions::builder()
            .target(self.target.clone())
            .cmd(self.cmd.clone())
            .args(self.args.clone())
            .username(self.username.clone())
            .password(self.password.clone())
            .database(self.database)
            .build();
        Ok(Arc::new(move |context| {
            Box::new(RedisGenerator::new(context, options.clone())) as Box<dyn Generator>
        }))
    }
}
