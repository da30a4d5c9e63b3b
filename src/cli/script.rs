use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use crate::generator::{Generator, GeneratorFactory};
use crate::script::{ScriptGenerator, ScriptOptions, ScriptRuntime};

/// Script based load generator: a Lua program drives the run and can mix
/// every other protocol, with all metrics collected transparently
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge script /path/to/my/script.lua
  surge script --requestrate 10 ./scripts/test.lua -- --foo bar")]
pub struct ScriptArgs {
    /// Path to the Lua script
    pub script: PathBuf,

    /// Arguments passed to the script's args() function
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl ScriptArgs {
    pub(crate) fn factory(&self) -> anyhow::Result<GeneratorFactory> {
        anyhow::ensure!(
            self.script.is_file(),
            "script not found: {}",
            self.script.display()
        );
        let runtime = ScriptRuntime::load(ScriptOptions {
            script: self.script.clone(),
            args: self.args.clone(),
        })?;
        Ok(Arc::new(move |context| {
            Box::new(ScriptGenerator::new(context, runtime.clone())) as Box<dyn Generator>
        }))
    }
}
