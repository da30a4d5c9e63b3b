use std::path::PathBuf;

use clap::Args;

use crate::server::ServerOptions;

/// Server mode: generates no load, receives reports from remote workers,
/// merges them and exposes text/JSON/graph views
#[derive(Args, Debug, Clone)]
#[command(after_help = "Examples:
  surge server 0.0.0.0:8080
  surge server --import saved-report.json 0.0.0.0:8080")]
pub struct ServerArgs {
    /// Listen address (host:port)
    pub addr: String,

    /// Report file to display instead of accepting imports
    #[arg(long)]
    pub import: Option<PathBuf>,
}

impl ServerArgs {
    pub(crate) fn options(&self, global: &super::GlobalOpts) -> ServerOptions {
        ServerOptions {
            addr: self.addr.clone(),
            import: self.import.clone(),
            export: global.export.clone(),
        }
    }
}
