use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "fedgate",
    version,
    about = "MCP gateway that multiplexes a federation of backend tool servers"
)]
pub struct Cli {
    /// Path to the backend catalog file.
    #[arg(long, default_value = "catalog.yaml")]
    pub catalog: PathBuf,

    /// Path to the runtime config file (template values and secrets).
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Verbose logging; also captures backend container stderr.
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the federation over stdio (the default).
    Run {
        /// Keep containers after exit instead of --rm.
        #[arg(long)]
        static_containers: bool,

        /// Retain every backend session for the life of the gateway.
        #[arg(long)]
        force_retain: bool,

        /// Mount configured volumes read-only.
        #[arg(long)]
        read_only: bool,

        /// Additional network(s) launched containers join.
        #[arg(long)]
        network: Vec<String>,
    },
    /// Run the OAuth authorization flow for one remote backend.
    Authorize {
        /// Backend name from the catalog.
        server: String,
    },
}
