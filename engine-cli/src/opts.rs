use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(
    name = "engine-ci",
    version,
    about = "Container-based build engine driven by an external plugin"
)]
pub struct Opts {
    #[clap(short, long)]
    /// Suppress all output except warnings and errors.
    pub quiet: bool,
    #[clap(short, long)]
    /// Enable debug output.
    pub debug: bool,
    #[clap(short, long)]
    /// Enable trace output.
    pub trace: bool,
    #[clap(long)]
    /// Disable colored output.
    pub no_color: bool,
    #[clap(short, long)]
    /// Path to the configuration file (YAML or JSON by extension).
    pub config: Option<PathBuf>,
    #[clap(long)]
    /// Write the log to a file instead of stdout.
    pub log_file: Option<PathBuf>,
    #[clap(long)]
    /// Override the default image registry.
    pub registry: Option<String>,
    #[clap(long)]
    /// Container runtime to use (`docker` or `podman`).
    pub runtime: Option<String>,
    #[clap(long)]
    /// Environment profile (`local`, `build` or `production`).
    pub env: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

impl Opts {
    pub fn from_args() -> Self {
        Parser::parse()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Loads the plugin, retrieves the build program and runs it.
    Build(BuildOpts),
    /// Validates and prints the merged configuration.
    Config,
}

#[derive(Debug, Args)]
pub struct BuildOpts {
    /// Path to the plugin executable that supplies the build program.
    pub plugin: String,
    /// Arguments forwarded to the plugin process.
    #[clap(last = true)]
    pub plugin_args: Vec<String>,
}
