//! Command-line argument definitions.

use std::path::PathBuf;

use clap::Args;

/// Arguments for `toolgate serve`.
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Path to the gateway configuration document (YAML or JSON).
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Log at debug level regardless of RUST_LOG.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

/// Arguments for `toolgate validate`.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Path to the gateway configuration document (YAML or JSON).
    #[arg(long, short = 'c')]
    pub config: PathBuf,
}
