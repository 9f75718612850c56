//! toolgate CLI entry point.
//!
//! `serve` runs the gateway over stdio; `validate` checks a configuration
//! document and prints a summary. Logs go to stderr so stdout stays clean
//! for the protocol.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use toolgate::cli::{ServeArgs, ValidateArgs};
use toolgate::server;
use toolgate_core::Gateway;

/// toolgate: policy-enforcing gateway for tool-calling agents.
#[derive(Parser)]
#[command(name = "toolgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway over stdio.
    Serve(ServeArgs),
    /// Validate a configuration document and exit.
    Validate(ValidateArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve(args) => {
            init_tracing(args.verbose);
            run_serve(args).await
        }
        Commands::Validate(args) => {
            init_tracing(false);
            run_validate(&args)
        }
    };

    std::process::exit(code);
}

async fn run_serve(args: ServeArgs) -> i32 {
    let config = match toolgate_core::config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("toolgate serve: {e}");
            return 1;
        }
    };

    let gateway = match Gateway::new(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            eprintln!("toolgate serve: {e}");
            return 1;
        }
    };

    gateway.registry().start_enabled().await;
    server::run(gateway, args.config).await
}

fn run_validate(args: &ValidateArgs) -> i32 {
    match toolgate_core::config::load(&args.config) {
        Ok(config) => {
            println!(
                "ok: {} server(s), {} policy(ies), audit at {}",
                config.servers.len(),
                config.policies.len(),
                config
                    .audit
                    .as_ref()
                    .map(|a| a.path.display().to_string())
                    .unwrap_or_default(),
            );
            0
        }
        Err(e) => {
            eprintln!("toolgate validate: {e}");
            1
        }
    }
}

/// Tracing to stderr; `--verbose` forces debug, otherwise RUST_LOG decides.
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
