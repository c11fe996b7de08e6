mod commands;
mod opts;
mod value_kernel;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::envelope::EnvelopeArgs;
use commands::serve::ServeArgs;
use opts::HostOpts;

#[derive(Parser, Debug)]
#[command(name = "nbk", version, about = "Notebook kernel host")]
struct Cli {
    #[command(flatten)]
    opts: HostOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host a composite kernel over stdin/stdout (newline-delimited JSON)
    Serve(ServeArgs),

    /// Validate an envelope and print its normalized form
    Envelope(EnvelopeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => commands::serve::cmd_serve(&cli.opts, &args).await,
        Command::Envelope(args) => commands::envelope::cmd_envelope(&args).await,
    }
}

/// Logs go to stderr; stdout carries the envelope stream.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
