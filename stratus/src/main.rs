//! Entrypoint of the `stratus` binary.

use clap::Parser;
use observability_deps::tracing::error;

mod commands;
mod console;

#[derive(Debug, Parser)]
#[clap(
    name = "stratus",
    about = "Distributed key-value store for dated weather records",
    long_about = "Distributed key-value store for dated weather records.\n\n\
    Records are placed on storage nodes by consistent hashing over their\n\
    date, mirrored to paired replicas, and recovered from the replica when\n\
    a storage dies. A separate showcase service answers temperature range\n\
    queries over everything ingested."
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Run an in-process cluster and serve the operator console
    Run(commands::run::Config),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(config) => commands::run::command(config).await,
    };

    if let Err(e) = result {
        error!(%e, "command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
