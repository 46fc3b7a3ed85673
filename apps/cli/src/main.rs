mod mix;
mod project;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Mix audio tracks into one re-encoded stream")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mix ad-hoc input tracks into an output file
    Mix(mix::MixArgs),
    /// Produce the audio of a JSON mix description
    Project(project::ProjectArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Mix(args) => args.run().await,
        Commands::Project(args) => args.run().await,
    }
}
