use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "stowage",
    about = "Stowage — host selection and migration orchestration",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a stowage.toml and the stage names it enables
    CheckConfig {
        /// Path to the configuration file
        path: String,
    },
    /// Run the filter and weigher pipelines over a JSON host inventory.
    ///
    /// The inventory is either a bare array of host states or an object
    /// with `hosts` and an optional `tenant_tags` map. Each selected
    /// primary is claimed against an in-memory ledger seeded from the
    /// inventory, so the output also shows whether the claim would hold.
    DryRun {
        /// Configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<String>,
        /// Host inventory JSON
        #[arg(long)]
        hosts: String,
        /// Request spec JSON
        #[arg(short, long)]
        request: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stowage=info".parse()?)
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => commands::check_config::check_config(&path),
        Commands::DryRun { config, hosts, request } => {
            commands::dry_run::dry_run(config.as_deref(), &hosts, &request).await
        }
    }
}
