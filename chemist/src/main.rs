//! Entrypoint of the chemist control plane server.

use clap::Parser;
use observability_deps::tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;
mod http;

#[derive(Debug, clap::Parser)]
#[clap(
    name = "chemist",
    about = "Control plane for a fleet of monitoring flasks",
    long_about = "Chemist watches the cloud lifecycle event queue, decides which \
    flask monitors which target, rebalances when flasks come and go, and \
    investigates flasks suspected dead.

Configuration options can be set with command line flags or the corresponding \
environment variables. If there is a file named '.env' in the current working \
directory, it is sourced before loading the configuration."
)]
struct Config {
    /// Supports having run be the default command.
    #[clap(flatten)]
    run_config: commands::run::Config,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Run the chemist server (default).
    Run(commands::run::Config),
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = Config::parse();

    let run_config = match config.command {
        None => config.run_config,
        Some(Command::Run(run_config)) => run_config,
    };
    init_logging(&run_config.run_config.log_filter);

    if let Err(e) = commands::run::command(run_config).await {
        error!(error=%e, "chemist failed");
        eprintln!("chemist failed: {e}");
        std::process::exit(1);
    }
}
