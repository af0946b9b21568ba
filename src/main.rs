use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dca_server::{Config, Daemon};

/// DCA - control plane for datakit collector agents
#[derive(Parser)]
#[command(name = "dca-server", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "DCA_PORT", default_value = "8000")]
    port: u16,

    /// Data directory (overrides DCA_DATA_DIR)
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,dca_server=info",
        1 => "info,dca_server=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.port)?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    tracing::info!(
        port = config.port,
        data_dir = %config.data_dir.display(),
        "starting dca server"
    );

    let daemon = Daemon::new(config)?;
    daemon.run().await?;
    Ok(())
}
