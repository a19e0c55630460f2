type Result<T> = color_eyre::eyre::Result<T>;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nxtrt::{Cli, Config, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("nxtrtd starting");

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    let mut supervisor = Supervisor::construct(config)?;
    supervisor.start().await?;
    supervisor.initial_start().await?;

    supervisor.run().await?;

    info!("nxtrtd exiting");
    Ok(())
}
