use anyhow::Result;
use clap::Parser;
use emocv::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("emocv=info")),
        )
        .init();

    let cli = Cli::parse();
    cli::execute(cli)?;
    Ok(())
}
