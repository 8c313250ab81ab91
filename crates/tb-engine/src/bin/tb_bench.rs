use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tb_engine::cli::{run_cli, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let summary = run_cli(Cli::parse()).await?;
    println!("{summary}");
    if summary.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
