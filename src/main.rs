use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use listingharvest::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    listingharvest::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Harvest(args) => listingharvest::harvest::run(args).await.context("harvest")?,
        Command::Extract(args) => listingharvest::harvest::extract(args)
            .await
            .context("extract")?,
        Command::Check(args) => listingharvest::harvest::check(args).context("check")?,
    }

    Ok(())
}
