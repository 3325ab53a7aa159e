mod archive;
mod cache;
mod catalog;
mod cli;
mod cmd;
mod compose;
mod config;
mod device;
mod ostree;
mod target;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use cli::{Cli, Command};
use device::Track;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    match cli.command {
        Command::Initialize(args) => cmd::initialize(cli.config_dir, args).await,
        Command::Status => cmd::status(cli.config_dir).await,
        Command::ListBase => cmd::list(cli.config_dir, Track::Base).await,
        Command::ListPersonality => cmd::list(cli.config_dir, Track::Personality).await,
        Command::Update(args) => cmd::update(cli.config_dir, args).await,
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive(default_level.parse()?)
                    .add_directive("hyper=error".parse()?)
                    .add_directive("reqwest=warn".parse()?),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
    Ok(())
}
