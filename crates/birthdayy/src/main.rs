mod config;
mod discord;
mod input;
mod reminder;
mod store;
mod version;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    config::{open_config, write_default_config},
    store::BirthdayStore,
    version::short_version,
};

#[derive(Parser)]
#[command(version = short_version())]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    if args.init {
        write_default_config(&args.config)?;
        info!(path = ?args.config, "Created default configuration");
        return Ok(());
    }

    tracing::info!(version = short_version(), "birthdayy version");

    let config = open_config(&args.config).context("Failed to load configuration")?;
    info!(guilds = config.guilds.len(), "Configuration loaded");

    let store = BirthdayStore::load(&config.store.path).context("Failed to load birthday store")?;
    info!(path = ?config.store.path, birthdays = store.len(), "Birthday store loaded");

    discord::run(Arc::new(config), Arc::new(Mutex::new(store))).await
}
