//! Multibot Example
//!
//! Three bots defined in `bots/`, all driven from one terminal. Lines of the
//! form `@<bot> <text>` are delivered to that bot; replies are printed.
//!
//! Edit a file under `bots/` while the demo runs to see the bot reload, or
//! send `SIGHUP` to reload everything.
//!
//! # Usage
//!
//! ```bash
//! cd demos/multibot
//! cargo run --package multibot
//! ```

mod console;
mod plugins;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use fleet::prelude::*;

use crate::console::ConsoleClient;

#[derive(Parser, Debug)]
#[command(about = "Run several console bots under one Fleet runtime")]
struct Args {
    /// Configuration file; searched for in the current directory when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile, e.g. `production`.
    #[arg(short, long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let client = Arc::new(ConsoleClient::default());
    let mut builder = FleetRuntime::builder(plugins::catalog(), client.clone());
    if let Some(path) = args.config {
        builder = builder.config_file(path);
    }
    if let Some(profile) = args.profile {
        builder = builder.profile(profile);
    }
    let runtime = builder.build()?;

    client.spawn_reader();
    info!("Type `@<bot> <text>` to talk to a bot, e.g. `@support /help`");

    runtime.run().await?;
    Ok(())
}
