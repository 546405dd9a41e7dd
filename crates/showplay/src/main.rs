//! ShowPlay - plays pre-rendered light show sequences to network controllers
//!
//! Reads a player configuration, opens the configured DDP and E1.31
//! controllers and streams the sequence to them at its frame rate.

mod config;
mod logging_setup;
mod player;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};

use config::PlayerConfig;
use player::Player;
use showplay_control::open_controllers;
use showplay_core::OpenStatus;
use showplay_io::FrameCache;

#[derive(Debug, Parser)]
#[command(name = "showplay", version, about = "Play a light show sequence to DDP / E1.31 controllers")]
struct Cli {
    /// Player configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sequence file, overriding the configuration
    #[arg(short, long)]
    sequence: Option<PathBuf>,

    /// Start over at the end of the sequence
    #[arg(long = "loop")]
    loop_playback: bool,

    /// First frame to play
    #[arg(long)]
    start_frame: Option<u32>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(cli: &Cli) -> Result<PlayerConfig> {
    let mut config = match &cli.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    if let Some(sequence) = &cli.sequence {
        config.sequence = Some(sequence.clone());
    }
    if cli.loop_playback {
        config.playback.loop_playback = true;
    }
    if let Some(frame) = cli.start_frame {
        config.playback.start_frame = frame;
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _log_guard = logging_setup::init(&config.log)?;

    config.validate()?;
    let sequence = config.sequence.clone().context("No sequence file configured")?;
    info!("ShowPlay {} starting", env!("CARGO_PKG_VERSION"));

    let (outputs, reports) = open_controllers(&config.controllers, &config.output).await;
    for report in &reports {
        match report.status {
            OpenStatus::Open => {}
            OpenStatus::Skipped => info!("Controller '{}' skipped", report.name),
            OpenStatus::Error => error!(
                "Controller '{}' unavailable: {}",
                report.name,
                report.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    if outputs.is_empty() {
        warn!("No controller could be opened; frames will be decoded but not sent");
    }

    let cache = FrameCache::new(config.cache.to_options());
    let mut player = Player::new(sequence, cache, outputs, config.playback.clone(), config.pacing);
    let summary = player
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(
        "Finished: {} frames sent, {} skipped, {} unreadable, {} loops",
        summary.frames_sent, summary.frames_skipped, summary.frame_errors, summary.loops
    );
    Ok(())
}
