use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use matrix_anim::clock::{Clock, SystemClock};
use matrix_anim::config::Config;
use matrix_anim::player::{DirectoryProvider, LogWatchdog, Player, DEVICE_HEADER, LOCATION_HEADER};
use matrix_anim::ppm_writer::PpmSink;

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::parse();

    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {}", config.output_dir.display()))?;

    let url = config.url();
    info!("playing from {url}, serving {}", config.serve_dir.display());

    let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
    let mut player = Player::new(
        DirectoryProvider::new(&config.serve_dir),
        url,
        clock,
        PpmSink::new(&config.output_dir, config.frame_ring),
        LogWatchdog::default(),
    )
    .with_fetch_policy(config.fetch_policy())
    .with_bin_options(config.bin_options());

    if let Some(device_id) = &config.device_id {
        player = player.with_header(DEVICE_HEADER, device_id);
    }
    if let Some(location) = &config.location {
        player = player.with_header(LOCATION_HEADER, location);
    }
    if let Some(fallback) = &config.fallback {
        player = player.with_fallback(fallback);
    }
    if let Some(dwell) = config.default_dwell() {
        player = player.with_default_dwell(dwell);
    }

    let clean = player.run(config.cycles);
    info!("{clean} of {} cycles played cleanly", config.cycles);
    Ok(())
}
