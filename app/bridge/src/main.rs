// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launcher-facing front end of the simulation bridge.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn, LevelFilter};

use sim_bridge::entry::{run_simulation, BridgeOptions};

#[derive(Debug, Parser)]
#[clap(
    name = "sim-bridge",
    max_term_width = 80,
    about = "drive a simulated accelerator design as if it were real \
             hardware"
)]
struct Args {
    /// Design archive to load. Currently only the status core image
    /// (`status.bin`) is taken from it.
    filename: Option<PathBuf>,

    /// Port the request service listens on.
    #[clap(long, default_value_t = 4040)]
    port: u16,

    /// More chatter; repeat for bus-level traces.
    #[clap(short, parse(from_occurrences))]
    verbose: usize,

    /// Accepted for launcher compatibility; this bridge has no GUI.
    #[clap(long)]
    gui: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    if args.gui {
        warn!("--gui requested, but this bridge runs headless");
    }

    let status_image = load_status_image(args.filename.as_deref())?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        stop2.store(true, Ordering::Relaxed);
    })
    .context("installing the interrupt handler")?;

    let options = BridgeOptions {
        port: args.port,
        status_image,
        ..BridgeOptions::default()
    };
    run_simulation(options, stop, None);
    info!("simulation stopped");
    Ok(())
}

/// Pulls the status core image out of the design archive. Without an
/// archive (or without an image in it) the status structure is empty,
/// which is a valid, if boring, platform.
fn load_status_image(path: Option<&Path>) -> anyhow::Result<Vec<u8>> {
    let Some(path) = path else {
        return Ok(vec![0x00]);
    };
    let file = File::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("reading {} as a zip", path.display()))?;
    let entry = archive.by_name("status.bin");
    match entry {
        Ok(mut entry) => {
            let mut image = Vec::new();
            entry
                .read_to_end(&mut image)
                .context("extracting status.bin")?;
            info!(
                "loaded {}-byte status image from {}",
                image.len(),
                path.display()
            );
            Ok(image)
        }
        Err(_) => {
            warn!(
                "{} carries no status.bin; using an empty status",
                path.display()
            );
            Ok(vec![0x00])
        }
    }
}
