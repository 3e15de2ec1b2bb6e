use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};
use structopt::StructOpt;

use vbus::chrono::Local;
use vbus::config;
use vbus::dispatch::{Dispatcher, PluginRegistry};
use vbus::serial::SerialReader;
use vbus::stats::{CommStats, CountingAllocator};
use vbus::VbusSpec;

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

/// Longest time the main loop blocks before re-checking the stop flag.
const MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Reads RESOL VBus data from a serial port, decodes it against a VBus specification file and publishes configured field transfers to an MQTT broker."
)]
struct Opt {
    #[structopt(
        name = "CONFIG",
        parse(from_os_str),
        default_value = "vbus2mqtt.json5",
        help = "JSON5 configuration file."
    )]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let config = config::load(&opt.config).context("failed to load configuration")?;
    let spec =
        Arc::new(VbusSpec::load(&config.vbus.vsf).context("failed to load VSF specification")?);
    info!("loaded VSF, datecode {}", spec.datecode());

    let publisher =
        Arc::new(vbus::mqtt::connect(&config.mqtt).context("failed to connect to MQTT broker")?);

    let stats = Arc::new(CommStats::new());
    let mut dispatcher = Dispatcher::new(
        publisher,
        config.mqtt.topic_prefix.clone(),
        &config.plugins,
        &config.transfers,
        &PluginRegistry::builtin(),
        Arc::clone(&stats),
        Local::now(),
    )
    .context("failed to build dispatcher")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .context("failed to install interrupt handler")?;
    }

    let (tx, rx) = mpsc::channel();
    let reader = SerialReader::spawn(&config.vbus, spec, Arc::clone(&stats), tx, Arc::clone(&stop))
        .context("failed to open serial port")?;

    let mut reader_gone = false;
    while !stop.load(Ordering::Relaxed) {
        let now = Local::now();
        let next = dispatcher.tick(now);
        let wait = next
            .map(|next| (next - Local::now()).to_std().unwrap_or(Duration::from_secs(0)))
            .unwrap_or(MAX_WAIT)
            .min(MAX_WAIT);

        if reader_gone {
            thread::sleep(wait);
            continue;
        }
        match rx.recv_timeout(wait) {
            Ok(batch) => dispatcher.update_fields(&batch.values, batch.timestamp),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                // Interval transfers keep publishing; the values just
                // age out.
                error!("reader is gone; continuing without VBus input");
                reader_gone = true;
            }
        }
    }

    info!("shutting down");
    reader.stop();
    Ok(())
}
