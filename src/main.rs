use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use log::{error, info};

use packmon::charger::NoopRelay;
use packmon::config::Config;
use packmon::events::{Event, EventBus};
use packmon::link::SlaveLink;
use packmon::monitor::Monitor;
use packmon::poll::NoopRail;
use packmon::soc::SocTracker;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        error!("{e}");
        process::exit(1);
    }
}

fn run() -> packmon::Result<()> {
    let config_path = env::args().nth(1).unwrap_or_else(|| "packmon.toml".into());
    let config = Config::load(Path::new(&config_path))?;
    info!("configuration loaded from {config_path}");

    let link = SlaveLink::open(&config.device)?;
    info!("slave bus open on {}", config.device);

    let bus = Arc::new(EventBus::new());
    bus.subscribe(|event| {
        if let Event::ChargerState { on, latched, reason } = event {
            match reason {
                Some(r) => info!(
                    "charger {}: {} (reason {}{})",
                    if *on { "on" } else { "off" },
                    r,
                    r.code(),
                    if *latched { ", latched" } else { "" }
                ),
                None => info!("charger {}", if *on { "on" } else { "off" }),
            }
        }
    });

    let soc = SocTracker::new();
    soc.attach(&bus);

    let mut monitor = Monitor::new(&config, link, NoopRail, NoopRelay, soc, bus);
    monitor.run()
}
