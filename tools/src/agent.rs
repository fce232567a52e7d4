// Runs the device state manager and prints the device table

use std::time::Duration;

use clap::{ArgMatches, Command, arg, value_parser};
use ioscontrol::device_state::{DeviceStateManager, ManagerConfig};
use tracing::info;

use crate::common;

pub fn register() -> Command {
    Command::new("agent")
        .about("Track attached devices and their sessions")
        .arg(
            arg!(-p --print <SECONDS> "how often to print the device table")
                .value_parser(value_parser!(u64))
                .default_value("30"),
        )
}

pub async fn main(matches: &ArgMatches) {
    let addr = match common::usbmuxd_addr() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let every = matches.get_one::<u64>("print").copied().unwrap_or(30).max(1);

    let config = ManagerConfig::from_env();
    info!("Starting device state manager with {config:?}");
    let manager = DeviceStateManager::new();
    let tasks = manager.start(addr, config);

    let mut ticker = tokio::time::interval(Duration::from_secs(every));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match manager.snapshot_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => eprintln!("Unable to serialize devices: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stopping device state manager");
    tasks.shutdown().await;
}
