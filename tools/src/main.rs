// Command line entry point for the ioscontrol tools

use clap::{Arg, Command};
use tracing_subscriber::EnvFilter;

mod agent;
mod common;
mod devices;
mod dvt_packet_parser;
mod lockdown;
mod process_control;
mod screenshot;

const LABEL: &str = "ioscontrol-tools";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let matches = Command::new("ioscontrol")
        .about("Tools to inspect and control iOS devices")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("udid")
                .long("udid")
                .short('u')
                .value_name("UDID")
                .global(true)
                .help("UDID of the device, the first USB device when omitted"),
        )
        .subcommand_required(true)
        .subcommand(devices::register())
        .subcommand(lockdown::register())
        .subcommand(screenshot::register())
        .subcommand(process_control::register())
        .subcommand(dvt_packet_parser::register())
        .subcommand(agent::register())
        .get_matches();

    let Some((subcommand, sub_args)) = matches.subcommand() else {
        eprintln!("No subcommand passed, pass -h for help");
        return;
    };

    // commands that don't talk to a single device
    match subcommand {
        "list" => return devices::main(sub_args).await,
        "dtx-parse" => return dvt_packet_parser::main(sub_args).await,
        "agent" => return agent::main(sub_args).await,
        _ => {}
    }

    let udid = sub_args
        .get_one::<String>("udid")
        .or_else(|| matches.get_one::<String>("udid"));
    let provider = match common::get_provider(udid, LABEL).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    match subcommand {
        "lockdown" => lockdown::main(sub_args, &provider).await,
        "screenshot" => screenshot::main(sub_args, &provider).await,
        "process" => process_control::main(sub_args, &provider).await,
        other => eprintln!("Unknown subcommand {other}"),
    }
}
