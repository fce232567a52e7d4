// Gets the devices from the muxer

use clap::{ArgMatches, Command, arg};
use futures_util::StreamExt;

use crate::common;

pub fn register() -> Command {
    Command::new("list")
        .about("List attached devices")
        .arg(arg!(-l --listen "keep printing attach and detach events"))
}

pub async fn main(matches: &ArgMatches) {
    let addr = match common::usbmuxd_addr() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };
    let mut muxer = match addr.connect(0).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Unable to connect to usbmuxd: {e}");
            return;
        }
    };

    match muxer.get_devices().await {
        Ok(devs) => {
            for dev in devs {
                println!("{} ({:?}, id {})", dev.udid, dev.connection_type, dev.device_id);
            }
        }
        Err(e) => {
            eprintln!("Unable to get devices: {e}");
            return;
        }
    }

    if !matches.get_flag("listen") {
        return;
    }
    // listen needs a connection of its own
    let mut muxer = match addr.connect(0).await {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Unable to connect to usbmuxd: {e}");
            return;
        }
    };
    let mut s = match muxer.listen().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Listen failed: {e}");
            return;
        }
    };
    while let Some(event) = s.next().await {
        match event {
            Ok(event) => println!("{event:#?}"),
            Err(e) => {
                eprintln!("Failed to read from stream: {e}");
                break;
            }
        }
    }
}
