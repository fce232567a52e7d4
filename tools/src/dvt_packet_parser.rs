// Prints the DTX messages of a captured byte stream

use clap::{ArgMatches, Command, arg};
use ioscontrol::{
    IdeviceError,
    dtx::{DtxFrame, DtxMessage, Reassembler, message},
};

pub fn register() -> Command {
    Command::new("dtx-parse")
        .about("Decode a file of captured DTX traffic")
        .arg(arg!(<file> "The capture to parse"))
}

pub async fn main(matches: &ArgMatches) {
    let Some(file) = matches.get_one::<String>("file") else {
        return;
    };
    let bytes = match tokio::fs::read(file).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Unable to read {file}: {e}");
            return;
        }
    };

    let mut rest = bytes.as_slice();
    let mut fragments = Reassembler::new();
    while !rest.is_empty() {
        let (frame, next) = match message::decode(rest) {
            Ok(f) => f,
            Err(e) if e.is_incomplete() => {
                eprintln!("Capture ends with {} bytes of a partial message", rest.len());
                break;
            }
            Err(e) => {
                eprintln!("Stopping at offset {}: {e}", bytes.len() - rest.len());
                break;
            }
        };
        rest = next;

        match frame {
            DtxFrame::Message(m) => print_message(&m),
            DtxFrame::Fragment { header, bytes } => {
                if let Err(e) = add_fragment(&mut fragments, header, bytes) {
                    eprintln!("Dropping fragment: {e}");
                }
            }
        }
    }
}

fn add_fragment(
    fragments: &mut Reassembler,
    header: message::MessageHeader,
    bytes: Vec<u8>,
) -> Result<(), IdeviceError> {
    if let Some(whole) = fragments.accept(header, bytes)? {
        print_message(&DtxMessage::from_bytes(&whole)?);
    }
    Ok(())
}

fn print_message(message: &DtxMessage) {
    println!("{message}");
    if message.aux.is_empty() {
        return;
    }
    println!("----- AUX -----");
    for v in message.aux.values() {
        match v.unarchive() {
            Some(Ok(a)) => println!("{a:#?}"),
            _ => println!("{v:?}"),
        }
    }
}
