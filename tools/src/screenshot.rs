// Takes a screenshot over the instruments remote server

use clap::{ArgMatches, Command, arg};
use ioscontrol::{
    IdeviceService,
    dvt::{InstrumentsConnection, screenshot::ScreenshotClient},
    provider::IdeviceProvider,
};

pub fn register() -> Command {
    Command::new("screenshot")
        .about("Take a screenshot")
        .arg(arg!(<output> "Output path"))
}

pub async fn main(matches: &ArgMatches, provider: &dyn IdeviceProvider) {
    let Some(output_path) = matches.get_one::<String>("output") else {
        return;
    };

    let conn = match InstrumentsConnection::connect(provider).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Unable to connect to the instruments service: {e} Ensure Developer Disk Image is mounted."
            );
            return;
        }
    };

    let res = match ScreenshotClient::new(&conn).await {
        Ok(client) => client.take_screenshot().await,
        Err(e) => Err(e),
    };
    conn.close().await;

    match res {
        Ok(png) => match tokio::fs::write(output_path, png).await {
            Ok(_) => println!("Screenshot saved to: {output_path}"),
            Err(e) => eprintln!("Failed to write screenshot to file: {e}"),
        },
        Err(e) => eprintln!("Failed to take screenshot: {e}"),
    }
}
