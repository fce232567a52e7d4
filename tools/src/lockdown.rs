// Query and set lockdown values

use clap::{ArgMatches, Command, arg};
use ioscontrol::{
    IdeviceService, lockdown::LockdownClient, pretty_print_plist, provider::IdeviceProvider,
};
use plist::Value;

pub fn register() -> Command {
    Command::new("lockdown")
        .about("Query and manage lockdown values")
        .subcommand_required(true)
        .subcommand(
            Command::new("get")
                .about("Gets a value, or every value when no key is given")
                .arg(arg!([key] "the value to get"))
                .arg(arg!(-d --domain <STRING> "the domain to get in").required(false)),
        )
        .subcommand(
            Command::new("set")
                .about("Sets a string value")
                .arg(arg!(<key> "the key to set"))
                .arg(arg!(<value> "the value to set the key to"))
                .arg(arg!(-d --domain <STRING> "the domain to set in").required(false)),
        )
}

pub async fn main(matches: &ArgMatches, provider: &dyn IdeviceProvider) {
    let mut lockdown_client = match LockdownClient::connect(provider).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Unable to connect to lockdown: {e}");
            return;
        }
    };

    let pair_record = match provider.get_pair_record().await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("No pair record: {e}");
            return;
        }
    };
    if let Err(e) = lockdown_client.start_session(&pair_record).await {
        eprintln!("Unable to start session: {e}");
        return;
    }

    match matches.subcommand() {
        Some(("get", sub_m)) => {
            let key = sub_m.get_one::<String>("key").map(String::as_str);
            let domain = sub_m.get_one::<String>("domain").map(String::as_str);

            match lockdown_client.get_value(key, domain).await {
                Ok(value) => println!("{}", pretty_print_plist(&value)),
                Err(e) => eprintln!("Error getting value: {e}"),
            }
        }
        Some(("set", sub_m)) => {
            let (Some(key), Some(value)) = (
                sub_m.get_one::<String>("key"),
                sub_m.get_one::<String>("value"),
            ) else {
                return;
            };
            let domain = sub_m.get_one::<String>("domain").map(String::as_str);

            match lockdown_client
                .set_value(key, Value::String(value.clone()), domain)
                .await
            {
                Ok(()) => println!("Successfully set"),
                Err(e) => eprintln!("Error setting value: {e}"),
            }
        }
        _ => eprintln!("Invalid subcommand"),
    }
}
