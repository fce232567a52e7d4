// Lists, launches and kills processes

use clap::{ArgMatches, Command, arg, value_parser};
use ioscontrol::{
    IdeviceError, IdeviceService,
    dvt::{
        InstrumentsConnection, device_info::DeviceInfoClient,
        process_control::ProcessControlClient,
    },
    provider::IdeviceProvider,
};

pub fn register() -> Command {
    Command::new("process")
        .about("Manage processes with the instruments remote server")
        .subcommand_required(true)
        .subcommand(
            Command::new("ps")
                .about("List running processes")
                .arg(arg!(--json "print as JSON")),
        )
        .subcommand(
            Command::new("launch")
                .about("Launch an app")
                .arg(arg!(<bundle_id> "The bundle ID to launch"))
                .arg(arg!(-s --suspended "start the process suspended"))
                .arg(arg!(--"no-kill" "keep running instances"))
                .arg(arg!([args] ... "arguments passed to the app")),
        )
        .subcommand(
            Command::new("kill")
                .about("Kill a process")
                .arg(arg!(<pid> "The pid to kill").value_parser(value_parser!(u64))),
        )
}

pub async fn main(matches: &ArgMatches, provider: &dyn IdeviceProvider) {
    let conn = match InstrumentsConnection::connect(provider).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Unable to connect to the instruments service: {e} Ensure Developer Disk Image is mounted."
            );
            return;
        }
    };

    if let Err(e) = run(matches, &conn).await {
        eprintln!("{e}");
    }
    conn.close().await;
}

async fn run(matches: &ArgMatches, conn: &InstrumentsConnection) -> Result<(), IdeviceError> {
    match matches.subcommand() {
        Some(("ps", sub_m)) => {
            let processes = DeviceInfoClient::new(conn).await?.running_processes().await?;
            if sub_m.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&processes)?);
            } else {
                for p in processes {
                    let app = if p.is_application { "app" } else { "" };
                    println!("{:>6} {:<32} {app}", p.pid, p.name);
                }
            }
        }
        Some(("launch", sub_m)) => {
            let Some(bundle_id) = sub_m.get_one::<String>("bundle_id") else {
                return Ok(());
            };
            let args: Vec<String> = sub_m
                .get_many::<String>("args")
                .map(|a| a.cloned().collect())
                .unwrap_or_default();
            let pid = ProcessControlClient::new(conn)
                .await?
                .launch_app(
                    bundle_id,
                    None,
                    &args,
                    sub_m.get_flag("suspended"),
                    !sub_m.get_flag("no-kill"),
                )
                .await?;
            println!("Launched {bundle_id} with pid {pid}");
        }
        Some(("kill", sub_m)) => {
            let Some(pid) = sub_m.get_one::<u64>("pid") else {
                return Ok(());
            };
            ProcessControlClient::new(conn).await?.kill_app(*pid).await?;
            println!("Killed {pid}");
        }
        _ => eprintln!("Invalid subcommand"),
    }
    Ok(())
}
