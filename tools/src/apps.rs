// Installed apps and app lifecycle

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError, dvt::process_control::LaunchOptions};

use crate::common;

pub fn command() -> Command {
    Command::new("apps")
        .about("List, launch, kill and uninstall apps")
        .subcommand_required(true)
        .subcommand(
            Command::new("list")
                .about("List installed apps")
                .arg(
                    Arg::new("type")
                        .long("type")
                        .value_parser(["User", "System", "Any"])
                        .default_value("Any"),
                ),
        )
        .subcommand(
            Command::new("launch")
                .about("Launch an app and print its pid")
                .arg(Arg::new("bundle_id").required(true))
                .arg(
                    Arg::new("suspended")
                        .long("suspended")
                        .action(ArgAction::SetTrue)
                        .help("Start the process suspended"),
                )
                .arg(
                    Arg::new("args")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .help("Arguments passed to the app"),
                ),
        )
        .subcommand(
            Command::new("kill")
                .about("Kill a process")
                .arg(Arg::new("pid").required(true).value_parser(value_parser!(u64))),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Uninstall an app")
                .arg(Arg::new("bundle_id").required(true)),
        )
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    match matches.subcommand() {
        Some(("list", sub)) => {
            let app_type = sub.get_one::<String>("type").map(String::as_str);
            let apps = device.installed_apps(app_type, None).await?;
            let mut ids: Vec<&String> = apps.keys().collect();
            ids.sort();
            for id in ids {
                println!("{id}");
            }
        }
        Some(("launch", sub)) => {
            let Some(bundle_id) = sub.get_one::<String>("bundle_id") else {
                return Err(IdeviceError::InvalidState("missing bundle id"));
            };
            let options = LaunchOptions {
                arguments: sub
                    .get_many::<String>("args")
                    .map(|a| a.cloned().collect())
                    .unwrap_or_default(),
                start_suspended: sub.get_flag("suspended"),
                kill_existing: true,
                ..Default::default()
            };
            let pid = device.app_launch(bundle_id, &options).await?;
            common::print_json(&serde_json::json!({ "bundle_id": bundle_id, "pid": pid }));
        }
        Some(("kill", sub)) => {
            let Some(pid) = sub.get_one::<u64>("pid") else {
                return Err(IdeviceError::InvalidState("missing pid"));
            };
            device.app_kill(*pid).await?;
        }
        Some(("uninstall", sub)) => {
            let Some(bundle_id) = sub.get_one::<String>("bundle_id") else {
                return Err(IdeviceError::InvalidState("missing bundle id"));
            };
            device.uninstall_app(bundle_id).await?;
            println!("Uninstalled {bundle_id}");
        }
        _ => return Err(IdeviceError::InvalidState("unknown apps subcommand")),
    }
    Ok(())
}
