// Inspect, drive and profile iOS devices from the command line

use std::process::ExitCode;

use clap::{Arg, ArgMatches, Command};
use iprobe::{Device, IdeviceError};
use tracing_subscriber::EnvFilter;

mod apps;
mod common;
mod devices;
mod info;
mod location;
mod mount;
mod pcap;
mod perf;
mod power;
mod screenshot;
mod springboard;
mod syslog_relay;

fn cli() -> Command {
    Command::new("iprobe")
        .about("Inspect, drive and profile iOS devices")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("udid")
                .long("udid")
                .short('u')
                .global(true)
                .value_name("UDID")
                .help("UDID of the device; the first attached device when omitted"),
        )
        .arg(
            Arg::new("label")
                .long("label")
                .global(true)
                .value_name("LABEL")
                .default_value("iprobe")
                .help("Client label sent to usbmuxd and lockdown"),
        )
        .subcommand(devices::list_command())
        .subcommand(devices::listen_command())
        .subcommand(info::info_command())
        .subcommand(info::battery_command())
        .subcommand(info::ps_command())
        .subcommand(mount::command())
        .subcommand(apps::command())
        .subcommand(screenshot::command())
        .subcommand(perf::command())
        .subcommand(syslog_relay::command())
        .subcommand(pcap::command())
        .subcommand(location::command())
        .subcommand(springboard::icon_command())
        .subcommand(springboard::orientation_command())
        .subcommand(power::reboot_command())
        .subcommand(power::shutdown_command())
}

async fn run_on_device(
    name: &str,
    sub: &ArgMatches,
    device: &Device,
) -> Result<(), IdeviceError> {
    match name {
        "info" => info::info(sub, device).await,
        "battery" => info::battery(device).await,
        "ps" => info::ps(device).await,
        "mount" => mount::main(sub, device).await,
        "apps" => apps::main(sub, device).await,
        "screenshot" => screenshot::main(sub, device).await,
        "perf" => perf::main(sub, device).await,
        "syslog" => syslog_relay::main(device).await,
        "pcap" => pcap::main(sub, device).await,
        "location" => location::main(sub, device).await,
        "icon" => springboard::icon(sub, device).await,
        "orientation" => springboard::orientation(device).await,
        "reboot" => power::reboot(device).await,
        "shutdown" => power::shutdown(device).await,
        _ => Err(IdeviceError::InvalidState("unknown subcommand")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let res = match matches.subcommand() {
        Some(("list", _)) => devices::list().await,
        Some(("listen", _)) => devices::listen().await,
        Some((name, sub)) => match common::open_device(sub).await {
            Ok(device) => {
                let res = run_on_device(name, sub, &device).await;
                device.close().await;
                res
            }
            Err(e) => Err(e),
        },
        None => Ok(()),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            common::print_error(&e);
            ExitCode::FAILURE
        }
    }
}
