// Device identity, battery and process listing

use clap::{Arg, ArgAction, ArgMatches, Command};
use iprobe::{Device, IdeviceError};

use crate::common;

pub fn info_command() -> Command {
    Command::new("info")
        .about("Print lockdown values")
        .arg(Arg::new("domain").long("domain").short('d').help("Lockdown domain to read"))
        .arg(Arg::new("key").long("key").short('k').help("Single key to read"))
        .arg(
            Arg::new("instruments")
                .long("instruments")
                .action(ArgAction::SetTrue)
                .help("Ask the instruments server instead of lockdown"),
        )
}

pub fn battery_command() -> Command {
    Command::new("battery").about("Print battery state")
}

pub fn ps_command() -> Command {
    Command::new("ps").about("List running processes")
}

pub async fn info(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    if matches.get_flag("instruments") {
        common::print_json(&device.instruments_device_info().await?);
        return Ok(());
    }
    let domain = matches.get_one::<String>("domain").map(String::as_str);
    let key = matches.get_one::<String>("key").map(String::as_str);
    let value = device.get_value(domain, key).await?;
    println!("{}", iprobe::pretty_print_plist(&value));
    Ok(())
}

pub async fn battery(device: &Device) -> Result<(), IdeviceError> {
    let info = device.battery_info().await?;
    println!("{}", iprobe::pretty_print_dictionary(&info));
    Ok(())
}

pub async fn ps(device: &Device) -> Result<(), IdeviceError> {
    let list = device.running_processes().await?;
    for d in &list.diagnostics {
        tracing::warn!("Skipped a process entry: {d}");
    }
    println!("{:>7}  {:<3}  NAME", "PID", "APP");
    for p in &list.items {
        let app = if p.is_application { "yes" } else { "" };
        println!("{:>7}  {:<3}  {}", p.pid, app, p.name);
    }
    Ok(())
}
