// Lists attached devices, or follows attach and detach events

use clap::Command;
use iprobe::{Device, IdeviceError, ResultExt, usbmuxd::UsbmuxdDevice};

use crate::common;

pub fn list_command() -> Command {
    Command::new("list").about("List devices known to usbmuxd")
}

pub fn listen_command() -> Command {
    Command::new("listen").about("Print devices as they attach and detach, until Ctrl-C")
}

fn describe(d: &UsbmuxdDevice) -> String {
    format!("{} ({:?}, id {})", d.udid, d.connection_type, d.device_id)
}

pub async fn list() -> Result<(), IdeviceError> {
    let addr = common::usbmuxd_addr()?;
    let devices = Device::list_devices(&addr).await?;
    if devices.is_empty() {
        eprintln!("No devices attached");
    }
    for d in &devices {
        println!("{}", describe(d));
    }
    Ok(())
}

pub async fn listen() -> Result<(), IdeviceError> {
    let addr = common::usbmuxd_addr()?;
    let mux = addr.connect(0).await.context("connect to usbmuxd")?;
    let _handle = mux
        .watch(
            |d| println!("+ {}", describe(&d)),
            |id| println!("- device {id}"),
        )
        .await
        .context("listen for devices")?;
    tokio::signal::ctrl_c().await?;
    Ok(())
}
