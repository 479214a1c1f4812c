// Helpers shared by the subcommands

use clap::ArgMatches;
use iprobe::{Device, IdeviceError, ResultExt, usbmuxd::UsbmuxdAddr};

/// Opens the device named by `--udid`, or the first one usbmuxd reports
pub async fn open_device(matches: &ArgMatches) -> Result<Device, IdeviceError> {
    let addr = usbmuxd_addr()?;
    let udid = matches.get_one::<String>("udid").map(String::as_str);
    let label = matches
        .get_one::<String>("label")
        .map(String::as_str)
        .unwrap_or("iprobe");
    Device::connect(addr, udid, label).await
}

pub fn usbmuxd_addr() -> Result<UsbmuxdAddr, IdeviceError> {
    UsbmuxdAddr::from_env_var()
        .map_err(IdeviceError::from)
        .context("read USBMUXD_SOCKET_ADDRESS")
}

/// Prints an error with every cause below it
pub fn print_error(e: &IdeviceError) {
    eprintln!("error: {e}");
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Unable to serialize output: {e}"),
    }
}
