// Restart and power off

use clap::Command;
use iprobe::{Device, IdeviceError};

pub fn reboot_command() -> Command {
    Command::new("reboot").about("Restart the device")
}

pub fn shutdown_command() -> Command {
    Command::new("shutdown").about("Power the device off")
}

pub async fn reboot(device: &Device) -> Result<(), IdeviceError> {
    device.reboot().await?;
    println!("Restarting {}", device.udid());
    Ok(())
}

pub async fn shutdown(device: &Device) -> Result<(), IdeviceError> {
    device.shutdown().await?;
    println!("Shutting down {}", device.udid());
    Ok(())
}
