// Relay system logs

use clap::Command;
use iprobe::{Device, IdeviceError};

pub fn command() -> Command {
    Command::new("syslog").about("Relay system logs until Ctrl-C")
}

pub async fn main(device: &Device) -> Result<(), IdeviceError> {
    let mut lines = device.syslog().await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => println!("{line}"),
                None => {
                    tracing::warn!("Syslog stream ended");
                    break;
                }
            },
            _ = &mut ctrl_c => break,
        }
    }
    device.syslog_stop().await;
    Ok(())
}
