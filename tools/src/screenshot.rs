// Screen capture

use std::path::PathBuf;

use clap::{Arg, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError, ResultExt};

pub fn command() -> Command {
    Command::new("screenshot")
        .about("Take a screenshot")
        .arg(
            Arg::new("output")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Output path"),
        )
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    let Some(output) = matches.get_one::<PathBuf>("output") else {
        return Err(IdeviceError::InvalidState("missing output path"));
    };
    let image = device.screenshot().await?;
    tokio::fs::write(output, &image)
        .await
        .map_err(IdeviceError::from)
        .context("write screenshot")?;
    println!("Screenshot saved to: {}", output.display());
    Ok(())
}
