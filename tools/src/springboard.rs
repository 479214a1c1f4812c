// Home screen icons and orientation

use std::path::PathBuf;

use clap::{Arg, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError, ResultExt};

pub fn icon_command() -> Command {
    Command::new("icon")
        .about("Save the home screen icon of an app as PNG")
        .arg(Arg::new("bundle_id").required(true).help("Bundle id of the app"))
        .arg(
            Arg::new("output")
                .required(true)
                .value_parser(value_parser!(PathBuf))
                .help("Output path"),
        )
}

pub fn orientation_command() -> Command {
    Command::new("orientation").about("Print the interface orientation")
}

pub async fn icon(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    let (Some(bundle_id), Some(output)) = (
        matches.get_one::<String>("bundle_id"),
        matches.get_one::<PathBuf>("output"),
    ) else {
        return Err(IdeviceError::InvalidState("missing bundle id or output path"));
    };
    let png = device.icon_png_data(bundle_id).await?;
    tokio::fs::write(output, &png)
        .await
        .map_err(IdeviceError::from)
        .context("write icon")?;
    println!("Icon saved to: {}", output.display());
    Ok(())
}

pub async fn orientation(device: &Device) -> Result<(), IdeviceError> {
    println!("{:?}", device.interface_orientation().await?);
    Ok(())
}
