// Developer disk image

use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError};

pub fn command() -> Command {
    Command::new("mount")
        .about("Mount the developer disk image, or list mounted images")
        .arg(
            Arg::new("list")
                .long("list")
                .short('l')
                .action(ArgAction::SetTrue)
                .help("Print signatures of mounted developer images"),
        )
        .arg(
            Arg::new("image")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("list")
                .help("Path to DeveloperDiskImage.dmg"),
        )
        .arg(
            Arg::new("signature")
                .value_parser(value_parser!(PathBuf))
                .required_unless_present("list")
                .help("Path to the image's .signature file"),
        )
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    if matches.get_flag("list") {
        for sig in device.images("Developer").await? {
            println!("{}", sig.iter().map(|b| format!("{b:02x}")).collect::<String>());
        }
        return Ok(());
    }
    let (Some(image), Some(signature)) = (
        matches.get_one::<PathBuf>("image"),
        matches.get_one::<PathBuf>("signature"),
    ) else {
        return Err(IdeviceError::InvalidState("image and signature are required"));
    };
    if device.mount_developer_disk_image(image, signature).await? {
        println!("Mounted");
    } else {
        println!("A developer image is already mounted");
    }
    Ok(())
}
