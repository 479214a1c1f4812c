// Simulated location

use clap::{Arg, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError};

pub fn command() -> Command {
    Command::new("location")
        .about("Simulate the device location")
        .subcommand_required(true)
        .subcommand(
            Command::new("set")
                .about("Pin the location to a WGS84 coordinate")
                .arg(
                    Arg::new("latitude")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    Arg::new("longitude")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                ),
        )
        .subcommand(Command::new("clear").about("Go back to the real location"))
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    match matches.subcommand() {
        Some(("set", sub)) => {
            let (Some(lat), Some(lon)) = (
                sub.get_one::<f64>("latitude"),
                sub.get_one::<f64>("longitude"),
            ) else {
                return Err(IdeviceError::InvalidState("missing coordinate"));
            };
            device.simulate_location_update(*lon, *lat).await?;
            println!("Location set to {lat}, {lon}");
        }
        Some(("clear", _)) => {
            device.simulate_location_recover().await?;
            println!("Location cleared");
        }
        _ => return Err(IdeviceError::InvalidState("unknown location subcommand")),
    }
    Ok(())
}
