//! simulatelocation service client
//!
//! Each message is a big-endian u32 command. `set` follows it with the latitude and
//! longitude as length-prefixed decimal strings. The device does not answer.

use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService};

const SET: u32 = 0;
const CLEAR: u32 = 1;

#[derive(Debug)]
pub struct LocationSimulationService {
    idevice: Idevice,
}

impl IdeviceService for LocationSimulationService {
    fn service_name() -> &'static str {
        "com.apple.dt.simulatelocation"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl LocationSimulationService {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Pins the device location to a WGS84 coordinate
    pub async fn set(&mut self, latitude: f64, longitude: f64) -> Result<(), IdeviceError> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(IdeviceError::InvalidState("coordinate out of range"));
        }
        debug!("Simulating location {latitude}, {longitude}");
        let mut data = SET.to_be_bytes().to_vec();
        for part in [latitude.to_string(), longitude.to_string()] {
            data.extend_from_slice(&(part.len() as u32).to_be_bytes());
            data.extend_from_slice(part.as_bytes());
        }
        self.idevice.send_raw(&data).await
    }

    /// Returns the device to its real location
    pub async fn clear(&mut self) -> Result<(), IdeviceError> {
        self.idevice.send_raw(&CLEAR.to_be_bytes()).await
    }
}
