//! springboardservices client: app icons and screen orientation

use plist::Dictionary;
use serde::Serialize;

use crate::{Idevice, IdeviceError, IdeviceService};

/// Orientation of the home screen interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InterfaceOrientation {
    Unknown,
    Portrait,
    PortraitUpsideDown,
    LandscapeRight,
    LandscapeLeft,
}

impl From<u64> for InterfaceOrientation {
    fn from(value: u64) -> Self {
        match value {
            1 => Self::Portrait,
            2 => Self::PortraitUpsideDown,
            3 => Self::LandscapeRight,
            4 => Self::LandscapeLeft,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug)]
pub struct SpringBoardServicesClient {
    idevice: Idevice,
}

impl IdeviceService for SpringBoardServicesClient {
    fn service_name() -> &'static str {
        "com.apple.springboardservices"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl SpringBoardServicesClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn command(&mut self, mut req: Dictionary, command: &str) -> Result<Dictionary, IdeviceError> {
        req.insert("command".into(), command.into());
        self.idevice.send_plist(plist::Value::Dictionary(req)).await?;
        self.idevice.read_plist().await
    }

    /// PNG bytes of the home screen icon of `bundle_id`
    pub async fn icon_png_data(&mut self, bundle_id: &str) -> Result<Vec<u8>, IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("bundleId".into(), bundle_id.into());
        let mut res = self.command(req, "getIconPNGData").await?;
        match res.remove("pngData") {
            Some(plist::Value::Data(png)) => Ok(png),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    pub async fn interface_orientation(&mut self) -> Result<InterfaceOrientation, IdeviceError> {
        let res = self
            .command(Dictionary::new(), "getInterfaceOrientation")
            .await?;
        res.get("interfaceOrientation")
            .and_then(|o| o.as_unsigned_integer())
            .map(InterfaceOrientation::from)
            .ok_or(IdeviceError::UnexpectedResponse)
    }
}
