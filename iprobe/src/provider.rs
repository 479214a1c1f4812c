//! Sources of device connections
//!
//! Everything above the transport asks a provider for a stream to a device port and for
//! the pairing record of that device, so the façades never touch usbmuxd directly.

use std::{future::Future, pin::Pin};

use crate::{Idevice, IdeviceError, pairing_file::PairingFile, usbmuxd::UsbmuxdAddr};

/// A provider for connecting to one iOS device
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a stream to `port` on the device
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send + '_>>;

    fn label(&self) -> &str;

    /// Fetches the pairing record that authenticates this host to the device
    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, IdeviceError>> + Send + '_>>;

    fn udid(&self) -> &str;
}

/// Connects through the usbmuxd daemon
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl IdeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send + '_>> {
        Box::pin(async move {
            let usbmuxd = self.addr.connect(self.tag).await?;
            usbmuxd
                .connect_to_device(self.device_id, port, &self.label)
                .await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, IdeviceError>> + Send + '_>> {
        Box::pin(async move {
            let mut usbmuxd = self.addr.connect(self.tag).await?;
            usbmuxd.get_pair_record(&self.udid).await
        })
    }

    fn udid(&self) -> &str {
        &self.udid
    }
}
