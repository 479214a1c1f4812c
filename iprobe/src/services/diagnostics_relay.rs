//! diagnostics_relay service client
//!
//! Reads the IO registry and restarts or powers off the device.

use plist::Dictionary;
use tracing::warn;

use crate::{Idevice, IdeviceError, IdeviceService};

/// Registry class of the battery power source
pub const POWER_SOURCE_CLASS: &str = "IOPMPowerSource";

/// Power source keys copied into battery info as they are
const BATTERY_KEYS: [&str; 10] = [
    "Serial",
    "CurrentCapacity",
    "CycleCount",
    "AbsoluteCapacity",
    "NominalChargeCapacity",
    "DesignCapacity",
    "Voltage",
    "BootVoltage",
    "InstantAmperage",
    "Temperature",
];

#[derive(Debug)]
pub struct DiagnosticsRelayClient {
    idevice: Idevice,
}

impl IdeviceService for DiagnosticsRelayClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.diagnostics_relay"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl DiagnosticsRelayClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Sends `req` and checks the reply carries `Status: Success`
    async fn request(&mut self, req: Dictionary) -> Result<Dictionary, IdeviceError> {
        self.idevice.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.idevice.read_plist().await?;
        match res.get("Status").and_then(|s| s.as_string()) {
            Some("Success") => Ok(res),
            other => {
                warn!("Diagnostics relay answered with status {other:?}");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Reads an IO registry entry, filtered by plane, name and class
    ///
    /// # Returns
    /// `None` when the device finds nothing matching.
    pub async fn io_registry(
        &mut self,
        plane: Option<&str>,
        name: Option<&str>,
        class: Option<&str>,
    ) -> Result<Option<Dictionary>, IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("Request".into(), "IORegistry".into());
        for (key, value) in [("CurrentPlane", plane), ("EntryName", name), ("EntryClass", class)] {
            if let Some(v) = value {
                req.insert(key.into(), v.into());
            }
        }
        let mut res = self.request(req).await?;
        Ok(res
            .remove("Diagnostics")
            .and_then(|d| d.into_dictionary())
            .and_then(|mut d| d.remove("IORegistry"))
            .and_then(|r| r.into_dictionary()))
    }

    /// The battery power source entry
    pub async fn power_source(&mut self) -> Result<Option<Dictionary>, IdeviceError> {
        self.io_registry(None, None, Some(POWER_SOURCE_CLASS)).await
    }

    /// Restarts the device
    pub async fn restart(&mut self) -> Result<(), IdeviceError> {
        self.action("Restart").await
    }

    /// Powers the device off
    pub async fn shutdown(&mut self) -> Result<(), IdeviceError> {
        self.action("Shutdown").await
    }

    pub async fn goodbye(&mut self) -> Result<(), IdeviceError> {
        self.action("Goodbye").await
    }

    async fn action(&mut self, name: &str) -> Result<(), IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("Request".into(), name.into());
        self.request(req).await.map(|_| ())
    }
}

/// Picks the battery fields out of a power source entry
///
/// `AdapterDetails.Voltage` and `AdapterDetails.Watts` are flattened to
/// `AdapterDetailsVoltage` and `AdapterDetailsWatts`. Missing fields are skipped.
pub fn battery_fields(power_source: &Dictionary) -> Dictionary {
    let mut out = Dictionary::new();
    for key in BATTERY_KEYS {
        if let Some(v) = power_source.get(key) {
            out.insert(key.into(), v.clone());
        }
    }
    if let Some(adapter) = power_source
        .get("AdapterDetails")
        .and_then(|a| a.as_dictionary())
    {
        for (from, to) in [("Voltage", "AdapterDetailsVoltage"), ("Watts", "AdapterDetailsWatts")] {
            if let Some(v) = adapter.get(from) {
                out.insert(to.into(), v.clone());
            }
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Arc, Mutex};

    use tokio::io::DuplexStream;

    use crate::test_util::{read_frame, write_frame};

    /// Answers diagnostics relay requests until the peer hangs up, logging each request name
    pub async fn serve(mut stream: DuplexStream, log: Arc<Mutex<Vec<String>>>) {
        while let Some(req) = read_frame(&mut stream).await {
            let name = req
                .get("Request")
                .and_then(|r| r.as_string())
                .unwrap_or_default()
                .to_string();
            let mut res = plist::Dictionary::new();
            res.insert("Status".into(), "Success".into());
            if name == "IORegistry" {
                let mut adapter = plist::Dictionary::new();
                adapter.insert("Voltage".into(), 5000.into());
                adapter.insert("Watts".into(), 12.into());
                let mut registry = plist::Dictionary::new();
                registry.insert("CycleCount".into(), 312.into());
                registry.insert("DesignCapacity".into(), 3279.into());
                registry.insert("Temperature".into(), 2950.into());
                registry.insert("AdapterDetails".into(), adapter.into());
                registry.insert("IsCharging".into(), true.into());
                let mut diagnostics = plist::Dictionary::new();
                diagnostics.insert("IORegistry".into(), registry.into());
                res.insert("Diagnostics".into(), diagnostics.into());
            }
            log.lock().unwrap().push(name);
            write_frame(&mut stream, res).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{read_frame, write_frame};

    #[tokio::test]
    async fn power_source_filters_by_class() {
        let (a, mut b) = tokio::io::duplex(8192);
        let device = tokio::spawn(async move {
            let req = read_frame(&mut b).await.unwrap();
            assert_eq!(
                req.get("EntryClass").and_then(|v| v.as_string()),
                Some(POWER_SOURCE_CLASS)
            );
            assert!(req.get("CurrentPlane").is_none());
            let mut res = Dictionary::new();
            res.insert("Status".into(), "Success".into());
            res.insert("Diagnostics".into(), Dictionary::new().into());
            write_frame(&mut b, res).await;
            b
        });

        let mut client = DiagnosticsRelayClient::new(Idevice::new(Box::new(a), "test"));
        assert_eq!(client.power_source().await.unwrap(), None);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn failed_status_is_an_error() {
        let (a, mut b) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            read_frame(&mut b).await.unwrap();
            let mut res = Dictionary::new();
            res.insert("Status".into(), "Failure".into());
            write_frame(&mut b, res).await;
            b
        });

        let mut client = DiagnosticsRelayClient::new(Idevice::new(Box::new(a), "test"));
        assert!(matches!(
            client.restart().await,
            Err(IdeviceError::UnexpectedResponse)
        ));
    }

    #[test]
    fn adapter_details_are_flattened() {
        let mut adapter = Dictionary::new();
        adapter.insert("Voltage".into(), 9000.into());
        adapter.insert("Watts".into(), 20.into());
        let mut source = Dictionary::new();
        source.insert("CycleCount".into(), 7.into());
        source.insert("AdapterDetails".into(), adapter.into());
        source.insert("ExternalConnected".into(), true.into());

        let fields = battery_fields(&source);
        assert_eq!(fields.len(), 3);
        assert_eq!(fields.get("CycleCount").and_then(|v| v.as_signed_integer()), Some(7));
        assert_eq!(
            fields.get("AdapterDetailsVoltage").and_then(|v| v.as_signed_integer()),
            Some(9000)
        );
        assert_eq!(
            fields.get("AdapterDetailsWatts").and_then(|v| v.as_signed_integer()),
            Some(20)
        );
    }
}
