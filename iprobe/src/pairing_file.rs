//! Pairing records
//!
//! A pairing record holds the host identity the device trusts. It is produced by pairing
//! (outside this crate) and stored by usbmuxd, which hands it out per device UDID.

use std::path::Path;

use plist::Data;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::IdeviceError;

/// A pairing record with its PEM-encoded credentials
#[derive(Clone, Debug, PartialEq)]
pub struct PairingFile {
    /// Device certificate, PEM
    pub device_certificate: Vec<u8>,
    /// Host private key, PEM
    pub host_private_key: Vec<u8>,
    /// Host certificate, PEM
    pub host_certificate: Vec<u8>,
    /// Root CA certificate, PEM
    pub root_certificate: Vec<u8>,
    pub root_private_key: Option<Vec<u8>>,
    /// System Build Unique Identifier of the host
    pub system_buid: String,
    pub host_id: String,
    /// Escrow bag allowing access while the device is locked
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_certificate: Data,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    root_private_key: Option<Data>,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(
        rename = "WiFiMACAddress",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record from plist bytes (XML or binary)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r.try_into(),
            Err(e) => {
                warn!("Unable to parse pairing record: {e:?}");
                Err(IdeviceError::InvalidPairingFile)
            }
        }
    }

    /// Parses a pairing record from a plist value
    pub fn from_value(v: &plist::Value) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        raw.try_into()
    }

    /// Serializes the record to XML plist bytes
    pub fn serialize(&self) -> Result<Vec<u8>, IdeviceError> {
        let raw = RawPairingFile::from(self.clone());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = IdeviceError;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        if value.host_id.is_empty() || value.system_buid.is_empty() {
            warn!("Pairing record has no host id or system BUID");
            return Err(IdeviceError::InvalidPairingFile);
        }
        Ok(Self {
            device_certificate: value.device_certificate.into(),
            host_private_key: value.host_private_key.into(),
            host_certificate: value.host_certificate.into(),
            root_certificate: value.root_certificate.into(),
            root_private_key: value.root_private_key.map(Into::into),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

impl From<PairingFile> for RawPairingFile {
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_certificate: Data::new(value.root_certificate),
            root_private_key: value.root_private_key.map(Data::new),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Data::new),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_pairing_file() -> PairingFile {
    PairingFile {
        device_certificate: b"device".to_vec(),
        host_private_key: b"key".to_vec(),
        host_certificate: b"host".to_vec(),
        root_certificate: b"root".to_vec(),
        root_private_key: None,
        system_buid: "BUID-1".into(),
        host_id: "HOST-1".into(),
        escrow_bag: Some(vec![1, 2, 3]),
        wifi_mac_address: None,
        udid: Some("00008030-TEST".into()),
    }
}
