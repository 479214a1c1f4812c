use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "ProductID")]
    pub product_id: Option<u32>,
}

impl DeviceListResponse {
    pub fn into_usbmuxd_dev(self) -> Result<UsbmuxdDevice, IdeviceError> {
        self.try_into()
    }
}

fn ipv6_at(addr: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// Decodes the sockaddr blob usbmuxd reports for network devices
fn decode_network_address(addr: &[u8]) -> Result<Connection, IdeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(IdeviceError::UnexpectedResponse);
    }

    Ok(match addr[0] {
        // sockaddr_in
        0x02 => Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        // bare AF_INET6 family byte
        0x1E => {
            if addr.len() < 24 {
                warn!("IPv6 address is less than 24 bytes");
                return Err(IdeviceError::UnexpectedResponse);
            }
            Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
        }
        // BSD sockaddr_in6, length byte first
        0x1C => {
            if addr.len() < 24 {
                warn!("IPv6 sockaddr_in6 data too short (len {})", addr.len());
                return Err(IdeviceError::UnexpectedResponse);
            }
            if addr[1] == 0x1E {
                Connection::Network(IpAddr::V6(ipv6_at(addr, 8)))
            } else {
                warn!("Expected IPv6 family but got {:02X}", addr[1]);
                Connection::Unknown(format!("Network {:02X}", addr[1]))
            }
        }
        other => {
            warn!("Unknown IP address protocol: {other:02X}");
            Connection::Unknown(format!("Network {other:02X}"))
        }
    })
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = IdeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "Network" => match dev.properties.network_address {
                Some(addr) => decode_network_address(&Vec::<u8>::from(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            },
            "USB" => Connection::Usb,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
            product_id: dev.properties.product_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_network_address() {
        let addr = [0x02, 0, 0, 0, 192, 168, 1, 20];
        assert_eq!(
            decode_network_address(&addr).unwrap(),
            Connection::Network(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
    }

    #[test]
    fn sockaddr_in6_address() {
        let mut addr = vec![0x1C, 0x1E, 0, 0, 0, 0, 0, 0];
        addr.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        addr.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(
            decode_network_address(&addr).unwrap(),
            Connection::Network(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
    }

    #[test]
    fn short_address_is_rejected() {
        assert!(decode_network_address(&[0x02, 0]).is_err());
    }
}
