//! screenshotr service client
//!
//! Speaks the DeviceLink message convention: every message is a binary plist array whose
//! first element names the message.

use crate::{Idevice, IdeviceError, IdeviceService};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ScreenshotService {
    idevice: Idevice,
}

impl IdeviceService for ScreenshotService {
    fn service_name() -> &'static str {
        "com.apple.mobile.screenshotr"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        let mut client = Self::new(idevice);
        client.dl_version_exchange().await?;
        Ok(client)
    }
}

impl ScreenshotService {
    pub const DEVICE_LINK_VERSION: u64 = 400;

    /// Wraps a connection that has not done the version exchange yet
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn dl_version_exchange(&mut self) -> Result<(), IdeviceError> {
        debug!("Starting DeviceLink version exchange");
        let (msg, _) = self.receive_dl_message().await?;
        if msg != "DLMessageVersionExchange" {
            warn!("Expected DLMessageVersionExchange, got {msg}");
            return Err(IdeviceError::UnexpectedResponse);
        }

        self.send_dl_array(vec![
            "DLMessageVersionExchange".into(),
            "DLVersionsOk".into(),
            Self::DEVICE_LINK_VERSION.into(),
        ])
        .await?;

        let (msg, _) = self.receive_dl_message().await?;
        if msg != "DLMessageDeviceReady" {
            warn!("Expected DLMessageDeviceReady, got {msg}");
            return Err(IdeviceError::UnexpectedResponse);
        }
        Ok(())
    }

    async fn send_dl_array(&mut self, array: Vec<plist::Value>) -> Result<(), IdeviceError> {
        self.idevice.send_bplist(plist::Value::Array(array)).await
    }

    /// Receives one DeviceLink message as (name, elements)
    async fn receive_dl_message(&mut self) -> Result<(String, Vec<plist::Value>), IdeviceError> {
        match self.idevice.read_plist_value().await? {
            plist::Value::Array(arr) => match arr.first().and_then(|t| t.as_string()) {
                Some(tag) => Ok((tag.to_string(), arr)),
                None => {
                    warn!("DeviceLink message without a name");
                    Err(IdeviceError::UnexpectedResponse)
                }
            },
            _ => {
                warn!("DeviceLink message is not an array");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Captures the screen, returning the encoded image bytes as the device sent them
    pub async fn take_screenshot(&mut self) -> Result<Vec<u8>, IdeviceError> {
        let mut request = plist::Dictionary::new();
        request.insert("MessageType".into(), "ScreenShotRequest".into());
        self.send_dl_array(vec!["DLMessageProcessMessage".into(), request.into()])
            .await?;

        let (msg, mut arr) = self.receive_dl_message().await?;
        if msg != "DLMessageProcessMessage" {
            warn!("Expected DLMessageProcessMessage, got {msg}");
            return Err(IdeviceError::UnexpectedResponse);
        }
        match arr.get_mut(1).and_then(|d| d.as_dictionary_mut()) {
            Some(dict) => match dict.remove("ScreenShotData") {
                Some(plist::Value::Data(data)) => Ok(data),
                _ => {
                    warn!("Reply has no ScreenShotData");
                    Err(IdeviceError::UnexpectedResponse)
                }
            },
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn write_bplist(stream: &mut tokio::io::DuplexStream, value: plist::Value) {
        let mut buf = Vec::new();
        value.to_writer_binary(&mut buf).unwrap();
        stream.write_all(&(buf.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    async fn read_value(stream: &mut tokio::io::DuplexStream) -> plist::Value {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut buf = vec![0; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut buf).await.unwrap();
        plist::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn handshake_then_capture() {
        let (a, mut b) = tokio::io::duplex(8192);
        let device = tokio::spawn(async move {
            write_bplist(
                &mut b,
                vec![plist::Value::from("DLMessageVersionExchange"), 300.into(), 0.into()].into(),
            )
            .await;
            let ok = read_value(&mut b).await;
            assert_eq!(
                ok.as_array().unwrap()[2].as_unsigned_integer(),
                Some(ScreenshotService::DEVICE_LINK_VERSION)
            );
            write_bplist(&mut b, vec![plist::Value::from("DLMessageDeviceReady")].into()).await;

            let req = read_value(&mut b).await;
            let dict = req.as_array().unwrap()[1].as_dictionary().unwrap().clone();
            assert_eq!(
                dict.get("MessageType").and_then(|v| v.as_string()),
                Some("ScreenShotRequest")
            );
            let mut reply = plist::Dictionary::new();
            reply.insert("ScreenShotData".into(), plist::Value::Data(b"\x89PNG".to_vec()));
            write_bplist(
                &mut b,
                vec![plist::Value::from("DLMessageProcessMessage"), reply.into()].into(),
            )
            .await;
        });

        let mut service = ScreenshotService::from_stream(Idevice::new(Box::new(a), "test"))
            .await
            .unwrap();
        assert_eq!(service.take_screenshot().await.unwrap(), b"\x89PNG");
        device.await.unwrap();
    }
}
