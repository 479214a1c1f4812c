//! Device info service client

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    remote_server::{Channel, RemoteServerClient},
    value::DtxValue,
};
use crate::IdeviceError;

pub const SERVICE: &str = "com.apple.instruments.server.services.deviceinfo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "realAppName", default)]
    pub real_app_name: String,
    #[serde(rename = "isApplication", default)]
    pub is_application: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "_deviceDescription", default)]
    pub description: String,
    #[serde(rename = "_deviceDisplayName", default)]
    pub display_name: String,
    #[serde(rename = "_deviceIdentifier", default)]
    pub identifier: String,
    #[serde(rename = "_deviceVersion", default)]
    pub version: String,
    #[serde(rename = "_productType", default)]
    pub product_type: String,
    #[serde(rename = "_productVersion", default)]
    pub product_version: String,
    #[serde(rename = "_xrdeviceClassName", default)]
    pub xrdevice_class_name: String,
}

/// Elements of a list reply that decoded, plus what went wrong with the rest
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedList<T> {
    pub items: Vec<T>,
    pub diagnostics: Vec<String>,
}

impl<T: serde::de::DeserializeOwned> DecodedList<T> {
    /// Decodes each element on its own, skipping the ones that fail
    pub fn decode(what: &str, value: &DtxValue) -> Result<Self, IdeviceError> {
        let mut list = Self {
            items: Vec::new(),
            diagnostics: Vec::new(),
        };
        for (i, element) in value.expect_array()?.iter().enumerate() {
            match element.decode::<T>() {
                Ok(item) => list.items.push(item),
                Err(e) => {
                    warn!("Skipping {what} #{i}: {e}");
                    list.diagnostics.push(format!("{what} #{i}: {e}"));
                }
            }
        }
        Ok(list)
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfoClient {
    channel: Channel,
}

impl DeviceInfoClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    pub async fn running_processes(&self) -> Result<DecodedList<Process>, IdeviceError> {
        let res = self.channel.call("runningProcesses", Vec::new()).await?;
        DecodedList::decode("process", &res)
    }

    pub async fn system_information(&self) -> Result<DeviceInfo, IdeviceError> {
        self.channel
            .call("systemInformation", Vec::new())
            .await?
            .decode()
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::services::dvt::remote_server::mock::pair;

    fn process(pid: Option<i64>, name: &str) -> DtxValue {
        let mut d = IndexMap::new();
        if let Some(pid) = pid {
            d.insert("pid".to_string(), DtxValue::from(pid));
        }
        d.insert("name".to_string(), DtxValue::from(name));
        d.insert("isApplication".to_string(), DtxValue::Bool(true));
        DtxValue::Dictionary(d)
    }

    #[test]
    fn bad_elements_become_diagnostics() {
        let list = DtxValue::Array(vec![
            process(Some(1), "launchd"),
            process(None, "broken"),
            DtxValue::from("junk"),
            process(Some(88), "MyApp"),
        ]);
        let decoded = DecodedList::<Process>::decode("process", &list).unwrap();
        assert_eq!(
            decoded.items.iter().map(|p| p.pid).collect::<Vec<_>>(),
            [1, 88]
        );
        assert_eq!(decoded.diagnostics.len(), 2);
        assert!(decoded.diagnostics[0].starts_with("process #1"));
    }

    #[test]
    fn non_list_reply_is_a_protocol_error() {
        assert!(matches!(
            DecodedList::<Process>::decode("process", &DtxValue::from(1i64)),
            Err(IdeviceError::UnexpectedValue { .. })
        ));
    }

    #[tokio::test]
    async fn running_processes_over_the_wire() {
        let (client, mut device) = pair();
        tokio::spawn(async move {
            let m = device.accept_channels().await.unwrap();
            assert_eq!(m.selector(), Some("runningProcesses"));
            let list = DtxValue::Array(vec![process(Some(42), "SpringBoard")]);
            device.reply(&m, Some(list)).await;
            device
        });
        let info = DeviceInfoClient::new(&client).await.unwrap();
        let procs = info.running_processes().await.unwrap();
        assert_eq!(procs.items[0].name, "SpringBoard");
        assert!(procs.items[0].is_application);
    }
}
