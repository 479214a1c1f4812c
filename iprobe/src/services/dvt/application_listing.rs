//! Installed application listing over instruments

use plist::Dictionary;
use serde::{Deserialize, Serialize};

use super::{
    device_info::DecodedList,
    message::AuxValue,
    remote_server::{Channel, RemoteServerClient},
};
use crate::IdeviceError;

// the misspelling is the real service name
pub const SERVICE: &str = "com.apple.instruments.server.services.device.applictionListing";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    #[serde(rename = "CFBundleIdentifier")]
    pub bundle_id: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
    #[serde(rename = "ExecutableName", default)]
    pub executable_name: String,
    #[serde(rename = "BundlePath", default)]
    pub bundle_path: String,
    #[serde(rename = "Version", default)]
    pub version: String,
    #[serde(rename = "Type", default)]
    pub app_type: String,
    #[serde(rename = "Placeholder", default)]
    pub placeholder: bool,
    #[serde(rename = "Restricted", default)]
    pub restricted: i64,
    #[serde(rename = "ContainerBundleIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub container_bundle_id: Option<String>,
    #[serde(rename = "PluginIdentifier", default, skip_serializing_if = "Option::is_none")]
    pub plugin_identifier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ApplicationListingClient {
    channel: Channel,
}

impl ApplicationListingClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    /// Lists apps matching the given attributes; an empty dictionary matches all
    pub async fn installed_applications(
        &self,
        matching: Dictionary,
        update_token: &str,
    ) -> Result<DecodedList<Application>, IdeviceError> {
        let res = self
            .channel
            .call(
                "installedApplicationsMatching:registerUpdateToken:",
                vec![AuxValue::archived(matching)?, AuxValue::archived(update_token)?],
            )
            .await?;
        DecodedList::decode("application", &res)
    }
}
