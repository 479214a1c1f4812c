//! Typed instruments calls
//!
//! Wraps one [`RemoteServerClient`] and opens the per-service channels on demand. Each
//! channel is opened once per connection, so repeated calls cost one round trip.

use indexmap::IndexMap;
use plist::Dictionary;
use tracing::{debug, info};

use super::{
    application_listing::{Application, ApplicationListingClient},
    device_info::{DecodedList, DeviceInfo, DeviceInfoClient, Process},
    graphics::{GraphicsClient, GraphicsInfo},
    networking::NetworkingClient,
    process_control::{LaunchOptions, ProcessControlClient},
    remote_server::RemoteServerClient,
    sysmontap::SysmontapClient,
    value::DtxValue,
};
use crate::{
    IdeviceError,
    lockdown::{LockdownClient, major_version},
    provider::IdeviceProvider,
};

pub const LEGACY_SERVICE: &str = "com.apple.instruments.remoteserver";
pub const SECURE_SERVICE: &str = "com.apple.instruments.remoteserver.DVTSecureSocketProxy";

/// Lockdown name of the instruments server for an iOS version
pub fn service_name_for(product_version: &str) -> &'static str {
    match major_version(product_version) {
        Some(major) if major >= 14 => SECURE_SERVICE,
        _ => LEGACY_SERVICE,
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentsClient {
    client: RemoteServerClient,
    capabilities: IndexMap<String, DtxValue>,
}

impl InstrumentsClient {
    /// Starts the instruments server and exchanges capabilities
    pub async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let mut lockdown = LockdownClient::connect(provider).await?;
        lockdown.handshake_with(provider).await?;
        let version = lockdown.product_version().await?;
        let name = service_name_for(&version);
        debug!("Using {name} for iOS {version}");

        let descriptor = lockdown.start_service(name).await?;
        let pairing_file = lockdown
            .pairing_file()
            .ok_or(IdeviceError::InvalidState("lockdown handshake required"))?;
        let idevice = descriptor.connect(provider, pairing_file).await?;

        let mut instruments = Self::new(RemoteServerClient::new(idevice)?);
        instruments.handshake().await?;
        Ok(instruments)
    }

    /// Wraps a connected client without the capabilities exchange
    pub fn new(client: RemoteServerClient) -> Self {
        Self {
            client,
            capabilities: IndexMap::new(),
        }
    }

    pub async fn handshake(&mut self) -> Result<(), IdeviceError> {
        self.capabilities = self.client.notify_of_published_capabilities().await?;
        debug!("Device published {} capabilities", self.capabilities.len());
        Ok(())
    }

    pub fn remote(&self) -> &RemoteServerClient {
        &self.client
    }

    pub fn capabilities(&self) -> &IndexMap<String, DtxValue> {
        &self.capabilities
    }

    pub async fn process_control(&self) -> Result<ProcessControlClient, IdeviceError> {
        ProcessControlClient::new(&self.client).await
    }

    pub async fn sysmontap(&self) -> Result<SysmontapClient, IdeviceError> {
        SysmontapClient::new(&self.client).await
    }

    pub async fn graphics(&self) -> Result<GraphicsClient, IdeviceError> {
        GraphicsClient::new(&self.client).await
    }

    pub async fn networking(&self) -> Result<NetworkingClient, IdeviceError> {
        NetworkingClient::new(&self.client).await
    }

    pub async fn app_launch(
        &self,
        bundle_id: &str,
        options: &LaunchOptions,
    ) -> Result<u64, IdeviceError> {
        let pid = self.process_control().await?.launch_app(bundle_id, options).await?;
        info!("Launched {bundle_id} as {pid}");
        Ok(pid)
    }

    pub async fn app_kill(&self, pid: u64) -> Result<(), IdeviceError> {
        self.process_control().await?.kill_app(pid).await
    }

    pub async fn start_observing(&self, pid: u64) -> Result<(), IdeviceError> {
        self.process_control().await?.start_observing(pid).await
    }

    pub async fn disable_memory_limit(&self, pid: u64) -> Result<(), IdeviceError> {
        self.process_control().await?.disable_memory_limit(pid).await
    }

    pub async fn list_running_processes(&self) -> Result<DecodedList<Process>, IdeviceError> {
        DeviceInfoClient::new(&self.client)
            .await?
            .running_processes()
            .await
    }

    pub async fn list_installed_apps(&self) -> Result<DecodedList<Application>, IdeviceError> {
        ApplicationListingClient::new(&self.client)
            .await?
            .installed_applications(Dictionary::new(), "")
            .await
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, IdeviceError> {
        DeviceInfoClient::new(&self.client)
            .await?
            .system_information()
            .await
    }

    pub async fn graphics_info(&self) -> Result<GraphicsInfo, IdeviceError> {
        self.graphics().await?.system_information().await
    }

    /// Finds the pid of a running app by its executable name
    ///
    /// The app list and process list are fetched separately, so the answer can be stale.
    pub async fn get_pid_by_bundle_id(&self, bundle_id: &str) -> Result<u64, IdeviceError> {
        let apps = self.list_installed_apps().await?;
        let executable = apps
            .items
            .iter()
            .find(|a| a.bundle_id == bundle_id)
            .map(|a| a.executable_name.as_str())
            .filter(|e| !e.is_empty())
            .ok_or_else(|| IdeviceError::AppNotInstalled(bundle_id.to_string()))?;

        self.list_running_processes()
            .await?
            .items
            .iter()
            .find(|p| p.name == executable)
            .map(|p| p.pid)
            .ok_or_else(|| IdeviceError::ProcessNotRunning(bundle_id.to_string()))
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::dvt::remote_server::mock::{MockDtx, pair};

    fn dict(entries: &[(&str, DtxValue)]) -> DtxValue {
        DtxValue::Dictionary(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    async fn serve_lists(mut device: MockDtx) {
        while let Some(m) = device.accept_channels().await {
            let res = match m.selector() {
                Some("installedApplicationsMatching:registerUpdateToken:") => {
                    DtxValue::Array(vec![
                        dict(&[
                            ("CFBundleIdentifier", "com.example.app".into()),
                            ("ExecutableName", "Example".into()),
                        ]),
                        dict(&[
                            ("CFBundleIdentifier", "com.example.idle".into()),
                            ("ExecutableName", "Idle".into()),
                        ]),
                    ])
                }
                Some("runningProcesses") => DtxValue::Array(vec![
                    dict(&[("pid", 1i64.into()), ("name", "launchd".into())]),
                    dict(&[("pid", 4242i64.into()), ("name", "Example".into())]),
                ]),
                other => panic!("unexpected selector {other:?}"),
            };
            device.reply(&m, Some(res)).await;
        }
    }

    #[test]
    fn picks_service_by_version() {
        assert_eq!(service_name_for("13.7"), LEGACY_SERVICE);
        assert_eq!(service_name_for("14.0"), SECURE_SERVICE);
        assert_eq!(service_name_for("17.2.1"), SECURE_SERVICE);
        assert_eq!(service_name_for("garbage"), LEGACY_SERVICE);
    }

    #[tokio::test]
    async fn pid_lookup_distinguishes_missing_from_stopped() {
        let (client, device) = pair();
        tokio::spawn(serve_lists(device));
        let instruments = InstrumentsClient::new(client);

        assert_eq!(
            instruments.get_pid_by_bundle_id("com.example.app").await.unwrap(),
            4242
        );
        assert!(matches!(
            instruments.get_pid_by_bundle_id("com.example.idle").await,
            Err(IdeviceError::ProcessNotRunning(_))
        ));
        assert!(matches!(
            instruments.get_pid_by_bundle_id("com.example.none").await,
            Err(IdeviceError::AppNotInstalled(_))
        ));
    }

    #[tokio::test]
    async fn connect_through_lockdown() {
        use crate::services::dvt::message::AuxValue;
        use crate::test_util::{INSTRUMENTS_PORT, MockProvider};

        let provider = MockProvider::new(|port, stream| {
            assert_eq!(port, INSTRUMENTS_PORT);
            tokio::spawn(async move {
                let mut device = MockDtx::new(stream);
                let m = device.recv().await.unwrap();
                assert_eq!(m.selector(), Some("_notifyOfPublishedCapabilities:"));
                let mut caps = plist::Dictionary::new();
                caps.insert("com.apple.instruments.server.services.deviceinfo".into(), 1.into());
                let notify = crate::services::dvt::message::Message::invocation(
                    1,
                    0,
                    "_notifyOfPublishedCapabilities:",
                    vec![AuxValue::archived(caps).unwrap()],
                    false,
                );
                device.send(&notify).await;
                serve_lists(device).await;
            });
        });

        let instruments = InstrumentsClient::connect(&provider).await.unwrap();
        assert!(
            instruments
                .capabilities()
                .contains_key("com.apple.instruments.server.services.deviceinfo")
        );
        assert_eq!(instruments.list_running_processes().await.unwrap().items.len(), 2);
        assert!(provider.connects.lock().unwrap().contains(&INSTRUMENTS_PORT));
    }
}
