//! Process control service client
//!
//! Launches, kills and observes processes on the device.

use plist::Dictionary;
use tracing::warn;

use super::{
    message::AuxValue,
    remote_server::{Channel, RemoteServerClient},
};
use crate::IdeviceError;

pub const SERVICE: &str = "com.apple.instruments.server.services.processcontrol";

/// How an app is launched
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub environment: Dictionary,
    pub arguments: Vec<String>,
    pub start_suspended: bool,
    pub kill_existing: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessControlClient {
    channel: Channel,
}

impl ProcessControlClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    /// Launches an app and returns its pid
    pub async fn launch_app(
        &self,
        bundle_id: &str,
        options: &LaunchOptions,
    ) -> Result<u64, IdeviceError> {
        let mut launch = Dictionary::new();
        launch.insert("StartSuspendedKey".into(), options.start_suspended.into());
        launch.insert("KillExisting".into(), options.kill_existing.into());
        let arguments = plist::Value::Array(
            options
                .arguments
                .iter()
                .map(|a| a.as_str().into())
                .collect(),
        );

        let res = self
            .channel
            .call(
                "launchSuspendedProcessWithDevicePath:bundleIdentifier:environment:arguments:options:",
                vec![
                    AuxValue::archived("/private/")?,
                    AuxValue::archived(bundle_id)?,
                    AuxValue::archived(options.environment.clone())?,
                    AuxValue::archived(arguments)?,
                    AuxValue::archived(launch)?,
                ],
            )
            .await?;

        match res.as_u64() {
            Some(pid) => Ok(pid),
            None => {
                warn!("Launch of {bundle_id} answered with {}", res.type_name());
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Sends `killPid:`; the device does not answer
    pub async fn kill_app(&self, pid: u64) -> Result<(), IdeviceError> {
        self.channel
            .send("killPid:", vec![AuxValue::U32(pid as u32)])
            .await
    }

    /// Looks up the pid of a running app; 0 or less means not running
    pub async fn pid_for_bundle_id(&self, bundle_id: &str) -> Result<Option<u64>, IdeviceError> {
        let res = self
            .channel
            .call(
                "processIdentifierForBundleIdentifier:",
                vec![AuxValue::archived(bundle_id)?],
            )
            .await?;
        let pid = res.expect_i64()?;
        Ok((pid > 0).then_some(pid as u64))
    }

    pub async fn start_observing(&self, pid: u64) -> Result<(), IdeviceError> {
        self.channel
            .call("startObservingPid:", vec![AuxValue::U32(pid as u32)])
            .await?;
        Ok(())
    }

    pub async fn disable_memory_limit(&self, pid: u64) -> Result<(), IdeviceError> {
        let res = self
            .channel
            .call(
                "requestDisableMemoryLimitsForPid:",
                vec![AuxValue::U32(pid as u32)],
            )
            .await?;
        match res.as_bool() {
            Some(true) => Ok(()),
            Some(false) => {
                warn!("Failed to disable memory limit");
                Err(IdeviceError::DisableMemoryLimitFailed)
            }
            None => {
                warn!("Did not receive bool response");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }
}
