//! Global network monitoring
//!
//! While monitoring, the device pushes `[kind, values]` events on the channel for
//! interfaces, new connections and connection statistics.

use super::remote_server::{Channel, RemoteServerClient};
use crate::IdeviceError;

pub const SERVICE: &str = "com.apple.instruments.server.services.networking";

#[derive(Debug, Clone)]
pub struct NetworkingClient {
    channel: Channel,
}

impl NetworkingClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn replay_last_recorded_session(&self) -> Result<(), IdeviceError> {
        self.channel
            .call("replayLastRecordedSession", Vec::new())
            .await?;
        Ok(())
    }

    pub async fn start_monitoring(&self) -> Result<(), IdeviceError> {
        self.channel.call("startMonitoring", Vec::new()).await?;
        Ok(())
    }

    pub async fn stop_monitoring(&self) -> Result<(), IdeviceError> {
        self.channel.call("stopMonitoring", Vec::new()).await?;
        Ok(())
    }
}
