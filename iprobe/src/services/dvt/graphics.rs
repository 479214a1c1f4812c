//! OpenGL graphics service client
//!
//! Answers one-off `systemInformation` requests and, once sampling starts, pushes a
//! statistics dictionary per interval on its channel.

use serde::{Deserialize, Serialize};

use super::{
    message::AuxValue,
    remote_server::{Channel, RemoteServerClient},
};
use crate::IdeviceError;

pub const SERVICE: &str = "com.apple.instruments.server.services.graphics.opengl";
pub const DEFAULT_SAMPLING_RATE: u64 = 1000;

/// Graphics statistics as reported by the device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphicsInfo {
    #[serde(rename = "CoreAnimationFramesPerSecond", default)]
    pub fps: f64,
    #[serde(rename = "Device Utilization %", default)]
    pub device_utilization: f64,
    #[serde(rename = "Renderer Utilization %", default)]
    pub renderer_utilization: f64,
    #[serde(rename = "Tiler Utilization %", default)]
    pub tiler_utilization: f64,
    #[serde(rename = "CommandBufferRenderCount", default)]
    pub command_buffer_render_count: f64,
    #[serde(rename = "SplitSceneCount", default)]
    pub split_scene_count: f64,
    #[serde(rename = "TiledSceneBytes", default)]
    pub tiled_scene_bytes: f64,
    #[serde(rename = "IOGLBundleName", default)]
    pub iogl_bundle_name: String,
    #[serde(rename = "XRVideoCardRunTimeStamp", default)]
    pub timestamp: f64,
    #[serde(rename = "gartUsedBytes", default)]
    pub gart_used_bytes: f64,
    #[serde(rename = "gartMapInBytesPerSample", default)]
    pub gart_map_in_bytes_per_sample: f64,
    #[serde(rename = "gartMapOutBytesPerSample", default)]
    pub gart_map_out_bytes_per_sample: f64,
    #[serde(rename = "contextGLCount", default)]
    pub context_gl_count: f64,
    #[serde(rename = "finishGLWaitTime", default)]
    pub finish_gl_wait_time: f64,
    #[serde(rename = "hardwareWaitTime", default)]
    pub hardware_wait_time: f64,
    #[serde(rename = "recoveryCount", default)]
    pub recovery_count: f64,
    #[serde(rename = "textureCount", default)]
    pub texture_count: f64,
}

#[derive(Debug, Clone)]
pub struct GraphicsClient {
    channel: Channel,
}

impl GraphicsClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn system_information(&self) -> Result<GraphicsInfo, IdeviceError> {
        self.channel
            .call("systemInformation", Vec::new())
            .await?
            .decode()
    }

    /// Sets the sampling rate; the device takes it in hundredths
    pub async fn set_sampling_rate(&self, rate: u64) -> Result<(), IdeviceError> {
        self.channel
            .call(
                "setSamplingRate:",
                vec![AuxValue::archived(plist::Value::Integer((rate / 100).into()))?],
            )
            .await?;
        Ok(())
    }

    pub async fn start_sampling(&self) -> Result<(), IdeviceError> {
        self.channel
            .call(
                "startSamplingAtTimeInterval:",
                vec![AuxValue::archived(plist::Value::Integer(0.into()))?],
            )
            .await?;
        Ok(())
    }

    pub async fn stop_sampling(&self) -> Result<(), IdeviceError> {
        self.channel.call("stopSampling", Vec::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::services::dvt::{remote_server::mock::pair, value::DtxValue};

    #[tokio::test]
    async fn decodes_statistics_with_missing_fields() {
        let (client, mut device) = pair();
        tokio::spawn(async move {
            let m = device.accept_channels().await.unwrap();
            assert_eq!(m.selector(), Some("setSamplingRate:"));
            assert_eq!(m.aux[0].to_value().unwrap().as_i64(), Some(10));
            device.reply(&m, None).await;

            let m = device.recv().await.unwrap();
            let mut stats = IndexMap::new();
            stats.insert("CoreAnimationFramesPerSecond".to_string(), DtxValue::from(59i64));
            stats.insert("Device Utilization %".to_string(), DtxValue::Real(12.5));
            device.reply(&m, Some(DtxValue::Dictionary(stats))).await;
            device
        });

        let gfx = GraphicsClient::new(&client).await.unwrap();
        gfx.set_sampling_rate(DEFAULT_SAMPLING_RATE).await.unwrap();
        let info = gfx.system_information().await.unwrap();
        assert_eq!(info.fps, 59.0);
        assert_eq!(info.device_utilization, 12.5);
        assert_eq!(info.texture_count, 0.0);
    }
}
