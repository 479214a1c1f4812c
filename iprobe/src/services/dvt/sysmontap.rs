//! System monitor tap
//!
//! After `setConfig:` and `start` the device pushes samples on the channel once per
//! update interval. Attributes in a sample are positional and follow the order of
//! `procAttrs` and `sysAttrs` in the config.

use plist::Dictionary;

use super::{
    message::AuxValue,
    remote_server::{Channel, RemoteServerClient},
};
use crate::IdeviceError;

pub const SERVICE: &str = "com.apple.instruments.server.services.sysmontap";

#[derive(Debug, Clone, PartialEq)]
pub struct SysmontapConfig {
    pub bm: u64,
    pub cpu_usage: bool,
    /// Nanoseconds between samples
    pub sample_interval: u64,
    /// Update rate, the `ur` key
    pub update_rate: u64,
    pub proc_attrs: Vec<String>,
    pub sys_attrs: Vec<String>,
}

impl Default for SysmontapConfig {
    fn default() -> Self {
        Self {
            bm: 0,
            cpu_usage: true,
            sample_interval: 1_000_000_000,
            update_rate: 1000,
            proc_attrs: vec!["pid".into()],
            sys_attrs: Vec::new(),
        }
    }
}

impl SysmontapConfig {
    pub fn to_dictionary(&self) -> Dictionary {
        let strings = |v: &[String]| {
            plist::Value::Array(v.iter().map(|s| s.as_str().into()).collect())
        };
        let mut d = Dictionary::new();
        d.insert("bm".into(), self.bm.into());
        d.insert("cpuUsage".into(), self.cpu_usage.into());
        d.insert("sampleInterval".into(), self.sample_interval.into());
        d.insert("ur".into(), self.update_rate.into());
        d.insert("procAttrs".into(), strings(&self.proc_attrs));
        d.insert("sysAttrs".into(), strings(&self.sys_attrs));
        d
    }
}

#[derive(Debug, Clone)]
pub struct SysmontapClient {
    channel: Channel,
}

impl SysmontapClient {
    pub async fn new(client: &RemoteServerClient) -> Result<Self, IdeviceError> {
        Ok(Self {
            channel: client.make_channel(SERVICE).await?,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub async fn set_config(&self, config: &SysmontapConfig) -> Result<(), IdeviceError> {
        self.channel
            .call("setConfig:", vec![AuxValue::archived(config.to_dictionary())?])
            .await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), IdeviceError> {
        self.channel.call("start", Vec::new()).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), IdeviceError> {
        self.channel.call("stop", Vec::new()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_keys() {
        let mut config = SysmontapConfig::default();
        config.sys_attrs.push("vmFreeCount".into());
        let d = config.to_dictionary();
        assert_eq!(d.get("ur").and_then(|v| v.as_unsigned_integer()), Some(1000));
        assert_eq!(
            d.get("sampleInterval").and_then(|v| v.as_unsigned_integer()),
            Some(1_000_000_000)
        );
        assert_eq!(d.get("cpuUsage").and_then(|v| v.as_boolean()), Some(true));
        let procs = d.get("procAttrs").and_then(|v| v.as_array()).unwrap();
        assert_eq!(procs[0].as_string(), Some("pid"));
        assert_eq!(d.get("sysAttrs").and_then(|v| v.as_array()).unwrap().len(), 1);
    }
}
