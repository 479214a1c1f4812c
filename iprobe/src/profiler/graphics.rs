//! Frame rate and GPU utilisation samples

use serde::Serialize;
use tokio::sync::mpsc;

use super::{ProfilerRecord, ProfilerSession, Sampler, now, start_session};
use crate::{
    IdeviceError,
    dvt::{DtxValue, graphics::GraphicsInfo, instruments::InstrumentsClient},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphicsRecord {
    pub timestamp: i64,
    #[serde(flatten)]
    pub info: GraphicsInfo,
}

impl GraphicsRecord {
    pub fn decode(sample: &DtxValue, timestamp: i64) -> Result<Self, IdeviceError> {
        sample.expect_dictionary()?;
        Ok(Self {
            timestamp,
            info: sample.decode()?,
        })
    }
}

/// Starts sampling at `rate` and streams statistics into `output`
pub async fn start(
    instruments: &InstrumentsClient,
    rate: u64,
    output: mpsc::Sender<ProfilerRecord>,
) -> Result<ProfilerSession, IdeviceError> {
    let graphics = instruments.graphics().await?;
    graphics.set_sampling_rate(rate).await?;
    start_session(
        Sampler::Graphics(graphics.clone()),
        |sample: &DtxValue| -> Result<_, IdeviceError> {
            Ok(vec![ProfilerRecord::Graphics(GraphicsRecord::decode(
                sample,
                now(),
            )?)])
        },
        output,
        graphics.start_sampling(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use indexmap::IndexMap;

    use super::*;
    use crate::{
        dvt::{graphics::DEFAULT_SAMPLING_RATE, remote_server::mock::pair},
        profiler::OUTPUT_QUEUE,
    };

    #[tokio::test]
    async fn streams_pushed_samples() {
        let (client, mut device) = pair();
        let device = tokio::spawn(async move {
            let m = device.accept_channels().await.unwrap();
            assert_eq!(m.selector(), Some("setSamplingRate:"));
            device.reply(&m, None).await;
            let m = device.recv().await.unwrap();
            assert_eq!(m.selector(), Some("startSamplingAtTimeInterval:"));
            device.reply(&m, None).await;

            let mut stats = IndexMap::new();
            stats.insert("CoreAnimationFramesPerSecond".to_string(), DtxValue::from(58i64));
            device.push(500, m.channel, DtxValue::Dictionary(stats)).await;
            device.push(501, m.channel, DtxValue::from("not a dictionary")).await;

            let m = device.recv().await.unwrap();
            assert_eq!(m.selector(), Some("stopSampling"));
            device.reply(&m, None).await;
        });

        let instruments = InstrumentsClient::new(client);
        let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE);
        let session = start(&instruments, DEFAULT_SAMPLING_RATE, tx).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let ProfilerRecord::Graphics(record) = record else {
            panic!("expected graphics, got {record:?}");
        };
        assert_eq!(record.info.fps, 58.0);

        session.stop().await.unwrap();
        device.await.unwrap();
    }
}
