//! Streaming performance sessions
//!
//! Each session configures sampling on one instruments service, subscribes to the
//! samples the device pushes on that channel and decodes them into [`ProfilerRecord`]s on
//! a single task. Raw samples wait in a small queue; when the decoder falls behind the
//! newest sample is dropped. Decoded records go to a bounded output channel.
//!
//! [`ProfilerSession::stop`] cancels decoding and asks the device to stop sampling. It
//! can be called any number of times.

pub mod cpu_memory;
pub mod graphics;
pub mod network;

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    dvt::{
        DtxValue,
        graphics::GraphicsClient,
        networking::NetworkingClient,
        remote_server::Channel,
        sysmontap::SysmontapClient,
    },
};

pub use cpu_memory::{
    CpuMemoryDecoder, CpuMemoryOptions, ProcessRecord, SystemCpuRecord, SystemDiskRecord,
    SystemMemoryRecord, SystemNetworkRecord,
};
pub use graphics::GraphicsRecord;
pub use network::{NetworkEvent, NetworkRecord};

/// Raw samples buffered between the connection and the decoder
pub const RAW_QUEUE: usize = 32;
/// Decoded records buffered for the consumer
pub const OUTPUT_QUEUE: usize = 32;

/// What a caller can ask to profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerfMetric {
    Cpu,
    Memory,
    Disk,
    Network,
    Fps,
}

impl PerfMetric {
    pub fn kinds(self) -> &'static [ProfilerKind] {
        match self {
            PerfMetric::Cpu | PerfMetric::Memory | PerfMetric::Disk => &[ProfilerKind::CpuMemory],
            PerfMetric::Network => &[ProfilerKind::CpuMemory, ProfilerKind::Network],
            PerfMetric::Fps => &[ProfilerKind::Graphics],
        }
    }
}

impl std::str::FromStr for PerfMetric {
    type Err = IdeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cpu" => Self::Cpu,
            "memory" => Self::Memory,
            "disk" => Self::Disk,
            "network" => Self::Network,
            "fps" => Self::Fps,
            _ => return Err(IdeviceError::InvalidState("unknown metric")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfilerKind {
    CpuMemory,
    Network,
    Graphics,
}

impl ProfilerKind {
    pub fn name(self) -> &'static str {
        match self {
            ProfilerKind::CpuMemory => "cpu/memory",
            ProfilerKind::Network => "network",
            ProfilerKind::Graphics => "graphics",
        }
    }
}

/// One decoded sample, serialized with a `type` tag
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfilerRecord {
    Process(ProcessRecord),
    SysCpu(SystemCpuRecord),
    SysMem(SystemMemoryRecord),
    SysDisk(SystemDiskRecord),
    SysNetwork(SystemNetworkRecord),
    Network(NetworkRecord),
    Graphics(GraphicsRecord),
}

/// Seconds since the unix epoch
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Turns one pushed sample into zero or more records
pub(crate) trait Decoder:
    FnMut(&DtxValue) -> Result<Vec<ProfilerRecord>, IdeviceError> + Send + 'static
{
}

impl<F> Decoder for F where
    F: FnMut(&DtxValue) -> Result<Vec<ProfilerRecord>, IdeviceError> + Send + 'static
{
}

/// The service a session samples, and how to stop it
#[derive(Debug, Clone)]
pub(crate) enum Sampler {
    Sysmontap(SysmontapClient),
    Networking(NetworkingClient),
    Graphics(GraphicsClient),
}

impl Sampler {
    fn channel(&self) -> &Channel {
        match self {
            Sampler::Sysmontap(c) => c.channel(),
            Sampler::Networking(c) => c.channel(),
            Sampler::Graphics(c) => c.channel(),
        }
    }

    fn kind(&self) -> ProfilerKind {
        match self {
            Sampler::Sysmontap(_) => ProfilerKind::CpuMemory,
            Sampler::Networking(_) => ProfilerKind::Network,
            Sampler::Graphics(_) => ProfilerKind::Graphics,
        }
    }

    async fn stop(&self) -> Result<(), IdeviceError> {
        match self {
            Sampler::Sysmontap(c) => c.stop().await,
            Sampler::Networking(c) => c.stop_monitoring().await,
            Sampler::Graphics(c) => c.stop_sampling().await,
        }
    }
}

/// A running sampling session
#[derive(Debug)]
pub struct ProfilerSession {
    sampler: Sampler,
    cancel: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ProfilerSession {
    /// Subscribes to the sampler's channel and starts the decode task
    ///
    /// Device-side sampling is started by the caller afterwards, so no sample is missed.
    pub(crate) fn spawn(
        sampler: Sampler,
        mut decoder: impl Decoder,
        output: mpsc::Sender<ProfilerRecord>,
    ) -> Result<Self, IdeviceError> {
        let kind = sampler.kind();
        let (raw_tx, mut raw_rx) = mpsc::channel(RAW_QUEUE);
        sampler.channel().register_callback(move |m| {
            if let Err(mpsc::error::TrySendError::Full(_)) = raw_tx.try_send(m) {
                warn!("{} decoder is behind, dropping sample", kind.name());
            }
        })?;

        let (cancel, mut cancelled) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancelled.changed() => break,
                    m = raw_rx.recv() => match m {
                        Some(m) => m,
                        None => break,
                    },
                };
                let Some(payload) = message.payload else {
                    continue;
                };
                let records = match decoder(&payload) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("Skipping undecodable {} sample: {e}", kind.name());
                        continue;
                    }
                };
                for record in records {
                    tokio::select! {
                        _ = cancelled.changed() => return,
                        sent = output.send(record) => if sent.is_err() {
                            debug!("{} output closed", kind.name());
                            return;
                        },
                    }
                }
            }
            debug!("{} decoder finished", kind.name());
        });

        Ok(Self {
            sampler,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> ProfilerKind {
        self.sampler.kind()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stops decoding and tells the device to stop sampling
    ///
    /// A connection that is already gone counts as stopped.
    pub async fn stop(&self) -> Result<(), IdeviceError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.halt_local().await;
        match self.sampler.stop().await {
            Ok(()) | Err(IdeviceError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn halt_local(&self) {
        self.sampler.channel().unregister_callback();
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Undoes a spawn whose device-side start failed
    pub(crate) async fn abandon(self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.halt_local().await;
    }
}

impl Drop for ProfilerSession {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.sampler.channel().unregister_callback();
            let _ = self.cancel.send(true);
        }
    }
}

/// Starts `start` after spawning, abandoning the session if it fails
pub(crate) async fn start_session<F>(
    sampler: Sampler,
    decoder: impl Decoder,
    output: mpsc::Sender<ProfilerRecord>,
    start: F,
) -> Result<ProfilerSession, IdeviceError>
where
    F: std::future::Future<Output = Result<(), IdeviceError>>,
{
    let session = ProfilerSession::spawn(sampler, decoder, output)?;
    if let Err(e) = start.await {
        session.abandon().await;
        return Err(e);
    }
    debug!("Started {} profiler", session.kind().name());
    Ok(session)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dvt::remote_server::mock::pair;

    #[tokio::test]
    async fn stop_is_idempotent_and_stops_the_device() {
        let (client, mut device) = pair();
        let device = tokio::spawn(async move {
            let mut selectors = Vec::new();
            while let Some(m) = device.accept_channels().await {
                selectors.push(m.selector().unwrap_or_default().to_string());
                device.reply(&m, None).await;
                if m.selector() == Some("stop") {
                    break;
                }
            }
            selectors
        });

        let sysmontap = SysmontapClient::new(&client).await.unwrap();
        let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE);
        let session = start_session(
            Sampler::Sysmontap(sysmontap.clone()),
            |_: &DtxValue| Ok::<_, IdeviceError>(Vec::new()),
            tx,
            sysmontap.start(),
        )
        .await
        .unwrap();

        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert!(session.is_stopped());
        assert_eq!(device.await.unwrap(), ["start", "stop"]);

        drop(session);
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test]
    async fn slow_consumer_drops_samples_instead_of_buffering() {
        let (client, mut device) = pair();
        let opened = tokio::spawn(async move {
            let m = device.recv().await.unwrap();
            device.reply(&m, None).await;
            device
        });
        let sysmontap = SysmontapClient::new(&client).await.unwrap();
        let mut device = opened.await.unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let session = ProfilerSession::spawn(
            Sampler::Sysmontap(sysmontap.clone()),
            |v: &DtxValue| -> Result<_, IdeviceError> {
                Ok(vec![ProfilerRecord::SysCpu(SystemCpuRecord {
                    timestamp: v.as_i64().unwrap_or_default(),
                    ..Default::default()
                })])
            },
            tx,
        )
        .unwrap();

        let code = sysmontap.channel().code();
        for i in 0..200 {
            device.push(1000 + i, code, DtxValue::from(i as i64)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut received = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            received += 1;
        }
        assert!(received > 0);
        assert!(received < 200, "received {received}");
        session.abandon().await;
    }
}
