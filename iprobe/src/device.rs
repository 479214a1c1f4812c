//! One attached device and the services opened on it
//!
//! [`Device`] opens services lazily and keeps the ones worth keeping in a cache behind
//! a single lock. A cached plist service whose connection breaks is dropped and opened
//! again on the next call. Instruments calls only take the lock long enough to clone the
//! shared DTX client, so they run concurrently.

use std::{
    collections::BTreeMap,
    future::Future,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
    sync::{Mutex, MutexGuard, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    Idevice, IdeviceError, IdeviceService, ResultExt,
    crashreportcopymobile::{self, CrashReportOptions},
    diagnostics_relay::{self, DiagnosticsRelayClient},
    dvt::{
        application_listing::Application,
        device_info::{DecodedList, DeviceInfo, Process},
        graphics::{DEFAULT_SAMPLING_RATE, GraphicsInfo},
        instruments::InstrumentsClient,
        process_control::LaunchOptions,
    },
    file_transfer::{FileTransfer, join},
    house_arrest::HouseArrestClient,
    installation_proxy::InstallationProxyClient,
    lockdown::{LockdownClient, start_service_stream},
    mobile_image_mounter::ImageMounter,
    pairing_file::PairingFile,
    pcapd::{DevicePacket, PcapdClient},
    profiler::{
        self, CpuMemoryOptions, OUTPUT_QUEUE, PerfMetric, ProfilerKind, ProfilerRecord,
        ProfilerSession,
    },
    provider::IdeviceProvider,
    screenshotr::ScreenshotService,
    simulate_location::LocationSimulationService,
    springboardservices::{InterfaceOrientation, SpringBoardServicesClient},
    syslog_relay::SyslogRelayClient,
    usbmuxd::{UsbmuxdAddr, UsbmuxdDevice},
};

pub const BATTERY_DOMAIN: &str = "com.apple.mobile.battery";
pub const DEVELOPER_IMAGE_TYPE: &str = "Developer";
pub const STAGING_DIR: &str = "PublicStaging";
/// Lines buffered between the syslog relay and its reader
pub const SYSLOG_BUFFER: usize = 256;
/// Packets buffered between pcapd and its reader
pub const PCAP_BUFFER: usize = 256;

/// Services a [`Device`] can hold on to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Lockdown,
    ImageMounter,
    Screenshot,
    InstallationProxy,
    Instruments,
    /// Vending turns the connection into a file stream, so it is never kept
    HouseArrest,
    SyslogRelay,
    LocationSimulation,
    SpringBoard,
    PacketCapture,
    /// Restart and shutdown end the connection, so it is never kept
    DiagnosticsRelay,
}

#[derive(Debug, Default)]
struct ServiceCache {
    lockdown: Option<LockdownClient>,
    image_mounter: Option<ImageMounter>,
    screenshot: Option<ScreenshotService>,
    installation_proxy: Option<InstallationProxyClient>,
    instruments: Option<InstrumentsClient>,
    syslog: Option<JoinHandle<()>>,
    location: Option<LocationSimulationService>,
    springboard: Option<SpringBoardServicesClient>,
    pcap: Option<JoinHandle<()>>,
    profilers: BTreeMap<ProfilerKind, ProfilerSession>,
}

impl ServiceCache {
    fn kinds(&self) -> Vec<ServiceKind> {
        [
            (self.lockdown.is_some(), ServiceKind::Lockdown),
            (self.image_mounter.is_some(), ServiceKind::ImageMounter),
            (self.screenshot.is_some(), ServiceKind::Screenshot),
            (self.installation_proxy.is_some(), ServiceKind::InstallationProxy),
            (self.instruments.is_some(), ServiceKind::Instruments),
            (self.syslog.is_some(), ServiceKind::SyslogRelay),
            (self.location.is_some(), ServiceKind::LocationSimulation),
            (self.springboard.is_some(), ServiceKind::SpringBoard),
            (self.pcap.is_some(), ServiceKind::PacketCapture),
        ]
        .into_iter()
        .filter_map(|(present, kind)| present.then_some(kind))
        .collect()
    }
}

/// Returns the cached value in `slot`, connecting first if it is empty
async fn cached<'a, T, F, Fut>(slot: &'a mut Option<T>, connect: F) -> Result<&'a mut T, IdeviceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, IdeviceError>>,
{
    let value = match slot.take() {
        Some(v) => v,
        None => connect().await?,
    };
    Ok(slot.insert(value))
}

/// Forgets a cached service whose connection failed under `res`
fn evict_if_broken<T, R>(slot: &mut Option<T>, res: &Result<R, IdeviceError>) {
    if let Err(e) = res {
        if matches!(
            e.root(),
            IdeviceError::Socket(_) | IdeviceError::ConnectionClosed | IdeviceError::NoEstablishedConnection
        ) {
            debug!("Dropping cached service after {e}");
            slot.take();
        }
    }
}

/// Façade over every service of one device
#[derive(Debug)]
pub struct Device {
    provider: Box<dyn IdeviceProvider>,
    registry: Option<(UsbmuxdAddr, UsbmuxdDevice)>,
    cache: Mutex<ServiceCache>,
    closed: AtomicBool,
}

impl Device {
    pub fn new(provider: impl IdeviceProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            registry: None,
            cache: Mutex::new(ServiceCache::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Finds `udid` through usbmuxd, or takes the first attached device
    pub async fn connect(
        addr: UsbmuxdAddr,
        udid: Option<&str>,
        label: impl Into<String>,
    ) -> Result<Self, IdeviceError> {
        let mut usbmuxd = addr.connect(0).await.context("connect to usbmuxd")?;
        let device = match udid {
            Some(udid) => usbmuxd.get_device(udid).await,
            None => usbmuxd
                .get_devices()
                .await
                .and_then(|d| d.into_iter().next().ok_or(IdeviceError::DeviceNotFound)),
        }
        .context("find device")?;
        info!("Using device {} ({})", device.udid, device.device_id);

        let mut this = Self::new(device.to_provider(addr.clone(), label));
        this.registry = Some((addr, device));
        Ok(this)
    }

    pub fn udid(&self) -> &str {
        self.provider.udid()
    }

    pub fn provider(&self) -> &dyn IdeviceProvider {
        &*self.provider
    }

    /// Which services are currently held open
    pub async fn cached_services(&self) -> Vec<ServiceKind> {
        self.cache.lock().await.kinds()
    }

    async fn lock(&self) -> Result<MutexGuard<'_, ServiceCache>, IdeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IdeviceError::InvalidState("device is closed"));
        }
        Ok(self.cache.lock().await)
    }

    // registry

    /// Lists the devices usbmuxd knows about
    pub async fn list_devices(addr: &UsbmuxdAddr) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let mut usbmuxd = addr.connect(0).await.context("list devices")?;
        usbmuxd.get_devices().await.context("list devices")
    }

    pub async fn read_pair_record(&self) -> Result<PairingFile, IdeviceError> {
        self.provider
            .get_pairing_file()
            .await
            .context("read pair record")
    }

    pub async fn save_pair_record(&self, record: &PairingFile) -> Result<(), IdeviceError> {
        let (addr, device) = self.registry()?;
        let bytes = record.serialize().context("save pair record")?;
        let mut usbmuxd = addr.connect(device.device_id).await.context("save pair record")?;
        usbmuxd
            .save_pair_record(device.device_id, &device.udid, bytes)
            .await
            .context("save pair record")
    }

    pub async fn delete_pair_record(&self) -> Result<(), IdeviceError> {
        let (addr, device) = self.registry()?;
        let mut usbmuxd = addr.connect(device.device_id).await.context("delete pair record")?;
        usbmuxd
            .delete_pair_record(&device.udid)
            .await
            .context("delete pair record")
    }

    fn registry(&self) -> Result<(&UsbmuxdAddr, &UsbmuxdDevice), IdeviceError> {
        self.registry
            .as_ref()
            .map(|(a, d)| (a, d))
            .ok_or(IdeviceError::InvalidState("device was not opened through usbmuxd"))
    }

    // lockdown

    async fn lockdown<'a>(
        &self,
        cache: &'a mut ServiceCache,
    ) -> Result<&'a mut LockdownClient, IdeviceError> {
        cached(&mut cache.lockdown, || async {
            let mut lockdown = LockdownClient::connect(&*self.provider).await?;
            lockdown.handshake_with(&*self.provider).await?;
            Ok(lockdown)
        })
        .await
    }

    pub async fn query_type(&self) -> Result<String, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.lockdown(&mut cache).await {
            Ok(l) => l.query_type().await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.lockdown, &res);
        res.context("query type")
    }

    /// Reads a lockdown value; `None` for both returns every value of the default domain
    pub async fn get_value(
        &self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<plist::Value, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.lockdown(&mut cache).await {
            Ok(l) => l.get_value(domain, key).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.lockdown, &res);
        res.context("get value")
    }

    pub async fn product_version(&self) -> Result<String, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.lockdown(&mut cache).await {
            Ok(l) => l.product_version().await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.lockdown, &res);
        res.context("product version")
    }

    /// Battery values from lockdown, topped up with the power source registry entry
    ///
    /// The registry read is best effort: when the diagnostics relay fails the lockdown
    /// values are returned alone.
    pub async fn battery_info(&self) -> Result<plist::Dictionary, IdeviceError> {
        let mut info = match self.get_value(Some(BATTERY_DOMAIN), None).await? {
            plist::Value::Dictionary(d) => d,
            other => {
                return Err(IdeviceError::UnexpectedValue {
                    expected: "dictionary",
                    found: crate::pretty_print_plist(&other),
                })
                .context("battery info");
            }
        };
        match self.power_source().await {
            Ok(Some(source)) => info.extend(diagnostics_relay::battery_fields(&source)),
            Ok(None) => debug!("No power source entry in the IO registry"),
            Err(e) => warn!("Skipping power source details: {e}"),
        }
        Ok(info)
    }

    async fn power_source(&self) -> Result<Option<plist::Dictionary>, IdeviceError> {
        let mut relay = self.diagnostics_relay().await?;
        let res = relay.power_source().await;
        if let Err(e) = relay.goodbye().await {
            debug!("Diagnostics relay goodbye failed: {e}");
        }
        res.context("read power source")
    }

    async fn diagnostics_relay(&self) -> Result<DiagnosticsRelayClient, IdeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IdeviceError::InvalidState("device is closed"));
        }
        DiagnosticsRelayClient::connect(&*self.provider)
            .await
            .context("start diagnostics relay")
    }

    pub async fn reboot(&self) -> Result<(), IdeviceError> {
        let mut relay = self.diagnostics_relay().await?;
        relay.restart().await.context("reboot")?;
        info!("Rebooting {}", self.udid());
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), IdeviceError> {
        let mut relay = self.diagnostics_relay().await?;
        relay.shutdown().await.context("shutdown")?;
        info!("Shutting down {}", self.udid());
        Ok(())
    }

    /// Starts any lockdown service and hands over its connection
    pub async fn open_service(&self, name: &str) -> Result<Idevice, IdeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IdeviceError::InvalidState("device is closed"));
        }
        start_service_stream(&*self.provider, name)
            .await
            .context("open service")
    }

    // image mounter

    /// Signatures of mounted images of `image_type`
    pub async fn images(&self, image_type: &str) -> Result<Vec<Vec<u8>>, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.image_mounter, || ImageMounter::connect(&*self.provider)).await {
            Ok(m) => m.lookup_image(image_type).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.image_mounter, &res);
        res.context("look up images")
    }

    /// Mounts the developer disk image unless one is already mounted
    ///
    /// Returns whether a mount happened.
    pub async fn mount_developer_disk_image(
        &self,
        dmg_path: &Path,
        signature_path: &Path,
    ) -> Result<bool, IdeviceError> {
        let image = tokio::fs::read(dmg_path).await.map_err(IdeviceError::from).context("read disk image")?;
        let signature = tokio::fs::read(signature_path)
            .await
            .map_err(IdeviceError::from)
            .context("read disk image signature")?;

        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.image_mounter, || ImageMounter::connect(&*self.provider)).await {
            Ok(m) => m.upload_and_mount(DEVELOPER_IMAGE_TYPE, &image, &signature).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.image_mounter, &res);
        if let Ok(true) = res {
            info!("Mounted developer disk image");
        }
        res.context("mount developer disk image")
    }

    // screenshot

    /// Captures the screen, as encoded by the device
    pub async fn screenshot(&self) -> Result<Vec<u8>, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.screenshot, || ScreenshotService::connect(&*self.provider)).await {
            Ok(s) => s.take_screenshot().await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.screenshot, &res);
        res.context("screenshot")
    }

    // installation proxy

    async fn with_installation_proxy<'a>(
        &self,
        cache: &'a mut ServiceCache,
    ) -> Result<&'a mut InstallationProxyClient, IdeviceError> {
        cached(&mut cache.installation_proxy, || {
            InstallationProxyClient::connect(&*self.provider)
        })
        .await
    }

    /// Installed apps keyed by bundle id
    ///
    /// # Arguments
    /// * `application_type` - `User`, `System` or `Any` (the default)
    /// * `bundle_ids` - restrict the lookup to these apps
    pub async fn installed_apps(
        &self,
        application_type: Option<&str>,
        bundle_ids: Option<Vec<String>>,
    ) -> Result<plist::Dictionary, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.with_installation_proxy(&mut cache).await {
            Ok(p) => p.get_apps(application_type, bundle_ids).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.installation_proxy, &res);
        res.context("look up apps")
    }

    pub async fn browse_apps(&self) -> Result<Vec<plist::Value>, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.with_installation_proxy(&mut cache).await {
            Ok(p) => p.browse(None).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.installation_proxy, &res);
        res.context("browse apps")
    }

    pub async fn uninstall_app(&self, bundle_id: &str) -> Result<(), IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match self.with_installation_proxy(&mut cache).await {
            Ok(p) => {
                p.uninstall(bundle_id, None, |p| debug!("Uninstall {p}%"))
                    .await
            }
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.installation_proxy, &res);
        res.context("uninstall app")
    }

    /// Stages a package through `ft` and installs it
    ///
    /// `ft` must be rooted at the media directory, as the plain AFC service is.
    pub async fn install_app(
        &self,
        package_path: &Path,
        ft: &mut dyn FileTransfer,
    ) -> Result<(), IdeviceError> {
        let file_name = package_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(IdeviceError::InvalidState("package path has no file name"))
            .context("install app")?;
        let package = tokio::fs::read(package_path).await.map_err(IdeviceError::from).context("read package")?;

        ft.mkdir(STAGING_DIR).await.context("create staging directory")?;
        let staged = join(STAGING_DIR, file_name);
        ft.write_file(&staged, &package).await.context("stage package")?;
        info!("Staged {} bytes at {staged}", package.len());

        let mut cache = self.lock().await?;
        let res = match self.with_installation_proxy(&mut cache).await {
            Ok(p) => p.install(&staged, None, |p| debug!("Install {p}%")).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.installation_proxy, &res);
        res.context("install app")
    }

    // house arrest

    /// Vends an app container; the returned stream speaks AFC
    pub async fn vend_container(&self, bundle_id: &str) -> Result<Idevice, IdeviceError> {
        let client = HouseArrestClient::connect(&*self.provider)
            .await
            .context("vend container")?;
        client.vend_container(bundle_id).await.context("vend container")
    }

    /// Vends an app's Documents directory; the returned stream speaks AFC
    pub async fn vend_documents(&self, bundle_id: &str) -> Result<Idevice, IdeviceError> {
        let client = HouseArrestClient::connect(&*self.provider)
            .await
            .context("vend documents")?;
        client.vend_documents(bundle_id).await.context("vend documents")
    }

    // syslog

    /// Streams device log lines; a running stream is replaced
    pub async fn syslog(&self) -> Result<mpsc::Receiver<String>, IdeviceError> {
        let mut cache = self.lock().await?;
        if let Some(task) = cache.syslog.take() {
            debug!("Replacing running syslog stream");
            task.abort();
        }
        let relay = SyslogRelayClient::connect(&*self.provider)
            .await
            .context("start syslog")?;
        let (rx, task) = relay.spawn_stream(SYSLOG_BUFFER);
        cache.syslog = Some(task);
        Ok(rx)
    }

    pub async fn syslog_stop(&self) {
        if let Some(task) = self.cache.lock().await.syslog.take() {
            task.abort();
        }
    }

    // packet capture

    /// Streams packets seen by the device; a running capture is replaced
    pub async fn pcap(&self) -> Result<mpsc::Receiver<DevicePacket>, IdeviceError> {
        let mut cache = self.lock().await?;
        if let Some(task) = cache.pcap.take() {
            debug!("Replacing running packet capture");
            task.abort();
        }
        let client = PcapdClient::connect(&*self.provider)
            .await
            .context("start packet capture")?;
        let (rx, task) = client.spawn_stream(PCAP_BUFFER);
        cache.pcap = Some(task);
        Ok(rx)
    }

    pub async fn pcap_stop(&self) {
        if let Some(task) = self.cache.lock().await.pcap.take() {
            task.abort();
        }
    }

    // location

    /// Pins the device location to a WGS84 coordinate until [`simulate_location_recover`](Self::simulate_location_recover)
    pub async fn simulate_location_update(
        &self,
        longitude: f64,
        latitude: f64,
    ) -> Result<(), IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.location, || {
            LocationSimulationService::connect(&*self.provider)
        })
        .await
        {
            Ok(l) => l.set(latitude, longitude).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.location, &res);
        res.context("simulate location")
    }

    pub async fn simulate_location_recover(&self) -> Result<(), IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.location, || {
            LocationSimulationService::connect(&*self.provider)
        })
        .await
        {
            Ok(l) => l.clear().await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.location, &res);
        res.context("recover location")
    }

    // springboard

    /// PNG of the home screen icon of `bundle_id`
    pub async fn icon_png_data(&self, bundle_id: &str) -> Result<Vec<u8>, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.springboard, || {
            SpringBoardServicesClient::connect(&*self.provider)
        })
        .await
        {
            Ok(s) => s.icon_png_data(bundle_id).await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.springboard, &res);
        res.context("icon png data")
    }

    pub async fn interface_orientation(&self) -> Result<InterfaceOrientation, IdeviceError> {
        let mut cache = self.lock().await?;
        let res = match cached(&mut cache.springboard, || {
            SpringBoardServicesClient::connect(&*self.provider)
        })
        .await
        {
            Ok(s) => s.interface_orientation().await,
            Err(e) => Err(e),
        };
        evict_if_broken(&mut cache.springboard, &res);
        res.context("interface orientation")
    }

    // crash reports

    pub async fn flush_crash_reports(&self) -> Result<(), IdeviceError> {
        crashreportcopymobile::flush_reports(&*self.provider)
            .await
            .context("flush crash reports")
    }

    /// Flushes pending reports, then copies them from `ft` into `host_dir`
    ///
    /// `ft` reads the crash report service, see [`crashreportcopymobile::COPY_SERVICE`].
    pub async fn move_crash_reports(
        &self,
        ft: &mut dyn FileTransfer,
        host_dir: &Path,
        options: &CrashReportOptions,
    ) -> Result<Vec<std::path::PathBuf>, IdeviceError> {
        self.flush_crash_reports().await?;
        crashreportcopymobile::pull_reports(ft, host_dir, options)
            .await
            .context("move crash reports")
    }

    // instruments

    /// The shared instruments client, reconnecting if its connection died
    pub async fn instruments(&self) -> Result<InstrumentsClient, IdeviceError> {
        let mut cache = self.lock().await?;
        if let Some(instruments) = &cache.instruments {
            if !instruments.remote().is_closed() {
                return Ok(instruments.clone());
            }
            warn!("Instruments connection closed, reconnecting");
        }
        let instruments = InstrumentsClient::connect(&*self.provider)
            .await
            .context("connect instruments")?;
        cache.instruments = Some(instruments.clone());
        Ok(instruments)
    }

    pub async fn app_launch(
        &self,
        bundle_id: &str,
        options: &LaunchOptions,
    ) -> Result<u64, IdeviceError> {
        self.instruments()
            .await?
            .app_launch(bundle_id, options)
            .await
            .context("launch app")
    }

    pub async fn app_kill(&self, pid: u64) -> Result<(), IdeviceError> {
        self.instruments()
            .await?
            .app_kill(pid)
            .await
            .context("kill app")
    }

    pub async fn running_processes(&self) -> Result<DecodedList<Process>, IdeviceError> {
        self.instruments()
            .await?
            .list_running_processes()
            .await
            .context("list processes")
    }

    pub async fn installed_applications(&self) -> Result<DecodedList<Application>, IdeviceError> {
        self.instruments()
            .await?
            .list_installed_apps()
            .await
            .context("list applications")
    }

    pub async fn instruments_device_info(&self) -> Result<DeviceInfo, IdeviceError> {
        self.instruments()
            .await?
            .device_info()
            .await
            .context("instruments device info")
    }

    pub async fn graphics_info(&self) -> Result<GraphicsInfo, IdeviceError> {
        self.instruments()
            .await?
            .graphics_info()
            .await
            .context("graphics info")
    }

    pub async fn get_pid_by_bundle_id(&self, bundle_id: &str) -> Result<u64, IdeviceError> {
        self.instruments()
            .await?
            .get_pid_by_bundle_id(bundle_id)
            .await
            .context("find pid")
    }

    // profiler

    /// Starts the sessions `metrics` need and merges their records into one stream
    ///
    /// With a bundle id, the app's pid is resolved (launching the app if it is installed
    /// but not running) and a `process` record is emitted for it on every sample.
    ///
    /// # Errors
    /// `ProfilerRunning` if any needed session is already running; nothing is started then.
    pub async fn profiler_start(
        &self,
        metrics: &[PerfMetric],
        bundle_id: Option<&str>,
    ) -> Result<mpsc::Receiver<ProfilerRecord>, IdeviceError> {
        let mut kinds: Vec<ProfilerKind> = metrics.iter().flat_map(|m| m.kinds()).copied().collect();
        if bundle_id.is_some() {
            kinds.push(ProfilerKind::CpuMemory);
        }
        kinds.sort();
        kinds.dedup();
        if kinds.is_empty() {
            return Err(IdeviceError::InvalidState("no metrics selected")).context("start profiler");
        }
        // checked before the pid lookup, which may launch the app
        ensure_idle(&*self.lock().await?, &kinds).context("start profiler")?;

        let instruments = self.instruments().await?;
        let pid = match bundle_id {
            Some(bundle_id) => Some(
                resolve_pid(&instruments, bundle_id)
                    .await
                    .context("resolve profiled app")?,
            ),
            None => None,
        };

        let mut cache = self.lock().await?;
        ensure_idle(&cache, &kinds).context("start profiler")?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        let mut started: Vec<ProfilerSession> = Vec::new();
        for kind in kinds {
            let res = match kind {
                ProfilerKind::CpuMemory => {
                    let options = CpuMemoryOptions::from_metrics(metrics, pid);
                    profiler::cpu_memory::start(&instruments, options, tx.clone()).await
                }
                ProfilerKind::Network => profiler::network::start(&instruments, tx.clone()).await,
                ProfilerKind::Graphics => {
                    profiler::graphics::start(&instruments, DEFAULT_SAMPLING_RATE, tx.clone()).await
                }
            };
            match res {
                Ok(session) => started.push(session),
                Err(e) => {
                    for session in &started {
                        if let Err(e) = session.stop().await {
                            warn!("Failed to stop {} profiler: {e}", session.kind().name());
                        }
                    }
                    return Err(e).context("start profiler");
                }
            }
        }
        for session in started {
            info!("Started {} profiler", session.kind().name());
            cache.profilers.insert(session.kind(), session);
        }
        Ok(rx)
    }

    /// Stops every running profiler session
    pub async fn profiler_stop(&self) -> Result<(), IdeviceError> {
        let sessions = std::mem::take(&mut self.cache.lock().await.profilers);
        let mut first_error = None;
        for (kind, session) in sessions {
            if let Err(e) = session.stop().await {
                warn!("Failed to stop {} profiler: {e}", kind.name());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e).context("stop profiler"),
            None => Ok(()),
        }
    }

    /// Stops profilers, syslog and packet capture and drops every cached service
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.profiler_stop().await {
            warn!("{e}");
        }
        let cache = std::mem::take(&mut *self.cache.lock().await);
        for task in [cache.syslog, cache.pcap].into_iter().flatten() {
            task.abort();
        }
        if let Some(instruments) = cache.instruments {
            instruments.close().await;
        }
        debug!("Closed device {}", self.udid());
    }
}

/// Fails when any of `kinds` already has a session
fn ensure_idle(cache: &ServiceCache, kinds: &[ProfilerKind]) -> Result<(), IdeviceError> {
    match kinds.iter().find(|k| cache.profilers.contains_key(k)) {
        Some(running) => Err(IdeviceError::ProfilerRunning(running.name())),
        None => Ok(()),
    }
}

/// Pid of a running app, launching it if it is installed but not running
async fn resolve_pid(instruments: &InstrumentsClient, bundle_id: &str) -> Result<u64, IdeviceError> {
    match instruments.get_pid_by_bundle_id(bundle_id).await {
        Ok(pid) => Ok(pid),
        Err(IdeviceError::ProcessNotRunning(_)) => {
            info!("{bundle_id} is not running, launching it");
            instruments
                .app_launch(bundle_id, &LaunchOptions::default())
                .await
        }
        Err(e) => Err(e),
    }
}
