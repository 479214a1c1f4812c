//! Crash reports
//!
//! `com.apple.crashreportmover` flushes pending reports into the crash report directory
//! and answers with `ping`. The directory itself is served by
//! `com.apple.crashreportcopymobile`, which speaks AFC and is read through a
//! [`FileTransfer`] collaborator.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::{
    IdeviceError,
    file_transfer::{FileTransfer, join},
    lockdown::start_service_stream,
    provider::IdeviceProvider,
};

pub const MOVER_SERVICE: &str = "com.apple.crashreportmover";
pub const COPY_SERVICE: &str = "com.apple.crashreportcopymobile";

const EXPECTED_FLUSH: &[u8; 4] = b"ping";

/// How crash reports are pulled to the host
#[derive(Debug, Clone, Default)]
pub struct CrashReportOptions {
    /// Leave the reports on the device after copying
    pub keep: bool,
    /// Only copy files whose name contains one of these; empty copies everything
    pub filters: Vec<String>,
}

impl CrashReportOptions {
    fn matches(&self, name: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| name.contains(f.as_str()))
    }
}

/// Asks the mover to flush reports into the copy directory
pub async fn flush_reports(provider: &dyn IdeviceProvider) -> Result<(), IdeviceError> {
    let mut idevice = start_service_stream(provider, MOVER_SERVICE).await?;
    let res = idevice.read_raw(4).await?;
    debug!("Flush reports response: {:?}", String::from_utf8_lossy(&res));

    if res == EXPECTED_FLUSH {
        Ok(())
    } else {
        warn!("crashreportmover sent wrong bytes: {res:02X?}");
        Err(IdeviceError::CrashReportMoverBadResponse(res))
    }
}

/// Copies every report under `/` into `host_dir`, keeping the directory layout
///
/// Returns the host paths written. Reports are removed from the device unless
/// `options.keep` is set.
pub async fn pull_reports(
    ft: &mut dyn FileTransfer,
    host_dir: &Path,
    options: &CrashReportOptions,
) -> Result<Vec<PathBuf>, IdeviceError> {
    tokio::fs::create_dir_all(host_dir).await?;
    let mut written = Vec::new();
    let mut pending = vec![String::from("/")];

    while let Some(dir) = pending.pop() {
        for name in ft.read_dir(&dir).await? {
            if name == "." || name == ".." {
                continue;
            }
            let device_path = join(&dir, &name);
            let info = ft.stat(&device_path).await?;
            if info.is_dir {
                pending.push(device_path);
                continue;
            }
            if !options.matches(&name) {
                continue;
            }

            let data = ft.read_file(&device_path).await?;
            let host_path = host_dir.join(device_path.trim_start_matches('/'));
            if let Some(parent) = host_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&host_path, &data).await?;
            info!("Copied {device_path} ({} bytes)", data.len());

            if !options.keep {
                ft.remove(&device_path).await?;
            }
            written.push(host_path);
        }
    }
    Ok(written)
}
