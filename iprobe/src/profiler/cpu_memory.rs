//! CPU, memory, disk and network counters from sysmontap
//!
//! A sample is a pair: a system element (it carries `System`) and a process element
//! (it carries `Processes`, keyed by pid). Their order on the wire is not fixed. Both
//! hold positional vectors whose meaning comes from the attribute lists we configured.

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{PerfMetric, ProfilerRecord, ProfilerSession, Sampler, now, start_session};
use crate::{
    IdeviceError,
    dvt::{DtxValue, instruments::InstrumentsClient, sysmontap::SysmontapConfig},
};

/// Bytes per VM page on the device
pub const PAGE_SIZE: i64 = 16384;

/// Page counts from a sample, in bytes; corrupt counts clamp instead of overflowing
fn pages(count: i64) -> i64 {
    count.saturating_mul(PAGE_SIZE)
}

const DISK_ATTRS: &[&str] = &["diskBytesRead", "diskBytesWritten", "diskReadOps", "diskWriteOps"];
const NETWORK_ATTRS: &[&str] = &["netBytesIn", "netBytesOut", "netPacketsIn", "netPacketsOut"];
const CPU_PROC_ATTRS: &[&str] = &["cpuUsage", "ctxSwitch", "intWakeups", "physFootprint"];
const MEMORY_SYS_ATTRS: &[&str] = &[
    "vmCompressorPageCount",
    "vmExtPageCount",
    "vmFreeCount",
    "vmIntPageCount",
    "vmPurgeableCount",
    "vmWireCount",
    "vmUsedCount",
    "vmSpeculativeCount",
    "__vmSwapUsage",
    "physMemSize",
];
const MEMORY_PROC_ATTRS: &[&str] = &["memVirtualSize", "memResidentSize", "memAnon"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub timestamp: i64,
    pub pid: u64,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub proc_perf: IndexMap<String, DtxValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemCpuRecord {
    pub timestamp: i64,
    pub nice_load: f64,
    pub system_load: f64,
    pub total_load: f64,
    pub user_load: f64,
}

/// Memory counters in bytes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMemoryRecord {
    pub timestamp: i64,
    pub app_memory: i64,
    pub free_memory: i64,
    pub used_memory: i64,
    pub wired_memory: i64,
    pub cached_files: i64,
    pub compressed: i64,
    pub swap_used: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemDiskRecord {
    pub timestamp: i64,
    pub data_read: i64,
    pub data_written: i64,
    pub reads_in: i64,
    pub writes_out: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemNetworkRecord {
    pub timestamp: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub packets_in: i64,
    pub packets_out: i64,
}

/// What the CPU/memory session reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuMemoryOptions {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
    pub network: bool,
    /// Emit a `process` record for this pid on every sample
    pub pid: Option<u64>,
}

impl CpuMemoryOptions {
    pub fn from_metrics(metrics: &[PerfMetric], pid: Option<u64>) -> Self {
        Self {
            cpu: metrics.contains(&PerfMetric::Cpu),
            memory: metrics.contains(&PerfMetric::Memory),
            disk: metrics.contains(&PerfMetric::Disk),
            network: metrics.contains(&PerfMetric::Network),
            pid,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.cpu || self.memory || self.disk || self.network)
    }

    /// Builds the sysmontap config, `pid` first among the process attributes
    pub fn sysmontap_config(&self) -> SysmontapConfig {
        let mut config = SysmontapConfig::default();
        let mut add = |list: &mut Vec<String>, attrs: &[&str]| {
            list.extend(attrs.iter().map(|a| a.to_string()));
        };
        if self.cpu {
            add(&mut config.proc_attrs, CPU_PROC_ATTRS);
        }
        if self.memory {
            add(&mut config.sys_attrs, MEMORY_SYS_ATTRS);
            add(&mut config.proc_attrs, MEMORY_PROC_ATTRS);
        }
        if self.disk {
            add(&mut config.sys_attrs, DISK_ATTRS);
        }
        if self.network {
            add(&mut config.sys_attrs, NETWORK_ATTRS);
        }
        config
    }
}

/// Turns sysmontap samples into records
#[derive(Debug, Clone)]
pub struct CpuMemoryDecoder {
    options: CpuMemoryOptions,
    proc_attrs: Vec<String>,
    sys_attrs: Vec<String>,
}

impl CpuMemoryDecoder {
    pub fn new(options: CpuMemoryOptions, config: &SysmontapConfig) -> Self {
        Self {
            options,
            proc_attrs: config.proc_attrs.clone(),
            sys_attrs: config.sys_attrs.clone(),
        }
    }

    pub fn decode(
        &self,
        sample: &DtxValue,
        timestamp: i64,
    ) -> Result<Vec<ProfilerRecord>, IdeviceError> {
        let elements = sample.expect_array()?;
        if elements.len() < 2 {
            return Err(IdeviceError::UnexpectedValue {
                expected: "system and process elements",
                found: format!("{} elements", elements.len()),
            });
        }
        let processes = if elements[0].get("System").is_some() {
            &elements[1]
        } else {
            &elements[0]
        };
        trace!("sysmontap sample with {} elements", elements.len());

        let mut records = Vec::new();
        if let Some(pid) = self.options.pid {
            records.push(ProfilerRecord::Process(
                self.process_record(processes, pid, timestamp),
            ));
        }

        let Some(system) = elements
            .iter()
            .filter(|e| e.get("SystemCPUUsage").is_some())
            .max_by_key(|e| e.get("EndMachAbsTime").and_then(DtxValue::as_u64).unwrap_or(0))
        else {
            return Ok(records);
        };

        if self.options.cpu {
            let usage = system.get("SystemCPUUsage");
            let load = |key: &str| {
                usage
                    .and_then(|u| u.get(key))
                    .and_then(DtxValue::as_f64)
                    .unwrap_or(0.0)
            };
            records.push(ProfilerRecord::SysCpu(SystemCpuRecord {
                timestamp,
                nice_load: load("CPU_NiceLoad"),
                system_load: load("CPU_SystemLoad"),
                total_load: load("CPU_TotalLoad"),
                user_load: load("CPU_UserLoad"),
            }));
        }

        let attrs = self.system_attributes(system);
        let attr = |name: &str| attrs.get(name).copied().unwrap_or(0);

        if self.options.memory {
            records.push(ProfilerRecord::SysMem(SystemMemoryRecord {
                timestamp,
                app_memory: pages(attr("vmIntPageCount").saturating_sub(attr("vmPurgeableCount"))),
                free_memory: pages(attr("vmFreeCount")),
                used_memory: pages(attr("vmUsedCount").saturating_sub(attr("vmExtPageCount"))),
                wired_memory: pages(attr("vmWireCount")),
                cached_files: pages(attr("vmExtPageCount").saturating_add(attr("vmPurgeableCount"))),
                compressed: pages(attr("vmCompressorPageCount")),
                swap_used: attr("__vmSwapUsage"),
            }));
        }
        if self.options.disk {
            records.push(ProfilerRecord::SysDisk(SystemDiskRecord {
                timestamp,
                data_read: attr("diskBytesRead"),
                data_written: attr("diskBytesWritten"),
                reads_in: attr("diskReadOps"),
                writes_out: attr("diskWriteOps"),
            }));
        }
        if self.options.network {
            records.push(ProfilerRecord::SysNetwork(SystemNetworkRecord {
                timestamp,
                bytes_in: attr("netBytesIn"),
                bytes_out: attr("netBytesOut"),
                packets_in: attr("netPacketsIn"),
                packets_out: attr("netPacketsOut"),
            }));
        }
        Ok(records)
    }

    fn process_record(&self, processes: &DtxValue, pid: u64, timestamp: i64) -> ProcessRecord {
        let values = processes
            .get("Processes")
            .and_then(|p| p.get(&pid.to_string()))
            .and_then(DtxValue::as_array);
        let Some(values) = values else {
            return ProcessRecord {
                timestamp,
                pid,
                msg: Some(format!("process {pid} not found")),
                ..Default::default()
            };
        };
        ProcessRecord {
            timestamp,
            pid,
            proc_perf: self
                .proc_attrs
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect(),
            msg: None,
        }
    }

    fn system_attributes(&self, system: &DtxValue) -> IndexMap<&str, i64> {
        let Some(values) = system.get("System").and_then(DtxValue::as_array) else {
            return IndexMap::new();
        };
        if values.len() < self.sys_attrs.len() {
            warn!(
                "System vector has {} values for {} attributes",
                values.len(),
                self.sys_attrs.len()
            );
        }
        self.sys_attrs
            .iter()
            .map(String::as_str)
            .zip(values.iter().map(|v| {
                v.as_i64()
                    .or_else(|| v.as_f64().map(|f| f as i64))
                    .unwrap_or(0)
            }))
            .collect()
    }
}

/// Configures sysmontap and starts streaming into `output`
pub async fn start(
    instruments: &InstrumentsClient,
    options: CpuMemoryOptions,
    output: mpsc::Sender<ProfilerRecord>,
) -> Result<ProfilerSession, IdeviceError> {
    let sysmontap = instruments.sysmontap().await?;
    let config = options.sysmontap_config();
    sysmontap.set_config(&config).await?;

    let decoder = CpuMemoryDecoder::new(options, &config);
    start_session(
        Sampler::Sysmontap(sysmontap.clone()),
        move |sample: &DtxValue| decoder.decode(sample, now()),
        output,
        sysmontap.start(),
    )
    .await
}
