// Stream performance samples as JSON lines

use std::{io::Write, time::Duration};

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use iprobe::{
    Device, IdeviceError,
    profiler::{PerfMetric, ProfilerRecord},
};
use tokio::sync::mpsc;
use tracing::warn;

const METRICS: [(&str, PerfMetric); 5] = [
    ("cpu", PerfMetric::Cpu),
    ("memory", PerfMetric::Memory),
    ("disk", PerfMetric::Disk),
    ("network", PerfMetric::Network),
    ("fps", PerfMetric::Fps),
];

pub fn command() -> Command {
    let mut cmd = Command::new("perf")
        .about("Stream performance samples as JSON lines until Ctrl-C")
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .short('b')
                .help("Also report the process of this app, launching it if needed"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .value_parser(value_parser!(u64))
                .help("Stop after this many seconds"),
        );
    for (name, _) in METRICS {
        cmd = cmd.arg(
            Arg::new(name)
                .long(name)
                .action(ArgAction::SetTrue)
                .help(format!("Sample {name}")),
        );
    }
    cmd
}

/// Selected metrics, in flag order
pub fn metrics(matches: &ArgMatches) -> Vec<PerfMetric> {
    METRICS
        .iter()
        .filter(|(name, _)| matches.get_flag(name))
        .map(|(_, m)| *m)
        .collect()
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    let metrics = metrics(matches);
    let bundle = matches.get_one::<String>("bundle").map(String::as_str);
    let deadline = matches
        .get_one::<u64>("duration")
        .map(|s| tokio::time::Instant::now() + Duration::from_secs(*s));

    let mut records = device.profiler_start(&metrics, bundle).await?;
    let stop = async {
        let deadline = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = deadline => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    };
    write_records(&mut records, stop, &mut std::io::stdout()).await;
    device.profiler_stop().await
}

/// Writes records as JSON lines until `stop` resolves or the stream ends
///
/// Returns how many lines were written.
async fn write_records(
    records: &mut mpsc::Receiver<ProfilerRecord>,
    stop: impl Future<Output = ()>,
    out: &mut impl Write,
) -> usize {
    tokio::pin!(stop);
    let mut written = 0;
    loop {
        tokio::select! {
            record = records.recv() => match record {
                Some(record) => match serde_json::to_string(&record) {
                    Ok(line) => match writeln!(out, "{line}") {
                        Ok(()) => written += 1,
                        Err(e) => warn!("Unable to write a sample: {e}"),
                    },
                    Err(e) => warn!("Unable to serialize a sample: {e}"),
                },
                None => {
                    warn!("Profiler stream ended");
                    break;
                }
            },
            _ = &mut stop => break,
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use iprobe::profiler::SystemCpuRecord;
    use tokio::sync::oneshot;

    use super::*;

    fn sample(timestamp: i64) -> ProfilerRecord {
        ProfilerRecord::SysCpu(SystemCpuRecord {
            timestamp,
            total_load: 12.5,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn writes_json_lines_until_the_stream_ends() {
        let (tx, mut rx) = mpsc::channel(4);
        for ts in 1..=3 {
            tx.send(sample(ts)).await.unwrap();
        }
        drop(tx);

        let mut out = Vec::new();
        let written = write_records(&mut rx, std::future::pending(), &mut out).await;
        assert_eq!(written, 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "sys_cpu");
        assert_eq!(lines[2]["timestamp"], 3);
    }

    #[tokio::test]
    async fn one_stop_signal_ends_a_live_stream() {
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let feeder = tokio::spawn(async move {
            tx.send(sample(1)).await.unwrap();
            tx.send(sample(2)).await.unwrap();
            // stays open; only the stop signal can end the loop
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop_tx.send(()).unwrap();
            tx
        });

        let mut out = Vec::new();
        let stop = async {
            let _ = stop_rx.await;
        };
        let written = tokio::time::timeout(
            Duration::from_secs(1),
            write_records(&mut rx, stop, &mut out),
        )
        .await
        .unwrap();
        assert_eq!(written, 2);
        drop(feeder.await.unwrap());
    }
}
