// Packet capture

use std::path::PathBuf;

use clap::{Arg, ArgMatches, Command, value_parser};
use iprobe::{Device, IdeviceError, ResultExt, pcapd::PcapFileWriter};

pub fn command() -> Command {
    Command::new("pcap")
        .about("Capture IP packets until Ctrl-C")
        .arg(
            Arg::new("out")
                .long("out")
                .short('o')
                .value_name("PCAP")
                .value_parser(value_parser!(PathBuf))
                .help("Write a pcap file instead of printing a summary per packet"),
        )
}

pub async fn main(matches: &ArgMatches, device: &Device) -> Result<(), IdeviceError> {
    let mut writer = match matches.get_one::<PathBuf>("out") {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .map_err(IdeviceError::from)
                .context("create pcap file")?;
            Some(PcapFileWriter::new(tokio::io::BufWriter::new(file)).await?)
        }
        None => None,
    };

    let mut packets = device.pcap().await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut count = 0usize;
    loop {
        tokio::select! {
            packet = packets.recv() => match packet {
                Some(p) => {
                    count += 1;
                    match writer.as_mut() {
                        Some(w) => w.write_packet(&p).await?,
                        None => println!(
                            "{}.{:06} {} {}[{}] {} bytes",
                            p.seconds,
                            p.microseconds,
                            p.interface_name,
                            p.comm,
                            p.pid,
                            p.data.len()
                        ),
                    }
                }
                None => {
                    tracing::warn!("Packet capture ended");
                    break;
                }
            },
            _ = &mut ctrl_c => break,
        }
    }
    device.pcap_stop().await;
    if let Some(w) = writer.as_mut() {
        w.flush().await?;
    }
    eprintln!("Captured {count} packets");
    Ok(())
}
