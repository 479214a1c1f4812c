//! pcapd service client
//!
//! The device sends every captured packet as a plist data blob: a fixed header naming
//! the interface and process, then the frame itself at `header_length`.

use plist::Value;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

use crate::{Idevice, IdeviceError, IdeviceService};

/// Stand-in link header put in front of raw IP frames
const ETHERNET_HEADER: [u8; 14] = [
    0xBE, 0xEF, 0xBE, 0xEF, 0xBE, 0xEF, 0xBE, 0xEF, 0xBE, 0xEF, 0xBE, 0xEF, 0x08, 0x00,
];

#[derive(Debug)]
pub struct PcapdClient {
    idevice: Idevice,
}

impl IdeviceService for PcapdClient {
    fn service_name() -> &'static str {
        "com.apple.pcapd"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

/// One captured packet and the header pcapd wraps it in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePacket {
    pub header_length: u32,
    pub header_version: u8,
    pub packet_length: u32,
    pub interface_type: u8,
    pub unit: u16,
    pub io: u8,
    pub protocol_family: u32,
    pub frame_pre_length: u32,
    pub frame_post_length: u32,
    pub interface_name: String,
    pub pid: u32,
    pub comm: String,
    pub svc: u32,
    pub epid: u32,
    pub ecomm: String,
    pub seconds: u32,
    pub microseconds: u32,
    pub data: Vec<u8>,
}

impl PcapdClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Reads the next packet, with raw IP frames given an ethernet header
    pub async fn next_packet(&mut self) -> Result<DevicePacket, IdeviceError> {
        let blob = match self.idevice.read_plist_value().await? {
            Value::Data(d) => d,
            _ => return Err(IdeviceError::UnexpectedResponse),
        };
        let mut packet = DevicePacket::parse(&blob)?;
        packet.normalize_data();
        Ok(packet)
    }

    /// Moves the capture onto its own task, publishing packets on a bounded channel
    ///
    /// The task ends when the receiver is dropped or the device hangs up.
    pub fn spawn_stream(
        mut self,
        buffer: usize,
    ) -> (mpsc::Receiver<DevicePacket>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    packet = self.next_packet() => match packet {
                        Ok(packet) => {
                            if tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("Packet capture ended: {e}");
                            break;
                        }
                    },
                }
            }
        });
        (rx, task)
    }
}

impl DevicePacket {
    pub fn parse(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let mut r = ByteReader { slice: bytes, cursor: 0 };
        let header_length = r.u32_be()?;
        let header_version = r.u8()?;
        let packet_length = r.u32_be()?;
        let interface_type = r.u8()?;
        let unit = u16::from_be_bytes(r.array()?);
        let io = r.u8()?;
        let protocol_family = r.u32_be()?;
        let frame_pre_length = r.u32_be()?;
        let frame_post_length = r.u32_be()?;
        let interface_name = r.cstr(16)?;
        let pid = r.u32_le()?;
        let comm = r.cstr(17)?;
        let svc = r.u32_be()?;
        let epid = r.u32_le()?;
        let ecomm = r.cstr(17)?;
        let seconds = r.u32_be()?;
        let microseconds = r.u32_be()?;

        let start = header_length as usize;
        let end = start.saturating_add(packet_length as usize);
        let data = bytes
            .get(start..end)
            .ok_or(IdeviceError::NotEnoughBytes(bytes.len(), end))?
            .to_vec();

        Ok(Self {
            header_length,
            header_version,
            packet_length,
            interface_type,
            unit,
            io,
            protocol_family,
            frame_pre_length,
            frame_post_length,
            interface_name,
            pid,
            comm,
            svc,
            epid,
            ecomm,
            seconds,
            microseconds,
            data,
        })
    }

    /// Gives raw IP frames a fake ethernet header so capture tools can dissect them
    pub fn normalize_data(&mut self) {
        if self.frame_pre_length == 0 {
            let mut data = ETHERNET_HEADER.to_vec();
            data.append(&mut self.data);
            self.data = data;
        } else if self.interface_name.starts_with("pdp_ip") && self.data.len() >= 4 {
            // cellular frames carry a 4 byte link prefix
            let mut data = ETHERNET_HEADER.to_vec();
            data.extend_from_slice(&self.data[4..]);
            self.data = data;
        }
    }
}

struct ByteReader<'a> {
    slice: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], IdeviceError> {
        let end = self.cursor.saturating_add(len);
        let out = self
            .slice
            .get(self.cursor..end)
            .ok_or(IdeviceError::NotEnoughBytes(self.slice.len(), end))?;
        self.cursor = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], IdeviceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, IdeviceError> {
        Ok(self.array::<1>()?[0])
    }

    fn u32_be(&mut self) -> Result<u32, IdeviceError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u32_le(&mut self) -> Result<u32, IdeviceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Fixed-width, NUL padded string
    fn cstr(&mut self, len: usize) -> Result<String, IdeviceError> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Writes packets as a classic big-endian `.pcap` file with ethernet link type
#[derive(Debug)]
pub struct PcapFileWriter<W: AsyncWrite + Unpin> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> PcapFileWriter<W> {
    /// Writes the global header
    pub async fn new(mut writer: W) -> Result<Self, IdeviceError> {
        let header = [
            0xa1, 0xb2, 0xc3, 0xd4, // magic
            0x00, 0x02, 0x00, 0x04, // version 2.4
            0x00, 0x00, 0x00, 0x00, // GMT
            0x00, 0x00, 0x00, 0x00, // sigfigs
            0x00, 0x04, 0x00, 0x00, // snaplen
            0x00, 0x00, 0x00, 0x01, // ethernet
        ];
        writer.write_all(&header).await?;
        Ok(Self { writer })
    }

    pub async fn write_packet(&mut self, packet: &DevicePacket) -> Result<(), IdeviceError> {
        let len = (packet.data.len() as u32).to_be_bytes();
        let mut record = Vec::with_capacity(16 + packet.data.len());
        record.extend_from_slice(&packet.seconds.to_be_bytes());
        record.extend_from_slice(&packet.microseconds.to_be_bytes());
        record.extend_from_slice(&len);
        record.extend_from_slice(&len);
        record.extend_from_slice(&packet.data);
        self.writer.write_all(&record).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), IdeviceError> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    /// Builds a pcapd blob around `frame`, as a device on `iface` would send it
    pub fn blob(iface: &str, pre: u32, frame: &[u8]) -> Vec<u8> {
        let mut name = [0u8; 16];
        name[..iface.len()].copy_from_slice(iface.as_bytes());
        let mut comm = [0u8; 17];
        comm[..6].copy_from_slice(b"Safari");

        let mut out = Vec::new();
        // header length patched below
        out.extend_from_slice(&0u32.to_be_bytes());
        out.push(2);
        out.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        out.push(6);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.push(0x4f);
        out.extend_from_slice(&2u32.to_be_bytes());
        out.extend_from_slice(&pre.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&name);
        out.extend_from_slice(&412u32.to_le_bytes());
        out.extend_from_slice(&comm);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&412u32.to_le_bytes());
        out.extend_from_slice(&comm);
        out.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        out.extend_from_slice(&250u32.to_be_bytes());
        let header_len = out.len() as u32;
        out[..4].copy_from_slice(&header_len.to_be_bytes());
        out.extend_from_slice(frame);
        out
    }
}
