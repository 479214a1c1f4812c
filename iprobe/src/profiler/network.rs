//! Network activity events
//!
//! Each sample is `[kind, values]`. Addresses arrive as raw `sockaddr` bytes.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;
use tokio::sync::mpsc;

use super::{ProfilerRecord, ProfilerSession, Sampler, now, start_session};
use crate::{
    IdeviceError,
    dvt::{DtxValue, instruments::InstrumentsClient},
};

const AF_INET: u8 = 2;
const AF_INET6: u8 = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkRecord {
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: NetworkEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NetworkEvent {
    InterfaceDetection {
        interface_index: i64,
        name: String,
    },
    ConnectionDetected {
        local_address: String,
        remote_address: String,
        interface_index: i64,
        pid: i64,
        recv_buffer_size: i64,
        recv_buffer_used: i64,
        serial_number: i64,
        kind: i64,
    },
    ConnectionUpdate {
        rx_packets: i64,
        rx_bytes: i64,
        tx_packets: i64,
        tx_bytes: i64,
        rx_dups: i64,
        rx_ooo: i64,
        tx_retx: i64,
        min_rtt: f64,
        avg_rtt: f64,
        connection_serial: i64,
        time: i64,
    },
    /// An event kind we don't know how to read
    Raw { kind: i64, values: DtxValue },
}

impl NetworkEvent {
    pub fn decode(sample: &DtxValue) -> Result<Self, IdeviceError> {
        let parts = sample.expect_array()?;
        let [kind, values] = parts else {
            return Err(IdeviceError::UnexpectedValue {
                expected: "[kind, values]",
                found: format!("{} elements", parts.len()),
            });
        };
        let kind = kind.expect_i64()?;
        let Some(v) = values.as_array() else {
            return Ok(NetworkEvent::Raw {
                kind,
                values: values.clone(),
            });
        };
        let int = |i: usize| v.get(i).and_then(number).map(|f| f as i64).unwrap_or(0);
        let real = |i: usize| v.get(i).and_then(number).unwrap_or(0.0);

        Ok(match kind {
            0 => NetworkEvent::InterfaceDetection {
                interface_index: int(0),
                name: v.get(1).and_then(DtxValue::as_str).unwrap_or_default().to_string(),
            },
            1 => NetworkEvent::ConnectionDetected {
                local_address: v.first().map(socket_address).unwrap_or_default(),
                remote_address: v.get(1).map(socket_address).unwrap_or_default(),
                interface_index: int(2),
                pid: int(3),
                recv_buffer_size: int(4),
                recv_buffer_used: int(5),
                serial_number: int(6),
                kind: int(7),
            },
            2 => NetworkEvent::ConnectionUpdate {
                rx_packets: int(0),
                rx_bytes: int(1),
                tx_packets: int(2),
                tx_bytes: int(3),
                rx_dups: int(4),
                rx_ooo: int(5),
                tx_retx: int(6),
                min_rtt: real(7),
                avg_rtt: real(8),
                connection_serial: int(9),
                time: int(10),
            },
            _ => NetworkEvent::Raw {
                kind,
                values: values.clone(),
            },
        })
    }
}

fn number(v: &DtxValue) -> Option<f64> {
    v.as_i64().map(|i| i as f64).or_else(|| v.as_f64())
}

/// Renders a `sockaddr_in`/`sockaddr_in6` as `ip:port`, or hex when it is neither
fn socket_address(value: &DtxValue) -> String {
    let DtxValue::Data(bytes) = value else {
        return value.as_str().unwrap_or_default().to_string();
    };
    let port = |b: &[u8]| u16::from_be_bytes([b[2], b[3]]);
    let addr = match bytes.get(1) {
        Some(&AF_INET) if bytes.len() >= 8 => {
            let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            Some(SocketAddr::from((ip, port(bytes))))
        }
        Some(&AF_INET6) if bytes.len() >= 24 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[8..24]);
            Some(SocketAddr::from((Ipv6Addr::from(octets), port(bytes))))
        }
        _ => None,
    };
    match addr {
        Some(a) => a.to_string(),
        None => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}

/// Replays the last recorded session, then streams live events into `output`
pub async fn start(
    instruments: &InstrumentsClient,
    output: mpsc::Sender<ProfilerRecord>,
) -> Result<ProfilerSession, IdeviceError> {
    let networking = instruments.networking().await?;
    networking.replay_last_recorded_session().await?;
    let decoder = |sample: &DtxValue| -> Result<_, IdeviceError> {
        Ok(vec![ProfilerRecord::Network(NetworkRecord {
            timestamp: now(),
            event: NetworkEvent::decode(sample)?,
        })])
    };
    start_session(
        Sampler::Networking(networking.clone()),
        decoder,
        output,
        networking.start_monitoring(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: i64, values: Vec<DtxValue>) -> DtxValue {
        DtxValue::Array(vec![kind.into(), DtxValue::Array(values)])
    }

    #[test]
    fn interface_detection() {
        let e = NetworkEvent::decode(&event(0, vec![4i64.into(), "en0".into()])).unwrap();
        assert_eq!(
            e,
            NetworkEvent::InterfaceDetection {
                interface_index: 4,
                name: "en0".into()
            }
        );
    }

    #[test]
    fn connection_detected_reads_sockaddrs() {
        let v4 = vec![16, AF_INET, 0x01, 0xbb, 10, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut v6 = vec![28, AF_INET6, 0x00, 0x50, 0, 0, 0, 0];
        v6.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        v6.extend_from_slice(&[0; 4]);

        let e = NetworkEvent::decode(&event(
            1,
            vec![
                DtxValue::Data(v4),
                DtxValue::Data(v6),
                3i64.into(),
                321i64.into(),
            ],
        ))
        .unwrap();
        let NetworkEvent::ConnectionDetected {
            local_address,
            remote_address,
            interface_index,
            pid,
            serial_number,
            ..
        } = e
        else {
            panic!("expected a connection, got {e:?}");
        };
        assert_eq!(local_address, "10.0.0.7:443");
        assert_eq!(remote_address, "[::1]:80");
        assert_eq!(interface_index, 3);
        assert_eq!(pid, 321);
        assert_eq!(serial_number, 0);
    }

    #[test]
    fn connection_update_mixes_ints_and_reals() {
        let mut values: Vec<DtxValue> = (1..=7i64).map(DtxValue::from).collect();
        values.push(DtxValue::Real(0.5));
        values.push(DtxValue::Real(1.25));
        values.push(99i64.into());
        values.push(1700000000i64.into());
        let e = NetworkEvent::decode(&event(2, values)).unwrap();
        let NetworkEvent::ConnectionUpdate {
            rx_packets,
            tx_retx,
            avg_rtt,
            connection_serial,
            ..
        } = e
        else {
            panic!("expected an update, got {e:?}");
        };
        assert_eq!(rx_packets, 1);
        assert_eq!(tx_retx, 7);
        assert_eq!(avg_rtt, 1.25);
        assert_eq!(connection_serial, 99);
    }

    #[test]
    fn unknown_kinds_stay_raw() {
        let e = NetworkEvent::decode(&event(7, vec!["x".into()])).unwrap();
        assert!(matches!(e, NetworkEvent::Raw { kind: 7, .. }));
        assert!(NetworkEvent::decode(&DtxValue::Array(vec![1i64.into()])).is_err());
    }
}
