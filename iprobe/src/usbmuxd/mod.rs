//! USB Multiplexing Daemon (usbmuxd) client
//!
//! usbmuxd owns the physical links to attached devices. The host asks it for the device
//! list, for pairing records, and to turn a control socket into a raw stream to a port on
//! one device.

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
    sync::{Arc, Mutex},
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::{Stream, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError, ReadWrite, pairing_file::PairingFile, provider::UsbmuxdProvider,
    usbmuxd::des::DeviceListResponse,
};

mod des;
mod raw_packet;

use raw_packet::{HEADER_LEN, PacketHeader, RawPacket};

/// How a device is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device known to usbmuxd
#[derive(Debug, Clone, PartialEq)]
pub struct UsbmuxdDevice {
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
    pub product_id: Option<u32>,
}

/// Attach and detach notifications, in the order usbmuxd reports them
#[derive(Debug, Clone, PartialEq)]
pub enum UsbmuxdListenEvent {
    Connected(UsbmuxdDevice),
    /// The device ID of the removed device
    Disconnected(u32),
}

pub type ListenStream = Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send>>;

/// Active control connection to usbmuxd
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq)]
pub enum UsbmuxdAddr {
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Opens a raw stream to the daemon
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Opens a control connection tagged with `tag`
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }

    /// A value with a `:` is a TCP address, anything else a unix socket path
    pub fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;
    const CLIENT_VERSION: &'static str = concat!("iprobe-", env!("CARGO_PKG_VERSION"));

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self { socket, tag }
    }

    fn request(message_type: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("ProgName".into(), "iprobe".into());
        req.insert("kLibUSBMuxVersion".into(), 3.into());
        req
    }

    /// Lists all attached devices
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        self.write_plist(Self::request("ListDevices")).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .filter_map(|x| match x.into_usbmuxd_dev() {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping device with unreadable properties: {e:?}");
                    None
                }
            })
            .collect())
    }

    /// Finds one attached device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        devices
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(IdeviceError::DeviceNotFound)
    }

    /// Reads the pairing record usbmuxd stores for `udid`
    ///
    /// # Errors
    /// `PairingRecordMissing` when usbmuxd has no record for the device.
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = Self::request("ReadPairRecord");
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => {
                if let Some(n) = res.get("Number").and_then(|x| x.as_unsigned_integer()) {
                    debug!("ReadPairRecord result {n}");
                }
                Err(IdeviceError::PairingRecordMissing)
            }
        }
    }

    /// Stores a serialized pairing record for a device
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        pair_record: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let mut req = Self::request("SavePairRecord");
        req.insert("PairRecordData".into(), plist::Value::Data(pair_record));
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)
    }

    /// Removes the pairing record for `udid`
    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), IdeviceError> {
        let mut req = Self::request("DeletePairRecord");
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)
    }

    /// Reads the host's system BUID
    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        self.write_plist(Self::request("ReadBUID")).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Turns this control connection into a raw stream to `port` on the device
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - port in host byte order
    /// * `label` - label for the resulting connection
    ///
    /// # Errors
    /// The socket is closed on any non-zero result.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");

        let mut req = Self::request("Connect");
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.to_be().into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)?;
        Ok(Idevice::new(self.socket, label))
    }

    /// Subscribes to attach/detach events
    pub async fn listen(mut self) -> Result<ListenStream, IdeviceError> {
        self.write_plist(Self::request("Listen")).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)?;

        let stream = futures::stream::try_unfold(self, |mut conn| async move {
            loop {
                let msg = conn.read_plist().await?;
                match msg.get("MessageType").and_then(|s| s.as_string()) {
                    Some("Attached") => {
                        let props = match plist::from_value::<DeviceListResponse>(
                            &plist::Value::Dictionary(msg),
                        ) {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("Malformed attach message: {e:?}");
                                continue;
                            }
                        };
                        match props.into_usbmuxd_dev() {
                            Ok(d) => return Ok(Some((UsbmuxdListenEvent::Connected(d), conn))),
                            Err(e) => warn!("Failed to convert props into usbmuxd device: {e:?}"),
                        }
                    }
                    Some("Detached") => {
                        match msg.get("DeviceID").and_then(|v| v.as_unsigned_integer()) {
                            Some(id) => {
                                return Ok(Some((UsbmuxdListenEvent::Disconnected(id as u32), conn)));
                            }
                            None => debug!("Device detached (unknown ID)"),
                        }
                    }
                    Some("Paired") => debug!("Device paired"),
                    other => warn!("Received unexpected message type during listen: {other:?}"),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    /// Runs [`listen`](Self::listen) on its own task and calls back per event
    ///
    /// Callbacks must not call [`ListenHandle::cancel`] themselves.
    pub async fn watch<A, D>(self, on_attach: A, on_detach: D) -> Result<ListenHandle, IdeviceError>
    where
        A: Fn(UsbmuxdDevice) + Send + 'static,
        D: Fn(u32) + Send + 'static,
    {
        let mut events = self.listen().await?;
        let active = Arc::new(Mutex::new(true));
        let task_active = active.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Ok(guard) = task_active.lock() else {
                    break;
                };
                if !*guard {
                    break;
                }
                match event {
                    Ok(UsbmuxdListenEvent::Connected(d)) => on_attach(d),
                    Ok(UsbmuxdListenEvent::Disconnected(id)) => on_detach(id),
                    Err(e) => {
                        debug!("Listen stream ended: {e}");
                        break;
                    }
                }
            }
        });

        Ok(ListenHandle {
            active,
            task: Some(task),
        })
    }

    fn check_result(res: &plist::Dictionary) -> Result<(), IdeviceError> {
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(()),
            Some(1) => Err(IdeviceError::UsbBadCommand),
            Some(2) => Err(IdeviceError::UsbBadDevice),
            Some(3) => Err(IdeviceError::UsbConnectionRefused),
            Some(6) => Err(IdeviceError::UsbBadVersion),
            Some(n) => Err(IdeviceError::MuxerError(n)),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), IdeviceError> {
        debug!("Writing to muxer: {}", crate::pretty_print_dictionary(&req));
        let raw = RawPacket::new(req, Self::XML_PLIST_VERSION, Self::PLIST_MESSAGE_TYPE, self.tag);
        self.socket.write_all(&raw.to_bytes()?).await?;
        self.socket.flush().await?;
        Ok(())
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let mut header_buffer = [0; HEADER_LEN];
        self.socket.read_exact(&mut header_buffer).await?;
        let header = PacketHeader::parse(&header_buffer)?;

        let mut body_buffer = vec![0; header.body_len()];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));
        Ok(res)
    }
}

/// Keeps a [`UsbmuxdConnection::watch`] subscription alive
#[derive(Debug)]
pub struct ListenHandle {
    active: Arc<Mutex<bool>>,
    task: Option<JoinHandle<()>>,
}

impl ListenHandle {
    /// Stops delivery; no callback runs once this returns
    pub fn cancel(&mut self) {
        // callbacks run under this lock, so taking it waits out one in flight
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    async fn read_request(server: &mut DuplexStream) -> plist::Dictionary {
        let mut header = [0u8; HEADER_LEN];
        server.read_exact(&mut header).await.unwrap();
        let header = PacketHeader::parse(&header).unwrap();
        assert_eq!(header.version, UsbmuxdConnection::XML_PLIST_VERSION);
        assert_eq!(header.message, UsbmuxdConnection::PLIST_MESSAGE_TYPE);
        let mut body = vec![0; header.body_len()];
        server.read_exact(&mut body).await.unwrap();
        plist::from_bytes(&body).unwrap()
    }

    async fn reply(server: &mut DuplexStream, dict: plist::Dictionary) {
        let bytes = RawPacket::new(dict, 1, 8, 0).to_bytes().unwrap();
        server.write_all(&bytes).await.unwrap();
    }

    fn result(n: u64) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Result".into());
        d.insert("Number".into(), n.into());
        d
    }

    fn attached(id: u32, udid: &str) -> plist::Dictionary {
        let mut props = plist::Dictionary::new();
        props.insert("ConnectionType".into(), "USB".into());
        props.insert("SerialNumber".into(), udid.into());
        props.insert("ProductID".into(), 4776u32.into());
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Attached".into());
        d.insert("DeviceID".into(), id.into());
        d.insert("Properties".into(), props.into());
        d
    }

    fn detached(id: u32) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("MessageType".into(), "Detached".into());
        d.insert("DeviceID".into(), id.into());
        d
    }

    #[test]
    fn env_address_parsing() {
        assert_eq!(
            UsbmuxdAddr::parse("127.0.0.1:27015").unwrap(),
            UsbmuxdAddr::TcpSocket("127.0.0.1:27015".parse().unwrap())
        );
        #[cfg(unix)]
        assert_eq!(
            UsbmuxdAddr::parse("/tmp/mux").unwrap(),
            UsbmuxdAddr::UnixSocket("/tmp/mux".into())
        );
    }

    #[tokio::test]
    async fn list_devices() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 1);

        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(req.get("MessageType").and_then(|v| v.as_string()), Some("ListDevices"));
            let mut entry = attached(5, "udid-a");
            entry.remove("MessageType");
            let mut res = plist::Dictionary::new();
            res.insert("DeviceList".into(), vec![plist::Value::Dictionary(entry)].into());
            reply(&mut server, res).await;
        });

        let devices = conn.get_devices().await.unwrap();
        device.await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].udid, "udid-a");
        assert_eq!(devices[0].device_id, 5);
        assert_eq!(devices[0].connection_type, Connection::Usb);
    }

    #[tokio::test]
    async fn connect_sends_network_order_port() {
        let (client, mut server) = tokio::io::duplex(8192);
        let conn = UsbmuxdConnection::new(Box::new(client), 1);

        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(
                req.get("PortNumber").and_then(|v| v.as_unsigned_integer()),
                Some(62078u16.to_be() as u64)
            );
            reply(&mut server, result(0)).await;
            server
        });

        let idevice = conn.connect_to_device(5, 62078, "test").await.unwrap();
        assert_eq!(idevice.label(), "test");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_closes_socket() {
        let (client, mut server) = tokio::io::duplex(8192);
        let conn = UsbmuxdConnection::new(Box::new(client), 1);

        let device = tokio::spawn(async move {
            read_request(&mut server).await;
            reply(&mut server, result(3)).await;
            let mut buf = [0u8; 1];
            // client side dropped, so the read sees EOF
            server.read(&mut buf).await.unwrap()
        });

        assert!(matches!(
            conn.connect_to_device(5, 1234, "test").await,
            Err(IdeviceError::UsbConnectionRefused)
        ));
        assert_eq!(device.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_pair_record() {
        let (client, mut server) = tokio::io::duplex(8192);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 1);

        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(&mut server, result(2)).await;
            server
        });

        assert!(matches!(
            conn.get_pair_record("udid-a").await,
            Err(IdeviceError::PairingRecordMissing)
        ));
    }

    #[tokio::test]
    async fn listen_preserves_order() {
        let (client, mut server) = tokio::io::duplex(8192);
        let conn = UsbmuxdConnection::new(Box::new(client), 1);

        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(&mut server, result(0)).await;
            reply(&mut server, attached(1, "a")).await;
            reply(&mut server, attached(2, "b")).await;
            reply(&mut server, detached(1)).await;
            server
        });

        let events: Vec<_> = conn
            .listen()
            .await
            .unwrap()
            .take(3)
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert!(matches!(&events[0], UsbmuxdListenEvent::Connected(d) if d.udid == "a"));
        assert!(matches!(&events[1], UsbmuxdListenEvent::Connected(d) if d.udid == "b"));
        assert_eq!(events[2], UsbmuxdListenEvent::Disconnected(1));
    }

    #[tokio::test]
    async fn no_callbacks_after_cancel() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = UsbmuxdConnection::new(Box::new(client), 1);
        let (first_tx, mut first_rx) = tokio::sync::mpsc::unbounded_channel();

        let attaches = Arc::new(AtomicUsize::new(0));
        let counter = attaches.clone();

        let device = tokio::spawn(async move {
            read_request(&mut server).await;
            reply(&mut server, result(0)).await;
            reply(&mut server, attached(1, "a")).await;
            server
        });

        let mut handle = conn
            .watch(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = first_tx.send(());
                },
                |_| {},
            )
            .await
            .unwrap();

        first_rx.recv().await.unwrap();
        handle.cancel();
        let seen = attaches.load(Ordering::SeqCst);

        let mut server = device.await.unwrap();
        for i in 2..10 {
            let bytes = RawPacket::new(attached(i, "later"), 1, 8, 0).to_bytes().unwrap();
            // the reader may already be gone
            let _ = server.write_all(&bytes).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen, 1);
        assert_eq!(attaches.load(Ordering::SeqCst), 1);
    }
}
