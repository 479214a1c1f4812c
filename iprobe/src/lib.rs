#![doc = include_str!("../README.md")]

pub mod device;
pub mod file_transfer;
pub mod pairing_file;
pub mod profiler;
pub mod provider;
pub mod services;
#[cfg(test)]
mod test_util;
mod tls;
pub mod usbmuxd;
mod util;

pub use device::Device;
pub use services::*;
pub use util::{pretty_print_dictionary, pretty_print_plist};

use provider::IdeviceProvider;
use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for lockdown-started services on an iOS device
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by lockdown
    fn service_name() -> &'static str;

    /// Wraps an already connected service stream
    fn from_stream(idevice: Idevice) -> impl std::future::Future<Output = Result<Self, IdeviceError>> + Send;

    /// Starts the service through lockdown and connects to it
    fn connect(
        provider: &dyn IdeviceProvider,
    ) -> impl std::future::Future<Output = Result<Self, IdeviceError>> + Send {
        async move {
            let idevice = services::lockdown::start_service_stream(provider, Self::service_name()).await?;
            Self::from_stream(idevice).await
        }
    }
}

/// The transport underneath an [`Idevice`], plaintext or wrapped in TLS
#[derive(Debug)]
enum IdeviceSocket {
    Plain(Box<dyn ReadWrite>),
    Tls(Box<TlsStream<Box<dyn ReadWrite>>>),
}

impl IdeviceSocket {
    fn stream(&mut self) -> &mut (dyn ReadWrite + 'static) {
        match self {
            IdeviceSocket::Plain(s) => s.as_mut(),
            IdeviceSocket::Tls(s) => s.as_mut(),
        }
    }
}

/// Main handle for communicating with an iOS device
///
/// Owns one duplex byte stream (a muxed connection to a device port) and speaks the
/// length-prefixed plist framing most lockdown services use.
#[derive(Debug)]
pub struct Idevice {
    socket: Option<IdeviceSocket>,
    label: String,
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Client label sent along with requests
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(IdeviceSocket::Plain(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the stream is currently wrapped in TLS
    pub fn is_tls(&self) -> bool {
        matches!(self.socket, Some(IdeviceSocket::Tls(_)))
    }

    fn stream(&mut self) -> Result<&mut (dyn ReadWrite + 'static), IdeviceError> {
        match &mut self.socket {
            Some(s) => Ok(s.stream()),
            None => Err(IdeviceError::NoEstablishedConnection),
        }
    }

    /// Gives up the plist framing and returns the raw stream
    ///
    /// Used by the DTX client and by collaborators that speak their own wire format.
    pub fn into_socket(self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        match self.socket {
            Some(IdeviceSocket::Plain(s)) => Ok(s),
            Some(IdeviceSocket::Tls(s)) => Ok(s),
            None => Err(IdeviceError::NoEstablishedConnection),
        }
    }

    /// Sends a plist-formatted message, prefixed with its big-endian length
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        debug!("Sending plist: {}", pretty_print_plist(&message));
        let mut buf = Vec::new();
        message.to_writer_xml(&mut buf)?;
        let socket = self.stream()?;
        socket.write_all(&(buf.len() as u32).to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends a binary plist message, prefixed with its big-endian length
    pub async fn send_bplist(&mut self, message: plist::Value) -> Result<(), IdeviceError> {
        debug!("Sending bplist: {}", pretty_print_plist(&message));
        let mut buf = Vec::new();
        message.to_writer_binary(&mut buf)?;
        let socket = self.stream()?;
        socket.write_all(&(buf.len() as u32).to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Sends raw binary data to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        self.send_raw_with_progress(message, |_, _| {}).await
    }

    /// Sends raw binary data in 64 KiB chunks, reporting `(chunk, total)` after each one
    pub async fn send_raw_with_progress(
        &mut self,
        message: &[u8],
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), IdeviceError> {
        let socket = self.stream()?;
        let parts = message.chunks(1024 * 64);
        let total = parts.len();
        for (i, part) in parts.enumerate() {
            trace!("Writing chunk {}/{total}", i + 1);
            socket.write_all(part).await?;
            progress(i + 1, total);
        }
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes from the device
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, IdeviceError> {
        let socket = self.stream()?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes from the device
    pub async fn read_any(&mut self, max_size: u32) -> Result<Vec<u8>, IdeviceError> {
        let socket = self.stream()?;
        let mut buf = vec![0; max_size as usize];
        let len = socket.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Reads a length-prefixed plist message
    ///
    /// # Errors
    /// Replies carrying an `Error` key are mapped to the matching typed error.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = match self.read_plist_value().await? {
            plist::Value::Dictionary(d) => d,
            other => {
                return Err(IdeviceError::UnexpectedValue {
                    expected: "dictionary",
                    found: pretty_print_plist(&other),
                });
            }
        };

        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(IdeviceError::from_device_error_type(e, &res)
                .unwrap_or_else(|| IdeviceError::UnknownErrorType(e.to_string())));
        }
        Ok(res)
    }

    /// Reads one length-prefixed plist of any shape, XML or binary
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, IdeviceError> {
        let socket = self.stream()?;
        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        socket.read_exact(&mut buf).await?;
        let res: plist::Value = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_plist(&res));
        Ok(res)
    }

    /// Reads until `delimiter`, returning the bytes before it
    ///
    /// Returns `None` on a clean EOF and whatever was buffered on an EOF mid-line.
    pub async fn read_until_delim(
        &mut self,
        delimiter: &[u8],
    ) -> Result<Option<bytes::BytesMut>, IdeviceError> {
        let socket = self.stream()?;
        let mut buffer = bytes::BytesMut::with_capacity(1024);
        let mut byte = [0u8; 1];

        loop {
            let n = socket.read(&mut byte).await?;
            if n == 0 {
                return Ok(if buffer.is_empty() { None } else { Some(buffer) });
            }
            buffer.extend_from_slice(&byte);
            if buffer.ends_with(delimiter) {
                buffer.truncate(buffer.len() - delimiter.len());
                return Ok(Some(buffer));
            }
        }
    }

    /// Upgrades the connection to TLS using the host credentials of a pairing record
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), IdeviceError> {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(default_crypto_provider()));
        let config = tls::client_config(provider, pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = match self.socket.take() {
            Some(IdeviceSocket::Plain(s)) => s,
            Some(tls @ IdeviceSocket::Tls(_)) => {
                self.socket = Some(tls);
                return Err(IdeviceError::InvalidState("TLS session already active"));
            }
            None => return Err(IdeviceError::NoEstablishedConnection),
        };
        let server_name = ServerName::try_from("Device")
            .map_err(|_| IdeviceError::InvalidState("bad TLS server name"))?;
        let socket = connector.connect(server_name, socket).await?;
        self.socket = Some(IdeviceSocket::Tls(Box::new(socket)));
        Ok(())
    }

    /// Drops the TLS layer and returns the stream to plaintext
    pub fn stop_session(&mut self) {
        if let Some(IdeviceSocket::Tls(s)) = self.socket.take() {
            let (inner, _) = s.into_inner();
            self.socket = Some(IdeviceSocket::Plain(inner));
        }
    }
}

#[cfg(feature = "aws-lc")]
fn default_crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

#[cfg(all(feature = "ring", not(feature = "aws-lc")))]
fn default_crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(not(any(feature = "aws-lc", feature = "ring")))]
compile_error!("either the `aws-lc` or the `ring` feature must be enabled");

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IdeviceError {
    // transport
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device refused connection")]
    UsbConnectionRefused,
    #[error("bad command")]
    UsbBadCommand,
    #[error("bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,
    #[error("usbmuxd returned result {0}")]
    MuxerError(u64),
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("timed out waiting for the device")]
    Timeout,

    // protocol
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("NSKeyedArchive error")]
    NsKeyedArchiveError(#[from] ns_keyed_archive::ConverterError),
    #[error("failed to archive value: {0}")]
    ArchiveEncode(String),
    #[error("invalid DTX magic {0:#x}")]
    InvalidDtxMagic(u32),
    #[error("fragment {fragment} of {count} for message {identifier} arrived out of sequence")]
    UnexpectedFragment {
        identifier: u32,
        fragment: u16,
        count: u16,
    },
    #[error("unknown aux value type {0:#x}")]
    UnknownAuxValueType(u32),
    #[error("not enough bytes, expected {1}, got {0}")]
    NotEnoughBytes(usize, usize),
    #[error("expected {expected}, found {found}")]
    UnexpectedValue {
        expected: &'static str,
        found: String,
    },

    // remote
    #[error("device reported {domain} ({code}): {message}")]
    Remote {
        domain: String,
        code: i64,
        message: String,
    },
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("device locked")]
    DeviceLocked,
    #[error("service not found")]
    ServiceNotFound,
    #[error("image not mounted")]
    ImageNotMounted,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("installation proxy operation failed: {0}")]
    InstallationProxyOperationFailed(String),
    #[error("crash report mover sent the wrong response")]
    CrashReportMoverBadResponse(Vec<u8>),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    // state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("pairing record missing for this device")]
    PairingRecordMissing,
    #[error("invalid pairing file")]
    InvalidPairingFile,
    #[error("{0} profiler is already running")]
    ProfilerRunning(&'static str),
    #[error("app {0} is not installed")]
    AppNotInstalled(String),
    #[error("no running process for {0}")]
    ProcessNotRunning(String),
    #[error("not found")]
    NotFound,
    #[error("device refused to disable memory limits")]
    DisableMemoryLimitFailed,

    #[error("{operation} failed")]
    Operation {
        operation: &'static str,
        #[source]
        source: Box<IdeviceError>,
    },
}

impl IdeviceError {
    /// Converts a lockdown `Error` string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full reply, for the detailed error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InvalidService" => Some(Self::ServiceNotFound),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();

                if detailed_error.contains("There is no matching entry in the device map for") {
                    Some(Self::ImageNotMounted)
                } else {
                    Some(Self::InternalError(detailed_error))
                }
            }
            _ => None,
        }
    }

    /// The innermost error, skipping operation context
    pub fn root(&self) -> &IdeviceError {
        match self {
            IdeviceError::Operation { source, .. } => source.root(),
            e => e,
        }
    }
}

/// Attaches an operation name to a failed result
pub trait ResultExt<T> {
    fn context(self, operation: &'static str) -> Result<T, IdeviceError>;
}

impl<T> ResultExt<T> for Result<T, IdeviceError> {
    fn context(self, operation: &'static str) -> Result<T, IdeviceError> {
        self.map_err(|e| IdeviceError::Operation {
            operation,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plist_framing_is_length_prefixed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut idevice = Idevice::new(Box::new(client), "test");

        let mut dict = plist::Dictionary::new();
        dict.insert("Request".into(), "QueryType".into());
        idevice.send_plist(dict.into()).await.unwrap();

        let mut len = [0u8; 4];
        server.read_exact(&mut len).await.unwrap();
        let mut body = vec![0; u32::from_be_bytes(len) as usize];
        server.read_exact(&mut body).await.unwrap();
        let got: plist::Dictionary = plist::from_bytes(&body).unwrap();
        assert_eq!(got.get("Request").and_then(|v| v.as_string()), Some("QueryType"));
    }

    #[tokio::test]
    async fn device_error_key_is_typed() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut idevice = Idevice::new(Box::new(client), "test");

        let mut reply = plist::Dictionary::new();
        reply.insert("Error".into(), "InvalidService".into());
        let mut body = Vec::new();
        plist::Value::Dictionary(reply).to_writer_xml(&mut body).unwrap();
        server.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        server.write_all(&body).await.unwrap();

        assert!(matches!(
            idevice.read_plist().await,
            Err(IdeviceError::ServiceNotFound)
        ));
    }

    #[tokio::test]
    async fn read_until_delim_splits_lines() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut idevice = Idevice::new(Box::new(client), "test");
        server.write_all(b"first\n\0second\n\0tail").await.unwrap();
        drop(server);

        let a = idevice.read_until_delim(b"\n\0").await.unwrap().unwrap();
        let b = idevice.read_until_delim(b"\n\0").await.unwrap().unwrap();
        let c = idevice.read_until_delim(b"\n\0").await.unwrap().unwrap();
        assert_eq!(&a[..], b"first");
        assert_eq!(&b[..], b"second");
        assert_eq!(&c[..], b"tail");
        assert!(idevice.read_until_delim(b"\n\0").await.unwrap().is_none());
    }

    #[test]
    fn context_wraps_and_unwraps() {
        let r: Result<(), IdeviceError> = Err(IdeviceError::DeviceLocked);
        let e = r.context("battery info").unwrap_err();
        assert_eq!(e.to_string(), "battery info failed");
        assert!(matches!(e.root(), IdeviceError::DeviceLocked));
    }
}
