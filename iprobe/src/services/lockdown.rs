//! iOS Lockdown Service Client
//!
//! Lockdown listens on a fixed port and brokers everything else: device values, sessions,
//! and the ports of on-demand services.
//!
//! ```text
//! Connected --handshake--> Handshaken --start_session--> SessionActive
//!                              ^                               |
//!                              +--------stop_session-----------+
//! ```

use plist::Value;
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError, pairing_file::PairingFile, provider::IdeviceProvider, util,
};

/// Where a lockdown connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockdownState {
    Connected,
    Handshaken,
    SessionActive,
}

/// Client for the lockdown service
#[derive(Debug)]
pub struct LockdownClient {
    idevice: Idevice,
    state: LockdownState,
    pairing_file: Option<PairingFile>,
    session_id: Option<String>,
}

/// The port and security of a started service
///
/// A descriptor is good for exactly one connection; `connect` consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    pub enable_ssl: bool,
}

impl ServiceDescriptor {
    /// Opens the service port, upgrading to TLS when the device asked for it
    pub async fn connect(
        self,
        provider: &dyn IdeviceProvider,
        pairing_file: &PairingFile,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to {} on port {}", self.name, self.port);
        let mut idevice = provider.connect(self.port).await?;
        if self.enable_ssl {
            idevice.start_session(pairing_file).await?;
        }
        Ok(idevice)
    }
}

impl LockdownClient {
    pub const LOCKDOWND_PORT: u16 = 62078;
    pub const SERVICE_TYPE: &'static str = "com.apple.mobile.lockdown";

    /// Wraps a connection to the lockdown port
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            state: LockdownState::Connected,
            pairing_file: None,
            session_id: None,
        }
    }

    /// Connects to lockdown through `provider`
    pub async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(idevice))
    }

    pub fn state(&self) -> LockdownState {
        self.state
    }

    pub fn pairing_file(&self) -> Option<&PairingFile> {
        self.pairing_file.as_ref()
    }

    /// Asks lockdown what it is
    ///
    /// # Errors
    /// `UnexpectedValue` when the answer is not `com.apple.mobile.lockdown`.
    pub async fn query_type(&mut self) -> Result<String, IdeviceError> {
        let req = util::request("QueryType", self.idevice.label());
        self.idevice.send_plist(req.into()).await?;
        let res = self.idevice.read_plist().await?;
        match res.get("Type").and_then(|t| t.as_string()) {
            Some(t) if t == Self::SERVICE_TYPE => Ok(t.to_string()),
            Some(t) => Err(IdeviceError::UnexpectedValue {
                expected: Self::SERVICE_TYPE,
                found: t.to_string(),
            }),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Verifies the service type and remembers the pairing record for sessions
    pub async fn handshake(&mut self, pairing_file: PairingFile) -> Result<(), IdeviceError> {
        if pairing_file.host_id.is_empty() || pairing_file.system_buid.is_empty() {
            return Err(IdeviceError::InvalidPairingFile);
        }
        self.query_type().await?;
        self.pairing_file = Some(pairing_file);
        self.state = LockdownState::Handshaken;
        Ok(())
    }

    /// Handshakes with the pairing record `provider` holds for the device
    pub async fn handshake_with(
        &mut self,
        provider: &dyn IdeviceProvider,
    ) -> Result<(), IdeviceError> {
        let pairing_file = provider.get_pairing_file().await?;
        self.handshake(pairing_file).await
    }

    /// Starts a session, switching to TLS when the device enables it
    pub async fn start_session(&mut self) -> Result<(), IdeviceError> {
        match self.state {
            LockdownState::SessionActive => return Ok(()),
            LockdownState::Connected => {
                return Err(IdeviceError::InvalidState("lockdown handshake required"));
            }
            LockdownState::Handshaken => {}
        }
        let Some(pairing_file) = self.pairing_file.as_ref() else {
            return Err(IdeviceError::InvalidState("lockdown handshake required"));
        };

        let mut req = util::request("StartSession", self.idevice.label());
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.idevice.send_plist(req.into()).await?;

        let res = self.idevice.read_plist().await?;
        let session_id = res
            .get("SessionID")
            .and_then(|s| s.as_string())
            .ok_or(IdeviceError::UnexpectedResponse)?
            .to_string();
        let enable_ssl = res
            .get("EnableSessionSSL")
            .and_then(|b| b.as_boolean())
            .unwrap_or(false);

        if enable_ssl {
            self.idevice.start_session(pairing_file).await?;
        }
        debug!("Lockdown session {session_id} started (ssl: {enable_ssl})");
        self.session_id = Some(session_id);
        self.state = LockdownState::SessionActive;
        Ok(())
    }

    /// Ends the session and returns the connection to plaintext
    ///
    /// Does nothing when no session is active.
    pub async fn stop_session(&mut self) -> Result<(), IdeviceError> {
        if self.state != LockdownState::SessionActive {
            return Ok(());
        }
        let session_id = self.session_id.take().unwrap_or_default();
        self.state = LockdownState::Handshaken;

        let mut req = util::request("StopSession", self.idevice.label());
        req.insert("SessionID".into(), session_id.into());
        self.idevice.send_plist(req.into()).await?;
        let res = self.idevice.read_plist().await;
        self.idevice.stop_session();
        res.map(|_| ())
    }

    /// Reads a device value
    ///
    /// An empty `domain` or `key` is the same as leaving it out. Without an active
    /// session one is started for this call and stopped again afterwards.
    pub async fn get_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let domain = domain.filter(|d| !d.is_empty());
        let key = key.filter(|k| !k.is_empty());

        let bracketed = self.begin_bracket().await?;
        let res = self.request_value(domain, key).await;
        self.end_bracket(bracketed).await;
        res
    }

    async fn request_value(
        &mut self,
        domain: Option<&str>,
        key: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let mut req = util::request("GetValue", self.idevice.label());
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        self.idevice.send_plist(req.into()).await?;
        let mut res = self.idevice.read_plist().await?;
        res.remove("Value").ok_or(IdeviceError::UnexpectedResponse)
    }

    /// Asks lockdown to start `name` and returns where to reach it
    pub async fn start_service(
        &mut self,
        name: impl Into<String>,
    ) -> Result<ServiceDescriptor, IdeviceError> {
        let name = name.into();
        let bracketed = self.begin_bracket().await?;
        let res = self.request_service(&name).await;
        self.end_bracket(bracketed).await;
        let (port, enable_ssl) = res?;
        Ok(ServiceDescriptor {
            name,
            port,
            enable_ssl,
        })
    }

    async fn request_service(&mut self, name: &str) -> Result<(u16, bool), IdeviceError> {
        let mut req = util::request("StartService", self.idevice.label());
        req.insert("Service".into(), name.into());
        self.idevice.send_plist(req.into()).await?;
        let res = self.idevice.read_plist().await?;

        // over USB the flag is usually absent
        let ssl = res
            .get("EnableServiceSSL")
            .and_then(|b| b.as_boolean())
            .unwrap_or(false);
        match util::dict_u64(&res, "Port").and_then(|p| u16::try_from(p).ok()) {
            Some(port) => Ok((port, ssl)),
            None => {
                warn!("StartService reply for {name} had no usable port");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Reads `ProductVersion`
    pub async fn product_version(&mut self) -> Result<String, IdeviceError> {
        match self.get_value(None, Some("ProductVersion")).await? {
            Value::String(s) => Ok(s),
            other => Err(IdeviceError::UnexpectedValue {
                expected: "string",
                found: format!("{other:?}"),
            }),
        }
    }

    async fn begin_bracket(&mut self) -> Result<bool, IdeviceError> {
        match self.state {
            LockdownState::SessionActive => Ok(false),
            LockdownState::Handshaken => {
                self.start_session().await?;
                Ok(true)
            }
            LockdownState::Connected => {
                Err(IdeviceError::InvalidState("lockdown handshake required"))
            }
        }
    }

    async fn end_bracket(&mut self, bracketed: bool) {
        if bracketed {
            if let Err(e) = self.stop_session().await {
                warn!("Failed to stop lockdown session: {e}");
            }
        }
    }
}

/// Major component of a dotted iOS version string
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// Starts `name` through lockdown and connects to it
pub async fn start_service_stream(
    provider: &dyn IdeviceProvider,
    name: &str,
) -> Result<Idevice, IdeviceError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown.handshake_with(provider).await?;
    let descriptor = lockdown.start_service(name).await?;
    let pairing_file = lockdown
        .pairing_file
        .take()
        .ok_or(IdeviceError::InvalidState("lockdown handshake required"))?;
    descriptor.connect(provider, &pairing_file).await
}
