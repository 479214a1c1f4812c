//! Fake device endpoints for unit tests

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{
    Idevice, IdeviceError,
    pairing_file::{PairingFile, test_pairing_file},
    provider::IdeviceProvider,
};

pub async fn read_frame(stream: &mut DuplexStream) -> Option<plist::Dictionary> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.ok()?;
    let mut body = vec![0; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).await.ok()?;
    plist::from_bytes(&body).ok()
}

pub async fn write_frame(stream: &mut DuplexStream, dict: plist::Dictionary) {
    let mut body = Vec::new();
    plist::Value::Dictionary(dict)
        .to_writer_xml(&mut body)
        .unwrap();
    stream
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();
}

/// Behaviour of the fake lockdown endpoint
#[derive(Debug, Clone)]
pub struct MockLockdown {
    pub service_type: String,
    pub product_version: String,
    pub services: HashMap<String, u16>,
}

pub const INSTRUMENTS_PORT: u16 = 40002;
pub const SCREENSHOT_PORT: u16 = 40001;
pub const INSTALLATION_PROXY_PORT: u16 = 40004;
pub const IMAGE_MOUNTER_PORT: u16 = 40005;
pub const SYSLOG_PORT: u16 = 40006;
pub const HOUSE_ARREST_PORT: u16 = 40007;
pub const CRASH_MOVER_PORT: u16 = 40008;
pub const CRASH_COPY_PORT: u16 = 40009;
pub const DIAGNOSTICS_PORT: u16 = 40010;
pub const LOCATION_PORT: u16 = 40011;
pub const SPRINGBOARD_PORT: u16 = 40012;
pub const PCAPD_PORT: u16 = 40013;

impl Default for MockLockdown {
    fn default() -> Self {
        let services = [
            ("com.apple.mobile.screenshotr", SCREENSHOT_PORT),
            (
                "com.apple.instruments.remoteserver.DVTSecureSocketProxy",
                INSTRUMENTS_PORT,
            ),
            ("com.apple.instruments.remoteserver", INSTRUMENTS_PORT),
            ("com.apple.mobile.installation_proxy", INSTALLATION_PROXY_PORT),
            ("com.apple.mobile.mobile_image_mounter", IMAGE_MOUNTER_PORT),
            ("com.apple.syslog_relay", SYSLOG_PORT),
            ("com.apple.mobile.house_arrest", HOUSE_ARREST_PORT),
            ("com.apple.crashreportmover", CRASH_MOVER_PORT),
            ("com.apple.crashreportcopymobile", CRASH_COPY_PORT),
            ("com.apple.mobile.diagnostics_relay", DIAGNOSTICS_PORT),
            ("com.apple.dt.simulatelocation", LOCATION_PORT),
            ("com.apple.springboardservices", SPRINGBOARD_PORT),
            ("com.apple.pcapd", PCAPD_PORT),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            service_type: "com.apple.mobile.lockdown".into(),
            product_version: "17.2".into(),
            services,
        }
    }
}

/// Answers lockdown requests until the peer hangs up, returning the request names seen
pub async fn serve_lockdown(mut stream: DuplexStream, mock: MockLockdown) -> Vec<String> {
    let mut log = Vec::new();
    while let Some(req) = read_frame(&mut stream).await {
        let name = req
            .get("Request")
            .and_then(|r| r.as_string())
            .unwrap_or_default()
            .to_string();
        let mut res = plist::Dictionary::new();
        match name.as_str() {
            "QueryType" => {
                res.insert("Type".into(), mock.service_type.clone().into());
            }
            "StartSession" => {
                assert_eq!(
                    req.get("HostID").and_then(|v| v.as_string()),
                    Some("HOST-1")
                );
                res.insert("SessionID".into(), "session-1".into());
                res.insert("EnableSessionSSL".into(), false.into());
            }
            "StopSession" => {
                assert_eq!(
                    req.get("SessionID").and_then(|v| v.as_string()),
                    Some("session-1")
                );
            }
            "GetValue" => {
                let domain = req.get("Domain").and_then(|v| v.as_string());
                let key = req.get("Key").and_then(|v| v.as_string());
                let value: plist::Value = match (domain, key) {
                    (Some("com.apple.mobile.battery"), None) => {
                        let mut d = plist::Dictionary::new();
                        d.insert("BatteryCurrentCapacity".into(), 80.into());
                        d.insert("BatteryIsCharging".into(), true.into());
                        d.into()
                    }
                    (_, Some("ProductVersion")) => mock.product_version.clone().into(),
                    (_, Some(k)) => format!("value of {k}").into(),
                    (_, None) => {
                        let mut d = plist::Dictionary::new();
                        d.insert("DeviceName".into(), "Test iPhone".into());
                        d.into()
                    }
                };
                res.insert("Value".into(), value);
            }
            "StartService" => {
                let service = req
                    .get("Service")
                    .and_then(|v| v.as_string())
                    .unwrap_or_default();
                match mock.services.get(service) {
                    Some(port) => {
                        res.insert("Port".into(), (*port).into());
                        res.insert("Service".into(), service.into());
                    }
                    None => {
                        res.insert("Error".into(), "InvalidService".into());
                    }
                }
            }
            _ => {
                res.insert("Error".into(), "UnknownRequest".into());
            }
        }
        log.push(name);
        write_frame(&mut stream, res).await;
    }
    log
}

type PortHandler = Arc<dyn Fn(u16, DuplexStream) + Send + Sync>;

/// Provider that hands every connection to a handler running the fake service
#[derive(Clone)]
pub struct MockProvider {
    handler: PortHandler,
    pub connects: Arc<Mutex<Vec<u16>>>,
    pub lockdown_log: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider").finish_non_exhaustive()
    }
}

impl MockProvider {
    /// Serves lockdown on its port and passes any other port to `services`
    pub fn new(services: impl Fn(u16, DuplexStream) + Send + Sync + 'static) -> Self {
        let lockdown_log: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = lockdown_log.clone();
        let handler: PortHandler = Arc::new(move |port, stream| {
            if port == crate::lockdown::LockdownClient::LOCKDOWND_PORT {
                let log = log.clone();
                tokio::spawn(async move {
                    let seen = serve_lockdown(stream, MockLockdown::default()).await;
                    log.lock().unwrap().extend(seen);
                });
            } else {
                services(port, stream);
            }
        });
        Self {
            handler,
            connects: Arc::default(),
            lockdown_log,
        }
    }
}

impl IdeviceProvider for MockProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send + '_>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(1 << 20);
            self.connects.lock().unwrap().push(port);
            (self.handler)(port, server);
            Ok(Idevice::new(Box::new(client), "test"))
        })
    }

    fn label(&self) -> &str {
        "test"
    }

    fn get_pairing_file(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PairingFile, IdeviceError>> + Send + '_>> {
        Box::pin(async { Ok(test_pairing_file()) })
    }

    fn udid(&self) -> &str {
        "00008030-TEST"
    }
}
