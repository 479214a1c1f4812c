//! installation_proxy service client
//!
//! Queries and manages installed applications. Long-running commands stream progress
//! dictionaries until one carries `Status: Complete`.

use plist::Dictionary;
use tracing::warn;

use crate::{Idevice, IdeviceError, IdeviceService};

#[derive(Debug)]
pub struct InstallationProxyClient {
    idevice: Idevice,
}

impl IdeviceService for InstallationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.installation_proxy"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

fn command(name: &str, options: Option<Dictionary>) -> Dictionary {
    let mut req = Dictionary::new();
    req.insert("Command".into(), name.into());
    req.insert(
        "ClientOptions".into(),
        options.unwrap_or_default().into(),
    );
    req
}

impl InstallationProxyClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Looks up installed apps, keyed by bundle identifier
    ///
    /// # Arguments
    /// * `application_type` - `User`, `System`, `Any`; defaults to `Any`
    /// * `bundle_identifiers` - restrict to these apps
    pub async fn get_apps(
        &mut self,
        application_type: Option<&str>,
        bundle_identifiers: Option<Vec<String>>,
    ) -> Result<Dictionary, IdeviceError> {
        let mut options = Dictionary::new();
        options.insert(
            "ApplicationType".into(),
            application_type.unwrap_or("Any").into(),
        );
        if let Some(ids) = bundle_identifiers {
            options.insert(
                "BundleIDs".into(),
                plist::Value::Array(ids.into_iter().map(Into::into).collect()),
            );
        }
        self.idevice
            .send_plist(command("Lookup", Some(options)).into())
            .await?;

        let mut res = self.idevice.read_plist().await?;
        match res.remove("LookupResult") {
            Some(plist::Value::Dictionary(res)) => Ok(res),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Lists every app, accumulating the paged `CurrentList` replies
    pub async fn browse(
        &mut self,
        options: Option<Dictionary>,
    ) -> Result<Vec<plist::Value>, IdeviceError> {
        self.idevice
            .send_plist(command("Browse", options).into())
            .await?;

        let mut values = Vec::new();
        loop {
            let mut res = self.idevice.read_plist().await?;
            if let Some(list) = res.remove("CurrentList").and_then(|x| x.into_array()) {
                values.extend(list);
            }
            match res.get("Status").and_then(|x| x.as_string()) {
                Some("Complete") => break,
                Some(_) => {}
                None => {
                    warn!("Browse reply had no status");
                    break;
                }
            }
        }
        Ok(values)
    }

    /// Installs a package already staged on the device
    ///
    /// `progress` is called with the reported percentage.
    pub async fn install(
        &mut self,
        package_path: &str,
        options: Option<Dictionary>,
        progress: impl FnMut(u64),
    ) -> Result<(), IdeviceError> {
        let mut req = command("Install", options);
        req.insert("PackagePath".into(), package_path.into());
        self.idevice.send_plist(req.into()).await?;
        self.watch_completion(progress).await
    }

    pub async fn uninstall(
        &mut self,
        bundle_id: &str,
        options: Option<Dictionary>,
        progress: impl FnMut(u64),
    ) -> Result<(), IdeviceError> {
        let mut req = command("Uninstall", options);
        req.insert("ApplicationIdentifier".into(), bundle_id.into());
        self.idevice.send_plist(req.into()).await?;
        self.watch_completion(progress).await
    }

    async fn watch_completion(&mut self, mut progress: impl FnMut(u64)) -> Result<(), IdeviceError> {
        loop {
            let mut res = self.idevice.read_plist().await?;

            if let Some(e) = res.remove("ErrorDescription").and_then(|x| x.into_string()) {
                return Err(IdeviceError::InstallationProxyOperationFailed(e));
            }
            if let Some(c) = res
                .get("PercentComplete")
                .and_then(|x| x.as_unsigned_integer())
            {
                progress(c);
            }
            if res.get("Status").and_then(|x| x.as_string()) == Some("Complete") {
                return Ok(());
            }
        }
    }
}
