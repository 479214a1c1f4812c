//! house_arrest service client
//!
//! Vends an app's container or Documents directory. After a successful vend the same
//! connection speaks AFC, which is left to a file-transfer collaborator.

use plist::Dictionary;

use crate::{Idevice, IdeviceError, IdeviceService};

#[derive(Debug)]
pub struct HouseArrestClient {
    idevice: Idevice,
}

impl IdeviceService for HouseArrestClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.house_arrest"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl HouseArrestClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Vends the whole app container
    pub async fn vend_container(self, bundle_id: &str) -> Result<Idevice, IdeviceError> {
        self.vend(bundle_id, "VendContainer").await
    }

    /// Vends only the app's Documents directory
    pub async fn vend_documents(self, bundle_id: &str) -> Result<Idevice, IdeviceError> {
        self.vend(bundle_id, "VendDocuments").await
    }

    async fn vend(mut self, bundle_id: &str, cmd: &str) -> Result<Idevice, IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("Command".into(), cmd.into());
        req.insert("Identifier".into(), bundle_id.into());
        self.idevice.send_plist(req.into()).await?;
        let res = self.idevice.read_plist().await?;
        match res.get("Status").and_then(|s| s.as_string()) {
            Some("Complete") => Ok(self.idevice),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{read_frame, write_frame};

    #[tokio::test]
    async fn vend_documents_hands_back_stream() {
        let (a, mut b) = tokio::io::duplex(8192);
        let device = tokio::spawn(async move {
            let req = read_frame(&mut b).await.unwrap();
            assert_eq!(
                req.get("Command").and_then(|v| v.as_string()),
                Some("VendDocuments")
            );
            let mut res = Dictionary::new();
            res.insert("Status".into(), "Complete".into());
            write_frame(&mut b, res).await;
            b
        });

        let client = HouseArrestClient::new(Idevice::new(Box::new(a), "test"));
        let stream = client.vend_documents("com.example.app").await.unwrap();
        assert!(!stream.is_tls());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_app_is_an_error() {
        let (a, mut b) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            read_frame(&mut b).await.unwrap();
            let mut res = Dictionary::new();
            res.insert("Error".into(), "ApplicationLookupFailed".into());
            write_frame(&mut b, res).await;
            b
        });

        let client = HouseArrestClient::new(Idevice::new(Box::new(a), "test"));
        assert!(matches!(
            client.vend_container("com.example.none").await,
            Err(IdeviceError::UnknownErrorType(e)) if e == "ApplicationLookupFailed"
        ));
    }
}
