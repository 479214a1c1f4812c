//! mobile_image_mounter service client
//!
//! Uploads a developer disk image with its signature and mounts it. The upload is a
//! `ReceiveBytes` command, an ack, the raw image bytes, then a `Complete` status.

use tracing::{debug, error};

use crate::{Idevice, IdeviceError, IdeviceService};

/// Where developer disk images are staged before mounting
pub const STAGING_IMAGE_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimage";

#[derive(Debug)]
pub struct ImageMounter {
    idevice: Idevice,
}

impl IdeviceService for ImageMounter {
    fn service_name() -> &'static str {
        "com.apple.mobile.mobile_image_mounter"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

fn command(name: &str) -> plist::Dictionary {
    let mut req = plist::Dictionary::new();
    req.insert("Command".into(), name.into());
    req
}

fn expect_status(res: &plist::Dictionary, expected: &str) -> Result<(), IdeviceError> {
    match res.get("Status").and_then(|s| s.as_string()) {
        Some(s) if s == expected => Ok(()),
        other => {
            error!("Expected status {expected}, got {other:?}");
            Err(IdeviceError::UnexpectedResponse)
        }
    }
}

impl ImageMounter {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Lists the mounted images
    pub async fn copy_devices(&mut self) -> Result<Vec<plist::Value>, IdeviceError> {
        self.idevice.send_plist(command("CopyDevices").into()).await?;
        let mut res = self.idevice.read_plist().await?;

        match res.remove("EntryList") {
            Some(plist::Value::Array(i)) => Ok(i),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Signatures of the mounted images of `image_type`; empty when none is mounted
    ///
    /// Older devices answer with a single data value, newer ones with an array.
    pub async fn lookup_image(&mut self, image_type: &str) -> Result<Vec<Vec<u8>>, IdeviceError> {
        let mut req = command("LookupImage");
        req.insert("ImageType".into(), image_type.into());
        self.idevice.send_plist(req.into()).await?;

        let mut res = self.idevice.read_plist().await?;
        Ok(match res.remove("ImageSignature") {
            Some(plist::Value::Data(signature)) => vec![signature],
            Some(plist::Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.into_data())
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Streams an image to the device
    ///
    /// `progress` receives `(chunk, total_chunks)`.
    pub async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
        progress: impl FnMut(usize, usize),
    ) -> Result<(), IdeviceError> {
        let mut req = command("ReceiveBytes");
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSize".into(), (image.len() as u64).into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.idevice.send_plist(req.into()).await?;

        let res = self.idevice.read_plist().await?;
        expect_status(&res, "ReceiveBytesAck")?;

        debug!("Sending {} image bytes", image.len());
        self.idevice.send_raw_with_progress(image, progress).await?;

        let res = self.idevice.read_plist().await?;
        expect_status(&res, "Complete")
    }

    /// Mounts an uploaded image
    pub async fn mount_image(
        &mut self,
        image_type: &str,
        image_path: &str,
        signature: &[u8],
    ) -> Result<(), IdeviceError> {
        let mut req = command("MountImage");
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImagePath".into(), image_path.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        self.idevice.send_plist(req.into()).await?;

        let res = self.idevice.read_plist().await?;
        expect_status(&res, "Complete")
    }

    pub async fn unmount_image(&mut self, mount_path: &str) -> Result<(), IdeviceError> {
        let mut req = command("UnmountImage");
        req.insert("MountPath".into(), mount_path.into());
        self.idevice.send_plist(req.into()).await?;

        let res = self.idevice.read_plist().await?;
        expect_status(&res, "Complete")
    }

    pub async fn query_developer_mode_status(&mut self) -> Result<bool, IdeviceError> {
        self.idevice
            .send_plist(command("QueryDeveloperModeStatus").into())
            .await?;

        let res = self.idevice.read_plist().await?;
        res.get("DeveloperModeStatus")
            .and_then(|s| s.as_boolean())
            .ok_or(IdeviceError::UnexpectedResponse)
    }

    /// Uploads and mounts `image` unless an image of that type is already mounted
    ///
    /// Returns whether a mount happened.
    pub async fn upload_and_mount(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
    ) -> Result<bool, IdeviceError> {
        if !self.lookup_image(image_type).await?.is_empty() {
            debug!("{image_type} image already mounted");
            return Ok(false);
        }
        self.upload_image(image_type, image, signature, |_, _| {})
            .await?;
        self.mount_image(image_type, STAGING_IMAGE_PATH, signature)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{read_frame, write_frame};
    use tokio::io::AsyncReadExt;

    fn status(s: &str) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        d.insert("Status".into(), s.into());
        d
    }

    #[tokio::test]
    async fn lookup_accepts_both_signature_shapes() {
        let (a, mut b) = tokio::io::duplex(8192);
        tokio::spawn(async move {
            read_frame(&mut b).await.unwrap();
            let mut d = status("Complete");
            d.insert("ImageSignature".into(), plist::Value::Data(vec![1, 2]));
            write_frame(&mut b, d).await;

            read_frame(&mut b).await.unwrap();
            let mut d = status("Complete");
            d.insert(
                "ImageSignature".into(),
                vec![plist::Value::Data(vec![3]), plist::Value::Data(vec![4])].into(),
            );
            write_frame(&mut b, d).await;

            read_frame(&mut b).await.unwrap();
            write_frame(&mut b, status("Complete")).await;
            b
        });

        let mut mounter = ImageMounter::new(Idevice::new(Box::new(a), "test"));
        assert_eq!(mounter.lookup_image("Developer").await.unwrap(), [vec![1, 2]]);
        assert_eq!(
            mounter.lookup_image("Developer").await.unwrap(),
            [vec![3], vec![4]]
        );
        assert!(mounter.lookup_image("Developer").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_and_mount_when_not_mounted() {
        let image = vec![7u8; 100_000];
        let expected = image.clone();
        let (a, mut b) = tokio::io::duplex(1 << 20);
        let device = tokio::spawn(async move {
            let lookup = read_frame(&mut b).await.unwrap();
            assert_eq!(lookup.get("Command").and_then(|v| v.as_string()), Some("LookupImage"));
            write_frame(&mut b, status("Complete")).await;

            let receive = read_frame(&mut b).await.unwrap();
            let size = receive.get("ImageSize").and_then(|v| v.as_unsigned_integer()).unwrap();
            write_frame(&mut b, status("ReceiveBytesAck")).await;
            let mut body = vec![0u8; size as usize];
            b.read_exact(&mut body).await.unwrap();
            assert_eq!(body, expected);
            write_frame(&mut b, status("Complete")).await;

            let mount = read_frame(&mut b).await.unwrap();
            assert_eq!(
                mount.get("ImagePath").and_then(|v| v.as_string()),
                Some(STAGING_IMAGE_PATH)
            );
            write_frame(&mut b, status("Complete")).await;
            b
        });

        let mut mounter = ImageMounter::new(Idevice::new(Box::new(a), "test"));
        assert!(mounter.upload_and_mount("Developer", &image, b"sig").await.unwrap());
        device.await.unwrap();
    }
}
