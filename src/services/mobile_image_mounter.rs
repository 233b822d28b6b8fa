//! Mobile Image Mounter client
//!
//! Uploads and mounts the developer disk image that carries debugserver.

use std::path::Path;

use plist::Dictionary;
use tracing::{debug, error};

use crate::{Idevice, IdeviceError, IdeviceService};

/// Where the mounter stages an image received with `ReceiveBytes`
pub const STAGED_IMAGE_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimage";

const IMAGE_TYPE: &str = "Developer";

#[derive(Debug)]
pub struct ImageMounter {
    pub idevice: Idevice,
}

impl IdeviceService for ImageMounter {
    fn service_name() -> &'static str {
        "com.apple.mobile.mobile_image_mounter"
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// Status of a mounter reply
#[derive(Debug, Clone, PartialEq)]
pub enum MounterResponse {
    ReceiveBytesAck,
    Complete,
    Other(Dictionary),
}

impl From<Dictionary> for MounterResponse {
    fn from(dict: Dictionary) -> Self {
        match dict.get("Status").and_then(|s| s.as_string()) {
            Some("ReceiveBytesAck") => Self::ReceiveBytesAck,
            Some("Complete") => Self::Complete,
            _ => Self::Other(dict),
        }
    }
}

impl ImageMounter {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    async fn command(&mut self, req: Dictionary) -> Result<MounterResponse, IdeviceError> {
        self.idevice.send_plist(req).await?;
        Ok(self.idevice.read_plist().await?.into())
    }

    fn request(command: &str) -> Dictionary {
        let mut req = Dictionary::new();
        req.insert("Command".into(), command.into());
        req.insert("ImageType".into(), IMAGE_TYPE.into());
        req
    }

    /// Signature of the mounted developer image, `None` if nothing is mounted
    pub async fn lookup_image(&mut self) -> Result<Option<Vec<u8>>, IdeviceError> {
        self.idevice
            .send_plist(Self::request("LookupImage"))
            .await?;
        let mut res = self.idevice.read_plist().await?;

        // Newer devices answer with a list of signatures.
        Ok(match res.remove("ImageSignature") {
            Some(plist::Value::Data(sig)) => Some(sig),
            Some(plist::Value::Array(sigs)) => sigs.into_iter().find_map(|s| s.into_data()),
            _ => None,
        })
    }

    /// Streams a disk image from the host onto the device
    ///
    /// The device acknowledges the announced size with `ReceiveBytesAck`, takes the
    /// raw image bytes, then reports `Complete`.
    pub async fn upload_image(
        &mut self,
        image_path: impl AsRef<Path>,
        signature: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let image_path = image_path.as_ref();
        let mut image = tokio::fs::File::open(image_path).await?;
        let image_size = image.metadata().await?.len();
        debug!("Uploading {} ({image_size} bytes)", image_path.display());

        let mut req = Self::request("ReceiveBytes");
        req.insert("ImageSize".into(), image_size.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        match self.command(req).await? {
            MounterResponse::ReceiveBytesAck => {}
            res => {
                error!("Received bad response to ReceiveBytes: {res:?}");
                return Err(IdeviceError::ImageMounterFailed(format!(
                    "upload of {} was not acknowledged",
                    image_path.display()
                )));
            }
        }

        let sent = self.idevice.send_from_reader(&mut image).await?;
        if sent != image_size {
            return Err(IdeviceError::ImageMounterFailed(format!(
                "image changed size during upload: {sent} of {image_size} bytes"
            )));
        }

        match MounterResponse::from(self.idevice.read_plist().await?) {
            MounterResponse::Complete => Ok(()),
            res => {
                error!("Image send failure: {res:?}");
                Err(IdeviceError::ImageMounterFailed(format!(
                    "upload of {} did not complete",
                    image_path.display()
                )))
            }
        }
    }

    /// Mounts an image already staged on the device
    pub async fn mount_image(
        &mut self,
        image_path: &str,
        signature: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let mut req = Self::request("MountImage");
        req.insert("ImagePath".into(), image_path.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        match self.command(req).await? {
            MounterResponse::Complete => Ok(()),
            res => {
                error!("Mount failure: {res:?}");
                Err(IdeviceError::ImageMounterFailed(format!(
                    "mounting {image_path} failed"
                )))
            }
        }
    }
}
