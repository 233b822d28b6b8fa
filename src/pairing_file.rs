//! Host pairing records
//!
//! A pairing record holds the certificates and identifiers the host presents when it
//! starts a lockdown session. usbmuxd keeps one per trusted device; it can also be
//! read from disk.

use std::path::Path;

use plist::Data;
use rustls::pki_types::{pem::PemObject, CertificateDer};
use serde::Deserialize;
use tracing::warn;

use crate::IdeviceError;

/// Credentials and identifiers for one host/device pair
#[derive(Clone, Debug)]
pub struct PairingFile {
    /// Device's certificate in DER format
    pub device_certificate: CertificateDer<'static>,
    /// Host's private key, PEM encoded
    pub host_private_key: Vec<u8>,
    /// Host's certificate in DER format
    pub host_certificate: CertificateDer<'static>,
    /// Root CA's certificate in DER format
    pub root_certificate: CertificateDer<'static>,
    /// System Build Unique Identifier
    pub system_buid: String,
    /// Host identifier sent with `StartSession`
    pub host_id: String,
    pub udid: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(rename = "UDID", default)]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing record from a plist file on disk
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing record from plist bytes (XML or binary)
    ///
    /// # Errors
    /// Returns `Plist` if required fields are missing, `PemParseFailed` if a
    /// certificate is not valid PEM
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let raw = ::plist::from_bytes::<RawPairingFile>(bytes).map_err(|e| {
            warn!("Unable to parse pairing record: {e:?}");
            e
        })?;
        Ok(raw.try_into()?)
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let cert = |data: Data| CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(data));
        Ok(Self {
            device_certificate: cert(value.device_certificate)?,
            host_private_key: value.host_private_key.into(),
            host_certificate: cert(value.host_certificate)?,
            root_certificate: cert(value.root_certificate)?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            udid: value.udid,
        })
    }
}
