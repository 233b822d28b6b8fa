//! iOS Installation Proxy Service Client
//!
//! Installs packages staged through AFC and looks up where installed apps live.
//! An install answers with a stream of messages on the one outstanding request,
//! ending with `Status: Complete` or an `Error`.

use std::collections::HashMap;

use plist::Dictionary;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Idevice, IdeviceError, IdeviceService};

#[derive(Debug)]
pub struct InstallationProxyClient {
    pub idevice: Idevice,
}

impl IdeviceService for InstallationProxyClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.installation_proxy"
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// Where an installed app lives, as returned by `Lookup`
#[derive(Debug, Clone, Deserialize)]
pub struct AppInfo {
    #[serde(rename = "Path")]
    pub path: String,
    /// Data container, absent for system apps
    #[serde(rename = "Container", default)]
    pub container: Option<String>,
    #[serde(rename = "CFBundleExecutable")]
    pub executable: String,
    #[serde(rename = "CFBundleIdentifier")]
    pub bundle_id: String,
}

/// One message of an install or uninstall progress stream
#[derive(Debug, Clone, PartialEq)]
pub enum InstallResponse {
    /// The operation finished
    Complete,
    /// The device resolved the package to this bundle identifier
    BundleIdentifier(String),
    /// Intermediate progress
    Progress { percent: u64, status: String },
    /// The device rejected the operation
    Error {
        error: String,
        description: Option<String>,
    },
    /// Anything else
    Unexpected(Dictionary),
}

impl From<Dictionary> for InstallResponse {
    /// Classifies a message, checking completion, then the bundle identifier, then
    /// percent complete
    fn from(dict: Dictionary) -> Self {
        let string = |key: &str| dict.get(key).and_then(|v| v.as_string());

        if string("Status") == Some("Complete") {
            return Self::Complete;
        }
        if let Some(id) = string("CFBundleIdentifier") {
            return Self::BundleIdentifier(id.to_string());
        }
        if let Some(percent) = dict
            .get("PercentComplete")
            .and_then(|p| p.as_unsigned_integer())
        {
            return Self::Progress {
                percent,
                status: string("Status").unwrap_or_default().to_string(),
            };
        }
        if let Some(error) = string("Error") {
            return Self::Error {
                error: error.to_string(),
                description: string("ErrorDescription").map(str::to_string),
            };
        }
        Self::Unexpected(dict)
    }
}

impl InstallationProxyClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Looks up installed apps by bundle identifier
    ///
    /// # Returns
    /// Info for every identifier the device knows, keyed by bundle identifier
    pub async fn lookup_app(
        &mut self,
        bundle_ids: &[&str],
    ) -> Result<HashMap<String, AppInfo>, IdeviceError> {
        let mut options = Dictionary::new();
        options.insert(
            "BundleIDs".into(),
            plist::Value::Array(bundle_ids.iter().map(|id| (*id).into()).collect()),
        );
        options.insert(
            "ReturnAttributes".into(),
            plist::Value::Array(
                ["Path", "Container", "CFBundleExecutable", "CFBundleIdentifier"]
                    .into_iter()
                    .map(Into::into)
                    .collect(),
            ),
        );
        options.insert("ApplicationsType".into(), "Any".into());

        let mut req = Dictionary::new();
        req.insert("Command".into(), "Lookup".into());
        req.insert("ClientOptions".into(), options.into());
        self.idevice.send_plist(req).await?;

        let mut res = self.idevice.read_plist().await?;
        match res.remove("LookupResult") {
            Some(plist::Value::Dictionary(apps)) => apps
                .into_iter()
                .map(|(id, info)| -> Result<_, IdeviceError> {
                    Ok((id, plist::from_value(&info)?))
                })
                .collect(),
            _ => {
                warn!("Lookup response had no LookupResult: {res:?}");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Installs a package previously uploaded to `package_path` on the device
    pub async fn install_app(
        &mut self,
        package_path: &str,
        bundle_id: &str,
    ) -> Result<(), IdeviceError> {
        self.install_app_with_callback(package_path, bundle_id, |_| {})
            .await
    }

    /// Installs a package, handing every intermediate message to `callback`
    ///
    /// Resolves only once the device reports completion.
    pub async fn install_app_with_callback(
        &mut self,
        package_path: &str,
        bundle_id: &str,
        callback: impl FnMut(&InstallResponse),
    ) -> Result<(), IdeviceError> {
        let mut options = Dictionary::new();
        options.insert("CFBundleIdentifier".into(), bundle_id.into());
        options.insert("ApplicationsType".into(), "Any".into());
        options.insert("PackageType".into(), "Developer".into());

        let mut req = Dictionary::new();
        req.insert("Command".into(), "Install".into());
        req.insert("PackagePath".into(), package_path.into());
        req.insert("ClientOptions".into(), options.into());
        debug!("Installing {package_path} as {bundle_id}");
        self.idevice.send_plist(req).await?;

        self.watch_completion(callback).await
    }

    /// Removes an installed app
    pub async fn uninstall_app(&mut self, bundle_id: &str) -> Result<(), IdeviceError> {
        let mut req = Dictionary::new();
        req.insert("Command".into(), "Uninstall".into());
        req.insert("ApplicationIdentifier".into(), bundle_id.into());
        req.insert("ClientOptions".into(), Dictionary::new().into());
        debug!("Uninstalling {bundle_id}");
        self.idevice.send_plist(req).await?;

        self.watch_completion(|_| {}).await
    }

    async fn watch_completion(
        &mut self,
        mut callback: impl FnMut(&InstallResponse),
    ) -> Result<(), IdeviceError> {
        loop {
            let res = InstallResponse::from(self.idevice.read_plist_raw().await?);
            match res {
                InstallResponse::Complete => return Ok(()),
                InstallResponse::Progress {
                    percent,
                    ref status,
                } => {
                    debug!("Installation status: {status}, {percent}%");
                    callback(&res);
                }
                InstallResponse::BundleIdentifier(ref id) => {
                    debug!("Installed app: {id}");
                    callback(&res);
                }
                InstallResponse::Error { error, .. } if error == "DeviceLocked" => {
                    return Err(IdeviceError::DeviceLocked)
                }
                InstallResponse::Error { error, description } => {
                    return Err(IdeviceError::InstallationProxyOperationFailed {
                        error,
                        description,
                    })
                }
                InstallResponse::Unexpected(dict) => {
                    warn!("Unexpected installation proxy message: {dict:?}");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            }
        }
    }
}
