//! iOS Lockdown Service Client
//!
//! Lockdown is the first service the host talks to. It answers device queries and
//! starts every other service on a port of its choosing.

use plist::Value;
use serde::Deserialize;
use tracing::{debug, error};

use crate::{pairing_file::PairingFile, Idevice, IdeviceError, IdeviceService};

/// Client for the lockdown service, always listening on port 62078
#[derive(Debug)]
pub struct LockdownClient {
    pub idevice: Idevice,
}

impl IdeviceService for LockdownClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.lockdown"
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

/// The identifying values lockdown reports without a session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceValues {
    #[serde(rename = "UniqueDeviceID")]
    pub unique_device_id: String,
    pub device_name: String,
    pub product_version: String,
    pub product_type: String,
    #[serde(default)]
    pub build_version: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
    #[serde(rename = "CPUArchitecture", default)]
    pub cpu_architecture: Option<String>,
}

impl LockdownClient {
    /// The port lockdown listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    fn request(&self, name: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.idevice.label().into());
        req.insert("Request".into(), name.into());
        req
    }

    /// Asks what kind of service is on the other end
    ///
    /// Lockdown answers `com.apple.mobile.lockdown`.
    pub async fn query_type(&mut self) -> Result<String, IdeviceError> {
        let req = self.request("QueryType");
        self.idevice.send_plist(req).await?;
        let res = self.idevice.read_plist().await?;
        res.get("Type")
            .and_then(|t| t.as_string())
            .map(str::to_string)
            .ok_or(IdeviceError::UnexpectedResponse)
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `key` - The value to read, or `None` for the whole domain
    /// * `domain` - Optional domain the key lives in
    ///
    /// # Example
    /// ```rust,no_run
    /// # async fn example(client: &mut devrun::lockdown::LockdownClient) -> Result<(), devrun::IdeviceError> {
    /// let version = client.get_value(Some("ProductVersion"), None).await?;
    /// println!("iOS version: {:?}", version);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.idevice.send_plist(req).await?;
        let mut res = self.idevice.read_plist().await?;
        res.remove("Value").ok_or(IdeviceError::UnexpectedResponse)
    }

    /// Reads every value lockdown exposes without a session
    pub async fn get_all_values(&mut self) -> Result<DeviceValues, IdeviceError> {
        let values = self.get_value(None, None).await?;
        Ok(plist::from_value(&values)?)
    }

    /// Starts a service and returns where to reach it
    ///
    /// # Returns
    /// The port the service listens on and whether it expects TLS
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), IdeviceError> {
        let identifier = identifier.into();
        let mut req = self.request("StartService");
        req.insert("Service".into(), identifier.clone().into());
        self.idevice.send_plist(req).await?;
        let res = self.idevice.read_plist().await?;

        // Over USB this key is normally absent.
        let ssl = res
            .get("EnableServiceSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);

        match res.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(port) => {
                let port = u16::try_from(port).map_err(|_| {
                    error!("Port {port} for {identifier} is out of range");
                    IdeviceError::UnexpectedResponse
                })?;
                debug!("Started {identifier} on port {port} (ssl: {ssl})");
                Ok((port, ssl))
            }
            None => {
                error!("Response didn't contain an integer port");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Starts an authenticated session and upgrades the socket to TLS
    ///
    /// Services whose `StartService` response asks for TLS are only reachable
    /// after this.
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        let mut req = self.request("StartSession");
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.idevice.send_plist(req).await?;

        let res = self.idevice.read_plist().await?;
        if res.get("SessionID").is_none() {
            return Err(IdeviceError::UnexpectedResponse);
        }
        if res
            .get("EnableSessionSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false)
        {
            self.idevice.start_session(pairing_file).await?;
        }
        Ok(())
    }
}

impl From<Idevice> for LockdownClient {
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}
