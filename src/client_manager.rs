//! Per-device session that hops from lockdown to the services it starts

use tracing::debug;

use crate::{
    afc::AfcClient,
    debugserver::DebugserverClient,
    installation_proxy::InstallationProxyClient,
    lockdown::LockdownClient,
    mobile_image_mounter::ImageMounter,
    pairing_file::PairingFile,
    provider::IdeviceProvider,
    usbmuxd::UsbmuxdAddr,
    IdeviceError, IdeviceService,
};

/// Opens service clients for one device
///
/// One lockdown session is kept for the life of the manager. Every
/// [`start_service`](Self::start_service) call opens a new service socket, so
/// dropping a client is enough to close it.
#[derive(Debug)]
pub struct ClientManager {
    provider: Box<dyn IdeviceProvider>,
    pairing_file: Option<PairingFile>,
    lockdown: Option<LockdownClient>,
}

impl ClientManager {
    pub fn new(provider: impl IdeviceProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            pairing_file: None,
            lockdown: None,
        }
    }

    /// Connects through usbmuxd to the device with `udid`
    pub async fn for_udid(
        addr: UsbmuxdAddr,
        udid: &str,
        label: impl Into<String>,
    ) -> Result<Self, IdeviceError> {
        let mut usbmuxd = addr.connect(0).await?;
        let device = usbmuxd.get_device(udid).await?;
        Ok(Self::new(device.to_provider(addr, label)))
    }

    /// Connects through the default usbmuxd to the device with `udid`
    ///
    /// `USBMUXD_SOCKET_ADDRESS` overrides the platform's usbmuxd address.
    pub async fn for_udid_default(udid: &str) -> Result<Self, IdeviceError> {
        Self::for_udid(UsbmuxdAddr::from_env_var()?, udid, "devrun").await
    }

    pub fn provider(&self) -> &dyn IdeviceProvider {
        self.provider.as_ref()
    }

    async fn pairing_file(&mut self) -> Result<&PairingFile, IdeviceError> {
        if self.pairing_file.is_none() {
            self.pairing_file = Some(self.provider.get_pairing_file().await?);
        }
        self.pairing_file
            .as_ref()
            .ok_or_else(|| IdeviceError::InternalError("pairing file not cached".into()))
    }

    /// The lockdown client, connected and in a session after the first call
    pub async fn lockdown(&mut self) -> Result<&mut LockdownClient, IdeviceError> {
        if self.lockdown.is_none() {
            let pairing_file = self.pairing_file().await?.clone();
            let idevice = self.provider.connect(LockdownClient::LOCKDOWND_PORT).await?;
            let mut lockdown = LockdownClient::new(idevice);
            lockdown.start_session(&pairing_file).await?;
            self.lockdown = Some(lockdown);
        }
        self.lockdown
            .as_mut()
            .ok_or_else(|| IdeviceError::InternalError("lockdown not connected".into()))
    }

    /// Starts `T` through lockdown and connects to it
    pub async fn start_service<T: IdeviceService>(&mut self) -> Result<T, IdeviceError> {
        let (port, ssl) = self
            .lockdown()
            .await?
            .start_service(T::service_name())
            .await?;

        let mut idevice = self.provider.connect(port).await?;
        if ssl {
            let pairing_file = self.pairing_file().await?;
            idevice.start_session(pairing_file).await?;
        }
        debug!("Connected to {} on port {port}", T::service_name());
        Ok(T::from_idevice(idevice))
    }

    pub async fn afc(&mut self) -> Result<AfcClient, IdeviceError> {
        self.start_service().await
    }

    pub async fn installation_proxy(&mut self) -> Result<InstallationProxyClient, IdeviceError> {
        self.start_service().await
    }

    pub async fn image_mounter(&mut self) -> Result<ImageMounter, IdeviceError> {
        self.start_service().await
    }

    pub async fn debugserver(&mut self) -> Result<DebugserverClient, IdeviceError> {
        self.start_service().await
    }
}
