//! Ways of opening a raw channel to a port on the device

use std::{future::Future, pin::Pin};

use crate::{pairing_file::PairingFile, usbmuxd::UsbmuxdAddr, Idevice, IdeviceError};

/// Boxed future returned by [`IdeviceProvider`] methods
pub type ProviderFuture<T> = Pin<Box<dyn Future<Output = Result<T, IdeviceError>> + Send>>;

/// A provider for connecting to the iOS device
///
/// Every call to [`connect`](Self::connect) opens a brand new socket.
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect(&self, port: u16) -> ProviderFuture<Idevice>;

    fn label(&self) -> &str;

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile>;
}

/// Reaches the device through the host's usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl IdeviceProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> ProviderFuture<Idevice> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn get_pairing_file(&self) -> ProviderFuture<PairingFile> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let udid = self.udid.clone();

        Box::pin(async move {
            let mut usbmuxd = addr.connect(tag).await?;
            usbmuxd.get_pair_record(&udid).await
        })
    }
}
