use serde::Deserialize;
use tracing::debug;

use crate::usbmuxd::{Connection, UsbmuxdDevice};

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList", default)]
    pub device_list: Vec<DeviceListResponse>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

impl From<DeviceListResponse> for UsbmuxdDevice {
    fn from(dev: DeviceListResponse) -> Self {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => Connection::Network,
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Device {} connected over {connection_type:?}", dev.device_id);
        UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        }
    }
}
