//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! Lists attached devices and turns a usbmuxd socket into a raw channel to a port
//! on one of them.

use std::{
    net::{AddrParseError, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::debug;

use crate::{
    codec::{plist::to_xml_bytes, FrameEncoder, LengthPrefix, PlistCodec},
    pairing_file::PairingFile,
    provider::UsbmuxdProvider,
    Idevice, IdeviceError,
};

mod des;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network
    Network,
    /// Unknown connection type with description
    Unknown(String),
}

/// Represents a device connected through usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    /// Environment variable overriding the default address
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Connects to the usbmuxd service
    pub async fn to_socket(&self) -> Result<crate::IdeviceSocket, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a new usbmuxd connection
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads the address from `USBMUXD_SOCKET_ADDRESS`, falling back to the default
    ///
    /// A value containing `:` is a TCP address, anything else a unix socket path.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }

    fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if !var.contains(':') {
            return Ok(Self::UnixSocket(var.to_string()));
        }
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Writer half of the usbmux envelope
///
/// Every message gets a 16-byte little-endian header (total length, version,
/// message type, tag) and a plist body carrying the client identification fields.
/// The tag is bumped on every write; responses are not correlated by it.
#[derive(Debug, Clone)]
pub struct UsbmuxCodec {
    tag: u32,
}

impl UsbmuxCodec {
    pub const HEADER_LEN: usize = 16;
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;
    /// usbmuxd protocol revision advertised in every request
    pub const LIB_USBMUX_VERSION: u64 = 3;

    pub const BUNDLE_ID: &'static str = "io.devrun.usbmux";
    pub const CLIENT_VERSION: &'static str = concat!("devrun-", env!("CARGO_PKG_VERSION"));
    pub const PROG_NAME: &'static str = "devrun";

    pub fn new(tag: u32) -> Self {
        Self { tag }
    }

    /// Tag the next message will carry
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Response decoder: the length field counts the header too
    pub const fn decoder() -> PlistCodec {
        PlistCodec::new(Self::HEADER_LEN, LengthPrefix::LittleEndian, true)
    }

    /// Builds the request body for `message_type` with caller-supplied extra fields
    pub fn request(message_type: &str, extra: plist::Dictionary) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("BundleID".into(), Self::BUNDLE_ID.into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("MessageType".into(), message_type.into());
        req.insert("ProgName".into(), Self::PROG_NAME.into());
        req.insert("kLibUSBMuxVersion".into(), Self::LIB_USBMUX_VERSION.into());
        for (k, v) in extra {
            req.insert(k, v);
        }
        req
    }
}

impl FrameEncoder for UsbmuxCodec {
    type Item = plist::Dictionary;

    fn encode(&mut self, item: &plist::Dictionary, dst: &mut Vec<u8>) -> Result<(), IdeviceError> {
        let body = to_xml_bytes(item)?;
        let total = body.len() + Self::HEADER_LEN;
        let total = u32::try_from(total).map_err(|_| IdeviceError::PacketTooLarge(total))?;

        dst.extend_from_slice(&total.to_le_bytes());
        dst.extend_from_slice(&Self::XML_PLIST_VERSION.to_le_bytes());
        dst.extend_from_slice(&Self::PLIST_MESSAGE_TYPE.to_le_bytes());
        dst.extend_from_slice(&self.tag.to_le_bytes());
        dst.extend_from_slice(&body);
        self.tag = self.tag.wrapping_add(1);
        Ok(())
    }
}

/// Active connection to the usbmuxd service
#[derive(Debug)]
pub struct UsbmuxdConnection {
    idevice: Idevice,
    codec: UsbmuxCodec,
}

impl UsbmuxdConnection {
    /// Creates a usbmuxd connection on an already open socket
    ///
    /// # Arguments
    /// * `socket` - The transport stream
    /// * `tag` - Tag of the first message sent
    pub fn new(socket: crate::IdeviceSocket, tag: u32) -> Self {
        Self {
            idevice: Idevice::new(socket, "usbmuxd"),
            codec: UsbmuxCodec::new(tag),
        }
    }

    /// Connects to usbmuxd at the address configured by the environment
    pub async fn default() -> Result<Self, IdeviceError> {
        UsbmuxdAddr::from_env_var()?.connect(0).await
    }

    /// Lists all connected devices
    ///
    /// An empty `DeviceList` is an empty vector, not an error.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        self.write_plist("ListDevices", plist::Dictionary::new())
            .await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        Ok(res
            .device_list
            .into_iter()
            .map(UsbmuxdDevice::from)
            .collect())
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        devices
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(IdeviceError::DeviceNotFound)
    }

    /// Gets the pairing record usbmuxd stores for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let mut extra = plist::Dictionary::new();
        extra.insert("PairRecordID".into(), udid.into());
        self.write_plist("ReadPairRecord", extra).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => Err(Self::result_error(&res)),
        }
    }

    /// Asks usbmuxd to forward this socket to `port` on the device
    ///
    /// On success the same socket, including anything already buffered from it, is
    /// handed back as a raw channel; usbmux framing is never spoken on it again.
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port to connect to (host byte order)
    /// * `label` - Label for the resulting connection
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");

        let mut extra = plist::Dictionary::new();
        extra.insert("DeviceID".into(), device_id.into());
        extra.insert("PortNumber".into(), port.to_be().into());
        self.write_plist("Connect", extra).await?;

        let res = self.read_plist().await?;
        match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
            Some(0) => {
                let (socket, buffer) = self
                    .idevice
                    .into_parts()
                    .ok_or(IdeviceError::NoEstablishedConnection)?;
                Ok(Idevice::with_buffer(socket, label, buffer))
            }
            _ => Err(Self::result_error(&res)),
        }
    }

    /// Maps a usbmuxd `Result` message to the matching error
    fn result_error(res: &plist::Dictionary) -> IdeviceError {
        match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
            Some(1) => IdeviceError::UsbBadCommand,
            Some(2) => IdeviceError::UsbBadDevice,
            Some(3) => IdeviceError::UsbConnectionRefused,
            Some(6) => IdeviceError::UsbBadVersion,
            _ => IdeviceError::UnexpectedResponse,
        }
    }

    async fn write_plist(
        &mut self,
        message_type: &str,
        extra: plist::Dictionary,
    ) -> Result<(), IdeviceError> {
        let req = UsbmuxCodec::request(message_type, extra);
        debug!("Writing to muxer (tag {}): {req:?}", self.codec.tag());
        self.idevice.write_frame(&mut self.codec, &req).await
    }

    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = self.idevice.read_frame(&UsbmuxCodec::decoder()).await?;
        debug!("Read from muxer: {res:?}");
        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::codec::{decode_frame, FrameDecoder};

    fn response(dict: plist::Dictionary, tag: u32) -> Vec<u8> {
        let mut codec = UsbmuxCodec::new(tag);
        let mut buf = Vec::new();
        codec.encode(&dict, &mut buf).unwrap();
        buf
    }

    async fn read_request(device: &mut DuplexStream) -> ([u8; 16], plist::Dictionary) {
        let mut header = [0u8; 16];
        device.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize - 16;
        let mut body = vec![0; len];
        device.read_exact(&mut body).await.unwrap();
        (header, plist::from_bytes(&body).unwrap())
    }

    #[test]
    fn header_carries_version_message_type_and_rising_tag() {
        let mut codec = UsbmuxCodec::new(5);
        let req = UsbmuxCodec::request("ListDevices", plist::Dictionary::new());
        let mut first = Vec::new();
        codec.encode(&req, &mut first).unwrap();
        let mut second = Vec::new();
        codec.encode(&req, &mut second).unwrap();

        assert_eq!(
            u32::from_le_bytes(first[..4].try_into().unwrap()) as usize,
            first.len()
        );
        assert_eq!(&first[4..8], &1u32.to_le_bytes());
        assert_eq!(&first[8..12], &8u32.to_le_bytes());
        assert_eq!(&first[12..16], &5u32.to_le_bytes());
        assert_eq!(&second[12..16], &6u32.to_le_bytes());

        let body: plist::Dictionary = plist::from_bytes(&first[16..]).unwrap();
        assert_eq!(
            body.get("MessageType").and_then(|v| v.as_string()),
            Some("ListDevices")
        );
        assert_eq!(
            body.get("kLibUSBMuxVersion")
                .and_then(|v| v.as_unsigned_integer()),
            Some(3)
        );
        assert!(body.contains_key("BundleID"));
        assert!(body.contains_key("ProgName"));
        assert!(body.contains_key("ClientVersionString"));
    }

    #[test]
    fn decoder_is_chunk_independent() {
        let mut dict = plist::Dictionary::new();
        dict.insert("Number".into(), 0u64.into());
        let mut wire = response(dict.clone(), 0);
        wire.extend(response(dict.clone(), 1));

        let decoder = UsbmuxCodec::decoder();
        assert_eq!(decoder.header_len(), 16);
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for b in wire {
            buf.extend_from_slice(&[b]);
            if let Some(d) = decode_frame(&decoder, &mut buf).unwrap() {
                out.push(d);
            }
        }
        assert_eq!(out, vec![dict.clone(), dict]);
    }

    #[tokio::test]
    async fn empty_device_list_is_not_an_error() {
        let (client, mut device) = tokio::io::duplex(4096);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        let server = tokio::spawn(async move {
            let (_, req) = read_request(&mut device).await;
            assert_eq!(
                req.get("MessageType").and_then(|v| v.as_string()),
                Some("ListDevices")
            );
            let mut res = plist::Dictionary::new();
            res.insert("DeviceList".into(), plist::Value::Array(Vec::new()));
            device.write_all(&response(res, 0)).await.unwrap();
        });

        let devices = conn.get_devices().await.unwrap();
        assert!(devices.is_empty());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lists_usb_devices() {
        let (client, mut device) = tokio::io::duplex(4096);
        let mut conn = UsbmuxdConnection::new(Box::new(client), 0);

        tokio::spawn(async move {
            read_request(&mut device).await;
            let mut props = plist::Dictionary::new();
            props.insert("ConnectionType".into(), "USB".into());
            props.insert("SerialNumber".into(), "00008030-001A".into());
            let mut entry = plist::Dictionary::new();
            entry.insert("DeviceID".into(), 3u64.into());
            entry.insert("Properties".into(), props.into());
            let mut res = plist::Dictionary::new();
            res.insert(
                "DeviceList".into(),
                plist::Value::Array(vec![entry.into()]),
            );
            device.write_all(&response(res, 0)).await.unwrap();
        });

        let devices = conn.get_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].udid, "00008030-001A");
        assert_eq!(devices[0].device_id, 3);
        assert_eq!(devices[0].connection_type, Connection::Usb);
    }

    #[tokio::test]
    async fn connect_hands_over_the_socket_with_buffered_bytes() {
        let (client, mut device) = tokio::io::duplex(4096);
        let conn = UsbmuxdConnection::new(Box::new(client), 0);

        tokio::spawn(async move {
            let (_, req) = read_request(&mut device).await;
            assert_eq!(
                req.get("PortNumber").and_then(|v| v.as_unsigned_integer()),
                Some(62078u16.to_be() as u64)
            );
            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 0u64.into());
            let mut wire = response(res, 0);
            // The service starts talking right behind the usbmux result.
            wire.extend_from_slice(&[0, 0, 0, 0]);
            device.write_all(&wire).await.unwrap();
            let mut echo = [0u8; 2];
            device.read_exact(&mut echo).await.unwrap();
            assert_eq!(&echo, b"hi");
        });

        let mut idevice = conn.connect_to_device(3, 62078, "test").await.unwrap();
        assert_eq!(idevice.label(), "test");
        let (_, buffer) = {
            idevice.send_raw(b"hi").await.unwrap();
            idevice.into_parts().unwrap()
        };
        assert!(buffer.len() <= 4);
    }

    #[tokio::test]
    async fn refused_connection_is_typed() {
        let (client, mut device) = tokio::io::duplex(4096);
        let conn = UsbmuxdConnection::new(Box::new(client), 0);

        tokio::spawn(async move {
            read_request(&mut device).await;
            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 3u64.into());
            device.write_all(&response(res, 0)).await.unwrap();
        });

        let err = conn.connect_to_device(3, 1234, "test").await.unwrap_err();
        assert!(matches!(err, IdeviceError::UsbConnectionRefused));
    }

    #[test]
    fn env_addresses_parse() {
        match UsbmuxdAddr::parse("127.0.0.1:27015").unwrap() {
            UsbmuxdAddr::TcpSocket(addr) => assert_eq!(addr.port(), 27015),
            #[cfg(unix)]
            other => panic!("unexpected address {other:?}"),
        }
        #[cfg(unix)]
        assert!(matches!(
            UsbmuxdAddr::parse("/tmp/usbmuxd").unwrap(),
            UsbmuxdAddr::UnixSocket(p) if p == "/tmp/usbmuxd"
        ));
    }
}
