#![doc = include_str!("../README.md")]

pub mod client_manager;
pub mod codec;
pub mod pairing_file;
pub mod provider;
pub mod run;
pub mod services;
mod tls;
pub mod usbmuxd;

#[cfg(test)]
mod test_util;

pub use client_manager::ClientManager;
pub use services::*;

use bytes::BytesMut;
use codec::{FrameDecoder, FrameEncoder, PlistCodec};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's `TcpStream`, `UnixStream` and `DuplexStream` implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that are started through lockdown
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by lockdown
    fn service_name() -> &'static str;

    /// Wraps an already connected service socket
    fn from_idevice(idevice: Idevice) -> Self;
}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Handle on a single socket hop to the device
///
/// Owns the socket and every byte read from it that has not been decoded yet, so a
/// socket can change protocols (usbmux `Connect`, TLS upgrade) without losing data.
pub struct Idevice {
    socket: Option<IdeviceSocket>,
    buffer: BytesMut,
    label: String,
}

impl std::fmt::Debug for Idevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idevice")
            .field("label", &self.label)
            .field("buffered", &self.buffer.len())
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Label sent with lockdown requests
    pub fn new(socket: IdeviceSocket, label: impl Into<String>) -> Self {
        Self::with_buffer(socket, label, BytesMut::new())
    }

    /// Creates a handle whose socket already had bytes read ahead of the caller
    pub fn with_buffer(socket: IdeviceSocket, label: impl Into<String>, buffer: BytesMut) -> Self {
        Self {
            socket: Some(socket),
            buffer,
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reads from the socket until `decoder` yields one complete message
    ///
    /// Bytes past the end of the message stay buffered for the next read.
    ///
    /// # Errors
    /// Transport errors are returned as [`IdeviceError::Socket`], the socket closing
    /// mid-frame as `UnexpectedEof`. Decoder errors are returned untouched.
    pub async fn read_frame<D: FrameDecoder>(
        &mut self,
        decoder: &D,
    ) -> Result<D::Item, IdeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        loop {
            if let Some(item) = codec::decode_frame(decoder, &mut self.buffer)? {
                return Ok(item);
            }
            let read = socket.read_buf(&mut self.buffer).await?;
            trace!("Read {read} bytes, {} buffered", self.buffer.len());
            if read == 0 {
                return Err(IdeviceError::Socket(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "socket closed before a full frame arrived",
                )));
            }
        }
    }

    /// Serializes one message with `encoder` and writes it as a single ordered write
    pub async fn write_frame<E: FrameEncoder>(
        &mut self,
        encoder: &mut E,
        item: &E::Item,
    ) -> Result<(), IdeviceError> {
        let mut buf = Vec::new();
        encoder.encode(item, &mut buf)?;
        self.send_raw(&buf).await
    }

    /// Sends a length-prefixed XML plist
    pub(crate) async fn send_plist(&mut self, message: plist::Dictionary) -> Result<(), IdeviceError> {
        debug!("Sending plist: {message:?}");
        self.write_frame(&mut PlistCodec::lockdown(), &message).await
    }

    /// Reads a length-prefixed plist, converting an `Error` field into a typed error
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = self.read_plist_raw().await?;
        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(IdeviceError::from_device_error_type(e, &res));
        }
        Ok(res)
    }

    /// Reads a length-prefixed plist without interpreting its contents
    pub(crate) async fn read_plist_raw(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let res = self.read_frame(&PlistCodec::lockdown()).await?;
        debug!("Received plist: {res:?}");
        Ok(res)
    }

    /// Sends raw binary data to the device
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Copies everything from `reader` onto the socket without framing
    ///
    /// # Returns
    /// The number of bytes written
    pub async fn send_from_reader<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<u64, IdeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        let written = tokio::io::copy(reader, socket).await?;
        socket.flush().await?;
        Ok(written)
    }

    /// Upgrades the connection to TLS using device pairing credentials
    ///
    /// # Errors
    /// Returns `IdeviceError` if TLS handshake fails or credentials are invalid
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), IdeviceError> {
        let socket = self
            .socket
            .take()
            .ok_or(IdeviceError::NoEstablishedConnection)?;
        if !self.buffer.is_empty() {
            warn!(
                "Discarding {} plaintext bytes before TLS handshake",
                self.buffer.len()
            );
            self.buffer.clear();
        }
        let socket = tls::connect(pairing_file, socket).await?;
        self.socket = Some(Box::new(socket));
        Ok(())
    }

    /// Drops every buffered byte that has not been decoded
    ///
    /// Used after a framing error, when the position of the next frame is unknown.
    pub(crate) fn discard_buffered(&mut self) {
        if !self.buffer.is_empty() {
            warn!("Discarding {} undecodable bytes", self.buffer.len());
            self.buffer.clear();
        }
    }

    /// Splits the handle into its socket and any bytes buffered ahead of the caller
    pub fn into_parts(mut self) -> Option<(IdeviceSocket, BytesMut)> {
        let socket = self.socket.take()?;
        Some((socket, self.buffer))
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed: {0}")]
    Socket(#[from] io::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("message of {0} bytes is too large to frame")]
    PacketTooLarge(usize),
    #[error("internal error: {0}")]
    InternalError(String),

    #[error("device not found")]
    DeviceNotFound,
    #[error("device refused connection")]
    UsbConnectionRefused,
    #[error("bad command")]
    UsbBadCommand,
    #[error("bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,

    #[error("device is locked")]
    DeviceLocked,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("service is not available")]
    InvalidService,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("afc error: {0}")]
    Afc(#[from] services::afc::errors::AfcError),
    #[error("malformed afc packet for request {request_id}: {reason}")]
    AfcFraming {
        request_id: u64,
        reason: &'static str,
    },
    #[error("afc response for unknown request {0}")]
    UnknownAfcRequest(u64),
    #[error("missing file attribute")]
    AfcMissingAttribute,

    #[error("debugserver sent {0:#04x} instead of an ack")]
    GdbNack(u8),
    #[error("debugserver packet has no checksum")]
    GdbMissingChecksum,
    #[error("debugserver packet checksum mismatch: received {received}, computed {computed}")]
    GdbChecksumMismatch { received: String, computed: String },
    #[error("malformed debugserver packet")]
    GdbMalformedPacket,

    #[error("device busy or app not found: {0}")]
    LaunchBusy(String),
    #[error("there was an error launching app: {0}")]
    LaunchFailed(String),
    #[error("unable to launch app, number of tries exceeded")]
    LaunchTriesExceeded,

    #[error("installation proxy operation failed: {error}")]
    InstallationProxyOperationFailed {
        error: String,
        description: Option<String>,
    },
    #[error("app {0} was not found on the device")]
    AppNotFound(String),
    #[error("image mounter operation failed: {0}")]
    ImageMounterFailed(String),
    #[error("no developer disk image available for iOS {0}")]
    MissingDeveloperDiskImage(String),
}

impl IdeviceError {
    /// Install failures the device resolves once the old copy of the app is removed
    const INCOMPATIBLE_INSTALL_ERRORS: &'static [&'static str] = &[
        "MismatchedApplicationIdentifierEntitlement",
        "ApplicationVerificationFailed",
        "DowngradeNotAllowed",
    ];

    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full plist context containing additional error details
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Self {
        match e {
            "DeviceLocked" => Self::DeviceLocked,
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionInactive" => Self::SessionInactive,
            "InvalidService" => Self::InvalidService,
            _ => {
                if let Some(description) = context.get("ErrorDescription").and_then(|d| d.as_string())
                {
                    debug!("Device error {e}: {description}");
                }
                Self::UnknownErrorType(e.to_string())
            }
        }
    }

    /// Whether an install failed because an existing copy of the app conflicts with it
    pub fn is_incompatible_install(&self) -> bool {
        match self {
            Self::InstallationProxyOperationFailed { error, description } => {
                Self::INCOMPATIBLE_INSTALL_ERRORS.contains(&error.as_str())
                    || description
                        .as_deref()
                        .is_some_and(|d| d.contains("downgrade") || d.contains("signature"))
            }
            _ => false,
        }
    }
}
