//! GDB Remote Serial Protocol client for `debugserver`
//!
//! Packets are `$<payload>#<checksum>` where the checksum is the sum of the payload
//! bytes modulo 256 as two lowercase hex digits. Every reply is preceded by a `+`
//! acknowledging the packet we sent, and we acknowledge every reply with our own `+`.
//! The protocol is half-duplex: one command, one reply. The only exception is
//! [`DebugserverClient::halt`], which interrupts a running `c` with a raw `0x03`.
//!
//! See <https://sourceware.org/gdb/current/onlinedocs/gdb.html/Packets.html>

use std::fmt::Write;

use tracing::debug;

use crate::{
    codec::{BodyLen, FrameDecoder, FrameEncoder},
    Idevice, IdeviceError, IdeviceService,
};

/// A command name and the arguments that are hex encoded behind it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DebugserverCommand {
    pub name: String,
    pub argv: Vec<String>,
}

impl DebugserverCommand {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
        }
    }
}

impl From<&str> for DebugserverCommand {
    fn from(s: &str) -> DebugserverCommand {
        Self::new(s, Vec::new())
    }
}

/// Sum of the bytes modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Upper-case hex, the form command arguments are sent in
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut output, b| {
        let _ = write!(output, "{b:02X}");
        output
    })
}

/// Decodes hex in either case
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

fn lower_hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Framing for `+$<payload>#xx` replies and `$<payload>#xx` commands
#[derive(Clone, Copy, Debug, Default)]
pub struct GdbCodec;

impl GdbCodec {
    const ACK: u8 = b'+';
}

impl FrameDecoder for GdbCodec {
    type Header = ();
    type Item = String;

    fn header_len(&self) -> usize {
        1
    }

    fn parse_header(&self, header: &[u8]) -> Result<((), BodyLen), IdeviceError> {
        if header[0] != Self::ACK {
            return Err(IdeviceError::GdbNack(header[0]));
        }
        Ok(((), BodyLen::Delimited))
    }

    /// The body runs from `$` through `#` and the two checksum digits
    fn find_body_end(&self, _header: &(), buffered: &[u8]) -> Result<Option<usize>, IdeviceError> {
        match buffered.first() {
            None => return Ok(None),
            Some(b'$') => {}
            Some(_) => return Err(IdeviceError::GdbMalformedPacket),
        }
        Ok(buffered
            .iter()
            .position(|b| *b == b'#')
            .map(|hash| hash + 3)
            .filter(|end| *end <= buffered.len()))
    }

    fn parse_body(&self, _header: (), body: &[u8]) -> Result<String, IdeviceError> {
        let hash = body.len() - 3;
        let payload = &body[1..hash];
        let received = &body[hash + 1..];

        let received_sum = match (lower_hex_digit(received[0]), lower_hex_digit(received[1])) {
            (Some(hi), Some(lo)) => hi << 4 | lo,
            _ => return Err(IdeviceError::GdbMissingChecksum),
        };
        let computed = checksum(payload);
        if received_sum != computed {
            return Err(IdeviceError::GdbChecksumMismatch {
                received: String::from_utf8_lossy(received).into_owned(),
                computed: format!("{computed:02x}"),
            });
        }
        Ok(String::from_utf8(payload.to_vec())?)
    }
}

impl FrameEncoder for GdbCodec {
    type Item = DebugserverCommand;

    fn encode(&mut self, item: &DebugserverCommand, dst: &mut Vec<u8>) -> Result<(), IdeviceError> {
        let hex_args = item
            .argv
            .iter()
            .map(|arg| hex_encode(arg.as_bytes()))
            .collect::<Vec<String>>()
            .join(",");
        let packet_data = format!("{}{}", item.name, hex_args);
        let sum = checksum(packet_data.as_bytes());
        dst.extend_from_slice(format!("${packet_data}#{sum:02x}").as_bytes());
        Ok(())
    }
}

/// Client for the `debugserver` service
#[derive(Debug)]
pub struct DebugserverClient {
    pub idevice: Idevice,
}

impl IdeviceService for DebugserverClient {
    fn service_name() -> &'static str {
        "com.apple.debugserver"
    }

    fn from_idevice(idevice: Idevice) -> Self {
        Self::new(idevice)
    }
}

impl DebugserverClient {
    pub fn new(idevice: Idevice) -> Self {
        Self { idevice }
    }

    /// Writes one command packet without waiting for the reply
    pub async fn write_command(
        &mut self,
        command: impl Into<DebugserverCommand>,
    ) -> Result<(), IdeviceError> {
        let command = command.into();
        debug!("Sending command: {}, args: {:?}", command.name, command.argv);
        self.idevice.write_frame(&mut GdbCodec, &command).await
    }

    /// Reads the next reply and acknowledges it
    ///
    /// Safe to cancel: bytes read so far stay buffered for the next call.
    pub async fn read_reply(&mut self) -> Result<String, IdeviceError> {
        let reply = self.idevice.read_frame(&GdbCodec).await?;
        debug!("Reply: {reply}");
        self.idevice.send_raw(b"+").await?;
        Ok(reply)
    }

    /// Sends a command and returns its reply
    pub async fn send_command(
        &mut self,
        command: impl Into<DebugserverCommand>,
    ) -> Result<String, IdeviceError> {
        self.write_command(command).await?;
        self.read_reply().await
    }

    pub async fn set_max_packet_size(&mut self, size: usize) -> Result<String, IdeviceError> {
        self.send_command(DebugserverCommand::new(
            "QSetMaxPacketSize:",
            vec![size.to_string()],
        ))
        .await
    }

    pub async fn set_working_dir(&mut self, dir: &str) -> Result<String, IdeviceError> {
        self.send_command(DebugserverCommand::new(
            "QSetWorkingDir:",
            vec![dir.to_string()],
        ))
        .await
    }

    /// Returns `OK`, or the reason the last launch failed (`EBusy`, `ENotFound`, ...)
    pub async fn check_launch_success(&mut self) -> Result<String, IdeviceError> {
        self.send_command("qLaunchSuccess").await
    }

    pub async fn attach_by_name(&mut self, name: &str) -> Result<String, IdeviceError> {
        let name = hex_encode(name.as_bytes()).to_lowercase();
        self.send_command(format!("vAttachName;{name}").as_str())
            .await
    }

    /// Launches `<app_path>/<executable>` with no arguments
    pub async fn launch_app(
        &mut self,
        app_path: &str,
        executable: &str,
    ) -> Result<String, IdeviceError> {
        let full_path = format!("{}/{}", app_path.trim_end_matches('/'), executable);
        let hex_path = hex_encode(full_path.as_bytes()).to_lowercase();
        self.send_command(format!("A{},0,{hex_path}", hex_path.len()).as_str())
            .await
    }

    /// Resumes the app and waits until it stops or exits
    pub async fn continue_app(&mut self) -> Result<String, IdeviceError> {
        self.send_command("c").await
    }

    /// Interrupts a running `continue` with a raw `^C`
    pub async fn halt(&mut self) -> Result<(), IdeviceError> {
        debug!("Sending ^C to debugserver");
        self.idevice.send_raw(&[0x03]).await
    }

    /// Kills the app
    ///
    /// # Returns
    /// The `description` the exit reply carries, e.g. "Terminated with signal 9"
    pub async fn kill(&mut self) -> Result<Option<String>, IdeviceError> {
        let reply = self.send_command("k").await?;
        Ok(reply
            .split(';')
            .filter_map(|part| part.strip_prefix("description:"))
            .find_map(hex_decode)
            .map(|d| String::from_utf8_lossy(&d).into_owned()))
    }
}
