//! Length-prefixed plist framing used by lockdown and the services it starts

use super::{BodyLen, FrameDecoder, FrameEncoder};
use crate::IdeviceError;

/// Byte order of the 4-byte length field at the start of the header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthPrefix {
    BigEndian,
    LittleEndian,
}

impl LengthPrefix {
    fn read(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::BigEndian => u32::from_be_bytes(bytes),
            Self::LittleEndian => u32::from_le_bytes(bytes),
        }
    }

    fn write(self, value: u32) -> [u8; 4] {
        match self {
            Self::BigEndian => value.to_be_bytes(),
            Self::LittleEndian => value.to_le_bytes(),
        }
    }
}

/// Frames a plist dictionary behind a header whose first 4 bytes are a length
#[derive(Clone, Copy, Debug)]
pub struct PlistCodec {
    header_len: usize,
    prefix: LengthPrefix,
    length_includes_header: bool,
}

impl PlistCodec {
    /// Size of the lockdown header: a bare big-endian body length
    pub const LOCKDOWN_HEADER_LEN: usize = 4;

    pub const fn new(header_len: usize, prefix: LengthPrefix, length_includes_header: bool) -> Self {
        Self {
            header_len,
            prefix,
            length_includes_header,
        }
    }

    /// Codec for lockdown and every plist service it starts
    pub const fn lockdown() -> Self {
        Self::new(Self::LOCKDOWN_HEADER_LEN, LengthPrefix::BigEndian, false)
    }

    /// Body length announced by `header`
    pub fn body_len(&self, header: &[u8]) -> Result<usize, IdeviceError> {
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[..4]);
        let len = self.prefix.read(len) as usize;
        if self.length_includes_header {
            len.checked_sub(self.header_len)
                .ok_or(IdeviceError::UnexpectedResponse)
        } else {
            Ok(len)
        }
    }

    /// The length field to write for a body of `body_len` bytes
    pub fn length_field(&self, body_len: usize) -> Result<[u8; 4], IdeviceError> {
        let len = if self.length_includes_header {
            body_len + self.header_len
        } else {
            body_len
        };
        let len = u32::try_from(len).map_err(|_| IdeviceError::PacketTooLarge(len))?;
        Ok(self.prefix.write(len))
    }
}

/// Serializes a dictionary as an XML plist
pub fn to_xml_bytes(dict: &::plist::Dictionary) -> Result<Vec<u8>, IdeviceError> {
    let mut buf = Vec::new();
    ::plist::to_writer_xml(&mut buf, dict)?;
    Ok(buf)
}

impl FrameDecoder for PlistCodec {
    type Header = ();
    type Item = ::plist::Dictionary;

    fn header_len(&self) -> usize {
        self.header_len
    }

    fn parse_header(&self, header: &[u8]) -> Result<((), BodyLen), IdeviceError> {
        Ok(((), BodyLen::Exact(self.body_len(header)?)))
    }

    fn parse_body(&self, _header: (), body: &[u8]) -> Result<Self::Item, IdeviceError> {
        Ok(::plist::from_bytes(body)?)
    }
}

impl FrameEncoder for PlistCodec {
    type Item = ::plist::Dictionary;

    /// Writes the length field, zero padding for the rest of the header, then the body
    fn encode(&mut self, item: &Self::Item, dst: &mut Vec<u8>) -> Result<(), IdeviceError> {
        let body = to_xml_bytes(item)?;
        dst.extend_from_slice(&self.length_field(body.len())?);
        dst.resize(dst.len() + self.header_len - 4, 0);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::decode_all;

    fn sample(n: u64) -> ::plist::Dictionary {
        let mut dict = ::plist::Dictionary::new();
        dict.insert("Request".into(), "GetValue".into());
        dict.insert("Key".into(), "ProductVersion".into());
        dict.insert("Index".into(), n.into());
        dict
    }

    #[test]
    fn lockdown_header_is_big_endian_body_length() {
        let mut buf = Vec::new();
        PlistCodec::lockdown().encode(&sample(1), &mut buf).unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        assert!(buf[4..].starts_with(b"<?xml"));
    }

    #[test]
    fn inclusive_little_endian_lengths_subtract_the_header() {
        let codec = PlistCodec::new(16, LengthPrefix::LittleEndian, true);
        let mut header = [0u8; 16];
        header[..4].copy_from_slice(&116u32.to_le_bytes());
        assert_eq!(codec.body_len(&header).unwrap(), 100);

        header[..4].copy_from_slice(&8u32.to_le_bytes());
        assert!(codec.body_len(&header).is_err());
    }

    #[test]
    fn chunking_does_not_change_decoded_messages() {
        let mut codec = PlistCodec::lockdown();
        let mut wire = Vec::new();
        for n in 0..3 {
            codec.encode(&sample(n), &mut wire).unwrap();
        }

        let mut whole = BytesMut::from(&wire[..]);
        let expected = decode_all(&codec, &mut whole).unwrap();
        assert_eq!(expected.len(), 3);

        let mut buf = BytesMut::new();
        let mut trickled = Vec::new();
        for byte in &wire {
            buf.extend_from_slice(&[*byte]);
            trickled.extend(decode_all(&codec, &mut buf).unwrap());
        }
        assert_eq!(trickled, expected);
        assert!(buf.is_empty());
    }

    #[test]
    fn binary_plist_bodies_are_accepted() {
        let mut body = Vec::new();
        ::plist::to_writer_binary(&mut body, &sample(9)).unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let decoded = decode_all(&PlistCodec::lockdown(), &mut buf).unwrap();
        assert_eq!(decoded, vec![sample(9)]);
    }
}
