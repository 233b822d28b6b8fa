use tracing::{debug, trace};

use crate::{
    codec::{BodyLen, FrameDecoder, FrameEncoder},
    IdeviceError,
};

use super::{errors::AfcError, opcode::AfcOpcode, MAGIC, MAX_PACKET_LEN};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub request_id: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> [u8; 40] {
        let mut res = [0u8; 40];
        let fields = [
            self.magic,
            self.entire_len,
            self.header_payload_len,
            self.request_id,
            self.operation as u64,
        ];
        for (chunk, field) in res.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        res
    }
}

impl AfcPacket {
    /// Builds a request, filling in the magic and both lengths
    pub fn new(
        request_id: u64,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_payload_len = AfcPacketHeader::LEN + header_payload.len() as u64;
        Self {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: header_payload_len + payload.len() as u64,
                header_payload_len,
                request_id,
                operation,
            },
            header_payload,
            payload,
        }
    }

    /// Status code of a `STATUS` response
    ///
    /// Read from the header payload, or from the start of the body when the
    /// device puts the code behind a bare 40-byte header.
    pub fn status_code(&self) -> Option<u64> {
        if self.header.operation != AfcOpcode::Status {
            return None;
        }
        let hp = &self.header_payload;
        if hp.len() >= 8 {
            let mut code = [0u8; 8];
            code.copy_from_slice(&hp[..8]);
            return Some(u64::from_le_bytes(code));
        }
        let mut code = [0u8; 4];
        let mut bytes = hp.iter().chain(&self.payload);
        for b in code.iter_mut() {
            *b = *bytes.next()?;
        }
        Some(u32::from_le_bytes(code) as u64)
    }

    /// Turns a non-success `STATUS` response into the matching error
    pub fn into_result(self) -> Result<Self, IdeviceError> {
        if self.header.operation != AfcOpcode::Status {
            return Ok(self);
        }
        let code = self.status_code().ok_or(IdeviceError::AfcFraming {
            request_id: self.header.request_id,
            reason: "status response without a status code",
        })?;
        match AfcError::from_status(code) {
            None => Ok(self),
            Some(e) => {
                debug!("Request {} failed with status {code}: {e}", self.header.request_id);
                Err(IdeviceError::Afc(e))
            }
        }
    }
}

/// Framing for the 40-byte little-endian AFC header and the two bodies behind it
#[derive(Clone, Copy, Debug, Default)]
pub struct AfcCodec;

fn field(header: &[u8], index: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&header[index * 8..index * 8 + 8]);
    u64::from_le_bytes(bytes)
}

impl FrameDecoder for AfcCodec {
    type Header = AfcPacketHeader;
    type Item = AfcPacket;

    fn header_len(&self) -> usize {
        AfcPacketHeader::LEN as usize
    }

    /// Validates the header, tagging any failure with the request id it claims
    fn parse_header(&self, header: &[u8]) -> Result<(AfcPacketHeader, BodyLen), IdeviceError> {
        let request_id = field(header, 3);
        let framing = |reason| IdeviceError::AfcFraming { request_id, reason };

        let magic = field(header, 0);
        if magic != MAGIC {
            return Err(framing("bad magic"));
        }
        let entire_len = field(header, 1);
        let header_payload_len = field(header, 2);
        if header_payload_len < AfcPacketHeader::LEN {
            return Err(framing("header length is shorter than the header"));
        }
        if entire_len < header_payload_len {
            return Err(framing("entire length is shorter than the header length"));
        }
        if entire_len > MAX_PACKET_LEN {
            return Err(framing("packet too large"));
        }
        let operation =
            AfcOpcode::try_from(field(header, 4)).map_err(|_| framing("unknown operation"))?;

        let body_len = entire_len - AfcPacketHeader::LEN;
        let body_len =
            usize::try_from(body_len).map_err(|_| IdeviceError::PacketTooLarge(usize::MAX))?;
        trace!("AFC header for request {request_id}: {operation:?}, {body_len} body bytes");

        Ok((
            AfcPacketHeader {
                magic,
                entire_len,
                header_payload_len,
                request_id,
                operation,
            },
            BodyLen::Exact(body_len),
        ))
    }

    fn parse_body(&self, header: AfcPacketHeader, body: &[u8]) -> Result<AfcPacket, IdeviceError> {
        // Bounded by the header checks above.
        let split = (header.header_payload_len - AfcPacketHeader::LEN) as usize;
        let (header_payload, payload) = body.split_at(split);
        Ok(AfcPacket {
            header,
            header_payload: header_payload.to_vec(),
            payload: payload.to_vec(),
        })
    }
}

impl FrameEncoder for AfcCodec {
    type Item = AfcPacket;

    fn encode(&mut self, item: &AfcPacket, dst: &mut Vec<u8>) -> Result<(), IdeviceError> {
        dst.reserve(item.header.entire_len as usize);
        dst.extend_from_slice(&item.header.serialize());
        dst.extend_from_slice(&item.header_payload);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::{decode_all, decode_frame};

    fn status(request_id: u64, code: u64) -> AfcPacket {
        AfcPacket::new(
            request_id,
            AfcOpcode::Status,
            code.to_le_bytes().to_vec(),
            Vec::new(),
        )
    }

    fn wire(packets: &[AfcPacket]) -> Vec<u8> {
        let mut buf = Vec::new();
        for p in packets {
            AfcCodec.encode(p, &mut buf).unwrap();
        }
        buf
    }

    #[test]
    fn header_layout_is_little_endian_with_magic() {
        let packet = AfcPacket::new(7, AfcOpcode::MakeDir, b"PublicStaging\0".to_vec(), vec![1, 2]);
        let bytes = wire(&[packet]);
        assert_eq!(&bytes[..8], b"CFA6LPAA");
        assert_eq!(field(&bytes, 1), 40 + 14 + 2);
        assert_eq!(field(&bytes, 2), 40 + 14);
        assert_eq!(field(&bytes, 3), 7);
        assert_eq!(field(&bytes, 4), AfcOpcode::MakeDir as u64);
    }

    #[test]
    fn decoding_is_chunk_independent() {
        let packets = vec![
            status(0, 0),
            AfcPacket::new(1, AfcOpcode::Data, Vec::new(), b"st_size\04096\0".to_vec()),
            AfcPacket::new(2, AfcOpcode::FileOpenRes, 3u64.to_le_bytes().to_vec(), Vec::new()),
        ];
        let bytes = wire(&packets);

        for chunk in [1, 3, 40, 41, bytes.len()] {
            let mut buf = BytesMut::new();
            let mut out = Vec::new();
            for piece in bytes.chunks(chunk) {
                buf.extend_from_slice(piece);
                out.extend(decode_all(&AfcCodec, &mut buf).unwrap());
            }
            assert_eq!(out, packets, "chunk size {chunk}");
        }
    }

    #[test]
    fn success_status_is_not_an_error() {
        assert!(status(0, 0).into_result().is_ok());

        let mut short = status(0, 0);
        short.header_payload.truncate(4);
        assert!(short.into_result().is_ok());
    }

    #[test]
    fn failing_status_carries_the_exact_code() {
        for code in [1, 8, 16, 18, 33, 99] {
            match status(4, code).into_result() {
                Err(IdeviceError::Afc(e)) => assert_eq!(e.code(), code),
                other => panic!("status {code} gave {other:?}"),
            }
        }
    }

    #[test]
    fn bad_magic_is_tagged_with_the_request_id() {
        let mut bytes = wire(&[status(12, 0)]);
        bytes[0] = b'X';
        let mut buf = BytesMut::from(&bytes[..]);
        match decode_frame(&AfcCodec, &mut buf) {
            Err(IdeviceError::AfcFraming { request_id, .. }) => assert_eq!(request_id, 12),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undersized_header_length_is_rejected() {
        let mut bytes = wire(&[status(5, 0)]);
        bytes[16..24].copy_from_slice(&39u64.to_le_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&AfcCodec, &mut buf),
            Err(IdeviceError::AfcFraming { request_id: 5, .. })
        ));
    }

    #[test]
    fn status_code_may_follow_a_bare_header() {
        let ok = AfcPacket::new(1, AfcOpcode::Status, Vec::new(), 0u32.to_le_bytes().to_vec());
        assert_eq!(ok.header.entire_len, 44);
        assert!(ok.into_result().is_ok());

        let failed = AfcPacket::new(2, AfcOpcode::Status, Vec::new(), 8u32.to_le_bytes().to_vec());
        match failed.into_result() {
            Err(IdeviceError::Afc(e)) => assert_eq!(e.code(), 8),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_packet_is_rejected_before_buffering() {
        let mut bytes = wire(&[status(9, 0)]);
        bytes[8..16].copy_from_slice(&(MAX_PACKET_LEN + 1).to_le_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&AfcCodec, &mut buf),
            Err(IdeviceError::AfcFraming {
                request_id: 9,
                reason: "packet too large"
            })
        ));
    }

    #[test]
    fn status_without_code_is_a_framing_error() {
        let packet = AfcPacket::new(3, AfcOpcode::Status, Vec::new(), Vec::new());
        assert!(matches!(
            packet.into_result(),
            Err(IdeviceError::AfcFraming { request_id: 3, .. })
        ));
    }
}
