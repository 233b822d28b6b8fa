//! Incremental framing shared by every protocol on the device socket
//!
//! Each protocol supplies a [`FrameDecoder`] made of pure functions (header bytes to a
//! body length, body bytes to a message) and a [`FrameEncoder`]. The engine in
//! [`decode_frame`] owns the buffering: it waits for a full header, then for the full
//! body, splits off exactly one frame and leaves whatever follows for the next call.
//! Decoding the same bytes delivered in any chunking yields the same messages.

use std::collections::HashMap;

use bytes::BytesMut;
use tokio::sync::oneshot;

use crate::IdeviceError;

pub mod plist;

pub use self::plist::{LengthPrefix, PlistCodec};

/// How the body following a header is delimited
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyLen {
    /// The header announced exactly this many body bytes
    Exact(usize),
    /// No length field; the decoder scans for the end with [`FrameDecoder::find_body_end`]
    Delimited,
}

/// Protocol-specific half of the framing engine
pub trait FrameDecoder {
    /// Whatever the header carries that the body parser needs
    type Header;
    /// The decoded message
    type Item;

    /// Size of the fixed header, known before any byte arrives
    fn header_len(&self) -> usize;

    /// Parses a complete header
    ///
    /// Errors should carry enough context (e.g. a request id) to route the failure
    /// to the request that is waiting for this frame.
    fn parse_header(&self, header: &[u8]) -> Result<(Self::Header, BodyLen), IdeviceError>;

    /// Locates the end of a [`BodyLen::Delimited`] body in the bytes buffered so far
    ///
    /// # Returns
    /// The body length once the body is complete, `None` while more bytes are needed
    fn find_body_end(
        &self,
        _header: &Self::Header,
        _buffered: &[u8],
    ) -> Result<Option<usize>, IdeviceError> {
        Ok(None)
    }

    /// Parses a complete body
    fn parse_body(&self, header: Self::Header, body: &[u8]) -> Result<Self::Item, IdeviceError>;
}

/// Serializes one outbound message, header and body together
pub trait FrameEncoder {
    type Item: ?Sized;

    fn encode(&mut self, item: &Self::Item, dst: &mut Vec<u8>) -> Result<(), IdeviceError>;
}

/// Decodes one message from the front of `buf` if a complete one is buffered
///
/// On success the frame's bytes are removed from `buf`; anything after it stays.
pub fn decode_frame<D: FrameDecoder>(
    decoder: &D,
    buf: &mut BytesMut,
) -> Result<Option<D::Item>, IdeviceError> {
    let header_len = decoder.header_len();
    if buf.len() < header_len {
        return Ok(None);
    }

    let (header, body_len) = decoder.parse_header(&buf[..header_len])?;
    let body_len = match body_len {
        BodyLen::Exact(len) => len,
        BodyLen::Delimited => match decoder.find_body_end(&header, &buf[header_len..])? {
            Some(len) => len,
            None => return Ok(None),
        },
    };

    let frame_len = header_len
        .checked_add(body_len)
        .ok_or(IdeviceError::PacketTooLarge(body_len))?;
    if buf.len() < frame_len {
        return Ok(None);
    }

    let frame = buf.split_to(frame_len);
    decoder.parse_body(header, &frame[header_len..]).map(Some)
}

/// Decodes every complete message currently buffered
pub fn decode_all<D: FrameDecoder>(
    decoder: &D,
    buf: &mut BytesMut,
) -> Result<Vec<D::Item>, IdeviceError> {
    let mut items = Vec::new();
    while let Some(item) = decode_frame(decoder, buf)? {
        items.push(item);
    }
    Ok(items)
}

/// Outstanding requests keyed by their wire id
///
/// Each entry is removed exactly once: when its response or routed error arrives,
/// or when the caller gives up on it.
#[derive(Debug)]
pub struct PendingRequests<T> {
    slots: HashMap<u64, oneshot::Sender<Result<T, IdeviceError>>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<T> PendingRequests<T> {
    /// Registers `id` and returns the handle its result will be delivered on
    ///
    /// # Errors
    /// Returns `InternalError` if `id` is already outstanding
    pub fn register(
        &mut self,
        id: u64,
    ) -> Result<oneshot::Receiver<Result<T, IdeviceError>>, IdeviceError> {
        if self.slots.contains_key(&id) {
            return Err(IdeviceError::InternalError(format!(
                "request {id} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, tx);
        Ok(rx)
    }

    /// Delivers `result` to the request registered under `id`
    ///
    /// # Returns
    /// `false` if no request with that id is outstanding
    pub fn complete(&mut self, id: u64, result: Result<T, IdeviceError>) -> bool {
        match self.slots.remove(&id) {
            Some(tx) => {
                // The receiver only goes away if the caller stopped waiting.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drops the slot for `id` without completing it
    pub fn cancel(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
