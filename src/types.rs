use core::convert::TryFrom;
use core::fmt;
use core::num::NonZeroU16;
use core::time::Duration;

use alloc::boxed::Box;

use bytes::{Bytes, BytesMut};

use crate::Error;

/// Result of a single non-blocking host transfer.
///
/// `Success(0)` on a read means the peer closed the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    Success(usize),
    WouldBlock,
    /// Failed with an OS error number.
    Error(i32),
}

/// Host integration point: a non-blocking transport plus a monotonic clock
/// and, in WebSocket mode, a masking-key source.
///
/// All four operations must not block; `read` and `write` report
/// [`IoResult::WouldBlock`] when the underlying descriptor has no data or
/// no buffer space. The engine never calls them outside
/// [`Client::run_once`](crate::Client::run_once).
pub trait Transport {
    /// Receive bytes into `buf`. `Success(0)` signals EOF.
    fn read(&mut self, buf: &mut [u8]) -> IoResult;

    /// Send bytes from `buf`.
    fn write(&mut self, buf: &[u8]) -> IoResult;

    /// Monotonic clock reading. Only differences are ever computed.
    fn now(&mut self) -> Duration;

    /// Four random masking bytes for an outgoing WebSocket frame.
    ///
    /// The default is a zero mask, acceptable only for hosts that never
    /// enable WebSocket mode; real deployments must override this with
    /// unpredictable bytes.
    fn websocket_mask(&mut self) -> [u8; 4] {
        [0; 4]
    }
}

/// Outcome of one encoder or decoder pass over a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodecStatus {
    /// Progress was made (or there was nothing to do on an empty buffer).
    Ok,
    /// No byte could be produced or consumed right now.
    WouldBlock,
    /// The codec latched an error; see its `error` field.
    Error,
}

/// Packet delivery [Quality of Service] level.
///
/// [Quality of Service]: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718099
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    /// `QoS 0`. At most once. No ack needed.
    #[default]
    Level0 = 0,
    /// `QoS 1`. At least once. One ack needed.
    Level1 = 1,
    /// `QoS 2`. Exactly once. Two acks needed.
    Level2 = 2,
}

impl QoS {
    pub(crate) fn from_u8(byte: u8) -> Result<QoS, Error> {
        match byte {
            0 => Ok(QoS::Level0),
            1 => Ok(QoS::Level1),
            2 => Ok(QoS::Level2),
            _ => Err(Error::DecodeFixedHeaderInvalidFlags),
        }
    }
}

/// Non-zero packet identifier of an in-flight QoS ≥ 1 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct Pid(NonZeroU16);

impl Pid {
    /// Get the `Pid` as a raw `u16`.
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl From<Pid> for u16 {
    fn from(p: Pid) -> Self {
        p.0.get()
    }
}

impl TryFrom<u16> for Pid {
    type Error = Error;

    /// Convert `u16` to `Pid`. Will fail for value 0.
    fn try_from(u: u16) -> Result<Self, Error> {
        match NonZeroU16::new(u) {
            Some(nz) => Ok(Pid(nz)),
            None => Err(Error::InvalidPacket),
        }
    }
}

/// Streaming source for outgoing string data, read sequentially.
pub trait StringRead {
    /// Produce the next bytes into `dst`. `Success(0)` before the declared
    /// length has been produced is an encode error.
    fn read(&mut self, dst: &mut [u8]) -> IoResult;
}

/// Streaming sink for incoming topic or payload data, written sequentially.
pub trait StringWrite {
    /// Consume bytes from `src`. May accept fewer than offered.
    fn write(&mut self, src: &[u8]) -> IoResult;
}

/// Length-delimited byte sequence backing an MQTT string or payload field.
///
/// Exactly one form is valid for a given direction: outgoing fields must be
/// `Bytes` or `Reader`, decode-side destinations must be `Sink` or
/// `Writer`. Using a view against its direction is reported as an encode or
/// write error, never a panic.
pub enum StringView {
    /// In-memory bytes, copied out by the encoder.
    Bytes(Bytes),
    /// Streaming source of exactly `len` bytes; the mover may report
    /// [`IoResult::WouldBlock`], which suspends the encoder mid-string.
    Reader {
        len: usize,
        reader: Box<dyn StringRead>,
    },
    /// In-memory destination filled by the decoder.
    Sink(BytesMut),
    /// Streaming destination; the mover may report
    /// [`IoResult::WouldBlock`], which suspends the decoder mid-string.
    Writer(Box<dyn StringWrite>),
}

impl StringView {
    /// Declared length of a source view; 0 for destinations.
    pub fn len(&self) -> usize {
        match self {
            StringView::Bytes(b) => b.len(),
            StringView::Reader { len, .. } => *len,
            StringView::Sink(b) => b.len(),
            StringView::Writer(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The in-memory bytes of this view, when it has any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StringView::Bytes(b) => Some(b),
            StringView::Sink(b) => Some(b),
            _ => None,
        }
    }

    /// Wire size of the field including its two length bytes, zero when
    /// the field is empty and therefore omitted.
    pub(crate) fn field_len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            2 + self.len()
        }
    }

    /// String fields are capped at 65 535 bytes by the two-byte prefix.
    pub(crate) fn fits_field(&self) -> bool {
        self.len() <= u16::MAX as usize
    }

    pub(crate) fn is_source(&self) -> bool {
        matches!(self, StringView::Bytes(_) | StringView::Reader { .. })
    }

    /// Copy source bytes starting at `offset` into `dst`.
    ///
    /// `Bytes` sources honor `offset` directly; a `Reader` is sequential
    /// and trusted to continue where it stopped, so `offset` only selects
    /// resumption (the caller never rewinds a reader).
    pub(crate) fn read_at(&mut self, offset: usize, dst: &mut [u8]) -> IoResult {
        match self {
            StringView::Bytes(b) => {
                let n = dst.len().min(b.len() - offset);
                dst[..n].copy_from_slice(&b[offset..offset + n]);
                IoResult::Success(n)
            }
            StringView::Reader { reader, .. } => reader.read(dst),
            _ => IoResult::Error(0),
        }
    }

    /// Append decoded bytes into a destination view.
    pub(crate) fn write(&mut self, src: &[u8]) -> IoResult {
        match self {
            StringView::Sink(b) => {
                b.extend_from_slice(src);
                IoResult::Success(src.len())
            }
            StringView::Writer(w) => w.write(src),
            _ => IoResult::Error(0),
        }
    }

    /// UTF-8 check for in-memory sources; streamed sources are the host's
    /// responsibility.
    pub(crate) fn is_valid_utf8(&self) -> bool {
        match self.as_bytes() {
            Some(bytes) => simdutf8::basic::from_utf8(bytes).is_ok(),
            None => true,
        }
    }
}

impl Default for StringView {
    fn default() -> Self {
        StringView::Bytes(Bytes::new())
    }
}

impl fmt::Debug for StringView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringView::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            StringView::Reader { len, .. } => f.debug_struct("Reader").field("len", len).finish(),
            StringView::Sink(b) => f.debug_tuple("Sink").field(&b.len()).finish(),
            StringView::Writer(_) => f.write_str("Writer"),
        }
    }
}

impl From<Bytes> for StringView {
    fn from(b: Bytes) -> Self {
        StringView::Bytes(b)
    }
}

impl From<BytesMut> for StringView {
    fn from(b: BytesMut) -> Self {
        StringView::Sink(b)
    }
}

impl From<&'static str> for StringView {
    fn from(s: &'static str) -> Self {
        StringView::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for StringView {
    fn from(s: &'static [u8]) -> Self {
        StringView::Bytes(Bytes::from_static(s))
    }
}

impl From<alloc::vec::Vec<u8>> for StringView {
    fn from(v: alloc::vec::Vec<u8>) -> Self {
        StringView::Bytes(Bytes::from(v))
    }
}

impl From<alloc::string::String> for StringView {
    fn from(s: alloc::string::String) -> Self {
        StringView::Bytes(Bytes::from(s))
    }
}
