use bytes::Bytes;

use log::{debug, trace};

use crate::client::EventHandler;
use crate::connect::{Connect, PROTOCOL_HEADER};
use crate::store::{Entry, Kind, Store, Value};
use crate::types::CodecStatus;
use crate::utils::{encode_remaining_length, total_len};
use crate::ws;
use crate::{Error, IoResult, StringView, Transport};

pub(crate) const TYPE_CONNECT: u8 = 1;
pub(crate) const TYPE_PUBLISH: u8 = 3;
pub(crate) const TYPE_PUBACK: u8 = 4;
pub(crate) const TYPE_PUBREC: u8 = 5;
pub(crate) const TYPE_PUBREL: u8 = 6;
pub(crate) const TYPE_PUBCOMP: u8 = 7;
pub(crate) const TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const TYPE_PINGREQ: u8 = 12;
pub(crate) const TYPE_DISCONNECT: u8 = 14;

/// Result of running a single recipe step.
#[derive(Debug, Clone, Copy)]
enum StepResult {
    /// Step complete, `n` bytes produced.
    Finished(usize),
    /// Destination filled (or a source produced a short read) after `n`
    /// bytes; the step resumes at `offset + n`.
    Continue(usize),
    /// A string source would block; nothing from this attempt is kept.
    WouldBlock,
    Error(Error, i32),
}

/// One sub-encoder of a packet recipe. Steps carry only indices; the data
/// they need lives in the store entry under encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    WsFrame,
    ConnectFixedHeader,
    ConnectVarHeader,
    ClientId,
    WillTopic,
    WillMessage,
    UserName,
    Password,
    PacketIdHeader,
    SubscribeTopic(usize),
    SubscribeQos(usize),
    UnsubscribeTopic(usize),
    PublishFixedHeader,
    PublishTopic,
    PublishPacketId,
    PublishPayload,
    StaticTwo(u8),
    HandshakeLine(usize),
}

const CONNECT_RECIPE: [Step; 8] = [
    Step::WsFrame,
    Step::ConnectFixedHeader,
    Step::ConnectVarHeader,
    Step::ClientId,
    Step::WillTopic,
    Step::WillMessage,
    Step::UserName,
    Step::Password,
];

/// Incremental packet encoder.
///
/// Walks the current store entry through its recipe, suspending on a full
/// destination buffer or a blocking string source and resuming exactly
/// where it stopped. Small headers are built once into a scratch buffer and
/// drained across calls; strings stream straight from their views.
#[derive(Debug)]
pub(crate) struct TxCodec {
    pub ws_enabled: bool,
    /// Set once a DISCONNECT has been fully encoded; nothing is encoded
    /// after that until the next reset.
    pub closed: bool,
    pos: usize,
    offset: usize,
    scratch: [u8; ws::MAX_FRAME_HEADER],
    scratch_len: usize,
    scratch_built: bool,
    mask: [u8; 4],
    mask_pos: usize,
    /// A string source reported WouldBlock during the last pass.
    pub data_blocked: bool,
    pub error: Option<Error>,
    pub os_error: i32,
}

impl TxCodec {
    pub fn new(ws_enabled: bool) -> Self {
        TxCodec {
            ws_enabled,
            closed: false,
            pos: 0,
            offset: 0,
            scratch: [0; ws::MAX_FRAME_HEADER],
            scratch_len: 0,
            scratch_built: false,
            mask: [0; 4],
            mask_pos: 0,
            data_blocked: false,
            error: None,
            os_error: 0,
        }
    }

    /// Reopen the encoder for a fresh connection attempt.
    pub fn reset(&mut self) {
        let ws_enabled = self.ws_enabled;
        *self = TxCodec::new(ws_enabled);
    }

    pub fn finish(&mut self) {
        self.closed = true;
    }

    fn reset_steps(&mut self) {
        self.pos = 0;
        self.offset = 0;
        self.scratch_built = false;
        self.scratch_len = 0;
    }

    fn fail(&mut self, error: Error, os_error: i32) -> StepResult {
        StepResult::Error(error, os_error)
    }

    /// Produce the next packet bytes into `dst`.
    ///
    /// Returns the pass status and the number of bytes written. Bytes are
    /// counted only for completed progress; an attempt cut short by a
    /// blocking source leaves the step offset untouched so the same bytes
    /// are produced again on the next call.
    pub fn encode<T: Transport, H: EventHandler>(
        &mut self,
        store: &mut Store,
        transport: &mut T,
        handler: &mut H,
        dst: &mut [u8],
    ) -> (CodecStatus, usize) {
        let mut total = 0;
        if self.error.is_some() {
            return (CodecStatus::Error, 0);
        }
        self.data_blocked = false;

        'packets: while !self.closed && store.has_current() {
            loop {
                let pos = self.pos;
                let step = {
                    let entry = match store.current_mut() {
                        Some(entry) => entry,
                        None => break 'packets,
                    };
                    next_step(entry, pos)
                };
                let Some(step) = step else {
                    if !self.finish_entry(store, handler) {
                        return (CodecStatus::Error, total);
                    }
                    continue 'packets;
                };

                let result = {
                    let entry = match store.current_mut() {
                        Some(entry) => entry,
                        None => break 'packets,
                    };
                    self.run_step(step, entry, transport, &mut dst[total..])
                };
                match result {
                    StepResult::Finished(n) => {
                        total += n;
                        self.pos += 1;
                        self.offset = 0;
                    }
                    StepResult::Continue(n) => {
                        self.offset += n;
                        total += n;
                        return (CodecStatus::Ok, total);
                    }
                    StepResult::WouldBlock => {
                        self.data_blocked = true;
                        return (CodecStatus::WouldBlock, total);
                    }
                    StepResult::Error(error, os_error) => {
                        self.error = Some(error);
                        self.os_error = os_error;
                        return (CodecStatus::Error, total);
                    }
                }
            }
        }

        if total > 0 || self.closed {
            (CodecStatus::Ok, total)
        } else {
            (CodecStatus::WouldBlock, total)
        }
    }

    /// The recipe of the current entry is exhausted: mark it for its
    /// response or drop it and run its terminal action.
    fn finish_entry<H: EventHandler>(&mut self, store: &mut Store, handler: &mut H) -> bool {
        let kind = {
            let entry = match store.current_mut() {
                Some(entry) => entry,
                None => return true,
            };
            if let Value::Publish(publish) = &mut entry.value {
                publish.encode_count += 1;
            }
            entry.kind
        };

        if kind.expects_response() {
            trace!("sent {:?}, awaiting response", kind);
            store.mark_current();
        } else {
            let entry = match store.drop_current() {
                Some(entry) => entry,
                None => return true,
            };
            trace!("sent {:?}", kind);
            if kind == Kind::Disconnect {
                debug!("disconnect sent, closing encoder");
                self.closed = true;
            } else if let Value::Publish(publish) = entry.value {
                if !handler.on_publish(&publish, true) {
                    self.error = Some(Error::CallbackPublish);
                    self.os_error = 0;
                    return false;
                }
            }
        }
        self.reset_steps();
        true
    }

    fn run_step<T: Transport>(
        &mut self,
        step: Step,
        entry: &mut Entry,
        transport: &mut T,
        dst: &mut [u8],
    ) -> StepResult {
        match step {
            Step::WsFrame => {
                if !self.ws_enabled {
                    return StepResult::Finished(0);
                }
                if !self.scratch_built {
                    let remaining = packet_remaining_length(entry);
                    let payload = match total_len(remaining) {
                        Ok(len) => len,
                        Err(error) => return self.fail(error, 0),
                    };
                    let mask = transport.websocket_mask();
                    self.mask = mask;
                    self.mask_pos = 0;
                    self.scratch_len = ws::build_frame_header(&mut self.scratch, payload, mask);
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, false)
            }
            Step::ConnectFixedHeader => {
                let remaining = packet_remaining_length(entry);
                self.build_scratch_header(TYPE_CONNECT << 4, remaining);
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::ConnectVarHeader => {
                if !self.scratch_built {
                    let Value::Connect(connect) = &entry.value else {
                        return self.fail(Error::EncodeString, 0);
                    };
                    self.scratch[..7].copy_from_slice(&PROTOCOL_HEADER);
                    self.scratch[7] = connect.connect_flags();
                    self.scratch[8..10].copy_from_slice(&connect.keep_alive.to_be_bytes());
                    self.scratch_len = 10;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::ClientId => self.connect_string(entry, step, dst),
            Step::WillTopic => self.connect_string(entry, step, dst),
            Step::WillMessage => self.connect_string(entry, step, dst),
            Step::UserName => self.connect_string(entry, step, dst),
            Step::Password => self.connect_string(entry, step, dst),
            Step::PacketIdHeader => {
                if !self.scratch_built {
                    let (control, remaining) = packet_id_header(entry);
                    let pid = entry.packet_id.map_or(0, |pid| pid.get());
                    let len = encode_remaining_length(remaining, &mut self.scratch[1..]);
                    self.scratch[0] = control;
                    self.scratch[1 + len..1 + len + 2].copy_from_slice(&pid.to_be_bytes());
                    self.scratch_len = 1 + len + 2;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::SubscribeTopic(idx) => {
                let Value::Subscribe(subscribe) = &mut entry.value else {
                    return StepResult::Error(Error::EncodeString, 0);
                };
                self.run_string(&mut subscribe.subscriptions[idx].topic, true, true, dst)
            }
            Step::SubscribeQos(idx) => {
                if !self.scratch_built {
                    let Value::Subscribe(subscribe) = &entry.value else {
                        return self.fail(Error::EncodeString, 0);
                    };
                    self.scratch[0] = subscribe.subscriptions[idx].qos as u8;
                    self.scratch_len = 1;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::UnsubscribeTopic(idx) => {
                let Value::Unsubscribe(unsubscribe) = &mut entry.value else {
                    return StepResult::Error(Error::EncodeString, 0);
                };
                self.run_string(&mut unsubscribe.topics[idx], true, true, dst)
            }
            Step::PublishFixedHeader => {
                if !self.scratch_built {
                    let Value::Publish(publish) = &entry.value else {
                        return self.fail(Error::EncodeString, 0);
                    };
                    let mut control = TYPE_PUBLISH << 4;
                    control |= (publish.qos as u8) << 1;
                    if publish.retain {
                        control |= 0x01;
                    }
                    if publish.dup() {
                        control |= 0x08;
                    }
                    let remaining = publish.remaining_length();
                    let len = encode_remaining_length(remaining, &mut self.scratch[1..]);
                    self.scratch[0] = control;
                    self.scratch_len = 1 + len;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::PublishTopic => {
                let Value::Publish(publish) = &mut entry.value else {
                    return StepResult::Error(Error::EncodeString, 0);
                };
                self.run_string(&mut publish.topic, true, true, dst)
            }
            Step::PublishPacketId => {
                if !self.scratch_built {
                    let pid = entry.packet_id.map_or(0, |pid| pid.get());
                    self.scratch[..2].copy_from_slice(&pid.to_be_bytes());
                    self.scratch_len = 2;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::PublishPayload => {
                let Value::Publish(publish) = &mut entry.value else {
                    return StepResult::Error(Error::EncodeString, 0);
                };
                self.run_string(&mut publish.payload, false, false, dst)
            }
            Step::StaticTwo(control) => {
                if !self.scratch_built {
                    self.scratch[0] = control;
                    self.scratch[1] = 0;
                    self.scratch_len = 2;
                    self.scratch_built = true;
                }
                self.drain_scratch(dst, self.ws_enabled)
            }
            Step::HandshakeLine(idx) => {
                let Value::Connect(connect) = &entry.value else {
                    return StepResult::Error(Error::EncodeString, 0);
                };
                let (prefix, value) = handshake_line(connect, idx);
                let value = value.map_or(&b""[..], |bytes| bytes.as_ref());
                encode_segments(&[prefix, value, b"\r\n"], self.offset, dst)
            }
        }
    }

    fn connect_string(&mut self, entry: &mut Entry, step: Step, dst: &mut [u8]) -> StepResult {
        let Value::Connect(connect) = &mut entry.value else {
            return StepResult::Error(Error::EncodeString, 0);
        };
        match step {
            Step::ClientId => self.run_string(&mut connect.client_id, true, true, dst),
            Step::WillTopic => match &mut connect.last_will {
                Some(will) => self.run_string(&mut will.topic, true, false, dst),
                None => StepResult::Finished(0),
            },
            Step::WillMessage => match &mut connect.last_will {
                Some(will) => self.run_string(&mut will.message, true, false, dst),
                None => StepResult::Finished(0),
            },
            Step::UserName => self.run_string(&mut connect.user_name, true, false, dst),
            Step::Password => self.run_string(&mut connect.password, true, false, dst),
            _ => StepResult::Error(Error::EncodeString, 0),
        }
    }

    fn build_scratch_header(&mut self, control: u8, remaining: usize) {
        if self.scratch_built {
            return;
        }
        let len = encode_remaining_length(remaining, &mut self.scratch[1..]);
        self.scratch[0] = control;
        self.scratch_len = 1 + len;
        self.scratch_built = true;
    }

    fn drain_scratch(&mut self, dst: &mut [u8], masked: bool) -> StepResult {
        let avail = self.scratch_len - self.offset;
        let n = avail.min(dst.len());
        dst[..n].copy_from_slice(&self.scratch[self.offset..self.offset + n]);
        if masked {
            self.mask_slice(&mut dst[..n]);
        }
        if n == avail {
            self.scratch_built = false;
            self.scratch_len = 0;
            StepResult::Finished(n)
        } else {
            StepResult::Continue(n)
        }
    }

    fn run_string(
        &mut self,
        view: &mut StringView,
        encode_len: bool,
        encode_if_empty: bool,
        dst: &mut [u8],
    ) -> StepResult {
        let result = string_encode(view, encode_len, encode_if_empty, self.offset, dst);
        if self.ws_enabled {
            // masking is committed only with the bytes themselves; a
            // blocked attempt is redone from the same mask position
            match result {
                StepResult::Finished(n) | StepResult::Continue(n) => {
                    self.mask_slice_at(dst, n);
                }
                _ => {}
            }
        }
        result
    }

    fn mask_slice_at(&mut self, dst: &mut [u8], n: usize) {
        let mask = self.mask;
        for byte in &mut dst[..n] {
            *byte ^= mask[self.mask_pos];
            self.mask_pos = (self.mask_pos + 1) % 4;
        }
    }

    fn mask_slice(&mut self, bytes: &mut [u8]) {
        let n = bytes.len();
        self.mask_slice_at(bytes, n);
    }
}

/// Produce the next bytes of a length-prefixed string starting at the
/// logical `offset` (which covers the two length bytes when present).
fn string_encode(
    view: &mut StringView,
    encode_len: bool,
    encode_if_empty: bool,
    offset: usize,
    dst: &mut [u8],
) -> StepResult {
    let len = view.len();
    if len == 0 && !encode_if_empty {
        return StepResult::Finished(0);
    }
    if dst.is_empty() {
        return StepResult::Continue(0);
    }

    let prefix = if encode_len { 2 } else { 0 };
    let mut pos = 0;
    let mut off = offset;
    while off < prefix && pos < dst.len() {
        dst[pos] = ((len >> (8 * (prefix - 1 - off))) & 0xFF) as u8;
        pos += 1;
        off += 1;
    }
    if off < prefix {
        return StepResult::Continue(pos);
    }

    let str_off = off - prefix;
    let remaining = len - str_off;
    if remaining == 0 {
        return StepResult::Finished(pos);
    }
    if pos == dst.len() {
        return StepResult::Continue(pos);
    }

    let want = remaining.min(dst.len() - pos);
    match view.read_at(str_off, &mut dst[pos..pos + want]) {
        IoResult::Success(0) => StepResult::Error(Error::EncodeString, 0),
        IoResult::Success(n) => {
            pos += n;
            if str_off + n >= len {
                StepResult::Finished(pos)
            } else {
                StepResult::Continue(pos)
            }
        }
        IoResult::WouldBlock => StepResult::WouldBlock,
        IoResult::Error(os_error) => StepResult::Error(Error::EncodeString, os_error),
    }
}

/// Emit a virtual concatenation of segments, resuming at `offset`.
fn encode_segments(segments: &[&[u8]], offset: usize, dst: &mut [u8]) -> StepResult {
    let total: usize = segments.iter().map(|s| s.len()).sum();
    let mut written = 0;
    let mut skip = offset;
    for segment in segments {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }
        let segment = &segment[skip..];
        skip = 0;
        let n = segment.len().min(dst.len() - written);
        dst[written..written + n].copy_from_slice(&segment[..n]);
        written += n;
        if written == dst.len() {
            break;
        }
    }
    if offset + written == total {
        StepResult::Finished(written)
    } else {
        StepResult::Continue(written)
    }
}

fn next_step(entry: &Entry, pos: usize) -> Option<Step> {
    match entry.kind {
        Kind::Connect => CONNECT_RECIPE.get(pos).copied(),
        Kind::Subscribe => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::PacketIdHeader),
            _ => {
                let count = match &entry.value {
                    Value::Subscribe(subscribe) => subscribe.subscriptions.len(),
                    _ => 0,
                };
                let p = pos - 2;
                if p < count * 2 {
                    Some(if p % 2 == 0 {
                        Step::SubscribeTopic(p / 2)
                    } else {
                        Step::SubscribeQos(p / 2)
                    })
                } else {
                    None
                }
            }
        },
        Kind::Unsubscribe => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::PacketIdHeader),
            _ => {
                let count = match &entry.value {
                    Value::Unsubscribe(unsubscribe) => unsubscribe.topics.len(),
                    _ => 0,
                };
                let p = pos - 2;
                if p < count {
                    Some(Step::UnsubscribeTopic(p))
                } else {
                    None
                }
            }
        },
        Kind::Publish0 => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::PublishFixedHeader),
            2 => Some(Step::PublishTopic),
            3 => Some(Step::PublishPayload),
            _ => None,
        },
        Kind::Publish1 | Kind::Publish2 => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::PublishFixedHeader),
            2 => Some(Step::PublishTopic),
            3 => Some(Step::PublishPacketId),
            4 => Some(Step::PublishPayload),
            _ => None,
        },
        Kind::PubAck | Kind::PubRec | Kind::PubRel | Kind::PubComp => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::PacketIdHeader),
            _ => None,
        },
        Kind::PingReq => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::StaticTwo(TYPE_PINGREQ << 4)),
            _ => None,
        },
        Kind::Disconnect => match pos {
            0 => Some(Step::WsFrame),
            1 => Some(Step::StaticTwo(TYPE_DISCONNECT << 4)),
            _ => None,
        },
        Kind::WsConnect => {
            if pos < 9 {
                Some(Step::HandshakeLine(pos))
            } else {
                None
            }
        }
    }
}

fn packet_remaining_length(entry: &Entry) -> usize {
    match (&entry.value, entry.kind) {
        (Value::Connect(connect), _) => connect.remaining_length(),
        (Value::Subscribe(subscribe), _) => subscribe.remaining_length(),
        (Value::Unsubscribe(unsubscribe), _) => unsubscribe.remaining_length(),
        (Value::Publish(_), Kind::PubRel) => 2,
        (Value::Publish(publish), _) => publish.remaining_length(),
        (Value::None, Kind::PingReq | Kind::Disconnect) => 0,
        (Value::None, _) => 2,
    }
}

fn packet_id_header(entry: &Entry) -> (u8, usize) {
    match entry.kind {
        Kind::Subscribe => (
            (TYPE_SUBSCRIBE << 4) | 0x02,
            packet_remaining_length(entry),
        ),
        Kind::Unsubscribe => (
            (TYPE_UNSUBSCRIBE << 4) | 0x02,
            packet_remaining_length(entry),
        ),
        Kind::PubAck => (TYPE_PUBACK << 4, 2),
        Kind::PubRec => (TYPE_PUBREC << 4, 2),
        Kind::PubRel => ((TYPE_PUBREL << 4) | 0x02, 2),
        Kind::PubComp => (TYPE_PUBCOMP << 4, 2),
        _ => (0, 2),
    }
}

fn handshake_line(connect: &Connect, idx: usize) -> (&'static [u8], Option<&Bytes>) {
    let ws = connect.websocket.as_ref();
    match idx {
        0 => (b"GET /mqtt HTTP/1.1", None),
        1 => (b"Host: ", ws.map(|w| &w.addr)),
        2 => (b"Upgrade: websocket", None),
        3 => (b"Connection: Upgrade", None),
        4 => (b"Origin: http://", ws.map(|w| &w.addr)),
        5 => (b"Sec-WebSocket-Key: ", ws.map(|w| &w.key)),
        6 => (b"Sec-WebSocket-Version: 13", None),
        7 => (b"Sec-WebSocket-Protocol: mqtt", None),
        _ => (b"", None),
    }
}
