use core::convert::TryFrom;

use alloc::vec::Vec;

use log::{debug, trace};

use crate::client::{DecodeCtx, EventHandler};
use crate::connect::ConnectReturnCode;
use crate::store::{Entry, Kind, Value};
use crate::tx::{TYPE_PUBLISH, TYPE_PUBREL, TYPE_SUBSCRIBE, TYPE_UNSUBSCRIBE};
use crate::types::CodecStatus;
use crate::ws::{self, FrameDecoder, FrameProgress};
use crate::{Allocation, Error, IoResult, Message, Pid, QoS, SubscribeReturnCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Continue,
    Finished,
}

/// Server-to-client packet types this client decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPacket {
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Suback,
    Unsuback,
    Pingresp,
}

impl RxPacket {
    fn from_type(typ: u8) -> Option<RxPacket> {
        match typ {
            2 => Some(RxPacket::Connack),
            3 => Some(RxPacket::Publish),
            4 => Some(RxPacket::Puback),
            5 => Some(RxPacket::Pubrec),
            6 => Some(RxPacket::Pubrel),
            7 => Some(RxPacket::Pubcomp),
            9 => Some(RxPacket::Suback),
            11 => Some(RxPacket::Unsuback),
            13 => Some(RxPacket::Pingresp),
            _ => None,
        }
    }

    fn min_remaining(self) -> usize {
        match self {
            RxPacket::Pingresp => 0,
            // PUBLISH needs 3 (QoS 0) or 5 (QoS >= 1) bytes; the body
            // decoder validates the rest once the topic length is known
            RxPacket::Publish | RxPacket::Suback => 3,
            _ => 2,
        }
    }

    /// Which request kind this response consumes, when it consumes one.
    fn request_kind(self) -> Option<Kind> {
        match self {
            RxPacket::Connack => Some(Kind::Connect),
            RxPacket::Puback => Some(Kind::Publish1),
            RxPacket::Pubrec => Some(Kind::Publish2),
            RxPacket::Pubcomp => Some(Kind::PubRel),
            RxPacket::Suback => Some(Kind::Subscribe),
            RxPacket::Unsuback => Some(Kind::Unsubscribe),
            RxPacket::Pingresp => Some(Kind::PingReq),
            RxPacket::Publish | RxPacket::Pubrel => None,
        }
    }

    /// Packet types without an embedded packet id consume their request as
    /// soon as the fixed header completes.
    fn pops_at_header(self) -> Option<Kind> {
        match self {
            RxPacket::Connack => Some(Kind::Connect),
            RxPacket::Pingresp => Some(Kind::PingReq),
            _ => None,
        }
    }
}

/// Incremental MQTT fixed-header decoder: type and flags from the first
/// byte, then the 1–4 byte remaining length.
#[derive(Debug, Default)]
struct FixedHeader {
    bytes_read: usize,
    typ: u8,
    dup: bool,
    qos: u8,
    retain: bool,
    remaining_length: usize,
    multiplier: u32,
    accumulator: u32,
    finished: bool,
}

impl FixedHeader {
    fn feed(&mut self, b: u8) -> Result<Progress, Error> {
        if self.bytes_read == 0 {
            let typ = b >> 4;
            let flags = b & 0x0F;
            if !(1..=14).contains(&typ) {
                return Err(Error::DecodeFixedHeaderInvalidType);
            }
            let bad_flags = match typ {
                TYPE_PUBREL | TYPE_SUBSCRIBE | TYPE_UNSUBSCRIBE => flags != 0x02,
                TYPE_PUBLISH => (flags & 0x06) == 0x06 || (flags & 0x0E) == 0x08,
                _ => flags != 0,
            };
            if bad_flags {
                return Err(Error::DecodeFixedHeaderInvalidFlags);
            }
            self.typ = typ;
            self.multiplier = 1;
            self.accumulator = 0;
            if typ == TYPE_PUBLISH {
                self.dup = flags & 0x08 != 0;
                self.qos = (flags & 0x06) >> 1;
                self.retain = flags & 0x01 != 0;
            }
            self.bytes_read = 1;
            return Ok(Progress::Continue);
        }

        if (self.multiplier > 128 * 128 && b & 0x80 != 0)
            || (self.multiplier > 1 && b == 0)
            || self.finished
        {
            return Err(Error::DecodeFixedHeaderInvalidRemainingLength);
        }
        self.accumulator += u32::from(b & 0x7F) * self.multiplier;
        self.multiplier *= 128;
        self.bytes_read += 1;
        if b & 0x80 != 0 {
            Ok(Progress::Continue)
        } else {
            self.remaining_length = self.accumulator as usize;
            self.finished = true;
            Ok(Progress::Finished)
        }
    }
}

#[derive(Debug)]
enum BodyProgress {
    Advanced(usize),
    WouldBlock,
}

#[derive(Debug, Clone, Copy)]
enum PublishPart {
    Topic,
    Payload,
}

impl PublishPart {
    fn allocate_error(self) -> Error {
        match self {
            PublishPart::Topic => Error::DecodePublishTopicAllocateFailed,
            PublishPart::Payload => Error::DecodePublishPayloadAllocateFailed,
        }
    }

    fn write_error(self) -> Error {
        match self {
            PublishPart::Topic => Error::DecodePublishTopicWriteFailed,
            PublishPart::Payload => Error::DecodePublishPayloadWriteFailed,
        }
    }
}

/// Incremental packet decoder.
///
/// Layer 0 matches the WebSocket upgrade response line by line; layer 1
/// strips one frame header per MQTT packet; layer 2 runs the fixed-header
/// and per-type body state machines, consuming matching requests from the
/// store and enqueueing the replies the QoS flows require.
#[derive(Debug)]
pub(crate) struct RxCodec {
    pub ws_enabled: bool,
    handshake_done: bool,
    line: Vec<u8>,
    line_cap: usize,
    http_ok: bool,
    key_ok: bool,
    frame: FrameDecoder,
    frame_done: bool,
    header: FixedHeader,
    header_done: bool,
    packet: Option<RxPacket>,
    remain_pos: usize,
    packet_id: u16,
    topic_len: usize,
    current: Option<Entry>,
    message: Message,
    ignore_publish: bool,
    /// A host sink reported WouldBlock during the last pass.
    pub data_blocked: bool,
    pub error: Option<Error>,
    pub os_error: i32,
}

impl RxCodec {
    pub fn new(ws_enabled: bool, line_capacity: usize) -> Self {
        RxCodec {
            ws_enabled,
            handshake_done: false,
            line: Vec::with_capacity(line_capacity),
            line_cap: line_capacity,
            http_ok: false,
            key_ok: false,
            frame: FrameDecoder::default(),
            frame_done: false,
            header: FixedHeader::default(),
            header_done: false,
            packet: None,
            remain_pos: 0,
            packet_id: 0,
            topic_len: 0,
            current: None,
            message: Message::default(),
            ignore_publish: false,
            data_blocked: false,
            error: None,
            os_error: 0,
        }
    }

    /// Restart the decoder for a fresh connection attempt, including a new
    /// WebSocket handshake.
    pub fn reset(&mut self) {
        let ws_enabled = self.ws_enabled;
        let line_cap = self.line_cap;
        *self = RxCodec::new(ws_enabled, line_cap);
    }

    /// Take the request entry consumed by a partially decoded response, so
    /// teardown can fail its completion.
    pub fn take_current(&mut self) -> Option<Entry> {
        self.current.take()
    }

    fn reset_packet(&mut self) {
        self.frame = FrameDecoder::default();
        self.frame_done = false;
        self.header = FixedHeader::default();
        self.header_done = false;
        self.packet = None;
        self.remain_pos = 0;
        self.packet_id = 0;
        self.topic_len = 0;
        self.message = Message::default();
        self.ignore_publish = false;
    }

    fn fail(&mut self, error: Error, read: usize) -> (CodecStatus, usize) {
        self.error = Some(error);
        (CodecStatus::Error, read)
    }

    /// Consume packet bytes from `src`.
    ///
    /// Returns the pass status and the number of bytes consumed; bytes not
    /// consumed (a blocked sink mid-string) are offered again on the next
    /// call.
    pub fn decode<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        src: &[u8],
    ) -> (CodecStatus, usize) {
        let mut read = 0;
        if self.error.is_some() {
            return (CodecStatus::Error, 0);
        }
        self.data_blocked = false;

        while read < src.len() {
            if self.ws_enabled && !self.handshake_done {
                if let Err(error) = self.handshake_byte(ctx, src[read]) {
                    return self.fail(error, read);
                }
                read += 1;
                continue;
            }
            if self.ws_enabled && !self.frame_done {
                match self.frame.feed(src[read]) {
                    Err(error) => return self.fail(error, read),
                    Ok(FrameProgress::Continue) => {
                        read += 1;
                        continue;
                    }
                    Ok(FrameProgress::Finished) => {
                        read += 1;
                        self.frame_done = true;
                        match self.frame.opcode {
                            ws::OPCODE_CLOSE => return self.fail(Error::WsClosedByServer, read),
                            ws::OPCODE_PING | ws::OPCODE_PONG => {
                                return self.fail(Error::WsUnsupportedFrameType, read)
                            }
                            _ => {}
                        }
                        continue;
                    }
                }
            }
            if !self.header_done {
                match self.header.feed(src[read]) {
                    Err(error) => return self.fail(error, read),
                    Ok(Progress::Continue) => {
                        read += 1;
                        continue;
                    }
                    Ok(Progress::Finished) => {
                        read += 1;
                        if let Err(error) = self.begin_packet(ctx) {
                            return self.fail(error, read);
                        }
                    }
                }
            } else {
                match self.decode_body(ctx, &src[read..]) {
                    Err(error) => return self.fail(error, read),
                    Ok(BodyProgress::WouldBlock) => {
                        self.data_blocked = true;
                        break;
                    }
                    Ok(BodyProgress::Advanced(n)) => {
                        read += n;
                        self.remain_pos += n;
                    }
                }
            }

            if self.header_done && self.remain_pos >= self.header.remaining_length {
                if let Err(error) = self.finish_packet(ctx) {
                    return self.fail(error, read);
                }
            }
        }

        if read > 0 {
            // progress was made; whatever blocked will be retried on the
            // next call, so do not surface a data block for this pass
            self.data_blocked = false;
            (CodecStatus::Ok, read)
        } else if src.is_empty() {
            (CodecStatus::Ok, 0)
        } else {
            (CodecStatus::WouldBlock, 0)
        }
    }

    fn begin_packet<H: EventHandler>(&mut self, ctx: &mut DecodeCtx<'_, H>) -> Result<(), Error> {
        self.header_done = true;
        let packet = RxPacket::from_type(self.header.typ)
            .ok_or(Error::DecodeFixedHeaderServerSpecific)?;
        self.packet = Some(packet);
        trace!(
            "decoding {:?}, remaining length {}",
            packet,
            self.header.remaining_length
        );
        if self.header.remaining_length < packet.min_remaining() {
            return Err(Error::DecodeResponseTooShort);
        }
        if let Some(kind) = packet.pops_at_header() {
            let entry = ctx
                .stores
                .current_mut()
                .pop_marked_by(kind, None)
                .ok_or(Error::DecodeNoCorrespondingRequest)?;
            self.current = Some(entry);
        }
        Ok(())
    }

    fn finish_packet<H: EventHandler>(&mut self, ctx: &mut DecodeCtx<'_, H>) -> Result<(), Error> {
        if self.packet == Some(RxPacket::Pubrec) {
            // the QoS 2 publish just popped frees a slot, so re-queueing it
            // as a PUBREL cannot fail
            if let Some(entry) = self.current.take() {
                let result = ctx.stores.current_mut().append(
                    Kind::PubRel,
                    entry.packet_id,
                    entry.value,
                    ctx.now,
                );
                debug_assert!(result.is_ok());
            }
        } else if let Some(entry) = self.current.take() {
            ctx.complete_entry(entry)?;
        }
        self.reset_packet();
        Ok(())
    }

    fn decode_body<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        src: &[u8],
    ) -> Result<BodyProgress, Error> {
        debug_assert!(!src.is_empty());
        let packet = match self.packet {
            Some(packet) => packet,
            None => return Err(Error::DecodeFixedHeaderServerSpecific),
        };
        match packet {
            RxPacket::Connack => self.body_connack(src[0]),
            RxPacket::Publish => self.body_publish(ctx, src),
            RxPacket::Pingresp => Err(Error::DecodeNonzeroRemainingLength),
            _ => self.body_acked(ctx, src[0]),
        }
    }

    fn body_connack(&mut self, b: u8) -> Result<BodyProgress, Error> {
        match self.remain_pos {
            0 => {
                if b & !1 != 0 {
                    return Err(Error::DecodeConnackInvalidAcknowledgeFlags);
                }
                if let Some(Entry {
                    value: Value::Connect(connect),
                    ..
                }) = &mut self.current
                {
                    connect.response.session_present = b & 1 != 0;
                }
                Ok(BodyProgress::Advanced(1))
            }
            1 => {
                if b > 5 {
                    return Err(Error::DecodeConnackInvalidReturnCode);
                }
                if b != 0 {
                    return Err(Error::from_connack_refusal(b));
                }
                if let Some(Entry {
                    value: Value::Connect(connect),
                    ..
                }) = &mut self.current
                {
                    connect.response.return_code = ConnectReturnCode::Accepted;
                }
                Ok(BodyProgress::Advanced(1))
            }
            _ => Err(Error::DecodeConnackInvalidLength),
        }
    }

    /// Body of the acknowledgement family: two packet-id bytes, then (for
    /// SUBACK) one return code per subscription.
    fn body_acked<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        b: u8,
    ) -> Result<BodyProgress, Error> {
        let pos = self.remain_pos;
        if pos < 2 {
            self.packet_id |= u16::from(b) << (8 * (1 - pos));
            if pos == 1 {
                self.packet_id_complete(ctx)?;
            }
            return Ok(BodyProgress::Advanced(1));
        }
        match self.packet {
            Some(RxPacket::Suback) => {
                self.suback_code(b)?;
                Ok(BodyProgress::Advanced(1))
            }
            _ => Err(Error::DecodeNonzeroRemainingLength),
        }
    }

    fn packet_id_complete<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
    ) -> Result<(), Error> {
        let packet = match self.packet {
            Some(packet) => packet,
            None => return Err(Error::DecodeFixedHeaderServerSpecific),
        };
        if packet == RxPacket::Pubrel {
            // PUBCOMP is always sent, even when the id is no longer held
            // (MQTT-4.3.3-2), so a failed remove is not an error
            ctx.id_set.remove(self.packet_id);
            ctx.stores
                .current_mut()
                .append(
                    Kind::PubComp,
                    Pid::try_from(self.packet_id).ok(),
                    Value::None,
                    ctx.now,
                )
                .map_err(|_| Error::DecodePubrelIdSetFull)?;
            return Ok(());
        }
        let kind = packet
            .request_kind()
            .ok_or(Error::DecodeNoCorrespondingRequest)?;
        let entry = ctx
            .stores
            .current_mut()
            .pop_marked_by(kind, Pid::try_from(self.packet_id).ok())
            .ok_or(Error::DecodeNoCorrespondingRequest)?;
        self.current = Some(entry);
        Ok(())
    }

    fn suback_code(&mut self, b: u8) -> Result<(), Error> {
        let subscribe = match &mut self.current {
            Some(Entry {
                value: Value::Subscribe(subscribe),
                ..
            }) => subscribe,
            _ => return Err(Error::DecodeNoCorrespondingRequest),
        };
        let pos = self.remain_pos - 2;
        if pos == 0 {
            let expected = self.header.remaining_length - 2;
            if expected != subscribe.subscriptions.len() {
                return Err(Error::DecodeSubackCountMismatch);
            }
        }
        let code = SubscribeReturnCode::from_u8(b)?;
        subscribe.subscriptions[pos].return_code = Some(code);
        Ok(())
    }

    fn body_publish<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        src: &[u8],
    ) -> Result<BodyProgress, Error> {
        let rem_len = self.header.remaining_length;
        let qos = QoS::from_u8(self.header.qos)?;
        let p_len: usize = if qos == QoS::Level0 { 0 } else { 2 };
        let pos1 = self.remain_pos + 1;

        let advanced;
        if pos1 <= 2 {
            self.topic_len |= usize::from(src[0]) << ((2 - pos1) * 8);
            if pos1 == 2 && (self.topic_len == 0 || self.topic_len + 2 + p_len > rem_len) {
                return Err(Error::DecodePublishInvalidLength);
            }
            advanced = 1;
        } else {
            let t_len = self.topic_len;
            let p_start = 2 + t_len;
            if pos1 <= p_start {
                match self.allocate_write(ctx, PublishPart::Topic, 3, t_len, src)? {
                    BodyProgress::WouldBlock => return Ok(BodyProgress::WouldBlock),
                    BodyProgress::Advanced(n) => advanced = n,
                }
            } else if pos1 <= p_start + p_len {
                let idx = pos1 - p_start;
                self.packet_id |= u16::from(src[0]) << (8 * (p_len - idx));
                advanced = 1;
            } else {
                let payload_len = rem_len - p_len - p_start;
                match self.allocate_write(
                    ctx,
                    PublishPart::Payload,
                    p_start + p_len + 1,
                    payload_len,
                    src,
                )? {
                    BodyProgress::WouldBlock => return Ok(BodyProgress::WouldBlock),
                    BodyProgress::Advanced(n) => advanced = n,
                }
            }
        }

        if self.remain_pos + advanced >= rem_len {
            self.publish_complete(ctx, qos)?;
        }
        Ok(BodyProgress::Advanced(advanced))
    }

    /// Run the allocation hook at the start of a topic or payload region,
    /// then stream a chunk into the host view. The chunk is capped to the
    /// region so trailing bytes of the buffer are never written through the
    /// wrong sink.
    fn allocate_write<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        part: PublishPart,
        when: usize,
        len: usize,
        src: &[u8],
    ) -> Result<BodyProgress, Error> {
        let pos1 = self.remain_pos + 1;
        let max_len = len - (pos1 - when);
        let chunk = src.len().min(max_len);

        if !self.ignore_publish && pos1 == when {
            let allocation = match part {
                PublishPart::Topic => ctx.handler.allocate_topic(&self.message, len),
                PublishPart::Payload => ctx.handler.allocate_payload(&self.message, len),
            };
            match allocation {
                Allocation::Into(view) => match part {
                    PublishPart::Topic => self.message.topic = Some(view),
                    PublishPart::Payload => self.message.payload = Some(view),
                },
                Allocation::Ignore => self.ignore_publish = true,
                Allocation::Fail => {
                    self.release(ctx);
                    return Err(part.allocate_error());
                }
            }
        }

        if self.ignore_publish {
            return Ok(BodyProgress::Advanced(chunk));
        }

        let view = match part {
            PublishPart::Topic => self.message.topic.as_mut(),
            PublishPart::Payload => self.message.payload.as_mut(),
        };
        let Some(view) = view else {
            self.release(ctx);
            return Err(part.write_error());
        };
        match view.write(&src[..chunk]) {
            // a zero-byte write cannot make progress; treat it as a block
            IoResult::Success(0) | IoResult::WouldBlock => Ok(BodyProgress::WouldBlock),
            IoResult::Success(n) => Ok(BodyProgress::Advanced(n)),
            IoResult::Error(os_error) => {
                self.os_error = os_error;
                self.release(ctx);
                Err(part.write_error())
            }
        }
    }

    fn publish_complete<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        qos: QoS,
    ) -> Result<(), Error> {
        let pid_raw = self.packet_id;
        if qos != QoS::Level0 {
            let kind = if qos == QoS::Level2 {
                Kind::PubRec
            } else {
                Kind::PubAck
            };
            // a full queue drops the reply; the server retransmits
            let _ = ctx.stores.current_mut().append(
                kind,
                Pid::try_from(pid_raw).ok(),
                Value::None,
                ctx.now,
            );
        }

        let duplicate = qos == QoS::Level2 && ctx.id_set.contains(pid_raw);
        if !duplicate {
            if qos == QoS::Level2 && !ctx.id_set.put(pid_raw) {
                self.release(ctx);
                return Err(Error::DecodePublishIdSetFull);
            }
            self.message.qos = qos;
            self.message.retain = self.header.retain;
            self.message.packet_id = if qos == QoS::Level0 {
                None
            } else {
                Pid::try_from(pid_raw).ok()
            };
            if !self.ignore_publish && !ctx.handler.on_message(&mut self.message) {
                self.release(ctx);
                return Err(Error::DecodePublishMessageCallbackFailed);
            }
        } else {
            trace!("duplicate QoS 2 publish, id {}", pid_raw);
        }

        self.release(ctx);
        Ok(())
    }

    fn release<H: EventHandler>(&mut self, ctx: &mut DecodeCtx<'_, H>) {
        if !self.ignore_publish {
            ctx.handler.release_message(&mut self.message);
        }
    }

    fn handshake_byte<H: EventHandler>(
        &mut self,
        ctx: &mut DecodeCtx<'_, H>,
        b: u8,
    ) -> Result<(), Error> {
        self.line.push(b);
        if self.line.len() >= self.line_cap {
            return Err(Error::WsHandshakeLineTooLong);
        }
        if b != b'\n' {
            return Ok(());
        }

        if self.line.as_slice() == ws::HTTP_SWITCHING_LINE {
            self.http_ok = true;
        } else if self.line.as_slice() == b"\r\n" {
            if !self.http_ok || !self.key_ok {
                return Err(Error::WsHandshakeIncompleteReply);
            }
            self.handshake_done = true;
            debug!("websocket handshake complete");
            // the held connect request follows the upgrade on the wire
            if let Some(entry) = self.current.take() {
                let result =
                    ctx.stores
                        .current_mut()
                        .append(Kind::Connect, None, entry.value, ctx.now);
                debug_assert!(result.is_ok());
            }
        } else if self.line.starts_with(ws::ACCEPT_PREFIX) {
            let entry = ctx
                .stores
                .current_mut()
                .pop_marked_by(Kind::WsConnect, None)
                .ok_or(Error::WsHandshakeIncompleteReply)?;
            self.current = Some(entry);
            let expected = match &self.current {
                Some(Entry {
                    value: Value::Connect(connect),
                    ..
                }) => connect.websocket.as_ref().map(|w| w.key_response.as_ref()),
                _ => None,
            };
            let end = self
                .line
                .len()
                .saturating_sub(2)
                .max(ws::ACCEPT_PREFIX.len());
            let key = &self.line[ws::ACCEPT_PREFIX.len()..end];
            if expected != Some(key) {
                return Err(Error::WsHandshakeInvalidResponseKey);
            }
            self.key_ok = true;
        }
        self.line.clear();
        Ok(())
    }
}
