use core::convert::TryFrom;
use core::time::Duration;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use proptest::prelude::*;

use crate::store::{Kind, Store, Value};
use crate::tx::TxCodec;
use crate::types::CodecStatus;
use crate::utils::encode_remaining_length;
use crate::{
    Connect, Error, IoResult, LastWill, Pid, Publish, QoS, StringRead, StringView, Subscribe,
    Subscription, Unsubscribe,
};

use super::support::{ws_connect, Recorder, ScriptTransport};

fn pid(id: u16) -> Pid {
    Pid::try_from(id).unwrap()
}

struct TxRig {
    tx: TxCodec,
    store: Store,
    transport: ScriptTransport,
    rec: Recorder,
}

impl TxRig {
    fn new(ws_enabled: bool) -> Self {
        TxRig {
            tx: TxCodec::new(ws_enabled),
            store: Store::new(8, Duration::ZERO),
            transport: ScriptTransport::new(),
            rec: Recorder::new(),
        }
    }

    fn queue(&mut self, kind: Kind, packet_id: Option<Pid>, value: Value) {
        self.store
            .append(kind, packet_id, value, Duration::ZERO)
            .unwrap();
    }

    fn encode(&mut self, buf: &mut [u8]) -> (CodecStatus, usize) {
        self.tx.encode(
            &mut self.store,
            &mut self.transport,
            &mut self.rec,
            buf,
        )
    }

    /// Encode everything queued through one large buffer.
    fn encode_all(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (status, n) = self.encode(&mut buf);
        assert_eq!(status, CodecStatus::Ok);
        buf.truncate(n);
        buf
    }

    /// Encode everything queued, `chunk` destination bytes at a time.
    fn encode_chunked(&mut self, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        for _ in 0..4096 {
            let (status, n) = self.encode(&mut buf);
            assert_ne!(status, CodecStatus::Error);
            out.extend_from_slice(&buf[..n]);
            if !self.store.has_current() {
                break;
            }
        }
        out
    }
}

#[test]
fn encodes_minimal_connect() {
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Connect, None, Value::Connect(Connect::new("c", 60)));

    let bytes = rig.encode_all();

    assert_eq!(
        bytes,
        [0x10, 0x0D, 0x00, 0x04, 0x4D, 0x51, 0x54, 0x54, 0x04, 0x02, 0x00, 0x3C, 0x00, 0x01, 0x63]
    );
    assert!(!rig.store.has_current(), "connect awaits its CONNACK");
    assert_eq!(rig.store.len(), 1);
}

#[test]
fn encodes_full_connect() {
    let mut connect = Connect::new("cid", 60);
    connect.last_will = Some(LastWill {
        qos: QoS::Level1,
        retain: true,
        topic: StringView::from("w/t"),
        message: StringView::from("bye"),
    });
    connect.user_name = StringView::from("u");
    connect.password = StringView::from("p");

    let mut rig = TxRig::new(false);
    rig.queue(Kind::Connect, None, Value::Connect(connect));
    let bytes = rig.encode_all();

    let expected: &[u8] = &[
        0x10, 0x1F, 0x00, 0x04, 0x4D, 0x51, 0x54, 0x54, 0x04, 0xEE, 0x00, 0x3C, // header
        0x00, 0x03, b'c', b'i', b'd', // client id
        0x00, 0x03, b'w', b'/', b't', // will topic
        0x00, 0x03, b'b', b'y', b'e', // will message
        0x00, 0x01, b'u', // user name
        0x00, 0x01, b'p', // password
    ];
    assert_eq!(bytes, expected);
}

#[test]
fn encodes_qos0_publish_and_completes_it() {
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Publish0, None, Value::Publish(Publish::new("x", "")));

    let bytes = rig.encode_all();

    assert_eq!(bytes, [0x30, 0x03, 0x00, 0x01, b'x']);
    assert_eq!(rig.store.len(), 0, "no response expected");
    assert_eq!(rig.rec.publishes, vec![true]);
}

#[test]
fn qos0_publish_callback_failure() {
    let mut rig = TxRig::new(false);
    rig.rec.on_publish_result = false;
    rig.queue(Kind::Publish0, None, Value::Publish(Publish::new("x", "")));

    let mut buf = [0u8; 64];
    let (status, _) = rig.encode(&mut buf);

    assert_eq!(status, CodecStatus::Error);
    assert_eq!(rig.tx.error, Some(Error::CallbackPublish));
}

#[test]
fn encodes_qos1_publish_with_packet_id() {
    let mut publish = Publish::new("te", "ab");
    publish.qos = QoS::Level1;
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Publish1, Some(pid(7)), Value::Publish(publish));

    let bytes = rig.encode_all();

    assert_eq!(
        bytes,
        [0x32, 0x08, 0x00, 0x02, b't', b'e', 0x00, 0x07, b'a', b'b']
    );
    assert_eq!(rig.store.len(), 1, "kept until the PUBACK");
    assert!(!rig.store.has_current());
}

#[test]
fn retransmission_sets_the_dup_flag() {
    let mut publish = Publish::new("te", "ab");
    publish.qos = QoS::Level1;
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Publish1, Some(pid(7)), Value::Publish(publish));

    let first = rig.encode_all();
    assert_eq!(first[0], 0x32);

    rig.store.unmark_all();
    let second = rig.encode_all();
    assert_eq!(second[0], 0x3A, "DUP set on retransmission");
    assert_eq!(&second[1..], &first[1..]);
}

#[test]
fn encodes_subscribe() {
    let subscribe = Subscribe::new(vec![Subscription::new("a/b", QoS::Level1)]);
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Subscribe, Some(pid(2)), Value::Subscribe(subscribe));

    let bytes = rig.encode_all();

    assert_eq!(
        bytes,
        [0x82, 0x08, 0x00, 0x02, 0x00, 0x03, b'a', b'/', b'b', 0x01]
    );
}

#[test]
fn encodes_unsubscribe_topics_in_order() {
    let unsubscribe = Unsubscribe::new(vec!["a/b".into(), "c".into()]);
    let mut rig = TxRig::new(false);
    rig.queue(
        Kind::Unsubscribe,
        Some(pid(3)),
        Value::Unsubscribe(unsubscribe),
    );

    let bytes = rig.encode_all();

    assert_eq!(
        bytes,
        [0xA2, 0x0A, 0x00, 0x03, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x01, b'c']
    );
}

#[test]
fn encodes_acknowledgements() {
    for (kind, control, keeps_entry) in [
        (Kind::PubAck, 0x40u8, false),
        (Kind::PubRec, 0x50, false),
        (Kind::PubRel, 0x62, true),
        (Kind::PubComp, 0x70, false),
    ] {
        let mut rig = TxRig::new(false);
        rig.queue(kind, Some(pid(5)), Value::None);
        let bytes = rig.encode_all();
        assert_eq!(bytes, [control, 0x02, 0x00, 0x05], "{kind:?}");
        assert_eq!(rig.store.len(), usize::from(keeps_entry), "{kind:?}");
    }
}

#[test]
fn encodes_pingreq_and_disconnect() {
    let mut rig = TxRig::new(false);
    rig.queue(Kind::PingReq, None, Value::None);
    assert_eq!(rig.encode_all(), [0xC0, 0x00]);

    let mut rig = TxRig::new(false);
    rig.queue(Kind::Disconnect, None, Value::None);
    assert_eq!(rig.encode_all(), [0xE0, 0x00]);
    assert!(rig.tx.closed);

    // nothing goes out after the disconnect
    rig.queue(Kind::PingReq, None, Value::None);
    let mut buf = [0u8; 16];
    let (status, n) = rig.encode(&mut buf);
    assert_eq!(status, CodecStatus::Ok);
    assert_eq!(n, 0);
}

#[test]
fn one_byte_buffer_produces_the_same_stream() {
    fn full_connect() -> Connect {
        let mut connect = Connect::new("resume", 30);
        connect.last_will = Some(LastWill {
            qos: QoS::Level2,
            retain: false,
            topic: StringView::from("will"),
            message: StringView::from("gone"),
        });
        connect.user_name = StringView::from("user");
        connect.password = StringView::from("pw");
        connect
    }

    let mut rig = TxRig::new(false);
    rig.queue(Kind::Connect, None, Value::Connect(full_connect()));
    let reference = rig.encode_all();

    for chunk in [1usize, 2, 3, 7] {
        let mut rig = TxRig::new(false);
        rig.queue(Kind::Connect, None, Value::Connect(full_connect()));
        assert_eq!(rig.encode_chunked(chunk), reference, "chunk size {chunk}");
    }
}

/// Source that blocks a configurable number of times before producing.
struct StallingReader {
    data: Vec<u8>,
    pos: usize,
    stalls: usize,
}

impl StringRead for StallingReader {
    fn read(&mut self, dst: &mut [u8]) -> IoResult {
        if self.stalls > 0 {
            self.stalls -= 1;
            return IoResult::WouldBlock;
        }
        let n = dst.len().min(self.data.len() - self.pos);
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        IoResult::Success(n)
    }
}

#[test]
fn blocking_payload_source_suspends_and_resumes() {
    let mut publish = Publish::new("t", "");
    publish.payload = StringView::Reader {
        len: 2,
        reader: Box::new(StallingReader {
            data: vec![b'x', b'y'],
            pos: 0,
            stalls: 1,
        }),
    };
    let mut rig = TxRig::new(false);
    rig.queue(Kind::Publish0, None, Value::Publish(publish));

    let mut buf = [0u8; 64];
    let (status, n) = rig.encode(&mut buf);
    assert_eq!(status, CodecStatus::WouldBlock);
    assert!(rig.tx.data_blocked);
    let mut out = buf[..n].to_vec();

    let (status, n) = rig.encode(&mut buf);
    assert_eq!(status, CodecStatus::Ok);
    out.extend_from_slice(&buf[..n]);

    assert_eq!(out, [0x30, 0x05, 0x00, 0x01, b't', b'x', b'y']);
    assert_eq!(rig.rec.publishes, vec![true]);
}

#[test]
fn encodes_websocket_handshake_request() {
    let mut rig = TxRig::new(true);
    rig.queue(Kind::WsConnect, None, Value::Connect(ws_connect()));

    let bytes = rig.encode_all();

    let expected = b"GET /mqtt HTTP/1.1\r\n\
Host: broker.local:8080\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Origin: http://broker.local:8080\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Protocol: mqtt\r\n\
\r\n";
    assert_eq!(bytes, expected, "handshake request text");
    assert!(!rig.store.has_current(), "handshake awaits the reply");
}

#[test]
fn masks_websocket_frames() {
    let mut rig = TxRig::new(true);
    rig.transport.mask = [1, 1, 1, 1];
    rig.queue(Kind::Publish0, None, Value::Publish(Publish::new("x", "")));

    let bytes = rig.encode_all();

    // frame header in the clear, MQTT bytes XORed with the mask
    assert_eq!(
        bytes,
        [0x82, 0x85, 1, 1, 1, 1, 0x31, 0x02, 0x01, 0x00, 0x79]
    );
}

#[test]
fn masked_stream_resumes_consistently() {
    let mut publish = Publish::new("topic/a", "payload bytes");
    publish.qos = QoS::Level1;
    let mut rig = TxRig::new(true);
    rig.transport.mask = [0x5A, 0xC3, 0x17, 0x88];
    rig.queue(Kind::Publish1, Some(pid(9)), Value::Publish(publish));
    let reference = rig.encode_all();

    let mut publish = Publish::new("topic/a", "payload bytes");
    publish.qos = QoS::Level1;
    let mut rig = TxRig::new(true);
    rig.transport.mask = [0x5A, 0xC3, 0x17, 0x88];
    rig.queue(Kind::Publish1, Some(pid(9)), Value::Publish(publish));
    assert_eq!(rig.encode_chunked(3), reference);
}

fn decode_var_int(bytes: &[u8]) -> (usize, usize) {
    let mut value = 0usize;
    let mut used = 0;
    for &b in bytes {
        value |= usize::from(b & 0x7F) << (7 * used);
        used += 1;
        if b & 0x80 == 0 {
            break;
        }
    }
    (value, used)
}

proptest! {
    #[test]
    fn remaining_length_round_trips(value in 0usize..=0x0FFF_FFFF) {
        let mut buf = [0u8; 4];
        let n = encode_remaining_length(value, &mut buf);
        let (decoded, used) = decode_var_int(&buf[..n]);
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(used, n);
    }

    #[test]
    fn any_chunking_produces_the_same_stream(chunk in 1usize..16) {
        fn queue(rig: &mut TxRig) {
            let mut publish = Publish::new("prop/topic", "some payload data");
            publish.qos = QoS::Level2;
            rig.queue(Kind::Publish2, Some(pid(11)), Value::Publish(publish));
            rig.queue(Kind::PingReq, None, Value::None);
        }
        let mut reference = TxRig::new(false);
        queue(&mut reference);
        let expected = reference.encode_all();

        let mut rig = TxRig::new(false);
        queue(&mut rig);
        prop_assert_eq!(rig.encode_chunked(chunk), expected);
    }
}
