use core::time::Duration;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bytes::{Bytes, BytesMut};

use crate::{
    Allocation, Connect, EventHandler, IoResult, Message, Publish, QoS, Subscribe,
    SubscribeReturnCode, Transport, Unsubscribe, WebsocketParams,
};

/// Connect request with the RFC 6455 sample nonce and accept value.
pub fn ws_connect() -> Connect {
    let mut connect = Connect::new("c", 60);
    connect.websocket = Some(WebsocketParams {
        addr: Bytes::from_static(b"broker.local:8080"),
        key: Bytes::from_static(b"dGhlIHNhbXBsZSBub25jZQ=="),
        key_response: Bytes::from_static(b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
    });
    connect
}

/// Scripted transport: incoming bytes are drained from `rx`, outgoing bytes
/// are captured in `tx`, time is whatever the test sets.
pub struct ScriptTransport {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    pub time: Duration,
    /// Largest read served per call; smaller values exercise resumption.
    pub read_chunk: usize,
    /// Largest write accepted per call.
    pub write_chunk: usize,
    /// Report WouldBlock on every write.
    pub write_block: bool,
    /// When `rx` runs dry: report EOF instead of WouldBlock.
    pub read_eof: bool,
    pub mask: [u8; 4],
}

impl ScriptTransport {
    pub fn new() -> Self {
        ScriptTransport {
            rx: VecDeque::new(),
            tx: Vec::new(),
            time: Duration::ZERO,
            read_chunk: usize::MAX,
            write_chunk: usize::MAX,
            write_block: false,
            read_eof: false,
            mask: [0; 4],
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    pub fn advance(&mut self, by: Duration) {
        self.time += by;
    }
}

impl Transport for ScriptTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        if self.rx.is_empty() {
            return if self.read_eof {
                IoResult::Success(0)
            } else {
                IoResult::WouldBlock
            };
        }
        let n = buf.len().min(self.rx.len()).min(self.read_chunk);
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap();
        }
        IoResult::Success(n)
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        if self.write_block {
            return IoResult::WouldBlock;
        }
        let n = buf.len().min(self.write_chunk);
        self.tx.extend_from_slice(&buf[..n]);
        IoResult::Success(n)
    }

    fn now(&mut self) -> Duration {
        self.time
    }

    fn websocket_mask(&mut self) -> [u8; 4] {
        self.mask
    }
}

pub struct CapturedMessage {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub packet_id: Option<u16>,
}

/// Recording event handler with switchable outcomes.
pub struct Recorder {
    /// (session_present, return_code, success) per connect completion.
    pub connects: Vec<(bool, u8, bool)>,
    /// (granted codes, success) per subscribe completion.
    pub subscribes: Vec<(Vec<Option<SubscribeReturnCode>>, bool)>,
    pub unsubscribes: Vec<bool>,
    /// success flag per outbound publish completion.
    pub publishes: Vec<bool>,
    pub messages: Vec<CapturedMessage>,
    pub released: usize,
    /// Hand out `Sink` views for incoming topics and payloads.
    pub allocate: bool,
    pub allocate_topic_result: Option<Allocation>,
    pub allocate_payload_fail: bool,
    pub on_message_result: bool,
    pub on_connect_result: bool,
    pub on_subscribe_result: bool,
    pub on_publish_result: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Recorder {
            connects: Vec::new(),
            subscribes: Vec::new(),
            unsubscribes: Vec::new(),
            publishes: Vec::new(),
            messages: Vec::new(),
            released: 0,
            allocate: true,
            allocate_topic_result: None,
            allocate_payload_fail: false,
            on_message_result: true,
            on_connect_result: true,
            on_subscribe_result: true,
            on_publish_result: true,
        }
    }
}

impl EventHandler for Recorder {
    fn on_connect(&mut self, connect: &Connect, success: bool) -> bool {
        self.connects.push((
            connect.response.session_present,
            connect.response.return_code as u8,
            success,
        ));
        self.on_connect_result
    }

    fn on_subscribe(&mut self, subscribe: &Subscribe, success: bool) -> bool {
        let codes = subscribe
            .subscriptions
            .iter()
            .map(|s| s.return_code)
            .collect();
        self.subscribes.push((codes, success));
        self.on_subscribe_result
    }

    fn on_unsubscribe(&mut self, _unsubscribe: &Unsubscribe, success: bool) -> bool {
        self.unsubscribes.push(success);
        true
    }

    fn on_publish(&mut self, _publish: &Publish, success: bool) -> bool {
        self.publishes.push(success);
        self.on_publish_result
    }

    fn allocate_topic(&mut self, _message: &Message, len: usize) -> Allocation {
        if let Some(result) = self.allocate_topic_result.take() {
            return result;
        }
        if self.allocate {
            Allocation::Into(crate::StringView::Sink(BytesMut::with_capacity(len)))
        } else {
            Allocation::Ignore
        }
    }

    fn allocate_payload(&mut self, _message: &Message, len: usize) -> Allocation {
        if self.allocate_payload_fail {
            return Allocation::Fail;
        }
        if self.allocate {
            Allocation::Into(crate::StringView::Sink(BytesMut::with_capacity(len)))
        } else {
            Allocation::Ignore
        }
    }

    fn on_message(&mut self, message: &mut Message) -> bool {
        let topic = message
            .topic
            .as_ref()
            .and_then(|v| v.as_bytes())
            .map_or(Vec::new(), <[u8]>::to_vec);
        let payload = message
            .payload
            .as_ref()
            .and_then(|v| v.as_bytes())
            .map_or(Vec::new(), <[u8]>::to_vec);
        self.messages.push(CapturedMessage {
            topic,
            payload,
            qos: message.qos,
            retain: message.retain,
            packet_id: message.packet_id.map(|p| p.get()),
        });
        self.on_message_result
    }

    fn release_message(&mut self, _message: &mut Message) {
        self.released += 1;
    }
}
