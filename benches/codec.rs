#![feature(test)]

extern crate test;

use std::time::Duration;

use test::{black_box, Bencher};

use mqtt_sansio::{
    Allocation, Client, ClientConfig, Connect, EventHandler, IoResult, Message, Publish, QoS,
    StringView, Transport,
};

struct LoopTransport {
    rx: Vec<u8>,
    pos: usize,
}

impl Transport for LoopTransport {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        let n = buf.len().min(self.rx.len() - self.pos);
        if n == 0 {
            return IoResult::WouldBlock;
        }
        buf[..n].copy_from_slice(&self.rx[self.pos..self.pos + n]);
        self.pos += n;
        IoResult::Success(n)
    }

    fn write(&mut self, buf: &[u8]) -> IoResult {
        IoResult::Success(buf.len())
    }

    fn now(&mut self) -> Duration {
        Duration::ZERO
    }
}

struct Sink;

impl EventHandler for Sink {
    fn allocate_topic(&mut self, _message: &Message, len: usize) -> Allocation {
        Allocation::Into(StringView::Sink(bytes::BytesMut::with_capacity(len)))
    }

    fn allocate_payload(&mut self, _message: &Message, len: usize) -> Allocation {
        Allocation::Into(StringView::Sink(bytes::BytesMut::with_capacity(len)))
    }
}

fn connected_client() -> Client<LoopTransport, Sink> {
    let transport = LoopTransport {
        rx: vec![0x20, 0x02, 0x00, 0x00],
        pos: 0,
    };
    let mut client = Client::new(transport, Sink, ClientConfig::default());
    client.connect(Connect::new("bench", 0)).unwrap();
    client.run_once();
    client
}

#[bench]
fn connect_tick(b: &mut Bencher) {
    b.iter(|| {
        let client = black_box(connected_client());
        client
    });
}

#[bench]
fn encode_qos0_publish(b: &mut Bencher) {
    let mut client = connected_client();
    b.iter(|| {
        client
            .publish(Publish::new("bench/topic", "payload bytes for the bench"))
            .unwrap();
        black_box(client.run_once())
    });
}

#[bench]
fn encode_qos1_publish_round_trip(b: &mut Bencher) {
    let mut client = connected_client();
    // the id allocator hands out consecutive ids while the store drains
    // every iteration, so the matching PUBACK can be precomputed
    let mut id: u16 = 0;
    b.iter(|| {
        id = id.wrapping_add(1);
        if id == 0 {
            id = 1;
        }
        let mut publish = Publish::new("bench/topic", "payload bytes for the bench");
        publish.qos = QoS::Level1;
        client.publish(publish).unwrap();
        client.run_once();
        let transport = client.transport_mut();
        transport.rx.clear();
        transport
            .rx
            .extend_from_slice(&[0x40, 0x02, (id >> 8) as u8, id as u8]);
        transport.pos = 0;
        black_box(client.run_once())
    });
}

#[bench]
fn decode_inbound_publish(b: &mut Bencher) {
    let mut client = connected_client();
    let packet = [
        0x30, 0x1B, 0x00, 0x0B, b'b', b'e', b'n', b'c', b'h', b'/', b't', b'o', b'p', b'i', b'c',
        b'p', b'a', b'y', b'l', b'o', b'a', b'd', b' ', b'0', b'1', b'2', b'3', b'4', b'5',
    ];
    b.iter(|| {
        let transport = client.transport_mut();
        transport.rx.clear();
        transport.rx.extend_from_slice(&packet);
        transport.pos = 0;
        black_box(client.run_once())
    });
}
