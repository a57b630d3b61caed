#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;

use mqtt_sansio::{
    Allocation, Client, ClientConfig, Connect, EventHandler, IoResult, Message, RunStatus,
    StringView, Transport,
};

/// Serves the fuzz input as the server's byte stream, then EOF.
struct Feed<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Transport for Feed<'_> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
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
        Allocation::Into(StringView::Sink(bytes::BytesMut::with_capacity(len.min(4096))))
    }

    fn allocate_payload(&mut self, _message: &Message, len: usize) -> Allocation {
        Allocation::Into(StringView::Sink(bytes::BytesMut::with_capacity(len.min(4096))))
    }
}

fuzz_target!(|data: &[u8]| {
    let transport = Feed { data, pos: 0 };
    let mut client = Client::new(transport, Sink, ClientConfig::default());
    if client.connect(Connect::new("fuzz", 60)).is_err() {
        return;
    }
    for _ in 0..1024 {
        let status = client.run_once();
        if status.intersects(RunStatus::EOF | RunStatus::ERROR) {
            break;
        }
    }
});
