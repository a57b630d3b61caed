use core::time::Duration;

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::debug;

use crate::publish::Allocation;
use crate::rx::RxCodec;
use crate::store::{Entry, IdSet, Kind, Store, Value};
use crate::tx::TxCodec;
use crate::types::CodecStatus;
use crate::{
    Connect, Error, IoResult, Message, Publish, QoS, Subscribe, Transport, Unsubscribe,
};

bitflags! {
    /// Outcome bits of one [`Client::run_once`] tick.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RunStatus: u8 {
        /// The peer closed the connection (or a sent DISCONNECT completed).
        const EOF = 0x01;
        /// The client failed; [`Client::error`] carries the code.
        const ERROR = 0x02;
        /// The transport has no bytes to read.
        const WOULD_BLOCK_CONN_RD = 0x04;
        /// The transport cannot accept more bytes.
        const WOULD_BLOCK_CONN_WR = 0x08;
        /// An outgoing string source is blocked.
        const WOULD_BLOCK_DATA_RD = 0x10;
        /// An incoming string sink is blocked.
        const WOULD_BLOCK_DATA_WR = 0x20;
        /// The main store can accept another request.
        const QUEUEABLE = 0x40;
    }
}

/// Client life cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection; only `connect` is accepted.
    Initial,
    /// CONNECT (and in WebSocket mode the upgrade) is in flight.
    Connecting,
    /// Session established; requests are accepted.
    Connected,
    /// A protocol or transport error latched; `reset` starts over.
    Failed,
}

/// Completion and message hooks implemented by the host.
///
/// Completions receive `success = false` when the client is being torn down
/// with the request still pending. Returning `false` from a completion
/// whose `success` is true is treated as a protocol-layer error and fails
/// the client.
///
/// The allocation hooks default to [`Allocation::Ignore`], which makes a
/// host without message hooks silently consume incoming publishes.
pub trait EventHandler {
    fn on_connect(&mut self, connect: &Connect, success: bool) -> bool {
        let _ = (connect, success);
        true
    }

    fn on_subscribe(&mut self, subscribe: &Subscribe, success: bool) -> bool {
        let _ = (subscribe, success);
        true
    }

    fn on_unsubscribe(&mut self, unsubscribe: &Unsubscribe, success: bool) -> bool {
        let _ = (unsubscribe, success);
        true
    }

    fn on_publish(&mut self, publish: &Publish, success: bool) -> bool {
        let _ = (publish, success);
        true
    }

    /// Provide a destination for an incoming topic of `len` bytes.
    fn allocate_topic(&mut self, message: &Message, len: usize) -> Allocation {
        let _ = (message, len);
        Allocation::Ignore
    }

    /// Provide a destination for an incoming payload of `len` bytes.
    fn allocate_payload(&mut self, message: &Message, len: usize) -> Allocation {
        let _ = (message, len);
        Allocation::Ignore
    }

    /// An incoming publish completed. Returning false fails the client.
    fn on_message(&mut self, message: &mut Message) -> bool {
        let _ = message;
        true
    }

    /// Reclaim the views handed out by the allocation hooks. Runs whether
    /// the message completed or failed, as long as allocation was offered.
    fn release_message(&mut self, message: &mut Message) {
        let _ = message;
    }
}

/// Capacities and knobs fixed at construction. All memory is sized here;
/// the engine never allocates afterwards.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tx_buffer_size: usize,
    pub rx_buffer_size: usize,
    /// Capacity of the main outbound store, in packets.
    pub store_capacity: usize,
    /// Capacity of the inbound QoS 2 id set.
    pub id_set_capacity: usize,
    /// Ack deadline for sent-but-unacknowledged packets; zero disables.
    pub ack_timeout: Duration,
    /// Run MQTT over WebSocket framing with an HTTP upgrade handshake.
    pub websocket: bool,
    /// Line buffer for the handshake response (WebSocket mode).
    pub handshake_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            tx_buffer_size: 1024,
            rx_buffer_size: 1024,
            store_capacity: 16,
            id_set_capacity: 16,
            ack_timeout: Duration::from_secs(15),
            websocket: false,
            handshake_buffer_size: 256,
        }
    }
}

/// The two outbound stores and the switch between them. The connect store
/// is current from `connect()` until the CONNACK completes; everything
/// afterwards flows through the main store.
#[derive(Debug)]
pub(crate) struct Stores {
    pub main: Store,
    pub connect: Store,
    pub use_main: bool,
}

impl Stores {
    pub fn current_mut(&mut self) -> &mut Store {
        if self.use_main {
            &mut self.main
        } else {
            &mut self.connect
        }
    }
}

/// Connection-level state shared with the decoder while it routes
/// completions.
#[derive(Debug)]
pub(crate) struct ConnCore {
    pub state: ClientState,
    /// No connection cycle is active; completions fired now are failures.
    pub closed: bool,
    pub clean_session: bool,
}

/// Borrowed decode context: everything a completed packet may touch.
pub(crate) struct DecodeCtx<'a, H: EventHandler> {
    pub stores: &'a mut Stores,
    pub id_set: &'a mut IdSet,
    pub handler: &'a mut H,
    pub conn: &'a mut ConnCore,
    pub now: Duration,
}

impl<H: EventHandler> DecodeCtx<'_, H> {
    /// Route a consumed request entry to its completion hook. A CONNACK
    /// additionally adopts the session parameters and brings the client
    /// into the connected state before its hook runs.
    pub fn complete_entry(&mut self, entry: Entry) -> Result<(), Error> {
        let kind = entry.kind;
        if kind == Kind::Connect && !self.conn.closed {
            if let Value::Connect(connect) = &entry.value {
                self.adopt_session(connect);
            }
        }
        let success = !self.conn.closed;
        if !fire_completion(self.handler, entry.value, success) {
            if let Some(error) = kind.callback_error() {
                return Err(error);
            }
        }
        Ok(())
    }

    fn adopt_session(&mut self, connect: &Connect) {
        debug!(
            "connected, clean_session={} keep_alive={}s",
            connect.clean_session, connect.keep_alive
        );
        self.conn.clean_session = connect.clean_session;
        self.conn.state = ClientState::Connected;
        self.stores.main.keep_alive = Duration::from_secs(u64::from(connect.keep_alive));
        self.stores.use_main = true;
        cleanup_stores(
            self.stores,
            self.id_set,
            self.handler,
            self.conn.closed,
            !connect.clean_session,
        );
        self.stores.main.unmark_all();
    }
}

fn fire_completion<H: EventHandler>(handler: &mut H, value: Value, success: bool) -> bool {
    match value {
        Value::Connect(connect) => handler.on_connect(&connect, success),
        Value::Subscribe(subscribe) => handler.on_subscribe(&subscribe, success),
        Value::Unsubscribe(unsubscribe) => handler.on_unsubscribe(&unsubscribe, success),
        Value::Publish(publish) => handler.on_publish(&publish, success),
        Value::None => true,
    }
}

/// Flush or trim the stores around a connection boundary. A preserved
/// session keeps its in-flight entries for retransmission and only drops
/// the control packets that make no sense on a new connection.
fn cleanup_stores<H: EventHandler>(
    stores: &mut Stores,
    id_set: &mut IdSet,
    handler: &mut H,
    closed: bool,
    keep_session: bool,
) {
    if keep_session {
        stores.main.discard_kinds(&[Kind::PingReq, Kind::Disconnect]);
    } else {
        while let Some(entry) = stores.main.shift() {
            fire_completion(handler, entry.value, !closed);
        }
        id_set.clear();
    }
    while let Some(entry) = stores.connect.shift() {
        fire_completion(handler, entry.value, !closed);
    }
}

/// Phase outcome of one buffer pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// EOF was observed; the client went back to the initial state.
    Ready,
    /// The transport side blocked.
    BlockConn,
    /// A host string source or sink blocked (or there was nothing to do).
    BlockData,
    Error,
}

/// Sans-I/O MQTT 3.1.1 client.
///
/// The client owns the codecs, the stores and two byte buffers, and pumps
/// them against the host transport one cooperative tick at a time. Nothing
/// here blocks: every tick advances as far as the transport and the host's
/// string movers permit and reports why it stopped.
pub struct Client<T, H> {
    transport: T,
    handler: H,
    conn: ConnCore,
    error: Option<Error>,
    os_error: i32,
    stores: Stores,
    id_set: IdSet,
    tx: TxCodec,
    rx: RxCodec,
    write_buf: Vec<u8>,
    write_pos: usize,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl<T: Transport, H: EventHandler> Client<T, H> {
    pub fn new(transport: T, handler: H, config: ClientConfig) -> Self {
        let connect_slots = if config.websocket { 2 } else { 1 };
        let mut client = Client {
            transport,
            handler,
            conn: ConnCore {
                state: ClientState::Initial,
                closed: true,
                clean_session: false,
            },
            error: None,
            os_error: 0,
            stores: Stores {
                main: Store::new(config.store_capacity, config.ack_timeout),
                connect: Store::new(connect_slots, config.ack_timeout),
                use_main: false,
            },
            id_set: IdSet::new(config.id_set_capacity),
            tx: TxCodec::new(config.websocket),
            rx: RxCodec::new(config.websocket, config.handshake_buffer_size),
            write_buf: vec![0; config.tx_buffer_size],
            write_pos: 0,
            read_buf: vec![0; config.rx_buffer_size],
            read_pos: 0,
        };
        client.set_state_initial();
        client
    }

    pub fn state(&self) -> ClientState {
        self.conn.state
    }

    /// The latched error, if the client failed.
    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// OS error number accompanying a connection or string-mover error.
    pub fn os_error(&self) -> i32 {
        self.os_error
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Time until the next keep-alive or ack deadline, for hosts that arm
    /// an event-loop timer instead of polling.
    pub fn next_timeout(&mut self) -> Option<Duration> {
        let now = self.transport.now();
        self.stores
            .current_mut()
            .get_timeout(now)
            .map(|(remaining, _)| remaining)
    }

    /// Queue a CONNECT (in WebSocket mode, the upgrade handshake followed
    /// by the CONNECT). Accepted only in the initial state.
    pub fn connect(&mut self, connect: Connect) -> Result<(), Error> {
        if self.conn.state != ClientState::Initial {
            return Err(Error::NotPermitted);
        }
        connect.validate()?;
        if self.tx.ws_enabled && connect.websocket.is_none() {
            return Err(Error::InvalidPacket);
        }
        let now = self.transport.now();
        let kind = if self.tx.ws_enabled {
            Kind::WsConnect
        } else {
            Kind::Connect
        };
        self.stores
            .connect
            .append(kind, None, Value::Connect(connect), now)?;
        self.set_state_connecting();
        Ok(())
    }

    pub fn subscribe(&mut self, subscribe: Subscribe) -> Result<(), Error> {
        if self.conn.state != ClientState::Connected {
            return Err(Error::NotPermitted);
        }
        subscribe.validate()?;
        let now = self.transport.now();
        let pid = self.stores.main.next_packet_id();
        self.stores
            .main
            .append(Kind::Subscribe, Some(pid), Value::Subscribe(subscribe), now)
    }

    pub fn unsubscribe(&mut self, unsubscribe: Unsubscribe) -> Result<(), Error> {
        if self.conn.state != ClientState::Connected {
            return Err(Error::NotPermitted);
        }
        unsubscribe.validate()?;
        let now = self.transport.now();
        let pid = self.stores.main.next_packet_id();
        self.stores.main.append(
            Kind::Unsubscribe,
            Some(pid),
            Value::Unsubscribe(unsubscribe),
            now,
        )
    }

    pub fn publish(&mut self, publish: Publish) -> Result<(), Error> {
        if self.conn.state != ClientState::Connected {
            return Err(Error::NotPermitted);
        }
        publish.validate()?;
        let now = self.transport.now();
        let (kind, pid) = match publish.qos {
            QoS::Level0 => (Kind::Publish0, None),
            qos => (Kind::for_publish(qos), Some(self.stores.main.next_packet_id())),
        };
        self.stores
            .main
            .append(kind, pid, Value::Publish(publish), now)
    }

    pub fn disconnect(&mut self) -> Result<(), Error> {
        if self.conn.state != ClientState::Connected {
            return Err(Error::NotPermitted);
        }
        let now = self.transport.now();
        self.stores
            .main
            .append(Kind::Disconnect, None, Value::None, now)
    }

    /// One cooperative tick: keep-alive bookkeeping, then encode→write and
    /// read→decode over the two buffers, repeating while replies produced
    /// by the decoder can still be flushed.
    pub fn run_once(&mut self) -> RunStatus {
        if self.keep_alive_check() == Phase::Error {
            return RunStatus::ERROR;
        }

        let mut result;
        loop {
            result = RunStatus::empty();

            match self.process_output() {
                Phase::Ready => return RunStatus::EOF | RunStatus::WOULD_BLOCK_CONN_WR,
                Phase::Error => return RunStatus::ERROR,
                Phase::BlockConn => result |= RunStatus::WOULD_BLOCK_CONN_WR,
                Phase::BlockData => {
                    if self.tx.data_blocked {
                        result |= RunStatus::WOULD_BLOCK_DATA_RD;
                    }
                }
            }

            let had_current = self.stores.current_mut().has_current();

            match self.process_input() {
                Phase::Ready => return RunStatus::EOF | RunStatus::WOULD_BLOCK_CONN_RD,
                Phase::Error => return RunStatus::ERROR,
                Phase::BlockConn => result |= RunStatus::WOULD_BLOCK_CONN_RD,
                Phase::BlockData => {
                    if self.rx.data_blocked {
                        result |= RunStatus::WOULD_BLOCK_DATA_WR;
                    }
                }
            }

            let has_current = self.stores.current_mut().has_current();

            // flush replies (PUBACK, PUBREC, PUBCOMP) the decoder just
            // queued without waiting for another external tick, unless
            // writing already blocked
            if result.contains(RunStatus::WOULD_BLOCK_CONN_WR) || had_current || !has_current {
                break;
            }
        }

        if self.stores.main.is_queueable() {
            result |= RunStatus::QUEUEABLE;
        }
        result
    }

    /// Return to the initial state after a failure or EOF, preserving or
    /// flushing session state according to the last clean-session choice.
    /// A finalized client stays closed.
    pub fn reset(&mut self) {
        if self.conn.closed && self.error != Some(Error::Closed) {
            self.set_state_initial();
        }
    }

    /// Permanently stop the client: pending completions fire with
    /// `success = false` and every further operation reports `Closed`.
    pub fn finalize(&mut self) {
        self.error = Some(Error::Closed);
        self.os_error = 0;
        self.set_state_failed();
        if let Some(entry) = self.rx.take_current() {
            fire_completion(&mut self.handler, entry.value, false);
        }
        cleanup_stores(
            &mut self.stores,
            &mut self.id_set,
            &mut self.handler,
            true,
            false,
        );
    }

    fn set_state_initial(&mut self) {
        debug!("client state: initial");
        self.error = None;
        self.os_error = 0;
        self.conn.closed = true;
        self.conn.state = ClientState::Initial;
        let now = self.transport.now();
        self.stores.connect.touch(now);
        self.stores.use_main = false;
        cleanup_stores(
            &mut self.stores,
            &mut self.id_set,
            &mut self.handler,
            self.conn.closed,
            !self.conn.clean_session,
        );
        self.tx.finish();
    }

    fn set_state_connecting(&mut self) {
        debug!("client state: connecting");
        self.error = None;
        self.os_error = 0;
        self.conn.closed = false;
        self.conn.state = ClientState::Connecting;
        self.rx.reset();
        self.tx.reset();
        self.read_pos = 0;
        self.write_pos = 0;
    }

    fn set_state_failed(&mut self) {
        debug!("client state: failed ({:?})", self.error);
        self.conn.closed = true;
        self.conn.state = ClientState::Failed;
    }

    fn keep_alive_check(&mut self) -> Phase {
        if self.error.is_some() {
            return Phase::Error;
        }
        let now = self.transport.now();
        let Some((remaining, pending)) = self.stores.current_mut().get_timeout(now) else {
            return Phase::Ready;
        };
        if !remaining.is_zero() {
            return Phase::Ready;
        }
        if pending > 0 {
            self.error = Some(Error::Timeout);
            self.os_error = 0;
            self.set_state_failed();
            return Phase::Error;
        }
        if self.conn.state == ClientState::Connected {
            debug!("keep-alive expired, queueing PINGREQ");
            let _ = self
                .stores
                .main
                .append(Kind::PingReq, None, Value::None, now);
        }
        Phase::Ready
    }

    /// Pump encode→write until neither side can advance.
    fn process_output(&mut self) -> Phase {
        if self.error.is_some() {
            return Phase::Error;
        }
        let mut enc_avail = true;
        let mut wr_avail = true;
        let mut stale = true;
        let mut enc_blocked = false;
        let mut eof = false;

        while enc_avail || wr_avail {
            enc_avail = enc_avail && self.write_pos < self.write_buf.len();
            if enc_avail {
                let store = self.stores.current_mut();
                let (status, n) = self.tx.encode(
                    store,
                    &mut self.transport,
                    &mut self.handler,
                    &mut self.write_buf[self.write_pos..],
                );
                self.write_pos += n;
                match status {
                    CodecStatus::Ok => {
                        enc_blocked = false;
                        enc_avail = n > 0;
                        if n > 0 {
                            stale = false;
                        } else {
                            eof = true;
                        }
                    }
                    CodecStatus::WouldBlock => {
                        enc_blocked = true;
                        enc_avail = false;
                    }
                    CodecStatus::Error => {
                        self.error = self.tx.error;
                        self.os_error = self.tx.os_error;
                        self.set_state_failed();
                        return Phase::Error;
                    }
                }
            }

            wr_avail = wr_avail && self.write_pos > 0;
            if wr_avail {
                match self.transport.write(&self.write_buf[..self.write_pos]) {
                    IoResult::Success(n) => {
                        self.write_buf.copy_within(n..self.write_pos, 0);
                        self.write_pos -= n;
                        wr_avail = n > 0;
                        if n > 0 {
                            stale = false;
                        } else {
                            eof = true;
                        }
                    }
                    IoResult::WouldBlock => {
                        wr_avail = false;
                    }
                    IoResult::Error(os_error) => {
                        self.error = Some(Error::ConnectionWrite);
                        self.os_error = os_error;
                        self.set_state_failed();
                        return Phase::Error;
                    }
                }
            }
        }

        if !stale {
            let now = self.transport.now();
            self.stores.current_mut().touch(now);
        }
        if eof {
            self.set_state_initial();
            return Phase::Ready;
        }
        if enc_blocked && self.write_pos == 0 {
            Phase::BlockData
        } else {
            Phase::BlockConn
        }
    }

    /// Pump read→decode until neither side can advance.
    fn process_input(&mut self) -> Phase {
        if self.error.is_some() {
            return Phase::Error;
        }
        let mut rd_avail = true;
        let mut dec_avail = true;
        let mut stale = true;
        let mut rd_blocked = false;
        let mut eof = false;
        let now = self.transport.now();

        while rd_avail || dec_avail {
            rd_avail = rd_avail && self.read_pos < self.read_buf.len();
            if rd_avail {
                match self.transport.read(&mut self.read_buf[self.read_pos..]) {
                    IoResult::Success(n) => {
                        self.read_pos += n;
                        rd_avail = n > 0;
                        if n > 0 {
                            stale = false;
                        } else {
                            eof = true;
                        }
                    }
                    IoResult::WouldBlock => {
                        rd_blocked = true;
                        rd_avail = false;
                    }
                    IoResult::Error(os_error) => {
                        self.error = Some(Error::ConnectionRead);
                        self.os_error = os_error;
                        self.set_state_failed();
                        return Phase::Error;
                    }
                }
            }

            dec_avail = dec_avail && self.read_pos > 0;
            if dec_avail {
                let mut ctx = DecodeCtx {
                    stores: &mut self.stores,
                    id_set: &mut self.id_set,
                    handler: &mut self.handler,
                    conn: &mut self.conn,
                    now,
                };
                let (status, n) = self.rx.decode(&mut ctx, &self.read_buf[..self.read_pos]);
                match status {
                    CodecStatus::Ok => {
                        self.read_buf.copy_within(n..self.read_pos, 0);
                        self.read_pos -= n;
                        dec_avail = n > 0;
                        if n > 0 {
                            stale = false;
                        }
                    }
                    CodecStatus::WouldBlock => {
                        dec_avail = false;
                    }
                    CodecStatus::Error => {
                        self.error = self.rx.error;
                        self.os_error = self.rx.os_error;
                        self.set_state_failed();
                        return Phase::Error;
                    }
                }
            }
        }

        if !stale {
            let now = self.transport.now();
            self.stores.current_mut().touch(now);
        }
        if eof {
            self.set_state_initial();
            return Phase::Ready;
        }
        if rd_blocked && self.read_pos == 0 {
            Phase::BlockConn
        } else {
            Phase::BlockData
        }
    }
}
