//! Embeddable sans-I/O [MQTT v3.1.1] client engine.
//!
//! The engine encodes outgoing packets into its transmit buffer and decodes
//! incoming bytes from its receive buffer without performing any I/O of its
//! own. The host supplies a non-blocking [`Transport`] (read, write, a
//! monotonic clock and, in WebSocket mode, frame-mask entropy) plus an
//! [`EventHandler`] for completions and incoming messages, then drives the
//! whole thing by calling [`Client::run_once`] whenever its event loop
//! wants to — each tick advances as far as the transport permits and
//! reports precisely why it stopped.
//!
//! Nothing allocates after [`Client::new`]: the buffers, the bounded packet
//! store and the QoS 2 id set are all sized once by [`ClientConfig`], which
//! makes the engine usable from event-loop frameworks and small targets
//! alike.
//!
//! ```no_run
//! use mqtt_sansio::{Client, ClientConfig, Connect, RunStatus};
//! # use mqtt_sansio::{IoResult, Transport};
//! # use core::time::Duration;
//! # struct Sock;
//! # impl Transport for Sock {
//! #     fn read(&mut self, _: &mut [u8]) -> IoResult { IoResult::WouldBlock }
//! #     fn write(&mut self, buf: &[u8]) -> IoResult { IoResult::Success(buf.len()) }
//! #     fn now(&mut self) -> Duration { Duration::ZERO }
//! # }
//! # struct Handler;
//! # impl mqtt_sansio::EventHandler for Handler {}
//! # let socket = Sock;
//! let mut client = Client::new(socket, Handler, ClientConfig::default());
//! client.connect(Connect::new("device-42", 60)).unwrap();
//! loop {
//!     let status = client.run_once();
//!     if status.intersects(RunStatus::EOF | RunStatus::ERROR) {
//!         break;
//!     }
//!     // wait for socket readiness or the next client.next_timeout()
//! }
//! ```
//!
//! [MQTT v3.1.1]: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

mod client;
mod connect;
mod error;
mod publish;
mod rx;
mod store;
mod subscribe;
mod tx;
mod types;
mod utils;
mod ws;

#[cfg(test)]
mod tests;

pub use client::{Client, ClientConfig, ClientState, EventHandler, RunStatus};
pub use connect::{Connect, ConnackResponse, ConnectReturnCode, LastWill, WebsocketParams};
pub use error::Error;
pub use publish::{Allocation, Message, Publish};
pub use subscribe::{Subscribe, SubscribeReturnCode, Subscription, Unsubscribe};
pub use types::{IoResult, Pid, QoS, StringRead, StringView, StringWrite, Transport};
pub use utils::{total_len, var_int_len, REMAINING_LENGTH_MAX};
