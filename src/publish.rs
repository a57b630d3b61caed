use crate::utils::REMAINING_LENGTH_MAX;
use crate::{Error, Pid, QoS, StringView};

/// Outgoing application message.
///
/// Queued with [`Client::publish`](crate::Client::publish); for QoS ≥ 1 it
/// stays in the store until the matching acknowledgement and is then handed
/// back through [`EventHandler::on_publish`](crate::EventHandler::on_publish).
#[derive(Debug, Default)]
pub struct Publish {
    pub topic: StringView,
    pub payload: StringView,
    pub qos: QoS,
    pub retain: bool,
    /// How many times the packet has been fully encoded; any retransmission
    /// sets the DUP flag on the wire.
    pub(crate) encode_count: u32,
}

impl Publish {
    pub fn new(topic: impl Into<StringView>, payload: impl Into<StringView>) -> Self {
        Publish {
            topic: topic.into(),
            payload: payload.into(),
            ..Publish::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.topic.fits_field()
            || !self.topic.is_source()
            || !self.payload.is_source()
            || self.topic.is_empty()
            || !self.topic.is_valid_utf8()
        {
            return Err(Error::InvalidPacket);
        }
        if self.remaining_length() > REMAINING_LENGTH_MAX {
            return Err(Error::InvalidPacket);
        }
        Ok(())
    }

    pub(crate) fn remaining_length(&self) -> usize {
        let pid_len = if self.qos == QoS::Level0 { 0 } else { 2 };
        2 + self.topic.len() + pid_len + self.payload.len()
    }

    pub(crate) fn dup(&self) -> bool {
        self.encode_count > 0
    }
}

/// What the host wants done with an incoming topic or payload.
#[derive(Debug)]
pub enum Allocation {
    /// Stream the bytes into this view (`Sink` or `Writer` form).
    Into(StringView),
    /// Consume and discard the whole message silently.
    Ignore,
    /// Abort the decode with an allocation error.
    Fail,
}

/// Incoming application message, assembled by the decoder.
///
/// `topic` and `payload` hold whatever views the host's allocation hooks
/// returned; the host may take them back in
/// [`EventHandler::on_message`](crate::EventHandler::on_message) or
/// [`EventHandler::release_message`](crate::EventHandler::release_message).
#[derive(Debug, Default)]
pub struct Message {
    pub qos: QoS,
    pub retain: bool,
    /// Present for QoS ≥ 1 deliveries.
    pub packet_id: Option<Pid>,
    pub topic: Option<StringView>,
    pub payload: Option<StringView>,
}
