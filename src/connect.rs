use bytes::Bytes;

use crate::{Error, QoS, StringView};

/// Protocol name and level bytes of the CONNECT variable header.
pub(crate) const PROTOCOL_HEADER: [u8; 7] = [0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04];

pub(crate) const FLAG_CLEAN_SESSION: u8 = 0x02;
pub(crate) const FLAG_WILL: u8 = 0x04;
pub(crate) const FLAG_WILL_RETAIN: u8 = 0x20;
pub(crate) const FLAG_PASSWORD: u8 = 0x40;
pub(crate) const FLAG_USER_NAME: u8 = 0x80;

/// Connect request.
///
/// Built by the host, queued with [`Client::connect`](crate::Client::connect)
/// and handed back through [`EventHandler::on_connect`](crate::EventHandler::on_connect)
/// once the CONNACK arrives, with [`Connect::response`] filled in.
#[derive(Debug, Default)]
pub struct Connect {
    pub keep_alive: u16,
    pub clean_session: bool,
    pub client_id: StringView,
    pub last_will: Option<LastWill>,
    pub user_name: StringView,
    pub password: StringView,
    /// Upgrade parameters, required when the client runs in WebSocket mode.
    pub websocket: Option<WebsocketParams>,
    /// Filled from the CONNACK body before `on_connect` fires.
    pub response: ConnackResponse,
}

impl Connect {
    pub fn new(client_id: impl Into<StringView>, keep_alive: u16) -> Self {
        Connect {
            keep_alive,
            clean_session: true,
            client_id: client_id.into(),
            ..Connect::default()
        }
    }

    /// Check the invariants the wire format cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        let fields = [
            &self.client_id,
            &self.user_name,
            &self.password,
        ];
        for field in fields {
            if !field.fits_field() || !field.is_source() {
                return Err(Error::InvalidPacket);
            }
        }
        if let Some(will) = &self.last_will {
            if !will.topic.fits_field() || !will.message.fits_field() {
                return Err(Error::InvalidPacket);
            }
            if !will.topic.is_source() || !will.message.is_source() {
                return Err(Error::InvalidPacket);
            }
            if will.topic.is_empty() || will.message.is_empty() {
                return Err(Error::InvalidPacket);
            }
            if !will.topic.is_valid_utf8() {
                return Err(Error::InvalidPacket);
            }
        }
        if self.client_id.is_empty() && !self.clean_session {
            return Err(Error::InvalidPacket);
        }
        if self.user_name.is_empty() && !self.password.is_empty() {
            return Err(Error::InvalidPacket);
        }
        if !self.client_id.is_valid_utf8() {
            return Err(Error::InvalidPacket);
        }
        Ok(())
    }

    pub(crate) fn connect_flags(&self) -> u8 {
        let mut flags = 0;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(will) = &self.last_will {
            flags |= FLAG_WILL;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if !self.user_name.is_empty() {
            flags |= FLAG_USER_NAME;
        }
        if !self.password.is_empty() {
            flags |= FLAG_PASSWORD;
        }
        flags
    }

    pub(crate) fn remaining_length(&self) -> usize {
        let will_len = self
            .last_will
            .as_ref()
            .map_or(0, |w| w.topic.field_len() + w.message.field_len());
        // client id is always present in the payload
        PROTOCOL_HEADER.len() + 1 + 2 + 2
            + self.client_id.len()
            + will_len
            + self.user_name.field_len()
            + self.password.field_len()
    }
}

/// Message the server publishes on the client's behalf when the connection
/// drops uncleanly. [MQTT 3.1.3.3].
///
/// [MQTT 3.1.3.3]: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718031
#[derive(Debug, Default)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: StringView,
    pub message: StringView,
}

/// WebSocket upgrade parameters carried by a [`Connect`] in WebSocket mode.
///
/// `key_response` is the expected `Sec-WebSocket-Accept` value; computing it
/// (SHA-1 over key and GUID, base64) is the host's job, the engine only
/// compares bytes.
#[derive(Debug, Default, Clone)]
pub struct WebsocketParams {
    pub addr: Bytes,
    pub key: Bytes,
    pub key_response: Bytes,
}

/// CONNACK body, written into the pending [`Connect`] by the decoder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnackResponse {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

/// Return code of a CONNACK packet.
///
/// See [MQTT 3.2.2.3] for interpretations.
///
/// [MQTT 3.2.2.3]: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718035
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectReturnCode {
    #[default]
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_u8(byte: u8) -> Result<ConnectReturnCode, Error> {
        match byte {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(Error::DecodeConnackInvalidReturnCode),
        }
    }
}
