use thiserror::Error;

/// Errors raised by the codecs, the packet store and the client driver.
///
/// Every failure condition has exactly one stable code here. OS-level error
/// numbers reported by host callbacks are not folded into the variants; they
/// travel next to the error and are available through
/// [`Client::os_error`](crate::Client::os_error).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A string source failed while building an outgoing packet.
    #[error("error reading string while encoding packet")]
    EncodeString,

    /// Invalid upper nibble in the fixed header of an incoming packet.
    #[error("invalid packet type in fixed header")]
    DecodeFixedHeaderInvalidType,

    /// Invalid lower nibble in the fixed header of an incoming packet.
    #[error("invalid flags in fixed header")]
    DecodeFixedHeaderInvalidFlags,

    /// Invalid remaining length field (more than 4 bytes, or a redundant
    /// trailing zero byte).
    #[error("invalid remaining length")]
    DecodeFixedHeaderInvalidRemainingLength,

    /// A packet only a client may send (CONNECT, SUBSCRIBE etc.) arrived
    /// from the server.
    #[error("server sent a client-specific packet")]
    DecodeFixedHeaderServerSpecific,

    /// A packet without a variable header or payload (PINGRESP) has a
    /// non-zero remaining length.
    #[error("non-zero remaining length on an empty packet type")]
    DecodeNonzeroRemainingLength,

    /// A response arrived for which no request is in flight.
    #[error("no corresponding request for response")]
    DecodeNoCorrespondingRequest,

    /// Remaining length is smaller than the minimum for the packet type.
    #[error("response shorter than minimum for its type")]
    DecodeResponseTooShort,

    /// Invalid acknowledge flags in the first CONNACK byte.
    #[error("invalid CONNACK acknowledge flags")]
    DecodeConnackInvalidAcknowledgeFlags,

    /// Invalid return code in the second CONNACK byte.
    #[error("invalid CONNACK return code")]
    DecodeConnackInvalidReturnCode,

    /// CONNACK carries more than 2 bytes of remaining length.
    #[error("invalid CONNACK length")]
    DecodeConnackInvalidLength,

    /// Return code count in SUBACK does not match the original SUBSCRIBE.
    #[error("SUBACK return code count mismatch")]
    DecodeSubackCountMismatch,

    /// At least one return code in SUBACK is invalid.
    #[error("invalid SUBACK return code")]
    DecodeSubackInvalidReturnCode,

    /// Remaining length is too short for a PUBLISH packet, or the topic
    /// length is zero or inconsistent with it.
    #[error("invalid PUBLISH length")]
    DecodePublishInvalidLength,

    /// The id set has no space left for the incoming QoS 2 packet id.
    #[error("id set full while processing PUBLISH")]
    DecodePublishIdSetFull,

    /// The topic allocation hook failed.
    #[error("PUBLISH topic allocation failed")]
    DecodePublishTopicAllocateFailed,

    /// Writing the topic through the host sink failed.
    #[error("PUBLISH topic write failed")]
    DecodePublishTopicWriteFailed,

    /// The payload allocation hook failed.
    #[error("PUBLISH payload allocation failed")]
    DecodePublishPayloadAllocateFailed,

    /// Writing the payload through the host sink failed.
    #[error("PUBLISH payload write failed")]
    DecodePublishPayloadWriteFailed,

    /// The message delivery hook returned false.
    #[error("PUBLISH message callback failed")]
    DecodePublishMessageCallbackFailed,

    /// The store has no space left to answer an incoming PUBREL.
    #[error("queue full while responding to PUBREL")]
    DecodePubrelIdSetFull,

    /// The host read callback reported an error.
    #[error("connection read error")]
    ConnectionRead,

    /// The host write callback reported an error.
    #[error("connection write error")]
    ConnectionWrite,

    /// Time without any I/O exceeded the configured timeout.
    #[error("timeout")]
    Timeout,

    /// The client has been finalized.
    #[error("client closed")]
    Closed,

    /// CONNACK refused with return code 1.
    #[error("connection refused: unacceptable protocol version")]
    ConnackUnacceptableProtocolVersion,

    /// CONNACK refused with return code 2.
    #[error("connection refused: identifier rejected")]
    ConnackIdentifierRejected,

    /// CONNACK refused with return code 3.
    #[error("connection refused: server unavailable")]
    ConnackServerUnavailable,

    /// CONNACK refused with return code 4.
    #[error("connection refused: bad user name or password")]
    ConnackBadUserNameOrPassword,

    /// CONNACK refused with return code 5.
    #[error("connection refused: not authorized")]
    ConnackNotAuthorized,

    /// The connect completion hook returned false.
    #[error("CONNACK callback failed")]
    CallbackConnack,

    /// The subscribe completion hook returned false.
    #[error("SUBACK callback failed")]
    CallbackSuback,

    /// The unsubscribe completion hook returned false.
    #[error("UNSUBACK callback failed")]
    CallbackUnsuback,

    /// The publish completion hook returned false.
    #[error("PUBLISH callback failed")]
    CallbackPublish,

    /// WebSocket frame header indicates a fragmented message.
    #[error("fragmented websocket frame")]
    DecodeWsHeaderNoFinalBit,

    /// WebSocket frame header carries an invalid or reserved opcode.
    #[error("invalid websocket frame type")]
    DecodeWsHeaderInvalidType,

    /// A server frame has the masked bit set.
    #[error("server sent a masked websocket frame")]
    DecodeWsHeaderServerMasked,

    /// A server frame announces a payload larger than addressable memory.
    #[error("websocket frame too large")]
    DecodeWsHeaderSizeTooBig,

    /// A websocket control frame this client does not handle (ping/pong).
    #[error("unsupported websocket frame type")]
    WsUnsupportedFrameType,

    /// The server sent a websocket close frame.
    #[error("websocket connection closed by server")]
    WsClosedByServer,

    /// The Sec-WebSocket-Accept value does not match the expected key.
    #[error("websocket handshake key mismatch")]
    WsHandshakeInvalidResponseKey,

    /// A handshake response line does not fit the line buffer.
    #[error("websocket handshake line too long")]
    WsHandshakeLineTooLong,

    /// The handshake response ended before all required lines were seen.
    #[error("incomplete websocket handshake reply")]
    WsHandshakeIncompleteReply,

    /// A request failed validation before being queued.
    #[error("invalid packet")]
    InvalidPacket,

    /// The store has no room for another outgoing packet.
    #[error("queue full")]
    QueueFull,

    /// The operation is not permitted in the current client state.
    #[error("operation not permitted in current state")]
    NotPermitted,
}

impl Error {
    /// The refusal code carried by a CONNACK, if this is a refusal error.
    pub fn connack_return_code(&self) -> Option<u8> {
        match self {
            Error::ConnackUnacceptableProtocolVersion => Some(1),
            Error::ConnackIdentifierRejected => Some(2),
            Error::ConnackServerUnavailable => Some(3),
            Error::ConnackBadUserNameOrPassword => Some(4),
            Error::ConnackNotAuthorized => Some(5),
            _ => None,
        }
    }

    pub(crate) fn from_connack_refusal(code: u8) -> Error {
        match code {
            1 => Error::ConnackUnacceptableProtocolVersion,
            2 => Error::ConnackIdentifierRejected,
            3 => Error::ConnackServerUnavailable,
            4 => Error::ConnackBadUserNameOrPassword,
            _ => Error::ConnackNotAuthorized,
        }
    }
}
