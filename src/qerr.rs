//! Errors surfaced on the wire and to applications.

use std::fmt;

/// An error code from the QUIC error namespace, as carried in
/// CONNECTION_CLOSE and RST_STREAM frames.
///
/// Only the codes this crate produces are named; any peer-supplied value can
/// be represented.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: ErrorCode = ErrorCode(0);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(1);
    pub const INVALID_FRAME_DATA: ErrorCode = ErrorCode(4);
    pub const DECRYPTION_FAILURE: ErrorCode = ErrorCode(12);
    pub const PACKET_TOO_LARGE: ErrorCode = ErrorCode(14);
    pub const PEER_GOING_AWAY: ErrorCode = ErrorCode(16);
    pub const INVALID_STREAM_ID: ErrorCode = ErrorCode(17);
    pub const TOO_MANY_OPEN_STREAMS: ErrorCode = ErrorCode(18);
    pub const PUBLIC_RESET: ErrorCode = ErrorCode(19);
    pub const NETWORK_IDLE_TIMEOUT: ErrorCode = ErrorCode(25);
    pub const PACKET_WRITE_ERROR: ErrorCode = ErrorCode(27);
    pub const HANDSHAKE_FAILED: ErrorCode = ErrorCode(28);
    pub const CRYPTO_TOO_MANY_ENTRIES: ErrorCode = ErrorCode(30);
    pub const CRYPTO_INVALID_VALUE_LENGTH: ErrorCode = ErrorCode(31);
    pub const INVALID_CRYPTO_MESSAGE_TYPE: ErrorCode = ErrorCode(33);
    pub const INVALID_CRYPTO_MESSAGE_PARAMETER: ErrorCode = ErrorCode(34);
    pub const FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA: ErrorCode = ErrorCode(59);
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            ErrorCode::NO_ERROR => "NoError",
            ErrorCode::INTERNAL_ERROR => "InternalError",
            ErrorCode::INVALID_FRAME_DATA => "InvalidFrameData",
            ErrorCode::DECRYPTION_FAILURE => "DecryptionFailure",
            ErrorCode::PACKET_TOO_LARGE => "PacketTooLarge",
            ErrorCode::PEER_GOING_AWAY => "PeerGoingAway",
            ErrorCode::INVALID_STREAM_ID => "InvalidStreamID",
            ErrorCode::TOO_MANY_OPEN_STREAMS => "TooManyOpenStreams",
            ErrorCode::PUBLIC_RESET => "PublicReset",
            ErrorCode::NETWORK_IDLE_TIMEOUT => "NetworkIdleTimeout",
            ErrorCode::PACKET_WRITE_ERROR => "PacketWriteError",
            ErrorCode::HANDSHAKE_FAILED => "HandshakeFailed",
            ErrorCode::CRYPTO_TOO_MANY_ENTRIES => "CryptoTooManyEntries",
            ErrorCode::CRYPTO_INVALID_VALUE_LENGTH => "CryptoInvalidValueLength",
            ErrorCode::INVALID_CRYPTO_MESSAGE_TYPE => "InvalidCryptoMessageType",
            ErrorCode::INVALID_CRYPTO_MESSAGE_PARAMETER => "InvalidCryptoMessageParameter",
            ErrorCode::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA => "FlowControlReceivedTooMuchData",
            ErrorCode(code) => return write!(f, "QUIC error {}", code),
        };
        f.write_str(name)
    }
}

/// A terminal connection error: an error code plus a human-readable reason,
/// exactly what a CONNECTION_CLOSE frame carries.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub struct QuicError {
    pub code: ErrorCode,
    pub reason: String,
}

impl QuicError {
    pub fn new(code: ErrorCode, reason: &str) -> Self {
        QuicError {
            code,
            reason: reason.into(),
        }
    }
}

impl From<ErrorCode> for QuicError {
    fn from(code: ErrorCode) -> Self {
        QuicError {
            code,
            reason: String::new(),
        }
    }
}

impl fmt::Display for QuicError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

/// Terminal condition reported by `Stream::read` and `Stream::write`.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum StreamError {
    /// The peer abruptly terminated the stream.
    #[fail(display = "RST_STREAM received with code {}", _0)]
    Reset(u32),
    /// The session terminated and took the stream with it.
    #[fail(display = "{}", _0)]
    Session(QuicError),
}

impl StreamError {
    /// The wire-level error behind this condition, if there is one.
    pub fn quic_error(&self) -> Option<&QuicError> {
        match *self {
            StreamError::Session(ref e) => Some(e),
            StreamError::Reset(_) => None,
        }
    }
}
