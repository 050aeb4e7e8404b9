//! Core state machine for a QUIC endpoint: the per-connection [`Session`]
//! that multiplexes application byte streams over an unreliable datagram
//! transport, the hierarchical flow control that bounds its memory, and the
//! tagged-message codec used by the cryptographic handshake.
//!
//! This crate performs no I/O of its own. Packets enter through
//! [`Session::handle_packet`] and leave through the [`Connection`] egress
//! trait; cryptographic primitives and the UDP 4-tuple demultiplexer are
//! external collaborators behind the seams in [`crypto`] and [`session`].
//!
//! [`Session`]: session/struct.Session.html
//! [`Session::handle_packet`]: session/struct.Session.html#method.handle_packet
//! [`Connection`]: session/trait.Connection.html
//! [`crypto`]: crypto/index.html
//! [`session`]: session/index.html

extern crate byteorder;
extern crate bytes;
#[macro_use]
extern crate crossbeam_channel;
#[macro_use]
extern crate failure;
extern crate fnv;
#[macro_use]
extern crate lazy_static;
extern crate parking_lot;
extern crate rand;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

pub mod ack_handler;
pub mod buffer_pool;
mod coding;
pub mod crypto;
pub mod flow_control;
pub mod frame;
pub mod handshake;
pub mod packet;
pub mod qerr;
pub mod session;
pub mod stream;
pub mod transport_parameters;

use std::fmt;

pub use qerr::{ErrorCode, QuicError, StreamError};
pub use session::{Connection, Session};
pub use stream::Stream;

/// Number of bytes transferred, queued or windowed.
pub type ByteCount = u64;

/// Monotonically increasing per-connection packet sequence number.
pub type PacketNumber = u64;

/// Connection identifier chosen by the client and echoed in every public
/// header.
pub type ConnectionId = u64;

/// A negotiated wire version.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Version(pub u32);

pub const VERSION_33: Version = Version(33);
pub const VERSION_34: Version = Version(34);

/// Stream identifier. The low bit encodes the initiator: on the server side,
/// odd ids belong to the peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// The connection-scope pseudo-stream carrying aggregate flow control
    /// counters. It never appears in the stream table.
    pub fn is_connection_stream(self) -> bool {
        self.0 == 0
    }

    /// The stream feeding the cryptographic handshake.
    pub fn is_crypto_stream(self) -> bool {
        self.0 == 1
    }

    /// Whether the peer of a server session may open this stream.
    pub fn initiated_by_peer(self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Largest UDP payload we will produce or accept.
pub const MAX_PACKET_SIZE: usize = 1452;

/// Advertised soft limit on concurrently open streams.
pub const MAX_STREAMS_PER_CONNECTION: usize = 100;

/// Hard cap on live stream table entries; peers get 10% slack over the
/// advertised limit before the session is torn down.
pub const MAX_OPEN_STREAMS: usize = MAX_STREAMS_PER_CONNECTION + MAX_STREAMS_PER_CONNECTION / 10;

/// Bound on the inbound packet channel. Packets beyond it are dropped so the
/// socket reader is never blocked by a slow session.
pub const MAX_SESSION_UNPROCESSED_PACKETS: usize = 128;

/// How many packets we stash while waiting for forward-secure keys before
/// giving up with a public reset.
pub const MAX_UNDECRYPTABLE_PACKETS: usize = 10;

/// Bound on unacknowledged sent packets retained for retransmission.
pub const MAX_TRACKED_SENT_PACKETS: usize = 2000;

/// Maximum entry count accepted in a handshake message.
pub const CRYPTO_MAX_PARAMS: usize = 128;

/// Maximum length of a single handshake message value.
pub const CRYPTO_PARAMETER_MAX_LENGTH: usize = 4000;

/// Per-stream receive window we advertise.
pub const RECEIVE_STREAM_FLOW_CONTROL_WINDOW: ByteCount = 0x4000;

/// Connection-aggregate receive window we advertise.
pub const RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW: ByteCount = 0x1_0000;

/// Per-stream send allowance assumed until the peer's CHLO negotiates SFCW.
pub const INITIAL_STREAM_FLOW_CONTROL_WINDOW: ByteCount = 0x4000;

/// Connection send allowance assumed until the peer's CHLO negotiates CFCW.
pub const INITIAL_CONNECTION_FLOW_CONTROL_WINDOW: ByteCount = 0x1_0000;

/// Each window update rides in this many consecutive packets.
pub const WINDOW_UPDATE_NUM_REPETITIONS: usize = 2;

/// Idle timeout assumed until the peer's CHLO negotiates ICSL (seconds).
pub const INITIAL_IDLE_CONNECTION_STATE_LIFETIME_SECS: u64 = 30;
