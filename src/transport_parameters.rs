//! Connection parameters negotiated during the handshake.
//!
//! Values start from protocol defaults and are overwritten by the peer's
//! CHLO; the session and flow controllers read them on every decision, so the
//! table is shared and internally locked.

use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use fnv::FnvHashMap;
use parking_lot::RwLock;

use coding;
use handshake::{tags, Tag};
use qerr::{ErrorCode, QuicError};
use {
    ByteCount, INITIAL_CONNECTION_FLOW_CONTROL_WINDOW, INITIAL_IDLE_CONNECTION_STATE_LIFETIME_SECS,
    INITIAL_STREAM_FLOW_CONTROL_WINDOW, MAX_STREAMS_PER_CONNECTION,
    RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW, RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
};

#[derive(Debug)]
pub struct ConnectionParameters {
    inner: RwLock<Params>,
}

#[derive(Debug)]
struct Params {
    /// Bytes the peer lets us send on any one stream (SFCW).
    send_stream_flow_control_window: ByteCount,
    /// Bytes the peer lets us send across the connection (CFCW).
    send_connection_flow_control_window: ByteCount,
    /// Bytes we let the peer send on any one stream.
    receive_stream_flow_control_window: ByteCount,
    /// Bytes we let the peer send across the connection.
    receive_connection_flow_control_window: ByteCount,
    /// Soft limit on concurrently open streams (MSPC).
    max_streams_per_connection: u32,
    /// Idle connection state lifetime (ICSL).
    idle_connection_state_lifetime: Duration,
    /// Whether the peer asked for truncated connection ids (TCID 0).
    truncate_connection_id: bool,
}

impl ConnectionParameters {
    pub fn new() -> Arc<ConnectionParameters> {
        Arc::new(ConnectionParameters {
            inner: RwLock::new(Params {
                send_stream_flow_control_window: INITIAL_STREAM_FLOW_CONTROL_WINDOW,
                send_connection_flow_control_window: INITIAL_CONNECTION_FLOW_CONTROL_WINDOW,
                receive_stream_flow_control_window: RECEIVE_STREAM_FLOW_CONTROL_WINDOW,
                receive_connection_flow_control_window: RECEIVE_CONNECTION_FLOW_CONTROL_WINDOW,
                max_streams_per_connection: MAX_STREAMS_PER_CONNECTION as u32,
                idle_connection_state_lifetime: Duration::from_secs(
                    INITIAL_IDLE_CONNECTION_STATE_LIFETIME_SECS,
                ),
                truncate_connection_id: false,
            }),
        })
    }

    /// Ingests the parameter entries of a CHLO.
    pub fn set_from_map(&self, map: &FnvHashMap<Tag, Vec<u8>>) -> Result<(), QuicError> {
        let mut inner = self.inner.write();
        if let Some(value) = map.get(&tags::ICSL) {
            inner.idle_connection_state_lifetime =
                Duration::from_secs(u64::from(param_u32(tags::ICSL, value)?));
        }
        if let Some(value) = map.get(&tags::CFCW) {
            inner.send_connection_flow_control_window =
                ByteCount::from(param_u32(tags::CFCW, value)?);
        }
        if let Some(value) = map.get(&tags::SFCW) {
            inner.send_stream_flow_control_window = ByteCount::from(param_u32(tags::SFCW, value)?);
        }
        if let Some(value) = map.get(&tags::MSPC) {
            inner.max_streams_per_connection = param_u32(tags::MSPC, value)?;
        }
        if let Some(value) = map.get(&tags::TCID) {
            inner.truncate_connection_id = param_u32(tags::TCID, value)? == 0;
        }
        Ok(())
    }

    /// Our parameters, as sent to the peer in the SHLO.
    pub fn shlo_map(&self) -> FnvHashMap<Tag, Vec<u8>> {
        let inner = self.inner.read();
        let mut map = FnvHashMap::default();
        map.insert(
            tags::CFCW,
            u32_value(inner.receive_connection_flow_control_window as u32),
        );
        map.insert(
            tags::SFCW,
            u32_value(inner.receive_stream_flow_control_window as u32),
        );
        map.insert(tags::MSPC, u32_value(inner.max_streams_per_connection));
        map.insert(
            tags::ICSL,
            u32_value(inner.idle_connection_state_lifetime.as_secs() as u32),
        );
        map
    }

    pub fn send_stream_flow_control_window(&self) -> ByteCount {
        self.inner.read().send_stream_flow_control_window
    }

    pub fn send_connection_flow_control_window(&self) -> ByteCount {
        self.inner.read().send_connection_flow_control_window
    }

    pub fn receive_stream_flow_control_window(&self) -> ByteCount {
        self.inner.read().receive_stream_flow_control_window
    }

    pub fn receive_connection_flow_control_window(&self) -> ByteCount {
        self.inner.read().receive_connection_flow_control_window
    }

    pub fn max_streams_per_connection(&self) -> u32 {
        self.inner.read().max_streams_per_connection
    }

    pub fn idle_connection_state_lifetime(&self) -> Duration {
        self.inner.read().idle_connection_state_lifetime
    }

    pub fn truncate_connection_id(&self) -> bool {
        self.inner.read().truncate_connection_id
    }

    #[cfg(test)]
    pub fn set_receive_windows(&self, stream: ByteCount, connection: ByteCount) {
        let mut inner = self.inner.write();
        inner.receive_stream_flow_control_window = stream;
        inner.receive_connection_flow_control_window = connection;
    }
}

fn param_u32(tag: Tag, value: &[u8]) -> Result<u32, QuicError> {
    if value.len() != 4 {
        return Err(QuicError::new(
            ErrorCode::INVALID_CRYPTO_MESSAGE_PARAMETER,
            &format!("{} is not a 32-bit value", tag),
        ));
    }
    Ok(LittleEndian::read_u32(value))
}

fn u32_value(x: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    coding::write_u32(&mut buf, x);
    buf
}
