//! Hierarchical send/receive flow control.
//!
//! Every stream has its own controller; stream 0 is the connection
//! pseudo-stream holding the aggregate counters. Streams marked as
//! contributing mirror their progress into stream 0, so the connection
//! counters always equal the sum over contributing streams.

use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::Mutex;

use transport_parameters::ConnectionParameters;
use {ByteCount, StreamId};

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum FlowControlError {
    #[fail(display = "Error accessing the flowController map.")]
    MapAccess,
    #[fail(display = "stream-level flow control violation")]
    StreamFlowControlViolation,
    #[fail(display = "connection-level flow control violation")]
    ConnectionFlowControlViolation,
}

#[derive(Debug)]
struct FlowController {
    stream_id: StreamId,
    /// Peer-advertised send limit; 0 until the first window update, with the
    /// negotiated default applying in the meantime.
    send_flow_control_window: ByteCount,
    /// Absolute receive limit we last advertised.
    receive_flow_control_window: ByteCount,
    /// Size of the receive window; each update advances the limit by this.
    receive_flow_control_window_increment: ByteCount,
    bytes_sent: ByteCount,
    bytes_read: ByteCount,
    highest_received: ByteCount,
}

impl FlowController {
    fn new(stream_id: StreamId, params: &ConnectionParameters) -> FlowController {
        let window = if stream_id.is_connection_stream() {
            params.receive_connection_flow_control_window()
        } else {
            params.receive_stream_flow_control_window()
        };
        FlowController {
            stream_id,
            send_flow_control_window: 0,
            receive_flow_control_window: window,
            receive_flow_control_window_increment: window,
            bytes_sent: 0,
            bytes_read: 0,
            highest_received: 0,
        }
    }

    fn send_window(&self, params: &ConnectionParameters) -> ByteCount {
        if self.send_flow_control_window != 0 {
            return self.send_flow_control_window;
        }
        if self.stream_id.is_connection_stream() {
            params.send_connection_flow_control_window()
        } else {
            params.send_stream_flow_control_window()
        }
    }

    fn send_window_size(&self, params: &ConnectionParameters) -> ByteCount {
        self.send_window(params).saturating_sub(self.bytes_sent)
    }

    fn update_send_window(&mut self, offset: ByteCount) -> bool {
        if offset > self.send_flow_control_window {
            self.send_flow_control_window = offset;
            return true;
        }
        false
    }

    /// Raises `highest_received`, returning the increment (0 for reordered
    /// or duplicate offsets).
    fn update_highest_received(&mut self, offset: ByteCount) -> ByteCount {
        if offset > self.highest_received {
            let increment = offset - self.highest_received;
            self.highest_received = offset;
            return increment;
        }
        0
    }

    fn violates_receive_window(&self) -> bool {
        self.highest_received > self.receive_flow_control_window
    }

    /// Advertises a new limit once the reader has consumed more than half a
    /// window past the last one. Self-arming: the limit advances here.
    fn maybe_trigger_window_update(&mut self) -> Option<ByteCount> {
        let diff = self
            .receive_flow_control_window
            .saturating_sub(self.bytes_read);
        if diff < self.receive_flow_control_window_increment / 2 {
            self.receive_flow_control_window =
                self.bytes_read + self.receive_flow_control_window_increment;
            return Some(self.receive_flow_control_window);
        }
        None
    }
}

#[derive(Debug)]
pub struct FlowControlManager {
    params: Arc<ConnectionParameters>,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    controllers: FnvHashMap<StreamId, FlowController>,
    contributes_to_connection: FnvHashMap<StreamId, bool>,
}

impl FlowControlManager {
    pub fn new(params: Arc<ConnectionParameters>) -> FlowControlManager {
        let mut controllers = FnvHashMap::default();
        controllers.insert(StreamId(0), FlowController::new(StreamId(0), &params));
        let mut contributes = FnvHashMap::default();
        contributes.insert(StreamId(0), false);
        FlowControlManager {
            params,
            inner: Mutex::new(Inner {
                controllers,
                contributes_to_connection: contributes,
            }),
        }
    }

    /// Registers a stream. Ids already present keep their state.
    pub fn new_stream(&self, id: StreamId, contributes_to_connection: bool) {
        let mut inner = self.inner.lock();
        if inner.controllers.contains_key(&id) {
            return;
        }
        inner
            .controllers
            .insert(id, FlowController::new(id, &self.params));
        inner
            .contributes_to_connection
            .insert(id, contributes_to_connection);
    }

    /// Drops a stream's controller; unknown ids are a no-op. The connection
    /// pseudo-stream is permanent.
    pub fn remove_stream(&self, id: StreamId) {
        if id.is_connection_stream() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.controllers.remove(&id);
        inner.contributes_to_connection.remove(&id);
    }

    /// Records the highest byte offset the peer has sent on `id`, enforcing
    /// both the stream's and (for contributing streams) the connection's
    /// receive window.
    pub fn update_highest_received(
        &self,
        id: StreamId,
        offset: ByteCount,
    ) -> Result<(), FlowControlError> {
        let mut inner = self.inner.lock();
        let contributes = inner.contributes(id)?;
        let increment = {
            let ctrl = inner
                .controllers
                .get_mut(&id)
                .ok_or(FlowControlError::MapAccess)?;
            let increment = ctrl.update_highest_received(offset);
            if ctrl.violates_receive_window() {
                return Err(FlowControlError::StreamFlowControlViolation);
            }
            increment
        };
        if contributes {
            let conn = inner.connection_controller();
            conn.highest_received += increment;
            if conn.violates_receive_window() {
                return Err(FlowControlError::ConnectionFlowControlViolation);
            }
        }
        Ok(())
    }

    /// Accumulates bytes delivered to the application.
    pub fn add_bytes_read(&self, id: StreamId, n: ByteCount) -> Result<(), FlowControlError> {
        let mut inner = self.inner.lock();
        let contributes = inner.contributes(id)?;
        inner
            .controllers
            .get_mut(&id)
            .ok_or(FlowControlError::MapAccess)?
            .bytes_read += n;
        if contributes {
            inner.connection_controller().bytes_read += n;
        }
        Ok(())
    }

    /// Accumulates bytes handed to the packer.
    pub fn add_bytes_sent(&self, id: StreamId, n: ByteCount) -> Result<(), FlowControlError> {
        let mut inner = self.inner.lock();
        let contributes = inner.contributes(id)?;
        inner
            .controllers
            .get_mut(&id)
            .ok_or(FlowControlError::MapAccess)?
            .bytes_sent += n;
        if contributes {
            inner.connection_controller().bytes_sent += n;
        }
        Ok(())
    }

    /// Remaining send allowance: the stream's own window, capped by the
    /// connection window for contributing streams.
    pub fn send_window_size(&self, id: StreamId) -> Result<ByteCount, FlowControlError> {
        let inner = self.inner.lock();
        let contributes = inner.contributes(id)?;
        let stream_size = inner
            .controllers
            .get(&id)
            .ok_or(FlowControlError::MapAccess)?
            .send_window_size(&self.params);
        if contributes && !id.is_connection_stream() {
            let conn = inner.controllers[&StreamId(0)].send_window_size(&self.params);
            return Ok(stream_size.min(conn));
        }
        Ok(stream_size)
    }

    pub fn remaining_connection_window_size(&self) -> ByteCount {
        let inner = self.inner.lock();
        inner.controllers[&StreamId(0)].send_window_size(&self.params)
    }

    /// Applies a peer window update. Idempotent; only ever increases the
    /// limit. Returns whether anything changed.
    pub fn update_window(&self, id: StreamId, offset: ByteCount) -> Result<bool, FlowControlError> {
        let mut inner = self.inner.lock();
        Ok(inner
            .controllers
            .get_mut(&id)
            .ok_or(FlowControlError::MapAccess)?
            .update_send_window(offset))
    }

    /// Whether the reader of `id` has consumed deep enough into the window
    /// that a new limit should be advertised; returns that limit.
    pub fn maybe_trigger_stream_window_update(
        &self,
        id: StreamId,
    ) -> Result<Option<ByteCount>, FlowControlError> {
        let mut inner = self.inner.lock();
        inner
            .controllers
            .get_mut(&id)
            .ok_or(FlowControlError::MapAccess)
            .map(FlowController::maybe_trigger_window_update)
    }

    pub fn maybe_trigger_connection_window_update(&self) -> Option<ByteCount> {
        let mut inner = self.inner.lock();
        inner.connection_controller().maybe_trigger_window_update()
    }
}

impl Inner {
    fn contributes(&self, id: StreamId) -> Result<bool, FlowControlError> {
        self.contributes_to_connection
            .get(&id)
            .cloned()
            .ok_or(FlowControlError::MapAccess)
    }

    fn connection_controller(&mut self) -> &mut FlowController {
        self.controllers
            .get_mut(&StreamId(0))
            .expect("connection flow controller must exist")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FlowControlManager {
        let params = ConnectionParameters::new();
        params.set_receive_windows(0x100, 0x200);
        FlowControlManager::new(params)
    }

    #[test]
    fn creates_a_connection_level_controller() {
        let fcm = manager();
        let inner = fcm.inner.lock();
        assert!(inner.controllers.contains_key(&StreamId(0)));
        assert!(inner.contributes_to_connection.contains_key(&StreamId(0)));
    }

    #[test]
    fn creates_and_removes_streams() {
        let fcm = manager();
        fcm.new_stream(StreamId(5), true);
        {
            let inner = fcm.inner.lock();
            assert!(inner.controllers.contains_key(&StreamId(5)));
            assert_eq!(inner.contributes_to_connection[&StreamId(5)], true);
        }
        fcm.remove_stream(StreamId(5));
        let inner = fcm.inner.lock();
        assert!(!inner.controllers.contains_key(&StreamId(5)));
        assert!(!inner.contributes_to_connection.contains_key(&StreamId(5)));
    }

    #[test]
    fn updates_connection_level_controller_for_contributing_streams() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.update_highest_received(StreamId(4), 0x100).unwrap();
        let inner = fcm.inner.lock();
        assert_eq!(inner.controllers[&StreamId(0)].highest_received, 0x100);
        assert_eq!(inner.controllers[&StreamId(4)].highest_received, 0x100);
    }

    #[test]
    fn adds_offsets_of_multiple_streams() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.new_stream(StreamId(6), true);
        fcm.update_highest_received(StreamId(4), 0x100).unwrap();
        fcm.update_highest_received(StreamId(6), 0x50).unwrap();
        let inner = fcm.inner.lock();
        assert_eq!(inner.controllers[&StreamId(0)].highest_received, 0x150);
    }

    #[test]
    fn skips_connection_level_for_non_contributing_streams() {
        let fcm = manager();
        fcm.new_stream(StreamId(1), false);
        fcm.update_highest_received(StreamId(1), 0x100).unwrap();
        let inner = fcm.inner.lock();
        assert_eq!(inner.controllers[&StreamId(0)].highest_received, 0);
        assert_eq!(inner.controllers[&StreamId(1)].highest_received, 0x100);
    }

    #[test]
    fn errors_on_unknown_streams() {
        let fcm = manager();
        assert_matches!(
            fcm.update_highest_received(StreamId(1337), 0x1337),
            Err(FlowControlError::MapAccess)
        );
        assert_matches!(
            fcm.send_window_size(StreamId(1337)),
            Err(FlowControlError::MapAccess)
        );
    }

    #[test]
    fn reordered_offsets_do_not_rewind() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.update_highest_received(StreamId(4), 0x100).unwrap();
        fcm.update_highest_received(StreamId(4), 0x50).unwrap();
        let inner = fcm.inner.lock();
        assert_eq!(inner.controllers[&StreamId(4)].highest_received, 0x100);
        assert_eq!(inner.controllers[&StreamId(0)].highest_received, 0x100);
    }

    #[test]
    fn detects_stream_level_violations() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        assert_matches!(
            fcm.update_highest_received(StreamId(4), 0x101),
            Err(FlowControlError::StreamFlowControlViolation)
        );
    }

    #[test]
    fn detects_connection_level_violations() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.inner
            .lock()
            .controllers
            .get_mut(&StreamId(4))
            .unwrap()
            .receive_flow_control_window = 0x300;
        assert_matches!(
            fcm.update_highest_received(StreamId(4), 0x201),
            Err(FlowControlError::ConnectionFlowControlViolation)
        );
    }

    #[test]
    fn triggers_stream_window_updates() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.update_highest_received(StreamId(4), 0x100).unwrap();
        fcm.add_bytes_read(StreamId(4), 0x100 - 0x10).unwrap();
        let offset = fcm
            .maybe_trigger_stream_window_update(StreamId(4))
            .unwrap()
            .expect("window update must fire");
        assert_eq!(offset, 0xf0 + 0x100);
        // self-arming: no second trigger until more bytes are read
        assert_eq!(
            fcm.maybe_trigger_stream_window_update(StreamId(4)).unwrap(),
            None
        );
    }

    #[test]
    fn triggers_connection_window_updates() {
        let fcm = manager();
        fcm.new_stream(StreamId(4), true);
        fcm.new_stream(StreamId(6), true);
        fcm.update_highest_received(StreamId(4), 0x100).unwrap();
        fcm.update_highest_received(StreamId(6), 0x100).unwrap();
        fcm.add_bytes_read(StreamId(4), 0x100 - 0x10).unwrap();
        fcm.add_bytes_read(StreamId(6), 0x100 - 0x10).unwrap();
        let offset = fcm
            .maybe_trigger_connection_window_update()
            .expect("window update must fire");
        assert_eq!(offset, 2 * (0x100 - 0x10) + 0x200);
    }

    #[test]
    fn accumulates_bytes_sent_for_contributing_streams() {
        let fcm = manager();
        fcm.new_stream(StreamId(1), false);
        fcm.new_stream(StreamId(3), true);
        fcm.new_stream(StreamId(5), true);
        fcm.add_bytes_sent(StreamId(1), 0x100).unwrap();
        fcm.add_bytes_sent(StreamId(3), 0x200).unwrap();
        fcm.add_bytes_sent(StreamId(5), 0x500).unwrap();
        let inner = fcm.inner.lock();
        assert_eq!(inner.controllers[&StreamId(0)].bytes_sent, 0x700);
    }

    #[test]
    fn updates_send_windows() {
        let fcm = manager();
        fcm.new_stream(StreamId(5), true);
        assert_eq!(fcm.update_window(StreamId(5), 0x1000).unwrap(), true);
        assert_eq!(fcm.update_window(StreamId(5), 0x1000).unwrap(), false);
        assert_eq!(fcm.update_window(StreamId(0), 0x1000).unwrap(), true);
    }

    #[test]
    fn computes_stream_send_window_size() {
        let fcm = manager();
        fcm.new_stream(StreamId(5), false);
        fcm.update_window(StreamId(5), 0x1000).unwrap();
        fcm.add_bytes_sent(StreamId(5), 0x500).unwrap();
        assert_eq!(fcm.send_window_size(StreamId(5)).unwrap(), 0x1000 - 0x500);
    }

    #[test]
    fn computes_connection_send_window_size() {
        let fcm = manager();
        fcm.new_stream(StreamId(5), true);
        fcm.update_window(StreamId(0), 0x1000).unwrap();
        fcm.add_bytes_sent(StreamId(5), 0x500).unwrap();
        assert_eq!(fcm.remaining_connection_window_size(), 0x1000 - 0x500);
    }

    #[test]
    fn limits_stream_window_by_connection_window() {
        let fcm = manager();
        fcm.new_stream(StreamId(5), true);
        fcm.update_window(StreamId(0), 0x500).unwrap();
        fcm.update_window(StreamId(5), 0x1000).unwrap();
        assert_eq!(fcm.send_window_size(StreamId(5)).unwrap(), 0x500);
    }

    #[test]
    fn non_contributing_streams_leave_the_connection_window_alone() {
        let fcm = manager();
        fcm.new_stream(StreamId(3), false);
        fcm.update_window(StreamId(0), 0x1000).unwrap();
        fcm.add_bytes_sent(StreamId(3), 0x456).unwrap();
        assert_eq!(fcm.remaining_connection_window_size(), 0x1000);
    }
}
