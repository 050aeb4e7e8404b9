//! The ordered, reliable byte channel multiplexed on a session.
//!
//! `read` and `write` are called from arbitrary application threads and
//! block on condition variables; the session's packer drains the write side
//! through `get_data_for_writing` and feeds the read side through
//! `add_frame`. A stream never talks to the session directly — it only pokes
//! the coalescing send-scheduling channel.

use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use flow_control::FlowControlManager;
use frame::StreamFrame;
use qerr::{QuicError, StreamError};
use {ByteCount, StreamId, MAX_PACKET_SIZE};

#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    flow_control: Arc<FlowControlManager>,
    scheduler: Sender<()>,
    state: Mutex<State>,
    readable: Condvar,
    write_drained: Condvar,
}

#[derive(Debug)]
struct State {
    /// Out-of-order receive buffer, keyed by byte offset.
    frames: BTreeMap<u64, StreamFrame>,
    read_offset: u64,
    /// Final offset, once a FIN has been seen.
    fin_offset: Option<u64>,
    /// The reader has observed end-of-stream.
    finished_reading: bool,
    /// Writer-side pending queue, in arrival order. Each blocked `write`
    /// appends one chunk.
    pending_writes: VecDeque<Bytes>,
    /// Total bytes ever appended by writers.
    enqueued_offset: u64,
    /// Total bytes handed to the packer.
    write_offset: u64,
    closed_locally: bool,
    fin_sent: bool,
    error: Option<StreamError>,
}

impl Stream {
    pub fn new(
        id: StreamId,
        flow_control: Arc<FlowControlManager>,
        scheduler: Sender<()>,
    ) -> Stream {
        Stream {
            id,
            flow_control,
            scheduler,
            state: Mutex::new(State {
                frames: BTreeMap::new(),
                read_offset: 0,
                fin_offset: None,
                finished_reading: false,
                pending_writes: VecDeque::new(),
                enqueued_offset: 0,
                write_offset: 0,
                closed_locally: false,
                fin_sent: false,
                error: None,
            }),
            readable: Condvar::new(),
            write_drained: Condvar::new(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Buffers a received frame. Duplicates whose range was already received
    /// are dropped; a FIN fixes the final offset.
    pub fn add_frame(&self, frame: StreamFrame) {
        let mut state = self.state.lock();
        let end = frame.offset + frame.data.len() as u64;
        if frame.fin {
            state.fin_offset = Some(end);
        }
        if end > state.read_offset && !frame.data.is_empty() {
            match state.frames.get(&frame.offset) {
                Some(old) if old.data.len() >= frame.data.len() => {}
                _ => {
                    state.frames.insert(frame.offset, frame);
                }
            }
        }
        drop(state);
        self.readable.notify_all();
    }

    /// Marks the final offset without data, as a peer FIN would.
    pub fn close_remote(&self, offset: ByteCount) {
        self.state.lock().fin_offset = Some(offset);
        self.readable.notify_all();
    }

    /// Delivers contiguous bytes at the read cursor, blocking until at least
    /// one byte is available. Returns `Ok(0)` at end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        let mut n = 0;
        loop {
            if let Some(ref e) = state.error {
                return Err(e.clone());
            }
            if state.fin_offset == Some(state.read_offset) {
                if n > 0 {
                    break;
                }
                state.finished_reading = true;
                return Ok(0);
            }
            match self.copy_contiguous(&mut state, &mut buf[n..]) {
                0 if n > 0 => break,
                0 => self.readable.wait(&mut state),
                copied => {
                    n += copied;
                    if n == buf.len() {
                        break;
                    }
                }
            }
        }
        drop(state);
        // Consumed bytes free up receive window; the session may owe the
        // peer a window update now.
        let _ = self.flow_control.add_bytes_read(self.id, n as ByteCount);
        let _ = self.scheduler.try_send(());
        Ok(n)
    }

    /// Copies as many contiguous buffered bytes as fit, advancing the read
    /// cursor and dropping exhausted frames.
    fn copy_contiguous(&self, state: &mut State, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let (frame_offset, available) = {
                let frame = match state.frames.iter().next() {
                    Some((&off, f)) => {
                        if off > state.read_offset {
                            break; // gap
                        }
                        (off, f)
                    }
                    None => break,
                };
                let (off, f) = frame;
                let skip = (state.read_offset - off) as usize;
                if skip >= f.data.len() {
                    (off, None)
                } else {
                    let take = (f.data.len() - skip).min(buf.len() - copied);
                    buf[copied..copied + take].copy_from_slice(&f.data[skip..skip + take]);
                    copied += take;
                    (off, Some(skip + take))
                }
            };
            match available {
                None => {
                    state.frames.remove(&frame_offset);
                }
                Some(pos) => {
                    state.read_offset = frame_offset + pos as u64;
                    let exhausted = {
                        let f = &state.frames[&frame_offset];
                        pos == f.data.len()
                    };
                    if exhausted {
                        state.frames.remove(&frame_offset);
                    } else {
                        break; // caller's buffer is full
                    }
                }
            }
        }
        copied
    }

    /// Appends `data` to the writer-side pending queue and blocks until the
    /// packer has drained it or the stream dies. A terminated stream reports
    /// zero bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let mut state = self.state.lock();
        if let Some(ref e) = state.error {
            return Err(e.clone());
        }
        if data.is_empty() {
            return Ok(0);
        }
        state.pending_writes.push_back(Bytes::from(data.to_vec()));
        state.enqueued_offset += data.len() as u64;
        // our bytes are drained once the packer's cursor reaches this offset
        let target = state.enqueued_offset;
        let _ = self.scheduler.try_send(());
        while state.write_offset < target && state.error.is_none() {
            self.write_drained.wait(&mut state);
        }
        if let Some(ref e) = state.error {
            return Err(e.clone());
        }
        Ok(data.len())
    }

    /// Hands up to `max` queued bytes to the packer, with the stream offset
    /// they start at. Chunks drain front-first, in arrival order.
    pub fn get_data_for_writing(&self, max: usize) -> Option<(ByteCount, Bytes)> {
        let mut state = self.state.lock();
        if max == 0 {
            return None;
        }
        let mut front = match state.pending_writes.pop_front() {
            Some(chunk) => chunk,
            None => return None,
        };
        let head = if front.len() > max {
            let head = front.split_to(max);
            state.pending_writes.push_front(front);
            head
        } else if front.len() == max || state.pending_writes.is_empty() {
            front
        } else {
            // coalesce queued chunks into one handout
            let mut assembled = BytesMut::with_capacity(max.min(MAX_PACKET_SIZE));
            assembled.extend_from_slice(&front);
            while assembled.len() < max {
                let mut next = match state.pending_writes.pop_front() {
                    Some(chunk) => chunk,
                    None => break,
                };
                let room = max - assembled.len();
                if next.len() > room {
                    assembled.extend_from_slice(&next.split_to(room));
                    state.pending_writes.push_front(next);
                    break;
                }
                assembled.extend_from_slice(&next);
            }
            assembled.freeze()
        };
        let offset = state.write_offset;
        state.write_offset += head.len() as u64;
        drop(state);
        // a waiting writer's bytes may now be on their way out
        self.write_drained.notify_all();
        Some((offset, head))
    }

    pub fn has_data_for_writing(&self) -> bool {
        !self.state.lock().pending_writes.is_empty()
    }

    pub fn write_offset(&self) -> ByteCount {
        self.state.lock().write_offset
    }

    /// Closes the write side. Buffered incoming data can still be read.
    pub fn close(&self) {
        self.state.lock().closed_locally = true;
        // the FIN still has to go out
        let _ = self.scheduler.try_send(());
    }

    /// Whether the packer should emit a FIN for this stream now.
    pub fn should_send_fin(&self) -> bool {
        let state = self.state.lock();
        state.closed_locally && !state.fin_sent && state.pending_writes.is_empty()
            && state.error.is_none()
    }

    /// Called by the packer once the FIN has been put on the wire.
    pub fn sent_fin(&self) {
        self.state.lock().fin_sent = true;
    }

    /// RST_STREAM received: both directions fail immediately.
    pub fn reset(&self, error_code: u32) {
        self.register_error(StreamError::Reset(error_code));
    }

    /// Fails both directions without generating protocol frames.
    pub fn close_with_error(&self, err: QuicError) {
        self.register_error(StreamError::Session(err));
    }

    fn register_error(&self, err: StreamError) {
        let mut state = self.state.lock();
        if state.error.is_some() {
            return;
        }
        state.error = Some(err);
        drop(state);
        self.readable.notify_all();
        self.write_drained.notify_all();
    }

    /// Whether every termination condition holds and the session may reclaim
    /// the stream's slot.
    pub fn completed(&self) -> bool {
        let state = self.state.lock();
        if state.error.is_some() {
            return true;
        }
        state.finished_reading && state.closed_locally && state.fin_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::thread;
    use std::time::Duration;
    use transport_parameters::ConnectionParameters;
    use ErrorCode;

    fn stream() -> (Arc<Stream>, ::crossbeam_channel::Receiver<()>) {
        let params = ConnectionParameters::new();
        let fcm = Arc::new(FlowControlManager::new(params));
        fcm.new_stream(StreamId(5), true);
        let (tx, rx) = bounded(1);
        (Arc::new(Stream::new(StreamId(5), fcm, tx)), rx)
    }

    fn frame(offset: u64, data: &[u8], fin: bool) -> StreamFrame {
        StreamFrame {
            id: StreamId(5),
            offset,
            data: Bytes::from(data.to_vec()),
            fin,
        }
    }

    #[test]
    fn delivers_in_order_data() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[0xde, 0xca, 0xfb, 0xad], false));
        let mut buf = [0; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0xde, 0xca, 0xfb, 0xad]);
    }

    #[test]
    fn reassembles_out_of_order_frames() {
        let (s, _rx) = stream();
        s.add_frame(frame(2, &[0xfb, 0xad], false));
        s.add_frame(frame(0, &[0xde, 0xca], false));
        let mut buf = [0; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0xde, 0xca, 0xfb, 0xad]);
    }

    #[test]
    fn drops_fully_duplicate_frames() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[1, 2], false));
        s.add_frame(frame(0, &[9, 9], false));
        let mut buf = [0; 2];
        assert_eq!(s.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn returns_eof_after_fin() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[1, 2, 3], true));
        let mut buf = [0; 3];
        assert_eq!(s.read(&mut buf).unwrap(), 3);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn empty_fin_is_immediate_eof() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[], true));
        let mut buf = [0; 1];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn read_blocks_until_data_arrives() {
        let (s, _rx) = stream();
        let reader = s.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0; 2];
            let n = reader.read(&mut buf).unwrap();
            (n, buf)
        });
        thread::sleep(Duration::from_millis(20));
        s.add_frame(frame(0, &[7, 8], false));
        let (n, buf) = handle.join().unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [7, 8]);
    }

    #[test]
    fn write_blocks_until_drained_and_schedules_sending() {
        let (s, rx) = stream();
        let writer = s.clone();
        let handle = thread::spawn(move || writer.write(b"foobar").unwrap());
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let (offset, data) = loop {
            match s.get_data_for_writing(1000) {
                Some(x) => break x,
                None => thread::sleep(Duration::from_millis(1)),
            }
        };
        assert_eq!(offset, 0);
        assert_eq!(data, Bytes::from(&b"foobar"[..]));
        assert_eq!(handle.join().unwrap(), 6);
    }

    #[test]
    fn partial_drains_keep_the_writer_blocked() {
        let (s, _rx) = stream();
        let writer = s.clone();
        let handle = thread::spawn(move || writer.write(b"foobar").unwrap());
        let (offset, head) = loop {
            match s.get_data_for_writing(3) {
                Some(x) => break x,
                None => thread::sleep(Duration::from_millis(1)),
            }
        };
        assert_eq!((offset, &head[..]), (0, &b"foo"[..]));
        let (offset, tail) = s.get_data_for_writing(1000).unwrap();
        assert_eq!((offset, &tail[..]), (3, &b"bar"[..]));
        assert_eq!(handle.join().unwrap(), 6);
    }

    #[test]
    fn concurrent_writes_are_queued_in_arrival_order() {
        let (s, _rx) = stream();
        let w1 = s.clone();
        let h1 = thread::spawn(move || w1.write(b"first").unwrap());
        // the first writer must be parked before the second arrives
        while !s.has_data_for_writing() {
            thread::sleep(Duration::from_millis(1));
        }
        let w2 = s.clone();
        let h2 = thread::spawn(move || w2.write(b"second").unwrap());
        let mut drained = Vec::new();
        while drained.len() < 11 {
            match s.get_data_for_writing(1000) {
                Some((offset, data)) => {
                    assert_eq!(offset as usize, drained.len());
                    drained.extend_from_slice(&data);
                }
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
        assert_eq!(drained, b"firstsecond");
        assert_eq!(h1.join().unwrap(), 5);
        assert_eq!(h2.join().unwrap(), 6);
    }

    #[test]
    fn reset_fails_both_directions() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[1], false));
        s.reset(42);
        let mut buf = [0; 1];
        let err = s.read(&mut buf).unwrap_err();
        assert_eq!(format!("{}", err), "RST_STREAM received with code 42");
        let err = s.write(&[0]).unwrap_err();
        assert_eq!(format!("{}", err), "RST_STREAM received with code 42");
    }

    #[test]
    fn reset_unblocks_a_pending_write() {
        let (s, _rx) = stream();
        let writer = s.clone();
        let handle = thread::spawn(move || writer.write(b"foobar"));
        while !s.has_data_for_writing() {
            thread::sleep(Duration::from_millis(1));
        }
        s.reset(42);
        assert_matches!(handle.join().unwrap(), Err(StreamError::Reset(42)));
    }

    #[test]
    fn close_with_error_fails_reads() {
        let (s, _rx) = stream();
        s.close_with_error(QuicError::new(ErrorCode(42), "foobar"));
        let mut buf = [0; 1];
        let err = s.read(&mut buf).unwrap_err();
        assert_matches!(err, StreamError::Session(ref e) if e.code == ErrorCode(42));
    }

    #[test]
    fn completion_requires_fin_close_and_sent_fin() {
        let (s, _rx) = stream();
        s.add_frame(frame(0, &[1], true));
        let mut buf = [0; 1];
        s.read(&mut buf).unwrap();
        s.read(&mut buf).unwrap(); // EOF
        assert!(!s.completed());
        s.close();
        assert!(!s.completed());
        s.sent_fin();
        assert!(s.completed());
    }

    #[test]
    fn errored_streams_complete_immediately() {
        let (s, _rx) = stream();
        s.close_with_error(QuicError::new(ErrorCode(1), "gone"));
        assert!(s.completed());
    }

    #[test]
    fn fin_only_send_side() {
        let (s, _rx) = stream();
        assert!(!s.should_send_fin());
        s.close();
        assert!(s.should_send_fin());
        s.sent_fin();
        assert!(!s.should_send_fin());
    }
}
