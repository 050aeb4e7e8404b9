//! The per-connection session: a single event-loop thread that owns all
//! connection state, fed by bounded channels.
//!
//! Producers never block on the session: inbound packets are dropped when
//! the queue is full, send requests coalesce into a single token, and the
//! close signal is one-shot. Everything that mutates session state happens
//! on the `run` thread, except the synchronous close path, which is
//! once-gated.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use slog::Logger;

use ack_handler::{
    AckError, Packet, ReceivedPacketHandler, ReceivedPacketHandlerImpl, SentPacketHandler,
    SentPacketHandlerImpl,
};
use buffer_pool;
use crypto::{CryptoSetup, ServerConfig};
use flow_control::{FlowControlError, FlowControlManager};
use frame::{
    AckFrame, ConnectionCloseFrame, Frame, RstStreamFrame, StreamFrame, WindowUpdateFrame,
};
use packet::{
    write_public_reset, PacketPacker, PacketUnpacker, PublicHeader, StreamFrameSource, Unpacker,
};
use qerr::{ErrorCode, QuicError};
use stream::Stream;
use transport_parameters::ConnectionParameters;
use {
    ConnectionId, PacketNumber, StreamId, Version, MAX_OPEN_STREAMS,
    MAX_SESSION_UNPROCESSED_PACKETS, MAX_UNDECRYPTABLE_PACKETS,
};

/// Consecutive `Connection::write` failures tolerated before the session
/// gives up.
const MAX_CONSECUTIVE_WRITE_ERRORS: u32 = 3;

/// Transport egress. Implementations wrap a connected UDP socket; `write`
/// must not block the session thread beyond local kernel-send latency.
pub trait Connection: Send + Sync {
    fn write(&self, packet: &[u8]) -> io::Result<()>;
    fn set_current_remote_addr(&self, addr: SocketAddr);
    fn ip(&self) -> Option<IpAddr>;
}

/// An inbound packet as handed over by the demultiplexer: parsed public
/// header plus the still-encrypted payload.
#[derive(Debug)]
pub struct ReceivedPacket {
    pub remote_addr: Option<SocketAddr>,
    pub header: PublicHeader,
    pub data: Vec<u8>,
}

/// Invoked once for the first frame of every peer-initiated stream.
pub type StreamCallback = Box<dyn Fn(&Session, &Arc<Stream>) + Send + Sync>;

/// Invoked exactly once when the session tears down.
pub type CloseCallback = Box<dyn Fn(ConnectionId) + Send + Sync>;

/// Errors produced by per-frame handlers. The dispatcher swallows exactly
/// the stale-stream references; everything else tears the session down.
#[derive(Debug, Clone, PartialEq, Fail)]
pub enum SessionError {
    #[fail(display = "received RST_STREAM frame for an unknown stream")]
    RstStreamOnInvalidStream,
    #[fail(display = "received WINDOW_UPDATE frame for a closed stream")]
    WindowUpdateOnClosedStream,
    #[fail(display = "{}", _0)]
    Quic(QuicError),
}

impl From<QuicError> for SessionError {
    fn from(e: QuicError) -> SessionError {
        SessionError::Quic(e)
    }
}

pub struct Session {
    log: Logger,
    connection_id: ConnectionId,
    version: Version,
    conn: Arc<dyn Connection>,

    /// Live streams, plus tombstones for reclaimed ids so late frames are
    /// rejected as "on closed stream" instead of re-creating the stream.
    streams: Mutex<FnvHashMap<StreamId, Option<Arc<Stream>>>>,
    crypto_stream: Arc<Stream>,
    crypto_setup: Arc<CryptoSetup>,
    connection_parameters: Arc<ConnectionParameters>,
    flow_control_manager: Arc<FlowControlManager>,

    pub(crate) sent_packet_handler: Mutex<Box<dyn SentPacketHandler>>,
    pub(crate) received_packet_handler: Mutex<Box<dyn ReceivedPacketHandler>>,
    pub(crate) packer: Mutex<PacketPacker>,
    pub(crate) unpacker: Mutex<Box<dyn Unpacker>>,

    received_packets_tx: Sender<ReceivedPacket>,
    received_packets_rx: Receiver<ReceivedPacket>,
    sending_scheduled_tx: Sender<()>,
    sending_scheduled_rx: Receiver<()>,
    close_tx: Sender<()>,
    pub(crate) close_rx: Receiver<()>,
    aead_changed_rx: Receiver<()>,

    undecryptable_packets: Mutex<Vec<ReceivedPacket>>,
    last_rcvd_packet_number: AtomicU64,
    last_network_activity: Mutex<Instant>,
    pub(crate) closed: AtomicBool,
    write_error_streak: AtomicU32,

    stream_callback: StreamCallback,
    close_callback: CloseCallback,
}

impl Session {
    pub fn new(
        log: Logger,
        conn: Arc<dyn Connection>,
        version: Version,
        connection_id: ConnectionId,
        server_config: Arc<ServerConfig>,
        stream_callback: StreamCallback,
        close_callback: CloseCallback,
    ) -> Result<Arc<Session>, QuicError> {
        let log = log.new(o!("connection" => connection_id));
        let connection_parameters = ConnectionParameters::new();
        let flow_control_manager =
            Arc::new(FlowControlManager::new(connection_parameters.clone()));

        let (received_packets_tx, received_packets_rx) = bounded(MAX_SESSION_UNPROCESSED_PACKETS);
        let (sending_scheduled_tx, sending_scheduled_rx) = bounded(1);
        let (close_tx, close_rx) = bounded(1);
        let (aead_changed_tx, aead_changed_rx) = bounded(1);

        let crypto_setup = CryptoSetup::new(
            log.clone(),
            connection_parameters.clone(),
            server_config,
            aead_changed_tx,
        );
        let packer = PacketPacker::new(connection_id, version, crypto_setup.clone());
        let unpacker: Box<dyn Unpacker> = Box::new(PacketUnpacker::new(crypto_setup.clone()));

        let crypto_stream = Arc::new(Stream::new(
            StreamId(1),
            flow_control_manager.clone(),
            sending_scheduled_tx.clone(),
        ));
        flow_control_manager.new_stream(StreamId(1), false);
        let mut streams = FnvHashMap::default();
        streams.insert(StreamId(1), Some(crypto_stream.clone()));

        Ok(Arc::new(Session {
            log,
            connection_id,
            version,
            conn,
            streams: Mutex::new(streams),
            crypto_stream,
            crypto_setup,
            connection_parameters,
            flow_control_manager,
            sent_packet_handler: Mutex::new(Box::new(SentPacketHandlerImpl::new())),
            received_packet_handler: Mutex::new(Box::new(ReceivedPacketHandlerImpl::new())),
            packer: Mutex::new(packer),
            unpacker: Mutex::new(unpacker),
            received_packets_tx,
            received_packets_rx,
            sending_scheduled_tx,
            sending_scheduled_rx,
            close_tx,
            close_rx,
            aead_changed_rx,
            undecryptable_packets: Mutex::new(Vec::new()),
            last_rcvd_packet_number: AtomicU64::new(0),
            last_network_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            write_error_streak: AtomicU32::new(0),
            stream_callback,
            close_callback,
        }))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The session event loop. Returns once the session has closed.
    pub fn run(self: Arc<Self>) {
        let crypto_session = self.clone();
        thread::spawn(move || {
            let stream = crypto_session.crypto_stream.clone();
            if let Err(e) = crypto_session.crypto_setup.handle_crypto_stream(&stream) {
                debug!(crypto_session.log, "crypto stream failed"; "error" => %e);
                crypto_session.close_impl(Some(e), false);
            }
        });

        loop {
            let timeout = self.next_wake_timeout();
            select! {
                recv(self.close_rx) -> _ => return,
                recv(self.received_packets_rx) -> msg => {
                    let packet = match msg {
                        Ok(p) => p,
                        Err(_) => return,
                    };
                    if let Err(e) = self.handle_packet_impl(packet) {
                        self.close_on_handle_error(e);
                    }
                }
                recv(self.sending_scheduled_rx) -> _ => {}
                recv(self.aead_changed_rx) -> _ => self.try_decrypting_queued_packets(),
                default(timeout) => {}
            }
            if self.closed.load(Ordering::Acquire) {
                continue; // the close signal is waiting in close_rx
            }
            let idle = self.connection_parameters.idle_connection_state_lifetime();
            if self.last_network_activity.lock().elapsed() >= idle {
                self.close_impl(
                    Some(QuicError::new(
                        ErrorCode::NETWORK_IDLE_TIMEOUT,
                        "No recent network activity.",
                    )),
                    false,
                );
                continue;
            }
            if let Err(e) = self.send_packet() {
                self.close_impl(Some(e), false);
                continue;
            }
            self.garbage_collect_streams();
        }
    }

    fn close_on_handle_error(&self, e: SessionError) {
        let quic_err = match e {
            SessionError::Quic(q) => q,
            other => QuicError::new(ErrorCode::INTERNAL_ERROR, &format!("{}", other)),
        };
        self.close_impl(Some(quic_err), false);
    }

    fn next_wake_timeout(&self) -> Duration {
        let now = Instant::now();
        let idle_deadline = *self.last_network_activity.lock()
            + self.connection_parameters.idle_connection_state_lifetime();
        let mut timeout = idle_deadline
            .checked_duration_since(now)
            .unwrap_or_else(|| Duration::from_millis(0));
        if let Some(rto) = self.sent_packet_handler.lock().time_of_first_rto() {
            let until_rto = rto
                .checked_duration_since(now)
                .unwrap_or_else(|| Duration::from_millis(0));
            timeout = timeout.min(until_rto);
        }
        timeout
    }

    /// Entry point for the socket reader. Never blocks: the packet is
    /// dropped if the session is backlogged.
    pub fn handle_packet(
        &self,
        remote_addr: Option<SocketAddr>,
        header: PublicHeader,
        data: Vec<u8>,
    ) {
        let _ = self.received_packets_tx.try_send(ReceivedPacket {
            remote_addr,
            header,
            data,
        });
    }

    pub(crate) fn handle_packet_impl(&self, packet: ReceivedPacket) -> Result<(), SessionError> {
        *self.last_network_activity.lock() = Instant::now();
        if let Some(addr) = packet.remote_addr {
            self.conn.set_current_remote_addr(addr);
        }

        let unpacked = {
            let unpacker = self.unpacker.lock();
            match unpacker.unpack(&packet.header.raw, &packet.header, &packet.data) {
                Ok(u) => u,
                Err(e) => {
                    if e.code == ErrorCode::DECRYPTION_FAILURE
                        && !self.crypto_setup.handshake_complete()
                    {
                        drop(unpacker);
                        self.try_queueing_undecryptable_packet(packet);
                        return Ok(());
                    }
                    return Err(e.into());
                }
            }
        };

        let number = packet.header.packet_number;
        self.last_rcvd_packet_number
            .fetch_max(number, Ordering::AcqRel);
        trace!(self.log, "handling packet"; "pn" => number, "frames" => unpacked.frames.len());

        match self
            .received_packet_handler
            .lock()
            .received_packet(number, unpacked.entropy_bit)
        {
            Ok(()) => {}
            Err(AckError::DuplicatePacket) => {
                debug!(self.log, "ignoring duplicate packet"; "pn" => number);
                return Ok(());
            }
            Err(AckError::PacketSmallerThanLastStopWaiting) => {
                debug!(self.log, "ignoring packet below the stop waiting floor"; "pn" => number);
                return Ok(());
            }
            Err(e) => return Err(SessionError::Quic(e.into())),
        }

        self.handle_frames(unpacked.frames)
    }

    /// Dispatches the frames of one packet, in packet order. Stale stream
    /// references (`RstStreamOnInvalidStream`, `WindowUpdateOnClosedStream`)
    /// are logged and swallowed; any other error is fatal.
    pub(crate) fn handle_frames(&self, frames: Vec<Frame>) -> Result<(), SessionError> {
        for frame in frames {
            let result = match frame {
                Frame::Stream(ref f) => self.handle_stream_frame(f),
                Frame::Ack(ref f) => self.handle_ack_frame(f),
                Frame::StopWaiting(ref f) => self
                    .received_packet_handler
                    .lock()
                    .received_stop_waiting(f)
                    .map_err(|e| SessionError::Quic(e.into())),
                Frame::WindowUpdate(ref f) => self.handle_window_update_frame(f),
                Frame::Blocked(_) => Ok(()),
                Frame::RstStream(ref f) => self.handle_rst_stream_frame(f),
                Frame::Ping => Ok(()),
                Frame::ConnectionClose(ref f) => {
                    self.close_impl(
                        Some(QuicError::new(ErrorCode(f.error_code), &f.reason)),
                        true,
                    );
                    Ok(())
                }
                Frame::Goaway(_) => Err(SessionError::Quic(QuicError::new(
                    ErrorCode::INTERNAL_ERROR,
                    "unimplemented: handling GOAWAY frames",
                ))),
            };
            match result {
                Ok(()) => {}
                Err(e @ SessionError::RstStreamOnInvalidStream)
                | Err(e @ SessionError::WindowUpdateOnClosedStream) => {
                    debug!(self.log, "ignoring error in received frames"; "error" => %e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn handle_stream_frame(&self, frame: &StreamFrame) -> Result<(), SessionError> {
        let (stream, is_new) = {
            let mut streams = self.streams.lock();
            let looked_up = match streams.get(&frame.id) {
                Some(&Some(ref s)) => Some(Some(s.clone())),
                Some(&None) => Some(None),
                None => None,
            };
            match looked_up {
                Some(Some(stream)) => (stream, false),
                Some(None) => {
                    trace!(self.log, "dropping frame for reclaimed stream"; "stream" => %frame.id);
                    return Ok(());
                }
                None => {
                    if !frame.id.initiated_by_peer() {
                        debug!(self.log, "peer opened stream with wrong parity"; "stream" => %frame.id);
                        return Err(SessionError::Quic(QuicError::new(
                            ErrorCode::INVALID_STREAM_ID,
                            &format!("attempted to open stream {}", frame.id),
                        )));
                    }
                    let stream = self
                        .create_stream_locked(&mut streams, frame.id)
                        .map_err(SessionError::Quic)?;
                    (stream, true)
                }
            }
        };

        let end = frame.offset + frame.data.len() as u64;
        if end > 0 {
            self.flow_control_manager
                .update_highest_received(frame.id, end)
                .map_err(|e| SessionError::Quic(flow_control_to_quic(e)))?;
        }
        stream.add_frame(frame.clone());
        if is_new {
            (self.stream_callback)(self, &stream);
        }
        Ok(())
    }

    fn handle_ack_frame(&self, frame: &AckFrame) -> Result<(), SessionError> {
        let with = self.last_rcvd_packet_number.load(Ordering::Acquire);
        self.sent_packet_handler
            .lock()
            .received_ack(frame, with)
            .map_err(|e| SessionError::Quic(e.into()))
    }

    pub(crate) fn handle_window_update_frame(
        &self,
        frame: &WindowUpdateFrame,
    ) -> Result<(), SessionError> {
        if !frame.id.is_connection_stream() {
            let mut streams = self.streams.lock();
            match streams.get(&frame.id) {
                Some(&Some(_)) => {}
                Some(&None) => return Err(SessionError::WindowUpdateOnClosedStream),
                None => {
                    // the peer may extend credit before we open the stream
                    self.create_stream_locked(&mut streams, frame.id)
                        .map_err(SessionError::Quic)?;
                }
            }
        }
        let updated = self
            .flow_control_manager
            .update_window(frame.id, frame.byte_offset)
            .map_err(|e| SessionError::Quic(flow_control_to_quic(e)))?;
        if updated {
            // a write blocked on flow control may be able to proceed
            let _ = self.sending_scheduled_tx.try_send(());
        }
        Ok(())
    }

    pub(crate) fn handle_rst_stream_frame(&self, frame: &RstStreamFrame) -> Result<(), SessionError> {
        let stream = {
            let streams = self.streams.lock();
            match streams.get(&frame.id) {
                Some(&Some(ref s)) => s.clone(),
                _ => return Err(SessionError::RstStreamOnInvalidStream),
            }
        };
        stream.reset(frame.error_code);
        Ok(())
    }

    /// Opens a locally-initiated stream. Breaching the open-stream limit
    /// fails with `TooManyOpenStreams` and begins closing the session.
    pub fn open_stream(&self, id: StreamId) -> Result<Arc<Stream>, QuicError> {
        let result = {
            let mut streams = self.streams.lock();
            match streams.get(&id) {
                Some(&Some(_)) => Err(QuicError::new(
                    ErrorCode::INTERNAL_ERROR,
                    &format!("stream {} already exists", id),
                )),
                Some(&None) => Err(QuicError::new(
                    ErrorCode::INTERNAL_ERROR,
                    &format!("stream {} was already closed", id),
                )),
                None => self.create_stream_locked(&mut streams, id),
            }
        };
        if let Err(ref e) = result {
            if e.code == ErrorCode::TOO_MANY_OPEN_STREAMS {
                self.close_impl(Some(e.clone()), false);
            }
        }
        result
    }

    pub(crate) fn new_stream_impl(&self, id: StreamId) -> Result<Arc<Stream>, QuicError> {
        let mut streams = self.streams.lock();
        self.create_stream_locked(&mut streams, id)
    }

    fn create_stream_locked(
        &self,
        streams: &mut FnvHashMap<StreamId, Option<Arc<Stream>>>,
        id: StreamId,
    ) -> Result<Arc<Stream>, QuicError> {
        let live = streams.values().filter(|entry| entry.is_some()).count();
        if live >= MAX_OPEN_STREAMS {
            return Err(QuicError::new(
                ErrorCode::TOO_MANY_OPEN_STREAMS,
                "too many open streams",
            ));
        }
        trace!(self.log, "opening stream"; "stream" => %id);
        let stream = Arc::new(Stream::new(
            id,
            self.flow_control_manager.clone(),
            self.sending_scheduled_tx.clone(),
        ));
        self.flow_control_manager
            .new_stream(id, !id.is_crypto_stream());
        streams.insert(id, Some(stream.clone()));
        Ok(stream)
    }

    /// Tombstones every stream whose termination conditions all hold and
    /// releases its flow controller.
    pub(crate) fn garbage_collect_streams(&self) {
        let mut streams = self.streams.lock();
        let completed: Vec<StreamId> = streams
            .iter()
            .filter_map(|(&id, entry)| match *entry {
                Some(ref s) if s.completed() => Some(id),
                _ => None,
            })
            .collect();
        for id in completed {
            trace!(self.log, "garbage collecting stream"; "stream" => %id);
            streams.insert(id, None);
            self.flow_control_manager.remove_stream(id);
        }
    }

    pub(crate) fn close_streams_with_error(&self, err: &QuicError) {
        let streams = self.streams.lock();
        for entry in streams.values() {
            if let Some(ref stream) = *entry {
                stream.close_with_error(err.clone());
            }
        }
    }

    /// Requests a send from the event loop. Calls coalesce.
    pub fn schedule_sending(&self) {
        let _ = self.sending_scheduled_tx.try_send(());
    }

    /// Initiates shutdown. Idempotent: only the first call closes streams,
    /// emits the CONNECTION_CLOSE (or public reset) and fires the close
    /// callback.
    pub fn close(&self, e: Option<QuicError>) {
        self.close_impl(e, false);
    }

    fn close_impl(&self, e: Option<QuicError>, remote_close: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let quic_err = e.unwrap_or_else(|| QuicError::from(ErrorCode::PEER_GOING_AWAY));
        info!(self.log, "closing session"; "error" => %quic_err, "remote" => remote_close);
        self.close_streams_with_error(&quic_err);
        if !remote_close {
            // without established keys there is no way to produce a valid
            // CONNECTION_CLOSE, so fall back to the unencrypted abort
            if quic_err.code == ErrorCode::DECRYPTION_FAILURE
                && !self.crypto_setup.handshake_complete()
            {
                self.send_public_reset(self.last_rcvd_packet_number.load(Ordering::Acquire));
            } else {
                self.send_connection_close(&quic_err);
            }
        }
        (self.close_callback)(self.connection_id);
        let _ = self.close_tx.try_send(());
    }

    fn send_connection_close(&self, err: &QuicError) {
        let frame = ConnectionCloseFrame {
            error_code: err.code.0,
            reason: err.reason.clone(),
        };
        let packet = self.packer.lock().pack_connection_close(&frame);
        if let Err(e) = self.conn.write(&packet.raw) {
            warn!(self.log, "failed to send CONNECTION_CLOSE"; "error" => %e);
        }
        buffer_pool::put_packet_buffer(packet.raw);
    }

    /// The unencrypted abort path, used when no usable keys exist.
    pub(crate) fn send_public_reset(&self, rejected_packet_number: PacketNumber) {
        info!(self.log, "sending public reset"; "rejected_pn" => rejected_packet_number);
        let nonce = ::rand::random::<u64>();
        let buf = write_public_reset(self.connection_id, rejected_packet_number, nonce);
        if let Err(e) = self.conn.write(&buf) {
            warn!(self.log, "failed to send public reset"; "error" => %e);
        }
        buffer_pool::put_packet_buffer(buf);
    }

    fn try_queueing_undecryptable_packet(&self, packet: ReceivedPacket) {
        {
            let mut queue = self.undecryptable_packets.lock();
            if queue.len() + 1 < MAX_UNDECRYPTABLE_PACKETS {
                debug!(self.log, "queueing packet for later decryption"; "pn" => packet.header.packet_number);
                queue.push(packet);
                return;
            }
        }
        self.close_impl(
            Some(QuicError::new(
                ErrorCode::DECRYPTION_FAILURE,
                "too many undecryptable packets received",
            )),
            false,
        );
    }

    /// Re-enqueues stashed packets once new keys are available.
    pub(crate) fn try_decrypting_queued_packets(&self) {
        let packets: Vec<ReceivedPacket> = {
            let mut queue = self.undecryptable_packets.lock();
            queue.drain(..).collect()
        };
        for packet in packets {
            let _ = self.received_packets_tx.try_send(packet);
        }
    }

    fn get_window_update_frames(&self) -> Vec<WindowUpdateFrame> {
        let ids: Vec<StreamId> = {
            let streams = self.streams.lock();
            streams
                .iter()
                .filter_map(|(&id, entry)| entry.as_ref().map(|_| id))
                .collect()
        };
        let mut frames = Vec::new();
        for id in ids {
            if let Ok(Some(offset)) = self.flow_control_manager.maybe_trigger_stream_window_update(id)
            {
                frames.push(WindowUpdateFrame {
                    id,
                    byte_offset: offset,
                });
            }
        }
        if let Some(offset) = self
            .flow_control_manager
            .maybe_trigger_connection_window_update()
        {
            frames.push(WindowUpdateFrame {
                id: StreamId(0),
                byte_offset: offset,
            });
        }
        frames
    }

    /// Drains everything sendable: retransmissions first, then control
    /// frames (one ACK at most per packet) and stream data, bundling small
    /// frames and splitting large ones, until the packer runs dry.
    pub(crate) fn send_packet(&self) -> Result<(), QuicError> {
        loop {
            {
                let sph = self.sent_packet_handler.lock();
                sph.check_for_error().map_err(QuicError::from)?;
                if !sph.congestion_allows_sending() {
                    return Ok(());
                }
            }

            {
                let mut sph = self.sent_packet_handler.lock();
                let mut packer = self.packer.lock();
                while sph.probably_has_packet_for_retransmission() {
                    let lost = match sph.dequeue_packet_for_retransmission() {
                        Some(p) => p,
                        None => break,
                    };
                    debug!(self.log, "queueing lost packet for retransmission"; "pn" => lost.packet_number);
                    for frame in lost.stream_frames_for_retransmission() {
                        packer.queue_stream_frame_for_retransmission(frame);
                    }
                }
            }

            let mut control_frames: Vec<Frame> = Vec::new();
            for wuf in self.get_window_update_frames() {
                control_frames.push(Frame::WindowUpdate(wuf));
            }
            if let Some(ack) = self.received_packet_handler.lock().get_ack_frame(true) {
                control_frames.push(Frame::Ack(ack));
            }

            let packet = {
                let mut packer = self.packer.lock();
                packer.pack_packet(control_frames, self)
            };
            let packet = match packet {
                Some(p) => p,
                None => return Ok(()),
            };

            self.sent_packet_handler
                .lock()
                .sent_packet(Packet {
                    packet_number: packet.number,
                    frames: packet.frames,
                    entropy_bit: packet.entropy_bit,
                    length: packet.raw.len(),
                    send_time: Instant::now(),
                })
                .map_err(QuicError::from)?;

            trace!(self.log, "sending packet"; "pn" => packet.number, "len" => packet.raw.len());
            match self.conn.write(&packet.raw) {
                Ok(()) => {
                    self.write_error_streak.store(0, Ordering::Relaxed);
                    buffer_pool::put_packet_buffer(packet.raw);
                }
                Err(e) => {
                    warn!(self.log, "failed to write packet"; "error" => %e);
                    buffer_pool::put_packet_buffer(packet.raw);
                    let streak = self.write_error_streak.fetch_add(1, Ordering::Relaxed) + 1;
                    if streak >= MAX_CONSECUTIVE_WRITE_ERRORS {
                        return Err(QuicError::new(
                            ErrorCode::PACKET_WRITE_ERROR,
                            "repeated connection write failures",
                        ));
                    }
                    // transient: the packet is already tracked, so its frames
                    // come back through the retransmission path
                    return Ok(());
                }
            }
        }
    }
}

impl StreamFrameSource for Session {
    /// Round-robins over live streams, bounded by the packet budget and the
    /// per-stream and connection flow control allowances.
    fn pop_stream_frames(&self, max_total: usize) -> Vec<StreamFrame> {
        let streams: Vec<Arc<Stream>> = {
            let table = self.streams.lock();
            table.values().filter_map(|entry| entry.clone()).collect()
        };
        let mut remaining = max_total;
        let mut frames = Vec::new();
        for stream in streams {
            let id = stream.id();
            let probe = StreamFrame {
                id,
                offset: stream.write_offset(),
                data: Bytes::new(),
                fin: false,
            };
            let overhead = probe.header_length();
            if remaining <= overhead {
                break;
            }
            let window = match self.flow_control_manager.send_window_size(id) {
                Ok(w) => w,
                Err(_) => continue,
            };
            let max_data = ((remaining - overhead) as u64).min(window) as usize;
            let popped = stream.get_data_for_writing(max_data);
            let fin = stream.should_send_fin();
            let (offset, data) = match popped {
                Some(x) => x,
                None => {
                    if !fin {
                        continue;
                    }
                    (stream.write_offset(), Bytes::new())
                }
            };
            if fin {
                stream.sent_fin();
            }
            let _ = self
                .flow_control_manager
                .add_bytes_sent(id, data.len() as u64);
            remaining -= overhead + data.len();
            frames.push(StreamFrame {
                id,
                offset,
                data,
                fin,
            });
        }
        frames
    }
}

fn flow_control_to_quic(e: FlowControlError) -> QuicError {
    match e {
        FlowControlError::MapAccess => QuicError::new(
            ErrorCode::INTERNAL_ERROR,
            "flow controller missing for live stream",
        ),
        FlowControlError::StreamFlowControlViolation => QuicError::new(
            ErrorCode::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA,
            "stream-level flow control violation",
        ),
        FlowControlError::ConnectionFlowControlViolation => QuicError::new(
            ErrorCode::FLOW_CONTROL_RECEIVED_TOO_MUCH_DATA,
            "connection-level flow control violation",
        ),
    }
}
