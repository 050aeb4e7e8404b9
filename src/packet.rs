//! Packet assembly: public header, payload composition, sealing, and the
//! public reset. Unpacking of received payloads lives behind the `Unpacker`
//! trait so sessions can be driven without real packet protection.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use rand::{thread_rng, Rng};

use buffer_pool;
use coding;
use crypto::{CryptoSetup, AEAD_TAG_SIZE};
use frame::{ConnectionCloseFrame, Frame, StreamFrame, WindowUpdateFrame};
use handshake::{tags, HandshakeMessage};
use qerr::{ErrorCode, QuicError};
use {ConnectionId, PacketNumber, Version, MAX_PACKET_SIZE};

const PUBLIC_FLAG_RESET: u8 = 0x02;
const PUBLIC_FLAG_CONNECTION_ID_8: u8 = 0x08;
const PUBLIC_FLAG_PACKET_NUMBER_6: u8 = 0x30;

/// Flags byte + 8-byte connection id + 6-byte packet number.
const PUBLIC_HEADER_SIZE: usize = 15;

const PRIVATE_FLAG_ENTROPY: u8 = 0x01;

/// The public header of a packet. Parsing off the wire happens at the
/// listener, before demultiplexing; the session only consumes the parsed
/// form plus the raw bytes (the AEAD's associated data).
#[derive(Debug, Clone, Default)]
pub struct PublicHeader {
    pub connection_id: ConnectionId,
    pub reset_flag: bool,
    pub version_flag: bool,
    pub packet_number: PacketNumber,
    pub packet_number_len: usize,
    /// Header bytes as received.
    pub raw: Vec<u8>,
}

fn write_public_header(buf: &mut Vec<u8>, connection_id: ConnectionId, number: PacketNumber) {
    buf.push(PUBLIC_FLAG_CONNECTION_ID_8 | PUBLIC_FLAG_PACKET_NUMBER_6);
    coding::write_u64(buf, connection_id);
    coding::write_u48(buf, number);
}

/// A decrypted and decoded packet payload.
#[derive(Debug)]
pub struct UnpackedPacket {
    pub entropy_bit: bool,
    pub frames: Vec<Frame>,
}

pub trait Unpacker: Send {
    fn unpack(
        &self,
        header_raw: &[u8],
        header: &PublicHeader,
        data: &[u8],
    ) -> Result<UnpackedPacket, QuicError>;
}

/// The real unpacker: opens the payload through the crypto setup and decodes
/// its frames.
pub struct PacketUnpacker {
    crypto: Arc<CryptoSetup>,
}

impl PacketUnpacker {
    pub fn new(crypto: Arc<CryptoSetup>) -> PacketUnpacker {
        PacketUnpacker { crypto }
    }
}

impl Unpacker for PacketUnpacker {
    fn unpack(
        &self,
        header_raw: &[u8],
        header: &PublicHeader,
        data: &[u8],
    ) -> Result<UnpackedPacket, QuicError> {
        let plaintext = self.crypto.open(header.packet_number, header_raw, data)?;
        if plaintext.is_empty() {
            return Err(QuicError::new(
                ErrorCode::INVALID_FRAME_DATA,
                "packet without payload",
            ));
        }
        Ok(UnpackedPacket {
            entropy_bit: plaintext[0] & PRIVATE_FLAG_ENTROPY != 0,
            frames: Frame::parse_all(&plaintext[1..])?,
        })
    }
}

/// A sealed outgoing packet, with the frame list retained for the sent
/// packet handler (retransmissions re-serialize from it).
#[derive(Debug)]
pub struct PackedPacket {
    pub number: PacketNumber,
    pub raw: Vec<u8>,
    pub frames: Vec<Frame>,
    pub entropy_bit: bool,
}

/// Where the packer pulls fresh stream data from. `max_total` is a budget in
/// serialized bytes (headers included); implementations return frames that
/// fit it.
pub trait StreamFrameSource {
    fn pop_stream_frames(&self, max_total: usize) -> Vec<StreamFrame>;
}

/// Composes size-bounded packets out of control frames, retransmissions and
/// fresh stream data, in that priority order. Window update frames ride in
/// two consecutive packets, so the previous packet's updates are replayed
/// before anything else.
pub struct PacketPacker {
    connection_id: ConnectionId,
    version: Version,
    crypto: Arc<CryptoSetup>,
    pub(crate) last_packet_number: PacketNumber,
    retransmission_queue: VecDeque<StreamFrame>,
    last_window_updates: Vec<WindowUpdateFrame>,
}

impl PacketPacker {
    pub fn new(connection_id: ConnectionId, version: Version, crypto: Arc<CryptoSetup>) -> Self {
        PacketPacker {
            connection_id,
            version,
            crypto,
            last_packet_number: 0,
            retransmission_queue: VecDeque::new(),
            last_window_updates: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Frames from a lost packet; they take precedence over fresh data and
    /// are split across packets as needed.
    pub fn queue_stream_frame_for_retransmission(&mut self, frame: StreamFrame) {
        self.retransmission_queue.push_back(frame);
    }

    fn max_payload_len() -> usize {
        MAX_PACKET_SIZE - PUBLIC_HEADER_SIZE - AEAD_TAG_SIZE - 1
    }

    /// Composes, seals and numbers at most one packet. `None` means there was
    /// nothing to send.
    pub fn pack_packet(
        &mut self,
        control_frames: Vec<Frame>,
        source: &StreamFrameSource,
    ) -> Option<PackedPacket> {
        let max_len = Self::max_payload_len();
        let mut payload = Vec::new();
        let mut frames: Vec<Frame> = Vec::new();

        // repeat the previous packet's window updates once
        for wu in mem::replace(&mut self.last_window_updates, Vec::new()) {
            append_frame(&mut payload, &mut frames, Frame::WindowUpdate(wu), max_len);
        }

        let mut new_window_updates = Vec::new();
        for frame in control_frames {
            if let Frame::WindowUpdate(ref wu) = frame {
                new_window_updates.push(wu.clone());
            }
            append_frame(&mut payload, &mut frames, frame, max_len);
        }

        while let Some(mut frame) = self.retransmission_queue.pop_front() {
            let remaining = max_len - payload.len();
            if frame.header_length() + 1 > remaining {
                self.retransmission_queue.push_front(frame);
                break;
            }
            let max_data = remaining - frame.header_length();
            if frame.data.len() > max_data {
                let head = frame.split_off_head(max_data);
                self.retransmission_queue.push_front(frame);
                let head = Frame::Stream(head);
                head.write(&mut payload);
                frames.push(head);
                break; // packet is full
            }
            let frame = Frame::Stream(frame);
            frame.write(&mut payload);
            frames.push(frame);
        }

        // fresh stream data only once the retransmission queue is drained
        if self.retransmission_queue.is_empty() {
            let budget = max_len.saturating_sub(payload.len());
            for frame in source.pop_stream_frames(budget) {
                append_frame(&mut payload, &mut frames, Frame::Stream(frame), max_len);
            }
        }

        if frames.is_empty() {
            return None;
        }
        self.last_window_updates = new_window_updates;
        Some(self.seal(payload, frames))
    }

    /// A CONNECTION_CLOSE bypasses composition entirely.
    pub fn pack_connection_close(&mut self, frame: &ConnectionCloseFrame) -> PackedPacket {
        let mut payload = Vec::new();
        let frame = Frame::ConnectionClose(frame.clone());
        frame.write(&mut payload);
        self.seal(payload, vec![frame])
    }

    fn seal(&mut self, payload: Vec<u8>, frames: Vec<Frame>) -> PackedPacket {
        self.last_packet_number += 1;
        let number = self.last_packet_number;
        let entropy_bit = thread_rng().gen::<bool>();

        let mut plaintext = Vec::with_capacity(1 + payload.len());
        plaintext.push(if entropy_bit { PRIVATE_FLAG_ENTROPY } else { 0 });
        plaintext.extend_from_slice(&payload);

        let mut raw = buffer_pool::get_packet_buffer();
        write_public_header(&mut raw, self.connection_id, number);
        let header_len = raw.len();
        let sealed = self.crypto.seal(number, &raw[..header_len], &plaintext);
        raw.extend_from_slice(&sealed);
        debug_assert!(raw.len() <= MAX_PACKET_SIZE);

        PackedPacket {
            number,
            raw,
            frames,
            entropy_bit,
        }
    }
}

fn append_frame(payload: &mut Vec<u8>, frames: &mut Vec<Frame>, frame: Frame, max_len: usize) {
    let before = payload.len();
    frame.write(payload);
    if payload.len() > max_len {
        payload.truncate(before);
        return;
    }
    frames.push(frame);
}

/// An unencrypted abort signal for when no usable keys exist: public flags,
/// connection id and a PRST handshake message naming the rejected packet.
pub fn write_public_reset(
    connection_id: ConnectionId,
    rejected_packet_number: PacketNumber,
    nonce_proof: u64,
) -> Vec<u8> {
    let mut buf = buffer_pool::get_packet_buffer();
    buf.push(PUBLIC_FLAG_RESET | PUBLIC_FLAG_CONNECTION_ID_8);
    coding::write_u64(&mut buf, connection_id);
    let mut msg = HandshakeMessage::new(tags::PRST);
    let mut nonce = Vec::with_capacity(8);
    coding::write_u64(&mut nonce, nonce_proof);
    msg.values.insert(tags::RNON, nonce);
    let mut seq = Vec::with_capacity(8);
    coding::write_u64(&mut seq, rejected_packet_number);
    msg.values.insert(tags::RSEQ, seq);
    msg.write(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crossbeam_channel::bounded;
    use crypto::testing;
    use frame::AckFrame;
    use parking_lot::Mutex;
    use slog::{Discard, Logger};
    use transport_parameters::ConnectionParameters;
    use {StreamId, VERSION_34};

    struct NoData;

    impl StreamFrameSource for NoData {
        fn pop_stream_frames(&self, _: usize) -> Vec<StreamFrame> {
            Vec::new()
        }
    }

    struct FixedData(Mutex<Vec<StreamFrame>>);

    impl StreamFrameSource for FixedData {
        fn pop_stream_frames(&self, _: usize) -> Vec<StreamFrame> {
            self.0.lock().drain(..).collect()
        }
    }

    fn crypto() -> Arc<CryptoSetup> {
        let (tx, _rx) = bounded(1);
        CryptoSetup::new(
            Logger::root(Discard, o!()),
            ConnectionParameters::new(),
            testing::server_config(),
            tx,
        )
    }

    fn packer() -> PacketPacker {
        PacketPacker::new(0x1337, VERSION_34, crypto())
    }

    fn stream_frame(id: u32, data: &[u8]) -> StreamFrame {
        StreamFrame {
            id: StreamId(id),
            offset: 0,
            data: Bytes::from(data.to_vec()),
            fin: false,
        }
    }

    #[test]
    fn empty_composition_produces_no_packet() {
        let mut p = packer();
        assert!(p.pack_packet(Vec::new(), &NoData).is_none());
        assert_eq!(p.last_packet_number, 0);
    }

    #[test]
    fn packets_round_trip_through_the_unpacker() {
        let crypto = crypto();
        let mut p = PacketPacker::new(0x1337, VERSION_34, crypto.clone());
        let ack = AckFrame {
            largest_observed: 0x35ea,
            entropy: 3,
            delay_time_us: 0,
        };
        let packet = p
            .pack_packet(vec![Frame::Ack(ack.clone())], &NoData)
            .expect("packet must be produced");
        assert_eq!(packet.number, 1);

        let unpacker = PacketUnpacker::new(crypto);
        let header_raw = &packet.raw[..PUBLIC_HEADER_SIZE];
        let header = PublicHeader {
            packet_number: packet.number,
            ..Default::default()
        };
        let unpacked = unpacker
            .unpack(header_raw, &header, &packet.raw[PUBLIC_HEADER_SIZE..])
            .unwrap();
        assert_eq!(unpacked.entropy_bit, packet.entropy_bit);
        assert_eq!(unpacked.frames, vec![Frame::Ack(ack)]);
    }

    #[test]
    fn bundles_frames_from_multiple_streams() {
        let mut p = packer();
        let source = FixedData(Mutex::new(vec![
            stream_frame(5, b"foobar1"),
            stream_frame(7, b"foobar2"),
        ]));
        let packet = p.pack_packet(Vec::new(), &source).unwrap();
        assert_eq!(packet.frames.len(), 2);
        assert!(p.pack_packet(Vec::new(), &source).is_none());
    }

    #[test]
    fn retransmissions_take_precedence_and_bundle() {
        let mut p = packer();
        p.queue_stream_frame_for_retransmission(stream_frame(5, b"foobar"));
        p.queue_stream_frame_for_retransmission(stream_frame(7, b"loremipsum"));
        let packet = p.pack_packet(Vec::new(), &NoData).unwrap();
        assert_eq!(packet.frames.len(), 2);
        let raw = String::from_utf8_lossy(&packet.raw).into_owned();
        assert!(raw.contains("foobar"));
        assert!(raw.contains("loremipsum"));
    }

    #[test]
    fn splits_large_retransmissions_across_packets() {
        let mut p = packer();
        p.queue_stream_frame_for_retransmission(stream_frame(5, &vec![b'e'; 2000]));
        let first = p.pack_packet(Vec::new(), &NoData).unwrap();
        assert!(first.raw.len() <= MAX_PACKET_SIZE);
        let second = p.pack_packet(Vec::new(), &NoData).unwrap();
        assert_eq!(second.number, 2);
        let total: usize = first
            .frames
            .iter()
            .chain(second.frames.iter())
            .map(|f| match *f {
                Frame::Stream(ref s) => s.data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 2000);
        assert!(p.pack_packet(Vec::new(), &NoData).is_none());
    }

    #[test]
    fn window_updates_ride_in_two_consecutive_packets() {
        let mut p = packer();
        let wu = WindowUpdateFrame {
            id: StreamId(5),
            byte_offset: 0x8000,
        };
        let first = p
            .pack_packet(vec![Frame::WindowUpdate(wu.clone())], &NoData)
            .unwrap();
        assert_eq!(first.frames, vec![Frame::WindowUpdate(wu.clone())]);
        let second = p.pack_packet(Vec::new(), &NoData).unwrap();
        assert_eq!(second.frames, vec![Frame::WindowUpdate(wu)]);
        assert!(p.pack_packet(Vec::new(), &NoData).is_none());
    }

    #[test]
    fn connection_close_packs_alone() {
        let mut p = packer();
        let packet = p.pack_connection_close(&ConnectionCloseFrame {
            error_code: 16,
            reason: "No recent network activity.".into(),
        });
        let raw = String::from_utf8_lossy(&packet.raw).into_owned();
        assert!(raw.contains("No recent network activity."));
    }

    #[test]
    fn public_reset_contains_prst_tag() {
        let buf = write_public_reset(0x1337, 1, 42);
        assert_eq!(buf[0], 0x0a);
        let raw = String::from_utf8_lossy(&buf).into_owned();
        assert!(raw.contains("PRST"));
    }
}
