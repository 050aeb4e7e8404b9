//! Acknowledgement bookkeeping on both directions.
//!
//! The session consumes these through traits so tests (and alternative
//! congestion controllers) can swap them out. The defaults keep the
//! bookkeeping deliberately small: cumulative acks, RTO-driven
//! retransmission with exponential backoff, and a slow-start congestion
//! window.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use frame::{AckFrame, Frame, StopWaitingFrame, StreamFrame};
use qerr::{ErrorCode, QuicError};
use {ByteCount, PacketNumber, MAX_TRACKED_SENT_PACKETS};

const DEFAULT_TCP_MSS: ByteCount = 1460;
const INITIAL_CONGESTION_WINDOW: ByteCount = 32 * DEFAULT_TCP_MSS;
const MIN_RETRANSMISSION_TIME: Duration = Duration::from_millis(200);
const MAX_RETRANSMISSION_TIME: Duration = Duration::from_secs(60);
const DEFAULT_RETRANSMISSION_TIME: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum AckError {
    #[fail(display = "too many sent packets are awaiting acknowledgement")]
    TooManyTrackedSentPackets,
    #[fail(display = "received a duplicate packet")]
    DuplicatePacket,
    #[fail(display = "received a packet below the stop waiting floor")]
    PacketSmallerThanLastStopWaiting,
}

impl From<AckError> for QuicError {
    fn from(e: AckError) -> QuicError {
        QuicError::new(ErrorCode::INTERNAL_ERROR, &format!("{}", e))
    }
}

/// A sent packet, retained with its full frame list until acknowledged so
/// that retransmissions can re-serialize the stream frames.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_number: PacketNumber,
    pub frames: Vec<Frame>,
    pub entropy_bit: bool,
    pub length: usize,
    pub send_time: Instant,
}

impl Packet {
    /// The stream frames to replay when this packet is declared lost.
    pub fn stream_frames_for_retransmission(&self) -> Vec<StreamFrame> {
        self.frames
            .iter()
            .filter_map(|f| match *f {
                Frame::Stream(ref s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

pub trait SentPacketHandler: Send {
    fn sent_packet(&mut self, packet: Packet) -> Result<(), AckError>;
    fn received_ack(
        &mut self,
        ack: &AckFrame,
        with_packet_number: PacketNumber,
    ) -> Result<(), AckError>;
    fn bytes_in_flight(&self) -> ByteCount;
    fn largest_acked(&self) -> PacketNumber;
    fn get_stop_waiting_frame(&self) -> Option<StopWaitingFrame>;
    fn congestion_allows_sending(&self) -> bool;
    fn check_for_error(&self) -> Result<(), AckError>;
    fn time_of_first_rto(&self) -> Option<Instant>;
    fn probably_has_packet_for_retransmission(&mut self) -> bool;
    fn dequeue_packet_for_retransmission(&mut self) -> Option<Packet>;
}

pub trait ReceivedPacketHandler: Send {
    fn received_packet(
        &mut self,
        packet_number: PacketNumber,
        entropy_bit: bool,
    ) -> Result<(), AckError>;
    fn received_stop_waiting(&mut self, frame: &StopWaitingFrame) -> Result<(), AckError>;
    /// The pending ACK, if one is owed. With `dequeue` the ACK is consumed
    /// and not offered again until another packet arrives.
    fn get_ack_frame(&mut self, dequeue: bool) -> Option<AckFrame>;
}

pub struct SentPacketHandlerImpl {
    packet_history: BTreeMap<PacketNumber, Packet>,
    retransmission_queue: Vec<Packet>,
    bytes_in_flight: ByteCount,
    congestion_window: ByteCount,
    largest_acked: PacketNumber,
    rto_count: u32,
    smoothed_rtt: Option<Duration>,
    mean_deviation: Duration,
}

impl SentPacketHandlerImpl {
    pub fn new() -> SentPacketHandlerImpl {
        SentPacketHandlerImpl {
            packet_history: BTreeMap::new(),
            retransmission_queue: Vec::new(),
            bytes_in_flight: 0,
            congestion_window: INITIAL_CONGESTION_WINDOW,
            largest_acked: 0,
            rto_count: 0,
            smoothed_rtt: None,
            mean_deviation: Duration::from_millis(0),
        }
    }

    fn current_rto(&self) -> Duration {
        let rto = match self.smoothed_rtt {
            Some(srtt) => (srtt + 4 * self.mean_deviation).max(MIN_RETRANSMISSION_TIME),
            None => DEFAULT_RETRANSMISSION_TIME,
        };
        rto.checked_mul(2u32.saturating_pow(self.rto_count.min(16)))
            .unwrap_or(MAX_RETRANSMISSION_TIME)
            .min(MAX_RETRANSMISSION_TIME)
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.smoothed_rtt {
            None => {
                self.smoothed_rtt = Some(sample);
                self.mean_deviation = sample / 2;
            }
            Some(srtt) => {
                let delta = if sample > srtt {
                    sample - srtt
                } else {
                    srtt - sample
                };
                self.mean_deviation = (3 * self.mean_deviation + delta) / 4;
                self.smoothed_rtt = Some((7 * srtt + sample) / 8);
            }
        }
    }

    /// Moves the oldest in-flight packet to the retransmission queue once
    /// its RTO has passed.
    fn maybe_queue_rtos(&mut self) {
        let now = Instant::now();
        while let Some(deadline) = self.time_of_first_rto() {
            if deadline > now {
                return;
            }
            let number = match self.packet_history.keys().next() {
                Some(&n) => n,
                None => return,
            };
            let packet = self
                .packet_history
                .remove(&number)
                .expect("first key must be present");
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.length as u64);
            self.retransmission_queue.push(packet);
            self.rto_count += 1;
        }
    }
}

impl SentPacketHandler for SentPacketHandlerImpl {
    fn sent_packet(&mut self, mut packet: Packet) -> Result<(), AckError> {
        packet.send_time = Instant::now();
        self.bytes_in_flight += packet.length as u64;
        self.packet_history.insert(packet.packet_number, packet);
        Ok(())
    }

    fn received_ack(
        &mut self,
        ack: &AckFrame,
        _with_packet_number: PacketNumber,
    ) -> Result<(), AckError> {
        if ack.largest_observed <= self.largest_acked && self.largest_acked != 0 {
            // duplicate or reordered ack; not an error
            return Ok(());
        }
        if let Some(info) = self.packet_history.get(&ack.largest_observed) {
            let sample = info.send_time.elapsed();
            self.update_rtt(sample);
        }
        self.largest_acked = ack.largest_observed;
        let acked: Vec<PacketNumber> = self
            .packet_history
            .range(..=ack.largest_observed)
            .map(|(&n, _)| n)
            .collect();
        for number in acked {
            let packet = self
                .packet_history
                .remove(&number)
                .expect("ranged key must be present");
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.length as u64);
            // slow start
            self.congestion_window += packet.length as u64;
        }
        self.rto_count = 0;
        Ok(())
    }

    fn bytes_in_flight(&self) -> ByteCount {
        self.bytes_in_flight
    }

    fn largest_acked(&self) -> PacketNumber {
        self.largest_acked
    }

    fn get_stop_waiting_frame(&self) -> Option<StopWaitingFrame> {
        if self.largest_acked == 0 {
            return None;
        }
        Some(StopWaitingFrame {
            least_unacked: self.largest_acked + 1,
        })
    }

    fn congestion_allows_sending(&self) -> bool {
        self.bytes_in_flight < self.congestion_window
    }

    fn check_for_error(&self) -> Result<(), AckError> {
        if self.packet_history.len() > MAX_TRACKED_SENT_PACKETS {
            return Err(AckError::TooManyTrackedSentPackets);
        }
        Ok(())
    }

    fn time_of_first_rto(&self) -> Option<Instant> {
        let oldest = self.packet_history.values().next()?;
        Some(oldest.send_time + self.current_rto())
    }

    fn probably_has_packet_for_retransmission(&mut self) -> bool {
        self.maybe_queue_rtos();
        !self.retransmission_queue.is_empty()
    }

    fn dequeue_packet_for_retransmission(&mut self) -> Option<Packet> {
        if !self.probably_has_packet_for_retransmission() {
            return None;
        }
        Some(self.retransmission_queue.remove(0))
    }
}

/// Cumulative entropy of received packets: each entropy-flagged packet flips
/// the bit indexed by its packet number.
#[derive(Debug, Default, Copy, Clone)]
struct EntropyAccumulator(u8);

impl EntropyAccumulator {
    fn add(&mut self, packet_number: PacketNumber, entropy_bit: bool) {
        if entropy_bit {
            self.0 ^= 1 << (packet_number % 8);
        }
    }
}

pub struct ReceivedPacketHandlerImpl {
    largest_observed: PacketNumber,
    ignore_packets_below: PacketNumber,
    received: FnvHashSet<PacketNumber>,
    entropy: EntropyAccumulator,
    ack_queued: bool,
    largest_observed_received_time: Instant,
}

impl ReceivedPacketHandlerImpl {
    pub fn new() -> ReceivedPacketHandlerImpl {
        ReceivedPacketHandlerImpl {
            largest_observed: 0,
            ignore_packets_below: 0,
            received: FnvHashSet::default(),
            entropy: EntropyAccumulator::default(),
            ack_queued: false,
            largest_observed_received_time: Instant::now(),
        }
    }
}

impl ReceivedPacketHandler for ReceivedPacketHandlerImpl {
    fn received_packet(
        &mut self,
        packet_number: PacketNumber,
        entropy_bit: bool,
    ) -> Result<(), AckError> {
        if packet_number != 0 && packet_number <= self.ignore_packets_below {
            return Err(AckError::PacketSmallerThanLastStopWaiting);
        }
        if !self.received.insert(packet_number) {
            return Err(AckError::DuplicatePacket);
        }
        self.entropy.add(packet_number, entropy_bit);
        if packet_number > self.largest_observed {
            self.largest_observed = packet_number;
            self.largest_observed_received_time = Instant::now();
        }
        self.ack_queued = true;
        Ok(())
    }

    fn received_stop_waiting(&mut self, frame: &StopWaitingFrame) -> Result<(), AckError> {
        if frame.least_unacked == 0 {
            return Ok(());
        }
        let floor = frame.least_unacked - 1;
        if floor > self.ignore_packets_below {
            self.ignore_packets_below = floor;
            self.received.retain(|&n| n > floor);
        }
        Ok(())
    }

    fn get_ack_frame(&mut self, dequeue: bool) -> Option<AckFrame> {
        if !self.ack_queued {
            return None;
        }
        let elapsed = self.largest_observed_received_time.elapsed();
        let frame = AckFrame {
            largest_observed: self.largest_observed,
            entropy: self.entropy.0,
            delay_time_us: elapsed.as_micros().min(u128::from(u16::max_value())) as u16,
        };
        if dequeue {
            self.ack_queued = false;
        }
        Some(frame)
    }
}
