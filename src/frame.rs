//! Frame model and the legacy gQUIC wire layout.
//!
//! Stream frames use a variable-length type byte (FIN, data-length-present,
//! offset length, id length); all other frames have fixed single-byte types.
//! Integers are little-endian. A zero type byte means the rest of the packet
//! is padding.

use bytes::Bytes;

use coding;
use qerr::{ErrorCode, QuicError};
use {ByteCount, PacketNumber, StreamId};

const TYPE_RST_STREAM: u8 = 0x01;
const TYPE_CONNECTION_CLOSE: u8 = 0x02;
const TYPE_GOAWAY: u8 = 0x03;
const TYPE_WINDOW_UPDATE: u8 = 0x04;
const TYPE_BLOCKED: u8 = 0x05;
const TYPE_STOP_WAITING: u8 = 0x06;
const TYPE_PING: u8 = 0x07;
const FLAG_STREAM: u8 = 0x80;
const FLAG_ACK: u8 = 0x40;

const STREAM_FLAG_FIN: u8 = 0x40;
const STREAM_FLAG_DATA_LEN: u8 = 0x20;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Stream(StreamFrame),
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    RstStream(RstStreamFrame),
    Ping,
    ConnectionClose(ConnectionCloseFrame),
    Goaway(GoawayFrame),
}

impl Frame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        match *self {
            Frame::Stream(ref f) => f.write(buf),
            Frame::Ack(ref f) => f.write(buf),
            Frame::StopWaiting(ref f) => f.write(buf),
            Frame::WindowUpdate(ref f) => f.write(buf),
            Frame::Blocked(ref f) => f.write(buf),
            Frame::RstStream(ref f) => f.write(buf),
            Frame::Ping => buf.push(TYPE_PING),
            Frame::ConnectionClose(ref f) => f.write(buf),
            Frame::Goaway(ref f) => f.write(buf),
        }
    }

    /// Smallest possible on-wire size; the packer uses this for capacity
    /// checks before serializing.
    pub fn min_length(&self) -> usize {
        match *self {
            Frame::Stream(ref f) => f.header_length(),
            Frame::Ack(_) => 11,
            Frame::StopWaiting(_) => 7,
            Frame::WindowUpdate(_) => 13,
            Frame::Blocked(_) => 5,
            Frame::RstStream(_) => 17,
            Frame::Ping => 1,
            Frame::ConnectionClose(ref f) => 7 + f.reason.len(),
            Frame::Goaway(ref f) => 11 + f.reason.len(),
        }
    }

    /// Decodes all frames of a packet payload. Padding terminates the
    /// payload; a truncated or unknown frame is `InvalidFrameData`.
    pub fn parse_all(payload: &[u8]) -> Result<Vec<Frame>, QuicError> {
        let mut frames = Vec::new();
        let mut r = payload;
        while let Some(&ty) = r.first() {
            if ty == 0 {
                break; // padding
            }
            r = &r[1..];
            let frame = if ty & FLAG_STREAM != 0 {
                Frame::Stream(StreamFrame::parse(ty, &mut r)?)
            } else if ty & FLAG_ACK != 0 {
                Frame::Ack(AckFrame::parse(&mut r)?)
            } else {
                match ty {
                    TYPE_RST_STREAM => Frame::RstStream(RstStreamFrame::parse(&mut r)?),
                    TYPE_CONNECTION_CLOSE => {
                        Frame::ConnectionClose(ConnectionCloseFrame::parse(&mut r)?)
                    }
                    TYPE_GOAWAY => Frame::Goaway(GoawayFrame::parse(&mut r)?),
                    TYPE_WINDOW_UPDATE => Frame::WindowUpdate(WindowUpdateFrame::parse(&mut r)?),
                    TYPE_BLOCKED => Frame::Blocked(BlockedFrame::parse(&mut r)?),
                    TYPE_STOP_WAITING => Frame::StopWaiting(StopWaitingFrame::parse(&mut r)?),
                    TYPE_PING => Frame::Ping,
                    _ => {
                        return Err(QuicError::new(
                            ErrorCode::INVALID_FRAME_DATA,
                            &format!("unknown frame type {:#x}", ty),
                        ));
                    }
                }
            };
            frames.push(frame);
        }
        Ok(frames)
    }
}

fn short_read(_: ::std::io::Error) -> QuicError {
    QuicError::new(ErrorCode::INVALID_FRAME_DATA, "truncated frame")
}

/// Application (or crypto) data at a byte offset of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub id: StreamId,
    pub offset: ByteCount,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    fn id_length(&self) -> usize {
        match self.id.0 {
            0..=0xff => 1,
            0x100..=0xffff => 2,
            0x1_0000..=0xff_ffff => 3,
            _ => 4,
        }
    }

    fn offset_length(&self) -> usize {
        match self.offset {
            0 => 0,
            1..=0xffff => 2,
            0x1_0000..=0xff_ffff => 3,
            0x100_0000..=0xffff_ffff => 4,
            0x1_0000_0000..=0xff_ffff_ffff => 5,
            0x100_0000_0000..=0xffff_ffff_ffff => 6,
            0x1_0000_0000_0000..=0xff_ffff_ffff_ffff => 7,
            _ => 8,
        }
    }

    /// On-wire size excluding the data itself. The data length field is
    /// always present so frames can bundle.
    pub fn header_length(&self) -> usize {
        1 + self.id_length() + self.offset_length() + 2
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        let id_len = self.id_length();
        let offset_len = self.offset_length();
        let mut ty = FLAG_STREAM | STREAM_FLAG_DATA_LEN;
        if self.fin {
            ty |= STREAM_FLAG_FIN;
        }
        if offset_len > 0 {
            ty |= ((offset_len - 1) as u8) << 2;
        }
        ty |= (id_len - 1) as u8;
        buf.push(ty);
        coding::write_uint(buf, u64::from(self.id.0), id_len);
        if offset_len > 0 {
            coding::write_uint(buf, self.offset, offset_len);
        }
        coding::write_u16(buf, self.data.len() as u16);
        buf.extend_from_slice(&self.data);
    }

    fn parse(ty: u8, r: &mut &[u8]) -> Result<StreamFrame, QuicError> {
        let fin = ty & STREAM_FLAG_FIN != 0;
        let data_len_present = ty & STREAM_FLAG_DATA_LEN != 0;
        let offset_len = match (ty >> 2) & 0x07 {
            0 => 0,
            n => n as usize + 1,
        };
        let id_len = (ty & 0x03) as usize + 1;
        let id = StreamId(coding::read_uint(r, id_len).map_err(short_read)? as u32);
        let offset = if offset_len > 0 {
            coding::read_uint(r, offset_len).map_err(short_read)?
        } else {
            0
        };
        let data_len = if data_len_present {
            coding::read_u16(r).map_err(short_read)? as usize
        } else {
            r.len()
        };
        if data_len > r.len() {
            return Err(QuicError::new(
                ErrorCode::INVALID_FRAME_DATA,
                "stream frame data exceeds packet",
            ));
        }
        let data = Bytes::from(&r[..data_len]);
        *r = &r[data_len..];
        Ok(StreamFrame {
            id,
            offset,
            data,
            fin,
        })
    }

    /// Splits off the first `n` bytes into their own frame, leaving the
    /// remainder (which keeps the FIN bit) in `self`.
    pub fn split_off_head(&mut self, n: usize) -> StreamFrame {
        debug_assert!(n < self.data.len());
        let head = self.data.split_to(n);
        let frame = StreamFrame {
            id: self.id,
            offset: self.offset,
            data: head,
            fin: false,
        };
        self.offset += n as u64;
        frame
    }
}

/// Acknowledges everything up to `largest_observed`, with the cumulative
/// entropy of the received packets.
#[derive(Debug, Clone, PartialEq)]
pub struct AckFrame {
    pub largest_observed: PacketNumber,
    pub entropy: u8,
    pub delay_time_us: u16,
}

impl AckFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(FLAG_ACK);
        buf.push(self.entropy);
        coding::write_u48(buf, self.largest_observed);
        coding::write_u16(buf, self.delay_time_us);
        buf.push(0); // no timestamps
    }

    fn parse(r: &mut &[u8]) -> Result<AckFrame, QuicError> {
        let entropy = coding::read_uint(r, 1).map_err(short_read)? as u8;
        let largest_observed = coding::read_uint(r, 6).map_err(short_read)?;
        let delay_time_us = coding::read_u16(r).map_err(short_read)?;
        let num_timestamps = coding::read_uint(r, 1).map_err(short_read)?;
        if num_timestamps != 0 {
            return Err(QuicError::new(
                ErrorCode::INVALID_FRAME_DATA,
                "ack timestamps are not supported",
            ));
        }
        Ok(AckFrame {
            largest_observed,
            entropy,
            delay_time_us,
        })
    }
}

/// Advances the sender's least-unacked floor; peers drop packet numbers
/// below it.
#[derive(Debug, Clone, PartialEq)]
pub struct StopWaitingFrame {
    pub least_unacked: PacketNumber,
}

impl StopWaitingFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_STOP_WAITING);
        coding::write_u48(buf, self.least_unacked);
    }

    fn parse(r: &mut &[u8]) -> Result<StopWaitingFrame, QuicError> {
        Ok(StopWaitingFrame {
            least_unacked: coding::read_uint(r, 6).map_err(short_read)?,
        })
    }
}

/// Extends the receiver's advertised byte limit for one stream, or for the
/// connection when the id is 0.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUpdateFrame {
    pub id: StreamId,
    pub byte_offset: ByteCount,
}

impl WindowUpdateFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_WINDOW_UPDATE);
        coding::write_u32(buf, self.id.0);
        coding::write_u64(buf, self.byte_offset);
    }

    fn parse(r: &mut &[u8]) -> Result<WindowUpdateFrame, QuicError> {
        Ok(WindowUpdateFrame {
            id: StreamId(coding::read_u32(r).map_err(short_read)?),
            byte_offset: coding::read_u64(r).map_err(short_read)?,
        })
    }
}

/// Advisory: the sender has data but no flow control allowance.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedFrame {
    pub id: StreamId,
}

impl BlockedFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_BLOCKED);
        coding::write_u32(buf, self.id.0);
    }

    fn parse(r: &mut &[u8]) -> Result<BlockedFrame, QuicError> {
        Ok(BlockedFrame {
            id: StreamId(coding::read_u32(r).map_err(short_read)?),
        })
    }
}

/// Abrupt per-stream termination.
#[derive(Debug, Clone, PartialEq)]
pub struct RstStreamFrame {
    pub id: StreamId,
    pub byte_offset: ByteCount,
    pub error_code: u32,
}

impl RstStreamFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_RST_STREAM);
        coding::write_u32(buf, self.id.0);
        coding::write_u64(buf, self.byte_offset);
        coding::write_u32(buf, self.error_code);
    }

    fn parse(r: &mut &[u8]) -> Result<RstStreamFrame, QuicError> {
        Ok(RstStreamFrame {
            id: StreamId(coding::read_u32(r).map_err(short_read)?),
            byte_offset: coding::read_u64(r).map_err(short_read)?,
            error_code: coding::read_u32(r).map_err(short_read)?,
        })
    }
}

/// Terminates the connection with an error code and reason phrase.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionCloseFrame {
    pub error_code: u32,
    pub reason: String,
}

impl ConnectionCloseFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_CONNECTION_CLOSE);
        coding::write_u32(buf, self.error_code);
        coding::write_u16(buf, self.reason.len() as u16);
        buf.extend_from_slice(self.reason.as_bytes());
    }

    fn parse(r: &mut &[u8]) -> Result<ConnectionCloseFrame, QuicError> {
        let error_code = coding::read_u32(r).map_err(short_read)?;
        let reason_len = coding::read_u16(r).map_err(short_read)? as usize;
        if reason_len > r.len() {
            return Err(QuicError::new(
                ErrorCode::INVALID_FRAME_DATA,
                "reason phrase exceeds packet",
            ));
        }
        let reason = String::from_utf8_lossy(&r[..reason_len]).into_owned();
        *r = &r[reason_len..];
        Ok(ConnectionCloseFrame { error_code, reason })
    }
}

/// Graceful shutdown announcement naming the last processed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GoawayFrame {
    pub error_code: u32,
    pub last_good_stream: StreamId,
    pub reason: String,
}

impl GoawayFrame {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.push(TYPE_GOAWAY);
        coding::write_u32(buf, self.error_code);
        coding::write_u32(buf, self.last_good_stream.0);
        coding::write_u16(buf, self.reason.len() as u16);
        buf.extend_from_slice(self.reason.as_bytes());
    }

    fn parse(r: &mut &[u8]) -> Result<GoawayFrame, QuicError> {
        let error_code = coding::read_u32(r).map_err(short_read)?;
        let last_good_stream = StreamId(coding::read_u32(r).map_err(short_read)?);
        let reason_len = coding::read_u16(r).map_err(short_read)? as usize;
        if reason_len > r.len() {
            return Err(QuicError::new(
                ErrorCode::INVALID_FRAME_DATA,
                "reason phrase exceeds packet",
            ));
        }
        let reason = String::from_utf8_lossy(&r[..reason_len]).into_owned();
        *r = &r[reason_len..];
        Ok(GoawayFrame {
            error_code,
            last_good_stream,
            reason,
        })
    }
}
