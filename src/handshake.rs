//! The tagged-message codec used by the cryptographic handshake.
//!
//! A handshake message is a message tag, an entry count, and a sorted index
//! of `{tag, cumulative end offset}` pairs followed by the concatenated
//! values. Everything is little-endian. The same layout frames CHLO, SHLO,
//! REJ, SCFG and the public reset body.

use std::fmt;
use std::io::Read;

use byteorder::{ByteOrder, LittleEndian};
use fnv::FnvHashMap;

use coding;
use qerr::{ErrorCode, QuicError};
use {CRYPTO_MAX_PARAMS, CRYPTO_PARAMETER_MAX_LENGTH};

/// A four-character code, stored little-endian.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Tag(pub u32);

const fn tag(b: &[u8; 4]) -> Tag {
    Tag((b[0] as u32) | (b[1] as u32) << 8 | (b[2] as u32) << 16 | (b[3] as u32) << 24)
}

pub mod tags {
    use super::{tag, Tag};

    // Message tags
    pub const CHLO: Tag = tag(b"CHLO");
    pub const SHLO: Tag = tag(b"SHLO");
    pub const REJ: Tag = tag(b"REJ\0");
    pub const SCFG: Tag = tag(b"SCFG");
    pub const PRST: Tag = tag(b"PRST");

    // Negotiated parameters
    pub const ICSL: Tag = tag(b"ICSL");
    pub const CFCW: Tag = tag(b"CFCW");
    pub const SFCW: Tag = tag(b"SFCW");
    pub const MSPC: Tag = tag(b"MSPC");
    pub const TCID: Tag = tag(b"TCID");

    // Server config & key exchange
    pub const SCID: Tag = tag(b"SCID");
    pub const KEXS: Tag = tag(b"KEXS");
    pub const AEAD: Tag = tag(b"AEAD");
    pub const PUBS: Tag = tag(b"PUBS");
    pub const NONC: Tag = tag(b"NONC");
    pub const OBIT: Tag = tag(b"OBIT");
    pub const EXPY: Tag = tag(b"EXPY");
    pub const VER: Tag = tag(b"VER\0");
    pub const SNO: Tag = tag(b"SNO\0");

    // Public reset
    pub const RNON: Tag = tag(b"RNON");
    pub const RSEQ: Tag = tag(b"RSEQ");

    pub const PAD: Tag = tag(b"PAD\0");
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut b = [0; 4];
        LittleEndian::write_u32(&mut b, self.0);
        for c in &mut b {
            if *c == 0 {
                *c = b' ';
            }
        }
        write!(f, "{}", String::from_utf8_lossy(&b))
    }
}

/// A parsed or to-be-written handshake message.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeMessage {
    pub tag: Tag,
    pub values: FnvHashMap<Tag, Vec<u8>>,
}

impl HandshakeMessage {
    pub fn new(tag: Tag) -> Self {
        HandshakeMessage {
            tag,
            values: FnvHashMap::default(),
        }
    }

    pub fn insert(&mut self, tag: Tag, value: &[u8]) {
        self.values.insert(tag, value.to_vec());
    }

    /// Reads one message. Length inconsistencies are rejected before any
    /// value beyond the cap is buffered.
    pub fn parse<R: Read>(r: &mut R) -> Result<HandshakeMessage, QuicError> {
        let message_tag = Tag(coding::read_u32(r).map_err(truncated)?);
        let n_pairs = coding::read_u16(r).map_err(truncated)? as usize;
        coding::read_u16(r).map_err(truncated)?; // reserved

        if n_pairs > CRYPTO_MAX_PARAMS {
            return Err(QuicError::new(
                ErrorCode::CRYPTO_TOO_MANY_ENTRIES,
                "too many handshake message entries",
            ));
        }

        let mut index = vec![0; n_pairs * 8];
        r.read_exact(&mut index).map_err(truncated)?;

        let mut values = FnvHashMap::default();
        let mut data_start = 0u32;
        for entry in index.chunks(8) {
            let tag = Tag(LittleEndian::read_u32(&entry[..4]));
            let data_end = LittleEndian::read_u32(&entry[4..]);
            let data_len = match data_end.checked_sub(data_start) {
                Some(len) if len as usize <= CRYPTO_PARAMETER_MAX_LENGTH => len as usize,
                _ => {
                    return Err(QuicError::new(
                        ErrorCode::CRYPTO_INVALID_VALUE_LENGTH,
                        "value too long",
                    ));
                }
            };
            let mut data = vec![0; data_len];
            r.read_exact(&mut data).map_err(truncated)?;
            values.insert(tag, data);
            data_start = data_end;
        }

        Ok(HandshakeMessage {
            tag: message_tag,
            values,
        })
    }

    /// Writes the message. Values are emitted in ascending tag order; the
    /// unordered map is sorted deterministically for interoperability.
    pub fn write(&self, buf: &mut Vec<u8>) {
        coding::write_u32(buf, self.tag.0);
        coding::write_u16(buf, self.values.len() as u16);
        coding::write_u16(buf, 0);

        let index_start = buf.len();
        buf.resize(index_start + 8 * self.values.len(), 0);

        let mut tags: Vec<Tag> = self.values.keys().cloned().collect();
        tags.sort();

        let mut offset = 0u32;
        for (i, t) in tags.iter().enumerate() {
            let value = &self.values[t];
            buf.extend_from_slice(value);
            offset += value.len() as u32;
            let entry = index_start + i * 8;
            LittleEndian::write_u32(&mut buf[entry..entry + 4], t.0);
            LittleEndian::write_u32(&mut buf[entry + 4..entry + 8], offset);
        }
    }
}

fn truncated(_: ::std::io::Error) -> QuicError {
    QuicError::new(ErrorCode::HANDSHAKE_FAILED, "truncated handshake message")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &HandshakeMessage) -> HandshakeMessage {
        let mut buf = Vec::new();
        msg.write(&mut buf);
        HandshakeMessage::parse(&mut &buf[..]).unwrap()
    }

    #[test]
    fn tags_read_as_ascii() {
        assert_eq!(tags::CHLO.0, 0x4f4c_4843);
        assert_eq!(format!("{}", tags::CHLO), "CHLO");
        assert_eq!(format!("{}", tags::REJ), "REJ ");
    }

    #[test]
    fn parses_a_sample_message() {
        // CHLO, 2 entries, reserved, index {PAD ends at 4, SNI ends at 10},
        // then the values 0xdeadbeef and "exampl"
        let data =
            hex!("43484c4f020000005041440004000000534e49000a000000deadbeef6578616d706c");
        let msg = HandshakeMessage::parse(&mut &data[..]).unwrap();
        assert_eq!(msg.tag, tags::CHLO);
        assert_eq!(msg.values.len(), 2);
        assert_eq!(msg.values[&tags::PAD], hex!("deadbeef"));
        assert_eq!(msg.values[&Tag(0x0049_4e53)], b"exampl");
    }

    #[test]
    fn writes_values_in_ascending_tag_order() {
        let mut msg = HandshakeMessage::new(tags::CHLO);
        msg.insert(Tag(0xff), b"bb");
        msg.insert(Tag(0x01), b"aaaa");
        let mut buf = Vec::new();
        msg.write(&mut buf);
        // header
        assert_eq!(&buf[..4], &hex!("43484c4f")[..]);
        assert_eq!(&buf[4..8], &hex!("02000000")[..]);
        // index: tag 0x01 ends at 4, tag 0xff ends at 6
        assert_eq!(&buf[8..16], &hex!("0100000004000000")[..]);
        assert_eq!(&buf[16..24], &hex!("ff00000006000000")[..]);
        assert_eq!(&buf[24..], &b"aaaabb"[..]);
    }

    #[test]
    fn round_trips_arbitrary_maps() {
        let mut msg = HandshakeMessage::new(tags::SHLO);
        msg.insert(tags::ICSL, &[30, 0, 0, 0]);
        msg.insert(tags::MSPC, &[100, 0, 0, 0]);
        msg.insert(tags::SNO, &[0xab; 52]);
        msg.insert(tags::PAD, &[]);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn rejects_too_many_entries() {
        let mut buf = Vec::new();
        coding::write_u32(&mut buf, tags::CHLO.0);
        coding::write_u16(&mut buf, (CRYPTO_MAX_PARAMS + 1) as u16);
        coding::write_u16(&mut buf, 0);
        let err = HandshakeMessage::parse(&mut &buf[..]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CRYPTO_TOO_MANY_ENTRIES);
    }

    #[test]
    fn rejects_oversized_values() {
        let mut msg = HandshakeMessage::new(tags::CHLO);
        msg.insert(tags::PAD, &vec![0; CRYPTO_PARAMETER_MAX_LENGTH + 1]);
        let mut buf = Vec::new();
        msg.write(&mut buf);
        let err = HandshakeMessage::parse(&mut &buf[..]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CRYPTO_INVALID_VALUE_LENGTH);
    }

    #[test]
    fn rejects_non_monotonic_index() {
        let mut buf = Vec::new();
        coding::write_u32(&mut buf, tags::CHLO.0);
        coding::write_u16(&mut buf, 2);
        coding::write_u16(&mut buf, 0);
        coding::write_u32(&mut buf, tags::PAD.0);
        coding::write_u32(&mut buf, 8);
        coding::write_u32(&mut buf, tags::SNO.0);
        coding::write_u32(&mut buf, 4); // ends before the previous entry
        buf.extend_from_slice(&[0; 8]);
        let err = HandshakeMessage::parse(&mut &buf[..]).unwrap_err();
        assert_eq!(err.code, ErrorCode::CRYPTO_INVALID_VALUE_LENGTH);
    }

    #[test]
    fn fails_on_truncated_input() {
        let mut msg = HandshakeMessage::new(tags::CHLO);
        msg.insert(tags::PAD, b"0123456789");
        let mut buf = Vec::new();
        msg.write(&mut buf);
        let err = HandshakeMessage::parse(&mut &buf[..buf.len() - 4]).unwrap_err();
        assert_eq!(err.code, ErrorCode::HANDSHAKE_FAILED);
    }
}
