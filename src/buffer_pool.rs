//! Process-wide recycling of packet-sized buffers.
//!
//! Purely a performance optimization: callers always receive an empty buffer
//! with room for a full packet, whatever the pool's backing does.

use parking_lot::Mutex;

use MAX_PACKET_SIZE;

const POOL_LIMIT: usize = 32;

lazy_static! {
    static ref PACKET_BUFFERS: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());
}

/// Returns an empty buffer with capacity for a full packet.
pub fn get_packet_buffer() -> Vec<u8> {
    match PACKET_BUFFERS.lock().pop() {
        Some(buf) => buf,
        None => Vec::with_capacity(MAX_PACKET_SIZE),
    }
}

/// Recycles a buffer obtained from `get_packet_buffer`. Contents are
/// discarded; undersized buffers are dropped.
pub fn put_packet_buffer(mut buf: Vec<u8>) {
    if buf.capacity() < MAX_PACKET_SIZE {
        return;
    }
    buf.clear();
    let mut pool = PACKET_BUFFERS.lock();
    if pool.len() < POOL_LIMIT {
        pool.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_buffers_of_correct_len_and_cap() {
        let buf = get_packet_buffer();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= MAX_PACKET_SIZE);
    }

    #[test]
    fn zeroes_put_buffers_length() {
        for _ in 0..1000 {
            let mut buf = get_packet_buffer();
            buf.extend_from_slice(&[0xab; 10]);
            put_packet_buffer(buf);
            let buf = get_packet_buffer();
            assert_eq!(buf.len(), 0);
            assert!(buf.capacity() >= MAX_PACKET_SIZE);
            put_packet_buffer(buf);
        }
    }
}
