//! Packet protection and the crypto-stream state machine.
//!
//! Key exchange and forward-secure AEADs are external; this module owns the
//! seams (`KeyExchange`, `Aead`), the gQUIC null AEAD used until
//! forward-secure keys exist, and the server side of the CHLO/REJ/SHLO
//! exchange that drives them.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use rand::{thread_rng, RngCore};
use slog::Logger;

use handshake::{tags, HandshakeMessage};
use qerr::{ErrorCode, QuicError};
use stream::Stream;
use transport_parameters::ConnectionParameters;
use PacketNumber;

/// Bytes the AEAD prepends to every sealed payload.
pub const AEAD_TAG_SIZE: usize = 12;

/// Packet protection primitive. The forward-secure implementation is
/// provided externally once the key exchange completes.
pub trait Aead: Send + Sync {
    fn seal(&self, packet_number: PacketNumber, associated_data: &[u8], plaintext: &[u8])
        -> Vec<u8>;
    fn open(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, QuicError>;
}

/// Key exchange primitive backing the server config.
pub trait KeyExchange: Send + Sync {
    fn public_key(&self) -> &[u8];
    fn shared_key(&self, peer_public: &[u8]) -> Result<Vec<u8>, QuicError>;
}

/// The null AEAD: a 12-byte FNV-1a-128 tag over associated data and
/// plaintext, prepended to the payload. No confidentiality, integrity only.
pub struct NullAead;

impl Aead for NullAead {
    fn seal(&self, _: PacketNumber, associated_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let hash = fnv1a_128(&[associated_data, plaintext]);
        let mut out = Vec::with_capacity(AEAD_TAG_SIZE + plaintext.len());
        out.extend_from_slice(&tag_bytes(hash));
        out.extend_from_slice(plaintext);
        out
    }

    fn open(
        &self,
        _: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, QuicError> {
        if ciphertext.len() < AEAD_TAG_SIZE {
            return Err(decryption_failure());
        }
        let hash = fnv1a_128(&[associated_data, &ciphertext[AEAD_TAG_SIZE..]]);
        if tag_bytes(hash) != ciphertext[..AEAD_TAG_SIZE] {
            return Err(decryption_failure());
        }
        Ok(ciphertext[AEAD_TAG_SIZE..].to_vec())
    }
}

fn decryption_failure() -> QuicError {
    QuicError::new(
        ErrorCode::DECRYPTION_FAILURE,
        "failed to authenticate received data",
    )
}

fn fnv1a_128(parts: &[&[u8]]) -> u128 {
    const OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
    const PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;
    let mut hash = OFFSET_BASIS;
    for part in parts {
        for &byte in *part {
            hash ^= u128::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

fn tag_bytes(hash: u128) -> [u8; AEAD_TAG_SIZE] {
    let mut tag = [0; AEAD_TAG_SIZE];
    tag[..8].copy_from_slice(&(hash as u64).to_le_bytes());
    tag[8..].copy_from_slice(&((hash >> 64) as u32).to_le_bytes());
    tag
}

/// Long-lived server parameters: the config id and the key-exchange keys
/// advertised in the SCFG.
pub struct ServerConfig {
    id: [u8; 16],
    orbit: [u8; 8],
    kex: Box<dyn KeyExchange>,
}

impl ServerConfig {
    pub fn new(kex: Box<dyn KeyExchange>) -> Arc<ServerConfig> {
        let mut id = [0; 16];
        let mut orbit = [0; 8];
        thread_rng().fill_bytes(&mut id);
        thread_rng().fill_bytes(&mut orbit);
        Arc::new(ServerConfig { id, orbit, kex })
    }

    pub fn id(&self) -> &[u8; 16] {
        &self.id
    }

    /// The SCFG message as sent inside a REJ.
    pub fn serialized(&self) -> Vec<u8> {
        let mut msg = HandshakeMessage::new(tags::SCFG);
        msg.insert(tags::SCID, &self.id);
        msg.insert(tags::KEXS, b"C255");
        msg.insert(tags::AEAD, b"AESG");
        msg.insert(tags::PUBS, self.kex.public_key());
        msg.insert(tags::OBIT, &self.orbit);
        msg.insert(tags::EXPY, &[0xff; 8]);
        let mut buf = Vec::new();
        msg.write(&mut buf);
        buf
    }
}

/// Per-connection crypto state: drives the crypto stream and protects
/// packets. Until the handshake completes, everything uses the null AEAD;
/// the session learns about new keys through the `aead_changed` channel and
/// then retries its stashed undecryptable packets.
pub struct CryptoSetup {
    log: Logger,
    params: Arc<ConnectionParameters>,
    server_config: Arc<ServerConfig>,
    forward_secure: AtomicBool,
    forward_secure_aead: Mutex<Option<Box<dyn Aead>>>,
    null_aead: NullAead,
    aead_changed: Sender<()>,
}

impl CryptoSetup {
    pub fn new(
        log: Logger,
        params: Arc<ConnectionParameters>,
        server_config: Arc<ServerConfig>,
        aead_changed: Sender<()>,
    ) -> Arc<CryptoSetup> {
        Arc::new(CryptoSetup {
            log,
            params,
            server_config,
            forward_secure: AtomicBool::new(false),
            forward_secure_aead: Mutex::new(None),
            null_aead: NullAead,
            aead_changed,
        })
    }

    /// Whether forward-secure keys have been established.
    pub fn handshake_complete(&self) -> bool {
        self.forward_secure.load(Ordering::Acquire)
    }

    /// Installs the externally derived forward-secure AEAD.
    pub fn set_forward_secure_aead(&self, aead: Box<dyn Aead>) {
        *self.forward_secure_aead.lock() = Some(aead);
    }

    pub fn seal(&self, packet_number: PacketNumber, associated: &[u8], plaintext: &[u8]) -> Vec<u8> {
        if self.handshake_complete() {
            if let Some(ref aead) = *self.forward_secure_aead.lock() {
                return aead.seal(packet_number, associated, plaintext);
            }
        }
        self.null_aead.seal(packet_number, associated, plaintext)
    }

    pub fn open(
        &self,
        packet_number: PacketNumber,
        associated: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, QuicError> {
        if self.handshake_complete() {
            if let Some(ref aead) = *self.forward_secure_aead.lock() {
                return aead.open(packet_number, associated, ciphertext);
            }
        }
        self.null_aead.open(packet_number, associated, ciphertext)
    }

    /// Reads handshake messages off the crypto stream until the stream dies.
    /// Runs on its own thread; the caller turns a returned error into a
    /// session close.
    pub fn handle_crypto_stream(&self, stream: &Stream) -> Result<(), QuicError> {
        loop {
            let msg = HandshakeMessage::parse(&mut CryptoStreamReader(stream))?;
            if msg.tag != tags::CHLO {
                debug!(self.log, "received unexpected crypto message"; "tag" => %msg.tag);
                return Err(QuicError::new(
                    ErrorCode::INVALID_CRYPTO_MESSAGE_TYPE,
                    "expected CHLO",
                ));
            }
            trace!(self.log, "received CHLO"; "entries" => msg.values.len());
            self.params.set_from_map(&msg.values)?;

            let reply = if self.is_full_chlo(&msg) {
                self.finish_handshake()
            } else {
                self.reject()
            };
            let mut buf = Vec::new();
            reply.write(&mut buf);
            if stream.write(&buf).is_err() {
                // session already tearing down
                return Ok(());
            }
        }
    }

    /// A full CHLO names our config and carries the client's key share.
    fn is_full_chlo(&self, msg: &HandshakeMessage) -> bool {
        msg.values.get(&tags::SCID).map(|v| &v[..]) == Some(&self.server_config.id()[..])
            && msg.values.contains_key(&tags::PUBS)
            && msg.values.contains_key(&tags::NONC)
    }

    fn finish_handshake(&self) -> HandshakeMessage {
        trace!(self.log, "handshake complete, forward-secure keys available");
        self.forward_secure.store(true, Ordering::Release);
        let _ = self.aead_changed.try_send(());
        let mut msg = HandshakeMessage::new(tags::SHLO);
        msg.values = self.params.shlo_map();
        let mut nonce = [0; 32];
        thread_rng().fill_bytes(&mut nonce);
        msg.insert(tags::SNO, &nonce);
        msg
    }

    fn reject(&self) -> HandshakeMessage {
        trace!(self.log, "inchoate CHLO, sending REJ");
        let mut msg = HandshakeMessage::new(tags::REJ);
        msg.insert(tags::SCFG, &self.server_config.serialized());
        msg
    }
}

/// Blocking reader adapter over the crypto stream for the message parser.
struct CryptoStreamReader<'a>(&'a Stream);

impl<'a> io::Read for CryptoStreamReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{}", e)))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    pub struct StubKeyExchange;

    impl KeyExchange for StubKeyExchange {
        fn public_key(&self) -> &[u8] {
            b"stub public key"
        }

        fn shared_key(&self, _: &[u8]) -> Result<Vec<u8>, QuicError> {
            Ok(b"stub shared key".to_vec())
        }
    }

    pub fn server_config() -> Arc<ServerConfig> {
        ServerConfig::new(Box::new(StubKeyExchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use flow_control::FlowControlManager;
    use frame::StreamFrame;
    use std::thread;
    use StreamId;

    fn logger() -> Logger {
        Logger::root(::slog::Discard, o!())
    }

    fn setup() -> (
        Arc<CryptoSetup>,
        ::crossbeam_channel::Receiver<()>,
        Arc<ServerConfig>,
    ) {
        let params = ConnectionParameters::new();
        let scfg = testing::server_config();
        let (tx, rx) = bounded(1);
        (
            CryptoSetup::new(logger(), params, scfg.clone(), tx),
            rx,
            scfg,
        )
    }

    fn crypto_stream() -> Arc<Stream> {
        let fcm = Arc::new(FlowControlManager::new(ConnectionParameters::new()));
        fcm.new_stream(StreamId(1), false);
        let (tx, _rx) = bounded(1);
        Arc::new(Stream::new(StreamId(1), fcm, tx))
    }

    #[test]
    fn null_aead_round_trips() {
        let sealed = NullAead.seal(1, b"assoc", b"foobar");
        assert_eq!(sealed.len(), AEAD_TAG_SIZE + 6);
        assert_eq!(&sealed[AEAD_TAG_SIZE..], b"foobar");
        let opened = NullAead.open(1, b"assoc", &sealed).unwrap();
        assert_eq!(opened, b"foobar");
    }

    #[test]
    fn null_aead_rejects_tampering() {
        let mut sealed = NullAead.seal(1, b"assoc", b"foobar");
        sealed[AEAD_TAG_SIZE] ^= 0xff;
        let err = NullAead.open(1, b"assoc", &sealed).unwrap_err();
        assert_eq!(err.code, ErrorCode::DECRYPTION_FAILURE);
        let err = NullAead.open(1, b"other", b"foobar").unwrap_err();
        assert_eq!(err.code, ErrorCode::DECRYPTION_FAILURE);
    }

    #[test]
    fn non_chlo_message_is_fatal() {
        let (crypto, _rx, _) = setup();
        let stream = crypto_stream();
        stream.add_frame(StreamFrame {
            id: StreamId(1),
            offset: 0,
            data: ::bytes::Bytes::from(&b"4242\x00\x00\x00\x00"[..]),
            fin: false,
        });
        let err = crypto.handle_crypto_stream(&stream).unwrap_err();
        assert_eq!(err.code, ErrorCode::INVALID_CRYPTO_MESSAGE_TYPE);
    }

    #[test]
    fn inchoate_chlo_gets_a_rej() {
        let (crypto, rx, _) = setup();
        let stream = crypto_stream();
        let mut chlo = HandshakeMessage::new(tags::CHLO);
        chlo.insert(tags::PAD, &[0; 16]);
        let mut buf = Vec::new();
        chlo.write(&mut buf);
        stream.add_frame(StreamFrame {
            id: StreamId(1),
            offset: 0,
            data: ::bytes::Bytes::from(buf),
            fin: false,
        });

        let handler = {
            let crypto = crypto.clone();
            let stream = stream.clone();
            thread::spawn(move || crypto.handle_crypto_stream(&stream))
        };
        // drain the REJ the handler writes back
        let (_, reply) = loop {
            match stream.get_data_for_writing(usize::max_value()) {
                Some(x) => break x,
                None => thread::sleep(::std::time::Duration::from_millis(1)),
            }
        };
        let msg = HandshakeMessage::parse(&mut &reply[..]).unwrap();
        assert_eq!(msg.tag, tags::REJ);
        assert!(msg.values.contains_key(&tags::SCFG));
        assert!(!crypto.handshake_complete());
        assert!(rx.try_recv().is_err());

        // tear down so the handler thread exits
        stream.close_with_error(QuicError::new(ErrorCode::PEER_GOING_AWAY, ""));
        handler.join().unwrap().unwrap_err();
    }

    #[test]
    fn full_chlo_completes_the_handshake() {
        let (crypto, rx, scfg) = setup();
        let stream = crypto_stream();
        let mut chlo = HandshakeMessage::new(tags::CHLO);
        chlo.insert(tags::SCID, &scfg.id()[..]);
        chlo.insert(tags::PUBS, b"client public");
        chlo.insert(tags::NONC, &[7; 32]);
        chlo.insert(tags::ICSL, &[5, 0, 0, 0]);
        let mut buf = Vec::new();
        chlo.write(&mut buf);
        stream.add_frame(StreamFrame {
            id: StreamId(1),
            offset: 0,
            data: ::bytes::Bytes::from(buf),
            fin: false,
        });

        let handler = {
            let crypto = crypto.clone();
            let stream = stream.clone();
            thread::spawn(move || crypto.handle_crypto_stream(&stream))
        };
        let (_, reply) = loop {
            match stream.get_data_for_writing(usize::max_value()) {
                Some(x) => break x,
                None => thread::sleep(::std::time::Duration::from_millis(1)),
            }
        };
        let msg = HandshakeMessage::parse(&mut &reply[..]).unwrap();
        assert_eq!(msg.tag, tags::SHLO);
        assert!(crypto.handshake_complete());
        assert!(rx.try_recv().is_ok());
        // the CHLO's parameters were applied
        assert_eq!(
            crypto.params.idle_connection_state_lifetime(),
            ::std::time::Duration::from_secs(5)
        );

        stream.close_with_error(QuicError::new(ErrorCode::PEER_GOING_AWAY, ""));
        handler.join().unwrap().unwrap_err();
    }
}
