//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include `mac` or `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - `packet_length + 4` MUST be a multiple of `max(8, cipher block size)`
//! - Maximum packet size: 35000 bytes
//!
//! # Security
//!
//! - **Size Validation**: Rejects packets > 35000 bytes before reading them
//! - **Random Padding**: Uses cryptographically secure RNG for padding
//! - **MAC Verification**: Constant-time check before the payload is used
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use halyard_proto::ssh::packet::PacketCodec;
//!
//! let mut sender = PacketCodec::new();
//! let mut receiver = PacketCodec::new();
//!
//! let wire = sender.seal(b"\x05ssh-userauth").unwrap();
//! let mut inbound = BytesMut::from(&wire[..]);
//! let (sequence, payload) = receiver.open(&mut inbound).unwrap().unwrap();
//! assert_eq!(sequence, 0);
//! assert_eq!(payload, b"\x05ssh-userauth");
//! ```

use bytes::{Buf, BufMut, BytesMut};
use halyard_platform::{HalyardError, HalyardResult};
use rand::RngCore;

use super::cipher::{Cipher, NoneCipher};
use super::compression::{Compression, NoCompression};
use super::mac::{Mac, NoneMac};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

/// Minimum alignment of `packet_length || padding_length || payload || padding`.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Unencrypted SSH binary packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a packet aligned to 8 bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use halyard_proto::ssh::Packet;
    ///
    /// let packet = Packet::new(b"Hello, SSH!".to_vec()).unwrap();
    /// assert_eq!(packet.payload(), b"Hello, SSH!");
    /// assert_eq!(packet.to_bytes().len() % 8, 0);
    /// ```
    pub fn new(payload: Vec<u8>) -> HalyardResult<Self> {
        Self::with_block_size(payload, MIN_BLOCK_SIZE)
    }

    /// Creates a packet aligned to `max(8, block_size)`.
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Protocol`] if the packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> HalyardResult<Self> {
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        let unpadded_len = 5 + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        let rem = (unpadded_len + padding_len) % block_size;
        if rem != 0 {
            padding_len += block_size - rem;
        }

        let total_size = unpadded_len + padding_len;
        if total_size - 4 > MAX_PACKET_SIZE {
            return Err(HalyardError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                total_size - 4,
                MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Serializes this packet (without MAC).
    pub fn to_bytes(&self) -> Vec<u8> {
        let packet_length = 1 + self.payload.len() + self.padding.len();
        let mut buf = BytesMut::with_capacity(4 + packet_length);
        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
        buf.to_vec()
    }

    /// Parses an unencrypted packet occupying all of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Protocol`] if:
    /// - Data is too short (< 5 bytes for header)
    /// - Packet size exceeds maximum (35000 bytes)
    /// - Padding length is invalid (< 4 or longer than the packet)
    /// - Data length doesn't match declared packet_length
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        if data.len() < 5 {
            return Err(HalyardError::Protocol(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;
        check_packet_length(packet_length)?;

        if buf.len() != packet_length {
            return Err(HalyardError::Protocol(format!(
                "Packet length mismatch: declared {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let (payload, padding) = split_body(buf)?;
        Ok(Self {
            payload: payload.to_vec(),
            padding: padding.to_vec(),
        })
    }
}

fn check_packet_length(packet_length: usize) -> HalyardResult<()> {
    if packet_length > MAX_PACKET_SIZE {
        return Err(HalyardError::Protocol(format!(
            "Packet too large: {} bytes (maximum {})",
            packet_length, MAX_PACKET_SIZE
        )));
    }
    if packet_length < 1 + MIN_PADDING_LEN as usize {
        return Err(HalyardError::Protocol(format!(
            "Packet too small: {} bytes",
            packet_length
        )));
    }
    Ok(())
}

/// Splits `padding_length || payload || padding` into payload and padding.
fn split_body(body: &[u8]) -> HalyardResult<(&[u8], &[u8])> {
    let padding_length = body[0] as usize;
    if padding_length < MIN_PADDING_LEN as usize {
        return Err(HalyardError::Protocol(format!(
            "Padding too short: {} bytes (minimum {})",
            padding_length, MIN_PADDING_LEN
        )));
    }
    if padding_length + 1 > body.len() {
        return Err(HalyardError::Protocol(format!(
            "Padding length {} exceeds packet length {}",
            padding_length,
            body.len()
        )));
    }
    let payload_end = body.len() - padding_length;
    Ok((&body[1..payload_end], &body[payload_end..]))
}

/// Cipher, MAC and compression for one direction.
pub struct DirectionCrypto {
    /// Cipher.
    pub cipher: Box<dyn Cipher>,
    /// MAC.
    pub mac: Box<dyn Mac>,
    /// Compression.
    pub compression: Box<dyn Compression>,
}

impl DirectionCrypto {
    /// The initial `none` state used before the first NEWKEYS.
    pub fn none() -> Self {
        Self {
            cipher: Box::new(NoneCipher),
            mac: Box::new(NoneMac),
            compression: Box::new(NoCompression),
        }
    }

    fn block_size(&self) -> usize {
        self.cipher.block_size().max(MIN_BLOCK_SIZE)
    }
}

impl std::fmt::Debug for DirectionCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionCrypto")
            .field("block_size", &self.block_size())
            .field("mac_len", &self.mac.mac_len())
            .finish_non_exhaustive()
    }
}

/// Packet framing for both directions of one transport.
///
/// Sequence numbers are 32-bit, wrap around, and are never reset by a
/// key switch. Outbound and inbound keys are replaced independently.
#[derive(Debug)]
pub struct PacketCodec {
    outbound: DirectionCrypto,
    inbound: DirectionCrypto,
    send_sequence: u32,
    recv_sequence: u32,
    /// Decrypted first block of a packet whose remainder has not arrived.
    pending: Option<Vec<u8>>,
}

impl PacketCodec {
    /// Creates a codec with no encryption, MAC or compression.
    pub fn new() -> Self {
        Self {
            outbound: DirectionCrypto::none(),
            inbound: DirectionCrypto::none(),
            send_sequence: 0,
            recv_sequence: 0,
            pending: None,
        }
    }

    /// Replaces the outbound keys.
    pub fn set_outbound(&mut self, crypto: DirectionCrypto) {
        self.outbound = crypto;
    }

    /// Replaces the inbound keys.
    pub fn set_inbound(&mut self, crypto: DirectionCrypto) {
        self.inbound = crypto;
    }

    /// Sequence number of the next packet to send.
    pub fn send_sequence(&self) -> u32 {
        self.send_sequence
    }

    /// Sequence number of the next packet to receive.
    pub fn recv_sequence(&self) -> u32 {
        self.recv_sequence
    }

    /// Frames, MACs and encrypts one payload.
    ///
    /// The MAC is computed over `sequence || plaintext packet`
    /// (encrypt-and-MAC).
    pub fn seal(&mut self, payload: &[u8]) -> HalyardResult<Vec<u8>> {
        let payload = self.outbound.compression.compress(payload.to_vec())?;
        let packet = Packet::with_block_size(payload, self.outbound.cipher.block_size())?;
        let mut wire = packet.to_bytes();

        let mac = self.outbound.mac.compute(self.send_sequence, &wire);
        self.outbound.cipher.apply(&mut wire);
        wire.extend_from_slice(&mac);

        self.send_sequence = self.send_sequence.wrapping_add(1);
        Ok(wire)
    }

    /// Decodes one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf`. A packet never waits for more than
    /// [`MAX_PACKET_SIZE`] bytes plus the MAC, so a corrupted length that is
    /// still plausible fails MAC verification once those bytes arrive.
    ///
    /// # Errors
    ///
    /// - [`HalyardError::Protocol`] on framing violations before keys are installed
    /// - [`HalyardError::Security`] on MAC failure, including an invalid
    ///   decrypted length under a keyed MAC
    pub fn open(&mut self, buf: &mut BytesMut) -> HalyardResult<Option<(u32, Vec<u8>)>> {
        let block_size = self.inbound.block_size();

        let first = match self.pending.take() {
            Some(first) => first,
            None => {
                if buf.len() < block_size {
                    return Ok(None);
                }
                let mut first = buf.split_to(block_size).to_vec();
                self.inbound.cipher.apply(&mut first);
                first
            }
        };

        let packet_length = u32::from_be_bytes([first[0], first[1], first[2], first[3]]) as usize;
        let framing = check_packet_length(packet_length).and_then(|_| {
            if (packet_length + 4) % block_size != 0 {
                return Err(HalyardError::Protocol(format!(
                    "Packet length {} not aligned to block size {}",
                    packet_length, block_size
                )));
            }
            Ok(())
        });
        if let Err(e) = framing {
            // Under a keyed MAC a garbled length is indistinguishable from
            // tampering.
            if self.inbound.mac.mac_len() > 0 {
                return Err(HalyardError::Security(format!(
                    "MAC verification failed: {}",
                    e
                )));
            }
            return Err(e);
        }

        let rest_len = packet_length + 4 - block_size;
        let mac_len = self.inbound.mac.mac_len();
        if buf.len() < rest_len + mac_len {
            self.pending = Some(first);
            return Ok(None);
        }

        let mut plain = first;
        let mut rest = buf.split_to(rest_len).to_vec();
        self.inbound.cipher.apply(&mut rest);
        plain.extend_from_slice(&rest);

        let received_mac = buf.split_to(mac_len);
        let sequence = self.recv_sequence;
        self.inbound.mac.verify(sequence, &plain, &received_mac)?;
        self.recv_sequence = self.recv_sequence.wrapping_add(1);

        let (payload, _) = split_body(&plain[4..])?;
        let payload = self.inbound.compression.decompress(payload.to_vec())?;
        Ok(Some((sequence, payload)))
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::cipher::{AesCtrFactory, CipherFactory};
    use crate::ssh::mac::{HmacFactory, MacFactory};

    fn keyed(key_byte: u8) -> DirectionCrypto {
        let cipher = AesCtrFactory::Aes128
            .create(&[key_byte; 16], &[key_byte ^ 0xff; 16])
            .unwrap();
        let mac = HmacFactory::Sha256.create(&[key_byte; 32]).unwrap();
        DirectionCrypto {
            cipher,
            mac,
            compression: Box::new(NoCompression),
        }
    }

    fn keyed_pair() -> (PacketCodec, PacketCodec) {
        let mut tx = PacketCodec::new();
        let mut rx = PacketCodec::new();
        tx.set_outbound(keyed(7));
        rx.set_inbound(keyed(7));
        (tx, rx)
    }

    #[test]
    fn test_packet_alignment() {
        for len in [0usize, 1, 3, 7, 8, 100, 1000] {
            let packet = Packet::new(vec![0xAB; len]).unwrap();
            let bytes = packet.to_bytes();
            assert_eq!(bytes.len() % 8, 0);
            assert!(packet.padding().len() >= 4);
            assert!(packet.padding().len() <= 255);
        }
        let packet = Packet::with_block_size(vec![1; 10], 16).unwrap();
        assert_eq!(packet.to_bytes().len() % 16, 0);
    }

    #[test]
    fn test_packet_parse() {
        let packet = Packet::new(b"test payload".to_vec()).unwrap();
        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_packet_too_large() {
        assert!(Packet::new(vec![0; MAX_PACKET_SIZE]).is_err());

        let mut data = vec![0u8; 10];
        data[0..4].copy_from_slice(&40000u32.to_be_bytes());
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_padding_validation() {
        // padding_length 2
        let data = [0, 0, 0, 12, 2, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb];
        assert!(Packet::from_bytes(&data).is_err());
        // padding_length larger than the packet
        let data = [0, 0, 0, 12, 200, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xa, 0xb];
        assert!(Packet::from_bytes(&data).is_err());
    }

    #[test]
    fn test_codec_plaintext_sequence() {
        let mut tx = PacketCodec::new();
        let mut rx = PacketCodec::new();
        let mut buf = BytesMut::new();
        for i in 0..3u8 {
            buf.extend_from_slice(&tx.seal(&[i, i, i]).unwrap());
        }
        for i in 0..3u8 {
            let (seq, payload) = rx.open(&mut buf).unwrap().unwrap();
            assert_eq!(seq, i as u32);
            assert_eq!(payload, vec![i, i, i]);
        }
        assert!(rx.open(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_encrypted_partial_input() {
        let (mut tx, mut rx) = keyed_pair();
        let wire = tx.seal(&[0x5e; 300]).unwrap();
        assert_eq!((wire.len() - 32) % 16, 0);

        let mut buf = BytesMut::new();
        for chunk in wire.chunks(7) {
            buf.extend_from_slice(chunk);
            if let Some((seq, payload)) = rx.open(&mut buf).unwrap() {
                assert_eq!(seq, 0);
                assert_eq!(payload, vec![0x5e; 300]);
                return;
            }
        }
        panic!("packet never completed");
    }

    #[test]
    fn test_codec_detects_tampering() {
        let wire_len = keyed_pair().0.seal(&[0x42; 27]).unwrap().len();
        for position in 0..wire_len {
            for flip in [0x01u8, 0x80] {
                let (mut tx, mut rx) = keyed_pair();
                let mut tampered = tx.seal(&[0x42; 27]).unwrap();
                tampered[position] ^= flip;

                // Trailing traffic lets a corrupted but plausible length
                // complete.
                let mut buf = BytesMut::from(&tampered[..]);
                buf.extend_from_slice(&vec![0u8; MAX_PACKET_SIZE + 64]);
                match rx.open(&mut buf) {
                    Err(HalyardError::Security(_)) => {}
                    other => panic!("byte {} flip {:#x}: {:?}", position, flip, other),
                }
            }
        }
    }

    #[test]
    fn test_unkeyed_bad_length_is_protocol_error() {
        let mut tx = PacketCodec::new();
        let mut rx = PacketCodec::new();
        let mut wire = tx.seal(b"x").unwrap();
        wire[0] = 0xff;
        let mut buf = BytesMut::from(&wire[..]);
        assert!(matches!(rx.open(&mut buf), Err(HalyardError::Protocol(_))));
    }

    #[test]
    fn test_codec_detects_sequence_mismatch() {
        let (mut tx, mut rx) = keyed_pair();
        let _dropped = tx.seal(b"first").unwrap();
        let second = tx.seal(b"second").unwrap();
        let mut buf = BytesMut::from(&second[..]);
        assert!(rx.open(&mut buf).is_err());
    }

    #[test]
    fn test_sequence_wraps() {
        let mut tx = PacketCodec::new();
        let mut rx = PacketCodec::new();
        tx.send_sequence = u32::MAX;
        rx.recv_sequence = u32::MAX;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&tx.seal(b"a").unwrap());
        buf.extend_from_slice(&tx.seal(b"b").unwrap());
        assert_eq!(rx.open(&mut buf).unwrap().unwrap().0, u32::MAX);
        assert_eq!(rx.open(&mut buf).unwrap().unwrap().0, 0);
    }

    #[test]
    fn test_key_switch_keeps_sequence() {
        let mut tx = PacketCodec::new();
        let mut rx = PacketCodec::new();
        let mut buf = BytesMut::from(&tx.seal(b"plain").unwrap()[..]);
        rx.open(&mut buf).unwrap().unwrap();

        tx.set_outbound(keyed(3));
        rx.set_inbound(keyed(3));
        let mut buf = BytesMut::from(&tx.seal(b"secret").unwrap()[..]);
        let (seq, payload) = rx.open(&mut buf).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(payload, b"secret");
    }

    #[test]
    fn test_rejects_oversized_length_before_body() {
        let mut rx = PacketCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        buf.put_slice(&[4, 0, 0, 0]);
        assert!(matches!(rx.open(&mut buf), Err(HalyardError::Protocol(_))));
    }
}
