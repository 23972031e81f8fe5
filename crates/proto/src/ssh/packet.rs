//! SSH binary packet protocol (RFC 4253 section 6).
//!
//! Wire format of a single packet:
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload
//! byte[n2]  random padding (4..=255 bytes)
//! byte[m]   mac (over sequence number and unencrypted packet)
//! ```
//!
//! The packet (length field included) is encrypted; the MAC is not. Each
//! direction counts packets with a sequence number that starts at zero and
//! wraps at 2^32; the sequence number is never transmitted, only MAC'd.

use bytes::{BufMut, BytesMut};
use kedge_platform::{KedgeError, KedgeResult};
use rand::RngCore;

use crate::ssh::crypto::{Cipher, MacKey};

/// Maximum accepted packet_length value.
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding on every packet.
pub const MIN_PADDING_LEN: usize = 4;

/// Block alignment before encryption is active.
const PLAINTEXT_BLOCK: usize = 8;

/// Outgoing packet framer for one direction.
///
/// Owns the transmit sequence number and, after NEWKEYS, the cipher and
/// MAC for this direction.
#[derive(Debug, Default)]
pub struct PacketWriter {
    seq: u32,
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
}

impl PacketWriter {
    /// Creates a writer in the initial plaintext state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the next packet to be sealed.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Switches this direction to the given cipher and MAC. Takes effect
    /// for the next sealed packet.
    pub fn enable(&mut self, cipher: Cipher, mac: MacKey) {
        self.cipher = Some(cipher);
        self.mac = Some(mac);
    }

    /// Frames, MACs, and encrypts one payload.
    pub fn seal(&mut self, payload: &[u8]) -> KedgeResult<Vec<u8>> {
        let block = self
            .cipher
            .as_ref()
            .map(|c| c.algorithm().block_size())
            .unwrap_or(PLAINTEXT_BLOCK);

        let mut padding = block - ((5 + payload.len()) % block);
        if padding < MIN_PADDING_LEN {
            padding += block;
        }
        let packet_len = 1 + payload.len() + padding;
        if 4 + packet_len > MAX_PACKET_SIZE {
            return Err(KedgeError::Frame(format!(
                "outgoing packet of {} bytes exceeds maximum",
                4 + packet_len
            )));
        }

        let mut packet = BytesMut::with_capacity(4 + packet_len);
        packet.put_u32(packet_len as u32);
        packet.put_u8(padding as u8);
        packet.put_slice(payload);
        let mut pad = vec![0u8; padding];
        rand::thread_rng().fill_bytes(&mut pad);
        packet.put_slice(&pad);

        let tag = self
            .mac
            .as_ref()
            .map(|mac| mac.compute(self.seq, &packet));
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(&mut packet)?;
        }
        if let Some(tag) = tag {
            packet.put_slice(&tag);
        }

        self.seq = self.seq.wrapping_add(1);
        Ok(packet.to_vec())
    }
}

/// One packet pulled out of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// The payload, padding stripped.
    pub payload: Vec<u8>,
    /// The receive sequence number this packet was MAC'd with.
    pub seq: u32,
}

#[derive(Debug)]
enum ReadState {
    /// Waiting for the first cipher block of the next packet.
    Head,
    /// First block decrypted and length known; waiting for the rest.
    Body { head: Vec<u8>, packet_len: usize },
}

/// Incoming packet framer for one direction.
///
/// Fully incremental: bytes may arrive in any chunking and packets are
/// extracted as they complete. A skip counter supports discarding the
/// peer's wrongly guessed first key exchange packet.
#[derive(Debug)]
pub struct PacketReader {
    buf: BytesMut,
    state: ReadState,
    seq: u32,
    skip: u32,
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
}

impl PacketReader {
    /// Creates a reader in the initial plaintext state.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            state: ReadState::Head,
            seq: 0,
            skip: 0,
            cipher: None,
            mac: None,
        }
    }

    /// Appends raw bytes from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Switches this direction to the given cipher and MAC. Must be called
    /// at a packet boundary (after a NEWKEYS packet has been extracted);
    /// buffered bytes beyond the boundary are treated as ciphertext.
    pub fn enable(&mut self, cipher: Cipher, mac: MacKey) -> KedgeResult<()> {
        if !matches!(self.state, ReadState::Head) {
            return Err(KedgeError::Frame(
                "key switch in the middle of a packet".to_string(),
            ));
        }
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        Ok(())
    }

    /// Arms the skip counter: the next `n` complete packets are discarded
    /// without being surfaced.
    pub fn skip_packets(&mut self, n: u32) {
        self.skip += n;
    }

    /// Extracts the next packet, or `None` if the buffer holds less than a
    /// full packet. Skipped packets are consumed transparently.
    pub fn next_packet(&mut self) -> KedgeResult<Option<ReceivedPacket>> {
        loop {
            match self.advance()? {
                None => return Ok(None),
                Some(packet) => {
                    if self.skip > 0 {
                        self.skip -= 1;
                        continue;
                    }
                    return Ok(Some(packet));
                }
            }
        }
    }

    fn block_size(&self) -> usize {
        self.cipher
            .as_ref()
            .map(|c| c.algorithm().block_size())
            .unwrap_or(PLAINTEXT_BLOCK)
    }

    fn advance(&mut self) -> KedgeResult<Option<ReceivedPacket>> {
        if let ReadState::Head = self.state {
            let block = self.block_size();
            if self.buf.len() < block {
                return Ok(None);
            }
            let mut head = self.buf.split_to(block).to_vec();
            if let Some(cipher) = &mut self.cipher {
                cipher.apply(&mut head)?;
            }
            let packet_len =
                u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
            if 4 + packet_len > MAX_PACKET_SIZE {
                return Err(KedgeError::Frame(format!(
                    "incoming packet of {} bytes exceeds maximum",
                    4 + packet_len
                )));
            }
            if packet_len < 1 + MIN_PADDING_LEN || (4 + packet_len) % block != 0 {
                return Err(KedgeError::Frame(format!(
                    "invalid packet length {packet_len}"
                )));
            }
            self.state = ReadState::Body { head, packet_len };
        }

        let (head, packet_len) = match &self.state {
            ReadState::Body { head, packet_len } => (head.clone(), *packet_len),
            ReadState::Head => unreachable!(),
        };
        let mac_size = self.mac.as_ref().map(|m| m.algorithm().mac_size()).unwrap_or(0);
        let rest_len = 4 + packet_len - head.len();
        if self.buf.len() < rest_len + mac_size {
            return Ok(None);
        }

        let mut rest = self.buf.split_to(rest_len).to_vec();
        if let Some(cipher) = &mut self.cipher {
            cipher.apply(&mut rest)?;
        }
        let mut packet = head;
        packet.extend_from_slice(&rest);

        if let Some(mac) = &self.mac {
            let tag = self.buf.split_to(mac_size);
            if !mac.verify(self.seq, &packet, &tag) {
                return Err(KedgeError::Trust(format!(
                    "MAC verification failed on packet {}",
                    self.seq
                )));
            }
        }

        let padding = packet[4] as usize;
        if padding < MIN_PADDING_LEN || padding > packet_len - 1 {
            return Err(KedgeError::Frame(format!(
                "invalid padding length {padding}"
            )));
        }
        let payload = packet[5..4 + packet_len - padding].to_vec();

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.state = ReadState::Head;
        Ok(Some(ReceivedPacket { payload, seq }))
    }
}

impl Default for PacketReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};

    fn keyed_pair(
        cipher_algo: CipherAlgorithm,
        mac_algo: MacAlgorithm,
    ) -> (PacketWriter, PacketReader) {
        let key = vec![0x42u8; cipher_algo.key_size()];
        let iv = vec![0x17u8; cipher_algo.iv_size()];
        let mac_key = vec![0x99u8; mac_algo.key_size()];
        let mut writer = PacketWriter::new();
        writer.enable(
            Cipher::encryptor(cipher_algo, &key, &iv).unwrap(),
            MacKey::new(mac_algo, &mac_key).unwrap(),
        );
        let mut reader = PacketReader::new();
        reader
            .enable(
                Cipher::decryptor(cipher_algo, &key, &iv).unwrap(),
                MacKey::new(mac_algo, &mac_key).unwrap(),
            )
            .unwrap();
        (writer, reader)
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let mut writer = PacketWriter::new();
        let mut reader = PacketReader::new();
        let wire = writer.seal(b"hello").unwrap();
        assert_eq!(wire.len() % 8, 0);
        reader.feed(&wire);
        let pkt = reader.next_packet().unwrap().unwrap();
        assert_eq!(pkt.payload, b"hello");
        assert_eq!(pkt.seq, 0);
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_padding_bounds() {
        let mut writer = PacketWriter::new();
        for len in 0..64 {
            let payload = vec![0xaa; len];
            let wire = writer.seal(&payload).unwrap();
            let padding = wire[4] as usize;
            assert!(padding >= MIN_PADDING_LEN, "payload {len}: padding {padding}");
            assert!(padding < 2 * 8 + MIN_PADDING_LEN);
            assert_eq!(wire.len() % 8, 0, "payload {len} not aligned");
        }
    }

    #[test]
    fn test_empty_payload() {
        let mut writer = PacketWriter::new();
        let mut reader = PacketReader::new();
        let wire = writer.seal(b"").unwrap();
        reader.feed(&wire);
        let pkt = reader.next_packet().unwrap().unwrap();
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let mut writer = PacketWriter::new();
        let mut reader = PacketReader::new();
        let wire = writer.seal(b"chunked delivery").unwrap();
        for &b in &wire[..wire.len() - 1] {
            reader.feed(&[b]);
            assert!(reader.next_packet().unwrap().is_none());
        }
        reader.feed(&wire[wire.len() - 1..]);
        let pkt = reader.next_packet().unwrap().unwrap();
        assert_eq!(pkt.payload, b"chunked delivery");
    }

    #[test]
    fn test_two_packets_in_one_chunk() {
        let mut writer = PacketWriter::new();
        let mut reader = PacketReader::new();
        let mut wire = writer.seal(b"first").unwrap();
        wire.extend(writer.seal(b"second").unwrap());
        reader.feed(&wire);
        assert_eq!(reader.next_packet().unwrap().unwrap().payload, b"first");
        let second = reader.next_packet().unwrap().unwrap();
        assert_eq!(second.payload, b"second");
        assert_eq!(second.seq, 1);
    }

    #[test]
    fn test_encrypted_roundtrip_ctr_sha256() {
        let (mut writer, mut reader) =
            keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        for i in 0u32..5 {
            let payload = format!("packet number {i}").into_bytes();
            let wire = writer.seal(&payload).unwrap();
            assert!(!wire.windows(payload.len()).any(|w| w == payload));
            reader.feed(&wire);
            let pkt = reader.next_packet().unwrap().unwrap();
            assert_eq!(pkt.payload, payload);
            assert_eq!(pkt.seq, i);
        }
    }

    #[test]
    fn test_encrypted_roundtrip_cbc_sha1() {
        let (mut writer, mut reader) =
            keyed_pair(CipherAlgorithm::Aes128Cbc, MacAlgorithm::HmacSha1);
        let wire = writer.seal(b"cbc mode payload").unwrap();
        assert_eq!((wire.len() - 20) % 16, 0);
        reader.feed(&wire);
        assert_eq!(
            reader.next_packet().unwrap().unwrap().payload,
            b"cbc mode payload"
        );
    }

    #[test]
    fn test_corrupted_mac_detected() {
        let (mut writer, mut reader) =
            keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        let mut wire = writer.seal(b"integrity matters").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        reader.feed(&wire);
        assert!(matches!(
            reader.next_packet(),
            Err(KedgeError::Trust(_))
        ));
    }

    #[test]
    fn test_corrupted_ciphertext_detected() {
        let (mut writer, mut reader) =
            keyed_pair(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        let mut wire = writer.seal(b"integrity matters").unwrap();
        wire[8] ^= 0x01;
        reader.feed(&wire);
        assert!(reader.next_packet().is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut reader = PacketReader::new();
        let mut wire = vec![0u8; 8];
        wire[..4].copy_from_slice(&(40000u32).to_be_bytes());
        reader.feed(&wire);
        assert!(reader.next_packet().is_err());
    }

    #[test]
    fn test_skip_counter_discards_packets() {
        let mut writer = PacketWriter::new();
        let mut reader = PacketReader::new();
        reader.skip_packets(1);
        let mut wire = writer.seal(b"guessed wrong").unwrap();
        wire.extend(writer.seal(b"kept").unwrap());
        reader.feed(&wire);
        let pkt = reader.next_packet().unwrap().unwrap();
        assert_eq!(pkt.payload, b"kept");
        assert_eq!(pkt.seq, 1);
    }

    #[test]
    fn test_seq_wraps_at_u32_max() {
        let mut writer = PacketWriter::new();
        writer.seq = u32::MAX;
        let _ = writer.seal(b"wrap").unwrap();
        assert_eq!(writer.seq(), 0);
    }
}
