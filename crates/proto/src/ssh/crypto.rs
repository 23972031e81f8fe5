//! Cipher and MAC algorithms for the binary packet protocol.
//!
//! Supported ciphers: `aes128-ctr` (RFC 4344) and `aes128-cbc` (RFC 4253).
//! Supported MACs: `hmac-sha1` and `hmac-sha2-256` (RFC 6668). MAC
//! verification uses constant-time comparison.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use kedge_platform::{KedgeError, KedgeResult};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Encryption algorithms negotiable in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode.
    Aes128Ctr,
    /// AES-128 in CBC mode.
    Aes128Cbc,
}

impl CipherAlgorithm {
    /// The negotiated wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Ctr => "aes128-ctr",
            Self::Aes128Cbc => "aes128-cbc",
        }
    }

    /// Resolves a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(Self::Aes128Ctr),
            "aes128-cbc" => Some(Self::Aes128Cbc),
            _ => None,
        }
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        16
    }

    /// IV length in bytes.
    pub fn iv_size(&self) -> usize {
        16
    }

    /// Cipher block size, which also sets the packet alignment.
    pub fn block_size(&self) -> usize {
        16
    }
}

enum CipherInner {
    CtrStream(Box<Aes128Ctr>),
    CbcEnc(Box<cbc::Encryptor<Aes128>>),
    CbcDec(Box<cbc::Decryptor<Aes128>>),
}

/// A directional cipher instance. CTR keystream position and CBC chaining
/// state persist across packets, as the protocol requires.
pub struct Cipher {
    algorithm: CipherAlgorithm,
    inner: CipherInner,
}

impl Cipher {
    /// Creates the encrypting half.
    pub fn encryptor(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
    ) -> KedgeResult<Self> {
        check_material(algorithm, key, iv)?;
        let inner = match algorithm {
            CipherAlgorithm::Aes128Ctr => CipherInner::CtrStream(Box::new(
                Aes128Ctr::new_from_slices(key, iv)
                    .map_err(|e| KedgeError::Trust(e.to_string()))?,
            )),
            CipherAlgorithm::Aes128Cbc => CipherInner::CbcEnc(Box::new(
                cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                    .map_err(|e| KedgeError::Trust(e.to_string()))?,
            )),
        };
        Ok(Self { algorithm, inner })
    }

    /// Creates the decrypting half.
    pub fn decryptor(
        algorithm: CipherAlgorithm,
        key: &[u8],
        iv: &[u8],
    ) -> KedgeResult<Self> {
        check_material(algorithm, key, iv)?;
        let inner = match algorithm {
            CipherAlgorithm::Aes128Ctr => CipherInner::CtrStream(Box::new(
                Aes128Ctr::new_from_slices(key, iv)
                    .map_err(|e| KedgeError::Trust(e.to_string()))?,
            )),
            CipherAlgorithm::Aes128Cbc => CipherInner::CbcDec(Box::new(
                cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                    .map_err(|e| KedgeError::Trust(e.to_string()))?,
            )),
        };
        Ok(Self { algorithm, inner })
    }

    /// The algorithm this instance was created with.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Transforms `data` in place. `data` must be a whole number of blocks.
    pub fn apply(&mut self, data: &mut [u8]) -> KedgeResult<()> {
        if data.len() % self.algorithm.block_size() != 0 {
            return Err(KedgeError::Frame(format!(
                "cipher input of {} bytes is not block-aligned",
                data.len()
            )));
        }
        match &mut self.inner {
            CipherInner::CtrStream(ctr) => ctr.apply_keystream(data),
            CipherInner::CbcEnc(enc) => {
                for block in data.chunks_exact_mut(16) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
            CipherInner::CbcDec(dec) => {
                for block in data.chunks_exact_mut(16) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm.name())
            .finish()
    }
}

fn check_material(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
) -> KedgeResult<()> {
    if key.len() != algorithm.key_size() || iv.len() != algorithm.iv_size() {
        return Err(KedgeError::Trust(format!(
            "bad key material for {}: key {} bytes, iv {} bytes",
            algorithm.name(),
            key.len(),
            iv.len()
        )));
    }
    Ok(())
}

/// MAC algorithms negotiable in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA-1, 20-byte tag.
    HmacSha1,
    /// HMAC-SHA-256, 32-byte tag.
    HmacSha256,
}

impl MacAlgorithm {
    /// The negotiated wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha256 => "hmac-sha2-256",
        }
    }

    /// Resolves a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha1" => Some(Self::HmacSha1),
            "hmac-sha2-256" => Some(Self::HmacSha256),
            _ => None,
        }
    }

    /// Key length in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::HmacSha256 => 32,
        }
    }

    /// Tag length in bytes.
    pub fn mac_size(&self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::HmacSha256 => 32,
        }
    }
}

/// A keyed MAC instance for one direction.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl MacKey {
    /// Creates a MAC key. The key must be exactly `key_size` bytes.
    pub fn new(algorithm: MacAlgorithm, key: &[u8]) -> KedgeResult<Self> {
        if key.len() != algorithm.key_size() {
            return Err(KedgeError::Trust(format!(
                "bad key length {} for {}",
                key.len(),
                algorithm.name()
            )));
        }
        Ok(Self {
            algorithm,
            key: key.to_vec(),
        })
    }

    /// The algorithm this key belongs to.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Computes the tag over `seq` followed by the unencrypted packet.
    pub fn compute(&self, seq: u32, packet: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha1 => {
                let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha256 => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received tag in constant time.
    pub fn verify(&self, seq: u32, packet: &[u8], tag: &[u8]) -> bool {
        let expected = self.compute(seq, packet);
        expected.len() == tag.len() && expected.ct_eq(tag).into()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm.name())
            .finish()
    }
}

/// Hash functions used by key exchange methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, for diffie-hellman-group14-sha1.
    Sha1,
    /// SHA-256, for diffie-hellman-group14-sha256.
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub fn digest_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hashes `data` in one shot.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_roundtrip() {
        for algo in [CipherAlgorithm::Aes128Ctr, CipherAlgorithm::Aes128Cbc] {
            assert_eq!(CipherAlgorithm::from_name(algo.name()), Some(algo));
        }
        for algo in [MacAlgorithm::HmacSha1, MacAlgorithm::HmacSha256] {
            assert_eq!(MacAlgorithm::from_name(algo.name()), Some(algo));
        }
        assert_eq!(CipherAlgorithm::from_name("3des-cbc"), None);
    }

    #[test]
    fn test_ctr_roundtrip_and_stream_position() {
        let key = [7u8; 16];
        let iv = [3u8; 16];
        let mut enc = Cipher::encryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();
        let mut dec = Cipher::decryptor(CipherAlgorithm::Aes128Ctr, &key, &iv).unwrap();

        // Two packets back to back; the keystream must continue.
        let plain1 = [0x11u8; 32];
        let plain2 = [0x22u8; 16];
        let mut buf1 = plain1;
        let mut buf2 = plain2;
        enc.apply(&mut buf1).unwrap();
        enc.apply(&mut buf2).unwrap();
        assert_ne!(buf1[..16], plain1[..16]);
        dec.apply(&mut buf1).unwrap();
        dec.apply(&mut buf2).unwrap();
        assert_eq!(buf1, plain1);
        assert_eq!(buf2, plain2);
    }

    #[test]
    fn test_cbc_roundtrip_chains_iv() {
        let key = [9u8; 16];
        let iv = [1u8; 16];
        let mut enc = Cipher::encryptor(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();
        let mut dec = Cipher::decryptor(CipherAlgorithm::Aes128Cbc, &key, &iv).unwrap();

        let plain = [0xabu8; 48];
        let mut buf = plain;
        enc.apply(&mut buf).unwrap();
        // Identical plaintext blocks must not encrypt identically in CBC.
        assert_ne!(buf[0..16], buf[16..32]);
        dec.apply(&mut buf).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_unaligned_input_rejected() {
        let mut enc =
            Cipher::encryptor(CipherAlgorithm::Aes128Ctr, &[0; 16], &[0; 16]).unwrap();
        let mut buf = [0u8; 15];
        assert!(enc.apply(&mut buf).is_err());
    }

    #[test]
    fn test_bad_key_material_rejected() {
        assert!(Cipher::encryptor(CipherAlgorithm::Aes128Ctr, &[0; 8], &[0; 16]).is_err());
        assert!(MacKey::new(MacAlgorithm::HmacSha1, &[0; 16]).is_err());
    }

    #[test]
    fn test_mac_verify() {
        let key = MacKey::new(MacAlgorithm::HmacSha256, &[5u8; 32]).unwrap();
        let tag = key.compute(3, b"payload");
        assert_eq!(tag.len(), 32);
        assert!(key.verify(3, b"payload", &tag));
        assert!(!key.verify(4, b"payload", &tag));
        assert!(!key.verify(3, b"tampered", &tag));
        assert!(!key.verify(3, b"payload", &tag[..31]));
    }

    #[test]
    fn test_hash_digest_sizes() {
        assert_eq!(HashAlgorithm::Sha1.digest(b"x").len(), 20);
        assert_eq!(HashAlgorithm::Sha256.digest(b"x").len(), 32);
    }
}
