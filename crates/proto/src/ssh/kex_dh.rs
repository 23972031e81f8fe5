//! Diffie-Hellman group 14 key exchange and session key derivation.
//!
//! Implements diffie-hellman-group14-sha1 (RFC 4253) and
//! diffie-hellman-group14-sha256 (RFC 8268) over the 2048-bit MODP group
//! from RFC 3526, plus the exchange hash and the RFC 4253 section 7.2 key
//! derivation.
//!
//! Host key signing and verification are behind the [`HostKeySigner`] and
//! [`HostKeyVerifier`] traits so the transport stays independent of key
//! formats and trust policy.

use kedge_platform::{KedgeError, KedgeResult};
use num_bigint::BigUint;
use zeroize::Zeroize;

use crate::ssh::codec::{self, FieldMap, FieldType, StructDef, Value};
use crate::ssh::crypto::HashAlgorithm;

/// DH group 14 parameters (RFC 3526 section 3).
pub mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// The 2048-bit prime modulus.
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
                 29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
                 EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
                 E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
                 EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
                 C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
                 83655D23DCA3AD961C62F356208552BB9ED529077096966D\
                 670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
                 E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
                 DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
                 15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .unwrap_or_else(|_| unreachable!("group14 prime is valid hex")),
        )
    });

    /// The generator, 2.
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Key exchange methods negotiable in KEXINIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexAlgorithm {
    /// diffie-hellman-group14-sha1 (RFC 4253)
    DhGroup14Sha1,
    /// diffie-hellman-group14-sha256 (RFC 8268)
    DhGroup14Sha256,
}

impl KexAlgorithm {
    /// The negotiated wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DhGroup14Sha1 => "diffie-hellman-group14-sha1",
            Self::DhGroup14Sha256 => "diffie-hellman-group14-sha256",
        }
    }

    /// Resolves a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "diffie-hellman-group14-sha1" => Some(Self::DhGroup14Sha1),
            "diffie-hellman-group14-sha256" => Some(Self::DhGroup14Sha256),
            _ => None,
        }
    }

    /// The hash this method uses for the exchange hash and key derivation.
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            Self::DhGroup14Sha1 => HashAlgorithm::Sha1,
            Self::DhGroup14Sha256 => HashAlgorithm::Sha256,
        }
    }
}

/// One side's ephemeral DH group 14 keypair.
pub struct DhExchange {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl DhExchange {
    /// Generates an ephemeral keypair with x in (1, p-1).
    pub fn generate() -> Self {
        use num_bigint::RandBigInt;

        let mut rng = rand::thread_rng();
        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// The public value, big-endian without sign prefix.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret K from the peer's public value.
    ///
    /// Rejects peer values outside (1, p-1), which covers the degenerate
    /// subgroup elements 0, 1, and p-1.
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> KedgeResult<Vec<u8>> {
        let y_peer = BigUint::from_bytes_be(peer_public);
        if y_peer <= BigUint::from(1u32) || y_peer >= dh_group14::P.clone() - 1u32 {
            return Err(KedgeError::Trust(
                "peer DH public value out of range".to_string(),
            ));
        }
        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);
        Ok(k.to_bytes_be())
    }
}

impl Drop for DhExchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl std::fmt::Debug for DhExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhExchange").finish_non_exhaustive()
    }
}

/// Host key signing, supplied by the embedding server.
pub trait HostKeySigner: Send + Sync {
    /// The host key algorithm name offered in KEXINIT.
    fn algorithm(&self) -> &'static str;
    /// The public key blob placed in KEXDH_REPLY.
    fn public_key_blob(&self) -> Vec<u8>;
    /// Signs the exchange hash.
    fn sign(&self, data: &[u8]) -> KedgeResult<Vec<u8>>;
}

/// Host key verification and trust policy, supplied by the embedding client.
pub trait HostKeyVerifier: Send + Sync {
    /// The host key algorithm names acceptable to this verifier.
    fn algorithms(&self) -> Vec<&'static str>;
    /// Checks the signature over the exchange hash and decides whether the
    /// host key is trusted. An error aborts the connection.
    fn verify(&self, host_key: &[u8], data: &[u8], signature: &[u8]) -> KedgeResult<()>;
}

/// Inputs to the exchange hash H (RFC 4253 section 8).
#[derive(Debug, Clone)]
pub struct ExchangeHashInput<'a> {
    /// Client identification line, without CR LF.
    pub client_version: &'a str,
    /// Server identification line, without CR LF.
    pub server_version: &'a str,
    /// Client's KEXINIT payload, message id included.
    pub client_kexinit: &'a [u8],
    /// Server's KEXINIT payload, message id included.
    pub server_kexinit: &'a [u8],
    /// Server host key blob.
    pub host_key: &'a [u8],
    /// Client DH public value e.
    pub e: &'a [u8],
    /// Server DH public value f.
    pub f: &'a [u8],
    /// Shared secret K.
    pub k: &'a [u8],
}

/// Computes H over the concatenation defined by RFC 4253: versions as
/// strings, KEXINIT payloads and host key as binary strings, and e, f, K
/// as mpints.
pub fn exchange_hash(hash: HashAlgorithm, input: &ExchangeHashInput<'_>) -> KedgeResult<Vec<u8>> {
    let def = StructDef::new(vec![
        ("v_c", FieldType::Str),
        ("v_s", FieldType::Str),
        ("i_c", FieldType::BString),
        ("i_s", FieldType::BString),
        ("k_s", FieldType::BString),
        ("e", FieldType::Mpint),
        ("f", FieldType::Mpint),
        ("k", FieldType::Mpint),
    ]);
    let values: FieldMap = [
        ("v_c", Value::Str(input.client_version.to_string())),
        ("v_s", Value::Str(input.server_version.to_string())),
        ("i_c", Value::BString(input.client_kexinit.to_vec())),
        ("i_s", Value::BString(input.server_kexinit.to_vec())),
        ("k_s", Value::BString(input.host_key.to_vec())),
        ("e", Value::Mpint(input.e.to_vec())),
        ("f", Value::Mpint(input.f.to_vec())),
        ("k", Value::Mpint(input.k.to_vec())),
    ]
    .into();
    let mut blob = def.encode_to_vec(&values)?;
    let digest = hash.digest(&blob);
    blob.zeroize();
    Ok(digest)
}

/// Derives one session key (RFC 4253 section 7.2).
///
/// `key_type` is the letter 'A' through 'F'; output is extended by
/// rehashing until `key_length` bytes are available:
///
/// ```text
/// K1 = HASH(K || H || letter || session_id)
/// Kn = HASH(K || H || K1 || ... || K(n-1))
/// ```
///
/// where K is encoded as an mpint.
pub fn derive_key(
    hash: HashAlgorithm,
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let k_mpint = codec::mpint_to_vec(shared_secret);

    let mut first = Vec::with_capacity(k_mpint.len() + exchange_hash.len() + 1 + session_id.len());
    first.extend_from_slice(&k_mpint);
    first.extend_from_slice(exchange_hash);
    first.push(key_type);
    first.extend_from_slice(session_id);
    let mut output = hash.digest(&first);
    first.zeroize();

    while output.len() < key_length {
        let mut more = Vec::with_capacity(k_mpint.len() + exchange_hash.len() + output.len());
        more.extend_from_slice(&k_mpint);
        more.extend_from_slice(exchange_hash);
        more.extend_from_slice(&output);
        output.extend(hash.digest(&more));
        more.zeroize();
    }

    output.truncate(key_length);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kex_algorithm_names() {
        assert_eq!(
            KexAlgorithm::from_name("diffie-hellman-group14-sha256"),
            Some(KexAlgorithm::DhGroup14Sha256)
        );
        assert_eq!(KexAlgorithm::from_name("curve25519-sha256"), None);
        assert_eq!(
            KexAlgorithm::DhGroup14Sha1.hash(),
            HashAlgorithm::Sha1
        );
    }

    #[test]
    fn test_group14_prime_shape() {
        let p_bytes = dh_group14::P.to_bytes_be();
        assert_eq!(p_bytes.len(), 256);
        assert_eq!(p_bytes[0], 0xff);
        assert_eq!(p_bytes[255], 0xff);
    }

    #[test]
    fn test_dh_shared_secret_agreement() {
        let client = DhExchange::generate();
        let server = DhExchange::generate();
        let client_k = client.compute_shared_secret(server.public_key()).unwrap();
        let server_k = server.compute_shared_secret(client.public_key()).unwrap();
        assert_eq!(client_k, server_k);
        assert!(!client_k.is_empty());
    }

    #[test]
    fn test_dh_rejects_degenerate_peer_values() {
        let exchange = DhExchange::generate();
        assert!(exchange.compute_shared_secret(&[0]).is_err());
        assert!(exchange.compute_shared_secret(&[1]).is_err());
        let p_minus_one = (dh_group14::P.clone() - 1u32).to_bytes_be();
        assert!(exchange.compute_shared_secret(&p_minus_one).is_err());
        let p = dh_group14::P.to_bytes_be();
        assert!(exchange.compute_shared_secret(&p).is_err());
    }

    #[test]
    fn test_exchange_hash_is_deterministic() {
        let input = ExchangeHashInput {
            client_version: "SSH-2.0-client",
            server_version: "SSH-2.0-server",
            client_kexinit: &[20, 1, 2, 3],
            server_kexinit: &[20, 4, 5, 6],
            host_key: &[7, 8, 9],
            e: &[0x12, 0x34],
            f: &[0x56, 0x78],
            k: &[0x9a, 0xbc],
        };
        let h1 = exchange_hash(HashAlgorithm::Sha256, &input).unwrap();
        let h2 = exchange_hash(HashAlgorithm::Sha256, &input).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);

        let mut other = input.clone();
        other.e = &[0x12, 0x35];
        assert_ne!(h1, exchange_hash(HashAlgorithm::Sha256, &other).unwrap());
    }

    #[test]
    fn test_derive_key_lengths() {
        let k = [1u8; 32];
        let h = [2u8; 32];
        let sid = [3u8; 32];
        for len in [16, 20, 32, 64] {
            let key = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', len);
            assert_eq!(key.len(), len);
        }
        // 64 bytes needs two hash rounds; the first 32 must be stable.
        let short = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', 32);
        let long = derive_key(HashAlgorithm::Sha256, &k, &h, &sid, b'A', 64);
        assert_eq!(&long[..32], &short[..]);
    }

    #[test]
    fn test_derive_key_letters_differ() {
        let k = [1u8; 32];
        let h = [2u8; 32];
        let sid = [3u8; 32];
        let a = derive_key(HashAlgorithm::Sha1, &k, &h, &sid, b'A', 16);
        let b = derive_key(HashAlgorithm::Sha1, &k, &h, &sid, b'B', 16);
        assert_ne!(a, b);
    }
}
