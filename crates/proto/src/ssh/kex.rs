//! KEXINIT exchange and algorithm negotiation (RFC 4253 section 7.1).
//!
//! Both sides send a KEXINIT listing supported algorithms in preference
//! order. For each category the negotiated algorithm is the first entry in
//! the client's list that also appears in the server's list.

use kedge_platform::{KedgeError, KedgeResult};
use rand::RngCore;

use crate::ssh::codec::{names, FieldMap, Value};
use crate::ssh::crypto::{CipherAlgorithm, MacAlgorithm};
use crate::ssh::kex_dh::KexAlgorithm;
use crate::ssh::message::{MessageId, MessageRegistry};

/// A KEXINIT message, minus the reserved trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// 16 random bytes.
    pub cookie: [u8; 16],
    /// Key exchange methods.
    pub kex_algorithms: Vec<String>,
    /// Server host key types.
    pub server_host_key_algorithms: Vec<String>,
    /// Ciphers, client to server.
    pub encryption_client_to_server: Vec<String>,
    /// Ciphers, server to client.
    pub encryption_server_to_client: Vec<String>,
    /// MACs, client to server.
    pub mac_client_to_server: Vec<String>,
    /// MACs, server to client.
    pub mac_server_to_client: Vec<String>,
    /// Compression, client to server.
    pub compression_client_to_server: Vec<String>,
    /// Compression, server to client.
    pub compression_server_to_client: Vec<String>,
    /// Languages, client to server.
    pub languages_client_to_server: Vec<String>,
    /// Languages, server to client.
    pub languages_server_to_client: Vec<String>,
    /// Whether a guessed first key exchange packet follows.
    pub first_kex_packet_follows: bool,
}

impl KexInit {
    /// Builds a KEXINIT offering this crate's full algorithm set, with the
    /// given host key algorithms.
    pub fn with_defaults(host_key_algorithms: Vec<String>) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);
        Self {
            cookie,
            kex_algorithms: names(&[
                KexAlgorithm::DhGroup14Sha256.name(),
                KexAlgorithm::DhGroup14Sha1.name(),
            ]),
            server_host_key_algorithms: host_key_algorithms,
            encryption_client_to_server: names(&[
                CipherAlgorithm::Aes128Ctr.name(),
                CipherAlgorithm::Aes128Cbc.name(),
            ]),
            encryption_server_to_client: names(&[
                CipherAlgorithm::Aes128Ctr.name(),
                CipherAlgorithm::Aes128Cbc.name(),
            ]),
            mac_client_to_server: names(&[
                MacAlgorithm::HmacSha256.name(),
                MacAlgorithm::HmacSha1.name(),
            ]),
            mac_server_to_client: names(&[
                MacAlgorithm::HmacSha256.name(),
                MacAlgorithm::HmacSha1.name(),
            ]),
            compression_client_to_server: names(&["none"]),
            compression_server_to_client: names(&["none"]),
            languages_client_to_server: Vec::new(),
            languages_server_to_client: Vec::new(),
            first_kex_packet_follows: false,
        }
    }

    /// Encodes the full payload, message id byte included. This is the
    /// exact byte string that enters the exchange hash as I_C or I_S.
    pub fn to_payload(&self, registry: &MessageRegistry) -> KedgeResult<Vec<u8>> {
        let def = registry.def(MessageId::KexInit);
        let values: FieldMap = [
            ("cookie", Value::Fixed(self.cookie.to_vec())),
            ("kex_algorithms", Value::NameList(self.kex_algorithms.clone())),
            (
                "server_host_key_algorithms",
                Value::NameList(self.server_host_key_algorithms.clone()),
            ),
            (
                "encryption_client_to_server",
                Value::NameList(self.encryption_client_to_server.clone()),
            ),
            (
                "encryption_server_to_client",
                Value::NameList(self.encryption_server_to_client.clone()),
            ),
            (
                "mac_client_to_server",
                Value::NameList(self.mac_client_to_server.clone()),
            ),
            (
                "mac_server_to_client",
                Value::NameList(self.mac_server_to_client.clone()),
            ),
            (
                "compression_client_to_server",
                Value::NameList(self.compression_client_to_server.clone()),
            ),
            (
                "compression_server_to_client",
                Value::NameList(self.compression_server_to_client.clone()),
            ),
            (
                "languages_client_to_server",
                Value::NameList(self.languages_client_to_server.clone()),
            ),
            (
                "languages_server_to_client",
                Value::NameList(self.languages_server_to_client.clone()),
            ),
            (
                "first_kex_packet_follows",
                Value::Boolean(self.first_kex_packet_follows),
            ),
        ]
        .into();
        let mut payload = vec![MessageId::KexInit as u8];
        payload.extend(def.body.encode_to_vec(&values)?);
        Ok(payload)
    }

    /// Rebuilds a KEXINIT from decoded fields.
    pub fn from_fields(fields: &FieldMap) -> KedgeResult<Self> {
        let cookie_bytes = fields.get_bytes("cookie")?;
        if cookie_bytes.len() != 16 {
            return Err(KedgeError::Frame(format!(
                "KEXINIT cookie is {} bytes",
                cookie_bytes.len()
            )));
        }
        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(cookie_bytes);
        let list = |name: &str| -> KedgeResult<Vec<String>> {
            Ok(fields.get_names(name)?.to_vec())
        };
        Ok(Self {
            cookie,
            kex_algorithms: list("kex_algorithms")?,
            server_host_key_algorithms: list("server_host_key_algorithms")?,
            encryption_client_to_server: list("encryption_client_to_server")?,
            encryption_server_to_client: list("encryption_server_to_client")?,
            mac_client_to_server: list("mac_client_to_server")?,
            mac_server_to_client: list("mac_server_to_client")?,
            compression_client_to_server: list("compression_client_to_server")?,
            compression_server_to_client: list("compression_server_to_client")?,
            languages_client_to_server: list("languages_client_to_server")?,
            languages_server_to_client: list("languages_server_to_client")?,
            first_kex_packet_follows: fields.get_bool("first_kex_packet_follows")?,
        })
    }
}

/// Picks the first client algorithm that the server also supports.
pub fn negotiate_algorithm(
    client: &[String],
    server: &[String],
    category: &str,
) -> KedgeResult<String> {
    client
        .iter()
        .find(|c| server.contains(c))
        .cloned()
        .ok_or_else(|| {
            KedgeError::Negotiation(format!(
                "no common {category} algorithm (client: {client:?}, server: {server:?})"
            ))
        })
}

/// The full outcome of KEXINIT negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: KexAlgorithm,
    /// Server host key algorithm name.
    pub host_key: String,
    /// Cipher, client to server.
    pub cipher_client_to_server: CipherAlgorithm,
    /// Cipher, server to client.
    pub cipher_server_to_client: CipherAlgorithm,
    /// MAC, client to server.
    pub mac_client_to_server: MacAlgorithm,
    /// MAC, server to client.
    pub mac_server_to_client: MacAlgorithm,
}

impl NegotiatedAlgorithms {
    /// Negotiates every category from the two KEXINIT messages.
    pub fn negotiate(client: &KexInit, server: &KexInit) -> KedgeResult<Self> {
        let kex_name = negotiate_algorithm(
            &client.kex_algorithms,
            &server.kex_algorithms,
            "key exchange",
        )?;
        let kex = KexAlgorithm::from_name(&kex_name).ok_or_else(|| {
            KedgeError::Negotiation(format!("negotiated unknown kex method {kex_name}"))
        })?;
        let host_key = negotiate_algorithm(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
            "host key",
        )?;
        let resolve_cipher = |name: String| {
            CipherAlgorithm::from_name(&name).ok_or_else(|| {
                KedgeError::Negotiation(format!("negotiated unknown cipher {name}"))
            })
        };
        let resolve_mac = |name: String| {
            MacAlgorithm::from_name(&name).ok_or_else(|| {
                KedgeError::Negotiation(format!("negotiated unknown MAC {name}"))
            })
        };
        let cipher_client_to_server = resolve_cipher(negotiate_algorithm(
            &client.encryption_client_to_server,
            &server.encryption_client_to_server,
            "cipher",
        )?)?;
        let cipher_server_to_client = resolve_cipher(negotiate_algorithm(
            &client.encryption_server_to_client,
            &server.encryption_server_to_client,
            "cipher",
        )?)?;
        let mac_client_to_server = resolve_mac(negotiate_algorithm(
            &client.mac_client_to_server,
            &server.mac_client_to_server,
            "MAC",
        )?)?;
        let mac_server_to_client = resolve_mac(negotiate_algorithm(
            &client.mac_server_to_client,
            &server.mac_server_to_client,
            "MAC",
        )?)?;
        let compression = negotiate_algorithm(
            &client.compression_client_to_server,
            &server.compression_client_to_server,
            "compression",
        )?;
        if compression != "none" {
            return Err(KedgeError::Negotiation(format!(
                "compression {compression}"
            )));
        }
        Ok(Self {
            kex,
            host_key,
            cipher_client_to_server,
            cipher_server_to_client,
            mac_client_to_server,
            mac_server_to_client,
        })
    }

    /// Whether a peer that sent first_kex_packet_follows guessed the
    /// negotiated method. A wrong guess means its first key exchange
    /// packet must be discarded.
    pub fn guess_was_right(&self, client: &KexInit, server: &KexInit) -> bool {
        client.kex_algorithms.first() == server.kex_algorithms.first()
            && client.server_host_key_algorithms.first()
                == server.server_host_key_algorithms.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_first_client_match() {
        let client = names(&["a", "b", "c"]);
        let server = names(&["c", "b"]);
        assert_eq!(negotiate_algorithm(&client, &server, "test").unwrap(), "b");
    }

    #[test]
    fn test_negotiate_no_match() {
        let client = names(&["a"]);
        let server = names(&["b"]);
        assert!(negotiate_algorithm(&client, &server, "test").is_err());
    }

    #[test]
    fn test_kexinit_payload_roundtrip() {
        let registry = MessageRegistry::standard();
        let kexinit = KexInit::with_defaults(names(&["ssh-ed25519"]));
        let payload = kexinit.to_payload(&registry).unwrap();
        assert_eq!(payload[0], MessageId::KexInit as u8);

        let def = registry.def(MessageId::KexInit);
        let fields = def.body.decode_from(&payload[1..]).unwrap();
        let parsed = KexInit::from_fields(&fields).unwrap();
        assert_eq!(parsed, kexinit);
    }

    #[test]
    fn test_full_negotiation_with_defaults() {
        let client = KexInit::with_defaults(names(&["ssh-ed25519"]));
        let server = KexInit::with_defaults(names(&["ssh-ed25519"]));
        let negotiated = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, KexAlgorithm::DhGroup14Sha256);
        assert_eq!(negotiated.host_key, "ssh-ed25519");
        assert_eq!(
            negotiated.cipher_client_to_server,
            CipherAlgorithm::Aes128Ctr
        );
        assert_eq!(negotiated.mac_client_to_server, MacAlgorithm::HmacSha256);
        assert!(negotiated.guess_was_right(&client, &server));
    }

    #[test]
    fn test_negotiation_prefers_client_order() {
        let mut client = KexInit::with_defaults(names(&["ssh-ed25519"]));
        client.encryption_client_to_server = names(&["aes128-cbc", "aes128-ctr"]);
        let server = KexInit::with_defaults(names(&["ssh-ed25519"]));
        let negotiated = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();
        assert_eq!(
            negotiated.cipher_client_to_server,
            CipherAlgorithm::Aes128Cbc
        );
    }

    #[test]
    fn test_negotiation_fails_without_common_kex() {
        let mut client = KexInit::with_defaults(names(&["ssh-ed25519"]));
        client.kex_algorithms = names(&["curve25519-sha256"]);
        let server = KexInit::with_defaults(names(&["ssh-ed25519"]));
        assert!(NegotiatedAlgorithms::negotiate(&client, &server).is_err());
    }

    #[test]
    fn test_wrong_guess_detection() {
        let mut client = KexInit::with_defaults(names(&["ssh-ed25519"]));
        client.kex_algorithms = names(&[
            "diffie-hellman-group14-sha1",
            "diffie-hellman-group14-sha256",
        ]);
        let server = KexInit::with_defaults(names(&["ssh-ed25519"]));
        let negotiated = NegotiatedAlgorithms::negotiate(&client, &server).unwrap();
        assert!(!negotiated.guess_was_right(&client, &server));
    }
}
