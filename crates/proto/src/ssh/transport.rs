//! The SSH transport engine (RFC 4253).
//!
//! [`Transport`] is sans-IO: raw bytes from the peer go in through
//! [`Transport::feed`], protocol events come out, and bytes to send
//! accumulate until drained with [`Transport::take_outbound`]. The engine
//! is chunk-agnostic; input may be split at any byte boundary.
//!
//! The engine drives the version exchange, KEXINIT negotiation,
//! Diffie-Hellman key exchange, NEWKEYS key switchover, service requests,
//! and rekeying. Application messages (ids 50 and up) pass through once a
//! service has been accepted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kedge_platform::{KedgeError, KedgeResult};
use tracing::{debug, error, info, warn};

use crate::ssh::codec::{FieldMap, Value};
use crate::ssh::crypto::{Cipher, MacKey};
use crate::ssh::dispatcher::{classify, DispatchClass};
use crate::ssh::kex::{KexInit, NegotiatedAlgorithms};
use crate::ssh::kex_dh::{
    derive_key, exchange_hash, DhExchange, ExchangeHashInput, HostKeySigner, HostKeyVerifier,
};
use crate::ssh::message::{disconnect_reason, MessageId, MessageRegistry};
use crate::ssh::packet::{PacketReader, PacketWriter};
use crate::ssh::service::ServiceRegistry;
use crate::ssh::version::{Version, VersionProgress, VersionReader};

/// Which end of the connection this engine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The connecting side; initiates KEXDH_INIT and service requests.
    Client,
    /// The listening side; holds the host key.
    Server,
}

/// Tunables for a transport instance.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local identification sent during the version exchange.
    pub version: Version,
    /// Rekey after this many bytes in either direction.
    pub rekey_bytes_limit: u64,
    /// Rekey after this much time since the last key exchange.
    pub rekey_time_limit: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::local(),
            rekey_bytes_limit: 1024 * 1024 * 1024,
            rekey_time_limit: Duration::from_secs(3600),
        }
    }
}

/// Something the protocol surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer's identification string was received.
    VersionExchanged {
        /// Parsed peer identification.
        peer: Version,
        /// Text lines the peer sent before its identification.
        prelude: Vec<String>,
    },
    /// A key exchange finished and both directions switched keys.
    KeysEstablished {
        /// False for rekeys.
        initial: bool,
    },
    /// The server accepted our service request (client side).
    ServiceAccepted {
        /// The accepted service name.
        service: String,
    },
    /// A registered service was requested and accepted (server side).
    ServiceRequested {
        /// The requested service name.
        service: String,
    },
    /// An application-layer message arrived; the payload includes the
    /// leading message id byte.
    ApplicationMessage {
        /// Full message payload.
        payload: Vec<u8>,
    },
    /// The peer sent SSH_MSG_DEBUG.
    Debug {
        /// Whether the peer asked for the message to be shown.
        always_display: bool,
        /// The debug text.
        message: String,
    },
    /// The peer did not understand one of our packets.
    PeerUnimplemented {
        /// The peer-side sequence number of the rejected packet.
        seq: u32,
    },
    /// The peer disconnected.
    Disconnected {
        /// RFC 4253 reason code.
        reason_code: u32,
        /// Human-readable description.
        description: String,
    },
}

/// Our KEXINIT is out; the peer's has not arrived.
struct KexNegotiation {
    local_init: KexInit,
    local_payload: Vec<u8>,
}

/// Algorithms agreed; the Diffie-Hellman round trip is in flight.
struct KexExchange {
    local_payload: Vec<u8>,
    peer_payload: Vec<u8>,
    negotiated: NegotiatedAlgorithms,
    /// The client's ephemeral keypair; the server generates its own on
    /// KEXDH_INIT.
    dh: Option<DhExchange>,
}

/// Our NEWKEYS is sent and transmit keys are live; waiting for the
/// peer's NEWKEYS to switch the receive direction.
struct KexCompleting {
    rx_cipher: Cipher,
    rx_mac: MacKey,
}

/// Key exchange progression. Exactly one exchange runs at a time; `Idle`
/// means keys from the last completed exchange (if any) are in use.
enum KexState {
    Idle,
    Negotiating(KexNegotiation),
    Exchanging(KexExchange),
    Completing(KexCompleting),
}

impl KexState {
    fn is_idle(&self) -> bool {
        matches!(self, KexState::Idle)
    }
}

/// Sans-IO SSH transport engine for one connection.
pub struct Transport {
    role: Role,
    config: TransportConfig,
    registry: MessageRegistry,
    signer: Option<Arc<dyn HostKeySigner>>,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    services: ServiceRegistry,

    started: bool,
    local_version_line: String,
    version_reader: VersionReader,
    peer_version: Option<Version>,
    peer_version_line: Option<String>,

    reader: PacketReader,
    writer: PacketWriter,
    outbound: Vec<u8>,

    kex: KexState,
    session_id: Option<Vec<u8>>,
    established: bool,

    requested_service: Option<String>,
    accepted_service: Option<String>,
    pending_sends: Vec<Vec<u8>>,

    bytes_since_rekey: u64,
    last_rekey: Instant,

    disconnect_sent: bool,
    peer_disconnected: bool,
}

impl Transport {
    /// Creates the client side. The verifier decides host key trust.
    pub fn client(config: TransportConfig, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        Self::new(Role::Client, config, None, Some(verifier), ServiceRegistry::new())
    }

    /// Creates the server side with its host key and accepted services.
    pub fn server(
        config: TransportConfig,
        signer: Arc<dyn HostKeySigner>,
        services: ServiceRegistry,
    ) -> Self {
        Self::new(Role::Server, config, Some(signer), None, services)
    }

    fn new(
        role: Role,
        config: TransportConfig,
        signer: Option<Arc<dyn HostKeySigner>>,
        verifier: Option<Arc<dyn HostKeyVerifier>>,
        services: ServiceRegistry,
    ) -> Self {
        let local_version_line = config.version.to_string();
        Self {
            role,
            config,
            registry: MessageRegistry::standard(),
            signer,
            verifier,
            services,
            started: false,
            local_version_line,
            version_reader: VersionReader::new(),
            peer_version: None,
            peer_version_line: None,
            reader: PacketReader::new(),
            writer: PacketWriter::new(),
            outbound: Vec::new(),
            kex: KexState::Idle,
            session_id: None,
            established: false,
            requested_service: None,
            accepted_service: None,
            pending_sends: Vec::new(),
            bytes_since_rekey: 0,
            last_rekey: Instant::now(),
            disconnect_sent: false,
            peer_disconnected: false,
        }
    }

    /// Queues the identification string and the first KEXINIT. Must be
    /// called once before the first [`feed`](Self::feed).
    pub fn start(&mut self) -> KedgeResult<()> {
        if self.started {
            return Err(KedgeError::Config("transport already started".to_string()));
        }
        self.started = true;
        self.outbound
            .extend_from_slice(&self.config.version.to_wire());
        debug!(role = ?self.role, version = %self.local_version_line, "version line queued");
        self.start_kex()
    }

    /// Whether at least one key exchange has completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// The session identifier, fixed at the first exchange hash.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The peer's identification, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Drains bytes queued for the peer. The driver writes the whole
    /// batch in one call.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }

    /// Consumes bytes from the peer and returns the events they caused.
    pub fn feed(&mut self, data: &[u8]) -> KedgeResult<Vec<TransportEvent>> {
        if !self.started {
            return Err(KedgeError::Config("transport not started".to_string()));
        }
        let mut events = Vec::new();
        if self.peer_disconnected {
            return Ok(events);
        }

        if self.peer_version.is_none() {
            match self.version_reader.feed(data)? {
                VersionProgress::Incomplete => return Ok(events),
                VersionProgress::Done {
                    version,
                    raw_line,
                    prelude,
                    consumed,
                } => {
                    info!(peer = %version, "peer identification received");
                    self.peer_version = Some(version.clone());
                    self.peer_version_line = Some(raw_line);
                    events.push(TransportEvent::VersionExchanged {
                        peer: version,
                        prelude,
                    });
                    self.reader.feed(&data[consumed..]);
                }
            }
        } else {
            self.reader.feed(data);
        }

        while let Some(packet) = self.reader.next_packet()? {
            self.bytes_since_rekey += packet.payload.len() as u64;
            self.handle_payload(&packet.payload, packet.seq, &mut events)?;
            if self.peer_disconnected {
                return Ok(events);
            }
        }

        self.maybe_rekey()?;
        Ok(events)
    }

    /// Sends an application-layer message. The payload must start with an
    /// id of 50 or more. While a key exchange is in flight the message is
    /// queued and flushed after NEWKEYS.
    pub fn send_application(&mut self, payload: Vec<u8>) -> KedgeResult<()> {
        match payload.first() {
            Some(&id) if id >= 50 => {}
            _ => {
                return Err(KedgeError::Config(
                    "application payload must start with an id of 50 or more".to_string(),
                ))
            }
        }
        if !self.established || !self.kex.is_idle() {
            debug!(len = payload.len(), "queueing application message during kex");
            self.pending_sends.push(payload);
            return Ok(());
        }
        self.send_payload(&payload)?;
        self.maybe_rekey()
    }

    /// Requests a service by name (client side). Sent immediately when the
    /// transport is established, otherwise queued until it is.
    pub fn request_service(&mut self, name: &str) -> KedgeResult<()> {
        if self.role != Role::Client {
            return Err(KedgeError::Config(
                "only the client requests services".to_string(),
            ));
        }
        if self.established && self.kex.is_idle() {
            let payload = self.build_payload(
                MessageId::ServiceRequest,
                &[("service_name", Value::Str(name.to_string()))].into(),
            )?;
            self.send_payload(&payload)?;
        } else {
            self.requested_service = Some(name.to_string());
        }
        Ok(())
    }

    /// Starts a key exchange now if none is in flight. Rekeys also happen
    /// automatically on the configured byte and time thresholds.
    pub fn rekey(&mut self) -> KedgeResult<()> {
        if self.established && self.kex.is_idle() && !self.disconnect_sent {
            info!("rekey requested");
            self.start_kex()?;
        }
        Ok(())
    }

    /// Sends SSH_MSG_DISCONNECT. Nothing may be sent afterwards.
    pub fn disconnect(&mut self, reason_code: u32, description: &str) -> KedgeResult<()> {
        if self.disconnect_sent {
            return Ok(());
        }
        let payload = self.build_payload(
            MessageId::Disconnect,
            &[
                ("reason_code", Value::U32(reason_code)),
                ("description", Value::Str(description.to_string())),
                ("language", Value::Str(String::new())),
            ]
            .into(),
        )?;
        self.send_payload(&payload)?;
        self.disconnect_sent = true;
        info!(reason_code, description, "disconnect sent");
        Ok(())
    }

    /// Sends SSH_MSG_IGNORE with the given filler data.
    pub fn send_ignore(&mut self, data: &[u8]) -> KedgeResult<()> {
        let payload = self.build_payload(
            MessageId::Ignore,
            &[("data", Value::BString(data.to_vec()))].into(),
        )?;
        self.send_payload(&payload)
    }

    /// Sends SSH_MSG_DEBUG.
    pub fn send_debug(&mut self, always_display: bool, message: &str) -> KedgeResult<()> {
        let payload = self.build_payload(
            MessageId::Debug,
            &[
                ("always_display", Value::Boolean(always_display)),
                ("message", Value::Str(message.to_string())),
                ("language", Value::Str(String::new())),
            ]
            .into(),
        )?;
        self.send_payload(&payload)
    }

    fn build_payload(&self, id: MessageId, fields: &FieldMap) -> KedgeResult<Vec<u8>> {
        let def = self.registry.def(id);
        let mut payload = vec![id as u8];
        payload.extend(def.body.encode_to_vec(fields)?);
        Ok(payload)
    }

    fn send_payload(&mut self, payload: &[u8]) -> KedgeResult<()> {
        if self.disconnect_sent {
            return Err(KedgeError::Config("send after disconnect".to_string()));
        }
        let wire = self.writer.seal(payload)?;
        self.bytes_since_rekey += wire.len() as u64;
        self.outbound.extend_from_slice(&wire);
        Ok(())
    }

    fn send_unimplemented(&mut self, seq: u32) -> KedgeResult<()> {
        warn!(seq, "answering unknown packet with SSH_MSG_UNIMPLEMENTED");
        let payload = self.build_payload(
            MessageId::Unimplemented,
            &[("sequence_number", Value::U32(seq))].into(),
        )?;
        self.send_payload(&payload)
    }

    fn start_kex(&mut self) -> KedgeResult<()> {
        let host_key_algorithms = match self.role {
            Role::Server => {
                let signer = self.signer.as_ref().ok_or_else(|| {
                    KedgeError::Config("server transport has no host key signer".to_string())
                })?;
                vec![signer.algorithm().to_string()]
            }
            Role::Client => {
                let verifier = self.verifier.as_ref().ok_or_else(|| {
                    KedgeError::Config("client transport has no host key verifier".to_string())
                })?;
                verifier.algorithms().iter().map(|s| s.to_string()).collect()
            }
        };
        let local_init = KexInit::with_defaults(host_key_algorithms);
        let local_payload = local_init.to_payload(&self.registry)?;
        self.send_payload(&local_payload)?;
        debug!(role = ?self.role, "KEXINIT sent");
        self.kex = KexState::Negotiating(KexNegotiation {
            local_init,
            local_payload,
        });
        Ok(())
    }

    fn maybe_rekey(&mut self) -> KedgeResult<()> {
        if !self.established || !self.kex.is_idle() || self.disconnect_sent {
            return Ok(());
        }
        let over_bytes = self.bytes_since_rekey >= self.config.rekey_bytes_limit;
        let over_time = self.last_rekey.elapsed() >= self.config.rekey_time_limit;
        if over_bytes || over_time {
            info!(
                bytes = self.bytes_since_rekey,
                over_bytes, over_time, "initiating rekey"
            );
            self.start_kex()?;
        }
        Ok(())
    }

    fn handle_payload(
        &mut self,
        payload: &[u8],
        seq: u32,
        events: &mut Vec<TransportEvent>,
    ) -> KedgeResult<()> {
        let id = *payload
            .first()
            .ok_or_else(|| KedgeError::Frame("packet with empty payload".to_string()))?;
        match classify(id) {
            DispatchClass::Transport(msg) => self.handle_transport(msg, &payload[1..], seq, events),
            DispatchClass::KexMethod(id) => self.handle_kex_method(id, payload, seq),
            DispatchClass::Application(_) => {
                if self.established && self.accepted_service.is_some() {
                    events.push(TransportEvent::ApplicationMessage {
                        payload: payload.to_vec(),
                    });
                    Ok(())
                } else {
                    warn!(id, seq, "application message before service accept");
                    self.send_unimplemented(seq)
                }
            }
            DispatchClass::Unknown(id) => {
                debug!(id, seq, "unknown message id");
                self.send_unimplemented(seq)
            }
        }
    }

    fn handle_transport(
        &mut self,
        msg: MessageId,
        body: &[u8],
        seq: u32,
        events: &mut Vec<TransportEvent>,
    ) -> KedgeResult<()> {
        match msg {
            MessageId::Disconnect => {
                let fields = self.registry.def(msg).body.decode_from(body)?;
                let reason_code = fields.get_u32("reason_code")?;
                let description = fields.get_str("description")?.to_string();
                info!(reason_code, %description, "peer disconnected");
                self.peer_disconnected = true;
                events.push(TransportEvent::Disconnected {
                    reason_code,
                    description,
                });
                Ok(())
            }
            MessageId::Ignore => {
                self.registry.def(msg).body.decode_from(body)?;
                Ok(())
            }
            MessageId::Unimplemented => {
                let fields = self.registry.def(msg).body.decode_from(body)?;
                let seq = fields.get_u32("sequence_number")?;
                warn!(seq, "peer reported packet as unimplemented");
                events.push(TransportEvent::PeerUnimplemented { seq });
                Ok(())
            }
            MessageId::Debug => {
                let fields = self.registry.def(msg).body.decode_from(body)?;
                let always_display = fields.get_bool("always_display")?;
                let message = fields.get_str("message")?.to_string();
                debug!(%message, "peer debug message");
                events.push(TransportEvent::Debug {
                    always_display,
                    message,
                });
                Ok(())
            }
            MessageId::ServiceRequest => self.handle_service_request(body, seq, events),
            MessageId::ServiceAccept => {
                if self.role != Role::Client {
                    warn!(seq, "SERVICE_ACCEPT received by a server");
                    return self.send_unimplemented(seq);
                }
                let fields = self.registry.def(msg).body.decode_from(body)?;
                let service = fields.get_str("service_name")?.to_string();
                info!(%service, "service accepted");
                self.accepted_service = Some(service.clone());
                events.push(TransportEvent::ServiceAccepted { service });
                Ok(())
            }
            MessageId::KexInit => self.handle_kexinit(body),
            MessageId::NewKeys => self.handle_newkeys(events),
            MessageId::KexDhInit | MessageId::KexDhReply => {
                unreachable!("kex method range is classified separately")
            }
        }
    }

    fn handle_service_request(
        &mut self,
        body: &[u8],
        seq: u32,
        events: &mut Vec<TransportEvent>,
    ) -> KedgeResult<()> {
        // Out-of-sequence requests (wrong role, before the first key
        // exchange, or after a service is already up) are answered with
        // unimplemented; the connection stays usable.
        if self.role != Role::Server || !self.established || self.accepted_service.is_some() {
            warn!(seq, "SERVICE_REQUEST out of sequence");
            return self.send_unimplemented(seq);
        }
        let fields = self
            .registry
            .def(MessageId::ServiceRequest)
            .body
            .decode_from(body)?;
        let service = fields.get_str("service_name")?.to_string();
        if !self.services.contains(&service) {
            error!(%service, "unknown service requested");
            self.disconnect(
                disconnect_reason::SERVICE_NOT_AVAILABLE,
                &format!("service {service} not available"),
            )?;
            return Err(KedgeError::Negotiation(format!(
                "service {service} not available"
            )));
        }
        info!(%service, "service request accepted");
        let accept = self.build_payload(
            MessageId::ServiceAccept,
            &[("service_name", Value::Str(service.clone()))].into(),
        )?;
        if self.kex.is_idle() {
            self.send_payload(&accept)?;
        } else {
            // Mid-rekey; the accept goes out right behind our NEWKEYS.
            self.pending_sends.push(accept);
        }
        self.accepted_service = Some(service.clone());
        events.push(TransportEvent::ServiceRequested { service });
        Ok(())
    }

    fn handle_kexinit(&mut self, body: &[u8]) -> KedgeResult<()> {
        if self.kex.is_idle() {
            // Peer-initiated rekey; answer with our own KEXINIT first.
            info!("peer initiated rekey");
            self.start_kex()?;
        }
        let negotiation = match std::mem::replace(&mut self.kex, KexState::Idle) {
            KexState::Negotiating(n) => n,
            other => {
                self.kex = other;
                return Err(KedgeError::Negotiation(
                    "duplicate KEXINIT during key exchange".to_string(),
                ));
            }
        };

        let fields = self
            .registry
            .def(MessageId::KexInit)
            .body
            .decode_from(body)?;
        let peer_init = KexInit::from_fields(&fields)?;
        let mut peer_payload = vec![MessageId::KexInit as u8];
        peer_payload.extend_from_slice(body);

        let (client_init, server_init) = match self.role {
            Role::Client => (&negotiation.local_init, &peer_init),
            Role::Server => (&peer_init, &negotiation.local_init),
        };
        let negotiated = match NegotiatedAlgorithms::negotiate(client_init, server_init) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                error!(%err, "algorithm negotiation failed");
                self.disconnect(disconnect_reason::KEY_EXCHANGE_FAILED, &err.to_string())?;
                return Err(err);
            }
        };
        info!(
            kex = negotiated.kex.name(),
            host_key = %negotiated.host_key,
            cipher = negotiated.cipher_client_to_server.name(),
            mac = negotiated.mac_client_to_server.name(),
            "algorithms negotiated"
        );
        if peer_init.first_kex_packet_follows
            && !negotiated.guess_was_right(client_init, server_init)
        {
            debug!("peer guessed wrong; discarding its first kex packet");
            self.reader.skip_packets(1);
        }

        let mut exchange = KexExchange {
            local_payload: negotiation.local_payload,
            peer_payload,
            negotiated,
            dh: None,
        };
        if self.role == Role::Client {
            let dh = DhExchange::generate();
            let payload = self.build_payload(
                MessageId::KexDhInit,
                &[("e", Value::Mpint(dh.public_key().to_vec()))].into(),
            )?;
            self.send_payload(&payload)?;
            debug!("KEXDH_INIT sent");
            exchange.dh = Some(dh);
        }
        self.kex = KexState::Exchanging(exchange);
        Ok(())
    }

    fn handle_kex_method(&mut self, id: u8, payload: &[u8], seq: u32) -> KedgeResult<()> {
        if !matches!(self.kex, KexState::Exchanging(_)) {
            return self.send_unimplemented(seq);
        }
        match (self.role, MessageId::from_u8(id)) {
            (Role::Server, Some(MessageId::KexDhInit)) => self.handle_kexdh_init(&payload[1..]),
            (Role::Client, Some(MessageId::KexDhReply)) => self.handle_kexdh_reply(&payload[1..]),
            _ => {
                warn!(id, "unexpected key exchange method message");
                self.send_unimplemented(seq)
            }
        }
    }

    fn take_exchange(&mut self) -> KedgeResult<KexExchange> {
        match std::mem::replace(&mut self.kex, KexState::Idle) {
            KexState::Exchanging(exchange) => Ok(exchange),
            _ => Err(KedgeError::Negotiation(
                "key exchange message outside an exchange".to_string(),
            )),
        }
    }

    fn handle_kexdh_init(&mut self, body: &[u8]) -> KedgeResult<()> {
        let exchange = self.take_exchange()?;
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| KedgeError::Config("no host key signer".to_string()))?;

        let fields = self
            .registry
            .def(MessageId::KexDhInit)
            .body
            .decode_from(body)?;
        let e = fields.get_bytes("e")?.to_vec();

        let dh = DhExchange::generate();
        let shared = dh.compute_shared_secret(&e)?;
        let f = dh.public_key().to_vec();
        let host_key = signer.public_key_blob();

        let hash_algo = exchange.negotiated.kex.hash();
        let peer_line = self
            .peer_version_line
            .as_deref()
            .ok_or_else(|| KedgeError::Negotiation("KEXDH_INIT before version".to_string()))?;
        let hash = exchange_hash(
            hash_algo,
            &ExchangeHashInput {
                client_version: peer_line,
                server_version: &self.local_version_line,
                client_kexinit: &exchange.peer_payload,
                server_kexinit: &exchange.local_payload,
                host_key: &host_key,
                e: &e,
                f: &f,
                k: &shared,
            },
        )?;
        let signature = signer.sign(&hash)?;
        debug!("exchange hash computed and signed");

        let reply = self.build_payload(
            MessageId::KexDhReply,
            &[
                ("host_key", Value::BString(host_key)),
                ("f", Value::Mpint(f)),
                ("signature", Value::BString(signature)),
            ]
            .into(),
        )?;
        self.send_payload(&reply)?;
        self.finish_dh(&exchange.negotiated, shared, hash)
    }

    fn handle_kexdh_reply(&mut self, body: &[u8]) -> KedgeResult<()> {
        let mut exchange = self.take_exchange()?;
        let verifier = self
            .verifier
            .clone()
            .ok_or_else(|| KedgeError::Config("no host key verifier".to_string()))?;

        let fields = self
            .registry
            .def(MessageId::KexDhReply)
            .body
            .decode_from(body)?;
        let host_key = fields.get_bytes("host_key")?.to_vec();
        let f = fields.get_bytes("f")?.to_vec();
        let signature = fields.get_bytes("signature")?.to_vec();

        let dh = exchange
            .dh
            .take()
            .ok_or_else(|| KedgeError::Negotiation("KEXDH_REPLY before KEXDH_INIT".to_string()))?;
        let shared = dh.compute_shared_secret(&f)?;

        let hash_algo = exchange.negotiated.kex.hash();
        let peer_line = self
            .peer_version_line
            .as_deref()
            .ok_or_else(|| KedgeError::Negotiation("KEXDH_REPLY before version".to_string()))?;
        let hash = exchange_hash(
            hash_algo,
            &ExchangeHashInput {
                client_version: &self.local_version_line,
                server_version: peer_line,
                client_kexinit: &exchange.local_payload,
                server_kexinit: &exchange.peer_payload,
                host_key: &host_key,
                e: dh.public_key(),
                f: &f,
                k: &shared,
            },
        )?;
        verifier.verify(&host_key, &hash, &signature)?;
        debug!("host key signature verified");

        self.finish_dh(&exchange.negotiated, shared, hash)
    }

    /// Derives both directions' keys, sends NEWKEYS, and switches the
    /// transmit direction. The receive direction switches when the peer's
    /// NEWKEYS arrives.
    fn finish_dh(
        &mut self,
        negotiated: &NegotiatedAlgorithms,
        shared: Vec<u8>,
        hash: Vec<u8>,
    ) -> KedgeResult<()> {
        let hash_algo = negotiated.kex.hash();
        let session_id = self.session_id.clone().unwrap_or_else(|| hash.clone());

        let derive =
            |letter: u8, len: usize| derive_key(hash_algo, &shared, &hash, &session_id, letter, len);

        // RFC 4253 section 7.2: IVs A/B, cipher keys C/D, MAC keys E/F,
        // client-to-server first.
        let c2s_cipher = negotiated.cipher_client_to_server;
        let s2c_cipher = negotiated.cipher_server_to_client;
        let c2s_mac = negotiated.mac_client_to_server;
        let s2c_mac = negotiated.mac_server_to_client;

        let iv_c2s = derive(b'A', c2s_cipher.iv_size());
        let iv_s2c = derive(b'B', s2c_cipher.iv_size());
        let key_c2s = derive(b'C', c2s_cipher.key_size());
        let key_s2c = derive(b'D', s2c_cipher.key_size());
        let mac_c2s = derive(b'E', c2s_mac.key_size());
        let mac_s2c = derive(b'F', s2c_mac.key_size());

        let (tx_cipher, tx_mac, rx_cipher, rx_mac) = match self.role {
            Role::Client => (
                Cipher::encryptor(c2s_cipher, &key_c2s, &iv_c2s)?,
                MacKey::new(c2s_mac, &mac_c2s)?,
                Cipher::decryptor(s2c_cipher, &key_s2c, &iv_s2c)?,
                MacKey::new(s2c_mac, &mac_s2c)?,
            ),
            Role::Server => (
                Cipher::encryptor(s2c_cipher, &key_s2c, &iv_s2c)?,
                MacKey::new(s2c_mac, &mac_s2c)?,
                Cipher::decryptor(c2s_cipher, &key_c2s, &iv_c2s)?,
                MacKey::new(c2s_mac, &mac_c2s)?,
            ),
        };

        if self.session_id.is_none() {
            self.session_id = Some(hash);
        }

        let newkeys = self.build_payload(MessageId::NewKeys, &FieldMap::new())?;
        self.send_payload(&newkeys)?;
        self.writer.enable(tx_cipher, tx_mac);
        self.kex = KexState::Completing(KexCompleting { rx_cipher, rx_mac });
        debug!(role = ?self.role, "NEWKEYS sent, transmit keys active");
        self.flush_pending()
    }

    /// Sends everything deferred during the exchange, right behind our
    /// NEWKEYS so it travels under the new transmit keys.
    fn flush_pending(&mut self) -> KedgeResult<()> {
        if let Some(name) = self.requested_service.take() {
            let payload = self.build_payload(
                MessageId::ServiceRequest,
                &[("service_name", Value::Str(name))].into(),
            )?;
            self.send_payload(&payload)?;
        }
        for payload in std::mem::take(&mut self.pending_sends) {
            self.send_payload(&payload)?;
        }
        Ok(())
    }

    fn handle_newkeys(&mut self, events: &mut Vec<TransportEvent>) -> KedgeResult<()> {
        let completing = match std::mem::replace(&mut self.kex, KexState::Idle) {
            KexState::Completing(c) => c,
            other => {
                self.kex = other;
                return Err(KedgeError::Negotiation(
                    "NEWKEYS before key exchange finished".to_string(),
                ));
            }
        };
        self.reader.enable(completing.rx_cipher, completing.rx_mac)?;

        let initial = !self.established;
        self.established = true;
        self.bytes_since_rekey = 0;
        self.last_rekey = Instant::now();
        info!(initial, "key exchange complete");
        events.push(TransportEvent::KeysEstablished { initial });
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self.kex {
            KexState::Idle => "idle",
            KexState::Negotiating(_) => "negotiating",
            KexState::Exchanging(_) => "exchanging",
            KexState::Completing(_) => "completing",
        };
        f.debug_struct("Transport")
            .field("role", &self.role)
            .field("established", &self.established)
            .field("kex", &phase)
            .finish_non_exhaustive()
    }
}
