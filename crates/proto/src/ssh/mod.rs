//! SSH transport layer (RFC 4253).
//!
//! Modules are layered bottom-up:
//!
//! - [`codec`]: declarative struct codec for SSH wire types
//! - [`message`]: transport message definitions and registry
//! - [`packet`]: binary packet protocol framing
//! - [`version`]: identification string exchange
//! - [`crypto`]: cipher and MAC algorithm implementations
//! - [`kex`]: KEXINIT negotiation
//! - [`kex_dh`]: Diffie-Hellman group14 key exchange
//! - [`service`]: service request/accept handling
//! - [`dispatcher`]: inbound message routing
//! - [`transport`]: the sans-IO transport engine
//! - [`conn`]: tokio connection driver

pub mod codec;
pub mod conn;
pub mod crypto;
pub mod dispatcher;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod service;
pub mod transport;
pub mod version;

pub use codec::{FieldMap, FieldType, StructDef, Value};
pub use conn::Connection;
pub use kex_dh::{HostKeySigner, HostKeyVerifier};
pub use message::{MessageId, MessageRegistry};
pub use transport::{Role, Transport, TransportConfig, TransportEvent};
pub use version::Version;
