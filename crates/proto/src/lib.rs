//! Protocol implementations for kedge.
//!
//! This crate implements the SSH transport layer (RFC 4253): the binary
//! packet protocol, version exchange, algorithm negotiation, Diffie-Hellman
//! key exchange, and session key derivation.
//!
//! The core engine is sans-IO: [`ssh::transport::Transport`] consumes raw
//! bytes via `feed` and emits [`ssh::transport::TransportEvent`]s, while
//! outbound bytes accumulate until drained with `take_outbound`. A thin
//! tokio driver lives in [`ssh::conn`].
//!
//! # Example
//!
//! Wire structures are described declaratively and encoded/decoded through
//! the struct codec:
//!
//! ```
//! use kedge_proto::ssh::codec::{FieldType, StructDef, Value};
//!
//! let def = StructDef::new(vec![("seq", FieldType::U32)]);
//! let bytes = def.encode_to_vec(&[("seq", Value::U32(7))].into()).unwrap();
//! let fields = def.decode_from(&bytes).unwrap();
//! assert_eq!(fields.get_u32("seq").unwrap(), 7);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
