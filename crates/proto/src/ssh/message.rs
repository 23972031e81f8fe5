//! SSH transport message definitions (RFC 4253 section 12).
//!
//! Each message is a numeric id plus a [`StructDef`] describing its body.
//! The [`MessageRegistry`] maps ids to definitions and is built once at
//! connection setup, then shared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::ssh::codec::{FieldType, StructDef};

/// SSH message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// SSH_MSG_DISCONNECT
    Disconnect = 1,
    /// SSH_MSG_IGNORE
    Ignore = 2,
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented = 3,
    /// SSH_MSG_DEBUG
    Debug = 4,
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest = 5,
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept = 6,
    /// SSH_MSG_KEXINIT
    KexInit = 20,
    /// SSH_MSG_NEWKEYS
    NewKeys = 21,
    /// SSH_MSG_KEXDH_INIT
    KexDhInit = 30,
    /// SSH_MSG_KEXDH_REPLY
    KexDhReply = 31,
}

impl MessageId {
    /// Converts a wire byte to a message id.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Disconnect),
            2 => Some(Self::Ignore),
            3 => Some(Self::Unimplemented),
            4 => Some(Self::Debug),
            5 => Some(Self::ServiceRequest),
            6 => Some(Self::ServiceAccept),
            20 => Some(Self::KexInit),
            21 => Some(Self::NewKeys),
            30 => Some(Self::KexDhInit),
            31 => Some(Self::KexDhReply),
            _ => None,
        }
    }

    /// The protocol name of the message.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnect => "SSH_MSG_DISCONNECT",
            Self::Ignore => "SSH_MSG_IGNORE",
            Self::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            Self::Debug => "SSH_MSG_DEBUG",
            Self::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            Self::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            Self::KexInit => "SSH_MSG_KEXINIT",
            Self::NewKeys => "SSH_MSG_NEWKEYS",
            Self::KexDhInit => "SSH_MSG_KEXDH_INIT",
            Self::KexDhReply => "SSH_MSG_KEXDH_REPLY",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Disconnect reason codes (RFC 4253 section 11.1).
pub mod disconnect_reason {
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    pub const PROTOCOL_ERROR: u32 = 2;
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// SSH_DISCONNECT_MAC_ERROR
    pub const MAC_ERROR: u32 = 5;
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// SSH_DISCONNECT_BY_APPLICATION
    pub const BY_APPLICATION: u32 = 11;
}

/// A registered message: its id, name, and body layout.
#[derive(Debug, Clone)]
pub struct MessageDef {
    /// The message id.
    pub id: MessageId,
    /// Body layout, excluding the leading id byte.
    pub body: StructDef,
}

/// Registry of known transport messages, keyed by wire id.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    by_id: HashMap<u8, Arc<MessageDef>>,
}

impl MessageRegistry {
    /// Builds the standard RFC 4253 transport message set.
    pub fn standard() -> Self {
        let mut by_id = HashMap::new();
        let mut add = |id: MessageId, fields: Vec<(&'static str, FieldType)>| {
            by_id.insert(
                id as u8,
                Arc::new(MessageDef {
                    id,
                    body: StructDef::new(fields),
                }),
            );
        };

        add(
            MessageId::Disconnect,
            vec![
                ("reason_code", FieldType::U32),
                ("description", FieldType::Str),
                ("language", FieldType::Str),
            ],
        );
        add(MessageId::Ignore, vec![("data", FieldType::BString)]);
        add(
            MessageId::Unimplemented,
            vec![("sequence_number", FieldType::U32)],
        );
        add(
            MessageId::Debug,
            vec![
                ("always_display", FieldType::Boolean),
                ("message", FieldType::Str),
                ("language", FieldType::Str),
            ],
        );
        add(
            MessageId::ServiceRequest,
            vec![("service_name", FieldType::Str)],
        );
        add(
            MessageId::ServiceAccept,
            vec![("service_name", FieldType::Str)],
        );
        add(
            MessageId::KexInit,
            vec![
                ("cookie", FieldType::Fixed(16)),
                ("kex_algorithms", FieldType::NameList),
                ("server_host_key_algorithms", FieldType::NameList),
                ("encryption_client_to_server", FieldType::NameList),
                ("encryption_server_to_client", FieldType::NameList),
                ("mac_client_to_server", FieldType::NameList),
                ("mac_server_to_client", FieldType::NameList),
                ("compression_client_to_server", FieldType::NameList),
                ("compression_server_to_client", FieldType::NameList),
                ("languages_client_to_server", FieldType::NameList),
                ("languages_server_to_client", FieldType::NameList),
                ("first_kex_packet_follows", FieldType::Boolean),
                ("reserved", FieldType::Skip(4)),
            ],
        );
        add(MessageId::NewKeys, vec![]);
        add(MessageId::KexDhInit, vec![("e", FieldType::Mpint)]);
        add(
            MessageId::KexDhReply,
            vec![
                ("host_key", FieldType::BString),
                ("f", FieldType::Mpint),
                ("signature", FieldType::BString),
            ],
        );

        Self { by_id }
    }

    /// Looks up a message definition by wire id.
    pub fn get(&self, id: u8) -> Option<&Arc<MessageDef>> {
        self.by_id.get(&id)
    }

    /// Looks up by typed id.
    pub fn def(&self, id: MessageId) -> &Arc<MessageDef> {
        // standard() registers every MessageId variant.
        &self.by_id[&(id as u8)]
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::codec::{FieldMap, Value};

    #[test]
    fn test_message_id_conversion() {
        assert_eq!(MessageId::from_u8(20), Some(MessageId::KexInit));
        assert_eq!(MessageId::from_u8(21), Some(MessageId::NewKeys));
        assert_eq!(MessageId::from_u8(99), None);
        assert_eq!(MessageId::KexDhReply as u8, 31);
    }

    #[test]
    fn test_message_names() {
        assert_eq!(MessageId::Disconnect.name(), "SSH_MSG_DISCONNECT");
        assert_eq!(MessageId::KexDhInit.to_string(), "SSH_MSG_KEXDH_INIT");
    }

    #[test]
    fn test_registry_covers_all_ids() {
        let registry = MessageRegistry::standard();
        for id in [1u8, 2, 3, 4, 5, 6, 20, 21, 30, 31] {
            assert!(registry.get(id).is_some(), "missing id {id}");
        }
        assert!(registry.get(50).is_none());
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let registry = MessageRegistry::standard();
        let def = registry.def(MessageId::Disconnect);
        let values: FieldMap = [
            ("reason_code", Value::U32(2)),
            ("description", Value::Str("bad packet".to_string())),
            ("language", Value::Str(String::new())),
        ]
        .into();
        let bytes = def.body.encode_to_vec(&values).unwrap();
        let decoded = def.body.decode_from(&bytes).unwrap();
        assert_eq!(decoded.get_u32("reason_code").unwrap(), 2);
        assert_eq!(decoded.get_str("description").unwrap(), "bad packet");
    }

    #[test]
    fn test_newkeys_has_empty_body() {
        let registry = MessageRegistry::standard();
        let def = registry.def(MessageId::NewKeys);
        let bytes = def.body.encode_to_vec(&FieldMap::new()).unwrap();
        assert!(bytes.is_empty());
    }
}
