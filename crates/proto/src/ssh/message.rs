//! SSH protocol message types (RFC 4253 Section 12, RFC 4254 Section 9).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Channel management
//!
//! Also defines the transport-generic messages (DISCONNECT, IGNORE, DEBUG,
//! UNIMPLEMENTED) with their encodings.
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert_eq!(msg_type.to_string(), "SSH_MSG_KEXINIT(20)");
//! ```

use bytes::{BufMut, BytesMut};
use halyard_platform::{HalyardError, HalyardResult};

use super::wire::{self, WireReader};

/// SSH message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request.
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,

    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    /// DH/ECDH init; also SSH_MSG_KEX_DH_GEX_REQUEST_OLD.
    KexdhInit = 30,
    /// DH/ECDH reply; also SSH_MSG_KEX_DH_GEX_GROUP.
    KexdhReply = 31,
    /// Group exchange init.
    KexDhGexInit = 32,
    /// Group exchange reply.
    KexDhGexReply = 33,
    /// Group exchange request.
    KexDhGexRequest = 34,

    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

/// SSH_MSG_KEX_DH_GEX_GROUP shares its number with SSH_MSG_KEXDH_REPLY.
pub const KEX_DH_GEX_GROUP: u8 = 31;

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// ```rust
    /// use halyard_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            32 => Some(MessageType::KexDhGexInit),
            33 => Some(MessageType::KexDhGexReply),
            34 => Some(MessageType::KexDhGexRequest),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// The RFC name of this message.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::KexDhGexInit => "SSH_MSG_KEX_DH_GEX_INIT",
            MessageType::KexDhGexReply => "SSH_MSG_KEX_DH_GEX_REPLY",
            MessageType::KexDhGexRequest => "SSH_MSG_KEX_DH_GEX_REQUEST",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Transport layer generic messages (1-19).
pub fn is_transport_generic(number: u8) -> bool {
    (1..=19).contains(&number)
}

/// Algorithm negotiation and key exchange method messages (20-49).
pub fn is_key_exchange(number: u8) -> bool {
    (20..=49).contains(&number)
}

/// Messages routed to the authentication collaborator: service
/// request/accept (5, 6) and user authentication (50-79).
pub fn is_authentication(number: u8) -> bool {
    number == 5 || number == 6 || (50..=79).contains(&number)
}

/// Connection protocol messages (80-127).
pub fn is_connection(number: u8) -> bool {
    (80..=127).contains(&number)
}

/// Returns the message number of a payload.
pub fn message_number(payload: &[u8]) -> HalyardResult<u8> {
    payload
        .first()
        .copied()
        .ok_or_else(|| HalyardError::Protocol("Empty payload".to_string()))
}

pub(crate) fn expect_type(reader: &mut WireReader<'_>, expected: MessageType) -> HalyardResult<()> {
    let number = reader.read_u8()?;
    if number != expected as u8 {
        return Err(HalyardError::Protocol(format!(
            "Invalid message type: expected {}, got {}",
            expected, number
        )));
    }
    Ok(())
}

/// SSH_MSG_DISCONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code.
    pub reason: u32,
    /// Human readable description.
    pub description: String,
    /// Language tag.
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect with an empty language tag.
    pub fn new(reason: u32, description: impl Into<String>) -> Self {
        Self {
            reason,
            description: description.into(),
            language: String::new(),
        }
    }

    /// Encodes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason);
        wire::write_string(&mut buf, &self.description);
        wire::write_string(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Decodes a payload.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::Disconnect)?;
        let reason = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let language = if r.is_empty() {
            String::new()
        } else {
            r.read_string()?
        };
        Ok(Self {
            reason,
            description,
            language,
        })
    }
}

/// SSH_MSG_IGNORE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ignore {
    /// Arbitrary data.
    pub data: Vec<u8>,
}

impl Ignore {
    /// Encodes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Ignore as u8);
        wire::write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Decodes a payload.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::Ignore)?;
        Ok(Self {
            data: r.read_bytes()?.to_vec(),
        })
    }
}

/// SSH_MSG_DEBUG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be displayed.
    pub always_display: bool,
    /// The message.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl DebugMessage {
    /// Encodes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Debug as u8);
        wire::write_bool(&mut buf, self.always_display);
        wire::write_string(&mut buf, &self.message);
        wire::write_string(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Decodes a payload.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::Debug)?;
        Ok(Self {
            always_display: r.read_bool()?,
            message: r.read_string()?,
            language: r.read_string()?,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet.
    pub sequence: u32,
}

impl Unimplemented {
    /// Encodes the payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(MessageType::Unimplemented as u8);
        buf.put_u32(self.sequence);
        buf.to_vec()
    }

    /// Decodes a payload.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::Unimplemented)?;
        Ok(Self {
            sequence: r.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_covers_all_variants() {
        for n in 0..=255u8 {
            if let Some(t) = MessageType::from_u8(n) {
                assert_eq!(t as u8, n);
            }
        }
        assert_eq!(MessageType::from_u8(0), None);
        assert_eq!(MessageType::from_u8(101), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MessageType::ChannelData.to_string(),
            "SSH_MSG_CHANNEL_DATA(94)"
        );
    }

    #[test]
    fn test_categories() {
        assert!(is_transport_generic(2));
        assert!(is_key_exchange(34));
        assert!(is_authentication(5));
        assert!(is_authentication(60));
        assert!(!is_authentication(80));
        assert!(is_connection(94));
        assert!(!is_connection(200));
    }

    #[test]
    fn test_disconnect_without_language() {
        let mut payload = Disconnect::new(2, "bye").to_bytes();
        payload.truncate(payload.len() - 4);
        let parsed = Disconnect::from_bytes(&payload).unwrap();
        assert_eq!(parsed.reason, 2);
        assert_eq!(parsed.description, "bye");
    }

    #[test]
    fn test_unimplemented_layout() {
        assert_eq!(
            Unimplemented { sequence: 0x01020304 }.to_bytes(),
            vec![3, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_wrong_type_rejected() {
        assert!(matches!(
            Ignore::from_bytes(&[4, 0, 0, 0, 0]),
            Err(HalyardError::Protocol(_))
        ));
        assert!(DebugMessage::from_bytes(&[4, 1]).is_err());
    }
}
