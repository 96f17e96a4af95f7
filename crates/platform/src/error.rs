//! Error types for Halyard

use std::fmt;

/// SSH disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire reason code to a `DisconnectReason`.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::HostNotAllowedToConnect),
            2 => Some(Self::ProtocolError),
            3 => Some(Self::KeyExchangeFailed),
            4 => Some(Self::Reserved),
            5 => Some(Self::MacError),
            6 => Some(Self::CompressionError),
            7 => Some(Self::ServiceNotAvailable),
            8 => Some(Self::ProtocolVersionNotSupported),
            9 => Some(Self::HostKeyNotVerifiable),
            10 => Some(Self::ConnectionLost),
            11 => Some(Self::ByApplication),
            12 => Some(Self::TooManyConnections),
            13 => Some(Self::AuthCancelledByUser),
            14 => Some(Self::NoMoreAuthMethodsAvailable),
            15 => Some(Self::IllegalUserName),
            _ => None,
        }
    }

    /// Human readable description sent alongside the code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::HostNotAllowedToConnect => "host not allowed to connect",
            Self::ProtocolError => "protocol error",
            Self::KeyExchangeFailed => "key exchange failed",
            Self::Reserved => "reserved",
            Self::MacError => "MAC error",
            Self::CompressionError => "compression error",
            Self::ServiceNotAvailable => "service not available",
            Self::ProtocolVersionNotSupported => "protocol version not supported",
            Self::HostKeyNotVerifiable => "host key not verifiable",
            Self::ConnectionLost => "connection lost",
            Self::ByApplication => "disconnected by application",
            Self::TooManyConnections => "too many connections",
            Self::AuthCancelledByUser => "auth cancelled by user",
            Self::NoMoreAuthMethodsAvailable => "no more auth methods available",
            Self::IllegalUserName => "illegal user name",
        }
    }
}

/// Unified error type for all Halyard operations
#[derive(Debug)]
pub enum HalyardError {
    /// I/O error on the underlying byte stream
    Io(std::io::Error),

    /// Local configuration error (bad parameters, registry collisions)
    Config(String),

    /// No common algorithm, or a negotiated algorithm is unsupported
    Negotiation(String),

    /// Malformed packet, window overrun or out-of-order message
    Protocol(String),

    /// MAC or signature verification failure
    Security(String),

    /// Unknown global or channel request
    Unsupported(String),

    /// Connect, key exchange or authentication deadline exceeded
    Timeout(String),

    /// Channel or session limits reached
    ResourceExhausted(String),

    /// The channel was closed before the operation completed
    ChannelClosed(u32),

    /// The session is closed (locally or by the peer)
    Disconnected {
        /// Reason code (RFC 4253 Section 11.1)
        code: u32,
        /// Description supplied with the disconnect
        description: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HalyardError {
    /// Whether this error terminates the whole session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            HalyardError::Io(_)
                | HalyardError::Negotiation(_)
                | HalyardError::Protocol(_)
                | HalyardError::Security(_)
                | HalyardError::Disconnected { .. }
        )
    }

    /// Disconnect reason to report to the peer when this error ends a session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            HalyardError::Negotiation(_) => DisconnectReason::KeyExchangeFailed,
            HalyardError::Protocol(_) => DisconnectReason::ProtocolError,
            HalyardError::Security(msg) if msg.contains("host key") => {
                DisconnectReason::HostKeyNotVerifiable
            }
            HalyardError::Security(_) => DisconnectReason::MacError,
            HalyardError::ResourceExhausted(_) => DisconnectReason::TooManyConnections,
            HalyardError::Io(_) => DisconnectReason::ConnectionLost,
            _ => DisconnectReason::ByApplication,
        }
    }

    /// Returns a cheap copy suitable for fanning one cause out to many waiters.
    ///
    /// `Io` and `Other` lose their source and keep only their message.
    pub fn duplicate(&self) -> HalyardError {
        match self {
            HalyardError::Io(e) => HalyardError::Io(std::io::Error::new(e.kind(), e.to_string())),
            HalyardError::Config(m) => HalyardError::Config(m.clone()),
            HalyardError::Negotiation(m) => HalyardError::Negotiation(m.clone()),
            HalyardError::Protocol(m) => HalyardError::Protocol(m.clone()),
            HalyardError::Security(m) => HalyardError::Security(m.clone()),
            HalyardError::Unsupported(m) => HalyardError::Unsupported(m.clone()),
            HalyardError::Timeout(m) => HalyardError::Timeout(m.clone()),
            HalyardError::ResourceExhausted(m) => HalyardError::ResourceExhausted(m.clone()),
            HalyardError::ChannelClosed(id) => HalyardError::ChannelClosed(*id),
            HalyardError::Disconnected { code, description } => HalyardError::Disconnected {
                code: *code,
                description: description.clone(),
            },
            HalyardError::Other(e) => HalyardError::Other(e.to_string().into()),
        }
    }
}

impl fmt::Display for HalyardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalyardError::Io(e) => write!(f, "IO error: {}", e),
            HalyardError::Config(msg) => write!(f, "Configuration error: {}", msg),
            HalyardError::Negotiation(msg) => write!(f, "Negotiation failure: {}", msg),
            HalyardError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            HalyardError::Security(msg) => write!(f, "Security error: {}", msg),
            HalyardError::Unsupported(msg) => write!(f, "Unsupported request: {}", msg),
            HalyardError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            HalyardError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            HalyardError::ChannelClosed(id) => write!(f, "Channel {} closed", id),
            HalyardError::Disconnected { code, description } => {
                write!(f, "Disconnected ({}): {}", code, description)
            }
            HalyardError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for HalyardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HalyardError::Io(e) => Some(e),
            HalyardError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for HalyardError {
    fn from(err: std::io::Error) -> Self {
        HalyardError::Io(err)
    }
}

/// Result type for Halyard operations
pub type HalyardResult<T> = Result<T, HalyardError>;
