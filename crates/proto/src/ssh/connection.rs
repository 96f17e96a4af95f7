//! SSH connection protocol (RFC 4254).
//!
//! This module implements channel multiplexing over an established
//! transport:
//! - Channel open, confirmation and failure
//! - Flow control (window accounting and WINDOW_ADJUST)
//! - EOF and CLOSE handshakes
//! - Global and channel requests, answered through [`HandlerChain`]s
//!
//! [`Connection`] is a state machine without I/O. Feed it decrypted
//! payloads with [`Connection::handle_payload`], drain payloads to send with
//! [`Connection::take_outbound`] and observe what happened with
//! [`Connection::poll_event`].
//!
//! # Security
//!
//! - **Window limits** - Data beyond the granted window is a protocol violation
//! - **Maximum packet size** - Oversized data is rejected, outgoing data is chunked
//! - **Channel id validation** - Messages for unknown channels are rejected
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::connection::{Connection, ConnectionConfig, ConnectionHandlers};
//!
//! let mut conn = Connection::new(ConnectionConfig::default(), ConnectionHandlers::default()).unwrap();
//! let id = conn.open_channel("session", &[]).unwrap();
//! assert_eq!(id, 0);
//! let open = conn.take_outbound().unwrap();
//! assert_eq!(open[0], 90);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use halyard_platform::{HalyardError, HalyardResult};

use super::attributes::Attributes;
use super::channel::{Channel, ChannelState};
use super::listener::{ChannelListener, ListenerSet};
use super::message::{expect_type, MessageType};
use super::request::{
    ChannelContext, GlobalContext, HandlerChain, Reply, ReplyToken, Request, RequestHandler,
    RequestId, RequestOutcome,
};
use super::wire::{self, WireReader};

/// Default initial window (2 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default maximum packet size (32 KB).
pub const DEFAULT_MAX_PACKET: u32 = 32 * 1024;

/// Largest data chunk sent in one message, whatever the peer advertises.
pub const MAX_CHANNEL_DATA: u32 = 32 * 1024;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Reason codes of SSH_MSG_CHANNEL_OPEN_FAILURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    /// Administratively prohibited.
    AdministrativelyProhibited = 1,
    /// Connect failed.
    ConnectFailed = 2,
    /// Unknown channel type.
    UnknownChannelType = 3,
    /// Resource shortage.
    ResourceShortage = 4,
}

impl OpenFailureReason {
    /// Converts a wire code.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Human readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "administratively prohibited",
            Self::ConnectFailed => "connect failed",
            Self::UnknownChannelType => "unknown channel type",
            Self::ResourceShortage => "resource shortage",
        }
    }
}

/// SSH_MSG_GLOBAL_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name, e.g. `tcpip-forward`.
    pub name: String,
    /// Whether the peer must answer with success or failure.
    pub want_reply: bool,
    /// Request-specific data.
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        wire::write_string(&mut buf, &self.name);
        wire::write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::GlobalRequest)?;
        Ok(Self {
            name: r.read_string()?,
            want_reply: r.read_bool()?,
            data: r.remaining().to_vec(),
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS, with response-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSuccess {
    /// Response-specific data.
    pub data: Vec<u8>,
}

impl RequestSuccess {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(MessageType::RequestSuccess as u8);
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type name (e.g. `session`).
    pub channel_type: String,
    /// Channel number chosen by the sender.
    pub sender_channel: u32,
    /// Bytes the sender accepts before a window adjust.
    pub initial_window: u32,
    /// Largest data payload the sender accepts in one message.
    pub max_packet: u32,
    /// Type-specific data.
    pub data: Vec<u8>,
}

impl ChannelOpen {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::write_string(&mut buf, &self.channel_type);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelOpen)?;
        Ok(Self {
            channel_type: r.read_string()?,
            sender_channel: r.read_u32()?,
            initial_window: r.read_u32()?,
            max_packet: r.read_u32()?,
            data: r.remaining().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Channel number chosen by the sender.
    pub sender_channel: u32,
    /// Bytes the sender accepts before a window adjust.
    pub initial_window: u32,
    /// Largest data payload the sender accepts in one message.
    pub max_packet: u32,
    /// Type-specific data.
    pub data: Vec<u8>,
}

impl ChannelOpenConfirmation {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window);
        buf.put_u32(self.max_packet);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            sender_channel: r.read_u32()?,
            initial_window: r.read_u32()?,
            max_packet: r.read_u32()?,
            data: r.remaining().to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Raw reason code, see [`OpenFailureReason`].
    pub reason: u32,
    /// Human-readable reason.
    pub description: String,
    /// RFC 3066 language tag, usually empty.
    pub language: String,
}

impl ChannelOpenFailure {
    /// Failure with an empty language tag.
    pub fn new(recipient_channel: u32, reason: OpenFailureReason, description: &str) -> Self {
        Self {
            recipient_channel,
            reason: reason as u32,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason);
        wire::write_string(&mut buf, &self.description);
        wire::write_string(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelOpenFailure)?;
        let recipient_channel = r.read_u32()?;
        let reason = r.read_u32()?;
        let description = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let language = if r.is_empty() {
            String::new()
        } else {
            r.read_string()?
        };
        Ok(Self {
            recipient_channel,
            reason,
            description,
            language,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Window increment in bytes.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            bytes_to_add: r.read_u32()?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Channel payload.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        wire::write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Extended data stream, 1 for stderr.
    pub data_type: u32,
    /// Channel payload.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type);
        wire::write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            data_type: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Channel number chosen by the receiver of this message.
    pub recipient_channel: u32,
    /// Request type, e.g. `exec` or `exit-status`.
    pub name: String,
    /// Whether the peer must answer with success or failure.
    pub want_reply: bool,
    /// Request-specific data.
    pub data: Vec<u8>,
}

impl ChannelRequest {
    /// Encodes the message, type byte first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        wire::write_string(&mut buf, &self.name);
        wire::write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Decodes the message, rejecting a mismatched type byte.
    pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
        let mut r = WireReader::new(data);
        expect_type(&mut r, MessageType::ChannelRequest)?;
        Ok(Self {
            recipient_channel: r.read_u32()?,
            name: r.read_string()?,
            want_reply: r.read_bool()?,
            data: r.remaining().to_vec(),
        })
    }
}

macro_rules! recipient_message {
    ($(#[$doc:meta])* $name:ident, $ty:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            /// Channel number chosen by the receiver of this message.
            pub recipient_channel: u32,
        }

        impl $name {
            /// Encodes the message, type byte first.
            pub fn to_bytes(&self) -> Vec<u8> {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8($ty as u8);
                buf.put_u32(self.recipient_channel);
                buf.to_vec()
            }

            /// Decodes the message, rejecting a mismatched type byte.
            pub fn from_bytes(data: &[u8]) -> HalyardResult<Self> {
                let mut r = WireReader::new(data);
                expect_type(&mut r, $ty)?;
                Ok(Self {
                    recipient_channel: r.read_u32()?,
                })
            }
        }
    };
}

recipient_message!(
    /// SSH_MSG_CHANNEL_EOF
    ChannelEof,
    MessageType::ChannelEof
);
recipient_message!(
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose,
    MessageType::ChannelClose
);
recipient_message!(
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess,
    MessageType::ChannelSuccess
);
recipient_message!(
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure,
    MessageType::ChannelFailure
);

/// Multiplexer tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Window granted to the peer for each channel.
    pub initial_window: u32,
    /// Largest data message accepted from the peer.
    pub max_packet: u32,
    /// Fraction of `initial_window` consumed before a WINDOW_ADJUST is sent.
    pub low_water_mark: f64,
    /// Maximum number of live channels.
    pub max_channels: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_window: DEFAULT_WINDOW_SIZE,
            max_packet: DEFAULT_MAX_PACKET,
            low_water_mark: 0.5,
            max_channels: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Checks the values for consistency.
    pub fn validate(&self) -> HalyardResult<()> {
        if self.initial_window == 0 {
            return Err(HalyardError::Config("initial_window must be positive".into()));
        }
        if self.max_packet == 0 || self.max_packet > MAX_CHANNEL_DATA {
            return Err(HalyardError::Config(format!(
                "max_packet must be between 1 and {}",
                MAX_CHANNEL_DATA
            )));
        }
        if !(self.low_water_mark > 0.0 && self.low_water_mark <= 1.0) {
            return Err(HalyardError::Config(
                "low_water_mark must be in (0, 1]".into(),
            ));
        }
        if self.max_channels == 0 {
            return Err(HalyardError::Config("max_channels must be positive".into()));
        }
        Ok(())
    }

    /// Consumed bytes that trigger a WINDOW_ADJUST.
    pub fn adjust_threshold(&self) -> u32 {
        ((f64::from(self.initial_window) * self.low_water_mark) as u32).max(1)
    }
}

/// Decision of a [`ChannelOpenHandler`].
pub enum OpenDecision {
    /// Open the channel.
    Accept,
    /// Open the channel with additional request handlers, tried after the
    /// connection-wide channel handlers.
    AcceptWith(Vec<Arc<dyn RequestHandler<ChannelContext>>>),
    /// Refuse the channel.
    Reject {
        reason: OpenFailureReason,
        description: String,
    },
}

impl std::fmt::Debug for OpenDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept => f.write_str("Accept"),
            Self::AcceptWith(h) => write!(f, "AcceptWith({} handlers)", h.len()),
            Self::Reject {
                reason,
                description,
            } => f
                .debug_struct("Reject")
                .field("reason", reason)
                .field("description", description)
                .finish(),
        }
    }
}

/// Acceptor for incoming CHANNEL_OPEN of one channel type.
pub trait ChannelOpenHandler: Send + Sync {
    /// Channel type this handler answers for.
    fn channel_type(&self) -> &str;

    /// Decides on an open request. `ctx.channel_id` is the id the channel
    /// will get if accepted.
    fn open(&self, ctx: &ChannelContext, data: &[u8]) -> OpenDecision;
}

/// Accepts every channel of one type.
#[derive(Debug, Clone)]
pub struct AcceptChannelType(pub String);

impl ChannelOpenHandler for AcceptChannelType {
    fn channel_type(&self) -> &str {
        &self.0
    }

    fn open(&self, _ctx: &ChannelContext, _data: &[u8]) -> OpenDecision {
        OpenDecision::Accept
    }
}

/// Request handlers and channel acceptors of one connection.
#[derive(Clone, Default)]
pub struct ConnectionHandlers {
    /// Global request chain.
    pub global: HandlerChain<GlobalContext>,
    /// Connection-wide channel request chain.
    pub channel: HandlerChain<ChannelContext>,
    openers: HashMap<String, Arc<dyn ChannelOpenHandler>>,
}

impl ConnectionHandlers {
    /// Registers an acceptor, replacing any for the same channel type.
    pub fn add_opener(&mut self, opener: Arc<dyn ChannelOpenHandler>) {
        self.openers
            .insert(opener.channel_type().to_string(), opener);
    }

    /// Channel types with an acceptor.
    pub fn channel_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.openers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ConnectionHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandlers")
            .field("global", &self.global)
            .field("channel", &self.channel)
            .field("openers", &self.channel_types())
            .finish()
    }
}

/// Something the application should know about.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The peer confirmed a channel we opened.
    ChannelOpened { channel: u32 },
    /// The peer refused a channel we opened.
    ChannelOpenFailed {
        channel: u32,
        reason: u32,
        description: String,
    },
    /// We accepted a channel the peer opened.
    ChannelAccepted {
        channel: u32,
        channel_type: String,
        data: Vec<u8>,
    },
    /// Data arrived. Report it with [`Connection::consume`] once processed.
    Data { channel: u32, data: Vec<u8> },
    /// Extended data arrived; consume it like [`ConnectionEvent::Data`].
    ExtendedData {
        channel: u32,
        data_type: u32,
        data: Vec<u8>,
    },
    /// The peer sent EOF.
    Eof { channel: u32 },
    /// The channel is gone.
    Closed {
        channel: u32,
        error: Option<HalyardError>,
    },
    /// Reply to one of our requests.
    RequestReply {
        id: RequestId,
        reply: HalyardResult<Reply>,
    },
}

/// The channel multiplexer.
pub struct Connection {
    config: ConnectionConfig,
    handlers: ConnectionHandlers,
    listeners: ListenerSet<dyn ChannelListener>,
    attributes: Arc<Attributes>,

    channels: BTreeMap<u32, Channel>,
    next_channel_id: u32,
    ids_exhausted: bool,

    next_request_id: u64,
    next_reply_serial: u64,
    pending_global: VecDeque<RequestId>,
    owed_global: VecDeque<(u64, Option<Reply>)>,

    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<ConnectionEvent>,
    failure: Option<HalyardError>,
}

impl Connection {
    /// Creates a multiplexer with no channels.
    pub fn new(config: ConnectionConfig, handlers: ConnectionHandlers) -> HalyardResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handlers,
            listeners: ListenerSet::new(),
            attributes: Arc::new(Attributes::new()),
            channels: BTreeMap::new(),
            next_channel_id: 0,
            ids_exhausted: false,
            next_request_id: 0,
            next_reply_serial: 0,
            pending_global: VecDeque::new(),
            owed_global: VecDeque::new(),
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            failure: None,
        })
    }

    /// Uses `attributes` as the session attributes seen by global handlers.
    pub fn with_attributes(mut self, attributes: Arc<Attributes>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the listeners notified for every channel.
    pub fn set_listeners(&mut self, listeners: ListenerSet<dyn ChannelListener>) {
        self.listeners = listeners;
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    /// Looks up a live channel.
    pub fn channel(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether [`Connection::fail_all`] ran.
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Next payload for the transport.
    pub fn take_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Next event for the application.
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Adds a request handler tried after the connection-wide ones.
    pub fn add_channel_handler(
        &mut self,
        id: u32,
        handler: Arc<dyn RequestHandler<ChannelContext>>,
    ) -> HalyardResult<()> {
        self.channel_mut(id)?.handlers.push(handler);
        Ok(())
    }

    /// Adds a listener for one channel.
    pub fn add_channel_listener(
        &mut self,
        id: u32,
        listener: Arc<dyn ChannelListener>,
    ) -> HalyardResult<()> {
        self.channel_mut(id)?.listeners.add(listener);
        Ok(())
    }

    /// Opens a channel of `channel_type`; the id is valid immediately.
    pub fn open_channel(&mut self, channel_type: &str, data: &[u8]) -> HalyardResult<u32> {
        self.check_alive()?;
        if self.channels.len() >= self.config.max_channels {
            return Err(HalyardError::ResourceExhausted(format!(
                "channel limit of {} reached",
                self.config.max_channels
            )));
        }
        let id = self.allocate_id()?;
        self.channels.insert(
            id,
            Channel::opening(
                id,
                channel_type,
                self.config.initial_window,
                self.config.max_packet,
            ),
        );
        self.outbound.push_back(
            ChannelOpen {
                channel_type: channel_type.to_string(),
                sender_channel: id,
                initial_window: self.config.initial_window,
                max_packet: self.config.max_packet,
                data: data.to_vec(),
            }
            .to_bytes(),
        );
        tracing::debug!(channel = id, channel_type, "opening channel");
        Ok(id)
    }

    /// Writes data; what the window does not allow yet stays buffered.
    pub fn send_data(&mut self, id: u32, data: &[u8]) -> HalyardResult<()> {
        self.write(id, None, data)
    }

    /// Writes extended data (e.g. [`EXTENDED_DATA_STDERR`]).
    pub fn send_extended_data(&mut self, id: u32, data_type: u32, data: &[u8]) -> HalyardResult<()> {
        self.write(id, Some(data_type), data)
    }

    fn write(&mut self, id: u32, data_type: Option<u32>, data: &[u8]) -> HalyardResult<()> {
        self.check_alive()?;
        let channel = self.channel_mut(id)?;
        if !channel.is_writable() {
            if channel.close_sent() || channel.close_received() {
                return Err(HalyardError::ChannelClosed(id));
            }
            return Err(HalyardError::Protocol(format!(
                "Write on channel {} after EOF",
                id
            )));
        }
        channel.queue(data_type, data);
        self.flush_channel(id);
        Ok(())
    }

    /// Sends EOF once buffered data is out.
    pub fn send_eof(&mut self, id: u32) -> HalyardResult<()> {
        self.check_alive()?;
        let channel = self.channel_mut(id)?;
        if channel.close_sent() || channel.close_received() {
            return Err(HalyardError::ChannelClosed(id));
        }
        channel.request_eof();
        self.flush_channel(id);
        Ok(())
    }

    /// Closes a channel. Buffered data is dropped. Closing twice is a no-op.
    pub fn close_channel(&mut self, id: u32) -> HalyardResult<()> {
        self.check_alive()?;
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.state() == ChannelState::Opening {
            channel.close_on_open = true;
            return Ok(());
        }
        if !channel.close_sent() {
            channel.mark_close_sent();
            self.outbound.push_back(
                ChannelClose {
                    recipient_channel: channel.remote_id(),
                }
                .to_bytes(),
            );
        }
        if channel.close_received() {
            self.finish_channel(id, None);
        }
        Ok(())
    }

    /// Reports `n` bytes of received data as processed.
    pub fn consume(&mut self, id: u32, n: u32) -> HalyardResult<()> {
        let threshold = self.config.adjust_threshold();
        let Some(channel) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        if channel.close_sent() || channel.close_received() || self.failure.is_some() {
            return Ok(());
        }
        if let Some(bytes_to_add) = channel.consume(n, threshold)? {
            tracing::trace!(channel = id, bytes_to_add, "window adjust");
            self.outbound.push_back(
                ChannelWindowAdjust {
                    recipient_channel: channel.remote_id(),
                    bytes_to_add,
                }
                .to_bytes(),
            );
        }
        Ok(())
    }

    /// Sends a channel request; with `want_reply` the reply arrives as
    /// [`ConnectionEvent::RequestReply`] with the returned id.
    pub fn channel_request(
        &mut self,
        id: u32,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> HalyardResult<Option<RequestId>> {
        self.check_alive()?;
        let request_id = RequestId(self.next_request_id);
        let channel = self
            .channels
            .get_mut(&id)
            .ok_or(HalyardError::ChannelClosed(id))?;
        if channel.close_sent() || channel.close_received() {
            return Err(HalyardError::ChannelClosed(id));
        }
        if channel.state() == ChannelState::Opening {
            return Err(HalyardError::Protocol(format!("Channel {} is not open yet", id)));
        }
        let payload = ChannelRequest {
            recipient_channel: channel.remote_id(),
            name: name.to_string(),
            want_reply,
            data: data.to_vec(),
        }
        .to_bytes();
        let result = if want_reply {
            channel.pending_requests.push_back(request_id);
            self.next_request_id += 1;
            Some(request_id)
        } else {
            None
        };
        self.outbound.push_back(payload);
        Ok(result)
    }

    /// Sends a global request.
    pub fn global_request(
        &mut self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> HalyardResult<Option<RequestId>> {
        self.check_alive()?;
        self.outbound.push_back(
            GlobalRequest {
                name: name.to_string(),
                want_reply,
                data: data.to_vec(),
            }
            .to_bytes(),
        );
        if !want_reply {
            return Ok(None);
        }
        let request_id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        self.pending_global.push_back(request_id);
        Ok(Some(request_id))
    }

    /// Answers a global request a handler deferred with
    /// [`RequestOutcome::Replied`].
    ///
    /// Replies go out in the order the requests arrived.
    pub fn send_global_reply(&mut self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        if token.channel.is_some() {
            return Err(HalyardError::Config(format!(
                "{:?} belongs to a channel request",
                token
            )));
        }
        self.deliver_reply(token, reply)
    }

    /// Answers a deferred channel request, in arrival order per channel.
    pub fn send_channel_reply(&mut self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        if token.channel.is_none() {
            return Err(HalyardError::Config(format!(
                "{:?} belongs to a global request",
                token
            )));
        }
        self.deliver_reply(token, reply)
    }

    fn deliver_reply(&mut self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        self.check_alive()?;
        let owed = match token.channel {
            None => &mut self.owed_global,
            Some(id) => {
                &mut self
                    .channels
                    .get_mut(&id)
                    .ok_or(HalyardError::ChannelClosed(id))?
                    .owed_replies
            }
        };
        let slot = owed
            .iter_mut()
            .find(|(serial, r)| *serial == token.serial && r.is_none())
            .ok_or_else(|| {
                HalyardError::Protocol(format!("No deferred reply for {:?}", token))
            })?;
        slot.1 = Some(reply);
        match token.channel {
            None => self.flush_global_replies(),
            Some(id) => self.flush_channel_replies(id),
        }
        Ok(())
    }

    /// Processes one payload from the transport.
    ///
    /// Returns `Ok(false)` for message numbers outside the connection
    /// protocol; the caller answers those with UNIMPLEMENTED. An error is a
    /// protocol violation that should end the session.
    pub fn handle_payload(&mut self, payload: &[u8]) -> HalyardResult<bool> {
        let number = *payload
            .first()
            .ok_or_else(|| HalyardError::Protocol("Empty payload".into()))?;
        if self.failure.is_some() {
            return Ok(true);
        }
        match MessageType::from_u8(number) {
            Some(MessageType::GlobalRequest) => self.on_global_request(payload)?,
            Some(MessageType::RequestSuccess) => {
                self.on_global_reply(Reply::Success(payload[1..].to_vec()))?
            }
            Some(MessageType::RequestFailure) => self.on_global_reply(Reply::Failure)?,
            Some(MessageType::ChannelOpen) => self.on_channel_open(payload)?,
            Some(MessageType::ChannelOpenConfirmation) => self.on_open_confirmation(payload)?,
            Some(MessageType::ChannelOpenFailure) => self.on_open_failure(payload)?,
            Some(MessageType::ChannelWindowAdjust) => self.on_window_adjust(payload)?,
            Some(MessageType::ChannelData) => {
                let msg = ChannelData::from_bytes(payload)?;
                self.on_data(msg.recipient_channel, None, msg.data)?
            }
            Some(MessageType::ChannelExtendedData) => {
                let msg = ChannelExtendedData::from_bytes(payload)?;
                self.on_data(msg.recipient_channel, Some(msg.data_type), msg.data)?
            }
            Some(MessageType::ChannelEof) => self.on_eof(payload)?,
            Some(MessageType::ChannelClose) => self.on_close(payload)?,
            Some(MessageType::ChannelRequest) => self.on_channel_request(payload)?,
            Some(MessageType::ChannelSuccess) => {
                let msg = ChannelSuccess::from_bytes(payload)?;
                self.on_channel_reply(msg.recipient_channel, Reply::Success(Vec::new()))?
            }
            Some(MessageType::ChannelFailure) => {
                let msg = ChannelFailure::from_bytes(payload)?;
                self.on_channel_reply(msg.recipient_channel, Reply::Failure)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Ends every channel and pending request with `cause`.
    pub fn fail_all(&mut self, cause: &HalyardError) {
        if self.failure.is_some() {
            return;
        }
        tracing::debug!(channels = self.channels.len(), error = %cause, "failing connection");
        let ids: Vec<u32> = self.channels.keys().copied().collect();
        for id in ids {
            self.finish_channel(id, Some(cause.duplicate()));
        }
        while let Some(id) = self.pending_global.pop_front() {
            self.events.push_back(ConnectionEvent::RequestReply {
                id,
                reply: Err(cause.duplicate()),
            });
        }
        self.owed_global.clear();
        self.outbound.clear();
        self.failure = Some(cause.duplicate());
    }

    fn check_alive(&self) -> HalyardResult<()> {
        match &self.failure {
            Some(cause) => Err(cause.duplicate()),
            None => Ok(()),
        }
    }

    fn allocate_id(&mut self) -> HalyardResult<u32> {
        if self.ids_exhausted {
            return Err(HalyardError::ResourceExhausted(
                "channel ids exhausted".into(),
            ));
        }
        let id = self.next_channel_id;
        match id.checked_add(1) {
            Some(next) => self.next_channel_id = next,
            None => self.ids_exhausted = true,
        }
        Ok(id)
    }

    fn channel_mut(&mut self, id: u32) -> HalyardResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or(HalyardError::ChannelClosed(id))
    }

    fn flush_channel(&mut self, id: u32) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let recipient_channel = channel.remote_id();
        while let Some(chunk) = channel.next_chunk() {
            let payload = match chunk.data_type {
                None => ChannelData {
                    recipient_channel,
                    data: chunk.data,
                }
                .to_bytes(),
                Some(data_type) => ChannelExtendedData {
                    recipient_channel,
                    data_type,
                    data: chunk.data,
                }
                .to_bytes(),
            };
            self.outbound.push_back(payload);
        }
        if channel.take_eof() {
            self.outbound
                .push_back(ChannelEof { recipient_channel }.to_bytes());
        }
        if channel.should_close() {
            channel.mark_close_sent();
            self.outbound
                .push_back(ChannelClose { recipient_channel }.to_bytes());
        }
    }

    fn flush_global_replies(&mut self) {
        while let Some((_, Some(_))) = self.owed_global.front() {
            let Some((_, Some(reply))) = self.owed_global.pop_front() else {
                break;
            };
            let payload = match reply {
                Reply::Success(data) => RequestSuccess { data }.to_bytes(),
                Reply::Failure => vec![MessageType::RequestFailure as u8],
            };
            self.outbound.push_back(payload);
        }
    }

    fn flush_channel_replies(&mut self, id: u32) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let recipient_channel = channel.remote_id();
        while let Some((_, Some(_))) = channel.owed_replies.front() {
            let Some((_, Some(reply))) = channel.owed_replies.pop_front() else {
                break;
            };
            let payload = match reply {
                Reply::Success(_) => ChannelSuccess { recipient_channel }.to_bytes(),
                Reply::Failure => ChannelFailure { recipient_channel }.to_bytes(),
            };
            self.outbound.push_back(payload);
        }
    }

    fn finish_channel(&mut self, id: u32, error: Option<HalyardError>) {
        let Some(mut channel) = self.channels.remove(&id) else {
            return;
        };
        channel.mark_closed();
        while let Some(request_id) = channel.pending_requests.pop_front() {
            let cause = match &error {
                Some(e) => e.duplicate(),
                None => HalyardError::ChannelClosed(id),
            };
            self.events.push_back(ConnectionEvent::RequestReply {
                id: request_id,
                reply: Err(cause),
            });
        }
        for listener in self.listeners.iter().chain(channel.listeners.iter()) {
            listener.channel_closed(id, error.as_ref());
        }
        tracing::debug!(channel = id, error = ?error, "channel closed");
        self.events
            .push_back(ConnectionEvent::Closed { channel: id, error });
    }

    fn on_global_request(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = GlobalRequest::from_bytes(payload)?;
        let serial = self.next_reply_serial;
        self.next_reply_serial += 1;

        let request = Request::new(msg.name, msg.want_reply, msg.data);
        let ctx = GlobalContext::new(self.attributes.clone(), ReplyToken::global(serial));
        let outcome = self.handlers.global.dispatch(&ctx, &request);
        tracing::debug!(name = %request.name, want_reply = request.want_reply, ?outcome, "global request");

        if !request.want_reply {
            return Ok(());
        }
        let slot = match outcome {
            RequestOutcome::Unsupported => Some(Reply::Failure),
            RequestOutcome::Handled(reply) => Some(reply),
            RequestOutcome::Replied => None,
        };
        self.owed_global.push_back((serial, slot));
        self.flush_global_replies();
        Ok(())
    }

    fn on_global_reply(&mut self, reply: Reply) -> HalyardResult<()> {
        let id = self.pending_global.pop_front().ok_or_else(|| {
            HalyardError::Protocol("Global request reply without a pending request".into())
        })?;
        self.events.push_back(ConnectionEvent::RequestReply {
            id,
            reply: Ok(reply),
        });
        Ok(())
    }

    fn on_channel_open(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = ChannelOpen::from_bytes(payload)?;
        if msg.max_packet == 0 {
            return Err(HalyardError::Protocol(format!(
                "Channel open from {} with zero maximum packet",
                msg.sender_channel
            )));
        }

        let Some(opener) = self.handlers.openers.get(&msg.channel_type).cloned() else {
            tracing::debug!(channel_type = %msg.channel_type, "rejecting unknown channel type");
            self.reject_open(msg.sender_channel, OpenFailureReason::UnknownChannelType, "unknown channel type");
            return Ok(());
        };
        if self.channels.len() >= self.config.max_channels || self.ids_exhausted {
            self.reject_open(msg.sender_channel, OpenFailureReason::ResourceShortage, "too many channels");
            return Ok(());
        }

        let ctx = ChannelContext {
            channel_id: self.next_channel_id,
            channel_type: msg.channel_type.clone(),
            attributes: Arc::new(Attributes::new()),
            reply_token: ReplyToken::channel(self.next_channel_id, 0),
        };
        let handlers = match opener.open(&ctx, &msg.data) {
            OpenDecision::Accept => Vec::new(),
            OpenDecision::AcceptWith(handlers) => handlers,
            OpenDecision::Reject {
                reason,
                description,
            } => {
                self.reject_open(msg.sender_channel, reason, &description);
                return Ok(());
            }
        };

        let id = self.allocate_id()?;
        let mut channel = Channel::accepted(
            id,
            &msg.channel_type,
            self.config.initial_window,
            self.config.max_packet,
            msg.sender_channel,
            msg.initial_window,
            msg.max_packet.min(MAX_CHANNEL_DATA),
        );
        channel.set_attributes(ctx.attributes);
        channel.handlers = handlers;
        self.channels.insert(id, channel);

        self.outbound.push_back(
            ChannelOpenConfirmation {
                recipient_channel: msg.sender_channel,
                sender_channel: id,
                initial_window: self.config.initial_window,
                max_packet: self.config.max_packet,
                data: Vec::new(),
            }
            .to_bytes(),
        );
        for listener in self.listeners.iter() {
            listener.channel_opened(id, &msg.channel_type);
        }
        tracing::debug!(channel = id, channel_type = %msg.channel_type, "accepted channel");
        self.events.push_back(ConnectionEvent::ChannelAccepted {
            channel: id,
            channel_type: msg.channel_type,
            data: msg.data,
        });
        Ok(())
    }

    fn reject_open(&mut self, recipient_channel: u32, reason: OpenFailureReason, description: &str) {
        self.outbound.push_back(
            ChannelOpenFailure::new(recipient_channel, reason, description).to_bytes(),
        );
    }

    fn on_open_confirmation(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = ChannelOpenConfirmation::from_bytes(payload)?;
        if msg.max_packet == 0 {
            return Err(HalyardError::Protocol(format!(
                "Channel {} confirmed with zero maximum packet",
                msg.recipient_channel
            )));
        }
        let id = msg.recipient_channel;
        let channel = peer_channel(&mut self.channels, id)?;
        channel.confirm(
            msg.sender_channel,
            msg.initial_window,
            msg.max_packet.min(MAX_CHANNEL_DATA),
        )?;
        let close_now = channel.close_on_open;
        let channel_type = channel.channel_type().to_string();
        for listener in self.listeners.iter().chain(channel.listeners.iter()) {
            listener.channel_opened(id, &channel_type);
        }
        self.events
            .push_back(ConnectionEvent::ChannelOpened { channel: id });
        if close_now {
            self.close_channel(id)
        } else {
            self.flush_channel(id);
            Ok(())
        }
    }

    fn on_open_failure(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = ChannelOpenFailure::from_bytes(payload)?;
        let id = msg.recipient_channel;
        if peer_channel(&mut self.channels, id)?.state() != ChannelState::Opening {
            return Err(HalyardError::Protocol(format!(
                "Open failure for channel {} that is not opening",
                id
            )));
        }
        if let Some(mut channel) = self.channels.remove(&id) {
            channel.mark_closed();
        }
        tracing::debug!(channel = id, reason = msg.reason, description = %msg.description, "channel open failed");
        self.events.push_back(ConnectionEvent::ChannelOpenFailed {
            channel: id,
            reason: msg.reason,
            description: msg.description,
        });
        Ok(())
    }

    fn on_window_adjust(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = ChannelWindowAdjust::from_bytes(payload)?;
        let id = msg.recipient_channel;
        let channel = peer_channel(&mut self.channels, id)?;
        let window = channel.grow_remote(msg.bytes_to_add)?;
        for listener in self.listeners.iter().chain(channel.listeners.iter()) {
            listener.window_adjusted(id, window);
        }
        self.flush_channel(id);
        Ok(())
    }

    fn on_data(&mut self, id: u32, data_type: Option<u32>, data: Vec<u8>) -> HalyardResult<()> {
        let channel = peer_channel(&mut self.channels, id)?;
        if channel.close_sent() {
            return Ok(());
        }
        channel.receive(data.len())?;
        let event = match data_type {
            None => ConnectionEvent::Data { channel: id, data },
            Some(data_type) => ConnectionEvent::ExtendedData {
                channel: id,
                data_type,
                data,
            },
        };
        self.events.push_back(event);
        Ok(())
    }

    fn on_eof(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let id = ChannelEof::from_bytes(payload)?.recipient_channel;
        let channel = peer_channel(&mut self.channels, id)?;
        if channel.eof_received() {
            return Err(HalyardError::Protocol(format!("Duplicate EOF on channel {}", id)));
        }
        channel.mark_eof_received();
        for listener in self.listeners.iter().chain(channel.listeners.iter()) {
            listener.channel_eof(id);
        }
        self.events.push_back(ConnectionEvent::Eof { channel: id });
        self.flush_channel(id);
        Ok(())
    }

    fn on_close(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let id = ChannelClose::from_bytes(payload)?.recipient_channel;
        let channel = peer_channel(&mut self.channels, id)?;
        if channel.state() == ChannelState::Opening {
            return Err(HalyardError::Protocol(format!(
                "Close for channel {} that is not open",
                id
            )));
        }
        channel.mark_close_received();
        if !channel.close_sent() {
            channel.mark_close_sent();
            self.outbound.push_back(
                ChannelClose {
                    recipient_channel: channel.remote_id(),
                }
                .to_bytes(),
            );
        }
        self.finish_channel(id, None);
        Ok(())
    }

    fn on_channel_request(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let msg = ChannelRequest::from_bytes(payload)?;
        let id = msg.recipient_channel;
        let serial = self.next_reply_serial;
        let channel = peer_channel(&mut self.channels, id)?;
        if channel.close_sent() {
            return Ok(());
        }
        let ctx = ChannelContext {
            channel_id: id,
            channel_type: channel.channel_type().to_string(),
            attributes: channel.attributes().clone(),
            reply_token: ReplyToken::channel(id, serial),
        };
        let extra = channel.handlers.clone();
        self.next_reply_serial += 1;

        let request = Request::new(msg.name, msg.want_reply, msg.data);
        let outcome = self.handlers.channel.dispatch_with(&extra, &ctx, &request);
        tracing::debug!(channel = id, name = %request.name, want_reply = request.want_reply, ?outcome, "channel request");

        if !request.want_reply {
            return Ok(());
        }
        let slot = match outcome {
            RequestOutcome::Unsupported => Some(Reply::Failure),
            RequestOutcome::Handled(reply) => Some(reply),
            RequestOutcome::Replied => None,
        };
        peer_channel(&mut self.channels, id)?.owed_replies.push_back((serial, slot));
        self.flush_channel_replies(id);
        Ok(())
    }

    fn on_channel_reply(&mut self, id: u32, reply: Reply) -> HalyardResult<()> {
        let request_id = peer_channel(&mut self.channels, id)?
            .pending_requests
            .pop_front()
            .ok_or_else(|| {
                HalyardError::Protocol(format!(
                    "Channel request reply on {} without a pending request",
                    id
                ))
            })?;
        self.events.push_back(ConnectionEvent::RequestReply {
            id: request_id,
            reply: Ok(reply),
        });
        Ok(())
    }
}

fn peer_channel(channels: &mut BTreeMap<u32, Channel>, id: u32) -> HalyardResult<&mut Channel> {
    channels
        .get_mut(&id)
        .ok_or_else(|| HalyardError::Protocol(format!("Message for unknown channel {}", id)))
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("channels", &self.channels.len())
            .field("next_channel_id", &self.next_channel_id)
            .field("pending_global", &self.pending_global.len())
            .field("failed", &self.failure.is_some())
            .finish()
    }
}
