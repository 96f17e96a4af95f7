//! SSH transport session engine (RFC 4251, 4253, 4254).
//!
//! # Architecture
//!
//! The engine is layered, and the two protocol layers are sans-IO: they
//! consume bytes or payloads and a clock reading, and produce bytes and
//! events.
//!
//! 1. **Algorithms** ([`registry`], [`cipher`], [`mac`], [`compression`],
//!    [`hostkey`], [`kex`]) - named factories resolved by the registry
//! 2. **Packets** ([`packet`], [`version`]) - identification exchange and the
//!    binary packet protocol with sequence numbers
//! 3. **Transport** ([`transport`]) - negotiation, key exchange, rekeying,
//!    disconnect
//! 4. **Connection** ([`connection`], [`channel`], [`request`]) - channel
//!    multiplexing, flow control, global and channel requests
//! 5. **Session** ([`session`]) - tokio task driving both layers over a
//!    stream, with handles for applications
//!
//! User authentication is not implemented here: its messages pass through
//! [`session::SessionHandle::send_message`] and
//! [`session::SessionHandle::take_messages`].
//!
//! # Example
//!
//! ```rust
//! use halyard_proto::ssh::Packet;
//!
//! let packet = Packet::new(b"payload".to_vec()).unwrap();
//! let bytes = packet.to_bytes();
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), b"payload");
//! ```

pub mod attributes;
pub mod channel;
pub mod cipher;
pub mod compression;
pub mod connection;
pub mod hostkey;
pub mod kex;
pub mod listener;
pub mod mac;
pub mod message;
pub mod packet;
pub mod registry;
pub mod request;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

pub use attributes::{AttributeKey, Attributes};
pub use channel::{Channel, ChannelMessage, ChannelState};
pub use connection::{
    AcceptChannelType, ChannelOpenHandler, Connection, ConnectionConfig, ConnectionEvent,
    ConnectionHandlers, OpenDecision, OpenFailureReason,
};
pub use hostkey::{
    AcceptAnyHostKey, EcdsaHostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyProvider,
    HostKeyVerifier, PinnedHostKeys, StaticHostKeys,
};
pub use kex::{AlgorithmProposal, KexInit, NegotiatedAlgorithms, NewKeys};
pub use listener::{ChannelListener, ListenerSet, SessionListener};
pub use message::MessageType;
pub use packet::{Packet, PacketCodec};
pub use registry::AlgorithmRegistry;
pub use request::{
    ChannelContext, GlobalContext, HandlerChain, Reply, ReplyToken, Request, RequestHandler,
    RequestId, RequestOutcome,
};
pub use session::{connect, ChannelHandle, SessionConfig, SessionHandle, SshSession};
pub use transport::{RekeyLimits, Role, Transport, TransportConfig, TransportEvent};
pub use version::Version;
