//! SSH Transport Layer State Machine (RFC 4253).
//!
//! [`Transport`] is sans-IO: the caller feeds received bytes together with
//! the current [`Instant`], drains outbound bytes with
//! [`take_outbound`](Transport::take_outbound) and reacts to
//! [`TransportEvent`]s from [`poll_event`](Transport::poll_event).
//!
//! # Transport States
//!
//! ```text
//! Init -> IdentExchanged -> Negotiating -> Exchanging -> KeysEstablished -> Operational
//!                                                                          |      ^
//!                                                                          v      |
//!                                                                          Rekeying
//! (any) -> Closing -> Closed
//! ```
//!
//! # Rekeying
//!
//! A new key exchange starts when any configured [`RekeyLimits`] is crossed
//! (bytes, packets, elapsed time) or on [`request_rekey`](Transport::request_rekey).
//! Crossings while an exchange is in flight are coalesced. Upper-layer
//! payloads submitted during an exchange are queued and sent after our
//! NEWKEYS.
//!
//! # Example
//!
//! ```rust
//! use std::time::Instant;
//! use halyard_proto::ssh::transport::{State, Transport, TransportConfig};
//!
//! let transport = Transport::new(TransportConfig::client(), Instant::now()).unwrap();
//! assert_eq!(transport.state(), State::Init);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use halyard_platform::{DisconnectReason, HalyardError, HalyardResult};

use super::cipher::CipherFactory;
use super::compression::CompressionFactory;
use super::hostkey::{AcceptAnyHostKey, HostKeyProvider, HostKeyVerifier};
use super::kex::dh::{GEX_MAX_BITS, GEX_MIN_BITS};
use super::kex::{
    negotiate, AlgorithmProposal, BuiltinGroups, DhGroup, DirectionKeys, ExchangeTranscript,
    GroupExchangeParams, GroupProvider, KexFactory, KexHash, KexInit, KexParam, KeyExchange,
    KeyLengths, NegotiatedAlgorithms, NewKeys, SessionKeys, SharedSecret, ValueFormat,
};
use super::mac::MacFactory;
use super::message::{self, DebugMessage, Disconnect, Ignore, MessageType, Unimplemented};
use super::packet::{DirectionCrypto, PacketCodec};
use super::registry::AlgorithmRegistry;
use super::version::{IdentificationReader, Version};
use super::wire::{self, WireReader};

/// Which end of the connection this transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Initiates the connection; its preferences win negotiation.
    Client,
    /// Accepts the connection and owns the host keys.
    Server,
}

impl Role {
    /// Returns true for [`Role::Client`].
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Identification line sent, waiting for the peer's.
    Init,
    /// Both identification lines known.
    IdentExchanged,
    /// Our KEXINIT sent, waiting for the peer's.
    Negotiating,
    /// Algorithms agreed, exchange messages in flight.
    Exchanging,
    /// Our NEWKEYS sent, waiting for the peer's.
    KeysEstablished,
    /// Keys in use in both directions.
    Operational,
    /// A follow-up key exchange is in flight.
    Rekeying,
    /// Shutting down.
    Closing,
    /// Terminal.
    Closed,
}

impl State {
    fn can_transition_to(self, next: State) -> bool {
        use State::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closing) => self != Closing,
            (_, Closed) => true,
            (Init, IdentExchanged)
            | (IdentExchanged, Negotiating)
            | (Negotiating, Exchanging)
            | (Exchanging, KeysEstablished)
            | (KeysEstablished, Operational)
            | (Operational, Rekeying)
            | (Rekeying, Operational) => true,
            _ => false,
        }
    }
}

/// Thresholds that trigger an automatic rekey. `None` disables a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyLimits {
    /// Bytes sent plus received under the current keys.
    pub bytes: Option<u64>,
    /// Packets sent plus received under the current keys.
    pub packets: Option<u64>,
    /// Time since the last key switch.
    pub interval: Option<Duration>,
}

impl RekeyLimits {
    /// No automatic rekeying.
    pub const fn unlimited() -> Self {
        Self {
            bytes: None,
            packets: None,
            interval: None,
        }
    }
}

impl Default for RekeyLimits {
    fn default() -> Self {
        Self {
            bytes: Some(1 << 30),     // 1 GiB
            packets: Some(1 << 31),   // half the sequence space
            interval: Some(Duration::from_secs(3600)),
        }
    }
}

/// Traffic since the last key switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RekeyCounters {
    /// Wire bytes in both directions.
    pub bytes: u64,
    /// Packets in both directions.
    pub packets: u64,
    /// When the current keys were installed.
    pub since: Instant,
}

impl RekeyCounters {
    fn new(now: Instant) -> Self {
        Self {
            bytes: 0,
            packets: 0,
            since: now,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.bytes = self.bytes.saturating_add(bytes as u64);
        self.packets = self.packets.saturating_add(1);
    }

    /// The first limit crossed, if any.
    pub fn exceeded(&self, limits: &RekeyLimits, now: Instant) -> Option<&'static str> {
        if limits.bytes.map_or(false, |max| self.bytes >= max) {
            return Some("bytes");
        }
        if limits.packets.map_or(false, |max| self.packets >= max) {
            return Some("packets");
        }
        if limits
            .interval
            .map_or(false, |max| now.saturating_duration_since(self.since) >= max)
        {
            return Some("time");
        }
        None
    }
}

/// Group sizes requested by a group-exchange client (RFC 4419).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GexRequest {
    /// Minimal acceptable size in bits.
    pub min: u32,
    /// Preferred size in bits.
    pub preferred: u32,
    /// Maximal acceptable size in bits.
    pub max: u32,
}

impl Default for GexRequest {
    fn default() -> Self {
        Self {
            min: GEX_MIN_BITS,
            preferred: 2048,
            max: GEX_MAX_BITS,
        }
    }
}

/// Receives SSH_MSG_IGNORE, SSH_MSG_DEBUG and SSH_MSG_UNIMPLEMENTED.
///
/// Handlers run on the transport's task and must not block.
pub trait ReservedMessageHandler: Send + Sync {
    /// SSH_MSG_IGNORE
    fn ignore(&self, data: &[u8]) {
        tracing::trace!(len = data.len(), "peer sent SSH_MSG_IGNORE");
    }

    /// SSH_MSG_DEBUG
    fn debug(&self, message: &DebugMessage) {
        if message.always_display {
            tracing::info!(message = %message.message, "peer debug message");
        } else {
            tracing::debug!(message = %message.message, "peer debug message");
        }
    }

    /// SSH_MSG_UNIMPLEMENTED for one of our packets.
    fn unimplemented(&self, sequence: u32) {
        tracing::debug!(sequence, "peer did not implement our message");
    }
}

/// Logs reserved messages through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReservedHandler;

impl ReservedMessageHandler for LoggingReservedHandler {}

/// Transport layer configuration.
#[derive(Clone)]
pub struct TransportConfig {
    /// Client or server.
    pub role: Role,
    /// Our identification string.
    pub version: Version,
    /// Our algorithm preferences.
    pub proposal: AlgorithmProposal,
    /// Automatic rekey thresholds.
    pub rekey_limits: RekeyLimits,
    /// Maximum duration of one key exchange (and of the initial handshake).
    pub kex_timeout: Duration,
    /// Group sizes requested for group exchange (client).
    pub group_exchange: GexRequest,
    /// Algorithm factories.
    pub registry: Arc<AlgorithmRegistry>,
    /// Host keys (server).
    pub host_keys: Option<Arc<dyn HostKeyProvider>>,
    /// Host key acceptance policy (client).
    pub host_key_verifier: Arc<dyn HostKeyVerifier>,
    /// Group source for group exchange (server).
    pub group_provider: Arc<dyn GroupProvider>,
    /// Reserved message sink.
    pub reserved_handler: Arc<dyn ReservedMessageHandler>,
}

impl TransportConfig {
    /// Creates a configuration for `role` using the global registry.
    pub fn new(role: Role) -> Self {
        let registry = AlgorithmRegistry::global();
        Self {
            role,
            version: Version::default_halyard(),
            proposal: AlgorithmProposal::from_registry(&registry),
            rekey_limits: RekeyLimits::default(),
            kex_timeout: Duration::from_secs(60),
            group_exchange: GexRequest::default(),
            registry,
            host_keys: None,
            host_key_verifier: Arc::new(AcceptAnyHostKey),
            group_provider: Arc::new(BuiltinGroups),
            reserved_handler: Arc::new(LoggingReservedHandler),
        }
    }

    /// Client configuration.
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Server configuration serving `host_keys`.
    pub fn server(host_keys: Arc<dyn HostKeyProvider>) -> Self {
        let mut config = Self::new(Role::Server);
        config.host_keys = Some(host_keys);
        config
    }

    /// Uses `registry` and proposes everything it supports.
    pub fn with_registry(mut self, registry: Arc<AlgorithmRegistry>) -> Self {
        self.proposal = AlgorithmProposal::from_registry(&registry);
        self.registry = registry;
        self
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("role", &self.role)
            .field("version", &self.version.as_str())
            .field("proposal", &self.proposal)
            .field("rekey_limits", &self.rekey_limits)
            .field("kex_timeout", &self.kex_timeout)
            .field("group_exchange", &self.group_exchange)
            .finish_non_exhaustive()
    }
}

/// Something the caller must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The first key exchange finished.
    Established {
        /// Session identifier (first exchange hash).
        session_id: Vec<u8>,
        /// Algorithms in use.
        algorithms: NegotiatedAlgorithms,
    },
    /// A follow-up key exchange finished.
    Rekeyed {
        /// Algorithms now in use.
        algorithms: NegotiatedAlgorithms,
    },
    /// A payload for the layers above the transport.
    Payload {
        /// Inbound sequence number, for SSH_MSG_UNIMPLEMENTED.
        sequence: u32,
        /// Message bytes starting with the message number.
        payload: Vec<u8>,
    },
    /// The peer sent SSH_MSG_DISCONNECT.
    Disconnected {
        /// Reason code.
        reason: u32,
        /// Human readable description.
        description: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KexStep {
    AwaitKexInit,
    AwaitGexRequest,
    AwaitGexGroup,
    AwaitInit,
    AwaitReply,
    AwaitNewKeys,
}

/// One key exchange in flight.
struct KexState {
    step: KexStep,
    started: Instant,
    local_kexinit: Vec<u8>,
    peer_kexinit: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    factory: Option<Arc<dyn KexFactory>>,
    exchange: Option<Box<dyn KeyExchange>>,
    group_exchange: Option<GroupExchangeParams>,
    /// Client: our `e`/`Q_C`.
    client_value: Vec<u8>,
    ignore_next_kex_packet: bool,
    pending_outbound: Option<DirectionCrypto>,
    pending_inbound: Option<DirectionCrypto>,
    sent_newkeys: bool,
    received_newkeys: bool,
}

impl KexState {
    fn new(local_kexinit: Vec<u8>, now: Instant) -> Self {
        Self {
            step: KexStep::AwaitKexInit,
            started: now,
            local_kexinit,
            peer_kexinit: None,
            negotiated: None,
            factory: None,
            exchange: None,
            group_exchange: None,
            client_value: Vec::new(),
            ignore_next_kex_packet: false,
            pending_outbound: None,
            pending_inbound: None,
            sent_newkeys: false,
            received_newkeys: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.sent_newkeys && self.received_newkeys
    }

    /// The peer is between its KEXINIT and its NEWKEYS.
    fn peer_exchanging(&self) -> bool {
        self.peer_kexinit.is_some() && !self.received_newkeys
    }

    fn negotiated(&self) -> HalyardResult<&NegotiatedAlgorithms> {
        self.negotiated
            .as_ref()
            .ok_or_else(|| HalyardError::Protocol("Key exchange not negotiated".to_string()))
    }

    fn exchange(&mut self) -> HalyardResult<&mut Box<dyn KeyExchange>> {
        self.exchange
            .as_mut()
            .ok_or_else(|| HalyardError::Protocol("Key exchange not started".to_string()))
    }
}

/// SSH transport layer state machine.
pub struct Transport {
    config: TransportConfig,
    proposal: AlgorithmProposal,
    state: State,
    codec: PacketCodec,
    ident_reader: IdentificationReader,
    peer_version: Option<Version>,
    inbound: BytesMut,
    outbound: BytesMut,
    events: VecDeque<TransportEvent>,
    queued: VecDeque<Vec<u8>>,
    kex: Option<KexState>,
    session_id: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    counters: RekeyCounters,
    created: Instant,
    established: bool,
}

impl Transport {
    /// Creates a transport and queues our identification line.
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Config`] if a server has no host keys or a
    /// proposal category is empty after filtering unsupported names.
    pub fn new(config: TransportConfig, now: Instant) -> HalyardResult<Self> {
        let mut proposal = config.proposal.clone();
        proposal.retain_supported(&config.registry);

        if config.role == Role::Server {
            let provider = config.host_keys.as_ref().ok_or_else(|| {
                HalyardError::Config("Server transport requires host keys".to_string())
            })?;
            let available = provider.algorithms();
            proposal.host_key.retain(|alg| available.contains(alg));
        }

        for (category, names) in [
            ("kex", &proposal.kex),
            ("host key", &proposal.host_key),
            ("cipher", &proposal.ciphers),
            ("mac", &proposal.macs),
            ("compression", &proposal.compression),
        ] {
            if names.is_empty() {
                return Err(HalyardError::Config(format!(
                    "No supported {} algorithms to propose",
                    category
                )));
            }
        }

        let mut outbound = BytesMut::new();
        outbound.put_slice(&config.version.to_wire_format());

        Ok(Self {
            config,
            proposal,
            state: State::Init,
            codec: PacketCodec::new(),
            ident_reader: IdentificationReader::new(),
            peer_version: None,
            inbound: BytesMut::new(),
            outbound,
            events: VecDeque::new(),
            queued: VecDeque::new(),
            kex: None,
            session_id: None,
            negotiated: None,
            counters: RekeyCounters::new(now),
            created: now,
            established: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Client or server.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Our identification.
    pub fn local_version(&self) -> &Version {
        &self.config.version
    }

    /// Peer's identification, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Session identifier, fixed by the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Algorithms of the keys in use.
    pub fn negotiated(&self) -> Option<&NegotiatedAlgorithms> {
        self.negotiated.as_ref()
    }

    /// Traffic since the last key switch.
    pub fn counters(&self) -> &RekeyCounters {
        &self.counters
    }

    /// Whether the first key exchange completed.
    pub fn is_established(&self) -> bool {
        self.established
    }

    /// Whether a key exchange is in flight.
    pub fn is_exchanging(&self) -> bool {
        self.kex.is_some()
    }

    /// Whether the transport stopped accepting traffic
    /// ([`State::Closing`] or [`State::Closed`]).
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closing | State::Closed)
    }

    /// Outbound bytes to write to the stream.
    ///
    /// Draining the final bytes of a closing transport moves it to
    /// [`State::Closed`].
    pub fn take_outbound(&mut self) -> Option<Bytes> {
        if self.state == State::Closing {
            self.state = State::Closed;
        }
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Next event, if any.
    pub fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Transitions to the next state.
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Protocol`] for edges outside the state diagram.
    pub fn transition(&mut self, next: State) -> HalyardResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(HalyardError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next
            )));
        }
        tracing::trace!(from = ?self.state, to = ?next, "transport state");
        self.state = next;
        Ok(())
    }

    /// Processes received bytes.
    ///
    /// Fatal errors send a best-effort SSH_MSG_DISCONNECT, close the
    /// transport and are returned.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> HalyardResult<()> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Ok(());
        }
        self.inbound.extend_from_slice(data);
        self.process_inbound(now).map_err(|e| self.fail(e))
    }

    /// Sends an upper-layer payload, queueing it while a key exchange is
    /// in flight.
    pub fn send_payload(&mut self, payload: &[u8], now: Instant) -> HalyardResult<()> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Err(HalyardError::Protocol("Transport is closed".to_string()));
        }
        let number = message::message_number(payload)?;
        if message::is_key_exchange(number) || number == MessageType::Disconnect as u8 {
            return Err(HalyardError::Protocol(format!(
                "Message {} is reserved for the transport",
                number
            )));
        }

        let hold = match &self.kex {
            Some(kex) => !kex.sent_newkeys,
            None => !self.established,
        };
        if hold {
            self.queued.push_back(payload.to_vec());
            return Ok(());
        }

        let result = self
            .write_packet(payload)
            .and_then(|_| self.check_rekey(now));
        result.map_err(|e| self.fail(e))
    }

    /// Replies SSH_MSG_UNIMPLEMENTED for an inbound sequence number.
    pub fn send_unimplemented(&mut self, sequence: u32) -> HalyardResult<()> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Ok(());
        }
        let result = self.write_packet(&Unimplemented { sequence }.to_bytes());
        result.map_err(|e| self.fail(e))
    }

    /// Starts a key exchange unless one is already in flight.
    ///
    /// # Errors
    ///
    /// Returns [`HalyardError::Protocol`] before the first exchange completed
    /// or after the transport closed.
    pub fn request_rekey(&mut self, now: Instant) -> HalyardResult<()> {
        if !self.established || matches!(self.state, State::Closing | State::Closed) {
            return Err(HalyardError::Protocol(
                "Rekey requires an operational transport".to_string(),
            ));
        }
        if self.kex.is_some() {
            tracing::debug!("rekey already in progress");
            return Ok(());
        }
        tracing::info!("rekey requested");
        let result = self.start_kex(now);
        result.map_err(|e| self.fail(e))
    }

    /// Checks the key exchange timeout and the rekey interval.
    pub fn poll_timers(&mut self, now: Instant) -> HalyardResult<()> {
        if matches!(self.state, State::Closing | State::Closed) {
            return Ok(());
        }
        let started = match &self.kex {
            Some(kex) => Some(kex.started),
            None if !self.established => Some(self.created),
            None => None,
        };
        if let Some(started) = started {
            let elapsed = now.saturating_duration_since(started);
            if elapsed > self.config.kex_timeout {
                let err = HalyardError::Timeout(format!(
                    "Key exchange did not complete within {:?}",
                    self.config.kex_timeout
                ));
                return Err(self.fail(err));
            }
        }
        let result = self.check_rekey(now);
        result.map_err(|e| self.fail(e))
    }

    /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        if matches!(self.state, State::Closing | State::Closed) {
            return None;
        }
        match &self.kex {
            Some(kex) => Some(kex.started + self.config.kex_timeout),
            None if !self.established => Some(self.created + self.config.kex_timeout),
            None => self
                .config
                .rekey_limits
                .interval
                .map(|interval| self.counters.since + interval),
        }
    }

    /// Sends SSH_MSG_DISCONNECT (best effort) and closes. Idempotent.
    pub fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        if matches!(self.state, State::Closing | State::Closed) {
            return;
        }
        tracing::debug!(reason = reason as u32, description, "disconnecting");
        let message = Disconnect::new(reason as u32, description);
        if let Err(e) = self.write_packet(&message.to_bytes()) {
            tracing::debug!(error = %e, "could not encode disconnect");
        }
        self.state = State::Closing;
        self.kex = None;
        self.queued.clear();
    }

    fn fail(&mut self, err: HalyardError) -> HalyardError {
        if !matches!(self.state, State::Closing | State::Closed) {
            tracing::warn!(error = %err, "transport failure");
            self.disconnect(err.disconnect_reason(), &err.to_string());
        }
        err
    }

    fn write_packet(&mut self, payload: &[u8]) -> HalyardResult<()> {
        let wire = self.codec.seal(payload)?;
        self.counters.record(wire.len());
        self.outbound.put_slice(&wire);
        Ok(())
    }

    fn process_inbound(&mut self, now: Instant) -> HalyardResult<()> {
        if self.state == State::Init {
            match self.ident_reader.read(&mut self.inbound)? {
                None => return Ok(()),
                Some(version) => {
                    tracing::debug!(peer = %version, "identification exchanged");
                    self.peer_version = Some(version);
                    self.transition(State::IdentExchanged)?;
                    self.start_kex(now)?;
                }
            }
        }

        while !matches!(self.state, State::Closing | State::Closed) {
            let before = self.inbound.len();
            let (sequence, payload) = match self.codec.open(&mut self.inbound)? {
                Some(packet) => packet,
                None => break,
            };
            self.counters.record(before - self.inbound.len());
            self.handle_packet(sequence, payload, now)?;
        }

        if self.state == State::Operational {
            self.check_rekey(now)?;
        }
        Ok(())
    }

    fn check_rekey(&mut self, now: Instant) -> HalyardResult<()> {
        if self.state != State::Operational || self.kex.is_some() {
            return Ok(());
        }
        if let Some(trigger) = self.counters.exceeded(&self.config.rekey_limits, now) {
            tracing::info!(
                trigger,
                bytes = self.counters.bytes,
                packets = self.counters.packets,
                "rekey limit reached"
            );
            self.start_kex(now)?;
        }
        Ok(())
    }

    fn start_kex(&mut self, now: Instant) -> HalyardResult<()> {
        if self.kex.is_none() {
            let kex = self.begin_kex(now)?;
            self.kex = Some(kex);
        }
        Ok(())
    }

    fn begin_kex(&mut self, now: Instant) -> HalyardResult<KexState> {
        let kexinit = KexInit::from_proposal(&self.proposal).to_bytes();
        self.write_packet(&kexinit)?;
        if self.established {
            self.transition(State::Rekeying)?;
        } else {
            self.transition(State::Negotiating)?;
        }
        tracing::debug!(role = ?self.config.role, "sent KEXINIT");
        Ok(KexState::new(kexinit, now))
    }

    fn handle_packet(&mut self, sequence: u32, payload: Vec<u8>, now: Instant) -> HalyardResult<()> {
        let number = message::message_number(&payload)?;
        match MessageType::from_u8(number) {
            Some(MessageType::Disconnect) => {
                let msg = Disconnect::from_bytes(&payload)?;
                tracing::debug!(reason = msg.reason, description = %msg.description, "peer disconnected");
                self.state = State::Closed;
                self.kex = None;
                self.events.push_back(TransportEvent::Disconnected {
                    reason: msg.reason,
                    description: msg.description,
                });
                return Ok(());
            }
            Some(MessageType::Ignore) => {
                if let Ok(msg) = Ignore::from_bytes(&payload) {
                    self.config.reserved_handler.ignore(&msg.data);
                }
                return Ok(());
            }
            Some(MessageType::Unimplemented) => {
                if let Ok(msg) = Unimplemented::from_bytes(&payload) {
                    self.config.reserved_handler.unimplemented(msg.sequence);
                }
                return Ok(());
            }
            Some(MessageType::Debug) => {
                if let Ok(msg) = DebugMessage::from_bytes(&payload) {
                    self.config.reserved_handler.debug(&msg);
                }
                return Ok(());
            }
            _ => {}
        }

        if message::is_key_exchange(number) {
            return self.handle_kex_packet(number, &payload, now);
        }

        if self.kex.as_ref().map_or(false, KexState::peer_exchanging) || !self.established {
            return Err(HalyardError::Protocol(format!(
                "Unexpected message {} during key exchange",
                number
            )));
        }

        if number == MessageType::ServiceRequest as u8
            || number == MessageType::ServiceAccept as u8
            || number >= 50
        {
            self.events
                .push_back(TransportEvent::Payload { sequence, payload });
        } else {
            tracing::debug!(number, sequence, "unknown transport message");
            self.write_packet(&Unimplemented { sequence }.to_bytes())?;
        }
        Ok(())
    }

    fn handle_kex_packet(&mut self, number: u8, payload: &[u8], now: Instant) -> HalyardResult<()> {
        let mut kex = match self.kex.take() {
            Some(kex) => kex,
            None if number == MessageType::KexInit as u8 => self.begin_kex(now)?,
            None => {
                return Err(HalyardError::Protocol(format!(
                    "Key exchange message {} outside key exchange",
                    number
                )))
            }
        };

        if kex.ignore_next_kex_packet && number >= MessageType::KexdhInit as u8 {
            kex.ignore_next_kex_packet = false;
            tracing::debug!(number, "ignoring wrongly guessed key exchange packet");
            self.kex = Some(kex);
            return Ok(());
        }

        self.step_kex(&mut kex, number, payload)?;

        if kex.is_complete() {
            self.complete_kex(kex, now)
        } else {
            self.kex = Some(kex);
            Ok(())
        }
    }

    fn step_kex(&mut self, kex: &mut KexState, number: u8, payload: &[u8]) -> HalyardResult<()> {
        let gex = kex.group_exchange.is_some();
        match (number, kex.step) {
            (20, KexStep::AwaitKexInit) => self.on_kexinit(kex, payload),
            (21, _) => self.on_newkeys(kex, payload),
            (34, KexStep::AwaitGexRequest) => self.on_gex_request(kex, payload),
            (31, KexStep::AwaitGexGroup) => self.on_gex_group(kex, payload),
            (30, KexStep::AwaitInit) if !gex => self.on_init(kex, payload),
            (32, KexStep::AwaitInit) if gex => self.on_init(kex, payload),
            (31, KexStep::AwaitReply) if !gex => self.on_reply(kex, payload),
            (33, KexStep::AwaitReply) if gex => self.on_reply(kex, payload),
            (number, step) => Err(HalyardError::Protocol(format!(
                "Unexpected key exchange message {} while in {:?}",
                number, step
            ))),
        }
    }

    fn on_kexinit(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        let peer = KexInit::from_bytes(payload)?;
        let local = KexInit::from_bytes(&kex.local_kexinit)?;
        let (client, server) = match self.config.role {
            Role::Client => (&local, &peer),
            Role::Server => (&peer, &local),
        };
        let negotiated = negotiate(client, server, &self.config.registry)?;
        tracing::debug!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher_c2s = %negotiated.cipher_client_to_server,
            mac_c2s = %negotiated.mac_client_to_server,
            "algorithms negotiated"
        );

        if peer.first_kex_packet_follows && !peer.guess_matches(&negotiated) {
            kex.ignore_next_kex_packet = true;
        }

        let factory = self.config.registry.kex.require(&negotiated.kex)?;
        kex.peer_kexinit = Some(payload.to_vec());
        kex.negotiated = Some(negotiated);

        if self.state == State::Negotiating {
            self.transition(State::Exchanging)?;
        }

        if factory.is_group_exchange() {
            match self.config.role {
                Role::Client => {
                    let request = self.config.group_exchange;
                    let mut buf = BytesMut::new();
                    buf.put_u8(MessageType::KexDhGexRequest as u8);
                    buf.put_u32(request.min);
                    buf.put_u32(request.preferred);
                    buf.put_u32(request.max);
                    self.write_packet(&buf)?;
                    kex.step = KexStep::AwaitGexGroup;
                }
                Role::Server => kex.step = KexStep::AwaitGexRequest,
            }
        } else {
            let mut exchange = factory.create(&[])?;
            match self.config.role {
                Role::Client => {
                    let value = exchange.initiate()?;
                    self.send_init(MessageType::KexdhInit, exchange.value_format(), &value)?;
                    kex.client_value = value;
                    kex.step = KexStep::AwaitReply;
                }
                Role::Server => kex.step = KexStep::AwaitInit,
            }
            kex.exchange = Some(exchange);
        }
        kex.factory = Some(factory);
        Ok(())
    }

    fn send_init(&mut self, number: MessageType, format: ValueFormat, value: &[u8]) -> HalyardResult<()> {
        let mut buf = BytesMut::new();
        buf.put_u8(number as u8);
        write_value(&mut buf, format, value);
        self.write_packet(&buf)
    }

    fn on_gex_request(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        let mut r = WireReader::new(&payload[1..]);
        let min = r.read_u32()?;
        let preferred = r.read_u32()?;
        let max = r.read_u32()?;
        if min > preferred || preferred > max {
            return Err(HalyardError::Protocol(format!(
                "Invalid group exchange request {}/{}/{}",
                min, preferred, max
            )));
        }

        let group = self
            .config
            .group_provider
            .select(min.max(GEX_MIN_BITS), preferred, max.min(GEX_MAX_BITS))
            .ok_or_else(|| {
                HalyardError::Negotiation(format!(
                    "No group between {} and {} bits",
                    min, max
                ))
            })?;

        let mut buf = BytesMut::new();
        buf.put_u8(message::KEX_DH_GEX_GROUP);
        wire::write_mpint(&mut buf, &group.p.to_bytes_be());
        wire::write_mpint(&mut buf, &group.g.to_bytes_be());
        self.write_packet(&buf)?;

        self.create_gex_exchange(kex, min, preferred, max, group)?;
        kex.step = KexStep::AwaitInit;
        Ok(())
    }

    fn on_gex_group(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        let mut r = WireReader::new(&payload[1..]);
        let p = num_bigint::BigUint::from_bytes_be(r.read_mpint()?);
        let g = num_bigint::BigUint::from_bytes_be(r.read_mpint()?);
        let request = self.config.group_exchange;
        let group = DhGroup::new(p, g);
        let bits = group.bits();
        if bits < u64::from(request.min) || bits > u64::from(request.max) {
            return Err(HalyardError::Protocol(format!(
                "Server group of {} bits outside requested {}..={}",
                bits, request.min, request.max
            )));
        }

        self.create_gex_exchange(kex, request.min, request.preferred, request.max, group)?;
        let exchange = kex.exchange()?;
        let value = exchange.initiate()?;
        let format = exchange.value_format();
        self.send_init(MessageType::KexDhGexInit, format, &value)?;
        kex.client_value = value;
        kex.step = KexStep::AwaitReply;
        Ok(())
    }

    fn create_gex_exchange(
        &mut self,
        kex: &mut KexState,
        min: u32,
        preferred: u32,
        max: u32,
        group: DhGroup,
    ) -> HalyardResult<()> {
        let factory = kex
            .factory
            .clone()
            .ok_or_else(|| HalyardError::Protocol("Key exchange not negotiated".to_string()))?;
        let params = [KexParam::Int(group.p.clone()), KexParam::Int(group.g.clone())];
        let exchange = factory.create(&params).map_err(|e| match e {
            HalyardError::Config(msg) => HalyardError::Protocol(msg),
            other => other,
        })?;
        kex.exchange = Some(exchange);
        kex.group_exchange = Some(GroupExchangeParams {
            min,
            preferred,
            max,
            group,
        });
        Ok(())
    }

    /// Server: the client's public value arrived.
    fn on_init(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        let host_key_name = kex.negotiated()?.host_key.clone();
        let host_key = self
            .config
            .host_keys
            .as_ref()
            .and_then(|provider| provider.host_key(&host_key_name))
            .ok_or_else(|| {
                HalyardError::Negotiation(format!("No host key for {}", host_key_name))
            })?;

        let exchange = kex.exchange()?;
        let format = exchange.value_format();
        let mut r = WireReader::new(&payload[1..]);
        let client_value = read_value(&mut r, format)?.to_vec();
        exchange.consume_peer_value(&client_value)?;
        let server_value = exchange.initiate()?;
        let shared_secret = exchange.compute_shared_secret()?;
        let hash = exchange.hash();

        let host_key_blob = host_key.public_key_blob();
        let exchange_hash = self.exchange_hash(
            kex,
            &host_key_blob,
            &client_value,
            &server_value,
            &shared_secret,
        )?;
        let signature = host_key.sign(&exchange_hash)?;

        let reply = if kex.group_exchange.is_some() {
            MessageType::KexDhGexReply
        } else {
            MessageType::KexdhReply
        };
        let mut buf = BytesMut::new();
        buf.put_u8(reply as u8);
        wire::write_bytes(&mut buf, &host_key_blob);
        write_value(&mut buf, format, &server_value);
        wire::write_bytes(&mut buf, &signature);
        self.write_packet(&buf)?;

        self.install_keys(kex, hash, &shared_secret, &exchange_hash)?;
        self.send_newkeys(kex)
    }

    /// Client: the server's reply arrived.
    fn on_reply(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        let host_key_name = kex.negotiated()?.host_key.clone();
        let exchange = kex.exchange()?;
        let format = exchange.value_format();
        let mut r = WireReader::new(&payload[1..]);
        let host_key_blob = r.read_bytes()?.to_vec();
        let server_value = read_value(&mut r, format)?.to_vec();
        let signature = r.read_bytes()?.to_vec();

        exchange.consume_peer_value(&server_value)?;
        let shared_secret = exchange.compute_shared_secret()?;
        let hash = exchange.hash();
        let client_value = kex.client_value.clone();
        let exchange_hash = self.exchange_hash(
            kex,
            &host_key_blob,
            &client_value,
            &server_value,
            &shared_secret,
        )?;

        let verifier = self.config.registry.host_keys.require(&host_key_name)?;
        match verifier.verify(&host_key_blob, &exchange_hash, &signature) {
            Ok(true) => {}
            Ok(false) => {
                return Err(HalyardError::Security(
                    "host key signature verification failed".to_string(),
                ))
            }
            Err(e) => {
                return Err(HalyardError::Security(format!(
                    "host key signature invalid: {}",
                    e
                )))
            }
        }
        if !self
            .config
            .host_key_verifier
            .verify(&host_key_name, &host_key_blob)
        {
            return Err(HalyardError::Security(
                "host key not verifiable: rejected by verifier".to_string(),
            ));
        }
        tracing::debug!(algorithm = %host_key_name, "server host key accepted");

        self.install_keys(kex, hash, &shared_secret, &exchange_hash)?;
        self.send_newkeys(kex)
    }

    fn exchange_hash(
        &self,
        kex: &KexState,
        host_key: &[u8],
        client_value: &[u8],
        server_value: &[u8],
        shared_secret: &SharedSecret,
    ) -> HalyardResult<Vec<u8>> {
        let peer_version = self
            .peer_version
            .as_ref()
            .ok_or_else(|| HalyardError::Protocol("Peer identification missing".to_string()))?;
        let peer_kexinit = kex
            .peer_kexinit
            .as_deref()
            .ok_or_else(|| HalyardError::Protocol("Peer KEXINIT missing".to_string()))?;
        let local_version = self.config.version.as_str();

        let (client_version, server_version, client_kexinit, server_kexinit) =
            match self.config.role {
                Role::Client => (
                    local_version,
                    peer_version.as_str(),
                    kex.local_kexinit.as_slice(),
                    peer_kexinit,
                ),
                Role::Server => (
                    peer_version.as_str(),
                    local_version,
                    peer_kexinit,
                    kex.local_kexinit.as_slice(),
                ),
            };

        let transcript = ExchangeTranscript {
            client_version,
            server_version,
            client_kexinit,
            server_kexinit,
            host_key,
            group_exchange: kex.group_exchange.as_ref(),
            client_value,
            server_value,
            shared_secret,
        };
        let exchange = kex
            .exchange
            .as_ref()
            .ok_or_else(|| HalyardError::Protocol("Key exchange not started".to_string()))?;
        exchange.compute_exchange_hash(&transcript)
    }

    fn install_keys(
        &mut self,
        kex: &mut KexState,
        hash: KexHash,
        shared_secret: &SharedSecret,
        exchange_hash: &[u8],
    ) -> HalyardResult<()> {
        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.to_vec())
            .clone();
        let negotiated = kex.negotiated()?;
        let registry = &self.config.registry;

        let cipher_c2s = registry.ciphers.require(&negotiated.cipher_client_to_server)?;
        let cipher_s2c = registry.ciphers.require(&negotiated.cipher_server_to_client)?;
        let mac_c2s = registry.macs.require(&negotiated.mac_client_to_server)?;
        let mac_s2c = registry.macs.require(&negotiated.mac_server_to_client)?;
        let comp_c2s = registry
            .compression
            .require(&negotiated.compression_client_to_server)?;
        let comp_s2c = registry
            .compression
            .require(&negotiated.compression_server_to_client)?;

        let keys = SessionKeys::derive(
            hash,
            shared_secret,
            exchange_hash,
            &session_id,
            KeyLengths {
                iv: cipher_c2s.iv_len(),
                enc: cipher_c2s.key_len(),
                mac: mac_c2s.key_len(),
            },
            KeyLengths {
                iv: cipher_s2c.iv_len(),
                enc: cipher_s2c.key_len(),
                mac: mac_s2c.key_len(),
            },
        );

        let build = |keys: &DirectionKeys,
                     cipher: &Arc<dyn CipherFactory>,
                     mac: &Arc<dyn MacFactory>,
                     compression: &Arc<dyn CompressionFactory>|
         -> HalyardResult<DirectionCrypto> {
            Ok(DirectionCrypto {
                cipher: cipher.create(&keys.enc_key, &keys.iv)?,
                mac: mac.create(&keys.mac_key)?,
                compression: compression.create(),
            })
        };
        let c2s = build(&keys.client_to_server, &cipher_c2s, &mac_c2s, &comp_c2s)?;
        let s2c = build(&keys.server_to_client, &cipher_s2c, &mac_s2c, &comp_s2c)?;

        let (outbound, inbound) = match self.config.role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        kex.pending_outbound = Some(outbound);
        kex.pending_inbound = Some(inbound);
        kex.exchange = None;
        Ok(())
    }

    fn send_newkeys(&mut self, kex: &mut KexState) -> HalyardResult<()> {
        self.write_packet(&NewKeys::new().to_bytes())?;
        let outbound = kex
            .pending_outbound
            .take()
            .ok_or_else(|| HalyardError::Protocol("Outbound keys not derived".to_string()))?;
        self.codec.set_outbound(outbound);
        kex.sent_newkeys = true;
        kex.step = KexStep::AwaitNewKeys;
        if self.state == State::Exchanging {
            self.transition(State::KeysEstablished)?;
        }

        while let Some(payload) = self.queued.pop_front() {
            self.write_packet(&payload)?;
        }
        Ok(())
    }

    fn on_newkeys(&mut self, kex: &mut KexState, payload: &[u8]) -> HalyardResult<()> {
        NewKeys::from_bytes(payload)?;
        if kex.received_newkeys {
            return Err(HalyardError::Protocol("Duplicate NEWKEYS".to_string()));
        }
        let inbound = kex.pending_inbound.take().ok_or_else(|| {
            HalyardError::Protocol("NEWKEYS received before key exchange completed".to_string())
        })?;
        self.codec.set_inbound(inbound);
        kex.received_newkeys = true;
        Ok(())
    }

    fn complete_kex(&mut self, mut kex: KexState, now: Instant) -> HalyardResult<()> {
        let algorithms = kex
            .negotiated
            .take()
            .ok_or_else(|| HalyardError::Protocol("Key exchange not negotiated".to_string()))?;
        self.counters = RekeyCounters::new(now);
        self.transition(State::Operational)?;

        if self.established {
            tracing::info!(kex = %algorithms.kex, "rekey complete");
            self.events.push_back(TransportEvent::Rekeyed {
                algorithms: algorithms.clone(),
            });
        } else {
            self.established = true;
            tracing::debug!(kex = %algorithms.kex, "transport established");
            self.events.push_back(TransportEvent::Established {
                session_id: self.session_id.clone().unwrap_or_default(),
                algorithms: algorithms.clone(),
            });
        }
        self.negotiated = Some(algorithms);
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.config.role)
            .field("state", &self.state)
            .field("exchanging", &self.kex.is_some())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

fn write_value(buf: &mut BytesMut, format: ValueFormat, value: &[u8]) {
    match format {
        ValueFormat::Mpint => wire::write_mpint(buf, value),
        ValueFormat::String => wire::write_bytes(buf, value),
    }
}

fn read_value<'a>(reader: &mut WireReader<'a>, format: ValueFormat) -> HalyardResult<&'a [u8]> {
    match format {
        ValueFormat::Mpint => reader.read_mpint(),
        ValueFormat::String => reader.read_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::hostkey::{Ed25519HostKey, PinnedHostKeys, StaticHostKeys};
    use crate::ssh::kex::{Curve25519Factory, KexFactory};
    use std::sync::Mutex;

    fn host_keys() -> Arc<StaticHostKeys> {
        Arc::new(StaticHostKeys::new().with_key(Arc::new(Ed25519HostKey::generate().unwrap())))
    }

    fn pair(client: TransportConfig, server: TransportConfig, now: Instant) -> (Transport, Transport) {
        (
            Transport::new(client, now).unwrap(),
            Transport::new(server, now).unwrap(),
        )
    }

    fn pump(a: &mut Transport, b: &mut Transport, now: Instant) -> HalyardResult<()> {
        loop {
            let mut moved = false;
            if let Some(bytes) = a.take_outbound() {
                b.feed(&bytes, now)?;
                moved = true;
            }
            if let Some(bytes) = b.take_outbound() {
                a.feed(&bytes, now)?;
                moved = true;
            }
            if !moved {
                return Ok(());
            }
        }
    }

    fn events(t: &mut Transport) -> Vec<TransportEvent> {
        std::iter::from_fn(|| t.poll_event()).collect()
    }

    #[test]
    fn test_state_transitions() {
        let mut t = Transport::new(TransportConfig::client(), Instant::now()).unwrap();
        assert!(t.transition(State::Operational).is_err());
        t.transition(State::IdentExchanged).unwrap();
        assert!(matches!(
            t.transition(State::Rekeying),
            Err(HalyardError::Protocol(msg)) if msg.contains("Invalid state transition")
        ));
        t.transition(State::Closing).unwrap();
        t.transition(State::Closed).unwrap();
        assert!(t.transition(State::Closing).is_err());
    }

    #[test]
    fn test_server_requires_host_keys() {
        let config = TransportConfig::new(Role::Server);
        assert!(matches!(
            Transport::new(config, Instant::now()),
            Err(HalyardError::Config(_))
        ));
    }

    #[test]
    fn test_identification_sent_first() {
        let mut t = Transport::new(TransportConfig::client(), Instant::now()).unwrap();
        let out = t.take_outbound().unwrap();
        assert!(out.starts_with(b"SSH-2.0-Halyard_"));
        assert!(out.ends_with(b"\r\n"));
    }

    #[test]
    fn test_handshake_default_algorithms() {
        let now = Instant::now();
        let (mut client, mut server) =
            pair(TransportConfig::client(), TransportConfig::server(host_keys()), now);
        pump(&mut client, &mut server, now).unwrap();

        assert_eq!(client.state(), State::Operational);
        assert_eq!(server.state(), State::Operational);
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.negotiated().unwrap().kex, "curve25519-sha256");

        let ce = events(&mut client);
        assert!(matches!(&ce[..], [TransportEvent::Established { .. }]));
        assert!(matches!(&events(&mut server)[..], [TransportEvent::Established { .. }]));
    }

    #[test]
    fn test_handshake_every_builtin_kex() {
        for kex in AlgorithmRegistry::global().kex.supported_names() {
            let now = Instant::now();
            let mut client = TransportConfig::client();
            client.proposal.kex = vec![kex.clone()];
            let (mut c, mut s) = pair(client, TransportConfig::server(host_keys()), now);
            pump(&mut c, &mut s, now).unwrap();
            assert!(c.is_established(), "{} failed", kex);
            assert_eq!(c.negotiated().unwrap().kex, kex);
            assert_eq!(c.session_id(), s.session_id());
        }
    }

    #[test]
    fn test_payload_delivery() {
        let now = Instant::now();
        let (mut client, mut server) =
            pair(TransportConfig::client(), TransportConfig::server(host_keys()), now);
        client.send_payload(&[90, 1, 2, 3], now).unwrap();
        pump(&mut client, &mut server, now).unwrap();

        let received: Vec<_> = events(&mut server)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Payload { payload, .. } => Some(payload),
                _ => None,
            })
            .collect();
        assert_eq!(received, vec![vec![90, 1, 2, 3]]);
    }

    #[test]
    fn test_kex_messages_rejected_from_upper_layers() {
        let now = Instant::now();
        let mut t = Transport::new(TransportConfig::client(), now).unwrap();
        assert!(t.send_payload(&[30, 0], now).is_err());
        assert!(t.send_payload(&[], now).is_err());
    }

    #[test]
    fn test_negotiation_failure() {
        let now = Instant::now();
        let mut client = TransportConfig::client();
        client.proposal.ciphers = vec!["aes256-ctr".to_string()];
        let mut server = TransportConfig::server(host_keys());
        server.proposal.ciphers = vec!["aes128-ctr".to_string()];
        let (mut c, mut s) = pair(client, server, now);

        let err = pump(&mut c, &mut s, now).unwrap_err();
        assert!(matches!(err, HalyardError::Negotiation(_)));
        assert!(c.is_closed() || s.is_closed());
    }

    #[test]
    fn test_host_key_rejected() {
        let now = Instant::now();
        let mut client = TransportConfig::client();
        client.host_key_verifier = Arc::new(PinnedHostKeys::new().pin(vec![1, 2, 3]));
        let (mut c, mut s) = pair(client, TransportConfig::server(host_keys()), now);

        let err = pump(&mut c, &mut s, now).unwrap_err();
        match &err {
            HalyardError::Security(msg) => assert!(msg.contains("host key")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.disconnect_reason(), DisconnectReason::HostKeyNotVerifiable);
        assert!(c.is_closed());
    }

    #[test]
    fn test_payloads_queued_during_rekey() {
        let now = Instant::now();
        let (mut c, mut s) =
            pair(TransportConfig::client(), TransportConfig::server(host_keys()), now);
        pump(&mut c, &mut s, now).unwrap();
        let first_session = c.session_id().map(<[u8]>::to_vec);

        c.request_rekey(now).unwrap();
        assert_eq!(c.state(), State::Rekeying);
        c.send_payload(&[94, 7], now).unwrap();
        c.request_rekey(now).unwrap();
        pump(&mut c, &mut s, now).unwrap();

        assert_eq!(c.state(), State::Operational);
        assert_eq!(c.session_id().map(<[u8]>::to_vec), first_session);
        let rekeys = events(&mut c)
            .iter()
            .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
            .count();
        assert_eq!(rekeys, 1);
        assert!(events(&mut s).iter().any(|e| matches!(
            e,
            TransportEvent::Payload { payload, .. } if payload == &vec![94, 7]
        )));
    }

    #[test]
    fn test_rekey_once_per_packet_threshold() {
        let now = Instant::now();
        let mut client = TransportConfig::client();
        client.rekey_limits = RekeyLimits {
            packets: Some(20),
            ..RekeyLimits::unlimited()
        };
        let mut server = TransportConfig::server(host_keys());
        server.rekey_limits = RekeyLimits::unlimited();
        let (mut c, mut s) = pair(client, server, now);
        pump(&mut c, &mut s, now).unwrap();
        events(&mut c);

        for i in 0..30u8 {
            c.send_payload(&[94, i], now).unwrap();
        }
        pump(&mut c, &mut s, now).unwrap();

        let rekeys = events(&mut c)
            .iter()
            .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
            .count();
        assert_eq!(rekeys, 1);
        let delivered: Vec<u8> = events(&mut s)
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Payload { payload, .. } => Some(payload[1]),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, (0..30u8).collect::<Vec<_>>());
    }

    fn bulk(tag: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 1002];
        payload[0] = 94;
        payload[1] = tag;
        payload
    }

    #[test]
    fn test_rekey_once_per_byte_threshold_counting_both_directions() {
        let now = Instant::now();
        let mut client = TransportConfig::client();
        client.rekey_limits = RekeyLimits {
            bytes: Some(4096),
            ..RekeyLimits::unlimited()
        };
        let mut server = TransportConfig::server(host_keys());
        server.rekey_limits = RekeyLimits::unlimited();
        let (mut c, mut s) = pair(client, server, now);
        pump(&mut c, &mut s, now).unwrap();
        events(&mut c);
        events(&mut s);
        let first_session = c.session_id().map(<[u8]>::to_vec);

        // Outbound traffic alone stays under the limit.
        for i in 0..2u8 {
            c.send_payload(&bulk(i), now).unwrap();
        }
        pump(&mut c, &mut s, now).unwrap();
        let sent = c.counters().bytes;
        assert!(sent >= 2000 && sent < 4096, "sent {}", sent);
        assert!(!c.is_exchanging());

        // Inbound traffic pushes the combined count over it.
        for i in 0..2u8 {
            s.send_payload(&bulk(i), now).unwrap();
        }
        let inbound = s.take_outbound().unwrap();
        c.feed(&inbound, now).unwrap();
        assert!(c.counters().bytes >= 4096);
        assert!(c.is_exchanging());
        pump(&mut c, &mut s, now).unwrap();

        assert_eq!(c.state(), State::Operational);
        assert!(c.counters().bytes < 4096);
        assert_eq!(c.session_id().map(<[u8]>::to_vec), first_session);
        let client_events = events(&mut c);
        let rekeys = client_events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
            .count();
        assert_eq!(rekeys, 1);
        let delivered: Vec<u8> = client_events
            .into_iter()
            .filter_map(|e| match e {
                TransportEvent::Payload { payload, .. } => Some(payload[1]),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![0, 1]);

        // The responder saw a single KEXINIT.
        let server_rekeys = events(&mut s)
            .iter()
            .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
            .count();
        assert_eq!(server_rekeys, 1);
    }

    #[test]
    fn test_rekey_on_interval() {
        let now = Instant::now();
        let mut client = TransportConfig::client();
        client.rekey_limits = RekeyLimits {
            interval: Some(Duration::from_secs(60)),
            ..RekeyLimits::unlimited()
        };
        let mut server = TransportConfig::server(host_keys());
        server.rekey_limits = RekeyLimits::unlimited();
        let (mut c, mut s) = pair(client, server, now);
        pump(&mut c, &mut s, now).unwrap();
        assert_eq!(c.next_deadline(), Some(now + Duration::from_secs(60)));

        let later = now + Duration::from_secs(61);
        c.poll_timers(later).unwrap();
        c.poll_timers(later).unwrap();
        pump(&mut c, &mut s, later).unwrap();
        c.poll_timers(later + Duration::from_secs(1)).unwrap();
        assert!(!c.is_exchanging());

        let rekeys = events(&mut c)
            .iter()
            .filter(|e| matches!(e, TransportEvent::Rekeyed { .. }))
            .count();
        assert_eq!(rekeys, 1);
    }

    #[test]
    fn test_kex_timeout() {
        let now = Instant::now();
        let mut c = Transport::new(TransportConfig::client(), now).unwrap();
        c.feed(b"SSH-2.0-Silent\r\n", now).unwrap();
        assert_eq!(c.state(), State::Negotiating);
        c.poll_timers(now + Duration::from_secs(30)).unwrap();
        assert!(matches!(
            c.poll_timers(now + Duration::from_secs(61)),
            Err(HalyardError::Timeout(_))
        ));
        assert!(c.is_closed());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u32>>);

    impl ReservedMessageHandler for Recorder {
        fn unimplemented(&self, sequence: u32) {
            self.0.lock().unwrap().push(sequence);
        }
    }

    #[test]
    fn test_unknown_transport_message_answered() {
        let now = Instant::now();
        let recorder = Arc::new(Recorder::default());
        let mut client = TransportConfig::client();
        client.reserved_handler = recorder.clone();
        let (mut c, mut s) = pair(client, TransportConfig::server(host_keys()), now);
        pump(&mut c, &mut s, now).unwrap();

        // KEXINIT, KEX_ECDH_INIT, NEWKEYS came first
        c.send_payload(&[15, 0], now).unwrap();
        pump(&mut c, &mut s, now).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![3]);
        assert_eq!(s.state(), State::Operational);
    }

    #[test]
    fn test_peer_disconnect() {
        let now = Instant::now();
        let (mut c, mut s) =
            pair(TransportConfig::client(), TransportConfig::server(host_keys()), now);
        pump(&mut c, &mut s, now).unwrap();
        events(&mut s);

        c.disconnect(DisconnectReason::ByApplication, "bye");
        c.disconnect(DisconnectReason::ByApplication, "again");
        assert!(c.is_closed());
        pump(&mut c, &mut s, now).unwrap();

        assert_eq!(
            events(&mut s),
            vec![TransportEvent::Disconnected {
                reason: 11,
                description: "bye".to_string()
            }]
        );
        assert!(s.is_closed());
        assert!(c.send_payload(&[90], now).is_err());
    }

    #[test]
    fn test_wrong_guess_packet_ignored() {
        let now = Instant::now();
        let mut server = TransportConfig::server(host_keys());
        server.proposal.kex = vec!["curve25519-sha256".to_string()];
        let mut s = Transport::new(server, now).unwrap();
        let server_ident = s.take_outbound().unwrap();
        assert!(server_ident.starts_with(b"SSH-2.0-"));

        let mut proposal = AlgorithmProposal::from_registry(&AlgorithmRegistry::new());
        proposal.kex = vec![
            "ecdh-sha2-nistp256".to_string(),
            "curve25519-sha256".to_string(),
        ];
        let mut init = KexInit::from_proposal(&proposal);
        init.first_kex_packet_follows = true;

        let mut codec = PacketCodec::new();
        let mut inbound = b"SSH-2.0-Guesser\r\n".to_vec();
        inbound.extend(codec.seal(&init.to_bytes()).unwrap());
        // guessed ecdh-sha2-nistp256 packet
        inbound.extend(codec.seal(&[30, 0, 0, 0, 1, 4]).unwrap());

        let mut exchange = Curve25519Factory.create(&[]).unwrap();
        let q_c = exchange.initiate().unwrap();
        let mut buf = BytesMut::new();
        buf.put_u8(30);
        wire::write_bytes(&mut buf, &q_c);
        inbound.extend(codec.seal(&buf).unwrap());

        s.feed(&inbound, now).unwrap();
        assert_eq!(s.state(), State::KeysEstablished);

        let mut out = BytesMut::from(&s.take_outbound().unwrap()[..]);
        let numbers: Vec<u8> = std::iter::from_fn(|| codec.open(&mut out).unwrap())
            .map(|(_, payload)| payload[0])
            .collect();
        assert_eq!(numbers, vec![20, 31, 21]);
    }
}
