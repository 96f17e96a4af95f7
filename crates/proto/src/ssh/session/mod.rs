//! Tokio runtime binding.
//!
//! A session runs on a single task that owns the byte stream, the
//! [`Transport`] and the [`Connection`]; all framing, decryption and
//! dispatch happen there. Applications talk to it through a clonable
//! [`SessionHandle`] and one [`ChannelHandle`] per channel.
//!
//! Handlers and listeners run on the session task and must not block.
//!
//! # Example
//!
//! ```rust,no_run
//! use halyard_proto::ssh::session::{connect, SessionConfig};
//!
//! # async fn example() -> halyard_platform::HalyardResult<()> {
//! let session = connect("127.0.0.1:22", SessionConfig::client()).await?;
//! let mut channel = session.open_channel("session", &[]).await?;
//! channel.request("exec", true, b"\x00\x00\x00\x06uptime").await?;
//! let first = channel.read().await;
//! println!("{:?}", first);
//! session.disconnect("done");
//! # Ok(())
//! # }
//! ```

mod driver;
mod handle;

pub use handle::{ChannelHandle, SessionHandle};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use halyard_platform::{HalyardError, HalyardResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ssh::attributes::Attributes;
use crate::ssh::connection::{Connection, ConnectionConfig, ConnectionHandlers};
use crate::ssh::hostkey::HostKeyProvider;
use crate::ssh::listener::{ChannelListener, ListenerSet, SessionListener};
use crate::ssh::transport::{Role, Transport, TransportConfig};

use driver::Driver;
use handle::CloseCause;

/// Everything needed to run sessions.
///
/// Listeners registered here are shared by every session started from this
/// configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// Transport settings (role, identification, algorithms, rekey limits,
    /// key exchange timeout, host keys, host key verifier, registry).
    pub transport: TransportConfig,
    /// Channel multiplexer settings.
    pub connection: ConnectionConfig,
    /// Request handlers and channel acceptors.
    pub handlers: ConnectionHandlers,
    /// TCP connect timeout used by [`connect`].
    pub connect_timeout: Duration,
    /// Limit applied by [`SessionHandle::authenticate`].
    pub auth_timeout: Duration,
    /// Interval between SSH_MSG_IGNORE keepalives, if any.
    pub keepalive_interval: Option<Duration>,
    /// Session listeners of the configuration scope.
    pub session_listeners: ListenerSet<dyn SessionListener>,
    /// Channel listeners of the configuration scope.
    pub channel_listeners: ListenerSet<dyn ChannelListener>,
}

impl SessionConfig {
    /// Configuration for `transport`.
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            connection: ConnectionConfig::default(),
            handlers: ConnectionHandlers::default(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(120),
            keepalive_interval: None,
            session_listeners: ListenerSet::new(),
            channel_listeners: ListenerSet::new(),
        }
    }

    /// Client configuration with the global registry.
    pub fn client() -> Self {
        Self::new(TransportConfig::client())
    }

    /// Server configuration serving `host_keys`.
    pub fn server(host_keys: Arc<dyn HostKeyProvider>) -> Self {
        Self::new(TransportConfig::server(host_keys))
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("transport", &self.transport)
            .field("connection", &self.connection)
            .field("handlers", &self.handlers)
            .field("connect_timeout", &self.connect_timeout)
            .field("auth_timeout", &self.auth_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

/// Session builder: a configuration plus session-scoped listeners and
/// attributes.
pub struct SshSession {
    config: SessionConfig,
    session_listeners: ListenerSet<dyn SessionListener>,
    channel_listeners: ListenerSet<dyn ChannelListener>,
    attributes: Arc<Attributes>,
}

impl SshSession {
    /// Builder over `config` with empty session-scoped listeners.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session_listeners: ListenerSet::new(),
            channel_listeners: ListenerSet::new(),
            attributes: Arc::new(Attributes::new()),
        }
    }

    /// Adds a listener for this session only.
    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.session_listeners.add(listener);
        self
    }

    /// Adds a listener for every channel of this session.
    pub fn with_channel_listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.channel_listeners.add(listener);
        self
    }

    /// Session attributes, also visible to global request handlers.
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    /// Runs a client session over `stream`.
    pub async fn client<S>(stream: S, mut config: SessionConfig) -> HalyardResult<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.transport.role = Role::Client;
        Self::new(config).start(stream).await
    }

    /// Runs a server session over `stream`.
    pub async fn server<S>(stream: S, mut config: SessionConfig) -> HalyardResult<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.transport.role = Role::Server;
        Self::new(config).start(stream).await
    }

    /// Spawns the session task and waits for the first key exchange.
    ///
    /// # Errors
    ///
    /// Whatever ended the handshake: `Timeout` when it did not finish within
    /// the key exchange timeout, `Negotiation`, `Security`, `Protocol` or
    /// `Io` otherwise.
    pub async fn start<S>(self, stream: S) -> HalyardResult<SessionHandle>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let SshSession {
            config,
            session_listeners,
            channel_listeners,
            attributes,
        } = self;

        let now = tokio::time::Instant::now().into_std();
        let transport = Transport::new(config.transport.clone(), now)?;
        let mut connection = Connection::new(config.connection.clone(), config.handlers.clone())?
            .with_attributes(attributes.clone());
        connection.set_listeners(config.channel_listeners.chain(&channel_listeners));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let cause = Arc::new(CloseCause::default());

        let driver = Driver {
            transport,
            connection,
            commands: command_rx,
            command_sender: command_tx.downgrade(),
            incoming: incoming_tx,
            auth_messages: auth_tx,
            ready: Some(ready_tx),
            listeners: config.session_listeners.chain(&session_listeners),
            keepalive: config.keepalive_interval,
            closed: closed_tx,
            cause: cause.clone(),
            channels: HashMap::new(),
            pending_opens: HashMap::new(),
            pending_requests: HashMap::new(),
        };
        tracing::debug!(role = ?config.transport.role, "starting session");
        tokio::spawn(driver.run(stream));

        let established = ready_rx.await.map_err(|_| {
            cause.get().unwrap_or_else(|| {
                HalyardError::Protocol("Session ended during handshake".to_string())
            })
        })??;

        Ok(SessionHandle::new(
            command_tx,
            incoming_rx,
            auth_rx,
            closed_rx,
            cause,
            established,
            config.auth_timeout,
            attributes,
        ))
    }
}

/// Connects over TCP and runs a client session.
///
/// # Errors
///
/// Returns [`HalyardError::Timeout`] when the TCP connection is not
/// established within `config.connect_timeout`.
pub async fn connect<A: ToSocketAddrs>(addr: A, config: SessionConfig) -> HalyardResult<SessionHandle> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            HalyardError::Timeout(format!(
                "Connection not established within {:?}",
                config.connect_timeout
            ))
        })??;
    stream.set_nodelay(true)?;
    SshSession::client(stream, config).await
}
