//! Handles to a running session and its channels.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use halyard_platform::{DisconnectReason, HalyardError, HalyardResult};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ssh::attributes::Attributes;
use crate::ssh::channel::ChannelMessage;
use crate::ssh::kex::NegotiatedAlgorithms;
use crate::ssh::listener::ChannelListener;
use crate::ssh::request::{Reply, ReplyToken};

pub(crate) type Responder<T> = oneshot::Sender<HalyardResult<T>>;

/// Work sent from handles to the session task.
pub(crate) enum Command {
    OpenChannel {
        channel_type: String,
        data: Vec<u8>,
        reply: Responder<ChannelHandle>,
    },
    GlobalRequest {
        name: String,
        want_reply: bool,
        data: Vec<u8>,
        reply: Responder<Option<Reply>>,
    },
    DeferredReply {
        token: ReplyToken,
        reply: Reply,
        done: Responder<()>,
    },
    SendMessage {
        payload: Vec<u8>,
        done: Responder<()>,
    },
    Rekey {
        done: Responder<()>,
    },
    Disconnect {
        reason: DisconnectReason,
        description: String,
    },
    Write {
        channel: u32,
        data_type: Option<u32>,
        data: Vec<u8>,
        done: Responder<()>,
    },
    Eof {
        channel: u32,
        done: Responder<()>,
    },
    ChannelRequest {
        channel: u32,
        name: String,
        want_reply: bool,
        data: Vec<u8>,
        reply: Responder<Option<Reply>>,
    },
    AddChannelListener {
        channel: u32,
        listener: Arc<dyn ChannelListener>,
    },
    Consume {
        channel: u32,
        bytes: u32,
    },
    Close {
        channel: u32,
    },
}

/// Shared end-of-session state.
#[derive(Debug, Default)]
pub(crate) struct CloseCause {
    error: Mutex<Option<HalyardError>>,
}

impl CloseCause {
    pub(crate) fn set(&self, error: Option<HalyardError>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    pub(crate) fn get(&self) -> Option<HalyardError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(HalyardError::duplicate)
    }
}

/// Result of the first key exchange.
#[derive(Debug, Clone)]
pub(crate) struct Established {
    pub session_id: Vec<u8>,
    pub algorithms: NegotiatedAlgorithms,
}

async fn call<T>(
    commands: &mpsc::UnboundedSender<Command>,
    closed: impl Fn() -> HalyardError,
    make: impl FnOnce(Responder<T>) -> Command,
) -> HalyardResult<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).map_err(|_| closed())?;
    rx.await.map_err(|_| closed())?
}

struct SessionShared {
    commands: mpsc::UnboundedSender<Command>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelHandle>>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Receiver<bool>,
    cause: Arc<CloseCause>,
    established: Established,
    auth_timeout: Duration,
    attributes: Arc<Attributes>,
}

/// Clonable handle to a running session.
///
/// Every operation is forwarded to the session task. Once the session ends,
/// operations fail with the cause that ended it.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        incoming: mpsc::UnboundedReceiver<ChannelHandle>,
        messages: mpsc::UnboundedReceiver<Vec<u8>>,
        closed: watch::Receiver<bool>,
        cause: Arc<CloseCause>,
        established: Established,
        auth_timeout: Duration,
        attributes: Arc<Attributes>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionShared {
                commands,
                incoming: tokio::sync::Mutex::new(incoming),
                messages: tokio::sync::Mutex::new(messages),
                closed,
                cause,
                established,
                auth_timeout,
                attributes,
            }),
        }
    }

    fn closed_error(&self) -> HalyardError {
        self.inner.cause.get().unwrap_or(HalyardError::Disconnected {
            code: DisconnectReason::ByApplication as u32,
            description: "session closed".to_string(),
        })
    }

    /// Session identifier (exchange hash of the first key exchange).
    pub fn session_id(&self) -> &[u8] {
        &self.inner.established.session_id
    }

    /// Algorithms negotiated by the first key exchange.
    pub fn algorithms(&self) -> &NegotiatedAlgorithms {
        &self.inner.established.algorithms
    }

    /// Session attributes.
    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.inner.attributes
    }

    /// Opens a channel and waits for the peer's answer.
    pub async fn open_channel(&self, channel_type: &str, data: &[u8]) -> HalyardResult<ChannelHandle> {
        call(&self.inner.commands, || self.closed_error(), |reply| Command::OpenChannel {
            channel_type: channel_type.to_string(),
            data: data.to_vec(),
            reply,
        })
        .await
    }

    /// Waits for the next channel opened by the peer.
    pub async fn accept_channel(&self) -> Option<ChannelHandle> {
        self.inner.incoming.lock().await.recv().await
    }

    /// Sends a global request; with `want_reply` waits for the peer's reply.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> HalyardResult<Option<Reply>> {
        call(&self.inner.commands, || self.closed_error(), |reply| Command::GlobalRequest {
            name: name.to_string(),
            want_reply,
            data: data.to_vec(),
            reply,
        })
        .await
    }

    /// Answers a global request a handler deferred.
    pub async fn send_global_reply(&self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        if token.channel.is_some() {
            return Err(HalyardError::Config(format!(
                "{:?} belongs to a channel request",
                token
            )));
        }
        self.deferred_reply(token, reply).await
    }

    /// Answers a channel request a handler deferred.
    pub async fn send_channel_reply(&self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        if token.channel.is_none() {
            return Err(HalyardError::Config(format!(
                "{:?} belongs to a global request",
                token
            )));
        }
        self.deferred_reply(token, reply).await
    }

    async fn deferred_reply(&self, token: ReplyToken, reply: Reply) -> HalyardResult<()> {
        call(&self.inner.commands, || self.closed_error(), |done| Command::DeferredReply {
            token,
            reply,
            done,
        })
        .await
    }

    /// Sends an authentication-layer message (numbers 5, 6 and 50 to 79).
    pub async fn send_message(&self, payload: &[u8]) -> HalyardResult<()> {
        let number = crate::ssh::message::message_number(payload)?;
        if !is_auth_message(number) {
            return Err(HalyardError::Protocol(format!(
                "Message {} does not belong to the authentication layer",
                number
            )));
        }
        call(&self.inner.commands, || self.closed_error(), |done| Command::SendMessage {
            payload: payload.to_vec(),
            done,
        })
        .await
    }

    /// Next authentication-layer message from the peer, or `None` once the
    /// session ended.
    pub async fn take_messages(&self) -> Option<Vec<u8>> {
        self.inner.messages.lock().await.recv().await
    }

    /// Runs an authentication exchange under the configured auth timeout.
    pub async fn authenticate<F, T>(&self, exchange: F) -> HalyardResult<T>
    where
        F: Future<Output = HalyardResult<T>>,
    {
        let limit = self.inner.auth_timeout;
        tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| {
                HalyardError::Timeout(format!("Authentication did not complete within {:?}", limit))
            })?
    }

    /// Starts a key exchange now.
    pub async fn request_rekey(&self) -> HalyardResult<()> {
        call(&self.inner.commands, || self.closed_error(), |done| Command::Rekey { done }).await
    }

    /// Disconnects by application. Idempotent.
    pub fn disconnect(&self, description: &str) {
        let _ = self.inner.commands.send(Command::Disconnect {
            reason: DisconnectReason::ByApplication,
            description: description.to_string(),
        });
    }

    /// Whether the session ended.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Waits for the session to end; returns the fatal cause, if any.
    pub async fn closed(&self) -> Option<HalyardError> {
        let mut closed = self.inner.closed.clone();
        let _ = closed.wait_for(|c| *c).await;
        self.inner.cause.get()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &hex::encode(&self.inner.established.session_id))
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn is_auth_message(number: u8) -> bool {
    matches!(number, 5 | 6 | 50..=79)
}

/// One channel as seen by its consumer.
///
/// Dropping the handle closes the channel.
pub struct ChannelHandle {
    id: u32,
    channel_type: String,
    commands: mpsc::UnboundedSender<Command>,
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    finished: bool,
}

impl ChannelHandle {
    pub(crate) fn new(
        id: u32,
        channel_type: String,
        commands: mpsc::UnboundedSender<Command>,
        messages: mpsc::UnboundedReceiver<ChannelMessage>,
    ) -> Self {
        Self {
            id,
            channel_type,
            commands,
            messages,
            finished: false,
        }
    }

    /// Local channel id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Next message. Data read here is reported as consumed, which lets the
    /// session grant the peer more window. After `Closed`, keeps returning
    /// `Closed`.
    pub async fn read(&mut self) -> ChannelMessage {
        if self.finished {
            return ChannelMessage::Closed;
        }
        let message = self.messages.recv().await.unwrap_or(ChannelMessage::Closed);
        match &message {
            ChannelMessage::Data(data) | ChannelMessage::ExtendedData { data, .. } => {
                let _ = self.commands.send(Command::Consume {
                    channel: self.id,
                    bytes: data.len() as u32,
                });
            }
            ChannelMessage::Closed => self.finished = true,
            ChannelMessage::Eof => {}
        }
        message
    }

    /// Writes data, buffered while the peer's window is exhausted.
    pub async fn write(&self, data: &[u8]) -> HalyardResult<()> {
        self.write_typed(None, data).await
    }

    /// Writes extended data (1 is stderr).
    pub async fn write_extended(&self, data_type: u32, data: &[u8]) -> HalyardResult<()> {
        self.write_typed(Some(data_type), data).await
    }

    async fn write_typed(&self, data_type: Option<u32>, data: &[u8]) -> HalyardResult<()> {
        let id = self.id;
        call(&self.commands, || HalyardError::ChannelClosed(id), |done| Command::Write {
            channel: id,
            data_type,
            data: data.to_vec(),
            done,
        })
        .await
    }

    /// Sends EOF after buffered data.
    pub async fn eof(&self) -> HalyardResult<()> {
        let id = self.id;
        call(&self.commands, || HalyardError::ChannelClosed(id), |done| Command::Eof {
            channel: id,
            done,
        })
        .await
    }

    /// Sends a channel request; with `want_reply` waits for the reply.
    pub async fn request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
    ) -> HalyardResult<Option<Reply>> {
        let id = self.id;
        call(&self.commands, || HalyardError::ChannelClosed(id), |reply| {
            Command::ChannelRequest {
                channel: id,
                name: name.to_string(),
                want_reply,
                data: data.to_vec(),
                reply,
            }
        })
        .await
    }

    /// Adds a listener for this channel only.
    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        let _ = self.commands.send(Command::AddChannelListener {
            channel: self.id,
            listener,
        });
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close { channel: self.id });
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.close();
        }
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .finish()
    }
}
