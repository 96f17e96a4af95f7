//! The session task: one loop owning the stream, the transport and the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use halyard_platform::{DisconnectReason, HalyardError, HalyardResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::handle::{is_auth_message, ChannelHandle, CloseCause, Command, Established, Responder};
use crate::ssh::channel::ChannelMessage;
use crate::ssh::connection::{Connection, ConnectionEvent};
use crate::ssh::listener::{ListenerSet, SessionListener};
use crate::ssh::message::Ignore;
use crate::ssh::request::{Reply, RequestId};
use crate::ssh::transport::{Transport, TransportEvent};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Bound on the final write after the loop ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct Driver {
    pub transport: Transport,
    pub connection: Connection,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub command_sender: mpsc::WeakUnboundedSender<Command>,
    pub incoming: mpsc::UnboundedSender<ChannelHandle>,
    pub auth_messages: mpsc::UnboundedSender<Vec<u8>>,
    pub ready: Option<oneshot::Sender<HalyardResult<Established>>>,
    pub listeners: ListenerSet<dyn SessionListener>,
    pub keepalive: Option<Duration>,
    pub closed: watch::Sender<bool>,
    pub cause: Arc<CloseCause>,

    pub channels: HashMap<u32, mpsc::UnboundedSender<ChannelMessage>>,
    pub pending_opens: HashMap<u32, Responder<ChannelHandle>>,
    pub pending_requests: HashMap<RequestId, Responder<Option<Reply>>>,
}

enum Wake {
    Wrote(std::io::Result<usize>),
    Read(std::io::Result<usize>),
    Command(Option<Command>),
    Timer,
}

impl Driver {
    pub(crate) async fn run<S>(mut self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut pending = BytesMut::new();
        let mut next_keepalive = self.keepalive.map(|interval| now() + interval);

        let result: HalyardResult<()> = loop {
            if let Err(e) = self.pump() {
                break Err(e);
            }
            self.collect_outbound(&mut pending);
            if self.transport.is_closed() {
                break Ok(());
            }

            let deadline = [self.transport.next_deadline(), next_keepalive]
                .into_iter()
                .flatten()
                .min();
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            // Reading continues while a write is pending.
            let wake = tokio::select! {
                written = writer.write(&pending), if !pending.is_empty() => Wake::Wrote(written),
                read = reader.read(&mut buf) => Wake::Read(read),
                command = self.commands.recv() => Wake::Command(command),
                _ = timer => Wake::Timer,
            };

            let step = match wake {
                Wake::Wrote(Ok(0)) => Err(HalyardError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "connection refused further writes",
                ))),
                Wake::Wrote(Ok(n)) => {
                    trace!(bytes = n, "wrote");
                    pending.advance(n);
                    if pending.is_empty() {
                        writer.flush().await.map_err(HalyardError::from)
                    } else {
                        Ok(())
                    }
                }
                Wake::Wrote(Err(e)) => Err(e.into()),
                Wake::Read(Ok(0)) => Err(HalyardError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))),
                Wake::Read(Ok(n)) => {
                    trace!(bytes = n, "read");
                    self.transport.feed(&buf[..n], now())
                }
                Wake::Read(Err(e)) => Err(e.into()),
                Wake::Command(Some(command)) => self.on_command(command),
                Wake::Command(None) => {
                    debug!("all handles dropped");
                    self.transport
                        .disconnect(DisconnectReason::ByApplication, "session released");
                    Ok(())
                }
                Wake::Timer => {
                    let at = now();
                    if let Some(due) = next_keepalive.filter(|due| *due <= at) {
                        next_keepalive = self.keepalive.map(|interval| due.max(at) + interval);
                        self.send_keepalive(at);
                    }
                    self.transport.poll_timers(at)
                }
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.shutdown(result, pending, &mut writer).await;
    }

    fn send_keepalive(&mut self, at: Instant) {
        if !self.transport.is_established() {
            return;
        }
        trace!("keepalive");
        let payload = Ignore { data: Vec::new() }.to_bytes();
        if let Err(e) = self.transport.send_payload(&payload, at) {
            debug!(error = %e, "keepalive not sent");
        }
    }

    fn collect_outbound(&mut self, pending: &mut BytesMut) {
        while let Some(bytes) = self.transport.take_outbound() {
            pending.extend_from_slice(&bytes);
        }
    }

    /// Writes everything still queued; used once the loop has ended.
    async fn drain<W: AsyncWrite + Unpin>(
        &mut self,
        pending: &mut BytesMut,
        writer: &mut W,
    ) -> HalyardResult<()> {
        self.collect_outbound(pending);
        if !pending.is_empty() {
            writer.write_all(pending).await?;
            pending.clear();
        }
        writer.flush().await?;
        Ok(())
    }

    /// Moves payloads and events between the transport, the connection and
    /// the handles until nothing is left to do.
    fn pump(&mut self) -> HalyardResult<()> {
        loop {
            let mut progressed = false;
            while let Some(event) = self.transport.poll_event() {
                progressed = true;
                self.on_transport_event(event)?;
            }
            while let Some(payload) = self.connection.take_outbound() {
                progressed = true;
                self.transport.send_payload(&payload, now())?;
            }
            while let Some(event) = self.connection.poll_event() {
                progressed = true;
                self.on_connection_event(event);
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> HalyardResult<()> {
        match event {
            TransportEvent::Established {
                session_id,
                algorithms,
            } => {
                debug!(cipher = %algorithms.cipher_client_to_server, kex = %algorithms.kex, "session established");
                for listener in self.listeners.iter() {
                    listener.session_established(&session_id);
                }
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(Established {
                        session_id,
                        algorithms,
                    }));
                }
            }
            TransportEvent::Rekeyed { algorithms } => {
                info!(kex = %algorithms.kex, "session rekeyed");
                for listener in self.listeners.iter() {
                    listener.session_rekeyed();
                }
            }
            TransportEvent::Payload { sequence, payload } => {
                let number = crate::ssh::message::message_number(&payload)?;
                if is_auth_message(number) {
                    if self.auth_messages.send(payload).is_err() {
                        debug!(number, "authentication message dropped");
                    }
                } else if !self.connection.handle_payload(&payload)? {
                    debug!(number, sequence, "unimplemented message");
                    self.transport.send_unimplemented(sequence)?;
                }
            }
            TransportEvent::Disconnected {
                reason,
                description,
            } => {
                return Err(HalyardError::Disconnected {
                    code: reason,
                    description,
                });
            }
        }
        Ok(())
    }

    fn channel_handle(&mut self, id: u32) -> Option<ChannelHandle> {
        let commands = self.command_sender.upgrade()?;
        let channel_type = self
            .connection
            .channel(id)
            .map(|c| c.channel_type().to_string())
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(id, tx);
        Some(ChannelHandle::new(id, channel_type, commands, rx))
    }

    fn deliver(&mut self, id: u32, message: ChannelMessage) {
        let Some(tx) = self.channels.get(&id) else {
            return;
        };
        if tx.send(message).is_err() {
            trace!(channel = id, "channel handle gone");
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::ChannelOpened { channel } => {
                let handle = self.channel_handle(channel);
                match (self.pending_opens.remove(&channel), handle) {
                    (Some(reply), Some(handle)) => {
                        if let Err(Ok(handle)) = reply.send(Ok(handle)) {
                            handle.close();
                        }
                    }
                    _ => {
                        let _ = self.connection.close_channel(channel);
                    }
                }
            }
            ConnectionEvent::ChannelOpenFailed {
                channel,
                reason,
                description,
            } => {
                if let Some(reply) = self.pending_opens.remove(&channel) {
                    let error = if reason == 4 {
                        HalyardError::ResourceExhausted(description)
                    } else {
                        HalyardError::Unsupported(format!(
                            "channel open refused ({}): {}",
                            reason, description
                        ))
                    };
                    let _ = reply.send(Err(error));
                }
            }
            ConnectionEvent::ChannelAccepted { channel, .. } => match self.channel_handle(channel) {
                Some(handle) => {
                    if let Err(mpsc::error::SendError(handle)) = self.incoming.send(handle) {
                        debug!(channel, "no acceptor for incoming channel");
                        handle.close();
                    }
                }
                None => {
                    let _ = self.connection.close_channel(channel);
                }
            },
            ConnectionEvent::Data { channel, data } => {
                self.deliver(channel, ChannelMessage::Data(data))
            }
            ConnectionEvent::ExtendedData {
                channel,
                data_type,
                data,
            } => self.deliver(channel, ChannelMessage::ExtendedData { data_type, data }),
            ConnectionEvent::Eof { channel } => self.deliver(channel, ChannelMessage::Eof),
            ConnectionEvent::Closed { channel, error } => {
                if let Some(error) = &error {
                    debug!(channel, error = %error, "channel failed");
                }
                self.deliver(channel, ChannelMessage::Closed);
                self.channels.remove(&channel);
                if let Some(reply) = self.pending_opens.remove(&channel) {
                    let _ = reply.send(Err(error.unwrap_or(HalyardError::ChannelClosed(channel))));
                }
            }
            ConnectionEvent::RequestReply { id, reply } => {
                if let Some(responder) = self.pending_requests.remove(&id) {
                    let _ = responder.send(reply.map(Some));
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) -> HalyardResult<()> {
        let at = now();
        match command {
            Command::OpenChannel {
                channel_type,
                data,
                reply,
            } => match self.connection.open_channel(&channel_type, &data) {
                Ok(id) => {
                    self.pending_opens.insert(id, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::GlobalRequest {
                name,
                want_reply,
                data,
                reply,
            } => match self.connection.global_request(&name, want_reply, &data) {
                Ok(Some(id)) => {
                    self.pending_requests.insert(id, reply);
                }
                Ok(None) => {
                    let _ = reply.send(Ok(None));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::DeferredReply { token, reply, done } => {
                let result = match token.channel {
                    None => self.connection.send_global_reply(token, reply),
                    Some(_) => self.connection.send_channel_reply(token, reply),
                };
                let _ = done.send(result);
            }
            Command::SendMessage { payload, done } => {
                let result = self.transport.send_payload(&payload, at);
                let fatal = result.as_ref().err().map(HalyardError::duplicate);
                let _ = done.send(result);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            Command::Rekey { done } => {
                let result = self.transport.request_rekey(at);
                let fatal = result
                    .as_ref()
                    .err()
                    .filter(|_| self.transport.is_closed())
                    .map(HalyardError::duplicate);
                let _ = done.send(result);
                if let Some(e) = fatal {
                    return Err(e);
                }
            }
            Command::Disconnect {
                reason,
                description,
            } => {
                info!(description = %description, "disconnect requested");
                self.transport.disconnect(reason, &description);
            }
            Command::Write {
                channel,
                data_type,
                data,
                done,
            } => {
                let result = match data_type {
                    None => self.connection.send_data(channel, &data),
                    Some(t) => self.connection.send_extended_data(channel, t, &data),
                };
                let _ = done.send(result);
            }
            Command::Eof { channel, done } => {
                let _ = done.send(self.connection.send_eof(channel));
            }
            Command::ChannelRequest {
                channel,
                name,
                want_reply,
                data,
                reply,
            } => match self
                .connection
                .channel_request(channel, &name, want_reply, &data)
            {
                Ok(Some(id)) => {
                    self.pending_requests.insert(id, reply);
                }
                Ok(None) => {
                    let _ = reply.send(Ok(None));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::AddChannelListener { channel, listener } => {
                if let Err(e) = self.connection.add_channel_listener(channel, listener) {
                    debug!(channel, error = %e, "listener not added");
                }
            }
            Command::Consume { channel, bytes } => self.connection.consume(channel, bytes)?,
            Command::Close { channel } => {
                if let Err(e) = self.connection.close_channel(channel) {
                    debug!(channel, error = %e, "close ignored");
                }
            }
        }
        Ok(())
    }

    async fn shutdown<W: AsyncWrite + Unpin>(
        mut self,
        result: HalyardResult<()>,
        mut pending: BytesMut,
        writer: &mut W,
    ) {
        let error = result.err();
        match &error {
            Some(e) => {
                warn!(error = %e, "session failed");
                if !self.transport.is_closed() {
                    self.transport
                        .disconnect(e.disconnect_reason(), &e.to_string());
                }
            }
            None => debug!("session closed"),
        }
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, self.drain(&mut pending, writer)).await;
        if let Ok(Err(e)) = drained {
            debug!(error = %e, "final flush failed");
        }
        let _ = writer.shutdown().await;

        let cause = error.as_ref().map(HalyardError::duplicate).unwrap_or(
            HalyardError::Disconnected {
                code: DisconnectReason::ByApplication as u32,
                description: "session closed".to_string(),
            },
        );
        self.connection.fail_all(&cause);
        while let Some(event) = self.connection.poll_event() {
            self.on_connection_event(event);
        }
        for (_, reply) in self.pending_opens.drain() {
            let _ = reply.send(Err(cause.duplicate()));
        }
        for (_, reply) in self.pending_requests.drain() {
            let _ = reply.send(Err(cause.duplicate()));
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(cause.duplicate()));
        }
        self.channels.clear();

        for listener in self.listeners.iter() {
            listener.session_closed(error.as_ref());
        }
        self.cause.set(error);
        let _ = self.closed.send(true);
    }
}
