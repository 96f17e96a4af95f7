//! Per-channel bookkeeping: lifecycle, windows and buffered output.
//!
//! A [`Channel`] never does I/O. The [`Connection`](super::connection::Connection)
//! drives it and turns what it yields into channel messages.
//!
//! Both windows are `u32` and every update is checked: a peer that grows our
//! send window past `u32::MAX`, or sends more than the window it was
//! granted, is a protocol violation.

use std::collections::VecDeque;
use std::sync::Arc;

use halyard_platform::{HalyardError, HalyardResult};

use super::attributes::Attributes;
use super::listener::{ChannelListener, ListenerSet};
use super::request::{ChannelContext, Reply, RequestHandler, RequestId};

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// CHANNEL_OPEN sent, waiting for the peer's answer.
    Opening,
    /// Data flows both ways.
    Open,
    /// We sent EOF.
    LocalEof,
    /// The peer sent EOF.
    RemoteEof,
    /// CLOSE sent or received, or EOF in both directions.
    Closing,
    /// Gone from the connection.
    Closed,
}

/// What a channel consumer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Regular data.
    Data(Vec<u8>),
    /// Extended data (type 1 is stderr).
    ExtendedData {
        /// Data type code.
        data_type: u32,
        /// Bytes.
        data: Vec<u8>,
    },
    /// The peer sent EOF.
    Eof,
    /// The channel closed.
    Closed,
}

#[derive(Debug)]
struct Outgoing {
    data_type: Option<u32>,
    data: Vec<u8>,
    offset: usize,
}

/// One chunk ready to go out as CHANNEL_DATA or CHANNEL_EXTENDED_DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub data_type: Option<u32>,
    pub data: Vec<u8>,
}

/// State of one multiplexed channel.
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    channel_type: String,
    state: ChannelState,

    local_initial_window: u32,
    local_window: u32,
    local_max_packet: u32,
    consumed: u32,

    remote_window: u32,
    remote_max_packet: u32,

    outgoing: VecDeque<Outgoing>,
    eof_requested: bool,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,

    pub(crate) pending_requests: VecDeque<RequestId>,
    pub(crate) owed_replies: VecDeque<(u64, Option<Reply>)>,
    pub(crate) handlers: Vec<Arc<dyn RequestHandler<ChannelContext>>>,
    pub(crate) listeners: ListenerSet<dyn ChannelListener>,
    pub(crate) close_on_open: bool,
    attributes: Arc<Attributes>,
}

impl Channel {
    /// A channel we asked the peer to open.
    pub fn opening(local_id: u32, channel_type: &str, window: u32, max_packet: u32) -> Self {
        Self {
            local_id,
            remote_id: 0,
            channel_type: channel_type.to_string(),
            state: ChannelState::Opening,
            local_initial_window: window,
            local_window: window,
            local_max_packet: max_packet,
            consumed: 0,
            remote_window: 0,
            remote_max_packet: 0,
            outgoing: VecDeque::new(),
            eof_requested: false,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            pending_requests: VecDeque::new(),
            owed_replies: VecDeque::new(),
            handlers: Vec::new(),
            listeners: ListenerSet::new(),
            close_on_open: false,
            attributes: Arc::new(Attributes::new()),
        }
    }

    /// A channel the peer opened and we accepted.
    pub fn accepted(
        local_id: u32,
        channel_type: &str,
        window: u32,
        max_packet: u32,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> Self {
        let mut channel = Self::opening(local_id, channel_type, window, max_packet);
        channel.remote_id = remote_id;
        channel.remote_window = remote_window;
        channel.remote_max_packet = remote_max_packet;
        channel.state = ChannelState::Open;
        channel
    }

    /// Applies the peer's OPEN_CONFIRMATION.
    pub fn confirm(
        &mut self,
        remote_id: u32,
        remote_window: u32,
        remote_max_packet: u32,
    ) -> HalyardResult<()> {
        if self.state != ChannelState::Opening {
            return Err(HalyardError::Protocol(format!(
                "Open confirmation for channel {} in state {:?}",
                self.local_id, self.state
            )));
        }
        self.remote_id = remote_id;
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
        Ok(())
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bytes the peer may still send us.
    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    /// Bytes we may still send the peer.
    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    /// Bytes written but not yet sent.
    pub fn buffered(&self) -> usize {
        self.outgoing.iter().map(|o| o.data.len() - o.offset).sum()
    }

    pub fn attributes(&self) -> &Arc<Attributes> {
        &self.attributes
    }

    pub(crate) fn set_attributes(&mut self, attributes: Arc<Attributes>) {
        self.attributes = attributes;
    }

    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// Whether local writes are still allowed.
    pub fn is_writable(&self) -> bool {
        !self.eof_requested && !self.close_sent && !self.close_received
    }

    /// Accounts for `len` incoming bytes against the local window.
    pub fn receive(&mut self, len: usize) -> HalyardResult<()> {
        if self.eof_received {
            return Err(HalyardError::Protocol(format!(
                "Data on channel {} after EOF",
                self.local_id
            )));
        }
        if len > self.local_max_packet as usize {
            return Err(HalyardError::Protocol(format!(
                "Channel {} data of {} bytes exceeds maximum packet {}",
                self.local_id, len, self.local_max_packet
            )));
        }
        if len > self.local_window as usize {
            return Err(HalyardError::Protocol(format!(
                "Channel {} data of {} bytes exceeds window {}",
                self.local_id, len, self.local_window
            )));
        }
        self.local_window -= len as u32;
        Ok(())
    }

    /// Records that the consumer processed `n` received bytes.
    ///
    /// Returns the WINDOW_ADJUST amount once the unreported consumption
    /// reaches `threshold`.
    pub fn consume(&mut self, n: u32, threshold: u32) -> HalyardResult<Option<u32>> {
        let outstanding =
            u64::from(self.local_window) + u64::from(self.consumed) + u64::from(n);
        if outstanding > u64::from(self.local_initial_window) {
            return Err(HalyardError::Protocol(format!(
                "Channel {} consumed more than it received",
                self.local_id
            )));
        }
        self.consumed += n;
        if self.consumed < threshold.max(1) {
            return Ok(None);
        }
        let adjust = self.consumed;
        self.local_window += adjust;
        self.consumed = 0;
        Ok(Some(adjust))
    }

    /// Applies the peer's WINDOW_ADJUST.
    pub fn grow_remote(&mut self, bytes: u32) -> HalyardResult<u32> {
        self.remote_window = self.remote_window.checked_add(bytes).ok_or_else(|| {
            HalyardError::Protocol(format!(
                "Window adjust of {} overflows channel {} window {}",
                bytes, self.local_id, self.remote_window
            ))
        })?;
        Ok(self.remote_window)
    }

    /// Buffers data for sending.
    pub fn queue(&mut self, data_type: Option<u32>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.outgoing.push_back(Outgoing {
            data_type,
            data: data.to_vec(),
            offset: 0,
        });
    }

    /// Takes the next chunk the window and maximum packet allow.
    pub(crate) fn next_chunk(&mut self) -> Option<Chunk> {
        if self.state == ChannelState::Opening || self.close_sent || self.close_received {
            return None;
        }
        let limit = self.remote_window.min(self.remote_max_packet) as usize;
        if limit == 0 {
            return None;
        }
        let front = self.outgoing.front_mut()?;
        let size = (front.data.len() - front.offset).min(limit);
        let chunk = Chunk {
            data_type: front.data_type,
            data: front.data[front.offset..front.offset + size].to_vec(),
        };
        front.offset += size;
        if front.offset == front.data.len() {
            self.outgoing.pop_front();
        }
        self.remote_window -= size as u32;
        Some(chunk)
    }

    /// Asks for EOF once buffered data is out.
    pub fn request_eof(&mut self) {
        self.eof_requested = true;
    }

    /// Returns `true` exactly once, when EOF should be sent now.
    pub(crate) fn take_eof(&mut self) -> bool {
        if !self.eof_requested
            || self.eof_sent
            || !self.outgoing.is_empty()
            || self.state == ChannelState::Opening
            || self.close_sent
        {
            return false;
        }
        self.eof_sent = true;
        self.refresh_state();
        true
    }

    pub(crate) fn mark_eof_received(&mut self) {
        self.eof_received = true;
        self.refresh_state();
    }

    /// Whether both directions are done and CLOSE has not gone out.
    pub(crate) fn should_close(&self) -> bool {
        self.eof_sent && self.eof_received && !self.close_sent
    }

    pub(crate) fn mark_close_sent(&mut self) {
        self.close_sent = true;
        self.outgoing.clear();
        self.refresh_state();
    }

    pub(crate) fn mark_close_received(&mut self) {
        self.close_received = true;
        self.refresh_state();
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = ChannelState::Closed;
    }

    fn refresh_state(&mut self) {
        if self.state == ChannelState::Opening || self.state == ChannelState::Closed {
            return;
        }
        self.state = if self.close_sent || self.close_received {
            ChannelState::Closing
        } else {
            match (self.eof_sent, self.eof_received) {
                (false, false) => ChannelState::Open,
                (true, false) => ChannelState::LocalEof,
                (false, true) => ChannelState::RemoteEof,
                (true, true) => ChannelState::Closing,
            }
        };
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("channel_type", &self.channel_type)
            .field("state", &self.state)
            .field("local_window", &self.local_window)
            .field("remote_window", &self.remote_window)
            .field("buffered", &self.buffered())
            .finish()
    }
}
