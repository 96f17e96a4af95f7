//! Session and channel lifecycle listeners.
//!
//! Listeners are registered at three levels: the session configuration
//! (shared by every session built from it), one session, and one channel.
//! The effective set for an event is the concatenation of those levels in
//! that order. Listeners run on the session task and must not block.

use std::sync::Arc;

use halyard_platform::HalyardError;

/// Session lifecycle callbacks. Every method defaults to a no-op.
pub trait SessionListener: Send + Sync {
    /// The first key exchange completed.
    fn session_established(&self, _session_id: &[u8]) {}

    /// A follow-up key exchange completed.
    fn session_rekeyed(&self) {}

    /// The session ended; `error` is the fatal cause, if any.
    fn session_closed(&self, _error: Option<&HalyardError>) {}
}

/// Channel lifecycle callbacks. Every method defaults to a no-op.
pub trait ChannelListener: Send + Sync {
    /// A channel became open.
    fn channel_opened(&self, _channel: u32, _channel_type: &str) {}

    /// The peer will send no more data on `channel`.
    fn channel_eof(&self, _channel: u32) {}

    /// The peer granted more window.
    fn window_adjusted(&self, _channel: u32, _remote_window: u32) {}

    /// The channel is gone; `error` is the cause when it did not close
    /// normally.
    fn channel_closed(&self, _channel: u32, _error: Option<&HalyardError>) {}
}

/// Ordered listeners of one scope.
pub struct ListenerSet<L: ?Sized> {
    listeners: Vec<Arc<L>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Appends a listener.
    pub fn add(&mut self, listener: Arc<L>) {
        self.listeners.push(listener);
    }

    /// This set followed by `other`.
    pub fn chain(&self, other: &ListenerSet<L>) -> ListenerSet<L> {
        ListenerSet {
            listeners: self
                .listeners
                .iter()
                .chain(other.listeners.iter())
                .cloned()
                .collect(),
        }
    }

    /// Listeners in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<L>> {
        self.listeners.iter()
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl ChannelListener for Named {
        fn channel_eof(&self, _channel: u32) {
            self.1.lock().unwrap().push(self.0);
        }
    }

    #[test]
    fn test_chain_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut global: ListenerSet<dyn ChannelListener> = ListenerSet::new();
        global.add(Arc::new(Named("global", log.clone())));
        let mut session = ListenerSet::new();
        session.add(Arc::new(Named("session", log.clone())) as Arc<dyn ChannelListener>);
        let mut channel = ListenerSet::new();
        channel.add(Arc::new(Named("channel", log.clone())) as Arc<dyn ChannelListener>);

        let effective = global.chain(&session).chain(&channel);
        assert_eq!(effective.len(), 3);
        for l in effective.iter() {
            l.channel_eof(1);
        }
        assert_eq!(*log.lock().unwrap(), vec!["global", "session", "channel"]);
    }
}
