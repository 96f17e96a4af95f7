//! Global and channel request dispatch (RFC 4254 Sections 4 and 5.4).
//!
//! Incoming requests run through a [`HandlerChain`]: handlers are asked in
//! registration order until one returns something other than
//! [`RequestOutcome::Unsupported`]. When nobody handles a request, a
//! failure reply is sent if the peer asked for one.
//!
//! ```rust
//! use std::sync::Arc;
//! use halyard_proto::ssh::attributes::Attributes;
//! use halyard_proto::ssh::request::{
//!     GlobalContext, HandlerChain, Reply, ReplyToken, Request, RequestOutcome,
//! };
//!
//! let mut chain: HandlerChain<GlobalContext> = HandlerChain::new();
//! chain.push(Arc::new(|_: &GlobalContext, req: &Request| {
//!     if req.name == "keepalive@openssh.com" {
//!         RequestOutcome::Handled(Reply::Failure)
//!     } else {
//!         RequestOutcome::Unsupported
//!     }
//! }));
//!
//! let ctx = GlobalContext::new(Arc::new(Attributes::new()), ReplyToken::global(1));
//! let req = Request::new("keepalive@openssh.com", true, Vec::new());
//! assert_eq!(chain.dispatch(&ctx, &req), RequestOutcome::Handled(Reply::Failure));
//! ```

use std::sync::Arc;

use super::attributes::Attributes;

/// An incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request name (e.g. `exec`, `tcpip-forward`).
    pub name: String,
    /// Whether the peer expects a reply.
    pub want_reply: bool,
    /// Request-specific data following `want_reply`.
    pub data: Vec<u8>,
}

impl Request {
    /// Creates a request.
    pub fn new(name: impl Into<String>, want_reply: bool, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            want_reply,
            data,
        }
    }
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success, with response-specific data (global requests only).
    Success(Vec<u8>),
    /// Failure.
    Failure,
}

/// Result of offering a request to one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Not this handler's request; try the next one.
    Unsupported,
    /// Handled; send `Reply` if the peer asked for one.
    Handled(Reply),
    /// Handled; the reply will be sent later with the context's
    /// [`ReplyToken`].
    Replied,
}

/// Identifies a reply the local side still owes the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyToken {
    /// `None` for global requests.
    pub channel: Option<u32>,
    /// Per-connection serial.
    pub serial: u64,
}

impl ReplyToken {
    /// Token of a global request.
    pub fn global(serial: u64) -> Self {
        Self {
            channel: None,
            serial,
        }
    }

    /// Token of a request on `channel`.
    pub fn channel(channel: u32, serial: u64) -> Self {
        Self {
            channel: Some(channel),
            serial,
        }
    }
}

/// Identifies one of our requests awaiting the peer's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Context handed to global request handlers.
#[derive(Debug, Clone)]
pub struct GlobalContext {
    /// Session attributes.
    pub attributes: Arc<Attributes>,
    /// Token for a deferred reply.
    pub reply_token: ReplyToken,
}

impl GlobalContext {
    /// Creates a context.
    pub fn new(attributes: Arc<Attributes>, reply_token: ReplyToken) -> Self {
        Self {
            attributes,
            reply_token,
        }
    }
}

/// Context handed to channel request and channel open handlers.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    /// Local channel id.
    pub channel_id: u32,
    /// Channel type given at open time.
    pub channel_type: String,
    /// Channel attributes.
    pub attributes: Arc<Attributes>,
    /// Token for a deferred reply.
    pub reply_token: ReplyToken,
}

/// Processes requests of one scope.
///
/// Handlers run on the session task and must not block; long work should
/// return [`RequestOutcome::Replied`] and answer later.
pub trait RequestHandler<C>: Send + Sync {
    /// Offers `request` to this handler.
    fn process(&self, ctx: &C, request: &Request) -> RequestOutcome;
}

impl<C, F> RequestHandler<C> for F
where
    F: Fn(&C, &Request) -> RequestOutcome + Send + Sync,
{
    fn process(&self, ctx: &C, request: &Request) -> RequestOutcome {
        self(ctx, request)
    }
}

/// Ordered handlers tried until one accepts the request.
pub struct HandlerChain<C> {
    handlers: Vec<Arc<dyn RequestHandler<C>>>,
}

impl<C> HandlerChain<C> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Appends a handler.
    pub fn push(&mut self, handler: Arc<dyn RequestHandler<C>>) {
        self.handlers.push(handler);
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the chain.
    pub fn dispatch(&self, ctx: &C, request: &Request) -> RequestOutcome {
        self.dispatch_with(&[], ctx, request)
    }

    /// Runs the chain followed by `extra`.
    pub fn dispatch_with(
        &self,
        extra: &[Arc<dyn RequestHandler<C>>],
        ctx: &C,
        request: &Request,
    ) -> RequestOutcome {
        for handler in self.handlers.iter().chain(extra) {
            match handler.process(ctx, request) {
                RequestOutcome::Unsupported => continue,
                outcome => return outcome,
            }
        }
        RequestOutcome::Unsupported
    }
}

impl<C> Clone for HandlerChain<C> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<C> Default for HandlerChain<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for HandlerChain<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("len", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> GlobalContext {
        GlobalContext::new(Arc::new(Attributes::new()), ReplyToken::global(0))
    }

    #[test]
    fn test_first_non_unsupported_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c3 = calls.clone();

        let mut chain: HandlerChain<GlobalContext> = HandlerChain::new();
        chain.push(Arc::new(move |_: &GlobalContext, _: &Request| {
            c1.fetch_add(1, Ordering::SeqCst);
            RequestOutcome::Unsupported
        }));
        chain.push(Arc::new(|_: &GlobalContext, r: &Request| {
            if r.name == "a" {
                RequestOutcome::Handled(Reply::Success(vec![1]))
            } else {
                RequestOutcome::Unsupported
            }
        }));
        chain.push(Arc::new(move |_: &GlobalContext, _: &Request| {
            c3.fetch_add(100, Ordering::SeqCst);
            RequestOutcome::Replied
        }));

        let outcome = chain.dispatch(&ctx(), &Request::new("a", true, vec![]));
        assert_eq!(outcome, RequestOutcome::Handled(Reply::Success(vec![1])));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let outcome = chain.dispatch(&ctx(), &Request::new("b", false, vec![]));
        assert_eq!(outcome, RequestOutcome::Replied);
        assert_eq!(calls.load(Ordering::SeqCst), 102);
    }

    #[test]
    fn test_empty_chain_unsupported() {
        let chain: HandlerChain<GlobalContext> = HandlerChain::default();
        assert_eq!(
            chain.dispatch(&ctx(), &Request::new("x", true, vec![])),
            RequestOutcome::Unsupported
        );
    }

    #[test]
    fn test_extra_handlers_run_after_chain() {
        let mut chain: HandlerChain<GlobalContext> = HandlerChain::new();
        chain.push(Arc::new(|_: &GlobalContext, _: &Request| RequestOutcome::Unsupported));
        let extra: Vec<Arc<dyn RequestHandler<GlobalContext>>> =
            vec![Arc::new(|_: &GlobalContext, _: &Request| {
                RequestOutcome::Handled(Reply::Failure)
            })];
        assert_eq!(
            chain.dispatch_with(&extra, &ctx(), &Request::new("x", true, vec![])),
            RequestOutcome::Handled(Reply::Failure)
        );
    }
}
