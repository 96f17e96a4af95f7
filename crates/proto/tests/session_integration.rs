//! Sessions over real TCP sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use halyard_platform::{HalyardError, HalyardResult};
use halyard_proto::ssh::hostkey::{Ed25519HostKey, StaticHostKeys};
use halyard_proto::ssh::listener::SessionListener;
use halyard_proto::ssh::request::{ChannelContext, Reply, ReplyToken, Request, RequestOutcome};
use halyard_proto::ssh::session::{connect, SessionConfig, SessionHandle, SshSession};
use halyard_proto::ssh::transport::ReservedMessageHandler;
use halyard_proto::ssh::{AcceptChannelType, ChannelMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

fn server_config() -> SessionConfig {
    let keys = StaticHostKeys::new().with_key(Arc::new(Ed25519HostKey::generate().unwrap()));
    let mut config = SessionConfig::server(Arc::new(keys));
    config
        .handlers
        .add_opener(Arc::new(AcceptChannelType("session".into())));
    config
}

/// Binds a listener and serves one session built by `build`.
async fn serve_one<F>(build: F) -> (String, tokio::task::JoinHandle<HalyardResult<SessionHandle>>)
where
    F: FnOnce() -> SshSession + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await?;
        build().start(stream).await
    });
    (addr, task)
}

struct Recorder {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl SessionListener for Recorder {
    fn session_established(&self, _session_id: &[u8]) {
        self.log.lock().unwrap().push(format!("{} established", self.name));
    }

    fn session_closed(&self, error: Option<&HalyardError>) {
        let how = if error.is_some() { "failed" } else { "closed" };
        self.log.lock().unwrap().push(format!("{} {}", self.name, how));
    }
}

#[tokio::test]
async fn test_connect_exec_and_disconnect() {
    let (addr, server) = serve_one(|| SshSession::new(server_config())).await;
    let client = timeout(Duration::from_secs(10), connect(&addr, SessionConfig::client()))
        .await
        .unwrap()
        .unwrap();
    let server = server.await.unwrap().unwrap();
    assert_eq!(client.session_id(), server.session_id());

    let serve = tokio::spawn({
        let server = server.clone();
        async move {
            let mut channel = server.accept_channel().await.unwrap();
            assert_eq!(channel.channel_type(), "session");
            while let ChannelMessage::Data(data) = channel.read().await {
                let mut out = b"ran: ".to_vec();
                out.extend_from_slice(&data);
                channel.write(&out).await.unwrap();
                channel.write_extended(1, b"no errors").await.unwrap();
                channel.eof().await.unwrap();
                channel.close();
            }
        }
    });

    let mut channel = client.open_channel("session", &[]).await.unwrap();
    channel.write(b"uptime").await.unwrap();
    assert_eq!(channel.read().await, ChannelMessage::Data(b"ran: uptime".to_vec()));
    assert_eq!(
        channel.read().await,
        ChannelMessage::ExtendedData {
            data_type: 1,
            data: b"no errors".to_vec()
        }
    );
    assert_eq!(channel.read().await, ChannelMessage::Eof);
    assert_eq!(channel.read().await, ChannelMessage::Closed);
    serve.await.unwrap();

    client.disconnect("done");
    assert!(client.closed().await.is_none());
    assert!(matches!(
        server.closed().await,
        Some(HalyardError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn test_listener_scopes_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let (addr, server) = serve_one({
        let log = log.clone();
        move || {
            let mut config = server_config();
            config.session_listeners.add(Arc::new(Recorder {
                name: "config",
                log: log.clone(),
            }));
            SshSession::new(config).with_listener(Arc::new(Recorder {
                name: "session",
                log,
            }))
        }
    })
    .await;
    let client = connect(&addr, SessionConfig::client()).await.unwrap();
    let server = server.await.unwrap().unwrap();

    server.disconnect("shutting down");
    assert!(server.closed().await.is_none());
    assert!(client.closed().await.is_some());
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "config established",
            "session established",
            "config closed",
            "session closed"
        ]
    );
}

#[tokio::test]
async fn test_deferred_channel_reply_keeps_order() {
    let (tokens_tx, mut tokens_rx) = mpsc::unbounded_channel::<ReplyToken>();
    let (addr, server) = serve_one(move || {
        let mut config = server_config();
        config
            .handlers
            .channel
            .push(Arc::new(move |ctx: &ChannelContext, req: &Request| {
                match req.name.as_str() {
                    "slow" => {
                        let _ = tokens_tx.send(ctx.reply_token);
                        RequestOutcome::Replied
                    }
                    "fast" => RequestOutcome::Handled(Reply::Success(Vec::new())),
                    _ => RequestOutcome::Unsupported,
                }
            }));
        SshSession::new(config)
    })
    .await;
    let client = connect(&addr, SessionConfig::client()).await.unwrap();
    let server = server.await.unwrap().unwrap();

    let channel = client.open_channel("session", &[]).await.unwrap();
    let _remote = server.accept_channel().await.unwrap();

    let answer = tokio::spawn({
        let server = server.clone();
        async move {
            let token = tokens_rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.send_channel_reply(token, Reply::Failure).await
        }
    });

    let (slow, fast) = tokio::join!(
        channel.request("slow", true, &[]),
        channel.request("fast", true, &[])
    );
    assert_eq!(slow.unwrap(), Some(Reply::Failure));
    assert_eq!(fast.unwrap(), Some(Reply::Success(Vec::new())));
    answer.await.unwrap().unwrap();

    assert_eq!(
        channel.request("pty-req", true, &[]).await.unwrap(),
        Some(Reply::Failure)
    );
}

#[derive(Default)]
struct IgnoreCounter(AtomicUsize);

impl ReservedMessageHandler for IgnoreCounter {
    fn ignore(&self, _data: &[u8]) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_keepalive_sends_ignore() {
    let counter = Arc::new(IgnoreCounter::default());
    let (addr, server) = serve_one({
        let counter = counter.clone();
        move || {
            let mut config = server_config();
            config.transport.reserved_handler = counter;
            SshSession::new(config)
        }
    })
    .await;
    let mut config = SessionConfig::client();
    config.keepalive_interval = Some(Duration::from_millis(20));
    let client = connect(&addr, config).await.unwrap();
    let _server = server.await.unwrap().unwrap();

    timeout(Duration::from_secs(5), async {
        while counter.0.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = connect(addr, SessionConfig::client()).await.unwrap_err();
    assert!(matches!(err, HalyardError::Io(_)), "{:?}", err);
}

#[tokio::test]
async fn test_dropping_handles_ends_session() {
    let (addr, server) = serve_one(|| SshSession::new(server_config())).await;
    let client = connect(&addr, SessionConfig::client()).await.unwrap();
    let server = server.await.unwrap().unwrap();
    drop(client);
    let cause = timeout(Duration::from_secs(5), server.closed()).await.unwrap();
    assert!(matches!(cause, Some(HalyardError::Disconnected { code: 11, .. })));
}
