//! Channel traffic through the full sans-IO stack: connection over an
//! encrypted transport, both sides pumped in memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use halyard_proto::ssh::connection::{
    AcceptChannelType, Connection, ConnectionConfig, ConnectionEvent, ConnectionHandlers,
    OpenFailureReason,
};
use halyard_proto::ssh::hostkey::{Ed25519HostKey, StaticHostKeys};
use halyard_proto::ssh::listener::{ChannelListener, ListenerSet};
use halyard_proto::ssh::transport::{Transport, TransportConfig, TransportEvent};

struct Peer {
    transport: Transport,
    connection: Connection,
    events: Vec<ConnectionEvent>,
}

impl Peer {
    fn new(transport: TransportConfig, config: ConnectionConfig, handlers: ConnectionHandlers, now: Instant) -> Self {
        Self {
            transport: Transport::new(transport, now).unwrap(),
            connection: Connection::new(config, handlers).unwrap(),
            events: Vec::new(),
        }
    }

    /// Moves connection output into the transport and transport payloads
    /// into the connection. Returns whether anything moved.
    fn step(&mut self, now: Instant) -> bool {
        let mut moved = false;
        while let Some(event) = self.transport.poll_event() {
            if let TransportEvent::Payload { payload, .. } = event {
                assert!(self.connection.handle_payload(&payload).unwrap());
                moved = true;
            }
        }
        if self.transport.is_established() {
            while let Some(payload) = self.connection.take_outbound() {
                self.transport.send_payload(&payload, now).unwrap();
                moved = true;
            }
        }
        while let Some(event) = self.connection.poll_event() {
            self.events.push(event);
        }
        moved
    }
}

fn run(a: &mut Peer, b: &mut Peer, now: Instant) {
    loop {
        let mut moved = a.step(now) | b.step(now);
        if let Some(bytes) = a.transport.take_outbound() {
            b.transport.feed(&bytes, now).unwrap();
            moved = true;
        }
        if let Some(bytes) = b.transport.take_outbound() {
            a.transport.feed(&bytes, now).unwrap();
            moved = true;
        }
        if !moved {
            return;
        }
    }
}

fn peers(config: ConnectionConfig) -> (Peer, Peer) {
    let keys = StaticHostKeys::new().with_key(Arc::new(Ed25519HostKey::generate().unwrap()));
    let mut handlers = ConnectionHandlers::default();
    handlers.add_opener(Arc::new(AcceptChannelType("session".into())));
    let now = Instant::now();
    let mut client = Peer::new(
        TransportConfig::client(),
        config.clone(),
        ConnectionHandlers::default(),
        now,
    );
    let mut server = Peer::new(TransportConfig::server(Arc::new(keys)), config, handlers, now);
    run(&mut client, &mut server, now);
    assert!(client.transport.is_established());
    (client, server)
}

#[derive(Default)]
struct AdjustCounter(AtomicUsize);

impl ChannelListener for AdjustCounter {
    fn window_adjusted(&self, _channel: u32, _remote_window: u32) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_one_mebibyte_transfer_with_window_adjusts() {
    let config = ConnectionConfig {
        initial_window: 256 * 1024,
        max_packet: 32 * 1024,
        low_water_mark: 0.5,
        max_channels: 16,
    };
    let (mut client, mut server) = peers(config);
    let counter = Arc::new(AdjustCounter::default());
    let mut listeners = ListenerSet::<dyn ChannelListener>::new();
    listeners.add(counter.clone());
    client.connection.set_listeners(listeners);

    let now = Instant::now();
    let cid = client.connection.open_channel("session", b"").unwrap();
    run(&mut client, &mut server, now);
    let sid = match server.events.drain(..).next() {
        Some(ConnectionEvent::ChannelAccepted { channel, channel_type, .. }) => {
            assert_eq!(channel_type, "session");
            channel
        }
        other => panic!("unexpected event {:?}", other),
    };

    let body: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    client.connection.send_data(cid, &body).unwrap();

    let mut received = Vec::with_capacity(body.len());
    loop {
        run(&mut client, &mut server, now);
        let mut consumed = false;
        for event in server.events.drain(..) {
            if let ConnectionEvent::Data { channel, data } = event {
                assert_eq!(channel, sid);
                assert!(data.len() <= 32 * 1024);
                server.connection.consume(sid, data.len() as u32).unwrap();
                received.extend_from_slice(&data);
                consumed = true;
            }
        }
        if !consumed {
            break;
        }
    }

    assert_eq!(received, body);
    assert_eq!(counter.0.load(Ordering::SeqCst), 8);
    assert_eq!(client.connection.channel(cid).unwrap().buffered(), 0);
}

#[test]
fn test_unknown_channel_type_is_refused() {
    let (mut client, mut server) = peers(ConnectionConfig::default());
    let now = Instant::now();

    let id = client.connection.open_channel("x11", b"").unwrap();
    run(&mut client, &mut server, now);
    match client.events.as_slice() {
        [ConnectionEvent::ChannelOpenFailed { channel, reason, description }] => {
            assert_eq!(*channel, id);
            assert_eq!(OpenFailureReason::from_u32(*reason), Some(OpenFailureReason::UnknownChannelType));
            assert!(description.contains("unknown channel type"));
        }
        other => panic!("unexpected events {:?}", other),
    }
    assert!(server.events.is_empty());
    assert_eq!(server.connection.channel_count(), 0);
    assert!(!client.transport.is_closed());
}

#[test]
fn test_session_survives_rekey_mid_transfer() {
    let (mut client, mut server) = peers(ConnectionConfig::default());
    let now = Instant::now();
    let cid = client.connection.open_channel("session", b"").unwrap();
    run(&mut client, &mut server, now);
    server.events.clear();

    client.connection.send_data(cid, &[1u8; 40_000]).unwrap();
    client.transport.request_rekey(now).unwrap();
    client.connection.send_data(cid, &[2u8; 10]).unwrap();
    run(&mut client, &mut server, now);

    let data: Vec<u8> = server
        .events
        .drain(..)
        .filter_map(|event| match event {
            ConnectionEvent::Data { data, .. } => Some(data),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(data.len(), 40_010);
    assert_eq!(&data[40_000..], &[2u8; 10]);
    assert_eq!(client.transport.session_id(), server.transport.session_id());
}
