//! Fuzz target for SSH packet decoding.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use halyard_proto::ssh::{Packet, PacketCodec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let reparsed = Packet::from_bytes(&packet.to_bytes()).expect("reencoded packet parses");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    // Unkeyed stream decoding: every packet taken must consume input.
    let mut codec = PacketCodec::new();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.open(&mut buf) {}
});
