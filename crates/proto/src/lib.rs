//! Halyard: an SSH transport session engine.
//!
//! Halyard implements the SSH binary packet protocol, algorithm negotiation,
//! key exchange and rekeying (RFC 4253) and the connection protocol with
//! channel multiplexing and flow control (RFC 4254), plus a tokio driver
//! that runs a session over any byte stream.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH engine
//!
//! # Example
//!
//! ```rust,no_run
//! use halyard_proto::ssh::{connect, SessionConfig};
//!
//! # async fn example() -> halyard_platform::HalyardResult<()> {
//! let session = connect("example.com:22", SessionConfig::client()).await?;
//! println!("session id {}", hex::encode(session.session_id()));
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Cryptography comes from vetted crates (`ring`, RustCrypto, `dalek`)
//! - MAC comparison is constant-time
//! - Key material is zeroized on drop
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - [RFC 4419](https://datatracker.ietf.org/doc/html/rfc4419) - Diffie-Hellman Group Exchange
//! - [RFC 5656](https://datatracker.ietf.org/doc/html/rfc5656) - Elliptic Curve Algorithms

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
