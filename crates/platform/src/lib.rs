//! # Halyard Platform
//!
//! Core platform types shared by the Halyard crates.
//!
//! This crate provides:
//! - Unified error type (`HalyardError`, `HalyardResult`)
//! - SSH disconnect reason codes (`DisconnectReason`)
//!
//! # Examples
//!
//! ```
//! use halyard_platform::{HalyardError, HalyardResult};
//!
//! fn example_function() -> HalyardResult<String> {
//!     Ok("Hello, Halyard!".to_string())
//! }
//!
//! # fn main() -> HalyardResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Halyard!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{DisconnectReason, HalyardError, HalyardResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
