//! Payload compression.
//!
//! Only `none` is built in; other algorithms can be registered as
//! extensions through [`CompressionFactory`].

use std::sync::Arc;

use halyard_platform::HalyardResult;

use super::registry::NamedFactory;

/// Compression state for one direction.
pub trait Compression: Send {
    /// Compresses an outgoing payload.
    fn compress(&mut self, payload: Vec<u8>) -> HalyardResult<Vec<u8>>;

    /// Decompresses an incoming payload.
    fn decompress(&mut self, payload: Vec<u8>) -> HalyardResult<Vec<u8>>;
}

/// Creates [`Compression`] instances for one algorithm name.
pub trait CompressionFactory: NamedFactory + Send + Sync {
    /// Builds a fresh compression context.
    fn create(&self) -> Box<dyn Compression>;
}

/// Builtin compression factories.
pub fn builtin_factories() -> Vec<Arc<dyn CompressionFactory>> {
    vec![Arc::new(NoCompressionFactory)]
}

/// The `none` compression method.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressionFactory;

impl NamedFactory for NoCompressionFactory {
    fn name(&self) -> &str {
        "none"
    }
}

impl CompressionFactory for NoCompressionFactory {
    fn create(&self) -> Box<dyn Compression> {
        Box::new(NoCompression)
    }
}

/// Pass-through compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compression for NoCompression {
    fn compress(&mut self, payload: Vec<u8>) -> HalyardResult<Vec<u8>> {
        Ok(payload)
    }

    fn decompress(&mut self, payload: Vec<u8>) -> HalyardResult<Vec<u8>> {
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_passes_through() {
        let mut c = NoCompressionFactory.create();
        let data = b"payload".to_vec();
        let packed = c.compress(data.clone()).unwrap();
        assert_eq!(c.decompress(packed).unwrap(), data);
    }
}
