//! Gzip helpers for frame payloads.

use crate::error::{EngineError, EngineResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub fn gzip(data: &[u8]) -> EngineResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| EngineError::MalformedFrame(format!("gzip compression failed: {}", e)))
}

pub fn gunzip(data: &[u8]) -> EngineResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::MalformedFrame(format!("gzip payload is corrupt: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_restores_input() {
        let input = br#"{"result":{"text":"hello"}}"#.repeat(8);
        let packed = gzip(&input).unwrap();
        assert_ne!(packed, input);
        assert_eq!(gunzip(&packed).unwrap(), input);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, EngineError::MalformedFrame(_)));
    }
}
