use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;
use std::io::prelude::*;
use tracing::{debug, info};

/// Payloads this size or larger are compressed before they are written.
/// DynamoDB items must be smaller than 400KB including attribute names.
pub(crate) const COMPRESSION_THRESHOLD: usize = 262_144;

/// Marks a compressed value. JSON text never starts with it.
pub(crate) const COMPRESSED_PREFIX: &str = "gz58:";

/// Compresses and encodes the value as Base58 if it is too large to be stored as-is.
/// Returns the value unchanged otherwise or if compression fails.
pub(crate) fn compress_if_large(value: String) -> String {
    // is it small enough to fit in?
    if value.len() < COMPRESSION_THRESHOLD {
        return value;
    }

    info!(
        "Payload size: {}B, compression threshold: {}B. Compressing...",
        value.len(),
        COMPRESSION_THRESHOLD
    );

    let mut gzipper = GzEncoder::new(value.as_bytes(), Compression::fast());
    let mut gzipped: Vec<u8> = Vec::new();
    let compressed_len = match gzipper.read_to_end(&mut gzipped) {
        Ok(v) => v,
        Err(e) => {
            // the store will reject it if it's too large
            info!("Failed to gzip the payload, storing as-is: {:?}", e);
            return value;
        }
    };

    let encoded = [COMPRESSED_PREFIX, &bs58::encode(&gzipped).into_string()].concat();

    info!("Compressed: {}, encoded: {}", compressed_len, encoded.len());

    encoded
}

/// Decodes and decompresses a value written by [compress_if_large] or returns it as-is
/// if it was not compressed.
pub(crate) fn decompress_if_marked(value: String) -> Result<String, String> {
    let encoded = match value.strip_prefix(COMPRESSED_PREFIX) {
        Some(v) => v,
        None => return Ok(value),
    };

    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| format!("Failed to decode base58 payload: {e}"))?;

    let mut decoder = GzDecoder::new(decoded.as_slice());
    let mut decompressed: Vec<u8> = Vec::new();
    let len = decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| format!("Failed to decompress the payload: {e}"))?;

    debug!("Decompressed {} bytes", len);

    String::from_utf8(decompressed).map_err(|e| format!("Decompressed payload is not UTF-8: {e}"))
}
