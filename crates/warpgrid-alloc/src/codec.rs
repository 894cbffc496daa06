//! Job payload compression.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use thiserror::Error;
use warpgrid_state::Allocation;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Compression applied to job payloads at rest.
pub trait PayloadCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// zlib payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflateCodec;

impl PayloadCodec for DeflateCodec {
    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(payload.len() * 2);
        ZlibDecoder::new(payload)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        Ok(out)
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(raw)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        encoder.finish().map_err(|e| CodecError::Encode(e.to_string()))
    }
}

/// Return the allocation with its job payload decoded.
///
/// An allocation without a payload is returned as-is (same `Arc`, no
/// decode). Otherwise a copy is decoded; `alloc` itself is never touched.
pub fn decode_job_payload(
    alloc: Arc<Allocation>,
    codec: &dyn PayloadCodec,
) -> Result<Arc<Allocation>, CodecError> {
    let has_payload = alloc
        .job
        .as_ref()
        .is_some_and(|job| !job.payload.is_empty());
    if !has_payload {
        return Ok(alloc);
    }

    let mut copy = Allocation::clone(&alloc);
    if let Some(job) = copy.job.as_mut() {
        job.payload = codec.decode(&job.payload)?;
    }
    Ok(Arc::new(copy))
}
