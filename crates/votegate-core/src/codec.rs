//! Versioned binary encoding for stored embeddings.
//!
//! Layout (little-endian):
//! ```text
//! u8       format version
//! u8       model-id length N
//! N bytes  model-id (UTF-8)
//! u32      vector length D
//! D × f32  values
//! ```
//! Carrying the model id lets a gallery reject embeddings produced by a
//! different model instead of computing meaningless distances.

use crate::types::Embedding;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 2;
const DIM_LEN: usize = 4;
const VALUE_LEN: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("blob truncated: needed {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("model id is empty")]
    EmptyModelId,
    #[error("model id is too long ({0} bytes, max 255)")]
    ModelIdTooLong(usize),
    #[error("model id is not valid UTF-8")]
    InvalidModelId,
    #[error("embedding has zero dimensions")]
    ZeroDimension,
    #[error("{0} trailing bytes after embedding")]
    TrailingBytes(usize),
    #[error("embedding value at index {0} is not finite")]
    NonFinite(usize),
}

/// Encode an embedding into the versioned binary layout.
pub fn encode(embedding: &Embedding) -> Result<Vec<u8>, CodecError> {
    let model = embedding.model_id.as_bytes();
    if model.is_empty() {
        return Err(CodecError::EmptyModelId);
    }
    let model_len = u8::try_from(model.len()).map_err(|_| CodecError::ModelIdTooLong(model.len()))?;
    if embedding.values.is_empty() {
        return Err(CodecError::ZeroDimension);
    }
    if let Some(idx) = embedding.values.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(idx));
    }
    let dim = u32::try_from(embedding.values.len()).map_err(|_| CodecError::ZeroDimension)?;

    let mut out =
        Vec::with_capacity(HEADER_LEN + model.len() + DIM_LEN + embedding.values.len() * VALUE_LEN);
    out.push(FORMAT_VERSION);
    out.push(model_len);
    out.extend_from_slice(model);
    out.extend_from_slice(&dim.to_le_bytes());
    for v in &embedding.values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Ok(out)
}

/// Decode a blob produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Embedding, CodecError> {
    let need = |needed: usize| {
        if bytes.len() < needed {
            Err(CodecError::Truncated {
                needed,
                have: bytes.len(),
            })
        } else {
            Ok(())
        }
    };

    need(HEADER_LEN)?;
    if bytes[0] != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[0]));
    }
    let model_len = bytes[1] as usize;
    if model_len == 0 {
        return Err(CodecError::EmptyModelId);
    }

    let dim_off = HEADER_LEN + model_len;
    need(dim_off + DIM_LEN)?;
    let model_id = std::str::from_utf8(&bytes[HEADER_LEN..dim_off])
        .map_err(|_| CodecError::InvalidModelId)?
        .to_string();

    let mut dim_bytes = [0u8; DIM_LEN];
    dim_bytes.copy_from_slice(&bytes[dim_off..dim_off + DIM_LEN]);
    let dim = u32::from_le_bytes(dim_bytes) as usize;
    if dim == 0 {
        return Err(CodecError::ZeroDimension);
    }

    let values_off = dim_off + DIM_LEN;
    let end = dim
        .checked_mul(VALUE_LEN)
        .and_then(|n| n.checked_add(values_off))
        .ok_or(CodecError::Truncated {
            needed: usize::MAX,
            have: bytes.len(),
        })?;
    need(end)?;
    if bytes.len() > end {
        return Err(CodecError::TrailingBytes(bytes.len() - end));
    }

    let values: Vec<f32> = bytes[values_off..end]
        .chunks_exact(VALUE_LEN)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(CodecError::NonFinite(idx));
    }

    Ok(Embedding { values, model_id })
}

/// Lowercase hex SHA-256 of the encoded embedding.
///
/// Identical enrollments produce identical fingerprints, which storage
/// uses as a uniqueness key.
pub fn fingerprint(embedding: &Embedding) -> Result<String, CodecError> {
    let digest = Sha256::digest(encode(embedding)?);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
