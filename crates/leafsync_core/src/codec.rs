//! CBOR encoding for persisted values.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes `value` as CBOR.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CoreError::Codec(e.to_string()))?;
    Ok(out)
}

/// Decodes a CBOR value.
///
/// # Errors
///
/// Returns [`CoreError::Codec`] if `bytes` is not a valid encoding of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CoreError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_input_is_a_codec_error() {
        let encoded = to_cbor(&("chapter", 12u32)).unwrap();
        let err = from_cbor::<(String, u32)>(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, CoreError::Codec(_)));
    }
}
