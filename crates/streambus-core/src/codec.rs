//! Typed key/value codec.
//!
//! Payloads on the bus are opaque bytes; producers and subscriptions agree on
//! types only at the edges. The produce side encodes with [`encode`] and
//! fails fast on a mismatch. The subscribe side decodes with [`decode_opt`],
//! which maps any mismatch to `None` — the record is then dropped from the
//! batch without an error or a log line, per the bus's type-filter policy.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BusError, Result};

/// Encode a typed value into payload bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let buf = serde_json::to_vec(value).map_err(BusError::serialization)?;
    Ok(Bytes::from(buf))
}

/// Decode payload bytes into a typed value, failing on mismatch.
pub fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    serde_json::from_slice(bytes).map_err(BusError::serialization)
}

/// Decode payload bytes, mapping any mismatch to `None`.
pub fn decode_opt<T: DeserializeOwned>(bytes: &Bytes) -> Option<T> {
    serde_json::from_slice(bytes).ok()
}
