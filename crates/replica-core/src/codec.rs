//! Record codecs.
//!
//! A codec is the only per-entity knowledge the engine needs: how to turn a
//! record into bytes and back, and which field is its primary key. The same
//! codec serves the wire and the storage representation of a collection.

use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;
use crate::types::RecordKey;

/// Per-entity-type encode/decode/key-of capability.
pub trait RecordCodec: Send + Sync + 'static {
    /// The decoded record type.
    type Record: Clone + fmt::Debug + Send + Sync + 'static;

    /// Extract the record's primary key.
    fn key_of(&self, record: &Self::Record) -> RecordKey;

    /// Encode a record.
    fn encode(&self, record: &Self::Record) -> Result<Bytes, CodecError>;

    /// Decode a record.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Record, CodecError>;

    /// Decode and extract the key in one step, rejecting empty keys.
    fn decode_keyed(&self, bytes: &[u8]) -> Result<(RecordKey, Self::Record), CodecError> {
        let record = self.decode(bytes)?;
        let key = self.key_of(&record);
        if key.is_empty() {
            return Err(CodecError::EmptyKey);
        }
        Ok((key, record))
    }
}

/// A record type that knows its own primary key.
pub trait Keyed {
    /// The primary key.
    fn record_key(&self) -> RecordKey;
}

/// JSON codec for any keyed `serde` type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> RecordCodec for JsonCodec<T>
where
    T: Keyed + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static,
{
    type Record = T;

    fn key_of(&self, record: &T) -> RecordKey {
        record.record_key()
    }

    fn encode(&self, record: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(record)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// CBOR codec for any keyed `serde` type.
pub struct CborCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> CborCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for CborCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CborCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CborCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CborCodec<{}>", std::any::type_name::<T>())
    }
}

impl<T> RecordCodec for CborCodec<T>
where
    T: Keyed + Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static,
{
    type Record = T;

    fn key_of(&self, record: &T) -> RecordKey {
        record.record_key()
    }

    fn encode(&self, record: &T) -> Result<Bytes, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(record, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
