//! Payload codec.
//!
//! Converts payloads holding raw bytes, maps with binary values or single-shot
//! streams into a JSON-safe [`StoredPayload`] and back. Streams are drained into
//! one buffer before encoding and come back as a fresh single-chunk stream;
//! incremental persistence is not supported.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid base64 in `{field}`: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
    #[error("payload stream failed while draining: {0}")]
    Stream(#[source] io::Error),
}

/// A value cached on behalf of a producer.
pub enum Payload {
    /// Structured data that is already JSON-safe.
    Json(Value),
    /// An opaque binary blob.
    Binary(Bytes),
    /// An associative container whose values may be binary.
    Map(BTreeMap<String, MapValue>),
    /// A streamed body that can be read once.
    Stream(PayloadStream),
}

/// A value inside [`Payload::Map`].
#[derive(Debug, Clone, PartialEq)]
pub enum MapValue {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Binary(_) => "binary",
            Self::Map(_) => "map",
            Self::Stream(_) => "stream",
        }
    }

    /// Drain a streamed payload into a binary one; other shapes are returned as-is.
    pub async fn buffered(self) -> Result<Payload, CodecError> {
        match self {
            Self::Stream(stream) => Ok(Self::Binary(stream.collect_bytes().await?)),
            other => Ok(other),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Binary(bytes) => f.debug_tuple("Binary").field(&bytes.len()).finish(),
            Self::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Streams carry no comparable state until drained, so two streams are never equal.
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

/// A single-shot byte stream.
pub struct PayloadStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl PayloadStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    /// A stream yielding `bytes` as one chunk.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self::new(stream::once(async move { Ok(bytes) }))
    }

    /// Read the stream to the end into one contiguous buffer.
    pub async fn collect_bytes(mut self) -> Result<Bytes, CodecError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            buffer.extend_from_slice(&chunk.map_err(CodecError::Stream)?);
        }
        Ok(buffer.freeze())
    }
}

impl Stream for PayloadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Storage-safe form of a [`Payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredPayload {
    Json { value: Value },
    Binary { data: String },
    Map { entries: Vec<StoredMapEntry> },
    Stream { data: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMapEntry {
    pub key: String,
    #[serde(flatten)]
    pub value: StoredMapValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredMapValue {
    Json { value: Value },
    Binary { data: String },
}

impl StoredPayload {
    /// Payload size in bytes after decoding. JSON counts its compact text.
    pub fn decoded_len(&self) -> usize {
        match self {
            Self::Json { value } => value.to_string().len(),
            Self::Binary { data } | Self::Stream { data } => base64_decoded_len(data),
            Self::Map { entries } => entries
                .iter()
                .map(|entry| match &entry.value {
                    StoredMapValue::Json { value } => value.to_string().len(),
                    StoredMapValue::Binary { data } => base64_decoded_len(data),
                })
                .sum(),
        }
    }
}

fn base64_decoded_len(data: &str) -> usize {
    let padding = data.bytes().rev().take_while(|byte| *byte == b'=').count();
    (data.len() / 4 * 3).saturating_sub(padding)
}

/// Make `payload` storage-safe. Streams are fully drained first.
pub async fn encode(payload: Payload) -> Result<StoredPayload, CodecError> {
    Ok(match payload {
        Payload::Json(value) => StoredPayload::Json { value },
        Payload::Binary(bytes) => StoredPayload::Binary {
            data: STANDARD.encode(&bytes),
        },
        Payload::Map(map) => StoredPayload::Map {
            entries: map
                .into_iter()
                .map(|(key, value)| StoredMapEntry {
                    key,
                    value: match value {
                        MapValue::Json(value) => StoredMapValue::Json { value },
                        MapValue::Binary(bytes) => StoredMapValue::Binary {
                            data: STANDARD.encode(&bytes),
                        },
                    },
                })
                .collect(),
        },
        Payload::Stream(stream) => StoredPayload::Stream {
            data: STANDARD.encode(stream.collect_bytes().await?),
        },
    })
}

/// Rebuild the payload described by `stored`.
pub fn decode(stored: StoredPayload) -> Result<Payload, CodecError> {
    Ok(match stored {
        StoredPayload::Json { value } => Payload::Json(value),
        StoredPayload::Binary { data } => Payload::Binary(decode_base64("binary.data", &data)?),
        StoredPayload::Map { entries } => {
            let mut map = BTreeMap::new();
            for StoredMapEntry { key, value } in entries {
                let value = match value {
                    StoredMapValue::Json { value } => MapValue::Json(value),
                    StoredMapValue::Binary { data } => {
                        MapValue::Binary(decode_base64("map.data", &data)?)
                    }
                };
                map.insert(key, value);
            }
            Payload::Map(map)
        }
        StoredPayload::Stream { data } => {
            Payload::Stream(PayloadStream::from_bytes(decode_base64("stream.data", &data)?))
        }
    })
}

fn decode_base64(field: &'static str, data: &str) -> Result<Bytes, CodecError> {
    STANDARD
        .decode(data)
        .map(Bytes::from)
        .map_err(|source| CodecError::Base64 { field, source })
}
