use crate::compression::{Compression, CompressionError};
use broker_factory::ConfigChoice;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// The wire encoding used for a message payload, selected independently of
/// [compression](Compression).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ConfigChoice)]
#[field(eq_fn = broker_deserialize::Slug::eq_as_slugs)]
pub enum Encoding {
    /// A self-describing textual format, via `serde_json`.
    #[default]
    Json,
    /// A compact binary format, via `bincode`.
    Binary,
}

/// Represents a failure to encode a typed value into bytes.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The JSON encoder failed, typically because a field refused
    /// serialization (e.g., a non-string map key, or a `NaN` float).
    #[error("failed to encode payload as JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// The binary encoder failed.
    #[error("failed to encode payload as binary: {0}")]
    Binary(#[source] bincode::Error),

    /// The compression stage failed after a successful encode.
    #[error("failed to compress encoded payload: {0}")]
    Compression(#[source] CompressionError),
}

/// Represents a failure to decode bytes back into a typed value.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The decompression stage failed before decoding could even begin.
    #[error("failed to decompress payload: {0}")]
    Compression(#[source] CompressionError),

    /// The JSON decoder failed, typically because the bytes are malformed or
    /// don't match the shape of the requested type.
    #[error("failed to decode payload as JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// The binary decoder failed.
    #[error("failed to decode payload as binary: {0}")]
    Binary(#[source] bincode::Error),
}

/// Bundles an [`Encoding`] and a [`Compression`] algorithm into the pipeline
/// used by the [broker kernel](crate::Broker) to turn typed values into wire
/// bytes and back.
///
/// Compression is only applied when the encoded payload is at least
/// [`min_compressible_size`](Codec::min_compressible_size) bytes; smaller
/// payloads are left uncompressed regardless of the configured algorithm, as
/// the framing overhead would outweigh any savings.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    encoding: Encoding,
    compression: Compression,
    min_compressible_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            compression: Compression::None,
            min_compressible_size: 1024,
        }
    }
}

impl Codec {
    /// Creates a codec using the given encoding and compression algorithm,
    /// with the default minimum compressible size (1024 bytes).
    pub fn new(encoding: Encoding, compression: Compression) -> Self {
        Self {
            encoding,
            compression,
            ..Self::default()
        }
    }

    /// Recreates this codec with the given minimum compressible size.
    pub fn with_min_compressible_size(self, min_compressible_size: usize) -> Self {
        Self {
            min_compressible_size,
            ..self
        }
    }

    /// The encoding used by this codec.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Encodes the given value, applying compression if the encoded payload
    /// meets the configured size threshold.
    ///
    /// Returns the final bytes, the pre-compression size, and the compression
    /// algorithm that was actually applied (which may be
    /// [`Compression::None`] even if this codec is configured with a
    /// different algorithm, when the payload was too small to bother).
    pub fn encode<T>(&self, value: &T) -> Result<(Vec<u8>, usize, Compression), EncodeError>
    where
        T: Serialize,
    {
        let encoded = match self.encoding {
            Encoding::Json => serde_json::to_vec(value).map_err(EncodeError::Json)?,
            Encoding::Binary => bincode::serialize(value).map_err(EncodeError::Binary)?,
        };

        let original_size = encoded.len();

        if self.compression == Compression::None || original_size < self.min_compressible_size {
            return Ok((encoded, original_size, Compression::None));
        }

        let compressed = self
            .compression
            .compress(&encoded)
            .map_err(EncodeError::Compression)?;

        Ok((compressed, original_size, self.compression))
    }

    /// Decodes the given bytes, first reversing `compression` (which should
    /// be the value recorded on the [envelope](crate::Envelope) this payload
    /// came from) and then deserializing per this codec's
    /// [`Encoding`](Codec::encoding).
    pub fn decode<T>(&self, bytes: &[u8], compression: Compression) -> Result<T, DecodeError>
    where
        T: DeserializeOwned,
    {
        let decompressed = compression
            .decompress(bytes)
            .map_err(DecodeError::Compression)?;

        match self.encoding {
            Encoding::Json => serde_json::from_slice(&decompressed).map_err(DecodeError::Json),
            Encoding::Binary => bincode::deserialize(&decompressed).map_err(DecodeError::Binary),
        }
    }
}
