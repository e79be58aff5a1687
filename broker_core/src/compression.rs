use broker_factory::ConfigChoice;
use std::io::{Read, Write};
use thiserror::Error;

/// The compression algorithm applied to an encoded message payload.
///
/// Recorded on the [envelope](crate::Envelope) alongside the original and
/// compressed sizes, so decode can reverse it without any out-of-band
/// agreement between publisher and consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ConfigChoice)]
#[field(eq_fn = broker_deserialize::Slug::eq_as_slugs)]
pub enum Compression {
    /// No compression is applied.
    #[default]
    #[field(alias = "off")]
    None,
    /// DEFLATE-wrapped gzip, via `flate2`.
    Gzip,
    /// Raw DEFLATE, via `flate2`.
    Deflate,
    /// Brotli.
    Brotli,
    /// LZ4 (block format), via `lz4_flex`.
    Lz4,
    /// Zstandard.
    Zstd,
}

/// Represents a failure to compress or decompress a payload.
#[derive(Error, Debug)]
pub enum CompressionError {
    /// The underlying compressor or decompressor reported an I/O error.
    #[error("compression I/O error ({algorithm:?}): {source}")]
    Io {
        /// The algorithm in use when the error occurred.
        algorithm: Compression,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Compression {
    /// Compresses the given bytes using this algorithm. [`Compression::None`]
    /// returns the input unchanged.
    pub fn compress(&self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(input.to_vec()),

            Self::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(input)
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                encoder
                    .finish()
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })
            }

            Self::Deflate => {
                let mut encoder =
                    flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(input)
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                encoder
                    .finish()
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })
            }

            Self::Brotli => {
                let mut output = Vec::new();
                let mut reader = input;
                brotli::BrotliCompress(&mut reader, &mut output, &brotli::enc::BrotliEncoderParams::default())
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                Ok(output)
            }

            Self::Lz4 => Ok(lz4_flex::block::compress_prepend_size(input)),

            Self::Zstd => zstd::encode_all(input, 0)
                .map_err(|source| CompressionError::Io { algorithm: *self, source }),
        }
    }

    /// Decompresses the given bytes using this algorithm. [`Compression::None`]
    /// returns the input unchanged.
    pub fn decompress(&self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        match self {
            Self::None => Ok(input.to_vec()),

            Self::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(input);
                let mut output = Vec::new();
                decoder
                    .read_to_end(&mut output)
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                Ok(output)
            }

            Self::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(input);
                let mut output = Vec::new();
                decoder
                    .read_to_end(&mut output)
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                Ok(output)
            }

            Self::Brotli => {
                let mut output = Vec::new();
                let mut reader = input;
                brotli::BrotliDecompress(&mut reader, &mut output)
                    .map_err(|source| CompressionError::Io { algorithm: *self, source })?;
                Ok(output)
            }

            Self::Lz4 => lz4_flex::block::decompress_size_prepended(input).map_err(|error| {
                CompressionError::Io {
                    algorithm: *self,
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, error),
                }
            }),

            Self::Zstd => zstd::decode_all(input)
                .map_err(|source| CompressionError::Io { algorithm: *self, source }),
        }
    }
}
