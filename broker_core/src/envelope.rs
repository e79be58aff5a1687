use crate::compression::Compression;
use crate::headers::Headers;
use std::time::SystemTime;

/// The in-flight representation of a message as it travels through the
/// decorator chain, the serialization pipeline, and a transport adapter.
///
/// An [`Envelope`] carries the already-encoded (and possibly compressed)
/// payload bytes, never a typed value — decoding into a concrete type happens
/// once, at the edge of the [broker kernel](crate::Broker), via
/// [`Codec`](crate::Codec).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    payload: Vec<u8>,
    message_type: String,
    message_id: String,
    correlation_id: Option<String>,
    timestamp: SystemTime,
    headers: Headers,
    routing_key: String,
    compression: Compression,
    original_size: usize,
    compressed_size: usize,
}

impl Envelope {
    /// Starts building a new envelope for the given message type and routing
    /// key.
    pub fn builder(message_type: impl Into<String>, routing_key: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type.into(), routing_key.into())
    }

    /// The encoded (and possibly compressed) payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The discriminator used to look up subscriptions in the
    /// [registry](crate::SubscriptionRegistry).
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The unique identifier of this message. Synthesized by the kernel at
    /// publish time if the caller didn't supply one.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// An optional identifier linking this message to a request/response pair
    /// or to a saga chain.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The instant this message entered the system.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The message's header bag.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A mutable view of the message's header bag, for decorators that tag
    /// the envelope as it passes through (e.g., a retry count).
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The transport-neutral destination selector (queue name, topic,
    /// subject, or stream, depending on the backend).
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The compression algorithm applied to [`payload`](Envelope::payload),
    /// if any.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// The size, in bytes, of the payload before compression.
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    /// The size, in bytes, of the payload after compression (equal to
    /// [`original_size`](Envelope::original_size) when uncompressed).
    pub fn compressed_size(&self) -> usize {
        self.compressed_size
    }
}

/// Incrementally builds an [`Envelope`].
#[derive(Debug)]
pub struct EnvelopeBuilder {
    payload: Vec<u8>,
    message_type: String,
    message_id: Option<String>,
    correlation_id: Option<String>,
    timestamp: Option<SystemTime>,
    headers: Headers,
    routing_key: String,
    compression: Compression,
    original_size: usize,
}

impl EnvelopeBuilder {
    fn new(message_type: String, routing_key: String) -> Self {
        Self {
            payload: Vec::new(),
            message_type,
            message_id: None,
            correlation_id: None,
            timestamp: None,
            headers: Headers::new(),
            routing_key,
            compression: Compression::None,
            original_size: 0,
        }
    }

    /// Sets the (already encoded, possibly compressed) payload bytes and the
    /// pre-compression size they were derived from.
    pub fn with_payload(mut self, payload: Vec<u8>, original_size: usize) -> Self {
        self.original_size = original_size;
        self.payload = payload;
        self
    }

    /// Sets an explicit message id, overriding auto-generation.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Sets the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets an explicit timestamp, overriding the default of "now".
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Replaces the header bag.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Records the compression algorithm applied to the payload.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Finalizes the builder into an [`Envelope`], synthesizing a
    /// [`uuid`](uuid::Uuid) v4 message id if one wasn't set.
    pub fn build(self) -> Envelope {
        let compressed_size = self.payload.len();

        Envelope {
            payload: self.payload,
            message_type: self.message_type,
            message_id: self
                .message_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            correlation_id: self.correlation_id,
            timestamp: self.timestamp.unwrap_or_else(SystemTime::now),
            headers: self.headers,
            routing_key: self.routing_key,
            compression: self.compression,
            original_size: self.original_size,
            compressed_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_synthesizes_message_id_when_absent() {
        // Given
        let builder = Envelope::builder("orders.Placed", "orders");

        // When
        let envelope = builder.build();

        // Then
        assert!(!envelope.message_id().is_empty());
        assert_eq!(envelope.message_type(), "orders.Placed");
        assert_eq!(envelope.routing_key(), "orders");
    }

    #[test]
    fn builder_preserves_explicit_message_id() {
        // Given
        let builder = Envelope::builder("orders.Placed", "orders").with_message_id("fixed-id");

        // When
        let envelope = builder.build();

        // Then
        assert_eq!(envelope.message_id(), "fixed-id");
    }

    #[test]
    fn builder_tracks_original_and_compressed_sizes() {
        // Given
        let builder = Envelope::builder("orders.Placed", "orders")
            .with_payload(vec![1, 2, 3], 10)
            .with_compression(Compression::Gzip);

        // When
        let envelope = builder.build();

        // Then
        assert_eq!(envelope.original_size(), 10);
        assert_eq!(envelope.compressed_size(), 3);
        assert_eq!(envelope.compression(), Compression::Gzip);
    }
}
