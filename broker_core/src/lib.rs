#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

mod broker;
mod codec;
mod compression;
mod context;
mod envelope;
mod headers;
mod kernel;
mod registry;
mod subscription;
mod transport;

pub use broker::{Broker, BrokerError, PublishOptions};
pub use codec::{Codec, DecodeError, EncodeError, Encoding};
pub use compression::{Compression, CompressionError};
pub use context::{Acknowledgement, DeliveryContext};
pub use envelope::{Envelope, EnvelopeBuilder};
pub use headers::{HeaderValue, Headers};
pub use kernel::{type_tag, BrokerKernel, KernelConfig};
pub use registry::SubscriptionRegistry;
pub use subscription::{Handler, HandlerError, SubscriptionId, SubscriptionOptions, SubscriptionState};
pub use transport::{RawDelivery, TransportAdapter, TransportError};

/// Propagates cancellation from a caller into whatever it's waiting on
/// (bulkhead queue, retry backoff, rate limit wait, circuit-breaker probe).
/// Re-exported so dependents don't need a direct `tokio-util` dependency
/// just to construct one.
pub use tokio_util::sync::CancellationToken;
