use crate::subscription::{SubscriptionId, SubscriptionOptions, SubscriptionRecord, SubscriptionState};
use crate::Handler;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a message type to the set of subscriptions registered against it.
///
/// Reads (looking up the subscriptions to dispatch a delivery to) are far
/// more frequent than writes (registering a new subscription), so the
/// registry is backed by a reader-writer lock rather than a mutex.
#[derive(Default)]
pub struct SubscriptionRegistry {
    by_type: RwLock<HashMap<String, Vec<Arc<SubscriptionRecord>>>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new handler for the given message type, returning the
    /// newly created subscription's id. The subscription starts in the
    /// [`Registered`](SubscriptionState::Registered) state; call
    /// [`activate_all`](SubscriptionRegistry::activate_all) (or activate it
    /// individually) to start receiving deliveries.
    pub fn subscribe<T, H>(
        &self,
        message_type: impl Into<String>,
        handler: H,
        options: SubscriptionOptions,
    ) -> SubscriptionId
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        let message_type = message_type.into();
        let record = Arc::new(SubscriptionRecord::new(message_type.clone(), handler, options));
        let id = record.id();

        self.by_type
            .write()
            .entry(message_type)
            .or_default()
            .push(record);

        id
    }

    /// Returns every subscription currently in the
    /// [`Active`](SubscriptionState::Active) state for the given message
    /// type, in registration order.
    pub fn active_for(&self, message_type: &str) -> Vec<Arc<SubscriptionRecord>> {
        self.by_type
            .read()
            .get(message_type)
            .map(|records| records.iter().filter(|r| r.is_active()).cloned().collect())
            .unwrap_or_default()
    }

    /// Lists every distinct message type with at least one registered
    /// subscription, in no particular order.
    pub fn message_types(&self) -> Vec<String> {
        self.by_type.read().keys().cloned().collect()
    }

    /// Reports whether any subscription at all (active or not) is registered
    /// for the given message type.
    pub fn has_subscribers(&self, message_type: &str) -> bool {
        self.by_type
            .read()
            .get(message_type)
            .is_some_and(|records| !records.is_empty())
    }

    /// Transitions every registered subscription into the
    /// [`Active`](SubscriptionState::Active) state. Subscriptions already
    /// [`Cancelled`](SubscriptionState::Cancelled) are left untouched.
    pub fn activate_all(&self) {
        for records in self.by_type.read().values() {
            for record in records {
                if record.state() != SubscriptionState::Cancelled {
                    record.set_state(SubscriptionState::Active);
                }
            }
        }
    }

    /// Transitions every active subscription into the
    /// [`Paused`](SubscriptionState::Paused) state. Subscriptions remain
    /// registered and can be resumed via
    /// [`activate_all`](SubscriptionRegistry::activate_all).
    pub fn pause_all(&self) {
        for records in self.by_type.read().values() {
            for record in records {
                if record.state() == SubscriptionState::Active {
                    record.set_state(SubscriptionState::Paused);
                }
            }
        }
    }

    /// Permanently cancels every subscription. Cancelled subscriptions never
    /// receive further deliveries, even if
    /// [`activate_all`](SubscriptionRegistry::activate_all) is called again.
    pub fn cancel_all(&self) {
        for records in self.by_type.read().values() {
            for record in records {
                record.set_state(SubscriptionState::Cancelled);
            }
        }
    }

    /// The total number of registered subscriptions across all message
    /// types, regardless of state.
    pub fn len(&self) -> usize {
        self.by_type.read().values().map(|records| records.len()).sum()
    }

    /// Reports whether no subscriptions have been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeliveryContext;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, Deserialize)]
    struct Ping;

    fn handler() -> impl Handler<Ping> {
        |_: Ping, _: DeliveryContext| async { Ok(()) }
    }

    #[test]
    fn fresh_subscriptions_are_not_active_until_activated() {
        // Given
        let registry = SubscriptionRegistry::new();

        // When
        registry.subscribe("ping", handler(), SubscriptionOptions::default());

        // Then
        assert!(registry.has_subscribers("ping"));
        assert!(registry.active_for("ping").is_empty());
    }

    #[test]
    fn activate_all_makes_subscriptions_dispatchable() {
        // Given
        let registry = SubscriptionRegistry::new();
        registry.subscribe("ping", handler(), SubscriptionOptions::default());

        // When
        registry.activate_all();

        // Then
        assert_eq!(registry.active_for("ping").len(), 1);
    }

    #[test]
    fn cancel_all_survives_reactivation() {
        // Given
        let registry = SubscriptionRegistry::new();
        registry.subscribe("ping", handler(), SubscriptionOptions::default());
        registry.activate_all();

        // When
        registry.cancel_all();
        registry.activate_all();

        // Then
        assert!(registry.active_for("ping").is_empty());
    }

    #[test]
    fn multiple_handlers_can_share_a_message_type() {
        // Given
        let registry = SubscriptionRegistry::new();

        // When
        registry.subscribe("ping", handler(), SubscriptionOptions::default());
        registry.subscribe("ping", handler(), SubscriptionOptions::default());
        registry.activate_all();

        // Then
        assert_eq!(registry.active_for("ping").len(), 2);
        assert_eq!(registry.len(), 2);
    }
}
