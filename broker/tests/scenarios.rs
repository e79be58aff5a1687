use async_trait::async_trait;
use broker::memory::MemoryTransport;
use broker::{
    Broker, BrokerError, BrokerKernel, Bulkhead, BulkheadBroker, BulkheadConfig, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerError, DedupBroker, DedupCache, DedupConfig, DeliveryContext,
    Envelope, Handler, InMemoryInboxStore, InMemorySagaStore, InboxHandler, InboxRecord, InboxStore,
    KernelConfig, PublishOptions, SagaConfig, SagaEngine, SagaMetrics, SagaRecord, SagaState,
    SagaStep, SagaStore, SagaTimeoutSupervisor, SubscriptionOptions,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

struct CountingBroker {
    publishes: Arc<AtomicU32>,
}

#[async_trait]
impl Broker for CountingBroker {
    async fn publish_envelope(&self, _envelope: Envelope, _options: PublishOptions) -> Result<(), BrokerError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

fn envelope_with_id(id: &str, payload: &[u8]) -> Envelope {
    Envelope::builder("Ping", "ping")
        .with_message_id(id)
        .with_payload(payload.to_vec(), payload.len())
        .build()
}

/// S1: a content-hash duplicate is dropped before reaching the wrapped broker.
#[tokio::test]
async fn dedup_drops_content_hash_duplicate() {
    // Given: the default strategy is already content-hash.
    let publishes = Arc::new(AtomicU32::new(0));
    let inner = Arc::new(CountingBroker { publishes: publishes.clone() }) as Arc<dyn Broker>;
    let config = DedupConfig::default();
    let window = config.window();
    let cache = Arc::new(DedupCache::new(config).unwrap());
    let broker = DedupBroker::new(inner, cache, window);

    // When: same payload, distinct message ids (a publisher retrying after a
    // lost ack, say), published back to back.
    broker
        .publish_envelope(envelope_with_id("attempt-1", b"order-42"), PublishOptions::default())
        .await
        .unwrap();
    broker
        .publish_envelope(envelope_with_id("attempt-2", b"order-42"), PublishOptions::default())
        .await
        .unwrap();

    // Then
    assert_eq!(publishes.load(Ordering::SeqCst), 1);
}

/// S2: a bulkhead at capacity with no queue room rejects the overflow call
/// instead of admitting it.
#[tokio::test]
async fn bulkhead_rejects_overflow() {
    // Given
    let config: BulkheadConfig = serde_json::from_value(json!({
        "max_concurrent": 1,
        "max_queued": 0,
    }))
    .unwrap();
    let bulkhead = Arc::new(Bulkhead::new(config));
    let release = Arc::new(tokio::sync::Notify::new());
    let release_clone = release.clone();
    let inner = Arc::new(SlowBroker { release: release_clone }) as Arc<dyn Broker>;
    let broker = Arc::new(BulkheadBroker::new(inner, bulkhead));

    struct SlowBroker {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Broker for SlowBroker {
        async fn publish_envelope(&self, _envelope: Envelope, _options: PublishOptions) -> Result<(), BrokerError> {
            self.release.notified().await;
            Ok(())
        }

        async fn start(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn dispose(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    // When: the first publish occupies the only slot and blocks; the second
    // arrives while it's still in flight, with no queue room to wait in.
    let first_broker = broker.clone();
    let first = tokio::spawn(async move {
        first_broker
            .publish_envelope(envelope_with_id("first", b"x"), PublishOptions::default())
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = broker
        .publish_envelope(envelope_with_id("second", b"y"), PublishOptions::default())
        .await;

    // Then
    assert!(matches!(second, Err(BrokerError::Rejected(_))));

    release.notify_one();
    first.await.unwrap().unwrap();
}

#[derive(Debug, Clone, Default)]
struct OrderData {
    log: Vec<String>,
}

struct ReserveInventory;

#[async_trait]
impl SagaStep<OrderData, String> for ReserveInventory {
    fn name(&self) -> &str {
        "reserve_inventory"
    }

    async fn execute(&self, data: &mut OrderData, _cancel: &CancellationToken) -> Result<(), String> {
        data.log.push("reserved".to_string());
        Ok(())
    }

    async fn compensate(&self, data: &mut OrderData, _cancel: &CancellationToken) -> Result<(), String> {
        data.log.push("released".to_string());
        Ok(())
    }
}

struct ChargeCard;

#[async_trait]
impl SagaStep<OrderData, String> for ChargeCard {
    fn name(&self) -> &str {
        "charge_card"
    }

    async fn execute(&self, _data: &mut OrderData, _cancel: &CancellationToken) -> Result<(), String> {
        Err("card declined".to_string())
    }

    async fn compensate(&self, data: &mut OrderData, _cancel: &CancellationToken) -> Result<(), String> {
        data.log.push("refunded".to_string());
        Ok(())
    }
}

/// S3: a failure in the second step compensates the first step in reverse
/// order and settles on `compensated`, never `failed`.
#[tokio::test]
async fn saga_compensates_on_step_two_failure() {
    // Given
    let engine: SagaEngine<OrderData, String> = SagaEngine::new(
        vec![Box::new(ReserveInventory), Box::new(ChargeCard)],
        SagaConfig::default(),
        Arc::new(SagaMetrics::new()),
    );
    let mut record = SagaRecord::new("order-123", "order-saga", OrderData::default());
    let cancel = CancellationToken::new();

    // When
    let result = engine
        .execute(&mut record, &cancel, |error: &String| error.contains("timeout"))
        .await
        .unwrap();

    // Then
    assert!(!result.success);
    assert_eq!(record.state, SagaState::Compensated);
    assert_eq!(result.failed_step.as_deref(), Some("charge_card"));
    assert_eq!(result.data.log, vec!["reserved".to_string(), "released".to_string()]);
}

/// S4: the timeout supervisor transitions a stale `running` saga into
/// `compensating`.
#[tokio::test]
async fn saga_timeout_transitions_running_to_compensating() {
    // Given
    let store: Arc<InMemorySagaStore<OrderData>> = Arc::new(InMemorySagaStore::new());
    let mut record = SagaRecord::new("order-456", "order-saga", OrderData::default());
    store.save(&record, None).await.unwrap();
    record.state = SagaState::Running;
    record.updated_at_ms = 0;
    store.save(&record, Some(0)).await.unwrap();

    let config: SagaConfig = serde_json::from_value(json!({
        "default_timeout": { "secs": 0, "nanos": 0 },
    }))
    .unwrap();
    let supervisor = SagaTimeoutSupervisor::new(store.clone(), config);

    // When
    let result = supervisor.run_cycle().await;

    // Then
    assert_eq!(result.timed_out_count, 1);
    let updated = store.get_by_id(record.saga_id).await.unwrap();
    assert_eq!(updated.state, SagaState::Compensating);
}

/// S5: the circuit opens after enough transient failures, short-circuits
/// while open, and recovers once a half-open probe succeeds.
#[tokio::test]
async fn circuit_opens_then_recovers() {
    // Given
    let config: CircuitBreakerConfig = serde_json::from_value(json!({
        "failure_threshold": 2,
        "min_throughput": 1,
        "break_duration": { "secs": 0, "nanos": 30_000_000 },
        "success_threshold": 1,
    }))
    .unwrap();
    let breaker = CircuitBreaker::new(config);
    let is_transient = |_: &&str| true;
    let cancel = CancellationToken::new();

    // When: two consecutive failures open the breaker.
    for _ in 0..2 {
        let _ = breaker.call(&cancel, is_transient, || async { Err::<(), _>("boom") }).await;
    }
    let short_circuited = breaker.call(&cancel, is_transient, || async { Ok::<_, &str>(()) }).await;

    // Then
    assert!(matches!(
        short_circuited,
        Err(CircuitBreakerError::CircuitOpen { .. })
    ));

    // When: the break duration elapses and a probe succeeds.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let recovered = breaker.call(&cancel, is_transient, || async { Ok::<_, &str>(()) }).await;
    let post_recovery = breaker.call(&cancel, is_transient, || async { Ok::<_, &str>(()) }).await;

    // Then
    assert!(recovered.is_ok());
    assert!(post_recovery.is_ok());
}

/// S6: the inbox decorator skips re-invoking the handler for a message id
/// already recorded for this consumer.
#[tokio::test]
async fn inbox_prevents_double_processing() {
    // Given
    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    let handler = move |_message: (), _ctx: DeliveryContext| {
        let calls = calls_clone.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    };
    let store: Arc<dyn InboxStore> = Arc::new(InMemoryInboxStore::new());
    let wrapped = InboxHandler::new(handler, store.clone(), "order-consumer");

    // When: the same message id is delivered twice, the second time after
    // it has already been recorded as processed.
    let (context_one, _acks_one) = DeliveryContext::test_pair();
    wrapped.handle((), context_one).await.unwrap();

    store
        .store(InboxRecord {
            message_id: "test-message-id".to_string(),
            message_type: "unit".to_string(),
            consumer_name: "order-consumer".to_string(),
            processed_at_ms: 0,
        })
        .await;
    let (context_two, mut acks_two) = DeliveryContext::test_pair();
    wrapped.handle((), context_two).await.unwrap();

    // Then: the handler only actually ran once, and the skipped delivery was
    // still acknowledged outright.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(acks_two.recv().await, Some(broker::Acknowledgement::Ack));
}

/// End-to-end smoke test threading a typed publish through the in-memory
/// transport into a subscribed handler, independent of the S1-S6 scenarios
/// above, which each exercise a single decorator or saga component in
/// isolation.
#[tokio::test]
async fn publish_roundtrips_through_the_memory_transport() {
    // Given
    let transport = Arc::new(MemoryTransport::new());
    let kernel = BrokerKernel::new(transport, KernelConfig::default());
    let received = Arc::new(tokio::sync::Mutex::new(None));
    let received_clone = received.clone();

    kernel
        .subscribe::<Ping, _>(
            move |message: Ping, _ctx: DeliveryContext| {
                let received = received_clone.clone();
                async move {
                    *received.lock().await = Some(message);
                    Ok(())
                }
            },
            SubscriptionOptions::default(),
        )
        .await
        .unwrap();
    kernel.start().await.unwrap();

    // When
    kernel.publish(&Ping { n: 7 }, PublishOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Then
    assert_eq!(*received.lock().await, Some(Ping { n: 7 }));
}
