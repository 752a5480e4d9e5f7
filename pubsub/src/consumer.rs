//! Typed topic consumers and their registration lifecycle.
//!
//! A [`Consumer`] declares the topic it listens on and handles decoded
//! messages. Consumers are registered explicitly, either one at a time with
//! [`ConsumerRegistry::register`] or from a list of [`ConsumerDescriptor`]s
//! with [`ConsumerRegistry::init`]:
//!
//! ```ignore
//! registry
//!     .init([
//!         ConsumerDescriptor::of::<TemperatureConsumer>(),
//!         ConsumerDescriptor::new(|| AlarmConsumer::new(threshold)),
//!     ])
//!     .await?;
//! ```
//!
//! Each registered consumer owns a bounded queue and a worker task. The
//! broker callback only enqueues, so a slow consumer never stalls the
//! client's event loop and messages of one subscription are handled in
//! arrival order.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{BrokerClient, ListenerId};
use crate::envelope::{Delivery, Inbound};
use crate::error::{Error, Result, with_timeout};
use crate::pipeline::{Handler, Pipeline};
use crate::registry::ConnectionRegistry;
use crate::topic;
use crate::types::QoS;

/// Where a consumer subscribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
    /// Connection name; `None` uses the default connection.
    pub connection: Option<String>,
}

impl Subscription {
    /// Subscribe to `topic` at QoS 0 on the default connection.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            connection: None,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Whether a delivery on `topic` belongs to this subscription.
    ///
    /// Literal subscriptions require the exact topic. Wildcard
    /// subscriptions share the client with other consumers, so their
    /// pattern is evaluated here.
    pub fn accepts(&self, topic: &str) -> bool {
        if topic::has_wildcards(&self.topic) {
            topic::is_match(topic, &self.topic)
        } else {
            self.topic == topic
        }
    }
}

/// A typed message consumer.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// JSON payload type.
    type Message: DeserializeOwned + Send + Sync + 'static;

    /// Consumers marked ignored are skipped by registration.
    const IGNORED: bool = false;

    /// Topic, QoS and connection to subscribe with.
    fn subscription(&self) -> Subscription;

    /// Add filters or transformer stages to this consumer's pipeline.
    fn configure(&self, _pipeline: &mut Pipeline<Inbound<Self::Message>>) {}

    /// Handle one decoded message.
    async fn handle(&self, message: &Inbound<Self::Message>) -> anyhow::Result<()>;
}

struct ConsumerHandler<C>(Arc<C>);

#[async_trait]
impl<C: Consumer> Handler<Inbound<C::Message>> for ConsumerHandler<C> {
    async fn handle(&self, msg: &Inbound<C::Message>) -> anyhow::Result<()> {
        self.0.handle(msg).await
    }
}

#[async_trait]
trait Factory: Send + Sync {
    async fn register(&self, registry: &ConsumerRegistry) -> Result<bool>;
}

struct FnFactory<C, F> {
    make: F,
    _consumer: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C, F> Factory for FnFactory<C, F>
where
    C: Consumer,
    F: Fn() -> C + Send + Sync,
{
    async fn register(&self, registry: &ConsumerRegistry) -> Result<bool> {
        registry.register((self.make)()).await
    }
}

/// A consumer type together with the factory that builds it.
pub struct ConsumerDescriptor {
    type_name: &'static str,
    ignored: bool,
    factory: Box<dyn Factory>,
}

impl ConsumerDescriptor {
    /// Describe consumer type `C`, built by `make`.
    pub fn new<C, F>(make: F) -> Self
    where
        C: Consumer,
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            type_name: std::any::type_name::<C>(),
            ignored: C::IGNORED,
            factory: Box::new(FnFactory {
                make,
                _consumer: PhantomData,
            }),
        }
    }

    /// Describe consumer type `C`, built with `Default`.
    pub fn of<C: Consumer + Default>() -> Self {
        Self::new(C::default)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }
}

impl std::fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("type_name", &self.type_name)
            .field("ignored", &self.ignored)
            .finish()
    }
}

struct Active {
    type_name: &'static str,
    connection: String,
    topic: String,
    qos: QoS,
    client: Arc<dyn BrokerClient>,
    listener: ListenerId,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// Live consumer registrations, at most one per consumer type.
pub struct ConsumerRegistry {
    connections: Arc<ConnectionRegistry>,
    queue_capacity: usize,
    operation_timeout: Duration,
    active: Mutex<HashMap<TypeId, Active>>,
}

impl ConsumerRegistry {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        let settings = connections.settings();
        Self {
            queue_capacity: settings.consumer_queue_capacity.max(1),
            operation_timeout: settings.timeouts.operation(),
            connections,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Register every descriptor that is not marked ignored.
    ///
    /// Returns how many consumers were newly registered. The first
    /// registration error aborts initialization.
    pub async fn init(
        &self,
        descriptors: impl IntoIterator<Item = ConsumerDescriptor>,
    ) -> Result<usize> {
        let mut registered = 0;
        for descriptor in descriptors {
            if descriptor.ignored {
                debug!(consumer = descriptor.type_name, "consumer ignored");
                continue;
            }
            if descriptor.factory.register(self).await? {
                registered += 1;
            }
        }
        info!(registered, "consumers initialized");
        Ok(registered)
    }

    /// Subscribe `consumer` and start delivering messages to it.
    ///
    /// Returns `Ok(false)` if a consumer of the same type is already
    /// registered or the type is marked ignored.
    pub async fn register<C: Consumer>(&self, consumer: C) -> Result<bool> {
        let type_name = std::any::type_name::<C>();
        if C::IGNORED {
            debug!(consumer = type_name, "consumer ignored");
            return Ok(false);
        }

        let mut active = self.active.lock().await;
        if active.contains_key(&TypeId::of::<C>()) {
            debug!(consumer = type_name, "consumer already registered");
            return Ok(false);
        }

        let subscription = consumer.subscription();
        topic::validate_pattern(&subscription.topic)?;
        let connection = self
            .connections
            .settings()
            .connection(subscription.connection.as_deref())?
            .name
            .clone();
        let client = self.connections.subscribe_client(Some(&connection)).await?;

        // The broker keeps one subscription per topic and client, so a topic
        // shared with other consumers is held at the highest declared QoS.
        let held = strongest_qos(&active, &connection, &subscription.topic);
        let request = match held {
            Some(qos) if qos >= subscription.qos => None,
            _ => Some(subscription.qos),
        };

        let consumer = Arc::new(consumer);
        let mut pipeline = Pipeline::new(type_name, ConsumerHandler(consumer.clone()));
        consumer.configure(&mut pipeline);

        let (tx, rx) = mpsc::channel::<Delivery>(self.queue_capacity);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run_worker(pipeline, rx, cancel.clone()));

        let filter = subscription.clone();
        let listener = client.add_listener(Arc::new(move |delivery: &Delivery| {
            if !filter.accepts(&delivery.topic) {
                return;
            }
            match tx.try_send(delivery.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        consumer = type_name,
                        topic = %delivery.topic,
                        message_id = %delivery.message_id(),
                        "consumer queue full, message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }));

        let subscribed = match request {
            Some(qos) => {
                with_timeout(
                    "subscribe",
                    self.operation_timeout,
                    client.subscribe(&subscription.topic, qos),
                )
                .await
            }
            None => {
                debug!(consumer = type_name, topic = %subscription.topic, "topic already subscribed");
                Ok(())
            }
        };
        if let Err(e) = subscribed {
            client.remove_listener(listener);
            cancel.cancel();
            return Err(e);
        }

        info!(
            consumer = type_name,
            connection = %connection,
            topic = %subscription.topic,
            qos = subscription.qos.level(),
            "consumer registered"
        );
        active.insert(
            TypeId::of::<C>(),
            Active {
                type_name,
                connection,
                topic: subscription.topic,
                qos: subscription.qos,
                client,
                listener,
                cancel,
                worker,
            },
        );
        Ok(true)
    }

    /// Whether a consumer of type `C` is registered.
    pub async fn is_registered<C: Consumer>(&self) -> bool {
        self.active.lock().await.contains_key(&TypeId::of::<C>())
    }

    /// Number of registered consumers.
    pub async fn len(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Type names of the registered consumers, sorted.
    pub async fn registered(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> =
            self.active.lock().await.values().map(|a| a.type_name).collect();
        names.sort_unstable();
        names
    }

    /// Stop consumer `C` and unsubscribe its topic.
    ///
    /// The broker subscription is kept while another registered consumer
    /// uses the same topic on the same connection, lowered to the highest
    /// QoS still declared. Returns `Ok(false)` if `C` was not registered.
    pub async fn unregister<C: Consumer>(&self, deadline: Duration) -> Result<bool> {
        let (entry, release) = {
            let mut active = self.active.lock().await;
            let Some(entry) = active.remove(&TypeId::of::<C>()) else {
                return Ok(false);
            };
            let release = match strongest_qos(&active, &entry.connection, &entry.topic) {
                None => Release::Unsubscribe,
                Some(qos) if qos < entry.qos => Release::Downgrade(qos),
                Some(_) => Release::Keep,
            };
            (entry, release)
        };
        teardown(entry, release, Instant::now() + deadline)
            .await
            .map(|()| true)
    }

    /// Stop every consumer.
    ///
    /// Every consumer is torn down even when some steps fail or run out of
    /// time; the first failure is returned.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        let entries: Vec<Active> = self.active.lock().await.drain().map(|(_, a)| a).collect();

        let mut first_err = None;
        for entry in entries {
            if let Err(e) = teardown(entry, Release::Unsubscribe, until).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

/// Highest QoS declared by the active consumers of `topic` on `connection`.
fn strongest_qos(active: &HashMap<TypeId, Active>, connection: &str, topic: &str) -> Option<QoS> {
    active
        .values()
        .filter(|a| a.connection == connection && a.topic == topic)
        .map(|a| a.qos)
        .max()
}

/// What happens to the broker subscription of a removed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Unsubscribe,
    Keep,
    /// Still shared, but only at this lower QoS.
    Downgrade(QoS),
}

/// Detach the listener, release the subscription, then let the worker finish
/// the message it is processing.
async fn teardown(entry: Active, release: Release, until: Instant) -> Result<()> {
    let Active {
        type_name,
        connection,
        topic,
        qos: _,
        client,
        listener,
        cancel,
        mut worker,
    } = entry;

    client.remove_listener(listener);

    let remaining = until.saturating_duration_since(Instant::now());
    let unsubscribed = match release {
        Release::Unsubscribe => {
            with_timeout("unsubscribe", remaining, client.unsubscribe(&topic)).await
        }
        Release::Downgrade(qos) => {
            debug!(consumer = type_name, topic = %topic, qos = qos.level(), "topic still in use, lowering qos");
            with_timeout("subscribe", remaining, client.subscribe(&topic, qos)).await
        }
        Release::Keep => {
            debug!(consumer = type_name, topic = %topic, "topic still in use, subscription kept");
            Ok(())
        }
    };
    if let Err(e) = &unsubscribed {
        warn!(consumer = type_name, connection = %connection, topic = %topic, error = %e, "releasing subscription failed");
    }

    cancel.cancel();
    let remaining = until.saturating_duration_since(Instant::now());
    if tokio::time::timeout(remaining, &mut worker).await.is_err() {
        warn!(consumer = type_name, "consumer worker did not stop in time, aborting");
        worker.abort();
    }

    info!(consumer = type_name, topic = %topic, "consumer unregistered");
    unsubscribed
}

async fn run_worker<M>(
    pipeline: Pipeline<Inbound<M>>,
    mut rx: mpsc::Receiver<Delivery>,
    cancel: CancellationToken,
) where
    M: DeserializeOwned + Send + Sync + 'static,
{
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        match decode::<M>(&delivery) {
            Ok(inbound) => {
                pipeline.process(&inbound).await;
            }
            Err(e) => {
                debug!(
                    pipeline = pipeline.name(),
                    topic = %delivery.topic,
                    message_id = %delivery.message_id(),
                    error = %e,
                    "payload dropped"
                );
            }
        }
    }
    debug!(pipeline = pipeline.name(), "consumer worker stopped");
}

/// Decode a delivery's JSON payload into the consumer's message type.
pub(crate) fn decode<M: DeserializeOwned>(delivery: &Delivery) -> Result<Inbound<M>> {
    if delivery.payload.is_empty() {
        return Err(Error::Deserialization("empty payload".into()));
    }
    let message = serde_json::from_slice::<M>(&delivery.payload)
        .map_err(|e| Error::Deserialization(e.to_string()))?;
    Ok(Inbound {
        envelope: delivery.envelope(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, Settings};
    use crate::mock::{MockConnector, wait_until};
    use parking_lot::Mutex as SyncMutex;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    #[derive(Default)]
    struct ReadingConsumer {
        seen: Arc<SyncMutex<Vec<Inbound<Reading>>>>,
    }

    #[async_trait]
    impl Consumer for ReadingConsumer {
        type Message = Reading;

        fn subscription(&self) -> Subscription {
            Subscription::new("sensors/readings").with_qos(QoS::AtLeastOnce)
        }

        async fn handle(&self, message: &Inbound<Reading>) -> anyhow::Result<()> {
            self.seen.lock().push(message.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct IgnoredConsumer;

    #[async_trait]
    impl Consumer for IgnoredConsumer {
        type Message = Reading;
        const IGNORED: bool = true;

        fn subscription(&self) -> Subscription {
            Subscription::new("ignored")
        }

        async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct HotConsumer {
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Consumer for HotConsumer {
        type Message = Reading;

        fn subscription(&self) -> Subscription {
            Subscription::new("sensors/+/temp").on_connection("edge")
        }

        fn configure(&self, pipeline: &mut Pipeline<Inbound<Reading>>) {
            pipeline.add_filter(|m: &Inbound<Reading>| m.message.value > 30.0);
        }

        async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<MockConnector>, ConsumerRegistry) {
        setup_with(|s| s)
    }

    fn setup_with(f: impl FnOnce(Settings) -> Settings) -> (Arc<MockConnector>, ConsumerRegistry) {
        let settings = Settings::default()
            .with_connection(ConnectionConfig::new("default", "h", 1883))
            .with_connection(ConnectionConfig::new("edge", "e", 1883));
        let connector = Arc::new(MockConnector::new());
        let connections =
            ConnectionRegistry::with_connector(f(settings), connector.clone()).unwrap();
        (connector, ConsumerRegistry::new(Arc::new(connections)))
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (connector, registry) = setup();

        assert!(registry.register(ReadingConsumer::default()).await.unwrap());
        assert!(!registry.register(ReadingConsumer::default()).await.unwrap());

        let client = connector.client("-sub");
        assert_eq!(
            client.subscribes(),
            vec![("sensors/readings".to_string(), QoS::AtLeastOnce)]
        );
        assert_eq!(client.listener_count(), 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.is_registered::<ReadingConsumer>().await);
    }

    #[tokio::test]
    async fn test_ignored_consumer_is_skipped() {
        let (connector, registry) = setup();
        assert!(!registry.register(IgnoredConsumer).await.unwrap());
        assert_eq!(connector.connect_count(), 0);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_messages_are_decoded_with_envelope() {
        let (connector, registry) = setup();
        let consumer = ReadingConsumer::default();
        let seen = consumer.seen.clone();
        registry.register(consumer).await.unwrap();

        let client = connector.client("-sub");
        let delivery = Delivery::new(
            "sensors/readings",
            r#"{"sensor":"s1","value":21.5}"#.as_bytes().to_vec(),
        )
        .with_qos(QoS::AtLeastOnce)
        .with_retain(true);
        client.deliver(&delivery);
        client.deliver(&Delivery::new("sensors/readings", bytes::Bytes::new()));
        client.deliver(&Delivery::new("sensors/readings", "not json"));
        client.deliver_json("sensors/other", serde_json::json!({"sensor": "s2", "value": 1.0}));

        assert!(wait_until(WAIT, || !seen.lock().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let inbound = &seen[0];
        assert_eq!(inbound.message, Reading { sensor: "s1".into(), value: 21.5 });
        assert_eq!(inbound.topic(), "sensors/readings");
        assert_eq!(inbound.message_id(), delivery.message_id());
        assert_eq!(inbound.envelope.qos, QoS::AtLeastOnce);
        assert!(inbound.envelope.retain);
        assert_eq!(inbound.envelope.timestamp, delivery.received_at);
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let (connector, registry) = setup();
        let consumer = ReadingConsumer::default();
        let seen = consumer.seen.clone();
        registry.register(consumer).await.unwrap();

        let client = connector.client("-sub");
        for i in 0..200 {
            client.deliver_json("sensors/readings", serde_json::json!({"sensor": "s", "value": i}));
        }

        assert!(wait_until(WAIT, || seen.lock().len() == 200).await);
        let values: Vec<f64> = seen.lock().iter().map(|m| m.message.value).collect();
        let expected: Vec<f64> = (0..200).map(f64::from).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn test_wildcard_subscription_and_filter() {
        let (connector, registry) = setup();
        let handled = Arc::new(AtomicUsize::new(0));
        registry
            .register(HotConsumer { handled: handled.clone() })
            .await
            .unwrap();

        let client = connector.client("-sub");
        assert_eq!(client.options.connection, "edge");

        client.deliver_json("sensors/1/temp", serde_json::json!({"sensor": "1", "value": 35.0}));
        client.deliver_json("sensors/2/temp", serde_json::json!({"sensor": "2", "value": 20.0}));
        client.deliver_json("sensors/3/humidity", serde_json::json!({"sensor": "3", "value": 90.0}));
        client.deliver_json("sensors/4/temp", serde_json::json!({"sensor": "4", "value": 31.0}));

        assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_subscription_topic() {
        struct Bad;

        #[async_trait]
        impl Consumer for Bad {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("a/#/b")
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (connector, registry) = setup();
        let err = registry.register(Bad).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTopicPattern(_)));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (connector, registry) = setup();
        let consumer = ReadingConsumer::default();
        let seen = consumer.seen.clone();
        registry.register(consumer).await.unwrap();
        let client = connector.client("-sub");

        assert!(registry.unregister::<ReadingConsumer>(Duration::from_secs(1)).await.unwrap());
        assert!(!registry.unregister::<ReadingConsumer>(Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.unsubscribes(), vec!["sensors/readings".to_string()]);
        assert_eq!(client.listener_count(), 0);

        client.deliver_json("sensors/readings", serde_json::json!({"sensor": "s", "value": 1.0}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty());

        // Registering again after teardown subscribes again.
        assert!(registry.register(ReadingConsumer::default()).await.unwrap());
        assert_eq!(client.subscribes().len(), 2);
    }

    #[tokio::test]
    async fn test_shared_topic_keeps_subscription() {
        #[derive(Default)]
        struct Mirror;

        #[async_trait]
        impl Consumer for Mirror {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("sensors/readings")
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (connector, registry) = setup();
        registry.register(ReadingConsumer::default()).await.unwrap();
        registry.register(Mirror).await.unwrap();
        let client = connector.client("-sub");

        assert!(registry.unregister::<Mirror>(Duration::from_secs(1)).await.unwrap());
        assert!(client.unsubscribes().is_empty());
        assert_eq!(client.listener_count(), 1);

        assert!(registry.unregister::<ReadingConsumer>(Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.unsubscribes(), vec!["sensors/readings".to_string()]);
    }

    #[tokio::test]
    async fn test_shared_topic_holds_highest_qos() {
        struct Exact;
        struct Loose;

        #[async_trait]
        impl Consumer for Exact {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("t").with_qos(QoS::ExactlyOnce)
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        #[async_trait]
        impl Consumer for Loose {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("t")
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let t = |qos| ("t".to_string(), qos);

        // A weaker consumer joining does not lower the subscription.
        let (connector, registry) = setup();
        registry.register(Exact).await.unwrap();
        registry.register(Loose).await.unwrap();
        let client = connector.client("-sub");
        assert_eq!(client.subscribes(), vec![t(QoS::ExactlyOnce)]);

        // Removing the strongest consumer lowers it to what remains.
        assert!(registry.unregister::<Exact>(Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.subscribes(), vec![t(QoS::ExactlyOnce), t(QoS::AtMostOnce)]);
        assert!(client.unsubscribes().is_empty());

        // A stronger consumer joining raises it.
        let (connector, registry) = setup();
        registry.register(Loose).await.unwrap();
        registry.register(Exact).await.unwrap();
        let client = connector.client("-sub");
        assert_eq!(client.subscribes(), vec![t(QoS::AtMostOnce), t(QoS::ExactlyOnce)]);

        // Removing the weaker one leaves it untouched.
        assert!(registry.unregister::<Loose>(Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.subscribes().len(), 2);
        assert!(client.unsubscribes().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_broker() {
        let (connector, registry) = setup();
        registry.register(ReadingConsumer::default()).await.unwrap();
        registry
            .register(HotConsumer { handled: Arc::new(AtomicUsize::new(0)) })
            .await
            .unwrap();
        connector.client("-sub").set_hang(true);

        let err = registry.shutdown(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "unsubscribe", .. }));
        assert!(registry.is_empty().await);
        assert!(connector.clients().iter().all(|c| c.listener_count() == 0));
    }

    #[tokio::test]
    async fn test_full_queue_drops_messages() {
        struct Slow {
            gate: Arc<tokio::sync::Semaphore>,
            handled: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Consumer for Slow {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("slow")
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                let _permit = self.gate.acquire().await?;
                self.handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let (connector, registry) = setup_with(|mut s| {
            s.consumer_queue_capacity = 1;
            s
        });
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        registry
            .register(Slow { gate: gate.clone(), handled: handled.clone() })
            .await
            .unwrap();

        let client = connector.client("-sub");
        for i in 0..10 {
            client.deliver_json("slow", serde_json::json!({"sensor": "s", "value": i}));
        }
        gate.add_permits(10);

        assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) >= 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handled.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_init_from_descriptors() {
        let (connector, registry) = setup();
        let handled = Arc::new(AtomicUsize::new(0));
        let shared = handled.clone();

        let descriptors = vec![
            ConsumerDescriptor::of::<ReadingConsumer>(),
            ConsumerDescriptor::of::<IgnoredConsumer>(),
            ConsumerDescriptor::new(move || HotConsumer { handled: shared.clone() }),
            ConsumerDescriptor::of::<ReadingConsumer>(),
        ];
        assert!(descriptors[1].is_ignored());
        assert!(descriptors[0].type_name().ends_with("ReadingConsumer"));

        assert_eq!(registry.init(descriptors).await.unwrap(), 2);
        assert_eq!(registry.len().await, 2);
        assert_eq!(connector.connect_count(), 2);
        let names = registry.registered().await;
        assert!(names.iter().any(|n| n.ends_with("HotConsumer")));
    }

    #[tokio::test]
    async fn test_init_fails_on_unknown_connection() {
        struct Lost;

        #[async_trait]
        impl Consumer for Lost {
            type Message = Reading;
            fn subscription(&self) -> Subscription {
                Subscription::new("x").on_connection("nowhere")
            }
            async fn handle(&self, _: &Inbound<Reading>) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (_, registry) = setup();
        let err = registry
            .init([ConsumerDescriptor::new(|| Lost)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownConnection(name) if name == "nowhere"));
    }

    #[test]
    fn test_decode() {
        let ok = Delivery::new("t", r#"{"sensor":"a","value":1}"#);
        let inbound = decode::<Reading>(&ok).unwrap();
        assert_eq!(inbound.message.sensor, "a");
        assert_eq!(inbound.message_id(), ok.message_id());

        for bad in [
            Delivery::new("t", ""),
            Delivery::new("t", "{}"),
            Delivery::new("t", vec![0xffu8, 0xfe]),
        ] {
            let err = decode::<Reading>(&bad).unwrap_err();
            assert!(matches!(err, Error::Deserialization(_)), "unexpected error: {err}");
        }
    }
}
