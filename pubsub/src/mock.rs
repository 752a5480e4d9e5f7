//! In-memory broker client used by unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::{BrokerClient, ConnectOptions, Connector, ListenerId, Listeners, MessageCallback};
use crate::envelope::Delivery;
use crate::error::{Error, Result};
use crate::types::QoS;

/// Connector handing out [`MockClient`]s.
#[derive(Default)]
pub(crate) struct MockConnector {
    connects: AtomicUsize,
    fail: AtomicBool,
    delay: Duration,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Clients in connect order.
    pub(crate) fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }

    /// Most recently connected client with the given id suffix.
    pub(crate) fn client(&self, suffix: &str) -> Arc<MockClient> {
        self.clients
            .lock()
            .iter()
            .rev()
            .find(|c| c.id.ends_with(suffix))
            .cloned()
            .unwrap_or_else(|| panic!("no client ending with {suffix}"))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BrokerClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Connection("mock: connection refused".into()));
        }
        let client = Arc::new(MockClient::new(options));
        self.clients.lock().push(client.clone());
        Ok(client)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Records every request and lets tests inject deliveries.
pub(crate) struct MockClient {
    pub options: ConnectOptions,
    id: String,
    listeners: Listeners,
    connected: AtomicBool,
    hang: AtomicBool,
    fail_publish: AtomicBool,
    subscribes: Mutex<Vec<(String, QoS)>>,
    unsubscribes: Mutex<Vec<String>>,
    published: Mutex<Vec<Published>>,
}

impl MockClient {
    fn new(options: ConnectOptions) -> Self {
        Self {
            id: options.client_id.clone(),
            options,
            listeners: Listeners::default(),
            connected: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            subscribes: Mutex::new(Vec::new()),
            unsubscribes: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Hand a message to every listener, as the event loop would.
    pub(crate) fn deliver(&self, delivery: &Delivery) {
        self.listeners.dispatch(delivery);
    }

    pub(crate) fn deliver_json(&self, topic: &str, value: serde_json::Value) {
        let payload = serde_json::to_vec(&value).unwrap_or_default();
        self.deliver(&Delivery::new(topic, payload));
    }

    /// Make unsubscribe and disconnect never complete.
    pub(crate) fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn subscribes(&self) -> Vec<(String, QoS)> {
        self.subscribes.lock().clone()
    }

    pub(crate) fn unsubscribes(&self) -> Vec<String> {
        self.unsubscribes.lock().clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn maybe_hang(&self) {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Publish("mock: publish rejected".into()));
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.subscribes.lock().push((topic.to_string(), qos));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.maybe_hang().await;
        self.unsubscribes.lock().push(topic.to_string());
        Ok(())
    }

    fn add_listener(&self, callback: MessageCallback) -> ListenerId {
        self.listeners.add(callback)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    async fn disconnect(&self) -> Result<()> {
        self.maybe_hang().await;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Route library logs to the test harness output.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
