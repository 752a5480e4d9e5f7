//! Broker client abstraction and its rumqttc implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, TlsConfiguration, Transport,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, Endpoint, TlsSettings};
use crate::envelope::Delivery;
use crate::error::{Error, Result};
use crate::tls;
use crate::types::{QoS, Role};

/// Callback invoked for every inbound message.
pub type MessageCallback = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Handle returned by [`BrokerClient::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A connected broker client.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Client id presented to the broker.
    fn client_id(&self) -> &str;

    /// Whether the client currently holds a broker session.
    fn is_connected(&self) -> bool;

    /// Publish a message.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()>;

    /// Subscribe to a topic filter. The subscription survives reconnects.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Unsubscribe from a topic filter.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Register a callback for inbound messages.
    fn add_listener(&self, callback: MessageCallback) -> ListenerId;

    /// Remove a callback. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Close the broker session.
    async fn disconnect(&self) -> Result<()>;
}

/// Opens broker clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and wait for the broker handshake.
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BrokerClient>>;
}

/// Everything needed to open one client.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Name of the configured connection.
    pub connection: String,
    pub role: Role,
    pub client_id: String,
    pub endpoint: Endpoint,
    pub clean_session: bool,
    pub keep_alive: Option<Duration>,
    pub credentials: Option<(String, String)>,
    pub tls: TlsSettings,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl ConnectOptions {
    /// Derive client options for one role of a configured connection.
    pub fn from_config(config: &ConnectionConfig, role: Role, project_id: &str) -> Result<Self> {
        let endpoint = config.endpoint()?;

        let base = match config.client_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{project_id}-{}", Uuid::new_v4().simple()),
        };

        let credentials = config
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| (u.to_string(), config.password.clone().unwrap_or_default()));

        Ok(Self {
            connection: config.name.clone(),
            role,
            client_id: format!("{base}-{}", role.suffix()),
            endpoint,
            clean_session: config.clean_session,
            keep_alive: config.keep_alive(),
            credentials,
            tls: config.tls.clone(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
        })
    }

    /// Set the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the delay between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        let mut opts = MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        opts.set_clean_session(self.clean_session);
        if let Some(keep_alive) = self.keep_alive {
            opts.set_keep_alive(keep_alive);
        }
        if let Some((username, password)) = &self.credentials {
            opts.set_credentials(username, password);
        }
        if self.endpoint.tls {
            let config = tls::client_config(&self.tls)?;
            opts.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(config),
            )));
        }
        Ok(opts)
    }
}

/// Listener table shared by client implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    next: AtomicU64,
    entries: RwLock<Vec<(ListenerId, MessageCallback)>>,
}

impl Listeners {
    pub(crate) fn add(&self, callback: MessageCallback) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(lid, _)| *lid != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Invoke every listener. Callbacks run outside the lock and a panicking
    /// callback does not stop the others.
    pub(crate) fn dispatch(&self, delivery: &Delivery) {
        let callbacks: Vec<MessageCallback> =
            self.entries.read().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(delivery)));
            if res.is_err() {
                error!(topic = %delivery.topic, "message listener panicked");
            }
        }
    }
}

/// [`Connector`] backed by rumqttc.
#[derive(Debug, Clone, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn BrokerClient>> {
        let client = MqttClient::connect(options).await?;
        Ok(client)
    }
}

struct Shared {
    subscriptions: Mutex<HashMap<String, QoS>>,
    listeners: Listeners,
    connected: AtomicBool,
}

/// rumqttc client with its event loop running on a spawned task.
///
/// Dropping the client stops the event loop.
pub struct MqttClient {
    id: String,
    connection: String,
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    stopped: CancellationToken,
}

type Ready = oneshot::Sender<std::result::Result<(), String>>;

impl MqttClient {
    /// Connect and wait for the first ConnAck.
    pub async fn connect(options: ConnectOptions) -> Result<Arc<Self>> {
        let mqtt = options.mqtt_options()?;
        let (client, event_loop) = AsyncClient::new(mqtt, 100);

        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(HashMap::new()),
            listeners: Listeners::default(),
            connected: AtomicBool::new(false),
        });
        let this = Arc::new(Self {
            id: options.client_id.clone(),
            connection: options.connection.clone(),
            client: client.clone(),
            shared: shared.clone(),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(run_event_loop(
            event_loop,
            client,
            shared,
            this.cancel.clone(),
            this.stopped.clone(),
            ready_tx,
            options.reconnect_delay,
        ));

        let after = options.connect_timeout;
        match tokio::time::timeout(after, ready_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(
                    connection = %options.connection,
                    role = %options.role,
                    client_id = %options.client_id,
                    host = %options.endpoint.host,
                    port = options.endpoint.port,
                    "connected to broker"
                );
                Ok(this)
            }
            Ok(Ok(Err(reason))) => Err(Error::Connection(format!(
                "{}:{}: {reason}",
                options.endpoint.host, options.endpoint.port
            ))),
            Ok(Err(_)) => Err(Error::Connection(
                "event loop stopped before the handshake completed".into(),
            )),
            Err(_) => Err(Error::Timeout {
                operation: "connect",
                after,
            }),
        }
    }

    /// Name of the configured connection this client belongs to.
    pub fn connection(&self) -> &str {
        &self.connection
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    stopped: CancellationToken,
    ready: Ready,
    reconnect_delay: Duration,
) {
    let mut ready = Some(ready);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.connected.store(true, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                } else {
                    info!("reconnected to broker");
                }

                let subs: Vec<(String, QoS)> = shared
                    .subscriptions
                    .lock()
                    .iter()
                    .map(|(t, q)| (t.clone(), *q))
                    .collect();
                for (topic, qos) in subs {
                    if let Err(e) = client.try_subscribe(&topic, qos.into()) {
                        error!(topic = %topic, error = %e, "resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let delivery = Delivery::from(publish);
                debug!(topic = %delivery.topic, message_id = %delivery.message_id(), "message received");
                shared.listeners.dispatch(&delivery);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                debug!(pkid = suback.pkid, "subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::PubAck(puback))) => {
                debug!(pkid = puback.pkid, "publish acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("disconnected by broker");
                shared.connected.store(false, Ordering::SeqCst);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                shared.connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::SeqCst);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                warn!(error = %e, "broker connection lost, reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    stopped.cancel();
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    fn client_id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.client
            .publish_bytes(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.shared
            .subscriptions
            .lock()
            .insert(topic.to_string(), qos);

        if let Err(e) = self.client.subscribe(topic, qos.into()).await {
            self.shared.subscriptions.lock().remove(topic);
            return Err(Error::Subscribe(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.shared.subscriptions.lock().remove(topic);
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))
    }

    fn add_listener(&self, callback: MessageCallback) -> ListenerId {
        self.shared.listeners.add(callback)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    async fn disconnect(&self) -> Result<()> {
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        if !self.is_connected() || self.client.disconnect().await.is_err() {
            self.cancel.cancel();
        }
        self.stopped.cancelled().await;
        info!(connection = %self.connection, client_id = %self.id, "disconnected from broker");
        Ok(())
    }
}
