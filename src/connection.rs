//! Lifecycle of the single subscriber session.
//!
//! The [`ConnectionManager`] owns the session and is the only writer of the
//! store's connection status. Inbound messages travel over a channel into the
//! ingestion task, so the transport's own threading never touches the store.

use std::{future::Future, time::Duration};

use rumqttc::ConnectReturnCode;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    dto::ConnectionStatus,
    ingest::{self, LinkEvent},
    store::{SharedStore, TelemetryStore},
};

const LINK_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    Transport(#[from] rumqttc::ConnectionError),
    #[error("broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("broker rejected the subscription to {0}")]
    SubscribeRejected(String),
    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("connection manager is not running")]
    Closed,
}

/// A publish/subscribe backend able to open one subscribed session at a time.
pub trait Transport: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Connects, subscribes to `topic` and starts forwarding into `events`.
    /// Must give up within a bounded time.
    fn open(
        &self,
        topic: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> impl Future<Output = Result<Self::Session, ConnectError>> + Send;

    /// Ends the session. No events are forwarded once this returns.
    fn close(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

/// Sets the status, logging the transition when it changed anything.
pub(crate) fn transition(store: &TelemetryStore, status: ConnectionStatus) {
    if let Some(previous) = store.set_status(status) {
        info!("MQTT status: {} -> {}", previous, status);
    }
}

struct ActiveLink<S> {
    session: S,
    ingest: JoinHandle<()>,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    topic: String,
    store: SharedStore,
    active: Option<ActiveLink<T::Session>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, topic: impl Into<String>, store: SharedStore) -> Self {
        ConnectionManager {
            transport,
            topic: topic.into(),
            store,
            active: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.active.is_some() && self.store.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        // A session whose link dropped on its own still has to be released.
        self.teardown().await;
        transition(&self.store, ConnectionStatus::Connecting);

        let (sender, receiver) = mpsc::channel(LINK_BUFFER);
        match self.transport.open(&self.topic, sender).await {
            Ok(session) => {
                transition(&self.store, ConnectionStatus::Connected);
                info!("MQTT subscribed to {}", self.topic);

                let ingest = tokio::spawn(ingest::run(self.store.clone(), receiver));
                self.active = Some(ActiveLink { session, ingest });
                Ok(())
            }
            Err(err) => {
                transition(&self.store, ConnectionStatus::Disconnected);
                warn!("Failed to connect to MQTT broker: {}", err);
                Err(err)
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.teardown().await;
        transition(&self.store, ConnectionStatus::Disconnected);
    }

    pub async fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.disconnect().await;
        self.connect().await
    }

    async fn teardown(&mut self) {
        if let Some(link) = self.active.take() {
            // The ingestion task only yields between messages, so aborting it
            // never cuts a store update in half.
            link.ingest.abort();
            let _ = link.ingest.await;
            self.transport.close(link.session).await;
        }
    }

    /// Moves the manager onto its own task and returns a handle to drive it.
    /// The session is closed once every handle is dropped.
    pub fn spawn(self) -> ConnectionHandle {
        let (commands, mut receiver) = mpsc::channel(8);

        tokio::spawn(async move {
            let mut manager = self;
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Connect(reply) => {
                        let _ = reply.send(manager.connect().await);
                    }
                    Command::Disconnect(reply) => {
                        manager.disconnect().await;
                        let _ = reply.send(());
                    }
                    Command::Reconnect(reply) => {
                        let _ = reply.send(manager.reconnect().await);
                    }
                }
            }
            manager.disconnect().await;
        });

        ConnectionHandle { commands }
    }
}

enum Command {
    Connect(oneshot::Sender<Result<(), ConnectError>>),
    Disconnect(oneshot::Sender<()>),
    Reconnect(oneshot::Sender<Result<(), ConnectError>>),
}

#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.request(Command::Connect).await?
    }

    pub async fn disconnect(&self) -> Result<(), ConnectError> {
        self.request(Command::Disconnect).await
    }

    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        self.request(Command::Reconnect).await?
    }

    /// Queues a connect attempt without waiting for the broker. The outcome
    /// only shows up in the store's status.
    pub fn connect_in_background(&self) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            // Broker failures are already logged by the manager.
            if let Err(ConnectError::Closed) = handle.connect().await {
                warn!("Connection manager stopped before the first connect");
            }
        })
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, ConnectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ConnectError::Closed)?;
        response.await.map_err(|_| ConnectError::Closed)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{eventually, Script, ScriptedTransport};
    use super::*;
    use crate::history::DEFAULT_CAPACITY;

    const TOPIC: &str = "application/1/device/9fb27692fb0c2381/event/up";

    fn setup(
        outcomes: &[bool],
    ) -> (
        SharedStore,
        std::sync::Arc<Script>,
        ConnectionManager<ScriptedTransport>,
    ) {
        let store = TelemetryStore::shared(DEFAULT_CAPACITY);
        let script = Script::new(outcomes, &store);
        let manager =
            ConnectionManager::new(ScriptedTransport(script.clone()), TOPIC, store.clone());
        (store, script, manager)
    }

    #[tokio::test]
    async fn failed_attempts_then_manual_retry() {
        let (store, script, mut manager) = setup(&[false, false, true]);

        assert!(manager.connect().await.is_err());
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        assert!(manager.connect().await.is_err());
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        manager.connect().await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Connected);

        assert_eq!(
            *script.seen.lock().unwrap(),
            vec![ConnectionStatus::Connecting; 3]
        );
        assert!(!store.has_received_any());
    }

    #[tokio::test]
    async fn messages_flow_into_store() {
        let (store, script, mut manager) = setup(&[]);
        manager.connect().await.unwrap();

        assert!(
            script
                .deliver(br#"{"object": {"voltage": 221.4, "current": 1.2, "power": 268}}"#)
                .await
        );
        assert!(script.deliver(b"{broken").await);

        eventually(|| store.has_received_any()).await;
        let latest = store.latest().unwrap();
        assert_eq!(latest.voltage, 221.4);
        assert_eq!(latest.rssi, 0.0);
        assert_eq!(store.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn connect_when_connected_is_a_no_op() {
        let (store, script, mut manager) = setup(&[]);
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(script.seen.lock().unwrap().len(), 1);
        assert_eq!(store.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn disconnect_stops_delivery_and_is_idempotent() {
        let (store, script, mut manager) = setup(&[]);
        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        assert_eq!(*script.closed.lock().unwrap(), 1);
        assert!(!script.deliver(br#"{"object": {"power": 1}}"#).await);
        assert!(!store.has_received_any());
    }

    #[tokio::test]
    async fn dropped_link_is_reported_then_recovered() {
        let (store, script, mut manager) = setup(&[]);
        manager.connect().await.unwrap();
        assert!(script.deliver(br#"{"object": {"power": 7}}"#).await);

        script.drop_link("network unreachable").await;
        eventually(|| store.status() == ConnectionStatus::Disconnected).await;
        assert_eq!(store.latest().map(|s| s.power), Some(7.0));

        manager.connect().await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Connected);
        assert_eq!(*script.closed.lock().unwrap(), 1);

        assert!(script.deliver(br#"{"object": {"power": 8}}"#).await);
        eventually(|| store.latest().map(|s| s.power) == Some(8.0)).await;
    }

    #[tokio::test]
    async fn reconnect_replaces_session() {
        let (store, script, mut manager) = setup(&[true, false]);
        manager.connect().await.unwrap();

        assert!(manager.reconnect().await.is_err());
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        assert_eq!(*script.closed.lock().unwrap(), 1);

        manager.reconnect().await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn handle_drives_spawned_manager() {
        let (store, script, manager) = setup(&[false]);
        let handle = manager.spawn();

        assert!(matches!(
            handle.connect().await,
            Err(ConnectError::Refused(_))
        ));
        handle.reconnect().await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Connected);

        handle.disconnect().await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Disconnected);
        assert_eq!(*script.closed.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_session() {
        let (store, script, manager) = setup(&[]);
        let handle = manager.spawn();
        handle.connect().await.unwrap();
        drop(handle);

        eventually(|| *script.closed.lock().unwrap() == 1).await;
        eventually(|| store.status() == ConnectionStatus::Disconnected).await;
    }

    #[tokio::test]
    async fn background_connect_does_not_block_the_caller() {
        let store = TelemetryStore::shared(DEFAULT_CAPACITY);
        let (script, gate) = Script::gated(&[false, true], &store);
        let handle =
            ConnectionManager::new(ScriptedTransport(script.clone()), TOPIC, store.clone())
                .spawn();

        let attempt = handle.connect_in_background();
        eventually(|| store.status() == ConnectionStatus::Connecting).await;
        assert!(!attempt.is_finished());

        gate.notify_one();
        attempt.await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Disconnected);

        let retry = handle.connect_in_background();
        gate.notify_one();
        retry.await.unwrap();
        assert_eq!(store.status(), ConnectionStatus::Connected);
        assert_eq!(script.seen.lock().unwrap().len(), 2);
    }
}
