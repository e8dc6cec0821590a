use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, Incoming, Outgoing, QoS, SubAck,
    SubscribeReasonCode,
};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tracing::{debug, info};

use crate::{
    connection::{ConnectError, Transport},
    ingest::LinkEvent,
    util::{config::MqttSettings, mqtt_options},
};

/// How long a closing session may take to flush its DISCONNECT packet.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        MqttTransport { settings }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
}

impl Transport for MqttTransport {
    type Session = MqttSession;

    async fn open(
        &self,
        topic: &str,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<MqttSession, ConnectError> {
        info!("Connecting to MQTT broker {}", self.settings.broker());

        let options = mqtt_options(&self.settings, &self.settings.client_id);
        let (client, eventloop) = AsyncClient::new(options, 10);
        client.subscribe(topic, QoS::AtLeastOnce).await?;

        let connect_timeout = self.settings.connect_timeout;
        let eventloop = timeout(connect_timeout, wait_for_subscription(eventloop, topic))
            .await
            .map_err(|_| ConnectError::Timeout(connect_timeout))??;

        let pump = tokio::spawn(forward_events(eventloop, events));
        Ok(MqttSession { client, pump })
    }

    async fn close(&self, session: MqttSession) {
        let MqttSession { client, mut pump } = session;

        if let Err(err) = client.disconnect().await {
            debug!("MQTT disconnect request failed: {:?}", err);
        }

        if timeout(CLOSE_GRACE, &mut pump).await.is_err() {
            pump.abort();
        }
    }
}

async fn wait_for_subscription(
    mut eventloop: EventLoop,
    topic: &str,
) -> Result<EventLoop, ConnectError> {
    loop {
        let event = match eventloop.poll().await {
            Ok(event) => event,
            // rumqttc reports a non-success CONNACK as an error, not an event.
            Err(rumqttc::ConnectionError::ConnectionRefused(code)) => {
                return Err(ConnectError::Refused(code));
            }
            Err(err) => return Err(err.into()),
        };

        match event {
            Event::Incoming(Incoming::ConnAck(ConnAck {
                code: ConnectReturnCode::Success,
                ..
            })) => {
                info!("MQTT connected");
            }
            Event::Incoming(Incoming::ConnAck(ConnAck { code, .. })) => {
                return Err(ConnectError::Refused(code));
            }
            Event::Incoming(Incoming::SubAck(SubAck { return_codes, .. })) => {
                if return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    return Err(ConnectError::SubscribeRejected(topic.to_string()));
                }
                return Ok(eventloop);
            }
            event => {
                debug!("MQTT event: {:?}", event);
            }
        }
    }
}

/// Polls the event loop after the handshake, forwarding publishes until the
/// connection fails or the session is closed.
async fn forward_events(mut eventloop: EventLoop, events: mpsc::Sender<LinkEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = LinkEvent::Message(publish.payload.to_vec());
                if events.send(message).await.is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(event) => {
                debug!("MQTT event: {:?}", event);
            }
            Err(err) => {
                // Stop polling: the event loop would otherwise reconnect by
                // itself, and recovery is an explicit operator action.
                let _ = events.send(LinkEvent::Dropped(err.to_string())).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    const TOPIC: &str = "application/1/device/9fb27692fb0c2381/event/up";

    fn settings(port: u16, connect_timeout: Duration) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            username: None,
            password: None,
            client_id: "energy-monitor-test".to_string(),
            keep_alive: Duration::from_secs(60),
            connect_timeout,
            topic: TOPIC.to_string(),
        }
    }

    /// Binds a local listener and hands the first accepted socket to `broker`.
    async fn fake_broker<F, Fut>(broker: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            broker(socket).await;
        });
        port
    }

    /// Reads one MQTT control packet, returning its first byte and body.
    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let kind = socket.read_u8().await.unwrap();
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.unwrap();
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        socket.read_exact(&mut body).await.unwrap();
        (kind, body)
    }

    /// Answers CONNECT with `connack_code` and SUBSCRIBE with `suback_code`.
    async fn handshake(socket: &mut TcpStream, connack_code: u8, suback_code: u8) {
        let (kind, _) = read_packet(socket).await;
        assert_eq!(kind, 0x10);
        socket.write_all(&[0x20, 0x02, 0x00, connack_code]).await.unwrap();

        let (kind, body) = read_packet(socket).await;
        assert_eq!(kind, 0x82);
        socket
            .write_all(&[0x90, 0x03, body[0], body[1], suback_code])
            .await
            .unwrap();
    }

    async fn open(port: u16, connect_timeout: Duration) -> Result<MqttSession, ConnectError> {
        let (events, _) = mpsc::channel(4);
        MqttTransport::new(settings(port, connect_timeout))
            .open(TOPIC, events)
            .await
    }

    #[tokio::test]
    async fn silent_broker_times_out() {
        let port = fake_broker(|socket| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        })
        .await;

        let started = tokio::time::Instant::now();
        let result = open(port, Duration::from_millis(300)).await;

        assert!(matches!(result, Err(ConnectError::Timeout(t)) if t == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn refused_connack_is_reported() {
        let port = fake_broker(|mut socket| async move {
            let (kind, _) = read_packet(&mut socket).await;
            assert_eq!(kind, 0x10);
            socket.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
            let _ = socket.read_u8().await;
        })
        .await;

        let result = open(port, Duration::from_secs(3)).await;

        assert!(matches!(
            result,
            Err(ConnectError::Refused(ConnectReturnCode::NotAuthorized))
        ));
    }

    #[tokio::test]
    async fn rejected_subscription_is_reported() {
        let port = fake_broker(|mut socket| async move {
            handshake(&mut socket, 0x00, 0x80).await;
            let _ = socket.read_u8().await;
        })
        .await;

        let result = open(port, Duration::from_secs(3)).await;

        assert!(matches!(result, Err(ConnectError::SubscribeRejected(topic)) if topic == TOPIC));
    }

    #[tokio::test]
    async fn publishes_are_forwarded_until_close() {
        let port = fake_broker(|mut socket| async move {
            handshake(&mut socket, 0x00, 0x01).await;

            let payload = br#"{"object": {"power": 5}}"#;
            let mut publish = vec![0x30, (2 + TOPIC.len() + payload.len()) as u8];
            publish.extend_from_slice(&(TOPIC.len() as u16).to_be_bytes());
            publish.extend_from_slice(TOPIC.as_bytes());
            publish.extend_from_slice(payload);
            socket.write_all(&publish).await.unwrap();

            let (kind, _) = read_packet(&mut socket).await;
            assert_eq!(kind, 0xe0);
        })
        .await;

        let transport = MqttTransport::new(settings(port, Duration::from_secs(3)));
        let (events, mut received) = mpsc::channel(4);
        let session = transport.open(TOPIC, events).await.unwrap();

        match timeout(Duration::from_secs(3), received.recv()).await {
            Ok(Some(LinkEvent::Message(payload))) => {
                assert_eq!(payload, br#"{"object": {"power": 5}}"#.to_vec());
            }
            other => panic!("expected a forwarded publish, got {:?}", other),
        }

        transport.close(session).await;
        assert!(received.recv().await.is_none());
    }
}
