use crate::configuration::Configuration;
use crate::error::PublishError;
use log::{debug, trace};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::time::timeout;

/// One MQTT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl Message {
    /// Creates a retained message
    pub fn retained<T: Into<String>, P: Into<String>>(topic: T, payload: P) -> Message {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }
}

/// Sends messages to an MQTT broker
#[allow(async_fn_in_trait)]
pub trait Publisher {
    /// Publishes all the messages, in order
    async fn publish_many(&self, messages: &[Message]) -> Result<(), PublishError>;

    /// Publishes a single message
    async fn publish(&self, message: Message) -> Result<(), PublishError> {
        self.publish_many(std::slice::from_ref(&message)).await
    }
}

/// Publisher that opens a new MQTT session for every call
///
/// Each call connects, publishes with QoS 1, waits for every acknowledgement and disconnects.
/// The whole exchange is bounded by a timeout.
pub struct MqttPublisher {
    options: MqttOptions,
    timeout: Duration,
}

impl MqttPublisher {
    /// Constructs a publisher from the specified configuration
    ///
    /// ```
    /// use apcupsd_mqtt::{Configuration, MqttPublisher};
    ///
    /// let config = Configuration::load("conf/apcupsd-mqtt.conf").expect("Cannot load configuration");
    /// let publisher = MqttPublisher::new(&config);
    ///
    /// assert_eq!(publisher.broker(), (String::from("localhost"), 1883));
    /// ```
    pub fn new(config: &Configuration) -> MqttPublisher {
        let mqtt = &config.mqtt;
        let mut options = MqttOptions::new(&mqtt.client_id, &mqtt.host, mqtt.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_max_packet_size(64 * 1024, 64 * 1024);
        if !mqtt.user.is_empty() {
            options.set_credentials(&mqtt.user, &mqtt.password);
        }

        MqttPublisher {
            options,
            timeout: config.mqtt_timeout(),
        }
    }

    /// Host and port of the broker
    pub fn broker(&self) -> (String, u16) {
        self.options.broker_address()
    }

    async fn send(&self, messages: &[Message]) -> Result<(), PublishError> {
        let (client, mut event_loop) = AsyncClient::new(self.options.clone(), messages.len() + 1);

        for message in messages {
            debug!("Publishing to topic {} : {}", message.topic, message.payload);
            client
                .publish(
                    &message.topic,
                    QoS::AtLeastOnce,
                    message.retain,
                    message.payload.as_bytes(),
                )
                .await?;
        }

        let mut pending = messages.len();
        while pending > 0 {
            let notification = event_loop.poll().await?;
            trace!("MQTT notification received: {notification:?}");
            if let Event::Incoming(Packet::PubAck(_)) = notification {
                pending -= 1;
            }
        }

        client.disconnect().await?;
        // Flushes the DISCONNECT packet, the broker may close the socket right after
        while let Ok(notification) = event_loop.poll().await {
            trace!("MQTT notification received: {notification:?}");
            if let Event::Outgoing(rumqttc::Outgoing::Disconnect) = notification {
                break;
            }
        }

        Ok(())
    }
}

impl Publisher for MqttPublisher {
    async fn publish_many(&self, messages: &[Message]) -> Result<(), PublishError> {
        if messages.is_empty() {
            return Ok(());
        }

        timeout(self.timeout, self.send(messages))
            .await
            .map_err(|_| PublishError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Publish received by [`serve_session`]: topic, payload, retain and QoS
    type Received = (String, String, bool, u8);

    /// Reads one MQTT packet: the first header byte and the variable part
    async fn read_packet(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = socket.read_u8().await.ok()?;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.ok()?;
            length |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        socket.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    /// Serves one MQTT session: accepts the connection and acknowledges every publish
    async fn serve_session(listener: TcpListener) -> Vec<Received> {
        let (mut socket, _) = listener.accept().await.expect("Cannot accept");
        let mut received = Vec::new();

        while let Some((header, body)) = read_packet(&mut socket).await {
            match header >> 4 {
                // CONNECT
                1 => socket
                    .write_all(&[0x20, 0x02, 0x00, 0x00])
                    .await
                    .expect("Cannot send CONNACK"),
                // PUBLISH
                3 => {
                    let qos = (header >> 1) & 0x03;
                    let end = 2 + usize::from(u16::from_be_bytes([body[0], body[1]]));
                    let topic = String::from_utf8_lossy(&body[2..end]).to_string();
                    let payload = String::from_utf8_lossy(&body[end + 2..]).to_string();
                    received.push((topic, payload, header & 0x01 == 1, qos));
                    socket
                        .write_all(&[0x40, 0x02, body[end], body[end + 1]])
                        .await
                        .expect("Cannot send PUBACK");
                }
                // DISCONNECT
                14 => {
                    received.push((String::from("DISCONNECT"), String::new(), false, 0));
                    break;
                }
                _ => {}
            }
        }

        received
    }

    fn config(port: u16, user: &str) -> Configuration {
        let mut config = Configuration::builtin().expect("Cannot load built-in configuration");
        config.mqtt.host = String::from("127.0.0.1");
        config.mqtt.port = port;
        config.mqtt.user = user.to_string();
        config.mqtt.timeout = 0.5;
        config
    }

    #[test]
    fn test_credentials() {
        let publisher = MqttPublisher::new(&config(1883, ""));
        assert!(publisher.options.credentials().is_none());

        let mut conf = config(1883, "ups");
        conf.mqtt.password = String::from("secret");
        let publisher = MqttPublisher::new(&conf);
        assert!(publisher.options.credentials().is_some());
    }

    #[tokio::test]
    async fn test_nothing_to_publish() {
        // Nothing listens on this port, an empty batch must not connect
        let publisher = MqttPublisher::new(&config(1, ""));
        assert!(publisher.publish_many(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_many() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Cannot bind");
        let port = listener.local_addr().expect("No local address").port();
        let server = tokio::spawn(serve_session(listener));

        let mut conf = config(port, "");
        conf.mqtt.timeout = 5.0;
        let publisher = MqttPublisher::new(&conf);
        let messages = [
            Message::retained("apcupsd/ups1", "{\"status\":\"ONLINE\"}"),
            Message {
                topic: String::from("apcupsd/ups1/status"),
                payload: String::from("online"),
                retain: false,
            },
        ];

        let result = publisher.publish_many(&messages).await;
        let received = server.await.expect("Broker task failed");

        assert!(result.is_ok());
        assert_eq!(
            received,
            [
                (
                    String::from("apcupsd/ups1"),
                    String::from("{\"status\":\"ONLINE\"}"),
                    true,
                    1
                ),
                (
                    String::from("apcupsd/ups1/status"),
                    String::from("online"),
                    false,
                    1
                ),
                (String::from("DISCONNECT"), String::new(), false, 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Cannot bind");
        let port = listener.local_addr().expect("No local address").port();
        drop(listener);

        let publisher = MqttPublisher::new(&config(port, ""));
        let result = publisher
            .publish(Message::retained("apcupsd/test/status", "online"))
            .await;

        assert!(matches!(result, Err(PublishError::Connection(_))));
    }

    #[tokio::test]
    async fn test_silent_broker_times_out() {
        // Accepts the connection but never answers the CONNECT packet
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Cannot bind");
        let port = listener.local_addr().expect("No local address").port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("Cannot accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let publisher = MqttPublisher::new(&config(port, ""));
        let result = publisher
            .publish(Message::retained("apcupsd/test/status", "online"))
            .await;

        assert!(matches!(result, Err(PublishError::Timeout(_))));
        server.abort();
    }
}
