use std::time::Duration;
use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::config::MqttConfig;
use crate::error::BridgeError;
use crate::registry::Publisher;

/// Requests buffered between the client handle and the event loop
const CLIENT_CAPACITY: usize = 64;

/// One inbound publish
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn client(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    AsyncClient::new(options, CLIENT_CAPACITY)
}

fn subscribe(client: &AsyncClient, subscription: &str) {
    match client.try_subscribe(subscription, QoS::AtLeastOnce) {
        Ok(()) => tracing::info!("Subscribed to {}", subscription),
        Err(e) => tracing::error!("Failed to subscribe to {}: {}", subscription, e),
    }
}

/// Drive the event loop until the broker accepts the connection, then
/// subscribe. Any error here is fatal to startup.
pub async fn connect(client: &AsyncClient, eventloop: &mut EventLoop, subscription: &str) -> Result<()> {
    loop {
        let event = eventloop
            .poll()
            .await
            .context("Failed to connect to MQTT broker")?;
        if let Event::Incoming(Packet::ConnAck(ack)) = event {
            tracing::info!("Connected to MQTT broker ({:?})", ack.code);
            break;
        }
    }
    subscribe(client, subscription);
    Ok(())
}

/// Poll the bus and forward every publish to the bridge manager. Reconnects
/// are handled by the event loop itself; the subscription is renewed on each
/// new session.
pub async fn run_subscriber(
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscription: String,
    tx: mpsc::Sender<BusMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(message).await.is_err() {
                        tracing::info!("Bridge manager gone, stopping subscriber");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("Reconnected to MQTT broker");
                    subscribe(&client, &subscription);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("MQTT connection error: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            _ = cancel.cancelled() => {
                if client.try_disconnect().is_ok() {
                    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
                        while let Ok(event) = eventloop.poll().await {
                            if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                                break;
                            }
                        }
                    })
                    .await;
                    if flushed.is_err() {
                        tracing::debug!("Timed out sending MQTT disconnect");
                    }
                }
                tracing::info!("MQTT subscriber shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Retained, at the highest delivery tier. Never waits on the broker: the
/// request is queued for the event loop and a full queue is an error.
impl Publisher for AsyncClient {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BridgeError> {
        self.try_publish(topic, QoS::ExactlyOnce, true, payload)
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }
}
