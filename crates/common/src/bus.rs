//! MQTT connection owned by one service.
//!
//! [`BusConnection::connect`] blocks until the broker acknowledges the first
//! connection, then hands the event loop to a pump task.  The pump forwards
//! every publish to the service as a [`BusEvent`] and re-subscribes after
//! each reconnect, so the service only ever sees one ordered stream.

use crate::settings::MqttSettings;
use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

pub struct BusConnection {
    pub client: AsyncClient,
    pub events: mpsc::UnboundedReceiver<BusEvent>,
    pump: JoinHandle<()>,
    name: String,
}

impl BusConnection {
    pub async fn connect(
        client_id: &str,
        settings: &MqttSettings,
        subscriptions: &[String],
    ) -> Result<Self> {
        let mut opts = MqttOptions::new(client_id, &settings.host, settings.port);
        opts.set_keep_alive(settings.keep_alive);
        let (client, mut eventloop) = AsyncClient::new(opts, settings.capacity);

        tokio::time::timeout(settings.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| anyhow!("no CONNACK within {:?}", settings.connect_timeout))
            .and_then(|r| r)
            .with_context(|| {
                format!(
                    "{client_id}: cannot connect to mqtt broker at {}:{}",
                    settings.host, settings.port
                )
            })?;
        info!(client = %client_id, host = %settings.host, port = settings.port, "connected to mqtt broker");

        for topic in subscriptions {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .with_context(|| format!("{client_id}: subscribe {topic}"))?;
        }

        let (tx, events) = mpsc::unbounded_channel();
        let _ = tx.send(BusEvent::Connected);
        let pump = tokio::spawn(pump(
            client_id.to_string(),
            client.clone(),
            eventloop,
            subscriptions.to_vec(),
            tx,
        ));

        Ok(Self {
            client,
            events,
            pump,
            name: client_id.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send DISCONNECT and wait briefly for the pump to flush it.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(client = %self.name, "disconnect request failed: {e}");
        }
        let mut pump = self.pump;
        if tokio::time::timeout(RETRY_DELAY, &mut pump).await.is_err() {
            pump.abort();
        }
        info!(client = %self.name, "mqtt client stopped");
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

async fn pump(
    name: String,
    client: AsyncClient,
    mut eventloop: EventLoop,
    subscriptions: Vec<String>,
    tx: mpsc::UnboundedSender<BusEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let event = BusEvent::Message {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                };
                if tx.send(event).is_err() {
                    debug!(client = %name, "event receiver dropped, stopping pump");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(client = %name, "reconnected to mqtt broker");
                for topic in &subscriptions {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(client = %name, topic = %topic, "resubscribe failed: {e}");
                    }
                }
                let _ = tx.send(BusEvent::Connected);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!(client = %name, "broker sent disconnect");
                let _ = tx.send(BusEvent::Disconnected);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(client = %name, "mqtt error: {e}. reconnecting...");
                let _ = tx.send(BusEvent::Disconnected);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
