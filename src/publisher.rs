use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::samples::{Batch, Fields};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_derive::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget message bus.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Hands the message over without waiting for delivery.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// MQTT connection whose event loop runs on its own task.
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Connects and waits for the broker's acknowledgement, so a wrong host
    /// fails at startup rather than silently later.
    pub async fn connect(
        config: &PublisherConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>), PublishError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        info!(host = %config.host, port = config.port, "connecting to MQTT broker");
        let connack = timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => break Ok(()),
                    Ok(_) => {}
                    Err(e) => break Err(e),
                }
            }
        })
        .await;
        match connack {
            Ok(Ok(())) => info!("MQTT broker connected"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(PublishError::ConnectTimeout(CONNECT_TIMEOUT)),
        }

        let handle = tokio::spawn(drive_event_loop(eventloop, cancel));
        Ok((Self { client }, handle))
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(event) => debug!(?event, "mqtt event"),
                Err(e) => {
                    // rumqttc reconnects on the next poll, don't spin meanwhile.
                    warn!(error = %e, "MQTT connection error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            },
        }
    }
    info!("MQTT event loop exiting");
}

#[async_trait]
impl PubSubBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct Payload<'a> {
    timestamp: DateTime<Utc>,
    fields: &'a Fields,
}

/// Topic and JSON payload for every sample of a batch.
pub fn messages(prefix: &str, batch: &Batch) -> Result<Vec<(String, Vec<u8>)>, PublishError> {
    let raw = batch
        .raw
        .iter()
        .map(|s| (format!("{prefix}/meter/{}", s.meter), &s.fields));
    let derived = batch
        .derived
        .iter()
        .map(|s| (format!("{prefix}/derived/{}", s.name), &s.fields));

    raw.chain(derived)
        .map(|(topic, fields)| {
            let payload = serde_json::to_vec(&Payload {
                timestamp: batch.timestamp,
                fields,
            })?;
            Ok((topic, payload))
        })
        .collect()
}

/// Periodically republishes the most recent batch.
pub struct Publisher {
    bus: Arc<dyn PubSubBus>,
    topic_prefix: String,
    interval: Duration,
}

impl Publisher {
    pub fn new(bus: Arc<dyn PubSubBus>, topic_prefix: String, interval: Duration) -> Self {
        Self {
            bus,
            topic_prefix,
            interval,
        }
    }

    pub async fn run(
        self,
        latest: watch::Receiver<Option<Arc<Batch>>>,
        cancel: CancellationToken,
    ) {
        info!(interval = ?self.interval, prefix = %self.topic_prefix, "starting publisher");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = latest.borrow().clone();
                    match snapshot {
                        Some(batch) => self.publish_batch(&batch).await,
                        None => debug!("nothing to publish yet"),
                    }
                }
            }
        }
        info!("publisher exiting");
    }

    async fn publish_batch(&self, batch: &Batch) {
        let messages = match messages(&self.topic_prefix, batch) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "couldn't encode batch for publishing");
                return;
            }
        };
        for (topic, payload) in messages {
            if let Err(e) = self.bus.publish(&topic, payload).await {
                warn!(%topic, error = %e, "publish failed");
            }
        }
    }
}
