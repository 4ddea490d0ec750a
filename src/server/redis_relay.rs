// Cross-instance fan-out of change events over Redis pub/sub
use crate::server::feed::{ChangeBus, ChangeEvent};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "marketchat:conversation:";
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Instance that published the event; used to drop our own echoes.
    pub origin: String,
    pub event: ChangeEvent,
}

pub fn channel_for(event: &ChangeEvent) -> String {
    format!("{}{}", CHANNEL_PREFIX, event.conversation_id())
}

pub struct RedisRelay {
    instance_id: String,
    redis_url: String,
    publisher: Arc<Mutex<ConnectionManager>>,
}

impl RedisRelay {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client).await?;
        let instance_id = Uuid::new_v4().to_string();
        info!("[REDIS] Relay {} connected to {}", instance_id, redis_url);
        Ok(Self {
            instance_id,
            redis_url: redis_url.to_string(),
            publisher: Arc::new(Mutex::new(publisher)),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Starts both directions: local events out, remote events in.
    pub fn start(&self, bus: ChangeBus) -> (JoinHandle<()>, JoinHandle<()>) {
        (self.spawn_forwarder(bus.clone()), self.spawn_subscriber(bus))
    }

    fn spawn_forwarder(&self, bus: ChangeBus) -> JoinHandle<()> {
        let mut changes = bus.subscribe();
        let publisher = self.publisher.clone();
        let origin = self.instance_id.clone();

        tokio::spawn(async move {
            loop {
                let bus_event = match changes.recv().await {
                    Ok(e) => e,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[REDIS] Forwarder lagged, {} events not relayed", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if !bus_event.local {
                    continue;
                }

                let channel = channel_for(&bus_event.event);
                let envelope = RelayEnvelope { origin: origin.clone(), event: bus_event.event };
                let payload = match serde_json::to_string(&envelope) {
                    Ok(p) => p,
                    Err(e) => {
                        error!("[REDIS] Cannot encode event: {}", e);
                        continue;
                    }
                };

                let mut conn = publisher.lock().await;
                let published: redis::RedisResult<i64> =
                    redis::cmd("PUBLISH").arg(&channel).arg(&payload).query_async(&mut *conn).await;
                match published {
                    Ok(receivers) => debug!("[REDIS] Published on {} to {} subscribers", channel, receivers),
                    Err(e) => warn!("[REDIS] Publish on {} failed: {}", channel, e),
                }
            }
            debug!("[REDIS] Forwarder stopped");
        })
    }

    fn spawn_subscriber(&self, bus: ChangeBus) -> JoinHandle<()> {
        let redis_url = self.redis_url.clone();
        let own_origin = self.instance_id.clone();

        tokio::spawn(async move {
            info!("[REDIS] Starting pub/sub subscriber...");
            loop {
                match redis::Client::open(redis_url.as_str()) {
                    Ok(client) => match client.get_async_connection().await {
                        Ok(con) => {
                            let mut pubsub = con.into_pubsub();
                            let pattern = format!("{}*", CHANNEL_PREFIX);
                            if let Err(e) = pubsub.psubscribe(&pattern).await {
                                error!("[REDIS] psubscribe {} failed: {}", pattern, e);
                            } else {
                                info!("[REDIS] Subscribed to {}", pattern);
                                let mut stream = pubsub.on_message();
                                while let Some(msg) = stream.next().await {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(_) => continue,
                                    };
                                    match serde_json::from_str::<RelayEnvelope>(&payload) {
                                        Ok(envelope) if envelope.origin == own_origin => {}
                                        Ok(envelope) => {
                                            debug!("[REDIS] Remote change on {}", msg.get_channel_name());
                                            bus.inject_remote(envelope.event);
                                        }
                                        Err(e) => warn!("[REDIS] Ignoring malformed payload: {}", e),
                                    }
                                }
                                warn!("[REDIS] Pub/sub stream ended");
                            }
                        }
                        Err(e) => error!("[REDIS] Failed to connect for pub/sub: {}", e),
                    },
                    Err(e) => error!("[REDIS] Failed to create client: {}", e),
                }

                info!("[REDIS] Subscriber disconnected, retrying in {:?}...", RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}
