//! Redis pub/sub transport
//!
//! One dedicated pub/sub connection per engine, driven by a background thread
//! with its own current-thread runtime so message dispatch never competes with
//! request handling. Channels are subscribed with exponential backoff, and a
//! periodic PING health check re-establishes the connection and every
//! subscription after Redis restarts. Publishing goes over the regular
//! multiplexed connection.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::StreamExt;
use redis::{AsyncCommands, aio::ConnectionManager};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::{CacheError, InvalidationTransport, PayloadHandler};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const SUBSCRIBE_ATTEMPTS: u32 = 5;

enum ControlMsg {
    Register {
        channel: String,
        handler: PayloadHandler,
    },
}

/// [`InvalidationTransport`] over Redis PUBLISH/SUBSCRIBE
pub struct RedisPubSub {
    publisher: ConnectionManager,
    tx: mpsc::UnboundedSender<ControlMsg>,
    shutdown_flag: Arc<AtomicBool>,
}

impl RedisPubSub {
    pub async fn new(client: redis::Client) -> Result<Self, CacheError> {
        let publisher = ConnectionManager::new(client.clone()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown_flag);
        thread::Builder::new()
            .name("cache-pubsub".to_owned())
            .spawn(move || match Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt.block_on(run_hub(client, rx, flag)),
                Err(e) => error!("PubSubHub: failed to build dedicated runtime: {}", e),
            })
            .map_err(CacheError::backend)?;

        Ok(Self {
            publisher,
            tx,
            shutdown_flag,
        })
    }

    /// Signal the hub thread to stop after its current poll
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }
}

impl Drop for RedisPubSub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl InvalidationTransport for RedisPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: PayloadHandler) {
        if self
            .tx
            .send(ControlMsg::Register {
                channel: channel.to_owned(),
                handler,
            })
            .is_err()
        {
            warn!(channel = channel, "PubSubHub: hub stopped, subscription ignored");
        }
    }
}

async fn subscribe_with_backoff(pubsub: &mut redis::aio::PubSub, channel: &str) -> bool {
    let mut delay_ms = 100u64;
    for attempt in 1..=SUBSCRIBE_ATTEMPTS {
        match pubsub.subscribe(channel).await {
            Ok(()) => {
                debug!("PubSubHub: subscribed to channel {}", channel);
                return true;
            }
            Err(e) => {
                warn!(
                    "PubSubHub: subscribe attempt {} failed for {}: {}",
                    attempt, channel, e
                );
                if attempt < SUBSCRIBE_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = delay_ms.saturating_mul(2).min(2000);
                }
            }
        }
    }
    warn!(
        "PubSubHub: initial subscribe failed for channel {} after {} attempts, will retry during health check",
        channel, SUBSCRIBE_ATTEMPTS
    );
    false
}

async fn connection_healthy(client: &redis::Client) -> bool {
    match ConnectionManager::new(client.clone()).await {
        Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => true,
            Err(e) => {
                warn!("PubSubHub: PING failed ({}); attempting reconnection", e);
                false
            }
        },
        Err(e) => {
            warn!(
                "PubSubHub: could not create connection manager for health check: {}",
                e
            );
            false
        }
    }
}

async fn run_hub(
    client: redis::Client,
    mut rx: mpsc::UnboundedReceiver<ControlMsg>,
    shutdown: Arc<AtomicBool>,
) {
    let mut pubsub = match client.get_async_pubsub().await {
        Ok(c) => c,
        Err(e) => {
            error!("PubSubHub: failed to create Redis pubsub connection: {}", e);
            return;
        }
    };

    let mut handlers: HashMap<String, Vec<PayloadHandler>> = HashMap::new();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut last_health_check = Instant::now();

    while !shutdown.load(Ordering::SeqCst) {
        while let Ok(ControlMsg::Register { channel, handler }) = rx.try_recv() {
            handlers.entry(channel.clone()).or_default().push(handler);
            if !subscribed.contains(&channel) && subscribe_with_backoff(&mut pubsub, &channel).await
            {
                subscribed.insert(channel);
            }
        }

        if last_health_check.elapsed() >= HEALTH_INTERVAL {
            last_health_check = Instant::now();

            if !connection_healthy(&client).await {
                match client.get_async_pubsub().await {
                    Ok(fresh) => {
                        pubsub = fresh;
                        // A new connection starts without subscriptions
                        subscribed.clear();
                    }
                    Err(e) => error!("PubSubHub: reconnection failed: {}", e),
                }
            }

            let pending: Vec<String> = handlers
                .keys()
                .filter(|ch| !subscribed.contains(*ch))
                .cloned()
                .collect();
            for channel in pending {
                match pubsub.subscribe(&channel).await {
                    Ok(()) => {
                        debug!("PubSubHub: subscribed to channel {}", channel);
                        subscribed.insert(channel);
                    }
                    Err(e) => warn!(
                        "PubSubHub: health check failed to subscribe to {}: {}",
                        channel, e
                    ),
                }
            }
        }

        let msg = match tokio::time::timeout(POLL_INTERVAL, pubsub.on_message().next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                // Stream ended; the health check reconnects
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            Err(_) => continue,
        };
        match msg.get_payload::<String>() {
            Ok(payload) => {
                let channel = msg.get_channel_name();
                match handlers.get(channel) {
                    Some(listeners) => {
                        for handler in listeners {
                            handler(payload.clone());
                        }
                    }
                    None => debug!("PubSubHub: no listeners for channel {}", channel),
                }
            }
            Err(e) => warn!("PubSubHub: failed to decode pub/sub payload: {}", e),
        }
    }
    debug!("PubSubHub: shut down");
}
