//! Cross-instance invalidation bus
//!
//! Explicit invalidations are broadcast as JSON-encoded [`InvalidationEvent`]s
//! on a single channel. Every subscriber sees every event, including the
//! instance that published it. Delivery is at-least-once and unordered;
//! handlers must be idempotent.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::CacheError;

/// Callback receiving raw channel payloads
pub type PayloadHandler = Arc<dyn Fn(String) + Send + Sync + 'static>;

/// Notification that keys matching `pattern` were evicted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Key glob, e.g. `course:*`
    pub pattern: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Instance id of the publishing engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl InvalidationEvent {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Pub/sub transport carrying invalidation payloads
#[async_trait]
pub trait InvalidationTransport: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError>;

    /// Register a handler for every payload published on `channel`.
    /// Implementations may spawn tasks, so this must run inside a tokio runtime.
    fn subscribe(&self, channel: &str, handler: PayloadHandler);
}

/// Typed view over a transport bound to one channel
#[derive(Clone)]
pub struct InvalidationBus {
    transport: Arc<dyn InvalidationTransport>,
    channel: String,
}

impl InvalidationBus {
    pub fn new(transport: Arc<dyn InvalidationTransport>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, event: &InvalidationEvent) -> Result<(), CacheError> {
        let payload = serde_json::to_string(event)?;
        self.transport.publish(&self.channel, payload).await?;
        debug!(
            channel = %self.channel,
            pattern = %event.pattern,
            reason = %event.reason,
            "Invalidation published"
        );
        Ok(())
    }

    /// Register a handler for decoded events; undecodable payloads are logged and skipped
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(InvalidationEvent) + Send + Sync + 'static,
    {
        let channel = self.channel.clone();
        self.transport.subscribe(
            &self.channel,
            Arc::new(move |payload: String| {
                match serde_json::from_str::<InvalidationEvent>(&payload) {
                    Ok(event) => handler(event),
                    Err(e) => warn!(
                        channel = %channel,
                        error = %e,
                        "Unable to decode invalidation payload: {}",
                        payload
                    ),
                }
            }),
        );
    }
}

/// In-process transport over tokio broadcast channels.
///
/// Clones share the same channels, so several engines built from clones of
/// one `LocalPubSub` behave like separate instances on a shared bus.
#[derive(Clone, Default)]
pub struct LocalPubSub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

impl LocalPubSub {
    const CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(Self::CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl InvalidationTransport for LocalPubSub {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CacheError> {
        // No live subscribers is not an error
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: PayloadHandler) {
        let mut rx = self.sender(channel).subscribe();
        let channel = channel.to_owned();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => handler(payload),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Invalidation subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
