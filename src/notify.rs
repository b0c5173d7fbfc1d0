use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// What a confirmed booking tells the outside world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub reservation_id: Ulid,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub user_handle: String,
    pub start: Ms,
}

#[derive(Debug)]
pub enum NotifyError {
    Io(String),
    Rejected(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Io(e) => write!(f, "notification I/O error: {e}"),
            NotifyError::Rejected(e) => write!(f, "notification rejected: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Delivery of booking confirmations. Best effort: the allocator never
/// waits on it.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, confirmation: &Confirmation) -> Result<(), NotifyError>;
}

/// Broadcast hub for confirmations per game.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Confirmation>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to confirmations for a game. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Confirmation> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a confirmation. No-op if nobody is listening.
    pub fn send(&self, confirmation: &Confirmation) {
        if let Some(sender) = self.channels.get(&confirmation.resource_id) {
            let _ = sender.send(confirmation.clone());
        }
    }
}

#[async_trait]
impl NotificationSink for NotifyHub {
    async fn notify(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        self.send(confirmation);
        Ok(())
    }
}

/// Delivers to every sink; reports the first failure after trying them all.
pub struct Fanout {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Fanout {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for Fanout {
    async fn notify(&self, confirmation: &Confirmation) -> Result<(), NotifyError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(confirmation).await {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
