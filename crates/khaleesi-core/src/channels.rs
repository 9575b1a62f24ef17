// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reusable client channels to peer services.
//!
//! Peers are addressed by cluster DNS as `http://<service>.<gate>:<port>`. Channels
//! connect lazily, so creating one never blocks on the network.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::error::{KhaleesiError, Result};

/// Memoized channels keyed by `(gate, service)`.
#[derive(Debug)]
pub struct ChannelManager {
    port: u16,
    channels: Mutex<HashMap<(String, String), Channel>>,
}

impl ChannelManager {
    /// Create a manager reaching peers on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Get the channel to `service` in `gate`, creating it on first use.
    pub async fn get_channel(&self, gate: &str, service: &str) -> Result<Channel> {
        let mut channels = self.channels.lock().await;
        let key = (gate.to_string(), service.to_string());
        if let Some(channel) = channels.get(&key) {
            return Ok(channel.clone());
        }

        let target = format!("http://{}.{}:{}", service, gate, self.port);
        let channel = Endpoint::from_shared(target.clone())
            .map_err(|e| {
                KhaleesiError::invalid_argument(
                    "",
                    "Invalid channel target",
                    format!("{}: {}", target, e),
                )
            })?
            .connect_lazy();

        debug!(%target, "Created channel");
        channels.insert(key, channel.clone());
        Ok(channel)
    }

    /// Register an already-built channel, replacing any existing one.
    pub async fn insert_channel(&self, gate: &str, service: &str, channel: Channel) {
        self.channels
            .lock()
            .await
            .insert((gate.to_string(), service.to_string()), channel);
    }

    /// Drop every channel. Connections close once in-flight calls release their clones.
    ///
    /// Idempotent; returns the number of channels closed.
    pub async fn close_all_channels(&self) -> usize {
        let mut channels = self.channels.lock().await;
        let closed = channels.len();
        channels.clear();
        if closed > 0 {
            info!(closed, "Closed all channels");
        }
        closed
    }

    /// Number of open channels.
    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Whether no channel is open.
    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channels_are_memoized() {
        let manager = ChannelManager::new(8000);

        manager.get_channel("core", "sawmill").await.unwrap();
        manager.get_channel("core", "sawmill").await.unwrap();
        manager.get_channel("gw", "front").await.unwrap();

        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_close_all_channels_is_idempotent() {
        let manager = ChannelManager::new(8000);
        manager.get_channel("core", "sawmill").await.unwrap();

        assert_eq!(manager.close_all_channels().await, 1);
        assert_eq!(manager.close_all_channels().await, 0);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let manager = ChannelManager::new(8000);
        let err = manager.get_channel("bad gate", "svc").await.unwrap_err();
        assert_eq!(err.status, tonic::Code::InvalidArgument);
    }
}
