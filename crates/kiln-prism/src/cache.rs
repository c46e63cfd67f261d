//! Process-wide cache of Prism clients.
//!
//! Clients are keyed by [`PrismEndpoint::fingerprint`] so every build that
//! targets the same Prism Central shares one connection pool. The cache must
//! be torn down explicitly when the process is done with it.

use crate::client::PrismClient;
use crate::config::PrismEndpoint;
use crate::error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared, keyed set of [`PrismClient`]s.
#[derive(Default)]
pub struct ClientCache {
    clients: Mutex<HashMap<String, Arc<PrismClient>>>,
}

impl ClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for `endpoint`, creating it on first use.
    pub async fn get_or_create(&self, endpoint: &PrismEndpoint) -> Result<Arc<PrismClient>> {
        let key = endpoint.fingerprint();
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            tracing::trace!(key = %key, "Reusing cached Prism client");
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(PrismClient::new(endpoint)?);
        clients.insert(key.clone(), Arc::clone(&client));
        tracing::debug!(key = %key, cached = clients.len(), "Cached new Prism client");
        Ok(client)
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Drop every cached client.
    pub async fn teardown(&self) {
        let mut clients = self.clients.lock().await;
        let count = clients.len();
        clients.clear();
        tracing::info!(count, "Prism client cache torn down");
    }
}
