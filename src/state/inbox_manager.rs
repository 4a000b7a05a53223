//! Inbox manager state
//!
//! Keeps one running coordinator per local identity and tracks which one the
//! user is currently looking at.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::backend::{FileStorage, InboxBackend};
use crate::config::InboxConfig;
use crate::sync::engine::InboxCoordinator;
use crate::types::InboxError;

/// Registry of inboxes keyed by identity
pub struct InboxManager {
    config: InboxConfig,
    inboxes: RwLock<HashMap<String, Arc<InboxCoordinator>>>,
    active: RwLock<Option<String>>,
}

impl InboxManager {
    pub fn new(config: InboxConfig) -> Self {
        Self {
            config,
            inboxes: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &InboxConfig {
        &self.config
    }

    /// Get the inbox for the backend's identity, creating and starting it if needed
    ///
    /// The first inbox created becomes the active one.
    pub async fn get_or_create(
        &self,
        backend: Arc<dyn InboxBackend>,
        storage: Option<Arc<dyn FileStorage>>,
    ) -> Result<Arc<InboxCoordinator>, InboxError> {
        let identity = backend.identity().to_string();
        {
            let inboxes = self.inboxes.read().await;
            if let Some(inbox) = inboxes.get(&identity) {
                return Ok(inbox.clone());
            }
        }

        let mut inboxes = self.inboxes.write().await;
        // Another caller may have created it while we waited for the lock
        if let Some(inbox) = inboxes.get(&identity) {
            return Ok(inbox.clone());
        }

        info!("Creating inbox for identity: {}", identity);
        let mut coordinator = InboxCoordinator::new(backend, self.config.clone())?;
        if let Some(storage) = storage {
            coordinator = coordinator.with_storage(storage);
        }
        let coordinator = Arc::new(coordinator);
        coordinator.start()?;
        inboxes.insert(identity.clone(), coordinator.clone());
        drop(inboxes);

        let mut active = self.active.write().await;
        if active.is_none() {
            *active = Some(identity);
        }
        Ok(coordinator)
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<InboxCoordinator>> {
        self.inboxes.read().await.get(identity).cloned()
    }

    pub async fn active(&self) -> Option<Arc<InboxCoordinator>> {
        let identity = self.active.read().await.clone()?;
        self.get(&identity).await
    }

    pub async fn active_identity(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Make another registered identity the active one
    pub async fn switch_active(&self, identity: &str) -> Result<Arc<InboxCoordinator>, InboxError> {
        let inbox = self
            .get(identity)
            .await
            .ok_or_else(|| InboxError::InvalidInput(format!("no inbox for identity {}", identity)))?;
        info!("Switching active inbox to {}", identity);
        *self.active.write().await = Some(identity.to_string());
        Ok(inbox)
    }

    /// Shut down and forget an inbox
    pub async fn remove(&self, identity: &str) -> bool {
        let removed = self.inboxes.write().await.remove(identity);
        let Some(inbox) = removed else {
            return false;
        };
        inbox.shutdown().await;

        let mut active = self.active.write().await;
        if active.as_deref() == Some(identity) {
            let mut remaining: Vec<String> = self.inboxes.read().await.keys().cloned().collect();
            remaining.sort();
            *active = remaining.into_iter().next();
        }
        info!("Removed inbox for identity: {}", identity);
        true
    }

    pub async fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.inboxes.read().await.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub async fn shutdown_all(&self) {
        let inboxes: Vec<Arc<InboxCoordinator>> =
            self.inboxes.write().await.drain().map(|(_, inbox)| inbox).collect();
        for inbox in inboxes {
            inbox.shutdown().await;
        }
        *self.active.write().await = None;
    }
}
