//! Committed offset queries against cluster metadata.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::group::{AdminConnector, ClusterAdmin};
use crate::error::{MqError, Result};

/// Looks up a group's committed offsets, reusing one admin handle.
pub struct OffsetLookup {
    connector: Arc<dyn AdminConnector>,
    admin: Mutex<Option<Arc<dyn ClusterAdmin>>>,
}

impl OffsetLookup {
    pub fn new(connector: Arc<dyn AdminConnector>) -> Self {
        Self {
            connector,
            admin: Mutex::new(None),
        }
    }

    /// Committed offset of `group` on `topic`/`partition`.
    ///
    /// A failed query drops the cached admin handle so the next call
    /// reconnects.
    #[instrument(skip(self))]
    pub async fn committed_offset(&self, topic: &str, group: &str, partition: i32) -> Result<i64> {
        let admin = self.admin().await?;

        match admin.committed_offset(group, topic, partition).await {
            Ok(Some(offset)) => Ok(offset),
            Ok(None) => Err(MqError::OffsetUnavailable {
                topic: topic.to_string(),
                group: group.to_string(),
                partition,
            }),
            Err(e) => {
                warn!(error = %e, "Offset lookup failed, dropping admin client");
                self.discard(&admin).await;
                Err(e)
            }
        }
    }

    async fn admin(&self) -> Result<Arc<dyn ClusterAdmin>> {
        let mut slot = self.admin.lock().await;
        if let Some(admin) = slot.as_ref() {
            return Ok(admin.clone());
        }

        let admin = self.connector.connect().await?;
        debug!("Admin client created");
        *slot = Some(admin.clone());
        Ok(admin)
    }

    async fn discard(&self, failed: &Arc<dyn ClusterAdmin>) {
        let mut slot = self.admin.lock().await;
        let cached = slot
            .as_ref()
            .map_or(false, |admin| Arc::ptr_eq(admin, failed));
        if cached {
            *slot = None;
        }
        drop(slot);

        if let Err(e) = failed.close().await {
            debug!(error = %e, "Closing failed admin client");
        }
    }

    pub async fn close(&self) {
        let admin = self.admin.lock().await.take();
        if let Some(admin) = admin {
            if let Err(e) = admin.close().await {
                warn!(error = %e, "Failed to close admin client");
            }
        }
    }
}
