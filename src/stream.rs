//! Stream synchronisation driver
//!
//! Pulls decision diffs from LAPI and applies them to the decision index.
//! Warm-up fetches the full snapshot and raises the warm-up flag; refresh
//! applies incremental diffs. Synchronisation is single-flight per
//! process: a second caller fails fast instead of interleaving writes.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::cache::CONFIG_KEY;
use crate::decision::DecisionIndex;
use crate::error::{BouncerError, Result};
use crate::lapi::LapiClient;
use crate::remediation::Remediation;

/// Counts reported by a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshOutcome {
    pub new: usize,
    pub deleted: usize,
}

pub struct StreamSynchroniser {
    index: Arc<DecisionIndex>,
    lapi: Arc<dyn LapiClient>,
    fallback: Remediation,
    flight: tokio::sync::Mutex<()>,
}

impl StreamSynchroniser {
    pub fn new(
        index: Arc<DecisionIndex>,
        lapi: Arc<dyn LapiClient>,
        fallback: Remediation,
    ) -> Self {
        Self {
            index,
            lapi,
            fallback,
            flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether a snapshot has been successfully applied.
    pub async fn is_warmed_up(&self) -> Result<bool> {
        Ok(match self.index.store().get(CONFIG_KEY).await? {
            Some(env) => env
                .payload
                .get("warmed_up")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            None => false,
        })
    }

    /// Fetch and apply the full snapshot. Returns the number of decisions
    /// applied.
    pub async fn warm_up(&self) -> Result<usize> {
        let _guard = self.flight.try_lock().map_err(|_| BouncerError::Busy)?;
        self.warm_up_locked().await
    }

    /// Apply the incremental diff, warming up first when needed.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let _guard = self.flight.try_lock().map_err(|_| BouncerError::Busy)?;

        if !self.is_warmed_up().await? {
            let added = self.warm_up_locked().await?;
            return Ok(RefreshOutcome {
                new: added,
                deleted: 0,
            });
        }

        let stream = self.lapi.streamed_decisions(false).await?;
        let outcome = self
            .index
            .bulk_apply(&stream.new, &stream.deleted, self.fallback, None)
            .await?;
        self.index.store().commit().await?;

        info!(
            new = outcome.added,
            deleted = outcome.deleted,
            "stream refresh applied"
        );
        Ok(RefreshOutcome {
            new: outcome.added,
            deleted: outcome.deleted,
        })
    }

    async fn warm_up_locked(&self) -> Result<usize> {
        let store = self.index.store();

        // A re-warm starts from a blank slate.
        if self.is_warmed_up().await? {
            store
                .clear()
                .await
                .map_err(|e| BouncerError::WarmUp(format!("cache clear: {e}")))?;
        }

        let stream = self
            .lapi
            .streamed_decisions(true)
            .await
            .map_err(|e| BouncerError::WarmUp(format!("snapshot fetch: {e}")))?;

        let outcome = self
            .index
            .bulk_apply(&stream.new, &[], self.fallback, None)
            .await
            .map_err(|e| BouncerError::WarmUp(format!("snapshot apply: {e}")))?;

        // The flag lands in the same commit as the snapshot, so a failed
        // flush leaves the cache officially cold.
        store.put(CONFIG_KEY, json!({"warmed_up": true}), None, &[]).await;
        store
            .commit()
            .await
            .map_err(|e| BouncerError::WarmUp(format!("snapshot commit: {e}")))?;

        info!(new = outcome.added, "stream warm-up complete");
        Ok(outcome.added)
    }
}
