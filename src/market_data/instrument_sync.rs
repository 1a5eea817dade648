// =============================================================================
// Instrument Synchronizer — full instrument list, one transactional upsert
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::error::SyncResult;
use crate::store::InstrumentStore;
use crate::types::Instrument;

/// Anything that can produce the complete instrument list in one call.
#[async_trait]
pub trait InstrumentSource: Send + Sync {
    async fn instruments(&self) -> SyncResult<Vec<Instrument>>;
}

pub struct InstrumentSynchronizer {
    source: Arc<dyn InstrumentSource>,
    store: Arc<dyn InstrumentStore>,
}

impl InstrumentSynchronizer {
    pub fn new(source: Arc<dyn InstrumentSource>, store: Arc<dyn InstrumentStore>) -> Self {
        Self { source, store }
    }

    /// Fetch every instrument and upsert the batch.  A fetch or decode failure
    /// happens before any write; a store failure rolls the batch back.
    /// Returns the number of instruments written.
    #[instrument(skip(self), name = "instrument_sync")]
    pub async fn synchronize_instruments(&self) -> SyncResult<usize> {
        let batch = match self.source.instruments().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "instrument fetch failed");
                return Err(e);
            }
        };

        if let Err(e) = self.store.upsert_instruments(&batch).await {
            warn!(error = %e, count = batch.len(), "instrument upsert failed");
            return Err(e);
        }

        info!(count = batch.len(), "instruments synchronized");
        Ok(batch.len())
    }
}
