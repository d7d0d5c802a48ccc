//! Batch sink which writes decoded [`LoginRecord`]s into the [`LoginStore`] behind an
//! [`AdmissionGate`].
//!
//! A batch is split into blocks of at most `max_block_size` records which are upserted in order
//! under a single gate permit. Since each upsert is idempotent per `(user_id, ip_address)`, a batch
//! which fails part way through can be safely re-applied as a whole.
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::Error;
use crate::gate::AdmissionGate;
use crate::login::LoginRecord;
use crate::store::LoginStore;

pub struct BatchSink<S> {
    store: Arc<S>,
    gate: AdmissionGate,
    /// The maximum number of records in a single upsert
    max_block_size: usize,
}

impl<S> BatchSink<S> {
    /// Panics if `max_block_size == 0`.
    pub fn new(store: Arc<S>, gate: AdmissionGate, max_block_size: usize) -> Self {
        assert!(max_block_size > 0, "block size cannot be zero");
        Self {
            store,
            gate,
            max_block_size,
        }
    }

    #[inline]
    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }
}

impl<S: LoginStore> BatchSink<S> {
    /// Apply a batch of records, returning the number of rows written.
    ///
    /// Fails with [`Error::Overload`] if the store could not be admitted in time, in which case
    /// nothing has been written.
    #[instrument(name = "apply", skip_all, fields(records = records.len()))]
    pub async fn apply(&self, records: &[LoginRecord]) -> Result<u64, Error> {
        if records.is_empty() {
            return Ok(0);
        }

        let _permit = self.gate.acquire().await.map_err(|e| {
            warn!(available = self.gate.available(), "store admission timed out");
            e
        })?;

        let mut written = 0;

        for (block, records) in records.chunks(self.max_block_size).enumerate() {
            let rows = self.store.upsert(records).await.map_err(|e| {
                warn!(block, cause = ?e, "block upsert failed");
                e
            })?;
            debug!(block, rows, "block upserted");
            written += rows;
        }

        info!(rows = written, "batch applied");
        Ok(written)
    }
}
