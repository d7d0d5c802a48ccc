//! Recovery of entries which were delivered but never acknowledged, e.g. because their consumer
//! crashed or their batch was rejected by the admission gate.
//!
//! The [`Reclaimer`] claims such entries under its own consumer name and reprocesses them through
//! the shared [`Pipeline`], in two situations:
//!  - once at startup, for every entry pending in the group at that time, regardless of its idle
//!    time ([`Reclaimer::sweep_pending`])
//!  - periodically, for entries idle for longer than the staleness threshold
//!    ([`Reclaimer::sweep_stale`])
use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use futures::{stream, FutureExt, StreamExt};
use stream_cancel::{StreamExt as _, Tripwire};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ReclaimConfig;
use crate::error::Error;
use crate::event_log::{EventLog, PendingSummary};
use crate::source::Pipeline;
use crate::store::LoginStore;

/// Which sweep claimed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Stale,
}

impl Trigger {
    #[inline]
    fn label(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Stale => "stale",
        }
    }
}

#[derive(new)]
pub struct Reclaimer<L, S> {
    pipeline: Arc<Pipeline<L, S>>,
    cfg: ReclaimConfig,
    consumer: String,
    tripwire: Tripwire,
}

impl<L, S> Clone for Reclaimer<L, S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            cfg: self.cfg.clone(),
            consumer: self.consumer.clone(),
            tripwire: self.tripwire.clone(),
        }
    }
}

impl<L: EventLog, S: LoginStore> Reclaimer<L, S> {
    #[inline]
    fn is_stopped(&self) -> bool {
        self.tripwire.clone().now_or_never().unwrap_or(false)
    }

    /// Claim one page of pending entries idle for at least `min_idle` and reprocess them.
    ///
    /// Returns the number of entries inspected, zero if there were none left.
    async fn sweep_page(
        &self,
        owner: Option<&str>,
        count: usize,
        min_idle: Duration,
        trigger: Trigger,
    ) -> Result<usize, Error> {
        let log = self.pipeline.log();
        let group = self.pipeline.group();

        let ids = log
            .list_pending(group, owner, count)
            .await?
            .into_iter()
            .filter(|entry| entry.idle >= min_idle)
            .map(|entry| entry.id)
            .collect::<Vec<_>>();

        if ids.is_empty() {
            return Ok(0);
        }

        let claimed = log.claim(group, &self.consumer, min_idle, &ids).await?;

        if claimed.is_empty() {
            debug!(entries = ids.len(), "pending entries were claimed by someone else");
            return Ok(ids.len());
        }

        info!(
            claimed = claimed.len(),
            trigger = trigger.label(),
            "reprocessing claimed entries"
        );

        self.pipeline
            .metrics()
            .reclaimed_total
            .with_label_values(&[trigger.label()])
            .inc_by(claimed.len() as u64);

        self.pipeline.process(claimed).await?;

        Ok(ids.len())
    }

    /// Claim and reprocess every entry in the `pending` summary, consumer by consumer and page by
    /// page, pausing between pages.
    #[instrument(name = "startup_sweep", fields(consumer = self.consumer), skip_all)]
    pub async fn sweep_pending(self, pending: PendingSummary) {
        info!(pending = pending.total, "reprocessing entries pending since last run");

        let mut swept = 0;

        for (owner, count) in pending.consumers {
            let mut remaining = count;

            while remaining > 0 && !self.is_stopped() {
                let page = self.cfg.page_size.min(remaining);

                match self
                    .sweep_page(Some(&owner), page, Duration::ZERO, Trigger::Startup)
                    .await
                {
                    Ok(0) => break,
                    Ok(n) => {
                        swept += n;
                        remaining = remaining.saturating_sub(n);
                    }
                    Err(e) => {
                        warn!(owner, cause = %e, "failed to reprocess pending entries");
                        break;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.page_delay) => {}
                    true = self.tripwire.clone() => break,
                }
            }
        }

        info!(swept, "startup sweep finished");
    }

    /// Periodically claim and reprocess entries idle for longer than the staleness threshold
    /// until the tripwire is triggered.
    #[instrument(name = "stale_sweep", fields(consumer = self.consumer), skip_all)]
    pub async fn sweep_stale(self) {
        let interval = self.cfg.interval;
        let this = &self;

        let ticks = stream::unfold((), move |()| async move {
            tokio::time::sleep(interval).await;
            Some(((), ()))
        })
        .take_until_if(self.tripwire.clone());

        ticks
            .for_each(|()| async move {
                match this
                    .sweep_page(None, this.cfg.page_size, this.cfg.stale_after, Trigger::Stale)
                    .await
                {
                    Ok(0) => debug!("no stale entries"),
                    Ok(n) => info!(inspected = n, "stale entries reprocessed"),
                    Err(e) => error!(cause = %e, "failed to reprocess stale entries"),
                }
            })
            .await;

        warn!("stale entry sweep terminated");
    }
}
