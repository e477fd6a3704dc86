// src/results.rs
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::{bounded, VoteError};
use crate::ledger::LedgerStore;
use crate::models::{OptionResult, Poll, PollOption, PollResults};

/// Serves per-option tallies, preferring a cached snapshot.
pub struct ResultAggregator {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn ResultCache>,
    cache_ttl: Duration,
    store_timeout: Duration,
}

impl ResultAggregator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn ResultCache>,
        cache_ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            cache_ttl,
            store_timeout,
        }
    }

    /// Unknown polls are reported as `PollUnavailable`. Closed and expired
    /// polls still have results.
    pub async fn get_results(&self, poll_id: Uuid) -> Result<PollResults, VoteError> {
        match bounded(self.store_timeout, self.cache.get(poll_id)).await {
            Ok(Some(mut results)) => {
                debug!(%poll_id, "Results served from cache");
                // The snapshot may predate the expiry instant.
                results.active &= results.expires_at.is_none_or(|expires_at| Utc::now() <= expires_at);
                return Ok(results);
            }
            Ok(None) => {}
            Err(e) => warn!(%poll_id, "Results cache read failed, recomputing: {e}"),
        }

        let (poll, options) = bounded(self.store_timeout, self.ledger.poll_with_options(poll_id))
            .await?
            .ok_or(VoteError::PollUnavailable)?;

        let results = tally(&poll, &options, Utc::now());

        if let Err(e) =
            bounded(self.store_timeout, self.cache.put(&results, self.cache_ttl)).await
        {
            warn!(%poll_id, "Failed to cache results: {e}");
        }

        Ok(results)
    }

    /// Drops the cached snapshot. A failure here is logged only: the entry
    /// still expires on its own TTL.
    pub async fn invalidate(&self, poll_id: Uuid) {
        if let Err(e) = bounded(self.store_timeout, self.cache.invalidate(poll_id)).await {
            warn!(%poll_id, "Failed to invalidate cached results: {e}");
        }
    }
}

/// Sums the denormalized option counts; vote rows are never scanned here.
/// `active` reports whether the poll accepts votes at `now`.
pub fn tally(poll: &Poll, options: &[PollOption], now: DateTime<Utc>) -> PollResults {
    let total_votes: i64 = options.iter().map(|option| option.vote_count).sum();

    PollResults {
        poll_id: poll.id,
        title: poll.title.clone(),
        active: poll.accepts_votes_at(now),
        expires_at: poll.expires_at,
        total_votes,
        options: options
            .iter()
            .map(|option| OptionResult {
                id: option.id,
                text: option.text.clone(),
                count: option.vote_count,
                percentage: percentage(option.vote_count, total_votes),
            })
            .collect(),
    }
}

/// Share of `total` as a percentage with one decimal place; 0 when nobody voted.
pub fn percentage(count: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}
