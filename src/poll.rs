// src/poll.rs
//! Vote casting.
//!
//! Every check and both writes (the vote row and the option counter) run in
//! one ledger transaction. The pre-check for an existing vote only produces
//! the friendlier early answer; the `(poll, voter)` uniqueness constraint is
//! what decides a race between two requests from the same voter.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{bounded, VoteError};
use crate::ledger::{InsertOutcome, LedgerStore};
use crate::models::{Vote, VoteReceipt, VoterId};
use crate::rate_limit::{Action, RateLimiter};
use crate::results::ResultAggregator;

pub struct VoteEngine {
    ledger: Arc<dyn LedgerStore>,
    limiter: RateLimiter,
    results: Arc<ResultAggregator>,
    store_timeout: Duration,
}

impl VoteEngine {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        limiter: RateLimiter,
        results: Arc<ResultAggregator>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            limiter,
            results,
            store_timeout,
        }
    }

    pub async fn cast_vote(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        voter: &VoterId,
    ) -> Result<VoteReceipt, VoteError> {
        self.cast_vote_at(poll_id, option_id, voter, Utc::now()).await
    }

    pub async fn cast_vote_at(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        voter: &VoterId,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt, VoteError> {
        let outcome = bounded(
            self.store_timeout,
            self.commit_vote(poll_id, option_id, voter, now),
        )
        .await;

        match &outcome {
            Ok(receipt) => {
                debug!(%poll_id, option_id = %receipt.option_id, count = receipt.new_count, "Vote recorded");
                self.results.invalidate(poll_id).await;
            }
            // The commit may have landed before the store stopped answering.
            Err(e @ VoteError::StoreUnavailable(_)) => {
                warn!(%poll_id, %voter, "Vote outcome unknown: {e}");
                self.results.invalidate(poll_id).await;
            }
            Err(e) => debug!(%poll_id, %voter, "Vote rejected: {e}"),
        }

        outcome
    }

    async fn commit_vote(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        voter: &VoterId,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt, VoteError> {
        // Any early return drops `tx` and rolls the transaction back.
        let mut tx = self.ledger.begin().await?;

        tx.lock_poll(poll_id)
            .await?
            .filter(|poll| poll.accepts_votes_at(now))
            .ok_or(VoteError::PollUnavailable)?;

        let option = tx
            .find_option(poll_id, option_id)
            .await?
            .ok_or(VoteError::OptionNotFound)?;

        let decision = self.limiter.allow_at(voter, Action::Vote, now).await?;
        if !decision.allowed {
            return Err(VoteError::RateLimited {
                retry_after: decision.retry_after,
            });
        }

        if tx.has_voted(poll_id, voter).await? {
            return Err(VoteError::DuplicateVote);
        }

        let vote = Vote::new(poll_id, option.id, voter, now);
        if tx.insert_vote(&vote).await? == InsertOutcome::Duplicate {
            return Err(VoteError::DuplicateVote);
        }

        let new_count = tx.increment_option(option.id).await?;
        tx.commit().await?;

        Ok(VoteReceipt {
            option_id: option.id,
            new_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::error::StoreError;
    use crate::ledger::LedgerTx;
    use crate::memory::{MemoryCache, MemoryCounters, MemoryLedger};
    use crate::models::{Poll, PollOption};
    use crate::rate_limit::RatePolicy;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        cache: Arc<MemoryCache>,
        engine: VoteEngine,
        results: Arc<ResultAggregator>,
    }

    fn fixture_with(ledger: Arc<dyn LedgerStore>, memory: Arc<MemoryLedger>, votes_per_minute: u32) -> Fixture {
        let cache = Arc::new(MemoryCache::default());
        let results = Arc::new(ResultAggregator::new(
            ledger.clone(),
            cache.clone(),
            Duration::from_secs(30),
            Duration::from_millis(200),
        ));
        let limiter = RateLimiter::new(
            Arc::new(MemoryCounters::default()),
            RatePolicy::new(votes_per_minute, Duration::from_secs(60)),
            RatePolicy::new(5, Duration::from_secs(3600)),
        );
        let engine = VoteEngine::new(ledger, limiter, results.clone(), Duration::from_millis(200));

        Fixture {
            ledger: memory,
            cache,
            engine,
            results,
        }
    }

    fn fixture(votes_per_minute: u32) -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        fixture_with(ledger.clone(), ledger, votes_per_minute)
    }

    async fn seed_poll(ledger: &MemoryLedger, expires_at: Option<DateTime<Utc>>) -> (Poll, Vec<PollOption>) {
        let poll = Poll {
            id: Uuid::new_v4(),
            title: "Color".to_string(),
            description: String::new(),
            created_by: "admin".to_string(),
            created_at: Utc::now(),
            expires_at,
            active: true,
        };
        let options: Vec<PollOption> = ["A", "B"]
            .iter()
            .enumerate()
            .map(|(position, text)| PollOption {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                text: text.to_string(),
                position: position as i32,
                vote_count: 0,
            })
            .collect();
        ledger.insert_poll(&poll, &options).await.unwrap();
        (poll, options)
    }

    #[tokio::test]
    async fn records_vote_and_returns_new_count() {
        let fx = fixture(10);
        let (poll, options) = seed_poll(&fx.ledger, None).await;

        let receipt = fx
            .engine
            .cast_vote(poll.id, options[0].id, &VoterId::new("1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(receipt.new_count, 1);
        assert_eq!(fx.ledger.count_votes(poll.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_or_closed_poll_is_unavailable() {
        let fx = fixture(10);
        let voter = VoterId::new("1.2.3.4");

        let err = fx
            .engine
            .cast_vote(Uuid::new_v4(), Uuid::new_v4(), &voter)
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::PollUnavailable));

        let (poll, options) = seed_poll(&fx.ledger, None).await;
        fx.ledger.deactivate_poll(poll.id).await.unwrap();
        let err = fx.engine.cast_vote(poll.id, options[0].id, &voter).await.unwrap_err();
        assert!(matches!(err, VoteError::PollUnavailable));
    }

    #[tokio::test]
    async fn expiry_is_checked_by_timestamp_before_the_sweeper_runs() {
        let fx = fixture(10);
        let expired = Utc::now() - ChronoDuration::minutes(5);
        let (poll, options) = seed_poll(&fx.ledger, Some(expired)).await;

        let err = fx
            .engine
            .cast_vote(poll.id, options[0].id, &VoterId::new("1.2.3.4"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoteError::PollUnavailable));
        assert_eq!(fx.ledger.count_votes(poll.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn option_from_another_poll_is_rejected() {
        let fx = fixture(10);
        let (poll, _) = seed_poll(&fx.ledger, None).await;
        let (_, foreign) = seed_poll(&fx.ledger, None).await;

        let err = fx
            .engine
            .cast_vote(poll.id, foreign[0].id, &VoterId::new("1.2.3.4"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoteError::OptionNotFound));
    }

    #[tokio::test]
    async fn second_vote_from_same_voter_is_duplicate() {
        let fx = fixture(10);
        let (poll, options) = seed_poll(&fx.ledger, None).await;
        let voter = VoterId::new("1.2.3.4");

        fx.engine.cast_vote(poll.id, options[0].id, &voter).await.unwrap();
        let err = fx.engine.cast_vote(poll.id, options[1].id, &voter).await.unwrap_err();

        assert!(matches!(err, VoteError::DuplicateVote));
        let results = fx.results.get_results(poll.id).await.unwrap();
        assert_eq!(results.total_votes, 1);
        assert_eq!(results.options[1].count, 0);
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        // One vote per minute: the duplicate attempt trips the limiter first.
        let fx = fixture(1);
        let (poll, options) = seed_poll(&fx.ledger, None).await;
        let voter = VoterId::new("1.2.3.4");
        let now = Utc::now();

        fx.engine
            .cast_vote_at(poll.id, options[0].id, &voter, now)
            .await
            .unwrap();

        let err = fx
            .engine
            .cast_vote_at(poll.id, Uuid::new_v4(), &voter, now)
            .await
            .unwrap_err();
        assert!(matches!(err, VoteError::OptionNotFound));

        let err = fx
            .engine
            .cast_vote_at(poll.id, options[1].id, &voter, now)
            .await
            .unwrap_err();
        match err {
            VoteError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_vote_invalidates_cached_results() {
        let fx = fixture(10);
        let (poll, options) = seed_poll(&fx.ledger, None).await;

        let before = fx.results.get_results(poll.id).await.unwrap();
        assert_eq!(before.total_votes, 0);
        assert!(fx.cache.contains(poll.id));

        fx.engine
            .cast_vote(poll.id, options[1].id, &VoterId::new("5.6.7.8"))
            .await
            .unwrap();
        assert!(!fx.cache.contains(poll.id));

        let after = fx.results.get_results(poll.id).await.unwrap();
        assert_eq!(after.total_votes, 1);
        assert_eq!(after.options[1].percentage, 100.0);
    }

    #[derive(Clone, Copy)]
    enum Fault {
        /// Transactions never start in time.
        StallBegin,
        /// The in-transaction pre-check misses, as when a concurrent
        /// transaction from the same voter has not committed yet.
        MissPrecheck,
        /// The commit is applied but the acknowledgement never arrives.
        StallAfterCommit,
    }

    struct FaultyLedger {
        inner: Arc<MemoryLedger>,
        fault: Fault,
    }

    struct FaultyTx {
        inner: Box<dyn LedgerTx>,
        fault: Fault,
    }

    #[async_trait]
    impl LedgerTx for FaultyTx {
        async fn lock_poll(&mut self, poll_id: Uuid) -> Result<Option<Poll>, StoreError> {
            self.inner.lock_poll(poll_id).await
        }

        async fn find_option(
            &mut self,
            poll_id: Uuid,
            option_id: Uuid,
        ) -> Result<Option<PollOption>, StoreError> {
            self.inner.find_option(poll_id, option_id).await
        }

        async fn has_voted(&mut self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
            match self.fault {
                Fault::MissPrecheck => Ok(false),
                _ => self.inner.has_voted(poll_id, voter).await,
            }
        }

        async fn insert_vote(&mut self, vote: &Vote) -> Result<InsertOutcome, StoreError> {
            self.inner.insert_vote(vote).await
        }

        async fn increment_option(&mut self, option_id: Uuid) -> Result<i64, StoreError> {
            self.inner.increment_option(option_id).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let fault = self.fault;
            self.inner.commit().await?;
            if let Fault::StallAfterCommit = fault {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LedgerStore for FaultyLedger {
        async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
            if let Fault::StallBegin = self.fault {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            Ok(Box::new(FaultyTx {
                inner: self.inner.begin().await?,
                fault: self.fault,
            }))
        }

        async fn insert_poll(&self, poll: &Poll, options: &[PollOption]) -> Result<(), StoreError> {
            self.inner.insert_poll(poll, options).await
        }

        async fn delete_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_poll(poll_id).await
        }

        async fn poll_with_options(
            &self,
            poll_id: Uuid,
        ) -> Result<Option<(Poll, Vec<PollOption>)>, StoreError> {
            self.inner.poll_with_options(poll_id).await
        }

        async fn active_polls(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<(Poll, Vec<PollOption>)>, StoreError> {
            self.inner.active_polls(now).await
        }

        async fn voter_has_voted(&self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
            self.inner.voter_has_voted(poll_id, voter).await
        }

        async fn expired_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
            self.inner.expired_active_polls(now).await
        }

        async fn deactivate_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
            self.inner.deactivate_poll(poll_id).await
        }

        async fn count_votes(&self, poll_id: Uuid) -> Result<i64, StoreError> {
            self.inner.count_votes(poll_id).await
        }
    }

    fn faulty_fixture(fault: Fault) -> Fixture {
        let memory = Arc::new(MemoryLedger::new());
        let ledger = Arc::new(FaultyLedger {
            inner: memory.clone(),
            fault,
        });
        fixture_with(ledger, memory, 10)
    }

    #[tokio::test]
    async fn slow_store_surfaces_as_retryable_unavailability() {
        let fx = faulty_fixture(Fault::StallBegin);
        let (poll, options) = seed_poll(&fx.ledger, None).await;

        let err = fx
            .engine
            .cast_vote(poll.id, options[0].id, &VoterId::new("1.2.3.4"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoteError::StoreUnavailable(StoreError::Timeout(_))));
        assert!(err.is_retryable());
        assert_eq!(fx.ledger.count_votes(poll.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn uniqueness_constraint_decides_when_precheck_misses() {
        let fx = faulty_fixture(Fault::MissPrecheck);
        let (poll, options) = seed_poll(&fx.ledger, None).await;
        let voter = VoterId::new("1.2.3.4");

        fx.engine.cast_vote(poll.id, options[0].id, &voter).await.unwrap();
        let err = fx.engine.cast_vote(poll.id, options[0].id, &voter).await.unwrap_err();

        assert!(matches!(err, VoteError::DuplicateVote));
        assert_eq!(fx.ledger.votes_for(poll.id).await.len(), 1);
        let (_, stored) = fx.ledger.poll_with_options(poll.id).await.unwrap().unwrap();
        assert_eq!(stored[0].vote_count, 1);
        assert_eq!(stored[1].vote_count, 0);
    }

    #[tokio::test]
    async fn unacknowledged_commit_still_invalidates_cached_results() {
        let fx = faulty_fixture(Fault::StallAfterCommit);
        let (poll, options) = seed_poll(&fx.ledger, None).await;

        fx.results.get_results(poll.id).await.unwrap();
        assert!(fx.cache.contains(poll.id));

        let err = fx
            .engine
            .cast_vote(poll.id, options[0].id, &VoterId::new("1.2.3.4"))
            .await
            .unwrap_err();

        assert!(matches!(err, VoteError::StoreUnavailable(_)));
        assert_eq!(fx.ledger.count_votes(poll.id).await.unwrap(), 1);
        assert!(!fx.cache.contains(poll.id));
        assert_eq!(fx.results.get_results(poll.id).await.unwrap().total_votes, 1);
    }
}
