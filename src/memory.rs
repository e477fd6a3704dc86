// src/memory.rs
//! In-process implementations of the storage ports.
//!
//! They honour the same contracts as the Postgres and Redis backends and are
//! what the test-suite runs against. The ledger serializes transactions
//! behind a single async mutex and stages writes until commit.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as SyncMutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::error::StoreError;
use crate::ledger::{InsertOutcome, LedgerStore, LedgerTx};
use crate::models::{Poll, PollOption, PollResults, Vote, VoterId};
use crate::rate_limit::CounterStore;

#[derive(Default)]
struct LedgerState {
    polls: HashMap<Uuid, Poll>,
    options: HashMap<Uuid, PollOption>,
    votes: HashMap<Uuid, Vote>,
    ballots: HashSet<(Uuid, String)>,
    failing_polls: HashSet<Uuid>,
}

impl LedgerState {
    fn check_writable(&self, poll_id: Uuid) -> Result<(), StoreError> {
        if self.failing_polls.contains(&poll_id) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write touching `poll_id` fail, to exercise error paths.
    pub async fn fail_writes_for(&self, poll_id: Uuid) {
        self.state.lock().await.failing_polls.insert(poll_id);
    }

    pub async fn votes_for(&self, poll_id: Uuid) -> Vec<Vote> {
        let state = self.state.lock().await;
        state
            .votes
            .values()
            .filter(|vote| vote.poll_id == poll_id)
            .cloned()
            .collect()
    }
}

struct MemoryLedgerTx {
    state: OwnedMutexGuard<LedgerState>,
    staged_votes: Vec<Vote>,
    staged_increments: HashMap<Uuid, i64>,
}

impl MemoryLedgerTx {
    fn staged_ballot(&self, poll_id: Uuid, voter: &str) -> bool {
        self.staged_votes
            .iter()
            .any(|vote| vote.poll_id == poll_id && vote.voter_identity == voter)
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_poll(&mut self, poll_id: Uuid) -> Result<Option<Poll>, StoreError> {
        Ok(self.state.polls.get(&poll_id).cloned())
    }

    async fn find_option(
        &mut self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<PollOption>, StoreError> {
        let staged = self.staged_increments.get(&option_id).copied().unwrap_or(0);
        Ok(self
            .state
            .options
            .get(&option_id)
            .filter(|option| option.poll_id == poll_id)
            .cloned()
            .map(|mut option| {
                option.vote_count += staged;
                option
            }))
    }

    async fn has_voted(&mut self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
        let key = (poll_id, voter.as_str().to_string());
        Ok(self.state.ballots.contains(&key) || self.staged_ballot(poll_id, voter.as_str()))
    }

    async fn insert_vote(&mut self, vote: &Vote) -> Result<InsertOutcome, StoreError> {
        self.state.check_writable(vote.poll_id)?;

        let key = (vote.poll_id, vote.voter_identity.clone());
        if self.state.ballots.contains(&key) || self.staged_ballot(vote.poll_id, &vote.voter_identity) {
            return Ok(InsertOutcome::Duplicate);
        }

        self.staged_votes.push(vote.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn increment_option(&mut self, option_id: Uuid) -> Result<i64, StoreError> {
        let current = self
            .state
            .options
            .get(&option_id)
            .map(|option| option.vote_count)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;

        let staged = self.staged_increments.entry(option_id).or_insert(0);
        *staged += 1;

        Ok(current + *staged)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryLedgerTx {
            mut state,
            staged_votes,
            staged_increments,
        } = *self;

        for (option_id, delta) in staged_increments {
            if let Some(option) = state.options.get_mut(&option_id) {
                option.vote_count += delta;
            }
        }
        for vote in staged_votes {
            state
                .ballots
                .insert((vote.poll_id, vote.voter_identity.clone()));
            state.votes.insert(vote.id, vote);
        }

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let state = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryLedgerTx {
            state,
            staged_votes: Vec::new(),
            staged_increments: HashMap::new(),
        }))
    }

    async fn insert_poll(&self, poll: &Poll, options: &[PollOption]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.polls.insert(poll.id, poll.clone());
        for option in options {
            state.options.insert(option.id, option.clone());
        }
        Ok(())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(poll_id)?;

        if state.polls.remove(&poll_id).is_none() {
            return Ok(false);
        }
        state.options.retain(|_, option| option.poll_id != poll_id);
        state.votes.retain(|_, vote| vote.poll_id != poll_id);
        state.ballots.retain(|(id, _)| *id != poll_id);

        Ok(true)
    }

    async fn poll_with_options(
        &self,
        poll_id: Uuid,
    ) -> Result<Option<(Poll, Vec<PollOption>)>, StoreError> {
        let state = self.state.lock().await;
        let Some(poll) = state.polls.get(&poll_id).cloned() else {
            return Ok(None);
        };

        let mut options: Vec<PollOption> = state
            .options
            .values()
            .filter(|option| option.poll_id == poll_id)
            .cloned()
            .collect();
        options.sort_by_key(|option| option.position);

        Ok(Some((poll, options)))
    }

    async fn active_polls(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Poll, Vec<PollOption>)>, StoreError> {
        let state = self.state.lock().await;
        let mut polls: Vec<Poll> = state
            .polls
            .values()
            .filter(|poll| poll.accepts_votes_at(now))
            .cloned()
            .collect();
        polls.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(polls
            .into_iter()
            .map(|poll| {
                let mut options: Vec<PollOption> = state
                    .options
                    .values()
                    .filter(|option| option.poll_id == poll.id)
                    .cloned()
                    .collect();
                options.sort_by_key(|option| option.position);
                (poll, options)
            })
            .collect())
    }

    async fn voter_has_voted(&self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ballots.contains(&(poll_id, voter.as_str().to_string())))
    }

    async fn expired_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .polls
            .values()
            .filter(|poll| poll.active && poll.expires_at.is_some_and(|expires_at| expires_at < now))
            .map(|poll| poll.id)
            .collect())
    }

    async fn deactivate_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.check_writable(poll_id)?;

        match state.polls.get_mut(&poll_id) {
            Some(poll) if poll.active => {
                poll.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_votes(&self, poll_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.votes.values().filter(|vote| vote.poll_id == poll_id).count() as i64)
    }
}

/// Counter store with per-key expiry.
#[derive(Default)]
pub struct MemoryCounters {
    counters: SyncMutex<HashMap<String, (u64, Instant)>>,
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.retain(|_, (_, expires_at)| *expires_at > now);

        let (count, _) = counters
            .entry(key.to_string())
            .or_insert_with(|| (0, now + ttl));
        *count += 1;

        Ok(*count)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: SyncMutex<HashMap<Uuid, (PollResults, Instant)>>,
    invalidations: AtomicUsize,
}

impl MemoryCache {
    /// Number of invalidations that actually removed a snapshot.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    pub fn contains(&self, poll_id: Uuid) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&poll_id)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, poll_id: Uuid) -> Result<Option<PollResults>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(&poll_id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(results, _)| results.clone()))
    }

    async fn put(&self, results: &PollResults, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(results.poll_id, (results.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, poll_id: Uuid) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.remove(&poll_id).is_some() {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryLedger, Poll, PollOption) {
        let ledger = MemoryLedger::new();
        let poll = Poll {
            id: Uuid::new_v4(),
            title: "Color".to_string(),
            description: String::new(),
            created_by: "admin".to_string(),
            created_at: Utc::now(),
            expires_at: None,
            active: true,
        };
        let option = PollOption {
            id: Uuid::new_v4(),
            poll_id: poll.id,
            text: "A".to_string(),
            position: 0,
            vote_count: 0,
        };
        ledger.insert_poll(&poll, &[option.clone()]).await.unwrap();
        (ledger, poll, option)
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let (ledger, poll, option) = seeded().await;
        let voter = VoterId::new("1.2.3.4");

        {
            let mut tx = ledger.begin().await.unwrap();
            let vote = Vote::new(poll.id, option.id, &voter, Utc::now());
            assert_eq!(tx.insert_vote(&vote).await.unwrap(), InsertOutcome::Inserted);
            assert_eq!(tx.increment_option(option.id).await.unwrap(), 1);
        }

        assert_eq!(ledger.count_votes(poll.id).await.unwrap(), 0);
        let (_, options) = ledger.poll_with_options(poll.id).await.unwrap().unwrap();
        assert_eq!(options[0].vote_count, 0);
        assert!(!ledger.voter_has_voted(poll.id, &voter).await.unwrap());
    }

    #[tokio::test]
    async fn second_insert_for_same_voter_is_duplicate() {
        let (ledger, poll, option) = seeded().await;
        let voter = VoterId::new("1.2.3.4");

        let mut tx = ledger.begin().await.unwrap();
        tx.insert_vote(&Vote::new(poll.id, option.id, &voter, Utc::now()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = ledger.begin().await.unwrap();
        let outcome = tx
            .insert_vote(&Vote::new(poll.id, option.id, &voter, Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn counters_restart_after_ttl() {
        let counters = MemoryCounters::default();
        let ttl = Duration::from_millis(20);

        assert_eq!(counters.incr_with_ttl("k", ttl).await.unwrap(), 1);
        assert_eq!(counters.incr_with_ttl("k", ttl).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counters.incr_with_ttl("k", ttl).await.unwrap(), 1);
    }
}
