// ledger.rs
//! Ports onto the durable store that owns polls, options and votes.
//!
//! A [`LedgerTx`] is one atomic unit of work. Dropping it without calling
//! [`LedgerTx::commit`] discards every staged write, so a vote that is
//! cancelled mid-flight (timeout, client gone) leaves nothing behind.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Poll, PollOption, Vote, VoterId};

/// Result of an insert guarded by the `(poll, voter)` uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[async_trait]
pub trait LedgerTx: Send {
    /// Reads the poll and holds it against concurrent closure or deletion
    /// until the transaction ends.
    async fn lock_poll(&mut self, poll_id: Uuid) -> Result<Option<Poll>, StoreError>;

    async fn find_option(
        &mut self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<PollOption>, StoreError>;

    async fn has_voted(&mut self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError>;

    /// Insert-if-absent on `(poll_id, voter_identity)`.
    async fn insert_vote(&mut self, vote: &Vote) -> Result<InsertOutcome, StoreError>;

    /// Adds one to the option's denormalized count and returns the new value.
    async fn increment_option(&mut self, option_id: Uuid) -> Result<i64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    /// Inserts a poll together with its options in one transaction.
    async fn insert_poll(&self, poll: &Poll, options: &[PollOption]) -> Result<(), StoreError>;

    /// Returns `false` when no such poll existed. Options and votes go with it.
    async fn delete_poll(&self, poll_id: Uuid) -> Result<bool, StoreError>;

    /// Poll with its options ordered by position.
    async fn poll_with_options(
        &self,
        poll_id: Uuid,
    ) -> Result<Option<(Poll, Vec<PollOption>)>, StoreError>;

    /// Polls accepting votes at `now`, newest first, each with its options
    /// ordered by position.
    async fn active_polls(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Poll, Vec<PollOption>)>, StoreError>;

    async fn voter_has_voted(&self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError>;

    /// Active polls whose expiry lies before `now`.
    async fn expired_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    /// Clears the active flag. Returns `false` if the poll was already closed
    /// or is gone, which makes repeated closure a no-op.
    async fn deactivate_poll(&self, poll_id: Uuid) -> Result<bool, StoreError>;

    /// Number of committed vote rows for a poll. Used for reconciliation
    /// checks, never on the hot read path.
    async fn count_votes(&self, poll_id: Uuid) -> Result<i64, StoreError>;
}
