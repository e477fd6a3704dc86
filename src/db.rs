// src/db.rs
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::config::Config;
use crate::error::StoreError;
use crate::ledger::{InsertOutcome, LedgerStore, LedgerTx};
use crate::models::{Poll, PollOption, Vote, VoterId};

pub async fn create_pool(config: &Config) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.engine.store_timeout)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Shared connection to the counter and cache store.
pub async fn connect_redis(config: &Config) -> Result<ConnectionManager, StoreError> {
    let manager_config = manager_config(config.engine.store_timeout);

    let client = redis::Client::open(config.redis_url.as_str())?;
    let connection = client
        .get_connection_manager_with_config(manager_config)
        .await?;

    Ok(connection)
}

fn manager_config(store_timeout: Duration) -> ConnectionManagerConfig {
    ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(store_timeout)
        .set_response_timeout(store_timeout)
}

/// Postgres-backed ledger. Uniqueness of `(poll_id, voter_identity)` is a
/// table constraint, so concurrent inserts are arbitrated by the database.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_poll(&mut self, poll_id: Uuid) -> Result<Option<Poll>, StoreError> {
        let poll = sqlx::query_as::<_, Poll>(
            r#"
            SELECT id, title, description, created_by, created_at, expires_at, active
            FROM polls
            WHERE id = $1
            FOR SHARE
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(poll)
    }

    async fn find_option(
        &mut self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<PollOption>, StoreError> {
        let option = sqlx::query_as::<_, PollOption>(
            r#"
            SELECT id, poll_id, text, position, vote_count
            FROM poll_options
            WHERE id = $1 AND poll_id = $2
            "#,
        )
        .bind(option_id)
        .bind(poll_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(option)
    }

    async fn has_voted(&mut self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM votes WHERE poll_id = $1 AND voter_identity = $2)",
        )
        .bind(poll_id)
        .bind(voter.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn insert_vote(&mut self, vote: &Vote) -> Result<InsertOutcome, StoreError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO votes (id, poll_id, option_id, voter_identity, voted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (poll_id, voter_identity) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(vote.id)
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(&vote.voter_identity)
        .bind(vote.voted_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(match inserted {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::Duplicate,
        })
    }

    async fn increment_option(&mut self, option_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "UPDATE poll_options SET vote_count = vote_count + 1 WHERE id = $1 RETURNING vote_count",
        )
        .bind(option_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn insert_poll(&self, poll: &Poll, options: &[PollOption]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, title, description, created_by, created_at, expires_at, active)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(poll.id)
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(&poll.created_by)
        .bind(poll.created_at)
        .bind(poll.expires_at)
        .bind(poll.active)
        .execute(&mut *tx)
        .await?;

        for option in options {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, text, position, vote_count)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(option.id)
            .bind(option.poll_id)
            .bind(&option.text)
            .bind(option.position)
            .bind(option.vote_count)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn poll_with_options(
        &self,
        poll_id: Uuid,
    ) -> Result<Option<(Poll, Vec<PollOption>)>, StoreError> {
        let Some(poll) = sqlx::query_as::<_, Poll>(
            r#"
            SELECT id, title, description, created_by, created_at, expires_at, active
            FROM polls
            WHERE id = $1
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let options = sqlx::query_as::<_, PollOption>(
            r#"
            SELECT id, poll_id, text, position, vote_count
            FROM poll_options
            WHERE poll_id = $1
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some((poll, options)))
    }

    async fn active_polls(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Poll, Vec<PollOption>)>, StoreError> {
        let polls = sqlx::query_as::<_, Poll>(
            r#"
            SELECT id, title, description, created_by, created_at, expires_at, active
            FROM polls
            WHERE active AND (expires_at IS NULL OR expires_at >= $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = polls.iter().map(|poll| poll.id).collect();
        let options = sqlx::query_as::<_, PollOption>(
            r#"
            SELECT id, poll_id, text, position, vote_count
            FROM poll_options
            WHERE poll_id = ANY($1)
            ORDER BY poll_id, position
            "#,
        )
        .bind(&ids[..])
        .fetch_all(&self.pool)
        .await?;

        let mut by_poll: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
        for option in options {
            by_poll.entry(option.poll_id).or_default().push(option);
        }

        Ok(polls
            .into_iter()
            .map(|poll| {
                let options = by_poll.remove(&poll.id).unwrap_or_default();
                (poll, options)
            })
            .collect())
    }

    async fn voter_has_voted(&self, poll_id: Uuid, voter: &VoterId) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM votes WHERE poll_id = $1 AND voter_identity = $2)",
        )
        .bind(poll_id)
        .bind(voter.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn expired_active_polls(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM polls WHERE active AND expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn deactivate_poll(&self, poll_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE polls SET active = FALSE WHERE id = $1 AND active")
            .bind(poll_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_votes(&self, poll_id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes WHERE poll_id = $1")
            .bind(poll_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_manager_takes_the_store_timeout() {
        let _config: ConnectionManagerConfig = manager_config(Duration::from_millis(250));
    }
}
