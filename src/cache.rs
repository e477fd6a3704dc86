// src/cache.rs
//! Short-lived snapshots of poll results.
//!
//! The cache is lossy: a miss, an eviction or a flushed Redis only costs a
//! recompute from the ledger.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::PollResults;

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, poll_id: Uuid) -> Result<Option<PollResults>, StoreError>;

    async fn put(&self, results: &PollResults, ttl: Duration) -> Result<(), StoreError>;

    async fn invalidate(&self, poll_id: Uuid) -> Result<(), StoreError>;
}

pub fn results_key(poll_id: Uuid) -> String {
    format!("poll:results:{poll_id}")
}

#[derive(Clone)]
pub struct RedisResultCache {
    connection: ConnectionManager,
}

impl RedisResultCache {
    pub fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ResultCache for RedisResultCache {
    async fn get(&self, poll_id: Uuid) -> Result<Option<PollResults>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection.get(results_key(poll_id)).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, results: &PollResults, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let json = serde_json::to_string(results)?;
        let _: () = connection
            .set_ex(results_key(results.poll_id), json, ttl.as_secs().max(1))
            .await?;

        Ok(())
    }

    async fn invalidate(&self, poll_id: Uuid) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(results_key(poll_id)).await?;

        Ok(())
    }
}
