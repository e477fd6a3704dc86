// services.rs
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{bounded, AppError, AppResult, VoteError};
use crate::ledger::LedgerStore;
use crate::models::{NewPoll, Poll, PollDetail, PollOption, VoterId};
use crate::rate_limit::{Action, RateLimiter};
use crate::results::ResultAggregator;

const MAX_TEXT_LEN: usize = 200;

/// Poll lifecycle around the voting core: creation, lookup and deletion.
pub struct PollService {
    ledger: Arc<dyn LedgerStore>,
    limiter: RateLimiter,
    results: Arc<ResultAggregator>,
    store_timeout: Duration,
}

impl PollService {
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

    pub async fn create_poll(&self, creator: &VoterId, new_poll: NewPoll) -> AppResult<PollDetail> {
        let now = Utc::now();
        validate(&new_poll, now)?;

        let decision = bounded(
            self.store_timeout,
            self.limiter.allow(creator, Action::CreatePoll),
        )
        .await?;
        if !decision.allowed {
            return Err(VoteError::RateLimited {
                retry_after: decision.retry_after,
            }
            .into());
        }

        let poll = Poll {
            id: Uuid::new_v4(),
            title: new_poll.title.trim().to_string(),
            description: new_poll.description.trim().to_string(),
            created_by: creator.as_str().to_string(),
            created_at: now,
            expires_at: new_poll.expires_at,
            active: true,
        };
        let options: Vec<PollOption> = new_poll
            .options
            .iter()
            .enumerate()
            .map(|(position, text)| PollOption {
                id: Uuid::new_v4(),
                poll_id: poll.id,
                text: text.trim().to_string(),
                position: position as i32,
                vote_count: 0,
            })
            .collect();

        bounded(self.store_timeout, self.ledger.insert_poll(&poll, &options)).await?;
        info!(poll_id = %poll.id, options = options.len(), "Poll created");

        Ok(PollDetail { poll, options })
    }

    pub async fn get_poll(&self, poll_id: Uuid) -> AppResult<PollDetail> {
        let (poll, options) = bounded(self.store_timeout, self.ledger.poll_with_options(poll_id))
            .await?
            .ok_or(AppError::PollNotFound)?;

        Ok(PollDetail { poll, options })
    }

    /// Polls still accepting votes, newest first.
    pub async fn list_polls(&self) -> AppResult<Vec<PollDetail>> {
        let polls = bounded(self.store_timeout, self.ledger.active_polls(Utc::now())).await?;

        Ok(polls
            .into_iter()
            .map(|(poll, options)| PollDetail { poll, options })
            .collect())
    }

    /// Only the creator may delete; options and votes are removed with the poll.
    pub async fn delete_poll(&self, requester: &VoterId, poll_id: Uuid) -> AppResult<()> {
        let detail = self.get_poll(poll_id).await?;
        if detail.poll.created_by != requester.as_str() {
            return Err(AppError::Forbidden);
        }

        if !bounded(self.store_timeout, self.ledger.delete_poll(poll_id)).await? {
            return Err(AppError::PollNotFound);
        }
        self.results.invalidate(poll_id).await;
        info!(%poll_id, "Poll deleted");

        Ok(())
    }

    pub async fn has_voted(&self, poll_id: Uuid, voter: &VoterId) -> AppResult<bool> {
        Ok(bounded(self.store_timeout, self.ledger.voter_has_voted(poll_id, voter)).await?)
    }
}

fn validate(new_poll: &NewPoll, now: chrono::DateTime<Utc>) -> AppResult<()> {
    let title = new_poll.title.trim();
    if title.is_empty() {
        return Err(AppError::BadRequest("Title cannot be empty".to_string()));
    }
    if title.chars().count() > MAX_TEXT_LEN {
        return Err(AppError::BadRequest(format!(
            "Title must be at most {MAX_TEXT_LEN} characters"
        )));
    }
    if new_poll.options.len() < 2 {
        return Err(AppError::BadRequest(
            "A poll needs at least two options".to_string(),
        ));
    }
    if new_poll
        .options
        .iter()
        .any(|text| text.trim().is_empty() || text.trim().chars().count() > MAX_TEXT_LEN)
    {
        return Err(AppError::BadRequest(format!(
            "Options must be non-empty and at most {MAX_TEXT_LEN} characters"
        )));
    }
    if new_poll.expires_at.is_some_and(|expires_at| expires_at <= now) {
        return Err(AppError::BadRequest(
            "Expiry date must be in the future".to_string(),
        ));
    }

    Ok(())
}
