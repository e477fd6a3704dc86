// models.rs
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Poll {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Poll {
    /// A poll is expired once `now` is strictly past its expiry timestamp.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Votes are accepted only while the flag is set and the expiry has not
    /// passed; the sweeper may not have flipped the flag yet.
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub text: String,
    pub position: i32,
    pub vote_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub voter_identity: String,
    pub voted_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(poll_id: Uuid, option_id: Uuid, voter: &VoterId, voted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            poll_id,
            option_id,
            voter_identity: voter.as_str().to_string(),
            voted_at,
        }
    }
}

/// Who is voting: a client IP address or an authenticated user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Poll-creation payload.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollDetail {
    #[serde(flatten)]
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub option_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoteReceipt {
    pub option_id: Uuid,
    pub new_count: i64,
}

/// Aggregated tallies for one poll, as served and cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResults {
    pub poll_id: Uuid,
    pub title: String,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub total_votes: i64,
    pub options: Vec<OptionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionResult {
    pub id: Uuid,
    pub text: String,
    pub count: i64,
    pub percentage: f64,
}
