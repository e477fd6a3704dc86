//! Anonymous polling backend.
//!
//! The voting core guarantees at most one vote per voter per poll, keeps the
//! per-option counters equal to the vote ledger, serves cached tallies and
//! rate-limits voters through a shared counter store. Postgres holds the
//! ledger; Redis holds rate-limit windows and result snapshots.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod poll;
pub mod rate_limit;
pub mod results;
pub mod routes;
pub mod services;
pub mod state;
pub mod sweeper;

pub use config::{Config, EngineSettings};
pub use error::{AppError, StoreError, VoteError};
pub use poll::VoteEngine;
pub use rate_limit::{Action, RateDecision, RateLimiter, RatePolicy};
pub use results::ResultAggregator;
pub use state::AppState;
pub use sweeper::{ExpirySweeper, SweepReport};
