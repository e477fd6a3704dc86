// src/state.rs
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::EngineSettings;
use crate::ledger::LedgerStore;
use crate::poll::VoteEngine;
use crate::rate_limit::{CounterStore, RateLimiter};
use crate::results::ResultAggregator;
use crate::services::PollService;
use crate::sweeper::ExpirySweeper;

/// Wired-up core shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<VoteEngine>,
    pub results: Arc<ResultAggregator>,
    pub polls: Arc<PollService>,
    pub sweeper: Arc<ExpirySweeper>,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        counters: Arc<dyn CounterStore>,
        cache: Arc<dyn ResultCache>,
        settings: &EngineSettings,
    ) -> Self {
        let limiter = RateLimiter::new(counters, settings.vote_policy, settings.poll_policy);
        let results = Arc::new(ResultAggregator::new(
            ledger.clone(),
            cache,
            settings.results_cache_ttl,
            settings.store_timeout,
        ));
        let engine = Arc::new(VoteEngine::new(
            ledger.clone(),
            limiter.clone(),
            results.clone(),
            settings.store_timeout,
        ));
        let polls = Arc::new(PollService::new(
            ledger.clone(),
            limiter,
            results.clone(),
            settings.store_timeout,
        ));
        let sweeper = Arc::new(ExpirySweeper::new(
            ledger,
            results.clone(),
            settings.store_timeout,
            settings.sweep_interval,
        ));

        Self {
            engine,
            results,
            polls,
            sweeper,
        }
    }
}
