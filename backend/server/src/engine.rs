//! # Tally Engine
//!
//! The only path through which vote tallies change.
//!
//! ## Casting a vote
//! 1. User upvotes are checked against the ledger first. A voter who already holds an upvote
//!    gets the current tally back as [`VoteOutcome::Duplicate`], which makes client retries
//!    after a timeout safe.
//! 2. The event is handed to [`TallyStore::append`], which re-checks the dedupe key, appends
//!    the event and moves the tally in one unit. Two racing upvotes from the same voter both
//!    pass step 1, only one of them gets through step 2.
//! 3. Admin adjustments skip step 1 and are only deduplicated when the caller supplies an
//!    idempotency key.
//!
//! ## Drift
//! The cached tally can disagree with the ledger if something bypassed the engine (a direct
//! [`TallyStore::apply_delta`], a partially restored backup). [`TallyEngine::recount`]
//! replays the ledger and overwrites the tally.
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    models::{EventId, FeatureId, PendingEvent, VoteEvent},
    store::{Commit, Recount, StoreError, TallyStore},
};

/// Largest magnitude a single admin adjustment may carry.
pub const MAX_ADJUSTMENT: i64 = i32::MAX as i64;

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Feature {0} not found")]
    NotFound(FeatureId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for TallyError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => TallyError::NotFound(id),
            StoreError::Storage(message) => TallyError::Storage(message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VoteRequest {
    Upvote {
        voter_key: String,
    },
    Adjustment {
        actor: Option<String>,
        delta: i64,
        idempotency_key: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Applied { votes: u64, event_id: EventId },
    Duplicate { votes: u64 },
}

impl VoteOutcome {
    pub fn votes(&self) -> u64 {
        match self {
            VoteOutcome::Applied { votes, .. } | VoteOutcome::Duplicate { votes } => *votes,
        }
    }
}

#[derive(Clone)]
pub struct TallyEngine {
    store: Arc<dyn TallyStore>,
}

impl TallyEngine {
    pub fn new(store: Arc<dyn TallyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn TallyStore {
        self.store.as_ref()
    }

    pub async fn cast_vote(
        &self,
        feature_id: FeatureId,
        request: VoteRequest,
    ) -> Result<VoteOutcome, TallyError> {
        let event = match request {
            VoteRequest::Upvote { voter_key } => {
                if voter_key.trim().is_empty() {
                    return Err(TallyError::InvalidInput("voter key must not be empty".into()));
                }

                if self.store.has_voted(feature_id, &voter_key).await? {
                    debug!("Voter {voter_key} already upvoted {feature_id}");

                    let votes = self.store.get(feature_id).await?.votes;
                    return Ok(VoteOutcome::Duplicate { votes });
                }

                PendingEvent::upvote(feature_id, voter_key)
            }
            VoteRequest::Adjustment {
                actor,
                delta,
                idempotency_key,
            } => {
                if delta == 0 {
                    return Err(TallyError::InvalidInput("delta must not be zero".into()));
                }
                if delta.unsigned_abs() > MAX_ADJUSTMENT as u64 {
                    return Err(TallyError::InvalidInput(format!(
                        "delta must be within ±{MAX_ADJUSTMENT}"
                    )));
                }

                PendingEvent::adjustment(feature_id, actor, delta, idempotency_key)
            }
        };

        let outcome = match self.store.append(event).await? {
            Commit::Applied { votes, event } => {
                debug!(
                    "Applied {:?} event {} to {feature_id}: delta {}, tally {votes}",
                    event.kind, event.id, event.delta
                );

                VoteOutcome::Applied {
                    votes,
                    event_id: event.id,
                }
            }
            Commit::Duplicate { votes } => {
                debug!("Duplicate vote on {feature_id} rejected at commit");

                VoteOutcome::Duplicate { votes }
            }
        };

        Ok(outcome)
    }

    pub async fn recount(&self, feature_id: FeatureId) -> Result<Recount, TallyError> {
        let recount = self.store.recount(feature_id).await?;

        if recount.drifted() {
            warn!(
                "Tally drift on {feature_id}: cached {}, ledger {}. Cached tally overwritten",
                recount.previous, recount.recounted
            );
        } else {
            info!("Recounted {feature_id}: {} votes", recount.recounted);
        }

        Ok(recount)
    }

    pub async fn has_voted(
        &self,
        feature_id: FeatureId,
        voter_key: &str,
    ) -> Result<bool, TallyError> {
        self.store.get(feature_id).await?;

        Ok(self.store.has_voted(feature_id, voter_key).await?)
    }

    pub async fn history(&self, feature_id: FeatureId) -> Result<Vec<VoteEvent>, TallyError> {
        Ok(self.store.events(feature_id).await?)
    }
}
