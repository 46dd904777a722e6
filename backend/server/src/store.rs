//! # Storage seam
//!
//! Feature Store and Vote Ledger behind one trait so a backend can commit a ledger append
//! and the matching tally change as a single unit.
//!
//! ## Backends
//! - [`MemoryStore`](crate::memory::MemoryStore): one async mutex per feature, features in a
//!   concurrent map so unrelated features never contend
//! - [`RedisStore`](crate::database::RedisStore): each mutation is one Lua script, which Redis
//!   runs atomically
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::{Feature, FeatureId, NewFeature, PendingEvent, VoteEvent};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Feature {0} not found")]
    NotFound(FeatureId),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result of an [`TallyStore::append`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Commit {
    Applied { votes: u64, event: VoteEvent },
    Duplicate { votes: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Recount {
    pub previous: u64,
    pub recounted: u64,
}

impl Recount {
    pub fn drifted(&self) -> bool {
        self.previous != self.recounted
    }
}

#[async_trait]
pub trait TallyStore: Send + Sync {
    async fn create(&self, feature: NewFeature) -> Result<Feature, StoreError>;

    async fn get(&self, id: FeatureId) -> Result<Feature, StoreError>;

    /// All features in creation order. Features are fetched as the stream is polled.
    fn list(&self) -> BoxStream<'_, Result<Feature, StoreError>>;

    /// Adds `delta` to the tally, clamped at 0, and returns the new tally.
    async fn apply_delta(&self, id: FeatureId, delta: i64) -> Result<u64, StoreError>;

    /// Checks the event's dedupe key, appends it to the ledger and applies its delta to the
    /// tally. Either all of it is observable afterwards or none of it is.
    async fn append(&self, event: PendingEvent) -> Result<Commit, StoreError>;

    async fn has_voted(&self, id: FeatureId, voter_key: &str) -> Result<bool, StoreError>;

    /// Tally obtained by replaying the feature's ledger from zero, clamped the same way
    /// live commits are.
    async fn sum(&self, id: FeatureId) -> Result<u64, StoreError>;

    async fn events(&self, id: FeatureId) -> Result<Vec<VoteEvent>, StoreError>;

    /// Overwrites the cached tally with [`TallyStore::sum`].
    async fn recount(&self, id: FeatureId) -> Result<Recount, StoreError>;
}

/// Largest tally a feature can hold. Redis scripts do their arithmetic in doubles, which
/// are exact up to 2^53.
pub const MAX_TALLY: u64 = (1 << 53) - 1;

/// Applies `delta` to `current`, keeping the result within `0..=MAX_TALLY`.
///
/// Returns the new tally and the delta that was actually applied.
pub fn clamp_delta(current: u64, delta: i64) -> (u64, i64) {
    let next = (current as i128 + delta as i128).clamp(0, MAX_TALLY as i128) as u64;

    (next, (next as i128 - current as i128) as i64)
}

pub(crate) fn replay(events: &[VoteEvent]) -> u64 {
    events
        .iter()
        .fold(0, |votes, event| clamp_delta(votes, event.delta).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_delta() {
        assert_eq!(clamp_delta(0, 1), (1, 1));
        assert_eq!(clamp_delta(5, -2), (3, -2));
        assert_eq!(clamp_delta(2, -5), (0, -2));
        assert_eq!(clamp_delta(0, -1), (0, 0));
    }

    #[test]
    fn test_clamp_delta_caps_at_max_tally() {
        assert_eq!(clamp_delta(MAX_TALLY - 1, 5), (MAX_TALLY, 1));
        assert_eq!(clamp_delta(0, i64::MAX), (MAX_TALLY, MAX_TALLY as i64));
        assert_eq!(clamp_delta(MAX_TALLY, i64::MIN), (0, -(MAX_TALLY as i64)));
    }

    #[test]
    fn test_replay_clamps_each_step() {
        let event = |delta| {
            PendingEvent::adjustment(uuid::Uuid::nil(), None, delta, None).record(
                0,
                delta,
                chrono::Utc::now(),
            )
        };

        assert_eq!(replay(&[event(1), event(-4), event(2)]), 2);
        assert_eq!(replay(&[event(i64::MAX), event(i64::MAX)]), MAX_TALLY);
        assert_eq!(replay(&[]), 0);
    }
}
