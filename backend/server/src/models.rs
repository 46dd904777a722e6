//! # Records
//!
//! Feature records and the vote events that move their tallies.
//!
//! ## Feature
//! - Keyed by a v4 UUID assigned at creation
//! - `votes` is a cached tally, only ever changed through the store's atomic entry points
//! - Never deleted
//!
//! ## Vote Event
//! - Append-only, immutable once recorded
//! - `delta` is what was actually applied to the tally after clamping at 0, so replaying
//!   the ledger reproduces the tally exactly
//! - At most one `user_upvote` per (feature, voter) and at most one `admin_adjustment` per
//!   (feature, idempotency key)
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    engine::TallyError,
    utils::{MAX_TITLE_LEN, normalize_title},
};

pub type FeatureId = Uuid;
pub type EventId = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub title: String,
    pub description: String,
    pub votes: u64,
    pub created_at: DateTime<Utc>,
}

/// Validated input for creating a feature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFeature {
    pub title: String,
    pub description: String,
}

impl NewFeature {
    pub fn new(title: &str, description: Option<&str>) -> Result<Self, TallyError> {
        let title = normalize_title(title);

        if title.is_empty() {
            return Err(TallyError::InvalidInput("title must not be empty".into()));
        }

        if title.chars().count() > MAX_TITLE_LEN {
            return Err(TallyError::InvalidInput(format!(
                "title must be at most {MAX_TITLE_LEN} characters"
            )));
        }

        Ok(Self {
            title,
            description: description.unwrap_or_default().trim().to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    UserUpvote,
    AdminAdjustment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteEvent {
    pub id: EventId,
    pub feature_id: FeatureId,
    pub voter_key: Option<String>,
    pub kind: VoteKind,
    pub delta: i64,
    pub requested_delta: i64,
    pub idempotency_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Uniqueness constraint an event is checked against before it is appended.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DedupeKey {
    Voter(String),
    Idempotency(String),
}

/// A vote event that has not been accepted yet. The store assigns its id,
/// timestamp and applied delta when it commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    pub feature_id: FeatureId,
    pub voter_key: Option<String>,
    pub kind: VoteKind,
    pub requested_delta: i64,
    pub idempotency_key: Option<String>,
}

impl PendingEvent {
    pub fn upvote(feature_id: FeatureId, voter_key: String) -> Self {
        Self {
            feature_id,
            voter_key: Some(voter_key),
            kind: VoteKind::UserUpvote,
            requested_delta: 1,
            idempotency_key: None,
        }
    }

    pub fn adjustment(
        feature_id: FeatureId,
        actor: Option<String>,
        delta: i64,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            feature_id,
            voter_key: actor,
            kind: VoteKind::AdminAdjustment,
            requested_delta: delta,
            idempotency_key,
        }
    }

    pub fn dedupe_key(&self) -> Option<DedupeKey> {
        match self.kind {
            VoteKind::UserUpvote => self.voter_key.clone().map(DedupeKey::Voter),
            VoteKind::AdminAdjustment => self.idempotency_key.clone().map(DedupeKey::Idempotency),
        }
    }

    pub fn record(self, id: EventId, delta: i64, timestamp: DateTime<Utc>) -> VoteEvent {
        VoteEvent {
            id,
            feature_id: self.feature_id,
            voter_key: self.voter_key,
            kind: self.kind,
            delta,
            requested_delta: self.requested_delta,
            idempotency_key: self.idempotency_key,
            timestamp,
        }
    }
}
