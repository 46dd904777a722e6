//! # In-memory store
//!
//! Process-local backend used when no Redis URL is configured, and by the tests.
//!
//! ## Layout
//! - `DashMap` from feature id to that feature's entry, so lookups never take a global lock
//! - Each entry sits behind its own `tokio::sync::Mutex`: the record, its ledger and its
//!   dedupe sets change together while the mutex is held
//! - Creation order is kept separately for listing
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::{DedupeKey, Feature, FeatureId, NewFeature, PendingEvent, VoteEvent},
    store::{Commit, Recount, StoreError, TallyStore, clamp_delta, replay},
};

struct Entry {
    feature: Feature,
    events: Vec<VoteEvent>,
    dedupe_keys: HashSet<DedupeKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    features: DashMap<FeatureId, Arc<Mutex<Entry>>>,
    order: RwLock<Vec<FeatureId>>,
    last_event_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: FeatureId) -> Result<Arc<Mutex<Entry>>, StoreError> {
        self.features
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl TallyStore for MemoryStore {
    async fn create(&self, feature: NewFeature) -> Result<Feature, StoreError> {
        let feature = Feature {
            id: Uuid::new_v4(),
            title: feature.title,
            description: feature.description,
            votes: 0,
            created_at: Utc::now(),
        };

        let entry = Entry {
            feature: feature.clone(),
            events: Vec::new(),
            dedupe_keys: HashSet::new(),
        };

        // Held across the insert so listing order matches creation order.
        let mut order = self.order.write();
        self.features.insert(feature.id, Arc::new(Mutex::new(entry)));
        order.push(feature.id);

        Ok(feature)
    }

    async fn get(&self, id: FeatureId) -> Result<Feature, StoreError> {
        let entry = self.entry(id)?;
        let entry = entry.lock().await;

        Ok(entry.feature.clone())
    }

    fn list(&self) -> BoxStream<'_, Result<Feature, StoreError>> {
        let ids = self.order.read().clone();

        stream::iter(ids).then(move |id| self.get(id)).boxed()
    }

    async fn apply_delta(&self, id: FeatureId, delta: i64) -> Result<u64, StoreError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;

        let (votes, _) = clamp_delta(entry.feature.votes, delta);
        entry.feature.votes = votes;

        Ok(votes)
    }

    async fn append(&self, event: PendingEvent) -> Result<Commit, StoreError> {
        let entry = self.entry(event.feature_id)?;
        let mut entry = entry.lock().await;

        let dedupe_key = event.dedupe_key();
        if let Some(key) = &dedupe_key {
            if entry.dedupe_keys.contains(key) {
                return Ok(Commit::Duplicate {
                    votes: entry.feature.votes,
                });
            }
        }

        let (votes, applied) = clamp_delta(entry.feature.votes, event.requested_delta);
        let id = self.last_event_id.fetch_add(1, Ordering::Relaxed) + 1;
        let event = event.record(id, applied, Utc::now());

        if let Some(key) = dedupe_key {
            entry.dedupe_keys.insert(key);
        }
        entry.events.push(event.clone());
        entry.feature.votes = votes;

        Ok(Commit::Applied { votes, event })
    }

    async fn has_voted(&self, id: FeatureId, voter_key: &str) -> Result<bool, StoreError> {
        let Ok(entry) = self.entry(id) else {
            return Ok(false);
        };
        let entry = entry.lock().await;

        Ok(entry
            .dedupe_keys
            .contains(&DedupeKey::Voter(voter_key.to_string())))
    }

    async fn sum(&self, id: FeatureId) -> Result<u64, StoreError> {
        let entry = self.entry(id)?;
        let entry = entry.lock().await;

        Ok(replay(&entry.events))
    }

    async fn events(&self, id: FeatureId) -> Result<Vec<VoteEvent>, StoreError> {
        let entry = self.entry(id)?;
        let entry = entry.lock().await;

        Ok(entry.events.clone())
    }

    async fn recount(&self, id: FeatureId) -> Result<Recount, StoreError> {
        let entry = self.entry(id)?;
        let mut entry = entry.lock().await;

        let previous = entry.feature.votes;
        let recounted = replay(&entry.events);
        entry.feature.votes = recounted;

        Ok(Recount {
            previous,
            recounted,
        })
    }
}
