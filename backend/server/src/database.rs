//! # Redis
//!
//! Durable backend for features and their vote ledgers.
//!
//! ## Layout
//! - `{prefix}:features`: list of feature ids in creation order
//! - `{prefix}:feature:{id}`: hash with `id`, `title`, `description`, `votes`, `created_at`
//! - `{prefix}:ledger:{id}`: list of JSON encoded vote events, oldest first
//! - `{prefix}:voters:{id}`: set of voter keys holding an upvote
//! - `{prefix}:adjustments:{id}`: set of admin idempotency keys already applied
//! - `{prefix}:event_seq`: counter handing out event ids
//!
//! ## Atomicity
//! Every mutation of `votes` is a Lua script. Redis runs a script to completion before
//! serving any other command, so the dedupe check, the ledger push and the tally update
//! land together. Scripts validate everything before their first write so an error never
//! leaves half of a commit behind.
//!
//! The sequence key is shared by all features, so this layout expects a single Redis node
//! rather than a cluster.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    TryStreamExt,
    stream::{self, BoxStream, StreamExt},
};
use redis::{
    AsyncCommands, Client, RedisError, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    models::{DedupeKey, Feature, FeatureId, NewFeature, PendingEvent, VoteEvent},
    store::{Commit, MAX_TALLY, Recount, StoreError, TallyStore, replay},
};

// Numbers are written with '%d': a bare Lua number is stored as '%.14g', which turns
// 1e14 into "1e+14". ARGV carries the `MAX_TALLY` cap.
const APPLY_DELTA_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'votes')
if not current then
    return -1
end
local next = math.min(math.max(tonumber(current) + tonumber(ARGV[1]), 0), tonumber(ARGV[2]))
redis.call('HSET', KEYS[1], 'votes', string.format('%d', next))
return next
"#;

// ARGV[3] is the event as a JSON object minus `id` and `delta`, which are spliced in front.
// Returns {status, votes, event id, applied delta}; status 0 applied, 1 duplicate, 2 missing.
const APPEND_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'votes')
if not current then
    return {2, 0, 0, 0}
end
current = tonumber(current)
if ARGV[1] ~= '' and redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
    return {1, current, 0, 0}
end
local next = math.min(math.max(current + tonumber(ARGV[2]), 0), tonumber(ARGV[4]))
local id = redis.call('INCR', KEYS[4])
local event = string.format('{"id":%d,"delta":%d,', id, next - current) .. string.sub(ARGV[3], 2)
redis.call('RPUSH', KEYS[2], event)
redis.call('HSET', KEYS[1], 'votes', string.format('%d', next))
if ARGV[1] ~= '' then
    redis.call('SADD', KEYS[3], ARGV[1])
end
return {0, next, id, next - current}
"#;

// Replays the ledger with the same clamp as APPEND_SCRIPT.
// Returns {previous, recounted}, or {-1, 0} when the feature is missing.
const RECOUNT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'votes')
if not current then
    return {-1, 0}
end
local cap = tonumber(ARGV[1])
local total = 0
for _, raw in ipairs(redis.call('LRANGE', KEYS[2], 0, -1)) do
    total = math.min(math.max(total + cjson.decode(raw)['delta'], 0), cap)
end
redis.call('HSET', KEYS[1], 'votes', string.format('%d', total))
return {tonumber(current), total}
"#;

const STATUS_APPLIED: i64 = 0;
const STATUS_DUPLICATE: i64 = 1;

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    info!("Connected to Redis");

    Ok(connection_manager)
}

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        StoreError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Storage(error.to_string())
    }
}

pub struct RedisStore {
    connection: ConnectionManager,
    prefix: String,
    apply_delta_script: Script,
    append_script: Script,
    recount_script: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            apply_delta_script: Script::new(APPLY_DELTA_SCRIPT),
            append_script: Script::new(APPEND_SCRIPT),
            recount_script: Script::new(RECOUNT_SCRIPT),
        }
    }

    fn order_key(&self) -> String {
        format!("{}:features", self.prefix)
    }

    fn feature_key(&self, id: FeatureId) -> String {
        format!("{}:feature:{id}", self.prefix)
    }

    fn ledger_key(&self, id: FeatureId) -> String {
        format!("{}:ledger:{id}", self.prefix)
    }

    fn voters_key(&self, id: FeatureId) -> String {
        format!("{}:voters:{id}", self.prefix)
    }

    fn adjustments_key(&self, id: FeatureId) -> String {
        format!("{}:adjustments:{id}", self.prefix)
    }

    fn sequence_key(&self) -> String {
        format!("{}:event_seq", self.prefix)
    }

    async fn feature_ids(&self) -> Result<Vec<FeatureId>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Vec<String> = connection.lrange(self.order_key(), 0, -1).await?;

        raw.iter()
            .map(|id| Uuid::parse_str(id).map_err(|e| StoreError::Storage(e.to_string())))
            .collect()
    }
}

fn parse_feature(fields: &HashMap<String, String>) -> Result<Feature, StoreError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Storage(format!("feature record missing {name}")))
    };
    let corrupt = |e: &dyn std::fmt::Display| StoreError::Storage(e.to_string());

    Ok(Feature {
        id: Uuid::parse_str(field("id")?).map_err(|e| corrupt(&e))?,
        title: field("title")?.clone(),
        description: field("description")?.clone(),
        votes: field("votes")?.parse::<u64>().map_err(|e| corrupt(&e))?,
        created_at: DateTime::parse_from_rfc3339(field("created_at")?)
            .map_err(|e| corrupt(&e))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl TallyStore for RedisStore {
    async fn create(&self, feature: NewFeature) -> Result<Feature, StoreError> {
        let feature = Feature {
            id: Uuid::new_v4(),
            title: feature.title,
            description: feature.description,
            votes: 0,
            created_at: Utc::now(),
        };

        let mut connection = self.connection.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                self.feature_key(feature.id),
                &[
                    ("id", feature.id.to_string()),
                    ("title", feature.title.clone()),
                    ("description", feature.description.clone()),
                    ("votes", feature.votes.to_string()),
                    ("created_at", feature.created_at.to_rfc3339()),
                ],
            )
            .ignore()
            .rpush(self.order_key(), feature.id.to_string())
            .ignore()
            .query_async::<()>(&mut connection)
            .await?;

        Ok(feature)
    }

    async fn get(&self, id: FeatureId) -> Result<Feature, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection.hgetall(self.feature_key(id)).await?;

        if fields.is_empty() {
            return Err(StoreError::NotFound(id));
        }

        parse_feature(&fields)
    }

    fn list(&self) -> BoxStream<'_, Result<Feature, StoreError>> {
        stream::once(self.feature_ids())
            .map_ok(|ids| stream::iter(ids).map(Ok::<_, StoreError>))
            .try_flatten()
            .and_then(move |id| self.get(id))
            .boxed()
    }

    async fn apply_delta(&self, id: FeatureId, delta: i64) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let votes: i64 = self
            .apply_delta_script
            .key(self.feature_key(id))
            .arg(delta)
            .arg(MAX_TALLY)
            .invoke_async(&mut connection)
            .await?;

        u64::try_from(votes).map_err(|_| StoreError::NotFound(id))
    }

    async fn append(&self, event: PendingEvent) -> Result<Commit, StoreError> {
        let id = event.feature_id;
        let (dedupe_set, dedupe_member) = match event.dedupe_key() {
            Some(DedupeKey::Voter(voter)) => (self.voters_key(id), voter),
            Some(DedupeKey::Idempotency(key)) => (self.adjustments_key(id), key),
            None => (self.adjustments_key(id), String::new()),
        };

        let timestamp = Utc::now();
        let template = json!({
            "feature_id": id,
            "voter_key": event.voter_key,
            "kind": event.kind,
            "requested_delta": event.requested_delta,
            "idempotency_key": event.idempotency_key,
            "timestamp": timestamp,
        });

        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self
            .append_script
            .key(self.feature_key(id))
            .key(self.ledger_key(id))
            .key(dedupe_set)
            .key(self.sequence_key())
            .arg(dedupe_member)
            .arg(event.requested_delta)
            .arg(template.to_string())
            .arg(MAX_TALLY)
            .invoke_async(&mut connection)
            .await?;

        let [status, votes, event_id, applied] = reply[..] else {
            return Err(StoreError::Storage(format!(
                "unexpected append reply: {reply:?}"
            )));
        };

        match status {
            STATUS_APPLIED => Ok(Commit::Applied {
                votes: votes as u64,
                event: event.record(event_id as u64, applied, timestamp),
            }),
            STATUS_DUPLICATE => Ok(Commit::Duplicate {
                votes: votes as u64,
            }),
            _ => Err(StoreError::NotFound(id)),
        }
    }

    async fn has_voted(&self, id: FeatureId, voter_key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();

        Ok(connection.sismember(self.voters_key(id), voter_key).await?)
    }

    async fn sum(&self, id: FeatureId) -> Result<u64, StoreError> {
        Ok(replay(&self.events(id).await?))
    }

    async fn events(&self, id: FeatureId) -> Result<Vec<VoteEvent>, StoreError> {
        let mut connection = self.connection.clone();
        let exists: bool = connection.exists(self.feature_key(id)).await?;

        if !exists {
            return Err(StoreError::NotFound(id));
        }

        let raw: Vec<String> = connection.lrange(self.ledger_key(id), 0, -1).await?;

        raw.iter()
            .map(|event| serde_json::from_str(event).map_err(StoreError::from))
            .collect()
    }

    async fn recount(&self, id: FeatureId) -> Result<Recount, StoreError> {
        let mut connection = self.connection.clone();
        let (previous, recounted): (i64, i64) = self
            .recount_script
            .key(self.feature_key(id))
            .key(self.ledger_key(id))
            .arg(MAX_TALLY)
            .invoke_async(&mut connection)
            .await?;

        if previous < 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(Recount {
            previous: previous as u64,
            recounted: recounted as u64,
        })
    }
}
