//! Typed access to the Redis cache.
//!
//! The cache only ever holds regenerable projections of durable state: the
//! TA's signed artifacts, per-entity signed statements, the entity-kind
//! index, the trust-mark maps, and the tree-walk queue. Key layout:
//!
//! ```text
//! entity_id                  TA entity configuration JWS        (string)
//! historical_keys            historical-keys JWS                (string)
//! subordinates[entityid]     subordinate statement JWS          (hash)
//! subordinates:jwt[entityid] verified entity-config JWS         (hash)
//! rp / op / taia             entity-id sets by kind
//! newsubordinate             tree-walk queue                    (list)
//! entities[entityid]         walker: visited entity configs     (hash)
//! subordinate_query[url]     walker: fetched sub statements     (hash)
//! tm:<entity>[<tmtype>]      trust-mark JWS or "revoked"        (hash)
//! tmtype:<tmtype>            subjects with an active mark       (set)
//! tm:alltime                 sha256 hex of every issued mark    (set)
//! ```

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};

use crate::error::Result;

const KEY_ENTITY_CONFIGURATION: &str = "entity_id";
const KEY_HISTORICAL_KEYS: &str = "historical_keys";
const KEY_SUBORDINATES: &str = "subordinates";
const KEY_SUBORDINATE_JWTS: &str = "subordinates:jwt";
const KEY_WALK_QUEUE: &str = "newsubordinate";
const KEY_ENTITIES: &str = "entities";
const KEY_SUBORDINATE_QUERY: &str = "subordinate_query";
const KEY_ALLTIME_ISSUED: &str = "tm:alltime";

/// Literal stored in a trust-mark hash slot when the mark is revoked.
pub const REVOKED_MARKER: &str = "revoked";

fn trust_mark_key(domain: &str) -> String {
    format!("tm:{domain}")
}

fn tmtype_key(tmtype: &str) -> String {
    format!("tmtype:{tmtype}")
}

/// Entity classification used by the `/list` index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    RelyingParty,
    Provider,
    Authority,
}

impl EntityKind {
    /// Classify an entity by the keys of its metadata document. Anything
    /// that is neither RP nor OP is treated as a federation entity (TA/IA).
    pub fn classify(metadata: &serde_json::Value) -> EntityKind {
        if metadata.get("openid_relying_party").is_some() {
            EntityKind::RelyingParty
        } else if metadata.get("openid_provider").is_some() {
            EntityKind::Provider
        } else {
            EntityKind::Authority
        }
    }

    fn set_key(&self) -> &'static str {
        match self {
            EntityKind::RelyingParty => "rp",
            EntityKind::Provider => "op",
            EntityKind::Authority => "taia",
        }
    }
}

/// Shared handle to the cache. Cloning is cheap; the underlying connection
/// manager multiplexes and reconnects on its own.
#[derive(Clone)]
pub struct Cache {
    con: ConnectionManager,
}

impl Cache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let con = ConnectionManager::new(client).await?;
        Ok(Cache { con })
    }

    // ── TA artifacts ───────────────────────────────────────────────────

    pub async fn set_entity_configuration(&self, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set(KEY_ENTITY_CONFIGURATION, jws).await?;
        Ok(())
    }

    pub async fn entity_configuration(&self) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(con.get(KEY_ENTITY_CONFIGURATION).await?)
    }

    pub async fn set_historical_keys(&self, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.set(KEY_HISTORICAL_KEYS, jws).await?;
        Ok(())
    }

    pub async fn historical_keys(&self) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(con.get(KEY_HISTORICAL_KEYS).await?)
    }

    // ── Subordinates ───────────────────────────────────────────────────

    pub async fn put_subordinate_statement(&self, entityid: &str, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hset(KEY_SUBORDINATES, entityid, jws).await?;
        Ok(())
    }

    pub async fn subordinate_statement(&self, entityid: &str) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(con.hget(KEY_SUBORDINATES, entityid).await?)
    }

    pub async fn subordinate_ids(&self) -> Result<Vec<String>> {
        let mut con = self.con.clone();
        Ok(con.hkeys(KEY_SUBORDINATES).await?)
    }

    /// The verified entity configuration the subordinate presented at
    /// admission time.
    pub async fn put_subordinate_entity_jws(&self, entityid: &str, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hset(KEY_SUBORDINATE_JWTS, entityid, jws).await?;
        Ok(())
    }

    pub async fn add_entity_kind(&self, kind: EntityKind, entityid: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.sadd(kind.set_key(), entityid).await?;
        Ok(())
    }

    // ── Tree-walk queue and projections ────────────────────────────────

    pub async fn enqueue_walk(&self, entityid: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.lpush(KEY_WALK_QUEUE, entityid).await?;
        Ok(())
    }

    pub async fn pop_walk(&self) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(con.rpop(KEY_WALK_QUEUE, None).await?)
    }

    pub async fn record_entity(&self, entityid: &str, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hset(KEY_ENTITIES, entityid, jws).await?;
        Ok(())
    }

    pub async fn record_subordinate_query(&self, url: &str, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hset(KEY_SUBORDINATE_QUERY, url, jws).await?;
        Ok(())
    }

    // ── Trust marks ────────────────────────────────────────────────────

    pub async fn put_trust_mark(&self, domain: &str, tmtype: &str, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.hset(trust_mark_key(domain), tmtype, jws).await?;
        let _: () = con.sadd(tmtype_key(tmtype), domain).await?;
        Ok(())
    }

    /// Raw slot value: a JWS, the `"revoked"` tombstone, or nothing.
    pub async fn trust_mark(&self, domain: &str, tmtype: &str) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(con.hget(trust_mark_key(domain), tmtype).await?)
    }

    pub async fn revoke_trust_mark(&self, domain: &str, tmtype: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con
            .hset(trust_mark_key(domain), tmtype, REVOKED_MARKER)
            .await?;
        let _: () = con.srem(tmtype_key(tmtype), domain).await?;
        Ok(())
    }

    pub async fn trust_marked_subjects(&self, tmtype: &str) -> Result<Vec<String>> {
        let mut con = self.con.clone();
        Ok(con.smembers(tmtype_key(tmtype)).await?)
    }

    pub async fn is_trust_marked(&self, tmtype: &str, domain: &str) -> Result<bool> {
        let mut con = self.con.clone();
        Ok(con.sismember(tmtype_key(tmtype), domain).await?)
    }

    /// Record a mark in the all-time issued set. The status endpoint uses
    /// this set's semantics indirectly: a mark that was once issued but no
    /// longer matches the live slot is `invalid`, not `not_found`.
    pub async fn record_issued(&self, jws: &str) -> Result<()> {
        let mut con = self.con.clone();
        let _: () = con.sadd(KEY_ALLTIME_ISSUED, issued_digest(jws)).await?;
        Ok(())
    }

    pub async fn was_ever_issued(&self, jws: &str) -> Result<bool> {
        let mut con = self.con.clone();
        Ok(con.sismember(KEY_ALLTIME_ISSUED, issued_digest(jws)).await?)
    }
}

/// Hex SHA-256 of a serialized JWS, the member format of `tm:alltime`.
pub fn issued_digest(jws: &str) -> String {
    hex::encode(Sha256::digest(jws.as_bytes()))
}
