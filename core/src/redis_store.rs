//! Redis-backed `StateStore` for breakers shared across processes
//!
//! Each key is a hash with two fields: `v` (version) and `r` (the record as
//! JSON). Versions come from a companion `:seq` counter that is never reset,
//! so a key that expired and was recreated never reuses an old version.
//! Conditional writes run as one Lua script, which Redis executes atomically.
//!
//! Both keys share a hash tag so they land in the same cluster slot.

use crate::errors::StoreError;
use crate::record::{CircuitRecord, Version, Versioned};
use crate::storage::{CasOutcome, StateStore};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

/// ARGV[1]: expected version, "" for absent, "*" for unconditional
/// ARGV[2]: record JSON
/// ARGV[3]: TTL in milliseconds, "0" to persist
const WRITE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] ~= '*' then
  if ARGV[1] == '' then
    if current then return -1 end
  elseif current ~= ARGV[1] then
    return -1
  end
end
local v = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', v, 'r', ARGV[2])
if tonumber(ARGV[3]) > 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
else
  redis.call('PERSIST', KEYS[1])
end
return v
"#;

const UNCONDITIONAL: &str = "*";
const DEFAULT_PREFIX: &str = "breaker:";

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    script: Arc<Script>,
}

impl RedisStore {
    /// Connect to `url` (redis:// or rediss://)
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        tracing::info!(url, "connected to redis state store");
        Ok(Self::from_manager(conn))
    }

    /// Reuse an existing connection manager
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
            script: Arc::new(Script::new(WRITE_SCRIPT)),
        }
    }

    /// Namespace for every key this store touches
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    async fn run_write(
        &self,
        key: &str,
        expected: &str,
        record: &CircuitRecord,
        ttl: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| StoreError::Corrupt(format!("encode {key}: {e}")))?;
        let mut conn = self.conn.clone();

        let result: i64 = self
            .script
            .key(record_key(&self.prefix, key))
            .key(seq_key(&self.prefix, key))
            .arg(expected)
            .arg(payload)
            .arg(ttl_arg(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(result)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.conn.clone();
        let (version, record): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(record_key(&self.prefix, key))
            .arg("v")
            .arg("r")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        decode(key, version, record)
    }

    async fn write(&self, key: &str, record: &CircuitRecord) -> Result<Version, StoreError> {
        let v = self.run_write(key, UNCONDITIONAL, record, None).await?;
        version_from(key, v)
    }

    async fn write_with_ttl(
        &self,
        key: &str,
        record: &CircuitRecord,
        ttl: Duration,
    ) -> Result<Version, StoreError> {
        let v = self.run_write(key, UNCONDITIONAL, record, Some(ttl)).await?;
        version_from(key, v)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<Version>,
        record: &CircuitRecord,
        ttl: Option<Duration>,
    ) -> Result<CasOutcome, StoreError> {
        let expected = expected.map(|v| v.get().to_string()).unwrap_or_default();
        match self.run_write(key, &expected, record, ttl).await? {
            -1 => Ok(CasOutcome::Conflict),
            v => version_from(key, v).map(CasOutcome::Swapped),
        }
    }
}

fn record_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{{{key}}}")
}

fn seq_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{{{key}}}:seq")
}

fn unavailable(e: redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// PEXPIRE argument; sub-millisecond TTLs round up so they still expire
fn ttl_arg(ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) => (ttl.as_millis() as u64).max(1),
        None => 0,
    }
}

fn version_from(key: &str, raw: i64) -> Result<Version, StoreError> {
    u64::try_from(raw)
        .map(Version::new)
        .map_err(|_| StoreError::Corrupt(format!("{key}: negative version {raw}")))
}

fn decode(
    key: &str,
    version: Option<String>,
    record: Option<String>,
) -> Result<Option<Versioned>, StoreError> {
    let (version, record) = match (version, record) {
        (None, None) => return Ok(None),
        (Some(v), Some(r)) => (v, r),
        _ => return Err(StoreError::Corrupt(format!("{key}: half-written hash"))),
    };

    let version = version
        .parse::<u64>()
        .map_err(|e| StoreError::Corrupt(format!("{key}: version {version:?}: {e}")))?;
    let record: CircuitRecord = serde_json::from_str(&record)
        .map_err(|e| StoreError::Corrupt(format!("{key}: record: {e}")))?;

    Ok(Some(Versioned {
        record,
        version: Version::new(version),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;

    #[test]
    fn test_keys_share_hash_tag() {
        assert_eq!(record_key("breaker:", "payments"), "breaker:{payments}");
        assert_eq!(seq_key("breaker:", "payments"), "breaker:{payments}:seq");
    }

    #[test]
    fn test_decode_absent_key() {
        assert_eq!(decode("k", None, None), Ok(None));
    }

    #[test]
    fn test_decode_record() {
        let record = CircuitRecord::closed(0).opened(10, Duration::from_secs(1));
        let json = serde_json::to_string(&record).unwrap();

        let decoded = decode("k", Some("7".into()), Some(json)).unwrap().unwrap();
        assert_eq!(decoded.version, Version::new(7));
        assert_eq!(decoded.record.state, CircuitState::Open);
        assert_eq!(decoded.record.open_until, Some(1_010));
    }

    #[test]
    fn test_decode_rejects_partial_hash() {
        assert!(matches!(
            decode("k", Some("3".into()), None),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("k", Some("x".into()), Some("{}".into())),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            decode("k", Some("1".into()), Some("not json".into())),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_ttl_arg() {
        assert_eq!(ttl_arg(None), 0);
        assert_eq!(ttl_arg(Some(Duration::from_secs(2))), 2_000);
        assert_eq!(ttl_arg(Some(Duration::from_micros(10))), 1);
    }

    #[test]
    fn test_version_from_rejects_negative() {
        assert_eq!(version_from("k", 4), Ok(Version::new(4)));
        assert!(version_from("k", -1).is_err());
    }
}
