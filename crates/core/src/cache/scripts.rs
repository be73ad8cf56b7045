//! Atomic coordination scripts.
//!
//! Each script runs server-side with no other command interleaving. Every
//! coordination-store backend must implement exactly this decision logic
//! over exactly these keys; the Lua sources are the reference.
//!
//! Argument layouts (`KEYS` / `ARGV`) are listed on each variant. Integers
//! are passed as decimal strings, epochs included (a missing epoch reads as
//! `"0"`).

use std::fmt;

use super::{CacheError, Result};

/// The catalogue of atomic scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScript {
    /// Decide how a query read proceeds.
    ///
    /// KEYS: `QCACHE`, `QREFCOUNT`, `QDATA`, `QWRITER`.
    /// ARGV: writer token, writer lease (s), reader lease (s).
    /// Replies: `cache`, `nocache-store`, `nocache-nostore`.
    ///
    /// On `cache` only `QREFCOUNT` and `QDATA` get the reader lease.
    /// `QCACHE` keeps its short query TTL, so a long replay can outlive it;
    /// the reader still finishes from `QDATA`, and a later `obtain` refills.
    Obtain,
    /// A reader finished iterating `QDATA`.
    ///
    /// KEYS: `QCACHE`, `QREFCOUNT`, `QDATA`, `QWRITER`. ARGV: query ttl (s).
    /// Replies: `retained`, `released`, `discarded`, `absent`.
    ///
    /// `absent` means the reader's lease already expired: the refcount is
    /// gone, or a new fill owns `QDATA`. Nothing is touched then.
    Release,
    /// Append one batch of results during a fill.
    ///
    /// KEYS: `EPOCH`, `QDATA`, `QWRITER`, then one `CACHEDIN` per entity.
    /// ARGV: epoch, fingerprint, writer token, index ttl (s), writer lease
    /// (s), then one payload per entity.
    /// Replies: `written`, `invalidated`.
    AppendFill,
    /// Promote a completed fill.
    ///
    /// KEYS: `EPOCH`, `QCACHE`, `QREFCOUNT`, `QDATA`, `QWRITER`, then every
    /// index bucket. ARGV: epoch, fingerprint, writer token, query ttl (s),
    /// index ttl (s).
    /// Replies: `written`, `invalidated`.
    FinalizeFill,
    /// Drop a fill that failed or was cancelled.
    ///
    /// KEYS: `QDATA`, `QWRITER`. ARGV: writer token.
    /// Replies: `discarded`, `absent`.
    AbandonFill,
    /// Store a point-lookup result if no write happened since the read began.
    ///
    /// KEYS: `EPOCH`, `ENTITY`. ARGV: epoch, payload, entity ttl (s).
    /// Replies: `written`, `invalidated`.
    TryFillEntity,
    /// Invalidate one cached query.
    ///
    /// KEYS: `QCACHE`, `QREFCOUNT`, `QDATA`, `QWRITER`.
    /// Replies: `writer-flagged`, `detached`, `purged`, `absent`.
    PurgeQuery,
}

impl CacheScript {
    pub const ALL: [CacheScript; 7] = [
        CacheScript::Obtain,
        CacheScript::Release,
        CacheScript::AppendFill,
        CacheScript::FinalizeFill,
        CacheScript::AbandonFill,
        CacheScript::TryFillEntity,
        CacheScript::PurgeQuery,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheScript::Obtain => "obtain",
            CacheScript::Release => "release",
            CacheScript::AppendFill => "append-fill",
            CacheScript::FinalizeFill => "finalize-fill",
            CacheScript::AbandonFill => "abandon-fill",
            CacheScript::TryFillEntity => "try-fill-entity",
            CacheScript::PurgeQuery => "purge-query",
        }
    }

    /// Lua source executed by script-capable stores.
    pub fn source(&self) -> &'static str {
        match self {
            CacheScript::Obtain => OBTAIN_SCRIPT,
            CacheScript::Release => RELEASE_SCRIPT,
            CacheScript::AppendFill => APPEND_FILL_SCRIPT,
            CacheScript::FinalizeFill => FINALIZE_FILL_SCRIPT,
            CacheScript::AbandonFill => ABANDON_FILL_SCRIPT,
            CacheScript::TryFillEntity => TRY_FILL_ENTITY_SCRIPT,
            CacheScript::PurgeQuery => PURGE_QUERY_SCRIPT,
        }
    }
}

impl fmt::Display for CacheScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Enumerated result code returned by a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptReply {
    Cache,
    NoCacheStore,
    NoCacheNoStore,
    Written,
    Invalidated,
    Retained,
    Released,
    Discarded,
    WriterFlagged,
    Detached,
    Purged,
    Absent,
}

impl ScriptReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptReply::Cache => "cache",
            ScriptReply::NoCacheStore => "nocache-store",
            ScriptReply::NoCacheNoStore => "nocache-nostore",
            ScriptReply::Written => "written",
            ScriptReply::Invalidated => "invalidated",
            ScriptReply::Retained => "retained",
            ScriptReply::Released => "released",
            ScriptReply::Discarded => "discarded",
            ScriptReply::WriterFlagged => "writer-flagged",
            ScriptReply::Detached => "detached",
            ScriptReply::Purged => "purged",
            ScriptReply::Absent => "absent",
        }
    }

    /// Parses a reply code.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::UnexpectedReply` for unknown codes.
    pub fn parse(reply: &str) -> Result<Self> {
        let parsed = match reply {
            "cache" => ScriptReply::Cache,
            "nocache-store" => ScriptReply::NoCacheStore,
            "nocache-nostore" => ScriptReply::NoCacheNoStore,
            "written" => ScriptReply::Written,
            "invalidated" => ScriptReply::Invalidated,
            "retained" => ScriptReply::Retained,
            "released" => ScriptReply::Released,
            "discarded" => ScriptReply::Discarded,
            "writer-flagged" => ScriptReply::WriterFlagged,
            "detached" => ScriptReply::Detached,
            "purged" => ScriptReply::Purged,
            "absent" => ScriptReply::Absent,
            other => return Err(CacheError::UnexpectedReply(other.to_string())),
        };
        Ok(parsed)
    }
}

impl fmt::Display for ScriptReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes an integer script argument.
pub fn int_arg(value: impl Into<i64>) -> Vec<u8> {
    value.into().to_string().into_bytes()
}

/// Encodes a string script argument.
pub fn str_arg(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

const OBTAIN_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[4]) == 1 then
  return 'nocache-nostore'
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  local readers = tonumber(redis.call('GET', KEYS[2]) or '0')
  if readers > 0 then
    return 'nocache-nostore'
  end
  redis.call('DEL', KEYS[2], KEYS[3])
  redis.call('SET', KEYS[4], ARGV[1], 'EX', ARGV[2])
  return 'nocache-store'
end
redis.call('INCR', KEYS[2])
redis.call('EXPIRE', KEYS[2], ARGV[3])
redis.call('EXPIRE', KEYS[3], ARGV[3])
return 'cache'
";

const RELEASE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 0 or redis.call('EXISTS', KEYS[4]) == 1 then
  return 'absent'
end
local readers = redis.call('DECR', KEYS[2])
if readers < 0 then
  redis.call('SET', KEYS[2], '0')
  readers = 0
end
if readers > 0 then
  return 'retained'
end
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('EXPIRE', KEYS[2], ARGV[1])
  redis.call('EXPIRE', KEYS[3], ARGV[1])
  return 'released'
end
redis.call('DEL', KEYS[2], KEYS[3])
return 'discarded'
";

const APPEND_FILL_SCRIPT: &str = r"
if (redis.call('GET', KEYS[1]) or '0') ~= ARGV[1] then
  return 'invalidated'
end
if redis.call('GET', KEYS[3]) ~= ARGV[3] then
  return 'invalidated'
end
for i = 6, #ARGV do
  redis.call('RPUSH', KEYS[2], ARGV[i])
end
redis.call('EXPIRE', KEYS[2], ARGV[5])
redis.call('EXPIRE', KEYS[3], ARGV[5])
for i = 4, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[2])
  redis.call('EXPIRE', KEYS[i], ARGV[4])
end
return 'written'
";

const FINALIZE_FILL_SCRIPT: &str = r"
local writer = redis.call('GET', KEYS[5])
if writer ~= ARGV[3] and writer ~= 'invalidated' then
  return 'invalidated'
end
if writer ~= ARGV[3] or (redis.call('GET', KEYS[1]) or '0') ~= ARGV[1] then
  redis.call('DEL', KEYS[2], KEYS[3], KEYS[4], KEYS[5])
  return 'invalidated'
end
redis.call('SET', KEYS[2], '1', 'EX', ARGV[4])
redis.call('SET', KEYS[3], '0', 'EX', ARGV[4])
redis.call('EXPIRE', KEYS[4], ARGV[4])
for i = 6, #KEYS do
  redis.call('SADD', KEYS[i], ARGV[2])
  redis.call('EXPIRE', KEYS[i], ARGV[5])
end
redis.call('DEL', KEYS[5])
return 'written'
";

const ABANDON_FILL_SCRIPT: &str = r"
local writer = redis.call('GET', KEYS[2])
if writer == ARGV[1] or writer == 'invalidated' then
  redis.call('DEL', KEYS[1], KEYS[2])
  return 'discarded'
end
return 'absent'
";

const TRY_FILL_ENTITY_SCRIPT: &str = r"
if (redis.call('GET', KEYS[1]) or '0') ~= ARGV[1] then
  return 'invalidated'
end
redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
return 'written'
";

const PURGE_QUERY_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[4]) == 1 then
  redis.call('SET', KEYS[4], 'invalidated', 'KEEPTTL')
  return 'writer-flagged'
end
local readers = tonumber(redis.call('GET', KEYS[2]) or '0')
if readers > 0 then
  if redis.call('DEL', KEYS[1]) > 0 then
    return 'detached'
  end
  return 'absent'
end
if redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4]) > 0 then
  return 'purged'
end
return 'absent'
";
