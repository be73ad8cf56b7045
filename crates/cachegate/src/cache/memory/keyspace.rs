//! Typed keyspace with lazy TTL expiry.
//!
//! An expired key is dropped when it is next touched, and a sweep every
//! [`SWEEP_EVERY`] writes reclaims the ones nobody touches again.
//!
//! Mirrors the subset of Redis semantics the coordination protocol relies
//! on: counters are decimal strings, empty sets and lists disappear, `SET`
//! clears any TTL, and expired keys behave exactly like missing ones.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use cachegate_core::cache::{CacheError, Result};

/// Writes between two sweeps of expired keys.
pub const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
    List(VecDeque<Vec<u8>>),
}

impl Stored {
    fn type_name(&self) -> &'static str {
        match self {
            Stored::Bytes(_) => "string",
            Stored::Set(_) => "set",
            Stored::List(_) => "list",
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Stored) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

fn wrong_type(key: &str, expected: &str, found: &Stored) -> CacheError {
    CacheError::OperationFailed(format!(
        "WRONGTYPE {} holds a {}, expected a {}",
        key,
        found.type_name(),
        expected
    ))
}

/// All coordination keys of one in-memory store.
#[derive(Debug, Default)]
pub struct Keyspace {
    slots: HashMap<String, Slot>,
    frozen_at: Option<Instant>,
    writes: u64,
}

impl Keyspace {
    /// Stops the clock until [`Keyspace::thaw`], so a script sees every key
    /// expire at the same instant.
    pub fn freeze(&mut self) {
        self.frozen_at = Some(Instant::now());
    }

    pub fn thaw(&mut self) {
        self.frozen_at = None;
    }

    fn now(&self) -> Instant {
        self.frozen_at.unwrap_or_else(Instant::now)
    }

    /// Drops every expired key, returning how many went.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before - self.slots.len()
    }

    /// Counts a write and sweeps once every [`SWEEP_EVERY`] of them.
    fn note_write(&mut self) {
        self.writes += 1;
        if self.writes % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    /// Returns the live slot for `key`, dropping it first if it expired.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = self.now();
        if self.slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            self.slots.remove(key);
        }
        self.slots.get_mut(key)
    }

    fn peek(&self, key: &str) -> Option<&Slot> {
        let now = self.now();
        self.slots.get(key).filter(|slot| !slot.is_expired(now))
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot {
                value: Stored::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(slot) => Err(wrong_type(key, "string", &slot.value)),
        }
    }

    /// Reads a string value as UTF-8, lossily.
    pub fn get_string(&mut self, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Reads a counter. Missing keys count as zero.
    pub fn get_int(&mut self, key: &str) -> Result<i64> {
        match self.get(key)? {
            None => Ok(0),
            Some(bytes) => parse_int(key, &bytes),
        }
    }

    /// Replaces the value and clears any TTL.
    pub fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.note_write();
        let mut slot = Slot::new(Stored::Bytes(value));
        slot.expires_at = ttl.map(|d| self.now() + d);
        self.slots.insert(key.to_string(), slot);
    }

    /// Replaces the value of an existing key without touching its TTL.
    pub fn set_keep_ttl(&mut self, key: &str, value: Vec<u8>) {
        self.note_write();
        let expires_at = self.live(key).and_then(|slot| slot.expires_at);
        let mut slot = Slot::new(Stored::Bytes(value));
        slot.expires_at = expires_at;
        self.slots.insert(key.to_string(), slot);
    }

    pub fn delete<S: AsRef<str>>(&mut self, keys: &[S]) -> u64 {
        let mut removed = 0;
        for key in keys {
            let key = key.as_ref();
            if self.live(key).is_some() {
                self.slots.remove(key);
                removed += 1;
            }
        }
        removed
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Adds `delta` to a counter, keeping its TTL.
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = self.get_int(key)?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::OperationFailed(format!("{} would overflow", key)))?;
        self.set_keep_ttl(key, next.to_string().into_bytes());
        Ok(next)
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let expires_at = self.now() + ttl;
        match self.live(key) {
            Some(slot) => {
                slot.expires_at = Some(expires_at);
                true
            }
            None => false,
        }
    }

    pub fn persist(&mut self, key: &str) -> bool {
        match self.live(key) {
            Some(slot) if slot.expires_at.is_some() => {
                slot.expires_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let slot = self.peek(key)?;
        let now = self.now();
        slot.expires_at.map(|exp| exp.saturating_duration_since(now))
    }

    pub fn sadd(&mut self, key: &str, members: &[String]) -> Result<u64> {
        self.note_write();
        if self.live(key).is_none() {
            self.slots
                .insert(key.to_string(), Slot::new(Stored::Set(BTreeSet::new())));
        }
        match self.live(key) {
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => Ok(members
                .iter()
                .filter(|member| set.insert((*member).clone()))
                .count() as u64),
            Some(slot) => Err(wrong_type(key, "set", &slot.value)),
            None => Ok(0),
        }
    }

    pub fn srem(&mut self, key: &str, members: &[String]) -> Result<u64> {
        let (removed, now_empty) = match self.live(key) {
            None => return Ok(0),
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => {
                let removed = members.iter().filter(|member| set.remove(*member)).count();
                (removed as u64, set.is_empty())
            }
            Some(slot) => return Err(wrong_type(key, "set", &slot.value)),
        };
        if now_empty {
            self.slots.remove(key);
        }
        Ok(removed)
    }

    pub fn smembers(&self, key: &str) -> Result<Vec<String>> {
        match self.peek(key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Stored::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(slot) => Err(wrong_type(key, "set", &slot.value)),
        }
    }

    pub fn rpush(&mut self, key: &str, values: &[Vec<u8>]) -> Result<u64> {
        self.note_write();
        if values.is_empty() {
            return self.llen(key);
        }
        if self.live(key).is_none() {
            self.slots
                .insert(key.to_string(), Slot::new(Stored::List(VecDeque::new())));
        }
        match self.live(key) {
            Some(Slot {
                value: Stored::List(list),
                ..
            }) => {
                list.extend(values.iter().cloned());
                Ok(list.len() as u64)
            }
            Some(slot) => Err(wrong_type(key, "list", &slot.value)),
            None => Ok(0),
        }
    }

    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>> {
        let list = match self.peek(key) {
            None => return Ok(Vec::new()),
            Some(Slot {
                value: Stored::List(list),
                ..
            }) => list,
            Some(slot) => return Err(wrong_type(key, "list", &slot.value)),
        };
        let len = list.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    pub fn llen(&self, key: &str) -> Result<u64> {
        match self.peek(key) {
            None => Ok(0),
            Some(Slot {
                value: Stored::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(slot) => Err(wrong_type(key, "list", &slot.value)),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.now();
        self.slots.values().filter(|s| !s.is_expired(now)).count()
    }

    /// Keys held in memory, expired ones not yet reclaimed included.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Live keys starting with `prefix`, sorted.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = self.now();
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && !slot.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

fn parse_int(key: &str, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CacheError::OperationFailed(format!("{} is not an integer or out of range", key))
        })
}
