//! Native implementations of the coordination scripts.
//!
//! Each function runs with the keyspace locked, which gives the same
//! atomicity a script gets on a Redis server. The decision logic follows the
//! Lua sources in `cachegate_core::cache::CacheScript` line for line.

use std::time::Duration;

use cachegate_core::cache::{CacheError, CacheScript, Result, ScriptReply, WRITER_INVALIDATED};

use super::keyspace::Keyspace;

/// Positional access to script keys and arguments.
struct Call<'a> {
    script: CacheScript,
    keys: &'a [String],
    args: &'a [Vec<u8>],
}

impl<'a> Call<'a> {
    fn key(&self, index: usize) -> Result<&'a str> {
        self.keys.get(index).map(String::as_str).ok_or_else(|| {
            CacheError::OperationFailed(format!("{} expects key #{}", self.script, index + 1))
        })
    }

    fn arg(&self, index: usize) -> Result<&'a [u8]> {
        self.args.get(index).map(Vec::as_slice).ok_or_else(|| {
            CacheError::OperationFailed(format!("{} expects argument #{}", self.script, index + 1))
        })
    }

    fn arg_str(&self, index: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(self.arg(index)?).into_owned())
    }

    fn arg_seconds(&self, index: usize) -> Result<Duration> {
        let raw = self.arg_str(index)?;
        raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
            CacheError::OperationFailed(format!("{} expects seconds, got {}", self.script, raw))
        })
    }
}

/// Runs `script` against `space`.
pub fn run(
    space: &mut Keyspace,
    script: CacheScript,
    keys: &[String],
    args: &[Vec<u8>],
) -> Result<ScriptReply> {
    let call = Call { script, keys, args };
    space.freeze();
    let reply = match script {
        CacheScript::Obtain => obtain(space, &call),
        CacheScript::Release => release(space, &call),
        CacheScript::AppendFill => append_fill(space, &call),
        CacheScript::FinalizeFill => finalize_fill(space, &call),
        CacheScript::AbandonFill => abandon_fill(space, &call),
        CacheScript::TryFillEntity => try_fill_entity(space, &call),
        CacheScript::PurgeQuery => purge_query(space, &call),
    };
    space.thaw();
    reply
}

fn epoch_matches(space: &mut Keyspace, key: &str, expected: &[u8]) -> Result<bool> {
    let current = space.get(key)?.unwrap_or_else(|| b"0".to_vec());
    Ok(current == expected)
}

fn obtain(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (cache, refcount, data, writer) =
        (call.key(0)?, call.key(1)?, call.key(2)?, call.key(3)?);

    if space.exists(writer) {
        return Ok(ScriptReply::NoCacheNoStore);
    }
    if !space.exists(cache) {
        if space.get_int(refcount)? > 0 {
            return Ok(ScriptReply::NoCacheNoStore);
        }
        space.delete(&[refcount, data]);
        space.set(writer, call.arg(0)?.to_vec(), Some(call.arg_seconds(1)?));
        return Ok(ScriptReply::NoCacheStore);
    }

    let reader_lease = call.arg_seconds(2)?;
    space.incr_by(refcount, 1)?;
    space.expire(refcount, reader_lease);
    space.expire(data, reader_lease);
    Ok(ScriptReply::Cache)
}

fn release(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (cache, refcount, data, writer) =
        (call.key(0)?, call.key(1)?, call.key(2)?, call.key(3)?);

    if !space.exists(refcount) || space.exists(writer) {
        return Ok(ScriptReply::Absent);
    }

    let mut readers = space.incr_by(refcount, -1)?;
    if readers < 0 {
        space.set(refcount, b"0".to_vec(), None);
        readers = 0;
    }
    if readers > 0 {
        return Ok(ScriptReply::Retained);
    }
    if space.exists(cache) {
        let ttl = call.arg_seconds(0)?;
        space.expire(refcount, ttl);
        space.expire(data, ttl);
        return Ok(ScriptReply::Released);
    }
    space.delete(&[refcount, data]);
    Ok(ScriptReply::Discarded)
}

fn append_fill(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (epoch, data, writer) = (call.key(0)?, call.key(1)?, call.key(2)?);

    if !epoch_matches(space, epoch, call.arg(0)?)? {
        return Ok(ScriptReply::Invalidated);
    }
    if space.get(writer)?.as_deref() != Some(call.arg(2)?) {
        return Ok(ScriptReply::Invalidated);
    }

    let fingerprint = call.arg_str(1)?;
    let index_ttl = call.arg_seconds(3)?;
    let writer_lease = call.arg_seconds(4)?;

    space.rpush(data, call.args.get(5..).unwrap_or_default())?;
    space.expire(data, writer_lease);
    space.expire(writer, writer_lease);
    for cached_in in call.keys.iter().skip(3) {
        space.sadd(cached_in, std::slice::from_ref(&fingerprint))?;
        space.expire(cached_in, index_ttl);
    }
    Ok(ScriptReply::Written)
}

fn finalize_fill(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (epoch, cache, refcount, data, writer) = (
        call.key(0)?,
        call.key(1)?,
        call.key(2)?,
        call.key(3)?,
        call.key(4)?,
    );
    let token = call.arg(2)?;

    let current = space.get(writer)?;
    let owned = current.as_deref() == Some(token);
    let flagged = current.as_deref() == Some(WRITER_INVALIDATED.as_bytes());
    if !owned && !flagged {
        return Ok(ScriptReply::Invalidated);
    }
    if !owned || !epoch_matches(space, epoch, call.arg(0)?)? {
        space.delete(&[cache, refcount, data, writer]);
        return Ok(ScriptReply::Invalidated);
    }

    let fingerprint = call.arg_str(1)?;
    let query_ttl = call.arg_seconds(3)?;
    let index_ttl = call.arg_seconds(4)?;

    space.set(cache, b"1".to_vec(), Some(query_ttl));
    space.set(refcount, b"0".to_vec(), Some(query_ttl));
    space.expire(data, query_ttl);
    for bucket in call.keys.iter().skip(5) {
        space.sadd(bucket, std::slice::from_ref(&fingerprint))?;
        space.expire(bucket, index_ttl);
    }
    space.delete(&[writer]);
    Ok(ScriptReply::Written)
}

fn abandon_fill(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (data, writer) = (call.key(0)?, call.key(1)?);

    let current = space.get(writer)?;
    let owned = current.as_deref() == Some(call.arg(0)?);
    let flagged = current.as_deref() == Some(WRITER_INVALIDATED.as_bytes());
    if owned || flagged {
        space.delete(&[data, writer]);
        return Ok(ScriptReply::Discarded);
    }
    Ok(ScriptReply::Absent)
}

fn try_fill_entity(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (epoch, entity) = (call.key(0)?, call.key(1)?);

    if !epoch_matches(space, epoch, call.arg(0)?)? {
        return Ok(ScriptReply::Invalidated);
    }
    space.set(entity, call.arg(1)?.to_vec(), Some(call.arg_seconds(2)?));
    Ok(ScriptReply::Written)
}

fn purge_query(space: &mut Keyspace, call: &Call<'_>) -> Result<ScriptReply> {
    let (cache, refcount, data, writer) =
        (call.key(0)?, call.key(1)?, call.key(2)?, call.key(3)?);

    if space.exists(writer) {
        space.set_keep_ttl(writer, WRITER_INVALIDATED.as_bytes().to_vec());
        return Ok(ScriptReply::WriterFlagged);
    }
    if space.get_int(refcount)? > 0 {
        if space.delete(&[cache]) > 0 {
            return Ok(ScriptReply::Detached);
        }
        return Ok(ScriptReply::Absent);
    }
    if space.delete(&[cache, refcount, data, writer]) > 0 {
        return Ok(ScriptReply::Purged);
    }
    Ok(ScriptReply::Absent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachegate_core::cache::{int_arg, str_arg, Fingerprint, QueryKeys};

    const TOKEN: &str = "filler-1";

    fn query_keys() -> QueryKeys {
        QueryKeys::new(&Fingerprint::from_hex("abc"))
    }

    fn obtain_args(token: &str) -> Vec<Vec<u8>> {
        vec![str_arg(token), int_arg(60), int_arg(900)]
    }

    fn finalize(space: &mut Keyspace, keys: &QueryKeys, epoch: i64, token: &str) -> ScriptReply {
        let script_keys = vec![
            "EPOCH:Widget".to_string(),
            keys.cache.clone(),
            keys.refcount.clone(),
            keys.data.clone(),
            keys.writer.clone(),
            "INDEXALL:ns:Widget".to_string(),
        ];
        let args = vec![
            int_arg(epoch),
            str_arg("abc"),
            str_arg(token),
            int_arg(300),
            int_arg(3600),
        ];
        run(space, CacheScript::FinalizeFill, &script_keys, &args).unwrap()
    }

    fn append(space: &mut Keyspace, keys: &QueryKeys, epoch: i64, token: &str) -> ScriptReply {
        let script_keys = vec![
            "EPOCH:Widget".to_string(),
            keys.data.clone(),
            keys.writer.clone(),
            "CACHEDIN:ns|Widget:i1".to_string(),
        ];
        let args = vec![
            int_arg(epoch),
            str_arg("abc"),
            str_arg(token),
            int_arg(3600),
            int_arg(60),
            b"payload".to_vec(),
        ];
        run(space, CacheScript::AppendFill, &script_keys, &args).unwrap()
    }

    #[test]
    fn test_first_reader_becomes_filler_second_does_not_store() {
        let mut space = Keyspace::default();
        let keys = query_keys();

        let first = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("a"));
        let second = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("b"));

        assert_eq!(first.unwrap(), ScriptReply::NoCacheStore);
        assert_eq!(second.unwrap(), ScriptReply::NoCacheNoStore);
        assert_eq!(space.get(&keys.writer).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_full_fill_then_cached_read() {
        let mut space = Keyspace::default();
        let keys = query_keys();

        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args(TOKEN)).unwrap();
        assert_eq!(append(&mut space, &keys, 0, TOKEN), ScriptReply::Written);
        assert_eq!(finalize(&mut space, &keys, 0, TOKEN), ScriptReply::Written);

        assert!(!space.exists(&keys.writer));
        assert_eq!(space.get_int(&keys.refcount).unwrap(), 0);
        assert_eq!(
            space.smembers("CACHEDIN:ns|Widget:i1").unwrap(),
            vec!["abc".to_string()]
        );
        assert_eq!(
            space.smembers("INDEXALL:ns:Widget").unwrap(),
            vec!["abc".to_string()]
        );

        let reply = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("x"));
        assert_eq!(reply.unwrap(), ScriptReply::Cache);
        assert_eq!(space.get_int(&keys.refcount).unwrap(), 1);

        let reply = run(
            &mut space,
            CacheScript::Release,
            &keys.to_vec(),
            &[int_arg(300)],
        );
        assert_eq!(reply.unwrap(), ScriptReply::Released);
        assert_eq!(space.llen(&keys.data).unwrap(), 1);
    }

    #[test]
    fn test_epoch_change_rejects_append_and_finalize() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args(TOKEN)).unwrap();

        space.incr_by("EPOCH:Widget", 1).unwrap();

        assert_eq!(append(&mut space, &keys, 0, TOKEN), ScriptReply::Invalidated);
        assert_eq!(finalize(&mut space, &keys, 0, TOKEN), ScriptReply::Invalidated);
        assert!(!space.exists(&keys.cache));
        assert!(!space.exists(&keys.writer));
    }

    #[test]
    fn test_purge_during_fill_flags_writer_and_finalize_discards() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args(TOKEN)).unwrap();
        append(&mut space, &keys, 0, TOKEN);

        let purge = run(&mut space, CacheScript::PurgeQuery, &keys.to_vec(), &[]).unwrap();
        assert_eq!(purge, ScriptReply::WriterFlagged);
        assert!(space.ttl(&keys.writer).is_some());

        assert_eq!(finalize(&mut space, &keys, 0, TOKEN), ScriptReply::Invalidated);
        assert!(!space.exists(&keys.data));
        assert!(!space.exists(&keys.writer));
        assert!(!space.exists(&keys.cache));
    }

    #[test]
    fn test_stale_filler_does_not_touch_newer_fill() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("stale")).unwrap();
        // Lease expired and another filler took over.
        space.delete(&[keys.writer.as_str()]);
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("fresh")).unwrap();

        assert_eq!(append(&mut space, &keys, 0, "stale"), ScriptReply::Invalidated);
        assert_eq!(finalize(&mut space, &keys, 0, "stale"), ScriptReply::Invalidated);
        assert_eq!(space.get(&keys.writer).unwrap(), Some(b"fresh".to_vec()));

        let abandon = run(
            &mut space,
            CacheScript::AbandonFill,
            &[keys.data.clone(), keys.writer.clone()],
            &[str_arg("stale")],
        );
        assert_eq!(abandon.unwrap(), ScriptReply::Absent);
        assert!(space.exists(&keys.writer));
    }

    #[test]
    fn test_purge_with_active_readers_detaches_then_last_release_discards() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args(TOKEN)).unwrap();
        append(&mut space, &keys, 0, TOKEN);
        finalize(&mut space, &keys, 0, TOKEN);
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("r1")).unwrap();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("r2")).unwrap();

        let purge = run(&mut space, CacheScript::PurgeQuery, &keys.to_vec(), &[]).unwrap();
        assert_eq!(purge, ScriptReply::Detached);
        assert!(space.exists(&keys.data));

        // No new reader may start while old readers drain.
        let reply = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("r3"));
        assert_eq!(reply.unwrap(), ScriptReply::NoCacheNoStore);

        let release_keys = keys.to_vec();
        let first = run(&mut space, CacheScript::Release, &release_keys, &[int_arg(300)]);
        assert_eq!(first.unwrap(), ScriptReply::Retained);
        assert!(space.exists(&keys.data));

        let last = run(&mut space, CacheScript::Release, &release_keys, &[int_arg(300)]);
        assert_eq!(last.unwrap(), ScriptReply::Discarded);
        assert!(!space.exists(&keys.data));
        assert!(!space.exists(&keys.refcount));
    }

    #[test]
    fn test_release_without_lease_is_absent() {
        let mut space = Keyspace::default();
        let keys = query_keys();

        let reply = run(&mut space, CacheScript::Release, &keys.to_vec(), &[int_arg(300)]);

        assert_eq!(reply.unwrap(), ScriptReply::Absent);
        assert!(!space.exists(&keys.refcount));
    }

    #[test]
    fn test_expired_reader_release_leaves_new_fill_intact() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("f1")).unwrap();
        append(&mut space, &keys, 0, "f1");
        finalize(&mut space, &keys, 0, "f1");
        let reply = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("r1"));
        assert_eq!(reply.unwrap(), ScriptReply::Cache);

        // The reader stalls past every lease and the query TTL.
        space.delete(&[keys.cache.as_str(), keys.refcount.as_str(), keys.data.as_str()]);

        let reply = run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("f2"));
        assert_eq!(reply.unwrap(), ScriptReply::NoCacheStore);
        assert_eq!(append(&mut space, &keys, 0, "f2"), ScriptReply::Written);

        let stale = run(&mut space, CacheScript::Release, &keys.to_vec(), &[int_arg(300)]);
        assert_eq!(stale.unwrap(), ScriptReply::Absent);
        assert_eq!(space.llen(&keys.data).unwrap(), 1);

        assert_eq!(append(&mut space, &keys, 0, "f2"), ScriptReply::Written);
        assert_eq!(finalize(&mut space, &keys, 0, "f2"), ScriptReply::Written);
        assert_eq!(space.llen(&keys.data).unwrap(), 2);
    }

    #[test]
    fn test_release_while_refilling_is_absent() {
        let mut space = Keyspace::default();
        let keys = query_keys();
        run(&mut space, CacheScript::Obtain, &keys.to_vec(), &obtain_args("f1")).unwrap();
        append(&mut space, &keys, 0, "f1");
        space.set(&keys.refcount, b"1".to_vec(), None);

        let reply = run(&mut space, CacheScript::Release, &keys.to_vec(), &[int_arg(300)]);

        assert_eq!(reply.unwrap(), ScriptReply::Absent);
        assert_eq!(space.llen(&keys.data).unwrap(), 1);
        assert_eq!(space.get_int(&keys.refcount).unwrap(), 1);
    }

    #[test]
    fn test_try_fill_entity() {
        let mut space = Keyspace::default();
        let keys = vec!["EPOCH:Widget".to_string(), "ENTITY:ns|Widget:i1".to_string()];

        let written = run(
            &mut space,
            CacheScript::TryFillEntity,
            &keys,
            &[int_arg(0), b"{}".to_vec(), int_arg(60)],
        );
        assert_eq!(written.unwrap(), ScriptReply::Written);

        space.incr_by("EPOCH:Widget", 1).unwrap();
        let rejected = run(
            &mut space,
            CacheScript::TryFillEntity,
            &keys,
            &[int_arg(0), b"{}".to_vec(), int_arg(60)],
        );
        assert_eq!(rejected.unwrap(), ScriptReply::Invalidated);
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let mut space = Keyspace::default();
        let result = run(&mut space, CacheScript::PurgeQuery, &[], &[]);
        assert!(matches!(result, Err(CacheError::OperationFailed(_))));
    }

    #[test]
    fn test_purge_absent() {
        let mut space = Keyspace::default();
        let reply = run(&mut space, CacheScript::PurgeQuery, &query_keys().to_vec(), &[]);
        assert_eq!(reply.unwrap(), ScriptReply::Absent);
    }
}
