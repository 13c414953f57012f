use std::collections::HashMap;
use std::collections::VecDeque;
use std::thread;

use log::error;
use once_cell::sync::Lazy;

use crate::db::DB;
use crate::entity::{entity_to_cmd, format_score, shared, Entity, SharedEntity};
use crate::reply::{cmd_line, CmdLine, Reply};
use crate::sortedset::{ScoreBorder, SortedSet};
use crate::util::now_ms;
use crate::wildcard::wildcard_match;

pub type ExecFn = fn(&DB, &[Vec<u8>]) -> Reply;
/// Returns the write keys and read keys a command line touches, so the
/// dispatcher can take the striped locks up front.
pub type PrepareFn = fn(&[Vec<u8>]) -> (Vec<String>, Vec<String>);
/// Produces command lines that restore the state a command is about to
/// clobber. Consumed by transactional rollback.
pub type UndoFn = fn(&DB, &[Vec<u8>]) -> Vec<CmdLine>;

pub struct Command {
    pub name: &'static str,
    pub exec: ExecFn,
    pub prepare: PrepareFn,
    pub undo: Option<UndoFn>,
    /// Expected argument count including the name; negative means
    /// at-least that many.
    pub arity: i32,
}

/// Command Table
static CMD_TABLE: Lazy<HashMap<&'static str, Command>> = Lazy::new(|| {
    HashMap::from([
        ("ping", Command { name: "ping", exec: ping_command, prepare: prepare_none, undo: None, arity: -1 }),
        ("set", Command { name: "set", exec: set_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("get", Command { name: "get", exec: get_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("getset", Command { name: "getset", exec: getset_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("setnx", Command { name: "setnx", exec: setnx_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("incr", Command { name: "incr", exec: incr_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 2 }),
        ("incrby", Command { name: "incrby", exec: incrby_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("decr", Command { name: "decr", exec: decr_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 2 }),
        ("del", Command { name: "del", exec: del_command, prepare: prepare_write_all, undo: Some(undo_all_keys), arity: -2 }),
        ("exists", Command { name: "exists", exec: exists_command, prepare: prepare_read_all, undo: None, arity: -2 }),
        ("expire", Command { name: "expire", exec: expire_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("pexpireat", Command { name: "pexpireat", exec: pexpireat_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 3 }),
        ("ttl", Command { name: "ttl", exec: ttl_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("pttl", Command { name: "pttl", exec: pttl_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("persist", Command { name: "persist", exec: persist_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 2 }),
        ("type", Command { name: "type", exec: type_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("keys", Command { name: "keys", exec: keys_command, prepare: prepare_none, undo: None, arity: 2 }),
        ("flushdb", Command { name: "flushdb", exec: flushdb_command, prepare: prepare_none, undo: None, arity: -1 }),
        ("bgrewriteaof", Command { name: "bgrewriteaof", exec: bgrewriteaof_command, prepare: prepare_none, undo: None, arity: 1 }),
        ("publish", Command { name: "publish", exec: publish_command, prepare: prepare_none, undo: None, arity: 3 }),

        ("rpush", Command { name: "rpush", exec: rpush_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("lpush", Command { name: "lpush", exec: lpush_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("rpop", Command { name: "rpop", exec: rpop_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 2 }),
        ("lpop", Command { name: "lpop", exec: lpop_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 2 }),
        ("lrange", Command { name: "lrange", exec: lrange_command, prepare: prepare_read_first, undo: None, arity: 4 }),
        ("llen", Command { name: "llen", exec: llen_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("lindex", Command { name: "lindex", exec: lindex_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("lrem", Command { name: "lrem", exec: lrem_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 4 }),

        ("hset", Command { name: "hset", exec: hset_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -4 }),
        ("hget", Command { name: "hget", exec: hget_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("hexists", Command { name: "hexists", exec: hexists_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("hdel", Command { name: "hdel", exec: hdel_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("hlen", Command { name: "hlen", exec: hlen_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("hgetall", Command { name: "hgetall", exec: hgetall_command, prepare: prepare_read_first, undo: None, arity: 2 }),

        ("sadd", Command { name: "sadd", exec: sadd_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("srem", Command { name: "srem", exec: srem_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("sismember", Command { name: "sismember", exec: sismember_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("smembers", Command { name: "smembers", exec: smembers_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("scard", Command { name: "scard", exec: scard_command, prepare: prepare_read_first, undo: None, arity: 2 }),

        ("zadd", Command { name: "zadd", exec: zadd_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -4 }),
        ("zscore", Command { name: "zscore", exec: zscore_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("zcard", Command { name: "zcard", exec: zcard_command, prepare: prepare_read_first, undo: None, arity: 2 }),
        ("zrank", Command { name: "zrank", exec: zrank_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("zrevrank", Command { name: "zrevrank", exec: zrevrank_command, prepare: prepare_read_first, undo: None, arity: 3 }),
        ("zrem", Command { name: "zrem", exec: zrem_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: -3 }),
        ("zrange", Command { name: "zrange", exec: zrange_command, prepare: prepare_read_first, undo: None, arity: -4 }),
        ("zrangebyscore", Command { name: "zrangebyscore", exec: zrangebyscore_command, prepare: prepare_read_first, undo: None, arity: -4 }),
        ("zremrangebyscore", Command { name: "zremrangebyscore", exec: zremrangebyscore_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 4 }),
        ("zremrangebyrank", Command { name: "zremrangebyrank", exec: zremrangebyrank_command, prepare: prepare_write_first, undo: Some(undo_first_key), arity: 4 }),
    ])
});

pub fn lookup_command(name: &str) -> Option<&'static Command> {
    CMD_TABLE.get(name)
}

/* -- preparers -- */

fn prepare_none(_args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), Vec::new())
}

fn prepare_write_first(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (vec![key_of(args)], Vec::new())
}

fn prepare_read_first(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), vec![key_of(args)])
}

fn prepare_write_all(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (args.iter().map(|a| as_str(a)).collect(), Vec::new())
}

fn prepare_read_all(args: &[Vec<u8>]) -> (Vec<String>, Vec<String>) {
    (Vec::new(), args.iter().map(|a| as_str(a)).collect())
}

/* -- undo -- */

fn undo_first_key(db: &DB, args: &[Vec<u8>]) -> Vec<CmdLine> {
    rollback_keys(db, &[key_of(args)])
}

fn undo_all_keys(db: &DB, args: &[Vec<u8>]) -> Vec<CmdLine> {
    let keys: Vec<String> = args.iter().map(|a| as_str(a)).collect();
    rollback_keys(db, &keys)
}

/// Snapshot of the named keys as restoring command lines: clear the key,
/// recreate its entity, reinstate its TTL.
fn rollback_keys(db: &DB, keys: &[String]) -> Vec<CmdLine> {
    let mut logs = Vec::new();
    for key in keys {
        let key_arg = key.as_bytes().to_vec();
        logs.push(cmd_line("DEL", std::slice::from_ref(&key_arg)));
        if let Some(entity) = db.get_entity(key) {
            if let Some(cmd) = entity_to_cmd(key, &entity.read()) {
                logs.push(cmd);
            }
            if let Some(at) = db.ttl.get(key) {
                logs.push(cmd_line(
                    "PEXPIREAT",
                    &[key_arg, at.to_string().into_bytes()],
                ));
            }
        }
    }
    logs
}

/* -- argument plumbing -- */

fn key_of(args: &[Vec<u8>]) -> String {
    as_str(&args[0])
}

fn as_str(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).into_owned()
}

fn parse_i64(arg: &[u8]) -> Result<i64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Reply::err("value is not an integer or out of range"))
}

fn parse_f64(arg: &[u8]) -> Result<f64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Reply::err("value is not a valid float"))
}

fn parse_border(arg: &[u8]) -> Result<ScoreBorder, Reply> {
    ScoreBorder::parse(arg).ok_or_else(|| Reply::err("min or max is not a float"))
}

/// Redis-style inclusive range over `size` elements with negative
/// offsets, converted to a half-open 0-based range. None means empty.
fn normalize_range(start: i64, stop: i64, size: i64) -> Option<(i64, i64)> {
    if size == 0 {
        return None;
    }
    let start = if start < 0 { (size + start).max(0) } else { start };
    if start >= size {
        return None;
    }
    let stop = if stop < 0 { size + stop } else { stop };
    if stop < start {
        return None;
    }
    Some((start, stop.min(size - 1) + 1))
}

/// A typed view of the entity under a key, or WRONGTYPE.
macro_rules! typed_entity {
    ($fn_name:ident, $variant:path) => {
        fn $fn_name(db: &DB, key: &str) -> Result<Option<SharedEntity>, Reply> {
            match db.get_entity(key) {
                None => Ok(None),
                Some(e) => {
                    if matches!(&*e.read(), $variant(_)) {
                        Ok(Some(e))
                    } else {
                        Err(Reply::wrong_type())
                    }
                }
            }
        }
    };
}

typed_entity!(get_bytes_entity, Entity::Bytes);
typed_entity!(get_list_entity, Entity::List);
typed_entity!(get_hash_entity, Entity::Hash);
typed_entity!(get_set_entity, Entity::Set);
typed_entity!(get_zset_entity, Entity::SortedSet);

fn get_or_create(
    db: &DB,
    key: &str,
    found: Result<Option<SharedEntity>, Reply>,
    make: fn() -> Entity,
) -> Result<SharedEntity, Reply> {
    match found? {
        Some(e) => Ok(e),
        None => {
            let e = shared(make());
            db.data.put(key, e.clone());
            Ok(e)
        }
    }
}

/* -- connection/server commands -- */

fn ping_command(_db: &DB, args: &[Vec<u8>]) -> Reply {
    match args.len() {
        0 => Reply::pong(),
        1 => Reply::Bulk(args[0].clone()),
        _ => Reply::arity_err("ping"),
    }
}

fn keys_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let pattern = args[0].clone();
    let mut keys = Vec::new();
    for key in db.data.keys() {
        if db.expire_if_needed(&key) {
            continue;
        }
        if wildcard_match(&pattern, key.as_bytes()) {
            keys.push(key.into_bytes());
        }
    }
    Reply::MultiBulk(keys)
}

fn flushdb_command(db: &DB, _args: &[Vec<u8>]) -> Reply {
    db.flush();
    db.add_aof(cmd_line("FLUSHDB", &[]));
    Reply::ok()
}

fn bgrewriteaof_command(db: &DB, _args: &[Vec<u8>]) -> Reply {
    let Some(aof) = &db.aof else {
        return Reply::err("append only mode is off");
    };
    let aof = aof.clone();
    thread::spawn(move || {
        if let Err(e) = aof.rewrite() {
            error!("aof rewrite failed: {}", e);
        }
    });
    Reply::Status("Background append only file rewriting started".to_string())
}

fn publish_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let channel = as_str(&args[0]);
    Reply::Integer(db.hub().publish(&channel, &args[1]))
}

/* -- string commands -- */

fn set_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    db.data.put(&key, shared(Entity::Bytes(args[1].clone())));
    db.ttl.remove(&key);
    db.add_aof(cmd_line("SET", args));
    Reply::ok()
}

fn get_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_bytes_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::NullBulk,
        Ok(Some(e)) => match &*e.read() {
            Entity::Bytes(b) => Reply::Bulk(b.clone()),
            _ => Reply::wrong_type(),
        },
    }
}

fn getset_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let old = match get_bytes_entity(db, &key) {
        Err(r) => return r,
        Ok(old) => old,
    };
    db.data.put(&key, shared(Entity::Bytes(args[1].clone())));
    db.ttl.remove(&key);
    db.add_aof(cmd_line("GETSET", args));
    match old {
        None => Reply::NullBulk,
        Some(e) => match &*e.read() {
            Entity::Bytes(b) => Reply::Bulk(b.clone()),
            _ => Reply::NullBulk,
        },
    }
}

fn setnx_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    db.expire_if_needed(&key);
    let inserted = db
        .data
        .put_if_absent(&key, shared(Entity::Bytes(args[1].clone())));
    if inserted > 0 {
        db.add_aof(cmd_line("SETNX", args));
    }
    Reply::Integer(inserted as i64)
}

fn incr_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    incr_generic(db, args, "INCR", 1)
}

fn incrby_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let delta = match parse_i64(&args[1]) {
        Ok(d) => d,
        Err(r) => return r,
    };
    incr_generic(db, args, "INCRBY", delta)
}

fn decr_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    incr_generic(db, args, "DECR", -1)
}

fn incr_generic(db: &DB, args: &[Vec<u8>], name: &str, delta: i64) -> Reply {
    let key = key_of(args);
    let reply = match db.get_entity(&key) {
        None => {
            db.data
                .put(&key, shared(Entity::Bytes(delta.to_string().into_bytes())));
            Reply::Integer(delta)
        }
        Some(e) => {
            let mut guard = e.write();
            let Entity::Bytes(b) = &mut *guard else {
                return Reply::wrong_type();
            };
            let current: i64 = match std::str::from_utf8(b).ok().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => return Reply::err("value is not an integer or out of range"),
            };
            let Some(next) = current.checked_add(delta) else {
                return Reply::err("increment or decrement would overflow");
            };
            *b = next.to_string().into_bytes();
            Reply::Integer(next)
        }
    };
    db.add_aof(cmd_line(name, args));
    reply
}

/* -- key space commands -- */

fn del_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let mut deleted = 0i64;
    for arg in args {
        deleted += db.remove_key(&as_str(arg)) as i64;
    }
    if deleted > 0 {
        db.add_aof(cmd_line("DEL", args));
    }
    Reply::Integer(deleted)
}

fn exists_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let mut count = 0i64;
    for arg in args {
        if db.get_entity(&as_str(arg)).is_some() {
            count += 1;
        }
    }
    Reply::Integer(count)
}

fn expire_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let seconds = match parse_i64(&args[1]) {
        Ok(s) => s,
        Err(r) => return r,
    };
    if db.get_entity(&key).is_none() {
        return Reply::Integer(0);
    }
    let at = now_ms().saturating_add((seconds.max(0) as u64).saturating_mul(1000));
    db.ttl.put(&key, at);
    // serialized absolute so replay is time-shift safe
    db.add_aof(cmd_line(
        "PEXPIREAT",
        &[args[0].clone(), at.to_string().into_bytes()],
    ));
    Reply::Integer(1)
}

fn pexpireat_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let at = match parse_i64(&args[1]) {
        Ok(v) => v.max(0) as u64,
        Err(r) => return r,
    };
    if db.get_entity(&key).is_none() {
        return Reply::Integer(0);
    }
    db.ttl.put(&key, at);
    db.add_aof(cmd_line("PEXPIREAT", args));
    Reply::Integer(1)
}

fn ttl_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match remaining_ms(db, &key_of(args)) {
        Reply::Integer(ms) if ms > 0 => Reply::Integer(((ms as u64 + 999) / 1000) as i64),
        other => other,
    }
}

fn pttl_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    remaining_ms(db, &key_of(args))
}

fn remaining_ms(db: &DB, key: &str) -> Reply {
    if db.get_entity(key).is_none() {
        return Reply::Integer(-2);
    }
    match db.ttl.get(key) {
        None => Reply::Integer(-1),
        Some(at) => Reply::Integer(at.saturating_sub(now_ms()) as i64),
    }
}

fn persist_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    if db.get_entity(&key).is_none() {
        return Reply::Integer(0);
    }
    if db.ttl.remove(&key) == 0 {
        return Reply::Integer(0);
    }
    db.add_aof(cmd_line("PERSIST", args));
    Reply::Integer(1)
}

fn type_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match db.get_entity(&key_of(args)) {
        None => Reply::Status("none".to_string()),
        Some(e) => Reply::Status(e.read().type_name().to_string()),
    }
}

/* -- list commands -- */

fn push_generic(db: &DB, args: &[Vec<u8>], name: &str, front: bool) -> Reply {
    let key = key_of(args);
    let entity = match get_or_create(db, &key, get_list_entity(db, &key), || {
        Entity::List(VecDeque::new())
    }) {
        Ok(e) => e,
        Err(r) => return r,
    };
    let len = {
        let mut guard = entity.write();
        let Entity::List(list) = &mut *guard else {
            return Reply::wrong_type();
        };
        for value in &args[1..] {
            if front {
                list.push_front(value.clone());
            } else {
                list.push_back(value.clone());
            }
        }
        list.len() as i64
    };
    db.add_aof(cmd_line(name, args));
    Reply::Integer(len)
}

fn rpush_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    push_generic(db, args, "RPUSH", false)
}

fn lpush_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    push_generic(db, args, "LPUSH", true)
}

fn pop_generic(db: &DB, args: &[Vec<u8>], name: &str, front: bool) -> Reply {
    let key = key_of(args);
    let entity = match get_list_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::NullBulk,
        Ok(Some(e)) => e,
    };
    let (popped, emptied) = {
        let mut guard = entity.write();
        let Entity::List(list) = &mut *guard else {
            return Reply::wrong_type();
        };
        let popped = if front {
            list.pop_front()
        } else {
            list.pop_back()
        };
        (popped, list.is_empty())
    };
    match popped {
        None => Reply::NullBulk,
        Some(value) => {
            if emptied {
                db.remove_key(&key);
            }
            db.add_aof(cmd_line(name, args));
            Reply::Bulk(value)
        }
    }
}

fn lpop_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    pop_generic(db, args, "LPOP", true)
}

fn rpop_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    pop_generic(db, args, "RPOP", false)
}

fn llen_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_list_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::Integer(0),
        Ok(Some(e)) => match &*e.read() {
            Entity::List(list) => Reply::Integer(list.len() as i64),
            _ => Reply::wrong_type(),
        },
    }
}

fn lindex_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let index = match parse_i64(&args[1]) {
        Ok(i) => i,
        Err(r) => return r,
    };
    match get_list_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::NullBulk,
        Ok(Some(e)) => match &*e.read() {
            Entity::List(list) => {
                let len = list.len() as i64;
                let index = if index < 0 { len + index } else { index };
                if index < 0 || index >= len {
                    Reply::NullBulk
                } else {
                    Reply::Bulk(list[index as usize].clone())
                }
            }
            _ => Reply::wrong_type(),
        },
    }
}

fn lrange_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let start = match parse_i64(&args[1]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match get_list_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::MultiBulk(Vec::new()),
        Ok(Some(e)) => match &*e.read() {
            Entity::List(list) => {
                let Some((start, stop)) = normalize_range(start, stop, list.len() as i64) else {
                    return Reply::MultiBulk(Vec::new());
                };
                let items = list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start) as usize)
                    .cloned()
                    .collect();
                Reply::MultiBulk(items)
            }
            _ => Reply::wrong_type(),
        },
    }
}

fn lrem_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let count = match parse_i64(&args[1]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    let target = &args[2];
    let entity = match get_list_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::List(list) = &mut *guard else {
            return Reply::wrong_type();
        };
        let mut removed = 0i64;
        if count >= 0 {
            let limit = if count == 0 { i64::MAX } else { count };
            let mut i = 0;
            while i < list.len() {
                if removed < limit && &list[i] == target {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let limit = -count;
            let mut i = list.len();
            while i > 0 {
                i -= 1;
                if removed < limit && &list[i] == target {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        (removed, list.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("LREM", args));
    }
    Reply::Integer(removed)
}

/* -- hash commands -- */

fn hset_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    if (args.len() - 1) % 2 != 0 {
        return Reply::arity_err("hset");
    }
    let key = key_of(args);
    let entity = match get_or_create(db, &key, get_hash_entity(db, &key), || {
        Entity::Hash(HashMap::new())
    }) {
        Ok(e) => e,
        Err(r) => return r,
    };
    let added = {
        let mut guard = entity.write();
        let Entity::Hash(hash) = &mut *guard else {
            return Reply::wrong_type();
        };
        let mut added = 0i64;
        for pair in args[1..].chunks(2) {
            if hash.insert(as_str(&pair[0]), pair[1].clone()).is_none() {
                added += 1;
            }
        }
        added
    };
    db.add_aof(cmd_line("HSET", args));
    Reply::Integer(added)
}

fn hget_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_hash_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::NullBulk,
        Ok(Some(e)) => match &*e.read() {
            Entity::Hash(hash) => match hash.get(&as_str(&args[1])) {
                Some(v) => Reply::Bulk(v.clone()),
                None => Reply::NullBulk,
            },
            _ => Reply::wrong_type(),
        },
    }
}

fn hexists_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match hget_command(db, args) {
        Reply::Bulk(_) => Reply::Integer(1),
        Reply::NullBulk => Reply::Integer(0),
        other => other,
    }
}

fn hdel_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let entity = match get_hash_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::Hash(hash) = &mut *guard else {
            return Reply::wrong_type();
        };
        let mut removed = 0i64;
        for field in &args[1..] {
            if hash.remove(&as_str(field)).is_some() {
                removed += 1;
            }
        }
        (removed, hash.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("HDEL", args));
    }
    Reply::Integer(removed)
}

fn hlen_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_hash_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::Integer(0),
        Ok(Some(e)) => match &*e.read() {
            Entity::Hash(hash) => Reply::Integer(hash.len() as i64),
            _ => Reply::wrong_type(),
        },
    }
}

fn hgetall_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_hash_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::MultiBulk(Vec::new()),
        Ok(Some(e)) => match &*e.read() {
            Entity::Hash(hash) => {
                let mut items = Vec::with_capacity(hash.len() * 2);
                for (field, value) in hash {
                    items.push(field.as_bytes().to_vec());
                    items.push(value.clone());
                }
                Reply::MultiBulk(items)
            }
            _ => Reply::wrong_type(),
        },
    }
}

/* -- set commands -- */

fn sadd_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let entity = match get_or_create(db, &key, get_set_entity(db, &key), || {
        Entity::Set(std::collections::HashSet::new())
    }) {
        Ok(e) => e,
        Err(r) => return r,
    };
    let added = {
        let mut guard = entity.write();
        let Entity::Set(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        args[1..].iter().filter(|m| set.insert(as_str(m))).count() as i64
    };
    db.add_aof(cmd_line("SADD", args));
    Reply::Integer(added)
}

fn srem_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let entity = match get_set_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::Set(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        let removed = args[1..].iter().filter(|m| set.remove(&as_str(m))).count() as i64;
        (removed, set.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("SREM", args));
    }
    Reply::Integer(removed)
}

fn sismember_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_set_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::Integer(0),
        Ok(Some(e)) => match &*e.read() {
            Entity::Set(set) => Reply::Integer(set.contains(&as_str(&args[1])) as i64),
            _ => Reply::wrong_type(),
        },
    }
}

fn smembers_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_set_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::MultiBulk(Vec::new()),
        Ok(Some(e)) => match &*e.read() {
            Entity::Set(set) => {
                Reply::MultiBulk(set.iter().map(|m| m.as_bytes().to_vec()).collect())
            }
            _ => Reply::wrong_type(),
        },
    }
}

fn scard_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_set_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::Integer(0),
        Ok(Some(e)) => match &*e.read() {
            Entity::Set(set) => Reply::Integer(set.len() as i64),
            _ => Reply::wrong_type(),
        },
    }
}

/* -- sorted set commands -- */

fn zadd_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    if (args.len() - 1) % 2 != 0 {
        return Reply::err("syntax error");
    }
    let key = key_of(args);
    let mut pairs = Vec::with_capacity((args.len() - 1) / 2);
    for chunk in args[1..].chunks(2) {
        let score = match parse_f64(&chunk[0]) {
            Ok(s) => s,
            Err(r) => return r,
        };
        pairs.push((score, as_str(&chunk[1])));
    }
    let entity = match get_or_create(db, &key, get_zset_entity(db, &key), || {
        Entity::SortedSet(SortedSet::new())
    }) {
        Ok(e) => e,
        Err(r) => return r,
    };
    let added = {
        let mut guard = entity.write();
        let Entity::SortedSet(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        pairs
            .iter()
            .filter(|(score, member)| set.add(member, *score))
            .count() as i64
    };
    db.add_aof(cmd_line("ZADD", args));
    Reply::Integer(added)
}

fn zscore_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_zset_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::NullBulk,
        Ok(Some(e)) => match &*e.read() {
            Entity::SortedSet(set) => match set.get(&as_str(&args[1])) {
                Some(element) => Reply::Bulk(format_score(element.score).into_bytes()),
                None => Reply::NullBulk,
            },
            _ => Reply::wrong_type(),
        },
    }
}

fn zcard_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    match get_zset_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::Integer(0),
        Ok(Some(e)) => match &*e.read() {
            Entity::SortedSet(set) => Reply::Integer(set.len()),
            _ => Reply::wrong_type(),
        },
    }
}

fn rank_generic(db: &DB, args: &[Vec<u8>], desc: bool) -> Reply {
    match get_zset_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::NullBulk,
        Ok(Some(e)) => match &*e.read() {
            Entity::SortedSet(set) => match set.rank(&as_str(&args[1]), desc) {
                -1 => Reply::NullBulk,
                rank => Reply::Integer(rank),
            },
            _ => Reply::wrong_type(),
        },
    }
}

fn zrank_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    rank_generic(db, args, false)
}

fn zrevrank_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    rank_generic(db, args, true)
}

fn zrem_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let entity = match get_zset_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::SortedSet(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        let removed = args[1..].iter().filter(|m| set.remove(&as_str(m))).count() as i64;
        (removed, set.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("ZREM", args));
    }
    Reply::Integer(removed)
}

fn with_scores_flag(args: &[Vec<u8>], fixed: usize) -> Result<bool, Reply> {
    match args.len() {
        n if n == fixed => Ok(false),
        n if n == fixed + 1 && args[fixed].eq_ignore_ascii_case(b"WITHSCORES") => Ok(true),
        _ => Err(Reply::err("syntax error")),
    }
}

fn zrange_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let with_scores = match with_scores_flag(args, 3) {
        Ok(f) => f,
        Err(r) => return r,
    };
    let start = match parse_i64(&args[1]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match get_zset_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::MultiBulk(Vec::new()),
        Ok(Some(e)) => match &*e.read() {
            Entity::SortedSet(set) => {
                let Some((start, stop)) = normalize_range(start, stop, set.len()) else {
                    return Reply::MultiBulk(Vec::new());
                };
                let mut items = Vec::new();
                let walked = set.for_each(start, stop, false, |element| {
                    items.push(element.member.as_bytes().to_vec());
                    if with_scores {
                        items.push(format_score(element.score).into_bytes());
                    }
                    true
                });
                match walked {
                    Ok(()) => Reply::MultiBulk(items),
                    Err(e) => Reply::err(&e.to_string()),
                }
            }
            _ => Reply::wrong_type(),
        },
    }
}

fn zrangebyscore_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let with_scores = match with_scores_flag(args, 3) {
        Ok(f) => f,
        Err(r) => return r,
    };
    let min = match parse_border(&args[1]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let max = match parse_border(&args[2]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    match get_zset_entity(db, &key_of(args)) {
        Err(r) => r,
        Ok(None) => Reply::MultiBulk(Vec::new()),
        Ok(Some(e)) => match &*e.read() {
            Entity::SortedSet(set) => {
                let mut items = Vec::new();
                for element in set.range_by_score(&min, &max) {
                    items.push(element.member.into_bytes());
                    if with_scores {
                        items.push(format_score(element.score).into_bytes());
                    }
                }
                Reply::MultiBulk(items)
            }
            _ => Reply::wrong_type(),
        },
    }
}

fn zremrangebyscore_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let min = match parse_border(&args[1]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let max = match parse_border(&args[2]) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let entity = match get_zset_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::SortedSet(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        let removed = set.remove_range_by_score(&min, &max).len() as i64;
        (removed, set.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("ZREMRANGEBYSCORE", args));
    }
    Reply::Integer(removed)
}

fn zremrangebyrank_command(db: &DB, args: &[Vec<u8>]) -> Reply {
    let key = key_of(args);
    let start = match parse_i64(&args[1]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    let stop = match parse_i64(&args[2]) {
        Ok(v) => v,
        Err(r) => return r,
    };
    let entity = match get_zset_entity(db, &key) {
        Err(r) => return r,
        Ok(None) => return Reply::Integer(0),
        Ok(Some(e)) => e,
    };
    let (removed, emptied) = {
        let mut guard = entity.write();
        let Entity::SortedSet(set) = &mut *guard else {
            return Reply::wrong_type();
        };
        let Some((start, stop)) = normalize_range(start, stop, set.len()) else {
            return Reply::Integer(0);
        };
        let removed = set.remove_range_by_rank(start, stop).len() as i64;
        (removed, set.is_empty())
    };
    if removed > 0 {
        if emptied {
            db.remove_key(&key);
        }
        db.add_aof(cmd_line("ZREMRANGEBYRANK", args));
    }
    Reply::Integer(removed)
}
