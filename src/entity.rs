use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::reply::{cmd_line, CmdLine};
use crate::sortedset::SortedSet;

/// The value stored under a key: a tagged envelope over the five data
/// types. Handlers pattern-match and answer WRONGTYPE on a mismatch.
pub enum Entity {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<String, Vec<u8>>),
    Set(HashSet<String>),
    SortedSet(SortedSet),
}

/// Entities live in the dict behind a lock; readers hold the lock only
/// for the duration of one operation.
pub type SharedEntity = Arc<RwLock<Entity>>;

pub fn shared(entity: Entity) -> SharedEntity {
    Arc::new(RwLock::new(entity))
}

impl Entity {
    pub fn type_name(&self) -> &'static str {
        match self {
            Entity::Bytes(_) => "string",
            Entity::List(_) => "list",
            Entity::Hash(_) => "hash",
            Entity::Set(_) => "set",
            Entity::SortedSet(_) => "zset",
        }
    }
}

/// Serializes an entity back to the one command that recreates it, the
/// shape the AOF rewrite emits. Empty collections serialize to nothing,
/// matching their invisibility to readers.
pub fn entity_to_cmd(key: &str, entity: &Entity) -> Option<CmdLine> {
    let key_arg = key.as_bytes().to_vec();
    match entity {
        Entity::Bytes(b) => Some(cmd_line("SET", &[key_arg, b.clone()])),
        Entity::List(items) => {
            if items.is_empty() {
                return None;
            }
            let mut args = vec![key_arg];
            args.extend(items.iter().cloned());
            Some(cmd_line("RPUSH", &args))
        }
        Entity::Hash(fields) => {
            if fields.is_empty() {
                return None;
            }
            let mut args = vec![key_arg];
            for (field, value) in fields {
                args.push(field.as_bytes().to_vec());
                args.push(value.clone());
            }
            Some(cmd_line("HSET", &args))
        }
        Entity::Set(members) => {
            if members.is_empty() {
                return None;
            }
            let mut args = vec![key_arg];
            args.extend(members.iter().map(|m| m.as_bytes().to_vec()));
            Some(cmd_line("SADD", &args))
        }
        Entity::SortedSet(set) => {
            if set.is_empty() {
                return None;
            }
            let mut args = vec![key_arg];
            let ok = set
                .for_each(0, set.len(), false, |e| {
                    args.push(format_score(e.score).into_bytes());
                    args.push(e.member.as_bytes().to_vec());
                    true
                })
                .is_ok();
            ok.then(|| cmd_line("ZADD", &args))
        }
    }
}

/// Scores print in the shortest form that parses back to the same f64.
pub fn format_score(score: f64) -> String {
    format!("{}", score)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_serialize_to_set() {
        let cmd = entity_to_cmd("k", &Entity::Bytes(b"v".to_vec())).unwrap();
        assert_eq!(cmd, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
    }

    #[test]
    fn list_serializes_to_one_rpush() {
        let list: VecDeque<Vec<u8>> = [b"a".to_vec(), b"b".to_vec()].into_iter().collect();
        let cmd = entity_to_cmd("l", &Entity::List(list)).unwrap();
        assert_eq!(
            cmd,
            vec![b"RPUSH".to_vec(), b"l".to_vec(), b"a".to_vec(), b"b".to_vec()]
        );
        assert!(entity_to_cmd("l", &Entity::List(VecDeque::new())).is_none());
    }

    #[test]
    fn zset_serializes_in_rank_order() {
        let mut set = SortedSet::with_seed(4);
        set.add("b", 2.0);
        set.add("a", 1.5);
        let cmd = entity_to_cmd("z", &Entity::SortedSet(set)).unwrap();
        assert_eq!(
            cmd,
            vec![
                b"ZADD".to_vec(),
                b"z".to_vec(),
                b"1.5".to_vec(),
                b"a".to_vec(),
                b"2".to_vec(),
                b"b".to_vec()
            ]
        );
    }
}
