use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::aof::{Aof, AOF_QUEUE_SIZE};
use crate::cmd::lookup_command;
use crate::config::ServerConfig;
use crate::dict::Dict;
use crate::entity::SharedEntity;
use crate::error::Error;
use crate::handler::Connection;
use crate::lock::Locks;
use crate::parser::parse_stream;
use crate::pubsub::Hub;
use crate::reply::{CmdLine, Reply};
use crate::util::now_ms;

const DATA_DICT_SHARDS: usize = 1 << 4;
const TTL_DICT_SHARDS: usize = 1 << 10;
const LOCKER_SIZE: usize = 1024;

/// The store: value and TTL dicts, the striped locks serializing
/// multi-step commands, the stop-the-world gate FLUSHDB holds
/// exclusively, the pub/sub hub and the AOF plumbing.
pub struct DB {
    pub(crate) data: Dict<SharedEntity>,
    pub(crate) ttl: Dict<u64>,
    pub(crate) locker: Locks,
    stop_world: RwLock<()>,
    hub: Hub,
    requirepass: Option<String>,

    pub(crate) aof: Option<Arc<Aof>>,
    aof_chan: RwLock<Option<Sender<CmdLine>>>,
    aof_finished: Mutex<Option<Receiver<()>>>,
}

impl DB {
    /// An in-memory store with no durability, also the throwaway target
    /// the AOF rewrite replays into.
    pub fn memory() -> DB {
        DB {
            data: Dict::new(DATA_DICT_SHARDS),
            ttl: Dict::new(TTL_DICT_SHARDS),
            locker: Locks::new(LOCKER_SIZE),
            stop_world: RwLock::new(()),
            hub: Hub::new(),
            requirepass: None,
            aof: None,
            aof_chan: RwLock::new(None),
            aof_finished: Mutex::new(None),
        }
    }

    pub fn new(cfg: &ServerConfig) -> DB {
        let mut db = DB::memory();
        db.requirepass = cfg.requirepass.clone();
        if cfg.appendonly {
            let path = Path::new(&cfg.appendfilename);
            db.load_aof(path, None);
            match Aof::open(path.to_path_buf()) {
                Ok(aof) => {
                    let aof = Arc::new(aof);
                    let (tx, rx) = bounded(AOF_QUEUE_SIZE);
                    let finished = aof.start_writer(rx);
                    *db.aof_chan.write() = Some(tx);
                    *db.aof_finished.lock() = Some(finished);
                    db.aof = Some(aof);
                }
                Err(e) => error!("can't open append only file: {}", e),
            }
        }
        db
    }

    /// Stops accepting AOF traffic and drains the writer.
    pub fn close(&self) {
        let chan = self.aof_chan.write().take();
        drop(chan);
        if let Some(finished) = self.aof_finished.lock().take() {
            if finished.recv_timeout(Duration::from_secs(10)).is_err() {
                warn!("aof writer did not drain in time");
            }
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn auth_ok(&self, conn: &Connection) -> bool {
        self.requirepass.is_none() || conn.authenticated()
    }

    /// Resolves and runs one command line. Arity errors, unknown names
    /// and type mismatches come back as RESP error replies; the
    /// connection stays usable.
    pub fn exec(&self, conn: &Connection, argv: &[Vec<u8>]) -> Reply {
        let Some(first) = argv.first() else {
            return Reply::err("empty command");
        };
        let name = String::from_utf8_lossy(first).to_lowercase();

        if name == "auth" {
            return self.auth_command(conn, &argv[1..]);
        }
        if !self.auth_ok(conn) {
            return Reply::Error("NOAUTH Authentication required".to_string());
        }

        let Some(cmd) = lookup_command(&name) else {
            return Reply::err(&format!("unknown command '{}'", name));
        };
        if !validate_arity(cmd.arity, argv.len()) {
            return Reply::arity_err(&name);
        }

        let args = &argv[1..];
        let (write_keys, read_keys) = (cmd.prepare)(args);
        let _locks = (!write_keys.is_empty() || !read_keys.is_empty())
            .then(|| self.locker.lock_keys(&write_keys, &read_keys));

        if name == "flushdb" {
            let _world = self.stop_world.write();
            (cmd.exec)(self, args)
        } else {
            let _world = self.stop_world.read();
            (cmd.exec)(self, args)
        }
    }

    fn auth_command(&self, conn: &Connection, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return Reply::arity_err("auth");
        }
        match &self.requirepass {
            None => Reply::err("Client sent AUTH, but no password is set"),
            Some(pass) if pass.as_bytes() == args[0].as_slice() => {
                conn.set_authenticated(true);
                Reply::ok()
            }
            Some(_) => Reply::err("invalid password"),
        }
    }

    /// The value under `key`, expiring it lazily first.
    pub(crate) fn get_entity(&self, key: &str) -> Option<SharedEntity> {
        if self.expire_if_needed(key) {
            return None;
        }
        self.data.get(key)
    }

    pub(crate) fn expire_if_needed(&self, key: &str) -> bool {
        match self.ttl.get(key) {
            Some(at) if at <= now_ms() => {
                self.data.remove(key);
                self.ttl.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_key(&self, key: &str) -> usize {
        self.ttl.remove(key);
        self.data.remove(key)
    }

    pub(crate) fn flush(&self) {
        self.data.clear();
        self.ttl.clear();
    }

    /// Hands a mutating command to the AOF writer. A no-op while AOF is
    /// disabled or temporarily unplugged for a load.
    pub(crate) fn add_aof(&self, cmd: CmdLine) {
        if let Some(tx) = self.aof_chan.read().as_ref() {
            if let Err(e) = tx.send(cmd) {
                warn!("aof channel rejected command: {}", e);
            }
        }
    }

    /// Replays the log at `filename`, optionally capped at `max_bytes`.
    /// The AOF channel is unplugged for the duration so replayed
    /// commands don't feed back into the log.
    pub fn load_aof(&self, filename: &Path, max_bytes: Option<u64>) {
        struct Unplugged<'a> {
            db: &'a DB,
            saved: Option<Sender<CmdLine>>,
        }
        impl Drop for Unplugged<'_> {
            fn drop(&mut self) {
                *self.db.aof_chan.write() = self.saved.take();
            }
        }
        let _restore = Unplugged {
            saved: self.aof_chan.write().take(),
            db: self,
        };

        let file = match std::fs::File::open(filename) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("can't open append only file {}: {}", filename.display(), e);
                return;
            }
        };
        let reader: Box<dyn std::io::Read + Send> = match max_bytes {
            Some(n) => Box::new(std::io::Read::take(file, n)),
            None => Box::new(file),
        };

        let fake = Connection::fake();
        let mut loaded = 0usize;
        for payload in parse_stream(reader) {
            match payload.0 {
                Err(Error::Io(_)) => break,
                Err(e) => {
                    error!("aof parse error: {}", e);
                    continue;
                }
                Ok(Reply::MultiBulk(args)) if !args.is_empty() => {
                    let reply = self.exec(&fake, &args);
                    if reply.is_error() {
                        warn!(
                            "aof replay of '{}' failed",
                            String::from_utf8_lossy(&args[0])
                        );
                    }
                    loaded += 1;
                }
                Ok(_) => error!("aof entry is not a multi bulk command"),
            }
        }
        if loaded > 0 {
            info!("replayed {} commands from {}", loaded, filename.display());
        }
    }
}

fn validate_arity(arity: i32, argc: usize) -> bool {
    let argc = argc as i32;
    if arity >= 0 {
        argc == arity
    } else {
        argc >= -arity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_validation() {
        assert!(validate_arity(3, 3));
        assert!(!validate_arity(3, 4));
        assert!(validate_arity(-2, 2));
        assert!(validate_arity(-2, 5));
        assert!(!validate_arity(-2, 1));
    }

    #[test]
    fn unknown_command_and_arity_errors_are_replies() {
        let db = DB::memory();
        let conn = Connection::fake();
        let reply = db.exec(&conn, &[b"NOPE".to_vec()]);
        assert!(matches!(reply, Reply::Error(ref e) if e.contains("unknown command")));
        let reply = db.exec(&conn, &[b"GET".to_vec()]);
        assert!(matches!(reply, Reply::Error(ref e) if e.contains("wrong number of arguments")));
    }

    #[test]
    fn auth_gates_commands() {
        let mut db = DB::memory();
        db.requirepass = Some("sekret".to_string());
        let conn = Connection::fake();
        let reply = db.exec(&conn, &[b"PING".to_vec()]);
        assert!(matches!(reply, Reply::Error(ref e) if e.starts_with("NOAUTH")));

        let reply = db.exec(&conn, &[b"AUTH".to_vec(), b"wrong".to_vec()]);
        assert!(reply.is_error());
        let reply = db.exec(&conn, &[b"AUTH".to_vec(), b"sekret".to_vec()]);
        assert_eq!(reply, Reply::ok());
        let reply = db.exec(&conn, &[b"PING".to_vec()]);
        assert_eq!(reply, Reply::pong());
    }
}
