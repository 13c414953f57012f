use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::db::DB;
use crate::error::Error;
use crate::parser::parse_stream;
use crate::reply::Reply;
use crate::wait::Wait;

/// Something that serves one accepted connection at a time and can be
/// told to stop serving.
pub trait Handler: Send + Sync {
    fn handle(&self, stream: TcpStream);
    fn close(&self);
}

/// Per-connection state shared between the serving thread, the pub/sub
/// hub and the shutdown path. A fake connection (no socket) stands in
/// during AOF replay.
pub struct Connection {
    stream: Option<Mutex<TcpStream>>,
    /// Raised around writes so close() does not cut a reply in half.
    writing: Wait,
    subs: Mutex<HashSet<String>>,
    authenticated: AtomicBool,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Arc<Connection> {
        Arc::new(Connection {
            stream: Some(Mutex::new(stream)),
            writing: Wait::new(),
            subs: Mutex::new(HashSet::new()),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn fake() -> Arc<Connection> {
        Arc::new(Connection {
            stream: None,
            writing: Wait::new(),
            subs: Mutex::new(HashSet::new()),
            authenticated: AtomicBool::new(false),
        })
    }

    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        self.writing.add(1);
        let result = stream.lock().write_all(bytes);
        self.writing.done();
        result
    }

    /// Waits out an in-flight write, then closes the socket.
    pub fn close(&self) {
        self.writing.wait_with_timeout(Duration::from_secs(10));
        if let Some(stream) = &self.stream {
            let _ = stream.lock().shutdown(Shutdown::Both);
        }
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Relaxed);
    }

    pub(crate) fn add_subscription(&self, channel: &str) -> bool {
        self.subs.lock().insert(channel.to_string())
    }

    pub(crate) fn remove_subscription(&self, channel: &str) {
        self.subs.lock().remove(channel);
    }

    pub(crate) fn clear_subscriptions(&self) {
        self.subs.lock().clear();
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subs.lock().iter().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }
}

/// Serves RESP: one parser per connection, commands dispatched against
/// the store, replies written back in arrival order.
pub struct RespHandler {
    db: Arc<DB>,
    active: Mutex<Vec<Arc<Connection>>>,
    closing: AtomicBool,
    max_connect: usize,
    timeout: Option<Duration>,
}

impl RespHandler {
    pub fn new(db: Arc<DB>, max_connect: u32, timeout: Option<Duration>) -> RespHandler {
        RespHandler {
            db,
            active: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            max_connect: max_connect as usize,
            timeout,
        }
    }

    fn register(&self, conn: &Arc<Connection>) -> bool {
        let mut active = self.active.lock();
        if self.max_connect > 0 && active.len() >= self.max_connect {
            return false;
        }
        active.push(conn.clone());
        true
    }

    fn deregister(&self, conn: &Arc<Connection>) {
        self.db.hub().drop_connection(conn);
        self.active.lock().retain(|c| !Arc::ptr_eq(c, conn));
    }
}

impl Handler for RespHandler {
    fn handle(&self, stream: TcpStream) {
        if self.closing.load(Ordering::Relaxed) {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        if let Some(timeout) = self.timeout {
            let _ = stream.set_read_timeout(Some(timeout));
        }
        let write_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!("can't clone connection: {}", e);
                return;
            }
        };
        let conn = Connection::new(write_half);
        if !self.register(&conn) {
            warn!("connection limit reached, refusing client");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        for payload in parse_stream(stream) {
            match payload.0 {
                Err(Error::Io(_)) => break,
                Err(e) => {
                    // protocol error: answer and keep the connection
                    let reply = Reply::err(&e.to_string());
                    if conn.write(&reply.to_bytes()).is_err() {
                        break;
                    }
                }
                Ok(Reply::MultiBulk(args)) if !args.is_empty() => {
                    let name = args[0].to_ascii_lowercase();
                    let reply = match name.as_slice() {
                        b"subscribe" | b"unsubscribe" if !self.db.auth_ok(&conn) => {
                            Some(Reply::Error("NOAUTH Authentication required".to_string()))
                        }
                        b"subscribe" => {
                            if args.len() < 2 {
                                Some(Reply::arity_err("subscribe"))
                            } else {
                                self.db.hub().subscribe(&conn, &args[1..]);
                                None
                            }
                        }
                        b"unsubscribe" => {
                            self.db.hub().unsubscribe(&conn, &args[1..]);
                            None
                        }
                        _ => Some(self.db.exec(&conn, &args)),
                    };
                    if let Some(reply) = reply {
                        if conn.write(&reply.to_bytes()).is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {
                    let reply = Reply::err("require multi bulk command");
                    if conn.write(&reply.to_bytes()).is_err() {
                        break;
                    }
                }
            }
        }
        self.deregister(&conn);
    }

    fn close(&self) {
        info!("handler shutting down...");
        self.closing.store(true, Ordering::Relaxed);
        let active: Vec<Arc<Connection>> = self.active.lock().drain(..).collect();
        for conn in active {
            conn.close();
        }
    }
}

/// Echoes every received line back, the reference implementation of the
/// Handler contract used to smoke-test the server loop.
pub struct EchoHandler {
    active: Mutex<Vec<Arc<Connection>>>,
    closing: AtomicBool,
}

impl EchoHandler {
    pub fn new() -> EchoHandler {
        EchoHandler {
            active: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        }
    }
}

impl Default for EchoHandler {
    fn default() -> EchoHandler {
        EchoHandler::new()
    }
}

impl Handler for EchoHandler {
    fn handle(&self, stream: TcpStream) {
        if self.closing.load(Ordering::Relaxed) {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        let write_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!("can't clone connection: {}", e);
                return;
            }
        };
        let conn = Connection::new(write_half);
        self.active.lock().push(conn.clone());

        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line) {
                Ok(0) => {
                    info!("connection closed");
                    break;
                }
                Ok(_) => {
                    if conn.write(line.as_bytes()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("echo read failed: {}", e);
                    break;
                }
            }
        }
        self.active.lock().retain(|c| !Arc::ptr_eq(c, &conn));
    }

    fn close(&self) {
        info!("handler shutting down...");
        self.closing.store(true, Ordering::Relaxed);
        let active: Vec<Arc<Connection>> = self.active.lock().drain(..).collect();
        for conn in active {
            conn.close();
        }
    }
}
