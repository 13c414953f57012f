use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Receiver, Sender};
use log::{error, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::parser::parse_stream;
use crate::reply::{CmdLine, Reply};
use crate::wait::Wait;

const CHAN_SIZE: usize = 256;
const MAX_WAIT: Duration = Duration::from_secs(3);
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
const MAX_RECONNECTS: usize = 3;

/// A pipelined client: requests queue on `pending`, a writer thread puts
/// them on the wire and moves them to `waiting`, a reader thread matches
/// replies to the head of `waiting` in FIFO order. A heartbeat PINGs the
/// server every ten seconds.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    addr: String,
    conn: Mutex<TcpStream>,
    pending_tx: Mutex<Option<Sender<Arc<Request>>>>,
    waiting_tx: Mutex<Option<Sender<Arc<Request>>>>,
    waiting_rx: Receiver<Arc<Request>>,
    heartbeat_stop: Mutex<Option<Sender<()>>>,
    /// Counts requests between enqueue and completion, drained on close.
    working: Wait,
    closing: AtomicBool,
}

struct Request {
    args: CmdLine,
    heartbeat: bool,
    reply: Mutex<Option<Reply>>,
    error: Mutex<Option<String>>,
    waiting: Wait,
}

impl Request {
    fn new(args: CmdLine, heartbeat: bool) -> Arc<Request> {
        let request = Arc::new(Request {
            args,
            heartbeat,
            reply: Mutex::new(None),
            error: Mutex::new(None),
            waiting: Wait::new(),
        });
        request.waiting.add(1);
        request
    }

    fn complete(&self, reply: Reply) {
        *self.reply.lock() = Some(reply);
        self.waiting.done();
    }

    fn fail(&self, message: String) {
        *self.error.lock() = Some(message);
        self.waiting.done();
    }
}

impl Client {
    pub fn connect(addr: &str) -> Result<Client> {
        let conn = TcpStream::connect(addr)?;
        let (pending_tx, pending_rx) = bounded(CHAN_SIZE);
        let (waiting_tx, waiting_rx) = bounded(CHAN_SIZE);
        let (stop_tx, stop_rx) = bounded(1);
        let inner = Arc::new(ClientInner {
            addr: addr.to_string(),
            conn: Mutex::new(conn),
            pending_tx: Mutex::new(Some(pending_tx)),
            waiting_tx: Mutex::new(Some(waiting_tx)),
            waiting_rx,
            heartbeat_stop: Mutex::new(Some(stop_tx)),
            working: Wait::new(),
            closing: AtomicBool::new(false),
        });

        inner.spawn_reader();
        ClientInner::spawn_writer(&inner, pending_rx);
        ClientInner::spawn_heartbeat(&inner, stop_rx);
        Ok(Client { inner })
    }

    /// Enqueues a request and waits up to three seconds for its reply.
    pub fn send(&self, args: CmdLine) -> Reply {
        let request = Request::new(args, false);
        self.inner.working.add(1);
        let sent = self.inner.enqueue(&request);
        if !sent {
            self.inner.working.done();
            return Reply::Error("client closed".to_string());
        }
        let timed_out = request.waiting.wait_with_timeout(MAX_WAIT);
        self.inner.working.done();
        if timed_out {
            return Reply::Error("server time out".to_string());
        }
        if request.error.lock().is_some() {
            return Reply::Error("request failed".to_string());
        }
        let reply = request
            .reply
            .lock()
            .clone()
            .unwrap_or_else(|| Reply::Error("request failed".to_string()));
        reply
    }

    /// Stops the heartbeat, refuses new requests, drains the in-flight
    /// ones, then tears the socket down. Requests still awaiting replies
    /// complete with an error reply carrying the I/O message.
    pub fn close(&self) {
        if let Some(stop) = self.inner.heartbeat_stop.lock().take() {
            let _ = stop.send(());
        }
        *self.inner.pending_tx.lock() = None;
        self.inner.working.wait();
        self.inner.closing.store(true, Ordering::SeqCst);
        let _ = self.inner.conn.lock().shutdown(Shutdown::Both);
        *self.inner.waiting_tx.lock() = None;
    }
}

impl ClientInner {
    fn enqueue(&self, request: &Arc<Request>) -> bool {
        let tx = self.pending_tx.lock().as_ref().cloned();
        match tx {
            Some(tx) => tx.send(request.clone()).is_ok(),
            None => false,
        }
    }

    fn spawn_writer(inner: &Arc<ClientInner>, pending_rx: Receiver<Arc<Request>>) {
        let inner = inner.clone();
        let spawned = thread::Builder::new()
            .name("client-writer".to_string())
            .spawn(move || {
                for request in pending_rx.iter() {
                    inner.do_request(request);
                }
            });
        if let Err(e) = spawned {
            error!("can't spawn client writer: {}", e);
        }
    }

    fn spawn_heartbeat(inner: &Arc<ClientInner>, stop_rx: Receiver<()>) {
        let inner = inner.clone();
        let spawned = thread::Builder::new()
            .name("client-heartbeat".to_string())
            .spawn(move || {
                let ticker = tick(HEARTBEAT_PERIOD);
                loop {
                    crossbeam::select! {
                        recv(ticker) -> _ => inner.do_heartbeat(),
                        recv(stop_rx) -> _ => return,
                    }
                }
            });
        if let Err(e) = spawned {
            error!("can't spawn client heartbeat: {}", e);
        }
    }

    /// Reader: a RESP parser over the socket, completing the head of
    /// `waiting` per payload. Exits when the parser channel closes; on a
    /// final close it fails whatever is still waiting.
    fn spawn_reader(self: &Arc<Self>) {
        let stream = match self.conn.lock().try_clone() {
            Ok(s) => s,
            Err(e) => {
                error!("can't clone client connection: {}", e);
                return;
            }
        };
        let inner = self.clone();
        let spawned = thread::Builder::new()
            .name("client-reader".to_string())
            .spawn(move || {
                let mut last_error = "connection closed".to_string();
                for payload in parse_stream(stream) {
                    match payload.0 {
                        Ok(reply) => inner.finish_request(reply),
                        Err(e) => {
                            last_error = e.to_string();
                            inner.finish_request(Reply::Error(last_error.clone()));
                        }
                    }
                }
                if inner.closing.load(Ordering::SeqCst) {
                    while let Ok(request) = inner.waiting_rx.try_recv() {
                        if request.heartbeat {
                            request.waiting.done();
                        } else {
                            request.complete(Reply::Error(last_error.clone()));
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            error!("can't spawn client reader: {}", e);
        }
    }

    fn do_heartbeat(&self) {
        let request = Request::new(vec![b"PING".to_vec()], true);
        self.working.add(1);
        if self.enqueue(&request) && request.waiting.wait_with_timeout(MAX_WAIT) {
            warn!("heartbeat timed out");
        }
        self.working.done();
    }

    /// Writer body: encode, write, move to `waiting`; on write failure
    /// reconnect and retry a bounded number of times.
    fn do_request(self: &Arc<Self>, request: Arc<Request>) {
        if request.args.is_empty() {
            return;
        }
        let bytes = Reply::MultiBulk(request.args.clone()).to_bytes();
        let mut result = self.conn.lock().write_all(&bytes);
        let mut attempts = 0;
        while result.is_err() && attempts < MAX_RECONNECTS {
            attempts += 1;
            match self.reconnect() {
                Ok(()) => result = self.conn.lock().write_all(&bytes),
                Err(e) => warn!("reconnect failed: {}", e),
            }
        }
        match result {
            Ok(()) => {
                let tx = self.waiting_tx.lock().as_ref().cloned();
                match tx {
                    Some(tx) if tx.send(request.clone()).is_ok() => {}
                    _ => request.fail("client closed".to_string()),
                }
            }
            Err(e) => request.fail(e.to_string()),
        }
    }

    fn reconnect(self: &Arc<Self>) -> std::io::Result<()> {
        {
            // tolerate a socket that is already gone
            let conn = self.conn.lock();
            let _ = conn.shutdown(Shutdown::Both);
        }
        let fresh = TcpStream::connect(&self.addr)?;
        *self.conn.lock() = fresh;
        self.spawn_reader();
        Ok(())
    }

    fn finish_request(&self, reply: Reply) {
        let Ok(request) = self.waiting_rx.recv() else {
            return;
        };
        request.complete(reply);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::net::TcpListener;

    use crossbeam::channel::bounded as chan;

    use super::*;
    use crate::config::ServerConfig;
    use crate::db::DB;
    use crate::handler::RespHandler;
    use crate::server::listen_and_serve;

    fn start_server() -> (String, Sender<()>, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let db = Arc::new(DB::new(&ServerConfig::default()));
        let handler = Arc::new(RespHandler::new(db, 0, None));
        let (close_tx, close_rx) = chan(1);
        let join = thread::spawn(move || listen_and_serve(listener, handler, close_rx));
        (addr, close_tx, join)
    }

    #[test]
    fn sequential_requests_come_back_in_order() {
        let (addr, close_tx, join) = start_server();
        let client = Client::connect(&addr).unwrap();

        assert_eq!(client.send(vec![b"PING".to_vec()]), Reply::pong());
        for i in 1..=100 {
            let reply = client.send(vec![b"INCR".to_vec(), b"k".to_vec()]);
            assert_eq!(reply, Reply::Integer(i));
        }
        assert_eq!(
            client.send(vec![b"GET".to_vec(), b"k".to_vec()]),
            Reply::bulk(b"100")
        );

        client.close();
        close_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn concurrent_pipelined_increments_all_pair_up() {
        let (addr, close_tx, join) = start_server();
        let client = Arc::new(Client::connect(&addr).unwrap());

        let threads = 4;
        let per_thread = 50;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let client = client.clone();
            handles.push(thread::spawn(move || {
                let mut replies = Vec::new();
                for _ in 0..per_thread {
                    replies.push(client.send(vec![b"INCR".to_vec(), b"n".to_vec()]));
                }
                replies
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for reply in handle.join().unwrap() {
                match reply {
                    Reply::Integer(v) => assert!(seen.insert(v), "duplicate reply {}", v),
                    other => panic!("unexpected reply {:?}", other),
                }
            }
        }
        // every request got its own counter value: replies were matched
        // to requests in FIFO order
        let total = (threads * per_thread) as i64;
        assert_eq!(seen.len() as i64, total);
        assert!(seen.contains(&1) && seen.contains(&total));
        assert_eq!(
            client.send(vec![b"GET".to_vec(), b"n".to_vec()]),
            Reply::bulk(total.to_string().as_bytes())
        );

        client.close();
        close_tx.send(()).unwrap();
        join.join().unwrap();
    }

    #[test]
    fn send_after_close_is_an_error_reply() {
        let (addr, close_tx, join) = start_server();
        let client = Client::connect(&addr).unwrap();
        client.close();
        let reply = client.send(vec![b"PING".to_vec()]);
        assert!(reply.is_error());
        close_tx.send(()).unwrap();
        join.join().unwrap();
    }
}
