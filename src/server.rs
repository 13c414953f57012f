use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, Receiver, Sender};
use libc::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use log::{error, info};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::handler::Handler;
use crate::wait::Wait;

/// Binds the configured address and serves until one of the shutdown
/// signals arrives.
pub fn listen_and_serve_with_signal(cfg: &ServerConfig, handler: Arc<dyn Handler>) -> Result<()> {
    let (close_tx, close_rx) = bounded(1);
    register_shutdown_signals(close_tx)?;
    let listener = TcpListener::bind(&cfg.address)?;
    info!("bind: {}, start listening...", cfg.address);
    listen_and_serve(listener, handler, close_rx);
    Ok(())
}

/// Accept loop. Each connection runs on its own thread; a message on
/// `close_rx` shuts the listener down (so accept returns an error) and
/// closes the handler. Returns once every in-flight handler finished.
pub fn listen_and_serve(listener: TcpListener, handler: Arc<dyn Handler>, close_rx: Receiver<()>) {
    let listener_fd = listener.as_raw_fd();
    let closing_handler = handler.clone();
    thread::spawn(move || {
        let _ = close_rx.recv();
        info!("shutting down...");
        unsafe {
            libc::shutdown(listener_fd, libc::SHUT_RDWR);
        }
        closing_handler.close();
    });

    let wait_done = Arc::new(Wait::new());
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(_) => break,
        };
        info!("accept link");
        wait_done.add(1);
        let handler = handler.clone();
        let wait = wait_done.clone();
        thread::spawn(move || {
            // released even if the handler panics
            struct Done(Arc<Wait>);
            impl Drop for Done {
                fn drop(&mut self) {
                    self.0.done();
                }
            }
            let _done = Done(wait);
            handler.handle(stream);
        });
    }
    wait_done.wait();
}

/// Translates SIGHUP/SIGQUIT/SIGTERM/SIGINT into one message on
/// `close_tx`. The handler only touches a pipe (async-signal-safe); a
/// watcher thread does the rest.
fn register_shutdown_signals(close_tx: Sender<()>) -> Result<()> {
    static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn on_signal(_sig: libc::c_int) {
        let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            unsafe {
                libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1);
            }
        }
    }

    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    PIPE_WRITE_FD.store(fds[1], Ordering::Relaxed);
    unsafe {
        for sig in [SIGHUP, SIGQUIT, SIGTERM, SIGINT] {
            libc::signal(sig, on_signal as usize);
        }
    }

    let read_fd = fds[0];
    let spawned = thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
            }
            let _ = close_tx.send(());
        });
    if let Err(e) = spawned {
        error!("can't spawn signal watcher: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use super::*;
    use crate::handler::EchoHandler;

    #[test]
    fn echo_server_round_trip_and_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (close_tx, close_rx) = bounded(1);
        let server = thread::spawn(move || {
            listen_and_serve(listener, Arc::new(EchoHandler::new()), close_rx);
        });

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        for i in 0..5 {
            let line = format!("hello {}\n", i);
            conn.write_all(line.as_bytes()).unwrap();
            let mut echoed = String::new();
            reader.read_line(&mut echoed).unwrap();
            assert_eq!(echoed, line);
        }
        drop(conn);

        close_tx.send(()).unwrap();
        server.join().unwrap();

        // the listener is gone after shutdown
        assert!(TcpStream::connect(addr).is_err());
    }
}
