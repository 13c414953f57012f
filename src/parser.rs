use std::io::{self, BufRead, BufReader, Read};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::error;

use crate::error::{Error, Result};
use crate::reply::Reply;

/// One parsed message, or the error that interrupted parsing. An I/O
/// error is the last payload before the channel closes; a protocol error
/// resets the decoder and parsing continues.
pub struct Payload(pub Result<Reply>);

/// Runs a producer thread decoding RESP off `reader`, yielding payloads
/// through the returned channel. The channel closes on EOF or a fatal
/// I/O error.
pub fn parse_stream<R: Read + Send + 'static>(reader: R) -> Receiver<Payload> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("resp-parser".to_string())
        .spawn(move || parse0(reader, tx));
    if let Err(e) = spawned {
        error!("can't spawn parser thread: {}", e);
    }
    rx
}

/// Decodes every reply in `data`. Helper for tests and the AOF loader.
pub fn parse_bytes(data: &[u8]) -> Result<Vec<Reply>> {
    let rx = parse_stream(io::Cursor::new(data.to_vec()));
    let mut replies = Vec::new();
    for payload in rx {
        match payload.0 {
            Ok(r) => replies.push(r),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(replies)
}

/// Decodes the first reply in `data`.
pub fn parse_one(data: &[u8]) -> Result<Reply> {
    parse_bytes(data)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Protocol("no reply".to_string()))
}

#[derive(Default)]
struct ReadState {
    reading_multi_line: bool,
    expected_args_count: usize,
    msg_type: u8,
    args: Vec<Vec<u8>>,
    /// Pending binary-safe body length; negative means none.
    bulk_len: i64,
}

impl ReadState {
    fn new() -> ReadState {
        ReadState {
            bulk_len: -1,
            ..ReadState::default()
        }
    }

    fn finished(&self) -> bool {
        self.expected_args_count > 0 && self.args.len() == self.expected_args_count
    }
}

enum Line {
    /// CRLF-terminated header line, marker byte included, CRLF stripped.
    Header(Vec<u8>),
    /// Binary-safe bulk body, CRLF stripped.
    Body(Vec<u8>),
}

fn parse0<R: Read>(reader: R, tx: Sender<Payload>) {
    let mut reader = BufReader::new(reader);
    let mut state = ReadState::new();
    loop {
        let line = match read_line(&mut reader, &mut state) {
            Ok(line) => line,
            Err(Error::Io(e)) => {
                let _ = tx.send(Payload(Err(Error::Io(e))));
                return;
            }
            Err(e) => {
                let _ = tx.send(Payload(Err(e)));
                state = ReadState::new();
                continue;
            }
        };

        let step = match line {
            Line::Body(body) => {
                state.args.push(body);
                Ok(())
            }
            Line::Header(header) => parse_header(header, &mut state, &tx),
        };
        if let Err(e) = step {
            let _ = tx.send(Payload(Err(e)));
            state = ReadState::new();
            continue;
        }

        if state.finished() {
            let reply = match state.msg_type {
                b'*' => Reply::MultiBulk(std::mem::take(&mut state.args)),
                _ => Reply::Bulk(state.args.pop().unwrap_or_default()),
            };
            let _ = tx.send(Payload(Ok(reply)));
            state = ReadState::new();
        }
    }
}

/// Reads either one CRLF-terminated line or, when a bulk length is
/// pending, exactly `bulk_len + 2` bytes. Only I/O failures are fatal.
fn read_line<R: BufRead>(reader: &mut R, state: &mut ReadState) -> Result<Line> {
    if state.bulk_len < 0 {
        let mut msg = Vec::new();
        let n = reader.read_until(b'\n', &mut msg)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        if msg.len() < 2 || msg[msg.len() - 2] != b'\r' {
            return Err(Error::Protocol(format!(
                "bad line terminator: {:?}",
                String::from_utf8_lossy(&msg)
            )));
        }
        msg.truncate(msg.len() - 2);
        Ok(Line::Header(msg))
    } else {
        let mut msg = vec![0u8; state.bulk_len as usize + 2];
        reader.read_exact(&mut msg)?;
        state.bulk_len = -1;
        if msg[msg.len() - 2] != b'\r' || msg[msg.len() - 1] != b'\n' {
            return Err(Error::Protocol("bad bulk terminator".to_string()));
        }
        msg.truncate(msg.len() - 2);
        Ok(Line::Body(msg))
    }
}

fn parse_header(header: Vec<u8>, state: &mut ReadState, tx: &Sender<Payload>) -> Result<()> {
    if state.reading_multi_line {
        // inside a multi-bulk every header must announce a bulk body
        return match header.first() {
            Some(b'$') => {
                let len = parse_int(&header[1..])?;
                if len < -1 {
                    return Err(Error::Protocol(format!("illegal bulk length: {}", len)));
                }
                if len == -1 {
                    // nil element, stored as an empty argument
                    state.args.push(Vec::new());
                } else {
                    state.bulk_len = len;
                }
                Ok(())
            }
            _ => Err(Error::Protocol(format!(
                "expected bulk header, got: {:?}",
                String::from_utf8_lossy(&header)
            ))),
        };
    }

    match header.first() {
        Some(b'*') => {
            let count = parse_int(&header[1..])?;
            match count {
                -1 => {
                    let _ = tx.send(Payload(Ok(Reply::NullMultiBulk)));
                    Ok(())
                }
                0 => {
                    let _ = tx.send(Payload(Ok(Reply::MultiBulk(Vec::new()))));
                    Ok(())
                }
                n if n > 0 => {
                    state.msg_type = b'*';
                    state.reading_multi_line = true;
                    state.expected_args_count = n as usize;
                    state.args = Vec::with_capacity(n as usize);
                    Ok(())
                }
                n => Err(Error::Protocol(format!("illegal array header: {}", n))),
            }
        }
        Some(b'$') => {
            let len = parse_int(&header[1..])?;
            match len {
                -1 => {
                    let _ = tx.send(Payload(Ok(Reply::NullBulk)));
                    Ok(())
                }
                n if n >= 0 => {
                    state.msg_type = b'$';
                    state.reading_multi_line = true;
                    state.expected_args_count = 1;
                    state.bulk_len = n;
                    Ok(())
                }
                n => Err(Error::Protocol(format!("illegal bulk length: {}", n))),
            }
        }
        Some(b'+') => {
            let _ = tx.send(Payload(Ok(Reply::Status(
                String::from_utf8_lossy(&header[1..]).into_owned(),
            ))));
            Ok(())
        }
        Some(b'-') => {
            let _ = tx.send(Payload(Ok(Reply::Error(
                String::from_utf8_lossy(&header[1..]).into_owned(),
            ))));
            Ok(())
        }
        Some(b':') => {
            let n = parse_int(&header[1..])?;
            let _ = tx.send(Payload(Ok(Reply::Integer(n))));
            Ok(())
        }
        _ => Err(Error::Protocol(format!(
            "unknown message type: {:?}",
            String::from_utf8_lossy(&header)
        ))),
    }
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::Protocol(format!("not an integer: {:?}", String::from_utf8_lossy(digits)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most three bytes per read so messages arrive split
    /// across arbitrary boundaries.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(3).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn round_trips_every_reply_kind() {
        let replies = vec![
            Reply::Status("OK".to_string()),
            Reply::Error("ERR boom".to_string()),
            Reply::Integer(-7),
            Reply::Bulk(b"binary\r\nsafe$*".to_vec()),
            Reply::Bulk(Vec::new()),
            Reply::NullBulk,
            Reply::MultiBulk(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]),
            Reply::MultiBulk(Vec::new()),
            Reply::NullMultiBulk,
        ];
        for reply in replies {
            let parsed = parse_one(&reply.to_bytes()).unwrap();
            assert_eq!(parsed, reply, "round-trip of {:?}", reply);
        }
    }

    #[test]
    fn decodes_pipelined_stream_in_order() {
        let mut data = Vec::new();
        data.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");
        data.extend_from_slice(b"+OK\r\n");
        data.extend_from_slice(b":42\r\n");
        data.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        let replies = parse_bytes(&data).unwrap();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0], Reply::MultiBulk(vec![b"PING".to_vec()]));
        assert_eq!(replies[1], Reply::Status("OK".to_string()));
        assert_eq!(replies[2], Reply::Integer(42));
        assert_eq!(
            replies[3],
            Reply::MultiBulk(vec![b"GET".to_vec(), b"k".to_vec()])
        );
    }

    #[test]
    fn survives_fragmented_reads() {
        let reply = Reply::MultiBulk(vec![b"ZADD".to_vec(), b"key".to_vec(), b"1.5".to_vec()]);
        let rx = parse_stream(Trickle {
            data: reply.to_bytes(),
            pos: 0,
        });
        let first = rx.recv().unwrap();
        assert_eq!(first.0.unwrap(), reply);
    }

    #[test]
    fn protocol_error_resets_and_parsing_continues() {
        let mut data = Vec::new();
        data.extend_from_slice(b"@what is this\r\n");
        data.extend_from_slice(b"+PONG\r\n");
        let rx = parse_stream(io::Cursor::new(data));
        let first = rx.recv().unwrap();
        assert!(matches!(first.0, Err(Error::Protocol(_))));
        let second = rx.recv().unwrap();
        assert_eq!(second.0.unwrap(), Reply::Status("PONG".to_string()));
    }

    #[test]
    fn bad_bulk_length_is_a_protocol_error() {
        let rx = parse_stream(io::Cursor::new(b"*1\r\n$x\r\n".to_vec()));
        let first = rx.recv().unwrap();
        assert!(matches!(first.0, Err(Error::Protocol(_))));
    }

    #[test]
    fn io_error_closes_the_channel() {
        // stream ends mid-message
        let rx = parse_stream(io::Cursor::new(b"*2\r\n$3\r\nGET\r\n".to_vec()));
        let first = rx.recv().unwrap();
        assert!(matches!(first.0, Err(Error::Io(_))));
        assert!(rx.recv().is_err());
    }

    #[test]
    fn bulk_body_may_start_with_a_marker_byte() {
        let reply = Reply::MultiBulk(vec![b"SET".to_vec(), b"k".to_vec(), b"$5\r\nx".to_vec()]);
        let parsed = parse_one(&reply.to_bytes()).unwrap();
        assert_eq!(parsed, reply);
    }
}
