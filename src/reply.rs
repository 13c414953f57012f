/// A command line on the wire: the command name followed by its
/// arguments, each binary safe.
pub type CmdLine = Vec<Vec<u8>>;

pub fn cmd_line(name: &str, args: &[Vec<u8>]) -> CmdLine {
    let mut line = Vec::with_capacity(args.len() + 1);
    line.push(name.as_bytes().to_vec());
    line.extend(args.iter().cloned());
    line
}

/// One RESP reply. Every variant encodes to bytes with `to_bytes`; the
/// parser produces the same variants back, so encode/parse round-trips.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+...` one-line status
    Status(String),
    /// `-...` error with a leading category tag (ERR, WRONGTYPE, ...)
    Error(String),
    /// `:n`
    Integer(i64),
    /// `$len` binary-safe string
    Bulk(Vec<u8>),
    /// `$-1`
    NullBulk,
    /// `*n` of bulk strings
    MultiBulk(Vec<Vec<u8>>),
    /// `*-1`
    NullMultiBulk,
}

pub const CRLF: &[u8] = b"\r\n";

impl Reply {
    pub fn ok() -> Reply {
        Reply::Status("OK".to_string())
    }

    pub fn pong() -> Reply {
        Reply::Status("PONG".to_string())
    }

    pub fn err(msg: &str) -> Reply {
        Reply::Error(format!("ERR {}", msg))
    }

    pub fn wrong_type() -> Reply {
        Reply::Error("WRONGTYPE Operation against a key holding the wrong kind of value".to_string())
    }

    pub fn arity_err(name: &str) -> Reply {
        Reply::Error(format!("ERR wrong number of arguments for '{}' command", name))
    }

    pub fn bulk(data: &[u8]) -> Reply {
        Reply::Bulk(data.to_vec())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Reply::Status(s) => {
                let mut out = Vec::with_capacity(s.len() + 3);
                out.push(b'+');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
                out
            }
            Reply::Error(s) => {
                let mut out = Vec::with_capacity(s.len() + 3);
                out.push(b'-');
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(CRLF);
                out
            }
            Reply::Integer(i) => format!(":{}\r\n", i).into_bytes(),
            Reply::Bulk(data) => {
                let mut out = format!("${}\r\n", data.len()).into_bytes();
                out.extend_from_slice(data);
                out.extend_from_slice(CRLF);
                out
            }
            Reply::NullBulk => b"$-1\r\n".to_vec(),
            Reply::MultiBulk(items) => {
                let mut out = format!("*{}\r\n", items.len()).into_bytes();
                for item in items {
                    out.extend_from_slice(format!("${}\r\n", item.len()).as_bytes());
                    out.extend_from_slice(item);
                    out.extend_from_slice(CRLF);
                }
                out
            }
            Reply::NullMultiBulk => b"*-1\r\n".to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_constants() {
        assert_eq!(Reply::ok().to_bytes(), b"+OK\r\n");
        assert_eq!(Reply::pong().to_bytes(), b"+PONG\r\n");
        assert_eq!(Reply::NullBulk.to_bytes(), b"$-1\r\n");
        assert_eq!(Reply::NullMultiBulk.to_bytes(), b"*-1\r\n");
    }

    #[test]
    fn encodings() {
        assert_eq!(Reply::Integer(-42).to_bytes(), b":-42\r\n");
        assert_eq!(Reply::bulk(b"hey").to_bytes(), b"$3\r\nhey\r\n");
        assert_eq!(Reply::bulk(b"").to_bytes(), b"$0\r\n\r\n");
        assert_eq!(
            Reply::MultiBulk(vec![b"GET".to_vec(), b"k".to_vec()]).to_bytes(),
            b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"
        );
        assert_eq!(Reply::MultiBulk(vec![]).to_bytes(), b"*0\r\n");
        assert_eq!(
            Reply::err("unknown command 'nope'").to_bytes(),
            b"-ERR unknown command 'nope'\r\n"
        );
    }

    #[test]
    fn bulk_is_binary_safe() {
        let payload = b"a\r\nb\0c".to_vec();
        let encoded = Reply::Bulk(payload.clone()).to_bytes();
        assert_eq!(encoded, [b"$7\r\n".as_ref(), &payload, b"\r\n"].concat());
    }
}
