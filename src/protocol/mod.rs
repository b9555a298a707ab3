// # Reply Encoding
//
// The reply surface handed back to the RESP session layer, with exact
// RESP2 byte rendering. RESP3-only shapes (double, map, set) are carried
// in the enum and down-converted when rendered as RESP2.

use crate::error::FerriteError;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Bulk(Vec<u8>),
    Integer(i64),
    Array(Vec<Reply>),
    Error(String),
    /// Nil bulk string (`$-1`).
    Nil,
    /// Nil array (`*-1`), e.g. an aborted EXEC.
    NilArray,
    Double(f64),
    Map(Vec<(Reply, Reply)>),
    Set(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn queued() -> Self {
        Reply::Simple("QUEUED".to_string())
    }

    pub fn from_error(err: &FerriteError) -> Self {
        Reply::Error(err.to_resp_message())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Append the RESP2 encoding of this reply to `out`.
    pub fn write_resp2(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::NilArray => out.extend_from_slice(b"*-1\r\n"),
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.write_resp2(out);
                }
            }
            // RESP2 renders a double as its bulk-string form.
            Reply::Double(value) => {
                Reply::Bulk(format_double(*value).into_bytes()).write_resp2(out)
            }
            // Maps flatten to alternating key/value arrays in RESP2.
            Reply::Map(pairs) => {
                out.push(b'*');
                out.extend_from_slice((pairs.len() * 2).to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for (key, value) in pairs {
                    key.write_resp2(out);
                    value.write_resp2(out);
                }
            }
            Reply::Set(items) => Reply::Array(items.clone()).write_resp2(out),
        }
    }

    pub fn to_resp2_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_resp2(&mut out);
        out
    }
}

/// Redis-style float rendering: integral values lose the fraction.
fn format_double(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e17 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_string_encoding_is_exact() {
        assert_eq!(Reply::Bulk(b"bar".to_vec()).to_resp2_bytes(), b"$3\r\nbar\r\n");
        assert_eq!(Reply::Nil.to_resp2_bytes(), b"$-1\r\n");
    }

    #[test]
    fn simple_and_error_lines() {
        assert_eq!(Reply::ok().to_resp2_bytes(), b"+OK\r\n");
        assert_eq!(
            Reply::Error("MOVED 7638 10.0.0.3:7002".into()).to_resp2_bytes(),
            b"-MOVED 7638 10.0.0.3:7002\r\n"
        );
    }

    #[test]
    fn arrays_nest() {
        let reply = Reply::Array(vec![Reply::Integer(1), Reply::Bulk(b"x".to_vec())]);
        assert_eq!(reply.to_resp2_bytes(), b"*2\r\n:1\r\n$1\r\nx\r\n");
        assert_eq!(Reply::NilArray.to_resp2_bytes(), b"*-1\r\n");
    }

    #[test]
    fn resp3_shapes_downconvert() {
        assert_eq!(Reply::Double(2.0).to_resp2_bytes(), b"$1\r\n2\r\n");
        let map = Reply::Map(vec![(Reply::Bulk(b"k".to_vec()), Reply::Integer(5))]);
        assert_eq!(map.to_resp2_bytes(), b"*2\r\n$1\r\nk\r\n:5\r\n");
    }
}
