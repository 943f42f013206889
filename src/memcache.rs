//! Memcache text wire codec.
//!
//! Requests are parsed line-first: the command token decides whether a data
//! block follows. Retrieval replies are stored with the trailing `END\r\n`
//! stripped so that fanned-out multi-gets can be concatenated and terminated
//! once.

use crate::string::parse_int;
use bstr::ByteSlice;
use bytes::{Buf, Bytes, BytesMut};
use std::ops::Range;
use tokio_util::codec::Decoder;

const MAX_LINE: usize = 8 * 1024;
const MAX_DATA: usize = 8 * 1024 * 1024;
const CRLF: &[u8] = b"\r\n";

pub const END: &[u8] = b"END\r\n";

#[derive(Debug, thiserror::Error)]
pub enum McError {
    #[error("request line too long")]
    LineTooLong,

    #[error("malformed reply from backend")]
    BadReply,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McCommand {
    Get,
    Gets,
    Gat,
    Gats,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Incr,
    Decr,
    Delete,
    Touch,
    Quit,
}

impl McCommand {
    fn parse(token: &[u8]) -> Option<Self> {
        Some(match token {
            b"get" => Self::Get,
            b"gets" => Self::Gets,
            b"gat" => Self::Gat,
            b"gats" => Self::Gats,
            b"set" => Self::Set,
            b"add" => Self::Add,
            b"replace" => Self::Replace,
            b"append" => Self::Append,
            b"prepend" => Self::Prepend,
            b"cas" => Self::Cas,
            b"incr" => Self::Incr,
            b"decr" => Self::Decr,
            b"delete" => Self::Delete,
            b"touch" => Self::Touch,
            b"quit" => Self::Quit,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Gets => "gets",
            Self::Gat => "gat",
            Self::Gats => "gats",
            Self::Set => "set",
            Self::Add => "add",
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Cas => "cas",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::Delete => "delete",
            Self::Touch => "touch",
            Self::Quit => "quit",
        }
    }

    /// get/gets/gat/gats: multi-key, VALUE..END replies.
    pub const fn is_retrieval(self) -> bool {
        matches!(self, Self::Get | Self::Gets | Self::Gat | Self::Gats)
    }

    /// gat/gats put the expiry before the key list.
    pub const fn has_leading_expiry(self) -> bool {
        matches!(self, Self::Gat | Self::Gats)
    }

    const fn is_storage(self) -> bool {
        matches!(
            self,
            Self::Set | Self::Add | Self::Replace | Self::Append | Self::Prepend | Self::Cas
        )
    }
}

/// One decoded client request line (plus data block for storage commands).
#[derive(Debug)]
pub struct McQuery {
    pub cmd: McCommand,
    pub keys: Vec<Bytes>,
    pub expiry: Option<Bytes>,
    pub frame: Bytes,
}

/// Decoder output: either a well-formed query or a framable garbage line the
/// session answers with `CLIENT_ERROR` without dropping the connection.
#[derive(Debug)]
pub enum McFrame {
    Query(McQuery),
    Bad,
}

#[derive(Default)]
pub struct RequestDecoder;

impl Decoder for RequestDecoder {
    type Item = McFrame;
    type Error = McError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(nl) = src.find_byte(b'\n') else {
            if src.len() > MAX_LINE {
                return Err(McError::LineTooLong);
            }
            return Ok(None);
        };
        let line_len = nl + 1;
        if line_len < CRLF.len() || src[nl - 1] != b'\r' {
            src.advance(line_len);
            return Ok(Some(McFrame::Bad));
        }

        let Some(fields) = split_fields(&src[..line_len - CRLF.len()]) else {
            src.advance(line_len);
            return Ok(Some(McFrame::Bad));
        };
        let Some(cmd) = fields.first().and_then(|f| McCommand::parse(&src[f.clone()])) else {
            src.advance(line_len);
            return Ok(Some(McFrame::Bad));
        };

        if cmd.is_storage() {
            let num_fields = if cmd == McCommand::Cas { 6 } else { 5 };
            if fields.len() != num_fields {
                src.advance(line_len);
                return Ok(Some(McFrame::Bad));
            }
            let Some(data_len) = parse_int::<usize>(&src[fields[4].clone()]) else {
                src.advance(line_len);
                return Ok(Some(McFrame::Bad));
            };
            if data_len > MAX_DATA {
                src.advance(line_len);
                return Ok(Some(McFrame::Bad));
            }
            let total = line_len + data_len + CRLF.len();
            if total > src.len() {
                src.reserve(total - src.len());
                return Ok(None);
            }
            if &src[total - CRLF.len()..total] != CRLF {
                src.advance(total);
                return Ok(Some(McFrame::Bad));
            }
            let key = fields[1].clone();
            let frame = src.split_to(total).freeze();
            return Ok(Some(McFrame::Query(McQuery {
                cmd,
                keys: vec![frame.slice(key)],
                expiry: None,
                frame,
            })));
        }

        let expected = match cmd {
            McCommand::Quit => 1..=1,
            McCommand::Delete => 2..=2,
            McCommand::Incr | McCommand::Decr | McCommand::Touch => 3..=3,
            _ if cmd.has_leading_expiry() => 3..=usize::MAX,
            _ => 2..=usize::MAX, // get/gets
        };
        if !expected.contains(&fields.len()) {
            src.advance(line_len);
            return Ok(Some(McFrame::Bad));
        }

        let first_key = if cmd.has_leading_expiry() { 2 } else { 1 };
        let key_fields = match cmd {
            McCommand::Quit => Vec::new(),
            _ if cmd.is_retrieval() => fields[first_key..].to_vec(),
            _ => vec![fields[1].clone()],
        };
        let expiry_field = cmd.has_leading_expiry().then(|| fields[1].clone());
        let frame = src.split_to(line_len).freeze();
        Ok(Some(McFrame::Query(McQuery {
            cmd,
            keys: key_fields.into_iter().map(|f| frame.slice(f)).collect(),
            expiry: expiry_field.map(|f| frame.slice(f)),
            frame,
        })))
    }
}

/// Splits a command line into space-separated field ranges. Empty fields
/// (doubled spaces) are malformed.
fn split_fields(line: &[u8]) -> Option<Vec<Range<usize>>> {
    if line.is_empty() {
        return None;
    }
    let mut fields = Vec::new();
    let mut start = 0;
    for (i, &byte) in line.iter().enumerate() {
        if byte == b' ' {
            if i == start {
                return None;
            }
            fields.push(start..i);
            start = i + 1;
        }
    }
    if start == line.len() {
        return None;
    }
    fields.push(start..line.len());
    Some(fields)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McReplyFlavor {
    /// One or more `VALUE` blocks, terminator stripped.
    Values,
    /// A retrieval reply that was just `END`.
    Miss,
    /// Any single-line reply (`STORED`, `DELETED`, counters, errors, ...).
    Line,
}

#[derive(Debug)]
pub struct McReply {
    pub bytes: BytesMut,
    pub flavor: McReplyFlavor,
}

/// Decodes backend replies without knowing the request: a reply is either
/// `END`, a run of `VALUE` blocks up to `END`, or a single line.
#[derive(Default)]
pub struct ReplyDecoder {
    values: BytesMut,
}

impl Decoder for ReplyDecoder {
    type Item = McReply;
    type Error = McError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(nl) = src.find_byte(b'\n') else {
                if src.len() > MAX_LINE {
                    return Err(McError::BadReply);
                }
                return Ok(None);
            };
            let line_len = nl + 1;
            if line_len < CRLF.len() || src[nl - 1] != b'\r' {
                return Err(McError::BadReply);
            }

            if &src[..line_len] == END {
                let reply = if self.values.is_empty() {
                    McReply {
                        bytes: BytesMut::new(),
                        flavor: McReplyFlavor::Miss,
                    }
                } else {
                    McReply {
                        bytes: self.values.split(),
                        flavor: McReplyFlavor::Values,
                    }
                };
                src.advance(line_len);
                return Ok(Some(reply));
            }

            if src[..line_len].starts_with(b"VALUE ") {
                let fields =
                    split_fields(&src[..line_len - CRLF.len()]).ok_or(McError::BadReply)?;
                if !(4..=5).contains(&fields.len()) {
                    return Err(McError::BadReply);
                }
                let data_len =
                    parse_int::<usize>(&src[fields[3].clone()]).ok_or(McError::BadReply)?;
                if data_len > MAX_DATA {
                    return Err(McError::BadReply);
                }
                let total = line_len + data_len + CRLF.len();
                if total > src.len() {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                if &src[total - CRLF.len()..total] != CRLF {
                    return Err(McError::BadReply);
                }
                self.values.unsplit(src.split_to(total));
                continue;
            }

            if !self.values.is_empty() {
                return Err(McError::BadReply);
            }
            return Ok(Some(McReply {
                bytes: src.split_to(line_len),
                flavor: McReplyFlavor::Line,
            }));
        }
    }
}

pub fn is_error_line(line: &[u8]) -> bool {
    line.starts_with(b"ERROR")
        || line.starts_with(b"CLIENT_ERROR")
        || line.starts_with(b"SERVER_ERROR")
}

/// Builds the per-key wire frame for one leg of a fanned-out retrieval.
pub fn sub_request_frame(cmd: McCommand, expiry: Option<&[u8]>, key: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(
        cmd.as_str().len() + expiry.map_or(0, |e| e.len() + 1) + key.len() + 3,
    );
    frame.extend_from_slice(cmd.as_str().as_bytes());
    if let Some(expiry) = expiry {
        frame.extend_from_slice(b" ");
        frame.extend_from_slice(expiry);
    }
    frame.extend_from_slice(b" ");
    frame.extend_from_slice(key);
    frame.extend_from_slice(CRLF);
    frame.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_request(input: &[u8]) -> Option<McFrame> {
        let mut src = BytesMut::from(input);
        RequestDecoder.decode(&mut src).unwrap()
    }

    fn decode_query(input: &[u8]) -> McQuery {
        match decode_request(input) {
            Some(McFrame::Query(query)) => query,
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn parse_multi_get() {
        let query = decode_query(b"get a bb ccc\r\n");
        assert_eq!(query.cmd, McCommand::Get);
        assert_eq!(query.keys.len(), 3);
        assert_eq!(query.keys[1].as_ref(), b"bb");
        assert_eq!(query.frame.as_ref(), b"get a bb ccc\r\n");
        assert!(query.expiry.is_none());
    }

    #[test]
    fn parse_gat_with_expiry() {
        let query = decode_query(b"gats 300 a b\r\n");
        assert_eq!(query.cmd, McCommand::Gats);
        assert_eq!(query.expiry.as_deref(), Some(b"300".as_ref()));
        assert_eq!(query.keys.len(), 2);
        assert_eq!(query.keys[0].as_ref(), b"a");
    }

    #[test]
    fn parse_storage_with_binary_body() {
        let query = decode_query(b"set k 0 0 6\r\nab\r\ncd\r\n");
        assert_eq!(query.cmd, McCommand::Set);
        assert_eq!(query.keys[0].as_ref(), b"k");
        assert_eq!(query.frame.as_ref(), b"set k 0 0 6\r\nab\r\ncd\r\n");
    }

    #[test]
    fn parse_cas() {
        let query = decode_query(b"cas k 0 0 3 77\r\nabc\r\n");
        assert_eq!(query.cmd, McCommand::Cas);
        assert_eq!(query.frame.as_ref(), b"cas k 0 0 3 77\r\nabc\r\n");
    }

    #[test]
    fn storage_waits_for_body() {
        let mut src = BytesMut::from(&b"set k 0 0 10\r\nabc"[..]);
        assert!(RequestDecoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"defghij\r\n");
        let McFrame::Query(query) = RequestDecoder.decode(&mut src).unwrap().unwrap() else {
            panic!("expected query");
        };
        assert_eq!(query.frame.as_ref(), b"set k 0 0 10\r\nabcdefghij\r\n");
    }

    #[test]
    fn bad_lines_are_framable() {
        assert!(matches!(decode_request(b"gimme a\r\n"), Some(McFrame::Bad)));
        assert!(matches!(decode_request(b"get\r\n"), Some(McFrame::Bad)));
        assert!(matches!(decode_request(b"get  a\r\n"), Some(McFrame::Bad)));
        assert!(matches!(
            decode_request(b"set k 0 0\r\n"),
            Some(McFrame::Bad)
        ));
        assert!(matches!(decode_request(b"delete a b\r\n"), Some(McFrame::Bad)));
    }

    #[test]
    fn bad_line_keeps_stream_aligned() {
        let mut src = BytesMut::from(&b"bogus\r\nget a\r\n"[..]);
        assert!(matches!(
            RequestDecoder.decode(&mut src).unwrap(),
            Some(McFrame::Bad)
        ));
        let McFrame::Query(query) = RequestDecoder.decode(&mut src).unwrap().unwrap() else {
            panic!("expected query");
        };
        assert_eq!(query.keys[0].as_ref(), b"a");
    }

    fn decode_reply(input: &[u8]) -> McReply {
        let mut src = BytesMut::from(input);
        ReplyDecoder::default().decode(&mut src).unwrap().unwrap()
    }

    #[test]
    fn reply_miss() {
        let reply = decode_reply(b"END\r\n");
        assert_eq!(reply.flavor, McReplyFlavor::Miss);
        assert!(reply.bytes.is_empty());
    }

    #[test]
    fn reply_values_strip_terminator() {
        let reply = decode_reply(b"VALUE a 0 3\r\naaa\r\nVALUE b 0 2 9\r\nbb\r\nEND\r\n");
        assert_eq!(reply.flavor, McReplyFlavor::Values);
        assert_eq!(
            reply.bytes.as_ref(),
            b"VALUE a 0 3\r\naaa\r\nVALUE b 0 2 9\r\nbb\r\n"
        );
    }

    #[test]
    fn reply_single_line() {
        let reply = decode_reply(b"STORED\r\n");
        assert_eq!(reply.flavor, McReplyFlavor::Line);
        assert_eq!(reply.bytes.as_ref(), b"STORED\r\n");

        let reply = decode_reply(b"5\r\n");
        assert_eq!(reply.flavor, McReplyFlavor::Line);
    }

    #[test]
    fn reply_value_body_with_crlf() {
        let reply = decode_reply(b"VALUE k 0 4\r\na\r\nb\r\nEND\r\n");
        assert_eq!(reply.bytes.as_ref(), b"VALUE k 0 4\r\na\r\nb\r\n");
    }

    #[test]
    fn reply_waits_for_end() {
        let mut decoder = ReplyDecoder::default();
        let mut src = BytesMut::from(&b"VALUE a 0 3\r\naaa\r\n"[..]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"END\r\n");
        let reply = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(reply.flavor, McReplyFlavor::Values);
        assert_eq!(reply.bytes.as_ref(), b"VALUE a 0 3\r\naaa\r\n");
    }

    #[test]
    fn error_lines() {
        assert!(is_error_line(b"SERVER_ERROR out of memory\r\n"));
        assert!(is_error_line(b"CLIENT_ERROR bad data chunk\r\n"));
        assert!(is_error_line(b"ERROR\r\n"));
        assert!(!is_error_line(b"STORED\r\n"));
    }

    #[test]
    fn sub_frames() {
        assert_eq!(
            sub_request_frame(McCommand::Get, None, b"k1").as_ref(),
            b"get k1\r\n"
        );
        assert_eq!(
            sub_request_frame(McCommand::Gat, Some(b"60"), b"k1").as_ref(),
            b"gat 60 k1\r\n"
        );
    }
}
