//! RESP wire codec: client request decoding, backend reply decoding, and
//! reply merging for fanned-out multi-key commands.

use crate::string::parse_int;
use bstr::ByteSlice;
use bytes::{BufMut, Bytes, BytesMut};
use std::{io::Write, num::NonZeroUsize, ops::Range};
use tokio_util::codec::Decoder;

const PROTO_MAX_HEADER: usize = 64 * 1024;
const CRLF: &[u8] = b"\r\n";
const OK: &[u8] = b"OK";

#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("inline commands are not supported (got '{}')", char::from(*.0))]
    InlineRequest(u8),

    #[error("too big mbulk count string")]
    TooBigMultibulkCountString,

    #[error("invalid multibulk length")]
    InvalidMultibulkLen,

    #[error("too big bulk count string")]
    TooBigBulkCountString,

    #[error("expected '{}', got '{}'", char::from(*.expected), char::from(*.got))]
    UnexpectedChar { expected: u8, got: u8 },

    #[error("invalid bulk length")]
    InvalidBulkLen,

    #[error("unknown RESP type: '{}'", char::from(*.0))]
    UnknownReplyType(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded client command: the raw frame to forward and the bulk-string
/// arguments sliced out of it.
#[derive(Debug)]
pub struct RedisQuery {
    pub frame: Bytes,
    pub args: Vec<Bytes>,
}

/// Decodes client requests. Only multibulk arrays of bulk strings are
/// accepted; inline commands are rejected.
pub struct QueryDecoder {
    bytes: BytesMut,
    num_args: Option<NonZeroUsize>,
    args: Vec<Range<usize>>,
    max_bulk_len: usize,
}

impl QueryDecoder {
    pub fn new(max_bulk_len: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            num_args: None,
            args: Vec::new(),
            max_bulk_len,
        }
    }
}

impl Decoder for QueryDecoder {
    type Item = RedisQuery;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let result = match src.first() {
            None => Ok(None),
            _ if self.num_args.is_some() => self.decode_multibulk(src),
            Some(b'*') => {
                debug_assert!(self.bytes.is_empty());
                self.args.clear();
                self.decode_multibulk(src)
            }
            Some(&ch) => Err(RespError::InlineRequest(ch)),
        };
        if result.is_err() {
            self.args.clear();
        }
        result
    }
}

impl QueryDecoder {
    fn decode_multibulk(&mut self, src: &mut BytesMut) -> Result<Option<RedisQuery>, RespError> {
        let num_args = match self.num_args {
            None => {
                let [b'*', rest @ ..] = src.as_ref() else {
                    unreachable!()
                };
                let header = match extract_line(rest) {
                    Some(header) => header,
                    None if src.len() > PROTO_MAX_HEADER => {
                        return Err(RespError::TooBigMultibulkCountString);
                    }
                    None => return Ok(None),
                };
                let len: i32 = parse_int(header).ok_or(RespError::InvalidMultibulkLen)?;
                let consumed = src.split_to(1 + header.len() + CRLF.len());
                if len <= 0 {
                    return Ok(Some(RedisQuery {
                        frame: consumed.freeze(),
                        args: Vec::new(),
                    }));
                }
                self.bytes.unsplit(consumed);

                let num_args = NonZeroUsize::new(len as usize).unwrap();
                self.num_args = Some(num_args);
                num_args
            }
            Some(num_args) => num_args,
        };

        while self.args.len() < num_args.get() {
            let Some((ch, rest)) = src.split_first() else {
                return Ok(None);
            };
            let header = match extract_line(rest) {
                Some(header) if *ch == b'$' => header,
                Some(_) => {
                    return Err(RespError::UnexpectedChar {
                        expected: b'$',
                        got: *ch,
                    });
                }
                None if src.len() > PROTO_MAX_HEADER => {
                    return Err(RespError::TooBigBulkCountString);
                }
                None => return Ok(None),
            };
            let len = parse_int::<u32>(header).ok_or(RespError::InvalidBulkLen)? as usize;
            if len > self.max_bulk_len {
                return Err(RespError::InvalidBulkLen);
            }
            let header_end = 1 + header.len() + CRLF.len();
            let frame_end = header_end + len + CRLF.len();
            if frame_end > src.len() {
                src.reserve(frame_end - src.len());
                return Ok(None);
            }
            let start = self.bytes.len() + header_end;
            self.args.push(start..start + len);
            self.bytes.unsplit(src.split_to(frame_end));
        }

        self.num_args = None;
        let frame = self.bytes.split().freeze();
        let args = self.args.drain(..).map(|r| frame.slice(r)).collect();
        Ok(Some(RedisQuery { frame, args }))
    }
}

/// Decodes one complete backend reply, however deeply nested, into its raw
/// wire bytes.
#[derive(Default)]
pub struct ReplyDecoder {
    remaining: Vec<usize>,
    acc: BytesMut,
}

impl Decoder for ReplyDecoder {
    type Item = BytesMut;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let node = match src.as_ref() {
                [] => return Ok(None),
                [b'+' | b'-' | b':', rest @ ..] => {
                    let Some(line) = extract_line(rest) else {
                        return Ok(None);
                    };
                    src.split_to(1 + line.len() + CRLF.len())
                }
                [b'$', rest @ ..] => {
                    let Some(header) = extract_line(rest) else {
                        return Ok(None);
                    };
                    let len: i32 = parse_int(header).ok_or(RespError::InvalidBulkLen)?;
                    let header_end = 1 + header.len() + CRLF.len();
                    if len < 0 {
                        src.split_to(header_end)
                    } else {
                        let end = header_end + len as usize + CRLF.len();
                        if end > src.len() {
                            src.reserve(end - src.len());
                            return Ok(None);
                        }
                        src.split_to(end)
                    }
                }
                [b'*', rest @ ..] => {
                    let Some(header) = extract_line(rest) else {
                        return Ok(None);
                    };
                    let len: i32 = parse_int(header).ok_or(RespError::InvalidMultibulkLen)?;
                    let bytes = src.split_to(1 + header.len() + CRLF.len());
                    if len > 0 {
                        self.remaining.push(len as usize);
                        self.acc.unsplit(bytes);
                        continue;
                    }
                    bytes
                }
                [ch, ..] => return Err(RespError::UnknownReplyType(*ch)),
            };
            if self.remaining.is_empty() {
                return Ok(Some(node));
            }
            self.acc.unsplit(node);
            while let Some(last) = self.remaining.last_mut() {
                *last -= 1;
                if *last > 0 {
                    break;
                }
                self.remaining.pop();
            }
            if self.remaining.is_empty() {
                return Ok(Some(self.acc.split()));
            }
        }
    }
}

fn extract_line(bytes: &[u8]) -> Option<&[u8]> {
    match bytes.find_byte(b'\r') {
        Some(end) if end + 1 < bytes.len() => Some(&bytes[..end]), // room for the trailing \n
        _ => None,
    }
}

pub fn is_error_reply(reply: &[u8]) -> bool {
    reply.first() == Some(&b'-')
}

pub fn is_ok_reply(reply: &[u8]) -> bool {
    let [b'+', rest @ ..] = reply else {
        return false;
    };
    extract_line(rest) == Some(OK)
}

pub fn integer_reply(reply: &[u8]) -> Option<i64> {
    let [b':', rest @ ..] = reply else {
        return None;
    };
    parse_int(extract_line(rest)?)
}

/// Combines `GET` sub-replies back into one `MGET` array, key order
/// preserved, nulls propagated.
pub fn merge_join(out: &mut BytesMut, subs: &[BytesMut]) {
    out.write_array(subs.len());
    for sub in subs {
        out.extend_from_slice(sub);
    }
}

/// Sums integer sub-replies (`DEL`, `EXISTS`). The first error in key order
/// wins; otherwise the first non-integer sub-reply is passed through as the
/// merged result.
pub fn merge_count(out: &mut BytesMut, subs: &[BytesMut]) {
    if let Some(err) = subs.iter().find(|sub| is_error_reply(sub)) {
        out.extend_from_slice(err);
        return;
    }
    let mut sum = 0i64;
    for sub in subs {
        match integer_reply(sub) {
            Some(n) => sum = sum.wrapping_add(n),
            None => {
                out.extend_from_slice(sub);
                return;
            }
        }
    }
    out.write_integer(sum);
}

/// `+OK` iff every sub-reply is `+OK` (`MSET`); otherwise the first error in
/// key order, or the first non-OK reply.
pub fn merge_ok(out: &mut BytesMut, subs: &[BytesMut]) {
    if let Some(err) = subs.iter().find(|sub| is_error_reply(sub)) {
        out.extend_from_slice(err);
        return;
    }
    match subs.iter().find(|sub| !is_ok_reply(sub)) {
        Some(other) => out.extend_from_slice(other),
        None => out.write_ok(),
    }
}

pub trait WriteResp {
    fn write_simple<B: AsRef<[u8]>>(&mut self, value: B);
    fn write_integer<I: itoa::Integer>(&mut self, value: I);
    fn write_bulk<B: AsRef<[u8]>>(&mut self, data: B);
    fn write_array(&mut self, len: usize);
    fn write_error<B: AsRef<[u8]>>(&mut self, error: B);
    fn write_null(&mut self);
    fn write_fmt(&mut self, args: std::fmt::Arguments);

    fn write_ok(&mut self) {
        self.write_simple(OK);
    }
}

impl WriteResp for BytesMut {
    fn write_simple<B: AsRef<[u8]>>(&mut self, value: B) {
        let value = value.as_ref();
        self.reserve(1 + value.len() + CRLF.len());
        self.put_u8(b'+');
        self.put_slice(value);
        self.put_slice(CRLF);
    }

    fn write_integer<I: itoa::Integer>(&mut self, value: I) {
        write_integer_with_prefix(b':', value, self);
    }

    fn write_bulk<B: AsRef<[u8]>>(&mut self, data: B) {
        let data = data.as_ref();
        let mut itoa_buf = itoa::Buffer::new();
        let len_bytes = itoa_buf.format(data.len()).as_bytes();
        self.reserve(1 + len_bytes.len() + CRLF.len() + data.len() + CRLF.len());
        self.put_u8(b'$');
        self.put_slice(len_bytes);
        self.put_slice(CRLF);
        self.put_slice(data);
        self.put_slice(CRLF);
    }

    fn write_array(&mut self, len: usize) {
        write_integer_with_prefix(b'*', len, self);
    }

    fn write_error<B: AsRef<[u8]>>(&mut self, error: B) {
        let error = error.as_ref();
        debug_assert!(error.starts_with_str("-"));
        self.reserve(error.len() + CRLF.len());
        for &byte in error {
            if byte == b'\r' || byte == b'\n' {
                self.put_u8(b' ');
            } else {
                self.put_u8(byte);
            }
        }
        self.put_slice(CRLF);
    }

    fn write_null(&mut self) {
        const NULL: &[u8] = b"$-1";
        self.reserve(NULL.len() + CRLF.len());
        self.put_slice(NULL);
        self.put_slice(CRLF);
    }

    fn write_fmt(&mut self, args: std::fmt::Arguments) {
        self.writer().write_fmt(args).unwrap();
        self.put_slice(CRLF);
    }
}

fn write_integer_with_prefix<I: itoa::Integer>(prefix: u8, value: I, out: &mut BytesMut) {
    let mut itoa_buf = itoa::Buffer::new();
    let len_bytes = itoa_buf.format(value).as_bytes();
    out.reserve(1 + len_bytes.len() + CRLF.len());
    out.put_u8(prefix);
    out.put_slice(len_bytes);
    out.put_slice(CRLF);
}

#[macro_export]
macro_rules! count {
    () => (0usize);
    ($x:tt $($xs:tt)*) => (1usize + $crate::count!($($xs)*));
}

#[macro_export]
macro_rules! write_query {
    ($buf:expr, $($arg:expr),* $(,)?) => {{
        use $crate::resp::WriteResp;

        $buf.write_array($crate::count!($($arg)*));
        $($buf.write_bulk($arg);)*
    }}
}

#[macro_export]
macro_rules! query {
    ($($arg:expr),* $(,)?) => {{
        let mut query = $crate::bytes::BytesMut::new();
        $crate::write_query!(query, $($arg),*);
        query
    }}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut QueryDecoder, input: &[u8]) -> Vec<RedisQuery> {
        let mut src = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(query) = decoder.decode(&mut src).unwrap() {
            out.push(query);
        }
        out
    }

    #[test]
    fn decode_query() {
        let mut decoder = QueryDecoder::new(1024);
        let queries = decode_all(&mut decoder, b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n");
        assert_eq!(queries.len(), 1);
        let query = &queries[0];
        assert_eq!(
            query.frame.as_ref(),
            b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n"
        );
        assert_eq!(query.args.len(), 3);
        assert_eq!(query.args[0].as_ref(), b"MGET");
        assert_eq!(query.args[1].as_ref(), b"a");
        assert_eq!(query.args[2].as_ref(), b"b");
    }

    #[test]
    fn decode_query_incrementally() {
        let mut decoder = QueryDecoder::new(1024);
        let full = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let mut src = BytesMut::new();
        for &byte in &full[..full.len() - 1] {
            src.put_u8(byte);
            assert!(decoder.decode(&mut src).unwrap().is_none());
        }
        src.put_u8(full[full.len() - 1]);
        let query = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(query.frame.as_ref(), full.as_ref());
        assert_eq!(query.args[1].as_ref(), b"foo");
    }

    #[test]
    fn decode_pipelined_queries() {
        let mut decoder = QueryDecoder::new(1024);
        let queries = decode_all(
            &mut decoder,
            b"*1\r\n$4\r\nPING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
        );
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].args[0].as_ref(), b"PING");
        assert_eq!(queries[1].args[1].as_ref(), b"k");
    }

    #[test]
    fn reject_inline_query() {
        let mut decoder = QueryDecoder::new(1024);
        let mut src = BytesMut::from(&b"PING\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(RespError::InlineRequest(b'P'))
        ));
    }

    #[test]
    fn reject_oversized_bulk() {
        let mut decoder = QueryDecoder::new(4);
        let mut src = BytesMut::from(&b"*2\r\n$3\r\nSET\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(RespError::InvalidBulkLen)
        ));
    }

    fn decode_reply(input: &[u8]) -> BytesMut {
        let mut decoder = ReplyDecoder::default();
        let mut src = BytesMut::from(input);
        decoder.decode(&mut src).unwrap().unwrap()
    }

    #[test]
    fn decode_scalar_replies() {
        assert_eq!(decode_reply(b"+OK\r\n").as_ref(), b"+OK\r\n");
        assert_eq!(decode_reply(b":42\r\n").as_ref(), b":42\r\n");
        assert_eq!(decode_reply(b"$3\r\nfoo\r\n").as_ref(), b"$3\r\nfoo\r\n");
        assert_eq!(decode_reply(b"$-1\r\n").as_ref(), b"$-1\r\n");
        assert_eq!(decode_reply(b"*0\r\n").as_ref(), b"*0\r\n");
    }

    #[test]
    fn decode_nested_array_reply() {
        let wire = b"*2\r\n*2\r\n$1\r\na\r\n:1\r\n$1\r\nb\r\n";
        assert_eq!(decode_reply(wire).as_ref(), wire.as_ref());
    }

    #[test]
    fn decode_reply_needs_more_data() {
        let mut decoder = ReplyDecoder::default();
        let mut src = BytesMut::from(&b"*2\r\n$3\r\nfoo\r\n"[..]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.put_slice(b"$-1\r\n");
        assert_eq!(
            decoder.decode(&mut src).unwrap().unwrap().as_ref(),
            b"*2\r\n$3\r\nfoo\r\n$-1\r\n"
        );
    }

    #[test]
    fn merge_join_preserves_order_and_nulls() {
        let subs = [
            BytesMut::from(&b"$3\r\nfoo\r\n"[..]),
            BytesMut::from(&b"$-1\r\n"[..]),
        ];
        let mut out = BytesMut::new();
        merge_join(&mut out, &subs);
        assert_eq!(out.as_ref(), b"*2\r\n$3\r\nfoo\r\n$-1\r\n");
    }

    #[test]
    fn merge_count_sums_integers() {
        let subs = [
            BytesMut::from(&b":1\r\n"[..]),
            BytesMut::from(&b":0\r\n"[..]),
            BytesMut::from(&b":1\r\n"[..]),
        ];
        let mut out = BytesMut::new();
        merge_count(&mut out, &subs);
        assert_eq!(out.as_ref(), b":2\r\n");
    }

    #[test]
    fn merge_count_propagates_first_error() {
        let subs = [
            BytesMut::from(&b":1\r\n"[..]),
            BytesMut::from(&b"-ERR broken\r\n"[..]),
            BytesMut::from(&b"-ERR later\r\n"[..]),
        ];
        let mut out = BytesMut::new();
        merge_count(&mut out, &subs);
        assert_eq!(out.as_ref(), b"-ERR broken\r\n");
    }

    #[test]
    fn merge_count_passes_through_non_integer() {
        let subs = [
            BytesMut::from(&b":1\r\n"[..]),
            BytesMut::from(&b"$2\r\nhm\r\n"[..]),
            BytesMut::from(&b":1\r\n"[..]),
        ];
        let mut out = BytesMut::new();
        merge_count(&mut out, &subs);
        assert_eq!(out.as_ref(), b"$2\r\nhm\r\n");

        // an error anywhere still beats an earlier non-integer reply
        let subs = [
            BytesMut::from(&b"$2\r\nhm\r\n"[..]),
            BytesMut::from(&b"-ERR broken\r\n"[..]),
        ];
        let mut out = BytesMut::new();
        merge_count(&mut out, &subs);
        assert_eq!(out.as_ref(), b"-ERR broken\r\n");
    }

    #[test]
    fn merge_ok_requires_all_ok() {
        let ok = BytesMut::from(&b"+OK\r\n"[..]);
        let mut out = BytesMut::new();
        merge_ok(&mut out, &[ok.clone(), ok.clone()]);
        assert_eq!(out.as_ref(), b"+OK\r\n");

        let mut out = BytesMut::new();
        merge_ok(
            &mut out,
            &[ok.clone(), BytesMut::from(&b"-ERR wrong\r\n"[..]), ok],
        );
        assert_eq!(out.as_ref(), b"-ERR wrong\r\n");
    }

    #[test]
    fn write_error_scrubs_newlines() {
        let mut out = BytesMut::new();
        out.write_error(b"-ERR bad\r\nthing");
        assert_eq!(out.as_ref(), b"-ERR bad  thing\r\n");
    }
}
