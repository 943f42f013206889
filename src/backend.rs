//! Per-backend connection handler.
//!
//! A handler owns one TCP connection and runs one batch at a time: every
//! request is written contiguously, flushed once, then replies are read in
//! FIFO order. Both protocols preserve request order on a connection, so no
//! correlation beyond position is needed. Any I/O error terminally closes
//! the handler; pipelined replies behind the error are unrecoverable.

use crate::{
    memcache::{self, McError, McReplyFlavor},
    message::{Cause, MsgBatch, Protocol, Reply, ReplyFlavor},
    metrics,
    resp::{self, RespError},
};
use bytes::BytesMut;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tokio_util::{
    codec::{Decoder, FramedRead},
    time::FutureExt,
};
use tracing::warn;

const READ_BUFFER_SIZE: usize = 128 * 1024; // bulk replies land in one syscall
const WRITE_BUFFER_SIZE: usize = 8 * 1024; // requests are short

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Resp(#[from] RespError),

    #[error(transparent)]
    Memcache(#[from] McError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("connection closed by backend")]
    ConnectionClosed,

    #[error("backend deadline exceeded")]
    Timeout,
}

fn cause_of(err: &BackendError) -> Cause {
    match err {
        BackendError::Timeout => Cause::Timeout,
        BackendError::Resp(RespError::Io(_)) | BackendError::Io(_) => Cause::Io,
        BackendError::Memcache(McError::Io(_)) => Cause::Io,
        BackendError::ConnectionClosed => Cause::Io,
        BackendError::Resp(_) | BackendError::Memcache(_) => Cause::BadReply,
    }
}

enum ReplyCodec {
    Redis(resp::ReplyDecoder),
    Memcache(memcache::ReplyDecoder),
}

impl ReplyCodec {
    fn new(proto: Protocol) -> Self {
        match proto {
            Protocol::Redis => Self::Redis(resp::ReplyDecoder::default()),
            Protocol::Memcache => Self::Memcache(memcache::ReplyDecoder::default()),
        }
    }
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = BackendError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            Self::Redis(decoder) => Ok(decoder.decode(src)?.map(|bytes| Reply {
                bytes,
                flavor: ReplyFlavor::Resp,
            })),
            Self::Memcache(decoder) => Ok(decoder.decode(src)?.map(|reply| Reply {
                bytes: reply.bytes,
                flavor: match reply.flavor {
                    McReplyFlavor::Values => ReplyFlavor::McValues,
                    McReplyFlavor::Miss => ReplyFlavor::McMiss,
                    McReplyFlavor::Line => ReplyFlavor::McLine,
                },
            })),
        }
    }
}

pub struct BackendHandler {
    cluster: String,
    node: String,
    reader: FramedRead<OwnedReadHalf, ReplyCodec>,
    writer: OwnedWriteHalf,
    wbuf: BytesMut,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    closed: bool,
}

impl BackendHandler {
    pub async fn connect(
        cluster: &str,
        node: &str,
        addr: &str,
        proto: Protocol,
        dial_timeout: Duration,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr)
            .timeout(dial_timeout)
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            cluster: cluster.to_owned(),
            node: node.to_owned(),
            reader: FramedRead::with_capacity(read_half, ReplyCodec::new(proto), READ_BUFFER_SIZE),
            writer: write_half,
            wbuf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
            read_timeout,
            write_timeout,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Runs one batch over the connection and settles it. The caller must
    /// not share the handler across concurrent calls; the pool hands out
    /// exclusive leases.
    pub async fn handle(&mut self, batch: &MsgBatch) {
        if self.closed {
            batch.done_with_error(&self.cluster, &self.node, Cause::Io);
            return;
        }
        if let Err(e) = self.write_requests(batch).await {
            warn!(node = %self.node, "failed to write batch: {e}");
            self.closed = true;
            batch.done_with_error(&self.cluster, &self.node, cause_of(&e));
            return;
        }
        if let Err((errored_at, e)) = self.read_replies(batch).await {
            warn!(node = %self.node, "failed to read reply: {e}");
            self.closed = true;
            let cause = cause_of(&e);
            for msg in &batch.msgs()[errored_at..] {
                msg.set_err(cause);
                metrics::err_incr(
                    &self.cluster,
                    &self.node,
                    msg.request().command(),
                    cause.as_str(),
                );
            }
        }
        batch.done();
    }

    async fn write_requests(&mut self, batch: &MsgBatch) -> Result<(), BackendError> {
        self.wbuf.clear();
        for msg in batch.msgs() {
            self.wbuf.extend_from_slice(msg.request().frame());
            if self.wbuf.len() >= WRITE_BUFFER_SIZE {
                self.flush().await?;
            }
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), BackendError> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        match self.write_timeout {
            Some(timeout) => self
                .writer
                .write_all_buf(&mut self.wbuf)
                .timeout(timeout)
                .await
                .map_err(|_| BackendError::Timeout)??,
            None => self.writer.write_all_buf(&mut self.wbuf).await?,
        }
        Ok(())
    }

    /// Reads one reply per message, in order. An error at position `i`
    /// loses replies `i..`.
    async fn read_replies(&mut self, batch: &MsgBatch) -> Result<(), (usize, BackendError)> {
        for (i, msg) in batch.msgs().iter().enumerate() {
            let reply = self.read_reply().await.map_err(|e| (i, e))?;
            if msg.request().is_mc_retrieval() {
                match reply.flavor {
                    ReplyFlavor::McValues => metrics::hit(&self.cluster, &self.node),
                    ReplyFlavor::McMiss => metrics::miss(&self.cluster, &self.node),
                    _ => {}
                }
            }
            if msg.set_reply(reply) {
                metrics::handle_time(
                    &self.cluster,
                    &self.node,
                    msg.request().command(),
                    msg.remote_us(),
                );
            }
        }
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply, BackendError> {
        let item = match self.read_timeout {
            Some(timeout) => self
                .reader
                .next()
                .timeout(timeout)
                .await
                .map_err(|_| BackendError::Timeout)?,
            None => self.reader.next().await,
        };
        item.ok_or(BackendError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        commands::{CmdKind, MergeKind},
        message::{Message, MsgBatchAllocator, Request},
        query,
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn get_msg(key: &str) -> Message {
        Message::new(Request::Redis {
            frame: query!("GET", key).freeze(),
            name: "GET",
            kind: CmdKind::Read,
            key: Bytes::copy_from_slice(key.as_bytes()),
            merge: MergeKind::None,
        })
    }

    fn batch_of(msgs: Vec<Message>) -> (MsgBatchAllocator, MsgBatch) {
        let mut mba = MsgBatchAllocator::new(Duration::from_secs(5));
        for msg in msgs {
            mba.add_msg("node", msg);
        }
        let (_, batch) = mba.fork_round().pop().unwrap();
        (mba, batch)
    }

    async fn connect(addr: std::net::SocketAddr, read_timeout: Duration) -> BackendHandler {
        BackendHandler::connect(
            "test",
            "node",
            &addr.to_string(),
            Protocol::Redis,
            Duration::from_secs(1),
            Some(read_timeout),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn replies_attach_in_fifo_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let expected =
                b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n*2\r\n$3\r\nGET\r\n$1\r\nc\r\n";
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; expected.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, expected);
            stream.write_all(b":1\r\n:2\r\n:3\r\n").await.unwrap();
        });

        let msgs = vec![get_msg("a"), get_msg("b"), get_msg("c")];
        let (_mba, batch) = batch_of(msgs.clone());
        let mut handler = connect(addr, Duration::from_secs(1)).await;
        handler.handle(&batch).await;
        server.await.unwrap();

        assert!(batch.is_done());
        assert!(!handler.is_closed());
        for (msg, expected) in msgs.iter().zip([&b":1\r\n"[..], b":2\r\n", b":3\r\n"]) {
            let (reply, err) = msg.take_outcome();
            assert_eq!(err, None);
            assert_eq!(reply.unwrap().bytes.as_ref(), expected);
        }
    }

    #[tokio::test]
    async fn error_mid_batch_fails_the_tail() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b":1\r\n").await.unwrap();
            // drop the connection with two replies owed
        });

        let msgs = vec![get_msg("a"), get_msg("b"), get_msg("c")];
        let (_mba, batch) = batch_of(msgs.clone());
        let mut handler = connect(addr, Duration::from_secs(1)).await;
        handler.handle(&batch).await;

        assert!(batch.is_done());
        assert!(handler.is_closed());
        let (reply, err) = msgs[0].take_outcome();
        assert_eq!(err, None);
        assert_eq!(reply.unwrap().bytes.as_ref(), b":1\r\n");
        for msg in &msgs[1..] {
            let (reply, err) = msg.take_outcome();
            assert!(reply.is_none());
            assert_eq!(err, Some(Cause::Io));
        }
    }

    #[tokio::test]
    async fn read_deadline_closes_the_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            // hold the reply until the client gives up
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let msgs = vec![get_msg("a")];
        let (_mba, batch) = batch_of(msgs.clone());
        let mut handler = connect(addr, Duration::from_millis(50)).await;
        handler.handle(&batch).await;

        assert!(handler.is_closed());
        let (reply, err) = msgs[0].take_outcome();
        assert!(reply.is_none());
        assert_eq!(err, Some(Cause::Timeout));
    }

    #[tokio::test]
    async fn closed_handler_rejects_batches() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let msgs = vec![get_msg("a")];
        let (_mba, batch) = batch_of(msgs.clone());
        let mut handler = connect(addr, Duration::from_secs(1)).await;
        handler.close();
        handler.handle(&batch).await;
        assert!(batch.is_done());
        let (_, err) = msgs[0].take_outcome();
        assert_eq!(err, Some(Cause::Io));
    }
}
