//! Per-client session: decode a pipeline slot, fan out multi-key commands,
//! dispatch per backend, then write replies back in client order.

use crate::{
    commands::{self, CmdKind, CmdSpec, MergeKind},
    memcache::{self, McCommand, McError, McFrame},
    message::{Cause, Message, MsgBatchAllocator, Protocol, Reply, ReplyFlavor, Request, WaitError},
    net::IntoSplit,
    proxy::Cluster,
    resp::{self, QueryDecoder, RedisQuery, RespError, WriteResp},
    write_query,
};
use bytes::BytesMut;
use futures_util::{FutureExt, StreamExt};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};

const PROTO_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Serves one client connection until it closes, a fatal decode error
/// occurs, or the proxy shuts down.
pub async fn run<S: IntoSplit>(cluster: Arc<Cluster>, stream: S, shutdown: CancellationToken) {
    match cluster.proto {
        Protocol::Redis => run_redis(cluster, stream, shutdown).await,
        Protocol::Memcache => run_memcache(cluster, stream, shutdown).await,
    }
}

enum RedisCmd {
    /// Locally answered; the reply is already encoded.
    Done(BytesMut),
    Forward(Message),
    Fanout { merge: MergeKind, subs: Vec<Message> },
    Quit,
}

async fn run_redis<S: IntoSplit>(cluster: Arc<Cluster>, stream: S, shutdown: CancellationToken) {
    let (read_half, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(read_half, QueryDecoder::new(PROTO_MAX_BULK_LEN));
    let mut mba = cluster.allocator();
    let mut out = BytesMut::new();

    loop {
        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            item = frames.next() => item,
        };

        let mut cmds = Vec::new();
        let mut fatal = false;
        match first {
            None | Some(Err(RespError::Io(_))) => break,
            Some(Err(e)) => {
                write!(out, "-ERR Protocol error: {e}");
                fatal = true;
            }
            Some(Ok(query)) => {
                let cmd = plan_redis(query);
                let mut quit_pending = matches!(&cmd, RedisCmd::Quit);
                cmds.push(cmd);
                // drain whatever else is already buffered into this slot;
                // QUIT is terminal, nothing pipelined behind it may run
                while !quit_pending && cmds.len() < cluster.max_pipeline() {
                    match frames.next().now_or_never() {
                        Some(Some(Ok(query))) => {
                            let cmd = plan_redis(query);
                            quit_pending = matches!(&cmd, RedisCmd::Quit);
                            cmds.push(cmd);
                        }
                        Some(Some(Err(RespError::Io(_)))) | Some(None) => {
                            fatal = true;
                            break;
                        }
                        Some(Some(Err(e))) => {
                            let mut reply = BytesMut::new();
                            write!(reply, "-ERR Protocol error: {e}");
                            cmds.push(RedisCmd::Done(reply));
                            fatal = true;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let msgs: Vec<Message> = cmds
            .iter()
            .flat_map(|cmd| match cmd {
                RedisCmd::Forward(msg) => std::slice::from_ref(msg),
                RedisCmd::Fanout { subs, .. } => subs.as_slice(),
                _ => &[],
            })
            .cloned()
            .collect();
        if !dispatch_and_wait(&cluster, &mut mba, &msgs, &shutdown).await {
            fatal = true;
        }

        let mut quit = false;
        for cmd in cmds {
            match cmd {
                RedisCmd::Done(reply) => out.unsplit(reply),
                RedisCmd::Forward(msg) => out.unsplit(redis_msg_bytes(&msg)),
                RedisCmd::Fanout { merge, subs } => write_redis_merged(&mut out, merge, &subs),
                RedisCmd::Quit => {
                    out.extend_from_slice(b"+OK\r\n");
                    quit = true;
                    break;
                }
            }
        }

        if !out.is_empty() && writer.write_all_buf(&mut out).await.is_err() {
            return;
        }
        if quit || fatal {
            break;
        }
    }
    let _ = writer.write_all_buf(&mut out).await;
}

enum McCmd {
    Done(BytesMut),
    Forward(Message),
    Fanout { subs: Vec<Message> },
    Quit,
}

async fn run_memcache<S: IntoSplit>(cluster: Arc<Cluster>, stream: S, shutdown: CancellationToken) {
    let (read_half, mut writer) = stream.into_split();
    let mut frames = FramedRead::new(read_half, memcache::RequestDecoder);
    let mut mba = cluster.allocator();
    let mut out = BytesMut::new();

    loop {
        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            item = frames.next() => item,
        };

        let mut cmds = Vec::new();
        let mut fatal = false;
        match first {
            None | Some(Err(McError::Io(_))) => break,
            Some(Err(_)) => {
                out.extend_from_slice(b"CLIENT_ERROR line too long\r\n");
                fatal = true;
            }
            Some(Ok(frame)) => {
                let cmd = plan_mc(frame);
                let mut quit_pending = matches!(&cmd, McCmd::Quit);
                cmds.push(cmd);
                // quit is terminal, nothing pipelined behind it may run
                while !quit_pending && cmds.len() < cluster.max_pipeline() {
                    match frames.next().now_or_never() {
                        Some(Some(Ok(frame))) => {
                            let cmd = plan_mc(frame);
                            quit_pending = matches!(&cmd, McCmd::Quit);
                            cmds.push(cmd);
                        }
                        Some(Some(Err(McError::Io(_)))) | Some(None) => {
                            fatal = true;
                            break;
                        }
                        Some(Some(Err(_))) => {
                            out.extend_from_slice(b"CLIENT_ERROR line too long\r\n");
                            fatal = true;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        let msgs: Vec<Message> = cmds
            .iter()
            .flat_map(|cmd| match cmd {
                McCmd::Forward(msg) => std::slice::from_ref(msg),
                McCmd::Fanout { subs } => subs.as_slice(),
                _ => &[],
            })
            .cloned()
            .collect();
        if !dispatch_and_wait(&cluster, &mut mba, &msgs, &shutdown).await {
            fatal = true;
        }

        let mut quit = false;
        for cmd in cmds {
            match cmd {
                McCmd::Done(reply) => out.unsplit(reply),
                McCmd::Forward(msg) => write_mc_msg(&mut out, &msg),
                McCmd::Fanout { subs } => write_mc_merged(&mut out, &subs),
                McCmd::Quit => {
                    quit = true;
                    break;
                }
            }
        }

        if !out.is_empty() && writer.write_all_buf(&mut out).await.is_err() {
            return;
        }
        if quit || fatal {
            break;
        }
    }
    let _ = writer.write_all_buf(&mut out).await;
}

/// Dispatches the slot's messages and waits for the round. Returns `false`
/// when the proxy is shutting down.
async fn dispatch_and_wait(
    cluster: &Arc<Cluster>,
    mba: &mut MsgBatchAllocator,
    msgs: &[Message],
    shutdown: &CancellationToken,
) -> bool {
    if msgs.is_empty() {
        return true;
    }
    mba.reset();
    cluster.dispatch(msgs, mba);
    if mba.active_count() == 0 {
        // dispatch settled everything without reaching a backend
        return true;
    }
    for (node, batch) in mba.fork_round() {
        cluster.spawn_handle(node, batch);
    }
    let result = tokio::select! {
        () = shutdown.cancelled() => {
            settle_remaining(msgs, Cause::Canceled);
            return false;
        }
        result = mba.wait() => result,
    };
    match result {
        Ok(()) => {}
        Err(WaitError::Timeout) => settle_remaining(msgs, Cause::Timeout),
        Err(WaitError::MaxRetry) => settle_remaining(msgs, Cause::MaxRetry),
    }
    true
}

fn settle_remaining(msgs: &[Message], cause: Cause) {
    for msg in msgs {
        msg.set_err(cause);
    }
}

fn plan_redis(query: RedisQuery) -> RedisCmd {
    let Some(name) = query.args.first() else {
        return RedisCmd::Done(BytesMut::new());
    };
    let Some(spec) = commands::lookup(name) else {
        return RedisCmd::Done(unsupported_reply(name));
    };
    match spec.kind {
        CmdKind::NotSupport => RedisCmd::Done(unsupported_reply(spec.name.as_bytes())),
        CmdKind::Ctl => {
            if spec.name == "QUIT" {
                RedisCmd::Quit
            } else {
                RedisCmd::Done(BytesMut::from(&b"+PONG\r\n"[..]))
            }
        }
        CmdKind::Read | CmdKind::Write => plan_redis_forward(query, spec),
    }
}

fn plan_redis_forward(query: RedisQuery, spec: &'static CmdSpec) -> RedisCmd {
    if let Some(fanout) = &spec.fanout {
        let keys = &query.args[1..];
        if keys.is_empty() || keys.len() % fanout.step != 0 {
            return RedisCmd::Done(arity_reply(spec.name));
        }
        let subs = keys
            .chunks(fanout.step)
            .map(|chunk| {
                let mut frame = BytesMut::new();
                match chunk {
                    [key] => write_query!(frame, fanout.sub_cmd, key),
                    [key, value] => write_query!(frame, fanout.sub_cmd, key, value),
                    _ => unreachable!(),
                }
                Message::new(Request::Redis {
                    frame: frame.freeze(),
                    name: fanout.sub_cmd,
                    kind: spec.kind,
                    key: chunk[0].clone(),
                    merge: fanout.merge,
                })
            })
            .collect();
        return RedisCmd::Fanout {
            merge: fanout.merge,
            subs,
        };
    }

    let Some(key) = query.args.get(1) else {
        return RedisCmd::Done(arity_reply(spec.name));
    };
    RedisCmd::Forward(Message::new(Request::Redis {
        frame: query.frame.clone(),
        name: spec.name,
        kind: spec.kind,
        key: key.clone(),
        merge: MergeKind::None,
    }))
}

fn plan_mc(frame: McFrame) -> McCmd {
    let query = match frame {
        McFrame::Bad => {
            return McCmd::Done(BytesMut::from(
                &b"CLIENT_ERROR bad command line format\r\n"[..],
            ));
        }
        McFrame::Query(query) => query,
    };
    if query.cmd == McCommand::Quit {
        return McCmd::Quit;
    }
    if query.cmd.is_retrieval() && query.keys.len() > 1 {
        let subs = query
            .keys
            .iter()
            .map(|key| {
                Message::new(Request::Memcache {
                    cmd: query.cmd,
                    key: key.clone(),
                    frame: memcache::sub_request_frame(query.cmd, query.expiry.as_deref(), key),
                })
            })
            .collect();
        return McCmd::Fanout { subs };
    }
    McCmd::Forward(Message::new(Request::Memcache {
        cmd: query.cmd,
        key: query.keys[0].clone(),
        frame: query.frame,
    }))
}

fn unsupported_reply(name: &[u8]) -> BytesMut {
    let mut msg = b"-ERR unsupported command '".to_vec();
    msg.extend_from_slice(&name[..name.len().min(64)]);
    msg.push(b'\'');
    let mut reply = BytesMut::new();
    reply.write_error(msg);
    reply
}

fn arity_reply(name: &'static str) -> BytesMut {
    let mut reply = BytesMut::new();
    write!(
        reply,
        "-ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    );
    reply
}

fn redis_error_bytes(cause: Cause) -> &'static [u8] {
    match cause {
        Cause::Timeout | Cause::MaxRetry => b"-ERR proxy timeout\r\n",
        Cause::Io | Cause::PoolExhausted => b"-ERR backend connection error\r\n",
        Cause::Canceled => b"-ERR proxy shutting down\r\n",
        Cause::BadReply => b"-ERR bad reply from backend\r\n",
    }
}

fn mc_error_bytes(cause: Cause) -> &'static [u8] {
    match cause {
        Cause::Timeout | Cause::MaxRetry => b"SERVER_ERROR timeout\r\n",
        Cause::Io | Cause::PoolExhausted => b"SERVER_ERROR backend connection error\r\n",
        Cause::Canceled => b"SERVER_ERROR proxy shutting down\r\n",
        Cause::BadReply => b"SERVER_ERROR bad reply from backend\r\n",
    }
}

/// The client-facing bytes for one Redis message: its reply, or the error
/// rendering of its cause.
fn redis_msg_bytes(msg: &Message) -> BytesMut {
    let (reply, err) = msg.take_outcome();
    match (reply, err) {
        (Some(reply), _) => reply.bytes,
        (None, Some(cause)) => BytesMut::from(redis_error_bytes(cause)),
        (None, None) => BytesMut::from(redis_error_bytes(Cause::Io)),
    }
}

fn write_redis_merged(out: &mut BytesMut, merge: MergeKind, subs: &[Message]) {
    let materialized: Vec<BytesMut> = subs.iter().map(redis_msg_bytes).collect();
    match merge {
        MergeKind::Join => resp::merge_join(out, &materialized),
        MergeKind::Count => resp::merge_count(out, &materialized),
        MergeKind::Ok => resp::merge_ok(out, &materialized),
        MergeKind::None => {
            for sub in materialized {
                out.unsplit(sub);
            }
        }
    }
}

fn write_mc_msg(out: &mut BytesMut, msg: &Message) {
    let (reply, err) = msg.take_outcome();
    match (reply, err) {
        (Some(reply), _) => match reply.flavor {
            ReplyFlavor::McValues => {
                out.extend_from_slice(&reply.bytes);
                out.extend_from_slice(memcache::END);
            }
            ReplyFlavor::McMiss => out.extend_from_slice(memcache::END),
            _ => out.extend_from_slice(&reply.bytes),
        },
        (None, Some(cause)) => out.extend_from_slice(mc_error_bytes(cause)),
        (None, None) => out.extend_from_slice(mc_error_bytes(Cause::Io)),
    }
}

/// Concatenates retrieval sub-replies in key order and terminates the run
/// once. Errored legs contribute nothing unless every leg failed, in which
/// case the first failure is the reply.
fn write_mc_merged(out: &mut BytesMut, subs: &[Message]) {
    let outcomes: Vec<(Option<Reply>, Option<Cause>)> =
        subs.iter().map(Message::take_outcome).collect();
    let errored = |outcome: &(Option<Reply>, Option<Cause>)| match &outcome.0 {
        Some(reply) => {
            reply.flavor == ReplyFlavor::McLine && memcache::is_error_line(&reply.bytes)
        }
        None => true,
    };
    if !outcomes.is_empty() && outcomes.iter().all(errored) {
        match &outcomes[0] {
            (Some(reply), _) => out.extend_from_slice(&reply.bytes),
            (None, Some(cause)) => out.extend_from_slice(mc_error_bytes(*cause)),
            (None, None) => out.extend_from_slice(mc_error_bytes(Cause::Io)),
        }
        return;
    }
    for (reply, _) in outcomes {
        if let Some(reply) = reply
            && reply.flavor == ReplyFlavor::McValues
        {
            out.extend_from_slice(&reply.bytes);
        }
    }
    out.extend_from_slice(memcache::END);
}
