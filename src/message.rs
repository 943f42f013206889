//! The message and batch model shared by sessions, the router, and backend
//! handlers.
//!
//! A session turns each parsed client command into one or more `Message`s,
//! groups them per backend through a `MsgBatchAllocator`, and waits on a
//! depth-1 done signal until every sub-batch has been handled.

use crate::{
    commands::{CmdKind, MergeKind},
    memcache::McCommand,
    metrics,
};
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Memcache,
    Redis,
}

/// Why a message failed. Attached per message so one bad key does not mask
/// its siblings in the same client command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Cause {
    #[error("timeout reached")]
    Timeout,

    #[error("backend io error")]
    Io,

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("request canceled")]
    Canceled,

    #[error("too many wakeups")]
    MaxRetry,

    #[error("bad reply from backend")]
    BadReply,
}

impl Cause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Io => "io",
            Self::PoolExhausted => "pool_exhausted",
            Self::Canceled => "canceled",
            Self::MaxRetry => "max_retry",
            Self::BadReply => "bad_reply",
        }
    }
}

/// A parsed client command, immutable once built.
#[derive(Debug)]
pub enum Request {
    Redis {
        frame: Bytes,
        name: &'static str,
        kind: CmdKind,
        key: Bytes,
        merge: MergeKind,
    },
    Memcache {
        cmd: McCommand,
        key: Bytes,
        frame: Bytes,
    },
}

impl Request {
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Redis { key, .. } | Self::Memcache { key, .. } => key,
        }
    }

    /// The raw wire bytes forwarded to the backend.
    pub fn frame(&self) -> &Bytes {
        match self {
            Self::Redis { frame, .. } | Self::Memcache { frame, .. } => frame,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Redis { name, .. } => name,
            Self::Memcache { cmd, .. } => cmd.as_str(),
        }
    }

    pub fn kind(&self) -> CmdKind {
        match self {
            Self::Redis { kind, .. } => *kind,
            Self::Memcache { cmd, .. } => {
                if cmd.is_retrieval() {
                    CmdKind::Read
                } else {
                    CmdKind::Write
                }
            }
        }
    }

    /// Merge policy of the fan-out this request belongs to, if any.
    pub fn merge_kind(&self) -> MergeKind {
        match self {
            Self::Redis { merge, .. } => *merge,
            Self::Memcache { .. } => MergeKind::None,
        }
    }

    pub fn is_mc_retrieval(&self) -> bool {
        matches!(self, Self::Memcache { cmd, .. } if cmd.is_retrieval())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFlavor {
    /// A complete RESP reply.
    Resp,
    /// Memcache `VALUE` blocks, terminator stripped.
    McValues,
    /// Memcache retrieval miss.
    McMiss,
    /// Any other single-line memcache reply.
    McLine,
}

#[derive(Debug)]
pub struct Reply {
    pub bytes: BytesMut,
    pub flavor: ReplyFlavor,
}

#[derive(Default)]
struct Outcome {
    reply: Option<Reply>,
    err: Option<Cause>,
}

struct MsgShared {
    req: Request,
    outcome: Mutex<Outcome>,
    start: Instant,
    remote_us: AtomicU64,
}

/// One request/reply pair in flight. Cloning shares the underlying slot;
/// the handler fills it, the session consumes it.
#[derive(Clone)]
pub struct Message {
    shared: Arc<MsgShared>,
}

impl Message {
    pub fn new(req: Request) -> Self {
        Self {
            shared: Arc::new(MsgShared {
                req,
                outcome: Mutex::new(Outcome::default()),
                start: Instant::now(),
                remote_us: AtomicU64::new(0),
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.shared.req
    }

    /// Attaches the backend reply. A reply arriving after the message was
    /// already settled (timeout, cancel) is discarded; returns whether the
    /// reply was accepted.
    pub fn set_reply(&self, reply: Reply) -> bool {
        let mut outcome = self.shared.outcome.lock().unwrap();
        if outcome.reply.is_some() || outcome.err.is_some() {
            return false;
        }
        outcome.reply = Some(reply);
        self.shared.remote_us.store(
            self.shared.start.elapsed().as_micros() as u64,
            Ordering::Relaxed,
        );
        true
    }

    /// Marks the message failed. The first settled outcome wins.
    pub fn set_err(&self, cause: Cause) {
        let mut outcome = self.shared.outcome.lock().unwrap();
        if outcome.reply.is_none() && outcome.err.is_none() {
            outcome.err = Some(cause);
        }
    }

    pub fn is_settled(&self) -> bool {
        let outcome = self.shared.outcome.lock().unwrap();
        outcome.reply.is_some() || outcome.err.is_some()
    }

    pub fn take_outcome(&self) -> (Option<Reply>, Option<Cause>) {
        let mut outcome = self.shared.outcome.lock().unwrap();
        (outcome.reply.take(), outcome.err)
    }

    /// Microseconds between parse and reply attach.
    pub fn remote_us(&self) -> u64 {
        self.shared.remote_us.load(Ordering::Relaxed)
    }
}

const BATCH_NOT_READY: u32 = 0;
const BATCH_DONE: u32 = 1;

/// The done flag of a batch tree's root. Forked sub-batches share it.
#[derive(Default)]
pub struct BatchState(AtomicU32);

impl BatchState {
    fn set_done(&self) -> bool {
        self.0
            .compare_exchange(
                BATCH_NOT_READY,
                BATCH_DONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire) == BATCH_DONE
    }
}

/// An ordered run of messages bound for a single backend.
pub struct MsgBatch {
    msgs: Vec<Message>,
    count: usize,
    state: Arc<BatchState>,
    signal: Arc<Notify>,
}

impl MsgBatch {
    fn new(signal: Arc<Notify>) -> Self {
        Self {
            msgs: Vec::new(),
            count: 0,
            state: Arc::new(BatchState::default()),
            signal,
        }
    }

    pub fn add_msg(&mut self, msg: Message) {
        self.msgs.push(msg);
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn msgs(&self) -> &[Message] {
        &self.msgs
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Splits off a batch carrying the queued messages for dispatch. The
    /// done state stays shared, so `done` on the fork settles the root.
    pub fn fork_take(&mut self) -> MsgBatch {
        let msgs = std::mem::take(&mut self.msgs);
        MsgBatch {
            count: msgs.len(),
            msgs,
            state: self.state.clone(),
            signal: self.signal.clone(),
        }
    }

    /// Settles the root state (at most once) and pings the done signal.
    /// Extra pings coalesce in the depth-1 channel.
    pub fn done(&self) {
        self.state.set_done();
        self.signal.notify_one();
    }

    /// Fails every unsettled message in the batch, counts the errors, and
    /// settles the batch.
    pub fn done_with_error(&self, cluster: &str, node: &str, cause: Cause) {
        for msg in &self.msgs {
            msg.set_err(cause);
            metrics::err_incr(cluster, node, msg.request().command(), cause.as_str());
        }
        self.done();
    }

    fn reset(&mut self) {
        self.msgs.clear();
        self.count = 0;
        // Fresh root state: a straggling handler from a timed-out round must
        // not settle the next round.
        self.state = Arc::new(BatchState::default());
    }
}

const MAX_RETRY_WAKEUPS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("timeout reached")]
    Timeout,

    #[error("too many times woken up")]
    MaxRetry,
}

/// Per-session map of backend node -> batch for the current dispatch round,
/// sharing one done signal and one timeout.
pub struct MsgBatchAllocator {
    batches: HashMap<String, MsgBatch>,
    signal: Arc<Notify>,
    timeout: Duration,
}

impl MsgBatchAllocator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            batches: HashMap::new(),
            signal: Arc::new(Notify::new()),
            timeout,
        }
    }

    pub fn add_msg(&mut self, node: &str, msg: Message) {
        if let Some(batch) = self.batches.get_mut(node) {
            batch.add_msg(msg);
        } else {
            let mut batch = MsgBatch::new(self.signal.clone());
            batch.add_msg(msg);
            self.batches.insert(node.to_owned(), batch);
        }
    }

    /// Number of backends involved in the current round.
    pub fn active_count(&self) -> usize {
        self.batches.values().filter(|b| b.count > 0).count()
    }

    /// Takes the queued messages of every involved backend as dispatchable
    /// forks. The allocator keeps the shared done states for `wait`.
    pub fn fork_round(&mut self) -> Vec<(String, MsgBatch)> {
        self.batches
            .iter_mut()
            .filter(|(_, batch)| batch.count > 0)
            .map(|(node, batch)| (node.clone(), batch.fork_take()))
            .collect()
    }

    /// Wakes the waiter without settling anything, e.g. to deliver a
    /// background error.
    pub fn ping(&self) {
        self.signal.notify_one();
    }

    /// Waits until every sub-batch of the round is done, the timeout
    /// expires, or the wakeup safety bound trips. Wakeups are coalesced, so
    /// each one is followed by an all-done re-check.
    pub async fn wait(&self) -> Result<(), WaitError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let pending = self.active_count();
        if pending == 0 {
            return match tokio::time::timeout_at(deadline, self.signal.notified()).await {
                Ok(()) if self.all_done() => Ok(()),
                Ok(()) => Err(WaitError::MaxRetry),
                Err(_) => Err(WaitError::Timeout),
            };
        }

        for _ in 0..pending + MAX_RETRY_WAKEUPS {
            match tokio::time::timeout_at(deadline, self.signal.notified()).await {
                Ok(()) => {
                    if self.all_done() {
                        return Ok(());
                    }
                }
                Err(_) => return Err(WaitError::Timeout),
            }
        }
        Err(WaitError::MaxRetry)
    }

    fn all_done(&self) -> bool {
        self.batches
            .values()
            .all(|batch| batch.count == 0 || batch.is_done())
    }

    /// Prepares the allocator for the next round, retaining map and vector
    /// capacity.
    pub fn reset(&mut self) {
        for batch in self.batches.values_mut() {
            batch.reset();
        }
    }
}
