//! Redis command classification.
//!
//! A static table keyed by the canonical upper-cased command name decides
//! whether a command is forwarded, answered locally, or rejected, and how
//! multi-key commands are split and re-merged.

use phf::phf_map;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Read,
    Write,
    Ctl,
    NotSupport,
}

/// How replies to a fanned-out command are combined back into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    None,
    Count,
    Ok,
    Join,
}

pub struct CmdSpec {
    pub name: &'static str,
    pub kind: CmdKind,
    pub fanout: Option<Fanout>,
}

/// Split rule for a multi-key command: one sub-request per `step` arguments,
/// rewritten as `sub_cmd`.
pub struct Fanout {
    pub sub_cmd: &'static str,
    pub step: usize,
    pub merge: MergeKind,
}

impl CmdSpec {
    const fn read(name: &'static str) -> Self {
        Self {
            name,
            kind: CmdKind::Read,
            fanout: None,
        }
    }

    const fn write(name: &'static str) -> Self {
        Self {
            name,
            kind: CmdKind::Write,
            fanout: None,
        }
    }

    const fn ctl(name: &'static str) -> Self {
        Self {
            name,
            kind: CmdKind::Ctl,
            fanout: None,
        }
    }

    const fn not_support(name: &'static str) -> Self {
        Self {
            name,
            kind: CmdKind::NotSupport,
            fanout: None,
        }
    }

    const fn fanout(
        name: &'static str,
        kind: CmdKind,
        sub_cmd: &'static str,
        step: usize,
        merge: MergeKind,
    ) -> Self {
        Self {
            name,
            kind,
            fanout: Some(Fanout {
                sub_cmd,
                step,
                merge,
            }),
        }
    }
}

static COMMANDS: phf::Map<&'static str, CmdSpec> = phf_map! {
    // keys
    "DEL" => CmdSpec::fanout("DEL", CmdKind::Write, "DEL", 1, MergeKind::Count),
    "DUMP" => CmdSpec::read("DUMP"),
    "EXISTS" => CmdSpec::fanout("EXISTS", CmdKind::Read, "EXISTS", 1, MergeKind::Count),
    "EXPIRE" => CmdSpec::write("EXPIRE"),
    "EXPIREAT" => CmdSpec::write("EXPIREAT"),
    "PERSIST" => CmdSpec::write("PERSIST"),
    "PEXPIRE" => CmdSpec::write("PEXPIRE"),
    "PEXPIREAT" => CmdSpec::write("PEXPIREAT"),
    "PTTL" => CmdSpec::read("PTTL"),
    "RESTORE" => CmdSpec::write("RESTORE"),
    "SORT" => CmdSpec::write("SORT"),
    "TTL" => CmdSpec::read("TTL"),
    "TYPE" => CmdSpec::read("TYPE"),

    // strings
    "APPEND" => CmdSpec::write("APPEND"),
    "BITCOUNT" => CmdSpec::read("BITCOUNT"),
    "BITPOS" => CmdSpec::read("BITPOS"),
    "DECR" => CmdSpec::write("DECR"),
    "DECRBY" => CmdSpec::write("DECRBY"),
    "GET" => CmdSpec::read("GET"),
    "GETBIT" => CmdSpec::read("GETBIT"),
    "GETRANGE" => CmdSpec::read("GETRANGE"),
    "GETSET" => CmdSpec::write("GETSET"),
    "INCR" => CmdSpec::write("INCR"),
    "INCRBY" => CmdSpec::write("INCRBY"),
    "INCRBYFLOAT" => CmdSpec::write("INCRBYFLOAT"),
    "MGET" => CmdSpec::fanout("MGET", CmdKind::Read, "GET", 1, MergeKind::Join),
    "MSET" => CmdSpec::fanout("MSET", CmdKind::Write, "SET", 2, MergeKind::Ok),
    "PSETEX" => CmdSpec::write("PSETEX"),
    "SET" => CmdSpec::write("SET"),
    "SETBIT" => CmdSpec::write("SETBIT"),
    "SETEX" => CmdSpec::write("SETEX"),
    "SETNX" => CmdSpec::write("SETNX"),
    "SETRANGE" => CmdSpec::write("SETRANGE"),
    "STRLEN" => CmdSpec::read("STRLEN"),

    // hashes
    "HDEL" => CmdSpec::write("HDEL"),
    "HEXISTS" => CmdSpec::read("HEXISTS"),
    "HGET" => CmdSpec::read("HGET"),
    "HGETALL" => CmdSpec::read("HGETALL"),
    "HINCRBY" => CmdSpec::write("HINCRBY"),
    "HINCRBYFLOAT" => CmdSpec::write("HINCRBYFLOAT"),
    "HKEYS" => CmdSpec::read("HKEYS"),
    "HLEN" => CmdSpec::read("HLEN"),
    "HMGET" => CmdSpec::read("HMGET"),
    "HMSET" => CmdSpec::write("HMSET"),
    "HSCAN" => CmdSpec::read("HSCAN"),
    "HSET" => CmdSpec::write("HSET"),
    "HSETNX" => CmdSpec::write("HSETNX"),
    "HSTRLEN" => CmdSpec::read("HSTRLEN"),
    "HVALS" => CmdSpec::read("HVALS"),

    // sets
    "SADD" => CmdSpec::write("SADD"),
    "SCARD" => CmdSpec::read("SCARD"),
    "SDIFF" => CmdSpec::read("SDIFF"),
    "SINTER" => CmdSpec::read("SINTER"),
    "SISMEMBER" => CmdSpec::read("SISMEMBER"),
    "SMEMBERS" => CmdSpec::read("SMEMBERS"),
    "SMOVE" => CmdSpec::write("SMOVE"),
    "SPOP" => CmdSpec::write("SPOP"),
    "SRANDMEMBER" => CmdSpec::read("SRANDMEMBER"),
    "SREM" => CmdSpec::write("SREM"),
    "SSCAN" => CmdSpec::read("SSCAN"),
    "SUNION" => CmdSpec::read("SUNION"),

    // sorted sets
    "ZADD" => CmdSpec::write("ZADD"),
    "ZCARD" => CmdSpec::read("ZCARD"),
    "ZCOUNT" => CmdSpec::read("ZCOUNT"),
    "ZINCRBY" => CmdSpec::write("ZINCRBY"),
    "ZLEXCOUNT" => CmdSpec::read("ZLEXCOUNT"),
    "ZRANGE" => CmdSpec::read("ZRANGE"),
    "ZRANGEBYLEX" => CmdSpec::read("ZRANGEBYLEX"),
    "ZRANGEBYSCORE" => CmdSpec::read("ZRANGEBYSCORE"),
    "ZRANK" => CmdSpec::read("ZRANK"),
    "ZREM" => CmdSpec::write("ZREM"),
    "ZREMRANGEBYLEX" => CmdSpec::write("ZREMRANGEBYLEX"),
    "ZREMRANGEBYRANK" => CmdSpec::write("ZREMRANGEBYRANK"),
    "ZREMRANGEBYSCORE" => CmdSpec::write("ZREMRANGEBYSCORE"),
    "ZREVRANGE" => CmdSpec::read("ZREVRANGE"),
    "ZREVRANGEBYLEX" => CmdSpec::read("ZREVRANGEBYLEX"),
    "ZREVRANGEBYSCORE" => CmdSpec::read("ZREVRANGEBYSCORE"),
    "ZREVRANK" => CmdSpec::read("ZREVRANK"),
    "ZSCAN" => CmdSpec::read("ZSCAN"),
    "ZSCORE" => CmdSpec::read("ZSCORE"),

    // lists
    "LINDEX" => CmdSpec::read("LINDEX"),
    "LINSERT" => CmdSpec::write("LINSERT"),
    "LLEN" => CmdSpec::read("LLEN"),
    "LPOP" => CmdSpec::write("LPOP"),
    "LPUSH" => CmdSpec::write("LPUSH"),
    "LPUSHX" => CmdSpec::write("LPUSHX"),
    "LRANGE" => CmdSpec::read("LRANGE"),
    "LREM" => CmdSpec::write("LREM"),
    "LSET" => CmdSpec::write("LSET"),
    "LTRIM" => CmdSpec::write("LTRIM"),
    "RPOP" => CmdSpec::write("RPOP"),
    "RPOPLPUSH" => CmdSpec::write("RPOPLPUSH"),
    "RPUSH" => CmdSpec::write("RPUSH"),
    "RPUSHX" => CmdSpec::write("RPUSHX"),

    // hyperloglog
    "PFADD" => CmdSpec::write("PFADD"),
    "PFCOUNT" => CmdSpec::read("PFCOUNT"),
    "PFMERGE" => CmdSpec::write("PFMERGE"),

    // answered by the proxy itself
    "PING" => CmdSpec::ctl("PING"),
    "QUIT" => CmdSpec::ctl("QUIT"),

    // never forwarded
    "AUTH" => CmdSpec::not_support("AUTH"),
    "BITOP" => CmdSpec::not_support("BITOP"),
    "BLPOP" => CmdSpec::not_support("BLPOP"),
    "BRPOP" => CmdSpec::not_support("BRPOP"),
    "BRPOPLPUSH" => CmdSpec::not_support("BRPOPLPUSH"),
    "CLUSTER" => CmdSpec::not_support("CLUSTER"),
    "COMMAND" => CmdSpec::not_support("COMMAND"),
    "CONFIG" => CmdSpec::not_support("CONFIG"),
    "ECHO" => CmdSpec::not_support("ECHO"),
    "EVAL" => CmdSpec::not_support("EVAL"),
    "EVALSHA" => CmdSpec::not_support("EVALSHA"),
    "EXEC" => CmdSpec::not_support("EXEC"),
    "INFO" => CmdSpec::not_support("INFO"),
    "KEYS" => CmdSpec::not_support("KEYS"),
    "MIGRATE" => CmdSpec::not_support("MIGRATE"),
    "MOVE" => CmdSpec::not_support("MOVE"),
    "MSETNX" => CmdSpec::not_support("MSETNX"),
    "MULTI" => CmdSpec::not_support("MULTI"),
    "OBJECT" => CmdSpec::not_support("OBJECT"),
    "PSUBSCRIBE" => CmdSpec::not_support("PSUBSCRIBE"),
    "PUBLISH" => CmdSpec::not_support("PUBLISH"),
    "RANDOMKEY" => CmdSpec::not_support("RANDOMKEY"),
    "RENAME" => CmdSpec::not_support("RENAME"),
    "RENAMENX" => CmdSpec::not_support("RENAMENX"),
    "SCAN" => CmdSpec::not_support("SCAN"),
    "SCRIPT" => CmdSpec::not_support("SCRIPT"),
    "SDIFFSTORE" => CmdSpec::not_support("SDIFFSTORE"),
    "SELECT" => CmdSpec::not_support("SELECT"),
    "SINTERSTORE" => CmdSpec::not_support("SINTERSTORE"),
    "SLOWLOG" => CmdSpec::not_support("SLOWLOG"),
    "SUBSCRIBE" => CmdSpec::not_support("SUBSCRIBE"),
    "SUNIONSTORE" => CmdSpec::not_support("SUNIONSTORE"),
    "TIME" => CmdSpec::not_support("TIME"),
    "WAIT" => CmdSpec::not_support("WAIT"),
    "WATCH" => CmdSpec::not_support("WATCH"),
    "ZINTERSTORE" => CmdSpec::not_support("ZINTERSTORE"),
    "ZUNIONSTORE" => CmdSpec::not_support("ZUNIONSTORE"),
};

const MAX_CMD_LEN: usize = 20;

/// Looks up a command by its (case-insensitive) wire name.
pub fn lookup(name: &[u8]) -> Option<&'static CmdSpec> {
    if name.is_empty() || name.len() > MAX_CMD_LEN {
        return None;
    }
    let mut buf = [0u8; MAX_CMD_LEN];
    let upper = &mut buf[..name.len()];
    for (dst, src) in upper.iter_mut().zip(name) {
        *dst = src.to_ascii_uppercase();
    }
    COMMANDS.get(str::from_utf8(upper).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup(b"get").unwrap().name, "GET");
        assert_eq!(lookup(b"GeT").unwrap().name, "GET");
        assert_eq!(lookup(b"ZREVRANGEBYSCORE").unwrap().name, "ZREVRANGEBYSCORE");
    }

    #[test]
    fn lookup_unknown() {
        assert!(lookup(b"").is_none());
        assert!(lookup(b"GETALL").is_none());
        assert!(lookup(b"X".repeat(64).as_slice()).is_none());
        assert!(lookup(b"G\xffT").is_none());
    }

    #[test]
    fn classification() {
        assert_eq!(lookup(b"GET").unwrap().kind, CmdKind::Read);
        assert_eq!(lookup(b"SET").unwrap().kind, CmdKind::Write);
        assert_eq!(lookup(b"PING").unwrap().kind, CmdKind::Ctl);
        assert_eq!(lookup(b"KEYS").unwrap().kind, CmdKind::NotSupport);
        assert_eq!(lookup(b"ZINTERSTORE").unwrap().kind, CmdKind::NotSupport);
    }

    #[test]
    fn fanout_specs() {
        let mget = lookup(b"MGET").unwrap().fanout.as_ref().unwrap();
        assert_eq!((mget.sub_cmd, mget.step), ("GET", 1));
        assert_eq!(mget.merge, MergeKind::Join);

        let mset = lookup(b"MSET").unwrap().fanout.as_ref().unwrap();
        assert_eq!((mset.sub_cmd, mset.step), ("SET", 2));
        assert_eq!(mset.merge, MergeKind::Ok);

        let del = lookup(b"DEL").unwrap().fanout.as_ref().unwrap();
        assert_eq!(del.merge, MergeKind::Count);
        let exists = lookup(b"EXISTS").unwrap().fanout.as_ref().unwrap();
        assert_eq!(exists.merge, MergeKind::Count);

        assert!(lookup(b"SET").unwrap().fanout.is_none());
    }
}
