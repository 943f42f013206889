//! Ketama consistent-hash ring.
//!
//! Virtual points are generated from MD5 digests of `"{node}-{i}"`, four
//! 32-bit points per digest, `weight * 160` points per node. A ring is an
//! immutable snapshot; updates build a new ring and publish it whole.

use bstr::ByteSlice;
use md5::{Digest, Md5};
use serde::Deserialize;

const REPLICAS: usize = 160;
const POINTS_PER_DIGEST: usize = 4;

/// Key hashing scheme. Point generation is always Ketama/MD5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMethod {
    Ketama,
    OneAtATime,
}

pub struct Ring {
    points: Vec<(u32, u32)>,
    nodes: Vec<String>,
    method: HashMethod,
}

impl Ring {
    pub fn build(nodes: &[(String, usize)], method: HashMethod) -> Self {
        let mut points = Vec::new();
        for (idx, (name, weight)) in nodes.iter().enumerate() {
            let num_digests = weight * REPLICAS / POINTS_PER_DIGEST;
            for i in 0..num_digests {
                let digest = md5_digest(format!("{name}-{i}").as_bytes());
                for j in 0..POINTS_PER_DIGEST {
                    points.push((point_from_digest(&digest, j), idx as u32));
                }
            }
        }
        points.sort_unstable();
        Self {
            points,
            nodes: nodes.iter().map(|(name, _)| name.clone()).collect(),
            method,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Maps a key to its backend node: the first virtual point at or after
    /// the key hash, wrapping to the start of the ring.
    pub fn lookup(&self, key: &[u8]) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = self.key_hash(key);
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let (_, node) = self.points[if idx == self.points.len() { 0 } else { idx }];
        Some(&self.nodes[node as usize])
    }

    fn key_hash(&self, key: &[u8]) -> u32 {
        let key = hash_tag(key);
        match self.method {
            HashMethod::Ketama => point_from_digest(&md5_digest(key), 0),
            HashMethod::OneAtATime => one_at_a_time(key),
        }
    }

    #[cfg(test)]
    fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// `{tag}` rule: a non-empty brace-delimited tag hashes in place of the
/// whole key, pinning related keys to one shard.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(start) = key.find_byte(b'{') else {
        return key;
    };
    let tag = &key[start + 1..];
    match tag.find_byte(b'}') {
        Some(0) | None => key,
        Some(end) => &tag[..end],
    }
}

fn md5_digest(input: &[u8]) -> [u8; 16] {
    Md5::digest(input).into()
}

fn point_from_digest(digest: &[u8; 16], i: usize) -> u32 {
    let d = &digest[i * 4..];
    u32::from(d[3]) << 24 | u32::from(d[2]) << 16 | u32::from(d[1]) << 8 | u32::from(d[0])
}

/// Jenkins one-at-a-time.
fn one_at_a_time(key: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in key {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Vec<(String, usize)> {
        vec![
            ("10.0.0.1:11211".to_owned(), 1),
            ("10.0.0.2:11211".to_owned(), 1),
            ("10.0.0.3:11211".to_owned(), 1),
        ]
    }

    #[test]
    fn point_layout() {
        let ring = Ring::build(&three_nodes(), HashMethod::Ketama);
        assert_eq!(ring.point_count(), 3 * REPLICAS);
        assert_eq!(ring.node_count(), 3);

        let weighted = vec![
            ("10.0.0.1:11211".to_owned(), 1),
            ("10.0.0.2:11211".to_owned(), 2),
        ];
        let ring = Ring::build(&weighted, HashMethod::Ketama);
        assert_eq!(ring.point_count(), 3 * REPLICAS);
    }

    #[test]
    fn lookup_is_stable() {
        let ring = Ring::build(&three_nodes(), HashMethod::Ketama);
        for key in [&b"a"[..], b"foo", b"some:longer:key", b""] {
            assert_eq!(ring.lookup(key), ring.lookup(key));
        }
    }

    #[test]
    fn lookup_spreads_keys() {
        let ring = Ring::build(&three_nodes(), HashMethod::Ketama);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let key = format!("key-{i}");
            seen.insert(ring.lookup(key.as_bytes()).unwrap().to_owned());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn one_at_a_time_method() {
        let ring = Ring::build(&three_nodes(), HashMethod::OneAtATime);
        for i in 0..100 {
            let key = format!("key-{i}");
            assert!(ring.lookup(key.as_bytes()).is_some());
        }
    }

    #[test]
    fn hash_tags_pin_keys() {
        let ring = Ring::build(&three_nodes(), HashMethod::Ketama);
        let a = ring.lookup(b"{user1000}.following").unwrap();
        let b = ring.lookup(b"{user1000}.followers").unwrap();
        assert_eq!(a, b);
        assert_eq!(ring.lookup(b"{user1000}"), Some(a));
    }

    #[test]
    fn hash_tag_extraction() {
        assert_eq!(hash_tag(b"{user}key"), b"user");
        assert_eq!(hash_tag(b"a{b}c"), b"b");
        assert_eq!(hash_tag(b"{}key"), b"{}key");
        assert_eq!(hash_tag(b"{open"), b"{open");
        assert_eq!(hash_tag(b"plain"), b"plain");
    }

    #[test]
    fn empty_ring() {
        let ring = Ring::build(&[], HashMethod::Ketama);
        assert_eq!(ring.lookup(b"k"), None);
    }
}
