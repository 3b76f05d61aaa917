// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reference-counted interning of path segments.
//!
//! Every path segment a lock group mentions is interned into a [`TokenTable`]
//! while the group is alive, so composite paths can be compared through
//! fixed-width token ids instead of their string contents.

use rustc_hash::FxHashMap;

/// Stable identity of an interned segment.
///
/// Ids come from a monotonic per-table counter and are never reused within a
/// process lifetime, so a key built from released tokens can never alias a
/// key built from live ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Token(u64);

pub(crate) const TOKEN_BYTES: usize = std::mem::size_of::<u64>();

/// Lookup key for one path prefix: the little-endian concatenation of the
/// token ids along the prefix, root token first.
pub(crate) type PathKey = Vec<u8>;

pub(crate) fn concat_tokens(tokens: &[Token]) -> PathKey {
    let mut key = Vec::with_capacity(tokens.len() * TOKEN_BYTES);
    for token in tokens {
        key.extend_from_slice(&token.0.to_le_bytes());
    }
    key
}

#[derive(Debug)]
struct TokenEntry {
    id: u64,
    refs: i64,
}

/// Counted set of segment strings.
///
/// Unlike a plain set, the table balances `store`/`release` calls per segment
/// and removes an entry once its balance reaches zero. Releasing a segment
/// that is not present is a programmer fault and panics. The table is not
/// internally synchronized; callers access it under the engine mutex.
#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    entries: FxHashMap<String, TokenEntry>,
    next_id: u64,
}

impl TokenTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Interns `segment`, incrementing its reference count.
    pub(crate) fn store(&mut self, segment: &str) -> Token {
        if let Some(entry) = self.entries.get_mut(segment) {
            entry.refs += 1;
            return Token(entry.id);
        }

        self.next_id += 1;
        let id = self.next_id;
        self.entries
            .insert(segment.to_owned(), TokenEntry { id, refs: 1 });

        Token(id)
    }

    /// Drops one reference to `segment`, removing the entry at zero.
    pub(crate) fn release(&mut self, segment: &str) {
        let entry = self
            .entries
            .get_mut(segment)
            .unwrap_or_else(|| panic!("released segment {segment:?} is not interned; review your logic"));

        entry.refs -= 1;

        if entry.refs == 0 {
            self.entries.remove(segment);
        }
    }

    /// Total number of outstanding references across all segments.
    pub(crate) fn sum(&self) -> i64 {
        self.entries.values().map(|entry| entry.refs).sum()
    }

    /// Number of distinct interned segments.
    pub(crate) fn count(&self) -> i64 {
        self.entries.len() as i64
    }
}
