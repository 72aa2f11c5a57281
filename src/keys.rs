//! Key layout for the timer store.
//!
//! Every key a store writes lives under `prefix:timerstore:<handler>:<partn>:`
//! and takes one of four shapes: the per-bucket `root:<due>` counter, the
//! `alarm:<due>:<seq>` record, the content-addressed `context:<hash>`
//! record, and the single `span` record. These shapes are the on-disk
//! contract and must stay stable across restarts.

use ripemd::{Digest, Ripemd160};

/// Quantum of time the store operates on, in seconds.
///
/// Due times round up to a multiple of this on scheduling and down on
/// scanning; the span sync ticker fires once per quantum.
pub const RESOLUTION: i64 = 7;

/// Base value of a bucket's sequence counter.
///
/// The first timer set into a fresh bucket observes `INIT_SEQ + 1`.
pub const INIT_SEQ: i64 = 128;

/// Alphabet for context hashes: 64 symbols, 5 bits per character.
///
/// Part of the wire format; changing a single symbol changes every
/// context key.
const DICT: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789*&";

// A shorter alphabet would silently truncate addressable contexts.
const _: () = assert!(DICT.len() == 64);

/// Round a timestamp up to the next multiple of [`RESOLUTION`].
#[must_use]
pub fn round_up(val: i64) -> i64 {
    let q = val / RESOLUTION;
    let r = val % RESOLUTION;
    if r > 0 {
        (q + 1) * RESOLUTION
    } else {
        q * RESOLUTION
    }
}

/// Round a timestamp down to the previous multiple of [`RESOLUTION`].
#[must_use]
pub fn round_down(val: i64) -> i64 {
    (val / RESOLUTION) * RESOLUTION
}

/// Hash a timer reference into its 32-character context key component.
///
/// RIPEMD-160 yields 160 bits; each 5-bit group, most significant bit
/// first, selects one symbol of the 64-character alphabet. The same `ref`
/// always produces the same hash, so context keys are content-addressed.
#[must_use]
pub fn context_hash(reference: &str) -> String {
    let digest = Ripemd160::digest(reference.as_bytes());
    let mut hash = String::with_capacity(32);
    for chunk in 0..32 {
        let mut pos = 0usize;
        for bit in (chunk * 5)..(chunk * 5 + 5) {
            let set = (digest[bit / 8] >> (7 - bit % 8)) & 1;
            pos = (pos << 1) | set as usize;
        }
        hash.push(DICT[pos] as char);
    }
    hash
}

/// Key builder for one `(prefix, handler, partition)` namespace.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    prefix: String,
    handler: String,
    partn: u16,
}

impl KeySpace {
    pub(crate) fn new(prefix: impl Into<String>, handler: impl Into<String>, partn: u16) -> Self {
        Self {
            prefix: prefix.into(),
            handler: handler.into(),
            partn,
        }
    }

    /// Counter key for a time bucket.
    pub(crate) fn root(&self, due: i64) -> String {
        format!(
            "{}:timerstore:{}:{}:root:{}",
            self.prefix, self.handler, self.partn, due
        )
    }

    /// Alarm key for one sequence within a time bucket.
    pub(crate) fn alarm(&self, due: i64, seq: i64) -> String {
        format!(
            "{}:timerstore:{}:{}:alarm:{}:{}",
            self.prefix, self.handler, self.partn, due, seq
        )
    }

    /// Content-addressed context key for a timer reference.
    pub(crate) fn context(&self, reference: &str) -> String {
        format!(
            "{}:timerstore:{}:{}:context:{}",
            self.prefix,
            self.handler,
            self.partn,
            context_hash(reference)
        )
    }

    /// The persisted span key.
    pub(crate) fn span(&self) -> String {
        format!(
            "{}:timerstore:{}:{}:span",
            self.prefix, self.handler, self.partn
        )
    }

    /// Scope label used in log fields.
    pub(crate) fn scope(&self) -> String {
        format!(
            "timerstore:{}:{}:{}",
            self.prefix, self.handler, self.partn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), 7);
        assert_eq!(round_up(7), 7);
        assert_eq!(round_up(100), 105);
        assert_eq!(round_up(1000), 1001);
    }

    #[test]
    fn test_round_down() {
        assert_eq!(round_down(0), 0);
        assert_eq!(round_down(6), 0);
        assert_eq!(round_down(7), 7);
        assert_eq!(round_down(1010), 1008);
    }

    #[test]
    fn test_key_shapes() {
        let keys = KeySpace::new("ev", "onTick", 3);
        assert_eq!(keys.root(1001), "ev:timerstore:onTick:3:root:1001");
        assert_eq!(keys.alarm(1001, 129), "ev:timerstore:onTick:3:alarm:1001:129");
        assert_eq!(keys.span(), "ev:timerstore:onTick:3:span");
        assert!(keys
            .context("r1")
            .starts_with("ev:timerstore:onTick:3:context:"));
    }

    #[test]
    fn test_context_hash_is_32_chars_of_the_alphabet() {
        let hash = context_hash("some timer reference");
        assert_eq!(hash.len(), 32);
        assert!(hash.bytes().all(|b| DICT.contains(&b)));
    }

    #[test]
    fn test_context_hash_is_deterministic() {
        assert_eq!(context_hash("r1"), context_hash("r1"));
        assert_ne!(context_hash("r1"), context_hash("r2"));
    }

    #[test]
    fn test_context_hash_consumes_all_160_bits() {
        // References sharing a long prefix must still diverge.
        let a = context_hash("prefix-prefix-prefix-a");
        let b = context_hash("prefix-prefix-prefix-b");
        assert_ne!(a, b);
    }
}
