//! Topic hash and mask
//!
//! The first eight levels of a topic each contribute one byte to a 64-bit
//! hash, the first level landing in the most significant byte. A filter also
//! produces a mask: `+` clears its own byte, `#` clears its byte and every
//! byte after it. A topic can only match a filter when
//! `topic.hash & filter.mask == filter.hash`, so the index compares whole
//! buckets with one AND and one equality before falling back to the literal
//! matcher.

/// Levels that contribute to the hash; deeper levels are only compared
/// literally
pub const HASH_LEVELS: usize = 8;

/// Hash, mask and wildcard flag computed from a topic or filter string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicHash {
    pub hash: u64,
    pub mask: u64,
    /// Set when `+` or `#` appears anywhere in the string, including beyond
    /// the hashed levels
    pub has_wildcard: bool,
}

impl TopicHash {
    /// Mask of a filter with no wildcard in its hashed levels
    pub const EXACT_MASK: u64 = u64::MAX;

    pub fn calculate(topic: &str) -> Self {
        let bytes = topic.as_bytes();
        let mut hash = 0u64;
        let mut inverse_mask = 0u64;
        let mut checksum = 0u8;
        let mut level_mask = 0u8;
        let mut fill_mask = 0u8;
        let mut level = 0;
        let mut has_wildcard = false;
        let mut pos = 0;

        while pos < bytes.len() {
            let c = bytes[pos];
            pos += 1;
            match c {
                b'/' => {
                    hash = (hash << 8) | u64::from(checksum);
                    inverse_mask = (inverse_mask << 8) | u64::from(level_mask);
                    checksum = 0;
                    level_mask = 0;
                    level += 1;
                    if level >= HASH_LEVELS {
                        break;
                    }
                }
                b'+' => {
                    has_wildcard = true;
                    level_mask = 0xFF;
                }
                b'#' => {
                    has_wildcard = true;
                    level_mask = 0xFF;
                    fill_mask = 0xFF;
                    break;
                }
                _ if c & 1 == 0 => checksum = checksum.wrapping_add(c),
                _ => checksum ^= c >> 1,
            }
        }

        if level < HASH_LEVELS {
            hash = (hash << 8) | u64::from(checksum);
            inverse_mask = (inverse_mask << 8) | u64::from(level_mask);
            level += 1;
            while level < HASH_LEVELS {
                hash <<= 8;
                inverse_mask = (inverse_mask << 8) | u64::from(fill_mask);
                level += 1;
            }
        }

        if !has_wildcard {
            has_wildcard = bytes[pos..].iter().any(|&c| c == b'+' || c == b'#');
        }

        Self {
            hash,
            mask: !inverse_mask,
            has_wildcard,
        }
    }

    /// Fast pre-filter: `false` rules a match out, `true` needs a literal check
    /// unless both strings are wildcard-free and equal
    #[inline]
    pub fn may_match(&self, topic_hash: u64) -> bool {
        topic_hash & self.mask == self.hash
    }
}
