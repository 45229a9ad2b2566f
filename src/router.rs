//! Shard routing and fixed-width field handling
//!
//! Placement must agree between every process attached to a segment, so the
//! hash is a plain djb2 with no per-process seed.

/// Initial djb2 state
pub const HASH_SEED: u64 = 5381;

/// djb2 multiplier
pub const HASH_MULTIPLIER: u64 = 33;

/// Hash a key with djb2, stopping at the first NUL byte
#[inline]
pub fn hash(key: &[u8]) -> u64 {
    until_nul(key).iter().fold(HASH_SEED, |hash, &byte| {
        hash.wrapping_mul(HASH_MULTIPLIER).wrapping_add(byte as u64)
    })
}

/// Map a key to a shard index in `[0, shards)`
///
/// Callers pass the normalized key (see [`fixed_width`]) so that an oversized
/// key lands in the same shard as the truncated copy that gets stored.
#[inline]
pub fn shard_of(key: &[u8], shards: u32) -> u32 {
    debug_assert!(shards > 0);
    (hash(key) % shards as u64) as u32
}

/// Copy `input` into a zero-padded field of exactly `width` bytes
///
/// Returns the field and whether `input` had to be truncated.
pub fn fixed_width(input: &[u8], width: usize) -> (Vec<u8>, bool) {
    let mut field = vec![0u8; width];
    let len = input.len().min(width);
    field[..len].copy_from_slice(&input[..len]);
    (field, input.len() > width)
}

/// The prefix of `field` before its first NUL byte
#[inline]
pub fn until_nul(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_djb2() {
        assert_eq!(hash(b""), 5381);
        assert_eq!(hash(b"a"), 5381 * 33 + 97);
        assert_eq!(hash(b"ab"), (5381 * 33 + 97) * 33 + 98);
    }

    #[test]
    fn test_hash_ignores_padding() {
        let (padded, truncated) = fixed_width(b"key", 32);
        assert!(!truncated);
        assert_eq!(hash(&padded), hash(b"key"));
        assert_eq!(shard_of(&padded, 256), shard_of(b"key", 256));
    }

    #[test]
    fn test_long_keys_wrap_without_panicking() {
        let key = vec![b'z'; 4096];
        let shard = shard_of(&key, 7);
        assert!(shard < 7);
        assert_eq!(shard, shard_of(&key, 7));
    }

    #[test]
    fn test_shard_in_range() {
        for shards in [1u32, 2, 3, 4, 255, 256] {
            for key in [&b"aaaa"[..], b"bbbb", b"", b"\xff\xfe"] {
                assert!(shard_of(key, shards) < shards);
            }
        }
    }

    #[test]
    fn test_fixed_width_truncates_and_pads() {
        let (field, truncated) = fixed_width(b"abcdef", 4);
        assert_eq!(field, b"abcd");
        assert!(truncated);

        let (field, truncated) = fixed_width(b"ab", 4);
        assert_eq!(field, b"ab\0\0");
        assert!(!truncated);
    }

    #[test]
    fn test_until_nul() {
        assert_eq!(until_nul(b"1111"), b"1111");
        assert_eq!(until_nul(b"11\0\0"), b"11");
        assert_eq!(until_nul(b"\0abc"), b"");
    }
}
