use std::fmt::Write as _;

/// Short hex id for an upstream URI: the first 8 bytes of its 128-bit
/// digest. Collisions within one live playlist window are vanishingly
/// unlikely; a colliding lookup resolves to the earlier entry and later
/// references fail benignly.
pub fn short_hash(s: &str) -> String {
    let digest = md5::compute(s.as_bytes());
    let mut out = String::with_capacity(16);
    for b in &digest.0[..8] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Random id for a freshly-seen client.
pub fn gen_user_id() -> String {
    let bytes: [u8; 8] = rand::random();
    let mut out = String::with_capacity(16);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_stable_and_short() {
        let a = short_hash("http://example.com/live/seg-1.ts");
        let b = short_hash("http://example.com/live/seg-1.ts");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, short_hash("http://example.com/live/seg-2.ts"));
    }

    #[test]
    fn user_ids_are_unique_enough() {
        let a = gen_user_id();
        let b = gen_user_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
