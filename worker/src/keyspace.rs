//! Keyspace arithmetic: splitting an assignment across devices and
//! drawing filler keys for padded submissions.

use std::collections::HashSet;

use num_bigint::BigUint;
use rand::RngCore;
use shared::types::{KeyRange, PrivateKey};

/// Split `[start, end)` into `parts` contiguous sub-ranges. The last
/// segment absorbs the rounding remainder so the union is exact. A
/// degenerate request (single part, empty range) returns the input
/// range unchanged rather than failing.
pub fn split_keyspace(range: &KeyRange, parts: usize) -> Vec<KeyRange> {
    if parts <= 1 || range.end <= range.start {
        return vec![range.clone()];
    }
    let length = range.span();
    let parts_big = BigUint::from(parts);
    let mut segments = Vec::with_capacity(parts);
    for i in 0..parts {
        let lo = &range.start + (&length * BigUint::from(i)) / &parts_big;
        let hi = if i == parts - 1 {
            range.end.clone()
        } else {
            &range.start + (&length * BigUint::from(i + 1)) / &parts_big
        };
        segments.push(KeyRange {
            start: lo,
            end: hi,
        });
    }
    segments
}

/// Uniform random keys inside `range`, excluding anything already held.
/// Best-effort: gives up after a bounded number of draws rather than
/// spinning on a tiny range.
pub fn generate_filler_keys(count: usize, range: &KeyRange, exclude: &[PrivateKey]) -> Vec<PrivateKey> {
    let span = range.span();
    if span == BigUint::from(0u32) || count == 0 {
        return vec![];
    }
    let exclude: HashSet<&str> = exclude.iter().map(PrivateKey::as_str).collect();

    let mut rng = rand::thread_rng();
    let mut out: Vec<PrivateKey> = vec![];
    let mut attempts = 0usize;
    while out.len() < count && attempts < count * 100 {
        attempts += 1;
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let val = &range.start + BigUint::from_bytes_be(&bytes) % &span;
        let hex = format!("{:0>64}", val.to_str_radix(16)).to_uppercase();
        if exclude.contains(hex.as_str()) || out.iter().any(|k| k.as_str() == hex) {
            continue;
        }
        out.push(PrivateKey::from_canonical(hex));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> KeyRange {
        KeyRange {
            start: BigUint::from(start),
            end: BigUint::from(end),
        }
    }

    #[test]
    fn segments_are_contiguous_and_total() {
        let r = range(0x1000, 0x1000 + 1001);
        let segs = split_keyspace(&r, 4);
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0].start, r.start);
        assert_eq!(segs[3].end, r.end);
        for w in segs.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }
        let total: BigUint = segs.iter().map(KeyRange::span).sum();
        assert_eq!(total, r.span());
    }

    #[test]
    fn last_segment_absorbs_remainder() {
        let r = range(0, 10);
        let segs = split_keyspace(&r, 3);
        assert_eq!(segs[0].span(), BigUint::from(3u32));
        assert_eq!(segs[1].span(), BigUint::from(3u32));
        assert_eq!(segs[2].span(), BigUint::from(4u32));
    }

    #[test]
    fn degenerate_inputs_return_single_range() {
        let r = range(5, 100);
        assert_eq!(split_keyspace(&r, 1), vec![r.clone()]);
        assert_eq!(split_keyspace(&r, 0), vec![r.clone()]);
        let empty = range(100, 100);
        assert_eq!(split_keyspace(&empty, 8), vec![empty.clone()]);
        let inverted = range(100, 5);
        assert_eq!(split_keyspace(&inverted, 8), vec![inverted.clone()]);
    }

    #[test]
    fn fillers_stay_in_range_and_respect_exclusions() {
        let r = range(0x40, 0x50);
        let exclude: Vec<PrivateKey> = (0x40u64..0x48)
            .map(|v| PrivateKey::from_canonical(format!("{v:0>64X}")))
            .collect();
        let fillers = generate_filler_keys(4, &r, &exclude);
        assert_eq!(fillers.len(), 4);
        let mut seen = HashSet::new();
        for key in &fillers {
            assert_eq!(key.as_str().len(), 64);
            let val = BigUint::parse_bytes(key.as_str().as_bytes(), 16).unwrap();
            assert!(val >= r.start && val < r.end);
            assert!(!exclude.iter().any(|e| e.as_str() == key.as_str()));
            assert!(seen.insert(key.as_str().to_string()));
        }
    }

    #[test]
    fn fillers_empty_on_degenerate_range() {
        assert!(generate_filler_keys(5, &range(10, 10), &[]).is_empty());
        assert!(generate_filler_keys(0, &range(10, 20), &[]).is_empty());
    }
}
