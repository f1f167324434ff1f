use std::fmt::{Display, Formatter};

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Opaque address identifier. Matched case-sensitively against the
/// configured target set.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit private key, canonically 64 uppercase hex characters without
/// a `0x` prefix.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    /// Normalize a raw hex string into the canonical form. Accepts any
    /// mix of case, embedded spaces and `0x` prefixes; anything that is
    /// not exactly 64 hex digits after cleanup is rejected.
    pub fn parse(raw: &str) -> Option<PrivateKey> {
        let cleaned = raw.trim().replace(' ', "").replace("0x", "");
        if cleaned.len() != 64 || !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(PrivateKey(cleaned.to_uppercase()))
    }

    /// Build from an already-canonical 64-char uppercase hex string.
    pub fn from_canonical(hex: String) -> PrivateKey {
        debug_assert!(hex.len() == 64);
        PrivateKey(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PrivateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open keyspace range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: BigUint,
    pub end: BigUint,
}

impl KeyRange {
    pub fn from_hex(start: &str, end: &str) -> Option<KeyRange> {
        let start = BigUint::parse_bytes(strip_0x(start).as_bytes(), 16)?;
        let end = BigUint::parse_bytes(strip_0x(end).as_bytes(), 16)?;
        Some(KeyRange {
            start,
            end,
        })
    }

    pub fn start_hex(&self) -> String {
        self.start.to_str_radix(16)
    }

    pub fn end_hex(&self) -> String {
        self.end.to_str_radix(16)
    }

    /// `start:end` identifier used by the search program and for
    /// detecting assignment changes.
    pub fn keyspace(&self) -> String {
        format!("{}:{}", self.start_hex(), self.end_hex())
    }

    pub fn span(&self) -> BigUint {
        if self.end <= self.start {
            return BigUint::from(0u32);
        }
        &self.end - &self.start
    }
}

impl Display for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.keyspace())
    }
}

fn strip_0x(s: &str) -> String {
    s.trim().trim_start_matches("0x").to_string()
}

/// One pool-issued work unit: target addresses plus the keyspace to
/// brute-force. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct BlockAssignment {
    pub addresses: Vec<Address>,
    pub range: KeyRange,
}

impl BlockAssignment {
    pub fn keyspace(&self) -> String {
        self.range.keyspace()
    }
}

/// A key that hit one of the locally configured target addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPair {
    pub address: Address,
    pub key: PrivateKey,
}

/// Which external search program produces the output we parse. Decided
/// once at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// VanitySearch classic: labeled address/key lines, key on one line.
    Vanity,
    /// VanitySearch v2/v3: key hex may continue across multiple lines.
    VanityV2,
    /// BitCrack: stateless `<address> <hex>` lines.
    BitCrack,
}

impl ProgramKind {
    /// Loose matching on the configured program name, mirroring what
    /// operators actually put in their settings files.
    pub fn from_name(name: &str) -> ProgramKind {
        let n = name.trim().to_lowercase();
        let n = n.split('|').next().unwrap_or("").trim().to_string();
        if n.contains("bitcrack") {
            ProgramKind::BitCrack
        } else if n.contains("vanitysearch-v2") || n.contains("vanitysearch-v3") || n == "v2" {
            ProgramKind::VanityV2
        } else {
            ProgramKind::Vanity
        }
    }

    /// VanitySearch variants need an explicit `-gpuId` selector per
    /// device; BitCrack picks its device from the environment.
    pub fn needs_device_flag(&self) -> bool {
        matches!(self, ProgramKind::Vanity | ProgramKind::VanityV2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_key_normalization() {
        let k = PrivateKey::parse("0xab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12cd34ef56ab12").unwrap();
        assert_eq!(k.as_str().len(), 64);
        assert!(k.as_str().chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert!(PrivateKey::parse("abcd").is_none());
        assert!(PrivateKey::parse("").is_none());
        // 63 chars
        assert!(PrivateKey::parse(&"a".repeat(63)).is_none());
        // non-hex
        assert!(PrivateKey::parse(&"g".repeat(64)).is_none());
    }

    #[test]
    fn key_range_hex_round_trip() {
        let r = KeyRange::from_hex("0x100", "200").unwrap();
        assert_eq!(r.start_hex(), "100");
        assert_eq!(r.end_hex(), "200");
        assert_eq!(r.keyspace(), "100:200");
        assert_eq!(r.span(), BigUint::from(0x100u32));
    }

    #[test]
    fn program_kind_from_name() {
        assert_eq!(ProgramKind::from_name("vanity"), ProgramKind::Vanity);
        assert_eq!(ProgramKind::from_name("VanitySearch | cuda"), ProgramKind::Vanity);
        assert_eq!(ProgramKind::from_name("vanitysearch-v2"), ProgramKind::VanityV2);
        assert_eq!(ProgramKind::from_name("BitCrack"), ProgramKind::BitCrack);
        assert!(!ProgramKind::from_name("bitcrack").needs_device_flag());
    }
}
