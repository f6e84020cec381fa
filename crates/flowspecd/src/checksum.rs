//! Rule set fingerprinting
//!
//! The loop compares the digest of the freshly compiled rule set against the
//! digest of the last successful apply and skips the kernel round-trip when
//! they match.

use crate::expr::CompiledRuleSet;
use md5::{Digest, Md5};
use std::fmt;

/// MD5 fingerprint of a compiled rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum([u8; 16]);

impl Checksum {
    /// Never produced by [`digest`]; forces the next comparison to differ.
    pub const ZERO: Checksum = Checksum([0; 16]);

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::LowerHex for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(self, f)
    }
}

/// Compute the fingerprint of a rule set.
///
/// Each rule is serialized to JSON, the serialized bytes are sorted, and the
/// sorted buffer is hashed. The per-rule sums are then serialized as a list
/// and hashed again, so rule order is significant.
///
/// Sorting the bytes makes two rules whose serializations are permutations
/// of each other collide. A change of that shape goes unnoticed until some
/// other change (or a count mismatch with the kernel) triggers an apply.
pub fn digest(rule_set: &CompiledRuleSet) -> Checksum {
    let sums: Vec<[u8; 16]> = rule_set
        .rules
        .iter()
        .map(|rule| {
            // Serializing plain data into a Vec cannot fail.
            let mut bytes = serde_json::to_vec(rule).unwrap_or_default();
            bytes.sort_unstable();
            md5_sum(&bytes)
        })
        .collect();

    let list = serde_json::to_vec(&sums).unwrap_or_default();
    Checksum(md5_sum(&list))
}

fn md5_sum(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{
        ChainId, CmpOp, CompiledRule, Expression, TableFamily, VerdictKind, REG_1,
    };
    use pretty_assertions::assert_eq;

    fn chain() -> ChainId {
        ChainId::new(TableFamily::Inet, "filter", "flowspec")
    }

    fn rule(proto: u8) -> CompiledRule {
        CompiledRule::new(vec![
            Expression::Compare {
                register: REG_1,
                op: CmpOp::Eq,
                data: vec![proto],
            },
            Expression::Verdict {
                kind: VerdictKind::Drop,
            },
        ])
    }

    fn set_of(rules: Vec<CompiledRule>) -> CompiledRuleSet {
        let mut set = CompiledRuleSet::new(chain());
        for r in rules {
            set.push(r);
        }
        set
    }

    #[test]
    fn test_stable_across_calls() {
        let set = set_of(vec![rule(6), rule(17)]);
        assert_eq!(digest(&set), digest(&set.clone()));
        assert!(!digest(&set).is_zero());
    }

    #[test]
    fn test_order_matters() {
        let a = set_of(vec![rule(6), rule(17)]);
        let b = set_of(vec![rule(17), rule(6)]);
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn test_content_change() {
        let a = set_of(vec![rule(6)]);
        let b = set_of(vec![rule(7)]);
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn test_empty_set() {
        let empty = digest(&set_of(vec![]));
        // md5("[]")
        assert_eq!(format!("{:x}", empty), "d751713988987e9331980363e24189ce");
        assert_ne!(empty, Checksum::ZERO);
        assert_ne!(empty, digest(&set_of(vec![rule(6)])));
    }

    #[test]
    fn test_chain_not_part_of_digest() {
        let mut other = CompiledRuleSet::new(ChainId::new(TableFamily::Inet, "raw", "ddos"));
        other.push(rule(6));
        assert_eq!(digest(&other), digest(&set_of(vec![rule(6)])));
    }

    #[test]
    fn test_byte_permutation_collides() {
        // `[16]` and `[61]` serialize to the same bytes in a different order
        let a = set_of(vec![rule(16)]);
        let b = set_of(vec![rule(61)]);
        assert_ne!(a, b);
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn test_hex_display() {
        let hex = Checksum::ZERO.to_string();
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c == '0'));
    }
}
