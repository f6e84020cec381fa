//! Packet filter expression programs
//!
//! An [`Expression`] is one operation of the nf_tables register machine. A
//! [`CompiledRule`] is an ordered program equivalent to one kernel rule, and a
//! [`CompiledRuleSet`] binds the programs of one reconciliation tick to the
//! table/chain they are installed in.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Register every compiled expression loads into and compares from.
pub const REG_1: u32 = 1;

/// Header a payload offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadBase {
    NetworkHeader,
    TransportHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
}

/// Packet metadata keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaKey {
    /// Transport protocol number (`meta l4proto`)
    L4Proto,
}

/// What a rate limit counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    Packets,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitUnit {
    Second,
}

impl LimitUnit {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
        }
    }
}

/// Kinds of stateful named objects an expression can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictKind {
    Drop,
}

/// One operation of a packet filter program.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    /// Load `len` bytes at `offset` of `base` into `dest_register`
    PayloadLoad {
        base: PayloadBase,
        offset: u32,
        len: u32,
        dest_register: u32,
    },
    /// `dest = (src & mask) ^ xor`
    BitwiseMask {
        source_register: u32,
        dest_register: u32,
        len: u32,
        mask: Vec<u8>,
        xor: Vec<u8>,
    },
    /// Stop evaluating the rule unless `register op data` holds
    Compare {
        register: u32,
        op: CmpOp,
        data: Vec<u8>,
    },
    /// Load packet metadata into `register`
    MetaMatch { key: MetaKey, register: u32 },
    /// Match when traffic exceeds (`over`) or stays within the rate
    RateLimit {
        limit_type: LimitType,
        rate: u64,
        unit: LimitUnit,
        over: bool,
    },
    /// Select a named stateful object for the following statement
    CounterRef { object_type: ObjectType, name: String },
    /// Count packets and bytes
    Counter { packets: u64, bytes: u64 },
    Verdict { kind: VerdictKind },
}

/// One compiled rule: an ordered expression program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompiledRule {
    pub exprs: Vec<Expression>,
}

impl CompiledRule {
    pub fn new(exprs: Vec<Expression>) -> Self {
        Self { exprs }
    }

    /// Whether the program contains a rate limit.
    pub fn is_rate_limited(&self) -> bool {
        self.exprs
            .iter()
            .any(|e| matches!(e, Expression::RateLimit { .. }))
    }
}

/// Address family of an nftables table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableFamily {
    Inet,
}

impl TableFamily {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inet => "inet",
        }
    }
}

impl fmt::Display for TableFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the chain the daemon owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId {
    pub family: TableFamily,
    pub table: String,
    pub chain: String,
}

impl ChainId {
    pub fn new(family: TableFamily, table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            family,
            table: table.into(),
            chain: chain.into(),
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.family, self.table, self.chain)
    }
}

/// All rules compiled in one tick, in installation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledRuleSet {
    pub chain: ChainId,
    pub rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn new(chain: ChainId) -> Self {
        Self {
            chain,
            rules: Vec::new(),
        }
    }

    pub fn push(&mut self, rule: CompiledRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_set_ordering() {
        let chain = ChainId::new(TableFamily::Inet, "filter", "flowspec");
        let mut set = CompiledRuleSet::new(chain.clone());
        assert!(set.is_empty());

        set.push(CompiledRule::new(vec![Expression::Verdict {
            kind: VerdictKind::Drop,
        }]));
        set.push(CompiledRule::new(vec![Expression::MetaMatch {
            key: MetaKey::L4Proto,
            register: REG_1,
        }]));

        assert_eq!(set.len(), 2);
        assert_eq!(
            set.rules[1].exprs[0],
            Expression::MetaMatch {
                key: MetaKey::L4Proto,
                register: REG_1,
            }
        );
        assert_eq!(chain.to_string(), "inet filter flowspec");
    }

    #[test]
    fn test_rate_limited() {
        let rule = CompiledRule::new(vec![
            Expression::RateLimit {
                limit_type: LimitType::Packets,
                rate: 10,
                unit: LimitUnit::Second,
                over: true,
            },
            Expression::Verdict {
                kind: VerdictKind::Drop,
            },
        ]);
        assert!(rule.is_rate_limited());
        assert!(!CompiledRule::default().is_rate_limited());
    }
}
