//! Kernel packet filter abstraction
//!
//! The reconciliation loop and the counter poller only talk to the kernel
//! through [`FilterGateway`], which lets tests drive them with an in-memory
//! fake.

use crate::error::GatewayError;
use crate::expr::{ChainId, CompiledRule, TableFamily};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One operation of a filter transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Delete every rule in the chain
    FlushChain(ChainId),
    /// Append a rule to the end of the chain
    AddRule(ChainId, CompiledRule),
}

/// Ordered list of operations committed as one atomic transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch that replaces the chain contents with `rules`, in order.
    pub fn replace_chain(chain: &ChainId, rules: &[CompiledRule]) -> Self {
        let mut batch = Self::new();
        batch.flush_chain(chain.clone());
        for rule in rules {
            batch.add_rule(chain.clone(), rule.clone());
        }
        batch
    }

    pub fn flush_chain(&mut self, chain: ChainId) {
        self.ops.push(BatchOp::FlushChain(chain));
    }

    pub fn add_rule(&mut self, chain: ChainId, rule: CompiledRule) {
        self.ops.push(BatchOp::AddRule(chain, rule));
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A rule as listed back from the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRule {
    pub handle: u64,
}

/// A named counter and its current values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterObject {
    pub name: String,
    pub packets: u64,
    pub bytes: u64,
}

/// A named stateful object in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelObject {
    Counter(CounterObject),
    /// Quotas, limits, sets and anything else the daemon does not read
    Other { kind: String, name: String },
}

/// Access to the kernel packet filter.
#[async_trait]
pub trait FilterGateway: Send + Sync {
    /// Create the table if it does not exist.
    async fn ensure_table(&self, family: TableFamily, table: &str) -> Result<(), GatewayError>;

    /// Create the chain (and its table) if it does not exist.
    async fn ensure_chain(&self, chain: &ChainId) -> Result<(), GatewayError>;

    /// List the rules currently installed in the chain.
    async fn list_rules(&self, chain: &ChainId) -> Result<Vec<InstalledRule>, GatewayError>;

    /// Apply every operation of the batch, or none of them.
    async fn commit(&self, batch: Batch) -> Result<(), GatewayError>;

    /// Create named counters in the table; existing ones are kept.
    async fn add_counters(
        &self,
        family: TableFamily,
        table: &str,
        names: &[&str],
    ) -> Result<(), GatewayError>;

    /// List the named stateful objects of the table.
    async fn list_objects(
        &self,
        family: TableFamily,
        table: &str,
    ) -> Result<Vec<KernelObject>, GatewayError>;
}
