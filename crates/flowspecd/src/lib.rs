//! BIRD flowspec to nftables daemon
//!
//! flowspecd reads BGP flowspec routes (RFC 8955) from the BIRD control
//! socket and keeps an nftables chain in sync with them. Rate actions become
//! over-rate `limit` + `drop` rules, a zero rate becomes a plain `drop`.
//!
//! # Architecture
//!
//! ```text
//! +-------------+  show route   +---------------------------+  nft -j -f -  +-----------+
//! |    BIRD     |-------------->|        Reconciler         |-------------->|  nftables |
//! | bird.ctl    |   route dump  | parser -> compiler        |  flush + add  | inet      |
//! +-------------+               |   -> checksum -> Batch    |               | filter    |
//!                               +---------------------------+               | flowspec  |
//!                                                                           +-----------+
//!                               +---------------------------+  nft -j list        |
//!                               |       CounterPoller       |<--------------------+
//!                               +---------------------------+
//!                                            |
//!                                            v
//!                                  /metrics (Prometheus)
//! ```
//!
//! Each tick is independent: routes and compiled rules are rebuilt from
//! scratch, and only the checksum of the last applied rule set survives
//! between ticks.

pub mod bird;
pub mod checksum;
pub mod compiler;
pub mod config;
pub mod counters;
pub mod error;
pub mod expr;
pub mod gateway;
pub mod metrics;
pub mod metrics_server;
pub mod nft;
pub mod parser;
pub mod reconcile;

pub use bird::{BirdSocket, RouteSource, ROUTE_QUERY};
pub use checksum::{digest, Checksum};
pub use compiler::compile;
pub use config::{Cli, DaemonConfig};
pub use counters::{provision_counters, CounterPoller, FLOWSPEC_COUNTERS};
pub use error::{
    ApplyError, CompileError, FetchError, FlowspecError, GatewayError, Result, RouteParseError,
};
pub use expr::{ChainId, CompiledRule, CompiledRuleSet, Expression, TableFamily};
pub use gateway::{Batch, BatchOp, CounterObject, FilterGateway, InstalledRule, KernelObject};
pub use metrics::MetricsCollector;
pub use metrics_server::start_metrics_server;
pub use nft::NftGateway;
pub use parser::{parse_route, split_blocks};
pub use reconcile::{Reconciler, TickOutcome};

pub use flowspec_types::{FlowAction, IpPrefix, MatchAttrs, Route, SessionAttrs};
