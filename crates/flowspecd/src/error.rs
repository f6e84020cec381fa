//! Error types for flowspecd
//!
//! Errors are split by how the reconciliation loop treats them:
//! - [`RouteParseError`] and [`CompileError`] are scoped to one route block;
//!   the block is skipped and the tick continues.
//! - [`FetchError`] skips the whole tick without touching kernel state.
//! - [`ApplyError`] is fatal: the daemon exits instead of running on with
//!   kernel state of unknown composition.

use flowspec_types::FlowAction;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure to parse one route block of the routing daemon's dump.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteParseError {
    /// Block does not start with a `flow4`/`flow6` header
    #[error("invalid route header: {0:?}")]
    InvalidHeader(String),

    /// A recognized match key carried a value that does not parse
    #[error("invalid match attribute '{0}'")]
    InvalidMatchAttr(String),

    /// The bracketed session group is not `name date from address`
    #[error("invalid session attributes: {0}")]
    InvalidSessionAttr(String),

    /// The extended community group is missing or malformed
    #[error("invalid community string: {0}")]
    InvalidCommunity(String),

    /// The community carries an action code outside RFC 8955
    #[error("unsupported flowspec action: {0:#x}")]
    UnsupportedAction(i64),
}

/// Failure to compile a parsed route into a rule program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unsupported action type: {0}")]
    UnsupportedAction(FlowAction),

    #[error("negative rate argument: {0}")]
    NegativeArgument(i64),
}

/// Failure to read routes from the routing daemon.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("route query timed out after {0:?}")]
    Timeout(Duration),

    #[error("route query cancelled")]
    Cancelled,

    #[error("route socket error: {0}")]
    Io(#[from] io::Error),

    /// The routing daemon answered with an error reply code
    #[error("route query rejected: {0}")]
    Rejected(String),
}

/// Failure talking to the kernel packet filter.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to execute '{command}': {source}")]
    Exec {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed (exit code {exit_code}): {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("nftables JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Expression program has no nftables rendering
    #[error("unsupported expression program: {0}")]
    Unsupported(String),
}

/// Failure to atomically replace the installed rule set.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to commit {rules} rules to {table}/{chain}: {source}")]
    Commit {
        table: String,
        chain: String,
        rules: usize,
        #[source]
        source: GatewayError,
    },
}

/// Top-level daemon error
#[derive(Debug, Error)]
pub enum FlowspecError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Filter gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for flowspecd operations
pub type Result<T> = std::result::Result<T, FlowspecError>;
