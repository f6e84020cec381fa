//! Common types for BGP flowspec route handling.
//!
//! This crate provides the value types shared by the flowspec daemon:
//!
//! - [`IpPrefix`]: IPv4/IPv6 network prefixes (CIDR notation, host bits masked)
//! - [`FlowAction`]: RFC 8955 traffic filtering action codes
//! - [`Route`]: a flowspec route as announced by the routing daemon, split into
//!   [`SessionAttrs`] and [`MatchAttrs`]

mod ip;
mod route;

pub use ip::IpPrefix;
pub use route::{FlowAction, MatchAttrs, Route, SessionAttrs};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("unknown flowspec action code: {0:#x}")]
    UnknownAction(i64),
}
