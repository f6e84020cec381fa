//! Flowspec route model.

use crate::{IpPrefix, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Traffic filtering action carried in a BGP extended community (RFC 8955).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum FlowAction {
    /// traffic-rate-bytes: 2-byte AS, 4-byte float (bytes per second)
    RateBytes = 0x8006,
    /// traffic-action: bitmask (terminal/sample)
    TrafficAction = 0x8007,
    /// redirect: 6-byte route target
    Redirect = 0x8008,
    /// traffic-marking: DSCP value
    TrafficMarking = 0x8009,
    /// traffic-rate-packets: 2-byte AS, 4-byte float (packets per second)
    RatePackets = 0x800c,
}

impl FlowAction {
    /// Map an extended community type code to an action.
    pub fn from_code(code: i64) -> Result<Self, ParseError> {
        match code {
            0x8006 => Ok(Self::RateBytes),
            0x8007 => Ok(Self::TrafficAction),
            0x8008 => Ok(Self::Redirect),
            0x8009 => Ok(Self::TrafficMarking),
            0x800c => Ok(Self::RatePackets),
            other => Err(ParseError::UnknownAction(other)),
        }
    }

    /// Whether the action carries a rate argument.
    pub const fn is_rate(&self) -> bool {
        matches!(self, Self::RateBytes | Self::RatePackets)
    }
}

impl fmt::Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RateBytes => "traffic-rate-bytes",
            Self::TrafficAction => "traffic-action",
            Self::Redirect => "redirect",
            Self::TrafficMarking => "traffic-marking",
            Self::RatePackets => "traffic-rate-packets",
        };
        f.write_str(name)
    }
}

/// BGP session the route was learned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttrs {
    pub session_name: String,
    pub neighbor_address: IpAddr,
    /// Import timestamp as printed by the routing daemon
    pub import_time: String,
}

/// Packet match criteria. Zero ports/protocol and absent prefixes mean "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchAttrs {
    pub source: Option<IpPrefix>,
    pub destination: Option<IpPrefix>,
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
}

/// A flowspec route: what to match and what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub session: SessionAttrs,
    pub matches: MatchAttrs,
    pub action: FlowAction,
    /// Rate in bytes or packets per second for rate actions; 0 means drop
    pub argument: i64,
}
