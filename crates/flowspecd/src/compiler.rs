//! Flowspec route to nf_tables expression compiler
//!
//! Emission order is fixed: source prefix, destination prefix, transport
//! protocol, source port, destination port, then the action tail. The output
//! depends only on the route and the counter flag.

use crate::counters::{COUNTER_FLOWSPEC_DROPPED, COUNTER_FLOWSPEC_LIMIT_MATCHED};
use crate::error::CompileError;
use crate::expr::{
    CmpOp, CompiledRule, Expression, LimitType, LimitUnit, MetaKey, ObjectType, PayloadBase,
    REG_1, VerdictKind,
};
use flowspec_types::{FlowAction, IpPrefix, Route};

/// Offset of the source address in the IPv4 header
const IPV4_SADDR_OFFSET: u32 = 12;
const IPV4_DADDR_OFFSET: u32 = 16;
/// Offset of the source address in the IPv6 header
const IPV6_SADDR_OFFSET: u32 = 8;
const IPV6_DADDR_OFFSET: u32 = 24;

const SPORT_OFFSET: u32 = 0;
const DPORT_OFFSET: u32 = 2;
const PORT_LEN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Source,
    Destination,
}

/// Compile a route into a rule.
///
/// `enable_counter` adds named counter references; those counters must
/// already exist in the table (see [`crate::counters`]).
pub fn compile(route: &Route, enable_counter: bool) -> Result<CompiledRule, CompileError> {
    Ok(CompiledRule::new(compile_exprs(route, enable_counter)?))
}

/// Compile a route into its expression program.
pub fn compile_exprs(route: &Route, enable_counter: bool) -> Result<Vec<Expression>, CompileError> {
    let limit_type = match route.action {
        FlowAction::RateBytes => LimitType::Bytes,
        FlowAction::RatePackets => LimitType::Packets,
        other => return Err(CompileError::UnsupportedAction(other)),
    };
    if route.argument < 0 {
        return Err(CompileError::NegativeArgument(route.argument));
    }

    let mut exprs = Vec::new();
    let matches = &route.matches;

    if let Some(prefix) = &matches.source {
        push_prefix_match(&mut exprs, prefix, Direction::Source);
    }
    if let Some(prefix) = &matches.destination {
        push_prefix_match(&mut exprs, prefix, Direction::Destination);
    }

    if matches.protocol != 0 {
        exprs.push(Expression::MetaMatch {
            key: MetaKey::L4Proto,
            register: REG_1,
        });
        exprs.push(Expression::Compare {
            register: REG_1,
            op: CmpOp::Eq,
            data: vec![matches.protocol],
        });
    }

    if matches.source_port != 0 {
        push_port_match(&mut exprs, matches.source_port, Direction::Source);
    }
    if matches.destination_port != 0 {
        push_port_match(&mut exprs, matches.destination_port, Direction::Destination);
    }

    if route.argument > 0 {
        if enable_counter {
            push_counter(&mut exprs, COUNTER_FLOWSPEC_LIMIT_MATCHED);
        }
        // Fires only for traffic above the rate; the rest falls through to
        // the chain policy.
        exprs.push(Expression::RateLimit {
            limit_type,
            rate: route.argument as u64,
            unit: LimitUnit::Second,
            over: true,
        });
    }
    push_drop(&mut exprs, enable_counter);

    Ok(exprs)
}

fn push_prefix_match(exprs: &mut Vec<Expression>, prefix: &IpPrefix, direction: Direction) {
    let len = prefix.byte_len() as u32;
    let offset = match (len, direction) {
        (4, Direction::Source) => IPV4_SADDR_OFFSET,
        (4, Direction::Destination) => IPV4_DADDR_OFFSET,
        (_, Direction::Source) => IPV6_SADDR_OFFSET,
        (_, Direction::Destination) => IPV6_DADDR_OFFSET,
    };

    exprs.push(Expression::PayloadLoad {
        base: PayloadBase::NetworkHeader,
        offset,
        len,
        dest_register: REG_1,
    });
    exprs.push(Expression::BitwiseMask {
        source_register: REG_1,
        dest_register: REG_1,
        len,
        mask: prefix.mask_bytes(),
        xor: vec![0; len as usize],
    });
    exprs.push(Expression::Compare {
        register: REG_1,
        op: CmpOp::Eq,
        data: prefix.network_bytes(),
    });
}

fn push_port_match(exprs: &mut Vec<Expression>, port: u16, direction: Direction) {
    let offset = match direction {
        Direction::Source => SPORT_OFFSET,
        Direction::Destination => DPORT_OFFSET,
    };

    exprs.push(Expression::PayloadLoad {
        base: PayloadBase::TransportHeader,
        offset,
        len: PORT_LEN,
        dest_register: REG_1,
    });
    exprs.push(Expression::Compare {
        register: REG_1,
        op: CmpOp::Eq,
        data: port.to_be_bytes().to_vec(),
    });
}

fn push_counter(exprs: &mut Vec<Expression>, name: &str) {
    exprs.push(Expression::CounterRef {
        object_type: ObjectType::Counter,
        name: name.to_string(),
    });
    exprs.push(Expression::Counter {
        packets: 0,
        bytes: 0,
    });
}

fn push_drop(exprs: &mut Vec<Expression>, enable_counter: bool) {
    if enable_counter {
        push_counter(exprs, COUNTER_FLOWSPEC_DROPPED);
    }
    exprs.push(Expression::Verdict {
        kind: VerdictKind::Drop,
    });
}
