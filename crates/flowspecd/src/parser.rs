//! Parser for BIRD `show route ... all` flowspec output
//!
//! A route block looks like:
//!
//! ```text
//! flow4 { dst 203.0.113.0/24; next header 6; dport 80; } [flowspec1 2024-05-01 from 192.0.2.1] * (100) [AS65000i]
//! 	Type: BGP univ
//! 	BGP.origin: IGP
//! 	BGP.ext_community: (generic, 0x80060000, 0x4ac80000)
//! ```
//!
//! Session, match and community attributes are each extracted by their own
//! delimiter pair, so their relative order in the text does not matter.

use crate::error::RouteParseError;
use flowspec_types::{FlowAction, IpPrefix, MatchAttrs, Route, SessionAttrs};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use tracing::warn;

/// Start of a route block: the family marker followed by the match group.
static BLOCK_START_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"flow[46]\s*\{").expect("Invalid regex pattern"));

/// BIRD reply code prefix on the first line of a block (e.g. `1007-`)
static REPLY_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}[- ]").expect("Invalid regex pattern"));

/// Both spellings BIRD uses for the extended community attribute.
const COMMUNITY_LABELS: [&str; 2] = ["BGP.ext_community: (", "bgp_ext_community: ("];

/// The AS half of the community high word, printed after the type code.
const COMMUNITY_SUFFIX: &str = "0000";

/// Split a route dump into route blocks.
///
/// Each block starts at a `flow4 {` / `flow6 {` marker and runs up to the
/// next marker. Anything before the first marker (greeting and table header
/// lines) is dropped. A `flow` substring elsewhere, such as in a session
/// named `flowspec1`, does not start a block.
pub fn split_blocks(text: &str) -> Vec<&str> {
    let starts: Vec<usize> = BLOCK_START_RE.find_iter(text).map(|m| m.start()).collect();

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(text.len());
            &text[start..end]
        })
        .collect()
}

/// Parse one route block into a [`Route`].
///
/// The block may start with `flow4`/`flow6` or, as produced by splitting on
/// the literal `flow`, with just the family digit.
pub fn parse_route(block: &str) -> Result<Route, RouteParseError> {
    let header = route_header(block)?;

    let session = parse_session_attrs(between(header, "[", "]"))?;
    let matches = parse_match_attrs(between(header, "{ ", " }"))?;

    let community = COMMUNITY_LABELS
        .iter()
        .map(|label| between(block, label, ")"))
        .find(|group| !group.is_empty())
        .unwrap_or("");
    let (action, argument) = parse_community(community)?;

    Ok(Route {
        session,
        matches,
        action,
        argument,
    })
}

/// Return the first line of a block after validating the family marker.
fn route_header(block: &str) -> Result<&str, RouteParseError> {
    let trimmed = block.trim_start();
    let first_line = trimmed.lines().next().unwrap_or("");

    let without_code = match REPLY_CODE_RE.find(first_line) {
        Some(m) => &first_line[m.end()..],
        None => first_line,
    };
    let family = without_code.strip_prefix("flow").unwrap_or(without_code);

    if family.starts_with('4') || family.starts_with('6') {
        Ok(family)
    } else {
        Err(RouteParseError::InvalidHeader(first_line.to_string()))
    }
}

/// Text between the first `left` and the next `right` after it.
///
/// Empty when `left` is absent; the whole remainder when `right` is absent.
fn between<'a>(input: &'a str, left: &str, right: &str) -> &'a str {
    match input.split_once(left) {
        Some((_, rest)) => rest.split(right).next().unwrap_or(""),
        None => "",
    }
}

/// Parse `name date from address`.
fn parse_session_attrs(input: &str) -> Result<SessionAttrs, RouteParseError> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.len() != 4 {
        return Err(RouteParseError::InvalidSessionAttr(format!(
            "expected 4 tokens, got {}",
            tokens.len()
        )));
    }

    let neighbor_address: IpAddr = tokens[3].parse().map_err(|_| {
        RouteParseError::InvalidSessionAttr(format!("invalid neighbor address {}", tokens[3]))
    })?;

    Ok(SessionAttrs {
        session_name: tokens[0].to_string(),
        import_time: tokens[1].to_string(),
        neighbor_address,
    })
}

/// Parse `key value; key value; ...` match criteria.
///
/// Multi-word keys (`next header`) are joined with `_`. Unknown keys are
/// logged and skipped.
fn parse_match_attrs(input: &str) -> Result<MatchAttrs, RouteParseError> {
    let mut attrs = MatchAttrs::default();

    for pair in input.split(';') {
        let parts: Vec<&str> = pair.split_whitespace().collect();
        let Some((value, key_parts)) = parts.split_last() else {
            continue;
        };
        if key_parts.is_empty() {
            continue;
        }
        let key = key_parts.join("_");
        let invalid = || RouteParseError::InvalidMatchAttr(key.clone());

        match key.as_str() {
            "src" => {
                attrs.source = Some(value.parse::<IpPrefix>().map_err(|_| invalid())?);
            }
            "dst" => {
                attrs.destination = Some(value.parse::<IpPrefix>().map_err(|_| invalid())?);
            }
            "sport" => {
                attrs.source_port = value.parse::<u16>().map_err(|_| invalid())?;
            }
            "dport" => {
                attrs.destination_port = value.parse::<u16>().map_err(|_| invalid())?;
            }
            "next_header" => {
                let protocol = parse_uint_auto(value).ok_or_else(invalid)?;
                attrs.protocol = u8::try_from(protocol).map_err(|_| invalid())?;
            }
            _ => {
                warn!(key = %key, value = %value, "unknown match attribute");
            }
        }
    }

    Ok(attrs)
}

/// Parse `(generic, 0xTTTT0000, 0xVVVVVVVV)` into an action and argument.
///
/// The high word carries the action type code followed by a zero AS number;
/// the low word is the 32-bit IEEE-754 rate for rate actions.
fn parse_community(input: &str) -> Result<(FlowAction, i64), RouteParseError> {
    let fields: Vec<&str> = input.split(", ").map(str::trim).collect();
    if fields.len() != 3 {
        return Err(RouteParseError::InvalidCommunity(format!(
            "expected 3 fields, got {}",
            fields.len()
        )));
    }

    let action_field = fields[1]
        .strip_suffix(COMMUNITY_SUFFIX)
        .unwrap_or(fields[1]);
    let code = parse_int_auto(action_field).ok_or_else(|| {
        RouteParseError::InvalidCommunity(format!("invalid action code {}", fields[1]))
    })?;
    let action =
        FlowAction::from_code(code).map_err(|_| RouteParseError::UnsupportedAction(code))?;

    let argument = decode_rate(fields[2]).ok_or_else(|| {
        RouteParseError::InvalidCommunity(format!("invalid argument {}", fields[2]))
    })?;
    if action.is_rate() && argument < 0 {
        return Err(RouteParseError::InvalidCommunity(format!(
            "negative rate {}",
            fields[2]
        )));
    }

    Ok((action, argument))
}

/// Largest magnitude that still fits an `i64` rate (2^63).
const MAX_RATE: f32 = 9_223_372_036_854_775_808.0;

/// Decode a hex 32-bit IEEE-754 bit pattern and truncate it toward zero.
///
/// The `0x` prefix is optional: `3f800000` is 1.0 and decodes to 1,
/// `0x4ac80000` decodes to 6553600. NaN, infinities and values outside the
/// `i64` range decode to `None`.
pub fn decode_rate(field: &str) -> Option<i64> {
    let field = field.trim();
    let hex = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    if hex.is_empty() || hex.starts_with(['+', '-']) {
        return None;
    }
    let bits = u32::from_str_radix(hex, 16).ok()?;
    let rate = f32::from_bits(bits);
    if !rate.is_finite() || rate.abs() >= MAX_RATE {
        return None;
    }
    Some(rate as i64)
}

/// Parse a signed integer, detecting the base from its prefix.
fn parse_int_auto(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = i64::try_from(parse_uint_auto(digits)?).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Parse an unsigned integer: `0x` hex, `0o`/leading-zero octal, `0b` binary,
/// otherwise decimal.
fn parse_uint_auto(s: &str) -> Option<u64> {
    let s = s.trim();
    let lower = s.to_ascii_lowercase();
    let (radix, digits) = if let Some(hex) = lower.strip_prefix("0x") {
        (16, hex)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        (2, bin)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        (8, oct)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };

    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const V4_BLOCK: &str = "flow4 { dst 203.0.113.0/24; next header 6; dport 80; } [flowspec1 2024-05-01 from 192.0.2.1] * (100) [AS65000i]
\tType: BGP univ
\tBGP.origin: IGP
\tBGP.ext_community: (generic, 0x80060000, 0x4ac80000)
";

    #[test]
    fn test_parse_ipv4_rate_route() {
        let route = parse_route(V4_BLOCK).unwrap();
        assert_eq!(route.session.session_name, "flowspec1");
        assert_eq!(route.session.import_time, "2024-05-01");
        assert_eq!(
            route.session.neighbor_address,
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            route.matches.destination,
            Some("203.0.113.0/24".parse().unwrap())
        );
        assert_eq!(route.matches.source, None);
        assert_eq!(route.matches.protocol, 6);
        assert_eq!(route.matches.destination_port, 80);
        assert_eq!(route.matches.source_port, 0);
        assert_eq!(route.action, FlowAction::RateBytes);
        assert_eq!(route.argument, 6_553_600);
    }

    #[test]
    fn test_parse_block_without_flow_prefix() {
        let stripped = V4_BLOCK.strip_prefix("flow").unwrap();
        assert_eq!(parse_route(stripped).unwrap(), parse_route(V4_BLOCK).unwrap());
    }

    #[test]
    fn test_parse_block_with_reply_code() {
        let coded = format!("1007-{}", V4_BLOCK);
        assert_eq!(parse_route(&coded).unwrap().matches.destination_port, 80);
    }

    #[test]
    fn test_parse_ipv6_route() {
        let block = "flow6 { src 2001:db8:1::/48; next header 17; sport 53; } [peer6 12:00:01.000 from 2001:db8::1] * (100) [AS65001i]
\tBGP.ext_community: (generic, 0x800c0000, 0x3f800000)
";
        let route = parse_route(block).unwrap();
        assert_eq!(route.matches.source, Some("2001:db8:1::/48".parse().unwrap()));
        assert_eq!(route.matches.protocol, 17);
        assert_eq!(route.matches.source_port, 53);
        assert_eq!(route.action, FlowAction::RatePackets);
        assert_eq!(route.argument, 1);
    }

    #[test]
    fn test_empty_input_fails() {
        assert!(matches!(
            parse_route(""),
            Err(RouteParseError::InvalidHeader(_))
        ));
        assert!(matches!(
            parse_route("Table master4:\n"),
            Err(RouteParseError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_session_token_count() {
        let three = V4_BLOCK.replace("[flowspec1 2024-05-01 from 192.0.2.1]", "[flowspec1 from 192.0.2.1]");
        assert!(matches!(
            parse_route(&three),
            Err(RouteParseError::InvalidSessionAttr(_))
        ));

        let five = V4_BLOCK.replace(
            "[flowspec1 2024-05-01 from 192.0.2.1]",
            "[flowspec1 2024-05-01 12:00 from 192.0.2.1]",
        );
        assert!(matches!(
            parse_route(&five),
            Err(RouteParseError::InvalidSessionAttr(_))
        ));

        let bad_ip = V4_BLOCK.replace("from 192.0.2.1]", "from 192.0.2.300]");
        assert!(matches!(
            parse_route(&bad_ip),
            Err(RouteParseError::InvalidSessionAttr(_))
        ));
    }

    #[test]
    fn test_unknown_match_key_is_skipped() {
        let block = V4_BLOCK.replace("dport 80;", "dport 80; tcp flags 0x2/0x2;");
        let route = parse_route(&block).unwrap();
        assert_eq!(route.matches.destination_port, 80);
    }

    #[test]
    fn test_invalid_match_values() {
        let cases = [
            ("dport 80;", "dport 70000;", "dport"),
            ("dport 80;", "sport http;", "sport"),
            ("dst 203.0.113.0/24;", "dst 203.0.113.0/40;", "dst"),
            ("dst 203.0.113.0/24;", "src banana/8;", "src"),
            ("next header 6;", "next header 300;", "next_header"),
        ];
        for (from, to, key) in cases {
            let block = V4_BLOCK.replace(from, to);
            assert_eq!(
                parse_route(&block),
                Err(RouteParseError::InvalidMatchAttr(key.to_string())),
                "{}",
                to
            );
        }
    }

    #[test]
    fn test_protocol_base_detection() {
        let block = V4_BLOCK.replace("next header 6;", "next header 0x11;");
        assert_eq!(parse_route(&block).unwrap().matches.protocol, 17);
    }

    #[test]
    fn test_alternate_community_label() {
        let block = V4_BLOCK.replace("BGP.ext_community", "bgp_ext_community");
        assert_eq!(parse_route(&block).unwrap().argument, 6_553_600);
    }

    #[test]
    fn test_community_errors() {
        let missing = V4_BLOCK.replace("BGP.ext_community", "BGP.community");
        assert!(matches!(
            parse_route(&missing),
            Err(RouteParseError::InvalidCommunity(_))
        ));

        let two_fields = V4_BLOCK.replace("(generic, 0x80060000, 0x4ac80000)", "(rt, 65000)");
        assert!(matches!(
            parse_route(&two_fields),
            Err(RouteParseError::InvalidCommunity(_))
        ));

        let garbage = V4_BLOCK.replace("0x80060000", "0xzz");
        assert!(matches!(
            parse_route(&garbage),
            Err(RouteParseError::InvalidCommunity(_))
        ));

        let unknown = V4_BLOCK.replace("0x80060000", "0x80100000");
        assert_eq!(
            parse_route(&unknown),
            Err(RouteParseError::UnsupportedAction(0x8010))
        );

        let negative = V4_BLOCK.replace("0x4ac80000", "0xbf800000");
        assert!(matches!(
            parse_route(&negative),
            Err(RouteParseError::InvalidCommunity(_))
        ));
    }

    #[test]
    fn test_non_rate_action_parses() {
        let block = V4_BLOCK.replace("0x80060000, 0x4ac80000", "0x80080000, 0x0");
        let route = parse_route(&block).unwrap();
        assert_eq!(route.action, FlowAction::Redirect);
    }

    #[test]
    fn test_decode_rate() {
        assert_eq!(decode_rate("3f800000"), Some(1));
        assert_eq!(decode_rate("0x3f800000"), Some(1));
        assert_eq!(decode_rate("0x4ac80000"), Some(6_553_600));
        assert_eq!(decode_rate("0x00000000"), Some(0));
        assert_eq!(decode_rate("0x0"), Some(0));
        assert_eq!(decode_rate("0x3fc00000"), Some(1));
        assert_eq!(decode_rate("0x100000000"), None);
        assert_eq!(decode_rate(""), None);
    }

    #[test]
    fn test_decode_rate_rejects_non_finite() {
        assert_eq!(decode_rate("7fc00000"), None);
        assert_eq!(decode_rate("0x7f800000"), None);
        assert_eq!(decode_rate("0xff800000"), None);
        // 2^63 and 3.4e38 do not fit an i64
        assert_eq!(decode_rate("0x5f000000"), None);
        assert_eq!(decode_rate("0x7f7fffff"), None);
        assert_eq!(decode_rate("0x5effffff"), Some(9_223_371_487_098_961_920));
    }

    #[test]
    fn test_non_finite_rate_skips_block() {
        for pattern in ["0x7fc00000", "0x7f800000"] {
            let block = V4_BLOCK.replace("0x4ac80000", pattern);
            assert!(
                matches!(
                    parse_route(&block),
                    Err(RouteParseError::InvalidCommunity(_))
                ),
                "{}",
                pattern
            );
        }
    }

    #[test]
    fn test_parse_int_auto() {
        assert_eq!(parse_int_auto("0x8006"), Some(0x8006));
        assert_eq!(parse_int_auto("32774"), Some(32774));
        assert_eq!(parse_int_auto("010"), Some(8));
        assert_eq!(parse_int_auto("0b101"), Some(5));
        assert_eq!(parse_int_auto("-12"), Some(-12));
        assert_eq!(parse_int_auto("0"), Some(0));
        assert_eq!(parse_int_auto("0x"), None);
        assert_eq!(parse_int_auto("--1"), None);
    }

    #[test]
    fn test_split_blocks() {
        let dump = format!(
            "0001 BIRD 2.15 ready.\n1007-Table master4:\n{}{}0000 \n",
            V4_BLOCK, V4_BLOCK
        );
        let blocks = split_blocks(&dump);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.starts_with("flow4 {")));
        assert!(parse_route(blocks[0]).is_ok());
    }

    #[test]
    fn test_split_blocks_ignores_flow_in_session_name() {
        let blocks = split_blocks(V4_BLOCK);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("[flowspec1 "));
    }

    #[test]
    fn test_split_blocks_empty() {
        assert!(split_blocks("").is_empty());
        assert!(split_blocks("0000 \n").is_empty());
    }
}
