//! nftables gateway backed by the `nft` JSON interface
//!
//! Transactions are rendered into the libnftables JSON schema and piped to
//! `nft -j -f -`, which applies one input as one kernel transaction.
//! Listings come from `nft -j list ...`.

use crate::error::GatewayError;
use crate::expr::{
    ChainId, CmpOp, CompiledRule, Expression, LimitType, MetaKey, ObjectType, PayloadBase,
    TableFamily, VerdictKind,
};
use crate::gateway::{Batch, BatchOp, CounterObject, FilterGateway, InstalledRule, KernelObject};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Path to the `nft` command.
pub const NFT_CMD: &str = "/usr/sbin/nft";

/// Top-level JSON document for both input and listings.
#[derive(Debug, Deserialize)]
struct NftDocument {
    #[serde(default)]
    nftables: Vec<Map<String, Value>>,
}

/// [`FilterGateway`] that drives the `nft` command line tool.
#[derive(Debug, Clone)]
pub struct NftGateway {
    binary: PathBuf,
}

impl Default for NftGateway {
    fn default() -> Self {
        Self::new(NFT_CMD)
    }
}

impl NftGateway {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `nft` with `args`, optionally feeding `input` on stdin, and
    /// return stdout.
    async fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<String, GatewayError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        debug!(command = %command, "Executing nft");

        let exec_err = |source| GatewayError::Exec {
            command: command.clone(),
            source,
        };

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(exec_err)?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(data).await.map_err(exec_err)?;
            // stdin is dropped here so nft sees EOF
        }

        let output = child.wait_with_output().await.map_err(exec_err)?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if exit_code != 0 {
            warn!(command = %command, exit_code, stderr = %stderr, "nft failed");
            return Err(GatewayError::CommandFailed {
                command,
                exit_code,
                output: if stderr.is_empty() { stdout } else { stderr },
            });
        }

        trace!(command = %command, "nft succeeded");
        Ok(stdout)
    }

    async fn apply(&self, commands: Vec<Value>) -> Result<(), GatewayError> {
        let document = json!({ "nftables": commands });
        let input = serde_json::to_vec(&document)?;
        self.run(&["-j", "-f", "-"], Some(&input)).await?;
        Ok(())
    }
}

#[async_trait]
impl FilterGateway for NftGateway {
    async fn ensure_table(&self, family: TableFamily, table: &str) -> Result<(), GatewayError> {
        self.apply(vec![add_table(family, table)]).await
    }

    async fn ensure_chain(&self, chain: &ChainId) -> Result<(), GatewayError> {
        self.apply(vec![
            add_table(chain.family, &chain.table),
            json!({ "add": { "chain": chain_object(chain) } }),
        ])
        .await
    }

    async fn list_rules(&self, chain: &ChainId) -> Result<Vec<InstalledRule>, GatewayError> {
        let output = self
            .run(
                &[
                    "-j",
                    "list",
                    "chain",
                    chain.family.as_str(),
                    &chain.table,
                    &chain.chain,
                ],
                None,
            )
            .await?;
        parse_rules(&output)
    }

    async fn commit(&self, batch: Batch) -> Result<(), GatewayError> {
        let document = render_batch(&batch)?;
        let input = serde_json::to_vec(&document)?;
        self.run(&["-j", "-f", "-"], Some(&input)).await?;
        Ok(())
    }

    async fn add_counters(
        &self,
        family: TableFamily,
        table: &str,
        names: &[&str],
    ) -> Result<(), GatewayError> {
        if names.is_empty() {
            return Ok(());
        }
        let commands = names
            .iter()
            .map(|name| {
                json!({ "add": { "counter": {
                    "family": family.as_str(),
                    "table": table,
                    "name": name,
                } } })
            })
            .collect();
        self.apply(commands).await
    }

    async fn list_objects(
        &self,
        family: TableFamily,
        table: &str,
    ) -> Result<Vec<KernelObject>, GatewayError> {
        let output = self
            .run(&["-j", "list", "table", family.as_str(), table], None)
            .await?;
        parse_objects(&output)
    }
}

fn add_table(family: TableFamily, table: &str) -> Value {
    json!({ "add": { "table": { "family": family.as_str(), "name": table } } })
}

fn chain_object(chain: &ChainId) -> Value {
    json!({
        "family": chain.family.as_str(),
        "table": chain.table,
        "name": chain.chain,
    })
}

/// Render a batch as one nftables JSON document.
pub fn render_batch(batch: &Batch) -> Result<Value, GatewayError> {
    let commands = batch
        .ops()
        .iter()
        .map(|op| match op {
            BatchOp::FlushChain(chain) => Ok(json!({ "flush": { "chain": chain_object(chain) } })),
            BatchOp::AddRule(chain, rule) => render_rule(chain, rule),
        })
        .collect::<Result<Vec<_>, GatewayError>>()?;
    Ok(json!({ "nftables": commands }))
}

/// Render an `add rule` command.
pub fn render_rule(chain: &ChainId, rule: &CompiledRule) -> Result<Value, GatewayError> {
    Ok(json!({ "add": { "rule": {
        "family": chain.family.as_str(),
        "table": chain.table,
        "chain": chain.chain,
        "expr": lift_exprs(&rule.exprs)?,
    } } }))
}

/// Lift a register-level expression program to nftables JSON statements.
pub fn lift_exprs(exprs: &[Expression]) -> Result<Vec<Value>, GatewayError> {
    let mut statements = Vec::new();
    let mut i = 0;

    while i < exprs.len() {
        let consumed = match &exprs[i] {
            Expression::PayloadLoad {
                base: PayloadBase::NetworkHeader,
                offset,
                len,
                ..
            } => {
                let (protocol, field) = address_field(*offset, *len).ok_or_else(|| {
                    unsupported(format!("network header load at {}+{}", offset, len))
                })?;
                let left = json!({ "payload": { "protocol": protocol, "field": field } });
                match (exprs.get(i + 1), exprs.get(i + 2)) {
                    (
                        Some(Expression::BitwiseMask { mask, .. }),
                        Some(Expression::Compare { op, data, .. }),
                    ) => {
                        statements.push(match_stmt(*op, left, prefix_value(data, Some(mask))?));
                        3
                    }
                    (Some(Expression::Compare { op, data, .. }), _) => {
                        statements.push(match_stmt(*op, left, prefix_value(data, None)?));
                        2
                    }
                    _ => return Err(unsupported(format!("dangling {} {} load", protocol, field))),
                }
            }
            Expression::PayloadLoad {
                base: PayloadBase::TransportHeader,
                offset,
                len: 2,
                ..
            } => {
                let field = match offset {
                    0 => "sport",
                    2 => "dport",
                    other => {
                        return Err(unsupported(format!("transport header load at {}", other)))
                    }
                };
                let (op, port) = match exprs.get(i + 1) {
                    Some(Expression::Compare { op, data, .. }) if data.len() == 2 => {
                        (*op, u16::from_be_bytes([data[0], data[1]]))
                    }
                    _ => return Err(unsupported(format!("dangling th {} load", field))),
                };
                let left = json!({ "payload": { "protocol": "th", "field": field } });
                statements.push(match_stmt(op, left, json!(port)));
                2
            }
            Expression::MetaMatch { key, .. } => {
                let name = match key {
                    MetaKey::L4Proto => "l4proto",
                };
                let (op, value) = match exprs.get(i + 1) {
                    Some(Expression::Compare { op, data, .. }) if data.len() == 1 => (*op, data[0]),
                    _ => return Err(unsupported(format!("dangling meta {} load", name))),
                };
                statements.push(match_stmt(op, json!({ "meta": { "key": name } }), json!(value)));
                2
            }
            Expression::CounterRef { object_type, name } => {
                let kind = match object_type {
                    ObjectType::Counter => "counter",
                };
                statements.push(keyed(kind, json!(name)));
                // The anonymous counter that follows a named reference is
                // part of the same statement.
                match exprs.get(i + 1) {
                    Some(Expression::Counter { .. }) => 2,
                    _ => 1,
                }
            }
            Expression::Counter { packets, bytes } => {
                statements.push(json!({ "counter": { "packets": packets, "bytes": bytes } }));
                1
            }
            Expression::RateLimit {
                limit_type,
                rate,
                unit,
                over,
            } => {
                let mut limit = Map::new();
                limit.insert("rate".to_string(), json!(rate));
                limit.insert("per".to_string(), json!(unit.as_str()));
                if *limit_type == LimitType::Bytes {
                    limit.insert("rate_unit".to_string(), json!("bytes"));
                }
                if *over {
                    limit.insert("inv".to_string(), json!(true));
                }
                statements.push(json!({ "limit": limit }));
                1
            }
            Expression::Verdict { kind } => {
                let verdict = match kind {
                    VerdictKind::Drop => "drop",
                };
                statements.push(keyed(verdict, Value::Null));
                1
            }
            other => return Err(unsupported(format!("{:?}", other))),
        };
        i += consumed;
    }

    Ok(statements)
}

/// Single-key object `{ key: value }`.
fn keyed(key: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), value);
    Value::Object(object)
}

fn unsupported(what: String) -> GatewayError {
    GatewayError::Unsupported(what)
}

fn address_field(offset: u32, len: u32) -> Option<(&'static str, &'static str)> {
    match (offset, len) {
        (12, 4) => Some(("ip", "saddr")),
        (16, 4) => Some(("ip", "daddr")),
        (8, 16) => Some(("ip6", "saddr")),
        (24, 16) => Some(("ip6", "daddr")),
        _ => None,
    }
}

fn match_stmt(op: CmpOp, left: Value, right: Value) -> Value {
    let op = match op {
        CmpOp::Eq => "==",
    };
    json!({ "match": { "op": op, "left": left, "right": right } })
}

/// Address literal, or a prefix object when a partial mask applies.
fn prefix_value(data: &[u8], mask: Option<&Vec<u8>>) -> Result<Value, GatewayError> {
    let addr: IpAddr = match data.len() {
        4 => Ipv4Addr::new(data[0], data[1], data[2], data[3]).into(),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(data);
            Ipv6Addr::from(octets).into()
        }
        n => return Err(unsupported(format!("{}-byte address", n))),
    };

    let full = data.len() as u32 * 8;
    let len = mask.map_or(full, |m| m.iter().map(|b| b.count_ones()).sum());
    if len == full {
        Ok(json!(addr.to_string()))
    } else {
        Ok(json!({ "prefix": { "addr": addr.to_string(), "len": len } }))
    }
}

/// Parse the rules out of a `nft -j list chain` document.
pub fn parse_rules(output: &str) -> Result<Vec<InstalledRule>, GatewayError> {
    if output.is_empty() {
        return Ok(Vec::new());
    }
    let document: NftDocument = serde_json::from_str(output)?;
    document
        .nftables
        .into_iter()
        .filter_map(|mut entry| entry.remove("rule"))
        .map(|rule| serde_json::from_value(rule).map_err(GatewayError::from))
        .collect()
}

/// Parse named objects out of a `nft -j list table` document.
pub fn parse_objects(output: &str) -> Result<Vec<KernelObject>, GatewayError> {
    if output.is_empty() {
        return Ok(Vec::new());
    }
    let document: NftDocument = serde_json::from_str(output)?;
    let mut objects = Vec::new();

    for entry in document.nftables {
        for (kind, body) in entry {
            match kind.as_str() {
                "metainfo" | "table" | "chain" | "rule" => {}
                "counter" => {
                    let counter: CounterObject = serde_json::from_value(body)?;
                    objects.push(KernelObject::Counter(counter));
                }
                _ => {
                    if let Some(name) = body.get("name").and_then(Value::as_str) {
                        objects.push(KernelObject::Other {
                            name: name.to_string(),
                            kind,
                        });
                    }
                }
            }
        }
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::expr::{LimitUnit, REG_1};
    use flowspec_types::{FlowAction, MatchAttrs, Route, SessionAttrs};
    use pretty_assertions::assert_eq;

    fn chain() -> ChainId {
        ChainId::new(TableFamily::Inet, "filter", "flowspec")
    }

    fn route(matches: MatchAttrs, action: FlowAction, argument: i64) -> Route {
        Route {
            session: SessionAttrs {
                session_name: "flowspec1".to_string(),
                neighbor_address: "192.0.2.1".parse().unwrap(),
                import_time: "2024-05-01".to_string(),
            },
            matches,
            action,
            argument,
        }
    }

    #[test]
    fn test_lift_ipv4_tcp_drop() {
        let r = route(
            MatchAttrs {
                destination: Some("203.0.113.0/24".parse().unwrap()),
                protocol: 6,
                destination_port: 80,
                ..Default::default()
            },
            FlowAction::RateBytes,
            0,
        );
        let rule = compile(&r, false).unwrap();
        let statements = lift_exprs(&rule.exprs).unwrap();

        assert_eq!(
            Value::Array(statements),
            json!([
                { "match": { "op": "==",
                    "left": { "payload": { "protocol": "ip", "field": "daddr" } },
                    "right": { "prefix": { "addr": "203.0.113.0", "len": 24 } } } },
                { "match": { "op": "==",
                    "left": { "meta": { "key": "l4proto" } },
                    "right": 6 } },
                { "match": { "op": "==",
                    "left": { "payload": { "protocol": "th", "field": "dport" } },
                    "right": 80 } },
                { "drop": null },
            ])
        );
    }

    #[test]
    fn test_lift_ipv6_host_and_limit_with_counters() {
        let r = route(
            MatchAttrs {
                source: Some("2001:db8::1/128".parse().unwrap()),
                ..Default::default()
            },
            FlowAction::RatePackets,
            100,
        );
        let rule = compile(&r, true).unwrap();
        let statements = lift_exprs(&rule.exprs).unwrap();

        assert_eq!(
            Value::Array(statements),
            json!([
                { "match": { "op": "==",
                    "left": { "payload": { "protocol": "ip6", "field": "saddr" } },
                    "right": "2001:db8::1" } },
                { "counter": "flowspec_limit_matched" },
                { "limit": { "rate": 100, "per": "second", "inv": true } },
                { "counter": "flowspec_dropped" },
                { "drop": null },
            ])
        );
    }

    #[test]
    fn test_lift_byte_limit() {
        let statements = lift_exprs(&[Expression::RateLimit {
            limit_type: LimitType::Bytes,
            rate: 6_553_600,
            unit: LimitUnit::Second,
            over: true,
        }])
        .unwrap();
        assert_eq!(
            statements,
            vec![json!({ "limit": {
                "rate": 6_553_600, "per": "second", "rate_unit": "bytes", "inv": true
            } })]
        );
    }

    #[test]
    fn test_lift_rejects_dangling_load() {
        let err = lift_exprs(&[Expression::PayloadLoad {
            base: PayloadBase::NetworkHeader,
            offset: 12,
            len: 4,
            dest_register: REG_1,
        }])
        .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported(_)));

        let err = lift_exprs(&[Expression::PayloadLoad {
            base: PayloadBase::TransportHeader,
            offset: 4,
            len: 2,
            dest_register: REG_1,
        }])
        .unwrap_err();
        assert!(matches!(err, GatewayError::Unsupported(_)));
    }

    #[test]
    fn test_render_batch() {
        let rule = CompiledRule::new(vec![Expression::Verdict {
            kind: VerdictKind::Drop,
        }]);
        let batch = Batch::replace_chain(&chain(), &[rule]);
        let document = render_batch(&batch).unwrap();

        assert_eq!(
            document,
            json!({ "nftables": [
                { "flush": { "chain": { "family": "inet", "table": "filter", "name": "flowspec" } } },
                { "add": { "rule": {
                    "family": "inet", "table": "filter", "chain": "flowspec",
                    "expr": [ { "drop": null } ],
                } } },
            ] })
        );
    }

    #[test]
    fn test_parse_rules() {
        let output = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9", "release_name": "Old Doc Yak #3", "json_schema_version": 1}},
            {"chain": {"family": "inet", "table": "filter", "name": "flowspec", "handle": 1}},
            {"rule": {"family": "inet", "table": "filter", "chain": "flowspec", "handle": 4,
                      "expr": [{"drop": null}]}},
            {"rule": {"family": "inet", "table": "filter", "chain": "flowspec", "handle": 5,
                      "expr": [{"drop": null}]}}
        ]}"#;
        let rules = parse_rules(output).unwrap();
        assert_eq!(
            rules,
            vec![InstalledRule { handle: 4 }, InstalledRule { handle: 5 }]
        );
        assert!(parse_rules("").unwrap().is_empty());
        assert!(parse_rules("not json").is_err());
    }

    #[test]
    fn test_parse_objects() {
        let output = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9", "json_schema_version": 1}},
            {"table": {"family": "inet", "name": "filter", "handle": 1}},
            {"chain": {"family": "inet", "table": "filter", "name": "flowspec", "handle": 1}},
            {"counter": {"family": "inet", "name": "flowspec_dropped", "table": "filter",
                         "handle": 2, "packets": 12, "bytes": 960}},
            {"quota": {"family": "inet", "name": "q1", "table": "filter", "handle": 3,
                       "bytes": 1000, "used": 0, "inv": false}}
        ]}"#;
        let objects = parse_objects(output).unwrap();
        assert_eq!(
            objects,
            vec![
                KernelObject::Counter(CounterObject {
                    name: "flowspec_dropped".to_string(),
                    packets: 12,
                    bytes: 960,
                }),
                KernelObject::Other {
                    kind: "quota".to_string(),
                    name: "q1".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let gateway = NftGateway::new("/nonexistent/nft");
        let err = gateway.list_rules(&chain()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Exec { .. }));
    }

    #[tokio::test]
    async fn test_failing_binary() {
        let gateway = NftGateway::new("false");
        let err = gateway
            .list_objects(TableFamily::Inet, "filter")
            .await
            .unwrap_err();
        match err {
            GatewayError::CommandFailed {
                command, exit_code, ..
            } => {
                assert_eq!(command, "false -j list table inet filter");
                assert_eq!(exit_code, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
