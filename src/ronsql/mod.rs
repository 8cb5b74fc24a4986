// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Pushdown aggregation SQL over a single table.
//!
//! `prepare` runs the front half (parse, schema load, scan planning,
//! aggregation compile, printer compile); `execute` ships the program to the
//! storage nodes and renders the result records, or emits the EXPLAIN text.

pub mod agg_compiler;
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod scan;

use std::fmt;

use serde::Deserialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::arena::Arena;
use crate::dal::{AggClient, AggInstr, AggScanRequest, DalError, ScanAccess, TableSchema};

use agg_compiler::{quote_identifier, AggCompiler, CompileError, Instr, InstrKind};
use ast::{CmpOp, CondExpr, Output, SelectStatement};
use printer::ResultPrinter;
use scan::{range_to_bounds, ScanPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ExplainMode {
    #[default]
    Allow,
    Forbid,
    Require,
    Remove,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    #[default]
    Json,
    JsonAscii,
    Text,
    TextNoheader,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RonSqlParams {
    pub query: String,
    pub database: String,
    #[serde(default)]
    pub explain_mode: ExplainMode,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub operation_id: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RsqlError {
    #[error("Syntax error in SQL statement: {message}")]
    Syntax { message: String, position: usize },
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Backend(#[from] DalError),
}

impl RsqlError {
    pub fn syntax(message: impl Into<String>, position: usize) -> Self {
        RsqlError::Syntax {
            message: message.into(),
            position,
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        RsqlError::Unsupported(message.into())
    }

    pub fn position(&self) -> Option<usize> {
        match self {
            RsqlError::Syntax { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Retryable per the backend's own classification.
    pub fn is_temporary(&self) -> bool {
        matches!(self, RsqlError::Backend(DalError::Temporary { .. }))
    }

    pub fn http_status(&self) -> u16 {
        match self {
            RsqlError::Syntax { .. } | RsqlError::Unsupported(_) => 400,
            RsqlError::Compile(_) | RsqlError::Backend(_) => 500,
        }
    }
}

/// A fully prepared statement, ready to execute (or explain) repeatedly.
#[derive(Debug)]
pub struct Prepared<'a> {
    stmt: SelectStatement<'a>,
    columns: Vec<&'a str>,
    agg: AggCompiler,
    plan: ScanPlan,
    printer: ResultPrinter,
    /// Column index -> storage attr id; absent when prepared without a
    /// connection (EXPLAIN-only).
    attr_map: Option<Vec<i32>>,
    do_explain: bool,
    table: String,
}

pub fn prepare<'a>(
    sql: &'a str,
    arena: &'a Arena,
    db: &str,
    client: Option<&dyn AggClient>,
    explain_mode: ExplainMode,
    output_format: OutputFormat,
) -> Result<Prepared<'a>, RsqlError> {
    let mut agg = AggCompiler::new();
    let parsed = parser::parse(sql, arena, &mut agg)?;
    let stmt = parsed.stmt;
    let columns = parsed.columns;

    let has_aggregate = stmt
        .outputs
        .iter()
        .any(|o| matches!(o, Output::Aggregate { .. } | Output::Avg { .. }));
    if !has_aggregate {
        return Err(RsqlError::unsupported(
            "This query has no aggregate expression, so it is not an aggregate query. \
             Currently, RonSQL only supports aggregate queries.",
        ));
    }

    let do_explain = match explain_mode {
        ExplainMode::Allow => stmt.do_explain,
        ExplainMode::Forbid => {
            if stmt.do_explain {
                return Err(RsqlError::unsupported("Execution mode does not allow EXPLAIN."));
            }
            false
        }
        ExplainMode::Require => {
            if !stmt.do_explain {
                return Err(RsqlError::unsupported(
                    "Execution mode does not allow query, only EXPLAIN.",
                ));
            }
            true
        }
        ExplainMode::Remove => false,
        ExplainMode::Force => true,
    };

    let schema: Option<TableSchema> = match client {
        Some(client) => Some(load_schema(client, db, stmt.table)?),
        None => None,
    };
    let attr_map = match &schema {
        Some(schema) => {
            let mut map = Vec::with_capacity(columns.len());
            for name in &columns {
                let attr = schema.attr_id(name).ok_or_else(|| {
                    RsqlError::unsupported(format!(
                        "Failed to get column {}. Note that column names are case sensitive.",
                        quote_identifier(name)
                    ))
                })?;
                map.push(attr);
            }
            Some(map)
        }
        None => None,
    };

    let candidates = scan::generate_index_scan_candidates(stmt.where_expr.as_ref());
    let plan = scan::choose_scan(stmt.where_expr.as_ref(), candidates, schema.as_ref(), |c| {
        columns[c as usize].to_string()
    });

    agg.compile()?;
    let printer = ResultPrinter::new(&stmt, &columns, output_format)?;

    Ok(Prepared {
        table: stmt.table.to_string(),
        stmt,
        columns,
        agg,
        plan,
        printer,
        attr_map,
        do_explain,
    })
}

fn load_schema(client: &dyn AggClient, db: &str, table: &str) -> Result<TableSchema, RsqlError> {
    client.table_schema(db, table).map_err(|e| match e {
        DalError::NotFound => RsqlError::unsupported(
            "Failed to get table. Note that RonSQL only supports tables with ENGINE=ndbcluster.",
        ),
        other => RsqlError::Backend(other),
    })
}

impl Prepared<'_> {
    pub fn is_explain(&self) -> bool {
        self.do_explain
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// Execute the statement (or render the EXPLAIN text) into `out`.
    pub fn execute(
        &self,
        client: &dyn AggClient,
        db: &str,
        out: &mut String,
    ) -> Result<(), RsqlError> {
        if self.do_explain {
            out.push_str(&self.explain_text());
            return Ok(());
        }
        let request = self.build_request(db)?;
        let records = client.scan(&request)?;
        self.printer.print_result(&records, out)
    }

    fn build_request(&self, db: &str) -> Result<AggScanRequest, RsqlError> {
        let attr_map = self.attr_map.as_ref().ok_or_else(|| {
            RsqlError::unsupported("Cannot query without a storage connection.")
        })?;
        let attr_of = |c: ast::ColIdx| attr_map.get(c as usize).copied();

        let (access, filter_ast) = match &self.plan {
            ScanPlan::TableScan { filter } => (ScanAccess::Table, filter.as_ref()),
            ScanPlan::IndexScan {
                index_name,
                ranges,
                filter,
                ..
            } => (
                ScanAccess::Index {
                    index_name: index_name.clone(),
                    ranges: ranges.iter().map(range_to_bounds).collect(),
                },
                filter.as_ref(),
            ),
        };
        let filter = filter_ast
            .map(|f| scan::build_scan_filter(f, attr_of))
            .transpose()?;

        let mut group_by = Vec::with_capacity(self.stmt.group_by.len());
        for col in &self.stmt.group_by {
            group_by.push(
                attr_of(*col).ok_or_else(|| RsqlError::unsupported("Failed to get column."))?,
            );
        }

        let mut program = Vec::with_capacity(self.agg.program().len());
        for instr in self.agg.program() {
            let Instr { kind, dest, src } = *instr;
            program.push(match kind {
                InstrKind::Load => AggInstr::LoadColumn {
                    attr_id: attr_of(src)
                        .ok_or_else(|| RsqlError::unsupported("Failed to get column."))?,
                    reg: dest,
                },
                InstrKind::LoadConstInt => AggInstr::LoadInt64 {
                    value: self.agg.constants()[src as usize],
                    reg: dest,
                },
                InstrKind::Mov => AggInstr::Mov { dest, src },
                InstrKind::Add => AggInstr::Add { dest, src },
                InstrKind::Sub => AggInstr::Sub { dest, src },
                InstrKind::Mul => AggInstr::Mul { dest, src },
                InstrKind::Div => AggInstr::Div { dest, src },
                InstrKind::DivInt => AggInstr::DivInt { dest, src },
                InstrKind::Rem => AggInstr::Rem { dest, src },
                InstrKind::Sum => AggInstr::Sum { agg: dest, reg: src },
                InstrKind::Min => AggInstr::Min { agg: dest, reg: src },
                InstrKind::Max => AggInstr::Max { agg: dest, reg: src },
                InstrKind::Count => AggInstr::Count { agg: dest, reg: src },
            });
        }

        Ok(AggScanRequest {
            db: db.to_string(),
            table: self.table.clone(),
            access,
            filter,
            group_by,
            program,
        })
    }

    /// Human-readable plan: parse tree, scan choice, aggregation program and
    /// printer summary.
    pub fn explain_text(&self) -> String {
        use std::fmt::Write as _;
        let column_name = |c: u32| self.columns[c as usize].to_string();
        let mut out = String::new();
        out.push_str("Query parse tree:\nSELECT\n");
        for (i, output) in self.stmt.outputs.iter().enumerate() {
            let _ = write!(
                out,
                "  Out_{i}:{}\n   = ",
                quote_identifier(output.output_name())
            );
            match output {
                Output::Column { col_idx, .. } => {
                    let _ = writeln!(
                        out,
                        "C{col_idx}:{}",
                        quote_identifier(&column_name(*col_idx))
                    );
                }
                Output::Aggregate { agg_index, .. } => {
                    let _ = writeln!(
                        out,
                        "A{agg_index}:{}",
                        self.agg.aggregate_to_string(*agg_index, &column_name)
                    );
                }
                Output::Avg {
                    agg_index_sum,
                    agg_index_count,
                    ..
                } => {
                    let _ = writeln!(
                        out,
                        "CLIENT-SIDE CALCULATION: A{agg_index_sum}:{} / A{agg_index_count}:{}",
                        self.agg.aggregate_to_string(*agg_index_sum, &column_name),
                        self.agg.aggregate_to_string(*agg_index_count, &column_name),
                    );
                }
            }
        }
        let _ = writeln!(out, "FROM {}", self.table);
        if let Some(where_expr) = &self.stmt.where_expr {
            out.push_str("WHERE\n");
            print_cond(&mut out, where_expr, 1, &column_name);
        }
        if !self.stmt.group_by.is_empty() {
            out.push_str("GROUP BY\n");
            for col in &self.stmt.group_by {
                let _ = writeln!(out, "  C{col}:{}", quote_identifier(&column_name(*col)));
            }
        }
        if !self.stmt.order_by.is_empty() {
            out.push_str("ORDER BY\n");
            for ob in &self.stmt.order_by {
                let _ = writeln!(
                    out,
                    "  C{}:{} {}",
                    ob.col_idx,
                    quote_identifier(&column_name(ob.col_idx)),
                    if ob.ascending { "ASC" } else { "DESC" }
                );
            }
        }
        out.push('\n');
        match &self.plan {
            ScanPlan::TableScan { filter } => {
                out.push_str("Table scan");
                if filter.is_some() {
                    out.push_str(" with filter");
                }
                out.push_str(".\n");
            }
            ScanPlan::IndexScan {
                col_idx,
                index_name,
                ranges,
                filter,
            } => {
                let _ = writeln!(
                    out,
                    "Index scan on {} using {}:",
                    quote_identifier(&column_name(*col_idx)),
                    quote_identifier(index_name)
                );
                for range in ranges {
                    let _ = writeln!(out, "  {}", describe_range(range, &column_name(*col_idx)));
                }
                if filter.is_some() {
                    out.push_str("  with residual filter.\n");
                }
            }
        }
        out.push('\n');
        out.push_str(&self.agg.program_listing(&column_name));
        self.printer.explain(&mut out);
        out
    }
}

fn describe_range(range: &scan::Range, col: &str) -> String {
    use scan::Bound;
    let mut parts = Vec::new();
    match range.low {
        Bound::None => {}
        Bound::Inclusive(v) => parts.push(format!("{v} <= {col}")),
        Bound::Exclusive(v) => parts.push(format!("{v} < {col}")),
    }
    match range.high {
        Bound::None => {}
        Bound::Inclusive(v) => parts.push(format!("{col} <= {v}")),
        Bound::Exclusive(v) => parts.push(format!("{col} < {v}")),
    }
    if parts.is_empty() {
        "unbounded".to_string()
    } else {
        parts.join(" AND ")
    }
}

fn print_cond(out: &mut String, ce: &CondExpr, depth: usize, column_name: &dyn Fn(u32) -> String) {
    use std::fmt::Write as _;
    let indent = "  ".repeat(depth);
    match ce {
        CondExpr::And(left, right) => {
            let _ = writeln!(out, "{indent}AND");
            print_cond(out, left, depth + 1, column_name);
            print_cond(out, right, depth + 1, column_name);
        }
        CondExpr::Or(left, right) => {
            let _ = writeln!(out, "{indent}OR");
            print_cond(out, left, depth + 1, column_name);
            print_cond(out, right, depth + 1, column_name);
        }
        CondExpr::Not(inner) => {
            let _ = writeln!(out, "{indent}NOT");
            print_cond(out, inner, depth + 1, column_name);
        }
        CondExpr::Cmp(op, left, right) => {
            let _ = writeln!(
                out,
                "{indent}{} {op} {}",
                describe_operand(left, column_name),
                describe_operand(right, column_name),
                op = cmp_str(*op)
            );
        }
        CondExpr::Column(col) => {
            let _ = writeln!(out, "{indent}{}", quote_identifier(&column_name(*col)));
        }
        CondExpr::Int(value) => {
            let _ = writeln!(out, "{indent}{value}");
        }
    }
}

fn describe_operand(ce: &CondExpr, column_name: &dyn Fn(u32) -> String) -> String {
    match ce {
        CondExpr::Column(col) => quote_identifier(&column_name(*col)),
        CondExpr::Int(value) => value.to_string(),
        other => format!("{other:?}"),
    }
}

fn cmp_str(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "=",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    }
}

/// Response body plus the content type the HTTP layer must set.
#[derive(Debug)]
pub struct RonSqlOutput {
    pub body: String,
    pub content_type: String,
    pub explain: bool,
}

impl fmt::Display for RonSqlOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.body)
    }
}

/// Run one SQL request end to end: prepare, execute, wrap the JSON body and
/// pick the content type.
pub fn run_query(params: &RonSqlParams, client: &dyn AggClient) -> Result<RonSqlOutput, RsqlError> {
    let json_output = matches!(
        params.output_format,
        OutputFormat::Json | OutputFormat::JsonAscii
    );
    if !params.operation_id.is_empty() && !json_output {
        return Err(RsqlError::unsupported(format!(
            "operationId not supported with output format {}",
            params.output_format
        )));
    }

    let arena = Arena::new();
    let prepared = prepare(
        &params.query,
        &arena,
        &params.database,
        Some(client),
        params.explain_mode,
        params.output_format,
    )?;

    let mut body = String::new();
    if prepared.is_explain() {
        prepared.execute(client, &params.database, &mut body)?;
        return Ok(RonSqlOutput {
            body,
            content_type: "text/plain; charset=utf-8".to_string(),
            explain: true,
        });
    }

    if json_output {
        if params.operation_id.is_empty() {
            body.push_str("{\"data\":\n");
        } else {
            body.push_str(&format!(
                "{{\"operationId\": \"{}\",\n\"data\":\n",
                params.operation_id
            ));
        }
    }
    prepared.execute(client, &params.database, &mut body)?;
    if json_output {
        body.push_str("}\n");
    }

    let content_type = match params.output_format {
        OutputFormat::Json => "application/json".to_string(),
        // JSON is formally a binary format; the charset parameter lets an
        // aware client confirm ASCII-only content and is harmless to
        // everyone else.
        OutputFormat::JsonAscii => "application/json; charset=US-ASCII".to_string(),
        OutputFormat::Text => {
            "text/tab-separated-values; charset=utf-8; header=present".to_string()
        }
        OutputFormat::TextNoheader => {
            "text/tab-separated-values; charset=utf-8; header=absent".to_string()
        }
    };
    Ok(RonSqlOutput {
        body,
        content_type,
        explain: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockAggClient;

    fn client() -> MockAggClient {
        let client = MockAggClient::new();
        client.add_table(
            "db",
            "t",
            &["id", "x", "a", "b", "c", "d"],
            &[("ix_id", "id")],
        );
        client
    }

    #[test]
    fn index_scan_plan_for_range_query() {
        let arena = Arena::new();
        let client = client();
        let prepared = prepare(
            "SELECT COUNT(*) FROM t WHERE id >= 10 AND id < 20 AND x > 0",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Allow,
            OutputFormat::Json,
        )
        .unwrap();
        match prepared.plan() {
            ScanPlan::IndexScan {
                index_name, ranges, filter, ..
            } => {
                assert_eq!(index_name, "ix_id");
                assert_eq!(ranges.len(), 1);
                assert!(filter.is_some());
            }
            other => panic!("expected index scan, got {other:?}"),
        }
    }

    #[test]
    fn table_scan_without_matching_index() {
        let arena = Arena::new();
        let client = MockAggClient::new();
        client.add_table("db", "t", &["id", "x"], &[]);
        let prepared = prepare(
            "SELECT COUNT(*) FROM t WHERE id >= 10 AND id < 20 AND x > 0",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Allow,
            OutputFormat::Json,
        )
        .unwrap();
        assert!(matches!(prepared.plan(), ScanPlan::TableScan { filter: Some(_) }));
    }

    #[test]
    fn non_aggregate_query_is_rejected() {
        let arena = Arena::new();
        let client = client();
        let err = prepare(
            "SELECT d FROM t GROUP BY d",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Allow,
            OutputFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn explain_modes() {
        let arena = Arena::new();
        let client = client();
        // FORBID rejects EXPLAIN.
        assert!(prepare(
            "EXPLAIN SELECT SUM(a) FROM t",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Forbid,
            OutputFormat::Json,
        )
        .is_err());
        // REQUIRE rejects plain SELECT.
        assert!(prepare(
            "SELECT SUM(a) FROM t",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Require,
            OutputFormat::Json,
        )
        .is_err());
        // REMOVE strips the prefix.
        let prepared = prepare(
            "EXPLAIN SELECT SUM(a) FROM t",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Remove,
            OutputFormat::Json,
        )
        .unwrap();
        assert!(!prepared.is_explain());
        // FORCE adds it.
        let prepared = prepare(
            "SELECT SUM(a) FROM t",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Force,
            OutputFormat::Json,
        )
        .unwrap();
        assert!(prepared.is_explain());
    }

    #[test]
    fn unknown_column_is_reported() {
        let arena = Arena::new();
        let client = client();
        let err = prepare(
            "SELECT SUM(zzz) FROM t",
            &arena,
            "db",
            Some(&client),
            ExplainMode::Allow,
            OutputFormat::Json,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Failed to get column"));
    }

    #[test]
    fn run_query_executes_and_wraps_json() {
        let client = client();
        client.add_group_result(
            "t",
            vec![crate::dal::ScanValue::Int32(1)],
            vec![crate::dal::AggValue::Int64(5)],
        );
        let params = RonSqlParams {
            query: "SELECT d, SUM(a) AS total FROM t GROUP BY d".to_string(),
            database: "db".to_string(),
            explain_mode: ExplainMode::Allow,
            output_format: OutputFormat::Json,
            operation_id: "op-7".to_string(),
        };
        let output = run_query(&params, &client).unwrap();
        assert!(output.body.starts_with("{\"operationId\": \"op-7\",\n\"data\":\n"));
        assert!(output.body.contains("\"total\":5"));
        assert!(output.body.ends_with("}\n"));
        assert_eq!(output.content_type, "application/json");

        // The scan request the client saw used the aggregator program.
        let request = client.last_request().unwrap();
        assert!(!request.program.is_empty());
        assert_eq!(request.group_by.len(), 1);
    }

    #[test]
    fn operation_id_rejected_for_tsv() {
        let client = client();
        let params = RonSqlParams {
            query: "SELECT SUM(a) FROM t".to_string(),
            database: "db".to_string(),
            explain_mode: ExplainMode::Allow,
            output_format: OutputFormat::Text,
            operation_id: "op".to_string(),
        };
        let err = run_query(&params, &client).unwrap_err();
        assert!(err.to_string().contains("operationId not supported"));
    }

    #[test]
    fn explain_output_is_plain_text() {
        let client = client();
        let params = RonSqlParams {
            query: "EXPLAIN SELECT d, SUM(a+b) FROM t WHERE id >= 1 AND id < 5 GROUP BY d"
                .to_string(),
            database: "db".to_string(),
            explain_mode: ExplainMode::Allow,
            output_format: OutputFormat::Json,
            operation_id: String::new(),
        };
        let output = run_query(&params, &client).unwrap();
        assert!(output.explain);
        assert_eq!(output.content_type, "text/plain; charset=utf-8");
        assert!(output.body.contains("Query parse tree:"));
        assert!(output.body.contains("Index scan"));
        assert!(output.body.contains("Aggregation program"));
        assert!(output.body.contains("GROUP BY"));
    }

    #[test]
    fn empty_statement_reports_position_zero_without_backend_call() {
        let client = client();
        let params = RonSqlParams {
            query: "".to_string(),
            database: "db".to_string(),
            explain_mode: ExplainMode::Allow,
            output_format: OutputFormat::Json,
            operation_id: String::new(),
        };
        let err = run_query(&params, &client).unwrap_err();
        assert_eq!(err.position(), Some(0));
        assert!(client.last_request().is_none());
        assert_eq!(client.schema_lookups(), 0);
    }

    #[test]
    fn params_deserialize_from_camel_case() {
        let params: RonSqlParams = serde_json::from_str(
            r#"{"query": "SELECT SUM(a) FROM t", "database": "db",
                "explainMode": "REQUIRE", "outputFormat": "TEXT_NOHEADER"}"#,
        )
        .unwrap();
        assert_eq!(params.explain_mode, ExplainMode::Require);
        assert_eq!(params.output_format, OutputFormat::TextNoheader);
        assert!(params.operation_id.is_empty());
    }
}
