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

//! Recursive-descent parser for the aggregate-SELECT dialect.
//!
//! Arithmetic feeds directly into the aggregation compiler's programming
//! API, so expression deduplication and constant folding happen while
//! parsing. Plain column outputs bypass the compiler; they resolve against
//! GROUP BY at printer-compile time.

use crate::arena::Arena;

use super::agg_compiler::{AggCompiler, ExprId};
use super::ast::{AggFun, CmpOp, ColIdx, CondExpr, OrderByColumn, Output, SelectStatement};
use super::lexer::{tokenize, Keyword, Tok, Token, MAX_IDENTIFIER_BYTES};
use super::RsqlError;

#[derive(Debug)]
pub struct ParseResult<'a> {
    pub stmt: SelectStatement<'a>,
    /// Column names in first-mention order; indexes are the `ColIdx` values
    /// used throughout the statement.
    pub columns: Vec<&'a str>,
}

pub fn parse<'a>(
    sql: &'a str,
    arena: &'a Arena,
    agg: &mut AggCompiler,
) -> Result<ParseResult<'a>, RsqlError> {
    if sql.trim().is_empty() {
        return Err(RsqlError::syntax("Empty input", 0));
    }
    let tokens = tokenize(sql, arena)?;
    let mut parser = Parser {
        sql,
        tokens,
        pos: 0,
        agg,
        columns: Vec::new(),
    };
    let stmt = parser.statement()?;
    Ok(ParseResult {
        stmt,
        columns: parser.columns,
    })
}

struct Parser<'a, 'c> {
    sql: &'a str,
    tokens: Vec<Token<'a>>,
    pos: usize,
    agg: &'c mut AggCompiler,
    columns: Vec<&'a str>,
}

impl<'a> Parser<'a, '_> {
    fn peek(&self) -> Token<'a> {
        self.tokens[self.pos]
    }

    fn peek2(&self) -> Tok<'a> {
        self.tokens
            .get(self.pos + 1)
            .map(|t| t.tok)
            .unwrap_or(Tok::Eof)
    }

    fn bump(&mut self) -> Token<'a> {
        let t = self.tokens[self.pos];
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn unexpected<T>(&self) -> Result<T, RsqlError> {
        let t = self.peek();
        if t.tok == Tok::Eof {
            Err(RsqlError::syntax("Unexpected end of input", t.start))
        } else {
            Err(RsqlError::syntax("Unexpected at this point", t.start))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<(), RsqlError> {
        if self.peek().tok == Tok::Keyword(kw) {
            self.bump();
            Ok(())
        } else {
            self.unexpected()
        }
    }

    fn expect(&mut self, tok: Tok<'a>) -> Result<(), RsqlError> {
        if self.peek().tok == tok {
            self.bump();
            Ok(())
        } else {
            self.unexpected()
        }
    }

    fn column_idx(&mut self, name: &'a str) -> ColIdx {
        if let Some(idx) = self.columns.iter().position(|c| *c == name) {
            return idx as ColIdx;
        }
        self.columns.push(name);
        (self.columns.len() - 1) as ColIdx
    }

    fn ident(&mut self) -> Result<&'a str, RsqlError> {
        match self.peek().tok {
            Tok::Ident(name) => {
                self.bump();
                Ok(name)
            }
            _ => self.unexpected(),
        }
    }

    fn statement(&mut self) -> Result<SelectStatement<'a>, RsqlError> {
        let mut stmt = SelectStatement::default();
        if self.peek().tok == Tok::Keyword(Keyword::Explain) {
            self.bump();
            stmt.do_explain = true;
        }
        self.expect_keyword(Keyword::Select)?;
        loop {
            stmt.outputs.push(self.output()?);
            if self.peek().tok == Tok::Comma {
                self.bump();
            } else {
                break;
            }
        }
        self.expect_keyword(Keyword::From)?;
        stmt.table = self.ident()?;
        if self.peek().tok == Tok::Keyword(Keyword::Where) {
            self.bump();
            stmt.where_expr = Some(self.cond_or()?);
        }
        if self.peek().tok == Tok::Keyword(Keyword::Group) {
            self.bump();
            self.expect_keyword(Keyword::By)?;
            loop {
                let name = self.ident()?;
                stmt.group_by.push(self.column_idx(name));
                if self.peek().tok == Tok::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if self.peek().tok == Tok::Keyword(Keyword::Order) {
            self.bump();
            self.expect_keyword(Keyword::By)?;
            loop {
                let name = self.ident()?;
                let col_idx = self.column_idx(name);
                let ascending = match self.peek().tok {
                    Tok::Keyword(Keyword::Asc) => {
                        self.bump();
                        true
                    }
                    Tok::Keyword(Keyword::Desc) => {
                        self.bump();
                        false
                    }
                    _ => true,
                };
                stmt.order_by.push(OrderByColumn { col_idx, ascending });
                if self.peek().tok == Tok::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        if self.peek().tok == Tok::Semicolon {
            self.bump();
        }
        if self.peek().tok != Tok::Eof {
            return self.unexpected();
        }
        Ok(stmt)
    }

    fn output(&mut self) -> Result<Output<'a>, RsqlError> {
        let start = self.peek().start;
        let output = match self.peek().tok {
            Tok::Keyword(kw @ (Keyword::Count | Keyword::Sum | Keyword::Min | Keyword::Max)) => {
                self.bump();
                self.expect(Tok::LParen)?;
                let expr = if kw == Keyword::Count && self.peek().tok == Tok::Star {
                    self.bump();
                    self.agg.constant_integer(1)
                } else {
                    self.arith_expr()?
                };
                self.expect(Tok::RParen)?;
                let (fun, agg_index) = match kw {
                    Keyword::Count => (AggFun::Count, self.agg.count(expr)),
                    Keyword::Sum => (AggFun::Sum, self.agg.sum(expr)),
                    Keyword::Min => (AggFun::Min, self.agg.min(expr)),
                    Keyword::Max => (AggFun::Max, self.agg.max(expr)),
                    _ => unreachable!("matched above"),
                };
                Output::Aggregate {
                    fun,
                    expr,
                    agg_index,
                    output_name: "",
                }
            }
            Tok::Keyword(Keyword::Avg) => {
                self.bump();
                self.expect(Tok::LParen)?;
                let expr = self.arith_expr()?;
                self.expect(Tok::RParen)?;
                Output::Avg {
                    expr,
                    agg_index_sum: self.agg.sum(expr),
                    agg_index_count: self.agg.count(expr),
                    output_name: "",
                }
            }
            Tok::Ident(name) => {
                // A bare column reference; arithmetic is only allowed inside
                // aggregate functions.
                if matches!(
                    self.peek2(),
                    Tok::Plus
                        | Tok::Minus
                        | Tok::Star
                        | Tok::Slash
                        | Tok::Percent
                        | Tok::Keyword(Keyword::Div)
                ) {
                    return Err(RsqlError::syntax(
                        "Arithmetic outside aggregate functions is not supported.",
                        self.peek().start,
                    ));
                }
                self.bump();
                Output::Column {
                    col_idx: self.column_idx(name),
                    output_name: "",
                }
            }
            _ => return self.unexpected(),
        };
        let end = self.tokens[self.pos.saturating_sub(1)].end;
        let output_name = if self.peek().tok == Tok::Keyword(Keyword::As) {
            self.bump();
            self.ident()?
        } else {
            let source = self.sql[start..end].trim();
            if source.len() > MAX_IDENTIFIER_BYTES {
                return Err(RsqlError::syntax(
                    "Unaliased select expression too long. Use `AS` to add an alias no more \
                     than 64 bytes long.",
                    start,
                ));
            }
            source
        };
        Ok(match output {
            Output::Column { col_idx, .. } => Output::Column {
                col_idx,
                output_name,
            },
            Output::Aggregate {
                fun,
                expr,
                agg_index,
                ..
            } => Output::Aggregate {
                fun,
                expr,
                agg_index,
                output_name,
            },
            Output::Avg {
                expr,
                agg_index_sum,
                agg_index_count,
                ..
            } => Output::Avg {
                expr,
                agg_index_sum,
                agg_index_count,
                output_name,
            },
        })
    }

    fn arith_expr(&mut self) -> Result<ExprId, RsqlError> {
        let mut left = self.arith_term()?;
        loop {
            match self.peek().tok {
                Tok::Plus => {
                    self.bump();
                    let right = self.arith_term()?;
                    left = self.agg.add(left, right);
                }
                Tok::Minus => {
                    self.bump();
                    let right = self.arith_term()?;
                    left = self.agg.sub(left, right);
                }
                _ => return Ok(left),
            }
        }
    }

    fn arith_term(&mut self) -> Result<ExprId, RsqlError> {
        let mut left = self.arith_factor()?;
        loop {
            match self.peek().tok {
                Tok::Star => {
                    self.bump();
                    let right = self.arith_factor()?;
                    left = self.agg.mul(left, right);
                }
                Tok::Slash => {
                    self.bump();
                    let right = self.arith_factor()?;
                    left = self.agg.div(left, right);
                }
                Tok::Keyword(Keyword::Div) => {
                    self.bump();
                    let right = self.arith_factor()?;
                    left = self.agg.div_int(left, right);
                }
                Tok::Percent => {
                    self.bump();
                    let right = self.arith_factor()?;
                    left = self.agg.rem(left, right);
                }
                _ => return Ok(left),
            }
        }
    }

    fn arith_factor(&mut self) -> Result<ExprId, RsqlError> {
        match self.peek().tok {
            Tok::Int(value) => {
                self.bump();
                Ok(self.agg.constant_integer(value))
            }
            Tok::Minus => {
                self.bump();
                match self.peek().tok {
                    Tok::Int(value) => {
                        self.bump();
                        Ok(self.agg.constant_integer(-value))
                    }
                    _ => self.unexpected(),
                }
            }
            Tok::Ident(name) => {
                self.bump();
                let col_idx = self.column_idx(name);
                Ok(self.agg.load(col_idx))
            }
            Tok::LParen => {
                self.bump();
                let expr = self.arith_expr()?;
                self.expect(Tok::RParen)?;
                Ok(expr)
            }
            _ => self.unexpected(),
        }
    }

    fn cond_or(&mut self) -> Result<CondExpr, RsqlError> {
        let mut left = self.cond_and()?;
        while self.peek().tok == Tok::Keyword(Keyword::Or) {
            self.bump();
            let right = self.cond_and()?;
            left = CondExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn cond_and(&mut self) -> Result<CondExpr, RsqlError> {
        let mut left = self.cond_not()?;
        while self.peek().tok == Tok::Keyword(Keyword::And) {
            self.bump();
            let right = self.cond_not()?;
            left = CondExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn cond_not(&mut self) -> Result<CondExpr, RsqlError> {
        if self.peek().tok == Tok::Keyword(Keyword::Not) {
            self.bump();
            let inner = self.cond_not()?;
            return Ok(CondExpr::Not(Box::new(inner)));
        }
        self.cond_primary()
    }

    fn cond_primary(&mut self) -> Result<CondExpr, RsqlError> {
        if self.peek().tok == Tok::LParen {
            self.bump();
            let inner = self.cond_or()?;
            self.expect(Tok::RParen)?;
            return Ok(inner);
        }
        let left = self.cond_operand()?;
        let op = match self.peek().tok {
            Tok::Eq => CmpOp::Eq,
            Tok::Ne => CmpOp::Ne,
            Tok::Lt => CmpOp::Lt,
            Tok::Le => CmpOp::Le,
            Tok::Gt => CmpOp::Gt,
            Tok::Ge => CmpOp::Ge,
            _ => return self.unexpected(),
        };
        self.bump();
        let right = self.cond_operand()?;
        Ok(CondExpr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn cond_operand(&mut self) -> Result<CondExpr, RsqlError> {
        match self.peek().tok {
            Tok::Ident(name) => {
                self.bump();
                let col_idx = self.column_idx(name);
                Ok(CondExpr::Column(col_idx))
            }
            Tok::Int(value) => {
                self.bump();
                Ok(CondExpr::Int(value))
            }
            Tok::Minus => {
                self.bump();
                match self.peek().tok {
                    Tok::Int(value) => {
                        self.bump();
                        Ok(CondExpr::Int(-value))
                    }
                    _ => self.unexpected(),
                }
            }
            _ => self.unexpected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok<'a>(sql: &'a str, arena: &'a Arena) -> (ParseResult<'a>, AggCompiler) {
        let mut agg = AggCompiler::new();
        let result = parse(sql, arena, &mut agg).unwrap();
        (result, agg)
    }

    #[test]
    fn parses_aggregates_and_group_by() {
        let arena = Arena::new();
        let (result, agg) = parse_ok(
            "SELECT d, SUM(a+b) AS total, AVG(a) FROM t GROUP BY d",
            &arena,
        );
        assert_eq!(result.stmt.table, "t");
        assert_eq!(result.stmt.outputs.len(), 3);
        assert_eq!(result.columns, vec!["d", "a", "b"]);
        assert_eq!(result.stmt.group_by, vec![0]);
        match &result.stmt.outputs[1] {
            Output::Aggregate {
                fun, output_name, ..
            } => {
                assert_eq!(*fun, AggFun::Sum);
                assert_eq!(*output_name, "total");
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
        // AVG contributes a Sum and a Count.
        assert_eq!(agg.n_aggregates(), 3);
    }

    #[test]
    fn unaliased_output_uses_source_text() {
        let arena = Arena::new();
        let (result, _) = parse_ok("SELECT Sum(a + b) FROM t", &arena);
        assert_eq!(result.stmt.outputs[0].output_name(), "Sum(a + b)");
    }

    #[test]
    fn parses_where_tree() {
        let arena = Arena::new();
        let (result, _) = parse_ok(
            "SELECT COUNT(*) FROM t WHERE id >= 10 AND id < 20 AND x > 0",
            &arena,
        );
        let where_expr = result.stmt.where_expr.unwrap();
        // Left-associative AND: ((id >= 10 AND id < 20) AND x > 0).
        match where_expr {
            CondExpr::And(left, right) => {
                assert!(matches!(*left, CondExpr::And(_, _)));
                assert!(matches!(*right, CondExpr::Cmp(CmpOp::Gt, _, _)));
            }
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn empty_statement_is_position_zero_error() {
        let arena = Arena::new();
        let mut agg = AggCompiler::new();
        let err = parse("   ", &arena, &mut agg).unwrap_err();
        assert_eq!(err.position(), Some(0));
    }

    #[test]
    fn arithmetic_outside_aggregate_is_rejected() {
        let arena = Arena::new();
        let mut agg = AggCompiler::new();
        let err = parse("SELECT a + b FROM t", &arena, &mut agg).unwrap_err();
        assert!(err.to_string().contains("aggregate"));
    }

    #[test]
    fn explain_prefix_is_recognized() {
        let arena = Arena::new();
        let (result, _) = parse_ok("EXPLAIN SELECT SUM(a) FROM t", &arena);
        assert!(result.stmt.do_explain);
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let arena = Arena::new();
        let mut agg = AggCompiler::new();
        assert!(parse("SELECT SUM(a) FROM t extra", &arena, &mut agg).is_err());
    }

    #[test]
    fn count_star_is_supported() {
        let arena = Arena::new();
        let (result, agg) = parse_ok("SELECT COUNT(*) FROM t", &arena);
        assert_eq!(agg.n_aggregates(), 1);
        assert!(matches!(
            result.stmt.outputs[0],
            Output::Aggregate {
                fun: AggFun::Count,
                ..
            }
        ));
    }

    #[test]
    fn quoted_identifiers_parse() {
        let arena = Arena::new();
        let (result, _) = parse_ok("SELECT SUM(`we``ird`) FROM `my table x`", &arena);
        assert_eq!(result.stmt.table, "my table x");
        assert_eq!(result.columns, vec!["we`ird"]);
    }
}
