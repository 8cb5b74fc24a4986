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

//! Parse tree of the restricted aggregate-SELECT dialect.

use super::agg_compiler::ExprId;

/// Column number within the statement; assigned in first-mention order by
/// the parser and mapped to storage attr ids after the schema is loaded.
pub type ColIdx = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFun {
    Count,
    Sum,
    Min,
    Max,
}

/// One SELECT output. Arithmetic is only allowed inside aggregate
/// functions; a bare output is a grouped column reference.
#[derive(Debug, Clone)]
pub enum Output<'a> {
    Column {
        col_idx: ColIdx,
        output_name: &'a str,
    },
    Aggregate {
        fun: AggFun,
        expr: ExprId,
        agg_index: u32,
        output_name: &'a str,
    },
    /// AVG is computed client-side from a Sum and a Count aggregate.
    Avg {
        expr: ExprId,
        agg_index_sum: u32,
        agg_index_count: u32,
        output_name: &'a str,
    },
}

impl Output<'_> {
    pub fn output_name(&self) -> &str {
        match self {
            Output::Column { output_name, .. }
            | Output::Aggregate { output_name, .. }
            | Output::Avg { output_name, .. } => output_name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// WHERE condition tree. Operands are column references and integer
/// constants; everything else the dialect rejects at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondExpr {
    And(Box<CondExpr>, Box<CondExpr>),
    Or(Box<CondExpr>, Box<CondExpr>),
    Not(Box<CondExpr>),
    Cmp(CmpOp, Box<CondExpr>, Box<CondExpr>),
    Column(ColIdx),
    Int(i64),
}

#[derive(Debug, Clone, Copy)]
pub struct OrderByColumn {
    pub col_idx: ColIdx,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelectStatement<'a> {
    pub do_explain: bool,
    pub outputs: Vec<Output<'a>>,
    pub table: &'a str,
    pub where_expr: Option<CondExpr>,
    pub group_by: Vec<ColIdx>,
    pub order_by: Vec<OrderByColumn>,
}
