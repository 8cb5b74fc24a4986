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

//! Scan planning.
//!
//! Given a WHERE tree, enumerate index-scan candidates (column, ranges,
//! residual filter). If an online ordered index leads on a candidate's
//! column the scan uses it; otherwise the whole expression becomes a table
//! scan filter.

use crate::dal::{
    BoundSpec, FilterCond, FilterOperand, IndexBound, ScanFilter, TableSchema,
};

use super::ast::{CmpOp, ColIdx, CondExpr};
use super::RsqlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    None,
    Inclusive(i64),
    Exclusive(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub low: Bound,
    pub high: Bound,
}

impl Range {
    /// A range with both bounds equal and inclusive is an equality bound.
    pub fn is_equality(&self) -> bool {
        matches!((self.low, self.high), (Bound::Inclusive(a), Bound::Inclusive(b)) if a == b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexScanConfig {
    pub col_idx: ColIdx,
    pub ranges: Vec<Range>,
    pub filter: Option<CondExpr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPlan {
    TableScan {
        filter: Option<CondExpr>,
    },
    IndexScan {
        col_idx: ColIdx,
        index_name: String,
        ranges: Vec<Range>,
        filter: Option<CondExpr>,
    },
}

/// Recognize index-scan candidates in the WHERE tree. The supported shape
/// is the conjunction `col >= a AND col < b [AND residual]` over a single
/// column with integer constants.
pub fn generate_index_scan_candidates(where_expr: Option<&CondExpr>) -> Vec<IndexScanConfig> {
    let mut candidates = Vec::new();
    let Some(ce) = where_expr else {
        return candidates;
    };
    if let Some(candidate) = match_range_conjunction(ce, None) {
        candidates.push(candidate);
    } else if let CondExpr::And(left, right) = ce {
        if let Some(candidate) = match_range_conjunction(left, Some(right.as_ref())) {
            candidates.push(candidate);
        }
    }
    candidates
}

/// Match `col >= a AND col < b`, attaching `residual` as the filter.
fn match_range_conjunction(
    ce: &CondExpr,
    residual: Option<&CondExpr>,
) -> Option<IndexScanConfig> {
    let CondExpr::And(left, right) = ce else {
        return None;
    };
    let (low_col, low) = match_cmp(left, CmpOp::Ge)?;
    let (high_col, high) = match_cmp(right, CmpOp::Lt)?;
    if low_col != high_col {
        return None;
    }
    Some(IndexScanConfig {
        col_idx: low_col,
        ranges: vec![Range {
            low: Bound::Inclusive(low),
            high: Bound::Exclusive(high),
        }],
        filter: residual.cloned(),
    })
}

fn match_cmp(ce: &CondExpr, op: CmpOp) -> Option<(ColIdx, i64)> {
    let CondExpr::Cmp(found, left, right) = ce else {
        return None;
    };
    if *found != op {
        return None;
    }
    match (left.as_ref(), right.as_ref()) {
        (CondExpr::Column(col), CondExpr::Int(value)) => Some((*col, *value)),
        _ => None,
    }
}

/// Pick the scan: the first candidate whose column leads an online ordered
/// index wins, else a table scan carrying the whole WHERE expression.
pub fn choose_scan(
    where_expr: Option<&CondExpr>,
    candidates: Vec<IndexScanConfig>,
    schema: Option<&TableSchema>,
    column_name: impl Fn(ColIdx) -> String,
) -> ScanPlan {
    if let Some(schema) = schema {
        for candidate in candidates {
            let name = column_name(candidate.col_idx);
            let index = schema
                .indexes
                .iter()
                .find(|ix| ix.online && ix.first_column == name);
            if let Some(index) = index {
                return ScanPlan::IndexScan {
                    col_idx: candidate.col_idx,
                    index_name: index.name.clone(),
                    ranges: candidate.ranges,
                    filter: candidate.filter,
                };
            }
        }
    }
    ScanPlan::TableScan {
        filter: where_expr.cloned(),
    }
}

/// Convert one range into the native `setBound` sequence. The storage API
/// inverts the naming sense: an inclusive low bound is `Le`.
pub fn range_to_bounds(range: &Range) -> Vec<BoundSpec> {
    if range.is_equality() {
        let Bound::Inclusive(value) = range.low else {
            unreachable!("equality ranges have inclusive bounds");
        };
        return vec![BoundSpec {
            bound: IndexBound::Eq,
            value,
        }];
    }
    let mut bounds = Vec::new();
    match range.low {
        Bound::None => {}
        Bound::Inclusive(value) => bounds.push(BoundSpec {
            bound: IndexBound::Le,
            value,
        }),
        Bound::Exclusive(value) => bounds.push(BoundSpec {
            bound: IndexBound::Lt,
            value,
        }),
    }
    match range.high {
        Bound::None => {}
        Bound::Inclusive(value) => bounds.push(BoundSpec {
            bound: IndexBound::Ge,
            value,
        }),
        Bound::Exclusive(value) => bounds.push(BoundSpec {
            bound: IndexBound::Gt,
            value,
        }),
    }
    bounds
}

/// Lower a condition tree to the native scan-filter form. The native filter
/// API wants a group at top level, so anything that is not AND/OR is
/// wrapped in a single-argument AND.
pub fn build_scan_filter(
    ce: &CondExpr,
    attr_id: impl Fn(ColIdx) -> Option<i32> + Copy,
) -> Result<ScanFilter, RsqlError> {
    let filter = lower_filter(ce, attr_id)?;
    Ok(match filter {
        ScanFilter::And(_) | ScanFilter::Or(_) => filter,
        other => ScanFilter::And(vec![other]),
    })
}

fn lower_filter(
    ce: &CondExpr,
    attr_id: impl Fn(ColIdx) -> Option<i32> + Copy,
) -> Result<ScanFilter, RsqlError> {
    match ce {
        CondExpr::And(left, right) => Ok(ScanFilter::And(vec![
            lower_filter(left, attr_id)?,
            lower_filter(right, attr_id)?,
        ])),
        CondExpr::Or(left, right) => Ok(ScanFilter::Or(vec![
            lower_filter(left, attr_id)?,
            lower_filter(right, attr_id)?,
        ])),
        CondExpr::Not(inner) => Ok(ScanFilter::Not(Box::new(lower_filter(inner, attr_id)?))),
        CondExpr::Cmp(op, left, right) => {
            let cond = match op {
                CmpOp::Eq => FilterCond::Eq,
                CmpOp::Ne => FilterCond::Ne,
                CmpOp::Lt => FilterCond::Lt,
                CmpOp::Le => FilterCond::Le,
                CmpOp::Gt => FilterCond::Gt,
                CmpOp::Ge => FilterCond::Ge,
            };
            match (left.as_ref(), right.as_ref()) {
                (CondExpr::Column(col), CondExpr::Column(other)) => {
                    let attr = resolve(*col, attr_id)?;
                    let other = resolve(*other, attr_id)?;
                    Ok(ScanFilter::Cmp {
                        cond,
                        attr_id: attr,
                        operand: FilterOperand::Column(other),
                    })
                }
                (CondExpr::Column(col), CondExpr::Int(value)) => Ok(ScanFilter::Cmp {
                    cond,
                    attr_id: resolve(*col, attr_id)?,
                    operand: FilterOperand::Int(*value),
                }),
                _ => Err(RsqlError::unsupported(
                    "Filter comparisons must have a column on the left-hand side.",
                )),
            }
        }
        CondExpr::Column(_) | CondExpr::Int(_) => Err(RsqlError::unsupported(
            "Bare values are not usable as filters.",
        )),
    }
}

fn resolve(col: ColIdx, attr_id: impl Fn(ColIdx) -> Option<i32>) -> Result<i32, RsqlError> {
    attr_id(col).ok_or_else(|| RsqlError::unsupported("Failed to get column."))
}
