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

//! Compiled result printer.
//!
//! At prepare time the SELECT list, GROUP BY list and output format are
//! compiled into a small command program; at execution time the program
//! runs once per aggregator result record, storing the record's columns and
//! aggregates into printer registers and emitting JSON or TSV.

use std::fmt::Write as _;

use crate::dal::{AggResultRecord, AggValue, ScanValue};

use super::ast::{Output, SelectStatement};
use super::{OutputFormat, RsqlError};

#[derive(Debug, Clone, PartialEq)]
enum Cmd {
    StoreGroupByColumn { reg_g: usize },
    EndOfGroupByColumns,
    StoreAggregate { reg_a: usize },
    EndOfAggregates,
    PrintGroupByColumn { reg_g: usize },
    PrintAggregate { reg_a: usize },
    PrintAvg { reg_sum: usize, reg_count: usize },
    PrintStr(String),
    PrintStrJson(String),
}

#[derive(Debug)]
pub struct ResultPrinter {
    program: Vec<Cmd>,
    output_names: Vec<String>,
    n_group_regs: usize,
    n_agg_regs: usize,
    json_output: bool,
    utf8_output: bool,
    tsv_output: bool,
    tsv_headers: bool,
}

impl ResultPrinter {
    /// Compile the printer program. Fails when a SELECT column does not
    /// appear in GROUP BY.
    pub fn new(
        stmt: &SelectStatement<'_>,
        column_names: &[&str],
        format: OutputFormat,
    ) -> Result<Self, RsqlError> {
        let (json_output, utf8_output, tsv_output, tsv_headers) = match format {
            OutputFormat::Json => (true, true, false, false),
            OutputFormat::JsonAscii => (true, false, false, false),
            OutputFormat::Text => (false, true, true, true),
            OutputFormat::TextNoheader => (false, true, true, false),
        };

        // Map column index -> group-by register.
        let mut number_of_aggregates = 0usize;
        let mut col_groupby_reg = vec![None; column_names.len()];
        for (reg, col) in stmt.group_by.iter().enumerate() {
            col_groupby_reg[*col as usize] = Some(reg);
        }
        for output in &stmt.outputs {
            match output {
                Output::Column { col_idx, .. } => {
                    if col_groupby_reg[*col_idx as usize].is_none() {
                        let name = column_names[*col_idx as usize];
                        return Err(RsqlError::unsupported(format!(
                            "Syntax error: SELECT expression refers to ungrouped column \
                             `{name}` outside of aggregate function. You can either add this \
                             column to the GROUP BY clause, or use it within an aggregate \
                             function e.g. Sum(`{name}`)."
                        )));
                    }
                }
                Output::Aggregate { agg_index, .. } => {
                    number_of_aggregates = number_of_aggregates.max(*agg_index as usize + 1);
                }
                Output::Avg {
                    agg_index_sum,
                    agg_index_count,
                    ..
                } => {
                    number_of_aggregates = number_of_aggregates.max(*agg_index_sum as usize + 1);
                    number_of_aggregates =
                        number_of_aggregates.max(*agg_index_count as usize + 1);
                }
            }
        }

        let mut program = Vec::new();
        for reg_g in 0..stmt.group_by.len() {
            program.push(Cmd::StoreGroupByColumn { reg_g });
        }
        program.push(Cmd::EndOfGroupByColumns);
        for reg_a in 0..number_of_aggregates {
            program.push(Cmd::StoreAggregate { reg_a });
        }
        program.push(Cmd::EndOfAggregates);

        for (i, output) in stmt.outputs.iter().enumerate() {
            let is_first = i == 0;
            if json_output {
                let separator = if is_first { "{" } else { "," };
                program.push(Cmd::PrintStr(separator.to_string()));
                program.push(Cmd::PrintStrJson(output.output_name().to_string()));
                program.push(Cmd::PrintStr(":".to_string()));
            } else if tsv_output && !is_first {
                program.push(Cmd::PrintStr("\t".to_string()));
            }
            match output {
                Output::Column { col_idx, .. } => {
                    let reg_g = col_groupby_reg[*col_idx as usize]
                        .expect("validated against GROUP BY above");
                    program.push(Cmd::PrintGroupByColumn { reg_g });
                }
                Output::Aggregate { agg_index, .. } => {
                    program.push(Cmd::PrintAggregate {
                        reg_a: *agg_index as usize,
                    });
                }
                Output::Avg {
                    agg_index_sum,
                    agg_index_count,
                    ..
                } => {
                    program.push(Cmd::PrintAvg {
                        reg_sum: *agg_index_sum as usize,
                        reg_count: *agg_index_count as usize,
                    });
                }
            }
        }
        let terminator = if json_output { "}\n" } else { "\n" };
        program.push(Cmd::PrintStr(terminator.to_string()));

        Ok(ResultPrinter {
            program,
            output_names: stmt
                .outputs
                .iter()
                .map(|o| o.output_name().to_string())
                .collect(),
            n_group_regs: stmt.group_by.len(),
            n_agg_regs: number_of_aggregates,
            json_output,
            utf8_output,
            tsv_output,
            tsv_headers,
        })
    }

    /// Render all result records in the configured format.
    pub fn print_result(
        &self,
        records: &[AggResultRecord],
        out: &mut String,
    ) -> Result<(), RsqlError> {
        if self.json_output {
            out.push('[');
            for (i, record) in records.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                self.print_record(record, out)?;
            }
            out.push_str("]\n");
        } else {
            debug_assert!(self.tsv_output);
            for (i, record) in records.iter().enumerate() {
                if i == 0 && self.tsv_headers {
                    // The header row is only printed when there is at least
                    // one record.
                    for (j, name) in self.output_names.iter().enumerate() {
                        if j > 0 {
                            out.push('\t');
                        }
                        out.push_str(name);
                    }
                    out.push('\n');
                }
                self.print_record(record, out)?;
            }
        }
        Ok(())
    }

    fn print_record(&self, record: &AggResultRecord, out: &mut String) -> Result<(), RsqlError> {
        let mut regs_g: Vec<Option<&ScanValue>> = vec![None; self.n_group_regs];
        let mut regs_a: Vec<Option<AggValue>> = vec![None; self.n_agg_regs];
        let mut next_group = 0usize;
        let mut next_agg = 0usize;
        for cmd in &self.program {
            match cmd {
                Cmd::StoreGroupByColumn { reg_g } => {
                    let column = record.group_columns.get(next_group).ok_or_else(|| {
                        RsqlError::unsupported(
                            "Got record with fewer GROUP BY columns than expected.",
                        )
                    })?;
                    next_group += 1;
                    regs_g[*reg_g] = Some(column);
                }
                Cmd::EndOfGroupByColumns => {
                    if next_group != record.group_columns.len() {
                        return Err(RsqlError::unsupported(
                            "Got record with more GROUP BY columns than expected.",
                        ));
                    }
                }
                Cmd::StoreAggregate { reg_a } => {
                    let result = record.aggregates.get(next_agg).ok_or_else(|| {
                        RsqlError::unsupported("Got record with fewer aggregates than expected.")
                    })?;
                    next_agg += 1;
                    regs_a[*reg_a] = Some(*result);
                }
                Cmd::EndOfAggregates => {
                    if next_agg != record.aggregates.len() {
                        return Err(RsqlError::unsupported(
                            "Got record with more aggregates than expected.",
                        ));
                    }
                }
                Cmd::PrintGroupByColumn { reg_g } => {
                    let column = regs_g[*reg_g].ok_or_else(|| {
                        RsqlError::unsupported("GROUP BY register was never stored.")
                    })?;
                    self.print_column(column, out)?;
                }
                Cmd::PrintAggregate { reg_a } => {
                    let result = regs_a[*reg_a].ok_or_else(|| {
                        RsqlError::unsupported("Aggregate register was never stored.")
                    })?;
                    self.print_aggregate(result, out);
                }
                Cmd::PrintAvg { reg_sum, reg_count } => {
                    let sum = regs_a[*reg_sum].ok_or_else(|| {
                        RsqlError::unsupported("Aggregate register was never stored.")
                    })?;
                    let count = regs_a[*reg_count].ok_or_else(|| {
                        RsqlError::unsupported("Aggregate register was never stored.")
                    })?;
                    let value = agg_to_double(sum) / agg_to_double(count);
                    self.print_double(value, out);
                }
                Cmd::PrintStr(text) => out.push_str(text),
                Cmd::PrintStrJson(text) => {
                    print_json_string(out, text, self.utf8_output);
                }
            }
        }
        Ok(())
    }

    fn print_column(&self, column: &ScanValue, out: &mut String) -> Result<(), RsqlError> {
        match column {
            ScanValue::Int8(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::UInt8(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::Int16(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::UInt16(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::Int24(v) | ScanValue::Int32(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::UInt24(v) | ScanValue::UInt32(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::Int64(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::UInt64(v) => {
                let _ = write!(out, "{v}");
            }
            ScanValue::Char(bytes) => {
                // Fixed-width char is space padded on the wire.
                let mut content = bytes.as_slice();
                while let Some((&last, rest)) = content.split_last() {
                    if last == 0x20 {
                        content = rest;
                    } else {
                        break;
                    }
                }
                self.print_text(content, out);
            }
            ScanValue::Varchar(bytes) => self.print_text(bytes, out),
            ScanValue::Date(packed) => {
                let year = packed >> 9;
                let month = (packed >> 5) & 0xf;
                let day = packed & 0x1f;
                let _ = write!(out, "{year}-{month:02}-{day:02}");
            }
            ScanValue::Null => {
                return Err(RsqlError::unsupported(
                    "NULL GROUP BY columns are not supported.",
                ))
            }
        }
        Ok(())
    }

    fn print_text(&self, bytes: &[u8], out: &mut String) {
        let text = String::from_utf8_lossy(bytes);
        if self.json_output {
            print_json_string(out, &text, self.utf8_output);
        } else {
            out.push_str(&text);
        }
    }

    fn print_aggregate(&self, result: AggValue, out: &mut String) {
        match result {
            AggValue::Int64(v) => {
                let _ = write!(out, "{v}");
            }
            AggValue::UInt64(v) => {
                let _ = write!(out, "{v}");
            }
            AggValue::Double(v) => self.print_double(v, out),
            AggValue::Null => {
                out.push_str(if self.json_output { "null" } else { "NULL" });
            }
        }
    }

    fn print_double(&self, value: f64, out: &mut String) {
        if self.json_output {
            let _ = write!(out, "{value:.6}");
        } else if value.is_finite() {
            let _ = write!(out, "{value}");
        } else {
            out.push_str("NULL");
        }
    }

    /// One-line summary for EXPLAIN output.
    pub fn explain(&self, out: &mut String) {
        let description = match (self.json_output, self.utf8_output, self.tsv_headers) {
            (true, true, _) => "UTF-8 encoded JSON",
            (true, false, _) => "ASCII encoded JSON",
            (false, _, true) => "mysql-style tab separated",
            (false, _, false) => "mysql-style tab separated, header-less",
        };
        let _ = writeln!(
            out,
            "Output in {description} format.\nThe program for post-processing and output has {} instructions.",
            self.program.len()
        );
    }
}

fn agg_to_double(value: AggValue) -> f64 {
    match value {
        AggValue::Int64(v) => v as f64,
        AggValue::UInt64(v) => v as f64,
        AggValue::Double(v) => v,
        AggValue::Null => f64::NAN,
    }
}

/// JSON-escape a UTF-8 string. In UTF-8 mode only the mandatory escapes are
/// applied; in ASCII mode every code point at or above U+0080 becomes a
/// `\uXXXX` escape, with surrogate pairs above the BMP.
pub fn print_json_string(out: &mut String, text: &str, utf8_output: bool) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ if (ch as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            _ if utf8_output || (ch as u32) < 0x80 => out.push(ch),
            _ if (ch as u32) <= 0xffff => {
                let _ = write!(out, "\\u{:04x}", ch as u32);
            }
            _ => {
                let sp = ch as u32 - 0x10000;
                let high = 0xd800 + (sp >> 10);
                let low = 0xdc00 + (sp & 0x3ff);
                let _ = write!(out, "\\u{high:04x}\\u{low:04x}");
            }
        }
    }
    out.push('"');
}
