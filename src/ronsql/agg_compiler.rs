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

//! Pushdown aggregation compiler.
//!
//! The parser builds a deduplicated expression DAG through the programming
//! API, then `compile` translates each declared aggregate into instructions
//! for the data nodes' eight-register aggregation VM. A symbolic VM mirrors
//! execution during compilation: register contents are expression nodes, so
//! the compiler can prove that at every aggregate-emit instruction the
//! source register holds exactly the declared expression.

use thiserror::Error;

/// Register file size, shared between the symbolic compile-time state and
/// the runtime target.
pub const REGS: usize = 8;

pub type ExprId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Load,
    LoadConstInt,
    Add,
    Sub,
    Mul,
    Div,
    DivInt,
    Rem,
}

#[derive(Debug, Clone)]
struct Expr {
    op: ExprOp,
    left: Option<ExprId>,
    right: Option<ExprId>,
    /// Column number for Load, constant index for LoadConstInt.
    idx: u32,
    /// Reference count from other Expr nodes and aggregates.
    usage: i32,
    /// Estimated register demand; guides evaluation order.
    est_regs: u32,
    eval_left_first: bool,
    /// Compiler bookkeeping.
    program_usage: i32,
    has_been_compiled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggType {
    Sum,
    Min,
    Max,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AggExpr {
    agg_type: AggType,
    expr: ExprId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrKind {
    Load,
    LoadConstInt,
    Mov,
    Add,
    Sub,
    Mul,
    Div,
    DivInt,
    Rem,
    Sum,
    Min,
    Max,
    Count,
}

impl InstrKind {
    fn of_op(op: ExprOp) -> InstrKind {
        match op {
            ExprOp::Load => InstrKind::Load,
            ExprOp::LoadConstInt => InstrKind::LoadConstInt,
            ExprOp::Add => InstrKind::Add,
            ExprOp::Sub => InstrKind::Sub,
            ExprOp::Mul => InstrKind::Mul,
            ExprOp::Div => InstrKind::Div,
            ExprOp::DivInt => InstrKind::DivInt,
            ExprOp::Rem => InstrKind::Rem,
        }
    }

    fn of_agg(agg: AggType) -> InstrKind {
        match agg {
            AggType::Sum => InstrKind::Sum,
            AggType::Min => InstrKind::Min,
            AggType::Max => InstrKind::Max,
            AggType::Count => InstrKind::Count,
        }
    }

    fn arith_op(self) -> Option<ExprOp> {
        match self {
            InstrKind::Add => Some(ExprOp::Add),
            InstrKind::Sub => Some(ExprOp::Sub),
            InstrKind::Mul => Some(ExprOp::Mul),
            InstrKind::Div => Some(ExprOp::Div),
            InstrKind::DivInt => Some(ExprOp::DivInt),
            InstrKind::Rem => Some(ExprOp::Rem),
            _ => None,
        }
    }

    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            InstrKind::Sum | InstrKind::Min | InstrKind::Max | InstrKind::Count
        )
    }
}

/// One VM instruction. For loads `src` is a column or constant index; for
/// aggregates `dest` is the aggregate index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub kind: InstrKind,
    pub dest: u32,
    pub src: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Programming,
    Compiling,
    Compiled,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("No suitable registers.")]
    NoSuitableRegisters,
}

#[derive(Debug)]
pub struct AggCompiler {
    status: Status,
    exprs: Vec<Expr>,
    aggs: Vec<AggExpr>,
    constants: Vec<i64>,
    program: Vec<Instr>,
    // Symbolic register file and per-register lock counts.
    regs: [Option<ExprId>; REGS],
    locked: [u32; REGS],
}

impl Default for AggCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl AggCompiler {
    pub fn new() -> Self {
        AggCompiler {
            status: Status::Programming,
            exprs: Vec::new(),
            aggs: Vec::new(),
            constants: Vec::new(),
            program: Vec::new(),
            regs: [None; REGS],
            locked: [0; REGS],
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn program(&self) -> &[Instr] {
        &self.program
    }

    pub fn constants(&self) -> &[i64] {
        &self.constants
    }

    pub fn n_aggregates(&self) -> usize {
        self.aggs.len()
    }

    pub fn aggregate(&self, idx: u32) -> (AggType, ExprId) {
        let agg = self.aggs[idx as usize];
        (agg.agg_type, agg.expr)
    }

    // ---- High-level (programming) API -----------------------------------

    pub fn load(&mut self, col_idx: u32) -> ExprId {
        assert_eq!(self.status, Status::Programming);
        self.new_expr(ExprOp::Load, None, None, col_idx)
    }

    pub fn constant_integer(&mut self, value: i64) -> ExprId {
        assert_eq!(self.status, Status::Programming);
        let idx = self.intern_constant(value);
        self.new_expr(ExprOp::LoadConstInt, None, None, idx)
    }

    pub fn add(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::Add, x, y)
    }

    pub fn sub(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::Sub, x, y)
    }

    pub fn mul(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::Mul, x, y)
    }

    pub fn div(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::Div, x, y)
    }

    pub fn div_int(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::DivInt, x, y)
    }

    pub fn rem(&mut self, x: ExprId, y: ExprId) -> ExprId {
        self.arith(ExprOp::Rem, x, y)
    }

    fn arith(&mut self, op: ExprOp, x: ExprId, y: ExprId) -> ExprId {
        assert_eq!(self.status, Status::Programming);
        self.new_expr(op, Some(x), Some(y), 0)
    }

    pub fn sum(&mut self, expr: ExprId) -> u32 {
        self.new_agg(AggType::Sum, expr)
    }

    pub fn min(&mut self, expr: ExprId) -> u32 {
        self.new_agg(AggType::Min, expr)
    }

    pub fn max(&mut self, expr: ExprId) -> u32 {
        self.new_agg(AggType::Max, expr)
    }

    pub fn count(&mut self, expr: ExprId) -> u32 {
        self.new_agg(AggType::Count, expr)
    }

    fn intern_constant(&mut self, value: i64) -> u32 {
        if let Some(idx) = self.constants.iter().position(|&c| c == value) {
            return idx as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    /// Deduplicating node constructor with constant folding. Folding uses
    /// checked 64-bit arithmetic: on overflow or division by zero the
    /// expression stays un-folded so runtime semantics are preserved.
    fn new_expr(
        &mut self,
        op: ExprOp,
        left: Option<ExprId>,
        right: Option<ExprId>,
        idx: u32,
    ) -> ExprId {
        debug_assert!(left.map_or(true, |l| (l as usize) < self.exprs.len()));
        debug_assert!(right.map_or(true, |r| (r as usize) < self.exprs.len()));
        let (est_regs, eval_left_first) = match op {
            ExprOp::Load | ExprOp::LoadConstInt => {
                debug_assert!(left.is_none() && right.is_none());
                (1, false)
            }
            _ => {
                let l = left.expect("binary op needs a left argument");
                let r = right.expect("binary op needs a right argument");
                debug_assert_eq!(idx, 0);
                let lr = self.exprs[l as usize].est_regs;
                let rr = self.exprs[r as usize].est_regs;
                // We cannot afford the exact register demand (it is
                // context dependent and exponential); the estimate decides
                // the evaluation order.
                if l == r {
                    (lr, true)
                } else if lr >= rr {
                    (lr.max(rr + 1), true)
                } else {
                    ((lr + 1).max(rr), false)
                }
            }
        };

        if let (Some(l), Some(r)) = (left, right) {
            if self.exprs[l as usize].op == ExprOp::LoadConstInt
                && self.exprs[r as usize].op == ExprOp::LoadConstInt
            {
                let a = self.constants[self.exprs[l as usize].idx as usize];
                let b = self.constants[self.exprs[r as usize].idx as usize];
                let folded = match op {
                    ExprOp::Add => a.checked_add(b),
                    ExprOp::Sub => a.checked_sub(b),
                    ExprOp::Mul => a.checked_mul(b),
                    ExprOp::Div | ExprOp::DivInt => a.checked_div(b),
                    ExprOp::Rem => a.checked_rem(b),
                    ExprOp::Load | ExprOp::LoadConstInt => unreachable!(),
                };
                if let Some(value) = folded {
                    let idx = self.intern_constant(value);
                    return self.new_expr(ExprOp::LoadConstInt, None, None, idx);
                }
            }
        }

        for (i, other) in self.exprs.iter().enumerate() {
            if other.op == op && other.left == left && other.right == right && other.idx == idx {
                return i as ExprId;
            }
        }
        // New nodes may only appear while programming; compilation deals in
        // nodes the parser already created.
        assert_eq!(self.status, Status::Programming);
        if let Some(l) = left {
            self.exprs[l as usize].usage += 1;
        }
        if let Some(r) = right {
            self.exprs[r as usize].usage += 1;
        }
        self.exprs.push(Expr {
            op,
            left,
            right,
            idx,
            usage: 0,
            est_regs,
            eval_left_first,
            program_usage: 0,
            has_been_compiled: false,
        });
        (self.exprs.len() - 1) as ExprId
    }

    fn new_agg(&mut self, agg_type: AggType, expr: ExprId) -> u32 {
        debug_assert!((expr as usize) < self.exprs.len());
        let agg = AggExpr { agg_type, expr };
        for (i, other) in self.aggs.iter().enumerate() {
            if *other == agg {
                return i as u32;
            }
        }
        assert_eq!(self.status, Status::Programming);
        self.exprs[expr as usize].usage += 1;
        self.aggs.push(agg);
        (self.aggs.len() - 1) as u32
    }

    /// Find an existing node without creating one. Used by the program
    /// listing, which replays the symbolic VM read-only.
    fn find_expr(&self, op: ExprOp, left: Option<ExprId>, right: Option<ExprId>, idx: u32) -> ExprId {
        self.exprs
            .iter()
            .position(|e| e.op == op && e.left == left && e.right == right && e.idx == idx)
            .map(|i| i as ExprId)
            .expect("symbolic execution only revisits existing nodes")
    }

    // ---- Symbolic virtual machine ---------------------------------------

    fn svm_init(&mut self) {
        self.regs = [None; REGS];
    }

    fn svm_use(&mut self, reg: u32, is_first_compilation: bool) {
        let expr = self.regs[reg as usize].expect("register read before initialization");
        if is_first_compilation {
            let e = &mut self.exprs[expr as usize];
            assert!(e.usage - e.program_usage > 0);
            e.program_usage += 1;
        }
    }

    fn svm_execute(&mut self, instr: Instr, is_first_compilation: bool) {
        let Instr { kind, dest, src } = instr;
        match kind {
            InstrKind::Load => {
                assert!((dest as usize) < REGS);
                let e = if self.status == Status::Compiling {
                    self.new_expr(ExprOp::Load, None, None, src)
                } else {
                    self.find_expr(ExprOp::Load, None, None, src)
                };
                self.regs[dest as usize] = Some(e);
            }
            InstrKind::LoadConstInt => {
                assert!((dest as usize) < REGS);
                let e = if self.status == Status::Compiling {
                    self.new_expr(ExprOp::LoadConstInt, None, None, src)
                } else {
                    self.find_expr(ExprOp::LoadConstInt, None, None, src)
                };
                self.regs[dest as usize] = Some(e);
            }
            InstrKind::Mov => {
                assert!((dest as usize) < REGS && (src as usize) < REGS);
                self.regs[dest as usize] = self.regs[src as usize];
            }
            _ if kind.arith_op().is_some() => {
                let op = kind.arith_op().expect("checked by guard");
                assert!((dest as usize) < REGS && (src as usize) < REGS);
                self.svm_use(dest, is_first_compilation);
                self.svm_use(src, is_first_compilation);
                let left = self.regs[dest as usize];
                let right = self.regs[src as usize];
                let e = if self.status == Status::Compiling {
                    self.new_expr(op, left, right, 0)
                } else {
                    self.find_expr(op, left, right, 0)
                };
                self.regs[dest as usize] = Some(e);
            }
            _ => {
                // Aggregate fold: the source register must hold exactly the
                // declared expression.
                assert!(kind.is_aggregate());
                assert!((dest as usize) < self.aggs.len());
                assert!((src as usize) < REGS);
                self.svm_use(src, is_first_compilation);
                assert_eq!(Some(self.aggs[dest as usize].expr), self.regs[src as usize]);
            }
        }
    }

    // ---- Compiler -------------------------------------------------------

    pub fn compile(&mut self) -> Result<(), CompileError> {
        assert_eq!(self.status, Status::Programming);
        self.status = Status::Compiling;
        self.svm_init();
        self.locked = [0; REGS];
        for e in &self.exprs {
            debug_assert!(0 < e.usage || e.op == ExprOp::LoadConstInt);
            debug_assert_eq!(e.program_usage, 0);
            debug_assert!(!e.has_been_compiled);
        }
        for i in 0..self.aggs.len() {
            let agg = self.aggs[i];
            let reg = match self.compile_expr(agg.expr) {
                Ok(reg) => reg,
                Err(e) => {
                    self.status = Status::Failed;
                    return Err(e);
                }
            };
            self.push_instr(InstrKind::of_agg(agg.agg_type), i as u32, reg, true);
        }
        for e in &self.exprs {
            debug_assert_eq!(e.usage, e.program_usage);
        }
        self.dead_code_elimination();
        self.status = Status::Compiled;

        // Prove the program: replay it symbolically and check that every
        // declared aggregate is emitted exactly once, in order, from a
        // register holding its expression.
        self.svm_init();
        let mut next_aggregate = 0u32;
        for i in 0..self.program.len() {
            let instr = self.program[i];
            self.svm_execute(instr, false);
            if instr.kind.is_aggregate() {
                assert_eq!(instr.dest, next_aggregate);
                next_aggregate += 1;
            }
        }
        assert_eq!(next_aggregate as usize, self.aggs.len());
        Ok(())
    }

    /// Compile one expression into a register. This is the most brittle
    /// part of the compiler; the assertions mirror its invariants.
    fn compile_expr(&mut self, expr: ExprId) -> Result<u32, CompileError> {
        assert_eq!(self.status, Status::Compiling);
        // If the value already sits in a register, use it.
        for i in 0..REGS {
            if self.regs[i] == Some(expr) {
                return Ok(i as u32);
            }
        }
        let is_first = !self.exprs[expr as usize].has_been_compiled;
        self.exprs[expr as usize].has_been_compiled = true;
        let op = self.exprs[expr as usize].op;
        let idx = self.exprs[expr as usize].idx;

        if op == ExprOp::Load || op == ExprOp::LoadConstInt {
            let reg = self
                .seize_register(u32::MAX)
                .ok_or(CompileError::NoSuitableRegisters)?;
            let kind = if op == ExprOp::Load {
                InstrKind::Load
            } else {
                InstrKind::LoadConstInt
            };
            self.push_instr(kind, reg, idx, is_first);
            return Ok(reg);
        }

        let left = self.exprs[expr as usize].left.expect("binary node");
        let right = self.exprs[expr as usize].right.expect("binary node");
        let eval_left_first = self.exprs[expr as usize].eval_left_first;
        let mut dest;
        let src;
        if left == right {
            dest = self.compile_expr(left)?;
            src = dest;
            // The same register is locked twice on purpose.
            self.locked[dest as usize] += 2;
        } else if eval_left_first {
            dest = self.compile_expr(left)?;
            self.locked[dest as usize] += 1;
            src = self.compile_expr(right)?;
            self.locked[src as usize] += 1;
        } else {
            src = self.compile_expr(right)?;
            self.locked[src as usize] += 1;
            dest = self.compile_expr(left)?;
            self.locked[dest as usize] += 1;
        }
        assert_eq!(self.regs[dest as usize], Some(left));
        assert_eq!(self.regs[src as usize], Some(right));
        assert!(self.locked[dest as usize] > 0 && self.locked[src as usize] > 0);
        let both = dest == src;
        if both {
            assert!(self.locked[dest as usize] >= 2);
        }
        let own_locks: i32 = if both { 2 } else { 1 };

        let left_node = &self.exprs[left as usize];
        if left_node.usage - left_node.program_usage > own_locks {
            // The destination holds a value needed later; try to save a
            // copy before the op overwrites it, but only into a register
            // whose current value is cheaper to lose.
            let copy_exists = (0..REGS)
                .any(|i| i as u32 != dest && self.regs[i] == Some(left));
            if !copy_exists {
                let max_cost = self.estimated_cost_of_recalculating(Some(left), dest);
                if let Some(new_reg) = self.seize_register(max_cost) {
                    assert_eq!(self.regs[dest as usize], Some(left));
                    self.push_instr(InstrKind::Mov, new_reg, dest, is_first);
                    assert_eq!(self.regs[new_reg as usize], Some(left));
                }
            }
        }

        if self.locked[dest as usize] > own_locks as u32 {
            // The destination is locked by an enclosing computation, so the
            // op must write somewhere else.
            let mut new_dest = None;
            for i in 0..REGS {
                if self.regs[i] == Some(left) && self.locked[i] == 0 {
                    new_dest = Some(i as u32);
                    break;
                }
            }
            let new_dest = match new_dest {
                Some(r) => r,
                None => self
                    .seize_register(u32::MAX)
                    .ok_or(CompileError::NoSuitableRegisters)?,
            };
            assert_eq!(self.locked[new_dest as usize], 0);
            if self.regs[new_dest as usize] != Some(left) {
                self.push_instr(InstrKind::Mov, new_dest, dest, is_first);
            }
            self.locked[new_dest as usize] += 1;
            self.locked[dest as usize] -= 1;
            dest = new_dest;
        }
        assert_eq!(self.regs[dest as usize], Some(left));
        assert_eq!(self.locked[dest as usize], if both { 2 } else { 1 });
        self.locked[dest as usize] -= 1;
        assert_eq!(self.regs[src as usize], Some(right));
        assert!(self.locked[src as usize] >= 1);
        self.locked[src as usize] -= 1;
        self.push_instr(InstrKind::of_op(op), dest, src, is_first);
        assert_eq!(self.regs[dest as usize], Some(expr));
        Ok(dest)
    }

    /// Choose a register to overwrite, minimizing the estimated cost of
    /// recalculating whatever it holds. Returns `None` when every candidate
    /// is locked or more expensive than `max_cost`.
    fn seize_register(&mut self, max_cost: u32) -> Option<u32> {
        assert_eq!(self.status, Status::Compiling);
        let mut cost = [0u32; REGS];
        let mut best = 0usize;
        let mut min_cost = u32::MAX;
        for i in 0..REGS {
            cost[i] = if self.locked[i] != 0 {
                u32::MAX
            } else {
                match self.regs[i] {
                    None => 0,
                    Some(e) => {
                        let node = &self.exprs[e as usize];
                        if node.usage == node.program_usage {
                            0
                        } else {
                            self.estimated_cost_of_recalculating(Some(e), i as u32)
                        }
                    }
                }
            };
            if cost[i] < min_cost {
                min_cost = cost[i];
                best = i;
            }
        }
        if self.locked[best] == 0 && cost[best] <= max_cost {
            return Some(best as u32);
        }
        None
    }

    /// Estimate the instruction count to recalculate `expr` from the
    /// current registers, pretending `without_using_reg` is unavailable.
    /// Reuse of shared subexpressions is not modeled, so the real cost is
    /// never larger.
    fn estimated_cost_of_recalculating(&self, expr: Option<ExprId>, without_using_reg: u32) -> u32 {
        let Some(expr) = expr else {
            return 0;
        };
        for i in 0..REGS {
            if i as u32 == without_using_reg {
                continue;
            }
            if self.regs[i] == Some(expr) {
                return 0;
            }
        }
        let node = &self.exprs[expr as usize];
        if node.op == ExprOp::Load {
            return 1;
        }
        1_u32
            .saturating_add(self.estimated_cost_of_recalculating(node.left, without_using_reg))
            .saturating_add(self.estimated_cost_of_recalculating(node.right, without_using_reg))
    }

    fn push_instr(&mut self, kind: InstrKind, dest: u32, src: u32, is_first_compilation: bool) {
        let instr = Instr { kind, dest, src };
        self.program.push(instr);
        self.svm_execute(instr, is_first_compilation);
    }

    /// Drop instructions whose destination is never needed later. Only Mov
    /// instructions can be useless; the compiler does not emit dead work of
    /// any other kind.
    fn dead_code_elimination(&mut self) {
        if self.program.is_empty() {
            return;
        }
        let mut reg_needed = [false; REGS];
        let mut instr_useful = vec![false; self.program.len()];
        let mut dead_code_found = false;
        for idx in (0..self.program.len()).rev() {
            let Instr { kind, dest, src } = self.program[idx];
            let useful = match kind {
                InstrKind::Load | InstrKind::LoadConstInt => {
                    let useful = reg_needed[dest as usize];
                    if useful {
                        reg_needed[dest as usize] = false;
                    }
                    useful
                }
                InstrKind::Mov => {
                    let useful = reg_needed[dest as usize];
                    if useful {
                        reg_needed[dest as usize] = false;
                        reg_needed[src as usize] = true;
                    }
                    useful
                }
                _ if kind.arith_op().is_some() => {
                    let useful = reg_needed[dest as usize];
                    if useful {
                        reg_needed[dest as usize] = true;
                        reg_needed[src as usize] = true;
                    }
                    useful
                }
                _ => {
                    assert!(kind.is_aggregate());
                    reg_needed[src as usize] = true;
                    true
                }
            };
            if useful {
                instr_useful[idx] = true;
            } else {
                assert_eq!(kind, InstrKind::Mov);
                dead_code_found = true;
            }
        }
        if dead_code_found {
            let old_program = std::mem::take(&mut self.program);
            self.svm_init();
            for (idx, instr) in old_program.into_iter().enumerate() {
                if instr_useful[idx] {
                    self.push_instr(instr.kind, instr.dest, instr.src, false);
                }
            }
        }
    }

    // ---- Printing (EXPLAIN support) -------------------------------------

    pub fn expr_to_string(&self, expr: ExprId, column_name: &dyn Fn(u32) -> String) -> String {
        let node = &self.exprs[expr as usize];
        match node.op {
            ExprOp::Load => quote_identifier(&column_name(node.idx)),
            ExprOp::LoadConstInt => self.constants[node.idx as usize].to_string(),
            _ => {
                let op = match node.op {
                    ExprOp::Add => " + ",
                    ExprOp::Sub => " - ",
                    ExprOp::Mul => " * ",
                    ExprOp::Div => " / ",
                    ExprOp::DivInt => " DIV ",
                    ExprOp::Rem => " %% ",
                    ExprOp::Load | ExprOp::LoadConstInt => unreachable!(),
                };
                format!(
                    "({}{op}{})",
                    self.expr_to_string(node.left.expect("binary node"), column_name),
                    self.expr_to_string(node.right.expect("binary node"), column_name),
                )
            }
        }
    }

    pub fn aggregate_to_string(&self, idx: u32, column_name: &dyn Fn(u32) -> String) -> String {
        let agg = self.aggs[idx as usize];
        let name = match agg.agg_type {
            AggType::Sum => "Sum",
            AggType::Min => "Min",
            AggType::Max => "Max",
            AggType::Count => "Count",
        };
        format!("{name}({})", self.expr_to_string(agg.expr, column_name))
    }

    /// Human-readable program listing for EXPLAIN output. Replays the
    /// symbolic VM read-only so every line can describe register contents.
    pub fn program_listing(&self, column_name: &dyn Fn(u32) -> String) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        if self.program.is_empty() {
            out.push_str("No aggregation program.\n\n");
            return out;
        }
        let _ = writeln!(
            out,
            "Aggregation program ({} instructions):",
            self.program.len()
        );
        out.push_str("Instr. DEST SRC DESCRIPTION\n");
        let mut regs: [Option<ExprId>; REGS] = [None; REGS];
        for instr in &self.program {
            let Instr { kind, dest, src } = *instr;
            match kind {
                InstrKind::Load => {
                    let e = self.find_expr(ExprOp::Load, None, None, src);
                    let _ = writeln!(
                        out,
                        "Load   r{:02}  C{:02} r{:02} = C{:02}:{}",
                        dest,
                        src,
                        dest,
                        src,
                        quote_identifier(&column_name(src))
                    );
                    regs[dest as usize] = Some(e);
                }
                InstrKind::LoadConstInt => {
                    let e = self.find_expr(ExprOp::LoadConstInt, None, None, src);
                    let _ = writeln!(
                        out,
                        "LoadI  r{:02}  I{:02} r{:02} = I{:02}:{}",
                        dest, src, dest, src, self.constants[src as usize]
                    );
                    regs[dest as usize] = Some(e);
                }
                InstrKind::Mov => {
                    let _ = writeln!(
                        out,
                        "Mov    r{:02}  r{:02} r{:02} = r{:02}:{}",
                        dest,
                        src,
                        dest,
                        src,
                        self.describe_reg(regs[src as usize], column_name)
                    );
                    regs[dest as usize] = regs[src as usize];
                }
                _ if kind.arith_op().is_some() => {
                    let op = kind.arith_op().expect("checked by guard");
                    let (name, rel) = match op {
                        ExprOp::Add => ("Add", "+"),
                        ExprOp::Sub => ("Sub", "-"),
                        ExprOp::Mul => ("Mul", "*"),
                        ExprOp::Div => ("Div", "/"),
                        ExprOp::DivInt => ("DivI", "DIV"),
                        ExprOp::Rem => ("Rem", "%"),
                        ExprOp::Load | ExprOp::LoadConstInt => unreachable!(),
                    };
                    let _ = writeln!(
                        out,
                        "{name:<5}  r{:02}  r{:02} r{:02}:{} {rel}= r{:02}:{}",
                        dest,
                        src,
                        dest,
                        self.describe_reg(regs[dest as usize], column_name),
                        src,
                        self.describe_reg(regs[src as usize], column_name)
                    );
                    let e = self.find_expr(op, regs[dest as usize], regs[src as usize], 0);
                    regs[dest as usize] = Some(e);
                }
                _ => {
                    let agg_name = match kind {
                        InstrKind::Sum => "Sum",
                        InstrKind::Min => "Min",
                        InstrKind::Max => "Max",
                        InstrKind::Count => "Count",
                        _ => unreachable!("aggregate kinds only"),
                    };
                    let _ = writeln!(
                        out,
                        "{agg_name:<5}  A{:02}  r{:02} A{:02}:{} <- r{:02}:{}",
                        dest,
                        src,
                        dest,
                        agg_name.to_uppercase(),
                        src,
                        self.describe_reg(regs[src as usize], column_name)
                    );
                }
            }
        }
        out
    }

    fn describe_reg(&self, reg: Option<ExprId>, column_name: &dyn Fn(u32) -> String) -> String {
        match reg {
            Some(e) => self.expr_to_string(e, column_name),
            None => "<EMPTY>".to_string(),
        }
    }
}

pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('`');
    for ch in name.chars() {
        if ch == '`' {
            out.push_str("``");
        } else {
            out.push(ch);
        }
    }
    out.push('`');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(_: u32) -> String {
        "c".to_string()
    }

    /// Interpret the program against a row, checking invariant P1 along the
    /// way, and return the aggregate accumulators.
    fn run_program(compiler: &AggCompiler, row: &[i64]) -> Vec<i64> {
        let mut regs: [Option<i64>; REGS] = [None; REGS];
        let mut aggs = vec![0i64; compiler.n_aggregates()];
        for instr in compiler.program() {
            let Instr { kind, dest, src } = *instr;
            match kind {
                InstrKind::Load => regs[dest as usize] = Some(row[src as usize]),
                InstrKind::LoadConstInt => {
                    regs[dest as usize] = Some(compiler.constants()[src as usize])
                }
                InstrKind::Mov => {
                    regs[dest as usize] = Some(regs[src as usize].expect("uninitialized register"))
                }
                InstrKind::Add => {
                    let a = regs[dest as usize].expect("uninitialized register");
                    let b = regs[src as usize].expect("uninitialized register");
                    regs[dest as usize] = Some(a + b);
                }
                InstrKind::Sub => {
                    let a = regs[dest as usize].expect("uninitialized register");
                    let b = regs[src as usize].expect("uninitialized register");
                    regs[dest as usize] = Some(a - b);
                }
                InstrKind::Mul => {
                    let a = regs[dest as usize].expect("uninitialized register");
                    let b = regs[src as usize].expect("uninitialized register");
                    regs[dest as usize] = Some(a * b);
                }
                InstrKind::Div | InstrKind::DivInt => {
                    let a = regs[dest as usize].expect("uninitialized register");
                    let b = regs[src as usize].expect("uninitialized register");
                    regs[dest as usize] = Some(a / b);
                }
                InstrKind::Rem => {
                    let a = regs[dest as usize].expect("uninitialized register");
                    let b = regs[src as usize].expect("uninitialized register");
                    regs[dest as usize] = Some(a % b);
                }
                InstrKind::Sum => {
                    aggs[dest as usize] += regs[src as usize].expect("uninitialized register")
                }
                InstrKind::Min | InstrKind::Max | InstrKind::Count => {
                    let _ = regs[src as usize].expect("uninitialized register");
                }
            }
        }
        aggs
    }

    #[test]
    fn identical_expressions_are_deduplicated() {
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let b = c.load(1);
        let x = c.add(a, b);
        let y = c.add(a, b);
        assert_eq!(x, y);
        let a2 = c.load(0);
        assert_eq!(a, a2);
    }

    #[test]
    fn constants_fold() {
        let mut c = AggCompiler::new();
        let two = c.constant_integer(2);
        let three = c.constant_integer(3);
        let six = c.mul(two, three);
        let six_again = c.constant_integer(6);
        assert_eq!(six, six_again);
    }

    #[test]
    fn overflowing_fold_is_left_alone() {
        let mut c = AggCompiler::new();
        let big = c.constant_integer(i64::MAX);
        let one = c.constant_integer(1);
        let sum = c.add(big, one);
        // Not folded: the node is a real Add over two constant loads.
        assert_eq!(c.exprs[sum as usize].op, ExprOp::Add);
        let agg = c.sum(sum);
        assert_eq!(agg, 0);
        c.compile().unwrap();
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut c = AggCompiler::new();
        let one = c.constant_integer(1);
        let zero = c.constant_integer(0);
        let div = c.div(one, zero);
        assert_eq!(c.exprs[div as usize].op, ExprOp::Div);
        let rem = c.rem(one, zero);
        assert_eq!(c.exprs[rem as usize].op, ExprOp::Rem);
    }

    #[test]
    fn estimator_prefers_heavier_subtree_first() {
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let b = c.load(1);
        let d = c.load(2);
        // (a + b) needs 2 regs, d needs 1: evaluate the sum first.
        let ab = c.add(a, b);
        let e = c.add(d, ab);
        assert!(!c.exprs[e as usize].eval_left_first);
        assert_eq!(c.exprs[e as usize].est_regs, 2);
        // Same-node operands share their register demand.
        let aa = c.add(a, a);
        assert_eq!(c.exprs[aa as usize].est_regs, 1);
        assert!(c.exprs[aa as usize].eval_left_first);
    }

    #[test]
    fn register_pressure_stays_within_budget() {
        // SELECT SUM(a+b), SUM(a*b), SUM(a-c) ... GROUP BY d
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let b = c.load(1);
        let d = c.load(2);
        let ab = c.add(a, b);
        let mul = c.mul(a, b);
        let sub = c.sub(a, d);
        c.sum(ab);
        c.sum(mul);
        c.sum(sub);
        c.compile().unwrap();

        let sums = c
            .program()
            .iter()
            .filter(|i| i.kind == InstrKind::Sum)
            .count();
        assert_eq!(sums, 3);
        for instr in c.program() {
            if !instr.kind.is_aggregate() {
                assert!((instr.dest as usize) < REGS);
            }
            if instr.kind != InstrKind::Load && instr.kind != InstrKind::LoadConstInt {
                assert!((instr.src as usize) < REGS);
            }
        }
        // Semantics: a=5, b=7, c(col 2)=2.
        let aggs = run_program(&c, &[5, 7, 2]);
        assert_eq!(aggs, vec![12, 35, 3]);
    }

    #[test]
    fn compiling_twice_yields_identical_programs() {
        let build = || {
            let mut c = AggCompiler::new();
            let a = c.load(0);
            let b = c.load(1);
            let ab = c.add(a, b);
            let k = c.constant_integer(10);
            let scaled = c.mul(ab, k);
            c.sum(scaled);
            c.max(ab);
            c.compile().unwrap();
            c.program().to_vec()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn shared_subexpression_is_reused_not_recomputed() {
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let b = c.load(1);
        let ab = c.add(a, b);
        c.sum(ab);
        c.min(ab);
        c.max(ab);
        c.compile().unwrap();
        // a and b are loaded exactly once; the sum is computed once.
        let loads = c
            .program()
            .iter()
            .filter(|i| i.kind == InstrKind::Load)
            .count();
        assert_eq!(loads, 2);
        let adds = c
            .program()
            .iter()
            .filter(|i| i.kind == InstrKind::Add)
            .count();
        assert_eq!(adds, 1);
    }

    #[test]
    fn deep_expression_spills_and_still_computes() {
        // Build a chain deep enough to exercise Mov-preservation:
        // sum over ((a0+a1)+(a2+a3)) ... with many distinct columns.
        let mut c = AggCompiler::new();
        let leaves: Vec<ExprId> = (0..8).map(|i| c.load(i)).collect();
        let mut nodes = leaves.clone();
        while nodes.len() > 1 {
            let mut next = Vec::new();
            for pair in nodes.chunks(2) {
                if pair.len() == 2 {
                    next.push(c.add(pair[0], pair[1]));
                } else {
                    next.push(pair[0]);
                }
            }
            nodes = next;
        }
        c.sum(nodes[0]);
        // Keep every leaf alive through another aggregate to raise pressure.
        for leaf in &leaves {
            c.max(*leaf);
        }
        c.compile().unwrap();
        let row: Vec<i64> = (1..=8).collect();
        let aggs = run_program(&c, &row);
        assert_eq!(aggs[0], 36);
    }

    #[test]
    fn dce_only_removes_movs() {
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let b = c.load(1);
        let ab = c.add(a, b);
        let ab2 = c.mul(ab, a);
        c.sum(ab2);
        c.sum(ab);
        c.compile().unwrap();
        // Whatever the program looks like, no instruction writes a register
        // that is never observed afterwards.
        let mut needed = [false; REGS];
        for instr in c.program().iter().rev() {
            match instr.kind {
                InstrKind::Load | InstrKind::LoadConstInt => {
                    assert!(needed[instr.dest as usize]);
                    needed[instr.dest as usize] = false;
                }
                InstrKind::Mov => {
                    assert!(needed[instr.dest as usize]);
                    needed[instr.dest as usize] = false;
                    needed[instr.src as usize] = true;
                }
                k if k.is_aggregate() => needed[instr.src as usize] = true,
                _ => {
                    assert!(needed[instr.dest as usize]);
                    needed[instr.src as usize] = true;
                }
            }
        }
    }

    #[test]
    fn explain_listing_mentions_each_aggregate() {
        let mut c = AggCompiler::new();
        let a = c.load(0);
        let k = c.constant_integer(5);
        let scaled = c.mul(a, k);
        c.sum(scaled);
        c.compile().unwrap();
        let listing = c.program_listing(&|_| "price".to_string());
        assert!(listing.contains("Aggregation program"));
        assert!(listing.contains("`price`"));
        assert!(listing.contains("SUM"));
    }
}
