//! Abstract interpretation of one function's instruction stream.
//!
//! Walks instructions in offset order, simulating the evaluation stack with
//! IR expressions instead of values. Register stores become assignment
//! statements and register reads become variable references, so the
//! translated output preserves the original store order. Stack contents are
//! carried across fall-through edges; joins whose incoming stacks disagree
//! are reported on the unit, except for the short-circuit boolean pattern,
//! which is folded into a single expression.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::insn::{Insn, Opcode, Operand, op_info};
use crate::ir::{BinOp, Expr, Stmt, UnOp};
use crate::unit::{ConstEntry, FunctionUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    FallThrough,
    Jump,
    BranchTaken,
}

/// One basic block: a maximal run with a single entry and exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Byte offset of the first instruction.
    pub start: u32,
    /// Index range into the unit's instruction list.
    pub lo: usize,
    pub hi: usize,
    pub succs: Vec<(usize, EdgeKind)>,
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockIr {
    pub stmts: Vec<Stmt>,
    pub exit_stack: Vec<Expr>,
    /// Folded away into a short-circuit expression; emits nothing.
    pub absorbed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedBody {
    pub blocks: Vec<Block>,
    pub code: Vec<BlockIr>,
}

pub fn build_blocks(insns: &[Insn]) -> Vec<Block> {
    if insns.is_empty() {
        return Vec::new();
    }

    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(insns[0].offset);
    for (idx, insn) in insns.iter().enumerate() {
        let info = op_info(insn.op);
        if let Some(t) = insn.target {
            leaders.insert(t);
        }
        if (info.is_jump || info.terminates) && idx + 1 < insns.len() {
            leaders.insert(insns[idx + 1].offset);
        }
    }

    let offset_to_idx: HashMap<u32, usize> =
        insns.iter().enumerate().map(|(i, x)| (x.offset, i)).collect();
    let leader_list: Vec<u32> = leaders.into_iter().collect();
    let block_of_offset: HashMap<u32, usize> =
        leader_list.iter().enumerate().map(|(bi, off)| (*off, bi)).collect();

    let mut blocks: Vec<Block> = Vec::with_capacity(leader_list.len());
    for (bi, &start) in leader_list.iter().enumerate() {
        let lo = offset_to_idx[&start];
        let hi = match leader_list.get(bi + 1) {
            Some(next) => offset_to_idx[next],
            None => insns.len(),
        };
        blocks.push(Block { start, lo, hi, succs: Vec::new(), reachable: false });
    }

    for bi in 0..blocks.len() {
        let last = &insns[blocks[bi].hi - 1];
        let info = op_info(last.op);
        let mut succs = Vec::new();
        if info.is_jump {
            if let Some(t) = last.target {
                if let Some(&tb) = block_of_offset.get(&t) {
                    succs.push((tb, if info.is_cond { EdgeKind::BranchTaken } else { EdgeKind::Jump }));
                }
            }
            if info.is_cond && bi + 1 < blocks.len() {
                succs.push((bi + 1, EdgeKind::FallThrough));
            }
        } else if !info.terminates && bi + 1 < blocks.len() {
            succs.push((bi + 1, EdgeKind::FallThrough));
        }
        blocks[bi].succs = succs;
    }

    // reachability from the function entry
    let mut stack = vec![0usize];
    while let Some(bi) = stack.pop() {
        if blocks[bi].reachable {
            continue;
        }
        blocks[bi].reachable = true;
        for (s, _) in blocks[bi].succs.clone() {
            stack.push(s);
        }
    }

    blocks
}

struct Interp<'a> {
    unit: &'a FunctionUnit,
    stack: Vec<Expr>,
    stmts: Vec<Stmt>,
    diags: Vec<(Option<u32>, String)>,
    unknown_ops: &'a mut HashSet<String>,
}

impl<'a> Interp<'a> {
    fn pop(&mut self, offset: u32) -> Expr {
        match self.stack.pop() {
            Some(e) => e,
            None => {
                self.diags.push((Some(offset), "stack underflow".to_string()));
                Expr::Opaque("<underflow>".to_string())
            }
        }
    }

    fn push(&mut self, e: Expr) {
        self.stack.push(e);
    }

    fn const_expr(&self, k: u32) -> Expr {
        match self.unit.const_entry(k) {
            Some(ConstEntry::Int(v)) => Expr::Int(*v),
            Some(ConstEntry::Float(v)) => Expr::Float(*v),
            Some(ConstEntry::Str(s)) => Expr::Str(s.clone()),
            Some(ConstEntry::Template(keys)) => Expr::Template(keys.clone()),
            Some(ConstEntry::Func { name, id }) => match id {
                Some(id) => Expr::Closure(*id),
                None => Expr::Opaque(format!("<function:{name}>")),
            },
            Some(ConstEntry::Unsupported { tag }) => Expr::Opaque(format!("<tag:{tag}>")),
            // out-of-range indices were already reported during validation
            None => Expr::Opaque(format!("<const:{k}>")),
        }
    }

    fn pool_name(&mut self, insn: &Insn, k: u32) -> String {
        match self.unit.const_str(k) {
            Some(s) => s.to_string(),
            None => {
                self.diags.push((
                    Some(insn.offset),
                    format!("constant pool index {k} is not a name"),
                ));
                format!("<const:{k}>")
            }
        }
    }

    fn call_args(&mut self, insn: &Insn) -> Vec<Expr> {
        let argc = insn.argc().unwrap_or_else(|| {
            self.diags.push((Some(insn.offset), "call without argc operand".to_string()));
            0
        });
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            args.push(self.pop(insn.offset));
        }
        args.reverse();
        args
    }

    fn step(&mut self, insn: &Insn) {
        use Opcode::*;
        let offset = insn.offset;
        match insn.op {
            PushConst => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let e = self.const_expr(*k);
                    self.push(e);
                }
            }
            PushInt => {
                if let Some(Operand::Imm(v)) = insn.operands.first() {
                    self.push(Expr::Int(*v));
                }
            }
            PushTrue => self.push(Expr::Bool(true)),
            PushFalse => self.push(Expr::Bool(false)),
            PushNull => self.push(Expr::Null),
            PushUndef => self.push(Expr::Undefined),
            PushThis => self.push(Expr::This),
            Dup => {
                let v = self.pop(offset);
                self.push(v.clone());
                self.push(v);
            }
            Drop => {
                // a discarded call still happened; keep it as a statement
                let v = self.pop(offset);
                if matches!(v, Expr::Call { .. } | Expr::Construct { .. } | Expr::Opaque(_)) {
                    self.stmts.push(Stmt::Expr(v));
                }
            }
            Swap => {
                let a = self.pop(offset);
                let b = self.pop(offset);
                self.push(a);
                self.push(b);
            }
            GetLocal => {
                if let Some(Operand::Reg(r)) = insn.operands.first() {
                    self.push(Expr::Local(*r));
                }
            }
            SetLocal => {
                if let Some(Operand::Reg(r)) = insn.operands.first() {
                    let value = self.pop(offset);
                    self.stmts.push(Stmt::Assign { target: Expr::Local(*r), value });
                }
            }
            GetArg => {
                if let Some(Operand::Arg(a)) = insn.operands.first() {
                    self.push(Expr::Arg(*a));
                }
            }
            SetArg => {
                if let Some(Operand::Arg(a)) = insn.operands.first() {
                    let value = self.pop(offset);
                    self.stmts.push(Stmt::Assign { target: Expr::Arg(*a), value });
                }
            }
            GetOuter => {
                if let Some(Operand::Outer(o)) = insn.operands.first() {
                    self.push(Expr::outer(*o));
                }
            }
            SetOuter => {
                if let Some(Operand::Outer(o)) = insn.operands.first() {
                    let value = self.pop(offset);
                    self.stmts.push(Stmt::Assign { target: Expr::outer(*o), value });
                }
            }
            GetGlobal => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let name = self.pool_name(insn, *k);
                    self.push(Expr::Global(name));
                }
            }
            SetGlobal => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let name = self.pool_name(insn, *k);
                    let value = self.pop(offset);
                    self.stmts.push(Stmt::Assign { target: Expr::Global(name), value });
                }
            }
            GetProp => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let name = self.pool_name(insn, *k);
                    let obj = self.pop(offset);
                    self.push(Expr::Prop { obj: Box::new(obj), name });
                }
            }
            SetProp => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let name = self.pool_name(insn, *k);
                    let value = self.pop(offset);
                    let obj = self.pop(offset);
                    self.stmts.push(Stmt::Assign {
                        target: Expr::Prop { obj: Box::new(obj), name },
                        value,
                    });
                }
            }
            GetElem => {
                let key = self.pop(offset);
                let obj = self.pop(offset);
                self.push(Expr::Elem { obj: Box::new(obj), key: Box::new(key) });
            }
            SetElem => {
                let value = self.pop(offset);
                let key = self.pop(offset);
                let obj = self.pop(offset);
                self.stmts.push(Stmt::Assign {
                    target: Expr::Elem { obj: Box::new(obj), key: Box::new(key) },
                    value,
                });
            }
            Add | Sub | Mul | Div | Mod | BitAnd | BitOr | BitXor | Shl | Shr | UShr | Eq
            | Ne | StrictEq | StrictNe | Lt | Le | Gt | Ge | In | InstanceOf => {
                let rhs = self.pop(offset);
                let lhs = self.pop(offset);
                let op = match insn.op {
                    Add => BinOp::Add,
                    Sub => BinOp::Sub,
                    Mul => BinOp::Mul,
                    Div => BinOp::Div,
                    Mod => BinOp::Mod,
                    BitAnd => BinOp::BitAnd,
                    BitOr => BinOp::BitOr,
                    BitXor => BinOp::BitXor,
                    Shl => BinOp::Shl,
                    Shr => BinOp::Shr,
                    UShr => BinOp::UShr,
                    Eq => BinOp::Eq,
                    Ne => BinOp::Ne,
                    StrictEq => BinOp::StrictEq,
                    StrictNe => BinOp::StrictNe,
                    Lt => BinOp::Lt,
                    Le => BinOp::Le,
                    Gt => BinOp::Gt,
                    Ge => BinOp::Ge,
                    In => BinOp::In,
                    _ => BinOp::InstanceOf,
                };
                self.push(Expr::bin(op, lhs, rhs));
            }
            Neg | Not | BitNot | TypeOf => {
                let operand = self.pop(offset);
                let op = match insn.op {
                    Neg => UnOp::Neg,
                    Not => UnOp::Not,
                    BitNot => UnOp::BitNot,
                    _ => UnOp::TypeOf,
                };
                self.push(Expr::un(op, operand));
            }
            Call => {
                let args = self.call_args(insn);
                let callee = self.pop(offset);
                self.push(Expr::Call { callee: Box::new(callee), args });
            }
            Construct => {
                let args = self.call_args(insn);
                let callee = self.pop(offset);
                self.push(Expr::Construct { callee: Box::new(callee), args });
            }
            CallMethod => {
                let args = self.call_args(insn);
                let receiver = self.pop(offset);
                let name = match insn.operands.first() {
                    Some(Operand::Const(k)) => self.pool_name(insn, *k),
                    _ => {
                        self.diags
                            .push((Some(offset), "method call without name operand".to_string()));
                        "<method>".to_string()
                    }
                };
                self.push(Expr::Call {
                    callee: Box::new(Expr::Prop { obj: Box::new(receiver), name }),
                    args,
                });
            }
            Closure => {
                if let Some(Operand::Const(k)) = insn.operands.first() {
                    let e = match self.unit.const_entry(*k) {
                        Some(ConstEntry::Func { id: Some(id), .. }) => Expr::Closure(*id),
                        Some(ConstEntry::Func { name, id: None }) => {
                            Expr::Opaque(format!("<function:{name}>"))
                        }
                        _ => {
                            self.diags.push((
                                Some(offset),
                                format!("closure operand [{k}] is not a function"),
                            ));
                            Expr::Opaque(format!("<closure:{k}>"))
                        }
                    };
                    self.push(e);
                }
            }
            Jump => {
                if let Some(t) = insn.target {
                    self.stmts.push(Stmt::Goto(t));
                }
            }
            JumpIfTrue | JumpIfFalse => {
                let cond = self.pop(offset);
                if let Some(t) = insn.target {
                    self.stmts.push(Stmt::CondGoto {
                        cond,
                        jump_if: insn.op == JumpIfTrue,
                        target: t,
                    });
                }
            }
            Return => {
                let v = self.pop(offset);
                self.stmts.push(Stmt::Return(Some(v)));
            }
            ReturnUndef => self.stmts.push(Stmt::Return(None)),
            Throw => {
                let v = self.pop(offset);
                self.stmts.push(Stmt::Throw(v));
            }
            Nop => {}
            Opaque => {
                let sym = insn.symbol().to_string();
                if self.unknown_ops.insert(sym.clone()) {
                    self.diags.push((Some(offset), format!("unsupported opcode {sym}")));
                }
                let mut text = sym;
                for op in &insn.operands {
                    text.push(' ');
                    text.push_str(&op.to_string());
                }
                self.stmts.push(Stmt::Expr(Expr::Opaque(format!("<{text}>"))));
            }
        }
    }
}

/// Translate one unit into per-block IR. Skips nothing except units already
/// marked failed; every reported problem lands in the unit's diagnostics.
pub fn translate(unit: &mut FunctionUnit) {
    if unit.failed.is_some() || unit.translated.is_some() {
        return;
    }

    let blocks = build_blocks(&unit.insns);
    let mut code: Vec<BlockIr> = vec![BlockIr::default(); blocks.len()];
    let mut entry: Vec<Option<Vec<Expr>>> = vec![None; blocks.len()];
    let mut diags: Vec<(Option<u32>, String)> = Vec::new();
    let mut unknown_ops: HashSet<String> = HashSet::new();

    let mut preds: Vec<Vec<(usize, EdgeKind)>> = vec![Vec::new(); blocks.len()];
    for (bi, b) in blocks.iter().enumerate() {
        for (s, kind) in &b.succs {
            preds[*s].push((bi, *kind));
        }
    }

    let mut blocks = blocks;
    if !blocks.is_empty() {
        entry[0] = Some(Vec::new());
    }

    for bi in 0..blocks.len() {
        if code[bi].absorbed {
            continue;
        }
        let entry_stack = entry[bi].clone().unwrap_or_default();

        let mut interp = Interp {
            unit,
            stack: entry_stack,
            stmts: Vec::new(),
            diags: Vec::new(),
            unknown_ops: &mut unknown_ops,
        };
        for insn in &unit.insns[blocks[bi].lo..blocks[bi].hi] {
            interp.step(insn);
        }
        let Interp { stack: exit_stack, stmts, diags: block_diags, .. } = interp;
        diags.extend(block_diags);

        let last_terminates = unit
            .insns
            .get(blocks[bi].hi - 1)
            .map(|x| op_info(x.op).terminates)
            .unwrap_or(false);
        if last_terminates && !exit_stack.is_empty() {
            diags.push((
                Some(blocks[bi].start),
                format!("{} value(s) left on stack at function exit", exit_stack.len()),
            ));
        }

        code[bi] = BlockIr { stmts, exit_stack, absorbed: false };

        for (succ, _kind) in blocks[bi].succs.clone() {
            propose_entry(
                bi,
                succ,
                &mut blocks,
                &mut code,
                &mut entry,
                &preds,
                &mut diags,
            );
        }
    }

    for (off, msg) in diags {
        unit.diag(off, msg);
    }
    unit.translated = Some(TranslatedBody { blocks, code });
}

/// Thread the predecessor's exit stack into `succ`. On conflict, either fold
/// the short-circuit diamond or report the join mismatch.
fn propose_entry(
    from: usize,
    succ: usize,
    blocks: &mut Vec<Block>,
    code: &mut Vec<BlockIr>,
    entry: &mut Vec<Option<Vec<Expr>>>,
    preds: &[Vec<(usize, EdgeKind)>],
    diags: &mut Vec<(Option<u32>, String)>,
) {
    let exit = code[from].exit_stack.clone();
    if entry[succ].is_none() {
        entry[succ] = Some(exit);
        return;
    }
    {
        let prev = entry[succ].as_ref().expect("entry checked above");
        if prev.len() != exit.len() {
            diags.push((
                Some(blocks[succ].start),
                format!("stack depth mismatch at join: {} vs {}", prev.len(), exit.len()),
            ));
            return;
        }
        if *prev == exit {
            return;
        }
    }
    if try_fold_short_circuit(succ, blocks, code, entry, preds) {
        return;
    }
    diags.push((
        Some(blocks[succ].start),
        "stack contents differ at join".to_string(),
    ));
}

/// The one sanctioned join-with-different-stacks shape: a conditional whose
/// two arms each push one value and rejoin immediately. Folds to `&&`, `||`
/// or a conditional expression and rewires the graph so the structurer sees
/// straight-line flow.
fn try_fold_short_circuit(
    join: usize,
    blocks: &mut Vec<Block>,
    code: &mut Vec<BlockIr>,
    entry: &mut Vec<Option<Vec<Expr>>>,
    preds: &[Vec<(usize, EdgeKind)>],
) -> bool {
    if preds[join].len() != 2 {
        return false;
    }
    let (a, _) = preds[join][0];
    let (b, _) = preds[join][1];

    let arm_ok = |arm: usize, code: &[BlockIr]| -> bool {
        if preds[arm].len() != 1 {
            return false;
        }
        match code[arm].stmts.as_slice() {
            [] => true,
            [Stmt::Goto(_)] => true,
            _ => false,
        }
    };
    if !arm_ok(a, code) || !arm_ok(b, code) {
        return false;
    }
    let (branch_a, _) = preds[a][0];
    let (branch_b, _) = preds[b][0];
    if branch_a != branch_b {
        return false;
    }
    let branch = branch_a;

    let (cond, jump_if, target) = match code[branch].stmts.last() {
        Some(Stmt::CondGoto { cond, jump_if, target }) => (cond.clone(), *jump_if, *target),
        _ => return false,
    };

    // which arm does the branch jump to?
    let taken = if blocks[a].start == target {
        a
    } else if blocks[b].start == target {
        b
    } else {
        return false;
    };
    let fallthrough = if taken == a { b } else { a };

    let (then_arm, else_arm) = if jump_if { (taken, fallthrough) } else { (fallthrough, taken) };
    let then_top = match code[then_arm].exit_stack.last() {
        Some(e) => e.clone(),
        None => return false,
    };
    let else_top = match code[else_arm].exit_stack.last() {
        Some(e) => e.clone(),
        None => return false,
    };
    // everything below the top must agree
    let then_below = &code[then_arm].exit_stack[..code[then_arm].exit_stack.len() - 1];
    let else_below = &code[else_arm].exit_stack[..code[else_arm].exit_stack.len() - 1];
    if then_below != else_below {
        return false;
    }

    let folded = if else_top == Expr::Bool(false) {
        Expr::bin(BinOp::LogicalAnd, cond, then_top)
    } else if then_top == Expr::Bool(true) {
        Expr::bin(BinOp::LogicalOr, cond, else_top)
    } else {
        Expr::Cond {
            cond: Box::new(cond),
            then: Box::new(then_top),
            els: Box::new(else_top),
        }
    };

    let mut joined: Vec<Expr> = then_below.to_vec();
    joined.push(folded);
    entry[join] = Some(joined);

    code[branch].stmts.pop();
    for arm in [a, b] {
        code[arm].stmts.clear();
        code[arm].exit_stack.clear();
        code[arm].absorbed = true;
        blocks[arm].succs.clear();
    }
    blocks[branch].succs = vec![(join, EdgeKind::FallThrough)];
    true
}
