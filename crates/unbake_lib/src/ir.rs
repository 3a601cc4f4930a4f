use serde::{Deserialize, Serialize};

use crate::unit::FuncId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    UShr,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    InstanceOf,
    LogicalAnd,
    LogicalOr,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::UShr => ">>>",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::StrictEq => "===",
            BinOp::StrictNe => "!==",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::InstanceOf => "instanceof",
            BinOp::LogicalAnd => "&&",
            BinOp::LogicalOr => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
    TypeOf,
}

impl UnOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
            UnOp::BitNot => "~",
            UnOp::TypeOf => "typeof ",
        }
    }
}

/// Resolution state of an outer-scope slot reference. Starts `Unresolved`;
/// the scope pass moves it to `Named` or `Unresolvable` exactly once, which
/// is what makes the pass idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OuterState {
    Unresolved,
    Named(String),
    Unresolvable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Undefined,
    Null,
    This,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Object-literal shape recovered from a template pool entry.
    Template(Vec<String>),
    Local(u16),
    Arg(u16),
    Outer { slot: u16, state: OuterState },
    Global(String),
    Bin { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Un { op: UnOp, operand: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Construct { callee: Box<Expr>, args: Vec<Expr> },
    Prop { obj: Box<Expr>, name: String },
    Elem { obj: Box<Expr>, key: Box<Expr> },
    /// Nested-function placeholder; spliced into the parent body at render
    /// time once the scope pass has run.
    Closure(FuncId),
    Cond { cond: Box<Expr>, then: Box<Expr>, els: Box<Expr> },
    /// Untranslatable instruction, carried through verbatim.
    Opaque(String),
}

impl Expr {
    pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Bin { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn un(op: UnOp, operand: Expr) -> Expr {
        Expr::Un { op, operand: Box::new(operand) }
    }

    pub fn outer(slot: u16) -> Expr {
        Expr::Outer { slot, state: OuterState::Unresolved }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Expr(Expr),
    Assign { target: Expr, value: Expr },
    Return(Option<Expr>),
    Throw(Expr),
    Label(u32),
    Goto(u32),
    CondGoto { cond: Expr, jump_if: bool, target: u32 },
    If { cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    While { cond: Expr, body: Vec<Stmt> },
    DoWhile { body: Vec<Stmt>, cond: Expr },
}

impl Stmt {
    /// True for the flat control markers that best-effort structuring leaves
    /// behind when no pattern matched.
    pub fn is_goto_marker(&self) -> bool {
        matches!(self, Stmt::Goto(_) | Stmt::CondGoto { .. } | Stmt::Label(_))
    }
}

/// Walk every expression in a statement tree, mutably.
pub fn visit_exprs_mut(stmts: &mut [Stmt], f: &mut impl FnMut(&mut Expr)) {
    for s in stmts {
        match s {
            Stmt::Expr(e) | Stmt::Throw(e) => visit_expr_mut(e, f),
            Stmt::Assign { target, value } => {
                visit_expr_mut(target, f);
                visit_expr_mut(value, f);
            }
            Stmt::Return(Some(e)) => visit_expr_mut(e, f),
            Stmt::Return(None) | Stmt::Label(_) | Stmt::Goto(_) => {}
            Stmt::CondGoto { cond, .. } => visit_expr_mut(cond, f),
            Stmt::If { cond, then_body, else_body } => {
                visit_expr_mut(cond, f);
                visit_exprs_mut(then_body, f);
                visit_exprs_mut(else_body, f);
            }
            Stmt::While { cond, body } => {
                visit_expr_mut(cond, f);
                visit_exprs_mut(body, f);
            }
            Stmt::DoWhile { body, cond } => {
                visit_exprs_mut(body, f);
                visit_expr_mut(cond, f);
            }
        }
    }
}

pub fn visit_expr_mut(e: &mut Expr, f: &mut impl FnMut(&mut Expr)) {
    f(e);
    match e {
        Expr::Bin { lhs, rhs, .. } => {
            visit_expr_mut(lhs, f);
            visit_expr_mut(rhs, f);
        }
        Expr::Un { operand, .. } => visit_expr_mut(operand, f),
        Expr::Call { callee, args } | Expr::Construct { callee, args } => {
            visit_expr_mut(callee, f);
            for a in args {
                visit_expr_mut(a, f);
            }
        }
        Expr::Prop { obj, .. } => visit_expr_mut(obj, f),
        Expr::Elem { obj, key } => {
            visit_expr_mut(obj, f);
            visit_expr_mut(key, f);
        }
        Expr::Cond { cond, then, els } => {
            visit_expr_mut(cond, f);
            visit_expr_mut(then, f);
            visit_expr_mut(els, f);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visit_reaches_nested_exprs() {
        let mut stmts = vec![Stmt::If {
            cond: Expr::outer(0),
            then_body: vec![Stmt::Return(Some(Expr::bin(
                BinOp::Add,
                Expr::outer(1),
                Expr::Int(2),
            )))],
            else_body: vec![Stmt::Assign { target: Expr::Local(0), value: Expr::outer(2) }],
        }];
        let mut seen = Vec::new();
        visit_exprs_mut(&mut stmts, &mut |e| {
            if let Expr::Outer { slot, .. } = e {
                seen.push(*slot);
            }
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_goto_marker_classification() {
        assert!(Stmt::Goto(4).is_goto_marker());
        assert!(Stmt::Label(0).is_goto_marker());
        assert!(!Stmt::Return(None).is_goto_marker());
    }
}
