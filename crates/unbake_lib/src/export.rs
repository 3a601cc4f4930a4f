//! Text rendering and snapshot persistence for a processed collection.
//!
//! Three output kinds, independently selectable: the raw listing (always
//! available, even for failed units), the flat translated IR, and the
//! structured pseudocode. Requested kinds concatenate per function in the
//! fixed order raw, translated, decompiled. Functions iterate in processing
//! order (innermost first); once nested bodies have been spliced into their
//! parents, only top-level functions are emitted.

use serde::{Deserialize, Serialize};

use crate::UnbakeError;
use crate::ir::{Expr, OuterState, Stmt};
use crate::unit::{FuncId, FunctionCollection, FunctionUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExportKind {
    Raw,
    Translated,
    Decompiled,
}

impl ExportKind {
    fn marker(self) -> &'static str {
        match self {
            ExportKind::Raw => "// ---- raw ----",
            ExportKind::Translated => "// ---- translated ----",
            ExportKind::Decompiled => "// ---- decompiled ----",
        }
    }
}

pub fn export_collection(col: &FunctionCollection, kinds: &[ExportKind]) -> String {
    let mut kinds: Vec<ExportKind> = kinds.to_vec();
    kinds.sort();
    kinds.dedup();

    let spliced_anywhere = col.units.iter().any(|u| u.spliced);
    let order: Vec<FuncId> = col
        .resolve_order()
        .into_iter()
        .filter(|id| !(spliced_anywhere && col.get(*id).spliced))
        .collect();

    let mut out = String::new();
    for id in order {
        let unit = col.get(id);
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!(
            "// ==== function {} (args={}, regs={}, src={}..{}) ====\n",
            unit.name, unit.param_count, unit.register_count, unit.span.start, unit.span.end
        ));
        if let Some(msg) = &unit.failed {
            out.push_str(&format!("// error: {msg}\n"));
        }
        for d in &unit.diagnostics {
            out.push_str(&format!("// {d}\n"));
        }
        for kind in &kinds {
            if kinds.len() > 1 {
                out.push_str(kind.marker());
                out.push('\n');
            }
            match kind {
                ExportKind::Raw => out.push_str(&render_raw(unit)),
                ExportKind::Translated => out.push_str(&render_translated(col, unit)),
                ExportKind::Decompiled => out.push_str(&render_decompiled(col, unit)),
            }
        }
    }
    out
}

pub fn render_raw(unit: &FunctionUnit) -> String {
    let mut out = String::new();
    for insn in &unit.insns {
        out.push_str(&format!("{:05} {:<16}", insn.offset, insn.symbol()));
        let operands: Vec<String> = insn.operands.iter().map(|o| o.to_string()).collect();
        if !operands.is_empty() {
            out.push_str(&format!(" {}", operands.join(", ")));
        }
        out.push('\n');
    }
    out
}

pub fn render_translated(col: &FunctionCollection, unit: &FunctionUnit) -> String {
    let Some(body) = &unit.translated else {
        return "// translated output unavailable\n".to_string();
    };
    let r = Renderer { col, inline_closures: false };
    let mut out = String::new();
    for (bi, block) in body.blocks.iter().enumerate() {
        if body.code[bi].absorbed {
            continue;
        }
        out.push_str(&format!("L{}:\n", block.start));
        out.push_str(&r.stmts(unit, &body.code[bi].stmts, 2));
    }
    out
}

pub fn render_decompiled(col: &FunctionCollection, unit: &FunctionUnit) -> String {
    let Some(structured) = &unit.structured else {
        return "// decompiled output unavailable\n".to_string();
    };
    let r = Renderer { col, inline_closures: true };
    let mut out = String::new();
    out.push_str(&r.function_header(unit, 0));
    out.push_str(&r.stmts(unit, structured.body(), 2));
    out.push_str("}\n");
    out
}

struct Renderer<'a> {
    col: &'a FunctionCollection,
    /// Whether nested-function placeholders expand to their spliced bodies.
    inline_closures: bool,
}

impl<'a> Renderer<'a> {
    fn function_header(&self, unit: &FunctionUnit, indent: usize) -> String {
        let pad = " ".repeat(indent);
        let params: Vec<String> = (0..unit.param_count).map(|i| unit.arg_name(i)).collect();
        format!("{pad}function {}({}) {{\n", unit.name, params.join(", "))
    }

    fn stmts(&self, unit: &FunctionUnit, stmts: &[Stmt], indent: usize) -> String {
        let pad = " ".repeat(indent);
        let mut out = String::new();
        for s in stmts {
            match s {
                Stmt::Expr(e) => out.push_str(&format!("{pad}{};\n", self.expr(unit, e, indent))),
                Stmt::Assign { target, value } => out.push_str(&format!(
                    "{pad}{} = {};\n",
                    self.expr(unit, target, indent),
                    self.expr(unit, value, indent)
                )),
                Stmt::Return(Some(e)) => {
                    out.push_str(&format!("{pad}return {};\n", self.expr(unit, e, indent)))
                }
                Stmt::Return(None) => out.push_str(&format!("{pad}return;\n")),
                Stmt::Throw(e) => {
                    out.push_str(&format!("{pad}throw {};\n", self.expr(unit, e, indent)))
                }
                Stmt::Label(t) => out.push_str(&format!("{pad}L{t}:\n")),
                Stmt::Goto(t) => out.push_str(&format!("{pad}goto L{t};\n")),
                Stmt::CondGoto { cond, jump_if, target } => {
                    let c = self.expr(unit, cond, indent);
                    if *jump_if {
                        out.push_str(&format!("{pad}if ({c}) goto L{target};\n"));
                    } else {
                        out.push_str(&format!("{pad}if (!{c}) goto L{target};\n"));
                    }
                }
                Stmt::If { cond, then_body, else_body } => {
                    out.push_str(&format!(
                        "{pad}if ({}) {{\n",
                        self.expr(unit, cond, indent)
                    ));
                    out.push_str(&self.stmts(unit, then_body, indent + 2));
                    if else_body.is_empty() {
                        out.push_str(&format!("{pad}}}\n"));
                    } else {
                        out.push_str(&format!("{pad}}} else {{\n"));
                        out.push_str(&self.stmts(unit, else_body, indent + 2));
                        out.push_str(&format!("{pad}}}\n"));
                    }
                }
                Stmt::While { cond, body } => {
                    out.push_str(&format!(
                        "{pad}while ({}) {{\n",
                        self.expr(unit, cond, indent)
                    ));
                    out.push_str(&self.stmts(unit, body, indent + 2));
                    out.push_str(&format!("{pad}}}\n"));
                }
                Stmt::DoWhile { body, cond } => {
                    out.push_str(&format!("{pad}do {{\n"));
                    out.push_str(&self.stmts(unit, body, indent + 2));
                    out.push_str(&format!(
                        "{pad}}} while ({});\n",
                        self.expr(unit, cond, indent)
                    ));
                }
            }
        }
        out
    }

    fn expr(&self, unit: &FunctionUnit, e: &Expr, indent: usize) -> String {
        match e {
            Expr::Undefined => "undefined".to_string(),
            Expr::Null => "null".to_string(),
            Expr::This => "this".to_string(),
            Expr::Bool(b) => b.to_string(),
            Expr::Int(v) => v.to_string(),
            Expr::Float(v) => v.to_string(),
            Expr::Str(s) => format!("\"{}\"", escape_str(s)),
            Expr::Template(keys) => {
                let parts: Vec<String> =
                    keys.iter().map(|k| format!("{k}: undefined")).collect();
                format!("{{{}}}", parts.join(", "))
            }
            Expr::Local(r) => unit.local_name(*r),
            Expr::Arg(a) => unit.arg_name(*a),
            Expr::Outer { slot, state } => match state {
                OuterState::Unresolved => format!("<outer:o{slot}>"),
                OuterState::Named(n) => n.clone(),
                OuterState::Unresolvable => format!("<unresolved:o{slot}>"),
            },
            Expr::Global(n) => n.clone(),
            Expr::Bin { op, lhs, rhs } => format!(
                "({} {} {})",
                self.expr(unit, lhs, indent),
                op.symbol(),
                self.expr(unit, rhs, indent)
            ),
            Expr::Un { op, operand } => {
                format!("({}{})", op.symbol(), self.expr(unit, operand, indent))
            }
            Expr::Call { callee, args } => format!(
                "{}({})",
                self.expr(unit, callee, indent),
                self.args(unit, args, indent)
            ),
            Expr::Construct { callee, args } => format!(
                "new {}({})",
                self.expr(unit, callee, indent),
                self.args(unit, args, indent)
            ),
            Expr::Prop { obj, name } => format!("{}.{name}", self.expr(unit, obj, indent)),
            Expr::Elem { obj, key } => format!(
                "{}[{}]",
                self.expr(unit, obj, indent),
                self.expr(unit, key, indent)
            ),
            Expr::Cond { cond, then, els } => format!(
                "({} ? {} : {})",
                self.expr(unit, cond, indent),
                self.expr(unit, then, indent),
                self.expr(unit, els, indent)
            ),
            Expr::Closure(id) => self.closure(*id, indent),
            Expr::Opaque(text) => text.clone(),
        }
    }

    fn args(&self, unit: &FunctionUnit, args: &[Expr], indent: usize) -> String {
        let parts: Vec<String> = args.iter().map(|a| self.expr(unit, a, indent)).collect();
        parts.join(", ")
    }

    fn closure(&self, id: FuncId, indent: usize) -> String {
        let child = self.col.get(id);
        // bodies embed only once the scope pass has spliced them
        let body = match &child.structured {
            Some(s) if self.inline_closures && child.spliced => s.body(),
            _ => return format!("<function:{}>", child.name),
        };
        let pad = " ".repeat(indent);
        let mut out = String::new();
        out.push_str(&self.function_header(child, 0));
        out.push_str(&self.stmts(child, body, indent + 2));
        out.push_str(&format!("{pad}}}"));
        out
    }
}

fn escape_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

pub fn save_snapshot(col: &FunctionCollection) -> Result<Vec<u8>, UnbakeError> {
    postcard::to_allocvec(col).map_err(|e| UnbakeError::Snapshot(e.to_string()))
}

pub fn load_snapshot(bytes: &[u8]) -> Result<FunctionCollection, UnbakeError> {
    postcard::from_bytes(bytes).map_err(|e| UnbakeError::Snapshot(e.to_string()))
}
