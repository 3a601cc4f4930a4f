//! Scope resolution over the whole collection.
//!
//! Runs strictly innermost-first so every child body is final before any
//! parent that declares it is rewritten. Outer-slot references resolve
//! against the static nesting chain; a miss becomes a visibly flagged
//! placeholder, never an error. The pass is idempotent: each reference
//! records its resolution state and is skipped the second time around.

use crate::ir::{Expr, OuterState, visit_expr_mut, visit_exprs_mut};
use crate::unit::{FuncId, FunctionCollection};

struct ScopeInfo {
    func_name: String,
    register_count: u16,
    local_names: Vec<String>,
}

pub fn resolve_collection(col: &mut FunctionCollection) {
    for id in col.resolve_order() {
        resolve_unit(col, id);
    }
}

fn resolve_unit(col: &mut FunctionCollection, id: FuncId) {
    if col.get(id).resolved {
        return;
    }

    let chain: Vec<ScopeInfo> = col
        .ancestors(id)
        .into_iter()
        .map(|a| {
            let u = col.get(a);
            ScopeInfo {
                func_name: u.name.clone(),
                register_count: u.register_count,
                local_names: u.local_names.clone(),
            }
        })
        .collect();

    let mut child_refs: Vec<FuncId> = Vec::new();
    let mut unresolved_slots: Vec<u16> = Vec::new();
    {
        let unit = col.get_mut(id);
        let mut rewrite = |e: &mut Expr| match e {
            Expr::Outer { slot, state } if *state == OuterState::Unresolved => {
                let new_state = resolve_slot(&chain, *slot);
                if new_state == OuterState::Unresolvable {
                    unresolved_slots.push(*slot);
                }
                *state = new_state;
            }
            Expr::Closure(cid) => child_refs.push(*cid),
            _ => {}
        };

        if let Some(body) = unit.translated.as_mut() {
            for block in body.code.iter_mut() {
                visit_exprs_mut(&mut block.stmts, &mut rewrite);
                for e in block.exit_stack.iter_mut() {
                    visit_expr_mut(e, &mut rewrite);
                }
            }
        }
        if let Some(structured) = unit.structured.as_mut() {
            visit_exprs_mut(structured.body_mut(), &mut rewrite);
        }

        unresolved_slots.sort_unstable();
        unresolved_slots.dedup();
        for slot in unresolved_slots {
            unit.diag(None, format!("unresolved outer slot o{slot}"));
        }
        unit.resolved = true;
    }

    // the referenced children are embedded at their declaration sites from
    // now on; top-level export skips them. A child with no body (failed
    // record) stays top level so its raw listing is not lost.
    child_refs.sort_unstable();
    child_refs.dedup();
    for cid in child_refs {
        if col.get(cid).structured.is_some() {
            col.get_mut(cid).spliced = true;
        }
    }
}

/// Nearest enclosing declaration for an outer slot. Metadata names win;
/// synthesized names are qualified with the declaring function so spliced
/// output stays unambiguous.
fn resolve_slot(chain: &[ScopeInfo], slot: u16) -> OuterState {
    for scope in chain {
        if slot < scope.register_count {
            let name = match scope.local_names.get(slot as usize) {
                Some(n) if !n.is_empty() => n.clone(),
                _ => format!("{}$loc{slot}", sanitize_ident(&scope.func_name)),
            };
            return OuterState::Named(name);
        }
    }
    OuterState::Unresolvable
}

pub fn sanitize_ident(s: &str) -> String {
    if s.is_empty() {
        return "_".into();
    }
    let mut out = String::new();
    for (i, ch) in s.chars().enumerate() {
        let ok = if i == 0 {
            ch == '_' || ch == '$' || ch.is_ascii_alphabetic()
        } else {
            ch == '_' || ch == '$' || ch.is_ascii_alphanumeric()
        };
        out.push(if ok { ch } else { '_' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{Insn, Opcode, Operand};
    use crate::interp::translate;
    use crate::ir::Stmt;
    use crate::structure::structure;
    use crate::unit::{ConstEntry, FunctionUnit, SourceSpan};

    fn build_pair(parent_locals: Vec<&str>) -> (FunctionCollection, FuncId, FuncId) {
        let mut col = FunctionCollection::new();

        let mut parent = FunctionUnit::new("outer", SourceSpan { start: 0, end: 40 }, 0, 2);
        parent.local_names = parent_locals.into_iter().map(String::from).collect();
        parent.cpool.push(ConstEntry::Func { name: "inner".to_string(), id: None });
        parent.insns = vec![
            Insn::new(0, Opcode::Closure, vec![Operand::Const(0)]),
            Insn::new(2, Opcode::SetLocal, vec![Operand::Reg(0)]),
            Insn::new(4, Opcode::ReturnUndef, vec![]),
        ];
        let p = col.add(parent);

        let mut child = FunctionUnit::new("inner", SourceSpan { start: 5, end: 30 }, 0, 0);
        child.insns = vec![
            Insn::new(0, Opcode::GetOuter, vec![Operand::Outer(0)]),
            Insn::new(2, Opcode::Return, vec![]),
        ];
        let c = col.add(child);

        col.link();
        for id in col.resolve_order() {
            let u = col.get_mut(id);
            translate(u);
            structure(u);
        }
        (col, p, c)
    }

    fn child_return_state(col: &FunctionCollection, c: FuncId) -> OuterState {
        match &col.get(c).structured.as_ref().unwrap().body()[0] {
            Stmt::Return(Some(Expr::Outer { state, .. })) => state.clone(),
            other => panic!("expected return of outer ref, got {other:?}"),
        }
    }

    #[test]
    fn test_outer_slot_resolves_to_metadata_name() {
        let (mut col, _p, c) = build_pair(vec!["counter"]);
        resolve_collection(&mut col);
        assert_eq!(child_return_state(&col, c), OuterState::Named("counter".to_string()));
        assert!(col.get(c).spliced);
    }

    #[test]
    fn test_outer_slot_falls_back_to_qualified_name() {
        let (mut col, _p, c) = build_pair(vec![]);
        resolve_collection(&mut col);
        assert_eq!(
            child_return_state(&col, c),
            OuterState::Named("outer$loc0".to_string())
        );
    }

    #[test]
    fn test_unresolvable_slot_is_flagged_not_fatal() {
        let mut col = FunctionCollection::new();
        let mut lone = FunctionUnit::new("lone", SourceSpan { start: 0, end: 0 }, 0, 0);
        lone.insns = vec![
            Insn::new(0, Opcode::GetOuter, vec![Operand::Outer(3)]),
            Insn::new(2, Opcode::Return, vec![]),
        ];
        let id = col.add(lone);
        col.link();
        translate(col.get_mut(id));
        structure(col.get_mut(id));
        resolve_collection(&mut col);

        assert_eq!(child_return_state(&col, id), OuterState::Unresolvable);
        assert!(col.get(id).failed.is_none());
        assert!(
            col.get(id)
                .diagnostics
                .iter()
                .any(|d| d.message.contains("unresolved outer slot o3"))
        );
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let (mut col, _p, c) = build_pair(vec!["counter"]);
        resolve_collection(&mut col);
        let before = col.get(c).clone();
        resolve_collection(&mut col);
        let after = col.get(c).clone();
        assert_eq!(format!("{before:?}"), format!("{after:?}"));
    }

    #[test]
    fn test_siblings_resolved_before_parent_regardless_of_pool_order() {
        let mut col = FunctionCollection::new();
        let mut parent = FunctionUnit::new("top", SourceSpan { start: 0, end: 99 }, 0, 2);
        // second sibling declared first in the pool
        parent.cpool.push(ConstEntry::Func { name: "second".to_string(), id: None });
        parent.cpool.push(ConstEntry::Func { name: "first".to_string(), id: None });
        parent.insns = vec![
            Insn::new(0, Opcode::Closure, vec![Operand::Const(0)]),
            Insn::new(2, Opcode::SetLocal, vec![Operand::Reg(0)]),
            Insn::new(4, Opcode::Closure, vec![Operand::Const(1)]),
            Insn::new(6, Opcode::SetLocal, vec![Operand::Reg(1)]),
            Insn::new(8, Opcode::ReturnUndef, vec![]),
        ];
        let p = col.add(parent);
        let mut a = FunctionUnit::new("first", SourceSpan { start: 1, end: 2 }, 0, 0);
        a.insns = vec![Insn::new(0, Opcode::ReturnUndef, vec![])];
        let a = col.add(a);
        let mut b = FunctionUnit::new("second", SourceSpan { start: 3, end: 4 }, 0, 0);
        b.insns = vec![Insn::new(0, Opcode::ReturnUndef, vec![])];
        let b = col.add(b);
        col.link();
        for id in col.resolve_order() {
            translate(col.get_mut(id));
            structure(col.get_mut(id));
        }

        let order = col.resolve_order();
        let pos = |id: FuncId| order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a) < pos(p));
        assert!(pos(b) < pos(p));

        resolve_collection(&mut col);
        assert!(col.get(a).resolved && col.get(a).spliced);
        assert!(col.get(b).resolved && col.get(b).spliced);
        assert!(col.get(p).resolved && !col.get(p).spliced);
    }
}
