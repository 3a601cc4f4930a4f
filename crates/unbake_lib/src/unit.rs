use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::insn::{Insn, Operand};
use crate::interp::TranslatedBody;
use crate::structure::Structured;

/// Arena index of a function unit. Units refer to each other only through
/// ids; the collection owns every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FuncId(pub usize);

impl FuncId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstEntry {
    Int(i64),
    Float(f64),
    Str(String),
    /// Nested function, referenced by identity. `id` is filled in by
    /// `FunctionCollection::link`; the name may be a forward reference to a
    /// sibling that is parsed later.
    Func { name: String, id: Option<FuncId> },
    /// Object-literal shape: the ordered property names.
    Template(Vec<String>),
    /// Pool tag this build does not understand; kept so indices stay stable.
    Unsupported { tag: String },
}

impl fmt::Display for ConstEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstEntry::Int(v) => write!(f, "{v}"),
            ConstEntry::Float(v) => write!(f, "{v}"),
            ConstEntry::Str(s) => write!(f, "\"{s}\""),
            ConstEntry::Func { name, .. } => write!(f, "<function:{name}>"),
            ConstEntry::Template(keys) => write!(f, "<template:{}>", keys.len()),
            ConstEntry::Unsupported { tag } => write!(f, "<tag:{tag}>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub start: u32,
    pub end: u32,
}

/// One accumulated per-function problem. Nothing here ever aborts the run;
/// diagnostics ride along into the exported text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub offset: Option<u32>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.offset {
            Some(off) => write!(f, "at {off}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionUnit {
    pub name: String,
    pub span: SourceSpan,
    pub param_count: u16,
    pub register_count: u16,
    /// Local names recovered from metadata; may be shorter than
    /// `register_count`, the rest are synthesized on demand.
    pub local_names: Vec<String>,
    pub insns: Vec<Insn>,
    pub cpool: Vec<ConstEntry>,

    pub parent: Option<FuncId>,
    pub children: Vec<FuncId>,

    pub translated: Option<TranslatedBody>,
    pub structured: Option<Structured>,
    pub resolved: bool,
    pub spliced: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Set when the record is unusable past the raw listing (bad jump
    /// target, register claim violation, cyclic nesting). Translation and
    /// structuring skip the unit; siblings are unaffected.
    pub failed: Option<String>,
}

impl FunctionUnit {
    pub fn new(name: &str, span: SourceSpan, param_count: u16, register_count: u16) -> FunctionUnit {
        FunctionUnit {
            name: name.to_string(),
            span,
            param_count,
            register_count,
            local_names: Vec::new(),
            insns: Vec::new(),
            cpool: Vec::new(),
            parent: None,
            children: Vec::new(),
            translated: None,
            structured: None,
            resolved: false,
            spliced: false,
            diagnostics: Vec::new(),
            failed: None,
        }
    }

    pub fn local_name(&self, slot: u16) -> String {
        match self.local_names.get(slot as usize) {
            Some(n) if !n.is_empty() => n.clone(),
            _ => format!("loc{slot}"),
        }
    }

    pub fn arg_name(&self, slot: u16) -> String {
        format!("arg{slot}")
    }

    pub fn diag(&mut self, offset: Option<u32>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic { offset, message: message.into() });
    }

    pub fn const_entry(&self, idx: u32) -> Option<&ConstEntry> {
        self.cpool.get(idx as usize)
    }

    /// Pool string at `idx`, for opcodes whose operand names a property or
    /// global.
    pub fn const_str(&self, idx: u32) -> Option<&str> {
        match self.cpool.get(idx as usize) {
            Some(ConstEntry::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCollection {
    pub units: Vec<FunctionUnit>,
}

impl FunctionCollection {
    pub fn new() -> FunctionCollection {
        FunctionCollection { units: Vec::new() }
    }

    pub fn add(&mut self, unit: FunctionUnit) -> FuncId {
        self.units.push(unit);
        FuncId(self.units.len() - 1)
    }

    pub fn get(&self, id: FuncId) -> &FunctionUnit {
        &self.units[id.index()]
    }

    pub fn get_mut(&mut self, id: FuncId) -> &mut FunctionUnit {
        &mut self.units[id.index()]
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.units.len()).map(FuncId)
    }

    pub fn find_by_name(&self, name: &str) -> Option<FuncId> {
        self.units.iter().position(|u| u.name == name).map(FuncId)
    }

    /// Resolve nested-function pool references to arena ids, derive the
    /// parent/child nesting relation, and validate each record. Call once
    /// after all units are added; forward references across siblings are
    /// fine because every unit exists by now.
    pub fn link(&mut self) {
        let by_name: HashMap<String, FuncId> = self
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.clone(), FuncId(i)))
            .collect();

        for i in 0..self.units.len() {
            let parent_id = FuncId(i);
            let mut resolved: Vec<(usize, Option<FuncId>)> = Vec::new();
            for (k, entry) in self.units[i].cpool.iter().enumerate() {
                if let ConstEntry::Func { name, .. } = entry {
                    resolved.push((k, by_name.get(name.as_str()).copied()));
                }
            }
            for (k, id) in resolved {
                let entry_name = match &self.units[i].cpool[k] {
                    ConstEntry::Func { name, .. } => name.clone(),
                    _ => unreachable!(),
                };
                match id {
                    Some(child) => {
                        if let ConstEntry::Func { id, .. } = &mut self.units[i].cpool[k] {
                            *id = Some(child);
                        }
                        if child == parent_id {
                            let msg = format!("function {entry_name:?} nests itself");
                            self.units[i].failed = Some(msg);
                            continue;
                        }
                        if self.units[child.index()].parent.is_none() {
                            self.units[child.index()].parent = Some(parent_id);
                            self.units[i].children.push(child);
                        } else if self.units[child.index()].parent != Some(parent_id) {
                            self.units[i].diag(
                                None,
                                format!("function {entry_name:?} already nested elsewhere"),
                            );
                        }
                    }
                    None => {
                        self.units[i]
                            .diag(None, format!("unknown nested function {entry_name:?}"));
                    }
                }
            }
        }

        self.break_nesting_cycles();

        for i in 0..self.units.len() {
            self.validate_unit(i);
        }
    }

    /// A unit that is its own (transitive) ancestor claims impossible
    /// nesting. Mark every member of such a chain failed and detach it so
    /// ordering stays well defined.
    fn break_nesting_cycles(&mut self) {
        let n = self.units.len();
        for start in 0..n {
            let mut cur = self.units[start].parent;
            let mut steps = 0usize;
            while let Some(p) = cur {
                if p.index() == start {
                    self.units[start].failed = Some("cyclic nesting claim".to_string());
                    self.units[start].parent = None;
                    break;
                }
                steps += 1;
                if steps > n {
                    break;
                }
                cur = self.units[p.index()].parent;
            }
        }
        for i in 0..n {
            let keep: Vec<FuncId> = self.units[i]
                .children
                .iter()
                .copied()
                .filter(|c| self.units[c.index()].parent == Some(FuncId(i)))
                .collect();
            self.units[i].children = keep;
        }
    }

    fn validate_unit(&mut self, i: usize) {
        if self.units[i].failed.is_some() {
            return;
        }

        let mut failure: Option<String> = None;
        let mut diags: Vec<(Option<u32>, String)> = Vec::new();
        {
            let unit = &self.units[i];

            let mut prev: Option<u32> = None;
            for insn in &unit.insns {
                if let Some(p) = prev {
                    if insn.offset <= p {
                        failure =
                            Some(format!("instruction offsets not increasing at {}", insn.offset));
                        break;
                    }
                }
                prev = Some(insn.offset);
            }

            let offsets: std::collections::BTreeSet<u32> =
                unit.insns.iter().map(|x| x.offset).collect();
            for insn in &unit.insns {
                if failure.is_some() {
                    break;
                }
                if let Some(t) = insn.target {
                    if !offsets.contains(&t) {
                        failure = Some(format!(
                            "jump target {t} at offset {} is not an instruction",
                            insn.offset
                        ));
                        break;
                    }
                }
                for op in &insn.operands {
                    match op {
                        Operand::Reg(r) if *r >= unit.register_count => {
                            failure = Some(format!(
                                "register r{r} at offset {} exceeds declared count {}",
                                insn.offset, unit.register_count
                            ));
                        }
                        Operand::Arg(a) if *a >= unit.param_count => {
                            diags.push((
                                Some(insn.offset),
                                format!("argument a{a} exceeds declared parameter count"),
                            ));
                        }
                        Operand::Const(k) if *k as usize >= unit.cpool.len() => {
                            diags.push((
                                Some(insn.offset),
                                format!("constant pool index {k} out of range"),
                            ));
                        }
                        _ => {}
                    }
                }
            }
        }

        for (off, msg) in diags {
            self.units[i].diag(off, msg);
        }
        if let Some(msg) = failure {
            self.units[i].failed = Some(msg);
        }
    }

    pub fn roots(&self) -> Vec<FuncId> {
        self.ids().filter(|id| self.get(*id).parent.is_none()).collect()
    }

    /// Innermost-first processing order: every child comes strictly before
    /// any unit that declares it. Computed from the nesting relation, never
    /// from insertion order.
    pub fn resolve_order(&self) -> Vec<FuncId> {
        let mut order = Vec::with_capacity(self.units.len());
        let mut visited = vec![false; self.units.len()];
        for root in self.roots() {
            self.post_order(root, &mut visited, &mut order);
        }
        // anything left is part of a broken nesting chain; still processed
        for id in self.ids() {
            if !visited[id.index()] {
                visited[id.index()] = true;
                order.push(id);
            }
        }
        order
    }

    fn post_order(&self, id: FuncId, visited: &mut Vec<bool>, order: &mut Vec<FuncId>) {
        if visited[id.index()] {
            return;
        }
        visited[id.index()] = true;
        for child in &self.get(id).children {
            self.post_order(*child, visited, order);
        }
        order.push(id);
    }

    /// Chain of enclosing units, nearest first.
    pub fn ancestors(&self, id: FuncId) -> Vec<FuncId> {
        let mut out = Vec::new();
        let mut cur = self.get(id).parent;
        while let Some(p) = cur {
            if out.contains(&p) {
                break;
            }
            out.push(p);
            cur = self.get(p).parent;
        }
        out
    }
}
