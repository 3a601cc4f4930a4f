//! Decompiler for script-engine bytecode caches.
//!
//! The pipeline runs per function, innermost first: abstract interpretation
//! of the instruction stream into IR, control-flow structuring of the block
//! graph, then a scope-resolution pass over the whole collection that
//! rewrites outer references and splices nested functions into their
//! parents. Every stage degrades per function instead of failing the run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod export;
pub mod insn;
pub mod interp;
pub mod ir;
pub mod listing;
pub mod resolve;
pub mod structure;
pub mod unit;

pub use export::{ExportKind, export_collection, load_snapshot, save_snapshot};
pub use insn::{Insn, Opcode, Operand};
pub use ir::{BinOp, Expr, OuterState, Stmt, UnOp};
pub use listing::parse_listing;
pub use structure::Structured;
pub use unit::{ConstEntry, Diagnostic, FuncId, FunctionCollection, FunctionUnit, SourceSpan};

#[derive(Debug, Error)]
pub enum UnbakeError {
    #[error("line {line}: {message}")]
    Listing { line: usize, message: String },

    #[error("listing contains no function records")]
    EmptyListing,

    #[error("snapshot: {0}")]
    Snapshot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    /// Rewrite outer-scope references and splice nested functions. Leaving
    /// slots raw is an explicit opt-out; resolved output is the default.
    pub resolve_scopes: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self { resolve_scopes: true }
    }
}

/// Run interpretation and structuring over every unit, innermost first,
/// then the scope pass. Safe to call on a collection that is already
/// partially or fully processed.
pub fn process_collection(col: &mut FunctionCollection, options: DecompileOptions) {
    for id in col.resolve_order() {
        let unit = col.get_mut(id);
        interp::translate(unit);
        structure::structure(unit);
    }
    if options.resolve_scopes {
        resolve::resolve_collection(col);
    }
}

/// Parse a disassembly listing and process every function in it.
pub fn decompile_listing(
    text: &str,
    options: DecompileOptions,
) -> Result<FunctionCollection, UnbakeError> {
    let mut col = listing::parse_listing(text)?;
    process_collection(&mut col, options);
    Ok(col)
}

/// One-call convenience: listing in, requested export kinds out.
pub fn decompile_listing_to_text(
    text: &str,
    options: DecompileOptions,
    kinds: &[ExportKind],
) -> Result<String, UnbakeError> {
    let col = decompile_listing(text, options)?;
    Ok(export_collection(&col, kinds))
}
