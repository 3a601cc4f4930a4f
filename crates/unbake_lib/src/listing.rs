//! Adapter over the external disassembler's textual output.
//!
//! The disassembler hands us a flat file of per-function records:
//!
//! ```text
//! function make_adder @ 0..57
//! params 1
//! registers 1
//! locals base
//! code:
//!   0 Closure [0]
//!   2 SetLocal r0
//!   4 GetLocal r0
//!   6 Return
//! constants:
//!   0: function adder
//! end
//! ```
//!
//! Operand syntax: `r3` local register, `a1` parameter, `o2` outer slot,
//! `[4]` constant pool index, `@12` jump target, bare integers immediates.
//! A malformed record is reported on that record and never aborts the rest
//! of the file; only content that fits no record at all is a hard error.

use crate::UnbakeError;
use crate::insn::{Insn, Opcode, Operand};
use crate::unit::{ConstEntry, FunctionCollection, FunctionUnit, SourceSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Code,
    Constants,
}

pub fn parse_listing(text: &str) -> Result<FunctionCollection, UnbakeError> {
    let mut col = FunctionCollection::new();
    let mut cur: Option<FunctionUnit> = None;
    let mut section = Section::Header;

    for (lineno0, raw) in text.lines().enumerate() {
        let lineno = lineno0 + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("function ") {
            if let Some(mut unit) = cur.take() {
                unit.diag(None, "record not terminated with end");
                col.add(unit);
            }
            cur = Some(parse_header(rest));
            section = Section::Header;
            continue;
        }

        if line == "end" && cur.is_some() {
            if let Some(unit) = cur.take() {
                col.add(unit);
            }
            section = Section::Header;
            continue;
        }

        let Some(unit) = cur.as_mut() else {
            return Err(UnbakeError::Listing {
                line: lineno,
                message: format!("content outside a function record: {line:?}"),
            });
        };

        match line {
            "code:" => section = Section::Code,
            "constants:" => section = Section::Constants,
            _ => match section {
                Section::Header => parse_header_field(unit, line),
                Section::Code => parse_code_line(unit, line),
                Section::Constants => parse_const_line(unit, line),
            },
        }
    }

    if let Some(mut unit) = cur.take() {
        unit.diag(None, "record not terminated with end");
        col.add(unit);
    }
    if col.is_empty() {
        return Err(UnbakeError::EmptyListing);
    }

    col.link();
    Ok(col)
}

fn parse_header(rest: &str) -> FunctionUnit {
    let (name_part, span_part) = match rest.split_once('@') {
        Some((n, s)) => (n.trim(), Some(s.trim())),
        None => (rest.trim(), None),
    };
    let name = if name_part.is_empty() { "anonymous" } else { name_part };

    let mut span = SourceSpan { start: 0, end: 0 };
    if let Some(s) = span_part {
        if let Some((a, b)) = s.split_once("..") {
            span.start = a.trim().parse().unwrap_or(0);
            span.end = b.trim().parse().unwrap_or(0);
        }
    }
    FunctionUnit::new(name, span, 0, 0)
}

fn parse_header_field(unit: &mut FunctionUnit, line: &str) {
    if let Some(v) = line.strip_prefix("params ") {
        match v.trim().parse() {
            Ok(n) => unit.param_count = n,
            Err(_) => unit.diag(None, format!("bad params line: {line:?}")),
        }
    } else if let Some(v) = line.strip_prefix("registers ") {
        match v.trim().parse() {
            Ok(n) => unit.register_count = n,
            Err(_) => unit.diag(None, format!("bad registers line: {line:?}")),
        }
    } else if let Some(v) = line.strip_prefix("locals ") {
        unit.local_names = v.split(',').map(|n| n.trim().to_string()).collect();
    } else {
        unit.diag(None, format!("unrecognized header line: {line:?}"));
    }
}

fn parse_code_line(unit: &mut FunctionUnit, line: &str) {
    let mut tokens = line.split_whitespace();
    let Some(off_tok) = tokens.next() else {
        return;
    };
    let Ok(offset) = off_tok.trim_end_matches(':').parse::<u32>() else {
        unit.diag(None, format!("bad instruction line: {line:?}"));
        return;
    };
    let Some(symbol) = tokens.next() else {
        unit.diag(Some(offset), "instruction without opcode");
        return;
    };

    let mut operands = Vec::new();
    for tok in tokens {
        match parse_operand(tok) {
            Some(op) => operands.push(op),
            None => unit.diag(Some(offset), format!("unparsable operand {tok:?}")),
        }
    }

    let insn = match Opcode::from_symbol(symbol) {
        Some(op) => Insn::new(offset, op, operands),
        None => Insn::opaque(offset, symbol, operands),
    };
    unit.insns.push(insn);
}

fn parse_operand(tok: &str) -> Option<Operand> {
    let t = tok.trim_end_matches(',');
    if let Some(x) = t.strip_prefix('@') {
        return x.parse().ok().map(Operand::Target);
    }
    if let Some(inner) = t.strip_prefix('[').and_then(|x| x.strip_suffix(']')) {
        return inner.parse().ok().map(Operand::Const);
    }
    if let Some(x) = t.strip_prefix('r') {
        if let Ok(r) = x.parse() {
            return Some(Operand::Reg(r));
        }
    }
    if let Some(x) = t.strip_prefix('a') {
        if let Ok(a) = x.parse() {
            return Some(Operand::Arg(a));
        }
    }
    if let Some(x) = t.strip_prefix('o') {
        if let Ok(o) = x.parse() {
            return Some(Operand::Outer(o));
        }
    }
    t.parse().ok().map(Operand::Imm)
}

fn parse_const_line(unit: &mut FunctionUnit, line: &str) {
    let Some((idx_part, rest)) = line.split_once(':') else {
        unit.diag(None, format!("bad constant line: {line:?}"));
        return;
    };
    match idx_part.trim().parse::<usize>() {
        Ok(idx) if idx == unit.cpool.len() => {}
        Ok(idx) => unit.diag(None, format!("constant index {idx} out of order")),
        Err(_) => {
            unit.diag(None, format!("bad constant line: {line:?}"));
            return;
        }
    }

    let rest = rest.trim();
    let (tag, payload) = match rest.split_once(' ') {
        Some((t, p)) => (t, p.trim()),
        None => (rest, ""),
    };
    let entry = match tag {
        "int" => match payload.parse() {
            Ok(v) => ConstEntry::Int(v),
            Err(_) => {
                unit.diag(None, format!("bad int constant: {payload:?}"));
                ConstEntry::Unsupported { tag: tag.to_string() }
            }
        },
        "float" => match payload.parse() {
            Ok(v) => ConstEntry::Float(v),
            Err(_) => {
                unit.diag(None, format!("bad float constant: {payload:?}"));
                ConstEntry::Unsupported { tag: tag.to_string() }
            }
        },
        "string" => ConstEntry::Str(parse_quoted(unit, payload)),
        "function" => {
            let name = if payload.is_empty() { "anonymous" } else { payload };
            ConstEntry::Func { name: name.to_string(), id: None }
        }
        "template" => ConstEntry::Template(
            payload
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect(),
        ),
        other => {
            unit.diag(None, format!("unknown constant tag {other:?}"));
            ConstEntry::Unsupported { tag: other.to_string() }
        }
    };
    unit.cpool.push(entry);
}

fn parse_quoted(unit: &mut FunctionUnit, payload: &str) -> String {
    let Some(inner) = payload.strip_prefix('"').and_then(|x| x.strip_suffix('"')) else {
        unit.diag(None, format!("unquoted string constant: {payload:?}"));
        return payload.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
function make_adder @ 0..57
params 1
registers 1
locals base
code:
  0 Closure [0]
  2 SetLocal r0
  4 GetLocal r0
  6 Return
constants:
  0: function adder
end

function adder @ 10..40
params 1
registers 0
code:
  0 GetOuter o0
  2 GetArg a0
  4 Add
  5 Return
constants:
end
"#;

    #[test]
    fn test_parse_links_forward_reference() {
        let col = parse_listing(SAMPLE).unwrap();
        assert_eq!(col.len(), 2);
        let parent = col.find_by_name("make_adder").unwrap();
        let child = col.find_by_name("adder").unwrap();
        assert_eq!(col.get(child).parent, Some(parent));
        assert_eq!(col.get(parent).children, vec![child]);
        assert_eq!(col.get(parent).local_names, vec!["base".to_string()]);
        assert_eq!(col.get(parent).span, SourceSpan { start: 0, end: 57 });
    }

    #[test]
    fn test_parse_instruction_operands() {
        let col = parse_listing(SAMPLE).unwrap();
        let child = col.find_by_name("adder").unwrap();
        let insns = &col.get(child).insns;
        assert_eq!(insns[0].op, Opcode::GetOuter);
        assert_eq!(insns[0].operands, vec![Operand::Outer(0)]);
        assert_eq!(insns[1].operands, vec![Operand::Arg(0)]);
        assert_eq!(insns[3].offset, 5);
    }

    #[test]
    fn test_unknown_opcode_becomes_opaque() {
        let text = "function f\nparams 0\nregisters 1\ncode:\n  0 Transmogrify r0, 7\n  3 ReturnUndef\nconstants:\nend\n";
        let col = parse_listing(text).unwrap();
        let u = col.get(col.find_by_name("f").unwrap());
        assert_eq!(u.insns[0].op, Opcode::Opaque);
        assert_eq!(u.insns[0].symbol(), "Transmogrify");
        assert_eq!(u.insns[0].operands.len(), 2);
        assert!(u.failed.is_none());
    }

    #[test]
    fn test_unknown_constant_tag_is_reported_not_fatal() {
        let text = "function f\nparams 0\nregisters 0\ncode:\n  0 ReturnUndef\nconstants:\n  0: regexp /x/\nend\n";
        let col = parse_listing(text).unwrap();
        let u = col.get(col.find_by_name("f").unwrap());
        assert!(matches!(&u.cpool[0], ConstEntry::Unsupported { tag } if tag == "regexp"));
        assert!(u.diagnostics.iter().any(|d| d.message.contains("unknown constant tag")));
        assert!(u.failed.is_none());
    }

    #[test]
    fn test_content_outside_record_is_an_error() {
        let err = parse_listing("garbage\n").unwrap_err();
        match err {
            UnbakeError::Listing { line, .. } => assert_eq!(line, 1),
            other => panic!("expected listing error, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert!(matches!(parse_listing("\n\n"), Err(UnbakeError::EmptyListing)));
    }

    #[test]
    fn test_missing_end_is_a_record_diagnostic() {
        let text = "function f\nparams 0\nregisters 0\ncode:\n  0 ReturnUndef\n";
        let col = parse_listing(text).unwrap();
        let u = col.get(col.find_by_name("f").unwrap());
        assert!(u.diagnostics.iter().any(|d| d.message.contains("not terminated")));
    }

    #[test]
    fn test_quoted_string_constant_unescapes() {
        let text = "function f\nparams 0\nregisters 0\ncode:\n  0 PushConst [0]\n  2 Return\nconstants:\n  0: string \"a\\\"b\\nc\"\nend\n";
        let col = parse_listing(text).unwrap();
        let u = col.get(col.find_by_name("f").unwrap());
        assert_eq!(u.cpool[0], ConstEntry::Str("a\"b\nc".to_string()));
    }
}
