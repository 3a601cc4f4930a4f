use unbake_lib::{
    DecompileOptions, ExportKind, decompile_listing, decompile_listing_to_text,
    export_collection, load_snapshot, resolve, save_snapshot,
};

const NESTED: &str = r#"
function module @ 0..120
params 0
registers 2
locals counter, step
code:
  0 PushInt 0
  2 SetLocal r0
  4 Closure [1]
  6 SetLocal r1
  8 GetLocal r1
 10 Call 0
 12 Return
constants:
  0: string "unused"
  1: function bump
end

function bump @ 20..90
params 0
registers 0
code:
  0 GetOuter o0
  2 PushInt 1
  4 Add
  5 Return
constants:
end
"#;

const ALL_KINDS: [ExportKind; 3] =
    [ExportKind::Raw, ExportKind::Translated, ExportKind::Decompiled];

#[test]
fn end_to_end_decompiles_nested_function() {
    let text =
        decompile_listing_to_text(NESTED, DecompileOptions::default(), &[ExportKind::Decompiled])
            .unwrap();
    // the child is spliced into the parent, so only the parent is emitted
    assert_eq!(text.matches("// ==== function").count(), 1);
    assert!(text.contains("function module()"));
    // the nested body landed at its declaration site with the outer
    // reference rewritten to the parent's local name
    assert!(text.contains("function bump()"), "got:\n{text}");
    assert!(text.contains("return (counter + 1);"), "got:\n{text}");
    assert!(!text.contains("<outer:"));
}

#[test]
fn unresolved_scopes_stay_as_slots_when_opted_out() {
    let text = decompile_listing_to_text(
        NESTED,
        DecompileOptions { resolve_scopes: false },
        &[ExportKind::Decompiled],
    )
    .unwrap();
    // no splicing without the scope pass: both functions are top level
    assert_eq!(text.matches("// ==== function").count(), 2);
    assert!(text.contains("<outer:o0>"));
}

#[test]
fn scope_pass_is_idempotent_on_exported_text() {
    let mut col = decompile_listing(NESTED, DecompileOptions::default()).unwrap();
    let first = export_collection(&col, &ALL_KINDS);
    resolve::resolve_collection(&mut col);
    let second = export_collection(&col, &ALL_KINDS);
    assert_eq!(first, second);
}

#[test]
fn snapshot_round_trip_preserves_export_output() {
    let col = decompile_listing(NESTED, DecompileOptions::default()).unwrap();
    let direct = export_collection(&col, &ALL_KINDS);
    let restored = load_snapshot(&save_snapshot(&col).unwrap()).unwrap();
    assert_eq!(export_collection(&restored, &ALL_KINDS), direct);
}

#[test]
fn unknown_opcode_degrades_one_instruction_only() {
    let listing = "function f @ 0..9\nparams 0\nregisters 0\ncode:\n  0 PushInt 4\n  2 Frobnicate\n  3 PushInt 5\n  5 Add\n  6 Return\nconstants:\nend\n";
    let col = decompile_listing(listing, DecompileOptions::default()).unwrap();
    let raw = export_collection(&col, &[ExportKind::Raw]);
    for sym in ["PushInt", "Frobnicate", "Add", "Return"] {
        assert!(raw.contains(sym), "raw listing missing {sym}:\n{raw}");
    }
    let translated = export_collection(&col, &[ExportKind::Translated]);
    assert_eq!(translated.matches("<Frobnicate>").count(), 1);
    assert!(translated.contains("return (4 + 5);"), "got:\n{translated}");
}

#[test]
fn malformed_record_does_not_stop_siblings() {
    let listing = "function broken @ 0..5\nparams 0\nregisters 0\ncode:\n  0 Jump @99\nconstants:\nend\n\nfunction fine @ 6..9\nparams 0\nregisters 0\ncode:\n  0 PushInt 7\n  2 Return\nconstants:\nend\n";
    let col = decompile_listing(listing, DecompileOptions::default()).unwrap();
    let text = export_collection(&col, &ALL_KINDS);
    assert!(text.contains("// error:"));
    assert!(text.contains("return 7;"), "got:\n{text}");
}

#[test]
fn multiple_kinds_concatenate_per_function() {
    let text = decompile_listing_to_text(NESTED, DecompileOptions::default(), &ALL_KINDS).unwrap();
    let raw = text.find("// ---- raw ----").unwrap();
    let translated = text.find("// ---- translated ----").unwrap();
    let decompiled = text.find("// ---- decompiled ----").unwrap();
    assert!(raw < translated && translated < decompiled);
}
