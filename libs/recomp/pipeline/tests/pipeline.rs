// This file is part of OpenXBE.
//
// OpenXBE is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenXBE is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenXBE.  If not, see <http://www.gnu.org/licenses/>.

//! End-to-end pipeline tests over synthetic XBE images.

use pipeline::{analyze, translate, AnalyzeOptions, TranslateOptions};
use std::fs;
use std::path::PathBuf;

const BASE: u32 = 0x0001_0000;
const TEXT_VA: u32 = 0x0001_1000;
const RDATA_VA: u32 = 0x0001_8000;
const DATA_VA: u32 = 0x0002_0000;

const TEXT_RAW: usize = 0x400;
const RDATA_RAW: usize = 0x1400;
const DATA_RAW: usize = 0x2400;

fn put_u32(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Assemble a three-section retail image: .text (executable), .rdata
/// (read-only, leading with a one-entry kernel thunk table), .data
/// (writable). The entry point is a VA inside .text.
fn build_image(text: &[u8], rdata: &[u8], data_sec: &[u8], entry: u32) -> Vec<u8> {
    assert!(text.len() <= 0x1000 && rdata.len() <= 0x1000 && data_sec.len() <= 0x400);
    let mut data = vec![0u8; 0x2800];
    data[0..4].copy_from_slice(b"XBEH");
    put_u32(&mut data, 0x104, BASE);
    put_u32(&mut data, 0x10C, 0x2_0000);
    put_u32(&mut data, 0x11C, 3);
    put_u32(&mut data, 0x120, BASE + 0x200);
    put_u32(&mut data, 0x128, entry ^ xbe::ENTRY_XOR_RETAIL);
    put_u32(&mut data, 0x158, RDATA_VA ^ xbe::THUNK_XOR_RETAIL);

    data[0x300..0x306].copy_from_slice(b".text\0");
    data[0x310..0x317].copy_from_slice(b".rdata\0");
    data[0x320..0x326].copy_from_slice(b".data\0");

    // .text
    let s = 0x200;
    put_u32(&mut data, s, 0x6); // preload | executable
    put_u32(&mut data, s + 4, TEXT_VA);
    put_u32(&mut data, s + 8, text.len().max(1) as u32);
    put_u32(&mut data, s + 12, TEXT_RAW as u32);
    put_u32(&mut data, s + 16, text.len() as u32);
    put_u32(&mut data, s + 20, BASE + 0x300);

    // .rdata
    let s = 0x200 + 56;
    put_u32(&mut data, s, 0x2); // preload
    put_u32(&mut data, s + 4, RDATA_VA);
    put_u32(&mut data, s + 8, 0x1000);
    put_u32(&mut data, s + 12, RDATA_RAW as u32);
    put_u32(&mut data, s + 16, rdata.len() as u32);
    put_u32(&mut data, s + 20, BASE + 0x310);

    // .data (virtual size larger than raw: zero-fill tail)
    let s = 0x200 + 112;
    put_u32(&mut data, s, 0x1); // writable
    put_u32(&mut data, s + 4, DATA_VA);
    put_u32(&mut data, s + 8, 0x800);
    put_u32(&mut data, s + 12, DATA_RAW as u32);
    put_u32(&mut data, s + 16, data_sec.len() as u32);
    put_u32(&mut data, s + 20, BASE + 0x320);

    data[TEXT_RAW..TEXT_RAW + text.len()].copy_from_slice(text);
    data[RDATA_RAW..RDATA_RAW + rdata.len()].copy_from_slice(rdata);
    data[DATA_RAW..DATA_RAW + data_sec.len()].copy_from_slice(data_sec);
    data
}

/// A one-entry kernel thunk table resolving to RtlZeroMemory.
fn rdata_with_thunks() -> Vec<u8> {
    let mut rdata = vec![0u8; 0x10];
    put_u32(&mut rdata, 0, 314 | 0x8000_0000);
    put_u32(&mut rdata, 4, 0);
    rdata
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("openxbe-{}-{tag}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn analyze_bytes(bytes: Vec<u8>, tag: &str) -> pipeline::Databases {
    let dir = scratch_dir(tag);
    let path = dir.join("game.xbe");
    fs::write(&path, bytes).unwrap();
    analyze(&path, &AnalyzeOptions::default()).unwrap()
}

#[test]
fn it_analyzes_a_minimal_prologue_function() {
    // Entry at 0x11010 so the 0x11000 function is found by its prologue.
    let mut text = vec![0u8; 0x14];
    text[0x00..0x04].copy_from_slice(&[0x55, 0x8B, 0xEC, 0xC3]);
    for b in &mut text[0x04..0x10] {
        *b = 0xCC;
    }
    text[0x10] = 0xC3; // entry: ret
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA + 0x10),
        "minimal",
    );

    let f = db.functions.get(TEXT_VA).expect("prologue function");
    assert_eq!(f.start, 0x0001_1000);
    assert_eq!(f.end, 0x0001_1004);
    assert_eq!(f.num_instructions, 3);
    assert!(f.has_prologue);
    assert_eq!(f.confidence, 0.95);
    assert_eq!(format!("{:?}", f.detection_method), "Prologue");

    // Its translation declares ebp/esp and models the frame setup.
    let out = scratch_dir("minimal-out");
    let stats = translate(&db, &out, &TranslateOptions::default()).unwrap();
    assert_eq!(stats.failed, 0);
    let chunk = fs::read_to_string(out.join("recomp_0000.c")).unwrap();
    assert!(chunk.contains("PUSH32(esp, ebp);"));
    assert!(chunk.contains("ebp = esp;"));
    assert!(chunk.contains("return;"));
    assert!(chunk.contains("uint32_t ebp, esp;"), "decls in: {chunk}");
}

#[test]
fn it_fuses_cmp_je_and_records_the_jump_xref() {
    // 0x11000: cmp eax, 0x10; je 0x11008; ret; CC*2; 0x11008: ret
    let text = [
        0x83, 0xF8, 0x10, // cmp eax, 0x10
        0x74, 0x03, // je 0x11008
        0xC3, // ret
        0xCC, 0xCC, // padding
        0xC3, // 0x11008: ret (same function: jump target)
    ];
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA),
        "cmpje",
    );

    // The conditional edge is recorded.
    assert!(db
        .xrefs
        .refs_from(0x0001_1003)
        .iter()
        .any(|x| x.to_addr == 0x0001_1008 && x.kind == xrefs::XrefKind::CondJump));

    let out = scratch_dir("cmpje-out");
    translate(&db, &out, &TranslateOptions::default()).unwrap();
    let chunk = fs::read_to_string(out.join("recomp_0000.c")).unwrap();
    assert!(
        chunk.contains("if (CMP_EQ(eax, 0x10)) goto loc_00011008;"),
        "fused pair in: {chunk}"
    );
    // Exactly one if for the pair, no standalone comparison statement.
    assert_eq!(chunk.matches("CMP_EQ(eax, 0x10)").count(), 1);
}

#[test]
fn it_resolves_kernel_thunk_calls() {
    // call [0x00018000]; ret
    let text = [0xFF, 0x15, 0x00, 0x80, 0x01, 0x00, 0xC3];
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA),
        "kthunk",
    );

    let refs = db.xrefs.refs_from(TEXT_VA);
    let kcall = refs
        .iter()
        .find(|x| x.kind == xrefs::XrefKind::KernelCall)
        .expect("kernel call edge");
    assert_eq!(kcall.to_addr, RDATA_VA);
    assert_eq!(kcall.kernel_name.as_deref(), Some("RtlZeroMemory"));
    assert_eq!(db.xrefs.kernel_callers_of(RDATA_VA), &[TEXT_VA]);

    let out = scratch_dir("kthunk-out");
    translate(&db, &out, &TranslateOptions::default()).unwrap();
    let chunk = fs::read_to_string(out.join("recomp_0000.c")).unwrap();
    assert!(
        chunk.contains("xbox_RtlZeroMemory(); /* call 0x00018000 */"),
        "kernel call in: {chunk}"
    );
}

#[test]
fn it_classifies_float_copy_stubs() {
    // entry: ret; CC; then the 17-byte movss copy stub.
    let mut text = vec![0xC3, 0xCC];
    text.extend_from_slice(&[0xF3, 0x0F, 0x10, 0x05]);
    text.extend_from_slice(&(RDATA_VA + 0x100).to_le_bytes());
    text.extend_from_slice(&[0xF3, 0x0F, 0x11, 0x05]);
    text.extend_from_slice(&DATA_VA.to_le_bytes());
    text.push(0xC3);
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[0u8; 0x10], TEXT_VA),
        "stub",
    );

    let stub_addr = TEXT_VA + 2;
    let f = db.functions.get(stub_addr).expect("stub function");
    assert_eq!(f.size, 17);
    let cls = db
        .identification
        .classifications
        .get(&stub_addr)
        .expect("stub classification");
    assert_eq!(cls.category.key(), "data_init");
    assert_eq!(cls.stub_type.as_deref(), Some("float_copy"));
    assert_eq!(cls.confidence, 0.99);
    assert_eq!(cls.method, "stub_pattern");

    // Stubs carry no ABI record.
    assert!(db.abi.get(stub_addr).is_none());
}

#[test]
fn it_discovers_vtables_and_constructors() {
    // Three prologue functions at 0x11000/0x11010/0x11020, a constructor
    // at 0x11030 writing the vtable address into [ecx], entry at 0x11040.
    let mut text = vec![0u8; 0x44];
    for base in [0x00usize, 0x10, 0x20] {
        text[base..base + 4].copy_from_slice(&[0x55, 0x8B, 0xEC, 0xC3]);
        for b in &mut text[base + 4..base + 0x10] {
            *b = 0xCC;
        }
    }
    // ctor: push ebp; mov ebp, esp; mov [ecx], imm32; ret
    let vtable_va = RDATA_VA + 0x20;
    text[0x30..0x33].copy_from_slice(&[0x55, 0x8B, 0xEC]);
    text[0x33..0x35].copy_from_slice(&[0xC7, 0x01]);
    text[0x35..0x39].copy_from_slice(&vtable_va.to_le_bytes());
    text[0x39] = 0xC3;
    for b in &mut text[0x3A..0x40] {
        *b = 0xCC;
    }
    text[0x40] = 0xC3; // entry

    let mut rdata = rdata_with_thunks();
    rdata.resize(0x30, 0);
    put_u32(&mut rdata, 0x20, TEXT_VA);
    put_u32(&mut rdata, 0x24, TEXT_VA + 0x10);
    put_u32(&mut rdata, 0x28, TEXT_VA + 0x20);

    let db = analyze_bytes(build_image(&text, &rdata, &[], TEXT_VA + 0x40), "vtable");

    assert_eq!(db.identification.vtables.len(), 1);
    let vt = &db.identification.vtables[0];
    assert_eq!(vt.address, vtable_va);
    assert_eq!(vt.entries, vec![TEXT_VA, TEXT_VA + 0x10, TEXT_VA + 0x20]);

    // Every entry is a known function start and classified as a method.
    for (idx, entry) in vt.entries.iter().enumerate() {
        assert!(db.functions.get(*entry).is_some());
        let cls = &db.identification.classifications[entry];
        assert_eq!(cls.category.key(), "game_vtable");
        assert_eq!(cls.method, "vtable_scan");
        assert_eq!(cls.vtable_index, Some(idx as i32));
        assert_eq!(cls.subcategory.as_deref(), Some(vt.class_id.as_str()));
    }

    let ctor = &db.identification.classifications[&(TEXT_VA + 0x30)];
    assert_eq!(ctor.method, "vtable_ctor");
    assert_eq!(ctor.vtable_index, Some(-1));
    assert_eq!(ctor.vtable_addr, Some(vtable_va));
}

#[test]
fn it_classifies_library_functions_by_id_string() {
    let id_string = b"@@(#)$Id: //RenderWare/RW36Active/rwsdk/src/plcore/foo.c#1 $\0";
    let mut rdata = rdata_with_thunks();
    rdata.resize(0x40, 0);
    rdata.extend_from_slice(id_string);

    let string_va = RDATA_VA + 0x40;
    // push offset id_string inside a prologue function; entry elsewhere.
    let mut text = vec![0x55, 0x8B, 0xEC, 0x68];
    text.extend_from_slice(&string_va.to_le_bytes());
    text.push(0xC3);
    text.extend_from_slice(&[0xCC, 0xCC, 0xCC]);
    text.push(0xC3); // entry at +0x0C

    let db = analyze_bytes(build_image(&text, &rdata, &[], TEXT_VA + 0x0C), "rwid");

    let cls = db
        .identification
        .classifications
        .get(&TEXT_VA)
        .expect("library classification");
    assert_eq!(cls.category.key(), "rw_plcore");
    assert_eq!(cls.confidence, 0.95);
    assert_eq!(cls.method, "rw_string_ref");
    assert_eq!(cls.source_file.as_deref(), Some("src/plcore/foo.c"));
    assert_eq!(cls.module.as_deref(), Some("foo.c"));
}

#[test]
fn it_maps_globals_with_sizes_and_alignment() {
    // Two reads of a .data dword and one of a byte at +4.
    let d = DATA_VA;
    let mut text = Vec::new();
    text.extend_from_slice(&[0xA1]); // mov eax, [d]
    text.extend_from_slice(&d.to_le_bytes());
    text.extend_from_slice(&[0xA1]);
    text.extend_from_slice(&d.to_le_bytes());
    text.extend_from_slice(&[0x8A, 0x0D]); // mov cl, [d+4]
    text.extend_from_slice(&(d + 4).to_le_bytes());
    text.push(0xC3);
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[7, 0, 0, 0, 9, 0, 0, 0], TEXT_VA),
        "globals",
    );

    let g0 = db.globals.globals.get(&d).expect("dword global");
    assert_eq!(g0.read_count, 2);
    assert_eq!(g0.inferred_size, 4);
    assert_eq!(g0.initial_value, Some(7));
    let g1 = db.globals.globals.get(&(d + 4)).expect("byte global");
    assert_eq!(g1.initial_value.map(|v| v & 0xFF), Some(9));

    for g in db.globals.globals.values() {
        assert!(matches!(g.inferred_size, 1 | 2 | 4 | 8));
        assert_eq!(u64::from(g.address) % u64::from(g.inferred_size), 0);
    }
}

#[test]
fn it_holds_the_structural_invariants() {
    // Reuse the vtable scenario, which exercises most stages at once.
    let mut text = vec![0u8; 0x44];
    for base in [0x00usize, 0x10, 0x20] {
        text[base..base + 4].copy_from_slice(&[0x55, 0x8B, 0xEC, 0xC3]);
        for b in &mut text[base + 4..base + 0x10] {
            *b = 0xCC;
        }
    }
    let vtable_va = RDATA_VA + 0x20;
    text[0x30..0x33].copy_from_slice(&[0x55, 0x8B, 0xEC]);
    text[0x33..0x35].copy_from_slice(&[0xC7, 0x01]);
    text[0x35..0x39].copy_from_slice(&vtable_va.to_le_bytes());
    text[0x39] = 0xC3;
    for b in &mut text[0x3A..0x40] {
        *b = 0xCC;
    }
    text[0x40] = 0xC3;
    let mut rdata = rdata_with_thunks();
    rdata.resize(0x30, 0);
    put_u32(&mut rdata, 0x20, TEXT_VA);
    put_u32(&mut rdata, 0x24, TEXT_VA + 0x10);
    put_u32(&mut rdata, 0x28, TEXT_VA + 0x20);
    let db = analyze_bytes(build_image(&text, &rdata, &[], TEXT_VA + 0x40), "invariants");

    // Functions: ordered, non-overlapping, inside their section.
    let funcs: Vec<_> = db.functions.all().collect();
    for f in &funcs {
        assert!(f.start < f.end);
        let sec = db.image.section(&f.section).unwrap();
        assert!(f.end <= sec.end());
        assert!((0.0..=1.0).contains(&f.confidence));
    }
    for pair in funcs.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }

    // Xrefs: sources decode, targets land in a section.
    for x in db.xrefs.all() {
        assert!(db.engine.has_instruction(x.from_addr), "0x{:08X}", x.from_addr);
        assert!(db.image.section_at(x.to_addr).is_some(), "0x{:08X}", x.to_addr);
    }

    // Labels: unique addresses, reverse lookup is the identity.
    for label in db.labels.all() {
        let by_name = db.labels.get_by_name(&label.name).expect(&label.name);
        assert_eq!(by_name.address, label.address);
    }

    // Classifications: confidence in range.
    for cls in db.identification.classifications.values() {
        assert!((0.0..=1.0).contains(&cls.confidence));
        assert!(!cls.category.key().is_empty());
    }

    // Vtable entries are function starts.
    for vt in &db.identification.vtables {
        for e in &vt.entries {
            assert!(db.functions.get(*e).is_some());
        }
    }
}

#[test]
fn it_handles_section_boundary_candidates() {
    // A call targets the section's last byte (a lone ret): the callee's
    // end is exactly the section end.
    let text = [
        0xE8, 0x01, 0x00, 0x00, 0x00, // call 0x11006
        0xC3, // ret
        0xC3, // 0x11006: ret (last byte of .text)
    ];
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA),
        "lastbyte",
    );
    let f = db.functions.get(0x0001_1006).expect("tail function");
    let sec = db.image.section(".text").unwrap();
    assert_eq!(f.end, sec.end());
}

#[test]
fn it_ignores_padding_with_no_successor() {
    // ret followed by padding to the very end of the section: no
    // spurious function start inside or after the run.
    let text = [0xC3, 0xCC, 0xCC, 0xCC];
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA),
        "padding",
    );
    assert_eq!(db.functions.len(), 1);
    assert!(db.functions.get(TEXT_VA).is_some());
}

#[test]
fn it_produces_byte_identical_outputs_across_runs() {
    let text = [
        0x55, 0x8B, 0xEC, // prologue
        0x83, 0xF8, 0x10, // cmp eax, 0x10
        0x74, 0x01, // je +1
        0x40, // inc eax
        0x5D, // pop ebp
        0xC3, // ret
    ];
    let bytes = build_image(&text, &rdata_with_thunks(), &[1, 0, 0, 0], TEXT_VA);

    let mut dirs = Vec::new();
    for run in 0..2 {
        let dir = scratch_dir(&format!("determinism-{run}"));
        let path = dir.join("game.xbe");
        fs::write(&path, bytes.clone()).unwrap();
        let db = analyze(&path, &AnalyzeOptions::default()).unwrap();
        pipeline::write_databases(&db, &dir).unwrap();
        translate(&db, &dir.join("c"), &TranslateOptions::default()).unwrap();
        dirs.push(dir);
    }

    for name in [
        "functions.json",
        "labels.json",
        "xrefs.json",
        "strings.json",
        "identified_functions.json",
        "abi_functions.json",
        "globals.json",
        "structures.json",
        "summary.json",
    ] {
        let a = fs::read(dirs[0].join(name)).unwrap();
        let b = fs::read(dirs[1].join(name)).unwrap();
        assert_eq!(a, b, "{name} differs between runs");
    }
    for name in ["c/recomp_funcs.h", "c/recomp_0000.c", "c/recomp_dispatch.c"] {
        let a = fs::read(dirs[0].join(name)).unwrap();
        let b = fs::read(dirs[1].join(name)).unwrap();
        assert_eq!(a, b, "{name} differs between runs");
    }
}

#[test]
fn it_reparses_its_own_function_records() {
    let text = [0x55, 0x8B, 0xEC, 0xC3];
    let bytes = build_image(&text, &rdata_with_thunks(), &[], TEXT_VA);
    let dir = scratch_dir("reparse");
    let path = dir.join("game.xbe");
    fs::write(&path, bytes).unwrap();
    let db = analyze(&path, &AnalyzeOptions::default()).unwrap();
    pipeline::write_databases(&db, &dir).unwrap();

    let parsed: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("functions.json")).unwrap()).unwrap();
    let records = parsed.as_array().unwrap();
    assert_eq!(records.len(), db.functions.len());
    for rec in records {
        let start = u32::from_str_radix(
            rec["start"].as_str().unwrap().trim_start_matches("0x"),
            16,
        )
        .unwrap();
        let f = db.functions.get(start).expect("round-trip start");
        assert_eq!(rec["name"].as_str().unwrap(), f.name);
        assert_eq!(rec["size"].as_u64().unwrap() as u32, f.size);
    }
}

#[test]
fn it_emits_a_sorted_dispatch_table() {
    let text = [
        0x55, 0x8B, 0xEC, 0xC3, // f0
        0xCC, 0xCC, 0xCC, 0xCC, // padding
        0x55, 0x8B, 0xEC, 0xC3, // f1
    ];
    let db = analyze_bytes(
        build_image(&text, &rdata_with_thunks(), &[], TEXT_VA),
        "dispatch",
    );
    let out = scratch_dir("dispatch-out");
    let stats = translate(&db, &out, &TranslateOptions::default()).unwrap();
    assert!(stats.translated >= 2);

    let dispatch = fs::read_to_string(out.join("recomp_dispatch.c")).unwrap();
    let f0 = dispatch.find("0x00011000u").expect("entry for f0");
    let f1 = dispatch.find("0x00011008u").expect("entry for f1");
    assert!(f0 < f1, "table sorted by VA");
    assert!(dispatch.contains("recomp_lookup"));
    assert!(dispatch.contains("recomp_get_count"));

    let header = fs::read_to_string(out.join("recomp_funcs.h")).unwrap();
    assert!(header.contains("#include \"recomp_types.h\""));
    assert!(header.contains("xbe_entry_point")); // entry function keeps its label
    assert!(header.contains("sub_00011008"));
}

#[test]
fn it_skips_reanalysis_on_cache_hit() {
    let text = [0x55, 0x8B, 0xEC, 0xC3];
    let bytes = build_image(&text, &rdata_with_thunks(), &[], TEXT_VA);
    let dir = scratch_dir("cache");
    let path = dir.join("game.xbe");
    fs::write(&path, bytes).unwrap();

    let opts = AnalyzeOptions::default();
    let first = pipeline::run_analysis(&path, &dir, &opts).unwrap();
    assert!(matches!(first, pipeline::AnalysisOutcome::Analyzed(_)));
    let second = pipeline::run_analysis(&path, &dir, &opts).unwrap();
    assert!(matches!(second, pipeline::AnalysisOutcome::CacheHit));

    // Different flags miss the cache.
    let mut other = AnalyzeOptions::default();
    other.text_only = true;
    let third = pipeline::run_analysis(&path, &dir, &other).unwrap();
    assert!(matches!(third, pipeline::AnalysisOutcome::Analyzed(_)));

    // A forced run re-analyzes.
    let mut forced = AnalyzeOptions::default();
    forced.force = true;
    let fourth = pipeline::run_analysis(&path, &dir, &forced).unwrap();
    assert!(matches!(fourth, pipeline::AnalysisOutcome::Analyzed(_)));
}

#[test]
fn it_labels_jump_only_thunks() {
    // entry calls 0x11008; the thunk there jumps straight back to entry.
    let mut text = Vec::new();
    text.extend_from_slice(&[0xE8, 0x03, 0x00, 0x00, 0x00]); // call 0x11008
    text.push(0xC3); // ret
    text.extend_from_slice(&[0xCC, 0xCC]); // padding
    text.extend_from_slice(&[0xE9, 0xF3, 0xFF, 0xFF, 0xFF]); // 0x11008: jmp 0x11000
    let bytes = build_image(&text, &rdata_with_thunks(), &[], TEXT_VA);
    let dir = scratch_dir("thunks");
    let path = dir.join("game.xbe");
    fs::write(&path, bytes.clone()).unwrap();

    let db = analyze(&path, &AnalyzeOptions::default()).unwrap();
    let label = db.labels.get(0x0001_1008).expect("thunk label");
    assert_eq!(label.kind, labels::LabelKind::Thunk);
    assert!(db.functions.get(0x0001_1008).is_some());

    // Folding drops the function entirely.
    let mut fold = AnalyzeOptions::default();
    fold.fold_jump_only_thunks = true;
    let db = analyze(&path, &fold).unwrap();
    assert!(db.functions.get(0x0001_1008).is_none());
}
