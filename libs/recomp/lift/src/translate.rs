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

//! Whole-function translation: per-function decode, basic blocks, flag
//! dataflow, signature synthesis, label emission, and dead-goto repair.

use crate::blocks::build_basic_blocks;
use crate::lifter::{lift_block, Lifter};
use abi::{AbiDatabase, CallingConvention, ReturnHint};
use funcs::{Function, FunctionTable};
use i386::{Instr, Mnemonic, Operand, Reg};
use ident::Identification;
use labels::LabelTable;
use log::trace;
use std::collections::BTreeSet;
use xbe::Image;

pub struct FunctionTranslator<'a> {
    image: &'a Image,
    funcs: &'a FunctionTable,
    labels: &'a LabelTable,
    idents: &'a Identification,
    abi: &'a AbiDatabase,
    pub translation_gaps: u64,
}

const GPR_DECL_ORDER: [Reg; 8] = [
    Reg::EAX,
    Reg::EBX,
    Reg::ECX,
    Reg::EDX,
    Reg::ESI,
    Reg::EDI,
    Reg::EBP,
    Reg::ESP,
];

impl<'a> FunctionTranslator<'a> {
    pub fn new(
        image: &'a Image,
        funcs: &'a FunctionTable,
        labels: &'a LabelTable,
        idents: &'a Identification,
        abi: &'a AbiDatabase,
    ) -> Self {
        Self {
            image,
            funcs,
            labels,
            idents,
            abi,
            translation_gaps: 0,
        }
    }

    /// The C declaration for a function, from its ABI record.
    pub fn declaration(&self, addr: u32, name: &str) -> String {
        let (ret, params) = self.signature(addr);
        format!("{ret} {name}({params})")
    }

    fn signature(&self, addr: u32) -> (&'static str, String) {
        let record = self.abi.get(addr);
        let cc = record
            .map(|r| r.calling_convention)
            .unwrap_or(CallingConvention::Cdecl);
        let params = record.map(|r| r.estimated_params).unwrap_or(0);
        let hint = record.map(|r| r.return_hint).unwrap_or(ReturnHint::IntOrVoid);

        let ret = match hint {
            ReturnHint::Float | ReturnHint::FloatSse => "float",
            ReturnHint::IntZero => "int",
            ReturnHint::IntOrVoid | ReturnHint::Void | ReturnHint::Unknown if params == 0 => {
                "void"
            }
            _ => "uint32_t",
        };

        let mut list = Vec::new();
        if cc.has_this() {
            list.push("void *this_ptr".to_owned());
        }
        for i in 0..params {
            list.push(format!("uint32_t a{}", i + 1));
        }
        let params = if list.is_empty() {
            "void".to_owned()
        } else {
            list.join(", ")
        };
        (ret, params)
    }

    /// Translate one function to C. Returns None when nothing decodes —
    /// the caller emits a failure stub instead.
    pub fn translate_function(&mut self, f: &Function) -> Option<String> {
        let size = f.end.checked_sub(f.start)? as usize;
        if size == 0 {
            return None;
        }
        let bytes = self.image.read_bytes(f.start, size)?;

        // Fresh decode of just this function's bytes. A decode failure
        // ends the instruction list; whatever decoded still translates.
        let image_lo = self.image.base_address;
        let image_hi = image_lo.wrapping_add(self.image.image_size);
        let mut insns: Vec<Instr> = Vec::new();
        let mut ip = 0usize;
        while ip < bytes.len() {
            let off = ip;
            match Instr::decode_one(bytes, &mut ip, f.start + off as u32) {
                Ok(mut insn) => {
                    insn.resolve_targets(image_lo, image_hi);
                    insns.push(insn);
                }
                Err(_) => break,
            }
        }
        if insns.is_empty() {
            return None;
        }

        let blocks = build_basic_blocks(&insns, f.start, f.end);
        if blocks.is_empty() {
            return None;
        }

        let cls = self.idents.classifications.get(&f.start);
        let record = self.abi.get(f.start);
        let (ret_type, param_str) = self.signature(f.start);
        let cc = record
            .map(|r| r.calling_convention)
            .unwrap_or(CallingConvention::Cdecl);
        let num_params = record.map(|r| r.estimated_params).unwrap_or(0);

        let mut used_regs = self.find_used_registers(&insns, cc);
        let (mut xmm_regs, mmx_regs) = find_used_simd(&insns);
        let has_fpu = insns.iter().any(|i| i.mnemonic.is_x87());
        // jecxz and the loop family test ecx directly and never touch the
        // `_flags` fallback, so they do not force its declaration.
        let has_conditionals = insns.iter().any(|i| {
            matches!(
                i.mnemonic,
                Mnemonic::Jcc(_) | Mnemonic::Setcc(_) | Mnemonic::Cmovcc(_)
            )
        });
        let has_carry = insns.iter().any(|i| {
            matches!(
                i.mnemonic,
                Mnemonic::Adc | Mnemonic::Sbb | Mnemonic::Clc | Mnemonic::Stc
            )
        });
        let has_fpu_cmp = insns.iter().any(|i| i.mnemonic.is_fpu_compare());

        // The return statement has to agree with the synthesized return
        // type, and its value register must be declared.
        let hint = record.map(|r| r.return_hint).unwrap_or(ReturnHint::IntOrVoid);
        let ret_stmt = match ret_type {
            "void" => "return;".to_owned(),
            "float" if hint == ReturnHint::FloatSse => {
                if !xmm_regs.contains(&"xmm0") {
                    xmm_regs.insert(0, "xmm0");
                }
                "return xmm0;".to_owned()
            }
            "float" if has_fpu => "return (float)fp_top();".to_owned(),
            "float" => "return 0.0f;".to_owned(),
            _ => {
                used_regs.insert("eax");
                "return eax;".to_owned()
            }
        };

        let mut lines: Vec<String> = Vec::new();

        // Header comment.
        lines.push("/**".to_owned());
        lines.push(format!(" * {}", f.name));
        lines.push(format!(
            " * Original: 0x{:08X} - 0x{:08X} ({} bytes, {} insns)",
            f.start,
            f.end,
            size,
            insns.len()
        ));
        if let Some(cls) = cls {
            lines.push(format!(" * Category: {}", cls.category.key()));
            if let Some(src) = &cls.source_file {
                lines.push(format!(" * Source: {src}"));
            }
        }
        if let Some(r) = record {
            lines.push(format!(
                " * CC: {:?}, {} params, returns {:?}",
                r.calling_convention, r.estimated_params, r.return_hint
            ));
            lines.push(match r.frame_type {
                abi::FrameType::EbpFrame => {
                    format!(" * Frame: EBP-based ({} bytes locals)", r.stack_frame_size)
                }
                other => format!(" * Frame: {other:?}"),
            });
        }
        lines.push(" */".to_owned());

        lines.push(format!("{ret_type} {}({param_str})", f.name));
        lines.push("{".to_owned());

        let declared: Vec<&str> = GPR_DECL_ORDER
            .iter()
            .filter(|r| used_regs.contains(&r.name()))
            .map(|r| r.name())
            .collect();
        if !declared.is_empty() {
            lines.push(format!("    uint32_t {};", declared.join(", ")));
        }
        if has_conditionals {
            lines.push("    int _flags = 0; /* fallback when flag state is lost */".to_owned());
        }
        if has_carry {
            lines.push("    int _cf = 0; /* carry flag */".to_owned());
        }
        if has_fpu_cmp {
            lines.push("    int _fpu_cmp = 0; /* FPU compare result: -1/0/1 */".to_owned());
        }
        if !xmm_regs.is_empty() {
            lines.push(format!("    float {};", xmm_regs.join(", ")));
        }
        if !mmx_regs.is_empty() {
            lines.push(format!("    uint64_t {};", mmx_regs.join(", ")));
        }
        if has_fpu {
            lines.push("    double _fp_stack[8];".to_owned());
            lines.push("    int _fp_top = 0;".to_owned());
            lines.push("    #define fp_push(v) (_fp_stack[--_fp_top & 7] = (v))".to_owned());
            lines.push("    #define fp_pop() (_fp_top++)".to_owned());
            lines.push("    #define fp_top() _fp_stack[_fp_top & 7]".to_owned());
            lines.push("    #define fp_st(i) _fp_stack[(_fp_top + (i)) & 7]".to_owned());
            lines.push("    #define fp_st1() fp_st(1)".to_owned());
        }

        if cc.has_this() {
            lines.push("    ecx = (uint32_t)(uintptr_t)this_ptr;".to_owned());
        }
        if num_params > 0 {
            let names: Vec<String> = (1..=num_params).map(|i| format!("a{i}")).collect();
            lines.push(format!("    /* Parameters: {} */", names.join(", ")));
        }
        lines.push(String::new());

        // Addresses that need a label: targets of intra-function control
        // flow plus block successors.
        let mut label_addrs: BTreeSet<u32> = BTreeSet::new();
        for bb in &blocks {
            label_addrs.extend(bb.successors.iter().copied());
        }
        for insn in &insns {
            if let Some(t) = insn.jump_target {
                if t >= f.start && t < f.end {
                    label_addrs.insert(t);
                }
            }
        }

        let mut lifter = Lifter::new(self.funcs, self.labels, self.abi);
        lifter.func_start = f.start;
        lifter.func_end = f.end;
        lifter.ret_stmt = ret_stmt;

        let mut flag_state = None;
        for bb in &blocks {
            if label_addrs.contains(&bb.start) || bb.start == f.start {
                lines.push(format!("loc_{:08X}:", bb.start));
            }
            let (stmts, next_state) = lift_block(&mut lifter, bb, flag_state);
            for stmt in stmts {
                lines.push(format!("    {stmt}"));
            }
            flag_state = next_state;
            lines.push(String::new());
        }
        self.translation_gaps += lifter.translation_gaps;

        rewrite_dead_gotos(&mut lines);

        if has_fpu {
            lines.push("    #undef fp_push".to_owned());
            lines.push("    #undef fp_pop".to_owned());
            lines.push("    #undef fp_top".to_owned());
            lines.push("    #undef fp_st".to_owned());
            lines.push("    #undef fp_st1".to_owned());
        }

        lines.push("}".to_owned());
        lines.push(String::new());

        trace!("translated {} ({} lines)", f.name, lines.len());
        Some(lines.join("\n"))
    }

    fn find_used_registers(&self, insns: &[Instr], cc: CallingConvention) -> BTreeSet<&'static str> {
        let mut regs: BTreeSet<&'static str> = BTreeSet::new();
        fn note(regs: &mut BTreeSet<&'static str>, r: &Reg) {
            if let Some(parent) = r.parent32() {
                regs.insert(parent.name());
            }
        }
        for insn in insns {
            for op in &insn.operands {
                match op {
                    Operand::Register(r) => note(&mut regs, r),
                    Operand::Memory(mr) => {
                        if let Some(b) = &mr.base {
                            note(&mut regs, b);
                        }
                        if let Some(i) = &mr.index {
                            note(&mut regs, i);
                        }
                    }
                    _ => {}
                }
            }

            // Implicit register uses.
            match insn.mnemonic {
                Mnemonic::Cdq | Mnemonic::Mul | Mnemonic::Div | Mnemonic::IDiv => {
                    regs.insert("eax");
                    regs.insert("edx");
                }
                Mnemonic::Cwde | Mnemonic::Cbw | Mnemonic::Cmpxchg => {
                    regs.insert("eax");
                }
                Mnemonic::IMul if insn.operands.len() == 1 => {
                    regs.insert("eax");
                    regs.insert("edx");
                }
                Mnemonic::Leave => {
                    regs.insert("ebp");
                    regs.insert("esp");
                }
                Mnemonic::Jecxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
                    regs.insert("ecx");
                }
                Mnemonic::Movs(_) | Mnemonic::Cmps(_) => {
                    regs.insert("esi");
                    regs.insert("edi");
                    if insn.rep.is_some() {
                        regs.insert("ecx");
                    }
                }
                Mnemonic::Stos(_) | Mnemonic::Scas(_) => {
                    regs.insert("eax");
                    regs.insert("edi");
                    if insn.rep.is_some() {
                        regs.insert("ecx");
                    }
                }
                Mnemonic::Lods(_) => {
                    regs.insert("eax");
                    regs.insert("esi");
                }
                Mnemonic::PushAll | Mnemonic::PopAll => {
                    for r in GPR_DECL_ORDER {
                        regs.insert(r.name());
                    }
                }
                _ => {}
            }

            // Stack traffic needs the stack pointer.
            if matches!(
                insn.mnemonic,
                Mnemonic::Push
                    | Mnemonic::Pop
                    | Mnemonic::PushAll
                    | Mnemonic::PopAll
                    | Mnemonic::Pushfd
                    | Mnemonic::Popfd
                    | Mnemonic::Call
                    | Mnemonic::Leave
            ) {
                regs.insert("esp");
            }

            // Calling a thiscall callee loads ecx with the this pointer.
            if let Some(target) = insn.call_target.or(insn.jump_target) {
                if let Some(r) = self.abi.get(target) {
                    if r.calling_convention.has_this() {
                        regs.insert("ecx");
                    }
                }
            }
        }
        if cc.has_this() {
            regs.insert("ecx");
        }
        regs
    }
}

fn find_used_simd(insns: &[Instr]) -> (Vec<&'static str>, Vec<&'static str>) {
    let mut xmm: BTreeSet<&'static str> = BTreeSet::new();
    let mut mmx: BTreeSet<&'static str> = BTreeSet::new();
    for insn in insns {
        for op in &insn.operands {
            if let Operand::Register(r) = op {
                if r.is_xmm() {
                    xmm.insert(r.name());
                } else if r.is_mmx() {
                    mmx.insert(r.name());
                }
            }
        }
    }
    (xmm.into_iter().collect(), mmx.into_iter().collect())
}

/// Dead code after unconditional jumps can reference labels that were
/// never emitted; rewrite those gotos so the unit still compiles.
fn rewrite_dead_gotos(lines: &mut [String]) {
    let mut defined: BTreeSet<String> = BTreeSet::new();
    for line in lines.iter() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_suffix(':') {
            if rest.starts_with("loc_") && rest.len() == 12 {
                defined.insert(rest.to_owned());
            }
        }
    }

    for line in lines.iter_mut() {
        loop {
            let pos = match line.find("goto loc_") {
                Some(p) => p,
                None => break,
            };
            let label: String = line[pos + 5..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if defined.contains(&label) {
                break;
            }
            let needle = format!("goto {label};");
            let replacement = format!("(void)0; /* goto {label} - dead code */");
            if line.contains(&needle) {
                *line = line.replace(&needle, &replacement);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funcs::FunctionDetector;
    use i386::Engine;

    fn put_u32(data: &mut [u8], off: usize, v: u32) {
        data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn test_image(code: &[u8]) -> Image {
        let base = 0x0001_0000u32;
        let mut data = vec![0u8; 0x800];
        data[0..4].copy_from_slice(b"XBEH");
        put_u32(&mut data, 0x104, base);
        put_u32(&mut data, 0x10C, 0x3000);
        put_u32(&mut data, 0x11C, 1);
        put_u32(&mut data, 0x120, base + 0x200);
        put_u32(&mut data, 0x128, 0x0001_1000 ^ xbe::ENTRY_XOR_RETAIL);
        put_u32(&mut data, 0x158, 0x0001_2000 ^ xbe::THUNK_XOR_RETAIL);
        data[0x300..0x306].copy_from_slice(b".text\0");
        put_u32(&mut data, 0x200, 0x7);
        put_u32(&mut data, 0x204, 0x0001_1000);
        put_u32(&mut data, 0x208, 0x400);
        put_u32(&mut data, 0x20C, 0x400);
        put_u32(&mut data, 0x210, code.len() as u32);
        put_u32(&mut data, 0x214, base + 0x300);
        data[0x400..0x400 + code.len()].copy_from_slice(code);
        Image::from_bytes(data).unwrap()
    }

    fn translate(code: &[u8]) -> String {
        let image = test_image(code);
        let mut engine = Engine::new();
        let text = image.section(".text").unwrap().clone();
        engine.sweep_section(&image, &text, None);
        let mut label_table = LabelTable::new();
        let table = FunctionDetector::new(&engine, &image).detect_all(
            std::slice::from_ref(&text),
            &mut label_table,
        );
        let xref_index = xrefs::build_xrefs(&engine, &image);
        let strings = Vec::new();
        let idents = ident::identify(&image, &table, &strings, &xref_index);
        let abi_db = abi::analyze_all(&image, &table, &idents, &abi::AbiOptions::default());

        let f = table.get(0x0001_1000).expect("function at 0x11000").clone();
        let mut translator =
            FunctionTranslator::new(&image, &table, &label_table, &idents, &abi_db);
        translator.translate_function(&f).expect("translation")
    }

    #[test]
    fn it_translates_the_minimal_prologue_function() {
        let code = translate(&[0x55, 0x8B, 0xEC, 0xC3]);
        assert!(code.contains("uint32_t "), "register decls: {code}");
        assert!(code.contains("ebp"));
        assert!(code.contains("esp"));
        assert!(code.contains("PUSH32(esp, ebp);"));
        assert!(code.contains("ebp = esp;"));
        assert!(code.contains("return;"));
    }

    #[test]
    fn it_emits_cmp_je_and_labels() {
        // cmp eax, 0x10; je 0x11006; ret; CC; 0x11006: ret
        let code = translate(&[0x83, 0xF8, 0x10, 0x74, 0x01, 0xC3, 0xC3]);
        assert!(
            code.contains("if (CMP_EQ(eax, 0x10)) goto loc_00011006;"),
            "fused branch: {code}"
        );
        assert!(code.contains("loc_00011006:"));
    }

    #[test]
    fn it_declares_fpu_state_only_when_used() {
        let plain = translate(&[0x55, 0x8B, 0xEC, 0xC3]);
        assert!(!plain.contains("_fp_stack"));

        // fld dword [0x11000]; fstp dword [0x11000]; ret
        let fpu = translate(&[
            0xD9, 0x05, 0x00, 0x10, 0x01, 0x00, //
            0xD9, 0x1D, 0x00, 0x10, 0x01, 0x00, //
            0xC3,
        ]);
        assert!(fpu.contains("double _fp_stack[8];"));
        assert!(fpu.contains("#undef fp_push"));
        assert!(fpu.contains("fp_push(MEMF(0x11000)); /* fld float */"));
    }

    #[test]
    fn it_rewrites_gotos_to_missing_labels() {
        let mut lines = vec![
            "loc_00011000:".to_owned(),
            "    goto loc_00011020; /* target outside */".to_owned(),
        ];
        rewrite_dead_gotos(&mut lines);
        assert!(lines[1].contains("(void)0; /* goto loc_00011020 - dead code */"));
    }
}
