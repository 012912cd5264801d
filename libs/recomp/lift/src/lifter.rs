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

//! Per-instruction x86 → C translation.

use crate::blocks::BasicBlock;
use crate::cond::{advance, condition, FlagState};
use crate::operand::{
    imm, mem_addr, mem_read, op_read, op_write, smem_accessor, sse_read, sse_write,
};
use abi::AbiDatabase;
use funcs::FunctionTable;
use i386::{Cc, Instr, Mnemonic, Operand, Reg, Width};
use labels::LabelTable;

fn cc_desc(cc: Cc) -> &'static str {
    match cc {
        Cc::O => "overflow",
        Cc::No => "not overflow",
        Cc::B => "below (unsigned <)",
        Cc::Ae => "above or equal (unsigned >=)",
        Cc::Z => "equal / zero",
        Cc::Nz => "not equal / not zero",
        Cc::Be => "below or equal (unsigned <=)",
        Cc::A => "above (unsigned >)",
        Cc::S => "sign (negative)",
        Cc::Ns => "not sign (positive)",
        Cc::P => "parity",
        Cc::Np => "not parity",
        Cc::L => "less (signed <)",
        Cc::Ge => "greater or equal (signed >=)",
        Cc::Le => "less or equal (signed <=)",
        Cc::G => "greater (signed >)",
    }
}

pub struct Lifter<'a> {
    pub funcs: &'a FunctionTable,
    pub labels: &'a LabelTable,
    pub abi: &'a AbiDatabase,
    pub func_start: u32,
    pub func_end: u32,
    /// The return statement matching the synthesized signature.
    pub ret_stmt: String,
    /// Instructions lifted to commented placeholders.
    pub translation_gaps: u64,
}

impl<'a> Lifter<'a> {
    pub fn new(funcs: &'a FunctionTable, labels: &'a LabelTable, abi: &'a AbiDatabase) -> Self {
        Self {
            funcs,
            labels,
            abi,
            func_start: 0,
            func_end: 0,
            ret_stmt: "return;".to_owned(),
            translation_gaps: 0,
        }
    }

    fn target_name(&self, addr: u32) -> String {
        if let Some(name) = self.labels.name_of(addr) {
            return name.to_owned();
        }
        if let Some(f) = self.funcs.get(addr) {
            return f.name.clone();
        }
        format!("sub_{addr:08X}")
    }

    /// Argument list for a direct call, from the callee's ABI record: the
    /// `this` pointer for thiscall conventions, then one placeholder per
    /// estimated parameter.
    fn call_args(&self, target: u32) -> String {
        let record = match self.abi.get(target) {
            Some(r) => r,
            None => return String::new(),
        };
        let mut args = Vec::new();
        if record.calling_convention.has_this() {
            args.push("(void*)(uintptr_t)ecx".to_owned());
        }
        for i in 0..record.estimated_params {
            args.push(format!("0 /* a{} */", i + 1));
        }
        args.join(", ")
    }

    #[inline]
    fn is_external(&self, addr: u32) -> bool {
        addr < self.func_start || addr >= self.func_end
    }

    /// One `if (cond) ...` for a conditional branch: goto for an internal
    /// target, tail call for an external one.
    pub fn cond_goto(&self, cond: &str, cc: Cc, target: Option<u32>) -> String {
        let jcc = format!("j{}", cc.suffix());
        let desc = cc_desc(cc);
        match target {
            None => format!("if ({cond}) {{ /* {jcc}: {desc} - indirect */ }}"),
            Some(t) if self.is_external(t) => {
                let name = self.target_name(t);
                let args = self.call_args(t);
                format!(
                    "if ({cond}) {{ {name}({args}); {} }} /* {jcc}: {desc} */",
                    self.ret_stmt
                )
            }
            Some(t) => format!("if ({cond}) goto loc_{t:08X}; /* {jcc}: {desc} */"),
        }
    }

    fn todo(&mut self, insn: &Instr) -> Vec<String> {
        self.translation_gaps += 1;
        vec![format!("/* TODO: {insn} */")]
    }

    /// Translate one instruction to C statements. Conditionals that need
    /// flag state are handled by `lift_block`; reaching them here emits
    /// the `_flags` fallback.
    pub fn lift_instruction(&mut self, insn: &Instr) -> Vec<String> {
        use Mnemonic::*;
        let ops = &insn.operands;

        match insn.mnemonic {
            Nop => vec!["/* nop */".to_owned()],
            Lea if is_lea_nop(insn) => vec!["/* nop (lea r, [r]) */".to_owned()],

            // ── Data movement ──
            Mov => {
                let src = op_read(&ops[1]);
                vec![op_write(&ops[0], &src)]
            }
            MovZx => {
                let src = match &ops[1] {
                    Operand::Memory(mr) if mr.size == 1 => format!("ZX8({})", mem_read(mr)),
                    Operand::Memory(mr) if mr.size == 2 => format!("ZX16({})", mem_read(mr)),
                    Operand::Register(r) if r.is_low8() || r.is_high8() => {
                        format!("ZX8({})", op_read(&ops[1]))
                    }
                    Operand::Register(r) if r.is_reg16() => {
                        format!("ZX16({})", op_read(&ops[1]))
                    }
                    other => op_read(other),
                };
                vec![op_write(&ops[0], &src)]
            }
            MovSx => {
                let src = match &ops[1] {
                    Operand::Memory(mr) => format!(
                        "(uint32_t)(int32_t){}({})",
                        smem_accessor(mr.size),
                        mem_addr(mr)
                    ),
                    Operand::Register(r) if r.is_low8() || r.is_high8() => {
                        format!("SX8({})", op_read(&ops[1]))
                    }
                    Operand::Register(r) if r.is_reg16() => {
                        format!("SX16({})", op_read(&ops[1]))
                    }
                    other => op_read(other),
                };
                vec![op_write(&ops[0], &src)]
            }
            Lea => match &ops[1] {
                Operand::Memory(mr) => vec![op_write(&ops[0], &mem_addr(mr))],
                _ => self.todo(insn),
            },
            Xchg => {
                let a = op_read(&ops[0]);
                let b = op_read(&ops[1]);
                vec![
                    format!("{{ uint32_t _tmp = {a};"),
                    op_write(&ops[0], &b),
                    format!("{} }}", op_write(&ops[1], "_tmp")),
                ]
            }
            Bswap => {
                let r = op_read(&ops[0]);
                vec![op_write(&ops[0], &format!("BSWAP32({r})"))]
            }

            // ── Stack ──
            Push => {
                let val = op_read(&ops[0]);
                vec![format!("PUSH32(esp, {val});")]
            }
            Pop => match &ops[0] {
                Operand::Register(r) if r.is_gpr32() => {
                    vec![format!("POP32(esp, {});", r.name())]
                }
                Operand::Register(r) if r.is_segment() => vec![format!(
                    "{{ uint32_t _tmp; POP32(esp, _tmp); }} /* pop {} - segment register */",
                    r.name()
                )],
                other => vec![format!(
                    "{{ uint32_t _tmp; POP32(esp, _tmp); {} }}",
                    op_write(other, "_tmp")
                )],
            },
            PushAll => vec![
                "{ uint32_t _esp0 = esp; PUSH32(esp, eax); PUSH32(esp, ecx); PUSH32(esp, edx); \
                 PUSH32(esp, ebx); PUSH32(esp, _esp0); PUSH32(esp, ebp); PUSH32(esp, esi); \
                 PUSH32(esp, edi); } /* pushad */"
                    .to_owned(),
            ],
            PopAll => vec![
                "{ uint32_t _drop; POP32(esp, edi); POP32(esp, esi); POP32(esp, ebp); \
                 POP32(esp, _drop); POP32(esp, ebx); POP32(esp, edx); POP32(esp, ecx); \
                 POP32(esp, eax); } /* popad */"
                    .to_owned(),
            ],
            Pushfd => vec!["esp -= 4; /* pushfd */".to_owned()],
            Popfd => vec!["esp += 4; /* popfd */".to_owned()],

            // ── Integer ALU ──
            Add | Sub | And | Or | Xor => {
                let c_op = match insn.mnemonic {
                    Add => "+",
                    Sub => "-",
                    And => "&",
                    Or => "|",
                    _ => "^",
                };
                if insn.mnemonic == Xor && same_register(ops) {
                    return vec![format!("{} /* xor self */", op_write(&ops[0], "0"))];
                }
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                vec![op_write(&ops[0], &format!("{dst} {c_op} {src}"))]
            }
            Inc | Dec => {
                let step = if insn.mnemonic == Inc { "++" } else { "--" };
                match &ops[0] {
                    Operand::Register(r) if r.is_gpr32() => {
                        vec![format!("{}{};", r.name(), step)]
                    }
                    other => {
                        let val = op_read(other);
                        let op_char = if insn.mnemonic == Inc { "+" } else { "-" };
                        vec![op_write(other, &format!("{val} {op_char} 1"))]
                    }
                }
            }
            Neg => {
                let val = op_read(&ops[0]);
                vec![op_write(&ops[0], &format!("(uint32_t)(-(int32_t){val})"))]
            }
            Not => {
                let val = op_read(&ops[0]);
                vec![op_write(&ops[0], &format!("~{val}"))]
            }
            Adc => {
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                vec![format!(
                    "{} /* adc */",
                    op_write(&ops[0], &format!("{dst} + {src} + _cf"))
                )]
            }
            Sbb => {
                if same_register(ops) {
                    // Carry-extension idiom: 0 or 0xFFFFFFFF by CF.
                    return vec![format!(
                        "{} /* sbb self (CF extend) */",
                        op_write(&ops[0], "_cf ? 0xFFFFFFFF : 0")
                    )];
                }
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                vec![format!(
                    "{} /* sbb */",
                    op_write(&ops[0], &format!("{dst} - {src} - _cf"))
                )]
            }
            IMul => match ops.len() {
                1 => {
                    let src = op_read(&ops[0]);
                    vec![
                        format!(
                            "{{ int64_t _r = (int64_t)(int32_t)eax * (int64_t)(int32_t){src};"
                        ),
                        "  eax = (uint32_t)_r; edx = (uint32_t)(_r >> 32); }".to_owned(),
                    ]
                }
                2 => {
                    let dst = op_read(&ops[0]);
                    let src = op_read(&ops[1]);
                    vec![op_write(
                        &ops[0],
                        &format!("(uint32_t)((int32_t){dst} * (int32_t){src})"),
                    )]
                }
                _ => {
                    let src = op_read(&ops[1]);
                    let k = op_read(&ops[2]);
                    vec![op_write(
                        &ops[0],
                        &format!("(uint32_t)((int32_t){src} * (int32_t){k})"),
                    )]
                }
            },
            Mul => {
                let src = op_read(&ops[0]);
                vec![
                    format!("{{ uint64_t _r = (uint64_t)eax * (uint64_t){src};"),
                    "  eax = (uint32_t)_r; edx = (uint32_t)(_r >> 32); }".to_owned(),
                ]
            }
            Div => {
                let src = op_read(&ops[0]);
                vec![
                    "{ uint64_t _dividend = ((uint64_t)edx << 32) | eax;".to_owned(),
                    format!("  eax = (uint32_t)(_dividend / (uint32_t){src});"),
                    format!("  edx = (uint32_t)(_dividend % (uint32_t){src}); }}"),
                ]
            }
            IDiv => {
                let src = op_read(&ops[0]);
                vec![
                    "{ int64_t _dividend = ((int64_t)(int32_t)edx << 32) | eax;".to_owned(),
                    format!("  eax = (uint32_t)((int32_t)(_dividend / (int32_t){src}));"),
                    format!("  edx = (uint32_t)((int32_t)(_dividend % (int32_t){src})); }}"),
                ]
            }
            Shl => self.lift_shift(ops, "<<"),
            Shr => self.lift_shift(ops, ">>"),
            Sar => {
                let dst = op_read(&ops[0]);
                let cnt = op_read(&ops[1]);
                vec![op_write(
                    &ops[0],
                    &format!("(uint32_t)((int32_t){dst} >> {cnt})"),
                )]
            }
            Rol | Ror => {
                let helper = if insn.mnemonic == Rol { "ROL32" } else { "ROR32" };
                let dst = op_read(&ops[0]);
                let cnt = op_read(&ops[1]);
                vec![op_write(&ops[0], &format!("{helper}({dst}, {cnt})"))]
            }
            Shld => {
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                let cnt = op_read(&ops[2]);
                vec![format!(
                    "{} /* shld */",
                    op_write(&ops[0], &format!("({dst} << {cnt}) | ({src} >> (32 - {cnt}))"))
                )]
            }
            Shrd => {
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                let cnt = op_read(&ops[2]);
                vec![format!(
                    "{} /* shrd */",
                    op_write(&ops[0], &format!("({dst} >> {cnt}) | ({src} << (32 - {cnt}))"))
                )]
            }

            // ── Compare / test: the following conditional consumes them ──
            Cmp => {
                let l = op_read(&ops[0]);
                let r = op_read(&ops[1]);
                vec![format!("/* cmp {l}, {r} - flags for next jcc */")]
            }
            Test => {
                let l = op_read(&ops[0]);
                let r = op_read(&ops[1]);
                vec![format!("/* test {l}, {r} - flags for next jcc */")]
            }
            Bt | Bts | Btr | Btc => {
                vec![format!("/* {insn} - bit test */")]
            }
            Bsf | Bsr => {
                // Scan helper: index of least/most significant set bit.
                let src = op_read(&ops[1]);
                let scan = if insn.mnemonic == Bsf {
                    "while (!(_v & 1)) { _v >>= 1; _i++; }"
                } else {
                    "while (_v >>= 1) { _i++; }"
                };
                let suffix = if insn.mnemonic == Bsf { "f" } else { "r" };
                vec![format!(
                    "{{ uint32_t _v = {src}; uint32_t _i = 0; if (_v) {{ {scan} }} {} }} /* bs{suffix} */",
                    op_write(&ops[0], "_i")
                )]
            }
            Cmpxchg => {
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                vec![format!(
                    "if (eax == {dst}) {{ {} }} else {{ eax = {dst}; }} /* cmpxchg */",
                    op_write(&ops[0], &src)
                )]
            }
            Xadd => {
                let dst = op_read(&ops[0]);
                let src = op_read(&ops[1]);
                vec![
                    format!("{{ uint32_t _sum = {dst} + {src};"),
                    op_write(&ops[1], &dst),
                    format!("{} }} /* xadd */", op_write(&ops[0], "_sum")),
                ]
            }

            // ── Control flow ──
            Call => self.lift_call(insn, ops),
            Ret => match ops.first() {
                Some(Operand::Imm32(n)) => vec![format!("{} /* ret {n} */", self.ret_stmt)],
                _ => vec![self.ret_stmt.clone()],
            },
            Jmp => self.lift_jmp(insn, ops),
            Jecxz => {
                let target = insn.jump_target;
                match target {
                    Some(t) if self.is_external(t) => {
                        let name = self.target_name(t);
                        let args = self.call_args(t);
                        vec![format!(
                            "if (ecx == 0) {{ {name}({args}); {} }} /* jecxz */",
                            self.ret_stmt
                        )]
                    }
                    Some(t) => vec![format!("if (ecx == 0) goto loc_{t:08X}; /* jecxz */")],
                    None => vec!["/* jecxz - no target */".to_owned()],
                }
            }
            Loop => match insn.jump_target {
                Some(t) if !self.is_external(t) => {
                    vec![format!("if (--ecx != 0) goto loc_{t:08X}; /* loop */")]
                }
                _ => vec!["ecx--; /* loop - external target */".to_owned()],
            },
            Jcc(cc) => {
                // Flag state was lost; fall back to the `_flags` local.
                let target = insn.jump_target;
                let desc = cc_desc(cc);
                match target {
                    Some(t) if self.is_external(t) => {
                        let name = self.target_name(t);
                        let args = self.call_args(t);
                        vec![format!(
                            "if (_flags /* j{}: {desc} */) {{ {name}({args}); {} }}",
                            cc.suffix(),
                            self.ret_stmt
                        )]
                    }
                    Some(t) => vec![format!(
                        "if (_flags /* j{}: {desc} */) goto loc_{t:08X};",
                        cc.suffix()
                    )],
                    None => vec![format!("/* j{}: {desc} - no target */", cc.suffix())],
                }
            }
            Setcc(cc) => {
                vec![op_write(&ops[0], &format!("_flags /* set{} */", cc.suffix()))]
            }
            Cmovcc(cc) => {
                let src = op_read(&ops[1]);
                vec![format!(
                    "if (_flags /* cmov{} */) {}",
                    cc.suffix(),
                    op_write(&ops[0], &src)
                )]
            }

            // ── String operations ──
            Movs(w) | Stos(w) | Lods(w) | Scas(w) | Cmps(w) => self.lift_string(insn, w),

            // ── Misc ──
            Cdq => vec!["edx = ((int32_t)eax < 0) ? 0xFFFFFFFF : 0; /* cdq */".to_owned()],
            Cwde => vec!["eax = SX16(eax); /* cwde */".to_owned()],
            Cbw => vec!["SET_LO16(eax, SX8(eax)); /* cbw */".to_owned()],
            Int3 => vec!["__debugbreak(); /* int3 */".to_owned()],
            Int => vec![format!("/* int {} */", op_read(&ops[0]))],
            Leave => vec!["esp = ebp;".to_owned(), "POP32(esp, ebp); /* leave */".to_owned()],
            Cld | Std => vec![format!("/* {} - direction flag */", insn.mnemonic)],
            Clc | Stc => vec![format!(
                "_cf = {}; /* {} */",
                if insn.mnemonic == Stc { 1 } else { 0 },
                insn.mnemonic
            )],
            Lahf => vec!["/* lahf - load AH from flags */".to_owned()],
            Sahf => vec!["/* sahf - store AH to flags (FPU compare idiom) */".to_owned()],
            Wait => vec!["/* wait - FPU sync */".to_owned()],
            Emms => vec!["/* emms - empty MMX state */".to_owned()],
            Prefetch => vec!["/* prefetch hint */".to_owned()],
            Hlt => vec!["/* hlt */".to_owned()],
            Cli | Sti => vec![format!("/* {} - interrupt flag */", insn.mnemonic)],

            // ── SSE ──
            Movss | MovsdSse | Movaps | Movups | Movapd | Movupd | Movlps | Movhps | MovqSse
            | Addss | Subss | Mulss | Divss | Sqrtss | Minss | Maxss | Rsqrtss | Rcpss | Addsd
            | Subsd | Mulsd | Divsd | Sqrtsd | Minsd | Maxsd | Comiss | Comisd | Ucomiss
            | Ucomisd | Cvtsi2ss | Cvtss2si | Cvttss2si | Cvtsi2sd | Cvtsd2si | Cvttsd2si
            | Cvtss2sd | Cvtsd2ss | Xorps | Xorpd | Andps | Andnps | Orps | Addps | Subps
            | Mulps | Divps | Minps | Maxps | Sqrtps | Rsqrtps | Rcpps | Shufps | Unpcklps
            | Unpckhps | Movmskps | Movd | MovqMmx | Movntq | Pand | Pandn | Por | Pxor
            | Pcmpeqd | Pcmpgtd => self.lift_sse(insn, ops),

            // ── x87 ──
            m if m.is_x87() => self.lift_fpu(insn, ops),

            _ => self.todo(insn),
        }
    }

    fn lift_shift(&mut self, ops: &[Operand], c_op: &str) -> Vec<String> {
        let dst = op_read(&ops[0]);
        let cnt = op_read(&ops[1]);
        vec![op_write(&ops[0], &format!("{dst} {c_op} {cnt}"))]
    }

    fn lift_call(&mut self, insn: &Instr, ops: &[Operand]) -> Vec<String> {
        if let Some(target) = insn.call_target {
            let name = self.target_name(target);
            let args = self.call_args(target);
            return vec![format!("{name}({args}); /* call 0x{target:08X} */")];
        }
        if let Some(thunk) = insn.memory_ref {
            // Calls through a known thunk go straight to the import shim.
            if let Some(name) = self.labels.name_of(thunk) {
                return vec![format!("{name}(); /* call 0x{thunk:08X} */")];
            }
            return vec![format!(
                "RECOMP_ICALL(MEM32({})); /* indirect call */",
                imm(thunk)
            )];
        }
        if let Some(op) = ops.first() {
            let target = op_read(op);
            return vec![format!("RECOMP_ICALL({target}); /* indirect call */")];
        }
        vec!["/* call: no target */".to_owned()]
    }

    fn lift_jmp(&mut self, insn: &Instr, ops: &[Operand]) -> Vec<String> {
        if let Some(target) = insn.jump_target {
            if self.is_external(target) {
                let name = self.target_name(target);
                let args = self.call_args(target);
                return vec![format!(
                    "{name}({args}); {} /* tail jmp 0x{target:08X} */",
                    self.ret_stmt
                )];
            }
            return vec![format!("goto loc_{target:08X};")];
        }
        if let Some(thunk) = insn.memory_ref {
            if let Some(name) = self.labels.name_of(thunk) {
                return vec![format!(
                    "{name}(); {} /* tail jmp 0x{thunk:08X} */",
                    self.ret_stmt
                )];
            }
            return vec![format!(
                "RECOMP_ICALL(MEM32({})); {} /* indirect tail jmp */",
                imm(thunk),
                self.ret_stmt
            )];
        }
        if let Some(op) = ops.first() {
            let target = op_read(op);
            return vec![format!(
                "RECOMP_ICALL({target}); {} /* indirect tail jmp */",
                self.ret_stmt
            )];
        }
        vec!["/* jmp: no target */".to_owned()]
    }

    fn lift_string(&mut self, insn: &Instr, w: Width) -> Vec<String> {
        use Mnemonic::*;
        let rep = insn.rep.is_some();
        let n = w.bytes();
        match (insn.mnemonic, rep) {
            (Movs(Width::Byte), true) => vec![
                "memcpy((void*)(uintptr_t)edi, (void*)(uintptr_t)esi, ecx);".to_owned(),
                "esi += ecx; edi += ecx; ecx = 0; /* rep movsb */".to_owned(),
            ],
            (Movs(_), true) => vec![
                format!("memcpy((void*)(uintptr_t)edi, (void*)(uintptr_t)esi, ecx * {n});"),
                format!(
                    "esi += ecx * {n}; edi += ecx * {n}; ecx = 0; /* rep movs{} */",
                    w.suffix()
                ),
            ],
            (Stos(Width::Byte), true) => vec![
                "memset((void*)(uintptr_t)edi, (uint8_t)eax, ecx);".to_owned(),
                "edi += ecx; ecx = 0; /* rep stosb */".to_owned(),
            ],
            (Stos(Width::Word), true) => vec![
                "{ uint32_t _i; for (_i = 0; _i < ecx; _i++) MEM16(edi + _i*2) = LO16(eax); }"
                    .to_owned(),
                "edi += ecx * 2; ecx = 0; /* rep stosw */".to_owned(),
            ],
            (Stos(Width::Dword), true) => vec![
                "{ uint32_t _i; for (_i = 0; _i < ecx; _i++) MEM32(edi + _i*4) = eax; }"
                    .to_owned(),
                "edi += ecx * 4; ecx = 0; /* rep stosd */".to_owned(),
            ],
            (Cmps(_), true) | (Scas(_), true) => {
                vec![format!("/* {insn} - string compare, ecx iterations */")]
            }
            (Lods(_), true) => vec![format!("/* rep lods{} */", w.suffix())],
            // Single-step forms: one element, then pointer updates.
            (Movs(Width::Byte), false) => {
                vec!["MEM8(edi) = MEM8(esi); esi++; edi++; /* movsb */".to_owned()]
            }
            (Movs(Width::Word), false) => {
                vec!["MEM16(edi) = MEM16(esi); esi += 2; edi += 2; /* movsw */".to_owned()]
            }
            (Movs(Width::Dword), false) => {
                vec!["MEM32(edi) = MEM32(esi); esi += 4; edi += 4; /* movsd */".to_owned()]
            }
            (Stos(Width::Byte), false) => {
                vec!["MEM8(edi) = LO8(eax); edi++; /* stosb */".to_owned()]
            }
            (Stos(Width::Word), false) => {
                vec!["MEM16(edi) = LO16(eax); edi += 2; /* stosw */".to_owned()]
            }
            (Stos(Width::Dword), false) => {
                vec!["MEM32(edi) = eax; edi += 4; /* stosd */".to_owned()]
            }
            (Lods(Width::Byte), false) => {
                vec!["SET_LO8(eax, MEM8(esi)); esi++; /* lodsb */".to_owned()]
            }
            (Lods(Width::Word), false) => {
                vec!["SET_LO16(eax, MEM16(esi)); esi += 2; /* lodsw */".to_owned()]
            }
            (Lods(Width::Dword), false) => {
                vec!["eax = MEM32(esi); esi += 4; /* lodsd */".to_owned()]
            }
            (Scas(_), false) | (Cmps(_), false) => {
                vec![format!("/* {insn} - flags for next jcc */")]
            }
            _ => self.todo(insn),
        }
    }

    fn lift_sse(&mut self, insn: &Instr, ops: &[Operand]) -> Vec<String> {
        use Mnemonic::*;
        let m = insn.mnemonic;
        let name = m.name();
        if ops.len() < 2 {
            return self.todo(insn);
        }

        match m {
            Movss | MovsdSse | Movaps | Movups | Movapd | Movupd | Movlps | Movhps | MovqSse => {
                let src = sse_read(&ops[1]);
                vec![format!("{} /* {name} */", sse_write(&ops[0], &src))]
            }
            Movd => match (&ops[0], &ops[1]) {
                (Operand::Register(r), src_op) if r.is_xmm() || r.is_mmx() => {
                    let src = op_read(src_op);
                    vec![format!("memcpy(&{}, &{src}, 4); /* movd */", r.name())]
                }
                (dst, Operand::Register(r)) if r.is_xmm() || r.is_mmx() => {
                    vec![format!(
                        "{} /* movd */",
                        op_write(dst, &format!("(uint32_t){}", r.name()))
                    )]
                }
                _ => self.todo(insn),
            },
            Addss | Addsd => self.sse_binop(&name, ops, "+"),
            Subss | Subsd => self.sse_binop(&name, ops, "-"),
            Mulss | Mulsd => self.sse_binop(&name, ops, "*"),
            Divss | Divsd => self.sse_binop(&name, ops, "/"),
            Sqrtss => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* sqrtss */",
                    sse_write(&ops[0], &format!("sqrtf({src})"))
                )]
            }
            Sqrtsd => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* sqrtsd */",
                    sse_write(&ops[0], &format!("sqrt({src})"))
                )]
            }
            Minss | Minsd => {
                let a = sse_read(&ops[0]);
                let b = sse_read(&ops[1]);
                vec![format!(
                    "{} /* {name} */",
                    sse_write(&ops[0], &format!("({a} < {b} ? {a} : {b})"))
                )]
            }
            Maxss | Maxsd => {
                let a = sse_read(&ops[0]);
                let b = sse_read(&ops[1]);
                vec![format!(
                    "{} /* {name} */",
                    sse_write(&ops[0], &format!("({a} > {b} ? {a} : {b})"))
                )]
            }
            Rsqrtss => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* rsqrtss */",
                    sse_write(&ops[0], &format!("1.0f / sqrtf({src})"))
                )]
            }
            Rcpss => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* rcpss */",
                    sse_write(&ops[0], &format!("1.0f / {src}"))
                )]
            }
            Cvtsi2ss => {
                let src = op_read(&ops[1]);
                vec![format!(
                    "{} /* cvtsi2ss */",
                    sse_write(&ops[0], &format!("(float)(int32_t){src}"))
                )]
            }
            Cvtsi2sd => {
                let src = op_read(&ops[1]);
                vec![format!(
                    "{} /* cvtsi2sd */",
                    sse_write(&ops[0], &format!("(double)(int32_t){src}"))
                )]
            }
            Cvtss2si | Cvttss2si | Cvtsd2si | Cvttsd2si => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* {name} */",
                    op_write(&ops[0], &format!("(uint32_t)(int32_t){src}"))
                )]
            }
            Cvtss2sd => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* cvtss2sd */",
                    sse_write(&ops[0], &format!("(double){src}"))
                )]
            }
            Cvtsd2ss => {
                let src = sse_read(&ops[1]);
                vec![format!(
                    "{} /* cvtsd2ss */",
                    sse_write(&ops[0], &format!("(float){src}"))
                )]
            }
            Comiss | Comisd | Ucomiss | Ucomisd => {
                // The operands are recorded; the following conditional
                // compares them directly.
                let a = sse_read(&ops[0]);
                let b = sse_read(&ops[1]);
                vec![format!("/* {name} {a}, {b} - flags for next jcc */")]
            }
            Xorps | Xorpd | Pxor => {
                if same_register(ops) {
                    let dst = match &ops[0] {
                        Operand::Register(r) => r.name().to_owned(),
                        other => op_read(other),
                    };
                    return vec![format!("{dst} = 0; /* {name} self = zero */")];
                }
                vec![format!("/* {insn} (packed) */")]
            }
            Movmskps => {
                vec![op_write(&ops[0], &format!("0 /* movmskps {} */", sse_read(&ops[1])))]
            }
            // Packed float / MMX integer forms stay placeholders.
            _ => {
                vec![format!("/* {insn} (packed/MMX) */")]
            }
        }
    }

    fn sse_binop(&mut self, name: &str, ops: &[Operand], c_op: &str) -> Vec<String> {
        let a = sse_read(&ops[0]);
        let b = sse_read(&ops[1]);
        vec![format!(
            "{} /* {name} */",
            sse_write(&ops[0], &format!("{a} {c_op} {b}"))
        )]
    }

    fn lift_fpu(&mut self, insn: &Instr, ops: &[Operand]) -> Vec<String> {
        use Mnemonic::*;
        match insn.mnemonic {
            Fld => match ops.first() {
                Some(Operand::Memory(mr)) if mr.size == 8 => {
                    vec![format!("fp_push(MEMD({})); /* fld double */", mem_addr(mr))]
                }
                Some(Operand::Memory(mr)) => {
                    vec![format!("fp_push(MEMF({})); /* fld float */", mem_addr(mr))]
                }
                Some(Operand::Register(Reg::St(i))) => {
                    vec![format!("fp_push(fp_st({i})); /* fld st{i} */")]
                }
                _ => vec![format!("/* {insn} */")],
            },
            Fst | Fstp => {
                let pop = insn.mnemonic == Fstp;
                let tail = if pop { " fp_pop();" } else { "" };
                match ops.first() {
                    Some(Operand::Memory(mr)) if mr.size == 8 => vec![format!(
                        "MEMD({}) = fp_top();{tail} /* {} */",
                        mem_addr(mr),
                        insn.mnemonic
                    )],
                    Some(Operand::Memory(mr)) => vec![format!(
                        "MEMF({}) = (float)fp_top();{tail} /* {} */",
                        mem_addr(mr),
                        insn.mnemonic
                    )],
                    Some(Operand::Register(Reg::St(i))) => vec![format!(
                        "fp_st({i}) = fp_top();{tail} /* {} st{i} */",
                        insn.mnemonic
                    )],
                    _ => vec![format!("/* {insn} */")],
                }
            }
            Fild => match ops.first() {
                Some(Operand::Memory(mr)) => vec![format!(
                    "fp_push((double){}({})); /* fild */",
                    smem_accessor(mr.size.min(4)),
                    mem_addr(mr)
                )],
                _ => vec![format!("/* {insn} */")],
            },
            Fist | Fistp => {
                let pop = insn.mnemonic == Fistp;
                let tail = if pop { " fp_pop();" } else { "" };
                match ops.first() {
                    Some(Operand::Memory(mr)) => vec![format!(
                        "{}({}) = (int32_t)fp_top();{tail} /* {} */",
                        crate::operand::mem_accessor(mr.size.min(4)),
                        mem_addr(mr),
                        insn.mnemonic
                    )],
                    _ => vec![format!("/* {insn} */")],
                }
            }
            Fadd | Faddp => self.fpu_arith(insn, ops, "+="),
            Fsub | Fsubp => self.fpu_arith(insn, ops, "-="),
            Fmul | Fmulp => self.fpu_arith(insn, ops, "*="),
            Fdiv | Fdivp => self.fpu_arith(insn, ops, "/="),
            Fsubr | Fsubrp => self.fpu_arith_rev(insn, ops, "-"),
            Fdivr | Fdivrp => self.fpu_arith_rev(insn, ops, "/"),
            Fiadd => self.fpu_int_arith(insn, ops, "+="),
            Fisub => self.fpu_int_arith(insn, ops, "-="),
            Fimul => self.fpu_int_arith(insn, ops, "*="),
            Fidiv => self.fpu_int_arith(insn, ops, "/="),
            Fchs => vec!["fp_top() = -fp_top(); /* fchs */".to_owned()],
            Fabs => vec!["fp_top() = fabs(fp_top()); /* fabs */".to_owned()],
            Fsqrt => vec!["fp_top() = sqrt(fp_top()); /* fsqrt */".to_owned()],
            Fsin => vec!["fp_top() = sin(fp_top()); /* fsin */".to_owned()],
            Fcos => vec!["fp_top() = cos(fp_top()); /* fcos */".to_owned()],
            Fpatan => vec![
                "fp_st1() = atan2(fp_st1(), fp_top()); fp_pop(); /* fpatan */".to_owned(),
            ],
            Fprem | Fprem1 => vec![
                "fp_top() = fmod(fp_top(), fp_st1()); /* fprem */".to_owned(),
            ],
            Fxch => vec![
                "{ double _t = fp_top(); fp_top() = fp_st1(); fp_st1() = _t; } /* fxch */"
                    .to_owned(),
            ],
            Fldz => vec!["fp_push(0.0); /* fldz */".to_owned()],
            Fld1 => vec!["fp_push(1.0); /* fld1 */".to_owned()],
            Fldpi => vec!["fp_push(3.14159265358979323846); /* fldpi */".to_owned()],
            Ftst => vec![
                "_fpu_cmp = (fp_top() < 0.0) ? -1 : (fp_top() > 0.0) ? 1 : 0; /* ftst */"
                    .to_owned(),
            ],
            Fcom | Fcomp | Fcompp | Fucom | Fucomp | Fucompp => {
                let pops = match insn.mnemonic {
                    Fcompp | Fucompp => " fp_pop(); fp_pop();",
                    Fcomp | Fucomp => " fp_pop();",
                    _ => "",
                };
                vec![format!(
                    "_fpu_cmp = (fp_top() < fp_st1()) ? -1 : (fp_top() > fp_st1()) ? 1 : 0;\
                     {pops} /* {} */",
                    insn.mnemonic
                )]
            }
            Fcomi | Fcomip | Fucomi | Fucomip => {
                let pops = matches!(insn.mnemonic, Fcomip | Fucomip);
                let tail = if pops { " fp_pop();" } else { "" };
                vec![format!(
                    "_fpu_cmp = (fp_top() < fp_st1()) ? -1 : (fp_top() > fp_st1()) ? 1 : 0;\
                     {tail} /* {} */",
                    insn.mnemonic
                )]
            }
            Fnstsw => vec![format!("/* fnstsw {} - store FPU status word */", opstr(ops))],
            Fnstcw => vec![format!("/* fnstcw {} - store FPU control word */", opstr(ops))],
            Fldcw => vec![format!("/* fldcw {} - load FPU control word */", opstr(ops))],
            Ffree => vec![format!("/* ffree {} */", opstr(ops))],
            Fincstp => vec!["fp_pop(); /* fincstp */".to_owned()],
            Fdecstp => vec!["fp_push(0.0); /* fdecstp */".to_owned()],
            Fnop => vec!["/* fnop */".to_owned()],
            _ => {
                self.translation_gaps += 1;
                vec![format!("/* FPU: {insn} */")]
            }
        }
    }

    fn fpu_arith(&mut self, insn: &Instr, ops: &[Operand], c_op: &str) -> Vec<String> {
        match ops.first() {
            Some(Operand::Memory(mr)) if mr.size == 8 => {
                vec![format!(
                    "fp_top() {c_op} MEMD({}); /* {} */",
                    mem_addr(mr),
                    insn.mnemonic
                )]
            }
            Some(Operand::Memory(mr)) => {
                vec![format!(
                    "fp_top() {c_op} MEMF({}); /* {} */",
                    mem_addr(mr),
                    insn.mnemonic
                )]
            }
            _ => vec![format!(
                "fp_st1() {c_op} fp_top(); fp_pop(); /* {} */",
                insn.mnemonic
            )],
        }
    }

    fn fpu_arith_rev(&mut self, insn: &Instr, ops: &[Operand], c_op: &str) -> Vec<String> {
        match ops.first() {
            Some(Operand::Memory(mr)) => {
                let acc = if mr.size == 8 { "MEMD" } else { "MEMF" };
                vec![format!(
                    "fp_top() = {acc}({}) {c_op} fp_top(); /* {} */",
                    mem_addr(mr),
                    insn.mnemonic
                )]
            }
            _ => vec![format!(
                "fp_st1() = fp_top() {c_op} fp_st1(); fp_pop(); /* {} */",
                insn.mnemonic
            )],
        }
    }

    fn fpu_int_arith(&mut self, insn: &Instr, ops: &[Operand], c_op: &str) -> Vec<String> {
        match ops.first() {
            Some(Operand::Memory(mr)) => vec![format!(
                "fp_top() {c_op} (double){}({}); /* {} */",
                smem_accessor(mr.size.min(4)),
                mem_addr(mr),
                insn.mnemonic
            )],
            _ => vec![format!("/* {insn} */")],
        }
    }
}

fn opstr(ops: &[Operand]) -> String {
    ops.iter()
        .map(|o| o.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn same_register(ops: &[Operand]) -> bool {
    matches!(
        (ops.first(), ops.get(1)),
        (Some(Operand::Register(a)), Some(Operand::Register(b))) if a == b
    )
}

fn is_lea_nop(insn: &Instr) -> bool {
    if insn.operands.len() != 2 {
        return false;
    }
    match (&insn.operands[0], &insn.operands[1]) {
        (Operand::Register(r), Operand::Memory(mr)) => {
            mr.base == Some(*r) && mr.index.is_none() && mr.displacement == 0
        }
        _ => false,
    }
}

/// Lift one basic block, threading flag state through it. The state in is
/// the state propagated along the fall-through edge from the previous
/// block; the state out feeds the next.
pub fn lift_block(
    lifter: &mut Lifter,
    bb: &BasicBlock,
    flag_state: Option<FlagState>,
) -> (Vec<String>, Option<FlagState>) {
    let mut stmts = Vec::new();
    let mut state = flag_state;
    let insns = &bb.insns;
    let mut i = 0usize;

    while i < insns.len() {
        let curr = &insns[i];

        // The cmp/test; jcc pair fuses into a single `if`.
        if matches!(curr.mnemonic, Mnemonic::Cmp | Mnemonic::Test) && i + 1 < insns.len() {
            let next = &insns[i + 1];
            if let Mnemonic::Jcc(cc) = next.mnemonic {
                let pair_state = FlagState::of(curr);
                if let Some(cond) = condition(cc, &pair_state) {
                    stmts.push(lifter.cond_goto(&cond, cc, next.jump_target));
                    // The compare's flags survive the jump for any
                    // further conditional in this block.
                    state = Some(pair_state);
                    i += 2;
                    continue;
                }
            }
        }

        match curr.mnemonic {
            Mnemonic::Jecxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne => {
                stmts.extend(lifter.lift_instruction(curr));
                i += 1;
                continue;
            }
            Mnemonic::Jcc(cc) => {
                if let Some(s) = &state {
                    if let Some(cond) = condition(cc, s) {
                        stmts.push(lifter.cond_goto(&cond, cc, curr.jump_target));
                        i += 1;
                        continue;
                    }
                }
            }
            Mnemonic::Setcc(cc) => {
                if let Some(s) = &state {
                    if let Some(cond) = condition(cc, s) {
                        stmts.push(format!(
                            "{} /* set{} */",
                            crate::operand::op_write(&curr.operands[0], &format!("({cond}) ? 1 : 0")),
                            cc.suffix()
                        ));
                        i += 1;
                        continue;
                    }
                }
            }
            Mnemonic::Cmovcc(cc) => {
                if let Some(s) = &state {
                    if let Some(cond) = condition(cc, s) {
                        let src = crate::operand::op_read(&curr.operands[1]);
                        stmts.push(format!(
                            "if ({cond}) {} /* cmov{} */",
                            crate::operand::op_write(&curr.operands[0], &src),
                            cc.suffix()
                        ));
                        i += 1;
                        continue;
                    }
                }
            }
            _ => {}
        }

        stmts.extend(lifter.lift_instruction(curr));
        state = advance(state, curr);
        i += 1;
    }

    (stmts, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::build_basic_blocks;

    fn decode_all(bytes: &[u8], va: u32) -> Vec<Instr> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < bytes.len() {
            let off = ip;
            let mut insn = Instr::decode_one(bytes, &mut ip, va + off as u32).unwrap();
            insn.resolve_targets(0x0001_0000, 0x0080_0000);
            out.push(insn);
        }
        out
    }

    fn lift_bytes(bytes: &[u8], va: u32, end: u32) -> Vec<String> {
        let funcs = FunctionTable::default();
        let labels = LabelTable::new();
        let abi = AbiDatabase::default();
        let mut lifter = Lifter::new(&funcs, &labels, &abi);
        lifter.func_start = va;
        lifter.func_end = end;
        let insns = decode_all(bytes, va);
        let blocks = build_basic_blocks(&insns, va, end);
        let mut out = Vec::new();
        let mut state = None;
        for bb in &blocks {
            let (stmts, next) = lift_block(&mut lifter, bb, state);
            out.extend(stmts);
            state = next;
        }
        out
    }

    #[test]
    fn it_fuses_cmp_je_into_one_if() {
        // cmp eax, 0x10; je +2; ret; ret
        let stmts = lift_bytes(&[0x83, 0xF8, 0x10, 0x74, 0x01, 0xC3, 0xC3], 0x0001_1000, 0x0001_1007);
        assert_eq!(
            stmts[0],
            "if (CMP_EQ(eax, 0x10)) goto loc_00011006; /* jz: equal / zero */"
        );
        // No standalone comparison statement survives.
        assert!(!stmts.iter().any(|s| s.contains("- flags for next jcc")));
        assert_eq!(stmts.iter().filter(|s| s.starts_with("if ")).count(), 1);
    }

    #[test]
    fn it_translates_xor_self_to_zero() {
        let stmts = lift_bytes(&[0x33, 0xC0, 0xC3], 0x0001_1000, 0x0001_1003);
        assert_eq!(stmts[0], "eax = 0; /* xor self */");
    }

    #[test]
    fn it_translates_push_pop_and_mov() {
        let stmts = lift_bytes(&[0x55, 0x8B, 0xEC, 0x5D, 0xC3], 0x0001_1000, 0x0001_1005);
        assert_eq!(stmts[0], "PUSH32(esp, ebp);");
        assert_eq!(stmts[1], "ebp = esp;");
        assert_eq!(stmts[2], "POP32(esp, ebp);");
        assert_eq!(stmts[3], "return;");
    }

    #[test]
    fn it_keeps_flag_state_across_two_branches() {
        // cmp eax, 5; jz +3; jb +1 — the second jcc reuses the cmp flags.
        let code = [
            0x83, 0xF8, 0x05, // cmp eax, 5
            0x74, 0x03, // jz 0x11008
            0x72, 0x01, // jb 0x11008
            0xC3, // 0x11007: ret
            0xC3, // 0x11008: ret
        ];
        let stmts = lift_bytes(&code, 0x0001_1000, 0x0001_1009);
        assert!(stmts[0].contains("CMP_EQ(eax, 5)"));
        assert!(stmts[1].contains("CMP_B(eax, 5)"), "got: {}", stmts[1]);
    }

    #[test]
    fn it_lowers_setcc_with_known_state() {
        // cmp eax, 0; sete al; ret — via 3A? use 83 F8 00; 0F 94 C0
        let code = [0x83, 0xF8, 0x00, 0x0F, 0x94, 0xC0, 0xC3];
        let stmts = lift_bytes(&code, 0x0001_1000, 0x0001_1007);
        assert_eq!(stmts[1], "SET_LO8(eax, (CMP_EQ(eax, 0)) ? 1 : 0); /* setz */");
    }

    #[test]
    fn it_emits_rep_movsd_as_memcpy() {
        let stmts = lift_bytes(&[0xF3, 0xA5, 0xC3], 0x0001_1000, 0x0001_1003);
        assert!(stmts[0].contains("memcpy"));
        assert!(stmts[1].contains("ecx = 0"));
    }

    #[test]
    fn it_falls_back_to_flags_when_state_is_lost() {
        // div ecx destroys flags; the jz afterwards cannot be lowered.
        let code = [
            0xF7, 0xF1, // div ecx
            0x74, 0x01, // jz +1
            0xC3, 0xC3,
        ];
        let stmts = lift_bytes(&code, 0x0001_1000, 0x0001_1006);
        assert!(stmts.iter().any(|s| s.contains("_flags")));
    }
}
