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

//! Flag-state dataflow and condition synthesis.
//!
//! EFLAGS are never modeled bit by bit. The translator remembers which
//! instruction last set the flags and with which operands; when a
//! conditional consumes them, the pair (setter, condition code) selects a
//! C expression that reproduces the predicate on the surviving values.
//!
//! The state is a value threaded along fall-through edges only; branch
//! edges start clean.

use crate::operand::{op_read, sse_read};
use i386::{Cc, Instr, Mnemonic, Operand};

/// What the last flag-setting instruction was.
#[derive(Clone, Debug)]
pub struct FlagState {
    pub setter: Mnemonic,
    pub ops: Vec<Operand>,
}

impl FlagState {
    pub fn of(insn: &Instr) -> Self {
        FlagState {
            setter: insn.mnemonic,
            ops: insn.operands.clone(),
        }
    }
}

/// How an instruction interacts with the tracked flag state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagEffect {
    Sets,
    Preserves,
    Destroys,
}

pub fn flag_effect(insn: &Instr) -> FlagEffect {
    use Mnemonic::*;
    match insn.mnemonic {
        // Primary setters the condition table understands.
        Cmp | Test | Sub | Add | And | Or | Xor | Inc | Dec | Neg | Shl | Shr | Sar | IMul
        | Adc | Sbb | Comiss | Comisd | Ucomiss | Ucomisd => FlagEffect::Sets,
        // Secondary setters, handled where meaningful.
        Shld | Shrd | Rol | Ror | Rcl | Rcr | Bsf | Bsr | Bt | Bts | Btr | Btc | Cmpxchg
        | Xadd => FlagEffect::Sets,
        // FPU compare results ride `_fpu_cmp`; sahf republishes them.
        Sahf => FlagEffect::Sets,
        m if m.is_fpu_compare() => FlagEffect::Sets,
        // String compare/scan under a rep prefix sets flags; plain string
        // moves preserve them.
        Cmps(_) | Scas(_) => FlagEffect::Sets,
        Movs(_) | Stos(_) | Lods(_) => FlagEffect::Preserves,
        // Flags partially undefined; drop the state.
        Mul | Div | IDiv | Cpuid | Rdtsc => FlagEffect::Destroys,
        // Data movement and friends leave EFLAGS alone.
        Mov | MovZx | MovSx | Lea | Xchg | Bswap | Push | Pop | PushAll | PopAll | Pushfd
        | Popfd | Nop | Leave | Ret | Cdq | Cwde | Cbw | Lahf | Not | Call | Int3 | Int | Wait
        | Cld | Std | Cli | Sti | Clc | Stc | Hlt | Prefetch | Emms => FlagEffect::Preserves,
        // Branches and the conditional family read flags, never write.
        Jmp | Jcc(_) | Jecxz | Loop | Loope | Loopne | Setcc(_) | Cmovcc(_) => {
            FlagEffect::Preserves
        }
        // SSE/MMX data operations.
        Movss | MovsdSse | Movaps | Movups | Movapd | Movupd | Movlps | Movhps | Movd | MovqSse
        | Addss | Subss | Mulss | Divss | Sqrtss | Minss | Maxss | Rsqrtss | Rcpss | Addsd
        | Subsd | Mulsd | Divsd | Sqrtsd | Minsd | Maxsd | Cvtsi2ss | Cvtss2si | Cvttss2si
        | Cvtsi2sd | Cvtsd2si | Cvttsd2si | Cvtss2sd | Cvtsd2ss | Xorps | Xorpd | Andps
        | Andnps | Orps | Addps | Subps | Mulps | Divps | Minps | Maxps | Sqrtps | Rsqrtps
        | Rcpps | Shufps | Unpcklps | Unpckhps | Movmskps | MovqMmx | Movntq | Pand | Pandn
        | Por | Pxor | Pcmpeqd | Pcmpgtd => FlagEffect::Preserves,
        // Non-compare x87 never touches EFLAGS.
        m if m.is_x87() => FlagEffect::Preserves,
        // Anything unrecognized conservatively clears the state.
        _ => FlagEffect::Destroys,
    }
}

fn signed(expr: &str) -> String {
    format!("(int32_t){expr}")
}

/// Synthesize a C condition for `cc` given the flag state. Returns None
/// when the pair has no faithful rendering; the caller falls back to the
/// `_flags` placeholder.
pub fn condition(cc: Cc, state: &FlagState) -> Option<String> {
    use Mnemonic::*;

    let lhs = state.ops.first().map(op_read);
    let rhs = state.ops.get(1).map(op_read);

    match state.setter {
        m if m.is_fpu_compare() => fpu_condition(cc, &m),
        Sahf => fpu_condition(cc, &Sahf),
        Comiss | Comisd | Ucomiss | Ucomisd => {
            let a = state.ops.first().map(sse_read)?;
            let b = state.ops.get(1).map(sse_read)?;
            float_condition(cc, &a, &b)
        }
        Cmps(_) | Scas(_) => match cc {
            Cc::Z => Some("1 /* strings matched */".to_owned()),
            Cc::Nz => Some("0 /* strings differed */".to_owned()),
            _ => None,
        },
        Cmp => cmp_condition(cc, &lhs?, &rhs?),
        Test => test_condition(cc, &lhs?, &rhs?),
        Sub => sub_condition(cc, &lhs?, &rhs?),
        Add => add_condition(cc, &lhs?, &rhs?),
        And | Or | Xor => logic_condition(cc, &lhs?),
        Inc | Dec | Shld | Shrd | Adc | Sbb | Xadd => result_condition(cc, &lhs?),
        Shl | Shr | Sar => result_condition(cc, &lhs?),
        Neg => neg_condition(cc, &lhs?),
        IMul => match cc {
            // IMUL leaves ZF/SF undefined; only the result-is-zero idiom
            // appears in practice.
            Cc::Z => Some(format!("({} == 0)", lhs?)),
            Cc::Nz => Some(format!("({} != 0)", lhs?)),
            _ => None,
        },
        Bsf | Bsr => match cc {
            Cc::Z => Some(format!("({} == 0)", rhs?)),
            Cc::Nz => Some(format!("({} != 0)", rhs?)),
            _ => None,
        },
        Bt | Bts | Btr | Btc => {
            let l = lhs?;
            let r = rhs?;
            match cc {
                Cc::B => Some(format!("(({l} >> ({r} & 31)) & 1)")),
                Cc::Ae => Some(format!("!(({l} >> ({r} & 31)) & 1)")),
                _ => None,
            }
        }
        Cmpxchg => match cc {
            Cc::Z => Some(format!("({} == eax)", lhs?)),
            Cc::Nz => Some(format!("({} != eax)", lhs?)),
            _ => None,
        },
        Rol | Ror | Rcl | Rcr => None, // only CF/OF move; not reconstructible
        _ => None,
    }
}

/// `cmp a, b`: flags describe `a - b` with both values intact.
fn cmp_condition(cc: Cc, l: &str, r: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("CMP_EQ({l}, {r})"),
        Cc::Nz => format!("CMP_NE({l}, {r})"),
        Cc::B => format!("CMP_B({l}, {r})"),
        Cc::Ae => format!("CMP_AE({l}, {r})"),
        Cc::Be => format!("CMP_BE({l}, {r})"),
        Cc::A => format!("CMP_A({l}, {r})"),
        Cc::L => format!("CMP_L({l}, {r})"),
        Cc::Ge => format!("CMP_GE({l}, {r})"),
        Cc::Le => format!("CMP_LE({l}, {r})"),
        Cc::G => format!("CMP_G({l}, {r})"),
        Cc::S => format!("({} < 0)", signed(&format!("({l} - {r})"))),
        Cc::Ns => format!("({} >= 0)", signed(&format!("({l} - {r})"))),
        Cc::O | Cc::No | Cc::P | Cc::Np => return None,
    })
}

/// `test a, b`: flags describe `a & b`; CF and OF are cleared.
fn test_condition(cc: Cc, l: &str, r: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("TEST_Z({l}, {r})"),
        Cc::Nz => format!("TEST_NZ({l}, {r})"),
        Cc::S => format!("TEST_S({l}, {r})"),
        Cc::Ns => format!("({} >= 0)", signed(&format!("({l} & {r})"))),
        Cc::L => format!("({} < 0)", signed(&format!("({l} & {r})"))),
        Cc::Ge => format!("({} >= 0)", signed(&format!("({l} & {r})"))),
        Cc::Le => format!("({} <= 0)", signed(&format!("({l} & {r})"))),
        Cc::G => format!("({} > 0)", signed(&format!("({l} & {r})"))),
        // CF=0 after test.
        Cc::B => "0".to_owned(),
        Cc::Be => format!("TEST_Z({l}, {r})"),
        Cc::Ae => "1".to_owned(),
        Cc::A => format!("TEST_NZ({l}, {r})"),
        Cc::O => "0".to_owned(),
        Cc::No => "1".to_owned(),
        Cc::P | Cc::Np => return None,
    })
}

/// `sub a, b`: `a` now holds the difference; ordered comparisons
/// reconstruct the original `a` as `result + b`.
fn sub_condition(cc: Cc, l: &str, r: &str) -> Option<String> {
    let orig = format!("(uint32_t){l} + (uint32_t){r}");
    Some(match cc {
        Cc::Z => format!("({l} == 0)"),
        Cc::Nz => format!("({l} != 0)"),
        Cc::S => format!("({} < 0)", signed(l)),
        Cc::Ns => format!("({} >= 0)", signed(l)),
        Cc::B => format!("CMP_B({orig}, (uint32_t){r})"),
        Cc::Ae => format!("CMP_AE({orig}, (uint32_t){r})"),
        Cc::Be => format!("CMP_BE({orig}, (uint32_t){r})"),
        Cc::A => format!("CMP_A({orig}, (uint32_t){r})"),
        Cc::L => format!("({} < 0)", signed(l)),
        Cc::Ge => format!("({} >= 0)", signed(l)),
        Cc::Le => format!("({} <= 0)", signed(l)),
        Cc::G => format!("({} > 0)", signed(l)),
        Cc::O | Cc::No | Cc::P | Cc::Np => return None,
    })
}

/// `add a, b`: flags from the stored result.
fn add_condition(cc: Cc, l: &str, r: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("({l} == 0)"),
        Cc::Nz => format!("({l} != 0)"),
        Cc::S => format!("({} < 0)", signed(l)),
        Cc::Ns => format!("({} >= 0)", signed(l)),
        // Carry out of the addition: the result wrapped below an addend.
        Cc::B => format!("({l} < (uint32_t){r})"),
        Cc::Ae => format!("({l} >= (uint32_t){r})"),
        Cc::L => format!("({} < 0)", signed(l)),
        Cc::Ge => format!("({} >= 0)", signed(l)),
        Cc::Le => format!("({} <= 0)", signed(l)),
        Cc::G => format!("({} > 0)", signed(l)),
        _ => return None,
    })
}

/// and/or/xor: result-based; CF and OF are cleared.
fn logic_condition(cc: Cc, l: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("({l} == 0)"),
        Cc::Nz => format!("({l} != 0)"),
        Cc::S | Cc::L => format!("({} < 0)", signed(l)),
        Cc::Ns | Cc::Ge => format!("({} >= 0)", signed(l)),
        Cc::Le => format!("({} <= 0)", signed(l)),
        Cc::G => format!("({} > 0)", signed(l)),
        Cc::B | Cc::Be => "0".to_owned(),
        Cc::Ae | Cc::A => "1".to_owned(),
        Cc::O | Cc::No | Cc::P | Cc::Np => return None,
    })
}

/// Plain result-sign/zero conditions (inc, dec, shifts, adc, sbb, ...).
fn result_condition(cc: Cc, l: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("({l} == 0)"),
        Cc::Nz => format!("({l} != 0)"),
        Cc::S => format!("({} < 0)", signed(l)),
        Cc::Ns => format!("({} >= 0)", signed(l)),
        Cc::L => format!("({} < 0)", signed(l)),
        Cc::Ge => format!("({} >= 0)", signed(l)),
        Cc::Le => format!("({} <= 0)", signed(l)),
        Cc::G => format!("({} > 0)", signed(l)),
        _ => return None,
    })
}

/// `neg a`: result is `-a_orig`; CF is set unless the original was zero.
fn neg_condition(cc: Cc, l: &str) -> Option<String> {
    Some(match cc {
        Cc::Z => format!("({l} == 0)"),
        Cc::Nz => format!("({l} != 0)"),
        Cc::B => format!("({l} != 0)"),
        Cc::Ae => format!("({l} == 0)"),
        Cc::S => format!("({} < 0)", signed(l)),
        Cc::Ns => format!("({} >= 0)", signed(l)),
        Cc::L => format!("({} < 0)", signed(l)),
        Cc::Ge => format!("({} >= 0)", signed(l)),
        Cc::Le => format!("({} <= 0)", signed(l)),
        Cc::G => format!("({} > 0)", signed(l)),
        _ => return None,
    })
}

/// Conditions after an FPU compare read `_fpu_cmp` (-1 / 0 / +1).
fn fpu_condition(cc: Cc, setter: &Mnemonic) -> Option<String> {
    let op = match cc {
        Cc::A => ">",
        Cc::Ae => ">=",
        Cc::B => "<",
        Cc::Be => "<=",
        Cc::Z => "==",
        Cc::Nz => "!=",
        Cc::P => return Some("0 /* fpu: unordered */".to_owned()),
        Cc::Np => return Some("1 /* fpu: ordered */".to_owned()),
        _ => return None,
    };
    Some(format!("(_fpu_cmp {op} 0) /* {} */", setter.name()))
}

/// comiss/ucomiss compare floats into the unsigned condition codes.
fn float_condition(cc: Cc, a: &str, b: &str) -> Option<String> {
    Some(match cc {
        Cc::A => format!("({a} > {b})"),
        Cc::Ae => format!("({a} >= {b})"),
        Cc::B => format!("({a} < {b})"),
        Cc::Be => format!("({a} <= {b})"),
        Cc::Z => format!("({a} == {b})"),
        Cc::Nz => format!("({a} != {b})"),
        Cc::P => "0 /* unordered (NaN) */".to_owned(),
        Cc::Np => "1 /* ordered */".to_owned(),
        _ => return None,
    })
}

/// Advance the flag state across one lifted instruction.
pub fn advance(state: Option<FlagState>, insn: &Instr) -> Option<FlagState> {
    match flag_effect(insn) {
        FlagEffect::Sets => Some(FlagState::of(insn)),
        FlagEffect::Preserves => state,
        FlagEffect::Destroys => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use i386::Reg;

    fn state(setter: Mnemonic, ops: Vec<Operand>) -> FlagState {
        FlagState { setter, ops }
    }

    #[test]
    fn it_lowers_cmp_conditions() {
        let s = state(
            Mnemonic::Cmp,
            vec![Operand::Register(Reg::EAX), Operand::Imm32(0x10)],
        );
        assert_eq!(condition(Cc::Z, &s).unwrap(), "CMP_EQ(eax, 0x10)");
        assert_eq!(condition(Cc::B, &s).unwrap(), "CMP_B(eax, 0x10)");
        assert_eq!(condition(Cc::L, &s).unwrap(), "CMP_L(eax, 0x10)");
        assert!(condition(Cc::P, &s).is_none());
    }

    #[test]
    fn it_lowers_test_conditions() {
        let s = state(
            Mnemonic::Test,
            vec![Operand::Register(Reg::EAX), Operand::Register(Reg::EAX)],
        );
        assert_eq!(condition(Cc::Z, &s).unwrap(), "TEST_Z(eax, eax)");
        assert_eq!(condition(Cc::S, &s).unwrap(), "TEST_S(eax, eax)");
        assert_eq!(condition(Cc::B, &s).unwrap(), "0");
    }

    #[test]
    fn it_reconstructs_sub_order() {
        let s = state(
            Mnemonic::Sub,
            vec![Operand::Register(Reg::EAX), Operand::Register(Reg::ECX)],
        );
        assert_eq!(
            condition(Cc::B, &s).unwrap(),
            "CMP_B((uint32_t)eax + (uint32_t)ecx, (uint32_t)ecx)"
        );
        assert_eq!(condition(Cc::Z, &s).unwrap(), "(eax == 0)");
    }

    #[test]
    fn it_reads_the_tested_bit() {
        let s = state(
            Mnemonic::Bt,
            vec![Operand::Register(Reg::EAX), Operand::Imm32(3)],
        );
        assert_eq!(condition(Cc::B, &s).unwrap(), "((eax >> (3 & 31)) & 1)");
    }

    #[test]
    fn it_uses_fpu_cmp_after_fpu_compares() {
        let s = state(Mnemonic::Fcomip, vec![]);
        assert_eq!(
            condition(Cc::A, &s).unwrap(),
            "(_fpu_cmp > 0) /* fcomip */"
        );
    }

    #[test]
    fn it_compares_floats_directly_after_comiss() {
        let s = state(
            Mnemonic::Comiss,
            vec![
                Operand::Register(Reg::Xmm(0)),
                Operand::Register(Reg::Xmm(1)),
            ],
        );
        assert_eq!(condition(Cc::A, &s).unwrap(), "(xmm0 > xmm1)");
        assert_eq!(condition(Cc::P, &s).unwrap(), "0 /* unordered (NaN) */");
    }

    #[test]
    fn it_tracks_flag_effects() {
        let mut ip = 0;
        let mov = Instr::decode_one(&[0x8B, 0xC1], &mut ip, 0).unwrap();
        assert_eq!(flag_effect(&mov), FlagEffect::Preserves);

        let mut ip = 0;
        let cmp = Instr::decode_one(&[0x3B, 0xC1], &mut ip, 0).unwrap();
        assert_eq!(flag_effect(&cmp), FlagEffect::Sets);

        let mut ip = 0;
        let div = Instr::decode_one(&[0xF7, 0xF1], &mut ip, 0).unwrap();
        assert_eq!(flag_effect(&div), FlagEffect::Destroys);

        let state0 = advance(None, &cmp);
        assert!(state0.is_some());
        let state1 = advance(state0, &mov);
        assert!(state1.is_some());
        let state2 = advance(state1, &div);
        assert!(state2.is_none());
    }
}
