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
use lazy_static::lazy_static;
use std::{collections::{HashMap, HashSet}, fmt};

// Specifies where to find the operand.
#[derive(Clone, Copy, Debug)]
pub enum AddressingMethod {
    // A ModR/M byte follows the opcode and selects a general register or a
    // memory address (base + index*scale + displacement).
    E,

    // The reg field of the ModR/M byte selects a general register.
    G,

    // Immediate data encoded in subsequent instruction bytes.
    I,

    // A relative offset added to the address of the next instruction
    // (JMP rel, CALL rel, Jcc rel).
    J,

    // The ModR/M byte may refer only to memory (LEA).
    M,

    // No ModR/M; the operand offset is coded as a dword in the
    // instruction (MOV A0-A3).
    O,

    // Memory addressed by DS:ESI (MOVS, CMPS, LODS).
    X,

    // Memory addressed by ES:EDI (MOVS, STOS, SCAS, CMPS).
    Y,

    // No ModR/M; the low three opcode bits select a general register.
    Z,

    // The reg field of the ModR/M byte selects an XMM register.
    V,

    // The r/m field of the ModR/M byte selects an XMM register or memory.
    W,

    // The reg field of the ModR/M byte selects an MMX register.
    P,

    // The r/m field of the ModR/M byte selects an MMX register or memory.
    Q,

    // Implicit register or constant; the OperandType names it.
    Imp,
}

// Specifies the operand size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types)]
pub enum OperandType {
    // Byte, regardless of operand-size attribute.
    b,

    // Byte, sign-extended to the destination size.
    bs,

    // Word, regardless of operand-size attribute.
    w,

    // Word or doubleword, depending on the operand-size prefix.
    v,

    // Word or doubleword, sign extended (PUSH 68).
    vs,

    // Doubleword.
    d,

    // Quadword (MMX / movq).
    q,

    // Scalar single-precision float (4 bytes).
    ss,

    // Scalar double-precision float (8 bytes).
    sd,

    // Packed single-precision floats (16 bytes).
    ps,

    // Implicit registers.
    eAX,
    AL,
    CL,

    // Implicit constant one (shift by 1 forms).
    const1,
}

#[derive(Clone, Copy, Debug)]
pub struct OperandDef {
    pub method: AddressingMethod,
    pub ty: OperandType,
}

macro_rules! make_operand {
    ($meth0:ident / $type0:ident) => {
        OperandDef {
            method: AddressingMethod::$meth0,
            ty: OperandType::$type0,
        }
    };
}

/// Condition codes carried by Jcc / SETcc / CMOVcc.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Cc {
    O,
    No,
    B,
    Ae,
    Z,
    Nz,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cc {
    pub fn from_low_nibble(n: u8) -> Cc {
        match n & 0xF {
            0x0 => Cc::O,
            0x1 => Cc::No,
            0x2 => Cc::B,
            0x3 => Cc::Ae,
            0x4 => Cc::Z,
            0x5 => Cc::Nz,
            0x6 => Cc::Be,
            0x7 => Cc::A,
            0x8 => Cc::S,
            0x9 => Cc::Ns,
            0xA => Cc::P,
            0xB => Cc::Np,
            0xC => Cc::L,
            0xD => Cc::Ge,
            0xE => Cc::Le,
            _ => Cc::G,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Cc::O => "o",
            Cc::No => "no",
            Cc::B => "b",
            Cc::Ae => "ae",
            Cc::Z => "z",
            Cc::Nz => "nz",
            Cc::Be => "be",
            Cc::A => "a",
            Cc::S => "s",
            Cc::Ns => "ns",
            Cc::P => "p",
            Cc::Np => "np",
            Cc::L => "l",
            Cc::Ge => "ge",
            Cc::Le => "le",
            Cc::G => "g",
        }
    }
}

/// Element width for the string-operation family.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[inline]
    pub fn bytes(&self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            Width::Byte => "b",
            Width::Word => "w",
            Width::Dword => "d",
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Mnemonic {
    // Data movement
    Mov,
    MovZx,
    MovSx,
    Lea,
    Xchg,
    Bswap,
    Push,
    Pop,
    PushAll,
    PopAll,
    Pushfd,
    Popfd,

    // Integer ALU
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    IMul,
    Mul,
    Div,
    IDiv,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shld,
    Shrd,
    Bt,
    Bts,
    Btr,
    Btc,
    Bsf,
    Bsr,
    Cmpxchg,
    Xadd,

    // Control flow
    Call,
    Ret,
    Jmp,
    Jcc(Cc),
    Jecxz,
    Loop,
    Loope,
    Loopne,
    Setcc(Cc),
    Cmovcc(Cc),

    // Conversions and misc
    Cdq,
    Cwde,
    Cbw,
    Leave,
    Nop,
    Int3,
    Int,
    Hlt,
    Wait,
    Clc,
    Stc,
    Cld,
    Std,
    Cli,
    Sti,
    Sahf,
    Lahf,
    Cpuid,
    Rdtsc,

    // String operations (rep prefixes ride on the instruction).
    Movs(Width),
    Stos(Width),
    Lods(Width),
    Scas(Width),
    Cmps(Width),

    // x87
    Fld,
    Fst,
    Fstp,
    Fild,
    Fist,
    Fistp,
    Fld1,
    Fldz,
    Fldpi,
    Fldcw,
    Fnstcw,
    Fnstsw,
    Fadd,
    Faddp,
    Fiadd,
    Fsub,
    Fsubp,
    Fisub,
    Fsubr,
    Fsubrp,
    Fisubr,
    Fmul,
    Fmulp,
    Fimul,
    Fdiv,
    Fdivp,
    Fidiv,
    Fdivr,
    Fdivrp,
    Fidivr,
    Fchs,
    Fabs,
    Fsqrt,
    Fsin,
    Fcos,
    Fsincos,
    Fptan,
    Fpatan,
    F2xm1,
    Fyl2x,
    Fprem,
    Fprem1,
    Frndint,
    Fscale,
    Ftst,
    Fcom,
    Fcomp,
    Fcompp,
    Fucom,
    Fucomp,
    Fucompp,
    Fcomi,
    Fcomip,
    Fucomi,
    Fucomip,
    Fxch,
    Ffree,
    Fincstp,
    Fdecstp,
    Fninit,
    Fnclex,
    Fnop,

    // SSE scalar
    Movss,
    MovsdSse,
    Movaps,
    Movups,
    Movapd,
    Movupd,
    Movlps,
    Movhps,
    Movd,
    MovqSse,
    Addss,
    Subss,
    Mulss,
    Divss,
    Sqrtss,
    Minss,
    Maxss,
    Rsqrtss,
    Rcpss,
    Addsd,
    Subsd,
    Mulsd,
    Divsd,
    Sqrtsd,
    Minsd,
    Maxsd,
    Comiss,
    Comisd,
    Ucomiss,
    Ucomisd,
    Cvtsi2ss,
    Cvtss2si,
    Cvttss2si,
    Cvtsi2sd,
    Cvtsd2si,
    Cvttsd2si,
    Cvtss2sd,
    Cvtsd2ss,

    // SSE packed / MMX (translated as placeholders downstream)
    Xorps,
    Xorpd,
    Andps,
    Andnps,
    Orps,
    Addps,
    Subps,
    Mulps,
    Divps,
    Minps,
    Maxps,
    Sqrtps,
    Rsqrtps,
    Rcpps,
    Shufps,
    Unpcklps,
    Unpckhps,
    Movmskps,
    MovqMmx,
    Movntq,
    Pand,
    Pandn,
    Por,
    Pxor,
    Pcmpeqd,
    Pcmpgtd,
    Emms,
    Prefetch,
}

impl Mnemonic {
    /// True for the x87 coprocessor family.
    pub fn is_x87(&self) -> bool {
        use Mnemonic::*;
        matches!(
            self,
            Fld | Fst | Fstp | Fild | Fist | Fistp | Fld1 | Fldz | Fldpi | Fldcw | Fnstcw
                | Fnstsw | Fadd | Faddp | Fiadd | Fsub | Fsubp | Fisub | Fsubr | Fsubrp | Fisubr
                | Fmul | Fmulp | Fimul | Fdiv | Fdivp | Fidiv | Fdivr | Fdivrp | Fidivr | Fchs
                | Fabs | Fsqrt | Fsin | Fcos | Fsincos | Fptan | Fpatan | F2xm1 | Fyl2x | Fprem
                | Fprem1 | Frndint | Fscale | Ftst | Fcom | Fcomp | Fcompp | Fucom | Fucomp
                | Fucompp | Fcomi | Fcomip | Fucomi | Fucomip | Fxch | Ffree | Fincstp | Fdecstp
                | Fninit | Fnclex | Fnop
        )
    }

    /// FPU compares that leave a result the conditional family consumes.
    pub fn is_fpu_compare(&self) -> bool {
        use Mnemonic::*;
        matches!(
            self,
            Fcom | Fcomp | Fcompp | Fucom | Fucomp | Fucompp | Fcomi | Fcomip | Fucomi | Fucomip
                | Ftst
        )
    }

    /// FPU compares that write EFLAGS directly (P6 forms).
    pub fn is_fpu_eflags_compare(&self) -> bool {
        use Mnemonic::*;
        matches!(self, Fcomi | Fcomip | Fucomi | Fucomip)
    }

    /// Assembly spelling, used for listings and generated-code comments.
    pub fn name(&self) -> String {
        match self {
            Mnemonic::Jcc(cc) => format!("j{}", cc.suffix()),
            Mnemonic::Setcc(cc) => format!("set{}", cc.suffix()),
            Mnemonic::Cmovcc(cc) => format!("cmov{}", cc.suffix()),
            Mnemonic::Movs(w) => format!("movs{}", w.suffix()),
            Mnemonic::Stos(w) => format!("stos{}", w.suffix()),
            Mnemonic::Lods(w) => format!("lods{}", w.suffix()),
            Mnemonic::Scas(w) => format!("scas{}", w.suffix()),
            Mnemonic::Cmps(w) => format!("cmps{}", w.suffix()),
            Mnemonic::MovsdSse => "movsd".to_owned(),
            Mnemonic::MovqSse | Mnemonic::MovqMmx => "movq".to_owned(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Debug)]
pub struct OpCodeDef {
    pub mnemonic: Mnemonic,
    pub operands: Vec<OperandDef>,
}

macro_rules! make_op {
    ($meme:expr ; $( $meth0:ident / $type0:ident ),* ) => {
        OpCodeDef {
            mnemonic: $meme,
            operands: vec![
                $( make_operand!($meth0/$type0) ),*
            ]
        }
    };
}

use Mnemonic::*;

lazy_static! {
    pub static ref PREFIX_CODES: HashSet<u8> = {
        [0x26u8, 0x2Eu8, 0x36u8, 0x3Eu8, 0x64u8, 0x65u8, 0x66u8, 0x67u8, 0xF0u8, 0xF2u8, 0xF3u8]
            .iter()
            .cloned()
            .collect()
    };

    // Opcodes whose ModR/M reg field selects the operation.
    pub static ref USE_REG_OPCODES: HashSet<u16> = {
        [0x80u16, 0x81, 0x82, 0x83, 0x8F, 0xC0, 0xC1, 0xC6, 0xC7, 0xD0, 0xD1, 0xD2, 0xD3,
         0xF6, 0xF7, 0xFE, 0xFF, 0x0F18, 0x0FBA]
            .iter()
            .cloned()
            .collect()
    };

    // Opcodes embedding a register number in their low three bits.
    pub static ref HAS_INLINE_REG: HashSet<u16> = {
        [0x40u16, 0x48, 0x50, 0x58, 0xB0, 0xB8, 0x0FC8]
            .iter()
            .cloned()
            .collect()
    };

    #[cfg_attr(rustfmt, rustfmt_skip)]
    pub static ref OPCODES: HashMap<(u16, u8), OpCodeDef> = {
        let mut out: HashMap<(u16, u8), OpCodeDef> = HashMap::new();
        let ops = [
            (0x00u16, 0u8, make_op!(Add;     E/b, G/b)),
            (0x01, 0, make_op!(Add;     E/v, G/v)),
            (0x02, 0, make_op!(Add;     G/b, E/b)),
            (0x03, 0, make_op!(Add;     G/v, E/v)),
            (0x04, 0, make_op!(Add;     Imp/AL, I/b)),
            (0x05, 0, make_op!(Add;     Imp/eAX, I/v)),
            (0x08, 0, make_op!(Or;      E/b, G/b)),
            (0x09, 0, make_op!(Or;      E/v, G/v)),
            (0x0A, 0, make_op!(Or;      G/b, E/b)),
            (0x0B, 0, make_op!(Or;      G/v, E/v)),
            (0x0C, 0, make_op!(Or;      Imp/AL, I/b)),
            (0x0D, 0, make_op!(Or;      Imp/eAX, I/v)),
            (0x10, 0, make_op!(Adc;     E/b, G/b)),
            (0x11, 0, make_op!(Adc;     E/v, G/v)),
            (0x12, 0, make_op!(Adc;     G/b, E/b)),
            (0x13, 0, make_op!(Adc;     G/v, E/v)),
            (0x14, 0, make_op!(Adc;     Imp/AL, I/b)),
            (0x15, 0, make_op!(Adc;     Imp/eAX, I/v)),
            (0x18, 0, make_op!(Sbb;     E/b, G/b)),
            (0x19, 0, make_op!(Sbb;     E/v, G/v)),
            (0x1A, 0, make_op!(Sbb;     G/b, E/b)),
            (0x1B, 0, make_op!(Sbb;     G/v, E/v)),
            (0x1C, 0, make_op!(Sbb;     Imp/AL, I/b)),
            (0x1D, 0, make_op!(Sbb;     Imp/eAX, I/v)),
            (0x20, 0, make_op!(And;     E/b, G/b)),
            (0x21, 0, make_op!(And;     E/v, G/v)),
            (0x22, 0, make_op!(And;     G/b, E/b)),
            (0x23, 0, make_op!(And;     G/v, E/v)),
            (0x24, 0, make_op!(And;     Imp/AL, I/b)),
            (0x25, 0, make_op!(And;     Imp/eAX, I/v)),
            (0x28, 0, make_op!(Sub;     E/b, G/b)),
            (0x29, 0, make_op!(Sub;     E/v, G/v)),
            (0x2A, 0, make_op!(Sub;     G/b, E/b)),
            (0x2B, 0, make_op!(Sub;     G/v, E/v)),
            (0x2C, 0, make_op!(Sub;     Imp/AL, I/b)),
            (0x2D, 0, make_op!(Sub;     Imp/eAX, I/v)),
            (0x30, 0, make_op!(Xor;     E/b, G/b)),
            (0x31, 0, make_op!(Xor;     E/v, G/v)),
            (0x32, 0, make_op!(Xor;     G/b, E/b)),
            (0x33, 0, make_op!(Xor;     G/v, E/v)),
            (0x34, 0, make_op!(Xor;     Imp/AL, I/b)),
            (0x35, 0, make_op!(Xor;     Imp/eAX, I/v)),
            (0x38, 0, make_op!(Cmp;     E/b, G/b)),
            (0x39, 0, make_op!(Cmp;     E/v, G/v)),
            (0x3A, 0, make_op!(Cmp;     G/b, E/b)),
            (0x3B, 0, make_op!(Cmp;     G/v, E/v)),
            (0x3C, 0, make_op!(Cmp;     Imp/AL, I/b)),
            (0x3D, 0, make_op!(Cmp;     Imp/eAX, I/v)),
            (0x40, 0, make_op!(Inc;     Z/v)),
            (0x48, 0, make_op!(Dec;     Z/v)),
            (0x50, 0, make_op!(Push;    Z/v)),
            (0x58, 0, make_op!(Pop;     Z/v)),
            (0x60, 0, make_op!(PushAll;)),
            (0x61, 0, make_op!(PopAll;)),
            (0x68, 0, make_op!(Push;    I/vs)),
            (0x69, 0, make_op!(IMul;    G/v, E/v, I/v)),
            (0x6A, 0, make_op!(Push;    I/bs)),
            (0x6B, 0, make_op!(IMul;    G/v, E/v, I/bs)),
            (0x84, 0, make_op!(Test;    E/b, G/b)),
            (0x85, 0, make_op!(Test;    E/v, G/v)),
            (0x86, 0, make_op!(Xchg;    E/b, G/b)),
            (0x87, 0, make_op!(Xchg;    E/v, G/v)),
            (0x88, 0, make_op!(Mov;     E/b, G/b)),
            (0x89, 0, make_op!(Mov;     E/v, G/v)),
            (0x8A, 0, make_op!(Mov;     G/b, E/b)),
            (0x8B, 0, make_op!(Mov;     G/v, E/v)),
            (0x8D, 0, make_op!(Lea;     G/v, M/v)),
            (0x8F, 0, make_op!(Pop;     E/v)),
            (0x90, 0, make_op!(Nop;)),
            (0x91, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x92, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x93, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x94, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x95, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x96, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x97, 0, make_op!(Xchg;    Z/v, Imp/eAX)),
            (0x98, 0, make_op!(Cwde;)),
            (0x99, 0, make_op!(Cdq;)),
            (0x9B, 0, make_op!(Wait;)),
            (0x9C, 0, make_op!(Pushfd;)),
            (0x9D, 0, make_op!(Popfd;)),
            (0x9E, 0, make_op!(Sahf;)),
            (0x9F, 0, make_op!(Lahf;)),
            (0xA0, 0, make_op!(Mov;     Imp/AL, O/b)),
            (0xA1, 0, make_op!(Mov;     Imp/eAX, O/v)),
            (0xA2, 0, make_op!(Mov;     O/b, Imp/AL)),
            (0xA3, 0, make_op!(Mov;     O/v, Imp/eAX)),
            (0xA8, 0, make_op!(Test;    Imp/AL, I/b)),
            (0xA9, 0, make_op!(Test;    Imp/eAX, I/v)),
            (0xB0, 0, make_op!(Mov;     Z/b, I/b)),
            (0xB8, 0, make_op!(Mov;     Z/v, I/v)),
            (0xC2, 0, make_op!(Ret;     I/w)),
            (0xC3, 0, make_op!(Ret;)),
            (0xC6, 0, make_op!(Mov;     E/b, I/b)),
            (0xC7, 0, make_op!(Mov;     E/v, I/v)),
            (0xC9, 0, make_op!(Leave;)),
            (0xCC, 0, make_op!(Int3;)),
            (0xCD, 0, make_op!(Int;     I/b)),
            (0xE0, 0, make_op!(Loopne;  J/bs)),
            (0xE1, 0, make_op!(Loope;   J/bs)),
            (0xE2, 0, make_op!(Loop;    J/bs)),
            (0xE3, 0, make_op!(Jecxz;   J/bs)),
            (0xE8, 0, make_op!(Call;    J/v)),
            (0xE9, 0, make_op!(Jmp;     J/v)),
            (0xEB, 0, make_op!(Jmp;     J/bs)),
            (0xF4, 0, make_op!(Hlt;)),
            (0xF8, 0, make_op!(Clc;)),
            (0xF9, 0, make_op!(Stc;)),
            (0xFA, 0, make_op!(Cli;)),
            (0xFB, 0, make_op!(Sti;)),
            (0xFC, 0, make_op!(Cld;)),
            (0xFD, 0, make_op!(Std;)),

            // Group 1: 80/81/82/83 with the operation in the reg field.
            (0x80, 0, make_op!(Add;     E/b, I/b)),
            (0x80, 1, make_op!(Or;      E/b, I/b)),
            (0x80, 2, make_op!(Adc;     E/b, I/b)),
            (0x80, 3, make_op!(Sbb;     E/b, I/b)),
            (0x80, 4, make_op!(And;     E/b, I/b)),
            (0x80, 5, make_op!(Sub;     E/b, I/b)),
            (0x80, 6, make_op!(Xor;     E/b, I/b)),
            (0x80, 7, make_op!(Cmp;     E/b, I/b)),
            (0x81, 0, make_op!(Add;     E/v, I/v)),
            (0x81, 1, make_op!(Or;      E/v, I/v)),
            (0x81, 2, make_op!(Adc;     E/v, I/v)),
            (0x81, 3, make_op!(Sbb;     E/v, I/v)),
            (0x81, 4, make_op!(And;     E/v, I/v)),
            (0x81, 5, make_op!(Sub;     E/v, I/v)),
            (0x81, 6, make_op!(Xor;     E/v, I/v)),
            (0x81, 7, make_op!(Cmp;     E/v, I/v)),
            (0x82, 0, make_op!(Add;     E/b, I/b)),
            (0x83, 0, make_op!(Add;     E/v, I/bs)),
            (0x83, 1, make_op!(Or;      E/v, I/bs)),
            (0x83, 2, make_op!(Adc;     E/v, I/bs)),
            (0x83, 3, make_op!(Sbb;     E/v, I/bs)),
            (0x83, 4, make_op!(And;     E/v, I/bs)),
            (0x83, 5, make_op!(Sub;     E/v, I/bs)),
            (0x83, 6, make_op!(Xor;     E/v, I/bs)),
            (0x83, 7, make_op!(Cmp;     E/v, I/bs)),

            // Group 2: shifts and rotates.
            (0xC0, 0, make_op!(Rol;     E/b, I/b)),
            (0xC0, 1, make_op!(Ror;     E/b, I/b)),
            (0xC0, 2, make_op!(Rcl;     E/b, I/b)),
            (0xC0, 3, make_op!(Rcr;     E/b, I/b)),
            (0xC0, 4, make_op!(Shl;     E/b, I/b)),
            (0xC0, 5, make_op!(Shr;     E/b, I/b)),
            (0xC0, 6, make_op!(Shl;     E/b, I/b)),
            (0xC0, 7, make_op!(Sar;     E/b, I/b)),
            (0xC1, 0, make_op!(Rol;     E/v, I/b)),
            (0xC1, 1, make_op!(Ror;     E/v, I/b)),
            (0xC1, 2, make_op!(Rcl;     E/v, I/b)),
            (0xC1, 3, make_op!(Rcr;     E/v, I/b)),
            (0xC1, 4, make_op!(Shl;     E/v, I/b)),
            (0xC1, 5, make_op!(Shr;     E/v, I/b)),
            (0xC1, 6, make_op!(Shl;     E/v, I/b)),
            (0xC1, 7, make_op!(Sar;     E/v, I/b)),
            (0xD0, 0, make_op!(Rol;     E/b, Imp/const1)),
            (0xD0, 1, make_op!(Ror;     E/b, Imp/const1)),
            (0xD0, 2, make_op!(Rcl;     E/b, Imp/const1)),
            (0xD0, 3, make_op!(Rcr;     E/b, Imp/const1)),
            (0xD0, 4, make_op!(Shl;     E/b, Imp/const1)),
            (0xD0, 5, make_op!(Shr;     E/b, Imp/const1)),
            (0xD0, 7, make_op!(Sar;     E/b, Imp/const1)),
            (0xD1, 0, make_op!(Rol;     E/v, Imp/const1)),
            (0xD1, 1, make_op!(Ror;     E/v, Imp/const1)),
            (0xD1, 2, make_op!(Rcl;     E/v, Imp/const1)),
            (0xD1, 3, make_op!(Rcr;     E/v, Imp/const1)),
            (0xD1, 4, make_op!(Shl;     E/v, Imp/const1)),
            (0xD1, 5, make_op!(Shr;     E/v, Imp/const1)),
            (0xD1, 7, make_op!(Sar;     E/v, Imp/const1)),
            (0xD2, 0, make_op!(Rol;     E/b, Imp/CL)),
            (0xD2, 1, make_op!(Ror;     E/b, Imp/CL)),
            (0xD2, 4, make_op!(Shl;     E/b, Imp/CL)),
            (0xD2, 5, make_op!(Shr;     E/b, Imp/CL)),
            (0xD2, 7, make_op!(Sar;     E/b, Imp/CL)),
            (0xD3, 0, make_op!(Rol;     E/v, Imp/CL)),
            (0xD3, 1, make_op!(Ror;     E/v, Imp/CL)),
            (0xD3, 2, make_op!(Rcl;     E/v, Imp/CL)),
            (0xD3, 3, make_op!(Rcr;     E/v, Imp/CL)),
            (0xD3, 4, make_op!(Shl;     E/v, Imp/CL)),
            (0xD3, 5, make_op!(Shr;     E/v, Imp/CL)),
            (0xD3, 7, make_op!(Sar;     E/v, Imp/CL)),

            // Group 3.
            (0xF6, 0, make_op!(Test;    E/b, I/b)),
            (0xF6, 2, make_op!(Not;     E/b)),
            (0xF6, 3, make_op!(Neg;     E/b)),
            (0xF6, 4, make_op!(Mul;     E/b)),
            (0xF6, 5, make_op!(IMul;    E/b)),
            (0xF6, 6, make_op!(Div;     E/b)),
            (0xF6, 7, make_op!(IDiv;    E/b)),
            (0xF7, 0, make_op!(Test;    E/v, I/v)),
            (0xF7, 2, make_op!(Not;     E/v)),
            (0xF7, 3, make_op!(Neg;     E/v)),
            (0xF7, 4, make_op!(Mul;     E/v)),
            (0xF7, 5, make_op!(IMul;    E/v)),
            (0xF7, 6, make_op!(Div;     E/v)),
            (0xF7, 7, make_op!(IDiv;    E/v)),

            // Group 4/5.
            (0xFE, 0, make_op!(Inc;     E/b)),
            (0xFE, 1, make_op!(Dec;     E/b)),
            (0xFF, 0, make_op!(Inc;     E/v)),
            (0xFF, 1, make_op!(Dec;     E/v)),
            (0xFF, 2, make_op!(Call;    E/v)),
            (0xFF, 3, make_op!(Call;    E/v)),
            (0xFF, 4, make_op!(Jmp;     E/v)),
            (0xFF, 5, make_op!(Jmp;     E/v)),
            (0xFF, 6, make_op!(Push;    E/v)),

            // String family.
            (0xA4, 0, make_op!(Movs(Width::Byte);  Y/b, X/b)),
            (0xA5, 0, make_op!(Movs(Width::Dword); Y/v, X/v)),
            (0xA6, 0, make_op!(Cmps(Width::Byte);  X/b, Y/b)),
            (0xA7, 0, make_op!(Cmps(Width::Dword); X/v, Y/v)),
            (0xAA, 0, make_op!(Stos(Width::Byte);  Y/b)),
            (0xAB, 0, make_op!(Stos(Width::Dword); Y/v)),
            (0xAC, 0, make_op!(Lods(Width::Byte);  X/b)),
            (0xAD, 0, make_op!(Lods(Width::Dword); X/v)),
            (0xAE, 0, make_op!(Scas(Width::Byte);  Y/b)),
            (0xAF, 0, make_op!(Scas(Width::Dword); Y/v)),

            // Short-form conditional jumps.
            (0x70, 0, make_op!(Jcc(Cc::O);  J/bs)),
            (0x71, 0, make_op!(Jcc(Cc::No); J/bs)),
            (0x72, 0, make_op!(Jcc(Cc::B);  J/bs)),
            (0x73, 0, make_op!(Jcc(Cc::Ae); J/bs)),
            (0x74, 0, make_op!(Jcc(Cc::Z);  J/bs)),
            (0x75, 0, make_op!(Jcc(Cc::Nz); J/bs)),
            (0x76, 0, make_op!(Jcc(Cc::Be); J/bs)),
            (0x77, 0, make_op!(Jcc(Cc::A);  J/bs)),
            (0x78, 0, make_op!(Jcc(Cc::S);  J/bs)),
            (0x79, 0, make_op!(Jcc(Cc::Ns); J/bs)),
            (0x7A, 0, make_op!(Jcc(Cc::P);  J/bs)),
            (0x7B, 0, make_op!(Jcc(Cc::Np); J/bs)),
            (0x7C, 0, make_op!(Jcc(Cc::L);  J/bs)),
            (0x7D, 0, make_op!(Jcc(Cc::Ge); J/bs)),
            (0x7E, 0, make_op!(Jcc(Cc::Le); J/bs)),
            (0x7F, 0, make_op!(Jcc(Cc::G);  J/bs)),

            // 0F-escape: system and extended ops.
            (0x0F31, 0, make_op!(Rdtsc;)),
            (0x0FA2, 0, make_op!(Cpuid;)),
            (0x0F18, 0, make_op!(Prefetch; E/b)),
            (0x0F18, 1, make_op!(Prefetch; E/b)),
            (0x0F18, 2, make_op!(Prefetch; E/b)),
            (0x0F18, 3, make_op!(Prefetch; E/b)),
            (0x0FA3, 0, make_op!(Bt;      E/v, G/v)),
            (0x0FA4, 0, make_op!(Shld;    E/v, G/v, I/b)),
            (0x0FA5, 0, make_op!(Shld;    E/v, G/v, Imp/CL)),
            (0x0FAB, 0, make_op!(Bts;     E/v, G/v)),
            (0x0FAC, 0, make_op!(Shrd;    E/v, G/v, I/b)),
            (0x0FAD, 0, make_op!(Shrd;    E/v, G/v, Imp/CL)),
            (0x0FAF, 0, make_op!(IMul;    G/v, E/v)),
            (0x0FB0, 0, make_op!(Cmpxchg; E/b, G/b)),
            (0x0FB1, 0, make_op!(Cmpxchg; E/v, G/v)),
            (0x0FB3, 0, make_op!(Btr;     E/v, G/v)),
            (0x0FB6, 0, make_op!(MovZx;   G/v, E/b)),
            (0x0FB7, 0, make_op!(MovZx;   G/v, E/w)),
            (0x0FBB, 0, make_op!(Btc;     E/v, G/v)),
            (0x0FBA, 4, make_op!(Bt;      E/v, I/b)),
            (0x0FBA, 5, make_op!(Bts;     E/v, I/b)),
            (0x0FBA, 6, make_op!(Btr;     E/v, I/b)),
            (0x0FBA, 7, make_op!(Btc;     E/v, I/b)),
            (0x0FBC, 0, make_op!(Bsf;     G/v, E/v)),
            (0x0FBD, 0, make_op!(Bsr;     G/v, E/v)),
            (0x0FBE, 0, make_op!(MovSx;   G/v, E/b)),
            (0x0FBF, 0, make_op!(MovSx;   G/v, E/w)),
            (0x0FC0, 0, make_op!(Xadd;    E/b, G/b)),
            (0x0FC1, 0, make_op!(Xadd;    E/v, G/v)),
            (0x0FC8, 0, make_op!(Bswap;   Z/v)),
            (0x0F77, 0, make_op!(Emms;)),
        ];
        for (op, ext, def) in ops.iter() {
            out.insert((*op, *ext), def.clone());
        }

        // Near-form conditional jumps, SETcc, and CMOVcc share their
        // condition code with the opcode's low nibble.
        for n in 0x0u8..=0xF {
            let cc = Cc::from_low_nibble(n);
            out.insert((0x0F80 + n as u16, 0), make_op!(Jcc(cc); J/v));
            out.insert((0x0F90 + n as u16, 0), make_op!(Setcc(cc); E/b));
            out.insert((0x0F40 + n as u16, 0), make_op!(Cmovcc(cc); G/v, E/v));
        }

        out
    };
}

/// SSE / MMX two-byte opcodes, keyed by `(mandatory prefix, second byte)`.
/// Prefix discriminant: 0 = none, 1 = 0x66, 2 = 0xF3, 3 = 0xF2.
pub const SSE_PREFIX_NONE: u8 = 0;
pub const SSE_PREFIX_66: u8 = 1;
pub const SSE_PREFIX_F3: u8 = 2;
pub const SSE_PREFIX_F2: u8 = 3;

lazy_static! {
    #[cfg_attr(rustfmt, rustfmt_skip)]
    pub static ref SSE_OPCODES: HashMap<(u8, u8), OpCodeDef> = {
        let mut out: HashMap<(u8, u8), OpCodeDef> = HashMap::new();
        let ops = [
            // Moves.
            (SSE_PREFIX_NONE, 0x10u8, make_op!(Movups;  V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x11, make_op!(Movups;  W/ps, V/ps)),
            (SSE_PREFIX_66,   0x10, make_op!(Movupd;  V/ps, W/ps)),
            (SSE_PREFIX_66,   0x11, make_op!(Movupd;  W/ps, V/ps)),
            (SSE_PREFIX_F3,   0x10, make_op!(Movss;   V/ss, W/ss)),
            (SSE_PREFIX_F3,   0x11, make_op!(Movss;   W/ss, V/ss)),
            (SSE_PREFIX_F2,   0x10, make_op!(MovsdSse; V/sd, W/sd)),
            (SSE_PREFIX_F2,   0x11, make_op!(MovsdSse; W/sd, V/sd)),
            (SSE_PREFIX_NONE, 0x12, make_op!(Movlps;  V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x13, make_op!(Movlps;  W/sd, V/sd)),
            (SSE_PREFIX_NONE, 0x16, make_op!(Movhps;  V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x17, make_op!(Movhps;  W/sd, V/sd)),
            (SSE_PREFIX_NONE, 0x14, make_op!(Unpcklps; V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x15, make_op!(Unpckhps; V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x28, make_op!(Movaps;  V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x29, make_op!(Movaps;  W/ps, V/ps)),
            (SSE_PREFIX_66,   0x28, make_op!(Movapd;  V/ps, W/ps)),
            (SSE_PREFIX_66,   0x29, make_op!(Movapd;  W/ps, V/ps)),

            // Conversions.
            (SSE_PREFIX_F3,   0x2A, make_op!(Cvtsi2ss;  V/ss, E/v)),
            (SSE_PREFIX_F2,   0x2A, make_op!(Cvtsi2sd;  V/sd, E/v)),
            (SSE_PREFIX_F3,   0x2C, make_op!(Cvttss2si; G/v, W/ss)),
            (SSE_PREFIX_F2,   0x2C, make_op!(Cvttsd2si; G/v, W/sd)),
            (SSE_PREFIX_F3,   0x2D, make_op!(Cvtss2si;  G/v, W/ss)),
            (SSE_PREFIX_F2,   0x2D, make_op!(Cvtsd2si;  G/v, W/sd)),
            (SSE_PREFIX_F3,   0x5A, make_op!(Cvtss2sd;  V/sd, W/ss)),
            (SSE_PREFIX_F2,   0x5A, make_op!(Cvtsd2ss;  V/ss, W/sd)),

            // Compares.
            (SSE_PREFIX_NONE, 0x2E, make_op!(Ucomiss; V/ss, W/ss)),
            (SSE_PREFIX_66,   0x2E, make_op!(Ucomisd; V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x2F, make_op!(Comiss;  V/ss, W/ss)),
            (SSE_PREFIX_66,   0x2F, make_op!(Comisd;  V/sd, W/sd)),

            // Scalar and packed arithmetic.
            (SSE_PREFIX_NONE, 0x51, make_op!(Sqrtps;  V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x51, make_op!(Sqrtss;  V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x51, make_op!(Sqrtsd;  V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x52, make_op!(Rsqrtps; V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x52, make_op!(Rsqrtss; V/ss, W/ss)),
            (SSE_PREFIX_NONE, 0x53, make_op!(Rcpps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x53, make_op!(Rcpss;   V/ss, W/ss)),
            (SSE_PREFIX_NONE, 0x54, make_op!(Andps;   V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x55, make_op!(Andnps;  V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x56, make_op!(Orps;    V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x57, make_op!(Xorps;   V/ps, W/ps)),
            (SSE_PREFIX_66,   0x57, make_op!(Xorpd;   V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x58, make_op!(Addps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x58, make_op!(Addss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x58, make_op!(Addsd;   V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x59, make_op!(Mulps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x59, make_op!(Mulss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x59, make_op!(Mulsd;   V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x5C, make_op!(Subps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x5C, make_op!(Subss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x5C, make_op!(Subsd;   V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x5D, make_op!(Minps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x5D, make_op!(Minss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x5D, make_op!(Minsd;   V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x5E, make_op!(Divps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x5E, make_op!(Divss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x5E, make_op!(Divsd;   V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x5F, make_op!(Maxps;   V/ps, W/ps)),
            (SSE_PREFIX_F3,   0x5F, make_op!(Maxss;   V/ss, W/ss)),
            (SSE_PREFIX_F2,   0x5F, make_op!(Maxsd;   V/sd, W/sd)),

            // Shuffles and masks.
            (SSE_PREFIX_NONE, 0xC6, make_op!(Shufps;  V/ps, W/ps, I/b)),
            (SSE_PREFIX_NONE, 0x50, make_op!(Movmskps; G/v, W/ps)),

            // MMX and integer-SIMD subset the toolchain meets in practice.
            (SSE_PREFIX_NONE, 0x6E, make_op!(Movd;    P/q, E/d)),
            (SSE_PREFIX_66,   0x6E, make_op!(Movd;    V/d, E/d)),
            (SSE_PREFIX_NONE, 0x7E, make_op!(Movd;    E/d, P/q)),
            (SSE_PREFIX_66,   0x7E, make_op!(Movd;    E/d, V/d)),
            (SSE_PREFIX_F3,   0x7E, make_op!(MovqSse; V/sd, W/sd)),
            (SSE_PREFIX_NONE, 0x6F, make_op!(MovqMmx; P/q, Q/q)),
            (SSE_PREFIX_NONE, 0x7F, make_op!(MovqMmx; Q/q, P/q)),
            (SSE_PREFIX_NONE, 0xE7, make_op!(Movntq;  Q/q, P/q)),
            (SSE_PREFIX_NONE, 0xDB, make_op!(Pand;    P/q, Q/q)),
            (SSE_PREFIX_NONE, 0xDF, make_op!(Pandn;   P/q, Q/q)),
            (SSE_PREFIX_NONE, 0xEB, make_op!(Por;     P/q, Q/q)),
            (SSE_PREFIX_NONE, 0xEF, make_op!(Pxor;    P/q, Q/q)),
            (SSE_PREFIX_66,   0xEF, make_op!(Pxor;    V/ps, W/ps)),
            (SSE_PREFIX_NONE, 0x76, make_op!(Pcmpeqd; P/q, Q/q)),
            (SSE_PREFIX_NONE, 0x66, make_op!(Pcmpgtd; P/q, Q/q)),
        ];
        for (prefix, op, def) in ops.iter() {
            out.insert((*prefix, *op), def.clone());
        }
        out
    };
}
