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
use crate::lut::{
    AddressingMethod, Mnemonic, OpCodeDef, OperandDef, OperandType, Width, HAS_INLINE_REG,
    OPCODES, PREFIX_CODES, SSE_OPCODES, SSE_PREFIX_66, SSE_PREFIX_F2, SSE_PREFIX_F3,
    SSE_PREFIX_NONE, USE_REG_OPCODES,
};
use anyhow::{ensure, Result};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown opcode/ext: {op:04X}/{ext}")]
    UnknownOpcode { ip: usize, op: u16, ext: u8 },
    #[error("decode ran off the end of the buffer during {phase}")]
    TooShort { phase: &'static str },
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Reg {
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,

    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,

    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,

    ES,
    CS,
    SS,
    DS,
    FS,
    GS,

    Xmm(u8),
    Mm(u8),
    St(u8),
}

const XMM_NAMES: [&str; 8] = ["xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7"];
const MM_NAMES: [&str; 8] = ["mm0", "mm1", "mm2", "mm3", "mm4", "mm5", "mm6", "mm7"];
const ST_NAMES: [&str; 8] = ["st0", "st1", "st2", "st3", "st4", "st5", "st6", "st7"];

impl Reg {
    pub fn name(&self) -> &'static str {
        match self {
            Reg::AL => "al",
            Reg::CL => "cl",
            Reg::DL => "dl",
            Reg::BL => "bl",
            Reg::AH => "ah",
            Reg::CH => "ch",
            Reg::DH => "dh",
            Reg::BH => "bh",
            Reg::AX => "ax",
            Reg::CX => "cx",
            Reg::DX => "dx",
            Reg::BX => "bx",
            Reg::SP => "sp",
            Reg::BP => "bp",
            Reg::SI => "si",
            Reg::DI => "di",
            Reg::EAX => "eax",
            Reg::ECX => "ecx",
            Reg::EDX => "edx",
            Reg::EBX => "ebx",
            Reg::ESP => "esp",
            Reg::EBP => "ebp",
            Reg::ESI => "esi",
            Reg::EDI => "edi",
            Reg::ES => "es",
            Reg::CS => "cs",
            Reg::SS => "ss",
            Reg::DS => "ds",
            Reg::FS => "fs",
            Reg::GS => "gs",
            Reg::Xmm(i) => XMM_NAMES[(*i & 7) as usize],
            Reg::Mm(i) => MM_NAMES[(*i & 7) as usize],
            Reg::St(i) => ST_NAMES[(*i & 7) as usize],
        }
    }

    pub fn is_gpr32(&self) -> bool {
        matches!(
            self,
            Reg::EAX | Reg::ECX | Reg::EDX | Reg::EBX | Reg::ESP | Reg::EBP | Reg::ESI | Reg::EDI
        )
    }

    pub fn is_reg16(&self) -> bool {
        matches!(
            self,
            Reg::AX | Reg::CX | Reg::DX | Reg::BX | Reg::SP | Reg::BP | Reg::SI | Reg::DI
        )
    }

    pub fn is_low8(&self) -> bool {
        matches!(self, Reg::AL | Reg::CL | Reg::DL | Reg::BL)
    }

    pub fn is_high8(&self) -> bool {
        matches!(self, Reg::AH | Reg::CH | Reg::DH | Reg::BH)
    }

    pub fn is_segment(&self) -> bool {
        matches!(self, Reg::ES | Reg::CS | Reg::SS | Reg::DS | Reg::FS | Reg::GS)
    }

    pub fn is_xmm(&self) -> bool {
        matches!(self, Reg::Xmm(_))
    }

    pub fn is_mmx(&self) -> bool {
        matches!(self, Reg::Mm(_))
    }

    /// The 32-bit register a sub-register aliases, if any.
    pub fn parent32(&self) -> Option<Reg> {
        Some(match self {
            Reg::AL | Reg::AH | Reg::AX | Reg::EAX => Reg::EAX,
            Reg::CL | Reg::CH | Reg::CX | Reg::ECX => Reg::ECX,
            Reg::DL | Reg::DH | Reg::DX | Reg::EDX => Reg::EDX,
            Reg::BL | Reg::BH | Reg::BX | Reg::EBX => Reg::EBX,
            Reg::SP | Reg::ESP => Reg::ESP,
            Reg::BP | Reg::EBP => Reg::EBP,
            Reg::SI | Reg::ESI => Reg::ESI,
            Reg::DI | Reg::EDI => Reg::EDI,
            _ => return None,
        })
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// size @ [base + index*scale + disp]
#[derive(Clone, Debug)]
pub struct MemRef {
    pub displacement: i32,
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub segment: Option<Reg>,
    pub size: u8, // access width in bytes: 1, 2, 4, 8, or 16
}

impl MemRef {
    fn base(base: Reg, size: u8, prefix: &OpPrefix) -> Self {
        MemRef {
            displacement: 0,
            base: Some(base),
            index: None,
            scale: 1,
            segment: prefix.segment,
            size,
        }
    }

    fn base_plus_segment(base: Reg, size: u8, segment: Reg) -> Self {
        MemRef {
            displacement: 0,
            base: Some(base),
            index: None,
            scale: 1,
            segment: Some(segment),
            size,
        }
    }

    fn base_plus_displacement(base: Reg, displacement: i32, size: u8, prefix: &OpPrefix) -> Self {
        MemRef {
            displacement,
            base: Some(base),
            index: None,
            scale: 1,
            segment: prefix.segment,
            size,
        }
    }

    fn displacement(displacement: i32, size: u8, prefix: &OpPrefix) -> Self {
        MemRef {
            displacement,
            base: None,
            index: None,
            scale: 1,
            segment: prefix.segment,
            size,
        }
    }

    fn full(
        scale: u8,
        index: Option<Reg>,
        base: Option<Reg>,
        displacement: i32,
        size: u8,
        prefix: &OpPrefix,
    ) -> Self {
        MemRef {
            displacement,
            base,
            index,
            scale,
            segment: prefix.segment,
            size,
        }
    }

    /// True when the operand is a flat address: no base, no index.
    #[inline]
    pub fn is_flat(&self) -> bool {
        self.base.is_none() && self.index.is_none()
    }

    fn size_for_type(ty: OperandType, state: &OperandDecodeState) -> u8 {
        match ty {
            OperandType::b | OperandType::bs => 1,
            OperandType::w => 2,
            OperandType::v | OperandType::vs => {
                if state.prefix.toggle_operand_size {
                    2
                } else {
                    4
                }
            }
            OperandType::d | OperandType::ss => 4,
            OperandType::q | OperandType::sd => 8,
            OperandType::ps => 16,
            _ => 4,
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let seg = if let Some(r) = self.segment {
            format!("{r}:")
        } else {
            String::new()
        };
        let size = match self.size {
            1 => "byte ptr ",
            2 => "word ptr ",
            8 => "qword ptr ",
            16 => "xmmword ptr ",
            _ => "dword ptr ",
        };
        match (&self.base, &self.index) {
            (Some(base), Some(index)) => write!(
                f,
                "{}{}[{}+{}*{}+0x{:X}]",
                seg, size, base, index, self.scale, self.displacement
            ),
            (Some(base), None) => write!(f, "{}{}[{}+0x{:X}]", seg, size, base, self.displacement),
            (None, Some(index)) => write!(
                f,
                "{}{}[{}*{}+0x{:X}]",
                seg, size, index, self.scale, self.displacement
            ),
            (None, None) => write!(f, "{}{}[0x{:X}]", seg, size, self.displacement as u32),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rep {
    Rep,
    Repne,
}

#[derive(Clone, Debug, Default)]
pub struct OpPrefix {
    pub toggle_address_size: bool,
    pub toggle_operand_size: bool,
    pub segment: Option<Reg>,
    pub rep: Option<Rep>,
    pub lock: bool,
}

impl OpPrefix {
    fn apply(mut self, b: u8) -> Self {
        match b {
            0x26 => self.segment = Some(Reg::ES),
            0x2E => self.segment = Some(Reg::CS),
            0x36 => self.segment = Some(Reg::SS),
            0x3E => self.segment = Some(Reg::DS),
            0x64 => self.segment = Some(Reg::FS),
            0x65 => self.segment = Some(Reg::GS),
            0x66 => self.toggle_operand_size = true,
            0x67 => self.toggle_address_size = true,
            0xF0 => self.lock = true,
            0xF2 => self.rep = Some(Rep::Repne),
            0xF3 => self.rep = Some(Rep::Rep),
            _ => unreachable!("not an op prefix: {}", b),
        }
        self
    }

    fn from_bytes(code: &[u8], ip: &mut usize) -> Self {
        let mut prefix = Self::default();
        while *ip < code.len() && PREFIX_CODES.contains(&code[*ip]) {
            prefix = prefix.apply(code[*ip]);
            *ip += 1;
        }
        prefix
    }

    fn sse_discriminant(&self) -> u8 {
        if self.rep == Some(Rep::Rep) {
            SSE_PREFIX_F3
        } else if self.rep == Some(Rep::Repne) {
            SSE_PREFIX_F2
        } else if self.toggle_operand_size {
            SSE_PREFIX_66
        } else {
            SSE_PREFIX_NONE
        }
    }
}

struct OperandDecodeState {
    prefix: OpPrefix,
    op: u16,
    modrm: Option<u8>,
}

impl OperandDecodeState {
    fn initial(prefix: OpPrefix, op: u16) -> Self {
        Self {
            prefix,
            op,
            modrm: None,
        }
    }

    fn read_modrm(&mut self, code: &[u8], ip: &mut usize) -> Result<(u8, u8, u8)> {
        if let Some(b) = self.modrm {
            return Ok(modrm(b));
        }
        ensure!(
            code.len() > *ip,
            DecodeError::TooShort {
                phase: "read modrm"
            }
        );
        let b = code[*ip];
        *ip += 1;
        self.modrm = Some(b);
        Ok(modrm(b))
    }

    #[allow(clippy::unusual_byte_groupings)]
    fn read_sib(
        &mut self,
        mod_: u8,
        code: &[u8],
        ip: &mut usize,
    ) -> Result<(u8, Option<Reg>, Option<Reg>, bool)> {
        ensure!(code.len() > *ip, DecodeError::TooShort { phase: "read sib" });
        let sib = code[*ip];
        *ip += 1;

        let scale = 1u8 << (sib >> 6);
        let index_bits = (sib & 0b00_111_000) >> 3;
        let base_bits = sib & 0b00_000_111;

        // Index 100b encodes "no index".
        let index = if index_bits == 4 {
            None
        } else {
            Some(register(index_bits))
        };

        // Base 101b with mod 00 means disp32 with no base.
        let (base, disp32_follows) = if base_bits == 5 && mod_ == 0 {
            (None, true)
        } else {
            (Some(register(base_bits)), false)
        };

        Ok((scale, index, base, disp32_follows))
    }
}

#[derive(Clone, Debug)]
pub enum Operand {
    Imm32(u32),
    Imm32s(i32),
    Memory(MemRef),
    Register(Reg),
}

impl Operand {
    fn from_bytes(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
    ) -> Result<Self> {
        match desc.method {
            AddressingMethod::E => Self::mode_e(code, ip, desc, state, RegClass::Gpr),
            AddressingMethod::M => Self::mode_e(code, ip, desc, state, RegClass::Gpr),
            AddressingMethod::W => Self::mode_e(code, ip, desc, state, RegClass::Xmm),
            AddressingMethod::Q => Self::mode_e(code, ip, desc, state, RegClass::Mmx),
            AddressingMethod::G => Self::mode_g(code, ip, desc, state, RegClass::Gpr),
            AddressingMethod::V => Self::mode_g(code, ip, desc, state, RegClass::Xmm),
            AddressingMethod::P => Self::mode_g(code, ip, desc, state, RegClass::Mmx),
            AddressingMethod::I => Self::mode_i(code, ip, desc, state),
            AddressingMethod::J => Self::mode_j(code, ip, desc, state),
            AddressingMethod::O => Self::mode_o(code, ip, desc, state),
            AddressingMethod::X => Self::mode_x(desc, state),
            AddressingMethod::Y => Self::mode_y(desc, state),
            AddressingMethod::Z => Ok(Self::mode_z(desc, state)),
            AddressingMethod::Imp => Self::mode_imp(desc, state),
        }
    }

    fn mode_e(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
        class: RegClass,
    ) -> Result<Self> {
        let (mod_, _reg, rm) = state.read_modrm(code, ip)?;
        let size = MemRef::size_for_type(desc.ty, state);
        Ok(match mod_ {
            0b00 => match rm {
                4 => {
                    let (scale, index, base, disp32) = state.read_sib(mod_, code, ip)?;
                    let disp = if disp32 { read4(code, ip)? as i32 } else { 0 };
                    Operand::Memory(MemRef::full(scale, index, base, disp, size, &state.prefix))
                }
                5 => Operand::Memory(MemRef::displacement(
                    read4(code, ip)? as i32,
                    size,
                    &state.prefix,
                )),
                _ => Operand::Memory(MemRef::base(register(rm), size, &state.prefix)),
            },
            0b01 => {
                if rm == 4 {
                    let (scale, index, base, _) = state.read_sib(mod_, code, ip)?;
                    let disp = i32::from(read1(code, ip)? as i8);
                    Operand::Memory(MemRef::full(scale, index, base, disp, size, &state.prefix))
                } else {
                    let disp8 = read1(code, ip)? as i8;
                    Operand::Memory(MemRef::base_plus_displacement(
                        register(rm),
                        i32::from(disp8),
                        size,
                        &state.prefix,
                    ))
                }
            }
            0b10 => {
                if rm == 4 {
                    let (scale, index, base, _) = state.read_sib(mod_, code, ip)?;
                    let disp = read4(code, ip)? as i32;
                    Operand::Memory(MemRef::full(scale, index, base, disp, size, &state.prefix))
                } else {
                    let disp32 = read4(code, ip)? as i32;
                    Operand::Memory(MemRef::base_plus_displacement(
                        register(rm),
                        disp32,
                        size,
                        &state.prefix,
                    ))
                }
            }
            0b11 => Operand::Register(match class {
                RegClass::Gpr => match desc.ty {
                    OperandType::b | OperandType::bs => register_low(rm),
                    OperandType::w => register_word(rm),
                    OperandType::v | OperandType::vs => {
                        maybe_toggle_reg_size(register(rm), state.prefix.toggle_operand_size)
                    }
                    _ => register(rm),
                },
                RegClass::Xmm => Reg::Xmm(rm),
                RegClass::Mmx => Reg::Mm(rm),
            }),
            _ => unreachable!("modrm mod out of range"),
        })
    }

    fn mode_g(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
        class: RegClass,
    ) -> Result<Self> {
        let (_mod, reg, _rm) = state.read_modrm(code, ip)?;
        Ok(Operand::Register(match class {
            RegClass::Gpr => match desc.ty {
                OperandType::b | OperandType::bs => register_low(reg),
                OperandType::w => register_word(reg),
                _ => maybe_toggle_reg_size(register(reg), state.prefix.toggle_operand_size),
            },
            RegClass::Xmm => Reg::Xmm(reg),
            RegClass::Mmx => Reg::Mm(reg),
        }))
    }

    fn mode_i(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
    ) -> Result<Self> {
        Ok(match desc.ty {
            OperandType::b => Operand::Imm32(u32::from(read1(code, ip)?)),
            OperandType::bs => Operand::Imm32s(i32::from(read1(code, ip)? as i8)),
            OperandType::w => Operand::Imm32(u32::from(read2(code, ip)?)),
            OperandType::v => read_n_32(code, ip, state.prefix.toggle_operand_size, false)?,
            OperandType::vs => read_n_32(code, ip, state.prefix.toggle_operand_size, true)?,
            _ => unreachable!("immediate type"),
        })
    }

    fn mode_j(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
    ) -> Result<Self> {
        Ok(match desc.ty {
            OperandType::bs => Operand::Imm32s(i32::from(read1(code, ip)? as i8)),
            OperandType::v => Operand::Imm32s(read4(code, ip)? as i32),
            _ => unreachable!("relative-branch type"),
        })
    }

    fn mode_o(
        code: &[u8],
        ip: &mut usize,
        desc: &OperandDef,
        state: &mut OperandDecodeState,
    ) -> Result<Self> {
        let size = MemRef::size_for_type(desc.ty, state);
        Ok(Operand::Memory(MemRef::displacement(
            read4(code, ip)? as i32,
            size,
            &state.prefix,
        )))
    }

    fn mode_x(desc: &OperandDef, state: &mut OperandDecodeState) -> Result<Self> {
        Ok(Operand::Memory(MemRef::base_plus_segment(
            Reg::ESI,
            MemRef::size_for_type(desc.ty, state),
            Reg::DS,
        )))
    }

    fn mode_y(desc: &OperandDef, state: &mut OperandDecodeState) -> Result<Self> {
        Ok(Operand::Memory(MemRef::base_plus_segment(
            Reg::EDI,
            MemRef::size_for_type(desc.ty, state),
            Reg::ES,
        )))
    }

    fn mode_z(desc: &OperandDef, state: &mut OperandDecodeState) -> Self {
        let bits = (state.op & 0b111) as u8;
        Operand::Register(match desc.ty {
            OperandType::b => register_low(bits),
            _ => maybe_toggle_reg_size(register(bits), state.prefix.toggle_operand_size),
        })
    }

    fn mode_imp(desc: &OperandDef, state: &mut OperandDecodeState) -> Result<Self> {
        Ok(match desc.ty {
            OperandType::eAX => Operand::Register(maybe_toggle_reg_size(
                Reg::EAX,
                state.prefix.toggle_operand_size,
            )),
            OperandType::AL => Operand::Register(Reg::AL),
            OperandType::CL => Operand::Register(Reg::CL),
            OperandType::const1 => Operand::Imm32(1),
            unk => unreachable!("unexpected implicit operand type: {:?}", unk),
        })
    }

    pub fn size(&self) -> u8 {
        match self {
            Operand::Imm32(_) | Operand::Imm32s(_) => 4,
            Operand::Register(r) => {
                if r.is_low8() || r.is_high8() {
                    1
                } else if r.is_reg16() {
                    2
                } else if r.is_xmm() {
                    16
                } else if r.is_mmx() {
                    8
                } else {
                    4
                }
            }
            Operand::Memory(mem) => mem.size,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{r}"),
            Operand::Imm32(x) => write!(f, "0x{x:X}"),
            Operand::Imm32s(x) => {
                if *x < 0 {
                    write!(f, "-0x{:X}", -(*x as i64))
                } else {
                    write!(f, "0x{x:X}")
                }
            }
            Operand::Memory(mr) => write!(f, "{mr}"),
        }
    }
}

#[derive(Clone, Copy)]
enum RegClass {
    Gpr,
    Xmm,
    Mmx,
}

#[inline]
fn modrm(b: u8) -> (u8, u8, u8) {
    (b >> 6, (b >> 3) & 0b111, b & 0b111)
}

fn register(b: u8) -> Reg {
    match b & 7 {
        0 => Reg::EAX,
        1 => Reg::ECX,
        2 => Reg::EDX,
        3 => Reg::EBX,
        4 => Reg::ESP,
        5 => Reg::EBP,
        6 => Reg::ESI,
        _ => Reg::EDI,
    }
}

fn register_word(b: u8) -> Reg {
    match b & 7 {
        0 => Reg::AX,
        1 => Reg::CX,
        2 => Reg::DX,
        3 => Reg::BX,
        4 => Reg::SP,
        5 => Reg::BP,
        6 => Reg::SI,
        _ => Reg::DI,
    }
}

fn register_low(b: u8) -> Reg {
    match b & 7 {
        0 => Reg::AL,
        1 => Reg::CL,
        2 => Reg::DL,
        3 => Reg::BL,
        4 => Reg::AH,
        5 => Reg::CH,
        6 => Reg::DH,
        _ => Reg::BH,
    }
}

fn maybe_toggle_reg_size(reg: Reg, toggle_operand_size: bool) -> Reg {
    if toggle_operand_size {
        match reg {
            Reg::EAX => Reg::AX,
            Reg::ECX => Reg::CX,
            Reg::EDX => Reg::DX,
            Reg::EBX => Reg::BX,
            Reg::ESP => Reg::SP,
            Reg::EBP => Reg::BP,
            Reg::ESI => Reg::SI,
            Reg::EDI => Reg::DI,
            other => other,
        }
    } else {
        reg
    }
}

fn read1(code: &[u8], ip: &mut usize) -> Result<u8> {
    ensure!(code.len() > *ip, DecodeError::TooShort { phase: "read 1" });
    let b = code[*ip];
    *ip += 1;
    Ok(b)
}

fn read2(code: &[u8], ip: &mut usize) -> Result<u16> {
    ensure!(
        code.len() > *ip + 1,
        DecodeError::TooShort { phase: "read 2" }
    );
    let w = u16::from_le_bytes([code[*ip], code[*ip + 1]]);
    *ip += 2;
    Ok(w)
}

fn read4(code: &[u8], ip: &mut usize) -> Result<u32> {
    ensure!(
        code.len() > *ip + 3,
        DecodeError::TooShort { phase: "read 4" }
    );
    let dw = u32::from_le_bytes([code[*ip], code[*ip + 1], code[*ip + 2], code[*ip + 3]]);
    *ip += 4;
    Ok(dw)
}

fn read_n_32(code: &[u8], ip: &mut usize, toggle_size: bool, sign_extend: bool) -> Result<Operand> {
    Ok(if toggle_size {
        let uw = read2(code, ip)?;
        if sign_extend {
            Operand::Imm32s(i32::from(uw as i16))
        } else {
            Operand::Imm32(u32::from(uw))
        }
    } else {
        let ud = read4(code, ip)?;
        if sign_extend {
            Operand::Imm32s(ud as i32)
        } else {
            Operand::Imm32(ud)
        }
    })
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub addr: u32,
    pub mnemonic: Mnemonic,
    pub operands: Vec<Operand>,
    pub raw: Vec<u8>,
    pub rep: Option<Rep>,

    // Resolved by `resolve_targets`.
    pub call_target: Option<u32>,
    pub jump_target: Option<u32>,
    pub memory_ref: Option<u32>,
}

impl Instr {
    #[inline]
    pub fn size(&self) -> usize {
        self.raw.len()
    }

    #[inline]
    pub fn end_addr(&self) -> u32 {
        self.addr + self.raw.len() as u32
    }

    #[inline]
    pub fn op(&self, i: usize) -> &Operand {
        &self.operands[i]
    }

    #[inline]
    pub fn is_call(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Call)
    }

    #[inline]
    pub fn is_ret(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Ret)
    }

    #[inline]
    pub fn is_jump(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Jmp)
    }

    #[inline]
    pub fn is_cond_jump(&self) -> bool {
        matches!(
            self.mnemonic,
            Mnemonic::Jcc(_) | Mnemonic::Jecxz | Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne
        )
    }

    #[inline]
    pub fn is_branch(&self) -> bool {
        self.is_jump() || self.is_cond_jump()
    }

    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.is_ret() || self.is_jump()
    }

    #[inline]
    pub fn is_nop(&self) -> bool {
        matches!(self.mnemonic, Mnemonic::Nop)
    }

    /// Resolve direct branch targets and flat data references.
    /// `image_lo..image_hi` bounds the address space data refs may fall in.
    pub fn resolve_targets(&mut self, image_lo: u32, image_hi: u32) {
        let end = self.end_addr();
        if self.is_call() {
            match self.operands.first() {
                Some(Operand::Imm32s(delta)) => {
                    self.call_target = Some(end.wrapping_add(*delta as u32));
                }
                Some(Operand::Imm32(delta)) => {
                    self.call_target = Some(end.wrapping_add(*delta));
                }
                Some(Operand::Memory(mr)) if mr.is_flat() => {
                    self.memory_ref = Some(mr.displacement as u32);
                }
                _ => {}
            }
            return;
        }
        if self.is_branch() {
            match self.operands.first() {
                Some(Operand::Imm32s(delta)) => {
                    self.jump_target = Some(end.wrapping_add(*delta as u32));
                }
                Some(Operand::Imm32(delta)) => {
                    self.jump_target = Some(end.wrapping_add(*delta));
                }
                Some(Operand::Memory(mr)) if mr.is_flat() => {
                    self.memory_ref = Some(mr.displacement as u32);
                }
                _ => {}
            }
            return;
        }
        for op in &self.operands {
            if let Operand::Memory(mr) = op {
                if mr.is_flat() {
                    let addr = mr.displacement as u32;
                    if addr >= image_lo && addr < image_hi {
                        self.memory_ref = Some(addr);
                        break;
                    }
                }
            }
        }
    }

    /// Decode one instruction at `code[*ipo]`; `va` is its load address.
    pub fn decode_one(code: &[u8], ipo: &mut usize, va: u32) -> Result<Instr> {
        let initial_ip = *ipo;

        let prefix = OpPrefix::from_bytes(code, ipo);

        ensure!(code.len() > *ipo, DecodeError::TooShort { phase: "opcode" });
        let mut op = u16::from(code[*ipo]);
        *ipo += 1;

        // x87: the D8-DF space keys on the full ModR/M byte.
        if (0xD8..=0xDF).contains(&op) {
            let (mnemonic, operands) = decode_x87(op as u8, code, ipo, &prefix)?;
            return Ok(Instr {
                addr: va,
                mnemonic,
                operands,
                raw: code[initial_ip..*ipo].to_vec(),
                rep: None,
                call_target: None,
                jump_target: None,
                memory_ref: None,
            });
        }

        if op == 0x0F {
            ensure!(
                code.len() > *ipo,
                DecodeError::TooShort { phase: "opcode 0F" }
            );
            op <<= 8;
            op |= u16::from(code[*ipo]);
            *ipo += 1;

            // SSE/MMX first: the mandatory prefix picks the variant.
            let second = (op & 0xFF) as u8;
            let disc = prefix.sse_discriminant();
            if let Some(def) = SSE_OPCODES.get(&(disc, second)) {
                return Self::decode_with(def, prefix, op, code, ipo, initial_ip, va);
            }
        }

        let op_ext = if USE_REG_OPCODES.contains(&op) {
            ensure!(
                code.len() > *ipo,
                DecodeError::TooShort { phase: "opcode ext" }
            );
            modrm(code[*ipo]).1
        } else {
            0
        };

        let def = Self::lookup_op(op, op_ext, *ipo)?;
        Self::decode_with(def, prefix, op, code, ipo, initial_ip, va)
    }

    fn decode_with(
        def: &OpCodeDef,
        prefix: OpPrefix,
        op: u16,
        code: &[u8],
        ipo: &mut usize,
        initial_ip: usize,
        va: u32,
    ) -> Result<Instr> {
        // The operand-size prefix narrows string ops and cwde.
        let mnemonic = match (def.mnemonic, prefix.toggle_operand_size) {
            (Mnemonic::Movs(Width::Dword), true) => Mnemonic::Movs(Width::Word),
            (Mnemonic::Stos(Width::Dword), true) => Mnemonic::Stos(Width::Word),
            (Mnemonic::Lods(Width::Dword), true) => Mnemonic::Lods(Width::Word),
            (Mnemonic::Scas(Width::Dword), true) => Mnemonic::Scas(Width::Word),
            (Mnemonic::Cmps(Width::Dword), true) => Mnemonic::Cmps(Width::Word),
            (Mnemonic::Cwde, true) => Mnemonic::Cbw,
            (m, _) => m,
        };

        let rep = prefix.rep;
        let mut operands = Vec::with_capacity(def.operands.len());
        let mut state = OperandDecodeState::initial(prefix, op);
        for operand_desc in def.operands.iter() {
            operands.push(Operand::from_bytes(code, ipo, operand_desc, &mut state)?);
        }
        Ok(Instr {
            addr: va,
            mnemonic,
            operands,
            raw: code[initial_ip..*ipo].to_vec(),
            rep,
            call_target: None,
            jump_target: None,
            memory_ref: None,
        })
    }

    fn lookup_op<'a>(op: u16, ext: u8, ip: usize) -> Result<&'a OpCodeDef> {
        if let Some(def) = OPCODES.get(&(op, ext)) {
            return Ok(def);
        }

        // Opcodes with the register in the low bits get masked and retried.
        let base_op = op & !0b111;
        if HAS_INLINE_REG.contains(&base_op) {
            if let Some(def) = OPCODES.get(&(base_op, 0)) {
                return Ok(def);
            }
        }

        Err(DecodeError::UnknownOpcode { ip, op, ext }.into())
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.rep {
            Some(Rep::Rep) => write!(f, "rep ")?,
            Some(Rep::Repne) => write!(f, "repne ")?,
            None => {}
        }
        write!(f, "{}", self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {op}")?;
            } else {
                write!(f, ", {op}")?;
            }
        }
        Ok(())
    }
}

/// Decode the x87 coprocessor space. Memory forms select the operation by
/// the reg field; register forms key on the whole ModR/M byte.
fn decode_x87(op: u8, code: &[u8], ip: &mut usize, prefix: &OpPrefix) -> Result<(Mnemonic, Vec<Operand>)> {
    ensure!(code.len() > *ip, DecodeError::TooShort { phase: "x87 modrm" });
    let m = code[*ip];
    let (mod_, ext, _rm) = modrm(m);

    if mod_ != 0b11 {
        // Memory operand; width depends on the opcode.
        let ty = match op {
            0xD8 | 0xD9 | 0xDA | 0xDB => OperandType::d,
            0xDC | 0xDD => OperandType::q,
            _ => OperandType::w, // DE (m16int), DF (m16int/m64int below)
        };
        let ty = match (op, ext) {
            (0xDF, 5) | (0xDF, 7) => OperandType::q,
            _ => ty,
        };
        let desc = OperandDef {
            method: AddressingMethod::E,
            ty,
        };
        let mut state = OperandDecodeState::initial(prefix.clone(), u16::from(op));
        let operand = Operand::from_bytes(code, ip, &desc, &mut state)?;
        let mnemonic = match (op, ext) {
            (0xD8, 0) | (0xDC, 0) => Mnemonic::Fadd,
            (0xD8, 1) | (0xDC, 1) => Mnemonic::Fmul,
            (0xD8, 2) | (0xDC, 2) => Mnemonic::Fcom,
            (0xD8, 3) | (0xDC, 3) => Mnemonic::Fcomp,
            (0xD8, 4) | (0xDC, 4) => Mnemonic::Fsub,
            (0xD8, 5) | (0xDC, 5) => Mnemonic::Fsubr,
            (0xD8, 6) | (0xDC, 6) => Mnemonic::Fdiv,
            (0xD8, 7) | (0xDC, 7) => Mnemonic::Fdivr,
            (0xD9, 0) | (0xDD, 0) => Mnemonic::Fld,
            (0xD9, 2) | (0xDD, 2) => Mnemonic::Fst,
            (0xD9, 3) | (0xDD, 3) => Mnemonic::Fstp,
            (0xD9, 5) => Mnemonic::Fldcw,
            (0xD9, 7) => Mnemonic::Fnstcw,
            (0xDD, 7) => Mnemonic::Fnstsw,
            (0xDA, 0) | (0xDE, 0) => Mnemonic::Fiadd,
            (0xDA, 1) | (0xDE, 1) => Mnemonic::Fimul,
            (0xDA, 4) | (0xDE, 4) => Mnemonic::Fisub,
            (0xDA, 5) | (0xDE, 5) => Mnemonic::Fisubr,
            (0xDA, 6) | (0xDE, 6) => Mnemonic::Fidiv,
            (0xDA, 7) | (0xDE, 7) => Mnemonic::Fidivr,
            (0xDB, 0) | (0xDF, 0) | (0xDF, 5) => Mnemonic::Fild,
            (0xDB, 2) | (0xDF, 2) => Mnemonic::Fist,
            (0xDB, 3) | (0xDF, 3) | (0xDF, 7) => Mnemonic::Fistp,
            (0xDB, 5) => Mnemonic::Fld,  // m80
            (0xDB, 7) => Mnemonic::Fstp, // m80
            _ => {
                return Err(DecodeError::UnknownOpcode {
                    ip: *ip,
                    op: u16::from(op),
                    ext,
                }
                .into())
            }
        };
        return Ok((mnemonic, vec![operand]));
    }

    // Register form: consume the modrm byte.
    *ip += 1;
    let sti = m & 7;
    let st = |i: u8| vec![Operand::Register(Reg::St(i))];
    let none = Vec::new();
    let (mnemonic, operands) = match (op, m) {
        (0xD8, 0xC0..=0xC7) => (Mnemonic::Fadd, st(sti)),
        (0xD8, 0xC8..=0xCF) => (Mnemonic::Fmul, st(sti)),
        (0xD8, 0xD0..=0xD7) => (Mnemonic::Fcom, st(sti)),
        (0xD8, 0xD8..=0xDF) => (Mnemonic::Fcomp, st(sti)),
        (0xD8, 0xE0..=0xE7) => (Mnemonic::Fsub, st(sti)),
        (0xD8, 0xE8..=0xEF) => (Mnemonic::Fsubr, st(sti)),
        (0xD8, 0xF0..=0xF7) => (Mnemonic::Fdiv, st(sti)),
        (0xD8, 0xF8..=0xFF) => (Mnemonic::Fdivr, st(sti)),

        (0xD9, 0xC0..=0xC7) => (Mnemonic::Fld, st(sti)),
        (0xD9, 0xC8..=0xCF) => (Mnemonic::Fxch, st(sti)),
        (0xD9, 0xD0) => (Mnemonic::Fnop, none),
        (0xD9, 0xE0) => (Mnemonic::Fchs, none),
        (0xD9, 0xE1) => (Mnemonic::Fabs, none),
        (0xD9, 0xE4) => (Mnemonic::Ftst, none),
        (0xD9, 0xE8) => (Mnemonic::Fld1, none),
        (0xD9, 0xEB) => (Mnemonic::Fldpi, none),
        (0xD9, 0xEE) => (Mnemonic::Fldz, none),
        (0xD9, 0xF0) => (Mnemonic::F2xm1, none),
        (0xD9, 0xF1) => (Mnemonic::Fyl2x, none),
        (0xD9, 0xF2) => (Mnemonic::Fptan, none),
        (0xD9, 0xF3) => (Mnemonic::Fpatan, none),
        (0xD9, 0xF5) => (Mnemonic::Fprem1, none),
        (0xD9, 0xF6) => (Mnemonic::Fdecstp, none),
        (0xD9, 0xF7) => (Mnemonic::Fincstp, none),
        (0xD9, 0xF8) => (Mnemonic::Fprem, none),
        (0xD9, 0xFA) => (Mnemonic::Fsqrt, none),
        (0xD9, 0xFB) => (Mnemonic::Fsincos, none),
        (0xD9, 0xFC) => (Mnemonic::Frndint, none),
        (0xD9, 0xFD) => (Mnemonic::Fscale, none),
        (0xD9, 0xFE) => (Mnemonic::Fsin, none),
        (0xD9, 0xFF) => (Mnemonic::Fcos, none),

        (0xDA, 0xE9) => (Mnemonic::Fucompp, none),

        (0xDB, 0xE2) => (Mnemonic::Fnclex, none),
        (0xDB, 0xE3) => (Mnemonic::Fninit, none),
        (0xDB, 0xE8..=0xEF) => (Mnemonic::Fucomi, st(sti)),
        (0xDB, 0xF0..=0xF7) => (Mnemonic::Fcomi, st(sti)),

        (0xDC, 0xC0..=0xC7) => (Mnemonic::Fadd, st(sti)),
        (0xDC, 0xC8..=0xCF) => (Mnemonic::Fmul, st(sti)),
        (0xDC, 0xE0..=0xE7) => (Mnemonic::Fsubr, st(sti)),
        (0xDC, 0xE8..=0xEF) => (Mnemonic::Fsub, st(sti)),
        (0xDC, 0xF0..=0xF7) => (Mnemonic::Fdivr, st(sti)),
        (0xDC, 0xF8..=0xFF) => (Mnemonic::Fdiv, st(sti)),

        (0xDD, 0xC0..=0xC7) => (Mnemonic::Ffree, st(sti)),
        (0xDD, 0xD0..=0xD7) => (Mnemonic::Fst, st(sti)),
        (0xDD, 0xD8..=0xDF) => (Mnemonic::Fstp, st(sti)),
        (0xDD, 0xE0..=0xE7) => (Mnemonic::Fucom, st(sti)),
        (0xDD, 0xE8..=0xEF) => (Mnemonic::Fucomp, st(sti)),

        (0xDE, 0xC0..=0xC7) => (Mnemonic::Faddp, st(sti)),
        (0xDE, 0xC8..=0xCF) => (Mnemonic::Fmulp, st(sti)),
        (0xDE, 0xD9) => (Mnemonic::Fcompp, none),
        (0xDE, 0xE0..=0xE7) => (Mnemonic::Fsubrp, st(sti)),
        (0xDE, 0xE8..=0xEF) => (Mnemonic::Fsubp, st(sti)),
        (0xDE, 0xF0..=0xF7) => (Mnemonic::Fdivrp, st(sti)),
        (0xDE, 0xF8..=0xFF) => (Mnemonic::Fdivp, st(sti)),

        (0xDF, 0xE0) => (Mnemonic::Fnstsw, vec![Operand::Register(Reg::AX)]),
        (0xDF, 0xE8..=0xEF) => (Mnemonic::Fucomip, st(sti)),
        (0xDF, 0xF0..=0xF7) => (Mnemonic::Fcomip, st(sti)),

        _ => {
            return Err(DecodeError::UnknownOpcode {
                ip: *ip,
                op: u16::from(op),
                ext: m,
            }
            .into())
        }
    };
    Ok((mnemonic, operands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lut::Cc;

    fn decode(bytes: &[u8]) -> Instr {
        let mut ip = 0;
        let insn = Instr::decode_one(bytes, &mut ip, 0x1000).unwrap();
        assert_eq!(ip, bytes.len(), "decoded length for {bytes:02X?}");
        insn
    }

    #[test]
    fn it_decodes_the_standard_prologue() {
        let insn = decode(&[0x55]);
        assert_eq!(insn.mnemonic, Mnemonic::Push);
        assert!(matches!(insn.op(0), Operand::Register(Reg::EBP)));

        let insn = decode(&[0x8B, 0xEC]);
        assert_eq!(insn.mnemonic, Mnemonic::Mov);
        assert!(matches!(insn.op(0), Operand::Register(Reg::EBP)));
        assert!(matches!(insn.op(1), Operand::Register(Reg::ESP)));
    }

    #[test]
    fn it_decodes_relative_calls() {
        // call +0x10 from 0x1000; next instruction at 0x1005.
        let mut insn = decode(&[0xE8, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(insn.mnemonic, Mnemonic::Call);
        insn.resolve_targets(0, u32::MAX);
        assert_eq!(insn.call_target, Some(0x1015));
    }

    #[test]
    fn it_decodes_short_jcc_backwards() {
        let mut insn = decode(&[0x74, 0xFE]); // je $-0
        assert_eq!(insn.mnemonic, Mnemonic::Jcc(Cc::Z));
        insn.resolve_targets(0, u32::MAX);
        assert_eq!(insn.jump_target, Some(0x1000));
    }

    #[test]
    fn it_decodes_flat_memory_calls() {
        let mut insn = decode(&[0xFF, 0x15, 0xC0, 0xB7, 0x36, 0x00]); // call [0x0036B7C0]
        assert_eq!(insn.mnemonic, Mnemonic::Call);
        insn.resolve_targets(0, u32::MAX);
        assert_eq!(insn.memory_ref, Some(0x0036_B7C0));
        assert_eq!(insn.call_target, None);
    }

    #[test]
    fn it_decodes_flat_data_reads() {
        let mut insn = decode(&[0xA1, 0x60, 0x23, 0x3B, 0x00]); // mov eax, [0x3B2360]
        assert_eq!(insn.mnemonic, Mnemonic::Mov);
        insn.resolve_targets(0x0001_0000, 0x0080_0000);
        assert_eq!(insn.memory_ref, Some(0x003B_2360));
    }

    #[test]
    fn it_decodes_sib_forms() {
        // mov eax, [ebx+ecx*4+0x10]
        let insn = decode(&[0x8B, 0x44, 0x8B, 0x10]);
        match insn.op(1) {
            Operand::Memory(mr) => {
                assert_eq!(mr.base, Some(Reg::EBX));
                assert_eq!(mr.index, Some(Reg::ECX));
                assert_eq!(mr.scale, 4);
                assert_eq!(mr.displacement, 0x10);
            }
            other => panic!("expected memory operand, got {other:?}"),
        }
    }

    #[test]
    fn it_decodes_movss_and_addss() {
        // movss xmm0, [0x11223344]
        let insn = decode(&[0xF3, 0x0F, 0x10, 0x05, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(insn.mnemonic, Mnemonic::Movss);
        assert!(matches!(insn.op(0), Operand::Register(Reg::Xmm(0))));
        match insn.op(1) {
            Operand::Memory(mr) => assert_eq!(mr.size, 4),
            other => panic!("expected memory operand, got {other:?}"),
        }

        let insn = decode(&[0xF3, 0x0F, 0x58, 0xC1]); // addss xmm0, xmm1
        assert_eq!(insn.mnemonic, Mnemonic::Addss);
        assert!(matches!(insn.op(1), Operand::Register(Reg::Xmm(1))));
    }

    #[test]
    fn it_decodes_x87_loads() {
        // fld dword [ebp+8]
        let insn = decode(&[0xD9, 0x45, 0x08]);
        assert_eq!(insn.mnemonic, Mnemonic::Fld);
        match insn.op(0) {
            Operand::Memory(mr) => {
                assert_eq!(mr.base, Some(Reg::EBP));
                assert_eq!(mr.size, 4);
            }
            other => panic!("expected memory operand, got {other:?}"),
        }

        // fstp qword [esp]
        let insn = decode(&[0xDD, 0x1C, 0x24]);
        assert_eq!(insn.mnemonic, Mnemonic::Fstp);
        match insn.op(0) {
            Operand::Memory(mr) => assert_eq!(mr.size, 8),
            other => panic!("expected memory operand, got {other:?}"),
        }

        // faddp st1
        let insn = decode(&[0xDE, 0xC1]);
        assert_eq!(insn.mnemonic, Mnemonic::Faddp);
    }

    #[test]
    fn it_decodes_rep_string_ops() {
        let insn = decode(&[0xF3, 0xA5]); // rep movsd
        assert_eq!(insn.mnemonic, Mnemonic::Movs(Width::Dword));
        assert_eq!(insn.rep, Some(Rep::Rep));

        let insn = decode(&[0xF3, 0xAB]); // rep stosd
        assert_eq!(insn.mnemonic, Mnemonic::Stos(Width::Dword));
    }

    #[test]
    fn it_decodes_setcc_and_cmovcc() {
        let insn = decode(&[0x0F, 0x94, 0xC0]); // sete al
        assert_eq!(insn.mnemonic, Mnemonic::Setcc(Cc::Z));
        assert!(matches!(insn.op(0), Operand::Register(Reg::AL)));

        let insn = decode(&[0x0F, 0x45, 0xC1]); // cmovnz eax, ecx
        assert_eq!(insn.mnemonic, Mnemonic::Cmovcc(Cc::Nz));
    }

    #[test]
    fn it_rejects_unknown_opcodes() {
        let mut ip = 0;
        let err = Instr::decode_one(&[0x0F, 0x0B], &mut ip, 0).unwrap_err();
        assert!(err.downcast_ref::<DecodeError>().is_some());
    }

    #[test]
    fn it_decodes_ret_imm16() {
        let insn = decode(&[0xC2, 0x08, 0x00]); // ret 8
        assert_eq!(insn.mnemonic, Mnemonic::Ret);
        assert!(matches!(insn.op(0), Operand::Imm32(8)));
    }
}
