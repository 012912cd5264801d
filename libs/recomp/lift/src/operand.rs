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

//! Rendering of x86 operands as C expressions over the runtime-shim
//! macros. Registers are 32-bit unsigned locals; sub-registers go through
//! `LO8`/`HI8`/`LO16` and their `SET_` counterparts; memory goes through
//! `MEM<size>` lvalues on flat address arithmetic.

use i386::{MemRef, Operand, Reg};

/// Read a register as a C expression.
pub fn reg_read(reg: Reg) -> String {
    if reg.is_segment() {
        return format!("0 /* seg:{} */", reg.name());
    }
    match reg {
        Reg::AL | Reg::BL | Reg::CL | Reg::DL => {
            format!("LO8({})", reg.parent32().unwrap().name())
        }
        Reg::AH | Reg::BH | Reg::CH | Reg::DH => {
            format!("HI8({})", reg.parent32().unwrap().name())
        }
        r if r.is_reg16() => format!("LO16({})", r.parent32().unwrap().name()),
        r => r.name().to_owned(),
    }
}

/// Write a register: a full statement including the trailing semicolon.
pub fn reg_write(reg: Reg, value: &str) -> String {
    if reg.is_segment() {
        return format!("/* mov {}, {} - segment register */;", reg.name(), value);
    }
    match reg {
        Reg::AL | Reg::BL | Reg::CL | Reg::DL => {
            format!("SET_LO8({}, {});", reg.parent32().unwrap().name(), value)
        }
        Reg::AH | Reg::BH | Reg::CH | Reg::DH => {
            format!("SET_HI8({}, {});", reg.parent32().unwrap().name(), value)
        }
        r if r.is_reg16() => format!("SET_LO16({}, {});", r.parent32().unwrap().name(), value),
        r => format!("{} = {};", r.name(), value),
    }
}

pub fn imm(value: u32) -> String {
    if value == 0 {
        "0".to_owned()
    } else if value <= 9 {
        value.to_string()
    } else if value > 0x7FFF_FFFF {
        format!("0x{value:08X}u")
    } else {
        format!("0x{value:X}")
    }
}

pub fn mem_accessor(size: u8) -> &'static str {
    match size {
        1 => "MEM8",
        2 => "MEM16",
        _ => "MEM32",
    }
}

pub fn smem_accessor(size: u8) -> &'static str {
    match size {
        1 => "SMEM8",
        2 => "SMEM16",
        _ => "SMEM32",
    }
}

/// Render the address computation of a memory operand.
pub fn mem_addr(mr: &MemRef) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(base) = mr.base {
        parts.push(reg_read(base));
    }
    if let Some(index) = mr.index {
        let idx = reg_read(index);
        if mr.scale > 1 {
            parts.push(format!("{idx} * {}", mr.scale));
        } else {
            parts.push(idx);
        }
    }
    if mr.displacement != 0 {
        if parts.is_empty() {
            // Flat address: render the raw unsigned value.
            parts.push(imm(mr.displacement as u32));
        } else if mr.displacement < 0 {
            return format!(
                "{} - {}",
                parts.join(" + "),
                imm(mr.displacement.unsigned_abs())
            );
        } else {
            parts.push(imm(mr.displacement as u32));
        }
    }
    if parts.is_empty() {
        return "0".to_owned();
    }
    parts.join(" + ")
}

pub fn mem_read(mr: &MemRef) -> String {
    format!("{}({})", mem_accessor(mr.size), mem_addr(mr))
}

pub fn mem_write(mr: &MemRef, value: &str) -> String {
    format!("{}({}) = {};", mem_accessor(mr.size), mem_addr(mr), value)
}

/// Read any operand as a C expression.
pub fn op_read(op: &Operand) -> String {
    match op {
        Operand::Register(r) => reg_read(*r),
        Operand::Imm32(v) => imm(*v),
        Operand::Imm32s(v) => imm(*v as u32),
        Operand::Memory(mr) => mem_read(mr),
    }
}

/// Write a value to any operand. Immediates are not writable.
pub fn op_write(op: &Operand, value: &str) -> String {
    match op {
        Operand::Register(r) => reg_write(*r, value),
        Operand::Memory(mr) => mem_write(mr, value),
        Operand::Imm32(_) | Operand::Imm32s(_) => {
            "/* cannot write to an immediate */;".to_owned()
        }
    }
}

/// SSE operands read as floats: register name, or MEMF/MEMD by width.
pub fn sse_read(op: &Operand) -> String {
    match op {
        Operand::Register(r) => r.name().to_owned(),
        Operand::Memory(mr) if mr.size == 8 => format!("MEMD({})", mem_addr(mr)),
        Operand::Memory(mr) => format!("MEMF({})", mem_addr(mr)),
        other => op_read(other),
    }
}

pub fn sse_write(op: &Operand, value: &str) -> String {
    match op {
        Operand::Register(r) => format!("{} = {};", r.name(), value),
        Operand::Memory(mr) if mr.size == 8 => format!("MEMD({}) = {};", mem_addr(mr), value),
        Operand::Memory(mr) => format!("MEMF({}) = {};", mem_addr(mr), value),
        _ => "/* cannot write sse value */;".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(disp: i32, size: u8) -> MemRef {
        MemRef {
            displacement: disp,
            base: None,
            index: None,
            scale: 1,
            segment: None,
            size,
        }
    }

    #[test]
    fn it_renders_sub_registers() {
        assert_eq!(reg_read(Reg::AL), "LO8(eax)");
        assert_eq!(reg_read(Reg::CH), "HI8(ecx)");
        assert_eq!(reg_read(Reg::DX), "LO16(edx)");
        assert_eq!(reg_read(Reg::ESI), "esi");
        assert_eq!(reg_write(Reg::BL, "5"), "SET_LO8(ebx, 5);");
        assert_eq!(reg_write(Reg::EDI, "eax"), "edi = eax;");
    }

    #[test]
    fn it_renders_segment_registers_as_noops() {
        assert_eq!(reg_read(Reg::FS), "0 /* seg:fs */");
        assert!(reg_write(Reg::DS, "eax").starts_with("/*"));
    }

    #[test]
    fn it_renders_memory_addresses() {
        assert_eq!(mem_read(&flat(0x3B2360, 4)), "MEM32(0x3B2360)");
        assert_eq!(mem_read(&flat(0x10, 1)), "MEM8(0x10)");

        let m = MemRef {
            displacement: 0x10,
            base: Some(Reg::EBX),
            index: Some(Reg::ECX),
            scale: 4,
            segment: None,
            size: 4,
        };
        assert_eq!(mem_addr(&m), "ebx + ecx * 4 + 0x10");

        let neg = MemRef {
            displacement: -0x18,
            base: Some(Reg::EBP),
            index: None,
            scale: 1,
            segment: None,
            size: 4,
        };
        assert_eq!(mem_addr(&neg), "ebp - 0x18");
    }

    #[test]
    fn it_formats_immediates() {
        assert_eq!(imm(0), "0");
        assert_eq!(imm(7), "7");
        assert_eq!(imm(0x10), "0x10");
        assert_eq!(imm(0xFFFFFFFF), "0xFFFFFFFFu");
    }
}
