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

//! Per-function ABI inference from prologue and epilogue bytes.
//!
//! Everything here is a byte-window heuristic: the first 64 bytes tell us
//! the frame shape and parameter accesses, the last 32 the cleanup
//! convention and the return-value register.

use funcs::FunctionTable;
use ident::{Category, Identification};
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use xbe::Image;

const MAX_PROLOGUE_BYTES: usize = 64;
const MAX_EPILOGUE_BYTES: usize = 32;

/// Policy knobs for behaviors the byte evidence cannot settle.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbiOptions {
    /// A truncated epilogue (no return opcode in the window) normally
    /// reads as caller-cleans; set to assume callee-cleans instead.
    pub truncated_epilogue_is_callee_cleans: bool,
}

fn hex_addr<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    EbpFrame,
    FpoStack,
    FpoLeaf,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallingConvention {
    Cdecl,
    Stdcall,
    Thiscall,
    ThiscallCdecl,
}

impl CallingConvention {
    #[inline]
    pub fn has_this(&self) -> bool {
        matches!(
            self,
            CallingConvention::Thiscall | CallingConvention::ThiscallCdecl
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnHint {
    Void,
    Int,
    IntZero,
    Float,
    Double,
    FloatSse,
    IntOrVoid,
    Unknown,
}

#[derive(Clone, Debug, Serialize)]
pub struct AbiRecord {
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    pub size: u32,
    pub category: String,
    pub frame_type: FrameType,
    pub calling_convention: CallingConvention,
    pub estimated_params: u32,
    pub preserved_regs: Vec<&'static str>,
    pub return_hint: ReturnHint,
    pub stack_frame_size: u32,
}

#[derive(Default)]
pub struct AbiDatabase {
    pub records: BTreeMap<u32, AbiRecord>,
}

impl AbiDatabase {
    #[inline]
    pub fn get(&self, addr: u32) -> Option<&AbiRecord> {
        self.records.get(&addr)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> AbiSummary {
        let mut summary = AbiSummary {
            total_analyzed: self.records.len(),
            ..Default::default()
        };
        for r in self.records.values() {
            *summary
                .frame_type
                .entry(format!("{:?}", r.frame_type).to_lowercase())
                .or_insert(0) += 1;
            *summary
                .calling_convention
                .entry(format!("{:?}", r.calling_convention).to_lowercase())
                .or_insert(0) += 1;
            *summary
                .return_hint
                .entry(format!("{:?}", r.return_hint).to_lowercase())
                .or_insert(0) += 1;
            *summary
                .estimated_params
                .entry(r.estimated_params.to_string())
                .or_insert(0) += 1;
            if r.calling_convention.has_this() {
                summary.thiscall_count += 1;
            }
            if r.stack_frame_size > 0 {
                let bracket = match r.stack_frame_size {
                    1..=16 => "1-16",
                    17..=64 => "17-64",
                    65..=256 => "65-256",
                    257..=1024 => "257-1024",
                    _ => "1025-65536",
                };
                *summary
                    .stack_size_distribution
                    .entry(bracket.to_owned())
                    .or_insert(0) += 1;
            }
        }
        summary
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct AbiSummary {
    pub total_analyzed: usize,
    pub frame_type: BTreeMap<String, usize>,
    pub calling_convention: BTreeMap<String, usize>,
    pub return_hint: BTreeMap<String, usize>,
    pub estimated_params: BTreeMap<String, usize>,
    pub stack_size_distribution: BTreeMap<String, usize>,
    pub thiscall_count: usize,
}

/// Analyze every detected function except the generated data-init stubs,
/// which have no meaningful ABI.
pub fn analyze_all(
    image: &Image,
    functions: &FunctionTable,
    identification: &Identification,
    options: &AbiOptions,
) -> AbiDatabase {
    let mut db = AbiDatabase::default();
    for f in functions.all() {
        let category = identification.category_of(f.start);
        if category == Category::DataInit {
            continue;
        }
        if let Some(record) = analyze_function(image, f.start, f.end, &category.key(), options) {
            db.records.insert(f.start, record);
        }
    }
    debug!("{} ABI records", db.len());
    db
}

pub fn analyze_function(
    image: &Image,
    start: u32,
    end: u32,
    category: &str,
    options: &AbiOptions,
) -> Option<AbiRecord> {
    let size = end.checked_sub(start)?;
    if size == 0 {
        return None;
    }

    let pro_len = (size as usize).min(MAX_PROLOGUE_BYTES);
    let prologue = image.read_bytes(start, pro_len)?;

    let epi_len = (size as usize).min(MAX_EPILOGUE_BYTES);
    let epilogue = image.read_bytes(end - epi_len as u32, epi_len).unwrap_or(&[]);

    let frame_type = detect_frame_type(prologue);
    let calling_convention = detect_calling_convention(prologue, epilogue, options);
    let estimated_params = estimate_params(prologue, frame_type);
    let preserved_regs = detect_preserved_registers(prologue);
    let return_hint = detect_return_hint(epilogue);
    let stack_frame_size = detect_stack_size(prologue, frame_type);

    Some(AbiRecord {
        address: start,
        size,
        category: category.to_owned(),
        frame_type,
        calling_convention,
        estimated_params,
        preserved_regs,
        return_hint,
        stack_frame_size,
    })
}

fn detect_frame_type(prologue: &[u8]) -> FrameType {
    if prologue.len() >= 3 && prologue[..3] == [0x55, 0x8B, 0xEC] {
        return FrameType::EbpFrame;
    }
    if prologue.len() >= 3 && prologue[0] == 0x83 && prologue[1] == 0xEC {
        return FrameType::FpoStack;
    }
    if prologue.len() >= 2 && prologue[..2] == [0x81, 0xEC] {
        return FrameType::FpoStack;
    }
    FrameType::FpoLeaf
}

/// `ret imm16` within the last 3-8 bytes means the callee cleans the
/// stack; early ECX dereferences mean a `this` pointer.
fn detect_calling_convention(
    prologue: &[u8],
    epilogue: &[u8],
    options: &AbiOptions,
) -> CallingConvention {
    let mut callee_cleans = false;
    let mut saw_ret = false;
    if epilogue.len() >= 3 {
        let lo = epilogue.len().saturating_sub(8);
        let hi = epilogue.len() - 3;
        for i in (lo..=hi).rev() {
            if epilogue[i] == 0xC2 {
                callee_cleans = true;
                break;
            }
        }
        saw_ret = callee_cleans || epilogue.iter().any(|&b| b == 0xC3);
    }
    if !saw_ret && options.truncated_epilogue_is_callee_cleans {
        callee_cleans = true;
    }

    let this_ptr = uses_ecx_as_this(prologue);
    match (this_ptr, callee_cleans) {
        (true, true) => CallingConvention::Thiscall,
        (true, false) => CallingConvention::ThiscallCdecl,
        (false, true) => CallingConvention::Stdcall,
        (false, false) => CallingConvention::Cdecl,
    }
}

fn uses_ecx_as_this(prologue: &[u8]) -> bool {
    if prologue.len() < 4 {
        return false;
    }
    let window = prologue.len().min(32);
    for i in 0..window.saturating_sub(1) {
        let b0 = prologue[i];
        let b1 = prologue[i + 1];

        // mov reg, [ecx+disp8]: modrm mod=01, r/m=001.
        if b0 == 0x8B && b1 & 0xC7 == 0x41 {
            return true;
        }
        // mov reg, [ecx]: modrm mod=00, r/m=001.
        if b0 == 0x8B && b1 & 0xC7 == 0x01 {
            return true;
        }
        // mov [ecx+disp8], reg.
        if b0 == 0x89 && b1 & 0xC7 == 0x41 {
            return true;
        }
        // mov reg, ecx.
        if b0 == 0x8B && b1 & 0xC0 == 0xC0 && b1 & 0x07 == 0x01 {
            return true;
        }
    }
    false
}

/// EBP-framed parameters live at [ebp+8], [ebp+0C], ...; the highest
/// early displacement bounds the count. Not applied to FPO functions.
fn estimate_params(prologue: &[u8], frame_type: FrameType) -> u32 {
    if frame_type != FrameType::EbpFrame || prologue.len() < 4 {
        return 0;
    }
    let mut max_disp = 0u32;
    let window = prologue.len().min(48);
    for i in 0..window.saturating_sub(2) {
        // [ebp+disp8]: modrm mod=01, r/m=101.
        if prologue[i + 1] & 0x47 == 0x45 {
            let disp = u32::from(prologue[i + 2]);
            if (8..=0x40).contains(&disp) && disp > max_disp {
                max_disp = disp;
            }
        }
    }
    if max_disp >= 8 {
        (max_disp - 4) / 4
    } else {
        0
    }
}

fn detect_preserved_registers(prologue: &[u8]) -> Vec<&'static str> {
    let mut preserved = Vec::new();
    for &b in prologue.iter().take(8) {
        match b {
            0x53 => preserved.push("ebx"),
            0x56 => preserved.push("esi"),
            0x57 => preserved.push("edi"),
            0x55 => preserved.push("ebp"),
            // Other frame-setup bytes keep the scan alive.
            0x8B | 0x83 | 0x81 | 0x89 | 0x50 | 0x51 | 0x52 => {}
            _ => break,
        }
    }
    preserved
}

fn detect_return_hint(epilogue: &[u8]) -> ReturnHint {
    if epilogue.len() < 2 {
        return ReturnHint::Unknown;
    }
    let lo = epilogue.len().saturating_sub(16);
    for i in (lo..epilogue.len() - 1).rev() {
        let b = epilogue[i];
        let next = epilogue[i + 1];

        // fld st(i) at the end means an x87 return value.
        if b == 0xD9 && (0xC0..=0xC3).contains(&next) {
            return ReturnHint::Float;
        }
        if b == 0xDD && (0xC0..=0xC3).contains(&next) {
            return ReturnHint::Double;
        }
        // xor eax, eax.
        if b == 0x33 && next == 0xC0 {
            return ReturnHint::IntZero;
        }
        // movss from an SSE register.
        if b == 0xF3 && i + 2 < epilogue.len() && next == 0x0F && epilogue[i + 2] == 0x10 {
            return ReturnHint::FloatSse;
        }
    }
    ReturnHint::IntOrVoid
}

fn detect_stack_size(prologue: &[u8], frame_type: FrameType) -> u32 {
    match frame_type {
        FrameType::EbpFrame => {
            if prologue.len() >= 6 && prologue[3] == 0x83 && prologue[4] == 0xEC {
                return u32::from(prologue[5]);
            }
            if prologue.len() >= 9 && prologue[3] == 0x81 && prologue[4] == 0xEC {
                return u32::from_le_bytes([prologue[5], prologue[6], prologue[7], prologue[8]]);
            }
            0
        }
        FrameType::FpoStack => {
            if prologue.len() >= 3 && prologue[0] == 0x83 && prologue[1] == 0xEC {
                return u32::from(prologue[2]);
            }
            if prologue.len() >= 6 && prologue[0] == 0x81 && prologue[1] == 0xEC {
                return u32::from_le_bytes([prologue[2], prologue[3], prologue[4], prologue[5]]);
            }
            0
        }
        FrameType::FpoLeaf => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_detects_frame_types() {
        assert_eq!(detect_frame_type(&[0x55, 0x8B, 0xEC, 0xC3]), FrameType::EbpFrame);
        assert_eq!(detect_frame_type(&[0x83, 0xEC, 0x10, 0xC3]), FrameType::FpoStack);
        assert_eq!(
            detect_frame_type(&[0x81, 0xEC, 0x00, 0x01, 0x00, 0x00]),
            FrameType::FpoStack
        );
        assert_eq!(detect_frame_type(&[0x8B, 0xC1, 0xC3]), FrameType::FpoLeaf);
    }

    #[test]
    fn it_detects_calling_conventions() {
        // mov eax, [ecx+4]; ret 8 → thiscall.
        let opts = AbiOptions::default();
        assert_eq!(
            detect_calling_convention(
                &[0x8B, 0x41, 0x04, 0xC2, 0x08, 0x00],
                &[0x8B, 0x41, 0x04, 0xC2, 0x08, 0x00],
                &opts
            ),
            CallingConvention::Thiscall
        );
        // mov eax, [ecx]; inc eax; ret → MSVC-style caller-cleans thiscall.
        assert_eq!(
            detect_calling_convention(&[0x8B, 0x01, 0x40, 0xC3], &[0x8B, 0x01, 0x40, 0xC3], &opts),
            CallingConvention::ThiscallCdecl
        );
        // ret 4, no ECX usage → stdcall.
        assert_eq!(
            detect_calling_convention(&[0x8B, 0x44, 0x24, 0x04], &[0xC2, 0x04, 0x00], &opts),
            CallingConvention::Stdcall
        );
        // Plain ret → cdecl.
        assert_eq!(
            detect_calling_convention(&[0x33, 0xC0], &[0x33, 0xC0, 0xC3], &opts),
            CallingConvention::Cdecl
        );
    }

    #[test]
    fn it_estimates_parameter_counts() {
        // mov eax, [ebp+8]; mov ecx, [ebp+0C]: two dword parameters.
        let prologue = [0x55, 0x8B, 0xEC, 0x8B, 0x45, 0x08, 0x8B, 0x4D, 0x0C];
        assert_eq!(estimate_params(&prologue, FrameType::EbpFrame), 2);
        // No parameter access.
        assert_eq!(estimate_params(&[0x55, 0x8B, 0xEC, 0xC3], FrameType::EbpFrame), 0);
        // FPO functions never report parameters from this heuristic.
        assert_eq!(estimate_params(&prologue, FrameType::FpoLeaf), 0);
    }

    #[test]
    fn it_collects_preserved_registers() {
        // push ebx; push esi; push edi before the frame setup.
        assert_eq!(
            detect_preserved_registers(&[0x53, 0x56, 0x57, 0x8B, 0x44, 0x24, 0x10]),
            vec!["ebx", "esi", "edi"]
        );
        // 0xEC is not a setup byte, so the scan ends inside the standard
        // prologue with only the ebp push seen.
        assert_eq!(
            detect_preserved_registers(&[0x55, 0x8B, 0xEC, 0x53, 0x56, 0x57]),
            vec!["ebp"]
        );
        // The scan stops at the first non-setup byte.
        assert_eq!(detect_preserved_registers(&[0x53, 0xE8, 0x56]), vec!["ebx"]);
    }

    #[test]
    fn it_hints_return_types() {
        assert_eq!(detect_return_hint(&[0x33, 0xC0, 0xC3]), ReturnHint::IntZero);
        assert_eq!(detect_return_hint(&[0xD9, 0xC0, 0xC3]), ReturnHint::Float);
        assert_eq!(
            detect_return_hint(&[0xF3, 0x0F, 0x10, 0x05, 0x00, 0x00, 0x00, 0x00, 0xC3]),
            ReturnHint::FloatSse
        );
        assert_eq!(detect_return_hint(&[0x8B, 0xC6, 0xC3]), ReturnHint::IntOrVoid);
    }

    #[test]
    fn it_reads_stack_frame_sizes() {
        // push ebp; mov ebp, esp; sub esp, 0x40.
        assert_eq!(
            detect_stack_size(&[0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x40], FrameType::EbpFrame),
            0x40
        );
        // sub esp, 0x218 (imm32 form, FPO).
        assert_eq!(
            detect_stack_size(&[0x81, 0xEC, 0x18, 0x02, 0x00, 0x00], FrameType::FpoStack),
            0x218
        );
        assert_eq!(detect_stack_size(&[0xC3], FrameType::FpoLeaf), 0);
    }
}
