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

//! Compiler-runtime identification via byte signatures.
//!
//! MSVC emits its runtime primitives as fixed byte sequences; the first N
//! bytes identify them reliably. Mask bytes: 0xFF compares exactly, 0x00
//! ignores the byte, anything else compares under the mask.

use crate::{Category, Classification};
use funcs::FunctionTable;
use log::debug;
use std::collections::BTreeMap;
use xbe::Image;

pub const CONFIDENCE_SIGNATURE: f64 = 0.95;

pub struct RuntimeSig {
    pub name: &'static str,
    pub pattern: &'static [u8],
    pub mask: Option<&'static [u8]>,
    /// Zero means unbounded; otherwise the function may be at most twice
    /// this size.
    pub max_size: u32,
}

#[cfg_attr(rustfmt, rustfmt_skip)]
pub const RUNTIME_SIGNATURES: &[RuntimeSig] = &[
    RuntimeSig {
        // push ebp; mov ebp, esp; push edi; push esi; mov esi, [ebp+0C];
        // mov ecx, [ebp+10]; mov edi, [ebp+08]; mov eax, ecx; mov edx, ecx
        name: "_memcpy",
        pattern: &[0x55, 0x8B, 0xEC, 0x57, 0x56, 0x8B, 0x75, 0x0C, 0x8B, 0x4D, 0x10, 0x8B, 0x7D, 0x08, 0x8B, 0xC1],
        mask: None,
        max_size: 400,
    },
    RuntimeSig {
        // mov edx, [esp+0C]; mov ecx, [esp+04]; test edx, edx; jz ...
        name: "_memset",
        pattern: &[0x8B, 0x54, 0x24, 0x0C, 0x8B, 0x4C, 0x24, 0x04, 0x85, 0xD2],
        mask: None,
        max_size: 200,
    },
    RuntimeSig {
        // mov ecx, [esp+04]; test ecx, 3; jz ...
        name: "_strlen",
        pattern: &[0x8B, 0x4C, 0x24, 0x04, 0xF7, 0xC1, 0x03, 0x00, 0x00, 0x00],
        mask: None,
        max_size: 150,
    },
    RuntimeSig {
        // push ebp; mov ebp, esp; add esp, -0C; wait; fnstcw [ebp-02]
        name: "_ftol",
        pattern: &[0x55, 0x8B, 0xEC, 0x83, 0xC4, 0xF4, 0x9B, 0xD9, 0x7D, 0xFC],
        mask: None,
        max_size: 100,
    },
    RuntimeSig {
        // push ecx; cmp eax, 1000h; lea ecx, [esp+08]; jb ...
        name: "_chkstk",
        pattern: &[0x51, 0x3D, 0x00, 0x10, 0x00, 0x00, 0x8D, 0x4C, 0x24, 0x08],
        mask: None,
        max_size: 100,
    },
    RuntimeSig {
        // mov eax, [esp+08]; mov ecx, [esp+10]; or ecx, eax; mov ecx, [esp+0C]; jnz ...
        name: "_allmul",
        pattern: &[0x8B, 0x44, 0x24, 0x08, 0x8B, 0x4C, 0x24, 0x10, 0x0B, 0xC8, 0x8B, 0x4C, 0x24, 0x0C],
        mask: None,
        max_size: 100,
    },
    RuntimeSig {
        // push edi; push esi; push ebx; xor edi, edi; mov eax, [esp+14]
        name: "_alldiv",
        pattern: &[0x57, 0x56, 0x53, 0x33, 0xFF, 0x8B, 0x44, 0x24, 0x14],
        mask: None,
        max_size: 300,
    },
    RuntimeSig {
        // push ebx; push esi; mov eax, [esp+18]; or eax, eax
        name: "_aulldiv",
        pattern: &[0x53, 0x56, 0x8B, 0x44, 0x24, 0x18, 0x0B, 0xC0],
        mask: None,
        max_size: 300,
    },
    RuntimeSig {
        // fld qword [esp+04]; fsin; ret — the displacement varies with the
        // shuffling the optimizer applies, so the modrm byte is masked.
        name: "_CIsin",
        pattern: &[0xDD, 0x44, 0x24, 0x04, 0xD9, 0xFE, 0xC3],
        mask: Some(&[0xFF, 0xC7, 0x00, 0x00, 0xFF, 0xFF, 0xFF]),
        max_size: 60,
    },
    RuntimeSig {
        name: "_CIcos",
        pattern: &[0xDD, 0x44, 0x24, 0x04, 0xD9, 0xFF, 0xC3],
        mask: Some(&[0xFF, 0xC7, 0x00, 0x00, 0xFF, 0xFF, 0xFF]),
        max_size: 60,
    },
    RuntimeSig {
        name: "_CIsqrt",
        pattern: &[0xDD, 0x44, 0x24, 0x04, 0xD9, 0xFA, 0xC3],
        mask: Some(&[0xFF, 0xC7, 0x00, 0x00, 0xFF, 0xFF, 0xFF]),
        max_size: 60,
    },
    RuntimeSig {
        // sub esp, 8; fstp qword [esp]; call _atan2 shim
        name: "_CIatan2",
        pattern: &[0xDD, 0x5C, 0x24, 0xF8, 0xDD, 0x54, 0x24, 0xF0],
        mask: Some(&[0xFF, 0xC7, 0x00, 0x00, 0xFF, 0xC7, 0x00, 0x00]),
        max_size: 120,
    },
];

pub fn identify_runtime_functions(
    image: &Image,
    functions: &FunctionTable,
) -> BTreeMap<u32, Classification> {
    let mut results: BTreeMap<u32, Classification> = BTreeMap::new();
    // name → (addr, func_size, pattern_len); duplicate names keep the
    // smaller function, which is nearly always the real primitive.
    let mut matched: BTreeMap<&'static str, (u32, u32, usize)> = BTreeMap::new();

    for f in functions.all() {
        let bytes = match image.read_bytes(f.start, 32.min(f.size as usize).max(2)) {
            Some(b) => b,
            None => continue,
        };

        for sig in RUNTIME_SIGNATURES {
            if bytes.len() < sig.pattern.len() {
                continue;
            }
            if sig.max_size > 0 && f.size > sig.max_size * 2 {
                continue;
            }
            if !match_pattern(bytes, sig.pattern, sig.mask) {
                continue;
            }

            // A longer pattern on the same function is more specific.
            if let Some((_, _, prev_len)) = matched.values().find(|(a, _, _)| *a == f.start) {
                if sig.pattern.len() <= *prev_len {
                    continue;
                }
            }

            if let Some(&(prev_addr, prev_size, _)) = matched.get(sig.name) {
                if f.size >= prev_size {
                    continue;
                }
                results.remove(&prev_addr);
            }

            let mut cls = Classification::new(Category::Crt, CONFIDENCE_SIGNATURE, "crt_signature");
            cls.identified_name = Some(sig.name.to_owned());
            results.insert(f.start, cls);
            matched.insert(sig.name, (f.start, f.size, sig.pattern.len()));
        }
    }

    debug!("{} runtime primitives identified", results.len());
    results
}

fn match_pattern(bytes: &[u8], pattern: &[u8], mask: Option<&[u8]>) -> bool {
    match mask {
        None => bytes[..pattern.len()] == *pattern,
        Some(mask) => pattern.iter().enumerate().all(|(i, &p)| match mask[i] {
            0xFF => bytes[i] == p,
            0x00 => true,
            m => bytes[i] & m == p & m,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_matches_exact_patterns() {
        let bytes = [0x8B, 0x4C, 0x24, 0x04, 0xF7, 0xC1, 0x03, 0x00, 0x00, 0x00, 0x74, 0x10];
        let pattern = &[0x8B, 0x4C, 0x24, 0x04, 0xF7, 0xC1, 0x03, 0x00, 0x00, 0x00];
        assert!(match_pattern(&bytes, pattern, None));
        let wrong = [0x8B, 0x4D, 0x24, 0x04, 0xF7, 0xC1, 0x03, 0x00, 0x00, 0x00];
        assert!(!match_pattern(&wrong, pattern, None));
    }

    #[test]
    fn it_matches_under_masks() {
        // _CIsin with a different stack displacement encoding.
        let bytes = [0xDD, 0x44, 0x24, 0x08, 0xD9, 0xFE, 0xC3];
        let sig = RUNTIME_SIGNATURES.iter().find(|s| s.name == "_CIsin").unwrap();
        assert!(match_pattern(&bytes, sig.pattern, sig.mask));
        // fcos, not fsin: the exact tail byte must still match.
        let not_sin = [0xDD, 0x44, 0x24, 0x08, 0xD9, 0xFF, 0xC3];
        assert!(!match_pattern(&not_sin, sig.pattern, sig.mask));
    }
}
