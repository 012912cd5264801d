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

//! Generated parameter-initializer stubs.
//!
//! The game's data-driven tuning system emits thousands of tiny functions
//! that move or combine scalar floats between read-only constants and
//! globals. Each is a chain of 8-byte instructions — SSE prefix, opcode,
//! a `05` modrm (flat displacement), 4-byte address — ending in one `ret`.

use crate::{Category, Classification};
use funcs::FunctionTable;
use log::debug;
use std::collections::BTreeMap;
use xbe::Image;

// Scalar-float opcode set: movss load/store, add, mul, sub, div, sqrt,
// min, max.
const SSE_SCALAR_OPS: &[u8] = &[0x10, 0x11, 0x58, 0x59, 0x5C, 0x5E, 0x51, 0x5D, 0x5F];

const CONFIDENCE_FLOAT: f64 = 0.99;
const CONFIDENCE_DOUBLE: f64 = 0.95;

fn chain_length(bytes: &[u8], prefix: u8) -> Option<usize> {
    if bytes.len() % 8 != 1 || *bytes.last()? != 0xC3 {
        return None;
    }
    let ops = bytes.len() / 8;
    if ops < 2 {
        return None;
    }
    for i in 0..ops {
        let g = &bytes[i * 8..i * 8 + 8];
        if g[0] != prefix || g[1] != 0x0F || !SSE_SCALAR_OPS.contains(&g[2]) || g[3] != 0x05 {
            return None;
        }
    }
    Some(ops)
}

pub fn classify_stubs(image: &Image, functions: &FunctionTable) -> BTreeMap<u32, Classification> {
    let mut results = BTreeMap::new();
    let mut float_copies = 0usize;
    let mut float_chains = 0usize;
    let mut double_ops = 0usize;

    for f in functions.all() {
        let bytes = match image.read_bytes(f.start, f.size as usize) {
            Some(b) => b,
            None => continue,
        };

        let (stub_type, confidence) = if let Some(ops) = chain_length(bytes, 0xF3) {
            if ops == 2 {
                float_copies += 1;
                ("float_copy", CONFIDENCE_FLOAT)
            } else {
                float_chains += 1;
                ("float_chain", CONFIDENCE_FLOAT)
            }
        } else if chain_length(bytes, 0xF2).is_some() {
            double_ops += 1;
            ("double_op", CONFIDENCE_DOUBLE)
        } else {
            continue;
        };

        let mut cls = Classification::new(Category::DataInit, confidence, "stub_pattern");
        cls.stub_type = Some(stub_type.to_owned());
        results.insert(f.start, cls);
    }

    debug!(
        "data-init stubs: {float_copies} float copies, {float_chains} float chains, {double_ops} double ops"
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_recognizes_float_copy_chains() {
        // movss xmm0, [a]; movss [b], xmm0; ret
        let copy = [
            0xF3, 0x0F, 0x10, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, //
            0xF3, 0x0F, 0x11, 0x05, 0x11, 0x22, 0x33, 0x44, //
            0xC3,
        ];
        assert_eq!(chain_length(&copy, 0xF3), Some(2));
        assert_eq!(chain_length(&copy, 0xF2), None);
    }

    #[test]
    fn it_recognizes_longer_compute_chains() {
        // load, mul, store: three operations.
        let chain = [
            0xF3, 0x0F, 0x10, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, //
            0xF3, 0x0F, 0x59, 0x05, 0x01, 0x02, 0x03, 0x04, //
            0xF3, 0x0F, 0x11, 0x05, 0x11, 0x22, 0x33, 0x44, //
            0xC3,
        ];
        assert_eq!(chain_length(&chain, 0xF3), Some(3));
    }

    #[test]
    fn it_rejects_non_chains() {
        // Register-register modrm in the second group.
        let bad = [
            0xF3, 0x0F, 0x10, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, //
            0xF3, 0x0F, 0x59, 0xC1, 0x01, 0x02, 0x03, 0x04, //
            0xC3,
        ];
        assert_eq!(chain_length(&bad, 0xF3), None);
        // One operation only.
        let short = [0xF3, 0x0F, 0x10, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, 0xC3];
        assert_eq!(chain_length(&short, 0xF3), None);
        // No terminating ret.
        let no_ret = [
            0xF3, 0x0F, 0x10, 0x05, 0xAA, 0xBB, 0xCC, 0xDD, //
            0xF3, 0x0F, 0x11, 0x05, 0x11, 0x22, 0x33, 0x44, //
            0x90,
        ];
        assert_eq!(chain_length(&no_ret, 0xF3), None);
    }
}
