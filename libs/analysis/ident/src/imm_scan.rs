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

//! Immediate-operand scan.
//!
//! `push imm32` and `mov r32, imm32` carry data addresses the xref pass
//! never sees (it only tracks memory operands). A raw byte scan over the
//! executable sections catches them; the result is merged with the data
//! edges into one data-address → referencing-functions index.

use funcs::FunctionTable;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use xbe::Image;
use xrefs::{XrefIndex, XrefKind};

pub type ImmRefs = BTreeMap<u32, BTreeSet<u32>>;

fn in_data_section(image: &Image, va: u32) -> bool {
    image
        .section_at(va)
        .map(|s| !s.executable())
        .unwrap_or(false)
}

pub fn scan_immediate_refs(
    image: &Image,
    functions: &FunctionTable,
    xref_index: &XrefIndex,
) -> ImmRefs {
    let mut refs: ImmRefs = BTreeMap::new();
    let mut total = 0usize;

    let sections: Vec<xbe::Section> = image.sections_code().cloned().collect();
    for sec in &sections {
        let data = image.section_data(sec);
        let va = sec.virtual_addr;
        if data.len() < 5 {
            continue;
        }
        let mut i = 0usize;
        while i < data.len() - 5 {
            let b = data[i];
            // push imm32, or mov r32, imm32 (B8..BF).
            if b == 0x68 || (0xB8..=0xBF).contains(&b) {
                let imm = u32::from_le_bytes([
                    data[i + 1],
                    data[i + 2],
                    data[i + 3],
                    data[i + 4],
                ]);
                if in_data_section(image, imm) {
                    if let Some(f) = functions.containing(va + i as u32) {
                        refs.entry(imm).or_default().insert(f.start);
                        total += 1;
                    }
                }
                i += 5;
                continue;
            }
            i += 1;
        }
    }
    debug!("immediate scan: {total} references");

    // Fold in the tracked data edges.
    let mut merged = 0usize;
    for xref in xref_index.all() {
        if !matches!(xref.kind, XrefKind::DataRead | XrefKind::DataWrite) {
            continue;
        }
        if !in_data_section(image, xref.to_addr) {
            continue;
        }
        if let Some(f) = functions.containing(xref.from_addr) {
            if refs.entry(xref.to_addr).or_default().insert(f.start) {
                merged += 1;
            }
        }
    }
    debug!("merged {merged} data-edge references");

    refs
}
