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

//! Virtual-table discovery.
//!
//! A vtable is a run of ≥3 consecutive words in read-only data, each a
//! known function start. Arithmetic progressions and repeated-value runs
//! are data tables, not vtables, and are filtered. Constructors embed the
//! vtable address as a literal (`mov [ecx], offset vtable`).

use crate::{Category, Classification};
use funcs::FunctionTable;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use xbe::Image;

const MIN_VTABLE_ENTRIES: usize = 3;

pub const CONFIDENCE_VTABLE: f64 = 0.85;
pub const CONFIDENCE_CTOR: f64 = 0.80;

fn hex_addr<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

fn hex_addrs<S: serde::Serializer>(v: &[u32], s: S) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeSeq;
    let mut seq = s.serialize_seq(Some(v.len()))?;
    for a in v {
        seq.serialize_element(&format!("0x{a:08X}"))?;
    }
    seq.end()
}

#[derive(Clone, Debug, Serialize)]
pub struct Vtable {
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    #[serde(serialize_with = "hex_addrs")]
    pub entries: Vec<u32>,
    pub class_id: String,
}

pub fn scan_vtables(
    image: &Image,
    functions: &FunctionTable,
    merge_contiguous: bool,
) -> (BTreeMap<u32, Classification>, Vec<Vtable>) {
    let func_starts: BTreeSet<u32> = functions.starts().into_iter().collect();

    let mut vtables = Vec::new();
    let sections: Vec<xbe::Section> = image
        .sections
        .iter()
        .filter(|s| !s.executable() && !s.writable())
        .cloned()
        .collect();
    for sec in &sections {
        let data = image.section_data(sec);
        let mut i = 0usize;
        while i + 4 <= data.len() {
            if i % 4 != 0 {
                i += 4 - (i % 4);
                continue;
            }
            let word = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
            if !func_starts.contains(&word) {
                i += 4;
                continue;
            }

            let mut entries = Vec::new();
            let mut j = i;
            while j + 4 <= data.len() {
                let w = u32::from_le_bytes([data[j], data[j + 1], data[j + 2], data[j + 3]]);
                if func_starts.contains(&w) {
                    entries.push(w);
                    j += 4;
                } else {
                    break;
                }
            }

            if entries.len() >= MIN_VTABLE_ENTRIES && !is_false_positive(&entries) {
                vtables.push(Vtable {
                    address: sec.virtual_addr + i as u32,
                    entries,
                    class_id: String::new(),
                });
                i = j;
            } else {
                i += 4;
            }
        }
    }

    if merge_contiguous {
        vtables = merge_contiguous_tables(vtables);
    }

    for (i, vt) in vtables.iter_mut().enumerate() {
        vt.class_id = format!("cls_{i:03}");
    }
    debug!("{} vtables survive filtering", vtables.len());

    let mut results: BTreeMap<u32, Classification> = BTreeMap::new();
    for vt in &vtables {
        for (idx, &entry) in vt.entries.iter().enumerate() {
            results.entry(entry).or_insert_with(|| {
                let mut cls =
                    Classification::new(Category::GameVtable, CONFIDENCE_VTABLE, "vtable_scan");
                cls.subcategory = Some(vt.class_id.clone());
                cls.vtable_addr = Some(vt.address);
                cls.vtable_index = Some(idx as i32);
                cls
            });
        }
    }

    for (ctor, vt_addr, class_id) in find_constructors(image, functions, &vtables) {
        results.entry(ctor).or_insert_with(|| {
            let mut cls = Classification::new(Category::GameVtable, CONFIDENCE_CTOR, "vtable_ctor");
            cls.subcategory = Some(class_id);
            cls.vtable_addr = Some(vt_addr);
            cls.vtable_index = Some(-1);
            cls
        });
    }

    (results, vtables)
}

/// Tables split only by the minimum-length filter can abut; under the
/// merge policy they collapse into one class.
fn merge_contiguous_tables(vtables: Vec<Vtable>) -> Vec<Vtable> {
    let mut merged: Vec<Vtable> = Vec::with_capacity(vtables.len());
    for vt in vtables {
        if let Some(prev) = merged.last_mut() {
            if prev.address + 4 * prev.entries.len() as u32 == vt.address {
                prev.entries.extend(vt.entries);
                continue;
            }
        }
        merged.push(vt);
    }
    merged
}

/// Reject runs that are actually data tables:
/// repeated single value, short-step arithmetic progressions, and
/// mostly-sequential small-step runs.
fn is_false_positive(entries: &[u32]) -> bool {
    let distinct: BTreeSet<u32> = entries.iter().copied().collect();
    if distinct.len() == 1 {
        return true;
    }

    if entries.len() >= 4 {
        let diffs: Vec<i64> = entries
            .windows(2)
            .map(|w| i64::from(w[1]) - i64::from(w[0]))
            .collect();
        let first = diffs[0];
        if diffs.iter().all(|&d| d == first) && first.abs() <= 16 {
            return true;
        }
    }

    if entries.len() >= 6 {
        let small = entries
            .windows(2)
            .filter(|w| (i64::from(w[1]) - i64::from(w[0])).abs() <= 8)
            .count();
        if small as f64 > entries.len() as f64 * 0.8 {
            return true;
        }
    }

    false
}

/// A function whose bytes contain a vtable's address literal, and which is
/// not itself one of that vtable's methods, is its constructor.
fn find_constructors(
    image: &Image,
    functions: &FunctionTable,
    vtables: &[Vtable],
) -> Vec<(u32, u32, String)> {
    if vtables.is_empty() {
        return Vec::new();
    }
    let methods: BTreeSet<u32> = vtables.iter().flat_map(|v| v.entries.iter().copied()).collect();

    let mut out = Vec::new();
    for f in functions.all() {
        if f.size < 8 || f.size > 8192 {
            continue;
        }
        let bytes = match image.read_bytes(f.start, f.size as usize) {
            Some(b) => b,
            None => continue,
        };

        'vt: for vt in vtables {
            let needle = vt.address.to_le_bytes();
            if bytes.windows(4).any(|w| w == needle) {
                if !methods.contains(&f.start) {
                    out.push((f.start, vt.address, vt.class_id.clone()));
                }
                break 'vt;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_filters_progressions_and_constants() {
        assert!(is_false_positive(&[0x1000, 0x1000, 0x1000]));
        assert!(is_false_positive(&[0x1000, 0x1004, 0x1008, 0x100C]));
        assert!(!is_false_positive(&[0x1000, 0x1400, 0x1100]));
        // Large constant step is believable as three distinct methods.
        assert!(!is_false_positive(&[0x1000, 0x1100, 0x1200]));
    }
}
