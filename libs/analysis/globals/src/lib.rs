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

//! Global-variable discovery and structure grouping.
//!
//! Every data-section address referenced from code becomes a candidate
//! global. Widths come from address gaps constrained by alignment;
//! classification and importance come from the accessors' categories and
//! access counts. Contiguous runs of globals sharing an accessor become
//! structure candidates.

use funcs::FunctionTable;
use ident::Identification;
use labels::StringRef;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use xbe::Image;
use xrefs::{XrefIndex, XrefKind};

const MAX_STRUCT_FIELD_GAP: u32 = 0x100;
const MIN_STRUCT_FIELDS: usize = 3;

fn hex_addr<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Serialize)]
pub struct NearbyString {
    pub address: String,
    pub offset: i32,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Global {
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    pub section: String,
    pub classification: String,
    pub importance: Importance,
    pub inferred_size: u32,
    pub read_count: u32,
    pub write_count: u32,
    pub num_accessors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearby_string: Option<NearbyString>,
    #[serde(skip)]
    pub accessor_functions: BTreeSet<u32>,
    #[serde(skip)]
    pub accessor_categories: BTreeMap<String, u32>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StructField {
    pub offset: u32,
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    pub size: u32,
    pub read_count: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct StructCandidate {
    #[serde(serialize_with = "hex_addr")]
    pub base_address: u32,
    pub total_size: u32,
    pub num_fields: usize,
    pub fields: Vec<StructField>,
    #[serde(serialize_with = "hex_addr")]
    pub primary_accessor: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct GlobalsSummary {
    pub total_globals: usize,
    pub by_section: BTreeMap<String, usize>,
    pub by_classification: BTreeMap<String, usize>,
    pub by_importance: BTreeMap<String, usize>,
    pub structures_found: usize,
    pub total_struct_fields: usize,
    pub bss_globals: usize,
    /// Addresses of the hottest globals, capped.
    pub high_importance: Vec<String>,
}

pub struct GlobalsDatabase {
    pub globals: BTreeMap<u32, Global>,
    pub structures: Vec<StructCandidate>,
    pub summary: GlobalsSummary,
}

/// Run the whole mapping pass.
pub fn map_globals(
    image: &Image,
    functions: &FunctionTable,
    identification: &Identification,
    xref_index: &XrefIndex,
    strings: &[StringRef],
) -> GlobalsDatabase {
    let mut globals = collect_from_xrefs(image, functions, identification, xref_index);
    debug!("{} candidate globals", globals.len());

    infer_sizes(&mut globals);
    read_initial_values(image, &mut globals);
    cross_reference_strings(&mut globals, strings);
    classify(&mut globals);
    let structures = detect_structures(&globals);
    let summary = build_summary(&globals, &structures);

    GlobalsDatabase {
        globals,
        structures,
        summary,
    }
}

fn collect_from_xrefs(
    image: &Image,
    functions: &FunctionTable,
    identification: &Identification,
    xref_index: &XrefIndex,
) -> BTreeMap<u32, Global> {
    let mut globals: BTreeMap<u32, Global> = BTreeMap::new();

    for xref in xref_index.all() {
        let is_write = match xref.kind {
            XrefKind::DataRead => false,
            XrefKind::DataWrite => true,
            _ => continue,
        };
        let section = match image.section_at(xref.to_addr) {
            Some(s) if !s.executable() => s.name.clone(),
            _ => continue,
        };

        let accessor = functions.containing(xref.from_addr).map(|f| f.start);
        let category = accessor
            .map(|a| identification.category_of(a).key())
            .unwrap_or_else(|| "unknown".to_owned());

        let entry = globals.entry(xref.to_addr).or_insert_with(|| Global {
            address: xref.to_addr,
            section,
            classification: "unknown".to_owned(),
            importance: Importance::Low,
            inferred_size: 4,
            read_count: 0,
            write_count: 0,
            num_accessors: 0,
            initial_value: None,
            string_ref: None,
            nearby_string: None,
            accessor_functions: BTreeSet::new(),
            accessor_categories: BTreeMap::new(),
        });
        if is_write {
            entry.write_count += 1;
        } else {
            entry.read_count += 1;
        }
        if let Some(a) = accessor {
            entry.accessor_functions.insert(a);
            *entry.accessor_categories.entry(category).or_insert(0) += 1;
        }
    }

    for g in globals.values_mut() {
        g.num_accessors = g.accessor_functions.len();
    }
    globals
}

/// The gap to the next global bounds the width; the address's own
/// alignment bounds it further.
fn infer_sizes(globals: &mut BTreeMap<u32, Global>) {
    let addrs: Vec<u32> = globals.keys().copied().collect();
    for (i, &addr) in addrs.iter().enumerate() {
        let gap = addrs
            .get(i + 1)
            .map(|next| next - addr)
            .unwrap_or(256);

        let mut size = match gap {
            0..=1 => 1,
            2 => 2,
            3..=4 => 4,
            8 => 8,
            5..=7 => 4,
            9..=16 => 8,
            _ => 4,
        };

        if size > 1 && addr % size != 0 {
            size = if addr % 4 == 0 {
                4
            } else if addr % 2 == 0 {
                2
            } else {
                1
            };
        }
        // An 8-byte slot still needs 8-byte alignment.
        if size == 8 && addr % 8 != 0 {
            size = 4;
        }

        globals.get_mut(&addr).unwrap().inferred_size = size;
    }
}

/// Initial values come from the file when the VA has backing bytes. The
/// zero-fill tail of the data section reads as zero.
fn read_initial_values(image: &Image, globals: &mut BTreeMap<u32, Global>) {
    for g in globals.values_mut() {
        let value = match image.read_bytes(g.address, g.inferred_size as usize) {
            Some(bytes) => {
                let mut v = 0u64;
                for (i, &b) in bytes.iter().enumerate() {
                    v |= u64::from(b) << (8 * i);
                }
                Some(v)
            }
            None => {
                // In-section but unbacked: BSS, initialized to zero.
                image.section_at(g.address).map(|_| 0)
            }
        };
        g.initial_value = value;
    }
}

fn cross_reference_strings(globals: &mut BTreeMap<u32, Global>, strings: &[StringRef]) {
    let by_addr: BTreeMap<u32, &StringRef> = strings.iter().map(|s| (s.address, s)).collect();
    for g in globals.values_mut() {
        if let Some(s) = by_addr.get(&g.address) {
            g.string_ref = Some(s.text.clone());
            continue;
        }
        for offset in (-64i32..=64).step_by(4) {
            let nearby = g.address.wrapping_add(offset as u32);
            if let Some(s) = by_addr.get(&nearby) {
                g.nearby_string = Some(NearbyString {
                    address: format!("0x{nearby:08X}"),
                    offset,
                    text: s.text.clone(),
                });
                break;
            }
        }
    }
}

fn classify(globals: &mut BTreeMap<u32, Global>) {
    for g in globals.values_mut() {
        let primary = g
            .accessor_categories
            .iter()
            .max_by_key(|(_, &c)| c)
            .map(|(cat, _)| cat.clone());

        let mut classification = match primary.as_deref() {
            None => "unreferenced".to_owned(),
            Some(cat) if cat.starts_with("rw_") => "rw_internal".to_owned(),
            Some("data_init") => "game_parameter".to_owned(),
            Some("game_engine") => "engine_state".to_owned(),
            Some("game_vtable") => "object_data".to_owned(),
            Some("game_vehicle") => "vehicle_data".to_owned(),
            Some("game_audio") => "audio_data".to_owned(),
            Some("game_render") => "render_data".to_owned(),
            Some("game_physics") => "physics_data".to_owned(),
            Some("game_ui") => "ui_data".to_owned(),
            Some("game_network") => "network_data".to_owned(),
            Some("game_camera") => "camera_data".to_owned(),
            Some("game_io") => "io_data".to_owned(),
            Some("game_input") => "input_data".to_owned(),
            Some("game_video") => "video_data".to_owned(),
            Some("crt") => "crt_internal".to_owned(),
            Some("unknown") => {
                if g.read_count > 50 {
                    "game_constant".to_owned()
                } else {
                    "game_data".to_owned()
                }
            }
            Some(_) => "game_data".to_owned(),
        };

        // Read-only data is constant by construction.
        if g.section == ".rdata" {
            classification = classification.replace("_data", "_const");
            if classification == "game_parameter" {
                classification = "game_const".to_owned();
            }
        }
        g.classification = classification;

        g.importance = if g.read_count >= 100 && g.accessor_functions.len() >= 10 {
            Importance::High
        } else if g.read_count >= 20 || g.accessor_functions.len() >= 5 {
            Importance::Medium
        } else {
            Importance::Low
        };
    }
}

/// Group globals by accessor function, split runs at large gaps, and keep
/// runs of at least three fields. Deduplicated by (base, field count).
fn detect_structures(globals: &BTreeMap<u32, Global>) -> Vec<StructCandidate> {
    let mut by_accessor: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for g in globals.values() {
        if g.section != ".data" {
            continue;
        }
        for &f in &g.accessor_functions {
            by_accessor.entry(f).or_default().push(g.address);
        }
    }

    // Largest groups first, so the most-connected accessor claims a run.
    let mut order: Vec<(u32, Vec<u32>)> = by_accessor.into_iter().collect();
    order.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

    let mut structures = Vec::new();
    let mut seen: BTreeSet<(u32, usize)> = BTreeSet::new();

    for (accessor, mut addrs) in order {
        if addrs.len() < MIN_STRUCT_FIELDS {
            continue;
        }
        addrs.sort_unstable();
        addrs.dedup();

        let mut runs: Vec<Vec<u32>> = Vec::new();
        let mut current = vec![addrs[0]];
        for pair in addrs.windows(2) {
            if pair[1] - pair[0] <= MAX_STRUCT_FIELD_GAP {
                current.push(pair[1]);
            } else {
                runs.push(std::mem::replace(&mut current, vec![pair[1]]));
            }
        }
        runs.push(current);

        for run in runs {
            if run.len() < MIN_STRUCT_FIELDS {
                continue;
            }
            let base = run[0];
            if !seen.insert((base, run.len())) {
                continue;
            }
            let fields: Vec<StructField> = run
                .iter()
                .map(|&addr| {
                    let g = &globals[&addr];
                    StructField {
                        offset: addr - base,
                        address: addr,
                        size: g.inferred_size,
                        read_count: g.read_count,
                    }
                })
                .collect();
            let last = &globals[run.last().unwrap()];
            structures.push(StructCandidate {
                base_address: base,
                total_size: last.address - base + last.inferred_size,
                num_fields: fields.len(),
                fields,
                primary_accessor: accessor,
            });
        }
    }

    structures.sort_by(|a, b| {
        b.total_size
            .cmp(&a.total_size)
            .then(a.base_address.cmp(&b.base_address))
    });
    structures
}

fn build_summary(
    globals: &BTreeMap<u32, Global>,
    structures: &[StructCandidate],
) -> GlobalsSummary {
    let mut summary = GlobalsSummary {
        total_globals: globals.len(),
        structures_found: structures.len(),
        total_struct_fields: structures.iter().map(|s| s.fields.len()).sum(),
        ..Default::default()
    };
    for g in globals.values() {
        *summary.by_section.entry(g.section.clone()).or_insert(0) += 1;
        *summary
            .by_classification
            .entry(g.classification.clone())
            .or_insert(0) += 1;
        *summary
            .by_importance
            .entry(format!("{:?}", g.importance).to_lowercase())
            .or_insert(0) += 1;
        if g.section == ".data" && g.initial_value == Some(0) {
            summary.bss_globals += 1;
        }
        if g.importance == Importance::High && summary.high_importance.len() < 50 {
            summary.high_importance.push(format!("0x{:08X}", g.address));
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(addr: u32, section: &str) -> Global {
        Global {
            address: addr,
            section: section.to_owned(),
            classification: "unknown".to_owned(),
            importance: Importance::Low,
            inferred_size: 4,
            read_count: 0,
            write_count: 0,
            num_accessors: 0,
            initial_value: None,
            string_ref: None,
            nearby_string: None,
            accessor_functions: BTreeSet::new(),
            accessor_categories: BTreeMap::new(),
        }
    }

    #[test]
    fn it_infers_sizes_from_gaps_and_alignment() {
        let mut globals = BTreeMap::new();
        for addr in [0x1000u32, 0x1001, 0x1002, 0x1004, 0x100C, 0x2000] {
            globals.insert(addr, global(addr, ".data"));
        }
        infer_sizes(&mut globals);
        assert_eq!(globals[&0x1000].inferred_size, 1); // next at +1
        assert_eq!(globals[&0x1001].inferred_size, 1); // odd address
        assert_eq!(globals[&0x1002].inferred_size, 2); // next at +2
        assert_eq!(globals[&0x1004].inferred_size, 4); // +8 gap but only 4-aligned
        assert_eq!(globals[&0x100C].inferred_size, 4); // big gap
        assert_eq!(globals[&0x2000].inferred_size, 4); // last
        // Every inferred size divides its address.
        for g in globals.values() {
            assert_eq!(g.address % g.inferred_size, 0);
        }
    }

    #[test]
    fn it_applies_importance_thresholds() {
        let mut globals = BTreeMap::new();
        let mut hot = global(0x1000, ".data");
        hot.read_count = 150;
        for i in 0..12 {
            hot.accessor_functions.insert(0x11000 + i * 0x10);
        }
        hot.accessor_categories.insert("game_vehicle".to_owned(), 150);
        globals.insert(0x1000, hot);

        let mut warm = global(0x1010, ".data");
        warm.read_count = 25;
        warm.accessor_categories.insert("unknown".to_owned(), 25);
        globals.insert(0x1010, warm);

        let cold = global(0x1020, ".data");
        globals.insert(0x1020, cold);

        classify(&mut globals);
        assert_eq!(globals[&0x1000].importance, Importance::High);
        assert_eq!(globals[&0x1000].classification, "vehicle_data");
        assert_eq!(globals[&0x1010].importance, Importance::Medium);
        assert_eq!(globals[&0x1020].importance, Importance::Low);
        assert_eq!(globals[&0x1020].classification, "unreferenced");
    }

    #[test]
    fn it_substitutes_const_for_rdata() {
        let mut globals = BTreeMap::new();
        let mut g = global(0x3000, ".rdata");
        g.accessor_categories.insert("game_render".to_owned(), 3);
        g.read_count = 3;
        globals.insert(0x3000, g);
        classify(&mut globals);
        assert_eq!(globals[&0x3000].classification, "render_const");
    }

    #[test]
    fn it_groups_structures_by_accessor() {
        let mut globals = BTreeMap::new();
        // Three contiguous fields touched by the same function, then a
        // far-away loner.
        for addr in [0x1000u32, 0x1004, 0x1008, 0x5000] {
            let mut g = global(addr, ".data");
            g.accessor_functions.insert(0x11000);
            g.read_count = 2;
            globals.insert(addr, g);
        }
        infer_sizes(&mut globals);
        let structures = detect_structures(&globals);
        assert_eq!(structures.len(), 1);
        let s = &structures[0];
        assert_eq!(s.base_address, 0x1000);
        assert_eq!(s.num_fields, 3);
        assert_eq!(s.fields[0].offset, 0);
        assert_eq!(s.fields[2].offset, 8);
        // Fields are strictly increasing and stay inside the footprint.
        for w in s.fields.windows(2) {
            assert!(w[0].offset < w[1].offset);
        }
        let last = s.fields.last().unwrap();
        assert!(last.address + last.size <= s.base_address + s.total_size);
    }
}
