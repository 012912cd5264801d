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

//! Function identification: which functions are middleware library code,
//! compiler runtime, generated data-initialization stubs, virtual-table
//! methods, or game code — and for game code, which subsystem.
//!
//! Phases run strongest-evidence-first; a later phase never overwrites an
//! earlier classification.

mod imm_scan;
mod library;
mod propagate;
mod runtime;
mod stubs;
mod vtables;

pub use crate::vtables::Vtable;

use funcs::FunctionTable;
use labels::StringRef;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use xbe::Image;
use xrefs::XrefIndex;

fn hex_addr_opt<S: serde::Serializer>(v: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
    match v {
        Some(v) => s.serialize_str(&format!("0x{v:08X}")),
        None => s.serialize_none(),
    }
}

/// Middleware library subsystem, keyed off the source path embedded in the
/// per-translation-unit ID string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RwArea {
    Core,
    Plcore,
    Pipeline,
    Driver,
    World,
    Unknown,
}

impl RwArea {
    pub fn key(&self) -> &'static str {
        match self {
            RwArea::Core => "core",
            RwArea::Plcore => "plcore",
            RwArea::Pipeline => "pipeline",
            RwArea::Driver => "driver",
            RwArea::World => "world",
            RwArea::Unknown => "unknown",
        }
    }

    /// Classify a library source path by prefix.
    pub fn from_path(path: &str) -> RwArea {
        if path.starts_with("src/plcore") {
            RwArea::Plcore
        } else if path.starts_with("src/pipe") {
            RwArea::Pipeline
        } else if path.starts_with("driver") {
            RwArea::Driver
        } else if path.starts_with("world") {
            RwArea::World
        } else if path.starts_with("src") {
            RwArea::Core
        } else {
            RwArea::Unknown
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GameArea {
    Engine,
    Vehicle,
    Audio,
    Render,
    Physics,
    Ui,
    Network,
    Camera,
    Io,
    Input,
    Video,
}

impl GameArea {
    pub fn key(&self) -> &'static str {
        match self {
            GameArea::Engine => "engine",
            GameArea::Vehicle => "vehicle",
            GameArea::Audio => "audio",
            GameArea::Render => "render",
            GameArea::Physics => "physics",
            GameArea::Ui => "ui",
            GameArea::Network => "network",
            GameArea::Camera => "camera",
            GameArea::Io => "io",
            GameArea::Input => "input",
            GameArea::Video => "video",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Category {
    Rw(RwArea),
    Crt,
    DataInit,
    GameVtable,
    Game(GameArea),
    Unknown,
}

impl Category {
    pub fn key(&self) -> String {
        match self {
            Category::Rw(area) => format!("rw_{}", area.key()),
            Category::Crt => "crt".to_owned(),
            Category::DataInit => "data_init".to_owned(),
            Category::GameVtable => "game_vtable".to_owned(),
            Category::Game(area) => format!("game_{}", area.key()),
            Category::Unknown => "unknown".to_owned(),
        }
    }

    #[inline]
    pub fn is_library(&self) -> bool {
        matches!(self, Category::Rw(_))
    }
}

impl Serialize for Category {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.key())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Classification {
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subcategory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// Named runtime primitive, when the byte signature knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identified_name: Option<String>,
    pub confidence: f64,
    pub method: &'static str,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "hex_addr_opt"
    )]
    pub vtable_addr: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vtable_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stub_type: Option<String>,
}

impl Classification {
    fn new(category: Category, confidence: f64, method: &'static str) -> Self {
        Self {
            category,
            subcategory: None,
            module: None,
            source_file: None,
            identified_name: None,
            confidence,
            method,
            vtable_addr: None,
            vtable_index: None,
            stub_type: None,
        }
    }
}

/// Per-module bookkeeping for the library identifier.
#[derive(Clone, Debug, Serialize)]
pub struct RwModule {
    #[serde(serialize_with = "crate::hex_addr_ser")]
    pub address: u32,
    pub category: Category,
    pub path: String,
    pub num_functions: usize,
}

fn hex_addr_ser<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

#[derive(Clone, Debug, Serialize, Default)]
pub struct IdentSummary {
    pub total_functions: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_method: BTreeMap<String, usize>,
    pub library_total: usize,
    pub crt_total: usize,
    pub data_init_total: usize,
    pub game_total: usize,
    pub vtable_methods: usize,
    pub unknown_total: usize,
}

pub struct Identification {
    pub classifications: BTreeMap<u32, Classification>,
    pub vtables: Vec<Vtable>,
    pub modules: BTreeMap<String, RwModule>,
    pub summary: IdentSummary,
}

impl Identification {
    pub fn category_of(&self, addr: u32) -> Category {
        self.classifications
            .get(&addr)
            .map(|c| c.category)
            .unwrap_or(Category::Unknown)
    }
}

/// Policy knobs for identification behaviors the evidence cannot settle.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentOptions {
    /// Merge contiguous vtable candidates into one table instead of
    /// keeping them as separate classes.
    pub merge_prefix_vtables: bool,
}

/// Run the whole identification stack over a detected function table.
pub fn identify(
    image: &Image,
    functions: &FunctionTable,
    strings: &[StringRef],
    xref_index: &XrefIndex,
) -> Identification {
    identify_with_options(image, functions, strings, xref_index, &IdentOptions::default())
}

pub fn identify_with_options(
    image: &Image,
    functions: &FunctionTable,
    strings: &[StringRef],
    xref_index: &XrefIndex,
    options: &IdentOptions,
) -> Identification {
    // Phase 1: immediate-operand scan merged with data-read edges gives
    // one data-address → referencing-functions index.
    let imm_refs = imm_scan::scan_immediate_refs(image, functions, xref_index);
    debug!("{} data addresses referenced from code", imm_refs.len());

    // Phase 2: library ID strings, zones, and region expansion.
    let (mut classifications, modules) =
        library::identify_library_functions(image, functions, strings, &imm_refs);
    info!("library identification: {} functions", classifications.len());

    // Phase 3: runtime byte signatures. A library classification wins over
    // a signature match on the same function.
    let runtime_hits = runtime::identify_runtime_functions(image, functions);
    let mut crt_count = 0;
    for (addr, cls) in runtime_hits {
        if !classifications.contains_key(&addr) {
            classifications.insert(addr, cls);
            crt_count += 1;
        }
    }
    info!("runtime identification: {crt_count} functions");

    // Phase 4: virtual tables and their constructors.
    let (vtable_hits, vtables) =
        vtables::scan_vtables(image, functions, options.merge_prefix_vtables);
    for (addr, cls) in vtable_hits {
        classifications.entry(addr).or_insert(cls);
    }
    info!("{} vtables", vtables.len());

    // Phase 5: propagation through the call graph, proximity, platform
    // sections, and string keywords.
    let propagated = propagate::propagate_labels(
        image,
        functions,
        &classifications,
        &imm_refs,
        strings,
    );
    for (addr, cls) in propagated {
        classifications.entry(addr).or_insert(cls);
    }

    // Phase 6: generated data-initialization stubs.
    let stub_hits = stubs::classify_stubs(image, functions);
    for (addr, cls) in stub_hits {
        classifications.entry(addr).or_insert(cls);
    }

    let summary = build_summary(functions, &classifications);
    Identification {
        classifications,
        vtables,
        modules,
        summary,
    }
}

fn build_summary(
    functions: &FunctionTable,
    classifications: &BTreeMap<u32, Classification>,
) -> IdentSummary {
    let mut summary = IdentSummary {
        total_functions: functions.len(),
        ..Default::default()
    };
    for f in functions.all() {
        let (key, method) = match classifications.get(&f.start) {
            Some(c) => (c.category.key(), c.method),
            None => ("unknown".to_owned(), "none"),
        };
        *summary.by_category.entry(key.clone()).or_insert(0) += 1;
        *summary.by_method.entry(method.to_owned()).or_insert(0) += 1;
        if key.starts_with("rw_") {
            summary.library_total += 1;
        } else if key.starts_with("game_") && key != "game_vtable" {
            summary.game_total += 1;
        }
        match key.as_str() {
            "crt" => summary.crt_total += 1,
            "data_init" => summary.data_init_total += 1,
            "unknown" => summary.unknown_total += 1,
            _ => {}
        }
        if matches!(
            classifications.get(&f.start).map(|c| c.method),
            Some("vtable_scan") | Some("vtable_ctor")
        ) {
            summary.vtable_methods += 1;
        }
    }
    summary
}
