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

//! JSON database writers. One document per analysis product; record
//! fields and ordering are stable so repeated runs produce identical
//! bytes.

use crate::Databases;
use anyhow::Result;
use log::info;
use serde::Serialize;
use std::collections::BTreeMap;
use std::{fs::File, io::BufWriter, io::Write, path::Path};

fn write_json<T: Serialize>(out_dir: &Path, name: &str, value: &T) -> Result<()> {
    let mut w = BufWriter::new(File::create(out_dir.join(name))?);
    serde_json::to_writer_pretty(&mut w, value)?;
    writeln!(w)?;
    Ok(())
}

#[derive(Serialize)]
struct IdentifiedFunction<'a> {
    start: String,
    end: String,
    size: u32,
    name: &'a str,
    section: &'a str,
    category: String,
    confidence: f64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subcategory: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identified_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stub_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vtable_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vtable_index: Option<i32>,
}

#[derive(Serialize)]
struct Summary<'a> {
    base_address: String,
    entry_point: String,
    total_instructions: usize,
    decode_gap_bytes: u64,
    reachable_instructions: usize,
    total_labels: usize,
    total_strings: usize,
    total_xrefs: usize,
    xrefs_by_kind: BTreeMap<String, usize>,
    functions: funcs::FunctionSummary,
    identification: &'a ident::IdentSummary,
    abi: abi::AbiSummary,
    globals: &'a globals::GlobalsSummary,
    vtables: usize,
}

/// Write every output document for an analysis run.
pub fn write_databases(db: &Databases, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)?;

    let functions: Vec<_> = db.functions.all().collect();
    write_json(out_dir, "functions.json", &functions)?;

    let labels: Vec<_> = db.labels.all().collect();
    write_json(out_dir, "labels.json", &labels)?;

    let xrefs: Vec<_> = db.xrefs.all().collect();
    write_json(out_dir, "xrefs.json", &xrefs)?;

    write_json(out_dir, "strings.json", &db.strings)?;

    let identified: Vec<IdentifiedFunction> = db
        .functions
        .all()
        .map(|f| {
            let cls = db.identification.classifications.get(&f.start);
            IdentifiedFunction {
                start: format!("0x{:08X}", f.start),
                end: format!("0x{:08X}", f.end),
                size: f.size,
                name: &f.name,
                section: &f.section,
                category: cls
                    .map(|c| c.category.key())
                    .unwrap_or_else(|| "unknown".to_owned()),
                confidence: cls.map(|c| c.confidence).unwrap_or(0.0),
                method: cls.map(|c| c.method).unwrap_or("none"),
                subcategory: cls.and_then(|c| c.subcategory.as_deref()),
                module: cls.and_then(|c| c.module.as_deref()),
                source_file: cls.and_then(|c| c.source_file.as_deref()),
                identified_name: cls.and_then(|c| c.identified_name.as_deref()),
                stub_type: cls.and_then(|c| c.stub_type.as_deref()),
                vtable_addr: cls
                    .and_then(|c| c.vtable_addr)
                    .map(|a| format!("0x{a:08X}")),
                vtable_index: cls.and_then(|c| c.vtable_index),
            }
        })
        .collect();
    write_json(out_dir, "identified_functions.json", &identified)?;

    let abi_records: Vec<_> = db.abi.records.values().collect();
    write_json(out_dir, "abi_functions.json", &abi_records)?;

    let globals: Vec<_> = db.globals.globals.values().collect();
    write_json(out_dir, "globals.json", &globals)?;

    write_json(out_dir, "structures.json", &db.globals.structures)?;

    write_json(out_dir, "vtables.json", &db.identification.vtables)?;

    let xrefs_by_kind: BTreeMap<String, usize> = db
        .xrefs
        .count_by_kind()
        .into_iter()
        .map(|(k, v)| (k.key().to_owned(), v))
        .collect();
    let summary = Summary {
        base_address: format!("0x{:08X}", db.image.base_address),
        entry_point: format!("0x{:08X}", db.image.entry_point),
        total_instructions: db.engine.len(),
        decode_gap_bytes: db.engine.decode_gaps,
        reachable_instructions: db.reachable_instructions,
        total_labels: db.labels.len(),
        total_strings: db.strings.len(),
        total_xrefs: db.xrefs.len(),
        xrefs_by_kind,
        functions: db.functions.summary(),
        identification: &db.identification.summary,
        abi: db.abi.summary(),
        globals: &db.globals.summary,
        vtables: db.identification.vtables.len(),
    };
    write_json(out_dir, "summary.json", &summary)?;

    info!("wrote analysis databases to {}", out_dir.display());
    Ok(())
}
