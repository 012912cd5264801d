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

//! Middleware library identification via embedded source-file ID strings.
//!
//! The library embeds one `$Id:` string per translation unit. The strings
//! pin down library read-only data; functions referencing that data are
//! library code. Identification proceeds from exact string references
//! through capped zones to a bootstrapped data/code region.

use crate::imm_scan::ImmRefs;
use crate::{Category, Classification, RwArea, RwModule};
use funcs::FunctionTable;
use labels::StringRef;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use std::collections::BTreeMap;
use xbe::Image;

// Zones around ID strings are capped so a string at the end of a module's
// data does not claim the whole next module.
const MAX_ZONE_SIZE: u32 = 0x400;

// Padding around the inferred library data region.
const REGION_PADDING: u32 = 0x1000;

pub const CONFIDENCE_STRING_REF: f64 = 0.95;
pub const CONFIDENCE_ZONE: f64 = 0.85;
pub const CONFIDENCE_DATA_REGION: f64 = 0.80;
pub const CONFIDENCE_CODE_REGION: f64 = 0.75;

lazy_static! {
    static ref ID_STRING: Regex =
        Regex::new(r"@@?\(?#\)?\$Id:\s*//RenderWare/RW36Active/rwsdk/(.+?)#\d+\s*\$").unwrap();
}

#[derive(Clone, Debug)]
struct IdString {
    address: u32,
    path: String,
    filename: String,
    area: RwArea,
}

#[derive(Clone, Debug)]
struct Zone {
    start: u32,
    end: u32,
    filename: String,
    path: String,
    area: RwArea,
}

pub fn identify_library_functions(
    image: &Image,
    functions: &FunctionTable,
    strings: &[StringRef],
    imm_refs: &ImmRefs,
) -> (BTreeMap<u32, Classification>, BTreeMap<String, RwModule>) {
    let id_strings = parse_id_strings(strings);
    debug!("{} library ID strings", id_strings.len());

    let mut results: BTreeMap<u32, Classification> = BTreeMap::new();
    let mut modules: BTreeMap<String, RwModule> = BTreeMap::new();
    let mut module_funcs: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for s in &id_strings {
        modules.insert(
            s.filename.clone(),
            RwModule {
                address: s.address,
                category: Category::Rw(s.area),
                path: s.path.clone(),
                num_functions: 0,
            },
        );
    }
    if id_strings.is_empty() {
        return (results, modules);
    }

    let zones = build_zones(image, &id_strings);
    let string_addrs: BTreeMap<u32, &IdString> =
        id_strings.iter().map(|s| (s.address, s)).collect();

    let claim = |results: &mut BTreeMap<u32, Classification>,
                     module_funcs: &mut BTreeMap<String, Vec<u32>>,
                     func: u32,
                     area: RwArea,
                     module: &str,
                     path: &str,
                     confidence: f64,
                     method: &'static str| {
        let mut cls = Classification::new(Category::Rw(area), confidence, method);
        cls.module = Some(module.to_owned());
        cls.source_file = Some(path.to_owned());
        results.insert(func, cls);
        module_funcs.entry(module.to_owned()).or_default().push(func);
    };

    // Direct references to an ID string itself.
    for s in &id_strings {
        if let Some(funcs) = imm_refs.get(&s.address) {
            for &func in funcs {
                claim(
                    &mut results,
                    &mut module_funcs,
                    func,
                    s.area,
                    &s.filename,
                    &s.path,
                    CONFIDENCE_STRING_REF,
                    "rw_string_ref",
                );
            }
        }
    }

    // References landing inside a capped zone around an ID string.
    for (&data_addr, funcs) in imm_refs {
        if string_addrs.contains_key(&data_addr) {
            continue;
        }
        if let Some(zone) = find_zone(data_addr, &zones) {
            for &func in funcs {
                if !results.contains_key(&func) {
                    claim(
                        &mut results,
                        &mut module_funcs,
                        func,
                        zone.area,
                        &zone.filename,
                        &zone.path,
                        CONFIDENCE_ZONE,
                        "rw_zone",
                    );
                }
            }
        }
    }
    debug!("{} seed functions", results.len());

    // The ID strings cluster inside the library's read-only data. Bracket
    // that cluster and treat functions with repeated references into it as
    // library code.
    let func_to_data: BTreeMap<u32, Vec<u32>> = invert_refs(imm_refs);
    let first = id_strings.first().unwrap().address;
    let last = id_strings.last().unwrap().address;
    let (sec_lo, sec_hi) = string_section_bounds(image, first);
    let data_lo = first.saturating_sub(REGION_PADDING).max(sec_lo);
    let data_hi = (last + REGION_PADDING).min(sec_hi);
    debug!(
        "library data region 0x{data_lo:08X} - 0x{data_hi:08X} ({} KB)",
        (data_hi - data_lo) / 1024
    );

    for (&data_addr, funcs) in imm_refs.range(data_lo..data_hi) {
        if string_addrs.contains_key(&data_addr) {
            continue;
        }
        for &func in funcs {
            if results.contains_key(&func) {
                continue;
            }
            let region_refs = func_to_data
                .get(&func)
                .map(|refs| {
                    refs.iter()
                        .filter(|&&r| r >= data_lo && r < data_hi)
                        .count()
                })
                .unwrap_or(0);
            if region_refs >= 2 {
                let zone = find_nearest_zone(data_addr, &zones);
                claim(
                    &mut results,
                    &mut module_funcs,
                    func,
                    zone.map(|z| z.area).unwrap_or(RwArea::Core),
                    zone.map(|z| z.filename.as_str()).unwrap_or("unknown"),
                    zone.map(|z| z.path.as_str()).unwrap_or(""),
                    CONFIDENCE_DATA_REGION,
                    "rw_data_region",
                );
            }
        }
    }

    // Within the library's own code span, a single reference into the data
    // region is enough.
    let lib_funcs: Vec<u32> = results.keys().copied().collect();
    if lib_funcs.len() >= 10 {
        let code_lo = *lib_funcs.first().unwrap();
        let code_hi = *lib_funcs.last().unwrap();
        for (&data_addr, funcs) in imm_refs.range(data_lo..data_hi) {
            for &func in funcs {
                if results.contains_key(&func) {
                    continue;
                }
                if func >= code_lo && func <= code_hi {
                    let zone = find_nearest_zone(data_addr, &zones);
                    claim(
                        &mut results,
                        &mut module_funcs,
                        func,
                        zone.map(|z| z.area).unwrap_or(RwArea::Core),
                        zone.map(|z| z.filename.as_str()).unwrap_or("unknown"),
                        zone.map(|z| z.path.as_str()).unwrap_or(""),
                        CONFIDENCE_CODE_REGION,
                        "rw_code_region",
                    );
                }
            }
        }
    }

    // Drop claims on addresses that are not actually functions.
    results.retain(|addr, _| functions.get(*addr).is_some());

    for (module, funcs) in module_funcs {
        if let Some(m) = modules.get_mut(&module) {
            let mut funcs = funcs;
            funcs.sort_unstable();
            funcs.dedup();
            m.num_functions = funcs.len();
        }
    }

    (results, modules)
}

fn parse_id_strings(strings: &[StringRef]) -> Vec<IdString> {
    let mut out = Vec::new();
    for s in strings {
        let idx = match s.text.find("@@") {
            Some(idx) => idx,
            None => continue,
        };
        if let Some(caps) = ID_STRING.captures(&s.text[idx..]) {
            let path = caps[1].trim().to_owned();
            let filename = path.rsplit('/').next().unwrap_or(&path).to_owned();
            out.push(IdString {
                address: s.address,
                area: RwArea::from_path(&path),
                path,
                filename,
            });
        }
    }
    out.sort_by_key(|s| s.address);
    out
}

fn build_zones(image: &Image, id_strings: &[IdString]) -> Vec<Zone> {
    let mut zones = Vec::with_capacity(id_strings.len());
    for (i, s) in id_strings.iter().enumerate() {
        let natural_end = match id_strings.get(i + 1) {
            Some(next) => next.address,
            None => string_section_bounds(image, s.address).1,
        };
        zones.push(Zone {
            start: s.address,
            end: natural_end.min(s.address + MAX_ZONE_SIZE),
            filename: s.filename.clone(),
            path: s.path.clone(),
            area: s.area,
        });
    }
    zones
}

fn string_section_bounds(image: &Image, addr: u32) -> (u32, u32) {
    image
        .section_at(addr)
        .map(|s| (s.virtual_addr, s.end()))
        .unwrap_or((addr, addr))
}

fn find_zone<'a>(addr: u32, zones: &'a [Zone]) -> Option<&'a Zone> {
    let idx = zones.partition_point(|z| z.start <= addr);
    if idx == 0 {
        return None;
    }
    let zone = &zones[idx - 1];
    (addr < zone.end).then(|| zone)
}

fn find_nearest_zone<'a>(addr: u32, zones: &'a [Zone]) -> Option<&'a Zone> {
    zones.iter().min_by_key(|z| {
        let mid = (z.start / 2) + (z.end / 2);
        (i64::from(addr) - i64::from(mid)).unsigned_abs()
    })
}

fn invert_refs(imm_refs: &ImmRefs) -> BTreeMap<u32, Vec<u32>> {
    let mut out: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (&data_addr, funcs) in imm_refs {
        for &func in funcs {
            out.entry(func).or_default().push(data_addr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_id_strings() {
        let strings = vec![
            StringRef {
                address: 0x40_0000,
                text: "@@(#)$Id: //RenderWare/RW36Active/rwsdk/src/plcore/foo.c#1 $".to_owned(),
                length: 58,
            },
            StringRef {
                address: 0x40_0100,
                text: "not an id string".to_owned(),
                length: 16,
            },
            StringRef {
                address: 0x40_0200,
                text: "@(#)$Id: //RenderWare/RW36Active/rwsdk/world/bageomet.c#7 $".to_owned(),
                length: 59,
            },
        ];
        let parsed = parse_id_strings(&strings);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].path, "src/plcore/foo.c");
        assert_eq!(parsed[0].filename, "foo.c");
        assert_eq!(parsed[0].area, RwArea::Plcore);
        assert_eq!(parsed[1].area, RwArea::World);
    }

    #[test]
    fn it_maps_paths_to_areas() {
        assert_eq!(RwArea::from_path("src/plcore/foo.c"), RwArea::Plcore);
        assert_eq!(RwArea::from_path("src/pipe/p2/bapipe.c"), RwArea::Pipeline);
        assert_eq!(RwArea::from_path("driver/d3d8/drvmodel.c"), RwArea::Driver);
        assert_eq!(RwArea::from_path("world/basector.c"), RwArea::World);
        assert_eq!(RwArea::from_path("src/babinary.c"), RwArea::Core);
        assert_eq!(RwArea::from_path("tool/whatever.c"), RwArea::Unknown);
    }
}
