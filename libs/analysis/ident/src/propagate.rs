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

//! Label propagation.
//!
//! The linker places library object code contiguously, so call-graph
//! edges, address order, and region bounds carry a lot of signal. Each
//! strategy below only ever fills gaps; it never overwrites an earlier,
//! stronger classification.

use crate::imm_scan::ImmRefs;
use crate::{Category, Classification, GameArea, RwArea};
use funcs::FunctionTable;
use labels::StringRef;
use lazy_static::lazy_static;
use log::debug;
use std::collections::{BTreeMap, HashMap};
use xbe::Image;

const MAX_MAJORITY_ITERATIONS: usize = 10;
const MAX_FLOOD_ITERATIONS: usize = 20;
const MAX_PROXIMITY_PASSES: usize = 20;

const PROXIMITY_GAP: u32 = 0x1000;
const PROXIMITY_GAP_IN_REGION: u32 = 0x2000;

const CONFIDENCE_MAJORITY: f64 = 0.75;
const CONFIDENCE_FLOOD: f64 = 0.70;
const CONFIDENCE_PROXIMITY: f64 = 0.65;
const CONFIDENCE_PROXIMITY_IN_REGION: f64 = 0.60;
const CONFIDENCE_CONSUMER: f64 = 0.65;
const CONFIDENCE_PLATFORM: f64 = 0.70;
const CONFIDENCE_KEYWORD: f64 = 0.60;

lazy_static! {
    /// Platform library sections, by section name prefix, and the game
    /// area a caller into them belongs to.
    static ref PLATFORM_SECTIONS: Vec<(&'static str, GameArea)> = vec![
        ("D3D", GameArea::Render),
        ("XGRPH", GameArea::Render),
        ("DSOUND", GameArea::Audio),
        ("WMADEC", GameArea::Audio),
        ("DOLBY", GameArea::Audio),
        ("XMV", GameArea::Video),
        ("XONLINE", GameArea::Network),
        ("XNET", GameArea::Network),
        ("XPP", GameArea::Input),
    ];

    /// Substring → game-area hints for strings referenced by a function.
    static ref AREA_KEYWORDS: Vec<(GameArea, Vec<&'static str>)> = vec![
        (GameArea::Vehicle, vec!["vehicle", "car", "wheel", "tyre", "boost", "gearbox"]),
        (GameArea::Physics, vec!["physics", "collision", "impact", "crash", "suspension"]),
        (GameArea::Render, vec!["render", "texture", "shader", "draw", "sprite", "viewport"]),
        (GameArea::Audio, vec!["audio", "sound", "music", "volume", "reverb"]),
        (GameArea::Ui, vec!["menu", "button", "font", "screen", "hud", "frontend"]),
        (GameArea::Network, vec!["network", "packet", "socket", "session", "lobby"]),
        (GameArea::Camera, vec!["camera", "lookat", "zoom"]),
        (GameArea::Io, vec!["file", "load", "save", "disc", "directory"]),
        (GameArea::Input, vec!["controller", "gamepad", "rumble", "trigger"]),
        (GameArea::Video, vec!["video", "movie", "playback", "codec"]),
    ];
}

struct Graph {
    callees: BTreeMap<u32, Vec<u32>>,
    callers: BTreeMap<u32, Vec<u32>>,
}

pub fn propagate_labels(
    image: &Image,
    functions: &FunctionTable,
    existing: &BTreeMap<u32, Classification>,
    imm_refs: &ImmRefs,
    strings: &[StringRef],
) -> BTreeMap<u32, Classification> {
    let sorted_addrs: Vec<u32> = functions.starts();
    let graph = Graph {
        callees: functions
            .all()
            .map(|f| (f.start, f.calls_to.clone()))
            .collect(),
        callers: functions
            .all()
            .map(|f| (f.start, f.called_by.clone()))
            .collect(),
    };

    // Working label set. Everything already classified is fixed.
    let mut labels: BTreeMap<u32, Category> =
        existing.iter().map(|(a, c)| (*a, c.category)).collect();
    let mut propagated: BTreeMap<u32, Classification> = BTreeMap::new();

    // Call-graph majority voting, iterated until quiescent.
    for iteration in 0..MAX_MAJORITY_ITERATIONS {
        let mut new_labels = 0usize;
        for &(edges, method) in &[
            (&graph.callers, "cluster_forward"),
            (&graph.callees, "cluster_backward"),
        ] {
            for &addr in &sorted_addrs {
                if labels.contains_key(&addr) {
                    continue;
                }
                let neighbors = match edges.get(&addr) {
                    Some(n) if n.len() >= 2 => n,
                    _ => continue,
                };
                let mut lib_count = 0usize;
                let mut area_counts: BTreeMap<RwArea, usize> = BTreeMap::new();
                for n in neighbors {
                    if let Some(Category::Rw(area)) = labels.get(n) {
                        lib_count += 1;
                        *area_counts.entry(*area).or_insert(0) += 1;
                    }
                }
                if lib_count >= 2 && lib_count as f64 / neighbors.len() as f64 >= 0.67 {
                    let best = best_area(&area_counts);
                    labels.insert(addr, Category::Rw(best));
                    propagated.insert(
                        addr,
                        Classification::new(Category::Rw(best), CONFIDENCE_MAJORITY, method),
                    );
                    new_labels += 1;
                }
            }
        }
        debug!("majority iteration {}: {} new labels", iteration + 1, new_labels);
        if new_labels == 0 {
            break;
        }
    }

    region_flood(&sorted_addrs, &graph, &mut labels, &mut propagated);

    for _ in 0..MAX_PROXIMITY_PASSES {
        if proximity_pass(&sorted_addrs, &mut labels, &mut propagated) == 0 {
            break;
        }
    }

    classify_library_consumers(&sorted_addrs, &graph, &mut labels, &mut propagated);
    classify_platform_callers(image, &sorted_addrs, &graph, &mut labels, &mut propagated);
    classify_by_keywords(&sorted_addrs, imm_refs, strings, &mut labels, &mut propagated);

    propagated
}

fn best_area(counts: &BTreeMap<RwArea, usize>) -> RwArea {
    counts
        .iter()
        .max_by_key(|(_, &c)| c)
        .map(|(a, _)| *a)
        .unwrap_or(RwArea::Core)
}

fn library_region(sorted_addrs: &[u32], labels: &BTreeMap<u32, Category>) -> Option<(u32, u32)> {
    let lib: Vec<u32> = sorted_addrs
        .iter()
        .copied()
        .filter(|a| matches!(labels.get(a), Some(Category::Rw(_))))
        .collect();
    if lib.len() < 10 {
        return None;
    }
    Some((*lib.first().unwrap(), *lib.last().unwrap()))
}

/// Inside the library code region, any call-graph connection to library
/// code is enough. Iterated to convergence, bounded.
fn region_flood(
    sorted_addrs: &[u32],
    graph: &Graph,
    labels: &mut BTreeMap<u32, Category>,
    propagated: &mut BTreeMap<u32, Classification>,
) {
    let (lo, hi) = match library_region(sorted_addrs, labels) {
        Some(b) => b,
        None => return,
    };
    let region: Vec<u32> = sorted_addrs
        .iter()
        .copied()
        .filter(|&a| a >= lo && a <= hi)
        .collect();

    let mut total = 0usize;
    for _ in 0..MAX_FLOOD_ITERATIONS {
        let mut count = 0usize;
        for &addr in &region {
            if labels.contains_key(&addr) {
                continue;
            }
            let mut area_counts: BTreeMap<RwArea, usize> = BTreeMap::new();
            for n in graph
                .callers
                .get(&addr)
                .into_iter()
                .flatten()
                .chain(graph.callees.get(&addr).into_iter().flatten())
            {
                if let Some(Category::Rw(area)) = labels.get(n) {
                    *area_counts.entry(*area).or_insert(0) += 1;
                }
            }
            if !area_counts.is_empty() {
                let best = best_area(&area_counts);
                labels.insert(addr, Category::Rw(best));
                propagated.insert(
                    addr,
                    Classification::new(
                        Category::Rw(best),
                        CONFIDENCE_FLOOD,
                        "rw_region_propagation",
                    ),
                );
                count += 1;
            }
        }
        total += count;
        if count == 0 {
            break;
        }
    }
    debug!("region flood: {total} labels");
}

/// Outside the library region both immediate neighbors must agree within a
/// small gap; inside it one neighbor within a wider gap suffices.
fn proximity_pass(
    sorted_addrs: &[u32],
    labels: &mut BTreeMap<u32, Category>,
    propagated: &mut BTreeMap<u32, Classification>,
) -> usize {
    let region = library_region(sorted_addrs, labels);
    let mut count = 0usize;

    for i in 1..sorted_addrs.len().saturating_sub(1) {
        let addr = sorted_addrs[i];
        if labels.contains_key(&addr) {
            continue;
        }
        let prev_addr = sorted_addrs[i - 1];
        let next_addr = sorted_addrs[i + 1];
        let prev = labels.get(&prev_addr).copied();
        let next = labels.get(&next_addr).copied();

        let in_region = region
            .map(|(lo, hi)| addr >= lo && addr <= hi)
            .unwrap_or(false);

        if in_region {
            let neighbor = match (prev, next) {
                (Some(Category::Rw(a)), _) if addr - prev_addr <= PROXIMITY_GAP_IN_REGION => {
                    Some(a)
                }
                (_, Some(Category::Rw(a))) if next_addr - addr <= PROXIMITY_GAP_IN_REGION => {
                    Some(a)
                }
                _ => None,
            };
            if let Some(area) = neighbor {
                labels.insert(addr, Category::Rw(area));
                propagated.insert(
                    addr,
                    Classification::new(
                        Category::Rw(area),
                        CONFIDENCE_PROXIMITY_IN_REGION,
                        "cluster_proximity",
                    ),
                );
                count += 1;
            }
        } else {
            if addr - prev_addr > PROXIMITY_GAP || next_addr - addr > PROXIMITY_GAP {
                continue;
            }
            if let (Some(Category::Rw(a)), Some(Category::Rw(_))) = (prev, next) {
                labels.insert(addr, Category::Rw(a));
                propagated.insert(
                    addr,
                    Classification::new(
                        Category::Rw(a),
                        CONFIDENCE_PROXIMITY,
                        "cluster_proximity",
                    ),
                );
                count += 1;
            }
        }
    }
    count
}

/// Game code that sits below the library region and calls into it is the
/// game's engine-facing layer.
fn classify_library_consumers(
    sorted_addrs: &[u32],
    graph: &Graph,
    labels: &mut BTreeMap<u32, Category>,
    propagated: &mut BTreeMap<u32, Classification>,
) {
    let lib_lo = match library_region(sorted_addrs, labels) {
        Some((lo, _)) => lo,
        None => return,
    };
    let mut count = 0usize;
    for &addr in sorted_addrs {
        if labels.contains_key(&addr) || addr >= lib_lo {
            continue;
        }
        let calls_library = graph
            .callees
            .get(&addr)
            .into_iter()
            .flatten()
            .any(|c| matches!(labels.get(c), Some(Category::Rw(_))));
        if calls_library {
            labels.insert(addr, Category::Game(GameArea::Engine));
            let mut cls = Classification::new(
                Category::Game(GameArea::Engine),
                CONFIDENCE_CONSUMER,
                "rw_consumer",
            );
            cls.subcategory = Some("engine".to_owned());
            propagated.insert(addr, cls);
            count += 1;
        }
    }
    debug!("library consumers: {count}");
}

/// Callers into the platform library sections inherit the matching area.
fn classify_platform_callers(
    image: &Image,
    sorted_addrs: &[u32],
    graph: &Graph,
    labels: &mut BTreeMap<u32, Category>,
    propagated: &mut BTreeMap<u32, Classification>,
) {
    let ranges: Vec<(u32, u32, GameArea)> = image
        .sections
        .iter()
        .filter_map(|s| {
            PLATFORM_SECTIONS
                .iter()
                .find(|(prefix, _)| s.name.starts_with(prefix))
                .map(|(_, area)| (s.virtual_addr, s.end(), *area))
        })
        .collect();
    if ranges.is_empty() {
        return;
    }

    let mut count = 0usize;
    for &addr in sorted_addrs {
        if labels.contains_key(&addr) {
            continue;
        }
        let mut area_counts: BTreeMap<GameArea, usize> = BTreeMap::new();
        for target in graph.callees.get(&addr).into_iter().flatten() {
            for &(lo, hi, area) in &ranges {
                if *target >= lo && *target < hi {
                    *area_counts.entry(area).or_insert(0) += 1;
                }
            }
        }
        if let Some((&area, _)) = area_counts.iter().max_by_key(|(_, &c)| c) {
            labels.insert(addr, Category::Game(area));
            let mut cls = Classification::new(
                Category::Game(area),
                CONFIDENCE_PLATFORM,
                "platform_caller",
            );
            cls.subcategory = Some(area.key().to_owned());
            propagated.insert(addr, cls);
            count += 1;
        }
    }
    debug!("platform callers: {count}");
}

/// Last resort: classify by the read-only strings a function references.
fn classify_by_keywords(
    sorted_addrs: &[u32],
    imm_refs: &ImmRefs,
    strings: &[StringRef],
    labels: &mut BTreeMap<u32, Category>,
    propagated: &mut BTreeMap<u32, Classification>,
) {
    let text_by_addr: HashMap<u32, String> = strings
        .iter()
        .map(|s| (s.address, s.text.to_lowercase()))
        .collect();

    let mut func_strings: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for (data_addr, funcs) in imm_refs {
        if let Some(text) = text_by_addr.get(data_addr) {
            for &f in funcs {
                func_strings.entry(f).or_default().push(text);
            }
        }
    }

    let mut count = 0usize;
    for &addr in sorted_addrs {
        if labels.contains_key(&addr) {
            continue;
        }
        let refs = match func_strings.get(&addr) {
            Some(refs) => refs,
            None => continue,
        };
        let combined = refs.join(" ");

        let mut best: Option<(GameArea, usize)> = None;
        for (area, keywords) in AREA_KEYWORDS.iter() {
            let score = keywords.iter().filter(|kw| combined.contains(*kw)).count();
            if score > best.map(|(_, s)| s).unwrap_or(0) {
                best = Some((*area, score));
            }
        }
        if let Some((area, _)) = best {
            labels.insert(addr, Category::Game(area));
            let mut cls =
                Classification::new(Category::Game(area), CONFIDENCE_KEYWORD, "string_keyword");
            cls.subcategory = Some(area.key().to_owned());
            propagated.insert(addr, cls);
            count += 1;
        }
    }
    debug!("keyword classification: {count}");
}
