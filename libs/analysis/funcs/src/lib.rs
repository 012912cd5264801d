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

//! Multi-pass function boundary detection.
//!
//! Candidates come from known seeds, prologue byte patterns, padding-byte
//! boundaries, and call targets; overlaps resolve by confidence. Function
//! ends are found by walking forward past internal forward conditional
//! jumps until an unconditional terminator covers everything reached.

use i386::{Engine, Operand, Reg};
use labels::LabelTable;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use xbe::{Image, Section};

pub const CONFIDENCE_KNOWN: f64 = 1.00;
pub const CONFIDENCE_PROLOGUE: f64 = 0.95;
pub const CONFIDENCE_CALL_TARGET: f64 = 0.90;
pub const CONFIDENCE_CC_BOUNDARY: f64 = 0.85;

const CC_PADDING: u8 = 0xCC;
const MIN_CC_RUN: usize = 1;

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

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    EntryPoint,
    Prologue,
    PrologueAlt,
    CcBoundary,
    CallTarget,
}

#[derive(Clone, Debug, Serialize)]
pub struct Function {
    #[serde(serialize_with = "hex_addr")]
    pub start: u32,
    /// Exclusive end address.
    #[serde(serialize_with = "hex_addr")]
    pub end: u32,
    pub size: u32,
    pub name: String,
    pub section: String,
    pub confidence: f64,
    pub detection_method: DetectionMethod,
    pub num_instructions: usize,
    pub has_prologue: bool,
    #[serde(serialize_with = "hex_addrs")]
    pub calls_to: Vec<u32>,
    #[serde(serialize_with = "hex_addrs")]
    pub called_by: Vec<u32>,
}

/// Uniquely keyed by start address; no two functions overlap.
#[derive(Default)]
pub struct FunctionTable {
    pub functions: BTreeMap<u32, Function>,
}

impl FunctionTable {
    #[inline]
    pub fn get(&self, start: u32) -> Option<&Function> {
        self.functions.get(&start)
    }

    /// The function whose range contains `addr`.
    pub fn containing(&self, addr: u32) -> Option<&Function> {
        self.functions
            .range(..=addr)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| addr < f.end)
    }

    pub fn all(&self) -> impl Iterator<Item = &Function> {
        self.functions.values()
    }

    pub fn starts(&self) -> Vec<u32> {
        self.functions.keys().copied().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn summary(&self) -> FunctionSummary {
        let mut by_method: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_section: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_insns = 0;
        let mut with_prologue = 0;
        for f in self.functions.values() {
            *by_method
                .entry(format!("{:?}", f.detection_method).to_lowercase())
                .or_insert(0) += 1;
            *by_section.entry(f.section.clone()).or_insert(0) += 1;
            total_insns += f.num_instructions;
            if f.has_prologue {
                with_prologue += 1;
            }
        }
        FunctionSummary {
            total_functions: self.functions.len(),
            total_instructions_in_functions: total_insns,
            with_prologue,
            by_detection_method: by_method,
            by_section,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FunctionSummary {
    pub total_functions: usize,
    pub total_instructions_in_functions: usize,
    pub with_prologue: usize,
    pub by_detection_method: BTreeMap<String, usize>,
    pub by_section: BTreeMap<String, usize>,
}

pub struct FunctionDetector<'a> {
    engine: &'a Engine,
    image: &'a Image,
    candidates: BTreeMap<u32, (f64, DetectionMethod)>,
}

impl<'a> FunctionDetector<'a> {
    pub fn new(engine: &'a Engine, image: &'a Image) -> Self {
        Self {
            engine,
            image,
            candidates: BTreeMap::new(),
        }
    }

    /// Run every pass over the given sections and build the table.
    /// Detection never fails; bad candidates just drop out.
    pub fn detect_all(mut self, sections: &[Section], labels: &mut LabelTable) -> FunctionTable {
        self.pass_known_seeds();
        for sec in sections {
            self.pass_prologues(sec);
        }
        for sec in sections {
            self.pass_cc_boundaries(sec);
        }
        self.pass_call_targets();

        let mut table = self.build_functions(labels);
        build_call_graph(self.engine, &mut table);
        debug!("{} functions detected", table.len());
        table
    }

    fn add_candidate(&mut self, addr: u32, confidence: f64, method: DetectionMethod) {
        match self.candidates.get(&addr) {
            Some((existing, _)) if *existing >= confidence => {}
            _ => {
                self.candidates.insert(addr, (confidence, method));
            }
        }
    }

    fn pass_known_seeds(&mut self) {
        self.add_candidate(
            self.image.entry_point,
            CONFIDENCE_KNOWN,
            DetectionMethod::EntryPoint,
        );
    }

    /// Scan for `push ebp; mov ebp, esp` (8B EC, or the 89 E5 encoding) at
    /// every byte offset. Only offsets the sweep decoded count.
    fn pass_prologues(&mut self, section: &Section) {
        let data = self.image.section_data(section);
        let va = section.virtual_addr;
        let mut i = 0usize;
        while i + 2 < data.len() {
            if data[i] == 0x55 {
                let (matched, method) = match (data[i + 1], data[i + 2]) {
                    (0x8B, 0xEC) => (true, DetectionMethod::Prologue),
                    (0x89, 0xE5) => (true, DetectionMethod::PrologueAlt),
                    _ => (false, DetectionMethod::Prologue),
                };
                if matched {
                    let addr = va + i as u32;
                    if self.engine.has_instruction(addr) {
                        self.add_candidate(addr, CONFIDENCE_PROLOGUE, method);
                    }
                    i += 3;
                    continue;
                }
            }
            i += 1;
        }
    }

    /// A run of 0xCC directly after a return marks the next decoded
    /// instruction as a function start.
    fn pass_cc_boundaries(&mut self, section: &Section) {
        let data = self.image.section_data(section);
        let va = section.virtual_addr;
        let mut i = 0usize;
        while i < data.len() {
            if data[i] != CC_PADDING {
                i += 1;
                continue;
            }
            let cc_start = i;
            while i < data.len() && data[i] == CC_PADDING {
                i += 1;
            }
            let run = i - cc_start;
            if run < MIN_CC_RUN || i >= data.len() {
                continue;
            }

            let before = va + cc_start as u32;
            // ret encodings are 1-3 bytes; probe backwards for one that
            // ends exactly at the padding.
            let found_ret = (1..=3).any(|back| {
                self.engine
                    .instruction(before.wrapping_sub(back))
                    .map(|insn| insn.is_ret() && insn.end_addr() == before)
                    .unwrap_or(false)
            });
            if found_ret {
                let next = va + i as u32;
                if self.engine.has_instruction(next) {
                    self.add_candidate(next, CONFIDENCE_CC_BOUNDARY, DetectionMethod::CcBoundary);
                }
            }
        }
    }

    fn pass_call_targets(&mut self) {
        for target in self.engine.call_targets() {
            if !self.engine.has_instruction(target) {
                continue;
            }
            let executable = self
                .image
                .section_at(target)
                .map(|s| s.executable())
                .unwrap_or(false);
            if executable {
                self.add_candidate(target, CONFIDENCE_CALL_TARGET, DetectionMethod::CallTarget);
            }
        }
    }

    fn build_functions(&self, labels: &mut LabelTable) -> FunctionTable {
        let starts: Vec<u32> = self.candidates.keys().copied().collect();
        let mut table = FunctionTable::default();

        for (idx, &start) in starts.iter().enumerate() {
            let (confidence, method) = self.candidates[&start];
            let section = self.image.section_at(start);
            let sec_name = section.map(|s| s.name.clone()).unwrap_or_default();
            let sec_end = section.map(|s| s.end());
            let next_start = starts.get(idx + 1).copied();

            let end = self.find_function_end(start, next_start, sec_end);
            let num_instructions = self.engine.instructions_in_range(start, end).count();
            if num_instructions == 0 {
                continue;
            }

            let has_prologue = self
                .engine
                .instruction(start)
                .map(|insn| {
                    insn.mnemonic == i386::Mnemonic::Push
                        && matches!(insn.operands.first(), Some(Operand::Register(Reg::EBP)))
                })
                .unwrap_or(false);

            let name = match labels.get(start) {
                Some(label) => label.name.clone(),
                None => labels.auto_name_function(start, &sec_name, confidence),
            };

            table.functions.insert(
                start,
                Function {
                    start,
                    end,
                    size: end - start,
                    name,
                    section: sec_name,
                    confidence,
                    detection_method: method,
                    num_instructions,
                    has_prologue,
                    calls_to: Vec::new(),
                    called_by: Vec::new(),
                },
            );
        }
        table
    }

    /// Walk forward tracking the furthest address reached through
    /// fall-through and internal forward conditional jumps. The end never
    /// crosses the next candidate or the section end.
    fn find_function_end(&self, start: u32, next_start: Option<u32>, sec_end: Option<u32>) -> u32 {
        let mut upper = sec_end.unwrap_or(start + 0x10_0000);
        if let Some(next) = next_start {
            if next < upper {
                upper = next;
            }
        }

        let mut max_reached = start;
        let mut addr = start;
        while addr < upper {
            let insn = match self.engine.instruction(addr) {
                Some(insn) => insn,
                None => break,
            };
            let end = insn.end_addr();
            if end > max_reached {
                max_reached = end;
            }

            if insn.is_cond_jump() {
                if let Some(target) = insn.jump_target {
                    if target >= start && target < upper && target > max_reached {
                        max_reached = target;
                    }
                }
            }

            if insn.is_terminator() {
                if insn.end_addr() >= max_reached {
                    break;
                }
                // Code continues past the terminator (jump-over-data idiom).
                addr = insn.end_addr();
                continue;
            }

            addr = insn.end_addr();
        }

        max_reached
    }
}

/// Populate `calls_to` from each function's direct call targets, then
/// invert for `called_by`.
fn build_call_graph(engine: &Engine, table: &mut FunctionTable) {
    let mut calls: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for f in table.functions.values() {
        let mut callees: Vec<u32> = engine
            .instructions_in_range(f.start, f.end)
            .filter_map(|insn| insn.call_target)
            .collect();
        callees.sort_unstable();
        callees.dedup();
        calls.insert(f.start, callees);
    }

    let mut called_by: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (caller, callees) in &calls {
        for callee in callees {
            if calls.contains_key(callee) {
                called_by.entry(*callee).or_default().push(*caller);
            }
        }
    }

    for (start, f) in table.functions.iter_mut() {
        f.calls_to = calls.remove(start).unwrap_or_default();
        if let Some(mut callers) = called_by.remove(start) {
            callers.sort_unstable();
            callers.dedup();
            f.called_by = callers;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(data: &mut [u8], off: usize, v: u32) {
        data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn test_image(code: &[u8]) -> Image {
        let base = 0x0001_0000u32;
        let mut data = vec![0u8; 0x800];
        data[0..4].copy_from_slice(b"XBEH");
        put_u32(&mut data, 0x104, base);
        put_u32(&mut data, 0x10C, 0x3000);
        put_u32(&mut data, 0x11C, 1);
        put_u32(&mut data, 0x120, base + 0x200);
        put_u32(&mut data, 0x128, 0x0001_1000 ^ xbe::ENTRY_XOR_RETAIL);
        put_u32(&mut data, 0x158, 0x0001_2000 ^ xbe::THUNK_XOR_RETAIL);
        data[0x300..0x306].copy_from_slice(b".text\0");
        put_u32(&mut data, 0x200, 0x7);
        put_u32(&mut data, 0x204, 0x0001_1000);
        put_u32(&mut data, 0x208, 0x400);
        put_u32(&mut data, 0x20C, 0x400);
        put_u32(&mut data, 0x210, 0x400u32.min(code.len() as u32));
        put_u32(&mut data, 0x214, base + 0x300);
        data[0x400..0x400 + code.len()].copy_from_slice(code);
        Image::from_bytes(data).unwrap()
    }

    fn detect(code: &[u8]) -> (FunctionTable, Engine, Image) {
        let image = test_image(code);
        let mut engine = Engine::new();
        let text = image.section(".text").unwrap().clone();
        engine.sweep_section(&image, &text, None);
        let mut labels = LabelTable::new();
        let detector = FunctionDetector::new(&engine, &image);
        let table = detector.detect_all(&[text], &mut labels);
        (table, engine, image)
    }

    #[test]
    fn it_detects_a_minimal_prologue_function() {
        // The entry point (0x11000) carries the standard prologue.
        let (table, _, _) = detect(&[0x55, 0x8B, 0xEC, 0xC3]);
        let f = table.get(0x0001_1000).expect("function at entry");
        assert_eq!(f.end, 0x0001_1004);
        assert_eq!(f.num_instructions, 3);
        assert!(f.has_prologue);
        // Entry-point seeding outranks the prologue pass.
        assert_eq!(f.detection_method, DetectionMethod::EntryPoint);
        assert_eq!(f.confidence, CONFIDENCE_KNOWN);
    }

    #[test]
    fn it_splits_functions_at_cc_padding() {
        // f0: ret; CC CC; f1: push ebp; mov ebp, esp; ret
        let (table, _, _) = detect(&[0xC3, 0xCC, 0xCC, 0x55, 0x8B, 0xEC, 0xC3]);
        let f1 = table.get(0x0001_1003).expect("function after padding");
        assert_eq!(f1.detection_method, DetectionMethod::Prologue);
        assert_eq!(f1.confidence, CONFIDENCE_PROLOGUE);
        assert_eq!(f1.end, 0x0001_1007);
        // The entry function must not swallow the padding-delimited one.
        let f0 = table.get(0x0001_1000).unwrap();
        assert!(f0.end <= 0x0001_1003);
    }

    #[test]
    fn it_detects_call_targets_and_builds_the_call_graph() {
        // entry: call +3 (to 0x11008); ret; CC*3; target: ret
        let code = [
            0xE8, 0x03, 0x00, 0x00, 0x00, // call 0x11008
            0xC3, // ret
            0xCC, 0xCC, // padding
            0xC3, // 0x11008: ret
        ];
        let (table, _, _) = detect(&code);
        let callee = table.get(0x0001_1008).expect("call target function");
        assert_eq!(callee.detection_method, DetectionMethod::CallTarget);
        assert_eq!(callee.confidence, CONFIDENCE_CALL_TARGET);
        assert_eq!(callee.called_by, vec![0x0001_1000]);
        let caller = table.get(0x0001_1000).unwrap();
        assert_eq!(caller.calls_to, vec![0x0001_1008]);
    }

    #[test]
    fn it_extends_past_forward_conditional_jumps() {
        // jz jumps over the first ret; the function must extend through
        // the jump target even though a ret sits in the middle.
        let code = [
            0x74, 0x02, // jz 0x11004
            0xC3, // ret (jumped over)
            0x90, // 0x11003: nop
            0xC3, // 0x11004: ret
        ];
        let (table, _, _) = detect(&code);
        let f = table.get(0x0001_1000).unwrap();
        assert_eq!(f.end, 0x0001_1005);
        assert_eq!(f.num_instructions, 4);
    }

    #[test]
    fn it_never_overlaps_functions() {
        let code = [
            0x55, 0x8B, 0xEC, 0xC3, // f0
            0x55, 0x8B, 0xEC, 0x90, 0xC3, // f1
        ];
        let (table, _, _) = detect(&code);
        let funcs: Vec<&Function> = table.all().collect();
        for w in funcs.windows(2) {
            assert!(w[0].end <= w[1].start, "{:?} overlaps {:?}", w[0], w[1]);
        }
        assert!(table.containing(0x0001_1005).is_some());
        assert_eq!(table.containing(0x0001_1005).unwrap().start, 0x0001_1004);
    }
}
