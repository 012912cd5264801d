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

//! Linear-sweep disassembly over executable sections, with optional
//! recursive-descent reachability from a seed set.

use crate::decode::Instr;
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};
use xbe::{Image, Section};

/// Decoded-instruction store for a whole image. Addresses are the keys;
/// the map stays sorted, so range queries are just `range()`.
#[derive(Default)]
pub struct Engine {
    pub instructions: BTreeMap<u32, Instr>,
    pub decode_gaps: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep one section. Decodes sequentially; an undecodable byte
    /// advances the cursor by one and decoding resumes.
    ///
    /// Returns the number of instructions decoded.
    pub fn sweep_section(
        &mut self,
        image: &Image,
        section: &Section,
        mut progress: Option<&mut dyn FnMut(usize, usize)>,
    ) -> usize {
        let data = image.section_data(section);
        if data.is_empty() {
            return 0;
        }
        let va_start = section.virtual_addr;
        let image_lo = image.base_address;
        let image_hi = image.base_address.wrapping_add(image.image_size);
        let total = data.len();

        let mut offset = 0usize;
        let mut count = 0usize;
        while offset < total {
            let mut ip = offset;
            match Instr::decode_one(data, &mut ip, va_start + offset as u32) {
                Ok(mut insn) => {
                    insn.resolve_targets(image_lo, image_hi);
                    trace!("  @{:08X}: {}", insn.addr, insn);
                    self.instructions.insert(insn.addr, insn);
                    count += 1;
                    offset = ip;
                }
                Err(_) => {
                    self.decode_gaps += 1;
                    offset += 1;
                }
            }
            if let Some(cb) = progress.as_deref_mut() {
                cb(offset.min(total), total);
            }
        }
        debug!(
            "swept {}: {} instructions, {} gap bytes so far",
            section.name, count, self.decode_gaps
        );
        count
    }

    /// Sweep every code section of the image.
    pub fn sweep_all(&mut self, image: &Image) -> usize {
        let sections: Vec<Section> = image.sections_code().cloned().collect();
        let mut total = 0;
        for sec in &sections {
            total += self.sweep_section(image, sec, None);
        }
        total
    }

    #[inline]
    pub fn instruction(&self, addr: u32) -> Option<&Instr> {
        self.instructions.get(&addr)
    }

    #[inline]
    pub fn has_instruction(&self, addr: u32) -> bool {
        self.instructions.contains_key(&addr)
    }

    /// Instructions with `lo <= addr < hi`, in address order.
    pub fn instructions_in_range(&self, lo: u32, hi: u32) -> impl Iterator<Item = &Instr> {
        self.instructions.range(lo..hi).map(|(_, insn)| insn)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// All direct call target addresses.
    pub fn call_targets(&self) -> BTreeSet<u32> {
        self.instructions
            .values()
            .filter_map(|insn| insn.call_target)
            .collect()
    }

    /// Follow control flow from the seed set and report every reachable
    /// instruction address. Calls and conditional jumps push their targets
    /// and continue; unconditional jumps push and stop; returns stop.
    pub fn recursive_descent(&self, seeds: &[u32], bounds: &[(u32, u32)]) -> BTreeSet<u32> {
        let in_bounds = |addr: u32| bounds.iter().any(|&(lo, hi)| addr >= lo && addr < hi);

        let mut reachable = BTreeSet::new();
        let mut visited_starts = BTreeSet::new();
        let mut worklist: Vec<u32> = seeds.to_vec();

        while let Some(start) = worklist.pop() {
            if !visited_starts.insert(start) {
                continue;
            }

            let mut addr = start;
            loop {
                if reachable.contains(&addr) || !in_bounds(addr) {
                    break;
                }
                let insn = match self.instructions.get(&addr) {
                    Some(insn) => insn,
                    None => break,
                };
                reachable.insert(addr);

                if insn.is_call() {
                    if let Some(target) = insn.call_target {
                        if in_bounds(target) && !visited_starts.contains(&target) {
                            worklist.push(target);
                        }
                    }
                }
                if insn.is_cond_jump() {
                    if let Some(target) = insn.jump_target {
                        if in_bounds(target) && !visited_starts.contains(&target) {
                            worklist.push(target);
                        }
                    }
                }
                if insn.is_jump() {
                    if let Some(target) = insn.jump_target {
                        if in_bounds(target) && !visited_starts.contains(&target) {
                            worklist.push(target);
                        }
                    }
                    break;
                }
                if insn.is_ret() {
                    break;
                }
                addr = insn.end_addr();
            }
        }

        reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn put_u32(data: &mut [u8], off: usize, v: u32) {
        data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn test_image(code: &[u8]) -> Result<Image> {
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
        put_u32(&mut data, 0x208, 0x1000);
        put_u32(&mut data, 0x20C, 0x400);
        put_u32(&mut data, 0x210, code.len() as u32);
        put_u32(&mut data, 0x214, base + 0x300);
        data[0x400..0x400 + code.len()].copy_from_slice(code);
        Ok(Image::from_bytes(data)?)
    }

    #[test]
    fn it_sweeps_and_recovers_from_bad_bytes() -> Result<()> {
        // push ebp; mov ebp, esp; <bad 0F 0B>; ret
        let image = test_image(&[0x55, 0x8B, 0xEC, 0x0F, 0x0B, 0xC3])?;
        let mut engine = Engine::new();
        let text = image.section(".text").unwrap().clone();
        let n = engine.sweep_section(&image, &text, None);
        assert!(n >= 3);
        assert!(engine.has_instruction(0x0001_1000));
        assert!(engine.has_instruction(0x0001_1001));
        assert!(engine.instruction(0x0001_1005).unwrap().is_ret());
        assert!(engine.decode_gaps >= 1);
        Ok(())
    }

    #[test]
    fn it_walks_reachable_code() -> Result<()> {
        // 0x11000: jz +2 (to 0x11004); ret; ret; int3 (unreachable tail)
        let image = test_image(&[0x74, 0x02, 0xC3, 0xC3, 0xC3, 0xCC])?;
        let mut engine = Engine::new();
        let text = image.section(".text").unwrap().clone();
        engine.sweep_section(&image, &text, None);
        let reachable =
            engine.recursive_descent(&[0x0001_1000], &[(0x0001_1000, 0x0001_2000)]);
        assert!(reachable.contains(&0x0001_1000));
        assert!(reachable.contains(&0x0001_1002)); // fall-through ret
        assert!(reachable.contains(&0x0001_1004)); // branch target
        assert!(!reachable.contains(&0x0001_1005));
        Ok(())
    }

    #[test]
    fn it_ranges_in_address_order() -> Result<()> {
        let image = test_image(&[0x90, 0x90, 0x90, 0xC3])?;
        let mut engine = Engine::new();
        let text = image.section(".text").unwrap().clone();
        engine.sweep_section(&image, &text, None);
        let addrs: Vec<u32> = engine
            .instructions_in_range(0x0001_1001, 0x0001_1003)
            .map(|i| i.addr)
            .collect();
        assert_eq!(addrs, vec![0x0001_1001, 0x0001_1002]);
        Ok(())
    }
}
