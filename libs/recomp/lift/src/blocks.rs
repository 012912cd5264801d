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

//! Basic-block construction inside one function.
//!
//! Leaders: the entry, every intra-function branch target, and the
//! instruction after any call or branch. Blocks end at the first
//! terminator or just before the next leader.

use i386::Instr;
use std::collections::BTreeSet;

#[derive(Debug)]
pub struct BasicBlock {
    pub start: u32,
    pub insns: Vec<Instr>,
    pub successors: Vec<u32>,
}

impl BasicBlock {
    pub fn end(&self) -> u32 {
        self.insns
            .last()
            .map(|i| i.end_addr())
            .unwrap_or(self.start)
    }

    pub fn last(&self) -> Option<&Instr> {
        self.insns.last()
    }
}

pub fn build_basic_blocks(instructions: &[Instr], func_start: u32, func_end: u32) -> Vec<BasicBlock> {
    if instructions.is_empty() {
        return Vec::new();
    }

    let mut leaders: BTreeSet<u32> = BTreeSet::new();
    leaders.insert(func_start);
    for insn in instructions {
        if insn.is_branch() {
            if let Some(target) = insn.jump_target {
                if target >= func_start && target < func_end {
                    leaders.insert(target);
                }
            }
            leaders.insert(insn.end_addr());
        } else if insn.is_call() {
            leaders.insert(insn.end_addr());
        }
    }

    let addr_index: std::collections::BTreeMap<u32, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, insn)| (insn.addr, i))
        .collect();

    let sorted_leaders: Vec<u32> = leaders
        .into_iter()
        .filter(|l| addr_index.contains_key(l))
        .collect();

    let mut blocks = Vec::with_capacity(sorted_leaders.len());
    for (bi, &leader) in sorted_leaders.iter().enumerate() {
        let next_leader = sorted_leaders.get(bi + 1).copied().unwrap_or(func_end);
        let mut bb = BasicBlock {
            start: leader,
            insns: Vec::new(),
            successors: Vec::new(),
        };

        let mut idx = addr_index[&leader];
        while idx < instructions.len() {
            let insn = &instructions[idx];
            if insn.addr >= next_leader && insn.addr != leader {
                break;
            }
            bb.insns.push(insn.clone());
            idx += 1;
            if insn.is_terminator() || insn.is_cond_jump() {
                break;
            }
        }

        if let Some(last) = bb.last().cloned() {
            if last.is_ret() {
                // No successors.
            } else if last.is_jump() {
                if let Some(target) = last.jump_target {
                    if target >= func_start && target < func_end {
                        bb.successors.push(target);
                    }
                }
            } else if last.is_cond_jump() {
                if last.end_addr() < func_end {
                    bb.successors.push(last.end_addr());
                }
                if let Some(target) = last.jump_target {
                    if target >= func_start && target < func_end {
                        bb.successors.push(target);
                    }
                }
            } else if last.end_addr() < func_end && addr_index.contains_key(&last.end_addr()) {
                bb.successors.push(last.end_addr());
            }
        }

        blocks.push(bb);
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8], va: u32) -> Vec<Instr> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < bytes.len() {
            let off = ip;
            let mut insn = Instr::decode_one(bytes, &mut ip, va + off as u32).unwrap();
            insn.resolve_targets(0, u32::MAX);
            out.push(insn);
        }
        out
    }

    #[test]
    fn it_splits_at_branch_targets_and_falls_through() {
        // 0x1000: cmp eax, 1; 0x1003: jz 0x1008; 0x1005: inc eax;
        // 0x1006: jmp 0x1008 (eb 00: to next); 0x1008: ret
        let code = [
            0x83, 0xF8, 0x01, // cmp eax, 1
            0x74, 0x03, // jz +3 -> 0x1008
            0x40, // inc eax
            0xEB, 0x00, // jmp +0 -> 0x1008
            0xC3, // ret
        ];
        let insns = decode_all(&code, 0x1000);
        let blocks = build_basic_blocks(&insns, 0x1000, 0x1009);
        let starts: Vec<u32> = blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0x1000, 0x1005, 0x1008]);

        // Conditional block: fall-through plus target.
        assert_eq!(blocks[0].successors, vec![0x1005, 0x1008]);
        // Unconditional jump block.
        assert_eq!(blocks[1].successors, vec![0x1008]);
        // Return block has no successors.
        assert!(blocks[2].successors.is_empty());
    }

    #[test]
    fn it_starts_a_block_after_calls() {
        let code = [
            0xE8, 0x01, 0x00, 0x00, 0x00, // call +1 -> 0x1006
            0x90, // nop (leader: after call)
            0xC3, // 0x1006: ret
        ];
        let insns = decode_all(&code, 0x1000);
        let blocks = build_basic_blocks(&insns, 0x1000, 0x1007);
        let starts: Vec<u32> = blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0x1000, 0x1005, 0x1006]);
        // The call block falls through into the next block.
        assert_eq!(blocks[0].successors, vec![0x1005]);
    }
}
