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

//! Cross-reference index: code→code and code→data edges, bidirectional,
//! with kernel-call sites additionally indexed by thunk address.

use i386::Engine;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;
use xbe::Image;

fn hex_addr<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XrefKind {
    Call,
    Jump,
    CondJump,
    DataRead,
    DataWrite,
    KernelCall,
}

impl XrefKind {
    pub fn key(&self) -> &'static str {
        match self {
            XrefKind::Call => "call",
            XrefKind::Jump => "jump",
            XrefKind::CondJump => "cond_jump",
            XrefKind::DataRead => "data_read",
            XrefKind::DataWrite => "data_write",
            XrefKind::KernelCall => "kernel_call",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Xref {
    #[serde(rename = "from", serialize_with = "hex_addr")]
    pub from_addr: u32,
    #[serde(rename = "to", serialize_with = "hex_addr")]
    pub to_addr: u32,
    #[serde(rename = "type")]
    pub kind: XrefKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

#[derive(Default)]
pub struct XrefIndex {
    from: BTreeMap<u32, Vec<Xref>>,
    to: BTreeMap<u32, Vec<Xref>>,
    kernel_calls: BTreeMap<u32, Vec<u32>>,
}

impl XrefIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, xref: Xref) {
        self.from
            .entry(xref.from_addr)
            .or_default()
            .push(xref.clone());
        self.to.entry(xref.to_addr).or_default().push(xref);
    }

    fn add_kernel_call_site(&mut self, thunk_addr: u32, caller: u32) {
        self.kernel_calls.entry(thunk_addr).or_default().push(caller);
    }

    pub fn refs_from(&self, addr: u32) -> &[Xref] {
        self.from.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn refs_to(&self, addr: u32) -> &[Xref] {
        self.to.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Call-edge sources targeting `func_addr`.
    pub fn callers_of(&self, func_addr: u32) -> Vec<u32> {
        self.refs_to(func_addr)
            .iter()
            .filter(|x| x.kind == XrefKind::Call)
            .map(|x| x.from_addr)
            .collect()
    }

    pub fn kernel_callers_of(&self, thunk_addr: u32) -> &[u32] {
        self.kernel_calls
            .get(&thunk_addr)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.from.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
    }

    pub fn count_by_kind(&self) -> BTreeMap<XrefKind, usize> {
        let mut counts = BTreeMap::new();
        for refs in self.from.values() {
            for r in refs {
                *counts.entry(r.kind).or_insert(0) += 1;
            }
        }
        counts
    }

    /// All edges, ordered by source address.
    pub fn all(&self) -> impl Iterator<Item = &Xref> {
        self.from.values().flatten()
    }
}

/// One pass over the decoded instructions builds the whole index.
pub fn build_xrefs(engine: &Engine, image: &Image) -> XrefIndex {
    let mut index = XrefIndex::new();

    for insn in engine.instructions.values() {
        if insn.is_call() {
            if let Some(target) = insn.call_target {
                index.add(Xref {
                    from_addr: insn.addr,
                    to_addr: target,
                    kind: XrefKind::Call,
                    kernel_name: None,
                });
            }
            if let Some(thunk) = insn.memory_ref {
                match image.kernel_import_at(thunk) {
                    Some(ki) => {
                        index.add(Xref {
                            from_addr: insn.addr,
                            to_addr: thunk,
                            kind: XrefKind::KernelCall,
                            kernel_name: Some(ki.name.clone()),
                        });
                        index.add_kernel_call_site(thunk, insn.addr);
                    }
                    None => {
                        index.add(Xref {
                            from_addr: insn.addr,
                            to_addr: thunk,
                            kind: XrefKind::Call,
                            kernel_name: None,
                        });
                    }
                }
            }
            continue;
        }

        if insn.is_branch() {
            if let Some(thunk) = insn.memory_ref {
                if let Some(ki) = image.kernel_import_at(thunk) {
                    index.add(Xref {
                        from_addr: insn.addr,
                        to_addr: thunk,
                        kind: XrefKind::KernelCall,
                        kernel_name: Some(ki.name.clone()),
                    });
                    index.add_kernel_call_site(thunk, insn.addr);
                }
            }
            if let Some(target) = insn.jump_target {
                index.add(Xref {
                    from_addr: insn.addr,
                    to_addr: target,
                    kind: if insn.is_jump() {
                        XrefKind::Jump
                    } else {
                        XrefKind::CondJump
                    },
                    kernel_name: None,
                });
            }
            continue;
        }

        if let Some(target) = insn.memory_ref {
            index.add(Xref {
                from_addr: insn.addr,
                to_addr: target,
                kind: data_ref_kind(insn),
                kernel_name: None,
            });
        }
    }

    debug!("built {} xrefs", index.len());
    index
}

// A flat memory operand in destination position is a write, except for
// instructions that only read their first operand.
fn data_ref_kind(insn: &i386::Instr) -> XrefKind {
    use i386::Mnemonic;
    if matches!(
        insn.mnemonic,
        Mnemonic::Cmp | Mnemonic::Test | Mnemonic::Bt | Mnemonic::Push
    ) {
        return XrefKind::DataRead;
    }
    if let Some(i386::Operand::Memory(mr)) = insn.operands.first() {
        if mr.is_flat() && insn.operands.len() >= 2 {
            return XrefKind::DataWrite;
        }
    }
    XrefKind::DataRead
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xref(from: u32, to: u32, kind: XrefKind) -> Xref {
        Xref {
            from_addr: from,
            to_addr: to,
            kind,
            kernel_name: None,
        }
    }

    #[test]
    fn it_indexes_both_endpoints() {
        let mut index = XrefIndex::new();
        index.add(xref(0x1000, 0x2000, XrefKind::Call));
        index.add(xref(0x1005, 0x2000, XrefKind::Call));
        index.add(xref(0x1008, 0x2000, XrefKind::Jump));
        assert_eq!(index.refs_from(0x1000).len(), 1);
        assert_eq!(index.refs_to(0x2000).len(), 3);
        assert_eq!(index.callers_of(0x2000), vec![0x1000, 0x1005]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn it_counts_by_kind() {
        let mut index = XrefIndex::new();
        index.add(xref(0x1000, 0x2000, XrefKind::Call));
        index.add(xref(0x1005, 0x3000, XrefKind::DataRead));
        index.add(xref(0x100A, 0x3000, XrefKind::DataRead));
        let counts = index.count_by_kind();
        assert_eq!(counts[&XrefKind::Call], 1);
        assert_eq!(counts[&XrefKind::DataRead], 2);
    }
}
