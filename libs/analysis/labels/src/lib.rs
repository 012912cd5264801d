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

//! Symbol and label management: kernel imports, the entry point,
//! auto-named functions (`sub_XXXXXXXX`), and extracted strings.

use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use xbe::Image;

fn hex_addr<S: serde::Serializer>(v: &u32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{v:08X}"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    KernelImport,
    Function,
    StringRef,
    Data,
    EntryPoint,
    Thunk,
}

#[derive(Clone, Debug, Serialize)]
pub struct Label {
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LabelKind,
    pub section: String,
    pub confidence: f64,
}

impl Label {
    fn is_auto(&self) -> bool {
        self.name.starts_with("sub_")
    }
}

/// Central label table. Addresses are unique; name conflicts resolve by
/// confidence, then by preferring explicit names over `sub_XXXXXXXX`.
#[derive(Default)]
pub struct LabelTable {
    labels: BTreeMap<u32, Label>,
    names: HashMap<String, u32>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, label: Label) {
        let mut label = label;
        if let Some(existing) = self.labels.get(&label.address) {
            let wins = label.confidence > existing.confidence
                || (label.confidence == existing.confidence
                    && !label.is_auto()
                    && existing.is_auto());
            if !wins {
                return;
            }
            self.names.remove(&existing.name);
        }
        // Names must stay unique; a second address producing the same
        // name (duplicate string content, mostly) gets suffixed.
        if let Some(&other) = self.names.get(&label.name) {
            if other != label.address {
                label.name = format!("{}_{:08X}", label.name, label.address);
            }
        }
        self.names.insert(label.name.clone(), label.address);
        self.labels.insert(label.address, label);
    }

    #[inline]
    pub fn get(&self, address: u32) -> Option<&Label> {
        self.labels.get(&address)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Label> {
        self.names.get(name).and_then(|addr| self.labels.get(addr))
    }

    #[inline]
    pub fn has(&self, address: u32) -> bool {
        self.labels.contains_key(&address)
    }

    pub fn name_of(&self, address: u32) -> Option<&str> {
        self.labels.get(&address).map(|l| l.name.as_str())
    }

    /// Label name if present, bare hex address otherwise.
    pub fn display_name(&self, address: u32) -> String {
        match self.labels.get(&address) {
            Some(l) => l.name.clone(),
            None => format!("0x{address:08X}"),
        }
    }

    pub fn auto_name_function(&mut self, address: u32, section: &str, confidence: f64) -> String {
        if let Some(existing) = self.labels.get(&address) {
            if existing.kind == LabelKind::Function {
                return existing.name.clone();
            }
        }
        let name = format!("sub_{address:08X}");
        self.add(Label {
            address,
            name: name.clone(),
            kind: LabelKind::Function,
            section: section.to_owned(),
            confidence,
        });
        name
    }

    pub fn all(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    pub fn in_range(&self, lo: u32, hi: u32) -> impl Iterator<Item = &Label> {
        self.labels.range(lo..hi).map(|(_, l)| l)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn count_by_kind(&self, kind: LabelKind) -> usize {
        self.labels.values().filter(|l| l.kind == kind).count()
    }
}

/// Label every kernel import thunk as `xbox_<Name>`.
pub fn seed_kernel_labels(table: &mut LabelTable, image: &Image) -> usize {
    let mut count = 0;
    for ki in &image.kernel_imports {
        let section = image
            .section_at(ki.thunk_addr)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        table.add(Label {
            address: ki.thunk_addr,
            name: format!("xbox_{}", ki.name),
            kind: LabelKind::KernelImport,
            section,
            confidence: 1.0,
        });
        count += 1;
    }
    count
}

pub fn seed_entry_point(table: &mut LabelTable, image: &Image) {
    let section = image
        .section_at(image.entry_point)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| ".text".to_owned());
    table.add(Label {
        address: image.entry_point,
        name: "xbe_entry_point".to_owned(),
        kind: LabelKind::EntryPoint,
        section,
        confidence: 1.0,
    });
}

#[derive(Clone, Debug, Serialize)]
pub struct StringRef {
    #[serde(serialize_with = "hex_addr")]
    pub address: u32,
    #[serde(rename = "string")]
    pub text: String,
    pub length: usize,
}

const STRING_MIN_LEN: usize = 4;
const STRING_MAX_LEN: usize = 256;

fn is_string_byte(b: u8) -> bool {
    (0x20..0x7F).contains(&b) || b == 0x09 || b == 0x0A || b == 0x0D
}

/// Scan a read-only data section for NUL-terminated printable-ASCII runs.
pub fn extract_strings(image: &Image, section_name: &str) -> Vec<StringRef> {
    let section = match image.section(section_name) {
        Some(s) => s.clone(),
        None => return Vec::new(),
    };
    let data = image.section_data(&section);
    let mut strings = Vec::new();

    let mut i = 0usize;
    while i < data.len() {
        let start = i;
        while i < data.len() && i - start < STRING_MAX_LEN && is_string_byte(data[i]) {
            i += 1;
        }
        let length = i - start;
        if length >= STRING_MIN_LEN && i < data.len() && data[i] == 0 {
            let text: String = data[start..i].iter().map(|&b| b as char).collect();
            strings.push(StringRef {
                address: section.virtual_addr + start as u32,
                text,
                length,
            });
            i += 1; // skip the terminator
        } else {
            i += 1;
        }
    }
    debug!("{} strings in {}", strings.len(), section_name);
    strings
}

/// Register `str_*` labels for extracted strings.
pub fn seed_string_labels(table: &mut LabelTable, strings: &[StringRef], section: &str) -> usize {
    let mut count = 0;
    for sr in strings {
        let sanitized: String = sr
            .text
            .chars()
            .take(32)
            .map(|c| if c == ' ' || c == '/' { '_' } else { c })
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        let name = if sanitized.is_empty() {
            format!("str_{:08X}", sr.address)
        } else {
            format!("str_{sanitized}")
        };
        table.add(Label {
            address: sr.address,
            name,
            kind: LabelKind::StringRef,
            section: section.to_owned(),
            confidence: 0.8,
        });
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(addr: u32, name: &str, confidence: f64) -> Label {
        Label {
            address: addr,
            name: name.to_owned(),
            kind: LabelKind::Function,
            section: ".text".to_owned(),
            confidence,
        }
    }

    #[test]
    fn it_keeps_the_higher_confidence_label() {
        let mut table = LabelTable::new();
        table.add(label(0x1000, "sub_00001000", 0.9));
        table.add(label(0x1000, "loser", 0.5));
        assert_eq!(table.name_of(0x1000), Some("sub_00001000"));
        table.add(label(0x1000, "winner", 0.95));
        assert_eq!(table.name_of(0x1000), Some("winner"));
        // The replaced name no longer reverse-resolves.
        assert!(table.get_by_name("sub_00001000").is_none());
        assert_eq!(table.get_by_name("winner").unwrap().address, 0x1000);
    }

    #[test]
    fn it_prefers_explicit_names_on_ties() {
        let mut table = LabelTable::new();
        table.add(label(0x2000, "sub_00002000", 0.9));
        table.add(label(0x2000, "CameraUpdate", 0.9));
        assert_eq!(table.name_of(0x2000), Some("CameraUpdate"));
        // But an explicit name never loses to an auto name at equal confidence.
        table.add(label(0x2000, "sub_00002000", 0.9));
        assert_eq!(table.name_of(0x2000), Some("CameraUpdate"));
    }

    #[test]
    fn it_auto_names_functions_idempotently() {
        let mut table = LabelTable::new();
        let n1 = table.auto_name_function(0x3000, ".text", 0.5);
        let n2 = table.auto_name_function(0x3000, ".text", 0.5);
        assert_eq!(n1, "sub_00003000");
        assert_eq!(n1, n2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn it_formats_display_names() {
        let mut table = LabelTable::new();
        table.add(label(0x4000, "frobnicate", 0.9));
        assert_eq!(table.display_name(0x4000), "frobnicate");
        assert_eq!(table.display_name(0x4004), "0x00004004");
    }
}
