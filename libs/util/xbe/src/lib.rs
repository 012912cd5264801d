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

//! Loader for the XBE container format used by retail Xbox executables.
//!
//! The interesting header fields (entry point and kernel-thunk pointer) are
//! stored XOR-obfuscated with keys that differ between retail and debug
//! images; `Image::from_bytes` tries the retail key first and falls back to
//! the debug key when the decoded value does not land inside the image.

mod kernel;

use anyhow::Result;
use bitflags::bitflags;
use log::{debug, trace, warn};
use std::{collections::HashMap, fs, path::Path, str};
use thiserror::Error;
use zerocopy::{byteorder::U32, FromBytes, LayoutVerified, Unaligned};

pub use crate::kernel::kernel_export_name;

type Le32 = U32<zerocopy::byteorder::LE>;

const XBE_MAGIC: &[u8; 4] = b"XBEH";
const HEADER_SIZE: usize = 0x178;

const OFF_BASE_ADDRESS: usize = 0x104;
const OFF_IMAGE_SIZE: usize = 0x10C;
const OFF_CERT_ADDR: usize = 0x118;
const OFF_NUM_SECTIONS: usize = 0x11C;
const OFF_SECTION_HEADERS: usize = 0x120;
const OFF_ENTRY_POINT: usize = 0x128;
const OFF_TLS_ADDR: usize = 0x12C;
const OFF_KERNEL_THUNK: usize = 0x158;

pub const ENTRY_XOR_RETAIL: u32 = 0xA8FC_57AB;
pub const ENTRY_XOR_DEBUG: u32 = 0x9485_9D4B;
pub const THUNK_XOR_RETAIL: u32 = 0x5B6D_40B6;
pub const THUNK_XOR_DEBUG: u32 = 0xEFB1_F152;

#[derive(Debug, Error)]
pub enum XbeError {
    #[error("invalid XBE magic: {found:02X?}")]
    InvalidMagic { found: [u8; 4] },
    #[error("truncated XBE: {what} at offset 0x{offset:X} exceeds file length 0x{len:X}")]
    Truncated {
        what: &'static str,
        offset: usize,
        len: usize,
    },
    #[error("corrupt XBE: {reason}")]
    Corrupt { reason: String },
}

bitflags! {
    pub struct SectionFlags: u32 {
        const WRITABLE        = 0x0000_0001;
        const PRELOAD         = 0x0000_0002;
        const EXECUTABLE      = 0x0000_0004;
        const INSERTED_FILE   = 0x0000_0008;
        const HEAD_PAGE_RO    = 0x0000_0010;
        const TAIL_PAGE_RO    = 0x0000_0020;
    }
}

#[derive(FromBytes, Unaligned)]
#[repr(C)]
struct SectionHeaderRaw {
    flags: Le32,
    virtual_addr: Le32,
    virtual_size: Le32,
    raw_addr: Le32,
    raw_size: Le32,
    name_addr: Le32,
    name_refcount: Le32,
    head_shared_page: Le32,
    tail_shared_page: Le32,
    digest: [u8; 20],
}

#[derive(Clone, Debug)]
pub struct Section {
    pub name: String,
    pub virtual_addr: u32,
    pub virtual_size: u32,
    pub raw_addr: u32,
    pub raw_size: u32,
    pub flags: SectionFlags,
}

impl Section {
    #[inline]
    pub fn end(&self) -> u32 {
        self.virtual_addr + self.virtual_size
    }

    #[inline]
    pub fn contains(&self, va: u32) -> bool {
        va >= self.virtual_addr && va < self.end()
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.flags.contains(SectionFlags::WRITABLE)
    }

    #[inline]
    pub fn executable(&self) -> bool {
        self.flags.contains(SectionFlags::EXECUTABLE)
    }
}

#[derive(Clone, Debug)]
pub struct KernelImport {
    pub ordinal: u32,
    pub name: String,
    pub thunk_addr: u32,
}

/// The loaded binary image. Raw bytes are read once and held for the
/// lifetime of the analysis; all reads go through VA translation.
#[derive(Debug)]
pub struct Image {
    data: Vec<u8>,
    pub base_address: u32,
    pub image_size: u32,
    pub entry_point: u32,
    pub kernel_thunk_addr: u32,
    pub tls_addr: u32,
    pub title_name: Option<String>,
    pub sections: Vec<Section>,
    pub kernel_imports: Vec<KernelImport>,
    thunk_index: HashMap<u32, usize>,
}

fn read_u32(data: &[u8], offset: usize, what: &'static str) -> Result<u32, XbeError> {
    if offset + 4 > data.len() {
        return Err(XbeError::Truncated {
            what,
            offset,
            len: data.len(),
        });
    }
    Ok(u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

impl Image {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Image> {
        let data = fs::read(path.as_ref())?;
        Ok(Self::from_bytes(data)?)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Image, XbeError> {
        if data.len() < 4 || &data[0..4] != XBE_MAGIC {
            let mut found = [0u8; 4];
            for (i, b) in data.iter().take(4).enumerate() {
                found[i] = *b;
            }
            return Err(XbeError::InvalidMagic { found });
        }
        if data.len() < HEADER_SIZE {
            return Err(XbeError::Truncated {
                what: "image header",
                offset: HEADER_SIZE,
                len: data.len(),
            });
        }

        let base_address = read_u32(&data, OFF_BASE_ADDRESS, "base address")?;
        let image_size = read_u32(&data, OFF_IMAGE_SIZE, "image size")?;
        let cert_addr = read_u32(&data, OFF_CERT_ADDR, "certificate pointer")?;
        let num_sections = read_u32(&data, OFF_NUM_SECTIONS, "section count")?;
        let section_headers_va = read_u32(&data, OFF_SECTION_HEADERS, "section header pointer")?;
        let entry_raw = read_u32(&data, OFF_ENTRY_POINT, "entry point")?;
        let tls_addr = read_u32(&data, OFF_TLS_ADDR, "TLS pointer")?;
        let thunk_raw = read_u32(&data, OFF_KERNEL_THUNK, "kernel thunk pointer")?;

        let image_end = base_address.wrapping_add(image_size);
        let in_image = |va: u32| va >= base_address && va < image_end;

        // Entry point and kernel thunk are XOR-obfuscated. Retail wins on
        // ambiguity.
        let (entry_point, retail) = {
            let retail = entry_raw ^ ENTRY_XOR_RETAIL;
            let debug = entry_raw ^ ENTRY_XOR_DEBUG;
            if in_image(retail) {
                (retail, true)
            } else if in_image(debug) {
                (debug, false)
            } else {
                return Err(XbeError::Corrupt {
                    reason: format!(
                        "entry point 0x{entry_raw:08X} decodes outside the image under both keys"
                    ),
                });
            }
        };
        let kernel_thunk_addr = if retail {
            thunk_raw ^ THUNK_XOR_RETAIL
        } else {
            thunk_raw ^ THUNK_XOR_DEBUG
        };
        debug!(
            "entry 0x{:08X} ({}), kernel thunk 0x{:08X}",
            entry_point,
            if retail { "retail" } else { "debug" },
            kernel_thunk_addr
        );

        // Section table lives in the mapped header region.
        let sec_off = section_headers_va.wrapping_sub(base_address) as usize;
        if sec_off < HEADER_SIZE {
            return Err(XbeError::Corrupt {
                reason: format!("section table at 0x{section_headers_va:08X} overlaps the header"),
            });
        }
        let sec_table_len = num_sections as usize * std::mem::size_of::<SectionHeaderRaw>();
        if sec_off + sec_table_len > data.len() {
            return Err(XbeError::Truncated {
                what: "section table",
                offset: sec_off + sec_table_len,
                len: data.len(),
            });
        }

        let mut sections = Vec::with_capacity(num_sections as usize);
        for i in 0..num_sections as usize {
            let off = sec_off + i * std::mem::size_of::<SectionHeaderRaw>();
            let raw = LayoutVerified::<_, SectionHeaderRaw>::new_unaligned(
                &data[off..off + std::mem::size_of::<SectionHeaderRaw>()],
            )
            .expect("section header slice has exact size")
            .into_ref();

            if raw.raw_addr.get() as usize + raw.raw_size.get() as usize > data.len() {
                return Err(XbeError::Truncated {
                    what: "section raw data",
                    offset: raw.raw_addr.get() as usize + raw.raw_size.get() as usize,
                    len: data.len(),
                });
            }

            let name = section_name(&data, base_address, raw.name_addr.get())
                .unwrap_or_else(|| format!("sec_{i}"));
            let flags = SectionFlags::from_bits_truncate(raw.flags.get());
            trace!(
                "section {:8} va 0x{:08X}+0x{:X} raw 0x{:X}+0x{:X} {:?}",
                name,
                raw.virtual_addr.get(),
                raw.virtual_size.get(),
                raw.raw_addr.get(),
                raw.raw_size.get(),
                flags
            );
            sections.push(Section {
                name,
                virtual_addr: raw.virtual_addr.get(),
                virtual_size: raw.virtual_size.get(),
                raw_addr: raw.raw_addr.get(),
                raw_size: raw.raw_size.get(),
                flags,
            });
        }

        let title_name = certificate_title(&data, base_address, cert_addr);

        let mut image = Image {
            data,
            base_address,
            image_size,
            entry_point,
            kernel_thunk_addr,
            tls_addr,
            title_name,
            sections,
            kernel_imports: Vec::new(),
            thunk_index: HashMap::new(),
        };
        image.scan_kernel_imports();
        Ok(image)
    }

    /// Walk the kernel thunk table: 32-bit words up to a zero terminator.
    /// Ordinal imports carry the high bit; anything else is a bound import
    /// and does not occur in retail images.
    fn scan_kernel_imports(&mut self) {
        let mut imports = Vec::new();
        let mut va = self.kernel_thunk_addr;
        loop {
            let word = match self.read_u32_le(va) {
                Some(w) => w,
                None => {
                    warn!("kernel thunk table at 0x{:08X} escapes the image", va);
                    break;
                }
            };
            if word == 0 {
                break;
            }
            if word & 0x8000_0000 != 0 {
                let ordinal = word & 0x7FFF_FFFF;
                let name = kernel_export_name(ordinal)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("ordinal_{ordinal}"));
                imports.push(KernelImport {
                    ordinal,
                    name,
                    thunk_addr: va,
                });
            }
            va += 4;
        }
        debug!("{} kernel imports", imports.len());
        self.thunk_index = imports
            .iter()
            .enumerate()
            .map(|(i, ki)| (ki.thunk_addr, i))
            .collect();
        self.kernel_imports = imports;
    }

    pub fn va_to_offset(&self, va: u32) -> Option<usize> {
        // The header region is mapped at the load base.
        if va >= self.base_address && va < self.base_address + 0x1000 {
            let off = (va - self.base_address) as usize;
            return (off < self.data.len()).then(|| off);
        }
        let sec = self.section_at(va)?;
        let off_in_sec = va - sec.virtual_addr;
        if off_in_sec < sec.raw_size {
            Some((sec.raw_addr + off_in_sec) as usize)
        } else {
            // Zero-fill tail (BSS); no backing bytes in the file.
            None
        }
    }

    pub fn read_bytes(&self, va: u32, len: usize) -> Option<&[u8]> {
        let off = self.va_to_offset(va)?;
        if off + len > self.data.len() {
            return None;
        }
        Some(&self.data[off..off + len])
    }

    pub fn read_u32_le(&self, va: u32) -> Option<u32> {
        let b = self.read_bytes(va, 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn section_at(&self, va: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(va))
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_data(&self, section: &Section) -> &[u8] {
        let lo = section.raw_addr as usize;
        let hi = lo + section.raw_size as usize;
        &self.data[lo..hi]
    }

    pub fn sections_executable(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable())
    }

    /// Sections worth disassembling: executable with backing bytes.
    pub fn sections_code(&self) -> impl Iterator<Item = &Section> {
        self.sections
            .iter()
            .filter(|s| s.executable() && s.raw_size > 0)
    }

    pub fn kernel_import_at(&self, thunk_addr: u32) -> Option<&KernelImport> {
        self.thunk_index
            .get(&thunk_addr)
            .map(|&i| &self.kernel_imports[i])
    }

    #[inline]
    pub fn contains(&self, va: u32) -> bool {
        va >= self.base_address && va < self.base_address.wrapping_add(self.image_size)
    }

    #[inline]
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }
}

fn section_name(data: &[u8], base: u32, name_va: u32) -> Option<String> {
    let off = name_va.checked_sub(base)? as usize;
    if off >= data.len() {
        return None;
    }
    let end = data[off..].iter().position(|&b| b == 0)?;
    str::from_utf8(&data[off..off + end]).ok().map(str::to_owned)
}

// The certificate stores the title name as 40 UTF-16LE code units at +0xC.
fn certificate_title(data: &[u8], base: u32, cert_va: u32) -> Option<String> {
    let off = cert_va.checked_sub(base)? as usize + 0xC;
    if off + 80 > data.len() {
        return None;
    }
    let units: Vec<u16> = data[off..off + 80]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(data: &mut [u8], off: usize, v: u32) {
        data[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Build a minimal retail image: header, one code section at
    /// va 0x11000 raw 0x400, one data section, a two-entry thunk table.
    fn build_image(code: &[u8]) -> Vec<u8> {
        let base = 0x0001_0000u32;
        let mut data = vec![0u8; 0x800 + code.len().max(0x10)];
        data[0..4].copy_from_slice(b"XBEH");
        put_u32(&mut data, OFF_BASE_ADDRESS, base);
        put_u32(&mut data, OFF_IMAGE_SIZE, 0x3000);
        put_u32(&mut data, OFF_NUM_SECTIONS, 2);
        put_u32(&mut data, OFF_SECTION_HEADERS, base + 0x200);
        put_u32(&mut data, OFF_ENTRY_POINT, 0x0001_1000 ^ ENTRY_XOR_RETAIL);
        put_u32(&mut data, OFF_KERNEL_THUNK, 0x0001_2000 ^ THUNK_XOR_RETAIL);

        // Section names in the header region.
        data[0x300..0x306].copy_from_slice(b".text\0");
        data[0x310..0x317].copy_from_slice(b".rdata\0");

        // .text: va 0x11000, raw at 0x400
        let s0 = 0x200;
        put_u32(&mut data, s0, 0x7); // flags: writable|preload|executable
        put_u32(&mut data, s0 + 4, 0x0001_1000);
        put_u32(&mut data, s0 + 8, 0x1000);
        put_u32(&mut data, s0 + 12, 0x400);
        put_u32(&mut data, s0 + 16, code.len() as u32);
        put_u32(&mut data, s0 + 20, base + 0x300);

        // .rdata: va 0x12000, raw at 0x600, virtual larger than raw (BSS tail)
        let s1 = 0x200 + 56;
        put_u32(&mut data, s1, 0x2);
        put_u32(&mut data, s1 + 4, 0x0001_2000);
        put_u32(&mut data, s1 + 8, 0x800);
        put_u32(&mut data, s1 + 12, 0x600);
        put_u32(&mut data, s1 + 16, 0x100);
        put_u32(&mut data, s1 + 20, base + 0x310);

        // Thunk table at .rdata start: RtlZeroMemory (314), KeQuerySystemTime (127).
        put_u32(&mut data, 0x600, 314 | 0x8000_0000);
        put_u32(&mut data, 0x604, 127 | 0x8000_0000);
        put_u32(&mut data, 0x608, 0);

        data[0x400..0x400 + code.len()].copy_from_slice(code);
        data
    }

    #[test]
    fn it_rejects_bad_magic() {
        let err = Image::from_bytes(b"MZXX....".to_vec()).unwrap_err();
        assert!(matches!(err, XbeError::InvalidMagic { .. }));
    }

    #[test]
    fn it_rejects_truncated_header() {
        let err = Image::from_bytes(b"XBEH".to_vec()).unwrap_err();
        assert!(matches!(err, XbeError::Truncated { .. }));
    }

    #[test]
    fn it_decodes_retail_entry_and_thunks() -> Result<()> {
        let image = Image::from_bytes(build_image(&[0xC3]))?;
        assert_eq!(image.entry_point, 0x0001_1000);
        assert_eq!(image.kernel_thunk_addr, 0x0001_2000);
        assert_eq!(image.kernel_imports.len(), 2);
        assert_eq!(image.kernel_imports[0].name, "RtlZeroMemory");
        assert_eq!(image.kernel_imports[0].thunk_addr, 0x0001_2000);
        assert_eq!(image.kernel_imports[1].name, "KeQuerySystemTime");
        assert!(image.kernel_import_at(0x0001_2004).is_some());
        Ok(())
    }

    #[test]
    fn it_translates_vas() -> Result<()> {
        let image = Image::from_bytes(build_image(&[0x55, 0x8B, 0xEC, 0xC3]))?;
        assert_eq!(image.va_to_offset(0x0001_1000), Some(0x400));
        assert_eq!(image.read_bytes(0x0001_1000, 3), Some(&[0x55, 0x8B, 0xEC][..]));
        // Past the raw tail of .rdata: BSS, no backing storage.
        assert_eq!(image.va_to_offset(0x0001_2100), None);
        // Outside any section or header.
        assert_eq!(image.va_to_offset(0x0050_0000), None);
        let text = image.section(".text").unwrap();
        assert!(text.executable());
        assert_eq!(image.section_at(0x0001_1002).unwrap().name, ".text");
        Ok(())
    }

    #[test]
    fn it_rejects_section_table_in_header() {
        let mut data = build_image(&[0xC3]);
        put_u32(&mut data, OFF_SECTION_HEADERS, 0x0001_0000 + 0x100);
        let err = Image::from_bytes(data).unwrap_err();
        assert!(matches!(err, XbeError::Corrupt { .. }));
    }

    #[test]
    fn it_falls_back_to_the_debug_key() -> Result<()> {
        let mut data = build_image(&[0xC3]);
        put_u32(&mut data, OFF_ENTRY_POINT, 0x0001_1000 ^ ENTRY_XOR_DEBUG);
        put_u32(&mut data, OFF_KERNEL_THUNK, 0x0001_2000 ^ THUNK_XOR_DEBUG);
        let image = Image::from_bytes(data)?;
        assert_eq!(image.entry_point, 0x0001_1000);
        assert_eq!(image.kernel_thunk_addr, 0x0001_2000);
        Ok(())
    }
}
