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

//! Whole-program C output: chunked translation units, one shared header
//! of forward declarations, and the VA → function-pointer dispatch table.
//!
//! Function text streams to its chunk file as soon as the chunk is full;
//! only names and declarations survive to the end for the header and the
//! dispatch table.

use crate::translate::FunctionTranslator;
use abi::AbiDatabase;
use anyhow::Result;
use funcs::FunctionTable;
use ident::Identification;
use labels::LabelTable;
use log::{debug, info};
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};
use xbe::Image;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Default)]
pub struct TranslateStats {
    pub total: usize,
    pub translated: usize,
    pub failed: usize,
    pub translation_gaps: u64,
    pub total_lines: usize,
    pub num_chunks: usize,
    pub files: Vec<PathBuf>,
}

struct Emitted {
    addr: u32,
    name: String,
    declaration: String,
    failed: bool,
}

/// Translate every function and write the output tree:
/// `recomp_NNNN.c` chunks, `recomp_funcs.h`, and `recomp_dispatch.c`.
pub fn translate_all(
    image: &Image,
    functions: &FunctionTable,
    labels: &LabelTable,
    idents: &Identification,
    abi: &AbiDatabase,
    out_dir: &Path,
    chunk_size: usize,
) -> Result<TranslateStats> {
    std::fs::create_dir_all(out_dir)?;
    let chunk_size = chunk_size.max(1);

    let mut translator = FunctionTranslator::new(image, functions, labels, idents, abi);
    let mut stats = TranslateStats {
        total: functions.len(),
        ..Default::default()
    };
    let mut emitted: Vec<Emitted> = Vec::new();

    let all: Vec<&funcs::Function> = functions.all().collect();
    for (ci, chunk) in all.chunks(chunk_size).enumerate() {
        let path = out_dir.join(format!("recomp_{ci:04}.c"));
        let mut file = File::create(&path)?;

        writeln!(file, "/**")?;
        writeln!(file, " * Recompiled code chunk {ci}")?;
        writeln!(
            file,
            " * Functions: {} (0x{:08X} - 0x{:08X})",
            chunk.len(),
            chunk.first().map(|f| f.start).unwrap_or(0),
            chunk.last().map(|f| f.start).unwrap_or(0),
        )?;
        writeln!(file, " */")?;
        writeln!(file)?;
        writeln!(file, "#include \"recomp_funcs.h\"")?;
        writeln!(file, "#include <math.h>")?;
        writeln!(file, "#include <string.h>")?;
        writeln!(file)?;

        for f in chunk {
            match translator.translate_function(f) {
                Some(code) => {
                    stats.translated += 1;
                    stats.total_lines += code.lines().count();
                    writeln!(file, "{code}")?;
                    emitted.push(Emitted {
                        addr: f.start,
                        name: f.name.clone(),
                        declaration: translator.declaration(f.start, &f.name),
                        failed: false,
                    });
                }
                None => {
                    stats.failed += 1;
                    writeln!(file, "/* FAILED: {} at 0x{:08X} */", f.name, f.start)?;
                    writeln!(file, "void {}(void) {{ /* translation failed */ }}", f.name)?;
                    writeln!(file)?;
                    emitted.push(Emitted {
                        addr: f.start,
                        name: f.name.clone(),
                        declaration: format!("void {}(void)", f.name),
                        failed: true,
                    });
                }
            }
        }
        debug!("wrote {} ({} functions)", path.display(), chunk.len());
        stats.files.push(path);
        stats.num_chunks += 1;
    }
    stats.translation_gaps = translator.translation_gaps;

    let header_path = out_dir.join("recomp_funcs.h");
    write_header(&header_path, &emitted, stats.translated)?;
    stats.files.insert(0, header_path);

    let dispatch_path = out_dir.join("recomp_dispatch.c");
    write_dispatch(&dispatch_path, &emitted)?;
    stats.files.push(dispatch_path);

    info!(
        "translated {} functions ({} failed, {} gap statements) into {} chunks",
        stats.translated, stats.failed, stats.translation_gaps, stats.num_chunks
    );
    Ok(stats)
}

fn write_header(path: &Path, emitted: &[Emitted], translated: usize) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "/**")?;
    writeln!(file, " * Recompiled function declarations")?;
    writeln!(file, " * {translated} functions, auto-generated")?;
    writeln!(file, " */")?;
    writeln!(file)?;
    writeln!(file, "#ifndef RECOMP_FUNCS_H")?;
    writeln!(file, "#define RECOMP_FUNCS_H")?;
    writeln!(file)?;
    writeln!(file, "#include \"recomp_types.h\"")?;
    writeln!(file)?;
    for e in emitted {
        writeln!(file, "{};", e.declaration)?;
    }
    writeln!(file)?;
    writeln!(file, "#endif /* RECOMP_FUNCS_H */")?;
    Ok(())
}

/// Sorted `(xbox_va, function_pointer)` table with a binary-search lookup.
/// This is the contract with the external runtime harness.
fn write_dispatch(path: &Path, emitted: &[Emitted]) -> Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "/**")?;
    writeln!(file, " * Recompiled function dispatch table")?;
    writeln!(
        file,
        " * Maps {} original VAs to translated function pointers.",
        emitted.len()
    )?;
    writeln!(file, " */")?;
    writeln!(file)?;
    writeln!(file, "#include \"recomp_funcs.h\"")?;
    writeln!(file, "#include <stddef.h>")?;
    writeln!(file)?;
    writeln!(file, "typedef void (*recomp_func_t)(void);")?;
    writeln!(file)?;
    writeln!(file, "typedef struct {{")?;
    writeln!(file, "    uint32_t xbox_va;")?;
    writeln!(file, "    recomp_func_t func;")?;
    writeln!(file, "}} recomp_entry_t;")?;
    writeln!(file)?;
    writeln!(file, "static const recomp_entry_t g_recomp_table[] = {{")?;
    for e in emitted {
        writeln!(
            file,
            "    {{ 0x{:08X}u, (recomp_func_t){} }},",
            e.addr, e.name
        )?;
    }
    writeln!(file, "}};")?;
    writeln!(file)?;
    writeln!(
        file,
        "static const size_t g_recomp_table_size = {};",
        emitted.len()
    )?;
    writeln!(file)?;
    writeln!(file, "recomp_func_t recomp_lookup(uint32_t xbox_va)")?;
    writeln!(file, "{{")?;
    writeln!(file, "    size_t lo = 0, hi = g_recomp_table_size;")?;
    writeln!(file, "    while (lo < hi) {{")?;
    writeln!(file, "        size_t mid = lo + (hi - lo) / 2;")?;
    writeln!(file, "        if (g_recomp_table[mid].xbox_va < xbox_va)")?;
    writeln!(file, "            lo = mid + 1;")?;
    writeln!(file, "        else if (g_recomp_table[mid].xbox_va > xbox_va)")?;
    writeln!(file, "            hi = mid;")?;
    writeln!(file, "        else")?;
    writeln!(file, "            return g_recomp_table[mid].func;")?;
    writeln!(file, "    }}")?;
    writeln!(file, "    return NULL;")?;
    writeln!(file, "}}")?;
    writeln!(file)?;
    writeln!(file, "size_t recomp_get_count(void)")?;
    writeln!(file, "{{")?;
    writeln!(file, "    return g_recomp_table_size;")?;
    writeln!(file, "}}")?;
    writeln!(file)?;
    writeln!(file, "/* Call every registered function, for bulk testing. */")?;
    writeln!(file, "size_t recomp_call_all(void)")?;
    writeln!(file, "{{")?;
    writeln!(file, "    size_t i;")?;
    writeln!(file, "    for (i = 0; i < g_recomp_table_size; i++) {{")?;
    writeln!(file, "        g_recomp_table[i].func();")?;
    writeln!(file, "    }}")?;
    writeln!(file, "    return g_recomp_table_size;")?;
    writeln!(file, "}}")?;
    Ok(())
}
