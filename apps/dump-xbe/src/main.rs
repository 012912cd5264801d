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
use anyhow::Result;
use i386::Engine;
use structopt::StructOpt;
use xbe::Image;

/// Dump XBE container structure
#[derive(Debug, StructOpt)]
struct Opt {
    /// XBE files to dump
    inputs: Vec<String>,

    /// Disassemble the code sections as well
    #[structopt(short, long)]
    disassemble: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();
    for input in &opt.inputs {
        show_xbe(input, opt.disassemble)?;
    }
    Ok(())
}

fn show_xbe(path: &str, disassemble: bool) -> Result<()> {
    let image = Image::load(path)?;

    println!("{path}");
    println!("{}", "=".repeat(path.len()));
    if let Some(title) = &image.title_name {
        println!("title:       {title}");
    }
    println!("base:        0x{:08X}", image.base_address);
    println!("image size:  0x{:08X}", image.image_size);
    println!("entry:       0x{:08X}", image.entry_point);
    println!("kthunk:      0x{:08X}", image.kernel_thunk_addr);

    println!("sections -");
    for sec in &image.sections {
        println!(
            "\t{:8} vaddr: 0x{:08X}  vsize: 0x{:06X}  raw: 0x{:06X}+0x{:06X}  {}{}",
            sec.name,
            sec.virtual_addr,
            sec.virtual_size,
            sec.raw_addr,
            sec.raw_size,
            if sec.executable() { "X" } else { "-" },
            if sec.writable() { "W" } else { "-" },
        );
    }

    println!("kernel imports -");
    for ki in &image.kernel_imports {
        println!("\t{:>3} - {:32} @ 0x{:08X}", ki.ordinal, ki.name, ki.thunk_addr);
    }

    if disassemble {
        let mut engine = Engine::new();
        let sections: Vec<xbe::Section> = image.sections_code().cloned().collect();
        for sec in &sections {
            let n = engine.sweep_section(&image, sec, None);
            println!("{}: {} instructions -", sec.name, n);
            for insn in engine.instructions_in_range(sec.virtual_addr, sec.end()) {
                println!("  @{:08X}: {}", insn.addr, insn);
            }
        }
    }

    Ok(())
}
