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
use pipeline::{AnalyzeOptions, TranslateOptions};
use std::path::PathBuf;
use structopt::StructOpt;

/// Translate an analyzed XBE into per-function C sources
#[derive(Debug, StructOpt)]
struct Opt {
    /// The XBE to translate
    input: PathBuf,

    /// Output directory for the generated C
    #[structopt(short, long, default_value = "recomp")]
    output: PathBuf,

    /// Functions per generated translation unit
    #[structopt(long, default_value = "1000")]
    chunk_size: usize,

    /// Only disassemble the .text section
    #[structopt(long)]
    text_only: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let analyze_options = AnalyzeOptions {
        text_only: opt.text_only,
        ..Default::default()
    };
    let databases = pipeline::analyze(&opt.input, &analyze_options)?;

    let stats = pipeline::translate(
        &databases,
        &opt.output,
        &TranslateOptions {
            chunk_size: opt.chunk_size,
        },
    )?;

    println!(
        "{}/{} functions translated ({} failed, {} gap statements, {} chunks)",
        stats.translated, stats.total, stats.failed, stats.translation_gaps, stats.num_chunks
    );
    println!("output written to {}", opt.output.display());
    Ok(())
}
