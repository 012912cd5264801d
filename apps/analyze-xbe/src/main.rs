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
use pipeline::{AnalysisOutcome, AnalyzeOptions};
use std::path::PathBuf;
use structopt::StructOpt;

/// Run the static-analysis pipeline over an XBE and write the JSON
/// databases
#[derive(Debug, StructOpt)]
struct Opt {
    /// The XBE to analyze
    input: PathBuf,

    /// Output directory for the analysis databases
    #[structopt(short, long, default_value = "analysis")]
    output: PathBuf,

    /// Only disassemble the .text section
    #[structopt(long)]
    text_only: bool,

    /// Re-analyze even if the cache is valid
    #[structopt(short, long)]
    force: bool,

    /// Fold single-jump thunk functions into their targets
    #[structopt(long)]
    fold_thunks: bool,

    /// Treat truncated epilogues as callee-cleans
    #[structopt(long)]
    truncated_epilogue_callee_cleans: bool,

    /// Merge contiguous vtable candidates into one class
    #[structopt(long)]
    merge_vtables: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let options = AnalyzeOptions {
        text_only: opt.text_only,
        force: opt.force,
        fold_jump_only_thunks: opt.fold_thunks,
        truncated_epilogue_is_callee_cleans: opt.truncated_epilogue_callee_cleans,
        merge_prefix_vtables: opt.merge_vtables,
    };

    match pipeline::run_analysis(&opt.input, &opt.output, &options)? {
        AnalysisOutcome::CacheHit => {
            println!("cache hit - outputs in {} are current", opt.output.display());
        }
        AnalysisOutcome::Analyzed(db) => {
            println!(
                "{} instructions, {} functions, {} xrefs, {} labels, {} globals, {} vtables",
                db.engine.len(),
                db.functions.len(),
                db.xrefs.len(),
                db.labels.len(),
                db.globals.globals.len(),
                db.identification.vtables.len(),
            );
            println!("analysis written to {}", opt.output.display());
        }
    }
    Ok(())
}
