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

//! The x86 → C lifter.
//!
//! Each translated function is straight-line C over 32-bit unsigned
//! register locals and the runtime shim's access macros; no control-flow
//! or type reconstruction is attempted. See `recomp_types.h` in the shim
//! for the macro contract.

mod blocks;
mod cond;
mod lifter;
mod operand;
mod output;
mod translate;

pub use crate::{
    blocks::{build_basic_blocks, BasicBlock},
    cond::{advance, condition, flag_effect, FlagEffect, FlagState},
    lifter::{lift_block, Lifter},
    output::{translate_all, TranslateStats, DEFAULT_CHUNK_SIZE},
    translate::FunctionTranslator,
};
