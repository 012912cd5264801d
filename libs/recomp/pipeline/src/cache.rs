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

//! Incremental-analysis cache: a content hash of the input binary plus
//! the option tag, stored next to the outputs. A matching hash on a later
//! run means the outputs on disk are still valid.

use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const CACHE_FILENAME: &str = "analysis_cache.json";
const CACHE_VERSION: u32 = 2;

const REQUIRED_OUTPUTS: &[&str] = &[
    "functions.json",
    "labels.json",
    "xrefs.json",
    "strings.json",
    "identified_functions.json",
    "abi_functions.json",
    "globals.json",
    "structures.json",
    "summary.json",
];

#[derive(Debug, Serialize, Deserialize)]
struct CacheData {
    version: u32,
    binary_md5: String,
    options_tag: String,
    elapsed_seconds: f64,
}

pub struct AnalysisCache {
    out_dir: PathBuf,
}

impl AnalysisCache {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
        }
    }

    fn cache_path(&self) -> PathBuf {
        self.out_dir.join(CACHE_FILENAME)
    }

    fn hash_file(path: &Path) -> Result<String> {
        let bytes = fs::read(path)?;
        Ok(format!("{:x}", md5::compute(&bytes)))
    }

    fn load(&self) -> Option<CacheData> {
        let text = fs::read_to_string(self.cache_path()).ok()?;
        let data: CacheData = serde_json::from_str(&text).ok()?;
        (data.version == CACHE_VERSION).then(|| data)
    }

    /// True when the cached hash matches the binary, the flags match,
    /// and every output document still exists.
    pub fn is_valid(&self, binary_path: &Path, options_tag: &str) -> Result<bool> {
        let cache = match self.load() {
            Some(c) => c,
            None => return Ok(false),
        };
        if cache.options_tag != options_tag {
            return Ok(false);
        }
        if cache.binary_md5 != Self::hash_file(binary_path)? {
            debug!("cache stale: binary changed");
            return Ok(false);
        }
        for name in REQUIRED_OUTPUTS {
            if !self.out_dir.join(name).exists() {
                debug!("cache stale: {name} missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn save(&self, binary_path: &Path, options_tag: &str, elapsed_seconds: f64) -> Result<()> {
        fs::create_dir_all(&self.out_dir)?;
        let data = CacheData {
            version: CACHE_VERSION,
            binary_md5: Self::hash_file(binary_path)?,
            options_tag: options_tag.to_owned(),
            elapsed_seconds,
        };
        fs::write(self.cache_path(), serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }

    pub fn invalidate(&self) -> Result<()> {
        let path = self.cache_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
