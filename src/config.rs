// Search-path configuration.
//
// Imports are resolved against a module path, an object path and a
// system include path. The defaults suit an installed toolchain; a RON
// file can override them, and the CLI can override individual fields on
// top of that.

use std::fs::File;
use std::path::{Path, PathBuf};

use ron::de::from_reader;
use serde::Deserialize;

use crate::error::{Error, Location, Result};

pub const DEFAULT_INCLUDE_PATH: &str = "/usr/local/include/mxvm/modules";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub module_path: PathBuf,
    pub object_path: PathBuf,
    pub include_path: PathBuf,
}

impl Default for Paths {
    fn default() -> Paths {
        Paths {
            module_path: PathBuf::from("."),
            object_path: PathBuf::from("."),
            include_path: PathBuf::from(DEFAULT_INCLUDE_PATH),
        }
    }
}

impl Paths {
    pub fn load(path: &Path) -> Result<Paths> {
        let file = File::open(path)?;
        from_reader(file).map_err(|e| Error::Parse {
            loc: Location::new(&path.to_string_lossy(), 0, 0),
            msg: format!("{}", e),
        })
    }

    // Module descriptors: <module_path>, then <include_path>.
    pub fn module_search(&self) -> Vec<PathBuf> {
        vec![self.module_path.clone(), self.include_path.clone()]
    }

    // Object units: <object_path>, then <include_path>.
    pub fn object_search(&self) -> Vec<PathBuf> {
        vec![self.object_path.clone(), self.include_path.clone()]
    }

    // Shared libraries are searched next to the module descriptors.
    pub fn library_search(&self) -> Vec<PathBuf> {
        self.module_search()
    }
}
