//! Module source loading.
//!
//! Import paths are `/`-separated identifiers; the loader maps a path to
//! source text. The filesystem loader resolves against a root directory by
//! appending the `.nat` extension.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use crate::NAT_EXT;

pub trait ModuleLoader {
    /// Return the source text for a module path.
    fn load(&self, path: &str) -> io::Result<String>;
}

/// Resolves modules against the host filesystem.
#[derive(Debug, Default)]
pub struct FsLoader {
    root: PathBuf,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsLoader { root: root.into() }
    }

    /// Append the source extension unless the path already carries it.
    pub fn qualify(path: &str) -> String {
        if path.ends_with(NAT_EXT) {
            path.to_string()
        } else {
            format!("{path}{NAT_EXT}")
        }
    }
}

impl ModuleLoader for FsLoader {
    fn load(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(Self::qualify(path)))
    }
}

/// An in-memory loader for embedders and tests.
#[derive(Debug, Default)]
pub struct SourceMap {
    modules: HashMap<String, String>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.modules.insert(path.into(), source.into());
    }
}

impl ModuleLoader for SourceMap {
    fn load(&self, path: &str) -> io::Result<String> {
        self.modules
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no module '{path}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualify_appends_the_extension_once() {
        assert_eq!(FsLoader::qualify("a/b"), "a/b.nat");
        assert_eq!(FsLoader::qualify("a/b.nat"), "a/b.nat");
    }

    #[test]
    fn fs_loader_reads_relative_to_its_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.nat"), "let x = 1;").unwrap();

        let loader = FsLoader::new(dir.path());
        assert_eq!(loader.load("mod").unwrap(), "let x = 1;");
        assert!(loader.load("missing").is_err());
    }

    #[test]
    fn source_map_serves_inserted_modules() {
        let mut map = SourceMap::new();
        map.insert("lib/util", "let y = 2;");
        assert_eq!(map.load("lib/util").unwrap(), "let y = 2;");
        assert!(map.load("lib/other").is_err());
    }
}
