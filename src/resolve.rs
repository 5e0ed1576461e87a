//! Locating hook class files
//!
//! Transplant and insert need the bytes of the hook's defining class. Where
//! those bytes come from is pluggable: a [`ClassPath`] over directories and
//! jars covers the usual agent setup, [`MemoryClasses`] serves embedders and
//! tests. A [`ResourceMapper`] can redirect the lookup per class-file
//! version, so one hook can ship in several bytecode levels.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

/// Maps a hook's resource name before it is fetched.
///
/// The default keeps the name as is. A mapper may prefix a directory per
/// class-file version (`Class50/com/foo/Hooks.class`) to serve different
/// bytecode levels to differently versioned target classes.
pub trait ResourceMapper: Send + Sync {
    fn map_resource_name(&self, class_file_format_version: u16, resource_name: &str) -> String;
}

/// The identity mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl ResourceMapper for IdentityMapper {
    fn map_resource_name(&self, _version: u16, resource_name: &str) -> String {
        resource_name.to_string()
    }
}

/// Supplies the bytes of a named `.class` resource.
pub trait HookSource: Send + Sync {
    fn class_bytes(&self, resource_name: &str) -> io::Result<Vec<u8>>;
}

enum Entry {
    Dir(PathBuf),
    Jar(PathBuf),
}

/// Reads class files from an ordered list of directories and jar files,
/// first hit wins.
pub struct ClassPath {
    entries: Vec<Entry>,
}

impl ClassPath {
    pub fn new() -> ClassPath {
        ClassPath { entries: Vec::new() }
    }

    /// Adds a path; `.jar` and `.zip` files are opened as archives,
    /// anything else is treated as a class-file root directory.
    pub fn add(&mut self, path: impl Into<PathBuf>) -> &mut ClassPath {
        let path = path.into();
        let is_archive = path
            .extension()
            .map(|ext| ext == "jar" || ext == "zip")
            .unwrap_or(false);
        self.entries.push(if is_archive {
            Entry::Jar(path)
        } else {
            Entry::Dir(path)
        });
        self
    }
}

impl Default for ClassPath {
    fn default() -> Self {
        Self::new()
    }
}

impl HookSource for ClassPath {
    fn class_bytes(&self, resource_name: &str) -> io::Result<Vec<u8>> {
        for entry in &self.entries {
            match entry {
                Entry::Dir(dir) => {
                    let candidate = dir.join(resource_name);
                    match File::open(&candidate) {
                        Ok(mut file) => {
                            let mut bytes = Vec::new();
                            file.read_to_end(&mut bytes)?;
                            return Ok(bytes);
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    }
                }
                Entry::Jar(jar) => {
                    let file = match File::open(jar) {
                        Ok(file) => file,
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    };
                    let mut archive = zip::ZipArchive::new(file)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    let result = archive.by_name(resource_name).map(|mut entry| {
                        let mut bytes = Vec::new();
                        entry.read_to_end(&mut bytes).map(|_| bytes)
                    });
                    match result {
                        Ok(Ok(bytes)) => return Ok(bytes),
                        Ok(Err(e)) => return Err(e),
                        Err(zip::result::ZipError::FileNotFound) => continue,
                        Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                    }
                }
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found on the hook class path", resource_name),
        ))
    }
}

/// In-memory hook classes, keyed by resource name
/// (`com/example/Hooks.class`).
#[derive(Default)]
pub struct MemoryClasses {
    classes: HashMap<String, Vec<u8>>,
}

impl MemoryClasses {
    pub fn new() -> MemoryClasses {
        MemoryClasses::default()
    }

    pub fn put(&mut self, resource_name: &str, bytes: Vec<u8>) -> &mut MemoryClasses {
        self.classes.insert(resource_name.to_string(), bytes);
        self
    }
}

impl HookSource for MemoryClasses {
    fn class_bytes(&self, resource_name: &str) -> io::Result<Vec<u8>> {
        self.classes.get(resource_name).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not registered", resource_name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_mapper_is_identity() {
        assert_eq!(
            IdentityMapper.map_resource_name(52, "com/foo/Hooks.class"),
            "com/foo/Hooks.class"
        );
    }

    #[test]
    fn memory_classes_serve_and_miss() {
        let mut classes = MemoryClasses::new();
        classes.put("a/B.class", vec![1, 2, 3]);
        assert_eq!(classes.class_bytes("a/B.class").unwrap(), vec![1, 2, 3]);
        assert!(classes.class_bytes("a/C.class").is_err());
    }

    #[test]
    fn empty_class_path_misses() {
        let cp = ClassPath::new();
        assert!(cp.class_bytes("a/B.class").is_err());
    }
}
