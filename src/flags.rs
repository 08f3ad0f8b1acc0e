// Flag files (.dup) and source manifests (.src).
//
// A flag file is a headerless byte array, one byte per global ordinal in the
// concatenation order fixed by the manifest. Persisted bytes are ' ' and 'D'
// only; 'd' marks a duplicate found in the current bucket pass and is
// uppercased before the pass ends.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{Error, Result};

/// Flag byte of an item that survives.
pub const FLAG_ACTIVE: u8 = b' ';

/// Flag byte of a known duplicate.
pub const FLAG_DEAD: u8 = b'D';

/// Transient within-pass mark; never persisted.
pub const FLAG_MARKED: u8 = b'd';

pub fn load_flags(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| Error::IoRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_flags(path: &Path, flags: &[u8]) -> Result<()> {
    std::fs::write(path, flags).map_err(|source| Error::IoWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// One signature file entry: item count and path, in manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub num_items: u64,
    pub path: String,
}

/// Parsed `.src` manifest: an optional group id and the ordered signature
/// files whose item counts define the global ordinal mapping.
#[derive(Debug, Clone, Default)]
pub struct SourceManifest {
    pub group: Option<u32>,
    pub entries: Vec<SourceEntry>,
}

impl SourceManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| Error::IoOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(BufReader::new(file), path)
    }

    /// Parse manifest lines: an optional leading `#G <group>` followed by
    /// `<num_items>\t<path>` records.
    pub fn parse(reader: impl BufRead, path: &Path) -> Result<Self> {
        let mut manifest = SourceManifest::default();

        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| Error::IoRead {
                path: path.to_path_buf(),
                source,
            })?;
            if line.is_empty() {
                continue;
            }

            if index == 0 {
                if let Some(group) = line.strip_prefix("#G ") {
                    let group = group.trim().parse().map_err(|_| Error::BadHeader {
                        path: path.to_path_buf(),
                        reason: format!("unparsable group id {group:?}"),
                    })?;
                    manifest.group = Some(group);
                    continue;
                }
            }

            let Some((count, source)) = line.split_once('\t') else {
                return Err(Error::BadHeader {
                    path: path.to_path_buf(),
                    reason: format!("no TAB separator at line {}", index + 1),
                });
            };
            let num_items = count.parse().map_err(|_| Error::BadHeader {
                path: path.to_path_buf(),
                reason: format!("unparsable item count {count:?} at line {}", index + 1),
            })?;
            manifest.entries.push(SourceEntry {
                num_items,
                path: source.to_string(),
            });
        }

        Ok(manifest)
    }

    /// Serialize back to manifest bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        if let Some(group) = self.group {
            out.push_str(&format!("#G {group}\n"));
        }
        for entry in &self.entries {
            out.push_str(&format!("{}\t{}\n", entry.num_items, entry.path));
        }
        out.into_bytes()
    }

    /// Sum of the item counts, i.e. the expected flag file length.
    pub fn total_items(&self) -> u64 {
        self.entries.iter().map(|e| e.num_items).sum()
    }

    /// Locate `target` among the entries and return its window of global
    /// ordinals as `(offset, size)`. With `strip_dirs`, directory names are
    /// removed from the manifest paths before matching.
    pub fn find_target(&self, target: &str, strip_dirs: bool) -> Result<(u64, u64)> {
        let mut found = None;
        let mut offset = 0u64;

        for entry in &self.entries {
            let path = if strip_dirs {
                entry.path.rsplit('/').next().unwrap_or(&entry.path)
            } else {
                entry.path.as_str()
            };
            if path == target {
                if found.is_some() {
                    return Err(Error::Duplicate(target.to_string()));
                }
                found = Some((offset, entry.num_items));
            }
            offset += entry.num_items;
        }

        found.ok_or_else(|| Error::NotFound(target.to_string()))
    }
}
