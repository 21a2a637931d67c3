use std::collections::HashMap;
use std::path::PathBuf;

use log::trace;

use crate::cipher::{Key, Xxtea, GENERIC_KEY};
use crate::Asset;

/// Provides the deciphered bytes of an asset referenced by a stage node.
pub trait AssetSource {
    fn load(&self, asset: &Asset) -> Result<Vec<u8>, super::Error>;
}

/// Reads assets from the pack's `rf/` and `sf/` folders. Like the index
/// files, only their first 512 bytes are ciphered.
#[derive(Clone, Debug)]
pub struct PackAssets {
    cipher: Xxtea,
}

impl Default for PackAssets {
    fn default() -> Self {
        Self::new(&GENERIC_KEY)
    }
}

impl PackAssets {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: Xxtea::new(key),
        }
    }
}

impl AssetSource for PackAssets {
    fn load(&self, asset: &Asset) -> Result<Vec<u8>, super::Error> {
        let raw = std::fs::read(&asset.path)?;
        trace!("loaded {} ({} bytes)", asset.path.display(), raw.len());
        self.cipher.decrypt_file(&raw)
    }
}

/// Assets held in memory, keyed by path.
#[derive(Clone, Debug, Default)]
pub struct MemoryAssets {
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), data.into());
    }
}

impl AssetSource for MemoryAssets {
    fn load(&self, asset: &Asset) -> Result<Vec<u8>, super::Error> {
        self.files.get(&asset.path).cloned().ok_or_else(|| {
            super::Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no asset at {}", asset.path.display()),
            ))
        })
    }
}
