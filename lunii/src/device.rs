use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::LE;
use log::{debug, warn};
use rayon::prelude::*;

use crate::cipher::{self, Key, GENERIC_KEY};
use crate::pack::{PackKeys, StoryPack};
use crate::{ByteReader, NoTitles, StoryGraph, StoryId, TitleLookup};

/// Device metadata: firmware version, serial number and key container.
pub const METADATA_FILE: &str = ".md";
/// Installed stories, 16 bytes per id.
pub const STORY_LIST_FILE: &str = ".pi";
pub const CONTENT_DIR: &str = ".content";

const HW_INFO_OFFSET: i64 = 6;
const KEY_CONTAINER_OFFSET: u64 = 0x100;
const KEY_CONTAINER_SIZE: usize = 0x100;
const STORY_ID_SIZE: usize = 16;

/// Per-unit key, only used to check pack authorization tokens.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeviceKey(Key);

impl DeviceKey {
    /// Builds the key from the deciphered key container: its two 8-byte
    /// halves are stored swapped.
    pub fn from_decrypted(decrypted: &[u8]) -> Result<Self, super::Error> {
        if decrypted.len() < 16 {
            return Err(super::Error::FormatMismatch(format!(
                "key container holds {} bytes, expected at least 16",
                decrypted.len()
            )));
        }
        let mut key = [0; 16];
        key[..8].copy_from_slice(&decrypted[8..16]);
        key[8..].copy_from_slice(&decrypted[..8]);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &Key {
        &self.0
    }
}

impl From<Key> for DeviceKey {
    fn from(value: Key) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceKey({})", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Firmware {
    pub major: u16,
    pub minor: u16,
}

impl std::fmt::Display for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceInfo {
    pub firmware: Firmware,
    pub serial: u64,
    pub device_key: DeviceKey,
}

impl DeviceInfo {
    /// Parses the contents of the metadata file, deciphering the key
    /// container with `generic_key`.
    pub fn parse(md: &[u8], generic_key: &Key) -> Result<Self, super::Error> {
        let mut reader = ByteReader::new(md);
        reader.seek(SeekFrom::Current(HW_INFO_OFFSET))?;
        let firmware = Firmware {
            major: reader.read_u16::<LE>()?,
            minor: reader.read_u16::<LE>()?,
        };
        let serial = reader.read_u64::<LE>()?;

        reader.seek(SeekFrom::Start(KEY_CONTAINER_OFFSET))?;
        let container = reader.read_bytes(KEY_CONTAINER_SIZE)?;
        let device_key = DeviceKey::from_decrypted(&cipher::decrypt(generic_key, container)?)?;

        Ok(Self {
            firmware,
            serial,
            device_key,
        })
    }
}

/// Parses the story list file: big-endian 16-byte ids back to back.
pub fn parse_story_list(pi: &[u8]) -> Result<Vec<StoryId>, super::Error> {
    if pi.len() % STORY_ID_SIZE != 0 {
        return Err(super::Error::FormatMismatch(format!(
            "story list is {} bytes, not a multiple of {STORY_ID_SIZE}",
            pi.len()
        )));
    }
    let mut reader = ByteReader::new(pi);
    let mut stories = Vec::with_capacity(pi.len() / STORY_ID_SIZE);
    while reader.remaining() > 0 {
        stories.push(StoryId::from_bytes(reader.read_array()?));
    }
    Ok(stories)
}

pub struct DeviceBuilder {
    catalog: Arc<dyn TitleLookup>,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self {
            catalog: Arc::new(NoTitles),
        }
    }
    /// Where story titles come from. Defaults to [`NoTitles`].
    pub fn catalog(mut self, catalog: impl TitleLookup + 'static) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }
    pub fn open<P: AsRef<Path>>(self, root: P) -> Result<Device, super::Error> {
        Device::open_inner(root.as_ref(), self.catalog)
    }
}

/// A mounted storyteller.
pub struct Device {
    root: PathBuf,
    info: DeviceInfo,
    stories: Vec<StoryId>,
    catalog: Arc<dyn TitleLookup>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("root", &self.root)
            .field("info", &self.info)
            .field("stories", &self.stories)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, super::Error> {
        DeviceBuilder::new().open(root)
    }

    fn open_inner(root: &Path, catalog: Arc<dyn TitleLookup>) -> Result<Self, super::Error> {
        let info = DeviceInfo::parse(&std::fs::read(root.join(METADATA_FILE))?, &GENERIC_KEY)?;
        debug!(
            "mounted device at {} (firmware {}, serial {})",
            root.display(),
            info.firmware,
            info.serial
        );
        let mut device = Self {
            root: root.to_path_buf(),
            info,
            stories: vec![],
            catalog,
        };
        device.refresh()?;
        Ok(device)
    }

    /// Re-reads the list of installed stories.
    pub fn refresh(&mut self) -> Result<(), super::Error> {
        self.stories = parse_story_list(&std::fs::read(self.root.join(STORY_LIST_FILE))?)?;
        debug!("{} stories installed", self.stories.len());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn firmware(&self) -> Firmware {
        self.info.firmware
    }

    pub fn serial(&self) -> u64 {
        self.info.serial
    }

    pub fn device_key(&self) -> &DeviceKey {
        &self.info.device_key
    }

    pub fn keys(&self) -> PackKeys {
        PackKeys {
            device: self.info.device_key,
            generic: GENERIC_KEY,
        }
    }

    pub fn stories(&self) -> &[StoryId] {
        &self.stories
    }

    pub fn story_dir(&self, id: &StoryId) -> PathBuf {
        self.root.join(CONTENT_DIR).join(id.dir_name())
    }

    /// Parses one installed story.
    pub fn load_story(&self, id: &StoryId) -> Result<StoryGraph, super::Error> {
        if !self.stories.contains(id) {
            return Err(super::Error::UnknownStory(*id));
        }
        StoryPack::new(self.story_dir(id), *id).load(&self.keys(), self.catalog.as_ref())
    }

    /// Parses every installed story in parallel. A broken pack only fails its
    /// own entry.
    pub fn load_stories(&self) -> Vec<(StoryId, Result<StoryGraph, super::Error>)> {
        self.stories
            .par_iter()
            .map(|id| {
                let story = self.load_story(id);
                if let Err(err) = &story {
                    warn!("story {id} failed to load: {err}");
                }
                (*id, story)
            })
            .collect()
    }
}
