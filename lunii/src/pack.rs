use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use byteorder::LE;
use log::{debug, trace, warn};

use crate::catalog::{TitleLookup, UNKNOWN_TITLE};
use crate::cipher::{self, Key};
use crate::device::DeviceKey;
use crate::{
    Asset, AssetKind, ByteReader, ControlSettings, StageNode, StoryGraph, StoryId,
    TransitionRange,
};

/// Stage node index, plaintext.
pub const NODE_INDEX_FILE: &str = "ni";
/// Transition indirection table.
pub const LIST_INDEX_FILE: &str = "li";
/// Image name table.
pub const RESOURCE_INDEX_FILE: &str = "ri";
/// Sound name table.
pub const SOUND_INDEX_FILE: &str = "si";
/// Authorization token, ciphered with the device key.
pub const TOKEN_FILE: &str = "bt";
/// Present when the pack supports night mode.
pub const NIGHT_MODE_FILE: &str = "nm";

pub const HEADER_SIZE: usize = 0x200;
pub const NODE_TABLE_OFFSET: u32 = 0x200;
pub const NODE_RECORD_SIZE: u32 = 0x2C;
pub const ASSET_NAME_SIZE: usize = 12;
pub const TOKEN_SIZE: usize = 0x40;

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug, strum::Display, strum::FromRepr)]
/// Layout revision of the node index file
pub enum FormatVersion {
    V1 = 1,
}

/// Keys needed to open a pack.
#[derive(Clone, Copy, Debug)]
pub struct PackKeys {
    pub device: DeviceKey,
    pub generic: Key,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIndexHeader {
    pub format_version: FormatVersion,
    pub version: u16,
    pub node_table_offset: u32,
    pub record_size: u32,
    pub node_count: u32,
    pub image_count: u32,
    pub sound_count: u32,
    pub factory: bool,
}

impl NodeIndexHeader {
    pub fn read(reader: &mut ByteReader) -> Result<Self, super::Error> {
        let format_version = reader.read_u16::<LE>()?;
        let format_version = FormatVersion::from_repr(format_version).ok_or_else(|| {
            super::Error::FormatMismatch(format!("unknown node index format {format_version}"))
        })?;
        Ok(Self {
            format_version,
            version: reader.read_u16::<LE>()?,
            node_table_offset: reader.read_u32::<LE>()?,
            record_size: reader.read_u32::<LE>()?,
            node_count: reader.read_u32::<LE>()?,
            image_count: reader.read_u32::<LE>()?,
            sound_count: reader.read_u32::<LE>()?,
            factory: reader.read_u8()? != 0,
        })
    }

    /// Checks the node table described by the header fits a file of `len`
    /// bytes with records at least as large as the known layout.
    pub fn validate(&self, len: usize) -> Result<(), super::Error> {
        if (self.node_table_offset as usize) < HEADER_SIZE {
            return Err(super::Error::FormatMismatch(format!(
                "node table at {:#x} overlaps the {HEADER_SIZE:#x} byte header",
                self.node_table_offset
            )));
        }
        if self.record_size < NODE_RECORD_SIZE {
            return Err(super::Error::FormatMismatch(format!(
                "node records are {:#x} bytes, expected at least {NODE_RECORD_SIZE:#x}",
                self.record_size
            )));
        }
        let end = u64::from(self.node_table_offset)
            + u64::from(self.node_count) * u64::from(self.record_size);
        if end > len as u64 {
            return Err(super::Error::FormatMismatch(format!(
                "{} nodes of {:#x} bytes at {:#x} end past the file ({len:#x} bytes)",
                self.node_count, self.record_size, self.node_table_offset
            )));
        }
        if self.node_table_offset != NODE_TABLE_OFFSET || self.record_size != NODE_RECORD_SIZE {
            debug!(
                "unusual node table layout: offset {:#x}, record size {:#x}",
                self.node_table_offset, self.record_size
            );
        }
        Ok(())
    }
}

/// One stage node record as stored, before any indirection is resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub image_index: i32,
    pub sound_index: i32,
    pub next_index: i32,
    pub next_count: i32,
    pub next_selected: i32,
    pub home_index: i32,
    pub home_count: i32,
    pub home_selected: i32,
    pub controls: ControlSettings,
}

impl NodeRecord {
    pub fn read(reader: &mut ByteReader) -> Result<Self, super::Error> {
        Ok(Self {
            image_index: reader.read_i32::<LE>()?,
            sound_index: reader.read_i32::<LE>()?,
            next_index: reader.read_i32::<LE>()?,
            next_count: reader.read_i32::<LE>()?,
            next_selected: reader.read_i32::<LE>()?,
            home_index: reader.read_i32::<LE>()?,
            home_count: reader.read_i32::<LE>()?,
            home_selected: reader.read_i32::<LE>()?,
            controls: ControlSettings {
                wheel: reader.read_i16::<LE>()? != 0,
                ok: reader.read_i16::<LE>()? != 0,
                home: reader.read_i16::<LE>()? != 0,
                pause: reader.read_i16::<LE>()? != 0,
                autoplay: reader.read_i16::<LE>()? != 0,
            },
        })
    }
}

/// Indirection table translating raw transition pointers to node indices.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListIndex(Vec<i32>);

impl ListIndex {
    /// Parses the deciphered table; a trailing partial entry is dropped.
    pub fn parse(decrypted: &[u8]) -> Self {
        Self(
            decrypted
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<i32> {
        self.0.get(index).copied()
    }

    /// Resolves a raw `(index, count)` pair. A negative index means the node
    /// has no such transition, whatever the count says.
    pub fn resolve(&self, index: i32, count: i32) -> Result<TransitionRange, super::Error> {
        if index < 0 || count <= 0 {
            return Ok(TransitionRange::EMPTY);
        }
        let first = self.get(index as usize).ok_or_else(|| {
            super::Error::FormatMismatch(format!(
                "transition pointer {index} is outside the list index ({} entries)",
                self.len()
            ))
        })?;
        let first = usize::try_from(first).map_err(|_| {
            super::Error::FormatMismatch(format!(
                "list index entry {index} points at node {first}"
            ))
        })?;
        Ok(TransitionRange::new(first, count as usize))
    }
}

/// Fixed width asset name table (`ri` or `si`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTable {
    kind: AssetKind,
    names: Vec<String>,
}

impl NameTable {
    pub fn parse(kind: AssetKind, decrypted: &[u8]) -> Self {
        let chunks = decrypted.chunks_exact(ASSET_NAME_SIZE);
        if !chunks.remainder().is_empty() {
            warn!(
                "{kind} name table has {} trailing bytes",
                chunks.remainder().len()
            );
        }
        let names = chunks
            .map(|entry| {
                String::from_utf8_lossy(entry)
                    .trim_end_matches('\0')
                    .replace('\\', "/")
            })
            .collect();
        Self { kind, names }
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Looks up a raw record index; negative means "no asset".
    pub fn resolve(&self, index: i32, story_dir: &Path) -> Result<Option<Asset>, super::Error> {
        if index < 0 {
            return Ok(None);
        }
        match self.get(index as usize) {
            Some(name) => Ok(Some(Asset {
                kind: self.kind,
                name: name.to_owned(),
                path: story_dir.join(self.kind.folder()).join(name),
            })),
            None => Err(super::Error::MissingAsset {
                kind: self.kind,
                index,
                len: self.len(),
            }),
        }
    }
}

/// Checks the pack token: `bt` deciphered with the device key must equal the
/// first 0x40 bytes of the raw `ri` file.
pub fn verify_token(token: &[u8], resource_index: &[u8], device_key: &DeviceKey) -> bool {
    let prefix = &resource_index[..resource_index.len().min(TOKEN_SIZE)];
    match cipher::decrypt(device_key.as_bytes(), token) {
        Ok(decrypted) => decrypted == prefix,
        Err(err) => {
            debug!("authorization token unreadable: {err}");
            false
        }
    }
}

/// Raw contents of a pack directory.
#[derive(Clone, Debug, Default)]
pub struct PackFiles {
    pub node_index: Vec<u8>,
    pub list_index: Vec<u8>,
    pub resource_index: Vec<u8>,
    pub sound_index: Vec<u8>,
    pub token: Option<Vec<u8>>,
    pub night_mode: bool,
}

impl PackFiles {
    pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self, super::Error> {
        let dir = dir.as_ref();
        let token = match std::fs::read(dir.join(TOKEN_FILE)) {
            Ok(token) => Some(token),
            Err(err) => {
                debug!("no readable token in {}: {err}", dir.display());
                None
            }
        };
        Ok(Self {
            node_index: std::fs::read(dir.join(NODE_INDEX_FILE))?,
            list_index: std::fs::read(dir.join(LIST_INDEX_FILE))?,
            resource_index: std::fs::read(dir.join(RESOURCE_INDEX_FILE))?,
            sound_index: std::fs::read(dir.join(SOUND_INDEX_FILE))?,
            token,
            night_mode: dir.join(NIGHT_MODE_FILE).exists(),
        })
    }
}

/// Decoded index files of one pack.
#[derive(Clone, Debug)]
pub struct PackIndex {
    pub header: NodeIndexHeader,
    pub records: Vec<NodeRecord>,
    pub list: ListIndex,
    pub images: NameTable,
    pub sounds: NameTable,
}

impl PackIndex {
    pub fn parse(files: &PackFiles, generic_key: &Key) -> Result<Self, super::Error> {
        let images = NameTable::parse(
            AssetKind::Image,
            &cipher::decrypt_file(generic_key, &files.resource_index)?,
        );
        let sounds = NameTable::parse(
            AssetKind::Audio,
            &cipher::decrypt_file(generic_key, &files.sound_index)?,
        );
        let list = ListIndex::parse(&cipher::decrypt_file(generic_key, &files.list_index)?);

        let mut reader = ByteReader::new(&files.node_index);
        let header = NodeIndexHeader::read(&mut reader)?;
        header.validate(reader.len())?;
        debug!(
            "node index v{} pack v{}: {} nodes, {} images, {} sounds, {} list entries",
            header.format_version,
            header.version,
            header.node_count,
            header.image_count,
            header.sound_count,
            list.len()
        );
        if images.len() != header.image_count as usize {
            warn!(
                "header declares {} images, name table holds {}",
                header.image_count,
                images.len()
            );
        }
        if sounds.len() != header.sound_count as usize {
            warn!(
                "header declares {} sounds, name table holds {}",
                header.sound_count,
                sounds.len()
            );
        }

        let mut records = Vec::with_capacity(header.node_count as usize);
        for i in 0..u64::from(header.node_count) {
            reader.seek(SeekFrom::Start(
                u64::from(header.node_table_offset) + i * u64::from(header.record_size),
            ))?;
            records.push(NodeRecord::read(&mut reader)?);
        }

        Ok(Self {
            header,
            records,
            list,
            images,
            sounds,
        })
    }

    fn resolve_asset(table: &NameTable, index: i32, story_dir: &Path, node: usize) -> Option<Asset> {
        match table.resolve(index, story_dir) {
            Ok(asset) => asset,
            Err(err) => {
                warn!("node {node}: {err}");
                None
            }
        }
    }

    /// Resolves every record into a stage node.
    pub fn stage_nodes(&self, story_dir: &Path) -> Result<Vec<StageNode>, super::Error> {
        let count = self.records.len();
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let node = StageNode {
                    index,
                    image: Self::resolve_asset(&self.images, record.image_index, story_dir, index),
                    audio: Self::resolve_asset(&self.sounds, record.sound_index, story_dir, index),
                    next: self.list.resolve(record.next_index, record.next_count)?,
                    home: self.list.resolve(record.home_index, record.home_count)?,
                    controls: record.controls,
                };
                for range in [node.next, node.home] {
                    if range.last().is_some_and(|last| last >= count) {
                        warn!("node {index}: transition {range} leaves the story ({count} nodes)");
                    }
                }
                trace!("node {index}: next {} home {}", node.next, node.home);
                Ok(node)
            })
            .collect()
    }
}

/// One story folder on the device.
#[derive(Clone, Debug)]
pub struct StoryPack {
    dir: PathBuf,
    id: StoryId,
}

impl StoryPack {
    pub fn new(dir: PathBuf, id: StoryId) -> Self {
        Self { dir, id }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn id(&self) -> StoryId {
        self.id
    }

    pub fn load(&self, keys: &PackKeys, titles: &dyn TitleLookup) -> Result<StoryGraph, super::Error> {
        self.parse(&PackFiles::read(&self.dir)?, keys, titles)
    }

    /// Builds the story graph from already read pack files.
    pub fn parse(
        &self,
        files: &PackFiles,
        keys: &PackKeys,
        titles: &dyn TitleLookup,
    ) -> Result<StoryGraph, super::Error> {
        let index = PackIndex::parse(files, &keys.generic)?;
        let nodes = index.stage_nodes(&self.dir)?;

        let authorized = files
            .token
            .as_deref()
            .is_some_and(|token| verify_token(token, &files.resource_index, &keys.device));
        if !authorized {
            warn!("story {} is not authorized on this device", self.id);
        }
        let title = titles
            .lookup(&self.id)
            .map(|t| t.title)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNKNOWN_TITLE.to_owned());

        Ok(StoryGraph {
            id: self.id,
            title,
            format_version: index.header.format_version,
            version: index.header.version,
            factory: index.header.factory,
            night_mode: files.night_mode,
            authorized,
            image_count: index.header.image_count,
            sound_count: index.header.sound_count,
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::GENERIC_KEY;

    fn header(node_count: u32, offset: u32, record_size: u32) -> Vec<u8> {
        let mut ni = vec![0u8; HEADER_SIZE];
        ni[0..2].copy_from_slice(&1u16.to_le_bytes());
        ni[2..4].copy_from_slice(&7u16.to_le_bytes());
        ni[4..8].copy_from_slice(&offset.to_le_bytes());
        ni[8..12].copy_from_slice(&record_size.to_le_bytes());
        ni[12..16].copy_from_slice(&node_count.to_le_bytes());
        ni[16..20].copy_from_slice(&1u32.to_le_bytes());
        ni[20..24].copy_from_slice(&2u32.to_le_bytes());
        ni[24] = 1;
        ni
    }

    fn record(fields: [i32; 8], flags: [i16; 5]) -> Vec<u8> {
        let mut out = vec![];
        for f in fields {
            out.extend_from_slice(&f.to_le_bytes());
        }
        for f in flags {
            out.extend_from_slice(&f.to_le_bytes());
        }
        out.resize(NODE_RECORD_SIZE as usize, 0);
        out
    }

    #[test]
    fn test_list_index_resolution() {
        let mut raw = vec![];
        for v in [0, 3, 9, 11, 20, 42, 50] {
            raw.extend_from_slice(&i32::to_le_bytes(v));
        }
        let list = ListIndex::parse(&raw);
        assert_eq!(list.len(), 7);

        let range = list.resolve(5, 3).unwrap();
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![42, 43, 44]);
        assert_eq!(list.resolve(-1, 3).unwrap(), TransitionRange::EMPTY);
        assert_eq!(list.resolve(2, 0).unwrap(), TransitionRange::EMPTY);
        assert!(matches!(
            list.resolve(7, 1),
            Err(crate::Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_name_table() {
        let raw = b"000\\AAAAAAAA001\\BBBBBBBBxx";
        let table = NameTable::parse(AssetKind::Image, raw);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1), Some("001/BBBBBBBB"));

        let asset = table.resolve(0, Path::new("story")).unwrap().unwrap();
        assert_eq!(asset.path, Path::new("story").join("rf").join("000/AAAAAAAA"));
        assert_eq!(table.resolve(-1, Path::new("story")).unwrap(), None);
        assert!(matches!(
            table.resolve(2, Path::new("story")),
            Err(crate::Error::MissingAsset { index: 2, len: 2, .. })
        ));
    }

    #[test]
    fn test_header_validation() {
        let ni = header(2, NODE_TABLE_OFFSET, NODE_RECORD_SIZE);
        let mut reader = ByteReader::new(&ni);
        let parsed = NodeIndexHeader::read(&mut reader).unwrap();
        assert_eq!(parsed.format_version, FormatVersion::V1);
        assert_eq!(parsed.version, 7);
        assert!(parsed.factory);
        // no room for the two records
        assert!(matches!(
            parsed.validate(ni.len()),
            Err(crate::Error::FormatMismatch(_))
        ));
        assert!(parsed.validate(HEADER_SIZE + 2 * NODE_RECORD_SIZE as usize).is_ok());

        let small = header(0, NODE_TABLE_OFFSET, 0x20);
        let parsed = NodeIndexHeader::read(&mut ByteReader::new(&small)).unwrap();
        assert!(parsed.validate(small.len()).is_err());

        let overlapping = header(0, 0x10, NODE_RECORD_SIZE);
        let parsed = NodeIndexHeader::read(&mut ByteReader::new(&overlapping)).unwrap();
        assert!(parsed.validate(overlapping.len()).is_err());

        let mut unknown = header(0, NODE_TABLE_OFFSET, NODE_RECORD_SIZE);
        unknown[0] = 9;
        assert!(matches!(
            NodeIndexHeader::read(&mut ByteReader::new(&unknown)),
            Err(crate::Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_records_follow_header_layout() {
        // records padded to 0x30 bytes are read at their declared stride
        let mut ni = header(2, NODE_TABLE_OFFSET, 0x30);
        let mut first = record([0, 1, 0, 2, 0, -1, -1, -1], [1, 1, 0, 0, 0]);
        first.resize(0x30, 0xEE);
        ni.extend_from_slice(&first);
        let mut second = record([-1, -1, -1, -1, -1, 0, 1, 0], [0, 0, 1, 1, 1]);
        second.resize(0x30, 0xEE);
        ni.extend_from_slice(&second);

        let mut li = vec![];
        for v in [1i32, 0] {
            li.extend_from_slice(&v.to_le_bytes());
        }
        let names = b"000\\AAAAAAAA".to_vec();
        let sounds = [b"000\\SSSSSSSS".as_slice(), b"001\\TTTTTTTT".as_slice()].concat();
        let files = PackFiles {
            node_index: ni,
            list_index: cipher::encrypt_file(&GENERIC_KEY, &li).unwrap(),
            resource_index: cipher::encrypt_file(&GENERIC_KEY, &names).unwrap(),
            sound_index: cipher::encrypt_file(&GENERIC_KEY, &sounds).unwrap(),
            token: None,
            night_mode: false,
        };
        let index = PackIndex::parse(&files, &GENERIC_KEY).unwrap();
        assert_eq!(index.records.len(), 2);
        assert_eq!(index.records[1].home_index, 0);

        let nodes = index.stage_nodes(Path::new("pack")).unwrap();
        assert_eq!(nodes[0].next, TransitionRange::new(1, 2));
        assert_eq!(nodes[0].audio.as_ref().unwrap().name, "001/TTTTTTTT");
        assert!(nodes[0].controls.wheel && nodes[0].controls.ok);
        assert_eq!(nodes[1].next, TransitionRange::EMPTY);
        assert_eq!(nodes[1].home, TransitionRange::new(1, 1));
        assert!(nodes[1].image.is_none());
        assert!(nodes[1].controls.autoplay);
    }

    #[test]
    fn test_token_verification() {
        let device = DeviceKey::from([7u8; 16]);
        let ri: Vec<u8> = (0..0x80).map(|i| i as u8).collect();
        let token = cipher::encrypt(device.as_bytes(), &ri[..TOKEN_SIZE]).unwrap();
        assert!(verify_token(&token, &ri, &device));

        let mut flipped = token.clone();
        flipped[5] ^= 1;
        assert!(!verify_token(&flipped, &ri, &device));
        assert!(!verify_token(&token, &ri, &DeviceKey::from([8u8; 16])));
        assert!(!verify_token(&token[..6], &ri, &device));
    }
}
