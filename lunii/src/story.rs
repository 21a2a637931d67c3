use std::path::PathBuf;

/// 128-bit story identifier as listed in the device's `.pi` file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoryId(pub uuid::Uuid);

impl StoryId {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Name of the story folder under `.content/`: the last four bytes of
    /// the id as uppercase hex.
    pub fn dir_name(&self) -> String {
        hex::encode_upper(&self.as_bytes()[12..])
    }
}

impl std::str::FromStr for StoryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for StoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl std::fmt::Debug for StoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StoryId({})", self.0.hyphenated())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum AssetKind {
    Image,
    Audio,
}

impl AssetKind {
    /// Story sub-folder holding assets of this kind.
    pub fn folder(self) -> &'static str {
        match self {
            AssetKind::Image => "rf",
            AssetKind::Audio => "sf",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Asset {
    pub kind: AssetKind,
    /// Entry of the name table, with `/` separators.
    pub name: String,
    pub path: PathBuf,
}

/// Buttons a node lets the listener use. Straight from the node record.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ControlSettings {
    pub wheel: bool,
    pub ok: bool,
    pub home: bool,
    pub pause: bool,
    pub autoplay: bool,
}

/// Contiguous run of stage node indices `[first, first + count)`.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransitionRange {
    pub first: usize,
    pub count: usize,
}

impl TransitionRange {
    pub const EMPTY: TransitionRange = TransitionRange { first: 0, count: 0 };

    pub fn new(first: usize, count: usize) -> Self {
        match count {
            0 => Self::EMPTY,
            count => Self { first, count },
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn first(&self) -> Option<usize> {
        (!self.is_empty()).then_some(self.first)
    }

    /// Highest index of the range.
    pub fn last(&self) -> Option<usize> {
        (!self.is_empty()).then(|| self.first + self.count - 1)
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.first..self.first + self.count).contains(&index)
    }

    pub fn iter(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.count
    }
}

impl std::fmt::Display for TransitionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.last() {
            None => f.write_str("[]"),
            Some(last) if last == self.first => write!(f, "[{}]", self.first),
            Some(last) => write!(f, "[{}..={}]", self.first, last),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StageNode {
    pub index: usize,
    pub image: Option<Asset>,
    pub audio: Option<Asset>,
    pub next: TransitionRange,
    pub home: TransitionRange,
    pub controls: ControlSettings,
}

#[derive(Clone, Debug)]
pub struct StoryGraph {
    pub(crate) id: StoryId,
    pub(crate) title: String,
    pub(crate) format_version: crate::FormatVersion,
    pub(crate) version: u16,
    pub(crate) factory: bool,
    pub(crate) night_mode: bool,
    pub(crate) authorized: bool,
    pub(crate) image_count: u32,
    pub(crate) sound_count: u32,
    pub(crate) nodes: Vec<StageNode>,
}

impl StoryGraph {
    /// Graph with default pack metadata, for stories assembled in memory.
    pub fn from_nodes(id: StoryId, title: impl Into<String>, nodes: Vec<StageNode>) -> Self {
        Self {
            id,
            title: title.into(),
            format_version: crate::FormatVersion::V1,
            version: 0,
            factory: false,
            night_mode: false,
            authorized: true,
            image_count: nodes.iter().filter(|n| n.image.is_some()).count() as u32,
            sound_count: nodes.iter().filter(|n| n.audio.is_some()).count() as u32,
            nodes,
        }
    }

    pub fn id(&self) -> StoryId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn format_version(&self) -> crate::FormatVersion {
        self.format_version
    }

    /// Pack version from the node index header.
    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn is_factory(&self) -> bool {
        self.factory
    }

    pub fn night_mode(&self) -> bool {
        self.night_mode
    }

    pub fn authorized(&self) -> bool {
        self.authorized
    }

    /// Fails with [`crate::Error::Unauthorized`] for packs whose token does
    /// not match this device.
    pub fn require_authorized(&self) -> Result<(), super::Error> {
        match self.authorized {
            true => Ok(()),
            false => Err(super::Error::Unauthorized(self.id)),
        }
    }

    /// Declared `(image, sound)` asset counts.
    pub fn asset_counts(&self) -> (u32, u32) {
        (self.image_count, self.sound_count)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<&StageNode> {
        self.nodes.get(index)
    }

    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    /// Audio played when the pack is highlighted in the device menu.
    pub fn cover_audio(&self) -> Option<&Asset> {
        self.nodes.first().and_then(|node| node.audio.as_ref())
    }
}
