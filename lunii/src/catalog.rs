use std::path::Path;

use log::debug;

use crate::StoryId;

pub const UNKNOWN_TITLE: &str = "Unknown Story";

/// Human readable metadata of a pack, as published by the store catalog.
#[derive(Clone, PartialEq, Eq, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StoryTitle {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub keywords: String,
}

/// Source of story titles. Packs carry no title of their own.
pub trait TitleLookup: Send + Sync {
    fn lookup(&self, id: &StoryId) -> Option<StoryTitle>;
}

/// Lookup that never knows a title.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoTitles;

impl TitleLookup for NoTitles {
    fn lookup(&self, _id: &StoryId) -> Option<StoryTitle> {
        None
    }
}

/// Local copy of the store catalog: a JSON array of
/// `{"uuid", "title", "subtitle", "keywords"}` objects.
#[derive(Clone, Default, Debug)]
pub struct TitleCatalog {
    entries: Vec<StoryTitle>,
}

impl TitleCatalog {
    pub fn new(entries: Vec<StoryTitle>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self, super::Error> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, super::Error> {
        let catalog = Self::from_json(&std::fs::read_to_string(path.as_ref())?)?;
        debug!(
            "loaded {} catalog entries from {}",
            catalog.len(),
            path.as_ref().display()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TitleLookup for TitleCatalog {
    fn lookup(&self, id: &StoryId) -> Option<StoryTitle> {
        // catalog ids are not always hyphenated the same way, match loosely
        let needle = id.0.simple().to_string();
        self.entries
            .iter()
            .find(|entry| entry.uuid.to_lowercase().replace('-', "").contains(&needle))
            .cloned()
    }
}
