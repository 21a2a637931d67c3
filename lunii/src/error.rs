use crate::player::Rejection;

#[derive(thiserror::Error)]
pub enum Error {
    // dependency errors
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("enum conversion: {0}")]
    Strum(#[from] strum::ParseError),

    // std errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // crate errors
    #[error("read of {wanted} bytes at offset {offset:#x} exceeds buffer ({available} bytes left)")]
    OutOfBounds {
        offset: usize,
        wanted: usize,
        available: usize,
    },

    #[error("seek to {0} is outside of the buffer")]
    InvalidOffset(i64),

    #[error("cannot decipher {len} bytes: {reason}")]
    DecryptionFailure { len: usize, reason: &'static str },

    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("story {0} is not authorized on this device")]
    Unauthorized(crate::StoryId),

    #[error("{kind} index {index} is absent from its name table ({len} entries)")]
    MissingAsset {
        kind: crate::AssetKind,
        index: i32,
        len: usize,
    },

    #[error("story {0} is not installed on this device")]
    UnknownStory(crate::StoryId),

    #[error("no stage node at index {0}")]
    MissingNode(usize),

    #[error("input rejected: {0}")]
    InvalidInput(Rejection),

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("No story matches \"{0}\"")]
    NoMatchingStory(String),

    #[error("Attempted to write to \"{0}\" which is outside of output directory")]
    WriteOutsideOutput(String),

    #[error("Output directory is not empty: \"{0}\"")]
    OutputNotEmpty(String),
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
