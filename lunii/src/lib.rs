mod assets;
mod catalog;
pub mod cipher;
mod device;
mod error;
mod pack;
mod player;
mod reader;
mod story;

pub use {
    assets::*, catalog::*, device::*, error::*, pack::*, player::*, reader::*, story::*,
};
