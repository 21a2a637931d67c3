use std::path::{Path, PathBuf};

use lunii::cipher::{self, Key, GENERIC_KEY};
use lunii::{
    Button, Done, Effect, Frontend, PackAssets, PlaybackEngine, State, StoryId, StoryTitle,
    TitleCatalog, TransitionRange,
};
use paste::paste;

const SERIAL: u64 = 0x0000_0023_4567_89AB;
const STORY_A: &str = "c4139d59-872a-4d15-8cf1-76d34cdf38c6";
const STORY_B: &str = "0123abcd-0000-4000-8000-00000000b0b0";

/// Key container as stored before ciphering. The device key is its first
/// 16 bytes with the halves swapped.
fn key_container() -> Vec<u8> {
    (0..0x100).map(|i| i as u8).collect()
}

fn device_key() -> Key {
    let container = key_container();
    let mut key = [0; 16];
    key[..8].copy_from_slice(&container[8..16]);
    key[8..].copy_from_slice(&container[..8]);
    key
}

fn write_device(root: &Path, stories: &[StoryId]) {
    let mut md = vec![0u8; 0x200];
    md[6..8].copy_from_slice(&2u16.to_le_bytes());
    md[8..10].copy_from_slice(&22u16.to_le_bytes());
    md[10..18].copy_from_slice(&SERIAL.to_le_bytes());
    md[0x100..].copy_from_slice(&cipher::encrypt(&GENERIC_KEY, &key_container()).unwrap());
    std::fs::write(root.join(".md"), md).unwrap();

    let pi: Vec<u8> = stories.iter().flat_map(|id| *id.as_bytes()).collect();
    std::fs::write(root.join(".pi"), pi).unwrap();
}

enum Token {
    Device,
    OtherKey,
    Flipped,
    Missing,
}

fn record(image: i32, sound: i32, next: (i32, i32), flags: [i16; 5]) -> Vec<u8> {
    let mut out = vec![];
    for field in [image, sound, next.0, next.1, 0, -1, -1, -1] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for flag in flags {
        out.extend_from_slice(&flag.to_le_bytes());
    }
    out.resize(0x2C, 0);
    out
}

fn image_data(i: usize) -> Vec<u8> {
    format!("IMAGE{i:03}DATA").into_bytes()
}

fn sound_data(i: usize) -> Vec<u8> {
    format!("SOUND{i:03}DATA").into_bytes()
}

/// Four node story: 0 -> 1 -> {2, 3}.
fn write_pack(root: &Path, id: &StoryId, token: Token, night_mode: bool) -> PathBuf {
    let dir = root.join(".content").join(id.dir_name());
    std::fs::create_dir_all(dir.join("rf/000")).unwrap();
    std::fs::create_dir_all(dir.join("sf/000")).unwrap();

    let mut ni = vec![0u8; 0x200];
    ni[0..2].copy_from_slice(&1u16.to_le_bytes());
    ni[2..4].copy_from_slice(&3u16.to_le_bytes());
    ni[4..8].copy_from_slice(&0x200u32.to_le_bytes());
    ni[8..12].copy_from_slice(&0x2Cu32.to_le_bytes());
    ni[12..16].copy_from_slice(&4u32.to_le_bytes());
    ni[16..20].copy_from_slice(&4u32.to_le_bytes());
    ni[20..24].copy_from_slice(&4u32.to_le_bytes());
    ni.extend(record(0, 0, (0, 1), [0, 0, 0, 0, 0]));
    ni.extend(record(1, 1, (1, 2), [0, 0, 1, 0, 0]));
    ni.extend(record(2, 2, (-1, 0), [1, 1, 1, 0, 0]));
    ni.extend(record(3, 3, (-1, 0), [1, 1, 1, 0, 0]));
    std::fs::write(dir.join("ni"), ni).unwrap();

    let li: Vec<u8> = [1i32, 2].iter().flat_map(|v| v.to_le_bytes()).collect();
    std::fs::write(dir.join("li"), cipher::encrypt_file(&GENERIC_KEY, &li).unwrap()).unwrap();

    let mut ri = vec![];
    let mut si = vec![];
    for i in 0..4 {
        ri.extend(format!("000\\IMG{i:05}").into_bytes());
        si.extend(format!("000\\SND{i:05}").into_bytes());
        std::fs::write(
            dir.join(format!("rf/000/IMG{i:05}")),
            cipher::encrypt_file(&GENERIC_KEY, &image_data(i)).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join(format!("sf/000/SND{i:05}")),
            cipher::encrypt_file(&GENERIC_KEY, &sound_data(i)).unwrap(),
        )
        .unwrap();
    }
    let ri = cipher::encrypt_file(&GENERIC_KEY, &ri).unwrap();
    std::fs::write(dir.join("ri"), &ri).unwrap();
    std::fs::write(dir.join("si"), cipher::encrypt_file(&GENERIC_KEY, &si).unwrap()).unwrap();

    let prefix = &ri[..ri.len().min(0x40)];
    let bt = match token {
        Token::Device => Some(cipher::encrypt(&device_key(), prefix).unwrap()),
        Token::OtherKey => Some(cipher::encrypt(&[0x42; 16], prefix).unwrap()),
        Token::Flipped => {
            let mut bt = cipher::encrypt(&device_key(), prefix).unwrap();
            bt[3] ^= 0x80;
            Some(bt)
        }
        Token::Missing => None,
    };
    if let Some(bt) = bt {
        std::fs::write(dir.join("bt"), bt).unwrap();
    }
    if night_mode {
        std::fs::write(dir.join("nm"), []).unwrap();
    }
    dir
}

fn story(id: &str) -> StoryId {
    id.parse().unwrap()
}

#[test]
fn test_open_device() {
    let root = tempfile::tempdir().unwrap();
    write_device(root.path(), &[story(STORY_A), story(STORY_B)]);

    let device = lunii::Device::open(root.path()).unwrap();
    assert_eq!(device.firmware().to_string(), "2.22");
    assert_eq!(device.serial(), SERIAL);
    assert_eq!(device.device_key().as_bytes(), &device_key());
    assert_eq!(device.stories(), [story(STORY_A), story(STORY_B)]);
    assert_eq!(
        device.story_dir(&story(STORY_A)),
        root.path().join(".content").join("4CDF38C6")
    );
}

#[test]
fn test_missing_metadata() {
    let root = tempfile::tempdir().unwrap();
    assert!(matches!(
        lunii::Device::open(root.path()),
        Err(lunii::Error::Io(_))
    ));
}

#[test]
fn test_load_story() {
    let root = tempfile::tempdir().unwrap();
    let id = story(STORY_A);
    write_device(root.path(), &[id]);
    let dir = write_pack(root.path(), &id, Token::Device, true);

    let catalog = TitleCatalog::new(vec![StoryTitle {
        uuid: STORY_A.to_uppercase(),
        title: "Suzanne et Gaston".into(),
        ..Default::default()
    }]);
    let device = lunii::Device::builder()
        .catalog(catalog)
        .open(root.path())
        .unwrap();
    let graph = device.load_story(&id).unwrap();

    assert_eq!(graph.id(), id);
    assert_eq!(graph.title(), "Suzanne et Gaston");
    assert_eq!(graph.version(), 3);
    assert_eq!(graph.len(), 4);
    assert_eq!(graph.asset_counts(), (4, 4));
    assert!(graph.authorized());
    assert!(graph.require_authorized().is_ok());
    assert!(graph.night_mode());
    assert!(!graph.is_factory());

    let node = graph.node(1).unwrap();
    assert_eq!(node.next, TransitionRange::new(2, 2));
    assert!(node.controls.home && !node.controls.wheel);
    assert_eq!(
        node.image.as_ref().unwrap().path,
        dir.join("rf").join("000/IMG00001")
    );
    assert_eq!(
        graph.cover_audio().unwrap().path,
        dir.join("sf").join("000/SND00000")
    );
    assert!(graph.node(2).unwrap().next.is_empty());
}

macro_rules! authorization {
    ($name:ident, $token:expr, $expected:literal) => {
        paste! {
            #[test]
            fn [<test_authorization_ $name>]() {
                let root = tempfile::tempdir().unwrap();
                let id = story(STORY_A);
                write_device(root.path(), &[id]);
                write_pack(root.path(), &id, $token, false);

                let graph = lunii::Device::open(root.path())
                    .unwrap()
                    .load_story(&id)
                    .unwrap();
                assert_eq!(graph.authorized(), $expected);
                assert_eq!(graph.require_authorized().is_ok(), $expected);
                assert!(!graph.night_mode());
                assert_eq!(graph.title(), "Unknown Story");
            }
        }
    };
}

authorization!(device_token, Token::Device, true);
authorization!(other_key, Token::OtherKey, false);
authorization!(flipped_byte, Token::Flipped, false);
authorization!(missing_token, Token::Missing, false);

#[test]
fn test_broken_pack_is_isolated() {
    let root = tempfile::tempdir().unwrap();
    let (good, broken) = (story(STORY_A), story(STORY_B));
    write_device(root.path(), &[good, broken]);
    write_pack(root.path(), &good, Token::Device, false);
    let dir = write_pack(root.path(), &broken, Token::Device, false);
    std::fs::remove_file(dir.join("li")).unwrap();

    let device = lunii::Device::open(root.path()).unwrap();
    let loaded = device.load_stories();
    assert_eq!(loaded.len(), 2);
    for (id, result) in loaded {
        match result {
            Ok(graph) => {
                assert_eq!(id, good);
                assert_eq!(graph.len(), 4);
            }
            Err(err) => {
                assert_eq!(id, broken);
                assert!(matches!(err, lunii::Error::Io(_)));
            }
        }
    }
}

#[test]
fn test_unknown_story() {
    let root = tempfile::tempdir().unwrap();
    write_device(root.path(), &[story(STORY_A)]);
    let device = lunii::Device::open(root.path()).unwrap();
    assert!(matches!(
        device.load_story(&story(STORY_B)),
        Err(lunii::Error::UnknownStory(_))
    ));
}

#[derive(Default)]
struct Screen {
    images: Vec<Vec<u8>>,
    sounds: Vec<Vec<u8>>,
}

impl Frontend for Screen {
    type Playing = Done;

    fn show(&mut self, image: &[u8]) -> Result<(), lunii::Error> {
        self.images.push(image.to_vec());
        Ok(())
    }

    fn play(&mut self, audio: &[u8], _path: &Path) -> Result<Done, lunii::Error> {
        self.sounds.push(audio.to_vec());
        Ok(Done)
    }
}

#[test]
fn test_play_installed_story() {
    let root = tempfile::tempdir().unwrap();
    let id = story(STORY_A);
    write_device(root.path(), &[id]);
    write_pack(root.path(), &id, Token::Device, false);
    let graph = lunii::Device::open(root.path())
        .unwrap()
        .load_story(&id)
        .unwrap();

    let mut engine = PlaybackEngine::new(&graph, PackAssets::default());
    let mut screen = Screen::default();
    let step = engine.run_until_input(&mut screen).unwrap();
    assert!(step.failures.is_empty());
    assert_eq!(step.effects.len(), 6);
    assert!(matches!(&step.effects[5], Effect::Play { node: 2, .. }));
    assert_eq!(screen.images, [image_data(0), image_data(1), image_data(2)]);
    assert_eq!(screen.sounds, [sound_data(0), sound_data(1), sound_data(2)]);

    engine.press(Button::Increment).unwrap();
    engine.run_until_input(&mut screen).unwrap();
    assert_eq!(screen.sounds.last(), Some(&sound_data(3)));

    engine.press(Button::Confirm).unwrap();
    engine.run_until_input(&mut screen).unwrap();
    assert_eq!(engine.state(), State::Ended);
    assert_eq!(engine.history(), [0, 1]);
}
