use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};
use env_logger::Env;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use log::{debug, LevelFilter};
use lunii::{
    AssetSource, Command, ControlSettings, Device, Done, Effect, Frontend, PackAssets,
    PlaybackEngine, State, Step, StoryGraph, StoryId, TitleCatalog,
};
use path_clean::PathClean;
use rayon::prelude::*;

#[derive(Parser, Debug)]
struct ActionInfo {
    /// Mount point of the storyteller
    #[arg(index = 1)]
    device: PathBuf,

    /// Story id or folder name. Prints the device summary when omitted
    #[arg(index = 2)]
    story: Option<String>,
}

#[derive(Parser, Debug)]
struct ActionList {
    /// Mount point of the storyteller
    #[arg(index = 1)]
    device: PathBuf,
}

#[derive(Parser, Debug)]
struct ActionNodes {
    /// Mount point of the storyteller
    #[arg(index = 1)]
    device: PathBuf,

    /// Story id or folder name
    #[arg(index = 2)]
    story: String,
}

#[derive(Parser, Debug)]
struct ActionPlay {
    /// Mount point of the storyteller
    #[arg(index = 1)]
    device: PathBuf,

    /// Story id or folder name
    #[arg(index = 2)]
    story: String,

    /// Inputs to play through (`+`, `-`, `ok`, `home`, `back`). Reads them
    /// from stdin when omitted
    #[arg(index = 3)]
    inputs: Vec<String>,

    /// Play stories whose token does not match this device
    #[arg(long, default_value = "false")]
    ignore_token: bool,
}

#[derive(Parser, Debug)]
struct ActionExport {
    /// Mount point of the storyteller
    #[arg(index = 1)]
    device: PathBuf,

    /// Story id or folder name
    #[arg(index = 2)]
    story: String,

    /// Output directory. Defaults to the story folder name
    #[arg(index = 3)]
    output: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Print device or story info
    Info(ActionInfo),
    /// List installed stories
    List(ActionList),
    /// Dump the stage nodes of a story
    Nodes(ActionNodes),
    /// Play a story on the console
    Play(ActionPlay),
    /// Write the deciphered images and sounds of a story
    Export(ActionExport),
}

#[derive(Parser, Debug)]
#[command(author, version)]
struct Args {
    #[command(subcommand)]
    action: Action,

    /// JSON title catalog
    #[arg(short, long, global = true)]
    titles: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<(), lunii::Error> {
    let args = Args::parse();
    init_logging(args.verbose);

    let titles = args.titles.as_deref();
    match args.action {
        Action::Info(args) => info(args, titles),
        Action::List(args) => list(args, titles),
        Action::Nodes(args) => nodes(args, titles),
        Action::Play(args) => play(args, titles),
        Action::Export(args) => export(args, titles),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()));
    builder.format_timestamp(None);
    builder.init();
}

fn open_device(path: &Path, titles: Option<&Path>) -> Result<Device, lunii::Error> {
    let builder = Device::builder();
    let builder = match titles {
        Some(titles) => builder.catalog(TitleCatalog::open(titles)?),
        None => builder,
    };
    builder.open(path)
}

/// Finds an installed story by id or by folder name.
fn select_story(device: &Device, query: &str) -> Result<StoryId, lunii::Error> {
    let query = query.trim();
    if let Ok(id) = query.parse::<StoryId>() {
        return match device.stories().contains(&id) {
            true => Ok(id),
            false => Err(lunii::Error::UnknownStory(id)),
        };
    }
    device
        .stories()
        .iter()
        .find(|id| id.dir_name().eq_ignore_ascii_case(query))
        .copied()
        .ok_or_else(|| lunii::Error::NoMatchingStory(query.to_owned()))
}

fn load_story(device: &Path, story: &str, titles: Option<&Path>) -> Result<StoryGraph, lunii::Error> {
    let device = open_device(device, titles)?;
    let id = select_story(&device, story)?;
    device.load_story(&id)
}

fn info(args: ActionInfo, titles: Option<&Path>) -> Result<(), lunii::Error> {
    let device = open_device(&args.device, titles)?;
    let Some(story) = args.story else {
        println!("firmware: {}", device.firmware());
        println!("serial: {}", device.serial());
        println!("device key: {}", hex::encode(device.device_key().as_bytes()));
        println!("{} stories installed", device.stories().len());
        return Ok(());
    };
    let graph = device.load_story(&select_story(&device, &story)?)?;
    let (images, sounds) = graph.asset_counts();
    println!("title: {}", graph.title());
    println!("id: {}", graph.id());
    println!("folder: {}", graph.id().dir_name());
    println!("format: {}", graph.format_version());
    println!("version: {}", graph.version());
    println!("factory: {}", graph.is_factory());
    println!("night mode: {}", graph.night_mode());
    println!("authorized: {}", graph.authorized());
    println!("{} stage nodes, {images} images, {sounds} sounds", graph.len());
    Ok(())
}

fn list(args: ActionList, titles: Option<&Path>) -> Result<(), lunii::Error> {
    let device = open_device(&args.device, titles)?;
    for (id, story) in device.load_stories() {
        match story {
            Ok(graph) => println!("{} {} {}", id.dir_name(), id, graph.title()),
            Err(err) => println!("{} {} (unreadable: {err})", id.dir_name(), id),
        }
    }
    Ok(())
}

fn controls(controls: &ControlSettings) -> String {
    let enabled = [
        ("wheel", controls.wheel),
        ("ok", controls.ok),
        ("home", controls.home),
        ("pause", controls.pause),
        ("autoplay", controls.autoplay),
    ]
    .into_iter()
    .filter_map(|(name, on)| on.then_some(name))
    .collect::<Vec<_>>();
    enabled.join(" ")
}

fn nodes(args: ActionNodes, titles: Option<&Path>) -> Result<(), lunii::Error> {
    let graph = load_story(&args.device, &args.story, titles)?;
    let name = |asset: &Option<lunii::Asset>| {
        asset
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "-".to_owned())
    };
    for node in graph.nodes() {
        println!(
            "{}: image {} audio {} next {} home {} [{}]",
            node.index,
            name(&node.image),
            name(&node.audio),
            node.next,
            node.home,
            controls(&node.controls)
        );
    }
    Ok(())
}

/// Assets are reported through the effects of each step, the console only
/// accounts for them.
struct Console;

impl Frontend for Console {
    type Playing = Done;

    fn show(&mut self, image: &[u8]) -> Result<(), lunii::Error> {
        debug!("image of {} bytes", image.len());
        Ok(())
    }

    fn play(&mut self, audio: &[u8], path: &Path) -> Result<Done, lunii::Error> {
        debug!("{} bytes of audio from {}", audio.len(), path.display());
        Ok(Done)
    }
}

fn report<S: AssetSource>(step: Step, engine: &PlaybackEngine<S>) {
    for effect in step.effects {
        match effect {
            Effect::Show { asset, .. } => println!("show {}", asset.name),
            Effect::Play {
                asset, completion, ..
            } => match completion {
                lunii::Completion::Finished => println!("play {}", asset.name),
                lunii::Completion::Stopped => println!("play {} (stopped)", asset.name),
            },
        }
    }
    for failure in step.failures {
        println!("skipped: {failure}");
    }
    match engine.state() {
        State::Ended => println!("end of story"),
        State::Seeking(seek) => {
            let inputs = engine
                .valid_inputs()
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>();
            println!(
                "choosing option {} of {}: {}",
                seek.cursor,
                seek.options,
                inputs.join(" ")
            );
        }
        State::AtNode(_) => {}
    }
}

fn apply<S: AssetSource>(engine: &mut PlaybackEngine<S>, command: Command) -> Result<(), lunii::Error> {
    match engine.apply(command) {
        Err(lunii::Error::InvalidInput(rejection)) => {
            println!("rejected: {rejection}");
            Ok(())
        }
        // the engine has already ended the story
        Err(err @ lunii::Error::MissingNode(_)) => {
            println!("skipped: {err}");
            Ok(())
        }
        other => other,
    }
}

fn play(args: ActionPlay, titles: Option<&Path>) -> Result<(), lunii::Error> {
    let graph = load_story(&args.device, &args.story, titles)?;
    if !args.ignore_token {
        graph.require_authorized()?;
    }
    // parse the whole script before playing anything
    let script = args
        .inputs
        .iter()
        .map(|input| input.parse::<Command>())
        .collect::<Result<Vec<_>, _>>()?;

    println!("playing {} ({})", graph.title(), graph.id());
    let mut engine = PlaybackEngine::new(&graph, PackAssets::default());
    let mut console = Console;
    report(engine.run_until_input(&mut console)?, &engine);

    if !args.inputs.is_empty() {
        for command in script {
            if engine.is_ended() {
                break;
            }
            println!("> {command}");
            apply(&mut engine, command)?;
            report(engine.run_until_input(&mut console)?, &engine);
        }
        return Ok(());
    }

    let mut lines = io::stdin().lock().lines();
    while !engine.is_ended() {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            println!();
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(command) => apply(&mut engine, command)?,
            Err(_) => {
                println!("unknown input {:?}, expected + - ok home back", line.trim());
                continue;
            }
        }
        report(engine.run_until_input(&mut console)?, &engine);
    }
    Ok(())
}

fn export(args: ActionExport, titles: Option<&Path>) -> Result<(), lunii::Error> {
    let graph = load_story(&args.device, &args.story, titles)?;
    let output = args
        .output
        .unwrap_or_else(|| PathBuf::from(graph.id().dir_name()))
        .clean();
    fs::create_dir_all(&output)?;
    if output.read_dir()?.next().is_some() {
        return Err(lunii::Error::OutputNotEmpty(
            output.to_string_lossy().to_string(),
        ));
    }

    // nodes share assets, write each file once
    let assets = graph
        .nodes()
        .iter()
        .flat_map(|node| node.image.iter().chain(node.audio.iter()))
        .map(|asset| (asset.path.as_path(), asset))
        .collect::<BTreeMap<_, _>>()
        .into_values()
        .collect::<Vec<_>>();

    let source = PackAssets::default();
    let style = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bar = ProgressBar::new(assets.len() as u64).with_style(style);
    assets
        .par_iter()
        .progress_with(bar)
        .try_for_each(|asset| -> Result<(), lunii::Error> {
            let file_path = output.join(asset.kind.folder()).join(&asset.name);
            if !file_path.clean().starts_with(&output) {
                return Err(lunii::Error::WriteOutsideOutput(
                    file_path.to_string_lossy().to_string(),
                ));
            }
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file_path, source.load(asset)?)?;
            Ok(())
        })?;

    println!("Exported {} files to {}", assets.len(), output.display());
    Ok(())
}
