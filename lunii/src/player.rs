//! Interactive playback of a story graph.
//!
//! [`PlaybackEngine`] reproduces the storyteller's behaviour: every stage
//! node shows its image and plays its audio, nodes with a single transition
//! advance on their own, and nodes with several transitions let the listener
//! pick one with the wheel before confirming.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::assets::AssetSource;
use crate::{Asset, ControlSettings, Error, StageNode, StoryGraph, TransitionRange};

/// Hardware buttons.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, Debug, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum Button {
    /// Wheel turned clockwise
    #[strum(to_string = "+", serialize = "increment")]
    Increment,
    /// Wheel turned counter-clockwise
    #[strum(to_string = "-", serialize = "decrement")]
    Decrement,
    #[strum(to_string = "ok", serialize = "confirm")]
    Confirm,
    #[strum(to_string = "home")]
    Home,
}

/// A button press or the `back` meta-command.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    Press(Button),
    Back,
}

impl std::str::FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "back" => Ok(Command::Back),
            other => Ok(Command::Press(other.parse()?)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Press(button) => std::fmt::Display::fmt(button, f),
            Command::Back => f.write_str("back"),
        }
    }
}

/// Why an input was refused. The engine state is left untouched.
#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
pub enum Rejection {
    #[error("{0} is disabled on this node")]
    Disabled(Button),
    #[error("{0} would leave the list of options")]
    AtBound(Button),
    #[error("no choice is being made")]
    NotSeeking,
    #[error("cannot go back any further")]
    AtHistoryRoot,
    #[error("the story has ended")]
    Ended,
}

impl From<Rejection> for Error {
    fn from(value: Rejection) -> Self {
        Error::InvalidInput(value)
    }
}

/// Choice in progress on a node with several transitions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Seek {
    /// Node whose transitions are being chosen from
    pub origin: usize,
    pub cursor: usize,
    pub options: TransitionRange,
    pub replay_pending: bool,
    /// Controls of the first option, they govern the whole choice
    pub controls: ControlSettings,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    AtNode(usize),
    Seeking(Seek),
    Ended,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Completion {
    Finished,
    Stopped,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Effect {
    Show { node: usize, asset: Asset },
    Play { node: usize, asset: Asset, completion: Completion },
}

/// Outcome of driving the engine: effects carried out, in order, and the
/// collaborator failures that made some of them get skipped.
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub failures: Vec<Error>,
}

impl Step {
    fn append(&mut self, other: Step) {
        self.effects.extend(other.effects);
        self.failures.extend(other.failures);
    }
}

/// An audio playback started by a [`Frontend`].
pub trait Playing {
    fn is_finished(&mut self) -> bool;
    fn stop(&mut self);
}

/// Handle for playbacks that complete before `play` returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct Done;

impl Playing for Done {
    fn is_finished(&mut self) -> bool {
        true
    }
    fn stop(&mut self) {}
}

/// Screen and speaker of the simulated device.
pub trait Frontend {
    type Playing: Playing;

    fn show(&mut self, image: &[u8]) -> Result<(), Error>;
    fn play(&mut self, audio: &[u8], path: &Path) -> Result<Self::Playing, Error>;
}

/// Cuts the audio currently playing. Cloned handles share the flag, and a
/// request made while nothing plays is dropped when the next audio starts.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending request.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct PlayerOptions {
    poll_interval: Duration,
    stop: StopSignal,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stop: StopSignal::new(),
        }
    }
}

impl PlayerOptions {
    /// How often a blocking playback is checked for completion.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
    pub fn stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }
}

#[derive(Clone, Debug)]
struct Session {
    history: Vec<usize>,
    suppress_audio: bool,
}

pub struct PlaybackEngine<'g, S: AssetSource> {
    graph: &'g StoryGraph,
    assets: S,
    options: PlayerOptions,
    state: State,
    session: Session,
}

impl<'g, S: AssetSource> PlaybackEngine<'g, S> {
    pub fn new(graph: &'g StoryGraph, assets: S) -> Self {
        Self::with_options(graph, assets, PlayerOptions::default())
    }

    pub fn with_options(graph: &'g StoryGraph, assets: S, options: PlayerOptions) -> Self {
        Self {
            graph,
            assets,
            options,
            state: State::AtNode(0),
            session: Session {
                history: vec![0],
                suppress_audio: false,
            },
        }
    }

    pub fn graph(&self) -> &'g StoryGraph {
        self.graph
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Node the session is at; while choosing, the node offering the choice.
    pub fn current(&self) -> usize {
        match self.state {
            State::Seeking(seek) => seek.origin,
            _ => self.history().last().copied().unwrap_or(0),
        }
    }

    pub fn history(&self) -> &[usize] {
        &self.session.history
    }

    pub fn is_ended(&self) -> bool {
        self.state == State::Ended
    }

    pub fn suppressing_audio(&self) -> bool {
        self.session.suppress_audio
    }

    /// True once the options of a choice have been presented and a button
    /// press is expected.
    pub fn awaiting_input(&self) -> bool {
        matches!(self.state, State::Seeking(seek) if !seek.replay_pending)
    }

    /// Buttons accepted in the current state.
    pub fn valid_inputs(&self) -> Vec<Button> {
        let State::Seeking(seek) = self.state else {
            return vec![];
        };
        <Button as strum::IntoEnumIterator>::iter()
            .filter(|&button| Self::check(&seek, button).is_ok())
            .collect()
    }

    fn node(&self, index: usize) -> Result<&'g StageNode, Error> {
        self.graph.node(index).ok_or(Error::MissingNode(index))
    }

    fn advance(&mut self, target: usize) {
        trace!("advancing to node {target}");
        self.session.history.push(target);
        self.state = State::AtNode(target);
    }

    /// `+1` fallback of autoplay nodes that lack an explicit transition.
    fn advance_autoplay(&mut self, from: usize) {
        match self.graph.node(from + 1) {
            Some(_) => self.advance(from + 1),
            None => {
                debug!("autoplay past the last node {from}, story ends");
                self.state = State::Ended;
            }
        }
    }

    fn show_image(&mut self, node: &StageNode, frontend: &mut impl Frontend, step: &mut Step) {
        let Some(image) = &node.image else {
            return;
        };
        let shown = self
            .assets
            .load(image)
            .and_then(|bytes| frontend.show(&bytes));
        match shown {
            Ok(()) => step.effects.push(Effect::Show {
                node: node.index,
                asset: image.clone(),
            }),
            Err(err) => {
                warn!("node {}: cannot show {}: {err}", node.index, image.path.display());
                step.failures.push(err);
            }
        }
    }

    /// Plays the node's audio unless the suppression latch is set, then
    /// clears the latch.
    fn play_audio(&mut self, node: &StageNode, frontend: &mut impl Frontend, step: &mut Step) {
        let suppressed = std::mem::replace(&mut self.session.suppress_audio, false);
        let Some(audio) = &node.audio else {
            return;
        };
        if suppressed {
            trace!("node {}: audio suppressed", node.index);
            return;
        }
        if self.options.stop.take() {
            trace!("discarding a stop requested before node {} played", node.index);
        }
        let played = self
            .assets
            .load(audio)
            .and_then(|bytes| frontend.play(&bytes, &audio.path));
        match played {
            Ok(playing) => step.effects.push(Effect::Play {
                node: node.index,
                asset: audio.clone(),
                completion: self.wait(playing),
            }),
            Err(err) => {
                warn!("node {}: cannot play {}: {err}", node.index, audio.path.display());
                step.failures.push(err);
            }
        }
    }

    fn wait<P: Playing>(&self, mut playing: P) -> Completion {
        loop {
            if playing.is_finished() {
                return Completion::Finished;
            }
            if self.options.stop.take() {
                playing.stop();
                return Completion::Stopped;
            }
            std::thread::sleep(self.options.poll_interval);
        }
    }

    /// Ends the session on a transition into a node the story lacks.
    fn dead_end(&mut self, index: usize, step: &mut Step) {
        warn!("no stage node at index {index}, story ends");
        step.failures.push(Error::MissingNode(index));
        self.state = State::Ended;
    }

    /// Performs the pending work of the current state: visiting a node, or
    /// presenting the option under the cursor. A transition into a missing
    /// node is reported in the step and ends the story.
    pub fn step(&mut self, frontend: &mut impl Frontend) -> Result<Step, Error> {
        let mut step = Step::default();
        match self.state {
            State::Ended => {}
            State::AtNode(index) => {
                let Ok(node) = self.node(index) else {
                    self.dead_end(index, &mut step);
                    return Ok(step);
                };
                self.show_image(node, frontend, &mut step);
                if node.audio.is_none() {
                    debug!("node {index} has no audio, story ends");
                    self.state = State::Ended;
                    return Ok(step);
                }
                self.play_audio(node, frontend, &mut step);

                match node.next.len() {
                    0 if node.controls.autoplay => self.advance_autoplay(index),
                    0 => self.state = State::Ended,
                    1 => self.advance(node.next.first),
                    _ => {
                        let first = node.next.first;
                        let Ok(option) = self.node(first) else {
                            self.dead_end(first, &mut step);
                            return Ok(step);
                        };
                        debug!("node {index} offers {} options", node.next.len());
                        self.state = State::Seeking(Seek {
                            origin: index,
                            cursor: first,
                            options: node.next,
                            replay_pending: true,
                            controls: option.controls,
                        });
                    }
                }
            }
            State::Seeking(mut seek) => {
                if seek.replay_pending {
                    let Ok(option) = self.node(seek.cursor) else {
                        self.dead_end(seek.cursor, &mut step);
                        return Ok(step);
                    };
                    self.show_image(option, frontend, &mut step);
                    self.play_audio(option, frontend, &mut step);
                    seek.replay_pending = false;
                    self.state = State::Seeking(seek);
                }
            }
        }
        Ok(step)
    }

    /// Steps until a button press is expected or the story ends.
    pub fn run_until_input(&mut self, frontend: &mut impl Frontend) -> Result<Step, Error> {
        let mut step = Step::default();
        while !self.is_ended() && !self.awaiting_input() {
            step.append(self.step(frontend)?);
        }
        Ok(step)
    }

    fn check(seek: &Seek, button: Button) -> Result<(), Rejection> {
        let enabled = match button {
            Button::Increment | Button::Decrement => seek.controls.wheel,
            Button::Confirm => seek.controls.ok,
            Button::Home => seek.controls.home,
        };
        if !enabled {
            return Err(Rejection::Disabled(button));
        }
        match button {
            Button::Increment if Some(seek.cursor) >= seek.options.last() => {
                Err(Rejection::AtBound(button))
            }
            Button::Decrement if seek.cursor <= seek.options.first => {
                Err(Rejection::AtBound(button))
            }
            _ => Ok(()),
        }
    }

    /// Applies a button press while a choice is in progress.
    pub fn press(&mut self, button: Button) -> Result<(), Error> {
        let mut seek = match self.state {
            State::Seeking(seek) => seek,
            State::Ended => return Err(Rejection::Ended.into()),
            State::AtNode(_) => return Err(Rejection::NotSeeking.into()),
        };
        Self::check(&seek, button)?;
        debug!("pressed {button} on option {}", seek.cursor);

        match button {
            Button::Increment | Button::Decrement => {
                seek.cursor = match button {
                    Button::Increment => seek.cursor + 1,
                    _ => seek.cursor - 1,
                };
                seek.replay_pending = true;
                self.state = State::Seeking(seek);
            }
            Button::Confirm => self.commit(&seek)?,
            Button::Home => self.go_home(seek.origin)?,
        }
        Ok(())
    }

    /// Commits the option under the cursor. An option missing from the story
    /// ends it and is reported.
    fn commit(&mut self, seek: &Seek) -> Result<(), Error> {
        let origin = self.node(seek.origin)?;
        let Ok(selected) = self.node(seek.cursor) else {
            warn!("no stage node at index {}, story ends", seek.cursor);
            self.state = State::Ended;
            return Err(Error::MissingNode(seek.cursor));
        };
        match selected.next.len() {
            0 if origin.controls.autoplay => {
                self.session.suppress_audio = true;
                self.advance_autoplay(seek.cursor);
            }
            0 => self.state = State::Ended,
            1 => self.advance(selected.next.first),
            _ => {
                // the option's audio was just heard while choosing
                self.session.suppress_audio = true;
                self.advance(seek.cursor);
            }
        }
        Ok(())
    }

    fn go_home(&mut self, origin: usize) -> Result<(), Error> {
        match self.node(origin)?.home.first() {
            Some(target) => self.advance(target),
            None => {
                self.session.history = vec![0];
                self.state = State::AtNode(0);
            }
        }
        Ok(())
    }

    /// Returns to the previously visited node. A pending choice is abandoned.
    pub fn walk_back(&mut self) -> Result<usize, Error> {
        if self.is_ended() {
            return Err(Rejection::Ended.into());
        }
        if self.session.history.len() <= 1 {
            return Err(Rejection::AtHistoryRoot.into());
        }
        self.session.history.pop();
        let previous = *self.session.history.last().ok_or(Rejection::AtHistoryRoot)?;
        self.session.suppress_audio = false;
        self.state = State::AtNode(previous);
        Ok(previous)
    }

    /// Applies a button press or walks back.
    pub fn apply(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Press(button) => self.press(button),
            Command::Back => self.walk_back().map(|_| ()),
        }
    }

    /// Runs a whole scripted session: plays until input is needed, applies
    /// the next command, and so on until the story ends or the script runs
    /// out. Rejected commands are reported and skipped.
    pub fn run_script<I>(&mut self, frontend: &mut impl Frontend, script: I) -> Result<Step, Error>
    where
        I: IntoIterator<Item = Command>,
    {
        let mut step = self.run_until_input(frontend)?;
        for command in script {
            if self.is_ended() {
                break;
            }
            if let Err(err) = self.apply(command) {
                warn!("{command}: {err}");
                step.failures.push(err);
                continue;
            }
            step.append(self.run_until_input(frontend)?);
        }
        Ok(step)
    }
}
