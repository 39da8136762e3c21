//! Motion commands and their wire encoding
//!
//! A sequence is an ordered list of `{action, parameter}` pairs. Encoding is
//! deterministic and side-effect free: every command maps to an optional
//! frame, a pause before the next step, and the speed scale in effect
//! afterwards. Out-of-domain parameters are clamped or coerced, never
//! rejected, so a malformed sequence still runs to the end.
//!
//! Frame layout is ASCII: a single-letter code followed by the PWM speed
//! byte rendered in decimal (`F142`), or the bare code for `S`, then the
//! configured line ending.

use crate::config::{ExecutionSettings, LineEnding};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shortest and longest timed step, in seconds
pub const MIN_SECONDS: i64 = 1;
/// Longest timed step, in seconds
pub const MAX_SECONDS: i64 = 10;

/// Motion action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Drive forward for N seconds
    Forward,
    /// Drive backward for N seconds
    Backward,
    /// Turn left by a fixed angle
    TurnLeft,
    /// Turn right by a fixed angle
    TurnRight,
    /// Stop the motors
    Stop,
    /// Pause without sending anything
    Wait,
    /// Change the speed for the following motion steps
    SetSpeed,
}

impl Action {
    /// Wire code, if this action produces a frame
    pub fn code(&self) -> Option<char> {
        match self {
            Self::Forward => Some('F'),
            Self::Backward => Some('B'),
            Self::TurnLeft => Some('L'),
            Self::TurnRight => Some('R'),
            Self::Stop => Some('S'),
            Self::Wait | Self::SetSpeed => None,
        }
    }

    /// Whether the frame carries the current speed byte
    pub fn carries_speed(&self) -> bool {
        matches!(
            self,
            Self::Forward | Self::Backward | Self::TurnLeft | Self::TurnRight
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "Forward"),
            Self::Backward => write!(f, "Backward"),
            Self::TurnLeft => write!(f, "TurnLeft"),
            Self::TurnRight => write!(f, "TurnRight"),
            Self::Stop => write!(f, "Stop"),
            Self::Wait => write!(f, "Wait"),
            Self::SetSpeed => write!(f, "SetSpeed"),
        }
    }
}

/// Allowed turn angles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TurnAngle {
    /// 45 degrees
    Deg45,
    /// 90 degrees
    Deg90,
    /// 180 degrees
    Deg180,
    /// 360 degrees
    Deg360,
}

impl TurnAngle {
    /// Coerce an arbitrary degree value; anything outside the set becomes 90
    pub fn from_degrees(degrees: i64) -> Self {
        match degrees {
            45 => Self::Deg45,
            180 => Self::Deg180,
            360 => Self::Deg360,
            _ => Self::Deg90,
        }
    }

    /// Angle in degrees
    pub fn degrees(&self) -> u64 {
        match self {
            Self::Deg45 => 45,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg360 => 360,
        }
    }

    /// Time the robot needs for this turn: one second per 90 degrees
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.degrees() * 1000 / 90)
    }
}

/// User-facing speed level, 1 (slowest) to 9 (fastest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SpeedScale(u8);

impl SpeedScale {
    /// Slowest level
    pub const MIN: Self = Self(1);
    /// Fastest level
    pub const MAX: Self = Self(9);
    /// Level every run starts with
    pub const DEFAULT: Self = Self(5);

    /// Lowest PWM byte the firmware accepts
    pub const BYTE_MIN: u8 = 28;
    /// Highest PWM byte
    pub const BYTE_MAX: u8 = 255;

    /// Clamp an arbitrary value into 1..=9
    pub fn new(scale: i64) -> Self {
        // Clamped to 1..=9 first, so the narrowing cast cannot truncate.
        Self(scale.clamp(1, 9) as u8)
    }

    /// Level as a plain number
    pub fn value(&self) -> u8 {
        self.0
    }

    /// PWM byte: `round((scale - 1) / 8 * 227 + 28)`
    pub fn to_byte(&self) -> u8 {
        let span = f64::from(Self::BYTE_MAX - Self::BYTE_MIN);
        let byte = f64::from(self.0 - 1) / 8.0 * span + f64::from(Self::BYTE_MIN);
        byte.round() as u8
    }
}

impl Default for SpeedScale {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for SpeedScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Clamp a duration parameter into `[1, 10]` seconds
pub fn clamp_seconds(seconds: i64) -> u64 {
    // Non-negative after clamping.
    seconds.clamp(MIN_SECONDS, MAX_SECONDS) as u64
}

/// One step of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// What to do
    pub action: Action,
    /// Seconds, degrees or speed scale depending on the action.
    /// `None` takes the action's default.
    pub parameter: Option<i64>,
}

impl Command {
    /// Build a command from an editor pair
    pub fn new(action: Action, parameter: Option<i64>) -> Self {
        Self { action, parameter }
    }

    /// Drive forward for `seconds`
    pub fn forward(seconds: i64) -> Self {
        Self::new(Action::Forward, Some(seconds))
    }

    /// Drive backward for `seconds`
    pub fn backward(seconds: i64) -> Self {
        Self::new(Action::Backward, Some(seconds))
    }

    /// Turn left by `degrees`
    pub fn turn_left(degrees: i64) -> Self {
        Self::new(Action::TurnLeft, Some(degrees))
    }

    /// Turn right by `degrees`
    pub fn turn_right(degrees: i64) -> Self {
        Self::new(Action::TurnRight, Some(degrees))
    }

    /// Stop the motors
    pub fn stop() -> Self {
        Self::new(Action::Stop, None)
    }

    /// Pause for `seconds`
    pub fn wait(seconds: i64) -> Self {
        Self::new(Action::Wait, Some(seconds))
    }

    /// Change speed to `scale`
    pub fn set_speed(scale: i64) -> Self {
        Self::new(Action::SetSpeed, Some(scale))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = self.parameter;
        match self.action {
            Action::Forward | Action::Backward | Action::Wait => {
                write!(f, "{} {}s", self.action, clamp_seconds(p.unwrap_or(MIN_SECONDS)))
            }
            Action::TurnLeft | Action::TurnRight => {
                let angle = TurnAngle::from_degrees(p.unwrap_or(90));
                write!(f, "{} {}°", self.action, angle.degrees())
            }
            Action::SetSpeed => match p {
                Some(scale) => write!(f, "SetSpeed {}", SpeedScale::new(scale)),
                None => write!(f, "SetSpeed (unchanged)"),
            },
            Action::Stop => write!(f, "Stop"),
        }
    }
}

/// Command parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseCommandError {
    /// Empty input
    #[error("Empty command")]
    Empty,

    /// Unknown action name
    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl FromStr for Command {
    type Err = ParseCommandError;

    /// Compact form `action[:parameter]`, e.g. `forward:2`, `l:90`, `stop`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseCommandError::Empty);
        }

        let (name, param) = match s.split_once([':', '=']) {
            Some((name, param)) => (name.trim(), Some(param.trim())),
            None => (s, None),
        };

        let action = match name.to_lowercase().as_str() {
            "forward" | "f" => Action::Forward,
            "backward" | "back" | "b" => Action::Backward,
            "left" | "l" => Action::TurnLeft,
            "right" | "r" => Action::TurnRight,
            "stop" | "s" => Action::Stop,
            "wait" | "w" => Action::Wait,
            "speed" | "v" => Action::SetSpeed,
            other => return Err(ParseCommandError::UnknownAction(other.to_string())),
        };

        let parameter = param.and_then(|p| p.parse::<f64>().ok()).map(|v| v as i64);
        Ok(Self::new(action, parameter))
    }
}

/// Exact byte sequence transmitted for one command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frame(Bytes);

impl Frame {
    fn build(code: char, speed: Option<u8>, line_ending: LineEnding) -> Self {
        let mut buf = BytesMut::with_capacity(6);
        let mut utf8 = [0u8; 4];
        buf.put_slice(code.encode_utf8(&mut utf8).as_bytes());
        if let Some(byte) = speed {
            buf.put_slice(byte.to_string().as_bytes());
        }
        buf.put_slice(line_ending.bytes());
        Self(buf.freeze())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Frame without its terminator, as text
    pub fn symbol(&self) -> String {
        String::from_utf8_lossy(&self.0)
            .trim_end_matches(['\r', '\n'])
            .to_string()
    }

    /// Whether this is a stop frame
    pub fn is_stop(&self) -> bool {
        self.0.first() == Some(&b'S')
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

/// Result of encoding one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStep {
    /// Frame to send, if the action transmits anything
    pub frame: Option<Frame>,
    /// Pause before the next step
    pub delay: Duration,
    /// Speed scale in effect after this step
    pub speed: SpeedScale,
}

/// Maps commands onto frames and step delays
#[derive(Debug, Clone)]
pub struct Encoder {
    line_ending: LineEnding,
    stop_delay: Duration,
    speed_delay: Duration,
}

impl Default for Encoder {
    fn default() -> Self {
        Self {
            line_ending: LineEnding::Lf,
            stop_delay: Duration::from_millis(700),
            speed_delay: Duration::from_millis(400),
        }
    }
}

impl Encoder {
    /// Encoder from execution settings
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            line_ending: settings.line_ending,
            stop_delay: Duration::from_millis(settings.stop_delay_ms),
            speed_delay: Duration::from_millis(settings.speed_delay_ms),
        }
    }

    /// Override the frame terminator
    #[must_use]
    pub fn line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Encode `command` given the speed currently in effect
    pub fn encode(&self, command: &Command, speed: SpeedScale) -> EncodedStep {
        let p = command.parameter;
        match command.action {
            Action::Forward | Action::Backward => EncodedStep {
                frame: self.motion_frame(command.action, speed),
                delay: Duration::from_secs(clamp_seconds(p.unwrap_or(MIN_SECONDS))),
                speed,
            },
            Action::TurnLeft | Action::TurnRight => EncodedStep {
                frame: self.motion_frame(command.action, speed),
                delay: TurnAngle::from_degrees(p.unwrap_or(90)).duration(),
                speed,
            },
            Action::Wait => EncodedStep {
                frame: None,
                delay: Duration::from_secs(clamp_seconds(p.unwrap_or(MIN_SECONDS))),
                speed,
            },
            Action::SetSpeed => EncodedStep {
                frame: None,
                delay: self.speed_delay,
                speed: p.map_or(speed, SpeedScale::new),
            },
            Action::Stop => EncodedStep {
                frame: Some(self.stop_frame()),
                delay: self.stop_delay,
                speed,
            },
        }
    }

    /// The safety stop frame
    pub fn stop_frame(&self) -> Frame {
        Frame::build('S', None, self.line_ending)
    }

    fn motion_frame(&self, action: Action, speed: SpeedScale) -> Option<Frame> {
        let code = action.code()?;
        let byte = action.carries_speed().then(|| speed.to_byte());
        Some(Frame::build(code, byte, self.line_ending))
    }

    /// Total pause time of a sequence, excluding transmission time
    pub fn estimated_duration(&self, sequence: &[Command]) -> Duration {
        let mut speed = SpeedScale::DEFAULT;
        sequence
            .iter()
            .map(|command| {
                let step = self.encode(command, speed);
                speed = step.speed;
                step.delay
            })
            .sum()
    }
}

/// Editor-side ordered list of commands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSequence {
    commands: Vec<Command>,
}

impl CommandSequence {
    /// Create an empty sequence
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Insert a command; indexes past the end append
    pub fn insert(&mut self, index: usize, command: Command) {
        let index = index.min(self.commands.len());
        self.commands.insert(index, command);
    }

    /// Remove the command at `index`
    pub fn remove(&mut self, index: usize) -> Option<Command> {
        (index < self.commands.len()).then(|| self.commands.remove(index))
    }

    /// Move a command to a new position
    pub fn move_step(&mut self, from: usize, to: usize) -> bool {
        if from >= self.commands.len() {
            return false;
        }
        let command = self.commands.remove(from);
        let to = to.min(self.commands.len());
        self.commands.insert(to, command);
        true
    }

    /// Drop every command
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Number of commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands in order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Immutable copy handed to the executor
    pub fn snapshot(&self) -> Arc<[Command]> {
        Arc::from(self.commands.as_slice())
    }
}

impl FromIterator<Command> for CommandSequence {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}
