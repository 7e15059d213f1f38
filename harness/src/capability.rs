//! Capability contract between sandboxed scripts and the environment.
//!
//! The [`CapabilityApi`] trait is the only way scripts reach the environment.
//! Queries are side-effect free; actions mutate the environment and return an
//! [`ActionResult`]. The concrete environment lives outside this crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Script-visible names of the query functions.
pub const QUERY_FUNCTIONS: &[&str] = &[
    "position",
    "stats",
    "screen",
    "message",
    "inventory",
    "visible_monsters",
    "items_here",
    "turn",
];

/// Script-visible names of the action functions.
pub const ACTION_FUNCTIONS: &[&str] = &[
    "move",
    "attack",
    "kick",
    "open_door",
    "wait",
    "search",
    "pickup",
    "drop",
    "eat",
    "quaff",
    "read",
    "wear",
    "wield",
    "go_up",
    "go_down",
    "pray",
    "engrave",
    "move_to",
];

/// Script-visible value types and helpers registered alongside the capabilities.
pub const VALUE_FUNCTIONS: &[&str] = &["Position", "offset", "distance", "direction_to"];

/// Static modules injected into every script.
pub const INJECTED_MODULES: &[&str] = &["Direction"];

/// Every free identifier the sandbox injects.
pub fn injected_names() -> impl Iterator<Item = &'static str> {
    QUERY_FUNCTIONS
        .iter()
        .chain(ACTION_FUNCTIONS)
        .chain(VALUE_FUNCTIONS)
        .copied()
        .chain(Direction::ALL.iter().map(|dir| dir.constant_name()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
    Up,
    Down,
    Here,
}

impl Direction {
    pub const ALL: [Direction; 11] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
        Direction::NorthEast,
        Direction::NorthWest,
        Direction::SouthEast,
        Direction::SouthWest,
        Direction::Up,
        Direction::Down,
        Direction::Here,
    ];

    /// Name of the scope constant bound to this direction (e.g. `EAST`).
    pub fn constant_name(self) -> &'static str {
        match self {
            Direction::North => "NORTH",
            Direction::South => "SOUTH",
            Direction::East => "EAST",
            Direction::West => "WEST",
            Direction::NorthEast => "NORTHEAST",
            Direction::NorthWest => "NORTHWEST",
            Direction::SouthEast => "SOUTHEAST",
            Direction::SouthWest => "SOUTHWEST",
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Here => "HERE",
        }
    }

    /// Name of the variable in the `Direction` module (e.g. `Direction::E`).
    pub fn short_name(self) -> &'static str {
        match self {
            Direction::North => "N",
            Direction::South => "S",
            Direction::East => "E",
            Direction::West => "W",
            Direction::NorthEast => "NE",
            Direction::NorthWest => "NW",
            Direction::SouthEast => "SE",
            Direction::SouthWest => "SW",
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Here => "SELF",
        }
    }

    /// Grid delta `(dx, dy)`; vertical moves and `Here` stay in place.
    pub fn delta(self) -> (i64, i64) {
        match self {
            Direction::North => (0, -1),
            Direction::South => (0, 1),
            Direction::East => (1, 0),
            Direction::West => (-1, 0),
            Direction::NorthEast => (1, -1),
            Direction::NorthWest => (-1, -1),
            Direction::SouthEast => (1, 1),
            Direction::SouthWest => (-1, 1),
            Direction::Up | Direction::Down | Direction::Here => (0, 0),
        }
    }

    /// Parse a direction from its constant, short, or snake_case name.
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim();
        Direction::ALL.into_iter().find(|dir| {
            dir.constant_name().eq_ignore_ascii_case(wanted)
                || dir.short_name().eq_ignore_ascii_case(wanted)
                || dir.snake_name() == wanted
        })
    }

    fn snake_name(self) -> &'static str {
        match self {
            Direction::North => "north",
            Direction::South => "south",
            Direction::East => "east",
            Direction::West => "west",
            Direction::NorthEast => "north_east",
            Direction::NorthWest => "north_west",
            Direction::SouthEast => "south_east",
            Direction::SouthWest => "south_west",
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Here => "here",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.constant_name())
    }
}

/// A map coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, direction: Direction) -> Self {
        let (dx, dy) = direction.delta();
        Self::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }

    /// Chebyshev distance: the number of king moves between two squares.
    pub fn distance(self, other: Position) -> i64 {
        let dx = self.x.saturating_sub(other.x).saturating_abs();
        let dy = self.y.saturating_sub(other.y).saturating_abs();
        dx.max(dy)
    }

    /// The single-step direction that moves closer to `other`, if they differ.
    pub fn direction_to(self, other: Position) -> Option<Direction> {
        let step = (
            other.x.saturating_sub(self.x).signum(),
            other.y.saturating_sub(self.y).signum(),
        );
        Direction::ALL
            .into_iter()
            .filter(|dir| !matches!(dir, Direction::Up | Direction::Down | Direction::Here))
            .find(|dir| dir.delta() == step)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Structured result of one state-mutating action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub turn_elapsed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(messages: Vec<String>) -> Self {
        Self {
            success: true,
            messages,
            turn_elapsed: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: Vec::new(),
            turn_elapsed: false,
            error: Some(error.into()),
        }
    }
}

/// Environment state captured at the start of a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub turn: u64,
    pub position: Position,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub screen: String,
    #[serde(default)]
    pub inventory: Vec<String>,
}

impl EnvironmentSnapshot {
    /// Full state rendering shown to the planner for the newest turn.
    pub fn render(&self) -> String {
        let mut out = format!("Turn {} at {}\n", self.turn, self.position);
        if !self.status.is_empty() {
            out.push_str(&format!("Status: {}\n", self.status));
        }
        if !self.message.is_empty() {
            out.push_str(&format!("Message: {}\n", self.message));
        }
        if !self.screen.is_empty() {
            out.push_str("Screen:\n");
            out.push_str(self.screen.trim_end());
            out.push('\n');
        }
        if !self.inventory.is_empty() {
            out.push_str("Inventory:\n");
            for item in &self.inventory {
                out.push_str(&format!("  {item}\n"));
            }
        }
        out
    }
}

/// Side-effect free environment queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Position,
    Stats,
    Screen,
    Message,
    Inventory,
    VisibleMonsters,
    ItemsHere,
    Turn,
}

impl Query {
    pub const ALL: [Query; 8] = [
        Query::Position,
        Query::Stats,
        Query::Screen,
        Query::Message,
        Query::Inventory,
        Query::VisibleMonsters,
        Query::ItemsHere,
        Query::Turn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Query::Position => "position",
            Query::Stats => "stats",
            Query::Screen => "screen",
            Query::Message => "message",
            Query::Inventory => "inventory",
            Query::VisibleMonsters => "visible_monsters",
            Query::ItemsHere => "items_here",
            Query::Turn => "turn",
        }
    }
}

/// State-mutating environment actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Move(Direction),
    Attack(Direction),
    Kick(Direction),
    OpenDoor(Direction),
    Wait,
    Search,
    Pickup(Option<char>),
    Drop(char),
    Eat(Option<char>),
    Quaff(char),
    Read(char),
    Wear(char),
    Wield(char),
    GoUp,
    GoDown,
    Pray,
    Engrave(String),
    MoveTo(Position),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Move(_) => "move",
            Action::Attack(_) => "attack",
            Action::Kick(_) => "kick",
            Action::OpenDoor(_) => "open_door",
            Action::Wait => "wait",
            Action::Search => "search",
            Action::Pickup(_) => "pickup",
            Action::Drop(_) => "drop",
            Action::Eat(_) => "eat",
            Action::Quaff(_) => "quaff",
            Action::Read(_) => "read",
            Action::Wear(_) => "wear",
            Action::Wield(_) => "wield",
            Action::GoUp => "go_up",
            Action::GoDown => "go_down",
            Action::Pray => "pray",
            Action::Engrave(_) => "engrave",
            Action::MoveTo(_) => "move_to",
        }
    }

    /// Rendered arguments, as shown in call logs.
    pub fn arguments(&self) -> Vec<String> {
        match self {
            Action::Move(dir) | Action::Attack(dir) | Action::Kick(dir) | Action::OpenDoor(dir) => {
                vec![dir.to_string()]
            }
            Action::Pickup(item) | Action::Eat(item) => {
                item.map(|c| vec![format!("{c:?}")]).unwrap_or_default()
            }
            Action::Drop(item)
            | Action::Quaff(item)
            | Action::Read(item)
            | Action::Wear(item)
            | Action::Wield(item) => vec![format!("{item:?}")],
            Action::Engrave(text) => vec![format!("{text:?}")],
            Action::MoveTo(pos) => vec![pos.x.to_string(), pos.y.to_string()],
            Action::Wait | Action::Search | Action::GoUp | Action::GoDown | Action::Pray => {
                Vec::new()
            }
        }
    }
}

/// An error raised by the environment for a malformed or impossible request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityError {
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CapabilityError {}

/// The environment seen through the sandbox.
///
/// Calls are synchronous and never overlap within one run.
pub trait CapabilityApi {
    /// Capture the state shown to the planner at the start of a turn.
    fn snapshot(&mut self) -> EnvironmentSnapshot;

    /// Answer a side-effect free query.
    fn query(&mut self, query: Query) -> Result<Value, CapabilityError>;

    /// Perform an action. Unsuccessful actions are `Ok` with `success = false`;
    /// `Err` is reserved for requests the environment cannot interpret.
    fn perform(&mut self, action: &Action) -> Result<ActionResult, CapabilityError>;

    /// Whether the environment has reached a terminal state.
    fn is_finished(&self) -> bool {
        false
    }
}
