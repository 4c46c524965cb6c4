use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};

pub const WORLD_SCHEMA_VERSION: u8 = 1;
pub const PLAYER_VIEW_SCHEMA_VERSION: u8 = 1;

/// Top-level document key holding player-owned fields.
pub const PLAYER_SECTION: &str = "player";
/// Top-level document key holding the location map.
pub const LOCATIONS_SECTION: &str = "locations";

pub const DEFAULT_GAME_LOGIC_DIR: &str = "game-logic";
pub const DEFAULT_ADMIN_LOGIC_DIR: &str = "admin-logic";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StateModel {
    /// One world record per experience, read and written by every player.
    Shared,
    /// Each player receives an independent clone of the world template.
    Isolated,
}

impl fmt::Display for StateModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateModel::Shared => write!(f, "shared"),
            StateModel::Isolated => write!(f, "isolated"),
        }
    }
}

fn default_game_logic_dir() -> String {
    DEFAULT_GAME_LOGIC_DIR.to_string()
}

fn default_admin_logic_dir() -> String {
    DEFAULT_ADMIN_LOGIC_DIR.to_string()
}

/// Static description of a deployed experience, read from `experience.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperienceConfig {
    pub id: String,
    pub name: String,
    pub state_model: StateModel,
    /// World template path, relative to the experience directory.
    pub template: String,
    #[serde(default = "default_game_logic_dir")]
    pub game_logic_dir: String,
    #[serde(default = "default_admin_logic_dir")]
    pub admin_logic_dir: String,
    /// Extra names accepted by experience selection ("play woods").
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Directory the config was loaded from. Filled in by the catalog.
    #[serde(skip)]
    pub root: PathBuf,
}

impl ExperienceConfig {
    pub fn new(id: &str, name: &str, state_model: StateModel, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            state_model,
            template: "world.json".to_string(),
            game_logic_dir: default_game_logic_dir(),
            admin_logic_dir: default_admin_logic_dir(),
            aliases: Vec::new(),
            root: root.into(),
        }
    }

    pub fn template_path(&self) -> PathBuf {
        self.root.join(&self.template)
    }

    pub fn game_logic_path(&self) -> PathBuf {
        self.root.join(&self.game_logic_dir)
    }

    pub fn admin_logic_path(&self) -> PathBuf {
        self.root.join(&self.admin_logic_dir)
    }

    /// True when `name` refers to this experience by id, display name or alias.
    pub fn matches_name(&self, name: &str) -> bool {
        let wanted = normalize_phrase(name);
        if wanted.is_empty() {
            return false;
        }
        normalize_phrase(&self.id) == wanted
            || normalize_phrase(&self.name) == wanted
            || self.aliases.iter().any(|a| normalize_phrase(a) == wanted)
    }
}

/// Lowercase, treat `-`/`_` as spaces, collapse whitespace.
pub fn normalize_phrase(text: &str) -> String {
    text.to_lowercase()
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Shared world record: one per `shared`-model experience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    pub experience_id: String,
    pub document: Value,
    /// Incremented on every committed write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl WorldState {
    pub fn from_template(experience_id: &str, template: &Value) -> Self {
        let now = Utc::now();
        let mut document = template.clone();
        // Player defaults belong to overlays, not to the shared record.
        if let Some(map) = document.as_object_mut() {
            map.remove(PLAYER_SECTION);
        }
        Self {
            experience_id: experience_id.to_string(),
            document,
            revision: 0,
            created_at: now,
            updated_at: now,
            schema_version: WORLD_SCHEMA_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Per-(player, experience) record. A full world clone in isolated mode,
/// only the player section in shared mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerView {
    pub player_id: String,
    pub experience_id: String,
    pub state_model: StateModel,
    pub document: Value,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u8,
}

impl PlayerView {
    pub fn new(player_id: &str, experience_id: &str, state_model: StateModel, document: Value) -> Self {
        let now = Utc::now();
        Self {
            player_id: player_id.to_string(),
            experience_id: experience_id.to_string(),
            state_model,
            document,
            revision: 0,
            created_at: now,
            updated_at: now,
            schema_version: PLAYER_VIEW_SCHEMA_VERSION,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn player_section(&self) -> Option<&Value> {
        self.document.get(PLAYER_SECTION)
    }

    pub fn current_location(&self) -> Option<&str> {
        self.player_section()?.get("current_location")?.as_str()
    }

    pub fn inventory(&self) -> Vec<Value> {
        self.player_section()
            .and_then(|p| p.get("inventory"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

/// The document a player actually sees: their view in isolated mode, the shared
/// world with their overlay's player section laid over it in shared mode.
pub fn effective_document(view: &PlayerView, world: Option<&WorldState>) -> Value {
    let Some(world) = world else {
        return view.document.clone();
    };
    let mut document = world.document.clone();
    if let (Some(map), Some(section)) = (document.as_object_mut(), view.player_section()) {
        map.insert(PLAYER_SECTION.to_string(), section.clone());
    }
    document
}

/// Build the player-owned section every new record starts with.
pub fn initial_player_section(template: &Value) -> Value {
    let defaults = template.get(PLAYER_SECTION);
    let location = defaults
        .and_then(|p| p.get("current_location"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            template
                .get("starting_location")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .or_else(|| {
            template
                .get(LOCATIONS_SECTION)
                .and_then(Value::as_object)
                .and_then(|locs| locs.keys().min().cloned())
        });
    let inventory = defaults
        .and_then(|p| p.get("inventory"))
        .filter(|v| v.is_array())
        .cloned()
        .unwrap_or_else(|| json!([]));
    let visited = match &location {
        Some(id) => json!([id]),
        None => json!([]),
    };
    json!({
        "current_location": location,
        "inventory": inventory,
        "visited": visited,
    })
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationTarget {
    Player,
    World,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Append,
    Remove,
    Set,
}

/// One change to durable state, as proposed by the interpreter or an admin handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateMutation {
    pub target: MutationTarget,
    pub path: String,
    pub operation: MutationKind,
    #[serde(default)]
    pub payload: Value,
}

impl StateMutation {
    pub fn append(target: MutationTarget, path: &str, payload: Value) -> Self {
        Self {
            target,
            path: path.to_string(),
            operation: MutationKind::Append,
            payload,
        }
    }

    pub fn remove(target: MutationTarget, path: &str, payload: Value) -> Self {
        Self {
            target,
            path: path.to_string(),
            operation: MutationKind::Remove,
            payload,
        }
    }

    pub fn set(target: MutationTarget, path: &str, payload: Value) -> Self {
        Self {
            target,
            path: path.to_string(),
            operation: MutationKind::Set,
            payload,
        }
    }

    pub fn segments(&self) -> Vec<&str> {
        split_path(&self.path)
    }
}

impl fmt::Display for StateMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} {} {}",
            self.target, self.operation, self.path, self.payload
        )
    }
}

pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').map(str::trim).collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandScope {
    /// Interpreted from `game-logic/` markdown.
    Player,
    /// Deterministic handler documented in `admin-logic/`.
    Admin,
}

/// A command parsed from a markdown file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    pub requires_location: bool,
    pub requires_target: bool,
    pub requires_admin: bool,
    pub scope: CommandScope,
    /// Markdown after the frontmatter; interpreter instructions.
    pub body: String,
    pub source: PathBuf,
}

impl CommandDefinition {
    /// Primary name followed by aliases, all lowercased.
    pub fn tokens(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .map(|t| normalize_phrase(t))
            .filter(|t| !t.is_empty())
    }

    pub fn is_admin(&self) -> bool {
        self.scope == CommandScope::Admin || self.requires_admin
    }

    pub fn source_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| display_path(&self.source))
    }
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Structured error attached to a [`MessageResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub detail: String,
}

/// Result of `handle_message`, returned to the upstream chat layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub narrative: String,
    pub available_actions: Vec<String>,
    /// May differ from the input when an experience selection occurred.
    pub experience_id: Option<String>,
    pub error: Option<ErrorInfo>,
}

impl MessageResponse {
    pub fn ok(narrative: impl Into<String>, actions: Vec<String>, experience_id: Option<String>) -> Self {
        Self {
            narrative: narrative.into(),
            available_actions: actions,
            experience_id,
            error: None,
        }
    }

    pub fn failed(
        narrative: impl Into<String>,
        kind: &str,
        detail: impl Into<String>,
        experience_id: Option<String>,
    ) -> Self {
        Self {
            narrative: narrative.into(),
            available_actions: Vec::new(),
            experience_id,
            error: Some(ErrorInfo {
                kind: kind.to_string(),
                detail: detail.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
