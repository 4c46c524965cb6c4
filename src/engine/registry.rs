//! Command Registry: discovers markdown command definitions and resolves verbs.
//!
//! A command file looks like:
//!
//! ```text
//! ---
//! command: take
//! aliases: [get, grab, pick up]
//! description: Pick up an item at your location
//! requires_location: true
//! requires_target: true
//! ---
//! # Take
//! Instructions for the interpreter...
//! ```
//!
//! `game-logic/` holds player commands, `admin-logic/` holds admin commands.
//! A file that fails to parse is skipped with a warning; it never aborts discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::engine::errors::EngineError;
use crate::engine::types::{display_path, normalize_phrase, CommandDefinition, CommandScope, ExperienceConfig};

/// Shared, immutable view of one experience's commands.
pub type RegistryHandle = Arc<CommandSet>;

#[derive(Debug, Deserialize)]
struct Frontmatter {
    command: Option<String>,
    aliases: Option<Vec<String>>,
    description: Option<String>,
    #[serde(default)]
    requires_location: bool,
    #[serde(default)]
    requires_target: bool,
    #[serde(default)]
    requires_admin: bool,
}

/// A file that discovery skipped, kept so operators can see why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Default)]
struct ScopeIndex {
    names: HashMap<String, usize>,
    aliases: HashMap<String, usize>,
}

impl ScopeIndex {
    fn lookup(&self, token: &str) -> Option<usize> {
        self.names
            .get(token)
            .or_else(|| self.aliases.get(token))
            .copied()
    }
}

/// Index from verb or alias to command definition for a single experience.
#[derive(Debug)]
pub struct CommandSet {
    experience_id: String,
    commands: Vec<Arc<CommandDefinition>>,
    player: ScopeIndex,
    admin: ScopeIndex,
    skipped: Vec<SkippedFile>,
    fingerprint: String,
}

impl CommandSet {
    fn build(experience_id: &str, definitions: Vec<CommandDefinition>, mut skipped: Vec<SkippedFile>, fingerprint: String) -> Self {
        let mut set = Self {
            experience_id: experience_id.to_string(),
            commands: Vec::new(),
            player: ScopeIndex::default(),
            admin: ScopeIndex::default(),
            skipped: Vec::new(),
            fingerprint,
        };

        for def in definitions {
            let idx = set.commands.len();
            let index = match def.scope {
                CommandScope::Player => &mut set.player,
                CommandScope::Admin => &mut set.admin,
            };
            let name = normalize_phrase(&def.name);
            if index.names.contains_key(&name) {
                warn!(
                    "Duplicate {:?} command '{}' in {} for '{}'; keeping the first definition",
                    def.scope,
                    name,
                    def.source_name(),
                    experience_id
                );
                skipped.push(SkippedFile {
                    file: def.source_name(),
                    reason: format!("duplicate command name '{}'", name),
                });
                continue;
            }
            index.names.insert(name, idx);
            for alias in def.aliases.iter().map(|a| normalize_phrase(a)) {
                if alias.is_empty() {
                    continue;
                }
                if index.aliases.contains_key(&alias) {
                    debug!("Alias '{}' already claimed in '{}'; ignoring from {}", alias, experience_id, def.source_name());
                    continue;
                }
                index.aliases.insert(alias, idx);
            }
            set.commands.push(Arc::new(def));
        }
        set.skipped = skipped;
        set
    }

    pub fn experience_id(&self) -> &str {
        &self.experience_id
    }

    /// Resolve a verb or alias. Admin commands are only reachable with the admin prefix,
    /// so a token shared by an admin and a player command goes to the admin command
    /// exactly when `admin_prefixed` is set.
    pub fn resolve(&self, token: &str, admin_prefixed: bool) -> Option<Arc<CommandDefinition>> {
        let token = normalize_phrase(token);
        let index = if admin_prefixed { &self.admin } else { &self.player };
        index.lookup(&token).map(|idx| self.commands[idx].clone())
    }

    pub fn commands(&self) -> &[Arc<CommandDefinition>] {
        &self.commands
    }

    pub fn player_commands(&self) -> impl Iterator<Item = &Arc<CommandDefinition>> {
        self.commands.iter().filter(|c| c.scope == CommandScope::Player)
    }

    pub fn admin_commands(&self) -> impl Iterator<Item = &Arc<CommandDefinition>> {
        self.commands.iter().filter(|c| c.scope == CommandScope::Admin)
    }

    /// Longest phrase (in words) registered in either scope.
    pub fn max_phrase_words(&self) -> usize {
        self.player
            .names
            .keys()
            .chain(self.player.aliases.keys())
            .chain(self.admin.names.keys())
            .chain(self.admin.aliases.keys())
            .map(|k| k.split_whitespace().count())
            .max()
            .unwrap_or(1)
    }

    pub fn skipped(&self) -> &[SkippedFile] {
        &self.skipped
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Holds the current [`CommandSet`] for every discovered experience.
#[derive(Default)]
pub struct CommandRegistry {
    sets: RwLock<HashMap<String, RegistryHandle>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan the experience's command directories and atomically replace its cached set.
    /// Readers holding the previous handle keep using it until they ask again.
    pub fn discover(&self, cfg: &ExperienceConfig) -> Result<RegistryHandle, EngineError> {
        let mut definitions = Vec::new();
        let mut skipped = Vec::new();
        let mut hasher = Sha256::new();

        for (dir, scope) in [
            (cfg.game_logic_path(), CommandScope::Player),
            (cfg.admin_logic_path(), CommandScope::Admin),
        ] {
            for path in command_files(&dir)? {
                let text = match std::fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Skipping unreadable command file {}: {}", path.display(), e);
                        skipped.push(SkippedFile {
                            file: display_path(&path),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                hasher.update(display_path(&path).as_bytes());
                hasher.update(text.as_bytes());
                match parse_command_definition(&path, &text, scope) {
                    Ok(def) => definitions.push(def),
                    Err(EngineError::MalformedCommandDefinition { file, reason }) => {
                        warn!("Skipping malformed command definition {}: {}", file, reason);
                        skipped.push(SkippedFile { file, reason });
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        let fingerprint = format!("{:x}", hasher.finalize());
        let set = Arc::new(CommandSet::build(&cfg.id, definitions, skipped, fingerprint));
        info!(
            "Discovered {} command(s) for '{}' ({} player, {} admin, {} skipped)",
            set.commands.len(),
            cfg.id,
            set.player_commands().count(),
            set.admin_commands().count(),
            set.skipped.len()
        );

        let mut guard = self
            .sets
            .write()
            .map_err(|_| EngineError::Internal("command registry poisoned".into()))?;
        guard.insert(cfg.id.clone(), set.clone());
        Ok(set)
    }

    /// Current handle for an experience, if discovery has run.
    pub fn handle(&self, experience_id: &str) -> Option<RegistryHandle> {
        self.sets
            .read()
            .ok()
            .and_then(|guard| guard.get(experience_id).cloned())
    }

    /// Rediscover only when the command sources changed since the cached scan.
    pub fn refresh_if_changed(&self, cfg: &ExperienceConfig) -> Result<(RegistryHandle, bool), EngineError> {
        if let Some(current) = self.handle(&cfg.id) {
            if fingerprint_sources(cfg)? == current.fingerprint {
                return Ok((current, false));
            }
        }
        Ok((self.discover(cfg)?, true))
    }
}

/// `*.md` files in `dir`, sorted by name. A missing directory yields no files.
fn command_files(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    if !dir.is_dir() {
        debug!("Command directory {} not present", dir.display());
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("md")))
        .filter(|p| {
            p.file_name()
                .map(|n| !n.to_string_lossy().eq_ignore_ascii_case("README.md"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Hash of every command source for an experience, matching [`CommandSet::fingerprint`].
pub fn fingerprint_sources(cfg: &ExperienceConfig) -> Result<String, EngineError> {
    let mut hasher = Sha256::new();
    for dir in [cfg.game_logic_path(), cfg.admin_logic_path()] {
        for path in command_files(&dir)? {
            if let Ok(text) = std::fs::read_to_string(&path) {
                hasher.update(display_path(&path).as_bytes());
                hasher.update(text.as_bytes());
            }
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Split `---` delimited YAML frontmatter from the markdown body.
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start_matches('\u{feff}');
    let rest = text
        .strip_prefix("---\r\n")
        .or_else(|| text.strip_prefix("---\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

/// Parse one markdown command file.
pub fn parse_command_definition(path: &Path, text: &str, scope: CommandScope) -> Result<CommandDefinition, EngineError> {
    let malformed = |reason: String| EngineError::MalformedCommandDefinition {
        file: display_path(path),
        reason,
    };
    let (yaml, body) = split_frontmatter(text).ok_or_else(|| malformed("missing frontmatter block".into()))?;
    let front: Frontmatter = serde_yaml::from_str(yaml).map_err(|e| malformed(e.to_string()))?;

    let name = front
        .command
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| malformed("missing required field `command`".into()))?;
    let description = front
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .ok_or_else(|| malformed("missing required field `description`".into()))?;
    let aliases = front
        .aliases
        .ok_or_else(|| malformed("missing required field `aliases`".into()))?;
    if name.starts_with('@') {
        return Err(malformed("command names must not include the admin prefix".into()));
    }

    Ok(CommandDefinition {
        name,
        aliases: aliases
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        description,
        requires_location: front.requires_location,
        requires_target: front.requires_target,
        requires_admin: front.requires_admin || scope == CommandScope::Admin,
        scope,
        body: body.trim().to_string(),
        source: path.to_path_buf(),
    })
}
