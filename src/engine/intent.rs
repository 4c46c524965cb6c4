//! Intent Resolver: classifies a raw message before any state is touched.
//!
//! Order of checks, first match wins:
//! 1. experience selection ("play <experience>", "switch to <experience>")
//! 2. admin prefix (`@verb ...`)
//! 3. known player verb or alias, after dropping leading filler words
//! 4. unrecognized
//!
//! Selection only fires when the phrase names a configured experience, so
//! "play flute" still reaches a `play` verb if the experience has one.

use std::sync::Arc;

use serde_json::Value;

use crate::engine::registry::CommandSet;
use crate::engine::types::{CommandDefinition, ExperienceConfig};

/// Leading words dropped before verb matching.
const FILLER_WORDS: &[&str] = &[
    "please", "pls", "kindly", "can", "could", "would", "will", "you", "i", "i'd", "id", "want", "wanna",
    "like", "to", "let", "me", "lets", "let's", "just", "now", "the", "a", "an", "try",
];

/// Phrases that introduce an experience name.
const SELECTION_TRIGGERS: &[&str] = &["play", "switch to", "load experience", "open experience"];

/// Result of classifying one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    ExperienceSelect {
        experience_id: String,
    },
    AdminCommand {
        command: Arc<CommandDefinition>,
        verb: String,
        args: String,
    },
    PlayerCommand {
        command: Arc<CommandDefinition>,
        verb: String,
        args: String,
    },
    Unrecognized {
        token: Option<String>,
        admin_prefixed: bool,
    },
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::ExperienceSelect { .. } => "experience_select",
            Intent::AdminCommand { .. } => "admin_command",
            Intent::PlayerCommand { .. } => "player_command",
            Intent::Unrecognized { .. } => "unrecognized",
        }
    }
}

/// Stateless per-message classifier.
#[derive(Debug, Clone)]
pub struct IntentResolver {
    admin_prefix: String,
}

impl Default for IntentResolver {
    fn default() -> Self {
        Self::new("@")
    }
}

impl IntentResolver {
    pub fn new(admin_prefix: &str) -> Self {
        Self {
            admin_prefix: admin_prefix.to_string(),
        }
    }

    pub fn admin_prefix(&self) -> &str {
        &self.admin_prefix
    }

    pub fn classify(
        &self,
        message: &str,
        experiences: &[Arc<ExperienceConfig>],
        commands: Option<&CommandSet>,
    ) -> Intent {
        if let Some(experience_id) = detect_experience_selection(message, experiences) {
            return Intent::ExperienceSelect { experience_id };
        }

        let trimmed = message.trim();
        if !self.admin_prefix.is_empty() {
            if let Some(rest) = trimmed.strip_prefix(self.admin_prefix.as_str()) {
                let words = tokenize(rest);
                return match commands.and_then(|set| match_verb(set, &words, true)) {
                    Some((command, verb, args)) => Intent::AdminCommand { command, verb, args },
                    None => Intent::Unrecognized {
                        token: words.first().cloned(),
                        admin_prefixed: true,
                    },
                };
            }
        }

        let words = tokenize(trimmed);
        let start = words
            .iter()
            .position(|w| !FILLER_WORDS.contains(&w.as_str()))
            .unwrap_or(words.len());
        let stripped = &words[start..];
        // Fall back to the unstripped words so short aliases like "i" still match.
        let matched = commands.and_then(|set| {
            match_verb(set, stripped, false).or_else(|| match_verb(set, &words, false))
        });
        match matched {
            Some((command, verb, args)) => Intent::PlayerCommand { command, verb, args },
            None => Intent::Unrecognized {
                token: stripped.first().or(words.first()).cloned(),
                admin_prefixed: false,
            },
        }
    }
}

/// Lowercased words with surrounding punctuation stripped.
fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| matches!(c, ',' | '.' | '!' | '?' | ';' | ':' | '"'))
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Longest registered phrase at the start of `words`.
fn match_verb(
    set: &CommandSet,
    words: &[String],
    admin_prefixed: bool,
) -> Option<(Arc<CommandDefinition>, String, String)> {
    let longest = set.max_phrase_words().min(words.len());
    (1..=longest).rev().find_map(|n| {
        let phrase = words[..n].join(" ");
        set.resolve(&phrase, admin_prefixed)
            .map(|cmd| (cmd, phrase, words[n..].join(" ")))
    })
}

/// Find an explicit "play <experience>" style phrase naming a configured experience.
pub fn detect_experience_selection(message: &str, experiences: &[Arc<ExperienceConfig>]) -> Option<String> {
    let words = tokenize(message);
    for trigger in SELECTION_TRIGGERS {
        let trigger_words: Vec<&str> = trigger.split(' ').collect();
        for start in 0..words.len() {
            let end = start + trigger_words.len();
            if end > words.len() || words[start..end].iter().map(String::as_str).ne(trigger_words.iter().copied()) {
                continue;
            }
            // Try the longest candidate name first so "play wylding woods please" works.
            let rest = &words[end..];
            for len in (1..=rest.len()).rev() {
                let candidate = rest[..len].join(" ");
                if let Some(cfg) = experiences.iter().find(|cfg| cfg.matches_name(&candidate)) {
                    return Some(cfg.id.clone());
                }
            }
        }
    }
    None
}

/// Player commands usable at the given location, for "didn't understand" replies.
///
/// A command needing a location is hidden when the player has none; a location that
/// lists `available_commands` restricts the menu to those names.
pub fn commands_valid_here(set: &CommandSet, location: Option<&Value>, has_location: bool, is_admin: bool) -> Vec<String> {
    let allowed: Option<Vec<String>> = location
        .and_then(|loc| loc.get("available_commands"))
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(|n| n.to_lowercase())
                .collect()
        });
    let mut verbs: Vec<String> = set
        .player_commands()
        .filter(|cmd| !cmd.requires_location || has_location)
        .filter(|cmd| !cmd.requires_admin || is_admin)
        .filter(|cmd| {
            allowed
                .as_ref()
                .map_or(true, |names| names.contains(&cmd.name.to_lowercase()))
        })
        .map(|cmd| cmd.name.clone())
        .collect();
    verbs.sort();
    verbs
}
