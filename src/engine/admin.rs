//! Deterministic admin handlers.
//!
//! Admin commands never reach the interpreter. Each handler reads the caller's
//! effective document and either renders text or emits ordinary
//! [`StateMutation`]s, which then go through the same merge validation as
//! interpreter output. Bad arguments produce a usage error and no operations.

use std::collections::HashMap;

use serde_json::Value;

use crate::engine::errors::EngineError;
use crate::engine::types::{split_path, MutationTarget, StateMutation, LOCATIONS_SECTION, PLAYER_SECTION};

/// What a handler wants the dispatcher to do.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    /// Apply these operations (possibly none) and show the narrative.
    Apply {
        narrative: String,
        mutations: Vec<StateMutation>,
    },
    /// Rebuild the caller's record from the template.
    ResetPlayer,
}

impl AdminAction {
    fn read_only(narrative: String) -> Self {
        AdminAction::Apply {
            narrative,
            mutations: Vec::new(),
        }
    }

    fn mutate(narrative: String, mutations: Vec<StateMutation>) -> Self {
        AdminAction::Apply { narrative, mutations }
    }
}

/// Inputs available to a handler.
pub struct AdminContext<'a> {
    pub player_id: &'a str,
    pub experience_id: &'a str,
    /// Effective document: the isolated view, or the shared world with the caller's overlay.
    pub document: &'a Value,
    pub args: &'a str,
}

pub type AdminHandler = fn(&AdminContext<'_>) -> Result<AdminAction, EngineError>;

/// Handler table keyed by primary command name.
pub struct AdminHandlers {
    handlers: HashMap<&'static str, AdminHandler>,
}

impl Default for AdminHandlers {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AdminHandlers {
    pub fn builtin() -> Self {
        let mut handlers: HashMap<&'static str, AdminHandler> = HashMap::new();
        handlers.insert("look", look);
        handlers.insert("inspect", look);
        handlers.insert("where", where_am_i);
        handlers.insert("create-item", create_item);
        handlers.insert("remove-item", remove_item);
        handlers.insert("give", give);
        handlers.insert("teleport", teleport);
        handlers.insert("set", set_value);
        handlers.insert("reset-player", reset_player);
        Self { handlers }
    }

    pub fn get(&self, name: &str) -> Option<AdminHandler> {
        self.handlers.get(name.to_lowercase().as_str()).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn usage(command: &str, usage: &str) -> EngineError {
    EngineError::execution_failed(
        &format!("@{}", command),
        format!("usage: @{} {}", command, usage),
    )
}

fn resolve<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    split_path(path).into_iter().try_fold(document, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
        _ => None,
    })
}

fn current_location(document: &Value) -> Option<&str> {
    document.get(PLAYER_SECTION)?.get("current_location")?.as_str()
}

fn location_exists(document: &Value, location: &str) -> bool {
    document
        .get(LOCATIONS_SECTION)
        .and_then(|locs| locs.get(location))
        .is_some()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn look(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let path = ctx.args.trim();
    let path = if path.is_empty() {
        match current_location(ctx.document) {
            Some(loc) => format!("{}.{}", LOCATIONS_SECTION, loc),
            None => PLAYER_SECTION.to_string(),
        }
    } else {
        path.to_string()
    };
    let value = resolve(ctx.document, &path).ok_or_else(|| {
        EngineError::execution_failed("@look", format!("nothing at {}", path))
    })?;
    Ok(AdminAction::read_only(format!("{}:\n{}", path, render(value))))
}

fn where_am_i(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let location = current_location(ctx.document).unwrap_or("<nowhere>");
    let exits = ctx
        .document
        .get(LOCATIONS_SECTION)
        .and_then(|locs| locs.get(location))
        .and_then(|loc| loc.get("exits"))
        .and_then(Value::as_object)
        .map(|exits| {
            exits
                .iter()
                .map(|(label, to)| format!("{} -> {}", label, render(to)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let exits = if exits.is_empty() {
        "none".to_string()
    } else {
        exits.join(", ")
    };
    Ok(AdminAction::read_only(format!(
        "{} is at {} (exits: {})",
        ctx.player_id, location, exits
    )))
}

fn location_and_item<'a>(args: &'a str, command: &str) -> Result<(&'a str, String), EngineError> {
    let mut parts = args.split_whitespace();
    let location = parts.next().ok_or_else(|| usage(command, "<location> <item...>"))?;
    let item = parts.collect::<Vec<_>>().join(" ");
    if item.is_empty() {
        return Err(usage(command, "<location> <item...>"));
    }
    Ok((location, item))
}

fn create_item(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let (location, item) = location_and_item(ctx.args, "create-item")?;
    let path = format!("{}.{}.items", LOCATIONS_SECTION, location);
    Ok(AdminAction::mutate(
        format!("Created {} at {}.", item, location),
        vec![StateMutation::append(MutationTarget::World, &path, Value::String(item))],
    ))
}

fn remove_item(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let (location, item) = location_and_item(ctx.args, "remove-item")?;
    let path = format!("{}.{}.items", LOCATIONS_SECTION, location);
    Ok(AdminAction::mutate(
        format!("Removed {} from {}.", item, location),
        vec![StateMutation::remove(MutationTarget::World, &path, Value::String(item))],
    ))
}

fn give(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let item = ctx.args.split_whitespace().collect::<Vec<_>>().join(" ");
    if item.is_empty() {
        return Err(usage("give", "<item...>"));
    }
    Ok(AdminAction::mutate(
        format!("Gave {} to {}.", item, ctx.player_id),
        vec![StateMutation::append(
            MutationTarget::Player,
            "player.inventory",
            Value::String(item),
        )],
    ))
}

fn teleport(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    let mut parts = ctx.args.split_whitespace();
    let (Some(location), None) = (parts.next(), parts.next()) else {
        return Err(usage("teleport", "<location>"));
    };
    if !location_exists(ctx.document, location) {
        return Err(EngineError::execution_failed(
            "@teleport",
            format!("no location named {} in {}", location, ctx.experience_id),
        ));
    }
    Ok(AdminAction::mutate(
        format!("Teleported to {}.", location),
        vec![StateMutation::set(
            MutationTarget::Player,
            "player.current_location",
            Value::String(location.to_string()),
        )],
    ))
}

fn set_value(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    const USAGE: &str = "<player|world> <path> <json>";
    let mut parts = ctx.args.trim().splitn(3, char::is_whitespace);
    let target = match parts.next().map(str::to_lowercase).as_deref() {
        Some("player") => MutationTarget::Player,
        Some("world") => MutationTarget::World,
        _ => return Err(usage("set", USAGE)),
    };
    let path = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| usage("set", USAGE))?;
    let raw = parts.next().map(str::trim).filter(|r| !r.is_empty()).ok_or_else(|| usage("set", USAGE))?;
    let payload = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(AdminAction::mutate(
        format!("Set {} {} = {}.", target_label(target), path, payload),
        vec![StateMutation::set(target, path, payload)],
    ))
}

fn target_label(target: MutationTarget) -> &'static str {
    match target {
        MutationTarget::Player => "player",
        MutationTarget::World => "world",
    }
}

fn reset_player(ctx: &AdminContext<'_>) -> Result<AdminAction, EngineError> {
    if !ctx.args.trim().is_empty() {
        return Err(usage("reset-player", ""));
    }
    Ok(AdminAction::ResetPlayer)
}
